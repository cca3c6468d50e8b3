// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-user payment gate: at most one payment in flight per user, and a
//! cooldown between two completed payments.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{CustodyError, CustodyResult};

pub struct PayGate {
    lock: Arc<AsyncMutex<()>>,
    last_pay: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl PayGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            lock: Arc::new(AsyncMutex::new(())),
            last_pay: Mutex::new(None),
            cooldown,
        }
    }

    /// Take the gate.
    ///
    /// Refuses immediately while the cooldown of the previous payment is
    /// running; otherwise waits for the in-flight payment to finish.
    pub async fn acquire(self: &Arc<Self>) -> CustodyResult<PayPermit> {
        self.check_cooldown()?;
        let guard = self.lock.clone().lock_owned().await;
        // The payment we waited for may have just started a cooldown.
        self.check_cooldown()?;
        Ok(PayPermit {
            gate: self.clone(),
            dispatched: false,
            _guard: guard,
        })
    }

    /// Neither held nor cooling down.
    pub fn is_idle(&self) -> bool {
        self.lock.try_lock().is_ok() && self.remaining_cooldown().is_zero()
    }

    fn remaining_cooldown(&self) -> Duration {
        let last = self.last_pay.lock().ok().and_then(|guard| *guard);
        match last {
            Some(at) => self.cooldown.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn check_cooldown(&self) -> CustodyResult<()> {
        let remaining = self.remaining_cooldown();
        if remaining.is_zero() {
            Ok(())
        } else {
            Err(CustodyError::PaymentBusy {
                retry_after_secs: remaining.as_secs().max(1),
            })
        }
    }

    fn stamp(&self) {
        if let Ok(mut last) = self.last_pay.lock() {
            *last = Some(Instant::now());
        }
    }
}

/// Exclusive right to pay on behalf of one user.
///
/// Dropping the permit releases the gate. When a mission was dispatched
/// under the permit, the drop also starts the cooldown.
pub struct PayPermit {
    gate: Arc<PayGate>,
    dispatched: bool,
    _guard: OwnedMutexGuard<()>,
}

impl PayPermit {
    /// Record that a mission was started under this permit.
    pub fn mark_dispatched(&mut self) {
        self.dispatched = true;
    }
}

impl Drop for PayPermit {
    fn drop(&mut self) {
        if self.dispatched {
            self.gate.stamp();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_payment_waits_for_the_first() {
        let gate = Arc::new(PayGate::new(Duration::ZERO));
        let permit = gate.acquire().await.unwrap();
        assert!(!gate.is_idle());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.unwrap().unwrap();
        assert!(gate.is_idle());
    }

    #[tokio::test]
    async fn cooldown_refuses_immediately_after_dispatch() {
        let gate = Arc::new(PayGate::new(Duration::from_secs(20)));
        let mut permit = gate.acquire().await.unwrap();
        permit.mark_dispatched();
        drop(permit);

        match gate.acquire().await {
            Err(CustodyError::PaymentBusy { retry_after_secs }) => {
                assert!(retry_after_secs > 0 && retry_after_secs <= 20)
            }
            other => panic!("expected PaymentBusy, got {:?}", other.map(|_| ())),
        }
        assert!(!gate.is_idle());
    }

    #[tokio::test]
    async fn undispatched_permit_leaves_no_cooldown() {
        let gate = Arc::new(PayGate::new(Duration::from_secs(20)));
        drop(gate.acquire().await.unwrap());
        assert!(gate.acquire().await.is_ok());
    }
}
