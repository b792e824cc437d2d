// src/core/budget.rs — Shared daily spend ledger
//
// Runs execute concurrently but draw from one daily ceiling. A projected
// call cost is reserved before dispatch and settled with the real cost (or
// released) afterwards, so two runs cannot both spend the last of the budget.

use chrono::{NaiveDate, Utc};
use std::sync::{Arc, Mutex};

use crate::infra::errors::ForgeError;

#[derive(Debug)]
struct LedgerState {
    day: NaiveDate,
    spent: f64,
    reserved: f64,
}

#[derive(Debug)]
pub struct DailyLedger {
    limit: f64,
    state: Mutex<LedgerState>,
}

impl DailyLedger {
    pub fn new(limit: f64) -> Arc<Self> {
        Self::with_spent(limit, 0.0)
    }

    /// Resume with what has already been spent today (e.g. from the store).
    pub fn with_spent(limit: f64, spent_today: f64) -> Arc<Self> {
        Arc::new(Self {
            limit,
            state: Mutex::new(LedgerState {
                day: Utc::now().date_naive(),
                spent: spent_today,
                reserved: 0.0,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let today = Utc::now().date_naive();
        if state.day != today {
            state.day = today;
            state.spent = 0.0;
        }
        state
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn spent(&self) -> f64 {
        self.lock().spent
    }

    pub fn remaining(&self) -> f64 {
        let state = self.lock();
        (self.limit - state.spent - state.reserved).max(0.0)
    }

    pub fn reserve(self: &Arc<Self>, amount: f64) -> Result<Reservation, ForgeError> {
        let mut state = self.lock();
        let available = self.limit - state.spent - state.reserved;
        if amount > available {
            return Err(ForgeError::BudgetExceeded {
                projected: amount,
                remaining: available.max(0.0),
            });
        }
        state.reserved += amount;
        Ok(Reservation {
            ledger: Arc::clone(self),
            amount,
            done: false,
        })
    }
}

/// Held while a call is in flight. Dropping it without settling releases it.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<DailyLedger>,
    amount: f64,
    done: bool,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn settle(mut self, actual: f64) {
        let mut state = self.ledger.lock();
        state.reserved = (state.reserved - self.amount).max(0.0);
        state.spent += actual;
        self.done = true;
    }

    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.done {
            let mut state = self.ledger.lock();
            state.reserved = (state.reserved - self.amount).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_settle() {
        let ledger = DailyLedger::new(1.0);
        let r = ledger.reserve(0.4).unwrap();
        assert!((ledger.remaining() - 0.6).abs() < 1e-9);
        r.settle(0.1);
        assert!((ledger.spent() - 0.1).abs() < 1e-9);
        assert!((ledger.remaining() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_outstanding_reservations_block_overspend() {
        let ledger = DailyLedger::new(1.0);
        let _a = ledger.reserve(0.7).unwrap();
        let err = ledger.reserve(0.5).unwrap_err();
        assert!(matches!(err, ForgeError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_drop_releases() {
        let ledger = DailyLedger::new(1.0);
        {
            let _r = ledger.reserve(0.9).unwrap();
        }
        assert!((ledger.remaining() - 1.0).abs() < 1e-9);
        ledger.reserve(0.9).unwrap().release();
        assert_eq!(ledger.spent(), 0.0);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_limit() {
        let ledger = DailyLedger::new(1.0);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.reserve(0.1).map(|r| r.settle(0.1)).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert!(granted <= 10);
        assert!(ledger.spent() <= 1.0 + 1e-9);
    }
}
