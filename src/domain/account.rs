//! Account Ledger (C11): balance/available/frozen/used margin and P/L.
//! Grounded on `original_source/include/app/account_manager.hpp`; every
//! method here maps 1:1 to one of that header's documented operations.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub balance: f64,
    pub available: f64,
    pub frozen_margin: f64,
    pub used_margin: f64,
    pub position_profit: f64,
    pub close_profit: f64,
}

impl Account {
    fn new(account_id: String, initial_balance: f64) -> Self {
        Self {
            account_id,
            balance: initial_balance,
            available: initial_balance,
            frozen_margin: 0.0,
            used_margin: 0.0,
            position_profit: 0.0,
            close_profit: 0.0,
        }
    }

    /// `available + frozen + used` should equal `balance + positionProfit`
    /// within rounding — the invariant every ledger mutation must preserve.
    pub fn balance_invariant_holds(&self) -> bool {
        let lhs = self.available + self.frozen_margin + self.used_margin;
        let rhs = self.balance + self.position_profit;
        (lhs - rhs).abs() < 1e-6
    }
}

/// One mutex per account map (not per-row): fine-grained enough that
/// ordinary per-account traffic sees no real contention.
#[derive(Default)]
pub struct AccountLedger {
    accounts: Mutex<HashMap<String, Account>>,
}

impl AccountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit creation path; ledger operations never auto-create an
    /// account.
    pub fn get_or_create_account(&self, account_id: &str, initial_balance: f64) -> Account {
        let mut guard = self.accounts.lock();
        guard
            .entry(account_id.to_string())
            .or_insert_with(|| Account::new(account_id.to_string(), initial_balance))
            .clone()
    }

    pub fn get_account(&self, account_id: &str) -> Option<Account> {
        self.accounts.lock().get(account_id).cloned()
    }

    pub fn freeze_margin(&self, account_id: &str, amount: f64) -> bool {
        let mut guard = self.accounts.lock();
        match guard.get_mut(account_id) {
            Some(acc) if amount <= acc.available => {
                acc.available -= amount;
                acc.frozen_margin += amount;
                true
            }
            _ => false,
        }
    }

    pub fn unfreeze_margin(&self, account_id: &str, amount: f64) -> bool {
        let mut guard = self.accounts.lock();
        match guard.get_mut(account_id) {
            Some(acc) => {
                let clamped = amount.min(acc.frozen_margin);
                acc.frozen_margin -= clamped;
                acc.available += clamped;
                true
            }
            None => false,
        }
    }

    /// On fill: frozen -> used, with the "extra frozen" refund for
    /// partial fills at better-than-expected prices.
    pub fn confirm_margin(&self, account_id: &str, frozen: f64, used: f64) -> bool {
        let mut guard = self.accounts.lock();
        match guard.get_mut(account_id) {
            Some(acc) => {
                acc.frozen_margin -= frozen;
                acc.used_margin += used;
                acc.available += frozen - used;
                true
            }
            None => false,
        }
    }

    pub fn release_margin(&self, account_id: &str, amount: f64) -> bool {
        let mut guard = self.accounts.lock();
        match guard.get_mut(account_id) {
            Some(acc) => {
                acc.used_margin -= amount;
                acc.available += amount;
                true
            }
            None => false,
        }
    }

    /// Sets `positionProfit` to an absolute value (not a delta);
    /// `available` tracks the delta so the balance invariant holds.
    pub fn update_position_profit(&self, account_id: &str, new_total: f64) -> bool {
        let mut guard = self.accounts.lock();
        match guard.get_mut(account_id) {
            Some(acc) => {
                let delta = new_total - acc.position_profit;
                acc.position_profit = new_total;
                acc.available += delta;
                true
            }
            None => false,
        }
    }

    pub fn add_close_profit(&self, account_id: &str, amount: f64) -> bool {
        let mut guard = self.accounts.lock();
        match guard.get_mut(account_id) {
            Some(acc) => {
                acc.balance += amount;
                acc.close_profit += amount;
                acc.available += amount;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_then_unfreeze_is_a_no_op() {
        let ledger = AccountLedger::new();
        ledger.get_or_create_account("A1", 1_000_000.0);
        ledger.freeze_margin("A1", 500.0);
        ledger.unfreeze_margin("A1", 500.0);
        let acc = ledger.get_account("A1").unwrap();
        assert_eq!(acc.available, 1_000_000.0);
        assert_eq!(acc.frozen_margin, 0.0);
        assert!(acc.balance_invariant_holds());
    }

    #[test]
    fn freeze_requires_sufficient_available() {
        let ledger = AccountLedger::new();
        ledger.get_or_create_account("A1", 100.0);
        assert!(!ledger.freeze_margin("A1", 200.0));
    }

    #[test]
    fn confirm_margin_refunds_excess_freeze() {
        let ledger = AccountLedger::new();
        ledger.get_or_create_account("A1", 1000.0);
        ledger.freeze_margin("A1", 100.0);
        ledger.confirm_margin("A1", 100.0, 80.0);
        let acc = ledger.get_account("A1").unwrap();
        assert_eq!(acc.used_margin, 80.0);
        assert_eq!(acc.frozen_margin, 0.0);
        assert_eq!(acc.available, 920.0);
        assert!(acc.balance_invariant_holds());
    }

    #[test]
    fn missing_account_fails_without_auto_create() {
        let ledger = AccountLedger::new();
        assert!(!ledger.freeze_margin("ghost", 10.0));
        assert!(ledger.get_account("ghost").is_none());
    }

    #[test]
    fn invariant_holds_through_full_lifecycle() {
        let ledger = AccountLedger::new();
        ledger.get_or_create_account("A1", 1_000_000.0);
        ledger.freeze_margin("A1", 20.0);
        ledger.confirm_margin("A1", 20.0, 20.0);
        ledger.update_position_profit("A1", 15.0);
        ledger.release_margin("A1", 20.0);
        ledger.add_close_profit("A1", 30.0);
        let acc = ledger.get_account("A1").unwrap();
        assert!(acc.balance_invariant_holds());
    }
}
