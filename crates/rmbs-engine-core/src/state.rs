//! Deal State (C4): the mutable ledger of a running simulation
//! (spec.md §3 `DealState`, §4.3).

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::definition::DealDefinition;
use crate::error::{EngineError, EngineResult};
use crate::expr::{EvalContext, MissingPolicy};
use crate::types::{Money, Value};

/// Informational messages a caller may want surfaced without aborting the
/// run (spec.md §7: non-convergence, overdraft-within-tolerance, overpay
/// clamps). `DealState` accumulates these; nothing reads them internally.
#[derive(Debug, Clone, Serialize)]
pub enum Diagnostic {
    OverpaidBond {
        bond_id: String,
        balance: Money,
        attempted: Money,
    },
    ResidualLossDropped {
        period: u32,
        amount: Money,
    },
    SolverNonConverged {
        period: u32,
        iterations: u32,
        max_delta: Money,
    },
}

/// Per-bond dynamic state (spec.md §3 `BondState`).
#[derive(Debug, Clone, Serialize)]
pub struct BondState {
    pub original_balance: Money,
    pub current_balance: Money,
    pub deferred_balance: Money,
    pub interest_shortfall_cumulative: Money,
    /// Cumulative principal paid, tracked for reporting (`prin_paid`).
    pub principal_paid_cumulative: Money,
}

impl BondState {
    fn new(original_balance: Money) -> Self {
        BondState {
            original_balance,
            current_balance: original_balance,
            deferred_balance: Decimal::ZERO,
            interest_shortfall_cumulative: Decimal::ZERO,
            principal_paid_cumulative: Decimal::ZERO,
        }
    }

    /// `current_balance / original_balance`, 0 when original is 0
    /// (spec.md §3).
    pub fn factor(&self) -> Decimal {
        if self.original_balance.is_zero() {
            Decimal::ZERO
        } else {
            self.current_balance / self.original_balance
        }
    }
}

/// Per-trigger hysteresis state (spec.md §4.4's CLEAN/BREACHED/CURING(k)
/// state machine).
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct TriggerState {
    pub is_breached: bool,
    pub months_breached: u32,
    pub months_cured: u32,
}

impl Default for TriggerState {
    fn default() -> Self {
        TriggerState {
            is_breached: false,
            months_breached: 0,
            months_cured: 0,
        }
    }
}

/// Immutable, append-only record of the deal at the end of a period
/// (spec.md §3 `PeriodSnapshot`).
#[derive(Debug, Clone, Serialize)]
pub struct PeriodSnapshot {
    pub period: u32,
    pub date: chrono::NaiveDate,
    pub funds: HashMap<String, Money>,
    pub ledgers: HashMap<String, Money>,
    pub bond_balances: HashMap<String, Money>,
    pub variables: HashMap<String, Value>,
    pub flags: HashMap<String, bool>,
}

/// Absolute tolerance for overdraft/shortfall float-noise checks
/// (spec.md §4.3, §5: 1e-5).
pub const OVERDRAFT_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 5);

/// The mutable simulation state. Owned exclusively by one simulation
/// (spec.md §5: "No shared mutation").
#[derive(Debug, Clone)]
pub struct DealState {
    pub period_index: u32,
    pub current_date: chrono::NaiveDate,
    pub cash_balances: HashMap<String, Money>,
    pub ledgers: HashMap<String, Money>,
    pub bonds: HashMap<String, BondState>,
    pub variables: HashMap<String, Value>,
    pub flags: HashMap<String, bool>,
    pub trigger_states: HashMap<String, TriggerState>,
    pub history: Vec<PeriodSnapshot>,
    pub diagnostics: Vec<Diagnostic>,
    overdraft_epsilon: Decimal,
    funds_missing_policy: MissingPolicy,
    bonds_missing_policy: MissingPolicy,
    collateral_current_balance: Money,
    collateral_original_balance: Money,
    collateral_wac: Decimal,
}

impl DealState {
    /// Constructs state at t=0: all bonds at original balance, all
    /// funds/ledgers at 0, empty history (spec.md §3 Lifecycle).
    pub fn new(def: &DealDefinition, overdraft_epsilon: Decimal) -> Self {
        let mut cash_balances = HashMap::new();
        for fund_id in def.funds.keys() {
            cash_balances.insert(fund_id.clone(), Decimal::ZERO);
        }

        let mut bonds = HashMap::new();
        for (id, bond_def) in &def.bonds {
            bonds.insert(id.clone(), BondState::new(bond_def.original_balance));
        }

        let mut ledgers = HashMap::new();
        for ledger_id in &def.ledgers {
            ledgers.insert(ledger_id.clone(), Decimal::ZERO);
        }

        DealState {
            period_index: 0,
            current_date: def.dates.closing_date,
            cash_balances,
            ledgers,
            bonds,
            variables: HashMap::new(),
            flags: HashMap::new(),
            trigger_states: HashMap::new(),
            history: Vec::new(),
            diagnostics: Vec::new(),
            overdraft_epsilon,
            funds_missing_policy: MissingPolicy::Zero,
            bonds_missing_policy: MissingPolicy::Zero,
            collateral_current_balance: def.collateral.current_balance,
            collateral_original_balance: def.collateral.original_balance,
            collateral_wac: def.collateral.wac,
        }
    }

    pub fn with_missing_policies(mut self, funds: MissingPolicy, bonds: MissingPolicy) -> Self {
        self.funds_missing_policy = funds;
        self.bonds_missing_policy = bonds;
        self
    }

    fn ensure_bucket(&self, bucket_id: &str) -> EngineResult<()> {
        if self.cash_balances.contains_key(bucket_id) {
            Ok(())
        } else {
            Err(EngineError::InvariantViolation(format!(
                "cash bucket '{bucket_id}' does not exist"
            )))
        }
    }

    pub fn deposit_funds(&mut self, bucket_id: &str, amount: Money) -> EngineResult<()> {
        if amount < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!(
                "cannot deposit negative amount {amount} into '{bucket_id}'"
            )));
        }
        self.ensure_bucket(bucket_id)?;
        *self.cash_balances.get_mut(bucket_id).unwrap() += amount;
        Ok(())
    }

    pub fn transfer_cash(&mut self, from_id: &str, to_id: &str, amount: Money) -> EngineResult<()> {
        if amount < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(
                "transfer amount must be non-negative".into(),
            ));
        }
        self.ensure_bucket(from_id)?;
        self.ensure_bucket(to_id)?;
        let available = self.cash_balances[from_id];
        if available < amount - self.overdraft_epsilon {
            return Err(EngineError::InvariantViolation(format!(
                "insufficient funds in '{from_id}': has {available}, tried to move {amount}"
            )));
        }
        *self.cash_balances.get_mut(from_id).unwrap() -= amount;
        *self.cash_balances.get_mut(to_id).unwrap() += amount;
        Ok(())
    }

    pub fn withdraw_cash(&mut self, bucket_id: &str, amount: Money) -> EngineResult<()> {
        if amount < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(
                "withdrawal amount must be non-negative".into(),
            ));
        }
        self.ensure_bucket(bucket_id)?;
        let available = self.cash_balances[bucket_id];
        if available < amount - self.overdraft_epsilon {
            return Err(EngineError::InvariantViolation(format!(
                "insufficient funds in '{bucket_id}' to withdraw {amount} (has {available})"
            )));
        }
        *self.cash_balances.get_mut(bucket_id).unwrap() -= amount;
        Ok(())
    }

    pub fn pay_bond_principal(
        &mut self,
        bond_id: &str,
        amount: Money,
        source_fund: &str,
    ) -> EngineResult<()> {
        self.withdraw_cash(source_fund, amount)?;
        let bond = self.bonds.get_mut(bond_id).ok_or_else(|| {
            EngineError::InvariantViolation(format!("bond '{bond_id}' does not exist"))
        })?;
        if amount > bond.current_balance + self.overdraft_epsilon {
            self.diagnostics.push(Diagnostic::OverpaidBond {
                bond_id: bond_id.to_string(),
                balance: bond.current_balance,
                attempted: amount,
            });
        }
        bond.current_balance = (bond.current_balance - amount).max(Decimal::ZERO);
        bond.principal_paid_cumulative += amount;
        Ok(())
    }

    pub fn write_down_bond(&mut self, bond_id: &str, amount: Money) -> EngineResult<Money> {
        let bond = self.bonds.get_mut(bond_id).ok_or_else(|| {
            EngineError::InvariantViolation(format!("bond '{bond_id}' does not exist"))
        })?;
        let written_down = amount.min(bond.current_balance);
        bond.current_balance -= written_down;
        Ok(written_down)
    }

    pub fn add_interest_shortfall(&mut self, bond_id: &str, amount: Money) -> EngineResult<()> {
        let bond = self.bonds.get_mut(bond_id).ok_or_else(|| {
            EngineError::InvariantViolation(format!("bond '{bond_id}' does not exist"))
        })?;
        bond.interest_shortfall_cumulative += amount;
        Ok(())
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).copied()
    }

    pub fn set_flag(&mut self, name: &str, value: bool) {
        self.flags.insert(name.to_string(), value);
    }

    pub fn set_ledger(&mut self, id: &str, value: Money) {
        self.ledgers.insert(id.to_string(), value);
    }

    pub fn add_to_ledger(&mut self, id: &str, delta: Money) {
        *self.ledgers.entry(id.to_string()).or_insert(Decimal::ZERO) += delta;
    }

    pub fn set_collateral(&mut self, current_balance: Money, original_balance: Money, wac: Decimal) {
        self.collateral_current_balance = current_balance;
        self.collateral_original_balance = original_balance;
        self.collateral_wac = wac;
    }

    /// Captures cash/ledger/bond/variable/flag maps by value and pushes
    /// onto history; subsequent mutation of the live state cannot affect
    /// the stored snapshot (spec.md §4.3 clone semantics).
    pub fn snapshot(&mut self, date: chrono::NaiveDate) {
        self.current_date = date;
        self.period_index += 1;
        let bond_balances = self
            .bonds
            .iter()
            .map(|(id, b)| (id.clone(), b.current_balance))
            .collect();
        self.history.push(PeriodSnapshot {
            period: self.period_index,
            date,
            funds: self.cash_balances.clone(),
            ledgers: self.ledgers.clone(),
            bond_balances,
            variables: self.variables.clone(),
            flags: self.flags.clone(),
        });
    }

    /// Checks the universal state invariants (spec.md §3): non-negative
    /// cash, non-negative bond balances, non-decreasing cumulative loss.
    pub fn check_invariants(&self, cumulative_loss_ledger: &str) -> EngineResult<()> {
        for (id, balance) in &self.cash_balances {
            if *balance < -self.overdraft_epsilon {
                return Err(EngineError::InvariantViolation(format!(
                    "cash bucket '{id}' went negative: {balance}"
                )));
            }
        }
        for (id, bond) in &self.bonds {
            if bond.current_balance < Decimal::ZERO {
                return Err(EngineError::InvariantViolation(format!(
                    "bond '{id}' balance went negative: {}",
                    bond.current_balance
                )));
            }
        }
        if let Some(prev_snapshot) = self.history.last() {
            let prev = prev_snapshot
                .ledgers
                .get(cumulative_loss_ledger)
                .copied()
                .unwrap_or_default();
            let current = self.ledgers.get(cumulative_loss_ledger).copied().unwrap_or_default();
            if current < prev {
                return Err(EngineError::InvariantViolation(format!(
                    "{cumulative_loss_ledger} decreased: {prev} -> {current}"
                )));
            }
        }
        Ok(())
    }
}

impl EvalContext for DealState {
    fn fund_balance(&self, id: &str) -> Option<Decimal> {
        self.cash_balances.get(id).copied()
    }

    fn bond_attr(&self, id: &str, attr: &str) -> Option<Decimal> {
        let bond = self.bonds.get(id)?;
        match attr {
            "balance" => Some(bond.current_balance),
            "factor" => Some(bond.factor()),
            "shortfall" => Some(bond.interest_shortfall_cumulative),
            "original" => Some(bond.original_balance),
            _ => None,
        }
    }

    fn ledger_value(&self, id: &str) -> Option<Decimal> {
        self.ledgers.get(id).copied()
    }

    fn test_failed(&self, id: &str) -> Option<bool> {
        self.trigger_states.get(id).map(|s| s.is_breached)
    }

    fn collateral_attr(&self, attr: &str) -> Option<Decimal> {
        match attr {
            "current_balance" => Some(self.collateral_current_balance),
            "original_balance" => Some(self.collateral_original_balance),
            "wac" => Some(self.collateral_wac),
            _ => None,
        }
    }

    fn variable(&self, name: &str) -> Option<Value> {
        self.get_variable(name)
    }

    fn funds_missing_policy(&self) -> MissingPolicy {
        self.funds_missing_policy
    }

    fn bonds_missing_policy(&self) -> MissingPolicy {
        self.bonds_missing_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_def() -> DealDefinition {
        crate::test_support::sample_deal_definition()
    }

    #[test]
    fn deposit_then_withdraw_round_trips() {
        let def = sample_def();
        let mut state = DealState::new(&def, OVERDRAFT_EPSILON);
        state.deposit_funds("IAF", dec!(100)).unwrap();
        state.withdraw_cash("IAF", dec!(40)).unwrap();
        assert_eq!(state.cash_balances["IAF"], dec!(60));
    }

    #[test]
    fn transfer_beyond_balance_is_invariant_violation() {
        let def = sample_def();
        let mut state = DealState::new(&def, OVERDRAFT_EPSILON);
        state.deposit_funds("IAF", dec!(400)).unwrap();
        let err = state.transfer_cash("IAF", "PAF", dec!(9999)).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert_eq!(state.cash_balances["IAF"], dec!(400));
    }

    #[test]
    fn pay_bond_principal_clamps_at_zero_and_flags_overpay() {
        let def = sample_def();
        let mut state = DealState::new(&def, OVERDRAFT_EPSILON);
        state.deposit_funds("PAF", dec!(2000)).unwrap();
        state.pay_bond_principal("A", dec!(2000), "PAF").unwrap();
        assert_eq!(state.bonds["A"].current_balance, Decimal::ZERO);
        assert!(matches!(
            state.diagnostics.last(),
            Some(Diagnostic::OverpaidBond { .. })
        ));
    }

    #[test]
    fn bond_factor_is_zero_when_original_is_zero() {
        let bond = BondState::new(Decimal::ZERO);
        assert_eq!(bond.factor(), Decimal::ZERO);
    }
}
