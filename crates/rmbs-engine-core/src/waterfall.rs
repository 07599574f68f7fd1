//! Waterfall Runner (C6): executes the interest and principal waterfalls
//! step by step, plus the optional iterative fixed-point solver for
//! circular dependencies (spec.md §4.5).

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::EngineConfig;
use crate::definition::{AmountRule, DealDefinition, Step, StepAction};
use crate::error::EngineResult;
use crate::state::{DealState, Diagnostic};
use crate::variables::evaluate_variables;

/// Minimum payment size worth actually moving cash for (spec.md §4.5 step 5).
const PAYMENT_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 5);
/// Minimum shortfall worth posting to a ledger (spec.md §4.5 step 6).
const SHORTFALL_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

pub fn run_interest_waterfall(def: &DealDefinition, state: &mut DealState) -> EngineResult<()> {
    run_steps(&def.waterfalls.interest, state)
}

pub fn run_principal_waterfall(def: &DealDefinition, state: &mut DealState) -> EngineResult<()> {
    run_steps(&def.waterfalls.principal, state)
}

fn run_steps(steps: &[Step], state: &mut DealState) -> EngineResult<()> {
    for step in steps {
        run_step(step, state)?;
    }
    Ok(())
}

/// Executes a single step. Shortfall bookkeeping runs even when the source
/// fund is empty (spec.md §4.5: "this is a deliberate requirement").
fn run_step(step: &Step, state: &mut DealState) -> EngineResult<()> {
    if !step.condition.eval_condition(state)? {
        return Ok(());
    }

    let available = state.fund_balance_or_zero(&step.from_fund);
    let target = match &step.amount_rule {
        AmountRule::All | AmountRule::Remaining => available,
        AmountRule::Expr(expr) => expr.eval(state)?.as_number(),
    };
    let target = target.max(Decimal::ZERO);
    let payment = available.min(target);

    if payment > PAYMENT_EPSILON {
        match step.action {
            StepAction::PayBondInterest | StepAction::PayFee => {
                state.withdraw_cash(&step.from_fund, payment)?;
            }
            StepAction::PayBondPrincipal => {
                let bond_id = step.group.as_deref().unwrap_or_default();
                state.pay_bond_principal(bond_id, payment, &step.from_fund)?;
            }
            StepAction::TransferFund => {
                let to = step.to.as_deref().unwrap_or_default();
                state.transfer_cash(&step.from_fund, to, payment)?;
            }
            StepAction::Deposit => {
                state.deposit_funds(step.to.as_deref().unwrap_or(&step.from_fund), payment)?;
            }
        }
    }

    if step.action == StepAction::PayBondInterest && target > payment {
        if let Some(bond_id) = &step.group {
            state.add_interest_shortfall(bond_id, target - payment)?;
        }
    }

    let shortfall = (target - payment).max(Decimal::ZERO);
    if shortfall > SHORTFALL_EPSILON {
        if let Some(ledger_id) = &step.unpaid_ledger_id {
            state.add_to_ledger(ledger_id, shortfall);
        }
    }

    Ok(())
}

/// A deep copy of the state slices the waterfall mutates, used by the
/// iterative solver to restore between passes (spec.md §4.5, §9
/// "Mutable-state-with-history" strategy applied to solver retries
/// instead of period snapshots).
struct WaterfallSnapshot {
    cash_balances: HashMap<String, Decimal>,
    bond_balances: HashMap<String, Decimal>,
    bond_shortfalls: HashMap<String, Decimal>,
    ledgers: HashMap<String, Decimal>,
}

impl WaterfallSnapshot {
    fn capture(state: &DealState) -> Self {
        WaterfallSnapshot {
            cash_balances: state.cash_balances.clone(),
            bond_balances: state
                .bonds
                .iter()
                .map(|(id, b)| (id.clone(), b.current_balance))
                .collect(),
            bond_shortfalls: state
                .bonds
                .iter()
                .map(|(id, b)| (id.clone(), b.interest_shortfall_cumulative))
                .collect(),
            ledgers: state.ledgers.clone(),
        }
    }

    fn restore(&self, state: &mut DealState) {
        state.cash_balances = self.cash_balances.clone();
        state.ledgers = self.ledgers.clone();
        for (id, balance) in &self.bond_balances {
            if let Some(bond) = state.bonds.get_mut(id) {
                bond.current_balance = *balance;
            }
        }
        for (id, shortfall) in &self.bond_shortfalls {
            if let Some(bond) = state.bonds.get_mut(id) {
                bond.interest_shortfall_cumulative = *shortfall;
            }
        }
    }

    /// Max absolute delta across cash buckets and bond balances between
    /// two passes (spec.md §4.5 convergence check).
    fn max_delta(&self, other: &WaterfallSnapshot) -> Decimal {
        let mut max = Decimal::ZERO;
        for (id, v) in &other.cash_balances {
            let prev = self.cash_balances.get(id).copied().unwrap_or_default();
            max = max.max((v - prev).abs());
        }
        for (id, v) in &other.bond_balances {
            let prev = self.bond_balances.get(id).copied().unwrap_or_default();
            max = max.max((v - prev).abs());
        }
        max
    }
}

/// Runs the interest then principal waterfall once, forward-pass only.
pub fn run_waterfalls_sequential(def: &DealDefinition, state: &mut DealState) -> EngineResult<()> {
    run_interest_waterfall(def, state)?;
    run_principal_waterfall(def, state)
}

/// Runs the interest/principal waterfalls to a fixed point by repeatedly
/// re-evaluating variables and re-running both waterfalls from the
/// pre-waterfall snapshot (spec.md §4.5 "Iterative solver").
pub fn run_waterfalls_iterative(
    def: &DealDefinition,
    state: &mut DealState,
    config: &EngineConfig,
) -> EngineResult<()> {
    let baseline = WaterfallSnapshot::capture(state);
    let mut prev = WaterfallSnapshot::capture(state);

    for iteration in 1..=config.max_iterations {
        baseline.restore(state);
        evaluate_variables(def, state)?;
        run_interest_waterfall(def, state)?;
        run_principal_waterfall(def, state)?;

        let current = WaterfallSnapshot::capture(state);
        let max_delta = prev.max_delta(&current);
        if max_delta <= config.convergence_tol {
            return Ok(());
        }
        prev = current;

        if iteration == config.max_iterations {
            state.diagnostics.push(Diagnostic::SolverNonConverged {
                period: state.period_index,
                iterations: iteration,
                max_delta,
            });
        }
    }
    Ok(())
}

impl DealState {
    fn fund_balance_or_zero(&self, id: &str) -> Decimal {
        self.cash_balances.get(id).copied().unwrap_or(dec!(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn scenario_one_senior_junior_no_losses() {
        let def = crate::test_support::sample_deal_definition();
        let mut state = DealState::new(&def, crate::state::OVERDRAFT_EPSILON);
        state.deposit_funds("IAF", dec!(60)).unwrap();
        crate::variables::evaluate_variables(&def, &mut state).unwrap();
        let accrual_a = dec!(1000) * dec!(0.04) / dec!(12);
        let accrual_b = dec!(200) * dec!(0.08) / dec!(12);
        run_interest_waterfall(&def, &mut state).unwrap();
        assert_eq!(state.cash_balances["IAF"], dec!(60) - accrual_a - accrual_b);
        assert!(
            !state.ledgers.contains_key("SeniorShortfall")
                || state.ledgers["SeniorShortfall"].is_zero()
        );
    }

    #[test]
    fn scenario_two_interest_shortfall() {
        let def = crate::test_support::sample_deal_definition();
        let mut state = DealState::new(&def, crate::state::OVERDRAFT_EPSILON);
        state.deposit_funds("IAF", dec!(3)).unwrap();
        crate::variables::evaluate_variables(&def, &mut state).unwrap();
        let accrual_a = dec!(1000) * dec!(0.04) / dec!(12);
        let accrual_b = dec!(200) * dec!(0.08) / dec!(12);
        run_interest_waterfall(&def, &mut state).unwrap();
        assert_eq!(state.cash_balances["IAF"], Decimal::ZERO);
        assert_eq!(state.ledgers["SeniorShortfall"], accrual_a - dec!(3));
        assert_eq!(state.ledgers["JuniorShortfall"], accrual_b);
    }

    #[test]
    fn scenario_three_sequential_principal() {
        let def = crate::test_support::sample_deal_definition();
        let mut state = DealState::new(&def, crate::state::OVERDRAFT_EPSILON);
        state.deposit_funds("PAF", dec!(150)).unwrap();
        run_principal_waterfall(&def, &mut state).unwrap();
        assert_eq!(state.bonds["A"].current_balance, dec!(850));
        assert_eq!(state.cash_balances["PAF"], Decimal::ZERO);
        assert_eq!(state.bonds["B"].current_balance, dec!(200));
    }
}
