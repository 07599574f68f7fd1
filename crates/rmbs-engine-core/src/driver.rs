//! Period Driver & Snapshotter (C8): the outer loop over payment periods
//! (spec.md §4.7).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::definition::DealDefinition;
use crate::error::EngineResult;
use crate::loss::allocate_losses;
use crate::state::{DealState, Diagnostic, PeriodSnapshot};
use crate::types::Money;
use crate::variables::{evaluate_triggers, evaluate_variables};
use crate::waterfall::{run_waterfalls_iterative, run_waterfalls_sequential};

/// One period's worth of collateral-side inputs (spec.md §3
/// `CollateralCashflow`, §6 "Collateral cashflow stream").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollateralCashflow {
    pub interest_collected: Money,
    pub principal_collected: Money,
    pub realized_loss: Money,
    pub end_pool_balance: Money,
    #[serde(default)]
    pub delinquency_60_plus_balance: Option<Money>,
    #[serde(default)]
    pub wac: Option<Decimal>,
    #[serde(default)]
    pub wam: Option<u32>,
    pub period_date: chrono::NaiveDate,
}

/// A supplier of per-period collateral cashflows. The loan-level ETL,
/// prepayment/default model, and servicer-tape aggregation that produce
/// these records are external collaborators (spec.md §1 Non-goals); this
/// trait is the seam the driver consumes them through.
pub trait CollateralCashflowSource {
    /// Returns the next period's record, or `None` when the stream is
    /// exhausted (which also ends the run).
    fn next_period(&mut self) -> Option<CollateralCashflow>;
}

/// An in-memory collateral stream, for tests and for callers that already
/// have a fully materialized projection.
pub struct VecCollateralSource {
    records: std::vec::IntoIter<CollateralCashflow>,
}

impl VecCollateralSource {
    pub fn new(records: Vec<CollateralCashflow>) -> Self {
        VecCollateralSource {
            records: records.into_iter(),
        }
    }
}

impl CollateralCashflowSource for VecCollateralSource {
    fn next_period(&mut self) -> Option<CollateralCashflow> {
        self.records.next()
    }
}

/// Maps collateral collections onto cash buckets (spec.md §4.7 step 2:
/// "Exact mapping is data-driven"). Kept as an explicit, small struct
/// rather than reaching into `DealDefinition` with a hardcoded fund id,
/// since a deal author may name interest/principal funds however they
/// like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollateralRouting {
    pub interest_fund: String,
    pub principal_fund: String,
}

/// How the run is allowed to terminate (spec.md §4.7 Horizon).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonConfig {
    pub max_periods: u32,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        HorizonConfig { max_periods: 600 }
    }
}

/// What a run produces: the snapshot tape plus whatever non-fatal
/// diagnostics accumulated along the way (spec.md §7's "caller provides a
/// sink for diagnostic messages").
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub tape: Vec<PeriodSnapshot>,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Driver<'a> {
    def: &'a DealDefinition,
    config: EngineConfig,
    horizon: HorizonConfig,
    routing: CollateralRouting,
}

impl<'a> Driver<'a> {
    pub fn new(
        def: &'a DealDefinition,
        config: EngineConfig,
        horizon: HorizonConfig,
        routing: CollateralRouting,
    ) -> Self {
        Driver {
            def,
            config,
            horizon,
            routing,
        }
    }

    /// Runs the deal to completion against `source`, returning the full
    /// snapshot tape plus any accumulated diagnostics. Terminates at the
    /// earliest of: the configured horizon, the collateral stream's
    /// exhaustion, the clean-up call rule firing, or every bond reaching
    /// zero balance.
    pub fn run(&self, mut source: impl CollateralCashflowSource) -> EngineResult<RunOutcome> {
        let mut state = DealState::new(self.def, self.config.overdraft_epsilon)
            .with_missing_policies(self.config.funds_missing_policy.into(), self.config.bonds_missing_policy.into());

        for _period in 1..=self.horizon.max_periods {
            let Some(cashflow) = source.next_period() else {
                break;
            };

            state.deposit_funds(&self.routing.interest_fund, cashflow.interest_collected)?;
            state.deposit_funds(&self.routing.principal_fund, cashflow.principal_collected)?;

            state.set_variable("RealizedLoss", cashflow.realized_loss.into());
            state.set_variable("CurrentPoolBalance", cashflow.end_pool_balance.into());
            state.set_collateral(
                cashflow.end_pool_balance,
                self.def.collateral.original_balance,
                cashflow.wac.unwrap_or(self.def.collateral.wac),
            );

            evaluate_variables(self.def, &mut state)?;
            evaluate_triggers(self.def, &mut state)?;

            if self.config.use_iterative_solver {
                run_waterfalls_iterative(self.def, &mut state, &self.config)?;
            } else {
                run_waterfalls_sequential(self.def, &mut state)?;
            }

            allocate_losses(self.def, &mut state)?;

            state.check_invariants(crate::loss::CUMULATIVE_LOSS_LEDGER)?;
            state.snapshot(cashflow.period_date);

            if self.clean_up_call_fired(&state)? {
                break;
            }
            if self.all_bonds_paid_off(&state) {
                break;
            }
        }

        Ok(RunOutcome {
            tape: state.history.clone(),
            diagnostics: state.diagnostics.clone(),
        })
    }

    fn clean_up_call_fired(&self, state: &DealState) -> EngineResult<bool> {
        match &self.def.clean_up_call_rule {
            Some(rule) => Ok(rule.eval_condition(state)?),
            None => Ok(false),
        }
    }

    fn all_bonds_paid_off(&self, state: &DealState) -> bool {
        state.bonds.values().all(|b| b.current_balance.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn routing() -> CollateralRouting {
        CollateralRouting {
            interest_fund: "IAF".to_string(),
            principal_fund: "PAF".to_string(),
        }
    }

    #[test]
    fn single_period_run_produces_one_snapshot() {
        let def = crate::test_support::sample_deal_definition();
        let driver = Driver::new(&def, EngineConfig::default(), HorizonConfig { max_periods: 1 }, routing());
        let source = VecCollateralSource::new(vec![CollateralCashflow {
            interest_collected: dec!(60),
            principal_collected: dec!(0),
            realized_loss: Decimal::ZERO,
            end_pool_balance: dec!(1150),
            delinquency_60_plus_balance: None,
            wac: None,
            wam: None,
            period_date: chrono::NaiveDate::from_ymd_opt(2026, 2, 25).unwrap(),
        }]);
        let outcome = driver.run(source).unwrap();
        assert_eq!(outcome.tape.len(), 1);
        assert_eq!(outcome.tape[0].period, 1);
    }

    #[test]
    fn run_terminates_when_all_bonds_paid_off() {
        let def = crate::test_support::sample_deal_definition();
        let driver = Driver::new(
            &def,
            EngineConfig::default(),
            HorizonConfig { max_periods: 600 },
            routing(),
        );
        let records: Vec<CollateralCashflow> = (0..10)
            .map(|i| CollateralCashflow {
                interest_collected: dec!(60),
                principal_collected: dec!(1200),
                realized_loss: Decimal::ZERO,
                end_pool_balance: Decimal::ZERO,
                delinquency_60_plus_balance: None,
                wac: None,
                wam: None,
                period_date: chrono::NaiveDate::from_ymd_opt(2026, 2 + i, 25).unwrap(),
            })
            .collect();
        let outcome = driver.run(VecCollateralSource::new(records)).unwrap();
        assert_eq!(outcome.tape.len(), 1);
        assert!(outcome.tape[0].bond_balances.values().all(|b| b.is_zero()));
    }
}
