//! Loss Allocator (C7): bottom-up write-down of bond balances by declared
//! order, and the cumulative-loss ledger (spec.md §4.6).

use rust_decimal::Decimal;

use crate::definition::DealDefinition;
use crate::error::EngineResult;
use crate::state::{DealState, Diagnostic};

/// Conventional ledger id for cumulative realized loss (spec.md §4.6:
/// "name is conventional; actual id from definition" — the loader always
/// declares this ledger, see `loader::load_ledgers`).
pub const CUMULATIVE_LOSS_LEDGER: &str = "CumulativeLoss";

pub fn allocate_losses(def: &DealDefinition, state: &mut DealState) -> EngineResult<()> {
    let period_loss = def
        .waterfalls
        .loss_allocation
        .loss_source_rule
        .eval(state)?
        .as_number()
        .max(Decimal::ZERO);

    if period_loss.is_zero() {
        return Ok(());
    }

    let mut remaining = period_loss;
    for bond_id in &def.waterfalls.loss_allocation.write_down_order {
        if remaining <= Decimal::ZERO {
            break;
        }
        let written_down = state.write_down_bond(bond_id, remaining)?;
        remaining -= written_down;
    }

    state.add_to_ledger(CUMULATIVE_LOSS_LEDGER, period_loss);

    if remaining > Decimal::ZERO {
        match &def.waterfalls.loss_allocation.overflow_ledger_id {
            Some(ledger_id) => state.add_to_ledger(ledger_id, remaining),
            None => state.diagnostics.push(Diagnostic::ResidualLossDropped {
                period: state.period_index,
                amount: remaining,
            }),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn junior_first_write_down_order() {
        let def = crate::test_support::sample_deal_definition();
        let mut state = crate::state::DealState::new(&def, crate::state::OVERDRAFT_EPSILON);
        state.set_variable("RealizedLoss", dec!(100).into());
        allocate_losses(&def, &mut state).unwrap();
        assert_eq!(state.bonds["B"].current_balance, dec!(100));
        assert_eq!(state.bonds["A"].current_balance, dec!(1000));
        assert_eq!(state.ledgers[CUMULATIVE_LOSS_LEDGER], dec!(100));
    }

    #[test]
    fn loss_exceeding_all_bonds_is_dropped_with_diagnostic() {
        let def = crate::test_support::sample_deal_definition();
        let mut state = crate::state::DealState::new(&def, crate::state::OVERDRAFT_EPSILON);
        state.set_variable("RealizedLoss", dec!(5000).into());
        allocate_losses(&def, &mut state).unwrap();
        assert_eq!(state.bonds["A"].current_balance, Decimal::ZERO);
        assert_eq!(state.bonds["B"].current_balance, Decimal::ZERO);
        assert!(matches!(
            state.diagnostics.last(),
            Some(Diagnostic::ResidualLossDropped { .. })
        ));
    }
}
