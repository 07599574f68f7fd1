//! Variable & Trigger Evaluator (C5): per-period declared-variable
//! computation and trigger hysteresis (spec.md §4.4).

use rust_decimal::Decimal;

use crate::definition::{DealDefinition, Effect};
use crate::error::EngineResult;
use crate::state::{DealState, TriggerState};

/// Evaluates every declared variable in declaration order, writing each
/// result into `state` before the next expression is evaluated (so later
/// variables can reference earlier ones).
pub fn evaluate_variables(def: &DealDefinition, state: &mut DealState) -> EngineResult<()> {
    for var in &def.variables {
        let value = var.expression.eval(state)?;
        state.set_variable(&var.name, value);
    }
    Ok(())
}

/// Evaluates every declared test, advances its cure-period state machine,
/// and writes the resulting flag. Effects fire in periods where the
/// trigger's *resulting* state is breached (spec.md §4.4 step 4; see
/// DESIGN.md for why effects are gated on breach rather than fired
/// unconditionally every period).
pub fn evaluate_triggers(def: &DealDefinition, state: &mut DealState) -> EngineResult<()> {
    for test in &def.tests {
        let value = test.value_rule.eval(state)?.as_number();
        let threshold = test.threshold_rule.eval(state)?.as_number();
        let passes_this_period = test.comparator.apply(value, threshold);

        let mut s = state
            .trigger_states
            .get(&test.id)
            .copied()
            .unwrap_or_default();
        advance_trigger(&mut s, passes_this_period, test.cure_periods);
        state.trigger_states.insert(test.id.clone(), s);
        state.set_flag(&test.id, s.is_breached);

        if s.is_breached {
            for effect in &test.effects {
                apply_effect(effect, state)?;
            }
        }
    }
    Ok(())
}

/// CLEAN/BREACHED/CURING(k) transition per spec.md §4.4.
fn advance_trigger(s: &mut TriggerState, passes: bool, cure_periods: u32) {
    if passes {
        s.months_cured += 1;
        s.months_breached = 0;
        if s.is_breached && s.months_cured >= cure_periods {
            s.is_breached = false;
        }
    } else {
        s.months_breached += 1;
        s.months_cured = 0;
        s.is_breached = true;
    }
}

fn apply_effect(effect: &Effect, state: &mut DealState) -> EngineResult<()> {
    match effect {
        Effect::SetFlag { flag, value } => {
            state.set_flag(flag, *value);
        }
        Effect::SetVariable { name, value_rule } => {
            let value = value_rule.eval(state)?;
            state.set_variable(name, value);
        }
        Effect::Redirect { .. } => {
            // No independent execution; the deal's own step conditions
            // (tests.<id>.failed) are what actually redirects cash flow.
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cure_threshold_requires_k_consecutive_passes() {
        let mut s = TriggerState::default();
        advance_trigger(&mut s, false, 3); // BREACHED
        assert!(s.is_breached);
        advance_trigger(&mut s, true, 3); // CURING(1)
        assert!(s.is_breached);
        assert_eq!(s.months_cured, 1);
        advance_trigger(&mut s, false, 3); // resets to BREACHED
        assert!(s.is_breached);
        assert_eq!(s.months_cured, 0);
        advance_trigger(&mut s, true, 3); // CURING(1)
        advance_trigger(&mut s, true, 3); // CURING(2)
        advance_trigger(&mut s, true, 3); // CLEAN
        assert!(!s.is_breached);
    }

    #[test]
    fn scenario_five_trigger_sequence() {
        // spec.md §8 scenario 5: cure_periods = 3.
        let mut s = TriggerState::default();
        let ratios = [
            Decimal::new(125, 2), // 1.25 -> pass -> CLEAN
            Decimal::new(106, 2), // 1.06 -> fail -> BREACHED
            Decimal::new(111, 2), // 1.11 -> pass -> CURING(1)
            Decimal::new(108, 2), // 1.08 -> fail -> BREACHED, counter reset
            Decimal::new(111, 2), // CURING(1)
            Decimal::new(112, 2), // CURING(2)
            Decimal::new(113, 2), // CLEAN
        ];
        let expected_breached = [false, true, true, true, true, true, false];
        for (ratio, expect) in ratios.iter().zip(expected_breached) {
            let passes = *ratio >= Decimal::new(110, 2);
            advance_trigger(&mut s, passes, 3);
            assert_eq!(s.is_breached, expect);
        }
    }
}
