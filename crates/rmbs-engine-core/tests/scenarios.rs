//! End-to-end scenarios run through the full loader -> driver pipeline.
//! Mirrors spec.md §8's six literal scenarios.

use rmbs_engine_core::driver::{CollateralRouting, HorizonConfig};
use rmbs_engine_core::{CollateralCashflow, DealDefinition, Driver, EngineConfig, EngineError, VecCollateralSource};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

/// Two-bond deal: A (senior, 1 000 @ 4%), B (junior, 200 @ 8%), IAF/PAF
/// cash buckets, sequential interest-then-principal waterfalls, a
/// junior-first write-down order, and a coverage-ratio trigger with a
/// 3-period cure window.
fn deal() -> DealDefinition {
    let raw = json!({
        "meta": {
            "deal_id": "TEST-2026-1",
            "deal_name": "Test Trust 2026-1",
            "asset_class": "RMBS",
            "version": "1.0"
        },
        "dates": {
            "cutoff_date": "2026-01-01",
            "closing_date": "2026-01-15",
            "first_payment_date": "2026-02-25",
            "maturity_date": "2056-01-25",
            "payment_frequency": "MONTHLY"
        },
        "collateral": {
            "original_balance": 1200,
            "current_balance": 1200,
            "wac": 0.05,
            "wam": 360
        },
        "funds": [
            {"id": "IAF", "description": "interest available funds"},
            {"id": "PAF", "description": "principal available funds"},
            {"id": "Reserve", "description": "reserve account"}
        ],
        "ledgers": ["SeniorShortfall", "JuniorShortfall"],
        "bonds": [
            {
                "id": "A",
                "original_balance": 1000,
                "coupon": {"kind": "FIXED", "fixed_rate": 0.04},
                "priority": {"interest": 1, "principal": 1}
            },
            {
                "id": "B",
                "original_balance": 200,
                "coupon": {"kind": "FIXED", "fixed_rate": 0.08},
                "priority": {"interest": 2, "principal": 2}
            }
        ],
        "variables": {
            "InterestAccrualA": "bonds.A.balance * 0.04 / 12",
            "InterestAccrualB": "bonds.B.balance * 0.08 / 12",
            "CoverageRatio": "collateral.wac"
        },
        "tests": [
            {
                "id": "CoverageTest",
                "kind": "OC_TEST",
                "value_rule": "CoverageRatio",
                "threshold_rule": "1.10",
                "comparator": "VALUE_GEQ_THRESHOLD",
                "cure_periods": 3
            }
        ],
        "waterfalls": {
            "interest": {
                "steps": [
                    {
                        "id": "pay-a-interest",
                        "action": "PAY_BOND_INTEREST",
                        "from_fund": "IAF",
                        "group": "A",
                        "amount_rule": "InterestAccrualA",
                        "unpaid_ledger_id": "SeniorShortfall"
                    },
                    {
                        "id": "pay-b-interest",
                        "action": "PAY_BOND_INTEREST",
                        "from_fund": "IAF",
                        "group": "B",
                        "amount_rule": "InterestAccrualB",
                        "unpaid_ledger_id": "JuniorShortfall"
                    }
                ]
            },
            "principal": {
                "steps": [
                    {
                        "id": "pay-a-principal",
                        "action": "PAY_BOND_PRINCIPAL",
                        "from_fund": "PAF",
                        "group": "A",
                        "amount_rule": "ALL"
                    },
                    {
                        "id": "pay-b-principal",
                        "action": "PAY_BOND_PRINCIPAL",
                        "from_fund": "PAF",
                        "group": "B",
                        "amount_rule": "ALL"
                    }
                ]
            },
            "loss_allocation": {
                "write_down_order": ["B", "A"],
                "loss_source_rule": "RealizedLoss"
            }
        }
    });

    rmbs_engine_core::loader::load(&raw).expect("fixture deal must load")
}

fn routing() -> CollateralRouting {
    CollateralRouting {
        interest_fund: "IAF".to_string(),
        principal_fund: "PAF".to_string(),
    }
}

fn cashflow(
    interest: Decimal,
    principal: Decimal,
    loss: Decimal,
    end_balance: Decimal,
    month: u32,
) -> CollateralCashflow {
    CollateralCashflow {
        interest_collected: interest,
        principal_collected: principal,
        realized_loss: loss,
        end_pool_balance: end_balance,
        delinquency_60_plus_balance: None,
        wac: None,
        wam: None,
        period_date: chrono::NaiveDate::from_ymd_opt(2026, month, 25).unwrap(),
    }
}

/// Scenario 1: senior/junior sequential, no losses.
#[test]
fn scenario_one_sequential_interest_no_losses() {
    let def = deal();
    let driver = Driver::new(&def, EngineConfig::default(), HorizonConfig { max_periods: 1 }, routing());
    let source = VecCollateralSource::new(vec![cashflow(dec!(60), dec!(0), dec!(0), dec!(1150), 2)]);

    let outcome = driver.run(source).unwrap();
    let snap = &outcome.tape[0];

    let accrual_a = dec!(1000) * dec!(0.04) / dec!(12);
    let accrual_b = dec!(200) * dec!(0.08) / dec!(12);

    assert_eq!(snap.bond_balances["A"], dec!(1000));
    assert_eq!(snap.bond_balances["B"], dec!(200));
    assert_eq!(snap.funds["IAF"], dec!(60) - accrual_a - accrual_b);
    assert_eq!(snap.ledgers["SeniorShortfall"], Decimal::ZERO);
    assert_eq!(snap.ledgers["JuniorShortfall"], Decimal::ZERO);
}

/// Scenario 2: interest shortfall, senior paid in full, junior short.
#[test]
fn scenario_two_interest_shortfall() {
    let def = deal();
    let driver = Driver::new(&def, EngineConfig::default(), HorizonConfig { max_periods: 1 }, routing());
    let source = VecCollateralSource::new(vec![cashflow(dec!(3), dec!(0), dec!(0), dec!(1200), 2)]);

    let outcome = driver.run(source).unwrap();
    let snap = &outcome.tape[0];

    let accrual_a = dec!(1000) * dec!(0.04) / dec!(12);
    let accrual_b = dec!(200) * dec!(0.08) / dec!(12);

    assert_eq!(snap.funds["IAF"], Decimal::ZERO);
    assert_eq!(snap.ledgers["SeniorShortfall"], accrual_a - dec!(3));
    assert_eq!(snap.ledgers["JuniorShortfall"], accrual_b);
}

/// Scenario 3: sequential principal, senior first.
#[test]
fn scenario_three_sequential_principal() {
    let def = deal();
    let driver = Driver::new(&def, EngineConfig::default(), HorizonConfig { max_periods: 1 }, routing());
    let source = VecCollateralSource::new(vec![cashflow(dec!(0), dec!(150), dec!(0), dec!(1050), 2)]);

    let outcome = driver.run(source).unwrap();
    let snap = &outcome.tape[0];

    assert_eq!(snap.bond_balances["A"], dec!(850));
    assert_eq!(snap.bond_balances["B"], dec!(200));
    assert_eq!(snap.funds["PAF"], Decimal::ZERO);
}

/// Scenario 4: junior-first loss allocation.
#[test]
fn scenario_four_junior_first_loss_allocation() {
    let def = deal();
    let driver = Driver::new(&def, EngineConfig::default(), HorizonConfig { max_periods: 1 }, routing());
    let source = VecCollateralSource::new(vec![cashflow(dec!(0), dec!(0), dec!(100), dec!(1100), 2)]);

    let outcome = driver.run(source).unwrap();
    let snap = &outcome.tape[0];

    assert_eq!(snap.bond_balances["B"], dec!(100));
    assert_eq!(snap.bond_balances["A"], dec!(1000));
    assert_eq!(snap.ledgers["CumulativeLoss"], dec!(100));
}

/// Scenario 5: trigger hysteresis with a 3-period cure window, driven end
/// to end through the full driver loop (the ratio for each period is
/// carried in via the collateral record's `wac` field, which the declared
/// `CoverageRatio` variable reads straight through).
#[test]
fn scenario_five_trigger_hysteresis_end_to_end() {
    let def = deal();
    let driver = Driver::new(&def, EngineConfig::default(), HorizonConfig { max_periods: 7 }, routing());

    let ratios = [
        dec!(1.25),
        dec!(1.06),
        dec!(1.11),
        dec!(1.08),
        dec!(1.11),
        dec!(1.12),
        dec!(1.13),
    ];
    let records: Vec<CollateralCashflow> = ratios
        .iter()
        .enumerate()
        .map(|(i, ratio)| {
            let mut record = cashflow(dec!(60), dec!(0), dec!(0), dec!(1200), (2 + i) as u32);
            record.wac = Some(*ratio);
            record
        })
        .collect();

    let outcome = driver.run(VecCollateralSource::new(records)).unwrap();
    let expected_breached = [false, true, true, true, true, true, false];

    assert_eq!(outcome.tape.len(), 7);
    for (snap, expect) in outcome.tape.iter().zip(expected_breached) {
        assert_eq!(snap.flags["CoverageTest"], expect);
    }
}

/// Scenario 6: overdraft protection. A transfer larger than the source
/// bucket's balance must raise `InvariantViolation` and leave the bucket
/// untouched, never silently clamp.
#[test]
fn scenario_six_overdraft_protection() {
    let def = deal();
    let mut state = rmbs_engine_core::DealState::new(&def, EngineConfig::default().overdraft_epsilon);
    state.deposit_funds("IAF", dec!(400)).unwrap();

    let err = state.transfer_cash("IAF", "Reserve", dec!(9999)).unwrap_err();
    assert!(matches!(err, EngineError::InvariantViolation(_)));
    assert_eq!(state.cash_balances["IAF"], dec!(400));
}
