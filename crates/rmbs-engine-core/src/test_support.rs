//! Shared fixtures for unit tests across modules. Not compiled outside
//! `#[cfg(test)]`.

use serde_json::json;

use crate::definition::DealDefinition;
use crate::loader;

/// A two-bond deal mirroring spec.md §8 scenarios 1-4: bond A (senior,
/// 1 000 @ 4%) and B (junior, 200 @ 8%), IAF/PAF cash buckets, a
/// sequential interest-then-principal waterfall and a junior-first
/// write-down order.
pub fn sample_deal_definition() -> DealDefinition {
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
            {"id": "PAF", "description": "principal available funds"}
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
            "InterestAccrualB": "bonds.B.balance * 0.08 / 12"
        },
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

    loader::load(&raw).expect("sample deal fixture must be valid")
}
