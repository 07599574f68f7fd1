//! Immutable deal definition (C1): bonds, funds, ledgers, variables, tests
//! and waterfalls, as produced by the Loader (spec.md §3, §4.1).

use std::collections::HashMap;

use serde::Serialize;

use crate::expr::CompiledExpr;
use crate::types::{CollateralMeta, DealDates, DealMeta, Money, Rate};

impl Serialize for CompiledExpr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.source())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum CouponKind {
    Fixed,
    Float,
    Wac,
    Variable,
}

/// A bond's coupon specification (spec.md §3: `coupon { kind, fixed_rate?,
/// index?, margin?, cap_ref? }`).
#[derive(Debug, Clone, Serialize)]
pub struct Coupon {
    pub kind: CouponKind,
    pub fixed_rate: Option<Rate>,
    pub index: Option<String>,
    pub margin: Option<Rate>,
    /// Name of a declared variable used as a rate cap (e.g. Net WAC). Must
    /// resolve to a declared variable when `kind` requires it (spec.md
    /// §4.1 semantic check (g)).
    pub cap_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BondDef {
    pub id: String,
    pub original_balance: Money,
    pub coupon: Coupon,
    pub interest_priority: u32,
    pub principal_priority: u32,
    pub group_tag: Option<String>,
    pub loss_absorption_rank: u32,
}

/// A cash bucket: interest/principal available funds, reserve accounts, etc.
/// The prototype's `Fund`/`Account` split collapses here since both are
/// plain cash buckets in `DealState.cash_balances`.
#[derive(Debug, Clone, Serialize)]
pub struct FundDef {
    pub id: String,
    pub description: String,
    pub target_balance_rule: Option<CompiledExpr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableDef {
    pub name: String,
    pub expression: CompiledExpr,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    pub fn apply(self, value: rust_decimal::Decimal, threshold: rust_decimal::Decimal) -> bool {
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Eq => value == threshold,
            Comparator::Ne => value != threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum Effect {
    SetFlag { flag: String, value: bool },
    SetVariable { name: String, value_rule: CompiledExpr },
    /// Carries a redirect target; spec.md leaves the precise wiring of this
    /// effect kind to the deal's own step conditions (tests.<id>.failed is
    /// the mechanism steps actually consult). Stored and validated, not
    /// independently executed.
    Redirect { target: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TestDef {
    pub id: String,
    pub kind: String,
    pub value_rule: CompiledExpr,
    pub threshold_rule: CompiledExpr,
    pub comparator: Comparator,
    pub cure_periods: u32,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum StepAction {
    PayBondInterest,
    PayBondPrincipal,
    PayFee,
    TransferFund,
    Deposit,
}

/// `amount_rule` after parsing: a real expression, or one of the two
/// sentinel literals the Waterfall Runner treats specially (spec.md §4.2,
/// §4.5: `"ALL"` / `"REMAINING"` both mean "whatever is available").
#[derive(Debug, Clone, Serialize)]
pub enum AmountRule {
    All,
    Remaining,
    Expr(CompiledExpr),
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub id: String,
    pub action: StepAction,
    pub from_fund: String,
    pub to: Option<String>,
    pub group: Option<String>,
    pub amount_rule: AmountRule,
    pub condition: CompiledExpr,
    pub unpaid_ledger_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LossAllocation {
    pub write_down_order: Vec<String>,
    pub loss_source_rule: CompiledExpr,
    /// Ledger id for loss that exceeds the write-down order's total bond
    /// balance. `None` means the residual is dropped with a diagnostic
    /// (spec.md §4.6, §9 open question).
    pub overflow_ledger_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Waterfalls {
    pub interest: Vec<Step>,
    pub principal: Vec<Step>,
    pub loss_allocation: LossAllocation,
}

/// The validated, immutable description of a deal. Produced exclusively by
/// the Loader (`loader::load`); never constructed or mutated elsewhere.
#[derive(Debug, Clone, Serialize)]
pub struct DealDefinition {
    pub meta: DealMeta,
    pub dates: DealDates,
    pub collateral: CollateralMeta,
    pub bonds: HashMap<String, BondDef>,
    pub funds: HashMap<String, FundDef>,
    pub ledgers: Vec<String>,
    pub variables: Vec<VariableDef>,
    pub tests: Vec<TestDef>,
    pub waterfalls: Waterfalls,
    /// Optional rule: terminate the run after the period in which this
    /// evaluates true (spec.md §4.7 step 8, e.g. pool paid down below 10%
    /// of original).
    pub clean_up_call_rule: Option<CompiledExpr>,
}

impl DealDefinition {
    pub fn bond(&self, id: &str) -> Option<&BondDef> {
        self.bonds.get(id)
    }

    pub fn fund(&self, id: &str) -> Option<&FundDef> {
        self.funds.get(id)
    }

    /// Bonds ordered by ascending interest priority, for diagnostics and
    /// reporting (the actual waterfall order is the declared `Step` list,
    /// not a derived sort — spec.md §4.5's "list order is authoritative").
    pub fn bonds_by_interest_priority(&self) -> Vec<&BondDef> {
        let mut bonds: Vec<&BondDef> = self.bonds.values().collect();
        bonds.sort_by_key(|b| b.interest_priority);
        bonds
    }
}
