use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// All monetary values. Wraps Decimal to prevent accidental f64 usage.
pub type Money = Decimal;

/// Rates expressed as decimals (0.05 = 5%). Never as percentages.
pub type Rate = Decimal;

/// Payment period index, 1-based once the deal starts running.
pub type Period = u32;

/// A value the expression engine can produce: a scalar or a boolean.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Number(Decimal),
    Bool(bool),
}

impl Value {
    /// Boolean coercion per spec §4.2: numbers are truthy iff strictly > 0.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n > Decimal::ZERO,
        }
    }

    pub fn as_number(&self) -> Decimal {
        match self {
            Value::Number(n) => *n,
            Value::Bool(b) => {
                if *b {
                    Decimal::ONE
                } else {
                    Decimal::ZERO
                }
            }
        }
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Number(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Payment frequency of the deal (months between payment dates).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentFrequency {
    Monthly,
    Quarterly,
    SemiAnnual,
    Annual,
}

impl PaymentFrequency {
    pub fn months(self) -> u32 {
        match self {
            PaymentFrequency::Monthly => 1,
            PaymentFrequency::Quarterly => 3,
            PaymentFrequency::SemiAnnual => 6,
            PaymentFrequency::Annual => 12,
        }
    }

    pub fn periods_per_year(self) -> Decimal {
        Decimal::from(12u32 / self.months())
    }
}

/// Deal-level dates, recovered from the prototype's `dates` block
/// (`original_source/RMBS_deal/rmbs_loader.py`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealDates {
    pub cutoff_date: NaiveDate,
    pub closing_date: NaiveDate,
    pub first_payment_date: NaiveDate,
    pub maturity_date: NaiveDate,
    pub payment_frequency: PaymentFrequency,
}

/// Deal-level metadata (spec §3 `meta`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealMeta {
    pub deal_id: String,
    pub deal_name: String,
    pub asset_class: String,
    pub version: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Static collateral-pool metadata, exposed to the expression engine as
/// `collateral.original_balance` / `collateral.current_balance` / `collateral.wac`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollateralMeta {
    pub original_balance: Money,
    pub current_balance: Money,
    pub wac: Rate,
    pub wam: u32,
    #[serde(default)]
    pub loan_count: u32,
}
