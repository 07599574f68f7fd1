//! Engine-wide tunables (spec.md §6 "Configuration").

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::expr::MissingPolicy;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MissingIdPolicy {
    Zero,
    Error,
}

impl From<MissingIdPolicy> for MissingPolicy {
    fn from(p: MissingIdPolicy) -> Self {
        match p {
            MissingIdPolicy::Zero => MissingPolicy::Zero,
            MissingIdPolicy::Error => MissingPolicy::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub use_iterative_solver: bool,
    pub max_iterations: u32,
    pub convergence_tol: Decimal,
    pub overdraft_epsilon: Decimal,
    pub funds_missing_policy: MissingIdPolicy,
    pub bonds_missing_policy: MissingIdPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            use_iterative_solver: false,
            max_iterations: 15,
            convergence_tol: dec!(0.01),
            overdraft_epsilon: dec!(0.00001),
            funds_missing_policy: MissingIdPolicy::Zero,
            bonds_missing_policy: MissingIdPolicy::Zero,
        }
    }
}
