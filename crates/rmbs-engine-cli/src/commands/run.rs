use clap::Args;
use colored::Colorize;
use rust_decimal::Decimal;
use serde_json::Value;

use rmbs_engine_core::config::MissingIdPolicy;
use rmbs_engine_core::{CollateralRouting, Diagnostic, Driver, EngineConfig, HorizonConfig, VecCollateralSource};

use crate::input;

/// Arguments for running a deal against a collateral cashflow stream.
#[derive(Args)]
pub struct RunArgs {
    /// Path to the deal description file (JSON or YAML)
    #[arg(long)]
    pub deal: String,

    /// Path to the collateral cashflow stream (CSV or JSON Lines)
    #[arg(long)]
    pub collateral: String,

    /// Fund id that receives collected interest each period
    #[arg(long)]
    pub interest_fund: String,

    /// Fund id that receives collected principal each period
    #[arg(long)]
    pub principal_fund: String,

    /// Use the iterative fixed-point solver instead of one sequential pass
    #[arg(long)]
    pub iterative_solver: bool,

    /// Maximum solver iterations per period
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Solver convergence tolerance
    #[arg(long)]
    pub convergence_tol: Option<Decimal>,

    /// Absolute tolerance for overdraft/shortfall checks
    #[arg(long)]
    pub overdraft_epsilon: Option<Decimal>,

    /// Maximum number of periods to run before forcing termination
    #[arg(long)]
    pub max_periods: Option<u32>,

    /// Error instead of defaulting to zero on an unknown fund id
    #[arg(long)]
    pub strict_funds: bool,

    /// Error instead of defaulting to zero on an unknown bond id
    #[arg(long)]
    pub strict_bonds: bool,
}

pub fn run_run(args: RunArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let raw_deal = input::file::read_deal_value(&args.deal)?;
    let def = rmbs_engine_core::loader::load(&raw_deal)?;

    let mut config: EngineConfig = raw_deal
        .get("config")
        .map(|c| serde_json::from_value(c.clone()))
        .transpose()?
        .unwrap_or_default();

    if args.iterative_solver {
        config.use_iterative_solver = true;
    }
    if let Some(v) = args.max_iterations {
        config.max_iterations = v;
    }
    if let Some(v) = args.convergence_tol {
        config.convergence_tol = v;
    }
    if let Some(v) = args.overdraft_epsilon {
        config.overdraft_epsilon = v;
    }
    if args.strict_funds {
        config.funds_missing_policy = MissingIdPolicy::Error;
    }
    if args.strict_bonds {
        config.bonds_missing_policy = MissingIdPolicy::Error;
    }

    let mut horizon = HorizonConfig::default();
    if let Some(v) = args.max_periods {
        horizon.max_periods = v;
    }

    let routing = CollateralRouting {
        interest_fund: args.interest_fund,
        principal_fund: args.principal_fund,
    };

    let records = input::file::read_collateral(&args.collateral)?;
    let source = VecCollateralSource::new(records);

    let driver = Driver::new(&def, config, horizon, routing);
    let outcome = driver.run(source)?;

    for diag in &outcome.diagnostics {
        eprintln!("{} {}", "diagnostic:".yellow().bold(), format_diagnostic(diag));
    }

    Ok(serde_json::to_value(&outcome.tape)?)
}

fn format_diagnostic(diag: &Diagnostic) -> String {
    match diag {
        Diagnostic::OverpaidBond {
            bond_id,
            balance,
            attempted,
        } => format!("bond '{bond_id}' overpaid: balance {balance}, attempted {attempted}"),
        Diagnostic::ResidualLossDropped { period, amount } => {
            format!("period {period}: residual loss {amount} dropped (no overflow ledger configured)")
        }
        Diagnostic::SolverNonConverged {
            period,
            iterations,
            max_delta,
        } => format!("period {period}: solver did not converge after {iterations} iterations (max delta {max_delta})"),
    }
}
