use clap::Args;
use serde_json::Value;

use rmbs_engine_core::loader;

use crate::input;

/// Arguments for deal validation.
#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the deal description file (JSON or YAML)
    #[arg(long)]
    pub deal: String,
}

pub fn run_validate(args: ValidateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let raw = input::file::read_deal_value(&args.deal)?;
    let def = loader::load(&raw)?;

    Ok(serde_json::json!({
        "valid": true,
        "deal_id": def.meta.deal_id,
        "deal_name": def.meta.deal_name,
        "bonds": def.bonds.len(),
        "funds": def.funds.len(),
        "tests": def.tests.len(),
    }))
}
