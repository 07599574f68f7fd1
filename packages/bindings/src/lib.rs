use napi::Result as NapiResult;
use napi_derive::napi;

use rmbs_engine_core::driver::{CollateralRouting, Driver, HorizonConfig};
use rmbs_engine_core::{CollateralCashflow, EngineConfig, VecCollateralSource};

/// Convert any Display error into a napi::Error.
fn to_napi_error(e: impl std::fmt::Display) -> napi::Error {
    napi::Error::from_reason(e.to_string())
}

/// Run configuration passed alongside a `run_deal` call: solver/missing-id
/// settings, the horizon, and the fund ids collateral collections are
/// deposited into.
#[derive(serde::Deserialize)]
struct RunRequest {
    #[serde(default)]
    config: EngineConfig,
    #[serde(default)]
    horizon: HorizonConfig,
    routing: CollateralRouting,
}

/// Loads and validates a deal description, returning the validated
/// definition as JSON. Fails with the loader's schema/logic error if the
/// description is malformed.
#[napi]
pub fn load_deal(deal_json: String) -> NapiResult<String> {
    let raw: serde_json::Value = serde_json::from_str(&deal_json).map_err(to_napi_error)?;
    let def = rmbs_engine_core::loader::load(&raw).map_err(to_napi_error)?;
    serde_json::to_string(&def).map_err(to_napi_error)
}

/// Loads a deal, runs it against an in-memory collateral cashflow stream,
/// and returns the resulting `RunOutcome` (snapshot tape + diagnostics) as
/// JSON.
#[napi]
pub fn run_deal(deal_json: String, collateral_json: String, request_json: String) -> NapiResult<String> {
    let raw: serde_json::Value = serde_json::from_str(&deal_json).map_err(to_napi_error)?;
    let def = rmbs_engine_core::loader::load(&raw).map_err(to_napi_error)?;

    let records: Vec<CollateralCashflow> =
        serde_json::from_str(&collateral_json).map_err(to_napi_error)?;
    let request: RunRequest = serde_json::from_str(&request_json).map_err(to_napi_error)?;

    let driver = Driver::new(&def, request.config, request.horizon, request.routing);
    let outcome = driver
        .run(VecCollateralSource::new(records))
        .map_err(to_napi_error)?;

    serde_json::to_string(&outcome).map_err(to_napi_error)
}
