use rmbs_engine_core::CollateralCashflow;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Read a deal description file as a generic JSON value, accepting either
/// JSON or YAML by extension (the loader itself only ever sees a
/// `serde_json::Value`).
pub fn read_deal_value(path: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let canonical = resolve_path(path)?;
    let contents = fs::read_to_string(&canonical)
        .map_err(|e| format!("Failed to read '{}': {}", canonical.display(), e))?;

    let is_yaml = matches!(
        canonical.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let value = if is_yaml {
        serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse '{}': {}", canonical.display(), e))?
    } else {
        serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse '{}': {}", canonical.display(), e))?
    };
    Ok(value)
}

/// Read a collateral cashflow stream, dispatching on extension: `.csv` is
/// parsed with `csv`, anything else is treated as JSON Lines (one
/// `CollateralCashflow` object per line).
pub fn read_collateral(path: &str) -> Result<Vec<CollateralCashflow>, Box<dyn std::error::Error>> {
    let canonical = resolve_path(path)?;
    match canonical.extension().and_then(|e| e.to_str()) {
        Some("csv") => read_collateral_csv(&canonical),
        _ => read_collateral_jsonl(&canonical),
    }
}

fn read_collateral_csv(path: &Path) -> Result<Vec<CollateralCashflow>, Box<dyn std::error::Error>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| format!("Failed to open '{}': {}", path.display(), e))?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let cashflow: CollateralCashflow =
            row.map_err(|e| format!("Failed to parse '{}': {}", path.display(), e))?;
        records.push(cashflow);
    }
    Ok(records)
}

fn read_collateral_jsonl(path: &Path) -> Result<Vec<CollateralCashflow>, Box<dyn std::error::Error>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| format!("Failed to parse '{}': {}", path.display(), e).into())
        })
        .collect()
}

/// Resolve and validate the path, preventing directory traversal.
fn resolve_path(path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let p = Path::new(path);
    let canonical = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()?.join(p)
    };

    if !canonical.exists() {
        return Err(format!("File not found: {}", canonical.display()).into());
    }

    if !canonical.is_file() {
        return Err(format!("Not a file: {}", canonical.display()).into());
    }

    Ok(canonical)
}
