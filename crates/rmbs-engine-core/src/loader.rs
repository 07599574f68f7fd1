//! Loader & Validator (C2): parses a JSON deal description into a validated
//! `DealDefinition`, per spec.md §4.1. Two phases: syntactic (shape/type),
//! then semantic (cross-reference resolution). No partial `DealDefinition`
//! is ever returned — the first phase to fail aborts the load.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::definition::{
    AmountRule, BondDef, Comparator, Coupon, CouponKind, DealDefinition, Effect, FundDef,
    LossAllocation, Step, StepAction, TestDef, VariableDef, Waterfalls,
};
use crate::error::{EngineError, EngineResult};
use crate::expr::CompiledExpr;
use crate::types::{CollateralMeta, DealDates, DealMeta, PaymentFrequency};

fn schema_err(path: impl Into<String>, reason: impl Into<String>) -> EngineError {
    EngineError::SchemaViolation {
        path: path.into(),
        reason: reason.into(),
    }
}

fn logic_err(reason: impl Into<String>) -> EngineError {
    EngineError::LogicIntegrity(reason.into())
}

fn field<'a>(v: &'a Value, key: &str, path: &str) -> EngineResult<&'a Value> {
    v.get(key)
        .ok_or_else(|| schema_err(format!("{path}.{key}"), "missing required field"))
}

fn as_str<'a>(v: &'a Value, path: &str) -> EngineResult<&'a str> {
    v.as_str()
        .ok_or_else(|| schema_err(path, "expected a string"))
}

fn as_obj<'a>(v: &'a Value, path: &str) -> EngineResult<&'a serde_json::Map<String, Value>> {
    v.as_object()
        .ok_or_else(|| schema_err(path, "expected an object"))
}

fn as_arr<'a>(v: &'a Value, path: &str) -> EngineResult<&'a Vec<Value>> {
    v.as_array()
        .ok_or_else(|| schema_err(path, "expected an array"))
}

fn as_decimal(v: &Value, path: &str) -> EngineResult<Decimal> {
    let n = v
        .as_number()
        .ok_or_else(|| schema_err(path, "expected a number"))?;
    Decimal::from_str(&n.to_string()).map_err(|e| schema_err(path, format!("not a decimal: {e}")))
}

fn as_u32(v: &Value, path: &str) -> EngineResult<u32> {
    v.as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| schema_err(path, "expected a non-negative integer"))
}

fn as_bool(v: &Value, path: &str) -> EngineResult<bool> {
    v.as_bool().ok_or_else(|| schema_err(path, "expected a boolean"))
}

fn as_date(v: &Value, path: &str) -> EngineResult<chrono::NaiveDate> {
    let s = as_str(v, path)?;
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| schema_err(path, format!("invalid date '{s}': {e}")))
}

fn compile(src: &str, path: &str) -> EngineResult<CompiledExpr> {
    CompiledExpr::parse(src).map_err(|e| EngineError::Evaluation {
        expression: format!("{path}: {src}"),
        source: e,
    })
}

/// Load and validate a deal description. `raw` is already-parsed JSON (the
/// CLI's input layer converts YAML to JSON before handing it here).
pub fn load(raw: &Value) -> EngineResult<DealDefinition> {
    let meta = load_meta(field(raw, "meta", "$")?)?;
    let dates = load_dates(field(raw, "dates", "$")?)?;
    let collateral = load_collateral(field(raw, "collateral", "$")?)?;

    let funds = load_funds(raw.get("funds"))?;
    let bonds = load_bonds(field(raw, "bonds", "$")?)?;
    let ledgers = load_ledgers(raw.get("ledgers"));
    let variables = load_variables(raw.get("variables"))?;
    let tests = load_tests(raw.get("tests"))?;
    let waterfalls = load_waterfalls(field(raw, "waterfalls", "$")?)?;
    let clean_up_call_rule = raw
        .get("clean_up_call_rule")
        .map(|v| compile(as_str(v, "$.clean_up_call_rule")?, "$.clean_up_call_rule"))
        .transpose()?;

    let def = DealDefinition {
        meta,
        dates,
        collateral,
        bonds,
        funds,
        ledgers,
        variables,
        tests,
        waterfalls,
        clean_up_call_rule,
    };

    validate_semantics(&def)?;
    Ok(def)
}

fn load_meta(v: &Value) -> EngineResult<DealMeta> {
    Ok(DealMeta {
        deal_id: as_str(field(v, "deal_id", "$.meta")?, "$.meta.deal_id")?.to_string(),
        deal_name: as_str(field(v, "deal_name", "$.meta")?, "$.meta.deal_name")?.to_string(),
        asset_class: as_str(field(v, "asset_class", "$.meta")?, "$.meta.asset_class")?.to_string(),
        version: as_str(field(v, "version", "$.meta")?, "$.meta.version")?.to_string(),
        currency: v
            .get("currency")
            .map(|c| as_str(c, "$.meta.currency").map(str::to_string))
            .transpose()?
            .unwrap_or_else(|| "USD".to_string()),
    })
}

fn load_dates(v: &Value) -> EngineResult<DealDates> {
    let freq = match as_str(field(v, "payment_frequency", "$.dates")?, "$.dates.payment_frequency")? {
        "MONTHLY" => PaymentFrequency::Monthly,
        "QUARTERLY" => PaymentFrequency::Quarterly,
        "SEMI_ANNUAL" => PaymentFrequency::SemiAnnual,
        "ANNUAL" => PaymentFrequency::Annual,
        other => {
            return Err(schema_err(
                "$.dates.payment_frequency",
                format!("unknown payment frequency '{other}'"),
            ))
        }
    };
    Ok(DealDates {
        cutoff_date: as_date(field(v, "cutoff_date", "$.dates")?, "$.dates.cutoff_date")?,
        closing_date: as_date(field(v, "closing_date", "$.dates")?, "$.dates.closing_date")?,
        first_payment_date: as_date(
            field(v, "first_payment_date", "$.dates")?,
            "$.dates.first_payment_date",
        )?,
        maturity_date: as_date(field(v, "maturity_date", "$.dates")?, "$.dates.maturity_date")?,
        payment_frequency: freq,
    })
}

fn load_collateral(v: &Value) -> EngineResult<CollateralMeta> {
    Ok(CollateralMeta {
        original_balance: as_decimal(
            field(v, "original_balance", "$.collateral")?,
            "$.collateral.original_balance",
        )?,
        current_balance: as_decimal(
            field(v, "current_balance", "$.collateral")?,
            "$.collateral.current_balance",
        )?,
        wac: as_decimal(field(v, "wac", "$.collateral")?, "$.collateral.wac")?,
        wam: as_u32(field(v, "wam", "$.collateral")?, "$.collateral.wam")?,
        loan_count: v
            .get("loan_count")
            .map(|c| as_u32(c, "$.collateral.loan_count"))
            .transpose()?
            .unwrap_or(0),
    })
}

fn load_funds(v: Option<&Value>) -> EngineResult<HashMap<String, FundDef>> {
    let mut out = HashMap::new();
    let Some(v) = v else { return Ok(out) };
    for (i, item) in as_arr(v, "$.funds")?.iter().enumerate() {
        let path = format!("$.funds[{i}]");
        let id = as_str(field(item, "id", &path)?, &format!("{path}.id"))?.to_string();
        let description = item
            .get("description")
            .map(|d| as_str(d, &format!("{path}.description")).map(str::to_string))
            .transpose()?
            .unwrap_or_default();
        let target_balance_rule = item
            .get("target_balance_rule")
            .map(|r| compile(as_str(r, &format!("{path}.target_balance_rule"))?, &path))
            .transpose()?;
        out.insert(
            id.clone(),
            FundDef {
                id,
                description,
                target_balance_rule,
            },
        );
    }
    Ok(out)
}

fn load_bonds(v: &Value) -> EngineResult<HashMap<String, BondDef>> {
    let mut out = HashMap::new();
    for (i, item) in as_arr(v, "$.bonds")?.iter().enumerate() {
        let path = format!("$.bonds[{i}]");
        let id = as_str(field(item, "id", &path)?, &format!("{path}.id"))?.to_string();
        let original_balance = as_decimal(
            field(item, "original_balance", &path)?,
            &format!("{path}.original_balance"),
        )?;

        let coupon_path = format!("{path}.coupon");
        let coupon_v = field(item, "coupon", &path)?;
        let kind_str = as_str(field(coupon_v, "kind", &coupon_path)?, &format!("{coupon_path}.kind"))?;
        let kind = match kind_str {
            "FIXED" => CouponKind::Fixed,
            "FLOAT" => CouponKind::Float,
            "WAC" => CouponKind::Wac,
            "VARIABLE" => CouponKind::Variable,
            other => {
                return Err(schema_err(
                    format!("{coupon_path}.kind"),
                    format!("unknown coupon kind '{other}'"),
                ))
            }
        };
        let fixed_rate = coupon_v
            .get("fixed_rate")
            .map(|r| as_decimal(r, &format!("{coupon_path}.fixed_rate")))
            .transpose()?;
        let index = coupon_v
            .get("index")
            .map(|r| as_str(r, &format!("{coupon_path}.index")).map(str::to_string))
            .transpose()?;
        let margin = coupon_v
            .get("margin")
            .map(|r| as_decimal(r, &format!("{coupon_path}.margin")))
            .transpose()?;
        let cap_ref = coupon_v
            .get("cap_ref")
            .map(|r| as_str(r, &format!("{coupon_path}.cap_ref")).map(str::to_string))
            .transpose()?;

        let priority_v = field(item, "priority", &path)?;
        let interest_priority = as_u32(
            field(priority_v, "interest", &format!("{path}.priority"))?,
            &format!("{path}.priority.interest"),
        )?;
        let principal_priority = as_u32(
            field(priority_v, "principal", &format!("{path}.priority"))?,
            &format!("{path}.priority.principal"),
        )?;

        let group_tag = item
            .get("group_tag")
            .map(|g| as_str(g, &format!("{path}.group_tag")).map(str::to_string))
            .transpose()?;
        let loss_absorption_rank = item
            .get("loss_absorption_rank")
            .map(|r| as_u32(r, &format!("{path}.loss_absorption_rank")))
            .transpose()?
            .unwrap_or(0);

        out.insert(
            id.clone(),
            BondDef {
                id,
                original_balance,
                coupon: Coupon {
                    kind,
                    fixed_rate,
                    index,
                    margin,
                    cap_ref,
                },
                interest_priority,
                principal_priority,
                group_tag,
                loss_absorption_rank,
            },
        );
    }
    Ok(out)
}

fn load_ledgers(v: Option<&Value>) -> Vec<String> {
    let mut out: Vec<String> = v
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|x| x.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    for default_ledger in ["CumulativeLoss", "CumulativePrepayment"] {
        if !out.iter().any(|l| l == default_ledger) {
            out.push(default_ledger.to_string());
        }
    }
    out
}

fn load_variables(v: Option<&Value>) -> EngineResult<Vec<VariableDef>> {
    let mut out = Vec::new();
    let Some(v) = v else { return Ok(out) };
    let obj = as_obj(v, "$.variables")?;
    for (name, rule) in obj {
        let path = format!("$.variables.{name}");
        let expression = compile(as_str(rule, &path)?, &path)?;
        out.push(VariableDef {
            name: name.clone(),
            expression,
        });
    }
    Ok(out)
}

fn load_tests(v: Option<&Value>) -> EngineResult<Vec<TestDef>> {
    let mut out = Vec::new();
    let Some(v) = v else { return Ok(out) };
    for (i, item) in as_arr(v, "$.tests")?.iter().enumerate() {
        let path = format!("$.tests[{i}]");
        let id = as_str(field(item, "id", &path)?, &format!("{path}.id"))?.to_string();
        let kind = item
            .get("kind")
            .map(|k| as_str(k, &format!("{path}.kind")).map(str::to_string))
            .transpose()?
            .unwrap_or_default();
        let value_rule = compile(
            as_str(field(item, "value_rule", &path)?, &format!("{path}.value_rule"))?,
            &path,
        )?;
        let threshold_rule = compile(
            as_str(
                field(item, "threshold_rule", &path)?,
                &format!("{path}.threshold_rule"),
            )?,
            &path,
        )?;
        let comparator = match as_str(
            field(item, "comparator", &path)?,
            &format!("{path}.comparator"),
        )? {
            "VALUE_LT_THRESHOLD" => Comparator::Lt,
            "VALUE_LEQ_THRESHOLD" => Comparator::Le,
            "VALUE_GT_THRESHOLD" => Comparator::Gt,
            "VALUE_GEQ_THRESHOLD" => Comparator::Ge,
            "VALUE_EQ_THRESHOLD" => Comparator::Eq,
            "VALUE_NEQ_THRESHOLD" => Comparator::Ne,
            other => {
                return Err(schema_err(
                    format!("{path}.comparator"),
                    format!("unknown comparator '{other}'"),
                ))
            }
        };
        let cure_periods = item
            .get("cure_periods")
            .map(|c| as_u32(c, &format!("{path}.cure_periods")))
            .transpose()?
            .unwrap_or(0);
        let effects = load_effects(item.get("effects"), &path)?;
        out.push(TestDef {
            id,
            kind,
            value_rule,
            threshold_rule,
            comparator,
            cure_periods,
            effects,
        });
    }
    Ok(out)
}

fn load_effects(v: Option<&Value>, path: &str) -> EngineResult<Vec<Effect>> {
    let mut out = Vec::new();
    let Some(v) = v else { return Ok(out) };
    for (i, item) in as_arr(v, &format!("{path}.effects"))?.iter().enumerate() {
        let effect_path = format!("{path}.effects[{i}]");
        let kind = as_str(field(item, "kind", &effect_path)?, &format!("{effect_path}.kind"))?;
        let effect = match kind {
            "set_flag" => Effect::SetFlag {
                flag: as_str(
                    field(item, "flag", &effect_path)?,
                    &format!("{effect_path}.flag"),
                )?
                .to_string(),
                value: as_bool(
                    field(item, "value", &effect_path)?,
                    &format!("{effect_path}.value"),
                )?,
            },
            "set_variable" => Effect::SetVariable {
                name: as_str(
                    field(item, "name", &effect_path)?,
                    &format!("{effect_path}.name"),
                )?
                .to_string(),
                value_rule: compile(
                    as_str(
                        field(item, "value_rule", &effect_path)?,
                        &format!("{effect_path}.value_rule"),
                    )?,
                    &effect_path,
                )?,
            },
            "redirect" => Effect::Redirect {
                target: as_str(
                    field(item, "target", &effect_path)?,
                    &format!("{effect_path}.target"),
                )?
                .to_string(),
            },
            other => {
                return Err(schema_err(
                    format!("{effect_path}.kind"),
                    format!("unknown effect kind '{other}'"),
                ))
            }
        };
        out.push(effect);
    }
    Ok(out)
}

fn load_waterfalls(v: &Value) -> EngineResult<Waterfalls> {
    let interest = load_steps(v.get("interest"), "$.waterfalls.interest")?;
    let principal = load_steps(v.get("principal"), "$.waterfalls.principal")?;
    let la_path = "$.waterfalls.loss_allocation";
    let la_v = field(v, "loss_allocation", "$.waterfalls")?;
    let write_down_order = as_arr(
        field(la_v, "write_down_order", la_path)?,
        &format!("{la_path}.write_down_order"),
    )?
    .iter()
    .enumerate()
    .map(|(i, x)| as_str(x, &format!("{la_path}.write_down_order[{i}]")).map(str::to_string))
    .collect::<EngineResult<Vec<String>>>()?;
    let loss_source_rule = compile(
        as_str(
            field(la_v, "loss_source_rule", la_path)?,
            &format!("{la_path}.loss_source_rule"),
        )?,
        la_path,
    )?;
    let overflow_ledger_id = la_v
        .get("overflow_ledger_id")
        .map(|x| as_str(x, &format!("{la_path}.overflow_ledger_id")).map(str::to_string))
        .transpose()?;

    Ok(Waterfalls {
        interest,
        principal,
        loss_allocation: LossAllocation {
            write_down_order,
            loss_source_rule,
            overflow_ledger_id,
        },
    })
}

fn load_steps(v: Option<&Value>, path: &str) -> EngineResult<Vec<Step>> {
    let mut out = Vec::new();
    let Some(v) = v else { return Ok(out) };
    let steps_v = field(v, "steps", path)?;
    for (i, item) in as_arr(steps_v, &format!("{path}.steps"))?.iter().enumerate() {
        let step_path = format!("{path}.steps[{i}]");
        let id = item
            .get("id")
            .map(|x| as_str(x, &format!("{step_path}.id")).map(str::to_string))
            .transpose()?
            .unwrap_or_else(|| i.to_string());
        let action = match as_str(
            field(item, "action", &step_path)?,
            &format!("{step_path}.action"),
        )? {
            "PAY_BOND_INTEREST" => StepAction::PayBondInterest,
            "PAY_BOND_PRINCIPAL" => StepAction::PayBondPrincipal,
            "PAY_FEE" => StepAction::PayFee,
            "TRANSFER_FUND" => StepAction::TransferFund,
            "DEPOSIT" => StepAction::Deposit,
            other => {
                return Err(schema_err(
                    format!("{step_path}.action"),
                    format!("unknown action '{other}'"),
                ))
            }
        };
        let from_fund = as_str(
            field(item, "from_fund", &step_path)?,
            &format!("{step_path}.from_fund"),
        )?
        .to_string();
        let to = item
            .get("to")
            .map(|x| as_str(x, &format!("{step_path}.to")).map(str::to_string))
            .transpose()?;
        let group = item
            .get("group")
            .map(|x| as_str(x, &format!("{step_path}.group")).map(str::to_string))
            .transpose()?;
        let amount_rule_str = as_str(
            field(item, "amount_rule", &step_path)?,
            &format!("{step_path}.amount_rule"),
        )?;
        let amount_rule = match amount_rule_str {
            "ALL" => AmountRule::All,
            "REMAINING" => AmountRule::Remaining,
            other => AmountRule::Expr(compile(other, &format!("{step_path}.amount_rule"))?),
        };
        let condition = compile(
            item.get("condition")
                .map(|x| as_str(x, &format!("{step_path}.condition")))
                .transpose()?
                .unwrap_or("true"),
            &format!("{step_path}.condition"),
        )?;
        let unpaid_ledger_id = item
            .get("unpaid_ledger_id")
            .map(|x| as_str(x, &format!("{step_path}.unpaid_ledger_id")).map(str::to_string))
            .transpose()?;

        out.push(Step {
            id,
            action,
            from_fund,
            to,
            group,
            amount_rule,
            condition,
            unpaid_ledger_id,
        });
    }
    Ok(out)
}

/// Semantic validation per spec.md §4.1 items (a)-(g). Collects every
/// violation before returning so a deal author sees the full picture in one
/// pass, matching `rmbs_loader.py::_validate_semantics`.
fn validate_semantics(def: &DealDefinition) -> EngineResult<()> {
    let mut errors = Vec::new();

    let valid_funds: HashSet<&str> = def.funds.keys().map(String::as_str).collect();
    let valid_bonds: HashSet<&str> = def.bonds.keys().map(String::as_str).collect();
    let valid_ledgers: HashSet<&str> = def.ledgers.iter().map(String::as_str).collect();
    let valid_vars: HashSet<&str> = def.variables.iter().map(|v| v.name.as_str()).collect();
    let valid_tests: HashSet<&str> = def.tests.iter().map(|t| t.id.as_str()).collect();

    // (g) coupon kinds requiring cap_ref name an existing variable.
    for bond in def.bonds.values() {
        if let Some(cap_ref) = &bond.coupon.cap_ref {
            if !valid_vars.contains(cap_ref.as_str()) {
                errors.push(format!(
                    "bond '{}' references undefined variable cap '{cap_ref}'",
                    bond.id
                ));
            }
        }
        if matches!(bond.coupon.kind, CouponKind::Wac | CouponKind::Variable)
            && bond.coupon.cap_ref.is_none()
            && bond.coupon.fixed_rate.is_none()
        {
            errors.push(format!(
                "bond '{}' has coupon kind {:?} but no cap_ref or fixed_rate",
                bond.id, bond.coupon.kind
            ));
        }
    }

    // (a),(c): from_fund/to resolve to declared funds.
    for (section, steps) in [
        ("interest", &def.waterfalls.interest),
        ("principal", &def.waterfalls.principal),
    ] {
        for step in steps {
            if !valid_funds.contains(step.from_fund.as_str()) {
                errors.push(format!(
                    "waterfalls.{section}.{}: from_fund '{}' is not a declared fund",
                    step.id, step.from_fund
                ));
            }
            if step.action == StepAction::TransferFund {
                match &step.to {
                    Some(to) if valid_funds.contains(to.as_str()) => {}
                    Some(to) => errors.push(format!(
                        "waterfalls.{section}.{}: transfer target '{to}' is not a declared fund",
                        step.id
                    )),
                    None => errors.push(format!(
                        "waterfalls.{section}.{}: TRANSFER_FUND step missing 'to'",
                        step.id
                    )),
                }
            }
            // (b): group in PAY_BOND_* resolves to a declared bond.
            if matches!(step.action, StepAction::PayBondInterest | StepAction::PayBondPrincipal) {
                match &step.group {
                    Some(g) if valid_bonds.contains(g.as_str()) => {}
                    Some(g) => errors.push(format!(
                        "waterfalls.{section}.{}: group '{g}' is not a declared bond",
                        step.id
                    )),
                    None => errors.push(format!(
                        "waterfalls.{section}.{}: PAY_BOND_* step missing 'group'",
                        step.id
                    )),
                }
            }
            if let Some(ledger_id) = &step.unpaid_ledger_id {
                if !valid_ledgers.contains(ledger_id.as_str()) {
                    errors.push(format!(
                        "waterfalls.{section}.{}: unpaid_ledger_id '{ledger_id}' is not a declared ledger",
                        step.id
                    ));
                }
            }
        }
    }

    // (e): write_down_order is a subset of declared bonds.
    for bond_id in &def.waterfalls.loss_allocation.write_down_order {
        if !valid_bonds.contains(bond_id.as_str()) {
            errors.push(format!(
                "waterfalls.loss_allocation.write_down_order: '{bond_id}' is not a declared bond"
            ));
        }
    }
    if let Some(overflow) = &def.waterfalls.loss_allocation.overflow_ledger_id {
        if !valid_ledgers.contains(overflow.as_str()) {
            errors.push(format!(
                "waterfalls.loss_allocation.overflow_ledger_id '{overflow}' is not a declared ledger"
            ));
        }
    }

    // (f): variable declarations form a DAG in declaration order (no
    // forward reference). We check this by tracking which variable names
    // have been "declared so far" and scanning each expression's free
    // identifiers for references to variables declared later.
    let declared_order: Vec<&str> = def.variables.iter().map(|v| v.name.as_str()).collect();
    for (idx, var) in def.variables.iter().enumerate() {
        let later: HashSet<&str> = declared_order[idx + 1..].iter().copied().collect();
        for ident in free_identifiers(&var.expression) {
            if later.contains(ident.as_str()) {
                errors.push(format!(
                    "variable '{}' forward-references variable '{ident}' declared later",
                    var.name
                ));
            }
        }
    }

    // (d): every identifier referenced in any expression resolves to a
    // declared fund, bond, ledger, test, or known collateral attribute —
    // checked statically at load time, independent of the runtime
    // `funds_missing_policy`/`bonds_missing_policy` default-to-zero
    // behavior (spec.md lines 97/234 draw this as a separate, load-time
    // phase from the `NameError` a bare unresolved identifier can still
    // raise during evaluation).
    for test in &def.tests {
        for effect in &test.effects {
            if let Effect::Redirect { target } = effect {
                if !valid_funds.contains(target.as_str())
                    && !valid_tests.contains(target.as_str())
                {
                    errors.push(format!(
                        "test '{}' redirect target '{target}' is not a declared fund or test",
                        test.id
                    ));
                }
            }
        }
    }

    let scopes = ScopeSets {
        funds: &valid_funds,
        bonds: &valid_bonds,
        ledgers: &valid_ledgers,
        tests: &valid_tests,
    };

    for var in &def.variables {
        check_scoped_refs(&format!("variables.{}", var.name), &var.expression, &scopes, &mut errors);
    }
    for test in &def.tests {
        check_scoped_refs(&format!("tests.{}.value_rule", test.id), &test.value_rule, &scopes, &mut errors);
        check_scoped_refs(
            &format!("tests.{}.threshold_rule", test.id),
            &test.threshold_rule,
            &scopes,
            &mut errors,
        );
        for effect in &test.effects {
            if let Effect::SetVariable { value_rule, .. } = effect {
                check_scoped_refs(&format!("tests.{}.effects", test.id), value_rule, &scopes, &mut errors);
            }
        }
    }
    for (section, steps) in [
        ("interest", &def.waterfalls.interest),
        ("principal", &def.waterfalls.principal),
    ] {
        for step in steps {
            let path = format!("waterfalls.{section}.{}", step.id);
            check_scoped_refs(&format!("{path}.condition"), &step.condition, &scopes, &mut errors);
            if let AmountRule::Expr(expr) = &step.amount_rule {
                check_scoped_refs(&format!("{path}.amount_rule"), expr, &scopes, &mut errors);
            }
        }
    }
    check_scoped_refs(
        "waterfalls.loss_allocation.loss_source_rule",
        &def.waterfalls.loss_allocation.loss_source_rule,
        &scopes,
        &mut errors,
    );
    if let Some(rule) = &def.clean_up_call_rule {
        check_scoped_refs("clean_up_call_rule", rule, &scopes, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(logic_err(errors.join("\n")))
    }
}

/// The declared-id sets a scoped member access (`funds.X`, `bonds.X.attr`, …)
/// is checked against.
struct ScopeSets<'a> {
    funds: &'a HashSet<&'a str>,
    bonds: &'a HashSet<&'a str>,
    ledgers: &'a HashSet<&'a str>,
    tests: &'a HashSet<&'a str>,
}

/// Bond attributes the evaluator resolves (`EvalContext::bond_attr`,
/// state.rs).
const BOND_ATTRS: [&str; 4] = ["balance", "factor", "shortfall", "original"];
/// Collateral attributes the evaluator resolves (`EvalContext::
/// collateral_attr`, state.rs).
const COLLATERAL_ATTRS: [&str; 3] = ["current_balance", "original_balance", "wac"];

/// Walks every `Member`/`MemberAttr` node in `expr` and checks its scope and
/// name (and attr, for `MemberAttr`) against the deal's declared ids.
fn check_scoped_refs(path: &str, expr: &CompiledExpr, scopes: &ScopeSets, errors: &mut Vec<String>) {
    for node in scoped_refs(expr) {
        match node {
            ScopedRef::Member { scope, name } => match scope.as_str() {
                "funds" if !scopes.funds.contains(name.as_str()) => {
                    errors.push(format!("{path}: funds.{name} is not a declared fund"))
                }
                "ledgers" if !scopes.ledgers.contains(name.as_str()) => {
                    errors.push(format!("{path}: ledgers.{name} is not a declared ledger"))
                }
                "collateral" if !COLLATERAL_ATTRS.contains(&name.as_str()) => {
                    errors.push(format!("{path}: collateral.{name} is not a known collateral attribute"))
                }
                "funds" | "ledgers" | "collateral" => {}
                other => errors.push(format!("{path}: unknown scope '{other}' in '{other}.{name}'")),
            },
            ScopedRef::MemberAttr { scope, name, attr } => match scope.as_str() {
                "bonds" if !scopes.bonds.contains(name.as_str()) => {
                    errors.push(format!("{path}: bonds.{name} is not a declared bond"))
                }
                "bonds" if !BOND_ATTRS.contains(&attr.as_str()) => {
                    errors.push(format!("{path}: bonds.{name}.{attr} is not a known bond attribute"))
                }
                "tests" if !scopes.tests.contains(name.as_str()) => {
                    errors.push(format!("{path}: tests.{name} is not a declared test"))
                }
                "tests" if attr != "failed" => {
                    errors.push(format!("{path}: tests.{name}.{attr} is not a known test attribute"))
                }
                "bonds" | "tests" => {}
                other => errors.push(format!("{path}: unknown scope '{other}' in '{other}.{name}.{attr}'")),
            },
        }
    }
}

enum ScopedRef {
    Member { scope: String, name: String },
    MemberAttr { scope: String, name: String, attr: String },
}

/// Collects every `Member`/`MemberAttr` node referenced by an expression.
fn scoped_refs(expr: &CompiledExpr) -> Vec<ScopedRef> {
    fn walk(e: &crate::expr::Expr, out: &mut Vec<ScopedRef>) {
        use crate::expr::Expr;
        match e {
            Expr::Member { scope, name } => out.push(ScopedRef::Member {
                scope: scope.clone(),
                name: name.clone(),
            }),
            Expr::MemberAttr { scope, name, attr } => out.push(ScopedRef::MemberAttr {
                scope: scope.clone(),
                name: name.clone(),
                attr: attr.clone(),
            }),
            Expr::Ident(_) | Expr::Number(_) | Expr::Bool(_) => {}
            Expr::Unary { expr, .. } => walk(expr, out),
            Expr::Binary { lhs, rhs, .. } => {
                walk(lhs, out);
                walk(rhs, out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    walk(a, out);
                }
            }
        }
    }
    let mut out = Vec::new();
    walk(expr.ast(), &mut out);
    out
}

/// Collects bare identifier names referenced by an expression (used only
/// for the forward-reference check above; scoped member accesses such as
/// `funds.X` are intentionally excluded since those never name a variable).
fn free_identifiers(expr: &CompiledExpr) -> Vec<String> {
    fn walk(e: &crate::expr::Expr, out: &mut Vec<String>) {
        use crate::expr::Expr;
        match e {
            Expr::Ident(name) => out.push(name.clone()),
            Expr::Member { .. } | Expr::MemberAttr { .. } => {}
            Expr::Number(_) | Expr::Bool(_) => {}
            Expr::Unary { expr, .. } => walk(expr, out),
            Expr::Binary { lhs, rhs, .. } => {
                walk(lhs, out);
                walk(rhs, out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    walk(a, out);
                }
            }
        }
    }
    let mut out = Vec::new();
    walk(expr.ast(), &mut out);
    out
}
