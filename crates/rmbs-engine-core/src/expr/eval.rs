use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::context::{EvalContext, MissingPolicy};
use super::parser::Parser;
use crate::error::EvalError;
use crate::types::Value;

/// A parsed expression, ready to be evaluated against any `EvalContext`.
/// Parsing is done once; the Loader (C2) parses every rule at load time and
/// the Waterfall Runner / Variable evaluator hold on to the `CompiledExpr`
/// rather than re-parsing the source string every period (spec §9).
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    ast: Expr,
}

impl CompiledExpr {
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let ast = Parser::parse(source)?;
        Ok(CompiledExpr {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Exposes the parsed tree for static analysis (the Loader's
    /// forward-reference check). Not for evaluation call sites.
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn eval(&self, ctx: &dyn EvalContext) -> Result<Value, EvalError> {
        eval_expr(&self.ast, ctx)
    }

    /// Boolean coercion per spec §4.2: "true"/"false" short-circuit, a
    /// numeric result is truthy iff strictly > 0.
    pub fn eval_condition(&self, ctx: &dyn EvalContext) -> Result<bool, EvalError> {
        match self.source.trim().to_ascii_lowercase().as_str() {
            "true" => return Ok(true),
            "false" => return Ok(false),
            _ => {}
        }
        Ok(self.eval(ctx)?.truthy())
    }
}

/// One-shot evaluation convenience for call sites that do not cache the AST.
pub fn evaluate(source: &str, ctx: &dyn EvalContext) -> Result<Value, EvalError> {
    CompiledExpr::parse(source)?.eval(ctx)
}

pub fn evaluate_condition(source: &str, ctx: &dyn EvalContext) -> Result<bool, EvalError> {
    CompiledExpr::parse(source)?.eval_condition(ctx)
}

fn eval_expr(expr: &Expr, ctx: &dyn EvalContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),

        Expr::Ident(name) => {
            // Per spec §4.2: a previously-computed variable takes precedence
            // over a same-named fund/bare id (matches the prototype's
            // evaluation-context construction order).
            if let Some(v) = ctx.variable(name) {
                return Ok(v);
            }
            if let Some(bal) = ctx.fund_balance(name) {
                return Ok(Value::Number(bal));
            }
            match ctx.funds_missing_policy() {
                MissingPolicy::Zero => Ok(Value::Number(Decimal::ZERO)),
                MissingPolicy::Error => Err(EvalError::NameError(name.clone())),
            }
        }

        Expr::Member { scope, name } => match scope.as_str() {
            "funds" => match ctx.fund_balance(name) {
                Some(v) => Ok(Value::Number(v)),
                None => match ctx.funds_missing_policy() {
                    MissingPolicy::Zero => Ok(Value::Number(Decimal::ZERO)),
                    MissingPolicy::Error => {
                        Err(EvalError::NameError(format!("funds.{name}")))
                    }
                },
            },
            "ledgers" => Ok(Value::Number(ctx.ledger_value(name).unwrap_or(Decimal::ZERO))),
            "collateral" => ctx
                .collateral_attr(name)
                .map(Value::Number)
                .ok_or_else(|| EvalError::NameError(format!("collateral.{name}"))),
            other => Err(EvalError::NameError(format!("{other}.{name}"))),
        },

        Expr::MemberAttr { scope, name, attr } => match scope.as_str() {
            "bonds" => match ctx.bond_attr(name, attr) {
                Some(v) => Ok(Value::Number(v)),
                None => match ctx.bonds_missing_policy() {
                    MissingPolicy::Zero => Ok(Value::Number(Decimal::ZERO)),
                    MissingPolicy::Error => {
                        Err(EvalError::NameError(format!("bonds.{name}.{attr}")))
                    }
                },
            },
            "tests" if attr == "failed" => Ok(Value::Bool(ctx.test_failed(name).unwrap_or(false))),
            other => Err(EvalError::NameError(format!("{other}.{name}.{attr}"))),
        },

        Expr::Unary { op, expr } => {
            let v = eval_expr(expr, ctx)?;
            match op {
                UnaryOp::Neg => Ok(Value::Number(-expect_number(&v, "unary -")?)),
                UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
            }
        }

        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, ctx),

        Expr::Call { name, args } => eval_call(name, args, ctx),
    }
}

fn expect_number(v: &Value, context: &str) -> Result<Decimal, EvalError> {
    match v {
        Value::Number(n) => Ok(*n),
        Value::Bool(_) => Err(EvalError::TypeError {
            context: context.to_string(),
            reason: "expected a number, found a boolean".into(),
        }),
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &dyn EvalContext,
) -> Result<Value, EvalError> {
    // Short-circuit logical operators.
    if op == BinaryOp::And {
        let l = eval_expr(lhs, ctx)?;
        if !l.truthy() {
            return Ok(Value::Bool(false));
        }
        let r = eval_expr(rhs, ctx)?;
        return Ok(Value::Bool(r.truthy()));
    }
    if op == BinaryOp::Or {
        let l = eval_expr(lhs, ctx)?;
        if l.truthy() {
            return Ok(Value::Bool(true));
        }
        let r = eval_expr(rhs, ctx)?;
        return Ok(Value::Bool(r.truthy()));
    }

    let l = eval_expr(lhs, ctx)?;
    let r = eval_expr(rhs, ctx)?;

    match op {
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(&l, &r))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(&l, &r))),
        _ => {}
    }

    let ln = expect_number(&l, "binary operand")?;
    let rn = expect_number(&r, "binary operand")?;

    match op {
        BinaryOp::Add => Ok(Value::Number(ln + rn)),
        BinaryOp::Sub => Ok(Value::Number(ln - rn)),
        BinaryOp::Mul => Ok(Value::Number(ln * rn)),
        BinaryOp::Div => {
            if rn.is_zero() {
                Err(EvalError::DivisionByZero {
                    context: "/".into(),
                })
            } else {
                Ok(Value::Number(ln / rn))
            }
        }
        BinaryOp::Mod => {
            if rn.is_zero() {
                Err(EvalError::DivisionByZero {
                    context: "%".into(),
                })
            } else {
                Ok(Value::Number(ln % rn))
            }
        }
        BinaryOp::Lt => Ok(Value::Bool(ln < rn)),
        BinaryOp::Le => Ok(Value::Bool(ln <= rn)),
        BinaryOp::Gt => Ok(Value::Bool(ln > rn)),
        BinaryOp::Ge => Ok(Value::Bool(ln >= rn)),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => unreachable!(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => a.as_number() == b.as_number(),
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &dyn EvalContext) -> Result<Value, EvalError> {
    let values: Result<Vec<Decimal>, EvalError> = args
        .iter()
        .map(|a| eval_expr(a, ctx).and_then(|v| expect_number(&v, name)))
        .collect();
    let values = values?;

    match name {
        "MIN" => values
            .into_iter()
            .reduce(Decimal::min)
            .map(Value::Number)
            .ok_or_else(|| arity_error(name)),
        "MAX" => values
            .into_iter()
            .reduce(Decimal::max)
            .map(Value::Number)
            .ok_or_else(|| arity_error(name)),
        "ABS" => one_arg(name, &values).map(|v| Value::Number(v.abs())),
        "FLOOR" => one_arg(name, &values).map(|v| Value::Number(v.floor())),
        "CEIL" => one_arg(name, &values).map(|v| Value::Number(v.ceil())),
        "SUM" => Ok(Value::Number(values.into_iter().sum())),
        "ROUND" => match values.len() {
            1 => Ok(Value::Number(values[0].round())),
            2 => {
                let places = values[1].to_u32().ok_or_else(|| EvalError::TypeError {
                    context: "ROUND".into(),
                    reason: "decimal places argument must be a non-negative integer".into(),
                })?;
                Ok(Value::Number(values[0].round_dp(places)))
            }
            _ => Err(arity_error(name)),
        },
        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

fn one_arg(name: &str, values: &[Decimal]) -> Result<Decimal, EvalError> {
    match values {
        [v] => Ok(*v),
        _ => Err(arity_error(name)),
    }
}

fn arity_error(name: &str) -> EvalError {
    EvalError::TypeError {
        context: name.to_string(),
        reason: "wrong number of arguments".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::context::MissingPolicy;
    use std::collections::HashMap;

    struct FakeCtx {
        funds: HashMap<String, Decimal>,
        vars: HashMap<String, Value>,
    }

    impl EvalContext for FakeCtx {
        fn fund_balance(&self, id: &str) -> Option<Decimal> {
            self.funds.get(id).copied()
        }
        fn bond_attr(&self, _id: &str, _attr: &str) -> Option<Decimal> {
            None
        }
        fn ledger_value(&self, _id: &str) -> Option<Decimal> {
            None
        }
        fn test_failed(&self, _id: &str) -> Option<bool> {
            None
        }
        fn collateral_attr(&self, _attr: &str) -> Option<Decimal> {
            None
        }
        fn variable(&self, name: &str) -> Option<Value> {
            self.vars.get(name).copied()
        }
        fn funds_missing_policy(&self) -> MissingPolicy {
            MissingPolicy::Zero
        }
        fn bonds_missing_policy(&self) -> MissingPolicy {
            MissingPolicy::Zero
        }
    }

    fn ctx() -> FakeCtx {
        let mut funds = HashMap::new();
        funds.insert("IAF".to_string(), Decimal::new(6000, 2));
        FakeCtx {
            funds,
            vars: HashMap::new(),
        }
    }

    #[test]
    fn evaluates_arithmetic() {
        let c = ctx();
        let v = evaluate("1 + 2 * 3", &c).unwrap();
        assert_eq!(v, Value::Number(Decimal::from(7)));
    }

    #[test]
    fn bare_id_resolves_to_fund_balance() {
        let c = ctx();
        let v = evaluate("IAF", &c).unwrap();
        assert_eq!(v, Value::Number(Decimal::new(6000, 2)));
    }

    #[test]
    fn unknown_fund_is_zero_by_default() {
        let c = ctx();
        let v = evaluate("funds.NOPE", &c).unwrap();
        assert_eq!(v, Value::Number(Decimal::ZERO));
    }

    #[test]
    fn division_by_zero_errors() {
        let c = ctx();
        let err = evaluate("1 / 0", &c).unwrap_err();
        assert!(matches!(err, EvalError::DivisionByZero { .. }));
    }

    #[test]
    fn condition_numeric_truthiness() {
        let c = ctx();
        assert!(evaluate_condition("1", &c).unwrap());
        assert!(!evaluate_condition("0", &c).unwrap());
    }

    #[test]
    fn min_max_builtin() {
        let c = ctx();
        assert_eq!(
            evaluate("MIN(3, 1, 2)", &c).unwrap(),
            Value::Number(Decimal::from(1))
        );
        assert_eq!(
            evaluate("MAX(3, 1, 2)", &c).unwrap(),
            Value::Number(Decimal::from(3))
        );
    }
}
