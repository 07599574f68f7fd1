use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// A parsed expression. Member-access nodes resolve to one of the closed
/// set of logical scopes (`funds`, `bonds`, `ledgers`, `tests`, `collateral`)
/// at evaluation time; a bare `Ident` may name a fund/top-level id or a
/// previously-declared variable (spec §4.2).
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(Decimal),
    Bool(bool),
    Ident(String),
    /// `scope.name` (e.g. `funds.IAF`, `ledgers.CumulativeLoss`)
    Member { scope: String, name: String },
    /// `scope.name.attr` (e.g. `bonds.A1.balance`, `tests.T1.failed`)
    MemberAttr {
        scope: String,
        name: String,
        attr: String,
    },
    Call { name: String, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}
