// src/query/mod.rs
//
// Filter language for the federated catalog.
// A query is a conjunction of `operand operator operand` clauses joined by
// `and` or `&`; the compiler turns text into clauses and the matcher
// evaluates them against a flattened offer record.

pub mod compiler;
pub mod matcher;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use compiler::compile;
pub use matcher::{fold_case, matches};

// =============================================================================
// Clause Types
// =============================================================================

/// Comparison operators understood by the filter language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    StartsWith,
    EndsWith,
}

impl Operator {
    /// Parses the textual form of an operator.
    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol {
            "==" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            "contains" => Some(Operator::Contains),
            "startswith" => Some(Operator::StartsWith),
            "endswith" => Some(Operator::EndsWith),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Contains => "contains",
            Operator::StartsWith => "startswith",
            Operator::EndsWith => "endswith",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// One side of a clause. Quoted operands already have their quotes stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "lowercase")]
pub enum Operand {
    Identifier(String),
    Quoted(String),
    Number(String),
}

impl Operand {
    pub fn text(&self) -> &str {
        match self {
            Operand::Identifier(s) | Operand::Quoted(s) | Operand::Number(s) => s,
        }
    }
}

/// A single `left operator right` comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryClause {
    pub left: Operand,
    pub op: Operator,
    pub right: Operand,
}

impl QueryClause {
    pub fn new(left: Operand, op: Operator, right: Operand) -> Self {
        Self { left, op, right }
    }
}

impl fmt::Display for QueryClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left.text(), self.op, self.right.text())
    }
}
