// src/query/compiler.rs

use super::{Operand, Operator, QueryClause};
use crate::error::CompileError;
use regex::Regex;
use std::sync::OnceLock;

// Each pattern is anchored and applied to the unparsed remainder of the query.
const OPERAND_PATTERN: &str =
    r#"^(?:([A-Za-z_][A-Za-z0-9_]*)|'([^']*)'|"([^"]*)"|([0-9]+(?:\.[0-9]+)?))"#;
const OPERATOR_PATTERN: &str = r"^(==|!=|<=|<|>=|>|contains\b|startswith\b|endswith\b)";
const SEPARATOR_PATTERN: &str = r"^(?:and\b|&)";

struct Grammar {
    operand: Regex,
    operator: Regex,
    separator: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| Grammar {
        operand: Regex::new(OPERAND_PATTERN).expect("operand pattern is valid"),
        operator: Regex::new(OPERATOR_PATTERN).expect("operator pattern is valid"),
        separator: Regex::new(SEPARATOR_PATTERN).expect("separator pattern is valid"),
    })
}

/// Compiles a filter expression into its clauses.
///
/// Grammar: `clause (("and" | "&") clause)*` with `clause = operand operator operand`.
/// Any violation rejects the whole query; there is no partial result.
pub fn compile(text: &str) -> Result<Vec<QueryClause>, CompileError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CompileError::new(0, "empty query"));
    }

    let grammar = grammar();
    let mut clauses = Vec::new();
    let mut pos = 0;

    loop {
        let (left, next) = parse_operand(grammar, text, skip_whitespace(text, pos))?;
        let (op, next) = parse_operator(grammar, text, skip_whitespace(text, next))?;
        let (right, next) = parse_operand(grammar, text, skip_whitespace(text, next))?;
        clauses.push(QueryClause::new(left, op, right));

        pos = skip_whitespace(text, next);
        if pos == text.len() {
            break;
        }

        match grammar.separator.find(&text[pos..]) {
            Some(m) => pos += m.end(),
            None => return Err(CompileError::new(pos, "expected `and` or `&` between clauses")),
        }
    }

    Ok(clauses)
}

fn skip_whitespace(text: &str, pos: usize) -> usize {
    let rest = &text[pos..];
    pos + (rest.len() - rest.trim_start().len())
}

fn parse_operand(
    grammar: &Grammar,
    text: &str,
    pos: usize,
) -> Result<(Operand, usize), CompileError> {
    let caps = grammar
        .operand
        .captures(&text[pos..])
        .ok_or_else(|| CompileError::new(pos, "expected an identifier, quoted string or number"))?;

    let end = pos + caps.get(0).map(|m| m.end()).unwrap_or(0);
    let operand = if let Some(m) = caps.get(1) {
        Operand::Identifier(m.as_str().to_string())
    } else if let Some(m) = caps.get(2).or_else(|| caps.get(3)) {
        Operand::Quoted(m.as_str().to_string())
    } else if let Some(m) = caps.get(4) {
        Operand::Number(m.as_str().to_string())
    } else {
        return Err(CompileError::new(pos, "unrecognized operand"));
    };

    Ok((operand, end))
}

fn parse_operator(
    grammar: &Grammar,
    text: &str,
    pos: usize,
) -> Result<(Operator, usize), CompileError> {
    let m = grammar
        .operator
        .find(&text[pos..])
        .ok_or_else(|| CompileError::new(pos, "expected a comparison operator"))?;
    let op = Operator::parse(m.as_str())
        .ok_or_else(|| CompileError::new(pos, format!("unknown operator `{}`", m.as_str())))?;
    Ok((op, pos + m.end()))
}
