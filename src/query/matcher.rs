// src/query/matcher.rs

use super::{Operator, QueryClause};
use serde_json::{Map, Number, Value};

/// Evaluates compiled clauses against a flattened offer record.
///
/// Record keys are expected to be folded with `fold_case` already. Clauses are ANDed and
/// evaluation stops at the first clause that fails. A clause whose key is
/// missing, or whose right operand cannot be coerced to the stored type,
/// fails instead of raising.
pub fn matches(record: &Map<String, Value>, clauses: &[QueryClause]) -> bool {
    clauses.iter().all(|clause| clause_matches(record, clause))
}

fn clause_matches(record: &Map<String, Value>, clause: &QueryClause) -> bool {
    let key = fold_case(clause.left.text());
    let Some(value) = record.get(&key) else {
        return false;
    };
    let rhs = clause.right.text();

    match value {
        Value::Number(n) => compare_number(n, clause.op, rhs),
        Value::String(s) => compare_text(&fold_case(s), clause.op, &fold_case(rhs)),
        Value::Bool(b) => compare_bool(*b, clause.op, rhs),
        // Null, arrays and objects never equal a scalar operand.
        _ => clause.op == Operator::Ne,
    }
}

/// Folds case for caseless comparison.
///
/// Lower-cases, then applies the full folds that lower-casing leaves out:
/// `ß` becomes `ss` and final sigma becomes `σ`.
pub fn fold_case(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        match c {
            'ß' => folded.push_str("ss"),
            'ς' => folded.push('σ'),
            c => folded.push(c),
        }
    }
    folded
}

/// The right operand is parsed into the stored number's own type:
/// integers only accept integer text, floats accept any decimal.
fn compare_number(stored: &Number, op: Operator, rhs: &str) -> bool {
    if let Some(lhs) = stored.as_i64().map(i128::from).or_else(|| stored.as_u64().map(i128::from)) {
        match rhs.parse::<i128>() {
            Ok(rhs) => compare_ordered(lhs, op, rhs),
            Err(_) => false,
        }
    } else if let Some(lhs) = stored.as_f64() {
        match rhs.parse::<f64>() {
            Ok(rhs) => compare_ordered(lhs, op, rhs),
            Err(_) => false,
        }
    } else {
        false
    }
}

fn compare_ordered<T: PartialOrd>(lhs: T, op: Operator, rhs: T) -> bool {
    match op {
        Operator::Eq => lhs == rhs,
        Operator::Ne => lhs != rhs,
        Operator::Lt => lhs < rhs,
        Operator::Le => lhs <= rhs,
        Operator::Gt => lhs > rhs,
        Operator::Ge => lhs >= rhs,
        // Positional operators only apply to strings.
        Operator::Contains | Operator::StartsWith | Operator::EndsWith => false,
    }
}

fn compare_text(lhs: &str, op: Operator, rhs: &str) -> bool {
    match op {
        Operator::Eq => lhs == rhs,
        Operator::Ne => lhs != rhs,
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => false,
        Operator::Contains => lhs.contains(rhs),
        Operator::StartsWith => lhs.starts_with(rhs),
        Operator::EndsWith => lhs.ends_with(rhs),
    }
}

fn compare_bool(stored: bool, op: Operator, rhs: &str) -> bool {
    let rhs = match rhs.to_lowercase().as_str() {
        "true" => true,
        "false" => false,
        _ => return false,
    };
    match op {
        Operator::Eq => stored == rhs,
        Operator::Ne => stored != rhs,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::compile;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn check(rec: &Map<String, Value>, query: &str) -> bool {
        matches(rec, &compile(query).unwrap())
    }

    #[test]
    fn test_string_equality_ignores_case() {
        let rec = record(json!({ "tag": "Kit" }));
        assert!(check(&rec, "tag==kit"));
        assert!(check(&rec, "Tag==KIT"));
        assert!(!check(&rec, "tag!=KIT"));
    }

    #[test]
    fn test_string_comparison_folds_case() {
        let rec = record(json!({ "street": "Straße", "name": "ΟΔΟΣ" }));
        assert!(check(&rec, "street == 'STRASSE'"));
        assert!(check(&rec, "street == strasse"));
        assert!(check(&rec, "street endswith 'SSE'"));
        assert!(check(&rec, "name == 'οδος'"));
        assert!(check(&rec, "name == 'οδοσ'"));
    }

    #[test]
    fn test_fold_case() {
        assert_eq!(fold_case("Straße"), "strasse");
        assert_eq!(fold_case("ẞ"), "ss");
        assert_eq!(fold_case("ΟΔΟΣ"), fold_case("οδος"));
        assert_eq!(fold_case("Kit"), "kit");
    }

    #[test]
    fn test_missing_key_fails() {
        let rec = record(json!({ "tag": "kit" }));
        assert!(!check(&rec, "missing==kit"));
        assert!(!check(&rec, "missing!=kit"));
    }

    #[test]
    fn test_numeric_comparisons() {
        let rec = record(json!({ "price": 5, "rating": 4.5 }));
        assert!(check(&rec, "price<=10"));
        assert!(check(&rec, "price==5"));
        assert!(!check(&rec, "price>5"));
        assert!(check(&rec, "rating>4"));
        assert!(check(&rec, "rating==4.5"));
    }

    #[test]
    fn test_integer_field_rejects_fractional_operand() {
        let rec = record(json!({ "price": 5 }));
        assert!(!check(&rec, "price<=10.5"));
    }

    #[test]
    fn test_non_numeric_right_operand_fails_numeric_field() {
        let rec = record(json!({ "price": 5 }));
        assert!(!check(&rec, "price==free"));
        assert!(!check(&rec, "price!=free"));
    }

    #[test]
    fn test_ordering_on_string_fails() {
        let rec = record(json!({ "price": "free" }));
        assert!(!check(&rec, "price<=10"));
        assert!(!check(&rec, "price>0"));
    }

    #[test]
    fn test_positional_operators() {
        let rec = record(json!({ "name": "Sensor-Feed", "count": 12 }));
        assert!(check(&rec, "name contains 'feed'"));
        assert!(check(&rec, "name startswith sensor"));
        assert!(check(&rec, "name endswith 'FEED'"));
        assert!(!check(&rec, "name endswith sensor"));
        assert!(!check(&rec, "count contains 1"));
    }

    #[test]
    fn test_all_clauses_must_hold() {
        let rec = record(json!({ "tag": "kit", "price": 5 }));
        assert!(check(&rec, "tag==kit and price<10"));
        assert!(!check(&rec, "tag==kit & price>10"));
    }

    #[test]
    fn test_bool_fields() {
        let rec = record(json!({ "public": true }));
        assert!(check(&rec, "public==TRUE"));
        assert!(check(&rec, "public!=false"));
        assert!(!check(&rec, "public==yes"));
        assert!(!check(&rec, "public>false"));
    }

    #[test]
    fn test_structured_values_only_satisfy_not_equal() {
        let rec = record(json!({ "tags": ["a", "b"], "owner": null }));
        assert!(!check(&rec, "tags==a"));
        assert!(check(&rec, "tags!=a"));
        assert!(check(&rec, "owner!=a"));
    }

    #[test]
    fn test_empty_clause_list_matches() {
        let rec = record(json!({}));
        assert!(matches(&rec, &[]));
    }
}
