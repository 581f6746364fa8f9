//! Filter and extractor expressions.
//!
//! A small expression tree used for `where` clauses, index extractors and
//! order-by clauses. Expressions are evaluated against a single item.

use crate::compare::{compare_values, CompareOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// An expression over a single item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Expr {
    /// A field reference, one segment per nesting level.
    Ref { path: Vec<String> },
    /// A literal value.
    Val { value: Value },
    /// A function applied to argument expressions.
    Func { name: String, args: Vec<Expr> },
}

/// Comparison operators an index can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl Comparison {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "eq" => Some(Comparison::Eq),
            "gt" => Some(Comparison::Gt),
            "gte" => Some(Comparison::Gte),
            "lt" => Some(Comparison::Lt),
            "lte" => Some(Comparison::Lte),
            "in" => Some(Comparison::In),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Comparison::Eq => "eq",
            Comparison::Gt => "gt",
            Comparison::Gte => "gte",
            Comparison::Lt => "lt",
            Comparison::Lte => "lte",
            Comparison::In => "in",
        }
    }

    /// The operator obtained by swapping the operands (`5 < x` is `x > 5`).
    ///
    /// `in` has no mirrored form.
    pub fn mirrored(self) -> Option<Self> {
        match self {
            Comparison::Eq => Some(Comparison::Eq),
            Comparison::Gt => Some(Comparison::Lt),
            Comparison::Gte => Some(Comparison::Lte),
            Comparison::Lt => Some(Comparison::Gt),
            Comparison::Lte => Some(Comparison::Gte),
            Comparison::In => None,
        }
    }
}

/// A `field <op> literal` predicate found inside a larger expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPredicate {
    pub path: Vec<String>,
    pub op: Comparison,
    pub value: Value,
}

/// Reference a (possibly nested) field, using `.` to separate segments.
pub fn field(path: &str) -> Expr {
    Expr::Ref {
        path: path.split('.').map(str::to_string).collect(),
    }
}

/// A literal value.
pub fn val(value: impl Into<Value>) -> Expr {
    Expr::Val {
        value: value.into(),
    }
}

pub fn func(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Func {
        name: name.to_string(),
        args,
    }
}

pub fn eq(left: Expr, right: Expr) -> Expr {
    func("eq", vec![left, right])
}

pub fn gt(left: Expr, right: Expr) -> Expr {
    func("gt", vec![left, right])
}

pub fn gte(left: Expr, right: Expr) -> Expr {
    func("gte", vec![left, right])
}

pub fn lt(left: Expr, right: Expr) -> Expr {
    func("lt", vec![left, right])
}

pub fn lte(left: Expr, right: Expr) -> Expr {
    func("lte", vec![left, right])
}

/// `left` is equal to one of the elements of `values`.
pub fn in_array(left: Expr, values: Vec<Value>) -> Expr {
    func("in", vec![left, val(Value::Array(values))])
}

pub fn and(args: Vec<Expr>) -> Expr {
    func("and", args)
}

pub fn or(args: Vec<Expr>) -> Expr {
    func("or", args)
}

pub fn not(arg: Expr) -> Expr {
    func("not", vec![arg])
}

pub fn is_null(arg: Expr) -> Expr {
    func("isNull", vec![arg])
}

impl Expr {
    /// The field path, if this is a plain reference.
    pub fn as_ref_path(&self) -> Option<&[String]> {
        match self {
            Expr::Ref { path } => Some(path),
            _ => None,
        }
    }

    /// Evaluate against an item.
    pub fn evaluate(&self, item: &Value) -> Value {
        evaluate(self, item)
    }

    /// Whether the expression is truthy for an item.
    pub fn matches(&self, item: &Value) -> bool {
        is_truthy(&evaluate(self, item))
    }

    /// Collect `field <op> literal` predicates reachable through `and`/`or`.
    pub fn field_predicates(&self) -> Vec<FieldPredicate> {
        let mut out = Vec::new();
        collect_predicates(self, &mut out);
        out
    }
}

/// Resolve a path inside an item, yielding `Null` for missing segments.
pub fn resolve_path(item: &Value, path: &[String]) -> Value {
    let mut current = item;
    for segment in path {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare_args(args: &[Expr], item: &Value) -> Option<Ordering> {
    let (left, right) = match args {
        [l, r] => (evaluate(l, item), evaluate(r, item)),
        _ => return None,
    };
    if left.is_null() || right.is_null() {
        return None;
    }
    Some(compare_values(&left, &right, &CompareOptions::default()))
}

fn evaluate(expr: &Expr, item: &Value) -> Value {
    match expr {
        Expr::Ref { path } => resolve_path(item, path),
        Expr::Val { value } => value.clone(),
        Expr::Func { name, args } => match name.as_str() {
            "eq" => compare_args(args, item).map_or(Value::Null, |o| Value::Bool(o.is_eq())),
            "gt" => compare_args(args, item).map_or(Value::Null, |o| Value::Bool(o.is_gt())),
            "gte" => compare_args(args, item).map_or(Value::Null, |o| Value::Bool(o.is_ge())),
            "lt" => compare_args(args, item).map_or(Value::Null, |o| Value::Bool(o.is_lt())),
            "lte" => compare_args(args, item).map_or(Value::Null, |o| Value::Bool(o.is_le())),
            "in" => match args.as_slice() {
                [needle, haystack] => {
                    let needle = evaluate(needle, item);
                    match evaluate(haystack, item) {
                        Value::Array(values) if !needle.is_null() => Value::Bool(
                            values.iter().any(|v| {
                                compare_values(&needle, v, &CompareOptions::default()).is_eq()
                            }),
                        ),
                        _ => Value::Null,
                    }
                }
                _ => Value::Null,
            },
            "and" => Value::Bool(args.iter().all(|a| is_truthy(&evaluate(a, item)))),
            "or" => Value::Bool(args.iter().any(|a| is_truthy(&evaluate(a, item)))),
            "not" => match args.as_slice() {
                [arg] => match evaluate(arg, item) {
                    Value::Null => Value::Null,
                    v => Value::Bool(!is_truthy(&v)),
                },
                _ => Value::Null,
            },
            "isNull" => match args.as_slice() {
                [arg] => Value::Bool(evaluate(arg, item).is_null()),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
    }
}

fn collect_predicates(expr: &Expr, out: &mut Vec<FieldPredicate>) {
    let Expr::Func { name, args } = expr else {
        return;
    };
    if name == "and" || name == "or" {
        for arg in args {
            collect_predicates(arg, out);
        }
        return;
    }
    if let Some(predicate) = as_field_predicate(name, args) {
        out.push(predicate);
    }
}

/// Interpret `name(args)` as a single-field comparison against a literal.
pub(crate) fn as_field_predicate(name: &str, args: &[Expr]) -> Option<FieldPredicate> {
    let op = Comparison::from_name(name)?;
    match args {
        [Expr::Ref { path }, Expr::Val { value }] => {
            if op == Comparison::In && !value.is_array() {
                return None;
            }
            Some(FieldPredicate {
                path: path.clone(),
                op,
                value: value.clone(),
            })
        }
        [Expr::Val { value }, Expr::Ref { path }] => Some(FieldPredicate {
            path: path.clone(),
            op: op.mirrored()?,
            value: value.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluate_comparisons() {
        let item = json!({"age": 30, "name": "Ada", "tags": ["a"], "meta": {"rank": 2}});
        assert!(eq(field("name"), val("Ada")).matches(&item));
        assert!(gt(field("age"), val(18)).matches(&item));
        assert!(!lt(field("age"), val(18)).matches(&item));
        assert!(gte(field("meta.rank"), val(2)).matches(&item));
        assert!(in_array(field("age"), vec![json!(1), json!(30)]).matches(&item));
        assert!(!in_array(field("age"), vec![json!(1)]).matches(&item));
    }

    #[test]
    fn nulls_are_unknown() {
        let item = json!({"age": null});
        assert_eq!(eq(field("age"), val(1)).evaluate(&item), Value::Null);
        assert_eq!(not(eq(field("age"), val(1))).evaluate(&item), Value::Null);
        assert!(is_null(field("age")).matches(&item));
        assert!(is_null(field("missing")).matches(&item));
    }

    #[test]
    fn wrong_arity_is_unknown() {
        let item = json!({"a": 1});
        assert_eq!(func("in", vec![field("a")]).evaluate(&item), Value::Null);
        assert_eq!(func("not", Vec::new()).evaluate(&item), Value::Null);
        assert_eq!(
            func("isNull", vec![field("a"), field("b")]).evaluate(&item),
            Value::Null
        );
    }

    #[test]
    fn boolean_combinators() {
        let item = json!({"a": 1, "b": 2});
        let both = and(vec![eq(field("a"), val(1)), eq(field("b"), val(2))]);
        let either = or(vec![eq(field("a"), val(9)), eq(field("b"), val(2))]);
        assert!(both.matches(&item));
        assert!(either.matches(&item));
        assert!(!not(both).matches(&item));
    }

    #[test]
    fn extracts_field_predicates() {
        let expr = and(vec![
            eq(field("status"), val("open")),
            or(vec![gt(val(10), field("priority")), in_array(field("owner"), vec![json!("x")])]),
            func("upper", vec![field("name")]),
        ]);
        let preds = expr.field_predicates();
        assert_eq!(preds.len(), 3);
        assert_eq!(preds[0].op, Comparison::Eq);
        assert_eq!(preds[1].path, vec!["priority".to_string()]);
        assert_eq!(preds[1].op, Comparison::Lt);
        assert_eq!(preds[2].op, Comparison::In);
    }

    #[test]
    fn serializes_tagged() {
        let expr = eq(field("id"), val(1));
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(json["type"], "func");
        assert_eq!(json["args"][0]["type"], "ref");
        let parsed: Expr = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, expr);
    }
}
