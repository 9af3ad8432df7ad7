//! A small JsonLogic-compatible expression interpreter.
//!
//! `SwitchNode` rule conditions and `MapperProcessor` array filters are
//! trees of single-key objects (`{"==": [...]}`) evaluated against a
//! `serde_json::Value` data scope, following the original engine's use
//! of the `json-logic` library rather than a hand-rolled grammar.

use serde_json::Value;

/// Evaluate a JsonLogic expression tree against `data`.
///
/// Unrecognized operators and malformed operand lists evaluate to
/// `Value::Null` rather than panicking — JsonLogic treats this as
/// "unknown", which callers fold into falsy.
pub fn evaluate(expr: &Value, data: &Value) -> Value {
    match expr {
        Value::Object(map) if map.len() == 1 => {
            let (op, args) = map.iter().next().expect("len checked above");
            apply_operator(op, args, data)
        }
        // Arrays/objects/scalars that aren't a single-key operator node
        // are literals.
        other => other.clone(),
    }
}

/// Evaluate `expr` against `data` and coerce the result to a bool using
/// JsonLogic truthiness (`0`, `""`, `null`, `false`, `[]` are falsy).
pub fn evaluate_bool(expr: &Value, data: &Value) -> bool {
    is_truthy(&evaluate(expr, data))
}

fn apply_operator(op: &str, args: &Value, data: &Value) -> Value {
    match op {
        "var" => eval_var(args, data),
        "==" => Value::Bool(values_equal(&eval_nth(args, data, 0), &eval_nth(args, data, 1))),
        "!=" => Value::Bool(!values_equal(&eval_nth(args, data, 0), &eval_nth(args, data, 1))),
        "!" => Value::Bool(!is_truthy(&eval_nth(args, data, 0))),
        ">" => compare(args, data, |a, b| a > b),
        "<" => compare(args, data, |a, b| a < b),
        ">=" => compare(args, data, |a, b| a >= b),
        "<=" => compare(args, data, |a, b| a <= b),
        "and" => Value::Bool(
            as_array(args)
                .iter()
                .all(|a| is_truthy(&evaluate(a, data))),
        ),
        "or" => Value::Bool(
            as_array(args)
                .iter()
                .any(|a| is_truthy(&evaluate(a, data))),
        ),
        "in" => eval_in(args, data),
        "+" => numeric_fold(args, data, 0.0, |a, b| a + b),
        "-" => numeric_fold_sub(args, data),
        "*" => numeric_fold(args, data, 1.0, |a, b| a * b),
        "/" => numeric_fold_div(args, data),
        _ => Value::Null,
    }
}

fn eval_nth(args: &Value, data: &Value, n: usize) -> Value {
    as_array(args)
        .get(n)
        .map(|a| evaluate(a, data))
        .unwrap_or(Value::Null)
}

fn eval_var(args: &Value, data: &Value) -> Value {
    let (path, default) = match args {
        Value::String(s) => (s.clone(), Value::Null),
        Value::Array(a) => {
            let path = a.first().and_then(|v| v.as_str()).unwrap_or("").to_string();
            let default = a.get(1).cloned().unwrap_or(Value::Null);
            (path, default)
        }
        _ => (String::new(), Value::Null),
    };

    if path.is_empty() {
        return data.clone();
    }

    let mut current = data;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => current = v,
                None => return default,
            },
            Value::Array(arr) => match segment.parse::<usize>().ok().and_then(|i| arr.get(i)) {
                Some(v) => current = v,
                None => return default,
            },
            _ => return default,
        }
    }
    current.clone()
}

fn eval_in(args: &Value, data: &Value) -> Value {
    let arr = as_array(args);
    let needle = eval_nth(args, data, 0);
    let haystack = arr.get(1).map(|a| evaluate(a, data)).unwrap_or(Value::Null);
    let found = match &haystack {
        Value::Array(items) => items.iter().any(|v| values_equal(v, &needle)),
        Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        _ => false,
    };
    Value::Bool(found)
}

fn compare(args: &Value, data: &Value, cmp: impl Fn(f64, f64) -> bool) -> Value {
    let a = eval_nth(args, data, 0);
    let b = eval_nth(args, data, 1);
    match (as_f64(&a), as_f64(&b)) {
        (Some(a), Some(b)) => Value::Bool(cmp(a, b)),
        _ => Value::Bool(false),
    }
}

fn numeric_fold(args: &Value, data: &Value, init: f64, f: impl Fn(f64, f64) -> f64) -> Value {
    let values = as_array(args);
    let sum = values
        .iter()
        .filter_map(|a| as_f64(&evaluate(a, data)))
        .fold(init, &f);
    json_number(sum)
}

fn numeric_fold_sub(args: &Value, data: &Value) -> Value {
    let values = as_array(args);
    let nums: Vec<f64> = values.iter().filter_map(|a| as_f64(&evaluate(a, data))).collect();
    match nums.as_slice() {
        [] => json_number(0.0),
        [single] => json_number(-single),
        [first, rest @ ..] => json_number(rest.iter().fold(*first, |acc, n| acc - n)),
    }
}

fn numeric_fold_div(args: &Value, data: &Value) -> Value {
    let values = as_array(args);
    let nums: Vec<f64> = values.iter().filter_map(|a| as_f64(&evaluate(a, data))).collect();
    match nums.as_slice() {
        [a, b, ..] if *b != 0.0 => json_number(a / b),
        _ => Value::Null,
    }
}

fn json_number(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn as_array(v: &Value) -> Vec<Value> {
    match v {
        Value::Array(a) => a.clone(),
        other => vec![other.clone()],
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_f64(a), as_f64(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// JsonLogic truthiness: falsy values are `null`, `false`, `0`, `""`,
/// and empty arrays; everything else (including empty objects) is truthy.
pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn var_extracts_nested_path() {
        let data = json!({"value": 7, "user": {"status": "active"}});
        assert_eq!(evaluate(&json!({"var": "user.status"}), &data), json!("active"));
    }

    #[test]
    fn var_falls_back_to_default() {
        let data = json!({});
        assert_eq!(evaluate(&json!({"var": ["missing", "fallback"]}), &data), json!("fallback"));
    }

    #[test]
    fn comparison_operators() {
        let data = json!({"value": 7});
        assert!(evaluate_bool(&json!({">": [{"var": "value"}, 5]}), &data));
        assert!(!evaluate_bool(&json!({"<=": [{"var": "value"}, 5]}), &data));
    }

    #[test]
    fn logical_and_or_not() {
        let data = json!({"a": true, "b": false});
        assert!(evaluate_bool(&json!({"and": [{"var": "a"}, {"!": [{"var": "b"}]}]}), &data));
        assert!(evaluate_bool(&json!({"or": [{"var": "b"}, {"var": "a"}]}), &data));
    }

    #[test]
    fn in_operator_checks_membership() {
        let data = json!({"tag": "b"});
        assert!(evaluate_bool(&json!({"in": [{"var": "tag"}, ["a", "b", "c"]]}), &data));
    }

    #[test]
    fn arithmetic_operators() {
        let data = json!({"x": 3, "y": 4});
        assert_eq!(evaluate(&json!({"+": [{"var": "x"}, {"var": "y"}]}), &data), json!(7.0));
        assert_eq!(evaluate(&json!({"*": [{"var": "x"}, {"var": "y"}]}), &data), json!(12.0));
    }

    #[test]
    fn unknown_operator_is_falsy_not_panicking() {
        let data = json!({});
        assert!(!evaluate_bool(&json!({"frobnicate": [1, 2]}), &data));
    }
}
