//  EXPRESSION.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the minimal expression surface the workflow engine needs:
//!   dotted variable references (`a.b.c`), payload dereferences
//!   (`$.field`, resolved against the instance input), string/number/bool
//!   literals and the six comparison operators. Plus `${path}`
//!   interpolation inside config strings. No side effects, no arithmetic.
//

use std::collections::HashMap;

use serde_json::{Number, Value};

pub use crate::errors::ExprError as Error;


/***** CONSTANTS *****/
/// The variable under which the instance input is exposed (what `$` refers to).
pub const INPUT_VARIABLE: &str = "input";





/***** HELPERS *****/
/// The comparison operators, longest spelling first so the splitter never bites a prefix.
const OPERATORS: [(&str, Op); 6] = [("==", Op::Eq), ("!=", Op::Ne), ("<=", Op::Le), (">=", Op::Ge), ("<", Op::Lt), (">", Op::Gt)];

/// A comparison operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Finds the first top-level occurrence of a comparison operator, skipping quoted strings.
fn split_comparison(raw: &str) -> Option<(&str, Op, &str)> {
    let bytes: &[u8] = raw.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i: usize = 0;
    while i < bytes.len() {
        let b: u8 = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            },
            None => {
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                } else if b == b'=' || b == b'!' || b == b'<' || b == b'>' {
                    // Operator heads are ASCII, so this is always a char boundary
                    for (spelling, op) in OPERATORS {
                        if raw[i..].starts_with(spelling) {
                            return Some((&raw[..i], op, &raw[i + spelling.len()..]));
                        }
                    }
                }
            },
        }
        i += 1;
    }
    None
}

/// Resolves a dotted path inside a JSON value.
fn resolve_path<'v>(mut value: &'v Value, path: &str) -> Option<&'v Value> {
    for part in path.split('.') {
        value = match value {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Evaluates a single operand: a literal, a `$.field` payload dereference or a dotted
/// variable path.
fn evaluate_operand(raw: &str, variables: &HashMap<String, Value>) -> Result<Value, Error> {
    let raw: &str = raw.trim();
    if raw.is_empty() {
        return Err(Error::Empty);
    }

    // Quoted string literals
    if (raw.starts_with('\'') && raw.len() >= 2) || (raw.starts_with('"') && raw.len() >= 2) {
        let quote: char = raw.chars().next().unwrap();
        if !raw.ends_with(quote) || raw.len() < 2 {
            return Err(Error::UnterminatedString { raw: raw.into() });
        }
        return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
    }

    // Boolean and null literals
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {},
    }

    // Number literals
    if raw.chars().next().map(|c| c.is_ascii_digit() || c == '-').unwrap_or(false) {
        if let Ok(int) = raw.parse::<i64>() {
            return Ok(Value::Number(Number::from(int)));
        }
        if let Ok(float) = raw.parse::<f64>() {
            return Number::from_f64(float).map(Value::Number).ok_or_else(|| Error::IllegalLiteral { raw: raw.into() });
        }
        return Err(Error::IllegalLiteral { raw: raw.into() });
    }

    // `$.field` dereferences the instance input
    if let Some(rest) = raw.strip_prefix("$.") {
        let input: &Value = variables.get(INPUT_VARIABLE).unwrap_or(&Value::Null);
        return resolve_path(input, rest).cloned().ok_or_else(|| Error::UnknownPath { path: raw.into() });
    }
    if raw == "$" {
        return Ok(variables.get(INPUT_VARIABLE).cloned().unwrap_or(Value::Null));
    }

    // Everything else is a dotted variable path
    let (head, rest): (&str, Option<&str>) = match raw.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (raw, None),
    };
    let root: &Value = variables.get(head).ok_or_else(|| Error::UnknownPath { path: raw.into() })?;
    match rest {
        Some(rest) => resolve_path(root, rest).cloned().ok_or_else(|| Error::UnknownPath { path: raw.into() }),
        None => Ok(root.clone()),
    }
}

/// Compares two JSON values under the given operator.
fn compare(lhs: &Value, op: Op, rhs: &Value) -> Result<bool, Error> {
    // Equality works on anything
    match op {
        Op::Eq => return Ok(lhs == rhs),
        Op::Ne => return Ok(lhs != rhs),
        _ => {},
    }

    // Ordering needs two numbers or two strings
    let ordering: std::cmp::Ordering = match (lhs, rhs) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r): (f64, f64) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            match l.partial_cmp(&r) {
                Some(ordering) => ordering,
                None => return Err(Error::Unorderable { lhs: lhs.to_string(), rhs: rhs.to_string() }),
            }
        },
        (Value::String(l), Value::String(r)) => l.cmp(r),
        _ => return Err(Error::Unorderable { lhs: lhs.to_string(), rhs: rhs.to_string() }),
    };
    Ok(match op {
        Op::Lt => ordering.is_lt(),
        Op::Le => ordering.is_le(),
        Op::Gt => ordering.is_gt(),
        Op::Ge => ordering.is_ge(),
        Op::Eq | Op::Ne => unreachable!(),
    })
}





/***** LIBRARY *****/
/// Evaluates an expression over the given variables.
///
/// # Arguments
/// - `raw`: The expression text.
/// - `variables`: The instance's variable scope.
///
/// # Returns
/// The resulting JSON value (a bool for comparisons).
///
/// # Errors
/// This function errors on unparseable literals, unresolvable paths or unorderable operands.
pub fn evaluate(raw: &str, variables: &HashMap<String, Value>) -> Result<Value, Error> {
    let raw: &str = raw.trim();
    if raw.is_empty() {
        return Err(Error::Empty);
    }

    match split_comparison(raw) {
        Some((lhs, op, rhs)) => {
            let lhs: Value = evaluate_operand(lhs, variables)?;
            let rhs: Value = evaluate_operand(rhs, variables)?;
            Ok(Value::Bool(compare(&lhs, op, &rhs)?))
        },
        None => evaluate_operand(raw, variables),
    }
}

/// Evaluates an expression and coerces the result to a bool.
///
/// Anything but `false`, `null`, `0` and `""` is truthy (missing paths are simply false, so
/// conditions on optional fields read naturally).
pub fn evaluate_bool(raw: &str, variables: &HashMap<String, Value>) -> Result<bool, Error> {
    match evaluate(raw, variables) {
        Ok(Value::Bool(b)) => Ok(b),
        Ok(Value::Null) => Ok(false),
        Ok(Value::Number(n)) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Ok(Value::String(s)) => Ok(!s.is_empty()),
        Ok(_) => Ok(true),
        Err(Error::UnknownPath { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Replaces every `${path}` occurrence in the template with the referenced variable's value.
///
/// Non-string values render as their JSON form; unresolvable paths render as the empty string.
pub fn interpolate(template: &str, variables: &HashMap<String, Value>) -> String {
    let mut result: String = String::with_capacity(template.len());
    let mut rest: &str = template;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let path: &str = &rest[start + 2..start + 2 + end];
                match evaluate_operand(path, variables) {
                    Ok(Value::String(s)) => result.push_str(&s),
                    Ok(value) => result.push_str(&value.to_string()),
                    Err(_) => {},
                }
                rest = &rest[start + 2 + end + 1..];
            },
            None => {
                // No closing brace; keep the tail verbatim
                result.push_str(&rest[start..]);
                return result;
            },
        }
    }
    result.push_str(rest);
    result
}

/// Recursively interpolates a JSON config value: a string that is exactly one `${path}`
/// becomes the referenced value (type preserved), other strings are interpolated textually,
/// arrays/objects recurse.
pub fn resolve_value(value: &Value, variables: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            // An exact `${path}` reference keeps the referenced type
            if let Some(path) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
                if !path.contains("${") {
                    return evaluate_operand(path, variables).unwrap_or(Value::Null);
                }
            }
            Value::String(interpolate(s, variables))
        },
        Value::Array(items) => Value::Array(items.iter().map(|item| resolve_value(item, variables)).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(key, item)| (key.clone(), resolve_value(item, variables))).collect()),
        other => other.clone(),
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Builds a variable scope for the tests.
    fn vars() -> HashMap<String, Value> {
        HashMap::from([
            ("count".to_string(), json!(3)),
            ("name".to_string(), json!("orbit")),
            ("nested".to_string(), json!({"inner": {"flag": true}, "items": [10, 20]})),
            (INPUT_VARIABLE.to_string(), json!({"id": "x", "size": 5})),
        ])
    }

    #[test]
    fn test_literals() {
        let vars: HashMap<String, Value> = vars();
        assert_eq!(evaluate("42", &vars).unwrap(), json!(42));
        assert_eq!(evaluate("-1.5", &vars).unwrap(), json!(-1.5));
        assert_eq!(evaluate("'hello'", &vars).unwrap(), json!("hello"));
        assert_eq!(evaluate("\"hello\"", &vars).unwrap(), json!("hello"));
        assert_eq!(evaluate("true", &vars).unwrap(), json!(true));
        assert_eq!(evaluate("null", &vars).unwrap(), Value::Null);
    }

    #[test]
    fn test_paths() {
        let vars: HashMap<String, Value> = vars();
        assert_eq!(evaluate("count", &vars).unwrap(), json!(3));
        assert_eq!(evaluate("nested.inner.flag", &vars).unwrap(), json!(true));
        assert_eq!(evaluate("nested.items.1", &vars).unwrap(), json!(20));
        assert!(matches!(evaluate("ghost.path", &vars), Err(Error::UnknownPath { .. })));
    }

    #[test]
    fn test_payload_dereference() {
        let vars: HashMap<String, Value> = vars();
        assert_eq!(evaluate("$.id", &vars).unwrap(), json!("x"));
        assert_eq!(evaluate("$.size", &vars).unwrap(), json!(5));
        assert_eq!(evaluate("$", &vars).unwrap(), json!({"id": "x", "size": 5}));
    }

    #[test]
    fn test_comparisons() {
        let vars: HashMap<String, Value> = vars();
        assert_eq!(evaluate("count == 3", &vars).unwrap(), json!(true));
        assert_eq!(evaluate("count != 3", &vars).unwrap(), json!(false));
        assert_eq!(evaluate("count < 5", &vars).unwrap(), json!(true));
        assert_eq!(evaluate("count >= 4", &vars).unwrap(), json!(false));
        assert_eq!(evaluate("name == 'orbit'", &vars).unwrap(), json!(true));
        assert_eq!(evaluate("name < 'zzz'", &vars).unwrap(), json!(true));
        assert_eq!(evaluate("$.size > 4", &vars).unwrap(), json!(true));

        // Operators inside string literals are not split on
        assert_eq!(evaluate("'a<b' == 'a<b'", &vars).unwrap(), json!(true));
        // Ordering across types is an error
        assert!(matches!(evaluate("name < 3", &vars), Err(Error::Unorderable { .. })));
    }

    #[test]
    fn test_bool_coercion() {
        let vars: HashMap<String, Value> = vars();
        assert!(evaluate_bool("count", &vars).unwrap());
        assert!(evaluate_bool("name", &vars).unwrap());
        assert!(!evaluate_bool("null", &vars).unwrap());
        // Unknown paths are just false, not an error
        assert!(!evaluate_bool("ghost", &vars).unwrap());
    }

    #[test]
    fn test_interpolation() {
        let vars: HashMap<String, Value> = vars();
        assert_eq!(interpolate("hello ${name}!", &vars), "hello orbit!");
        assert_eq!(interpolate("${count} items", &vars), "3 items");
        assert_eq!(interpolate("${ghost}", &vars), "");
        assert_eq!(interpolate("no refs", &vars), "no refs");
        assert_eq!(interpolate("dangling ${tail", &vars), "dangling ${tail");
    }

    #[test]
    fn test_resolve_value_preserves_types() {
        let vars: HashMap<String, Value> = vars();
        let config: Value = json!({
            "exact": "${count}",
            "text": "count is ${count}",
            "deep": [{"flag": "${nested.inner.flag}"}],
        });
        let resolved: Value = resolve_value(&config, &vars);
        assert_eq!(resolved["exact"], json!(3));
        assert_eq!(resolved["text"], json!("count is 3"));
        assert_eq!(resolved["deep"][0]["flag"], json!(true));
    }
}
