//! 变量提取与断言

use regex::Regex;
use serde_json::{json, Value};
use std::cmp::Ordering;
use steprun_common::{AssertRule, Assignment, Comparator, StepError, ValueSource};

use crate::{lookup_path, VariableScope};

/// 按顺序执行变量提取，遇到第一个失败即停止
pub fn apply_assignments(
    rules: &[Assignment],
    extra: &Value,
    scope: &mut VariableScope,
) -> Result<(), StepError> {
    for rule in rules {
        let value = match rule.source {
            ValueSource::Extra => {
                let path = rule.path.as_deref().unwrap_or("");
                lookup_path(extra, path).cloned().ok_or_else(|| {
                    StepError::assignment(format!(
                        "变量 {} 提取失败: 结果中不存在路径 {}",
                        rule.name, path
                    ))
                })?
            }
            ValueSource::Variable => {
                let source = rule.path.as_deref().unwrap_or(&rule.name);
                scope.resolve(source).ok_or_else(|| {
                    StepError::assignment(format!("变量 {} 提取失败: 变量 {} 不存在", rule.name, source))
                })?
            }
            ValueSource::Literal => scope.render_value(rule.value.as_ref().unwrap_or(&Value::Null)),
        };
        scope.set_in(rule.scope, &rule.name, value);
    }
    Ok(())
}

/// 执行全部断言，返回所有失败
pub fn check_asserts(rules: &[AssertRule], extra: &Value, scope: &VariableScope) -> Vec<StepError> {
    rules
        .iter()
        .filter_map(|rule| check_assert(rule, extra, scope).err())
        .collect()
}

fn check_assert(rule: &AssertRule, extra: &Value, scope: &VariableScope) -> Result<(), StepError> {
    let path = rule.path.as_deref().unwrap_or("");
    let actual = match rule.source {
        ValueSource::Extra => lookup_path(extra, path).cloned(),
        ValueSource::Variable => scope.resolve(path),
        ValueSource::Literal => Some(scope.render_value(&Value::String(path.to_string()))),
    };
    let expected = scope.render_value(&rule.expected);
    let label = rule.name.as_deref().unwrap_or(path);

    match compare(rule.comparator, actual.as_ref(), &expected) {
        Ok(true) => Ok(()),
        Ok(false) => Err(StepError::assertion(format!(
            "断言失败: {} {:?} {}，实际值 {}",
            label,
            rule.comparator,
            expected,
            actual.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "<不存在>".to_string())
        ))
        .with_extra(json!({ "actual": actual, "expected": expected }))),
        Err(message) => Err(StepError::assertion(format!("断言 {} 无效: {}", label, message))),
    }
}

/// 比较实际值与期望值
pub fn compare(comparator: Comparator, actual: Option<&Value>, expected: &Value) -> Result<bool, String> {
    let present = actual.filter(|v| !v.is_null());
    Ok(match comparator {
        Comparator::Exists => present.is_some(),
        Comparator::NotExists => present.is_none(),
        Comparator::Empty => is_empty(actual),
        Comparator::NotEmpty => !is_empty(actual),
        Comparator::Eq => loose_eq(actual.unwrap_or(&Value::Null), expected),
        Comparator::Ne => !loose_eq(actual.unwrap_or(&Value::Null), expected),
        Comparator::Gt => order(present, expected) == Some(Ordering::Greater),
        Comparator::Ge => matches!(order(present, expected), Some(Ordering::Greater | Ordering::Equal)),
        Comparator::Lt => order(present, expected) == Some(Ordering::Less),
        Comparator::Le => matches!(order(present, expected), Some(Ordering::Less | Ordering::Equal)),
        Comparator::Contains => present.map_or(false, |v| contains(v, expected)),
        Comparator::NotContains => !present.map_or(false, |v| contains(v, expected)),
        Comparator::Regex => {
            let pattern = Regex::new(&text(expected)).map_err(|e| e.to_string())?;
            present.map_or(false, |v| pattern.is_match(&text(v)))
        }
    })
}

/// 字符串原样，其余值取 JSON 文本
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            matches!((number(actual), number(expected)), (Some(a), Some(b)) if a == b)
        }
        (Value::String(_), _) | (_, Value::String(_)) => text(actual) == text(expected),
        _ => false,
    }
}

fn order(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let actual = actual?;
    match (number(actual), number(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(text(actual).cmp(&text(expected))),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => s.contains(&text(expected)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        Value::Object(map) => map.contains_key(&text(expected)),
        other => text(other).contains(&text(expected)),
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use steprun_common::{ErrorKind, VariableTier};

    fn assert_rule(path: &str, comparator: Comparator, expected: Value) -> AssertRule {
        AssertRule {
            name: None,
            source: ValueSource::Extra,
            path: Some(path.to_string()),
            comparator,
            expected,
        }
    }

    #[test]
    fn test_assignments_write_to_tiers() {
        let mut scope = VariableScope::new(Map::new(), Map::new());
        let extra = json!({"body": {"token": "abc", "items": [1, 2]}});
        let rules = vec![
            Assignment {
                name: "token".to_string(),
                source: ValueSource::Extra,
                path: Some("/body/token".to_string()),
                value: None,
                scope: VariableTier::Global,
            },
            Assignment {
                name: "first".to_string(),
                source: ValueSource::Extra,
                path: Some("body.items[0]".to_string()),
                value: None,
                scope: VariableTier::Context,
            },
            Assignment {
                name: "copy".to_string(),
                source: ValueSource::Variable,
                path: Some("first".to_string()),
                value: None,
                scope: VariableTier::Local,
            },
        ];
        apply_assignments(&rules, &extra, &mut scope).unwrap();
        assert_eq!(scope.get_in(VariableTier::Global, "token"), Some(json!("abc")));
        assert_eq!(scope.get("first"), Some(json!(1)));
        assert_eq!(scope.get_in(VariableTier::Local, "copy"), Some(json!(1)));
    }

    #[test]
    fn test_missing_path_is_assignment_error() {
        let mut scope = VariableScope::default();
        let rules = vec![Assignment {
            name: "x".to_string(),
            source: ValueSource::Extra,
            path: Some("/missing".to_string()),
            value: None,
            scope: VariableTier::Context,
        }];
        let error = apply_assignments(&rules, &json!({}), &mut scope).unwrap_err();
        assert_eq!(error.kind, ErrorKind::Assignment);
    }

    #[test]
    fn test_comparators() {
        let extra = json!({"code": 200, "msg": "ok done", "list": ["a", 3], "empty": ""});
        let scope = VariableScope::default();
        let passing = vec![
            assert_rule("code", Comparator::Eq, json!("200")),
            assert_rule("code", Comparator::Ge, json!(200)),
            assert_rule("code", Comparator::Lt, json!(300)),
            assert_rule("msg", Comparator::Contains, json!("ok")),
            assert_rule("list", Comparator::Contains, json!(3)),
            assert_rule("list", Comparator::NotContains, json!("b")),
            assert_rule("msg", Comparator::Regex, json!("^ok\\s")),
            assert_rule("empty", Comparator::Empty, Value::Null),
            assert_rule("nothing", Comparator::NotExists, Value::Null),
            assert_rule("code", Comparator::Exists, Value::Null),
        ];
        assert!(check_asserts(&passing, &extra, &scope).is_empty());

        let failing = vec![
            assert_rule("code", Comparator::Ne, json!(200)),
            assert_rule("msg", Comparator::Regex, json!("(unclosed")),
        ];
        let errors = check_asserts(&failing, &extra, &scope);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Assert));
        assert!(errors[1].message.contains("无效"));
    }

    #[test]
    fn test_expected_value_is_rendered() {
        let mut scope = VariableScope::default();
        scope.set("want", json!(7));
        let rules = vec![assert_rule("n", Comparator::Eq, json!("{{want}}"))];
        assert!(check_asserts(&rules, &json!({"n": 7}), &scope).is_empty());
    }
}
