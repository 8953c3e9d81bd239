//! 过滤树解析器: 把调用方提交的 JSON 转成类型化的 [`FilterNode`]
//!
//! ## 解析流程
//!
//! ```text
//! parse()
//!   ├─ 取出 "properties" (若存在), 根节点必须是分组
//!   └─ parse_group()
//!        ├─ "type": AND | OR
//!        └─ "values": 非空数组, 每个元素交给 parse_node()
//!             ├─ 含 "values"            → parse_group() (递归)
//!             ├─ "type": "behavioral"   → parse_behavioral()
//!             │    ├─ parse_subject()   事件名或动作 id
//!             │    └─ 按 "value" 选择判定方式并检查必填字段
//!             └─ "type": "person"       → parse_person()
//! ```
//!
//! ## 输入示例
//!
//! ```text
//! {"properties": {"type": "AND", "values": [
//!     {"type": "behavioral", "key": "$pageview", "value": "performed_event",
//!      "time_value": 1, "time_interval": "week"},
//!     {"type": "person", "key": "email", "value": "test@posthog.com"}
//! ]}}
//! ```
//!
//! 所有错误都是 [`CohortError::MalformedFilter`], 并带有出错节点的 JSON 路径。

use regex::Regex;
use serde_json::{Map, Value};

use crate::ast::{
    BehavioralCondition, BehavioralKind, Comparison, ComparisonOperator, FilterNode, GroupOperator,
    NodePath, PersonPropertyCondition, PropertyOperator, PropertyValue, Subject, TimeUnit, TimeWindow,
};
use crate::error::{CohortError, Result};

type Object = Map<String, Value>;

/// `performed_event_regularly` 的周期数上限, 每个周期在 SQL 中生成一个计数项
pub const MAX_TOTAL_PERIODS: i64 = 1000;

pub struct Parser<'a> {
    input: &'a Value,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a Value) -> Self {
        Self { input }
    }

    /// 解析入口。接受 `{"properties": {...}}` 或直接的根分组
    pub fn parse(&self) -> Result<FilterNode> {
        let root = self.input.get("properties").unwrap_or(self.input);
        let path = NodePath::root();
        let object = as_object(root, &path)?;
        if !object.contains_key("values") {
            return Err(CohortError::malformed(path.to_string(), "root must be an AND/OR group"));
        }
        self.parse_group(object, &path)
    }

    fn parse_node(&self, value: &Value, path: &NodePath) -> Result<FilterNode> {
        let object = as_object(value, path)?;
        if object.contains_key("values") {
            return self.parse_group(object, path);
        }

        match object.get("type").and_then(Value::as_str) {
            Some("behavioral") | Some("behavioural") => self.parse_behavioral(object, path),
            Some("person") => self.parse_person(object, path),
            Some(other) => Err(CohortError::malformed(
                path.to_string(),
                format!("unknown condition type '{}'", other),
            )),
            None => Err(CohortError::malformed(path.to_string(), "condition is missing 'type'")),
        }
    }

    fn parse_group(&self, object: &Object, path: &NodePath) -> Result<FilterNode> {
        let operator = match object.get("type").and_then(Value::as_str) {
            Some(s) if s.eq_ignore_ascii_case("and") => GroupOperator::And,
            Some(s) if s.eq_ignore_ascii_case("or") => GroupOperator::Or,
            Some(other) => {
                return Err(CohortError::malformed(
                    path.to_string(),
                    format!("unknown group operator '{}'", other),
                ))
            }
            None => return Err(CohortError::malformed(path.to_string(), "group is missing 'type'")),
        };

        let values = object
            .get("values")
            .and_then(Value::as_array)
            .ok_or_else(|| CohortError::malformed(path.to_string(), "'values' must be an array"))?;
        if values.is_empty() {
            return Err(CohortError::malformed(path.to_string(), "group has no conditions"));
        }

        let children = values
            .iter()
            .enumerate()
            .map(|(index, child)| self.parse_node(child, &path.child(index)))
            .collect::<Result<Vec<_>>>()?;

        Ok(FilterNode::Group { operator, children })
    }

    fn parse_behavioral(&self, object: &Object, path: &NodePath) -> Result<FilterNode> {
        let subject = parse_subject(object, "key", "event_type", path)?;
        let kind_tag = required_str(object, "value", path)?;

        let kind = match kind_tag {
            "performed_event" => BehavioralKind::PerformedEvent {
                window: window(object, "time_value", "time_interval", path)?,
            },
            "performed_event_multiple" => BehavioralKind::PerformedEventMultiple {
                window: window(object, "time_value", "time_interval", path)?,
                comparison: comparison(object, None, path)?,
            },
            "stopped_performing_event" => BehavioralKind::StoppedPerforming {
                window: window(object, "time_value", "time_interval", path)?,
                sequence_window: window(object, "seq_time_value", "seq_time_interval", path)?,
            },
            "restarted_performing_event" => BehavioralKind::RestartedPerforming {
                window: window(object, "time_value", "time_interval", path)?,
                sequence_window: window(object, "seq_time_value", "seq_time_interval", path)?,
            },
            "performed_event_first_time" => BehavioralKind::PerformedFirstTime {
                window: window(object, "time_value", "time_interval", path)?,
            },
            "performed_event_sequence" => BehavioralKind::PerformedSequence {
                window: window(object, "time_value", "time_interval", path)?,
                sequence_window: window(object, "seq_time_value", "seq_time_interval", path)?,
                next: parse_subject(object, "seq_event", "seq_event_type", path)?,
            },
            "performed_event_regularly" => {
                let total_periods = positive_int(object, "total_periods", path)?;
                let min_periods = positive_int(object, "min_periods", path)?;
                if total_periods > MAX_TOTAL_PERIODS {
                    return Err(CohortError::malformed(
                        path.to_string(),
                        format!(
                            "total_periods ({}) must not exceed {}",
                            total_periods, MAX_TOTAL_PERIODS
                        ),
                    ));
                }
                if min_periods > total_periods {
                    return Err(CohortError::malformed(
                        path.to_string(),
                        format!(
                            "min_periods ({}) must not exceed total_periods ({})",
                            min_periods, total_periods
                        ),
                    ));
                }
                BehavioralKind::PerformedRegularly {
                    window: window(object, "time_value", "time_interval", path)?,
                    comparison: comparison(object, Some(1), path)?,
                    total_periods: to_periods(total_periods, "total_periods", path)?,
                    min_periods: to_periods(min_periods, "min_periods", path)?,
                }
            }
            other => {
                return Err(CohortError::malformed(
                    path.to_string(),
                    format!("unknown behavioral condition '{}'", other),
                ))
            }
        };

        Ok(FilterNode::Behavioral(BehavioralCondition { subject, kind }))
    }

    fn parse_person(&self, object: &Object, path: &NodePath) -> Result<FilterNode> {
        let key = required_str(object, "key", path)?.to_string();
        let operator = match object.get("operator") {
            None | Some(Value::Null) => PropertyOperator::Exact,
            Some(Value::String(s)) => PropertyOperator::parse(s).ok_or_else(|| {
                CohortError::malformed(path.to_string(), format!("unknown property operator '{}'", s))
            })?,
            Some(other) => {
                return Err(CohortError::malformed(
                    path.to_string(),
                    format!("'operator' must be a string, found {}", other),
                ))
            }
        };

        let raw = object.get("value").unwrap_or(&Value::Null);
        let value = match operator {
            PropertyOperator::IsSet | PropertyOperator::IsNotSet => PropertyValue::Empty,
            PropertyOperator::Exact | PropertyOperator::IsNot => match raw {
                Value::Array(items) => {
                    if items.is_empty() {
                        return Err(CohortError::malformed(path.to_string(), "'value' list is empty"));
                    }
                    let values = items
                        .iter()
                        .map(|item| scalar_text(item, path))
                        .collect::<Result<Vec<_>>>()?;
                    PropertyValue::List(values)
                }
                scalar => PropertyValue::Text(scalar_text(scalar, path)?),
            },
            op if op.is_numeric() => PropertyValue::Number(number(raw, path)?),
            _ => PropertyValue::Text(scalar_text(raw, path)?),
        };

        if let (PropertyOperator::Regex | PropertyOperator::NotRegex, PropertyValue::Text(pattern)) = (operator, &value) {
            Regex::new(pattern).map_err(|e| {
                CohortError::malformed(path.to_string(), format!("invalid regex '{}': {}", pattern, e))
            })?;
        }

        Ok(FilterNode::Person(PersonPropertyCondition { key, operator, value }))
    }
}

/// 解析事件名或动作 id
fn parse_subject(object: &Object, key_field: &str, type_field: &str, path: &NodePath) -> Result<Subject> {
    let event_type = match object.get(type_field) {
        None | Some(Value::Null) => "events",
        Some(Value::String(s)) => s.as_str(),
        Some(other) => {
            return Err(CohortError::malformed(
                path.to_string(),
                format!("'{}' must be a string, found {}", type_field, other),
            ))
        }
    };

    match event_type {
        "events" => {
            let name = required_str(object, key_field, path)?;
            if name.is_empty() {
                return Err(CohortError::malformed(path.to_string(), format!("'{}' is empty", key_field)));
            }
            Ok(Subject::Event(name.to_string()))
        }
        "actions" => {
            let id = int_field(object, key_field, path)?.ok_or_else(|| {
                CohortError::malformed(path.to_string(), format!("missing action id in '{}'", key_field))
            })?;
            Ok(Subject::Action(id))
        }
        other => Err(CohortError::malformed(
            path.to_string(),
            format!("unknown event type '{}'", other),
        )),
    }
}

fn window(object: &Object, value_field: &str, interval_field: &str, path: &NodePath) -> Result<TimeWindow> {
    let value = positive_int(object, value_field, path)?;
    let interval = required_str(object, interval_field, path)?;
    let unit = TimeUnit::parse(interval).ok_or_else(|| {
        CohortError::malformed(
            path.to_string(),
            format!("'{}' must be one of day, week, month; found '{}'", interval_field, interval),
        )
    })?;
    Ok(TimeWindow::new(value, unit))
}

fn comparison(object: &Object, default_value: Option<i64>, path: &NodePath) -> Result<Comparison> {
    let operator = match object.get("operator").and_then(Value::as_str) {
        None | Some("gte") => ComparisonOperator::Gte,
        Some("lte") => ComparisonOperator::Lte,
        Some("eq") | Some("exact") => ComparisonOperator::Eq,
        Some(other) => {
            return Err(CohortError::malformed(
                path.to_string(),
                format!("unknown comparison operator '{}'", other),
            ))
        }
    };

    let value = match (int_field(object, "operator_value", path)?, default_value) {
        (Some(v), _) => v,
        (None, Some(default)) => default,
        (None, None) => {
            return Err(CohortError::malformed(path.to_string(), "missing 'operator_value'"));
        }
    };
    if value < 0 {
        return Err(CohortError::malformed(path.to_string(), "'operator_value' must not be negative"));
    }

    Ok(Comparison { operator, value })
}

fn as_object<'v>(value: &'v Value, path: &NodePath) -> Result<&'v Object> {
    value
        .as_object()
        .ok_or_else(|| CohortError::malformed(path.to_string(), format!("expected an object, found {}", value)))
}

fn required_str<'v>(object: &'v Object, field: &str, path: &NodePath) -> Result<&'v str> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(CohortError::malformed(
            path.to_string(),
            format!("'{}' must be a string, found {}", field, other),
        )),
        None => Err(CohortError::malformed(path.to_string(), format!("missing '{}'", field))),
    }
}

/// 整数字段, 接受 JSON 整数或整数字符串
fn int_field(object: &Object, field: &str, path: &NodePath) -> Result<Option<i64>> {
    let parsed = match object.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    parsed.map(Some).ok_or_else(|| {
        CohortError::malformed(path.to_string(), format!("'{}' must be an integer", field))
    })
}

fn positive_int(object: &Object, field: &str, path: &NodePath) -> Result<i64> {
    match int_field(object, field, path)? {
        Some(v) if v > 0 => Ok(v),
        Some(v) => Err(CohortError::malformed(
            path.to_string(),
            format!("'{}' must be positive, found {}", field, v),
        )),
        None => Err(CohortError::malformed(path.to_string(), format!("missing '{}'", field))),
    }
}

fn to_periods(value: i64, field: &str, path: &NodePath) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| CohortError::malformed(path.to_string(), format!("'{}' is too large", field)))
}

/// 属性值的字符串形式, 与存储端对 JSON 值去引号后的结果一致
fn scalar_text(value: &Value, path: &NodePath) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(CohortError::malformed(
            path.to_string(),
            format!("'value' must be a string, number or boolean, found {}", other),
        )),
    }
}

fn number(value: &Value, path: &NodePath) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| CohortError::malformed(path.to_string(), format!("'value' must be numeric, found {}", value)))
}
