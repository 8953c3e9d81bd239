//! Property and subject predicates rendered as store SQL.
//!
//! Person predicates are evaluated against the latest-person stage, whose
//! columns are `person_props` (the JSON blob) plus one column per
//! materialized property. Subject predicates are evaluated against the
//! events table aliased as `e`.

use std::collections::BTreeSet;

use crate::ast::{NodePath, PersonPropertyCondition, PropertyOperator, PropertyValue, Subject};
use crate::catalog::{ActionLookup, ActionStep, EntityKind, MaterializedColumns, UrlMatching};
use crate::error::{CohortError, Result};
use crate::params::{ParamScope, ParamValue, Params};

/// Column of the latest-person stage holding the JSON properties.
pub const PERSON_PROPS: &str = "person_props";

/// Event property read by action URL rules.
pub const CURRENT_URL: &str = "$current_url";

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Strips the JSON quoting so strings and numbers compare in text form.
fn unquoted_json(json_expr: &str, key_sql: &str) -> String {
    format!(
        "replaceRegexpAll(JSONExtractRaw({}, {}), '^\"|\"$', '')",
        json_expr, key_sql
    )
}

/// Materialized person columns referenced by `conditions`, ordered by name.
pub fn person_columns<'a, I>(conditions: I, columns: &dyn MaterializedColumns) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a PersonPropertyCondition>,
{
    conditions
        .into_iter()
        .filter_map(|condition| columns.materialized_column(EntityKind::Person, &condition.key))
        .collect()
}

/// Renders one person condition. Parameters are named after `path`.
pub fn person_condition_sql(
    path: &NodePath,
    condition: &PersonPropertyCondition,
    columns: &dyn MaterializedColumns,
) -> (String, Params) {
    let mut scope = ParamScope::new(path);
    let materialized = columns.materialized_column(EntityKind::Person, &condition.key);

    let sql = match (condition.operator, &materialized) {
        (PropertyOperator::IsSet, Some(column)) => format!("{} != ''", quote_ident(column)),
        (PropertyOperator::IsNotSet, Some(column)) => format!("{} = ''", quote_ident(column)),
        (PropertyOperator::IsSet, None) => {
            let key = scope.bind("key", ParamValue::String(condition.key.clone()));
            format!("JSONHas({}, {})", quote_ident(PERSON_PROPS), key)
        }
        (PropertyOperator::IsNotSet, None) => {
            let key = scope.bind("key", ParamValue::String(condition.key.clone()));
            format!("NOT JSONHas({}, {})", quote_ident(PERSON_PROPS), key)
        }
        (operator, _) => {
            let expr = match &materialized {
                Some(column) => quote_ident(column),
                None => {
                    let key = scope.bind("key", ParamValue::String(condition.key.clone()));
                    unquoted_json(&quote_ident(PERSON_PROPS), &key)
                }
            };
            compare(&expr, operator, &condition.value, &mut scope)
        }
    };

    (format!("({})", sql), scope.into_params())
}

fn compare(expr: &str, operator: PropertyOperator, value: &PropertyValue, scope: &mut ParamScope) -> String {
    match (operator, value) {
        (PropertyOperator::Exact, PropertyValue::List(values)) => {
            let list = scope.bind("value", ParamValue::StringList(values.clone()));
            format!("has({}, {})", list, expr)
        }
        (PropertyOperator::IsNot, PropertyValue::List(values)) => {
            let list = scope.bind("value", ParamValue::StringList(values.clone()));
            format!("NOT has({}, {})", list, expr)
        }
        (operator, PropertyValue::Number(n)) if operator.is_numeric() => {
            let number = scope.bind("value", ParamValue::Float(*n));
            let op = match operator {
                PropertyOperator::Gt => ">",
                PropertyOperator::Gte => ">=",
                PropertyOperator::Lt => "<",
                _ => "<=",
            };
            format!("toFloat64OrNull({}) {} {}", expr, op, number)
        }
        (operator, value) => {
            let text = match value {
                PropertyValue::Text(s) => s.clone(),
                PropertyValue::List(values) => values.join(","),
                PropertyValue::Number(n) => n.to_string(),
                PropertyValue::Empty => String::new(),
            };
            let text = scope.bind("value", ParamValue::String(text));
            match operator {
                PropertyOperator::IsNot => format!("{} != {}", expr, text),
                PropertyOperator::IContains => format!("positionCaseInsensitiveUTF8({}, {}) > 0", expr, text),
                PropertyOperator::NotIContains => format!("positionCaseInsensitiveUTF8({}, {}) = 0", expr, text),
                PropertyOperator::Regex => format!("match({}, {})", expr, text),
                PropertyOperator::NotRegex => format!("NOT match({}, {})", expr, text),
                _ => format!("{} = {}", expr, text),
            }
        }
    }
}

/// Renders the predicate matching `subject` on the events table.
///
/// `role` distinguishes the two subjects of a sequence (`event`, `seq_event`).
/// Fails with an unresolved reference when an action does not exist.
pub fn subject_sql(
    subject: &Subject,
    role: &str,
    scope: &mut ParamScope,
    columns: &dyn MaterializedColumns,
    actions: &dyn ActionLookup,
) -> Result<String> {
    match subject {
        Subject::Event(name) => {
            let event = scope.bind(role, ParamValue::String(name.clone()));
            Ok(format!("({} = {})", event_column("event"), event))
        }
        Subject::Action(id) => {
            let steps = actions
                .action_steps(*id)
                .ok_or_else(|| CohortError::unresolved_action(*id))?;
            if steps.is_empty() {
                return Ok("(0 = 1)".to_string());
            }
            let parts: Vec<String> = steps
                .iter()
                .enumerate()
                .map(|(index, step)| step_sql(step, &format!("{}_s{}", role, index), scope, columns))
                .collect();
            Ok(format!("({})", parts.join(" OR ")))
        }
    }
}

fn step_sql(step: &ActionStep, role: &str, scope: &mut ParamScope, columns: &dyn MaterializedColumns) -> String {
    let mut parts = Vec::new();
    if let Some(event) = &step.event {
        let event = scope.bind(&format!("{}_event", role), ParamValue::String(event.clone()));
        parts.push(format!("{} = {}", event_column("event"), event));
    }
    if let Some(url) = &step.url {
        let url_expr = match columns.materialized_column(EntityKind::Events, CURRENT_URL) {
            Some(column) => event_column(&column),
            None => unquoted_json(&event_column("properties"), &quote_literal(CURRENT_URL)),
        };
        let url = scope.bind(&format!("{}_url", role), ParamValue::String(url.clone()));
        parts.push(match step.url_matching {
            UrlMatching::Exact => format!("{} = {}", url_expr, url),
            UrlMatching::Contains => format!("position({}, {}) > 0", url_expr, url),
            UrlMatching::Regex => format!("match({}, {})", url_expr, url),
        });
    }
    if parts.is_empty() {
        return "(1 = 1)".to_string();
    }
    format!("({})", parts.join(" AND "))
}

/// A column of the events table, qualified by its `e` alias.
pub fn event_column(column: &str) -> String {
    format!("\"e\".{}", quote_ident(column))
}
