//! 进程内求值器
//!
//! 在内存中的用户和事件数据上计算 cohort 成员, 用于在没有分析型存储的情况下
//! 验证编译结果的语义。提供两种求值方式:
//!
//! - [`Dataset::matching_persons`] 直接按过滤树的布尔语义求值
//! - [`Dataset::execute_plan`] 按 [`SetPlan`] 的集合运算求值, 包括 pushdown
//!   后的条件位置, 与生成的 SQL 一一对应
//!
//! 两者对同一份数据必须给出相同的结果。时间窗口的计算方式与 SQL 中的
//! `now() - toIntervalX(..)` 保持一致。

use chrono::{DateTime, Months, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::ast::{
    BehavioralCondition, BehavioralKind, FilterNode, GroupOperator, PersonPropertyCondition, PropertyOperator,
    PropertyValue, Subject, TimeUnit, TimeWindow,
};
use crate::catalog::{ActionLookup, ActionStep, UrlMatching};
use crate::error::{CohortError, Result};
use crate::planner::PushedCondition;
use crate::property::CURRENT_URL;
use crate::sql_compiler::{CohortPlan, PersonPredicate, SetPlan};

/// 用户的最新版本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: Uuid,
    #[serde(default)]
    pub distinct_ids: Vec<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub distinct_id: String,
    pub event: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// 一个团队的用户和事件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    pub persons: Vec<Person>,
    pub events: Vec<Event>,
}

impl Dataset {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 按过滤树的布尔语义求值
    pub fn matching_persons(
        &self,
        tree: &FilterNode,
        actions: &dyn ActionLookup,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<Uuid>> {
        let evaluator = Evaluator::new(self, actions, now);
        let mut out = BTreeSet::new();
        for person in &self.persons {
            if evaluator.node_matches(tree, person)? {
                out.insert(person.id);
            }
        }
        Ok(out)
    }

    /// 按编译计划的集合运算求值
    pub fn execute_plan(
        &self,
        plan: &CohortPlan,
        actions: &dyn ActionLookup,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<Uuid>> {
        let evaluator = Evaluator::new(self, actions, now);
        evaluator.execute(&plan.root, &plan.pushed)
    }
}

struct Evaluator<'a> {
    dataset: &'a Dataset,
    actions: &'a dyn ActionLookup,
    now: DateTime<Utc>,
    /// 每个用户在 `now` 之前的事件
    events: HashMap<Uuid, Vec<&'a Event>>,
}

impl<'a> Evaluator<'a> {
    fn new(dataset: &'a Dataset, actions: &'a dyn ActionLookup, now: DateTime<Utc>) -> Self {
        let owners: HashMap<&str, Uuid> = dataset
            .persons
            .iter()
            .flat_map(|person| person.distinct_ids.iter().map(move |id| (id.as_str(), person.id)))
            .collect();

        let mut events: HashMap<Uuid, Vec<&Event>> = HashMap::new();
        for event in &dataset.events {
            if event.timestamp >= now {
                continue;
            }
            if let Some(owner) = owners.get(event.distinct_id.as_str()) {
                events.entry(*owner).or_default().push(event);
            }
        }

        Self {
            dataset,
            actions,
            now,
            events,
        }
    }

    fn node_matches(&self, node: &FilterNode, person: &Person) -> Result<bool> {
        match node {
            FilterNode::Group { operator, children } => {
                for child in children {
                    let matched = self.node_matches(child, person)?;
                    match operator {
                        GroupOperator::And if !matched => return Ok(false),
                        GroupOperator::Or if matched => return Ok(true),
                        _ => {}
                    }
                }
                Ok(*operator == GroupOperator::And)
            }
            FilterNode::Behavioral(condition) => self.behavioral_matches(condition, person),
            FilterNode::Person(condition) => Ok(person_matches(condition, &person.properties)),
        }
    }

    fn execute(&self, plan: &SetPlan, pushed: &[PushedCondition]) -> Result<BTreeSet<Uuid>> {
        let passes_pushed =
            |person: &Person| pushed.iter().all(|item| person_matches(&item.condition, &person.properties));

        match plan {
            SetPlan::Behavioral { condition, .. } => {
                let mut out = BTreeSet::new();
                for person in self.dataset.persons.iter().filter(|p| passes_pushed(*p)) {
                    if self.behavioral_matches(condition, person)? {
                        out.insert(person.id);
                    }
                }
                Ok(out)
            }
            SetPlan::PersonScan { predicate, .. } => Ok(self
                .dataset
                .persons
                .iter()
                .filter(|person| passes_pushed(*person) && predicate_matches(predicate, &person.properties))
                .map(|person| person.id)
                .collect()),
            SetPlan::Intersect { inputs, .. } => {
                let mut result: Option<BTreeSet<Uuid>> = None;
                for input in inputs {
                    let set = self.execute(input, pushed)?;
                    result = Some(match result {
                        Some(acc) => acc.intersection(&set).copied().collect(),
                        None => set,
                    });
                }
                Ok(result.unwrap_or_default())
            }
            SetPlan::Union { inputs, full_scan, .. } => {
                let mut out = BTreeSet::new();
                for input in inputs.iter().chain(full_scan.as_deref()) {
                    out.extend(self.execute(input, pushed)?);
                }
                Ok(out)
            }
        }
    }

    fn behavioral_matches(&self, condition: &BehavioralCondition, person: &Person) -> Result<bool> {
        let events = self.events.get(&person.id).map(Vec::as_slice).unwrap_or(&[]);
        let first = SubjectMatcher::resolve(&condition.subject, self.actions)?;
        let times = first.timestamps(events);
        let now = self.now;

        let matched = match &condition.kind {
            BehavioralKind::PerformedEvent { window } => {
                let lower = shift_back(now, window, 1);
                times.iter().any(|t| *t >= lower)
            }
            BehavioralKind::PerformedEventMultiple { window, comparison } => {
                let lower = shift_back(now, window, 1);
                comparison.satisfied_by(count_in(&times, Some(lower), None))
            }
            BehavioralKind::StoppedPerforming {
                window,
                sequence_window,
            } => {
                let boundary = shift_back(now, sequence_window, 1);
                let lower = shift_back(boundary, window, 1);
                count_in(&times, Some(lower), Some(boundary)) > 0 && count_in(&times, Some(boundary), None) == 0
            }
            BehavioralKind::RestartedPerforming {
                window,
                sequence_window,
            } => {
                let boundary = shift_back(now, sequence_window, 1);
                let earlier = shift_back(boundary, window, 1);
                count_in(&times, None, Some(earlier)) > 0
                    && count_in(&times, Some(earlier), Some(boundary)) == 0
                    && count_in(&times, Some(boundary), None) > 0
            }
            BehavioralKind::PerformedFirstTime { window } => {
                let lower = shift_back(now, window, 1);
                times.iter().min().is_some_and(|first| *first >= lower)
            }
            BehavioralKind::PerformedSequence {
                window,
                sequence_window,
                next,
            } => {
                let lower = shift_back(now, window, 1);
                let next_times = SubjectMatcher::resolve(next, self.actions)?.timestamps(events);
                times.iter().filter(|t1| **t1 >= lower).any(|t1| {
                    let limit = shift_forward(*t1, sequence_window);
                    next_times.iter().any(|t2| t2 > t1 && *t2 <= limit)
                })
            }
            BehavioralKind::PerformedRegularly {
                window,
                comparison,
                total_periods,
                min_periods,
            } => {
                let satisfied = (0..*total_periods)
                    .filter(|period| {
                        let lower = shift_back(now, window, period + 1);
                        let upper = if *period == 0 {
                            None
                        } else {
                            Some(shift_back(now, window, *period))
                        };
                        comparison.satisfied_by(count_in(&times, Some(lower), upper))
                    })
                    .count();
                satisfied >= *min_periods as usize
            }
        };
        Ok(matched)
    }
}

/// 事件或动作的匹配器, 动作在构造时解析
enum SubjectMatcher {
    Event(String),
    Steps(Vec<(ActionStep, Option<Regex>)>),
}

impl SubjectMatcher {
    fn resolve(subject: &Subject, actions: &dyn ActionLookup) -> Result<Self> {
        match subject {
            Subject::Event(name) => Ok(SubjectMatcher::Event(name.clone())),
            Subject::Action(id) => {
                let steps = actions.action_steps(*id).ok_or_else(|| CohortError::unresolved_action(*id))?;
                let steps = steps
                    .into_iter()
                    .map(|step| -> Result<(ActionStep, Option<Regex>)> {
                        let pattern = match (&step.url, step.url_matching) {
                            (Some(url), UrlMatching::Regex) => Some(Regex::new(url).map_err(|e| {
                                CohortError::Config(format!("invalid url pattern '{}' in action {}: {}", url, id, e))
                            })?),
                            _ => None,
                        };
                        Ok((step, pattern))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(SubjectMatcher::Steps(steps))
            }
        }
    }

    fn matches(&self, event: &Event) -> bool {
        match self {
            SubjectMatcher::Event(name) => event.event == *name,
            SubjectMatcher::Steps(steps) => steps.iter().any(|(step, pattern)| step_matches(step, pattern.as_ref(), event)),
        }
    }

    fn timestamps(&self, events: &[&Event]) -> Vec<DateTime<Utc>> {
        events
            .iter()
            .filter(|event| self.matches(event))
            .map(|event| event.timestamp)
            .collect()
    }
}

fn step_matches(step: &ActionStep, pattern: Option<&Regex>, event: &Event) -> bool {
    if let Some(name) = &step.event {
        if event.event != *name {
            return false;
        }
    }
    let Some(url) = &step.url else {
        return true;
    };
    let current = property_text(&event.properties, CURRENT_URL);
    match step.url_matching {
        UrlMatching::Exact => current == *url,
        UrlMatching::Contains => current.contains(url.as_str()),
        UrlMatching::Regex => pattern.is_some_and(|re| re.is_match(&current)),
    }
}

/// `[lower, upper)` 内的事件数, 边界为 `None` 表示不限
fn count_in(times: &[DateTime<Utc>], lower: Option<DateTime<Utc>>, upper: Option<DateTime<Utc>>) -> i64 {
    times
        .iter()
        .filter(|t| lower.map_or(true, |lower| **t >= lower) && upper.map_or(true, |upper| **t < upper))
        .count() as i64
}

/// `at - periods * window`, 月份按日历月计算, 超出范围时取最早时间
fn shift_back(at: DateTime<Utc>, window: &TimeWindow, periods: u32) -> DateTime<Utc> {
    let amount = window.value.saturating_mul(i64::from(periods));
    let shifted = match window.unit {
        TimeUnit::Day => TimeDelta::try_days(amount).and_then(|delta| at.checked_sub_signed(delta)),
        TimeUnit::Week => TimeDelta::try_weeks(amount).and_then(|delta| at.checked_sub_signed(delta)),
        TimeUnit::Month => u32::try_from(amount)
            .ok()
            .and_then(|months| at.checked_sub_months(Months::new(months))),
    };
    shifted.unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `at + window`, 超出范围时取最晚时间
fn shift_forward(at: DateTime<Utc>, window: &TimeWindow) -> DateTime<Utc> {
    let shifted = match window.unit {
        TimeUnit::Day => TimeDelta::try_days(window.value).and_then(|delta| at.checked_add_signed(delta)),
        TimeUnit::Week => TimeDelta::try_weeks(window.value).and_then(|delta| at.checked_add_signed(delta)),
        TimeUnit::Month => u32::try_from(window.value)
            .ok()
            .and_then(|months| at.checked_add_months(Months::new(months))),
    };
    shifted.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// 属性的字符串形式, 与存储端 `JSONExtractRaw` 去引号后的结果一致:
/// 不存在时为空字符串, JSON `null` 为 `"null"`
fn property_text(properties: &Map<String, Value>, key: &str) -> String {
    match properties.get(key) {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn predicate_matches(predicate: &PersonPredicate, properties: &Map<String, Value>) -> bool {
    match predicate {
        PersonPredicate::Leaf(_, condition) => person_matches(condition, properties),
        PersonPredicate::All(parts) => parts.iter().all(|p| predicate_matches(p, properties)),
        PersonPredicate::Any(parts) => parts.iter().any(|p| predicate_matches(p, properties)),
    }
}

pub fn person_matches(condition: &PersonPropertyCondition, properties: &Map<String, Value>) -> bool {
    match condition.operator {
        PropertyOperator::IsSet => return properties.contains_key(&condition.key),
        PropertyOperator::IsNotSet => return !properties.contains_key(&condition.key),
        _ => {}
    }

    let actual = property_text(properties, &condition.key);
    match (&condition.value, condition.operator) {
        (PropertyValue::List(values), PropertyOperator::Exact) => values.contains(&actual),
        (PropertyValue::List(values), PropertyOperator::IsNot) => !values.contains(&actual),
        (PropertyValue::Number(expected), operator) if operator.is_numeric() => {
            let Ok(actual) = actual.trim().parse::<f64>() else {
                return false;
            };
            match operator {
                PropertyOperator::Gt => actual > *expected,
                PropertyOperator::Gte => actual >= *expected,
                PropertyOperator::Lt => actual < *expected,
                _ => actual <= *expected,
            }
        }
        (value, operator) => {
            let expected = match value {
                PropertyValue::Text(s) => s.clone(),
                PropertyValue::List(values) => values.join(","),
                PropertyValue::Number(n) => n.to_string(),
                PropertyValue::Empty => String::new(),
            };
            match operator {
                PropertyOperator::IsNot => actual != expected,
                PropertyOperator::IContains => actual.to_lowercase().contains(&expected.to_lowercase()),
                PropertyOperator::NotIContains => !actual.to_lowercase().contains(&expected.to_lowercase()),
                PropertyOperator::Regex => Regex::new(&expected).is_ok_and(|re| re.is_match(&actual)),
                PropertyOperator::NotRegex => Regex::new(&expected).is_ok_and(|re| !re.is_match(&actual)),
                _ => actual == expected,
            }
        }
    }
}
