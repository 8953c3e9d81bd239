//! Behavioral condition compiler.
//!
//! Every behavioral leaf becomes one aggregate over the events table:
//!
//! ```text
//! SELECT pdi.person_id
//! FROM events AS e
//! INNER JOIN (latest distinct id → person) AS pdi ON ...
//! [INNER JOIN (persons passing the pushed conditions) AS pushed_person ON ...]
//! WHERE team AND subject AND timestamp < now() [AND timestamp >= lower bound]
//! GROUP BY pdi.person_id
//! HAVING <kind>
//! ```
//!
//! Only the WHERE lower bound and the HAVING clause depend on the kind.
//! All window arithmetic is relative to `now()`.

use sea_query::{Alias, Expr, JoinType, Query};
use tracing::debug;

use crate::ast::{BehavioralCondition, BehavioralKind, Comparison, NodePath, TimeUnit, TimeWindow};
use crate::catalog::TableMapping;
use crate::error::Result;
use crate::params::{ParamScope, ParamValue};
use crate::planner::PushedCondition;
use crate::property::{event_column, subject_sql};
use crate::sql_compiler::{
    distinct_id_stage, person_scan_statement, pushed_filter, raw, team_filter, ColumnName, CompileContext,
    CompiledFragment, StageAlias, PERSON_ID,
};

const TIMESTAMP: &str = "\"e\".\"timestamp\"";

/// Kind-specific parts of one event scan.
struct EventScan {
    matcher: String,
    lower_bound: Option<String>,
    having: String,
}

pub struct BehavioralCompiler<'a> {
    ctx: &'a CompileContext<'a>,
    tables: &'a TableMapping,
}

impl<'a> BehavioralCompiler<'a> {
    pub fn new(ctx: &'a CompileContext<'a>, tables: &'a TableMapping) -> Self {
        Self { ctx, tables }
    }

    /// Compiles one leaf. `pushed` conditions restrict the scan to persons
    /// that pass all of them.
    pub fn compile(
        &self,
        path: &NodePath,
        condition: &BehavioralCondition,
        pushed: &[PushedCondition],
    ) -> Result<CompiledFragment> {
        let mut scope = ParamScope::new(path);
        let subject = subject_sql(
            &condition.subject,
            "event",
            &mut scope,
            self.ctx.columns,
            self.ctx.actions,
        )?;

        let scan = match &condition.kind {
            BehavioralKind::PerformedEvent { window } => performed_event(subject, window, &mut scope),
            BehavioralKind::PerformedEventMultiple { window, comparison } => {
                performed_event_multiple(subject, window, comparison, &mut scope)
            }
            BehavioralKind::StoppedPerforming {
                window,
                sequence_window,
            } => stopped_performing(subject, window, sequence_window, &mut scope),
            BehavioralKind::RestartedPerforming {
                window,
                sequence_window,
            } => restarted_performing(subject, window, sequence_window, &mut scope),
            BehavioralKind::PerformedFirstTime { window } => performed_first_time(subject, window, &mut scope),
            BehavioralKind::PerformedSequence {
                window,
                sequence_window,
                next,
            } => {
                let next = subject_sql(next, "seq_event", &mut scope, self.ctx.columns, self.ctx.actions)?;
                performed_sequence(subject, next, window, sequence_window, &mut scope)
            }
            BehavioralKind::PerformedRegularly {
                window,
                comparison,
                total_periods,
                min_periods,
            } => performed_regularly(subject, window, comparison, *total_periods, *min_periods, &mut scope),
        };

        debug!(path = %path, kind = condition.kind.name(), pushed = pushed.len(), "behavioral condition compiled");

        let mut params = scope.into_params();
        let mut select = Query::select();
        select
            .expr_as(
                Expr::col((StageAlias::DistinctIds, ColumnName::person_id())),
                Alias::new(PERSON_ID),
            )
            .from_as(Alias::new(self.tables.events.as_str()), StageAlias::Events)
            .join_subquery(
                JoinType::InnerJoin,
                distinct_id_stage(self.tables),
                StageAlias::DistinctIds,
                Expr::col((StageAlias::DistinctIds, ColumnName::new("distinct_id")))
                    .equals((StageAlias::Events, ColumnName::new("distinct_id"))),
            );

        if let Some((predicate, pushed_params, columns)) = pushed_filter(pushed, self.ctx.columns) {
            select.join_subquery(
                JoinType::InnerJoin,
                person_scan_statement(predicate, &columns, self.tables),
                StageAlias::PushedPersons,
                Expr::col((StageAlias::PushedPersons, ColumnName::person_id()))
                    .equals((StageAlias::DistinctIds, ColumnName::person_id())),
            );
            params.extend(pushed_params);
        }

        select
            .and_where(team_filter(&event_column("team_id")))
            .and_where(raw(scan.matcher))
            .and_where(raw(format!("{} < now()", TIMESTAMP)));
        if let Some(lower) = scan.lower_bound {
            select.and_where(raw(format!("{} >= {}", TIMESTAMP, lower)));
        }
        select
            .group_by_col((StageAlias::DistinctIds, ColumnName::person_id()))
            .and_having(raw(scan.having));

        Ok(CompiledFragment {
            statement: select,
            params,
        })
    }
}

fn interval(unit: TimeUnit, amount: &str) -> String {
    let function = match unit {
        TimeUnit::Day => "toIntervalDay",
        TimeUnit::Week => "toIntervalWeek",
        TimeUnit::Month => "toIntervalMonth",
    };
    format!("{}({})", function, amount)
}

/// Binds the window length and returns it as an interval.
fn window_interval(window: &TimeWindow, role: &str, scope: &mut ParamScope) -> String {
    let amount = scope.bind(role, ParamValue::Int(window.value));
    interval(window.unit, &amount)
}

/// `now()` shifted back by every interval in turn.
fn ago(intervals: &[&str]) -> String {
    let mut sql = String::from("now()");
    for interval in intervals {
        sql.push_str(" - ");
        sql.push_str(interval);
    }
    format!("({})", sql)
}

fn count_before(upper: &str) -> String {
    format!("countIf({} < {})", TIMESTAMP, upper)
}

fn count_since(lower: &str) -> String {
    format!("countIf({} >= {})", TIMESTAMP, lower)
}

fn count_between(lower: &str, upper: &str) -> String {
    format!("countIf({ts} >= {} AND {ts} < {})", lower, upper, ts = TIMESTAMP)
}

/// Count test that only passes for persons with at least one event.
fn compare_count(count: &str, comparison: &Comparison, scope: &mut ParamScope) -> String {
    let value = scope.bind("count", ParamValue::Int(comparison.value));
    format!(
        "({count} > 0 AND {count} {} {})",
        comparison.operator.sql(),
        value,
        count = count
    )
}

fn performed_event(matcher: String, window: &TimeWindow, scope: &mut ParamScope) -> EventScan {
    let window = window_interval(window, "time", scope);
    EventScan {
        matcher,
        lower_bound: Some(ago(&[&window])),
        having: "count() > 0".to_string(),
    }
}

fn performed_event_multiple(
    matcher: String,
    window: &TimeWindow,
    comparison: &Comparison,
    scope: &mut ParamScope,
) -> EventScan {
    let window = window_interval(window, "time", scope);
    EventScan {
        matcher,
        lower_bound: Some(ago(&[&window])),
        having: compare_count("count()", comparison, scope),
    }
}

/// At least one event in `[now - seq - window, now - seq)`, none since.
fn stopped_performing(
    matcher: String,
    window: &TimeWindow,
    sequence_window: &TimeWindow,
    scope: &mut ParamScope,
) -> EventScan {
    let window = window_interval(window, "time", scope);
    let sequence = window_interval(sequence_window, "seq_time", scope);
    let boundary = ago(&[&sequence]);
    EventScan {
        matcher,
        lower_bound: Some(ago(&[&sequence, &window])),
        having: format!("{} > 0 AND {} = 0", count_before(&boundary), count_since(&boundary)),
    }
}

/// Active before `now - seq - window`, silent until `now - seq`, active again since.
fn restarted_performing(
    matcher: String,
    window: &TimeWindow,
    sequence_window: &TimeWindow,
    scope: &mut ParamScope,
) -> EventScan {
    let window = window_interval(window, "time", scope);
    let sequence = window_interval(sequence_window, "seq_time", scope);
    let earlier = ago(&[&sequence, &window]);
    let boundary = ago(&[&sequence]);
    EventScan {
        matcher,
        lower_bound: None,
        having: format!(
            "{} > 0 AND {} = 0 AND {} > 0",
            count_before(&earlier),
            count_between(&earlier, &boundary),
            count_since(&boundary)
        ),
    }
}

/// The earliest event ever lies inside the window.
fn performed_first_time(matcher: String, window: &TimeWindow, scope: &mut ParamScope) -> EventScan {
    let window = window_interval(window, "time", scope);
    EventScan {
        matcher,
        lower_bound: None,
        having: format!("min({}) >= {}", TIMESTAMP, ago(&[&window])),
    }
}

/// A `first` event inside the window followed by a `next` event no later
/// than `sequence_window` after it.
fn performed_sequence(
    first: String,
    next: String,
    window: &TimeWindow,
    sequence_window: &TimeWindow,
    scope: &mut ParamScope,
) -> EventScan {
    let window = window_interval(window, "time", scope);
    let sequence = window_interval(sequence_window, "seq_time", scope);
    let having = format!(
        "arrayExists(first_ts -> arrayExists(next_ts -> next_ts > first_ts AND next_ts <= first_ts + {seq}, \
         groupArrayIf({ts}, {next})), groupArrayIf({ts}, {first}))",
        seq = sequence,
        ts = TIMESTAMP,
        next = next,
        first = first,
    );
    EventScan {
        matcher: format!("({} OR {})", first, next),
        lower_bound: Some(ago(&[&window])),
        having,
    }
}

/// Period `i` (0 = most recent) covers `[now - (i + 1) * window, now - i * window)`.
fn performed_regularly(
    matcher: String,
    window: &TimeWindow,
    comparison: &Comparison,
    total_periods: u32,
    min_periods: u32,
    scope: &mut ParamScope,
) -> EventScan {
    let amount = scope.bind("time", ParamValue::Int(window.value));
    let periods_ago = |periods: u32| -> String {
        let length = if periods == 1 {
            interval(window.unit, &amount)
        } else {
            interval(window.unit, &format!("{} * {}", amount, periods))
        };
        ago(&[&length])
    };

    let mut terms = Vec::new();
    for period in 0..total_periods {
        let lower = periods_ago(period + 1);
        let count = if period == 0 {
            count_since(&lower)
        } else {
            count_between(&lower, &periods_ago(period))
        };
        terms.push(count);
    }

    let lower_bound = Some(periods_ago(total_periods));
    let terms: Vec<String> = terms
        .iter()
        .map(|count| compare_count(count, comparison, scope))
        .collect();
    let min_periods = scope.bind("min_periods", ParamValue::Int(i64::from(min_periods)));

    EventScan {
        matcher,
        lower_bound,
        having: format!("({}) >= {}", terms.join(" + "), min_periods),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ComparisonOperator, PersonPropertyCondition, PropertyOperator, PropertyValue, Subject};
    use crate::catalog::{ActionStep, CatalogConfig, UrlMatching};
    use crate::error::CohortError;

    fn compile(kind: BehavioralKind, pushed: &[PushedCondition]) -> CompiledFragment {
        let mut catalog = CatalogConfig::default();
        catalog.add_action(3, vec![ActionStep::event("$autocapture").with_url("/signup", UrlMatching::Contains)]);
        let ctx = CompileContext::new(1, &catalog);
        let tables = TableMapping::default();
        let condition = BehavioralCondition {
            subject: Subject::Event("$pageview".to_string()),
            kind,
        };
        BehavioralCompiler::new(&ctx, &tables)
            .compile(&NodePath(vec![0, 1]), &condition, pushed)
            .unwrap()
    }

    fn week(value: i64) -> TimeWindow {
        TimeWindow::new(value, TimeUnit::Week)
    }

    /// Text after the outer `HAVING`, which is always the last clause.
    fn having_clause(sql: &str) -> &str {
        sql.rsplit_once(" HAVING ").map(|(_, having)| having).unwrap()
    }

    /// Outer `WHERE` text up to `GROUP BY`.
    fn where_clause(sql: &str) -> &str {
        let (head, _) = sql.rsplit_once(" GROUP BY ").unwrap();
        head.rsplit_once(" WHERE ").map(|(_, filter)| filter).unwrap()
    }

    #[test]
    fn test_performed_event() {
        let fragment = compile(BehavioralKind::PerformedEvent { window: week(1) }, &[]);
        let sql = fragment.sql_text();

        assert!(sql.starts_with("SELECT \"pdi\".\"person_id\" AS \"person_id\" FROM \"events\" AS \"e\""));
        assert!(sql.contains("INNER JOIN (SELECT \"distinct_id\""));
        assert!(sql.contains("(\"e\".\"event\" = {n_0_1_event:String})"));
        assert!(sql.contains("\"e\".\"timestamp\" >= (now() - toIntervalWeek({n_0_1_time:Int64}))"));
        assert!(sql.contains("GROUP BY \"pdi\".\"person_id\" HAVING (count() > 0)"));
        assert!(sql.contains("\"e\".\"team_id\" = {team_id:Int64}"));
        assert!(!sql.contains("pushed_person"));
        assert_eq!(fragment.produces(), "person_id");
        assert_eq!(fragment.params["n_0_1_time"], ParamValue::Int(1));
    }

    #[test]
    fn test_multiple_compares_count() {
        let fragment = compile(
            BehavioralKind::PerformedEventMultiple {
                window: week(1),
                comparison: Comparison {
                    operator: ComparisonOperator::Lte,
                    value: 3,
                },
            },
            &[],
        );
        let sql = fragment.sql_text();
        assert!(sql.contains("count() > 0 AND count() <= {n_0_1_count:Int64}"));
        assert_eq!(fragment.params["n_0_1_count"], ParamValue::Int(3));
    }

    #[test]
    fn test_stopped_splits_at_sequence_boundary() {
        let fragment = compile(
            BehavioralKind::StoppedPerforming {
                window: week(1),
                sequence_window: TimeWindow::new(3, TimeUnit::Day),
            },
            &[],
        );
        let sql = fragment.sql_text();
        assert!(sql.contains(
            "(now() - toIntervalDay({n_0_1_seq_time:Int64}) - toIntervalWeek({n_0_1_time:Int64}))"
        ));
        assert!(sql.contains("countIf(\"e\".\"timestamp\" < (now() - toIntervalDay({n_0_1_seq_time:Int64}))) > 0"));
        assert!(sql.contains("countIf(\"e\".\"timestamp\" >= (now() - toIntervalDay({n_0_1_seq_time:Int64}))) = 0"));
    }

    #[test]
    fn test_restarted_and_first_time_scan_full_history() {
        let restarted = compile(
            BehavioralKind::RestartedPerforming {
                window: week(1),
                sequence_window: TimeWindow::new(2, TimeUnit::Day),
            },
            &[],
        )
        .sql_text();
        let earlier = "(now() - toIntervalDay({n_0_1_seq_time:Int64}) - toIntervalWeek({n_0_1_time:Int64}))";
        let boundary = "(now() - toIntervalDay({n_0_1_seq_time:Int64}))";
        let expected = format!(
            "(countIf({ts} < {earlier}) > 0 AND countIf({ts} >= {earlier} AND {ts} < {boundary}) = 0 \
             AND countIf({ts} >= {boundary}) > 0)",
            ts = TIMESTAMP,
            earlier = earlier,
            boundary = boundary,
        );
        assert_eq!(having_clause(&restarted), expected);
        assert!(!where_clause(&restarted).contains(">= (now()"));

        let first_time = compile(BehavioralKind::PerformedFirstTime { window: week(2) }, &[]).sql_text();
        assert_eq!(
            having_clause(&first_time),
            "(min(\"e\".\"timestamp\") >= (now() - toIntervalWeek({n_0_1_time:Int64})))"
        );
        assert!(!where_clause(&first_time).contains(">= (now()"));
    }

    #[test]
    fn test_sequence_binds_both_subjects() {
        let fragment = compile(
            BehavioralKind::PerformedSequence {
                window: week(1),
                sequence_window: TimeWindow::new(2, TimeUnit::Day),
                next: Subject::Action(3),
            },
            &[],
        );
        let sql = fragment.sql_text();
        assert!(sql.contains("arrayExists(first_ts -> arrayExists(next_ts -> next_ts > first_ts"));
        assert!(sql.contains("{n_0_1_seq_event_s0_event:String}"));
        assert_eq!(fragment.params["n_0_1_seq_time"], ParamValue::Int(2));
        assert_eq!(fragment.params["n_0_1_seq_event_s0_url"], ParamValue::String("/signup".to_string()));
    }

    #[test]
    fn test_sequence_orders_first_before_next() {
        let sql = compile(
            BehavioralKind::PerformedSequence {
                window: week(1),
                sequence_window: TimeWindow::new(2, TimeUnit::Day),
                next: Subject::Event("$signup".to_string()),
            },
            &[],
        )
        .sql_text();
        let first = "(\"e\".\"event\" = {n_0_1_event:String})";
        let next = "(\"e\".\"event\" = {n_0_1_seq_event:String})";
        let expected = format!(
            "(arrayExists(first_ts -> arrayExists(next_ts -> next_ts > first_ts AND next_ts <= first_ts + \
             toIntervalDay({{n_0_1_seq_time:Int64}}), groupArrayIf({ts}, {next})), groupArrayIf({ts}, {first})))",
            ts = TIMESTAMP,
            first = first,
            next = next,
        );
        assert_eq!(having_clause(&sql), expected);

        let filter = where_clause(&sql);
        assert!(filter.contains(&format!("(({} OR {}))", first, next)));
        assert!(filter.contains("\"e\".\"timestamp\" >= (now() - toIntervalWeek({n_0_1_time:Int64}))"));
    }

    #[test]
    fn test_regularly_counts_every_period() {
        let fragment = compile(
            BehavioralKind::PerformedRegularly {
                window: TimeWindow::new(3, TimeUnit::Day),
                comparison: Comparison {
                    operator: ComparisonOperator::Gte,
                    value: 2,
                },
                total_periods: 3,
                min_periods: 2,
            },
            &[],
        );
        let sql = fragment.sql_text();

        let period_start = |periods: u32| match periods {
            1 => "(now() - toIntervalDay({n_0_1_time:Int64}))".to_string(),
            n => format!("(now() - toIntervalDay({{n_0_1_time:Int64}} * {}))", n),
        };
        let counts = [
            format!("countIf({} >= {})", TIMESTAMP, period_start(1)),
            format!("countIf({ts} >= {} AND {ts} < {})", period_start(2), period_start(1), ts = TIMESTAMP),
            format!("countIf({ts} >= {} AND {ts} < {})", period_start(3), period_start(2), ts = TIMESTAMP),
        ];
        let terms: Vec<String> = counts
            .iter()
            .map(|count| format!("({count} > 0 AND {count} >= {{n_0_1_count:Int64}})", count = count))
            .collect();
        let expected = format!("(({}) >= {{n_0_1_min_periods:Int64}})", terms.join(" + "));

        assert_eq!(having_clause(&sql), expected);
        assert!(where_clause(&sql).contains(&format!("\"e\".\"timestamp\" >= {}", period_start(3))));
        assert_eq!(fragment.params["n_0_1_min_periods"], ParamValue::Int(2));
        assert_eq!(fragment.params["n_0_1_count"], ParamValue::Int(2));
    }

    #[test]
    fn test_pushed_conditions_join_person_scan() {
        let pushed = vec![PushedCondition {
            path: NodePath(vec![1]),
            condition: PersonPropertyCondition {
                key: "email".to_string(),
                operator: PropertyOperator::Exact,
                value: PropertyValue::Text("test@posthog.com".to_string()),
            },
        }];
        let fragment = compile(BehavioralKind::PerformedEvent { window: week(1) }, &pushed);
        let sql = fragment.sql_text();

        assert!(sql.contains("AS \"pushed_person\" ON \"pushed_person\".\"person_id\" = \"pdi\".\"person_id\""));
        assert_eq!(fragment.params["n_1_value"], ParamValue::String("test@posthog.com".to_string()));
    }

    #[test]
    fn test_unknown_action_subject() {
        let catalog = CatalogConfig::default();
        let ctx = CompileContext::new(1, &catalog);
        let tables = TableMapping::default();
        let condition = BehavioralCondition {
            subject: Subject::Action(42),
            kind: BehavioralKind::PerformedEvent { window: week(1) },
        };
        let result = BehavioralCompiler::new(&ctx, &tables).compile(&NodePath(vec![0]), &condition, &[]);
        assert!(matches!(result, Err(CohortError::UnresolvedReference { .. })));
    }
}
