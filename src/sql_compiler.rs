//! SQL assembler that turns a cohort filter tree into one store query using sea-query.
//!
//! Compilation runs in three steps:
//!
//! 1. the [`PushdownPlanner`] annotates the tree;
//! 2. the tree and its annotations become a [`SetPlan`], a set algebra over
//!    person ids where every leaf is either a behavioral scan or a scan of
//!    the person table;
//! 3. every plan node is rendered into a [`CompiledFragment`] and the
//!    fragments are combined: AND by inner joins, OR by `UNION ALL` plus
//!    `DISTINCT`, and a full outer join only when an OR group also needs the
//!    full person set.
//!
//! Aliases and parameter names derive from node paths, so the same tree
//! always compiles to the same SQL.

use sea_query::{Alias, Expr, Iden, JoinType, PostgresQueryBuilder, Query, SelectStatement, SimpleExpr, UnionType};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::ast::{BehavioralCondition, FilterNode, GroupOperator, NodePath, PersonPropertyCondition};
use crate::behavioral::BehavioralCompiler;
use crate::catalog::{ActionLookup, CatalogConfig, MaterializedColumns, TableMapping};
use crate::error::{CohortError, Result};
use crate::params::{team_placeholder, ParamValue, Params, TEAM_ID};
use crate::parser::Parser;
use crate::planner::{PushdownAnnotations, PushdownPlanner, PushedCondition};
use crate::property::{person_columns, person_condition_sql, quote_ident, PERSON_PROPS};

/// The single column every fragment produces.
pub const PERSON_ID: &str = "person_id";

/// Person id the store fills in for the unmatched side of an outer join.
const ZERO_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Configuration for the compiler
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Physical table names
    pub tables: TableMapping,
    /// Evaluate eligible person conditions inline with the behavioral scans
    pub enable_pushdown: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            tables: TableMapping::default(),
            enable_pushdown: true,
        }
    }
}

/// Lookups and team scope for one compilation.
pub struct CompileContext<'a> {
    pub team_id: i64,
    pub columns: &'a dyn MaterializedColumns,
    pub actions: &'a dyn ActionLookup,
}

impl<'a> CompileContext<'a> {
    pub fn new(team_id: i64, catalog: &'a CatalogConfig) -> Self {
        Self {
            team_id,
            columns: catalog,
            actions: catalog,
        }
    }
}

/// Represents a stage alias for sea-query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAlias {
    Events,
    DistinctIds,
    Persons,
    PushedPersons,
    /// Fragment of the plan node at this path
    Node(NodePath),
    /// Person scan owned by the group at this path
    PersonScan(NodePath),
    Union(NodePath),
    Bounded(NodePath),
}

impl StageAlias {
    pub fn name(&self) -> String {
        match self {
            StageAlias::Events => "e".to_string(),
            StageAlias::DistinctIds => "pdi".to_string(),
            StageAlias::Persons => "person".to_string(),
            StageAlias::PushedPersons => "pushed_person".to_string(),
            StageAlias::Node(path) => path.ident(),
            StageAlias::PersonScan(path) => format!("{}_persons", path.ident()),
            StageAlias::Union(path) => format!("{}_union", path.ident()),
            StageAlias::Bounded(path) => format!("{}_bounded", path.ident()),
        }
    }
}

impl Iden for StageAlias {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        write!(s, "{}", self.name()).unwrap();
    }
}

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl ColumnName {
    pub fn new(name: &str) -> Self {
        ColumnName(name.to_string())
    }

    pub fn person_id() -> Self {
        ColumnName::new(PERSON_ID)
    }
}

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

/// Store SQL that sea-query attaches verbatim, parenthesised.
pub(crate) fn raw(sql: impl Into<String>) -> SimpleExpr {
    Expr::cust(format!("({})", sql.into()))
}

pub(crate) fn team_filter(column: &str) -> SimpleExpr {
    raw(format!("{} = {}", column, team_placeholder()))
}

/// One compiled set of person ids.
#[derive(Debug, Clone)]
pub struct CompiledFragment {
    pub statement: SelectStatement,
    pub params: Params,
}

impl CompiledFragment {
    /// Name of the person id column the fragment exposes.
    pub fn produces(&self) -> &'static str {
        PERSON_ID
    }

    pub fn sql_text(&self) -> String {
        self.statement.to_string(PostgresQueryBuilder)
    }
}

/// Latest distinct id → person mapping of the team.
pub(crate) fn distinct_id_stage(tables: &TableMapping) -> SelectStatement {
    Query::select()
        .column(ColumnName::new("distinct_id"))
        .expr_as(raw("argMax(\"person_id\", \"version\")"), Alias::new(PERSON_ID))
        .from(Alias::new(tables.person_distinct_id.as_str()))
        .and_where(team_filter("\"team_id\""))
        .group_by_col(ColumnName::new("distinct_id"))
        .and_having(raw("argMax(\"is_deleted\", \"version\") = 0"))
        .to_owned()
}

/// Latest version of every live person of the team, with the requested
/// materialized columns.
pub(crate) fn latest_person_stage(columns: &BTreeSet<String>, tables: &TableMapping) -> SelectStatement {
    let mut select = Query::select();
    select
        .column(ColumnName::new("id"))
        .expr_as(raw("argMax(\"properties\", \"version\")"), Alias::new(PERSON_PROPS));
    for column in columns {
        select.expr_as(
            raw(format!("argMax({}, \"version\")", quote_ident(column))),
            Alias::new(column.as_str()),
        );
    }
    select
        .from(Alias::new(tables.person.as_str()))
        .and_where(team_filter("\"team_id\""))
        .group_by_col(ColumnName::new("id"))
        .and_having(raw("max(\"is_deleted\") = 0"));
    select
}

/// Person ids of the latest persons satisfying `predicate`.
pub(crate) fn person_scan_statement(
    predicate: SimpleExpr,
    columns: &BTreeSet<String>,
    tables: &TableMapping,
) -> SelectStatement {
    Query::select()
        .expr_as(Expr::col((StageAlias::Persons, ColumnName::new("id"))), Alias::new(PERSON_ID))
        .from_subquery(latest_person_stage(columns, tables), StageAlias::Persons)
        .and_where(predicate)
        .to_owned()
}

/// Combine multiple conditions with the group operator
fn combine_conditions(conditions: Vec<SimpleExpr>, operator: GroupOperator) -> SimpleExpr {
    let mut iter = conditions.into_iter();
    match iter.next() {
        Some(first) => iter.fold(first, |acc, expr| match operator {
            GroupOperator::And => acc.and(expr),
            GroupOperator::Or => acc.or(expr),
        }),
        None => raw("1 = 1"),
    }
}

/// Conjunction of the pushed conditions, with its parameters and the
/// materialized columns it reads.
pub(crate) fn pushed_filter(
    pushed: &[PushedCondition],
    columns: &dyn MaterializedColumns,
) -> Option<(SimpleExpr, Params, BTreeSet<String>)> {
    if pushed.is_empty() {
        return None;
    }
    let mut params = Params::new();
    let mut exprs = Vec::with_capacity(pushed.len());
    for item in pushed {
        let (sql, condition_params) = person_condition_sql(&item.path, &item.condition, columns);
        params.extend(condition_params);
        exprs.push(raw(sql));
    }
    let needed = person_columns(pushed.iter().map(|item| &item.condition), columns);
    Some((combine_conditions(exprs, GroupOperator::And), params, needed))
}

/// Boolean combination of person conditions evaluated in one person scan.
#[derive(Debug, Clone, PartialEq)]
pub enum PersonPredicate {
    Leaf(NodePath, PersonPropertyCondition),
    All(Vec<PersonPredicate>),
    Any(Vec<PersonPredicate>),
}

impl PersonPredicate {
    fn combine(operator: GroupOperator, mut parts: Vec<PersonPredicate>) -> Self {
        if parts.len() == 1 {
            return parts.remove(0);
        }
        match operator {
            GroupOperator::And => PersonPredicate::All(parts),
            GroupOperator::Or => PersonPredicate::Any(parts),
        }
    }

    pub fn conditions(&self) -> Vec<&PersonPropertyCondition> {
        match self {
            PersonPredicate::Leaf(_, condition) => vec![condition],
            PersonPredicate::All(parts) | PersonPredicate::Any(parts) => {
                parts.iter().flat_map(PersonPredicate::conditions).collect()
            }
        }
    }

    fn to_sql(&self, columns: &dyn MaterializedColumns, params: &mut Params) -> SimpleExpr {
        match self {
            PersonPredicate::Leaf(path, condition) => {
                let (sql, condition_params) = person_condition_sql(path, condition, columns);
                params.extend(condition_params);
                raw(sql)
            }
            PersonPredicate::All(parts) => combine_conditions(
                parts.iter().map(|p| p.to_sql(columns, params)).collect(),
                GroupOperator::And,
            ),
            PersonPredicate::Any(parts) => combine_conditions(
                parts.iter().map(|p| p.to_sql(columns, params)).collect(),
                GroupOperator::Or,
            ),
        }
    }
}

/// Set algebra over person ids
#[derive(Debug, Clone, PartialEq)]
pub enum SetPlan {
    /// Persons satisfying one behavioral condition
    Behavioral {
        path: NodePath,
        condition: BehavioralCondition,
    },
    /// Persons from the full person set satisfying a predicate
    PersonScan { path: NodePath, predicate: PersonPredicate },
    Intersect { path: NodePath, inputs: Vec<SetPlan> },
    /// Union of event-bounded inputs, outer-joined with the full person set
    /// when `full_scan` is present
    Union {
        path: NodePath,
        inputs: Vec<SetPlan>,
        full_scan: Option<Box<SetPlan>>,
    },
}

impl SetPlan {
    pub fn alias(&self) -> StageAlias {
        match self {
            SetPlan::PersonScan { path, .. } => StageAlias::PersonScan(path.clone()),
            SetPlan::Behavioral { path, .. } | SetPlan::Intersect { path, .. } | SetPlan::Union { path, .. } => {
                StageAlias::Node(path.clone())
            }
        }
    }

    /// Whether rendering needs a full outer join anywhere in this plan.
    pub fn has_full_outer_join(&self) -> bool {
        match self {
            SetPlan::Behavioral { .. } | SetPlan::PersonScan { .. } => false,
            SetPlan::Intersect { inputs, .. } => inputs.iter().any(SetPlan::has_full_outer_join),
            SetPlan::Union { inputs, full_scan, .. } => {
                (full_scan.is_some() && !inputs.is_empty()) || inputs.iter().any(SetPlan::has_full_outer_join)
            }
        }
    }

    pub fn fragment_count(&self) -> usize {
        match self {
            SetPlan::Behavioral { .. } | SetPlan::PersonScan { .. } => 1,
            SetPlan::Intersect { inputs, .. } => inputs.iter().map(SetPlan::fragment_count).sum(),
            SetPlan::Union { inputs, full_scan, .. } => {
                inputs.iter().map(SetPlan::fragment_count).sum::<usize>() + usize::from(full_scan.is_some())
            }
        }
    }
}

/// Represents an optimization applied during compilation
#[derive(Debug, Clone, PartialEq)]
pub enum Optimization {
    PersonPropertyPushdown { path: NodePath, key: String },
    MergedPersonScan { path: NodePath, conditions: usize },
    FullOuterJoin { path: NodePath },
}

/// A planned cohort: the set plan and the conditions pushed into its scans.
#[derive(Debug, Clone)]
pub struct CohortPlan {
    pub root: SetPlan,
    pub pushed: Vec<PushedCondition>,
    pub optimizations: Vec<Optimization>,
}

/// Result of SQL compilation with optimization information
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub sql: String,
    pub params: Params,
    pub optimizations: Vec<Optimization>,
}

impl CompileResult {
    pub fn uses_full_outer_join(&self) -> bool {
        self.optimizations
            .iter()
            .any(|opt| matches!(opt, Optimization::FullOuterJoin { .. }))
    }
}

/// Cohort compiler. Holds configuration only, so one instance can serve
/// any number of independent compilations.
pub struct CohortCompiler {
    config: CompilerConfig,
}

impl Default for CohortCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl CohortCompiler {
    pub fn new() -> Self {
        Self {
            config: CompilerConfig::default(),
        }
    }

    pub fn with_config(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Parse and compile a raw filter
    pub fn compile(&self, filter: &Value, ctx: &CompileContext<'_>) -> Result<CompileResult> {
        let tree = Parser::new(filter).parse()?;
        self.compile_tree(&tree, ctx)
    }

    /// Plan a parsed filter tree without rendering SQL
    pub fn plan(&self, tree: &FilterNode) -> Result<CohortPlan> {
        let annotations = PushdownPlanner::new(self.config.enable_pushdown).annotate(tree);
        let pushed = annotations.pushed_conditions(tree);

        let mut builder = PlanBuilder {
            annotations: &annotations,
            optimizations: pushed
                .iter()
                .map(|item| Optimization::PersonPropertyPushdown {
                    path: item.path.clone(),
                    key: item.condition.key.clone(),
                })
                .collect(),
        };

        let root_path = NodePath::root();
        let root = if tree.has_behavioral() {
            builder.plan_node(tree, &root_path)
        } else {
            let predicate = builder
                .residual(tree, &root_path)
                .ok_or_else(|| CohortError::malformed(root_path.to_string(), "filter has no conditions"))?;
            builder.note_scan(&root_path, &predicate);
            SetPlan::PersonScan {
                path: root_path,
                predicate,
            }
        };

        Ok(CohortPlan {
            root,
            pushed,
            optimizations: builder.optimizations,
        })
    }

    /// Compile a parsed filter tree into SQL and parameters
    pub fn compile_tree(&self, tree: &FilterNode, ctx: &CompileContext<'_>) -> Result<CompileResult> {
        let plan = self.plan(tree)?;
        let assembler = Assembler {
            ctx,
            tables: &self.config.tables,
            pushed: &plan.pushed,
            behavioral: BehavioralCompiler::new(ctx, &self.config.tables),
        };
        let fragment = assembler.render(&plan.root)?;

        let sql = fragment.sql_text();
        let mut params = fragment.params;
        params.insert(TEAM_ID.to_string(), ParamValue::Int(ctx.team_id));

        info!(
            team_id = ctx.team_id,
            fragments = plan.root.fragment_count(),
            pushed = plan.pushed.len(),
            full_outer_join = plan.root.has_full_outer_join(),
            "cohort query compiled"
        );

        Ok(CompileResult {
            sql,
            params,
            optimizations: plan.optimizations,
        })
    }
}

struct PlanBuilder<'a> {
    annotations: &'a PushdownAnnotations,
    optimizations: Vec<Optimization>,
}

impl PlanBuilder<'_> {
    /// Plans a subtree that contains at least one behavioral condition.
    fn plan_node(&mut self, node: &FilterNode, path: &NodePath) -> SetPlan {
        match node {
            FilterNode::Behavioral(condition) => SetPlan::Behavioral {
                path: path.clone(),
                condition: condition.clone(),
            },
            FilterNode::Person(condition) => SetPlan::PersonScan {
                path: path.clone(),
                predicate: PersonPredicate::Leaf(path.clone(), condition.clone()),
            },
            FilterNode::Group { operator, children } => {
                let mut inputs = Vec::new();
                let mut residuals = Vec::new();
                for (index, child) in children.iter().enumerate() {
                    let child_path = path.child(index);
                    if child.has_behavioral() {
                        inputs.push(self.plan_node(child, &child_path));
                    } else if let Some(predicate) = self.residual(child, &child_path) {
                        residuals.push(predicate);
                    }
                }

                let scan = if residuals.is_empty() {
                    None
                } else {
                    let predicate = PersonPredicate::combine(*operator, residuals);
                    self.note_scan(path, &predicate);
                    Some(SetPlan::PersonScan {
                        path: path.clone(),
                        predicate,
                    })
                };

                match operator {
                    GroupOperator::And => {
                        inputs.extend(scan);
                        if inputs.len() == 1 {
                            inputs.remove(0)
                        } else {
                            SetPlan::Intersect {
                                path: path.clone(),
                                inputs,
                            }
                        }
                    }
                    GroupOperator::Or => {
                        if inputs.len() == 1 && scan.is_none() {
                            return inputs.remove(0);
                        }
                        if scan.is_some() {
                            debug!(path = %path, "OR group joins the full person set");
                            self.optimizations.push(Optimization::FullOuterJoin { path: path.clone() });
                        }
                        SetPlan::Union {
                            path: path.clone(),
                            inputs,
                            full_scan: scan.map(Box::new),
                        }
                    }
                }
            }
        }
    }

    /// The part of a person-only subtree that was not pushed down.
    fn residual(&self, node: &FilterNode, path: &NodePath) -> Option<PersonPredicate> {
        match node {
            FilterNode::Person(condition) => {
                if self.annotations.is_pushed(path) {
                    None
                } else {
                    Some(PersonPredicate::Leaf(path.clone(), condition.clone()))
                }
            }
            FilterNode::Group { operator, children } => {
                let parts: Vec<_> = children
                    .iter()
                    .enumerate()
                    .filter_map(|(index, child)| self.residual(child, &path.child(index)))
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(PersonPredicate::combine(*operator, parts))
                }
            }
            FilterNode::Behavioral(_) => None,
        }
    }

    fn note_scan(&mut self, path: &NodePath, predicate: &PersonPredicate) {
        let conditions = predicate.conditions().len();
        if conditions > 1 {
            self.optimizations.push(Optimization::MergedPersonScan {
                path: path.clone(),
                conditions,
            });
        }
    }
}

/// Renders a [`SetPlan`] bottom-up.
struct Assembler<'a> {
    ctx: &'a CompileContext<'a>,
    tables: &'a TableMapping,
    pushed: &'a [PushedCondition],
    behavioral: BehavioralCompiler<'a>,
}

impl Assembler<'_> {
    fn render(&self, plan: &SetPlan) -> Result<CompiledFragment> {
        match plan {
            SetPlan::Behavioral { path, condition } => self.behavioral.compile(path, condition, self.pushed),
            SetPlan::PersonScan { predicate, .. } => Ok(self.render_scan(predicate)),
            SetPlan::Intersect { path, inputs } => self.render_intersect(path, inputs),
            SetPlan::Union {
                path,
                inputs,
                full_scan,
            } => self.render_union(path, inputs, full_scan.as_deref()),
        }
    }

    fn render_scan(&self, predicate: &PersonPredicate) -> CompiledFragment {
        let mut params = Params::new();
        let mut expr = predicate.to_sql(self.ctx.columns, &mut params);
        let mut columns = person_columns(predicate.conditions(), self.ctx.columns);

        if let Some((pushed_expr, pushed_params, pushed_columns)) = pushed_filter(self.pushed, self.ctx.columns) {
            expr = expr.and(pushed_expr);
            params.extend(pushed_params);
            columns.extend(pushed_columns);
        }

        CompiledFragment {
            statement: person_scan_statement(expr, &columns, self.tables),
            params,
        }
    }

    fn render_intersect(&self, path: &NodePath, inputs: &[SetPlan]) -> Result<CompiledFragment> {
        let mut rendered = Vec::with_capacity(inputs.len());
        for input in inputs {
            rendered.push((input.alias(), self.render(input)?));
        }
        let mut iter = rendered.into_iter();
        let Some((first_alias, first)) = iter.next() else {
            return Err(CohortError::malformed(path.to_string(), "group has no conditions"));
        };

        let mut params = first.params;
        let mut select = Query::select();
        select
            .expr_as(Expr::col((first_alias.clone(), ColumnName::person_id())), Alias::new(PERSON_ID))
            .from_subquery(first.statement, first_alias.clone());

        for (alias, fragment) in iter {
            select.join_subquery(
                JoinType::InnerJoin,
                fragment.statement,
                alias.clone(),
                Expr::col((alias, ColumnName::person_id())).equals((first_alias.clone(), ColumnName::person_id())),
            );
            params.extend(fragment.params);
        }

        Ok(CompiledFragment {
            statement: select,
            params,
        })
    }

    fn render_union(
        &self,
        path: &NodePath,
        inputs: &[SetPlan],
        full_scan: Option<&SetPlan>,
    ) -> Result<CompiledFragment> {
        let (bounded_alias, bounded) = match inputs {
            [] => {
                return match full_scan {
                    Some(scan) => self.render(scan),
                    None => Err(CohortError::malformed(path.to_string(), "group has no conditions")),
                }
            }
            [single] => (single.alias(), self.render(single)?),
            [first, rest @ ..] => {
                let first = self.render(first)?;
                let mut params = first.params;
                let mut union = first.statement;
                for input in rest {
                    let fragment = self.render(input)?;
                    union.union(UnionType::All, fragment.statement);
                    params.extend(fragment.params);
                }
                let statement = Query::select()
                    .distinct()
                    .column(ColumnName::person_id())
                    .from_subquery(union, StageAlias::Union(path.clone()))
                    .to_owned();
                (StageAlias::Bounded(path.clone()), CompiledFragment { statement, params })
            }
        };

        let Some(scan) = full_scan else {
            return Ok(bounded);
        };

        let scan_alias = scan.alias();
        let scan_fragment = self.render(scan)?;
        let left = format!("{}.{}", quote_ident(&bounded_alias.name()), quote_ident(PERSON_ID));
        let right = format!("{}.{}", quote_ident(&scan_alias.name()), quote_ident(PERSON_ID));

        let mut params = bounded.params;
        params.extend(scan_fragment.params);

        let statement = Query::select()
            .expr_as(
                raw(format!("if({} = toUUID('{}'), {}, {})", left, ZERO_UUID, right, left)),
                Alias::new(PERSON_ID),
            )
            .from_subquery(bounded.statement, bounded_alias.clone())
            .join_subquery(
                JoinType::FullOuterJoin,
                scan_fragment.statement,
                scan_alias.clone(),
                Expr::col((scan_alias, ColumnName::person_id())).equals((bounded_alias, ColumnName::person_id())),
            )
            .to_owned();

        Ok(CompiledFragment { statement, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ActionStep, EntityKind, UrlMatching};
    use serde_json::json;

    const TEAM: i64 = 2;

    fn create_test_catalog() -> CatalogConfig {
        let mut catalog = CatalogConfig::default();
        catalog.add_action(
            1,
            vec![ActionStep::event("$autocapture").with_url("https://posthog.com/feedback/123", UrlMatching::Exact)],
        );
        catalog
    }

    fn compile(filter: Value, catalog: &CatalogConfig) -> CompileResult {
        let compiler = CohortCompiler::new();
        compiler.compile(&filter, &CompileContext::new(TEAM, catalog)).unwrap()
    }

    fn pageview(value: i64, interval: &str) -> Value {
        json!({"key": "$pageview", "event_type": "events", "time_value": value,
               "time_interval": interval, "value": "performed_event", "type": "behavioural"})
    }

    fn action_first_time() -> Value {
        json!({"key": 1, "event_type": "actions", "time_value": 2, "time_interval": "week",
               "value": "performed_event_first_time", "type": "behavioural"})
    }

    fn person(key: &str, value: &str) -> Value {
        json!({"key": key, "value": value, "type": "person"})
    }

    fn basic_filter() -> Value {
        json!({"properties": {"type": "AND", "values": [
            {"type": "OR", "values": [pageview(1, "day"), pageview(2, "week")]},
            {"type": "AND", "values": [action_first_time(), person("email", "test@posthog.com")]}
        ]}})
    }

    fn pushdown_filter() -> Value {
        json!({"properties": {"type": "AND", "values": [
            {"type": "OR", "values": [pageview(1, "day"), pageview(2, "week"), person("name", "special")]},
            {"type": "AND", "values": [action_first_time(), person("email", "test@posthog.com")]}
        ]}})
    }

    #[test]
    fn test_basic_query_has_no_full_outer_join() {
        let catalog = create_test_catalog();
        let result = compile(basic_filter(), &catalog);

        assert!(!result.sql.contains("FULL OUTER JOIN"));
        assert!(!result.uses_full_outer_join());
        assert!(result.sql.contains("INNER JOIN"));
        assert!(result.sql.contains("UNION ALL"));
        assert!(result.optimizations.contains(&Optimization::PersonPropertyPushdown {
            path: NodePath(vec![1, 1]),
            key: "email".to_string(),
        }));
        assert_eq!(result.params[TEAM_ID], ParamValue::Int(TEAM));
        assert_eq!(
            result.params["n_1_0_event_s0_url"],
            ParamValue::String("https://posthog.com/feedback/123".to_string())
        );
    }

    #[test]
    fn test_pushed_condition_is_inlined_into_every_scan() {
        let catalog = create_test_catalog();
        let result = compile(basic_filter(), &catalog);

        // One pushed-person join per behavioral fragment.
        assert_eq!(result.sql.matches("AS \"pushed_person\"").count(), 3);
        assert_eq!(result.params["n_1_1_value"], ParamValue::String("test@posthog.com".to_string()));
    }

    #[test]
    fn test_or_group_with_person_condition_uses_full_outer_join() {
        let catalog = create_test_catalog();
        let result = compile(pushdown_filter(), &catalog);

        assert!(result.sql.contains("FULL OUTER JOIN"));
        assert!(result.uses_full_outer_join());
        assert!(result.optimizations.contains(&Optimization::FullOuterJoin { path: NodePath(vec![0]) }));
        assert!(result.sql.contains("\"n_0_persons\""));
        assert_eq!(result.params["n_0_2_value"], ParamValue::String("special".to_string()));
    }

    #[test]
    fn test_person_props_only() {
        let catalog = create_test_catalog();
        let result = compile(
            json!({"properties": {"type": "OR", "values": [
                {"type": "OR", "values": [person("email", "test1@posthog.com"), person("email", "test2@posthog.com")]},
                {"type": "AND", "values": [person("name", "test3"), person("email", "test3@posthog.com")]}
            ]}}),
            &catalog,
        );

        assert!(!result.sql.contains("FULL OUTER JOIN"));
        assert!(!result.sql.contains("\"events\""));
        assert_eq!(
            result.optimizations,
            vec![Optimization::MergedPersonScan {
                path: NodePath::root(),
                conditions: 4
            }]
        );
        assert!(result.params.contains_key("n_1_1_value"));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let catalog = create_test_catalog();
        let first = compile(pushdown_filter(), &catalog);
        let second = compile(pushdown_filter(), &catalog);
        assert_eq!(first.sql, second.sql);
        assert_eq!(first.params, second.params);
    }

    #[test]
    fn test_materialized_person_column() {
        let filter = json!({"properties": {"type": "OR", "values": [
            pageview(1, "week"),
            person("$sample_field", "test@posthog.com")
        ]}});

        let catalog = create_test_catalog();
        let before = compile(filter.clone(), &catalog);
        assert!(!before.sql.contains("pmat_$sample_field"));
        assert!(before.sql.contains("JSONExtractRaw(\"person_props\""));

        let mut catalog = create_test_catalog();
        catalog.materialize(EntityKind::Person, "$sample_field");
        let after = compile(filter, &catalog);
        assert!(after.sql.contains("argMax(\"pmat_$sample_field\", \"version\")"));
        assert!(after.sql.contains("(\"pmat_$sample_field\" = {n_1_value:String})"));
        assert!(!after.params.contains_key("n_1_key"));
    }

    #[test]
    fn test_unknown_action_fails_before_sql() {
        let catalog = CatalogConfig::default();
        let compiler = CohortCompiler::new();
        let result = compiler.compile(
            &json!({"type": "AND", "values": [action_first_time()]}),
            &CompileContext::new(TEAM, &catalog),
        );
        assert!(matches!(result, Err(CohortError::UnresolvedReference { .. })));
    }

    #[test]
    fn test_disabled_pushdown_joins_person_scan() {
        let catalog = create_test_catalog();
        let compiler = CohortCompiler::with_config(CompilerConfig {
            enable_pushdown: false,
            ..Default::default()
        });
        let result = compiler
            .compile(&basic_filter(), &CompileContext::new(TEAM, &catalog))
            .unwrap();

        assert!(!result.sql.contains("pushed_person"));
        assert!(result.sql.contains("\"n_1_persons\""));
        assert!(!result.sql.contains("FULL OUTER JOIN"));
    }

    #[test]
    fn test_plan_shape() {
        let compiler = CohortCompiler::new();
        let tree = Parser::new(&pushdown_filter()).parse().unwrap();
        let plan = compiler.plan(&tree).unwrap();

        let SetPlan::Intersect { inputs, .. } = &plan.root else {
            panic!("Expected intersect at the root");
        };
        assert_eq!(inputs.len(), 2);
        assert!(matches!(&inputs[0], SetPlan::Union { inputs, full_scan: Some(_), .. } if inputs.len() == 2));
        assert!(matches!(&inputs[1], SetPlan::Behavioral { path, .. } if *path == NodePath(vec![1, 0])));
        assert_eq!(plan.pushed.len(), 1);
        assert_eq!(plan.root.fragment_count(), 4);
    }

    #[test]
    fn test_custom_table_names() {
        let catalog = create_test_catalog();
        let compiler = CohortCompiler::with_config(CompilerConfig {
            tables: TableMapping {
                events: "sharded_events".to_string(),
                person: "person".to_string(),
                person_distinct_id: "person_distinct_id2".to_string(),
            },
            ..Default::default()
        });
        let result = compiler
            .compile(
                &json!({"type": "AND", "values": [pageview(1, "week")]}),
                &CompileContext::new(TEAM, &catalog),
            )
            .unwrap();
        assert!(result.sql.contains("FROM \"sharded_events\" AS \"e\""));
        assert!(result.sql.contains("\"person_distinct_id2\""));
    }
}
