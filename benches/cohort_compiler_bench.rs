use cohort_compiler::ast::FilterNode;
use cohort_compiler::catalog::{ActionStep, CatalogConfig, EntityKind, UrlMatching};
use cohort_compiler::parser::Parser;
use cohort_compiler::planner::PushdownPlanner;
use cohort_compiler::sql_compiler::{CohortCompiler, CompileContext};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::hint::black_box;

// 带一个动作和一个物化列的目录
fn create_catalog() -> CatalogConfig {
    let mut catalog = CatalogConfig::default();
    catalog.add_action(
        1,
        vec![ActionStep::event("$autocapture").with_url("https://posthog.com/feedback/123", UrlMatching::Exact)],
    );
    catalog.materialize(EntityKind::Person, "email");
    catalog
}

fn pageview(value: i64, interval: &str) -> Value {
    json!({"key": "$pageview", "event_type": "events", "time_value": value, "time_interval": interval,
           "value": "performed_event", "type": "behavioural"})
}

fn test_cases() -> Vec<(&'static str, Value)> {
    vec![
        (
            "person_only",
            json!({"properties": {"type": "OR", "values": [
                {"key": "email", "value": "test1@posthog.com", "type": "person"},
                {"key": "name", "value": "test3", "type": "person"}
            ]}}),
        ),
        (
            "pushdown",
            json!({"properties": {"type": "AND", "values": [
                {"type": "OR", "values": [pageview(1, "day"), pageview(2, "week")]},
                {"type": "AND", "values": [
                    {"key": 1, "event_type": "actions", "time_value": 2, "time_interval": "week",
                     "value": "performed_event_first_time", "type": "behavioural"},
                    {"key": "email", "value": "test@posthog.com", "type": "person"}
                ]}
            ]}}),
        ),
        (
            "full_outer_join",
            json!({"properties": {"type": "AND", "values": [
                {"type": "OR", "values": [
                    pageview(1, "day"),
                    {"key": "$pageview", "event_type": "events", "operator": "gte", "operator_value": 2,
                     "time_interval": "day", "time_value": 3, "total_periods": 3, "min_periods": 2,
                     "value": "performed_event_regularly", "type": "behavioural"},
                    {"key": "name", "value": "special", "type": "person"}
                ]},
                {"key": "email", "value": "test@posthog.com", "type": "person"}
            ]}}),
        ),
    ]
}

fn parse(filter: &Value) -> FilterNode {
    Parser::new(filter).parse().expect("解析应该成功")
}

// 基准测试：过滤树解析性能
fn benchmark_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser_performance");

    for (name, filter) in test_cases() {
        group.bench_with_input(BenchmarkId::new("parse", name), &filter, |b, filter| {
            b.iter(|| black_box(Parser::new(black_box(filter)).parse()))
        });
    }

    group.finish();
}

// 基准测试：pushdown 规划性能
fn benchmark_planner(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner_performance");
    let planner = PushdownPlanner::default();

    for (name, filter) in test_cases() {
        let tree = parse(&filter);
        group.bench_with_input(BenchmarkId::new("annotate", name), &tree, |b, tree| {
            b.iter(|| black_box(planner.annotate(black_box(tree))))
        });
    }

    group.finish();
}

// 基准测试：SQL编译性能
fn benchmark_sql_compiler(c: &mut Criterion) {
    let catalog = create_catalog();
    let ctx = CompileContext::new(1, &catalog);
    let compiler = CohortCompiler::new();
    let mut group = c.benchmark_group("sql_compiler_performance");

    for (name, filter) in test_cases() {
        let tree = parse(&filter);
        group.bench_with_input(BenchmarkId::new("compile", name), &tree, |b, tree| {
            b.iter(|| match compiler.compile_tree(black_box(tree), &ctx) {
                Ok(result) => black_box(result),
                Err(_) => panic!("编译失败"),
            })
        });
    }

    group.finish();
}

// 基准测试：完整的端到端处理
fn benchmark_end_to_end(c: &mut Criterion) {
    let catalog = create_catalog();
    let mut group = c.benchmark_group("end_to_end_performance");

    for (name, filter) in test_cases() {
        let text = filter.to_string();
        group.bench_with_input(BenchmarkId::new("full_pipeline", name), &text, |b, text| {
            b.iter(|| {
                let filter: Value = serde_json::from_str(black_box(text)).expect("JSON 应该有效");
                let compiler = CohortCompiler::new();
                let result = compiler
                    .compile(&filter, &CompileContext::new(1, &catalog))
                    .expect("编译应该成功");
                black_box(result)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_parser,
    benchmark_planner,
    benchmark_sql_compiler,
    benchmark_end_to_end
);
criterion_main!(benches);
