use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser as CliParser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cohort_compiler::evaluate::Dataset;
use cohort_compiler::parser::Parser;
use cohort_compiler::{CatalogConfig, CohortCompiler, CompileContext, CompileResult, CompilerConfig};

#[derive(CliParser)]
#[command(name = "cohort", version, about = "Cohort filter 到 SQL 编译器")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 编译过滤条件, 输出 SQL、参数和应用的优化
    Compile {
        /// 过滤条件 JSON 文件
        filter: PathBuf,
        /// 目录配置 (物化列、动作、表名)
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        team: i64,
        /// 关闭 pushdown, 输出未优化的查询
        #[arg(long)]
        no_pushdown: bool,
    },
    /// 在本地数据集上求值, 输出匹配的用户 id
    Check {
        filter: PathBuf,
        /// 数据集 JSON 文件: {"persons": [...], "events": [...]}
        dataset: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        no_pushdown: bool,
    },
    /// 交互模式, 每行输入一个过滤条件 JSON
    Repl {
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        team: i64,
        #[arg(long)]
        no_pushdown: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Compile {
            filter,
            catalog,
            team,
            no_pushdown,
        } => {
            let catalog = load_catalog(catalog.as_deref())?;
            let compiler = create_compiler(&catalog, no_pushdown);
            let filter = read_json(&filter)?;
            let result = compiler
                .compile(&filter, &CompileContext::new(team, &catalog))
                .context("Failed to compile filter")?;
            print_result(&result)
        }
        Command::Check {
            filter,
            dataset,
            catalog,
            no_pushdown,
        } => {
            let catalog = load_catalog(catalog.as_deref())?;
            let compiler = create_compiler(&catalog, no_pushdown);
            let filter = read_json(&filter)?;
            let dataset = Dataset::from_json_file(&dataset)
                .with_context(|| format!("Failed to load dataset {}", dataset.display()))?;

            let tree = Parser::new(&filter).parse().context("Failed to parse filter")?;
            let plan = compiler.plan(&tree)?;
            let now = Utc::now();
            let direct = dataset.matching_persons(&tree, &catalog, now)?;
            let planned = dataset.execute_plan(&plan, &catalog, now)?;
            if direct != planned {
                bail!(
                    "plan result differs from filter semantics: {} vs {} persons",
                    planned.len(),
                    direct.len()
                );
            }

            println!("匹配的用户 ({}):", planned.len());
            for id in planned {
                println!("  {}", id);
            }
            Ok(())
        }
        Command::Repl {
            catalog,
            team,
            no_pushdown,
        } => {
            let catalog = load_catalog(catalog.as_deref())?;
            run_repl(&catalog, team, no_pushdown)
        }
    }
}

fn load_catalog(path: Option<&Path>) -> Result<CatalogConfig> {
    match path {
        Some(path) => {
            let catalog = CatalogConfig::from_json_file(path)?;
            tracing::info!(
                actions = catalog.actions.len(),
                person_columns = catalog.materialized_columns.person.len(),
                "catalog loaded from {}",
                path.display()
            );
            Ok(catalog)
        }
        None => Ok(CatalogConfig::default()),
    }
}

fn create_compiler(catalog: &CatalogConfig, no_pushdown: bool) -> CohortCompiler {
    CohortCompiler::with_config(CompilerConfig {
        tables: catalog.tables.clone(),
        enable_pushdown: !no_pushdown,
    })
}

fn read_json(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn print_result(result: &CompileResult) -> Result<()> {
    println!("[生成的 SQL]:");
    println!("{}", result.sql);
    println!("\n[参数]:");
    println!("{}", serde_json::to_string_pretty(&result.params)?);
    if !result.optimizations.is_empty() {
        println!("\n[应用的优化]:");
        for opt in &result.optimizations {
            println!("• {:?}", opt);
        }
    }
    Ok(())
}

fn run_repl(catalog: &CatalogConfig, team: i64, no_pushdown: bool) -> Result<()> {
    let compiler = create_compiler(catalog, no_pushdown);
    let ctx = CompileContext::new(team, catalog);

    println!("cohort v{} (team {})", env!("CARGO_PKG_VERSION"), team);
    println!("每行输入一个过滤条件 JSON, .quit 退出\n");

    let mut rl = DefaultEditor::new()?;
    loop {
        match rl.readline("cohort> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);
                if line == ".quit" || line == ".exit" {
                    break;
                }

                let filter: Value = match serde_json::from_str(line) {
                    Ok(value) => value,
                    Err(e) => {
                        println!("✗ JSON 解析失败: {}", e);
                        continue;
                    }
                };
                match compiler.compile(&filter, &ctx) {
                    Ok(result) => print_result(&result)?,
                    Err(e) => println!("✗ 编译失败: {}", e),
                }
                println!();
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
