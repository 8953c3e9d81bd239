//! Cohort query compiler: turns a nested cohort filter into a single
//! analytical-store SQL query plus its parameter mapping.

pub mod ast;
pub mod behavioral;
pub mod catalog;
pub mod error;
pub mod evaluate;
pub mod params;
pub mod parser;
pub mod planner;
pub mod property;
pub mod sql_compiler;

pub use catalog::{ActionLookup, CatalogConfig, MaterializedColumns};
pub use error::{CohortError, Result};
pub use sql_compiler::{CohortCompiler, CompileContext, CompileResult, CompilerConfig};
