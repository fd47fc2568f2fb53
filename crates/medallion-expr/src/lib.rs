//! Dataframe abstraction and expression language for Medallion pipelines.
//!
//! Provides a row-oriented [`DataFrame`] over JSON values plus a small SQL-like
//! language: boolean predicates and column expressions ([`parse_expr`]) and
//! `SELECT ... FROM {df} [WHERE ...]` statements ([`parse_query`]).
//!
//! # Example
//! ```
//! use medallion_expr::{parse_expr, DataFrame};
//! use serde_json::json;
//!
//! let df = DataFrame::from_records(vec![json!({"open": 5}), json!({"open": -1})]).unwrap();
//! let kept = df.filter(&parse_expr("open > 0").unwrap()).unwrap();
//! assert_eq!(kept.num_rows(), 1);
//! ```

pub mod ast;
pub mod dtype;
mod eval;
pub mod frame;
mod parser;

pub use ast::*;
pub use dtype::DataType;
pub use eval::{as_bool, compare, evaluate, total_cmp, SCALAR_FUNCTIONS};
pub use frame::{AggFunc, Aggregation, DataFrame, Field, JoinHow, SortKey};
pub use parser::{parse_expr, parse_query};
