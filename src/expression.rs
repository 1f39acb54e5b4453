//! Expression language data model.
//!
//! This module provides:
//! - The `Expr` tagged-union AST and its wire format
//! - Literal types and aggregation statuses
//! - The static operator table
//! - Upgrades of legacy expression variants

pub mod error;
pub mod expr;
pub mod operator;
pub mod types;
pub mod upgrade;

pub use error::{InferenceError, InferenceResult, MAX_DEPTH};
pub use expr::{
    BuildEnumsetExpr, CaseExpr, CaseItem, ComparisonExpr, CountExpr, Expr, ExtensionExpr, FieldExpr,
    IdExpr, LiteralExpr, LogicalExpr, OpExpr, ScalarExpr, ScoreExpr, VariableExpr,
};
pub use operator::{op_items, LhsCond, OpItem};
pub use types::{AggrStatus, LiteralType};
pub use upgrade::upgrade_legacy;
