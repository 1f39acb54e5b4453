//! Pluggable handlers for `extension` expressions.
//!
//! Handlers are registered under a name in a process-wide registry and looked
//! up by the `extension` field of the expression. Every component delegates
//! to the handler and surfaces a missing handler as
//! [`ExtensionError::NotFound`].

use crate::cleaner::{CleanOptions, ExprCleaner};
use crate::compiler::ExprCompiler;
use crate::evaluator::{EvalContext, ExprEvaluator};
use crate::expression::{AggrStatus, Expr, ExtensionExpr, FieldExpr, LiteralType};
use crate::inference::ExprUtils;
use crate::jsonql::JsonQl;
use crate::schema::EnumValue;
use crate::validator::{ExprValidator, ValidateOptions};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtensionError {
    #[error("extension not found: {0}")]
    NotFound(String),

    #[error("extension {extension} does not support {operation}")]
    Unsupported {
        extension: String,
        operation: &'static str,
    },

    #[error("extension failed: {0}")]
    Failed(String),
}

pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// Handler for one kind of extension expression
#[async_trait]
pub trait ExprExtension: Send + Sync {
    fn clean(&self, expr: &ExtensionExpr, cleaner: &ExprCleaner<'_>, options: &CleanOptions) -> Option<Expr>;

    /// First problem with the expression, as a short stable message
    fn validate(
        &self,
        expr: &ExtensionExpr,
        validator: &ExprValidator<'_>,
        options: &ValidateOptions,
    ) -> Option<String>;

    fn get_type(&self, expr: &ExtensionExpr, utils: &ExprUtils<'_>) -> Option<LiteralType>;

    fn get_aggr_status(&self, expr: &ExtensionExpr, utils: &ExprUtils<'_>) -> Option<AggrStatus>;

    fn get_id_table(&self, _expr: &ExtensionExpr, _utils: &ExprUtils<'_>) -> Option<String> {
        None
    }

    fn get_enum_values(&self, _expr: &ExtensionExpr, _utils: &ExprUtils<'_>) -> Option<Vec<EnumValue>> {
        None
    }

    fn get_referenced_fields(&self, _expr: &ExtensionExpr, _utils: &ExprUtils<'_>) -> Vec<FieldExpr> {
        Vec::new()
    }

    fn summarize(&self, expr: &ExtensionExpr, _utils: &ExprUtils<'_>, _locale: Option<&str>) -> String {
        expr.extension.clone()
    }

    fn compile(
        &self,
        expr: &ExtensionExpr,
        compiler: &ExprCompiler<'_>,
        table_alias: &str,
    ) -> ExtensionResult<Option<JsonQl>>;

    fn evaluate_sync(&self, expr: &ExtensionExpr, _evaluator: &ExprEvaluator<'_>) -> ExtensionResult<Value> {
        Err(ExtensionError::Unsupported {
            extension: expr.extension.clone(),
            operation: "evaluate_sync",
        })
    }

    async fn evaluate(
        &self,
        expr: &ExtensionExpr,
        evaluator: &ExprEvaluator<'_>,
        context: &EvalContext,
    ) -> ExtensionResult<Value>;
}

type Registry = HashMap<String, Arc<dyn ExprExtension>>;

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register `handler` under `name`, replacing any previous handler
pub fn register_extension(name: impl Into<String>, handler: Arc<dyn ExprExtension>) {
    let name = name.into();
    log::debug!("registering expression extension {}", name);
    REGISTRY.write().insert(name, handler);
}

/// Remove a handler; returns whether one was registered
pub fn unregister_extension(name: &str) -> bool {
    REGISTRY.write().remove(name).is_some()
}

pub fn get_extension(name: &str) -> ExtensionResult<Arc<dyn ExprExtension>> {
    REGISTRY
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| ExtensionError::NotFound(name.to_string()))
}
