pub mod cleaner;
pub mod compiler;
pub mod evaluator;
pub mod expression;
pub mod extension;
pub mod inference;
pub mod jsonql;
pub mod schema;
pub mod validator;
