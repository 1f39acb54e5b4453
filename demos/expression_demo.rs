//! Example: build an expression against a schema, clean it, validate it,
//! compile it to a query AST, then evaluate it directly against rows.

use exprql::cleaner::{CleanOptions, ExprCleaner};
use exprql::compiler::ExprCompiler;
use exprql::evaluator::{EvalContext, ExprEvaluator, MemoryRow, Row};
use exprql::expression::{AggrStatus, Expr, LiteralType};
use exprql::inference::ExprUtils;
use exprql::schema::{Column, EnumValue, Schema, Table};
use exprql::validator::ExprValidator;
use serde_json::json;
use std::sync::Arc;

fn schema() -> Schema {
    Schema::new().add_table(
        Table::new("visits", "Visits")
            .with_ordering("visited_on")
            .with_column(Column::new("visited_on", LiteralType::Date))
            .with_column(Column::new("amount", LiteralType::Number))
            .with_column(Column::enum_column(
                "status",
                vec![EnumValue::new("open", "Open"), EnumValue::new("closed", "Closed")],
            )),
    )
}

fn rows() -> Vec<Arc<dyn Row>> {
    vec![
        json!({ "_id": "v1", "visited_on": "2024-01-03", "amount": 120, "status": "open" }),
        json!({ "_id": "v2", "visited_on": "2024-02-11", "amount": 80, "status": "closed" }),
        json!({ "_id": "v3", "visited_on": "2024-02-27", "amount": 45, "status": "open" }),
    ]
    .into_iter()
    .map(|row| MemoryRow::from_json(row).into_row())
    .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let schema = schema();
    let utils = ExprUtils::new(&schema);

    // A user picked the status column where a number aggregate is expected
    let draft = Expr::field("visits", "status");
    let options = CleanOptions::for_table("visits")
        .with_types(vec![LiteralType::Number])
        .with_aggr_statuses(vec![AggrStatus::Aggregate]);

    let cleaner = ExprCleaner::new(&schema);
    let cleaned = cleaner.clean(Some(&draft), &options);
    println!("=== Cleaned ===");
    println!("{}", serde_json::to_string_pretty(&cleaned)?);
    println!("summary: {}", utils.summarize_expr(cleaned.as_ref(), None));

    let validator = ExprValidator::new(&schema);
    match validator.validate(cleaned.as_ref(), &options) {
        Some(err) => println!("invalid: {}", err),
        None => println!("valid"),
    }

    println!("\n=== Compiled ===");
    let compiled = ExprCompiler::new(&schema).compile(cleaned.as_ref(), "main")?;
    println!("{}", serde_json::to_string_pretty(&compiled)?);

    println!("\n=== Evaluated ===");
    let evaluator = ExprEvaluator::new(&schema);
    let context = EvalContext::for_rows(rows());
    let value = evaluator.evaluate(cleaned.as_ref(), &context).await?;
    println!("{}", value);

    let total = Expr::op_of(Some("visits"), "sum", vec![Expr::field("visits", "amount")]);
    let latest = Expr::op_of(Some("visits"), "last", vec![Expr::field("visits", "amount")]);
    for expr in [total, latest] {
        let value = evaluator.evaluate(Some(&expr), &context).await?;
        println!("{} = {}", utils.summarize_expr(Some(&expr), None), value);
    }

    Ok(())
}
