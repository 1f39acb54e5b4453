use exprql::cleaner::{CleanOptions, ExprCleaner};
use exprql::compiler::{CompileError, CompilerOptions, ExprCompiler};
use exprql::evaluator::{EvalContext, EvalError, ExprEvaluator, MemoryRow, Row};
use exprql::expression::{AggrStatus, Expr, ExtensionExpr, LiteralType};
use exprql::extension::ExtensionError;
use exprql::inference::ExprUtils;
use exprql::jsonql::{JsonQl, Select};
use exprql::schema::{Column, EnumValue, Join, JoinKind, Schema, Table};
use exprql::validator::{ExprValidator, ValidationError};
use serde_json::{json, Value};
use std::sync::Arc;

fn schema() -> Schema {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut hierarchy = Table::new("t3", "Regions").with_column(Column::new("name", LiteralType::Text));
    hierarchy.ancestry_table = Some("x_ancestry".to_string());
    let mut areas = Table::new("t4", "Areas").with_column(Column::new("name", LiteralType::Text));
    areas.ancestry = Some("ancestry".to_string());

    Schema::new().add_tables(vec![
        Table::new("t1", "Visits")
            .with_ordering("ordering")
            .with_column(Column::new("ordering", LiteralType::Number))
            .with_column(Column::new("number", LiteralType::Number))
            .with_column(Column::new("text", LiteralType::Text))
            .with_column(Column::new("date", LiteralType::Date))
            .with_column(Column::enum_column(
                "enum",
                vec![EnumValue::new("a", "A"), EnumValue::new("b", "B")],
            ))
            .with_column(Column::new("enumset", LiteralType::Enumset))
            .with_column(Column::join_column(
                "1-2",
                Join::new(JoinKind::OneToMany, "t2", "_id", "t1"),
            )),
        Table::new("t2", "Samples")
            .with_column(Column::new("number", LiteralType::Number))
            .with_column(Column::join_column(
                "2-1",
                Join::new(JoinKind::ManyToOne, "t1", "t1", "_id"),
            )),
        hierarchy,
        areas,
    ])
}

fn samples() -> Vec<Expr> {
    vec![
        Expr::field("t1", "number"),
        Expr::field("t1", "enum"),
        Expr::op_of(Some("t1"), "+", vec![Expr::field("t1", "number"), Expr::text("oops")]),
        Expr::op_of(Some("t1"), "contains", vec![Expr::field("t1", "number"), Expr::number(3.0)]),
        Expr::op_of(Some("t1"), "sum", vec![Expr::field("t1", "number")]),
        Expr::op(Some("t1"), "and", vec![Some(Expr::field("t1", "enum")), None]),
        Expr::scalar("t2", vec!["2-1".to_string()], Some(Expr::field("t1", "number"))),
        Expr::scalar("t1", vec!["1-2".to_string()], Some(Expr::field("t2", "number"))),
        Expr::field("t2", "number"),
        Expr::literal(LiteralType::Enum, json!("z")),
    ]
}

#[test]
fn test_cleaning_is_idempotent_and_valid() {
    let schema = schema();
    let cleaner = ExprCleaner::new(&schema);
    let validator = ExprValidator::new(&schema);

    let option_sets = vec![
        CleanOptions::for_table("t1"),
        CleanOptions::for_table("t1").with_types(vec![LiteralType::Boolean]),
        CleanOptions::for_table("t1").with_types(vec![LiteralType::Number]),
        CleanOptions::for_table("t1").with_aggr_statuses(vec![AggrStatus::Aggregate]),
        CleanOptions::for_table("t2").with_aggr_statuses(vec![AggrStatus::Individual, AggrStatus::Aggregate]),
    ];

    for options in &option_sets {
        for expr in samples() {
            let once = cleaner.clean(Some(&expr), options);
            let twice = cleaner.clean(once.as_ref(), options);
            assert_eq!(once, twice, "not idempotent: {:?} with {:?}", expr, options);
            assert_eq!(
                validator.validate(once.as_ref(), options),
                None,
                "cleaned {:?} fails validation with {:?}",
                once,
                options
            );
        }
    }
}

#[test]
fn test_booleanized_enum_has_boolean_type() {
    let schema = schema();
    let cleaner = ExprCleaner::new(&schema);
    let options = CleanOptions::for_table("t1").with_types(vec![LiteralType::Boolean]);
    let cleaned = cleaner.clean(Some(&Expr::field("t1", "enum")), &options);
    assert_eq!(
        ExprUtils::new(&schema).get_expr_type(cleaned.as_ref()),
        Some(LiteralType::Boolean)
    );
}

#[test]
fn test_aggregation_status_combines() {
    let schema = schema();
    let sum = Expr::op_of(Some("t1"), "sum", vec![Expr::field("t1", "number")]);
    let expr = Expr::op_of(Some("t1"), "+", vec![sum, Expr::number(1.0)]);
    assert_eq!(
        ExprUtils::new(&schema).get_expr_aggr_status(Some(&expr)),
        Some(AggrStatus::Aggregate)
    );
}

#[test]
fn test_validator_reports_first_problem() {
    let schema = schema();
    let validator = ExprValidator::new(&schema);
    let options = CleanOptions::for_table("t1");

    let missing = Expr::field("t1", "nope");
    assert!(validator.validate(Some(&missing), &options).is_some());

    let wrong_table = Expr::field("t2", "number");
    assert!(matches!(
        validator.validate(Some(&wrong_table), &options),
        Some(ValidationError::WrongTable { .. })
    ));
}

#[test]
fn test_null_compiles_to_null() {
    let schema = schema();
    let compiler = ExprCompiler::new(&schema);
    assert_eq!(compiler.compile(None, "T1"), Ok(None));
}

#[test]
fn test_compiled_arithmetic() {
    let schema = schema();
    let compiler = ExprCompiler::new(&schema);
    let plus = Expr::op_of(Some("t1"), "+", vec![Expr::number(3.0), Expr::number(2.0)]);
    let coalesced = |n: f64| {
        JsonQl::op(
            "coalesce",
            vec![JsonQl::cast(JsonQl::literal(n), "decimal"), JsonQl::literal(0)],
        )
    };
    assert_eq!(
        compiler.compile(Some(&plus), "T1"),
        Ok(Some(JsonQl::op("+", vec![coalesced(3.0), coalesced(2.0)])))
    );
}

#[test]
fn test_empty_enumset_any_compiles_to_false() {
    let schema = schema();
    let compiler = ExprCompiler::new(&schema);
    let expr = Expr::op_of(
        Some("t1"),
        "= any",
        vec![Expr::literal(LiteralType::Enum, json!("a")), Expr::enumset(Vec::<String>::new())],
    );
    assert_eq!(compiler.compile(Some(&expr), "T1"), Ok(Some(JsonQl::literal(false))));
}

#[test]
fn test_scalar_without_joins_simplifies() {
    let schema = schema();
    let cleaner = ExprCleaner::new(&schema);
    let compiler = ExprCompiler::new(&schema);
    let field = Expr::field("t1", "number");
    let scalar = Expr::scalar("t1", Vec::new(), Some(field.clone()));

    let options = CleanOptions::for_table("t1");
    assert_eq!(cleaner.clean(Some(&scalar), &options), Some(field.clone()));
    assert_eq!(
        compiler.compile(Some(&scalar), "T1"),
        compiler.compile(Some(&field), "T1")
    );
}

#[test]
fn test_within_uses_ancestry_table() {
    let schema = schema();
    let compiler = ExprCompiler::new(&schema);
    let expr = Expr::op_of(
        Some("t3"),
        "within",
        vec![Expr::id("t3"), Expr::id_literal("t3", json!("v"))],
    );

    let expected = JsonQl::op(
        "exists",
        vec![JsonQl::Query {
            selects: vec![Select {
                expr: JsonQl::null(),
                alias: "value".to_string(),
            }],
            from: Some(Box::new(JsonQl::table("x_ancestry", "subwithin"))),
            where_: Some(Box::new(JsonQl::op(
                "and",
                vec![
                    JsonQl::op(
                        "=",
                        vec![JsonQl::field("subwithin", "ancestor"), JsonQl::literal("v")],
                    ),
                    JsonQl::op(
                        "=",
                        vec![JsonQl::field("subwithin", "descendant"), JsonQl::field("T3", "_id")],
                    ),
                ],
            ))),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }],
    );
    assert_eq!(compiler.compile(Some(&expr), "T3"), Ok(Some(expected)));
}

fn ancestry_lookup(matches: JsonQl) -> JsonQl {
    JsonQl::op(
        "in",
        vec![
            JsonQl::field("T4", "_id"),
            JsonQl::Query {
                selects: vec![Select {
                    expr: JsonQl::field("subwithin", "_id"),
                    alias: "value".to_string(),
                }],
                from: Some(Box::new(JsonQl::table("t4", "subwithin"))),
                where_: Some(Box::new(matches)),
                group_by: Vec::new(),
                order_by: Vec::new(),
                limit: None,
            },
        ],
    )
}

#[test]
fn test_within_uses_ancestry_column() {
    let schema = schema();
    let compiler = ExprCompiler::new(&schema);
    let ancestors = || JsonQl::op("to_jsonb", vec![JsonQl::field("subwithin", "ancestry")]);

    let within = Expr::op_of(
        Some("t4"),
        "within",
        vec![Expr::id("t4"), Expr::id_literal("t4", json!("north"))],
    );
    assert_eq!(
        compiler.compile(Some(&within), "T4"),
        Ok(Some(ancestry_lookup(JsonQl::op(
            "@>",
            vec![
                ancestors(),
                JsonQl::op("jsonb_build_array", vec![JsonQl::cast(JsonQl::literal("north"), "text")]),
            ]
        ))))
    );

    let within_any = Expr::op_of(
        Some("t4"),
        "within any",
        vec![
            Expr::id("t4"),
            Expr::literal(LiteralType::IdArray, json!(["north", "south"])),
        ],
    );
    assert_eq!(
        compiler.compile(Some(&within_any), "T4"),
        Ok(Some(ancestry_lookup(JsonQl::op(
            "?|",
            vec![ancestors(), JsonQl::literal(json!(["north", "south"]))]
        ))))
    );
}

#[test]
fn test_within_any_uses_ancestry_table() {
    let schema = schema();
    let expr = Expr::op_of(
        Some("t3"),
        "within any",
        vec![Expr::id("t3"), Expr::literal(LiteralType::IdArray, json!(["v", "w"]))],
    );
    match ExprCompiler::new(&schema).compile(Some(&expr), "T3").unwrap() {
        Some(JsonQl::Op { op, exprs, .. }) => {
            assert_eq!(op, "exists");
            assert!(matches!(
                &exprs[0],
                JsonQl::Query { from: Some(from), .. } if **from == JsonQl::table("x_ancestry", "subwithin")
            ));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_missing_extension_is_distinct() {
    let schema = schema();
    let expr = Expr::Extension(ExtensionExpr {
        extension: "not_registered".to_string(),
        table: Some("t1".to_string()),
        data: Default::default(),
    });
    assert_eq!(
        ExprCompiler::new(&schema).compile(Some(&expr), "T1"),
        Err(CompileError::Extension(ExtensionError::NotFound("not_registered".into())))
    );
}

#[test]
fn test_compile_uses_fixed_now() {
    let schema = schema();
    let options: CompilerOptions = serde_json::from_value(json!({ "now": "2024-03-15T12:00:00Z" })).unwrap();
    let compiler = ExprCompiler::with_options(&schema, &options);
    let expr = Expr::op_of(Some("t1"), "today", vec![Expr::field("t1", "date")]);
    assert_eq!(
        compiler.compile(Some(&expr), "T1"),
        Ok(Some(JsonQl::op(
            "and",
            vec![
                JsonQl::op(">=", vec![JsonQl::field("T1", "date"), JsonQl::literal("2024-03-15")]),
                JsonQl::op("<", vec![JsonQl::field("T1", "date"), JsonQl::literal("2024-03-16")]),
            ]
        )))
    );
}

#[test]
fn test_wire_format() {
    let parsed: Expr = serde_json::from_value(json!({
        "type": "op",
        "table": "t1",
        "op": "+",
        "exprs": [{ "type": "literal", "valueType": "number", "value": 3 }, null]
    }))
    .unwrap();
    assert_eq!(
        parsed,
        Expr::op(Some("t1"), "+", vec![Some(Expr::literal(LiteralType::Number, json!(3))), None])
    );
}

fn visit_rows() -> Vec<Arc<dyn Row>> {
    [(3, 10), (4, 20), (1, 30), (2, 40)]
        .iter()
        .enumerate()
        .map(|(i, (ordering, number))| {
            MemoryRow::from_json(json!({ "_id": i.to_string(), "ordering": ordering, "number": number })).into_row()
        })
        .collect()
}

#[tokio::test]
async fn test_evaluated_arithmetic() {
    let schema = schema();
    let evaluator = ExprEvaluator::new(&schema);
    let context = EvalContext::default();
    let null = || Expr::literal(LiteralType::Number, Value::Null);

    assert_eq!(evaluator.evaluate(None, &context).await.unwrap(), Value::Null);

    let cases = vec![
        (Expr::op_of(Some("t1"), "+", vec![Expr::number(3.0), Expr::number(2.0)]), json!(5.0)),
        (Expr::op_of(Some("t1"), "+", vec![Expr::number(3.0), null()]), json!(3.0)),
        (Expr::op_of(Some("t1"), "/", vec![Expr::number(3.0), Expr::number(0.0)]), Value::Null),
        (Expr::op_of(Some("t1"), "/", vec![Expr::number(3.0), null()]), Value::Null),
    ];
    for (expr, expected) in cases {
        assert_eq!(evaluator.evaluate(Some(&expr), &context).await.unwrap(), expected, "{:?}", expr);
        assert_eq!(evaluator.evaluate_sync(Some(&expr)).unwrap(), expected, "{:?}", expr);
    }
}

#[tokio::test]
async fn test_evaluated_ordered_aggregates() {
    let schema = schema();
    let evaluator = ExprEvaluator::new(&schema);
    let context = EvalContext::for_rows(visit_rows());
    let number = Expr::field("t1", "number");

    for (op, expected) in [("last", 20), ("first", 30), ("previous", 10)] {
        let expr = Expr::op_of(Some("t1"), op, vec![number.clone()]);
        assert_eq!(evaluator.evaluate(Some(&expr), &context).await.unwrap(), json!(expected), "{}", op);
    }
}

#[tokio::test]
async fn test_evaluated_containment() {
    let schema = schema();
    let evaluator = ExprEvaluator::new(&schema);
    let context = EvalContext::default();
    let contains = |a: &[&str], b: &[&str]| {
        Expr::op_of(
            Some("t1"),
            "contains",
            vec![Expr::enumset(a.iter().copied()), Expr::enumset(b.iter().copied())],
        )
    };

    let superset = contains(&["a", "b", "c"], &["a", "b"]);
    assert_eq!(evaluator.evaluate(Some(&superset), &context).await.unwrap(), json!(true));
    let subset = contains(&["a", "b"], &["a", "b", "c"]);
    assert_eq!(evaluator.evaluate(Some(&subset), &context).await.unwrap(), json!(false));
}

#[tokio::test]
async fn test_evaluated_scalar_matches_compiled_shape() {
    let schema = schema();
    let evaluator = ExprEvaluator::new(&schema);
    let parent = MemoryRow::from_json(json!({ "_id": "v1", "number": 7 })).into_row();
    let sample = MemoryRow::from_json(json!({ "_id": "s1" }))
        .with_join("2-1", exprql::evaluator::Joined::One(parent))
        .into_row();

    let expr = Expr::scalar("t2", vec!["2-1".to_string()], Some(Expr::field("t1", "number")));
    let context = EvalContext::for_row(sample);
    assert_eq!(evaluator.evaluate(Some(&expr), &context).await.unwrap(), json!(7));
}

#[tokio::test]
async fn test_evaluated_within() {
    let schema = schema();
    let evaluator = ExprEvaluator::new(&schema);
    let area = MemoryRow::from_json(json!({ "_id": "town", "ancestry": ["world", "north"] })).into_row();
    let context = EvalContext::for_row(area);

    let within = |target: &str| {
        Expr::op_of(Some("t4"), "within", vec![Expr::id("t4"), Expr::id_literal("t4", json!(target))])
    };
    assert_eq!(evaluator.evaluate(Some(&within("north")), &context).await.unwrap(), json!(true));
    assert_eq!(evaluator.evaluate(Some(&within("south")), &context).await.unwrap(), json!(false));

    let within_any = Expr::op_of(
        Some("t4"),
        "within any",
        vec![Expr::id("t4"), Expr::literal(LiteralType::IdArray, json!(["south", "world"]))],
    );
    assert_eq!(evaluator.evaluate(Some(&within_any), &context).await.unwrap(), json!(true));

    // Hierarchies in a separate ancestry table are not readable from a row
    let region = MemoryRow::from_json(json!({ "_id": "r1" })).into_row();
    let expr = Expr::op_of(Some("t3"), "within", vec![Expr::id("t3"), Expr::id_literal("t3", json!("v"))]);
    assert!(matches!(
        evaluator.evaluate(Some(&expr), &EvalContext::for_row(region)).await,
        Err(EvalError::Unsupported { .. })
    ));
}

#[tokio::test]
async fn test_filtered_aggregates_over_no_rows_are_zero() {
    let schema = schema();
    let compiler = ExprCompiler::new(&schema);
    let evaluator = ExprEvaluator::new(&schema);
    let empty = EvalContext::for_rows(Vec::new());
    let large = Expr::op_of(Some("t1"), ">", vec![Expr::field("t1", "number"), Expr::number(15.0)]);

    let count_where = Expr::op_of(Some("t1"), "count where", vec![large.clone()]);
    let sum_where = Expr::op_of(Some("t1"), "sum where", vec![Expr::field("t1", "number"), large]);
    for expr in [count_where, sum_where] {
        match compiler.compile(Some(&expr), "T1").unwrap() {
            Some(JsonQl::Op { op, exprs, .. }) => {
                assert_eq!(op, "coalesce");
                assert!(matches!(&exprs[0], JsonQl::Op { op, .. } if op == "sum"));
                assert_eq!(exprs[1], JsonQl::literal(0));
            }
            other => panic!("unexpected {:?}", other),
        }
        let value = evaluator.evaluate(Some(&expr), &empty).await.unwrap();
        assert_eq!(value.as_f64(), Some(0.0), "{:?}", expr);
    }

    let count_where = Expr::op_of(
        Some("t1"),
        "count where",
        vec![Expr::op_of(Some("t1"), ">", vec![Expr::field("t1", "number"), Expr::number(15.0)])],
    );
    let value = evaluator.evaluate(Some(&count_where), &EvalContext::for_rows(visit_rows())).await.unwrap();
    assert_eq!(value, json!(3));
}
