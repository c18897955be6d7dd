//! Integration tests for the operation façade.
//!
//! Every test runs the full call pipeline over the scripted driver: argument
//! merging, parameter binding, materialization and relation linking.

mod common;

use common::{Call, ScriptedDriver, config, row, rows};
use rowlink::db::{BoundValue, DriverError, DriverResult, StatementState};
use rowlink::mapping::{EntityRegistry, EntityType, FieldDef, FieldKind, Relation, ValidationError};
use rowlink::models::{
    Args, ColumnSpec, ConnectionState, Entity, Materialized, ParamSpec, ProcedureDef, QueryDef,
    Row, SqlType, StatementDef,
};
use rowlink::{DbError, Mapper, MapperOptions};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ALL_CUSTOMERS: &str = "SELECT * FROM customers";
const CUSTOMER_BY_ID: &str = "SELECT * FROM customers WHERE id = ?";

fn registry() -> EntityRegistry {
    EntityRegistry::builder()
        .register(
            EntityType::new("Customer")
                .field(FieldDef::new("id").kind(FieldKind::Integer).required())
                .field(FieldDef::new("name").alias("customer_name"))
                .relation(Relation::many("id", "Order", "customer_id").named("orders"))
                .relation(Relation::one("id", "Address", "customer_id").named("address")),
        )
        .register(
            EntityType::new("Order")
                .relation(Relation::one("customer_id", "Customer", "id").named("customer")),
        )
        .register(EntityType::new("Address"))
        .build()
        .expect("registry should build")
}

fn mapper(driver: &ScriptedDriver) -> Mapper<ScriptedDriver> {
    mapper_with(driver, MapperOptions::unbounded())
}

fn mapper_with(driver: &ScriptedDriver, options: MapperOptions) -> Mapper<ScriptedDriver> {
    Mapper::new(driver.clone(), registry(), config(), options)
}

fn query(name: &str, sql: &'static str) -> QueryDef {
    QueryDef::new(name, move |_: &Args, _| sql.to_string())
}

fn customer(id: i64) -> Entity {
    Entity::new("Customer", row(json!({"id": id, "name": "Ada"})))
}

fn bound(request: &rowlink::db::BoundRequest, name: &str) -> BoundValue {
    request
        .get(name)
        .unwrap_or_else(|| panic!("parameter {name} is not bound"))
        .value
        .clone()
}

// ============================================================================
// Queries and materialization
// ============================================================================

#[tokio::test]
async fn test_query_maps_aliased_columns() {
    let driver = ScriptedDriver::new();
    driver.respond(
        ALL_CUSTOMERS,
        vec![rows(json!([
            {"id": 1, "customer_name": "Ada"},
            {"id": 2, "customer_name": "Grace"}
        ]))],
    );
    let mapper = mapper(&driver);
    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define");
    assert_eq!(mapper.connection_state(), ConnectionState::Disconnected);

    let customers = mapper
        .call("Customer", "all", Args::new())
        .await
        .expect("call")
        .into_many();
    assert_eq!(customers.len(), 2);
    assert_eq!(customers[0].entity_type(), "Customer");
    assert_eq!(customers[1].get_str("name"), Some("Grace"));
    assert!(customers[0].get("customer_name").is_none());
    assert_eq!(mapper.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_query_builder_sees_args() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);
    let def = QueryDef::new("top", |args: &Args, _| {
        format!("SELECT * FROM customers LIMIT {}", args["limit"])
    });
    mapper.define_query("Customer", def).await.expect("define");

    mapper
        .call("Customer", "top", row(json!({"limit": 5})))
        .await
        .expect("call");
    assert!(matches!(
        driver.calls().last(),
        Some(Call::Execute { sql, .. }) if sql == "SELECT * FROM customers LIMIT 5"
    ));
}

#[tokio::test]
async fn test_one_result_returns_first_row() {
    let driver = ScriptedDriver::new();
    driver.respond(
        ALL_CUSTOMERS,
        vec![rows(json!([
            {"id": 1, "customer_name": "Ada"},
            {"id": 2, "customer_name": "Grace"}
        ]))],
    );
    let mapper = mapper(&driver);
    mapper
        .define_query("Customer", query("first", ALL_CUSTOMERS).one_result())
        .await
        .expect("define");

    let result = mapper.call("Customer", "first", Args::new()).await.expect("call");
    match result.data {
        Materialized::One(entity) => assert_eq!(entity.get("id"), Some(&json!(1))),
        other => panic!("expected one entity, got {other:?}"),
    }
}

#[tokio::test]
async fn test_one_result_without_rows_is_empty_result() {
    let driver = ScriptedDriver::new();
    driver.respond(ALL_CUSTOMERS, vec![Vec::new()]);
    let mapper = mapper(&driver);
    mapper
        .define_query("Customer", query("first", ALL_CUSTOMERS).one_result())
        .await
        .expect("define");

    let err = mapper
        .call("Customer", "first", Args::new())
        .await
        .expect_err("no rows");
    assert!(err.is_empty_result());
}

#[tokio::test]
async fn test_no_row_sets_is_an_empty_list() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);
    mapper
        .define_query("Customer", query("purge", "DELETE FROM customers"))
        .await
        .expect("define");

    let result = mapper.call("Customer", "purge", Args::new()).await.expect("call");
    assert_eq!(result.data, Materialized::Many(Vec::new()));
}

#[tokio::test]
async fn test_validation_failures() {
    let driver = ScriptedDriver::new();
    driver.respond(ALL_CUSTOMERS, vec![rows(json!([{"customer_name": "Ada"}]))]);
    driver.respond(
        "SELECT * FROM customers WHERE id = 'x'",
        vec![rows(json!([{"id": "x"}]))],
    );
    let mapper = mapper(&driver);
    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define");
    mapper
        .define_query(
            "Customer",
            query("odd", "SELECT * FROM customers WHERE id = 'x'"),
        )
        .await
        .expect("define");

    match mapper.call("Customer", "all", Args::new()).await {
        Err(DbError::Validation { entity, field, .. }) => {
            assert_eq!(entity, "Customer");
            assert_eq!(field.as_deref(), Some("id"));
        }
        other => panic!("expected a validation error, got {other:?}"),
    }

    let err = mapper
        .call("Customer", "odd", Args::new())
        .await
        .expect_err("id must be an integer");
    assert!(err.to_string().contains("expected an integer"));
}

fn lowercase_label(mut row: Row) -> Result<Row, ValidationError> {
    let label = row
        .get("label")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ValidationError::field("label", "label is required"))?
        .to_lowercase();
    row.insert("label".to_string(), json!(label));
    Ok(row)
}

#[tokio::test]
async fn test_row_validator_canonicalizes() {
    let registry = EntityRegistry::builder()
        .register(EntityType::new("Tag").validator(lowercase_label))
        .build()
        .expect("registry");
    let driver = ScriptedDriver::new();
    driver.respond(
        "SELECT label FROM tags",
        vec![rows(json!([{"label": "RUST"}]))],
    );
    driver.respond("SELECT NULL AS label", vec![rows(json!([{"label": null}]))]);
    let mapper = Mapper::new(driver.clone(), registry, config(), MapperOptions::unbounded());
    mapper
        .define_query("Tag", query("all", "SELECT label FROM tags"))
        .await
        .expect("define");
    mapper
        .define_query("Tag", query("broken", "SELECT NULL AS label"))
        .await
        .expect("define");

    let tags = mapper.call("Tag", "all", Args::new()).await.expect("call").into_many();
    assert_eq!(tags[0].get_str("label"), Some("rust"));

    let err = mapper
        .call("Tag", "broken", Args::new())
        .await
        .expect_err("validator rejects the row");
    assert!(matches!(err, DbError::Validation { field: Some(ref f), .. } if f == "label"));
}

// ============================================================================
// Multiple row sets and linking
// ============================================================================

#[tokio::test]
async fn test_row_set_count_must_match_result_types() {
    let driver = ScriptedDriver::new();
    driver.respond(
        ALL_CUSTOMERS,
        vec![
            rows(json!([{"id": 1}])),
            rows(json!([{"id": 10, "customer_id": 1}])),
            rows(json!([{"id": 20, "customer_id": 1}])),
        ],
    );
    let mapper = mapper(&driver);
    mapper
        .define_query(
            "Customer",
            query("with_orders", ALL_CUSTOMERS).returns(["Customer", "Order"]),
        )
        .await
        .expect("define");

    let err = mapper
        .call("Customer", "with_orders", Args::new())
        .await
        .expect_err("three sets for two types");
    assert!(matches!(
        err,
        DbError::ResultShape {
            expected: 2,
            actual: 3,
            ..
        }
    ));
}

#[tokio::test]
async fn test_single_row_set_pairs_with_primary_type() {
    let driver = ScriptedDriver::new();
    driver.respond(ALL_CUSTOMERS, vec![rows(json!([{"id": 1}]))]);
    let mapper = mapper(&driver);
    mapper
        .define_query(
            "Customer",
            query("with_orders", ALL_CUSTOMERS).returns(["Customer", "Order"]),
        )
        .await
        .expect("define");

    let customers = mapper
        .call("Customer", "with_orders", Args::new())
        .await
        .expect("call")
        .into_many();
    assert_eq!(customers.len(), 1);
    assert!(customers[0].related("orders").is_none());
}

#[tokio::test]
async fn test_many_relation_with_empty_set() {
    let driver = ScriptedDriver::new();
    driver.respond(
        ALL_CUSTOMERS,
        vec![
            rows(json!([{"id": 1}, {"id": 2}])),
            Vec::new(),
            rows(json!([{"customer_id": 1, "city": "Lyon"}])),
        ],
    );
    let mapper = mapper(&driver);
    mapper
        .define_query(
            "Customer",
            query("full", ALL_CUSTOMERS).returns(["Customer", "Order", "Address"]),
        )
        .await
        .expect("define");

    let customers = mapper
        .call("Customer", "full", Args::new())
        .await
        .expect("call")
        .into_many();
    assert_eq!(customers.len(), 2);
    for customer in &customers {
        assert!(customer.related("orders").is_some());
        assert!(customer.many("orders").is_empty());
    }
    assert_eq!(
        customers[0].one("address").and_then(|a| a.get_str("city")),
        Some("Lyon")
    );
    assert!(customers[1].one("address").is_none());
}

#[tokio::test]
async fn test_many_relation_keeps_row_order() {
    let driver = ScriptedDriver::new();
    driver.respond(
        ALL_CUSTOMERS,
        vec![
            rows(json!([{"id": 1}, {"id": 2}])),
            rows(json!([
                {"id": 10, "customer_id": 2},
                {"id": 11, "customer_id": 1},
                {"id": 12, "customer_id": "2"}
            ])),
        ],
    );
    let mapper = mapper(&driver);
    mapper
        .define_query(
            "Customer",
            query("with_orders", ALL_CUSTOMERS).returns(["Customer", "Order"]),
        )
        .await
        .expect("define");

    let customers = mapper
        .call("Customer", "with_orders", Args::new())
        .await
        .expect("call")
        .into_many();
    let ids = |c: &Entity| -> Vec<i64> {
        c.many("orders")
            .iter()
            .filter_map(|o| o.get("id").and_then(|v| v.as_i64()))
            .collect()
    };
    assert_eq!(ids(&customers[0]), vec![11]);
    // "2" matches 2 under loose key matching
    assert_eq!(ids(&customers[1]), vec![10, 12]);
}

#[tokio::test]
async fn test_one_relation_last_match_wins() {
    let driver = ScriptedDriver::new();
    driver.respond(
        ALL_CUSTOMERS,
        vec![
            rows(json!([{"id": 1}])),
            rows(json!([
                {"customer_id": 1, "city": "Lyon"},
                {"customer_id": 1.0, "city": "Nantes"}
            ])),
        ],
    );
    let mapper = mapper(&driver);
    mapper
        .define_query(
            "Customer",
            query("with_address", ALL_CUSTOMERS).returns(["Customer", "Address"]),
        )
        .await
        .expect("define");

    let customer = mapper
        .call("Customer", "with_address", Args::new())
        .await
        .expect("call")
        .into_one()
        .expect("one customer");
    assert_eq!(
        customer.one("address").and_then(|a| a.get_str("city")),
        Some("Nantes")
    );
}

#[tokio::test]
async fn test_cyclic_relations_stop_at_the_path() {
    let driver = ScriptedDriver::new();
    driver.respond(
        "SELECT * FROM orders",
        vec![
            rows(json!([{"id": 10, "customer_id": 1}])),
            rows(json!([{"id": 1, "customer_name": "Ada"}])),
        ],
    );
    let mapper = mapper(&driver);
    mapper
        .define_query(
            "Order",
            query("with_customer", "SELECT * FROM orders").returns(["Order", "Customer"]),
        )
        .await
        .expect("define");

    let order = mapper
        .call("Order", "with_customer", Args::new())
        .await
        .expect("call")
        .into_one()
        .expect("one order");
    let customer = order.one("customer").expect("customer is attached");
    assert_eq!(customer.get_str("name"), Some("Ada"));
    assert!(customer.related("orders").is_none());
}

// ============================================================================
// Definition errors and lookups
// ============================================================================

#[tokio::test]
async fn test_define_rejects_unknown_result_type() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);

    let err = mapper
        .define_query(
            "Customer",
            query("bad", ALL_CUSTOMERS).returns(["Customer", "Invoice"]),
        )
        .await
        .expect_err("Invoice is not registered");
    assert!(matches!(err, DbError::InvalidDefinition { .. }));
    assert!(err.to_string().contains("Invoice"));
}

#[tokio::test]
async fn test_unknown_lookups() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);

    let err = mapper
        .call("Customer", "missing", Args::new())
        .await
        .expect_err("no such operation");
    assert!(matches!(err, DbError::Lookup { kind: "operation", .. }));

    let err = mapper
        .define_query("Invoice", query("all", "SELECT 1"))
        .await
        .expect_err("no such type");
    assert!(matches!(err, DbError::Lookup { kind: "entity type", .. }));
}

#[tokio::test]
async fn test_static_and_instance_calls_are_not_interchangeable() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);
    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define");
    mapper
        .define_query("Customer", query("reload", ALL_CUSTOMERS).on_instance())
        .await
        .expect("define");

    let err = mapper
        .call_on(&customer(1), "all", Args::new())
        .await
        .expect_err("static op on an instance");
    assert!(matches!(err, DbError::InvalidDefinition { .. }));

    let err = mapper
        .call("Customer", "reload", Args::new())
        .await
        .expect_err("instance op without an instance");
    assert!(matches!(err, DbError::InvalidDefinition { .. }));
    assert!(driver.calls().is_empty());
}

// ============================================================================
// Prepared statements
// ============================================================================

#[tokio::test]
async fn test_statement_lifecycle_through_mapper() {
    let driver = ScriptedDriver::new();
    driver.respond(CUSTOMER_BY_ID, vec![rows(json!([{"id": 3}]))]);
    let mapper = mapper(&driver);
    let def = StatementDef::new("get", CUSTOMER_BY_ID)
        .param(ParamSpec::scalar("id", SqlType::Int))
        .one_result();
    mapper.define_statement("Customer", def).await.expect("define");
    assert_eq!(
        mapper.statement_state("Customer", "get").expect("state"),
        StatementState::Ready
    );

    let found = mapper
        .call("Customer", "get", row(json!({"id": 3})))
        .await
        .expect("call")
        .into_one()
        .expect("one customer");
    assert_eq!(found.get("id"), Some(&json!(3)));

    mapper.unprepare("Customer", "get").await.expect("unprepare");
    assert_eq!(
        mapper.statement_state("Customer", "get").expect("state"),
        StatementState::Unprepared
    );
    let err = mapper
        .call("Customer", "get", row(json!({"id": 3})))
        .await
        .expect_err("statement was released");
    assert!(matches!(err, DbError::NotPrepared { ref statement, .. } if statement == "Customer.get"));

    mapper.prepare("Customer", "get").await.expect("prepare again");
    mapper
        .call("Customer", "get", row(json!({"id": 3})))
        .await
        .expect("call after re-prepare");
    assert!(matches!(
        driver.calls().last(),
        Some(Call::ExecutePrepared { handle: 2, .. })
    ));
}

#[tokio::test]
async fn test_statement_call_after_disconnect() {
    let driver = ScriptedDriver::new();
    driver.respond(CUSTOMER_BY_ID, vec![rows(json!([{"id": 3}]))]);
    let mapper = mapper(&driver);
    let def = StatementDef::new("get", CUSTOMER_BY_ID)
        .param(ParamSpec::scalar("id", SqlType::Int))
        .one_result();
    mapper.define_statement("Customer", def).await.expect("define");
    mapper
        .call("Customer", "get", row(json!({"id": 3})))
        .await
        .expect("call");

    mapper.disconnect().await.expect("disconnect");
    assert_eq!(mapper.connection_state(), ConnectionState::Disconnected);

    let found = mapper
        .call("Customer", "get", row(json!({"id": 3})))
        .await
        .expect("call reconnects")
        .into_one()
        .expect("one customer");
    assert_eq!(found.get("id"), Some(&json!(3)));
    assert_eq!(driver.connects(), 2);
    assert!(matches!(
        driver.calls().last(),
        Some(Call::ExecutePrepared { handle: 2, .. })
    ));
}

#[tokio::test]
async fn test_statement_call_after_connection_drop() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);
    mapper
        .define_statement("Customer", StatementDef::new("all", ALL_CUSTOMERS))
        .await
        .expect("define");

    driver.drop_connections();
    let err = mapper
        .call("Customer", "all", Args::new())
        .await
        .expect_err("server went away");
    assert!(matches!(err, DbError::Connect { .. }));
    assert_eq!(mapper.connection_state(), ConnectionState::Disconnected);

    mapper
        .call("Customer", "all", Args::new())
        .await
        .expect("next call reconnects");
    assert_eq!(driver.connects(), 2);
    assert!(!driver.is_closed(2));
}

#[tokio::test]
async fn test_redefining_statement_as_query_releases_handle() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);
    mapper
        .define_statement("Customer", StatementDef::new("all", ALL_CUSTOMERS))
        .await
        .expect("define statement");

    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define query");
    assert!(driver.calls().contains(&Call::Unprepare { handle: 1 }));
    assert_eq!(
        mapper.statement_state("Customer", "all").expect("state"),
        StatementState::Unprepared
    );

    // a query replacing a query has nothing to release
    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define query again");
    let releases = driver
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::Unprepare { .. }))
        .count();
    assert_eq!(releases, 1);
}

#[tokio::test]
async fn test_query_operations_cannot_be_prepared() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);
    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define");

    let err = mapper.prepare("Customer", "all").await.expect_err("query op");
    assert!(matches!(err, DbError::InvalidDefinition { .. }));
    let err = mapper.unprepare("Customer", "all").await.expect_err("query op");
    assert!(matches!(err, DbError::InvalidDefinition { .. }));
}

#[tokio::test]
async fn test_instance_statement_merges_fields_and_args() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);
    let def = StatementDef::new(
        "rename",
        "UPDATE customers SET customer_name = ? WHERE id = ?",
    )
    .param(ParamSpec::scalar("customer_name", SqlType::NVarChar(Some(100))))
    .param(ParamSpec::scalar("id", SqlType::Int))
    .on_instance();
    mapper.define_statement("Customer", def).await.expect("define");

    let ada = customer(1);
    mapper
        .call_on(&ada, "rename", Args::new())
        .await
        .expect("call without args");
    mapper
        .call_on(&ada, "rename", row(json!({"customer_name": "Grace"})))
        .await
        .expect("call with args");

    let requests: Vec<_> = driver
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::ExecutePrepared { request, .. } => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(requests.len(), 2);
    // instance fields are written under their column names
    assert_eq!(
        bound(&requests[0], "customer_name"),
        BoundValue::Scalar {
            sql_type: SqlType::NVarChar(Some(100)),
            value: Some(json!("Ada")),
        }
    );
    // explicit arguments win over instance fields
    assert_eq!(
        bound(&requests[1], "customer_name"),
        BoundValue::Scalar {
            sql_type: SqlType::NVarChar(Some(100)),
            value: Some(json!("Grace")),
        }
    );
    assert_eq!(
        bound(&requests[1], "id"),
        BoundValue::Scalar {
            sql_type: SqlType::Int,
            value: Some(json!(1)),
        }
    );
}

#[tokio::test]
async fn test_absent_table_argument_binds_zero_rows() {
    let driver = ScriptedDriver::new();
    let sql = "SELECT o.* FROM orders o JOIN json_each(?) j ON o.id = j.value ->> 'id'";
    let mapper = mapper(&driver);
    let def = StatementDef::new("by_ids", sql).param(ParamSpec::table(
        "ids",
        vec![ColumnSpec::new("id", SqlType::Int)],
    ));
    mapper.define_statement("Order", def).await.expect("define");

    let result = mapper
        .call("Order", "by_ids", Args::new())
        .await
        .expect("call");
    assert!(result.data.is_empty());

    let result = mapper
        .call("Order", "by_ids", row(json!({"ids": []})))
        .await
        .expect("call with an empty list");
    assert!(result.data.is_empty());

    for call in driver.calls() {
        if let Call::ExecutePrepared { request, .. } = call {
            match bound(&request, "ids") {
                BoundValue::Table(table) => assert_eq!(table.row_count(), 0),
                other => panic!("expected a table parameter, got {other:?}"),
            }
        }
    }
}

// ============================================================================
// Stored procedures
// ============================================================================

#[tokio::test]
async fn test_procedure_introspection_is_cached() {
    let driver = ScriptedDriver::new();
    driver.describe(
        "customer_totals",
        vec![ParamSpec::scalar("customer_id", SqlType::Int)],
    );
    driver.respond_with(
        "customer_totals",
        Ok(DriverResult {
            row_sets: vec![rows(json!([{"id": 1}]))],
            return_value: Some(0),
            output: row(json!({"total": "12.50"})),
        }),
    );
    let mapper = mapper(&driver);
    let def = ProcedureDef::new("totals")
        .routine("customer_totals")
        .output("total", SqlType::Decimal {
            precision: 10,
            scale: 2,
        })
        .preprocess(|mut args: Args| {
            if let Some(id) = args.remove("id") {
                args.insert("customer_id".to_string(), id);
            }
            args
        });
    mapper.define_procedure("Customer", def).await.expect("define");

    for _ in 0..2 {
        let result = mapper
            .call("Customer", "totals", row(json!({"id": 1})))
            .await
            .expect("call");
        assert_eq!(result.return_value, Some(0));
        assert_eq!(result.output.get("total"), Some(&json!("12.50")));
        assert_eq!(result.data.len(), 1);
    }

    let calls = driver.calls();
    let describes = calls
        .iter()
        .filter(|call| matches!(call, Call::Describe { .. }))
        .count();
    assert_eq!(describes, 1);

    let request = calls
        .iter()
        .find_map(|call| match call {
            Call::Procedure { request, .. } => Some(request.clone()),
            _ => None,
        })
        .expect("procedure was called");
    let names: Vec<&str> = request.params().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["customer_id", "total"]);
    assert_eq!(
        bound(&request, "customer_id"),
        BoundValue::Scalar {
            sql_type: SqlType::Int,
            value: Some(json!(1)),
        }
    );
}

#[tokio::test]
async fn test_instance_procedure_prefers_instance_fields() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);
    let def = ProcedureDef::new("touch_customer")
        .param(ParamSpec::scalar("id", SqlType::Int))
        .on_instance();
    mapper.define_procedure("Customer", def).await.expect("define");

    mapper
        .call_on(&customer(1), "touch_customer", row(json!({"id": 5})))
        .await
        .expect("call");

    let calls = driver.calls();
    assert!(!calls.iter().any(|call| matches!(call, Call::Describe { .. })));
    match calls.last() {
        Some(Call::Procedure { routine, request }) => {
            assert_eq!(routine, "touch_customer");
            assert_eq!(
                bound(request, "id"),
                BoundValue::Scalar {
                    sql_type: SqlType::Int,
                    value: Some(json!(1)),
                }
            );
        }
        other => panic!("expected a procedure call, got {other:?}"),
    }
}

#[tokio::test]
async fn test_procedure_describe_failure_is_a_driver_error() {
    let driver = ScriptedDriver::new();
    let mapper = mapper(&driver);
    mapper
        .define_procedure("Customer", ProcedureDef::new("missing_proc"))
        .await
        .expect("define");

    let err = mapper
        .call("Customer", "missing_proc", Args::new())
        .await
        .expect_err("routine does not exist");
    assert!(matches!(err, DbError::Driver { .. }));
}

// ============================================================================
// Connection loss, cancellation and timeouts
// ============================================================================

#[tokio::test]
async fn test_connect_error_resets_connection() {
    let driver = ScriptedDriver::new();
    driver.respond_with(
        ALL_CUSTOMERS,
        Err(DriverError::connect("server has gone away")),
    );
    let mapper = mapper(&driver);
    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define");

    let err = mapper
        .call("Customer", "all", Args::new())
        .await
        .expect_err("connection dropped");
    assert!(matches!(err, DbError::Connect { .. }));
    assert!(err.is_retryable());
    assert_eq!(mapper.connection_state(), ConnectionState::Disconnected);

    driver.respond(ALL_CUSTOMERS, vec![Vec::new()]);
    mapper
        .call("Customer", "all", Args::new())
        .await
        .expect("next call reconnects");
    assert_eq!(driver.connects(), 2);
}

#[tokio::test]
async fn test_cancelled_call() {
    let driver = ScriptedDriver::new();
    driver.gate_connects();
    let mapper = mapper(&driver);
    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define");

    let token = CancellationToken::new();
    let call = {
        let mapper = mapper.clone();
        let token = token.clone();
        tokio::spawn(async move {
            mapper
                .call_with_cancel("Customer", "all", Args::new(), &token)
                .await
        })
    };
    tokio::task::yield_now().await;
    token.cancel();

    let err = call
        .await
        .expect("task should not panic")
        .expect_err("call was cancelled");
    assert!(matches!(err, DbError::Cancelled { ref operation } if operation == "all"));
    // the abandoned connect does not leave the manager stuck
    assert_eq!(mapper.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_operation_timeout() {
    let driver = ScriptedDriver::new();
    driver.gate_connects();
    let options = MapperOptions::unbounded().with_operation_timeout(Duration::from_millis(20));
    let mapper = mapper_with(&driver, options);
    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define");

    let err = mapper
        .call("Customer", "all", Args::new())
        .await
        .expect_err("connect never completes");
    assert!(matches!(err, DbError::Timeout { elapsed_ms: 20, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_connect_timeout_from_options() {
    let driver = ScriptedDriver::new();
    driver.gate_connects();
    let options = MapperOptions::unbounded().with_connect_timeout(Duration::from_millis(20));
    let mapper = mapper_with(&driver, options);
    mapper
        .define_query("Customer", query("all", ALL_CUSTOMERS))
        .await
        .expect("define");

    let err = mapper
        .call("Customer", "all", Args::new())
        .await
        .expect_err("connect times out");
    assert!(matches!(err, DbError::Connect { .. }));
}
