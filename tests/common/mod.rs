//! Scripted in-memory driver shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rowlink::db::{BoundRequest, Driver, DriverError, DriverResult};
use rowlink::models::{ConnectionConfig, ParamSpec, Row, RowSet};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConnection {
    pub id: usize,
}

#[derive(Debug)]
pub struct TestStatement {
    pub handle: u64,
    pub sql: String,
    /// Connection the handle was prepared on
    pub conn: usize,
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Execute { sql: String, request: BoundRequest },
    Prepare { handle: u64, sql: String },
    ExecutePrepared { handle: u64, request: BoundRequest },
    Unprepare { handle: u64 },
    Procedure { routine: String, request: BoundRequest },
    Describe { routine: String },
    Close { id: usize },
}

#[derive(Default)]
pub struct Script {
    connects: AtomicUsize,
    next_handle: AtomicU64,
    gate: Mutex<Option<Arc<Notify>>>,
    unprepare_gate: Mutex<Option<Arc<Notify>>>,
    closed: Mutex<HashSet<usize>>,
    fail_connect: AtomicBool,
    fail_prepare: AtomicBool,
    responses: Mutex<HashMap<String, Result<DriverResult, DriverError>>>,
    procedures: Mutex<HashMap<String, Vec<ParamSpec>>>,
    calls: Mutex<Vec<Call>>,
}

/// A driver whose answers are scripted by the test.
///
/// Responses are keyed by SQL text (queries and prepared statements) or
/// routine name (procedures). Unscripted calls return no row sets.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    script: Arc<Script>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every connect until [`open_gate`](Self::open_gate) is called.
    pub fn gate_connects(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.script.gate.lock().unwrap() = Some(Arc::clone(&notify));
        notify
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.script.gate.lock().unwrap().take() {
            gate.notify_one();
        }
    }

    /// Hold every unprepare until the returned gate is notified.
    pub fn gate_unprepares(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.script.unprepare_gate.lock().unwrap() = Some(Arc::clone(&notify));
        notify
    }

    /// Let held and future unprepares through.
    pub fn open_unprepares(&self) {
        if let Some(gate) = self.script.unprepare_gate.lock().unwrap().take() {
            gate.notify_waiters();
        }
    }

    /// Drop every connection opened so far, as a server restart would.
    pub fn drop_connections(&self) {
        let opened = self.script.connects.load(Ordering::SeqCst);
        self.script.closed.lock().unwrap().extend(1..=opened);
    }

    pub fn is_closed(&self, id: usize) -> bool {
        self.script.closed.lock().unwrap().contains(&id)
    }

    pub fn fail_connects(&self, fail: bool) {
        self.script.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_prepares(&self, fail: bool) {
        self.script.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn respond(&self, key: &str, row_sets: Vec<RowSet>) {
        self.respond_with(key, Ok(DriverResult::from_row_sets(row_sets)));
    }

    pub fn respond_with(&self, key: &str, result: Result<DriverResult, DriverError>) {
        self.script
            .responses
            .lock()
            .unwrap()
            .insert(key.to_string(), result);
    }

    pub fn describe(&self, routine: &str, specs: Vec<ParamSpec>) {
        self.script
            .procedures
            .lock()
            .unwrap()
            .insert(routine.to_string(), specs);
    }

    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.script.calls.lock().unwrap().push(call);
    }

    fn check_open(&self, id: usize) -> Result<(), DriverError> {
        if self.is_closed(id) {
            return Err(DriverError::connect("Connection is closed"));
        }
        Ok(())
    }

    fn response(&self, key: &str) -> Result<DriverResult, DriverError> {
        self.script
            .responses
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| Ok(DriverResult::default()))
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    type Connection = TestConnection;
    type Statement = TestStatement;

    async fn connect(&self, _config: &ConnectionConfig) -> Result<TestConnection, DriverError> {
        let id = self.script.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = self.script.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.script.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::connect("connection refused"));
        }
        Ok(TestConnection { id })
    }

    async fn execute(
        &self,
        conn: &TestConnection,
        sql: &str,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError> {
        self.check_open(conn.id)?;
        self.record(Call::Execute {
            sql: sql.to_string(),
            request: request.clone(),
        });
        self.response(sql)
    }

    async fn prepare(
        &self,
        conn: &TestConnection,
        sql: &str,
        _declarations: &[ParamSpec],
    ) -> Result<TestStatement, DriverError> {
        self.check_open(conn.id)?;
        if self.script.fail_prepare.load(Ordering::SeqCst) {
            return Err(DriverError::prepare("syntax error near 'SELEC'"));
        }
        let handle = self.script.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(Call::Prepare {
            handle,
            sql: sql.to_string(),
        });
        Ok(TestStatement {
            handle,
            sql: sql.to_string(),
            conn: conn.id,
        })
    }

    async fn execute_prepared(
        &self,
        statement: &TestStatement,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError> {
        self.check_open(statement.conn)?;
        self.record(Call::ExecutePrepared {
            handle: statement.handle,
            request: request.clone(),
        });
        self.response(&statement.sql)
    }

    async fn unprepare(&self, statement: &TestStatement) -> Result<(), DriverError> {
        let gate = self.script.unprepare_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record(Call::Unprepare {
            handle: statement.handle,
        });
        Ok(())
    }

    async fn call_procedure(
        &self,
        conn: &TestConnection,
        routine: &str,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError> {
        self.check_open(conn.id)?;
        self.record(Call::Procedure {
            routine: routine.to_string(),
            request: request.clone(),
        });
        self.response(routine)
    }

    async fn describe_procedure(
        &self,
        _conn: &TestConnection,
        routine: &str,
    ) -> Result<Vec<ParamSpec>, DriverError> {
        self.record(Call::Describe {
            routine: routine.to_string(),
        });
        self.script
            .procedures
            .lock()
            .unwrap()
            .get(routine)
            .cloned()
            .ok_or_else(|| DriverError::database(format!("no routine {}", routine), None))
    }

    async fn close(&self, conn: TestConnection) -> Result<(), DriverError> {
        self.script.closed.lock().unwrap().insert(conn.id);
        self.record(Call::Close { id: conn.id });
        Ok(())
    }
}

/// Build a row from a JSON object literal.
pub fn row(value: JsonValue) -> Row {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Build a row set from a JSON array of objects.
pub fn rows(value: JsonValue) -> RowSet {
    match value {
        JsonValue::Array(items) => items.into_iter().map(row).collect(),
        other => panic!("expected a JSON array, got {other}"),
    }
}

pub fn config() -> ConnectionConfig {
    ConnectionConfig::parse("sqlite::memory:").unwrap()
}
