//! [`Driver`] implementation over sqlx for MySQL and SQLite.
//!
//! Each [`SqlxConnection`] wraps one physical sqlx connection behind a tokio
//! mutex; clones share it. Parameters bind positionally in declaration
//! order, so SQL text uses `?` placeholders. Table-valued parameters bind as
//! JSON array text, which SQL reads back with `json_each(?)` on SQLite or
//! `JSON_TABLE(?, ...)` on MySQL.
//!
//! Every statement in a batch contributes one row set, in order. An empty
//! result that is the status of a write is not a row set. MySQL reports
//! affected rows per statement, so a positive count marks a write. SQLite
//! reports `changes()` and `last_insert_rowid()` per connection and a SELECT
//! leaves both untouched, so a write is a completion that moved either
//! counter. A `CALL` ends with the status of the call itself, which is never
//! a row set.

use crate::db::driver::{Driver, DriverError, DriverResult};
use crate::db::params::{BoundParam, BoundRequest, BoundValue};
use crate::db::types::{RowToJson, SqlValue};
use crate::models::{
    ConnectionConfig, DatabaseType, ParamDirection, ParamSpec, ParamType, Row, RowSet, SqlType,
};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlStatement};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteStatement};
use sqlx::types::Json;
use sqlx::{Arguments, ConnectOptions, Connection, Either, Executor, MySql, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

enum DbConnection {
    MySql(MySqlConnection),
    SQLite(SqliteConnection, SqliteCounters),
    Closed,
}

/// The per-connection counters SQLite reports with each completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SqliteCounters {
    changes: u64,
    last_insert_rowid: i64,
}

/// Shared handle to one physical sqlx connection.
#[derive(Clone)]
pub struct SqlxConnection {
    id: Uuid,
    db_type: DatabaseType,
    inner: Arc<Mutex<DbConnection>>,
}

impl SqlxConnection {
    /// Identifier used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }
}

impl std::fmt::Debug for SqlxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxConnection")
            .field("id", &self.id)
            .field("db_type", &self.db_type)
            .finish()
    }
}

enum PreparedHandle {
    MySql(MySqlStatement<'static>),
    SQLite(SqliteStatement<'static>),
}

/// A statement prepared on a [`SqlxConnection`].
pub struct SqlxStatement {
    conn: SqlxConnection,
    handle: PreparedHandle,
    released: AtomicBool,
}

fn closed() -> DriverError {
    DriverError::connect("Connection is closed")
}

fn no_procedures(db_type: DatabaseType) -> DriverError {
    DriverError::unsupported(format!("{} does not support stored procedures", db_type))
}

fn sql_value(param: &BoundParam) -> Result<SqlValue, DriverError> {
    match &param.value {
        BoundValue::Scalar { sql_type, value } => {
            SqlValue::from_json(&param.name, *sql_type, value.as_ref())
        }
        BoundValue::Table(tvp) => Ok(SqlValue::String(tvp.to_json_rows().to_string())),
    }
}

/// Splits the rows and completions of a batch into row sets.
#[derive(Debug, Default)]
struct RowSetSplitter {
    sets: Vec<RowSet>,
    current: RowSet,
    /// Whether the latest completion closed a row set
    last_was_set: bool,
}

impl RowSetSplitter {
    fn row(&mut self, row: Row) {
        self.current.push(row);
    }

    /// Close the current statement. An empty result of a write is dropped.
    fn complete(&mut self, wrote: bool) {
        let rows = std::mem::take(&mut self.current);
        self.last_was_set = !(rows.is_empty() && wrote);
        if self.last_was_set {
            self.sets.push(rows);
        }
    }

    fn finish(mut self) -> Vec<RowSet> {
        if !self.current.is_empty() {
            self.sets.push(self.current);
        }
        self.sets
    }

    /// Like [`finish`](Self::finish), dropping the status of a `CALL`.
    ///
    /// The status is the final completion. It was already dropped when it
    /// reported affected rows.
    fn finish_call(mut self) -> Vec<RowSet> {
        if self.current.is_empty() && self.last_was_set {
            self.sets.pop();
        }
        self.finish()
    }
}

fn quote_routine(routine: &str) -> String {
    routine
        .split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

/// The sqlx-backed driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxDriver;

impl SqlxDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    type Connection = SqlxConnection;
    type Statement = SqlxStatement;

    async fn connect(&self, config: &ConnectionConfig) -> Result<SqlxConnection, DriverError> {
        let db_type = config.db_type.ok_or_else(|| {
            DriverError::connect(format!(
                "Unsupported connection string: {}",
                config.masked_connection_string()
            ))
        })?;

        let conn = match db_type {
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(&config.connection_string)
                    .map_err(|e| {
                        DriverError::connect(format!("Invalid MySQL connection string: {}", e))
                    })?
                    .charset("utf8mb4");
                let conn = options
                    .connect()
                    .await
                    .map_err(|e| DriverError::connect(format!("Failed to connect: {}", e)))?;
                DbConnection::MySql(conn)
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(&config.connection_string)
                    .map_err(|e| {
                        DriverError::connect(format!("Invalid SQLite connection string: {}", e))
                    })?
                    .create_if_missing(true);
                let conn = options
                    .connect()
                    .await
                    .map_err(|e| DriverError::connect(format!("Failed to connect: {}", e)))?;
                DbConnection::SQLite(conn, SqliteCounters::default())
            }
        };

        let id = Uuid::new_v4();
        info!(connection_id = %id, db_type = %db_type, "Opened sqlx connection");
        Ok(SqlxConnection {
            id,
            db_type,
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    async fn execute(
        &self,
        conn: &SqlxConnection,
        sql: &str,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError> {
        debug!(connection_id = %conn.id, params = request.len(), "Executing SQL");
        let mut guard = conn.inner.lock().await;
        let row_sets = match &mut *guard {
            DbConnection::MySql(c) => {
                if request.is_empty() {
                    mysql::fetch_row_sets(c, sql).await?
                } else {
                    let args = mysql::arguments(request.inputs())?;
                    mysql::fetch_row_sets(c, sqlx::query_with(sql, args)).await?
                }
            }
            DbConnection::SQLite(c, counters) => {
                if request.is_empty() {
                    sqlite::fetch_row_sets(c, counters, sql).await?
                } else {
                    let args = sqlite::arguments(request.inputs())?;
                    sqlite::fetch_row_sets(c, counters, sqlx::query_with(sql, args)).await?
                }
            }
            DbConnection::Closed => return Err(closed()),
        };
        Ok(DriverResult::from_row_sets(row_sets))
    }

    async fn prepare(
        &self,
        conn: &SqlxConnection,
        sql: &str,
        declarations: &[ParamSpec],
    ) -> Result<SqlxStatement, DriverError> {
        debug!(
            connection_id = %conn.id,
            params = declarations.len(),
            "Preparing statement"
        );
        let mut guard = conn.inner.lock().await;
        // sqlx infers parameter types from the server, so declarations only
        // shape the values bound later
        let handle = match &mut *guard {
            DbConnection::MySql(c) => {
                let statement = (&mut *c)
                    .prepare_with(sql, &[])
                    .await
                    .map_err(|e| DriverError::prepare(e.to_string()))?;
                PreparedHandle::MySql(sqlx::Statement::to_owned(&statement))
            }
            DbConnection::SQLite(c, _) => {
                let statement = (&mut *c)
                    .prepare_with(sql, &[])
                    .await
                    .map_err(|e| DriverError::prepare(e.to_string()))?;
                PreparedHandle::SQLite(sqlx::Statement::to_owned(&statement))
            }
            DbConnection::Closed => return Err(closed()),
        };
        drop(guard);

        Ok(SqlxStatement {
            conn: conn.clone(),
            handle,
            released: AtomicBool::new(false),
        })
    }

    async fn execute_prepared(
        &self,
        statement: &SqlxStatement,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError> {
        if statement.released.load(Ordering::SeqCst) {
            return Err(DriverError::database("Statement has been released", None));
        }
        debug!(
            connection_id = %statement.conn.id,
            params = request.len(),
            "Executing prepared statement"
        );

        let mut guard = statement.conn.inner.lock().await;
        let row_sets = match (&mut *guard, &statement.handle) {
            (DbConnection::MySql(c), PreparedHandle::MySql(s)) => {
                let args = mysql::arguments(request.inputs())?;
                mysql::fetch_row_sets(c, sqlx::Statement::query_with(s, args)).await?
            }
            (DbConnection::SQLite(c, counters), PreparedHandle::SQLite(s)) => {
                let args = sqlite::arguments(request.inputs())?;
                sqlite::fetch_row_sets(c, counters, sqlx::Statement::query_with(s, args)).await?
            }
            (DbConnection::Closed, _) => return Err(closed()),
            _ => {
                return Err(DriverError::database(
                    "Statement does not belong to this connection",
                    None,
                ));
            }
        };
        Ok(DriverResult::from_row_sets(row_sets))
    }

    async fn unprepare(&self, statement: &SqlxStatement) -> Result<(), DriverError> {
        // sqlx owns the server-side handle through its per-connection cache
        statement.released.store(true, Ordering::SeqCst);
        debug!(connection_id = %statement.conn.id, "Released prepared statement");
        Ok(())
    }

    async fn call_procedure(
        &self,
        conn: &SqlxConnection,
        routine: &str,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError> {
        if !conn.db_type.supports_procedures() {
            return Err(no_procedures(conn.db_type));
        }
        debug!(connection_id = %conn.id, routine = %routine, "Calling procedure");
        let mut guard = conn.inner.lock().await;
        match &mut *guard {
            DbConnection::MySql(c) => mysql::call_procedure(c, routine, request).await,
            DbConnection::SQLite(..) => Err(no_procedures(conn.db_type)),
            DbConnection::Closed => Err(closed()),
        }
    }

    async fn describe_procedure(
        &self,
        conn: &SqlxConnection,
        routine: &str,
    ) -> Result<Vec<ParamSpec>, DriverError> {
        let mut guard = conn.inner.lock().await;
        match &mut *guard {
            DbConnection::MySql(c) => mysql::describe_procedure(c, routine).await,
            DbConnection::SQLite(..) => Err(no_procedures(conn.db_type)),
            DbConnection::Closed => Err(closed()),
        }
    }

    async fn close(&self, conn: SqlxConnection) -> Result<(), DriverError> {
        let previous = std::mem::replace(&mut *conn.inner.lock().await, DbConnection::Closed);
        match previous {
            DbConnection::MySql(c) => c.close().await?,
            DbConnection::SQLite(c, _) => c.close().await?,
            DbConnection::Closed => return Ok(()),
        }
        info!(connection_id = %conn.id, "Closed sqlx connection");
        Ok(())
    }
}

mod mysql {
    use super::*;
    use sqlx::Execute;

    pub async fn fetch_row_sets<'q>(
        conn: &mut MySqlConnection,
        query: impl Execute<'q, MySql> + 'q,
    ) -> Result<Vec<RowSet>, DriverError> {
        Ok(split(conn, query).await?.finish())
    }

    async fn split<'q>(
        conn: &mut MySqlConnection,
        query: impl Execute<'q, MySql> + 'q,
    ) -> Result<RowSetSplitter, DriverError> {
        let mut stream = conn.fetch_many(query);
        let mut splitter = RowSetSplitter::default();
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Right(row) => splitter.row(row.to_json_row()),
                Either::Left(done) => splitter.complete(done.rows_affected() > 0),
            }
        }
        Ok(splitter)
    }

    pub fn arguments<'a>(
        params: impl Iterator<Item = &'a BoundParam>,
    ) -> Result<MySqlArguments, DriverError> {
        let mut args = MySqlArguments::default();
        for param in params {
            bind(&mut args, &param.name, sql_value(param)?)?;
        }
        Ok(args)
    }

    fn bind(args: &mut MySqlArguments, name: &str, value: SqlValue) -> Result<(), DriverError> {
        let result = match value {
            SqlValue::Null => args.add(None::<String>),
            SqlValue::Bool(v) => args.add(v),
            SqlValue::Int(v) => args.add(v),
            SqlValue::Float(v) => args.add(v),
            SqlValue::Decimal(v) | SqlValue::String(v) => args.add(v),
            SqlValue::Bytes(v) => args.add(v),
            SqlValue::Json(v) => args.add(Json(v)),
        };
        result.map_err(|e| DriverError::bind(name, e.to_string()))
    }

    /// `CALL routine(...)` with output parameters routed through session
    /// variables that are read back after the call.
    pub async fn call_procedure(
        conn: &mut MySqlConnection,
        routine: &str,
        request: &BoundRequest,
    ) -> Result<DriverResult, DriverError> {
        let mut placeholders = Vec::with_capacity(request.len());
        let mut outputs = Vec::new();
        for (idx, param) in request.params().iter().enumerate() {
            match param.direction {
                ParamDirection::Input => placeholders.push("?".to_string()),
                ParamDirection::Output | ParamDirection::InputOutput => {
                    let var = format!("@rowlink_out_{}", idx);
                    if param.direction == ParamDirection::InputOutput {
                        let mut args = MySqlArguments::default();
                        bind(&mut args, &param.name, sql_value(param)?)?;
                        let set = format!("SET {} = ?", var);
                        (&mut *conn).execute(sqlx::query_with(&set, args)).await?;
                    }
                    placeholders.push(var.clone());
                    outputs.push((param.name.clone(), var));
                }
            }
        }

        let sql = format!("CALL {}({})", quote_routine(routine), placeholders.join(", "));
        let inputs = request
            .params()
            .iter()
            .filter(|p| p.direction == ParamDirection::Input);
        let args = arguments(inputs)?;
        let row_sets = split(&mut *conn, sqlx::query_with(&sql, args))
            .await?
            .finish_call();

        let mut output = Row::new();
        if !outputs.is_empty() {
            let select = outputs
                .iter()
                .map(|(name, var)| format!("{} AS `{}`", var, name.replace('`', "``")))
                .collect::<Vec<_>>()
                .join(", ");
            let row = (&mut *conn)
                .fetch_one(format!("SELECT {}", select).as_str())
                .await?;
            output = row.to_json_row();
        }

        Ok(DriverResult {
            row_sets,
            return_value: None,
            output,
        })
    }

    const DESCRIBE_SQL: &str = "SELECT PARAMETER_NAME AS name, PARAMETER_MODE AS mode, \
         DATA_TYPE AS data_type, CHARACTER_MAXIMUM_LENGTH AS max_length \
         FROM information_schema.PARAMETERS \
         WHERE SPECIFIC_SCHEMA = COALESCE(?, DATABASE()) AND SPECIFIC_NAME = ? \
         AND ROUTINE_TYPE = 'PROCEDURE' AND ORDINAL_POSITION > 0 \
         ORDER BY ORDINAL_POSITION";

    const EXISTS_SQL: &str = "SELECT COUNT(*) AS found FROM information_schema.ROUTINES \
         WHERE ROUTINE_SCHEMA = COALESCE(?, DATABASE()) AND ROUTINE_NAME = ? \
         AND ROUTINE_TYPE = 'PROCEDURE'";

    pub async fn describe_procedure(
        conn: &mut MySqlConnection,
        routine: &str,
    ) -> Result<Vec<ParamSpec>, DriverError> {
        let (schema, name) = match routine.rsplit_once('.') {
            Some((schema, name)) => (Some(schema.to_string()), name.to_string()),
            None => (None, routine.to_string()),
        };

        let rows = sqlx::query(DESCRIBE_SQL)
            .bind(schema.clone())
            .bind(name.clone())
            .fetch_all(&mut *conn)
            .await?;

        if rows.is_empty() {
            let found = sqlx::query(EXISTS_SQL)
                .bind(schema)
                .bind(name)
                .fetch_one(&mut *conn)
                .await?
                .to_json_row();
            if found.get("found").and_then(JsonValue::as_i64) == Some(0) {
                return Err(DriverError::database(
                    format!("Procedure '{}' does not exist", routine),
                    None,
                ));
            }
        }

        rows.iter()
            .map(|row| param_from_catalog(routine, &row.to_json_row()))
            .collect()
    }

    fn param_from_catalog(routine: &str, row: &Row) -> Result<ParamSpec, DriverError> {
        let text = |key: &str| row.get(key).and_then(JsonValue::as_str).unwrap_or_default();
        let name = text("name").to_string();
        let data_type = text("data_type");
        let max_length = row
            .get("max_length")
            .and_then(JsonValue::as_u64)
            .and_then(|n| u32::try_from(n).ok());

        let sql_type = SqlType::from_catalog(data_type, max_length).ok_or_else(|| {
            DriverError::unsupported(format!(
                "Parameter '{}' of '{}' has unsupported type {}",
                name, routine, data_type
            ))
        })?;
        let direction = match text("mode").to_uppercase().as_str() {
            "OUT" => ParamDirection::Output,
            "INOUT" => ParamDirection::InputOutput,
            _ => ParamDirection::Input,
        };
        Ok(ParamSpec {
            name,
            param_type: ParamType::Scalar(sql_type),
            direction,
        })
    }
}

mod sqlite {
    use super::*;
    use sqlx::Execute;

    /// `counters` holds the values seen at the connection's previous
    /// completion and is advanced as the batch runs.
    pub async fn fetch_row_sets<'q>(
        conn: &mut SqliteConnection,
        counters: &mut SqliteCounters,
        query: impl Execute<'q, Sqlite> + 'q,
    ) -> Result<Vec<RowSet>, DriverError> {
        let mut stream = conn.fetch_many(query);
        let mut splitter = RowSetSplitter::default();
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Right(row) => splitter.row(row.to_json_row()),
                Either::Left(done) => {
                    let seen = SqliteCounters {
                        changes: done.rows_affected(),
                        last_insert_rowid: done.last_insert_rowid(),
                    };
                    splitter.complete(seen != *counters);
                    *counters = seen;
                }
            }
        }
        Ok(splitter.finish())
    }

    pub fn arguments<'q, 'a>(
        params: impl Iterator<Item = &'a BoundParam>,
    ) -> Result<SqliteArguments<'q>, DriverError> {
        let mut args = SqliteArguments::default();
        for param in params {
            let name = param.name.as_str();
            // SQLite has no native JSON type; JSON binds as text
            let result = match sql_value(param)? {
                SqlValue::Null => args.add(None::<String>),
                SqlValue::Bool(v) => args.add(v),
                SqlValue::Int(v) => args.add(v),
                SqlValue::Float(v) => args.add(v),
                SqlValue::Decimal(v) | SqlValue::String(v) => args.add(v),
                SqlValue::Bytes(v) => args.add(v),
                SqlValue::Json(v) => args.add(v.to_string()),
            };
            result.map_err(|e| DriverError::bind(name, e.to_string()))?;
        }
        Ok(args)
    }
}
