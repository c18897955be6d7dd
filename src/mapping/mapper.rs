//! The operation façade.
//!
//! A [`Mapper`] owns one managed connection, the prepared statement registry
//! and the operations defined on each entity type. Calling an operation runs
//! the whole pipeline: acquire the connection, build and execute the request,
//! materialize every row set, link them and return the primary entities.

use crate::config::MapperOptions;
use crate::db::connection::ConnectionManager;
use crate::db::driver::{Driver, DriverResult};
use crate::db::params::{self, BoundRequest};
use crate::db::statements::{StatementRegistry, StatementState};
use crate::error::{DbError, DbResult};
use crate::mapping::link::{self, EntitySets};
use crate::mapping::materialize::{materialize, materialize_set, to_db};
use crate::mapping::registry::{EntityRegistry, EntityTypeId};
use crate::models::{
    Args, ConnectionConfig, ConnectionState, Entity, Materialized, OperationDef, OperationKind,
    OperationResult, ParamSpec, ProcedureDef, QueryDef, StatementDef,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An operation bound to its owning entity type.
struct Operation {
    owner: EntityTypeId,
    def: OperationDef,
    result_types: Vec<EntityTypeId>,
    /// Name of the prepared statement backing a statement operation
    statement_key: String,
}

struct Inner<D: Driver> {
    registry: Arc<EntityRegistry>,
    connections: Arc<ConnectionManager<D>>,
    statements: StatementRegistry<D>,
    operations: RwLock<HashMap<(EntityTypeId, String), Arc<Operation>>>,
    procedure_specs: Mutex<HashMap<String, Arc<Vec<ParamSpec>>>>,
    options: MapperOptions,
}

/// Entry point for defining and calling mapped operations.
///
/// Cloning is cheap; clones share the connection and all definitions.
pub struct Mapper<D: Driver> {
    inner: Arc<Inner<D>>,
}

impl<D: Driver> Clone for Mapper<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> Mapper<D> {
    /// Create a mapper. No connection is made until the first operation
    /// needs one.
    pub fn new(
        driver: D,
        registry: EntityRegistry,
        mut config: ConnectionConfig,
        options: MapperOptions,
    ) -> Self {
        if config.connect_timeout.is_none() {
            config.connect_timeout = options.connect_timeout;
        }
        let connections = Arc::new(ConnectionManager::new(Arc::new(driver), config));
        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(registry),
                statements: StatementRegistry::new(Arc::clone(&connections)),
                connections,
                operations: RwLock::new(HashMap::new()),
                procedure_specs: Mutex::new(HashMap::new()),
                options,
            }),
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    pub fn options(&self) -> &MapperOptions {
        &self.inner.options
    }

    pub fn connections(&self) -> &ConnectionManager<D> {
        &self.inner.connections
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connections.state()
    }

    /// Define an operation on `entity_type`, replacing any operation of the
    /// same name. Statement operations are prepared before this returns.
    pub async fn define(&self, entity_type: &str, def: impl Into<OperationDef>) -> DbResult<()> {
        let def = def.into();
        def.validate()?;
        let owner = self.inner.registry.id(entity_type)?;

        let result_types = if def.result_types().is_empty() {
            vec![owner]
        } else {
            def.result_types()
                .iter()
                .map(|name| {
                    self.inner.registry.id(name).map_err(|_| {
                        DbError::invalid_definition(
                            def.name(),
                            format!("unknown result type '{}'", name),
                        )
                    })
                })
                .collect::<DbResult<Vec<_>>>()?
        };

        let statement_key = format!("{}.{}", entity_type, def.name());
        if let OperationDef::Statement(stmt) = &def {
            let keyed = StatementDef {
                name: statement_key.clone(),
                ..stmt.clone()
            };
            self.inner.statements.prepare(&keyed).await?;
        }

        info!(
            entity_type = %entity_type,
            operation = %def.name(),
            kind = %def.kind(),
            static_op = def.is_static(),
            "Defined operation"
        );
        let key = (owner, def.name().to_string());
        let kind = def.kind();
        let operation = Arc::new(Operation {
            owner,
            def,
            result_types,
            statement_key,
        });
        let replaced = self
            .inner
            .operations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, operation);

        // a statement replaced by another kind leaves its handle behind
        if let Some(previous) = replaced {
            if previous.def.kind() == OperationKind::Statement && kind != OperationKind::Statement
            {
                if let Err(err) = self
                    .inner
                    .statements
                    .unprepare(&previous.statement_key)
                    .await
                {
                    debug!(
                        statement = %previous.statement_key,
                        error = %err,
                        "Replaced statement had no handle to release"
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn define_query(&self, entity_type: &str, def: QueryDef) -> DbResult<()> {
        self.define(entity_type, def).await
    }

    pub async fn define_statement(&self, entity_type: &str, def: StatementDef) -> DbResult<()> {
        self.define(entity_type, def).await
    }

    pub async fn define_procedure(&self, entity_type: &str, def: ProcedureDef) -> DbResult<()> {
        self.define(entity_type, def).await
    }

    fn operation(&self, entity_type: &str, name: &str) -> DbResult<Arc<Operation>> {
        let owner = self.inner.registry.id(entity_type)?;
        self.inner
            .operations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(owner, name.to_string()))
            .cloned()
            .ok_or_else(|| DbError::unknown_operation(format!("{}.{}", entity_type, name)))
    }

    /// Call a static operation.
    pub async fn call(&self, entity_type: &str, name: &str, args: Args) -> DbResult<OperationResult> {
        self.dispatch(entity_type, name, args, None, None).await
    }

    /// Call an instance operation on `entity`.
    pub async fn call_on(&self, entity: &Entity, name: &str, args: Args) -> DbResult<OperationResult> {
        self.dispatch(entity.entity_type(), name, args, Some(entity), None)
            .await
    }

    /// Call a static operation, giving up with `Cancelled` once `cancel` fires.
    pub async fn call_with_cancel(
        &self,
        entity_type: &str,
        name: &str,
        args: Args,
        cancel: &CancellationToken,
    ) -> DbResult<OperationResult> {
        self.dispatch(entity_type, name, args, None, Some(cancel))
            .await
    }

    /// Call an instance operation, giving up with `Cancelled` once `cancel` fires.
    pub async fn call_on_with_cancel(
        &self,
        entity: &Entity,
        name: &str,
        args: Args,
        cancel: &CancellationToken,
    ) -> DbResult<OperationResult> {
        self.dispatch(entity.entity_type(), name, args, Some(entity), Some(cancel))
            .await
    }

    async fn dispatch(
        &self,
        entity_type: &str,
        name: &str,
        args: Args,
        instance: Option<&Entity>,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<OperationResult> {
        let operation = self.operation(entity_type, name)?;
        match (operation.def.is_static(), instance.is_some()) {
            (true, true) => {
                return Err(DbError::invalid_definition(
                    name,
                    "static operation called on an instance",
                ));
            }
            (false, false) => {
                return Err(DbError::invalid_definition(
                    name,
                    "instance operation called without an instance",
                ));
            }
            _ => {}
        }

        let started = Instant::now();
        let result = self
            .guarded(name, cancel, self.run(&operation, args, instance))
            .await;
        match &result {
            Ok(out) => debug!(
                operation = %name,
                entities = out.data.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Operation completed"
            ),
            Err(e) => debug!(operation = %name, error = %e, "Operation failed"),
        }
        result
    }

    /// Apply the operation timeout and the cancellation token to `fut`.
    async fn guarded<T>(
        &self,
        name: &str,
        cancel: Option<&CancellationToken>,
        fut: impl Future<Output = DbResult<T>>,
    ) -> DbResult<T> {
        let limited = async {
            match self.inner.options.operation_timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .map_err(|_| DbError::timeout(name, limit.as_millis() as u64))?,
                None => fut.await,
            }
        };
        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(DbError::cancelled(name)),
                    result = limited => result,
                }
            }
            None => limited.await,
        }
    }

    async fn run(
        &self,
        operation: &Operation,
        args: Args,
        instance: Option<&Entity>,
    ) -> DbResult<OperationResult> {
        let owner = self.inner.registry.by_id(operation.owner);
        let instance_args = instance.map(|entity| to_db(owner, entity));

        let outcome = match &operation.def {
            OperationDef::Query(def) => {
                let sql = (def.builder)(&args, instance);
                let conn = self.inner.connections.acquire().await?;
                self.inner
                    .connections
                    .driver()
                    .execute(&conn, &sql, &BoundRequest::empty())
                    .await
                    .map_err(DbError::from)
            }
            OperationDef::Statement(_) => {
                // explicit arguments take precedence over instance fields
                let mut merged = instance_args.unwrap_or_default();
                merged.extend(args);
                self.inner
                    .statements
                    .execute(&operation.statement_key, &merged)
                    .await
            }
            OperationDef::Procedure(def) => {
                // instance fields take precedence over explicit arguments
                let mut merged = args;
                if let Some(fields) = instance_args {
                    merged.extend(fields);
                }
                if let Some(preprocess) = &def.arg_preprocessor {
                    merged = preprocess(merged);
                }
                let conn = self.inner.connections.acquire().await?;
                let specs = self.procedure_specs(&conn, def).await?;
                let request = params::build(&merged, &specs)?;
                self.inner
                    .connections
                    .driver()
                    .call_procedure(&conn, &def.routine, &request)
                    .await
                    .map_err(DbError::from)
            }
        };

        if let Err(err @ DbError::Connect { .. }) = &outcome {
            warn!(error = %err, "Connection lost; the next call reconnects");
            self.inner.connections.reset();
        }
        self.finish(operation, outcome?).await
    }

    /// Materialize and link a driver result.
    async fn finish(
        &self,
        operation: &Operation,
        result: DriverResult,
    ) -> DbResult<OperationResult> {
        let DriverResult {
            row_sets,
            return_value,
            output,
        } = result;
        let name = operation.def.name();
        link::check_shape(name, operation.result_types.len(), &row_sets)?;

        let registry = &self.inner.registry;
        let primary = operation.result_types[0];
        let one_result = operation.def.one_result();
        let mut row_sets = row_sets.into_iter();

        let materialized = materialize(
            name,
            registry.by_id(primary),
            row_sets.next(),
            one_result,
        )
        .await?;

        let mut sets = EntitySets::new();
        sets.insert(primary, materialized.into_many());
        for (rows, ty) in row_sets.zip(operation.result_types.iter().skip(1)) {
            sets.insert(*ty, materialize_set(registry.by_id(*ty), rows).await?);
        }

        let mut linked = link::link(registry, primary, &sets);
        let data = if one_result {
            if linked.is_empty() {
                return Err(DbError::empty_result(name));
            }
            Materialized::One(linked.swap_remove(0))
        } else {
            Materialized::Many(linked)
        };

        Ok(OperationResult {
            data,
            return_value,
            output,
        })
    }

    /// Parameter shape of a procedure: declared, or introspected once and cached.
    async fn procedure_specs(
        &self,
        conn: &D::Connection,
        def: &ProcedureDef,
    ) -> DbResult<Vec<ParamSpec>> {
        let mut specs = match &def.parameter_specs {
            Some(specs) => specs.clone(),
            None => {
                let cached = self
                    .inner
                    .procedure_specs
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .get(&def.routine)
                    .cloned();
                match cached {
                    Some(specs) => specs.as_ref().clone(),
                    None => {
                        let specs = self
                            .inner
                            .connections
                            .driver()
                            .describe_procedure(conn, &def.routine)
                            .await?;
                        debug!(
                            routine = %def.routine,
                            params = specs.len(),
                            "Introspected procedure parameters"
                        );
                        self.inner
                            .procedure_specs
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .insert(def.routine.clone(), Arc::new(specs.clone()));
                        specs
                    }
                }
            }
        };

        if let Some((output, sql_type)) = &def.output {
            match specs.iter_mut().find(|s| &s.name == output) {
                Some(spec) => {
                    *spec = ParamSpec::output(output.clone(), *sql_type);
                }
                None => specs.push(ParamSpec::output(output.clone(), *sql_type)),
            }
        }
        Ok(specs)
    }

    /// Prepare a statement operation again after it was unprepared.
    pub async fn prepare(&self, entity_type: &str, name: &str) -> DbResult<()> {
        let operation = self.operation(entity_type, name)?;
        match &operation.def {
            OperationDef::Statement(stmt) => {
                let keyed = StatementDef {
                    name: operation.statement_key.clone(),
                    ..stmt.clone()
                };
                self.inner.statements.prepare(&keyed).await
            }
            other => Err(DbError::invalid_definition(
                name,
                format!("{} operations are not prepared", other.kind()),
            )),
        }
    }

    /// Release the prepared handle of a statement operation.
    pub async fn unprepare(&self, entity_type: &str, name: &str) -> DbResult<()> {
        let operation = self.operation(entity_type, name)?;
        if operation.def.kind() != OperationKind::Statement {
            return Err(DbError::invalid_definition(
                name,
                format!("{} operations are not prepared", operation.def.kind()),
            ));
        }
        self.inner
            .statements
            .unprepare(&operation.statement_key)
            .await
    }

    /// Lifecycle state of a statement operation's prepared handle.
    pub fn statement_state(&self, entity_type: &str, name: &str) -> DbResult<StatementState> {
        let operation = self.operation(entity_type, name)?;
        Ok(self.inner.statements.state(&operation.statement_key))
    }

    /// Close the managed connection. The next call reconnects.
    pub async fn disconnect(&self) -> DbResult<()> {
        self.inner.connections.disconnect().await
    }
}
