//! Operation definitions.
//!
//! An operation is one of three kinds: an ad-hoc query whose SQL text is built
//! per call, a prepared statement executed many times with different values,
//! or a stored procedure. Definitions are validated when they are registered,
//! never at first call.

use crate::error::{DbError, DbResult};
use crate::models::entity::{Entity, Row};
use crate::models::params::{ParamSpec, ParamType, SqlType};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Logical arguments to an operation, keyed by parameter name.
pub type Args = Row;

/// Builds the SQL text of an ad-hoc query from the call arguments and, for
/// instance operations, the entity the operation was called on.
pub type QueryBuilder = Arc<dyn Fn(&Args, Option<&Entity>) -> String + Send + Sync>;

/// Rewrites procedure arguments before they are bound.
pub type ArgPreprocessor = Arc<dyn Fn(Args) -> Args + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Statement,
    Procedure,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Statement => write!(f, "statement"),
            Self::Procedure => write!(f, "procedure"),
        }
    }
}

/// Ad-hoc query: no prepared state, SQL built per call.
#[derive(Clone)]
pub struct QueryDef {
    pub name: String,
    pub is_static: bool,
    pub one_result: bool,
    pub result_types: Vec<String>,
    pub builder: QueryBuilder,
}

impl QueryDef {
    pub fn new<F>(name: impl Into<String>, builder: F) -> Self
    where
        F: Fn(&Args, Option<&Entity>) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            is_static: true,
            one_result: false,
            result_types: Vec::new(),
            builder: Arc::new(builder),
        }
    }
}

/// Prepared statement: prepared once, executed many times.
#[derive(Debug, Clone)]
pub struct StatementDef {
    pub name: String,
    pub is_static: bool,
    pub one_result: bool,
    pub parameter_specs: Vec<ParamSpec>,
    pub result_types: Vec<String>,
    pub sql: String,
}

impl StatementDef {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_static: true,
            one_result: false,
            parameter_specs: Vec::new(),
            result_types: Vec::new(),
            sql: sql.into(),
        }
    }

    /// Append a parameter declaration.
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.parameter_specs.push(spec);
        self
    }
}

/// Stored procedure call.
#[derive(Clone)]
pub struct ProcedureDef {
    pub name: String,
    /// Routine to invoke; the operation name unless overridden
    pub routine: String,
    pub is_static: bool,
    pub one_result: bool,
    /// `None` means the shape is introspected from the routine's catalog entry
    pub parameter_specs: Option<Vec<ParamSpec>>,
    pub result_types: Vec<String>,
    pub output: Option<(String, SqlType)>,
    pub arg_preprocessor: Option<ArgPreprocessor>,
}

impl ProcedureDef {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            routine: name.clone(),
            name,
            is_static: true,
            one_result: false,
            parameter_specs: None,
            result_types: Vec::new(),
            output: None,
            arg_preprocessor: None,
        }
    }

    /// Invoke a routine whose name differs from the operation name.
    pub fn routine(mut self, routine: impl Into<String>) -> Self {
        self.routine = routine.into();
        self
    }

    /// Append a parameter declaration (switches off catalog introspection).
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.parameter_specs.get_or_insert_with(Vec::new).push(spec);
        self
    }

    /// Declare the routine's scalar output parameter.
    pub fn output(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.output = Some((name.into(), sql_type));
        self
    }

    pub fn preprocess<F>(mut self, f: F) -> Self
    where
        F: Fn(Args) -> Args + Send + Sync + 'static,
    {
        self.arg_preprocessor = Some(Arc::new(f));
        self
    }
}

macro_rules! common_builders {
    ($($def:ty),+) => {
        $(
            impl $def {
                /// Make this an instance operation, called on an entity.
                pub fn on_instance(mut self) -> Self {
                    self.is_static = false;
                    self
                }

                /// Return a single entity; zero rows is an `EmptyResult` error.
                pub fn one_result(mut self) -> Self {
                    self.one_result = true;
                    self
                }

                /// Declare the entity types of the returned row sets, primary first.
                pub fn returns<I, S>(mut self, types: I) -> Self
                where
                    I: IntoIterator<Item = S>,
                    S: Into<String>,
                {
                    self.result_types = types.into_iter().map(Into::into).collect();
                    self
                }
            }
        )+
    };
}

common_builders!(QueryDef, StatementDef, ProcedureDef);

/// Any operation definition.
#[derive(Clone)]
pub enum OperationDef {
    Query(QueryDef),
    Statement(StatementDef),
    Procedure(ProcedureDef),
}

impl OperationDef {
    pub fn name(&self) -> &str {
        match self {
            Self::Query(d) => &d.name,
            Self::Statement(d) => &d.name,
            Self::Procedure(d) => &d.name,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Query(_) => OperationKind::Query,
            Self::Statement(_) => OperationKind::Statement,
            Self::Procedure(_) => OperationKind::Procedure,
        }
    }

    pub fn is_static(&self) -> bool {
        match self {
            Self::Query(d) => d.is_static,
            Self::Statement(d) => d.is_static,
            Self::Procedure(d) => d.is_static,
        }
    }

    pub fn one_result(&self) -> bool {
        match self {
            Self::Query(d) => d.one_result,
            Self::Statement(d) => d.one_result,
            Self::Procedure(d) => d.one_result,
        }
    }

    /// Declared result types; empty means "the owning entity type".
    pub fn result_types(&self) -> &[String] {
        match self {
            Self::Query(d) => &d.result_types,
            Self::Statement(d) => &d.result_types,
            Self::Procedure(d) => &d.result_types,
        }
    }

    /// Declared parameters, if the operation kind has any.
    pub fn parameter_specs(&self) -> Option<&[ParamSpec]> {
        match self {
            Self::Query(_) => None,
            Self::Statement(d) => Some(&d.parameter_specs),
            Self::Procedure(d) => d.parameter_specs.as_deref(),
        }
    }

    /// Check the definition for shape errors.
    pub fn validate(&self) -> DbResult<()> {
        let name = self.name();
        if name.trim().is_empty() {
            return Err(DbError::invalid_definition(
                name,
                "operation name cannot be empty",
            ));
        }

        match self {
            Self::Query(_) => {}
            Self::Statement(d) => {
                if d.sql.trim().is_empty() {
                    return Err(DbError::invalid_definition(
                        name,
                        "statement SQL cannot be empty",
                    ));
                }
            }
            Self::Procedure(d) => {
                if d.routine.trim().is_empty() {
                    return Err(DbError::invalid_definition(
                        name,
                        "routine name cannot be empty",
                    ));
                }
                if let Some((output, _)) = &d.output {
                    if output.trim().is_empty() {
                        return Err(DbError::invalid_definition(
                            name,
                            "output parameter name cannot be empty",
                        ));
                    }
                }
            }
        }

        if let Some(specs) = self.parameter_specs() {
            validate_specs(name, specs)?;
        }

        if self.result_types().iter().any(|t| t.trim().is_empty()) {
            return Err(DbError::invalid_definition(
                name,
                "result type names cannot be empty",
            ));
        }
        Ok(())
    }
}

fn validate_specs(operation: &str, specs: &[ParamSpec]) -> DbResult<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(DbError::invalid_definition(
                operation,
                "parameter names cannot be empty",
            ));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(DbError::invalid_definition(
                operation,
                format!("parameter '{}' is declared twice", spec.name),
            ));
        }
        if let ParamType::Table(columns) = &spec.param_type {
            if columns.is_empty() {
                return Err(DbError::invalid_definition(
                    operation,
                    format!("table parameter '{}' declares no columns", spec.name),
                ));
            }
            let mut cols = HashSet::new();
            for col in columns {
                if !cols.insert(col.name.as_str()) {
                    return Err(DbError::invalid_definition(
                        operation,
                        format!(
                            "table parameter '{}' declares column '{}' twice",
                            spec.name, col.name
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

impl fmt::Debug for OperationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDef")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("is_static", &self.is_static())
            .field("one_result", &self.one_result())
            .field("result_types", &self.result_types())
            .finish()
    }
}

impl From<QueryDef> for OperationDef {
    fn from(def: QueryDef) -> Self {
        Self::Query(def)
    }
}

impl From<StatementDef> for OperationDef {
    fn from(def: StatementDef) -> Self {
        Self::Statement(def)
    }
}

impl From<ProcedureDef> for OperationDef {
    fn from(def: ProcedureDef) -> Self {
        Self::Procedure(def)
    }
}
