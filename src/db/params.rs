//! Request parameter building.
//!
//! Converts a logical argument map into driver-level bound parameters. Scalar
//! arguments are passed through as-is; table-valued parameters are assembled
//! from arrays of row objects by projecting each declared column out of each
//! row.

use crate::error::{DbError, DbResult};
use crate::models::{Args, ColumnSpec, ParamDirection, ParamSpec, ParamType, SqlType};
use serde_json::{Map, Value as JsonValue};
use tracing::trace;

/// A table-valued parameter: declared column shape plus rows in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredParam {
    pub columns: Vec<ColumnSpec>,
    /// Each row holds one value per declared column, in column order
    pub rows: Vec<Vec<JsonValue>>,
}

impl StructuredParam {
    /// Create an empty structured parameter with the given column shape.
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row, projecting the declared columns out of `source` by name.
    ///
    /// Columns missing from `source` are bound as NULL.
    pub fn push_row(&mut self, source: &Map<String, JsonValue>) {
        let row = self
            .columns
            .iter()
            .map(|col| source.get(&col.name).cloned().unwrap_or(JsonValue::Null))
            .collect();
        self.rows.push(row);
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Render the rows as a JSON array of objects keyed by column name.
    pub fn to_json_rows(&self) -> JsonValue {
        JsonValue::Array(
            self.rows
                .iter()
                .map(|row| {
                    let obj: Map<String, JsonValue> = self
                        .columns
                        .iter()
                        .zip(row)
                        .map(|(col, value)| (col.name.clone(), value.clone()))
                        .collect();
                    JsonValue::Object(obj)
                })
                .collect(),
        )
    }
}

/// The value side of a bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    /// `value` is `None` when the argument was absent (or the parameter is output-only)
    Scalar {
        sql_type: SqlType,
        value: Option<JsonValue>,
    },
    Table(StructuredParam),
}

/// One parameter ready for the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub name: String,
    pub direction: ParamDirection,
    pub value: BoundValue,
}

/// All parameters of one call, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundRequest {
    params: Vec<BoundParam>,
}

impl BoundRequest {
    /// A request without parameters.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn params(&self) -> &[BoundParam] {
        &self.params
    }

    /// Parameters the caller supplies a value for, in binding order.
    pub fn inputs(&self) -> impl Iterator<Item = &BoundParam> {
        self.params
            .iter()
            .filter(|p| p.direction != ParamDirection::Output)
    }

    pub fn get(&self, name: &str) -> Option<&BoundParam> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub(crate) fn push(&mut self, param: BoundParam) {
        self.params.push(param);
    }
}

/// Bind `args` against `specs`, preserving declaration order.
pub fn build(args: &Args, specs: &[ParamSpec]) -> DbResult<BoundRequest> {
    let mut request = BoundRequest::default();

    for spec in specs {
        let value = match &spec.param_type {
            ParamType::Scalar(sql_type) => BoundValue::Scalar {
                sql_type: *sql_type,
                value: if spec.is_input() {
                    args.get(&spec.name).cloned()
                } else {
                    None
                },
            },
            ParamType::Table(columns) => {
                BoundValue::Table(build_structured(&spec.name, columns, args.get(&spec.name))?)
            }
        };

        request.push(BoundParam {
            name: spec.name.clone(),
            direction: spec.direction,
            value,
        });
    }

    trace!(params = request.len(), "Built request parameters");
    Ok(request)
}

/// Type-only declarations for preparing a statement.
///
/// Values are never part of a declaration; only the names, shapes and
/// directions of the parameters are carried over.
pub fn declarations(specs: &[ParamSpec]) -> Vec<ParamSpec> {
    specs.to_vec()
}

fn build_structured(
    name: &str,
    columns: &[ColumnSpec],
    arg: Option<&JsonValue>,
) -> DbResult<StructuredParam> {
    let mut param = StructuredParam::new(columns.to_vec());

    let items = match arg {
        None | Some(JsonValue::Null) => return Ok(param),
        Some(JsonValue::Array(items)) => items,
        Some(other) => {
            return Err(DbError::parameter_bind(
                name,
                format!(
                    "table-valued parameter expects an array of rows, got {}",
                    json_type_name(other)
                ),
            ));
        }
    };

    for (idx, item) in items.iter().enumerate() {
        match item {
            JsonValue::Object(row) => param.push_row(row),
            other => {
                return Err(DbError::parameter_bind(
                    name,
                    format!(
                        "row {} of table-valued parameter is {}, expected an object",
                        idx,
                        json_type_name(other)
                    ),
                ));
            }
        }
    }
    Ok(param)
}

pub(crate) fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
