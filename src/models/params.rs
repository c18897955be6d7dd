//! Parameter declaration models.
//!
//! An operation declares its parameters as an ordered list of [`ParamSpec`]s.
//! Order matters: drivers that bind positionally receive values in exactly
//! this order, and table-valued columns are declared in this order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Driver-level scalar type of a parameter or table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Bit,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Real,
    Decimal { precision: u8, scale: u8 },
    Char(u32),
    NChar(u32),
    /// `None` means `MAX`
    VarChar(Option<u32>),
    /// `None` means `MAX`
    NVarChar(Option<u32>),
    Text,
    NText,
    Date,
    DateTime,
    DateTime2,
    Time,
    UniqueIdentifier,
    /// `None` means `MAX`
    VarBinary(Option<u32>),
    Json,
}

impl SqlType {
    /// Check if values of this type are integers.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::TinyInt | Self::SmallInt | Self::Int | Self::BigInt
        )
    }

    /// Check if values of this type are text.
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            Self::Char(_)
                | Self::NChar(_)
                | Self::VarChar(_)
                | Self::NVarChar(_)
                | Self::Text
                | Self::NText
                | Self::UniqueIdentifier
        )
    }

    /// Map a catalog type name (as reported by `information_schema`) to a SqlType.
    ///
    /// Lengths are taken from `max_length` when the type carries one.
    pub fn from_catalog(type_name: &str, max_length: Option<u32>) -> Option<Self> {
        let lower = type_name.to_lowercase();
        let ty = match lower.as_str() {
            "bit" | "bool" | "boolean" => Self::Bit,
            "tinyint" => Self::TinyInt,
            "smallint" => Self::SmallInt,
            "int" | "integer" | "mediumint" => Self::Int,
            "bigint" => Self::BigInt,
            "float" | "double" => Self::Float,
            "real" => Self::Real,
            "decimal" | "numeric" => Self::Decimal {
                precision: 18,
                scale: 0,
            },
            "char" => Self::Char(max_length.unwrap_or(1)),
            "nchar" => Self::NChar(max_length.unwrap_or(1)),
            "varchar" => Self::VarChar(max_length),
            "nvarchar" => Self::NVarChar(max_length),
            "text" | "mediumtext" | "longtext" | "tinytext" => Self::Text,
            "ntext" => Self::NText,
            "date" => Self::Date,
            "datetime" | "timestamp" => Self::DateTime,
            "datetime2" => Self::DateTime2,
            "time" => Self::Time,
            "uniqueidentifier" | "uuid" => Self::UniqueIdentifier,
            "varbinary" | "binary" | "blob" | "longblob" => Self::VarBinary(max_length),
            "json" => Self::Json,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn len(n: &Option<u32>) -> String {
            n.map(|n| n.to_string()).unwrap_or_else(|| "MAX".to_string())
        }
        match self {
            Self::Bit => write!(f, "BIT"),
            Self::TinyInt => write!(f, "TINYINT"),
            Self::SmallInt => write!(f, "SMALLINT"),
            Self::Int => write!(f, "INT"),
            Self::BigInt => write!(f, "BIGINT"),
            Self::Float => write!(f, "FLOAT"),
            Self::Real => write!(f, "REAL"),
            Self::Decimal { precision, scale } => write!(f, "DECIMAL({}, {})", precision, scale),
            Self::Char(n) => write!(f, "CHAR({})", n),
            Self::NChar(n) => write!(f, "NCHAR({})", n),
            Self::VarChar(n) => write!(f, "VARCHAR({})", len(n)),
            Self::NVarChar(n) => write!(f, "NVARCHAR({})", len(n)),
            Self::Text => write!(f, "TEXT"),
            Self::NText => write!(f, "NTEXT"),
            Self::Date => write!(f, "DATE"),
            Self::DateTime => write!(f, "DATETIME"),
            Self::DateTime2 => write!(f, "DATETIME2"),
            Self::Time => write!(f, "TIME"),
            Self::UniqueIdentifier => write!(f, "UNIQUEIDENTIFIER"),
            Self::VarBinary(n) => write!(f, "VARBINARY({})", len(n)),
            Self::Json => write!(f, "JSON"),
        }
    }
}

/// One column of a table-valued parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_type: SqlType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}

/// Shape of a declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Scalar(SqlType),
    /// Table-valued parameter; columns in declaration order
    Table(Vec<ColumnSpec>),
}

impl ParamType {
    pub fn is_table(&self) -> bool {
        matches!(self, Self::Table(_))
    }
}

/// Whether a parameter carries a value in, out, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamDirection {
    #[default]
    Input,
    Output,
    InputOutput,
}

/// A named parameter declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    #[serde(default)]
    pub direction: ParamDirection,
}

impl ParamSpec {
    /// Declare a scalar input parameter.
    pub fn scalar(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            param_type: ParamType::Scalar(sql_type),
            direction: ParamDirection::Input,
        }
    }

    /// Declare a table-valued input parameter.
    pub fn table(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            param_type: ParamType::Table(columns),
            direction: ParamDirection::Input,
        }
    }

    /// Declare a scalar output parameter.
    pub fn output(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            param_type: ParamType::Scalar(sql_type),
            direction: ParamDirection::Output,
        }
    }

    /// Change the direction of this parameter.
    pub fn with_direction(mut self, direction: ParamDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Check if the caller supplies a value for this parameter.
    pub fn is_input(&self) -> bool {
        matches!(
            self.direction,
            ParamDirection::Input | ParamDirection::InputOutput
        )
    }
}
