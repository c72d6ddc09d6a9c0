//! Value types for xmla-bridge
//!
//! - `Value`: a typed cell or parameter value, serialized as native JSON
//! - `Row`: ordered (column, value) pairs whose columns come from the response
//! - `Parameter` / `Query`: an immutable query template plus named parameters

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::ser::{Error as _, Serialize, Serializer};
use serde_json::value::RawValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Marker prefix the query language puts in front of parameter references.
pub const PARAMETER_MARKER: char = '@';

/// A typed value returned by the engine or bound as a parameter
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Value {
    /// Blank / NULL
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    /// Exact decimal (currency, fixed decimal)
    Decimal(Decimal),
    String(String),
    Date(NaiveDate),
    /// Timestamp without timezone
    DateTime(NaiveDateTime),
    /// Timestamp with timezone
    DateTimeTz(DateTime<Utc>),
    Uuid(Uuid),
    /// Pre-structured JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Name of the value's type, used in mapping diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::Decimal(_) => "decimal",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
            Self::DateTimeTz(_) => "datetimetz",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Decimal(d) if d.fract().is_zero() => d.to_string().parse().ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to an exact decimal
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(d) => Some(*d),
            Self::Int32(n) => Some(Decimal::from(*n)),
            Self::Int64(n) => Some(Decimal::from(*n)),
            Self::Float64(n) => Decimal::try_from(*n).ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to convert to a calendar date
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::DateTime(dt) => Some(dt.date()),
            Self::DateTimeTz(dt) => Some(dt.date_naive()),
            Self::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int32(n) => serializer.serialize_i32(*n),
            Self::Int64(n) => serializer.serialize_i64(*n),
            Self::Float64(n) => serializer.serialize_f64(*n),
            // Emitted as a raw number so no precision is lost through f64
            Self::Decimal(d) => RawValue::from_string(d.to_string())
                .map_err(S::Error::custom)?
                .serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::Date(d) => serializer.collect_str(&d.format("%Y-%m-%d")),
            Self::DateTime(dt) => serializer.collect_str(&dt.format("%Y-%m-%dT%H:%M:%S%.f")),
            Self::DateTimeTz(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            Self::Uuid(u) => serializer.collect_str(u),
            Self::Json(j) => j.serialize(serializer),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// A result row as ordered column values.
///
/// Column names are shared by every row of one cursor; their order is the
/// order the engine returned them in.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row.
    ///
    /// Fails when the value count differs from the column count.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Result<Self> {
        if columns.len() != values.len() {
            return Err(Error::internal(format!(
                "row has {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, values })
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by exact column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Iterate (column, value) pairs in column order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// Serializes as a JSON object keyed by column name, in column order
impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// A named query parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    value: Value,
}

impl Parameter {
    /// Create a parameter.
    ///
    /// Names are given without the `@` marker; the query text references
    /// them as `@Name`. A name that already starts with the marker is
    /// rejected rather than normalized.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::parameter_naming(name, "name must not be empty"));
        }
        if name.starts_with(PARAMETER_MARKER) {
            return Err(Error::parameter_naming(
                name,
                format!("name must not start with '{}'", PARAMETER_MARKER),
            ));
        }
        Ok(Self {
            name,
            value: value.into(),
        })
    }

    /// Parameter name (without marker)
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound value
    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// An immutable query template with its ordered parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    text: Arc<str>,
    parameters: Vec<Parameter>,
}

impl Query {
    /// Create a query without parameters
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    /// Bind a parameter, replacing an earlier one with the same name
    pub fn bind(mut self, parameter: Parameter) -> Self {
        match self
            .parameters
            .iter_mut()
            .find(|p| p.name == parameter.name)
        {
            Some(existing) => *existing = parameter,
            None => self.parameters.push(parameter),
        }
        self
    }

    /// Bind a list of parameters in order
    pub fn with_parameters(self, parameters: impl IntoIterator<Item = Parameter>) -> Self {
        parameters.into_iter().fold(self, Self::bind)
    }

    /// Query text
    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Bound parameters in binding order
    #[inline]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }
}
