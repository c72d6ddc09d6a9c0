//! Declared column-to-field mapping
//!
//! Result columns are bound to struct fields through an explicit table built
//! once. Engine column names are often qualified (`DimDate[FullDateAlternateKey]`,
//! `[SumSalesAmount]`), so names are matched exactly as the engine reports
//! them.
//!
//! ```rust,ignore
//! #[derive(Default)]
//! struct SalesByDay {
//!     date: NaiveDate,
//!     sales_amount: Decimal,
//! }
//!
//! static SALES_BY_DAY: LazyLock<ColumnMap<SalesByDay>> = LazyLock::new(|| {
//!     ColumnMap::new([
//!         ("DimDate[FullDateAlternateKey]", set!(SalesByDay, date)),
//!         ("[SumSalesAmount]", set!(SalesByDay, sales_amount)),
//!     ])
//!     .expect("valid column map")
//! });
//! ```

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Assigns one column value to a destination field
pub type Setter<T> = fn(&mut T, &Value) -> Result<()>;

/// Static mapping from result column names to destination fields
pub struct ColumnMap<T> {
    setters: Vec<(String, Setter<T>)>,
    index: HashMap<String, usize>,
}

impl<T> ColumnMap<T> {
    /// Build a mapping, rejecting empty or duplicate column names
    pub fn new<S: Into<String>>(entries: impl IntoIterator<Item = (S, Setter<T>)>) -> Result<Self> {
        let mut setters = Vec::new();
        let mut index = HashMap::new();

        for (column, setter) in entries {
            let column = column.into();
            if column.is_empty() {
                return Err(Error::mapping("column name must not be empty"));
            }
            if index.insert(column.clone(), setters.len()).is_some() {
                return Err(Error::mapping(format!(
                    "column '{}' is mapped more than once",
                    column
                )));
            }
            setters.push((column, setter));
        }

        if setters.is_empty() {
            return Err(Error::mapping("column map must declare at least one column"));
        }

        Ok(Self { setters, index })
    }

    /// Declared column names in declaration order
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.setters.iter().map(|(c, _)| c.as_str())
    }

    /// Whether `column` has a mapping
    pub fn contains(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    /// Fail if any of `columns` has no mapping
    pub fn check_columns(&self, columns: &[String]) -> Result<()> {
        match columns.iter().find(|c| !self.contains(c)) {
            Some(column) => Err(Error::mapping(format!(
                "no mapping declared for column '{}'",
                column
            ))),
            None => Ok(()),
        }
    }

    /// Map one row into a new destination value
    pub fn map_row(&self, row: &Row) -> Result<T>
    where
        T: Default,
    {
        let mut target = T::default();
        for (column, value) in row.iter() {
            let idx = self.index.get(column).ok_or_else(|| {
                Error::mapping(format!("no mapping declared for column '{}'", column))
            })?;
            (self.setters[*idx].1)(&mut target, value).map_err(|e| {
                Error::mapping(format!("column '{}': {}", column, e))
            })?;
        }
        Ok(target)
    }
}

impl<T> fmt::Debug for ColumnMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnMap")
            .field("columns", &self.columns().collect::<Vec<_>>())
            .finish()
    }
}

/// A destination type with a declared column mapping
pub trait MappedRow: Default + Sized + 'static {
    /// The mapping for this type
    fn column_map() -> &'static ColumnMap<Self>;
}

/// Conversion from a result value into a field type
pub trait FromValue: Sized {
    /// Convert, failing with a mapping error on a type mismatch
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(expected: &str, value: &Value) -> Error {
    Error::mapping(format!("expected {}, got {}", expected, value.type_name()))
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| mismatch("int32", value))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch("int64", value))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch("float64", value))
    }
}

impl FromValue for Decimal {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_decimal().ok_or_else(|| mismatch("decimal", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch("string", value))
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_date().ok_or_else(|| mismatch("date", value))
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            Value::DateTimeTz(dt) => Ok(dt.naive_utc()),
            Value::Date(d) => d
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| mismatch("datetime", value)),
            other => Err(mismatch("datetime", other)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Build a [`Setter`] that converts the value with [`FromValue`] and assigns
/// it to a field
#[macro_export]
macro_rules! set {
    ($target:ty, $field:ident) => {{
        let setter: $crate::mapping::Setter<$target> =
            |target: &mut $target, value: &$crate::types::Value| {
                target.$field = $crate::mapping::FromValue::from_value(value)?;
                Ok(())
            };
        setter
    }};
}
