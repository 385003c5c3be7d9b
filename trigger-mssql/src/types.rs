use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use thiserror::Error;
use tiberius::numeric::Numeric;
use tiberius::{ColumnData, FromSql, ToSql};
use uuid::Uuid;

/// Kind of change reported by the database for a tracked row.
///
/// Parsed from the `SYS_CHANGE_OPERATION` metadata column (`I`, `U`, `D`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Parses the single-letter operation code reported by the change table.
    pub fn from_code(code: &str) -> Option<ChangeOperation> {
        match code {
            "I" => Some(ChangeOperation::Insert),
            "U" => Some(ChangeOperation::Update),
            "D" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }

    /// Returns the operation code used by the change table.
    pub fn as_code(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "I",
            ChangeOperation::Update => "U",
            ChangeOperation::Delete => "D",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeOperation::Insert => "Inserted",
            ChangeOperation::Update => "Updated",
            ChangeOperation::Delete => "Deleted",
        };
        write!(f, "{name}")
    }
}

/// Errors raised while converting driver values into [`Cell`]s.
#[derive(Debug, Error)]
pub enum CellError {
    /// The driver reported a data type the runtime does not carry.
    #[error("unsupported column data for cell conversion: {0}")]
    UnsupportedType(&'static str),

    /// A temporal value could not be converted to a calendar type.
    #[error("temporal value conversion failed: {0}")]
    Temporal(String),
}

/// A single dynamically-typed SQL Server value.
///
/// [`Cell`] is the bridge between driver rows and handler payloads: fetched
/// change rows are decoded into cells, and primary-key cells are bound back
/// as parameters for lease renewal and release.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Numeric(Numeric),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<Utc>),
}

impl Cell {
    /// Converts an owned driver value into a [`Cell`].
    pub fn try_from_column_data(data: ColumnData<'static>) -> Result<Cell, CellError> {
        let cell = match data {
            ColumnData::Bit(value) => value.map_or(Cell::Null, Cell::Bool),
            ColumnData::U8(value) => value.map_or(Cell::Null, Cell::U8),
            ColumnData::I16(value) => value.map_or(Cell::Null, Cell::I16),
            ColumnData::I32(value) => value.map_or(Cell::Null, Cell::I32),
            ColumnData::I64(value) => value.map_or(Cell::Null, Cell::I64),
            ColumnData::F32(value) => value.map_or(Cell::Null, Cell::F32),
            ColumnData::F64(value) => value.map_or(Cell::Null, Cell::F64),
            ColumnData::String(value) => {
                value.map_or(Cell::Null, |text| Cell::String(text.into_owned()))
            }
            ColumnData::Binary(value) => {
                value.map_or(Cell::Null, |bytes| Cell::Bytes(bytes.into_owned()))
            }
            ColumnData::Guid(value) => value.map_or(Cell::Null, Cell::Uuid),
            ColumnData::Numeric(value) => value.map_or(Cell::Null, Cell::Numeric),
            data @ (ColumnData::DateTime(_)
            | ColumnData::SmallDateTime(_)
            | ColumnData::DateTime2(_)) => from_temporal::<NaiveDateTime>(&data)?
                .map_or(Cell::Null, Cell::DateTime),
            data @ ColumnData::Date(_) => {
                from_temporal::<NaiveDate>(&data)?.map_or(Cell::Null, Cell::Date)
            }
            data @ ColumnData::Time(_) => {
                from_temporal::<NaiveTime>(&data)?.map_or(Cell::Null, Cell::Time)
            }
            data @ ColumnData::DateTimeOffset(_) => from_temporal::<DateTime<Utc>>(&data)?
                .map_or(Cell::Null, Cell::DateTimeOffset),
            ColumnData::Xml(_) => return Err(CellError::UnsupportedType("xml")),
        };

        Ok(cell)
    }

    /// Returns `true` when the cell carries no value.
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Returns the value as a signed 64-bit integer when the cell carries one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::U8(value) => Some(i64::from(*value)),
            Cell::I16(value) => Some(i64::from(*value)),
            Cell::I32(value) => Some(i64::from(*value)),
            Cell::I64(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the value as a string slice when the cell carries text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::String(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// Decodes a temporal driver value through the driver's calendar conversions.
fn from_temporal<'a, T: FromSql<'a>>(
    data: &'a ColumnData<'static>,
) -> Result<Option<T>, CellError> {
    T::from_sql(data).map_err(|err| CellError::Temporal(err.to_string()))
}

impl ToSql for Cell {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Cell::Null => ColumnData::I32(None),
            Cell::Bool(value) => ColumnData::Bit(Some(*value)),
            Cell::U8(value) => ColumnData::U8(Some(*value)),
            Cell::I16(value) => ColumnData::I16(Some(*value)),
            Cell::I32(value) => ColumnData::I32(Some(*value)),
            Cell::I64(value) => ColumnData::I64(Some(*value)),
            Cell::F32(value) => ColumnData::F32(Some(*value)),
            Cell::F64(value) => ColumnData::F64(Some(*value)),
            Cell::String(value) => ColumnData::String(Some(Cow::Borrowed(value.as_str()))),
            Cell::Bytes(value) => ColumnData::Binary(Some(Cow::Borrowed(value.as_slice()))),
            Cell::Uuid(value) => ColumnData::Guid(Some(*value)),
            Cell::Numeric(value) => ColumnData::Numeric(Some(*value)),
            Cell::Date(value) => value.to_sql(),
            Cell::Time(value) => value.to_sql(),
            Cell::DateTime(value) => value.to_sql(),
            Cell::DateTimeOffset(value) => value.to_sql(),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => write!(f, "NULL"),
            Cell::Bool(value) => write!(f, "{value}"),
            Cell::U8(value) => write!(f, "{value}"),
            Cell::I16(value) => write!(f, "{value}"),
            Cell::I32(value) => write!(f, "{value}"),
            Cell::I64(value) => write!(f, "{value}"),
            Cell::F32(value) => write!(f, "{value}"),
            Cell::F64(value) => write!(f, "{value}"),
            Cell::String(value) => write!(f, "{value}"),
            Cell::Bytes(value) => write!(f, "0x{}", hex(value)),
            Cell::Uuid(value) => write!(f, "{value}"),
            Cell::Numeric(value) => write!(f, "{value}"),
            Cell::Date(value) => write!(f, "{value}"),
            Cell::Time(value) => write!(f, "{value}"),
            Cell::DateTime(value) => write!(f, "{value}"),
            Cell::DateTimeOffset(value) => write!(f, "{value}"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_operation_codes() {
        assert_eq!(
            ChangeOperation::from_code("I"),
            Some(ChangeOperation::Insert)
        );
        assert_eq!(
            ChangeOperation::from_code("U"),
            Some(ChangeOperation::Update)
        );
        assert_eq!(
            ChangeOperation::from_code("D"),
            Some(ChangeOperation::Delete)
        );
        assert_eq!(ChangeOperation::from_code("X"), None);
        assert_eq!(ChangeOperation::Delete.as_code(), "D");
    }

    #[test]
    fn test_cell_from_scalar_column_data() {
        let cell = Cell::try_from_column_data(ColumnData::I64(Some(42))).unwrap();
        assert_eq!(cell, Cell::I64(42));
        assert_eq!(cell.as_i64(), Some(42));

        let cell = Cell::try_from_column_data(ColumnData::String(Some("abc".into()))).unwrap();
        assert_eq!(cell.as_str(), Some("abc"));

        let cell = Cell::try_from_column_data(ColumnData::I32(None)).unwrap();
        assert!(cell.is_null());
    }

    #[test]
    fn test_integer_widening() {
        assert_eq!(Cell::U8(7).as_i64(), Some(7));
        assert_eq!(Cell::I16(-3).as_i64(), Some(-3));
        assert_eq!(Cell::I32(1000).as_i64(), Some(1000));
        assert_eq!(Cell::String("x".to_string()).as_i64(), None);
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(Cell::Null.to_string(), "NULL");
        assert_eq!(Cell::I32(5).to_string(), "5");
        assert_eq!(Cell::Bytes(vec![0xde, 0xad]).to_string(), "0xdead");
    }
}
