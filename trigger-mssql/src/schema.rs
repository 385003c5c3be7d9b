use std::fmt;

use serde::{Deserialize, Serialize};

/// SQL Server object identifier.
pub type ObjectId = i32;

/// Quotes a T-SQL identifier with brackets, escaping embedded closing brackets.
pub fn quote_identifier(ident: &str) -> String {
    format!("[{}]", ident.replace(']', "]]"))
}

/// Fully qualified SQL Server table name with schema and table components.
///
/// Represents a complete table identifier that includes both schema and table
/// name, providing methods for proper identifier quoting and formatting.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    /// The schema name containing the table
    pub schema: String,
    /// The name of the table within the schema
    pub name: String,
}

impl TableName {
    /// Creates a new [`TableName`] with the given schema and table name.
    pub fn new(schema: String, name: String) -> TableName {
        Self { schema, name }
    }

    /// Returns the table name as a properly quoted T-SQL identifier.
    ///
    /// Escapes both schema and table names according to bracket quoting rules
    /// to handle special characters and reserved keywords safely.
    pub fn as_quoted_identifier(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{0}.{1}", self.schema, self.name))
    }
}

/// Type-safe wrapper for user-table object ids.
///
/// Provides type safety for table identifiers by wrapping raw [`ObjectId`]
/// values and preventing accidental misuse in function parameters.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(pub ObjectId);

impl TableId {
    /// Creates a new [`TableId`] from the given [`ObjectId`].
    pub fn new(object_id: ObjectId) -> Self {
        Self(object_id)
    }

    /// Returns the wrapped [`ObjectId`] value.
    pub fn into_inner(self) -> ObjectId {
        self.0
    }
}

impl From<ObjectId> for TableId {
    fn from(value: ObjectId) -> Self {
        Self(value)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared type of a SQL Server column, as read from the system catalogs.
///
/// Carries the catalog's raw `max_length`, `precision` and `scale` so the
/// type can be rendered verbatim into DDL for the lease table.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SqlDataType {
    /// Type name as reported by `sys.types` (e.g. `nvarchar`, `decimal`).
    pub name: String,
    /// Raw byte length from `sys.columns`; `-1` means `max`.
    pub max_length: i16,
    /// Numeric precision from `sys.columns`.
    pub precision: u8,
    /// Numeric or temporal scale from `sys.columns`.
    pub scale: u8,
}

impl SqlDataType {
    /// Renders the full type expression for DDL, including length, precision
    /// and scale where the type requires them.
    pub fn render(&self) -> String {
        let name = self.name.to_lowercase();
        match name.as_str() {
            "char" | "varchar" | "binary" | "varbinary" => {
                if self.max_length == -1 {
                    format!("{name}(max)")
                } else {
                    format!("{name}({})", self.max_length)
                }
            }
            // nchar/nvarchar lengths are stored in bytes, two per character.
            "nchar" | "nvarchar" => {
                if self.max_length == -1 {
                    format!("{name}(max)")
                } else {
                    format!("{name}({})", self.max_length / 2)
                }
            }
            "decimal" | "numeric" => format!("{name}({},{})", self.precision, self.scale),
            "datetime2" | "datetimeoffset" | "time" => format!("{name}({})", self.scale),
            _ => name,
        }
    }
}

/// Schema metadata for a single primary-key column of the user table.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrimaryKeyColumn {
    /// The name of the column
    pub name: String,
    /// The declared SQL Server data type of the column
    pub data_type: SqlDataType,
}

/// Complete schema information for a tracked user table.
///
/// Built once by the schema provisioner and reused to generate the per-table
/// SQL templates and to decode fetched rows.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TableSchema {
    /// Fully qualified name of the user table.
    pub table: TableName,
    /// Object id of the user table, used to name the per-table lease ledger.
    pub id: TableId,
    /// Primary-key columns in key ordinal order.
    pub primary_key: Vec<PrimaryKeyColumn>,
    /// All column names of the user table, in ordinal order.
    pub columns: Vec<String>,
}

impl TableSchema {
    /// Returns the names of the primary-key columns, in key order.
    pub fn primary_key_names(&self) -> Vec<&str> {
        self.primary_key
            .iter()
            .map(|column| column.name.as_str())
            .collect()
    }

    /// Returns the names of the columns that are not part of the primary key.
    pub fn non_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|column| column.as_str())
            .filter(|column| {
                !self
                    .primary_key
                    .iter()
                    .any(|pk_column| pk_column.name == *column)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier_escapes_brackets() {
        assert_eq!(quote_identifier("items"), "[items]");
        assert_eq!(quote_identifier("odd]name"), "[odd]]name]");
    }

    #[test]
    fn test_table_name_quoting() {
        let table = TableName::new("dbo".to_string(), "Order Items".to_string());
        assert_eq!(table.as_quoted_identifier(), "[dbo].[Order Items]");
        assert_eq!(table.to_string(), "dbo.Order Items");
    }

    #[test]
    fn test_render_fixed_types() {
        let data_type = SqlDataType {
            name: "bigint".to_string(),
            max_length: 8,
            precision: 19,
            scale: 0,
        };
        assert_eq!(data_type.render(), "bigint");
    }

    #[test]
    fn test_render_variable_length_types() {
        let varchar = SqlDataType {
            name: "varchar".to_string(),
            max_length: 40,
            precision: 0,
            scale: 0,
        };
        assert_eq!(varchar.render(), "varchar(40)");

        let nvarchar = SqlDataType {
            name: "nvarchar".to_string(),
            max_length: 100,
            precision: 0,
            scale: 0,
        };
        assert_eq!(nvarchar.render(), "nvarchar(50)");

        let nvarchar_max = SqlDataType {
            name: "nvarchar".to_string(),
            max_length: -1,
            precision: 0,
            scale: 0,
        };
        assert_eq!(nvarchar_max.render(), "nvarchar(max)");
    }

    #[test]
    fn test_render_numeric_and_temporal_types() {
        let decimal = SqlDataType {
            name: "decimal".to_string(),
            max_length: 9,
            precision: 18,
            scale: 4,
        };
        assert_eq!(decimal.render(), "decimal(18,4)");

        let datetime2 = SqlDataType {
            name: "datetime2".to_string(),
            max_length: 8,
            precision: 27,
            scale: 7,
        };
        assert_eq!(datetime2.render(), "datetime2(7)");
    }

    #[test]
    fn test_non_key_columns() {
        let schema = TableSchema {
            table: TableName::new("dbo".to_string(), "items".to_string()),
            id: TableId::new(42),
            primary_key: vec![PrimaryKeyColumn {
                name: "id".to_string(),
                data_type: SqlDataType {
                    name: "int".to_string(),
                    max_length: 4,
                    precision: 10,
                    scale: 0,
                },
            }],
            columns: vec!["id".to_string(), "name".to_string(), "value".to_string()],
        };

        assert_eq!(schema.primary_key_names(), vec!["id"]);
        assert_eq!(schema.non_key_columns(), vec!["name", "value"]);
    }
}
