//! Per-table T-SQL statement builders.
//!
//! Templates are generated once after the primary-key schema is known and
//! parameterized per call. Only primary-key values and change metadata are
//! ever bound as parameters; identifiers and configuration scalars are baked
//! into the templates at build time.

use std::fmt::Write;

use crate::schema::{TableId, TableSchema, quote_identifier};

/// Name of the dedicated schema holding the coordination tables.
pub const SCHEMA_NAME: &str = "trigger";

/// Maximum value of the wrapping `RowsProcessed` counter.
const ROWS_PROCESSED_MAX: i64 = i64::MAX;

/// Configuration scalars baked into the per-table templates.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    /// Maximum number of rows fetched and leased per poll.
    pub batch_size: u32,
    /// Lease validity in `lease_datepart` units.
    pub lease_interval: u64,
    /// `DATEADD` datepart keyword for lease arithmetic.
    pub lease_datepart: &'static str,
    /// Acquisitions after which a change is poison-quarantined.
    pub max_dequeue_count: u32,
    /// Liveness rows older than this many `cleanup_datepart` units are stale.
    pub cleanup_interval: u64,
    /// `DATEADD` datepart keyword for cleanup arithmetic.
    pub cleanup_datepart: &'static str,
}

/// Returns the quoted name of the shared global-state table.
pub fn global_state_table() -> String {
    format!(
        "{}.{}",
        quote_identifier(SCHEMA_NAME),
        quote_identifier("GlobalState")
    )
}

/// Returns the quoted name of the shared worker-liveness table.
pub fn worker_batch_sizes_table() -> String {
    format!(
        "{}.{}",
        quote_identifier(SCHEMA_NAME),
        quote_identifier("WorkerBatchSizes")
    )
}

/// Returns the quoted name of the per-table lease ledger.
pub fn lease_table(table_id: TableId) -> String {
    format!(
        "{}.{}",
        quote_identifier(SCHEMA_NAME),
        quote_identifier(&format!("Worker_Table_{table_id}"))
    )
}

/// Statement resolving the user table's object id. Parameter: `@P1` = the
/// normalized user-table name.
pub fn object_id_query() -> &'static str {
    "SELECT OBJECT_ID(@P1);"
}

/// Statement resolving the catalog schema and table name for an object id.
/// Parameter: `@P1` = the user table's object id.
pub fn table_name_query() -> &'static str {
    "SELECT [s].[name], [t].[name] \
     FROM sys.tables AS [t] \
     INNER JOIN sys.schemas AS [s] ON [t].[schema_id] = [s].[schema_id] \
     WHERE [t].[object_id] = @P1;"
}

/// Statement reading the primary-key columns with their declared types, in
/// key ordinal order. Parameter: `@P1` = the user table's object id.
pub fn primary_key_query() -> &'static str {
    "SELECT [c].[name], [ty].[name], [c].[max_length], [c].[precision], [c].[scale] \
     FROM sys.index_columns AS [ic] \
     INNER JOIN sys.indexes AS [i] \
         ON [ic].[object_id] = [i].[object_id] AND [ic].[index_id] = [i].[index_id] \
     INNER JOIN sys.columns AS [c] \
         ON [ic].[object_id] = [c].[object_id] AND [ic].[column_id] = [c].[column_id] \
     INNER JOIN sys.types AS [ty] ON [c].[user_type_id] = [ty].[user_type_id] \
     WHERE [i].[is_primary_key] = 1 AND [ic].[object_id] = @P1 \
     ORDER BY [ic].[key_ordinal];"
}

/// Statement listing all user-table column names in ordinal order.
/// Parameter: `@P1` = the user table's object id.
pub fn columns_query() -> &'static str {
    "SELECT [name] FROM sys.columns WHERE [object_id] = @P1 ORDER BY [column_id];"
}

/// Statement reading the minimum valid change-tracking version for a table.
/// Returns NULL when change tracking is not enabled. Parameter: `@P1` = the
/// user table's object id.
pub fn min_valid_version_query() -> &'static str {
    "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(@P1);"
}

/// Statement creating the dedicated schema if absent.
pub fn create_schema_sql() -> String {
    format!(
        "IF SCHEMA_ID(N'{SCHEMA_NAME}') IS NULL EXEC (N'CREATE SCHEMA {}');",
        quote_identifier(SCHEMA_NAME)
    )
}

/// Statement creating the global-state table if absent.
pub fn create_global_state_sql() -> String {
    let table = global_state_table();
    format!(
        "IF OBJECT_ID(N'{table}', N'U') IS NULL \
         CREATE TABLE {table} (\
         [UserTableID] int NOT NULL PRIMARY KEY, \
         [GlobalVersionNumber] bigint NOT NULL, \
         [DatabaseID] int NOT NULL, \
         [RowsProcessed] bigint NOT NULL DEFAULT 0);"
    )
}

/// Statement creating the worker-liveness table if absent.
pub fn create_worker_batch_sizes_sql() -> String {
    let table = worker_batch_sizes_table();
    format!(
        "IF OBJECT_ID(N'{table}', N'U') IS NULL \
         CREATE TABLE {table} (\
         [UserTableID] int NOT NULL, \
         [WorkerID] nvarchar(200) NOT NULL, \
         [BatchSize] bigint NOT NULL, \
         [Timestamp] datetime2 NOT NULL, \
         PRIMARY KEY ([UserTableID], [WorkerID]));"
    )
}

/// Pre-rendered, parameterizable statements for one tracked user table.
///
/// Built once per table after provisioning; every method below either returns
/// a fixed template or expands one for a given number of bound key tuples.
#[derive(Debug, Clone)]
pub struct TableQueries {
    user_table: String,
    lease_table: String,
    user_table_id: i32,
    primary_key: Vec<String>,
    non_key_columns: Vec<String>,
    settings: QuerySettings,
}

impl TableQueries {
    /// Builds the statement set for `schema` with the given settings.
    pub fn new(schema: &TableSchema, settings: QuerySettings) -> TableQueries {
        TableQueries {
            user_table: schema.table.as_quoted_identifier(),
            lease_table: lease_table(schema.id),
            user_table_id: schema.id.into_inner(),
            primary_key: schema
                .primary_key_names()
                .into_iter()
                .map(quote_identifier)
                .collect(),
            non_key_columns: schema
                .non_key_columns()
                .into_iter()
                .map(quote_identifier)
                .collect(),
            settings,
        }
    }

    /// Number of primary-key columns.
    pub fn primary_key_len(&self) -> usize {
        self.primary_key.len()
    }

    /// Statement creating the per-table lease ledger if absent. The key
    /// columns repeat the user table's primary-key types verbatim.
    pub fn create_lease_table_sql(&self, schema: &TableSchema) -> String {
        let mut key_columns = String::new();
        for column in &schema.primary_key {
            let _ = write!(
                key_columns,
                "{} {} NOT NULL, ",
                quote_identifier(&column.name),
                column.data_type.render()
            );
        }

        format!(
            "IF OBJECT_ID(N'{lease}', N'U') IS NULL \
             CREATE TABLE {lease} (\
             {key_columns}\
             [LeaseExpirationTime] datetime2 NULL, \
             [DequeueCount] int NULL, \
             [VersionNumber] bigint NULL, \
             PRIMARY KEY ({key}));",
            lease = self.lease_table,
            key = self.primary_key.join(", "),
        )
    }

    /// Statement seeding the global-state row for this table if absent.
    /// Parameters: `@P1` = minimum valid change-tracking version.
    pub fn seed_global_state_sql(&self) -> String {
        format!(
            "IF NOT EXISTS (SELECT 1 FROM {global} WHERE [UserTableID] = {id}) \
             INSERT INTO {global} ([UserTableID], [GlobalVersionNumber], [DatabaseID], [RowsProcessed]) \
             VALUES ({id}, @P1, DB_ID(), 0);",
            global = global_state_table(),
            id = self.user_table_id,
        )
    }

    /// Preamble run before each fetch: resets state after a database
    /// recreation and keeps the global version above the cleanup floor. Each
    /// statement is individually atomic; concurrent workers race benignly.
    pub fn synchronize_version_sql(&self) -> String {
        format!(
            "DECLARE @min_valid_version bigint = CHANGE_TRACKING_MIN_VALID_VERSION({id}); \
             DECLARE @db_id int = DB_ID(); \
             IF EXISTS (SELECT 1 FROM {global} WHERE [UserTableID] = {id} AND [DatabaseID] <> @db_id) \
             BEGIN \
             TRUNCATE TABLE {lease}; \
             UPDATE {global} SET [GlobalVersionNumber] = @min_valid_version, [DatabaseID] = @db_id \
             WHERE [UserTableID] = {id}; \
             END; \
             UPDATE {global} SET [GlobalVersionNumber] = @min_valid_version \
             WHERE [UserTableID] = {id} AND [GlobalVersionNumber] < @min_valid_version;",
            global = global_state_table(),
            lease = self.lease_table,
            id = self.user_table_id,
        )
    }

    /// Single-transaction fetch-and-acquire. Reads at most `batch_size`
    /// unclaimed (or lease-expired, non-poisoned) changes ordered by version
    /// and stamps a lease on every returned row. The last result set of the
    /// batch carries the fetched rows.
    pub fn fetch_batch_sql(&self) -> String {
        let select_columns = self.fetch_select_columns();
        let lease_join = self.join_condition("c", "l");
        let user_join = self.join_condition("c", "u");
        let merge_match = self.join_condition("l", "b");
        let insert_columns = self.primary_key.join(", ");
        let insert_values = self
            .primary_key
            .iter()
            .map(|column| format!("[b].{column}"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ; \
             BEGIN TRANSACTION; \
             DECLARE @last_version bigint = \
             (SELECT [GlobalVersionNumber] FROM {global} WHERE [UserTableID] = {id}); \
             SELECT TOP ({batch_size}) {select_columns} \
             INTO #current_batch \
             FROM CHANGETABLE(CHANGES {user}, @last_version) AS [c] \
             LEFT OUTER JOIN {lease} AS [l] ON {lease_join} \
             LEFT OUTER JOIN {user} AS [u] ON {user_join} \
             WHERE ([l].[LeaseExpirationTime] IS NULL OR [l].[LeaseExpirationTime] < SYSUTCDATETIME()) \
             AND ([l].[VersionNumber] IS NULL OR [l].[VersionNumber] < [c].[SYS_CHANGE_VERSION]) \
             AND ([l].[DequeueCount] IS NULL OR [l].[DequeueCount] < {max_dequeue}) \
             ORDER BY [c].[SYS_CHANGE_VERSION] ASC; \
             MERGE {lease} WITH (HOLDLOCK) AS [l] \
             USING #current_batch AS [b] ON {merge_match} \
             WHEN MATCHED THEN UPDATE SET \
             [LeaseExpirationTime] = {lease_expiration}, \
             [DequeueCount] = ISNULL([l].[DequeueCount], 0) + 1, \
             [VersionNumber] = [b].[SYS_CHANGE_VERSION] \
             WHEN NOT MATCHED THEN INSERT ({insert_columns}, [LeaseExpirationTime], [DequeueCount], [VersionNumber]) \
             VALUES ({insert_values}, {lease_expiration}, 1, [b].[SYS_CHANGE_VERSION]); \
             SELECT * FROM #current_batch ORDER BY [SYS_CHANGE_VERSION] ASC; \
             DROP TABLE #current_batch; \
             COMMIT TRANSACTION; \
             SET TRANSACTION ISOLATION LEVEL READ COMMITTED;",
            global = global_state_table(),
            id = self.user_table_id,
            batch_size = self.settings.batch_size,
            user = self.user_table,
            lease = self.lease_table,
            max_dequeue = self.settings.max_dequeue_count,
            lease_expiration = self.lease_expiration_expr(),
        )
    }

    /// Statement re-stamping `LeaseExpirationTime` on `key_count` in-flight
    /// keys. Parameters: the key tuples, flattened in order.
    pub fn renew_leases_sql(&self, key_count: usize) -> String {
        format!(
            "UPDATE {lease} SET [LeaseExpirationTime] = {lease_expiration} \
             WHERE {keys};",
            lease = self.lease_table,
            lease_expiration = self.lease_expiration_expr(),
            keys = self.key_tuple_predicate(key_count, 1),
        )
    }

    /// Statement releasing one processed row: clears the lease, zeroes the
    /// dequeue count and records the processed version, guarded so a slower
    /// writer never regresses newer state. Parameters: `@P1` = the row's
    /// change version, then the key tuple.
    pub fn release_row_sql(&self) -> String {
        format!(
            "UPDATE {lease} \
             SET [LeaseExpirationTime] = NULL, [DequeueCount] = 0, [VersionNumber] = @P1 \
             WHERE {key} AND ([VersionNumber] IS NULL OR [VersionNumber] <= @P1);",
            lease = self.lease_table,
            key = self.single_key_predicate(2),
        )
    }

    /// Statement upserting this worker's last-batch report. Parameters:
    /// `@P1` = worker id, `@P2` = batch size.
    pub fn update_worker_batch_size_sql(&self) -> String {
        format!(
            "MERGE {workers} WITH (HOLDLOCK) AS [w] \
             USING (VALUES ({id}, @P1, @P2)) AS [s] ([UserTableID], [WorkerID], [BatchSize]) \
             ON [w].[UserTableID] = [s].[UserTableID] AND [w].[WorkerID] = [s].[WorkerID] \
             WHEN MATCHED THEN UPDATE SET [BatchSize] = [s].[BatchSize], [Timestamp] = SYSUTCDATETIME() \
             WHEN NOT MATCHED THEN INSERT ([UserTableID], [WorkerID], [BatchSize], [Timestamp]) \
             VALUES ([s].[UserTableID], [s].[WorkerID], [s].[BatchSize], SYSUTCDATETIME());",
            workers = worker_batch_sizes_table(),
            id = self.user_table_id,
        )
    }

    /// Conditional advance of the global version number to a candidate
    /// version, retiring covered lease rows, followed by the wrapping
    /// `RowsProcessed` increment. Parameters: `@P1` = candidate version,
    /// `@P2` = rows processed in the batch.
    pub fn advance_version_sql(&self) -> String {
        format!(
            "BEGIN TRANSACTION; \
             {advance} \
             UPDATE {global} SET [RowsProcessed] = CASE \
             WHEN [RowsProcessed] > {max} - @P2 THEN @P2 - ({max} - [RowsProcessed]) \
             ELSE [RowsProcessed] + @P2 END \
             WHERE [UserTableID] = {id}; \
             COMMIT TRANSACTION;",
            advance = self.conditional_advance_stmt("@P1"),
            global = global_state_table(),
            max = ROWS_PROCESSED_MAX,
            id = self.user_table_id,
        )
    }

    /// Advance attempted on an empty poll: the candidate is the highest
    /// released or poison-quarantined version in the ledger, which retires
    /// the tail left behind by the second-highest-version rule. No
    /// parameters.
    pub fn advance_tail_sql(&self) -> String {
        format!(
            "BEGIN TRANSACTION; \
             DECLARE @candidate bigint = \
             (SELECT MAX([VersionNumber]) FROM {lease} \
             WHERE [LeaseExpirationTime] IS NULL OR [DequeueCount] >= {max_dequeue}); \
             IF @candidate IS NOT NULL \
             BEGIN \
             {advance} \
             END; \
             COMMIT TRANSACTION;",
            lease = self.lease_table,
            max_dequeue = self.settings.max_dequeue_count,
            advance = self.conditional_advance_stmt("@candidate"),
        )
    }

    /// Count of every row currently reported by the change table. No
    /// parameters.
    pub fn change_count_all_sql(&self) -> String {
        format!(
            "SELECT COUNT_BIG(*) \
             FROM CHANGETABLE(CHANGES {user}, CHANGE_TRACKING_MIN_VALID_VERSION({id})) AS [c];",
            user = self.user_table,
            id = self.user_table_id,
        )
    }

    /// Count of changes that are not yet processed (no released covering
    /// lease, not poison-quarantined). No parameters.
    pub fn change_count_unprocessed_sql(&self) -> String {
        format!(
            "DECLARE @last_version bigint = \
             (SELECT [GlobalVersionNumber] FROM {global} WHERE [UserTableID] = {id}); \
             SELECT COUNT_BIG(*) \
             FROM CHANGETABLE(CHANGES {user}, @last_version) AS [c] \
             LEFT OUTER JOIN {lease} AS [l] ON {join} \
             WHERE NOT ({processed});",
            global = global_state_table(),
            id = self.user_table_id,
            user = self.user_table,
            lease = self.lease_table,
            join = self.join_condition("c", "l"),
            processed = self.processed_predicate(),
        )
    }

    /// Reads the wrapping rows-processed counter. No parameters.
    pub fn rows_processed_sql(&self) -> String {
        format!(
            "SELECT [RowsProcessed] FROM {global} WHERE [UserTableID] = {id};",
            global = global_state_table(),
            id = self.user_table_id,
        )
    }

    /// Count of workers whose liveness row was refreshed within a window.
    /// Parameter: `@P1` = window length in seconds.
    pub fn active_workers_sql(&self) -> String {
        format!(
            "SELECT COUNT_BIG(*) FROM {workers} \
             WHERE [UserTableID] = {id} \
             AND [Timestamp] > DATEADD(second, -@P1, SYSUTCDATETIME());",
            workers = worker_batch_sizes_table(),
            id = self.user_table_id,
        )
    }

    /// Deletes liveness rows that have not been refreshed within the cleanup
    /// interval. No parameters.
    pub fn cleanup_workers_sql(&self) -> String {
        format!(
            "DELETE FROM {workers} \
             WHERE [UserTableID] = {id} \
             AND [Timestamp] < DATEADD({datepart}, -{interval}, SYSUTCDATETIME());",
            workers = worker_batch_sizes_table(),
            id = self.user_table_id,
            datepart = self.settings.cleanup_datepart,
            interval = self.settings.cleanup_interval,
        )
    }

    /// Refreshes this worker's own liveness row, inserting it with a zero
    /// batch size when absent. Parameter: `@P1` = worker id.
    pub fn refresh_worker_sql(&self) -> String {
        format!(
            "MERGE {workers} WITH (HOLDLOCK) AS [w] \
             USING (VALUES ({id}, @P1)) AS [s] ([UserTableID], [WorkerID]) \
             ON [w].[UserTableID] = [s].[UserTableID] AND [w].[WorkerID] = [s].[WorkerID] \
             WHEN MATCHED THEN UPDATE SET [Timestamp] = SYSUTCDATETIME() \
             WHEN NOT MATCHED THEN INSERT ([UserTableID], [WorkerID], [BatchSize], [Timestamp]) \
             VALUES ([s].[UserTableID], [s].[WorkerID], 0, SYSUTCDATETIME());",
            workers = worker_batch_sizes_table(),
            id = self.user_table_id,
        )
    }

    /// Deletes this worker's liveness row on clean shutdown. Parameter:
    /// `@P1` = worker id.
    pub fn retire_worker_sql(&self) -> String {
        format!(
            "DELETE FROM {workers} WHERE [UserTableID] = {id} AND [WorkerID] = @P1;",
            workers = worker_batch_sizes_table(),
            id = self.user_table_id,
        )
    }

    /// The `DATEADD` expression stamping a fresh lease expiration.
    fn lease_expiration_expr(&self) -> String {
        format!(
            "DATEADD({}, {}, SYSUTCDATETIME())",
            self.settings.lease_datepart, self.settings.lease_interval
        )
    }

    /// Columns selected into the working batch: change metadata, key columns
    /// from the change table, and current values from the user table (NULL
    /// for deletions, which cannot be joined).
    fn fetch_select_columns(&self) -> String {
        let mut columns = vec![
            "[c].[SYS_CHANGE_VERSION]".to_string(),
            "[c].[SYS_CHANGE_OPERATION]".to_string(),
        ];
        columns.extend(
            self.primary_key
                .iter()
                .map(|column| format!("[c].{column}")),
        );
        columns.extend(
            self.non_key_columns
                .iter()
                .map(|column| format!("[u].{column}")),
        );
        columns.join(", ")
    }

    /// Equality join over the primary-key columns of two aliases.
    fn join_condition(&self, left: &str, right: &str) -> String {
        self.primary_key
            .iter()
            .map(|column| format!("[{left}].{column} = [{right}].{column}"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// A change is processed when a released lease covers its version or the
    /// row is poison-quarantined.
    fn processed_predicate(&self) -> String {
        format!(
            "([l].[VersionNumber] IS NOT NULL \
             AND [l].[VersionNumber] >= [c].[SYS_CHANGE_VERSION] \
             AND [l].[LeaseExpirationTime] IS NULL) \
             OR ([l].[DequeueCount] IS NOT NULL AND [l].[DequeueCount] >= {})",
            self.settings.max_dequeue_count
        )
    }

    /// The guarded advance-and-retire block shared by the post-batch and
    /// empty-poll paths. Advances only when no unprocessed change at or below
    /// the candidate version remains.
    fn conditional_advance_stmt(&self, candidate: &str) -> String {
        format!(
            "DECLARE @last_version bigint = \
             (SELECT [GlobalVersionNumber] FROM {global} WHERE [UserTableID] = {id}); \
             IF NOT EXISTS (\
             SELECT 1 FROM CHANGETABLE(CHANGES {user}, @last_version) AS [c] \
             LEFT OUTER JOIN {lease} AS [l] ON {join} \
             WHERE [c].[SYS_CHANGE_VERSION] <= {candidate} AND NOT ({processed})) \
             BEGIN \
             UPDATE {global} SET [GlobalVersionNumber] = {candidate} \
             WHERE [UserTableID] = {id} AND [GlobalVersionNumber] < {candidate}; \
             DELETE FROM {lease} WHERE [VersionNumber] <= {candidate}; \
             END;",
            global = global_state_table(),
            id = self.user_table_id,
            user = self.user_table,
            lease = self.lease_table,
            join = self.join_condition("c", "l"),
            processed = self.processed_predicate(),
        )
    }

    /// Predicate matching one key tuple with parameters starting at
    /// `first_param`.
    fn single_key_predicate(&self, first_param: usize) -> String {
        self.primary_key
            .iter()
            .enumerate()
            .map(|(offset, column)| format!("{column} = @P{}", first_param + offset))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Disjunction of `key_count` key-tuple predicates with parameters
    /// starting at `first_param`, flattened tuple by tuple.
    fn key_tuple_predicate(&self, key_count: usize, first_param: usize) -> String {
        let width = self.primary_key.len();
        (0..key_count)
            .map(|tuple| {
                format!(
                    "({})",
                    self.single_key_predicate(first_param + tuple * width)
                )
            })
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PrimaryKeyColumn, SqlDataType, TableName, TableSchema};

    fn sample_schema() -> TableSchema {
        TableSchema {
            table: TableName::new("dbo".to_string(), "items".to_string()),
            id: TableId::new(123),
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
        }
    }

    fn sample_settings() -> QuerySettings {
        QuerySettings {
            batch_size: 100,
            lease_interval: 60,
            lease_datepart: "second",
            max_dequeue_count: 5,
            cleanup_interval: 300,
            cleanup_datepart: "second",
        }
    }

    fn sample_queries() -> TableQueries {
        TableQueries::new(&sample_schema(), sample_settings())
    }

    #[test]
    fn test_table_names() {
        assert_eq!(global_state_table(), "[trigger].[GlobalState]");
        assert_eq!(worker_batch_sizes_table(), "[trigger].[WorkerBatchSizes]");
        assert_eq!(lease_table(TableId::new(123)), "[trigger].[Worker_Table_123]");
    }

    #[test]
    fn test_create_lease_table_repeats_key_types() {
        let queries = sample_queries();
        let sql = queries.create_lease_table_sql(&sample_schema());

        assert!(sql.contains("CREATE TABLE [trigger].[Worker_Table_123]"));
        assert!(sql.contains("[id] int NOT NULL"));
        assert!(sql.contains("[LeaseExpirationTime] datetime2 NULL"));
        assert!(sql.contains("PRIMARY KEY ([id])"));
    }

    #[test]
    fn test_fetch_batch_reads_and_acquires_in_one_transaction() {
        let sql = sample_queries().fetch_batch_sql();

        assert!(sql.starts_with("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ;"));
        assert!(sql.contains("SELECT TOP (100)"));
        assert!(sql.contains("CHANGETABLE(CHANGES [dbo].[items], @last_version)"));
        assert!(sql.contains("[l].[DequeueCount] < 5"));
        assert!(sql.contains("MERGE [trigger].[Worker_Table_123] WITH (HOLDLOCK)"));
        assert!(sql.contains("DATEADD(second, 60, SYSUTCDATETIME())"));
        assert!(sql.contains("ORDER BY [c].[SYS_CHANGE_VERSION] ASC"));
        // Deleted rows carry no user-table values; the join must be outer.
        assert!(sql.contains("LEFT OUTER JOIN [dbo].[items] AS [u]"));
        // The elevated isolation level is scoped to the fetch transaction.
        assert!(sql.ends_with("SET TRANSACTION ISOLATION LEVEL READ COMMITTED;"));
    }

    #[test]
    fn test_renew_leases_single_key() {
        let sql = sample_queries().renew_leases_sql(2);

        assert_eq!(
            sql,
            "UPDATE [trigger].[Worker_Table_123] \
             SET [LeaseExpirationTime] = DATEADD(second, 60, SYSUTCDATETIME()) \
             WHERE ([id] = @P1) OR ([id] = @P2);"
        );
    }

    #[test]
    fn test_renew_leases_composite_key() {
        let mut schema = sample_schema();
        schema.primary_key.push(PrimaryKeyColumn {
            name: "region".to_string(),
            data_type: SqlDataType {
                name: "nvarchar".to_string(),
                max_length: 20,
                precision: 0,
                scale: 0,
            },
        });
        let queries = TableQueries::new(&schema, sample_settings());
        let sql = queries.renew_leases_sql(2);

        assert!(sql.contains("([id] = @P1 AND [region] = @P2)"));
        assert!(sql.contains("([id] = @P3 AND [region] = @P4)"));
    }

    #[test]
    fn test_release_row_guards_newer_state() {
        let sql = sample_queries().release_row_sql();

        assert!(sql.contains("[LeaseExpirationTime] = NULL"));
        assert!(sql.contains("[DequeueCount] = 0"));
        assert!(sql.contains("[id] = @P2"));
        assert!(sql.contains("([VersionNumber] IS NULL OR [VersionNumber] <= @P1)"));
    }

    #[test]
    fn test_advance_version_wraps_rows_processed() {
        let sql = sample_queries().advance_version_sql();

        assert!(sql.contains("IF NOT EXISTS"));
        assert!(sql.contains("[c].[SYS_CHANGE_VERSION] <= @P1"));
        assert!(sql.contains("[GlobalVersionNumber] < @P1"));
        assert!(sql.contains("DELETE FROM [trigger].[Worker_Table_123] WHERE [VersionNumber] <= @P1"));
        assert!(sql.contains(&format!("WHEN [RowsProcessed] > {} - @P2", i64::MAX)));
    }

    #[test]
    fn test_advance_tail_uses_highest_released_version() {
        let sql = sample_queries().advance_tail_sql();

        assert!(sql.contains("MAX([VersionNumber])"));
        assert!(sql.contains("[LeaseExpirationTime] IS NULL OR [DequeueCount] >= 5"));
        assert!(sql.contains("IF @candidate IS NOT NULL"));
    }

    #[test]
    fn test_synchronize_version_handles_recreation() {
        let sql = sample_queries().synchronize_version_sql();

        assert!(sql.contains("CHANGE_TRACKING_MIN_VALID_VERSION(123)"));
        assert!(sql.contains("[DatabaseID] <> @db_id"));
        assert!(sql.contains("TRUNCATE TABLE [trigger].[Worker_Table_123]"));
        assert!(sql.contains("[GlobalVersionNumber] < @min_valid_version"));
    }

    #[test]
    fn test_worker_liveness_statements() {
        let queries = sample_queries();

        assert_eq!(
            queries.cleanup_workers_sql(),
            "DELETE FROM [trigger].[WorkerBatchSizes] \
             WHERE [UserTableID] = 123 \
             AND [Timestamp] < DATEADD(second, -300, SYSUTCDATETIME());"
        );
        assert_eq!(
            queries.retire_worker_sql(),
            "DELETE FROM [trigger].[WorkerBatchSizes] WHERE [UserTableID] = 123 AND [WorkerID] = @P1;"
        );
        assert!(queries.refresh_worker_sql().contains("WHEN MATCHED THEN UPDATE SET [Timestamp]"));
    }

    #[test]
    fn test_change_counts() {
        let queries = sample_queries();

        assert!(
            queries
                .change_count_all_sql()
                .contains("CHANGE_TRACKING_MIN_VALID_VERSION(123)")
        );
        assert!(queries.change_count_unprocessed_sql().contains("WHERE NOT ("));
    }
}
