use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tiberius::{Client, Row, ToSql};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};
use trigger_mssql::schema::{
    PrimaryKeyColumn, SqlDataType, TableId, TableName, TableSchema,
};
use trigger_mssql::sql::{self, QuerySettings, TableQueries};
use trigger_mssql::types::Cell;

use crate::config::{MssqlConnectionConfig, TriggerConfig};
use crate::error::{ErrorKind, TriggerError, TriggerResult};
use crate::store::state::{ChangeCountScope, LeaseStore};
use crate::types::{ChangeOperation, ChangeRow, LeasedChange, WorkerId};

/// The driver client over a compat-wrapped TCP stream.
type SqlClient = Client<Compat<TcpStream>>;

/// Schema information and statement set cached after provisioning.
#[derive(Debug)]
struct ProvisionedTable {
    schema: TableSchema,
    queries: TableQueries,
    /// Column names of fetched rows: key columns first, then the rest.
    all_columns: Arc<Vec<String>>,
    /// Key column names only, used for deletion payloads.
    key_columns: Arc<Vec<String>>,
}

#[derive(Debug)]
struct Inner {
    connection: MssqlConnectionConfig,
    config: TriggerConfig,
    /// Normalized user-table name, as supplied by the host binding.
    table_name: String,
    worker_id: WorkerId,
    /// Lazily (re)connected driver client. Dropped on connection-class errors
    /// so the next call reconnects.
    client: Mutex<Option<SqlClient>>,
    table: OnceLock<ProvisionedTable>,
}

/// SQL Server-backed implementation of [`LeaseStore`].
///
/// All coordination state lives in the host database; this store owns one
/// driver connection per worker and serializes its use across the worker's
/// tasks. The connection is established lazily and re-established after
/// connection loss.
#[derive(Debug, Clone)]
pub struct MssqlStore {
    inner: Arc<Inner>,
}

impl MssqlStore {
    /// Creates a store for one user table. No connection is made until the
    /// first database call.
    pub fn new(
        connection: MssqlConnectionConfig,
        config: TriggerConfig,
        table_name: impl Into<String>,
        worker_id: WorkerId,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                config,
                table_name: table_name.into(),
                worker_id,
                client: Mutex::new(None),
                table: OnceLock::new(),
            }),
        }
    }

    /// Locks the client slot, connecting first when empty.
    async fn client(&self) -> TriggerResult<MutexGuard<'_, Option<SqlClient>>> {
        let mut guard = self.inner.client.lock().await;
        if guard.is_none() {
            *guard = Some(connect(&self.inner.connection).await?);
        }
        Ok(guard)
    }

    /// Runs a statement that returns no rows, reconnecting on the next call
    /// after connection loss.
    async fn run_execute(&self, sql: &str, params: &[&dyn ToSql]) -> TriggerResult<u64> {
        let mut guard = self.client().await?;
        let client = borrow_client(&mut guard)?;

        match client.execute(sql, params).await {
            Ok(result) => Ok(result.total()),
            Err(err) => Err(invalidate_on_connection_error(&mut guard, err.into())),
        }
    }

    /// Runs a query and collects every result set it produces.
    async fn run_query(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> TriggerResult<Vec<Vec<Row>>> {
        let mut guard = self.client().await?;
        let client = borrow_client(&mut guard)?;

        match fetch_query_results(client, sql, params).await {
            Ok(results) => Ok(results),
            Err(err) => Err(invalidate_on_connection_error(&mut guard, err.into())),
        }
    }

    /// Runs a query expected to produce a single scalar bigint.
    async fn run_scalar_i64(&self, sql: &str, params: &[&dyn ToSql]) -> TriggerResult<i64> {
        let results = self.run_query(sql, params).await?;
        let row = results
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| TriggerError::invalid_state("scalar query returned no rows"))?;
        let value = row
            .try_get::<i64, _>(0)
            .map_err(TriggerError::from)?
            .ok_or_else(|| TriggerError::invalid_state("scalar query returned NULL"))?;
        Ok(value)
    }

    /// Returns the cached schema and statement set, failing before provision.
    fn table(&self) -> TriggerResult<&ProvisionedTable> {
        self.inner
            .table
            .get()
            .ok_or_else(|| TriggerError::invalid_state("store used before provisioning"))
    }

    /// Reads the user table's object id, failing when the table is absent.
    async fn resolve_table_id(&self) -> TriggerResult<TableId> {
        let results = self
            .run_query(sql::object_id_query(), &[&self.inner.table_name.as_str()])
            .await?;
        let object_id = results
            .into_iter()
            .flatten()
            .next()
            .and_then(|row| row.try_get::<i32, _>(0).ok().flatten());

        match object_id {
            Some(id) => Ok(TableId::new(id)),
            None => Err(TriggerError::table_not_found(&self.inner.table_name)),
        }
    }

    /// Reads the catalog schema and table name for the object id.
    async fn resolve_table_name(&self, table_id: TableId) -> TriggerResult<TableName> {
        let results = self
            .run_query(sql::table_name_query(), &[&table_id.into_inner()])
            .await?;
        let row = results
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| TriggerError::table_not_found(&self.inner.table_name))?;

        let schema = required_str(&row, 0)?;
        let name = required_str(&row, 1)?;
        Ok(TableName::new(schema, name))
    }

    /// Reads the primary-key columns with their declared types.
    async fn read_primary_key(&self, table_id: TableId) -> TriggerResult<Vec<PrimaryKeyColumn>> {
        let results = self
            .run_query(sql::primary_key_query(), &[&table_id.into_inner()])
            .await?;

        let mut primary_key = Vec::new();
        for row in results.into_iter().flatten() {
            let name = required_str(&row, 0)?;
            let type_name = required_str(&row, 1)?;
            let max_length = row
                .try_get::<i16, _>(2)
                .map_err(TriggerError::from)?
                .unwrap_or_default();
            let precision = row
                .try_get::<u8, _>(3)
                .map_err(TriggerError::from)?
                .unwrap_or_default();
            let scale = row
                .try_get::<u8, _>(4)
                .map_err(TriggerError::from)?
                .unwrap_or_default();

            primary_key.push(PrimaryKeyColumn {
                name,
                data_type: SqlDataType {
                    name: type_name,
                    max_length,
                    precision,
                    scale,
                },
            });
        }

        if primary_key.is_empty() {
            return Err(TriggerError::new(ErrorKind::PrimaryKeyMissing {
                table_name: self.inner.table_name.clone(),
            }));
        }
        Ok(primary_key)
    }

    /// Reads every user-table column name in ordinal order.
    async fn read_columns(&self, table_id: TableId) -> TriggerResult<Vec<String>> {
        let results = self
            .run_query(sql::columns_query(), &[&table_id.into_inner()])
            .await?;

        let mut columns = Vec::new();
        for row in results.into_iter().flatten() {
            columns.push(required_str(&row, 0)?);
        }
        Ok(columns)
    }

    /// Reads the minimum valid change-tracking version, surfacing the
    /// user-facing error when change tracking is not enabled.
    async fn read_min_valid_version(&self, table_id: TableId) -> TriggerResult<i64> {
        let results = self
            .run_query(sql::min_valid_version_query(), &[&table_id.into_inner()])
            .await?;
        let version = results
            .into_iter()
            .flatten()
            .next()
            .and_then(|row| row.try_get::<i64, _>(0).ok().flatten());

        version.ok_or_else(|| TriggerError::change_tracking_not_enabled(&self.inner.table_name))
    }

    /// Creates a coordination object, wrapping failures as schema errors.
    async fn run_ddl(&self, sql: &str) -> TriggerResult<()> {
        self.run_execute(sql, &[]).await.map_err(|err| {
            TriggerError::with_source(
                ErrorKind::SchemaProvisioningFailed {
                    reason: err.to_string(),
                },
                err,
            )
        })?;
        Ok(())
    }
}

impl LeaseStore for MssqlStore {
    async fn provision(&self) -> TriggerResult<TableSchema> {
        let table_id = self.resolve_table_id().await?;
        let table = self.resolve_table_name(table_id).await?;
        let primary_key = self.read_primary_key(table_id).await?;
        let columns = self.read_columns(table_id).await?;
        let min_valid_version = self.read_min_valid_version(table_id).await?;

        let schema = TableSchema {
            table,
            id: table_id,
            primary_key,
            columns,
        };

        let settings = QuerySettings {
            batch_size: self.inner.config.batch_size,
            lease_interval: self.inner.config.lease_interval,
            lease_datepart: self.inner.config.lease_units.as_datepart(),
            max_dequeue_count: self.inner.config.max_dequeue_count,
            cleanup_interval: self.inner.config.cleanup_interval,
            cleanup_datepart: self.inner.config.cleanup_units.as_datepart(),
        };
        let queries = TableQueries::new(&schema, settings);

        // Each statement guards on existence, so concurrent workers can race
        // through provisioning safely.
        self.run_ddl(&sql::create_schema_sql()).await?;
        self.run_ddl(&sql::create_global_state_sql()).await?;
        self.run_ddl(&sql::create_worker_batch_sizes_sql()).await?;
        self.run_ddl(&queries.create_lease_table_sql(&schema)).await?;

        self.run_execute(&queries.seed_global_state_sql(), &[&min_valid_version])
            .await?;

        let key_columns: Arc<Vec<String>> = Arc::new(
            schema
                .primary_key_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        );
        let mut all_columns: Vec<String> = key_columns.as_ref().clone();
        all_columns.extend(schema.non_key_columns().into_iter().map(str::to_string));

        let provisioned = ProvisionedTable {
            schema: schema.clone(),
            queries,
            all_columns: Arc::new(all_columns),
            key_columns,
        };
        // Another task may have provisioned concurrently; either result is
        // equivalent.
        let _ = self.inner.table.set(provisioned);

        // Announce liveness with an empty batch report.
        self.refresh_worker().await?;

        info!(
            table = %schema.table,
            table_id = %schema.id,
            worker_id = %self.inner.worker_id,
            "coordination schema provisioned"
        );

        Ok(schema)
    }

    async fn synchronize_version(&self) -> TriggerResult<()> {
        let table = self.table()?;
        self.run_execute(&table.queries.synchronize_version_sql(), &[])
            .await?;
        Ok(())
    }

    async fn fetch_batch(&self) -> TriggerResult<Vec<LeasedChange>> {
        let table = self.table()?;
        let results = self
            .run_query(&table.queries.fetch_batch_sql(), &[])
            .await?;
        let rows = results.into_iter().next_back().unwrap_or_default();

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            batch.push(decode_change_row(row, table)?);
        }

        debug!(
            table_id = %table.schema.id,
            rows = batch.len(),
            "fetched change batch"
        );

        Ok(batch)
    }

    async fn renew_leases(&self, keys: &[Vec<Cell>]) -> TriggerResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let table = self.table()?;
        let sql = table.queries.renew_leases_sql(keys.len());
        let params: Vec<&dyn ToSql> = keys
            .iter()
            .flat_map(|key| key.iter().map(|cell| cell as &dyn ToSql))
            .collect();

        self.run_execute(&sql, &params).await?;
        Ok(())
    }

    async fn release_batch(&self, batch: &[LeasedChange]) -> TriggerResult<()> {
        let table = self.table()?;
        let release_sql = table.queries.release_row_sql();
        let batch_size_sql = table.queries.update_worker_batch_size_sql();
        let batch_len = batch.len() as i64;
        let worker_id = self.inner.worker_id.as_str();

        let mut guard = self.client().await?;
        let client = borrow_client(&mut guard)?;

        let released: TriggerResult<()> = async {
            client.execute("BEGIN TRANSACTION;", &[]).await?;
            for change in batch {
                let mut params: Vec<&dyn ToSql> = vec![&change.version];
                params.extend(change.key.iter().map(|cell| cell as &dyn ToSql));
                client.execute(release_sql.as_str(), &params).await?;
            }
            client
                .execute(batch_size_sql.as_str(), &[&worker_id, &batch_len])
                .await?;
            client.execute("COMMIT TRANSACTION;", &[]).await?;
            Ok(())
        }
        .await;

        if let Err(err) = released {
            // Best-effort rollback; the session transaction would otherwise
            // leak into the next statement on this connection.
            let _ = client.execute("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION;", &[]).await;
            return Err(invalidate_on_connection_error(&mut guard, err));
        }
        Ok(())
    }

    async fn try_advance_version(&self, new_version: i64, rows_processed: i64) -> TriggerResult<()> {
        let table = self.table()?;
        self.run_execute(
            &table.queries.advance_version_sql(),
            &[&new_version, &rows_processed],
        )
        .await?;
        Ok(())
    }

    async fn try_advance_tail(&self) -> TriggerResult<()> {
        let table = self.table()?;
        self.run_execute(&table.queries.advance_tail_sql(), &[])
            .await?;
        Ok(())
    }

    async fn refresh_worker(&self) -> TriggerResult<()> {
        let table = self.table()?;
        self.run_execute(
            &table.queries.refresh_worker_sql(),
            &[&self.inner.worker_id.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn cleanup_stale_workers(&self) -> TriggerResult<()> {
        let table = self.table()?;
        let removed = self
            .run_execute(&table.queries.cleanup_workers_sql(), &[])
            .await?;
        if removed > 0 {
            info!(
                table_id = %table.schema.id,
                removed,
                "removed abandoned worker liveness rows"
            );
        }
        Ok(())
    }

    async fn retire_worker(&self) -> TriggerResult<()> {
        let table = self.table()?;
        self.run_execute(
            &table.queries.retire_worker_sql(),
            &[&self.inner.worker_id.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn change_count(&self, scope: ChangeCountScope) -> TriggerResult<i64> {
        let table = self.table()?;
        let sql = match scope {
            ChangeCountScope::All => table.queries.change_count_all_sql(),
            ChangeCountScope::Unprocessed => table.queries.change_count_unprocessed_sql(),
        };
        self.run_scalar_i64(&sql, &[]).await
    }

    async fn rows_processed(&self) -> TriggerResult<i64> {
        let table = self.table()?;
        self.run_scalar_i64(&table.queries.rows_processed_sql(), &[])
            .await
    }

    async fn active_worker_count(&self, window: Duration) -> TriggerResult<i64> {
        let table = self.table()?;
        let window_secs = window.as_secs() as i64;
        self.run_scalar_i64(&table.queries.active_workers_sql(), &[&window_secs])
            .await
    }
}

/// Establishes a fresh driver connection.
async fn connect(config: &MssqlConnectionConfig) -> TriggerResult<SqlClient> {
    let connect_config = config.to_connect_config();

    let tcp = TcpStream::connect(connect_config.get_addr())
        .await
        .map_err(|err| connection_failed(config, err))?;
    tcp.set_nodelay(true)
        .map_err(|err| connection_failed(config, err))?;

    let client = Client::connect(connect_config, tcp.compat_write())
        .await
        .map_err(|err| connection_failed(config, err))?;

    debug!(host = %config.host, database = %config.database, "connected to database");

    Ok(client)
}

fn connection_failed(
    config: &MssqlConnectionConfig,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> TriggerError {
    TriggerError::with_source(
        ErrorKind::ConnectionFailed {
            host: config.host.clone(),
            database: config.database.clone(),
        },
        err,
    )
}

/// Borrows the connected client out of the guarded slot.
fn borrow_client<'a>(
    guard: &'a mut MutexGuard<'_, Option<SqlClient>>,
) -> TriggerResult<&'a mut SqlClient> {
    guard
        .as_mut()
        .ok_or_else(|| TriggerError::invalid_state("client slot empty after connect"))
}

/// Runs a query to completion, returning an owned result so the borrow of
/// `client` does not outlive this call.
async fn fetch_query_results(
    client: &mut SqlClient,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<Vec<Row>>, tiberius::error::Error> {
    let stream = client.query(sql, params).await?;
    stream.into_results().await
}

/// Drops the pooled client when the error indicates connection loss, so the
/// next call reconnects.
fn invalidate_on_connection_error(
    guard: &mut MutexGuard<'_, Option<SqlClient>>,
    err: TriggerError,
) -> TriggerError {
    if matches!(
        err.kind(),
        ErrorKind::ConnectionLost | ErrorKind::ConnectionFailed { .. }
    ) {
        **guard = None;
    }
    err
}

/// Reads a required string column from a catalog row.
fn required_str(row: &Row, index: usize) -> TriggerResult<String> {
    let value = row
        .try_get::<&str, _>(index)
        .map_err(TriggerError::from)?
        .ok_or_else(|| TriggerError::invalid_state("catalog query returned NULL name"))?;
    Ok(value.to_string())
}

/// Decodes one fetched row into a [`LeasedChange`].
///
/// Fetched rows are laid out as: change version, operation code, key columns,
/// then the remaining user-table columns. Deletions carry a key-only payload
/// since the user table can no longer be joined.
fn decode_change_row(row: Row, table: &ProvisionedTable) -> TriggerResult<LeasedChange> {
    let key_len = table.key_columns.len();

    let mut cells = Vec::with_capacity(row.len());
    for (index, data) in row.into_iter().enumerate() {
        let cell = Cell::try_from_column_data(data).map_err(|err| {
            let kind = match &err {
                trigger_mssql::types::CellError::UnsupportedType(_) => {
                    ErrorKind::UnsupportedDataType {
                        table_name: table.schema.table.to_string(),
                        reason: err.to_string(),
                    }
                }
                _ => ErrorKind::RowDecodingFailed {
                    column: table
                        .all_columns
                        .get(index.saturating_sub(2))
                        .cloned()
                        .unwrap_or_else(|| index.to_string()),
                },
            };
            TriggerError::with_source(kind, err)
        })?;
        cells.push(cell);
    }

    if cells.len() < 2 + key_len {
        return Err(TriggerError::invalid_state(
            "fetched change row is missing metadata columns",
        ));
    }

    let mut cells = cells.into_iter();
    let version = cells
        .next()
        .and_then(|cell| cell.as_i64())
        .ok_or_else(|| TriggerError::new(ErrorKind::RowDecodingFailed {
            column: "SYS_CHANGE_VERSION".to_string(),
        }))?;
    let operation = cells
        .next()
        .as_ref()
        .and_then(Cell::as_str)
        .and_then(ChangeOperation::from_code)
        .ok_or_else(|| TriggerError::new(ErrorKind::RowDecodingFailed {
            column: "SYS_CHANGE_OPERATION".to_string(),
        }))?;

    let remaining: Vec<Cell> = cells.collect();
    let key: Vec<Cell> = remaining[..key_len].to_vec();

    let row = if operation == ChangeOperation::Delete {
        ChangeRow::new(table.key_columns.clone(), key.clone())
    } else {
        ChangeRow::new(table.all_columns.clone(), remaining)
    };

    Ok(LeasedChange {
        version,
        operation,
        key,
        row,
    })
}
