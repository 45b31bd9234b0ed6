use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::{rank_hits, validate_records, IndexRecord, SearchHit, StorageError, StoredFile, TableSchema, VectorTable};

const METADATA_TABLE: &str = "vault_tables";

/// One vault's table inside the shared SQLite vector database.
pub struct SqliteTable {
    connection: Arc<Mutex<Connection>>,
    table: String,
    schema: TableSchema,
    database_path: PathBuf,
}

/// Result of opening a table; `recreated` is set when stale contents
/// (different model or dimensionality) were dropped.
pub struct OpenedTable {
    pub table: SqliteTable,
    pub recreated: bool,
}

impl SqliteTable {
    /// Opens (creating if needed) the table `table` in the database at
    /// `database_path`, validating it against `schema`.
    pub async fn open(
        database_path: &Path,
        table: &str,
        vault_dir: &Path,
        schema: TableSchema,
    ) -> Result<OpenedTable, StorageError> {
        if let Some(parent) = database_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path = database_path.to_path_buf();
        let name = table.to_string();
        let vault = vault_dir.display().to_string();
        let expected = schema.clone();

        let (connection, recreated) = tokio::task::spawn_blocking(move || {
            let mut connection = Connection::open(&path)?;
            configure(&connection)?;
            let recreated = prepare_table(&mut connection, &name, &vault, &expected)?;
            Ok::<_, StorageError>((connection, recreated))
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))??;

        if recreated {
            info!("Recreated vector table {} for model {}", table, schema.model_fingerprint);
        } else {
            debug!("Opened vector table {}", table);
        }

        Ok(OpenedTable {
            table: Self {
                connection: Arc::new(Mutex::new(connection)),
                table: table.to_string(),
                schema,
                database_path: database_path.to_path_buf(),
            },
            recreated,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, StorageError> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = connection
                .lock()
                .map_err(|_| StorageError::Task("connection lock poisoned".to_string()))?;
            f(&mut guard, &table)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn configure(connection: &Connection) -> Result<(), StorageError> {
    connection.busy_timeout(Duration::from_secs(5))?;
    // journal_mode answers with the resulting mode, so it has to be queried
    let mode: String = connection.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    debug!("SQLite journal mode: {}", mode);
    connection.execute_batch("PRAGMA synchronous = NORMAL;")?;
    connection.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (
                table_name TEXT PRIMARY KEY,
                vault_path TEXT NOT NULL,
                model_fingerprint TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            METADATA_TABLE
        ),
        [],
    )?;
    Ok(())
}

/// Ensures `table` exists and matches `schema`. Returns true when an
/// existing table had to be dropped.
fn prepare_table(
    connection: &mut Connection,
    table: &str,
    vault: &str,
    schema: &TableSchema,
) -> Result<bool, StorageError> {
    let tx = connection.transaction()?;

    let existing: Option<(String, i64)> = tx
        .query_row(
            &format!(
                "SELECT model_fingerprint, dimensions FROM {} WHERE table_name = ?1",
                METADATA_TABLE
            ),
            params![table],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let recreated = match existing {
        Some((fingerprint, dims))
            if fingerprint == schema.model_fingerprint && dims as usize == schema.dimensions =>
        {
            false
        }
        Some((fingerprint, dims)) => {
            warn!(
                "Vector table {} was built with {} ({} dims), rebuilding for {} ({} dims)",
                table, fingerprint, dims, schema.model_fingerprint, schema.dimensions
            );
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", table))?;
            true
        }
        None => false,
    };

    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {t} (
            chunk_id TEXT PRIMARY KEY,
            source_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            modified_ms INTEGER NOT NULL,
            size INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            text TEXT NOT NULL,
            vector BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS {t}_source ON {t}(source_path);",
        t = table
    ))?;

    tx.execute(
        &format!(
            "INSERT INTO {} (table_name, vault_path, model_fingerprint, dimensions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(table_name) DO UPDATE SET
                vault_path = excluded.vault_path,
                model_fingerprint = excluded.model_fingerprint,
                dimensions = excluded.dimensions,
                created_at = CASE WHEN {}.model_fingerprint = excluded.model_fingerprint
                                   AND {}.dimensions = excluded.dimensions
                             THEN {}.created_at ELSE excluded.created_at END",
            METADATA_TABLE, METADATA_TABLE, METADATA_TABLE, METADATA_TABLE
        ),
        params![
            table,
            vault,
            schema.model_fingerprint,
            schema.dimensions as i64,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;

    tx.commit()?;
    Ok(recreated)
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(chunk_id: &str, bytes: &[u8]) -> Result<Vec<f32>, StorageError> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::CorruptVector(chunk_id.to_string()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(IndexRecord, Vec<u8>)> {
    Ok((
        IndexRecord {
            chunk_id: row.get(0)?,
            source_path: row.get(1)?,
            content_hash: row.get(2)?,
            modified_ms: row.get(3)?,
            size: row.get::<_, i64>(4)? as u64,
            chunk_index: row.get::<_, i64>(5)? as usize,
            start_offset: row.get::<_, i64>(6)? as usize,
            text: row.get(7)?,
            vector: Vec::new(),
        },
        row.get(8)?,
    ))
}

fn load_records(
    connection: &Connection,
    table: &str,
    source_path: Option<&str>,
) -> Result<Vec<IndexRecord>, StorageError> {
    let columns = "chunk_id, source_path, content_hash, modified_ms, size, chunk_index, start_offset, text, vector";
    let rows = match source_path {
        Some(path) => {
            let mut stmt = connection.prepare(&format!(
                "SELECT {} FROM {} WHERE source_path = ?1 ORDER BY chunk_index",
                columns, table
            ))?;
            let rows = stmt
                .query_map(params![path], read_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt = connection.prepare(&format!("SELECT {} FROM {}", columns, table))?;
            let rows = stmt
                .query_map([], read_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };

    rows.into_iter()
        .map(|(mut record, blob)| {
            record.vector = decode_vector(&record.chunk_id, &blob)?;
            Ok(record)
        })
        .collect()
}

#[async_trait::async_trait]
impl VectorTable for SqliteTable {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn stored_files(&self) -> Result<HashMap<String, StoredFile>, StorageError> {
        self.with_connection(|conn, table| {
            let mut stmt = conn.prepare(&format!(
                "SELECT source_path, content_hash, modified_ms, size, COUNT(*)
                 FROM {} GROUP BY source_path",
                table
            ))?;
            let files = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        StoredFile {
                            content_hash: row.get(1)?,
                            modified_ms: row.get(2)?,
                            size: row.get::<_, i64>(3)? as u64,
                            chunks: row.get::<_, i64>(4)? as usize,
                        },
                    ))
                })?
                .collect::<rusqlite::Result<HashMap<_, _>>>()?;
            Ok(files)
        })
        .await
    }

    async fn replace_file(&self, source_path: &str, records: Vec<IndexRecord>) -> Result<(), StorageError> {
        validate_records(&self.schema, source_path, &records)?;
        let path = source_path.to_string();
        self.with_connection(move |conn, table| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!("DELETE FROM {} WHERE source_path = ?1", table),
                params![path],
            )?;
            {
                let mut insert = tx.prepare(&format!(
                    "INSERT INTO {} (chunk_id, source_path, content_hash, modified_ms, size,
                                     chunk_index, start_offset, text, vector)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    table
                ))?;
                for record in &records {
                    insert.execute(params![
                        record.chunk_id,
                        record.source_path,
                        record.content_hash,
                        record.modified_ms,
                        record.size as i64,
                        record.chunk_index as i64,
                        record.start_offset as i64,
                        record.text,
                        encode_vector(&record.vector),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove_file(&self, source_path: &str) -> Result<usize, StorageError> {
        let path = source_path.to_string();
        self.with_connection(move |conn, table| {
            Ok(conn.execute(
                &format!("DELETE FROM {} WHERE source_path = ?1", table),
                params![path],
            )?)
        })
        .await
    }

    async fn remove_prefix(&self, dir: &str) -> Result<usize, StorageError> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.with_connection(move |conn, table| {
            Ok(conn.execute(
                &format!(
                    "DELETE FROM {} WHERE substr(source_path, 1, ?1) = ?2",
                    table
                ),
                params![prefix.chars().count() as i64, prefix],
            )?)
        })
        .await
    }

    async fn touch_file(&self, source_path: &str, modified_ms: i64, size: u64) -> Result<(), StorageError> {
        let path = source_path.to_string();
        self.with_connection(move |conn, table| {
            conn.execute(
                &format!(
                    "UPDATE {} SET modified_ms = ?1, size = ?2 WHERE source_path = ?3",
                    table
                ),
                params![modified_ms, size as i64, path],
            )?;
            Ok(())
        })
        .await
    }

    async fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<SearchHit>, StorageError> {
        if query.len() != self.schema.dimensions {
            return Err(StorageError::InvalidVectorDimension {
                expected: self.schema.dimensions,
                actual: query.len(),
            });
        }
        let query = query.to_vec();
        self.with_connection(move |conn, table| {
            let records = load_records(conn, table, None)?;
            Ok(rank_hits(&query, records.iter(), limit))
        })
        .await
    }

    async fn records_for(&self, source_path: &str) -> Result<Vec<IndexRecord>, StorageError> {
        let path = source_path.to_string();
        self.with_connection(move |conn, table| load_records(conn, table, Some(&path)))
            .await
    }

    async fn count(&self) -> Result<usize, StorageError> {
        self.with_connection(|conn, table| {
            let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.with_connection(|conn, _| {
            conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }
}
