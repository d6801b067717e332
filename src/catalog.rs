//! Multi-version file catalog.
//!
//! Every upload attempt gets its own row and its own backing file named
//! `<filename>.<uploadStarted>`. Readers reserve the committed version that
//! was current when they arrived and keep it alive until they release it,
//! so an overwrite never disturbs an in-flight download. Each operation is
//! one SQLite transaction; the catalog is the single point of truth and no
//! caller holds locks across operations.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;
use tokio::fs::File;

use crate::root::RootDir;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files(
    filename TEXT,
    uploadStarted INT UNIQUE,
    uploadCompleted INT,
    consumers INT
);
CREATE INDEX IF NOT EXISTS files_filename ON files(filename);
";

/// Rows that are committed, unread, and no longer the current version of
/// their filename. Deleting exactly these is what `release`, commit, and
/// the sweeper all do.
const SELECT_SUPERSEDED: &str = "
SELECT filename, uploadStarted FROM files AS f
WHERE (?1 IS NULL OR f.filename = ?1)
  AND f.uploadCompleted != 0
  AND f.consumers = 0
  AND EXISTS (
      SELECT 1 FROM files AS g
      WHERE g.filename = f.filename
        AND g.uploadCompleted != 0
        AND (g.uploadCompleted > f.uploadCompleted
             OR (g.uploadCompleted = f.uploadCompleted
                 AND g.uploadStarted > f.uploadStarted)))
";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no committed version of {0}")]
    NotFound(String),
    #[error("catalog store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("backing file error: {0}")]
    Io(#[from] std::io::Error),
}

/// One row of the `files` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRow {
    pub filename: String,
    pub upload_started: i64,
    pub upload_completed: i64,
    pub consumers: i64,
}

/// The backing filename for a version, inside the rooted directory.
pub fn backing_name(filename: &str, upload_started: i64) -> String {
    format!("{filename}.{upload_started}")
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
    root: RootDir,
}

impl Catalog {
    /// Opens (creating if needed) the catalog database and recovers from a
    /// non-graceful shutdown: rows of uploads that never finished are
    /// deleted along with their backing files, leftover consumer counts
    /// are zeroed, and one global sweep runs.
    pub async fn open(db_path: &Path, root: RootDir) -> Result<Catalog, CatalogError> {
        let conn = Connection::open(db_path)?;
        let catalog = Catalog {
            conn: Arc::new(Mutex::new(conn)),
            root,
        };

        let unfinished = catalog.with_tx(|tx| {
            tx.execute_batch(SCHEMA)?;
            let mut stmt =
                tx.prepare("SELECT filename, uploadStarted FROM files WHERE uploadCompleted = 0")?;
            let doomed = stmt
                .query_map([], |row| {
                    Ok(backing_name(&row.get::<_, String>(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);
            tx.execute("DELETE FROM files WHERE uploadCompleted = 0", [])?;
            tx.execute("UPDATE files SET consumers = 0", [])?;
            Ok(doomed)
        })?;
        catalog.unlink_all(&unfinished).await;
        catalog.sweep_superseded().await?;

        Ok(catalog)
    }

    /// Attaches a reader to the current committed version of `filename`,
    /// incrementing its consumer count, and opens its backing file.
    pub async fn reserve(&self, filename: &str) -> Result<(i64, File), CatalogError> {
        let current = self.with_tx(|tx| {
            let started = tx
                .query_row(
                    "SELECT uploadStarted FROM files
                     WHERE filename = ?1 AND uploadCompleted != 0
                     ORDER BY uploadCompleted DESC, uploadStarted DESC LIMIT 1",
                    params![filename],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            if let Some(started) = started {
                tx.execute(
                    "UPDATE files SET consumers = consumers + 1 WHERE uploadStarted = ?1",
                    params![started],
                )?;
            }
            Ok(started)
        })?;
        let upload_started =
            current.ok_or_else(|| CatalogError::NotFound(filename.to_string()))?;

        match self.root.open_file(&backing_name(filename, upload_started)).await {
            Ok(file) => Ok((upload_started, file)),
            Err(e) => {
                // undo the reservation so the row does not leak a consumer
                let _ = self.release(filename, upload_started).await;
                Err(e.into())
            }
        }
    }

    /// Detaches a reader from `(filename, upload_started)` and deletes any
    /// versions of `filename` that became eligible. The reader's file
    /// handle is closed by the caller dropping it.
    pub async fn release(&self, filename: &str, upload_started: i64) -> Result<(), CatalogError> {
        let doomed = self.with_tx(|tx| {
            tx.execute(
                "UPDATE files SET consumers = consumers - 1
                 WHERE filename = ?1 AND uploadStarted = ?2 AND consumers > 0",
                params![filename, upload_started],
            )?;
            delete_superseded(tx, Some(filename))
        })?;
        self.unlink_all(&doomed).await;
        Ok(())
    }

    /// Registers a new in-progress version of `filename` and creates its
    /// backing file. The returned timestamp is the version's identity; a
    /// collision on it is a hard error.
    pub async fn prepare(&self, filename: &str) -> Result<(i64, File), CatalogError> {
        let upload_started = now_micros();
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO files(filename, uploadStarted, uploadCompleted, consumers)
                 VALUES (?1, ?2, 0, 0)",
                params![filename, upload_started],
            )?;
            Ok(())
        })?;

        match self.root.create_file(&backing_name(filename, upload_started)).await {
            Ok(file) => Ok((upload_started, file)),
            Err(e) => {
                let _ = self.with_tx(|tx| {
                    tx.execute(
                        "DELETE FROM files WHERE uploadStarted = ?1",
                        params![upload_started],
                    )?;
                    Ok(())
                });
                Err(e.into())
            }
        }
    }

    /// Marks an upload finished, making it the current version, then
    /// deletes versions of `filename` it superseded.
    pub async fn commit_upload(
        &self,
        filename: &str,
        upload_started: i64,
    ) -> Result<(), CatalogError> {
        let doomed = self.with_tx(|tx| {
            // the clock may not have advanced since prepare; completion
            // must still order strictly after the start
            let completed = now_micros().max(upload_started + 1);
            tx.execute(
                "UPDATE files SET uploadCompleted = ?1
                 WHERE filename = ?2 AND uploadStarted = ?3",
                params![completed, filename, upload_started],
            )?;
            delete_superseded(tx, Some(filename))
        })?;
        self.unlink_all(&doomed).await;
        Ok(())
    }

    /// Discards a failed upload: the row and its backing file go away. A
    /// no-op when the upload already committed, so writers can call it
    /// unconditionally on their error paths.
    pub async fn abort_upload(
        &self,
        filename: &str,
        upload_started: i64,
    ) -> Result<(), CatalogError> {
        let doomed = self.with_tx(|tx| {
            let completed = tx
                .query_row(
                    "SELECT uploadCompleted FROM files
                     WHERE filename = ?1 AND uploadStarted = ?2",
                    params![filename, upload_started],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            match completed {
                Some(0) => {
                    tx.execute(
                        "DELETE FROM files WHERE uploadStarted = ?1",
                        params![upload_started],
                    )?;
                    Ok(Some(backing_name(filename, upload_started)))
                }
                _ => Ok(None),
            }
        })?;
        if let Some(name) = doomed {
            self.unlink_all(&[name]).await;
        }
        Ok(())
    }

    /// Deletes every superseded, committed, zero-consumer version across
    /// all filenames. Run periodically and at shutdown by the sweeper.
    pub async fn sweep_superseded(&self) -> Result<(), CatalogError> {
        let doomed = self.with_tx(|tx| delete_superseded(tx, None))?;
        self.unlink_all(&doomed).await;
        Ok(())
    }

    /// All rows recorded for `filename`, newest committed first.
    pub fn versions(&self, filename: &str) -> Result<Vec<VersionRow>, CatalogError> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT filename, uploadStarted, uploadCompleted, consumers FROM files
                 WHERE filename = ?1 ORDER BY uploadCompleted DESC, uploadStarted DESC",
            )?;
            let rows = stmt
                .query_map(params![filename], |row| {
                    Ok(VersionRow {
                        filename: row.get(0)?,
                        upload_started: row.get(1)?,
                        upload_completed: row.get(2)?,
                        consumers: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Runs `f` inside an immediate-mode transaction, committing on
    /// success. A failed transaction is retried once before the error is
    /// surfaced.
    fn with_tx<T>(
        &self,
        mut f: impl FnMut(&Transaction) -> Result<T, rusqlite::Error>,
    ) -> Result<T, CatalogError> {
        let mut conn = self.lock_conn();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = run_tx(&mut conn, &mut f);
            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempts < 2 => {
                    tracing::debug!(error = %e, "catalog transaction failed, retrying once");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn unlink_all(&self, names: &[String]) {
        for name in names {
            match self.root.remove_file(name).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(backing = %name, error = %e, "failed to unlink backing file");
                }
            }
        }
    }
}

fn run_tx<T>(
    conn: &mut Connection,
    f: &mut impl FnMut(&Transaction) -> Result<T, rusqlite::Error>,
) -> Result<T, rusqlite::Error> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Deletes superseded versions (of one filename, or of all when `filter`
/// is `None`) and returns the backing names to unlink.
fn delete_superseded(
    tx: &Transaction,
    filter: Option<&str>,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = tx.prepare(SELECT_SUPERSEDED)?;
    let doomed = stmt
        .query_map(params![filter], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut names = Vec::with_capacity(doomed.len());
    for (filename, upload_started) in doomed {
        tx.execute(
            "DELETE FROM files WHERE uploadStarted = ?1",
            params![upload_started],
        )?;
        names.push(backing_name(&filename, upload_started));
    }
    Ok(names)
}
