//! Asynchronous database queries observed by polling.
//!
//! A [`QueryPool`] owns one worker thread with its own SQLite connection.
//! Callers submit through a cloneable [`QueryHandle`] and never wait; the
//! tick loop collects finished work with [`QueryPool::pump`], which only
//! drains what is already complete.

use crossbeam::channel::{self, Receiver, Sender};
use holonet_types::error::{HolonetError, RegistryError};
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// A single SQL value, as bound or returned.
pub type SqlValue = rusqlite::types::Value;

/// Identifies one submitted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryToken(pub u64);

/// A query waiting for the worker.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub token: QueryToken,
    /// Opaque tag handed back with the completion (the issuing module).
    pub owner: usize,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Rows returned by a finished query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows changed, for statements that write.
    pub changed: usize,
}

impl QueryRows {
    /// Value of `column` in row `index`, if both exist.
    pub fn value(&self, index: usize, column: &str) -> Option<&SqlValue> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows.get(index)?.get(col)
    }
}

/// A finished query.
#[derive(Debug, Clone)]
pub struct QueryCompletion {
    pub token: QueryToken,
    pub owner: usize,
    pub result: Result<QueryRows, RegistryError>,
}

enum Job {
    Run(QueryRequest),
    Stop,
}

/// Cloneable submission side of a [`QueryPool`].
#[derive(Clone)]
pub struct QueryHandle {
    jobs: Sender<Job>,
    next_token: Arc<AtomicU64>,
}

impl QueryHandle {
    /// A handle with no worker behind it. Every submit fails.
    pub fn detached() -> Self {
        let (jobs, _) = channel::unbounded();
        Self {
            jobs,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue `sql` for the worker. Returns immediately.
    pub fn submit(
        &self,
        owner: usize,
        sql: impl Into<String>,
        params: Vec<SqlValue>,
    ) -> Result<QueryToken, HolonetError> {
        let token = QueryToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let request = QueryRequest {
            token,
            owner,
            sql: sql.into(),
            params,
        };
        self.jobs
            .send(Job::Run(request))
            .map_err(|_| HolonetError::Database("query worker is not running".into()))?;
        Ok(token)
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle").finish_non_exhaustive()
    }
}

/// Worker-backed query executor.
pub struct QueryPool {
    handle: QueryHandle,
    completions: Receiver<QueryCompletion>,
    worker: Option<JoinHandle<()>>,
}

impl QueryPool {
    /// Open a dedicated connection to `path` and start the worker.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(|e| RegistryError::Database(e.to_string()))?;
        let (jobs_tx, jobs_rx) = channel::unbounded::<Job>();
        let (done_tx, done_rx) = channel::unbounded::<QueryCompletion>();

        let worker = std::thread::Builder::new()
            .name("holonet-query".into())
            .spawn(move || worker_loop(conn, jobs_rx, done_tx))
            .map_err(|e| RegistryError::Database(format!("failed to start query worker: {e}")))?;

        Ok(Self {
            handle: QueryHandle {
                jobs: jobs_tx,
                next_token: Arc::new(AtomicU64::new(1)),
            },
            completions: done_rx,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> QueryHandle {
        self.handle.clone()
    }

    /// Collect every query that has finished since the last call.
    pub fn pump(&self) -> Vec<QueryCompletion> {
        self.completions.try_iter().collect()
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        let _ = self.handle.jobs.send(Job::Stop);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Query worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(conn: Connection, jobs: Receiver<Job>, done: Sender<QueryCompletion>) {
    for job in jobs.iter() {
        let request = match job {
            Job::Run(request) => request,
            Job::Stop => break,
        };
        let result = run_query(&conn, &request.sql, &request.params);
        if let Err(e) = &result {
            debug!(token = request.token.0, error = %e, "Async query failed");
        }
        let completion = QueryCompletion {
            token: request.token,
            owner: request.owner,
            result,
        };
        if done.send(completion).is_err() {
            break;
        }
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<QueryRows, RegistryError> {
    let db = |e: rusqlite::Error| RegistryError::Database(e.to_string());
    let mut stmt = conn.prepare(sql).map_err(db)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    if columns.is_empty() {
        let changed = stmt
            .execute(rusqlite::params_from_iter(params.iter()))
            .map_err(db)?;
        return Ok(QueryRows {
            columns,
            rows: Vec::new(),
            changed,
        });
    }

    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt
        .query(rusqlite::params_from_iter(params.iter()))
        .map_err(db)?;
    while let Some(row) = cursor.next().map_err(db)? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.get::<_, SqlValue>(i).map_err(db)?);
        }
        rows.push(values);
    }

    Ok(QueryRows {
        columns,
        rows,
        changed: 0,
    })
}
