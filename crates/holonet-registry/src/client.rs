//! Registry client: this node's row and synchronous peer lookup.

use crate::mapping::{BoundQuery, RowRecord};
use crate::migration;
use crate::pool::{QueryCompletion, QueryHandle, QueryPool};
use chrono::Utc;
use holonet_types::error::RegistryError;
use holonet_types::registry::{NodeStatus, RegistryEntry};
use rusqlite::{Connection, Row};
use std::path::Path;
use tracing::{debug, info};

const LOOKUP_SQL: &str = "SELECT node_name, address, port, status, start_counter \
                          FROM process_registry WHERE node_name = ?1";

impl RowRecord for RegistryEntry {
    const NAME: &'static str = "RegistryEntry";
    const COLUMNS: &'static [&'static str] =
        &["node_name", "address", "port", "status", "start_counter"];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let code: i64 = row.get(3)?;
        let status =
            NodeStatus::from_code(code).ok_or(rusqlite::Error::IntegralValueOutOfRange(3, code))?;
        Ok(Self {
            node_name: row.get(0)?,
            address: row.get(1)?,
            port: row.get(2)?,
            status,
            start_counter: row.get(4)?,
        })
    }
}

fn db(e: rusqlite::Error) -> RegistryError {
    RegistryError::Database(e.to_string())
}

/// Reads and writes the shared process registry.
///
/// Writes are synchronous and committed before returning. The client also
/// owns the [`QueryPool`] used for asynchronous queries.
pub struct RegistryClient {
    queries: QueryPool,
    conn: Connection,
    lookup: BoundQuery<RegistryEntry>,
    /// Name registered by `register_self`; the only row this client writes.
    owner: Option<String>,
    status: NodeStatus,
    history: Vec<NodeStatus>,
}

impl RegistryClient {
    /// Open the registry database, apply migrations, and start the query worker.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(db)?;
        migration::run_migrations(&conn).map_err(db)?;
        let lookup = BoundQuery::bind(&conn, LOOKUP_SQL)?;
        let queries = QueryPool::open(path)?;
        debug!(path = %path.display(), "Registry database opened");
        Ok(Self {
            queries,
            conn,
            lookup,
            owner: None,
            status: NodeStatus::Offline,
            history: vec![NodeStatus::Offline],
        })
    }

    /// Publish this node's endpoint with status Loading and bump its start counter.
    pub fn register_self(
        &mut self,
        node_name: &str,
        address: &str,
        port: u16,
    ) -> Result<RegistryEntry, RegistryError> {
        if let Some(owner) = &self.owner {
            if owner != node_name {
                return Err(RegistryError::NotOwner {
                    writer: owner.clone(),
                    target: node_name.to_string(),
                });
            }
        }
        self.check_transition(node_name, NodeStatus::Loading)?;

        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().map_err(db)?;
        let changed = tx
            .execute(
                "UPDATE process_registry
                 SET address = ?2, port = ?3, status = ?4, start_counter = start_counter + 1, updated_at = ?5
                 WHERE node_name = ?1",
                rusqlite::params![node_name, address, port, NodeStatus::Loading.code(), now],
            )
            .map_err(db)?;
        match changed {
            0 => {
                tx.execute(
                    "INSERT INTO process_registry (node_name, address, port, status, start_counter, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    rusqlite::params![node_name, address, port, NodeStatus::Loading.code(), now],
                )
                .map_err(db)?;
            }
            1 => {}
            rows => {
                // Dropping the transaction rolls the update back.
                return Err(RegistryError::Ambiguous {
                    node: node_name.to_string(),
                    rows,
                });
            }
        }
        tx.commit().map_err(db)?;

        self.owner = Some(node_name.to_string());
        self.record(NodeStatus::Loading);
        let entry = self.lookup_peer(node_name)?;
        info!(
            node = node_name,
            endpoint = %entry.endpoint(),
            start_counter = entry.start_counter,
            "Registered in process registry"
        );
        Ok(entry)
    }

    /// Write this node's status. Only Loading -> Online -> Offline is accepted.
    pub fn set_status(&mut self, node_name: &str, status: NodeStatus) -> Result<(), RegistryError> {
        match &self.owner {
            Some(owner) if owner == node_name => {}
            Some(owner) => {
                return Err(RegistryError::NotOwner {
                    writer: owner.clone(),
                    target: node_name.to_string(),
                })
            }
            None => return Err(RegistryError::NotFound(node_name.to_string())),
        }
        self.check_transition(node_name, status)?;

        let tx = self.conn.transaction().map_err(db)?;
        let changed = tx
            .execute(
                "UPDATE process_registry SET status = ?2, updated_at = ?3 WHERE node_name = ?1",
                rusqlite::params![node_name, status.code(), Utc::now().to_rfc3339()],
            )
            .map_err(db)?;
        match changed {
            0 => return Err(RegistryError::NotFound(node_name.to_string())),
            1 => {}
            rows => {
                return Err(RegistryError::Ambiguous {
                    node: node_name.to_string(),
                    rows,
                })
            }
        }
        tx.commit().map_err(db)?;

        info!(node = node_name, from = %self.status, to = %status, "Registry status updated");
        self.record(status);
        Ok(())
    }

    /// Read the single row for `node_name`.
    pub fn lookup_peer(&self, node_name: &str) -> Result<RegistryEntry, RegistryError> {
        let mut rows = self.lookup.query(&self.conn, [node_name])?;
        match rows.len() {
            0 => Err(RegistryError::NotFound(node_name.to_string())),
            1 => Ok(rows.remove(0)),
            n => Err(RegistryError::Ambiguous {
                node: node_name.to_string(),
                rows: n,
            }),
        }
    }

    /// Status most recently written by this process.
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Every status this process has held, starting with Offline.
    pub fn history(&self) -> &[NodeStatus] {
        &self.history
    }

    /// Submission handle for asynchronous queries.
    pub fn query_handle(&self) -> QueryHandle {
        self.queries.handle()
    }

    /// Collect finished asynchronous queries. Never waits.
    pub fn pump(&self) -> Vec<QueryCompletion> {
        self.queries.pump()
    }

    fn check_transition(&self, node_name: &str, next: NodeStatus) -> Result<(), RegistryError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(RegistryError::InvalidTransition {
                node: node_name.to_string(),
                from: self.status,
                to: next,
            })
        }
    }

    fn record(&mut self, status: NodeStatus) {
        self.status = status;
        self.history.push(status);
    }
}
