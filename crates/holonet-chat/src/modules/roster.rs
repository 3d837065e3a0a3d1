//! Cluster roster queries, answered from the process registry.
//!
//! A request submits an asynchronous registry query and returns at once.
//! The reply goes out on a later tick, when the completion arrives. A failed
//! query is answered with `available: false` rather than an error.

use holonet_kernel::{HandlerModule, ModuleContext};
use holonet_registry::{QueryCompletion, QueryRows, QueryToken, SqlValue};
use holonet_types::envelope::{Envelope, LinkId};
use holonet_types::registry::NodeStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub const OP_ROSTER_REQUEST: u32 = 16;
pub const OP_ROSTER_REPLY: u32 = 17;

const ROSTER_SQL: &str =
    "SELECT node_name, address, port, status FROM process_registry ORDER BY node_name";

/// One node as listed in a roster reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterNode {
    pub node: String,
    pub address: String,
    pub port: u16,
    pub status: String,
}

/// Payload of a roster reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterReply {
    pub available: bool,
    pub nodes: Vec<RosterNode>,
}

/// Lists registered nodes for whoever asks.
#[derive(Default)]
pub struct RosterModule {
    /// Outstanding queries and the link each reply goes to.
    pending: HashMap<QueryToken, LinkId>,
}

impl RosterModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries submitted but not yet answered.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn reply(ctx: &mut ModuleContext<'_>, link: LinkId, reply: &RosterReply) {
        let payload = match serde_json::to_vec(reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Roster: failed to encode reply");
                return;
            }
        };
        if let Err(e) = ctx.send(Envelope::new(OP_ROSTER_REPLY, payload, link)) {
            debug!(error = %e, "Roster: requester left before the reply");
        }
    }
}

fn text(value: Option<&SqlValue>) -> String {
    match value {
        Some(SqlValue::Text(s)) => s.clone(),
        _ => String::new(),
    }
}

fn integer(value: Option<&SqlValue>) -> i64 {
    match value {
        Some(SqlValue::Integer(n)) => *n,
        _ => 0,
    }
}

fn roster_nodes(rows: &QueryRows) -> Vec<RosterNode> {
    (0..rows.rows.len())
        .map(|i| RosterNode {
            node: text(rows.value(i, "node_name")),
            address: text(rows.value(i, "address")),
            port: u16::try_from(integer(rows.value(i, "port"))).unwrap_or(0),
            status: NodeStatus::from_code(integer(rows.value(i, "status")))
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
        .collect()
}

impl HandlerModule for RosterModule {
    fn name(&self) -> &str {
        "roster"
    }

    fn handle(&mut self, envelope: &Envelope, ctx: &mut ModuleContext<'_>) {
        if envelope.opcode != OP_ROSTER_REQUEST {
            debug!(opcode = envelope.opcode, "Roster: ignoring opcode");
            return;
        }
        match ctx.query(ROSTER_SQL, Vec::new()) {
            Ok(token) => {
                self.pending.insert(token, envelope.link);
            }
            Err(e) => {
                warn!(error = %e, "Roster: query not submitted");
                let unavailable = RosterReply {
                    available: false,
                    nodes: Vec::new(),
                };
                Self::reply(ctx, envelope.link, &unavailable);
            }
        }
    }

    fn query_completed(&mut self, completion: QueryCompletion, ctx: &mut ModuleContext<'_>) {
        let Some(link) = self.pending.remove(&completion.token) else {
            debug!(token = completion.token.0, "Roster: completion for unknown query");
            return;
        };
        let reply = match &completion.result {
            Ok(rows) => RosterReply {
                available: true,
                nodes: roster_nodes(rows),
            },
            Err(e) => {
                warn!(error = %e, "Roster: registry query failed");
                RosterReply {
                    available: false,
                    nodes: Vec::new(),
                }
            }
        };
        Self::reply(ctx, link, &reply);
    }

    fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            info!(unanswered = self.pending.len(), "Roster: dropping unanswered requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holonet_kernel::ModuleId;
    use holonet_registry::{QueryHandle, RegistryClient};
    use holonet_types::envelope::PeerRole;
    use holonet_types::error::RegistryError;
    use holonet_wire::{LinkIo, LinkTable, PeerLink};
    use std::time::Duration;

    #[test]
    fn test_roster_lists_registered_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = RegistryClient::open(&dir.path().join("r.db")).unwrap();
        registry.register_self("chat", "127.0.0.1", 5000).unwrap();
        registry.set_status("chat", NodeStatus::Online).unwrap();
        let mut other = RegistryClient::open(&dir.path().join("r.db")).unwrap();
        other.register_self("connection", "10.0.0.2", 4000).unwrap();

        let mut links = LinkTable::new();
        let (io, mut remote) = LinkIo::pair();
        let zone = links
            .insert(PeerLink::established("zone", PeerRole::Inbound, io))
            .unwrap();
        let queries = registry.query_handle();
        let mut module = RosterModule::new();

        {
            let mut ctx = ModuleContext::new(ModuleId(1), &mut links, &queries);
            module.handle(&Envelope::new(OP_ROSTER_REQUEST, &b""[..], zone), &mut ctx);
        }
        assert_eq!(module.pending(), 1);

        let mut completions = Vec::new();
        for _ in 0..200 {
            completions.extend(registry.pump());
            if !completions.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].owner, 1);
        {
            let mut ctx = ModuleContext::new(ModuleId(1), &mut links, &queries);
            for completion in completions {
                module.query_completed(completion, &mut ctx);
            }
        }
        links.pump_all();
        assert_eq!(module.pending(), 0);

        let sent = remote.drain_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode, OP_ROSTER_REPLY);
        let reply: RosterReply = serde_json::from_slice(&sent[0].payload).unwrap();
        assert!(reply.available);
        assert_eq!(
            reply.nodes,
            vec![
                RosterNode {
                    node: "chat".into(),
                    address: "127.0.0.1".into(),
                    port: 5000,
                    status: NodeStatus::Online.to_string(),
                },
                RosterNode {
                    node: "connection".into(),
                    address: "10.0.0.2".into(),
                    port: 4000,
                    status: NodeStatus::Loading.to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_failed_query_answers_unavailable() {
        let mut links = LinkTable::new();
        let (io, mut remote) = LinkIo::pair();
        let zone = links
            .insert(PeerLink::established("zone", PeerRole::Inbound, io))
            .unwrap();
        let queries = QueryHandle::detached();
        let mut module = RosterModule::new();

        // Detached handle: the submit itself fails.
        {
            let mut ctx = ModuleContext::new(ModuleId(0), &mut links, &queries);
            module.handle(&Envelope::new(OP_ROSTER_REQUEST, &b""[..], zone), &mut ctx);
        }
        // A completion carrying a database error.
        module.pending.insert(QueryToken(99), zone);
        {
            let mut ctx = ModuleContext::new(ModuleId(0), &mut links, &queries);
            module.query_completed(
                QueryCompletion {
                    token: QueryToken(99),
                    owner: 0,
                    result: Err(RegistryError::Database("locked".into())),
                },
                &mut ctx,
            );
        }
        links.pump_all();

        let sent = remote.drain_sent();
        assert_eq!(sent.len(), 2);
        for frame in sent {
            let reply: RosterReply = serde_json::from_slice(&frame.payload).unwrap();
            assert!(!reply.available);
            assert!(reply.nodes.is_empty());
        }
    }
}
