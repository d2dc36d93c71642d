use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use shared::{
    domain::{ConnectionId, UserId},
    protocol::ServerEvent,
};

/// Outbound queue of one live connection. The session's writer task drains
/// it onto the socket.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct Member {
    connection: ConnectionId,
    sender: EventSender,
}

#[derive(Default)]
struct Group {
    members: Vec<Member>,
}

#[derive(Default)]
struct RegistryInner {
    groups: HashMap<UserId, Arc<Mutex<Group>>>,
    owners: HashMap<ConnectionId, UserId>,
}

/// Identity-to-connections table. Every connection bound to one identity
/// forms that identity's group; events addressed to the identity fan out
/// to the whole group.
///
/// The outer lock guards only the two lookup maps; each group carries its
/// own mutex, so joins, leaves, and broadcasts for unrelated identities
/// never serialize against each other. Emptied groups keep their entry: a
/// join racing a concurrent leave must never observe a group mid-teardown.
#[derive(Clone, Default)]
pub struct MembershipRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a connection's outbound queue into the identity's group. A
    /// connection joins at most once; repeat calls are no-ops, including
    /// calls naming a different identity.
    pub async fn join(&self, identity: UserId, connection: ConnectionId, sender: EventSender) {
        let group = {
            let mut inner = self.inner.write().await;
            if inner.owners.contains_key(&connection) {
                return;
            }
            inner.owners.insert(connection, identity.clone());
            Arc::clone(inner.groups.entry(identity.clone()).or_default())
        };
        let mut group = group.lock().await;
        group.members.push(Member { connection, sender });
        debug!(%connection, user = %identity, members = group.members.len(), "connection joined group");
    }

    /// Removes a connection from whichever group holds it. No-op when the
    /// connection never joined or already left.
    pub async fn leave(&self, connection: ConnectionId) {
        let target = {
            let mut inner = self.inner.write().await;
            let Some(identity) = inner.owners.remove(&connection) else {
                return;
            };
            inner
                .groups
                .get(&identity)
                .map(|group| (identity, Arc::clone(group)))
        };
        let Some((identity, group)) = target else {
            return;
        };
        let mut group = group.lock().await;
        group.members.retain(|member| member.connection != connection);
        debug!(%connection, user = %identity, members = group.members.len(), "connection left group");
    }

    /// Delivers an event to every live connection in the identity's group
    /// and returns the delivery count. Zero recipients (identity offline)
    /// is a normal, silent outcome.
    pub async fn broadcast_to(&self, identity: &UserId, event: &ServerEvent) -> usize {
        self.fan_out(identity, None, event).await
    }

    /// As `broadcast_to`, skipping one connection. Used when the origin
    /// already received its own copy as a direct response.
    pub async fn broadcast_excluding(
        &self,
        identity: &UserId,
        origin: ConnectionId,
        event: &ServerEvent,
    ) -> usize {
        self.fan_out(identity, Some(origin), event).await
    }

    /// Number of live connections currently grouped under `identity`.
    pub async fn group_size(&self, identity: &UserId) -> usize {
        let group = {
            let inner = self.inner.read().await;
            let Some(group) = inner.groups.get(identity) else {
                return 0;
            };
            Arc::clone(group)
        };
        let group = group.lock().await;
        group.members.len()
    }

    async fn fan_out(
        &self,
        identity: &UserId,
        skip: Option<ConnectionId>,
        event: &ServerEvent,
    ) -> usize {
        let group = {
            let inner = self.inner.read().await;
            let Some(group) = inner.groups.get(identity) else {
                return 0;
            };
            Arc::clone(group)
        };

        let mut group = group.lock().await;
        let mut delivered = 0;
        // A closed queue means the connection is gone; drop it here rather
        // than waiting for the session's own leave.
        group.members.retain(|member| {
            if skip == Some(member.connection) {
                return true;
            }
            match member.sender.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
