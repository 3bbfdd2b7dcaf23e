//! Connected-client registry and per-type capability sets.

use dashmap::DashMap;
use kernel_core::ids::now_ms;
use kernel_core::state::ClientType;
use serde::Serialize;

/// Methods a `brain` client may call.
pub const BRAIN_METHODS: &[&str] = &[
    "exec.request",
    "exec.resolve",
    "memory.store",
    "memory.search",
    "session.snapshot",
    "session.update",
    "registry.snapshot",
];

/// Methods a `sentinel` client may call.
pub const SENTINEL_METHODS: &[&str] = &["focus.update", "exec.resolve"];

/// Methods an `ears` client may call.
pub const EARS_METHODS: &[&str] = &["wake", "talk_mode"];

/// Reduced read-only set for `external` clients.
pub const EXTERNAL_METHODS: &[&str] = &["session.snapshot", "registry.snapshot"];

/// Capability set (method allowlist) for a client type.
pub fn capabilities_for(client_type: ClientType) -> &'static [&'static str] {
    match client_type {
        ClientType::Brain => BRAIN_METHODS,
        ClientType::Sentinel => SENTINEL_METHODS,
        ClientType::Ears => EARS_METHODS,
        ClientType::External => EXTERNAL_METHODS,
    }
}

/// One authenticated connection.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    /// Connection id assigned at connect time.
    pub id: String,
    /// Advertised role.
    pub client_type: ClientType,
    /// Method allowlist derived from the role.
    pub capabilities: Vec<String>,
    /// Always true for registered clients; connections fail closed before
    /// registration.
    pub authenticated: bool,
    /// Connect time (ms since epoch).
    pub connected_at_ms: u64,
}

impl ClientInfo {
    /// True when the capability set includes `method`.
    pub fn may_call(&self, method: &str) -> bool {
        self.capabilities.iter().any(|m| m == method)
    }
}

/// Registry of live authenticated connections.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<String, ClientInfo>,
}

impl ClientRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly authenticated connection and return its record.
    pub fn register(&self, id: &str, client_type: ClientType) -> ClientInfo {
        let info = ClientInfo {
            id: id.to_string(),
            client_type,
            capabilities: capabilities_for(client_type).iter().map(|s| s.to_string()).collect(),
            authenticated: true,
            connected_at_ms: now_ms(),
        };
        self.clients.insert(id.to_string(), info.clone());
        info
    }

    /// Drop a connection's record.
    pub fn remove(&self, id: &str) {
        self.clients.remove(id);
    }

    /// Snapshot of every live connection.
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        let mut all: Vec<ClientInfo> =
            self.clients.iter().map(|kv| kv.value().clone()).collect();
        all.sort_by(|a, b| a.connected_at_ms.cmp(&b.connected_at_ms));
        all
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True when nothing is connected.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
