// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Port signature map: spec.md §4.6. Keyed by the derived signature string,
// each entry holds two insertion-ordered port lists (providers,
// requesters). Grounded on
// `hdds-discovery-server/src/server/registry.rs`'s `topic_index:
// HashMap<String, Vec<Guid>>`, generalized from DDS topic matching (which
// tolerates wildcards and QoS compatibility) to APX's exact-string
// matching, per `hdds/src/core/discovery/matcher/topic.rs`'s
// `is_type_match` shape.

use std::collections::HashMap;

/// Identifies one port on one node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node_id: u32,
    pub port_index: usize,
}

/// A pending connector change queued for a node's require-port side.
/// The server core applies these after releasing the signature-map lock
/// (spec.md §5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorChangeKind {
    Connected { provide_port: PortRef },
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorChange {
    pub require_port: PortRef,
    pub kind: ConnectorChangeKind,
}

#[derive(Debug, Default)]
struct Entry {
    providers: Vec<PortRef>,
    requesters: Vec<PortRef>,
    preferred_provider: Option<PortRef>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.requesters.is_empty()
    }

    fn chosen_provider(&self) -> Option<PortRef> {
        self.preferred_provider.or_else(|| self.providers.first().copied())
    }
}

/// Signature string -> provider/requester lists, plus per-node queues of
/// connector changes awaiting propagation.
#[derive(Debug, Default)]
pub struct PortSignatureMap {
    entries: HashMap<String, Entry>,
    connector_tables: HashMap<u32, Vec<ConnectorChange>>,
}

impl PortSignatureMap {
    pub fn new() -> PortSignatureMap {
        PortSignatureMap::default()
    }

    /// Connect one provide port. Existing requesters on the same
    /// signature are queued a `Connected` change against their node.
    pub fn connect_provide_port(&mut self, signature: &str, port: PortRef) {
        let entry = self.entries.entry(signature.to_string()).or_default();
        entry.providers.push(port);
        for requester in entry.requesters.clone() {
            self.queue(requester.node_id, ConnectorChange {
                require_port: requester,
                kind: ConnectorChangeKind::Connected { provide_port: port },
            });
        }
    }

    /// Connect one require port. If a provider already exists on the same
    /// signature (preferred, else first by insertion order), the require
    /// port's own node is queued a `Connected` change.
    pub fn connect_require_port(&mut self, signature: &str, port: PortRef) {
        let entry = self.entries.entry(signature.to_string()).or_default();
        entry.requesters.push(port);
        if let Some(provide_port) = entry.chosen_provider() {
            self.queue(port.node_id, ConnectorChange {
                require_port: port,
                kind: ConnectorChangeKind::Connected { provide_port },
            });
        }
    }

    /// Disconnect one provide port. Remaining requesters are queued a
    /// `Disconnected` change so they reset to their initial value.
    pub fn disconnect_provide_port(&mut self, signature: &str, port: PortRef) {
        let Some(entry) = self.entries.get_mut(signature) else { return };
        entry.providers.retain(|&p| p != port);
        if entry.preferred_provider == Some(port) {
            entry.preferred_provider = None;
        }
        let requesters = entry.requesters.clone();
        let is_empty = entry.is_empty();
        for requester in requesters {
            self.queue(requester.node_id, ConnectorChange { require_port: requester, kind: ConnectorChangeKind::Disconnected });
        }
        if is_empty {
            self.entries.remove(signature);
        }
    }

    /// Disconnect one require port. No propagation: the port is leaving.
    pub fn disconnect_require_port(&mut self, signature: &str, port: PortRef) {
        let Some(entry) = self.entries.get_mut(signature) else { return };
        entry.requesters.retain(|&p| p != port);
        if entry.is_empty() {
            self.entries.remove(signature);
        }
    }

    /// Pin a specific provider as the one new requesters bind to.
    pub fn set_preferred_provider(&mut self, signature: &str, port: PortRef) {
        if let Some(entry) = self.entries.get_mut(signature) {
            if entry.providers.contains(&port) {
                entry.preferred_provider = Some(port);
            }
        }
    }

    pub fn providers(&self, signature: &str) -> &[PortRef] {
        self.entries.get(signature).map(|e| e.providers.as_slice()).unwrap_or(&[])
    }

    pub fn requesters(&self, signature: &str) -> &[PortRef] {
        self.entries.get(signature).map(|e| e.requesters.as_slice()).unwrap_or(&[])
    }

    fn queue(&mut self, node_id: u32, change: ConnectorChange) {
        self.connector_tables.entry(node_id).or_default().push(change);
    }

    /// Node ids that currently have queued connector changes.
    pub fn modified_nodes(&self) -> Vec<u32> {
        self.connector_tables.iter().filter(|(_, v)| !v.is_empty()).map(|(&id, _)| id).collect()
    }

    /// Drain and return one node's queued connector changes.
    pub fn take_connector_changes(&mut self, node_id: u32) -> Vec<ConnectorChange> {
        self.connector_tables.remove(&node_id).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(node_id: u32, idx: usize) -> PortRef {
        PortRef { node_id, port_index: idx }
    }

    #[test]
    fn connecting_requester_after_provider_queues_connect_change() {
        let mut map = PortSignatureMap::new();
        map.connect_provide_port("C", port(1, 0));
        map.connect_require_port("C", port(2, 0));
        let changes = map.take_connector_changes(2);
        assert_eq!(changes, vec![ConnectorChange {
            require_port: port(2, 0),
            kind: ConnectorChangeKind::Connected { provide_port: port(1, 0) },
        }]);
    }

    #[test]
    fn connecting_provider_after_requester_queues_change_on_requester_node() {
        let mut map = PortSignatureMap::new();
        map.connect_require_port("C", port(2, 0));
        map.connect_provide_port("C", port(1, 0));
        let changes = map.take_connector_changes(2);
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0].kind, ConnectorChangeKind::Connected { .. }));
    }

    #[test]
    fn preferred_provider_wins_over_first() {
        let mut map = PortSignatureMap::new();
        map.connect_provide_port("C", port(1, 0));
        map.connect_provide_port("C", port(3, 0));
        map.set_preferred_provider("C", port(3, 0));
        map.connect_require_port("C", port(2, 0));
        let changes = map.take_connector_changes(2);
        assert_eq!(changes[0].kind, ConnectorChangeKind::Connected { provide_port: port(3, 0) });
    }

    #[test]
    fn disconnecting_provider_resets_requesters() {
        let mut map = PortSignatureMap::new();
        map.connect_provide_port("C", port(1, 0));
        map.connect_require_port("C", port(2, 0));
        map.take_connector_changes(2);
        map.disconnect_provide_port("C", port(1, 0));
        let changes = map.take_connector_changes(2);
        assert_eq!(changes, vec![ConnectorChange { require_port: port(2, 0), kind: ConnectorChangeKind::Disconnected }]);
    }

    #[test]
    fn entry_removed_once_both_sides_empty() {
        let mut map = PortSignatureMap::new();
        map.connect_provide_port("C", port(1, 0));
        map.disconnect_provide_port("C", port(1, 0));
        assert!(map.providers("C").is_empty());
        assert!(!map.entries.contains_key("C"));
    }

    #[test]
    fn disconnecting_requester_does_not_queue_changes() {
        let mut map = PortSignatureMap::new();
        map.connect_provide_port("C", port(1, 0));
        map.connect_require_port("C", port(2, 0));
        map.take_connector_changes(2);
        map.disconnect_require_port("C", port(2, 0));
        assert!(map.take_connector_changes(2).is_empty());
    }
}
