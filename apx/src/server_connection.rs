// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Server-side connection protocol: spec.md §4.7 steps 1-7. Takes
// length-prefix-stripped frame bodies off one connection (a transport
// thread's `FrameReader` produces them) and drives the greeting
// handshake, definition-file ingestion, and port-file connect handshake
// against a shared `ServerCore`.
//
// Grounded on `hdds-discovery-server/src/server/connection.rs`'s
// `ClientConnection::process_message` dispatch loop, reworked from a
// fixed DDS discovery message set to APX's file-manager-mediated
// control/data split, and on `relay.rs`'s pattern of a thin per-connection
// task that only holds bookkeeping no other connection needs, with all
// shared state behind the core.
//
// The greeting line (spec.md §4.4's `RMFP/…` text) is not wrapped in the
// `rmf::Frame` kind-byte scheme; it is always the first framed message on
// a new connection, handled before any `Frame` is decoded.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, warn};

use crate::connection::ConnectionId;
use crate::error::{ApxError, ApxResult};
use crate::node::Node;
use crate::rmf::{self, ControlFrame, FileInfo, FileType, Frame};
use crate::server::{NodeId, ServerCore};

struct PendingDefinition {
    stem: String,
    bytes: Vec<u8>,
}

pub struct ServerConnectionHandler {
    core: Arc<ServerCore>,
    connection_id: ConnectionId,
    greeted: bool,
    /// Base address -> ingestion state, for definition files still
    /// streaming in (step 3-4).
    pending_definitions: HashMap<u32, PendingDefinition>,
    /// Base address -> node, for a remote-announced provide-port file
    /// (step 5-6); kept for the node's lifetime so later writes route
    /// the same way the first one did.
    provide_file_index: HashMap<u32, NodeId>,
    /// Base address -> node, for the require-port file this server
    /// published on the node's behalf (step 7).
    require_file_index: HashMap<u32, NodeId>,
    node_by_stem: HashMap<String, NodeId>,
}

impl ServerConnectionHandler {
    pub fn new(core: Arc<ServerCore>, connection_id: ConnectionId) -> ServerConnectionHandler {
        ServerConnectionHandler {
            core,
            connection_id,
            greeted: false,
            pending_definitions: HashMap::new(),
            provide_file_index: HashMap::new(),
            require_file_index: HashMap::new(),
            node_by_stem: HashMap::new(),
        }
    }

    /// Feed one fully-framed message body (its `numheader32` length prefix
    /// already stripped by the connection's `FrameReader`).
    pub fn handle_frame_body(&mut self, body: &[u8]) -> ApxResult<()> {
        if !self.greeted {
            let text = String::from_utf8_lossy(body).into_owned();
            self.core.with_connection_mut(self.connection_id, |conn| conn.accept_greeting(&text, 1, 2))?;
            self.greeted = true;
            return Ok(());
        }
        match rmf::decode_frame(body)? {
            Frame::Control(frame) => self.handle_control(frame),
            Frame::Data { address, more, payload } => self.handle_data(address, &payload, more),
        }
    }

    fn handle_control(&mut self, frame: ControlFrame) -> ApxResult<()> {
        match frame {
            ControlFrame::PublishFile(info) => self.handle_publish_file(info),
            ControlFrame::OpenFileRequest { address } => self.handle_open_file_request(address),
            ControlFrame::RevokeFile { address } => {
                self.pending_definitions.remove(&address);
                self.provide_file_index.remove(&address);
                Ok(())
            }
            ControlFrame::CloseFileRequest { .. } | ControlFrame::Acknowledge => Ok(()),
        }
    }

    /// spec.md §4.7 steps 3 and 5: the peer announces a file it owns.
    fn handle_publish_file(&mut self, info: FileInfo) -> ApxResult<()> {
        let stem = file_stem(&info.name);
        match info.file_type {
            FileType::Definition => {
                let address = info.address;
                self.core.with_connection_mut(self.connection_id, |conn| {
                    conn.file_manager.remote_publish(info.clone());
                    conn.file_manager.open_remote_file(address)
                })?;
                self.pending_definitions.insert(address, PendingDefinition { stem, bytes: Vec::new() });
                self.request_open(address)
            }
            FileType::ProvidePortData => {
                let Some(&node_id) = self.node_by_stem.get(&stem) else {
                    warn!(file = %info.name, "provide-port file published for an unknown node, ignoring");
                    return Ok(());
                };
                let address = info.address;
                self.core.with_connection_mut(self.connection_id, |conn| {
                    conn.file_manager.remote_publish(info.clone());
                    conn.file_manager.open_remote_file(address)
                })?;
                self.provide_file_index.insert(address, node_id);
                self.request_open(address)
            }
            FileType::RequirePortData | FileType::Log => Ok(()),
        }
    }

    /// spec.md §4.7 step 7: the peer opens one of our local files — here,
    /// always the node's require-port data file.
    fn handle_open_file_request(&mut self, address: u32) -> ApxResult<()> {
        self.core.with_connection_mut(self.connection_id, |conn| conn.file_manager.local_file_opened_by_peer(address))?;
        if let Some(&node_id) = self.require_file_index.get(&address) {
            self.core.connect_require_ports(node_id)?;
        }
        Ok(())
    }

    fn handle_data(&mut self, address: u32, payload: &[u8], more: bool) -> ApxResult<()> {
        let base = self.core.with_connection_mut(self.connection_id, |conn| Ok(conn.file_manager.base_address_for(address)))?;
        let Some(base) = base else {
            warn!(address, "data frame for an unpublished file address, ignoring");
            return Ok(());
        };

        let mut fragment = Vec::new();
        self.core.with_connection_mut(self.connection_id, |conn| {
            conn.file_manager.on_data_received(address, payload, more, |_, bytes| {
                fragment.extend_from_slice(bytes);
                Ok(())
            })
        })?;

        if self.pending_definitions.contains_key(&base) {
            let pending = self.pending_definitions.get_mut(&base).unwrap();
            pending.bytes.extend_from_slice(&fragment);
            if !more {
                let pending = self.pending_definitions.remove(&base).unwrap();
                self.finish_definition(pending);
            }
            return Ok(());
        }

        if let Some(&node_id) = self.provide_file_index.get(&base) {
            if !fragment.is_empty() {
                self.core.route_provide_write(node_id, address - base, &fragment)?;
            }
            if !more && !self.core.is_provide_connected(node_id) {
                self.core.connect_provide_ports(node_id)?;
            }
            return Ok(());
        }

        warn!(address, "data frame for an address this connection does not track, ignoring");
        Ok(())
    }

    /// spec.md §4.7 step 4. Parse, finalize, register, and publish the
    /// two port-data files. Any failure here is an "Error paths" case:
    /// log it and leave this node untouched by anything else on the
    /// connection.
    fn finish_definition(&mut self, pending: PendingDefinition) {
        // A second definition published under an already-registered base
        // name is rejected rather than replacing the live node instance,
        // matching `apx_server_connection_processNewDefinitionDataFile`'s
        // existing-node-instance lookup in the original implementation.
        if self.node_by_stem.contains_key(&pending.stem) {
            let err = ApxError::NodeAlreadyExists(pending.stem.clone());
            error!(node = %pending.stem, %err, "redefinition of an already-connected node, ignoring");
            return;
        }
        let text = match String::from_utf8(pending.bytes) {
            Ok(text) => text,
            Err(err) => {
                error!(node = %pending.stem, %err, "definition file is not valid UTF-8");
                return;
            }
        };
        let node = match Node::parse(&text) {
            Ok(node) => node,
            Err(err) => {
                error!(node = %pending.stem, %err, "failed to parse or finalize node definition");
                return;
            }
        };
        let node_id = match self.core.create_node(self.connection_id, &node) {
            Ok(id) => id,
            Err(err) => {
                error!(node = %pending.stem, %err, "failed to register node instance");
                return;
            }
        };
        self.node_by_stem.insert(pending.stem.clone(), node_id);
        match self.core.publish_port_data_files(node_id) {
            Ok((_provide_info, require_info)) => {
                self.require_file_index.insert(require_info.address, node_id);
            }
            Err(err) => {
                error!(node_id, %err, "failed to publish port-data files");
                if let Err(err) = self.core.detach_node(node_id) {
                    error!(node_id, %err, "failed to detach node after publish failure");
                }
            }
        }
    }

    fn request_open(&self, address: u32) -> ApxResult<()> {
        self.core.with_connection_mut(self.connection_id, |conn| {
            conn.outbound.send_frame(rmf::encode_frame(&Frame::Control(ControlFrame::OpenFileRequest { address })))
        })
    }
}

fn file_stem(name: &str) -> String {
    name.rsplit_once('.').map(|(stem, _)| stem.to_string()).unwrap_or_else(|| name.to_string())
}
