// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! APX node-definition parser, bytecode VM, RMF wire transport, and the
//! central routing server core.
//!
//! Module layout mirrors the pipeline a node definition goes through:
//! [`parser`] and [`signature`] turn `.apx` text into a raw AST,
//! [`node`] finalizes it (type resolution, pack lengths, derived
//! signatures), [`compiler`] turns each port's element into a
//! [`vm`] bytecode program, and [`node_info`] materializes the
//! per-node runtime view the server routes against. [`rmf`] is the wire
//! format; [`file_manager`], [`signature_map`], [`connection`],
//! [`server_connection`], and [`server`] implement the routing server
//! itself.

mod attributes;
mod compiler;
mod connection;
mod error;
mod file_manager;
mod node;
mod node_info;
mod parser;
mod rmf;
mod server;
mod server_connection;
mod signature;
mod signature_map;
mod types;
mod value;
mod vm;

pub use attributes::PortAttributes;
pub use compiler::{compile_pack, compile_unpack, Instruction, Program};
pub use connection::{frame_for_wire, Connection, ConnectionId, FrameReader, HandshakeState, OutboundHandle};
pub use error::{ApxError, ApxResult};
pub use file_manager::FileManager;
pub use node::{Node, Port};
pub use node_info::{ByteToPortMap, NodeInfo, NodeInfoMode, PortInfo};
pub use parser::{parse_document, RawNode, RawPort};
pub use rmf::{decode_frame, encode_frame, region, AddressHeader, ControlFrame, FileInfo, FileType, Frame, Greeting};
pub use server::{spawn_gc_thread, NodeId, NodeInstance, ServerCore};
pub use server_connection::ServerConnectionHandler;
pub use signature::parse_data_signature;
pub use signature_map::{ConnectorChange, ConnectorChangeKind, PortRef, PortSignatureMap};
pub use types::{ArrayLen, BaseType, DataElement, DataType, NumericRange, TypeRef};
pub use value::Value;
pub use vm::{pack, pack_into, unpack, unpack_from};
