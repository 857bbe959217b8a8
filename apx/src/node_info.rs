// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Node info: spec.md §4.3. Materialized once per node instance, read-only
// afterward. Grounded on the materialize-once type cache idiom: finalize
// everything that can be precomputed (offsets, programs, reverse maps,
// initial-data blobs) exactly once so the hot routing path in
// `server.rs` never touches the parser or compiler again.

use crate::compiler::{self, Program};
use crate::error::ApxResult;
use crate::node::{Node, Port};
use crate::value::Value;
use crate::vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeInfoMode {
    /// Reverse byte->port map built for require ports (client side).
    Client,
    /// Reverse byte->port map built for provide ports (server side).
    Server,
}

#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub offset: u32,
    pub data_size: u32,
    pub is_dynamic: bool,
    pub queue_len: Option<u32>,
    pub signature: String,
    pub pack_program: Program,
    pub unpack_program: Program,
}

/// Maps a byte offset within a side's data buffer back to the port that
/// owns it, via binary search over sorted (offset, end) spans.
#[derive(Debug, Clone, Default)]
pub struct ByteToPortMap {
    /// Sorted by `offset`; parallel to the owning side's port list by index.
    spans: Vec<(u32, u32, usize)>,
}

impl ByteToPortMap {
    fn build(ports: &[PortInfo]) -> Self {
        let mut spans: Vec<(u32, u32, usize)> =
            ports.iter().enumerate().map(|(idx, p)| (p.offset, p.offset + p.data_size, idx)).collect();
        spans.sort_by_key(|&(offset, _, _)| offset);
        ByteToPortMap { spans }
    }

    /// Binary search for the port index whose span contains `offset`.
    pub fn lookup(&self, offset: u32) -> Option<usize> {
        let idx = self.spans.partition_point(|&(start, _, _)| start <= offset);
        if idx == 0 {
            return None;
        }
        let (start, end, port_idx) = self.spans[idx - 1];
        if offset >= start && offset < end {
            Some(port_idx)
        } else {
            None
        }
    }

    /// Every port index whose span overlaps the half-open byte range
    /// `[start, end)`, in port-index order.
    pub fn ports_touching(&self, start: u32, end: u32) -> Vec<usize> {
        let mut out: Vec<usize> =
            self.spans.iter().filter(|&&(s, e, _)| s < end && e > start).map(|&(_, _, idx)| idx).collect();
        out.sort_unstable();
        out
    }
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub mode: NodeInfoMode,
    pub requires: Vec<PortInfo>,
    pub provides: Vec<PortInfo>,
    pub require_byte_map: Option<ByteToPortMap>,
    pub provide_byte_map: Option<ByteToPortMap>,
    pub require_init_blob: Vec<u8>,
    pub provide_init_blob: Vec<u8>,
}

impl NodeInfo {
    pub fn build(node: &Node, mode: NodeInfoMode) -> ApxResult<NodeInfo> {
        let requires = build_port_infos(&node.requires)?;
        let provides = build_port_infos(&node.provides)?;

        let require_byte_map = matches!(mode, NodeInfoMode::Client).then(|| ByteToPortMap::build(&requires));
        let provide_byte_map = matches!(mode, NodeInfoMode::Server).then(|| ByteToPortMap::build(&provides));

        let require_init_blob = build_init_blob(&node.requires, &requires)?;
        let provide_init_blob = build_init_blob(&node.provides, &provides)?;

        Ok(NodeInfo {
            name: node.name.clone(),
            mode,
            requires,
            provides,
            require_byte_map,
            provide_byte_map,
            require_init_blob,
            provide_init_blob,
        })
    }

    pub fn require_port_by_name(&self, name: &str) -> Option<&PortInfo> {
        self.requires.iter().find(|p| p.name == name)
    }

    pub fn provide_port_by_name(&self, name: &str) -> Option<&PortInfo> {
        self.provides.iter().find(|p| p.name == name)
    }
}

fn build_port_infos(ports: &[Port]) -> ApxResult<Vec<PortInfo>> {
    let mut offset = 0u32;
    let mut out = Vec::with_capacity(ports.len());
    for port in ports {
        let data_size = port.element.pack_len.unwrap_or(0);
        let pack_program = compiler::compile_pack(&port.element)?;
        let unpack_program = compiler::compile_unpack(&port.element)?;
        out.push(PortInfo {
            name: port.name.clone(),
            offset,
            data_size,
            is_dynamic: port.element.array_len.is_dynamic(),
            queue_len: port.attributes.queue_len,
            signature: port.signature.clone(),
            pack_program,
            unpack_program,
        });
        offset += data_size;
    }
    Ok(out)
}

fn build_init_blob(ports: &[Port], infos: &[PortInfo]) -> ApxResult<Vec<u8>> {
    let total: u32 = infos.iter().map(|p| p.data_size).sum();
    let mut blob = vec![0u8; total as usize];
    for (port, info) in ports.iter().zip(infos) {
        let value = port.attributes.init_value.clone().unwrap_or_else(|| zero_value(&port.element));
        let start = info.offset as usize;
        let end = start + info.data_size as usize;
        vm::pack_into(&info.pack_program, &value, &mut blob[start..end])?;
    }
    Ok(blob)
}

/// A structurally valid all-zero value for an element with no declared
/// initial value, used so every port has a well-defined reset state.
fn zero_value(elem: &crate::types::DataElement) -> Value {
    use crate::types::{ArrayLen, BaseType};

    if elem.array_len.is_array() {
        let n = elem.array_len.max_len().unwrap_or(0);
        let count = if matches!(elem.array_len, ArrayLen::Dynamic(_)) { 0 } else { n };
        if elem.is_string() {
            return Value::Str(String::new());
        }
        let item = crate::types::DataElement { array_len: ArrayLen::None, ..elem.clone() };
        return Value::Array((0..count).map(|_| zero_value(&item)).collect());
    }
    if elem.is_record() {
        let mut map = std::collections::BTreeMap::new();
        for (name, child) in &elem.children {
            map.insert(name.clone(), zero_value(child));
        }
        return Value::Record(map);
    }
    match elem.base_type {
        BaseType::U8 => Value::U8(0),
        BaseType::U16 => Value::U16(0),
        BaseType::U32 => Value::U32(0),
        BaseType::U64 => Value::U64(0),
        BaseType::S8 => Value::S8(0),
        BaseType::S16 => Value::S16(0),
        BaseType::S32 => Value::S32(0),
        BaseType::S64 => Value::S64(0),
        BaseType::String => Value::Str(String::new()),
        _ => Value::U8(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_client_side_byte_map_for_require_ports() {
        let doc = concat!(
            "APX/1.2\n",
            "N\"N\"\n",
            "R\"A\"C:=1\n",
            "R\"B\"S:=2\n",
        );
        let node = Node::parse(doc).unwrap();
        let info = NodeInfo::build(&node, NodeInfoMode::Client).unwrap();
        assert!(info.require_byte_map.is_some());
        assert!(info.provide_byte_map.is_none());
        let map = info.require_byte_map.as_ref().unwrap();
        assert_eq!(map.lookup(0), Some(0));
        assert_eq!(map.lookup(1), Some(1));
        assert_eq!(map.lookup(2), Some(1));
        assert_eq!(map.lookup(3), None);
    }

    #[test]
    fn init_blob_matches_scenario_s1() {
        let doc = concat!("APX/1.2\n", "N\"Node\"\n", "R\"GearSelectionMode\"C(0,7):=7\n");
        let node = Node::parse(doc).unwrap();
        let info = NodeInfo::build(&node, NodeInfoMode::Client).unwrap();
        assert_eq!(info.require_init_blob, vec![0x07]);
        assert!(info.provide_init_blob.is_empty());
    }

    #[test]
    fn offsets_are_sequential_per_side() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "P\"A\"L\n", "P\"B\"C\n");
        let node = Node::parse(doc).unwrap();
        let info = NodeInfo::build(&node, NodeInfoMode::Server).unwrap();
        assert_eq!(info.provides[0].offset, 0);
        assert_eq!(info.provides[1].offset, 4);
    }

    #[test]
    fn default_init_value_is_zeroed_when_absent() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "R\"X\"S\n");
        let node = Node::parse(doc).unwrap();
        let info = NodeInfo::build(&node, NodeInfoMode::Client).unwrap();
        assert_eq!(info.require_init_blob, vec![0, 0]);
    }
}
