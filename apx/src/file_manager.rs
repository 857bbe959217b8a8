// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Per-connection file manager: spec.md §4.5. Tracks two address-keyed
// tables (local files we announced, remote files the peer announced) and
// reassembles fragmented writes. Grounded on the `HashMap`-indexed
// registry idiom of `hdds-discovery-server/src/server/registry.rs`
// (`ParticipantRegistry`'s participants/endpoints maps), generalized from
// GUID keys to APX file addresses.

use std::collections::HashMap;

use crate::error::{ApxError, ApxResult};
use crate::rmf::{region, FileInfo, FileType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalState {
    Created,
    Announced,
}

#[derive(Debug, Clone)]
struct LocalFile {
    info: FileInfo,
    state: LocalState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteOpenState {
    Unopened,
    PendingOpen,
    Open,
}

#[derive(Debug, Clone)]
struct RemoteFile {
    info: FileInfo,
    open_state: RemoteOpenState,
    /// Address immediately following the last byte written, used to check
    /// fragment contiguity.
    next_expected_address: u32,
}

/// Per-connection table of local and remote files, plus the reassembly
/// state for in-flight fragmented writes.
#[derive(Debug, Default)]
pub struct FileManager {
    local: HashMap<u32, LocalFile>,
    remote: HashMap<u32, RemoteFile>,
    next_port_data_address: u32,
    next_definition_address: u32,
    closed: bool,
}

impl FileManager {
    pub fn new() -> FileManager {
        FileManager {
            local: HashMap::new(),
            remote: HashMap::new(),
            next_port_data_address: region::PORT_DATA_START,
            next_definition_address: region::DEFINITION_START,
            closed: false,
        }
    }

    /// Allocate the next free address in the region matching `file_type`
    /// and create (but do not announce) a local file record.
    pub fn create_local_file(&mut self, name: impl Into<String>, size: u32, file_type: FileType) -> ApxResult<u32> {
        if self.closed {
            return Err(ApxError::Transmit("file manager is closed".into()));
        }
        let address = match file_type {
            FileType::Definition => {
                let a = self.next_definition_address;
                self.next_definition_address += size.max(1);
                a
            }
            FileType::ProvidePortData | FileType::RequirePortData | FileType::Log => {
                let a = self.next_port_data_address;
                self.next_port_data_address += size.max(1);
                a
            }
        };
        let info = FileInfo::new(address, size, file_type, name);
        self.local.insert(address, LocalFile { info, state: LocalState::Created });
        Ok(address)
    }

    /// Mark a previously created local file as announced. Returns the
    /// `publish-file` control frame body the connection should send.
    pub fn publish(&mut self, address: u32) -> ApxResult<FileInfo> {
        let file = self.local.get_mut(&address).ok_or(ApxError::MissingFile(format!("local file {address:#x}")))?;
        file.state = LocalState::Announced;
        Ok(file.info.clone())
    }

    /// Record a file the peer announced via `publish-file`.
    pub fn remote_publish(&mut self, info: FileInfo) {
        let address = info.address;
        self.remote.insert(
            address,
            RemoteFile { info, open_state: RemoteOpenState::Unopened, next_expected_address: address },
        );
    }

    /// Mark a remote file as pending open. Returns an error if the file is
    /// unknown (the peer never announced it).
    pub fn open_remote_file(&mut self, address: u32) -> ApxResult<()> {
        let file = self.remote.get_mut(&address).ok_or(ApxError::MissingFile(format!("remote file {address:#x}")))?;
        file.open_state = RemoteOpenState::PendingOpen;
        file.next_expected_address = address;
        Ok(())
    }

    /// A remote `open-file-request` for one of our own local files: from
    /// this point writes to it may be sent.
    pub fn local_file_opened_by_peer(&self, address: u32) -> ApxResult<()> {
        if self.local.contains_key(&address) {
            Ok(())
        } else {
            Err(ApxError::MissingFile(format!("local file {address:#x}")))
        }
    }

    /// Split `bytes` into data-frame fragments of at most `max_packet_size`
    /// bytes, each tagged with its absolute address and more-bit.
    pub fn write_to_remote_file(&mut self, address: u32, bytes: &[u8], max_packet_size: usize) -> ApxResult<Vec<(u32, Vec<u8>, bool)>> {
        if self.closed {
            return Err(ApxError::Transmit("file manager is closed".into()));
        }
        if !self.remote.contains_key(&address) {
            return Err(ApxError::MissingFile(format!("remote file {address:#x}")));
        }
        let chunk_size = max_packet_size.max(1);
        let mut frames = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let end = (offset + chunk_size).min(bytes.len());
            let more = end < bytes.len();
            frames.push((address + offset as u32, bytes[offset..end].to_vec(), more));
            offset = end;
        }
        if frames.is_empty() {
            frames.push((address, Vec::new(), false));
        }
        Ok(frames)
    }

    /// Deliver a received fragment to the file it addresses, checking
    /// contiguity, and hand the reassembled payload to `on_complete` once
    /// the more-bit clears.
    pub fn on_data_received(
        &mut self,
        address: u32,
        bytes: &[u8],
        more: bool,
        mut on_complete: impl FnMut(u32, &[u8]) -> ApxResult<()>,
    ) -> ApxResult<()> {
        let file = self.remote_file_for_address(address)?;
        if address != file.next_expected_address && file.open_state == RemoteOpenState::Open {
            return Err(ApxError::InvalidMsg(format!(
                "non-contiguous fragment at {address:#x}, expected {:#x}",
                file.next_expected_address
            )));
        }
        file.next_expected_address = address + bytes.len() as u32;
        file.open_state = RemoteOpenState::Open;
        let base_address = self.file_base_address(address)?;
        on_complete(base_address, bytes)?;
        if !more {
            if let Some(file) = self.remote.get_mut(&base_address) {
                file.next_expected_address = base_address;
            }
        }
        Ok(())
    }

    /// The base address of the remote file covering `address`, if any.
    /// Lets a caller holding only an address (from an incoming data frame)
    /// find which announced file it belongs to.
    pub fn base_address_for(&self, address: u32) -> Option<u32> {
        self.file_base_address(address).ok()
    }

    fn remote_file_for_address(&mut self, address: u32) -> ApxResult<&mut RemoteFile> {
        let base = self.file_base_address(address)?;
        self.remote.get_mut(&base).ok_or(ApxError::MissingFile(format!("remote file {base:#x}")))
    }

    fn file_base_address(&self, address: u32) -> ApxResult<u32> {
        self.remote
            .iter()
            .find(|(&start, f)| address >= start && address < start + f.info.size.max(1))
            .map(|(&start, _)| start)
            .ok_or(ApxError::MissingFile(format!("no remote file covers address {address:#x}")))
    }

    /// Release every file; subsequent writes fail with *transmit-error*.
    pub fn close(&mut self) {
        self.local.clear();
        self.remote.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn local_file(&self, address: u32) -> Option<&FileInfo> {
        self.local.get(&address).map(|f| &f.info)
    }

    pub fn remote_file(&self, address: u32) -> Option<&FileInfo> {
        self.remote.get(&address).map(|f| &f.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_publish_local_file() {
        let mut fm = FileManager::new();
        let addr = fm.create_local_file("Node.out", 16, FileType::ProvidePortData).unwrap();
        let info = fm.publish(addr).unwrap();
        assert_eq!(info.address, addr);
        assert_eq!(info.size, 16);
    }

    #[test]
    fn remote_publish_then_open() {
        let mut fm = FileManager::new();
        let info = FileInfo::new(0x4000_0000, 64, FileType::Definition, "Node.apx");
        fm.remote_publish(info.clone());
        fm.open_remote_file(0x4000_0000).unwrap();
        assert_eq!(fm.remote_file(0x4000_0000).unwrap().name, "Node.apx");
    }

    #[test]
    fn open_unknown_remote_file_fails() {
        let mut fm = FileManager::new();
        assert!(fm.open_remote_file(0x4000_0000).is_err());
    }

    #[test]
    fn write_to_remote_file_fragments_by_max_packet_size() {
        let mut fm = FileManager::new();
        fm.remote_publish(FileInfo::new(0, 10, FileType::ProvidePortData, "Node.out"));
        let frames = fm.write_to_remote_file(0, &[1, 2, 3, 4, 5], 2).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], (0, vec![1, 2], true));
        assert_eq!(frames[1], (2, vec![3, 4], true));
        assert_eq!(frames[2], (4, vec![5], false));
    }

    #[test]
    fn on_data_received_reassembles_contiguous_fragments() {
        let mut fm = FileManager::new();
        fm.remote_publish(FileInfo::new(0, 10, FileType::ProvidePortData, "Node.out"));
        let mut received = Vec::new();
        fm.on_data_received(0, &[1, 2], true, |_, b| {
            received.extend_from_slice(b);
            Ok(())
        })
        .unwrap();
        fm.on_data_received(2, &[3, 4], false, |_, b| {
            received.extend_from_slice(b);
            Ok(())
        })
        .unwrap();
        assert_eq!(received, vec![1, 2, 3, 4]);
    }

    #[test]
    fn non_contiguous_fragment_is_invalid_msg() {
        let mut fm = FileManager::new();
        fm.remote_publish(FileInfo::new(0, 10, FileType::ProvidePortData, "Node.out"));
        fm.on_data_received(0, &[1, 2], true, |_, _| Ok(())).unwrap();
        let err = fm.on_data_received(5, &[9], false, |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, ApxError::InvalidMsg(_)));
    }

    #[test]
    fn writes_after_close_are_transmit_errors() {
        let mut fm = FileManager::new();
        fm.remote_publish(FileInfo::new(0, 10, FileType::ProvidePortData, "Node.out"));
        fm.close();
        let err = fm.write_to_remote_file(0, &[1], 16).unwrap_err();
        assert!(matches!(err, ApxError::Transmit(_)));
    }
}
