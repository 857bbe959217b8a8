// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// RMF control frames: spec.md §4.4.
//
// Each control frame is a 16-bit little-endian opcode followed by its
// body. `FileInfo`'s shape (address, size, type tag, digest type, digest
// bytes) follows `original_source/apx/include/apx/file_info.h`'s
// `rmf_fileInfo_t`; SHA-256 is the digest algorithm (§"Supplemented
// features" in the expanded specification), computed with `sha2` the way
// the rest of this crate reaches for the pack's cryptography crates rather
// than hand-rolling a hash.

use sha2::{Digest, Sha256};

use crate::error::{ApxError, ApxResult};

pub const DIGEST_NONE: u8 = 0;
pub const DIGEST_SHA256: u8 = 1;
pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Definition,
    ProvidePortData,
    RequirePortData,
    Log,
}

impl FileType {
    fn as_byte(self) -> u8 {
        match self {
            FileType::Definition => 0,
            FileType::ProvidePortData => 1,
            FileType::RequirePortData => 2,
            FileType::Log => 3,
        }
    }

    fn from_byte(b: u8) -> ApxResult<Self> {
        Ok(match b {
            0 => FileType::Definition,
            1 => FileType::ProvidePortData,
            2 => FileType::RequirePortData,
            3 => FileType::Log,
            other => return Err(ApxError::InvalidMsg(format!("unknown file type byte: {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub address: u32,
    pub size: u32,
    pub file_type: FileType,
    pub name: String,
    pub digest_type: u8,
    pub digest: [u8; DIGEST_LEN],
}

impl FileInfo {
    pub fn new(address: u32, size: u32, file_type: FileType, name: impl Into<String>) -> FileInfo {
        FileInfo { address, size, file_type, name: name.into(), digest_type: DIGEST_NONE, digest: [0; DIGEST_LEN] }
    }

    /// Attach a SHA-256 digest of `contents`, as definition files do so
    /// peers can detect a stale cached copy.
    pub fn with_sha256(mut self, contents: &[u8]) -> FileInfo {
        let mut hasher = Sha256::new();
        hasher.update(contents);
        self.digest = hasher.finalize().into();
        self.digest_type = DIGEST_SHA256;
        self
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.push(self.file_type.as_byte());
        out.push(self.digest_type);
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out
    }

    fn decode(buf: &[u8]) -> ApxResult<FileInfo> {
        if buf.len() < 4 + 4 + 1 + 1 + DIGEST_LEN {
            return Err(ApxError::BufferBoundary { offset: buf.len() });
        }
        let address = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let file_type = FileType::from_byte(buf[8])?;
        let digest_type = buf[9];
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[10..10 + DIGEST_LEN]);
        let name_bytes = &buf[10 + DIGEST_LEN..];
        let end = name_bytes.iter().position(|&b| b == 0).ok_or(ApxError::InvalidMsg("file info name not null-terminated".into()))?;
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
        Ok(FileInfo { address, size, file_type, name, digest_type, digest })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum Opcode {
    PublishFile = 1,
    RevokeFile = 2,
    OpenFileRequest = 3,
    CloseFileRequest = 4,
    Acknowledge = 5,
}

impl Opcode {
    fn from_u16(v: u16) -> ApxResult<Self> {
        Ok(match v {
            1 => Opcode::PublishFile,
            2 => Opcode::RevokeFile,
            3 => Opcode::OpenFileRequest,
            4 => Opcode::CloseFileRequest,
            5 => Opcode::Acknowledge,
            other => return Err(ApxError::InvalidMsg(format!("unknown control opcode: {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    PublishFile(FileInfo),
    RevokeFile { address: u32 },
    OpenFileRequest { address: u32 },
    CloseFileRequest { address: u32 },
    Acknowledge,
}

impl ControlFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let opcode = match self {
            ControlFrame::PublishFile(_) => Opcode::PublishFile,
            ControlFrame::RevokeFile { .. } => Opcode::RevokeFile,
            ControlFrame::OpenFileRequest { .. } => Opcode::OpenFileRequest,
            ControlFrame::CloseFileRequest { .. } => Opcode::CloseFileRequest,
            ControlFrame::Acknowledge => Opcode::Acknowledge,
        };
        out.extend_from_slice(&(opcode as u16).to_le_bytes());
        match self {
            ControlFrame::PublishFile(info) => out.extend_from_slice(&info.encode()),
            ControlFrame::RevokeFile { address }
            | ControlFrame::OpenFileRequest { address }
            | ControlFrame::CloseFileRequest { address } => out.extend_from_slice(&address.to_le_bytes()),
            ControlFrame::Acknowledge => {}
        }
        out
    }

    pub fn decode(buf: &[u8]) -> ApxResult<ControlFrame> {
        if buf.len() < 2 {
            return Err(ApxError::BufferBoundary { offset: buf.len() });
        }
        let opcode = Opcode::from_u16(u16::from_le_bytes([buf[0], buf[1]]))?;
        let body = &buf[2..];
        Ok(match opcode {
            Opcode::PublishFile => ControlFrame::PublishFile(FileInfo::decode(body)?),
            Opcode::RevokeFile => ControlFrame::RevokeFile { address: read_address(body)? },
            Opcode::OpenFileRequest => ControlFrame::OpenFileRequest { address: read_address(body)? },
            Opcode::CloseFileRequest => ControlFrame::CloseFileRequest { address: read_address(body)? },
            Opcode::Acknowledge => ControlFrame::Acknowledge,
        })
    }
}

fn read_address(body: &[u8]) -> ApxResult<u32> {
    let bytes = body.get(0..4).ok_or(ApxError::BufferBoundary { offset: 0 })?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_file_round_trips_with_digest() {
        let info = FileInfo::new(0x4000_0000, 128, FileType::Definition, "Node.apx").with_sha256(b"hello");
        let frame = ControlFrame::PublishFile(info.clone());
        let encoded = frame.encode();
        let decoded = ControlFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, ControlFrame::PublishFile(info));
    }

    #[test]
    fn address_frames_round_trip() {
        for frame in [
            ControlFrame::RevokeFile { address: 7 },
            ControlFrame::OpenFileRequest { address: 8 },
            ControlFrame::CloseFileRequest { address: 9 },
        ] {
            let encoded = frame.encode();
            assert_eq!(ControlFrame::decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn acknowledge_has_no_body() {
        let encoded = ControlFrame::Acknowledge.encode();
        assert_eq!(encoded.len(), 2);
        assert_eq!(ControlFrame::decode(&encoded).unwrap(), ControlFrame::Acknowledge);
    }
}
