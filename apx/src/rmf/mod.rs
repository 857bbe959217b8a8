// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

pub mod control;
pub mod framing;
pub mod greeting;

pub use control::{ControlFrame, FileInfo, FileType};
pub use framing::{decode_numheader32, encode_numheader32, region, AddressHeader};
pub use greeting::Greeting;

use crate::error::{ApxError, ApxResult};

/// One fully-decoded message from the wire: either a routed data frame or
/// a control frame, per spec.md §4.4. The retrieved original sources do
/// not preserve the exact byte that distinguishes the two inside one
/// numheader32-prefixed message, so this implementation makes it explicit:
/// a single kind byte (`0x00` data, `0x01` control) precedes the frame
/// body described in §4.4. This is recorded as an open-question decision
/// in this crate's design notes.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data { address: u32, more: bool, payload: Vec<u8> },
    Control(ControlFrame),
}

const KIND_DATA: u8 = 0x00;
const KIND_CONTROL: u8 = 0x01;

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    match frame {
        Frame::Data { address, more, payload } => {
            let header = AddressHeader::for_address(*address, *more);
            let mut out = vec![KIND_DATA];
            out.extend_from_slice(&header.encode());
            out.extend_from_slice(payload);
            out
        }
        Frame::Control(control) => {
            let mut out = vec![KIND_CONTROL];
            out.extend_from_slice(&control.encode());
            out
        }
    }
}

pub fn decode_frame(buf: &[u8]) -> ApxResult<Frame> {
    let &kind = buf.first().ok_or(ApxError::BufferBoundary { offset: 0 })?;
    let body = &buf[1..];
    match kind {
        KIND_DATA => {
            let (header, consumed) = AddressHeader::decode(body)?;
            let payload = body.get(consumed..).ok_or(ApxError::BufferBoundary { offset: consumed })?;
            Ok(Frame::Data { address: header.address, more: header.more, payload: payload.to_vec() })
        }
        KIND_CONTROL => Ok(Frame::Control(ControlFrame::decode(body)?)),
        other => Err(ApxError::InvalidMsg(format!("unknown frame kind byte: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trips() {
        let frame = Frame::Data { address: 100, more: false, payload: vec![1, 2, 3] };
        let encoded = encode_frame(&frame);
        assert_eq!(decode_frame(&encoded).unwrap(), frame);
    }

    #[test]
    fn control_frame_round_trips() {
        let frame = Frame::Control(ControlFrame::Acknowledge);
        let encoded = encode_frame(&frame);
        assert_eq!(decode_frame(&encoded).unwrap(), frame);
    }
}
