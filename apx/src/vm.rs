// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Stack-based virtual machine: spec.md §4.2 ("VM execution").
//
// Walks a compiled program's instruction stream to pack a `Value` tree into
// bytes, or unpack bytes back into a `Value` tree. The buffer-offset
// bookkeeping and bounds checks are grounded on the bounds-checked byte
// cursor idiom; the record/array recursion mirrors `compiler::compile_element`
// one-for-one so the two stay in lockstep without sharing mutable state.

use std::collections::BTreeMap;

use crate::compiler::{self, ArrayWidth, Instruction, Program, ScalarVariant};
use crate::error::{ApxError, ApxResult};
use crate::types::DataElement;
use crate::value::Value;

/// Pack `value` into a freshly compiled program for `element`. The
/// returned buffer is truncated to the number of bytes actually written,
/// which is less than the declared maximum when `element` contains a
/// dynamic array.
pub fn pack(element: &DataElement, value: &Value) -> ApxResult<Vec<u8>> {
    let program = compiler::compile_pack(element)?;
    let mut buf = vec![0u8; program.declared_payload_size()? as usize];
    let written = pack_into_reporting(&program, value, &mut buf)?;
    buf.truncate(written);
    Ok(buf)
}

/// Unpack a `Value` tree from a freshly compiled program for `element`.
pub fn unpack(element: &DataElement, buf: &[u8]) -> ApxResult<Value> {
    let program = compiler::compile_unpack(element)?;
    unpack_from(&program, buf)
}

/// Pack `value` into `buf` using a precompiled program. `buf` need only be
/// as large as the number of bytes the pack actually produces; for a
/// program with a dynamic array that may be less than the program's
/// declared (maximum) payload size.
pub fn pack_into(program: &Program, value: &Value, buf: &mut [u8]) -> ApxResult<()> {
    pack_into_reporting(program, value, buf).map(|_| ())
}

/// Like `pack_into`, but returns the number of bytes actually written
/// (equal to the declared payload size unless a dynamic array packed
/// fewer than its maximum element count).
fn pack_into_reporting(program: &Program, value: &Value, buf: &mut [u8]) -> ApxResult<usize> {
    let declared = program.declared_payload_size()? as usize;
    let (_, offset) = exec_pack(program.body(), 0, value, buf, 0)?;
    if offset > declared {
        return Err(ApxError::Length(format!(
            "pack wrote {offset} bytes, program declares a maximum of {declared}"
        )));
    }
    Ok(offset)
}

/// Unpack a `Value` tree from `buf` using a precompiled program. `buf` need
/// only hold the bytes actually present on the wire, which may be less
/// than the program's declared (maximum) payload size for a dynamic array.
pub fn unpack_from(program: &Program, buf: &[u8]) -> ApxResult<Value> {
    let declared = program.declared_payload_size()? as usize;
    let (_, value, offset) = exec_unpack(program.body(), 0, buf, 0)?;
    if offset > declared {
        return Err(ApxError::Length(format!(
            "unpack read {offset} bytes, program declares a maximum of {declared}"
        )));
    }
    Ok(value)
}

fn peek_limit_check(body: &[u8], pos: usize) -> ApxResult<(Option<(i64, i64)>, usize)> {
    if pos >= body.len() {
        return Ok((None, pos));
    }
    match compiler::decode_next(body, pos)? {
        (Instruction::LimitCheck { min, max, .. }, next) => Ok((Some((min, max)), next)),
        _ => Ok((None, pos)),
    }
}

fn check_range(v: i64, range: Option<(i64, i64)>) -> ApxResult<()> {
    if let Some((min, max)) = range {
        if v < min || v > max {
            return Err(ApxError::Value(format!("{v} outside range ({min},{max})")));
        }
    }
    Ok(())
}

// ---- pack ----

fn exec_pack(body: &[u8], pos: usize, value: &Value, buf: &mut [u8], offset: usize) -> ApxResult<(usize, usize)> {
    let (instr, mut pos) = compiler::decode_next(body, pos)?;
    let Instruction::Scalar { variant, is_array } = instr else {
        return Err(ApxError::Read("expected scalar instruction".into()));
    };

    if is_array {
        let (array_instr, after_array) = compiler::decode_next(body, pos)?;
        let Instruction::Array { width: _, is_dynamic, max_len } = array_instr else {
            return Err(ApxError::Read("expected array instruction after flagged scalar".into()));
        };
        pos = after_array;

        if variant == ScalarVariant::Str {
            let s = value.as_str().ok_or_else(|| ApxError::DvType("expected string value".into()))?;
            let offset = pack_string(s, max_len, is_dynamic, buf, offset)?;
            return Ok((pos, offset));
        }

        let items = value.as_array().ok_or_else(|| ApxError::DvType("expected array value".into()))?;
        if is_dynamic {
            if items.len() as u32 > max_len {
                return Err(ApxError::Length(format!(
                    "dynamic array has {} elements, max is {max_len}",
                    items.len()
                )));
            }
        } else if items.len() as u32 != max_len {
            return Err(ApxError::Length(format!(
                "fixed array requires exactly {max_len} elements, got {}",
                items.len()
            )));
        }

        let mut offset = offset;
        if is_dynamic {
            offset = write_length_header(items.len() as u32, width_of(&array_instr), buf, offset)?;
        }

        if variant == ScalarVariant::Record {
            let mut end_pos = pos;
            for item in items {
                let record = item.as_record().ok_or_else(|| ApxError::DvType("expected record value".into()))?;
                let (next_pos, next_offset) = exec_pack_record_fields(body, pos, record, buf, offset)?;
                end_pos = next_pos;
                offset = next_offset;
            }
            let (range, after_check) = peek_limit_check(body, end_pos)?;
            let _ = range;
            return Ok((after_check, offset));
        }

        let (range, after_check) = peek_limit_check(body, pos)?;
        for item in items {
            let v = item.as_i64().ok_or_else(|| ApxError::DvType("expected scalar array element".into()))?;
            check_range(v, range)?;
            offset = write_scalar(variant, v, buf, offset)?;
        }
        return Ok((after_check, offset));
    }

    if variant == ScalarVariant::Record {
        let record = value.as_record().ok_or_else(|| ApxError::DvType("expected record value".into()))?;
        let (next_pos, next_offset) = exec_pack_record_fields(body, pos, record, buf, offset)?;
        let (_, after_check) = peek_limit_check(body, next_pos)?;
        return Ok((after_check, next_offset));
    }

    if variant == ScalarVariant::Str {
        return Err(ApxError::ElementType("string scalar must be declared as an array".into()));
    }

    let v = value.as_i64().ok_or_else(|| ApxError::DvType("expected scalar value".into()))?;
    let (range, after_check) = peek_limit_check(body, pos)?;
    check_range(v, range)?;
    let offset = write_scalar(variant, v, buf, offset)?;
    Ok((after_check, offset))
}

fn exec_pack_record_fields(
    body: &[u8],
    mut pos: usize,
    record: &BTreeMap<String, Value>,
    buf: &mut [u8],
    mut offset: usize,
) -> ApxResult<(usize, usize)> {
    let mut field_count = 0usize;
    loop {
        let (instr, next_pos) = compiler::decode_next(body, pos)?;
        let Instruction::RecordSelect { name, is_last } = instr else {
            return Err(ApxError::Read("expected record-select instruction".into()));
        };
        pos = next_pos;
        let field_value = record
            .get(&name)
            .ok_or_else(|| ApxError::DvType(format!("record is missing field '{name}'")))?;
        field_count += 1;
        let (after_field, after_offset) = exec_pack(body, pos, field_value, buf, offset)?;
        pos = after_field;
        offset = after_offset;
        if is_last {
            break;
        }
    }
    if record.len() != field_count {
        return Err(ApxError::DvType(format!(
            "record has {} keys, expected {field_count}",
            record.len()
        )));
    }
    Ok((pos, offset))
}

fn width_of(array_instr: &Instruction) -> ArrayWidth {
    match array_instr {
        Instruction::Array { width, .. } => *width,
        _ => unreachable!(),
    }
}

fn write_length_header(n: u32, width: ArrayWidth, buf: &mut [u8], offset: usize) -> ApxResult<usize> {
    let len = width.byte_len();
    let slice = buf.get_mut(offset..offset + len).ok_or(ApxError::BufferBoundary { offset })?;
    match width {
        ArrayWidth::U8 => slice[0] = n as u8,
        ArrayWidth::U16 => slice.copy_from_slice(&(n as u16).to_le_bytes()),
        ArrayWidth::U32 => slice.copy_from_slice(&n.to_le_bytes()),
    }
    Ok(offset + len)
}

fn read_length_header(width: ArrayWidth, buf: &[u8], offset: usize) -> ApxResult<(u32, usize)> {
    let len = width.byte_len();
    let slice = buf.get(offset..offset + len).ok_or(ApxError::BufferBoundary { offset })?;
    let n = match width {
        ArrayWidth::U8 => slice[0] as u32,
        ArrayWidth::U16 => u16::from_le_bytes([slice[0], slice[1]]) as u32,
        ArrayWidth::U32 => u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]),
    };
    Ok((n, offset + len))
}

fn write_scalar(variant: ScalarVariant, v: i64, buf: &mut [u8], offset: usize) -> ApxResult<usize> {
    let width = scalar_byte_width(variant);
    let slice = buf.get_mut(offset..offset + width).ok_or(ApxError::BufferBoundary { offset })?;
    match variant {
        ScalarVariant::U8 => slice[0] = v as u8,
        ScalarVariant::U16 => slice.copy_from_slice(&(v as u16).to_le_bytes()),
        ScalarVariant::U32 => slice.copy_from_slice(&(v as u32).to_le_bytes()),
        ScalarVariant::U64 => slice.copy_from_slice(&(v as u64).to_le_bytes()),
        ScalarVariant::S8 => slice[0] = (v as i8).to_le_bytes()[0],
        ScalarVariant::S16 => slice.copy_from_slice(&(v as i16).to_le_bytes()),
        ScalarVariant::S32 => slice.copy_from_slice(&(v as i32).to_le_bytes()),
        ScalarVariant::S64 => slice.copy_from_slice(&v.to_le_bytes()),
        ScalarVariant::Str | ScalarVariant::Record => unreachable!("handled by caller"),
    }
    Ok(offset + width)
}

fn read_scalar(variant: ScalarVariant, buf: &[u8], offset: usize) -> ApxResult<(Value, usize)> {
    let width = scalar_byte_width(variant);
    let slice = buf.get(offset..offset + width).ok_or(ApxError::BufferBoundary { offset })?;
    let value = match variant {
        ScalarVariant::U8 => Value::U8(slice[0]),
        ScalarVariant::U16 => Value::U16(u16::from_le_bytes([slice[0], slice[1]])),
        ScalarVariant::U32 => Value::U32(u32::from_le_bytes(slice.try_into().unwrap())),
        ScalarVariant::U64 => Value::U64(u64::from_le_bytes(slice.try_into().unwrap())),
        ScalarVariant::S8 => Value::S8(slice[0] as i8),
        ScalarVariant::S16 => Value::S16(i16::from_le_bytes([slice[0], slice[1]])),
        ScalarVariant::S32 => Value::S32(i32::from_le_bytes(slice.try_into().unwrap())),
        ScalarVariant::S64 => Value::S64(i64::from_le_bytes(slice.try_into().unwrap())),
        ScalarVariant::Str | ScalarVariant::Record => unreachable!("handled by caller"),
    };
    Ok((value, offset + width))
}

fn scalar_byte_width(variant: ScalarVariant) -> usize {
    match variant {
        ScalarVariant::U8 | ScalarVariant::S8 => 1,
        ScalarVariant::U16 | ScalarVariant::S16 => 2,
        ScalarVariant::U32 | ScalarVariant::S32 => 4,
        ScalarVariant::U64 | ScalarVariant::S64 => 8,
        ScalarVariant::Str | ScalarVariant::Record => 0,
    }
}

fn pack_string(s: &str, max_len: u32, is_dynamic: bool, buf: &mut [u8], offset: usize) -> ApxResult<usize> {
    let bytes = s.as_bytes();
    if is_dynamic {
        let n = (bytes.len() as u32).min(max_len);
        let offset = write_length_header(n, ArrayWidth::from_max_len(max_len), buf, offset)?;
        let slice = buf
            .get_mut(offset..offset + n as usize)
            .ok_or(ApxError::BufferBoundary { offset })?;
        slice.copy_from_slice(&bytes[..n as usize]);
        return Ok(offset + n as usize);
    }

    let n = max_len as usize;
    let slice = buf.get_mut(offset..offset + n).ok_or(ApxError::BufferBoundary { offset })?;
    slice.fill(0);
    let copy_len = bytes.len().min(n);
    slice[..copy_len].copy_from_slice(&bytes[..copy_len]);
    if copy_len == n && n > 0 {
        slice[n - 1] = 0;
    }
    Ok(offset + n)
}

fn unpack_string(max_len: u32, is_dynamic: bool, buf: &[u8], offset: usize) -> ApxResult<(Value, usize)> {
    if is_dynamic {
        let (n, offset) = read_length_header(ArrayWidth::from_max_len(max_len), buf, offset)?;
        let slice = buf.get(offset..offset + n as usize).ok_or(ApxError::BufferBoundary { offset })?;
        return Ok((Value::Str(String::from_utf8_lossy(slice).into_owned()), offset + n as usize));
    }
    let n = max_len as usize;
    let slice = buf.get(offset..offset + n).ok_or(ApxError::BufferBoundary { offset })?;
    let end = slice.iter().position(|&b| b == 0).unwrap_or(n);
    Ok((Value::Str(String::from_utf8_lossy(&slice[..end]).into_owned()), offset + n))
}

// ---- unpack ----

fn exec_unpack(body: &[u8], pos: usize, buf: &[u8], offset: usize) -> ApxResult<(usize, Value, usize)> {
    let (instr, mut pos) = compiler::decode_next(body, pos)?;
    let Instruction::Scalar { variant, is_array } = instr else {
        return Err(ApxError::Read("expected scalar instruction".into()));
    };

    if is_array {
        let (array_instr, after_array) = compiler::decode_next(body, pos)?;
        let Instruction::Array { width, is_dynamic, max_len } = array_instr else {
            return Err(ApxError::Read("expected array instruction after flagged scalar".into()));
        };
        pos = after_array;

        if variant == ScalarVariant::Str {
            let (value, offset) = unpack_string(max_len, is_dynamic, buf, offset)?;
            return Ok((pos, value, offset));
        }

        let (count, mut offset) = if is_dynamic {
            read_length_header(width, buf, offset)?
        } else {
            (max_len, offset)
        };

        if variant == ScalarVariant::Record {
            let mut values = Vec::with_capacity(count as usize);
            let mut end_pos = pos;
            for _ in 0..count {
                let (next_pos, record, next_offset) = exec_unpack_record_fields(body, pos, buf, offset)?;
                end_pos = next_pos;
                offset = next_offset;
                values.push(Value::Record(record));
            }
            let (_, after_check) = peek_limit_check(body, end_pos)?;
            return Ok((after_check, Value::Array(values), offset));
        }

        let (range, after_check) = peek_limit_check(body, pos)?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (value, next_offset) = read_scalar(variant, buf, offset)?;
            check_range(value.as_i64().unwrap_or(0), range)?;
            values.push(value);
            offset = next_offset;
        }
        return Ok((after_check, Value::Array(values), offset));
    }

    if variant == ScalarVariant::Record {
        let (next_pos, record, next_offset) = exec_unpack_record_fields(body, pos, buf, offset)?;
        let (_, after_check) = peek_limit_check(body, next_pos)?;
        return Ok((after_check, Value::Record(record), next_offset));
    }

    if variant == ScalarVariant::Str {
        return Err(ApxError::ElementType("string scalar must be declared as an array".into()));
    }

    let (range, after_check) = peek_limit_check(body, pos)?;
    let (value, offset) = read_scalar(variant, buf, offset)?;
    check_range(value.as_i64().unwrap_or(0), range)?;
    Ok((after_check, value, offset))
}

fn exec_unpack_record_fields(
    body: &[u8],
    mut pos: usize,
    buf: &[u8],
    mut offset: usize,
) -> ApxResult<(usize, BTreeMap<String, Value>, usize)> {
    let mut record = BTreeMap::new();
    loop {
        let (instr, next_pos) = compiler::decode_next(body, pos)?;
        let Instruction::RecordSelect { name, is_last } = instr else {
            return Err(ApxError::Read("expected record-select instruction".into()));
        };
        pos = next_pos;
        let (after_field, value, after_offset) = exec_unpack(body, pos, buf, offset)?;
        record.insert(name, value);
        pos = after_field;
        offset = after_offset;
        if is_last {
            break;
        }
    }
    Ok((pos, record, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use std::collections::BTreeMap;

    #[test]
    fn packs_and_unpacks_scalar_roundtrip() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "R\"X\"S\n");
        let node = Node::parse(doc).unwrap();
        let elem = &node.requires[0].element;
        let bytes = pack(elem, &Value::U16(0x1234)).unwrap();
        assert_eq!(bytes, vec![0x34, 0x12]);
        assert_eq!(unpack(elem, &bytes).unwrap(), Value::U16(0x1234));
    }

    #[test]
    fn packs_record_per_scenario_s2() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "P\"Dtc\"{\"DTCId\"S \"FTB\"C}\n");
        let node = Node::parse(doc).unwrap();
        let elem = &node.provides[0].element;
        let mut fields = BTreeMap::new();
        fields.insert("DTCId".to_string(), Value::U16(0x1234));
        fields.insert("FTB".to_string(), Value::U8(0x15));
        let value = Value::Record(fields);
        let bytes = pack(elem, &value).unwrap();
        assert_eq!(bytes, vec![0x34, 0x12, 0x15]);
        assert_eq!(unpack(elem, &bytes).unwrap(), value);
    }

    #[test]
    fn packs_dynamic_array_per_scenario_s3() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "R\"X\"C[*]:D[32]\n");
        let node = Node::parse(doc).unwrap();
        let elem = &node.requires[0].element;
        let value = Value::Array(vec![Value::U8(1)]);
        let bytes = pack(elem, &value).unwrap();
        assert_eq!(bytes, vec![0x01, 0x01]);
        assert_eq!(unpack(elem, &bytes).unwrap(), value);
    }

    #[test]
    fn packs_string_padding_and_truncation_per_scenario_s4() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "R\"X\"a[8]\n");
        let node = Node::parse(doc).unwrap();
        let elem = &node.requires[0].element;
        let bytes = pack(elem, &Value::Str("abc".into())).unwrap();
        assert_eq!(bytes, vec![b'a', b'b', b'c', 0, 0, 0, 0, 0]);
        assert_eq!(unpack(elem, &bytes).unwrap(), Value::Str("abc".into()));
    }

    #[test]
    fn fixed_array_rejects_wrong_element_count() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "R\"X\"C[4]\n");
        let node = Node::parse(doc).unwrap();
        let elem = &node.requires[0].element;
        let err = pack(elem, &Value::Array(vec![Value::U8(1), Value::U8(2)])).unwrap_err();
        assert!(matches!(err, ApxError::Length(_)));
    }

    #[test]
    fn range_checked_scalar_rejects_out_of_range_value() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "R\"X\"C(0,7)\n");
        let node = Node::parse(doc).unwrap();
        let elem = &node.requires[0].element;
        let err = pack(elem, &Value::U8(8)).unwrap_err();
        assert!(matches!(err, ApxError::Value(_)));
    }

    #[test]
    fn record_rejects_missing_field() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "P\"X\"{\"A\"S \"B\"C}\n");
        let node = Node::parse(doc).unwrap();
        let elem = &node.provides[0].element;
        let mut fields = BTreeMap::new();
        fields.insert("A".to_string(), Value::U16(1));
        let err = pack(elem, &Value::Record(fields)).unwrap_err();
        assert!(matches!(err, ApxError::DvType(_)));
    }

    #[test]
    fn buffer_too_small_is_boundary_error() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "R\"X\"L\n");
        let node = Node::parse(doc).unwrap();
        let elem = &node.requires[0].element;
        let program = compiler::compile_pack(elem).unwrap();
        let mut buf = [0u8; 2];
        let err = pack_into(&program, &Value::U32(1), &mut buf).unwrap_err();
        assert!(matches!(err, ApxError::BufferBoundary { .. }));
    }

    #[test]
    fn array_of_records_roundtrips() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "P\"X\"{\"A\"C}[2]\n");
        let node = Node::parse(doc).unwrap();
        let elem = &node.provides[0].element;
        let mut r0 = BTreeMap::new();
        r0.insert("A".to_string(), Value::U8(1));
        let mut r1 = BTreeMap::new();
        r1.insert("A".to_string(), Value::U8(2));
        let value = Value::Array(vec![Value::Record(r0), Value::Record(r1)]);
        let bytes = pack(elem, &value).unwrap();
        assert_eq!(bytes, vec![1, 2]);
        assert_eq!(unpack(elem, &bytes).unwrap(), value);
    }
}
