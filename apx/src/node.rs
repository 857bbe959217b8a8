// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Node finalization: spec.md §3 ("finalization resolves every type
// reference, computes each element's pack length once, and derives a
// normalized signature string for every port") and §4.1.
//
// Grounded on the materialize-once idiom of a type cache that resolves
// forward references exactly once and caches the result, generalized from
// the teacher's type descriptor cache to APX's flat per-node type table.

use std::collections::{BTreeMap, HashMap};

use crate::attributes::PortAttributes;
use crate::error::{ApxError, ApxResult};
use crate::parser::{parse_document, RawNode, RawPort};
use crate::types::{ArrayLen, BaseType, DataElement, DataType, TypeRef};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub name: String,
    pub element: DataElement,
    pub attributes: PortAttributes,
    pub line: usize,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub types: Vec<DataType>,
    pub requires: Vec<Port>,
    pub provides: Vec<Port>,
}

impl Node {
    /// Parse and finalize a `.apx` document in one step.
    pub fn parse(text: &str) -> ApxResult<Node> {
        let raw = parse_document(text)?;
        Node::finalize(raw)
    }

    /// Resolve every type reference, fill dynamic array lengths from their
    /// `D[n]` attribute, compute pack lengths, and resolve initial values.
    pub fn finalize(raw: RawNode) -> ApxResult<Node> {
        let idx_map = build_type_index(&raw.types)?;

        let mut types = Vec::with_capacity(raw.types.len());
        for t in &raw.types {
            let mut stack = Vec::new();
            let structural = resolve_structure(&t.element, &raw.types, &idx_map, &mut stack)?;
            let element = fill_pack_len(&structural)?;
            types.push(DataType { name: t.name.clone(), element, line: t.line });
        }

        let requires = raw
            .requires
            .iter()
            .map(|p| finalize_port(p, &raw.types, &idx_map))
            .collect::<ApxResult<Vec<_>>>()?;
        let provides = raw
            .provides
            .iter()
            .map(|p| finalize_port(p, &raw.types, &idx_map))
            .collect::<ApxResult<Vec<_>>>()?;

        Ok(Node { name: raw.name, types, requires, provides })
    }
}

fn build_type_index(types: &[DataType]) -> ApxResult<HashMap<String, usize>> {
    let mut map = HashMap::with_capacity(types.len());
    for (idx, t) in types.iter().enumerate() {
        if map.insert(t.name.clone(), idx).is_some() {
            return Err(ApxError::Parse {
                line: t.line,
                message: format!("duplicate type name: {}", t.name),
            });
        }
    }
    Ok(map)
}

fn finalize_port(raw: &RawPort, types: &[DataType], idx_map: &HashMap<String, usize>) -> ApxResult<Port> {
    let mut stack = Vec::new();
    let mut structural = resolve_structure(&raw.signature, types, idx_map, &mut stack)?;

    if structural.array_len == ArrayLen::Dynamic(0) {
        let max = raw.attributes.dynamic_len.ok_or_else(|| ApxError::InvalidAttribute {
            line: raw.line,
            message: format!("port '{}' has a dynamic array but no D[n] attribute", raw.name),
        })?;
        structural.array_len = ArrayLen::Dynamic(max);
    }

    let element = fill_pack_len(&structural)?;
    let signature = render_signature(&element);

    let mut attributes = raw.attributes.clone();
    if let Some(literal) = attributes.init_literal.clone() {
        attributes.init_value = Some(resolve_literal(&literal, &element, raw.line)?);
    }

    Ok(Port { name: raw.name.clone(), element, attributes, line: raw.line, signature })
}

fn resolve_type_ref(type_ref: &TypeRef, idx_map: &HashMap<String, usize>, len: usize) -> ApxResult<usize> {
    match type_ref {
        TypeRef::ByIndex(i) | TypeRef::Resolved(i) => {
            if *i < len {
                Ok(*i)
            } else {
                Err(ApxError::InvalidTypeRef { line: 0, message: format!("type index {i} out of range") })
            }
        }
        TypeRef::ByName(name) => idx_map
            .get(name)
            .copied()
            .ok_or_else(|| ApxError::InvalidTypeRef { line: 0, message: format!("unknown type name: {name}") }),
    }
}

fn resolve_structure(
    elem: &DataElement,
    types: &[DataType],
    idx_map: &HashMap<String, usize>,
    stack: &mut Vec<usize>,
) -> ApxResult<DataElement> {
    if let Some(type_ref) = &elem.type_ref {
        let idx = resolve_type_ref(type_ref, idx_map, types.len())?;
        if stack.contains(&idx) {
            return Err(ApxError::InvalidTypeRef {
                line: types[idx].line,
                message: format!("cyclic type reference through '{}'", types[idx].name),
            });
        }
        stack.push(idx);
        let target = resolve_structure(&types[idx].element, types, idx_map, stack)?;
        stack.pop();

        let mut merged = target;
        if elem.array_len != ArrayLen::None {
            merged.array_len = elem.array_len;
        }
        if elem.range.is_some() {
            merged.range = elem.range;
        }
        Ok(merged)
    } else if elem.is_record() {
        let mut children = Vec::with_capacity(elem.children.len());
        for (name, child) in &elem.children {
            children.push((name.clone(), resolve_structure(child, types, idx_map, stack)?));
        }
        Ok(DataElement { children, ..elem.clone() })
    } else {
        Ok(elem.clone())
    }
}

fn fill_pack_len(elem: &DataElement) -> ApxResult<DataElement> {
    let mut result = if elem.is_record() {
        let mut children = Vec::with_capacity(elem.children.len());
        for (name, child) in &elem.children {
            children.push((name.clone(), fill_pack_len(child)?));
        }
        DataElement { children, ..elem.clone() }
    } else {
        elem.clone()
    };
    result.pack_len = Some(compute_pack_len(&result)?);
    Ok(result)
}

fn compute_pack_len(elem: &DataElement) -> ApxResult<u32> {
    let elem_size: u32 = if elem.is_record() {
        let mut sum = 0u32;
        for (_, child) in &elem.children {
            sum += child.pack_len.ok_or_else(|| ApxError::Length("record field missing pack length".into()))?;
        }
        sum
    } else if elem.base_type.is_reference() {
        return Err(ApxError::DataSignature("unresolved type reference at pack-length computation".into()));
    } else {
        elem.base_type.scalar_width() as u32
    };
    match elem.array_len {
        ArrayLen::None => Ok(elem_size),
        ArrayLen::Fixed(n) => Ok(elem_size.saturating_mul(n)),
        ArrayLen::Dynamic(n) => Ok(elem_size.saturating_mul(n) + elem.array_len.length_header_width() as u32),
    }
}

fn render_signature(elem: &DataElement) -> String {
    let mut s = String::new();
    render_base(elem, &mut s);
    match elem.array_len {
        ArrayLen::None => {}
        ArrayLen::Fixed(n) => s.push_str(&format!("[{n}]")),
        ArrayLen::Dynamic(_) => s.push_str("[*]"),
    }
    if let Some(r) = elem.range {
        s.push_str(&format!("({},{})", r.min, r.max));
    }
    s
}

fn render_base(elem: &DataElement, out: &mut String) {
    if elem.is_record() {
        out.push('{');
        for (name, child) in &elem.children {
            out.push('"');
            out.push_str(name);
            out.push('"');
            out.push_str(&render_signature(child));
        }
        out.push('}');
    } else {
        out.push_str(&elem.base_type.to_string());
    }
}

/// Resolve a port's `=<literal>` text into a `Value` tree, using the fully
/// resolved element to drive record/array/scalar shape expectations.
fn resolve_literal(literal: &str, elem: &DataElement, line: usize) -> ApxResult<Value> {
    let literal = literal.trim();

    if elem.array_len.is_array() {
        let inner = brace_delimited(literal, line)?;
        let item_elem = DataElement { array_len: ArrayLen::None, ..elem.clone() };
        let values = split_top_level_commas(inner)
            .into_iter()
            .map(|part| resolve_literal(part.trim(), &item_elem, line))
            .collect::<ApxResult<Vec<_>>>()?;
        return Ok(Value::Array(values));
    }

    if elem.is_record() {
        let inner = brace_delimited(literal, line)?;
        let parts = split_top_level_commas(inner);
        if parts.len() != elem.children.len() {
            return Err(ApxError::Value(format!(
                "record initializer has {} values, expected {}",
                parts.len(),
                elem.children.len()
            )));
        }
        let mut map = BTreeMap::new();
        for ((name, child_elem), part) in elem.children.iter().zip(parts) {
            map.insert(name.clone(), resolve_literal(part.trim(), child_elem, line)?);
        }
        return Ok(Value::Record(map));
    }

    if elem.is_string() {
        let inner = literal
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .ok_or_else(|| ApxError::UnmatchedString { line })?;
        return Ok(Value::Str(inner.to_string()));
    }

    parse_scalar_literal(literal, elem.base_type, line)
}

fn brace_delimited(s: &str, line: usize) -> ApxResult<&str> {
    s.strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| ApxError::UnmatchedBrace { line })
}

fn parse_scalar_literal(s: &str, base_type: BaseType, line: usize) -> ApxResult<Value> {
    let parse_u64 = |s: &str| -> ApxResult<u64> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16)
        } else {
            s.parse::<u64>()
        }
        .map_err(|_| ApxError::Value(format!("invalid numeric literal: {s}")))
    };
    let parse_i64 = |s: &str| -> ApxResult<i64> {
        s.parse::<i64>().map_err(|_| ApxError::Value(format!("invalid numeric literal: {s}")))
    };

    let value = match base_type {
        BaseType::U8 => Value::U8(parse_u64(s)? as u8),
        BaseType::U16 => Value::U16(parse_u64(s)? as u16),
        BaseType::U32 => Value::U32(parse_u64(s)? as u32),
        BaseType::U64 => Value::U64(parse_u64(s)?),
        BaseType::S8 => Value::S8(parse_i64(s)? as i8),
        BaseType::S16 => Value::S16(parse_i64(s)? as i16),
        BaseType::S32 => Value::S32(parse_i64(s)? as i32),
        BaseType::S64 => Value::S64(parse_i64(s)?),
        other => {
            return Err(ApxError::Parse { line, message: format!("cannot parse scalar literal for {other}") })
        }
    };
    Ok(value)
}

/// Split `s` on top-level commas, respecting nested braces/brackets/parens
/// and quoted strings. Shared shape with `parser::split_top_level_commas`;
/// kept local since literal resolution runs after parsing and needn't
/// depend back on the parser module's private helper.
fn split_top_level_commas(s: &str) -> Vec<&str> {
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut start = 0usize;
    let mut out = Vec::new();
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '{' | '[' | '(' if !in_quotes => depth += 1,
            '}' | ']' | ')' if !in_quotes => depth -= 1,
            ',' if !in_quotes && depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start <= s.len() {
        out.push(&s[start..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizes_scalar_require_port_with_init_value() {
        let doc = concat!(
            "APX/1.2\n",
            "N\"TestNode\"\n",
            "R\"VehicleSpeed\"S:=65535\n",
        );
        let node = Node::parse(doc).unwrap();
        let port = &node.requires[0];
        assert_eq!(port.element.pack_len, Some(2));
        assert_eq!(port.attributes.init_value, Some(Value::U16(65535)));
        assert_eq!(port.signature, "S");
    }

    #[test]
    fn resolves_type_reference_by_index() {
        let doc = concat!(
            "APX/1.2\n",
            "N\"TestNode\"\n",
            "T\"VehicleSpeed_T\"S\n",
            "R\"VehicleSpeed\"T[0]\n",
        );
        let node = Node::parse(doc).unwrap();
        assert_eq!(node.requires[0].element.base_type, BaseType::U16);
        assert_eq!(node.requires[0].element.pack_len, Some(2));
    }

    #[test]
    fn resolves_type_reference_by_name() {
        let doc = concat!(
            "APX/1.2\n",
            "N\"TestNode\"\n",
            "T\"Speed_T\"S\n",
            "P\"Speed\"T[\"Speed_T\"]\n",
        );
        let node = Node::parse(doc).unwrap();
        assert_eq!(node.provides[0].element.base_type, BaseType::U16);
    }

    #[test]
    fn computes_record_pack_length_and_signature() {
        let doc = concat!(
            "APX/1.2\n",
            "N\"TestNode\"\n",
            "P\"Dtc\"{\"DTCId\"S \"FTB\"C}\n",
        );
        let node = Node::parse(doc).unwrap();
        let port = &node.provides[0];
        assert_eq!(port.element.pack_len, Some(3));
        assert_eq!(port.signature, r#"{"DTCId"S"FTB"C}"#);
    }

    #[test]
    fn dynamic_array_requires_d_attribute() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "R\"Events\"C[*]\n");
        let err = Node::parse(doc).unwrap_err();
        assert!(matches!(err, ApxError::InvalidAttribute { .. }));
    }

    #[test]
    fn dynamic_array_pack_length_includes_header() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "R\"Events\"C[*]:D[16]\n");
        let node = Node::parse(doc).unwrap();
        assert_eq!(node.requires[0].element.pack_len, Some(17));
    }

    #[test]
    fn resolves_array_init_literal() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "P\"Buf\"C[3]:={1,2,3}\n");
        let node = Node::parse(doc).unwrap();
        let value = node.provides[0].attributes.init_value.clone().unwrap();
        assert_eq!(value, Value::Array(vec![Value::U8(1), Value::U8(2), Value::U8(3)]));
    }

    #[test]
    fn detects_cyclic_type_reference() {
        let doc = concat!(
            "APX/1.2\n",
            "N\"N\"\n",
            "T\"A\"T[1]\n",
            "T\"B\"T[0]\n",
            "R\"X\"T[0]\n",
        );
        let err = Node::parse(doc).unwrap_err();
        assert!(matches!(err, ApxError::InvalidTypeRef { .. }));
    }

    #[test]
    fn rejects_duplicate_type_name() {
        let doc = concat!(
            "APX/1.2\n",
            "N\"N\"\n",
            "T\"A\"C\n",
            "T\"A\"S\n",
        );
        let err = Node::parse(doc).unwrap_err();
        assert!(matches!(err, ApxError::Parse { .. }));
    }
}
