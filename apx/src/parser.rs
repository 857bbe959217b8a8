// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Line-oriented `.apx` text parser: spec.md §4.1.
//
//   APX/<major>.<minor>
//   N"<node-name>"
//   T"<type-name>"<data-signature>[:<attributes>]
//   R"<port-name>"<data-signature>[:<attributes>]
//   P"<port-name>"<data-signature>[:<attributes>]
//
// Grounded on `hdds-discovery-server/src/server/protocol.rs`'s line-based
// dispatch (split on lines, match a leading tag byte), generalized here to
// the four APX directive characters.

use crate::attributes::PortAttributes;
use crate::error::{ApxError, ApxResult};
use crate::signature::parse_data_signature;
use crate::types::{DataElement, DataType};

#[derive(Debug, Clone, PartialEq)]
pub struct RawPort {
    pub name: String,
    pub signature: DataElement,
    pub attributes: PortAttributes,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawNode {
    pub name: String,
    pub types: Vec<DataType>,
    pub requires: Vec<RawPort>,
    pub provides: Vec<RawPort>,
}

/// Parse the full text of a `.apx` document into an unfinalized node.
/// Type references are left unresolved; see `node::Node::finalize`.
pub fn parse_document(text: &str) -> ApxResult<RawNode> {
    let mut lines = text.lines().enumerate();

    let (header_no, header) = lines
        .next()
        .ok_or_else(|| ApxError::Parse { line: 1, message: "empty document".into() })?;
    check_header(header, header_no + 1)?;

    let mut node = RawNode::default();
    let mut name_seen = false;

    for (idx, raw_line) in lines {
        let line_no = idx + 1;
        let line = raw_line.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut chars = line.chars();
        let tag = chars
            .next()
            .ok_or_else(|| ApxError::Parse { line: line_no, message: "empty line".into() })?;
        let rest = chars.as_str();

        match tag {
            'N' => {
                node.name = parse_quoted(rest, line_no)?;
                name_seen = true;
            }
            'T' => {
                let (name, body) = parse_quoted_with_rest(rest, line_no)?;
                let (sig_str, attr_str) = split_signature_and_attributes(body);
                let element = parse_data_signature(sig_str, line_no)?;
                node.types.push(DataType { name, element, line: line_no });
                let _ = attr_str; // typedefs carry no attributes in this grammar
            }
            'R' | 'P' => {
                let (name, body) = parse_quoted_with_rest(rest, line_no)?;
                let (sig_str, attr_str) = split_signature_and_attributes(body);
                let signature = parse_data_signature(sig_str, line_no)?;
                let attributes = parse_attributes(attr_str, line_no)?;
                let port = RawPort { name, signature, attributes, line: line_no };
                if tag == 'R' {
                    node.requires.push(port);
                } else {
                    node.provides.push(port);
                }
            }
            other => {
                return Err(ApxError::Parse {
                    line: line_no,
                    message: format!("unknown directive '{other}'"),
                })
            }
        }
    }

    if !name_seen {
        return Err(ApxError::NameMissing);
    }
    Ok(node)
}

fn check_header(line: &str, line_no: usize) -> ApxResult<()> {
    let rest = line.strip_prefix("APX/").ok_or_else(|| ApxError::Parse {
        line: line_no,
        message: "missing 'APX/<major>.<minor>' header".into(),
    })?;
    let mut parts = rest.splitn(2, '.');
    let major = parts.next().unwrap_or("");
    let minor = parts.next().unwrap_or("");
    if major.parse::<u32>().is_err() || minor.parse::<u32>().is_err() {
        return Err(ApxError::Parse {
            line: line_no,
            message: format!("malformed version in header: {line}"),
        });
    }
    Ok(())
}

/// Parse a `"quoted"` token at the start of `s`, requiring nothing follow it.
fn parse_quoted(s: &str, line: usize) -> ApxResult<String> {
    let (name, rest) = parse_quoted_with_rest(s, line)?;
    if !rest.is_empty() {
        return Err(ApxError::Parse {
            line,
            message: format!("unexpected trailing text: {rest}"),
        });
    }
    Ok(name)
}

/// Parse a `"quoted"` token at the start of `s`, returning the remainder.
fn parse_quoted_with_rest(s: &str, line: usize) -> ApxResult<(String, &str)> {
    let s = s
        .strip_prefix('"')
        .ok_or_else(|| ApxError::Parse { line, message: "expected quoted name".into() })?;
    match s.find('"') {
        Some(end) => Ok((s[..end].to_string(), &s[end + 1..])),
        None => Err(ApxError::UnmatchedString { line }),
    }
}

/// Split `<signature>[:<attributes>]` at the top-level colon, one that is
/// not nested inside `{}`/`[]`/`()` or a quoted string.
fn split_signature_and_attributes(s: &str) -> (&str, &str) {
    let mut depth = 0i32;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '{' | '[' | '(' if !in_quotes => depth += 1,
            '}' | ']' | ')' if !in_quotes => depth -= 1,
            ':' if !in_quotes && depth == 0 => return (&s[..i], &s[i + 1..]),
            _ => {}
        }
    }
    (s, "")
}

/// Split `s` on top-level commas (not nested inside `{}`/`[]`/`()` or a
/// quoted string), mirroring `split_signature_and_attributes`'s scanner.
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

/// Attribute grammar: comma-separated tokens, each one of
/// `=<literal>`, `P`, `Q[n]`, `D[n]`.
fn parse_attributes(s: &str, line: usize) -> ApxResult<PortAttributes> {
    let mut attrs = PortAttributes { raw: s.to_string(), ..Default::default() };
    if s.is_empty() {
        return Ok(attrs);
    }
    for token in split_top_level_commas(s) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some(literal) = token.strip_prefix('=') {
            attrs.init_literal = Some(literal.to_string());
        } else if token == "P" {
            attrs.parameter = true;
        } else if let Some(rest) = token.strip_prefix('Q') {
            attrs.queued = true;
            attrs.queue_len = Some(parse_bracketed_u32(rest, line)?);
        } else if let Some(rest) = token.strip_prefix('D') {
            attrs.dynamic_len = Some(parse_bracketed_u32(rest, line)?);
        } else {
            return Err(ApxError::InvalidAttribute {
                line,
                message: format!("unrecognized attribute token: {token}"),
            });
        }
    }
    Ok(attrs)
}

fn parse_bracketed_u32(s: &str, line: usize) -> ApxResult<u32> {
    let s = s.trim();
    let inner = s
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| ApxError::InvalidAttribute {
            line,
            message: format!("expected '[n]', got: {s}"),
        })?;
    inner.parse().map_err(|_| ApxError::InvalidAttribute {
        line,
        message: format!("expected numeric length, got: {inner}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArrayLen, BaseType};

    const DOC: &str = concat!(
        "APX/1.2\n",
        "N\"TestNode\"\n",
        "T\"VehicleSpeed_T\"S\n",
        "R\"VehicleSpeed\"T[0]:=65535\n",
        "P\"EngineSpeed\"S:=0\n",
    );

    #[test]
    fn parses_minimal_document() {
        let node = parse_document(DOC).unwrap();
        assert_eq!(node.name, "TestNode");
        assert_eq!(node.types.len(), 1);
        assert_eq!(node.types[0].name, "VehicleSpeed_T");
        assert_eq!(node.requires.len(), 1);
        assert_eq!(node.requires[0].name, "VehicleSpeed");
        assert_eq!(
            node.requires[0].attributes.init_literal.as_deref(),
            Some("65535")
        );
        assert_eq!(node.provides.len(), 1);
        assert_eq!(node.provides[0].signature.base_type, BaseType::U16);
    }

    #[test]
    fn rejects_missing_header() {
        let err = parse_document("N\"Foo\"\n").unwrap_err();
        assert!(matches!(err, ApxError::Parse { line: 1, .. }));
    }

    #[test]
    fn rejects_missing_name() {
        let err = parse_document("APX/1.2\nT\"X\"C\n").unwrap_err();
        assert_eq!(err, ApxError::NameMissing);
    }

    #[test]
    fn parses_queued_and_dynamic_attributes() {
        let doc = concat!(
            "APX/1.2\n",
            "N\"N\"\n",
            "R\"Events\"C[*]:Q[8],D[16]\n",
        );
        let node = parse_document(doc).unwrap();
        let port = &node.requires[0];
        assert!(port.attributes.queued);
        assert_eq!(port.attributes.queue_len, Some(8));
        assert_eq!(port.attributes.dynamic_len, Some(16));
        assert_eq!(port.signature.array_len, ArrayLen::Dynamic(0));
    }

    #[test]
    fn parses_record_signature_with_colon_free_body() {
        let doc = concat!(
            "APX/1.2\n",
            "N\"N\"\n",
            "P\"Dtc\"{\"DTCId\"S \"FTB\"C}\n",
        );
        let node = parse_document(doc).unwrap();
        assert!(node.provides[0].signature.is_record());
    }

    #[test]
    fn parameter_attribute_without_init_value() {
        let doc = concat!("APX/1.2\n", "N\"N\"\n", "P\"Mode\"C:P\n");
        let node = parse_document(doc).unwrap();
        assert!(node.provides[0].attributes.parameter);
    }
}
