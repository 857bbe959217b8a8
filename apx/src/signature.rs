// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Data-signature grammar: spec.md §4.1.
//
//   base      ::= 'C'|'S'|'L'|'Q'|'c'|'s'|'l'|'q'|'a'|record|typeref
//   record    ::= '{' (field)* '}'
//   field     ::= '"' name '"' elem
//   typeref   ::= 'T' '[' (digits | '"' name '"') ']'
//   elem      ::= base [array] [range]
//   array     ::= '[' (digits | '*') ']'
//   range     ::= '(' int ',' int ')'
//
// A recursive-descent parser over a character cursor, grounded on the
// grammar in spec.md §4.1 and `original_source/apx/common/inc/apx_dataSignature.h`.

use crate::error::{ApxError, ApxResult};
use crate::types::{ArrayLen, BaseType, DataElement, NumericRange, TypeRef};

struct Cursor<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    _src: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str, line: usize) -> Self {
        Cursor {
            chars: src.chars().collect(),
            pos: 0,
            line,
            _src: src,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn expect(&mut self, expected: char) -> ApxResult<()> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(ApxError::ExpectedBracket { line: self.line }),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn parse_quoted_name(&mut self) -> ApxResult<String> {
        self.expect('"')?;
        let mut s = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(s),
                Some(c) => s.push(c),
                None => return Err(ApxError::UnmatchedString { line: self.line }),
            }
        }
    }

    fn parse_uint(&mut self) -> Option<u32> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let s: String = self.chars[start..self.pos].iter().collect();
        s.parse().ok()
    }

    fn parse_int(&mut self) -> Option<i64> {
        let start = self.pos;
        if matches!(self.peek(), Some('-')) {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let s: String = self.chars[start..self.pos].iter().collect();
        s.parse().ok()
    }
}

/// Parse a full data-signature string into a `DataElement`. Array lengths
/// of `[*]` are left as `ArrayLen::Dynamic(0)` placeholders; the caller
/// (node finalization) fills them from the port's `D[n]` attribute.
pub fn parse_data_signature(src: &str, line: usize) -> ApxResult<DataElement> {
    let mut cur = Cursor::new(src, line);
    let elem = parse_element(&mut cur)?;
    if !cur.at_end() {
        return Err(ApxError::DataSignature(format!(
            "trailing characters in signature: {src}"
        )));
    }
    Ok(elem)
}

fn parse_element(cur: &mut Cursor) -> ApxResult<DataElement> {
    let mut elem = parse_base(cur)?;
    if cur.peek() == Some('[') {
        elem.array_len = parse_array_spec(cur)?;
    }
    if cur.peek() == Some('(') {
        elem.range = Some(parse_range(cur)?);
    }
    Ok(elem)
}

fn parse_base(cur: &mut Cursor) -> ApxResult<DataElement> {
    let c = cur
        .bump()
        .ok_or_else(|| ApxError::DataSignature("empty signature".into()))?;
    let elem = match c {
        'C' => DataElement::scalar(BaseType::U8),
        'S' => DataElement::scalar(BaseType::U16),
        'L' => DataElement::scalar(BaseType::U32),
        'Q' => DataElement::scalar(BaseType::U64),
        'c' => DataElement::scalar(BaseType::S8),
        's' => DataElement::scalar(BaseType::S16),
        'l' => DataElement::scalar(BaseType::S32),
        'q' => DataElement::scalar(BaseType::S64),
        'a' => DataElement::scalar(BaseType::String),
        '{' => parse_record(cur)?,
        'T' => parse_type_ref(cur)?,
        other => {
            return Err(ApxError::DataSignature(format!(
                "unknown base type character '{other}'"
            )))
        }
    };
    Ok(elem)
}

fn parse_record(cur: &mut Cursor) -> ApxResult<DataElement> {
    let mut children = Vec::new();
    loop {
        match cur.peek() {
            Some('}') => {
                cur.bump();
                break;
            }
            Some(c) if c.is_whitespace() => {
                cur.bump();
            }
            Some('"') => {
                let name = cur.parse_quoted_name()?;
                let elem = parse_element(cur)?;
                children.push((name, elem));
            }
            Some(_) => {
                return Err(ApxError::DataSignature(
                    "expected field name in record".into(),
                ))
            }
            None => return Err(ApxError::UnmatchedBrace { line: cur.line }),
        }
    }
    if children.is_empty() {
        return Err(ApxError::DataSignature("record has no fields".into()));
    }
    Ok(DataElement::record(children))
}

fn parse_type_ref(cur: &mut Cursor) -> ApxResult<DataElement> {
    cur.expect('[')?;
    let type_ref = if cur.peek() == Some('"') {
        let name = cur.parse_quoted_name()?;
        TypeRef::ByName(name)
    } else {
        let idx = cur
            .parse_uint()
            .ok_or_else(|| ApxError::InvalidTypeRef {
                line: cur.line,
                message: "expected index or quoted name".into(),
            })?;
        TypeRef::ByIndex(idx as usize)
    };
    match cur.bump() {
        Some(']') => Ok(DataElement::type_reference(type_ref)),
        _ => Err(ApxError::UnmatchedBracket { line: cur.line }),
    }
}

fn parse_array_spec(cur: &mut Cursor) -> ApxResult<ArrayLen> {
    cur.expect('[')?;
    let result = if cur.peek() == Some('*') {
        cur.bump();
        ArrayLen::Dynamic(0)
    } else {
        let n = cur.parse_uint().ok_or_else(|| {
            ApxError::DataSignature("expected array length or '*'".into())
        })?;
        ArrayLen::Fixed(n)
    };
    match cur.bump() {
        Some(']') => Ok(result),
        _ => Err(ApxError::UnmatchedBracket { line: cur.line }),
    }
}

fn parse_range(cur: &mut Cursor) -> ApxResult<NumericRange> {
    cur.expect('(')?;
    let min = cur
        .parse_int()
        .ok_or_else(|| ApxError::DataSignature("expected range minimum".into()))?;
    cur.expect(',')?;
    let max = cur
        .parse_int()
        .ok_or_else(|| ApxError::DataSignature("expected range maximum".into()))?;
    match cur.bump() {
        Some(')') => Ok(NumericRange { min, max }),
        _ => Err(ApxError::DataSignature("unmatched parenthesis in range".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalar_with_range() {
        let e = parse_data_signature("C(0,7)", 1).unwrap();
        assert_eq!(e.base_type, BaseType::U8);
        assert_eq!(e.range, Some(NumericRange { min: 0, max: 7 }));
    }

    #[test]
    fn parses_record() {
        let e = parse_data_signature(r#"{"DTCId"S "FTB"C}"#, 1).unwrap();
        assert!(e.is_record());
        assert_eq!(e.children.len(), 2);
        assert_eq!(e.children[0].0, "DTCId");
        assert_eq!(e.children[1].1.base_type, BaseType::U8);
    }

    #[test]
    fn parses_dynamic_array_placeholder() {
        let e = parse_data_signature("C[*]", 1).unwrap();
        assert_eq!(e.array_len, ArrayLen::Dynamic(0));
    }

    #[test]
    fn parses_fixed_array() {
        let e = parse_data_signature("C[32]", 1).unwrap();
        assert_eq!(e.array_len, ArrayLen::Fixed(32));
    }

    #[test]
    fn parses_type_ref_by_index_and_name() {
        let by_idx = parse_data_signature("T[0]", 1).unwrap();
        assert_eq!(by_idx.type_ref, Some(TypeRef::ByIndex(0)));
        let by_name = parse_data_signature(r#"T["Name"]"#, 1).unwrap();
        assert_eq!(by_name.type_ref, Some(TypeRef::ByName("Name".into())));
    }

    #[test]
    fn rejects_unmatched_brace() {
        let err = parse_data_signature(r#"{"A"C"#, 1).unwrap_err();
        assert!(matches!(err, ApxError::UnmatchedBrace { line: 1 }));
    }

    #[test]
    fn string_type_signature() {
        let e = parse_data_signature("a[8]", 1).unwrap();
        assert!(e.is_string());
        assert_eq!(e.array_len, ArrayLen::Fixed(8));
    }
}
