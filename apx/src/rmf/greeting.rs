// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// RMF greeting: spec.md §4.4. A line-oriented text blob: `RMFP/<M>.<m>`
// followed by optional `key:value` lines and a terminating empty line.

use std::collections::BTreeMap;

use crate::error::{ApxError, ApxResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub major: u32,
    pub minor: u32,
    pub fields: BTreeMap<String, String>,
}

impl Greeting {
    pub fn new(major: u32, minor: u32) -> Greeting {
        Greeting { major, minor, fields: BTreeMap::new() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = format!("RMFP/{}.{}\n", self.major, self.minor);
        for (k, v) in &self.fields {
            s.push_str(&format!("{k}:{v}\n"));
        }
        s.push('\n');
        s.into_bytes()
    }

    pub fn parse(text: &str) -> ApxResult<Greeting> {
        let mut lines = text.split('\n');
        let header = lines.next().unwrap_or("").trim_end_matches('\r');
        let rest = header
            .strip_prefix("RMFP/")
            .ok_or_else(|| ApxError::InvalidMsg(format!("missing RMFP greeting header: {header}")))?;
        let mut parts = rest.splitn(2, '.');
        let major = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ApxError::InvalidMsg("malformed greeting major version".into()))?;
        let minor = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ApxError::InvalidMsg("malformed greeting minor version".into()))?;

        let mut fields = BTreeMap::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ApxError::InvalidMsg(format!("malformed greeting field: {line}")))?;
            fields.insert(key.to_string(), value.to_string());
        }
        Ok(Greeting { major, minor, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_minimal_greeting() {
        let g = Greeting::new(1, 0);
        assert_eq!(g.encode(), b"RMFP/1.0\n\n");
    }

    #[test]
    fn parses_minimal_greeting() {
        let g = Greeting::parse("RMFP/1.0\n\n").unwrap();
        assert_eq!(g.major, 1);
        assert_eq!(g.minor, 0);
        assert!(g.fields.is_empty());
    }

    #[test]
    fn round_trips_with_fields() {
        let mut g = Greeting::new(1, 2);
        g.fields.insert("software-version".into(), "1.2.3".into());
        let encoded = g.encode();
        let decoded = Greeting::parse(std::str::from_utf8(&encoded).unwrap()).unwrap();
        assert_eq!(decoded, g);
    }

    #[test]
    fn rejects_missing_header() {
        let err = Greeting::parse("not-a-greeting\n\n").unwrap_err();
        assert!(matches!(err, ApxError::InvalidMsg(_)));
    }
}
