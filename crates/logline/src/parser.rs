//! Wire-line parsing.
//!
//! Two formats are recognised on the wire:
//!
//! - extended, five `|`-separated fields: `LEVEL|APPLICATION|HOSTNAME|MESSAGE|META`
//!   where `META` is a comma-separated list of `key=value` pairs
//! - simple: a leading level name followed by the message
//!
//! Anything else becomes an `INFO` record carrying the raw line, so a
//! misbehaving client never loses data to the parser.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::errors::ParseError;
use crate::record::{LogLevel, LogRecord, MAX_CLIENT_METADATA_ENTRIES};

/// Hard upper bound on an incoming line, in bytes.
pub const MAX_LINE_BYTES: usize = 10_000;

/// Validation applied before parsing: non-blank and under the size limit.
#[must_use]
pub fn is_valid_line(line: &str) -> bool {
    !line.trim().is_empty() && line.len() < MAX_LINE_BYTES
}

/// Parses one wire line into a record.
///
/// Adds the synthetic `raw_length` and `parsed_at` metadata keys on every
/// successfully parsed record.
pub fn parse_line(raw: &str) -> Result<LogRecord, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::EmptyLine);
    }

    let parts: Vec<&str> = raw.splitn(5, '|').collect();
    let mut record = if parts.len() >= 4 {
        let level = LogLevel::from_name_lossy(parts[0].trim());
        let application = or_unknown(parts[1].trim());
        let hostname = or_unknown(parts[2].trim());
        let message = parts[3].trim().to_string();
        let metadata = parts.get(4).map_or_else(BTreeMap::new, |m| parse_metadata(m));
        LogRecord::new(level, message, application, hostname, metadata)
    } else if let Some((first, rest)) = raw.split_once(' ') {
        LogRecord::simple(LogLevel::from_name_lossy(first), rest, "unknown")
    } else {
        LogRecord::simple(LogLevel::Info, raw, "unknown")
    };

    record.insert_metadata("raw_length", raw.len().to_string());
    record.insert_metadata("parsed_at", Utc::now().timestamp_millis().to_string());
    Ok(record)
}

/// Enrichment applied by the connection handler once the peer is known.
pub fn enrich_for_client(record: &mut LogRecord, client_ip: &str, client_id: &str) {
    record.insert_metadata("client_ip", client_ip);
    record.insert_metadata("server_time", Utc::now().timestamp_millis().to_string());
    record.insert_metadata("client_id", client_id);
    record.insert_metadata("category", categorize(&record.message));
}

fn categorize(message: &str) -> &'static str {
    let message = message.to_lowercase();
    if message.contains("error") || message.contains("exception") {
        "error"
    } else if message.contains("warn") {
        "warning"
    } else if message.contains("startup") || message.contains("shutdown") {
        "lifecycle"
    } else {
        "general"
    }
}

/// Parses the `META` field. Pairs without `=` are dropped, keys and values
/// are trimmed, and on duplicate keys the last pair wins. Client pairs are
/// capped at [`MAX_CLIENT_METADATA_ENTRIES`] so the synthetic and
/// enrichment keys added downstream always fit under the record cap.
fn parse_metadata(raw: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    if raw.trim().is_empty() {
        return metadata;
    }
    for pair in raw.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if metadata.len() >= MAX_CLIENT_METADATA_ENTRIES && !metadata.contains_key(key) {
            continue;
        }
        metadata.insert(key.to_string(), value.trim().to_string());
    }
    metadata
}

fn or_unknown(value: &str) -> &str {
    if value.is_empty() {
        "unknown"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extended_format() {
        let record = parse_line("ERROR|billing|web-03|payment failed|order=1234, retry=2").unwrap();
        assert_eq!(record.level, LogLevel::Error);
        assert_eq!(record.application, "billing");
        assert_eq!(record.hostname, "web-03");
        assert_eq!(record.message, "payment failed");
        assert_eq!(record.metadata.get("order").map(String::as_str), Some("1234"));
        assert_eq!(record.metadata.get("retry").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_parse_extended_empty_meta() {
        let record = parse_line("INFO|api|h1|started|").unwrap();
        assert_eq!(record.level, LogLevel::Info);
        // only the synthetic keys
        assert_eq!(record.metadata.len(), 2);
        assert!(record.metadata.contains_key("raw_length"));
        assert!(record.metadata.contains_key("parsed_at"));
    }

    #[test]
    fn test_parse_metadata_rules() {
        // missing `=` dropped, whitespace trimmed, duplicate keys last wins
        let record =
            parse_line("INFO|api|h1|m| a = 1 ,broken, a=2 ,b=x").unwrap();
        assert_eq!(record.metadata.get("a").map(String::as_str), Some("2"));
        assert_eq!(record.metadata.get("b").map(String::as_str), Some("x"));
        assert!(!record.metadata.contains_key("broken"));
    }

    #[test]
    fn test_parse_simple_format() {
        let record = parse_line("WARN connection pool nearly exhausted").unwrap();
        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(record.message, "connection pool nearly exhausted");
        assert_eq!(record.application, "unknown");
        assert_eq!(record.hostname, "unknown");
    }

    #[test]
    fn test_parse_unknown_level_maps_to_info() {
        let record = parse_line("NOTICE something happened").unwrap();
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.message, "something happened");
    }

    #[test]
    fn test_parse_fallback_keeps_raw_line() {
        let record = parse_line("just-a-bare-token").unwrap();
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.message, "just-a-bare-token");
        assert_eq!(record.application, "unknown");
    }

    #[test]
    fn test_parse_blank_line_fails() {
        assert!(matches!(parse_line(""), Err(ParseError::EmptyLine)));
        assert!(matches!(parse_line("   "), Err(ParseError::EmptyLine)));
    }

    #[test]
    fn test_synthetic_keys() {
        let raw = "INFO|api|h1|hello|";
        let record = parse_line(raw).unwrap();
        assert_eq!(
            record.metadata.get("raw_length").map(String::as_str),
            Some(raw.len().to_string().as_str())
        );
        assert!(record.metadata.contains_key("parsed_at"));
    }

    #[test]
    fn test_empty_fields_default_to_unknown() {
        let record = parse_line("INFO|| |message|").unwrap();
        assert_eq!(record.application, "unknown");
        assert_eq!(record.hostname, "unknown");
    }

    #[test]
    fn test_is_valid_line() {
        assert!(is_valid_line("INFO|a|h|m|"));
        assert!(!is_valid_line(""));
        assert!(!is_valid_line("   "));
        assert!(!is_valid_line(&"x".repeat(MAX_LINE_BYTES)));
        assert!(is_valid_line(&"x".repeat(MAX_LINE_BYTES - 1)));
    }

    #[test]
    fn test_enrich_for_client() {
        let mut record = parse_line("INFO|api|h1|unhandled exception in worker|").unwrap();
        enrich_for_client(&mut record, "10.0.0.7", "10.0.0.7:55123-1700000000000");
        assert_eq!(record.metadata.get("client_ip").map(String::as_str), Some("10.0.0.7"));
        assert_eq!(
            record.metadata.get("client_id").map(String::as_str),
            Some("10.0.0.7:55123-1700000000000")
        );
        assert!(record.metadata.contains_key("server_time"));
        assert_eq!(record.metadata.get("category").map(String::as_str), Some("error"));
    }

    #[test]
    fn test_categorize() {
        assert_eq!(categorize("Unhandled Exception at line 3"), "error");
        assert_eq!(categorize("warning: disk nearly full"), "warning");
        assert_eq!(categorize("service startup complete"), "lifecycle");
        assert_eq!(categorize("user logged a note"), "general");
    }

    #[test]
    fn test_metadata_saturated_line_still_gets_pipeline_keys() {
        let meta: Vec<String> = (0..100).map(|i| format!("k{i:03}=v{i}")).collect();
        let line = format!("INFO|api|h1|busy record|{}", meta.join(","));

        let mut record = parse_line(&line).unwrap();
        // client pairs are capped below the record limit
        let client_keys = record
            .metadata
            .keys()
            .filter(|k| k.starts_with('k'))
            .count();
        assert_eq!(client_keys, MAX_CLIENT_METADATA_ENTRIES);
        // the synthetic keys are never starved by client metadata
        assert!(record.metadata.contains_key("raw_length"));
        assert!(record.metadata.contains_key("parsed_at"));

        enrich_for_client(&mut record, "10.0.0.9", "10.0.0.9:6000-1700000000000");
        for key in ["client_ip", "server_time", "client_id", "category"] {
            assert!(record.metadata.contains_key(key), "missing {key}");
        }
        assert!(record.metadata.len() <= crate::record::MAX_METADATA_ENTRIES);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let record =
            parse_line("FATAL|auth|node-9|token store unreachable|region=eu-1,zone=b").unwrap();
        let wire = format!(
            "{}|{}|{}|{}|region=eu-1,zone=b",
            record.level, record.application, record.hostname, record.message
        );
        let reparsed = parse_line(&wire).unwrap();
        assert_eq!(reparsed.level, record.level);
        assert_eq!(reparsed.message, record.message);
        assert_eq!(reparsed.application, record.application);
        assert_eq!(reparsed.hostname, record.hostname);
        assert_eq!(reparsed.metadata.get("region"), record.metadata.get("region"));
        assert_eq!(reparsed.metadata.get("zone"), record.metadata.get("zone"));
    }
}
