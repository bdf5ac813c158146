//! Proxy access log processor.
//!
//! Each line is a proxy-server log entry, optionally behind a syslog prefix:
//!
//! ```text
//! Mar 15 12:00:01 proxy01 proxy-server: 1.2.3.4 10.0.0.5 15/Mar/2024/12/00/01 GET /v1/AUTH_test/c/o HTTP/1.0 200 - agent tk 0 512 - tx1 - 0.01
//! ```
//!
//! Fields after the prefix are space separated and `%`-quoted. Requests that
//! do not address a `/v1/<account>` path (health checks, info) are skipped.

use super::{lines, unquote, LogProcessor, ParseError, ParsedRecord};
use crate::source::window::RawLogObject;
use std::net::IpAddr;
use tracing::debug;

const SERVER_TAG: &str = "proxy-server";
const MIN_FIELDS: usize = 16;

#[derive(Debug, Default)]
pub struct AccessLogProcessor;

impl AccessLogProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Record(ParsedRecord),
    Skipped,
}

impl LogProcessor for AccessLogProcessor {
    fn parse(&self, object: &RawLogObject, data: &[u8]) -> Result<Vec<ParsedRecord>, ParseError> {
        let mut records = Vec::new();
        let mut malformed = 0usize;
        let mut first_error = None;

        for (number, line) in lines(data)? {
            match parse_line(line) {
                Ok(Line::Record(record)) => records.push(record),
                Ok(Line::Skipped) => {}
                Err(reason) => {
                    malformed += 1;
                    debug!(object = %object.name, line = number, %reason, "Skipping malformed access line");
                    first_error.get_or_insert(ParseError::Malformed {
                        line: number,
                        reason,
                    });
                }
            }
        }

        if records.is_empty() {
            if let Some(err) = first_error {
                return Err(if malformed == 1 {
                    err
                } else {
                    ParseError::NoRecords { malformed }
                });
            }
        }

        Ok(records)
    }
}

fn parse_line(line: &str) -> Result<Line, String> {
    let body = match line.find(SERVER_TAG) {
        Some(pos) => line[pos + SERVER_TAG.len()..].trim_start_matches(':'),
        None => line,
    };

    let fields: Vec<String> = body.split_whitespace().map(unquote).collect();
    if fields.len() < MIN_FIELDS {
        return Err(format!("expected at least {} fields, found {}", MIN_FIELDS, fields.len()));
    }

    let client_ip = &fields[0];
    let lb_ip = &fields[1];
    let method = &fields[3];
    let path = &fields[4];
    let status: u16 = fields[6]
        .parse()
        .map_err(|_| format!("invalid status '{}'", fields[6]))?;
    let bytes_in = parse_bytes(&fields[10])?;
    let bytes_out = parse_bytes(&fields[11])?;

    let Some((account, container, object)) = split_path(path) else {
        return Ok(Line::Skipped);
    };

    let level = match (&container, object) {
        (Some(_), true) => "object",
        (Some(_), false) => "container",
        (None, _) => "account",
    };

    let mut record = ParsedRecord::new(account, container)
        .with_measure(format!("{}_{}_{}xx", level, method, status / 100), 1)
        .with_measure("bytes_in", bytes_in)
        .with_measure("bytes_out", bytes_out);
    record.client_ip = client_ip.parse::<IpAddr>().ok();
    record.lb_ip = lb_ip.parse::<IpAddr>().ok();

    Ok(Line::Record(record))
}

fn parse_bytes(field: &str) -> Result<u64, String> {
    if field == "-" {
        return Ok(0);
    }
    field
        .parse()
        .map_err(|_| format!("invalid byte count '{}'", field))
}

/// Split `/v1/<account>[/<container>[/<object>]]`, ignoring any query string.
fn split_path(path: &str) -> Option<(String, Option<String>, bool)> {
    let path = path.split('?').next().unwrap_or_default();
    let mut parts = path.trim_start_matches('/').splitn(4, '/');

    if parts.next()? != "v1" {
        return None;
    }
    let account = parts.next().filter(|a| !a.is_empty())?.to_string();
    let container = parts
        .next()
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    let object = container.is_some() && parts.next().is_some_and(|o| !o.is_empty());

    Some((account, container, object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::matcher::LogTimestamp;
    use std::collections::BTreeMap;

    fn object() -> RawLogObject {
        RawLogObject {
            container: "log_data".to_string(),
            name: "2024031512-proxy01.gz".to_string(),
            size: 0,
            last_modified: None,
            timestamp: LogTimestamp::new(2024, 3, 15, 12),
            extras: BTreeMap::new(),
        }
    }

    fn line(client: &str, method: &str, path: &str, status: u16, bytes_out: &str) -> String {
        format!(
            "Mar 15 12:00:01 proxy01 proxy-server: {} 10.0.0.5 15/Mar/2024/12/00/01 {} {} HTTP/1.0 {} - curl/7.0 tk 0 {} - tx1 - 0.0123",
            client, method, path, status, bytes_out
        )
    }

    #[test]
    fn test_parses_object_request() {
        let data = line("1.2.3.4", "GET", "/v1/AUTH_test/photos/cat.jpg", 200, "512");
        let records = AccessLogProcessor::new().parse(&object(), data.as_bytes()).unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.account, "AUTH_test");
        assert_eq!(record.container.as_deref(), Some("photos"));
        assert_eq!(record.measures["object_GET_2xx"], 1);
        assert_eq!(record.measures["bytes_out"], 512);
        assert_eq!(record.measures["bytes_in"], 0);
        assert_eq!(record.client_ip, Some("1.2.3.4".parse::<IpAddr>().unwrap()));
        assert_eq!(record.lb_ip, Some("10.0.0.5".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_levels_and_quoting() {
        let data = [
            line("1.2.3.4", "PUT", "/v1/AUTH_test/my%20stuff", 201, "-"),
            line("1.2.3.4", "HEAD", "/v1/AUTH_test", 404, "-"),
        ]
        .join("\n");
        let records = AccessLogProcessor::new().parse(&object(), data.as_bytes()).unwrap();

        assert_eq!(records[0].container.as_deref(), Some("my stuff"));
        assert!(records[0].measures.contains_key("container_PUT_2xx"));
        assert_eq!(records[1].container, None);
        assert!(records[1].measures.contains_key("account_HEAD_4xx"));
    }

    #[test]
    fn test_non_account_paths_are_skipped() {
        let data = line("1.2.3.4", "GET", "/healthcheck", 200, "2");
        let records = AccessLogProcessor::new().parse(&object(), data.as_bytes()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped_when_others_parse() {
        let data = format!(
            "{}\ngarbage line\n",
            line("1.2.3.4", "GET", "/v1/AUTH_test/c/o", 200, "1")
        );
        let records = AccessLogProcessor::new().parse(&object(), data.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_entirely_malformed_object_fails() {
        let err = AccessLogProcessor::new()
            .parse(&object(), b"garbage\nmore garbage\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::NoRecords { malformed: 2 }));

        let err = AccessLogProcessor::new().parse(&object(), b"garbage\n").unwrap_err();
        assert!(matches!(err, ParseError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_empty_object_has_no_records() {
        let records = AccessLogProcessor::new().parse(&object(), b"").unwrap();
        assert!(records.is_empty());
    }
}
