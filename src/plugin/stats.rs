//! Account and container stats processors.
//!
//! Stats objects are CSV files produced by the storage nodes, one per node
//! per hour. The same account shows up once per replica, so every row also
//! counts toward `replica_count`.

use super::{lines, unquote, LogProcessor, ParseError, ParsedRecord};
use crate::source::window::RawLogObject;

const CONTAINER_HEADER: &str = "Account Hash";
pub(crate) const META_PREFIX: &str = "X-Container-Meta-";

/// Account stats: `"account",container_count,object_count,bytes_used`.
#[derive(Debug, Default)]
pub struct StatsLogProcessor;

impl StatsLogProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl LogProcessor for StatsLogProcessor {
    fn parse(&self, _object: &RawLogObject, data: &[u8]) -> Result<Vec<ParsedRecord>, ParseError> {
        let mut records = Vec::new();
        for (number, line) in lines(data)? {
            let fields = split_csv(line);
            if fields.len() != 4 {
                return Err(malformed(number, format!("expected 4 columns, found {}", fields.len())));
            }
            let account = &fields[0];
            if account.is_empty() {
                return Err(malformed(number, "empty account".to_string()));
            }

            records.push(
                ParsedRecord::new(account.as_str(), None)
                    .with_measure("container_count", number_field(number, "container_count", &fields[1])?)
                    .with_measure("object_count", number_field(number, "object_count", &fields[2])?)
                    .with_measure("bytes_used", number_field(number, "bytes_used", &fields[3])?)
                    .with_measure("replica_count", 1),
            );
        }
        Ok(records)
    }
}

/// Container stats with an optional header naming metadata columns.
#[derive(Debug)]
pub struct ContainerStatsProcessor {
    /// (header name, measure name) for each configured metadata key.
    metadata: Vec<(String, String)>,
}

impl ContainerStatsProcessor {
    pub fn new(metadata_keys: &[String]) -> Self {
        let metadata = metadata_keys
            .iter()
            .map(|key| key.trim())
            .filter(|key| !key.is_empty())
            .map(|key| {
                (
                    format!("{}{}", META_PREFIX, title_case(key)),
                    format!("meta_{}", key.to_lowercase()),
                )
            })
            .collect();
        Self { metadata }
    }
}

impl LogProcessor for ContainerStatsProcessor {
    fn parse(&self, _object: &RawLogObject, data: &[u8]) -> Result<Vec<ParsedRecord>, ParseError> {
        let mut records = Vec::new();
        // Column index of each wanted metadata key, known once the header is read
        let mut columns: Vec<(usize, &str)> = Vec::new();

        for (number, line) in lines(data)? {
            let fields = split_csv(line);

            if fields.first().is_some_and(|f| f == CONTAINER_HEADER) {
                columns = self
                    .metadata
                    .iter()
                    .filter_map(|(header, measure)| {
                        fields
                            .iter()
                            .position(|f| f.eq_ignore_ascii_case(header))
                            .map(|idx| (idx, measure.as_str()))
                    })
                    .collect();
                continue;
            }

            if fields.len() < 4 {
                return Err(malformed(number, format!("expected at least 4 columns, found {}", fields.len())));
            }
            if fields[0].is_empty() || fields[1].is_empty() {
                return Err(malformed(number, "empty account or container".to_string()));
            }

            let mut record = ParsedRecord::new(fields[0].as_str(), Some(unquote(&fields[1])))
                .with_measure("container_count", 1)
                .with_measure("object_count", number_field(number, "object_count", &fields[2])?)
                .with_measure("bytes_used", number_field(number, "bytes_used", &fields[3])?);

            for (idx, measure) in &columns {
                let set = fields.get(*idx).is_some_and(|v| !v.is_empty() && v != "0");
                if set {
                    record = record.with_measure(*measure, 1);
                }
            }
            records.push(record);
        }
        Ok(records)
    }
}

fn malformed(line: usize, reason: String) -> ParseError {
    ParseError::Malformed { line, reason }
}

fn number_field(line: usize, name: &str, value: &str) -> Result<u64, ParseError> {
    value
        .trim()
        .parse()
        .map_err(|_| malformed(line, format!("invalid {} '{}'", name, value)))
}

/// Title-case a header word the way HTTP frameworks report user metadata:
/// the first letter after any non-letter is upper case, the rest lower case.
pub(crate) fn title_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = true;
    for c in key.chars() {
        if c.is_alphabetic() {
            if upper_next {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            upper_next = false;
        } else {
            out.push(c);
            upper_next = true;
        }
    }
    out
}

/// Split one CSV line, honouring double quotes and `""` escapes.
fn split_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}
