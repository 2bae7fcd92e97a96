//! Parser for the Prometheus text exposition format (v0.0.1).
//!
//! The federation bridge uses this to reshape upstream payloads into JSON, and
//! the operator console uses it to cluster metric families into categories.
//! Samples are grouped by metric family: histogram and summary series
//! (`_bucket`, `_sum`, `_count`) fold into the family announced by their
//! `# TYPE` line, everything else groups by sample name.

use indexmap::IndexMap;
use thiserror::Error;

mod line;

pub use line::{ErrorKind, Line, MetricKind, Sample};

/// Parse failure, annotated with the offending line.
#[derive(Debug, Error, PartialEq)]
#[error("{kind}, at line {line_number}")]
pub struct ParserError {
    pub line_number: usize,
    #[source]
    pub kind: ErrorKind,
}

/// One metric family: its HELP/TYPE preamble and every sample that belongs to
/// it, in document order.
#[derive(Debug, PartialEq)]
pub struct MetricGroup {
    pub name: String,
    pub help: Option<String>,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

/// Parses a full text payload into metric families, preserving document order.
pub fn parse_text(input: &str) -> Result<Vec<MetricGroup>, ParserError> {
    let mut groups: IndexMap<String, MetricGroup> = IndexMap::new();

    for (idx, raw) in input.lines().enumerate() {
        let parsed = line::parse_line(raw)
            .map_err(|kind| ParserError { line_number: idx + 1, kind })?;
        match parsed {
            None => {}
            Some(Line::Help { name, text }) => {
                groups
                    .entry(name.clone())
                    .or_insert_with(|| empty_group(name))
                    .help
                    .get_or_insert(text);
            }
            Some(Line::Type { name, kind }) => {
                groups.entry(name.clone()).or_insert_with(|| empty_group(name)).kind = kind;
            }
            Some(Line::Sample(sample)) => {
                let family = family_name(&groups, &sample.name);
                groups
                    .entry(family.clone())
                    .or_insert_with(|| empty_group(family))
                    .samples
                    .push(sample);
            }
        }
    }

    Ok(groups.into_values().collect())
}

fn empty_group(name: String) -> MetricGroup {
    MetricGroup { name, help: None, kind: MetricKind::Untyped, samples: Vec::new() }
}

/// Resolves a sample name to its family: `x_bucket`/`x_sum`/`x_count` belong
/// to a histogram or summary family `x` when one was announced.
fn family_name(groups: &IndexMap<String, MetricGroup>, sample: &str) -> String {
    for suffix in ["_bucket", "_sum", "_count"] {
        if let Some(base) = sample.strip_suffix(suffix) {
            if let Some(group) = groups.get(base) {
                if matches!(group.kind, MetricKind::Histogram | MetricKind::Summary) {
                    return base.to_string();
                }
            }
        }
    }
    sample.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = "\
# HELP pgexporter_postgresql_primary Is the PostgreSQL instance the primary\n\
# TYPE pgexporter_postgresql_primary gauge\n\
pgexporter_postgresql_primary{server=\"s1\"} 1\n\
\n\
# HELP pgexporter_query_time Query time\n\
# TYPE pgexporter_query_time histogram\n\
pgexporter_query_time_bucket{server=\"s1\",le=\"0.1\"} 2\n\
pgexporter_query_time_bucket{server=\"s1\",le=\"+Inf\"} 3\n\
pgexporter_query_time_sum{server=\"s1\"} 0.5\n\
pgexporter_query_time_count{server=\"s1\"} 3\n";

    #[test]
    fn groups_families_in_document_order() {
        let groups = parse_text(PAYLOAD).unwrap();
        assert_eq!(groups.len(), 2);

        assert_eq!(groups[0].name, "pgexporter_postgresql_primary");
        assert_eq!(groups[0].kind, MetricKind::Gauge);
        assert_eq!(
            groups[0].help.as_deref(),
            Some("Is the PostgreSQL instance the primary")
        );
        assert_eq!(groups[0].samples.len(), 1);

        assert_eq!(groups[1].name, "pgexporter_query_time");
        assert_eq!(groups[1].kind, MetricKind::Histogram);
        assert_eq!(groups[1].samples.len(), 4);
        assert_eq!(groups[1].samples[0].name, "pgexporter_query_time_bucket");
    }

    #[test]
    fn untyped_samples_form_their_own_family() {
        let groups = parse_text("foo_count 1\n").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "foo_count");
        assert_eq!(groups[0].kind, MetricKind::Untyped);
    }

    #[test]
    fn error_carries_line_number() {
        let err = parse_text("ok 1\n0bad 2\n").unwrap_err();
        assert_eq!(err.line_number, 2);
    }
}
