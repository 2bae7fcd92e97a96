//! Parse a single line of Prometheus text format.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("metric name must start with [a-zA-Z_:], parsing: `{input}`")]
    InvalidName { input: String },
    #[error("invalid metric type, parsing: `{input}`")]
    InvalidMetricKind { input: String },
    #[error("expected character {expected:?}, parsing: `{input}`")]
    ExpectedChar { expected: char, input: String },
    #[error("invalid value, parsing: `{input}`")]
    InvalidValue { input: String },
    #[error("unterminated label value, parsing: `{input}`")]
    UnterminatedLabelValue { input: String },
}

/// The exposition types the bridge and console care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
            MetricKind::Untyped => "untyped",
        }
    }
}

/// One parsed line; blank lines and free-form comments yield `None`.
#[derive(Debug, PartialEq)]
pub enum Line {
    Help { name: String, text: String },
    Type { name: String, kind: MetricKind },
    Sample(Sample),
}

#[derive(Debug, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

pub fn parse_line(line: &str) -> Result<Option<Line>, ErrorKind> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(comment) = line.strip_prefix('#') {
        return parse_comment(comment.trim_start());
    }
    parse_sample(line).map(|s| Some(Line::Sample(s)))
}

fn parse_comment(rest: &str) -> Result<Option<Line>, ErrorKind> {
    if let Some(rest) = rest.strip_prefix("HELP") {
        let rest = rest.trim_start();
        let (name, text) = split_name(rest)?;
        return Ok(Some(Line::Help { name, text: text.trim().to_string() }));
    }
    if let Some(rest) = rest.strip_prefix("TYPE") {
        let rest = rest.trim_start();
        let (name, kind) = split_name(rest)?;
        let kind = match kind.trim() {
            "counter" => MetricKind::Counter,
            "gauge" => MetricKind::Gauge,
            "histogram" => MetricKind::Histogram,
            "summary" => MetricKind::Summary,
            "untyped" => MetricKind::Untyped,
            other => return Err(ErrorKind::InvalidMetricKind { input: other.to_string() }),
        };
        return Ok(Some(Line::Type { name, kind }));
    }
    // Other comments are ignored.
    Ok(None)
}

fn split_name(input: &str) -> Result<(String, &str), ErrorKind> {
    let end = input.find(|c: char| c.is_whitespace()).unwrap_or(input.len());
    let (name, rest) = input.split_at(end);
    if !is_valid_name(name) {
        return Err(ErrorKind::InvalidName { input: input.to_string() });
    }
    Ok((name.to_string(), rest))
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn parse_sample(line: &str) -> Result<Sample, ErrorKind> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if !is_valid_name(name) {
        return Err(ErrorKind::InvalidName { input: line.to_string() });
    }

    let mut rest = &line[name_end..];
    let mut labels = Vec::new();
    if rest.starts_with('{') {
        let (parsed, remaining) = parse_labels(rest)?;
        labels = parsed;
        rest = remaining;
    }

    let value_text = rest.split_whitespace().next().unwrap_or("");
    let value = parse_value(value_text)?;

    Ok(Sample { name: name.to_string(), labels, value })
}

fn parse_value(text: &str) -> Result<f64, ErrorKind> {
    match text {
        "" => Err(ErrorKind::InvalidValue { input: text.to_string() }),
        "+Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        other => other
            .parse::<f64>()
            .map_err(|_| ErrorKind::InvalidValue { input: other.to_string() }),
    }
}

fn parse_labels(input: &str) -> Result<(Vec<(String, String)>, &str), ErrorKind> {
    debug_assert!(input.starts_with('{'));
    let mut rest = &input[1..];
    let mut labels = Vec::new();

    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if let Some(after) = rest.strip_prefix('}') {
            return Ok((labels, after));
        }

        let eq = rest
            .find('=')
            .ok_or_else(|| ErrorKind::ExpectedChar { expected: '=', input: rest.to_string() })?;
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        rest = rest.strip_prefix('"').ok_or_else(|| ErrorKind::ExpectedChar {
            expected: '"',
            input: rest.to_string(),
        })?;

        let (value, after) = parse_label_value(rest)?;
        labels.push((key, value));
        rest = after;
    }
}

/// Consumes a quoted label value, handling `\\`, `\"` and `\n` escapes.
fn parse_label_value(input: &str) -> Result<(String, &str), ErrorKind> {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[idx + 1..])),
            '\\' => match chars.next() {
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, 'n')) => value.push('\n'),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => {
                    return Err(ErrorKind::UnterminatedLabelValue { input: input.to_string() })
                }
            },
            other => value.push(other),
        }
    }
    Err(ErrorKind::UnterminatedLabelValue { input: input.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_help_and_type() {
        assert_eq!(
            parse_line("# HELP pgexporter_state The state of pgexporter").unwrap(),
            Some(Line::Help {
                name: "pgexporter_state".into(),
                text: "The state of pgexporter".into()
            })
        );
        assert_eq!(
            parse_line("# TYPE pgexporter_state gauge").unwrap(),
            Some(Line::Type { name: "pgexporter_state".into(), kind: MetricKind::Gauge })
        );
        assert_eq!(parse_line("# some random comment").unwrap(), None);
        assert_eq!(parse_line("").unwrap(), None);
    }

    #[test]
    fn parses_samples_with_labels() {
        let line = parse_line(r#"pg_database_size{server="s1",database="app"} 16384"#)
            .unwrap()
            .unwrap();
        match line {
            Line::Sample(sample) => {
                assert_eq!(sample.name, "pg_database_size");
                assert_eq!(
                    sample.labels,
                    vec![
                        ("server".to_string(), "s1".to_string()),
                        ("database".to_string(), "app".to_string())
                    ]
                );
                assert_eq!(sample.value, 16384.0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_escaped_label_values() {
        let line = parse_line(r#"m{path="C:\\dir\"x\"",note="a\nb"} 1"#).unwrap().unwrap();
        match line {
            Line::Sample(sample) => {
                assert_eq!(sample.labels[0].1, "C:\\dir\"x\"");
                assert_eq!(sample.labels[1].1, "a\nb");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_special_values() {
        for (text, check) in [
            ("m 1.5", 1.5f64),
            ("m -2", -2.0),
            ("m 1e3", 1000.0),
        ] {
            match parse_line(text).unwrap().unwrap() {
                Line::Sample(s) => assert_eq!(s.value, check),
                other => panic!("unexpected: {other:?}"),
            }
        }
        match parse_line("m{le=\"+Inf\"} +Inf").unwrap().unwrap() {
            Line::Sample(s) => assert!(s.value.is_infinite()),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_line("m NaN").unwrap().unwrap() {
            Line::Sample(s) => assert!(s.value.is_nan()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_lines() {
        assert!(parse_line("1bad_name 1").is_err());
        assert!(parse_line("m{key=value} 1").is_err());
        assert!(parse_line("m{key=\"v} 1").is_err());
        assert!(parse_line("m notanumber").is_err());
    }
}
