//! Helpers for rendering metrics in the Prometheus exposition format.

use std::fmt::Display;

/// Writes a help (description) line. An empty description falls back to the
/// metric name itself, so every store still carries a preamble.
pub fn write_help_line(buffer: &mut String, name: &str, description: &str) {
    buffer.push_str("# HELP ");
    buffer.push_str(name);
    buffer.push(' ');
    if description.is_empty() {
        buffer.push_str(name);
    } else {
        buffer.push_str(description);
    }
    buffer.push('\n');
}

/// Writes a metric type line.
pub fn write_type_line(buffer: &mut String, name: &str, metric_type: &str) {
    buffer.push_str("# TYPE ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(metric_type);
    buffer.push('\n');
}

/// Writes one metric line. `labels` are preformatted `key="value"` pairs with
/// the `server` label always first; `suffix` carries the `_bucket`/`_sum`/
/// `_count` decorations of histogram series.
pub fn write_metric_line<V: Display>(
    buffer: &mut String,
    name: &str,
    suffix: Option<&'static str>,
    labels: &[String],
    value: V,
) {
    buffer.push_str(name);
    if let Some(suffix) = suffix {
        buffer.push('_');
        buffer.push_str(suffix);
    }

    if !labels.is_empty() {
        buffer.push('{');
        let mut first = true;
        for label in labels {
            if first {
                first = false;
            } else {
                buffer.push(',');
            }
            buffer.push_str(label);
        }
        buffer.push('}');
    }

    buffer.push(' ');
    buffer.push_str(&value.to_string());
    buffer.push('\n');
}

/// Formats one `key="value"` pair with the value escaped.
pub fn format_label(key: &str, value: &str) -> String {
    format!("{key}=\"{}\"", escape_label_value(value))
}

/// Escapes a label value: `"` and `\` are backslash-escaped, `.` becomes `_`,
/// and a trailing `.` is dropped.
pub fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (idx, c) in value.chars().enumerate() {
        match c {
            '.' if idx == last => {}
            '.' => escaped.push('_'),
            '"' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            other => escaped.push(other),
        }
    }
    escaped
}

/// Normalizes a raw SQL cell into a Prometheus sample value.
///
/// Empty and NULL map to `0`; the usual boolean spellings map to `0`/`1`;
/// `NaN` passes through; numeric text is kept verbatim; anything else
/// becomes `1`, a presence indicator.
pub fn normalize_value(raw: Option<&str>) -> String {
    let raw = match raw {
        None | Some("") => return "0".to_string(),
        Some(v) => v,
    };
    match raw {
        "off" | "f" | "(disabled)" => return "0".to_string(),
        "on" | "t" => return "1".to_string(),
        "NaN" => return raw.to_string(),
        _ => {}
    }
    if raw.parse::<i64>().is_ok() || raw.parse::<f64>().is_ok() {
        raw.to_string()
    } else {
        "1".to_string()
    }
}
