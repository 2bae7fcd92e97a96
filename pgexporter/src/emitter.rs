//! The emitter: turns collected rows into Prometheus text.
//!
//! Output is a sequence of column stores, one per `(stem, column, type)`
//! triple observed in the scrape. Each store renders its HELP/TYPE preamble
//! exactly once, then its metric lines; stores appear in first-touch order,
//! which follows registry declaration order.

use indexmap::IndexMap;
use tracing::warn;

use crate::collector::{CollectedQuery, ServerState};
use crate::formatting::{
    format_label, normalize_value, write_help_line, write_metric_line, write_type_line,
};
use crate::logging::LogCounters;
use crate::registry::{ColumnKind, QueryAlternative, SortPolicy};

/// Inputs for the exporter's own metric families.
pub struct ExporterStatus<'a> {
    pub counters: &'a LogCounters,
    pub servers: &'a [ServerState],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoreKey {
    stem: String,
    column: String,
    kind: ColumnKind,
}

struct StoreLine {
    group: Option<String>,
    text: String,
}

struct ColumnStore {
    preamble: String,
    sort: SortPolicy,
    lines: Vec<StoreLine>,
}

impl ColumnStore {
    /// Appends a line; under the data sort policy, lines join the last run
    /// with an equal group key, preserving intra-group insertion order.
    fn push(&mut self, group: Option<String>, text: String) {
        if self.sort == SortPolicy::Data {
            if let Some(g) = group.as_deref() {
                if let Some(pos) =
                    self.lines.iter().rposition(|l| l.group.as_deref() == Some(g))
                {
                    self.lines.insert(pos + 1, StoreLine { group, text });
                    return;
                }
            }
        }
        self.lines.push(StoreLine { group, text });
    }
}

/// Full metric name for a `(stem, column)` pair.
fn series_name(stem: &str, column: &str) -> String {
    if column.is_empty() {
        format!("pgexporter_{stem}")
    } else {
        format!("pgexporter_{stem}_{column}")
    }
}

/// Renders one complete scrape payload.
pub fn render(collected: &[CollectedQuery<'_>], status: &ExporterStatus<'_>) -> String {
    let mut out = String::new();
    general_information(&mut out, status);
    server_information(&mut out, status);

    let mut stores: IndexMap<StoreKey, ColumnStore> = IndexMap::new();
    for query in collected {
        if query.rows.is_empty() {
            continue;
        }
        if query.alt.is_histogram {
            handle_histogram(&mut stores, query);
        } else {
            handle_gauge_counter(&mut stores, query);
        }
    }

    for store in stores.into_values() {
        out.push_str(&store.preamble);
        for line in store.lines {
            out.push_str(&line.text);
        }
        out.push('\n');
    }

    out
}

/// `pgexporter_state` and the logging counters.
fn general_information(out: &mut String, status: &ExporterStatus<'_>) {
    write_help_line(out, "pgexporter_state", "The state of pgexporter");
    write_type_line(out, "pgexporter_state", "gauge");
    write_metric_line(out, "pgexporter_state", None, &[], 1);
    out.push('\n');

    let counters = [
        ("pgexporter_logging_info", "The number of INFO logging statements", status.counters.info()),
        ("pgexporter_logging_warn", "The number of WARN logging statements", status.counters.warn()),
        ("pgexporter_logging_error", "The number of ERROR logging statements", status.counters.error()),
        ("pgexporter_logging_fatal", "The number of FATAL logging statements", status.counters.fatal()),
    ];
    for (name, help, value) in counters {
        write_help_line(out, name, help);
        write_type_line(out, name, "gauge");
        write_metric_line(out, name, None, &[], value);
        out.push('\n');
    }
}

/// `pgexporter_postgresql_active` per configured server.
fn server_information(out: &mut String, status: &ExporterStatus<'_>) {
    write_help_line(out, "pgexporter_postgresql_active", "The state of PostgreSQL");
    write_type_line(out, "pgexporter_postgresql_active", "gauge");
    for server in status.servers {
        let labels = [format_label("server", &server.config.name)];
        write_metric_line(
            out,
            "pgexporter_postgresql_active",
            None,
            &labels,
            if server.available { 1 } else { 0 },
        );
    }
    out.push('\n');
}

/// Group key under the data sort policy: the first data column of the row.
fn group_key(alt: &QueryAlternative, row: &pgexporter_wire::Row) -> Option<String> {
    alt.columns
        .iter()
        .position(|c| c.kind != ColumnKind::Label)
        .and_then(|idx| row.get(idx))
        .map(str::to_string)
}

/// Label set shared by every line of a row: `server` first, then the declared
/// label columns in order. When the collector is iterating databases and the
/// query did not produce a `database` label, the current database is injected.
/// `limit` bounds which columns contribute (histograms only use labels
/// declared before the histogram column).
fn row_labels(
    query: &CollectedQuery<'_>,
    row: &pgexporter_wire::Row,
    limit: usize,
) -> Vec<String> {
    let mut labels = vec![format_label("server", &query.server)];
    let mut db_present = false;
    for (idx, column) in query.alt.columns.iter().take(limit).enumerate() {
        if column.kind != ColumnKind::Label {
            continue;
        }
        if column.name == "database" {
            db_present = true;
        }
        labels.push(format_label(&column.name, row.get(idx).unwrap_or("")));
    }
    if !db_present && query.def.all_databases {
        labels.push(format_label("database", &query.database));
    }
    labels
}

fn handle_gauge_counter(stores: &mut IndexMap<StoreKey, ColumnStore>, query: &CollectedQuery<'_>) {
    let stem = query.def.stem();

    for (idx, column) in query.alt.columns.iter().enumerate() {
        if column.kind == ColumnKind::Label {
            continue;
        }

        let name = series_name(&stem, &column.name);
        let key = StoreKey { stem: stem.clone(), column: column.name.clone(), kind: column.kind };
        let store = stores.entry(key).or_insert_with(|| {
            let mut preamble = String::new();
            write_help_line(&mut preamble, &name, &column.description);
            write_type_line(&mut preamble, &name, column.kind.as_str());
            ColumnStore { preamble, sort: query.def.sort, lines: Vec::new() }
        });

        for row in query.rows.rows() {
            let labels = row_labels(query, row, query.alt.columns.len());
            let mut text = String::new();
            write_metric_line(&mut text, &name, None, &labels, normalize_value(row.get(idx)));
            store.push(group_key(query.alt, row), text);
        }
    }
}

fn handle_histogram(stores: &mut IndexMap<StoreKey, ColumnStore>, query: &CollectedQuery<'_>) {
    let Some(h_idx) = query.alt.columns.iter().position(|c| c.kind == ColumnKind::Histogram)
    else {
        return;
    };
    let h_column = &query.alt.columns[h_idx];
    let stem = query.def.stem();
    let name = series_name(&stem, "");

    // The row carries parallel arrays plus scalars by naming convention.
    let bounds_idx = query.rows.column_index(&h_column.name);
    let buckets_idx = query.rows.column_index(&format!("{}_bucket", h_column.name));
    let sum_idx = query.rows.column_index(&format!("{}_sum", h_column.name));
    let count_idx = query.rows.column_index(&format!("{}_count", h_column.name));
    let (Some(bounds_idx), Some(buckets_idx), Some(sum_idx), Some(count_idx)) =
        (bounds_idx, buckets_idx, sum_idx, count_idx)
    else {
        warn!(tag = %query.def.tag, "histogram query is missing its conventional columns");
        return;
    };

    let key =
        StoreKey { stem: stem.clone(), column: h_column.name.clone(), kind: ColumnKind::Histogram };
    let store = stores.entry(key).or_insert_with(|| {
        let mut preamble = String::new();
        write_help_line(&mut preamble, &name, &h_column.description);
        write_type_line(&mut preamble, &name, "histogram");
        ColumnStore { preamble, sort: query.def.sort, lines: Vec::new() }
    });

    for row in query.rows.rows() {
        let bounds = parse_pg_array(row.get(bounds_idx).unwrap_or(""));
        let buckets = parse_pg_array(row.get(buckets_idx).unwrap_or(""));
        if bounds.len() != buckets.len() {
            warn!(
                tag = %query.def.tag,
                bounds = bounds.len(),
                buckets = buckets.len(),
                "histogram bound and bucket arrays differ in length, skipping row"
            );
            continue;
        }

        let labels = row_labels(query, row, h_idx);
        let count = normalize_value(row.get(count_idx));
        let mut text = String::new();

        for (bound, bucket) in bounds.iter().zip(buckets.iter()) {
            let mut bucket_labels = labels.clone();
            bucket_labels.push(format_label("le", bound));
            write_metric_line(
                &mut text,
                &name,
                Some("bucket"),
                &bucket_labels,
                normalize_value(Some(bucket.as_str())),
            );
        }

        let mut inf_labels = labels.clone();
        inf_labels.push(format_label("le", "+Inf"));
        write_metric_line(&mut text, &name, Some("bucket"), &inf_labels, count.clone());

        write_metric_line(&mut text, &name, Some("sum"), &labels, normalize_value(row.get(sum_idx)));
        write_metric_line(&mut text, &name, Some("count"), &labels, count);

        store.push(group_key(query.alt, row), text);
    }
}

/// Splits a PostgreSQL array literal (`{a,b,c}`) into its elements.
fn parse_pg_array(text: &str) -> Vec<String> {
    let inner = text.trim().trim_start_matches('{').trim_end_matches('}');
    if inner.is_empty() {
        return Vec::new();
    }
    inner.split(',').map(|s| s.trim().to_string()).collect()
}
