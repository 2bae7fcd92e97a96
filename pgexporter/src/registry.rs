//! The metric definition registry.
//!
//! Two populations live here: core metrics embedded in the binary and user
//! metrics loaded from YAML or JSON files (or directories of them). Each
//! metric carries an ordered set of version-keyed query alternatives; lookup
//! selects the greatest key not exceeding the probed server or extension
//! version. Reloads build a shadow registry and only a fully validated shadow
//! replaces the live one.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Metric name stem prefix on every emitted line.
pub const NAME_PREFIX: &str = "pgexporter_";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{origin}: {source}")]
    Yaml {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{origin}: {source}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{origin}: metric {tag:?} produces illegal Prometheus name {name:?}")]
    InvalidName { origin: String, tag: String, name: String },
    #[error("{origin}: series {name:?} collides with a previously loaded metric")]
    SeriesCollision { origin: String, name: String },
    #[error("{origin}: metric {tag:?} has no query alternatives")]
    NoQueries { origin: String, tag: String },
    #[error("{origin}: metric {tag:?} declares more than one histogram column in one alternative")]
    MultipleHistograms { origin: String, tag: String },
    #[error("{origin}: metric {tag:?} has duplicate version key {version}")]
    DuplicateVersion { origin: String, tag: String, version: String },
    #[error("{origin}: metric {tag:?} has invalid version key: {reason}")]
    InvalidVersion { origin: String, tag: String, reason: String },
    #[error("{origin}: metric {tag:?} has invalid {field} value {value:?}")]
    InvalidField { origin: String, tag: String, field: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPolicy {
    /// Rows append in collection order.
    Name,
    /// Rows with an equal first data column group adjacent, insertion order
    /// within the group.
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSelector {
    Primary,
    Replica,
    Both,
}

/// An extension version triple, compared lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExtVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FromStr for ExtVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn component(part: Option<&str>, name: &str) -> Result<u32, String> {
            match part {
                None => Ok(0),
                Some(p) => p.parse().map_err(|_| format!("invalid {name} component {p:?}")),
            }
        }

        let mut parts = s.split('.');
        let major = match parts.next() {
            Some(p) if !p.is_empty() => {
                p.parse().map_err(|_| format!("invalid major component {p:?}"))?
            }
            _ => return Err("empty version".into()),
        };
        let minor = component(parts.next(), "minor")?;
        let patch = component(parts.next(), "patch")?;
        if parts.next().is_some() {
            return Err(format!("too many components in {s:?}"));
        }
        Ok(ExtVersion { major, minor, patch })
    }
}

impl fmt::Display for ExtVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Version key of one query alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionKey {
    /// PostgreSQL major version for core metrics.
    Postgres(u32),
    /// Installed extension version for extension metrics.
    Extension(ExtVersion),
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionKey::Postgres(v) => write!(f, "{v}"),
            VersionKey::Extension(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Label,
    Gauge,
    Counter,
    Histogram,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Label => "label",
            ColumnKind::Gauge => "gauge",
            ColumnKind::Counter => "counter",
            ColumnKind::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    /// May be empty; the tag alone then names the series.
    pub name: String,
    pub description: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone)]
pub struct QueryAlternative {
    pub version: VersionKey,
    pub sql: String,
    pub columns: Vec<Column>,
    pub is_histogram: bool,
}

#[derive(Debug, Clone)]
pub struct MetricDef {
    pub tag: String,
    pub collector: String,
    pub sort: SortPolicy,
    pub server: ServerSelector,
    pub all_databases: bool,
    pub extension: Option<String>,
    /// Sorted ascending by version key.
    alternatives: Vec<QueryAlternative>,
}

impl MetricDef {
    /// The Prometheus name stem: the tag, prefixed by the extension name for
    /// extension metrics that do not already carry it.
    pub fn stem(&self) -> String {
        match &self.extension {
            Some(ext) if !self.tag.starts_with(ext.as_str()) => format!("{ext}_{}", self.tag),
            _ => self.tag.clone(),
        }
    }

    pub fn alternatives(&self) -> &[QueryAlternative] {
        &self.alternatives
    }

    /// Greatest alternative whose version key does not exceed `probe`;
    /// `None` means the metric is skipped for that server.
    pub fn lookup(&self, probe: VersionKey) -> Option<&QueryAlternative> {
        let idx = self.alternatives.partition_point(|alt| alt.version <= probe);
        if idx == 0 {
            None
        } else {
            Some(&self.alternatives[idx - 1])
        }
    }
}

/// Where user metric definitions come from.
#[derive(Debug, Clone)]
pub enum UserMetricsSource {
    Yaml(PathBuf),
    Json(PathBuf),
}

/// The loaded, validated registry snapshot.
#[derive(Debug, Default)]
pub struct Registry {
    metrics: Vec<MetricDef>,
}

const CORE_METRICS: &str = include_str!("core_metrics.yaml");

impl Registry {
    /// Loads the embedded core metrics plus the optional user source.
    pub fn load(user: Option<&UserMetricsSource>) -> Result<Registry, LoadError> {
        let mut registry = Registry::default();
        let mut seen = HashSet::new();
        registry.add_yaml(CORE_METRICS, "internal", &mut seen)?;

        match user {
            None => {}
            Some(UserMetricsSource::Yaml(path)) => {
                for (origin, text) in read_sources(path, &["yaml", "yml"])? {
                    registry.add_yaml(&text, &origin, &mut seen)?;
                }
            }
            Some(UserMetricsSource::Json(path)) => {
                for (origin, text) in read_sources(path, &["json"])? {
                    registry.add_json(&text, &origin, &mut seen)?;
                }
            }
        }

        Ok(registry)
    }

    /// Builds a registry from a single YAML document, without the core set.
    pub fn from_yaml(text: &str) -> Result<Registry, LoadError> {
        let mut registry = Registry::default();
        let mut seen = HashSet::new();
        registry.add_yaml(text, "inline", &mut seen)?;
        Ok(registry)
    }

    pub fn metrics(&self) -> &[MetricDef] {
        &self.metrics
    }

    fn add_yaml(
        &mut self,
        text: &str,
        origin: &str,
        seen: &mut HashSet<String>,
    ) -> Result<(), LoadError> {
        let raw: RawFile = serde_yaml::from_str(text)
            .map_err(|source| LoadError::Yaml { origin: origin.into(), source })?;
        self.add_raw(raw, origin, seen)
    }

    fn add_json(
        &mut self,
        text: &str,
        origin: &str,
        seen: &mut HashSet<String>,
    ) -> Result<(), LoadError> {
        let raw: RawFile = serde_json::from_str(text)
            .map_err(|source| LoadError::Json { origin: origin.into(), source })?;
        self.add_raw(raw, origin, seen)
    }

    fn add_raw(
        &mut self,
        raw: RawFile,
        origin: &str,
        seen: &mut HashSet<String>,
    ) -> Result<(), LoadError> {
        for metric in raw.metrics {
            let def = convert_metric(metric, origin)?;
            register_series(&def, origin, seen)?;
            self.metrics.push(def);
        }
        Ok(())
    }
}

/// The `(stem, column)` product must be Prometheus-legal and globally unique.
fn register_series(
    def: &MetricDef,
    origin: &str,
    seen: &mut HashSet<String>,
) -> Result<(), LoadError> {
    let stem = def.stem();
    let mut names = Vec::new();
    for alt in def.alternatives() {
        for column in &alt.columns {
            if column.kind == ColumnKind::Label {
                continue;
            }
            let name = if column.name.is_empty() {
                format!("{NAME_PREFIX}{stem}")
            } else {
                format!("{NAME_PREFIX}{stem}_{}", column.name)
            };
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    for name in names {
        if !is_legal_name(&name) {
            return Err(LoadError::InvalidName {
                origin: origin.into(),
                tag: def.tag.clone(),
                name,
            });
        }
        if !seen.insert(name.clone()) {
            return Err(LoadError::SeriesCollision { origin: origin.into(), name });
        }
    }
    Ok(())
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`
fn is_legal_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn convert_metric(raw: RawMetric, origin: &str) -> Result<MetricDef, LoadError> {
    let tag = raw.tag;
    let field_err = |field: &str, value: &str| LoadError::InvalidField {
        origin: origin.into(),
        tag: tag.clone(),
        field: field.into(),
        value: value.into(),
    };

    let sort = match raw.sort.as_deref() {
        None | Some("name") => SortPolicy::Name,
        Some("data") => SortPolicy::Data,
        Some(other) => return Err(field_err("sort", other)),
    };
    let server = match raw.server.as_deref() {
        None | Some("both") => ServerSelector::Both,
        Some("primary") => ServerSelector::Primary,
        Some("replica") => ServerSelector::Replica,
        Some(other) => return Err(field_err("server", other)),
    };
    let all_databases = match raw.database.as_deref() {
        None | Some("default") => false,
        Some("all") => true,
        Some(other) => return Err(field_err("database", other)),
    };

    if raw.queries.is_empty() {
        return Err(LoadError::NoQueries { origin: origin.into(), tag: tag.clone() });
    }

    let mut alternatives = Vec::with_capacity(raw.queries.len());
    for query in raw.queries {
        let version = parse_version(query.version, raw.extension.is_some(), origin, &tag)?;

        let mut columns = Vec::with_capacity(query.columns.len());
        let mut histograms = 0usize;
        for column in query.columns {
            let kind = match column.kind.as_str() {
                "label" => ColumnKind::Label,
                "gauge" => ColumnKind::Gauge,
                "counter" => ColumnKind::Counter,
                "histogram" => ColumnKind::Histogram,
                other => return Err(field_err("type", other)),
            };
            if kind == ColumnKind::Histogram {
                histograms += 1;
            }
            columns.push(Column {
                name: column.name.unwrap_or_default(),
                description: column.description.unwrap_or_default(),
                kind,
            });
        }
        if histograms > 1 {
            return Err(LoadError::MultipleHistograms { origin: origin.into(), tag: tag.clone() });
        }

        if alternatives.iter().any(|a: &QueryAlternative| a.version == version) {
            return Err(LoadError::DuplicateVersion {
                origin: origin.into(),
                tag: tag.clone(),
                version: version.to_string(),
            });
        }
        alternatives.push(QueryAlternative {
            version,
            sql: query.query,
            is_histogram: histograms == 1,
            columns,
        });
    }
    alternatives.sort_by_key(|a| a.version);

    let collector = raw.collector.unwrap_or_else(|| tag.clone());

    Ok(MetricDef {
        tag,
        collector,
        sort,
        server,
        all_databases,
        extension: raw.extension,
        alternatives,
    })
}

fn parse_version(
    raw: Option<VersionValue>,
    is_extension: bool,
    origin: &str,
    tag: &str,
) -> Result<VersionKey, LoadError> {
    let invalid = |reason: String| LoadError::InvalidVersion {
        origin: origin.into(),
        tag: tag.into(),
        reason,
    };

    match (raw, is_extension) {
        (None, false) => Ok(VersionKey::Postgres(10)),
        (None, true) => Err(invalid("extension metrics require a version key".into())),
        (Some(VersionValue::Int(v)), false) => Ok(VersionKey::Postgres(v)),
        (Some(VersionValue::Int(v)), true) => {
            Ok(VersionKey::Extension(ExtVersion { major: v, minor: 0, patch: 0 }))
        }
        (Some(VersionValue::Text(s)), false) => s
            .parse::<u32>()
            .map(VersionKey::Postgres)
            .map_err(|_| invalid(format!("{s:?} is not a PostgreSQL major version"))),
        (Some(VersionValue::Text(s)), true) => s
            .parse::<ExtVersion>()
            .map(VersionKey::Extension)
            .map_err(invalid),
    }
}

fn read_sources(path: &Path, extensions: &[&str]) -> Result<Vec<(String, String)>, LoadError> {
    let read = |p: &Path| -> Result<(String, String), LoadError> {
        let text = std::fs::read_to_string(p)
            .map_err(|source| LoadError::Read { path: p.to_path_buf(), source })?;
        Ok((p.display().to_string(), text))
    };

    if path.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|source| LoadError::Read { path: path.to_path_buf(), source })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| extensions.contains(&e))
            })
            .collect();
        entries.sort();
        entries.iter().map(|p| read(p)).collect()
    } else {
        Ok(vec![read(path)?])
    }
}

#[derive(Deserialize)]
struct RawFile {
    metrics: Vec<RawMetric>,
}

#[derive(Deserialize)]
struct RawMetric {
    tag: String,
    #[serde(default)]
    collector: Option<String>,
    #[serde(default)]
    sort: Option<String>,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    extension: Option<String>,
    queries: Vec<RawQuery>,
}

#[derive(Deserialize)]
struct RawQuery {
    query: String,
    #[serde(default)]
    version: Option<VersionValue>,
    columns: Vec<RawColumn>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionValue {
    Int(u32),
    Text(String),
}

#[derive(Deserialize)]
struct RawColumn {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    description: Option<String>,
}
