//! The operator console: an HTML page with category tabs derived from
//! metric-name prefix clustering, and a compact JSON mirror under `/api`.
//!
//! The console reads the same scrape pipeline (and therefore the same cache)
//! as the metrics endpoint, plus the management `status` payload.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use indexmap::IndexMap;
use serde_json::json;

use pgexporter_parser::MetricGroup;

use crate::context::SharedContext;
use crate::control;

use super::{empty_status, json_response, metrics};

/// Category of one metric family: the segment after the `pgexporter_` prefix.
fn category_of(name: &str) -> String {
    let stripped = name.strip_prefix("pgexporter_").unwrap_or(name);
    let stripped = stripped.strip_prefix("pg_").unwrap_or(stripped);
    stripped.split('_').next().unwrap_or("other").to_string()
}

async fn categorized(ctx: &SharedContext) -> Option<IndexMap<String, Vec<MetricGroup>>> {
    let body = metrics::body(ctx).await.ok()?;
    let text = String::from_utf8_lossy(&body).into_owned();
    let groups = pgexporter_parser::parse_text(&text).ok()?;

    let mut categories: IndexMap<String, Vec<MetricGroup>> = IndexMap::new();
    for group in groups {
        categories.entry(category_of(&group.name)).or_default().push(group);
    }
    Some(categories)
}

/// GET / on the console port.
pub async fn page(ctx: &SharedContext) -> String {
    let status = control::status_payload(ctx, false).await;
    let categories = categorized(ctx).await.unwrap_or_default();

    let mut page = String::from(
        "<html>\n<head><title>pgexporter console</title>\n<style>\n\
         body { font-family: sans-serif; margin: 2em; }\n\
         .tab { display: inline-block; margin-right: 1em; font-weight: bold; }\n\
         table { border-collapse: collapse; margin-bottom: 2em; }\n\
         td, th { border: 1px solid #ccc; padding: 0.25em 0.75em; }\n\
         </style></head>\n<body>\n<h1>pgexporter</h1>\n",
    );

    page.push_str("<h2>Servers</h2>\n<ul>\n");
    if let Some(servers) = status.get("servers").and_then(|s| s.as_array()) {
        for server in servers {
            let name = server.get("server").and_then(|v| v.as_str()).unwrap_or("?");
            let active = server.get("active").and_then(|v| v.as_bool()).unwrap_or(false);
            let role = server.get("role").and_then(|v| v.as_str()).unwrap_or("unknown");
            page.push_str(&format!(
                "  <li>{name}: {} ({role})</li>\n",
                if active { "up" } else { "down" }
            ));
        }
    }
    page.push_str("</ul>\n");

    page.push_str("<div>\n");
    for name in categories.keys() {
        page.push_str(&format!("  <span class=\"tab\"><a href=\"#{name}\">{name}</a></span>\n"));
    }
    page.push_str("</div>\n");

    for (name, groups) in &categories {
        page.push_str(&format!("<h2 id=\"{name}\">{name}</h2>\n<table>\n"));
        page.push_str("<tr><th>metric</th><th>type</th><th>value</th></tr>\n");
        for group in groups {
            let value = group
                .samples
                .first()
                .map(|s| s.value.to_string())
                .unwrap_or_default();
            page.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{value}</td></tr>\n",
                group.name,
                group.kind.as_str(),
            ));
        }
        page.push_str("</table>\n");
    }

    page.push_str("</body>\n</html>\n");
    page
}

/// GET /api — `{categories: [{name, metrics: [{name, type, value}]}]}`.
pub async fn api(ctx: &SharedContext) -> Response<Full<Bytes>> {
    let Some(categories) = categorized(ctx).await else {
        return empty_status(StatusCode::SERVICE_UNAVAILABLE);
    };

    let listed: Vec<_> = categories
        .iter()
        .map(|(name, groups)| {
            json!({
                "name": name,
                "metrics": groups
                    .iter()
                    .map(|group| {
                        json!({
                            "name": group.name,
                            "type": group.kind.as_str(),
                            "value": group.samples.first().map(|s| s.value),
                        })
                    })
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    let body = serde_json::to_vec(&json!({ "categories": listed })).unwrap_or_default();
    json_response(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_cluster_by_prefix() {
        assert_eq!(category_of("pgexporter_postgresql_primary"), "postgresql");
        assert_eq!(category_of("pgexporter_postgresql_version"), "postgresql");
        assert_eq!(category_of("pgexporter_pg_database_size"), "database");
        assert_eq!(category_of("pgexporter_logging_info"), "logging");
        assert_eq!(category_of("pgexporter_state"), "state");
    }
}
