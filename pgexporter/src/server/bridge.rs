//! The federation bridge: aggregates the `/metrics` payloads of upstream
//! exporters of the same format, under the same cache discipline as the
//! primary endpoint, plus a JSON reshaping of the aggregate.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::CacheLockTimeout;
use crate::context::Context;

use super::{empty_status, json_response, text_response};

/// GET /metrics on the bridge port.
pub async fn serve_text(ctx: &Context) -> Response<Full<Bytes>> {
    match text_body(ctx).await {
        Ok(payload) => text_response(payload),
        Err(CacheLockTimeout(timeout)) => {
            debug!(?timeout, "bridge gave up waiting for the cache lock");
            empty_status(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// GET /metrics on the bridge JSON port: the same aggregate reshaped.
pub async fn serve_json(ctx: &Context) -> Response<Full<Bytes>> {
    let text = match text_body(ctx).await {
        Ok(payload) => payload,
        Err(_) => return empty_status(StatusCode::SERVICE_UNAVAILABLE),
    };

    let text = String::from_utf8_lossy(&text);
    let groups = match pgexporter_parser::parse_text(&text) {
        Ok(groups) => groups,
        Err(e) => {
            warn!(error = %e, "bridge payload did not parse as Prometheus text");
            return empty_status(StatusCode::BAD_GATEWAY);
        }
    };

    let metrics: Vec<_> = groups
        .iter()
        .map(|group| {
            json!({
                "name": group.name,
                "help": group.help,
                "type": group.kind.as_str(),
                "samples": group
                    .samples
                    .iter()
                    .map(|sample| {
                        json!({
                            "name": sample.name,
                            "labels": sample
                                .labels
                                .iter()
                                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                                .collect::<serde_json::Map<String, serde_json::Value>>(),
                            "value": sample.value,
                        })
                    })
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    let body = serde_json::to_vec(&json!({ "metrics": metrics })).unwrap_or_default();
    json_response(Bytes::from(body))
}

/// Serves the aggregate out of the bridge cache, or fetches every configured
/// upstream and caches the concatenation.
async fn text_body(ctx: &Context) -> Result<Bytes, CacheLockTimeout> {
    let config = ctx.config.load_full();
    let mut cache = ctx.bridge_cache.lock(config.blocking_timeout).await?;

    if let Some(data) = cache.get() {
        return Ok(Bytes::copy_from_slice(data));
    }
    cache.invalidate();

    let mut aggregate = String::new();
    for endpoint in &config.bridge_endpoints {
        match fetch_upstream(endpoint).await {
            Ok(payload) => {
                aggregate.push_str(&payload);
                if !payload.ends_with('\n') {
                    aggregate.push('\n');
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "bridge upstream fetch failed");
            }
        }
    }

    cache.append(aggregate.as_bytes());
    cache.finalize();

    Ok(Bytes::from(aggregate))
}

async fn fetch_upstream(endpoint: &str) -> Result<String, String> {
    let uri: Uri = endpoint.parse().map_err(|e| format!("invalid endpoint: {e}"))?;

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| format!("no native root certificates: {e}"))?
        .https_or_http()
        .enable_http1()
        .build();
    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

    let response = client.get(uri).await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("upstream answered {}", response.status()));
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| e.to_string())?
        .to_bytes();
    Ok(String::from_utf8_lossy(&body).into_owned())
}
