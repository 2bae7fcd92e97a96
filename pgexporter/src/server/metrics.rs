//! The scrape endpoint: serve-from-cache fast path, build-into-cache slow
//! path, and the HTML index.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use tracing::debug;

use crate::cache::CacheLockTimeout;
use crate::collector::{Collector, WireExecutor};
use crate::context::{Context, SharedContext};
use crate::emitter::{self, ExporterStatus};

use super::{empty_status, text_response};

/// GET /metrics.
pub async fn serve(ctx: &SharedContext) -> Response<Full<Bytes>> {
    match body(ctx).await {
        Ok(payload) => text_response(payload),
        Err(CacheLockTimeout(timeout)) => {
            debug!(?timeout, "scrape gave up waiting for the cache lock");
            empty_status(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Produces the scrape payload over the production wire layer.
pub async fn body(ctx: &Context) -> Result<Bytes, CacheLockTimeout> {
    let config = ctx.config.load_full();
    ctx.ensure_probed().await;
    let servers = ctx.snapshot_servers().await;
    let mut exec = WireExecutor::new(servers, config.authentication_timeout);
    let result = body_with_executor(ctx, &mut exec).await;
    exec.close_all().await;
    result
}

/// The cache contract around one scrape: the lock is held for the whole
/// serve-or-build cycle, so concurrent scrapes observe identical bytes while
/// the cache is valid. On a miss the registry is collected through `exec` and
/// the rendered payload becomes the new cache content.
pub async fn body_with_executor(
    ctx: &Context,
    exec: &mut dyn crate::collector::QueryExecutor,
) -> Result<Bytes, CacheLockTimeout> {
    let config = ctx.config.load_full();
    let mut cache = ctx.metrics_cache.lock(config.blocking_timeout).await?;

    if let Some(data) = cache.get() {
        debug!(bytes = data.len(), "serving metrics out of cache");
        return Ok(Bytes::copy_from_slice(data));
    }

    cache.invalidate();

    let servers = ctx.snapshot_servers().await;
    let registry = ctx.registry.load_full();

    let collector = Collector::new(&registry, &servers, &config.collectors);
    let collected = collector.collect(exec).await;

    let body =
        emitter::render(&collected, &ExporterStatus { counters: &ctx.counters, servers: &servers });

    cache.append(body.as_bytes());
    cache.finalize();

    Ok(Bytes::from(body))
}

/// GET / — a plain index of the exposed metric families.
pub fn home_page(ctx: &Context) -> String {
    let registry = ctx.registry.load_full();
    let mut page = String::from(
        "<html>\n<head><title>pgexporter</title></head>\n<body>\n\
         <h1>pgexporter</h1>\n<p><a href=\"/metrics\">Metrics</a></p>\n<ul>\n",
    );
    for def in registry.metrics() {
        page.push_str("  <li>pgexporter_");
        page.push_str(&def.stem());
        page.push_str("</li>\n");
    }
    page.push_str("</ul>\n</body>\n</html>\n");
    page
}
