use std::sync::OnceLock;
use std::time::Duration;

use http::HeaderMap;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::constants;
use crate::group::GroupStats;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn http_latency() -> &'static HistogramVec {
    static METRIC: OnceLock<HistogramVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "cachemesh_http_server_requests_seconds",
                "Server request duration in seconds",
            ),
            &["method", "status"],
        )
        .unwrap();
        registry().register(Box::new(histogram.clone())).unwrap();
        histogram
    })
}

fn group_gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help)).unwrap();
    registry().register(Box::new(gauge.clone())).unwrap();
    gauge
}

fn group_hits() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| group_gauge("cachemesh_group_hits", "Cache hits served locally"))
}

fn group_misses() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| group_gauge("cachemesh_group_misses", "Cache misses (loader invocations)"))
}

fn group_evictions() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| group_gauge("cachemesh_group_evictions", "Entries evicted for size"))
}

fn group_used_bytes() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| group_gauge("cachemesh_group_used_bytes", "Bytes held by the store"))
}

fn group_peer_loads() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| group_gauge("cachemesh_group_peer_loads", "Entries fetched from peers"))
}

fn group_peer_errors() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| group_gauge("cachemesh_group_peer_errors", "Peer fetches that fell back"))
}

pub fn record_latency(method: &str, status: u16, elapsed: Duration) {
    http_latency()
        .with_label_values(&[method, &status.to_string()])
        .observe(elapsed.as_secs_f64());
}

pub fn update_group_stats(stats: &GroupStats) {
    group_hits().set(stats.hits as i64);
    group_misses().set(stats.misses as i64);
    group_evictions().set(stats.evictions as i64);
    group_used_bytes().set(stats.used_bytes as i64);
    group_peer_loads().set(stats.peer_loads as i64);
    group_peer_errors().set(stats.peer_errors as i64);
}

pub fn render() -> String {
    let metrics = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metrics, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    if let Some(val) = headers.get(constants::PROTOCOL_REQUEST_ID_KEY) {
        if let Ok(id) = val.to_str() {
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
