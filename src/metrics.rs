use prometheus::{Encoder, TextEncoder, GaugeVec, IntCounterVec, Opts, Registry};
use warp::Filter;
use std::net::SocketAddr;
use once_cell::sync::Lazy;
use tracing::error;

use crate::prober::ProbeReport;
use crate::transport::Phase;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Latest measurement only, one series per phase.
static DURATION_GAUGE: Lazy<GaugeVec> = Lazy::new(|| {
    let opts = Opts::new("probe_duration_milliseconds_current", "Last measured probe duration in milliseconds");
    let gauge = GaugeVec::new(opts, &["target", "phase"]).expect("valid gauge definition");
    REGISTRY.register(Box::new(gauge.clone())).expect("gauge registered once");
    gauge
});

static FAILURE_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("probe_failures_total", "Total number of failed probes");
    let ctr = IntCounterVec::new(opts, &["target", "phase"]).expect("valid counter definition");
    REGISTRY.register(Box::new(ctr.clone())).expect("counter registered once");
    ctr
});

pub async fn serve_metrics(addr: SocketAddr) {
    let metrics_route = warp::path!("metrics").map(move || {
        let encoder = TextEncoder::new();
        let body = render().unwrap_or_else(|e| {
            error!("encoding metrics failed: {:?}", e);
            String::new()
        });
        warp::http::Response::builder()
            .header("Content-Type", encoder.format_type())
            .body(body)
    });

    warp::serve(metrics_route).run(addr).await;
}

/// Current registry contents in the Prometheus text format.
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mf = REGISTRY.gather();
    let mut buf = Vec::new();
    encoder.encode(&mf, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

pub fn observe_probe(report: &ProbeReport) {
    let phases = [
        ("total", report.total()),
        ("connection", report.connection()),
        ("processing", report.processing()),
    ];
    for (phase, duration) in phases {
        DURATION_GAUGE
            .with_label_values(&[report.target.as_str(), phase])
            .set(duration.as_secs_f64() * 1000.0);
    }
}

pub fn inc_failure(target: &str, phase: Phase) {
    FAILURE_COUNTER
        .with_label_values(&[target, phase.as_str()])
        .inc();
}
