mod config;
mod scheduler;
mod prober;
mod metrics;
mod transport;

use config::ProbeConfig;
use scheduler::Scheduler;
use metrics::{observe_probe, inc_failure};
use prober::http::HttpProber;
use transport::TimedTransport;

use std::sync::Arc;
use tracing::{debug, info, warn};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    // Load config first to get log level
    let config = ProbeConfig::load().await?;
    let log_level = config.get_tracing_level()?;

    println!("Starting http_latency_probe against {}", config.target_url);

    // Init tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
                         .add_directive(format!("http_latency_probe={}", log_level.as_str().to_lowercase()).parse()?))
        .init();

    if let Some(addr) = config.metrics_addr {
        info!("serving metrics on {}", addr);
        tokio::spawn(metrics::serve_metrics(addr));
    }

    let transport = TimedTransport::new(config.dialer(), config.tls_handshake_timeout())?;
    let prober = Arc::new(HttpProber::new(config.target_uri()?, transport));

    let scheduler = Scheduler::new(config.probe_interval_ms, config.stop_condition()?)?;

    // Ctrl-C stops the trigger; probes already running are allowed to finish.
    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping scheduler");
                cancel.cancel();
            }
            Err(e) => warn!("cannot listen for interrupt: {:?}", e),
        }
    });

    let summary = scheduler.run(move |iteration| {
        let prober = prober.clone();
        async move {
            info!("probe {} of {}", iteration, prober.target());
            match prober.probe().await {
                Ok(report) => {
                    debug!("{} answered {}", report.target, report.status);
                    observe_probe(&report);
                    Ok(())
                }
                Err(e) => {
                    inc_failure(&e.target, e.phase);
                    Err(e)
                }
            }
        }
    }).await?;

    info!("done: {} probes, {} succeeded, {} failed", summary.fired, summary.succeeded, summary.failed);
    Ok(())
}
