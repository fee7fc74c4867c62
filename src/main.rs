//! Demo binary for parcel-sort-orchestrator
//!
//! Wires a loopback upstream service, a table-driven path pipeline, node
//! health, run state and the tracing trace sink, feeds a burst of
//! detections through the orchestration loop, and prints the metrics.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json|pretty`: overrides `[observability] log_format`
//! - `RUST_LOG=info`: log level filter (default: info)
//! - `SORTER_CONFIG=path/to/sorter.toml`: load and hot-reload a config file

use parcel_sort_orchestrator::config::loader::{load_from_file, load_from_str};
use parcel_sort_orchestrator::config::resolve_log_format;
use parcel_sort_orchestrator::config::watcher::ConfigWatcher;
use parcel_sort_orchestrator::detection::{ChannelDetectionSource, DetectionEvent};
use parcel_sort_orchestrator::health::NodeHealthRegistry;
use parcel_sort_orchestrator::path::{DiverterDirection, LoggingFailureHandler, TablePathPipeline};
use parcel_sort_orchestrator::run_state::SystemRunState;
use parcel_sort_orchestrator::trace::TracingTraceSink;
use parcel_sort_orchestrator::upstream::{LoopbackReply, LoopbackUpstreamClient};
use parcel_sort_orchestrator::{
    init_tracing_with, metrics, ChuteId, ConfigHandle, DiverterId, OrchestratorBuilder, ParcelId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

const DEMO_CONFIG: &str = r#"
[sorter]
name = "demo-line"
description = "three chutes, one exception chute"

[routing]
sorting_mode = "formal"
exception_chute_id = 999
fixed_chute_id = 2
available_chute_ids = [1, 2, 3]
chute_assignment_timeout_ms = 200

[admission]

[health]
check_node_health = true

[observability]
log_format = "pretty"
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("SORTER_CONFIG").ok().map(PathBuf::from);
    let config = match &config_path {
        Some(path) => load_from_file(path)?,
        None => load_from_str(DEMO_CONFIG, "demo")?,
    };

    // Structured tracing: [observability] log_format, overridden by LOG_FORMAT.
    let log_env = std::env::var("LOG_FORMAT").ok();
    let _ = init_tracing_with(&resolve_log_format(log_env.as_deref(), &config.observability.log_format));
    info!(sorter = %config.sorter.name, mode = ?config.routing.sorting_mode, "Starting parcel-sort-orchestrator demo");
    if config.observability.metrics_enabled {
        // Initialize Prometheus metrics registry before any parcel is processed.
        metrics::init_metrics()?;
    }
    let config = ConfigHandle::new(config);

    // Keep the watcher alive for the whole run.
    let _watcher = match config_path {
        Some(path) => {
            let (watcher, rx) = ConfigWatcher::new(path)?;
            config.follow(rx);
            Some(watcher)
        }
        None => None,
    };

    let upstream = Arc::new(LoopbackUpstreamClient::new(
        LoopbackReply::Cycle(vec![ChuteId(1), ChuteId(2), ChuteId(3), ChuteId(-1)]),
        Duration::from_millis(20),
    ));

    let mut table = TablePathPipeline::new(ChuteId(999)).with_execute_delay(Duration::from_millis(30));
    for (chute, diverter, direction) in [
        (1, 1, DiverterDirection::Left),
        (2, 1, DiverterDirection::Right),
        (3, 2, DiverterDirection::Left),
        (999, 3, DiverterDirection::Straight),
    ] {
        table = table.with_route(
            ChuteId(chute),
            vec![
                (DiverterId(0), DiverterDirection::Straight, Duration::from_millis(400)),
                (DiverterId(diverter), direction, Duration::from_millis(400)),
            ],
        );
    }

    let health = Arc::new(NodeHealthRegistry::new());
    let run_state = Arc::new(SystemRunState::new());
    run_state.start()?;

    let orchestrator = OrchestratorBuilder::from_config(&config, upstream, Arc::new(table))
        .failure_handler(Arc::new(LoggingFailureHandler))
        .node_health(health.clone())
        .run_state(run_state.clone())
        .trace_sink(Arc::new(TracingTraceSink))
        .build();

    let source = Arc::new(ChannelDetectionSource::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = {
        let orchestrator = orchestrator.clone();
        let source = source.clone();
        tokio::spawn(async move { orchestrator.serve(&*source, shutdown_rx).await })
    };
    while source.subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }

    info!("Sending demo detections");
    for id in 1..=8 {
        if id == 5 {
            // Diverter 2 jams halfway through the burst.
            health.mark_unhealthy(DiverterId(2), "wheel jammed");
        }
        if let Err(e) = source.detect(ParcelId(id), 1) {
            tracing::error!(error = %e, "Failed to publish detection");
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    source.publish(DetectionEvent::DuplicateTriggerDetected {
        parcel_id: ParcelId(8_001),
        sensor_id: 1,
        time_since_last_ms: 12,
        reason: "sensor re-fired".to_string(),
    })?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("Demo complete - shutting down");
    let _ = shutdown_tx.send(true);
    loop_handle.await?;

    println!("{}", metrics::gather_metrics());
    Ok(())
}
