use snapcrawler::config::PipelineConfig;
use snapcrawler::engine::{Dispatcher, LineFileCollector};
use snapcrawler::ops::telemetry;
use snapcrawler::persistence::{JsonlMetadataStore, MetadataStore};
use std::process::ExitCode;
use std::sync::Arc;

// * Metadata lives next to the images
const METADATA_DIR: &str = ".snapcrawler";

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: snapcrawler <config.json> <candidates.txt>");
        return ExitCode::from(2);
    }

    let config = match PipelineConfig::from_json_file(&args[1]) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, path = %args[1], "Failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let store = match JsonlMetadataStore::open(config.storage.root.join(METADATA_DIR)).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open metadata store");
            return ExitCode::FAILURE;
        }
    };
    let store: Arc<dyn MetadataStore> = Arc::new(store);

    let metrics = match config.run.metrics_port {
        Some(port) => match telemetry::start_metrics_server(port).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, port = port, "Metrics server not started");
                None
            }
        },
        None => None,
    };

    let dispatcher = Dispatcher::new(config, Arc::clone(&store), None);
    let stop = dispatcher.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, draining");
            stop.stop();
        }
    });

    let collector = LineFileCollector::new(&args[2]);
    let exit = match dispatcher.run(&collector).await {
        Ok(report) => {
            match store.count_by_source(5).await {
                Ok(top) => {
                    for entry in top {
                        tracing::info!(source = %entry.source, count = entry.count, "Top source");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Source counts unavailable"),
            }
            tracing::info!(
                starting_count = report.starting_count,
                saved = report.saved,
                total = report.total(),
                dropped = report.stats.total_dropped(),
                stop_reason = %report.stop_reason,
                elapsed_secs = report.elapsed.as_secs_f64(),
                "Run complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Pipeline failed to start");
            ExitCode::FAILURE
        }
    };

    if let Some(handle) = metrics {
        handle.shutdown();
    }
    exit
}
