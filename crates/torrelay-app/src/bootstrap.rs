use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use torrelay_config::{EngineConfig, LogFormatSetting, LoggingSettings};
use torrelay_core::{JobStore, SystemClock};
use torrelay_events::{EventBus, EventStream};
use torrelay_telemetry::{LogFormat, LoggingConfig, Metrics};
use tracing::{debug, info, warn};

use crate::disk::SysinfoDiskProbe;
use crate::error::{AppError, AppResult};
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::store::{JsonJobStore, MemoryJobStore};

/// Dependencies required to bootstrap the engine.
pub(crate) struct BootstrapDependencies {
    config: EngineConfig,
    events: EventBus,
    metrics: Metrics,
    cancel: CancellationToken,
}

impl BootstrapDependencies {
    /// Construct production dependencies from the environment.
    pub(crate) fn from_env() -> AppResult<Self> {
        let config =
            EngineConfig::load(None).map_err(|err| AppError::config("config.load", err))?;
        let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
        Ok(Self {
            config,
            events: EventBus::new(),
            metrics,
            cancel: CancellationToken::new(),
        })
    }
}

/// Entry point for the boot sequence. Runs until interrupted.
///
/// # Errors
///
/// Returns an error if configuration, logging, or dependency construction
/// fails, or when the interrupt signal cannot be observed.
pub async fn run_app() -> AppResult<()> {
    let dependencies = BootstrapDependencies::from_env()?;
    run_app_with(dependencies).await
}

/// Boot sequence driven entirely by injected dependencies.
pub(crate) async fn run_app_with(dependencies: BootstrapDependencies) -> AppResult<()> {
    let BootstrapDependencies {
        config,
        events,
        metrics,
        cancel,
    } = dependencies;

    torrelay_telemetry::init_logging(&logging_config(&config.logging))
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    info!(
        provider = ?config.provider.kind,
        downloader = ?config.downloader.kind,
        download_root = %config.orchestrator.download_root.display(),
        "torrelay bootstrap starting"
    );

    let client = torrelay_debrid::build_client(&config.provider, cancel.child_token())
        .map_err(|err| AppError::engine("provider.build", err))?;
    let http = reqwest::Client::builder()
        .user_agent(config.provider.user_agent.clone())
        .build()
        .map_err(|err| AppError::http("downloader.http_client", err))?;
    let downloader = torrelay_downloaders::build_downloader(&config.downloader, http)
        .map_err(|err| AppError::downloader("downloader.build", err))?;

    let store: Arc<dyn JobStore> = match &config.orchestrator.state_dir {
        Some(dir) => Arc::new(
            JsonJobStore::open(dir).map_err(|err| AppError::engine("store.open", err))?,
        ),
        None => {
            warn!("no state directory configured; jobs are kept in memory only");
            Arc::new(MemoryJobStore::new())
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        OrchestratorDeps {
            client,
            downloader,
            store,
            disk: Arc::new(SysinfoDiskProbe),
            clock: Arc::new(SystemClock),
            events: events.clone(),
            metrics,
            cancel: cancel.clone(),
        },
    ));
    let event_log = tokio::spawn(log_events(events.subscribe(None), cancel.child_token()));
    orchestrator
        .hydrate()
        .map_err(|err| AppError::engine("orchestrator.hydrate", err))?;

    let driver = tokio::spawn(Arc::clone(&orchestrator).run());

    let signal = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    cancel.cancel();
    if let Err(err) = driver.await {
        warn!(error = %err, "orchestrator task join failed");
    }
    if let Err(err) = event_log.await {
        warn!(error = %err, "event log task join failed");
    }
    signal.map_err(|err| AppError::io("signal.ctrl_c", None, err))?;
    info!("torrelay shutdown complete");
    Ok(())
}

/// Mirror bus events into the log until cancelled or the bus closes.
async fn log_events(mut stream: EventStream, cancel: CancellationToken) -> u64 {
    let mut logged = 0;
    loop {
        let envelope = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        logged += 1;
        debug!(
            event_id = envelope.id,
            kind = envelope.event.kind(),
            job_id = ?envelope.event.job_id(),
            "job event"
        );
    }
    if stream.missed() > 0 {
        warn!(missed = stream.missed(), "event log fell behind the bus");
    }
    logged
}

fn logging_config(settings: &LoggingSettings) -> LoggingConfig<'_> {
    let format = match settings.format {
        Some(LogFormatSetting::Json) => LogFormat::Json,
        Some(LogFormatSetting::Pretty) => LogFormat::Pretty,
        None => LogFormat::infer(),
    };
    LoggingConfig {
        level: &settings.level,
        format,
        build_sha: torrelay_telemetry::build_sha(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_log_drains_the_bus_until_it_closes() {
        let bus = EventBus::new();
        let stream = bus.subscribe(None);
        bus.publish(torrelay_events::Event::DiskSpaceResumed {
            available_bytes: 10,
        });
        bus.publish(torrelay_events::Event::JobRemoved {
            job_id: uuid::Uuid::nil(),
        });
        drop(bus);
        assert_eq!(log_events(stream, CancellationToken::new()).await, 2);
    }

    #[tokio::test]
    async fn event_log_stops_on_cancel() {
        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(log_events(bus.subscribe(None), cancel).await, 0);
    }

    #[test]
    fn logging_settings_map_to_subscriber_config() {
        let settings = LoggingSettings {
            level: "torrelay_app=debug".into(),
            format: Some(LogFormatSetting::Json),
        };
        let config = logging_config(&settings);
        assert_eq!(config.level, "torrelay_app=debug");
        assert_eq!(config.format, LogFormat::Json);

        let inferred_settings = LoggingSettings {
            level: "info".into(),
            format: None,
        };
        let inferred = logging_config(&inferred_settings);
        assert_eq!(inferred.format, LogFormat::infer());
    }
}
