use std::{future::Future, sync::LazyLock, time::Duration};

use herald_common::{Signal, internal, logging, tracing};
use herald_dispatch::{DispatchEngine, Interrupt, InterruptTrigger};
use herald_tracing::traced;
use tokio::sync::broadcast;

use crate::{config::HeraldConfig, render::DirectoryRenderer, transport::LogConnector};

/// How long cache maintenance may take to notice [`Signal::Finalised`]
const MAINTENANCE_GRACE: Duration = Duration::from_secs(5);

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    tokio::signal::ctrl_c().await?;
    anyhow::bail!("Forced shutdown, in-flight sends abandoned")
}

/// Fire `trigger` when the controller broadcasts a shutdown
async fn relay(trigger: InterruptTrigger, mut receiver: broadcast::Receiver<Signal>) {
    loop {
        match receiver.recv().await {
            Ok(Signal::Shutdown | Signal::Finalised) | Err(broadcast::error::RecvError::Closed) => {
                trigger.trigger();
                break;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

/// Process controller: owns the configuration and the engine's lifecycle
#[derive(Debug, Default)]
pub struct Herald {
    config: HeraldConfig,
}

impl Herald {
    #[must_use]
    pub const fn new(config: HeraldConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &HeraldConfig {
        &self.config
    }

    /// Build the engine with the file renderer and the dry-run transport
    ///
    /// # Errors
    ///
    /// Fails if the dispatch configuration is invalid.
    pub fn engine(&self, interrupt: Interrupt) -> anyhow::Result<DispatchEngine> {
        let templates = &self.config.templates;
        let engine = DispatchEngine::builder(self.config.dispatch.clone())
            .connector(std::sync::Arc::new(LogConnector))
            .renderer(std::sync::Arc::new(DirectoryRenderer::new(
                templates.directory.clone(),
                templates.extension.clone(),
            )))
            .interrupt(interrupt)
            .build()?;

        Ok(engine)
    }

    /// Run `job` against a freshly built engine until it finishes
    ///
    /// The cache maintenance loop runs alongside as its own task. The first
    /// CTRL+C or SIGTERM interrupts every pending wait so `job` can wind down,
    /// and its result is still returned; a second CTRL+C abandons it.
    ///
    /// # Errors
    ///
    /// Returns the error of `job`, or of engine or metrics initialisation.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run<F, Fut>(self, job: F) -> anyhow::Result<()>
    where
        F: FnOnce(DispatchEngine) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        logging::init();

        if let Some(metrics) = &self.config.metrics {
            herald_metrics::init_metrics(metrics)?;
        }

        internal!("Controller running");

        let (trigger, interrupt) = Interrupt::new();
        tokio::spawn(relay(trigger, SHUTDOWN_BROADCAST.subscribe()));

        let engine = self.engine(interrupt)?;
        let maintenance = engine.maintenance();
        let lifecycle = SHUTDOWN_BROADCAST.subscribe();
        let mut maintenance = tokio::spawn(async move { maintenance.serve(lifecycle).await });

        let ret = tokio::select! {
            r = job(engine.clone()) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);
        if tokio::time::timeout(MAINTENANCE_GRACE, &mut maintenance).await.is_err() {
            tracing::warn!("Cache maintenance did not stop in time, aborting it");
            maintenance.abort();
        }

        let stats = engine.stats();
        internal!(
            level = INFO,
            "Shutting down: {} sent, {} failed of {} submitted",
            stats.succeeded,
            stats.failed,
            stats.submitted
        );

        ret
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use herald_dispatch::{ErrorKind, SendRequest};

    use super::*;

    #[tokio::test]
    async fn test_relay_triggers_interrupt() {
        let (sender, receiver) = broadcast::channel(4);
        let (trigger, interrupt) = Interrupt::new();
        let relaying = tokio::spawn(relay(trigger, receiver));

        sender.send(Signal::Shutdown).unwrap();
        tokio::time::timeout(Duration::from_secs(5), relaying)
            .await
            .unwrap()
            .unwrap();

        assert!(interrupt.is_triggered());
    }

    #[tokio::test]
    async fn test_engine_renders_from_template_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("remittance.txt"), "{{company_name}} paid you").unwrap();

        let mut config = HeraldConfig::default();
        config.templates.directory = dir.path().to_path_buf();
        let herald = Herald::new(config);

        let engine = herald.engine(Interrupt::never()).unwrap();
        let result = engine
            .send(SendRequest::new("ap@vendor.test", "Remittance", "remittance"))
            .await;
        assert!(result.success, "{result:?}");

        let missing = engine
            .send(SendRequest::new("ap@vendor.test", "Remittance", "unknown"))
            .await;
        assert_eq!(missing.kind, Some(herald_dispatch::ErrorKind::TemplateRender));
    }

    #[tokio::test]
    async fn test_shutdown_lets_job_wind_down() {
        let finished = Arc::new(AtomicBool::new(false));
        let herald = Herald::new(HeraldConfig::default());

        let ret = herald
            .run({
                let finished = Arc::clone(&finished);
                move |engine| async move {
                    SHUTDOWN_BROADCAST.send(Signal::Shutdown).unwrap();
                    tokio::time::sleep(Duration::from_millis(200)).await;

                    let late = engine
                        .send(SendRequest::new("ap@vendor.test", "Remittance", "remittance"))
                        .await;
                    assert_eq!(late.kind, Some(ErrorKind::Interrupted));

                    finished.store(true, Ordering::SeqCst);
                    anyhow::bail!("2 sends cut short")
                }
            })
            .await;

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(ret.unwrap_err().to_string(), "2 sends cut short");
    }
}
