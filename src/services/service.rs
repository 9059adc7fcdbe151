//! Service lifecycle
//!
//! Each generation loads and merges the configuration, watches the file,
//! initializes the message handler and connects every merged client. A
//! configuration change tears the generation down and starts a new one;
//! cancelling the service token stops it for good.

use crate::domain::types::BrokerConfiguration;
use crate::infra::cancel::GenerationTokens;
use crate::infra::config::{load_configuration, ServicePaths};
use crate::infra::merge::to_service_configuration;
use crate::infra::watcher::{spawn_config_watcher, FileFingerprint, DEFAULT_POLL_INTERVAL};
use crate::io::client_id::{client_id, client_id_base};
use crate::io::mqtt::{ClientConnection, MessageSink};
use crate::services::message_handler::{DatabaseMessageHandler, HandlerError};
use anyhow::{bail, Context};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    Restarting,
    Stopping,
    Exited,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
            Self::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// Timing knobs of the service loop
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// How often the configuration file is checked for changes
    pub watcher_poll_interval: Duration,
    /// Wait after a configuration change before reloading
    pub reload_delay: Duration,
    /// Gap between connecting two clients of the same broker
    pub broker_connect_delay: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            watcher_poll_interval: DEFAULT_POLL_INTERVAL,
            reload_delay: Duration::from_secs(10),
            broker_connect_delay: Duration::from_secs(1),
        }
    }
}

enum GenerationEnd {
    Stopped,
    ConfigChanged,
}

pub struct Service {
    paths: ServicePaths,
    settings: ServiceSettings,
    client_id_base: String,
    state: watch::Sender<ServiceState>,
}

impl Service {
    pub fn new(paths: ServicePaths, settings: ServiceSettings) -> Self {
        let client_id_base = client_id_base();
        info!(
            home = %paths.home_directory.display(),
            config = %paths.config_file.display(),
            client_id = %client_id_base,
            "service_created"
        );
        let (state, _) = watch::channel(ServiceState::Created);
        Self { paths, settings, client_id_base, state }
    }

    pub fn state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ServiceState) {
        debug!(state = %state, "service_state");
        self.state.send_replace(state);
    }

    /// Run generations until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Fatal errors cancel `shutdown` before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.set_state(ServiceState::Starting);

        loop {
            let generation = GenerationTokens::new(&shutdown);
            match self.run_generation(&generation).await {
                Ok(GenerationEnd::Stopped) => break,
                Ok(GenerationEnd::ConfigChanged) => {
                    self.set_state(ServiceState::Restarting);
                    info!(delay_ms = self.settings.reload_delay.as_millis() as u64, "service_reloading");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.reload_delay) => {}
                    }
                }
                Err(e) => {
                    error!(critical = true, error = %format!("{e:#}"), "service_fatal");
                    shutdown.cancel();
                    self.set_state(ServiceState::Exited);
                    return Err(e);
                }
            }
        }

        self.set_state(ServiceState::Exited);
        info!("service_stopped");
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<BrokerConfiguration>> {
        let raw = load_configuration(&self.paths.config_file)
            .with_context(|| format!("Failed to load configuration {}", self.paths.config_file.display()))?;
        let brokers = to_service_configuration(&raw, &self.paths.home_directory)
            .context("Failed to merge configuration")?;
        if brokers.is_empty() {
            bail!("no usable broker in configuration {}", self.paths.config_file.display());
        }
        Ok(brokers)
    }

    async fn run_generation(&self, generation: &GenerationTokens) -> anyhow::Result<GenerationEnd> {
        let baseline = FileFingerprint::of(&self.paths.config_file);
        let brokers = self.load()?;

        let watcher = spawn_config_watcher(
            self.paths.config_file.clone(),
            baseline,
            self.settings.watcher_poll_interval,
            generation.config_changed.clone(),
            generation.linked.clone(),
        );

        let handler = match DatabaseMessageHandler::initialize(&brokers, &generation.linked).await {
            Ok(handler) => Arc::new(handler),
            Err(HandlerError::Cancelled) => {
                generation.linked.cancel();
                let _ = watcher.await;
                return Ok(self.generation_end(generation));
            }
            Err(e) => {
                generation.linked.cancel();
                let _ = watcher.await;
                return Err(e).context("Failed to initialize database message handler");
            }
        };

        let mut clients = JoinSet::new();
        let mut client_count = 0;
        for broker in &brokers {
            for (index, client) in broker.clients.iter().enumerate() {
                let connection = ClientConnection {
                    host: broker.host.clone(),
                    port: broker.port,
                    client_id: client_id(&self.client_id_base, index, broker.clients.len()),
                    client: client.clone(),
                };
                let sink: Arc<dyn MessageSink> = handler.clone();
                let cancel = generation.linked.clone();
                let stagger = self.settings.broker_connect_delay * index as u32;
                clients.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(stagger) => {}
                    }
                    connection.run(sink, cancel).await;
                });
                client_count += 1;
            }
        }

        self.set_state(ServiceState::Running);
        info!(brokers = brokers.len(), clients = client_count, "service_running");

        let wait_clients = async {
            while let Some(result) = clients.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "mqtt_client_task_failed");
                }
            }
        };
        tokio::join!(handler.handle_messages(generation.linked.clone()), wait_clients);

        self.set_state(ServiceState::Stopping);
        handler.shutdown().await;
        let _ = watcher.await;

        Ok(self.generation_end(generation))
    }

    fn generation_end(&self, generation: &GenerationTokens) -> GenerationEnd {
        if generation.is_config_change() {
            info!(path = %self.paths.config_file.display(), "service_configuration_changed");
            GenerationEnd::ConfigChanged
        } else {
            GenerationEnd::Stopped
        }
    }
}
