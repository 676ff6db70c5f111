use log::{debug, error, info, warn};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::authorization::StaticInventory;
use crate::configuration::{CommandStorageKind, Config};
use crate::data_capture::{
    CommandStore, FileReplayRecorder, JsonLinesStore, LogStore, QueuedCommandRecorder, ScreenParser,
};
use crate::error_handling::types::*;
use crate::network::connector::TcpConnector;
use crate::network::dispatcher::{Dispatcher, SegmentationSettings};
use crate::network::handshake::LineHandshake;
use crate::network::host_key::HostKey;
use crate::network::network_listener::NetworkListener;
use crate::session_management::SessionManager;
use crate::web_interface::WebServer;

/// Owns every long lived component of the bastion and their lifecycle.
pub struct Controller {
    pub config: Config,
    host_key: HostKey,
    handshake: Arc<LineHandshake>,
    dispatcher: Arc<Dispatcher>,
    command_recorder: Arc<QueuedCommandRecorder>,
    stop_tx: watch::Sender<bool>,
}

impl Controller {
    /// Wires recorders, inventory, connector and session registry from `config`.
    ///
    /// Must be called from within a tokio runtime; the command recorder spawns its drain task
    /// right away.
    ///
    /// # Errors
    ///
    /// - [`ControllerError::InitializationFailed`] when the log directory cannot be created
    /// - [`ControllerError::NetworkError`] when the host key can be neither read nor written
    /// - [`ControllerError::RecorderError`] when the command log cannot be opened
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing controller for {}", config.name);

        std::fs::create_dir_all(&config.log_dir).map_err(|e| {
            ControllerError::InitializationFailed(format!(
                "cannot create {}: {}",
                config.log_dir.display(),
                e
            ))
        })?;

        let host_key = HostKey::load_or_generate(&config.host_key_path())?;
        info!("Host key fingerprint: {}", host_key.fingerprint());

        let inventory = Arc::new(StaticInventory::from_config(&config));
        let store: Arc<dyn CommandStore> = match config.recording.command_storage {
            CommandStorageKind::File => {
                Arc::new(JsonLinesStore::open(&config.log_dir.join("commands.jsonl"))?)
            }
            CommandStorageKind::Log => Arc::new(LogStore),
        };
        let command_recorder = QueuedCommandRecorder::spawn(
            store,
            config.recording.batch_size,
            config.recording.queue_size,
        );
        let replay_recorder = Arc::new(FileReplayRecorder::new(
            &config.log_dir,
            config.recording.gzip_replay,
        ));

        let parser = ScreenParser::new()
            .map_err(|e| ControllerError::InitializationFailed(format!("prompt pattern: {}", e)))?;
        let segmentation = SegmentationSettings {
            parser: Arc::new(parser),
            submit_markers: config.submit_markers(),
            rz_marker: config.rz_marker(),
            buffer_budget: config.recording.buffer_budget,
        };

        let manager = Arc::new(SessionManager::new(
            config.max_connections,
            config.heartbeat_interval(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            inventory.clone(),
            Arc::new(TcpConnector::default()),
            manager,
            command_recorder.clone(),
            replay_recorder,
            segmentation,
        ));
        let handshake = Arc::new(LineHandshake::new(
            &config.name,
            &host_key.fingerprint(),
            inventory,
        ));
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            host_key,
            handshake,
            dispatcher,
            command_recorder,
            stop_tx,
        })
    }

    pub fn host_key(&self) -> &HostKey {
        &self.host_key
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        self.dispatcher.manager()
    }

    fn bind_ip(&self) -> Result<IpAddr, ControllerError> {
        self.config
            .bind_host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::BadIPFormatting(self.config.bind_host.clone()).into())
    }

    /// Serves until Ctrl-C, then shuts down.
    pub async fn run(&self) -> Result<(), ControllerError> {
        self.serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        })
        .await
    }

    /// Starts the terminal acceptor, the web front and the session monitor, serves until
    /// `shutdown` resolves and then stops everything.
    pub async fn serve_until<F>(&self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        let ip = self.bind_ip()?;
        let mut listener_task: Option<JoinHandle<()>> = None;
        let mut web_task: Option<JoinHandle<()>> = None;

        if self.config.sshd_port != 0 {
            let listener = Arc::new(NetworkListener::new(
                SocketAddr::new(ip, self.config.sshd_port),
                self.handshake.clone(),
                self.dispatcher.clone(),
                self.config.max_connections,
                self.config.negotiation_timeout(),
            ));
            let socket = listener.bind().await?;
            let stop = self.stop_tx.subscribe();
            listener_task = Some(tokio::spawn(async move {
                if let Err(e) = listener.start_listening(socket, stop).await {
                    error!("Terminal listener failed: {}", e);
                }
            }));
        } else {
            info!("Terminal listener disabled");
        }

        if self.config.httpd_port != 0 {
            let web = WebServer::new(self.dispatcher.clone());
            let addr = SocketAddr::new(ip, self.config.httpd_port);
            web_task = Some(tokio::spawn(async move { web.start(addr).await }));
        } else {
            info!("Web front disabled");
        }

        let monitor = self
            .session_manager()
            .spawn_monitor(self.stop_tx.subscribe());

        shutdown.await;
        self.shutdown().await;

        if let Some(task) = listener_task {
            if let Err(e) = task.await {
                warn!("Terminal listener task ended abnormally: {}", e);
            }
        }
        if let Some(task) = web_task {
            task.abort();
        }
        if let Err(e) = monitor.await {
            warn!("Session monitor task ended abnormally: {}", e);
        }
        Ok(())
    }

    /// Stops accepting, terminates every live session and flushes the command log.
    pub async fn shutdown(&self) {
        info!("Shutting down {}", self.config.name);
        self.stop_tx.send_replace(true);
        self.session_manager().shutdown_all_sessions().await;
        self.command_recorder.stop().await;
        debug!("Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpStream;

    fn config(dir: &TempDir) -> Config {
        Config {
            bind_host: "127.0.0.1".into(),
            sshd_port: 0,
            httpd_port: 0,
            key_dir: dir.path().join("keys"),
            log_dir: dir.path().join("logs"),
            ..Config::default()
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_new_prepares_directories_and_key() {
        let dir = TempDir::new().unwrap();
        let controller = Controller::new(config(&dir)).unwrap();

        assert!(dir.path().join("logs").is_dir());
        assert!(dir.path().join("keys/host_key").is_file());
        assert_eq!(controller.host_key().fingerprint().len(), 64);

        // the key survives a restart
        let again = Controller::new(config(&dir)).unwrap();
        assert_eq!(
            again.host_key().fingerprint(),
            controller.host_key().fingerprint()
        );
        controller.shutdown().await;
        again.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_with_everything_disabled() {
        let dir = TempDir::new().unwrap();
        let controller = Controller::new(config(&dir)).unwrap();

        controller.serve_until(async {}).await.unwrap();
        assert_eq!(controller.session_manager().get_active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_serve_greets_operators() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.sshd_port = free_port();
        cfg.recording.command_storage = CommandStorageKind::Log;
        let port = cfg.sshd_port;
        let controller = Controller::new(cfg).unwrap();
        let fingerprint = controller.host_key().fingerprint();

        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let operator = tokio::spawn(async move {
            // the listener binds once serve_until runs
            let stream = loop {
                match TcpStream::connect(("127.0.0.1", port)).await {
                    Ok(stream) => break stream,
                    Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
                }
            };
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).await.unwrap();
            let _ = done_tx.send(());
            line
        });

        controller
            .serve_until(async {
                let _ = done_rx.await;
            })
            .await
            .unwrap();

        let greeting = operator.await.unwrap();
        assert_eq!(
            greeting.trim_end(),
            format!("sas SAS-1.0 host-key-sha256:{}", fingerprint)
        );
    }
}
