//! Routing of negotiated channels to the session engine.

use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::connector::AssetConnector;
use crate::authorization::{Asset, AssetResolver, SystemUser};
use crate::data_capture::{CommandRecorder, ReplayRecorder, TtyParser};
use crate::error_handling::types::SessionError;
use crate::session_management::{Client, Endpoint, Segmenter, Server, Session, SessionManager};

const OBSERVER_CHECK: Duration = Duration::from_secs(1);

/// Handles channels opened with a `subsystem` request.
#[async_trait]
pub trait SubsystemHandler: Send + Sync {
    async fn handle(&self, name: &str, client: Arc<Client>);
}

/// Refuses every subsystem.
#[derive(Debug, Default)]
pub struct NoSubsystems;

#[async_trait]
impl SubsystemHandler for NoSubsystems {
    async fn handle(&self, name: &str, client: Arc<Client>) {
        warn!("Subsystem {} requested by {} is not available", name, client);
        client
            .send(format!("Subsystem {} is not available\r\n", name).as_bytes())
            .await;
        client.close().await;
    }
}

/// Settings shared by every segmenter the dispatcher builds.
#[derive(Clone)]
pub struct SegmentationSettings {
    pub parser: Arc<dyn TtyParser>,
    pub submit_markers: Vec<Vec<u8>>,
    pub rz_marker: Option<Vec<u8>>,
    pub buffer_budget: usize,
}

impl SegmentationSettings {
    fn segmenter(&self) -> Segmenter {
        Segmenter::new(
            self.parser.clone(),
            self.submit_markers.clone(),
            self.rz_marker.clone(),
            self.buffer_budget,
        )
    }
}

pub struct Dispatcher {
    resolver: Arc<dyn AssetResolver>,
    connector: Arc<dyn AssetConnector>,
    manager: Arc<SessionManager>,
    command_recorder: Arc<dyn CommandRecorder>,
    replay_recorder: Arc<dyn ReplayRecorder>,
    segmentation: SegmentationSettings,
    subsystems: Arc<dyn SubsystemHandler>,
}

impl Dispatcher {
    pub fn new(
        resolver: Arc<dyn AssetResolver>,
        connector: Arc<dyn AssetConnector>,
        manager: Arc<SessionManager>,
        command_recorder: Arc<dyn CommandRecorder>,
        replay_recorder: Arc<dyn ReplayRecorder>,
        segmentation: SegmentationSettings,
    ) -> Self {
        Self {
            resolver,
            connector,
            manager,
            command_recorder,
            replay_recorder,
            segmentation,
            subsystems: Arc::new(NoSubsystems),
        }
    }

    pub fn with_subsystems(mut self, subsystems: Arc<dyn SubsystemHandler>) -> Self {
        self.subsystems = subsystems;
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn resolver(&self) -> &Arc<dyn AssetResolver> {
        &self.resolver
    }

    async fn refuse(client: &Client, message: &str) {
        client.send(format!("{}\r\n", message).as_bytes()).await;
        client.close().await;
    }

    /// Routes one negotiated channel. Returns once the channel is done with.
    pub async fn dispatch(&self, client: Arc<Client>) {
        let request = client.request().clone();

        if let Some(id) = request.watch_target() {
            self.observe(client, id, false).await;
        } else if let Some(id) = request.join_target() {
            self.observe(client, id, true).await;
        } else if request.is_interactive() {
            self.interact(client).await;
        } else if let Some(name) = request.subsystem() {
            self.subsystems.handle(name, client).await;
        } else {
            let message = format!("Not support request type: {}", request.kinds());
            warn!("{} {}", client, message);
            Self::refuse(&client, &message).await;
        }
    }

    async fn interact(&self, client: Arc<Client>) {
        let Some(user) = client.user().cloned() else {
            Self::refuse(&client, "Authentication required").await;
            return;
        };
        let selector = client.request().target.clone().unwrap_or_default();

        match self.resolver.resolve(&user, &selector) {
            Ok((asset, system_user)) => {
                if let Err(e) = self.proxy(client.clone(), asset, system_user).await {
                    warn!("Session for {} ended with: {}", client, e);
                }
                client.close().await;
            }
            Err(e) => {
                warn!("{} cannot reach {:?}: {}", client, selector, e);
                Self::refuse(&client, &e.to_string()).await;
            }
        }
    }

    /// Connects to the backend, registers a session and bridges it until it ends.
    ///
    /// The client is left open; the caller decides what happens to it next.
    pub async fn proxy(
        &self,
        client: Arc<Client>,
        asset: Asset,
        system_user: SystemUser,
    ) -> Result<Uuid, SessionError> {
        let size = client.request().size();
        let backend = match self.connector.connect(&asset, &system_user, size).await {
            Ok(backend) => backend,
            Err(e) => {
                error!("Connect to {} failed: {}", asset, e);
                client
                    .send(format!("Connect to {} failed: {}\r\n", asset.hostname, e).as_bytes())
                    .await;
                return Err(SessionError::BackendUnavailable(e.to_string()));
            }
        };

        let server = Arc::new(Server::new(
            backend,
            asset,
            system_user,
            self.segmentation.segmenter(),
        ));
        let session = Session::new(
            client.clone(),
            server,
            self.command_recorder.clone(),
            self.replay_recorder.clone(),
        );
        let id = session.id();

        if let Err(e) = self.manager.add_session(session.clone()) {
            client.send(b"Too many sessions, try again later\r\n").await;
            session.close().await;
            return Err(e);
        }

        info!("[{}] {} bridged to {}", id, client, session.server());
        let bridging = tokio::spawn({
            let session = session.clone();
            async move { session.bridge().await }
        });
        match bridging.await {
            Ok(result) => result?,
            Err(e) => {
                error!("[{}] Bridge task failed: {}", id, e);
                session.close().await;
            }
        }
        Ok(id)
    }

    async fn observe(&self, client: Arc<Client>, id: Uuid, sharer: bool) {
        let Some(session) = self.manager.get_session(&id) else {
            Self::refuse(&client, &format!("No session {}", id)).await;
            return;
        };

        let attached = if sharer {
            session.add_sharer(client.clone(), false).await
        } else {
            session.add_watcher(client.clone(), false).await
        };
        if let Err(e) = attached {
            Self::refuse(&client, &format!("Cannot attach to {}: {}", id, e)).await;
            return;
        }

        // the channel lives until the session ends or the observer leaves it
        let mut finished = session.finished();
        let mut check = tokio::time::interval(OBSERVER_CHECK);
        loop {
            tokio::select! {
                _ = finished.wait_for(|done| *done) => break,
                _ = check.tick() => {
                    if !session.has_observer(client.id()) {
                        break;
                    }
                }
            }
        }
        client.close().await;
    }
}
