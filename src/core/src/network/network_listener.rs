//! # Network Listener Module
//!
//! This module accepts operator connections on the terminal port, negotiates the requested
//! channel and hands the result to the [`Dispatcher`].
//!
//! The main component is [`NetworkListener`]. Every accepted connection runs on its own task,
//! holding one permit of a connection semaphore for as long as it lives. A connection that does
//! not finish negotiating within the configured timeout is dropped.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │ Incoming        │───▶│ NetworkListener  │───▶│ Dispatcher      │
//! │ Connections     │    │                  │    │ (one task per   │
//! └─────────────────┘    │ - Connection cap │    │  connection)    │
//!                        │ - Negotiation    │    └─────────────────┘
//!                        └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::watch;
//! use sas::network::dispatcher::Dispatcher;
//! use sas::network::handshake::LineHandshake;
//! use sas::network::network_listener::NetworkListener;
//! use sas::error_handling::types::NetworkError;
//!
//! async fn serve(handshake: Arc<LineHandshake>, dispatcher: Arc<Dispatcher>) -> Result<(), NetworkError> {
//!     let listener = Arc::new(NetworkListener::new(
//!         "0.0.0.0:2222".parse().unwrap(),
//!         handshake,
//!         dispatcher,
//!         500,
//!         Duration::from_secs(5),
//!     ));
//!     let socket = listener.bind().await?;
//!     let (_stop_tx, stop_rx) = watch::channel(false);
//!     listener.start_listening(socket, stop_rx).await
//! }
//! ```

use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

use super::dispatcher::Dispatcher;
use super::handshake::LineHandshake;
use super::request::{LoginFrom, Request};
use crate::error_handling::types::NetworkError;
use crate::session_management::Client;

/// Terminal front of the proxy.
///
/// `NetworkListener` is responsible for:
/// - Binding the terminal port
/// - Capping the number of simultaneous connections
/// - Negotiating each connection under a deadline
/// - Handing negotiated channels to the dispatcher
pub struct NetworkListener {
    /// Address the terminal port binds to
    bind_addr: SocketAddr,

    /// Greeting and capability negotiation
    handshake: Arc<LineHandshake>,

    /// Routes negotiated channels to the session engine
    dispatcher: Arc<Dispatcher>,

    /// One permit per live connection
    permits: Arc<Semaphore>,

    /// Deadline for a connection to request a channel
    negotiation_timeout: Duration,
}

impl NetworkListener {
    /// Creates a new `NetworkListener` instance.
    ///
    /// # Arguments
    ///
    /// * `bind_addr` - Address of the terminal port
    /// * `handshake` - Negotiation run on every accepted connection
    /// * `dispatcher` - Receiver of the negotiated channels
    /// * `max_connections` - Connections served at once; extra ones are dropped on accept
    /// * `negotiation_timeout` - Time a connection has to request a channel
    pub fn new(
        bind_addr: SocketAddr,
        handshake: Arc<LineHandshake>,
        dispatcher: Arc<Dispatcher>,
        max_connections: usize,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            bind_addr,
            handshake,
            dispatcher,
            permits: Arc::new(Semaphore::new(max_connections)),
            negotiation_timeout,
        }
    }

    /// Binds the terminal port.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindError`] if the address is unavailable.
    pub async fn bind(&self) -> Result<TcpListener, NetworkError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(NetworkError::BindError)?;
        info!("Terminal listener bound on {}", self.bind_addr);
        Ok(listener)
    }

    /// Accepts connections until `stop` turns true.
    ///
    /// Accept errors are logged and the loop carries on.
    pub async fn start_listening(
        self: Arc<Self>,
        listener: TcpListener,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), NetworkError> {
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("{}", NetworkError::AcceptError(e));
                            continue;
                        }
                    };

                    let permit = match self.permits.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Connection limit reached, dropping {}", addr);
                            continue;
                        }
                    };

                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = this.handle_connection(stream, addr).await {
                            debug!("Connection from {} ended: {}", addr, e);
                        }
                    });
                }
            }
        }
        info!("Terminal listener on {} stopped", self.bind_addr);
        Ok(())
    }

    /// Negotiates one connection and dispatches the requested channel.
    ///
    /// Returns once the channel is done with.
    ///
    /// # Errors
    ///
    /// - [`NetworkError::NegotiationTimeout`] when no channel was requested in time
    /// - whatever the negotiation itself failed with
    pub async fn handle_connection<S>(&self, mut stream: S, addr: SocketAddr) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        debug!("Connection from {}", addr);
        let mut request = Request::new(addr, LoginFrom::Terminal);

        let negotiated = tokio::time::timeout(
            self.negotiation_timeout,
            self.handshake.negotiate(&mut stream, &mut request),
        )
        .await;
        match negotiated {
            Ok(result) => result?,
            Err(_) => {
                warn!("Client not request a valid request, exiting: {}", addr);
                return Err(NetworkError::NegotiationTimeout);
            }
        }

        let client = Arc::new(Client::new(Box::new(stream), Arc::new(request)));
        info!("{} requested {}", client, client.request().kinds());

        let dispatcher = self.dispatcher.clone();
        let channel = tokio::spawn(async move { dispatcher.dispatch(client).await });
        if let Err(e) = channel.await {
            error!("Channel task for {} failed: {}", addr, e);
        }
        Ok(())
    }
}
