use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::{Message, WebSocket, Ws};
use warp::{http::StatusCode, reply, Filter, Rejection, Reply};

use super::namespace::ProxyNamespace;
use super::types::{ApiError, Inbound, Outbound};
use crate::error_handling::types::{SessionError, WebError};
use crate::network::dispatcher::Dispatcher;
use crate::session_management::SessionManager;

fn bad_id() -> reply::Response {
    reply::with_status(
        reply::json(&ApiError::new("Invalid session id")),
        StatusCode::BAD_REQUEST,
    )
    .into_response()
}

fn not_found(id: &Uuid) -> reply::Response {
    reply::with_status(
        reply::json(&ApiError::new(format!("No session {}", id))),
        StatusCode::NOT_FOUND,
    )
    .into_response()
}

/// GET /sessions
pub fn list_sessions_route(
    manager: Arc<SessionManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("sessions")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(move || {
            let manager = manager.clone();
            async move {
                Ok::<_, Rejection>(reply::with_status(
                    reply::json(&manager.snapshots()),
                    StatusCode::OK,
                ))
            }
        })
}

/// GET /sessions/:id
pub fn get_session_route(
    manager: Arc<SessionManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sessions" / String)
        .and(warp::get())
        .and_then(move |id_str: String| {
            let manager = manager.clone();
            async move {
                let Ok(id) = Uuid::parse_str(&id_str) else {
                    return Ok::<_, Rejection>(bad_id());
                };
                let res = match manager.get_session(&id) {
                    Some(session) => reply::json(&session.snapshot()).into_response(),
                    None => not_found(&id),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// POST /sessions/:id/terminate
pub fn terminate_session_route(
    manager: Arc<SessionManager>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sessions" / String / "terminate")
        .and(warp::post())
        .and_then(move |id_str: String| {
            let manager = manager.clone();
            async move {
                let Ok(id) = Uuid::parse_str(&id_str) else {
                    return Ok::<_, Rejection>(bad_id());
                };
                let res = match manager.terminate_session(&id).await {
                    Ok(()) => reply::with_status(
                        reply::json(&ApiError::new(format!("Session {} terminated", id))),
                        StatusCode::OK,
                    )
                    .into_response(),
                    Err(SessionError::NotFound) => not_found(&id),
                    Err(e) => reply::with_status(
                        reply::json(&ApiError::new(e.to_string())),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    )
                    .into_response(),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// GET /ssh, upgraded to the browser signaling channel
pub fn ssh_socket_route(
    dispatcher: Arc<Dispatcher>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("ssh")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::addr::remote())
        .map(move |ws: Ws, remote: Option<SocketAddr>| {
            let dispatcher = dispatcher.clone();
            let addr = remote.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
            ws.on_upgrade(move |socket| handle_socket(socket, dispatcher, addr))
        })
}

/// Serves one browser until it disconnects, then closes every room it opened.
pub async fn handle_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>, addr: SocketAddr) {
    info!("Browser connected from {}", addr);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let namespace = ProxyNamespace::new(dispatcher, addr, tx);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Cannot encode {:?}: {}", message, e);
                    continue;
                }
            };
            if ws_tx.send(Message::text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("WebSocket receive error from {}: {}", addr, e);
                break;
            }
        };
        if message.is_close() {
            break;
        }
        let Ok(text) = message.to_str() else {
            continue;
        };
        match serde_json::from_str::<Inbound>(text) {
            Ok(inbound) => namespace.handle(inbound).await,
            Err(e) => warn!("{}", WebError::BadMessage(e.to_string())),
        }
    }

    namespace.shutdown().await;
    writer.abort();
    debug!("Browser {} disconnected", addr);
}
