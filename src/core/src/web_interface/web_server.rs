use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::Filter;

use super::routes::{
    get_session_route, list_sessions_route, ssh_socket_route, terminate_session_route,
};
use crate::network::dispatcher::Dispatcher;
use crate::session_management::SessionManager;

/// Web server for the session API and the browser terminal
pub struct WebServer {
    dispatcher: Arc<Dispatcher>,
    session_manager: Arc<SessionManager>,
}

impl WebServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let session_manager = dispatcher.manager().clone();
        Self {
            dispatcher,
            session_manager,
        }
    }

    /// Serve on `addr` until the task is dropped
    pub async fn start(&self, addr: SocketAddr) {
        let routes = list_sessions_route(self.session_manager.clone())
            .or(get_session_route(self.session_manager.clone()))
            .or(terminate_session_route(self.session_manager.clone()))
            .or(ssh_socket_route(self.dispatcher.clone()));

        info!("Web front listening on {}", addr);
        warp::serve(routes).run(addr).await;
    }
}
