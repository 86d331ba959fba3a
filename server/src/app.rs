//! Wiring between configuration and the HTTP server.

use crate::config::Config;
use rpcchan::testing::{TestServer, register_test_service};
use rpcchan_http::Server;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build a server from `config` hosting the test service.
pub fn build_server(config: &Config, service: TestServer) -> Server {
    let mut server = Server::new()
        .with_base_path(&config.base_path)
        .with_max_recv_message_size(config.max_recv_message_size);
    if let Some(max) = config.max_send_message_size {
        server = server.with_max_send_message_size(max);
    }
    register_test_service(&mut server, Arc::new(service));
    server
}

/// Serve on `listener` until `shutdown` is cancelled.
pub async fn run(server: Server, listener: TcpListener, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, base_path = server.base_path(), "serving"),
        Err(e) => info!("serving on unknown address: {e}"),
    }
    Arc::new(server).serve(listener, shutdown).await;
    info!("server stopped");
}
