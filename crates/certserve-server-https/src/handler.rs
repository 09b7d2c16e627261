//! Serve an axum router over decrypted TLS streams

use async_trait::async_trait;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tower::ServiceExt;
use tracing::debug;

use crate::server::{ClientStream, ConnectionHandler};

/// HTTP/1.1 connection handler backed by an axum [`Router`]
#[derive(Clone)]
pub struct RouterHandler {
    router: Router,
}

impl RouterHandler {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl ConnectionHandler for RouterHandler {
    async fn handle(&self, stream: ClientStream, peer: SocketAddr) -> std::io::Result<()> {
        let router = self.router.clone();
        let service = hyper::service::service_fn(move |request: Request<Incoming>| {
            router.clone().oneshot(request)
        });

        hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
            .map_err(|e| {
                debug!("HTTP connection from {} ended with error: {}", peer, e);
                std::io::Error::other(e)
            })
    }
}
