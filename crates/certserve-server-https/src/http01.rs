//! Plain HTTP listener: ACME HTTP-01 responses and redirects to HTTPS

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use certserve_cert::Http01ChallengeStore;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::server::HttpsServerError;

#[derive(Clone)]
struct Http01State {
    challenges: Http01ChallengeStore,
    https_port: u16,
}

/// Router answering `/.well-known/acme-challenge/{token}` and redirecting
/// everything else to `https_port`
pub fn router(challenges: Http01ChallengeStore, https_port: u16) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(challenge_response))
        .fallback(redirect_to_https)
        .with_state(Http01State {
            challenges,
            https_port,
        })
}

async fn challenge_response(
    State(state): State<Http01State>,
    Path(token): Path<String>,
) -> Response {
    match state.challenges.key_authorization(&token) {
        Some(key_authorization) => {
            debug!("Answering HTTP-01 challenge {}", token);
            (
                [(header::CONTENT_TYPE, "text/plain")],
                key_authorization,
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn redirect_to_https(State(state): State<Http01State>, request: Request) -> Response {
    let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
    else {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let location = https_location(host, state.https_port, path);
    (StatusCode::PERMANENT_REDIRECT, [(header::LOCATION, location)]).into_response()
}

fn https_location(host: &str, https_port: u16, path: &str) -> String {
    let hostname = if host.starts_with('[') {
        // [v6]:port
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    };

    if https_port == 443 {
        format!("https://{}{}", hostname, path)
    } else {
        format!("https://{}:{}{}", hostname, https_port, path)
    }
}

/// Serve `router` over plain HTTP
pub async fn serve_plain(addr: SocketAddr, router: Router) -> Result<(), HttpsServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| HttpsServerError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        })?;

    info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}
