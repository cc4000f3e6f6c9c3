//! REST front-end: the external interface onto a running agent.
//!
//!   GET  /api/list       — active and passive view snapshot
//!   POST /api/join       — form field `peer`, or a JSON array of addresses
//!   POST /api/broadcast  — form field `message`
//!   GET  /api/config     — current configuration
//!   POST /api/leave      — hard process exit

use std::process::Stdio;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use tokio::process::Command;

use crate::agent::{Agent, MessageHandler};
use crate::config::Config;
use crate::view::ViewSnapshot;

#[derive(Clone)]
pub struct ApiState {
    pub agent: Agent,
    pub cfg: Arc<Config>,
}

pub async fn serve(agent: Agent, cfg: Arc<Config>) -> anyhow::Result<()> {
    let addr = cfg.rest_listen_addr();
    let router = Router::new()
        .route("/api/list", get(list))
        .route("/api/join", post(join))
        .route("/api/broadcast", post(broadcast))
        .route("/api/config", get(config))
        .route("/api/leave", post(leave))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(ApiState { agent, cfg });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "REST API listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn list(State(st): State<ApiState>) -> Json<ViewSnapshot> {
    Json(st.agent.snapshot().await)
}

#[derive(Deserialize)]
struct JoinForm {
    peer: Option<String>,
}

/// Join one peer (`peer=` form field) or try a whole list (JSON array
/// body). Every address failing surfaces as a 5xx.
async fn join(State(st): State<ApiState>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let peers = match parse_join_body(&headers, &body) {
        Ok(peers) => peers,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    if peers.is_empty() {
        return (StatusCode::BAD_REQUEST, "no peers given".to_string()).into_response();
    }
    match st.agent.join(&peers).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn parse_join_body(headers: &HeaderMap, body: &[u8]) -> Result<Vec<String>, String> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/json") {
        return serde_json::from_slice::<Vec<String>>(body).map_err(|e| e.to_string());
    }
    let form: JoinForm = serde_urlencoded::from_bytes(body).map_err(|e| e.to_string())?;
    Ok(form.peer.into_iter().collect())
}

#[derive(Deserialize)]
struct BroadcastForm {
    message: Option<String>,
}

async fn broadcast(State(st): State<ApiState>, Form(form): Form<BroadcastForm>) -> StatusCode {
    if let Some(msg) = form.message {
        if !msg.is_empty() {
            tracing::info!(len = msg.len(), "broadcasting user message");
            st.agent.broadcast(msg.into_bytes()).await;
        }
    }
    StatusCode::OK
}

async fn config(State(st): State<ApiState>) -> Json<Config> {
    Json((*st.cfg).clone())
}

async fn leave() -> StatusCode {
    tracing::info!("leave requested; exiting");
    std::process::exit(0);
}

/// Build the user-message callback from the configuration: each delivered
/// payload runs the configured executable with the payload as its single
/// argument, stdout/stderr inherited. Without a configured handler the
/// callback is a no-op.
pub fn user_message_handler(cfg: &Arc<Config>) -> MessageHandler {
    let script = cfg.user_message_handler.clone();
    Arc::new(move |payload: Vec<u8>| {
        let Some(script) = script.clone() else {
            return;
        };
        tokio::spawn(async move {
            let arg = String::from_utf8_lossy(&payload).into_owned();
            let status = Command::new(&script)
                .arg(arg)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .await;
            match status {
                Ok(st) if !st.success() => {
                    tracing::warn!(handler = %script.display(), status = %st, "user message handler failed")
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(handler = %script.display(), error = %e, "cannot run user message handler")
                }
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(content_type: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(header::CONTENT_TYPE, ct.parse().unwrap());
        }
        headers
    }

    #[test]
    fn join_body_form_single_peer() {
        let headers = header_map(Some("application/x-www-form-urlencoded"));
        let peers = parse_join_body(&headers, b"peer=10.0.0.1%3A8424").unwrap();
        assert_eq!(peers, vec!["10.0.0.1:8424"]);
    }

    #[test]
    fn join_body_json_array() {
        let headers = header_map(Some("application/json"));
        let peers = parse_join_body(&headers, br#"["a:1", "b:2"]"#).unwrap();
        assert_eq!(peers, vec!["a:1", "b:2"]);
    }

    #[test]
    fn join_body_empty_form_yields_no_peers() {
        let headers = header_map(None);
        let peers = parse_join_body(&headers, b"").unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn join_body_bad_json_is_an_error() {
        let headers = header_map(Some("application/json"));
        assert!(parse_join_body(&headers, b"{not json").is_err());
    }
}
