//! WebSocket client transport.
//!
//! `/socket` authenticates the caller by access token (`?token=` or an
//! `Authorization: Bearer` header), then attaches the socket to the user's
//! event stream through the delivery multiplexer. Text frames coming back
//! are client commands.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::mux::{ClientTransport, Delivery};
use crate::protocol::{ClientCommand, Payload};
use crate::user::UserSession;

/// Longest a single frame write may take before the client is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence allowed from the client. Keepalive pings go out more often than
/// this, so a live client always answers in time.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct WebState {
    pub users: Arc<Vec<Arc<UserSession>>>,
    pub delivery: Delivery,
}

impl WebState {
    fn authenticate(&self, token: &str) -> Option<Arc<UserSession>> {
        self.users.iter().find(|u| u.check_token(token)).cloned()
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/socket", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct SocketQuery {
    token: Option<String>,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
    State(state): State<WebState>,
) -> Response {
    let token = query.token.or_else(|| bearer(&headers));
    let Some(user) = token.and_then(|t| state.authenticate(&t)) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let delivery = state.delivery;
    ws.on_upgrade(move |socket| handle_ws(socket, user, delivery))
        .into_response()
}

async fn handle_ws(socket: WebSocket, user: Arc<UserSession>, delivery: Delivery) {
    let (sink, mut stream) = socket.split();
    let (detach_tx, detached) = watch::channel(false);

    let reader_user = user.clone();
    let reader = tokio::spawn(async move {
        while let Some(text) = next_text(&mut stream, READ_TIMEOUT).await {
            match ClientCommand::parse(&text) {
                Some(cmd) => reader_user.handle_command(cmd).await,
                None => tracing::debug!(user = %reader_user.email(), "Dropped malformed client command"),
            }
        }
        let _ = detach_tx.send(true);
    });

    tracing::info!(user = %user.email(), "WebSocket client attached");
    let mut transport = WsTransport { sink };
    if let Err(e) = delivery.run(&user, &mut transport, detached).await {
        tracing::debug!(user = %user.email(), error = %e, "WebSocket delivery ended");
    }
    reader.abort();
    let _ = transport.sink.close().await;
    tracing::info!(user = %user.email(), "WebSocket client detached");
}

/// Next text frame from the client. `None` once the socket closes, errors,
/// or stays silent for `wait`. Any frame, pongs included, restarts the wait.
async fn next_text<S, E>(stream: &mut S, wait: Duration) -> Option<String>
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
{
    loop {
        match tokio::time::timeout(wait, stream.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => return Some(text.as_str().to_owned()),
            Ok(Some(Ok(WsMessage::Close(_)) | Err(_)) | None) => return None,
            Ok(Some(Ok(_))) => {}
            Err(_) => {
                tracing::debug!("WebSocket client went silent");
                return None;
            }
        }
    }
}

struct WsTransport {
    sink: SplitSink<WebSocket, WsMessage>,
}

impl WsTransport {
    async fn write(&mut self, frame: WsMessage) -> anyhow::Result<()> {
        tokio::time::timeout(WRITE_TIMEOUT, self.sink.send(frame))
            .await
            .map_err(|_| anyhow::anyhow!("write timed out"))??;
        Ok(())
    }
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send(&mut self, payload: &Payload) -> anyhow::Result<()> {
        let text = serde_json::to_string(payload)?;
        self.write(WsMessage::Text(text.into())).await
    }

    async fn keepalive(&mut self) -> anyhow::Result<()> {
        self.write(WsMessage::Ping(Default::default())).await
    }
}
