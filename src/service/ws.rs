use std::time::Duration;

use axum::{
    extract::{
        FromRequestParts, Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::request::Parts,
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::api::{ApiError, SharedState};
use super::auth::{AuthenticatedUser, JwtVerifier, bearer_token};
use super::progress::{self, ProgressChannel};
use crate::errors::AuthError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Channel authorization ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Owner of the `/ws/{user_id}` channel being opened.
///
/// Browsers cannot set headers on a WebSocket handshake, so the token comes
/// from the `token` query parameter, falling back to a bearer header.
#[derive(Debug)]
pub struct ChannelUser(pub AuthenticatedUser);

impl FromRequestParts<SharedState> for ChannelUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let Path(user_id) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let query = Query::<ChannelQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(q)| q.token);
        let token = query.as_deref().or(bearer_token(parts));
        authorize_channel(&state.verifier, token, &user_id).map(ChannelUser)
    }
}

/// A channel may only be opened with a valid token whose subject is `user_id`.
fn authorize_channel(
    verifier: &JwtVerifier,
    token: Option<&str>,
    user_id: &str,
) -> Result<AuthenticatedUser, ApiError> {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;
    let user = verifier.verify(token)?;
    if user.id != user_id {
        tracing::warn!(subject = %user.id, channel = %user_id, "live channel requested for another user");
        return Err(ApiError::Forbidden(
            "You can only subscribe to your own progress updates.".into(),
        ));
    }
    Ok(user)
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ChannelUser(user): ChannelUser,
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user.id))
}

async fn handle_socket(socket: WebSocket, state: SharedState, user_id: String) {
    let (sender, receiver) = socket.split();
    serve_connection(&state.progress, user_id, sender, receiver).await;
}

/// Register a connection for `user_id`, pump it until either side goes
/// away, then unregister it.
async fn serve_connection<S, R, E>(progress: &ProgressChannel, user_id: String, sender: S, receiver: R)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let connection_id = Uuid::new_v4();
    let (tx, rx) = progress::sink();
    progress.register(&user_id, connection_id, tx);
    tracing::info!(user_id = %user_id, connection_id = %connection_id, "live channel connected");

    run_socket_loop(sender, receiver, rx).await;

    progress.unregister(connection_id, &user_id);
    tracing::info!(user_id = %user_id, connection_id = %connection_id, "live channel disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards progress frames queued for this connection, echoes client text
/// frames and pings the client every [`PING_INTERVAL`]. If no Pong arrives
/// within [`PONG_TIMEOUT`] of the last one, the loop exits.
async fn run_socket_loop<S, R, E>(
    mut sender: S,
    mut receiver: R,
    mut rx: mpsc::Receiver<String>,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("no pong received, closing live channel");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Progress forwarding ─────────────────────────────────
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::auth::tests::{SECRET, token_for, token_with};
    use futures::channel::mpsc as fmpsc;
    use launchpad_common::ProgressEvent;
    use std::convert::Infallible;
    use std::sync::Arc;

    struct Client {
        outgoing: fmpsc::UnboundedSender<Result<Message, Infallible>>,
        incoming: fmpsc::UnboundedReceiver<Message>,
    }

    fn spawn_connection(
        progress: Arc<ProgressChannel>,
        user_id: &str,
    ) -> (Client, tokio::task::JoinHandle<()>) {
        let (client_tx, server_rx) = fmpsc::unbounded();
        let (server_tx, client_rx) = fmpsc::unbounded();
        let user_id = user_id.to_string();
        let handle = tokio::spawn(async move {
            serve_connection(&progress, user_id, server_tx, server_rx).await;
        });
        (
            Client {
                outgoing: client_tx,
                incoming: client_rx,
            },
            handle,
        )
    }

    async fn wait_for_connections(progress: &ProgressChannel, user_id: &str, n: usize) {
        for _ in 0..100 {
            if progress.connection_count(user_id) == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} connections for {}", n, user_id);
    }

    #[tokio::test]
    async fn test_text_frames_are_echoed() {
        let progress = Arc::new(ProgressChannel::new());
        let (mut client, _handle) = spawn_connection(progress.clone(), "u1");

        client
            .outgoing
            .unbounded_send(Ok(Message::Text("hello".into())))
            .unwrap();
        match client.incoming.next().await {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), "hello"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_progress_events_reach_only_that_user() {
        let progress = Arc::new(ProgressChannel::new());
        let (mut alice, _a) = spawn_connection(progress.clone(), "alice");
        let (mut bob, _b) = spawn_connection(progress.clone(), "bob");
        wait_for_connections(&progress, "alice", 1).await;
        wait_for_connections(&progress, "bob", 1).await;

        let delivered = progress.publish("alice", &ProgressEvent::TemplateReady { total_files: 3 });
        assert_eq!(delivered, 1);

        match alice.incoming.next().await {
            Some(Message::Text(text)) => {
                let frame: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(frame["update_type"], "template_ready");
                assert_eq!(frame["data"]["total_files"], 3);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(bob.incoming.try_next().is_err());
    }

    #[tokio::test]
    async fn test_close_unregisters_connection() {
        let progress = Arc::new(ProgressChannel::new());
        let (client, handle) = spawn_connection(progress.clone(), "u1");
        wait_for_connections(&progress, "u1", 1).await;

        client.outgoing.unbounded_send(Ok(Message::Close(None))).unwrap();
        handle.await.unwrap();
        assert_eq!(progress.connection_count("u1"), 0);
    }

    #[tokio::test]
    async fn test_dropped_client_unregisters_connection() {
        let progress = Arc::new(ProgressChannel::new());
        let (client, handle) = spawn_connection(progress.clone(), "u1");
        wait_for_connections(&progress, "u1", 1).await;

        drop(client);
        handle.await.unwrap();
        assert_eq!(progress.connection_count("u1"), 0);
    }

    fn verifier() -> JwtVerifier {
        JwtVerifier::new(SECRET, "HS256", None).unwrap()
    }

    #[test]
    fn test_channel_requires_token() {
        let err = authorize_channel(&verifier(), None, "u1").unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
        let err = authorize_channel(&verifier(), Some("  "), "u1").unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn test_channel_rejects_invalid_and_expired_tokens() {
        let err = authorize_channel(&verifier(), Some("not-a-jwt"), "u1").unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let expired = token_with(serde_json::json!({
            "sub": "u1",
            "exp": chrono::Utc::now().timestamp() - 3600,
        }));
        let err = authorize_channel(&verifier(), Some(&expired), "u1").unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn test_channel_is_owner_only() {
        let token = token_for("alice");
        let err = authorize_channel(&verifier(), Some(&token), "bob").unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let user = authorize_channel(&verifier(), Some(&token), "alice").unwrap();
        assert_eq!(user.id, "alice");
    }

    #[test]
    fn test_keepalive_constants() {
        assert!(PONG_TIMEOUT > PING_INTERVAL);
        assert_eq!(PING_INTERVAL, Duration::from_secs(30));
        assert_eq!(PONG_TIMEOUT, Duration::from_secs(60));
    }
}
