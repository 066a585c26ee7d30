//! Websocket upgrade and per-connection message loop.
//!
//! Every inbound text or binary frame becomes one `ws`/`wss` context run
//! through the application chain. A non-empty context body is sent back on
//! the same connection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, HeaderMap, Method, Uri};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::ConnectionConfig;
use super::connection::{ConnectionHandle, ConnectionRegistry, OutboundMessage};
use super::lifecycle::ServerLifecycle;
use crate::application::RequestHandler;
use crate::context::BaseContext;

/// Shared state carried by the upgrade route.
#[derive(Clone)]
pub(crate) struct WsState {
    pub handler: RequestHandler,
    pub registry: Arc<ConnectionRegistry>,
    pub lifecycle: Arc<ServerLifecycle>,
    pub connection: ConnectionConfig,
}

/// Upgrades any path. The upgrade request becomes the base of every
/// message context on the connection.
pub(crate) async fn upgrade_handler(
    State(state): State<WsState>,
    ws: WebSocketUpgrade,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let mut base = BaseContext::new(method, uri);
    base.headers = headers;
    base.remote_addr = extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    ws.max_message_size(state.connection.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, state, base))
}

async fn serve_socket(socket: WebSocket, state: WsState, base: BaseContext) {
    let (handle, outbound) =
        state
            .registry
            .register(state.handler.protocol(), base.remote_addr, &state.connection);
    info!(connection = %handle.id, path = base.path(), "websocket connected");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound));
    let stopped = state.lifecycle.stopped();
    tokio::pin!(stopped);

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            () = &mut stopped => {
                let _ = handle.try_send(OutboundMessage::Close(Some("server shutting down".into())));
                break;
            }
        };

        let payload = match frame {
            Some(Ok(Message::Text(text))) => Bytes::from(text.as_str().to_owned()),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Err(err)) => {
                debug!(connection = %handle.id, error = %err, "websocket read failed");
                break;
            }
        };

        dispatch(&state, &base, &handle, payload).await;
    }

    state.registry.remove(handle.id);
    drop(handle);
    if let Err(err) = writer.await {
        warn!(error = %err, "websocket writer task failed");
    }
    info!(path = base.path(), "websocket disconnected");
}

async fn dispatch(state: &WsState, base: &BaseContext, handle: &Arc<ConnectionHandle>, payload: Bytes) {
    let _guard = state.lifecycle.track_request();
    let reply = state
        .handler
        .handle_message(base.clone(), Arc::clone(handle), payload)
        .await;
    if let Some(reply) = reply {
        if let Err(err) = handle.send(reply).await {
            warn!(connection = %handle.id, error = %err, "websocket reply dropped");
        }
    }
}

/// Drains the outbound queue into the socket until every sender is gone or
/// a close frame has been written.
async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let (frame, last) = match message {
            OutboundMessage::Text(text) => (Message::Text(text.into()), false),
            OutboundMessage::Binary(bytes) => (Message::Binary(bytes), false),
            OutboundMessage::Close(reason) => (
                Message::Close(Some(CloseFrame {
                    code: axum::extract::ws::close_code::AWAY,
                    reason: reason.unwrap_or_default().into(),
                })),
                true,
            ),
        };
        if sink.send(frame).await.is_err() || last {
            break;
        }
    }
    let _ = sink.close().await;
}
