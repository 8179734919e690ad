use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt, future};
use tracing::{debug, error, info, warn};

use chat_hub::{ClientCommand, Connection, Frame, WritePumpError, hello_frame, parse_client_frame};

use crate::AppState;

/// Drive one live client connection until either side goes away.
///
/// The write half is handed to a write pump fed by the hub; this task owns the
/// read half, forwarding subscriptions to the hub and enforcing the read
/// deadline. Every exit path unregisters the connection.
pub async fn handle_chat_ws(socket: WebSocket, user_id: i64, state: AppState) {
    let ws_config = state.ws_config.clone();
    let (conn, queue) = Connection::with_capacity(user_id, ws_config.send_queue_capacity);

    state.metrics.connection_opened();
    info!(conn_id = %conn.id(), user_id, "WebSocket connected");

    // Queued before any subscription exists, so it is always the first frame
    conn.send(hello_frame());
    state.hub.register(&conn).await;

    let (ws_sender, mut ws_receiver) = socket.split();
    let sink = ws_sender.with(|frame: Frame| future::ready(to_ws_message(frame)));
    let mut pump = tokio::spawn(chat_hub::run_write_pump(queue, sink, ws_config.pump.clone()));

    let read_loop = async {
        loop {
            let next = match tokio::time::timeout(ws_config.read_timeout, ws_receiver.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!(conn_id = %conn.id(), "read deadline exceeded");
                    break;
                }
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, &conn, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_frame(&state, &conn, text).await,
                    Err(_) => {
                        state.metrics.frame_received();
                        state.metrics.malformed_frame();
                        debug!(conn_id = %conn.id(), "ignoring non-UTF-8 binary frame");
                    }
                },
                // Pongs and pings only refresh the deadline
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(conn_id = %conn.id(), "client closed connection");
                    break;
                }
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id(), "WebSocket read error: {}", e);
                    break;
                }
                None => break,
            }
        }
    };
    tokio::pin!(read_loop);

    let finished_pump = tokio::select! {
        _ = &mut read_loop => None,
        res = &mut pump => Some(res),
    };

    state.hub.unregister(&conn).await;

    // Unregistering closes the queue; the pump drains it and sends a close frame
    let pump_result = match finished_pump {
        Some(res) => res,
        None => pump.await,
    };
    match pump_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            state.metrics.websocket_error();
            match e {
                WritePumpError::Timeout(_) => warn!(conn_id = %conn.id(), "write pump ended: {}", e),
                WritePumpError::Transport(_) => debug!(conn_id = %conn.id(), "write pump ended: {}", e),
            }
        }
        Err(e) => error!(conn_id = %conn.id(), "write pump task failed: {}", e),
    }

    state.metrics.connection_closed();
    info!(conn_id = %conn.id(), user_id, "WebSocket disconnected");
}

async fn handle_frame(state: &AppState, conn: &Connection, text: &str) {
    state.metrics.frame_received();
    match parse_client_frame(text) {
        Ok(ClientCommand::Subscribe(chat_ids)) => {
            let allowed = match state
                .repository
                .participating_chat_ids(conn.user_id(), &chat_ids)
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(conn_id = %conn.id(), "failed to check subscriptions: {}", e);
                    return;
                }
            };
            if allowed.len() < chat_ids.len() {
                debug!(
                    conn_id = %conn.id(),
                    requested = chat_ids.len(),
                    allowed = allowed.len(),
                    "dropping subscriptions to chats the user is not in"
                );
            }
            if !allowed.is_empty() {
                state.hub.subscribe(conn, allowed).await;
            }
        }
        Ok(ClientCommand::Unknown(kind)) => {
            state.metrics.unknown_frame();
            debug!(conn_id = %conn.id(), frame_type = %kind, "ignoring unknown frame type");
        }
        Err(e) => {
            state.metrics.malformed_frame();
            debug!(conn_id = %conn.id(), "ignoring frame: {}", e);
        }
    }
}

fn to_ws_message(frame: Frame) -> Result<Message, axum::Error> {
    match frame {
        // Shares the encoded buffer across every recipient
        Frame::Text(payload) => Utf8Bytes::try_from(payload)
            .map(Message::Text)
            .map_err(axum::Error::new),
        Frame::Ping => Ok(Message::Ping(Bytes::new())),
        Frame::Close => Ok(Message::Close(None)),
    }
}
