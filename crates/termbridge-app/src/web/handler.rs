//! Per-connection protocol handling.
//!
//! Each WebSocket gets a forwarding task that turns session events into
//! frames, an input task that writes queued input to the terminal, and the
//! receive loop below that decodes client frames. A slow client only backs up
//! its own forwarding task; the terminal read loop never waits on the
//! network. Resize and signal requests skip the input queue, so a terminal
//! that stopped reading can still be interrupted.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use termbridge_terminal::{ClientConnection, ConnectionId, SessionEvent};
use termbridge_types::{ClientMessage, ErrorCode, ServerMessage, SignalKind};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver};
use tracing::{debug, info, warn};

use super::decoder::{Decoded, OutputDecoder};
use super::routes::AppState;

/// Input frames a connection may have waiting on the terminal
const INPUT_QUEUE_FRAMES: usize = 256;

/// Work for the input task, in arrival order
#[derive(Debug)]
enum PendingInput {
    Data(Bytes),
    /// Goes through the terminal like input, so it lands after earlier data
    Eof,
}

/// Drive one client connection for `session_key` until either side closes.
pub async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_key: String,
    size: Option<(u16, u16)>,
) {
    let (connection, events) = ClientConnection::new();
    let connection_id = connection.id;
    let notifier = connection.clone();
    let (mut sink, mut stream) = socket.split();

    let spec = match state.resolver.resolve(&session_key).await {
        Ok(spec) => spec,
        Err(e) => {
            warn!(session_key = %session_key, error = %e, "no command for session");
            let message = ServerMessage::error(ErrorCode::SpawnFailed, format!("{:#}", e));
            reject(&mut sink, message).await;
            return;
        }
    };

    match state.manager.attach(&session_key, spec, connection, size).await {
        Ok(outcome) => {
            info!(
                session_key = %session_key,
                connection_id = %connection_id,
                previous_state = %outcome.previous_state,
                replayed_bytes = outcome.replayed_bytes,
                "client attached"
            );
        }
        Err(e) => {
            warn!(session_key = %session_key, error = %e, "attach failed");
            reject(&mut sink, ServerMessage::error(e.code(), e.to_string())).await;
            return;
        }
    }

    let mut forward = tokio::spawn(forward_events(events, sink));
    let (input, queued) = mpsc::channel(INPUT_QUEUE_FRAMES);
    let writer = tokio::spawn(write_input(
        queued,
        state.clone(),
        session_key.clone(),
        notifier.clone(),
    ));

    loop {
        tokio::select! {
            _ = &mut forward => break,
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    if !handle_frame(frame, &state, &session_key, &notifier, &input).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(session_key = %session_key, error = %e, "websocket receive failed");
                    break;
                }
                None => break,
            }
        }
    }

    writer.abort();
    if state.manager.detach(&session_key, connection_id).await {
        info!(session_key = %session_key, connection_id = %connection_id, "client detached");
    }
    forward.abort();
}

/// Handle one inbound frame. Returns false once the client closed.
async fn handle_frame(
    frame: WsMessage,
    state: &AppState,
    session_key: &str,
    notifier: &ClientConnection,
    input: &Sender<PendingInput>,
) -> bool {
    let message = match frame {
        WsMessage::Text(text) => match ClientMessage::decode(&text) {
            Ok(message) => message,
            Err(e) => {
                debug!(session_key, error = %e, "undecodable client message");
                notifier.send_error(ErrorCode::ProtocolError, e.to_string());
                return true;
            }
        },
        WsMessage::Binary(data) => {
            queue_input(input, notifier, PendingInput::Data(Bytes::from(data)));
            return true;
        }
        WsMessage::Close(_) => return false,
        WsMessage::Ping(_) | WsMessage::Pong(_) => return true,
    };

    dispatch(message, state, session_key, notifier, input).await;
    true
}

async fn dispatch(
    message: ClientMessage,
    state: &AppState,
    session_key: &str,
    notifier: &ClientConnection,
    input: &Sender<PendingInput>,
) {
    let connection_id: ConnectionId = notifier.id;
    let result = match message {
        ClientMessage::Input { data } => {
            let data = Bytes::from(data.into_bytes());
            queue_input(input, notifier, PendingInput::Data(data));
            return;
        }
        ClientMessage::Signal {
            kind: SignalKind::Eof,
        } => {
            queue_input(input, notifier, PendingInput::Eof);
            return;
        }
        ClientMessage::Resize { rows, cols } => state
            .manager
            .submit_resize(session_key, connection_id, rows, cols)
            .await
            .map(|_| ()),
        ClientMessage::Signal { kind } => {
            state
                .manager
                .submit_signal(session_key, connection_id, kind)
                .await
        }
    };

    if let Err(e) = result {
        notifier.send_error(e.code(), e.to_string());
    }
}

fn queue_input(input: &Sender<PendingInput>, notifier: &ClientConnection, pending: PendingInput) {
    match input.try_send(pending) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(connection_id = %notifier.id, "input queue full, dropping frame");
            notifier.send_error(
                ErrorCode::IoError,
                "terminal is not keeping up with input; frame dropped",
            );
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Write queued input in order until the connection goes away
async fn write_input(
    mut queued: Receiver<PendingInput>,
    state: AppState,
    session_key: String,
    notifier: ClientConnection,
) {
    while let Some(pending) = queued.recv().await {
        match pending {
            PendingInput::Data(data) => submit_input(&state, &session_key, &notifier, data).await,
            PendingInput::Eof => {
                if let Err(e) = state
                    .manager
                    .submit_signal(&session_key, notifier.id, SignalKind::Eof)
                    .await
                {
                    notifier.send_error(e.code(), e.to_string());
                }
            }
        }
    }
}

async fn submit_input(
    state: &AppState,
    session_key: &str,
    notifier: &ClientConnection,
    data: Bytes,
) {
    match state.manager.submit_input(session_key, notifier.id, data).await {
        Ok(report) if !report.rejected.is_empty() => {
            notifier.send_error(
                ErrorCode::InvalidInput,
                format!(
                    "dropped {} disallowed input sequence(s): {}",
                    report.rejected.len(),
                    report.rule_names()
                ),
            );
        }
        Ok(_) => {}
        Err(e) => {
            notifier.send_error(e.code(), e.to_string());
        }
    }
}

/// Encode session events onto the socket until the session closes, the
/// connection is superseded, or the client goes away.
async fn forward_events(
    mut events: UnboundedReceiver<SessionEvent>,
    mut sink: SplitSink<WebSocket, WsMessage>,
) {
    let mut decoder = OutputDecoder::new();
    while let Some(event) = events.recv().await {
        let (message, last) = match event {
            SessionEvent::Output(bytes) => match decoder.decode(&bytes) {
                Some(Decoded::Text(data)) => (ServerMessage::Output { data }, false),
                Some(Decoded::Binary(raw)) => {
                    if sink.send(WsMessage::Binary(raw)).await.is_err() {
                        return;
                    }
                    continue;
                }
                None => continue,
            },
            SessionEvent::Status {
                connected,
                session_key,
            } => (
                ServerMessage::Status {
                    connected,
                    session_key: Some(session_key),
                },
                false,
            ),
            SessionEvent::Error { code, message } => (ServerMessage::error(code, message), false),
            SessionEvent::Closed { exit_code } => {
                if let Some(Decoded::Binary(raw)) = decoder.finish() {
                    if sink.send(WsMessage::Binary(raw)).await.is_err() {
                        return;
                    }
                }
                (ServerMessage::Closed { exit_code }, true)
            }
            SessionEvent::Superseded => break,
        };

        if !send(&mut sink, &message).await {
            return;
        }
        if last {
            break;
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
}

async fn send(sink: &mut SplitSink<WebSocket, WsMessage>, message: &ServerMessage) -> bool {
    match message.encode() {
        Ok(json) => sink.send(WsMessage::Text(json)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode server message");
            true
        }
    }
}

/// Report a failure on a connection that never attached, then close it.
async fn reject(sink: &mut SplitSink<WebSocket, WsMessage>, message: ServerMessage) {
    if send(sink, &message).await {
        let _ = sink.send(WsMessage::Close(None)).await;
    }
}
