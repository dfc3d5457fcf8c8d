//! Socket plumbing shared by both multiplexers.
//!
//! Every WebSocket is owned by exactly one [`Pump`] task. The rest of the
//! system talks to it through a cloneable [`SocketHandle`], so sends, pings
//! and closes never block the caller and are applied in the order issued.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, trace};

/// Reported when a close frame carried no status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Reported when the transport went away without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const TRY_AGAIN_LATER: u16 = 1013;

/// Whether `code` may be handed to a graceful close.
///
/// Accepts the defined status codes that an endpoint is allowed to send and
/// the ranges reserved for libraries and applications.
pub fn is_legal_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1013 | 3000..=4999)
}

#[derive(Debug)]
pub enum SocketCommand {
    Send(WsMessage),
    Close { code: u16, reason: String },
    /// Drop the transport without a close handshake.
    Terminate,
}

/// Something observed on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message { data: Bytes, text: bool },
    Ping(Bytes),
    Pong(Bytes),
    Closed { code: u16, reason: String },
}

impl SocketEvent {
    pub fn abnormal() -> Self {
        SocketEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocketHandle {
    tx: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SocketCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn dispatch(&self, command: SocketCommand) {
        if self.tx.send(command).is_err() {
            trace!("Socket is already gone, dropping command");
        }
    }

    /// Send a data frame. Text is only used when the payload is valid UTF-8.
    pub fn send(&self, data: Bytes, text: bool) {
        let message = if text {
            match String::from_utf8(data.to_vec()) {
                Ok(text) => WsMessage::Text(text.into()),
                Err(_) => WsMessage::Binary(data),
            }
        } else {
            WsMessage::Binary(data)
        };
        self.dispatch(SocketCommand::Send(message));
    }

    pub fn ping(&self, data: Bytes) {
        self.dispatch(SocketCommand::Send(WsMessage::Ping(data)));
    }

    pub fn pong(&self, data: Bytes) {
        self.dispatch(SocketCommand::Send(WsMessage::Pong(data)));
    }

    /// Close gracefully, or terminate if `code` cannot legally be sent.
    pub fn close(&self, code: u16, reason: &str) {
        if is_legal_close_code(code) {
            self.dispatch(SocketCommand::Close {
                code,
                reason: reason.to_string(),
            });
        } else {
            self.terminate();
        }
    }

    pub fn terminate(&self) {
        self.dispatch(SocketCommand::Terminate);
    }
}

/// Drives one WebSocket: applies commands and yields observed events.
pub struct Pump<S> {
    ws: WebSocketStream<S>,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    commands_open: bool,
    close_seen: bool,
    finished: bool,
}

impl<S> Pump<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>, commands: mpsc::UnboundedReceiver<SocketCommand>) -> Self {
        Self {
            ws,
            commands,
            commands_open: true,
            close_seen: false,
            finished: false,
        }
    }

    /// Next event from the socket, `None` once the socket is done.
    ///
    /// Exactly one [`SocketEvent::Closed`] is yielded per socket unless it was
    /// terminated through its handle.
    pub async fn next_event(&mut self) -> Option<SocketEvent> {
        while !self.finished {
            tokio::select! {
                msg = self.ws.next() => match msg {
                    Some(Ok(msg)) => {
                        if let Some(event) = self.translate(msg) {
                            return Some(event);
                        }
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        return self.finish();
                    }
                    None => return self.finish(),
                },
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.apply(command).await,
                    None => self.commands_open = false,
                },
            }
        }
        None
    }

    fn translate(&mut self, msg: WsMessage) -> Option<SocketEvent> {
        match msg {
            WsMessage::Text(text) => Some(SocketEvent::Message {
                data: Bytes::copy_from_slice(text.as_bytes()),
                text: true,
            }),
            WsMessage::Binary(data) => Some(SocketEvent::Message { data, text: false }),
            WsMessage::Ping(data) => Some(SocketEvent::Ping(data)),
            WsMessage::Pong(data) => Some(SocketEvent::Pong(data)),
            WsMessage::Close(frame) => {
                if self.close_seen {
                    return None;
                }
                self.close_seen = true;
                // Keep polling afterwards so the close reply gets flushed.
                Some(match frame {
                    Some(frame) => SocketEvent::Closed {
                        code: frame.code.into(),
                        reason: frame.reason.as_str().to_string(),
                    },
                    None => SocketEvent::Closed {
                        code: NO_STATUS_RECEIVED,
                        reason: String::new(),
                    },
                })
            }
            WsMessage::Frame(_) => None,
        }
    }

    fn finish(&mut self) -> Option<SocketEvent> {
        self.finished = true;
        if self.close_seen {
            return None;
        }
        self.close_seen = true;
        Some(SocketEvent::abnormal())
    }

    async fn apply(&mut self, command: SocketCommand) {
        let result = match command {
            SocketCommand::Send(msg) => self.ws.send(msg).await,
            SocketCommand::Close { code, reason } => {
                self.ws
                    .close(Some(CloseFrame {
                        code: code.into(),
                        reason: reason.into(),
                    }))
                    .await
            }
            SocketCommand::Terminate => {
                self.finished = true;
                Ok(())
            }
        };
        if let Err(e) = result {
            // The read side reports the failure as a closure.
            debug!("Failed to write to WebSocket: {}", e);
        }
    }
}
