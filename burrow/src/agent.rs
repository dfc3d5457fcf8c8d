//! Private side of the tunnel.
//!
//! Keeps one transfer link to the gateway open and dials the target service
//! for every public connection announced on it.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::{AgentConfig, DEFAULT_HEARTBEAT, DEFAULT_RECONNECT};
use crate::error::{Error, Result};
use crate::id::ConnectionId;
use crate::registry::{ConnectionState, Registry};
use crate::transport::envelope::{Codec, Envelope, EnvelopeKind, Headers};
use crate::transport::socket::{
    ABNORMAL_CLOSURE, NO_STATUS_RECEIVED, Pump, SocketCommand, SocketEvent, SocketHandle,
};
use crate::util;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A target connection the agent still has to open.
///
/// Commands issued for the connection before the dial completes wait in
/// `commands` and are applied once the socket is up.
#[derive(Debug)]
pub struct Dial {
    pub id: ConnectionId,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub commands: UnboundedReceiver<SocketCommand>,
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
pub struct AgentState {
    codec: Codec,
    target: Url,
    registry: Registry,
    link: Option<SocketHandle>,
}

impl AgentState {
    pub fn new(codec: Codec, target: Url) -> Self {
        Self {
            codec,
            target,
            registry: Registry::new(),
            link: None,
        }
    }

    pub fn attach_link(&mut self, link: SocketHandle) {
        self.link = Some(link);
    }

    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Apply an envelope from the gateway. Returns a dial to start when the
    /// envelope announced a new connection.
    pub fn on_link_message(&mut self, data: &Bytes) -> Option<Dial> {
        if !self.codec.is_this(data) {
            trace!("Ignoring foreign frame from server");
            return None;
        }
        let envelope = match self.codec.decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping undecodable envelope: {}", e);
                return None;
            }
        };

        let kind = envelope.kind;
        if matches!(kind, EnvelopeKind::Heartbeat | EnvelopeKind::Assign) {
            debug!("Ignoring {:?} envelope", kind);
            return None;
        }
        let Some(id) = envelope.id.clone() else {
            debug!("Dropping {:?} envelope without id", kind);
            return None;
        };

        match kind {
            EnvelopeKind::Connect => {
                let path = envelope.path.unwrap_or_else(|| "/".to_string());
                self.open_target(id, &path, envelope.headers.unwrap_or_default())
            }
            EnvelopeKind::Close => {
                let code = envelope.code.unwrap_or(NO_STATUS_RECEIVED);
                let reason = envelope.reason.unwrap_or_default();
                if self.registry.close(&id, code, &reason).is_some() {
                    info!("Client closed - #{}", id);
                }
                None
            }
            _ => {
                let payload = envelope.payload();
                if kind == EnvelopeKind::Pong && self.registry.take_answered_pong(&id, &payload) {
                    trace!("Dropping pong already answered for #{}", id);
                    return None;
                }
                let Some(connection) = self.registry.get(&id) else {
                    trace!("Dropping {:?} envelope for closed client #{}", kind, id);
                    return None;
                };
                match kind {
                    EnvelopeKind::Message => connection
                        .socket
                        .send(payload, envelope.text.unwrap_or(false)),
                    EnvelopeKind::Ping => connection.socket.ping(payload),
                    EnvelopeKind::Pong => connection.socket.pong(payload),
                    _ => {}
                }
                None
            }
        }
    }

    fn open_target(
        &mut self,
        id: ConnectionId,
        path: &str,
        headers: Headers,
    ) -> Option<Dial> {
        if self.registry.contains(&id) {
            debug!("Ignoring duplicate connect for #{}", id);
            return None;
        }
        let url = match util::join_target(&self.target, path) {
            Ok(url) => url,
            Err(e) => {
                warn!("Invalid target path {:?} for #{}: {}", path, id, e);
                self.send_to_link(Envelope::close(id, ABNORMAL_CLOSURE, ""));
                return None;
            }
        };

        info!("Client connect - {} - #{}", path, id);
        let (socket, commands) = SocketHandle::channel();
        self.registry
            .insert(id.clone(), socket, ConnectionState::Pending);
        Some(Dial {
            id,
            url,
            headers: util::forwardable_headers(&headers),
            commands,
        })
    }

    pub fn on_link_control(&self, data: &Bytes) {
        if !self.codec.is_this(data) {
            return;
        }
        if let Ok(envelope) = self.codec.decode(data) {
            if envelope.kind == EnvelopeKind::Heartbeat {
                trace!("Heartbeat from server");
            }
        }
    }

    /// Relay something observed on a target socket to the gateway.
    pub fn on_target_event(&mut self, id: &ConnectionId, event: SocketEvent) {
        match event {
            SocketEvent::Open => {
                if self.registry.mark_open(id) {
                    debug!("Target connected for #{}", id);
                }
            }
            SocketEvent::Message { data, text } => {
                if self.registry.contains(id) {
                    self.send_to_link(Envelope::message(id.clone(), data, text));
                }
            }
            SocketEvent::Ping(data) => {
                if self.registry.contains(id) {
                    // The target socket already answered this ping itself.
                    self.registry.note_answered_ping(id, data.clone());
                    self.send_to_link(Envelope::ping(id.clone(), data));
                }
            }
            SocketEvent::Pong(data) => {
                if self.registry.contains(id) {
                    self.send_to_link(Envelope::pong(id.clone(), data));
                }
            }
            SocketEvent::Closed { code, reason } => {
                if self.registry.observe_close(id).is_some() {
                    self.send_to_link(Envelope::close(id.clone(), code, reason));
                    info!("Target closed ({}) - #{}", code, id);
                }
            }
        }
    }

    /// Forget the transfer link and close every target connection with the
    /// link's close code.
    pub fn link_closed(&mut self, code: u16, reason: &str) {
        self.link = None;
        for id in self.registry.ids() {
            self.registry.close(&id, code, reason);
        }
    }

    pub fn heartbeat(&self) {
        let Some(link) = &self.link else {
            return;
        };
        match self.codec.encode(&Envelope::heartbeat(util::unix_millis())) {
            Ok(frame) => link.ping(frame),
            Err(e) => error!("Failed to encode heartbeat: {}", e),
        }
    }

    fn send_to_link(&self, envelope: Envelope) {
        let Some(link) = &self.link else {
            trace!("Not connected, dropping {:?}", envelope.kind);
            return;
        };
        match self.codec.encode(&envelope) {
            Ok(frame) => link.send(frame, false),
            Err(e) => error!("Failed to encode {:?} envelope: {}", envelope.kind, e),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

#[derive(Debug, Clone)]
pub struct Agent {
    config: Arc<AgentConfig>,
    server: Url,
    state: Arc<Mutex<AgentState>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        if config.server.trim().is_empty() {
            return Err(Error::MissingConfig("server"));
        }
        if config.target.trim().is_empty() {
            return Err(Error::MissingConfig("target"));
        }
        let server = Url::parse(&util::with_ws_scheme(&config.server))?;
        let target = Url::parse(&util::with_ws_scheme(&config.target))?;
        let state = AgentState::new(config.codec(), target);
        Ok(Self {
            config: Arc::new(config),
            server,
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    pub async fn is_linked(&self) -> bool {
        self.state.lock().await.is_linked()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connection_count()
    }

    /// Keep a transfer link up, reconnecting after it drops.
    ///
    /// Returns once the link is gone and reconnecting is disabled.
    pub async fn run(&self) -> Result<()> {
        let reconnect = self.config.reconnect.period(DEFAULT_RECONNECT);

        loop {
            match self.connect().await {
                Ok(ws) => {
                    info!("Connected to {}", self.server);
                    self.serve_link(ws).await;
                }
                Err(e) if reconnect.is_none() => return Err(e),
                Err(e) => error!("Failed to connect to {}: {}", self.server, e),
            }

            let Some(delay) = reconnect else {
                return Ok(());
            };
            info!("Reconnecting in {} ms...", delay.as_millis());
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self) -> Result<ClientStream> {
        let mut request = self.server.as_str().into_client_request()?;
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (ws, _) = connect_async(request).await?;
        Ok(ws)
    }

    async fn serve_link(&self, ws: ClientStream) {
        let (socket, commands) = SocketHandle::channel();
        self.state.lock().await.attach_link(socket);

        let _heartbeat = self
            .config
            .heartbeat
            .period(DEFAULT_HEARTBEAT)
            .map(|period| AbortOnDrop(tokio::spawn(heartbeat(self.state.clone(), period))));

        let mut pump = Pump::new(ws, commands);
        while let Some(event) = pump.next_event().await {
            let dial = {
                let mut state = self.state.lock().await;
                match event {
                    SocketEvent::Message { data, .. } => state.on_link_message(&data),
                    SocketEvent::Ping(data) | SocketEvent::Pong(data) => {
                        state.on_link_control(&data);
                        None
                    }
                    SocketEvent::Closed { code, reason } => {
                        warn!("Disconnected from server ({})", code);
                        state.link_closed(code, &reason);
                        None
                    }
                    SocketEvent::Open => None,
                }
            };
            if let Some(dial) = dial {
                self.spawn_dial(dial);
            }
        }
        self.state.lock().await.link_closed(ABNORMAL_CLOSURE, "");
    }

    fn spawn_dial(&self, dial: Dial) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let Dial {
                id,
                url,
                headers,
                commands,
            } = dial;

            let ws = match dial_target(&url, &headers).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("Failed to connect to target {} for #{}: {}", url, id, e);
                    state
                        .lock()
                        .await
                        .on_target_event(&id, SocketEvent::abnormal());
                    return;
                }
            };
            state.lock().await.on_target_event(&id, SocketEvent::Open);

            let mut pump = Pump::new(ws, commands);
            while let Some(event) = pump.next_event().await {
                state.lock().await.on_target_event(&id, event);
            }
        });
    }
}

async fn dial_target(url: &Url, headers: &[(String, String)]) -> Result<ClientStream> {
    let mut request = url.as_str().into_client_request()?;
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!("Skipping unforwardable header {:?}", name);
            continue;
        };
        request.headers_mut().append(name, value);
    }
    let (ws, _) = connect_async(request).await?;
    Ok(ws)
}

async fn heartbeat(state: Arc<Mutex<AgentState>>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        state.lock().await.heartbeat();
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
