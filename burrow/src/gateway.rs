//! Public-facing side of the tunnel.
//!
//! Accepts transfer links from agents on the registration path and public
//! WebSocket connections everywhere else, and relays between them.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONNECTION, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_tungstenite::HyperWebsocket;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::Interval;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DEFAULT_HEARTBEAT, GatewayConfig};
use crate::error::{Error, Result};
use crate::id::{ConnectionId, LinkId};
use crate::registry::{ConnectionState, Registry};
use crate::router::Router;
use crate::transport::envelope::{Codec, Envelope, EnvelopeKind, Headers};
use crate::transport::socket::{
    ABNORMAL_CLOSURE, NO_STATUS_RECEIVED, Pump, SocketEvent, SocketHandle, TRY_AGAIN_LATER,
};
use crate::util;

// =============================================================================
// State
// =============================================================================

/// How a link relates to the connection an envelope names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Owner,
    Foreign,
    /// The connection is no longer routed anywhere, e.g. a late envelope
    /// after its close.
    Released,
}

/// Connection and routing state of one gateway.
///
/// Every method runs to completion without awaiting, so callers serialize
/// events by holding the surrounding lock.
#[derive(Debug)]
pub struct GatewayState {
    codec: Codec,
    registry: Registry,
    router: Router,
    strict_routing: bool,
}

impl GatewayState {
    pub fn new(codec: Codec, strict_routing: bool) -> Self {
        Self {
            codec,
            registry: Registry::new(),
            router: Router::new(),
            strict_routing,
        }
    }

    pub fn has_links(&self) -> bool {
        self.router.has_links()
    }

    pub fn link_count(&self) -> usize {
        self.router.link_count()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn register_link(&mut self, socket: SocketHandle) -> LinkId {
        let id = LinkId::generate();
        self.router.register_link(id.clone(), socket);
        id
    }

    /// Drop a transfer link and every connection routed through it.
    pub fn close_link(&mut self, link: &LinkId, code: u16, reason: &str) {
        let Some(orphans) = self.router.unregister_link(link) else {
            return;
        };
        info!(
            "Transfer client #{} closed ({}), dropping {} connection(s)",
            link,
            code,
            orphans.len()
        );
        for id in orphans {
            if self.registry.close(&id, code, reason).is_some() {
                info!("Client closed - #{}", id);
            }
        }
    }

    /// Register a freshly upgraded public connection and ask its link to dial.
    pub fn open_public(
        &mut self,
        socket: SocketHandle,
        path: &str,
        headers: Headers,
    ) -> Result<ConnectionId> {
        let id = ConnectionId::generate();
        if self.router.assign(&id).is_none() {
            return Err(Error::NoTransferLink);
        }
        self.registry.insert(id.clone(), socket, ConnectionState::Open);
        self.forward(&id, Envelope::connect(id.clone(), path, headers));
        Ok(id)
    }

    /// Relay something observed on a public socket to its transfer link.
    pub fn on_public_event(&mut self, id: &ConnectionId, event: SocketEvent) {
        match event {
            SocketEvent::Open => {}
            SocketEvent::Message { data, text } => {
                self.forward(id, Envelope::message(id.clone(), data, text));
            }
            SocketEvent::Ping(data) => {
                // The public socket already answered this ping itself.
                self.registry.note_answered_ping(id, data.clone());
                self.forward(id, Envelope::ping(id.clone(), data));
            }
            SocketEvent::Pong(data) => self.forward(id, Envelope::pong(id.clone(), data)),
            SocketEvent::Closed { code, reason } => {
                if self.registry.observe_close(id).is_some() {
                    self.forward(id, Envelope::close(id.clone(), code, reason));
                    info!("Client closed - #{}", id);
                }
                self.router.release(id);
            }
        }
    }

    /// Apply an envelope received on a transfer link.
    pub fn on_link_message(&mut self, link: &LinkId, data: &Bytes) {
        if !self.codec.is_this(data) {
            trace!("Ignoring foreign frame on transfer client #{}", link);
            return;
        }
        let envelope = match self.codec.decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping undecodable envelope from #{}: {}", link, e);
                return;
            }
        };

        let kind = envelope.kind;
        if !matches!(
            kind,
            EnvelopeKind::Message | EnvelopeKind::Ping | EnvelopeKind::Pong | EnvelopeKind::Close
        ) {
            debug!("Ignoring {:?} envelope from transfer client #{}", kind, link);
            return;
        }
        let Some(id) = envelope.id.clone() else {
            debug!("Dropping {:?} envelope without id from #{}", kind, link);
            return;
        };
        if self.strict_routing {
            match self.origin(&id, link) {
                Origin::Owner => {}
                Origin::Foreign => {
                    warn!(
                        "Dropping {:?} envelope for #{} from transfer client #{} it is not routed to",
                        kind, id, link
                    );
                    return;
                }
                Origin::Released => {
                    trace!("Dropping {:?} envelope for released client #{}", kind, id);
                    return;
                }
            }
        }

        if kind == EnvelopeKind::Close {
            let code = envelope.code.unwrap_or(NO_STATUS_RECEIVED);
            let reason = envelope.reason.unwrap_or_default();
            if self.registry.close(&id, code, &reason).is_some() {
                info!("Client closed - #{}", id);
            }
            self.router.release(&id);
            return;
        }

        let payload = envelope.payload();
        if kind == EnvelopeKind::Pong && self.registry.take_answered_pong(&id, &payload) {
            trace!("Dropping pong already answered for #{}", id);
            return;
        }
        let Some(connection) = self.registry.get(&id) else {
            trace!("Dropping {:?} envelope for closed client #{}", kind, id);
            return;
        };
        match kind {
            EnvelopeKind::Message => connection
                .socket
                .send(payload, envelope.text.unwrap_or(false)),
            EnvelopeKind::Ping => connection.socket.ping(payload),
            EnvelopeKind::Pong => connection.socket.pong(payload),
            _ => {}
        }
    }

    fn origin(&self, id: &ConnectionId, link: &LinkId) -> Origin {
        match self.router.assigned(id) {
            Some(owner) if owner == link => Origin::Owner,
            Some(_) => Origin::Foreign,
            None => Origin::Released,
        }
    }

    /// Transport-level ping/pong on a transfer link.
    pub fn on_link_control(&self, link: &LinkId, data: &Bytes) {
        if !self.codec.is_this(data) {
            return;
        }
        match self.codec.decode(data) {
            Ok(envelope) if envelope.kind == EnvelopeKind::Heartbeat => {
                trace!("Heartbeat from transfer client #{}", link);
            }
            _ => {}
        }
    }

    /// Ping every transfer link with a heartbeat envelope.
    pub fn heartbeat(&self) {
        match self.codec.encode(&Envelope::heartbeat(util::unix_millis())) {
            Ok(frame) => {
                for (_, socket) in self.router.links() {
                    socket.ping(frame.clone());
                }
            }
            Err(e) => error!("Failed to encode heartbeat: {}", e),
        }
    }

    fn forward(&self, id: &ConnectionId, envelope: Envelope) {
        let Some(link) = self.router.route(id) else {
            trace!("No transfer client for #{}, dropping {:?}", id, envelope.kind);
            return;
        };
        match self.codec.encode(&envelope) {
            Ok(frame) => link.send(frame, false),
            Err(e) => error!("Failed to encode {:?} envelope for #{}: {}", envelope.kind, id, e),
        }
    }
}

// =============================================================================
// Server
// =============================================================================

#[derive(Debug, Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    state: Arc<Mutex<GatewayState>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let state = GatewayState::new(config.codec(), config.strict_routing);
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn link_count(&self) -> usize {
        self.state.lock().await.link_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connection_count()
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Server is listening on ws://{}", listener.local_addr()?);

        let mut heartbeat = self
            .config
            .heartbeat
            .period(DEFAULT_HEARTBEAT)
            .map(tokio::time::interval);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let gateway = gateway.clone();
                            async move { gateway.handle_request(req, remote).await }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await
                        {
                            debug!("Connection error from {}: {}", remote, e);
                        }
                    });
                }
                _ = tick(&mut heartbeat) => self.state.lock().await.heartbeat(),
            }
        }
    }

    async fn handle_request(
        &self,
        mut req: Request<Incoming>,
        remote: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        if !hyper_tungstenite::is_upgrade_request(&req) {
            return Ok(empty_response(StatusCode::OK));
        }

        let path = req.uri().path().to_string();

        if self.config.is_register_path(&path) {
            let token = self.config.register_token.as_deref();
            if !util::authorize(req.headers(), token) {
                warn!("Rejected transfer client from {}: unauthorized", remote);
                return Ok(rejection(StatusCode::UNAUTHORIZED));
            }
            let (response, websocket) = match upgrade(&mut req) {
                Ok(upgraded) => upgraded,
                Err(response) => return Ok(response),
            };
            let gateway = self.clone();
            tokio::spawn(async move { gateway.serve_link(websocket, remote).await });
            return Ok(response);
        }

        if !self.config.accepts_path(&path) {
            return Ok(rejection(StatusCode::NOT_FOUND));
        }
        if !self.state.lock().await.has_links() {
            info!("Rejected client from {}: no transfer client", remote);
            return Ok(rejection(StatusCode::SERVICE_UNAVAILABLE));
        }

        let target = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or(path);
        let headers = util::tunneled_headers(req.headers());
        let protocol = util::first_subprotocol(req.headers());
        let (mut response, websocket) = match upgrade(&mut req) {
            Ok(upgraded) => upgraded,
            Err(response) => return Ok(response),
        };
        if let Some(protocol) = protocol {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, protocol);
        }
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway
                .serve_public(websocket, target, headers, remote)
                .await
        });
        Ok(response)
    }

    async fn serve_link(&self, websocket: HyperWebsocket, remote: SocketAddr) {
        let ws = match websocket.await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Transfer client handshake with {} failed: {}", remote, e);
                return;
            }
        };

        let (socket, commands) = SocketHandle::channel();
        let link = self.state.lock().await.register_link(socket);
        info!("Transfer client established #{} (remote {})", link, remote);

        let mut pump = Pump::new(ws, commands);
        while let Some(event) = pump.next_event().await {
            let mut state = self.state.lock().await;
            match event {
                SocketEvent::Message { data, .. } => state.on_link_message(&link, &data),
                SocketEvent::Ping(data) | SocketEvent::Pong(data) => {
                    state.on_link_control(&link, &data)
                }
                SocketEvent::Closed { code, reason } => state.close_link(&link, code, &reason),
                SocketEvent::Open => {}
            }
        }
        self.state
            .lock()
            .await
            .close_link(&link, ABNORMAL_CLOSURE, "");
    }

    async fn serve_public(
        &self,
        websocket: HyperWebsocket,
        path: String,
        headers: Headers,
        remote: SocketAddr,
    ) {
        let ws = match websocket.await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Client handshake with {} failed: {}", remote, e);
                return;
            }
        };

        let (socket, commands) = SocketHandle::channel();
        let opened = self
            .state
            .lock()
            .await
            .open_public(socket.clone(), &path, headers);
        let mut pump = Pump::new(ws, commands);

        let id = match opened {
            Ok(id) => id,
            Err(e) => {
                // The last link went away while the upgrade was in flight.
                warn!("Rejected client from {}: {}", remote, e);
                socket.close(TRY_AGAIN_LATER, "no transfer client");
                while pump.next_event().await.is_some() {}
                return;
            }
        };
        drop(socket);
        info!("Client established - {} - {} - #{}", path, remote, id);

        while let Some(event) = pump.next_event().await {
            self.state.lock().await.on_public_event(&id, event);
        }
    }
}

fn upgrade(
    req: &mut Request<Incoming>,
) -> Result<(Response<Full<Bytes>>, HyperWebsocket), Response<Full<Bytes>>> {
    hyper_tungstenite::upgrade(req, None).map_err(|e| {
        debug!("Failed to upgrade request: {}", e);
        rejection(StatusCode::BAD_REQUEST)
    })
}

/// Empty response that also ends the connection.
fn rejection(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = empty_response(status);
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::transport::envelope::HeaderValue;
    use crate::transport::socket::SocketCommand;

    type Commands = UnboundedReceiver<SocketCommand>;

    fn state() -> GatewayState {
        GatewayState::new(Codec::default(), false)
    }

    fn add_link(state: &mut GatewayState) -> (LinkId, Commands) {
        let (socket, rx) = SocketHandle::channel();
        (state.register_link(socket), rx)
    }

    fn add_client(state: &mut GatewayState, path: &str) -> (ConnectionId, Commands) {
        let (socket, rx) = SocketHandle::channel();
        let id = state.open_public(socket, path, Headers::new()).unwrap();
        (id, rx)
    }

    fn envelopes(rx: &mut Commands) -> Vec<Envelope> {
        let codec = Codec::default();
        let mut out = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let SocketCommand::Send(WsMessage::Binary(data)) = command {
                out.push(codec.decode(&data).unwrap());
            }
        }
        out
    }

    fn commands(rx: &mut Commands) -> Vec<SocketCommand> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn encode(envelope: Envelope) -> Bytes {
        Codec::default().encode(&envelope).unwrap()
    }

    #[test]
    fn test_open_public_without_links() {
        let mut state = state();
        let (socket, _rx) = SocketHandle::channel();

        let result = state.open_public(socket, "/app", Headers::new());
        assert!(matches!(result, Err(Error::NoTransferLink)));
        assert_eq!(state.connection_count(), 0);
    }

    #[test]
    fn test_open_public_sends_connect() {
        let mut state = state();
        let (_link, mut link_rx) = add_link(&mut state);
        let mut headers = Headers::new();
        headers.insert(
            "origin".to_string(),
            HeaderValue::Single("https://app".to_string()),
        );
        let (socket, _rx) = SocketHandle::channel();

        let id = state.open_public(socket, "/app?x=1", headers.clone()).unwrap();

        let sent = envelopes(&mut link_rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeKind::Connect);
        assert_eq!(sent[0].id.as_ref(), Some(&id));
        assert_eq!(sent[0].path.as_deref(), Some("/app?x=1"));
        assert_eq!(sent[0].headers.as_ref(), Some(&headers));
        assert_eq!(state.connection_count(), 1);
    }

    #[test]
    fn test_public_message_is_forwarded() {
        let mut state = state();
        let (_link, mut link_rx) = add_link(&mut state);
        let (id, _rx) = add_client(&mut state, "/app");
        envelopes(&mut link_rx);

        state.on_public_event(
            &id,
            SocketEvent::Message {
                data: Bytes::from_static(b"ping-data"),
                text: false,
            },
        );
        state.on_public_event(&id, SocketEvent::Ping(Bytes::from_static(b"p")));

        let sent = envelopes(&mut link_rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, EnvelopeKind::Message);
        assert_eq!(sent[0].id.as_ref(), Some(&id));
        assert_eq!(sent[0].payload(), Bytes::from_static(b"ping-data"));
        assert_eq!(sent[1].kind, EnvelopeKind::Ping);
        assert_eq!(sent[1].payload(), Bytes::from_static(b"p"));
    }

    #[test]
    fn test_link_envelopes_reach_public_socket() {
        let mut state = state();
        let (link, _link_rx) = add_link(&mut state);
        let (id, mut client_rx) = add_client(&mut state, "/app");

        let text = Envelope::message(id.clone(), Bytes::from_static(b"hi"), true);
        state.on_link_message(&link, &encode(text));
        state.on_link_message(&link, &encode(Envelope::pong(id.clone(), Bytes::new())));

        let sent = commands(&mut client_rx);
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[0],
            SocketCommand::Send(WsMessage::Text(text)) if text.as_str() == "hi"
        ));
        assert!(matches!(&sent[1], SocketCommand::Send(WsMessage::Pong(_))));
    }

    #[test]
    fn test_local_close_then_remote_close() {
        let mut state = state();
        let (link, mut link_rx) = add_link(&mut state);
        let (id, mut client_rx) = add_client(&mut state, "/app");
        envelopes(&mut link_rx);

        state.on_public_event(
            &id,
            SocketEvent::Closed {
                code: 1000,
                reason: "bye".to_string(),
            },
        );
        state.on_link_message(&link, &encode(Envelope::close(id.clone(), 1000, "")));

        let sent = envelopes(&mut link_rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeKind::Close);
        assert_eq!(sent[0].code, Some(1000));
        assert_eq!(sent[0].reason.as_deref(), Some("bye"));
        assert!(commands(&mut client_rx).is_empty());
        assert_eq!(state.connection_count(), 0);
    }

    #[test]
    fn test_remote_close_then_local_close() {
        let mut state = state();
        let (link, mut link_rx) = add_link(&mut state);
        let (id, mut client_rx) = add_client(&mut state, "/app");
        envelopes(&mut link_rx);

        state.on_link_message(&link, &encode(Envelope::close(id.clone(), 1001, "")));
        state.on_public_event(
            &id,
            SocketEvent::Closed {
                code: 1001,
                reason: String::new(),
            },
        );

        assert!(envelopes(&mut link_rx).is_empty());
        let sent = commands(&mut client_rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            SocketCommand::Close { code: 1001, .. }
        ));
        assert_eq!(state.connection_count(), 0);
    }

    #[test]
    fn test_remote_close_with_illegal_code_terminates() {
        let mut state = state();
        let (link, _link_rx) = add_link(&mut state);
        let (id, mut client_rx) = add_client(&mut state, "/app");

        state.on_link_message(&link, &encode(Envelope::close(id.clone(), 1006, "")));

        let sent = commands(&mut client_rx);
        assert!(matches!(sent.as_slice(), [SocketCommand::Terminate]));
    }

    #[test]
    fn test_messages_after_close_are_dropped() {
        let mut state = state();
        let (link, mut link_rx) = add_link(&mut state);
        let (id, mut client_rx) = add_client(&mut state, "/app");
        envelopes(&mut link_rx);

        state.on_link_message(&link, &encode(Envelope::close(id.clone(), 1000, "")));
        commands(&mut client_rx);

        let late = Envelope::message(id.clone(), Bytes::from_static(b"late"), false);
        state.on_link_message(&link, &encode(late));
        state.on_public_event(
            &id,
            SocketEvent::Message {
                data: Bytes::from_static(b"late"),
                text: false,
            },
        );

        assert!(commands(&mut client_rx).is_empty());
        assert!(envelopes(&mut link_rx).is_empty());
    }

    #[test]
    fn test_foreign_and_unknown_frames_are_dropped() {
        let mut state = state();
        let (link, _link_rx) = add_link(&mut state);
        let (_id, mut client_rx) = add_client(&mut state, "/app");

        state.on_link_message(&link, &Bytes::from_static(b"not a tunnel frame"));
        let stray = Envelope::message(ConnectionId::from("c_gone"), Bytes::new(), false);
        state.on_link_message(&link, &encode(stray));

        assert!(commands(&mut client_rx).is_empty());
        assert_eq!(state.connection_count(), 1);
    }

    #[test]
    fn test_link_close_cascades_to_its_connections() {
        let mut state = state();
        let (l, _l_rx) = add_link(&mut state);
        let (x, mut x_rx) = add_client(&mut state, "/app");
        let (y, mut y_rx) = add_client(&mut state, "/app");
        let (m, mut m_rx) = add_link(&mut state);
        let (z, mut z_rx) = add_client(&mut state, "/app");
        assert_eq!(state.router.assigned(&z), Some(&m));
        envelopes(&mut m_rx);

        state.close_link(&l, 1001, "going away");

        for rx in [&mut x_rx, &mut y_rx] {
            assert!(matches!(
                commands(rx).as_slice(),
                [SocketCommand::Close { code: 1001, .. }]
            ));
        }
        assert!(commands(&mut z_rx).is_empty());
        assert!(!state.registry.contains(&x));
        assert!(!state.registry.contains(&y));
        assert!(state.router.assigned(&x).is_none());
        assert!(state.registry.contains(&z));
        assert_eq!(state.router.assigned(&z), Some(&m));
        assert_eq!(state.link_count(), 1);

        // The late close events of x and y are not reported anywhere.
        state.on_public_event(&x, SocketEvent::abnormal());
        assert!(envelopes(&mut m_rx).is_empty());
    }

    #[test]
    fn test_strict_routing_rejects_foreign_links() {
        let mut state = GatewayState::new(Codec::default(), true);
        let (owner, _owner_rx) = add_link(&mut state);
        let (id, mut client_rx) = add_client(&mut state, "/app");
        let (intruder, _intruder_rx) = add_link(&mut state);

        let spoofed = Envelope::message(id.clone(), Bytes::from_static(b"x"), false);
        state.on_link_message(&intruder, &encode(spoofed.clone()));
        assert!(commands(&mut client_rx).is_empty());

        state.on_link_message(&owner, &encode(spoofed));
        assert_eq!(commands(&mut client_rx).len(), 1);
    }

    #[test]
    fn test_pong_for_a_public_ping_is_not_sent_twice() {
        let mut state = state();
        let (link, mut link_rx) = add_link(&mut state);
        let (id, mut client_rx) = add_client(&mut state, "/app");
        envelopes(&mut link_rx);

        state.on_public_event(&id, SocketEvent::Ping(Bytes::from_static(b"p1")));
        let sent = envelopes(&mut link_rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeKind::Ping);

        // The target's pong travels back, but the client already got one.
        state.on_link_message(&link, &encode(Envelope::pong(id.clone(), Bytes::from_static(b"p1"))));
        assert!(commands(&mut client_rx).is_empty());

        state.on_link_message(&link, &encode(Envelope::pong(id.clone(), Bytes::from_static(b"p2"))));
        assert!(matches!(
            commands(&mut client_rx).as_slice(),
            [SocketCommand::Send(WsMessage::Pong(data))] if data.as_ref() == b"p2"
        ));
    }

    #[test]
    fn test_origin_of_link_envelopes() {
        let mut state = GatewayState::new(Codec::default(), true);
        let (owner, _owner_rx) = add_link(&mut state);
        let (id, _client_rx) = add_client(&mut state, "/app");
        let (intruder, _intruder_rx) = add_link(&mut state);

        assert_eq!(state.origin(&id, &owner), Origin::Owner);
        assert_eq!(state.origin(&id, &intruder), Origin::Foreign);

        state.on_link_message(&owner, &encode(Envelope::close(id.clone(), 1000, "")));
        assert_eq!(state.origin(&id, &owner), Origin::Released);
        assert_eq!(state.origin(&id, &intruder), Origin::Released);
    }

    #[test]
    fn test_strict_routing_drops_late_envelopes_quietly() {
        let mut state = GatewayState::new(Codec::default(), true);
        let (owner, mut owner_rx) = add_link(&mut state);
        let (id, mut client_rx) = add_client(&mut state, "/app");
        envelopes(&mut owner_rx);

        state.on_link_message(&owner, &encode(Envelope::close(id.clone(), 1000, "")));
        commands(&mut client_rx);

        let late = Envelope::message(id.clone(), Bytes::from_static(b"late"), false);
        state.on_link_message(&owner, &encode(late));
        state.on_link_message(&owner, &encode(Envelope::close(id.clone(), 1000, "")));

        assert!(commands(&mut client_rx).is_empty());
        assert!(envelopes(&mut owner_rx).is_empty());
        assert_eq!(state.connection_count(), 0);
    }

    #[test]
    fn test_heartbeat_pings_every_link() {
        let mut state = state();
        let (a, mut a_rx) = add_link(&mut state);
        let (_b, mut b_rx) = add_link(&mut state);

        state.heartbeat();

        for rx in [&mut a_rx, &mut b_rx] {
            match commands(rx).as_slice() {
                [SocketCommand::Send(WsMessage::Ping(data))] => {
                    let envelope = Codec::default().decode(data).unwrap();
                    assert_eq!(envelope.kind, EnvelopeKind::Heartbeat);
                    assert!(envelope.ts.is_some());
                    state.on_link_control(&a, data);
                }
                other => panic!("unexpected commands: {other:?}"),
            }
        }
    }
}
