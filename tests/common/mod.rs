//! Shared fixtures for integration tests.
//!
//! Defines a small test API, a server handler implementing it and helpers to
//! start servers and connect clients on random ports.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use woof_websocket::{
    Client, ConnectionId, Error, Handler, Incoming, Message, MessageId, Peer, Server,
    SigningKey, StaticAuthenticationProvider, TransportOptions, TypeId, message_set,
};

// ============================================================================
// Constants
// ============================================================================

/// API key known to the test server.
pub const API_KEY: &[u8] = b"test-api-key";

// ============================================================================
// Test API
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignInRequest {
    pub api_key: Vec<u8>,
}

impl Message for SignInRequest {
    const TYPE_ID: TypeId = TypeId::new(1);
    const SIGNED: bool = true;
    const SIGN_IN: bool = true;

    fn credential(&self) -> Option<&[u8]> {
        Some(&self.api_key)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignInResponse {
    pub is_success: bool,
}

impl Message for SignInResponse {
    const TYPE_ID: TypeId = TypeId::new(2);
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignOutRequest {}

impl Message for SignOutRequest {
    const TYPE_ID: TypeId = TypeId::new(3);
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignOutResponse {}

impl Message for SignOutResponse {
    const TYPE_ID: TypeId = TypeId::new(4);
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDenied {}

impl Message for AccessDenied {
    const TYPE_ID: TypeId = TypeId::new(5);
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

impl Message for ErrorResponse {
    const TYPE_ID: TypeId = TypeId::new(6);
    const ERROR: bool = true;
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {}

impl Message for PingRequest {
    const TYPE_ID: TypeId = TypeId::new(7);
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {}

impl Message for PingResponse {
    const TYPE_ID: TypeId = TypeId::new(8);
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivideRequest {
    pub dividend: i64,
    pub divisor: i64,
}

impl Message for DivideRequest {
    const TYPE_ID: TypeId = TypeId::new(9);
    const SIGNED: bool = true;
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivideResponse {
    pub quotient: i64,
}

impl Message for DivideResponse {
    const TYPE_ID: TypeId = TypeId::new(10);
}

/// Held by the server until `batch` requests arrived, then answered in
/// reverse order.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub value: u32,
    pub batch: u32,
}

impl Message for BatchRequest {
    const TYPE_ID: TypeId = TypeId::new(11);
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub value: u32,
}

impl Message for BatchResponse {
    const TYPE_ID: TypeId = TypeId::new(12);
}

/// Never answered.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilentRequest {}

impl Message for SilentRequest {
    const TYPE_ID: TypeId = TypeId::new(13);
}

/// Answered with an uncorrelated [`ErrorResponse`].
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushRequest {}

impl Message for FlushRequest {
    const TYPE_ID: TypeId = TypeId::new(14);
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub text: String,
}

impl Message for Notice {
    const TYPE_ID: TypeId = TypeId::new(15);
}

message_set! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum Api {
        SignInRequest(SignInRequest),
        SignInResponse(SignInResponse),
        SignOutRequest(SignOutRequest),
        SignOutResponse(SignOutResponse),
        AccessDenied(AccessDenied),
        ErrorResponse(ErrorResponse),
        PingRequest(PingRequest),
        PingResponse(PingResponse),
        DivideRequest(DivideRequest),
        DivideResponse(DivideResponse),
        BatchRequest(BatchRequest),
        BatchResponse(BatchResponse),
        SilentRequest(SilentRequest),
        FlushRequest(FlushRequest),
        Notice(Notice),
    }
}

// ============================================================================
// Server Handler
// ============================================================================

/// Connection lifecycle notifications seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Opened(ConnectionId),
    Closing(ConnectionId),
}

/// Requests collected for a [`BatchRequest`] round.
#[derive(Debug, Default)]
struct Batch(Vec<(MessageId, u32)>);

/// Implements the test API.
pub struct TestServerHandler {
    errors: mpsc::UnboundedSender<Error>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

#[async_trait]
impl Handler<Api> for TestServerHandler {
    async fn on_message(&self, peer: Peer<Api>, incoming: Incoming<Api>) {
        let id = incoming.message_id;

        if incoming.is_unauthorized() {
            let _ = peer.respond(id, AccessDenied {}).await;
            return;
        }

        let Incoming {
            message,
            signature_valid,
            sign_in_key,
            ..
        } = incoming;

        let reply: Option<Api> = match message {
            Api::SignInRequest(_) => {
                let is_success = signature_valid && sign_in_key.is_some();
                if is_success {
                    peer.session().set_key(sign_in_key);
                }
                Some(SignInResponse { is_success }.into())
            }
            Api::SignOutRequest(_) => {
                peer.session().clear_key();
                Some(SignOutResponse {}.into())
            }
            Api::PingRequest(_) => Some(PingResponse {}.into()),
            Api::DivideRequest(DivideRequest { divisor: 0, .. }) => Some(
                ErrorResponse {
                    message: "Division by zero".to_owned(),
                }
                .into(),
            ),
            Api::DivideRequest(request) => Some(
                DivideResponse {
                    quotient: request.dividend / request.divisor,
                }
                .into(),
            ),
            Api::BatchRequest(request) => {
                let ready = peer.session().with(|batch: &mut Batch| {
                    batch.0.push((id, request.value));
                    (batch.0.len() >= request.batch as usize).then(|| std::mem::take(&mut batch.0))
                });
                if let Some(requests) = ready {
                    for (request_id, value) in requests.into_iter().rev() {
                        let _ = peer.respond(request_id, BatchResponse { value }).await;
                    }
                }
                None
            }
            Api::FlushRequest(_) => {
                let flush = ErrorResponse {
                    message: "flush".to_owned(),
                };
                let _ = peer.respond(MessageId::nil(), flush).await;
                None
            }
            _ => None,
        };

        if let Some(reply) = reply {
            let _ = peer.respond(id, reply).await;
        }
    }

    async fn on_receive_error(&self, _peer: Peer<Api>, error: Error) {
        let _ = self.errors.send(error);
    }

    async fn on_connection_opened(&self, peer: Peer<Api>) {
        let _ = self.events.send(ServerEvent::Opened(peer.connection().id()));
    }

    async fn on_connection_closing(&self, peer: Peer<Api>) {
        let _ = self.events.send(ServerEvent::Closing(peer.connection().id()));
    }
}

/// Answers pings and panics when a connection closes.
pub struct PanickingCloseHandler;

#[async_trait]
impl Handler<Api> for PanickingCloseHandler {
    async fn on_message(&self, peer: Peer<Api>, incoming: Incoming<Api>) {
        if let Api::PingRequest(_) = incoming.message {
            let _ = peer.respond(incoming.message_id, PingResponse {}).await;
        }
    }

    async fn on_connection_closing(&self, peer: Peer<Api>) {
        panic!("closing handler failed for {}", peer.connection().id());
    }
}

// ============================================================================
// Client Handler
// ============================================================================

/// Forwards unsolicited messages to a channel.
pub struct RecordingHandler {
    messages: mpsc::UnboundedSender<Api>,
}

#[async_trait]
impl Handler<Api> for RecordingHandler {
    async fn on_message(&self, _peer: Peer<Api>, incoming: Incoming<Api>) {
        let _ = self.messages.send(incoming.message);
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Running server plus its observation channels.
pub struct TestServer {
    pub server: Server<Api>,
    pub url: String,
    pub errors: mpsc::UnboundedReceiver<Error>,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Fixed secret belonging to [`API_KEY`].
pub fn secret() -> SigningKey {
    SigningKey::from_bytes(vec![0x5a; 32]).unwrap()
}

pub fn options() -> TransportOptions {
    TransportOptions::new()
        .with_request_timeout(Some(Duration::from_secs(5)))
        .with_shutdown_grace(Duration::from_millis(500))
}

/// Initializes test logging once, honoring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("woof_websocket=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Test API handler plus the receivers of its error and event channels.
pub fn test_handler() -> (
    TestServerHandler,
    mpsc::UnboundedReceiver<Error>,
    mpsc::UnboundedReceiver<ServerEvent>,
) {
    let (errors_tx, errors) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let handler = TestServerHandler {
        errors: errors_tx,
        events: events_tx,
    };
    (handler, errors, events)
}

/// Starts a server on a random loopback port.
pub async fn start_server() -> anyhow::Result<TestServer> {
    init_tracing();

    let (handler, errors, events) = test_handler();

    let mut auth = StaticAuthenticationProvider::new();
    auth.insert(API_KEY, secret());

    let server = Server::<Api>::builder()
        .handler(handler)
        .auth(auth)
        .options(options())
        .build()?;

    let addr = server.start().await?;

    Ok(TestServer {
        server,
        url: format!("ws://{addr}"),
        errors,
        events,
    })
}

/// Starts a server with a custom handler, returning it and its URL.
pub async fn start_server_with(
    handler: impl Handler<Api>,
    options: TransportOptions,
) -> anyhow::Result<(Server<Api>, String)> {
    init_tracing();

    let server = Server::<Api>::builder()
        .handler(handler)
        .options(options)
        .build()?;
    let addr = server.start().await?;

    Ok((server, format!("ws://{addr}")))
}

/// Builds a client recording unsolicited messages, without connecting.
pub fn client(url: &str) -> anyhow::Result<(Client<Api>, mpsc::UnboundedReceiver<Api>)> {
    let (messages_tx, messages) = mpsc::unbounded_channel();

    let client = Client::<Api>::builder()
        .url(url)
        .handler(RecordingHandler {
            messages: messages_tx,
        })
        .options(options())
        .build()?;

    Ok((client, messages))
}

/// Connects a client recording unsolicited messages.
pub async fn connect(url: &str) -> anyhow::Result<(Client<Api>, mpsc::UnboundedReceiver<Api>)> {
    let (client, messages) = client(url)?;
    client.start().await?;
    Ok((client, messages))
}

/// Signs the client in with [`API_KEY`].
pub async fn sign_in(client: &Client<Api>) -> anyhow::Result<bool> {
    client.session().set_key(secret());
    let response: SignInResponse = client
        .send_and_receive(SignInRequest {
            api_key: API_KEY.to_vec(),
        })
        .await?;
    Ok(response.is_success)
}

/// Waits until `condition` holds, polling every 10ms for at most 2s.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
