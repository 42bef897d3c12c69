//! Client/server scenarios over real loopback sockets.

mod common;

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio_test::{assert_err, assert_ok};
use woof_websocket::{Error, ServiceState, TypeId};

use common::*;

// ============================================================================
// Request/Response
// ============================================================================

#[tokio::test]
async fn test_ping_round_trip() -> anyhow::Result<()> {
    let mut fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;

    let response: PingResponse = client.send_and_receive(PingRequest {}).await?;
    assert_eq!(response, PingResponse {});

    assert!(matches!(fixture.events.recv().await, Some(ServerEvent::Opened(_))));
    assert_eq!(fixture.server.connection_count(), 1);

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_sign_in_then_signed_request() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;

    assert!(sign_in(&client).await?);

    let connection = fixture.server.connections().remove(0);
    let session = fixture
        .server
        .session(connection.id())
        .expect("session exists");
    assert_eq!(session.key(), Some(secret()));

    let response: DivideResponse = client
        .send_and_receive(DivideRequest {
            dividend: 84,
            divisor: 2,
        })
        .await?;
    assert_eq!(response.quotient, 42);

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_sign_in_with_wrong_secret_fails() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;

    client.session().set_key(woof_websocket::SigningKey::generate());
    let response: SignInResponse = client
        .send_and_receive(SignInRequest {
            api_key: API_KEY.to_vec(),
        })
        .await?;
    assert!(!response.is_success);

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unsigned_request_is_denied() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;

    let err = client
        .send_and_receive::<DivideResponse>(DivideRequest {
            dividend: 1,
            divisor: 1,
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::UnexpectedMessage {
            type_name: "AccessDenied",
            ..
        }
    ));
    assert_eq!(
        err.into_unexpected::<Api>(),
        Some(Api::AccessDenied(AccessDenied {}))
    );

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_sign_out_revokes_access() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;

    assert!(sign_in(&client).await?);
    let _: SignOutResponse = client.send_and_receive(SignOutRequest {}).await?;

    let result = client
        .send_and_receive::<DivideResponse>(DivideRequest {
            dividend: 4,
            divisor: 2,
        })
        .await;
    assert_err!(result);

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_correlated_error_response() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;
    assert!(sign_in(&client).await?);

    let err = client
        .send_and_receive::<DivideResponse>(DivideRequest {
            dividend: 1,
            divisor: 0,
        })
        .await
        .unwrap_err();

    match err.into_unexpected::<Api>() {
        Some(Api::ErrorResponse(response)) => assert_eq!(response.message, "Division by zero"),
        other => panic!("expected error response, got {other:?}"),
    }

    // Correlated errors do not flush anything else.
    assert_ok!(client.send_and_receive::<PingResponse>(PingRequest {}).await);

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

// ============================================================================
// Correlation
// ============================================================================

#[tokio::test]
async fn test_concurrent_requests_answered_in_reverse() -> anyhow::Result<()> {
    const BATCH: u32 = 16;

    let fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;

    let requests = (0..BATCH).map(|value| {
        let client = client.clone();
        async move {
            client
                .send_and_receive::<BatchResponse>(BatchRequest {
                    value,
                    batch: BATCH,
                })
                .await
        }
    });

    let responses = join_all(requests).await;
    for (value, response) in responses.into_iter().enumerate() {
        assert_eq!(response?.value, value as u32);
    }
    assert!(client.transport().pending().is_empty());

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_request_timeout_removes_pending() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;

    let started = Instant::now();
    let err = client
        .send_and_receive_with_timeout::<PingResponse>(
            SilentRequest {},
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(client.transport().pending().is_empty());

    // The connection is still usable.
    assert_ok!(client.send_and_receive::<PingResponse>(PingRequest {}).await);

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_uncorrelated_error_flushes_pending() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;

    let silent = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .send_and_receive_with_timeout::<PingResponse>(SilentRequest {}, None)
                .await
        }
    });
    let pending = client.transport().pending().clone();
    assert!(eventually(|| pending.len() == 1).await);

    let flushed = client
        .send_and_receive::<PingResponse>(FlushRequest {})
        .await
        .unwrap_err();
    assert!(matches!(flushed, Error::RequestsFlushed));
    assert!(matches!(silent.await?, Err(Error::RequestsFlushed)));
    assert!(pending.is_empty());

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

// ============================================================================
// Framing
// ============================================================================

#[tokio::test]
async fn test_oversized_message_closes_connection() -> anyhow::Result<()> {
    let (handler, mut errors, _events) = test_handler();
    let (server, url) =
        start_server_with(handler, options().with_max_receive_size(Some(256))).await?;
    let (client, _messages) = connect(&url).await?;
    let connection = client.connection().expect("client is connected");

    assert_ok!(client.send_and_receive::<PingResponse>(PingRequest {}).await);

    client
        .send(Notice {
            text: "x".repeat(4096),
        })
        .await?;

    match errors.recv().await {
        Some(Error::LengthExceeded { limit, .. }) => assert_eq!(limit, 256),
        other => panic!("expected length exceeded, got {other:?}"),
    }

    let observed = client.clone();
    assert!(eventually(|| observed.state() == ServiceState::Stopped).await);
    assert_eq!(
        connection.close_status().map(|status| status.reason),
        Some("MESSAGE TOO BIG".to_owned())
    );

    let observed = server.clone();
    assert!(eventually(|| observed.connection_count() == 0).await);
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_type_keeps_connection_alive() -> anyhow::Result<()> {
    let mut fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;

    client.send_raw(TypeId::new(999), vec![1, 2, 3, 4]).await?;

    match fixture.errors.recv().await {
        Some(Error::UnknownType { type_id, raw }) => {
            assert_eq!(type_id, TypeId::new(999));
            assert_eq!(raw, vec![1, 2, 3, 4]);
        }
        other => panic!("expected unknown type, got {other:?}"),
    }

    assert_ok!(client.send_and_receive::<PingResponse>(PingRequest {}).await);

    client.stop().await;
    fixture.server.stop().await;
    Ok(())
}

// ============================================================================
// Server
// ============================================================================

#[tokio::test]
async fn test_broadcast_reaches_every_client() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    let (first, mut first_messages) = connect(&fixture.url).await?;
    let (second, mut second_messages) = connect(&fixture.url).await?;

    let server = fixture.server.clone();
    assert!(eventually(|| server.connection_count() == 2).await);

    let notice = Notice {
        text: "woof".to_owned(),
    };
    assert_eq!(fixture.server.broadcast(notice.clone()).await, 2);

    assert_eq!(first_messages.recv().await, Some(Api::Notice(notice.clone())));
    assert_eq!(second_messages.recv().await, Some(Api::Notice(notice)));

    first.stop().await;
    second.stop().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_client_disconnect_discards_session() -> anyhow::Result<()> {
    let mut fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;
    assert!(sign_in(&client).await?);

    let Some(ServerEvent::Opened(id)) = fixture.events.recv().await else {
        panic!("expected open event");
    };
    assert!(fixture.server.session(id).is_some());

    client.stop().await;

    assert_eq!(fixture.events.recv().await, Some(ServerEvent::Closing(id)));
    let server = fixture.server.clone();
    assert!(eventually(|| server.connection_count() == 0).await);
    assert!(fixture.server.session(id).is_none());

    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_panicking_closing_handler_still_cleans_up() -> anyhow::Result<()> {
    let (server, url) = start_server_with(PanickingCloseHandler, options()).await?;
    let (client, _messages) = connect(&url).await?;

    let observed = server.clone();
    assert!(eventually(|| observed.connection_count() == 1).await);
    assert_eq!(server.sessions().len(), 1);

    client.stop().await;

    let observed = server.clone();
    assert!(eventually(|| observed.connection_count() == 0).await);
    let observed = server.clone();
    assert!(eventually(|| observed.sessions().is_empty()).await);
    assert!(server.transport().pending().is_empty());

    // The server keeps serving after the handler failure.
    let (next, _messages) = connect(&url).await?;
    assert_ok!(next.send_and_receive::<PingResponse>(PingRequest {}).await);

    next.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_server_stop_disconnects_clients() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    let (client, _messages) = connect(&fixture.url).await?;
    assert_eq!(client.state(), ServiceState::Started);

    fixture.server.stop().await;
    assert_eq!(fixture.server.state(), ServiceState::Stopped);
    assert_eq!(fixture.server.connection_count(), 0);

    let observed = client.clone();
    assert!(eventually(|| observed.state() == ServiceState::Stopped).await);

    let err = client.send(PingRequest {}).await.unwrap_err();
    assert!(matches!(err, Error::NotStarted));
    Ok(())
}

#[tokio::test]
async fn test_lifecycle_states() -> anyhow::Result<()> {
    let fixture = start_server().await?;
    assert_eq!(fixture.server.state(), ServiceState::Started);

    let err = fixture.server.start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    fixture.server.stop().await;
    fixture.server.stop().await;
    assert_eq!(fixture.server.state(), ServiceState::Stopped);

    let addr = fixture.server.start().await?;
    assert!(addr.port() > 0);
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_racing_start_never_leaves_dead_client() -> anyhow::Result<()> {
    let fixture = start_server().await?;

    for round in 0..50u64 {
        let (client, _messages) = client(&fixture.url)?;

        let starting = tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });
        tokio::time::sleep(Duration::from_micros(round * 40)).await;
        client.stop().await;
        let started = starting.await?;

        match client.state() {
            ServiceState::Stopped => assert!(client.connection().is_none()),
            ServiceState::Started => {
                assert_ok!(started);
                assert_ok!(
                    client
                        .send_and_receive_with_timeout::<PingResponse>(
                            PingRequest {},
                            Some(Duration::from_secs(2)),
                        )
                        .await
                );
                client.stop().await;
            }
            state => panic!("round {round}: client left in state {state}"),
        }
    }

    let server = fixture.server.clone();
    assert!(eventually(|| server.connection_count() == 0).await);
    fixture.server.stop().await;
    Ok(())
}
