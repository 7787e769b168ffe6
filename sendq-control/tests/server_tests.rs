//! Socket-level integration tests for the control server and client

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use sendq_common::Signal;
use sendq_control::{
    Command, CommandHandler, ControlClient, ControlServer, ErrorKind, QueueCommand, Request,
    Response, ResponseData, ResponsePayload, SystemCommand,
};
use tokio::sync::broadcast;

/// Handler that answers pings and echoes enqueue requests back as IDs
struct TestHandler;

#[async_trait]
impl CommandHandler for TestHandler {
    async fn handle_request(&self, request: Request) -> sendq_control::Result<Response> {
        Ok(match request.command {
            Command::System(SystemCommand::Ping) => Response::ok(),
            Command::Queue(QueueCommand::Enqueue { sender, .. }) => {
                Response::data(ResponseData::Enqueued {
                    message_id: format!("id-for-{sender}"),
                })
            }
            Command::Queue(QueueCommand::Status { message_id }) => {
                Response::error(ErrorKind::NotFound, format!("no message {message_id}"))
            }
            _ => Response::error(ErrorKind::Internal, "unhandled in test"),
        })
    }
}

async fn start_server(socket_path: String) -> (broadcast::Sender<Signal>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let server = ControlServer::new(socket_path, Arc::new(TestHandler)).expect("server");

    let handle = tokio::spawn(async move {
        server.serve(shutdown_rx).await.expect("serve");
    });

    // Give the listener a moment to bind
    tokio::time::sleep(Duration::from_millis(50)).await;

    (shutdown_tx, handle)
}

#[tokio::test]
async fn test_ping_round_trip_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.sock").display().to_string();

    let (shutdown_tx, handle) = start_server(socket_path.clone()).await;

    let client = ControlClient::new(socket_path);
    let response = client
        .send_request(Request::new(Command::System(SystemCommand::Ping)))
        .await
        .expect("request");

    assert!(response.is_success());
    assert!(matches!(response.payload, ResponsePayload::Ok));

    shutdown_tx.send(Signal::Shutdown).expect("signal");
    handle.await.expect("join");
}

#[tokio::test]
async fn test_enqueue_payload_survives_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.sock").display().to_string();

    let (shutdown_tx, handle) = start_server(socket_path.clone()).await;

    let client = ControlClient::new(socket_path);
    let response = client
        .send_request(Request::new(Command::Queue(QueueCommand::Enqueue {
            sender: "sender@example.com".to_string(),
            recipients: vec!["rcpt@example.net".to_string()],
            payload: vec![0u8; 65536],
        })))
        .await
        .expect("request");

    match response.payload {
        ResponsePayload::Data(data) => match *data {
            ResponseData::Enqueued { message_id } => {
                assert_eq!(message_id, "id-for-sender@example.com");
            }
            other => panic!("unexpected data: {other:?}"),
        },
        other => panic!("unexpected payload: {other:?}"),
    }

    shutdown_tx.send(Signal::Shutdown).expect("signal");
    handle.await.expect("join");
}

#[tokio::test]
async fn test_structured_errors_reach_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.sock").display().to_string();

    let (shutdown_tx, handle) = start_server(socket_path.clone()).await;

    let client = ControlClient::new(socket_path);
    let response = client
        .send_request(Request::new(Command::Queue(QueueCommand::Status {
            message_id: "01JCXYZ123ABC".to_string(),
        })))
        .await
        .expect("request");

    match response.payload {
        ResponsePayload::Error(reply) => {
            assert_eq!(reply.kind, ErrorKind::NotFound);
            assert!(reply.message.contains("01JCXYZ123ABC"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    shutdown_tx.send(Signal::Shutdown).expect("signal");
    handle.await.expect("join");
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.sock").display().to_string();

    // Leave a dead socket file behind, as a crashed daemon would
    std::fs::write(&socket_path, b"").unwrap();

    let (shutdown_tx, handle) = start_server(socket_path.clone()).await;

    let client = ControlClient::new(socket_path.clone());
    let response = client
        .send_request(Request::new(Command::System(SystemCommand::Ping)))
        .await
        .expect("request");
    assert!(response.is_success());

    shutdown_tx.send(Signal::Shutdown).expect("signal");
    handle.await.expect("join");

    // The server removes its socket on clean shutdown
    assert!(!std::path::Path::new(&socket_path).exists());
}

#[tokio::test]
async fn test_connecting_to_a_missing_socket_fails() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("missing.sock").display().to_string();

    let client = ControlClient::new(socket_path).with_timeout(Duration::from_secs(1));
    let result = client
        .send_request(Request::new(Command::System(SystemCommand::Ping)))
        .await;

    assert!(result.is_err());
}
