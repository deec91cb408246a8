//! RPC transport integration tests over real localhost sockets.

use std::sync::Arc;

use meshkv::rpc::{
    CallError, Client, ConnectError, HandlerRegistry, Handlers, HandlersError, METHOD_PING,
    MsgpackCodec, Server,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EchoArgs {
    input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EchoReply {
    output: String,
}

#[derive(Clone)]
struct EchoHandlers;

impl Handlers<MsgpackCodec> for EchoHandlers {
    fn register(&self, registry: &mut HandlerRegistry<MsgpackCodec>) -> Result<(), HandlersError> {
        registry.register::<EchoArgs, EchoReply, _>("Echo.Upper", |args| {
            Ok(EchoReply {
                output: args.input.to_uppercase(),
            })
        })?;
        registry.register::<EchoArgs, EchoReply, _>("Echo.Fail", |args| {
            Err(format!("refusing input {:?}", args.input))
        })
    }
}

async fn start_server(port: &str) -> (Server, CancellationToken) {
    let server = Server::new("127.0.0.1", port);
    server.register_handlers(&EchoHandlers).unwrap();
    let listener = server.listen().await.unwrap();

    let shutdown = CancellationToken::new();
    {
        let server = server.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            server.accept_connections(listener, token).await;
        });
    }
    (server, shutdown)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_and_custom_handlers() {
    let (_server, shutdown) = start_server("7300").await;

    let client = Client::new("127.0.0.1", "7300");
    client.connect().await.unwrap();

    let pong: i64 = client.call(METHOD_PING, &()).await.unwrap();
    assert_eq!(pong, 1);

    let reply: EchoReply = client
        .call(
            "Echo.Upper",
            &EchoArgs {
                input: "test".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.output, "TEST");

    client.disconnect().await;
    client.disconnect().await; // idempotent
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ping_under_parallel_load() {
    let (_server, shutdown) = start_server("7301").await;

    // Several clients, each issuing pings from several tasks. Calls on a
    // shared client serialize; calls on distinct clients interleave.
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let client = Arc::new(Client::new("127.0.0.1", "7301"));
        client.connect().await.unwrap();

        for _ in 0..4 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let pong: i64 = client.call(METHOD_PING, &()).await.unwrap();
                    assert_eq!(pong, 1);
                }
            }));
        }
    }

    for task in tasks {
        task.await.unwrap();
    }
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_errors_leave_the_connection_usable() {
    let (_server, shutdown) = start_server("7302").await;

    let client = Client::new("127.0.0.1", "7302");
    client.connect().await.unwrap();

    let err = client
        .call::<_, EchoReply>(
            "Echo.Fail",
            &EchoArgs {
                input: "nope".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Remote(_)));

    let err = client.call::<_, i64>("Echo.Missing", &()).await.unwrap_err();
    match err {
        CallError::Remote(message) => assert!(message.contains("unknown method")),
        other => panic!("unexpected error {other:?}"),
    }

    // The connection survived both rejections.
    let pong: i64 = client.call(METHOD_PING, &()).await.unwrap();
    assert_eq!(pong, 1);
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_to_dead_endpoint_fails() {
    // Port 1 is privileged and unbound; the dial is refused.
    let client = Client::new("127.0.0.1", "1");
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::ConnectionFailure(_)));
    assert!(!client.is_connected().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn calls_without_connection_are_rejected() {
    let client = Client::new("127.0.0.1", "7303");
    let err = client.call::<_, i64>(METHOD_PING, &()).await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Send(meshkv::rpc::SendError::NotConnected)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_registration_is_rejected() {
    let server = Server::new("127.0.0.1", "7304");
    server.register_handlers(&EchoHandlers).unwrap();
    let err = server.register_handlers(&EchoHandlers).unwrap_err();
    assert!(matches!(err, HandlersError::RpcFailure(_)));
}
