#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end tests: a real gateway on an ephemeral port driven by the real
//! client.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    serde::{Deserialize, Serialize},
    serde_json::json,
    tokio::net::TcpListener,
};

use {
    switchboard_client::{
        AuthOptions, Client, ClientOptions, ClientSendOptions, RequestOptions, TokenAttach,
        WebSocketTransport,
    },
    switchboard_gateway::{AuthOutcome, Authenticator, build_gateway_app},
    switchboard_protocol::{Envelope, MessageSchema, RpcSchema},
    switchboard_router::{
        PublishOptions, Router, RouterService, SendOptions, TopicOptions,
    },
};

// ── Schemas shared by the test app ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct JoinRoom {
    #[serde(rename = "roomId")]
    room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserJoined {
    #[serde(rename = "roomId")]
    room_id: String,
    #[serde(rename = "userId")]
    user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Ping {
    text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Pong {
    reply: String,
}

fn join_schema() -> MessageSchema<JoinRoom> {
    MessageSchema::new("JOIN_ROOM")
}

fn user_joined_schema() -> MessageSchema<UserJoined> {
    MessageSchema::new("USER_JOINED")
}

fn ping_rpc() -> RpcSchema<Ping, Pong> {
    RpcSchema::new("PING", "PONG")
}

// ── Test app ─────────────────────────────────────────────────────────────────

fn build_service() -> Arc<RouterService<()>> {
    Router::<()>::new()
        .on(&join_schema(), |ctx, payload: JoinRoom| async move {
            let topic = format!("room:{}", payload.room_id);
            let joined = UserJoined {
                room_id: payload.room_id.clone(),
                user_id: ctx.client_id().to_string(),
            };
            // Broadcast to the room before the joiner subscribes, so only
            // the existing members see the fan-out.
            ctx.publish(&topic, &user_joined_schema(), joined.clone(), PublishOptions::default())
                .await?;
            ctx.topics()
                .subscribe(&topic, &TopicOptions::default())
                .await
                .map_err(|err| err.to_error_shape())?;
            ctx.send(&user_joined_schema(), joined, SendOptions::default())
                .await?;
            Ok(())
        })
        .rpc(&ping_rpc(), |ctx, payload: Ping| async move {
            ctx.progress(json!({"step": "loading"})).await?;
            let reply = match payload.text.as_str() {
                "hello" => "world",
                other => other,
            };
            ctx.reply(Pong { reply: reply.into() }, SendOptions::default())
                .await
        })
        .build_memory()
}

async fn start_test_server(
    service: Arc<RouterService<()>>,
    authenticator: Option<Authenticator<()>>,
) -> SocketAddr {
    let app = build_gateway_app(service, authenticator);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        switchboard_gateway::serve(app, listener).await.unwrap();
    });
    addr
}

fn client_for(addr: SocketAddr) -> Arc<Client> {
    Arc::new(Client::with_transport(
        ClientOptions::new(format!("ws://{addr}/ws")),
        Arc::new(WebSocketTransport),
    ))
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn join_and_broadcast_fans_out_to_existing_members() {
    let addr = start_test_server(build_service(), None).await;

    let alice = client_for(addr);
    let alice_seen: Arc<Mutex<Vec<UserJoined>>> = Arc::default();
    {
        let seen = alice_seen.clone();
        alice.on(&user_joined_schema(), move |envelope: Envelope<UserJoined>| {
            if let Some(joined) = envelope.payload {
                seen.lock().unwrap().push(joined);
            }
        });
    }
    alice.connect().await.unwrap();
    alice
        .send(
            &join_schema(),
            JoinRoom {
                room_id: "general".into(),
            },
            ClientSendOptions::default(),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Alice only sees her own join confirmation (the room was empty).
    assert_eq!(alice_seen.lock().unwrap().len(), 1);

    let bob = client_for(addr);
    let bob_seen: Arc<Mutex<Vec<UserJoined>>> = Arc::default();
    {
        let seen = bob_seen.clone();
        bob.on(&user_joined_schema(), move |envelope: Envelope<UserJoined>| {
            if let Some(joined) = envelope.payload {
                seen.lock().unwrap().push(joined);
            }
        });
    }
    bob.connect().await.unwrap();
    bob.send(
        &join_schema(),
        JoinRoom {
            room_id: "general".into(),
        },
        ClientSendOptions::default(),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Bob's join reached Alice through the broadcast; Bob himself only got
    // the direct confirmation.
    let alice_seen = alice_seen.lock().unwrap();
    assert_eq!(alice_seen.len(), 2);
    assert_eq!(alice_seen[1].room_id, "general");
    assert_ne!(alice_seen[1].user_id, alice_seen[0].user_id);
    assert_eq!(bob_seen.lock().unwrap().len(), 1);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn rpc_round_trip_resolves_with_the_reply() {
    let addr = start_test_server(build_service(), None).await;
    let client = client_for(addr);
    client.connect().await.unwrap();

    let reply = client
        .request(
            &ping_rpc(),
            Ping {
                text: "hello".into(),
            },
            RequestOptions {
                correlation_id: Some("r-1".into()),
                ..RequestOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(reply.message_type, "PONG");
    assert_eq!(reply.meta.correlation_id.as_deref(), Some("r-1"));
    assert_eq!(reply.payload.unwrap(), Pong { reply: "world".into() });
    client.close().await;
}

#[tokio::test]
async fn rpc_progress_arrives_before_the_terminal_reply() {
    let addr = start_test_server(build_service(), None).await;
    let client = client_for(addr);
    client.connect().await.unwrap();

    let progress: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
    let seen = progress.clone();
    let reply = client
        .request(
            &ping_rpc(),
            Ping { text: "done".into() },
            RequestOptions {
                correlation_id: Some("r-p".into()),
                on_progress: Some(Arc::new(move |payload| {
                    seen.lock().unwrap().push(payload);
                })),
                ..RequestOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(reply.payload.unwrap().reply, "done");
    let progress = progress.lock().unwrap();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0]["step"], "loading");
    client.close().await;
}

#[tokio::test]
async fn failed_authentication_refuses_the_upgrade() {
    let authenticator: Authenticator<()> = Arc::new(|request| {
        Box::pin(async move {
            let token = request
                .query
                .as_deref()
                .and_then(|query| query.strip_prefix("access_token="))
                .map(str::to_string)?;
            if token != "letmein" {
                return None;
            }
            Some(AuthOutcome {
                client_id: Some("authed-user".into()),
                data: (),
            })
        })
    });
    let addr = start_test_server(build_service(), Some(authenticator)).await;

    // No token: the upgrade is refused and no connection exists.
    let refused =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(refused.is_err());

    // A valid token attached the client way works end to end.
    let mut options = ClientOptions::new(format!("ws://{addr}/ws"));
    options.auth = Some(AuthOptions {
        get_token: Arc::new(|| Box::pin(async { Ok("letmein".to_string()) })),
        attach: TokenAttach::default(),
    });
    options.reconnect.enabled = false;
    let client = Arc::new(Client::with_transport(options, Arc::new(WebSocketTransport)));
    client.connect().await.unwrap();

    let reply = client
        .request(
            &ping_rpc(),
            Ping { text: "hi".into() },
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload.unwrap().reply, "hi");
    client.close().await;
}

#[tokio::test]
async fn unknown_types_get_an_unimplemented_error_frame() {
    use {
        futures::{SinkExt, StreamExt},
        tokio_tungstenite::tungstenite::Message,
    };

    let addr = start_test_server(build_service(), None).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("ws connect failed");

    let frame = json!({"type": "NOPE", "meta": {"correlationId": "r-x"}});
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let reply: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["type"], "ERROR");
    assert_eq!(reply["payload"]["code"], "UNIMPLEMENTED");
    assert_eq!(reply["meta"]["correlationId"], "r-x");

    ws.close(None).await.ok();
}
