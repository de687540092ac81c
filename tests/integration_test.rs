//! Integration tests for the Parley pairing server
//!
//! These tests spawn the server in-process and drive real WebSocket clients
//! through the full admission → challenge → match → chat flows.

use axum::{
    routing::{delete, get},
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream,
    WebSocketStream};
use futures_util::{SinkExt, StreamExt};

use parley_server::{
    admin, config::Config, gateway, handlers,
    state::{now_secs, AppState, SharedState},
};

/// Test server instance
struct TestServer {
    ws_url: String,
    base_url: String,
    state: SharedState,
}

impl TestServer {
    /// Start a new test server on a random port
    async fn new(mutate: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.identity_salt = "integration-salt".into();
        config.pow_difficulty = 1;
        config.connections_per_min = 100;
        config.finds_per_min = 100;
        config.match_cooldown = Duration::from_millis(50);
        config.min_message_interval = Duration::from_millis(0);
        mutate(&mut config);

        let state: SharedState = Arc::new(AppState::new_in_memory(config).await.unwrap());

        let app = Router::new()
            .route("/health", get(handlers::health_handler))
            .route("/stats", get(handlers::stats_handler))
            .route("/metrics", get(handlers::metrics_handler))
            .route("/admin/stats", get(admin::admin_stats_handler))
            .route(
                "/admin/rules",
                get(admin::list_rules_handler).post(admin::create_rule_handler),
            )
            .route("/admin/bans/:identity", delete(admin::lift_ban_handler))
            .route("/ws", get(handlers::ws_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            ws_url: format!("ws://{addr}/ws"),
            base_url: format!("http://{addr}"),
            state,
        }
    }

    /// Connect, solve the challenge and land in idle.
    async fn verified_client(&self) -> WsClient {
        let mut client = WsClient::connect(&self.ws_url).await.unwrap();
        client.solve_challenge().await;
        client
    }
}

/// One WebSocket test client
struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WsClient {
    async fn connect(url: &str) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let (stream, _) = connect_async(url).await?;
        Ok(Self { stream })
    }

    async fn send(&mut self, event: Value) {
        self.stream
            .send(WsMessage::Text(event.to_string()))
            .await
            .unwrap();
    }

    /// Next event within a bounded wait, `None` when the socket closes.
    async fn recv(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(3), self.stream.next())
                .await
                .expect("timed out waiting for event")?;
            match frame {
                Ok(WsMessage::Text(text)) => {
                    return Some(serde_json::from_str(&text).unwrap());
                }
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Wait for a specific event type, skipping broadcast noise.
    async fn expect(&mut self, event_type: &str) -> Value {
        loop {
            let event = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("socket closed waiting for {event_type}"));
            if event["type"] == event_type {
                return event;
            }
            // online_count and similar broadcasts interleave freely.
        }
    }

    /// Expect the socket to close (server-initiated teardown).
    async fn expect_close(&mut self) {
        while self.recv().await.is_some() {}
    }

    async fn solve_challenge(&mut self) {
        let challenge = self.expect("challenge").await;
        let prefix = challenge["prefix"].as_str().unwrap();
        let difficulty = challenge["difficulty"].as_u64().unwrap() as u32;
        let candidate = gateway::solve_pow(prefix, difficulty);
        self.send(json!({ "type": "solve_challenge", "candidate": candidate }))
            .await;
        self.expect("challenge_success").await;
    }
}

// ── REST surface ──

#[tokio::test]
async fn test_health_endpoint() {
    let server = TestServer::new(|_| {}).await;
    let resp = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_stats_reflect_live_counts() {
    let server = TestServer::new(|_| {}).await;
    let mut s1 = server.verified_client().await;
    let _s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s1.expect("searching").await;

    let body: Value = reqwest::get(format!("{}/stats", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["online"], 2);
    assert_eq!(body["waiting"], 1);
    assert_eq!(body["active_pairs"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_prometheus_text() {
    let server = TestServer::new(|_| {}).await;
    let text = reqwest::get(format!("{}/metrics", server.base_url))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("parley_"));
}

// ── Admission ──

#[tokio::test]
async fn test_connection_rate_limit_rejects() {
    let server = TestServer::new(|cfg| cfg.connections_per_min = 2).await;

    let _c1 = WsClient::connect(&server.ws_url).await.unwrap();
    let _c2 = WsClient::connect(&server.ws_url).await.unwrap();
    // Third connection from the same address inside the window is refused
    // before the upgrade.
    assert!(WsClient::connect(&server.ws_url).await.is_err());
}

#[tokio::test]
async fn test_banned_identity_cannot_reconnect() {
    let server = TestServer::new(|_| {}).await;
    let identity = gateway::identity_hash("integration-salt", "127.0.0.1");
    server
        .state
        .db
        .upsert_ban(&identity, now_secs() + 3600)
        .await
        .unwrap();

    assert!(WsClient::connect(&server.ws_url).await.is_err());
}

#[tokio::test]
async fn test_wrong_challenge_solution_disconnects() {
    let server = TestServer::new(|cfg| cfg.pow_difficulty = 6).await;
    let mut client = WsClient::connect(&server.ws_url).await.unwrap();
    client.expect("challenge").await;

    client
        .send(json!({ "type": "solve_challenge", "candidate": "wrong" }))
        .await;
    client.expect_close().await;
}

#[tokio::test]
async fn test_challenge_timeout_disconnects() {
    let server = TestServer::new(|cfg| {
        cfg.challenge_timeout = Duration::from_millis(100);
    })
    .await;
    let mut client = WsClient::connect(&server.ws_url).await.unwrap();
    client.expect("challenge").await;

    // Never answer: the gate tears the session down.
    client.expect_close().await;
    assert_eq!(server.state.online_count().await, 0);
}

// ── Scenario A: pairing ──

#[tokio::test]
async fn test_scenario_a_two_sessions_pair() {
    let server = TestServer::new(|_| {}).await;
    let mut s1 = server.verified_client().await;
    let mut s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s1.expect("searching").await;
    s2.send(json!({ "type": "find_match" })).await;

    let m1 = s1.expect("matched").await;
    let m2 = s2.expect("matched").await;
    assert_eq!(m1["room_id"], m2["room_id"]);

    // Partner references are symmetric at rest.
    let sessions = server.state.sessions.read().await;
    let ids: Vec<_> = sessions.keys().copied().collect();
    let a = &sessions[&ids[0]];
    let b = &sessions[&ids[1]];
    assert_eq!(a.partner_id, Some(b.id));
    assert_eq!(b.partner_id, Some(a.id));
}

// ── Scenario B: message delivery ──

#[tokio::test]
async fn test_scenario_b_message_delivery_with_ack() {
    let server = TestServer::new(|_| {}).await;
    let mut s1 = server.verified_client().await;
    let mut s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s2.send(json!({ "type": "find_match" })).await;
    s1.expect("matched").await;
    s2.expect("matched").await;

    s1.send(json!({ "type": "send_message", "text": "hello", "ack": 1 }))
        .await;

    let ack = s1.expect("ack").await;
    assert_eq!(ack["id"], 1);
    let msg = s2.expect("message").await;
    assert_eq!(msg["text"], "hello");
}

// ── Scenario C: rolling message limit ──

#[tokio::test]
async fn test_scenario_c_rolling_limit_soft_error() {
    let server = TestServer::new(|_| {}).await;
    let mut s1 = server.verified_client().await;
    let mut s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s2.send(json!({ "type": "find_match" })).await;
    s1.expect("matched").await;
    s2.expect("matched").await;

    for i in 0..20 {
        s1.send(json!({ "type": "send_message", "text": format!("m{i}") }))
            .await;
    }

    // After the 15th inside the window the sender is told to slow down.
    s1.expect("soft_error").await;
}

// ── Scenario D: blocked link escalates to ban ──

#[tokio::test]
async fn test_scenario_d_link_message_bans_and_disconnects() {
    let server = TestServer::new(|_| {}).await;
    let mut s1 = server.verified_client().await;
    let mut s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s2.send(json!({ "type": "find_match" })).await;
    s1.expect("matched").await;
    s2.expect("matched").await;

    s1.send(json!({ "type": "send_message", "text": "visit spamlink.com now" }))
        .await;

    let banned = s1.expect("banned").await;
    assert!(banned["reason"].as_str().unwrap().len() > 0);
    s1.expect_close().await;

    // Ban record exists with roughly a day's duration (severity 2).
    let identity = gateway::identity_hash("integration-salt", "127.0.0.1");
    let record = server
        .state
        .db
        .get_ban_status(&identity)
        .await
        .unwrap()
        .unwrap();
    let until = record.banned_until.unwrap();
    assert!((until - (now_secs() + 24 * 3600)).abs() < 10);

    // The partner was told the peer left.
    s2.expect("partner_left").await;
}

// ── Scenario E: leave and re-search ──

#[tokio::test]
async fn test_scenario_e_leave_notifies_partner() {
    let server = TestServer::new(|_| {}).await;
    let mut s1 = server.verified_client().await;
    let mut s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s2.send(json!({ "type": "find_match" })).await;
    s1.expect("matched").await;
    s2.expect("matched").await;

    s1.send(json!({ "type": "leave_chat", "ack": 5 })).await;
    let ack = s1.expect("ack").await;
    assert_eq!(ack["id"], 5);
    s2.expect("partner_left").await;

    // S1 re-enters the queue on its next find.
    tokio::time::sleep(Duration::from_millis(80)).await;
    s1.send(json!({ "type": "find_match" })).await;
    s1.expect("searching").await;
}

// ── Scenario F: re-pairing with a newcomer ──

#[tokio::test]
async fn test_scenario_f_repairs_with_new_session() {
    let server = TestServer::new(|_| {}).await;
    let mut s1 = server.verified_client().await;
    let mut s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s2.send(json!({ "type": "find_match" })).await;
    let first = s1.expect("matched").await;
    s2.expect("matched").await;

    s1.send(json!({ "type": "leave_chat" })).await;
    s2.expect("partner_left").await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    s1.send(json!({ "type": "find_match" })).await;
    s1.expect("searching").await;

    let mut s3 = server.verified_client().await;
    s3.send(json!({ "type": "find_match" })).await;

    let m1 = s1.expect("matched").await;
    let m3 = s3.expect("matched").await;
    assert_eq!(m1["room_id"], m3["room_id"]);
    // The new room is a new room.
    assert_ne!(first["room_id"], m1["room_id"]);
}

// ── Typing indicator ──

#[tokio::test]
async fn test_typing_forwarded_to_partner() {
    let server = TestServer::new(|_| {}).await;
    let mut s1 = server.verified_client().await;
    let mut s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s2.send(json!({ "type": "find_match" })).await;
    s1.expect("matched").await;
    s2.expect("matched").await;

    s1.send(json!({ "type": "typing", "is_typing": true })).await;
    let typing = s2.expect("partner_typing").await;
    assert_eq!(typing["is_typing"], true);
}

// ── Batch delivery ──

#[tokio::test]
async fn test_burst_arrives_as_batch() {
    let server = TestServer::new(|cfg| {
        cfg.batch_window = Duration::from_millis(100);
    })
    .await;
    let mut s1 = server.verified_client().await;
    let mut s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s2.send(json!({ "type": "find_match" })).await;
    s1.expect("matched").await;
    s2.expect("matched").await;

    s1.send(json!({ "type": "send_message", "text": "one" })).await;
    s1.send(json!({ "type": "send_message", "text": "two" })).await;

    let batch = s2.expect("message_batch").await;
    let texts: Vec<&str> = batch["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["one", "two"]);
}

// ── Whitelist ──

#[tokio::test]
async fn test_whitelisted_phrase_never_blocked() {
    let server = TestServer::new(|_| {}).await;
    server.state.db.add_filter_rule("ass", false, 3).await.unwrap();
    server
        .state
        .db
        .add_whitelist_phrase("touching grass")
        .await
        .unwrap();

    let mut s1 = server.verified_client().await;
    let mut s2 = server.verified_client().await;

    s1.send(json!({ "type": "find_match" })).await;
    s2.send(json!({ "type": "find_match" })).await;
    s1.expect("matched").await;
    s2.expect("matched").await;

    s1.send(json!({ "type": "send_message", "text": "touching grass today" }))
        .await;
    let msg = s2.expect("message").await;
    assert_eq!(msg["text"], "touching grass today");
}

// ── Admin ──

#[tokio::test]
async fn test_admin_requires_token() {
    let server = TestServer::new(|cfg| cfg.admin_token = Some("secret".into())).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/admin/stats", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("{}/admin/stats", server.base_url))
        .header("x-admin-token", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_admin_lift_ban_allows_reconnect() {
    let server = TestServer::new(|cfg| cfg.admin_token = Some("secret".into())).await;
    let identity = gateway::identity_hash("integration-salt", "127.0.0.1");
    server
        .state
        .db
        .upsert_ban(&identity, now_secs() + 3600)
        .await
        .unwrap();
    assert!(WsClient::connect(&server.ws_url).await.is_err());

    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("{}/admin/bans/{identity}", server.base_url))
        .header("x-admin-token", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    assert!(WsClient::connect(&server.ws_url).await.is_ok());
}
