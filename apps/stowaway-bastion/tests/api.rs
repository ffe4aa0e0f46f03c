//! End-to-end tests: the full router on a live listener, the in-memory
//! store, and real WebSocket agents (the actual agent crate where the
//! scenario needs a filesystem, a scripted socket where it needs precise
//! control over the wire).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use stowaway_bastion::config::Config;
use stowaway_bastion::hub::Hub;
use stowaway_bastion::routes::{router, AppState};
use stowaway_bastion::store::MemoryStore;
use stowaway_proto::{AgentFrame, BastionFrame};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestBastion {
    base: String,
    ws_url: String,
}

async fn spawn_bastion() -> TestBastion {
    let config = Config {
        database_url: String::new(),
        server_addr: ":0".into(),
        jwt_secret: "test-secret".into(),
        static_dir: None,
        tls_cert_file: None,
        tls_key_file: None,
        cors_origin: None,
    };
    let state = AppState {
        config,
        store: Arc::new(MemoryStore::default()),
        hub: Hub::new(),
    };
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestBastion {
        base: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws/agent"),
    }
}

async fn operator(base: &str) -> (reqwest::Client, String) {
    let client = reqwest::Client::new();
    let registered = client
        .post(format!("{base}/api/register"))
        .json(&json!({"username": "admin", "password": "hunter22"}))
        .send()
        .await
        .unwrap();
    assert_eq!(registered.status().as_u16(), 201);
    let login: Value = client
        .post(format!("{base}/api/login"))
        .json(&json!({"username": "admin", "password": "hunter22"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = login["token"].as_str().unwrap().to_string();
    (client, token)
}

async fn create_agent(
    client: &reqwest::Client,
    base: &str,
    token: &str,
    label: &str,
) -> (String, String) {
    let created: Value = client
        .post(format!("{base}/api/agents"))
        .bearer_auth(token)
        .json(&json!({"label": label}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    (
        created["id"].as_str().unwrap().to_string(),
        created["token"].as_str().unwrap().to_string(),
    )
}

fn spawn_real_agent(ws_url: &str, token: &str, root: &std::path::Path) -> JoinHandle<()> {
    let ws_url = ws_url.to_string();
    let token = token.to_string();
    let root = root.to_path_buf();
    tokio::spawn(async move {
        let _ = stowaway_agent::session::run_session(&ws_url, &token, &root).await;
    })
}

async fn wait_connected(client: &reqwest::Client, base: &str, token: &str, agent_id: &str) {
    for _ in 0..100 {
        let agents: Value = client
            .get(format!("{base}/api/agents"))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let connected = agents
            .as_array()
            .unwrap()
            .iter()
            .any(|row| row["id"] == agent_id && row["connected"] == true);
        if connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("agent {agent_id} never connected");
}

/// Dials the agent endpoint, authenticates, and hands back the socket for
/// scripting. Registration in the hub has completed once auth_ok arrives.
async fn scripted_agent(ws_url: &str, token: &str) -> AgentSocket {
    let (mut ws, _) = connect_async(ws_url).await.unwrap();
    let auth = AgentFrame::Auth {
        token: token.to_string(),
    };
    ws.send(WsMessage::Text(serde_json::to_string(&auth).unwrap()))
        .await
        .unwrap();
    loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => match serde_json::from_str::<BastionFrame>(&text).unwrap() {
                BastionFrame::AuthOk { .. } => return ws,
                BastionFrame::AuthError { error } => panic!("agent auth failed: {error}"),
                _ => continue,
            },
            _ => continue,
        }
    }
}

struct TestEnv {
    base: String,
    ws_url: String,
    client: reqwest::Client,
    token: String,
    agent_id: String,
    agent_token: String,
    root: tempfile::TempDir,
    _agent_task: JoinHandle<()>,
}

/// Bastion + operator + one real agent serving a temp directory.
async fn env_with_agent(files: &[(&str, &[u8])], dirs: &[&str]) -> TestEnv {
    let bastion = spawn_bastion().await;
    let (client, token) = operator(&bastion.base).await;
    let (agent_id, agent_token) = create_agent(&client, &bastion.base, &token, "box").await;

    let root = tempfile::TempDir::new().unwrap();
    for dir in dirs {
        std::fs::create_dir_all(root.path().join(dir)).unwrap();
    }
    for (name, contents) in files {
        std::fs::write(root.path().join(name), contents).unwrap();
    }

    let agent_task = spawn_real_agent(&bastion.ws_url, &agent_token, root.path());
    wait_connected(&client, &bastion.base, &token, &agent_id).await;

    TestEnv {
        base: bastion.base,
        ws_url: bastion.ws_url,
        client,
        token,
        agent_id,
        agent_token,
        root,
        _agent_task: agent_task,
    }
}

impl TestEnv {
    fn files_url(&self) -> String {
        format!("{}/api/agents/{}/files", self.base, self.agent_id)
    }

    fn meta_url(&self) -> String {
        format!("{}/api/agents/{}/meta", self.base, self.agent_id)
    }
}

#[tokio::test]
async fn connect_and_list_shows_entries() {
    let env = env_with_agent(&[("a.txt", b"abc")], &["d"]).await;

    let listing: Value = env
        .client
        .get(env.files_url())
        .query(&[("path", ".")])
        .bearer_auth(&env.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let mut rows = listing.as_array().unwrap().clone();
    rows.sort_by_key(|row| row["name"].as_str().unwrap().to_string());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], "a.txt");
    assert_eq!(rows[0]["is_dir"], false);
    assert_eq!(rows[0]["size"], 3);
    assert!(!rows[0]["mtime"].as_str().unwrap().is_empty());
    assert_eq!(rows[1]["name"], "d");
    assert_eq!(rows[1]["is_dir"], true);
    assert_eq!(rows[1]["size"], 0);
}

#[tokio::test]
async fn path_escape_is_rejected_with_400() {
    let env = env_with_agent(&[("a.txt", b"abc")], &[]).await;

    let response = env
        .client
        .get(env.files_url())
        .query(&[("path", "../etc/passwd")])
        .bearer_auth(&env.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body = response.text().await.unwrap();
    assert!(body.contains("invalid path"), "body: {body}");
}

#[tokio::test]
async fn write_then_read_round_trips_bytes() {
    let env = env_with_agent(&[], &[]).await;

    let put = env
        .client
        .put(env.files_url())
        .query(&[("path", "notes/x.bin")])
        .bearer_auth(&env.token)
        .body(vec![0u8, 1, 2])
        .send()
        .await
        .unwrap();
    assert_eq!(put.status().as_u16(), 204);
    assert_eq!(
        std::fs::read(env.root.path().join("notes/x.bin")).unwrap(),
        vec![0u8, 1, 2]
    );

    let get = env
        .client
        .get(env.files_url())
        .query(&[("path", "notes/x.bin"), ("download", "1")])
        .bearer_auth(&env.token)
        .send()
        .await
        .unwrap();
    assert_eq!(get.status().as_u16(), 200);
    assert_eq!(
        get.headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok()),
        Some("attachment")
    );
    assert_eq!(get.bytes().await.unwrap().as_ref(), &[0u8, 1, 2]);
}

#[tokio::test]
async fn delete_removes_remote_trees() {
    let env = env_with_agent(&[("d/inner.txt", b"x")], &["d"]).await;

    let delete = env
        .client
        .delete(env.files_url())
        .query(&[("path", "d")])
        .bearer_auth(&env.token)
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status().as_u16(), 204);
    assert!(!env.root.path().join("d").exists());
}

#[tokio::test]
async fn meta_reports_stat_results() {
    let env = env_with_agent(&[("a.txt", b"abc")], &[]).await;

    let meta: Value = env
        .client
        .get(env.meta_url())
        .query(&[("path", "a.txt")])
        .bearer_auth(&env.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(meta["size"], 3);
    assert_eq!(meta["is_dir"], false);
    assert!(!meta["mtime"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_requests_multiplex_without_cross_talk() {
    let env = env_with_agent(&[("a.txt", b"abc")], &[]).await;

    let calls = (0..50).map(|_| {
        let client = env.client.clone();
        let url = env.meta_url();
        let token = env.token.clone();
        async move {
            client
                .get(url)
                .query(&[("path", "a.txt")])
                .bearer_auth(token)
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        }
    });
    for meta in join_all(calls).await {
        assert_eq!(meta["size"], 3);
        assert_eq!(meta["is_dir"], false);
    }
}

#[tokio::test]
async fn files_on_a_disconnected_agent_return_503() {
    let bastion = spawn_bastion().await;
    let (client, token) = operator(&bastion.base).await;
    let (agent_id, _) = create_agent(&client, &bastion.base, &token, "offline").await;

    let response = client
        .get(format!("{}/api/agents/{}/files", bastion.base, agent_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);
    assert!(response.text().await.unwrap().contains("agent not connected"));
}

#[tokio::test]
async fn agent_disconnect_mid_call_fails_with_connection_closed() {
    let bastion = spawn_bastion().await;
    let (client, token) = operator(&bastion.base).await;
    let (agent_id, agent_token) = create_agent(&client, &bastion.base, &token, "flaky").await;

    // Authenticated but never replies: the call stays in flight.
    let ws = scripted_agent(&bastion.ws_url, &agent_token).await;

    let url = format!("{}/api/agents/{}/meta?path=a.txt", bastion.base, agent_id);
    let pending = tokio::spawn({
        let client = client.clone();
        let token = token.clone();
        async move { client.get(url).bearer_auth(token).send().await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    drop(ws);
    let response = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);
    assert!(response.text().await.unwrap().contains("connection closed"));

    // After a reconnect, calls succeed again.
    let root = tempfile::TempDir::new().unwrap();
    std::fs::write(root.path().join("a.txt"), b"abc").unwrap();
    let _agent = spawn_real_agent(&bastion.ws_url, &agent_token, root.path());
    wait_connected(&client, &bastion.base, &token, &agent_id).await;
    let meta: Value = client
        .get(format!("{}/api/agents/{}/meta", bastion.base, agent_id))
        .query(&[("path", "a.txt")])
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(meta["size"], 3);
}

#[tokio::test]
async fn a_new_registration_evicts_the_old_connection() {
    let bastion = spawn_bastion().await;
    let (client, token) = operator(&bastion.base).await;
    let (agent_id, agent_token) = create_agent(&client, &bastion.base, &token, "pair").await;

    let mut first = scripted_agent(&bastion.ws_url, &agent_token).await;

    // Park a call on the first connection; it will never be answered.
    let url = format!("{}/api/agents/{}/meta?path=a.txt", bastion.base, agent_id);
    let pending = tokio::spawn({
        let client = client.clone();
        let token = token.clone();
        async move { client.get(url).bearer_auth(token).send().await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut second = scripted_agent(&bastion.ws_url, &agent_token).await;

    // The waiter parked on the evicted connection fails fast.
    let response = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);
    assert!(response.text().await.unwrap().contains("connection closed"));

    // The old socket is closed by the bastion.
    let evicted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(evicted.is_ok(), "old connection never saw the close");

    // New calls are served by the replacement connection.
    let answered = tokio::spawn({
        let client = client.clone();
        let token = token.clone();
        let url = format!("{}/api/agents/{}/meta?path=a.txt", bastion.base, agent_id);
        async move { client.get(url).bearer_auth(token).send().await.unwrap() }
    });
    let request = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match second.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => {
                    if let Ok(BastionFrame::GetMeta { request_id, .. }) =
                        serde_json::from_str(&text)
                    {
                        break request_id;
                    }
                }
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    let reply = AgentFrame::GetMeta {
        request_id: request,
        size: 7,
        mtime: "2026-08-02T10:00:00Z".into(),
        is_dir: false,
        error: None,
    };
    second
        .send(WsMessage::Text(serde_json::to_string(&reply).unwrap()))
        .await
        .unwrap();
    let meta: Value = answered.await.unwrap().json().await.unwrap();
    assert_eq!(meta["size"], 7);
}

#[tokio::test]
async fn files_route_rejects_other_methods() {
    let env = env_with_agent(&[], &[]).await;
    let response = env
        .client
        .post(env.files_url())
        .bearer_auth(&env.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);
}

#[tokio::test]
async fn api_requires_a_session() {
    let bastion = spawn_bastion().await;
    let (client, token) = operator(&bastion.base).await;

    let anonymous = client
        .get(format!("{}/api/agents", bastion.base))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status().as_u16(), 401);

    // The same token works as a cookie.
    let with_cookie = client
        .get(format!("{}/api/agents", bastion.base))
        .header("cookie", format!("session={token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(with_cookie.status().as_u16(), 200);

    let me: Value = client
        .get(format!("{}/api/me", bastion.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["username"], "admin");
}

#[tokio::test]
async fn registration_is_one_shot() {
    let bastion = spawn_bastion().await;
    let (client, _) = operator(&bastion.base).await;

    let second = client
        .post(format!("{}/api/register", bastion.base))
        .json(&json!({"username": "intruder", "password": "pw"}))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status().as_u16(), 403);

    let setup: Value = client
        .get(format!("{}/api/setup", bastion.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(setup["registration_open"], false);
}

#[tokio::test]
async fn unknown_agent_tokens_get_an_auth_error_frame() {
    let bastion = spawn_bastion().await;
    let (mut ws, _) = connect_async(&bastion.ws_url).await.unwrap();
    let auth = AgentFrame::Auth {
        token: "bogus".into(),
    };
    ws.send(WsMessage::Text(serde_json::to_string(&auth).unwrap()))
        .await
        .unwrap();
    let frame = loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => break serde_json::from_str::<BastionFrame>(&text).unwrap(),
            _ => continue,
        }
    };
    match frame {
        BastionFrame::AuthError { error } => assert_eq!(error, "invalid token"),
        other => panic!("expected auth_error, got {other:?}"),
    }
}

#[tokio::test]
async fn deleting_an_agent_disconnects_its_session() {
    let env = env_with_agent(&[("a.txt", b"abc")], &[]).await;

    let deleted = env
        .client
        .delete(format!("{}/api/agents/{}", env.base, env.agent_id))
        .bearer_auth(&env.token)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status().as_u16(), 204);

    let response = env
        .client
        .get(env.files_url())
        .bearer_auth(&env.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);

    // The dropped record's token no longer authenticates.
    let (mut ws, _) = connect_async(&env.ws_url).await.unwrap();
    let auth = AgentFrame::Auth {
        token: env.agent_token.clone(),
    };
    ws.send(WsMessage::Text(serde_json::to_string(&auth).unwrap()))
        .await
        .unwrap();
    let frame = loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => break serde_json::from_str::<BastionFrame>(&text).unwrap(),
            _ => continue,
        }
    };
    assert!(matches!(frame, BastionFrame::AuthError { .. }));
}

#[tokio::test]
async fn rename_and_listing_round_trip() {
    let bastion = spawn_bastion().await;
    let (client, token) = operator(&bastion.base).await;
    let (agent_id, _) = create_agent(&client, &bastion.base, &token, "old-name").await;

    let patched = client
        .patch(format!("{}/api/agents/{}", bastion.base, agent_id))
        .bearer_auth(&token)
        .json(&json!({"label": "new-name"}))
        .send()
        .await
        .unwrap();
    assert_eq!(patched.status().as_u16(), 204);

    let agents: Value = client
        .get(format!("{}/api/agents", bastion.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let row = &agents.as_array().unwrap()[0];
    assert_eq!(row["label"], "new-name");
    assert_eq!(row["connected"], false);
    assert!(row.get("disk_free").is_none());
}

#[tokio::test]
async fn preflight_requests_return_204_with_cors_headers() {
    let bastion = spawn_bastion().await;
    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::OPTIONS, format!("{}/api/agents", bastion.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}
