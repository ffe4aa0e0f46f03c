//! Session-level tests driving a real agent loop against an in-process
//! WebSocket listener standing in for the bastion.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use stowaway_agent::session::{run_session, SessionEnd};
use stowaway_proto::{AgentFrame, BastionFrame};

async fn send_frame<S>(
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
    frame: &BastionFrame,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    ws.send(Message::Text(serde_json::to_string(frame).unwrap()))
        .await
        .unwrap();
}

async fn recv_frame<S>(ws: &mut tokio_tungstenite::WebSocketStream<S>) -> AgentFrame
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn session_authenticates_and_serves_requests() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let AgentFrame::Auth { token } = recv_frame(&mut ws).await else {
            panic!("expected auth frame first");
        };
        assert_eq!(token, "secret-token");
        send_frame(
            &mut ws,
            &BastionFrame::AuthOk {
                agent_id: "agent-1".into(),
            },
        )
        .await;

        send_frame(
            &mut ws,
            &BastionFrame::ListDir {
                request_id: "req-1".into(),
                path: ".".into(),
            },
        )
        .await;
        let AgentFrame::ListDir {
            request_id,
            entries,
            error,
        } = recv_frame(&mut ws).await
        else {
            panic!("expected list_dir reply");
        };
        assert_eq!(request_id, "req-1");
        assert!(error.is_none());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 3);

        ws.send(Message::Close(None)).await.unwrap();
    });

    let url = format!("ws://{addr}");
    let end = run_session(&url, "secret-token", dir.path()).await;
    assert_eq!(end, SessionEnd::Disconnected);
    server.await.unwrap();
}

#[tokio::test]
async fn invalid_path_is_a_reply_error_not_a_disconnect() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("keep.txt"), b"ok").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = recv_frame(&mut ws).await;
        send_frame(
            &mut ws,
            &BastionFrame::AuthOk {
                agent_id: "agent-1".into(),
            },
        )
        .await;

        send_frame(
            &mut ws,
            &BastionFrame::ReadFile {
                request_id: "escape".into(),
                path: "../etc/passwd".into(),
                offset: 0,
                size: 0,
            },
        )
        .await;
        let AgentFrame::ReadFile { error, .. } = recv_frame(&mut ws).await else {
            panic!("expected read_file reply");
        };
        assert_eq!(error.as_deref(), Some("invalid path"));

        // The connection survives the handler error.
        send_frame(
            &mut ws,
            &BastionFrame::GetMeta {
                request_id: "after".into(),
                path: "keep.txt".into(),
            },
        )
        .await;
        let AgentFrame::GetMeta { size, error, .. } = recv_frame(&mut ws).await else {
            panic!("expected get_meta reply");
        };
        assert!(error.is_none());
        assert_eq!(size, 2);

        ws.send(Message::Close(None)).await.unwrap();
    });

    let url = format!("ws://{addr}");
    let end = run_session(&url, "secret-token", dir.path()).await;
    assert_eq!(end, SessionEnd::Disconnected);
    server.await.unwrap();
}

#[tokio::test]
async fn rejected_token_ends_the_session_as_auth_failed() {
    let dir = tempfile::TempDir::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = recv_frame(&mut ws).await;
        send_frame(
            &mut ws,
            &BastionFrame::AuthError {
                error: "invalid token".into(),
            },
        )
        .await;
        ws.send(Message::Close(None)).await.unwrap();
    });

    let url = format!("ws://{addr}");
    let end = run_session(&url, "bad-token", dir.path()).await;
    assert_eq!(end, SessionEnd::AuthFailed);
    server.await.unwrap();
}
