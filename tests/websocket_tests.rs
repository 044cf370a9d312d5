// tests/websocket_tests.rs
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use maplit::btreemap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use relay_client::transport::WsConnector;
use relay_client::transport::frame::{Command, Frame};
use relay_client::{ConnectionManager, ConnectionState, Headers, ManagerConfig, RelayError};

async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Result<Frame> {
    while let Some(message) = ws.next().await {
        if let Message::Text(text) = message? {
            if let Some(frame) = Frame::decode(&text)? {
                return Ok(frame);
            }
        }
    }
    anyhow::bail!("client went away")
}

async fn reply(ws: &mut WebSocketStream<TcpStream>, frame: Frame) -> Result<()> {
    ws.send(Message::Text(frame.encode())).await?;
    Ok(())
}

fn manager_for(endpoint: String) -> Result<ConnectionManager> {
    manager_with_timeout(endpoint, Duration::from_secs(5))
}

fn manager_with_timeout(endpoint: String, timeout: Duration) -> Result<ConnectionManager> {
    let config = ManagerConfig::default().connect_timeout(timeout);
    Ok(ConnectionManager::new(
        "guest",
        endpoint,
        config,
        Arc::new(WsConnector::new()),
    )?)
}

#[tokio::test]
async fn test_session_against_local_broker() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("ws://{}/ws", listener.local_addr()?);

    let broker = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut ws = tokio_tungstenite::accept_async(stream).await?;

        let connect = next_frame(&mut ws).await?;
        assert_eq!(connect.command, Command::Connect);
        assert_eq!(connect.get("login"), Some("guest"));
        assert_eq!(connect.get("accept-version"), Some("1.2"));
        reply(&mut ws, Frame::new(Command::Connected).header("version", "1.2")).await?;

        let subscribe = next_frame(&mut ws).await?;
        assert_eq!(subscribe.command, Command::Subscribe);
        assert_eq!(subscribe.get("destination"), Some("/topic/chat"));
        let id = subscribe.get("id").context("SUBSCRIBE without id")?.to_string();

        reply(
            &mut ws,
            Frame::new(Command::Message)
                .header("destination", "/topic/chat")
                .header("subscription", id.clone())
                .header("message-id", "m-1")
                .body("hello"),
        )
        .await?;

        let send = next_frame(&mut ws).await?;
        assert_eq!(send.command, Command::Send);
        assert_eq!(send.get("destination"), Some("/topic/chat"));
        assert_eq!(send.get("content-type"), Some("application/json"));
        assert_eq!(send.body, "{\"text\":\"reply\"}");

        let plain = next_frame(&mut ws).await?;
        assert_eq!(plain.get("content-type"), Some("text/plain"));
        assert_eq!(plain.body, "reply");

        let unsubscribe = next_frame(&mut ws).await?;
        assert_eq!(unsubscribe.command, Command::Unsubscribe);
        assert_eq!(unsubscribe.get("id"), Some(id.as_str()));

        let disconnect = next_frame(&mut ws).await?;
        assert_eq!(disconnect.command, Command::Disconnect);
        anyhow::Ok(())
    });

    let manager = manager_for(endpoint)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.subscribe("/topic/chat", move |envelope| {
        let _ = tx.send(envelope.body.clone());
    });

    manager.connect().await?;
    assert_eq!(manager.state(), ConnectionState::Connected);

    let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .context("callback channel closed")?;
    assert_eq!(body, "hello");

    let json = btreemap! {
        "content-type".to_string() => "application/json".to_string(),
    };
    manager.send("/topic/chat", &json, "{\"text\":\"reply\"}")?;
    manager.send("/topic/chat", &Headers::new(), "reply")?;
    manager.disconnect();

    tokio::time::timeout(Duration::from_secs(5), broker).await???;
    Ok(())
}

#[tokio::test]
async fn test_error_frame_rejects_connect() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("ws://{}/ws", listener.local_addr()?);

    let broker = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut ws = tokio_tungstenite::accept_async(stream).await?;
        next_frame(&mut ws).await?;
        reply(
            &mut ws,
            Frame::new(Command::Error).header("message", "Bad CONNECT"),
        )
        .await?;
        anyhow::Ok(())
    });

    let manager = manager_for(endpoint)?;
    let result = manager.connect().await;
    assert_eq!(result, Err(RelayError::Rejected("Bad CONNECT".to_string())));

    manager.disconnect();
    broker.await??;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_connect() -> Result<()> {
    // bind then drop to get a port nobody listens on
    let endpoint = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        format!("ws://{}/ws", listener.local_addr()?)
    };

    let manager = manager_for(endpoint)?;
    let result = manager.connect().await;
    assert!(matches!(result, Err(RelayError::Transport(_))));
    assert_eq!(manager.reconnect_attempts(), 1);

    manager.disconnect();
    Ok(())
}

#[tokio::test]
async fn test_invalid_endpoint_fails_connect() -> Result<()> {
    let manager = manager_for("not a url".to_string())?;
    let result = manager.connect().await;
    assert!(matches!(result, Err(RelayError::Transport(_))));
    manager.disconnect();
    Ok(())
}

// Reads every frame until the client sends DISCONNECT or goes away
async fn collect_frames(ws: &mut WebSocketStream<TcpStream>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = next_frame(ws).await {
        let done = frame.command == Command::Disconnect;
        frames.push(frame);
        if done {
            break;
        }
    }
    frames
}

#[test]
fn test_shutdown_flushes_queued_send() -> Result<()> {
    let broker_rt = tokio::runtime::Runtime::new()?;
    let listener = broker_rt.block_on(TcpListener::bind("127.0.0.1:0"))?;
    let endpoint = format!("ws://{}/ws", listener.local_addr()?);

    let broker = broker_rt.spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut ws = tokio_tungstenite::accept_async(stream).await?;
        next_frame(&mut ws).await?;
        reply(&mut ws, Frame::new(Command::Connected).header("version", "1.2")).await?;
        anyhow::Ok(collect_frames(&mut ws).await)
    });

    // the client runtime is dropped right after shutdown returns
    let client_rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    client_rt.block_on(async {
        let manager = manager_for(endpoint)?;
        manager.connect().await?;
        manager.send("/queue/out", &Headers::new(), "last words")?;
        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Idle);
        anyhow::Ok(())
    })?;
    drop(client_rt);

    let frames = broker_rt.block_on(async {
        tokio::time::timeout(Duration::from_secs(5), broker).await
    })???;

    assert!(
        frames
            .iter()
            .any(|f| f.command == Command::Send && f.body == "last words"),
        "SEND never reached the broker: {:?}",
        frames
    );
    assert_eq!(frames.last().map(|f| f.command), Some(Command::Disconnect));
    Ok(())
}

#[tokio::test]
async fn test_stalled_handshake_is_abandoned_on_timeout() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("ws://{}/ws", listener.local_addr()?);

    // accepts TCP but never answers the upgrade request
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await?;
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return anyhow::Ok(()),
                Ok(_) => {}
            }
        }
    });

    let manager = manager_with_timeout(endpoint, Duration::from_millis(500))?;
    let result = manager.connect().await;
    assert_eq!(result, Err(RelayError::ConnectTimeout(Duration::from_millis(500))));
    manager.disconnect();

    // the client side socket is released, so the server sees EOF
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .context("stalled handshake kept its socket open")???;
    Ok(())
}
