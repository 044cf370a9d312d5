// src/transport/websocket.rs
use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, handshake::client::Request, Message},
};

use super::frame::{Command, Frame};
use super::{
    Connector, Envelope, EventSink, Headers, OpenRequest, Transport, TransportEvent,
    TransportSubscription,
};

// Generate unique subscription ids across all sessions of the process
static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

/// Opens STOMP 1.2 sessions over WebSocket
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    virtual_host: Option<String>,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the `host` header sent on CONNECT (defaults to the URL host)
    pub fn with_virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = Some(host.into());
        self
    }
}

impl Connector for WsConnector {
    fn open(&self, request: OpenRequest<'_>, events: EventSink) -> Result<Box<dyn Transport>> {
        if request.endpoint.is_empty() {
            return Err(anyhow::anyhow!("Empty endpoint URL provided"));
        }

        let ws_request = request
            .endpoint
            .into_client_request()
            .with_context(|| format!("Invalid endpoint URL: {}", request.endpoint))?;

        let host = self
            .virtual_host
            .clone()
            .or_else(|| ws_request.uri().host().map(str::to_string))
            .unwrap_or_else(|| "/".to_string());

        let connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("heart-beat", "0,0")
            .header("host", host)
            .headers(request.headers);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(());

        info!("Opening WebSocket session to {}", request.endpoint);
        tokio::spawn(async move {
            run_session(ws_request, connect, outbound_rx, events).await;
            drop(done_tx);
        });

        Ok(Box::new(WsTransport {
            outbound: outbound_tx,
            done: done_rx,
            closed: false,
        }))
    }
}

/// Client half of one STOMP-over-WebSocket session
pub struct WsTransport {
    outbound: UnboundedSender<Frame>,
    // the session task drops its sender on exit
    done: watch::Receiver<()>,
    closed: bool,
}

impl WsTransport {
    fn queue(&self, frame: Frame) -> Result<()> {
        if self.closed {
            anyhow::bail!("Session already closed");
        }
        self.outbound
            .send(frame)
            .map_err(|_| anyhow::anyhow!("Session task has exited"))
    }
}

impl Transport for WsTransport {
    fn subscribe(&mut self, destination: &str) -> Result<TransportSubscription> {
        let id = format!("sub-{}", NEXT_SUB_ID.fetch_add(1, Ordering::SeqCst));
        self.queue(
            Frame::new(Command::Subscribe)
                .header("id", id.clone())
                .header("destination", destination)
                .header("ack", "auto"),
        )?;
        Ok(TransportSubscription::new(id))
    }

    fn unsubscribe(&mut self, subscription: &TransportSubscription) -> Result<()> {
        self.queue(Frame::new(Command::Unsubscribe).header("id", subscription.as_str()))
    }

    fn publish(&mut self, destination: &str, headers: &Headers, body: &str) -> Result<()> {
        self.queue(
            Frame::new(Command::Send)
                .header("destination", destination)
                .headers(headers)
                .default_header("content-type", "text/plain")
                .body(body),
        )
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.queue(Frame::new(Command::Disconnect)) {
            debug!("Skipping DISCONNECT frame: {}", e);
        }
        self.closed = true;
    }

    fn finished(&self) -> BoxFuture<'static, ()> {
        let mut done = self.done.clone();
        async move {
            // never sent on, so this returns once the session task is gone
            let _ = done.changed().await;
        }
        .boxed()
    }
}

// Drive one session: handshake, CONNECT, then pump frames both ways until
// either side closes. Every outcome is reported through `events`.
async fn run_session(
    request: Request,
    connect: Frame,
    mut outbound: UnboundedReceiver<Frame>,
    events: EventSink,
) {
    // Give up on the handshake as soon as the transport is closed or dropped,
    // so a stalled connect does not outlive its attempt
    let mut early = Vec::new();
    let handshake = connect_async(request);
    tokio::pin!(handshake);
    let ws = loop {
        tokio::select! {
            result = &mut handshake => match result {
                Ok((ws, _response)) => break ws,
                Err(e) => {
                    error!("WebSocket handshake failed: {}", e);
                    events.emit(TransportEvent::Error(format!("handshake failed: {}", e)));
                    return;
                }
            },
            frame = outbound.recv() => match frame {
                Some(frame) if frame.command != Command::Disconnect => early.push(frame),
                _ => {
                    debug!("Transport closed during handshake, abandoning it");
                    return;
                }
            },
        }
    };

    let (mut sink, mut stream) = ws.split();

    for frame in std::iter::once(connect).chain(early) {
        if let Err(e) = sink.send(Message::Text(frame.encode())).await {
            error!("Failed to send {} frame: {}", frame.command, e);
            events.emit(TransportEvent::Error(format!("failed to send {}: {}", frame.command, e)));
            return;
        }
    }

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        let is_disconnect = frame.command == Command::Disconnect;
                        if let Err(e) = sink.send(Message::Text(frame.encode())).await {
                            error!("Failed to send {} frame: {}", frame.command, e);
                            events.emit(TransportEvent::Error(e.to_string()));
                            break;
                        }
                        if is_disconnect {
                            let _ = sink.close().await;
                            events.emit(TransportEvent::Closed {
                                code: None,
                                reason: "client disconnect".to_string(),
                            });
                            break;
                        }
                    }
                    None => {
                        // transport handle dropped without close()
                        let _ = sink.close().await;
                        break;
                    }
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => handle_text(&text, &events),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => handle_text(&text, &events),
                        Err(e) => warn!("Dropping non UTF-8 binary frame: {}", e),
                    },
                    Some(Ok(Message::Close(close))) => {
                        let (code, reason) = match close {
                            Some(close) => (Some(u16::from(close.code)), close.reason.into_owned()),
                            None => (None, String::new()),
                        };
                        info!("Server closed the WebSocket ({:?}) {}", code, reason);
                        events.emit(TransportEvent::Closed { code, reason });
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        events.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        events.emit(TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }

    debug!("WebSocket session task exiting");
}

fn handle_text(text: &str, events: &EventSink) {
    let frame = match Frame::decode(text) {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(e) => {
            warn!("Dropping undecodable frame: {}", e);
            return;
        }
    };

    match frame.command {
        Command::Connected => {
            debug!("Session established (version {:?})", frame.get("version"));
            events.emit(TransportEvent::Opened);
        }
        Command::Message => {
            let Some(destination) = frame.get("destination").map(str::to_string) else {
                warn!("MESSAGE frame without destination header");
                return;
            };
            let subscription = frame.get("subscription").map(TransportSubscription::new);
            events.emit(TransportEvent::Message(Envelope {
                destination,
                subscription,
                headers: frame.headers,
                body: frame.body,
            }));
        }
        Command::Error => {
            let message = frame
                .get("message")
                .map(str::to_string)
                .unwrap_or_else(|| frame.body.clone());
            warn!("Server sent ERROR frame: {}", message);
            events.emit(TransportEvent::Rejected(message));
        }
        Command::Receipt => {}
        other => warn!("Unexpected {} frame from server", other),
    }
}
