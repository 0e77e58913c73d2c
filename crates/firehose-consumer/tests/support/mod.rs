#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use firehose_consumer::{
    CounterEvent, Envelope, Event, LogMessage, MessageType, ValueMetric,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

pub const STEP: Duration = Duration::from_secs(5);

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(STEP, future)
        .await
        .expect("step timed out")
}

/// What the server does with one accepted connection.
pub enum Script {
    /// Upgrade, send the frames, then drop the socket without a close frame.
    SendThenDrop(Vec<Vec<u8>>),
    /// Upgrade, send the frames, then read until the client closes.
    SendThenHold(Vec<Vec<u8>>),
    /// Refuse the upgrade with 401 and this body.
    Reject(&'static str),
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub origin: Option<String>,
    pub authorization: Option<String>,
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub requests: mpsc::UnboundedReceiver<SeenRequest>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

/// Serves one script per accepted connection. Connections beyond the scripts
/// are dropped before the upgrade.
pub async fn serve(scripts: Vec<Script>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, requests) = mpsc::unbounded_channel();
    let scripts = Arc::new(Mutex::new(VecDeque::from(scripts)));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let next = scripts.lock().pop_front();
            let Some(script) = next else {
                drop(stream);
                continue;
            };
            tokio::spawn(handle_connection(stream, script, seen_tx.clone()));
        }
    });

    TestServer { addr, requests }
}

async fn handle_connection(
    stream: TcpStream,
    script: Script,
    seen: mpsc::UnboundedSender<SeenRequest>,
) {
    let reject = match &script {
        Script::Reject(body) => Some(*body),
        _ => None,
    };
    let callback = move |request: &Request, response: Response| {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let _ = seen.send(SeenRequest {
            path: request.uri().path().to_string(),
            origin: header("origin"),
            authorization: header("authorization"),
        });
        match reject {
            Some(body) => {
                let mut refusal = ErrorResponse::new(Some(body.to_string()));
                *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                Err(refusal)
            }
            None => Ok(response),
        }
    };

    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    match script {
        Script::SendThenDrop(frames) => {
            for frame in frames {
                if ws.send(Message::Binary(frame)).await.is_err() {
                    return;
                }
            }
            drop(ws);
        }
        Script::SendThenHold(frames) => {
            for frame in frames {
                if ws.send(Message::Binary(frame)).await.is_err() {
                    return;
                }
            }
            while let Some(message) = ws.next().await {
                if message.is_err() {
                    break;
                }
            }
        }
        Script::Reject(_) => {}
    }
}

/// Minimal HTTP CONNECT proxy. Returns its address and a counter of tunnels.
pub async fn connect_proxy() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tunnels = Arc::new(Mutex::new(Vec::new()));
    let seen = tunnels.clone();

    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match client.read(&mut byte).await {
                        Ok(1) => head.push(byte[0]),
                        _ => return,
                    }
                }
                let head = String::from_utf8_lossy(&head).into_owned();
                let Some(authority) = head
                    .strip_prefix("CONNECT ")
                    .and_then(|rest| rest.split_whitespace().next())
                    .map(str::to_string)
                else {
                    return;
                };
                seen.lock().push(authority.clone());
                let Ok(mut upstream) = TcpStream::connect(&authority).await else {
                    let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                    return;
                };
                if client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });

    (addr, tunnels)
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn log_frame(app_id: &str, text: &'static str) -> Vec<u8> {
    Envelope::new(
        "router",
        Event::LogMessage(LogMessage {
            message: Bytes::from_static(text.as_bytes()),
            message_type: MessageType::Out,
            timestamp: 1_700_000_000_000_000_000,
            app_id: app_id.to_string(),
            source_type: "APP".into(),
            source_instance: "0".into(),
        }),
    )
    .encode()
}

pub fn metric_frame(name: &str, value: f64) -> Vec<u8> {
    Envelope::new(
        "metron",
        Event::ValueMetric(ValueMetric {
            name: name.to_string(),
            value,
            unit: "ms".into(),
        }),
    )
    .encode()
}

pub fn counter_frame(name: &str, total: u64) -> Vec<u8> {
    Envelope::new(
        "metron",
        Event::CounterEvent(CounterEvent {
            name: name.to_string(),
            delta: 1,
            total,
        }),
    )
    .encode()
}
