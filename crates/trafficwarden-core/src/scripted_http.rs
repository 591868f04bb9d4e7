//! Scripted HTTP/1.1 responder for testing the outbound clients.
//!
//! Each scripted reply answers exactly one connection and closes it, so the
//! client cannot pipeline a second request onto a socket the script is done
//! with. Requests are recorded in arrival order.

use std::collections::HashMap;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Lower-cased header names
    pub headers: HashMap<String, String>,
    /// JSON body, or `Null` when the body was empty or not JSON
    pub body: Value,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

pub struct ScriptedServer {
    pub url: String,
    task: JoinHandle<Vec<RecordedRequest>>,
}

impl ScriptedServer {
    /// Serve `replies` in order as `(status, JSON body)`, one per connection.
    pub async fn start(replies: Vec<(u16, Value)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let task = tokio::spawn(async move {
            let mut seen = Vec::with_capacity(replies.len());
            for (status, body) in replies {
                let (stream, _) = listener.accept().await.expect("accept");
                let mut reader = BufReader::new(stream);
                seen.push(read_request(&mut reader).await);

                let body = body.to_string();
                let response = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let mut stream = reader.into_inner();
                stream.write_all(response.as_bytes()).await.expect("write");
                stream.shutdown().await.expect("shutdown");
            }
            seen
        });
        Self {
            url: format!("http://{addr}"),
            task,
        }
    }

    /// Wait for every scripted reply to be served.
    pub async fn requests(self) -> Vec<RecordedRequest> {
        self.task.await.expect("join")
    }
}

async fn read_request(reader: &mut BufReader<TcpStream>) -> RecordedRequest {
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("request line");
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    loop {
        line.clear();
        reader.read_line(&mut line).await.expect("header line");
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let len = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await.expect("body");
    RecordedRequest {
        method,
        path,
        headers,
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    }
}
