/// Connection layer for the `/api/generate` endpoint.
///
/// Streaming requests are written by hand over a `TcpStream` so the raw
/// response (status line, headers, NDJSON body) reaches the de-framer byte for
/// byte. The request is sent as HTTP/1.0, which keeps the server from using
/// chunked transfer encoding: the body runs unframed until the server closes.
///
/// Every connection runs in its own tokio task and reports back over an
/// unbounded channel, tagged with the session id it belongs to. The UI loop
/// drains that channel on its own thread, so sessions never touch shared state
/// from the network task.
use anyhow::{Context, Result, anyhow, bail};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

const READ_BUF_BYTES: usize = 8 * 1024;

pub type SessionId = u64;

// ── Messages delivered to the UI loop ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// TCP connection established, request about to be written.
    Connected,
    /// Raw response bytes, in arrival order.
    Chunk(Vec<u8>),
    /// Complete reply text from a non-streaming request.
    Response(String),
    /// The server closed the connection.
    Closed,
    /// Transport failure. No further events follow.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMessage {
    pub session: SessionId,
    pub event: NetEvent,
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Endpoint {
    generate_url: Url,
    host: String,
    port: u16,
    api_key: Option<String>,
}

impl Endpoint {
    /// `base` is the server root, e.g. `http://localhost:11434`.
    pub fn parse(base: &str, api_key: Option<String>) -> Result<Self> {
        let generate = format!("{}/api/generate", base.trim_end_matches('/'));
        let generate_url = Url::parse(&generate).with_context(|| format!("invalid endpoint URL '{base}'"))?;
        if generate_url.scheme() != "http" {
            bail!("endpoint '{base}' must use http:// (the generate stream is read over plain TCP)");
        }
        let host = generate_url
            .host_str()
            .ok_or_else(|| anyhow!("endpoint '{base}' has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = generate_url.port_or_known_default().unwrap_or(80);
        Ok(Self {
            generate_url,
            host,
            port,
            api_key,
        })
    }

    /// Full HTTP request bytes for a streaming generate call.
    pub fn raw_request(&self, body: &[u8]) -> Vec<u8> {
        let mut path = self.generate_url.path().to_string();
        if let Some(q) = self.generate_url.query() {
            path.push('?');
            path.push_str(q);
        }
        let host = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };

        let mut head = format!(
            "POST {path} HTTP/1.0\r\n\
             Host: {host}\r\n\
             User-Agent: oxchat/{}\r\n\
             Accept: application/x-ndjson\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n",
            env!("CARGO_PKG_VERSION"),
            body.len(),
        );
        if let Some(key) = &self.api_key {
            head.push_str(&format!("Authorization: Bearer {key}\r\n"));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(body);
        out
    }
}

pub fn request_body(model: &str, prompt: &str, stream: bool) -> Result<Vec<u8>> {
    serde_json::to_vec(&GenerateRequest { model, prompt, stream }).context("serialising generate request")
}

// ── Connection handle ─────────────────────────────────────────────────────────

/// Owner of a running connection task. Cancelling (or dropping) the handle
/// closes the socket; nothing further is sent for that session.
#[derive(Debug)]
pub struct ConnectionHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl ConnectionHandle {
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ── Streaming connection ──────────────────────────────────────────────────────

pub fn spawn_stream(
    endpoint: &Endpoint,
    request: Vec<u8>,
    session: SessionId,
    tx: mpsc::UnboundedSender<NetMessage>,
) -> ConnectionHandle {
    let host = endpoint.host.clone();
    let port = endpoint.port;
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        tokio::select! {
            result = pump(&host, port, &request, session, &tx) => {
                let event = match result {
                    Ok(()) => NetEvent::Closed,
                    Err(e) => {
                        tracing::warn!(session, error = %e, "generate connection failed");
                        NetEvent::Error(format!("{host}:{port}: {e}"))
                    }
                };
                let _ = tx.send(NetMessage { session, event });
            }
            _ = cancel_rx => {
                tracing::debug!(session, "connection cancelled");
            }
        }
    });

    ConnectionHandle { cancel: Some(cancel_tx) }
}

async fn pump(
    host: &str,
    port: u16,
    request: &[u8],
    session: SessionId,
    tx: &mpsc::UnboundedSender<NetMessage>,
) -> std::io::Result<()> {
    let mut stream = TcpStream::connect((host, port)).await?;
    let _ = tx.send(NetMessage { session, event: NetEvent::Connected });
    stream.write_all(request).await?;
    stream.flush().await?;

    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let msg = NetMessage {
            session,
            event: NetEvent::Chunk(buf[..n].to_vec()),
        };
        if tx.send(msg).is_err() {
            // receiver gone: nobody is listening for this session any more
            return Ok(());
        }
    }
}

// ── Non-streaming request ─────────────────────────────────────────────────────

pub async fn generate_once(http: &reqwest::Client, endpoint: &Endpoint, model: &str, prompt: &str) -> Result<String> {
    let mut req = http
        .post(endpoint.generate_url.clone())
        .header("Content-Type", "application/json")
        .json(&GenerateRequest { model, prompt, stream: false });
    if let Some(key) = &endpoint.api_key {
        req = req.header("Authorization", format!("Bearer {key}"));
    }

    let resp = req.send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("API error {}: {}", status, text));
    }
    let parsed: GenerateResponse = resp.json().await.context("decoding generate response")?;
    Ok(parsed.response)
}

pub fn spawn_generate(
    http: reqwest::Client,
    endpoint: &Endpoint,
    model: String,
    prompt: String,
    session: SessionId,
    tx: mpsc::UnboundedSender<NetMessage>,
) -> ConnectionHandle {
    let endpoint = endpoint.clone();
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        tokio::select! {
            result = generate_once(&http, &endpoint, &model, &prompt) => {
                let events = match result {
                    Ok(text) => vec![NetEvent::Connected, NetEvent::Response(text), NetEvent::Closed],
                    Err(e) => {
                        tracing::warn!(session, error = %e, "generate request failed");
                        vec![NetEvent::Error(format!("{e:#}"))]
                    }
                };
                for event in events {
                    let _ = tx.send(NetMessage { session, event });
                }
            }
            _ = cancel_rx => {
                tracing::debug!(session, "request cancelled");
            }
        }
    });

    ConnectionHandle { cancel: Some(cancel_tx) }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Read one HTTP request (headers plus Content-Length body) from `sock`.
    pub(crate) async fn read_request(sock: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let len = text[..head_end]
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= head_end + 4 + len || n == 0 {
                    return text;
                }
            }
            if n == 0 {
                return text;
            }
        }
    }

    /// Serve one connection: read the request, write `reply` in `parts`, close.
    pub(crate) async fn serve_once(parts: Vec<&'static str>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let req = read_request(&mut sock).await;
            for part in parts {
                sock.write_all(part.as_bytes()).await.unwrap();
                sock.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            req
        });
        (base, server)
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("http://localhost:11434/", None).unwrap();
        assert_eq!(ep.generate_url.as_str(), "http://localhost:11434/api/generate");
        assert_eq!(ep.port, 11434);

        let ep = Endpoint::parse("http://[::1]:8080", None).unwrap();
        assert_eq!(ep.host, "::1");

        assert!(Endpoint::parse("https://example.com", None).is_err());
        assert!(Endpoint::parse("not a url", None).is_err());
    }

    #[test]
    fn test_raw_request_shape() {
        let ep = Endpoint::parse("http://127.0.0.1:11434", Some("k".into())).unwrap();
        let body = request_body("llama3", "hi", true).unwrap();
        let raw = String::from_utf8(ep.raw_request(&body)).unwrap();
        assert!(raw.starts_with("POST /api/generate HTTP/1.0\r\n"));
        assert!(raw.contains("Host: 127.0.0.1:11434\r\n"));
        assert!(raw.contains("Authorization: Bearer k\r\n"));
        assert!(raw.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(raw.ends_with("\r\n\r\n{\"model\":\"llama3\",\"prompt\":\"hi\",\"stream\":true}"));
    }

    #[tokio::test]
    async fn test_stream_delivers_chunks_then_close() {
        let (base, server) = serve_once(vec![
            "HTTP/1.0 200 OK\r\n\r\n",
            "{\"response\":\"a\",\"done\":false}\n",
        ])
        .await;
        let ep = Endpoint::parse(&base, None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = request_body("m", "p", true).unwrap();
        let _handle = spawn_stream(&ep, ep.raw_request(&body), 7, tx);

        let mut bytes = Vec::new();
        let mut events = Vec::new();
        while let Some(msg) = rx.recv().await {
            assert_eq!(msg.session, 7);
            match msg.event {
                NetEvent::Chunk(b) => bytes.extend(b),
                NetEvent::Closed => {
                    events.push("closed");
                    break;
                }
                NetEvent::Connected => events.push("connected"),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(events, vec!["connected", "closed"]);
        assert_eq!(bytes, b"HTTP/1.0 200 OK\r\n\r\n{\"response\":\"a\",\"done\":false}\n");

        let req = server.await.unwrap();
        assert!(req.contains("\"stream\":true"));
    }

    #[tokio::test]
    async fn test_connection_refused_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ep = Endpoint::parse(&format!("http://{addr}"), None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_stream(&ep, ep.raw_request(b"{}"), 1, tx);
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg.event, NetEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_generate_once_reads_single_object() {
        let (base, server) = serve_once(vec![
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 35\r\nConnection: close\r\n\r\n",
            "{\"response\":\"four\",\"done\":true}\n\n\n\n",
        ])
        .await;
        let ep = Endpoint::parse(&base, None).unwrap();
        let text = generate_once(&reqwest::Client::new(), &ep, "m", "2+2?").await.unwrap();
        assert_eq!(text, "four");
        let req = server.await.unwrap();
        assert!(req.contains("\"stream\":false"));
    }
}
