//! Origin proxy: forward a decoded request to the local origin server.
//!
//! One blocking-style operation per request over a fresh TCP connection
//! (`Connection: close`), with explicit connect and read timeouts. Any
//! failure before a complete response is produced turns into a synthesized
//! 502 so the stream always gets an answer.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use argotun_proto::ConnectRequest;

/// Metadata key prefix for forwarded request headers.
const HEADER_PREFIX: &str = "HttpHeader:";

/// Maximum number of response headers we parse.
const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("connection to origin failed: {0}")]
    Connect(std::io::Error),

    #[error("connection to origin timed out")]
    ConnectTimeout,

    #[error("origin read timed out")]
    ReadTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("origin closed the connection before responding")]
    ClosedEarly,

    #[error("invalid response head: {0}")]
    BadResponse(&'static str),

    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

/// Where and how to reach the origin.
#[derive(Debug, Clone)]
pub struct OriginConfig {
    pub host: String,
    pub port: u16,
    /// Path prefix prepended to every request destination; trailing slash
    /// stripped (a bare `/` is kept and treated as no prefix).
    pub path_prefix: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Cap on the buffered response body.
    pub max_body: usize,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            path_prefix: String::new(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            max_body: 1024 * 1024,
        }
    }
}

impl OriginConfig {
    /// Parse `http://host[:port][/prefix]`. An `https://` origin is
    /// accepted syntactically but spoken to as plain HTTP, with a warning.
    pub fn from_url(url: &str) -> Result<Self, crate::ConfigError> {
        let rest = if let Some(rest) = url.strip_prefix("http://") {
            rest
        } else if let Some(rest) = url.strip_prefix("https://") {
            warn!("HTTPS origins are not supported yet, treating as plain HTTP");
            rest
        } else {
            return Err(crate::ConfigError::InvalidOriginUrl(format!(
                "unsupported scheme in '{url}'"
            )));
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    crate::ConfigError::InvalidOriginUrl(format!("bad port in '{url}'"))
                })?;
                (host, port)
            }
            None => (authority, 80),
        };
        if host.is_empty() {
            return Err(crate::ConfigError::InvalidOriginUrl(format!(
                "empty host in '{url}'"
            )));
        }

        let mut path_prefix = path.to_string();
        if path_prefix.len() > 1 && path_prefix.ends_with('/') {
            path_prefix.pop();
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path_prefix,
            ..Self::default()
        })
    }
}

/// An origin's reply, header order preserved.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Forwards requests to one configured origin.
#[derive(Debug, Clone)]
pub struct OriginProxy {
    config: OriginConfig,
}

impl OriginProxy {
    pub fn new(config: OriginConfig) -> Self {
        info!(
            origin = %format!("{}:{}", config.host, config.port),
            prefix = %config.path_prefix,
            "origin proxy ready"
        );
        Self { config }
    }

    pub fn config(&self) -> &OriginConfig {
        &self.config
    }

    /// Forward `request` (with an optional already-buffered body) to the
    /// origin. Never fails: any error synthesizes a 502 response.
    pub async fn forward(&self, request: &ConnectRequest, body: &[u8]) -> OriginResponse {
        match self.try_forward(request, body).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "origin request failed");
                bad_gateway(&e.to_string())
            }
        }
    }

    async fn try_forward(
        &self,
        request: &ConnectRequest,
        body: &[u8],
    ) -> Result<OriginResponse, OriginError> {
        let method = request.method().unwrap_or("GET");
        let path = self.request_path(&request.dest);
        debug!(method, %path, body_len = body.len(), "forwarding to origin");

        let mut stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        .map_err(|_| OriginError::ConnectTimeout)?
        .map_err(OriginError::Connect)?;

        let head = self.request_head(method, &path, request, body);
        timeout(self.config.read_timeout, stream.write_all(&head))
            .await
            .map_err(|_| OriginError::ReadTimeout)??;
        if !body.is_empty() {
            timeout(self.config.read_timeout, stream.write_all(body))
                .await
                .map_err(|_| OriginError::ReadTimeout)??;
        }

        let response = self.read_response(&mut stream).await?;
        debug!(
            status = response.status,
            body_len = response.body.len(),
            "origin responded"
        );
        Ok(response)
    }

    /// `prefix + dest`, with an empty destination becoming `/`.
    fn request_path(&self, dest: &str) -> String {
        let dest = if dest.is_empty() { "/" } else { dest };
        if self.config.path_prefix.is_empty() || self.config.path_prefix == "/" {
            dest.to_string()
        } else {
            format!("{}{}", self.config.path_prefix, dest)
        }
    }

    /// Serialize the request line and headers. `Host` and `Connection` from
    /// the edge are dropped; the proxy sets its own, plus `Content-Length`
    /// when a body is present.
    fn request_head(
        &self,
        method: &str,
        path: &str,
        request: &ConnectRequest,
        body: &[u8],
    ) -> Vec<u8> {
        let mut head = String::with_capacity(256);
        head.push_str(&format!("{method} {path} HTTP/1.1\r\n"));
        head.push_str(&format!("Host: {}\r\n", self.config.host));
        head.push_str("Connection: close\r\n");

        for entry in &request.metadata {
            let Some(name) = entry.key.strip_prefix(HEADER_PREFIX) else {
                continue;
            };
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            head.push_str(&format!("{name}: {}\r\n", entry.val));
        }

        if !body.is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    /// Read and parse the origin's HTTP/1.1 response.
    async fn read_response(&self, stream: &mut TcpStream) -> Result<OriginResponse, OriginError> {
        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        let header_cap = self.config.max_body + 8192;

        // Accumulate until the header terminator.
        let header_end = loop {
            if let Some(pos) = find_header_end(&buf) {
                break pos;
            }
            if buf.len() > header_cap {
                return Err(OriginError::BadResponse("headers too large"));
            }
            let n = timeout(self.config.read_timeout, read_some(stream, &mut buf))
                .await
                .map_err(|_| OriginError::ReadTimeout)??;
            if n == 0 {
                return Err(OriginError::ClosedEarly);
            }
        };

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let header_len = match parsed
            .parse(&buf[..header_end])
            .map_err(|_| OriginError::BadResponse("unparseable head"))?
        {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Err(OriginError::BadResponse("truncated head")),
        };
        let status = parsed
            .code
            .ok_or(OriginError::BadResponse("missing status"))?;

        let mut content_length = None;
        let mut response_headers = Vec::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let value = String::from_utf8_lossy(header.value).trim_start().to_string();
            if header.name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<usize>().ok();
            }
            response_headers.push((header.name.to_string(), value));
        }

        let body = self
            .read_body(stream, buf.split_off(header_len), content_length)
            .await?;

        Ok(OriginResponse {
            status,
            headers: response_headers,
            body,
        })
    }

    /// Body semantics: with `Content-Length`, read exactly that many bytes
    /// or until close, capped; without, read until close, where a timeout
    /// after some bytes means end-of-body and a timeout with none is an
    /// error.
    async fn read_body(
        &self,
        stream: &mut TcpStream,
        mut body: Vec<u8>,
        content_length: Option<usize>,
    ) -> Result<Vec<u8>, OriginError> {
        match content_length {
            Some(length) => {
                if length > self.config.max_body {
                    return Err(OriginError::BodyTooLarge(self.config.max_body));
                }
                while body.len() < length {
                    let n = timeout(self.config.read_timeout, read_some(stream, &mut body))
                        .await
                        .map_err(|_| OriginError::ReadTimeout)??;
                    if n == 0 {
                        break;
                    }
                }
                body.truncate(length);
                Ok(body)
            }
            None => loop {
                if body.len() > self.config.max_body {
                    return Err(OriginError::BodyTooLarge(self.config.max_body));
                }
                match timeout(self.config.read_timeout, read_some(stream, &mut body)).await {
                    Ok(Ok(0)) => return Ok(body),
                    Ok(Ok(_)) => continue,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) if !body.is_empty() => {
                        debug!(received = body.len(), "treating read timeout as end of body");
                        return Ok(body);
                    }
                    Err(_) => return Err(OriginError::ReadTimeout),
                }
            },
        }
    }
}

async fn read_some(stream: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// The synthesized failure response.
fn bad_gateway(reason: &str) -> OriginResponse {
    OriginResponse {
        status: 502,
        headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
        body: format!("502 Bad Gateway: {reason}").into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argotun_proto::Metadata;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn request_with(metadata: Vec<Metadata>, dest: &str) -> ConnectRequest {
        ConnectRequest {
            dest: dest.to_string(),
            conn_type: 0,
            metadata,
        }
    }

    fn proxy_for(port: u16) -> OriginProxy {
        OriginProxy::new(OriginConfig {
            host: "127.0.0.1".to_string(),
            port,
            read_timeout: Duration::from_millis(500),
            ..OriginConfig::default()
        })
    }

    /// One-shot origin: capture the request, send a canned reply.
    async fn spawn_origin(reply: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                received.extend_from_slice(&chunk[..n]);
                if n == 0 || find_header_end(&received).is_some() {
                    // Drain whatever body the Content-Length promises.
                    let text = String::from_utf8_lossy(&received).to_string();
                    if let Some(cl) = text
                        .lines()
                        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
                        .and_then(|l| l.split(':').nth(1))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                    {
                        let header_len = find_header_end(&received).unwrap();
                        while received.len() - header_len < cl {
                            let n = socket.read(&mut chunk).await.unwrap();
                            if n == 0 {
                                break;
                            }
                            received.extend_from_slice(&chunk[..n]);
                        }
                    }
                    break;
                }
            }
            socket.write_all(reply).await.unwrap();
            socket.shutdown().await.unwrap();
            received
        });
        (port, handle)
    }

    #[tokio::test]
    async fn forwards_get_and_parses_response() {
        let (port, origin) = spawn_origin(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        let proxy = proxy_for(port);

        let request = request_with(
            vec![
                Metadata::new("HttpMethod", "GET"),
                Metadata::new("HttpHost", "x"),
                Metadata::new("HttpHeader:X-A", "1"),
            ],
            "/hello",
        );
        let response = proxy.forward(&request, b"").await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "text/plain"));

        let sent = String::from_utf8(origin.await.unwrap()).unwrap();
        assert!(sent.starts_with("GET /hello HTTP/1.1\r\n"));
        assert!(sent.contains("Host: 127.0.0.1\r\n"));
        assert!(sent.contains("Connection: close\r\n"));
        assert!(sent.contains("X-A: 1\r\n"));
    }

    #[tokio::test]
    async fn post_body_gets_content_length() {
        let (port, origin) =
            spawn_origin(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n").await;
        let proxy = proxy_for(port);

        let request = request_with(
            vec![
                Metadata::new("HttpMethod", "POST"),
                Metadata::new("HttpHost", "x"),
            ],
            "/submit",
        );
        let response = proxy.forward(&request, b"ping").await;
        assert_eq!(response.status, 204);

        let sent = String::from_utf8(origin.await.unwrap()).unwrap();
        assert!(sent.contains("Content-Length: 4\r\n"));
        assert!(sent.ends_with("\r\n\r\nping"));
    }

    #[tokio::test]
    async fn host_and_connection_headers_are_not_forwarded() {
        let (port, origin) =
            spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let proxy = proxy_for(port);

        let request = request_with(
            vec![
                Metadata::new("HttpHeader:Host", "evil.example"),
                Metadata::new("HttpHeader:Connection", "keep-alive"),
                Metadata::new("HttpHeader:X-Keep", "yes"),
            ],
            "/",
        );
        proxy.forward(&request, b"").await;

        let sent = String::from_utf8(origin.await.unwrap()).unwrap();
        assert!(!sent.contains("evil.example"));
        assert!(!sent.contains("keep-alive"));
        assert!(sent.contains("X-Keep: yes\r\n"));
        assert_eq!(sent.matches("Host:").count(), 1);
    }

    #[tokio::test]
    async fn method_defaults_to_get_and_empty_dest_to_root() {
        let (port, origin) =
            spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let proxy = proxy_for(port);

        proxy.forward(&request_with(vec![], ""), b"").await;
        let sent = String::from_utf8(origin.await.unwrap()).unwrap();
        assert!(sent.starts_with("GET / HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn unreachable_origin_becomes_502() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let proxy = proxy_for(port);
        let response = proxy.forward(&request_with(vec![], "/x"), b"").await;

        assert_eq!(response.status, 502);
        assert!(response.body.starts_with(b"502 Bad Gateway: "));
        assert_eq!(
            response.headers,
            vec![("Content-Type".to_string(), "text/plain".to_string())]
        );
    }

    #[tokio::test]
    async fn body_without_content_length_reads_until_close() {
        let (port, _origin) =
            spawn_origin(b"HTTP/1.1 200 OK\r\nX-Mode: stream\r\n\r\nstreamed body").await;
        let proxy = proxy_for(port);

        let response = proxy.forward(&request_with(vec![], "/"), b"").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"streamed body");
    }

    #[test]
    fn origin_url_parsing() {
        let config = OriginConfig::from_url("http://localhost:8080").unwrap();
        assert_eq!((config.host.as_str(), config.port), ("localhost", 8080));
        assert_eq!(config.path_prefix, "");

        let config = OriginConfig::from_url("http://app.internal/api/").unwrap();
        assert_eq!((config.host.as_str(), config.port), ("app.internal", 80));
        assert_eq!(config.path_prefix, "/api");

        let config = OriginConfig::from_url("https://secure:9443/").unwrap();
        assert_eq!((config.host.as_str(), config.port), ("secure", 9443));
        assert_eq!(config.path_prefix, "/");

        assert!(OriginConfig::from_url("ftp://nope").is_err());
        assert!(OriginConfig::from_url("http://host:notaport").is_err());
    }

    #[test]
    fn path_prefix_joining() {
        let mut config = OriginConfig::default();
        config.path_prefix = "/api".to_string();
        let proxy = OriginProxy::new(config);
        assert_eq!(proxy.request_path("/hello"), "/api/hello");
        assert_eq!(proxy.request_path(""), "/api/");

        let mut config = OriginConfig::default();
        config.path_prefix = "/".to_string();
        let proxy = OriginProxy::new(config);
        assert_eq!(proxy.request_path("/hello"), "/hello");
    }
}
