//! A small JSON-over-HTTP transport.
//!
//! [HttpClient::get] builds an [HttpCall], a callback-style request that
//! implements [AsyncCall]. Enqueuing it performs a blocking HTTP/1.1 `GET` on
//! a worker thread and fires the callback from there, which is exactly the
//! kind of "result arrives on some other thread" source the driver expects.
//!
//! Only plain `http://` base URLs are supported. Responses may be framed by
//! `Content-Length`, by chunked transfer encoding, or by connection close.
//! Successful bodies are decoded with `serde_json`; an empty body or a JSON
//! `null` counts as no payload. I/O and decoding errors are reported through
//! [Callback::on_failure].
use std::{
    fmt,
    io::{self, Read, Write},
    marker::PhantomData,
    net::TcpStream,
    sync::Arc,
    thread,
};

use log::debug;
use serde::de::DeserializeOwned;

use crate::futures::call::{AsyncCall, Callback, Response};

/// Hook invoked with the request path and response status of every exchange.
pub type Interceptor = Arc<dyn Fn(&str, u16) + Send + Sync>;

fn invalid_input(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn truncated(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("truncated {what}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BaseUrl {
    host: String,
    port: u16,
    prefix: String,
}

impl BaseUrl {
    fn parse(url: &str) -> io::Result<Self> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| invalid_input(format!("unsupported base URL {url:?}: expected http://")))?;

        let (authority, prefix) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
            None => (rest, ""),
        };

        let parse_port = |port: &str| {
            port.parse::<u16>()
                .map_err(|_| invalid_input(format!("invalid port in base URL {url:?}")))
        };

        // IPv6 literals are bracketed: `[::1]:8080`.
        let (host, port) = match authority.strip_prefix('[') {
            Some(literal) => {
                let (host, rest) = literal
                    .split_once(']')
                    .ok_or_else(|| invalid_input(format!("unterminated IPv6 host in base URL {url:?}")))?;

                match rest.strip_prefix(':') {
                    Some(port) => (host, parse_port(port)?),
                    None if rest.is_empty() => (host, 80),
                    None => return Err(invalid_input(format!("invalid port in base URL {url:?}"))),
                }
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (authority, 80),
            },
        };

        if host.is_empty() {
            return Err(invalid_input(format!("missing host in base URL {url:?}")));
        }

        Ok(Self {
            host: host.to_owned(),
            port,
            prefix: prefix.to_owned(),
        })
    }

    fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        if self.port == 80 {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

struct RawResponse {
    status: u16,
    reason: String,
    body: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_response(buf: &[u8]) -> io::Result<RawResponse> {
    let split = find(buf, b"\r\n\r\n").ok_or_else(|| truncated("response header"))?;
    let head =
        std::str::from_utf8(&buf[..split]).map_err(|_| invalid_data("non UTF-8 response header"))?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');

    if !parts.next().unwrap_or_default().starts_with("HTTP/1.") {
        return Err(invalid_data(format!("bad status line {status_line:?}")));
    }

    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| invalid_data(format!("bad status line {status_line:?}")))?;
    let reason = parts.next().unwrap_or_default().to_owned();

    let mut content_length = None;
    let mut chunked = false;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(
                value
                    .parse::<usize>()
                    .map_err(|_| invalid_data(format!("bad Content-Length {value:?}")))?,
            );
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.to_ascii_lowercase().contains("chunked");
        }
    }

    let rest = &buf[split + 4..];

    let body = if chunked {
        decode_chunked(rest)?
    } else if let Some(len) = content_length {
        if rest.len() < len {
            return Err(truncated("response body"));
        }
        rest[..len].to_vec()
    } else {
        rest.to_vec()
    };

    Ok(RawResponse {
        status,
        reason,
        body,
    })
}

fn decode_chunked(mut data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();

    loop {
        let line_end = find(data, b"\r\n").ok_or_else(|| truncated("chunk size"))?;
        let line =
            std::str::from_utf8(&data[..line_end]).map_err(|_| invalid_data("bad chunk size"))?;
        let digits = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(digits, 16)
            .map_err(|_| invalid_data(format!("bad chunk size {digits:?}")))?;

        data = &data[line_end + 2..];

        if size == 0 {
            return Ok(out);
        }

        let framed = size
            .checked_add(2)
            .ok_or_else(|| invalid_data(format!("chunk size {digits:?} out of range")))?;

        if data.len() < framed {
            return Err(truncated("chunk"));
        }

        out.extend_from_slice(&data[..size]);
        data = &data[framed..];
    }
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> io::Result<Option<T>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_json::from_slice::<Option<T>>(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Configuration for an [HttpClient].
pub struct ClientBuilder {
    base_url: String,
    user_agent: String,
    interceptors: Vec<Interceptor>,
}

impl ClientBuilder {
    /// Add a hook called with `(path, status)` after every exchange.
    pub fn interceptor(mut self, f: impl Fn(&str, u16) + Send + Sync + 'static) -> Self {
        self.interceptors.push(Arc::new(f));
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Validate the base URL and build the client.
    pub fn build(self) -> io::Result<HttpClient> {
        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                base: BaseUrl::parse(&self.base_url)?,
                user_agent: self.user_agent,
                interceptors: self.interceptors,
            }),
        })
    }
}

struct ClientInner {
    base: BaseUrl,
    user_agent: String,
    interceptors: Vec<Interceptor>,
}

/// A cheaply cloneable HTTP client bound to one base URL.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("base", &self.inner.base)
            .field("user_agent", &self.inner.user_agent)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            base_url: base_url.into(),
            user_agent: concat!("tether/", env!("CARGO_PKG_VERSION")).to_owned(),
            interceptors: Vec::new(),
        }
    }

    /// Prepare a `GET` of `path`, relative to the base URL, decoding the body
    /// as `T`.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> HttpCall<T> {
        HttpCall {
            client: self.clone(),
            path: path.to_owned(),
            _marker: PhantomData,
        }
    }

    fn exchange(&self, path: &str) -> io::Result<RawResponse> {
        let base = &self.inner.base;
        let target = format!("{}{}", base.prefix, path);

        let mut stream = TcpStream::connect((base.host.as_str(), base.port))?;

        let request = format!(
            "GET {target} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
            base.host_header(),
            self.inner.user_agent,
        );
        stream.write_all(request.as_bytes())?;

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;

        let response = parse_response(&buf)?;

        debug!("GET {target} -> {} {}", response.status, response.reason);

        for interceptor in &self.inner.interceptors {
            interceptor(&target, response.status);
        }

        Ok(response)
    }
}

/// A prepared request; see [HttpClient::get].
pub struct HttpCall<T> {
    client: HttpClient,
    path: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> HttpCall<T> {
    /// Perform the exchange on the calling thread.
    pub fn execute(&self) -> io::Result<Response<T>> {
        let raw = self.client.exchange(&self.path)?;

        let body = if (200..300).contains(&raw.status) {
            decode_body(&raw.body)?
        } else {
            None
        };

        Ok(Response::new(raw.status, raw.reason, body))
    }
}

impl<T> AsyncCall<T> for HttpCall<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn enqueue(self, callback: Callback<T>) {
        let worker = {
            let callback = callback.clone();

            thread::Builder::new()
                .name("tether-http".to_owned())
                .spawn(move || {
                    let delivered = match self.execute() {
                        Ok(response) => callback.on_response(response),
                        Err(e) => callback.on_failure(e),
                    };

                    if let Err(e) = delivered {
                        debug!("GET {}: {e}", self.path);
                    }
                })
        };

        if let Err(e) = worker {
            let _ = callback.on_failure(e);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread::{self, JoinHandle},
    };

    use super::find;

    /// Accept one connection, answer it with `response`, and return the raw
    /// request that was received.
    pub(crate) fn serve_once(response: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];

            while find(&request, b"\r\n\r\n").is_none() {
                let n = conn.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            conn.write_all(response.as_bytes()).unwrap();

            String::from_utf8(request).unwrap()
        });

        (format!("http://{addr}"), server)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        net::TcpListener,
        sync::{Arc, Mutex},
    };

    use anyhow::Result;
    use serde::Deserialize;

    use super::{parse_response, test_server::serve_once, BaseUrl, HttpClient};
    use crate::{
        dispatch::Looper,
        task::{Executor, ResumptionContext},
        Error,
    };

    #[derive(Debug, PartialEq, Deserialize)]
    struct Count {
        n: u32,
    }

    #[test]
    fn base_url_parts() -> Result<()> {
        assert_eq!(
            BaseUrl::parse("http://localhost:8080/api/")?,
            BaseUrl {
                host: "localhost".into(),
                port: 8080,
                prefix: "/api".into(),
            }
        );

        let plain = BaseUrl::parse("http://example.com")?;
        assert_eq!((plain.port, plain.prefix.as_str()), (80, ""));
        assert_eq!(plain.host_header(), "example.com");

        let err = BaseUrl::parse("https://api.github.com").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(BaseUrl::parse("http://:80").is_err());
        assert!(BaseUrl::parse("http://host:http").is_err());

        Ok(())
    }

    #[test]
    fn ipv6_base_url() -> Result<()> {
        let v6 = BaseUrl::parse("http://[::1]:8080/api")?;
        assert_eq!((v6.host.as_str(), v6.port, v6.prefix.as_str()), ("::1", 8080, "/api"));
        assert_eq!(v6.host_header(), "[::1]:8080");

        let default_port = BaseUrl::parse("http://[::1]")?;
        assert_eq!((default_port.port, default_port.host_header().as_str()), (80, "[::1]"));

        assert!(BaseUrl::parse("http://[::1").is_err());
        assert!(BaseUrl::parse("http://[::1]8080").is_err());

        Ok(())
    }

    #[test]
    fn chunked_body() -> Result<()> {
        let raw = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n{\"n\"\r\n4;ext=1\r\n: 9}\r\n0\r\n\r\n",
        )?;

        assert_eq!(raw.status, 200);
        assert_eq!(raw.body, b"{\"n\": 9}");

        Ok(())
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let overflow = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nFFFFFFFFFFFFFFFF\r\n{}\r\n0\r\n\r\n",
        );
        assert_eq!(overflow.err().map(|e| e.kind()), Some(io::ErrorKind::InvalidData));

        let short = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n7FFFFFFF\r\n{}\r\n0\r\n\r\n",
        );
        assert_eq!(short.err().map(|e| e.kind()), Some(io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn content_length_truncates_and_checks() -> Result<()> {
        let raw = parse_response(b"HTTP/1.1 201 Created\r\ncontent-length: 2\r\n\r\n{}trailing")?;
        assert_eq!((raw.status, raw.reason.as_str()), (201, "Created"));
        assert_eq!(raw.body, b"{}");

        let short = parse_response(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n{}");
        assert_eq!(short.err().map(|e| e.kind()), Some(io::ErrorKind::UnexpectedEof));

        assert!(parse_response(b"SMTP ready\r\n\r\n").is_err());

        Ok(())
    }

    #[test]
    fn execute_decodes_json() -> Result<()> {
        let (base, server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\n{\"n\": 3}");
        let client = HttpClient::builder(base).user_agent("tests").build()?;

        let response = client.get::<Count>("/count").execute()?;
        let request = server.join().unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, Some(Count { n: 3 }));
        assert!(request.starts_with("GET /count HTTP/1.1\r\n"));
        assert!(request.contains("User-Agent: tests\r\n"));
        assert!(request.contains("Host: 127.0.0.1:"));

        Ok(())
    }

    #[test]
    fn error_status_skips_decoding() -> Result<()> {
        let (base, server) =
            serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot json!");
        let client = HttpClient::builder(base).build()?;

        let response = client.get::<Count>("/missing").execute()?;
        server.join().unwrap();

        assert_eq!((response.status, response.message.as_str()), (404, "Not Found"));
        assert_eq!(response.body, None);

        Ok(())
    }

    #[test]
    fn malformed_json_is_invalid_data() -> Result<()> {
        let (base, server) = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nnope");
        let client = HttpClient::builder(base).build()?;

        let err = client.get::<Count>("/count").execute().unwrap_err();
        server.join().unwrap();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        Ok(())
    }

    #[test]
    fn interceptor_sees_every_exchange() -> Result<()> {
        let (base, server) =
            serve_once("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let client = {
            let seen = seen.clone();
            HttpClient::builder(format!("{base}/v1"))
                .interceptor(move |path, status| seen.lock().unwrap().push((path.to_owned(), status)))
                .build()?
        };

        client.get::<Count>("/health").execute()?;
        server.join().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("/v1/health".to_owned(), 503)]);

        Ok(())
    }

    #[test]
    fn awaited_through_executor() -> Result<()> {
        let (base, server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n{\"n\": 11}");
        let client = HttpClient::builder(base).build()?;

        let (looper, handler) = Looper::new();
        let executor = Executor::new();

        let task = executor.run_async(ResumptionContext::new(handler), move |scope| async move {
            scope.await_call(|| client.get::<Count>("/count")).await
        });

        looper.run();
        server.join().unwrap();

        assert_eq!(task.join()?, Count { n: 11 });

        Ok(())
    }

    #[test]
    fn empty_body_is_empty_result() -> Result<()> {
        let (base, server) = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nnull");
        let client = HttpClient::builder(base).build()?;

        let (looper, handler) = Looper::new();
        let executor = Executor::new();

        let task = executor.run_async(ResumptionContext::new(handler), move |scope| async move {
            scope.await_call(|| client.get::<Count>("/count")).await
        });

        looper.run();
        server.join().unwrap();

        assert!(matches!(task.join(), Err(Error::EmptyResult)));

        Ok(())
    }

    #[test]
    fn bad_framing_fails_computation() -> Result<()> {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nFFFFFFFFFFFFFFFF\r\n{}\r\n0\r\n\r\n",
        );
        let client = HttpClient::builder(base).build()?;

        let (looper, handler) = Looper::new();
        let executor = Executor::new();

        let task = executor.run_async(ResumptionContext::new(handler), move |scope| async move {
            scope.await_call(|| client.get::<Count>("/count")).await
        });

        looper.run();
        server.join().unwrap();

        match task.join() {
            Err(Error::TransportFailure(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
            other => panic!("expected a transport failure, got {other:?}"),
        }
        assert!(executor.is_idle());

        Ok(())
    }

    #[test]
    fn refused_connection_is_transport_failure() -> Result<()> {
        let addr = TcpListener::bind("127.0.0.1:0")?.local_addr()?;
        let client = HttpClient::builder(format!("http://{addr}")).build()?;

        let (looper, handler) = Looper::new();
        let executor = Executor::new();

        let task = executor.run_async(ResumptionContext::new(handler), move |scope| async move {
            scope.await_call(|| client.get::<Count>("/count")).await
        });

        looper.run();

        assert!(matches!(task.join(), Err(Error::TransportFailure(_))));

        Ok(())
    }
}
