use std::fmt;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::StatusCode;
use tungstenite::error::ProtocolError;
use tungstenite::protocol::WebSocketConfig;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::client::connect_with_config;
use tungstenite::{Message as WsMessage, WebSocket};
use url::Url;

use crate::config::{ServerConfig, TransportKind};
use crate::encoder::{UploadPayload, WirePayload};
use crate::reply::{decode_json_reply, decode_reply, RawReply};

const ERROR_BODY_MAX_CHARS: usize = 512;
const WEBSOCKET_MAX_REDIRECTS: u8 = 3;
const STREAMING_POLL_INTERVAL: Duration = Duration::from_millis(250);
const STREAMING_WAIT_NOTICE_SECONDS: u64 = 30;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExchangeErrorKind {
    /// The server is unreachable or the channel is gone; no later item can succeed.
    Connection,
    /// This item failed; the channel is still usable.
    Item,
}

#[derive(Debug)]
pub struct ExchangeError {
    kind: ExchangeErrorKind,
    message: String,
}

impl ExchangeError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: ExchangeErrorKind::Connection,
            message: message.into(),
        }
    }

    pub fn item(message: impl Into<String>) -> Self {
        Self {
            kind: ExchangeErrorKind::Item,
            message: message.into(),
        }
    }

    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let message = error_chain_message(&err);
        if is_anyhow_connection_error(&err) {
            Self::connection(message)
        } else {
            Self::item(message)
        }
    }

    pub fn from_tungstenite(prefix: &str, err: tungstenite::Error) -> Self {
        let message = format!("{prefix}: {err}");
        if is_tungstenite_connection_error(&err) {
            Self::connection(message)
        } else {
            Self::item(message)
        }
    }

    /// Timeouts stay per-item: a slow answer says nothing about the next request.
    pub fn from_reqwest(prefix: &str, err: reqwest::Error) -> Self {
        let message = format!("{prefix}: {err}");
        if err.is_connect() {
            Self::connection(message)
        } else {
            Self::item(message)
        }
    }

    pub fn kind(&self) -> ExchangeErrorKind {
        self.kind
    }

    pub fn is_connection(&self) -> bool {
        self.kind == ExchangeErrorKind::Connection
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn into_connection(self) -> Self {
        Self::connection(self.message)
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExchangeError {}

/// What a channel hands back for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerReply {
    /// Decoded streaming frame.
    Tree(RawReply),
    /// Raw unary response body (npz archive or encoded image).
    Body(Vec<u8>),
}

/// An open connection to the segmentation server. Strict request/reply
/// alternation: one `exchange` completes before the next starts.
pub trait Channel {
    fn kind(&self) -> TransportKind;
    fn exchange(&mut self, payload: WirePayload) -> Result<ServerReply, ExchangeError>;
    fn close(&mut self);
}

/// Opens channels. The batch driver calls `open` at most once per run, and only
/// when it reaches an item that still needs work.
pub trait Connector {
    fn kind(&self) -> TransportKind;
    fn endpoint(&self) -> String;
    fn open(&self) -> Result<Box<dyn Channel>, ExchangeError>;
}

pub struct ServerConnector {
    config: ServerConfig,
    stop: Option<Arc<AtomicBool>>,
}

impl ServerConnector {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, stop: None }
    }

    /// Streaming channels opened by this connector give up waiting for a reply
    /// once `stop` is set.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }
}

impl Connector for ServerConnector {
    fn kind(&self) -> TransportKind {
        self.config.kind
    }

    fn endpoint(&self) -> String {
        self.config.url.to_string()
    }

    fn open(&self) -> Result<Box<dyn Channel>, ExchangeError> {
        match self.config.kind {
            TransportKind::Streaming => {
                let mut channel = StreamingChannel::open(&self.config.url)?;
                if let Some(stop) = &self.stop {
                    channel = channel.with_stop_flag(stop.clone());
                }
                Ok(Box::new(channel))
            }
            TransportKind::Unary => Ok(Box::new(UnaryChannel::open(&self.config)?)),
        }
    }
}

/// Persistent websocket carrying MessagePack frames. There is no reply
/// deadline: reads poll on a short socket timeout so an interrupt can end the
/// wait, and a slow server only produces periodic warnings.
pub struct StreamingChannel {
    ws: WebSocket<MaybeTlsStream<TcpStream>>,
    closed: bool,
    stop: Option<Arc<AtomicBool>>,
}

impl StreamingChannel {
    pub fn open(url: &Url) -> Result<Self, ExchangeError> {
        let config = WebSocketConfig::default()
            .max_message_size(None)
            .max_frame_size(None);
        let (ws, _) = connect_with_config(url.as_str(), Some(config), WEBSOCKET_MAX_REDIRECTS)
            .map_err(|err| {
                ExchangeError::from_tungstenite(&format!("failed to connect to {url}"), err)
                    .into_connection()
            })?;
        tracing::info!(%url, "streaming channel connected");
        let mut channel = Self {
            ws,
            closed: false,
            stop: None,
        };
        set_socket_read_timeout(&mut channel.ws, Some(STREAMING_POLL_INTERVAL));
        Ok(channel)
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map(|stop| stop.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn read_reply(&mut self) -> Result<RawReply, ExchangeError> {
        let started = Instant::now();
        let mut notices = 0u64;
        loop {
            let message = match self.ws.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    if self.stop_requested() {
                        return Err(ExchangeError::connection(
                            "interrupted while waiting for server reply",
                        ));
                    }
                    let waited = started.elapsed().as_secs();
                    if waited / STREAMING_WAIT_NOTICE_SECONDS > notices {
                        notices = waited / STREAMING_WAIT_NOTICE_SECONDS;
                        tracing::warn!(waited_s = waited, "still waiting for server reply");
                    }
                    continue;
                }
                Err(err) => {
                    return Err(ExchangeError::from_tungstenite("streaming read failed", err));
                }
            };
            match message {
                WsMessage::Binary(bytes) => {
                    return decode_reply(&bytes).map_err(ExchangeError::from_anyhow);
                }
                WsMessage::Text(text) => {
                    return decode_json_reply(text.as_str()).map_err(ExchangeError::from_anyhow);
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                WsMessage::Close(_) => {
                    self.closed = true;
                    return Err(ExchangeError::connection("server closed the streaming channel"));
                }
            }
        }
    }
}

impl Channel for StreamingChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    fn exchange(&mut self, payload: WirePayload) -> Result<ServerReply, ExchangeError> {
        if self.closed {
            return Err(ExchangeError::connection("streaming channel already closed"));
        }
        let WirePayload::Packed(frame) = payload else {
            return Err(ExchangeError::item(
                "streaming channel cannot carry an upload payload",
            ));
        };
        self.ws
            .send(WsMessage::binary(frame))
            .map_err(|err| ExchangeError::from_tungstenite("streaming send failed", err))?;
        self.read_reply().map(ServerReply::Tree)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.ws.close(None);
        let _ = self.ws.flush();
    }
}

/// One multipart POST per item over a reused HTTP client.
pub struct UnaryChannel {
    http: HttpClient,
    endpoint: Url,
}

impl UnaryChannel {
    pub fn open(config: &ServerConfig) -> Result<Self, ExchangeError> {
        let http = HttpClient::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|err| {
                ExchangeError::from_reqwest("failed to build http client", err).into_connection()
            })?;
        Ok(Self {
            http,
            endpoint: config.url.clone(),
        })
    }

    fn post(&self, upload: UploadPayload) -> Result<Vec<u8>, ExchangeError> {
        let part = MultipartPart::bytes(upload.bytes)
            .file_name(upload.file_name.clone())
            .mime_str(upload.mime)
            .map_err(|err| ExchangeError::from_reqwest("invalid upload mime type", err))?;
        let form = MultipartForm::new()
            .part("image", part)
            .text("mode", upload.mode);
        let response = self
            .http
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .map_err(|err| {
                ExchangeError::from_reqwest(&format!("request to {} failed", self.endpoint), err)
            })?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().unwrap_or_default();
            return Err(ExchangeError::item(format!(
                "server error {} for {}: {}",
                status.as_u16(),
                upload.file_name,
                truncate_text(&body, ERROR_BODY_MAX_CHARS)
            )));
        }
        let body = response
            .bytes()
            .map_err(|err| ExchangeError::from_reqwest("failed reading response body", err))?;
        Ok(body.to_vec())
    }
}

impl Channel for UnaryChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Unary
    }

    fn exchange(&mut self, payload: WirePayload) -> Result<ServerReply, ExchangeError> {
        let WirePayload::Upload(upload) = payload else {
            return Err(ExchangeError::item(
                "unary channel needs an upload payload, got a packed frame",
            ));
        };
        self.post(upload).map(ServerReply::Body)
    }

    fn close(&mut self) {}
}

fn set_socket_read_timeout(
    ws: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Option<Duration>,
) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

fn is_anyhow_connection_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<tungstenite::Error>()
            .map(is_tungstenite_connection_error)
            .unwrap_or(false)
            || cause
                .downcast_ref::<reqwest::Error>()
                .map(reqwest::Error::is_connect)
                .unwrap_or(false)
            || cause
                .downcast_ref::<io::Error>()
                .map(|io_err| is_connection_io_error_kind(io_err.kind()))
                .unwrap_or(false)
    })
}

fn is_tungstenite_connection_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Io(io_err) => is_connection_io_error_kind(io_err.kind()),
        tungstenite::Error::Tls(_) => true,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        _ => false,
    }
}

fn is_connection_io_error_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
    )
}

pub fn error_chain_message(err: &anyhow::Error) -> String {
    err.chain()
        .map(|entry| entry.to_string())
        .filter(|entry| !entry.trim().is_empty())
        .collect::<Vec<String>>()
        .join(": ")
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::io::{self, BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use rmpv::Value as PackValue;
    use tungstenite::{accept, Message as WsMessage};

    use super::{
        error_chain_message, ExchangeError, ExchangeErrorKind, ServerConnector, ServerReply,
        StreamingChannel,
    };
    use crate::config::{RequestOptions, ServerConfig};
    use crate::encoder::{UploadPayload, WirePayload};
    use crate::reply::RawReply;
    use crate::transport::{Channel, Connector};

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn pack(value: &PackValue) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    /// Replies to each binary frame with `{"type": "result", "echo": <request text>}`.
    fn spawn_echo_server(replies: usize) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = accept(stream).unwrap();
            for _ in 0..replies {
                let request = match ws.read() {
                    Ok(WsMessage::Binary(bytes)) => rmpv::decode::read_value(&mut &bytes[..]).unwrap(),
                    _ => return,
                };
                let text = request
                    .as_map()
                    .and_then(|entries| {
                        entries
                            .iter()
                            .find(|(key, _)| key.as_str() == Some("text"))
                            .map(|(_, value)| value.clone())
                    })
                    .unwrap_or(PackValue::Nil);
                let reply = PackValue::Map(vec![
                    (PackValue::from("type"), PackValue::from("result")),
                    (PackValue::from("echo"), text),
                ]);
                ws.send(WsMessage::binary(pack(&reply))).unwrap();
            }
            let _ = ws.close(None);
            let _ = ws.flush();
        });
        (port, handle)
    }

    #[test]
    fn streaming_exchange_alternates_request_and_reply() -> anyhow::Result<()> {
        let (port, server) = spawn_echo_server(2);
        let url = url::Url::parse(&format!("ws://127.0.0.1:{port}"))?;
        let mut channel = StreamingChannel::open(&url)?;

        for prompt in ["brush", "bristles"] {
            let request = maskrelay_contracts::items::WireRequest {
                kind: "video".to_string(),
                resource_path: "/data/000.png".to_string(),
                text: prompt.to_string(),
                frame_index: 0,
                confidence: None,
            };
            let frame = rmp_serde::to_vec_named(&request)?;
            let ServerReply::Tree(reply) = channel.exchange(WirePayload::Packed(frame))? else {
                panic!("expected a decoded tree");
            };
            assert_eq!(reply.get("echo"), Some(&RawReply::Text(prompt.to_string())));
        }
        channel.close();
        server.join().unwrap();
        Ok(())
    }

    #[test]
    fn streaming_close_from_server_is_a_connection_failure() -> anyhow::Result<()> {
        let (port, server) = spawn_echo_server(0);
        let url = url::Url::parse(&format!("ws://127.0.0.1:{port}"))?;
        let mut channel = StreamingChannel::open(&url)?;
        server.join().unwrap();

        let err = channel
            .exchange(WirePayload::Packed(pack(&PackValue::Nil)))
            .unwrap_err();
        assert_eq!(err.kind(), ExchangeErrorKind::Connection);
        Ok(())
    }

    #[test]
    fn slow_reply_outlasting_the_poll_interval_still_arrives() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = accept(stream).unwrap();
            if let Ok(WsMessage::Binary(_)) = ws.read() {
                thread::sleep(Duration::from_millis(900));
                let reply = PackValue::Map(vec![(PackValue::from("mask"), PackValue::Nil)]);
                ws.send(WsMessage::binary(pack(&reply))).unwrap();
            }
            while ws.read().is_ok() {}
        });

        let url = url::Url::parse(&format!("ws://127.0.0.1:{port}"))?;
        let mut channel = StreamingChannel::open(&url)?;
        let reply = channel.exchange(WirePayload::Packed(pack(&PackValue::Nil)))?;
        assert!(matches!(reply, ServerReply::Tree(RawReply::Mapping(_))));
        channel.close();
        server.join().unwrap();
        Ok(())
    }

    #[test]
    fn stop_flag_interrupts_a_pending_streaming_read() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = accept(stream).unwrap();
            while ws.read().is_ok() {}
        });

        let stop = Arc::new(AtomicBool::new(false));
        let config = ServerConfig::parse(&format!("ws://127.0.0.1:{port}"), RequestOptions::default())?;
        let mut channel = ServerConnector::new(config)
            .with_stop_flag(stop.clone())
            .open()?;
        let trigger = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                stop.store(true, Ordering::SeqCst);
            })
        };

        let started = Instant::now();
        let err = channel
            .exchange(WirePayload::Packed(pack(&PackValue::Nil)))
            .unwrap_err();
        trigger.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.is_connection());
        assert!(err.message().contains("interrupted"));
        channel.close();
        server.join().unwrap();
        Ok(())
    }

    #[test]
    fn refused_streaming_connection_is_a_connection_failure() -> anyhow::Result<()> {
        let port = free_port();
        let config = ServerConfig::parse(&format!("ws://127.0.0.1:{port}"), RequestOptions::default())?;
        let err = ServerConnector::new(config).open().err().unwrap();
        assert!(err.is_connection(), "unexpected error: {err}");
        Ok(())
    }

    #[test]
    fn refused_unary_request_is_a_connection_failure() -> anyhow::Result<()> {
        let port = free_port();
        let config =
            ServerConfig::parse(&format!("http://127.0.0.1:{port}/predict"), RequestOptions::default())?;
        let mut channel = ServerConnector::new(config).open()?;
        let err = channel
            .exchange(WirePayload::Upload(UploadPayload {
                file_name: "000.png".to_string(),
                mime: "image/png",
                bytes: vec![1, 2, 3],
                mode: "everything".to_string(),
            }))
            .unwrap_err();
        assert!(err.is_connection(), "unexpected error: {err}");
        Ok(())
    }

    /// Minimal HTTP/1.1 responder: reads one request, answers with `status` and `body`.
    fn spawn_http_server(status: &'static str, body: Vec<u8>) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let request = read_http_request(&stream).unwrap();
            let mut stream = stream;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(&body).unwrap();
            stream.flush().unwrap();
            request
        });
        (port, handle)
    }

    fn read_http_request(stream: &TcpStream) -> io::Result<String> {
        let mut reader = BufReader::new(stream);
        let mut head = String::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line)?;
            if line == "\r\n" || line.is_empty() {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap_or(0);
            }
            head.push_str(&line);
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;
        Ok(format!("{head}\r\n{}", String::from_utf8_lossy(&body)))
    }

    #[test]
    fn unary_exchange_posts_multipart_and_returns_body() -> anyhow::Result<()> {
        let (port, server) = spawn_http_server("200 OK", b"mask-bytes".to_vec());
        let config =
            ServerConfig::parse(&format!("http://127.0.0.1:{port}/predict"), RequestOptions::default())?;
        let mut channel = ServerConnector::new(config).open()?;
        let reply = channel.exchange(WirePayload::Upload(UploadPayload {
            file_name: "000007.png".to_string(),
            mime: "image/png",
            bytes: b"png-bytes".to_vec(),
            mode: "everything".to_string(),
        }))?;
        assert_eq!(reply, ServerReply::Body(b"mask-bytes".to_vec()));

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /predict"));
        assert!(request.contains("name=\"image\"; filename=\"000007.png\""));
        assert!(request.contains("name=\"mode\""));
        assert!(request.contains("everything"));
        assert!(request.contains("png-bytes"));
        Ok(())
    }

    #[test]
    fn unary_non_200_is_an_item_failure() -> anyhow::Result<()> {
        let (port, server) = spawn_http_server("500 Internal Server Error", b"model crashed".to_vec());
        let config =
            ServerConfig::parse(&format!("http://127.0.0.1:{port}/predict"), RequestOptions::default())?;
        let mut channel = ServerConnector::new(config).open()?;
        let err = channel
            .exchange(WirePayload::Upload(UploadPayload {
                file_name: "000.png".to_string(),
                mime: "image/png",
                bytes: vec![0],
                mode: "everything".to_string(),
            }))
            .unwrap_err();
        server.join().unwrap();
        assert_eq!(err.kind(), ExchangeErrorKind::Item);
        assert!(err.message().contains("server error 500"));
        assert!(err.message().contains("model crashed"));
        Ok(())
    }

    #[test]
    fn mismatched_payload_is_an_item_failure() -> anyhow::Result<()> {
        let config = ServerConfig::parse("http://127.0.0.1:9/predict", RequestOptions::default())?;
        let mut channel = ServerConnector::new(config).open()?;
        let err = channel.exchange(WirePayload::Packed(vec![0xc0])).unwrap_err();
        assert_eq!(err.kind(), ExchangeErrorKind::Item);
        Ok(())
    }

    #[test]
    fn connection_classification_walks_the_error_chain() {
        let broken_pipe = anyhow::Error::new(tungstenite::Error::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "broken pipe",
        )));
        assert!(ExchangeError::from_anyhow(broken_pipe).is_connection());

        let refused = anyhow::Error::new(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            .context("opening channel");
        let typed = ExchangeError::from_anyhow(refused);
        assert!(typed.is_connection());
        assert_eq!(typed.message(), "opening channel: refused");

        let malformed = anyhow::anyhow!("reply is not valid MessagePack");
        assert_eq!(
            ExchangeError::from_anyhow(malformed).kind(),
            ExchangeErrorKind::Item
        );
        assert_eq!(
            error_chain_message(&anyhow::anyhow!("inner").context("outer")),
            "outer: inner"
        );
    }
}
