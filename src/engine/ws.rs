use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::stream::{Channel, Connector};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_PATH: &str = "/ws/status";

/// Derive `ws(s)://<host>/ws/status` from the HTTP API base URL.
pub fn status_url_from_api(api_url: &str) -> Result<String> {
    let trimmed = api_url.trim().trim_end_matches('/');
    let rest = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        bail!("API URL must start with http:// or https://, got '{api_url}'");
    };
    Ok(format!("{rest}{STATUS_PATH}"))
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    type Channel = WsChannel;

    fn connect(&self) -> BoxFuture<'static, Result<WsChannel>> {
        let url = self.url.clone();
        async move {
            let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
                .await
                .map_err(|_| anyhow!("timed out connecting to {url}"))?
                .with_context(|| format!("could not connect to {url}"))?;
            Ok(WsChannel { stream })
        }
        .boxed()
    }
}

pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

enum Frame {
    Payload(String),
    Close,
    Skip,
}

fn classify(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Payload(text.to_string()),
        // Invalid UTF-8 turns into replacement characters, which the message
        // parser then drops as malformed. The connection stays up.
        Message::Binary(bytes) => Frame::Payload(String::from_utf8_lossy(&bytes).into_owned()),
        Message::Close(_) => Frame::Close,
        // Protocol-level ping/pong frames are answered by tungstenite.
        _ => Frame::Skip,
    }
}

impl Channel for WsChannel {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(message) => match classify(message) {
                    Frame::Payload(text) => return Some(Ok(text)),
                    Frame::Close => return None,
                    Frame::Skip => continue,
                },
                Err(err) => return Some(Err(anyhow!(err).context("status channel read failed"))),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .context("status channel write failed")
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
