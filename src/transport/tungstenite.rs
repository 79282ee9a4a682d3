//! WebSocket [`Transport`] built on `tokio-tungstenite`.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{CloseStatus, Frame, Payload, Session, SessionEvents, Transport, TransportError};
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens plain (`ws://`) and TLS (`wss://`) WebSocket sessions.
///
/// Connect timeouts are those of the underlying TCP/TLS stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        events: SessionEvents,
    ) -> Result<Arc<dyn Session>> {
        let request = handshake_request(url, headers)?;
        let (ws_stream, _) = connect_async(request).await?;
        let (write, read) = ws_stream.split();

        let reader = tokio::spawn(read_loop(read, events));

        Ok(Arc::new(TungsteniteSession {
            write: Mutex::new(write),
            reader,
        }))
    }
}

/// Client handshake request for `url` carrying `headers`.
fn handshake_request(url: &str, headers: &HashMap<String, String>) -> Result<Request> {
    let mut request = url.into_client_request()?;
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(invalid_header(name))?;
        let header_value = HeaderValue::from_str(value).map_err(invalid_header(name))?;
        request.headers_mut().insert(header_name, header_value);
    }

    Ok(request)
}

fn invalid_header<E>(name: &str) -> impl FnOnce(E) -> TransportError
where
    E: StdError + Send + Sync + 'static,
{
    let name = name.to_owned();
    move |e| TransportError::InvalidHeader {
        name,
        source: Box::new(e),
    }
}

/// Forwards inbound frames to the manager until the stream ends.
async fn read_loop(mut read: SplitStream<WsStream>, events: SessionEvents) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(%text, "Received WebSocket text message");
                events.on_message(Payload::Text(text.as_str().to_owned()));
            }
            Ok(Message::Binary(data)) => events.on_message(Payload::Binary(data.to_vec())),
            Ok(Message::Close(frame)) => {
                let status = frame.map(|f| CloseStatus::new(u16::from(f.code), f.reason.as_str()));
                events.on_close(status);
                return;
            }
            Err(e) => {
                events.on_error(e.into());
                return;
            }
            _ => {
                // Ping/pong are answered by tungstenite itself.
            }
        }
    }

    events.on_close(None);
}

struct TungsteniteSession {
    write: Mutex<SplitSink<WsStream, Message>>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Session for TungsteniteSession {
    async fn send(&self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
            Frame::Ping(data) => Message::Ping(data.into()),
        };

        self.write.lock().await.send(message).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let result = self.write.lock().await.close().await;
        self.reader.abort();
        result?;
        Ok(())
    }
}

impl Drop for TungsteniteSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
