//! WebSocket connector for the device-proxy backend

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::transport::{decode_text, Connector, Incoming, Link, Outgoing, RemoteEnd};

/// Opens `ws://<host>:<port>/ws/<method>` sockets
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("ws://{host}:{port}/ws"),
        }
    }

    pub fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, method: &str) -> Result<Link, TransportError> {
        let url = self.url(method);
        debug!(url = %url, "Opening socket");

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let (link, remote) = Link::pair();
        tokio::spawn(pump(stream, remote, url));
        Ok(link)
    }
}

/// Move frames between the socket and the link until either side goes away
async fn pump(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, remote: RemoteEnd, url: String) {
    let (mut write, mut read) = stream.split();
    let RemoteEnd { tx, mut rx } = remote;

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let message = match outgoing {
                    Some(Outgoing::Text(text)) => Message::Text(text.into()),
                    Some(Outgoing::Binary(data)) => Message::Binary(data),
                    None => {
                        trace!(url = %url, "Link dropped, closing socket");
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                if write.send(message).await.is_err() {
                    warn!(url = %url, "Socket write failed");
                    break;
                }
            }
            frame = read.next() => {
                let incoming = match frame {
                    Some(Ok(Message::Text(text))) => decode_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => Some(Incoming::Binary(data)),
                    Some(Ok(Message::Close(frame))) => {
                        let abnormal = frame.as_ref().is_some_and(|f| f.code == CloseCode::Abnormal);
                        info!(url = %url, abnormal, "Socket closed by backend");
                        if abnormal {
                            let _ = tx.send(disconnected()).await;
                        }
                        break;
                    }
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        warn!(url = %url, error = %e, "Socket error");
                        let _ = tx.send(disconnected()).await;
                        break;
                    }
                    None => break,
                };
                if let Some(incoming) = incoming {
                    if tx.send(incoming).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn disconnected() -> Incoming {
    Incoming::Fatal(serde_json::json!({"status": "fatal", "error": ["DISCONNECTED"]}))
}
