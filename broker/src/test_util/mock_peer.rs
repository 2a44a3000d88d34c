//! Scripted WebSocket peer standing in for a worker or relay client.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use workpool_common::RegisterAck;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockPeer {
    /// Id assigned in the register ack.
    pub id: String,
    outgoing: mpsc::Sender<Message>,
    incoming: mpsc::UnboundedReceiver<String>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl MockPeer {
    /// Connect and register. On rejection the error carries the close reason.
    pub async fn connect(url: &str, register: Value) -> Result<Self, String> {
        let (ws, _) = connect_async(url).await.map_err(|e| e.to_string())?;
        let (mut sink, mut stream) = ws.split();
        sink.send(Message::Text(register.to_string()))
            .await
            .map_err(|e| e.to_string())?;

        let ack = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(Message::Close(frame))) => {
                    return Err(frame.map(|f| f.reason.to_string()).unwrap_or_default());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.to_string()),
                None => return Err("connection closed".to_string()),
            }
        };
        let ack: RegisterAck = serde_json::from_str(&ack).map_err(|e| e.to_string())?;

        let (out_tx, out_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(async move {
            let _ = ReceiverStream::new(out_rx)
                .map(Ok::<_, tokio_tungstenite::tungstenite::Error>)
                .forward(sink)
                .await;
        });

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    Message::Text(text) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Self {
            id: ack.id,
            outgoing: out_tx,
            incoming: in_rx,
            writer,
            reader,
        })
    }

    pub async fn send<T: Serialize>(&self, msg: &T) {
        let text = serde_json::to_string(msg).expect("Failed to encode frame");
        self.outgoing
            .send(Message::Text(text))
            .await
            .expect("Peer writer stopped");
    }

    /// Next frame that decodes as `T` and satisfies `keep`, skipping others.
    /// `None` on disconnect or after a few seconds of silence.
    pub async fn recv_where<T, F>(&mut self, keep: F) -> Option<T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        loop {
            let text = tokio::time::timeout(RECV_TIMEOUT, self.incoming.recv()).await.ok()??;
            if let Ok(msg) = serde_json::from_str::<T>(&text) {
                if keep(&msg) {
                    return Some(msg);
                }
            }
        }
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Option<T> {
        self.recv_where(|_| true).await
    }

    /// Whether the broker closed the connection within `within`.
    pub async fn closed_within(&mut self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, self.incoming.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}
