//! Websocket-backed subscriber handle
//!
//! The socket's write half is owned by a writer task fed through a bounded
//! queue. `send` waits at most `send_timeout` for queue space, so a client
//! that stops reading fails its sends instead of stalling a broadcast. The
//! first failed send shuts the handle: the writer stops and `closed()`
//! resolves, so the connection handler tears the connection down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::SinkExt;
use futures::stream::SplitSink;
use market_data::error::DeliveryError;
use market_data::subscriptions::Subscriber;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use types::ids::ConnectionId;

const OUTBOUND_BUFFER: usize = 64;

pub struct WsSubscriber {
    id: ConnectionId,
    outbound: mpsc::Sender<Message>,
    shut: watch::Sender<bool>,
    send_timeout: Duration,
}

impl WsSubscriber {
    /// Take ownership of the write half and start its writer task.
    ///
    /// The writer flushes queued messages and closes the socket once every
    /// handle is dropped, or stops at once when the handle is shut.
    pub fn spawn(mut sink: SplitSink<WebSocket, Message>, send_timeout: Duration) -> (Arc<Self>, JoinHandle<()>) {
        let id = ConnectionId::next();
        let (outbound, mut queue) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let (shut, mut shut_rx) = watch::channel(false);

        let writer = tokio::spawn(async move {
            let pump = async {
                while let Some(message) = queue.recv().await {
                    if let Err(e) = sink.send(message).await {
                        debug!(connection = %id, error = %e, "Socket write failed");
                        break;
                    }
                }
            };
            tokio::select! {
                _ = pump => {}
                _ = shut_rx.wait_for(|shut| *shut) => {
                    debug!(connection = %id, "Writer stopped after failed delivery");
                }
            }
            let _ = tokio::time::timeout(send_timeout, sink.close()).await;
        });

        let subscriber = Arc::new(Self {
            id,
            outbound,
            shut,
            send_timeout,
        });
        (subscriber, writer)
    }

    /// Resolves once the writer task is gone or the handle was shut.
    pub async fn closed(&self) {
        let mut shut = self.shut.subscribe();
        tokio::select! {
            _ = self.outbound.closed() => {}
            _ = shut.wait_for(|shut| *shut) => {}
        }
    }

    /// Mark the handle dead. Later sends fail without touching the queue.
    pub fn shut(&self) {
        self.shut.send_replace(true);
    }

    /// Queue a close frame behind any pending messages.
    pub fn close_with(&self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if self.outbound.try_send(Message::Close(Some(frame))).is_err() {
            self.shut();
        }
    }
}

#[async_trait]
impl Subscriber for WsSubscriber {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, message: &str) -> Result<(), DeliveryError> {
        if *self.shut.borrow() {
            return Err(DeliveryError::Closed);
        }
        let result = match tokio::time::timeout(self.send_timeout, self.outbound.send(Message::Text(message.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::Timeout {
                millis: self.send_timeout.as_millis() as u64,
            }),
        };
        if result.is_err() {
            self.shut();
        }
        result
    }

    fn is_alive(&self) -> bool {
        !self.outbound.is_closed() && !*self.shut.borrow()
    }
}
