//! Per-subscriber connection driver.
//!
//! One task per live connection forwards queued balance updates, keeps the
//! connection alive with pings and closes it when the peer goes quiet. The
//! transport itself (websocket or otherwise) sits behind
//! [`SubscriberTransport`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::hub::{BalanceHub, Subscription};

/// Message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Pong,
    /// Any data frame; its content is ignored.
    Message(Vec<u8>),
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// A bidirectional connection to one subscriber.
#[async_trait]
pub trait SubscriberTransport: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Wait for the next inbound frame.
    async fn recv(&mut self) -> Result<Inbound, TransportError>;

    /// Best-effort close frame.
    async fn close(&mut self);
}

/// Timing and size limits for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
}

impl From<&HubConfig> for ConnectionSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame.
    ClientClosed,
    /// The peer went away without a close frame.
    Disconnected,
    /// No pong arrived within the read timeout.
    ReadTimeout,
    WriteTimeout,
    MessageTooLarge(usize),
    /// The hub dropped this subscriber's queue.
    HubClosed,
    Transport(String),
}

/// Drive `transport` until it closes, then unregister the subscription.
pub async fn serve_subscriber<T: SubscriberTransport>(
    hub: &BalanceHub,
    subscription: Subscription,
    mut transport: T,
    settings: ConnectionSettings,
) -> CloseReason {
    let Subscription {
        user_id,
        subscriber_id,
        mut receiver,
    } = subscription;

    let mut ping = time::interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut read_deadline = Instant::now() + settings.read_timeout;

    let reason = loop {
        tokio::select! {
            queued = receiver.recv() => {
                let Some(message) = queued else {
                    break CloseReason::HubClosed;
                };
                match time::timeout(settings.write_timeout, transport.send_text(&message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break write_failure(e),
                    Err(_) => break CloseReason::WriteTimeout,
                }
            }
            _ = ping.tick() => {
                match time::timeout(settings.write_timeout, transport.send_ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break write_failure(e),
                    Err(_) => break CloseReason::WriteTimeout,
                }
            }
            inbound = transport.recv() => match inbound {
                Ok(Inbound::Pong) => {
                    read_deadline = Instant::now() + settings.read_timeout;
                }
                Ok(Inbound::Message(bytes)) => {
                    if bytes.len() > settings.max_message_bytes {
                        break CloseReason::MessageTooLarge(bytes.len());
                    }
                }
                Ok(Inbound::Close) => break CloseReason::ClientClosed,
                Err(TransportError::Closed) => break CloseReason::Disconnected,
                Err(TransportError::Io(e)) => break CloseReason::Transport(e),
            },
            _ = time::sleep_until(read_deadline) => break CloseReason::ReadTimeout,
        }
    };

    hub.unregister(user_id, subscriber_id);
    if !matches!(reason, CloseReason::ClientClosed | CloseReason::Disconnected) {
        transport.close().await;
    }
    info!(user_id = %user_id, subscriber_id, reason = ?reason, "Subscriber connection closed");
    reason
}

fn write_failure(err: TransportError) -> CloseReason {
    debug!(error = %err, "Write to subscriber failed");
    match err {
        TransportError::Closed => CloseReason::Disconnected,
        TransportError::Io(e) => CloseReason::Transport(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::BalanceUpdate;
    use ledgerline_common::{AccountId, Currency, UserId};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Outbound {
        Text(String),
        Ping,
        Close,
    }

    /// Transport backed by channels; the test plays the peer.
    struct ChannelTransport {
        inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::UnboundedSender<Outbound>,
    }

    fn channel_transport() -> (
        ChannelTransport,
        mpsc::Sender<Inbound>,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                inbound: in_rx,
                outbound: out_tx,
            },
            in_tx,
            out_rx,
        )
    }

    #[async_trait]
    impl SubscriberTransport for ChannelTransport {
        async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            self.outbound
                .send(Outbound::Text(text.to_string()))
                .map_err(|_| TransportError::Closed)
        }

        async fn send_ping(&mut self) -> Result<(), TransportError> {
            self.outbound
                .send(Outbound::Ping)
                .map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Result<Inbound, TransportError> {
            self.inbound.recv().await.ok_or(TransportError::Closed)
        }

        async fn close(&mut self) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_updates_and_unregisters_on_close() {
        let hub = Arc::new(BalanceHub::new(10));
        let user = UserId::new();
        let subscription = hub.register(user);
        let (transport, peer_tx, mut peer_rx) = channel_transport();

        let server = tokio::spawn({
            let hub = hub.clone();
            async move {
                serve_subscriber(&hub, subscription, transport, ConnectionSettings::default()).await
            }
        });

        let update = BalanceUpdate {
            account_id: AccountId::new(),
            balance: "90.00".to_string(),
            currency: Currency::usd(),
        };
        hub.broadcast(user, &update);

        let Some(Outbound::Text(text)) = peer_rx.recv().await else {
            panic!("expected a text frame");
        };
        let received: BalanceUpdate = serde_json::from_str(&text).unwrap();
        assert_eq!(received, update);

        peer_tx.send(Inbound::Close).await.unwrap();
        assert_eq!(server.await.unwrap(), CloseReason::ClientClosed);
        assert_eq!(hub.subscriber_count(user), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let hub = BalanceHub::new(10);
        let user = UserId::new();
        let subscription = hub.register(user);
        let (transport, _peer_tx, mut peer_rx) = channel_transport();
        let started = Instant::now();

        let reason = serve_subscriber(&hub, subscription, transport, ConnectionSettings::default()).await;

        assert_eq!(reason, CloseReason::ReadTimeout);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(61));
        assert_eq!(peer_rx.recv().await, Some(Outbound::Ping));
        assert_eq!(peer_rx.recv().await, Some(Outbound::Close));
        assert_eq!(hub.subscriber_count(user), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_extends_read_deadline() {
        let hub = Arc::new(BalanceHub::new(10));
        let user = UserId::new();
        let subscription = hub.register(user);
        let (transport, peer_tx, mut peer_rx) = channel_transport();
        let started = Instant::now();

        // answer two pings, then hang up without a close frame
        let peer = tokio::spawn(async move {
            let mut pongs = 0;
            while let Some(frame) = peer_rx.recv().await {
                if frame == Outbound::Ping {
                    peer_tx.send(Inbound::Pong).await.unwrap();
                    pongs += 1;
                    if pongs == 2 {
                        break;
                    }
                }
            }
        });

        let reason = serve_subscriber(&hub, subscription, transport, ConnectionSettings::default()).await;
        peer.await.unwrap();

        // without the pongs the connection would have died at 60s
        assert_eq!(reason, CloseReason::Disconnected);
        assert!(started.elapsed() >= Duration::from_secs(100));
        assert_eq!(hub.subscriber_count(user), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_message_closes_connection() {
        let hub = BalanceHub::new(10);
        let user = UserId::new();
        let subscription = hub.register(user);
        let (transport, peer_tx, _peer_rx) = channel_transport();

        peer_tx.send(Inbound::Message(vec![b'x'; 100])).await.unwrap();
        peer_tx.send(Inbound::Message(vec![b'x'; 513])).await.unwrap();

        let reason = serve_subscriber(&hub, subscription, transport, ConnectionSettings::default()).await;
        assert_eq!(reason, CloseReason::MessageTooLarge(513));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_subscriber_sees_hub_closed() {
        let hub = BalanceHub::new(10);
        let user = UserId::new();
        let subscription = hub.register(user);
        hub.unregister(user, subscription.subscriber_id);
        let (transport, _peer_tx, _peer_rx) = channel_transport();

        let reason = serve_subscriber(&hub, subscription, transport, ConnectionSettings::default()).await;
        assert_eq!(reason, CloseReason::HubClosed);
    }
}
