//! Thin adapter over the shared MQTT broker.
//!
//! The adapter owns the rumqttc event loop and exposes two things to the
//! rest of the crate: a stream of [`BrokerEvent`]s (inbound messages plus a
//! notification on every established session, so the presence layer can
//! re-introduce itself after a reconnect) and a fire-and-forget
//! [`Broker::publish`]. Outbound messages go through a queue drained by a
//! writer task; a failed publish is logged and dropped, the next periodic
//! announcement repairs whatever state it carried.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use thiserror::Error;
use tokio::sync::mpsc;

// ─── Topics ──────────────────────────────────────────────────────────────────

pub const TOPIC_NEWSPAPER_PREFIX: &str = "nara/newspaper/";
pub const TOPIC_HEY_THERE: &str = "nara/plaza/hey_there";
pub const TOPIC_CHAU: &str = "nara/plaza/chau";
pub const TOPIC_PING_PREFIX: &str = "nara/ping/";

/// Every pattern the presence engine listens on.
pub const SUBSCRIPTIONS: [&str; 4] =
    ["nara/newspaper/#", TOPIC_HEY_THERE, TOPIC_CHAU, "nara/ping/#"];

const OUTBOUND_QUEUE: usize = 64;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// MQTT-style topic filter match. `#` swallows the remainder of the topic,
/// `+` exactly one level.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client identifier on the broker; the nara's name.
    pub client_id: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("broker subscription failed: {0}")]
    Subscribe(String),
}

/// Inbound side of the adapter.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A broker session was (re-)established and all patterns resubscribed.
    Connected,
    Message { topic: String, payload: Vec<u8> },
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Publish { topic: String, payload: Vec<u8> },
    Disconnect,
}

pub struct Broker {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Broker {
    /// Connect to the broker and subscribe to the presence topics.
    ///
    /// Drives the event loop until the broker acknowledges the session, so
    /// an unreachable broker surfaces here as an error instead of a silent
    /// retry loop — startup treats that as fatal. On success two background
    /// tasks take over: one keeps polling the event loop (feeding inbound
    /// messages into the returned channel and resubscribing after every
    /// reconnect), one drains the outbound queue.
    pub async fn connect(
        config: &BrokerConfig,
    ) -> Result<(Broker, mpsc::UnboundedReceiver<BrokerEvent>), BrokerError> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut event_loop) = AsyncClient::new(options, OUTBOUND_QUEUE);

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(e) => return Err(BrokerError::Connect(e.to_string())),
            }
        }
        subscribe_all(&client).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(BrokerEvent::Connected);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(poll_loop(client.clone(), event_loop, event_tx));
        tokio::spawn(write_loop(client, outbound_rx));

        Ok((Broker { outbound: outbound_tx }, event_rx))
    }

    /// Queue a message for the broker, QoS 0, no retain. Local enqueue is
    /// the only acknowledgement; delivery is broker best-effort.
    pub fn publish(&self, topic: impl Into<String>, payload: Vec<u8>) {
        let topic = topic.into();
        if self.outbound.send(Outbound::Publish { topic: topic.clone(), payload }).is_err() {
            log::warn!("broker writer gone, dropping message for {topic}");
        }
    }

    /// Disconnect after flushing everything queued so far; the farewell
    /// published just before this still goes out.
    pub fn disconnect(&self) {
        let _ = self.outbound.send(Outbound::Disconnect);
    }

    /// A broker with no transport behind it; captures everything published
    /// so protocol tests can assert on outbound traffic.
    #[cfg(test)]
    pub(crate) fn detached() -> (Broker, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (Broker { outbound: outbound_tx }, outbound_rx)
    }
}

async fn subscribe_all(client: &AsyncClient) -> Result<(), BrokerError> {
    for pattern in SUBSCRIPTIONS {
        client
            .subscribe(pattern, QoS::AtMostOnce)
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
    }
    Ok(())
}

async fn poll_loop(
    client: AsyncClient,
    mut event_loop: rumqttc::EventLoop,
    events: mpsc::UnboundedSender<BrokerEvent>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let message = BrokerEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if events.send(message).is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                log::info!("broker session re-established, resubscribing");
                if let Err(e) = subscribe_all(&client).await {
                    log::warn!("resubscribe failed: {e}");
                }
                if events.send(BrokerEvent::Connected).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("broker connection lost: {e}");
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
}

async fn write_loop(client: AsyncClient, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Publish { topic, payload } => {
                log::debug!("posting on {topic}");
                if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, payload).await {
                    log::warn!("publish on {topic} failed: {e}");
                }
            }
            Outbound::Disconnect => {
                let _ = client.disconnect().await;
                return;
            }
        }
    }
}
