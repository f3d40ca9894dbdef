//! MQTT v3.1.1 bus on `rumqttc`.
//!
//! Connect and subscribe are retried up to `max_tries` times with a fixed
//! delay. A broker that refuses the requested QoS is not retried. Once
//! running, a dropped connection or a silent broker (no packet at all for
//! the liveness timeout, keep-alive pings included) starts the same bounded
//! reconnect.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode,
};
use tracing::{debug, info, warn};

use tlm_config::MqttConfig;

use crate::{BusMessage, MessageBus};

pub const DEFAULT_PORT: u16 = 1883;

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Lower bound `rumqttc` accepts for a keep-alive interval.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Split `host[:port]`, optionally prefixed with `tcp://` or `mqtt://`.
pub fn parse_server(server: &str) -> Result<(String, u16)> {
    let s = server.trim();
    let s = s
        .strip_prefix("tcp://")
        .or_else(|| s.strip_prefix("mqtt://"))
        .unwrap_or(s)
        .trim_end_matches('/');
    if s.is_empty() {
        bail!("no MQTT server configured (set MQTT_TOPIC_URL or --server)");
    }
    match s.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                bail!("MQTT server '{server}' has no host");
            }
            let port = port
                .parse::<u16>()
                .with_context(|| format!("MQTT server '{server}' has an invalid port"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((s.to_string(), DEFAULT_PORT)),
    }
}

fn qos_from(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => bail!("invalid MQTT QoS {other}"),
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub qos: QoS,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_tries: u32,
    pub retry_delay: Duration,
    pub keep_alive: Duration,
    /// `None` disables the liveness check.
    pub liveness_timeout: Option<Duration>,
}

impl fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<REDACTED>"))
            .field("max_tries", &self.max_tries)
            .field("retry_delay", &self.retry_delay)
            .field("keep_alive", &self.keep_alive)
            .field("liveness_timeout", &self.liveness_timeout)
            .finish()
    }
}

impl MqttSettings {
    pub fn from_config(cfg: &MqttConfig) -> Result<Self> {
        let (host, port) = parse_server(&cfg.server)?;
        let topic = cfg.topic.trim();
        if topic.is_empty() {
            bail!("no MQTT topic configured");
        }
        let client_id = match cfg.client_id.trim() {
            "" => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("tlm-{}", &id[..12])
            }
            id => id.to_string(),
        };
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Ok(Self {
            host,
            port,
            topic: topic.to_string(),
            qos: qos_from(cfg.qos)?,
            client_id,
            username: non_empty(&cfg.username),
            password: non_empty(&cfg.password),
            max_tries: cfg.max_tries.max(1),
            retry_delay: Duration::from_secs(cfg.retry_delay_secs),
            keep_alive: Duration::from_secs(cfg.keep_alive_secs).max(MIN_KEEP_ALIVE),
            liveness_timeout: (cfg.liveness_timeout_secs > 0)
                .then(|| Duration::from_secs(cfg.liveness_timeout_secs)),
        })
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if let Some(user) = &self.username {
            opts.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        opts
    }

    /// Bound on a single handshake step.
    fn handshake_timeout(&self) -> Duration {
        self.liveness_timeout.unwrap_or(Duration::from_secs(120))
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

enum HandshakeError {
    /// Worth another attempt.
    Transient(anyhow::Error),
    /// The broker answered and said no.
    Rejected(anyhow::Error),
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    /// Publishes that arrived before the subscription was acknowledged.
    early: VecDeque<BusMessage>,
}

fn to_message(p: rumqttc::Publish) -> BusMessage {
    BusMessage {
        topic: p.topic,
        payload: p.payload.to_vec(),
    }
}

async fn poll_once(eventloop: &mut EventLoop, limit: Duration) -> Result<Event, HandshakeError> {
    match tokio::time::timeout(limit, eventloop.poll()).await {
        Ok(Ok(ev)) => Ok(ev),
        Ok(Err(ConnectionError::ConnectionRefused(code))) => Err(HandshakeError::Rejected(
            anyhow!("broker refused connection: {code:?}"),
        )),
        Ok(Err(e)) => Err(HandshakeError::Transient(anyhow!(e))),
        Err(_) => Err(HandshakeError::Transient(anyhow!(
            "no answer from broker within {}s",
            limit.as_secs()
        ))),
    }
}

async fn handshake(settings: &MqttSettings) -> Result<Session, HandshakeError> {
    let (client, mut eventloop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
    let limit = settings.handshake_timeout();

    loop {
        match poll_once(&mut eventloop, limit).await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(HandshakeError::Rejected(anyhow!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                break;
            }
            ev => debug!(?ev, "waiting for connack"),
        }
    }
    info!(host = %settings.host, port = settings.port, "MQTT connected");

    client
        .subscribe(settings.topic.clone(), settings.qos)
        .await
        .map_err(|e| HandshakeError::Transient(anyhow!(e)))?;

    let mut early = VecDeque::new();
    loop {
        match poll_once(&mut eventloop, limit).await? {
            Event::Incoming(Packet::SubAck(ack)) => {
                match ack.return_codes.first() {
                    Some(SubscribeReasonCode::Success(granted)) if *granted == settings.qos => {}
                    other => {
                        return Err(HandshakeError::Rejected(anyhow!(
                            "failed to subscribe to {} at {:?}: broker answered {:?}",
                            settings.topic,
                            settings.qos,
                            other
                        )))
                    }
                }
                break;
            }
            Event::Incoming(Packet::Publish(p)) => early.push_back(to_message(p)),
            ev => debug!(?ev, "waiting for suback"),
        }
    }
    info!(topic = %settings.topic, qos = ?settings.qos, "MQTT subscribed");

    Ok(Session {
        client,
        eventloop,
        early,
    })
}

async fn establish(settings: &MqttSettings) -> Result<Session> {
    let mut last = None;
    for attempt in 1..=settings.max_tries {
        match handshake(settings).await {
            Ok(session) => return Ok(session),
            Err(HandshakeError::Rejected(e)) => return Err(e),
            Err(HandshakeError::Transient(e)) => {
                warn!(
                    attempt,
                    tries = settings.max_tries,
                    error = %format!("{e:#}"),
                    "Error connecting MQTT, retrying soon"
                );
                last = Some(e);
                if attempt < settings.max_tries {
                    tokio::time::sleep(settings.retry_delay).await;
                }
            }
        }
    }
    let cause = last.unwrap_or_else(|| anyhow!("no connection attempt made"));
    Err(cause.context(format!(
        "failed to reach {}:{} after {} attempts",
        settings.host, settings.port, settings.max_tries
    )))
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

pub struct MqttBus {
    settings: MqttSettings,
    session: Session,
    closed: bool,
}

impl MqttBus {
    /// Connect and subscribe, retrying as configured.
    pub async fn connect(settings: MqttSettings) -> Result<Self> {
        info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "Connect TCP/IP");
        let session = establish(&settings).await?;
        Ok(Self {
            settings,
            session,
            closed: false,
        })
    }

    async fn reconnect(&mut self, cause: anyhow::Error) -> Result<()> {
        warn!(error = %format!("{cause:#}"), "MQTT connection lost, reconnecting");
        self.session = establish(&self.settings)
            .await
            .context("MQTT reconnect failed")?;
        Ok(())
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn next_message(&mut self) -> Result<Option<BusMessage>> {
        loop {
            if self.closed {
                return Ok(None);
            }
            if let Some(m) = self.session.early.pop_front() {
                return Ok(Some(m));
            }

            let polled = match self.settings.liveness_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.session.eventloop.poll()).await
                {
                    Ok(r) => r.map_err(|e| anyhow!(e)),
                    Err(_) => Err(anyhow!("no traffic from broker for {}s", limit.as_secs())),
                },
                None => self.session.eventloop.poll().await.map_err(|e| anyhow!(e)),
            };

            match polled {
                Ok(Event::Incoming(Packet::Publish(p))) => return Ok(Some(to_message(p))),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.reconnect(anyhow!("broker sent disconnect")).await?
                }
                Ok(_) => {}
                Err(e) => self.reconnect(e).await?,
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session
            .client
            .disconnect()
            .await
            .context("queue MQTT disconnect")?;
        // Drive the loop until the disconnect packet is on the wire.
        let flush = async {
            loop {
                match self.session.eventloop.poll().await {
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), flush).await.is_err() {
            warn!("MQTT disconnect not confirmed");
        }
        info!("MQTT disconnected");
        Ok(())
    }
}
