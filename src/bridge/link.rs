//! Connection between the bridge and the broker the hub listens on.
//!
//! Without a hub url the bridge is an in-process client of the built-in broker, otherwise
//! it connects to an external broker with [rumqttc]. Both links reconnect with backoff
//! and report every new session as [HubEvent::Connected], after which the bridge
//! subscribes and announces itself again.

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, Transport};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::BridgeConfig;
use crate::broker::packet::{Publish, Will};
use crate::broker::{BrokerHandle, LocalClient};

const TARGET: &str = "status";
const CLIENT_ID: &str = "cloudless-bridge";
const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REMOTE_QUEUE: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, PartialEq, Eq)]
pub(super) enum HubEvent {
    /// new session, subscriptions are gone
    Connected,
    Message(Publish),
    Lost,
}

#[derive(Debug)]
pub(super) enum Outbound {
    Publish(Publish),
    Subscribe(Vec<String>),
    /// acknowledged once the session is closed
    Close(oneshot::Sender<()>),
}

struct Backoff(Duration);

impl Backoff {
    fn new() -> Self {
        Self(MIN_BACKOFF)
    }

    fn reset(&mut self) {
        self.0 = MIN_BACKOFF;
    }

    fn next(&mut self) -> Duration {
        let delay = self.0;
        self.0 = (self.0 * 2).min(MAX_BACKOFF);
        delay
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct HubUrl {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

/// Parse `mqtt://host[:port]` or `mqtts://host[:port]`.
pub(super) fn parse_url(url: &str) -> Result<HubUrl> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("mqtts://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("mqtt://") {
        (false, rest)
    } else {
        anyhow::bail!("unsupported hub url {}, expected mqtt:// or mqtts://", url);
    };
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().context(format!("invalid port in {}", url))?),
        None => (rest, if tls { 8883 } else { 1883 }),
    };
    if host.is_empty() {
        anyhow::bail!("missing host in {}", url);
    }
    Ok(HubUrl {
        tls,
        host: host.to_owned(),
        port,
    })
}

pub(super) fn subscriptions(config: &BridgeConfig) -> Vec<String> {
    vec![
        config.status_topic(),
        format!("{}/+/+/set", config.prefix),
        format!("{}/+/availability", config.prefix),
    ]
}

pub(super) enum Link {
    Local(LocalLink),
    Remote(RemoteLink),
}

impl Link {
    /// Local links make their first session right away so startup fails on a dead broker.
    pub(super) async fn connect(
        broker: &BrokerHandle,
        config: &BridgeConfig,
        outbound: mpsc::Receiver<Outbound>,
        events: mpsc::Sender<HubEvent>,
    ) -> Result<Self> {
        match &config.url {
            Some(url) => Ok(Link::Remote(RemoteLink::new(url, config, outbound, events)?)),
            None => Ok(Link::Local(LocalLink::connect(broker, config, outbound, events).await?)),
        }
    }

    pub(super) async fn run(self) {
        match self {
            Link::Local(l) => l.run().await,
            Link::Remote(r) => r.run().await,
        }
    }
}

/// Sleep for `delay`, dropping whatever is published meanwhile. Returns false once the
/// link is closed.
async fn idle(outbound: &mut mpsc::Receiver<Outbound>, delay: Duration) -> bool {
    let wake = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => return true,
            out = outbound.recv() => match out {
                Some(Outbound::Close(done)) => {
                    _ = done.send(());
                    return false;
                }
                Some(_) => log::debug!(target: TARGET, "hub not connected, dropping message"),
                None => return false,
            },
        }
    }
}

pub(super) struct LocalLink {
    broker: BrokerHandle,
    will: Will,
    client: LocalClient,
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<HubEvent>,
}

enum SessionEnd {
    Closed,
    Lost,
}

async fn local_session(broker: &BrokerHandle, will: &Will) -> Result<LocalClient> {
    let mut client = broker.local_client().await?;
    client.connect(CLIENT_ID, Some(will.clone())).await?;
    Ok(client)
}

impl LocalLink {
    async fn connect(
        broker: &BrokerHandle,
        config: &BridgeConfig,
        outbound: mpsc::Receiver<Outbound>,
        events: mpsc::Sender<HubEvent>,
    ) -> Result<Self> {
        let will = Will {
            topic: config.availability_topic(),
            payload: b"offline".to_vec(),
            qos: 0,
            retain: true,
        };
        let mut client = local_session(broker, &will).await?;
        client.subscribe(&subscriptions(config)).await?;
        client.publish(&config.availability_topic(), "online", true).await?;
        Ok(Self {
            broker: broker.clone(),
            will,
            client,
            outbound,
            events,
        })
    }

    async fn run(self) {
        let LocalLink {
            broker,
            will,
            mut client,
            mut outbound,
            events,
        } = self;
        let mut backoff = Backoff::new();
        loop {
            if let SessionEnd::Closed = serve_local(client, &mut outbound, &events).await {
                return;
            }
            // a bridge that falls behind is dropped by the broker like any other client
            log::warn!(target: TARGET, "broker closed bridge connection");
            if events.send(HubEvent::Lost).await.is_err() {
                return;
            }
            client = loop {
                if !idle(&mut outbound, backoff.next()).await {
                    return;
                }
                match local_session(&broker, &will).await {
                    Ok(c) => break c,
                    Err(e) => log::warn!(target: TARGET, "can't reconnect bridge: {:#}", e),
                }
            };
            backoff.reset();
            if events.send(HubEvent::Connected).await.is_err() {
                return;
            }
        }
    }
}

async fn serve_local(
    mut client: LocalClient,
    outbound: &mut mpsc::Receiver<Outbound>,
    events: &mpsc::Sender<HubEvent>,
) -> SessionEnd {
    loop {
        tokio::select! {
            msg = client.recv() => match msg {
                Some(msg) => {
                    if events.send(HubEvent::Message(msg)).await.is_err() {
                        return SessionEnd::Closed;
                    }
                }
                None => return SessionEnd::Lost,
            },
            out = outbound.recv() => {
                let r = match out {
                    Some(Outbound::Publish(p)) => client.publish(&p.topic, p.payload, p.retain).await,
                    Some(Outbound::Subscribe(topics)) => client.subscribe(&topics).await,
                    Some(Outbound::Close(done)) => {
                        if let Err(e) = client.disconnect().await {
                            log::debug!(target: TARGET, "bridge disconnect: {:#}", e);
                        }
                        _ = done.send(());
                        return SessionEnd::Closed;
                    }
                    None => return SessionEnd::Closed,
                };
                if let Err(e) = r {
                    log::warn!(target: TARGET, "bridge send failed: {:#}", e);
                }
            }
        }
    }
}

pub(super) struct RemoteLink {
    client: AsyncClient,
    eventloop: EventLoop,
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<HubEvent>,
}

impl RemoteLink {
    fn new(
        url: &str,
        config: &BridgeConfig,
        outbound: mpsc::Receiver<Outbound>,
        events: mpsc::Sender<HubEvent>,
    ) -> Result<Self> {
        let url = parse_url(url)?;
        let mut options = MqttOptions::new(CLIENT_ID, url.host, url.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_last_will(LastWill::new(
            config.availability_topic(),
            "offline",
            QoS::AtMostOnce,
            true,
        ));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }
        if url.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        let (client, eventloop) = AsyncClient::new(options, REMOTE_QUEUE);
        Ok(Self {
            client,
            eventloop,
            outbound,
            events,
        })
    }

    async fn run(self) {
        let RemoteLink {
            client,
            eventloop,
            mut outbound,
            events,
        } = self;
        let stop = CancellationToken::new();
        let mut poller = tokio::spawn(poll_remote(eventloop, events, stop.clone()));
        while let Some(out) = outbound.recv().await {
            let r = match out {
                // requests queue up while the broker is away, drop instead of blocking devices
                Outbound::Publish(p) => client.try_publish(p.topic, QoS::AtMostOnce, p.retain, p.payload),
                Outbound::Subscribe(topics) => {
                    let mut r = Ok(());
                    for topic in topics {
                        r = client.subscribe(topic, QoS::AtMostOnce).await;
                        if r.is_err() {
                            break;
                        }
                    }
                    r
                }
                Outbound::Close(done) => {
                    if let Err(e) = client.disconnect().await {
                        log::debug!(target: TARGET, "hub disconnect: {}", e);
                    }
                    _ = tokio::time::timeout(CLOSE_TIMEOUT, &mut poller).await;
                    _ = done.send(());
                    break;
                }
            };
            if let Err(e) = r {
                log::warn!(target: TARGET, "hub send failed: {}", e);
            }
        }
        stop.cancel();
    }
}

async fn poll_remote(mut eventloop: EventLoop, events: mpsc::Sender<HubEvent>, stop: CancellationToken) {
    let mut backoff = Backoff::new();
    let mut connected = false;
    loop {
        let event = tokio::select! {
            e = eventloop.poll() => e,
            _ = stop.cancelled() => return,
        };
        let hub_event = match event {
            Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(ack))) => {
                log::info!(target: TARGET, "hub broker accepted connection ({:?})", ack.code);
                backoff.reset();
                connected = true;
                HubEvent::Connected
            }
            Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(p))) => {
                HubEvent::Message(Publish::new(&p.topic, p.payload.to_vec(), p.retain))
            }
            Ok(rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect)) => return,
            Ok(_) => continue,
            Err(e) => {
                let delay = backoff.next();
                log::warn!(target: TARGET, "hub broker connection: {}, retrying in {:?}", e, delay);
                if connected {
                    connected = false;
                    if events.send(HubEvent::Lost).await.is_err() {
                        return;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.cancelled() => return,
                }
                continue;
            }
        };
        if events.send(hub_event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{parse_url, Backoff, HubUrl};

    #[test]
    fn hub_urls() {
        assert_eq!(
            parse_url("mqtt://hub.lan").unwrap(),
            HubUrl {
                tls: false,
                host: "hub.lan".to_owned(),
                port: 1883
            }
        );
        assert_eq!(
            parse_url("mqtts://10.0.0.2:8884/").unwrap(),
            HubUrl {
                tls: true,
                host: "10.0.0.2".to_owned(),
                port: 8884
            }
        );
        assert!(parse_url("http://hub.lan").is_err());
        assert!(parse_url("mqtt://hub.lan:x").is_err());
        assert!(parse_url("mqtt://:1883").is_err());
    }

    #[test]
    fn backoff_doubles_up_to_limit() {
        let mut b = Backoff::new();
        assert_eq!(b.next(), Duration::from_millis(500));
        assert_eq!(b.next(), Duration::from_secs(1));
        for _ in 0..10 {
            b.next();
        }
        assert_eq!(b.next(), Duration::from_secs(30));
        b.reset();
        assert_eq!(b.next(), Duration::from_millis(500));
    }
}
