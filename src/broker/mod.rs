//! Minimal MQTT broker.
//!
//! Enough of MQTT 3.1.1 to act as rendezvous point between the appliances and the
//! automation hub: retained messages, `+`/`#` wildcards, last-will delivery and
//! QoS 0 delivery (QoS 1 publishes are acknowledged but delivered at QoS 0).
//!
//! [BrokerCore] holds all state and is driven synchronously. [start] moves a core into
//! a task which owns it, every socket and in-process client talks to that task through
//! a [BrokerHandle]. Each client receives its packets through its own bounded queue,
//! a client whose queue overflows is disconnected.

pub mod packet;
pub mod server;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};

use packet::{Connect, Packet, Publish, Will};

const TARGET: &str = "broker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Item in a client's outgoing queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Packet(Packet),
    /// connection was torn down by the broker
    Close,
}

/// Notification sent to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected { client: ClientId, client_id: String },
    /// `client` is `None` for messages injected through [BrokerHandle::publish]
    Published { client: Option<ClientId>, publish: Publish },
    Disconnected { client: ClientId },
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub max_packet: usize,
    pub idle_timeout: Duration,
    pub outgoing_queue: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_packet: packet::DEFAULT_MAX_PACKET,
            idle_timeout: Duration::from_secs(5 * 60),
            outgoing_queue: 256,
        }
    }
}

/// Returns true when `topic` matches subscription `pattern`.
/// `+` matches exactly one segment, a trailing `#` matches zero or more segments.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('/');
    let mut t = topic.split('/');
    loop {
        match (p.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let segments: Vec<&str> = pattern.split('/').collect();
    segments.iter().enumerate().all(|(i, s)| {
        if *s == "#" {
            return i == segments.len() - 1;
        }
        *s == "+" || !(s.contains('+') || s.contains('#'))
    })
}

fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains('+') && !topic.contains('#')
}

struct ClientState {
    tx: mpsc::Sender<Outgoing>,
    connected: bool,
    subscriptions: Vec<String>,
    will: Option<Will>,
}

impl ClientState {
    fn matches(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|s| topic_matches(s, topic))
    }
}

pub struct BrokerCore {
    clients: BTreeMap<ClientId, ClientState>,
    retained: BTreeMap<String, Publish>,
    observers: Vec<mpsc::UnboundedSender<BrokerEvent>>,
    next_id: u64,
}

impl Default for BrokerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerCore {
    pub fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            retained: BTreeMap::new(),
            observers: Vec::new(),
            next_id: 1,
        }
    }

    /// Add client which will receive its packets through `tx`.
    pub fn register(&mut self, tx: mpsc::Sender<Outgoing>) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.clients.insert(
            id,
            ClientState {
                tx,
                connected: false,
                subscriptions: Vec::new(),
                will: None,
            },
        );
        id
    }

    pub fn observe(&mut self) -> mpsc::UnboundedReceiver<BrokerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn retained(&self, topic: &str) -> Option<&Publish> {
        self.retained.get(topic)
    }

    fn emit(&mut self, event: BrokerEvent) {
        self.observers.retain(|o| o.send(event.clone()).is_ok());
    }

    /// Queue packet for client. Returns false when the client is gone or its queue is full.
    fn send(&self, id: ClientId, packet: Packet) -> bool {
        let Some(c) = self.clients.get(&id) else {
            return false;
        };
        match c.tx.try_send(Outgoing::Packet(packet)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(target: TARGET, "{} outgoing queue full", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Process packet received from client.
    pub fn handle_packet(&mut self, id: ClientId, packet: Packet) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let connected = client.connected;
        match packet {
            Packet::Connect(c) if !connected => self.connect(id, c),
            _ if !connected => {
                log::debug!(target: TARGET, "{} sent packet before CONNECT", id);
                self.teardown(id);
            }
            Packet::Connect(_) => {
                log::debug!(target: TARGET, "{} sent second CONNECT", id);
                self.teardown(id);
            }
            Packet::Publish(p) => {
                if let Some(packet_id) = p.packet_id.filter(|_| p.qos > 0) {
                    self.send_or_drop(id, Packet::Puback(packet_id));
                }
                if !valid_topic(&p.topic) {
                    log::debug!(target: TARGET, "{} publish to invalid topic {:?}", id, p.topic);
                    return;
                }
                self.publish(Some(id), p);
            }
            Packet::Subscribe { packet_id, topics } => self.subscribe(id, packet_id, topics),
            Packet::Unsubscribe { packet_id, topics } => {
                if let Some(c) = self.clients.get_mut(&id) {
                    c.subscriptions.retain(|s| !topics.contains(s));
                }
                self.send_or_drop(id, Packet::Unsuback(packet_id));
            }
            Packet::Pingreq => self.send_or_drop(id, Packet::Pingresp),
            Packet::Disconnect => self.teardown(id),
            Packet::Puback(_) => {}
            other => {
                log::debug!(target: TARGET, "{} unexpected packet {:?}", id, other);
                self.teardown(id);
            }
        }
    }

    fn send_or_drop(&mut self, id: ClientId, packet: Packet) {
        if !self.send(id, packet) {
            self.teardown(id);
        }
    }

    fn connect(&mut self, id: ClientId, c: Connect) {
        log::debug!(target: TARGET, "{} connected as {:?}", id, c.client_id);
        if let Some(client) = self.clients.get_mut(&id) {
            client.connected = true;
            client.will = c.will;
        }
        self.send_or_drop(
            id,
            Packet::Connack {
                session_present: false,
                code: 0,
            },
        );
        self.emit(BrokerEvent::Connected {
            client: id,
            client_id: c.client_id,
        });
    }

    fn subscribe(&mut self, id: ClientId, packet_id: u16, topics: Vec<(String, u8)>) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        // retained topics not covered by subscriptions the client already had
        let unseen: Vec<String> = self
            .retained
            .keys()
            .filter(|t| !client.matches(t))
            .cloned()
            .collect();

        let mut granted = Vec::with_capacity(topics.len());
        let mut added = Vec::new();
        for (pattern, _qos) in topics {
            if !valid_pattern(&pattern) {
                granted.push(0x80);
                continue;
            }
            granted.push(0);
            if !client.subscriptions.contains(&pattern) {
                client.subscriptions.push(pattern.clone());
            }
            added.push(pattern);
        }
        if !self.send(id, Packet::Suback { packet_id, granted }) {
            self.teardown(id);
            return;
        }

        for topic in unseen {
            if !added.iter().any(|p| topic_matches(p, &topic)) {
                continue;
            }
            let Some(msg) = self.retained.get(&topic) else {
                continue;
            };
            let mut msg = msg.clone();
            msg.retain = true;
            if !self.send(id, Packet::Publish(msg)) {
                self.teardown(id);
                return;
            }
        }
    }

    /// Route message to every matching client and update retained table.
    pub fn publish(&mut self, from: Option<ClientId>, p: Publish) {
        log::trace!(target: TARGET, "publish {} ({} bytes) retain={}", p.topic, p.payload.len(), p.retain);
        self.emit(BrokerEvent::Published {
            client: from,
            publish: p.clone(),
        });

        let live = Publish {
            topic: p.topic.clone(),
            payload: p.payload.clone(),
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
        };
        let mut dropped = Vec::new();
        for (id, c) in self.clients.iter() {
            if !c.connected || !c.matches(&p.topic) {
                continue;
            }
            if !self.send(*id, Packet::Publish(live.clone())) {
                dropped.push(*id);
            }
        }

        if p.retain {
            if p.payload.is_empty() {
                self.retained.remove(&p.topic);
            } else {
                let stored = Publish {
                    qos: 0,
                    packet_id: None,
                    dup: false,
                    ..p
                };
                self.retained.insert(stored.topic.clone(), stored);
            }
        }

        for id in dropped {
            self.teardown(id);
        }
    }

    /// Remove client, publish its last-will. Calling it again for the same client is a no-op.
    pub fn teardown(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        log::debug!(target: TARGET, "{} disconnected", id);
        _ = client.tx.try_send(Outgoing::Close);
        if let Some(will) = client.will {
            self.publish(Some(id), Publish::new(&will.topic, will.payload, false));
        }
        self.emit(BrokerEvent::Disconnected { client: id });
    }
}

enum Command {
    Register {
        tx: mpsc::Sender<Outgoing>,
        reply: oneshot::Sender<ClientId>,
    },
    Packet(ClientId, Packet),
    Publish(Publish),
    Close(ClientId),
    Observe(oneshot::Sender<mpsc::UnboundedReceiver<BrokerEvent>>),
}

/// Cloneable access to a running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Command>,
    limits: Limits,
}

impl BrokerHandle {
    async fn command(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("broker is gone"))
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub async fn register(&self, tx: mpsc::Sender<Outgoing>) -> Result<ClientId> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Register { tx, reply }).await?;
        rx.await.context("broker dropped register request")
    }

    pub async fn packet(&self, id: ClientId, packet: Packet) -> Result<()> {
        self.command(Command::Packet(id, packet)).await
    }

    /// Publish message which does not originate from any client.
    pub async fn publish(&self, publish: Publish) -> Result<()> {
        self.command(Command::Publish(publish)).await
    }

    /// Tear down client connection.
    pub async fn close(&self, id: ClientId) -> Result<()> {
        self.command(Command::Close(id)).await
    }

    pub async fn observe(&self) -> Result<mpsc::UnboundedReceiver<BrokerEvent>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Observe(reply)).await?;
        rx.await.context("broker dropped observe request")
    }

    /// Attach in-process client. It still has to send CONNECT.
    pub async fn local_client(&self) -> Result<LocalClient> {
        let (tx, rx) = mpsc::channel(self.limits.outgoing_queue);
        let id = self.register(tx).await?;
        Ok(LocalClient {
            broker: self.clone(),
            id,
            rx,
            next_packet_id: 1,
        })
    }
}

/// Spawn broker task. It stops when `cancel` fires or every handle is dropped.
pub fn start(limits: Limits, cancel: tokio_util::sync::CancellationToken) -> BrokerHandle {
    let (tx, rx) = mpsc::channel(1024);
    tokio::spawn(run(BrokerCore::new(), rx, cancel));
    BrokerHandle { tx, limits }
}

async fn run(
    mut core: BrokerCore,
    mut rx: mpsc::Receiver<Command>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        let cmd = tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        match cmd {
            Command::Register { tx, reply } => {
                let id = core.register(tx);
                if reply.send(id).is_err() {
                    core.teardown(id);
                }
            }
            Command::Packet(id, p) => core.handle_packet(id, p),
            Command::Publish(p) => core.publish(None, p),
            Command::Close(id) => core.teardown(id),
            Command::Observe(reply) => {
                _ = reply.send(core.observe());
            }
        }
    }
    log::debug!(target: TARGET, "broker stopped");
}

/// Client living in the same process, used by the hub bridge.
pub struct LocalClient {
    broker: BrokerHandle,
    id: ClientId,
    rx: mpsc::Receiver<Outgoing>,
    next_packet_id: u16,
}

impl LocalClient {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn connect(&mut self, client_id: &str, will: Option<Will>) -> Result<()> {
        let connect = Connect {
            protocol_level: 4,
            client_id: client_id.to_owned(),
            keep_alive: 0,
            clean_session: true,
            will,
            username: None,
            password: None,
        };
        self.broker.packet(self.id, Packet::Connect(connect)).await
    }

    pub async fn subscribe(&mut self, patterns: &[String]) -> Result<()> {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        let topics = patterns.iter().map(|p| (p.clone(), 0)).collect();
        self.broker
            .packet(self.id, Packet::Subscribe { packet_id, topics })
            .await
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, retain: bool) -> Result<()> {
        self.broker
            .packet(self.id, Packet::Publish(Publish::new(topic, payload, retain)))
            .await
    }

    /// Next message delivered to this client, `None` once the broker closed it.
    pub async fn recv(&mut self) -> Option<Publish> {
        loop {
            match self.rx.recv().await? {
                Outgoing::Packet(Packet::Publish(p)) => return Some(p),
                Outgoing::Packet(_) => continue,
                Outgoing::Close => return None,
            }
        }
    }

    pub async fn disconnect(self) -> Result<()> {
        self.broker.packet(self.id, Packet::Disconnect).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::packet::{Connect, Packet, Publish, Will};
    use super::{start, topic_matches, BrokerCore, BrokerEvent, ClientId, Limits, Outgoing};

    fn connect_packet(will: Option<Will>) -> Packet {
        Packet::Connect(Connect {
            protocol_level: 4,
            client_id: "test".to_owned(),
            keep_alive: 60,
            clean_session: true,
            will,
            username: None,
            password: None,
        })
    }

    fn client(core: &mut BrokerCore) -> (ClientId, mpsc::Receiver<Outgoing>) {
        let (tx, mut rx) = mpsc::channel(64);
        let id = core.register(tx);
        core.handle_packet(id, connect_packet(None));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outgoing::Packet(Packet::Connack { session_present: false, code: 0 })
        );
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outgoing>) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while let Ok(o) = rx.try_recv() {
            out.push(o);
        }
        out
    }

    fn published(rx: &mut mpsc::Receiver<Outgoing>) -> Vec<Publish> {
        drain(rx)
            .into_iter()
            .filter_map(|o| match o {
                Outgoing::Packet(Packet::Publish(p)) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn subscribe(core: &mut BrokerCore, id: ClientId, pattern: &str) {
        core.handle_packet(id, Packet::Subscribe { packet_id: 1, topics: vec![(pattern.to_owned(), 0)] });
    }

    #[test]
    fn matching() {
        assert!(topic_matches("x/+/z", "x/y/z"));
        assert!(topic_matches("x/#", "x/y/z"));
        assert!(topic_matches("#", "x/y/z"));
        assert!(topic_matches("x/#", "x"));
        assert!(topic_matches("+/+", "a/"));
        assert!(!topic_matches("x/+", "x/y/z"));
        assert!(!topic_matches("x/y", "x/y/z"));
        assert!(!topic_matches("x/y/z", "x/y"));
        assert!(!topic_matches("clip/+/devices", "clip/message/devices/abc"));
    }

    #[test]
    fn wildcard_delivery_once_per_client() {
        let mut core = BrokerCore::new();
        let (sub, mut rx) = client(&mut core);
        subscribe(&mut core, sub, "x/+/z");
        subscribe(&mut core, sub, "x/#");
        drain(&mut rx);
        let (publisher, _prx) = client(&mut core);

        core.handle_packet(publisher, Packet::Publish(Publish::new("x/y/z", "1", false)));
        let got = published(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].topic, "x/y/z");

        core.handle_packet(publisher, Packet::Publish(Publish::new("x/y", "2", false)));
        assert_eq!(published(&mut rx).len(), 1);
        core.handle_packet(publisher, Packet::Publish(Publish::new("q/y/z", "3", false)));
        assert!(published(&mut rx).is_empty());
    }

    #[test]
    fn retained_replay_not_duplicated() {
        let mut core = BrokerCore::new();
        let (publisher, _prx) = client(&mut core);
        core.handle_packet(publisher, Packet::Publish(Publish::new("a/b", "v", true)));

        let (sub, mut rx) = client(&mut core);
        subscribe(&mut core, sub, "a/+");
        let first = published(&mut rx);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, b"v");
        assert!(first[0].retain);

        // a/b already covered by a/+
        subscribe(&mut core, sub, "a/#");
        assert!(published(&mut rx).is_empty());

        // live delivery clears retain flag
        core.handle_packet(publisher, Packet::Publish(Publish::new("a/b", "w", true)));
        let live = published(&mut rx);
        assert_eq!(live.len(), 1);
        assert!(!live[0].retain);
    }

    #[test]
    fn retained_update_and_delete() {
        let mut core = BrokerCore::new();
        let (publisher, _prx) = client(&mut core);
        core.handle_packet(publisher, Packet::Publish(Publish::new("t", "1", true)));
        core.handle_packet(publisher, Packet::Publish(Publish::new("t", "2", true)));
        assert_eq!(core.retained("t").unwrap().payload, b"2");
        core.handle_packet(publisher, Packet::Publish(Publish::new("t", "", true)));
        assert!(core.retained("t").is_none());

        let (sub, mut rx) = client(&mut core);
        subscribe(&mut core, sub, "#");
        assert!(published(&mut rx).is_empty());
    }

    #[test]
    fn qos1_acknowledged_and_ping() {
        let mut core = BrokerCore::new();
        let (id, mut rx) = client(&mut core);
        let mut p = Publish::new("t", "x", false);
        p.qos = 1;
        p.packet_id = Some(42);
        core.handle_packet(id, Packet::Publish(p));
        core.handle_packet(id, Packet::Pingreq);
        assert_eq!(
            drain(&mut rx),
            vec![Outgoing::Packet(Packet::Puback(42)), Outgoing::Packet(Packet::Pingresp)]
        );
    }

    #[test]
    fn will_published_once_on_teardown() {
        let mut core = BrokerCore::new();
        let mut events = core.observe();
        let (watcher, mut wrx) = client(&mut core);
        subscribe(&mut core, watcher, "status/#");
        drain(&mut wrx);

        let (tx, mut rx) = mpsc::channel(8);
        let id = core.register(tx);
        core.handle_packet(
            id,
            connect_packet(Some(Will {
                topic: "status/dev".to_owned(),
                payload: b"offline".to_vec(),
                qos: 0,
                retain: true,
            })),
        );
        core.teardown(id);
        core.teardown(id);
        core.handle_packet(id, Packet::Pingreq);

        let got = published(&mut wrx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"offline");
        assert!(core.retained("status/dev").is_none());
        assert_eq!(drain(&mut rx).last(), Some(&Outgoing::Close));

        let events: Vec<BrokerEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        let disconnects = events
            .iter()
            .filter(|e| matches!(e, BrokerEvent::Disconnected { client } if *client == id))
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(core.client_count(), 1);
    }

    #[test]
    fn protocol_violations_close() {
        let mut core = BrokerCore::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = core.register(tx);
        core.handle_packet(id, Packet::Pingreq);
        assert_eq!(drain(&mut rx), vec![Outgoing::Close]);

        let (id, mut rx) = client(&mut core);
        core.handle_packet(id, connect_packet(None));
        assert_eq!(drain(&mut rx), vec![Outgoing::Close]);
        assert_eq!(core.client_count(), 0);
    }

    #[test]
    fn slow_client_dropped() {
        let mut core = BrokerCore::new();
        let (tx, _rx) = mpsc::channel(2);
        let id = core.register(tx);
        core.handle_packet(id, connect_packet(None));
        subscribe(&mut core, id, "#");
        // connack and suback filled the queue
        core.publish(None, Publish::new("t", "x", false));
        assert_eq!(core.client_count(), 0);
    }

    #[tokio::test]
    async fn local_clients() {
        let cancel = tokio_util::sync::CancellationToken::new();
        let broker = start(Limits::default(), cancel.clone());
        let mut events = broker.observe().await.unwrap();

        let mut a = broker.local_client().await.unwrap();
        a.connect("a", None).await.unwrap();
        a.subscribe(&["hub/+/set".to_owned()]).await.unwrap();

        let mut b = broker.local_client().await.unwrap();
        b.connect("b", None).await.unwrap();
        b.publish("hub/x/set", "ON", false).await.unwrap();

        let got = a.recv().await.unwrap();
        assert_eq!(got.topic, "hub/x/set");
        assert_eq!(got.payload, b"ON");

        assert!(matches!(events.recv().await, Some(BrokerEvent::Connected { .. })));
        assert!(matches!(events.recv().await, Some(BrokerEvent::Connected { .. })));
        match events.recv().await {
            Some(BrokerEvent::Published { client, publish }) => {
                assert_eq!(client, Some(b.id()));
                assert_eq!(publish.topic, "hub/x/set");
            }
            other => panic!("unexpected event {:?}", other),
        }

        broker.close(a.id()).await.unwrap();
        assert_eq!(a.recv().await, None);
        cancel.cancel();
    }
}
