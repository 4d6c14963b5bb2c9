//! Bridge between bound devices and the automation hub.
//!
//! The bridge is a client of the built-in broker, or of an external one when a hub url
//! is configured. It publishes discovery documents and device properties, and turns
//! `<prefix>/<id>/<property>/set` messages into property writes. Every device gets its
//! own task which owns the [DeviceController].

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::broker::packet::Publish;
use crate::broker::BrokerHandle;
use crate::controller::{DeviceController, Update};
use crate::devman::{Device, NewDevice};
use crate::discovery;
use crate::fields::Value;

mod link;

use link::{HubEvent, Link, Outbound};

const TARGET: &str = "status";
const COMMAND_QUEUE: usize = 16;
const OUTBOUND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// root of property and command topics
    pub prefix: String,
    pub discovery_prefix: String,
    /// external broker of the hub, `mqtt://host[:port]` or `mqtts://host[:port]`
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            prefix: "cloudless".to_owned(),
            discovery_prefix: "homeassistant".to_owned(),
            url: None,
            username: None,
            password: None,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.url {
            link::parse_url(url)?;
        }
        Ok(())
    }

    fn availability_topic(&self) -> String {
        format!("{}/availability", self.prefix)
    }

    fn status_topic(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    fn device_topic(&self, id: &str) -> String {
        format!("{}/{}", self.prefix, id)
    }
}

/// Publishing side shared by the device tasks.
#[derive(Clone)]
struct Hub {
    config: BridgeConfig,
    outbound: mpsc::Sender<Outbound>,
}

impl Hub {
    async fn send(&self, out: Outbound) -> Result<()> {
        self.outbound
            .send(out)
            .await
            .map_err(|_| anyhow::anyhow!("hub link is gone"))
    }

    async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, retain: bool) -> Result<()> {
        self.send(Outbound::Publish(Publish::new(topic, payload, retain))).await
    }

    async fn publish_property(&self, id: &str, property: &str, value: &Value) {
        let topic = format!("{}/{}", self.config.device_topic(id), property);
        if let Err(e) = self.publish(&topic, value.to_string(), true).await {
            log::warn!(target: TARGET, "can't publish {}: {:#}", topic, e);
        }
    }

    async fn publish_availability(&self, id: &str, online: bool) {
        let topic = format!("{}/availability", self.config.device_topic(id));
        let payload = if online { "online" } else { "offline" };
        if let Err(e) = self.publish(&topic, payload, false).await {
            log::warn!(target: TARGET, "can't publish {}: {:#}", topic, e);
        }
    }

    /// Publish discovery document followed by device availability.
    async fn publish_config(&self, id: &str, platform: &str, doc: &Json) {
        let this = self.config.device_topic(id);
        let doc = discovery::substitute(
            doc,
            &[("$this", &this), ("$prefix", &self.config.prefix), ("$deviceid", id)],
        );
        let topic = discovery::config_topic(&self.config.discovery_prefix, platform, id);
        log::info!(target: TARGET, "announcing {} at {}", id, topic);
        if let Err(e) = self.publish(&topic, doc.to_string(), false).await {
            log::warn!(target: TARGET, "can't publish {}: {:#}", topic, e);
            return;
        }
        self.publish_availability(id, true).await;
    }
}

enum DeviceCommand {
    Set { property: String, value: String },
    PublishConfig,
}

struct DeviceEntry {
    generation: u64,
    commands: mpsc::Sender<DeviceCommand>,
    cancel: CancellationToken,
}

pub struct Bridge {
    hub: Hub,
    /// started by [Bridge::run]
    link: Option<Link>,
    events: mpsc::Receiver<HubEvent>,
    devices: HashMap<String, DeviceEntry>,
    /// devices whose availability this bridge instance owns
    published_availability: HashSet<String>,
    next_generation: u64,
    new_tx: mpsc::UnboundedSender<NewDevice>,
    new_rx: mpsc::UnboundedReceiver<NewDevice>,
    gone_tx: mpsc::UnboundedSender<(String, u64)>,
    gone_rx: mpsc::UnboundedReceiver<(String, u64)>,
}

impl Bridge {
    /// Connect to the hub broker. On the built-in broker the bridge is subscribed and
    /// announced as online when this returns, an external broker is connected by [Bridge::run].
    pub async fn connect(broker: &BrokerHandle, config: BridgeConfig) -> Result<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        if let Some(url) = &config.url {
            log::info!(target: TARGET, "bridging to hub broker at {}", url);
        }
        let link = Link::connect(broker, &config, outbound_rx, events_tx).await?;
        let (new_tx, new_rx) = mpsc::unbounded_channel();
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        Ok(Self {
            hub: Hub {
                config,
                outbound: outbound_tx,
            },
            link: Some(link),
            events: events_rx,
            devices: HashMap::new(),
            published_availability: HashSet::new(),
            next_generation: 1,
            new_tx,
            new_rx,
            gone_tx,
            gone_rx,
        })
    }

    /// Consume devices bound by a device manager.
    pub fn add_source(&self, mut source: mpsc::UnboundedReceiver<NewDevice>) {
        let tx = self.new_tx.clone();
        tokio::spawn(async move {
            while let Some(d) = source.recv().await {
                if tx.send(d).is_err() {
                    break;
                }
            }
        });
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        if let Some(link) = self.link.take() {
            tokio::spawn(link.run());
        }
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(HubEvent::Message(msg)) => self.handle_message(msg).await,
                    Some(HubEvent::Connected) => self.session_started().await,
                    Some(HubEvent::Lost) => log::warn!(target: TARGET, "hub connection lost"),
                    None => {
                        log::warn!(target: TARGET, "hub link stopped");
                        break;
                    }
                },
                Some(new) = self.new_rx.recv() => self.add_device(new),
                Some((id, generation)) = self.gone_rx.recv() => self.remove_device(&id, generation),
                _ = cancel.cancelled() => break,
            }
        }
        for (_, entry) in self.devices.drain() {
            entry.cancel.cancel();
        }
        let topic = self.hub.config.availability_topic();
        self.hub.publish(&topic, "offline", true).await?;
        let (done, closed) = oneshot::channel();
        self.hub.send(Outbound::Close(done)).await?;
        _ = closed.await;
        Ok(())
    }

    /// Subscriptions and announcements of a new hub session. Devices announce themselves
    /// again since the hub may have missed their documents.
    async fn session_started(&mut self) {
        log::info!(target: TARGET, "hub session started, announcing {} devices", self.devices.len());
        let config = &self.hub.config;
        let subscribed = self.hub.send(Outbound::Subscribe(link::subscriptions(config))).await;
        if let Err(e) = subscribed.and(self.hub.publish(&config.availability_topic(), "online", true).await) {
            log::warn!(target: TARGET, "can't start hub session: {:#}", e);
            return;
        }
        for entry in self.devices.values() {
            _ = entry.commands.try_send(DeviceCommand::PublishConfig);
        }
    }

    async fn handle_message(&mut self, msg: Publish) {
        let config = &self.hub.config;
        let payload = String::from_utf8_lossy(&msg.payload);
        if msg.topic == config.status_topic() {
            if payload == "online" {
                log::info!(target: TARGET, "hub online, republishing {} devices", self.devices.len());
                for entry in self.devices.values() {
                    _ = entry.commands.try_send(DeviceCommand::PublishConfig);
                }
            }
            return;
        }
        let Some(rest) = msg.topic.strip_prefix(&config.prefix).and_then(|r| r.strip_prefix('/')) else {
            return;
        };
        let path: Vec<&str> = rest.split('/').collect();
        match path.as_slice() {
            [id, property, "set"] => {
                let Some(entry) = self.devices.get(*id) else {
                    log::debug!(target: TARGET, "set for unknown device {}", id);
                    return;
                };
                let cmd = DeviceCommand::Set {
                    property: property.to_string(),
                    value: payload.into_owned(),
                };
                if entry.commands.try_send(cmd).is_err() {
                    log::warn!(target: TARGET, "device {} busy, dropping write of {}", id, property);
                }
            }
            // stale retained state from a previous run
            [id, "availability"] if msg.retain && payload == "online" => {
                if !self.published_availability.contains(*id) {
                    log::debug!(target: TARGET, "clearing stale availability of {}", id);
                    if let Err(e) = self.hub.publish(&msg.topic, "offline", true).await {
                        log::warn!(target: TARGET, "can't clear {}: {:#}", msg.topic, e);
                    }
                }
            }
            _ => {}
        }
    }

    fn add_device(&mut self, new: NewDevice) {
        let NewDevice { device, meta } = new;
        let id = meta.id.clone();
        let controller = match DeviceController::new(meta, device.sender()) {
            Ok(c) => c,
            Err(e) => {
                log::warn!(target: TARGET, "not attaching {}: {}", id, e);
                return;
            }
        };
        if let Some(old) = self.devices.remove(&id) {
            log::debug!(target: TARGET, "replacing controller of {}", id);
            old.cancel.cancel();
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();
        self.devices.insert(
            id.clone(),
            DeviceEntry {
                generation,
                commands: tx,
                cancel: cancel.clone(),
            },
        );
        self.published_availability.insert(id);
        tokio::spawn(run_device(
            controller,
            device,
            rx,
            cancel,
            self.hub.clone(),
            self.gone_tx.clone(),
            generation,
        ));
    }

    fn remove_device(&mut self, id: &str, generation: u64) {
        if self.devices.get(id).map(|e| e.generation) == Some(generation) {
            self.devices.remove(id);
        }
    }
}

async fn publish_updates(hub: &Hub, controller: &DeviceController, updates: Vec<Update>) {
    for u in updates {
        match u {
            Update::Property(name, value) => hub.publish_property(controller.id(), name, &value).await,
            Update::Discovery(doc) => hub.publish_config(controller.id(), controller.platform(), &doc).await,
        }
    }
}

async fn run_device(
    mut controller: DeviceController,
    mut device: Device,
    mut commands: mpsc::Receiver<DeviceCommand>,
    cancel: CancellationToken,
    hub: Hub,
    gone: mpsc::UnboundedSender<(String, u64)>,
    generation: u64,
) {
    let id = controller.id().to_owned();
    if let Some(doc) = controller.discovery() {
        hub.publish_config(&id, controller.platform(), doc).await;
    }
    if let Err(e) = controller.start().await {
        log::warn!(target: TARGET, "can't start {}: {:#}", id, e);
    }
    loop {
        tokio::select! {
            payload = device.recv() => match payload {
                Some(payload) => {
                    let updates = controller.handle_payload(&payload);
                    publish_updates(&hub, &controller, updates).await;
                }
                None => {
                    log::info!(target: TARGET, "device {} went away", id);
                    hub.publish_availability(&id, false).await;
                    break;
                }
            },
            cmd = commands.recv() => match cmd {
                Some(DeviceCommand::Set { property, value }) => {
                    if let Err(e) = controller.set_property(&property, &value).await {
                        log::warn!(target: TARGET, "{} set {}={}: {:#}", id, property, value, e);
                    }
                }
                Some(DeviceCommand::PublishConfig) => {
                    if let Some(doc) = controller.discovery() {
                        hub.publish_config(&id, controller.platform(), doc).await;
                    }
                }
                None => break,
            },
            // replaced by a newer connection or shutting down
            _ = cancel.cancelled() => break,
        }
    }
    _ = gone.send((id, generation));
}
