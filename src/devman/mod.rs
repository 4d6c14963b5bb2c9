//! Device manager for broker-attached appliances.
//!
//! Watches broker traffic, answers the provisioning handshake the way the vendor cloud
//! would and binds every successfully provisioned connection to a [Device]. Bound devices
//! are handed out through the channel returned by [DeviceManager::new].
//!
//! Per connection the handshake goes through
//! `Unprovisioned -> DeployPending -> Provisioned -> (removed)`.
//! An identity is owned by at most one connection, a device which reconnects while its
//! old connection is still alive takes the identity over and the old connection is closed.
//!
//! ```no_run
//! # use cloudless::{broker, clip::TopicTemplates, devman::DeviceManager};
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let cancel = tokio_util::sync::CancellationToken::new();
//! let broker = broker::start(broker::Limits::default(), cancel.clone());
//! let (dm, mut devices) = DeviceManager::new(broker.clone(), TopicTemplates::default(), 64);
//! tokio::spawn(dm.run(broker.observe().await?, cancel));
//! while let Some(new) = devices.recv().await {
//!     println!("{} is a {}", new.meta.id, new.meta.model_id);
//! }
//! # Ok(())
//! # }
//! ```

mod device;

pub use device::{Device, DeviceMetadata, DeviceSender, NewDevice};
pub(crate) use device::DeviceLink;

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::packet::Publish;
use crate::broker::{BrokerEvent, BrokerHandle, ClientId};
use crate::clip::{self, ClipMessage, TopicTemplates};

const TARGET: &str = "provisioning";

enum ProvisioningState {
    Unprovisioned,
    DeployPending(ClipMessage),
    Provisioned(DeviceLink),
}

pub struct DeviceManager {
    broker: BrokerHandle,
    topics: TopicTemplates,
    queue: usize,
    connections: HashMap<ClientId, ProvisioningState>,
    identities: HashMap<String, ClientId>,
    new_devices: mpsc::UnboundedSender<NewDevice>,
}

impl DeviceManager {
    pub fn new(
        broker: BrokerHandle,
        topics: TopicTemplates,
        queue: usize,
    ) -> (Self, mpsc::UnboundedReceiver<NewDevice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dm = Self {
            broker,
            topics,
            queue,
            connections: HashMap::new(),
            identities: HashMap::new(),
            new_devices: tx,
        };
        (dm, rx)
    }

    /// Process broker events until the broker goes away or `cancel` fires.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<BrokerEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                e = events.recv() => match e {
                    Some(e) => e,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            if let Err(e) = self.handle_event(event).await {
                log::warn!(target: TARGET, "{:#}", e);
            }
        }
    }

    /// Connection currently owning `id`.
    pub fn owner(&self, id: &str) -> Option<ClientId> {
        self.identities.get(id).copied()
    }

    pub async fn handle_event(&mut self, event: BrokerEvent) -> Result<()> {
        match event {
            BrokerEvent::Connected { client, .. } => {
                self.connections.insert(client, ProvisioningState::Unprovisioned);
                Ok(())
            }
            BrokerEvent::Published {
                client: Some(client),
                publish,
            } => self.handle_publish(client, publish).await,
            BrokerEvent::Published { client: None, .. } => Ok(()),
            BrokerEvent::Disconnected { client } => {
                self.disconnected(client);
                Ok(())
            }
        }
    }

    async fn handle_publish(&mut self, client: ClientId, publish: Publish) -> Result<()> {
        let Some(topic) = clip::normalize_topic(&publish.topic) else {
            return Ok(());
        };
        let payload = clip::trim_nul(&publish.payload);
        log::info!(target: "incoming", "{} {}", topic, String::from_utf8_lossy(payload));
        let msg: ClipMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                log::warn!(target: "incoming", "{}: invalid message {} ({})", topic, e, hex::encode(payload));
                return Ok(());
            }
        };

        if topic == self.topics.message(&msg.did) {
            match msg.cmd.as_str() {
                "completeProvisioning_ack" => self.complete_provisioning(client, msg).await?,
                "device_packet" => self.device_packet(client, &msg),
                _ => {}
            }
        } else if topic == self.topics.provisioning(&msg.did) && (msg.cmd == "preDeploy" || msg.cmd == "deploy") {
            self.deploy(client, msg).await?;
        }
        Ok(())
    }

    async fn deploy(&mut self, client: ClientId, msg: ClipMessage) -> Result<()> {
        log::info!(target: TARGET, "{} {} from {}", msg.cmd, msg.did, client);
        let response = clip::deploy_response(&msg, &self.topics);
        let topic = self.topics.device(&msg.did);
        let state = self
            .connections
            .entry(client)
            .or_insert(ProvisioningState::Unprovisioned);
        if let ProvisioningState::Provisioned(_) = state {
            log::debug!(target: TARGET, "{} is already provisioned", msg.did);
        } else {
            *state = ProvisioningState::DeployPending(msg);
        }
        self.broker
            .publish(Publish::new(&topic, response.to_string(), false))
            .await
    }

    async fn complete_provisioning(&mut self, client: ClientId, msg: ClipMessage) -> Result<()> {
        let state = self
            .connections
            .entry(client)
            .or_insert(ProvisioningState::Unprovisioned);
        let deploy = match std::mem::replace(state, ProvisioningState::Unprovisioned) {
            ProvisioningState::DeployPending(deploy) => deploy,
            ProvisioningState::Unprovisioned => {
                log::warn!(target: TARGET, "completeProvisioning_ack from {} without deploy", msg.did);
                return Ok(());
            }
            provisioned => {
                *state = provisioned;
                log::warn!(target: TARGET, "completeProvisioning_ack from {} received twice", msg.did);
                return Ok(());
            }
        };

        if let Some(old) = self.identities.get(&msg.did).copied() {
            if old != client {
                log::warn!(target: TARGET, "device {} already connected, dropping the old connection", msg.did);
                // dropping the link tells the old device object it is closed
                self.connections.remove(&old);
                self.identities.remove(&msg.did);
                self.broker.close(old).await?;
            }
        }

        let (link, device, outbound) = DeviceLink::create(&msg.did, self.queue);
        tokio::spawn(forward_outbound(
            outbound,
            self.broker.clone(),
            self.topics.device(&msg.did),
            msg.did.clone(),
        ));
        self.identities.insert(msg.did.clone(), client);
        self.connections
            .insert(client, ProvisioningState::Provisioned(link));

        let mut meta = DeviceMetadata::from_deploy(&deploy);
        meta.id = msg.did.clone();
        log::info!(target: TARGET, "device {} ({}) provisioned on {}", meta.id, meta.model_id, client);
        if self.new_devices.send(NewDevice { device, meta }).is_err() {
            log::warn!(target: TARGET, "nobody is listening for new devices");
        }
        Ok(())
    }

    fn device_packet(&mut self, client: ClientId, msg: &ClipMessage) {
        let Some(ProvisioningState::Provisioned(link)) = self.connections.get(&client) else {
            log::debug!(target: TARGET, "device_packet from unbound {}", client);
            return;
        };
        if link.id != msg.did {
            log::debug!(target: TARGET, "device_packet for {} on connection of {}", msg.did, link.id);
            return;
        }
        match msg.data.as_str().map(hex::decode) {
            Some(Ok(data)) => link.deliver(data),
            _ => log::warn!(target: "incoming", "{}: device_packet without hex data", msg.did),
        }
    }

    fn disconnected(&mut self, client: ClientId) {
        let Some(state) = self.connections.remove(&client) else {
            return;
        };
        if let ProvisioningState::Provisioned(link) = state {
            if self.identities.get(&link.id) == Some(&client) {
                self.identities.remove(&link.id);
            }
            log::info!(target: TARGET, "device {} disconnected", link.id);
        }
    }
}

async fn forward_outbound(mut rx: mpsc::Receiver<Vec<u8>>, broker: BrokerHandle, topic: String, did: String) {
    while let Some(payload) = rx.recv().await {
        log::debug!(target: "outgoing", "{} {}", did, hex::encode(&payload));
        let msg = clip::packet_message(&did, &payload);
        if let Err(e) = broker.publish(Publish::new(&topic, msg.to_string(), false)).await {
            log::warn!(target: TARGET, "{}: {:#}", did, e);
            break;
        }
    }
}
