//! Local replacement for the vendor cloud of connected home appliances
//!
//! Appliances are pointed at this host instead of the vendor servers. They connect to the
//! built-in MQTT broker (or, for the older generation, to the legacy TCP port), go through
//! the provisioning handshake and are then bridged to a home automation hub over the same
//! broker. Following are main parts of api:
//! - [broker](broker) - minimal MQTT 3.1.1 broker. [broker::start] spawns the broker task and
//!                      returns a [BrokerHandle](broker::BrokerHandle), [broker::server::serve]
//!                      accepts socket clients. In-process clients use [broker::LocalClient].
//! - [DeviceManager](devman::DeviceManager) - watches broker traffic, answers the provisioning
//!                      handshake and binds connections to [Device](devman::Device)s.
//! - [LegacyManager](legacy::LegacyManager) - same for appliances using length-prefixed JSON over TCP.
//! - [DeviceController](controller::DeviceController) - per-model translation between device
//!                      payloads and named properties, built from [fields] tables.
//! - [Bridge](bridge::Bridge) - publishes discovery documents and properties, forwards writes.
//! - [setup] - hands Wi-Fi credentials to appliances in access point mode.
//! - [tlv], [crc16], [frame] - codecs of the appliance wire formats.
//!
//! Example running the broker with the provisioning device manager:
//! ```no_run
//! # use cloudless::{broker, bridge::{Bridge, BridgeConfig}, clip::TopicTemplates, devman::DeviceManager};
//! # use anyhow::Result;
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let cancel = tokio_util::sync::CancellationToken::new();
//! let broker = broker::start(broker::Limits::default(), cancel.clone());
//! let (dm, devices) = DeviceManager::new(broker.clone(), TopicTemplates::default(), 64);
//! tokio::spawn(dm.run(broker.observe().await?, cancel.clone()));
//!
//! let bridge = Bridge::connect(&broker, BridgeConfig::default()).await?;
//! bridge.add_source(devices);
//! tokio::spawn(bridge.run(cancel.clone()));
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:1883").await?;
//! broker::server::serve(listener, broker, cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod broker;
pub mod certs;
pub mod clip;
pub mod config;
pub mod controller;
pub mod crc16;
pub mod devman;
pub mod discovery;
pub mod fields;
pub mod frame;
pub mod legacy;
pub mod setup;
pub mod tlv;
