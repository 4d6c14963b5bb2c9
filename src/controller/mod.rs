//! Per-device controllers translating between device payloads and hub properties.
//!
//! A [DeviceController] is created for every bound device whose model has a
//! [profile](models::ModelProfile). It decodes payloads with the model's
//! [codec](codec::RegisterCodec), runs the registers through the model's
//! [FieldEngine] and returns the resulting updates to the caller, which publishes them.

pub mod codec;
pub mod models;

use anyhow::{Context, Result};
use serde_json::Value as Json;

use crate::devman::{DeviceMetadata, DeviceSender};
use crate::fields::{FieldEngine, FieldError, Value};
use codec::RegisterCodec;
use models::ModelProfile;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("unknown device model {0}")]
    UnknownModel(String),
    #[error(transparent)]
    Fields(#[from] FieldError),
}

/// Outcome of a device payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Property(&'static str, Value),
    /// discovery document changed and must be (re)published
    Discovery(Json),
}

pub struct DeviceController {
    meta: DeviceMetadata,
    profile: &'static ModelProfile,
    codec: Box<dyn RegisterCodec>,
    engine: FieldEngine,
    sender: DeviceSender,
    discovery: Option<Json>,
}

impl DeviceController {
    pub fn new(meta: DeviceMetadata, sender: DeviceSender) -> Result<Self, ControllerError> {
        let profile =
            models::lookup(&meta.model_id).ok_or_else(|| ControllerError::UnknownModel(meta.model_id.clone()))?;
        let engine = FieldEngine::new((profile.fields)())?;
        let discovery = (profile.discovery)(&meta, &engine);
        Ok(Self {
            meta,
            profile,
            codec: (profile.codec)(),
            engine,
            sender,
            discovery,
        })
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn meta(&self) -> &DeviceMetadata {
        &self.meta
    }

    pub fn platform(&self) -> &'static str {
        self.profile.platform
    }

    /// Ask device to report its full state.
    pub async fn start(&self) -> Result<()> {
        if let Some(query) = self.codec.start().context("building start query")? {
            log::debug!(target: "outgoing", "{} start {}", self.meta.id, hex::encode(&query));
            self.sender.send(query).await?;
        }
        Ok(())
    }

    /// Current discovery document, `None` until the model can describe itself.
    pub fn discovery(&self) -> Option<&Json> {
        self.discovery.as_ref()
    }

    fn discovery_update(&mut self) -> Option<Update> {
        let doc = (self.profile.discovery)(&self.meta, &self.engine);
        if doc.is_none() || doc == self.discovery {
            return None;
        }
        self.discovery = doc.clone();
        doc.map(Update::Discovery)
    }

    /// Process payload received from device.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Vec<Update> {
        let registers = self.codec.decode(payload);
        log::trace!(target: "incoming", "{} registers {:?}", self.meta.id, registers);
        let mut properties = Vec::new();
        for (id, raw) in registers {
            for (name, value) in self.engine.process_register(id, raw) {
                properties.push(Update::Property(name, value));
            }
        }
        // document first, entities must exist before their state arrives
        let mut out: Vec<Update> = self.discovery_update().into_iter().collect();
        out.extend(properties);
        out
    }

    /// Write property value coming from the hub. The register state only changes
    /// when the write could be encoded.
    pub async fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        let write = self.engine.prepare_write(name, value)?;
        if write.registers.is_empty() {
            return Ok(());
        }
        let payload = self
            .codec
            .encode_write(&write.registers)
            .with_context(|| format!("encoding {}={} for {}", name, value, self.meta.id))?;
        self.engine.commit(write);
        log::debug!(target: "outgoing", "{} {}={} -> {}", self.meta.id, name, value, hex::encode(&payload));
        self.sender.send(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::{ControllerError, DeviceController, Update};
    use crate::devman::{DeviceLink, DeviceMetadata};
    use crate::fields::Value;
    use crate::frame::aabb;
    use crate::tlv::{self, Tlv};

    fn meta(model: &str) -> DeviceMetadata {
        DeviceMetadata {
            id: "d1".to_owned(),
            model_id: model.to_owned(),
            model_name: Some(model.to_owned()),
            firmware: None,
        }
    }

    fn ac_status(records: &[Tlv]) -> Vec<u8> {
        let data = tlv::build(records).unwrap();
        let mut out = vec![0x01, 0x01, 0x04, 0x00, 0x00, 0x00, 0x87, 0x02, 0x04, 0x01, data.len() as u8];
        out.extend(data);
        out.extend([0, 0]);
        out
    }

    #[test]
    fn unknown_model_rejected() {
        let (_link, device, _out) = DeviceLink::create("d1", 4);
        let r = DeviceController::new(meta("NOPE"), device.sender());
        assert!(matches!(r, Err(ControllerError::UnknownModel(m)) if m == "NOPE"));
    }

    #[tokio::test]
    async fn ac_payloads_and_writes() {
        let (_link, device, mut out) = DeviceLink::create("d1", 4);
        let mut c = DeviceController::new(meta("RAC_056905_WW"), device.sender()).unwrap();
        assert_eq!(c.platform(), "climate");
        assert!(c.discovery().is_some());

        c.start().await.unwrap();
        let q = out.recv().await.unwrap();
        assert_eq!(tlv::parse(&q[11..q.len() - 2]), vec![Tlv::new(0x1f5, 2)]);

        let updates = c.handle_payload(&ac_status(&[Tlv::new(0x1f7, 1), Tlv::new(0x1f9, 4), Tlv::new(0x1fa, 3)]));
        assert_eq!(
            updates,
            vec![
                Update::Property("mode", Value::from("heat")),
                Update::Property("fan_mode", Value::from("low")),
            ]
        );

        c.set_property("mode", "off").await.unwrap();
        let w = out.recv().await.unwrap();
        assert_eq!(tlv::parse(&w[11..w.len() - 2]), vec![Tlv::new(0x1f7, 0)]);

        // untranslatable value sends nothing
        c.set_property("fan_mode", "turbo").await.unwrap();
        assert!(out.try_recv().is_err());
        assert!(c.set_property("current_temperature", "1").await.is_err());
    }

    #[tokio::test]
    async fn unencodable_write_keeps_state() {
        let (_link, device, mut out) = DeviceLink::create("d1", 4);
        let mut c = DeviceController::new(meta("RAC_056905_WW"), device.sender()).unwrap();
        c.handle_payload(&ac_status(&[Tlv::new(0x1fe, 44)]));

        // 2 * 9000000 does not fit a tlv value
        assert!(c.set_property("temperature", "9000000").await.is_err());
        assert!(out.try_recv().is_err());
        assert_eq!(c.engine.state().get(&0x1fe), Some(&44));

        c.set_property("temperature", "21").await.unwrap();
        assert!(out.recv().await.is_some());
        assert_eq!(c.engine.state().get(&0x1fe), Some(&42));
    }

    #[tokio::test]
    async fn fridge_discovery_published_once_unit_known() {
        let (_link, device, _out) = DeviceLink::create("d1", 4);
        let mut c = DeviceController::new(meta("2RES1VE61NFA2"), device.sender()).unwrap();
        assert!(c.discovery().is_none());

        let mut inner = vec![0x10, 0xeb];
        inner.extend([0u8; 27]);
        inner[2 + 8] = 1;
        let pkt = aabb::build(&inner).unwrap();
        let updates = c.handle_payload(&pkt);
        assert!(matches!(&updates[0], Update::Discovery(doc) if doc["components"]["fridge_setpoint"]["max"] == 7));
        assert!(updates.len() > 1);

        // same unit, document unchanged
        let updates = c.handle_payload(&pkt);
        assert!(updates.iter().all(|u| !matches!(u, Update::Discovery(_))));
    }
}
