use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::clip::ClipMessage;

/// What is known about a device once it is bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub id: String,
    pub model_id: String,
    pub model_name: Option<String>,
    pub firmware: Option<String>,
}

impl DeviceMetadata {
    pub(crate) fn from_deploy(deploy: &ClipMessage) -> Self {
        let model = deploy.app_info("modelName").unwrap_or_default().to_owned();
        Self {
            id: deploy.did.clone(),
            model_name: Some(model.clone()),
            model_id: model,
            firmware: deploy.app_info("softVer").map(str::to_owned),
        }
    }
}

/// Sending half of a bound device, cheap to clone.
#[derive(Clone)]
pub struct DeviceSender {
    id: String,
    tx: mpsc::Sender<Vec<u8>>,
}

impl DeviceSender {
    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| anyhow::anyhow!("device {} connection is gone", self.id))
    }
}

/// Device bound to a live connection.
///
/// Payloads arrive through [Device::recv]. `None` means the connection was closed or
/// taken over by a newer connection of the same device.
pub struct Device {
    id: String,
    inbound: mpsc::Receiver<Vec<u8>>,
    sender: DeviceSender,
}

impl Device {
    pub(crate) fn new(id: &str, inbound: mpsc::Receiver<Vec<u8>>, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id: id.to_owned(),
            inbound,
            sender: DeviceSender {
                id: id.to_owned(),
                tx: outbound,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> DeviceSender {
        self.sender.clone()
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

/// Handed to the bridge for every newly bound device.
pub struct NewDevice {
    pub device: Device,
    pub meta: DeviceMetadata,
}

/// Manager side of a bound device.
pub(crate) struct DeviceLink {
    pub id: String,
    tx: mpsc::Sender<Vec<u8>>,
}

impl DeviceLink {
    /// Create linked pair. Outbound payloads written by the device owner show up on the
    /// returned receiver.
    pub fn create(id: &str, queue: usize) -> (DeviceLink, Device, mpsc::Receiver<Vec<u8>>) {
        let (in_tx, in_rx) = mpsc::channel(queue);
        let (out_tx, out_rx) = mpsc::channel(queue);
        let link = DeviceLink {
            id: id.to_owned(),
            tx: in_tx,
        };
        (link, Device::new(id, in_rx, out_tx), out_rx)
    }

    /// Forward payload, dropped when the consumer does not keep up.
    pub fn deliver(&self, payload: Vec<u8>) {
        if let Err(e) = self.tx.try_send(payload) {
            log::warn!("device {} dropping payload: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceLink, DeviceMetadata};
    use crate::clip::ClipMessage;

    #[test]
    fn metadata_from_deploy() {
        let m: ClipMessage = serde_json::from_str(
            r#"{"did":"d1","cmd":"deploy","data":{"appInfo":{"modelName":"2RES1VE61NFA2","softVer":"3.0"}}}"#,
        )
        .unwrap();
        let meta = DeviceMetadata::from_deploy(&m);
        assert_eq!(meta.id, "d1");
        assert_eq!(meta.model_id, "2RES1VE61NFA2");
        assert_eq!(meta.firmware.as_deref(), Some("3.0"));
    }

    #[tokio::test]
    async fn link_round_trip_and_close() {
        let (link, mut device, mut outbound) = DeviceLink::create("d1", 4);
        link.deliver(vec![1, 2]);
        assert_eq!(device.recv().await, Some(vec![1, 2]));

        device.sender().send(vec![3]).await.unwrap();
        assert_eq!(outbound.recv().await, Some(vec![3]));

        drop(link);
        assert_eq!(device.recv().await, None);
    }
}
