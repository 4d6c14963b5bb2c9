//! JSON messages exchanged with broker-attached ("clip") appliances.

use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipMessage {
    pub did: String,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<serde_json::Value>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<i64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ClipMessage {
    /// `data.appInfo.<key>` as string
    pub fn app_info(&self, key: &str) -> Option<&str> {
        self.data.get("appInfo")?.get(key)?.as_str()
    }
}

/// Topic templates, `{id}` is replaced by device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicTemplates {
    pub message: String,
    pub provisioning: String,
    pub device: String,
}

impl Default for TopicTemplates {
    fn default() -> Self {
        Self {
            message: "clip/message/devices/{id}".to_owned(),
            provisioning: "clip/provisioning/devices/{id}".to_owned(),
            device: "lime/devices/{id}".to_owned(),
        }
    }
}

impl TopicTemplates {
    pub fn message(&self, id: &str) -> String {
        self.message.replace("{id}", id)
    }

    pub fn provisioning(&self, id: &str) -> String {
        self.provisioning.replace("{id}", id)
    }

    /// Topic the device listens on.
    pub fn device(&self, id: &str) -> String {
        self.device.replace("{id}", id)
    }
}

/// Strip anything in front of the `clip/` segment. Topics without it are not clip traffic.
pub fn normalize_topic(topic: &str) -> Option<&str> {
    if topic.starts_with("clip/") {
        return Some(topic);
    }
    topic.rfind("/clip/").map(|i| &topic[i + 1..])
}

/// Some firmwares terminate JSON with NUL.
pub fn trim_nul(payload: &[u8]) -> &[u8] {
    match payload.split_last() {
        Some((0, rest)) => rest,
        _ => payload,
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Acknowledgment for `preDeploy`/`deploy`, telling the device where to talk from now on.
pub fn deploy_response(deploy: &ClipMessage, topics: &TopicTemplates) -> serde_json::Value {
    json!({
        "did": deploy.did,
        "mid": now_ms(),
        "cmd": "completeProvisioning",
        "type": 0,
        "data": {
            "result": 0,
            "host": "message",
            "appInfo": {
                "host": "message",
                "publication": {
                    "message": topics.message(&deploy.did),
                    // firmware caches this one and reuses it on the next provisioning
                    "provisioning": topics.provisioning(&deploy.did),
                }
            },
            "provisioningType": deploy.cmd,
            "deployInterval": 600,
        }
    })
}

/// Wrap binary payload for delivery to device.
pub fn packet_message(did: &str, payload: &[u8]) -> serde_json::Value {
    json!({
        "did": did,
        "mid": now_ms(),
        "cmd": "packet",
        "type": 1,
        "data": hex::encode(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::{deploy_response, normalize_topic, packet_message, trim_nul, ClipMessage, TopicTemplates};

    #[test]
    fn parse_deploy() {
        let raw = br#"{"did":"abc","mid":17,"cmd":"deploy","type":0,"data":{"appInfo":{"modelName":"RAC_056905_WW","softVer":"1.2"}}}"#;
        let m: ClipMessage = serde_json::from_slice(raw).unwrap();
        assert_eq!(m.did, "abc");
        assert_eq!(m.cmd, "deploy");
        assert_eq!(m.app_info("modelName"), Some("RAC_056905_WW"));
        assert_eq!(m.app_info("softVer"), Some("1.2"));
        assert_eq!(m.app_info("missing"), None);
    }

    #[test]
    fn deploy_response_fields() {
        let m: ClipMessage = serde_json::from_str(r#"{"did":"abc","cmd":"preDeploy"}"#).unwrap();
        let r = deploy_response(&m, &TopicTemplates::default());
        assert_eq!(r["did"], "abc");
        assert_eq!(r["cmd"], "completeProvisioning");
        assert_eq!(r["type"], 0);
        assert_eq!(r["data"]["result"], 0);
        assert_eq!(r["data"]["provisioningType"], "preDeploy");
        assert_eq!(r["data"]["deployInterval"], 600);
        assert_eq!(r["data"]["appInfo"]["publication"]["message"], "clip/message/devices/abc");
        assert_eq!(r["data"]["appInfo"]["publication"]["provisioning"], "clip/provisioning/devices/abc");
    }

    #[test]
    fn packet_wrapping() {
        let m = packet_message("abc", &[0x01, 0xff]);
        assert_eq!(m["cmd"], "packet");
        assert_eq!(m["type"], 1);
        assert_eq!(m["data"], "01ff");
    }

    #[test]
    fn topics() {
        assert_eq!(normalize_topic("clip/message/devices/x"), Some("clip/message/devices/x"));
        assert_eq!(normalize_topic("$aws/things/x/clip/message/devices/x"), Some("clip/message/devices/x"));
        assert_eq!(normalize_topic("hub/x/power"), None);
        assert_eq!(trim_nul(b"{}\0"), b"{}");
        assert_eq!(trim_nul(b"{}"), b"{}");
        assert_eq!(trim_nul(b""), b"");
    }

    #[test]
    fn firmware_listens_on_lime_topic() {
        let t = TopicTemplates::default();
        assert_eq!(t.device("d1"), "lime/devices/d1");
        assert_eq!(t.message("d1"), "clip/message/devices/d1");
        assert_eq!(t.provisioning("d1"), "clip/provisioning/devices/d1");
    }
}
