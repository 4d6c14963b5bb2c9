//! Discovery documents announcing devices to the automation hub.
//!
//! Documents are written with placeholders which are substituted at publish time:
//! `$this` (the device topic prefix), `$prefix` (the bus prefix) and `$deviceid`.

use serde_json::{json, Map, Value};

use crate::devman::DeviceMetadata;

pub const ORIGIN: &str = "cloudless";

fn base(meta: &DeviceMetadata, name: &str) -> Map<String, Value> {
    let mut device = Map::new();
    device.insert("identifiers".to_owned(), "$deviceid".into());
    device.insert("manufacturer".to_owned(), "LG".into());
    if let Some(model) = &meta.model_name {
        device.insert("model".to_owned(), model.as_str().into());
    }
    if let Some(fw) = &meta.firmware {
        device.insert("sw_version".to_owned(), fw.as_str().into());
    }
    device.insert("name".to_owned(), name.into());

    let mut doc = Map::new();
    doc.insert(
        "availability".to_owned(),
        json!([{ "topic": "$this/availability" }, { "topic": "$prefix/availability" }]),
    );
    doc.insert("device".to_owned(), Value::Object(device));
    doc.insert(
        "origin".to_owned(),
        json!({ "name": ORIGIN, "sw_version": env!("CARGO_PKG_VERSION") }),
    );
    doc
}

/// Single-entity document, topics of the entity live at the top level.
pub fn component(meta: &DeviceMetadata, name: &str) -> Map<String, Value> {
    let mut doc = base(meta, name);
    doc.insert("name".to_owned(), name.into());
    doc.insert("unique_id".to_owned(), "$deviceid".into());
    doc.insert("object_id".to_owned(), "$deviceid".into());
    doc.insert("optimistic".to_owned(), false.into());
    doc
}

/// Multi-entity document with a `components` map.
pub fn device(meta: &DeviceMetadata, name: &str, components: Value) -> Value {
    let mut doc = base(meta, name);
    doc.insert("components".to_owned(), components);
    Value::Object(doc)
}

/// Replace placeholders in every string of `doc`, keys are left alone.
pub fn substitute(doc: &Value, replacements: &[(&str, &str)]) -> Value {
    match doc {
        Value::String(s) => {
            let mut s = s.clone();
            for (pattern, value) in replacements {
                s = s.replace(pattern, value);
            }
            Value::String(s)
        }
        Value::Array(a) => Value::Array(a.iter().map(|v| substitute(v, replacements)).collect()),
        Value::Object(o) => Value::Object(
            o.iter()
                .map(|(k, v)| (k.clone(), substitute(v, replacements)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn config_topic(discovery_prefix: &str, platform: &str, id: &str) -> String {
    format!("{}/{}/{}/{}/config", discovery_prefix, platform, ORIGIN, id)
}
