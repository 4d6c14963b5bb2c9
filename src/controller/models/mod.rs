//! Per-model configuration tables.

mod fridge;
mod fridge_convertible;
mod rac_056905_ww;
mod washer;
mod washer_front;
mod win_056905_ww;

use serde_json::Value;

use super::codec::RegisterCodec;
use crate::devman::DeviceMetadata;
use crate::fields::{FieldDef, FieldEngine};

pub struct ModelProfile {
    pub model_id: &'static str,
    /// discovery platform (`climate`, `device`, ...)
    pub platform: &'static str,
    pub fields: fn() -> Vec<FieldDef>,
    /// Discovery document, `None` while it cannot be built yet.
    pub discovery: fn(&DeviceMetadata, &FieldEngine) -> Option<Value>,
    pub codec: fn() -> Box<dyn RegisterCodec>,
}

static PROFILES: [&ModelProfile; 6] = [
    &rac_056905_ww::PROFILE,
    &win_056905_ww::PROFILE,
    &fridge::PROFILE,
    &fridge_convertible::PROFILE,
    &washer::PROFILE,
    &washer_front::PROFILE,
];

pub fn lookup(model_id: &str) -> Option<&'static ModelProfile> {
    PROFILES.iter().copied().find(|p| p.model_id == model_id)
}

pub fn supported() -> impl Iterator<Item = &'static str> {
    PROFILES.iter().map(|p| p.model_id)
}

/// Map raw value to name using table.
fn name_of(table: &[(&'static str, u32)], raw: u32) -> Option<crate::fields::Value> {
    table
        .iter()
        .find(|(_, r)| *r == raw)
        .map(|(n, _)| crate::fields::Value::from(*n))
}

fn raw_of(table: &[(&'static str, u32)], name: &str) -> Option<crate::fields::WriteValue> {
    table
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, r)| crate::fields::WriteValue::Raw(*r))
}
