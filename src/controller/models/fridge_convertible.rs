//! Refrigerator with a convertible drawer, reports a 68 byte status block.

use serde_json::{json, Value as Json};

use super::fridge::{self, Unit, TEMP_UNIT};
use super::ModelProfile;
use crate::controller::codec::{AabbStatusCodec, RegisterCodec};
use crate::devman::DeviceMetadata;
use crate::discovery;
use crate::fields::{Attach, FieldDef, FieldEngine, Value, WriteValue};

const STATUS_LEN: usize = 68;
const FLEX_SETPOINT: u16 = 13;

const FLEX_OPTIONS: [&str; 5] = ["Chilled Wine", "Deli/Snacks", "Cold Drink", "Meat/Seafood", "Freezer"];

/// Write block, bytes outside the written registers keep these values.
const WRITE_TEMPLATE: &[u8] = &[
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00,
    0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0x1e, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x0a, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff,
];

pub static PROFILE: ModelProfile = ModelProfile {
    model_id: "2REF11EIDA__4",
    platform: "device",
    fields,
    discovery: discovery_document,
    codec,
};

fn fields() -> Vec<FieldDef> {
    let mut fields = fridge::setpoint_fields();
    // drawer modes are numbered from 1
    fields.push(
        FieldDef::new(FLEX_SETPOINT, "flex_setpoint")
            .read(|_, raw| {
                let i = usize::try_from(raw).ok()?.checked_sub(1)?;
                FLEX_OPTIONS.get(i).map(|o| Value::from(*o))
            })
            .write(|_, v| {
                let i = FLEX_OPTIONS.iter().position(|o| *o == v)?;
                Some(WriteValue::Raw(i as u32 + 1))
            })
            .attach(Attach::Static(&[TEMP_UNIT])),
    );
    fields
}

fn discovery_document(meta: &DeviceMetadata, engine: &FieldEngine) -> Option<Json> {
    let unit = Unit::of(engine.state())?;
    Some(discovery::device(
        meta,
        "LG Fridge",
        json!({
            "fridge_setpoint": fridge::number("Fridge temperature", "fridge_setpoint", unit.fridge_range()),
            "freezer_setpoint": fridge::number("Freezer temperature", "freezer_setpoint", unit.freezer_range()),
            "flex_setpoint": {
                "platform": "select",
                "icon": "mdi:thermometer",
                "unique_id": "$deviceid-flex_setpoint",
                "state_topic": "$this/flex_setpoint",
                "command_topic": "$this/flex_setpoint/set",
                "name": "Convertible",
                "options": FLEX_OPTIONS,
            },
            "door": fridge::door(),
        }),
    ))
}

fn codec() -> Box<dyn RegisterCodec> {
    Box::new(AabbStatusCodec::new(STATUS_LEN, fridge::START).with_write_template(WRITE_TEMPLATE))
}
