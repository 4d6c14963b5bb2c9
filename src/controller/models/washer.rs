//! Washer on the legacy TCP transport, reports a 28 byte status block.

use serde_json::{json, Value as Json};

use super::ModelProfile;
use crate::controller::codec::{ByteStatusCodec, RegisterCodec};
use crate::devman::DeviceMetadata;
use crate::discovery;
use crate::fields::{FieldDef, FieldEngine, RawState, ReadEffect, Value, WriteValue};

const STATUS_LEN: usize = 28;

const STATE: u16 = 0;
const REMAINING_HOURS: u16 = 11;
const REMAINING_MINUTES: u16 = 12;
const FLAGS: u16 = 15;
const CYCLES: u16 = 21;

const FLAG_REMOTE_START: u32 = 0x02;
const FLAG_DOOR_UNLOCKED: u32 = 0x40;

pub static PROFILE: ModelProfile = ModelProfile {
    model_id: "WTDN3",
    platform: "device",
    fields,
    discovery: discovery_document,
    codec,
};

fn remaining(state: &RawState, raw: u32) -> Option<Value> {
    let hours = state.get(&REMAINING_HOURS).copied().unwrap_or(0);
    Some(Value::from(hours * 60 + raw))
}

fn flags(state: &RawState, _: &Value) -> Vec<ReadEffect> {
    flag_effects(state.get(&FLAGS).copied().unwrap_or(0))
}

pub(super) fn flag_effects(flags: u32) -> Vec<ReadEffect> {
    vec![
        ReadEffect::Publish("remote_start", Value::on_off(flags & FLAG_REMOTE_START != 0)),
        // lock entities read OFF as locked
        ReadEffect::Publish("door_lock", Value::on_off(flags & FLAG_DOOR_UNLOCKED == 0)),
    ]
}

fn fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new(STATE, "power")
            .read(|_, raw| Some(Value::on_off(raw > 0)))
            // the appliance can only be switched off remotely
            .write(|_, v| (v == "OFF").then_some(WriteValue::Raw(0))),
        FieldDef::new(REMAINING_MINUTES, "remaining_time")
            .read_only()
            .read(remaining),
        FieldDef::new(FLAGS, "remote_start").read_only().on_read(flags),
        FieldDef::new(CYCLES, "cycles").read_only(),
    ]
}

fn command(registers: &[(u16, u32)]) -> Option<Json> {
    match registers {
        [(STATE, 0)] => Some(json!({
            "Cmd": "Control",
            "CmdOpt": "Power",
            "Value": "Off",
            "Format": "B64",
            "Data": "",
        })),
        _ => None,
    }
}

fn start() -> Json {
    json!({ "Cmd": "Mon", "CmdOpt": "Start" })
}

pub(super) fn sensor(name: &str, key: &str) -> Json {
    json!({
        "platform": "sensor",
        "unique_id": format!("$deviceid-{}", key),
        "state_topic": format!("$this/{}", key),
        "name": name,
    })
}

pub(super) fn binary_sensor(name: &str, key: &str) -> Json {
    json!({
        "platform": "binary_sensor",
        "unique_id": format!("$deviceid-{}", key),
        "state_topic": format!("$this/{}", key),
        "name": name,
    })
}

fn discovery_document(meta: &DeviceMetadata, _: &FieldEngine) -> Option<Json> {
    let mut door_lock = binary_sensor("Door lock", "door_lock");
    door_lock["device_class"] = json!("lock");
    let mut remaining_time = sensor("Remaining time", "remaining_time");
    remaining_time["device_class"] = json!("duration");
    remaining_time["unit_of_measurement"] = json!("min");
    Some(discovery::device(
        meta,
        "LG Washer",
        json!({
            "power": {
                "platform": "switch",
                "unique_id": "$deviceid-power",
                "state_topic": "$this/power",
                "command_topic": "$this/power/set",
                "name": "Power",
            },
            "cycles": sensor("Cycle count", "cycles"),
            "remote_start": binary_sensor("Remote start", "remote_start"),
            "door_lock": door_lock,
            "remaining_time": remaining_time,
        }),
    ))
}

fn codec() -> Box<dyn RegisterCodec> {
    Box::new(ByteStatusCodec::new(STATUS_LEN, command, start))
}
