//! Window air conditioner, same TLV registers as the split unit with fewer modes.

use serde_json::{json, Value as Json};

use super::{name_of, raw_of, ModelProfile};
use crate::controller::codec::{ClipTlvCodec, RegisterCodec};
use crate::devman::DeviceMetadata;
use crate::discovery;
use crate::fields::{Attach, FieldDef, FieldEngine, RawState, ReadEffect, Value, WriteValue};

const CURRENT_TEMPERATURE: u16 = 0x1fd;
const POWER: u16 = 0x1f7;
const MODE: u16 = 0x1f9;
const FAN_MODE: u16 = 0x1fa;
const TEMPERATURE: u16 = 0x1fe;
const SWING_MODE: u16 = 0x322;

const MODES: &[(&str, u32)] = &[("cool", 0), ("fan_only", 2), ("heat", 4)];
const FAN_MODES: &[(&str, u32)] = &[("low", 2), ("high", 6)];
const SWING_MODES: &[(&str, u32)] = &[("on", 100), ("off", 0)];

const MIN_TEMPERATURE: f64 = 16.0;
const MAX_TEMPERATURE: f64 = 30.0;

pub static PROFILE: ModelProfile = ModelProfile {
    model_id: "WIN_056905_WW",
    platform: "climate",
    fields,
    discovery: discovery_document,
    codec,
};

fn half(_: &RawState, raw: u32) -> Option<Value> {
    Some(Value::Num(raw as f64 / 2.0))
}

fn mode_read(state: &RawState, raw: u32) -> Option<Value> {
    if state.get(&POWER) == Some(&0) {
        return Some("off".into());
    }
    name_of(MODES, raw)
}

fn mode_write(_: &RawState, v: &str) -> Option<WriteValue> {
    if v == "off" {
        return Some(WriteValue::Redirect {
            property: "power",
            value: "OFF".to_owned(),
        });
    }
    // the unit also accepts dry, it just never reports it
    if v == "dry" {
        return Some(WriteValue::Raw(8));
    }
    raw_of(MODES, v)
}

/// Picking a mode also switches the unit on.
fn mode_send(state: &RawState, raw: u32) -> Vec<(u16, u32)> {
    let mut out = vec![(POWER, 1), (MODE, raw)];
    for id in [FAN_MODE, TEMPERATURE, SWING_MODE] {
        if let Some(v) = state.get(&id) {
            out.push((id, *v));
        }
    }
    out
}

fn temperature_write(_: &RawState, v: &str) -> Option<WriteValue> {
    let t: f64 = v.trim().parse().ok()?;
    if t.is_nan() {
        return None;
    }
    let t = t.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE);
    Some(WriteValue::Raw((t * 2.0).round() as u32))
}

fn fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new(CURRENT_TEMPERATURE, "current_temperature")
            .read_only()
            .read(half),
        FieldDef::new(TEMPERATURE, "temperature")
            .read(half)
            .write(temperature_write)
            .attach(Attach::Static(&[MODE, FAN_MODE])),
        // power is shown through mode
        FieldDef::new(POWER, "power")
            .write_only()
            .read(|_, raw| Some(Value::on_off(raw != 0)))
            .write(|_, v| Some(WriteValue::Raw((v == "ON") as u32)))
            .attach(Attach::Dynamic(|raw| if raw != 0 { vec![MODE] } else { Vec::new() }))
            .on_read(|_, _| vec![ReadEffect::Reprocess(MODE)]),
        FieldDef::new(MODE, "mode")
            .read(mode_read)
            .write(mode_write)
            .on_write(mode_send),
        FieldDef::new(FAN_MODE, "fan_mode")
            .read(|_, raw| name_of(FAN_MODES, raw))
            .write(|_, v| raw_of(FAN_MODES, v))
            .attach(Attach::Static(&[MODE, TEMPERATURE])),
        FieldDef::new(SWING_MODE, "swing_mode")
            .read(|_, raw| name_of(SWING_MODES, raw))
            .write(|_, v| raw_of(SWING_MODES, v))
            .attach(Attach::Static(&[MODE, FAN_MODE])),
    ]
}

fn discovery_document(meta: &DeviceMetadata, engine: &FieldEngine) -> Option<Json> {
    let mut doc = discovery::component(meta, "LG Air Conditioner");
    doc.insert("temperature_unit".to_owned(), json!("C"));
    doc.insert("temp_step".to_owned(), json!(0.5));
    doc.insert("precision".to_owned(), json!(0.5));
    doc.insert("modes".to_owned(), json!(["off", "cool", "fan_only", "heat"]));
    doc.insert("fan_modes".to_owned(), json!(["low", "high"]));
    doc.insert("swing_modes".to_owned(), json!(["on", "off"]));
    doc.extend(engine.discovery_topics());
    Some(Json::Object(doc))
}

fn codec() -> Box<dyn RegisterCodec> {
    Box::new(ClipTlvCodec)
}
