//! Split air conditioner speaking TLV registers.

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
const VERTICAL_SWING_MODE: u16 = 0x321;
const SWING_MODE: u16 = 0x322;

const MODES: &[(&str, u32)] = &[("cool", 0), ("dry", 1), ("fan_only", 2), ("heat", 4), ("auto", 6)];
const FAN_MODES: &[(&str, u32)] = &[
    ("very low", 2),
    ("low", 3),
    ("medium", 4),
    ("high", 5),
    ("very high", 6),
    ("auto", 8),
];
const SWING_MODES: &[(&str, u32)] = &[
    ("off", 0),
    ("1", 1),
    ("2", 2),
    ("3", 3),
    ("4", 4),
    ("5", 5),
    ("1-3", 13),
    ("3-5", 35),
    ("on", 100),
];
const VERTICAL_SWING_MODES: &[(&str, u32)] = &[
    ("off", 0),
    ("1", 1),
    ("2", 2),
    ("3", 3),
    ("4", 4),
    ("5", 5),
    ("6", 6),
    ("on", 100),
];

pub static PROFILE: ModelProfile = ModelProfile {
    model_id: "RAC_056905_WW",
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
    raw_of(MODES, v)
}

fn power_attach(raw: u32) -> Vec<u16> {
    if raw != 0 {
        vec![MODE, FAN_MODE]
    } else {
        Vec::new()
    }
}

fn fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new(CURRENT_TEMPERATURE, "current_temperature")
            .read_only()
            .read(half),
        // power is shown through mode
        FieldDef::new(POWER, "power")
            .write_only()
            .read(|_, raw| Some(Value::on_off(raw != 0)))
            .write(|_, v| Some(WriteValue::Raw((v == "ON") as u32)))
            .attach(Attach::Dynamic(power_attach))
            .on_read(|_, _| vec![ReadEffect::Reprocess(MODE)]),
        FieldDef::new(MODE, "mode")
            .read(mode_read)
            .write(mode_write)
            .attach(Attach::Static(&[FAN_MODE, TEMPERATURE])),
        FieldDef::new(FAN_MODE, "fan_mode")
            .read(|_, raw| name_of(FAN_MODES, raw))
            .write(|_, v| raw_of(FAN_MODES, v))
            .attach(Attach::Static(&[MODE, TEMPERATURE])),
        FieldDef::new(TEMPERATURE, "temperature")
            .read(half)
            .write(|_, v| {
                let t: f64 = v.trim().parse().ok()?;
                let raw = (t * 2.0).round();
                (raw >= 0.0).then(|| WriteValue::Raw(raw as u32))
            })
            .attach(Attach::Static(&[MODE, FAN_MODE])),
        FieldDef::new(VERTICAL_SWING_MODE, "vertical_swing_mode")
            .read(|_, raw| name_of(VERTICAL_SWING_MODES, raw))
            .write(|_, v| raw_of(VERTICAL_SWING_MODES, v))
            .attach(Attach::Static(&[MODE, FAN_MODE]))
            .no_autoreg(),
        FieldDef::new(SWING_MODE, "swing_mode")
            .read(|_, raw| name_of(SWING_MODES, raw))
            .write(|_, v| raw_of(SWING_MODES, v))
            .attach(Attach::Static(&[MODE, FAN_MODE])),
    ]
}

fn names(table: &[(&str, u32)]) -> Vec<Json> {
    table.iter().map(|(n, _)| Json::from(*n)).collect()
}

fn discovery_document(meta: &DeviceMetadata, engine: &FieldEngine) -> Option<Json> {
    let mut doc = discovery::component(meta, "LG Air Conditioner");
    doc.insert("temperature_unit".to_owned(), json!("C"));
    doc.insert("temp_step".to_owned(), json!(0.5));
    doc.insert("precision".to_owned(), json!(0.5));
    doc.insert("fan_modes".to_owned(), Json::Array(names(FAN_MODES)));
    doc.insert("swing_modes".to_owned(), Json::Array(names(SWING_MODES)));
    doc.insert(
        "vertical_swing_modes".to_owned(),
        Json::Array(names(VERTICAL_SWING_MODES)),
    );
    doc.extend(engine.discovery_topics());
    Some(Json::Object(doc))
}

fn codec() -> Box<dyn RegisterCodec> {
    Box::new(ClipTlvCodec)
}
