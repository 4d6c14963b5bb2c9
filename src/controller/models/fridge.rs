//! Refrigerators reporting a status block in `AA ... BB` frames.
//!
//! Setpoints are stored as offsets from a unit dependent base, the same conversion
//! works in both directions. This module holds the 27 byte model with express modes
//! and the setpoint handling shared with [convertible](super::fridge_convertible).

use serde_json::{json, Value as Json};

use super::ModelProfile;
use crate::controller::codec::{AabbStatusCodec, RegisterCodec};
use crate::devman::DeviceMetadata;
use crate::discovery;
use crate::fields::{Attach, FieldDef, FieldEngine, RawState, ReadEffect, Value, WriteValue};

const STATUS_LEN: usize = 27;
pub(super) const START: &[u8] = &[0xf0, 0xed, 0x12, 0x11, 0x01, 0x00, 0x00, 0x01, 0x04, 0x00];

const FRIDGE_SETPOINT: u16 = 1;
const FREEZER_SETPOINT: u16 = 2;
const DOOR_OPEN: u16 = 7;
pub(super) const TEMP_UNIT: u16 = 8;
const EXPRESS_COOL: u16 = 16;

pub static PROFILE: ModelProfile = ModelProfile {
    model_id: "2RES1VE61NFA2",
    platform: "device",
    fields,
    discovery: discovery_document,
    codec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Unit {
    Celsius,
    Fahrenheit,
}

pub(super) struct Range {
    unit: &'static str,
    min: i64,
    max: i64,
}

impl Unit {
    /// Unit register: zero is Fahrenheit, anything else Celsius.
    pub(super) fn of(state: &RawState) -> Option<Unit> {
        match state.get(&TEMP_UNIT)? {
            0 => Some(Unit::Fahrenheit),
            _ => Some(Unit::Celsius),
        }
    }

    fn fridge(self, v: i64) -> i64 {
        match self {
            Unit::Celsius => 8 - v,
            Unit::Fahrenheit => 44 - v,
        }
    }

    fn freezer(self, v: i64) -> i64 {
        match self {
            Unit::Celsius => -14 - v,
            Unit::Fahrenheit => 6 - v,
        }
    }

    pub(super) fn fridge_range(self) -> Range {
        match self {
            Unit::Celsius => Range { unit: "°C", min: 1, max: 7 },
            Unit::Fahrenheit => Range { unit: "°F", min: 33, max: 43 },
        }
    }

    pub(super) fn freezer_range(self) -> Range {
        match self {
            Unit::Celsius => Range { unit: "°C", min: -23, max: -15 },
            Unit::Fahrenheit => Range { unit: "°F", min: -7, max: 5 },
        }
    }
}

fn setpoint_write(
    state: &RawState,
    v: &str,
    range: fn(Unit) -> Range,
    convert: fn(Unit, i64) -> i64,
) -> Option<WriteValue> {
    let unit = Unit::of(state)?;
    let t = v.trim().parse::<f64>().ok()?.round() as i64;
    let r = range(unit);
    if t < r.min || t > r.max {
        log::debug!("setpoint {} outside {}..{}", t, r.min, r.max);
        return None;
    }
    u32::try_from(convert(unit, t)).ok().map(WriteValue::Raw)
}

fn express_freeze_write(state: &RawState, raw: u32) -> Vec<(u16, u32)> {
    let mut out = vec![(EXPRESS_COOL, raw)];
    if let Some(unit) = state.get(&TEMP_UNIT) {
        out.push((TEMP_UNIT, *unit));
    }
    out
}

/// Unit, setpoint and door registers every fridge model reports at the same offsets.
pub(super) fn setpoint_fields() -> Vec<FieldDef> {
    vec![
        // not published, setpoints are shown in the unit the appliance uses
        FieldDef::new(TEMP_UNIT, "temperature_unit")
            .read_only()
            .on_read(|_, _| vec![ReadEffect::Reprocess(FRIDGE_SETPOINT), ReadEffect::Reprocess(FREEZER_SETPOINT)]),
        FieldDef::new(FRIDGE_SETPOINT, "fridge_setpoint")
            .read(|s, raw| Unit::of(s).map(|u| Value::Num(u.fridge(raw as i64) as f64)))
            .write(|s, v| setpoint_write(s, v, Unit::fridge_range, Unit::fridge))
            .attach(Attach::Static(&[TEMP_UNIT])),
        FieldDef::new(FREEZER_SETPOINT, "freezer_setpoint")
            .read(|s, raw| Unit::of(s).map(|u| Value::Num(u.freezer(raw as i64) as f64)))
            .write(|s, v| setpoint_write(s, v, Unit::freezer_range, Unit::freezer))
            .attach(Attach::Static(&[TEMP_UNIT])),
        FieldDef::new(DOOR_OPEN, "door")
            .read_only()
            .read(|_, raw| Some(Value::on_off(raw != 0))),
    ]
}

fn fields() -> Vec<FieldDef> {
    let mut fields = setpoint_fields();
    fields.extend([
        // one register carries both express modes: 1 = cool, 2 = freeze
        FieldDef::new(EXPRESS_COOL, "express_cool")
            .on_read(|s, _| {
                let raw = s.get(&EXPRESS_COOL).copied().unwrap_or(0);
                vec![
                    ReadEffect::Publish("express_cool", Value::on_off(raw == 1)),
                    ReadEffect::Publish("express_freeze", Value::on_off(raw == 2)),
                ]
            })
            .write(|_, v| Some(WriteValue::Raw((v == "ON") as u32)))
            .attach(Attach::Static(&[TEMP_UNIT])),
        FieldDef::named("express_freeze")
            .write(|_, v| Some(WriteValue::Raw(if v == "ON" { 2 } else { 1 })))
            .on_write(express_freeze_write),
    ]);
    fields
}

pub(super) fn number(name: &str, key: &str, range: Range) -> Json {
    json!({
        "platform": "number",
        "device_class": "temperature",
        "unique_id": format!("$deviceid-{}", key),
        "state_topic": format!("$this/{}", key),
        "command_topic": format!("$this/{}/set", key),
        "name": name,
        "unit_of_measurement": range.unit,
        "min": range.min,
        "max": range.max,
    })
}

fn switch(name: &str, key: &str, icon: &str) -> Json {
    json!({
        "platform": "switch",
        "unique_id": format!("$deviceid-{}", key),
        "state_topic": format!("$this/{}", key),
        "command_topic": format!("$this/{}/set", key),
        "icon": icon,
        "name": name,
    })
}

pub(super) fn door() -> Json {
    json!({
        "platform": "binary_sensor",
        "device_class": "door",
        "unique_id": "$deviceid-door",
        "state_topic": "$this/door",
        "name": "Door",
    })
}

/// Ranges depend on the unit, so there is no document before the first status.
fn discovery_document(meta: &DeviceMetadata, engine: &FieldEngine) -> Option<Json> {
    let unit = Unit::of(engine.state())?;
    Some(discovery::device(
        meta,
        "LG Fridge",
        json!({
            "fridge_setpoint": number("Fridge temperature", "fridge_setpoint", unit.fridge_range()),
            "express_cool": switch("Express Cool", "express_cool", "mdi:snowflake-variant"),
            "freezer_setpoint": number("Freezer temperature", "freezer_setpoint", unit.freezer_range()),
            "express_freeze": switch("Express Freeze", "express_freeze", "mdi:snowflake"),
            "door": door(),
        }),
    ))
}

fn codec() -> Box<dyn RegisterCodec> {
    Box::new(AabbStatusCodec::new(STATUS_LEN, START))
}

#[cfg(test)]
mod tests {
    use super::{fields, PROFILE, STATUS_LEN};
    use crate::devman::DeviceMetadata;
    use crate::fields::{FieldEngine, Value};
    use crate::frame::aabb;

    fn status(fridge: u8, freezer: u8, door: u8, unit: u8, express: u8) -> Vec<u8> {
        let mut s = vec![0u8; STATUS_LEN];
        s[1] = fridge;
        s[2] = freezer;
        s[7] = door;
        s[8] = unit;
        s[16] = express;
        let mut inner = vec![0x10, 0xeb];
        inner.extend(s);
        aabb::build(&inner).unwrap()
    }

    fn apply(engine: &mut FieldEngine, packet: &[u8]) -> Vec<(&'static str, Value)> {
        let mut codec = (PROFILE.codec)();
        codec
            .decode(packet)
            .into_iter()
            .flat_map(|(id, raw)| engine.process_register(id, raw))
            .collect()
    }

    fn find(updates: &[(&'static str, Value)], name: &str) -> Option<Value> {
        updates.iter().rev().find(|(n, _)| *n == name).map(|(_, v)| v.clone())
    }

    #[test]
    fn status_in_celsius() {
        let mut e = FieldEngine::new(fields()).unwrap();
        // 8 - 5 = 3 C, -14 - 6 = -20 C
        let updates = apply(&mut e, &status(5, 6, 1, 1, 2));
        assert_eq!(find(&updates, "fridge_setpoint"), Some(Value::Num(3.0)));
        assert_eq!(find(&updates, "freezer_setpoint"), Some(Value::Num(-20.0)));
        assert_eq!(find(&updates, "door"), Some(Value::from("ON")));
        assert_eq!(find(&updates, "express_cool"), Some(Value::from("OFF")));
        assert_eq!(find(&updates, "express_freeze"), Some(Value::from("ON")));
        assert_eq!(find(&updates, "temperature_unit"), None);

        // same status again, only the door changed
        let updates = apply(&mut e, &status(5, 6, 0, 1, 2));
        assert_eq!(updates, vec![("door", Value::from("OFF"))]);
    }

    #[test]
    fn any_nonzero_unit_is_celsius() {
        let mut e = FieldEngine::new(fields()).unwrap();
        let updates = apply(&mut e, &status(5, 6, 0, 2, 0));
        assert_eq!(find(&updates, "fridge_setpoint"), Some(Value::Num(3.0)));
        assert_eq!(find(&updates, "freezer_setpoint"), Some(Value::Num(-20.0)));
    }

    #[test]
    fn unit_change_republishes_setpoints() {
        let mut e = FieldEngine::new(fields()).unwrap();
        apply(&mut e, &status(5, 6, 0, 1, 0));
        // 44 - 7 = 37 F, 6 - 6 = 0 F
        let updates = apply(&mut e, &status(7, 6, 0, 0, 0));
        assert_eq!(find(&updates, "fridge_setpoint"), Some(Value::Num(37.0)));
        assert_eq!(find(&updates, "freezer_setpoint"), Some(Value::Num(0.0)));
    }

    #[test]
    fn writes() {
        let mut e = FieldEngine::new(fields()).unwrap();
        assert!(e.set_property("fridge_setpoint", "3").unwrap().is_empty());
        apply(&mut e, &status(5, 6, 0, 1, 0));

        assert_eq!(e.set_property("fridge_setpoint", "4").unwrap(), vec![(1, 4), (8, 1)]);
        assert_eq!(e.set_property("freezer_setpoint", "-18").unwrap(), vec![(2, 4), (8, 1)]);
        // out of range
        assert!(e.set_property("fridge_setpoint", "12").unwrap().is_empty());
        assert!(e.set_property("freezer_setpoint", "-30").unwrap().is_empty());

        assert_eq!(e.set_property("express_cool", "ON").unwrap(), vec![(16, 1), (8, 1)]);
        assert_eq!(e.set_property("express_freeze", "ON").unwrap(), vec![(16, 2), (8, 1)]);
        assert_eq!(e.set_property("express_freeze", "OFF").unwrap(), vec![(16, 1), (8, 1)]);
        assert!(e.set_property("door", "ON").is_err());

        let codec = (PROFILE.codec)();
        let out = codec.encode_write(&[(1, 4), (8, 1)]).unwrap();
        let inner = aabb::parse(&out).unwrap();
        assert_eq!(&inner[..2], &[0xf0, 0x17]);
        assert_eq!(inner[2 + 1], 4);
        assert_eq!(inner[2 + 8], 1);
        assert_eq!(inner[2], 0xff);
    }

    #[test]
    fn discovery_waits_for_unit() {
        let meta = DeviceMetadata {
            id: "f".to_owned(),
            model_id: "2RES1VE61NFA2".to_owned(),
            model_name: None,
            firmware: None,
        };
        let mut e = FieldEngine::new(fields()).unwrap();
        assert!((PROFILE.discovery)(&meta, &e).is_none());
        apply(&mut e, &status(5, 6, 0, 0, 0));
        let doc = (PROFILE.discovery)(&meta, &e).unwrap();
        assert_eq!(doc["components"]["fridge_setpoint"]["min"], 33);
        assert_eq!(doc["components"]["fridge_setpoint"]["unit_of_measurement"], "°F");
        assert_eq!(doc["components"]["freezer_setpoint"]["max"], 5);
    }
}
