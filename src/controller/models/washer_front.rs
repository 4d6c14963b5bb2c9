//! Front load washer attached to the broker, reports a 53 byte `20 ...` block in
//! `AA ... BB` frames and takes fixed commands.

use serde_json::{json, Value as Json};

use super::washer::{binary_sensor, flag_effects, sensor};
use super::ModelProfile;
use crate::controller::codec::{AabbReportCodec, RegisterCodec};
use crate::devman::DeviceMetadata;
use crate::discovery;
use crate::fields::{FieldDef, FieldEngine, RawState, ReadEffect, Value, WriteValue};

const REPORT: u8 = 0x20;
const REPORT_LEN: usize = 53;
const START: &[u8] = &[0xf0, 0xed, 0x11, 0x21, 0x01, 0x00, 0x00, 0x00, 0x18, 0x00];

const STATE: u16 = 15;
const REMAINING_HOURS: u16 = 16;
const REMAINING_MINUTES: u16 = 17;
const ERROR: u16 = 21;
const FLAGS: u16 = 30;
const CYCLES: u16 = 36;
/// not part of the report, carries the command to send
const OPERATION: u16 = 0x100;

const OP_STOP: u32 = 1;
const OP_POWER_OFF: u32 = 2;
const OP_WAKE_UP: u32 = 3;

const CMD_STOP: &[u8] = &[0xf0, 0x24, 0x04, 0x01, 0x00];
const CMD_POWER_OFF: &[u8] = &[0xf0, 0x24, 0x01, 0x01, 0x00];
const CMD_WAKE_UP: &[u8] = &[0xf0, 0x2a, 0x01, 0x00];

const STATES: [Option<&str>; 20] = [
    Some("power_off"),
    Some("initial"),
    Some("pause"),
    None,
    Some("detecting"),
    None,
    Some("running"),
    Some("rinsing"),
    Some("spinning"),
    Some("drying"),
    Some("end"),
    Some("cool_down"),
    Some("rinse_hold"),
    None,
    Some("refreshing"),
    Some("steam_softening"),
    Some("demo"),
    None,
    Some("error"),
    Some("auto_dt_open_pause"),
];

const ERRORS: [Option<&str>; 27] = [
    Some("ok"),
    Some("door_lock_error"),
    Some("door_open_error"),
    Some("water_supply_error"),
    Some("water_drain_error"),
    Some("out_of_balance_error"),
    Some("overfill_error"),
    Some("water_level_sensor_error"),
    Some("temperature_sensor_error"),
    Some("locked_motor_error"),
    None,
    Some("dHE_error"),
    Some("power_fail_error"),
    Some("FF_error"),
    Some("DCE_error"),
    Some("AE_error"),
    Some("eeprom_error"),
    Some("PS_error"),
    Some("door_sensor_error"),
    Some("vibration_sensor_error"),
    Some("LE8_error"),
    Some("LE9_error"),
    Some("ED1_error"),
    Some("ED2_error"),
    Some("ED3_error"),
    Some("ED4_error"),
    Some("ED5_error"),
];

pub static PROFILE: ModelProfile = ModelProfile {
    model_id: "Y_V8_Y___W.B32QEUK",
    platform: "device",
    fields,
    discovery: discovery_document,
    codec,
};

fn lookup(table: &[Option<&'static str>], raw: u32, unknown: &'static str) -> Value {
    let name = usize::try_from(raw).ok().and_then(|i| table.get(i).copied().flatten());
    Value::from(name.unwrap_or(unknown))
}

fn state(s: &RawState, value: &Value) -> Vec<ReadEffect> {
    let raw = s.get(&STATE).copied().unwrap_or(0);
    vec![
        ReadEffect::Publish("power", Value::on_off(raw > 0)),
        ReadEffect::Publish("status", value.clone()),
    ]
}

fn operation_write(_: &RawState, v: &str) -> Option<WriteValue> {
    match v {
        "stop" | "pause" => Some(WriteValue::Raw(OP_STOP)),
        "power_off" => Some(WriteValue::Raw(OP_POWER_OFF)),
        "wake_up" => Some(WriteValue::Raw(OP_WAKE_UP)),
        _ => {
            // start needs the complete course configuration
            log::warn!("washer operation {} not supported", v);
            None
        }
    }
}

fn fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new(STATE, "status")
            .read_only()
            .read(|_, raw| Some(lookup(&STATES, raw, "unknown_status")))
            .on_read(state),
        FieldDef::new(REMAINING_MINUTES, "remaining_time")
            .read_only()
            .read(|s, raw| Some(Value::from(s.get(&REMAINING_HOURS).copied().unwrap_or(0) * 60 + raw))),
        FieldDef::new(ERROR, "error")
            .read_only()
            .read(|_, raw| Some(lookup(&ERRORS, raw, "unknown_error"))),
        FieldDef::new(FLAGS, "remote_start")
            .read_only()
            .on_read(|s, _| flag_effects(s.get(&FLAGS).copied().unwrap_or(0))),
        FieldDef::new(CYCLES, "cycles").read_only(),
        // the appliance can only be switched off remotely
        FieldDef::named("power")
            .write(|_, v| (v == "OFF").then_some(WriteValue::Raw(OP_POWER_OFF)))
            .on_write(|_, op| vec![(OPERATION, op)]),
        FieldDef::named("operation")
            .write_only()
            .write(operation_write)
            .on_write(|_, op| vec![(OPERATION, op)]),
    ]
}

fn command(registers: &[(u16, u32)]) -> Option<&'static [u8]> {
    match registers {
        [(OPERATION, OP_STOP)] => Some(CMD_STOP),
        [(OPERATION, OP_POWER_OFF)] => Some(CMD_POWER_OFF),
        [(OPERATION, OP_WAKE_UP)] => Some(CMD_WAKE_UP),
        _ => None,
    }
}

fn options(table: &[Option<&str>], unknown: &str) -> Json {
    let mut out: Vec<Json> = table.iter().flatten().map(|n| Json::from(*n)).collect();
    out.push(unknown.into());
    Json::Array(out)
}

fn discovery_document(meta: &DeviceMetadata, _: &FieldEngine) -> Option<Json> {
    let mut status = sensor("Current status", "status");
    status["options"] = options(&STATES, "unknown_status");
    let mut error = sensor("Error", "error");
    error["options"] = options(&ERRORS, "unknown_error");
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
            "status": status,
            "error": error,
            "operation": {
                "platform": "select",
                "unique_id": "$deviceid-operation",
                "command_topic": "$this/operation/set",
                "name": "Operation",
                "options": ["start", "stop", "pause", "power_off", "wake_up"],
            },
            "cycles": sensor("Cycle count", "cycles"),
            "remote_start": binary_sensor("Remote start", "remote_start"),
            "door_lock": door_lock,
            "remaining_time": remaining_time,
        }),
    ))
}

fn codec() -> Box<dyn RegisterCodec> {
    Box::new(AabbReportCodec::new(REPORT, REPORT_LEN, command, START))
}

#[cfg(test)]
mod tests {
    use super::{fields, PROFILE, REPORT_LEN};
    use crate::devman::DeviceMetadata;
    use crate::fields::{FieldEngine, Value};
    use crate::frame::aabb;

    fn report(state: u8, hours: u8, minutes: u8, error: u8, flags: u8, cycles: u8) -> Vec<u8> {
        let mut r = vec![0u8; REPORT_LEN];
        r[0] = 0x20;
        r[15] = state;
        r[16] = hours;
        r[17] = minutes;
        r[21] = error;
        r[30] = flags;
        r[36] = cycles;
        aabb::build(&r).unwrap()
    }

    fn apply(engine: &mut FieldEngine, packet: &[u8]) -> Vec<(&'static str, Value)> {
        let mut codec = (PROFILE.codec)();
        codec
            .decode(packet)
            .into_iter()
            .flat_map(|(id, raw)| engine.process_register(id, raw))
            .collect()
    }

    #[test]
    fn report_block() {
        let mut e = FieldEngine::new(fields()).unwrap();
        let updates = apply(&mut e, &report(6, 1, 5, 0, 0x42, 12));
        assert_eq!(
            updates,
            vec![
                ("power", Value::from("ON")),
                ("status", Value::from("running")),
                ("remaining_time", Value::Num(65.0)),
                ("error", Value::from("ok")),
                ("remote_start", Value::from("ON")),
                ("door_lock", Value::from("OFF")),
                ("cycles", Value::Num(12.0)),
            ]
        );

        let updates = apply(&mut e, &report(0, 0, 0, 10, 0, 12));
        assert!(updates.contains(&("power", Value::from("OFF"))));
        assert!(updates.contains(&("status", Value::from("power_off"))));
        assert!(updates.contains(&("error", Value::from("unknown_error"))));
        assert!(updates.contains(&("door_lock", Value::from("ON"))));
    }

    #[test]
    fn commands() {
        let mut e = FieldEngine::new(fields()).unwrap();
        let codec = (PROFILE.codec)();
        let send = |regs: Vec<(u16, u32)>| aabb::parse(&codec.encode_write(&regs).unwrap()).unwrap().to_vec();

        assert_eq!(send(e.set_property("power", "OFF").unwrap()), vec![0xf0, 0x24, 0x01, 0x01, 0x00]);
        assert_eq!(send(e.set_property("operation", "stop").unwrap()), vec![0xf0, 0x24, 0x04, 0x01, 0x00]);
        assert_eq!(send(e.set_property("operation", "wake_up").unwrap()), vec![0xf0, 0x2a, 0x01, 0x00]);
        assert!(e.set_property("operation", "start").unwrap().is_empty());
        assert!(e.set_property("power", "ON").unwrap().is_empty());
        assert!(e.set_property("cycles", "3").is_err());
    }

    #[test]
    fn discovery_components() {
        let meta = DeviceMetadata {
            id: "w".to_owned(),
            model_id: "Y_V8_Y___W.B32QEUK".to_owned(),
            model_name: None,
            firmware: None,
        };
        let e = FieldEngine::new(fields()).unwrap();
        let doc = (PROFILE.discovery)(&meta, &e).unwrap();
        let c = &doc["components"];
        assert_eq!(c["status"]["options"][0], "power_off");
        assert_eq!(c["status"]["options"].as_array().unwrap().last().unwrap(), "unknown_status");
        assert_eq!(c["error"]["options"].as_array().unwrap().len(), 27);
        assert_eq!(c["operation"]["platform"], "select");
        assert_eq!(c["door_lock"]["device_class"], "lock");
    }
}
