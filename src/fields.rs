//! Declarative register to property mapping.
//!
//! A [FieldEngine] is created per device instance from a table of [FieldDef]s. Inbound
//! register updates go through [FieldEngine::process_register] and produce property
//! publications, outbound property writes go through [FieldEngine::set_property] and
//! produce the register set to transmit.
//!
//! Transforms and callbacks are plain functions which get the instance [RawState]
//! passed explicitly, so cross-register behavior (an AC mode that reads "off" while
//! power is off, a setpoint that depends on the temperature unit) stays testable.
//!
//! ```
//! use cloudless::fields::{FieldDef, FieldEngine, Value};
//!
//! let mut engine = FieldEngine::new(vec![
//!     FieldDef::new(0x1fe, "temperature")
//!         .read(|_, raw| Some(Value::Num(raw as f64 / 2.0)))
//!         .write(|_, v| v.parse::<f64>().ok().map(|t| (t * 2.0).round() as u32).map(Into::into)),
//! ]).unwrap();
//! assert_eq!(engine.process_register(0x1fe, 43), vec![("temperature", Value::Num(21.5))]);
//! assert_eq!(engine.set_property("temperature", "22").unwrap(), vec![(0x1fe, 44)]);
//! ```

use std::collections::HashMap;
use std::fmt;

/// register id -> last observed or sent raw value
pub type RawState = HashMap<u16, u32>;

pub type ReadTransform = fn(&RawState, u32) -> Option<Value>;
pub type WriteTransform = fn(&RawState, &str) -> Option<WriteValue>;
pub type ReadCallback = fn(&RawState, &Value) -> Vec<ReadEffect>;
pub type WriteCallback = fn(&RawState, u32) -> Vec<(u16, u32)>;

const MAX_NESTING: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
}

impl Value {
    pub fn on_off(on: bool) -> Self {
        Value::Str(if on { "ON" } else { "OFF" }.to_owned())
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Num(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Value::from(*n)
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Num(n) if n.fract() == 0.0 => write!(f, "{}", *n as i64),
            Value::Num(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Num(n as f64)
    }
}

/// Result of a write transform.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValue {
    Raw(u32),
    /// perform write of another property instead
    Redirect { property: &'static str, value: String },
}

impl From<u32> for WriteValue {
    fn from(raw: u32) -> Self {
        WriteValue::Raw(raw)
    }
}

/// Registers sent along with a written register.
#[derive(Clone, Copy)]
pub enum Attach {
    None,
    Static(&'static [u16]),
    Dynamic(fn(u32) -> Vec<u16>),
}

/// Registers of a property write, the written value is stored on commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingWrite {
    pub registers: Vec<(u16, u32)>,
    store: Option<(u16, u32)>,
}

/// Effect requested by a read callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadEffect {
    /// run read path of another register with its cached raw value
    Reprocess(u16),
    Publish(&'static str, Value),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("unknown property {0}")]
    UnknownProperty(String),
    #[error("property {0} is not writable")]
    NotWritable(String),
    #[error("duplicate field {0}")]
    Duplicate(String),
    #[error("write of {0} redirects too deep")]
    RedirectLoop(String),
}

#[derive(Clone)]
pub struct FieldDef {
    pub id: Option<u16>,
    pub name: &'static str,
    pub readable: bool,
    pub writable: bool,
    pub read_transform: Option<ReadTransform>,
    pub write_transform: Option<WriteTransform>,
    pub attach: Attach,
    pub read_callback: Option<ReadCallback>,
    pub write_callback: Option<WriteCallback>,
    /// add topic entries to component-style discovery documents
    pub autoreg: bool,
}

impl FieldDef {
    pub fn new(id: u16, name: &'static str) -> Self {
        Self {
            id: Some(id),
            ..Self::named(name)
        }
    }

    /// Field without register, only reachable by property name.
    pub fn named(name: &'static str) -> Self {
        Self {
            id: None,
            name,
            readable: true,
            writable: true,
            read_transform: None,
            write_transform: None,
            attach: Attach::None,
            read_callback: None,
            write_callback: None,
            autoreg: true,
        }
    }

    pub fn read(mut self, f: ReadTransform) -> Self {
        self.read_transform = Some(f);
        self
    }

    pub fn write(mut self, f: WriteTransform) -> Self {
        self.write_transform = Some(f);
        self
    }

    pub fn attach(mut self, attach: Attach) -> Self {
        self.attach = attach;
        self
    }

    pub fn on_read(mut self, f: ReadCallback) -> Self {
        self.read_callback = Some(f);
        self
    }

    pub fn on_write(mut self, f: WriteCallback) -> Self {
        self.write_callback = Some(f);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.readable = false;
        self
    }

    pub fn no_autoreg(mut self) -> Self {
        self.autoreg = false;
        self
    }
}

pub struct FieldEngine {
    fields: Vec<FieldDef>,
    by_id: HashMap<u16, usize>,
    by_name: HashMap<&'static str, usize>,
    state: RawState,
    published: HashMap<&'static str, Value>,
}

impl FieldEngine {
    pub fn new(fields: Vec<FieldDef>) -> Result<Self, FieldError> {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for (i, f) in fields.iter().enumerate() {
            if let Some(id) = f.id {
                if by_id.insert(id, i).is_some() {
                    return Err(FieldError::Duplicate(format!("0x{:x}", id)));
                }
            }
            if by_name.insert(f.name, i).is_some() {
                return Err(FieldError::Duplicate(f.name.to_owned()));
            }
        }
        Ok(Self {
            fields,
            by_id,
            by_name,
            state: RawState::new(),
            published: HashMap::new(),
        })
    }

    pub fn state(&self) -> &RawState {
        &self.state
    }

    /// Handle register value reported by device. Returns properties whose value changed.
    pub fn process_register(&mut self, id: u16, raw: u32) -> Vec<(&'static str, Value)> {
        self.state.insert(id, raw);
        let mut out = Vec::new();
        self.read_path(id, raw, 0, &mut out);
        out
    }

    fn read_path(&mut self, id: u16, raw: u32, depth: usize, out: &mut Vec<(&'static str, Value)>) {
        let Some(def) = self.by_id.get(&id).map(|i| self.fields[*i].clone()) else {
            return;
        };
        let value = match def.read_transform {
            Some(f) => match f(&self.state, raw) {
                Some(v) => v,
                None => return,
            },
            None => Value::Num(raw as f64),
        };
        if let Some(cb) = def.read_callback {
            for effect in cb(&self.state, &value) {
                match effect {
                    ReadEffect::Reprocess(other) => {
                        if depth >= MAX_NESTING {
                            log::warn!("read callback of {} nests too deep", def.name);
                            continue;
                        }
                        if let Some(other_raw) = self.state.get(&other).copied() {
                            self.read_path(other, other_raw, depth + 1, out);
                        }
                    }
                    ReadEffect::Publish(name, v) => self.publish(name, v, out),
                }
            }
            return;
        }
        if def.readable {
            self.publish(def.name, value, out);
        }
    }

    fn publish(&mut self, name: &'static str, value: Value, out: &mut Vec<(&'static str, Value)>) {
        if self.published.get(name) == Some(&value) {
            return;
        }
        self.published.insert(name, value.clone());
        out.push((name, value));
    }

    /// Translate property write into register updates to transmit.
    /// An empty result means the value was not accepted and nothing is sent.
    pub fn set_property(&mut self, name: &str, text: &str) -> Result<Vec<(u16, u32)>, FieldError> {
        let write = self.prepare_write(name, text)?;
        Ok(self.commit(write))
    }

    /// Compute property write without touching the instance state. Apply it with
    /// [FieldEngine::commit] once the registers were encoded for the device.
    pub fn prepare_write(&self, name: &str, text: &str) -> Result<PendingWrite, FieldError> {
        self.write_path(name, text, 0)
    }

    /// Record written register value and return the registers to transmit.
    pub fn commit(&mut self, write: PendingWrite) -> Vec<(u16, u32)> {
        if let Some((id, raw)) = write.store {
            self.state.insert(id, raw);
        }
        write.registers
    }

    fn write_path(&self, name: &str, text: &str, depth: usize) -> Result<PendingWrite, FieldError> {
        let def = match self.by_name.get(name) {
            Some(i) => &self.fields[*i],
            None => return Err(FieldError::UnknownProperty(name.to_owned())),
        };
        if !def.writable {
            return Err(FieldError::NotWritable(name.to_owned()));
        }
        let value = match def.write_transform {
            Some(f) => f(&self.state, text),
            None => text.trim().parse::<u32>().ok().map(WriteValue::Raw),
        };
        let raw = match value {
            None => {
                log::debug!("ignoring value {:?} for {}", text, name);
                return Ok(PendingWrite::default());
            }
            Some(WriteValue::Redirect { property, value }) => {
                if depth >= MAX_NESTING {
                    return Err(FieldError::RedirectLoop(name.to_owned()));
                }
                return self.write_path(property, &value, depth + 1);
            }
            Some(WriteValue::Raw(raw)) => raw,
        };
        if let Some(cb) = def.write_callback {
            return Ok(PendingWrite {
                registers: cb(&self.state, raw),
                store: None,
            });
        }
        let Some(id) = def.id else {
            return Err(FieldError::NotWritable(name.to_owned()));
        };
        let attached = match def.attach {
            Attach::None => Vec::new(),
            Attach::Static(ids) => ids.to_vec(),
            Attach::Dynamic(f) => f(raw),
        };
        let mut registers = vec![(id, raw)];
        for a in attached {
            match self.state.get(&a) {
                Some(v) => registers.push((a, *v)),
                None => log::debug!("register 0x{:x} not known yet, not attached to {}", a, name),
            }
        }
        Ok(PendingWrite {
            registers,
            store: Some((id, raw)),
        })
    }

    /// Topic entries for component-style discovery documents.
    pub fn discovery_topics(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut out = serde_json::Map::new();
        for f in self.fields.iter().filter(|f| f.autoreg) {
            if !f.writable {
                out.insert(format!("{}_topic", f.name), format!("$this/{}", f.name).into());
                continue;
            }
            if f.readable {
                out.insert(format!("{}_state_topic", f.name), format!("$this/{}", f.name).into());
            }
            out.insert(format!("{}_command_topic", f.name), format!("$this/{}/set", f.name).into());
        }
        out
    }
}
