//! Latest telemetry snapshot per device.
//!
//! Each record is immutable once published; `set` swaps the `Arc` under a
//! write lock, so readers always hold one complete snapshot.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use serde::Serialize;
use serde_json::{Number, Value};

/// Which of the two microcontrollers a link or record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceRole {
    A,
    B,
}

impl DeviceRole {
    pub const ALL: [DeviceRole; 2] = [DeviceRole::A, DeviceRole::B];

    pub fn label(self) -> &'static str {
        match self {
            DeviceRole::A => "A",
            DeviceRole::B => "B",
        }
    }

    /// Structured fields the device reports.
    pub fn fields(self) -> &'static [TelemetryField] {
        match self {
            DeviceRole::A => &ROLE_A_FIELDS,
            DeviceRole::B => &ROLE_B_FIELDS,
        }
    }

    fn index(self) -> usize {
        match self {
            DeviceRole::A => 0,
            DeviceRole::B => 1,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port {}", self.label())
    }
}

/// A named telemetry field and the line keys that map onto it.
#[derive(Debug)]
pub struct TelemetryField {
    pub name: &'static str,
    aliases: &'static [&'static str],
}

static ROLE_A_FIELDS: [TelemetryField; 3] = [
    TelemetryField {
        name: "distance",
        aliases: &["d", "distance"],
    },
    TelemetryField {
        name: "rfid",
        aliases: &["r", "rfid"],
    },
    TelemetryField {
        name: "door",
        aliases: &["k", "door"],
    },
];

static ROLE_B_FIELDS: [TelemetryField; 3] = [
    TelemetryField {
        name: "temp",
        aliases: &["t", "temp"],
    },
    TelemetryField {
        name: "gas",
        aliases: &["g", "gas"],
    },
    TelemetryField {
        name: "buzzer",
        aliases: &["b", "buzzer"],
    },
];

/// One device's telemetry: its named fields plus the last raw line.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetryRecord {
    #[serde(flatten)]
    pub fields: BTreeMap<&'static str, Value>,
    pub raw: String,
}

impl TelemetryRecord {
    /// Record with every field `null` and an empty raw line.
    pub fn empty(role: DeviceRole) -> Self {
        Self {
            fields: role
                .fields()
                .iter()
                .map(|field| (field.name, Value::Null))
                .collect(),
            raw: String::new(),
        }
    }

    /// Build the snapshot that follows `previous` after `line` arrives.
    ///
    /// Lines are `key:value` pairs separated by commas. Known keys overwrite
    /// their field; fields the line does not mention keep their previous value.
    pub fn from_line(role: DeviceRole, previous: &TelemetryRecord, line: &str) -> Self {
        let mut fields = previous.fields.clone();
        for pair in line.split(',') {
            let Some((key, value)) = pair.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            if let Some(field) = role
                .fields()
                .iter()
                .find(|field| field.aliases.iter().any(|alias| *alias == key))
            {
                fields.insert(field.name, parse_value(value));
            }
        }
        Self {
            fields,
            raw: line.to_string(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

fn parse_value(value: &str) -> Value {
    let value = value.trim();
    if value.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = value.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Some(number) = value.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    Value::String(value.to_string())
}

/// Process-wide holder of the latest record per device.
#[derive(Clone)]
pub struct TelemetryStore {
    records: Arc<RwLock<[Arc<TelemetryRecord>; 2]>>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new([
                Arc::new(TelemetryRecord::empty(DeviceRole::A)),
                Arc::new(TelemetryRecord::empty(DeviceRole::B)),
            ])),
        }
    }

    /// Latest snapshot for `role`, or the empty record before any update.
    pub fn get(&self, role: DeviceRole) -> Arc<TelemetryRecord> {
        let guard = self.records.read().unwrap_or_else(PoisonError::into_inner);
        guard[role.index()].clone()
    }

    /// Replace the snapshot for `role` wholesale.
    pub fn set(&self, role: DeviceRole, record: TelemetryRecord) {
        let record = Arc::new(record);
        let mut guard = self.records.write().unwrap_or_else(PoisonError::into_inner);
        guard[role.index()] = record;
    }

    /// Both snapshots taken under a single read lock.
    pub fn snapshot(&self) -> [(DeviceRole, Arc<TelemetryRecord>); 2] {
        let guard = self.records.read().unwrap_or_else(PoisonError::into_inner);
        [
            (DeviceRole::A, guard[0].clone()),
            (DeviceRole::B, guard[1].clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use serde_json::json;

    use super::*;

    #[test]
    fn empty_records_serialize_with_null_fields() {
        let record = TelemetryRecord::empty(DeviceRole::A);
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"distance": null, "rfid": null, "door": null, "raw": ""})
        );
    }

    #[test]
    fn role_a_lines_parse_into_fields() {
        let previous = TelemetryRecord::empty(DeviceRole::A);
        let record = TelemetryRecord::from_line(DeviceRole::A, &previous, "D:120,R:,K:0");
        assert_eq!(record.raw, "D:120,R:,K:0");
        assert_eq!(record.field("distance"), Some(&json!(120)));
        assert_eq!(record.field("rfid"), Some(&Value::Null));
        assert_eq!(record.field("door"), Some(&json!(0)));
    }

    #[test]
    fn role_b_lines_accept_full_names_and_floats() {
        let previous = TelemetryRecord::empty(DeviceRole::B);
        let record =
            TelemetryRecord::from_line(DeviceRole::B, &previous, "temp:24.5, GAS:310, buzzer:ON");
        assert_eq!(record.field("temp"), Some(&json!(24.5)));
        assert_eq!(record.field("gas"), Some(&json!(310)));
        assert_eq!(record.field("buzzer"), Some(&json!("ON")));
    }

    #[test]
    fn unparseable_lines_only_replace_raw() {
        let first =
            TelemetryRecord::from_line(DeviceRole::A, &TelemetryRecord::empty(DeviceRole::A), "D:42");
        let second = TelemetryRecord::from_line(DeviceRole::A, &first, "booting...");
        assert_eq!(second.raw, "booting...");
        assert_eq!(second.field("distance"), Some(&json!(42)));
    }

    #[test]
    fn keys_of_the_other_role_are_ignored() {
        let record =
            TelemetryRecord::from_line(DeviceRole::A, &TelemetryRecord::empty(DeviceRole::A), "T:30");
        assert!(record.field("temp").is_none());
        assert_eq!(record.field("distance"), Some(&Value::Null));
    }

    #[test]
    fn get_returns_default_until_set() {
        let store = TelemetryStore::new();
        assert_eq!(*store.get(DeviceRole::B), TelemetryRecord::empty(DeviceRole::B));
        let record =
            TelemetryRecord::from_line(DeviceRole::B, &store.get(DeviceRole::B), "T:21,G:5,B:1");
        store.set(DeviceRole::B, record.clone());
        assert_eq!(*store.get(DeviceRole::B), record);
        assert_eq!(*store.get(DeviceRole::A), TelemetryRecord::empty(DeviceRole::A));
    }

    #[test]
    fn concurrent_readers_never_observe_mixed_records() {
        let store = TelemetryStore::new();
        let writer_store = store.clone();
        let writer = thread::spawn(move || {
            for i in 0..2_000 {
                let line = format!("D:{i},R:{i},K:{i}");
                let record = TelemetryRecord::from_line(
                    DeviceRole::A,
                    &TelemetryRecord::empty(DeviceRole::A),
                    &line,
                );
                writer_store.set(DeviceRole::A, record);
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let record = store.get(DeviceRole::A);
                        if record.raw.is_empty() {
                            continue;
                        }
                        let distance = record.field("distance").cloned().unwrap();
                        assert_eq!(record.field("rfid"), Some(&distance));
                        assert_eq!(record.field("door"), Some(&distance));
                        assert_eq!(record.raw, format!("D:{0},R:{0},K:{0}", distance));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
