//! The `(body, slots)` wire form of a marshalled value.
//!
//! The body is canonical JSON whose capability positions are replaced by
//! `{"$slot": <index>}` markers; the referenced krefs appear in `slots` in
//! index order. Ordinary values are prefixed `#`, thrown errors `#error`, so
//! an error payload can be detected by substring without decoding.

use crate::refs::KRef;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const BODY_PREFIX: &str = "#";
pub const ERROR_PREFIX: &str = "#error";

pub const SLOT_KEY: &str = "$slot";
pub const KREF_KEY: &str = "$kref";
pub const VREF_KEY: &str = "$vref";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    #[error("Invalid CapData body")]
    InvalidBody,
    #[error("slot index {0} out of range")]
    SlotOutOfRange(usize),
    #[error("unserializable value: {0}")]
    Unserializable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<KRef>,
}

impl CapData {
    /// Marshal a JSON value. Capabilities appear in the input as
    /// `{"$kref": "ko1"}` objects and are lifted into `slots`; repeated
    /// mentions of the same kref share one slot index.
    pub fn from_value(value: &Value) -> Result<CapData, MarshalError> {
        let mut names = Vec::new();
        let lifted = lift_marked_refs(value, KREF_KEY, &mut names)?;
        let slots = names
            .iter()
            .map(|name| {
                name.parse()
                    .map_err(|_| MarshalError::Unserializable(name.clone()))
            })
            .collect::<Result<Vec<KRef>, _>>()?;
        let body = serde_json::to_string(&lifted)
            .map_err(|err| MarshalError::Unserializable(err.to_string()))?;
        Ok(CapData {
            body: format!("{BODY_PREFIX}{body}"),
            slots,
        })
    }

    /// Unmarshal back to a JSON value with `{"$kref": ...}` capability
    /// markers. Fails if the body carries no `#` prefix.
    pub fn to_value(&self) -> Result<Value, MarshalError> {
        let raw = decode_body(&self.body)?;
        let names: Vec<String> = self.slots.iter().map(KRef::to_string).collect();
        restore_marked_refs(&raw, KREF_KEY, &names)
    }

    /// An error payload whose body contains `message` as a substring.
    pub fn error(message: &str) -> CapData {
        let body = serde_json::to_string(&json!({ "message": message }))
            .unwrap_or_else(|_| format!("{{\"message\":\"{message}\"}}"));
        CapData {
            body: format!("{ERROR_PREFIX}{body}"),
            slots: Vec::new(),
        }
    }

    /// A plain string payload, the most common vat result shape.
    pub fn string(text: &str) -> CapData {
        CapData {
            body: format!("{BODY_PREFIX}{}", Value::String(text.to_string())),
            slots: Vec::new(),
        }
    }

    pub fn null() -> CapData {
        CapData {
            body: format!("{BODY_PREFIX}null"),
            slots: Vec::new(),
        }
    }

    /// A payload consisting of a single capability.
    pub fn single_slot(kref: KRef) -> CapData {
        CapData {
            body: format!("{BODY_PREFIX}{{\"{SLOT_KEY}\":0}}"),
            slots: vec![kref],
        }
    }

    /// When the payload is exactly one capability, return it.
    pub fn sole_slot(&self) -> Option<KRef> {
        match self.to_value() {
            Ok(Value::Object(map)) if map.len() == 1 => match map.get(KREF_KEY) {
                Some(Value::String(_)) if self.slots.len() == 1 => Some(self.slots[0]),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.body.starts_with(ERROR_PREFIX)
    }

    /// The `message` field of an error payload, if this is one.
    pub fn error_message(&self) -> Option<String> {
        let stripped = self.body.strip_prefix(ERROR_PREFIX)?;
        let value: Value = serde_json::from_str(stripped).ok()?;
        value.get("message")?.as_str().map(str::to_string)
    }

    /// Decode a body expected to be a bare string payload.
    pub fn as_string(&self) -> Option<String> {
        match self.to_value() {
            Ok(Value::String(text)) => Some(text),
            _ => None,
        }
    }
}

/// Wrap a kref so it survives a round trip through [`CapData::from_value`].
pub fn kref_marker(kref: KRef) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(KREF_KEY.to_string(), Value::String(kref.to_string()));
    Value::Object(map)
}

fn slot_marker(index: usize) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(SLOT_KEY.to_string(), Value::from(index));
    Value::Object(map)
}

/// Strip the `#`/`#error` prefix and parse the JSON inside. Shared by
/// kernel-space and vat-space payload types.
pub fn decode_body(body: &str) -> Result<Value, MarshalError> {
    let stripped = body
        .strip_prefix(ERROR_PREFIX)
        .or_else(|| body.strip_prefix(BODY_PREFIX))
        .ok_or(MarshalError::InvalidBody)?;
    serde_json::from_str(stripped).map_err(|_| MarshalError::InvalidBody)
}

/// Replace every `{<marker_key>: "<name>"}` object with a `{"$slot": n}`
/// marker, collecting the names in mention order. Repeated names share one
/// index.
pub fn lift_marked_refs(
    value: &Value,
    marker_key: &str,
    slots: &mut Vec<String>,
) -> Result<Value, MarshalError> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(name)) = map.get(marker_key) {
                    let index = slots.iter().position(|s| s == name).unwrap_or_else(|| {
                        slots.push(name.clone());
                        slots.len() - 1
                    });
                    return Ok(slot_marker(index));
                }
            }
            let mut out = serde_json::Map::new();
            for (key, inner) in map {
                out.insert(key.clone(), lift_marked_refs(inner, marker_key, slots)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let lifted: Result<Vec<_>, _> = items
                .iter()
                .map(|item| lift_marked_refs(item, marker_key, slots))
                .collect();
            Ok(Value::Array(lifted?))
        }
        other => Ok(other.clone()),
    }
}

/// Inverse of [`lift_marked_refs`]: turn `{"$slot": n}` markers back into
/// `{<marker_key>: slots[n]}` objects.
pub fn restore_marked_refs(
    value: &Value,
    marker_key: &str,
    slots: &[String],
) -> Result<Value, MarshalError> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(index) = map.get(SLOT_KEY).and_then(Value::as_u64) {
                    let name = slots
                        .get(index as usize)
                        .ok_or(MarshalError::SlotOutOfRange(index as usize))?;
                    let mut out = serde_json::Map::new();
                    out.insert(marker_key.to_string(), Value::String(name.clone()));
                    return Ok(Value::Object(out));
                }
            }
            let mut out = serde_json::Map::new();
            for (key, inner) in map {
                out.insert(key.clone(), restore_marked_refs(inner, marker_key, slots)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let restored: Result<Vec<_>, _> = items
                .iter()
                .map(|item| restore_marked_refs(item, marker_key, slots))
                .collect();
            Ok(Value::Array(restored?))
        }
        other => Ok(other.clone()),
    }
}
