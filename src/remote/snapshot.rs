use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{invalid_input, RunnerResult};
use crate::remote::path::DocumentPath;

pub type DocumentData = Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    path: DocumentPath,
    data: Option<DocumentData>,
    update_time: Option<DateTime<Utc>>,
}

impl DocumentSnapshot {
    pub fn new(
        path: DocumentPath,
        data: Option<DocumentData>,
        update_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            path,
            data,
            update_time,
        }
    }

    pub fn missing(path: DocumentPath) -> Self {
        Self::new(path, None, None)
    }

    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&DocumentData> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<DocumentData> {
        self.data
    }

    pub fn update_time(&self) -> Option<DateTime<Utc>> {
        self.update_time
    }

    /// Looks up a possibly dotted field path (`currencies.coins`).
    pub fn get(&self, field: &str) -> Option<&Value> {
        lookup_field(self.data.as_ref()?, field)
    }

    pub fn decode<T>(&self) -> RunnerResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        match &self.data {
            Some(data) => serde_json::from_value(Value::Object(data.clone()))
                .map(Some)
                .map_err(|err| {
                    invalid_input(format!("document {} has an unexpected shape: {err}", self.path))
                }),
            None => Ok(None),
        }
    }
}

pub(crate) fn lookup_field<'a>(data: &'a DocumentData, field: &str) -> Option<&'a Value> {
    let mut segments = field.split('.');
    let mut current = data.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes `value` at a dotted `field`, creating intermediate maps. A non-object in the way is
/// replaced.
pub(crate) fn assign_field(data: &mut DocumentData, field: &str, value: Value) {
    match field.split_once('.') {
        None => {
            data.insert(field.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = data
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(DocumentData::new()));
            if !slot.is_object() {
                *slot = Value::Object(DocumentData::new());
            }
            if let Value::Object(nested) = slot {
                assign_field(nested, rest, value);
            }
        }
    }
}

/// Deep merge used by `merge` writes: nested objects merge key by key, everything else replaces.
pub(crate) fn merge_into(target: &mut DocumentData, patch: &DocumentData) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Serialises `value` into document fields; anything but a JSON object is rejected.
pub fn encode_document<T>(value: &T) -> RunnerResult<DocumentData>
where
    T: serde::Serialize,
{
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(invalid_input(format!(
            "documents must encode to an object, got {other}"
        ))),
        Err(err) => Err(invalid_input(format!("failed to encode document: {err}"))),
    }
}
