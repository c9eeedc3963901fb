use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Identity of a single AGV. All maps key AGVs by this pair, compared by
/// value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AgvId {
    /// Manufacturer of the AGV.
    pub manufacturer: String,
    /// Serial number of the AGV.
    pub serial_number: String,
}

impl AgvId {
    pub fn new(
        manufacturer: impl Into<String>,
        serial_number: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let id = AgvId {
            manufacturer: manufacturer.into(),
            serial_number: serial_number.into(),
        };
        id.validate()?;
        Ok(id)
    }

    /// Both components must be usable as a single MQTT topic level; the
    /// serial number is additionally restricted to `A-Z a-z 0-9 _ . : -` so
    /// it stays safe across brokers and file systems.
    pub fn validate(&self) -> Result<(), ClientError> {
        if !is_topic_safe(&self.manufacturer) {
            return Err(ClientError::InvalidSubject(format!(
                "manufacturer {:?} is empty or not topic-safe",
                self.manufacturer
            )));
        }
        if !is_topic_safe(&self.serial_number) || !is_valid_serial_number(&self.serial_number) {
            return Err(ClientError::InvalidSubject(format!(
                "serial number {:?} contains characters outside A-Z a-z 0-9 _ . : -",
                self.serial_number
            )));
        }
        Ok(())
    }
}

/// A possibly-partial AGV identity used when subscribing. An unset component
/// matches any concrete value (subscription wildcard).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgvSubject {
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

impl AgvSubject {
    pub fn validate(&self) -> Result<(), ClientError> {
        if let Some(manufacturer) = &self.manufacturer {
            if !is_topic_safe(manufacturer) {
                return Err(ClientError::InvalidSubject(format!(
                    "manufacturer {:?} is empty or not topic-safe",
                    manufacturer
                )));
            }
        }
        if let Some(serial_number) = &self.serial_number {
            if !is_topic_safe(serial_number) || !is_valid_serial_number(serial_number) {
                return Err(ClientError::InvalidSubject(format!(
                    "serial number {:?} contains characters outside A-Z a-z 0-9 _ . : -",
                    serial_number
                )));
            }
        }
        Ok(())
    }
}

impl From<AgvId> for AgvSubject {
    fn from(id: AgvId) -> Self {
        AgvSubject {
            manufacturer: Some(id.manufacturer),
            serial_number: Some(id.serial_number),
        }
    }
}

impl From<&AgvId> for AgvSubject {
    fn from(id: &AgvId) -> Self {
        id.clone().into()
    }
}

pub(crate) fn is_topic_safe(s: &str) -> bool {
    !s.is_empty() && !s.contains(['/', '+', '#', '\u{0}'])
}

pub(crate) fn is_valid_serial_number(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
}

/// Two-level map keyed by (manufacturer, serialNumber). Iteration yields
/// entries in insertion order: manufacturers in first-seen order, serial
/// numbers in insertion order within each manufacturer.
#[derive(Clone, Debug, Default)]
pub struct AgvIdMap<T> {
    by_manufacturer: Vec<(String, Vec<(AgvId, T)>)>,
}

impl<T> AgvIdMap<T> {
    pub fn new() -> Self {
        AgvIdMap {
            by_manufacturer: Vec::new(),
        }
    }

    pub fn get(&self, id: &AgvId) -> Option<&T> {
        self.by_manufacturer
            .iter()
            .find(|(m, _)| *m == id.manufacturer)
            .and_then(|(_, serials)| {
                serials
                    .iter()
                    .find(|(k, _)| k.serial_number == id.serial_number)
            })
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, id: &AgvId) -> Option<&mut T> {
        self.by_manufacturer
            .iter_mut()
            .find(|(m, _)| *m == id.manufacturer)
            .and_then(|(_, serials)| {
                serials
                    .iter_mut()
                    .find(|(k, _)| k.serial_number == id.serial_number)
            })
            .map(|(_, v)| v)
    }

    /// Inserts or replaces; returns the previous value on replacement.
    pub fn insert(&mut self, id: AgvId, value: T) -> Option<T> {
        match self
            .by_manufacturer
            .iter_mut()
            .find(|(m, _)| *m == id.manufacturer)
        {
            Some((_, serials)) => {
                match serials
                    .iter_mut()
                    .find(|(k, _)| k.serial_number == id.serial_number)
                {
                    Some((_, slot)) => Some(std::mem::replace(slot, value)),
                    None => {
                        serials.push((id, value));
                        None
                    }
                }
            }
            None => {
                self.by_manufacturer
                    .push((id.manufacturer.clone(), vec![(id, value)]));
                None
            }
        }
    }

    pub fn remove(&mut self, id: &AgvId) -> Option<T> {
        let (group_index, removed) = {
            let (group_index, (_, serials)) = self
                .by_manufacturer
                .iter_mut()
                .enumerate()
                .find(|(_, (m, _))| *m == id.manufacturer)?;
            let entry_index = serials
                .iter()
                .position(|(k, _)| k.serial_number == id.serial_number)?;
            (group_index, serials.remove(entry_index).1)
        };
        if self.by_manufacturer[group_index].1.is_empty() {
            self.by_manufacturer.remove(group_index);
        }
        Some(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgvId, &T)> {
        self.by_manufacturer
            .iter()
            .flat_map(|(_, serials)| serials.iter().map(|(id, v)| (id, v)))
    }

    pub fn len(&self) -> usize {
        self.by_manufacturer.iter().map(|(_, s)| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_manufacturer.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_manufacturer.clear();
    }
}
