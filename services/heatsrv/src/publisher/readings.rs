//! Last-known-value cache
//!
//! Holds what the gateway intends subscribers to see. `published_value` only
//! moves forward once the drain loop confirmed a publish.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Cached reading
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Reading {
    pub name: String,
    /// Last value accepted for publishing
    pub value: String,
    pub updated_at: DateTime<Utc>,
    /// Last value the broker accepted
    pub published_value: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl Reading {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            updated_at: Utc::now(),
            published_value: None,
            published_at: None,
        }
    }

    /// Whether the broker already has the cached value
    pub fn is_published(&self) -> bool {
        self.published_value.as_deref() == Some(self.value.as_str())
    }
}

/// Readings keyed by name
#[derive(Debug, Default)]
pub struct ReadingCache {
    readings: BTreeMap<String, Reading>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `value` differs from the cached value for `name`
    pub fn is_changed(&self, name: &str, value: &str) -> bool {
        self.readings
            .get(name)
            .map_or(true, |reading| reading.value != value)
    }

    /// Store `value` as the intended state of `name`
    pub fn update(&mut self, name: &str, value: &str) {
        match self.readings.get_mut(name) {
            Some(reading) => {
                if reading.value != value {
                    reading.value = value.to_string();
                }
                reading.updated_at = Utc::now();
            },
            None => {
                self.readings
                    .insert(name.to_string(), Reading::new(name, value));
            },
        }
    }

    /// Book a confirmed publish
    pub fn mark_published(&mut self, name: &str, value: &str) {
        if let Some(reading) = self.readings.get_mut(name) {
            reading.published_value = Some(value.to_string());
            reading.published_at = Some(Utc::now());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Reading> {
        self.readings.get(name)
    }

    /// Snapshot ordered by name
    pub fn snapshot(&self) -> Vec<Reading> {
        self.readings.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_detection() {
        let mut cache = ReadingCache::new();
        assert!(cache.is_changed("OutdoorTemp", "5.5"));

        cache.update("OutdoorTemp", "5.5");
        assert!(!cache.is_changed("OutdoorTemp", "5.5"));
        assert!(cache.is_changed("OutdoorTemp", "5.6"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_published_tracking() {
        let mut cache = ReadingCache::new();
        cache.update("Pressure", "2.1");
        assert!(!cache.get("Pressure").unwrap().is_published());

        cache.mark_published("Pressure", "2.1");
        assert!(cache.get("Pressure").unwrap().is_published());

        cache.update("Pressure", "2.2");
        let reading = cache.get("Pressure").unwrap();
        assert!(!reading.is_published());
        assert_eq!(reading.published_value.as_deref(), Some("2.1"));

        // unknown names are ignored
        cache.mark_published("Missing", "1");
        assert!(cache.get("Missing").is_none());
    }

    #[test]
    fn test_snapshot_sorted_by_name() {
        let mut cache = ReadingCache::new();
        cache.update("b", "2");
        cache.update("a", "1");
        let names: Vec<_> = cache.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
