use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::calendar::OccurrenceKey;

pub const OCCURRENCE_KEY_PROPERTY: &str = "occurrenceKey";
pub const SOURCE_CALENDAR_PROPERTY: &str = "sourceCalendar";

/// Event resource as exchanged with the remote calendar service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub start: RemoteDateTime,
    #[serde(default)]
    pub end: RemoteDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<ExtendedProperties>,
}

/// Either `date` (all-day) or `dateTime` + `timeZone`, never both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDateTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl RemoteDateTime {
    pub fn date(date: String) -> Self {
        Self {
            date: Some(date),
            ..Self::default()
        }
    }

    pub fn date_time(date_time: String, time_zone: String) -> Self {
        Self {
            date: None,
            date_time: Some(date_time),
            time_zone: Some(time_zone),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtendedProperties {
    #[serde(default)]
    pub private: BTreeMap<String, String>,
}

impl RemoteEvent {
    /// Occurrence key recorded in the private provenance metadata, if any.
    pub fn occurrence_key(&self) -> Option<OccurrenceKey> {
        self.extended_properties
            .as_ref()?
            .private
            .get(OCCURRENCE_KEY_PROPERTY)
            .map(|raw| OccurrenceKey::from_raw(raw.clone()))
    }

    pub fn source_calendar(&self) -> Option<&str> {
        self.extended_properties
            .as_ref()?
            .private
            .get(SOURCE_CALENDAR_PROPERTY)
            .map(String::as_str)
    }

    pub fn has_provenance(&self) -> bool {
        self.occurrence_key().is_some()
    }
}
