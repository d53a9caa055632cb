//! Canonical remote representation of a source occurrence and the content
//! fingerprint used to decide whether the remote copy needs rewriting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::calendar::remote_event::{OCCURRENCE_KEY_PROPERTY, SOURCE_CALENDAR_PROPERTY};
use crate::calendar::{ExtendedProperties, RemoteDateTime, RemoteEvent, SourceEvent};

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;
const FIELD_SEPARATOR: char = '|';

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

fn render_instant(instant: DateTime<Utc>, all_day: bool) -> String {
    if all_day {
        instant.format(DATE_FORMAT).to_string()
    } else {
        instant.format(DATE_TIME_FORMAT).to_string()
    }
}

/// The `title|start|end|allDay|location|notes` line the fingerprint is taken over.
pub fn canonical_content(event: &SourceEvent) -> String {
    let fields = [
        event.title.clone(),
        render_instant(event.start, event.all_day),
        render_instant(event.end, event.all_day),
        event.all_day.to_string(),
        event.location.clone().unwrap_or_default(),
        event.notes.clone().unwrap_or_default(),
    ];
    fields.join(&FIELD_SEPARATOR.to_string())
}

pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// 16 lowercase hex digits.
pub fn fingerprint(event: &SourceEvent) -> String {
    format!("{:016x}", fnv1a_64(canonical_content(event).as_bytes()))
}

pub fn provenance_marker(calendar: &str) -> String {
    format!("[synced from {}]", calendar)
}

fn describe(event: &SourceEvent) -> String {
    let marker = provenance_marker(&event.calendar);
    match event.notes.as_deref() {
        Some(notes) if !notes.trim().is_empty() => format!("{}\n\n{}", notes, marker),
        _ => marker,
    }
}

/// Calendar date of `instant` in the event's own zone; unknown zones fall
/// back to UTC.
fn local_date(instant: DateTime<Utc>, time_zone: &str) -> String {
    match time_zone.parse::<Tz>() {
        Ok(zone) => instant.with_timezone(&zone).format(DATE_FORMAT).to_string(),
        Err(_) => {
            tracing::debug!("Unknown time zone {:?}, using UTC dates", time_zone);
            instant.format(DATE_FORMAT).to_string()
        }
    }
}

fn remote_time(instant: DateTime<Utc>, event: &SourceEvent) -> RemoteDateTime {
    if event.all_day {
        RemoteDateTime::date(local_date(instant, &event.time_zone))
    } else {
        RemoteDateTime::date_time(
            instant.format(DATE_TIME_FORMAT).to_string(),
            event.time_zone.clone(),
        )
    }
}

/// Maps a source occurrence to the event resource sent to the remote side.
pub fn to_remote(event: &SourceEvent) -> RemoteEvent {
    let mut private = BTreeMap::new();
    private.insert(
        OCCURRENCE_KEY_PROPERTY.to_string(),
        event.occurrence_key().to_string(),
    );
    private.insert(SOURCE_CALENDAR_PROPERTY.to_string(), event.calendar.clone());

    RemoteEvent {
        id: None,
        summary: Some(event.title.clone()),
        description: Some(describe(event)),
        location: event.location.clone(),
        start: remote_time(event.start, event),
        end: remote_time(event.end, event),
        extended_properties: Some(ExtendedProperties { private }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::event::tests::sample_event;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn offsite() -> SourceEvent {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        SourceEvent {
            title: "Team Offsite".to_string(),
            start,
            end: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
            all_day: true,
            time_zone: "UTC".to_string(),
            location: None,
            notes: None,
            calendar: "Work".to_string(),
            last_modified: None,
            base_id: "offsite".to_string(),
            occurrence_start: start,
        }
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn canonical_content_uses_dates_for_all_day() {
        assert_eq!(
            canonical_content(&offsite()),
            "Team Offsite|2024-03-01|2024-03-02|true||"
        );
    }

    #[test]
    fn canonical_content_uses_utc_date_times_for_timed_events() {
        let mut event = sample_event("a", "Review");
        event.location = Some("Room 4".to_string());
        event.notes = Some("Agenda in doc".to_string());

        assert_eq!(
            canonical_content(&event),
            "Review|2024-03-01T09:00:00Z|2024-03-01T10:00:00Z|false|Room 4|Agenda in doc"
        );
    }

    #[test]
    fn fingerprint_is_sixteen_lowercase_hex_digits() {
        let print = fingerprint(&offsite());

        assert_eq!(print.len(), 16);
        assert!(print.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_ignores_fields_outside_content() {
        let event = offsite();
        let mut touched = event.clone();
        touched.last_modified = Some(Utc::now());
        touched.calendar = "Other".to_string();
        touched.time_zone = "America/New_York".to_string();

        assert_eq!(fingerprint(&event), fingerprint(&touched));
    }

    #[test]
    fn fingerprint_changes_with_each_content_field() {
        let base = sample_event("a", "Review");
        let original = fingerprint(&base);

        let mut variants = Vec::new();
        let mut e = base.clone();
        e.title = "Review!".to_string();
        variants.push(e);
        let mut e = base.clone();
        e.start = e.start + chrono::Duration::minutes(5);
        variants.push(e);
        let mut e = base.clone();
        e.end = e.end + chrono::Duration::minutes(5);
        variants.push(e);
        let mut e = base.clone();
        e.all_day = true;
        variants.push(e);
        let mut e = base.clone();
        e.location = Some("Room 1".to_string());
        variants.push(e);
        let mut e = base.clone();
        e.notes = Some("notes".to_string());
        variants.push(e);

        for variant in variants {
            assert_ne!(fingerprint(&variant), original, "{:?}", variant);
        }
    }

    #[test]
    fn no_collisions_across_ten_thousand_titles() {
        let base = sample_event("a", "");
        let mut seen = HashSet::new();

        for i in 0..10_000 {
            let mut event = base.clone();
            event.title = format!("Event {}", i);
            assert!(seen.insert(fingerprint(&event)), "collision at {}", i);
        }
    }

    #[test]
    fn to_remote_builds_all_day_resource_with_provenance() {
        let remote = to_remote(&offsite());

        assert_eq!(remote.summary.as_deref(), Some("Team Offsite"));
        assert_eq!(remote.start, RemoteDateTime::date("2024-03-01".to_string()));
        assert_eq!(remote.end, RemoteDateTime::date("2024-03-02".to_string()));
        assert_eq!(remote.description.as_deref(), Some("[synced from Work]"));
        assert_eq!(
            remote.occurrence_key().unwrap().as_str(),
            "offsite::2024-03-01T00:00:00Z"
        );
        assert_eq!(remote.source_calendar(), Some("Work"));
    }

    #[test]
    fn all_day_dates_follow_the_event_time_zone() {
        let mut event = offsite();
        event.time_zone = "Europe/Berlin".to_string();
        event.start = Utc.with_ymd_and_hms(2024, 2, 29, 23, 0, 0).unwrap();
        event.end = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();

        let remote = to_remote(&event);

        assert_eq!(remote.start, RemoteDateTime::date("2024-03-01".to_string()));
        assert_eq!(remote.end, RemoteDateTime::date("2024-03-02".to_string()));
        assert_eq!(
            canonical_content(&event),
            "Team Offsite|2024-02-29|2024-03-01|true||"
        );
    }

    #[test]
    fn unknown_time_zone_falls_back_to_utc_dates() {
        let mut event = offsite();
        event.time_zone = "Mars/Olympus".to_string();

        assert_eq!(to_remote(&event).start, RemoteDateTime::date("2024-03-01".to_string()));
    }

    #[test]
    fn to_remote_keeps_time_zone_for_timed_events() {
        let mut event = sample_event("a", "Review");
        event.notes = Some("Bring numbers".to_string());

        let remote = to_remote(&event);

        assert_eq!(
            remote.start,
            RemoteDateTime::date_time("2024-03-01T09:00:00Z".to_string(), "Europe/Berlin".to_string())
        );
        assert_eq!(
            remote.description.as_deref(),
            Some("Bring numbers\n\n[synced from Work]")
        );
    }

    proptest! {
        #[test]
        fn equal_content_gives_equal_fingerprint(
            title in ".*",
            location in proptest::option::of(".*"),
            notes in proptest::option::of(".*"),
            start_secs in 0i64..4_000_000_000,
            length in 0i64..100_000,
            all_day in any::<bool>(),
        ) {
            let start = Utc.timestamp_opt(start_secs, 0).unwrap();
            let build = || SourceEvent {
                title: title.clone(),
                start,
                end: start + chrono::Duration::seconds(length),
                all_day,
                time_zone: "UTC".to_string(),
                location: location.clone(),
                notes: notes.clone(),
                calendar: "Work".to_string(),
                last_modified: None,
                base_id: "p".to_string(),
                occurrence_start: start,
            };

            let first = build();
            let mut second = build();
            second.last_modified = Some(Utc::now());

            prop_assert_eq!(fingerprint(&first), fingerprint(&second));
        }
    }
}
