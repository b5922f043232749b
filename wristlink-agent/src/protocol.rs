//! Line protocol spoken over the device link
//!
//! Textual, `\n`-terminated, comma-separated `key:value` pairs, UTF-8.
//! Inbound:  `MonitoringType:HeartRate,AndroidID:50,UserID:7,SmartWatchID:3,Value:72`
//! Outbound: `Monitoring:<mode>` (once, right after connecting) and
//!           `Vibrate:<intensity>,<pulses>,<durationMs>,<intervalMs>`

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::identity::{self, DeviceIdentity, IdField, UNKNOWN_ANDROID, UNKNOWN_USER, UNKNOWN_WATCH};

/// Tag a heart-rate line must start with to be decoded at all.
pub const HEART_RATE_TAG: &str = "MonitoringType:HeartRate";

/// Backend-selected monitoring behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringMode {
    HeartRate,
    SunAzimuth,
    MoonAzimuth,
    /// Terminal error for a fetch cycle, never a valid operating mode.
    Unknown,
}

impl MonitoringMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "HeartRate" => MonitoringMode::HeartRate,
            "SunAzimuth" => MonitoringMode::SunAzimuth,
            "MoonAzimuth" => MonitoringMode::MoonAzimuth,
            _ => MonitoringMode::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoringMode::HeartRate => "HeartRate",
            MonitoringMode::SunAzimuth => "SunAzimuth",
            MonitoringMode::MoonAzimuth => "MoonAzimuth",
            MonitoringMode::Unknown => "Unknown",
        }
    }

    /// Celestial-position modes acquire locations instead of device readings.
    pub fn is_celestial(&self) -> bool {
        matches!(self, MonitoringMode::SunAzimuth | MonitoringMode::MoonAzimuth)
    }
}

impl std::fmt::Display for MonitoringMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vibration instruction relayed back to the wearable. Missing fields in a
/// backend response default to zero; `pulses == 0` means "no feedback".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct HapticCommand {
    #[serde(default)]
    pub intensity: i32,
    #[serde(default)]
    pub pulses: i32,
    #[serde(default, rename = "duration")]
    pub duration_ms: i32,
    #[serde(default, rename = "interval")]
    pub interval_ms: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKind {
    HeartRate,
}

/// A decoded, validated device reading.
#[derive(Debug, Clone)]
pub struct Reading {
    pub kind: ReadingKind,
    pub value: u32,
    pub identity: DeviceIdentity,
    /// Full decoded field map, identity fields already recovered. This is
    /// what gets posted to the backend verbatim.
    pub raw: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

/// Per-line decode failures. All of them are terminal for that line only;
/// the stream continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unrecognized data format")]
    Unrecognized,
    #[error("unrecoverable unknown identity fields")]
    UnresolvedIdentity,
    #[error("missing heart rate value")]
    MissingValue,
    #[error("invalid heart rate value: {0:?}")]
    InvalidFormat(String),
}

/// Auxiliary identity sources captured when the link was established.
#[derive(Debug, Clone, Default)]
pub struct IdentityHints {
    /// System device name, e.g. `Android-50`.
    pub system_name: Option<String>,
    /// Paired device alias, e.g. `UserID-7-SmartWatchID-3`.
    pub device_alias: Option<String>,
}

/// Decode one inbound line into a validated reading.
pub fn decode_line(line: &str, hints: &IdentityHints) -> Result<Reading, DecodeError> {
    let line = line.trim();
    if !line.starts_with(HEART_RATE_TAG) {
        return Err(DecodeError::Unrecognized);
    }

    // Unsplittable segments are ignored, duplicate keys last-write-wins.
    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    for segment in line.split(',') {
        if let Some((key, value)) = segment.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    let identity = DeviceIdentity {
        android_id: wire_field(&fields, "AndroidID", UNKNOWN_ANDROID),
        user_id: wire_field(&fields, "UserID", UNKNOWN_USER),
        watch_id: wire_field(&fields, "SmartWatchID", UNKNOWN_WATCH),
    };

    let resolution = identity::resolve(
        identity,
        hints.system_name.as_deref(),
        hints.device_alias.as_deref(),
    );
    if resolution.unresolved {
        return Err(DecodeError::UnresolvedIdentity);
    }
    let identity = resolution.identity;

    // Recovered values flow into the forwarded map as well.
    fields.insert("AndroidID".into(), identity.android_id.as_wire(UNKNOWN_ANDROID).to_string());
    fields.insert("UserID".into(), identity.user_id.as_wire(UNKNOWN_USER).to_string());
    fields.insert("SmartWatchID".into(), identity.watch_id.as_wire(UNKNOWN_WATCH).to_string());

    let value = match fields.get("Value") {
        None => return Err(DecodeError::MissingValue),
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| DecodeError::InvalidFormat(raw.clone()))?,
    };

    Ok(Reading {
        kind: ReadingKind::HeartRate,
        value,
        identity,
        raw: fields,
        received_at: Utc::now(),
    })
}

fn wire_field(fields: &BTreeMap<String, String>, key: &str, sentinel: &str) -> IdField {
    match fields.get(key) {
        Some(value) => IdField::from_wire(value, sentinel),
        // An absent identity field is treated like its sentinel: recovery
        // gets a chance to fill it in before the reading is forwarded.
        None => IdField::Unknown,
    }
}

/// `Vibrate:<intensity>,<pulses>,<durationMs>,<intervalMs>`, newline-terminated.
/// No escaping needed, all fields are integers.
pub fn encode_haptic_command(cmd: &HapticCommand) -> String {
    format!(
        "Vibrate:{},{},{},{}\n",
        cmd.intensity, cmd.pulses, cmd.duration_ms, cmd.interval_ms
    )
}

/// `Monitoring:<mode>`, written once right after the transport connects.
pub fn encode_mode_announcement(mode: MonitoringMode) -> String {
    format!("Monitoring:{mode}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints(system: &str, alias: &str) -> IdentityHints {
        IdentityHints {
            system_name: Some(system.to_string()),
            device_alias: Some(alias.to_string()),
        }
    }

    #[test]
    fn decodes_valid_line_with_android_recovery() {
        let line = "MonitoringType:HeartRate,Value:72,AndroidID:UnknownAndroid,UserID:7,SmartWatchID:3";
        let reading = decode_line(line, &hints("Android-50", "UserID-1-SmartWatchID-2")).unwrap();
        assert_eq!(reading.value, 72);
        assert_eq!(reading.identity.android_id, IdField::Known("50".into()));
        assert_eq!(reading.identity.user_id, IdField::Known("7".into()));
        assert_eq!(reading.raw.get("AndroidID").unwrap(), "50");
    }

    #[test]
    fn non_integer_value_is_invalid_format() {
        let line = "MonitoringType:HeartRate,Value:abc,UserID:7,SmartWatchID:3,AndroidID:50";
        let err = decode_line(line, &IdentityHints::default()).unwrap_err();
        assert_eq!(err, DecodeError::InvalidFormat("abc".into()));
    }

    #[test]
    fn negative_value_is_invalid_format() {
        let line = "MonitoringType:HeartRate,Value:-5,UserID:7,SmartWatchID:3,AndroidID:50";
        let err = decode_line(line, &IdentityHints::default()).unwrap_err();
        assert_eq!(err, DecodeError::InvalidFormat("-5".into()));
    }

    #[test]
    fn missing_value_is_reported() {
        let line = "MonitoringType:HeartRate,UserID:7,SmartWatchID:3,AndroidID:50";
        let err = decode_line(line, &IdentityHints::default()).unwrap_err();
        assert_eq!(err, DecodeError::MissingValue);
    }

    #[test]
    fn lines_without_the_heart_rate_tag_are_unrecognized() {
        for line in ["Battery:80", "MonitoringType:Temperature,Value:36", "", "garbage"] {
            let err = decode_line(line, &IdentityHints::default()).unwrap_err();
            assert_eq!(err, DecodeError::Unrecognized, "line {line:?}");
        }
    }

    #[test]
    fn unrecoverable_identity_fails_the_line() {
        let line = "MonitoringType:HeartRate,Value:72,AndroidID:UnknownAndroid,UserID:7,SmartWatchID:3";
        let err = decode_line(line, &IdentityHints::default()).unwrap_err();
        assert_eq!(err, DecodeError::UnresolvedIdentity);
    }

    #[test]
    fn duplicate_keys_last_write_wins_and_junk_segments_are_ignored() {
        let line = "MonitoringType:HeartRate,Value:60,Value:75,junk,AndroidID:5,UserID:7,SmartWatchID:3";
        let reading = decode_line(line, &IdentityHints::default()).unwrap();
        assert_eq!(reading.value, 75);
    }

    #[test]
    fn unknown_keys_are_preserved_in_raw() {
        let line = "MonitoringType:HeartRate,Value:72,Battery:80,AndroidID:5,UserID:7,SmartWatchID:3";
        let reading = decode_line(line, &IdentityHints::default()).unwrap();
        assert_eq!(reading.raw.get("Battery").unwrap(), "80");
    }

    #[test]
    fn encodes_haptic_command() {
        let cmd = HapticCommand {
            intensity: 2,
            pulses: 3,
            duration_ms: 250,
            interval_ms: 500,
        };
        assert_eq!(encode_haptic_command(&cmd), "Vibrate:2,3,250,500\n");
    }

    #[test]
    fn encodes_mode_announcement() {
        assert_eq!(encode_mode_announcement(MonitoringMode::HeartRate), "Monitoring:HeartRate\n");
        assert_eq!(encode_mode_announcement(MonitoringMode::SunAzimuth), "Monitoring:SunAzimuth\n");
    }

    #[test]
    fn haptic_command_fields_default_to_zero() {
        let cmd: HapticCommand = serde_json::from_str("{}").unwrap();
        assert_eq!(cmd, HapticCommand::default());

        let cmd: HapticCommand =
            serde_json::from_str(r#"{"pulses":3,"intensity":2,"duration":250,"interval":500,"message":"hi"}"#)
                .unwrap();
        assert_eq!(cmd.pulses, 3);
        assert_eq!(cmd.duration_ms, 250);
    }

    #[test]
    fn mode_parsing_round_trips_known_modes() {
        assert_eq!(MonitoringMode::parse("HeartRate"), MonitoringMode::HeartRate);
        assert_eq!(MonitoringMode::parse("MoonAzimuth"), MonitoringMode::MoonAzimuth);
        assert_eq!(MonitoringMode::parse("Temperature"), MonitoringMode::Unknown);
    }
}
