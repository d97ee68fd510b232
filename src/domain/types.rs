//! Shared identifiers and the check-in event model

use crate::domain::geo::GeoPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Declares a string-backed identifier newtype with the usual conversions
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Event (or event series) identifier; every engine state is scoped to one
    EventId
);
string_id!(
    /// Gate identifier (UUIDv7 for discovered gates)
    GateId
);
string_id!(
    /// Check-in record identifier, unique within the feed
    CheckinId
);
string_id!(
    /// NFC wristband identifier
    WristbandId
);
string_id!(
    /// Attendee category (e.g. "GA", "VIP")
    Category
);

impl GateId {
    pub fn generate() -> Self {
        Self(new_uuid_v7())
    }
}

/// Location estimate reported by the scanning client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationEstimate {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters (0 means the client had no fix)
    pub accuracy_m: f64,
}

impl LocationEstimate {
    /// Point usable for centroid computation, if any
    pub fn usable_point(&self, max_accuracy_m: f64) -> Option<GeoPoint> {
        let accurate = self.accuracy_m.is_finite()
            && self.accuracy_m > 0.0
            && self.accuracy_m <= max_accuracy_m;
        if !accurate {
            return None;
        }
        GeoPoint::new(self.latitude, self.longitude).ok()
    }
}

/// Ambient radio signals observed at scan time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbientSignals {
    #[serde(default)]
    pub wifi_ssids: Vec<String>,
    #[serde(default)]
    pub ble_beacons: Vec<String>,
}

impl AmbientSignals {
    pub fn is_empty(&self) -> bool {
        self.wifi_ssids.is_empty() && self.ble_beacons.is_empty()
    }

    /// Signals as namespaced keys so an SSID never collides with a beacon id
    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        self.wifi_ssids
            .iter()
            .map(|s| format!("wifi:{s}"))
            .chain(self.ble_beacons.iter().map(|b| format!("ble:{b}")))
    }
}

/// Outcome of the check-in at the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinStatus {
    Success,
    Denied,
    Error,
}

impl CheckinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckinStatus::Success => "success",
            CheckinStatus::Denied => "denied",
            CheckinStatus::Error => "error",
        }
    }
}

/// A single wristband scan. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinEvent {
    pub id: CheckinId,
    pub event_id: EventId,
    pub wristband_id: WristbandId,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    #[serde(default)]
    pub location: Option<LocationEstimate>,
    #[serde(default)]
    pub signals: AmbientSignals,
    pub status: CheckinStatus,
    #[serde(default)]
    pub processing_latency_ms: Option<u32>,
}

impl CheckinEvent {
    /// Create a successful scan without location or ambient signals
    pub fn new(
        id: impl Into<CheckinId>,
        event_id: impl Into<EventId>,
        wristband_id: impl Into<WristbandId>,
        category: impl Into<Category>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            event_id: event_id.into(),
            wristband_id: wristband_id.into(),
            timestamp,
            category: category.into(),
            location: None,
            signals: AmbientSignals::default(),
            status: CheckinStatus::Success,
            processing_latency_ms: None,
        }
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64, accuracy_m: f64) -> Self {
        self.location = Some(LocationEstimate { latitude, longitude, accuracy_m });
        self
    }

    pub fn with_wifi(mut self, ssid: &str) -> Self {
        self.signals.wifi_ssids.push(ssid.to_string());
        self
    }

    pub fn with_ble(mut self, beacon: &str) -> Self {
        self.signals.ble_beacons.push(beacon.to_string());
        self
    }

    pub fn with_status(mut self, status: CheckinStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u32) -> Self {
        self.processing_latency_ms = Some(latency_ms);
        self
    }

    /// Location usable for clustering, `None` for GPS-denied or low-accuracy scans
    #[inline]
    pub fn usable_point(&self, max_accuracy_m: f64) -> Option<GeoPoint> {
        self.location.and_then(|loc| loc.usable_point(max_accuracy_m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 18, 0, 0).unwrap()
    }

    #[test]
    fn test_usable_point_rejects_zero_accuracy() {
        let event = CheckinEvent::new("c1", "ev", "wb", "GA", ts()).with_location(55.0, 12.0, 0.0);
        assert!(event.usable_point(100.0).is_none());
    }

    #[test]
    fn test_usable_point_rejects_low_accuracy() {
        let event =
            CheckinEvent::new("c1", "ev", "wb", "GA", ts()).with_location(55.0, 12.0, 250.0);
        assert!(event.usable_point(100.0).is_none());
        assert!(event.usable_point(300.0).is_some());
    }

    #[test]
    fn test_usable_point_rejects_invalid_coordinates() {
        let event = CheckinEvent::new("c1", "ev", "wb", "GA", ts()).with_location(91.0, 12.0, 5.0);
        assert!(event.usable_point(100.0).is_none());
    }

    #[test]
    fn test_signal_keys_are_namespaced() {
        let event = CheckinEvent::new("c1", "ev", "wb", "GA", ts())
            .with_wifi("venue")
            .with_ble("venue");
        let keys: Vec<String> = event.signals.keys().collect();
        assert_eq!(keys, vec!["wifi:venue".to_string(), "ble:venue".to_string()]);
    }

    #[test]
    fn test_checkin_deserializes_without_optional_fields() {
        let json = r#"{
            "id": "c1",
            "event_id": "fest-2026",
            "wristband_id": "wb-9",
            "timestamp": "2026-07-04T18:00:00Z",
            "category": "VIP",
            "status": "success"
        }"#;
        let event: CheckinEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.category, Category::from("VIP"));
        assert!(event.location.is_none());
        assert!(event.signals.is_empty());
    }
}
