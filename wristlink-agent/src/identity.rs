//! Identity recovery for readings tagged with unknown identifiers
//!
//! The watch may not know who it belongs to. Readings then carry sentinel
//! values (`UnknownAndroid`, `UnknownUser`, `UnknownWatch`) and the agent
//! tries to recover the real identifiers from auxiliary sources:
//! - the system device name (`Android-<digits>`) for the Android ID
//! - the paired device alias (`UserID-<digits>-SmartWatchID-<digits>`)
//!   for the user and watch IDs

use tracing::{debug, warn};

/// Wire sentinels the watch emits when it does not know an identifier.
pub const UNKNOWN_ANDROID: &str = "UnknownAndroid";
pub const UNKNOWN_USER: &str = "UnknownUser";
pub const UNKNOWN_WATCH: &str = "UnknownWatch";

/// A single identity field: either a recovered/known value or still unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdField {
    Known(String),
    Unknown,
}

impl IdField {
    /// Interpret a wire value against its sentinel.
    pub fn from_wire(value: &str, sentinel: &str) -> Self {
        if value == sentinel {
            IdField::Unknown
        } else {
            IdField::Known(value.to_string())
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, IdField::Unknown)
    }

    /// Wire representation, falling back to the field's sentinel.
    pub fn as_wire<'a>(&'a self, sentinel: &'a str) -> &'a str {
        match self {
            IdField::Known(v) => v,
            IdField::Unknown => sentinel,
        }
    }
}

/// The identifier triple attached to every reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub android_id: IdField,
    pub user_id: IdField,
    pub watch_id: IdField,
}

impl DeviceIdentity {
    pub fn unknown() -> Self {
        Self {
            android_id: IdField::Unknown,
            user_id: IdField::Unknown,
            watch_id: IdField::Unknown,
        }
    }

    /// True when no field is left unknown. Payloads tagged with an
    /// unresolved identity must never be forwarded to the backend.
    pub fn is_resolved(&self) -> bool {
        !self.android_id.is_unknown() && !self.user_id.is_unknown() && !self.watch_id.is_unknown()
    }
}

/// Outcome of a recovery attempt. `unresolved` is set when a field that was
/// unknown going in is still unknown after matching against its hint; that
/// is a valid terminal state, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub identity: DeviceIdentity,
    pub unresolved: bool,
}

/// Fill in whichever unknown fields the hints can recover.
pub fn resolve(
    identity: DeviceIdentity,
    system_name_hint: Option<&str>,
    device_alias_hint: Option<&str>,
) -> Resolution {
    let mut out = identity;
    let mut unresolved = false;

    if out.android_id.is_unknown() {
        match system_name_hint.and_then(parse_android_hint) {
            Some(id) => {
                debug!(android_id = %id, "recovered Android ID from system name");
                out.android_id = IdField::Known(id);
            }
            None => {
                warn!(hint = ?system_name_hint, "could not recover Android ID");
                unresolved = true;
            }
        }
    }

    if out.user_id.is_unknown() || out.watch_id.is_unknown() {
        match device_alias_hint.and_then(parse_alias_hint) {
            Some((user_id, watch_id)) => {
                debug!(%user_id, %watch_id, "recovered IDs from device alias");
                // Both come from the same authority, so a match refreshes both.
                out.user_id = IdField::Known(user_id);
                out.watch_id = IdField::Known(watch_id);
            }
            None => {
                warn!(hint = ?device_alias_hint, "could not recover user/watch IDs");
                unresolved = true;
            }
        }
    }

    Resolution {
        identity: out,
        unresolved,
    }
}

/// Accept only the exact shape `Android-<digits>`; extract the digits.
fn parse_android_hint(hint: &str) -> Option<String> {
    let digits = hint.strip_prefix("Android-")?;
    all_digits(digits).then(|| digits.to_string())
}

/// Accept only the exact shape `UserID-<digits>-SmartWatchID-<digits>`.
/// Partial matches are rejected as a whole; there is no recovery of just
/// one field from the alias.
fn parse_alias_hint(hint: &str) -> Option<(String, String)> {
    let rest = hint.strip_prefix("UserID-")?;
    let (user, watch) = rest.split_once("-SmartWatchID-")?;
    (all_digits(user) && all_digits(watch)).then(|| (user.to_string(), watch.to_string()))
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(v: &str) -> IdField {
        IdField::Known(v.to_string())
    }

    #[test]
    fn android_hint_extracts_digits() {
        let res = resolve(
            DeviceIdentity {
                android_id: IdField::Unknown,
                user_id: known("7"),
                watch_id: known("3"),
            },
            Some("Android-50"),
            None,
        );
        assert_eq!(res.identity.android_id, known("50"));
        assert!(!res.unresolved);
    }

    #[test]
    fn malformed_android_hints_leave_field_unknown() {
        for hint in ["Android-", "Android-abc", "android-50", "Android-50x", "Phone-50"] {
            let res = resolve(
                DeviceIdentity {
                    android_id: IdField::Unknown,
                    user_id: known("7"),
                    watch_id: known("3"),
                },
                Some(hint),
                None,
            );
            assert_eq!(res.identity.android_id, IdField::Unknown, "hint {hint:?}");
            assert!(res.unresolved, "hint {hint:?}");
        }
    }

    #[test]
    fn alias_hint_extracts_both_ids_positionally() {
        let res = resolve(DeviceIdentity::unknown(), Some("Android-1"), Some("UserID-123-SmartWatchID-456"));
        assert_eq!(res.identity.user_id, known("123"));
        assert_eq!(res.identity.watch_id, known("456"));
        assert!(!res.unresolved);
    }

    #[test]
    fn partial_alias_matches_recover_nothing() {
        for alias in [
            "UserID-123-SmartWatchID-",
            "UserID--SmartWatchID-456",
            "UserID-123",
            "SmartWatchID-456",
            "UserID-12a-SmartWatchID-456",
            "UserID-123-SmartWatchID-456-extra",
        ] {
            let res = resolve(
                DeviceIdentity {
                    android_id: known("50"),
                    user_id: IdField::Unknown,
                    watch_id: IdField::Unknown,
                },
                None,
                Some(alias),
            );
            assert_eq!(res.identity.user_id, IdField::Unknown, "alias {alias:?}");
            assert_eq!(res.identity.watch_id, IdField::Unknown, "alias {alias:?}");
            assert!(res.unresolved, "alias {alias:?}");
        }
    }

    #[test]
    fn known_fields_skip_recovery() {
        let identity = DeviceIdentity {
            android_id: known("50"),
            user_id: known("7"),
            watch_id: known("3"),
        };
        let res = resolve(identity.clone(), None, None);
        assert_eq!(res.identity, identity);
        assert!(!res.unresolved);
    }

    #[test]
    fn missing_hints_mark_unresolved() {
        let res = resolve(DeviceIdentity::unknown(), None, None);
        assert!(res.unresolved);
        assert!(!res.identity.is_resolved());
    }
}
