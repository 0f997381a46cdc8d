use rand::RngCore;

/// Sanitize a device-supplied identifier to `^[A-Za-z0-9._-]{1,64}$`.
///
/// Any character outside the allowed set is dropped rather than replaced, so
/// the function is idempotent: `safe_device_id(&safe_device_id(x)) ==
/// safe_device_id(x)` for all `x`. An input that sanitizes to the empty
/// string falls back to `"unknown"`.
pub fn safe_device_id(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(64)
        .collect();

    if out.is_empty() {
        out = "unknown".to_string();
    }
    out
}

/// Opaque 8-byte hex session id, generated at WebSocket accept.
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Format an ISO-8601 UTC timestamp for use in a filesystem path, replacing
/// `:` and `.` with `-` so the result is a valid path component.
pub fn sanitize_iso_for_path(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_disallowed_characters() {
        assert_eq!(safe_device_id("dev A!@# 001"), "devA001");
    }

    #[test]
    fn truncates_to_64_chars() {
        let long = "a".repeat(100);
        assert_eq!(safe_device_id(&long).len(), 64);
    }

    #[test]
    fn empty_input_falls_back_to_unknown() {
        assert_eq!(safe_device_id("!!!"), "unknown");
    }

    #[test]
    fn is_idempotent() {
        let once = safe_device_id("dev/../A:001");
        let twice = safe_device_id(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn matches_expected_pattern() {
        let re = regex_lite(&safe_device_id("legit-device_01.local"));
        assert!(re);
    }

    fn regex_lite(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= 64
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    #[test]
    fn session_ids_are_distinct_and_well_formed() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
