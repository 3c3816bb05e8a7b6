//! Names for helper pods and archive files.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Maximum length of a DNS-1123 label, which pod names must satisfy.
pub const MAX_DNS_LABEL_LENGTH: usize = 63;

const HELPER_POD_PREFIX: &str = "pvc-backup";
const RANDOM_SUFFIX_LENGTH: usize = 5;

/// Returns a fresh helper pod name for a claim.
///
/// The name embeds the claim coordinates for readability, followed by a UTC
/// timestamp and a random suffix so that retries within the same second never
/// collide. The readable part is truncated first when the label would exceed
/// [`MAX_DNS_LABEL_LENGTH`].
pub fn helper_pod_name(namespace: &str, claim_name: &str, now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    let unique = format!(
        "{}-{}",
        now.format("%Y%m%d%H%M%S"),
        &suffix[..RANDOM_SUFFIX_LENGTH]
    );

    let budget = MAX_DNS_LABEL_LENGTH - unique.len() - 1;
    let readable = sanitize_dns_label(
        &format!("{HELPER_POD_PREFIX}-{namespace}-{claim_name}"),
        budget,
    );

    format!("{readable}-{unique}")
}

/// Returns the archive file name for a claim: `<YYYYmmddTHHMMSSZ>__<namespace>__<claim>.tar.gz`.
pub fn archive_name(namespace: &str, claim_name: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}__{}__{}.tar.gz",
        now.format("%Y%m%dT%H%M%SZ"),
        sanitize_file_component(namespace),
        sanitize_file_component(claim_name)
    )
}

/// Lowercases `value`, replaces characters outside `[a-z0-9-]` with `-`,
/// collapses dash runs and trims dashes from both ends.
pub fn sanitize_dns_label(value: &str, max_length: usize) -> String {
    let mut label = String::with_capacity(value.len());
    for c in value.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (label.is_empty() || label.ends_with('-')) {
            continue;
        }
        label.push(c);
    }

    label.truncate(max_length);
    let label = label.trim_end_matches('-');

    if label.is_empty() {
        HELPER_POD_PREFIX.to_owned()
    } else {
        label.to_owned()
    }
}

/// Replaces characters outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_file_component(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "unknown".to_owned()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn test_archive_name_format() {
        assert_eq!(
            archive_name("apps", "data-pvc", fixed_now()),
            "20240309T140507Z__apps__data-pvc.tar.gz"
        );
        assert_eq!(
            archive_name("team a", "db/0", fixed_now()),
            "20240309T140507Z__team_a__db_0.tar.gz"
        );
    }

    #[test]
    fn test_helper_pod_name_is_valid_label() {
        let long_claim = "x".repeat(120);
        let name = helper_pod_name("Apps_Prod", &long_claim, fixed_now());

        assert!(name.len() <= MAX_DNS_LABEL_LENGTH);
        assert!(name.starts_with("pvc-backup-apps-prod-"));
        assert!(
            name.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn test_helper_pod_names_are_unique_within_a_second() {
        let first = helper_pod_name("apps", "data", fixed_now());
        let second = helper_pod_name("apps", "data", fixed_now());
        assert_ne!(first, second);
    }

    #[test]
    fn test_sanitize_dns_label_collapses_dashes() {
        assert_eq!(sanitize_dns_label("--A__b..c--", 63), "a-b-c");
        assert_eq!(sanitize_dns_label("___", 63), "pvc-backup");
        assert_eq!(sanitize_dns_label("abc-def", 4), "abc");
    }
}
