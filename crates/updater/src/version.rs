//! Version comparison.

use semver::Version;

/// Parse a version string leniently: an optional `v` prefix is dropped and a
/// missing minor or patch component is taken as zero (`v1.2` is `1.2.0`).
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    if parts
        .iter()
        .any(|part| part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    Version::parse(&padded).ok()
}

/// Whether `latest` should replace `current`.
///
/// Both sides must parse for an ordering decision. If either is malformed the
/// versions are treated as different, so an update is reported as available.
pub fn is_newer(latest: &str, current: &str) -> bool {
    match (parse_version(latest), parse_version(current)) {
        (Some(latest), Some(current)) => latest > current,
        _ => {
            tracing::warn!(
                latest,
                current,
                "cannot order versions; treating them as different"
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_parsing() {
        assert_eq!(parse_version("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("1.0"), Some(Version::new(1, 0, 0)));
        assert_eq!(parse_version(" 7 "), Some(Version::new(7, 0, 0)));
        assert_eq!(
            parse_version("2.1-beta.1").map(|v| v.to_string()),
            Some("2.1.0-beta.1".to_string())
        );
        assert_eq!(parse_version("nightly"), None);
        assert_eq!(parse_version("1..2"), None);
    }

    #[test]
    fn ordering_follows_semver() {
        assert!(is_newer("1.10.0", "1.9.9"));
        assert!(is_newer("v2.0.0", "2.0.0-rc.1"));
        assert!(!is_newer("1.0.0", "1.0.0"));
        assert!(!is_newer("v1.0", "1.0.0"));
        assert!(!is_newer("0.9.0", "1.0.0"));
    }

    #[test]
    fn malformed_versions_are_never_assumed_equal() {
        assert!(is_newer("nightly", "nightly"));
        assert!(is_newer("1.0.0", "unknown"));
    }
}
