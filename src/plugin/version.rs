//! Lenient version comparison
//!
//! Catalog versions are "mostly semver": a leading `v`, missing minor or
//! patch components and build metadata all show up in the wild. Anything
//! that still fails to parse is compared segment by segment on its numbers.

use semver::Version;
use std::cmp::Ordering;

/// Parse `raw` as semver after normalising the common deviations
pub fn parse_lenient(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let without_build = trimmed.split('+').next().unwrap_or(trimmed);
    let (core, pre) = match without_build.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (without_build, None),
    };

    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }

    let normalised = match pre {
        Some(pre) => format!("{}-{}", parts.join("."), pre),
        None => parts.join("."),
    };
    Version::parse(&normalised).ok()
}

fn numeric_segments(raw: &str) -> Vec<u64> {
    raw.split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Order two version strings by precedence
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if let (Some(va), Some(vb)) = (parse_lenient(a), parse_lenient(b)) {
        return va.cmp_precedence(&vb);
    }

    let sa = numeric_segments(a);
    let sb = numeric_segments(b);
    let len = sa.len().max(sb.len());
    for i in 0..len {
        let x = sa.get(i).copied().unwrap_or(0);
        let y = sb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `candidate` has higher precedence than `current`
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}
