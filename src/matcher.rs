use semver::{Version, VersionReq};

/// Matching discipline for a registered protocol pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Byte-for-byte equality with the registered pattern.
    Exact,
    /// Equal base path, with the candidate's version component satisfying
    /// the pattern's version component as a semver range (e.g. a registered
    /// `/foo/^1.0.0` accepts an offered `/foo/1.2.0` but not `/foo/2.0.0`).
    SemverRange,
}

/// Decide whether an offered protocol id satisfies a registered pattern.
///
/// Pure function: same inputs, same answer, no side effects.
pub fn matches(candidate: &str, pattern: &str, kind: MatchKind) -> bool {
    match kind {
        MatchKind::Exact => candidate == pattern,
        MatchKind::SemverRange => semver_matches(candidate, pattern),
    }
}

/// Split `/name/version` into base path and version component.
fn split_version(id: &str) -> Option<(&str, &str)> {
    let idx = id.rfind('/')?;
    if idx == 0 || idx + 1 == id.len() {
        // No base path ("/1.0.0") or no version component ("/foo/").
        return None;
    }
    Some((&id[..idx], &id[idx + 1..]))
}

fn semver_matches(candidate: &str, pattern: &str) -> bool {
    let (cand_base, cand_version) = match split_version(candidate) {
        Some(parts) => parts,
        None => return false,
    };
    let (pat_base, pat_range) = match split_version(pattern) {
        Some(parts) => parts,
        None => return false,
    };
    if cand_base != pat_base {
        return false;
    }

    let range = match VersionReq::parse(pat_range) {
        Ok(range) => range,
        Err(_) => return false,
    };
    let version = match Version::parse(cand_version) {
        Ok(version) => version,
        Err(_) => return false,
    };
    range.matches(&version)
}
