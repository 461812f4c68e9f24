//! Version resolution against a registry's published versions.

use crate::error::{HostError, HostResult};
use crate::registry_client::PublishedVersion;
use semver::{Version, VersionReq};
use tracing::{debug, warn};

/// A published version chosen by [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub version: Version,
    pub checksum: String,
    pub signing_key: Option<String>,
}

/// Parses a requested range.
///
/// A bare version (`1.2.0`) pins exactly that version; anything else uses
/// Cargo-style requirement syntax (`^1.0`, `~1.2`, `>=1, <2`, `1.*`).
pub fn parse_range(range: &str) -> HostResult<VersionReq> {
    let trimmed = range.trim();
    let text = if Version::parse(trimmed).is_ok() {
        format!("={trimmed}")
    } else {
        trimmed.to_string()
    };
    VersionReq::parse(&text).map_err(|e| HostError::InvalidVersionRange {
        range: range.to_string(),
        reason: e.to_string(),
    })
}

/// Picks the greatest published version satisfying `range`.
///
/// With no range (or an empty one) the greatest non-prerelease version wins.
/// Prereleases are only eligible when the range names one explicitly.
/// Published entries with unparseable versions are skipped.
pub fn resolve(
    plugin_id: &str,
    range: Option<&str>,
    published: &[PublishedVersion],
) -> HostResult<ResolvedVersion> {
    let req = match range.map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) => Some(parse_range(r)?),
        None => None,
    };

    let best = published
        .iter()
        .filter_map(|p| match Version::parse(p.version.trim()) {
            Ok(v) => Some((v, p)),
            Err(e) => {
                warn!(plugin_id = %plugin_id, version = %p.version, "Skipping unparseable published version: {e}");
                None
            }
        })
        .filter(|(v, _)| match &req {
            Some(req) => req.matches(v),
            None => v.pre.is_empty(),
        })
        .max_by(|(a, _), (b, _)| a.cmp(b));

    match best {
        Some((version, p)) => {
            debug!(plugin_id = %plugin_id, version = %version, "Resolved version");
            Ok(ResolvedVersion {
                version,
                checksum: p.checksum.clone(),
                signing_key: p.signing_key.clone(),
            })
        }
        None => Err(HostError::NoMatchingVersion {
            plugin_id: plugin_id.to_string(),
            range: range.unwrap_or("*").to_string(),
        }),
    }
}
