//! Version compatibility resolution
//!
//! The remote version service publishes, per product and product version,
//! the component images known to work together. This module fetches those
//! matrices, turns them into admissible/default/disabled selections and
//! computes upgrade successors.

mod client;
mod components;
mod matrix;
mod resolver;

pub use client::{VersionServiceClient, CACHE_TTL};
pub use components::{
    default_component, latest_recommended, next, select, set_component, ChangeComponent,
    ChangeError, Component, ComponentSelection, VersionToggle, STATUS_RECOMMENDED,
};
pub use matrix::{
    ComponentVersion, ComponentVersions, Matrix, MatrixParams, VersionEntry, VersionResponse,
};
pub use resolver::{LatestOperatorVersions, VersionResolver, PLATFORM_PRODUCT};

use semver::Version;

use crate::error::{Error, Result};

/// Parse a version the way the version service writes them.
///
/// A leading `v` is dropped and missing minor/patch segments are padded with
/// zeros, so `v1.11` parses as `1.11.0`. Anything after `-` is kept as the
/// pre-release part (`8.0.19-10.1`). Leading zeros of numeric segments are
/// dropped, so `4.0.10-05` reads as `4.0.10-5`.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let split = stripped
        .find(|c: char| c == '-' || c == '+')
        .unwrap_or(stripped.len());
    let (core, rest) = stripped.split_at(split);
    let core = strip_leading_zeros(core);
    let rest = match rest.strip_prefix('-') {
        Some(suffix) => {
            let (pre, build) = suffix.split_at(suffix.find('+').unwrap_or(suffix.len()));
            format!("-{}{}", strip_leading_zeros(pre), build)
        }
        None => rest.to_string(),
    };

    let padded = match core.split('.').count() {
        1 => format!("{}.0.0{}", core, rest),
        2 => format!("{}.0{}", core, rest),
        _ => format!("{}{}", core, rest),
    };

    Version::parse(&padded).map_err(|source| Error::Version {
        version: raw.to_string(),
        source,
    })
}

/// `007.1` becomes `7.1`; non-numeric segments are left alone
fn strip_leading_zeros(dotted: &str) -> String {
    dotted
        .split('.')
        .map(|segment| {
            if segment.len() > 1 && segment.bytes().all(|b| b.is_ascii_digit()) {
                let trimmed = segment.trim_start_matches('0');
                if trimmed.is_empty() {
                    "0"
                } else {
                    trimmed
                }
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// `major.minor.patch` of a version, without pre-release or build metadata
pub fn core_version(raw: &str) -> Result<String> {
    let version = parse_version(raw)?;
    Ok(format!("{}.{}.{}", version.major, version.minor, version.patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.11.0").unwrap(), Version::new(1, 11, 0));
        assert_eq!(parse_version("v1.11").unwrap(), Version::new(1, 11, 0));
        assert_eq!(parse_version("2").unwrap(), Version::new(2, 0, 0));

        let pxc = parse_version("8.0.19-10.1").unwrap();
        assert_eq!(pxc.pre.as_str(), "10.1");
        assert!(parse_version("8.0.21-12.1").unwrap() > pxc);
    }

    #[test]
    fn test_parse_version_with_leading_zeros() {
        let mongo = parse_version("4.0.10-05").unwrap();
        assert_eq!(mongo.pre.as_str(), "5");
        assert!(parse_version("4.0.10-06").unwrap() > mongo);
        assert_eq!(parse_version("01.02.00").unwrap(), Version::new(1, 2, 0));
    }

    #[test]
    fn test_parse_version_rejects_garbage() {
        for raw in ["", "abc", "1.x.0", "1.2.3.4"] {
            let err = parse_version(raw).unwrap_err();
            assert!(matches!(err, Error::Version { .. }), "{raw}");
        }
    }

    #[test]
    fn test_core_version() {
        assert_eq!(core_version("2.26.0-HEAD-abcdef").unwrap(), "2.26.0");
        assert_eq!(core_version("v2.30").unwrap(), "2.30.0");
    }
}
