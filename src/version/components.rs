//! Component selection and successor computation

use std::collections::{BTreeMap, BTreeSet};

use semver::Version;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::matrix::ComponentVersions;
use super::parse_version;
use crate::error::{Error, Result};
use crate::store::ComponentOverride;

/// Status of the versions a default is picked from
pub const STATUS_RECOMMENDED: &str = "recommended";

/// A component version as offered to callers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub image_path: String,
    pub image_hash: String,
    pub status: String,
    pub critical: bool,
    pub default: bool,
    pub disabled: bool,
}

/// Admissible versions of one component keyed by version string
pub type ComponentSelection = BTreeMap<String, Component>;

/// Build the selection for one component map.
///
/// Versions below `minimum` are dropped and versions that can not be parsed
/// are skipped. The default is the override's default when it survived and
/// is not disabled, else the highest recommended version that is not
/// disabled. A disabled version is never the default.
pub fn select(
    versions: &ComponentVersions,
    minimum: Option<&Version>,
    overrides: Option<&ComponentOverride>,
) -> ComponentSelection {
    let disabled: BTreeSet<&str> = overrides
        .map(|o| o.disabled_versions.iter().map(String::as_str).collect())
        .unwrap_or_default();

    let mut selection = ComponentSelection::new();
    let mut candidate: Option<(Version, &str)> = None;

    for (raw, component) in versions {
        let parsed = match parse_version(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(version = %raw, error = %e, "Skipping unparsable component version");
                continue;
            }
        };
        if minimum.map_or(false, |min| parsed < *min) {
            continue;
        }

        let is_disabled = disabled.contains(raw.as_str());
        selection.insert(
            raw.clone(),
            Component {
                image_path: component.image_path.clone(),
                image_hash: component.image_hash.clone(),
                status: component.status.clone(),
                critical: component.critical,
                default: false,
                disabled: is_disabled,
            },
        );

        let recommended = component.status == STATUS_RECOMMENDED;
        if recommended && !is_disabled && candidate.as_ref().map_or(true, |(best, _)| parsed > *best) {
            candidate = Some((parsed, raw.as_str()));
        }
    }

    let preferred = overrides
        .and_then(|o| o.default_version.as_deref())
        .filter(|v| selection.get(*v).map_or(false, |c| !c.disabled));

    if let Some(version) = preferred.or(candidate.map(|(_, raw)| raw)) {
        if let Some(component) = selection.get_mut(version) {
            component.default = true;
        }
    }

    selection
}

/// Enable or disable one version
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionToggle {
    pub version: String,
    pub enable: bool,
    pub disable: bool,
}

/// Requested change of a component's overrides
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeComponent {
    /// New default; `None` or empty keeps the stored one
    pub default_version: Option<String>,
    pub versions: Vec<VersionToggle>,
}

/// Rejected component change
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangeError {
    #[error("enable and disable for version {0} can't be passed together")]
    EnableAndDisable(String),

    #[error("default version can't be disabled")]
    DefaultDisabled,
}

/// Apply a change to stored overrides.
///
/// Validation happens before anything is returned, so a rejected change
/// leaves the caller's copy untouched.
pub fn set_component(
    current: Option<&ComponentOverride>,
    change: &ChangeComponent,
) -> std::result::Result<ComponentOverride, ChangeError> {
    let mut updated = current.cloned().unwrap_or_default();

    if let Some(default) = change.default_version.as_deref().filter(|v| !v.is_empty()) {
        updated.default_version = Some(default.to_string());
    }

    let mut disabled: BTreeSet<String> = updated.disabled_versions.iter().cloned().collect();
    for toggle in &change.versions {
        if toggle.enable && toggle.disable {
            return Err(ChangeError::EnableAndDisable(toggle.version.clone()));
        }
        if toggle.enable {
            disabled.remove(&toggle.version);
        }
        if toggle.disable {
            disabled.insert(toggle.version.clone());
        }
    }

    if let Some(default) = &updated.default_version {
        if disabled.contains(default) {
            return Err(ChangeError::DefaultDisabled);
        }
    }

    updated.disabled_versions = disabled.into_iter().collect();
    Ok(updated)
}

/// Smallest version strictly greater than `installed`.
///
/// Returns the matching input string so callers can index the map it came
/// from. Any unparsable entry is an error.
pub fn next<S: AsRef<str>>(versions: &[S], installed: &str) -> Result<Option<String>> {
    let installed = parse_version(installed)?;

    let mut best: Option<(Version, &str)> = None;
    for raw in versions {
        let raw = raw.as_ref();
        let parsed = parse_version(raw)?;
        if parsed > installed && best.as_ref().map_or(true, |(b, _)| parsed < *b) {
            best = Some((parsed, raw));
        }
    }

    Ok(best.map(|(_, raw)| raw.to_string()))
}

/// Highest recommended version of a component map, `None` when no version
/// is recommended.
pub fn latest_recommended(versions: &ComponentVersions) -> Result<Option<String>> {
    if versions.is_empty() {
        return Err(Error::not_found("no versions to compare current version with found"));
    }

    let mut latest: Option<(Version, &str)> = None;
    for (raw, component) in versions {
        let parsed = parse_version(raw)?;
        if component.status == STATUS_RECOMMENDED
            && latest.as_ref().map_or(true, |(l, _)| parsed > *l)
        {
            latest = Some((parsed, raw.as_str()));
        }
    }

    Ok(latest.map(|(_, raw)| raw.to_string()))
}

/// The component flagged as default
pub fn default_component(selection: &ComponentSelection) -> Result<&Component> {
    if selection.is_empty() {
        return Err(Error::not_found("no versions to compare current version with found"));
    }
    selection
        .values()
        .find(|c| c.default)
        .ok_or_else(|| Error::not_found("cannot find a default version in the components list"))
}
