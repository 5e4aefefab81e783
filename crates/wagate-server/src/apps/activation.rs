use std::collections::BTreeSet;

use tracing::warn;

use super::{AppCatalog, AppName};

/// Deployment switches that decide which apps run in this process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationConfig {
    pub enabled_globally: bool,
    pub allow_list: Option<BTreeSet<AppName>>,
    pub deny_list: Option<BTreeSet<AppName>>,
}

impl ActivationConfig {
    /// Read `WAGATE_APPS_ENABLED`, `WAGATE_APPS_ON` and `WAGATE_APPS_OFF`.
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var("WAGATE_APPS_ENABLED").ok().as_deref(),
            std::env::var("WAGATE_APPS_ON").ok().as_deref(),
            std::env::var("WAGATE_APPS_OFF").ok().as_deref(),
        )
    }

    /// Build the config from raw setting values.
    ///
    /// Lists are comma-separated app names. Unknown names are dropped with a
    /// warning; an empty or absent list counts as "not set".
    pub fn from_values(enabled: Option<&str>, allow: Option<&str>, deny: Option<&str>) -> Self {
        Self {
            enabled_globally: enabled.is_some_and(parse_flag),
            allow_list: allow.and_then(|v| parse_list("WAGATE_APPS_ON", v)),
            deny_list: deny.and_then(|v| parse_list("WAGATE_APPS_OFF", v)),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_list(setting: &str, value: &str) -> Option<BTreeSet<AppName>> {
    let mut any = false;
    let mut names = BTreeSet::new();
    for raw in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        any = true;
        match raw.parse::<AppName>() {
            Ok(name) => {
                names.insert(name);
            }
            Err(_) => warn!(setting, app = raw, "ignoring unknown app name"),
        }
    }
    // A list naming only unknown apps still restricts (allow) or removes nothing (deny).
    any.then_some(names)
}

/// The apps that are live for the lifetime of this process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSet(BTreeSet<AppName>);

impl ActiveSet {
    pub fn contains(&self, name: AppName) -> bool {
        self.0.contains(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = AppName> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<AppName> for ActiveSet {
    fn from_iter<I: IntoIterator<Item = AppName>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Compute which apps are active.
///
/// Disabled globally → nothing. Otherwise the full catalog, narrowed to the
/// allow-list when one is set, minus the deny-list when one is set. The
/// deny-list is applied last so it always wins.
pub fn compute_active_set(config: &ActivationConfig, catalog: &AppCatalog) -> ActiveSet {
    if !config.enabled_globally {
        return ActiveSet::default();
    }

    let mut active: BTreeSet<AppName> = catalog.definitions().map(|d| d.name).collect();

    if let Some(allow) = &config.allow_list {
        active.retain(|name| allow.contains(name));
    }
    if let Some(deny) = &config.deny_list {
        active.retain(|name| !deny.contains(name));
    }

    ActiveSet(active)
}
