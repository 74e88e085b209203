//! Version information for qsa-monitor.

/// qsa-monitor version from Cargo.toml
pub const QSA_MONITOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Key under which the probe reports its own version in worker metadata.
pub const VERSION_KEY: &str = "qsa-monitor";

/// Add the probe's own version to a component/version map.
pub fn stamp_versions(versions: &mut std::collections::BTreeMap<String, String>) {
    versions.insert(VERSION_KEY.to_string(), QSA_MONITOR_VERSION.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn stamp_keeps_other_components() {
        let mut versions = BTreeMap::from([("qgis".to_string(), "3.34.4".to_string())]);
        stamp_versions(&mut versions);

        assert_eq!(versions.len(), 2);
        assert_eq!(versions["qgis"], "3.34.4");
        assert_eq!(versions[VERSION_KEY], QSA_MONITOR_VERSION);
    }

    #[test]
    fn stamp_overrides_stale_entry() {
        let mut versions = BTreeMap::from([(VERSION_KEY.to_string(), "0.0.1".to_string())]);
        stamp_versions(&mut versions);
        assert_eq!(versions[VERSION_KEY], QSA_MONITOR_VERSION);
    }
}
