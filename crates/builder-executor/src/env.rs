//! Restricted child environment.

use std::collections::BTreeMap;
use std::path::Path;

/// Host variables forwarded to build commands. Nothing else leaks through.
pub const FORWARDED_VARS: [&str; 4] = ["PATH", "SHELL", "USER", "LOGNAME"];

/// Environment for build commands: `HOME` pinned to `home` plus the
/// forwarded host variables.
pub fn restricted_env(home: &Path) -> BTreeMap<String, String> {
    restricted_env_from(home, |key| std::env::var(key).ok())
}

/// Like [`restricted_env`] with an explicit host lookup.
pub fn restricted_env_from<F>(home: &Path, lookup: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = BTreeMap::new();
    for key in FORWARDED_VARS {
        if let Some(value) = lookup(key) {
            env.insert(key.to_string(), value);
        }
    }
    env.insert("HOME".to_string(), home.to_string_lossy().to_string());
    env
}
