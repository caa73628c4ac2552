use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use flowloom_core::traits::ScriptCatalog;
use flowloom_core::vars::StoreVars;

/// Reusable scripts keyed by normalized name, usually loaded from a
/// directory of `*.lua` files.
///
/// Lookup tries an exact normalized match first, then containment in either
/// direction; among containment hits the longest name wins.
#[derive(Debug, Clone, Default)]
pub struct DirectoryCatalog {
    scripts: BTreeMap<String, String>,
}

impl DirectoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.lua` file in `dir`, keyed by file stem.
    ///
    /// A missing or unreadable directory yields an empty catalog.
    pub fn load(dir: &Path) -> Self {
        let mut catalog = Self::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "Cannot read scripts directory");
                return catalog;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lua") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(script) => catalog.insert(stem, script),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read script"),
            }
        }

        info!(path = %dir.display(), count = catalog.len(), "Loaded script catalog");
        catalog
    }

    pub fn insert(&mut self, name: &str, script: impl Into<String>) {
        self.scripts
            .insert(StoreVars::normalize_key(name), script.into());
    }

    pub fn with(mut self, name: &str, script: impl Into<String>) -> Self {
        self.insert(name, script);
        self
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl ScriptCatalog for DirectoryCatalog {
    fn lookup(&self, name: &str) -> Option<String> {
        let wanted = StoreVars::normalize_key(name);
        if wanted.is_empty() {
            return None;
        }
        if let Some(script) = self.scripts.get(&wanted) {
            return Some(script.clone());
        }
        self.scripts
            .iter()
            .filter(|(key, _)| key.contains(&wanted) || wanted.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(key, script)| {
                debug!(name = %name, matched = %key, "Fuzzy catalog match");
                script.clone()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_wins() {
        let catalog = DirectoryCatalog::new()
            .with("send email", "-- short")
            .with("send email digest", "-- long");
        assert_eq!(catalog.lookup("Send-Email").as_deref(), Some("-- short"));
    }

    #[test]
    fn test_containment_either_way() {
        let catalog = DirectoryCatalog::new().with("fetch_orders", "-- fetch");
        assert_eq!(catalog.lookup("Fetch Orders From API").as_deref(), Some("-- fetch"));
        assert_eq!(catalog.lookup("orders").as_deref(), Some("-- fetch"));
        assert!(catalog.lookup("invoices").is_none());
        assert!(catalog.lookup("   ").is_none());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Notify Team.lua"), "log.info('hi')").unwrap();
        std::fs::write(dir.path().join("readme.md"), "ignored").unwrap();

        let catalog = DirectoryCatalog::load(dir.path());
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.lookup("notify team").as_deref(), Some("log.info('hi')"));

        assert!(DirectoryCatalog::load(&dir.path().join("missing")).is_empty());
    }
}
