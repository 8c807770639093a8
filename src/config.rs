//! Node configuration: built-in defaults, then an optional file (TOML or
//! JSON, by extension), then `CONODE_` environment variables. Nested keys
//! use a double underscore, e.g. `CONODE_SKIPCHAIN__BASE_HEIGHT=8`.

use std::path::{Path, PathBuf};

use ::config::{Config, Environment, File};
use conode_byzcoin::ByzCoinConfig;
use conode_calypso::CalypsoConfig;
use conode_skipchain::SkipchainConfig;
use serde::{Deserialize, Serialize};

use crate::ConodeResult;

pub const ENV_PREFIX: &str = "CONODE";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConodeConfig {
    /// Conodes started by a local cluster
    pub nodes: usize,
    /// Where every conode keeps its sled database; memory only when unset
    pub data_dir: Option<PathBuf>,
    /// Filter directive used when `RUST_LOG` is not set
    pub log_level: String,
    pub skipchain: SkipchainConfig,
    pub byzcoin: ByzCoinConfig,
    pub calypso: CalypsoConfig,
}

impl Default for ConodeConfig {
    fn default() -> Self {
        ConodeConfig {
            nodes: 4,
            data_dir: None,
            log_level: "info".into(),
            skipchain: SkipchainConfig::default(),
            byzcoin: ByzCoinConfig::default(),
            calypso: CalypsoConfig::default(),
        }
    }
}

impl ConodeConfig {
    /// Loads the configuration; a missing `path` only means no file layer.
    pub fn load(path: Option<&Path>) -> ConodeResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Database directory of conode `index`, if the cluster persists.
    pub fn node_dir(&self, index: usize) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(format!("conode-{}", index)))
    }

    /// Effective configuration as pretty JSON, loadable again as a file.
    pub fn to_json(&self) -> ConodeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_without_sources() {
        let cfg = ConodeConfig::load(Some(Path::new("/nonexistent/conode.toml"))).unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.skipchain.base_height, SkipchainConfig::default().base_height);
        assert_eq!(cfg.calypso.dkg_timeout_ms, CalypsoConfig::default().dkg_timeout_ms);
        assert!(cfg.node_dir(0).is_none());
    }

    #[test]
    fn test_file_overrides_defaults_and_round_trips() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            "log_level = \"debug\"\ndata_dir = \"/var/lib/conode\"\n\n[skipchain]\nbase_height = 7\n\n[byzcoin]\nblock_interval_ms = 250\n"
        )
        .unwrap();
        let cfg = ConodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.skipchain.base_height, 7);
        assert_eq!(cfg.skipchain.max_height, SkipchainConfig::default().max_height);
        assert_eq!(cfg.byzcoin.block_interval_ms, 250);
        assert_eq!(cfg.node_dir(2), Some(PathBuf::from("/var/lib/conode/conode-2")));

        let mut again = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        again.write_all(cfg.to_json().unwrap().as_bytes()).unwrap();
        let reloaded = ConodeConfig::load(Some(again.path())).unwrap();
        assert_eq!(reloaded.to_json().unwrap(), cfg.to_json().unwrap());
    }
}
