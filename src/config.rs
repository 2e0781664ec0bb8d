//! TOML configuration for a store and the tree inside it.
//!
//! ```toml
//! [pager]
//! page_size = 4096
//! synchronous = "normal"
//!
//! [tree]
//! min_fill_percent = 25
//! inline_limit = 1024
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::primitives::pager::PagerOptions;
use crate::storage::btree::{BTreeOptions, NodeGeometry};
use crate::types::{LarchError, Result};

/// Pager and tree options loaded together.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LarchConfig {
    /// Page store tunables.
    pub pager: PagerOptions,
    /// Tree shape.
    pub tree: BTreeOptions,
}

impl LarchConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            LarchError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&contents)
            .map_err(|err| LarchError::Config(format!("{}: {err}", path.display())))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|err| LarchError::Config(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| LarchError::Config(format!("failed to serialize config: {err}")))
    }

    /// Checks both sections, including that the tree shape fits the page
    /// size.
    pub fn validate(&self) -> Result<()> {
        self.pager.validate()?;
        NodeGeometry::new(self.pager.page_size as usize, &self.tree)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::Synchronous;

    #[test]
    fn missing_sections_fall_back_to_defaults() -> Result<()> {
        let config = LarchConfig::from_toml_str("[pager]\nsynchronous = \"off\"\n")?;
        assert_eq!(config.pager.synchronous, Synchronous::Off);
        assert_eq!(config.pager.page_size, PagerOptions::default().page_size);
        assert_eq!(config.tree, BTreeOptions::default());
        Ok(())
    }

    #[test]
    fn unknown_keys_and_bad_shapes_are_rejected() {
        assert!(LarchConfig::from_toml_str("[pager]\npage_sise = 4096\n").is_err());
        assert!(LarchConfig::from_toml_str("[tree]\nmin_fill_percent = 60\n").is_err());
        let err = LarchConfig::from_toml_str("[pager]\npage_size = 512\n").unwrap_err();
        assert!(matches!(err, LarchError::Config(_)));
    }

    #[test]
    fn round_trips_through_a_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("larch.toml");
        let config = LarchConfig {
            pager: PagerOptions {
                page_size: 8192,
                ..PagerOptions::default()
            },
            tree: BTreeOptions {
                inline_limit: 2048,
                ..BTreeOptions::default()
            },
        };
        fs::write(&path, config.to_toml_string()?)?;
        assert_eq!(LarchConfig::load(&path)?, config);
        Ok(())
    }
}
