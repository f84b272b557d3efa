//! Editor configuration, loaded from RON.
//!
//! ```ron
//! (
//!     max_undo_levels: 200,
//!     default_sketch_color: "#4477aa",
//! )
//! ```
//!
//! Every field is optional; missing ones take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::project::{DEFAULT_SKETCH_COLOR, ELEMENTS_COLLECTION};
use crate::relations::ELEMENT_RELATIONS_COLLECTION;
use crate::undo::DEFAULT_MAX_UNDO_LEVELS;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Undo steps kept. 0 keeps all of them.
    pub max_undo_levels: usize,
    pub elements_collection: String,
    pub relations_collection: String,
    pub default_sketch_color: String,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            max_undo_levels: DEFAULT_MAX_UNDO_LEVELS,
            elements_collection: ELEMENTS_COLLECTION.to_string(),
            relations_collection: ELEMENT_RELATIONS_COLLECTION.to_string(),
            default_sketch_color: DEFAULT_SKETCH_COLOR.to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl EditorConfig {
    pub fn from_ron(source: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_ron(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(EditorConfig::from_ron("()").unwrap(), EditorConfig::default());
    }

    #[test]
    fn test_partial_config() {
        let config = EditorConfig::from_ron("(max_undo_levels: 5, log_filter: \"debug\")").unwrap();
        assert_eq!(config.max_undo_levels, 5);
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.elements_collection, "elements");
        assert_eq!(config.relations_collection, "elementRelations");
    }

    #[test]
    fn test_parse_error() {
        let err = EditorConfig::from_ron("(max_undo_levels: \"many\")").unwrap_err();
        assert!(matches!(err, ConfigError::Ron(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(default_sketch_color: \"#4477aa\")").unwrap();
        let config = EditorConfig::load(file.path()).unwrap();
        assert_eq!(config.default_sketch_color, "#4477aa");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EditorConfig::load(dir.path().join("editor.ron")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
