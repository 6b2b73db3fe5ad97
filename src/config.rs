//! Translator configuration.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

/// Tunables affecting generated code.
///
/// `interpret` lists opcode names (as printed by `Opcode`'s `Debug` impl,
/// case-insensitive) that are forced through the interpreter delegate even
/// though a native generator exists.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Inline the RDRAM fast path without probing the handler table first.
    pub fast_memory: bool,
    /// Route every jump and branch through the interpreter delegate.
    pub no_compiled_jump: bool,
    /// Cycle-counter increment per guest instruction.
    pub count_per_op: u32,
    pub interpret: Vec<String>,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            fast_memory: true,
            no_compiled_jump: false,
            count_per_op: 2,
            interpret: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read config file: {}", err),
            ConfigError::Parse(err) => write!(f, "failed to parse config file: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}

impl JitConfig {
    pub fn load(path: &Path) -> Result<JitConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = toml::from_str(&text)?;
        Ok(config)
    }

    pub fn interprets(&self, name: &str) -> bool {
        self.interpret.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JitConfig::default();
        assert!(config.fast_memory);
        assert!(!config.no_compiled_jump);
        assert_eq!(config.count_per_op, 2);
        assert!(config.interpret.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jit.toml");
        std::fs::write(&path, "no_compiled_jump = true\ncount_per_op = 1\n").unwrap();
        let config = JitConfig::load(&path).unwrap();
        assert!(config.no_compiled_jump);
        assert_eq!(config.count_per_op, 1);

        let err = JitConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: JitConfig =
            toml::from_str("fast_memory = false\ninterpret = [\"LW\", \"sw\"]").unwrap();
        assert!(!config.fast_memory);
        assert!(!config.no_compiled_jump);
        assert!(config.interprets("lw"));
        assert!(config.interprets("SW"));
        assert!(!config.interprets("LD"));
    }
}
