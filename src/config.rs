//! Provider configuration.
//!
//! This module handles loading configuration from multiple sources:
//! - A TOML configuration file following the XDG Base Directory specification
//! - Environment variables
//!
//! The access token set here is the *explicit* token. The `AZDO_PAT`
//! environment variable is consulted separately by the credential provider so
//! that the resolution order (explicit, environment, identity) stays visible.
//!
//! ## Example
//!
//! ```rust
//! use azdo_reconciler::config::{LookupPolicy, ProviderConfig};
//!
//! let config = ProviderConfig::default().merge(ProviderConfig::load_from_env());
//! assert!(matches!(
//!     config.lookup_policy(),
//!     LookupPolicy::Strict | LookupPolicy::Lenient
//! ));
//! ```

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the lookup policy.
pub const LOOKUP_POLICY_ENV: &str = "AZDO_LOOKUP_POLICY";

/// How lookup failures other than a plain 404 are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupPolicy {
    /// Only a 404 means "absent"; authorization and transient failures are fatal.
    #[default]
    Strict,
    /// Every lookup failure means "absent" and may lead to a create attempt.
    Lenient,
}

impl LookupPolicy {
    /// Parse a lookup policy from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "lenient" => Some(Self::Lenient),
            _ => None,
        }
    }
}

/// Temporary struct for deserializing TOML configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ConfigFile {
    access_token: Option<String>,
    lookup_policy: Option<LookupPolicy>,
}

/// Configuration shared by every reconciler invocation.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    /// Explicit access token (PAT). Takes precedence over `AZDO_PAT` and identity.
    pub access_token: Option<SecretString>,
    /// Lookup failure policy; `None` until some layer sets it.
    pub lookup_policy: Option<LookupPolicy>,
}

impl ProviderConfig {
    /// Creates a configuration carrying an explicit access token.
    pub fn with_access_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(SecretString::from(token.into())),
            ..Self::default()
        }
    }

    /// Effective lookup policy after layering.
    pub fn lookup_policy(&self) -> LookupPolicy {
        self.lookup_policy.unwrap_or_default()
    }

    /// Load configuration from the XDG config directory.
    ///
    /// Returns the default configuration when no file exists.
    #[must_use = "this returns the loaded configuration which should be used"]
    pub fn load_from_file() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        if !config_path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from an explicit file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(Self {
            access_token: file
                .access_token
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
            lookup_policy: file.lookup_policy,
        })
    }

    /// Load configuration from environment variables.
    ///
    /// Only the lookup policy is read here; see the module docs for the token.
    pub fn load_from_env() -> Self {
        Self {
            access_token: None,
            lookup_policy: std::env::var(LOOKUP_POLICY_ENV)
                .ok()
                .and_then(|s| LookupPolicy::parse(&s)),
        }
    }

    /// Merge this config with another, preferring values from `other` when they are set.
    pub fn merge(self, other: Self) -> Self {
        Self {
            access_token: other.access_token.or(self.access_token),
            lookup_policy: other.lookup_policy.or(self.lookup_policy),
        }
    }

    /// Get the XDG config file path for the reconciler.
    fn get_config_path() -> Result<PathBuf> {
        // Use XDG_CONFIG_HOME if set, otherwise ~/.config
        let config_dir = match std::env::var("XDG_CONFIG_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".config"),
        };

        Ok(config_dir.join("azdo-reconciler").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use tempfile::TempDir;

    /// # Config File Loading
    ///
    /// Tests that a TOML file populates the token and lookup policy.
    ///
    /// ## Test Scenario
    /// - Writes a config file with both keys
    /// - Loads it from the explicit path
    ///
    /// ## Expected Outcome
    /// - Both values are read; the token stays wrapped
    #[test]
    fn test_load_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "access_token = \"file-pat\"\nlookup_policy = \"lenient\"\n",
        )
        .unwrap();

        let config = ProviderConfig::load_from_path(&path).unwrap();
        assert_eq!(
            config.access_token.as_ref().unwrap().expose_secret(),
            "file-pat"
        );
        assert_eq!(config.lookup_policy(), LookupPolicy::Lenient);
    }

    #[test]
    fn test_blank_token_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "access_token = \"  \"\n").unwrap();

        let config = ProviderConfig::load_from_path(&path).unwrap();
        assert!(config.access_token.is_none());
        assert_eq!(config.lookup_policy, None);
        assert_eq!(config.lookup_policy(), LookupPolicy::Strict);
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "lookup_policy = \"sometimes\"\n").unwrap();

        let err = ProviderConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    /// # Missing XDG Config
    ///
    /// Tests that an absent config file yields defaults.
    ///
    /// ## Test Scenario
    /// - Points XDG_CONFIG_HOME at an empty directory
    ///
    /// ## Expected Outcome
    /// - Default configuration is returned without error
    #[test]
    #[serial]
    fn test_load_from_file_missing_returns_default() {
        let dir = TempDir::new().unwrap();
        // SAFETY: serialized test, no concurrent env access
        unsafe { std::env::set_var("XDG_CONFIG_HOME", dir.path()) };

        let config = ProviderConfig::load_from_file().unwrap();

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
        assert!(config.access_token.is_none());
        assert_eq!(config.lookup_policy(), LookupPolicy::Strict);
    }

    #[test]
    #[serial]
    fn test_load_from_env_policy() {
        unsafe { std::env::set_var(LOOKUP_POLICY_ENV, "Lenient") };
        let config = ProviderConfig::load_from_env();
        unsafe { std::env::remove_var(LOOKUP_POLICY_ENV) };

        assert_eq!(config.lookup_policy, Some(LookupPolicy::Lenient));
    }

    #[test]
    fn test_merge_prefers_other() {
        let base = ProviderConfig {
            access_token: Some(SecretString::from("base".to_string())),
            lookup_policy: Some(LookupPolicy::Lenient),
        };
        let merged = base.merge(ProviderConfig::with_access_token("override"));

        assert_eq!(
            merged.access_token.as_ref().unwrap().expose_secret(),
            "override"
        );
        // An unset policy in `other` does not clobber an explicit one.
        assert_eq!(merged.lookup_policy(), LookupPolicy::Lenient);
    }

    /// # Environment Forces Strict Over File
    ///
    /// Tests that an explicit strict policy in the environment beats a lenient file.
    ///
    /// ## Test Scenario
    /// - Config file sets `lookup_policy = "lenient"`
    /// - `AZDO_LOOKUP_POLICY=strict` is set
    ///
    /// ## Expected Outcome
    /// - The merged policy is Strict
    #[test]
    #[serial]
    fn test_env_strict_overrides_file_lenient() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "lookup_policy = \"lenient\"\n").unwrap();
        // SAFETY: serialized test, no concurrent env access
        unsafe { std::env::set_var(LOOKUP_POLICY_ENV, "strict") };

        let merged = ProviderConfig::load_from_path(&path)
            .unwrap()
            .merge(ProviderConfig::load_from_env());

        unsafe { std::env::remove_var(LOOKUP_POLICY_ENV) };
        assert_eq!(merged.lookup_policy, Some(LookupPolicy::Strict));
        assert_eq!(merged.lookup_policy(), LookupPolicy::Strict);
    }

    #[test]
    #[serial]
    fn test_unset_env_keeps_file_policy() {
        // SAFETY: serialized test, no concurrent env access
        unsafe { std::env::remove_var(LOOKUP_POLICY_ENV) };
        let file = ProviderConfig {
            lookup_policy: Some(LookupPolicy::Lenient),
            ..ProviderConfig::default()
        };

        let merged = file.merge(ProviderConfig::load_from_env());

        assert_eq!(merged.lookup_policy(), LookupPolicy::Lenient);
    }

    #[test]
    fn test_lookup_policy_parse() {
        assert_eq!(LookupPolicy::parse("STRICT"), Some(LookupPolicy::Strict));
        assert_eq!(LookupPolicy::parse(" lenient "), Some(LookupPolicy::Lenient));
        assert_eq!(LookupPolicy::parse("other"), None);
    }
}
