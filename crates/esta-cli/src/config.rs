//! Configuration Vault – reads/writes `~/.esta/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use esta_kernel::fairness::DEFAULT_EPOCH_LENGTH;
use esta_kernel::{AuthorityTable, FairnessFloors, SignatureVerifier};
use esta_runtime::KernelConfig;

/// Persisted operator configuration stored in `~/.esta/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hex Ed25519 public key every module bundle must be signed against.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trusted_public_key: String,

    /// Directory holding one sub-directory per signed bundle.
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: String,

    /// Scheduling and delivery attempts per fairness epoch.
    #[serde(default = "default_epoch_length")]
    pub epoch_length: u32,

    /// Depth of the kernel and driver mailboxes.
    #[serde(default = "default_mailbox_depth")]
    pub default_mailbox_depth: usize,

    #[serde(default)]
    pub fairness_floors: FairnessFloors,

    /// Module name → capability classes it may request, e.g. `"db:read"`.
    #[serde(default)]
    pub authority: HashMap<String, Vec<String>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("trusted_public_key", &self.key_fingerprint())
            .field("bundle_dir", &self.bundle_dir)
            .field("epoch_length", &self.epoch_length)
            .field("default_mailbox_depth", &self.default_mailbox_depth)
            .field("fairness_floors", &self.fairness_floors)
            .field("authority", &self.authority)
            .finish()
    }
}

fn default_bundle_dir() -> String {
    home_dir().join(".esta").join("bundles").display().to_string()
}
fn default_epoch_length() -> u32 {
    DEFAULT_EPOCH_LENGTH
}
fn default_mailbox_depth() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trusted_public_key: String::new(),
            bundle_dir: default_bundle_dir(),
            epoch_length: default_epoch_length(),
            default_mailbox_depth: default_mailbox_depth(),
            fairness_floors: FairnessFloors::default(),
            authority: HashMap::new(),
        }
    }
}

impl Config {
    /// Short form of the trusted key, safe to print.
    pub fn key_fingerprint(&self) -> String {
        if self.trusted_public_key.is_empty() {
            return "<not set>".to_string();
        }
        match SignatureVerifier::from_hex(&self.trusted_public_key) {
            Ok(v) => format!("{}…", v.fingerprint()),
            Err(_) => "<invalid>".to_string(),
        }
    }

    /// Build the kernel's boot configuration.
    pub fn to_kernel_config(&self) -> Result<KernelConfig, String> {
        if self.trusted_public_key.is_empty() {
            return Err("no trusted_public_key configured".to_string());
        }
        let verifier = SignatureVerifier::from_hex(&self.trusted_public_key).map_err(|e| e.to_string())?;
        let authority = AuthorityTable::from_map(&self.authority).map_err(|e| e.to_string())?;

        let mut kernel = KernelConfig::new(verifier);
        kernel.authority = authority;
        kernel.epoch_length = self.epoch_length.max(1);
        kernel.floors = self.fairness_floors;
        kernel.default_mailbox_depth = self.default_mailbox_depth.max(1);
        Ok(kernel)
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Return the path to `~/.esta/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir().to_string_lossy())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".esta").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    let mut cfg = read_from(path)?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Parse the file only; no environment overrides.
pub(crate) fn read_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `ESTA_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ESTA_TRUSTED_KEY` | `trusted_public_key` |
/// | `ESTA_BUNDLE_DIR` | `bundle_dir` |
/// | `ESTA_EPOCH_LENGTH` | `epoch_length` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ESTA_TRUSTED_KEY") {
        cfg.trusted_public_key = v;
    }
    if let Ok(v) = std::env::var("ESTA_BUNDLE_DIR") {
        cfg.bundle_dir = v;
    }
    if let Ok(v) = std::env::var("ESTA_EPOCH_LENGTH")
        && let Ok(n) = v.parse::<u32>()
        && n > 0
    {
        cfg.epoch_length = n;
    }
}

/// Save the config to disk, creating `~/.esta/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use esta_kernel::ModuleSigner;

    fn key_hex() -> String {
        ModuleSigner::from_seed([9; 32]).verifier().public_key_hex()
    }

    #[test]
    fn debug_shows_fingerprint_not_key() {
        let cfg = Config {
            trusted_public_key: key_hex(),
            ..Config::default()
        };
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains(&key_hex()), "raw key must not appear in debug output");
        assert!(debug_str.contains(&key_hex()[..8]));
    }

    #[test]
    fn debug_shows_not_set_for_empty_key() {
        let debug_str = format!("{:?}", Config::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let parent = path.parent().expect("parent");
        let dir_mode = std::fs::metadata(parent).expect("dir metadata").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_keeps_floors_and_authority() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.fairness_floors.low = 2;
        cfg.authority.insert("ledger".into(), vec!["db:read".into(), "messaging:send:*".into()]);
        save_to(&cfg, &path).expect("save");

        let loaded = read_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.fairness_floors.low, 2);
        assert_eq!(loaded.fairness_floors.normal, 8);
        assert_eq!(loaded.authority["ledger"].len(), 2);
    }

    #[test]
    fn sparse_file_gets_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "bundle_dir = \"/srv/bundles\"\n").expect("write");

        let loaded = read_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.bundle_dir, "/srv/bundles");
        assert_eq!(loaded.epoch_length, 64);
        assert_eq!(loaded.default_mailbox_depth, 256);
        assert_eq!(loaded.fairness_floors, FairnessFloors::default());
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
        assert!(read_from(&path).expect("no error").is_none());
    }

    #[test]
    fn kernel_config_requires_a_valid_key() {
        let mut cfg = Config::default();
        assert!(cfg.to_kernel_config().is_err());

        cfg.trusted_public_key = "not-hex".into();
        assert!(cfg.to_kernel_config().is_err());

        cfg.trusted_public_key = key_hex();
        cfg.epoch_length = 16;
        cfg.authority.insert("echo".into(), vec!["messaging:send:*".into()]);
        let kernel = cfg.to_kernel_config().expect("valid");
        assert_eq!(kernel.epoch_length, 16);
        assert_eq!(kernel.verifier.public_key_hex(), key_hex());
        assert_eq!(kernel.authority.entries_for("echo").len(), 1);
    }

    #[test]
    fn apply_env_overrides_changes_bundle_dir() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("ESTA_BUNDLE_DIR", "/opt/esta/bundles") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bundle_dir, "/opt/esta/bundles");
        unsafe { std::env::remove_var("ESTA_BUNDLE_DIR") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_epoch_length() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("ESTA_EPOCH_LENGTH", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.epoch_length, 64);

        unsafe { std::env::set_var("ESTA_EPOCH_LENGTH", "32") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.epoch_length, 32);
        unsafe { std::env::remove_var("ESTA_EPOCH_LENGTH") };
    }
}
