//! On-disk module bundles.
//!
//! ```text
//! <bundle_dir>/<name>/
//!     manifest.toml | manifest.json
//!     module.bin        raw module bytes
//!     module.sig        hex Ed25519 signature
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use esta_kernel::{AdmissionRequest, ModuleSigner};
use esta_types::{EstaError, ModuleManifest};
use tracing::debug;

pub const MODULE_FILE: &str = "module.bin";
pub const SIGNATURE_FILE: &str = "module.sig";

fn io_error(path: &Path, err: std::io::Error) -> EstaError {
    EstaError::Config(format!("{}: {err}", path.display()))
}

/// Parse a manifest from TOML or JSON text, picked by file extension.
pub fn parse_manifest(path: &Path, text: &str) -> Result<ModuleManifest, EstaError> {
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(text).map_err(|e| e.to_string()),
        _ => toml::from_str(text).map_err(|e| e.to_string()),
    };
    parsed.map_err(|reason| EstaError::InvalidManifest {
        module: path.display().to_string(),
        reason,
    })
}

fn manifest_path(dir: &Path) -> Option<PathBuf> {
    ["manifest.toml", "manifest.json"]
        .iter()
        .map(|f| dir.join(f))
        .find(|p| p.is_file())
}

/// Load the bundle in `dir` as an admission request.
pub fn load_bundle(dir: &Path) -> Result<AdmissionRequest, EstaError> {
    let path = manifest_path(dir)
        .ok_or_else(|| EstaError::Config(format!("{}: no manifest", dir.display())))?;
    let text = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
    let manifest = parse_manifest(&path, &text)?;

    let module_path = dir.join(MODULE_FILE);
    let module_bytes = fs::read(&module_path).map_err(|e| io_error(&module_path, e))?;

    let sig_path = dir.join(SIGNATURE_FILE);
    let sig_hex = fs::read_to_string(&sig_path).map_err(|e| io_error(&sig_path, e))?;
    let signature = hex::decode(sig_hex.trim()).map_err(|_| EstaError::InvalidSignature {
        module: manifest.name.clone(),
    })?;

    debug!(module = %manifest.name, dir = %dir.display(), "bundle loaded");
    Ok(AdmissionRequest {
        manifest,
        module_bytes,
        signature,
    })
}

/// Every bundle directory under `root`, sorted by name.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>, EstaError> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .map_err(|e| io_error(root, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && manifest_path(p).is_some())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Write a signed bundle for `manifest` under `root/<name>`.
pub fn write_bundle(
    root: &Path,
    manifest: &ModuleManifest,
    module_bytes: &[u8],
    signer: &ModuleSigner,
) -> Result<PathBuf, EstaError> {
    let dir = root.join(&manifest.name);
    fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

    let text = toml::to_string_pretty(manifest).map_err(|e| EstaError::InvalidManifest {
        module: manifest.name.clone(),
        reason: e.to_string(),
    })?;
    let path = dir.join("manifest.toml");
    fs::write(&path, text).map_err(|e| io_error(&path, e))?;

    let path = dir.join(MODULE_FILE);
    fs::write(&path, module_bytes).map_err(|e| io_error(&path, e))?;

    let path = dir.join(SIGNATURE_FILE);
    fs::write(&path, hex::encode(signer.sign_module(module_bytes))).map_err(|e| io_error(&path, e))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn signer() -> ModuleSigner {
        ModuleSigner::from_seed([7; 32])
    }

    #[test]
    fn written_bundle_loads_and_verifies() {
        let root = TempDir::new().expect("tempdir");
        let mut manifest = ModuleManifest::new("echo", "1.0.0", "builtin:echo");
        manifest.capabilities_required = vec!["messaging:send:*".into()];
        write_bundle(root.path(), &manifest, b"echo-bytes", &signer()).expect("write");

        let found = discover(root.path()).expect("discover");
        assert_eq!(found.len(), 1);
        let req = load_bundle(&found[0]).expect("load");
        assert_eq!(req.manifest, manifest);
        assert_eq!(req.module_bytes, b"echo-bytes");
        signer()
            .verifier()
            .verify_module("echo", &req.module_bytes, &req.signature)
            .expect("signature");
    }

    #[test]
    fn json_manifest_uses_external_field_names() {
        let root = TempDir::new().expect("tempdir");
        let dir = root.path().join("accrual");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.json"),
            r#"{"name":"accrual","version":"0.2.0","entry_point":"run","runtime":"builtin:echo",
                "dependencies":[],"capabilities_required":["db:read"],"priority":"high","preload":true}"#,
        )
        .unwrap();
        fs::write(dir.join(MODULE_FILE), b"x").unwrap();
        fs::write(dir.join(SIGNATURE_FILE), "zz").unwrap();

        let err = load_bundle(&dir).unwrap_err();
        assert_eq!(err, EstaError::InvalidSignature { module: "accrual".into() });

        fs::write(dir.join(SIGNATURE_FILE), hex::encode(signer().sign_module(b"x"))).unwrap();
        let req = load_bundle(&dir).expect("load");
        assert_eq!(req.manifest.entry_point, "run");
        assert!(req.manifest.preload);
    }

    #[test]
    fn missing_manifest_is_a_config_error() {
        let root = TempDir::new().expect("tempdir");
        assert!(matches!(load_bundle(root.path()), Err(EstaError::Config(_))));
        assert!(discover(root.path()).unwrap().is_empty());
    }
}
