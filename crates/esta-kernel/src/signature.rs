//! Module signatures.
//!
//! A module is signed over `hex(SHA-256(bytes)) ‖ bytes` with Ed25519.  The
//! loader holds one trusted [`SignatureVerifier`]; [`ModuleSigner`] exists
//! for packaging tools and tests.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use esta_types::EstaError;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the module bytes.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The exact byte string covered by a module signature.
pub fn signed_message(bytes: &[u8]) -> Vec<u8> {
    let digest = checksum(bytes);
    let mut message = Vec::with_capacity(digest.len() + bytes.len());
    message.extend_from_slice(digest.as_bytes());
    message.extend_from_slice(bytes);
    message
}

/// Verifies module signatures against the one trusted public key.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: VerifyingKey,
}

impl SignatureVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, EstaError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self::new)
            .map_err(|e| EstaError::Config(format!("invalid trusted public key: {e}")))
    }

    /// Parse a 64-character hex public key, as stored in the config file.
    pub fn from_hex(hex_key: &str) -> Result<Self, EstaError> {
        let raw = hex::decode(hex_key.trim())
            .map_err(|e| EstaError::Config(format!("trusted public key is not hex: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| EstaError::Config("trusted public key must be 32 bytes".into()))?;
        Self::from_bytes(&bytes)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.as_bytes())
    }

    /// First eight hex characters of the key, safe to log.
    pub fn fingerprint(&self) -> String {
        self.public_key_hex()[..8].to_string()
    }

    /// Check `signature` over `module_bytes`.
    pub fn verify_module(
        &self,
        module: &str,
        module_bytes: &[u8],
        signature: &[u8],
    ) -> Result<(), EstaError> {
        let invalid = || EstaError::InvalidSignature {
            module: module.to_string(),
        };
        let signature = Signature::from_slice(signature).map_err(|_| invalid())?;
        self.key
            .verify(&signed_message(module_bytes), &signature)
            .map_err(|_| invalid())
    }
}

/// Signs module bytes.  Never loaded by the kernel itself.
pub struct ModuleSigner {
    key: SigningKey,
}

impl ModuleSigner {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn sign_module(&self, module_bytes: &[u8]) -> Vec<u8> {
        self.key
            .sign(&signed_message(module_bytes))
            .to_bytes()
            .to_vec()
    }

    pub fn verifier(&self) -> SignatureVerifier {
        SignatureVerifier::new(self.key.verifying_key())
    }
}

impl std::fmt::Debug for ModuleSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSigner")
            .field("public_key", &self.verifier().fingerprint())
            .finish_non_exhaustive()
    }
}
