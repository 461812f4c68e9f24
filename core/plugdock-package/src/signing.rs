//! Publisher signatures for packages.
//!
//! Registries may publish a package together with the hex-encoded Ed25519
//! public key of its publisher. Hosts that require signatures verify the
//! detached `signature.bin` against the package content hash.

use ed25519_dalek::{
    Signature as DalekSignature, Signer as _, SigningKey as DalekSigningKey, Verifier as _,
    VerifyingKey as DalekVerifyingKey,
};
use rand::rngs::OsRng;

use crate::{PkgError, PkgResult};

/// Ed25519 signing key held by a publisher.
pub struct SigningKey(DalekSigningKey);

/// Ed25519 public key used to check a publisher's packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyingKey(DalekVerifyingKey);

/// Detached Ed25519 signature.
pub struct Signature(DalekSignature);

/// A publisher keypair.
pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generates a new random keypair.
    pub fn generate() -> Self {
        let signing = DalekSigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        Self {
            signing_key: SigningKey(signing),
            verifying_key: VerifyingKey(verifying),
        }
    }
}

impl SigningKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(DalekSigningKey::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }
}

impl VerifyingKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> PkgResult<Self> {
        DalekVerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| PkgError::InvalidPublicKey)
    }

    /// Parses the hex form registries and policy files use.
    pub fn from_hex(text: &str) -> PkgResult<Self> {
        let raw = hex::decode(text.trim()).map_err(|_| PkgError::InvalidPublicKey)?;
        let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| PkgError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> PkgResult<()> {
        self.0
            .verify(message, &signature.0)
            .map_err(|_| PkgError::SignatureInvalid)
    }
}

impl Signature {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self(DalekSignature::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}
