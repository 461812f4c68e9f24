//! PlugDock plugin package format.
//!
//! A package is a zip archive containing:
//! - `plugin.toml`: manifest: identity, entry point, dependencies,
//!   requested permissions, hooks, configuration schema
//! - the entry point file named by the manifest
//! - optional directories such as `assets/` and `locales/`
//! - `signature.bin`: optional Ed25519 detached signature over the content hash
//!
//! Two digests exist and must not be confused: the *blob checksum*
//! ([`sha256_hex`] of the raw archive bytes) is what registries publish and
//! what the fetcher verifies; the *content hash*
//! ([`PluginPackage::content_hash`]) covers the entries and is what publishers sign.

mod checksum;
mod error;
mod manifest;
mod package;
mod schema;
mod signing;

pub use checksum::{checksum_matches, sha256_hex};
pub use error::{PkgError, PkgResult};
pub use manifest::{Hook, PkgPermission, PluginManifest};
pub use package::{MANIFEST_ENTRY, PackageBuilder, PackageEntry, PluginPackage, SIGNATURE_ENTRY};
pub use schema::{ConfigField, ConfigIssue, ConfigMap, ConfigSchema, ConfigType};
pub use signing::{KeyPair, Signature, SigningKey, VerifyingKey};
