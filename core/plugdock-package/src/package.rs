//! Package packing, unpacking, extraction, and content hashing.

use std::fs;
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::manifest::PluginManifest;
use crate::signing::{Signature, SigningKey, VerifyingKey};
use crate::{PkgError, PkgResult};

pub const MANIFEST_ENTRY: &str = "plugin.toml";
pub const SIGNATURE_ENTRY: &str = "signature.bin";

/// A single file entry inside a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// An opened package with parsed manifest and every file held in memory.
#[derive(Debug, Clone)]
pub struct PluginPackage {
    pub manifest: PluginManifest,
    pub signature: Option<Vec<u8>>,
    entries: Vec<PackageEntry>,
}

impl PluginPackage {
    /// Opens and parses a package from a reader.
    pub fn open<R: Read + Seek>(reader: R) -> PkgResult<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let mut manifest_bytes = None;
        let mut signature = None;
        let mut entries = Vec::new();

        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            if safe_relative_path(&name).is_none() {
                return Err(PkgError::UnsafePath(name));
            }
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;

            match name.as_str() {
                MANIFEST_ENTRY => manifest_bytes = Some(data.clone()),
                SIGNATURE_ENTRY => {
                    signature = Some(data);
                    continue;
                }
                _ => {}
            }
            entries.push(PackageEntry { name, data });
        }

        let manifest_bytes =
            manifest_bytes.ok_or_else(|| PkgError::MissingEntry(MANIFEST_ENTRY.into()))?;
        let manifest = PluginManifest::from_toml(
            std::str::from_utf8(&manifest_bytes)
                .map_err(|e| PkgError::ManifestInvalid(e.to_string()))?,
        )?;

        Ok(Self {
            manifest,
            signature,
            entries,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> PkgResult<Self> {
        Self::open(Cursor::new(bytes))
    }

    /// All file entries except the signature.
    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.data.as_slice())
    }

    /// True if any file lives under `dir/`.
    pub fn has_dir(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.entries.iter().any(|e| e.name.starts_with(&prefix))
    }

    /// Computes a deterministic SHA-256 content hash over all entries except signature.bin.
    pub fn content_hash(&self) -> String {
        hash_entries(&self.entries)
    }

    /// Verifies the package signature against the content hash.
    pub fn verify(&self, key: &VerifyingKey) -> PkgResult<()> {
        let sig_bytes = self.signature.as_ref().ok_or(PkgError::NotSigned)?;
        let sig_array: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| PkgError::SignatureInvalid)?;
        let signature = Signature::from_bytes(&sig_array);
        key.verify(self.content_hash().as_bytes(), &signature)
    }

    /// Writes every entry beneath `dir`, creating it if needed.
    ///
    /// Entry names were checked on open, but are re-checked here so that
    /// hand-built packages get the same guarantee.
    pub fn extract_to(&self, dir: &Path) -> PkgResult<()> {
        fs::create_dir_all(dir)?;
        for entry in &self.entries {
            let relative =
                safe_relative_path(&entry.name).ok_or_else(|| PkgError::UnsafePath(entry.name.clone()))?;
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &entry.data)?;
        }
        Ok(())
    }
}

fn hash_entries(entries: &[PackageEntry]) -> String {
    let mut hasher = Sha256::new();
    let mut sorted: Vec<_> = entries.iter().filter(|e| e.name != SIGNATURE_ENTRY).collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    for entry in sorted {
        hasher.update(entry.name.as_bytes());
        hasher.update((entry.data.len() as u64).to_le_bytes());
        hasher.update(&entry.data);
    }

    hex::encode(hasher.finalize())
}

/// Returns the entry name as a relative path, or `None` if it could escape
/// the extraction root.
fn safe_relative_path(name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.contains('\\') {
        return None;
    }
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() { None } else { Some(out) }
}

/// Fluent builder for creating packages.
pub struct PackageBuilder {
    manifest: PluginManifest,
    files: Vec<PackageEntry>,
    signing_key: Option<SigningKey>,
}

impl PackageBuilder {
    pub fn new(manifest: PluginManifest) -> Self {
        Self {
            manifest,
            files: Vec::new(),
            signing_key: None,
        }
    }

    /// Adds the file named by the manifest's `entry_point`.
    pub fn entry_point(self, data: impl Into<Vec<u8>>) -> Self {
        let name = self.manifest.entry_point.clone();
        self.file(&name, data)
    }

    pub fn file(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.retain(|e| e.name != name);
        self.files.push(PackageEntry {
            name: name.to_string(),
            data: data.into(),
        });
        self
    }

    pub fn sign(mut self, key: &SigningKey) -> Self {
        self.signing_key = Some(SigningKey::from_bytes(&key.to_bytes()));
        self
    }

    /// Builds the zip archive and returns the raw bytes.
    pub fn build(self) -> PkgResult<Vec<u8>> {
        let mut entries = vec![PackageEntry {
            name: MANIFEST_ENTRY.to_string(),
            data: self.manifest.to_toml()?.into_bytes(),
        }];
        entries.extend(self.files.into_iter().filter(|f| f.name != MANIFEST_ENTRY));

        let signature = self
            .signing_key
            .as_ref()
            .map(|key| key.sign(hash_entries(&entries).as_bytes()));

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for entry in &entries {
            zip.start_file(entry.name.as_str(), options)?;
            zip.write_all(&entry.data)?;
        }
        if let Some(sig) = signature {
            zip.start_file(SIGNATURE_ENTRY, options)?;
            zip.write_all(&sig.to_bytes())?;
        }

        Ok(zip.finish()?.into_inner())
    }
}
