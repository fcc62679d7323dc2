//! Source-derived plugin identity
//!
//! Computes a deterministic content hash over a plugin's source tree and
//! derives an identifier from it. The identifier binds a plugin to the exact
//! source it was built from; it is a provenance binding, not proof of
//! authorship (that requires an asymmetric signature by the author).
//!
//! Determinism rules:
//! - files are visited in lexicographic order of their `/`-joined relative path
//! - paths enter the hash as length-prefixed components, so the platform's
//!   separator never does
//! - no filesystem metadata (mtime, permissions, size) is hashed
//! - symlinks are hashed by their target text and never followed
//! - any entry that cannot be read aborts the hash (fail closed)

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::{PluginError, PluginResult};

/// Prefix of every source-derived identity
pub const SOURCE_IDENTITY_PREFIX: &str = "did:trellis:src:";

const SOURCE_DOMAIN: &[u8] = b"trellis/source-hash/v1";
const BUNDLE_DOMAIN: &[u8] = b"trellis/bundle-hash/v1";
const IDENTITY_DOMAIN: &[u8] = b"trellis/source-identity/v1";

const TAG_MANIFEST: u8 = 0x01;
const TAG_NO_MANIFEST: u8 = 0x02;
const TAG_FILE: u8 = 0x03;
const TAG_SYMLINK: u8 = 0x04;
const TAG_REVISION: u8 = 0x05;
const TAG_NO_REVISION: u8 = 0x06;

/// A 32-byte SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHash([u8; 32]);

impl SourceHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> PluginResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| PluginError::Validation(format!("Invalid hash hex: {e}")))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            PluginError::Validation(format!("Hash must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceHash({})", self.to_hex())
    }
}

impl Serialize for SourceHash {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SourceHash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(d)?;
        Self::from_hex(&hex_str).map_err(serde::de::Error::custom)
    }
}

/// Derive the identifier for a source hash.
///
/// One-way and deterministic. The result identifies content, not an author.
pub fn derive_identity(hash: &SourceHash) -> String {
    let mut hasher = Sha256::new();
    hasher.update(IDENTITY_DOMAIN);
    hasher.update(hash.as_bytes());
    let digest = hasher.finalize();
    format!("{}{}", SOURCE_IDENTITY_PREFIX, URL_SAFE_NO_PAD.encode(digest))
}

/// Hashes computed from one build snapshot of a source tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub source_hash: SourceHash,
    pub derived_identity: String,
    /// `None` when the tree has no distributable artifacts
    pub bundle_hash: Option<SourceHash>,
}

#[derive(Debug, Clone)]
struct TreeEntry {
    /// `/`-joined relative path, used for ordering
    rel: String,
    components: Vec<String>,
    path: PathBuf,
    is_symlink: bool,
}

/// Computes source and bundle hashes for plugin trees
#[derive(Debug, Clone)]
pub struct SourceIdentityDeriver {
    excluded: BTreeSet<String>,
    manifest_names: Vec<String>,
    bundle_dir: String,
    bundle_extensions: BTreeSet<String>,
}

impl Default for SourceIdentityDeriver {
    fn default() -> Self {
        Self {
            excluded: [".git", "target", "node_modules", ".cache", "dist", "build"]
                .into_iter()
                .map(String::from)
                .collect(),
            manifest_names: ["plugin.json", "plugin.toml", "Cargo.toml", "package.json"]
                .into_iter()
                .map(String::from)
                .collect(),
            bundle_dir: "dist".to_string(),
            bundle_extensions: ["wasm"].into_iter().map(String::from).collect(),
        }
    }
}

impl SourceIdentityDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip entries with this name anywhere in the tree
    pub fn with_excluded(mut self, name: impl Into<String>) -> Self {
        self.excluded.insert(name.into());
        self
    }

    pub fn with_manifest_names(mut self, names: Vec<String>) -> Self {
        self.manifest_names = names;
        self
    }

    pub fn with_bundle_dir(mut self, dir: impl Into<String>) -> Self {
        self.bundle_dir = dir.into();
        self
    }

    pub fn with_bundle_extension(mut self, ext: impl Into<String>) -> Self {
        self.bundle_extensions.insert(ext.into());
        self
    }

    /// Hash manifest, source files and VCS revision of the tree at `root`
    pub fn compute_source_hash(&self, root: &Path) -> PluginResult<SourceHash> {
        check_root(root)?;

        let manifest = self
            .manifest_names
            .iter()
            .map(|name| (name, root.join(name)))
            .find(|(_, path)| path.is_file());

        let entries = collect_entries(root, &self.excluded)?;

        let mut hasher = Sha256::new();
        hasher.update(SOURCE_DOMAIN);

        match &manifest {
            Some((_, path)) => {
                hasher.update([TAG_MANIFEST]);
                update_framed(&mut hasher, &read_file(path)?);
            }
            None => hasher.update([TAG_NO_MANIFEST]),
        }

        let manifest_rel = manifest.as_ref().map(|(name, _)| name.as_str());
        for entry in entries.iter().filter(|e| Some(e.rel.as_str()) != manifest_rel) {
            hash_entry(&mut hasher, entry)?;
        }

        match vcs_revision(root) {
            Some(revision) => {
                hasher.update([TAG_REVISION]);
                update_framed(&mut hasher, revision.as_bytes());
            }
            None => hasher.update([TAG_NO_REVISION]),
        }

        let hash = SourceHash(hasher.finalize().into());
        tracing::debug!(root = %root.display(), files = entries.len(), source_hash = %hash, "Computed source hash");
        Ok(hash)
    }

    /// Hash only the distributable artifacts (bundle dir and bundle extensions)
    pub fn compute_bundle_hash(&self, root: &Path) -> PluginResult<SourceHash> {
        check_root(root)?;

        let mut excluded = self.excluded.clone();
        excluded.remove(&self.bundle_dir);

        let artifacts: Vec<TreeEntry> = collect_entries(root, &excluded)?
            .into_iter()
            .filter(|e| self.is_artifact(e))
            .collect();

        if artifacts.is_empty() {
            return Err(PluginError::Validation(format!(
                "No distributable artifacts under '{}'",
                root.display()
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(BUNDLE_DOMAIN);
        for entry in &artifacts {
            hash_entry(&mut hasher, entry)?;
        }
        Ok(SourceHash(hasher.finalize().into()))
    }

    /// Derive the identifier for a source hash
    pub fn derive_identity(&self, hash: &SourceHash) -> String {
        derive_identity(hash)
    }

    /// Source hash, identity and (if present) bundle hash in one pass
    pub fn snapshot(&self, root: &Path) -> PluginResult<SourceSnapshot> {
        let source_hash = self.compute_source_hash(root)?;
        let bundle_hash = match self.compute_bundle_hash(root) {
            Ok(hash) => Some(hash),
            Err(PluginError::Validation(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(SourceSnapshot {
            derived_identity: derive_identity(&source_hash),
            source_hash,
            bundle_hash,
        })
    }

    /// [`snapshot`](Self::snapshot) on the blocking pool
    pub async fn snapshot_async(&self, root: impl Into<PathBuf>) -> PluginResult<SourceSnapshot> {
        let root = root.into();
        let deriver = self.clone();
        let task_root = root.clone();
        tokio::task::spawn_blocking(move || deriver.snapshot(&task_root))
            .await
            .map_err(|e| PluginError::PartialHash {
                path: root,
                reason: format!("hashing task failed: {e}"),
            })?
    }

    fn is_artifact(&self, entry: &TreeEntry) -> bool {
        if entry.components.first() == Some(&self.bundle_dir) {
            return true;
        }
        entry
            .components
            .last()
            .and_then(|name| name.rsplit_once('.'))
            .is_some_and(|(_, ext)| self.bundle_extensions.contains(ext))
    }
}

fn check_root(root: &Path) -> PluginResult<()> {
    let metadata = fs::metadata(root).map_err(|source| PluginError::FileSystem {
        path: root.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(PluginError::FileSystem {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
        });
    }
    Ok(())
}

fn collect_entries(root: &Path, excluded: &BTreeSet<String>) -> PluginResult<Vec<TreeEntry>> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || e
                    .file_name()
                    .to_str()
                    .is_none_or(|name| !excluded.contains(name))
        });

    let mut entries = Vec::new();
    for item in walker {
        let entry = item.map_err(|e| PluginError::PartialHash {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            reason: e.to_string(),
        })?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let rel_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| PluginError::PartialHash {
                path: entry.path().to_path_buf(),
                reason: e.to_string(),
            })?;

        let components = rel_path
            .components()
            .map(|c| {
                c.as_os_str().to_str().map(String::from).ok_or_else(|| {
                    PluginError::PartialHash {
                        path: entry.path().to_path_buf(),
                        reason: "path is not valid UTF-8".to_string(),
                    }
                })
            })
            .collect::<PluginResult<Vec<String>>>()?;

        entries.push(TreeEntry {
            rel: components.join("/"),
            components,
            path: entry.path().to_path_buf(),
            is_symlink: file_type.is_symlink(),
        });
    }

    entries.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(entries)
}

fn hash_entry(hasher: &mut Sha256, entry: &TreeEntry) -> PluginResult<()> {
    if entry.is_symlink {
        let target = fs::read_link(&entry.path).map_err(|e| PluginError::PartialHash {
            path: entry.path.clone(),
            reason: e.to_string(),
        })?;
        let target = target.to_str().ok_or_else(|| PluginError::PartialHash {
            path: entry.path.clone(),
            reason: "symlink target is not valid UTF-8".to_string(),
        })?;
        hasher.update([TAG_SYMLINK]);
        update_components(hasher, &entry.components);
        update_framed(hasher, target.replace('\\', "/").as_bytes());
    } else {
        hasher.update([TAG_FILE]);
        update_components(hasher, &entry.components);
        update_framed(hasher, &read_file(&entry.path)?);
    }
    Ok(())
}

fn read_file(path: &Path) -> PluginResult<Vec<u8>> {
    fs::read(path).map_err(|e| PluginError::PartialHash {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn update_components(hasher: &mut Sha256, components: &[String]) {
    hasher.update((components.len() as u64).to_be_bytes());
    for component in components {
        update_framed(hasher, component.as_bytes());
    }
}

/// HEAD commit of a git repository rooted exactly at `root`
fn vcs_revision(root: &Path) -> Option<String> {
    let repo = git2::Repository::open(root).ok()?;
    let head = repo.head().ok()?;
    let commit = head.peel_to_commit().ok()?;
    Some(commit.id().to_string())
}
