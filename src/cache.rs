use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::{CacheEntry, InstallError, ResolvedVersion, Version};

const MARKER_SUFFIX: &str = ".complete";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Manifest {
    name: String,
    version: String,
    digest: String,
}

/// Versioned tool trees under `<root>/<name>/<version>/`.
///
/// An entry only exists once its `<version>.complete` marker is written, which
/// happens after the tree has been renamed into place.
#[derive(Clone, Debug)]
pub struct InstallationCache {
    root: PathBuf,
}

impl InstallationCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tool_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn entry_dir(&self, name: &str, version: &str) -> PathBuf {
        self.tool_dir(name).join(version)
    }

    fn marker_path(&self, name: &str, version: &str) -> PathBuf {
        self.tool_dir(name).join(format!("{version}{MARKER_SUFFIX}"))
    }

    fn staging_dir(&self, name: &str, version: &str) -> PathBuf {
        self.tool_dir(name).join(format!(".{version}.tmp"))
    }

    fn read_manifest(&self, name: &str, version: &str) -> Option<Manifest> {
        let raw = fs::read(self.marker_path(name, version)).ok()?;
        let manifest: Manifest = serde_json::from_slice(&raw).ok()?;
        (manifest.name == name && manifest.version == version).then_some(manifest)
    }

    pub fn find(&self, name: &str, version: &ResolvedVersion) -> Option<PathBuf> {
        if !is_plain_component(name) || !is_plain_component(version.as_str()) {
            return None;
        }
        self.read_manifest(name, version.as_str())?;
        let dir = self.entry_dir(name, version.as_str());
        dir.is_dir().then_some(dir)
    }

    /// Completed entries for `name`, in no particular order.
    pub fn entries(&self, name: &str) -> Result<Vec<CacheEntry>> {
        let tool_dir = self.tool_dir(name);
        if !tool_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let items =
            fs::read_dir(&tool_dir).with_context(|| format!("read {}", tool_dir.display()))?;
        for item in items {
            let file_name = item?.file_name().to_string_lossy().to_string();
            let Some(version) = file_name.strip_suffix(MARKER_SUFFIX) else {
                continue;
            };
            let Some(version) = ResolvedVersion::new(version) else {
                continue;
            };
            if let Some(directory) = self.find(name, &version) {
                entries.push(CacheEntry {
                    name: name.to_string(),
                    version,
                    directory,
                });
            }
        }
        Ok(entries)
    }

    /// Newest completed entry by numeric version; entries without a triple sort first.
    pub fn find_latest(&self, name: &str) -> Option<CacheEntry> {
        self.entries(name).ok()?.into_iter().max_by(|a, b| {
            let va = Version::parse_loose(a.version.as_str());
            let vb = Version::parse_loose(b.version.as_str());
            va.cmp(&vb)
                .then_with(|| a.version.as_str().cmp(b.version.as_str()))
        })
    }

    /// Copies `source` into the cache as `(name, version)` and returns the entry path.
    ///
    /// Inserting identical content again is a no-op. Different content replaces the
    /// old entry; a failure partway leaves no marker behind.
    pub fn insert(&self, name: &str, version: &ResolvedVersion, source: &Path) -> Result<PathBuf> {
        let version = version.as_str();
        if !is_plain_component(name) || !is_plain_component(version) {
            return Err(InstallError::filesystem(
                self.tool_dir(name),
                format!("cannot cache {name} {version}: not a plain path component"),
            )
            .into());
        }
        let entry = self.entry_dir(name, version);
        let digest = tree_digest(source)?;
        if let Some(manifest) = self.read_manifest(name, version) {
            if manifest.digest == digest && entry.is_dir() {
                return Ok(entry);
            }
        }

        let tool_dir = self.tool_dir(name);
        fs::create_dir_all(&tool_dir).map_err(|e| InstallError::filesystem(&tool_dir, e))?;

        let staging = self.staging_dir(name, version);
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| InstallError::filesystem(&staging, e))?;
        }
        copy_tree(source, &staging)?;

        let marker = self.marker_path(name, version);
        if marker.exists() {
            fs::remove_file(&marker).map_err(|e| InstallError::filesystem(&marker, e))?;
        }
        if entry.exists() {
            fs::remove_dir_all(&entry).map_err(|e| InstallError::filesystem(&entry, e))?;
        }
        fs::rename(&staging, &entry).map_err(|e| InstallError::filesystem(&entry, e))?;

        let manifest = Manifest {
            name: name.to_string(),
            version: version.to_string(),
            digest,
        };
        let body = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&marker, body).map_err(|e| InstallError::filesystem(&marker, e))?;
        Ok(entry)
    }
}

fn is_plain_component(s: &str) -> bool {
    !s.is_empty() && !s.starts_with('.') && !s.contains(['/', '\\'])
}

/// SHA-256 over every relative path in `dir` and the bytes of each file.
pub fn tree_digest(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for item in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let item = item.map_err(|e| InstallError::filesystem(dir, e))?;
        let rel = item
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("strip prefix {}", dir.display()))?
            .to_string_lossy()
            .replace('\\', "/");
        let file_type = item.file_type();
        if file_type.is_dir() {
            hasher.update(b"D\0");
            hasher.update(rel.as_bytes());
        } else if file_type.is_symlink() {
            let target = fs::read_link(item.path())
                .map_err(|e| InstallError::filesystem(item.path(), e))?;
            hasher.update(b"L\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.to_string_lossy().as_bytes());
        } else {
            hasher.update(b"F\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            let mut f =
                fs::File::open(item.path()).map_err(|e| InstallError::filesystem(item.path(), e))?;
            let mut buf = [0u8; 1024 * 64];
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recursively copies `src` to `dst`, keeping permissions and symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| InstallError::filesystem(dst, e))?;
    for item in WalkDir::new(src).min_depth(1) {
        let item = item.map_err(|e| InstallError::filesystem(src, e))?;
        let rel = item
            .path()
            .strip_prefix(src)
            .with_context(|| format!("strip prefix {}", src.display()))?;
        let target = dst.join(rel);
        let file_type = item.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| InstallError::filesystem(&target, e))?;
        } else if file_type.is_symlink() {
            copy_symlink(item.path(), &target)?;
        } else {
            // fs::copy carries the permission bits over.
            fs::copy(item.path(), &target).map_err(|e| InstallError::filesystem(&target, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link = fs::read_link(src).map_err(|e| InstallError::filesystem(src, e))?;
    std::os::unix::fs::symlink(&link, dst).map_err(|e| InstallError::filesystem(dst, e))?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).map_err(|e| InstallError::filesystem(dst, e))?;
    Ok(())
}
