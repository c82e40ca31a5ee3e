//! SHA256 digests for cache keys and copied content.

use std::path::Path;

use box_core::error::{BoxError, Result};
use sha2::{Digest, Sha256};

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest a file's content, or a directory tree (relative paths, file
/// contents and symlink targets, walked in sorted order).
pub fn sha256_path(path: &Path) -> Result<String> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| {
        BoxError::CacheError(format!("Failed to stat {}: {}", path.display(), e))
    })?;

    if meta.is_file() {
        let data = std::fs::read(path).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to read file for hashing {}: {}",
                path.display(),
                e
            ))
        })?;
        return Ok(sha256_bytes(&data));
    }

    let mut hasher = Sha256::new();
    hash_tree(path, path, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn hash_tree(root: &Path, dir: &Path, hasher: &mut Sha256) -> Result<()> {
    let read_err = |e: std::io::Error| {
        BoxError::CacheError(format!("Failed to read directory {}: {}", dir.display(), e))
    };

    let mut entries = std::fs::read_dir(dir)
        .map_err(read_err)?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(read_err)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path);
        let file_type = entry.file_type().map_err(read_err)?;

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(b"\0");

        if file_type.is_symlink() {
            let target = std::fs::read_link(&path).map_err(read_err)?;
            hasher.update(b"link:");
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"dir");
            hash_tree(root, &path, hasher)?;
        } else {
            hasher.update(b"file:");
            hasher.update(sha256_path(&path)?.as_bytes());
        }
        hasher.update(b"\n");
    }
    Ok(())
}
