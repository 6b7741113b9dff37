//! Build context assembly.
//!
//! Turns a local application directory into a deterministic gzip-compressed
//! tar archive honoring `.dockerignore`, with the chart directory always left
//! out (it travels as a separate artifact). Identical directory contents
//! always produce byte-identical archives, so the archive's content hash is
//! stable enough to serve as the image tag.

use flate2::write::GzEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SkiffError};

pub mod ignore;

use ignore::IgnorePatterns;

/// Name of the ignore file honored during context assembly.
pub const IGNORE_FILE: &str = ".dockerignore";

/// Name of the build descriptor the container builder needs.
pub const DESCRIPTOR_FILE: &str = "Dockerfile";

/// Chart subdirectory, always excluded from the context.
pub const CHART_DIR: &str = "chart";

/// Assemble the build context for the application rooted at `dir`.
///
/// Honors `.dockerignore` in the root. The ignore file and the Dockerfile are
/// force-included even when excluded by their own patterns, because the
/// container builder needs both to decide what to drop on its side.
pub fn assemble_context(dir: &Path) -> Result<Vec<u8>> {
    let root = dir.canonicalize().map_err(|e| SkiffError::Context {
        path: dir.to_path_buf(),
        reason: format!("cannot read context root: {}", e),
    })?;

    let patterns = match fs::read_to_string(root.join(IGNORE_FILE)) {
        Ok(content) => IgnorePatterns::parse(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => IgnorePatterns::empty(),
        Err(e) => {
            return Err(SkiffError::Context {
                path: root.join(IGNORE_FILE),
                reason: format!("cannot read ignore file: {}", e),
            })
        }
    };

    let mut files = Vec::new();
    collect_files(&root, &root, &mut files)?;
    files.sort();

    let mut included: Vec<PathBuf> = files
        .into_iter()
        .filter(|rel| {
            if rel.starts_with(CHART_DIR) {
                return false;
            }
            !patterns.is_excluded(rel)
        })
        .collect();

    // Force-include the ignore file and the build descriptor when their own
    // patterns would drop them.
    for keep in [IGNORE_FILE, DESCRIPTOR_FILE] {
        let rel = PathBuf::from(keep);
        if root.join(keep).is_file() && !included.contains(&rel) {
            included.push(rel);
        }
    }
    included.sort();

    debug!(root = %root.display(), files = included.len(), "assembling build context");
    write_archive(&root, &included)
}

/// Archive the contents of `dir` with entry names prefixed by the directory's
/// own name. Used to package the chart directory; no ignore handling.
pub fn archive_dir(dir: &Path) -> Result<Vec<u8>> {
    let root = dir.canonicalize().map_err(|e| SkiffError::Context {
        path: dir.to_path_buf(),
        reason: format!("cannot read directory: {}", e),
    })?;
    let prefix = root
        .file_name()
        .map(|n| PathBuf::from(n))
        .ok_or_else(|| SkiffError::Context {
            path: root.clone(),
            reason: "directory has no name".to_string(),
        })?;

    let mut files = Vec::new();
    collect_files(&root, &root, &mut files)?;
    files.sort();

    let named: Vec<PathBuf> = files.iter().map(|rel| prefix.join(rel)).collect();
    write_archive_with_names(&root, &files, &named)
}

/// The content-hash image tag for a build archive: the SHA-1 digest rendered
/// as its first 20 bytes of hex (40 characters).
pub fn image_tag(archive: &[u8]) -> String {
    let digest = Sha1::digest(archive);
    hex::encode(&digest[..20])
}

/// Recursively collect regular-file paths relative to `root`, verifying that
/// symlinks resolve inside the context.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| SkiffError::Context {
        path: dir.to_path_buf(),
        reason: format!("cannot read directory: {}", e),
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| SkiffError::Context {
            path: dir.to_path_buf(),
            reason: format!("cannot read directory entry: {}", e),
        })?;
        let path = entry.path();

        // Resolve symlinks and refuse anything pointing outside the root.
        let resolved = path
            .canonicalize()
            .map_err(|_| SkiffError::ContextEscape { path: path.clone() })?;
        if !resolved.starts_with(root) {
            return Err(SkiffError::ContextEscape { path });
        }

        if resolved.is_dir() {
            collect_files(root, &path, out)?;
        } else if resolved.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| SkiffError::ContextEscape { path: path.clone() })?
                .to_path_buf();
            out.push(rel);
        }
    }
    Ok(())
}

fn write_archive(root: &Path, files: &[PathBuf]) -> Result<Vec<u8>> {
    write_archive_with_names(root, files, files)
}

/// Write `files` (paths relative to `root`) into a gzip'd tar using `names`
/// as the entry names. Headers carry zeroed timestamps and ownership so the
/// output depends only on file contents and names.
fn write_archive_with_names(root: &Path, files: &[PathBuf], names: &[PathBuf]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::new(6));
    let mut builder = tar::Builder::new(encoder);

    for (rel, name) in files.iter().zip(names.iter()) {
        let full = root.join(rel);
        let data = fs::read(&full)
            .map_err(|e| SkiffError::IoError { path: full.clone(), source: e })?;

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder
            .append_data(&mut header, name, data.as_slice())
            .map_err(|e| SkiffError::IoError { path: full.clone(), source: e })?;
    }

    let encoder = builder.into_inner().map_err(|e| SkiffError::Context {
        path: root.to_path_buf(),
        reason: format!("failed to finalize archive: {}", e),
    })?;
    encoder.finish().map_err(|e| SkiffError::Context {
        path: root.to_path_buf(),
        reason: format!("failed to compress archive: {}", e),
    })
}
