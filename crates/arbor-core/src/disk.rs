//! Moving trees between the local filesystem and memory.
//!
//! `load_tree` builds the exported tree from a path; `save_tree` writes a
//! fully downloaded tree back out. Directory entries are loaded in byte
//! order of their names so that the same directory always hashes the same.

use std::ffi::OsString;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use memmap2::Mmap;

use crate::chunker::chunk_bytes;
use crate::tree::{File, Name, TreeError};

// ── Loading ───────────────────────────────────────────────────────────────────

/// Build a tree from `path`, which may be a regular file or a directory.
///
/// The root is named after the last path component. Entries that are
/// neither files nor directories are skipped.
pub fn load_tree(path: &Path) -> Result<File> {
    let name = path
        .file_name()
        .map(|n| Name::new(n.as_encoded_bytes()))
        .unwrap_or_default();
    load_node(path, name)
}

fn load_node(path: &Path, name: Name) -> Result<File> {
    let meta = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;

    if meta.is_dir() {
        let mut entries = fs::read_dir(path)
            .with_context(|| format!("failed to list {}", path.display()))?
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("failed to list {}", path.display()))?;
        entries.sort_by_key(|e| e.file_name());

        let mut children = Vec::with_capacity(entries.len());
        for entry in entries {
            let child_path = entry.path();
            let file_name = entry.file_name();
            let raw = file_name.as_encoded_bytes();
            if raw.len() > crate::wire::NAME_LEN {
                tracing::warn!(path = %child_path.display(), "name longer than 32 bytes, truncating");
            }
            let child_meta = match fs::metadata(&child_path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %child_path.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !child_meta.is_dir() && !child_meta.is_file() {
                tracing::debug!(path = %child_path.display(), "skipping special file");
                continue;
            }
            children.push(load_node(&child_path, Name::new(raw))?);
        }
        return Ok(File::directory(name, children));
    }

    if !meta.is_file() {
        bail!("{} is neither a file nor a directory", path.display());
    }

    let data = read_contents(path, meta.len())?;
    tracing::trace!(path = %path.display(), bytes = data.len(), "file chunked");
    Ok(chunk_bytes(name, data))
}

fn read_contents(path: &Path, len: u64) -> Result<Bytes> {
    if len == 0 {
        return Ok(Bytes::new());
    }
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    // Safety: the file is opened read-only and the map is never mutated.
    // Exported files must not be truncated while they are being served.
    let mmap = unsafe {
        Mmap::map(&file).with_context(|| format!("failed to mmap {}", path.display()))?
    };
    // Chunks are slices of the mapping itself.
    Ok(Bytes::from_owner(mmap))
}

// ── Saving ────────────────────────────────────────────────────────────────────

/// Write a fully materialized tree to `path`.
///
/// Directories become directories, bigfiles become one file holding the
/// concatenation of their chunks. Child names must be usable as a single
/// path component.
pub fn save_tree(path: &Path, node: &File) -> Result<()> {
    match node {
        File::Directory { children, .. } => {
            fs::create_dir_all(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            for child in children {
                let component = safe_component(child.name())?;
                save_tree(&path.join(component), child)?;
            }
            Ok(())
        }
        File::Chunk { .. } | File::Bigfile { .. } => {
            let file = fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut out = BufWriter::new(file);
            write_contents(&mut out, node)?;
            out.flush()
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(())
        }
        File::Placeholder { hash, .. } => Err(TreeError::Unmaterialized(*hash).into()),
    }
}

fn write_contents(out: &mut impl Write, node: &File) -> Result<()> {
    match node {
        File::Chunk { data, .. } => out.write_all(data).context("failed to write chunk"),
        File::Bigfile { children, .. } => {
            children.iter().try_for_each(|c| write_contents(out, c))
        }
        File::Directory { .. } => bail!("directory nested inside a bigfile"),
        File::Placeholder { hash, .. } => Err(TreeError::Unmaterialized(*hash).into()),
    }
}

/// Turn a tree name into a path component, refusing anything that could
/// escape the target directory. The name's bytes are kept as they are.
pub fn safe_component(name: &Name) -> Result<OsString, TreeError> {
    let raw = name.as_bytes();
    if raw.is_empty() || raw == b"." || raw == b".." || raw.contains(&b'/') || raw.contains(&0) {
        return Err(TreeError::UnsafeName(name.to_string_lossy().into_owned()));
    }
    Ok(component_from_bytes(raw))
}

#[cfg(unix)]
fn component_from_bytes(raw: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::OsStr::from_bytes(raw).to_os_string()
}

#[cfg(not(unix))]
fn component_from_bytes(raw: &[u8]) -> OsString {
    OsString::from(String::from_utf8_lossy(raw).into_owned())
}
