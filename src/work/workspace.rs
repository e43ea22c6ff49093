use crate::shared::fs_atomic::atomic_write_file;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const BASE_MANIFEST_NAME: &str = ".base-manifest.json";

/// `(shared, attempts)` directories for a scope. The shared workspace is the
/// reconciliation target; each attempt gets an isolated fork under
/// `attempts`.
pub fn scope_workspace_dirs(state_root: &Path, scope_id: &str) -> (PathBuf, PathBuf) {
    let base = state_root.join("workspaces").join(scope_id);
    (base.join("shared"), base.join("attempts"))
}

/// Content hashes of the shared workspace at fork time. Written into the
/// attempt workspace so reconciliation can tell "changed by this attempt"
/// from "changed by a sibling since the fork".
#[derive(Debug, Default, Serialize, Deserialize)]
struct BaseManifest {
    hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { files_written: u32 },
    /// A file was changed both by this attempt and in the shared workspace
    /// since the fork. The caller marks the item blocked; nothing is
    /// overwritten silently.
    Conflict { relative_path: String },
}

/// Forks the shared workspace into an isolated per-attempt copy and records
/// the base manifest.
pub fn prepare_attempt_workspace(
    shared_dir: &Path,
    attempts_root: &Path,
    work_item_id: &str,
    attempt_number: u32,
) -> io::Result<PathBuf> {
    let attempt_dir = attempts_root.join(format!("{work_item_id}-attempt-{attempt_number}"));
    fs::create_dir_all(&attempt_dir)?;

    let mut manifest = BaseManifest::default();
    for relative in relative_files(shared_dir)? {
        let source = shared_dir.join(&relative);
        let target = attempt_dir.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &target)?;
        manifest
            .hashes
            .insert(relative, file_digest(&source)?);
    }
    let manifest_body = serde_json::to_vec(&manifest)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    // a torn manifest would turn every later reconcile into a conflict
    atomic_write_file(&attempt_dir.join(BASE_MANIFEST_NAME), &manifest_body)?;
    Ok(attempt_dir)
}

/// Merges an attempt workspace back into the shared one. A file is written
/// only when the shared copy is untouched since the fork; a concurrent
/// change on both sides is a conflict.
pub fn reconcile(shared_dir: &Path, attempt_dir: &Path) -> io::Result<MergeOutcome> {
    let manifest = load_manifest(attempt_dir)?;
    let mut files_written = 0u32;

    for relative in relative_files(attempt_dir)? {
        if relative == BASE_MANIFEST_NAME {
            continue;
        }
        let attempt_path = attempt_dir.join(&relative);
        let shared_path = shared_dir.join(&relative);
        let attempt_hash = file_digest(&attempt_path)?;
        let base_hash = manifest.hashes.get(&relative);

        if base_hash == Some(&attempt_hash) {
            // untouched by this attempt
            continue;
        }

        if shared_path.is_file() {
            let shared_hash = file_digest(&shared_path)?;
            let shared_untouched = base_hash == Some(&shared_hash);
            if !shared_untouched && shared_hash != attempt_hash {
                return Ok(MergeOutcome::Conflict {
                    relative_path: relative,
                });
            }
            if shared_hash == attempt_hash {
                continue;
            }
        } else if base_hash.is_some() {
            // present at fork, deleted in shared since: a sibling removed it
            return Ok(MergeOutcome::Conflict {
                relative_path: relative,
            });
        }

        if let Some(parent) = shared_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&attempt_path, &shared_path)?;
        files_written += 1;
    }

    Ok(MergeOutcome::Merged { files_written })
}

fn load_manifest(attempt_dir: &Path) -> io::Result<BaseManifest> {
    let path = attempt_dir.join(BASE_MANIFEST_NAME);
    if !path.is_file() {
        return Ok(BaseManifest::default());
    }
    let raw = fs::read_to_string(&path)?;
    serde_json::from_str(&raw).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn relative_files(root: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<String>) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if path.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

fn file_digest(path: &Path) -> io::Result<String> {
    let content = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}
