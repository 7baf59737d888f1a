use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info, warn};

/// Informational file afl-fuzz drops into its output directory; not corpus
/// data, never pushed to the shared store.
const EXCLUDED_README: &str = "README.txt";

/// Ownership applied to pushed files so shared-store consumers running as a
/// different user can read and reclaim them.
const SHARED_STORE_UID: u32 = 1000;
const SHARED_STORE_GID: u32 = 1000;

/// Two-phase merge between the local output tree and the shared result
/// directory. Push runs before pull; both phases only add or refresh files,
/// never delete, so concurrent writers on sibling hosts converge through
/// repeated passes instead of locking.
#[derive(Debug, Clone)]
pub struct CorpusSynchronizer {
    local_out: PathBuf,
    shared: PathBuf,
    master_dir: String,
}

impl CorpusSynchronizer {
    pub fn new(local_out: PathBuf, shared: PathBuf, master_dir: String) -> Self {
        Self {
            local_out,
            shared,
            master_dir,
        }
    }

    /// One full sync pass. Best-effort: a failed phase is logged and the
    /// broker carries on; the next interval (or the final pass) retries.
    pub async fn run(&self) {
        match self.push().await {
            Ok(copied) => debug!(copied, "push phase done"),
            Err(err) => warn!("corpus push failed: {err:#}"),
        }
        match self.pull().await {
            Ok(copied) => debug!(copied, "pull phase done"),
            Err(err) => warn!("corpus pull failed: {err:#}"),
        }
        info!("sync done");
    }

    /// Mirror the local master's output into the shared store.
    pub async fn push(&self) -> Result<u64> {
        let src = self.local_out.join(&self.master_dir);
        let dst = self.shared.join(&self.master_dir);
        mirror(
            &src,
            &dst,
            &[EXCLUDED_README],
            Some((SHARED_STORE_UID, SHARED_STORE_GID)),
        )
        .await
    }

    /// Mirror the shared store back into the local output tree, skipping the
    /// local master's own contribution so it never overwrites what the push
    /// phase just wrote.
    pub async fn pull(&self) -> Result<u64> {
        mirror(&self.shared, &self.local_out, &[self.master_dir.as_str()], None).await
    }
}

/// Additive mirror: copies regular files that are missing at the
/// destination, differ in length, or are newer at the source; creates
/// directories as needed; never deletes. Entries whose file name matches
/// `exclude` are skipped at any depth.
async fn mirror(
    src: &Path,
    dst: &Path,
    exclude: &[&str],
    owner: Option<(u32, u32)>,
) -> Result<u64> {
    if fs::metadata(src).await.is_err() {
        // Nothing produced yet, e.g. the first interval fires before the
        // master created its output directory.
        debug!(?src, "mirror source missing, skipping");
        return Ok(0);
    }

    let mut copied = 0u64;
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to)
            .await
            .with_context(|| format!("failed to create {to:?}"))?;
        chown_best_effort(&to, owner);
        let mut entries = fs::read_dir(&from)
            .await
            .with_context(|| format!("failed to read {from:?}"))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to read {from:?}"))?
        {
            let name = entry.file_name();
            if exclude.iter().any(|skip| name == OsStr::new(skip)) {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("failed to stat {:?}", entry.path()))?;
            if file_type.is_dir() {
                pending.push((entry.path(), to.join(&name)));
            } else if file_type.is_file() {
                let target = to.join(&name);
                if needs_copy(&entry.path(), &target).await? {
                    fs::copy(entry.path(), &target)
                        .await
                        .with_context(|| format!("failed to copy {:?}", entry.path()))?;
                    chown_best_effort(&target, owner);
                    copied += 1;
                }
            }
            // Sockets, fifos and symlinks are not corpus data; leave them.
        }
    }
    Ok(copied)
}

async fn needs_copy(src: &Path, dst: &Path) -> Result<bool> {
    let Ok(dst_meta) = fs::metadata(dst).await else {
        return Ok(true);
    };
    let src_meta = fs::metadata(src)
        .await
        .with_context(|| format!("failed to stat {src:?}"))?;
    if src_meta.len() != dst_meta.len() {
        return Ok(true);
    }
    match (src_meta.modified(), dst_meta.modified()) {
        (Ok(src_time), Ok(dst_time)) => Ok(src_time > dst_time),
        _ => Ok(true),
    }
}

fn chown_best_effort(path: &Path, owner: Option<(u32, u32)>) {
    let Some((uid, gid)) = owner else { return };
    if let Err(err) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        // Unprivileged runs outside the campaign container land here; the
        // copy itself still succeeded.
        debug!(?path, %err, "chown skipped");
    }
}
