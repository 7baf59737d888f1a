use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::info;

/// Unpack an input archive into the campaign directory. Extraction failure
/// is fatal: without the target binary or the seed corpus there is no
/// campaign to run.
pub async fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let status = Command::new("unzip")
        .arg("-o")
        .arg(archive)
        .arg("-d")
        .arg(dest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .await
        .with_context(|| format!("failed to run unzip for {archive:?}"))?;
    if !status.success() {
        bail!("failed to unzip {archive:?}");
    }
    info!(?archive, "extracted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_archive_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = extract(&dir.path().join("nope.zip"), dir.path()).await;
        assert!(result.is_err());
    }
}
