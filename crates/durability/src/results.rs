//! Results persistence
//!
//! Writes the run summary locally with temp-file-and-rename atomicity and
//! optionally uploads it to a remote sink. Remote failure never fails the
//! run: the summary records `remote_uri = None` plus the surfaced error.

use retrodict_core::{Result, RunSummary};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Remote sink for run summaries
///
/// Transport neutral; the object-store client of the data store typically
/// backs this in deployments.
pub trait RemoteSink: Send + Sync {
    /// Upload the named payload, returning its remote URI
    fn upload(&self, name: &str, bytes: &[u8]) -> Result<String>;
}

/// Where the summary ended up
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedResult {
    /// Local summary path (always written)
    pub local_path: PathBuf,
    /// Remote URI when upload succeeded
    pub remote_uri: Option<String>,
    /// Upload error, surfaced but tolerated
    pub remote_error: Option<String>,
}

/// Persist a run summary
///
/// The local write is atomic via temp-file-and-rename. Upload runs only
/// when a sink is provided, and its failure is reported in the returned
/// result (and mirrored into the summary by the caller), never raised.
pub fn persist(
    summary: &RunSummary,
    dir: &Path,
    remote: Option<&dyn RemoteSink>,
) -> Result<PersistedResult> {
    fs::create_dir_all(dir)?;
    let name = format!("{}.json", summary.run_id);
    let path = dir.join(&name);
    let tmp = dir.join(format!("{}.tmp", name));

    let bytes = serde_json::to_vec_pretty(summary)?;
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, &path)?;
    info!(
        target: "retrodict::results",
        run = %summary.run_id,
        path = %path.display(),
        "run summary persisted"
    );

    let (remote_uri, remote_error) = match remote {
        Some(sink) => match sink.upload(&name, &bytes) {
            Ok(uri) => (Some(uri), None),
            Err(e) => {
                warn!(
                    target: "retrodict::results",
                    run = %summary.run_id,
                    error = %e,
                    "remote upload failed, keeping local result"
                );
                (None, Some(e.to_string()))
            }
        },
        None => (None, None),
    };

    Ok(PersistedResult {
        local_path: path,
        remote_uri,
        remote_error,
    })
}
