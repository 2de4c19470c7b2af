//! Workspace acquisition: download, extract, and resolve exercise content.
//!
//! A workspace is the on-disk unpacked copy of one exercise's release
//! archive. `ensure` is idempotent and coalesces concurrent requests for the
//! same exercise into a single in-flight download.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{AppError, ErrorCode};
use crate::registry::{self, Exercise};

/// Hard ceiling on one release fetch, metadata and archive together.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// How many directory levels below the workspace root a sub-exercise may live.
const SUB_EXERCISE_MAX_DEPTH: usize = 3;

type EnsureFuture = Shared<BoxFuture<'static, Result<PathBuf, AppError>>>;

/// Release metadata, as returned by the archive host's release-by-tag endpoint.
#[derive(Debug, Deserialize)]
struct ReleaseRecord {
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
    zipball_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

pub struct WorkspacePipeline {
    root: PathBuf,
    api_base: String,
    client: reqwest::Client,
    /// One shared in-flight `ensure` per exercise id; the entry is removed
    /// when the operation settles so a failed attempt can be retried.
    in_flight: Mutex<HashMap<String, EnsureFuture>>,
}

impl WorkspacePipeline {
    pub fn new(root: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(concat!("termlab/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to construct http client");
        Self {
            root,
            api_base: registry::release_api_base(),
            client,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Directory a given exercise unpacks into.
    pub fn workspace_dir(&self, exercise_id: &str) -> PathBuf {
        self.root.join(exercise_id)
    }

    /// Resolve an exercise id to a ready workspace directory, downloading and
    /// extracting its release archive on first use.
    pub async fn ensure(self: &Arc<Self>, exercise_id: &str) -> Result<PathBuf, AppError> {
        let exercise = registry::lookup(exercise_id).ok_or_else(|| {
            AppError::new(
                ErrorCode::ExerciseNotFound,
                format!("unknown exercise '{exercise_id}'"),
            )
        })?;
        let dir = self.workspace_dir(exercise_id);
        if workspace_ready(&dir) {
            return Ok(dir);
        }

        let fut = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(existing) = in_flight.get(exercise_id) {
                existing.clone()
            } else {
                let this = Arc::clone(self);
                let id = exercise_id.to_string();
                let dir = dir.clone();
                let fut = async move {
                    // A coalesced waiter may arrive after an earlier attempt
                    // already populated the directory.
                    let result = if workspace_ready(&dir) {
                        Ok(())
                    } else {
                        this.fetch_into(exercise, &dir).await
                    };
                    this.in_flight.lock().unwrap().remove(&id);
                    result.map(|_| dir)
                }
                .boxed()
                .shared();
                in_flight.insert(exercise_id.to_string(), fut.clone());
                fut
            }
        };
        fut.await
    }

    /// Delete the workspace for an exercise. The caller must have killed any
    /// process running inside it first.
    pub async fn reset(&self, exercise_id: &str) -> Result<(), AppError> {
        let dir = self.workspace_dir(exercise_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(exercise = exercise_id, "workspace reset");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::new(
                ErrorCode::ExtractionFailed,
                format!("failed to remove workspace for '{exercise_id}': {e}"),
            )),
        }
    }

    async fn fetch_into(&self, exercise: &Exercise, dir: &Path) -> Result<(), AppError> {
        info!(exercise = exercise.id, tag = exercise.tag, "downloading workspace");
        let result = self.fetch_into_inner(exercise, dir).await;
        if result.is_err() {
            // Leave no half-extracted tree behind; a retry must start clean.
            let _ = fs::remove_dir_all(dir);
        }
        result
    }

    async fn fetch_into_inner(&self, exercise: &Exercise, dir: &Path) -> Result<(), AppError> {
        fs::create_dir_all(dir).map_err(|e| {
            AppError::new(
                ErrorCode::DownloadFailed,
                format!("failed to create workspace directory: {e}"),
            )
        })?;

        let url = format!(
            "{}/repos/{}/releases/tags/{}",
            self.api_base, exercise.repo, exercise.tag
        );
        let response = self.client.get(&url).send().await.map_err(net_err)?;
        if !response.status().is_success() {
            return Err(AppError::new(
                ErrorCode::DownloadFailed,
                format!(
                    "release lookup for {}@{} returned {}",
                    exercise.repo,
                    exercise.tag,
                    response.status()
                ),
            ));
        }
        let release: ReleaseRecord = response.json().await.map_err(net_err)?;

        // Prefer a packaged archive asset; fall back to the source zipball.
        let archive_url = release
            .assets
            .iter()
            .find(|a| a.name.ends_with(".zip"))
            .map(|a| a.browser_download_url.clone())
            .or(release.zipball_url)
            .ok_or_else(|| {
                AppError::new(
                    ErrorCode::DownloadFailed,
                    format!("release {}@{} has no archive", exercise.repo, exercise.tag),
                )
            })?;

        let archive_path = self.root.join(format!("{}.zip.partial", exercise.id));
        let download = self.download_to(&archive_url, &archive_path).await;
        if let Err(e) = download {
            let _ = fs::remove_file(&archive_path);
            return Err(e);
        }

        let archive = archive_path.clone();
        let dest = dir.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract_and_hoist(&archive, &dest))
            .await
            .map_err(|e| format!("extraction task failed: {e}"))
            .and_then(|r| r);
        let _ = fs::remove_file(&archive_path);
        extracted.map_err(|e| {
            AppError::with_action(
                ErrorCode::ExtractionFailed,
                format!("failed to extract archive for '{}': {e}", exercise.id),
                "Reset the exercise and try again",
            )
        })?;

        info!(exercise = exercise.id, dir = %dir.display(), "workspace ready");
        Ok(())
    }

    async fn download_to(&self, url: &str, path: &Path) -> Result<(), AppError> {
        let response = self.client.get(url).send().await.map_err(net_err)?;
        if !response.status().is_success() {
            return Err(AppError::new(
                ErrorCode::DownloadFailed,
                format!("archive download returned {}", response.status()),
            ));
        }
        let mut file = tokio::fs::File::create(path).await.map_err(|e| {
            AppError::new(
                ErrorCode::DownloadFailed,
                format!("failed to create archive file: {e}"),
            )
        })?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(net_err)?;
            file.write_all(&chunk).await.map_err(|e| {
                AppError::new(
                    ErrorCode::DownloadFailed,
                    format!("failed to write archive to disk: {e}"),
                )
            })?;
        }
        file.flush().await.map_err(|e| {
            AppError::new(
                ErrorCode::DownloadFailed,
                format!("failed to flush archive to disk: {e}"),
            )
        })
    }
}

/// Map a network failure, keeping timeouts distinguishable for the client.
fn net_err(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::with_action(
            ErrorCode::DownloadTimeout,
            format!("download timed out: {e}"),
            "Check your network connection and retry",
        )
    } else {
        AppError::with_action(
            ErrorCode::DownloadFailed,
            format!("download failed: {e}"),
            "Retry, or reset the exercise if this persists",
        )
    }
}

/// A workspace counts as ready once it holds any non-hidden entry.
fn workspace_ready(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|e| !e.file_name().to_string_lossy().starts_with('.'))
}

/// Unpack `archive` into `dest`, then hoist a single wrapping directory.
fn extract_and_hoist(archive: &Path, dest: &Path) -> Result<(), String> {
    let file = fs::File::open(archive).map_err(|e| format!("open archive: {e}"))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| format!("read archive: {e}"))?;
    zip.extract(dest).map_err(|e| format!("unpack archive: {e}"))?;
    hoist_single_root(dest).map_err(|e| format!("hoist archive root: {e}"))
}

/// GitHub zipballs wrap the tree in one `owner-repo-sha` directory; when
/// extraction yields exactly one top-level directory, move its contents
/// (hidden files included) up so the workspace root is the exercise content.
fn hoist_single_root(dir: &Path) -> std::io::Result<()> {
    let entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    if entries.len() != 1 || !entries[0].file_type()?.is_dir() {
        return Ok(());
    }
    // Rename the wrapper aside first so a child with the same name can't collide.
    let staged = dir.join(".termlab-unwrap");
    fs::rename(entries[0].path(), &staged)?;
    for entry in fs::read_dir(&staged)? {
        let entry = entry?;
        fs::rename(entry.path(), dir.join(entry.file_name()))?;
    }
    fs::remove_dir(&staged)
}

/// Find the directory for a sub-exercise: breadth-first, at most
/// [`SUB_EXERCISE_MAX_DEPTH`] levels down, first directory named
/// `exercise-{sub_id}-*`. Falls back to the workspace root on no match;
/// never fails.
pub fn resolve_sub_exercise(root: &Path, sub_id: &str) -> PathBuf {
    let prefix = format!("exercise-{sub_id}-");
    let mut level = vec![root.to_path_buf()];
    for _ in 0..SUB_EXERCISE_MAX_DEPTH {
        let mut next = Vec::new();
        for dir in &level {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            let mut children: Vec<PathBuf> = entries
                .flatten()
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|e| e.path())
                .collect();
            children.sort();
            for child in children {
                let name = child.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if name.starts_with(&prefix) {
                    return child;
                }
                next.push(child);
            }
        }
        level = next;
    }
    warn!(sub_id, root = %root.display(), "sub-exercise not found, using workspace root");
    root.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pipeline(root: &Path) -> Arc<WorkspacePipeline> {
        Arc::new(WorkspacePipeline::new(root.to_path_buf()))
    }

    #[tokio::test]
    async fn ensure_rejects_unknown_exercise_without_writes() {
        let tmp = TempDir::new().unwrap();
        let pipe = pipeline(tmp.path());
        let err = pipe.ensure("no-such-exercise").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ExerciseNotFound);
        assert!(
            fs::read_dir(tmp.path()).unwrap().next().is_none(),
            "unknown exercise must not touch the filesystem"
        );
    }

    #[tokio::test]
    async fn ensure_short_circuits_on_populated_workspace() {
        let tmp = TempDir::new().unwrap();
        let pipe = pipeline(tmp.path());
        let dir = tmp.path().join("getting-started");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("README.md"), "content").unwrap();

        // No release host is reachable in tests, so a network attempt would fail.
        let resolved = pipe.ensure("getting-started").await.unwrap();
        assert_eq!(resolved, dir);

        let again = pipe.ensure("getting-started").await.unwrap();
        assert_eq!(again, dir);
    }

    #[test]
    fn hidden_only_directories_do_not_count_as_ready() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("getting-started");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(".gitkeep"), "").unwrap();
        assert!(!workspace_ready(&dir));
    }

    #[tokio::test]
    async fn reset_removes_workspace_and_tolerates_absence() {
        let tmp = TempDir::new().unwrap();
        let pipe = pipeline(tmp.path());
        let dir = tmp.path().join("getting-started");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/file.txt"), "x").unwrap();

        pipe.reset("getting-started").await.unwrap();
        assert!(!dir.exists());

        // Resetting an absent workspace is not an error.
        pipe.reset("getting-started").await.unwrap();
    }

    #[test]
    fn hoist_moves_single_wrapper_contents_up() {
        let tmp = TempDir::new().unwrap();
        let wrapper = tmp.path().join("owner-repo-abc123");
        fs::create_dir_all(wrapper.join("src")).unwrap();
        fs::write(wrapper.join("README.md"), "readme").unwrap();
        fs::write(wrapper.join(".hidden"), "dotfile").unwrap();
        fs::write(wrapper.join("src/main.rs"), "fn main() {}").unwrap();

        hoist_single_root(tmp.path()).unwrap();

        assert!(tmp.path().join("README.md").is_file());
        assert!(tmp.path().join(".hidden").is_file());
        assert!(tmp.path().join("src/main.rs").is_file());
        assert!(!tmp.path().join("owner-repo-abc123").exists());
    }

    #[test]
    fn hoist_leaves_multi_entry_roots_alone() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::write(tmp.path().join("b.txt"), "b").unwrap();

        hoist_single_root(tmp.path()).unwrap();

        assert!(tmp.path().join("a").is_dir());
        assert!(tmp.path().join("b.txt").is_file());
    }

    #[test]
    fn resolve_finds_sub_exercise_breadth_first() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("module-1/exercise-1.1-first-task")).unwrap();
        fs::create_dir_all(root.join("module-2/exercise-2.1-third-task")).unwrap();

        assert_eq!(
            resolve_sub_exercise(root, "1.1"),
            root.join("module-1/exercise-1.1-first-task")
        );
        assert_eq!(
            resolve_sub_exercise(root, "2.1"),
            root.join("module-2/exercise-2.1-third-task")
        );
    }

    #[test]
    fn resolve_falls_back_to_root_on_miss() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("module-1/exercise-1.1-first-task")).unwrap();

        assert_eq!(resolve_sub_exercise(root, "99.99"), root);
        // A missing root degrades the same way instead of failing.
        let gone = root.join("nowhere");
        assert_eq!(resolve_sub_exercise(&gone, "1.1"), gone);
    }

    #[test]
    fn resolve_does_not_descend_past_depth_limit() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a/b/c/exercise-9.9-too-deep")).unwrap();

        // The match sits at depth 4; the search stops at 3.
        assert_eq!(resolve_sub_exercise(root, "9.9"), root);
    }

    #[test]
    fn resolve_prefers_shallower_matches() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("exercise-1.1-shallow")).unwrap();
        fs::create_dir_all(root.join("module/exercise-1.1-deep")).unwrap();

        assert_eq!(
            resolve_sub_exercise(root, "1.1"),
            root.join("exercise-1.1-shallow")
        );
    }
}
