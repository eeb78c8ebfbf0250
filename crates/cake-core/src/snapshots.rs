//! Snapshot manager — coarse-grained repository captures for rollback.
//!
//! A snapshot records the committed HEAD plus enough of the working tree to
//! reconstruct it: a binary diff against HEAD and copies of untracked files.
//! Restore resets the repository to the captured HEAD and re-applies both.
//!
//! Layout under the snapshot root:
//!
//! ```text
//! snapshots/
//!   <uuid>/
//!     meta.json          snapshot metadata
//!     worktree.patch     git diff --binary HEAD
//!     untracked/...      untracked files, repo-relative
//! ```
//!
//! GC is age- and size-capped; snapshots linked to a still-open error
//! signature are pinned until that signature expires.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SnapshotError};

/// Capture must finish inside this budget.
pub const CAPTURE_BUDGET: Duration = Duration::from_secs(5);

/// Snapshot metadata persisted as `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub label: String,
    pub created_at: DateTime<Utc>,
    /// Commit id of HEAD at capture time.
    pub head: String,
    /// Repo-relative paths of uncommitted modifications captured.
    pub stashed: Vec<String>,
    /// Error signature that motivated this snapshot, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Total bytes of patch + untracked copies.
    pub bytes: u64,
}

/// Creates, restores, and garbage-collects repository snapshots.
pub struct SnapshotManager {
    repo: PathBuf,
    root: PathBuf,
    in_progress: AtomicBool,
}

impl SnapshotManager {
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            root: root.into(),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Capture a snapshot. Completes within [`CAPTURE_BUDGET`] or fails.
    pub async fn create(&self, label: &str, signature: Option<String>) -> Result<Snapshot> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(SnapshotError::InProgress.into());
        }
        struct Guard<'a>(&'a AtomicBool);
        impl Drop for Guard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _guard = Guard(&self.in_progress);

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            CAPTURE_BUDGET,
            self.capture_inner(label, signature),
        )
        .await
        .map_err(|_| SnapshotError::Timeout(CAPTURE_BUDGET.as_millis() as u64))?;

        crate::metrics::metrics().observe(
            "response_latency_seconds",
            &[("component", "snapshots"), ("operation", "create")],
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn capture_inner(&self, label: &str, signature: Option<String>) -> Result<Snapshot> {
        let head = self.git(&["rev-parse", "HEAD"]).await?.trim().to_string();
        let patch = self.git(&["diff", "--binary", "HEAD"]).await?;
        let changed = self
            .git(&["diff", "--name-only", "HEAD"])
            .await?
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let untracked = self
            .git(&["ls-files", "--others", "--exclude-standard"])
            .await?
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>();

        let id = Uuid::new_v4();
        let dir = self.root.join(id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?;

        let mut bytes = patch.len() as u64;
        tokio::fs::write(dir.join("worktree.patch"), &patch)
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?;

        for rel in &untracked {
            let src = self.repo.join(rel);
            let dst = dir.join("untracked").join(rel);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SnapshotError::Storage(e.to_string()))?;
            }
            match tokio::fs::copy(&src, &dst).await {
                Ok(copied) => bytes += copied,
                Err(e) => {
                    // The file may have vanished between listing and copy.
                    warn!(path = %rel, error = %e, "untracked file skipped during capture");
                }
            }
        }

        let mut stashed = changed;
        stashed.extend(untracked);

        let snapshot = Snapshot {
            id,
            label: label.to_string(),
            created_at: Utc::now(),
            head,
            stashed,
            signature,
            bytes,
        };
        let meta = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| SnapshotError::Storage(e.to_string()))?;
        tokio::fs::write(dir.join("meta.json"), meta)
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?;

        info!(
            id = %snapshot.id,
            label,
            files = snapshot.stashed.len(),
            bytes = snapshot.bytes,
            "snapshot captured"
        );
        Ok(snapshot)
    }

    /// Restore working tree and index to the captured state.
    pub async fn restore(&self, id: Uuid) -> Result<()> {
        let snapshot = self.load(id).await?;
        let dir = self.root.join(id.to_string());

        self.git(&["reset", "--hard", &snapshot.head]).await?;
        self.git(&["clean", "-fd"]).await?;

        let patch_path = dir.join("worktree.patch");
        let patch = tokio::fs::read(&patch_path)
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?;
        if !patch.is_empty() {
            let patch_arg = patch_path.display().to_string();
            self.git(&["apply", "--index", &patch_arg]).await?;
        }

        let untracked_root = dir.join("untracked");
        if untracked_root.is_dir() {
            copy_tree(&untracked_root, &self.repo).await?;
        }

        info!(id = %id, head = %snapshot.head, "snapshot restored");
        Ok(())
    }

    /// All snapshots, oldest first.
    pub async fn list(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(snapshots),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let meta_path = entry.path().join("meta.json");
            let Ok(payload) = tokio::fs::read_to_string(&meta_path).await else {
                continue;
            };
            match serde_json::from_str::<Snapshot>(&payload) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => debug!(path = %meta_path.display(), error = %e, "unreadable snapshot metadata"),
            }
        }
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    /// Remove snapshots past the age cap and, oldest-first, past the size
    /// cap. Snapshots whose signature is in `pinned` are kept.
    pub async fn gc(
        &self,
        retention: Duration,
        size_cap_bytes: u64,
        pinned: &HashSet<String>,
    ) -> Result<usize> {
        let snapshots = self.list().await?;
        let now = Utc::now();
        let mut removed = 0usize;
        let mut survivors: Vec<Snapshot> = Vec::new();

        for snapshot in snapshots {
            let is_pinned = snapshot
                .signature
                .as_ref()
                .is_some_and(|sig| pinned.contains(sig));
            let age = now
                .signed_duration_since(snapshot.created_at)
                .to_std()
                .unwrap_or_default();
            if !is_pinned && age > retention {
                self.remove(snapshot.id).await?;
                removed += 1;
            } else {
                survivors.push(snapshot);
            }
        }

        let mut total: u64 = survivors.iter().map(|s| s.bytes).sum();
        for snapshot in survivors {
            if total <= size_cap_bytes {
                break;
            }
            let is_pinned = snapshot
                .signature
                .as_ref()
                .is_some_and(|sig| pinned.contains(sig));
            if is_pinned {
                continue;
            }
            total = total.saturating_sub(snapshot.bytes);
            self.remove(snapshot.id).await?;
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "snapshot gc complete");
        }
        Ok(removed)
    }

    async fn load(&self, id: Uuid) -> Result<Snapshot> {
        let meta_path = self.root.join(id.to_string()).join("meta.json");
        let payload = tokio::fs::read_to_string(&meta_path)
            .await
            .map_err(|_| SnapshotError::NotFound(id.to_string()))?;
        serde_json::from_str(&payload).map_err(|e| SnapshotError::Storage(e.to_string()).into())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        let dir = self.root.join(id.to_string());
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .await
            .map_err(|e| SnapshotError::Git {
                operation: args.join(" "),
                stderr: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(SnapshotError::Git {
                operation: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

async fn copy_tree(src_root: &Path, dst_root: &Path) -> Result<()> {
    let mut stack = vec![src_root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let rel = path
                .strip_prefix(src_root)
                .map_err(|e| SnapshotError::Storage(e.to_string()))?;
            let dst = dst_root.join(rel);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SnapshotError::Storage(e.to_string()))?;
            }
            tokio::fs::copy(&path, &dst)
                .await
                .map_err(|e| SnapshotError::Storage(e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Initialize a throwaway git repo with one commit; `None` when git is
    /// not available on this machine.
    async fn test_repo() -> Option<(tempfile::TempDir, SnapshotManager)> {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "cake@test"],
            vec!["config", "user.name", "cake"],
        ] {
            let ok = Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .await
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !ok {
                return None;
            }
        }
        std::fs::write(repo.join("main.py"), "print('hello')\n").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-q", "-m", "init"]] {
            let ok = Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .await
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !ok {
                return None;
            }
        }

        let root = dir.path().join("snapshots");
        let manager = SnapshotManager::new(repo, root);
        Some((dir, manager))
    }

    #[tokio::test]
    async fn create_captures_modifications_and_untracked() {
        let Some((dir, manager)) = test_repo().await else {
            return;
        };
        let repo = dir.path().join("repo");
        std::fs::write(repo.join("main.py"), "print('changed')\n").unwrap();
        std::fs::write(repo.join("new_file.txt"), "untracked\n").unwrap();

        let snapshot = manager.create("pre-intervention", None).await.unwrap();
        assert!(!snapshot.head.is_empty());
        assert!(snapshot.stashed.contains(&"main.py".to_string()));
        assert!(snapshot.stashed.contains(&"new_file.txt".to_string()));
        assert!(snapshot.bytes > 0);
    }

    #[tokio::test]
    async fn restore_round_trips_working_tree() {
        let Some((dir, manager)) = test_repo().await else {
            return;
        };
        let repo = dir.path().join("repo");
        std::fs::write(repo.join("main.py"), "print('changed')\n").unwrap();
        std::fs::write(repo.join("extra.txt"), "keep me\n").unwrap();

        let snapshot = manager.create("checkpoint", None).await.unwrap();

        // Wreck the tree after the snapshot.
        std::fs::write(repo.join("main.py"), "broken!!!\n").unwrap();
        std::fs::write(repo.join("junk.txt"), "junk\n").unwrap();

        manager.restore(snapshot.id).await.unwrap();

        let main = std::fs::read_to_string(repo.join("main.py")).unwrap();
        assert_eq!(main, "print('changed')\n");
        let extra = std::fs::read_to_string(repo.join("extra.txt")).unwrap();
        assert_eq!(extra, "keep me\n");
        assert!(!repo.join("junk.txt").exists());
    }

    #[tokio::test]
    async fn restore_unknown_id_errors() {
        let Some((_dir, manager)) = test_repo().await else {
            return;
        };
        let err = manager.restore(Uuid::new_v4()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn list_returns_snapshots_oldest_first() {
        let Some((dir, manager)) = test_repo().await else {
            return;
        };
        let repo = dir.path().join("repo");
        std::fs::write(repo.join("a.txt"), "a\n").unwrap();
        let first = manager.create("first", None).await.unwrap();
        std::fs::write(repo.join("b.txt"), "b\n").unwrap();
        let second = manager.create("second", None).await.unwrap();

        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn concurrent_capture_rejected() {
        let Some((_dir, manager)) = test_repo().await else {
            return;
        };
        manager.in_progress.store(true, Ordering::SeqCst);
        let err = manager.create("busy", None).await.unwrap_err();
        assert!(err.to_string().contains("in progress"));
        manager.in_progress.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn gc_respects_pins_and_size_cap() {
        let Some((dir, manager)) = test_repo().await else {
            return;
        };
        let repo = dir.path().join("repo");
        std::fs::write(repo.join("a.txt"), "a".repeat(100)).unwrap();
        let pinned_snapshot = manager
            .create("pinned", Some("sig-open".to_string()))
            .await
            .unwrap();
        std::fs::write(repo.join("b.txt"), "b".repeat(100)).unwrap();
        let _unpinned = manager.create("unpinned", None).await.unwrap();

        let mut pinned = HashSet::new();
        pinned.insert("sig-open".to_string());

        // Size cap of zero forces eviction of everything unpinned.
        let removed = manager.gc(Duration::from_secs(3600), 0, &pinned).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = manager.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, pinned_snapshot.id);
    }

    #[tokio::test]
    async fn gc_age_cap_removes_old_unpinned() {
        let Some((dir, manager)) = test_repo().await else {
            return;
        };
        let repo = dir.path().join("repo");
        std::fs::write(repo.join("a.txt"), "a\n").unwrap();
        let snapshot = manager.create("old", None).await.unwrap();

        // Zero retention: everything unpinned is past the age cap.
        let removed = manager
            .gc(Duration::from_secs(0), u64::MAX, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(manager.load(snapshot.id).await.is_err());
    }
}
