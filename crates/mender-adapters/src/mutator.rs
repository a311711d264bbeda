//! The Repository Mutator: turns a fix proposal into a reviewable branch.
//!
//! Local work (branching, applying, committing) goes through git2 and fails
//! fast. Every call to the hosting service or the git remote runs under the
//! shared backoff policy and surfaces as [`RemoteUnavailableError`] once the
//! budget is spent.

use crate::config::Config;
use crate::git_ops;
use crate::github::{GitHubClient, HostingError, HostingService, PullRequestInfo};
use crate::push::{BranchPusher, GitCliPusher, PushError};
use crate::util::{resolve_repo_path_allow_new, RepoPath};
use async_trait::async_trait;
use chrono::Utc;
use mender_core::patch;
use mender_core::{retry, BackoffPolicy, FixProposal, PatchApplyError, StageCounter};
use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("branch '{branch}' already exists and was not created by mender")]
pub struct BranchExistsError {
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed after {attempts} attempt(s): {detail}")]
pub struct RemoteUnavailableError {
    pub operation: String,
    pub attempts: u32,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error(transparent)]
    BranchExists(#[from] BranchExistsError),
    #[error(transparent)]
    PatchApply(#[from] PatchApplyError),
    #[error(transparent)]
    RemoteUnavailable(#[from] RemoteUnavailableError),
    #[error("local repository error: {0}")]
    Local(String),
}

impl MutationError {
    fn local(err: anyhow::Error) -> Self {
        MutationError::Local(format!("{:#}", err))
    }
}

/// A work branch ready for commits. Two handles are equal when they name the
/// same branch on the same base, however they were obtained.
#[derive(Debug, Clone)]
pub struct BranchHandle {
    pub name: String,
    pub base_branch: String,
    pub base_commit: String,
    /// The branch already existed (locally or remotely) from an earlier attempt.
    pub reused: bool,
}

impl PartialEq for BranchHandle {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.base_branch == other.base_branch
            && self.base_commit == other.base_commit
    }
}

impl Eq for BranchHandle {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReference {
    pub id: String,
    pub branch: String,
    pub path: PathBuf,
}

/// Title and body for the review request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequestDraft {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequestReference {
    pub number: u64,
    pub url: String,
    pub updated_existing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
}

/// A repository file as it currently exists on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Repository-relative path.
    pub path: PathBuf,
    pub content: String,
}

#[async_trait]
pub trait RepositoryMutator: Send + Sync {
    /// Read a file referenced by a failure record. Absolute paths inside the
    /// checkout are accepted; anything outside it reads as `None`.
    fn read_source(&self, path: &Path) -> Result<Option<SourceFile>, MutationError>;

    /// Create (or reuse a pipeline-owned) work branch from `base_branch` and
    /// check it out.
    async fn create_work_branch(
        &self,
        base_branch: &str,
        name: &str,
        counter: &mut StageCounter,
    ) -> Result<BranchHandle, MutationError>;

    /// Apply and commit a proposal on the checked-out work branch. Never retried.
    fn apply_patch(
        &self,
        handle: &BranchHandle,
        proposal: &FixProposal,
    ) -> Result<CommitReference, MutationError>;

    /// Push the branch and open or update its review request.
    async fn publish(
        &self,
        handle: &BranchHandle,
        draft: &ReviewRequestDraft,
        counter: &mut StageCounter,
    ) -> Result<ReviewRequestReference, MutationError>;

    /// Delete remote work branches older than `older_than` with no open
    /// review request.
    async fn cleanup_stale_branches(
        &self,
        older_than: Duration,
        counter: &mut StageCounter,
    ) -> Result<CleanupReport, MutationError>;
}

pub struct GitRepositoryMutator {
    repo_path: PathBuf,
    run_id: String,
    branch_prefix: String,
    policy: BackoffPolicy,
    pusher: Box<dyn BranchPusher>,
    hosting: Box<dyn HostingService>,
}

impl GitRepositoryMutator {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        run_id: impl Into<String>,
        branch_prefix: impl Into<String>,
        policy: BackoffPolicy,
        pusher: Box<dyn BranchPusher>,
        hosting: Box<dyn HostingService>,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            run_id: run_id.into(),
            branch_prefix: branch_prefix.into(),
            policy,
            pusher,
            hosting,
        }
    }

    /// Wire the git CLI pusher and GitHub client from configuration.
    pub fn from_config(repo_path: impl Into<PathBuf>, config: &Config) -> anyhow::Result<Self> {
        let hosting = &config.hosting;
        let pusher = GitCliPusher::new(
            &hosting.server_url,
            &hosting.repository.to_string(),
            hosting.token.expose(),
            config.push_disabled,
        )?;
        let client = GitHubClient::new(hosting)?;
        Ok(Self::new(
            repo_path,
            config.run_id.clone(),
            hosting.branch_prefix.clone(),
            config.retry.clone(),
            Box::new(pusher),
            Box::new(client),
        ))
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Run one remote operation under the backoff policy.
    async fn remote<T, E, C, Op, Fut>(
        &self,
        counter: &mut StageCounter,
        operation: &str,
        classify: C,
        op: Op,
    ) -> Result<T, RemoteUnavailableError>
    where
        E: Display,
        C: Fn(&E) -> mender_core::RetryDecision,
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let before = counter.calls;
        retry(&self.policy, counter, operation, classify, op)
            .await
            .map_err(|err| RemoteUnavailableError {
                operation: operation.to_string(),
                attempts: counter.calls - before,
                detail: err.to_string(),
            })
    }

    fn relativize(&self, path: &Path) -> Option<PathBuf> {
        if !path.is_absolute() {
            return Some(path.to_path_buf());
        }
        let root = self.repo_path.canonicalize().ok()?;
        if let Ok(rel) = path.strip_prefix(&root) {
            return Some(rel.to_path_buf());
        }
        path.strip_prefix(&self.repo_path).ok().map(Path::to_path_buf)
    }

    fn commit_message(&self, proposal: &FixProposal) -> String {
        let mut message = format!("fix: {}", proposal.summary());
        let rationale = proposal.rationale.trim();
        if !rationale.is_empty() {
            message.push_str("\n\n");
            message.push_str(rationale);
        }
        git_ops::with_trailers(&message, &self.run_id)
    }

    /// Put the working tree and index back the way they were before a failed
    /// commit. Failures are logged; the commit error is what gets reported.
    fn roll_back_file(&self, resolved: &RepoPath, original: Option<&str>) {
        let restored = match original {
            Some(content) => std::fs::write(&resolved.absolute, content),
            None => std::fs::remove_file(&resolved.absolute),
        };
        if let Err(err) = restored {
            tracing::warn!(
                file = %resolved.relative.display(),
                error = %err,
                "failed to restore working file after commit failure"
            );
        }
        if let Err(err) = git_ops::unstage_file(&self.repo_path, &resolved.relative) {
            tracing::warn!(
                file = %resolved.relative.display(),
                error = %format!("{:#}", err),
                "failed to reset index entry after commit failure"
            );
        }
    }

    async fn open_or_update(
        &self,
        handle: &BranchHandle,
        draft: &ReviewRequestDraft,
        counter: &mut StageCounter,
    ) -> Result<ReviewRequestReference, RemoteUnavailableError> {
        let existing: Option<PullRequestInfo> = self
            .remote(
                counter,
                "find review request",
                HostingError::retry_decision,
                |_| self.hosting.find_open_review_request(&handle.name),
            )
            .await?;

        if let Some(existing) = existing {
            let pr = self
                .remote(
                    counter,
                    "update review request",
                    HostingError::retry_decision,
                    |_| {
                        self.hosting
                            .update_review_request(existing.number, &draft.title, &draft.body)
                    },
                )
                .await?;
            return Ok(ReviewRequestReference {
                number: pr.number,
                url: pr.url,
                updated_existing: true,
            });
        }

        let pr = self
            .remote(
                counter,
                "create review request",
                HostingError::retry_decision,
                |_| {
                    self.hosting.create_review_request(
                        &handle.name,
                        &handle.base_branch,
                        &draft.title,
                        &draft.body,
                    )
                },
            )
            .await?;
        Ok(ReviewRequestReference {
            number: pr.number,
            url: pr.url,
            updated_existing: false,
        })
    }
}

#[async_trait]
impl RepositoryMutator for GitRepositoryMutator {
    fn read_source(&self, path: &Path) -> Result<Option<SourceFile>, MutationError> {
        let Some(relative) = self.relativize(path) else {
            return Ok(None);
        };
        let Ok(resolved) = resolve_repo_path_allow_new(&self.repo_path, &relative) else {
            return Ok(None);
        };
        if !resolved.absolute.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&resolved.absolute).map_err(|e| {
            MutationError::Local(format!("Failed to read {}: {}", relative.display(), e))
        })?;
        Ok(Some(SourceFile {
            path: resolved.relative,
            content,
        }))
    }

    async fn create_work_branch(
        &self,
        base_branch: &str,
        name: &str,
        counter: &mut StageCounter,
    ) -> Result<BranchHandle, MutationError> {
        if !git_ops::is_valid_git_ref(name) {
            return Err(MutationError::Local(format!(
                "'{}' is not a valid branch name",
                name
            )));
        }
        let base_commit = git_ops::resolve_base_commit(&self.repo_path, base_branch)
            .map_err(MutationError::local)?;

        let local = git_ops::inspect_local_branch(&self.repo_path, name, &base_commit)
            .map_err(MutationError::local)?;
        if !local.is_reusable() {
            tracing::warn!(branch = name, ownership = ?local, "local branch has foreign commits");
            return Err(BranchExistsError {
                branch: name.to_string(),
            }
            .into());
        }

        let remote = self
            .remote(
                counter,
                "inspect remote branch",
                HostingError::retry_decision,
                |_| self.hosting.branch_commits(base_branch, name),
            )
            .await?;
        if let Some(commits) = &remote {
            if let Some(foreign) = commits
                .iter()
                .find(|c| !git_ops::has_ownership_trailer(&c.message))
            {
                tracing::warn!(
                    branch = name,
                    commit = %foreign.sha,
                    "remote branch has foreign commits"
                );
                return Err(BranchExistsError {
                    branch: name.to_string(),
                }
                .into());
            }
        }

        let outcome = git_ops::checkout_work_branch(&self.repo_path, name, &base_commit)
            .map_err(MutationError::local)?;
        let reused = !outcome.created_new || remote.is_some();
        tracing::info!(branch = name, base = base_branch, reused, "work branch ready");

        Ok(BranchHandle {
            name: outcome.branch_name,
            base_branch: base_branch.to_string(),
            base_commit,
            reused,
        })
    }

    fn apply_patch(
        &self,
        handle: &BranchHandle,
        proposal: &FixProposal,
    ) -> Result<CommitReference, MutationError> {
        let current_branch = git_ops::current_branch(&self.repo_path).ok();
        if current_branch.as_deref() != Some(handle.name.as_str()) {
            git_ops::checkout_branch(&self.repo_path, &handle.name).map_err(MutationError::local)?;
        }

        let resolved = resolve_repo_path_allow_new(&self.repo_path, &proposal.target_file)
            .map_err(|_| PatchApplyError::UnsafePath(proposal.target_file.clone()))?;
        let current = if resolved.absolute.exists() {
            Some(
                std::fs::read_to_string(&resolved.absolute)
                    .map_err(|e| PatchApplyError::Io(e.to_string()))?,
            )
        } else {
            None
        };

        let updated = patch::apply(current.as_deref(), proposal)?;

        if let Some(parent) = resolved.absolute.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PatchApplyError::Io(e.to_string()))?;
        }
        std::fs::write(&resolved.absolute, &updated)
            .map_err(|e| PatchApplyError::Io(e.to_string()))?;

        let committed = git_ops::stage_file(&self.repo_path, &resolved.relative)
            .and_then(|_| git_ops::commit(&self.repo_path, &self.commit_message(proposal)));
        let id = match committed {
            Ok(id) => id,
            Err(err) => {
                self.roll_back_file(&resolved, current.as_deref());
                return Err(MutationError::local(err));
            }
        };

        tracing::info!(
            branch = %handle.name,
            file = %resolved.relative.display(),
            commit = %id,
            format = proposal.patch.label(),
            "patch applied"
        );
        Ok(CommitReference {
            id,
            branch: handle.name.clone(),
            path: resolved.relative,
        })
    }

    async fn publish(
        &self,
        handle: &BranchHandle,
        draft: &ReviewRequestDraft,
        counter: &mut StageCounter,
    ) -> Result<ReviewRequestReference, MutationError> {
        self.remote(counter, "push", PushError::retry_decision, |_| {
            self.pusher.push(&self.repo_path, &handle.name)
        })
        .await?;
        tracing::info!(branch = %handle.name, "branch pushed");

        let reference = self.open_or_update(handle, draft, counter).await?;
        tracing::info!(
            url = %reference.url,
            updated = reference.updated_existing,
            "review request ready"
        );
        Ok(reference)
    }

    async fn cleanup_stale_branches(
        &self,
        older_than: Duration,
        counter: &mut StageCounter,
    ) -> Result<CleanupReport, MutationError> {
        let window = chrono::Duration::from_std(older_than)
            .map_err(|e| MutationError::Local(format!("Invalid retention window: {}", e)))?;
        let cutoff = Utc::now() - window;

        let branches = self
            .remote(
                counter,
                "list branches",
                HostingError::retry_decision,
                |_| self.hosting.list_branches(&self.branch_prefix),
            )
            .await?;

        let mut report = CleanupReport::default();
        for branch in branches {
            let stale = branch.committed_at.is_some_and(|at| at < cutoff);
            if !stale {
                report.kept.push(branch.name);
                continue;
            }
            let open = self
                .remote(
                    counter,
                    "find review request",
                    HostingError::retry_decision,
                    |_| self.hosting.find_open_review_request(&branch.name),
                )
                .await?;
            if open.is_some() {
                tracing::debug!(
                    branch = %branch.name,
                    "keeping stale branch with open review request"
                );
                report.kept.push(branch.name);
                continue;
            }
            self.remote(
                counter,
                "delete branch",
                HostingError::retry_decision,
                |_| self.hosting.delete_branch(&branch.name),
            )
            .await?;
            tracing::info!(branch = %branch.name, "deleted stale work branch");
            report.deleted.push(branch.name);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_ops::tests::{commit_test_file, create_temp_repo};
    use crate::github::{RemoteBranch, RemoteCommit};
    use mender_core::{content_digest, PatchBody};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct StubPusher {
        failure: Option<PushError>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BranchPusher for StubPusher {
        async fn push(&self, _repo_path: &Path, _branch: &str) -> Result<(), PushError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.failure {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct StubHosting {
        remote_commits: Mutex<HashMap<String, Vec<RemoteCommit>>>,
        open: Mutex<HashMap<String, PullRequestInfo>>,
        branches: Mutex<Vec<RemoteBranch>>,
        deleted: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl HostingService for StubHosting {
        async fn find_open_review_request(
            &self,
            branch: &str,
        ) -> Result<Option<PullRequestInfo>, HostingError> {
            Ok(self.open.lock().unwrap().get(branch).cloned())
        }

        async fn create_review_request(
            &self,
            branch: &str,
            _base: &str,
            _title: &str,
            _body: &str,
        ) -> Result<PullRequestInfo, HostingError> {
            let mut open = self.open.lock().unwrap();
            let number = open.len() as u64 + 1;
            let pr = PullRequestInfo {
                number,
                url: format!("https://github.test/acme/widgets/pull/{}", number),
            };
            open.insert(branch.to_string(), pr.clone());
            Ok(pr)
        }

        async fn update_review_request(
            &self,
            number: u64,
            _title: &str,
            _body: &str,
        ) -> Result<PullRequestInfo, HostingError> {
            Ok(PullRequestInfo {
                number,
                url: format!("https://github.test/acme/widgets/pull/{}", number),
            })
        }

        async fn branch_commits(
            &self,
            _base: &str,
            branch: &str,
        ) -> Result<Option<Vec<RemoteCommit>>, HostingError> {
            Ok(self.remote_commits.lock().unwrap().get(branch).cloned())
        }

        async fn list_branches(&self, _prefix: &str) -> Result<Vec<RemoteBranch>, HostingError> {
            Ok(self.branches.lock().unwrap().clone())
        }

        async fn delete_branch(&self, branch: &str) -> Result<(), HostingError> {
            self.deleted.lock().unwrap().push(branch.to_string());
            Ok(())
        }
    }

    fn mutator(repo_path: &Path, pusher: StubPusher, hosting: StubHosting) -> GitRepositoryMutator {
        GitRepositoryMutator::new(
            repo_path,
            "42",
            "fix/ai-heal",
            BackoffPolicy::immediate(3),
            Box::new(pusher),
            Box::new(hosting),
        )
    }

    fn replacement(path: &str, body: &str, base: Option<&str>) -> FixProposal {
        FixProposal {
            target_file: PathBuf::from(path),
            patch: PatchBody::Replacement(body.to_string()),
            rationale: "Expected value was wrong.\nThe function returns 4.".to_string(),
            base_digest: base.map(content_digest),
        }
    }

    #[tokio::test]
    async fn test_create_work_branch_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let m = mutator(&repo_path, StubPusher::default(), StubHosting::default());
        let mut counter = StageCounter::default();

        let first = m
            .create_work_branch("main", "fix/ai-heal/42-abc", &mut counter)
            .await
            .unwrap();
        let second = m
            .create_work_branch("main", "fix/ai-heal/42-abc", &mut counter)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, second.name);
        assert_eq!(first.base_commit, second.base_commit);
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(counter.calls, 2);
    }

    #[tokio::test]
    async fn test_create_work_branch_rejects_foreign_local_branch() {
        let (_dir, repo_path) = create_temp_repo();
        let base = git_ops::resolve_base_commit(&repo_path, "main").unwrap();
        git_ops::checkout_work_branch(&repo_path, "fix/ai-heal/42-abc", &base).unwrap();
        commit_test_file(&repo_path, "notes.txt", "mine\n", "hand-written change");
        git_ops::checkout_branch(&repo_path, "main").unwrap();

        let m = mutator(&repo_path, StubPusher::default(), StubHosting::default());
        let err = m
            .create_work_branch("main", "fix/ai-heal/42-abc", &mut StageCounter::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MutationError::BranchExists(BranchExistsError {
                branch: "fix/ai-heal/42-abc".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_create_work_branch_checks_remote_ownership() {
        let (_dir, repo_path) = create_temp_repo();
        let hosting = StubHosting::default();
        hosting.remote_commits.lock().unwrap().insert(
            "fix/ai-heal/42-owned".to_string(),
            vec![RemoteCommit {
                sha: "a1".to_string(),
                message: git_ops::with_trailers("fix: earlier attempt", "41"),
            }],
        );
        hosting.remote_commits.lock().unwrap().insert(
            "fix/ai-heal/42-foreign".to_string(),
            vec![RemoteCommit {
                sha: "b2".to_string(),
                message: "someone else".to_string(),
            }],
        );
        let m = mutator(&repo_path, StubPusher::default(), hosting);
        let mut counter = StageCounter::default();

        let owned = m
            .create_work_branch("main", "fix/ai-heal/42-owned", &mut counter)
            .await
            .unwrap();
        assert!(owned.reused);

        git_ops::checkout_branch(&repo_path, "main").unwrap();
        let err = m
            .create_work_branch("main", "fix/ai-heal/42-foreign", &mut counter)
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::BranchExists(_)));
    }

    #[tokio::test]
    async fn test_apply_patch_commits_with_trailers() {
        let (_dir, repo_path) = create_temp_repo();
        commit_test_file(&repo_path, "calc.py", "def add(a, b):\n    return a + b\n", "add calc");
        let m = mutator(&repo_path, StubPusher::default(), StubHosting::default());
        let handle = m
            .create_work_branch("main", "fix/ai-heal/42-calc", &mut StageCounter::default())
            .await
            .unwrap();

        let original = "def add(a, b):\n    return a + b\n";
        let proposal = replacement("calc.py", "def add(a, b):\n    return b + a", Some(original));
        let reference = m.apply_patch(&handle, &proposal).unwrap();

        assert_eq!(reference.branch, "fix/ai-heal/42-calc");
        assert_eq!(reference.path, PathBuf::from("calc.py"));
        let content = std::fs::read_to_string(repo_path.join("calc.py")).unwrap();
        assert_eq!(content, "def add(a, b):\n    return b + a\n");

        let repo = git2::Repository::open(&repo_path).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        let message = head.message().unwrap();
        assert!(message.starts_with("fix: Expected value was wrong."));
        assert!(git_ops::has_ownership_trailer(message));
        assert!(message.contains("Remediation-Run: 42"));
    }

    #[test]
    fn test_roll_back_file_restores_tree_and_index() {
        let (_dir, repo_path) = create_temp_repo();
        commit_test_file(&repo_path, "calc.py", "x = 2\n", "add calc");
        let m = mutator(&repo_path, StubPusher::default(), StubHosting::default());

        std::fs::write(repo_path.join("calc.py"), "x = 3\n").unwrap();
        std::fs::write(repo_path.join("extra.py"), "y = 1\n").unwrap();
        git_ops::stage_file(&repo_path, Path::new("calc.py")).unwrap();
        git_ops::stage_file(&repo_path, Path::new("extra.py")).unwrap();

        let calc = resolve_repo_path_allow_new(&repo_path, Path::new("calc.py")).unwrap();
        let extra = resolve_repo_path_allow_new(&repo_path, Path::new("extra.py")).unwrap();
        m.roll_back_file(&calc, Some("x = 2\n"));
        m.roll_back_file(&extra, None);

        assert_eq!(std::fs::read_to_string(repo_path.join("calc.py")).unwrap(), "x = 2\n");
        assert!(!repo_path.join("extra.py").exists());
        let repo = git2::Repository::open(&repo_path).unwrap();
        let statuses = repo.statuses(None).unwrap();
        assert!(statuses.is_empty(), "{} entries left dirty", statuses.len());
    }

    #[tokio::test]
    async fn test_apply_patch_rejects_stale_proposal_without_writing() {
        let (_dir, repo_path) = create_temp_repo();
        commit_test_file(&repo_path, "calc.py", "x = 2\n", "add calc");
        let m = mutator(&repo_path, StubPusher::default(), StubHosting::default());
        let handle = m
            .create_work_branch("main", "fix/ai-heal/42-stale", &mut StageCounter::default())
            .await
            .unwrap();

        let proposal = replacement("calc.py", "x = 3\n", Some("x = 1\n"));
        let err = m.apply_patch(&handle, &proposal).unwrap_err();
        assert!(matches!(
            err,
            MutationError::PatchApply(PatchApplyError::Stale { .. })
        ));
        assert_eq!(std::fs::read_to_string(repo_path.join("calc.py")).unwrap(), "x = 2\n");
    }

    #[tokio::test]
    async fn test_apply_patch_rejects_escaping_path() {
        let (_dir, repo_path) = create_temp_repo();
        let m = mutator(&repo_path, StubPusher::default(), StubHosting::default());
        let handle = m
            .create_work_branch("main", "fix/ai-heal/42-esc", &mut StageCounter::default())
            .await
            .unwrap();
        let err = m
            .apply_patch(&handle, &replacement("../outside.py", "x = 1\n", None))
            .unwrap_err();
        assert!(matches!(
            err,
            MutationError::PatchApply(PatchApplyError::UnsafePath(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_creates_then_updates_review_request() {
        let (_dir, repo_path) = create_temp_repo();
        let pushes = Arc::new(AtomicU32::new(0));
        let pusher = StubPusher {
            failure: None,
            calls: pushes.clone(),
        };
        let m = mutator(&repo_path, pusher, StubHosting::default());
        let mut counter = StageCounter::default();
        let handle = m
            .create_work_branch("main", "fix/ai-heal/42-pub", &mut counter)
            .await
            .unwrap();
        let draft = ReviewRequestDraft {
            title: "Automated fix".to_string(),
            body: "body".to_string(),
        };

        let first = m.publish(&handle, &draft, &mut counter).await.unwrap();
        assert!(!first.updated_existing);
        assert_eq!(first.url, "https://github.test/acme/widgets/pull/1");

        let second = m.publish(&handle, &draft, &mut counter).await.unwrap();
        assert!(second.updated_existing);
        assert_eq!(second.number, first.number);
        assert_eq!(pushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_exhausts_retry_budget_on_network_failure() {
        let (_dir, repo_path) = create_temp_repo();
        let pushes = Arc::new(AtomicU32::new(0));
        let pusher = StubPusher {
            failure: Some(PushError::Network("connection reset".to_string())),
            calls: pushes.clone(),
        };
        let m = mutator(&repo_path, pusher, StubHosting::default());
        let handle = m
            .create_work_branch("main", "fix/ai-heal/42-net", &mut StageCounter::default())
            .await
            .unwrap();

        let mut counter = StageCounter::default();
        let err = m
            .publish(
                &handle,
                &ReviewRequestDraft {
                    title: "t".to_string(),
                    body: "b".to_string(),
                },
                &mut counter,
            )
            .await
            .unwrap_err();
        match err {
            MutationError::RemoteUnavailable(remote) => {
                assert_eq!(remote.operation, "push");
                assert_eq!(remote.attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(pushes.load(Ordering::SeqCst), 3);
        assert_eq!(counter.calls, 3);
        assert_eq!(counter.retries, 2);
    }

    #[tokio::test]
    async fn test_publish_disabled_push_fails_fast() {
        let (_dir, repo_path) = create_temp_repo();
        let pusher = StubPusher {
            failure: Some(PushError::Disabled),
            calls: Arc::default(),
        };
        let m = mutator(&repo_path, pusher, StubHosting::default());
        let handle = m
            .create_work_branch("main", "fix/ai-heal/42-off", &mut StageCounter::default())
            .await
            .unwrap();
        let mut counter = StageCounter::default();
        let err = m
            .publish(
                &handle,
                &ReviewRequestDraft {
                    title: "t".to_string(),
                    body: "b".to_string(),
                },
                &mut counter,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::RemoteUnavailable(_)));
        assert_eq!(counter.calls, 1);
        assert_eq!(counter.retries, 0);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_stale_branches_without_review() {
        let (_dir, repo_path) = create_temp_repo();
        let hosting = StubHosting::default();
        let old = Utc::now() - chrono::Duration::days(30);
        let recent = Utc::now() - chrono::Duration::days(1);
        *hosting.branches.lock().unwrap() = vec![
            RemoteBranch {
                name: "fix/ai-heal/1-old".to_string(),
                head_sha: "a".to_string(),
                committed_at: Some(old),
            },
            RemoteBranch {
                name: "fix/ai-heal/2-reviewed".to_string(),
                head_sha: "b".to_string(),
                committed_at: Some(old),
            },
            RemoteBranch {
                name: "fix/ai-heal/3-new".to_string(),
                head_sha: "c".to_string(),
                committed_at: Some(recent),
            },
        ];
        hosting.open.lock().unwrap().insert(
            "fix/ai-heal/2-reviewed".to_string(),
            PullRequestInfo {
                number: 9,
                url: "https://github.test/acme/widgets/pull/9".to_string(),
            },
        );
        let deleted = hosting.deleted.clone();
        let m = mutator(&repo_path, StubPusher::default(), hosting);

        let report = m
            .cleanup_stale_branches(
                Duration::from_secs(14 * 24 * 60 * 60),
                &mut StageCounter::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.deleted, vec!["fix/ai-heal/1-old".to_string()]);
        assert_eq!(
            report.kept,
            vec![
                "fix/ai-heal/2-reviewed".to_string(),
                "fix/ai-heal/3-new".to_string()
            ]
        );
        assert_eq!(*deleted.lock().unwrap(), vec!["fix/ai-heal/1-old".to_string()]);
    }

    #[test]
    fn test_read_source_accepts_absolute_paths_inside_checkout() {
        let (_dir, repo_path) = create_temp_repo();
        let m = mutator(&repo_path, StubPusher::default(), StubHosting::default());
        let absolute = repo_path.canonicalize().unwrap().join("README.md");
        let source = m.read_source(&absolute).unwrap().unwrap();
        assert_eq!(source.path, PathBuf::from("README.md"));
        assert_eq!(source.content, "# demo\n");
        assert!(m.read_source(Path::new("/etc/hostname")).unwrap().is_none());
        assert!(m.read_source(Path::new("missing.py")).unwrap().is_none());
    }
}
