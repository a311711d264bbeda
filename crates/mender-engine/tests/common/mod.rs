#![allow(dead_code)]

use async_trait::async_trait;
use mender_adapters::{
    BranchExistsError, BranchHandle, CleanupReport, CommitReference, MutationError,
    RemoteUnavailableError, RepositoryMutator, ReviewRequestDraft, ReviewRequestReference,
    SourceFile,
};
use mender_core::{patch, BackoffPolicy, FixProposal, StageCounter};
use mender_engine::{
    OrchestratorSettings, ReasoningClient, ReasoningRequest, ReasoningService, ServiceError,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ADD_NUMBERS_LOG: &str = "\
============================= test session starts ==============================
collected 1 item

tests/test_calc.py::test_add_numbers FAILED                               [100%]

=================================== FAILURES ===================================
_______________________________ test_add_numbers _______________________________

    def test_add_numbers():
>       assert add(2, 2) == 5
E       assert 4 == 5
E        +  where 4 = add(2, 2)

tests/test_calc.py:5: AssertionError
=========================== short test summary info ============================
FAILED tests/test_calc.py::test_add_numbers - assert 4 == 5
============================== 1 failed in 0.03s ===============================
";

pub const CALC_TEST: &str = "from calc import add\n\n\ndef test_add_numbers():\n    assert add(2, 2) == 5\n";

pub const FLAKY_LOG: &str = "\
============================= test session starts ==============================
collected 1 item

tests/test_net.py::test_intermittent FAILED                               [100%]

=================================== FAILURES ===================================
______________________________ test_intermittent _______________________________

    def test_intermittent():
>       assert fetch_status() == 200
E       assert 503 == 200

tests/test_net.py:5: AssertionError
=========================== short test summary info ============================
FAILED tests/test_net.py::test_intermittent - assert 503 == 200
Re-running failed tests (attempt 2/2)
tests/test_net.py::test_intermittent PASSED                               [100%]
============================== 1 passed in 0.12s ===============================
";

pub const NET_TEST: &str = "from net import fetch_status\n\n\ndef test_intermittent():\n    assert fetch_status() == 200\n";

/// Diff that turns the expectation in `CALC_TEST` into 4.
pub fn add_numbers_fix() -> String {
    serde_json::json!({
        "file": "tests/test_calc.py",
        "format": "diff",
        "patch": "--- a/tests/test_calc.py\n+++ b/tests/test_calc.py\n@@ -4,2 +4,2 @@\n def test_add_numbers():\n-    assert add(2, 2) == 5\n+    assert add(2, 2) == 4\n",
        "rationale": "add(2, 2) returns 4; the test expected 5, which is wrong.",
    })
    .to_string()
}

/// Reasoning service that plays back a script, then repeats its fallback.
pub struct ScriptedService {
    script: Mutex<Vec<Result<String, ServiceError>>>,
    fallback: Result<String, ServiceError>,
    pub calls: Arc<AtomicU32>,
}

impl ScriptedService {
    pub fn new(
        mut script: Vec<Result<String, ServiceError>>,
        fallback: Result<String, ServiceError>,
    ) -> Self {
        script.reverse();
        Self {
            script: Mutex::new(script),
            fallback,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn always(response: Result<String, ServiceError>) -> Self {
        Self::new(Vec::new(), response)
    }
}

#[async_trait]
impl ReasoningService for ScriptedService {
    async fn complete(&self, _request: &ReasoningRequest) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// A client over `service` with zero backoff; returns the call counter too.
pub fn client(service: ScriptedService, attempts: u32) -> (ReasoningClient, Arc<AtomicU32>) {
    let calls = Arc::clone(&service.calls);
    let client = ReasoningClient::new(Box::new(service), BackoffPolicy::immediate(attempts), 1024);
    (client, calls)
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        run_id: "run-1".to_string(),
        base_branch: "main".to_string(),
        branch_prefix: "fix/ai-heal".to_string(),
        max_context_chars: 12_000,
        model: "gpt-4o".to_string(),
    }
}

#[derive(Default)]
pub struct MemoryState {
    pub files: HashMap<PathBuf, String>,
    /// Content the base branch has for a file, swapped in on branch creation.
    pub base_drift: HashMap<PathBuf, String>,
    pub branches: Vec<String>,
    pub commits: Vec<(PathBuf, String)>,
    pub published: Vec<ReviewRequestDraft>,
}

/// In-memory repository mutator for orchestrator scenarios.
#[derive(Default)]
pub struct MemoryMutator {
    pub state: Mutex<MemoryState>,
    pub foreign_branch: bool,
    pub publish_failure: Option<MutationError>,
}

impl MemoryMutator {
    pub fn with_file(path: &str, content: &str) -> Self {
        let mutator = Self::default();
        mutator
            .state
            .lock()
            .unwrap()
            .files
            .insert(PathBuf::from(path), content.to_string());
        mutator
    }

    pub fn drift(self, path: &str, content: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .base_drift
            .insert(PathBuf::from(path), content.to_string());
        self
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(Path::new(path)).cloned()
    }
}

#[async_trait]
impl RepositoryMutator for MemoryMutator {
    fn read_source(&self, path: &Path) -> Result<Option<SourceFile>, MutationError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|content| SourceFile {
                path: path.to_path_buf(),
                content: content.clone(),
            }))
    }

    async fn create_work_branch(
        &self,
        base_branch: &str,
        name: &str,
        counter: &mut StageCounter,
    ) -> Result<BranchHandle, MutationError> {
        counter.calls += 1;
        if self.foreign_branch {
            return Err(BranchExistsError {
                branch: name.to_string(),
            }
            .into());
        }
        let mut state = self.state.lock().unwrap();
        let drift: Vec<(PathBuf, String)> = state.base_drift.drain().collect();
        state.files.extend(drift);
        let reused = state.branches.iter().any(|b| b == name);
        if !reused {
            state.branches.push(name.to_string());
        }
        Ok(BranchHandle {
            name: name.to_string(),
            base_branch: base_branch.to_string(),
            base_commit: "0".repeat(40),
            reused,
        })
    }

    fn apply_patch(
        &self,
        handle: &BranchHandle,
        proposal: &FixProposal,
    ) -> Result<CommitReference, MutationError> {
        let mut state = self.state.lock().unwrap();
        let current = state.files.get(&proposal.target_file).cloned();
        let updated = patch::apply(current.as_deref(), proposal)?;
        state
            .files
            .insert(proposal.target_file.clone(), updated.clone());
        state.commits.push((proposal.target_file.clone(), updated));
        Ok(CommitReference {
            id: format!("{:07x}", state.commits.len()),
            branch: handle.name.clone(),
            path: proposal.target_file.clone(),
        })
    }

    async fn publish(
        &self,
        handle: &BranchHandle,
        draft: &ReviewRequestDraft,
        counter: &mut StageCounter,
    ) -> Result<ReviewRequestReference, MutationError> {
        if let Some(err) = &self.publish_failure {
            counter.calls += 3;
            counter.retries += 2;
            return Err(err.clone());
        }
        counter.calls += 2;
        let mut state = self.state.lock().unwrap();
        state.published.push(draft.clone());
        Ok(ReviewRequestReference {
            number: state.published.len() as u64,
            url: format!(
                "https://github.test/acme/app/pull/{}?head={}",
                state.published.len(),
                handle.name
            ),
            updated_existing: false,
        })
    }

    async fn cleanup_stale_branches(
        &self,
        _older_than: Duration,
        _counter: &mut StageCounter,
    ) -> Result<CleanupReport, MutationError> {
        Ok(CleanupReport::default())
    }
}

pub fn push_unavailable() -> MutationError {
    RemoteUnavailableError {
        operation: "push".to_string(),
        attempts: 3,
        detail: "connection reset".to_string(),
    }
    .into()
}
