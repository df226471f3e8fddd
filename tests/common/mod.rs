// Shared helpers for integration tests.
//
// Provides a temporary-directory-backed machine fixture (home directory,
// template file, artifact root) and a scripted executor so each integration
// test can drive the orchestrator without touching real commands.
//
// Used by all integration test binaries that declare `mod common;`.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use statepack_cli::context::Operation;
use statepack_cli::error::ResourceError;
use statepack_cli::exec::{ExecResult, Executor};
use statepack_cli::facts::{MachineFacts, OsFamily};
use statepack_cli::orchestrator::{InvokeRequest, Orchestrator};
use statepack_cli::state::registry::MemoryKeyStore;

/// Scripted executor for integration tests.
///
/// Responses are consumed in FIFO order; when the queue is empty every call
/// fails, so unscripted command traffic shows up in assertions. All issued
/// command lines are recorded.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    responses: Mutex<VecDeque<(bool, String)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    /// An executor that answers every queued call in order.
    pub fn with_responses(responses: Vec<(bool, String)>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// An executor whose every call succeeds with the given stdout.
    pub fn always(stdout: &str) -> Self {
        let executor = Self::default();
        *executor
            .responses
            .lock()
            .expect("executor mutex") = std::iter::repeat_n((true, stdout.to_string()), 64).collect();
        executor
    }

    /// Every command line issued so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("executor mutex").clone()
    }

    fn next(&self, command: &str) -> Result<ExecResult, ResourceError> {
        self.calls
            .lock()
            .expect("executor mutex")
            .push(command.to_string());
        match self.responses.lock().expect("executor mutex").pop_front() {
            Some((success, stdout)) => Ok(ExecResult {
                stdout,
                stderr: String::new(),
                success,
                code: Some(i32::from(!success)),
            }),
            None => Err(ResourceError::CommandFailed {
                command: command.to_string(),
                code: Some(1),
                stderr: "unexpected executor call".to_string(),
            }),
        }
    }
}

impl Executor for ScriptedExecutor {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> Result<ExecResult, ResourceError> {
        self.next(&format!("{program} {}", args.join(" ")))
    }

    fn run_shell(&self, command: &str, _timeout: Duration) -> Result<ExecResult, ResourceError> {
        self.next(command)
    }

    fn run_shell_with_stdin(
        &self,
        command: &str,
        _stdin: &str,
        _timeout: Duration,
    ) -> Result<ExecResult, ResourceError> {
        self.next(command)
    }

    fn which(&self, _program: &str) -> bool {
        true
    }
}

/// An isolated machine fixture backed by a [`tempfile::TempDir`].
pub struct TestMachine {
    /// Root temporary directory; removed on drop.
    pub dir: tempfile::TempDir,
    /// Simulated home directory.
    pub home: PathBuf,
    /// Root for per-run artifact directories.
    pub artifacts: PathBuf,
    /// In-memory key-value store shared by every orchestrator built here.
    pub key_store: Arc<MemoryKeyStore>,
}

impl TestMachine {
    /// Create a fixture with empty home and artifact directories.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let home = dir.path().join("home");
        let artifacts = dir.path().join("artifacts");
        std::fs::create_dir_all(&home).expect("create home");
        Self {
            dir,
            home,
            artifacts,
            key_store: Arc::new(MemoryKeyStore::default()),
        }
    }

    /// Write a file under the simulated home, creating parents.
    pub fn write_home(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.home.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parents");
        }
        std::fs::write(&path, content).expect("write file");
        path
    }

    /// Write the template document and return its path.
    pub fn write_template(&self, content: &str) -> PathBuf {
        let path = self.dir.path().join("statepack.toml");
        std::fs::write(&path, content).expect("write template");
        path
    }

    /// Write an override template under `machines/` and return its path.
    pub fn write_override(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join("machines").join(name);
        std::fs::create_dir_all(path.parent().expect("machines dir")).expect("create machines");
        std::fs::write(&path, content).expect("write override");
        path
    }

    /// The artifact directory for a run id.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.artifacts.join(run_id)
    }

    /// Build an orchestrator over this fixture's key store and the given
    /// executor, with facts `hostname = "it-host"`, `os = linux`.
    pub fn orchestrator(&self, executor: Arc<ScriptedExecutor>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(MachineFacts::new("it-host", OsFamily::Linux)),
            executor,
            Arc::clone(&self.key_store) as Arc<dyn statepack_cli::state::registry::KeyValueStore>,
        )
    }

    /// An [`InvokeRequest`] against this fixture for the given run id.
    pub fn request(&self, template: &Path, operation: Operation, run_id: &str) -> InvokeRequest {
        let mut request = InvokeRequest::new(template, operation, self.run_dir(run_id));
        request.home = self.home.clone();
        request
    }
}
