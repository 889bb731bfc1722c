// Scripted sandbox backend for unit tests

use crate::error::SandboxError;
use crate::languages::LanguageProfile;
use crate::sandbox::{CompileOutput, ResourceLimits, RunOutput, SandboxBackend, Workspace};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Arc<dyn Fn(&str, &ResourceLimits) -> Result<RunOutput, SandboxError> + Send + Sync>;

/// In-memory backend whose behaviour is set up by each test.
pub(crate) struct FakeSandbox {
    available: AtomicBool,
    panic_on_run: AtomicBool,
    compile_result: Mutex<CompileOutput>,
    run_delay: Mutex<Duration>,
    responder: Mutex<Responder>,

    pub pings: AtomicUsize,
    pub compiles: AtomicUsize,
    pub runs: AtomicUsize,
    pub workspaces_created: AtomicUsize,
    pub workspaces_destroyed: AtomicUsize,
    active_workspaces: AtomicUsize,
    pub max_active_workspaces: AtomicUsize,
}

impl FakeSandbox {
    /// Healthy backend that echoes stdin back as stdout.
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            panic_on_run: AtomicBool::new(false),
            compile_result: Mutex::new(CompileOutput::Success),
            run_delay: Mutex::new(Duration::ZERO),
            responder: Mutex::new(Arc::new(|stdin, _| Ok(RunOutput::exited(stdin, 0, 10, 1024)))),
            pings: AtomicUsize::new(0),
            compiles: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            workspaces_created: AtomicUsize::new(0),
            workspaces_destroyed: AtomicUsize::new(0),
            active_workspaces: AtomicUsize::new(0),
            max_active_workspaces: AtomicUsize::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_compile_result(&self, result: CompileOutput) {
        *self.compile_result.lock().unwrap() = result;
    }

    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock().unwrap() = delay;
    }

    pub fn set_panic_on_run(&self, panic: bool) {
        self.panic_on_run.store(panic, Ordering::SeqCst);
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &ResourceLimits) -> Result<RunOutput, SandboxError> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Arc::new(responder);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), SandboxError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SandboxError::Unavailable("fake backend is down".to_string()))
        }
    }
}

#[async_trait]
impl SandboxBackend for FakeSandbox {
    async fn ping(&self) -> Result<(), SandboxError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }

    async fn create_workspace(&self, tag: &str) -> Result<Workspace, SandboxError> {
        self.check_available()?;
        let n = self.workspaces_created.fetch_add(1, Ordering::SeqCst);
        let active = self.active_workspaces.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_workspaces.fetch_max(active, Ordering::SeqCst);
        Ok(Workspace {
            id: format!("fake-{}-{}", tag, n),
        })
    }

    async fn compile(
        &self,
        _workspace: &Workspace,
        _profile: &LanguageProfile,
        _source_code: &str,
        _limits: &ResourceLimits,
    ) -> Result<CompileOutput, SandboxError> {
        self.check_available()?;
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(self.compile_result.lock().unwrap().clone())
    }

    async fn run(
        &self,
        _workspace: &Workspace,
        _profile: &LanguageProfile,
        stdin: &str,
        limits: &ResourceLimits,
    ) -> Result<RunOutput, SandboxError> {
        self.check_available()?;
        self.runs.fetch_add(1, Ordering::SeqCst);

        let delay = *self.run_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_run.load(Ordering::SeqCst) {
            panic!("fake backend crashed");
        }

        let responder = self.responder.lock().unwrap().clone();
        responder(stdin, limits)
    }

    async fn destroy_workspace(&self, _workspace: &Workspace) -> Result<(), SandboxError> {
        self.workspaces_destroyed.fetch_add(1, Ordering::SeqCst);
        self.active_workspaces.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
