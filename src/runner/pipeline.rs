use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::types::SandboxConfig;
use crate::error::{PyletError, Result};
use crate::output::OutputLog;
use crate::platform::{grant_access, AccessMode, HostPlatform, MountRole};
use crate::runner::placeholders::{self, TEXT_INPUT_VAR};
use crate::runner::requirements::parse_requirements;
use crate::sandbox::Sandbox;
use crate::session::{MountBinding, SessionContext};

/// Immutable snapshot of a run's inputs, taken when the run starts.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub script: String,
    pub requirements: String,
    pub text_input: Option<String>,
}

impl RunRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            requirements: String::new(),
            text_input: None,
        }
    }

    pub fn with_requirements(mut self, requirements: impl Into<String>) -> Self {
        self.requirements = requirements.into();
        self
    }

    pub fn with_text_input(mut self, text_input: impl Into<String>) -> Self {
        self.text_input = Some(text_input.into());
        self
    }
}

/// Terminal result of one run. Exactly one outcome exists per run.
#[derive(Debug)]
pub struct RunOutcome {
    succeeded: bool,
    error: Option<PyletError>,
}

impl RunOutcome {
    fn success() -> Self {
        Self {
            succeeded: true,
            error: None,
        }
    }

    fn failure(error: PyletError) -> Self {
        Self {
            succeeded: false,
            error: Some(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn error(&self) -> Option<&PyletError> {
        self.error.as_ref()
    }

    pub fn into_error(self) -> Option<PyletError> {
        self.error
    }
}

/// Pipeline state, readable while a run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    InstallingDeps,
    AcquiringInputMount,
    AcquiringOutputMount,
    InjectingEnv,
    Executing,
    Syncing,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::InstallingDeps => "installing-deps",
            Self::AcquiringInputMount => "acquiring-input-mount",
            Self::AcquiringOutputMount => "acquiring-output-mount",
            Self::InjectingEnv => "injecting-env",
            Self::Executing => "executing",
            Self::Syncing => "syncing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// The run orchestrator.
///
/// Owns the session-scoped state shared by every run: the sandbox, the
/// platform, the mount bindings, and the output log. One run executes at a
/// time; a second invocation while a run is in flight is rejected with
/// `RunInFlight`. Bound mounts and installed packages persist across runs
/// for the lifetime of the runner.
pub struct Runner {
    sandbox: Arc<dyn Sandbox>,
    platform: Arc<dyn HostPlatform>,
    session: Mutex<SessionContext>,
    output: OutputLog,
    state: Mutex<RunState>,
    last_error: Mutex<Option<String>>,
    in_flight: AtomicBool,
    echo_output: bool,
    input_mount: String,
    output_mount: String,
}

impl Runner {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        platform: Arc<dyn HostPlatform>,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            sandbox,
            platform,
            session: Mutex::new(SessionContext::new()),
            output: OutputLog::new(),
            state: Mutex::new(RunState::Idle),
            last_error: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            echo_output: false,
            input_mount: config.input_mount.clone(),
            output_mount: config.output_mount.clone(),
        }
    }

    /// Print each output line to stdout as it is appended to the log.
    pub fn echo_output(mut self, enabled: bool) -> Self {
        self.echo_output = enabled;
        self
    }

    pub fn session_id(&self) -> String {
        self.session.lock().expect("session poisoned").id().to_string()
    }

    /// Shared handle to the session's output log.
    pub fn output(&self) -> OutputLog {
        self.output.clone()
    }

    /// Current pipeline state, for display.
    pub fn state(&self) -> RunState {
        *self.state.lock().expect("state poisoned")
    }

    /// Message of the most recent run failure, for display.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last error poisoned").clone()
    }

    /// Execute one run request to its terminal outcome.
    ///
    /// Every pipeline failure is captured into the returned `RunOutcome`;
    /// the `Err` arm is reserved for the re-entrancy boundary violation.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(PyletError::RunInFlight);
        }

        let outcome = match self.run_pipeline(&request).await {
            Ok(()) => {
                self.set_state(RunState::Succeeded);
                *self.last_error.lock().expect("last error poisoned") = None;
                RunOutcome::success()
            }
            Err(error) => {
                self.set_state(RunState::Failed);
                *self.last_error.lock().expect("last error poisoned") = Some(error.to_string());
                RunOutcome::failure(error)
            }
        };

        self.in_flight.store(false, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn run_pipeline(&self, request: &RunRequest) -> Result<()> {
        self.set_state(RunState::Idle);

        // Dependency installation; a no-op transition when the list is empty
        let packages = parse_requirements(&request.requirements);
        if !packages.is_empty() {
            self.set_state(RunState::InstallingDeps);
            for package in &packages {
                info!(package = %package, "Installing requirement");
                self.sandbox.install_package(package).await?;
            }
        }

        let detected = placeholders::detect(&request.script);

        // Mounts are acquired once per session and reused afterwards
        if detected.input_path && !self.is_bound(MountRole::Input) {
            self.set_state(RunState::AcquiringInputMount);
            self.acquire_mount(MountRole::Input).await?;
        }

        if detected.output_path && !self.is_bound(MountRole::Output) {
            self.set_state(RunState::AcquiringOutputMount);
            self.acquire_mount(MountRole::Output).await?;
        }

        // Path placeholders reuse env injected at sandbox creation; only the
        // text value is resolved per run
        if detected.text_input {
            self.set_state(RunState::InjectingEnv);
            let value = match &request.text_input {
                Some(value) => value.clone(),
                None => self.platform.collect_text_input().await?,
            };
            self.sandbox.set_env(TEXT_INPUT_VAR, &value).await?;
        }

        self.set_state(RunState::Executing);
        self.execute_streaming(&request.script).await?;

        let output_binding = self
            .session
            .lock()
            .expect("session poisoned")
            .binding(MountRole::Output)
            .cloned();
        if let Some(binding) = output_binding {
            self.set_state(RunState::Syncing);
            self.sandbox.sync_mount(binding.guest_path()).await?;
        }

        Ok(())
    }

    /// Run the script while a consumer task drains emitted lines into the
    /// output log, so output is visible incrementally rather than only at
    /// the end.
    async fn execute_streaming(&self, script: &str) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let log = self.output.clone();
        let echo = self.echo_output;
        let sink = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if echo {
                    println!("{}", line);
                }
                log.append(line);
            }
        });

        let result = self.sandbox.execute(script, tx).await;

        // The sender is gone once execute returns; wait for the sink to
        // drain so the log is complete before the outcome is decided.
        let _ = sink.await;

        result
    }

    async fn acquire_mount(&self, role: MountRole) -> Result<()> {
        let handle = grant_access(self.platform.as_ref(), role).await?;

        let guest_path = match role {
            MountRole::Input => self.input_mount.clone(),
            MountRole::Output => self.output_mount.clone(),
        };
        let readonly = role.access_mode() == AccessMode::ReadOnly;

        self.sandbox
            .mount_directory(&guest_path, &handle, readonly)
            .await?;

        let binding = MountBinding::new(guest_path, role.access_mode(), handle);
        self.session
            .lock()
            .expect("session poisoned")
            .record_binding(role, binding);

        Ok(())
    }

    fn is_bound(&self, role: MountRole) -> bool {
        self.session.lock().expect("session poisoned").is_bound(role)
    }

    fn set_state(&self, state: RunState) {
        debug!(state = %state, "Pipeline state");
        *self.state.lock().expect("state poisoned") = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::sync::Notify;

    use crate::platform::{AccessDecision, HostDirHandle};
    use crate::sandbox::SandboxInfo;

    /// In-memory sandbox recording every operation in call order.
    #[derive(Default)]
    struct FakeSandbox {
        emit_lines: Vec<String>,
        fail_install_on: Option<String>,
        fail_exec: bool,
        block_exec: Option<Arc<Notify>>,
        events: Mutex<Vec<String>>,
        env: Mutex<Vec<(String, String)>>,
    }

    impl FakeSandbox {
        fn emitting(lines: &[&str]) -> Self {
            Self {
                emit_lines: lines.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn installed(&self) -> Vec<String> {
            self.events()
                .iter()
                .filter_map(|e| e.strip_prefix("install:").map(str::to_string))
                .collect()
        }

        fn count(&self, prefix: &str) -> usize {
            self.events()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn name(&self) -> &str {
            "fake"
        }

        async fn install_package(&self, name: &str) -> Result<()> {
            if self.fail_install_on.as_deref() == Some(name) {
                return Err(PyletError::Install {
                    package: name.to_string(),
                    reason: "unavailable".to_string(),
                });
            }
            self.events.lock().unwrap().push(format!("install:{name}"));
            Ok(())
        }

        async fn mount_directory(
            &self,
            guest_path: &str,
            _handle: &HostDirHandle,
            readonly: bool,
        ) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("mount:{guest_path}:ro={readonly}"));
            Ok(())
        }

        async fn set_env(&self, key: &str, value: &str) -> Result<()> {
            self.env
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string()));
            Ok(())
        }

        async fn execute(&self, _script: &str, output: UnboundedSender<String>) -> Result<()> {
            if let Some(gate) = &self.block_exec {
                gate.notified().await;
            }
            self.events.lock().unwrap().push("exec".to_string());
            for line in &self.emit_lines {
                let _ = output.send(line.clone());
            }
            if self.fail_exec {
                return Err(PyletError::Exec("boom".to_string()));
            }
            Ok(())
        }

        async fn sync_mount(&self, guest_path: &str) -> Result<()> {
            self.events.lock().unwrap().push(format!("sync:{guest_path}"));
            Ok(())
        }

        fn info(&self) -> SandboxInfo {
            SandboxInfo {
                backend_type: "fake".to_string(),
                interpreter: "none".to_string(),
                session_root: "/tmp".to_string(),
            }
        }
    }

    /// Platform that always offers the same directory and decision.
    struct FakePlatform {
        dir: PathBuf,
        decision: AccessDecision,
        prompts: AtomicU32,
        text: Option<String>,
    }

    impl FakePlatform {
        fn granting() -> Self {
            Self {
                dir: PathBuf::from("/host/dir"),
                decision: AccessDecision::Granted,
                prompts: AtomicU32::new(0),
                text: None,
            }
        }

        fn denying() -> Self {
            Self {
                decision: AccessDecision::Denied,
                ..Self::granting()
            }
        }

        fn with_text(mut self, text: &str) -> Self {
            self.text = Some(text.to_string());
            self
        }

        fn prompt_count(&self) -> u32 {
            self.prompts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HostPlatform for FakePlatform {
        async fn prompt_for_directory(&self, _role: MountRole) -> Result<HostDirHandle> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            Ok(HostDirHandle::new(self.dir.clone()))
        }

        async fn request_access(
            &self,
            _handle: &HostDirHandle,
            _mode: AccessMode,
        ) -> Result<AccessDecision> {
            Ok(self.decision)
        }

        async fn collect_text_input(&self) -> Result<String> {
            self.text
                .clone()
                .ok_or_else(|| PyletError::Input("no text configured".to_string()))
        }
    }

    fn runner(sandbox: Arc<FakeSandbox>, platform: Arc<FakePlatform>) -> Runner {
        Runner::new(sandbox, platform, &SandboxConfig::default())
    }

    #[tokio::test]
    async fn simple_script_succeeds_and_streams_output() {
        let sandbox = Arc::new(FakeSandbox::emitting(&["hi"]));
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform);

        let outcome = runner.run(RunRequest::new("print(\"hi\")")).await.unwrap();

        assert!(outcome.succeeded());
        assert!(outcome.error().is_none());
        assert_eq!(runner.output().snapshot(), vec!["hi"]);
        assert_eq!(runner.state(), RunState::Succeeded);
        assert!(runner.last_error().is_none());
    }

    #[tokio::test]
    async fn comment_only_requirements_install_nothing() {
        let sandbox = Arc::new(FakeSandbox::default());
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform);

        let request = RunRequest::new("pass").with_requirements("# one\n\n   \n# two");
        let outcome = runner.run(request).await.unwrap();

        assert!(outcome.succeeded());
        assert!(sandbox.installed().is_empty());
    }

    #[tokio::test]
    async fn packages_install_in_listed_order() {
        let sandbox = Arc::new(FakeSandbox::default());
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform);

        let request = RunRequest::new("pass").with_requirements("alpha\n# c\nbeta\n\ngamma");
        runner.run(request).await.unwrap();

        assert_eq!(sandbox.installed(), vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn failed_install_aborts_before_execution() {
        let sandbox = Arc::new(FakeSandbox {
            fail_install_on: Some("numpy".to_string()),
            ..FakeSandbox::default()
        });
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform);
        let log_before = runner.output().snapshot();

        let request = RunRequest::new("print('x')").with_requirements("# comment\n\nnumpy");
        let outcome = runner.run(request).await.unwrap();

        assert!(!outcome.succeeded());
        assert!(matches!(
            outcome.error(),
            Some(PyletError::Install { package, .. }) if package == "numpy"
        ));
        assert_eq!(sandbox.count("exec"), 0);
        assert_eq!(runner.output().snapshot(), log_before);
        assert_eq!(runner.state(), RunState::Failed);
    }

    #[tokio::test]
    async fn earlier_installs_are_not_rolled_back() {
        let sandbox = Arc::new(FakeSandbox {
            fail_install_on: Some("numpy".to_string()),
            ..FakeSandbox::default()
        });
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform);

        let request = RunRequest::new("pass").with_requirements("alpha\nnumpy\nbeta");
        let outcome = runner.run(request).await.unwrap();

        assert!(!outcome.succeeded());
        assert_eq!(sandbox.installed(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn denied_output_grant_fails_without_execution() {
        let sandbox = Arc::new(FakeSandbox::default());
        let platform = Arc::new(FakePlatform::denying());
        let runner = runner(sandbox.clone(), platform);

        let request = RunRequest::new("open(OUTPUT_PATH)");
        let outcome = runner.run(request).await.unwrap();

        assert!(!outcome.succeeded());
        assert!(matches!(
            outcome.error(),
            Some(PyletError::PermissionDenied {
                mode: AccessMode::ReadWrite
            })
        ));
        assert_eq!(sandbox.count("exec"), 0);
        assert_eq!(sandbox.count("mount"), 0);
    }

    #[tokio::test]
    async fn output_mount_syncs_once_after_execution() {
        let sandbox = Arc::new(FakeSandbox::emitting(&["done"]));
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform);

        let request = RunRequest::new("os.environ['OUTPUT_PATH']");
        let outcome = runner.run(request).await.unwrap();

        assert!(outcome.succeeded());
        let events = sandbox.events();
        assert_eq!(
            events,
            vec!["mount:/data/output:ro=false", "exec", "sync:/data/output"]
        );
    }

    #[tokio::test]
    async fn second_run_reuses_the_output_binding() {
        let sandbox = Arc::new(FakeSandbox::default());
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform.clone());

        let script = "os.environ['OUTPUT_PATH']";
        runner.run(RunRequest::new(script)).await.unwrap();
        runner.run(RunRequest::new(script)).await.unwrap();

        assert_eq!(platform.prompt_count(), 1);
        assert_eq!(sandbox.count("mount"), 1);
        // Each run still syncs its own writes
        assert_eq!(sandbox.count("sync"), 2);
    }

    #[tokio::test]
    async fn input_mount_is_read_only() {
        let sandbox = Arc::new(FakeSandbox::default());
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform);

        runner
            .run(RunRequest::new("os.environ['INPUT_PATH']"))
            .await
            .unwrap();

        assert_eq!(
            sandbox.events(),
            vec!["mount:/data/input:ro=true", "exec"]
        );
    }

    #[tokio::test]
    async fn text_input_from_request_is_injected() {
        let sandbox = Arc::new(FakeSandbox::default());
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform);

        let request = RunRequest::new("os.environ['TEXT_INPUT']").with_text_input("hello");
        runner.run(request).await.unwrap();

        assert_eq!(
            sandbox.env.lock().unwrap().clone(),
            vec![("TEXT_INPUT".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn text_input_falls_back_to_the_platform_prompt() {
        let sandbox = Arc::new(FakeSandbox::default());
        let platform = Arc::new(FakePlatform::granting().with_text("from-prompt"));
        let runner = runner(sandbox.clone(), platform);

        runner
            .run(RunRequest::new("os.environ['TEXT_INPUT']"))
            .await
            .unwrap();

        assert_eq!(
            sandbox.env.lock().unwrap().clone(),
            vec![("TEXT_INPUT".to_string(), "from-prompt".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_run_keeps_the_binding_for_retry() {
        let sandbox = Arc::new(FakeSandbox {
            fail_exec: true,
            ..FakeSandbox::default()
        });
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox.clone(), platform.clone());

        let script = "os.environ['OUTPUT_PATH']";
        let outcome = runner.run(RunRequest::new(script)).await.unwrap();
        assert!(!outcome.succeeded());
        assert!(matches!(outcome.error(), Some(PyletError::Exec(_))));

        // Retry prompts no second time; the mount stayed bound
        let _ = runner.run(RunRequest::new(script)).await.unwrap();
        assert_eq!(platform.prompt_count(), 1);
        assert_eq!(sandbox.count("mount"), 1);
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected_at_the_boundary() {
        let gate = Arc::new(Notify::new());
        let sandbox = Arc::new(FakeSandbox {
            block_exec: Some(gate.clone()),
            ..FakeSandbox::default()
        });
        let platform = Arc::new(FakePlatform::granting());
        let runner = Arc::new(runner(sandbox, platform));

        let background = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(RunRequest::new("pass")).await })
        };

        // Wait until the first run reaches the blocked execution stage
        while runner.state() != RunState::Executing {
            tokio::task::yield_now().await;
        }

        let err = runner.run(RunRequest::new("pass")).await.unwrap_err();
        assert!(matches!(err, PyletError::RunInFlight));

        gate.notify_one();
        let outcome = background.await.unwrap().unwrap();
        assert!(outcome.succeeded());
    }

    #[tokio::test]
    async fn output_accumulates_across_runs() {
        let sandbox = Arc::new(FakeSandbox::emitting(&["line"]));
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox, platform);

        runner.run(RunRequest::new("pass")).await.unwrap();
        runner.run(RunRequest::new("pass")).await.unwrap();

        assert_eq!(runner.output().snapshot(), vec!["line", "line"]);
    }

    #[tokio::test]
    async fn emitted_lines_keep_their_order() {
        let sandbox = Arc::new(FakeSandbox::emitting(&["one", "two", "three", "four"]));
        let platform = Arc::new(FakePlatform::granting());
        let runner = runner(sandbox, platform);

        runner.run(RunRequest::new("pass")).await.unwrap();

        assert_eq!(
            runner.output().snapshot(),
            vec!["one", "two", "three", "four"]
        );
    }
}
