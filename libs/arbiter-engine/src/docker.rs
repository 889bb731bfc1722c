/// Docker Sandbox - production SandboxBackend on the Docker Engine API
///
/// **Isolation Rules (every container):**
/// 1. Network disabled (`network_mode=none`)
/// 2. Read-only root filesystem; `/tmp` is a size-capped tmpfs
/// 3. Memory ceiling with swap pinned to the same value
/// 4. CPU share (`nano_cpus`), process ceiling (`pids_limit`),
///    file-size ceiling (`RLIMIT_FSIZE`)
/// 5. All capabilities dropped, `no-new-privileges`
///
/// **Workspace Layout:**
/// - One Docker volume per job, mounted at `/box`
/// - The compile container receives the source on stdin, writes it to
///   `/box` and runs the compile command with `/box` writable
/// - Each test case gets a fresh container with `/box` mounted read-only,
///   running as `nobody`
///
/// **Teardown:**
/// Containers and volumes are removed explicitly on every normal path and
/// through drop guards when the owning future is aborted.

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::languages::{LanguageProfile, WORKSPACE_DIR};
use crate::sandbox::{
    check_input_sizes, truncate_utf8, CompileOutput, ResourceLimits, RunOutput, RunStatus,
    SandboxBackend, Workspace, MAX_COMPILE_MESSAGE_BYTES,
};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, ResourcesUlimits};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Label attached to every container and volume of a workspace.
const WORKSPACE_LABEL: &str = "arbiter.workspace";
/// Stderr line the run wrapper emits with cgroup accounting.
const STATS_MARKER: &str = "__arbiter_stats__";
/// Files written while compiling may be larger than program output.
const COMPILE_FILE_SIZE_BYTES: i64 = 256 * 1024 * 1024;
/// How long a timed-out run may spend on its memory sample.
const TIMEOUT_SAMPLE_BUDGET: Duration = Duration::from_millis(100);

/// Map a Docker API failure onto the sandbox taxonomy.
///
/// Client-side rejections (bad request, missing image, conflict) are backend
/// errors; transport failures and daemon-side errors mean the isolated
/// context cannot be created.
fn classify(context: &str, err: bollard::errors::Error) -> SandboxError {
    use bollard::errors::Error;

    match err {
        Error::DockerResponseServerError {
            status_code,
            message,
        } if status_code < 500 => {
            SandboxError::Backend(format!("{}: {} ({})", context, message, status_code))
        }
        Error::DockerContainerWaitError { error, code } => {
            SandboxError::Backend(format!("{}: {} (exit {})", context, error, code))
        }
        other => SandboxError::Unavailable(format!("{}: {}", context, other)),
    }
}

/// Wrap a run command so the container reports its cgroup peak memory and
/// OOM-kill count on stderr before exiting with the program's status.
fn wrap_with_stats(command: &str) -> String {
    format!(
        "{command}\n\
         rc=$?\n\
         peak=$(cat /sys/fs/cgroup/memory.peak 2>/dev/null || cat /sys/fs/cgroup/memory/memory.max_usage_in_bytes 2>/dev/null || echo 0)\n\
         oom=$(sed -n 's/^oom_kill //p' /sys/fs/cgroup/memory.events /sys/fs/cgroup/memory/memory.oom_control 2>/dev/null | head -n 1)\n\
         echo \"{marker} peak=$peak oom=${{oom:-0}}\" >&2\n\
         exit $rc\n",
        command = command,
        marker = STATS_MARKER,
    )
}

/// Script run by the compile container: stage the source from stdin, then
/// compile if the language needs it.
fn compile_script(profile: &LanguageProfile) -> String {
    let stage = format!("cat > {}", profile.source_path());
    let build = match &profile.compile_command {
        Some(cmd) => format!("{} && {}", stage, cmd),
        None => stage,
    };
    format!(
        "cd {dir} && {build}\nrc=$?\nchmod -R a+rX {dir} 2>/dev/null\nexit $rc\n",
        dir = WORKSPACE_DIR,
        build = build,
    )
}

/// Accounting reported by the run wrapper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CgroupStats {
    peak_bytes: u64,
    oom_kills: u64,
}

/// Strip the wrapper's marker lines from stderr and return the last report.
fn extract_stats(stderr: &str) -> (String, Option<CgroupStats>) {
    let mut cleaned = String::with_capacity(stderr.len());
    let mut stats = None;

    for line in stderr.split_inclusive('\n') {
        let Some(rest) = line.trim_end().strip_prefix(STATS_MARKER) else {
            cleaned.push_str(line);
            continue;
        };
        let mut parsed = CgroupStats::default();
        for field in rest.split_whitespace() {
            match field.split_once('=') {
                Some(("peak", v)) => parsed.peak_bytes = v.parse().unwrap_or(0),
                Some(("oom", v)) => parsed.oom_kills = v.parse().unwrap_or(0),
                _ => {}
            }
        }
        stats = Some(parsed);
    }

    (cleaned, stats)
}

/// Container memory ceiling in bytes. Zero would mean unlimited to Docker.
fn memory_bytes(memory_limit_mb: u64) -> Result<i64, SandboxError> {
    i64::try_from(memory_limit_mb)
        .ok()
        .and_then(|mb| mb.checked_mul(1024 * 1024))
        .filter(|bytes| *bytes > 0)
        .ok_or_else(|| {
            SandboxError::Backend(format!(
                "memory limit of {}MB is out of range",
                memory_limit_mb
            ))
        })
}

fn sanitize_tag(tag: &str) -> String {
    let cleaned: String = tag
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

/// Byte buffer that stops growing at `limit` but keeps draining.
struct CappedBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if execution panics or is cancelled
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            armed: true,
        }
    }

    async fn remove(mut self) {
        self.armed = false;
        force_remove(&self.docker, &self.container_id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Best-effort cleanup - cannot be async in Drop
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                force_remove(&docker, &container_id).await;
            });
        } else {
            warn!(container_id = %container_id, "No runtime available to remove container");
        }
    }
}

async fn force_remove(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: false,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(container_id, Some(options)).await {
        warn!(container_id = %container_id, error = %e, "Failed to remove container");
    }
}

/// One container execution request.
struct ContainerSpec<'a> {
    image: &'a str,
    script: String,
    workspace: &'a Workspace,
    workspace_read_only: bool,
    user: Option<&'a str>,
    limits: &'a ResourceLimits,
    max_file_size_bytes: i64,
    stdin: &'a [u8],
    kind: &'static str,
}

/// What came back from one container.
#[derive(Debug, Default)]
struct ContainerRun {
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    timed_out: bool,
    oom_killed: bool,
    elapsed_ms: u64,
    sampled_memory_bytes: Option<u64>,
}

/// Docker-based sandbox for untrusted code
pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerSandbox {
    /// Connect to the Docker daemon described by `config`.
    ///
    /// Connecting is lazy; reachability is established by `ping`.
    pub fn connect(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let timeout = config.docker_timeout_secs;
        let docker = match config.docker_host.as_deref() {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_socket(host, timeout, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults()
                .map(|d| d.with_timeout(Duration::from_secs(timeout))),
        }
        .map_err(|e| SandboxError::Unavailable(format!("Failed to connect to Docker daemon: {}", e)))?;

        Ok(Self {
            docker,
            config: config.clone(),
        })
    }

    /// Pull every profile image that is not cached yet.
    pub async fn prepare_images(&self, profiles: &[std::sync::Arc<LanguageProfile>]) {
        for profile in profiles {
            match self.ensure_image(&profile.base_image).await {
                Ok(()) => debug!(language = %profile.id, image = %profile.base_image, "Image ready"),
                Err(e) => warn!(
                    language = %profile.id,
                    image = %profile.base_image,
                    error = %e,
                    "Image not available"
                ),
            }
        }
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image cache hit: {}", image);
            return Ok(());
        }

        if !self.config.pull_images {
            return Err(SandboxError::Backend(format!(
                "Image '{}' is not present and pulling is disabled",
                image
            )));
        }

        warn!("Image cache miss: {} (pulling now)", image);
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| classify(&format!("Failed to pull image '{}'", image), e))?;
        }

        info!("Image pulled successfully: {}", image);
        Ok(())
    }

    fn host_config(&self, spec: &ContainerSpec<'_>) -> Result<HostConfig, SandboxError> {
        let memory = memory_bytes(spec.limits.memory_limit_mb)?;
        let scratch = format!("rw,nosuid,nodev,size={}m", self.config.scratch_size_mb);

        Ok(HostConfig {
            memory: Some(memory),
            memory_swap: Some(memory),
            nano_cpus: Some((spec.limits.cpu_limit * 1_000_000_000.0) as i64),
            pids_limit: Some(self.config.max_processes),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([("/tmp".to_string(), scratch)])),
            mounts: Some(vec![Mount {
                target: Some(WORKSPACE_DIR.to_string()),
                source: Some(spec.workspace.id.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(spec.workspace_read_only),
                ..Default::default()
            }]),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("fsize".to_string()),
                soft: Some(spec.max_file_size_bytes),
                hard: Some(spec.max_file_size_bytes),
            }]),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        })
    }

    /// Best-effort memory sample for a container that is still running.
    async fn sample_memory(&self, container_id: &str) -> Option<u64> {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: true,
        });
        let mut stream = self.docker.stats(container_id, options);
        match tokio::time::timeout(TIMEOUT_SAMPLE_BUDGET, stream.next()).await {
            Ok(Some(Ok(stats))) => {
                let usage = stats.memory_stats.usage.unwrap_or(0);
                let max_usage = stats.memory_stats.max_usage.unwrap_or(0);
                Some(usage.max(max_usage))
            }
            _ => None,
        }
    }

    /// Create, run and remove one container under a hard wall-clock timeout.
    async fn run_container(&self, spec: ContainerSpec<'_>) -> Result<ContainerRun, SandboxError> {
        self.ensure_image(spec.image).await?;
        let host_config = self.host_config(&spec)?;

        let container_name = format!("arbiter-{}-{}", spec.kind, uuid::Uuid::new_v4());
        let config = Config {
            image: Some(spec.image.to_string()),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), spec.script.clone()]),
            entrypoint: Some(vec![]),
            user: spec.user.map(str::to_string),
            working_dir: Some("/tmp".to_string()),
            env: Some(vec!["HOME=/tmp".to_string(), "LANG=C.UTF-8".to_string()]),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true), // SECURITY: No network access
            labels: Some(HashMap::from([(
                WORKSPACE_LABEL.to_string(),
                spec.workspace.id.clone(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| classify("Failed to create sandbox container", e))?;

        let container_id = container.id.clone();

        // CRITICAL: Set up cleanup guard immediately after container creation
        let guard = ContainerGuard::new(self.docker.clone(), container_id.clone());

        let attach_options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults {
            mut output,
            mut input,
        } = self
            .docker
            .attach_container(&container_id, Some(attach_options))
            .await
            .map_err(|e| classify("Failed to attach to sandbox container", e))?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify("Failed to start sandbox container", e))?;

        let start_time = Instant::now();
        let output_limit = self.config.max_output_bytes;

        let execution = async {
            let feed = async {
                if !spec.stdin.is_empty() {
                    input.write_all(spec.stdin).await?;
                }
                input.shutdown().await
            };

            let collect = async {
                let mut stdout = CappedBuffer::new(output_limit);
                let mut stderr = CappedBuffer::new(output_limit);
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(container_id = %container_id, error = %e, "Error reading container output");
                            break;
                        }
                    }
                }
                (stdout, stderr)
            };

            let (fed, (stdout, stderr)) = tokio::join!(feed, collect);
            if let Err(e) = fed {
                // Programs may exit without consuming all of stdin.
                debug!(container_id = %container_id, error = %e, "Stdin closed early");
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));
            while wait_stream.next().await.is_some() {}

            (stdout, stderr)
        };

        let run = match tokio::time::timeout(
            Duration::from_millis(spec.limits.time_limit_ms),
            execution,
        )
        .await
        {
            Ok((stdout, stderr)) => {
                let elapsed_ms = start_time.elapsed().as_millis() as u64;
                if stdout.truncated {
                    debug!(container_id = %container_id, limit = output_limit, "Stdout truncated");
                }

                let inspect = self
                    .docker
                    .inspect_container(&container_id, None::<InspectContainerOptions>)
                    .await
                    .map_err(|e| classify("Failed to inspect sandbox container", e))?;
                let state = inspect.state.unwrap_or_default();

                ContainerRun {
                    stdout: stdout.into_string(),
                    stderr: stderr.into_string(),
                    exit_code: state.exit_code,
                    timed_out: false,
                    oom_killed: state.oom_killed.unwrap_or(false),
                    elapsed_ms,
                    sampled_memory_bytes: None,
                }
            }
            Err(_) => {
                // TIMEOUT: kill now, sampling memory alongside within a short budget
                let kill = async {
                    if let Err(e) = self
                        .docker
                        .kill_container(&container_id, None::<KillContainerOptions<String>>)
                        .await
                    {
                        warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                    }
                };
                let (sampled_memory_bytes, ()) =
                    tokio::join!(self.sample_memory(&container_id), kill);

                // Removal finishes in the background through the guard.
                drop(guard);
                return Ok(ContainerRun {
                    timed_out: true,
                    elapsed_ms: start_time.elapsed().as_millis() as u64,
                    sampled_memory_bytes,
                    ..Default::default()
                });
            }
        };

        guard.remove().await;
        Ok(run)
    }

    /// Remove every container still attached to a workspace.
    async fn remove_workspace_containers(&self, workspace: &Workspace) {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", WORKSPACE_LABEL, workspace.id)],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        match self.docker.list_containers(Some(options)).await {
            Ok(containers) => {
                for id in containers.into_iter().filter_map(|c| c.id) {
                    force_remove(&self.docker, &id).await;
                }
            }
            Err(e) => {
                warn!(workspace = %workspace.id, error = %e, "Failed to list workspace containers");
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Unavailable(format!("Docker ping failed: {}", e)))
    }

    async fn create_workspace(&self, tag: &str) -> Result<Workspace, SandboxError> {
        let name = format!(
            "arbiter-{}-{}",
            sanitize_tag(tag),
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );

        let options = CreateVolumeOptions {
            name: name.as_str(),
            driver: "local",
            driver_opts: HashMap::new(),
            labels: HashMap::from([(WORKSPACE_LABEL, name.as_str())]),
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| classify("Failed to create workspace volume", e))?;

        debug!(workspace = %name, "Workspace created");
        Ok(Workspace { id: name })
    }

    #[instrument(skip_all, fields(workspace = %workspace.id, language = %profile.id))]
    async fn compile(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        source_code: &str,
        limits: &ResourceLimits,
    ) -> Result<CompileOutput, SandboxError> {
        check_input_sizes(source_code, None)?;

        let run = self
            .run_container(ContainerSpec {
                image: &profile.base_image,
                script: compile_script(profile),
                workspace,
                workspace_read_only: false,
                user: None,
                limits,
                max_file_size_bytes: COMPILE_FILE_SIZE_BYTES,
                stdin: source_code.as_bytes(),
                kind: "compile",
            })
            .await?;

        if run.timed_out {
            warn!(elapsed_ms = run.elapsed_ms, "Compilation timed out");
            return Ok(CompileOutput::Failed {
                message: format!("Compilation timed out after {}ms", limits.time_limit_ms),
            });
        }
        if run.oom_killed {
            return Ok(CompileOutput::Failed {
                message: format!(
                    "Compiler exceeded the {}MB memory limit",
                    limits.memory_limit_mb
                ),
            });
        }

        match run.exit_code {
            Some(0) => {
                info!(compilation_time_ms = run.elapsed_ms, "Compilation succeeded");
                Ok(CompileOutput::Success)
            }
            code => {
                let mut message = format!("{}{}", run.stdout, run.stderr);
                if message.trim().is_empty() {
                    message = format!("Compiler exited with status {}", code.unwrap_or(-1));
                }
                truncate_utf8(&mut message, MAX_COMPILE_MESSAGE_BYTES);
                warn!(
                    compilation_time_ms = run.elapsed_ms,
                    error_preview = message.lines().next().unwrap_or(""),
                    "Compilation failed"
                );
                Ok(CompileOutput::Failed { message })
            }
        }
    }

    #[instrument(skip_all, fields(workspace = %workspace.id, language = %profile.id, timeout_ms = limits.time_limit_ms))]
    async fn run(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        stdin: &str,
        limits: &ResourceLimits,
    ) -> Result<RunOutput, SandboxError> {
        check_input_sizes("", Some(stdin))?;

        let run = self
            .run_container(ContainerSpec {
                image: &profile.base_image,
                script: wrap_with_stats(&profile.run_command),
                workspace,
                workspace_read_only: true,
                user: Some(&self.config.run_user),
                limits,
                max_file_size_bytes: self.config.max_file_size_bytes,
                stdin: stdin.as_bytes(),
                kind: "run",
            })
            .await?;

        let (stderr, stats) = extract_stats(&run.stderr);
        let peak_bytes = stats
            .map(|s| s.peak_bytes)
            .or(run.sampled_memory_bytes)
            .unwrap_or(0);
        let oom = run.oom_killed || stats.map(|s| s.oom_kills > 0).unwrap_or(false);

        let status = if run.timed_out {
            RunStatus::TimedOut
        } else if oom {
            RunStatus::OomKilled
        } else {
            RunStatus::Exited(run.exit_code.unwrap_or(-1))
        };

        debug!(
            execution_time_ms = run.elapsed_ms,
            memory_kb = peak_bytes / 1024,
            status = ?status,
            "Test execution finished"
        );

        Ok(RunOutput {
            stdout: run.stdout,
            stderr,
            status,
            elapsed_ms: run.elapsed_ms,
            memory_kb: peak_bytes / 1024,
        })
    }

    async fn destroy_workspace(&self, workspace: &Workspace) -> Result<(), SandboxError> {
        self.remove_workspace_containers(workspace).await;
        self.docker
            .remove_volume(&workspace.id, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(|e| classify("Failed to remove workspace volume", e))?;
        debug!(workspace = %workspace.id, "Workspace removed");
        Ok(())
    }
}
