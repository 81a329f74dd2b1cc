use crate::config::AppSpec;
use crate::error::{Result, WardenError};
use crate::process::monitor::MemoryProbe;
use crate::process::types::ExitInfo;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variable carrying the app name into the child
pub const ENV_APP_NAME: &str = "WARDEN_APP_NAME";
/// Environment variable carrying the slot index into the child
pub const ENV_INSTANCE: &str = "WARDEN_INSTANCE";

/// Exclusive owner of one OS child process.
///
/// Dropping a handle whose process was never reaped kills it; the runtime
/// then reaps the zombie. No registry of children exists anywhere else.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    name: String,
    started: Instant,
    exit: Option<ExitInfo>,
}

impl ProcessHandle {
    /// Spawn one instance of the app described by `spec`
    ///
    /// # Returns
    /// * `Ok(ProcessHandle)` - The child is running
    /// * `Err(WardenError::SpawnError)` - Missing script, permission denied or OS exhaustion
    pub fn spawn(spec: &AppSpec, slot: usize) -> Result<Self> {
        let (program, args) = spec.command_line();
        let name = format!("{}#{}", spec.name, slot);

        let mut command = Command::new(&program);
        command.args(&args);

        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }

        command.envs(&spec.env);
        command.env(ENV_APP_NAME, &spec.name);
        command.env(ENV_INSTANCE, slot.to_string());

        // Output is not captured; it flows to the supervisor's own streams
        command.stdin(Stdio::null());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());
        command.kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| WardenError::spawn(&name, &e))?;

        // A freshly spawned child always has an id until it is polled to completion
        let pid = child.id().ok_or_else(|| WardenError::SpawnError {
            name: name.clone(),
            kind: crate::error::SpawnFailure::Other,
            message: "process exited before its PID could be read".to_string(),
        })?;

        debug!(process = %name, pid, program = %program.display(), "spawned child");

        Ok(Self {
            child,
            pid,
            name,
            started: Instant::now(),
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Exit status, once the process has been reaped
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit
    }

    /// Send `signal` to the process
    ///
    /// # Returns
    /// * `Err(WardenError::NotRunning)` - The process already exited
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Err(WardenError::NotRunning(self.pid));
        }

        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(WardenError::NotRunning(self.pid)),
            Err(e) => Err(WardenError::SignalError(format!(
                "Failed to send {} to {} (PID {}): {}",
                signal, self.name, self.pid, e
            ))),
        }
    }

    /// Wait for the process to terminate.
    ///
    /// Cancel safe: dropping the future before completion loses nothing, so
    /// it can race other branches in `tokio::select!`.
    pub async fn wait(&mut self) -> Result<ExitInfo> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        let status = self.child.wait().await?;
        let exit = ExitInfo::from_status(status);
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Resident memory of the process in bytes, read through `probe`
    ///
    /// # Returns
    /// * `Err(WardenError::SampleError)` - The process is gone
    pub fn sample_memory(&self, probe: &dyn MemoryProbe) -> Result<u64> {
        if self.exit.is_some() {
            return Err(WardenError::SampleError(
                self.pid,
                "process already exited".to_string(),
            ));
        }
        probe.sample(self.pid)
    }

    /// Stop the process: send `signal`, wait up to `grace`, then SIGKILL.
    ///
    /// Always reaps the child before returning.
    pub async fn shutdown(&mut self, signal: Signal, grace: Duration) -> Result<ExitInfo> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        info!(process = %self.name, pid = self.pid, %signal, "stopping process");

        match self.signal(signal) {
            Ok(()) | Err(WardenError::NotRunning(_)) => {}
            Err(e) => warn!("{}", e),
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    process = %self.name,
                    pid = self.pid,
                    "process did not exit within {:?}, sending SIGKILL",
                    grace
                );
                self.kill().await
            }
        }
    }

    /// Forcefully kill the process and reap it
    pub async fn kill(&mut self) -> Result<ExitInfo> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        match self.signal(Signal::SIGKILL) {
            Ok(()) | Err(WardenError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.wait().await
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit.is_none() {
            // kill_on_drop delivers SIGKILL; the runtime reaps the zombie
            debug!(process = %self.name, pid = self.pid, "dropping live process handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::monitor::SystemProbe;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_spec(script: &str, args: &[&str]) -> AppSpec {
        let mut spec = AppSpec::new("test-app", script);
        spec.args = args.iter().map(|a| a.to_string()).collect();
        spec
    }

    #[tokio::test]
    async fn test_spawn_and_wait_exit_code() {
        let spec = create_test_spec("/bin/sh", &["-c", "exit 3"]);
        let mut handle = ProcessHandle::spawn(&spec, 0).unwrap();
        assert!(handle.pid() > 0);
        assert_eq!(handle.name(), "test-app#0");

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert_eq!(handle.exit_info(), Some(exit));

        // A second wait returns the recorded status
        assert_eq!(handle.wait().await.unwrap(), exit);
    }

    #[tokio::test]
    async fn test_spawn_passes_instance_env() {
        let spec = create_test_spec(
            "/bin/sh",
            &["-c", "test \"$WARDEN_INSTANCE\" = 4 && test \"$WARDEN_APP_NAME\" = test-app"],
        );
        let mut handle = ProcessHandle::spawn(&spec, 4).unwrap();
        assert!(handle.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_spawn_with_user_env_and_cwd() {
        let temp_dir = TempDir::new().unwrap();
        let mut spec = create_test_spec("/bin/sh", &["-c", "test \"$FOO\" = bar && test \"$(pwd -P)\" = \"$EXPECTED\""]);
        spec.cwd = Some(temp_dir.path().to_path_buf());
        spec.env.insert("FOO".to_string(), "bar".to_string());
        spec.env.insert(
            "EXPECTED".to_string(),
            temp_dir.path().canonicalize().unwrap().display().to_string(),
        );

        let mut handle = ProcessHandle::spawn(&spec, 0).unwrap();
        assert!(handle.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_script() {
        let spec = create_test_spec("/nonexistent/script", &[]);
        match ProcessHandle::spawn(&spec, 0) {
            Err(WardenError::SpawnError { kind, .. }) => {
                assert_eq!(kind, crate::error::SpawnFailure::NotFound);
            }
            other => panic!("Expected SpawnError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_permission_denied() {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("not-executable.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let spec = AppSpec::new("denied", PathBuf::from(&script));
        match ProcessHandle::spawn(&spec, 0) {
            Err(WardenError::SpawnError { kind, .. }) => {
                assert_eq!(kind, crate::error::SpawnFailure::PermissionDenied);
            }
            other => panic!("Expected SpawnError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signal_after_exit_is_not_running() {
        let spec = create_test_spec("/bin/sh", &["-c", "exit 0"]);
        let mut handle = ProcessHandle::spawn(&spec, 0).unwrap();
        handle.wait().await.unwrap();

        let result = handle.signal(Signal::SIGTERM);
        assert!(matches!(result, Err(WardenError::NotRunning(_))));
        assert!(matches!(
            handle.sample_memory(&SystemProbe::new()),
            Err(WardenError::SampleError(..))
        ));
    }

    #[tokio::test]
    async fn test_sample_memory_of_running_process() {
        let spec = create_test_spec("/bin/sleep", &["5"]);
        let mut handle = ProcessHandle::spawn(&spec, 0).unwrap();
        let probe = SystemProbe::new();

        assert!(handle.sample_memory(&probe).unwrap() > 0);
        // The same probe serves repeated samples
        assert!(handle.sample_memory(&probe).unwrap() > 0);

        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let spec = create_test_spec("/bin/sleep", &["30"]);
        let mut handle = ProcessHandle::spawn(&spec, 0).unwrap();

        let exit = handle
            .shutdown(Signal::SIGTERM, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(exit.signal, Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let spec = create_test_spec(
            "/bin/sh",
            &["-c", "trap '' TERM; while true; do sleep 0.1; done"],
        );
        let mut handle = ProcessHandle::spawn(&spec, 0).unwrap();
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let exit = handle
            .shutdown(Signal::SIGTERM, Duration::from_millis(300))
            .await
            .unwrap();

        assert_eq!(exit.signal, Some(Signal::SIGKILL as i32));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let spec = create_test_spec("/bin/sleep", &["30"]);
        let mut handle = ProcessHandle::spawn(&spec, 0).unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(100), handle.wait()).await;
        assert!(timed_out.is_err());

        // The handle is still usable after the cancelled wait
        let exit = handle.kill().await.unwrap();
        assert_eq!(exit.signal, Some(Signal::SIGKILL as i32));
    }
}
