// Process Supervisor
// Spawns device commands through a shell and owns their lifecycle

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::error::{StreamError, StreamResult};
use super::session_registry::Supervised;
use super::thread_config::SessionThreadKind;

const DEFAULT_SHELL: &str = "/bin/bash";
const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How device commands are executed
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub shell: PathBuf,
    /// Run as a login shell (`-l`) so profile PATH entries apply
    pub login: bool,
    /// Time between SIGTERM and SIGKILL
    pub terminate_grace: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            login: true,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

/// What happens to the process's stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Kept as a pipe for the frame decoder
    Piped,
    /// The process writes files instead; stdout is discarded
    Discard,
}

/// Fail unless commands can be run through `shell` on this platform
pub fn ensure_supported_platform(shell: &Path) -> StreamResult<()> {
    if !cfg!(unix) {
        return Err(StreamError::UnsupportedPlatform(format!(
            "stream processes require a POSIX shell, running on {}",
            std::env::consts::OS
        )));
    }
    if !shell.exists() {
        return Err(StreamError::UnsupportedPlatform(format!(
            "shell not found at {}",
            shell.display()
        )));
    }
    Ok(())
}

/// A running device command
pub struct ManagedProcess {
    device_id: String,
    pid: u32,
    child: Mutex<Child>,
    stdout: Mutex<Option<ChildStdout>>,
    terminated: AtomicBool,
    terminate_grace: Duration,
}

impl ManagedProcess {
    /// Launch `command` via the configured shell, in its own process group
    pub fn spawn(
        device_id: &str,
        command: &str,
        working_dir: Option<&Path>,
        output: OutputMode,
        config: &ShellConfig,
    ) -> StreamResult<Self> {
        let mut cmd = Command::new(&config.shell);
        if config.login {
            cmd.arg("-l");
        }
        cmd.arg("-c").arg(command);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(match output {
                OutputMode::Piped => Stdio::piped(),
                OutputMode::Discard => Stdio::null(),
            })
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        log::info!("[Stream:{}] Executing command: {}", device_id, command);

        let mut child = cmd.spawn().map_err(|source| StreamError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let pid = child.id();
        log::info!("[Stream:{}] Process started with PID: {}", device_id, pid);

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(device_id, stderr);
        }
        let stdout = child.stdout.take();

        Ok(Self {
            device_id: device_id.to_string(),
            pid,
            child: Mutex::new(child),
            stdout: Mutex::new(stdout),
            terminated: AtomicBool::new(false),
            terminate_grace: config.terminate_grace,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Hand out the stdout pipe. Only the first call gets it.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        lock_ignoring_poison(&self.stdout).take()
    }

    /// Non-blocking liveness check
    pub fn is_alive(&self) -> bool {
        matches!(lock_ignoring_poison(&self.child).try_wait(), Ok(None))
    }

    /// Stop the process group: SIGTERM, grace period, then SIGKILL.
    /// If the shell already exited, whatever is left in its group is killed.
    /// Only the first call does anything.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut child = lock_ignoring_poison(&self.child);
        if let Ok(Some(status)) = child.try_wait() {
            log::debug!("[Stream:{}] Process {} already exited ({})", self.device_id, self.pid, status);
            self.kill_group_stragglers();
            return;
        }

        self.signal_group_terminate(&mut child);

        let start = Instant::now();
        while start.elapsed() < self.terminate_grace {
            if let Ok(Some(_)) = child.try_wait() {
                log::info!("[Stream:{}] Process {} terminated", self.device_id, self.pid);
                self.kill_group_stragglers();
                return;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        log::warn!(
            "[Stream:{}] Process {} did not exit within {:?}, killing",
            self.device_id,
            self.pid,
            self.terminate_grace
        );
        self.kill_group_stragglers();
        let _ = child.kill();
        let _ = child.wait();
    }

    #[cfg(unix)]
    fn signal_group_terminate(&self, _child: &mut Child) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            log::debug!("[Stream:{}] SIGTERM to group {} failed: {}", self.device_id, self.pid, e);
        }
    }

    #[cfg(not(unix))]
    fn signal_group_terminate(&self, child: &mut Child) {
        let _ = child.kill();
    }

    #[cfg(unix)]
    fn kill_group_stragglers(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
    }

    #[cfg(not(unix))]
    fn kill_group_stragglers(&self) {}
}

impl Supervised for ManagedProcess {
    fn is_alive(&self) -> bool {
        ManagedProcess::is_alive(self)
    }

    fn terminate(&self) {
        ManagedProcess::terminate(self)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Log stderr in background so diagnostics never mix with stdout data
fn forward_stderr(device_id: &str, stderr: ChildStderr) {
    let kind = SessionThreadKind::StderrReader;
    let device_log = device_id.to_string();
    let spawned = kind.spawn(&kind.thread_name(device_id), move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            if line.contains("error") || line.contains("Error") || line.contains("Invalid") || line.contains("not found") {
                log::warn!("[Stream:{}] {}", device_log, line);
            } else if !line.trim().is_empty() {
                log::debug!("[Stream:{}] {}", device_log, line);
            }
        }
        log::debug!("[Stream:{}] stderr reader finished", device_log);
    });

    if let Err(e) = spawned {
        log::warn!("[Stream:{}] Could not start stderr reader: {}", device_id, e);
    }
}
