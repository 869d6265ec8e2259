use std::{path::Path, process::ExitStatus, time::Duration};

use loopcast_session::Destination;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};

use crate::error::SessionError;
use crate::logs::LogSink;

const SOURCE_PLACEHOLDER: &str = "{source}";
const DESTINATION_PLACEHOLDER: &str = "{destination}";

fn ffmpeg_loop_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-re",
        "-stream_loop",
        "-1",
        "-i",
        SOURCE_PLACEHOLDER,
        "-c:v",
        "copy",
        "-c:a",
        "copy",
        "-f",
        "flv",
        DESTINATION_PLACEHOLDER,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the relay dies without running its shutdown path, take the encoder with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: i32, sig: libc::c_int) {
    unsafe {
        libc::kill(-pgid, sig);
    }
}

#[derive(Debug)]
pub struct EncoderProcess {
    child: Child,
    pid: Option<u32>,
    pgid: Option<i32>,
    exit_code: Option<i32>,
    exited: bool,
}

impl EncoderProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.exited = true;
        self.exit_code = status.code();
    }

    // Reaps the child if it has exited.
    pub fn is_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Err(err) => {
                tracing::warn!(pid = ?self.pid, %err, "encoder liveness check failed");
                self.exited = true;
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    AlreadyExited,
    Graceful,
    Killed,
}

#[derive(Debug, Clone)]
pub struct ProcessController {
    program: String,
    args: Vec<String>,
    grace: Duration,
}

impl ProcessController {
    /// `args` may contain `{source}` and `{destination}` placeholders.
    pub fn new(program: impl Into<String>, args: Vec<String>, grace: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            grace,
        }
    }

    pub fn ffmpeg(program: impl Into<String>, grace: Duration) -> Self {
        Self::new(program, ffmpeg_loop_args(), grace)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    fn render_args(&self, source: &Path, destination: &Destination) -> Vec<String> {
        let source = source.display().to_string();
        self.args
            .iter()
            .map(|a| {
                a.replace(SOURCE_PLACEHOLDER, &source)
                    .replace(DESTINATION_PLACEHOLDER, destination.as_str())
            })
            .collect()
    }

    pub async fn probe(&self) -> bool {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-version")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        matches!(
            tokio::time::timeout(Duration::from_secs(10), cmd.status()).await,
            Ok(Ok(status)) if status.success()
        )
    }

    pub(crate) fn spawn(
        &self,
        source: &Path,
        destination: &Destination,
        sink: LogSink,
    ) -> Result<EncoderProcess, SessionError> {
        let args = self.render_args(source, destination);

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            let msg = if e.kind() == std::io::ErrorKind::NotFound {
                format!("encoder binary not found: {}", self.program)
            } else {
                format!("failed to spawn encoder {}", self.program)
            };
            SessionError::process(msg, e)
        })?;

        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        if let Some(out) = child.stdout.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(format!("[stdout] {line}")).await;
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(format!("[stderr] {line}")).await;
                }
            });
        }

        tracing::info!(
            pid = ?pid,
            program = %self.program,
            source = %source.display(),
            destination = %destination.redacted(),
            "encoder spawned"
        );

        Ok(EncoderProcess {
            child,
            pid,
            pgid,
            exit_code: None,
            exited: false,
        })
    }

    // SIGTERM to the group, bounded wait, SIGKILL. Always reaps.
    pub async fn terminate(
        &self,
        proc: &mut EncoderProcess,
    ) -> Result<TerminateOutcome, SessionError> {
        if !proc.is_alive() {
            return Ok(TerminateOutcome::AlreadyExited);
        }

        #[cfg(unix)]
        if let Some(pgid) = proc.pgid {
            signal_group(pgid, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = proc.child.start_kill();
        }

        match tokio::time::timeout(self.grace, proc.child.wait()).await {
            Ok(Ok(status)) => {
                proc.record_exit(status);
                tracing::info!(pid = ?proc.pid, exit_code = ?proc.exit_code, "encoder stopped");
                return Ok(TerminateOutcome::Graceful);
            }
            Ok(Err(err)) => {
                tracing::warn!(pid = ?proc.pid, %err, "waiting for encoder failed; escalating to SIGKILL");
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?proc.pid,
                    grace_ms = self.grace.as_millis() as u64,
                    "encoder ignored SIGTERM; sending SIGKILL"
                );
            }
        }

        #[cfg(unix)]
        if let Some(pgid) = proc.pgid {
            signal_group(pgid, libc::SIGKILL);
        }

        // Child::kill sends SIGKILL to the leader and waits for it.
        if let Err(err) = proc.child.kill().await {
            if !proc.is_alive() {
                return Ok(TerminateOutcome::Killed);
            }
            return Err(SessionError::process("failed to kill encoder", err));
        }
        proc.exited = true;
        proc.exit_code = None;
        Ok(TerminateOutcome::Killed)
    }
}
