use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const FUZZ_ENGINE: &str = "afl-fuzz";
const TARGET_BINARY: &str = "target";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Master,
    Slave,
}

/// Immutable description of one fuzzer to launch. Exactly one worker per
/// pool is the master; it pushes its output to the shared store and carries
/// the campaign tag.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub role: WorkerRole,
    pub name: String,
    tag: Option<String>,
    env: HashMap<String, String>,
    fuzz_dir: PathBuf,
}

impl WorkerSpec {
    pub fn master(id: &str, guid: &str, env: HashMap<String, String>, fuzz_dir: PathBuf) -> Self {
        Self {
            role: WorkerRole::Master,
            name: format!("master_{id}"),
            tag: Some(format!("{id},guid:{guid}")),
            env,
            fuzz_dir,
        }
    }

    pub fn slave(suffix: &str, env: HashMap<String, String>, fuzz_dir: PathBuf) -> Self {
        Self {
            role: WorkerRole::Slave,
            name: format!("slave_{suffix}"),
            tag: None,
            env,
            fuzz_dir,
        }
    }

    /// The afl-fuzz invocation as a structured argument vector; the tag is a
    /// discrete argument, never interpolated into a shell string.
    pub fn argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = [FUZZ_ENGINE, "-i", "in", "-o", "out", "-Q"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        match self.role {
            WorkerRole::Master => {
                argv.push("-M".to_string());
                argv.push(self.name.clone());
                if let Some(tag) = &self.tag {
                    argv.push("-T".to_string());
                    argv.push(tag.clone());
                }
            }
            WorkerRole::Slave => {
                argv.push("-S".to_string());
                argv.push(self.name.clone());
            }
        }
        argv.push("--".to_string());
        argv.push(self.fuzz_dir.join(TARGET_BINARY).display().to_string());
        argv
    }
}

/// How a worker left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Unterminated,
    Code(i32),
    Signaled(i32),
    Unknown,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            Self::Code(code)
        } else if let Some(sig) = status.signal() {
            Self::Signaled(sig)
        } else {
            Self::Unknown
        }
    }

    /// A positive exit code means the worker ran and failed. Signal-induced
    /// termination, including our own SIGTERM during shutdown, is not a
    /// crash.
    pub fn crash_code(self) -> Option<i32> {
        match self {
            Self::Code(code) if code > 0 => Some(code),
            _ => None,
        }
    }
}

/// A spawned worker. The process runs in its own process group so the
/// fuzzer and anything it forks can be terminated as one unit.
pub struct WorkerHandle {
    pub name: String,
    pgid: libc::pid_t,
    child: Option<Child>,
    pub outcome: ExitOutcome,
}

impl WorkerHandle {
    pub fn spawn(spec: &WorkerSpec) -> Result<Self> {
        Self::launch(&spec.argv(), &spec.env, &spec.fuzz_dir, &spec.name)
    }

    pub(crate) fn launch(
        argv: &[String],
        env: &HashMap<String, String>,
        cwd: &Path,
        name: &str,
    ) -> Result<Self> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker {name}"))?;
        // setpgid(0, 0) made the worker its own group leader, so the group
        // id equals its pid.
        let pgid = child
            .id()
            .map(|pid| pid as libc::pid_t)
            .with_context(|| format!("spawned worker {name} has no pid"))?;
        Ok(Self {
            name: name.to_string(),
            pgid,
            child: Some(child),
            outcome: ExitOutcome::Unterminated,
        })
    }

    /// Hand the underlying process to the exit monitor.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    pub fn record_exit(&mut self, outcome: ExitOutcome) {
        self.outcome = outcome;
    }

    /// Send SIGTERM to the whole process group. Never blocks, and is a no-op
    /// for a worker whose exit has already been observed.
    pub fn terminate(&self) {
        if self.outcome != ExitOutcome::Unterminated {
            return;
        }
        if unsafe { libc::killpg(self.pgid, libc::SIGTERM) } == -1 {
            let err = io::Error::last_os_error();
            // ESRCH: the group vanished between the outcome check and the
            // signal.
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(worker = %self.name, %err, "failed to signal process group");
            }
        } else {
            debug!(worker = %self.name, pgid = self.pgid, "sent SIGTERM to process group");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn master_argv_carries_role_flag_and_tag() {
        let spec = WorkerSpec::master("h1", "c0ffee", HashMap::new(), PathBuf::from("/fuzz"));
        let argv = spec.argv();
        assert_eq!(argv[0], "afl-fuzz");
        let m = argv.iter().position(|arg| arg == "-M").expect("no -M flag");
        assert_eq!(argv[m + 1], "master_h1");
        let t = argv.iter().position(|arg| arg == "-T").expect("no -T flag");
        assert_eq!(argv[t + 1], "h1,guid:c0ffee");
        assert_eq!(argv.last().expect("empty argv"), "/fuzz/target");
    }

    #[test]
    fn slave_argv_has_role_flag_but_no_tag() {
        let spec = WorkerSpec::slave("h12", HashMap::new(), PathBuf::from("/fuzz"));
        let argv = spec.argv();
        let s = argv.iter().position(|arg| arg == "-S").expect("no -S flag");
        assert_eq!(argv[s + 1], "slave_h12");
        assert!(!argv.contains(&"-T".to_string()));
        assert!(!argv.contains(&"-M".to_string()));
    }

    #[test]
    fn signal_termination_is_not_a_crash() {
        assert_eq!(ExitOutcome::Code(7).crash_code(), Some(7));
        assert_eq!(ExitOutcome::Code(0).crash_code(), None);
        assert_eq!(ExitOutcome::Signaled(libc::SIGTERM).crash_code(), None);
        assert_eq!(ExitOutcome::Unknown.crash_code(), None);
    }

    #[tokio::test]
    async fn terminate_signals_the_process_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut handle = WorkerHandle::launch(
            &strings(&["/bin/sleep", "30"]),
            &HashMap::new(),
            dir.path(),
            "slave_t0",
        )
        .expect("launch failed");
        handle.terminate();
        let status = handle
            .take_child()
            .expect("child already taken")
            .wait()
            .await
            .expect("wait failed");
        assert_eq!(
            ExitOutcome::from_status(status),
            ExitOutcome::Signaled(libc::SIGTERM)
        );
    }

    #[tokio::test]
    async fn exit_code_is_observed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut handle = WorkerHandle::launch(
            &strings(&["/bin/sh", "-c", "exit 7"]),
            &HashMap::new(),
            dir.path(),
            "slave_t1",
        )
        .expect("launch failed");
        let status = handle
            .take_child()
            .expect("child already taken")
            .wait()
            .await
            .expect("wait failed");
        assert_eq!(ExitOutcome::from_status(status), ExitOutcome::Code(7));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = WorkerHandle::launch(
            &strings(&["./no-such-fuzzer"]),
            &HashMap::new(),
            dir.path(),
            "slave_t2",
        );
        assert!(result.is_err());
    }
}
