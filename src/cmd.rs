use anyhow::{Context, Result, anyhow, bail};
use std::fmt;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};
use wait_timeout::ChildExt;

/// Timeout for read-only probes (`id`, `grep`, `<runtime> version`).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the quickest probes (`test -f`).
pub const QUICK_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for commands that mutate the host (user creation, file edits, removal).
pub const MUTATE_TIMEOUT: Duration = Duration::from_secs(30);

/// A builder for executing external commands with a timeout and optional stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    timeout: Duration,
}

impl Cmd {
    /// Create a new command builder with the probe timeout
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: PROBE_TIMEOUT,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed the given text to the command's stdin
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[cfg(test)]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[cfg(test)]
    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    #[cfg(test)]
    pub fn stdin_text(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    #[cfg(test)]
    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    /// Execute through the given shell and return trimmed stdout.
    pub fn run(&self, shell: &dyn Shell) -> Result<String> {
        shell.exec(self)
    }

    /// Execute through the given shell, returning true on success and false on any failure.
    pub fn run_as_check(&self, shell: &dyn Shell) -> bool {
        match shell.exec(self) {
            Ok(_) => true,
            Err(e) => {
                trace!(command = %self, error = %e, "cmd:check failed");
                false
            }
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Executes commands on the host. Every detection and mutation goes through this seam.
pub trait Shell {
    /// Run the command to completion or timeout. Non-zero exit and timeout are errors.
    fn exec(&self, cmd: &Cmd) -> Result<String>;
}

/// The real host shell, backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

impl Shell for SystemShell {
    fn exec(&self, cmd: &Cmd) -> Result<String> {
        trace!(command = %cmd, timeout = ?cmd.timeout, "cmd:run start");

        which::which(&cmd.program)
            .with_context(|| format!("Command not found: {}", cmd.program))?;

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", cmd))?;

        // Feed stdin and drain output on helper threads so neither side can
        // block past the timeout on a full pipe
        let stdin_thread = match (cmd.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(thread::spawn(move || {
                // Dropping the pipe at the end closes the child's stdin
                pipe.write_all(input.as_bytes())
            })),
            _ => None,
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_thread = thread::spawn(move || read_pipe(stdout));
        let stderr_thread = thread::spawn(move || read_pipe(stderr));

        let status = match child
            .wait_timeout(cmd.timeout)
            .with_context(|| format!("Failed to wait for command: {}", cmd))?
        {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                debug!(command = %cmd, timeout = ?cmd.timeout, "cmd:run timeout");
                bail!(
                    "Command timed out after {}s: {}",
                    cmd.timeout.as_secs(),
                    cmd
                );
            }
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();
        if let Some(handle) = stdin_thread
            && let Ok(Err(e)) = handle.join()
        {
            trace!(command = %cmd, error = %e, "cmd:stdin write incomplete");
        }

        if !status.success() {
            debug!(
                command = %cmd,
                status = ?status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!("Command failed: {}\n{}", cmd, stderr.trim()));
        }

        trace!(command = %cmd, "cmd:run success");
        Ok(stdout.trim().to_string())
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

/// Prefix a command with `sudo` unless we already run as root.
pub fn privileged(program: &str) -> Cmd {
    if is_root() {
        Cmd::new(program)
    } else {
        Cmd::new("sudo").arg(program)
    }
}

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
pub mod testing {
    //! A scripted shell for unit tests.

    use super::{Cmd, Shell};
    use anyhow::{Result, anyhow};
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Replies to commands by their rendered command line. Unknown commands fail,
    /// which is how a missing binary looks to the caller.
    #[derive(Default)]
    pub struct FakeShell {
        replies: HashMap<String, Result<String, String>>,
        calls: RefCell<Vec<Cmd>>,
    }

    impl FakeShell {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ok(mut self, command_line: &str, stdout: &str) -> Self {
            self.replies
                .insert(command_line.to_string(), Ok(stdout.to_string()));
            self
        }

        pub fn fail(mut self, command_line: &str, stderr: &str) -> Self {
            self.replies
                .insert(command_line.to_string(), Err(stderr.to_string()));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|c| c.to_string()).collect()
        }

        pub fn call_cmds(&self) -> Vec<Cmd> {
            self.calls.borrow().clone()
        }

        pub fn was_called(&self, command_line: &str) -> bool {
            self.calls().iter().any(|c| c == command_line)
        }

        pub fn was_called_with_prefix(&self, prefix: &str) -> bool {
            self.calls().iter().any(|c| c.starts_with(prefix))
        }
    }

    impl Shell for FakeShell {
        fn exec(&self, cmd: &Cmd) -> Result<String> {
            self.calls.borrow_mut().push(cmd.clone());
            match self.replies.get(&cmd.to_string()) {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(err)) => Err(anyhow!("Command failed: {}\n{}", cmd, err)),
                None => Err(anyhow!("Command not found: {}", cmd.program())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeShell;
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let cmd = Cmd::new("id").args(["-u", "agentbox"]);
        assert_eq!(cmd.to_string(), "id -u agentbox");
    }

    #[test]
    fn builder_defaults_to_probe_timeout() {
        let cmd = Cmd::new("podman").arg("version");
        assert_eq!(cmd.timeout_duration(), PROBE_TIMEOUT);
        assert!(cmd.stdin_text().is_none());
    }

    #[test]
    fn builder_records_stdin_and_timeout() {
        let cmd = Cmd::new("tee")
            .arg("/etc/subuid")
            .stdin("alice:100000:65536\n")
            .timeout(MUTATE_TIMEOUT);
        assert_eq!(cmd.stdin_text(), Some("alice:100000:65536\n"));
        assert_eq!(cmd.timeout_duration(), MUTATE_TIMEOUT);
    }

    #[test]
    fn run_as_check_maps_failure_to_false() {
        let shell = FakeShell::new()
            .ok("systemctl --version", "systemd 255")
            .fail("id -u ghost", "no such user");
        assert!(Cmd::new("systemctl").arg("--version").run_as_check(&shell));
        assert!(!Cmd::new("id").args(["-u", "ghost"]).run_as_check(&shell));
        assert!(!Cmd::new("missing").run_as_check(&shell));
    }

    #[cfg(unix)]
    #[test]
    fn system_shell_captures_trimmed_stdout() {
        let out = Cmd::new("echo").arg("hello").run(&SystemShell).unwrap();
        assert_eq!(out, "hello");
    }

    #[cfg(unix)]
    #[test]
    fn system_shell_feeds_stdin() {
        let out = Cmd::new("cat").stdin("piped text\n").run(&SystemShell).unwrap();
        assert_eq!(out, "piped text");
    }

    #[cfg(unix)]
    #[test]
    fn system_shell_times_out_when_child_ignores_large_stdin() {
        let input = "x".repeat(1 << 20);
        let err = Cmd::new("sleep")
            .arg("5")
            .stdin(input)
            .timeout(Duration::from_millis(300))
            .run(&SystemShell)
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[test]
    fn system_shell_times_out() {
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .run(&SystemShell)
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn system_shell_reports_missing_binary() {
        let err = Cmd::new("definitely-not-a-real-binary-agentbox")
            .run(&SystemShell)
            .unwrap_err();
        assert!(err.to_string().contains("Command not found"));
    }
}
