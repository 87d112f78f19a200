use std::{
    ffi::OsStr,
    io::Seek,
    process::{Command, Stdio},
};

use anyhow::{Context, Result};
use camino::Utf8Path;

/// A wrapper for a child process; the two primitives are [`Task::run`]
/// (stream output, return once the child exits successfully) and
/// [`Task::read`] (capture stdout). Arguments are always passed as
/// argv entries, never via a shell.
pub struct Task {
    description: String,
    quiet: bool,
    quiet_output: bool,
    /// The underlying command.
    pub cmd: Command,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("description", &self.description)
            .field("cmd", &self.cmd)
            .finish()
    }
}

impl Task {
    /// Create a new task which will execute the provided binary.
    pub fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        Self::new_cmd(description, Command::new(exe.as_ref()))
    }

    /// Create a new task from an already assembled [`Command`].
    pub fn new_cmd(description: impl AsRef<str>, mut cmd: Command) -> Self {
        let description = description.as_ref().to_string();
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            quiet_output: false,
            cmd,
        }
    }

    /// Set the working directory the child starts in.
    pub fn start_dir(mut self, dir: &Utf8Path) -> Self {
        self.cmd.current_dir(dir);
        self
    }

    /// Don't print the task description before running it.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Do not print stdout/stderr, unless the command fails.
    pub fn quiet_output(mut self) -> Self {
        self.quiet_output = true;
        self
    }

    /// Append arguments to the command.
    pub fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Append a single argument.
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.cmd.arg(arg);
        self
    }

    /// Run the command, returning an error if the command does not exit successfully.
    pub fn run(self) -> Result<()> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            println!("{description}");
        }
        let mut output = None;
        if self.quiet_output {
            let tmpf = tempfile::tempfile()?;
            cmd.stdout(Stdio::from(tmpf.try_clone()?));
            cmd.stderr(Stdio::from(tmpf.try_clone()?));
            output = Some(tmpf);
        }
        tracing::debug!("exec: {cmd:?}");
        let st = cmd
            .status()
            .with_context(|| format!("Spawning {description} failed"))?;
        if !st.success() {
            if let Some(mut output) = output {
                output.seek(std::io::SeekFrom::Start(0))?;
                let mut stderr = std::io::stderr().lock();
                std::io::copy(&mut output, &mut stderr)?;
            }
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(())
    }

    /// Like [`Task::run`], but return stdout.
    pub fn read(self) -> Result<String> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            println!("{description}");
        }
        tracing::debug!("exec: {cmd:?}");
        cmd.stdout(Stdio::piped());
        let child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        let o = child
            .wait_with_output()
            .with_context(|| format!("Executing {description} failed"))?;
        let st = o.status;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(String::from_utf8(o.stdout)?)
    }

    /// Run the command with both output streams captured. On failure the
    /// returned error carries the child's stderr and stdout verbatim, so
    /// callers may match on the underlying tool's message.
    pub fn run_captured(self) -> Result<String> {
        let description = self.description;
        let mut cmd = self.cmd;
        tracing::debug!("exec: {cmd:?}");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let o = cmd
            .output()
            .with_context(|| format!("Spawning {description} failed"))?;
        let stdout = String::from_utf8_lossy(&o.stdout).into_owned();
        if !o.status.success() {
            let stderr = String::from_utf8_lossy(&o.stderr);
            anyhow::bail!("Task {description} failed ({:?}): {stderr}{stdout}", o.status);
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read() {
        let out = Task::new("print", "echo").arg("hello").quiet().read().unwrap();
        similar_asserts::assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_run_captured_failure_carries_output() {
        let e = Task::new("fail", "sh")
            .args(["-c", "echo would be exceeded, at least 1 >&2; exit 1"])
            .run_captured()
            .unwrap_err();
        assert!(e.to_string().contains("would be exceeded, at least"));
    }

    #[test]
    fn test_start_dir() {
        let td = tempfile::tempdir().unwrap();
        let path = camino::Utf8Path::from_path(td.path()).unwrap();
        let out = Task::new("cwd", "pwd").start_dir(path).quiet().read().unwrap();
        assert_eq!(out.trim_end(), path.canonicalize_utf8().unwrap().as_str());
    }
}
