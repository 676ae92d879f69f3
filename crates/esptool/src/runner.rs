use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// An external program plus its argument vector.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    /// The line callback accepted at least one line.
    pub matched: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start: {0}")]
    Spawn(#[source] io::Error),
    #[error("waiting for tool failed: {0}")]
    Io(#[source] io::Error),
}

/// Runs an external tool and streams its combined output, one line at a time.
///
/// `on_line` returns `true` once it has seen what it was looking for; the
/// runner keeps draining output until the process exits so the serial port
/// is released before the caller moves on.
pub trait ToolRunner {
    fn run(
        &mut self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str) -> bool,
    ) -> Result<ToolExit, RunnerError>;
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl ToolRunner for ProcessRunner {
    fn run(
        &mut self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str) -> bool,
    ) -> Result<ToolExit, RunnerError> {
        debug!(command = %invocation, "running tool");
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        let mut child = command.spawn().map_err(RunnerError::Spawn)?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut matched = false;
        let mut timed_out = false;
        loop {
            let line = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(remaining) {
                        Ok(line) => line,
                        Err(RecvTimeoutError::Timeout) => {
                            timed_out = true;
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(line) => line,
                    Err(_) => break,
                },
            };
            debug!(line = %line, "tool output");
            if !matched && on_line(&line) {
                matched = true;
            }
        }

        if timed_out {
            warn!(command = %invocation, "tool timed out, killing it");
            if let Err(err) = child.kill() {
                warn!(error = %err, "failed to kill timed out tool");
            }
        }
        let status = child.wait().map_err(RunnerError::Io)?;
        if !timed_out {
            for reader in readers {
                let _ = reader.join();
            }
        }

        Ok(ToolExit {
            matched,
            exit_code: status.code(),
            timed_out,
        })
    }
}

fn spawn_line_reader<R>(stream: R, tx: Sender<String>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if tx.send(line.to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Invocation {
        Invocation::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn matches_line_from_stdout() {
        let mut runner = ProcessRunner::default();
        let exit = runner
            .run(&shell("echo starting; echo 'Chip erase completed successfully'"), &mut |line| {
                line.contains("Chip erase completed")
            })
            .unwrap();
        assert!(exit.matched);
        assert_eq!(exit.exit_code, Some(0));
        assert!(!exit.timed_out);
    }

    #[test]
    fn sees_stderr_lines_too() {
        let mut runner = ProcessRunner::default();
        let mut seen = Vec::new();
        let exit = runner
            .run(&shell("echo oops 1>&2; exit 3"), &mut |line| {
                seen.push(line.to_string());
                false
            })
            .unwrap();
        assert!(!exit.matched);
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(seen, vec!["oops".to_string()]);
    }

    #[test]
    fn kills_tool_after_timeout() {
        let mut runner = ProcessRunner::new(Some(Duration::from_millis(200)));
        let exit = runner.run(&shell("exec sleep 5"), &mut |_| false).unwrap();
        assert!(exit.timed_out);
        assert!(!exit.matched);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let mut runner = ProcessRunner::default();
        let result = runner.run(&Invocation::new("espbatch-no-such-tool"), &mut |_| false);
        assert!(matches!(result, Err(RunnerError::Spawn(_))));
    }
}
