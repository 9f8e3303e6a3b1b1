//! Wrapper around the external archive tool.
//!
//! The tool is the only component that understands the container format
//! itself: it lists archive entries, materializes raw files, and uncooks
//! decodable formats into JSON sidecars. Stdout is the only success channel;
//! a non-zero exit or anything on stderr is treated as failure. Every
//! invocation is time-boxed and the child is killed on deadline rather than
//! blocking the pipeline.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ArchiveTool {
    bin: PathBuf,
    timeout: Duration,
}

impl ArchiveTool {
    pub fn new(bin: PathBuf) -> Self {
        Self {
            bin,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(bin: PathBuf, timeout: Duration) -> Self {
        Self { bin, timeout }
    }

    /// List archive entries whose path matches `regex`, one relative path per
    /// stdout line.
    pub fn list(&self, container: &Path, regex: &str) -> Result<Vec<String>> {
        let stdout = self.run(&[
            "list",
            path_str(container)?,
            "--regex",
            regex,
        ])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Materialize every entry matching `pattern` under `out_dir`, keeping
    /// the archive-relative directory layout.
    pub fn extract(&self, container: &Path, pattern: &str, out_dir: &Path) -> Result<()> {
        self.run(&[
            "extract",
            path_str(container)?,
            "--pattern",
            pattern,
            "--outpath",
            path_str(out_dir)?,
        ])?;
        Ok(())
    }

    /// Materialize decoded JSON sidecars for every entry matching `regex`.
    pub fn uncook(&self, container: &Path, regex: &str, out_dir: &Path) -> Result<()> {
        self.run(&[
            "uncook",
            path_str(container)?,
            "--regex",
            regex,
            "--outpath",
            path_str(out_dir)?,
        ])?;
        Ok(())
    }

    /// Tool version string, used for the cache compatibility record.
    pub fn version(&self) -> Result<String> {
        Ok(self.run(&["--version"])?.trim().to_string())
    }

    fn command(&self) -> Command {
        #[cfg(windows)]
        {
            let lower = self.bin.to_string_lossy().to_ascii_lowercase();
            if lower.ends_with(".cmd") || lower.ends_with(".bat") {
                let mut cmd = Command::new("cmd");
                cmd.arg("/C").arg(&self.bin);
                return cmd;
            }
        }

        Command::new(&self.bin)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(args);
        let output = run_with_timeout(cmd, self.timeout, &self.bin)?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.success {
            return Err(Error::tool(format!(
                "exit code {:?}: {}",
                output.code,
                stderr.trim()
            )));
        }
        if !stderr.trim().is_empty() {
            return Err(Error::tool(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

struct ToolOutput {
    success: bool,
    code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

fn run_with_timeout(mut cmd: Command, timeout: Duration, bin: &Path) -> Result<ToolOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        Error::tool(format!(
            "failed to spawn archive tool {}: {e}",
            bin.display()
        ))
    })?;

    // Drain both pipes on threads so the child can never stall on a full
    // pipe buffer while we poll for exit.
    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    kill_child(&mut child);
                    return Err(Error::tool(format!(
                        "timed out after {}s: {}",
                        timeout.as_secs(),
                        bin.display()
                    )));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_child(&mut child);
                return Err(Error::tool(format!("wait failed: {e}")));
            }
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok(ToolOutput {
        success: status.success(),
        code: status.code(),
        stdout,
        stderr,
    })
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn kill_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::invalid(format!("path is not valid UTF-8: {}", path.display())))
}
