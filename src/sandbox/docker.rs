use super::{ContainerRuntime, ExecHandle, ExecRequest, LineSink};
use crate::error::ForgeError;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::debug;

/// `ContainerRuntime` backed by the docker CLI. Every call is an explicit
/// argument vector; only the exec step's inner command goes through a shell.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs the CLI to completion, returning combined output on failure.
    fn run(&self, args: &[&str]) -> Result<String, String> {
        debug!(binary = %self.binary, ?args, "docker");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| format!("failed to run {}: {}", self.binary, e))?;

        if !output.status.success() {
            let mut err = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if err.is_empty() {
                err = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(format!("exit {}: {}", output.status.code().unwrap_or(-1), err));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn runtime_err(operation: &str, reason: String) -> ForgeError {
        ForgeError::Runtime {
            operation: operation.to_string(),
            reason,
        }
    }
}

impl ContainerRuntime for DockerCli {
    fn inspect_image(&self, image: &str) -> Result<(), ForgeError> {
        self.run(&["image", "inspect", image])
            .map(|_| ())
            .map_err(|reason| ForgeError::ImageNotFound {
                image: image.to_string(),
                reason,
            })
    }

    fn start(&self, name: &str, image: &str) -> Result<(), ForgeError> {
        self.run(&["run", "-d", "--name", name, image, "sleep", "infinity"])
            .map(|_| ())
            .map_err(|reason| ForgeError::ContainerStart {
                name: name.to_string(),
                reason,
            })
    }

    fn make_dir(&self, name: &str, dir: &str) -> Result<(), ForgeError> {
        self.run(&["exec", name, "mkdir", "-p", dir])
            .map(|_| ())
            .map_err(|reason| Self::runtime_err("mkdir", reason))
    }

    fn copy_in(&self, name: &str, host: &Path, container: &str) -> Result<(), ForgeError> {
        let source = host
            .canonicalize()
            .map_err(|e| ForgeError::io(host, e))?;
        let source = source.to_string_lossy();
        let dest = format!("{}:{}", name, container);
        self.run(&["cp", &*source, dest.as_str()])
            .map(|_| ())
            .map_err(|reason| Self::runtime_err("copy in", reason))
    }

    fn copy_out(&self, name: &str, container: &str, host: &Path) -> Result<(), ForgeError> {
        if let Some(parent) = host.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ForgeError::io(parent, e))?;
        }
        let source = format!("{}:{}", name, container);
        let dest = host.to_string_lossy();
        self.run(&["cp", source.as_str(), &*dest])
            .map(|_| ())
            .map_err(|reason| Self::runtime_err("copy out", reason))
    }

    fn spawn_exec(
        &self,
        name: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn ExecHandle>, ForgeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec");
        for (key, value) in &request.env {
            cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        let shell_line = request.shell_line();
        cmd.args([name, "bash", "-lc", shell_line.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(container = %name, command = %shell_line, "docker exec");
        let child = cmd
            .spawn()
            .map_err(|e| Self::runtime_err("exec", e.to_string()))?;
        Ok(Box::new(ChildExec { child }))
    }

    fn open_file_sink(
        &self,
        name: &str,
        container_path: &str,
    ) -> Result<Box<dyn LineSink>, ForgeError> {
        let mut child = Command::new(&self.binary)
            .args(["exec", "-i", name, "sh", "-c", "cat > \"$0\"", container_path])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Self::runtime_err("open file sink", e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Self::runtime_err("open file sink", "stdin unavailable".into()))?;
        Ok(Box::new(ContainerFileSink {
            child,
            stdin: Some(stdin),
        }))
    }

    fn remove(&self, name: &str) -> Result<(), ForgeError> {
        self.run(&["rm", "-f", name])
            .map(|_| ())
            .map_err(|reason| Self::runtime_err("remove", reason))
    }
}

struct ChildExec {
    child: Child,
}

impl ExecHandle for ChildExec {
    fn take_output(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_errors(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().map(|status| status.code())
    }
}

/// Writes lines into a file inside the container through `exec -i`.
struct ContainerFileSink {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl LineSink for ContainerFileSink {
    fn accept(&mut self, line: &str) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(line.as_bytes()),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("in-sandbox writer exited with {}", status),
            ))
        }
    }
}

impl Drop for ContainerFileSink {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
