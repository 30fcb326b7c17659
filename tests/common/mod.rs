//! In-memory container runtime used by the integration tests.
#![allow(dead_code)]

use fuzzforge::sandbox::{
    ArtifactPaths, ContainerRuntime, ExecHandle, ExecRequest, LineSink, SandboxSpec,
};
use fuzzforge::ForgeError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct FakeState {
    pub calls: Vec<String>,
    /// Files inside the sandbox, by container path.
    pub files: HashMap<String, String>,
    /// Driver contents as they were when staged, one per run.
    pub staged_drivers: Vec<String>,
    pub exec_env: Vec<Vec<(String, String)>>,
    pub exec_lines: Vec<String>,
    /// Containers created and not yet removed.
    pub live: HashSet<String>,
}

/// Scriptable `ContainerRuntime` that records every call.
#[derive(Default)]
pub struct FakeRuntime {
    pub state: Arc<Mutex<FakeState>>,
    pub missing_image: bool,
    /// Start fails after the container was created, as `run -d` can.
    pub start_fails: bool,
    /// Start fails because the name is taken by another container.
    pub start_conflict: bool,
    pub copy_in_fails: bool,
    pub copy_out_fails: bool,
    pub exec_fails: bool,
    pub sink_fails: bool,
    /// Exec emits its output, then hangs until killed.
    pub stall: bool,
    /// Outputs for successive exec calls; `default_output` once drained.
    pub outputs: Mutex<VecDeque<String>>,
    pub default_output: String,
    /// Files the "build" produces inside the sandbox on every exec.
    pub produced: Vec<(String, String)>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outputs<I: IntoIterator<Item = &'static str>>(mut self, outputs: I) -> Self {
        self.outputs = Mutex::new(outputs.into_iter().map(String::from).collect());
        self
    }

    pub fn with_default_output(mut self, output: &str) -> Self {
        self.default_output = output.to_string();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn log(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn fail(op: &str) -> ForgeError {
    ForgeError::Runtime {
        operation: op.to_string(),
        reason: "scripted failure".to_string(),
    }
}

impl ContainerRuntime for FakeRuntime {
    fn inspect_image(&self, image: &str) -> Result<(), ForgeError> {
        self.log(format!("inspect {}", image));
        if self.missing_image {
            return Err(ForgeError::ImageNotFound {
                image: image.to_string(),
                reason: "No such image".to_string(),
            });
        }
        Ok(())
    }

    fn start(&self, name: &str, image: &str) -> Result<(), ForgeError> {
        self.log(format!("start {} {}", name, image));
        if self.start_conflict {
            return Err(ForgeError::ContainerStart {
                name: name.to_string(),
                reason: format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    name
                ),
            });
        }
        self.state.lock().unwrap().live.insert(name.to_string());
        if self.start_fails {
            return Err(ForgeError::ContainerStart {
                name: name.to_string(),
                reason: "OCI runtime create failed: exec: \"sleep\": not found".to_string(),
            });
        }
        Ok(())
    }

    fn make_dir(&self, name: &str, dir: &str) -> Result<(), ForgeError> {
        self.log(format!("mkdir {} {}", name, dir));
        Ok(())
    }

    fn copy_in(&self, name: &str, host: &Path, container: &str) -> Result<(), ForgeError> {
        self.log(format!("copy_in {} {}", name, container));
        if self.copy_in_fails {
            return Err(fail("copy in"));
        }
        let content = std::fs::read_to_string(host).map_err(|e| ForgeError::io(host, e))?;
        let mut state = self.state.lock().unwrap();
        if container.contains("/fuzz/") {
            state.staged_drivers.push(content.clone());
        }
        state.files.insert(container.to_string(), content);
        Ok(())
    }

    fn copy_out(&self, name: &str, container: &str, host: &Path) -> Result<(), ForgeError> {
        self.log(format!("copy_out {} {}", name, container));
        if self.copy_out_fails {
            return Err(fail("copy out"));
        }
        let content = self
            .state
            .lock()
            .unwrap()
            .files
            .get(container)
            .cloned()
            .ok_or_else(|| fail("copy out"))?;
        if let Some(parent) = host.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ForgeError::io(parent, e))?;
        }
        std::fs::write(host, content).map_err(|e| ForgeError::io(host, e))
    }

    fn spawn_exec(
        &self,
        name: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn ExecHandle>, ForgeError> {
        self.log(format!("exec {}", name));
        if self.exec_fails {
            return Err(fail("exec"));
        }
        let output = self
            .outputs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_output.clone());
        let mut state = self.state.lock().unwrap();
        state.exec_env.push(request.env.clone());
        state.exec_lines.push(request.shell_line());
        for (path, content) in &self.produced {
            state.files.insert(path.clone(), content.clone());
        }
        if self.stall {
            let (tx, rx) = mpsc::channel();
            return Ok(Box::new(ScriptedExec {
                output: Some(Box::new(Stalled {
                    first: Some(output.into_bytes()),
                    release: rx,
                })),
                status: Some(0),
                kill_switch: Some(tx),
            }));
        }
        Ok(Box::new(ScriptedExec {
            output: Some(Box::new(Cursor::new(output.into_bytes()))),
            status: Some(0),
            kill_switch: None,
        }))
    }

    fn open_file_sink(
        &self,
        name: &str,
        container_path: &str,
    ) -> Result<Box<dyn LineSink>, ForgeError> {
        self.log(format!("sink {} {}", name, container_path));
        Ok(Box::new(FileSink {
            path: container_path.to_string(),
            buffer: String::new(),
            fails: self.sink_fails,
            state: Arc::clone(&self.state),
        }))
    }

    fn remove(&self, name: &str) -> Result<(), ForgeError> {
        self.log(format!("remove {}", name));
        self.state.lock().unwrap().live.remove(name);
        Ok(())
    }
}

pub struct ScriptedExec {
    pub output: Option<Box<dyn Read + Send>>,
    pub status: Option<i32>,
    pub kill_switch: Option<Sender<()>>,
}

impl ExecHandle for ScriptedExec {
    fn take_output(&mut self) -> Option<Box<dyn Read + Send>> {
        self.output.take()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.kill_switch.take();
        Ok(())
    }

    fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.status)
    }
}

/// Yields `first`, then blocks until the exec is killed.
pub struct Stalled {
    first: Option<Vec<u8>>,
    release: Receiver<()>,
}

impl Read for Stalled {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(mut first) = self.first.take() {
            let n = first.len().min(buf.len());
            buf[..n].copy_from_slice(&first[..n]);
            if n < first.len() {
                self.first = Some(first.split_off(n));
            }
            return Ok(n);
        }
        let _ = self.release.recv();
        Ok(0)
    }
}

struct FileSink {
    path: String,
    buffer: String,
    fails: bool,
    state: Arc<Mutex<FakeState>>,
}

impl LineSink for FileSink {
    fn accept(&mut self, line: &str) -> io::Result<()> {
        if self.fails {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sandbox writer died"));
        }
        self.buffer.push_str(line);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(self.path.clone(), std::mem::take(&mut self.buffer));
        Ok(())
    }
}

/// Sandbox spec pointing at real files inside `dir`.
pub fn spec_in(dir: &Path, driver_source: &str) -> SandboxSpec {
    let driver = dir.join("ros2_rosidl_runtime_c_fuzz_driver_1.c");
    let descriptor = dir.join("CMakeLists.txt");
    std::fs::write(&driver, driver_source).unwrap();
    std::fs::write(&descriptor, "cmake_minimum_required(VERSION 3.5)\n").unwrap();

    SandboxSpec {
        image: "rosidl_runtime_c_base_image:latest".to_string(),
        container_path: "/ws/src/ros2/rosidl/rosidl_runtime_c".to_string(),
        driver,
        build_descriptor: descriptor,
        build_script: None,
        default_script: "fuzzing.sh".to_string(),
        driver_dest_name: "fuzzer.c".to_string(),
        target_binary: "fuzzer".to_string(),
        timeout: Duration::from_secs(10),
        host_grace: Duration::from_secs(30),
        coverage_json: ArtifactPaths {
            container: "/ws/fuzz_corpus/coverage.json".to_string(),
            host: None,
        },
        coverage_text: ArtifactPaths {
            container: "/ws/fuzz_corpus/coverage.txt".to_string(),
            host: None,
        },
        workdir: Some("/ws".to_string()),
        output: dir.join("shared/fuzz_output.txt"),
        container_name: None,
        container_prefix: "fuzz".to_string(),
    }
}

pub fn shared(runtime: FakeRuntime) -> Arc<FakeRuntime> {
    Arc::new(runtime)
}
