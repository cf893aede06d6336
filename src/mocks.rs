// Test doubles for the process and transport seams - no network, no real ssh

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{MqiError, Result};
use crate::handlers::command::{CommandError, CommandExecutor, CommandOutput, CommandSpec};
use crate::handlers::ssh::{RemoteEntry, RemoteTransport};
use crate::models::ExecutionResult;

type Scripted<T> = Vec<(String, VecDeque<T>)>;

/// Pop the next scripted response for the first needle found in `line`.
/// The last response for a needle repeats forever.
fn next_scripted<T: Clone>(script: &mut Scripted<T>, line: &str) -> Option<T> {
    let (_, queue) = script.iter_mut().find(|(needle, _)| line.contains(needle.as_str()))?;
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

fn push_scripted<T>(script: &mut Scripted<T>, needle: &str, response: T) {
    match script.iter_mut().find(|(n, _)| n == needle) {
        Some((_, queue)) => queue.push_back(response),
        None => script.push((needle.to_string(), VecDeque::from([response]))),
    }
}

/// Command executor answering from a script keyed by substrings of the command line
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<Scripted<std::result::Result<CommandOutput, CommandError>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, needle: &str, status_code: i32, stdout: &str, stderr: &str) {
        let output = CommandOutput {
            status_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
        push_scripted(&mut *self.script.lock().unwrap(), needle, Ok(output));
    }

    pub fn fail(&self, needle: &str, error: CommandError) {
        push_scripted(&mut *self.script.lock().unwrap(), needle, Err(error));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        let line = spec.display();
        next_scripted(&mut *self.script.lock().unwrap(), &line).unwrap_or(Ok(CommandOutput {
            status_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }
}

#[derive(Default)]
struct FakeState {
    exec_script: Scripted<std::result::Result<ExecutionResult, String>>,
    exec_log: Vec<String>,
    put_failures: HashMap<String, usize>,
    uploads: Vec<String>,
    open_failures: usize,
    opens: usize,
    closes: usize,
}

/// Transport backed by a local directory standing in for the cluster filesystem
pub struct FakeTransport {
    root: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Local path backing a remote absolute path
    pub fn local_path(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }

    pub fn respond(&self, needle: &str, return_code: i32, output: &str) {
        let result = ExecutionResult {
            success: return_code == 0,
            output: output.to_string(),
            error: String::new(),
            return_code,
        };
        push_scripted(&mut self.state.lock().unwrap().exec_script, needle, Ok(result));
    }

    pub fn drop_connection_on(&self, needle: &str) {
        push_scripted(
            &mut self.state.lock().unwrap().exec_script,
            needle,
            Err("connection dropped".to_string()),
        );
    }

    /// Fail the next `times` uploads of the file called `name`
    pub fn fail_put(&self, name: &str, times: usize) {
        self.state.lock().unwrap().put_failures.insert(name.to_string(), times);
    }

    pub fn fail_open(&self, times: usize) {
        self.state.lock().unwrap().open_failures = times;
    }

    pub fn exec_log(&self) -> Vec<String> {
        self.state.lock().unwrap().exec_log.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

fn io_to_transport(e: std::io::Error) -> MqiError {
    MqiError::Connection(e.to_string())
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn open(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(MqiError::Connection("authentication timed out".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecutionResult> {
        let mut state = self.state.lock().unwrap();
        state.exec_log.push(command.to_string());
        match next_scripted(&mut state.exec_script, command) {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(MqiError::Connection(message)),
            None => Ok(ExecutionResult {
                success: true,
                ..Default::default()
            }),
        }
    }

    async fn mkdir_all(&self, remote_dir: &str) -> Result<()> {
        std::fs::create_dir_all(self.local_path(remote_dir)).map_err(io_to_transport)
    }

    async fn put_file(&self, local: &Path, remote_path: &str) -> Result<()> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(remaining) = state.put_failures.get_mut(&name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MqiError::Connection(format!("sftp write of {} failed", name)));
                }
            }
            state.uploads.push(name);
        }
        let target = self.local_path(remote_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_to_transport)?;
        }
        std::fs::copy(local, target).map_err(io_to_transport)?;
        Ok(())
    }

    async fn get_file(&self, remote_path: &str, local: &Path) -> Result<()> {
        std::fs::copy(self.local_path(remote_path), local).map_err(io_to_transport)?;
        Ok(())
    }

    async fn write_file(&self, remote_path: &str, contents: &str) -> Result<()> {
        let target = self.local_path(remote_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_to_transport)?;
        }
        std::fs::write(target, contents).map_err(io_to_transport)
    }

    async fn list_dir(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(self.local_path(remote_dir)).map_err(io_to_transport)? {
            let entry = entry.map_err(io_to_transport)?;
            let is_dir = entry.file_type().map_err(io_to_transport)?.is_dir();
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                mode: if is_dir { 0o040755 } else { 0o100644 },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
