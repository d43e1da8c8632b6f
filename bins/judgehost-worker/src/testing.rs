// In-memory collaborators for pipeline, guard and daemon tests
//
// FakeRuntime keeps a real `sleep` child per container as the "root
// process" so the guard can sample and kill it. Execs whose command starts
// with a registered prefix run the matching shell script on the host with
// the container's workdir as cwd; every other exec succeeds immediately.

use crate::docker::{ContainerRuntime, ContainerState, SandboxSpec};
use crate::downloader::{FetchKind, FetchRequest, Fetcher};
use crate::endpoint::Endpoint;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use judgehost_common::api::TestcasePart;
use judgehost_common::types::{RunResult, TestcaseInfo};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::{Child, Command};

struct FakeContainer {
    workdir: PathBuf,
    root: Option<Child>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    specs: Vec<SandboxSpec>,
    scripts: Vec<(String, String)>,
    execs: Vec<String>,
    stops: Vec<String>,
    removes: Vec<String>,
    oom_killed: bool,
    fail_create: bool,
    next_id: usize,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execs starting with `prefix` run `script` on the host.
    pub fn with_script(self, prefix: &str, script: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .push((prefix.to_string(), script.to_string()));
        self
    }

    pub fn failing_create(self) -> Self {
        self.state.lock().unwrap().fail_create = true;
        self
    }

    pub fn set_oom_killed(&self, oom: bool) {
        self.state.lock().unwrap().oom_killed = oom;
    }

    pub fn specs(&self) -> Vec<SandboxSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn execs(&self) -> Vec<String> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn removes(&self) -> Vec<String> {
        self.state.lock().unwrap().removes.clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.state.lock().unwrap().stops.clone()
    }

    /// Containers created but not yet removed.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            bail!("Failed to create Docker container: fake refused");
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.specs.push(spec.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                workdir: spec.workdir.clone(),
                root: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let root = Command::new("sleep")
            .arg("3600")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such container {}", id))?;
        container.root = Some(root);
        Ok(())
    }

    async fn exec(&self, id: &str, _user: &str, cmd: &str) -> Result<i64> {
        let (workdir, script) = {
            let mut state = self.state.lock().unwrap();
            state.execs.push(cmd.to_string());
            let workdir = state
                .containers
                .get(id)
                .map(|c| c.workdir.clone())
                .ok_or_else(|| anyhow!("no such container {}", id))?;
            let script = state
                .scripts
                .iter()
                .find(|(prefix, _)| cmd.starts_with(prefix.as_str()))
                .map(|(_, script)| script.clone());
            (workdir, script)
        };

        let Some(script) = script else {
            return Ok(0);
        };
        let status = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;
        Ok(status.code().map(i64::from).unwrap_or(-1))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let state = self.state.lock().unwrap();
        let pid = state
            .containers
            .get(id)
            .and_then(|c| c.root.as_ref())
            .and_then(Child::id);
        Ok(ContainerState {
            pid,
            running: pid.is_some(),
            oom_killed: state.oom_killed,
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stops.push(id.to_string());
        if let Some(container) = state.containers.get_mut(id) {
            if let Some(mut root) = container.root.take() {
                let _ = root.start_kill();
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.removes.push(id.to_string());
        state.containers.remove(id);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Every call the pipeline made to the endpoint, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Reported {
    CompileOk(i64),
    CompileError(i64, String),
    JudgeError(i64, String),
    Result(RunResult),
}

#[derive(Default)]
pub struct RecordingEndpoint {
    testcases: Mutex<VecDeque<TestcaseInfo>>,
    reports: Mutex<Vec<Reported>>,
}

impl RecordingEndpoint {
    pub fn with_testcases(testcases: Vec<TestcaseInfo>) -> Self {
        Self {
            testcases: Mutex::new(testcases.into()),
            reports: Mutex::default(),
        }
    }

    pub fn reports(&self) -> Vec<Reported> {
        self.reports.lock().unwrap().clone()
    }

    pub fn results(&self) -> Vec<RunResult> {
        self.reports()
            .into_iter()
            .filter_map(|r| match r {
                Reported::Result(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    fn record(&self, report: Reported) {
        self.reports.lock().unwrap().push(report);
    }
}

#[async_trait]
impl Endpoint for RecordingEndpoint {
    async fn next_testcase(&self, _judging_id: i64) -> Result<Option<TestcaseInfo>> {
        Ok(self.testcases.lock().unwrap().pop_front())
    }

    async fn compile_ok(&self, judging_id: i64) -> Result<()> {
        self.record(Reported::CompileOk(judging_id));
        Ok(())
    }

    async fn compile_error(&self, judging_id: i64, message: &str) -> Result<()> {
        self.record(Reported::CompileError(judging_id, message.to_string()));
        Ok(())
    }

    async fn judge_error(&self, judging_id: i64, error: &str) -> Result<()> {
        self.record(Reported::JudgeError(judging_id, error.to_string()));
        Ok(())
    }

    async fn post_result(&self, result: &RunResult) -> Result<()> {
        self.record(Reported::Result(result.clone()));
        Ok(())
    }
}

/// Serves fixed content for every request; code is always `main.c`.
#[derive(Default)]
pub struct StaticFetcher {
    fail_testcases: bool,
    fail_executables: bool,
    requests: Mutex<Vec<FetchRequest>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_testcases(mut self) -> Self {
        self.fail_testcases = true;
        self
    }

    pub fn failing_executables(mut self) -> Self {
        self.fail_executables = true;
        self
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<PathBuf> {
        self.requests.lock().unwrap().push(request.clone());
        let (path, content) = match &request.kind {
            FetchKind::Code { .. } => (
                request.destination.with_file_name("main.c"),
                "int main() { return 0; }".to_string(),
            ),
            FetchKind::Executable { exec_id } => {
                if self.fail_executables {
                    bail!("error processing download: executable {} unavailable", exec_id);
                }
                (request.destination.clone(), format!("zip of {}", exec_id))
            }
            FetchKind::Testcase { testcase_id, part } => {
                if self.fail_testcases {
                    bail!("error processing download: testcase {} unavailable", testcase_id);
                }
                let content = match part {
                    TestcasePart::Input => format!("input {}\n", testcase_id),
                    TestcasePart::Output => format!("answer {}\n", testcase_id),
                };
                (request.destination.clone(), content)
            }
        };
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
