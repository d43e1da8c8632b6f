/// Stage Pipeline - One Submission, One Sandbox, One CPU
///
/// **Core Responsibility:**
/// Drive a judging task through `Prepare → Build → (Run → Judge)* → Cleanup`.
///
/// **State machine:**
/// - Every stage is a `Stage` value; a stage returns the next one
/// - The task context is immutable, only `Progress` changes between stages
/// - Any infrastructure error jumps straight to `Cleanup(Failed)`
/// - Judged outcomes are reported here, before moving on
///
/// **Boundary:**
/// - Pipeline does NOT log or report infrastructure failures, the pool worker does
/// - Pipeline does NOT kill sandboxed processes, only the guard may
/// - Cleanup runs exactly once for every container created
///
/// **Exit codes:**
/// Compile, run and compare commands write `$?` into `exitcode`. That file is
/// authoritative; the code returned by the exec call is diagnostic only.

use crate::config::SystemConfig;
use crate::docker::{ContainerRuntime, SandboxSpec, PIDS_LIMIT};
use crate::downloader::{FetchRequest, Fetcher};
use crate::endpoint::Endpoint;
use crate::guard::{Guard, GuardRequest, OutputWatch, RunInfo, SENTINEL};
use crate::verdict;
use anyhow::{anyhow, bail, Context, Result};
use judgehost_common::api::TestcasePart;
use judgehost_common::types::{BundleKind, JudgeInfo, RunResult, TestcaseInfo, Verdict};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const EXEC_DIR: &str = "execdir";
const EXIT_CODE_FILE: &str = "exitcode";
const COMPILE_OUT: &str = "compile.out";
const COMPILE_ERR: &str = "compile.err";
const RUN_ERR: &str = "run.err";
const COMPARE_OUT: &str = "compare.out";
const PROGRAM_OUT: &str = "program.out";
const PROGRAM_META: &str = "program.meta";

/// Time an exec gets to return after its sentinel appeared.
const EXEC_GRACE: Duration = Duration::from_millis(500);

/// Largest stderr/diff blob attached to a report.
const MAX_REPORTED_BYTES: u64 = 64 * 1024;

/// Sandbox and quota settings shared by every task.
#[derive(Debug, Clone)]
pub struct Settings {
    pub image: String,
    pub run_user: String,
    /// Bytes, used when a judging declares no memory limit.
    pub root_memory: i64,
    pub build_time_limit: Duration,
    pub build_output_limit: u64,
    pub judge_time_limit: Duration,
    /// Ceiling for unguarded setup commands (bundle unzip/build).
    pub setup_time_limit: Duration,
}

impl From<&SystemConfig> for Settings {
    fn from(config: &SystemConfig) -> Self {
        Self {
            image: config.docker_image.clone(),
            run_user: config.run_user.clone(),
            root_memory: config.root_memory,
            build_time_limit: config.build_time_limit(),
            build_output_limit: config.build_output_limit,
            judge_time_limit: config.judge_time_limit(),
            setup_time_limit: config.build_time_limit(),
        }
    }
}

/// One judging task: what to judge and where.
#[derive(Debug, Clone)]
pub struct Task {
    pub info: JudgeInfo,
    pub workdir: PathBuf,
}

/// How a task ended.
#[derive(Debug)]
pub enum Outcome {
    /// Every testcase was judged.
    Completed { judged: usize },
    CompileError,
    /// A run verdict stopped the testcase loop.
    Rejected { testcase_id: i64, verdict: Verdict },
    /// Infrastructure failure, nothing more was reported.
    Failed(anyhow::Error),
}

enum Stage {
    Prepare,
    Build,
    NextTestcase,
    Run(TestcaseInfo),
    Judge(TestcaseInfo, RunInfo),
    Cleanup(Outcome),
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Build => "build",
            Stage::NextTestcase => "next_testcase",
            Stage::Run(_) => "run",
            Stage::Judge(..) => "judge",
            Stage::Cleanup(_) => "cleanup",
        }
    }
}

/// Owned handle to a created container.
///
/// `release` stops and removes it. If a task is dropped mid-flight the
/// handle still schedules a forced removal.
struct Sandbox {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl Sandbox {
    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    async fn release(mut self) -> Result<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        let stopped = self.runtime.stop(&id).await;
        self.runtime
            .remove(&id)
            .await
            .with_context(|| format!("cannot remove container {}", id))?;
        stopped.with_context(|| format!("cannot stop container {}", id))
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = runtime.remove(&id).await {
                    warn!(container = %id, error = %e, "Failed to cleanup abandoned container");
                }
            });
        }
    }
}

/// Mutable per-task state, handed from stage to stage.
#[derive(Default)]
struct Progress {
    sandbox: Option<Sandbox>,
    code_file: Option<String>,
    judged: usize,
}

impl Progress {
    fn container(&self) -> Result<&str> {
        self.sandbox
            .as_ref()
            .map(Sandbox::id)
            .ok_or_else(|| anyhow!("no container for this task"))
    }
}

/// Quoted for `bash -c`.
fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn read_exit_code(workdir: &Path) -> Result<i64> {
    let path = workdir.join(EXIT_CODE_FILE);
    let content = fs::read_to_string(&path).context("cannot read exitcode")?;
    verdict::parse_exit_code(&content)
        .ok_or_else(|| anyhow!("exitcode file holds {:?}, not a number", content.trim()))
}

fn clear_exit_code(workdir: &Path) -> Result<()> {
    match fs::remove_file(workdir.join(EXIT_CODE_FILE)) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e).context("cannot remove stale exitcode"),
        _ => Ok(()),
    }
}

/// At most `cap` bytes of `path`; a missing file reads as empty.
fn read_capped(path: &Path, cap: u64) -> Result<Vec<u8>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
    };
    let mut data = Vec::new();
    file.take(cap)
        .read_to_end(&mut data)
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(data)
}

/// First free name among `<dir>/<base>`, `<dir>/<base>-1`, `<dir>/<base>-2`, ...
pub fn unused_path(dir: &Path, base: &str) -> PathBuf {
    let mut candidate = dir.join(base);
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}-{}", base, n));
        n += 1;
    }
    candidate
}

fn archive_name(workdir: &Path, rank: i64) -> PathBuf {
    unused_path(workdir, &format!("{}{:03}", EXEC_DIR, rank))
}

fn testcase_file(workdir: &Path, rank: i64, part: TestcasePart) -> PathBuf {
    workdir.join(format!("testcase{:03}.{}", rank, part.extension()))
}

pub struct Pipeline {
    runtime: Arc<dyn ContainerRuntime>,
    endpoint: Arc<dyn Endpoint>,
    fetcher: Arc<dyn Fetcher>,
    guard: Guard,
    settings: Settings,
}

impl Pipeline {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        endpoint: Arc<dyn Endpoint>,
        fetcher: Arc<dyn Fetcher>,
        settings: Settings,
    ) -> Self {
        Self {
            runtime,
            endpoint,
            fetcher,
            guard: Guard::default(),
            settings,
        }
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// Judge one task on `cpu`. Always ends with the task's container removed.
    #[tracing::instrument(
        skip(self, task),
        fields(
            submit_id = task.info.submit_id,
            judging_id = task.info.judging_id
        )
    )]
    pub async fn run(&self, task: &Task, cpu: usize) -> Outcome {
        let mut stage = Stage::Prepare;
        let mut progress = Progress::default();
        loop {
            debug!(stage = stage.name(), "Entering stage");
            stage = match stage {
                Stage::Cleanup(outcome) => return self.cleanup(progress, outcome).await,
                current => {
                    let (next, carried) = self.advance(task, cpu, current, progress).await;
                    progress = carried;
                    next
                }
            };
        }
    }

    async fn advance(&self, task: &Task, cpu: usize, stage: Stage, mut progress: Progress) -> (Stage, Progress) {
        let next = match stage {
            Stage::Prepare => self.prepare(task, &mut progress).await,
            Stage::Build => self.build(task, cpu, &mut progress).await,
            Stage::NextTestcase => self.next_testcase(task, &progress).await,
            Stage::Run(testcase) => self.run_testcase(task, &progress, testcase).await,
            Stage::Judge(testcase, run) => self.judge(task, &mut progress, testcase, run).await,
            Stage::Cleanup(outcome) => Ok(Stage::Cleanup(outcome)),
        };
        (next.unwrap_or_else(|e| Stage::Cleanup(Outcome::Failed(e))), progress)
    }

    async fn prepare(&self, task: &Task, progress: &mut Progress) -> Result<Stage> {
        fs::create_dir_all(&task.workdir)
            .with_context(|| format!("cannot create workdir {}", task.workdir.display()))?;

        // Server-assigned filename, no checksum to check against
        let code = self
            .fetcher
            .fetch(FetchRequest::code(task.info.submit_id, &task.workdir))
            .await
            .context("error preparing for judge")?;
        let code_file = code
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("bad submission path {}", code.display()))?;
        progress.code_file = Some(code_file.to_string());

        for kind in BundleKind::ALL {
            let bundle = task.info.bundle(kind);
            let dir = task.workdir.join(kind.dir());
            fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;
            self.fetcher
                .fetch(FetchRequest::executable(bundle.name, bundle.md5, dir.join(bundle.name)))
                .await
                .with_context(|| format!("error preparing for judge: {} bundle {}", kind, bundle.name))?;
        }

        debug!(code_file, "Prepared");
        Ok(Stage::Build)
    }

    fn sandbox_spec(&self, task: &Task, cpu: usize) -> SandboxSpec {
        let memory = if task.info.memory_limit > 0 {
            task.info.memory_limit * 1024
        } else {
            self.settings.root_memory
        };
        SandboxSpec {
            name: format!("judgehost-j{}-{}", task.info.judging_id, uuid::Uuid::new_v4().simple()),
            image: self.settings.image.clone(),
            workdir: task.workdir.clone(),
            cpu,
            memory,
            pids_limit: PIDS_LIMIT,
            user: self.settings.run_user.clone(),
        }
    }

    /// Unguarded setup command that must succeed.
    async fn setup(&self, container: &str, cmd: &str) -> Result<()> {
        let code = tokio::time::timeout(
            self.settings.setup_time_limit,
            self.runtime.exec(container, &self.settings.run_user, cmd),
        )
        .await
        .map_err(|_| anyhow!("`{}` timed out", cmd))?
        .with_context(|| format!("exec `{}`", cmd))?;
        if code != 0 {
            bail!("`{}` exited with code {}", cmd, code);
        }
        Ok(())
    }

    /// Run `cmd` while the guard watches the container's root process.
    async fn guarded(
        &self,
        task: &Task,
        container: &str,
        cmd: &str,
        time_limit: Duration,
        output: Option<OutputWatch>,
    ) -> Result<RunInfo> {
        let state = self.runtime.inspect(container).await?;
        let pid = state
            .pid
            .filter(|_| state.running)
            .ok_or_else(|| anyhow!("container {} has no running process", container))?;

        let exec = self.runtime.exec(container, &self.settings.run_user, cmd);
        let watch = self.guard.watch(
            self.runtime.as_ref(),
            GuardRequest {
                container,
                pid,
                workdir: &task.workdir,
                time_limit,
                output,
            },
        );
        tokio::pin!(exec);
        tokio::pin!(watch);

        let mut exec_code = None;
        let info = loop {
            tokio::select! {
                info = &mut watch => break info?,
                code = &mut exec, if exec_code.is_none() => {
                    let code = code.with_context(|| format!("exec `{}`", cmd))?;
                    debug!(code, "Exec returned, waiting for sentinel");
                    exec_code = Some(code);
                }
            }
        };

        if exec_code.is_none() && !info.quota_exceeded() {
            if let Ok(Ok(code)) = tokio::time::timeout(EXEC_GRACE, &mut exec).await {
                exec_code = Some(code);
            }
        }
        debug!(
            exec_code = ?exec_code,
            used_ms = info.used_time.as_millis() as u64,
            used_memory = info.used_memory,
            "Guarded exec finished"
        );
        Ok(info)
    }

    async fn build(&self, task: &Task, cpu: usize, progress: &mut Progress) -> Result<Stage> {
        let spec = self.sandbox_spec(task, cpu);
        let id = self
            .runtime
            .create(&spec)
            .await
            .context("create container error")?;
        progress.sandbox = Some(Sandbox {
            runtime: Arc::clone(&self.runtime),
            id: Some(id.clone()),
        });
        self.runtime.start(&id).await.context("start container error")?;
        info!(container = %id, name = %spec.name, "Sandbox started");

        for kind in BundleKind::ALL {
            let bundle = task.info.bundle(kind);
            let zip = format!("{}/{}", kind.dir(), bundle.name);
            self.setup(&id, &format!("unzip -o {} -d {}", quote(&zip), kind.dir()))
                .await
                .with_context(|| format!("unzip {} bundle error", kind))?;
            self.setup(&id, &format!("cd {}; ./build 2> ./build.err", kind.dir()))
                .await
                .with_context(|| format!("build {} bundle error", kind))?;
        }

        let code_file = progress
            .code_file
            .as_deref()
            .ok_or_else(|| anyhow!("submission not prepared"))?;
        clear_exit_code(&task.workdir)?;
        let cmd = format!(
            "build/run ./program DUMMY ./{} 2> ./{} > ./{}; echo $? > {}; touch ./{}",
            quote(code_file),
            COMPILE_ERR,
            COMPILE_OUT,
            EXIT_CODE_FILE,
            SENTINEL
        );
        let usage = self
            .guarded(
                task,
                &id,
                &cmd,
                self.settings.build_time_limit,
                Some(OutputWatch {
                    path: task.workdir.join(COMPILE_OUT),
                    limit: self.settings.build_output_limit,
                }),
            )
            .await
            .context("compile error")?;

        let stderr = read_capped(&task.workdir.join(COMPILE_ERR), MAX_REPORTED_BYTES)?;
        let stderr = String::from_utf8_lossy(&stderr);
        let failure = if usage.time_exceeded {
            Some(verdict::compile_error_message(-1, "compilation time limit exceeded\n"))
        } else if usage.memory_exceeded {
            Some(verdict::compile_error_message(-1, "compilation memory limit exceeded\n"))
        } else if usage.output_exceeded {
            Some(verdict::compile_error_message(-1, "compilation output limit exceeded\n"))
        } else {
            let code = read_exit_code(&task.workdir)?;
            (code != 0).then(|| verdict::compile_error_message(code, &stderr))
        };

        match failure {
            Some(message) => {
                info!(judging_id = task.info.judging_id, "Compile error");
                self.endpoint
                    .compile_error(task.info.judging_id, &message)
                    .await?;
                Ok(Stage::Cleanup(Outcome::CompileError))
            }
            None => {
                info!(judging_id = task.info.judging_id, "Compile OK");
                self.endpoint.compile_ok(task.info.judging_id).await?;
                Ok(Stage::NextTestcase)
            }
        }
    }

    async fn next_testcase(&self, task: &Task, progress: &Progress) -> Result<Stage> {
        let Some(testcase) = self
            .endpoint
            .next_testcase(task.info.judging_id)
            .await
            .context("request testcase error")?
        else {
            info!(judged = progress.judged, "All testcases judged");
            return Ok(Stage::Cleanup(Outcome::Completed {
                judged: progress.judged,
            }));
        };

        for (part, md5) in [
            (TestcasePart::Input, &testcase.md5_input),
            (TestcasePart::Output, &testcase.md5_output),
        ] {
            self.fetcher
                .fetch(FetchRequest::testcase(
                    testcase.testcase_id,
                    part,
                    md5,
                    testcase_file(&task.workdir, testcase.rank, part),
                ))
                .await
                .context("worker error: downloading testcase error")?;
        }
        debug!(testcase_id = testcase.testcase_id, rank = testcase.rank, "Testcase ready");
        Ok(Stage::Run(testcase))
    }

    fn time_limit(&self, task: &Task) -> Duration {
        if task.info.time_limit > 0.0 {
            Duration::from_secs_f64(task.info.time_limit)
        } else {
            self.settings.judge_time_limit
        }
    }

    async fn run_testcase(&self, task: &Task, progress: &Progress, testcase: TestcaseInfo) -> Result<Stage> {
        let container = progress.container()?;
        let execdir = task.workdir.join(EXEC_DIR);
        if execdir.exists() {
            fs::remove_dir_all(&execdir).context("cannot clear execdir")?;
        }
        fs::create_dir_all(&execdir).context("cannot create execdir")?;

        // Linked, never copied, so the comparison sees the exact downloaded bytes
        for part in [TestcasePart::Input, TestcasePart::Output] {
            let target = execdir.join(format!("testcase.{}", part.extension()));
            fs::hard_link(testcase_file(&task.workdir, testcase.rank, part), &target)
                .with_context(|| format!("cannot link {}", target.display()))?;
        }

        clear_exit_code(&task.workdir)?;
        let cmd = format!(
            "run/run {dir}/testcase.in {dir}/{out} ./program 2> {err}; echo $? > {code}; touch ./{sentinel}",
            dir = EXEC_DIR,
            out = PROGRAM_OUT,
            err = RUN_ERR,
            code = EXIT_CODE_FILE,
            sentinel = SENTINEL
        );
        let program_out = execdir.join(PROGRAM_OUT);
        let usage = self
            .guarded(
                task,
                container,
                &cmd,
                self.time_limit(task),
                Some(OutputWatch {
                    path: program_out.clone(),
                    limit: task.info.output_limit,
                }),
            )
            .await
            .context("run error")?;

        let exit_code = if usage.quota_exceeded() {
            -1
        } else {
            read_exit_code(&task.workdir)?
        };
        let decided = verdict::classify_run(&usage, exit_code);
        let meta = verdict::system_meta(decided.map_or("ok", |v| v.as_str()), &usage);
        fs::write(execdir.join(PROGRAM_META), &meta).context("cannot write program.meta")?;

        let Some(verdict) = decided else {
            return Ok(Stage::Judge(testcase, usage));
        };

        info!(
            testcase_id = testcase.testcase_id,
            rank = testcase.rank,
            verdict = %verdict,
            exit_code,
            "Run rejected"
        );
        let mut result = RunResult::new(
            task.info.judging_id,
            testcase.testcase_id,
            verdict,
            usage.used_time.as_secs_f64(),
        );
        result.output_run = read_capped(&program_out, task.info.output_limit.min(MAX_REPORTED_BYTES))?;
        result.output_error = read_capped(&task.workdir.join(RUN_ERR), MAX_REPORTED_BYTES)?;
        result.output_system = meta;
        self.endpoint.post_result(&result).await?;

        Ok(Stage::Cleanup(Outcome::Rejected {
            testcase_id: testcase.testcase_id,
            verdict,
        }))
    }

    async fn judge(&self, task: &Task, progress: &mut Progress, testcase: TestcaseInfo, run: RunInfo) -> Result<Stage> {
        let container = progress.container()?;
        clear_exit_code(&task.workdir)?;

        let mut cmd = format!(
            "compare/run {dir}/testcase.in {dir}/testcase.out {dir}",
            dir = EXEC_DIR
        );
        for arg in task.info.compare_args.split_whitespace() {
            cmd.push(' ');
            cmd.push_str(&quote(arg));
        }
        cmd.push_str(&format!(
            " < {}/{} 2> compare.err > {}; echo $? > {}; touch ./{}",
            EXEC_DIR, PROGRAM_OUT, COMPARE_OUT, EXIT_CODE_FILE, SENTINEL
        ));

        let usage = self
            .guarded(
                task,
                container,
                &cmd,
                self.settings.judge_time_limit,
                Some(OutputWatch {
                    path: task.workdir.join(COMPARE_OUT),
                    limit: task.info.output_limit,
                }),
            )
            .await
            .context("judge error")?;
        if usage.quota_exceeded() {
            bail!("compare script exceeded its quota: {:?}", usage);
        }

        let code = read_exit_code(&task.workdir)?;
        let verdict = verdict::classify_judge(code)
            .with_context(|| format!("judge error on testcase {}", testcase.testcase_id))?;

        let execdir = task.workdir.join(EXEC_DIR);
        let mut result = RunResult::new(
            task.info.judging_id,
            testcase.testcase_id,
            verdict,
            run.used_time.as_secs_f64(),
        );
        result.output_run = read_capped(&execdir.join(PROGRAM_OUT), task.info.output_limit.min(MAX_REPORTED_BYTES))?;
        result.output_error = read_capped(&task.workdir.join(RUN_ERR), MAX_REPORTED_BYTES)?;
        result.output_diff = read_capped(&task.workdir.join(COMPARE_OUT), MAX_REPORTED_BYTES)?;
        result.output_system = verdict::system_meta(verdict.as_str(), &run);
        self.endpoint.post_result(&result).await?;

        info!(
            testcase_id = testcase.testcase_id,
            rank = testcase.rank,
            verdict = %verdict,
            used_ms = run.used_time.as_millis() as u64,
            "Testcase judged"
        );

        // Kept for forensics, out of the way of the next run
        let archive = archive_name(&task.workdir, testcase.rank);
        fs::rename(&execdir, &archive)
            .with_context(|| format!("cannot rename execdir to {}", archive.display()))?;

        progress.judged += 1;
        Ok(Stage::NextTestcase)
    }

    async fn cleanup(&self, mut progress: Progress, outcome: Outcome) -> Outcome {
        if let Some(sandbox) = progress.sandbox.take() {
            let id = sandbox.id().to_string();
            match sandbox.release().await {
                Ok(()) => debug!(container = %id, "Sandbox removed"),
                Err(e) => warn!(container = %id, error = %format!("{:#}", e), "Sandbox cleanup failed"),
            }
        }
        outcome
    }
}
