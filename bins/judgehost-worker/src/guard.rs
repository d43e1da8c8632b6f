/// Resource Guard - Quota Enforcement for Sandboxed Executions
///
/// **Core Responsibility:**
/// Watch a running sandbox process until it signals completion through the
/// `done.lck` sentinel file, or until a quota is violated.
///
/// **Boundary:**
/// - Guard reports raw flags and measurements only
/// - Guard does NOT classify verdicts
/// - Guard is the only component allowed to kill the monitored process
///
/// **Tick order:**
/// sentinel, output size, memory sample, elapsed time. A sentinel seen in a
/// tick always wins over limit checks made in the same tick.

use crate::docker::ContainerRuntime;
use anyhow::{anyhow, bail, Context, Result};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Created by the in-container command when it has finished.
pub const SENTINEL: &str = "done.lck";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const TERMINATE_GRACE: Duration = Duration::from_millis(200);

/// Usage statistics and quota flags of one guarded execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunInfo {
    /// High-watermark in bytes.
    pub used_memory: u64,
    pub used_time: Duration,
    pub time_exceeded: bool,
    pub memory_exceeded: bool,
    pub output_exceeded: bool,
}

impl RunInfo {
    pub fn quota_exceeded(&self) -> bool {
        self.time_exceeded || self.memory_exceeded || self.output_exceeded
    }
}

/// A file whose size must stay within `limit` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputWatch {
    pub path: PathBuf,
    pub limit: u64,
}

/// What to watch and with which limits.
#[derive(Debug, Clone)]
pub struct GuardRequest<'a> {
    pub container: &'a str,
    /// Host-visible pid of the sandbox process.
    pub pid: u32,
    /// Host working directory where the sentinel appears.
    pub workdir: &'a Path,
    pub time_limit: Duration,
    pub output: Option<OutputWatch>,
}

/// A process on this host, addressed by pid.
#[derive(Debug)]
pub struct HostProcess {
    pid: u32,
}

impl HostProcess {
    pub fn attach(pid: u32) -> Result<Self> {
        if !Path::new(&format!("/proc/{}", pid)).exists() {
            bail!("run protect error: cannot attach process {}", pid);
        }
        Ok(Self { pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// False once the process is gone or only a zombie is left.
    pub fn is_alive(&self) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", self.pid)) {
            // state is the first field after the parenthesised command name
            Ok(stat) => match stat.rfind(')').and_then(|i| stat[i + 1..].split_whitespace().next()) {
                Some("Z") | Some("X") | None => false,
                Some(_) => true,
            },
            Err(_) => false,
        }
    }

    /// Memory charged to the process, in bytes.
    ///
    /// Prefers the memory usage of the process' cgroup, which for a container
    /// covers every process exec'd into it. Falls back to the resident set size.
    pub fn memory_usage(&self) -> Option<u64> {
        self.cgroup_memory().or_else(|| self.resident_memory())
    }

    fn cgroup_memory(&self) -> Option<u64> {
        let cgroups = fs::read_to_string(format!("/proc/{}/cgroup", self.pid)).ok()?;
        for line in cgroups.lines() {
            let mut fields = line.splitn(3, ':');
            let (_, controllers, path) = (fields.next()?, fields.next()?, fields.next()?);
            let file = if controllers.is_empty() {
                format!("/sys/fs/cgroup{}/memory.current", path)
            } else if controllers.split(',').any(|c| c == "memory") {
                format!("/sys/fs/cgroup/memory{}/memory.usage_in_bytes", path)
            } else {
                continue;
            };
            if let Ok(value) = fs::read_to_string(file) {
                if let Ok(bytes) = value.trim().parse() {
                    return Some(bytes);
                }
            }
        }
        None
    }

    fn resident_memory(&self) -> Option<u64> {
        let status = fs::read_to_string(format!("/proc/{}/status", self.pid)).ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line
            .trim_start_matches("VmRSS:")
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse()
            .ok()?;
        Some(kb * 1024)
    }

    /// SIGTERM, then SIGKILL if the process is still around after a short grace period.
    pub async fn terminate(&self) -> Result<()> {
        let pid = Pid::from_raw(self.pid as i32);
        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = self.pid, error = %e, "SIGTERM failed, killing"),
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        while self.is_alive() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.is_alive() {
            debug!(pid = self.pid, "Process survived SIGTERM, sending SIGKILL");
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(anyhow!(e)).context("run protect error: cannot kill process"),
            }
        }
        Ok(())
    }
}

struct InotifyFd(Inotify);

impl AsRawFd for InotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// Event-driven half of sentinel detection.
struct SentinelWatch {
    fd: AsyncFd<InotifyFd>,
}

impl SentinelWatch {
    fn arm(dir: &Path) -> Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .context("run protect error: cannot create watcher")?;
        inotify
            .add_watch(dir, AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO)
            .context("run protect error: cannot add watchpoint")?;
        let fd = AsyncFd::new(InotifyFd(inotify)).context("run protect error: cannot register watcher")?;
        debug!(dir = %dir.display(), "Watch armed");
        Ok(Self { fd })
    }

    /// Consume pending events, true if one of them created the sentinel.
    fn drain(&self) -> Result<bool> {
        let mut seen = false;
        loop {
            match self.fd.get_ref().0.read_events() {
                Ok(events) => {
                    seen |= events
                        .iter()
                        .any(|ev| ev.name.as_deref() == Some(OsStr::new(SENTINEL)));
                }
                Err(Errno::EAGAIN) => return Ok(seen),
                Err(e) => return Err(anyhow!(e)).context("run protect error: cannot read watch events"),
            }
        }
    }

    async fn wait(&self) -> Result<()> {
        let mut ready = self.fd.readable().await?;
        ready.clear_ready();
        Ok(())
    }
}

fn output_size(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context("run protect error: cannot stat outputfile"),
    }
}

fn remove_sentinel(workdir: &Path) -> Result<()> {
    match fs::remove_file(workdir.join(SENTINEL)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("cannot remove done.lck [ABORT!]"),
    }
}

#[derive(Debug, Clone)]
pub struct Guard {
    poll_interval: Duration,
}

impl Default for Guard {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl Guard {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Watch one execution until completion, a quota violation, or a monitoring error.
    pub async fn watch(&self, runtime: &dyn ContainerRuntime, req: GuardRequest<'_>) -> Result<RunInfo> {
        let process = HostProcess::attach(req.pid)?;
        let sentinel = req.workdir.join(SENTINEL);
        let start = Instant::now();
        let deadline = start + req.time_limit;
        let mut info = RunInfo::default();
        let mut detected = None;

        // Arm first, then the first tick polls for a sentinel that beat the watch
        let watch = SentinelWatch::arm(req.workdir)?;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let completed = loop {
            if watch.drain()? || sentinel.exists() {
                break true;
            }

            if let Some(output) = &req.output {
                if let Some(size) = output_size(&output.path)? {
                    if size > output.limit {
                        debug!(size, limit = output.limit, "Output limit exceeded");
                        info.output_exceeded = true;
                        break false;
                    }
                }
            }

            match process.memory_usage() {
                Some(used) => info.used_memory = info.used_memory.max(used),
                None if !process.is_alive() => {
                    // The sandbox root died under us; only an OOM kill explains that
                    let state = runtime.inspect(req.container).await?;
                    if state.oom_killed {
                        info.memory_exceeded = true;
                        break false;
                    }
                    bail!("run protect error: sandbox process {} exited unexpectedly", process.pid());
                }
                None => {}
            }

            if Instant::now() >= deadline {
                let elapsed = start.elapsed();
                detected = Some(elapsed);
                info.time_exceeded = true;
                debug!(
                    used_ms = elapsed.as_millis() as u64,
                    limit_ms = req.time_limit.as_millis() as u64,
                    "Hard time limit exceeded, terminating"
                );
                process.terminate().await?;
                break false;
            }

            tokio::select! {
                res = watch.wait() => res?,
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        };

        // Time of detection, not of the kill that followed
        info.used_time = detected.unwrap_or_else(|| start.elapsed());
        if completed {
            info.memory_exceeded = runtime.inspect(req.container).await?.oom_killed;
        }
        remove_sentinel(req.workdir)?;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;
    use tokio::process::{Child, Command};

    fn spawn(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sh")
    }

    fn request<'a>(dir: &'a Path, child: &Child, time_limit: Duration) -> GuardRequest<'a> {
        GuardRequest {
            container: "fake",
            pid: child.id().unwrap(),
            workdir: dir,
            time_limit,
            output: None,
        }
    }

    #[tokio::test]
    async fn test_sentinel_completes_run() {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn(&format!("sleep 0.2; touch {}/done.lck; sleep 5", dir.path().display()));
        let runtime = FakeRuntime::new();

        let info = Guard::default()
            .watch(&runtime, request(dir.path(), &child, Duration::from_secs(3)))
            .await
            .unwrap();

        assert!(!info.quota_exceeded());
        assert!(info.used_time >= Duration::from_millis(200));
        assert!(info.used_time < Duration::from_secs(2));
        assert!(!dir.path().join(SENTINEL).exists(), "sentinel must be consumed");
    }

    #[tokio::test]
    async fn test_sentinel_before_watch_is_seen() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SENTINEL), b"").unwrap();
        let child = spawn("sleep 5");
        let runtime = FakeRuntime::new();

        let info = Guard::new(Duration::from_secs(10))
            .watch(&runtime, request(dir.path(), &child, Duration::from_secs(3)))
            .await
            .unwrap();

        assert!(!info.quota_exceeded());
        assert!(info.used_time < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_output_limit_aborts_without_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("program.out");
        let mut child = spawn(&format!(
            "head -c 1001 /dev/zero > {}; sleep 10; touch {}/done.lck",
            out.display(),
            dir.path().display()
        ));
        let runtime = FakeRuntime::new();
        let mut req = request(dir.path(), &child, Duration::from_secs(3));
        req.output = Some(OutputWatch { path: out, limit: 1000 });

        let info = Guard::default().watch(&runtime, req).await.unwrap();

        assert!(info.output_exceeded);
        assert!(!info.time_exceeded);
        assert!(info.used_time < Duration::from_secs(2));
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_output_at_limit_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("program.out");
        let child = spawn(&format!(
            "head -c 1000 /dev/zero > {}; touch {}/done.lck; sleep 5",
            out.display(),
            dir.path().display()
        ));
        let runtime = FakeRuntime::new();
        let mut req = request(dir.path(), &child, Duration::from_secs(3));
        req.output = Some(OutputWatch { path: out, limit: 1000 });

        let info = Guard::default().watch(&runtime, req).await.unwrap();
        assert!(!info.output_exceeded);
    }

    #[tokio::test]
    async fn test_time_limit_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn(&format!("sleep 5; touch {}/done.lck", dir.path().display()));
        let runtime = FakeRuntime::new();

        let info = Guard::default()
            .watch(&runtime, request(dir.path(), &child, Duration::from_millis(300)))
            .await
            .unwrap();

        assert!(info.time_exceeded);
        assert!(!info.output_exceeded);
        assert!(info.used_time >= Duration::from_millis(300));
        assert!(info.used_time < Duration::from_secs(2));

        let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .expect("process must be dead")
            .unwrap();
        assert!(!status.success());
        assert!(!dir.path().join(SENTINEL).exists());
    }

    #[tokio::test]
    async fn test_used_time_is_taken_at_detection() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn("trap '' TERM; while :; do sleep 0.05; done");
        let runtime = FakeRuntime::new();

        let info = Guard::default()
            .watch(&runtime, request(dir.path(), &child, Duration::from_millis(300)))
            .await
            .unwrap();

        assert!(info.time_exceeded);
        assert!(info.used_time >= Duration::from_millis(300));
        assert!(
            info.used_time < Duration::from_millis(400),
            "used_time {:?} includes the kill grace",
            info.used_time
        );
        let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .expect("process ignoring TERM must be killed")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_sentinel_wins_over_output_in_same_tick() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("program.out");
        std::fs::write(&out, vec![b'x'; 2000]).unwrap();
        std::fs::write(dir.path().join(SENTINEL), b"").unwrap();
        let child = spawn("sleep 5");
        let runtime = FakeRuntime::new();
        let mut req = request(dir.path(), &child, Duration::from_secs(3));
        req.output = Some(OutputWatch { path: out, limit: 1000 });

        let info = Guard::default().watch(&runtime, req).await.unwrap();

        assert!(!info.output_exceeded);
        assert!(!info.quota_exceeded());
    }

    #[tokio::test]
    async fn test_sentinel_wins_over_expired_deadline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SENTINEL), b"").unwrap();
        let mut child = spawn("sleep 5");
        let runtime = FakeRuntime::new();

        let info = Guard::default()
            .watch(&runtime, request(dir.path(), &child, Duration::ZERO))
            .await
            .unwrap();

        assert!(!info.time_exceeded);
        assert!(!info.quota_exceeded());
        assert!(child.try_wait().unwrap().is_none(), "completed run must not be killed");
    }

    #[tokio::test]
    async fn test_oom_flag_read_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn(&format!("touch {}/done.lck; sleep 5", dir.path().display()));
        let runtime = FakeRuntime::new();
        runtime.set_oom_killed(true);

        let info = Guard::default()
            .watch(&runtime, request(dir.path(), &child, Duration::from_secs(3)))
            .await
            .unwrap();
        assert!(info.memory_exceeded);
        assert!(!info.time_exceeded);
    }

    #[tokio::test]
    async fn test_memory_high_watermark_sampled() {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn(&format!("sleep 0.1; touch {}/done.lck; sleep 5", dir.path().display()));
        let runtime = FakeRuntime::new();

        let info = Guard::default()
            .watch(&runtime, request(dir.path(), &child, Duration::from_secs(3)))
            .await
            .unwrap();
        assert!(info.used_memory > 0);
    }

    #[test]
    fn test_attach_missing_process() {
        assert!(HostProcess::attach(u32::MAX - 1).is_err());
    }
}
