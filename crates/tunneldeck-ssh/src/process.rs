//! Child processes bound to their own process group (POSIX) or job object
//! (Windows) so that killing one takes every descendant with it.

use crate::error::{Result, SshError};
use crate::event::{CapturedOutput, EngineEvent, EventSender, ProcessTag};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long the exit notification waits for the output readers to drain.
const READER_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program and arguments as a shell-like string. Environment values are not shown.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| {
                if a.is_empty() || a.chars().any(char::is_whitespace) {
                    format!("\"{}\"", a)
                } else {
                    a.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)));
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// A running tunnel client as seen by the connector.
#[async_trait]
pub trait TunnelProcess: Send {
    fn pid(&self) -> Option<u32>;

    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Ask the whole process tree to exit.
    fn terminate(&mut self) -> Result<()>;

    /// Kill the whole process tree immediately.
    fn force_kill(&mut self) -> Result<()>;

    /// Returns true once the process has exited, false on timeout.
    async fn wait_exit(&mut self, timeout: Duration) -> bool;
}

/// Starts tunnel processes. Output and exit are reported through `events`.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        command: &CommandLine,
        tag: ProcessTag,
        events: EventSender,
    ) -> Result<Box<dyn TunnelProcess>>;

    /// Run a program to completion and return its combined output.
    async fn run_captured(&self, command: &CommandLine, timeout: Duration) -> Result<CapturedOutput>;
}

/// Launcher backed by real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

#[async_trait]
impl Launcher for SystemLauncher {
    fn launch(
        &self,
        command: &CommandLine,
        tag: ProcessTag,
        events: EventSender,
    ) -> Result<Box<dyn TunnelProcess>> {
        Ok(Box::new(ManagedProcess::spawn(command, tag, events)?))
    }

    async fn run_captured(&self, command: &CommandLine, timeout: Duration) -> Result<CapturedOutput> {
        run_captured(command, timeout).await
    }
}

pub struct ManagedProcess {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    exited: watch::Receiver<bool>,
    #[cfg(windows)]
    job: Option<job::Job>,
}

impl ManagedProcess {
    pub fn spawn(command: &CommandLine, tag: ProcessTag, events: EventSender) -> Result<Self> {
        let mut cmd = command.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| SshError::SpawnFailed {
            program: command.program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        debug!("Spawned {} (PID: {:?})", command.program, pid);

        #[cfg(windows)]
        let job = match job::Job::assign(&child) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("Failed to bind PID {:?} to a job object: {}", pid, e);
                None
            }
        };

        let stdin = child.stdin.take();
        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|s| spawn_reader(s, tag, events.clone())),
            child.stderr.take().map(|s| spawn_reader(s, tag, events.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (exit_tx, exit_rx) = watch::channel(false);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Waiting on PID {:?} failed: {}", pid, e);
                    None
                }
            };
            let _ = exit_tx.send(true);
            for reader in readers {
                let _ = tokio::time::timeout(READER_DRAIN, reader).await;
            }
            let _ = events.send(EngineEvent::Exited { tag, code });
        });

        Ok(Self {
            pid,
            stdin,
            exited: exit_rx,
            #[cfg(windows)]
            job,
        })
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// SIGTERM (or SIGKILL when `force`) to the whole process group.
    #[cfg(unix)]
    fn kill_tree(&self, force: bool) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        // The child leads its own group, so its PID is the PGID.
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SshError::KillFailed(format!(
                "{:?} to process group {}: {}",
                signal, pid, e
            ))),
        }
    }

    /// Job objects have no graceful variant; both paths terminate the job.
    #[cfg(windows)]
    fn kill_tree(&self, _force: bool) -> Result<()> {
        match &self.job {
            Some(job) => job
                .terminate()
                .map_err(|e| SshError::KillFailed(format!("job of PID {:?}: {}", self.pid, e))),
            None => Err(SshError::KillFailed(format!(
                "PID {:?} is not bound to a job object",
                self.pid
            ))),
        }
    }
}

#[async_trait]
impl TunnelProcess for ManagedProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(SshError::StdinClosed)?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        self.kill_tree(false)
    }

    fn force_kill(&mut self) -> Result<()> {
        self.kill_tree(true)
    }

    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        if self.has_exited() {
            return true;
        }
        matches!(
            tokio::time::timeout(timeout, self.exited.wait_for(|exited| *exited)).await,
            Ok(Ok(_))
        )
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.stdin.take();
        // Helpers the client started may outlive it in the same group or job.
        debug!(
            "Dropping process {:?} (exited: {}), killing its group",
            self.pid,
            self.has_exited()
        );
        if let Err(e) = self.force_kill() {
            debug!("Kill on drop failed: {}", e);
        }
    }
}

fn spawn_reader<R>(mut reader: R, tag: ProcessTag, events: EventSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if events.send(EngineEvent::Output { tag, data }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Output reader for {} stopped: {}", tag.node, e);
                    break;
                }
            }
        }
    })
}

/// Run `command` to completion, killing it when `timeout` elapses.
pub async fn run_captured(command: &CommandLine, timeout: Duration) -> Result<CapturedOutput> {
    let mut cmd = command.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| SshError::SpawnFailed {
        program: command.program.clone(),
        reason: e.to_string(),
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            Ok(CapturedOutput {
                code: out.status.code(),
                output,
            })
        }
        Ok(Err(e)) => Err(SshError::Io(e)),
        Err(_) => Err(SshError::Timeout),
    }
}

#[cfg(windows)]
mod job {
    use std::io;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };

    /// Job object that kills its processes when the last handle closes.
    pub struct Job(HANDLE);

    impl Job {
        pub fn assign(child: &tokio::process::Child) -> io::Result<Self> {
            let process = child
                .raw_handle()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "process already reaped"))?;

            // SAFETY: null attributes and name are valid arguments; the
            // returned handle is owned by `Job` and closed in Drop.
            let handle = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
            if handle == 0 {
                return Err(io::Error::last_os_error());
            }
            let job = Job(handle);

            // SAFETY: `info` is a fully initialised struct of the size passed.
            let ok = unsafe {
                let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
                info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
                SetInformationJobObject(
                    job.0,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const std::ffi::c_void,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: both handles are live; the child handle is borrowed.
            if unsafe { AssignProcessToJobObject(job.0, process as HANDLE) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(job)
        }

        pub fn terminate(&self) -> io::Result<()> {
            // SAFETY: the handle stays valid for the lifetime of `self`.
            if unsafe { TerminateJobObject(self.0, 1) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl Drop for Job {
        fn drop(&mut self) {
            // SAFETY: the handle was created by CreateJobObjectW and is closed once.
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn sh(script: &str) -> CommandLine {
        let mut cmd = CommandLine::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn tag() -> ProcessTag {
        ProcessTag {
            node: Uuid::new_v4(),
            generation: 1,
        }
    }

    #[test]
    fn test_display_quotes_spaces() {
        let mut cmd = CommandLine::new("plink");
        cmd.args(["-v", "my host", ""]).env("SSHPASS", "secret");
        assert_eq!(cmd.display(), "plink -v \"my host\" \"\"");
    }

    #[tokio::test]
    async fn test_run_captured_combines_streams() {
        let out = run_captured(&sh("echo out; echo err 1>&2; exit 3"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[tokio::test]
    async fn test_run_captured_times_out() {
        let result = run_captured(&sh("sleep 5"), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(SshError::Timeout)));
    }

    #[tokio::test]
    async fn test_spawn_failure_names_program() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ManagedProcess::spawn(&CommandLine::new("/nonexistent/tunnel-client"), tag(), tx);
        assert!(matches!(result, Err(SshError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_write_and_exit_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = tag();
        let mut process = ManagedProcess::spawn(&sh("read line; echo got $line"), tag, tx).unwrap();
        process.write(b"hello\n").await.unwrap();

        let mut output = String::new();
        loop {
            match rx.recv().await.unwrap() {
                EngineEvent::Output { tag: t, data } => {
                    assert_eq!(t, tag);
                    output.push_str(&data);
                }
                EngineEvent::Exited { tag: t, code } => {
                    assert_eq!(t, tag);
                    assert_eq!(code, Some(0));
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(output.contains("got hello"));
        assert!(process.wait_exit(Duration::from_secs(1)).await);
    }

    /// Read output events until the first line, a PID echoed by the script.
    async fn read_pid(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> i32 {
        let mut output = String::new();
        loop {
            match rx.recv().await.unwrap() {
                EngineEvent::Output { data, .. } => {
                    output.push_str(&data);
                    if let Some((line, _)) = output.split_once('\n') {
                        return line.trim().parse().unwrap();
                    }
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    async fn wait_for_exit_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) {
        loop {
            if let EngineEvent::Exited { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
    }

    /// Zombies count as gone: nobody may be reaping in a container.
    fn is_alive(pid: i32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid), None).is_err() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().chars().next() != Some('Z'))
                .unwrap_or(true),
            Err(_) => true,
        }
    }

    async fn gone_within(pid: i32, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if !is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        !is_alive(pid)
    }

    #[tokio::test]
    async fn test_terminate_kills_group() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process =
            ManagedProcess::spawn(&sh("sleep 30 & echo $!; sleep 30; wait"), tag(), tx).unwrap();
        let helper = read_pid(&mut rx).await;
        assert!(is_alive(helper));
        assert!(!process.wait_exit(Duration::from_millis(50)).await);

        process.terminate().unwrap();
        assert!(process.wait_exit(Duration::from_secs(5)).await);
        wait_for_exit_event(&mut rx).await;
        assert!(gone_within(helper, Duration::from_secs(2)).await);
        // a second kill of a dead group is not an error
        assert!(process.force_kill().is_ok());
    }

    #[tokio::test]
    async fn test_drop_kills_group_after_leader_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let process = ManagedProcess::spawn(&sh("sleep 30 & echo $!; exit 0"), tag(), tx).unwrap();
        let helper = read_pid(&mut rx).await;
        wait_for_exit_event(&mut rx).await;
        assert!(is_alive(helper));

        drop(process);
        assert!(gone_within(helper, Duration::from_secs(2)).await);
    }
}
