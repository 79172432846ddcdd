//! Spawning and supervising worker processes.
//!
//! Workers are re-invocations of the host executable with the hidden
//! `__worker` argument. Isolation is the point: a decoder segfault or an
//! out-of-memory kill takes down the worker, not the batch — the supervisor
//! observes the dead pipe, collects the exit status, and reports a normal
//! per-file stage failure.
//!
//! On Unix the spawner can apply an address-space cap to each worker via
//! `setrlimit`, so a decompression bomb hits the cap instead of the host's
//! memory.

use crate::error::{ComicError, FileError, Stage};
use crate::job::CancelFlag;
use crate::worker::protocol::{decode_line, encode_line, TaskOutput, WorkerEvent, WorkerTask};
use crate::worker::WORKER_ARG;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_stream::wrappers::LinesStream;
use tracing::warn;

/// Factory for worker processes.
///
/// The program defaults to the current executable; tests override it to
/// exercise crash handling with arbitrary binaries.
#[derive(Debug, Clone)]
pub struct WorkerSpawner {
    program: PathBuf,
    memory_limit_mb: Option<u64>,
}

impl WorkerSpawner {
    pub fn from_current_exe(memory_limit_mb: Option<u64>) -> Result<Self, ComicError> {
        let program = std::env::current_exe().map_err(|e| {
            ComicError::Internal(format!("cannot locate own executable to spawn workers: {e}"))
        })?;
        Ok(Self {
            program,
            memory_limit_mb,
        })
    }

    pub fn with_program(program: impl Into<PathBuf>, memory_limit_mb: Option<u64>) -> Self {
        Self {
            program: program.into(),
            memory_limit_mb,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(WORKER_ARG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        if let Some(limit_mb) = self.memory_limit_mb {
            let bytes = limit_mb.saturating_mul(1024 * 1024) as libc::rlim_t;
            unsafe {
                cmd.pre_exec(move || {
                    let limit = libc::rlimit {
                        rlim_cur: bytes,
                        rlim_max: bytes,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        cmd
    }
}

/// Terminal result of one supervised task.
#[derive(Debug)]
pub enum TaskTerminal {
    Done(TaskOutput),
    Failed(FileError),
    Cancelled,
}

/// A live worker process with its stdin/stdout protocol channel.
///
/// Long-lived for the transform pool; one-shot callers use [`run_one_shot`].
pub struct WorkerChannel {
    child: Child,
    stdin: ChildStdin,
    events: LinesStream<BufReader<ChildStdout>>,
}

impl WorkerChannel {
    pub async fn spawn(spawner: &WorkerSpawner) -> std::io::Result<Self> {
        let mut child = spawner.command().spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdout not captured")
        })?;
        Ok(Self {
            child,
            stdin,
            events: LinesStream::new(BufReader::new(stdout).lines()),
        })
    }

    async fn send(&mut self, task: &WorkerTask) -> std::io::Result<()> {
        let line = encode_line(task)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }

    /// Run one task to its terminal event.
    ///
    /// Non-terminal events are forwarded to `on_event`. If the cancel flag
    /// flips while the task runs, a single `Cancel` message is forwarded to
    /// the worker, which answers with a `Cancelled` terminal at its next
    /// page boundary. A worker that dies without a terminal event yields a
    /// synthesized crash failure; the channel must not be reused after that.
    ///
    /// Every event is checked against the dispatched task's file index, so a
    /// stale line from an earlier task (pool workers are reused across files)
    /// can never be mistaken for this task's terminal.
    pub async fn run_task(
        &mut self,
        subject: &Path,
        task: WorkerTask,
        cancel: &CancelFlag,
        on_event: &mut (dyn FnMut(&WorkerEvent) + Send),
    ) -> TaskTerminal {
        let stage = task.stage().unwrap_or(Stage::Extract);
        let file_index = task.file_index();
        if self.send(&task).await.is_err() {
            return self.synthesize_crash(stage, subject).await;
        }

        // Reading with a short timeout keeps the loop responsive to the
        // cancel flag without a second task; `next_line` is cancel-safe.
        let mut cancel_sent = false;
        loop {
            if cancel.is_cancelled() && !cancel_sent {
                cancel_sent = true;
                if self.send(&WorkerTask::Cancel).await.is_err() {
                    return self.synthesize_crash(stage, subject).await;
                }
            }
            let line = match tokio::time::timeout(Duration::from_millis(50), self.events.next())
                .await
            {
                Err(_) => continue,
                Ok(Some(Err(_))) | Ok(None) => {
                    return self.synthesize_crash(stage, subject).await
                }
                Ok(Some(Ok(line))) => line,
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_line::<WorkerEvent>(&line) {
                Ok(event) if !belongs_to(&event, file_index) => {
                    warn!(
                        "ignoring stale worker event for file {} while running file {:?}",
                        event.file_index(),
                        file_index
                    );
                }
                Ok(WorkerEvent::Done { output, .. }) => return TaskTerminal::Done(output),
                Ok(WorkerEvent::Failed { error, .. }) => return TaskTerminal::Failed(error),
                Ok(WorkerEvent::Cancelled { .. }) => return TaskTerminal::Cancelled,
                Ok(event) => on_event(&event),
                Err(e) => warn!("dropping garbled worker event: {e}"),
            }
        }
    }

    async fn synthesize_crash(&mut self, stage: Stage, subject: &Path) -> TaskTerminal {
        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("cannot collect worker exit status: {e}");
                None
            }
        };
        TaskTerminal::Failed(FileError::worker_crash(stage, subject.to_path_buf(), code))
    }

    /// Ask the worker to exit and reap it.
    pub async fn shutdown(mut self) {
        let _ = self.send(&WorkerTask::Shutdown).await;
        drop(self.stdin);
        let _ = self.child.wait().await;
    }
}

/// Spawn a worker for a single task and tear it down afterwards.
///
/// Extraction and packaging run this way: the per-task process cost is
/// dwarfed by the decode work, and a fresh address space per file is the
/// whole point of isolation.
pub async fn run_one_shot(
    spawner: &WorkerSpawner,
    subject: &Path,
    task: WorkerTask,
    cancel: &CancelFlag,
    on_event: &mut (dyn FnMut(&WorkerEvent) + Send),
) -> TaskTerminal {
    let stage = task.stage().unwrap_or(Stage::Extract);
    let mut channel = match WorkerChannel::spawn(spawner).await {
        Ok(channel) => channel,
        Err(e) => return TaskTerminal::Failed(spawn_failure(stage, subject, &e)),
    };
    let terminal = channel.run_task(subject, task, cancel, on_event).await;
    channel.shutdown().await;
    terminal
}

/// Whether an event carries the file index of the task being supervised.
/// Tasks without an index (`Cancel`, `Shutdown`) accept any event.
fn belongs_to(event: &WorkerEvent, file_index: Option<usize>) -> bool {
    file_index.map_or(true, |index| event.file_index() == index)
}

pub(crate) fn spawn_failure(stage: Stage, subject: &Path, err: &std::io::Error) -> FileError {
    let detail = format!("cannot start worker process: {err}");
    match stage {
        Stage::Extract => FileError::Extraction {
            path: subject.to_path_buf(),
            detail,
            low_disk: false,
        },
        Stage::Transform => FileError::Transform {
            image: subject.to_path_buf(),
            detail,
        },
        Stage::Package => FileError::Packaging {
            output: subject.to_path_buf(),
            detail,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::EmbeddedResolution;
    use crate::pipeline::ExtractRequest;

    fn extract_task() -> WorkerTask {
        WorkerTask::Extract {
            file_index: 0,
            request: ExtractRequest {
                input: PathBuf::from("in.cbz"),
                kind: crate::detect::ContainerKind::Zip,
                dest: PathBuf::from("/nonexistent"),
                embedded_resolution: EmbeddedResolution::default(),
                dpi: 150,
                password: None,
                keep_comic_info: true,
            },
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_exit_without_terminal_becomes_a_crash_failure() {
        let spawner = WorkerSpawner::with_program("false", None);
        let terminal = run_one_shot(
            &spawner,
            Path::new("in.cbz"),
            extract_task(),
            &CancelFlag::new(),
            &mut |_| {},
        )
        .await;
        let TaskTerminal::Failed(error) = terminal else {
            panic!("expected a synthesized failure");
        };
        assert_eq!(error.stage(), Stage::Extract);
        assert!(error.to_string().contains("worker"), "got: {error}");
    }

    #[test]
    fn events_for_other_files_do_not_belong_to_a_task() {
        let stale = WorkerEvent::Done {
            file_index: 9,
            output: TaskOutput::Extracted { pages: 1 },
        };
        assert!(!belongs_to(&stale, Some(0)));
        assert!(belongs_to(&stale, Some(9)));
        // Session messages carry no index and accept anything.
        assert!(belongs_to(&stale, None));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_terminal_from_another_file_is_ignored() {
        use std::os::unix::fs::PermissionsExt;

        // A scripted worker that answers with a terminal for the wrong file
        // before the right one, as a reused pool worker with a buffered
        // leftover line would.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("scripted-worker.sh");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "read _task\n",
                "echo '{\"type\":\"done\",\"file_index\":9,\"output\":{\"task\":\"extracted\",\"pages\":1}}'\n",
                "echo '{\"type\":\"done\",\"file_index\":0,\"output\":{\"task\":\"extracted\",\"pages\":3}}'\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spawner = WorkerSpawner::with_program(&script, None);
        let terminal = run_one_shot(
            &spawner,
            Path::new("in.cbz"),
            extract_task(),
            &CancelFlag::new(),
            &mut |_| {},
        )
        .await;
        let TaskTerminal::Done(TaskOutput::Extracted { pages }) = terminal else {
            panic!("expected the matching terminal, got {terminal:?}");
        };
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn unspawnable_program_reports_a_stage_failure() {
        let spawner = WorkerSpawner::with_program("/nonexistent/comicmill-worker", None);
        let terminal = run_one_shot(
            &spawner,
            Path::new("in.cbz"),
            extract_task(),
            &CancelFlag::new(),
            &mut |_| {},
        )
        .await;
        let TaskTerminal::Failed(error) = terminal else {
            panic!("expected a spawn failure");
        };
        assert!(error.to_string().contains("cannot start worker"), "got: {error}");
    }
}
