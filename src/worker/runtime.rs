//! The worker-process side of the protocol.
//!
//! [`worker_main`] is invoked by the binary when it sees the hidden worker
//! argument. The loop is synchronous: one task at a time off stdin, stage
//! primitives executed directly, events flushed line-by-line to stdout. A
//! dedicated reader thread feeds tasks into a channel so that `Cancel`
//! messages sent mid-task are visible to the running stage's cancellation
//! probe.
//!
//! Any stdout write failure means the supervisor is gone; the worker stops
//! quietly rather than erroring into a closed pipe.

use crate::error::Stage;
use crate::pipeline::{
    run_extract, run_package, transform_image, ExtractOutcome, ExtractProgress, PackageOutcome,
    PackageProgress,
};
use crate::worker::protocol::{decode_line, encode_line, TaskOutput, WorkerEvent, WorkerTask};
use std::cell::Cell;
use std::io::{BufRead, Write};
use std::sync::mpsc::{Receiver, TryRecvError};

/// Run the worker loop until shutdown or supervisor hangup.
pub fn worker_main() -> std::process::ExitCode {
    let (tx, rx) = std::sync::mpsc::channel::<WorkerTask>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            // Garbled lines are dropped; the supervisor times nothing on
            // them and the next well-formed task resyncs the stream.
            if let Ok(task) = decode_line::<WorkerTask>(&line) {
                if tx.send(task).is_err() {
                    break;
                }
            }
        }
    });

    let mut out = std::io::stdout();
    loop {
        match rx.recv() {
            // Supervisor hung up without a Shutdown; treat it the same.
            Err(_) => break,
            Ok(WorkerTask::Shutdown) => break,
            // A Cancel between tasks refers to work already finished.
            Ok(WorkerTask::Cancel) => continue,
            Ok(task) => {
                if execute(task, &rx, &mut out).is_err() {
                    break;
                }
            }
        }
    }
    std::process::ExitCode::SUCCESS
}

fn emit<W: Write>(out: &mut W, event: &WorkerEvent) -> std::io::Result<()> {
    let line = encode_line(event)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writeln!(out, "{line}")?;
    out.flush()
}

fn execute(
    task: WorkerTask,
    tasks: &Receiver<WorkerTask>,
    out: &mut std::io::Stdout,
) -> std::io::Result<()> {
    match task {
        WorkerTask::Extract {
            file_index,
            request,
        } => {
            let mut sink = WireSink::new(out, tasks, file_index, Stage::Extract);
            let result = run_extract(&request, &mut sink);
            match result {
                Ok(ExtractOutcome::Completed { pages }) => emit(
                    out,
                    &WorkerEvent::Done {
                        file_index,
                        output: TaskOutput::Extracted { pages },
                    },
                ),
                Ok(ExtractOutcome::Cancelled) => {
                    emit(out, &WorkerEvent::Cancelled { file_index })
                }
                Err(error) => emit(out, &WorkerEvent::Failed { file_index, error }),
            }
        }
        WorkerTask::TransformImage {
            file_index,
            image,
            plan,
        } => match transform_image(&image, &plan) {
            Ok(image) => emit(
                out,
                &WorkerEvent::Done {
                    file_index,
                    output: TaskOutput::Transformed { image },
                },
            ),
            Err(error) => emit(out, &WorkerEvent::Failed { file_index, error }),
        },
        WorkerTask::Package {
            file_index,
            request,
        } => {
            let mut sink = WireSink::new(out, tasks, file_index, Stage::Package);
            let result = run_package(&request, &mut sink);
            match result {
                Ok(PackageOutcome::Written(outputs)) => emit(
                    out,
                    &WorkerEvent::Done {
                        file_index,
                        output: TaskOutput::Packaged { outputs },
                    },
                ),
                Ok(PackageOutcome::Skipped(existing)) => emit(
                    out,
                    &WorkerEvent::Done {
                        file_index,
                        output: TaskOutput::PackageSkipped { existing },
                    },
                ),
                Ok(PackageOutcome::Cancelled) => {
                    emit(out, &WorkerEvent::Cancelled { file_index })
                }
                Err(error) => emit(out, &WorkerEvent::Failed { file_index, error }),
            }
        }
        // Handled by the main loop.
        WorkerTask::Cancel | WorkerTask::Shutdown => Ok(()),
    }
}

/// Adapts stage progress onto wire events and the task channel onto the
/// stages' cancellation probes.
struct WireSink<'a, W: Write> {
    out: &'a mut W,
    tasks: &'a Receiver<WorkerTask>,
    file_index: usize,
    stage: Stage,
    cancelled: Cell<bool>,
    /// Set once a wire write fails; reported as cancellation so the stage
    /// unwinds promptly.
    broken: bool,
}

impl<'a, W: Write> WireSink<'a, W> {
    fn new(out: &'a mut W, tasks: &'a Receiver<WorkerTask>, file_index: usize, stage: Stage) -> Self {
        Self {
            out,
            tasks,
            file_index,
            stage,
            cancelled: Cell::new(false),
            broken: false,
        }
    }

    fn progress(&mut self, current: usize, total: usize) {
        let event = WorkerEvent::Progress {
            file_index: self.file_index,
            stage: self.stage,
            current,
            total,
        };
        if emit(self.out, &event).is_err() {
            self.broken = true;
        }
    }

    fn log(&mut self, line: &str) {
        let event = WorkerEvent::Log {
            file_index: self.file_index,
            line: line.to_string(),
        };
        if emit(self.out, &event).is_err() {
            self.broken = true;
        }
    }

    fn poll_cancel(&self) -> bool {
        if self.broken {
            return true;
        }
        loop {
            match self.tasks.try_recv() {
                Ok(WorkerTask::Cancel | WorkerTask::Shutdown) => self.cancelled.set(true),
                // Protocol is one task in flight; anything else is garbage.
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.cancelled.set(true);
                    break;
                }
            }
        }
        self.cancelled.get()
    }
}

impl<W: Write> ExtractProgress for WireSink<'_, W> {
    fn on_page(&mut self, current: usize, total: usize) {
        self.progress(current, total);
    }
    fn on_log(&mut self, line: &str) {
        self.log(line);
    }
    fn should_cancel(&self) -> bool {
        self.poll_cancel()
    }
}

impl<W: Write> PackageProgress for WireSink<'_, W> {
    fn on_chunk(&mut self, current: usize, total: usize) {
        self.progress(current, total);
    }
    fn should_cancel(&self) -> bool {
        self.poll_cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_emits_progress_lines() {
        let (_tx, rx) = std::sync::mpsc::channel::<WorkerTask>();
        let mut buf = Vec::new();
        let mut sink = WireSink::new(&mut buf, &rx, 4, Stage::Extract);
        sink.on_page(1, 10);
        sink.on_log("extracting");
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        let progress: WorkerEvent = decode_line(lines.next().unwrap()).unwrap();
        assert!(matches!(
            progress,
            WorkerEvent::Progress {
                file_index: 4,
                current: 1,
                total: 10,
                ..
            }
        ));
        let log: WorkerEvent = decode_line(lines.next().unwrap()).unwrap();
        assert!(matches!(log, WorkerEvent::Log { .. }));
    }

    #[test]
    fn cancel_message_trips_the_probe_and_sticks() {
        let (tx, rx) = std::sync::mpsc::channel::<WorkerTask>();
        let mut buf = Vec::new();
        let sink = WireSink::new(&mut buf, &rx, 0, Stage::Package);
        assert!(!sink.poll_cancel());
        tx.send(WorkerTask::Cancel).unwrap();
        assert!(sink.poll_cancel());
        // Once cancelled, stays cancelled even with an empty channel.
        assert!(sink.poll_cancel());
    }

    #[test]
    fn supervisor_hangup_reads_as_cancellation() {
        let (tx, rx) = std::sync::mpsc::channel::<WorkerTask>();
        drop(tx);
        let mut buf = Vec::new();
        let sink = WireSink::new(&mut buf, &rx, 0, Stage::Extract);
        assert!(sink.poll_cancel());
    }
}
