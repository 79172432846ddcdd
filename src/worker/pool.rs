//! Executing a file's page transforms, sequentially or through a pool.
//!
//! Four execution shapes share one entry point, [`run_transform_stage`]:
//! sequential or pooled, crossed with isolated worker processes or
//! in-process `spawn_blocking`. Pooled runs complete pages out of order;
//! progress therefore reports completions over the page total, never
//! dispatch positions.
//!
//! A single failed page fails the whole file — the pool sets an internal
//! halt flag so idle workers stop pulling, and the first failure is the one
//! reported.

use crate::error::{FileError, Stage};
use crate::job::CancelFlag;
use crate::options::TransformExecution;
use crate::pipeline::transform::{transform_image, TransformPlan};
use crate::worker::protocol::WorkerTask;
use crate::worker::supervisor::{spawn_failure, TaskTerminal, WorkerChannel, WorkerSpawner};
use futures::stream::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// How a transform stage ended (failures are the `Err` channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStageOutcome {
    Completed,
    Cancelled,
}

/// One file's transform assignment.
#[derive(Debug, Clone)]
pub struct TransformStage {
    pub file_index: usize,
    pub plan: TransformPlan,
    pub execution: TransformExecution,
    pub max_workers: usize,
}

/// Transform every page image of one file.
///
/// `spawner` selects process isolation; `None` runs the same transform
/// primitive in-process on the blocking thread pool.
pub async fn run_transform_stage(
    stage: &TransformStage,
    images: Vec<PathBuf>,
    spawner: Option<&WorkerSpawner>,
    cancel: &CancelFlag,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<TransformStageOutcome, FileError> {
    if images.is_empty() {
        return Ok(TransformStageOutcome::Completed);
    }
    match (stage.execution, spawner) {
        (TransformExecution::Sequential, None) => {
            sequential_in_process(stage, images, cancel, on_progress).await
        }
        (TransformExecution::Sequential, Some(spawner)) => {
            sequential_isolated(stage, images, spawner, cancel, on_progress).await
        }
        (TransformExecution::Pooled, None) => {
            pooled_in_process(stage, images, cancel, on_progress).await
        }
        (TransformExecution::Pooled, Some(spawner)) => {
            pooled_isolated(stage, images, spawner, cancel, on_progress).await
        }
    }
}

fn panicked(image: PathBuf, err: tokio::task::JoinError) -> FileError {
    FileError::Transform {
        image,
        detail: format!("transform task aborted: {err}"),
    }
}

async fn sequential_in_process(
    stage: &TransformStage,
    images: Vec<PathBuf>,
    cancel: &CancelFlag,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<TransformStageOutcome, FileError> {
    let total = images.len();
    for (done, image) in images.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(TransformStageOutcome::Cancelled);
        }
        let plan = stage.plan.clone();
        let subject = image.clone();
        tokio::task::spawn_blocking(move || transform_image(&image, &plan))
            .await
            .map_err(|e| panicked(subject, e))??;
        on_progress(done + 1, total);
    }
    Ok(TransformStageOutcome::Completed)
}

async fn sequential_isolated(
    stage: &TransformStage,
    images: Vec<PathBuf>,
    spawner: &WorkerSpawner,
    cancel: &CancelFlag,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<TransformStageOutcome, FileError> {
    // One long-lived worker for the whole file; per-page process churn would
    // dominate the cheap transforms.
    let mut channel = match WorkerChannel::spawn(spawner).await {
        Ok(channel) => channel,
        Err(e) => return Err(spawn_failure(Stage::Transform, &images[0], &e)),
    };
    let total = images.len();
    for (done, image) in images.into_iter().enumerate() {
        if cancel.is_cancelled() {
            channel.shutdown().await;
            return Ok(TransformStageOutcome::Cancelled);
        }
        let task = WorkerTask::TransformImage {
            file_index: stage.file_index,
            image: image.clone(),
            plan: stage.plan.clone(),
        };
        match channel.run_task(&image, task, cancel, &mut |_| {}).await {
            TaskTerminal::Done(_) => on_progress(done + 1, total),
            TaskTerminal::Failed(error) => {
                channel.shutdown().await;
                return Err(error);
            }
            TaskTerminal::Cancelled => {
                channel.shutdown().await;
                return Ok(TransformStageOutcome::Cancelled);
            }
        }
    }
    channel.shutdown().await;
    Ok(TransformStageOutcome::Completed)
}

async fn pooled_in_process(
    stage: &TransformStage,
    images: Vec<PathBuf>,
    cancel: &CancelFlag,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<TransformStageOutcome, FileError> {
    let total = images.len();
    let plan = stage.plan.clone();
    let mut results = futures::stream::iter(images.into_iter().map(|image| {
        let plan = plan.clone();
        let subject = image.clone();
        async move {
            tokio::task::spawn_blocking(move || transform_image(&image, &plan))
                .await
                .map_err(|e| panicked(subject, e))?
        }
    }))
    .buffer_unordered(stage.max_workers.max(1));

    let mut done = 0usize;
    while let Some(result) = results.next().await {
        if cancel.is_cancelled() {
            return Ok(TransformStageOutcome::Cancelled);
        }
        result?;
        done += 1;
        on_progress(done, total);
    }
    Ok(TransformStageOutcome::Completed)
}

async fn pooled_isolated(
    stage: &TransformStage,
    images: Vec<PathBuf>,
    spawner: &WorkerSpawner,
    cancel: &CancelFlag,
    on_progress: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<TransformStageOutcome, FileError> {
    let total = images.len();
    let pool_size = stage.max_workers.clamp(1, total);
    debug!("transform pool: {pool_size} worker(s) over {total} page(s)");

    // Idle workers pull from the shared queue; the halt flag stops the pull
    // loop once a failure has been observed.
    let queue = Arc::new(Mutex::new(images.into_iter()));
    let halt = CancelFlag::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<TaskTerminal>(pool_size);

    for _ in 0..pool_size {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        let spawner = spawner.clone();
        let plan = stage.plan.clone();
        let cancel = cancel.clone();
        let halt = halt.clone();
        let file_index = stage.file_index;
        tokio::spawn(async move {
            let mut channel = match WorkerChannel::spawn(&spawner).await {
                Ok(channel) => channel,
                Err(e) => {
                    let failure = spawn_failure(Stage::Transform, std::path::Path::new(""), &e);
                    let _ = tx.send(TaskTerminal::Failed(failure)).await;
                    return;
                }
            };
            loop {
                if cancel.is_cancelled() || halt.is_cancelled() {
                    break;
                }
                let Some(image) = queue.lock().await.next() else {
                    break;
                };
                let task = WorkerTask::TransformImage {
                    file_index,
                    image: image.clone(),
                    plan: plan.clone(),
                };
                let terminal = channel.run_task(&image, task, &cancel, &mut |_| {}).await;
                // A crashed worker's channel is dead; any non-Done terminal
                // halts this worker anyway.
                let stop = !matches!(terminal, TaskTerminal::Done(_));
                if tx.send(terminal).await.is_err() || stop {
                    break;
                }
            }
            channel.shutdown().await;
        });
    }
    drop(tx);

    let mut done = 0usize;
    while let Some(terminal) = rx.recv().await {
        match terminal {
            TaskTerminal::Done(_) => {
                done += 1;
                on_progress(done, total);
                if done == total {
                    return Ok(TransformStageOutcome::Completed);
                }
            }
            TaskTerminal::Failed(error) => {
                halt.cancel();
                return Err(error);
            }
            TaskTerminal::Cancelled => return Ok(TransformStageOutcome::Cancelled),
        }
        if cancel.is_cancelled() {
            return Ok(TransformStageOutcome::Cancelled);
        }
    }
    if cancel.is_cancelled() {
        Ok(TransformStageOutcome::Cancelled)
    } else if done == total {
        Ok(TransformStageOutcome::Completed)
    } else {
        Err(FileError::Transform {
            image: PathBuf::new(),
            detail: "transform pool stopped before completing all pages".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{JobMode, JobOptions, ResizeMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stage(execution: TransformExecution, workers: usize) -> TransformStage {
        let options = JobOptions::builder(JobMode::Convert, "/out")
            .resize(ResizeMode::FitHeight(8))
            .build()
            .unwrap();
        TransformStage {
            file_index: 0,
            plan: TransformPlan::from_options(&options),
            execution,
            max_workers: workers,
        }
    }

    fn stage_pages(dir: &std::path::Path, count: usize) -> Vec<PathBuf> {
        let img = image::RgbaImage::from_pixel(16, 16, image::Rgba([7, 7, 7, 255]));
        (1..=count)
            .map(|i| {
                let p = dir.join(format!("page_{i:04}.png"));
                img.save(&p).unwrap();
                p
            })
            .collect()
    }

    #[tokio::test]
    async fn sequential_in_process_reports_ordered_progress() {
        let dir = tempfile::tempdir().unwrap();
        let images = stage_pages(dir.path(), 3);
        let seen = std::sync::Mutex::new(Vec::new());
        let outcome = run_transform_stage(
            &stage(TransformExecution::Sequential, 1),
            images.clone(),
            None,
            &CancelFlag::new(),
            &|current, total| seen.lock().unwrap().push((current, total)),
        )
        .await
        .unwrap();
        assert_eq!(outcome, TransformStageOutcome::Completed);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
        for image in &images {
            assert_eq!(image::image_dimensions(image).unwrap().1, 8);
        }
    }

    #[tokio::test]
    async fn pooled_in_process_counts_completions() {
        let dir = tempfile::tempdir().unwrap();
        let images = stage_pages(dir.path(), 5);
        let count = AtomicUsize::new(0);
        let outcome = run_transform_stage(
            &stage(TransformExecution::Pooled, 3),
            images,
            None,
            &CancelFlag::new(),
            &|_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, TransformStageOutcome::Completed);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn pre_cancelled_stage_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let images = stage_pages(dir.path(), 2);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = run_transform_stage(
            &stage(TransformExecution::Sequential, 1),
            images.clone(),
            None,
            &cancel,
            &|_, _| {},
        )
        .await
        .unwrap();
        assert_eq!(outcome, TransformStageOutcome::Cancelled);
        // Pages untouched.
        assert_eq!(image::image_dimensions(&images[0]).unwrap(), (16, 16));
    }

    #[tokio::test]
    async fn broken_page_fails_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut images = stage_pages(dir.path(), 2);
        let broken = dir.path().join("page_0003.png");
        std::fs::write(&broken, b"not a png").unwrap();
        images.push(broken);
        let err = run_transform_stage(
            &stage(TransformExecution::Sequential, 1),
            images,
            None,
            &CancelFlag::new(),
            &|_, _| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FileError::Transform { .. }));
    }
}
