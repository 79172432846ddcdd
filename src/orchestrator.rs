//! Batch orchestration: input expansion, per-file state machine, counters.
//!
//! The orchestrator walks each input through extract → transform → package,
//! isolating failures per file: a corrupt archive bumps the error counter
//! and the batch moves on. Cancellation is checked between files, between
//! stages, and (via the stages' own probes) between pages.
//!
//! Counter discipline: `attempted` moves together with its outcome counter,
//! so `attempted == errors + succeeded` holds at every observable point.
//! Skips and cancellations are neither attempts nor errors.

use crate::detect::{detect_path, ContainerKind};
use crate::error::{ComicError, FileError, Stage};
use crate::job::{CancelFlag, InputFile, Job};
use crate::options::{CollisionPolicy, FolderContents, JobMode, JobOptions, OutputFormat};
use crate::pipeline::{
    existing_collision, run_extract, run_package, ExtractOutcome, ExtractProgress, ExtractRequest,
    PackageOutcome, PackageProgress, PackageRequest, TransformPlan,
};
use crate::progress::{FileOutcome, JobSummary, NoopProgressCallback, ProgressCallback};
use crate::worker::{
    run_one_shot, run_transform_stage, TaskOutput, TaskTerminal, TransformStage,
    TransformStageOutcome, WorkerEvent, WorkerSpawner, WorkerTask,
};
use crate::workspace::{Workspace, WorkspaceManager};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Entry point for running batch jobs.
///
/// ```rust,no_run
/// use comicmill::{JobMode, JobOptions, Orchestrator};
///
/// # async fn demo() -> Result<(), comicmill::ComicError> {
/// let options = JobOptions::builder(JobMode::Convert, "/comics/out").build()?;
/// let summary = Orchestrator::new(options)
///     .run(vec!["/comics/in/issue-01.cbz".into()])
///     .await?;
/// println!("{}", summary.headline());
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    options: JobOptions,
    progress: ProgressCallback,
    worker_program: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(options: JobOptions) -> Self {
        Self {
            options,
            progress: Arc::new(NoopProgressCallback),
            worker_program: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Override the executable spawned for worker processes. Only meaningful
    /// with `isolate_workers`; hosts embedding the library use this when
    /// their own binary cannot serve as a worker.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Run the batch to completion with a private cancel flag.
    pub async fn run(self, inputs: Vec<PathBuf>) -> Result<JobSummary, ComicError> {
        self.run_cancellable(inputs, CancelFlag::new()).await
    }

    /// Run the batch to completion, observing `cancel`.
    pub async fn run_cancellable(
        self,
        inputs: Vec<PathBuf>,
        cancel: CancelFlag,
    ) -> Result<JobSummary, ComicError> {
        let runner = self.into_runner(inputs, cancel)?;
        runner.run().await
    }

    /// Spawn the batch onto the runtime and return a cancellable handle.
    pub fn start(self, inputs: Vec<PathBuf>) -> JobHandle {
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        let handle = tokio::spawn(self.run_cancellable(inputs, cancel));
        JobHandle {
            cancel: flag,
            handle,
        }
    }

    fn into_runner(self, inputs: Vec<PathBuf>, cancel: CancelFlag) -> Result<Runner, ComicError> {
        std::fs::create_dir_all(&self.options.output_dir).map_err(|e| {
            ComicError::OutputLocation {
                path: self.options.output_dir.clone(),
                source: e,
            }
        })?;

        let spawner = if self.options.isolate_workers {
            Some(match &self.worker_program {
                Some(program) => {
                    WorkerSpawner::with_program(program, self.options.worker_memory_limit_mb)
                }
                None => WorkerSpawner::from_current_exe(self.options.worker_memory_limit_mb)?,
            })
        } else {
            None
        };

        let (valid, rejected) = expand_inputs(&inputs, &self.options);
        if valid.is_empty() {
            return Err(ComicError::NoValidInputs {
                rejected: rejected.len(),
            });
        }
        debug!(
            "job: {} input(s), {} rejected, mode {:?}",
            valid.len(),
            rejected.len(),
            self.options.mode
        );

        let manager = WorkspaceManager::new(self.options.scratch_dir.clone());
        let job = Job::new(valid, self.options, cancel);
        job.counters
            .total
            .store(job.inputs.len() + rejected.len(), Ordering::SeqCst);
        Ok(Runner {
            job,
            rejected,
            progress: self.progress,
            spawner,
            manager,
        })
    }
}

/// Handle for a batch started with [`Orchestrator::start`].
pub struct JobHandle {
    cancel: CancelFlag,
    handle: tokio::task::JoinHandle<Result<JobSummary, ComicError>>,
}

impl JobHandle {
    /// Request cooperative cancellation; the job still runs to its summary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Wait for the job's summary.
    pub async fn join(self) -> Result<JobSummary, ComicError> {
        self.handle
            .await
            .map_err(|e| ComicError::Internal(format!("job task aborted: {e}")))?
    }
}

/// Resolve the supplied paths into processable inputs.
///
/// Directories expand per [`FolderContents`]; files are content-sniffed.
/// Files inside an expanded folder that are not comics (cover thumbnails,
/// notes) are ignored quietly, but a top-level path that resolves to nothing
/// is a rejection the user should hear about.
fn expand_inputs(
    paths: &[PathBuf],
    options: &JobOptions,
) -> (Vec<InputFile>, Vec<(PathBuf, FileError)>) {
    let mut inputs = Vec::new();
    let mut rejected = Vec::new();
    for path in paths {
        if path.is_dir() {
            match options.input_folders_contain {
                FolderContents::Images => {
                    inputs.push(InputFile::new(path.clone(), ContainerKind::ImageFolder));
                }
                FolderContents::Comics => {
                    let before = inputs.len();
                    expand_comic_dir(path, path, &mut inputs);
                    if inputs.len() == before {
                        rejected.push((
                            path.clone(),
                            FileError::UnsupportedInput {
                                path: path.clone(),
                                detail: "folder contains no supported comic files".to_string(),
                            },
                        ));
                    }
                }
            }
        } else {
            match detect_path(path) {
                Ok(kind) => inputs.push(InputFile::new(path.clone(), kind)),
                Err(error) => rejected.push((path.clone(), error)),
            }
        }
    }
    (inputs, rejected)
}

fn expand_comic_dir(root: &Path, dir: &Path, out: &mut Vec<InputFile>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        warn!("cannot list '{}', skipping", dir.display());
        return;
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            expand_comic_dir(root, &path, out);
        } else if let Ok(kind) = detect_path(&path) {
            let mut input = InputFile::new(path.clone(), kind);
            input.output_subdir = path
                .parent()
                .and_then(|p| p.strip_prefix(root).ok())
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_path_buf());
            out.push(input);
        } else {
            debug!("ignoring non-comic file '{}'", path.display());
        }
    }
}

enum StageEnd {
    Completed,
    Cancelled,
}

enum FileRun {
    Succeeded(Vec<PathBuf>),
    Skipped(PathBuf),
    Cancelled,
}

struct Runner {
    job: Job,
    rejected: Vec<(PathBuf, FileError)>,
    progress: ProgressCallback,
    spawner: Option<WorkerSpawner>,
    manager: WorkspaceManager,
}

impl Runner {
    async fn run(mut self) -> Result<JobSummary, ComicError> {
        let started = Instant::now();
        let total = self.job.inputs.len() + self.rejected.len();
        self.progress.on_job_start(total);

        let mut failed_files = Vec::new();
        let rejected = std::mem::take(&mut self.rejected);
        for (index, (path, error)) in rejected.iter().enumerate() {
            self.progress.on_file_start(index, total, path);
            self.count(&self.job.counters.attempted);
            self.count(&self.job.counters.errors);
            warn!("{error}");
            failed_files.push((path.clone(), error.to_string()));
            self.progress
                .on_file_complete(index, &FileOutcome::Errored { error: error.clone() });
        }

        let base = rejected.len();
        let was_cancelled = match self.job.options.mode {
            JobMode::Create => self.run_create(base, total, &mut failed_files).await?,
            JobMode::Convert | JobMode::Extract => {
                self.run_per_file(base, total, &mut failed_files).await?
            }
        };

        let summary = JobSummary {
            was_cancelled: was_cancelled || self.job.cancel.is_cancelled(),
            counters: self.job.counters.snapshot(),
            failed_files,
            elapsed: started.elapsed(),
        };
        info!("{}", summary.headline());
        self.progress.on_job_complete(&summary);
        Ok(summary)
    }

    fn count(&self, counter: &std::sync::atomic::AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// The container format this run actually writes. Extract mode always
    /// ends in a folder of page images.
    fn effective_format(&self) -> OutputFormat {
        match self.job.options.mode {
            JobMode::Extract => OutputFormat::Folder,
            _ => self.job.options.output_format,
        }
    }

    fn effective_split(&self) -> u32 {
        match self.job.options.mode {
            JobMode::Extract => 1,
            _ => self.job.options.split_count,
        }
    }

    fn should_transform(&self, target: OutputFormat) -> bool {
        // PDF targets need a per-page format compatibility pass even with no
        // transforms configured.
        self.job.options.wants_transform() || target == OutputFormat::Pdf
    }

    fn plan(&self, target: OutputFormat) -> TransformPlan {
        let mut plan = TransformPlan::from_options(&self.job.options);
        plan.target = target;
        plan
    }

    fn extract_request(&self, input: &InputFile, dest: PathBuf) -> ExtractRequest {
        let o = &self.job.options;
        ExtractRequest {
            input: input.path.clone(),
            kind: input.kind,
            dest,
            embedded_resolution: o.embedded_resolution,
            dpi: o.dpi,
            password: o.password.clone(),
            keep_comic_info: o.keep_comic_info,
        }
    }

    async fn run_per_file(
        &mut self,
        base: usize,
        total: usize,
        failed_files: &mut Vec<(PathBuf, String)>,
    ) -> Result<bool, ComicError> {
        let mut was_cancelled = false;
        let inputs = self.job.inputs.clone();
        for (offset, input) in inputs.iter().enumerate() {
            let index = base + offset;
            if was_cancelled || self.job.cancel.is_cancelled() {
                was_cancelled = true;
                self.progress.on_file_complete(index, &FileOutcome::Cancelled);
                continue;
            }

            self.progress.on_file_start(index, total, &input.path);
            let file_started = Instant::now();
            let ws = self.manager.create()?;
            match self.process_file(index, input, &ws).await {
                Ok(FileRun::Succeeded(outputs)) => {
                    self.count(&self.job.counters.attempted);
                    self.count(&self.job.counters.succeeded);
                    self.progress.on_file_complete(
                        index,
                        &FileOutcome::Succeeded {
                            outputs,
                            elapsed: file_started.elapsed(),
                        },
                    );
                }
                Ok(FileRun::Skipped(existing)) => {
                    self.count(&self.job.counters.skipped);
                    self.progress
                        .on_file_complete(index, &FileOutcome::Skipped { existing });
                }
                Ok(FileRun::Cancelled) => {
                    was_cancelled = true;
                    self.progress.on_file_complete(index, &FileOutcome::Cancelled);
                }
                Err(error) => {
                    self.count(&self.job.counters.attempted);
                    self.count(&self.job.counters.errors);
                    warn!("{error}");
                    failed_files.push((input.path.clone(), error.to_string()));
                    self.progress
                        .on_file_complete(index, &FileOutcome::Errored { error });
                }
            }
            if let Err(e) = ws.close() {
                warn!("workspace cleanup failed: {e}");
            }
        }
        Ok(was_cancelled)
    }

    async fn process_file(
        &self,
        index: usize,
        input: &InputFile,
        ws: &Workspace,
    ) -> Result<FileRun, FileError> {
        let format = self.effective_format();
        let split = self.effective_split();
        let stem = input.stem();
        let out_dir = match &input.output_subdir {
            Some(sub) => self.job.options.output_dir.join(sub),
            None => self.job.options.output_dir.clone(),
        };

        // Skip before any decode work: a skip costs nothing but the stat.
        if self.job.options.on_collision == CollisionPolicy::Skip {
            if let Some(existing) = existing_collision(&out_dir, &stem, format, split) {
                return Ok(FileRun::Skipped(existing));
            }
        }

        self.progress.on_stage_start(index, Stage::Extract);
        let request = self.extract_request(input, ws.path().to_path_buf());
        match self
            .extract(index, &input.path, request, self.spawner.as_ref())
            .await?
        {
            StageEnd::Cancelled => return Ok(FileRun::Cancelled),
            StageEnd::Completed => {}
        }
        if self.job.cancel.is_cancelled() {
            return Ok(FileRun::Cancelled);
        }

        if self.should_transform(format) {
            self.progress.on_stage_start(index, Stage::Transform);
            match self.transform(index, format, ws.path()).await? {
                StageEnd::Cancelled => return Ok(FileRun::Cancelled),
                StageEnd::Completed => {}
            }
            if self.job.cancel.is_cancelled() {
                return Ok(FileRun::Cancelled);
            }
        }

        self.progress.on_stage_start(index, Stage::Package);
        std::fs::create_dir_all(&out_dir).map_err(|e| FileError::Packaging {
            output: out_dir.clone(),
            detail: format!("cannot create output directory: {e}"),
        })?;
        let request = PackageRequest {
            workspace: ws.path().to_path_buf(),
            stem,
            output_dir: out_dir,
            format,
            split_count: split,
            on_collision: self.job.options.on_collision,
            keep_comic_info: self.job.options.keep_comic_info,
        };
        self.package(index, &input.path, request).await
    }

    async fn extract(
        &self,
        index: usize,
        subject: &Path,
        request: ExtractRequest,
        spawner: Option<&WorkerSpawner>,
    ) -> Result<StageEnd, FileError> {
        match spawner {
            Some(spawner) => {
                let task = WorkerTask::Extract {
                    file_index: index,
                    request,
                };
                let progress = &self.progress;
                let terminal = run_one_shot(spawner, subject, task, &self.job.cancel, &mut |e| {
                    forward_event(progress, index, e)
                })
                .await;
                match terminal {
                    TaskTerminal::Done(_) => Ok(StageEnd::Completed),
                    TaskTerminal::Failed(error) => Err(error),
                    TaskTerminal::Cancelled => Ok(StageEnd::Cancelled),
                }
            }
            None => {
                let sink_progress = self.progress.clone();
                let cancel = self.job.cancel.clone();
                let subject = subject.to_path_buf();
                let outcome = tokio::task::spawn_blocking(move || {
                    let mut sink = CallbackSink {
                        progress: sink_progress,
                        cancel,
                        index,
                        stage: Stage::Extract,
                    };
                    run_extract(&request, &mut sink)
                })
                .await
                .map_err(|e| FileError::Extraction {
                    path: subject,
                    detail: format!("extraction task aborted: {e}"),
                    low_disk: false,
                })??;
                Ok(match outcome {
                    ExtractOutcome::Completed { .. } => StageEnd::Completed,
                    ExtractOutcome::Cancelled => StageEnd::Cancelled,
                })
            }
        }
    }

    async fn transform(
        &self,
        index: usize,
        target: OutputFormat,
        workspace: &Path,
    ) -> Result<StageEnd, FileError> {
        let images = list_workspace_images(workspace)?;
        let stage = TransformStage {
            file_index: index,
            plan: self.plan(target),
            execution: self.job.options.transform_execution,
            max_workers: self.job.options.max_workers,
        };
        let progress = &self.progress;
        let outcome = run_transform_stage(
            &stage,
            images,
            self.spawner.as_ref(),
            &self.job.cancel,
            &|current, total| progress.on_page_progress(index, Stage::Transform, current, total),
        )
        .await?;
        Ok(match outcome {
            TransformStageOutcome::Completed => StageEnd::Completed,
            TransformStageOutcome::Cancelled => StageEnd::Cancelled,
        })
    }

    async fn package(
        &self,
        index: usize,
        subject: &Path,
        request: PackageRequest,
    ) -> Result<FileRun, FileError> {
        match &self.spawner {
            Some(spawner) => {
                let task = WorkerTask::Package {
                    file_index: index,
                    request,
                };
                let progress = &self.progress;
                let terminal = run_one_shot(spawner, subject, task, &self.job.cancel, &mut |e| {
                    forward_event(progress, index, e)
                })
                .await;
                match terminal {
                    TaskTerminal::Done(TaskOutput::Packaged { outputs }) => {
                        Ok(FileRun::Succeeded(outputs))
                    }
                    TaskTerminal::Done(TaskOutput::PackageSkipped { existing }) => {
                        Ok(FileRun::Skipped(existing))
                    }
                    TaskTerminal::Done(other) => Err(FileError::Packaging {
                        output: subject.to_path_buf(),
                        detail: format!("unexpected worker payload: {other:?}"),
                    }),
                    TaskTerminal::Failed(error) => Err(error),
                    TaskTerminal::Cancelled => Ok(FileRun::Cancelled),
                }
            }
            None => {
                let sink_progress = self.progress.clone();
                let cancel = self.job.cancel.clone();
                let subject = subject.to_path_buf();
                let outcome = tokio::task::spawn_blocking(move || {
                    let mut sink = CallbackSink {
                        progress: sink_progress,
                        cancel,
                        index,
                        stage: Stage::Package,
                    };
                    run_package(&request, &mut sink)
                })
                .await
                .map_err(|e| FileError::Packaging {
                    output: subject,
                    detail: format!("packaging task aborted: {e}"),
                })??;
                Ok(match outcome {
                    PackageOutcome::Written(outputs) => FileRun::Succeeded(outputs),
                    PackageOutcome::Skipped(existing) => FileRun::Skipped(existing),
                    PackageOutcome::Cancelled => FileRun::Cancelled,
                })
            }
        }
    }

    /// CREATE mode: stage every input into one aggregate workspace, then
    /// transform and package the whole set once.
    ///
    /// Per-input staging directories are named by file index, so the
    /// aggregate's lexicographic page order is input order, then page order.
    /// Inputs that are already loose images are staged by plain copy,
    /// without the extract stage or a worker round-trip.
    async fn run_create(
        &mut self,
        base: usize,
        total: usize,
        failed_files: &mut Vec<(PathBuf, String)>,
    ) -> Result<bool, ComicError> {
        let inputs = self.job.inputs.clone();
        let format = self.effective_format();
        let split = self.effective_split();
        let stem = self
            .job
            .options
            .output_name
            .clone()
            .unwrap_or_else(|| inputs[0].stem());

        if self.job.options.on_collision == CollisionPolicy::Skip {
            if let Some(existing) =
                existing_collision(&self.job.options.output_dir, &stem, format, split)
            {
                for offset in 0..inputs.len() {
                    self.count(&self.job.counters.skipped);
                    self.progress.on_file_complete(
                        base + offset,
                        &FileOutcome::Skipped {
                            existing: existing.clone(),
                        },
                    );
                }
                return Ok(false);
            }
        }

        let agg = self.manager.create()?;
        let mut staged: Vec<(usize, InputFile, Instant)> = Vec::new();
        let mut was_cancelled = false;
        for (offset, input) in inputs.iter().enumerate() {
            let index = base + offset;
            if was_cancelled || self.job.cancel.is_cancelled() {
                was_cancelled = true;
                self.progress.on_file_complete(index, &FileOutcome::Cancelled);
                continue;
            }

            self.progress.on_file_start(index, total, &input.path);
            let file_started = Instant::now();
            let dest = agg.path().join(format!("input_{index:04}"));
            if let Err(e) = std::fs::create_dir_all(&dest) {
                let error = FileError::Extraction {
                    path: input.path.clone(),
                    detail: format!("cannot create staging directory: {e}"),
                    low_disk: crate::error::is_disk_full(&e),
                };
                self.count(&self.job.counters.attempted);
                self.count(&self.job.counters.errors);
                failed_files.push((input.path.clone(), error.to_string()));
                self.progress
                    .on_file_complete(index, &FileOutcome::Errored { error });
                continue;
            }

            let request = self.extract_request(input, dest.clone());
            let spawner = if input.kind.is_plain_images() {
                None
            } else {
                self.progress.on_stage_start(index, Stage::Extract);
                self.spawner.as_ref()
            };
            match self.extract(index, &input.path, request, spawner).await {
                Ok(StageEnd::Completed) => staged.push((index, input.clone(), file_started)),
                Ok(StageEnd::Cancelled) => {
                    was_cancelled = true;
                    let _ = std::fs::remove_dir_all(&dest);
                    self.progress.on_file_complete(index, &FileOutcome::Cancelled);
                }
                Err(error) => {
                    self.count(&self.job.counters.attempted);
                    self.count(&self.job.counters.errors);
                    warn!("{error}");
                    // Partially staged pages must not leak into the
                    // aggregate output.
                    let _ = std::fs::remove_dir_all(&dest);
                    failed_files.push((input.path.clone(), error.to_string()));
                    self.progress
                        .on_file_complete(index, &FileOutcome::Errored { error });
                }
            }
        }

        if was_cancelled {
            for (index, ..) in &staged {
                self.progress.on_file_complete(*index, &FileOutcome::Cancelled);
            }
            return Ok(true);
        }
        if staged.is_empty() {
            return Ok(false);
        }

        // Stage events for the aggregate phases attach to the first staged
        // input; the batch-level page progress covers the whole set.
        let lead_index = staged[0].0;
        if self.should_transform(format) {
            self.progress.on_stage_start(lead_index, Stage::Transform);
            match self.transform(lead_index, format, agg.path()).await {
                Ok(StageEnd::Completed) => {}
                Ok(StageEnd::Cancelled) => {
                    self.complete_all(&staged, |_| FileOutcome::Cancelled);
                    return Ok(true);
                }
                Err(error) => {
                    self.fail_all(&staged, &error, failed_files);
                    return Ok(false);
                }
            }
        }

        self.progress.on_stage_start(lead_index, Stage::Package);
        let request = PackageRequest {
            workspace: agg.path().to_path_buf(),
            stem,
            output_dir: self.job.options.output_dir.clone(),
            format,
            split_count: split,
            on_collision: self.job.options.on_collision,
            keep_comic_info: self.job.options.keep_comic_info,
        };
        let subject = staged[0].1.path.clone();
        let result = self.package(lead_index, &subject, request).await;
        if let Err(e) = agg.close() {
            warn!("workspace cleanup failed: {e}");
        }
        match result {
            Ok(FileRun::Succeeded(outputs)) => {
                for (index, _, started) in &staged {
                    self.count(&self.job.counters.attempted);
                    self.count(&self.job.counters.succeeded);
                    self.progress.on_file_complete(
                        *index,
                        &FileOutcome::Succeeded {
                            outputs: outputs.clone(),
                            elapsed: started.elapsed(),
                        },
                    );
                }
                Ok(false)
            }
            Ok(FileRun::Skipped(existing)) => {
                for (index, ..) in &staged {
                    self.count(&self.job.counters.skipped);
                    self.progress.on_file_complete(
                        *index,
                        &FileOutcome::Skipped {
                            existing: existing.clone(),
                        },
                    );
                }
                Ok(false)
            }
            Ok(FileRun::Cancelled) => {
                self.complete_all(&staged, |_| FileOutcome::Cancelled);
                Ok(true)
            }
            Err(error) => {
                self.fail_all(&staged, &error, failed_files);
                Ok(false)
            }
        }
    }

    fn complete_all(
        &self,
        staged: &[(usize, InputFile, Instant)],
        outcome: impl Fn(&InputFile) -> FileOutcome,
    ) {
        for (index, input, _) in staged {
            self.progress.on_file_complete(*index, &outcome(input));
        }
    }

    fn fail_all(
        &self,
        staged: &[(usize, InputFile, Instant)],
        error: &FileError,
        failed_files: &mut Vec<(PathBuf, String)>,
    ) {
        warn!("{error}");
        for (index, input, _) in staged {
            self.count(&self.job.counters.attempted);
            self.count(&self.job.counters.errors);
            failed_files.push((input.path.clone(), error.to_string()));
            self.progress.on_file_complete(
                *index,
                &FileOutcome::Errored {
                    error: error.clone(),
                },
            );
        }
    }
}

fn list_workspace_images(workspace: &Path) -> Result<Vec<PathBuf>, FileError> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, out)?;
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(crate::options::PageFormat::from_extension)
                .is_some()
            {
                out.push(path);
            }
        }
        Ok(())
    }
    let mut images = Vec::new();
    walk(workspace, &mut images).map_err(|e| FileError::Transform {
        image: workspace.to_path_buf(),
        detail: format!("cannot list workspace: {e}"),
    })?;
    images.sort();
    Ok(images)
}

fn forward_event(progress: &ProgressCallback, index: usize, event: &WorkerEvent) {
    match event {
        WorkerEvent::Progress {
            stage,
            current,
            total,
            ..
        } => progress.on_page_progress(index, *stage, *current, *total),
        WorkerEvent::Log { line, .. } => progress.on_log(index, line),
        _ => {}
    }
}

/// Adapts the job-level progress callback and cancel flag onto the stage
/// progress traits for in-process execution.
struct CallbackSink {
    progress: ProgressCallback,
    cancel: CancelFlag,
    index: usize,
    stage: Stage,
}

impl ExtractProgress for CallbackSink {
    fn on_page(&mut self, current: usize, total: usize) {
        self.progress
            .on_page_progress(self.index, self.stage, current, total);
    }
    fn on_log(&mut self, line: &str) {
        self.progress.on_log(self.index, line);
    }
    fn should_cancel(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl PackageProgress for CallbackSink {
    fn on_chunk(&mut self, current: usize, total: usize) {
        self.progress
            .on_page_progress(self.index, self.stage, current, total);
    }
    fn should_cancel(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch_pk(path: &Path) {
        std::fs::write(path, b"PK\x03\x04stub").unwrap();
    }

    #[test]
    fn expansion_preserves_subfolder_structure() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("series/vol1")).unwrap();
        touch_pk(&root.path().join("series/vol1/a.cbz"));
        touch_pk(&root.path().join("top.cbz"));
        std::fs::write(root.path().join("notes.txt"), b"hello").unwrap();

        let options = JobOptions::builder(JobMode::Convert, "/out").build().unwrap();
        let (inputs, rejected) = expand_inputs(&[root.path().to_path_buf()], &options);
        assert!(rejected.is_empty());
        assert_eq!(inputs.len(), 2);

        let nested = inputs
            .iter()
            .find(|i| i.path.ends_with("series/vol1/a.cbz"))
            .unwrap();
        assert_eq!(nested.output_subdir.as_deref(), Some(Path::new("series/vol1")));
        let top = inputs.iter().find(|i| i.path.ends_with("top.cbz")).unwrap();
        assert!(top.output_subdir.is_none());
    }

    #[test]
    fn folder_as_images_is_one_unit() {
        let root = tempfile::tempdir().unwrap();
        touch_pk(&root.path().join("a.cbz"));
        let options = JobOptions::builder(JobMode::Convert, "/out")
            .input_folders_contain(FolderContents::Images)
            .build()
            .unwrap();
        let (inputs, rejected) = expand_inputs(&[root.path().to_path_buf()], &options);
        assert!(rejected.is_empty());
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].kind, ContainerKind::ImageFolder);
    }

    #[test]
    fn empty_comic_folder_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("readme.md"), b"no comics here").unwrap();
        let options = JobOptions::builder(JobMode::Convert, "/out").build().unwrap();
        let (inputs, rejected) = expand_inputs(&[root.path().to_path_buf()], &options);
        assert!(inputs.is_empty());
        assert_eq!(rejected.len(), 1);
    }

    #[tokio::test]
    async fn all_rejected_inputs_fail_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("x.cbr");
        std::fs::write(&bogus, b"Rar!\x1A\x07\x00").unwrap();
        let out = tempfile::tempdir().unwrap();
        let options = JobOptions::builder(JobMode::Convert, out.path()).build().unwrap();
        let err = Orchestrator::new(options).run(vec![bogus]).await.unwrap_err();
        assert!(matches!(err, ComicError::NoValidInputs { rejected: 1 }));
    }
}
