//! The two-pass build driver.
//!
//! A build walks the state machine
//! `Pass1Running -> Pass1Complete -> ResolutionRunning -> Pass2Running -> Pass2Complete`,
//! dropping to `Failed` on the first unrecoverable problem. Each pass fans the
//! inputs out over a bounded pool of engine tasks. Cache hits skip the engine
//! entirely. The passes are separated by a hard barrier: every input reaches a
//! terminal pass-1 state before resolution runs, and resolution finishes before
//! any pass-2 task starts.
//!
//! A failing input does not stop its siblings. The build is marked failed once
//! the in-flight tasks drain, so one attempt surfaces every independent error.
//! A `General` engine failure stops new launches but still lets running tasks
//! finish. Cancellation aborts the running tasks; nothing they produced reaches
//! the cache.
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinSet};
use walkdir::WalkDir;

use crate::{
    cache::{BuildCache, Fingerprint, FingerprintBuilder},
    config::{BuildConfig, ENTRYPOINT_FILE},
    engine::{
        safe_relative_path, EngineError, EngineJob, EngineOutput, HtmlArtifact, Pass, Special,
        SpecialKind, TexEngine,
    },
    error::PediaError,
    messages::{InputDebugOutputMessage, Message, MessageBus, ToolOutputMessage, ToolOutputStream},
    records::{IndexRecord, IndexRecordStore},
    resolve::{declared_outputs, references_of, resolve, ResolutionReport, ResolutionTable},
};

pub const PHASE_RESOLVE: &str = "resolve";
pub const PHASE_ENTRYPOINT: &str = "entrypoint";

const ENTRYPOINT_HEADER: &str = "<link rel=\"stylesheet\" href=\"./tdux-fonts.css\">\n\
                                 <script src=\"../web/index.ts\" type=\"module\"></script>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildState {
    Idle,
    Pass1Running,
    Pass1Complete,
    ResolutionRunning,
    Pass2Running,
    Pass2Complete,
    Failed,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Pass2Complete | BuildState::Failed)
    }

    /// Legal transitions. Any state may fail; a new build may start from a
    /// terminal or idle state.
    pub fn can_advance_to(&self, next: BuildState) -> bool {
        use BuildState::*;
        matches!(
            (self, next),
            (_, Failed)
                | (Idle | Pass2Complete | Failed, Pass1Running)
                | (Pass1Running, Pass1Complete)
                | (Pass1Complete, ResolutionRunning)
                | (ResolutionRunning, Pass2Running)
                | (Pass2Running, Pass2Complete)
        )
    }
}

/// A one-shot cancellation flag shared by everything working on one build.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelSignal {
            tx: Arc::new(tx),
            rx,
        }
    }
}

impl CancelSignal {
    pub fn new() -> CancelSignal {
        CancelSignal::default()
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // the sender lives as long as `self`, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputFile {
    /// Repository-relative path with forward slashes.
    pub relpath: String,
    pub path: PathBuf,
}

/// All `.tex` inputs below the configured input directory, sorted by path.
pub fn discover_inputs(config: &BuildConfig) -> Result<Vec<InputFile>, PediaError> {
    let root = config.input_root();
    if !root.is_dir() {
        return Err(PediaError::NotFound(format!(
            "input directory {} does not exist",
            root.display()
        )));
    }
    let mut inputs = Vec::new();
    for entry in WalkDir::new(&root).follow_links(true) {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("tex") {
            continue;
        }
        inputs.push(InputFile {
            relpath: config.relative_path(path)?,
            path: path.to_path_buf(),
        });
    }
    inputs.sort();
    Ok(inputs)
}

/// What the cache keeps for a successful pass-1 compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pass1Output {
    pub records: Vec<IndexRecord>,
    /// Extra source files read, sorted.
    pub dependencies: Vec<String>,
    /// Their combined digest when the compilation ran.
    pub dependency_digest: Fingerprint,
}

/// What the cache keeps for a successful pass-2 compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pass2Output {
    pub artifacts: Vec<HtmlArtifact>,
    pub specials: Vec<Special>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStats {
    pub compiled: usize,
    pub cached: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub state: BuildState,
    pub pass1: PassStats,
    pub pass2: PassStats,
    /// Number of resolution errors.
    pub resolution_errors: usize,
    /// Every declared output path, sorted.
    pub outputs: Vec<String>,
    pub elapsed: f32,
}

impl Default for BuildSummary {
    fn default() -> Self {
        BuildSummary {
            state: BuildState::Idle,
            pass1: PassStats::default(),
            pass2: PassStats::default(),
            resolution_errors: 0,
            outputs: Vec::new(),
            elapsed: 0.0,
        }
    }
}

impl BuildSummary {
    pub fn success(&self) -> bool {
        self.state == BuildState::Pass2Complete
    }
}

struct Task {
    input: InputFile,
    fingerprint: Fingerprint,
    job: EngineJob,
}

struct TaskResult {
    input: InputFile,
    fingerprint: Fingerprint,
    scratch_dir: PathBuf,
    elapsed: f32,
    outcome: Result<EngineOutput, EngineError>,
}

/// Bounded fan-out of engine jobs. At most `n_workers` jobs run at once; the
/// rest wait in launch order.
struct WorkerPool<'a, E: TexEngine, B: MessageBus> {
    engine: Arc<E>,
    bus: &'a B,
    n_workers: usize,
    queue: VecDeque<Task>,
    running: JoinSet<TaskResult>,
    launching: bool,
}

impl<'a, E: TexEngine, B: MessageBus> WorkerPool<'a, E, B> {
    fn new(engine: Arc<E>, bus: &'a B, n_workers: usize, tasks: Vec<Task>) -> Self {
        WorkerPool {
            engine,
            bus,
            n_workers: n_workers.max(1),
            queue: tasks.into(),
            running: JoinSet::new(),
            launching: true,
        }
    }

    /// Launch nothing further; queued jobs are dropped.
    fn stop_launching(&mut self) {
        if self.launching && !self.queue.is_empty() {
            tracing::warn!(
                "[Scheduler] not launching {} queued job(s) after a general failure",
                self.queue.len()
            );
        }
        self.launching = false;
        self.queue.clear();
    }

    fn fill(&mut self) {
        while self.launching && self.running.len() < self.n_workers {
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            self.bus
                .post(Message::build_started(Some(task.input.relpath.as_str())));
            self.bus
                .post(Message::CommandLaunched(self.engine.describe(&task.job)));
            let engine = self.engine.clone();
            self.running.spawn(async move {
                let started = Instant::now();
                let scratch_dir = task.job.scratch_dir.clone();
                let outcome = engine.run(task.job).await;
                TaskResult {
                    input: task.input,
                    fingerprint: task.fingerprint,
                    scratch_dir,
                    elapsed: started.elapsed().as_secs_f32(),
                    outcome,
                }
            });
        }
    }

    /// The next finished job, or `None` once everything has drained.
    async fn next(&mut self, cancel: &CancelSignal) -> Result<Option<TaskResult>, PediaError> {
        self.fill();
        if self.running.is_empty() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("[Scheduler] cancelling {} in-flight job(s)", self.running.len());
                self.queue.clear();
                self.running.abort_all();
                while self.running.join_next().await.is_some() {}
                Err(PediaError::OperationCancelled)
            }
            joined = self.running.join_next() => match joined {
                Some(Ok(result)) => Ok(Some(result)),
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            },
        }
    }
}

/// A resolution table together with the index names it was checked against.
#[derive(Debug, Clone)]
struct PublishedTable {
    indices: Vec<String>,
    table: ResolutionTable,
}

/// Drives builds for one project.
///
/// The driver owns the record store, the cache handle and the most recently
/// published resolution table. It is a cheap handle: clones share all of them,
/// so a server can hand a clone to a build task. Callers must not run two
/// builds at once.
pub struct BuildDriver<E: TexEngine, B: MessageBus> {
    config: Arc<BuildConfig>,
    engine: Arc<E>,
    bus: B,
    store: IndexRecordStore,
    cache: BuildCache,
    state: Arc<Mutex<BuildState>>,
    table: Arc<RwLock<Option<PublishedTable>>>,
    n_workers: usize,
}

impl<E: TexEngine, B: MessageBus> Clone for BuildDriver<E, B> {
    fn clone(&self) -> Self {
        BuildDriver {
            config: self.config.clone(),
            engine: self.engine.clone(),
            bus: self.bus.clone(),
            store: self.store.clone(),
            cache: self.cache.clone(),
            state: self.state.clone(),
            table: self.table.clone(),
            n_workers: self.n_workers,
        }
    }
}

impl<E: TexEngine, B: MessageBus> BuildDriver<E, B> {
    /// Open the project's cache and prepare a driver.
    pub async fn new(config: BuildConfig, engine: E, bus: B) -> Result<Self, PediaError> {
        let cache = BuildCache::open(&config.cache_db(), engine.salt()).await?;
        let n_workers = config.n_workers();
        Ok(BuildDriver {
            config: Arc::new(config),
            engine: Arc::new(engine),
            bus,
            store: IndexRecordStore::new(),
            cache,
            state: Arc::new(Mutex::new(BuildState::Idle)),
            table: Arc::new(RwLock::new(None)),
            n_workers,
        })
    }

    pub fn with_workers(mut self, n_workers: usize) -> Self {
        if n_workers > 0 {
            self.n_workers = n_workers;
        }
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn store(&self) -> &IndexRecordStore {
        &self.store
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    pub fn state(&self) -> BuildState {
        *self.state.lock()
    }

    /// The table published by the last successful resolution.
    pub fn resolution_table(&self) -> Option<ResolutionTable> {
        self.table.read().as_ref().map(|p| p.table.clone())
    }

    fn set_state(&self, next: BuildState) {
        let mut state = self.state.lock();
        if !state.can_advance_to(next) {
            tracing::warn!("[Scheduler] unexpected state change {:?} -> {next:?}", *state);
        }
        tracing::debug!("[Scheduler] {:?} -> {next:?}", *state);
        *state = next;
    }

    /// Run one complete build.
    ///
    /// Returns the summary for builds that reached a terminal state, including
    /// failed ones. Cancellation and environmental errors are returned as
    /// errors; the driver is left in `Failed` either way.
    #[tracing::instrument(skip_all)]
    pub async fn build(&self, cancel: &CancelSignal) -> Result<BuildSummary, PediaError> {
        let started = Instant::now();
        self.bus.post(Message::build_started(None));
        let mut summary = BuildSummary::default();
        let result = self.run_build(cancel, &mut summary).await;

        if result.is_err() || !self.state().is_terminal() {
            self.set_state(BuildState::Failed);
        }
        summary.state = self.state();
        summary.elapsed = started.elapsed().as_secs_f32();
        match &result {
            Ok(()) => {}
            Err(PediaError::OperationCancelled) => {
                self.bus.note(None, "build cancelled", vec![]);
            }
            Err(e) => {
                self.bus.error(None, format!("build aborted: {e}"), vec![]);
            }
        }
        self.bus.post(Message::build_complete(
            None,
            summary.success(),
            summary.elapsed,
        ));
        tracing::info!(
            "[Scheduler] build finished in {:.2}s: {:?}",
            summary.elapsed,
            summary.state
        );
        result.map(|()| summary)
    }

    async fn run_build(
        &self,
        cancel: &CancelSignal,
        summary: &mut BuildSummary,
    ) -> Result<(), PediaError> {
        self.set_state(BuildState::Pass1Running);
        let inputs = discover_inputs(&self.config)?;
        let indices = self.config.declared_indices()?;
        let keep: BTreeSet<String> = inputs.iter().map(|i| i.relpath.clone()).collect();
        for gone in self.store.retain_files(&keep) {
            tracing::info!("[Scheduler] {gone} is gone; dropping its records");
        }
        tracing::info!("[Scheduler] building {} input(s)", inputs.len());

        self.bus.phase(Pass::First.phase_name());
        let (pass1_ok, sources) = self.run_pass1(&inputs, cancel, &mut summary.pass1).await?;
        if !pass1_ok {
            self.set_state(BuildState::Failed);
            return Ok(());
        }
        self.set_state(BuildState::Pass1Complete);

        self.set_state(BuildState::ResolutionRunning);
        self.bus.phase(PHASE_RESOLVE);
        let table = match self.resolve_records(&indices) {
            Ok(table) => table,
            Err(report) => {
                summary.resolution_errors = report.len();
                self.report_resolution_errors(&report);
                self.set_state(BuildState::Failed);
                return Ok(());
            }
        };
        if cancel.is_cancelled() {
            return Err(PediaError::OperationCancelled);
        }

        self.set_state(BuildState::Pass2Running);
        self.bus.phase(Pass::Second.phase_name());
        let pass2_ok = self
            .run_pass2(&inputs, &sources, &table, cancel, &mut summary.pass2)
            .await?;
        if !pass2_ok {
            self.set_state(BuildState::Failed);
            return Ok(());
        }

        self.bus.phase(PHASE_ENTRYPOINT);
        let outputs = declared_outputs(&self.store.all_records());
        self.write_entrypoint(&outputs).await?;
        summary.outputs = outputs.into_iter().collect();
        self.set_state(BuildState::Pass2Complete);
        Ok(())
    }

    /// Returns whether every input succeeded, and the source digest of each
    /// input that did.
    async fn run_pass1(
        &self,
        inputs: &[InputFile],
        cancel: &CancelSignal,
        stats: &mut PassStats,
    ) -> Result<(bool, BTreeMap<String, Fingerprint>), PediaError> {
        let mut ok = true;
        let mut contents = BTreeMap::new();
        let mut sources = BTreeMap::new();
        let mut tasks = Vec::new();

        for input in inputs.iter() {
            if cancel.is_cancelled() {
                return Err(PediaError::OperationCancelled);
            }
            let digest = match self.cache.content_digest(&input.relpath, &input.path).await {
                Ok(digest) => digest,
                Err(e) => {
                    self.bus
                        .error(Some(input.relpath.as_str()), "cannot read input", vec![e.to_string()]);
                    stats.failed += 1;
                    ok = false;
                    continue;
                }
            };
            contents.insert(input.relpath.clone(), digest);
            let fingerprint = self.cache.pass1_fingerprint(&digest);
            let cached = self
                .cache
                .lookup::<Pass1Output>(&input.relpath, &fingerprint, Pass::First)
                .await;
            let hit = match cached {
                Some(cached) => {
                    let current = self
                        .cache
                        .dependency_digest(&self.config.root, &cached.dependencies)
                        .await;
                    if cached.dependency_digest == current {
                        Some((cached.records, current))
                    } else {
                        tracing::debug!("[Scheduler] a dependency of {} changed", input.relpath);
                        None
                    }
                }
                None => None,
            };
            match hit {
                Some((records, deps)) => {
                    tracing::trace!("[Scheduler] pass 1 cache hit for {}", input.relpath);
                    self.store.replace(&input.relpath, records);
                    sources.insert(input.relpath.clone(), self.cache.source_digest(&digest, &deps));
                    stats.cached += 1;
                }
                None => tasks.push(self.task(input, fingerprint, Pass::First, String::new())),
            }
        }

        let mut pool = WorkerPool::new(self.engine.clone(), &self.bus, self.n_workers, tasks);
        while let Some(result) = pool.next(cancel).await? {
            let file = result.input.relpath.as_str();
            match result.outcome {
                Ok(output) => {
                    self.report_tool_output(file, &output);
                    let mut dependencies = output.dependencies;
                    dependencies.sort();
                    dependencies.dedup();
                    let deps = self
                        .cache
                        .dependency_digest(&self.config.root, &dependencies)
                        .await;
                    let cached = Pass1Output {
                        records: output.records,
                        dependencies,
                        dependency_digest: deps,
                    };
                    if let Err(e) = self
                        .cache
                        .store(file, &result.fingerprint, Pass::First, &cached)
                        .await
                    {
                        self.report_cache_write_failure(file, e);
                    }
                    if let Some(content) = contents.get(file) {
                        sources.insert(file.to_string(), self.cache.source_digest(content, &deps));
                    }
                    self.store.replace(file, cached.records);
                    stats.compiled += 1;
                    self.bus
                        .post(Message::build_complete(Some(file), true, result.elapsed));
                }
                Err(e) => {
                    ok = false;
                    stats.failed += 1;
                    if e.is_general() {
                        pool.stop_launching();
                    }
                    self.report_engine_failure(file, &e, result.elapsed);
                }
            }
        }

        self.bus.note(
            None,
            format!(
                "pass 1: {} compiled, {} cached, {} failed",
                stats.compiled, stats.cached, stats.failed
            ),
            vec![],
        );
        Ok((ok, sources))
    }

    fn resolve_records(&self, indices: &[String]) -> Result<ResolutionTable, ResolutionReport> {
        let dirty = self.store.take_dirty();
        if dirty.is_empty() {
            if let Some(published) = self.table.read().as_ref() {
                if published.indices == indices {
                    tracing::debug!("[Scheduler] no index records changed; reusing resolution table");
                    return Ok(published.table.clone());
                }
            }
        } else {
            tracing::debug!("[Scheduler] {} input(s) changed index records", dirty.len());
        }
        let result = resolve(&self.store.all_records(), indices);
        *self.table.write() = result.as_ref().ok().map(|table| PublishedTable {
            indices: indices.to_vec(),
            table: table.clone(),
        });
        result
    }

    async fn run_pass2(
        &self,
        inputs: &[InputFile],
        sources: &BTreeMap<String, Fingerprint>,
        table: &ResolutionTable,
        cancel: &CancelSignal,
        stats: &mut PassStats,
    ) -> Result<bool, PediaError> {
        let mut ok = true;
        let mut tasks = Vec::new();
        let scratch_root = self.config.scratch_root();
        if tokio::fs::try_exists(&scratch_root).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_dir_all(&scratch_root).await {
                tracing::debug!("[Scheduler] could not clear {}: {e}", scratch_root.display());
            }
        }

        for input in inputs.iter() {
            if cancel.is_cancelled() {
                return Err(PediaError::OperationCancelled);
            }
            let Some(source) = sources.get(&input.relpath) else {
                continue;
            };
            let refs = references_of(&self.store.records_for(&input.relpath));
            let subset = table.subset_digest(&refs);
            let fingerprint = self.cache.pass2_fingerprint(source, &subset);
            match self
                .cache
                .lookup::<Pass2Output>(&input.relpath, &fingerprint, Pass::Second)
                .await
            {
                Some(cached) => {
                    tracing::trace!("[Scheduler] pass 2 cache hit for {}", input.relpath);
                    if let Err(e) = self.materialize(&cached.artifacts).await {
                        self.bus.error(
                            Some(input.relpath.as_str()),
                            "cannot write outputs",
                            vec![e.to_string()],
                        );
                        stats.failed += 1;
                        ok = false;
                        continue;
                    }
                    stats.cached += 1;
                }
                None => {
                    let task = self.task(input, fingerprint, Pass::Second, table.resolved_tex(&refs));
                    tokio::fs::create_dir_all(&task.job.scratch_dir).await?;
                    tasks.push(task);
                }
            }
        }

        let mut pool = WorkerPool::new(self.engine.clone(), &self.bus, self.n_workers, tasks);
        while let Some(result) = pool.next(cancel).await? {
            let file = result.input.relpath.as_str();
            match result.outcome {
                Ok(output) => {
                    self.report_tool_output(file, &output);
                    self.check_output_paths(file, &output.specials);
                    let cached = Pass2Output {
                        artifacts: output.artifacts,
                        specials: output.specials,
                    };
                    match self.materialize(&cached.artifacts).await {
                        Ok(()) => {
                            if let Err(e) = self
                                .cache
                                .store(file, &result.fingerprint, Pass::Second, &cached)
                                .await
                            {
                                self.report_cache_write_failure(file, e);
                            }
                            stats.compiled += 1;
                            self.bus
                                .post(Message::build_complete(Some(file), true, result.elapsed));
                        }
                        Err(e) => {
                            ok = false;
                            stats.failed += 1;
                            self.bus
                                .error(Some(file), "cannot write outputs", vec![e.to_string()]);
                            self.bus
                                .post(Message::build_complete(Some(file), false, result.elapsed));
                        }
                    }
                }
                Err(e) => {
                    ok = false;
                    stats.failed += 1;
                    if e.is_general() {
                        pool.stop_launching();
                    }
                    self.report_engine_failure(file, &e, result.elapsed);
                }
            }
            if let Err(e) = tokio::fs::remove_dir_all(&result.scratch_dir).await {
                tracing::trace!("[Scheduler] scratch cleanup for {file}: {e}");
            }
        }

        self.bus.note(
            None,
            format!(
                "pass 2: {} compiled, {} cached, {} failed",
                stats.compiled, stats.cached, stats.failed
            ),
            vec![],
        );
        Ok(ok)
    }

    /// Run pass 1 for one input in debug mode and post everything the engine
    /// printed. Neither the record store nor the cache is touched.
    pub async fn debug_input(&self, relpath: &str) -> Result<(), PediaError> {
        let rel = safe_relative_path(relpath)
            .ok_or_else(|| PediaError::NotFound(format!("not a project path: {relpath}")))?;
        let path = self.config.root.join(rel);
        if !path.is_file() {
            return Err(PediaError::NotFound(format!("no such input: {relpath}")));
        }
        let job = EngineJob {
            input: relpath.to_string(),
            path,
            pass: Pass::First,
            resolved_tex: String::new(),
            scratch_dir: self.config.scratch_root().join("debug"),
            debug: true,
        };
        self.bus
            .post(Message::CommandLaunched(self.engine.describe(&job)));
        let lines = match self.engine.run(job).await {
            Ok(output) => {
                let mut lines = output.transcript;
                lines.extend(output.stderr);
                lines
            }
            Err(e) => {
                let mut lines = vec![e.to_string()];
                lines.extend(e.context().iter().cloned());
                lines
            }
        };
        self.bus
            .post(Message::InputDebugOutput(InputDebugOutputMessage {
                file: relpath.to_string(),
                lines,
            }));
        Ok(())
    }

    /// Private working directory of one job, distinct for every input even
    /// when inputs share their content.
    fn scratch_dir(&self, relpath: &str, pass: Pass) -> PathBuf {
        let key = FingerprintBuilder::new("scratch")
            .update_str(relpath)
            .update_u8(pass.number() as u8)
            .finish();
        self.config.scratch_root().join(key.to_hex())
    }

    fn task(&self, input: &InputFile, fingerprint: Fingerprint, pass: Pass, resolved_tex: String) -> Task {
        Task {
            input: input.clone(),
            fingerprint,
            job: EngineJob {
                input: input.relpath.clone(),
                path: input.path.clone(),
                pass,
                resolved_tex,
                scratch_dir: self.scratch_dir(&input.relpath, pass),
                debug: false,
            },
        }
    }

    async fn materialize(&self, artifacts: &[HtmlArtifact]) -> Result<(), PediaError> {
        let root = self.config.output_root();
        for artifact in artifacts.iter() {
            let rel = safe_relative_path(&artifact.path).ok_or_else(|| {
                PediaError::BuildFailed(format!(
                    "refusing to write outside the output directory: {}",
                    artifact.path
                ))
            })?;
            write_if_changed(&root.join(rel), artifact.content.as_bytes()).await?;
        }
        Ok(())
    }

    async fn write_entrypoint(&self, outputs: &BTreeSet<String>) -> Result<(), PediaError> {
        let dest = self.config.output_root().join(ENTRYPOINT_FILE);
        write_if_changed(&dest, entrypoint_html(outputs).as_bytes()).await
    }

    /// A pass-2 `setOutputPath` should name an output the same input declared
    /// in pass 1.
    fn check_output_paths(&self, file: &str, specials: &[Special]) {
        let declared: BTreeSet<String> = self
            .store
            .records_for(file)
            .iter()
            .filter_map(|r| match r {
                IndexRecord::Output { path } => Some(path.clone()),
                _ => None,
            })
            .collect();
        for special in specials.iter() {
            if special.kind == SpecialKind::SetOutputPath && !declared.contains(special.args.trim()) {
                self.bus.warning(
                    Some(file),
                    format!("output path `{}` was not declared in pass 1", special.args.trim()),
                    vec![],
                );
            }
        }
    }

    fn report_tool_output(&self, file: &str, output: &EngineOutput) {
        for (stream, lines) in [
            (ToolOutputStream::Stdout, &output.stdout),
            (ToolOutputStream::Stderr, &output.stderr),
        ] {
            if !lines.is_empty() {
                self.bus.post(Message::ToolOutput(ToolOutputMessage {
                    stream,
                    lines: lines.clone(),
                }));
            }
        }
        for warning in output.warnings.iter() {
            self.bus.warning(Some(file), warning, vec![]);
        }
        for alert in output.alerts.iter() {
            let mut alert = alert.clone();
            if let Message::Note(a) | Message::Warning(a) | Message::Error(a) = &mut alert {
                if a.file.is_none() {
                    a.file = Some(file.to_string());
                }
            }
            self.bus.post(alert);
        }
    }

    fn report_engine_failure(&self, file: &str, error: &EngineError, elapsed: f32) {
        tracing::debug!("[Scheduler] {file} failed: {error}");
        self.bus
            .error(Some(file), error.to_string(), error.context().to_vec());
        self.bus
            .post(Message::build_complete(Some(file), false, elapsed));
    }

    fn report_cache_write_failure(&self, file: &str, error: PediaError) {
        tracing::warn!("[BuildCache] could not store result for {file}: {error}");
        self.bus.warning(
            Some(file),
            "could not update the build cache",
            vec![error.to_string()],
        );
    }

    fn report_resolution_errors(&self, report: &ResolutionReport) {
        for error in report.errors.iter() {
            self.bus.error(None, error.to_string(), error.context());
        }
        tracing::info!("[Scheduler] {} resolution error(s); skipping pass 2", report.len());
    }
}

/// The entrypoint page the web bundler consumes: one anchor per output.
pub fn entrypoint_html(outputs: &BTreeSet<String>) -> String {
    let mut html = String::from(ENTRYPOINT_HEADER);
    for path in outputs.iter() {
        html.push_str(&format!("<a href=\"{path}\"></a>\n"));
    }
    html
}

/// Write `bytes` to `dest` through a temporary file, skipping the write when
/// the content is already there.
async fn write_if_changed(dest: &Path, bytes: &[u8]) -> Result<(), PediaError> {
    if let Ok(existing) = tokio::fs::read(dest).await {
        if existing == bytes {
            return Ok(());
        }
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dest.with_file_name(format!(".{name}.tmp"));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, dest).await?;
    Ok(())
}
