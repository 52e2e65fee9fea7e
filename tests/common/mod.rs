//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```
//!
//! [`FakeEngine`] understands a tiny markup instead of TeX:
//!
//! - `\Entry{slug}{Title}` declares output `slug.html`, defines `entries:slug`
//!   there and attaches `Title` as its text; `\Entry{slug}{Title}{Plain}` gives
//!   the plain-text form separately
//! - `\e{slug}` references `entries:slug` for location and text; pass 2 turns
//!   it into a link
//! - `\usefile{path}` reports `path` as an extra source file
//! - `\warn{text}` makes the worker report a warning
//! - `%meta <index line>` passes a raw index record through
//! - `\fail` fails the input, `\general` fails it with a general error and
//!   `\slow` makes the job hang until cancelled
//!
//! Pass 2 writes into its scratch directory and reads the file back, so jobs
//! that share a scratch directory trip over each other.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use enumset::EnumSet;
use parking_lot::Mutex;
use pedia_core::{
    build::BuildDriver,
    config::BuildConfig,
    engine::{EngineError, EngineJob, EngineOutput, HtmlArtifact, Pass, Special, SpecialKind, TexEngine},
    messages::{AlertMessage, Message, MessageBus},
    records::{metadata::parse_line, parse_cseq_line, DataKind, IndexRecord},
};
use regex::Regex;
use tempfile::TempDir;

pub const INDEX: &str = "entries";

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

fn entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\Entry\{([^}]*)\}\{([^}]*)\}(?:\{([^}]*)\})?").unwrap())
}

fn usefile_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\usefile\{([^}]*)\}").unwrap())
}

fn warn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\warn\{([^}]*)\}").unwrap())
}

fn ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\e\{([^}]*)\}").unwrap())
}

/// A scratch project with a `txt/` input directory.
pub struct Project {
    pub dir: TempDir,
    stamp: AtomicI64,
}

impl Project {
    pub fn new() -> Project {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("txt")).unwrap();
        Project {
            dir,
            stamp: AtomicI64::new(1_600_000_000),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file and give it a fresh mtime, so rewrites are always noticed.
    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        let secs = self.stamp.fetch_add(10, Ordering::SeqCst);
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(secs, 0)).unwrap();
        path
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.root().join(rel)).unwrap();
    }

    pub fn config(&self) -> BuildConfig {
        BuildConfig {
            root: self.root().to_path_buf(),
            n_workers: 4,
            indices: vec![INDEX.to_string()],
            ..BuildConfig::default()
        }
    }

    /// Contents of a file under the output directory.
    pub fn output(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join("build").join(rel)).ok()
    }

    pub async fn driver(&self, engine: FakeEngine) -> (BuildDriver<FakeEngine, RecordingBus>, RecordingBus) {
        let bus = RecordingBus::default();
        let driver = BuildDriver::new(self.config(), engine, bus.clone())
            .await
            .unwrap();
        (driver, bus)
    }
}

/// Scripted stand-in for the TeX worker.
#[derive(Clone, Default)]
pub struct FakeEngine {
    calls: Arc<Mutex<Vec<(String, Pass)>>>,
    scratch_dirs: Arc<Mutex<Vec<PathBuf>>>,
    started: Arc<AtomicUsize>,
    version: String,
}

impl FakeEngine {
    pub fn new() -> FakeEngine {
        FakeEngine::default()
    }

    /// An engine whose cache salt differs from the default one.
    pub fn with_version(version: &str) -> FakeEngine {
        FakeEngine {
            version: version.to_string(),
            ..FakeEngine::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Pass)> {
        let mut calls = self.calls.lock().clone();
        calls.sort();
        calls
    }

    pub fn compiled(&self, pass: Pass) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(_, p)| *p == pass)
            .map(|(f, _)| f)
            .collect()
    }

    pub fn reset(&self) {
        self.calls.lock().clear();
    }

    /// Scratch directories handed to pass-2 jobs.
    pub fn scratch_dirs(&self) -> Vec<PathBuf> {
        self.scratch_dirs.lock().clone()
    }

    /// Jobs that have begun running, including ones still in flight.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn first_pass(&self, content: &str) -> Result<EngineOutput, EngineError> {
        let mut records = Vec::new();
        for cap in entry_re().captures_iter(content) {
            let slug = &cap[1];
            records.push(IndexRecord::Output {
                path: format!("{slug}.html"),
            });
            records.push(IndexRecord::Define {
                index: INDEX.into(),
                entry: slug.into(),
                fragment: String::new(),
            });
            records.push(IndexRecord::Text {
                index: INDEX.into(),
                entry: slug.into(),
                tex: cap[2].to_string(),
                plain: cap.get(3).map_or(&cap[2], |m| m.as_str()).to_string(),
            });
        }
        for cap in ref_re().captures_iter(content) {
            records.push(IndexRecord::reference(
                INDEX,
                &cap[1],
                DataKind::Location | DataKind::Text,
            ));
        }
        for line in content.lines() {
            if let Some(raw) = line.trim().strip_prefix("%meta ") {
                let record = parse_line(raw)
                    .map_err(|e| EngineError::specific(format!("malformed metadata: {e}"), vec![raw.to_string()]))?;
                records.push(record);
            }
        }
        let alerts = warn_re()
            .captures_iter(content)
            .map(|cap| Message::Warning(AlertMessage::new(None, &cap[1], vec![])))
            .collect();
        Ok(EngineOutput {
            records,
            dependencies: usefile_re()
                .captures_iter(content)
                .map(|cap| cap[1].to_string())
                .collect(),
            alerts,
            stdout: vec![format!("pass 1 ok ({} bytes)", content.len())],
            transcript: content.lines().map(String::from).collect(),
            ..EngineOutput::default()
        })
    }

    async fn use_scratch_dir(&self, job: &EngineJob) -> Result<(), EngineError> {
        self.scratch_dirs.lock().push(job.scratch_dir.clone());
        let marker = job.scratch_dir.join("job.txt");
        let scratch_err =
            |e: std::io::Error| EngineError::specific(format!("scratch directory trouble: {e}"), vec![]);
        tokio::fs::write(&marker, job.input.as_bytes())
            .await
            .map_err(scratch_err)?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let back = tokio::fs::read_to_string(&marker)
            .await
            .map_err(scratch_err)?;
        if back != job.input {
            return Err(EngineError::specific(
                format!("scratch directory shared with {back}"),
                vec![],
            ));
        }
        Ok(())
    }

    fn second_pass(&self, content: &str, resolved_tex: &str) -> Result<EngineOutput, EngineError> {
        let mut resolved: HashMap<(String, String), String> = HashMap::new();
        let mut terminated = false;
        for line in resolved_tex.lines() {
            if line == "---" {
                terminated = true;
                break;
            }
            let (cseq, args) = parse_cseq_line(line)
                .map_err(|e| EngineError::general(format!("bad resolved line: {e}"), vec![line.into()]))?;
            if cseq != "pediaResolvedRef" || args.len() != 4 {
                return Err(EngineError::general("unexpected resolved line", vec![line.into()]));
            }
            resolved.insert((args[1].to_string(), args[2].to_string()), args[3].to_string());
        }
        if !terminated {
            return Err(EngineError::general("resolved references not terminated", vec![]));
        }

        let Some(slug) = entry_re().captures(content).map(|c| c[1].to_string()) else {
            return Ok(EngineOutput::default());
        };
        let body: String = content
            .lines()
            .filter(|l| !l.trim().starts_with('%'))
            .collect::<Vec<_>>()
            .join("\n");
        let body = entry_re().replace_all(&body, "<h1 id=\"$1\">$2</h1>");
        let body = ref_re().replace_all(&body, |cap: &regex::Captures| {
            let get = |datum: &str| {
                resolved
                    .get(&(cap[1].to_string(), datum.to_string()))
                    .cloned()
                    .unwrap_or_else(|| "?".to_string())
            };
            format!("<a href=\"{}\">{}</a>", get("loc"), get("text tex"))
        });
        let path = format!("{slug}.html");
        Ok(EngineOutput {
            artifacts: vec![HtmlArtifact {
                path: path.clone(),
                content: format!("<article>\n{body}\n</article>\n"),
            }],
            specials: vec![Special {
                kind: SpecialKind::SetOutputPath,
                args: path,
            }],
            ..EngineOutput::default()
        })
    }
}

impl TexEngine for FakeEngine {
    async fn run(&self, job: EngineJob) -> Result<EngineOutput, EngineError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let content = tokio::fs::read_to_string(&job.path)
            .await
            .map_err(|e| EngineError::specific(format!("cannot read input: {e}"), vec![]))?;
        if content.contains("\\slow") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.calls.lock().push((job.input.clone(), job.pass));
        if content.contains("\\general") {
            return Err(EngineError::general("worker environment is broken", vec![]));
        }
        if content.contains("\\fail") {
            return Err(EngineError::specific(
                format!("TeX error in {}", job.input),
                vec!["! Undefined control sequence.".into(), "l.1 \\fail".into()],
            ));
        }
        match job.pass {
            Pass::First => self.first_pass(&content),
            Pass::Second => {
                self.use_scratch_dir(&job).await?;
                self.second_pass(&content, &job.resolved_tex)
            }
        }
    }

    fn identity(&self) -> String {
        format!("fake-engine {}", self.version)
    }
}

/// Bus that keeps everything posted to it.
#[derive(Clone, Default)]
pub struct RecordingBus {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl MessageBus for RecordingBus {
    fn post(&self, msg: Message) {
        self.messages.lock().push(msg);
    }
}

impl RecordingBus {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    pub fn count(&self, kind: &str) -> usize {
        self.messages.lock().iter().filter(|m| m.kind() == kind).count()
    }

    pub fn errors(&self) -> Vec<AlertMessage> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::Error(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<AlertMessage> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::Warning(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn phases(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::PhaseStarted(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Shorthand for the flags every `\e{..}` reference carries.
pub fn link_flags() -> EnumSet<DataKind> {
    DataKind::Location | DataKind::Text
}

/// Poll `cond` until it holds, failing the test after ten seconds.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
