//! The seam between the scheduler and the external TeX-to-HTML engine.
//!
//! The scheduler only knows [`TexEngine`]. [`ProcessEngine`] is the production
//! implementation: it launches one worker subprocess per job and speaks the
//! worker's line protocol on stdout:
//!
//! - `pedia:meta <index line>`: an index record (pass 1)
//! - `pedia:output <relpath>`: an HTML file written below the job's scratch
//!   directory (pass 2)
//! - `pedia:special tdux:<name> <args>`: one entry of the per-file action log
//! - `pedia:dep <relpath>`: an extra source file the compilation read
//! - `pedia:general-error`: the failure, if any, is environmental
//! - `pedia-msg:<json>`: a note, warning or error in the bus wire format
//!
//! Everything else on stdout, and all of stderr, is tool output. Output that is
//! not valid UTF-8 is read lossily. Pass 2 gets the resolved-reference block on
//! stdin, which is closed once written.
use std::{
    fmt,
    future::Future,
    io,
    path::{Component, Path, PathBuf},
    process::Stdio,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
};

use crate::{
    cache::{Fingerprint, FingerprintBuilder},
    config::EngineConfig,
    messages::Message,
    records::{metadata, IndexRecord},
};

/// Error context lines kept from a failed worker's stderr.
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pass {
    First,
    Second,
}

impl Pass {
    pub fn number(&self) -> i64 {
        match self {
            Pass::First => 1,
            Pass::Second => 2,
        }
    }

    /// Worker subcommand selecting this pass.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Pass::First => "first-pass",
            Pass::Second => "second-pass",
        }
    }

    /// Name of the build phase announced on the bus.
    pub fn phase_name(&self) -> &'static str {
        match self {
            Pass::First => "pass-1",
            Pass::Second => "pass-2",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pass {}", self.number())
    }
}

/// One compilation request.
#[derive(Debug, Clone)]
pub struct EngineJob {
    /// Repository-relative input path.
    pub input: String,
    pub path: PathBuf,
    pub pass: Pass,
    /// Resolved-reference block; empty for pass 1.
    pub resolved_tex: String,
    /// Private directory the worker writes pass-2 HTML into.
    pub scratch_dir: PathBuf,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlArtifact {
    /// Path relative to the output directory.
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialKind {
    AddTemplate,
    SetTemplate,
    SetOutputPath,
    Emit,
    SetTemplateVariable,
    ProvideFile,
    ProvideSpecial,
}

impl SpecialKind {
    pub fn from_name(name: &str) -> Option<SpecialKind> {
        match name {
            "addTemplate" => Some(SpecialKind::AddTemplate),
            "setTemplate" => Some(SpecialKind::SetTemplate),
            "setOutputPath" => Some(SpecialKind::SetOutputPath),
            "emit" => Some(SpecialKind::Emit),
            "setTemplateVariable" => Some(SpecialKind::SetTemplateVariable),
            "provideFile" => Some(SpecialKind::ProvideFile),
            "provideSpecial" => Some(SpecialKind::ProvideSpecial),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SpecialKind::AddTemplate => "addTemplate",
            SpecialKind::SetTemplate => "setTemplate",
            SpecialKind::SetOutputPath => "setOutputPath",
            SpecialKind::Emit => "emit",
            SpecialKind::SetTemplateVariable => "setTemplateVariable",
            SpecialKind::ProvideFile => "provideFile",
            SpecialKind::ProvideSpecial => "provideSpecial",
        }
    }
}

/// One `tdux:*` special from a pass-2 compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Special {
    pub kind: SpecialKind,
    pub args: String,
}

impl Special {
    /// Parse `tdux:<name> <args>`. Returns the offending text for unknown or
    /// non-`tdux` specials.
    pub fn parse(text: &str) -> Result<Special, String> {
        let (head, args) = text.split_once(' ').unwrap_or((text, ""));
        head.strip_prefix("tdux:")
            .and_then(SpecialKind::from_name)
            .map(|kind| Special {
                kind,
                args: args.to_string(),
            })
            .ok_or_else(|| text.to_string())
    }
}

/// What one successful compilation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub records: Vec<IndexRecord>,
    pub artifacts: Vec<HtmlArtifact>,
    pub specials: Vec<Special>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Non-fatal problems to report against the input.
    pub warnings: Vec<String>,
    /// Extra source files read, relative to the project root.
    pub dependencies: Vec<String>,
    /// Note, warning and error events reported by the worker itself.
    pub alerts: Vec<Message>,
    /// Every raw stdout line, kept only for debug jobs.
    pub transcript: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum EngineError {
    /// This input failed; other inputs are unaffected.
    #[error("{message}")]
    Specific {
        message: String,
        context: Vec<String>,
    },
    /// The environment is broken; no further work should be launched.
    #[error("{message}")]
    General {
        message: String,
        context: Vec<String>,
    },
}

impl EngineError {
    pub fn specific(message: impl ToString, context: Vec<String>) -> EngineError {
        EngineError::Specific {
            message: message.to_string(),
            context,
        }
    }

    pub fn general(message: impl ToString, context: Vec<String>) -> EngineError {
        EngineError::General {
            message: message.to_string(),
            context,
        }
    }

    pub fn is_general(&self) -> bool {
        matches!(self, EngineError::General { .. })
    }

    pub fn context(&self) -> &[String] {
        match self {
            EngineError::Specific { context, .. } | EngineError::General { context, .. } => context,
        }
    }
}

/// Something that can compile one input for one pass.
pub trait TexEngine: Send + Sync + 'static {
    fn run(
        &self,
        job: EngineJob,
    ) -> impl Future<Output = Result<EngineOutput, EngineError>> + Send;

    /// Stable description of the engine configuration. Cache fingerprints are
    /// salted with it.
    fn identity(&self) -> String;

    /// Human-readable command line for `command_launched` events.
    fn describe(&self, job: &EngineJob) -> String {
        format!("{} {}", job.pass.subcommand(), job.input)
    }

    fn salt(&self) -> Fingerprint {
        FingerprintBuilder::new("engine")
            .update_str(env!("CARGO_PKG_VERSION"))
            .update_str(&self.identity())
            .finish()
    }
}

/// A classified line of worker stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    Meta(IndexRecord),
    Output(String),
    Special(Special),
    UnknownSpecial(String),
    Dependency(String),
    Alert(Message),
    UnreadableAlert(String),
    GeneralError,
    Plain(String),
}

pub fn parse_worker_line(line: &str) -> Result<WorkerLine, metadata::MetadataError> {
    if let Some(json) = line.strip_prefix("pedia-msg:") {
        return Ok(match Message::from_wire(json) {
            Ok(msg @ (Message::Note(_) | Message::Warning(_) | Message::Error(_))) => {
                WorkerLine::Alert(msg)
            }
            _ => WorkerLine::UnreadableAlert(json.to_string()),
        });
    }
    let Some(rest) = line.strip_prefix("pedia:") else {
        return Ok(WorkerLine::Plain(line.to_string()));
    };
    if rest == "general-error" {
        return Ok(WorkerLine::GeneralError);
    }
    if let Some(meta) = rest.strip_prefix("meta ") {
        return metadata::parse_line(meta).map(WorkerLine::Meta);
    }
    if let Some(path) = rest.strip_prefix("output ") {
        return Ok(WorkerLine::Output(path.trim().to_string()));
    }
    if let Some(path) = rest.strip_prefix("dep ") {
        return Ok(WorkerLine::Dependency(path.trim().to_string()));
    }
    if let Some(special) = rest.strip_prefix("special ") {
        return Ok(match Special::parse(special) {
            Ok(s) => WorkerLine::Special(s),
            Err(text) => WorkerLine::UnknownSpecial(text),
        });
    }
    Ok(WorkerLine::Plain(line.to_string()))
}

/// `Some` if `rel` is a plain relative path that stays below its base.
pub fn safe_relative_path(rel: &str) -> Option<PathBuf> {
    let path = Path::new(rel);
    let plain = !rel.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    plain.then(|| path.to_path_buf())
}

#[derive(Debug, Default)]
struct StdoutCollector {
    output: EngineOutput,
    outputs: Vec<String>,
    malformed: Vec<String>,
    general_error: bool,
    debug: bool,
}

impl StdoutCollector {
    fn new(debug: bool) -> StdoutCollector {
        StdoutCollector {
            debug,
            ..Default::default()
        }
    }

    fn line(&mut self, line: &str) {
        if self.debug {
            self.output.transcript.push(line.to_string());
        }
        match parse_worker_line(line) {
            Ok(WorkerLine::Meta(record)) => self.output.records.push(record),
            Ok(WorkerLine::Output(path)) => self.outputs.push(path),
            Ok(WorkerLine::Special(special)) => self.output.specials.push(special),
            Ok(WorkerLine::UnknownSpecial(text)) => self
                .output
                .warnings
                .push(format!("unrecognized special `{text}`")),
            Ok(WorkerLine::Dependency(path)) => match safe_relative_path(&path) {
                Some(_) => self.output.dependencies.push(path),
                None => self
                    .output
                    .warnings
                    .push(format!("ignoring dependency outside the project: {path}")),
            },
            Ok(WorkerLine::Alert(msg)) => self.output.alerts.push(msg),
            Ok(WorkerLine::UnreadableAlert(json)) => self
                .output
                .warnings
                .push(format!("unreadable worker message `{json}`")),
            Ok(WorkerLine::GeneralError) => self.general_error = true,
            Ok(WorkerLine::Plain(text)) => self.output.stdout.push(text),
            Err(e) => self.malformed.push(e.to_string()),
        }
    }
}

fn tail(lines: &[String]) -> Vec<String> {
    lines[lines.len().saturating_sub(STDERR_TAIL)..].to_vec()
}

/// Feed every line of `reader` to `sink`. Bytes that are not UTF-8 are
/// replaced rather than ending the stream.
async fn for_each_line<R: AsyncBufRead + Unpin>(
    mut reader: R,
    mut sink: impl FnMut(String),
) -> io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        sink(String::from_utf8_lossy(&buf).into_owned());
    }
}

/// One line per alert, for the context of a failed job.
fn alert_lines(alerts: &[Message]) -> impl Iterator<Item = String> + '_ {
    alerts.iter().filter_map(|msg| match msg {
        Message::Note(a) => Some(format!("note: {}", a.message)),
        Message::Warning(a) => Some(format!("warning: {}", a.message)),
        Message::Error(a) => Some(format!("error: {}", a.message)),
        _ => None,
    })
}

/// Runs an external worker program once per job.
///
/// The command line is `program args... first-pass|second-pass [--debug] <input>`,
/// with `PEDIA_SCRATCH_DIR` naming the job's scratch directory. Dropping the
/// future kills the worker.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> ProcessEngine {
        ProcessEngine {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &EngineConfig) -> ProcessEngine {
        ProcessEngine::new(config.program.clone(), config.args.clone())
    }

    async fn collect_artifacts(
        job: &EngineJob,
        outputs: &[String],
    ) -> Result<Vec<HtmlArtifact>, EngineError> {
        let mut artifacts = Vec::with_capacity(outputs.len());
        for rel in outputs.iter() {
            let Some(rel_path) = safe_relative_path(rel) else {
                return Err(EngineError::specific(
                    format!("worker reported an output outside its scratch directory: {rel}"),
                    vec![],
                ));
            };
            let content = tokio::fs::read_to_string(job.scratch_dir.join(rel_path))
                .await
                .map_err(|e| {
                    EngineError::specific(format!("cannot read worker output {rel}"), vec![e.to_string()])
                })?;
            artifacts.push(HtmlArtifact {
                path: rel.clone(),
                content,
            });
        }
        Ok(artifacts)
    }
}

impl TexEngine for ProcessEngine {
    fn identity(&self) -> String {
        let mut id = self.program.display().to_string();
        for arg in self.args.iter() {
            id.push(' ');
            id.push_str(arg);
        }
        id
    }

    fn describe(&self, job: &EngineJob) -> String {
        format!(
            "{} {} {}",
            self.identity(),
            job.pass.subcommand(),
            job.path.display()
        )
    }

    async fn run(&self, job: EngineJob) -> Result<EngineOutput, EngineError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(job.pass.subcommand());
        if job.debug {
            cmd.arg("--debug");
        }
        cmd.arg(&job.path)
            .env("PEDIA_SCRATCH_DIR", &job.scratch_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::general(
                format!("failed to launch TeX worker `{}`", self.program.display()),
                vec![e.to_string()],
            )
        })?;
        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(EngineError::general("TeX worker pipes unavailable", vec![]));
        };

        let mut collector = StdoutCollector::new(job.debug);
        let mut stderr_lines = Vec::new();
        let resolved_tex = (job.pass == Pass::Second).then_some(job.resolved_tex.as_bytes());
        // owns stdin, so the worker sees EOF as soon as this finishes
        let feed = async move {
            if let Some(bytes) = resolved_tex {
                stdin.write_all(bytes).await?;
            }
            stdin.flush().await?;
            drop(stdin);
            Ok::<_, io::Error>(())
        };
        let read_stdout = for_each_line(BufReader::new(stdout), |line| collector.line(&line));
        let read_stderr = for_each_line(BufReader::new(stderr), |line| stderr_lines.push(line));
        let (fed, read_out, read_err) = tokio::join!(feed, read_stdout, read_stderr);
        if let Err(e) = fed {
            tracing::debug!("[Engine] {}: worker did not take stdin: {e}", job.input);
        }
        for res in [read_out, read_err] {
            if let Err(e) = res {
                collector
                    .output
                    .warnings
                    .push(format!("error reading worker output: {e}"));
            }
        }

        let status = child.wait().await.map_err(|e| {
            EngineError::general("failed to wait for TeX worker", vec![e.to_string()])
        })?;

        let StdoutCollector {
            mut output,
            outputs,
            malformed,
            general_error,
            ..
        } = collector;
        output.stderr = stderr_lines;

        if general_error {
            let mut context: Vec<String> = alert_lines(&output.alerts).collect();
            context.extend(tail(&output.stderr));
            return Err(EngineError::general(
                format!("TeX worker reported a general failure ({status})"),
                context,
            ));
        }
        if !status.success() {
            let mut context: Vec<String> = alert_lines(&output.alerts).collect();
            context.extend(tail(&output.stderr));
            context.extend(malformed);
            return Err(EngineError::specific(
                format!("{} of {} failed ({status})", job.pass, job.input),
                context,
            ));
        }
        if !malformed.is_empty() {
            return Err(EngineError::specific(
                format!("{} emitted malformed index lines", job.input),
                malformed,
            ));
        }
        output.artifacts = ProcessEngine::collect_artifacts(&job, &outputs).await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DataKind;
    use test_log::test;

    #[test]
    fn worker_lines_are_classified() {
        assert_eq!(
            parse_worker_line("pedia:meta \\iref{entries}{foo}{l}").unwrap(),
            WorkerLine::Meta(IndexRecord::reference(
                "entries",
                "foo",
                DataKind::Location.into()
            ))
        );
        assert_eq!(
            parse_worker_line("pedia:output foo/index.html").unwrap(),
            WorkerLine::Output("foo/index.html".into())
        );
        assert_eq!(
            parse_worker_line("pedia:special tdux:setOutputPath foo/index.html").unwrap(),
            WorkerLine::Special(Special {
                kind: SpecialKind::SetOutputPath,
                args: "foo/index.html".into()
            })
        );
        assert_eq!(
            parse_worker_line("pedia:special tdux:frobnicate").unwrap(),
            WorkerLine::UnknownSpecial("tdux:frobnicate".into())
        );
        assert_eq!(
            parse_worker_line("pedia:general-error").unwrap(),
            WorkerLine::GeneralError
        );
        assert_eq!(
            parse_worker_line("This is TeX").unwrap(),
            WorkerLine::Plain("This is TeX".into())
        );
        assert!(parse_worker_line("pedia:meta \\idef{entries}").is_err());
        assert_eq!(
            parse_worker_line("pedia:dep cls/pedia.cls").unwrap(),
            WorkerLine::Dependency("cls/pedia.cls".into())
        );
        assert_eq!(
            parse_worker_line(
                r#"pedia-msg:{"warning":{"file":"txt/a.tex","message":"Overfull \\hbox","context":[]}}"#
            )
            .unwrap(),
            WorkerLine::Alert(Message::Warning(crate::messages::AlertMessage::new(
                Some("txt/a.tex"),
                "Overfull \\hbox",
                vec![]
            )))
        );
        assert_eq!(
            parse_worker_line("pedia-msg:\"server_quitting\"").unwrap(),
            WorkerLine::UnreadableAlert("\"server_quitting\"".into())
        );
        assert_eq!(
            parse_worker_line("pedia-msg:{oops").unwrap(),
            WorkerLine::UnreadableAlert("{oops".into())
        );
    }

    #[test]
    fn special_names_round_trip() {
        for name in [
            "addTemplate",
            "setTemplate",
            "setOutputPath",
            "emit",
            "setTemplateVariable",
            "provideFile",
            "provideSpecial",
        ] {
            let kind = SpecialKind::from_name(name).unwrap();
            assert_eq!(kind.name(), name);
        }
        assert_eq!(Special::parse("tdux:emit").unwrap().args, "");
        assert!(Special::parse("html:emit").is_err());
    }

    #[test]
    fn relative_paths_must_stay_below_their_base() {
        assert!(safe_relative_path("a/b.html").is_some());
        assert!(safe_relative_path("../b.html").is_none());
        assert!(safe_relative_path("/etc/passwd").is_none());
        assert!(safe_relative_path("").is_none());
    }

    #[test]
    fn collector_gathers_protocol_and_tool_output() {
        let mut c = StdoutCollector::new(true);
        for line in [
            "pedia:meta \\output{a.html}",
            "pedia:meta \\bogus",
            "Overfull \\hbox",
            "pedia:special tdux:nope",
        ] {
            c.line(line);
        }
        assert_eq!(c.output.records.len(), 1);
        assert_eq!(c.malformed.len(), 1);
        assert_eq!(c.output.stdout, vec!["Overfull \\hbox".to_string()]);
        assert_eq!(c.output.warnings.len(), 1);
        assert_eq!(c.output.transcript.len(), 4);
        assert!(!c.general_error);
    }

    #[test]
    fn collector_keeps_dependencies_below_the_project() {
        let mut c = StdoutCollector::new(false);
        for line in [
            "pedia:dep cls/pedia.cls",
            "pedia:dep ../outside.tex",
            r#"pedia-msg:{"error":{"file":null,"message":"Missing $ inserted","context":[]}}"#,
            "pedia-msg:not json",
        ] {
            c.line(line);
        }
        assert_eq!(c.output.dependencies, vec!["cls/pedia.cls".to_string()]);
        assert_eq!(c.output.alerts.len(), 1);
        assert_eq!(c.output.alerts[0].kind(), "error");
        assert_eq!(c.output.warnings.len(), 2);
        assert!(c.output.stdout.is_empty());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use test_log::test;

        const WORKER: &str = r#"
mode="$1"
case "$2" in
  *fail.tex) echo "boom" >&2; exit 3 ;;
  *env.tex) printf '%s\n' 'pedia:general-error'; exit 1 ;;
  *latin1.tex)
    printf '%s\n' 'pedia:meta \output{a.html}'
    printf 'caf\351 au lait\r\n'
    printf '%s\n' 'pedia:meta \idef{entries}{a}{}' 'pedia:meta \iref{entries}{a}{l}'
    exit 0 ;;
  *drain.tex) cat >/dev/null; echo "drained"; exit 0 ;;
  *noisy.tex)
    printf '%s\n' 'pedia:dep cls/pedia.cls' 'pedia-msg:{"warning":{"file":null,"message":"Overfull hbox","context":[]}}'
    [ "$mode" = "second-pass" ] && exit 4
    exit 0 ;;
esac
if [ "$mode" = "first-pass" ]; then
  printf '%s\n' 'pedia:meta \output{a.html}' 'pedia:meta \idef{entries}{a}{}' 'chatter'
else
  resolved=""
  while IFS= read -r line; do
    [ "$line" = "---" ] && break
    resolved="$resolved$line"
  done
  printf '<p>%s</p>\n' "$resolved" > "$PEDIA_SCRATCH_DIR/a.html"
  printf '%s\n' 'pedia:output a.html' 'pedia:special tdux:setOutputPath a.html'
fi
"#;

        fn engine(dir: &Path) -> ProcessEngine {
            let script = dir.join("worker.sh");
            std::fs::write(&script, WORKER).unwrap();
            ProcessEngine::new("/bin/sh", vec![script.display().to_string()])
        }

        fn job(dir: &Path, input: &str, pass: Pass) -> EngineJob {
            let scratch = dir.join("scratch");
            std::fs::create_dir_all(&scratch).unwrap();
            EngineJob {
                input: format!("txt/{input}"),
                path: dir.join(input),
                pass,
                resolved_tex: "\\pediaResolvedRef{entries}{a}{loc}{a.html}\n---\n".into(),
                scratch_dir: scratch,
                debug: false,
            }
        }

        #[test(tokio::test)]
        async fn first_pass_reports_records() {
            let dir = tempfile::tempdir().unwrap();
            let out = engine(dir.path())
                .run(job(dir.path(), "a.tex", Pass::First))
                .await
                .unwrap();
            assert_eq!(out.records.len(), 2);
            assert_eq!(out.stdout, vec!["chatter".to_string()]);
            assert!(out.artifacts.is_empty());
        }

        #[test(tokio::test)]
        async fn second_pass_reads_stdin_and_collects_artifacts() {
            let dir = tempfile::tempdir().unwrap();
            let out = engine(dir.path())
                .run(job(dir.path(), "a.tex", Pass::Second))
                .await
                .unwrap();
            assert_eq!(
                out.artifacts,
                vec![HtmlArtifact {
                    path: "a.html".into(),
                    content: "<p>\\pediaResolvedRef{entries}{a}{loc}{a.html}</p>\n".into()
                }]
            );
            assert_eq!(out.specials[0].kind, SpecialKind::SetOutputPath);
        }

        #[test(tokio::test)]
        async fn failures_are_classified() {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine(dir.path());
            let err = engine
                .run(job(dir.path(), "fail.tex", Pass::First))
                .await
                .unwrap_err();
            assert!(!err.is_general());
            assert_eq!(err.context(), &["boom".to_string()]);

            let err = engine
                .run(job(dir.path(), "env.tex", Pass::First))
                .await
                .unwrap_err();
            assert!(err.is_general());

            let missing = ProcessEngine::new(dir.path().join("no-such-worker"), vec![]);
            let err = missing
                .run(job(dir.path(), "a.tex", Pass::First))
                .await
                .unwrap_err();
            assert!(err.is_general());
        }

        #[test(tokio::test)]
        async fn undecodable_output_does_not_truncate_records() {
            let dir = tempfile::tempdir().unwrap();
            let out = engine(dir.path())
                .run(job(dir.path(), "latin1.tex", Pass::First))
                .await
                .unwrap();
            assert_eq!(out.records.len(), 3);
            assert_eq!(out.stdout, vec!["caf\u{fffd} au lait".to_string()]);
            assert!(out.warnings.is_empty(), "{:?}", out.warnings);
        }

        #[test(tokio::test)]
        async fn workers_reading_stdin_to_the_end_finish() {
            let dir = tempfile::tempdir().unwrap();
            let eng = engine(dir.path());
            let run = eng.run(job(dir.path(), "drain.tex", Pass::Second));
            let out = tokio::time::timeout(std::time::Duration::from_secs(10), run)
                .await
                .expect("worker should see the end of its input")
                .unwrap();
            assert_eq!(out.stdout, vec!["drained".to_string()]);
        }

        #[test(tokio::test)]
        async fn dependencies_and_worker_messages_are_collected() {
            let dir = tempfile::tempdir().unwrap();
            let engine = engine(dir.path());
            let out = engine
                .run(job(dir.path(), "noisy.tex", Pass::First))
                .await
                .unwrap();
            assert_eq!(out.dependencies, vec!["cls/pedia.cls".to_string()]);
            assert_eq!(out.alerts.len(), 1);
            assert_eq!(out.alerts[0].kind(), "warning");

            let err = engine
                .run(job(dir.path(), "noisy.tex", Pass::Second))
                .await
                .unwrap_err();
            assert_eq!(err.context(), &["warning: Overfull hbox".to_string()]);
        }
    }
}
