use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use bytefit_core::{ProgressEvent, ProgressEventType, ProgressSink};
use serde::Serialize;

pub const SINK_ENV: &str = "BYTEFIT_PROGRESS_SINK";
pub const FILE_ENV: &str = "BYTEFIT_PROGRESS_FILE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkKind {
    Stdout,
    Stderr,
    File(PathBuf),
    Log,
}

/// Maps the sink mode and file variables to a sink. A caller that prints
/// its own output on stdout passes `stdout_reserved` and gets stderr for
/// the `stdout` mode.
pub fn sink_kind(mode: &str, file: Option<String>, stdout_reserved: bool) -> Option<SinkKind> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "stdout" if stdout_reserved => Some(SinkKind::Stderr),
        "stdout" => Some(SinkKind::Stdout),
        "stderr" => Some(SinkKind::Stderr),
        "file" => {
            let path = file.filter(|v| !v.trim().is_empty())?;
            Some(SinkKind::File(PathBuf::from(path)))
        }
        "log" => Some(SinkKind::Log),
        _ => None,
    }
}

pub fn sink_from_env(stdout_reserved: bool) -> Option<Box<dyn ProgressSink>> {
    let mode = std::env::var(SINK_ENV).ok()?;
    let sink: Box<dyn ProgressSink> = match sink_kind(&mode, std::env::var(FILE_ENV).ok(), stdout_reserved)? {
        SinkKind::Stdout => Box::new(StreamSink::Stdout),
        SinkKind::Stderr => Box::new(StreamSink::Stderr),
        SinkKind::File(path) => Box::new(FileSink::new(path)),
        SinkKind::Log => Box::new(LogSink),
    };
    Some(sink)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressEnvelope {
    event_type: String,
    phase: String,
    target: u64,
    parameter: Option<f64>,
    size: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    detail: Option<String>,
}

impl From<&ProgressEvent> for ProgressEnvelope {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            phase: format!("{:?}", event.phase),
            target: event.target,
            parameter: event.parameter,
            size: event.size,
            width: event.dimensions.map(|d| d.width),
            height: event.dimensions.map(|d| d.height),
            detail: event.detail.clone(),
        }
    }
}

/// JSON lines on one of the standard streams.
pub enum StreamSink {
    Stdout,
    Stderr,
}

impl ProgressSink for StreamSink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&ProgressEnvelope::from(&event)) {
            match self {
                Self::Stdout => println!("{}", line),
                Self::Stderr => eprintln!("{}", line),
            }
        }
    }
}

pub struct FileSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("progress file lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating progress log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening progress file")?;
        writeln!(file, "{}", line).context("writing progress line")?;
        Ok(())
    }
}

impl ProgressSink for FileSink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&ProgressEnvelope::from(&event)) {
            if let Err(err) = self.write_line(&line) {
                tracing::debug!(error = %err, path = %self.path.display(), "dropping progress event");
            }
        }
    }
}

/// Forwards progress events to `tracing`.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, event: ProgressEvent) {
        let phase = event.phase;
        match event.event_type {
            ProgressEventType::Warning => tracing::warn!(
                ?phase,
                target_bytes = event.target,
                detail = event.detail.as_deref().unwrap_or_default(),
                "search warning"
            ),
            ProgressEventType::Probe => tracing::debug!(
                ?phase,
                target_bytes = event.target,
                parameter = ?event.parameter,
                size = ?event.size,
                "probe"
            ),
            other => tracing::info!(
                ?phase,
                event = ?other,
                target_bytes = event.target,
                size = ?event.size,
                "search phase"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytefit_core::{EncodeResult, SearchPhase};
    use bytefit_image::ImageSize;

    use super::*;

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("progress.jsonl");
        let sink = FileSink::new(path.clone());
        let result = EncodeResult::new(vec![0; 42], ImageSize::new(4, 3), Some(70));
        sink.emit(ProgressEvent::phase_start(SearchPhase::Quality, 100));
        sink.emit(ProgressEvent::probe(SearchPhase::Quality, 100, 70.0, &result));

        let text = std::fs::read_to_string(&path).expect("read progress file");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["eventType"], "PhaseStart");
        assert_eq!(lines[1]["size"], 42);
        assert_eq!(lines[1]["width"], 4);
        assert_eq!(lines[1]["parameter"], 70.0);
    }

    #[test]
    fn stdout_mode_moves_to_stderr_when_stdout_is_taken() {
        assert_eq!(sink_kind("stdout", None, false), Some(SinkKind::Stdout));
        assert_eq!(sink_kind(" STDOUT ", None, true), Some(SinkKind::Stderr));
        assert_eq!(sink_kind("stderr", None, false), Some(SinkKind::Stderr));
        assert_eq!(sink_kind("log", None, true), Some(SinkKind::Log));
    }

    #[test]
    fn file_mode_needs_a_path() {
        assert_eq!(
            sink_kind("file", Some("/tmp/progress.jsonl".to_string()), true),
            Some(SinkKind::File(PathBuf::from("/tmp/progress.jsonl")))
        );
        assert_eq!(sink_kind("file", Some("  ".to_string()), false), None);
        assert_eq!(sink_kind("file", None, false), None);
        assert_eq!(sink_kind("http", None, false), None);
    }

    #[test]
    fn envelope_flattens_dimensions() {
        let envelope = ProgressEnvelope::from(&ProgressEvent::warning(SearchPhase::Padding, 10, "too small"));
        assert_eq!(envelope.phase, "Padding");
        assert_eq!(envelope.width, None);
        assert_eq!(envelope.detail.as_deref(), Some("too small"));
    }
}
