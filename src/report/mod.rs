//! Report output: results-directory lifecycle, per-report text streams,
//! and the structured JSONL scan log.
//!
//! Each report file has its own stream with writes serialized by a
//! per-stream mutex; engines append lines in whatever order their tasks
//! finish. Log lines are assembled in memory and written with a single
//! `write_all` so a tailing process never sees a torn line.

pub mod collect;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::errors::{GlassError, Result};

/// The fixed set of text reports a run can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    /// Unresolvable registry references and their citing values.
    RegistryMissing,
    /// Unsigned registry-referenced files and their citing values.
    RegistryUnsigned,
    /// Unsigned files found in search-path directories.
    PathUnsigned,
    /// Unsigned PEs found under the side-by-side store.
    SxsUnsigned,
    /// Unsigned PEs loaded as modules, with owning PIDs.
    UnsignedModules,
    /// Unsigned PEs open as handles, with owning PIDs.
    UnsignedHandles,
    /// Previously identified suspects seen open as handles.
    OpenHandles,
    /// Per-image consistency verdicts with affected mappings.
    InconsistentImages,
    /// Manifest of suspects copied into the `Files` subdirectory.
    CollectedFiles,
}

impl ReportKind {
    #[must_use]
    pub const fn filename(self) -> &'static str {
        match self {
            Self::RegistryMissing => "Registry-Missing-Files.txt",
            Self::RegistryUnsigned => "Registry-Unsigned-Files.txt",
            Self::PathUnsigned => "Path-Unsigned-Files.txt",
            Self::SxsUnsigned => "WinSxS-Unsigned-Files.txt",
            Self::UnsignedModules => "Unsigned-Loaded-Modules.txt",
            Self::UnsignedHandles => "Unsigned-PE-Handles.txt",
            Self::OpenHandles => "Identified-Open-In-Handles.txt",
            Self::InconsistentImages => "Inconsistent-Images.txt",
            Self::CollectedFiles => "Collected-Files.txt",
        }
    }
}

/// One open report file. Lines are serialized by the stream's mutex. A
/// stream that failed to open (or belongs to a sink report set) swallows
/// its lines.
pub struct ReportStream {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl ReportStream {
    fn open(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(|source| GlassError::io(&path, source))?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    fn discard() -> Self {
        Self {
            path: PathBuf::new(),
            writer: Mutex::new(None),
        }
    }

    /// Append one line. Write failures degrade to stderr diagnostics; a
    /// report stream must never abort an engine.
    pub fn line(&self, text: &str) {
        let mut writer = self.writer.lock();
        if let Some(writer) = writer.as_mut()
            && writeln!(writer, "{text}").is_err()
        {
            eprintln!("[DG-REPORT] failed to write to {}", self.path.display());
        }
    }

    /// Append a header line followed by indented detail lines, all under one
    /// lock so groups are never interleaved.
    pub fn group(&self, header: &str, details: impl IntoIterator<Item = String>) {
        let mut writer = self.writer.lock();
        let Some(writer) = writer.as_mut() else {
            return;
        };
        let mut ok = writeln!(writer, "{header}").is_ok();
        for detail in details {
            ok = ok && writeln!(writer, "\t{detail}").is_ok();
        }
        if !ok {
            eprintln!("[DG-REPORT] failed to write to {}", self.path.display());
        }
    }

    fn flush(&self) {
        if let Some(writer) = self.writer.lock().as_mut() {
            let _ = writer.flush();
        }
    }
}

/// Severity attached to scan-log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Scan-log event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ScanStart,
    EngineStart,
    EngineComplete,
    ScanComplete,
    Diagnostic,
}

/// One JSONL scan-log entry.
#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    ts: String,
    event: EventType,
    severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    engine: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suspects: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

/// Append-only JSONL scan log. Logging failures fall back to stderr and
/// then to silence; a scan never fails because its log did.
pub struct ScanLog {
    writer: Option<Mutex<BufWriter<File>>>,
}

impl ScanLog {
    fn open(path: &Path) -> Self {
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(|file| Mutex::new(BufWriter::new(file)));
        if writer.is_err() {
            eprintln!("[DG-LOG] scan log unavailable at {}", path.display());
        }
        Self {
            writer: writer.ok(),
        }
    }

    /// Disabled log for tests and library embedders that do not want disk
    /// output.
    #[must_use]
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    /// Record an engine-level event.
    pub fn event(
        &self,
        event: EventType,
        severity: Severity,
        engine: Option<&str>,
        suspects: Option<usize>,
        details: Option<&str>,
    ) {
        let entry = LogEntry {
            ts: chrono::Utc::now().to_rfc3339(),
            event,
            severity,
            engine,
            suspects,
            details,
        };
        let Ok(mut line) = serde_json::to_string(&entry) else {
            return;
        };
        line.push('\n');
        let Some(writer) = &self.writer else {
            return;
        };
        let mut writer = writer.lock();
        if writer.write_all(line.as_bytes()).is_err() || writer.flush().is_err() {
            eprint!("[DG-LOG] {line}");
        }
    }
}

/// The run's output surface: one results directory holding the report
/// files, the scan log, and the collected-files subdirectory.
pub struct ReportSet {
    root: PathBuf,
    streams: Mutex<HashMap<ReportKind, Arc<ReportStream>>>,
    log: ScanLog,
    discard: bool,
}

impl ReportSet {
    /// Delete any stale results directory, then create it fresh along with
    /// the `Files` subdirectory. This is the run's only fatal failure.
    pub fn initialize(root: &Path) -> Result<Self> {
        if root.exists() {
            fs::remove_dir_all(root).map_err(|source| GlassError::ReportInit {
                path: root.to_path_buf(),
                details: format!("failed to clear stale results: {source}"),
            })?;
        }
        fs::create_dir_all(root.join("Files")).map_err(|source| GlassError::ReportInit {
            path: root.to_path_buf(),
            details: format!("failed to create results directory: {source}"),
        })?;
        let log = ScanLog::open(&root.join("Scan-Log.jsonl"));
        Ok(Self {
            root: root.to_path_buf(),
            streams: Mutex::new(HashMap::new()),
            log,
            discard: false,
        })
    }

    /// A report set that writes nowhere, for engine unit tests.
    #[must_use]
    pub fn sink() -> Self {
        Self {
            root: PathBuf::new(),
            streams: Mutex::new(HashMap::new()),
            log: ScanLog::disabled(),
            discard: true,
        }
    }

    /// Open (or reuse) the stream for one report.
    pub fn stream(&self, kind: ReportKind) -> Arc<ReportStream> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(&kind) {
            return Arc::clone(stream);
        }
        let stream = if self.discard {
            Arc::new(ReportStream::discard())
        } else {
            let path = self.root.join(kind.filename());
            match ReportStream::open(path.clone()) {
                Ok(stream) => Arc::new(stream),
                Err(err) => {
                    eprintln!("[DG-REPORT] cannot open {}: {err}", path.display());
                    Arc::new(ReportStream::discard())
                }
            }
        };
        streams.insert(kind, Arc::clone(&stream));
        stream
    }

    /// Directory collected suspect files are copied into.
    #[must_use]
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("Files")
    }

    /// The structured scan log.
    #[must_use]
    pub fn log(&self) -> &ScanLog {
        &self.log
    }

    /// Flush every open stream; called once at the end of a run.
    pub fn flush_all(&self) {
        for stream in self.streams.lock().values() {
            stream.flush();
        }
    }
}
