//! Source repository contract: streams raw extract rows from a local file or
//! an object-storage object, filtered by department, with bounded buffering.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;
use zlv_core::{RawFields, RecordKind, SourceRecord};

mod object_storage;

pub use object_storage::{AwsCredentials, ObjectStorageRepository};

pub const CRATE_NAME: &str = "zlv-sources";

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Jsonl,
}

impl SourceFormat {
    /// Infer the format from a file name or object key.
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        let ext = lower.rsplit('.').next()?;
        match ext {
            "csv" | "txt" => Some(SourceFormat::Csv),
            "jsonl" | "ndjson" | "json" => Some(SourceFormat::Jsonl),
            _ => None,
        }
    }
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSource {
    pub path: PathBuf,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStorageSource {
    pub bucket: String,
    pub key: String,
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Backend selection. The discriminant picks the repository; both share the
/// [`SourceRepository`] contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SourceConfig {
    File(FileSource),
    ObjectStorage(ObjectStorageSource),
}

impl SourceConfig {
    pub fn location(&self) -> String {
        match self {
            SourceConfig::File(f) => f.path.display().to_string(),
            SourceConfig::ObjectStorage(o) => format!("s3://{}/{}", o.bucket, o.key),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// `None` streams every row.
    pub departments: Option<Vec<String>>,
}

impl StreamOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn departments<I, S>(departments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            departments: Some(departments.into_iter().map(Into::into).collect()),
        }
    }

    /// Parse a comma-separated department list; `all` or an empty list means
    /// no filtering.
    pub fn parse(raw: &str) -> Self {
        let codes = raw
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if codes.is_empty() || codes.iter().any(|c| c == "ALL") {
            Self::all()
        } else {
            Self {
                departments: Some(codes),
            }
        }
    }

    pub fn accepts(&self, kind: RecordKind, record: &SourceRecord) -> bool {
        let Some(departments) = &self.departments else {
            return true;
        };
        let Some(value) = record.get_text(kind.department_column()) else {
            return false;
        };
        let value = value.to_ascii_uppercase();
        departments.iter().any(|d| value.starts_with(d.as_str()))
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed csv in {location} at line {line}: {message}")]
    Csv {
        location: String,
        line: u64,
        message: String,
    },
    #[error("malformed json in {location} at line {line}: {message}")]
    Json {
        location: String,
        line: u64,
        message: String,
    },
    #[error("object storage request failed: {0}")]
    Http(String),
    #[error("object storage credentials missing: {0}")]
    Credentials(String),
    #[error("cannot infer source format for {0}")]
    UnknownFormat(String),
    #[error("unsupported delimiter {0:?}")]
    Delimiter(char),
}

pub type SourceItem = Result<SourceRecord, SourceError>;

/// Lazily produced rows. The producer runs ahead of the consumer by at most
/// the channel capacity; the stream ends after the first error.
#[derive(Debug)]
pub struct RecordStream {
    rx: mpsc::Receiver<SourceItem>,
    tasks: Vec<AbortHandle>,
}

impl RecordStream {
    fn new(rx: mpsc::Receiver<SourceItem>) -> Self {
        Self {
            rx,
            tasks: Vec::new(),
        }
    }

    fn with_task(mut self, task: AbortHandle) -> Self {
        self.tasks.push(task);
        self
    }

    pub async fn next(&mut self) -> Option<SourceItem> {
        self.rx.recv().await
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Capability shared by every source backend.
pub trait SourceRepository: Send + Sync {
    fn kind(&self) -> RecordKind;

    fn location(&self) -> String;

    /// Open a fresh stream. Each call re-reads the source from the start.
    fn stream(&self, options: &StreamOptions) -> RecordStream;
}

pub fn repository_for(
    config: &SourceConfig,
    kind: RecordKind,
    capacity: usize,
) -> Box<dyn SourceRepository> {
    match config {
        SourceConfig::File(file) => Box::new(FileRepository::new(file.clone(), kind, capacity)),
        SourceConfig::ObjectStorage(object) => Box::new(ObjectStorageRepository::new(
            object.clone(),
            kind,
            capacity,
        )),
    }
}

#[derive(Debug, Clone)]
pub struct FileRepository {
    source: FileSource,
    kind: RecordKind,
    capacity: usize,
}

impl FileRepository {
    pub fn new(source: FileSource, kind: RecordKind, capacity: usize) -> Self {
        Self {
            source,
            kind,
            capacity: capacity.max(1),
        }
    }
}

impl SourceRepository for FileRepository {
    fn kind(&self) -> RecordKind {
        self.kind
    }

    fn location(&self) -> String {
        self.source.path.display().to_string()
    }

    fn stream(&self, options: &StreamOptions) -> RecordStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        let decoder = RowDecoder {
            location: self.location(),
            kind: self.kind,
            format: self.source.format,
            delimiter: self.source.delimiter,
            options: options.clone(),
        };
        let path = self.source.path.clone();
        tokio::task::spawn_blocking(move || match File::open(&path) {
            Ok(file) => decoder.run(file, &tx),
            Err(source) => {
                let _ = tx.blocking_send(Err(SourceError::Io {
                    location: decoder.location.clone(),
                    source,
                }));
            }
        });
        RecordStream::new(rx)
    }
}

/// Turns bytes into filtered [`SourceRecord`]s on a blocking worker.
#[derive(Debug, Clone)]
pub(crate) struct RowDecoder {
    pub(crate) location: String,
    pub(crate) kind: RecordKind,
    pub(crate) format: Option<SourceFormat>,
    pub(crate) delimiter: char,
    pub(crate) options: StreamOptions,
}

impl RowDecoder {
    pub(crate) fn run<R: Read>(&self, reader: R, tx: &mpsc::Sender<SourceItem>) {
        let format = match self.format.or_else(|| SourceFormat::from_path(&self.location)) {
            Some(format) => format,
            None => {
                let _ = tx.blocking_send(Err(SourceError::UnknownFormat(self.location.clone())));
                return;
            }
        };
        let (emitted, filtered) = match format {
            SourceFormat::Csv => self.decode_csv(reader, tx),
            SourceFormat::Jsonl => self.decode_jsonl(reader, tx),
        };
        debug!(location = %self.location, kind = %self.kind, emitted, filtered, "source stream finished");
    }

    /// Forward a row unless filtered out; `false` once the consumer is gone.
    fn emit(&self, record: SourceRecord, tx: &mpsc::Sender<SourceItem>, filtered: &mut u64) -> bool {
        if !self.options.accepts(self.kind, &record) {
            *filtered += 1;
            return true;
        }
        tx.blocking_send(Ok(record)).is_ok()
    }

    fn decode_csv<R: Read>(&self, reader: R, tx: &mpsc::Sender<SourceItem>) -> (u64, u64) {
        let (mut emitted, mut filtered) = (0u64, 0u64);
        if !self.delimiter.is_ascii() {
            let _ = tx.blocking_send(Err(SourceError::Delimiter(self.delimiter)));
            return (emitted, filtered);
        }
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter as u8)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = match csv_reader.headers() {
            Ok(headers) => headers.clone(),
            Err(err) => {
                let _ = tx.blocking_send(Err(self.csv_error(err)));
                return (emitted, filtered);
            }
        };

        for result in csv_reader.records() {
            let row = match result {
                Ok(row) => row,
                Err(err) => {
                    let _ = tx.blocking_send(Err(self.csv_error(err)));
                    return (emitted, filtered);
                }
            };
            let line = row.position().map(|p| p.line()).unwrap_or(0);
            let fields = headers
                .iter()
                .zip(row.iter())
                .map(|(name, value)| (name.to_string(), JsonValue::String(value.to_string())))
                .collect::<RawFields>();
            if !self.emit(SourceRecord::new(line, fields), tx, &mut filtered) {
                return (emitted, filtered);
            }
            emitted += 1;
        }
        (emitted, filtered)
    }

    fn decode_jsonl<R: Read>(&self, reader: R, tx: &mpsc::Sender<SourceItem>) -> (u64, u64) {
        let (mut emitted, mut filtered) = (0u64, 0u64);
        for (index, line) in BufReader::new(reader).lines().enumerate() {
            let line_no = index as u64 + 1;
            let text = match line {
                Ok(text) => text,
                Err(err) => {
                    let _ = tx.blocking_send(Err(from_io_error(err, &self.location)));
                    return (emitted, filtered);
                }
            };
            if text.trim().is_empty() {
                continue;
            }
            let fields = match serde_json::from_str::<JsonValue>(&text) {
                Ok(JsonValue::Object(fields)) => fields,
                Ok(other) => {
                    let _ = tx.blocking_send(Err(SourceError::Json {
                        location: self.location.clone(),
                        line: line_no,
                        message: format!("expected an object, found {other}"),
                    }));
                    return (emitted, filtered);
                }
                Err(err) => {
                    let _ = tx.blocking_send(Err(SourceError::Json {
                        location: self.location.clone(),
                        line: line_no,
                        message: err.to_string(),
                    }));
                    return (emitted, filtered);
                }
            };
            if !self.emit(SourceRecord::new(line_no, fields), tx, &mut filtered) {
                return (emitted, filtered);
            }
            emitted += 1;
        }
        (emitted, filtered)
    }

    fn csv_error(&self, err: csv::Error) -> SourceError {
        let line = err.position().map(|p| p.line()).unwrap_or(0);
        let message = err.to_string();
        match err.into_kind() {
            csv::ErrorKind::Io(io_err) => from_io_error(io_err, &self.location),
            _ => SourceError::Csv {
                location: self.location.clone(),
                line,
                message,
            },
        }
    }
}

/// Unwrap a [`SourceError`] smuggled through an `io::Error` by the
/// object-storage body reader, or wrap a plain I/O failure.
fn from_io_error(err: io::Error, location: &str) -> SourceError {
    let carries_source_error = err
        .get_ref()
        .map(|inner| inner.is::<SourceError>())
        .unwrap_or(false);
    if carries_source_error {
        if let Some(Ok(inner)) = err.into_inner().map(|e| e.downcast::<SourceError>()) {
            return *inner;
        }
        return SourceError::Http(format!("{location}: body stream failed"));
    }
    SourceError::Io {
        location: location.to_string(),
        source: err,
    }
}

/// Read every row of a repository into memory. Meant for small sources and tests.
pub async fn collect(
    repository: &dyn SourceRepository,
    options: &StreamOptions,
) -> Result<Vec<SourceRecord>, SourceError> {
    let mut stream = repository.stream(options);
    let mut rows = Vec::new();
    while let Some(item) = stream.next().await {
        rows.push(item?);
    }
    Ok(rows)
}

pub fn file_source(path: impl AsRef<Path>) -> SourceConfig {
    SourceConfig::File(FileSource {
        path: path.as_ref().to_path_buf(),
        format: None,
        delimiter: default_delimiter(),
    })
}
