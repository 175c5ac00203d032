//! Job descriptions.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::convert::MimeType;

/// Default suffix of a roundtrip destination.
pub const DEFAULT_SUFFIX: &str = "-v11";

/// What a job does with its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Form to XML.
    Decode,
    /// XML to form.
    Encode,
    /// XML to XML through the rewrite engine only.
    Rewrite,
    /// Form to XML, optionally rewritten, back to form.
    Roundtrip,
}

impl Direction {
    /// Single-direction conversion for a source of the given type.
    pub fn converting(mime: MimeType) -> Self {
        match mime {
            MimeType::Form => Direction::Decode,
            MimeType::Xml => Direction::Encode,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Decode => f.write_str("decode"),
            Direction::Encode => f.write_str("encode"),
            Direction::Rewrite => f.write_str("rewrite"),
            Direction::Roundtrip => f.write_str("roundtrip"),
        }
    }
}

/// Where a job reads, where it writes and what it does in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub source: PathBuf,
    /// Derived from `source` when not given.
    pub destination: Option<PathBuf>,
    pub direction: Direction,
    /// Run the rewrite stage during a roundtrip.
    pub rewrite: bool,
    pub suffix: String,
    /// Tee intermediate XML to side files.
    pub snapshots: bool,
}

impl JobSpec {
    pub fn new(source: impl Into<PathBuf>, direction: Direction) -> Self {
        Self {
            source: source.into(),
            destination: None,
            direction,
            rewrite: true,
            suffix: DEFAULT_SUFFIX.to_string(),
            snapshots: false,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_rewrite(mut self, rewrite: bool) -> Self {
        self.rewrite = rewrite;
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_snapshots(mut self, snapshots: bool) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// The explicit destination, or the one derived from the source.
    pub fn destination(&self) -> PathBuf {
        if let Some(destination) = &self.destination {
            return destination.clone();
        }
        match self.direction {
            Direction::Decode => self.source.with_extension("xml"),
            Direction::Encode => self.source.with_extension("fmb"),
            Direction::Rewrite => with_stem_suffix(&self.source, &self.suffix, "xml"),
            Direction::Roundtrip => with_stem_suffix(&self.source, &self.suffix, "fmb"),
        }
    }

    /// Whether the rewrite stage runs.
    pub fn rewrites(&self) -> bool {
        match self.direction {
            Direction::Rewrite => true,
            Direction::Roundtrip => self.rewrite,
            Direction::Decode | Direction::Encode => false,
        }
    }
}

fn with_stem_suffix(path: &Path, suffix: &str, extension: &str) -> PathBuf {
    let mut name = path
        .file_stem()
        .unwrap_or(path.as_os_str())
        .to_os_string();
    name.push(suffix);
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Idle => f.write_str("idle"),
            JobState::Running => f.write_str("running"),
            JobState::Succeeded => f.write_str("succeeded"),
            JobState::Failed => f.write_str("failed"),
        }
    }
}

/// One run of a [`JobSpec`]. Running consumes it; a retry is a new job.
#[derive(Debug)]
pub struct PipelineJob {
    id: Uuid,
    spec: JobSpec,
    state: JobState,
}

impl PipelineJob {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            state: JobState::Idle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn transition(&mut self, next: JobState) {
        info!(job = %self.id, from = %self.state, to = %next, "job state");
        self.state = next;
    }
}
