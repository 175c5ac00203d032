//! Streaming rewrite of Forms module XML to the target schema.
//!
//! The rewrite reads the document once, token by token, and writes the
//! migrated document as it goes; memory use is bounded by nesting depth, not
//! by document size.
//!
//! # Rules
//!
//! ```text
//! Module
//! └── FormModule                      ConsoleWindow=W_MAIN
//!     ├── Coordinate                  canonical pixel system (synthesized if absent)
//!     ├── Alert KERDEZ_ALERT          removed with its subtree
//!     ├── AttachedLibrary             BR_PROCEDURE_LIB (synthesized if absent)
//!     ├── Block / Item / Canvas ...   geometry scaled, parents redirected, fonts stripped
//!     ├── ModuleParameter             required parameters synthesized before the
//!     │                               first LOV/ProgramUnit/.../Window
//!     ├── VisualAttribute             referenced-but-missing ones synthesized
//!     │                               before the first Window
//!     └── Window ROOT_WINDOW          becomes W_MAIN subclassed from BR_FLIB
//! ```
//!
//! # Example
//!
//! ```ignore
//! use forms2xml::rewrite::{FormsXmlProcessor, RewriteConfig};
//!
//! let processor = FormsXmlProcessor::new(RewriteConfig::default());
//! let (xml, report) = processor.process_str(&legacy_xml)?;
//! for parent in &report.unknown_parents {
//!     eprintln!("unknown parent module: {parent}");
//! }
//! ```

mod anchors;
mod attrs;
mod engine;
mod error;
mod rules;

use std::collections::BTreeSet;

use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use engine::Rewriter;
pub use error::{RewriteError, RewriteResult};

/// Default horizontal scale factor, pixels per character cell.
pub const DEFAULT_CELL_WIDTH: i64 = 12;

/// Default vertical scale factor, pixels per character cell.
pub const DEFAULT_CELL_HEIGHT: i64 = 24;

/// Visual attributes every migrated module must declare.
pub const DEFAULT_VISUAL_ATTRIBUTES: [&str; 4] = ["NORMAL_ITEM", "SELECT", "NORMAL_PROMPT", "NORMAL"];

/// Module parameters every migrated module must declare.
pub const DEFAULT_PARAMETERS: [&str; 4] = ["TORZSSZAM", "PRG_AZON", "BAZON", "DAZON"];

/// Rewrite parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteConfig {
    pub cell_width: i64,
    pub cell_height: i64,
    pub required_visual_attributes: Vec<String>,
    pub required_parameters: Vec<String>,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            cell_width: DEFAULT_CELL_WIDTH,
            cell_height: DEFAULT_CELL_HEIGHT,
            required_visual_attributes: DEFAULT_VISUAL_ATTRIBUTES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            required_parameters: DEFAULT_PARAMETERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// What a rewrite changed beyond attribute edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteReport {
    /// Synthesized elements, as `Tag Name`.
    pub synthesized: Vec<String>,
    /// Removed elements, as `Tag Name`.
    pub elided: Vec<String>,
    /// Parent modules that are neither this form nor a known library.
    pub unknown_parents: BTreeSet<String>,
    /// Elements the document declares after the same element was
    /// synthesized, as `Tag Name`. Both copies are kept in the output.
    pub duplicates: Vec<String>,
}

/// Rewrites Forms module XML.
#[derive(Debug, Clone, Default)]
pub struct FormsXmlProcessor {
    config: RewriteConfig,
}

impl FormsXmlProcessor {
    pub fn new(config: RewriteConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    /// Rewrite the document read from `input` into `output`.
    ///
    /// # Errors
    ///
    /// Fails on malformed input, on a document that references required
    /// entities without offering a place to declare them, and on I/O errors
    /// from either side. Output written before the failure is not retracted.
    pub async fn process_stream<W, R>(&self, output: W, input: R) -> RewriteResult<RewriteReport>
    where
        W: AsyncWrite + Unpin,
        R: AsyncBufRead + Unpin,
    {
        let mut reader = Reader::from_reader(input);
        let mut writer = Writer::new_with_indent(output, b' ', 2);
        let mut rewriter = Rewriter::new(&self.config);
        let mut buf = Vec::new();
        let mut pending = Vec::new();

        loop {
            let event = match reader.read_event_into_async(&mut buf).await {
                Ok(Event::Eof) => break,
                Ok(event) => event,
                Err(source) => {
                    return Err(RewriteError::Malformed {
                        position: reader.buffer_position() as u64,
                        source,
                    })
                }
            };
            rewriter.feed(event, reader.buffer_position() as u64, &mut pending)?;
            for event in pending.drain(..) {
                writer.write_event_async(event).await?;
            }
            buf.clear();
        }

        let report = rewriter.finish(reader.buffer_position() as u64)?;
        let output = writer.get_mut();
        output.write_all(b"\n").await?;
        output.flush().await?;
        debug!(
            synthesized = report.synthesized.len(),
            elided = report.elided.len(),
            unknown_parents = report.unknown_parents.len(),
            "rewrite finished"
        );
        Ok(report)
    }

    /// Rewrite an in-memory document.
    pub fn process_str(&self, input: &str) -> RewriteResult<(String, RewriteReport)> {
        let mut reader = Reader::from_str(input);
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        let mut rewriter = Rewriter::new(&self.config);
        let mut pending = Vec::new();

        loop {
            let event = match reader.read_event() {
                Ok(Event::Eof) => break,
                Ok(event) => event,
                Err(source) => {
                    return Err(RewriteError::Malformed {
                        position: reader.buffer_position() as u64,
                        source,
                    })
                }
            };
            rewriter.feed(event, reader.buffer_position() as u64, &mut pending)?;
            for event in pending.drain(..) {
                writer.write_event(event)?;
            }
        }

        let report = rewriter.finish(reader.buffer_position() as u64)?;
        let mut bytes = writer.into_inner();
        bytes.push(b'\n');
        let position = bytes.len() as u64;
        let text = String::from_utf8(bytes).map_err(|err| RewriteError::Encoding {
            position,
            source: err.utf8_error(),
        })?;
        Ok((text, report))
    }
}
