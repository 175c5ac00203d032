//! Rewrite error types.

use std::io;
use std::str::Utf8Error;

use quick_xml::events::attributes::AttrError;
use thiserror::Error;

/// Result type for rewrite operations.
pub type RewriteResult<T> = Result<T, RewriteError>;

/// Errors that abort the rewrite of one document.
#[derive(Error, Debug)]
pub enum RewriteError {
    /// The input is not well-formed XML.
    #[error("malformed XML at byte {position}: {source}")]
    Malformed {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    /// A start tag carries unparseable attributes.
    #[error("bad attribute at byte {position}: {source}")]
    Attribute {
        position: u64,
        #[source]
        source: AttrError,
    },

    /// A name or value is not valid UTF-8.
    #[error("invalid UTF-8 at byte {position}: {source}")]
    Encoding {
        position: u64,
        #[source]
        source: Utf8Error,
    },

    /// The document ended inside an element.
    #[error("document ended inside <{element}> at byte {position}")]
    Unclosed { position: u64, element: String },

    /// Required entities were referenced but no anchor element existed to
    /// declare them before.
    #[error(
        "no insertion point for required entities: visual attributes {visual_attributes:?}, parameters {parameters:?}"
    )]
    Unflushed {
        visual_attributes: Vec<String>,
        parameters: Vec<String>,
    },

    /// Writing the output failed.
    #[error("failed to write XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RewriteError {
    /// Whether the document itself is at fault, as opposed to the output.
    pub fn is_schema_violation(&self) -> bool {
        !matches!(self, RewriteError::Xml(_) | RewriteError::Io(_))
    }
}
