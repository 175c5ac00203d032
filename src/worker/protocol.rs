//! Line protocol spoken by a piped worker over stdin/stdout.
//!
//! The worker reads one request per line, two whitespace-separated tokens
//! naming the source and destination files, and answers with one status
//! line:
//!
//! ```text
//! -> "/tmp/forms2xml-a1.fmb" "/tmp/forms2xml-b2.xml"
//! <- OK+ dumped forms2xml-a1.fmb to /tmp/forms2xml-b2.xml
//!
//! -> "/tmp/forms2xml-c3.xml" "/tmp/forms2xml-d4.fmb"
//! <- ERR oracle.forms.jdapi.JdapiException: ...
//! ```
//!
//! Everything else the worker prints on stdout is noise. Direction is picked
//! by the worker from the source file extension (`.fmb` is decoded, anything
//! else is encoded).

use std::path::Path;

// ============================================================================
// Requests
// ============================================================================

/// Build a request line for converting `src` into `dst`.
///
/// Both paths are quoted so that separators and spaces survive the worker's
/// tokenizer.
pub fn request_line(src: &Path, dst: &Path) -> String {
    format!(
        "{} {}\n",
        quote(&src.to_string_lossy()),
        quote(&dst.to_string_lossy())
    )
}

fn quote(token: &str) -> String {
    let mut quoted = String::with_capacity(token.len() + 2);
    quoted.push('"');
    for c in token.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

// ============================================================================
// Responses
// ============================================================================

/// A status line returned by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// The conversion succeeded; carries the worker's message.
    Ok(String),
    /// The conversion failed; carries the worker's error text.
    Err(String),
}

/// Parse one stdout line.
///
/// Returns `None` for lines that are not status lines.
pub fn parse_status(line: &str) -> Option<Status> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = line.strip_prefix("ERR") {
        return Some(Status::Err(rest.trim_start().to_string()));
    }
    if let Some(rest) = line.strip_prefix("OK") {
        let rest = rest.strip_prefix('+').unwrap_or(rest);
        return Some(Status::Ok(rest.trim_start().to_string()));
    }
    None
}
