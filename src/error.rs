// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for command processing, plus the formatting helpers the CLI
//! uses to print them with likely causes and suggested fixes.

use std::fmt;

use crate::data::TypedDataType;

/// Where to report problems that the suggested fixes do not resolve.
pub const ISSUES_URL: &str = "https://github.com/jeranaias/nocap/issues";

/// The cancellation signal raised by a command that observed its token.
///
/// Carries the name of the command that noticed the cancellation and the
/// reason supplied by whoever requested it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    /// Name of the command that observed the cancellation
    pub command: String,
    /// Reason given to [`CancellationToken::cancel`](crate::command::CancellationToken::cancel)
    pub cause: Option<String>,
}

impl fmt::Display for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "command '{}' was cancelled: {}", self.command, cause),
            None => write!(f, "command '{}' was cancelled", self.command),
        }
    }
}

/// Errors raised while composing or processing commands.
#[derive(Debug)]
pub enum CommandError {
    /// A caller passed a malformed argument.
    InvalidArgument(String),
    /// A command was handed data of a type it does not declare.
    UnsupportedDataType {
        command: String,
        data_type: TypedDataType,
    },
    /// A router has no route for the data type it received.
    Unrouted(TypedDataType),
    /// The operation was cancelled cooperatively.
    Cancelled(Cancellation),
    /// The request never produced a response (connect, timeout, TLS, ...).
    Transport(String),
    /// The server answered with a non-success status.
    Http { status: u16, body: String },
    /// The server answered successfully but the reply could not be used.
    MalformedResponse(String),
    /// Image decoding or encoding failed.
    Encoding(String),
    /// Local I/O failed.
    Io(std::io::Error),
    /// A command panicked on its worker thread.
    Panicked(String),
}

impl CommandError {
    /// Build the cancellation signal for `command`.
    pub fn cancelled(command: impl Into<String>, cause: Option<String>) -> Self {
        Self::Cancelled(Cancellation {
            command: command.into(),
            cause,
        })
    }

    pub fn unsupported(command: impl Into<String>, data_type: TypedDataType) -> Self {
        Self::UnsupportedDataType {
            command: command.into(),
            data_type,
        }
    }

    /// True if this is the cancellation signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn cancellation(&self) -> Option<&Cancellation> {
        match self {
            Self::Cancelled(cancellation) => Some(cancellation),
            _ => None,
        }
    }

    /// Likely causes and suggested fixes for the CLI error report.
    pub fn hints(&self) -> (Vec<&'static str>, Vec<&'static str>) {
        match self {
            Self::InvalidArgument(_) => (
                vec!["A pipeline or command was configured with invalid values"],
                vec!["Check the pipeline definition: nocap pipelines"],
            ),
            Self::UnsupportedDataType { .. } | Self::Unrouted(_) => (
                vec![
                    "The input does not match what the pipeline accepts",
                    "A chain step produces a type the next step cannot read",
                ],
                vec![
                    "List accepted input types: nocap pipelines",
                    "Add a router route for this data type in config.json",
                ],
            ),
            Self::Transport(_) => (
                vec!["No network connection", "The upload endpoint is down or unreachable"],
                vec!["Check connectivity and retry", "Verify the uploader URL in config.json"],
            ),
            Self::Http { .. } | Self::MalformedResponse(_) => (
                vec![
                    "The service rejected the upload",
                    "The response pattern no longer matches the service's reply",
                ],
                vec!["Inspect the reply with --verbose", "Update response_pattern in config.json"],
            ),
            Self::Encoding(_) => (
                vec!["The file is not a supported image format"],
                vec!["Convert the file to PNG or JPEG and retry"],
            ),
            Self::Io(_) => (
                vec!["The output directory is missing or not writable"],
                vec!["Check output_dir in config.json"],
            ),
            Self::Cancelled(_) | Self::Panicked(_) => (Vec::new(), Vec::new()),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Self::UnsupportedDataType { command, data_type } => {
                write!(f, "Command '{}' does not accept {} data", command, data_type)
            }
            Self::Unrouted(data_type) => write!(f, "No route for {} data", data_type),
            Self::Cancelled(cancellation) => write!(f, "Cancelled: {}", cancellation),
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::Http { status, body } => write!(f, "Server returned HTTP {}: {}", status, body),
            Self::MalformedResponse(msg) => write!(f, "Malformed response: {}", msg),
            Self::Encoding(msg) => write!(f, "Image encoding error: {}", msg),
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::Panicked(msg) => write!(f, "Command panicked: {}", msg),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<image::ImageError> for CommandError {
    fn from(err: image::ImageError) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<reqwest::Error> for CommandError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("request timed out: {}", err))
        } else if err.is_connect() {
            Self::Transport(format!("could not connect: {}", err))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Result alias used throughout the library.
pub type Result<T, E = CommandError> = std::result::Result<T, E>;

/// Formats an error message with title, causes, fixes, and help link.
///
/// ```
/// use nocap::error::format_error;
///
/// let report = format_error(
///     "Upload failed",
///     &["The upload endpoint is down"],
///     &["Retry later"],
/// );
/// assert!(report.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n\n", title);

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(&format!("Need help? {}", ISSUES_URL));
    output
}

/// Render a [`CommandError`] as a full CLI report.
pub fn report(err: &CommandError) -> String {
    let (causes, fixes) = err.hints();
    format_error(&err.to_string(), &causes, &fixes)
}

/// Builder for ad-hoc error reports that do not come from a [`CommandError`].
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(&self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(String::as_str).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(String::as_str).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinct() {
        let cancelled = CommandError::cancelled("upload", Some("user".into()));
        assert!(cancelled.is_cancellation());
        assert_eq!(cancelled.cancellation().unwrap().command, "upload");
        assert_eq!(
            cancelled.to_string(),
            "Cancelled: command 'upload' was cancelled: user"
        );

        let failed = CommandError::Transport("boom".into());
        assert!(!failed.is_cancellation());
        assert!(failed.cancellation().is_none());
    }

    #[test]
    fn test_report_includes_hints() {
        let err = CommandError::Unrouted(TypedDataType::Uri);
        let text = report(&err);
        assert!(text.contains("[✗] No route for uri data"));
        assert!(text.contains("Possible causes:"));
        assert!(text.contains("  1. List accepted input types"));
        assert!(text.contains(ISSUES_URL));
    }

    #[test]
    fn test_empty_causes_and_fixes() {
        let text = format_error("Empty", &[], &[]);
        assert!(!text.contains("Possible causes:"));
        assert!(!text.contains("Try these fixes:"));
    }

    #[test]
    fn test_error_builder() {
        let text = ErrorBuilder::new("Config unreadable")
            .cause("Invalid JSON")
            .fix("Validate the file")
            .to_string();
        assert!(text.contains("[✗] Config unreadable"));
        assert!(text.contains("  - Invalid JSON"));
        assert!(text.contains("  1. Validate the file"));
    }

    #[test]
    fn test_io_source() {
        use std::error::Error;
        let err = CommandError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(err.source().is_some());
    }
}
