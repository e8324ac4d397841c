// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Generic multipart uploader.
//!
//! [`HttpUploader`] covers the three upload-shaped jobs a capture tool has:
//! image/file hosting (bytes in, link out), paste services (text in, link
//! out) and URL shorteners (link in, link out). The wire work sits behind
//! [`HttpTransport`] so the command logic can be exercised without a network.

use std::fmt;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::command::{CancellationToken, Command, TimeEstimate};
use crate::data::{DataPayload, TypedData, TypedDataType};
use crate::error::{CommandError, Result};
use crate::progress::MutableProgressTracker;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// How often a waiting upload re-checks its cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Share of the bar spent sending the body; the rest covers the reply.
const UPLOAD_SHARE: f64 = 0.9;

/// Longest reply body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// The value sent in the upload's main form field.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadBody {
    /// A file part
    File {
        file_name: String,
        mime: String,
        bytes: Vec<u8>,
    },
    /// A plain text field
    Text(String),
}

/// A multipart POST.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub url: Url,
    /// Name of the form field carrying [`UploadRequest::body`]
    pub field_name: String,
    pub body: UploadBody,
    /// Extra text fields sent with every request (API keys, options)
    pub fields: IndexMap<String, String>,
    pub headers: IndexMap<String, String>,
}

/// Status and body of the server's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes one multipart request.
///
/// Implementations report upload progress into `progress` from the calling
/// thread only, and must return [`CommandError::Cancelled`] promptly once
/// `cancel` trips.
pub trait HttpTransport: Send + Sync {
    fn send(
        &self,
        request: UploadRequest,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<HttpReply>;
}

/// Body bytes handed to reqwest so far, shared between the request thread
/// and the command waiting on it.
#[derive(Clone, Default)]
struct SentBytes {
    sent: Arc<AtomicU64>,
    total: u64,
}

impl SentBytes {
    fn new(total: u64) -> Self {
        Self {
            sent: Arc::new(AtomicU64::new(0)),
            total,
        }
    }

    /// Raise `progress` to the sent share of the bar if it moved past `last`.
    /// Only ever called on the thread that owns `progress`.
    fn report_to(&self, progress: &MutableProgressTracker, last: &mut f64) {
        if self.total == 0 {
            return;
        }
        let current = self.sent.load(Ordering::Relaxed) as f64 / self.total as f64 * UPLOAD_SHARE;
        if current > *last {
            progress.set_progress(current);
            *last = current;
        }
    }
}

/// Feeds the body to reqwest and counts how much of it has been sent.
struct ProgressReader {
    inner: Cursor<Vec<u8>>,
    sent: SentBytes,
    cancel: CancellationToken,
}

impl Read for ProgressReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "upload cancelled"));
        }
        let read = self.inner.read(buf)?;
        self.sent.sent.store(self.inner.position(), Ordering::Relaxed);
        Ok(read)
    }
}

/// [`HttpTransport`] backed by `reqwest::blocking`.
///
/// Each request runs on its own short-lived thread with its own client, so
/// the calling command can keep polling its cancellation token while the
/// request is in flight.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    timeout: Duration,
    user_agent: String,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: format!("nocap/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn execute(&self, request: UploadRequest, reader: Option<ProgressReader>) -> Result<HttpReply> {
        use reqwest::blocking::multipart::{Form, Part};

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()?;

        let mut form = Form::new();
        for (name, value) in request.fields {
            form = form.text(name, value);
        }
        form = match (request.body, reader) {
            (UploadBody::File { file_name, mime, .. }, Some(reader)) => {
                let length = reader.sent.total;
                let part = Part::reader_with_length(reader, length)
                    .file_name(file_name)
                    .mime_str(&mime)?;
                form.part(request.field_name, part)
            }
            (UploadBody::File { file_name, mime, bytes }, None) => {
                let part = Part::bytes(bytes).file_name(file_name).mime_str(&mime)?;
                form.part(request.field_name, part)
            }
            (UploadBody::Text(text), _) => form.text(request.field_name, text),
        };

        let mut builder = client.post(request.url).multipart(form);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok(HttpReply { status, body })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(
        &self,
        mut request: UploadRequest,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<HttpReply> {
        let (reader, sent) = match &mut request.body {
            UploadBody::File { bytes, .. } => {
                let sent = SentBytes::new(bytes.len() as u64);
                let reader = ProgressReader {
                    inner: Cursor::new(std::mem::take(bytes)),
                    sent: sent.clone(),
                    cancel: cancel.clone(),
                };
                (Some(reader), sent)
            }
            UploadBody::Text(_) => (None, SentBytes::default()),
        };

        let (reply_tx, reply_rx) = mpsc::channel();
        let transport = self.clone();
        thread::Builder::new()
            .name("nocap-http".to_string())
            .spawn(move || {
                // The receiver is gone if the upload was cancelled.
                let _ = reply_tx.send(transport.execute(request, reader));
            })?;

        let mut reported = 0.0;
        loop {
            match reply_rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(result) => {
                    if result.is_ok() {
                        sent.report_to(progress, &mut reported);
                    }
                    return match result {
                        Err(_) if cancel.is_cancelled() => Err(CommandError::cancelled("http transport", cancel.reason())),
                        other => other,
                    };
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    cancel.check("http transport")?;
                    sent.report_to(progress, &mut reported);
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(CommandError::Transport("request thread exited without a reply".to_string()));
                }
            }
        }
    }
}

/// What [`HttpUploader`] turns the extracted reply into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    #[default]
    Uri,
    Text,
}

/// Uploads its input with a multipart POST and returns the link from the reply.
#[derive(Clone)]
pub struct HttpUploader {
    name: String,
    endpoint: Url,
    field_name: String,
    fields: IndexMap<String, String>,
    headers: IndexMap<String, String>,
    response_pattern: Option<Regex>,
    reply_kind: ReplyKind,
    input_types: Vec<TypedDataType>,
    transport: Arc<dyn HttpTransport>,
}

impl HttpUploader {
    /// An uploader posting to `endpoint` in a field called `file`.
    pub fn new(name: impl Into<String>, endpoint: Url) -> Self {
        Self {
            name: name.into(),
            endpoint,
            field_name: "file".to_string(),
            fields: IndexMap::new(),
            headers: IndexMap::new(),
            response_pattern: None,
            reply_kind: ReplyKind::Uri,
            input_types: vec![
                TypedDataType::RawData,
                TypedDataType::Stream,
                TypedDataType::Text,
                TypedDataType::Uri,
            ],
            transport: Arc::new(ReqwestTransport::default()),
        }
    }

    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = field_name.into();
        self
    }

    pub fn with_form_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Extract the link from the reply with `pattern`: the first capture
    /// group if there is one, else the whole match.
    pub fn with_response_pattern(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| CommandError::InvalidArgument(format!("bad response pattern '{}': {}", pattern, e)))?;
        self.response_pattern = Some(regex);
        Ok(self)
    }

    pub fn with_reply_kind(mut self, kind: ReplyKind) -> Self {
        self.reply_kind = kind;
        self
    }

    /// Restrict the accepted input types, e.g. to `[Uri]` for a shortener.
    pub fn accepting(mut self, types: Vec<TypedDataType>) -> Self {
        self.input_types = types;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn body_for(&self, input: &mut TypedData, cancel: &CancellationToken) -> Result<UploadBody> {
        let file_name = match input.name() {
            "" => "upload.bin".to_string(),
            name => name.to_string(),
        };
        let mime = mime_for(&file_name).to_string();

        match input.payload_mut() {
            DataPayload::RawData(bytes) => Ok(UploadBody::File {
                file_name,
                mime,
                bytes: bytes.clone(),
            }),
            DataPayload::Stream(stream) => {
                let mut bytes = Vec::new();
                let mut chunk = [0_u8; 16 * 1024];
                loop {
                    cancel.check(&self.name)?;
                    let read = stream.read(&mut chunk)?;
                    if read == 0 {
                        break;
                    }
                    bytes.extend_from_slice(&chunk[..read]);
                }
                Ok(UploadBody::File { file_name, mime, bytes })
            }
            DataPayload::Text(text) => Ok(UploadBody::Text(text.clone())),
            DataPayload::Uri(uri) => Ok(UploadBody::Text(uri.to_string())),
            other => Err(CommandError::unsupported(&self.name, other.data_type())),
        }
    }

    fn extract<'a>(&self, body: &'a str) -> Result<&'a str> {
        let link = match &self.response_pattern {
            Some(pattern) => {
                let captures = pattern.captures(body).ok_or_else(|| {
                    CommandError::MalformedResponse(format!(
                        "'{}' reply did not match /{}/: {}",
                        self.name,
                        pattern.as_str(),
                        truncate(body, MAX_ERROR_BODY)
                    ))
                })?;
                captures
                    .get(1)
                    .or_else(|| captures.get(0))
                    .map(|m| m.as_str())
                    .unwrap_or_default()
            }
            None => body,
        };

        let link = link.trim();
        if link.is_empty() {
            return Err(CommandError::MalformedResponse(format!("'{}' returned an empty reply", self.name)));
        }
        Ok(link)
    }
}

impl Command for HttpUploader {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_data_types(&self) -> Vec<TypedDataType> {
        self.input_types.clone()
    }

    fn time_estimate(&self) -> TimeEstimate {
        TimeEstimate::SLOW
    }

    fn is_valid(&self) -> bool {
        matches!(self.endpoint.scheme(), "http" | "https") && !self.field_name.is_empty()
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TypedData> {
        self.ensure_accepts(input)?;
        cancel.check(&self.name)?;

        let body = self.body_for(input, cancel)?;
        let request = UploadRequest {
            url: self.endpoint.clone(),
            field_name: self.field_name.clone(),
            body,
            fields: self.fields.clone(),
            headers: self.headers.clone(),
        };
        progress.set_status(format!("uploading to {}", self.endpoint.host_str().unwrap_or("server")));
        tracing::debug!(target: "nocap::commands", uploader = %self.name, url = %self.endpoint, "sending upload");

        let reply = self.transport.send(request, progress, cancel).map_err(|err| match err {
            // Attribute the cancellation to this command rather than the transport.
            CommandError::Cancelled(cancellation) => CommandError::cancelled(&self.name, cancellation.cause),
            other => other,
        })?;
        if !reply.is_success() {
            tracing::warn!(target: "nocap::commands", uploader = %self.name, status = reply.status, "upload rejected");
            return Err(CommandError::Http {
                status: reply.status,
                body: truncate(&reply.body, MAX_ERROR_BODY).to_string(),
            });
        }

        let link = self.extract(&reply.body)?;
        let output = match self.reply_kind {
            ReplyKind::Uri => {
                let uri = Url::parse(link).map_err(|e| {
                    CommandError::MalformedResponse(format!("'{}' returned an invalid link '{}': {}", self.name, link, e))
                })?;
                TypedData::from_uri(uri, input.name())
            }
            ReplyKind::Text => TypedData::from_text(link, input.name()),
        };
        tracing::info!(target: "nocap::commands", uploader = %self.name, link, "upload finished");

        progress.complete();
        Ok(output)
    }
}

impl fmt::Debug for HttpUploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUploader")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint.as_str())
            .field("field_name", &self.field_name)
            .field("response_pattern", &self.response_pattern.as_ref().map(Regex::as_str))
            .field("reply_kind", &self.reply_kind)
            .finish()
    }
}

/// Content type guessed from a file name's extension.
fn mime_for(file_name: &str) -> &'static str {
    let ext = file_name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
