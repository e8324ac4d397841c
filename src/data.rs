// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed payloads that flow between commands.
//!
//! A [`TypedData`] pairs a payload with its semantic type tag, a display name
//! (usually doubling as a file-name hint) and an optional disposer. The tag is
//! derived from the payload variant, so "no data" and the `None` tag can never
//! disagree.
//!
//! Ownership follows the pipeline: whoever holds the `TypedData` owns it, and
//! disposing it (explicitly or by dropping it) runs the disposer exactly once.

use std::any::Any;
use std::fmt;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};

use image::DynamicImage;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{CommandError, Result};

/// Semantic type of a [`TypedData`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypedDataType {
    /// No payload
    None,
    /// UTF-8 text
    Text,
    /// A URI, typically the result of an upload or a file write
    Uri,
    /// A decoded bitmap
    Image,
    /// A readable byte stream
    Stream,
    /// An in-memory byte buffer
    RawData,
    /// An application-defined value
    User,
}

impl TypedDataType {
    /// All variants, in declaration order.
    pub const ALL: [TypedDataType; 7] = [
        TypedDataType::None,
        TypedDataType::Text,
        TypedDataType::Uri,
        TypedDataType::Image,
        TypedDataType::Stream,
        TypedDataType::RawData,
        TypedDataType::User,
    ];

    /// Convert the tag to its lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Text => "text",
            Self::Uri => "uri",
            Self::Image => "image",
            Self::Stream => "stream",
            Self::RawData => "raw_data",
            Self::User => "user",
        }
    }
}

impl fmt::Display for TypedDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The value carried by a [`TypedData`].
pub enum DataPayload {
    None,
    Text(String),
    Uri(Url),
    Image(DynamicImage),
    Stream(Box<dyn Read + Send>),
    RawData(Vec<u8>),
    User(Box<dyn Any + Send>),
}

impl DataPayload {
    /// The type tag matching this payload variant.
    pub fn data_type(&self) -> TypedDataType {
        match self {
            Self::None => TypedDataType::None,
            Self::Text(_) => TypedDataType::Text,
            Self::Uri(_) => TypedDataType::Uri,
            Self::Image(_) => TypedDataType::Image,
            Self::Stream(_) => TypedDataType::Stream,
            Self::RawData(_) => TypedDataType::RawData,
            Self::User(_) => TypedDataType::User,
        }
    }
}

impl fmt::Debug for DataPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Uri(uri) => f.debug_tuple("Uri").field(&uri.as_str()).finish(),
            Self::Image(image) => write!(f, "Image({}x{})", image.width(), image.height()),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::RawData(bytes) => write!(f, "RawData({} bytes)", bytes.len()),
            Self::User(_) => f.write_str("User(..)"),
        }
    }
}

type Disposer = Box<dyn FnOnce() + Send>;

/// A payload tagged with its semantic type, a name and a disposal contract.
pub struct TypedData {
    payload: DataPayload,
    name: String,
    disposer: Option<Disposer>,
    disposed: bool,
}

impl TypedData {
    /// Build from an explicit type tag and an optional payload.
    ///
    /// Fails with [`CommandError::InvalidArgument`] when the payload is
    /// missing for a non-`None` tag, present for the `None` tag, or of a
    /// different variant than the tag names.
    pub fn new(data_type: TypedDataType, payload: Option<DataPayload>, name: impl Into<String>) -> Result<Self> {
        let payload = match (data_type, payload) {
            (TypedDataType::None, None) => DataPayload::None,
            (TypedDataType::None, Some(payload)) => {
                return Err(CommandError::InvalidArgument(format!(
                    "data of type none cannot carry a {} payload",
                    payload.data_type()
                )));
            }
            (expected, None) => {
                return Err(CommandError::InvalidArgument(format!(
                    "data of type {} requires a payload",
                    expected
                )));
            }
            (expected, Some(payload)) if payload.data_type() != expected => {
                return Err(CommandError::InvalidArgument(format!(
                    "payload of type {} does not match declared type {}",
                    payload.data_type(),
                    expected
                )));
            }
            (_, Some(payload)) => payload,
        };

        Ok(Self::from_payload(payload, name))
    }

    fn from_payload(payload: DataPayload, name: impl Into<String>) -> Self {
        Self {
            payload,
            name: name.into(),
            disposer: None,
            disposed: false,
        }
    }

    /// The empty value, used as the input of source commands.
    pub fn none() -> Self {
        Self::from_payload(DataPayload::None, "")
    }

    pub fn from_text(text: impl Into<String>, name: impl Into<String>) -> Self {
        Self::from_payload(DataPayload::Text(text.into()), name)
    }

    pub fn from_uri(uri: Url, name: impl Into<String>) -> Self {
        Self::from_payload(DataPayload::Uri(uri), name)
    }

    pub fn from_image(image: DynamicImage, name: impl Into<String>) -> Self {
        Self::from_payload(DataPayload::Image(image), name)
    }

    pub fn from_stream(stream: impl Read + Send + 'static, name: impl Into<String>) -> Self {
        Self::from_payload(DataPayload::Stream(Box::new(stream)), name)
    }

    pub fn from_raw_data(bytes: Vec<u8>, name: impl Into<String>) -> Self {
        Self::from_payload(DataPayload::RawData(bytes), name)
    }

    pub fn from_user<T: Any + Send>(value: T, name: impl Into<String>) -> Self {
        Self::from_payload(DataPayload::User(Box::new(value)), name)
    }

    /// Attach a disposer that runs once when this data is disposed or dropped.
    ///
    /// Replaces any disposer attached earlier.
    pub fn with_disposer(mut self, disposer: impl FnOnce() + Send + 'static) -> Self {
        self.disposer = Some(Box::new(disposer));
        self
    }

    pub fn data_type(&self) -> TypedDataType {
        self.payload.data_type()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &DataPayload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut DataPayload {
        &mut self.payload
    }

    pub fn is_none(&self) -> bool {
        matches!(self.payload, DataPayload::None)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            DataPayload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_uri(&self) -> Option<&Url> {
        match &self.payload {
            DataPayload::Uri(uri) => Some(uri),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&DynamicImage> {
        match &self.payload {
            DataPayload::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_raw_data(&self) -> Option<&[u8]> {
        match &self.payload {
            DataPayload::RawData(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_user<T: Any>(&self) -> Option<&T> {
        match &self.payload {
            DataPayload::User(value) => value.downcast_ref(),
            _ => None,
        }
    }

    /// Mutable access to a stream payload, for commands that read it.
    pub fn stream_mut(&mut self) -> Option<&mut (dyn Read + Send + 'static)> {
        match &mut self.payload {
            DataPayload::Stream(stream) => Some(stream.as_mut()),
            _ => None,
        }
    }

    /// Move the payload out as a new value with the same name.
    ///
    /// The disposer stays here with the caller, which still owns the
    /// underlying resources; the returned value has no disposer and this one
    /// is left holding a `None` payload.
    pub fn take(&mut self) -> TypedData {
        let payload = std::mem::replace(&mut self.payload, DataPayload::None);
        Self::from_payload(payload, self.name.clone())
    }

    /// Release the payload. Runs the disposer on the first call only.
    ///
    /// Stream payloads are closed; other payloads are left readable so a
    /// disposed value can still be inspected in tests and logs.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let DataPayload::Stream(stream) = &mut self.payload {
            *stream = Box::new(std::io::empty());
        }
        if let Some(disposer) = self.disposer.take() {
            tracing::trace!(name = %self.name, data_type = %self.data_type(), "disposing data");
            disposer();
        }
    }

    /// Dispose without unwinding. Returns `false` if the disposer panicked.
    pub fn try_dispose(&mut self) -> bool {
        catch_unwind(AssertUnwindSafe(|| self.dispose())).is_ok()
    }

    /// Short human-readable rendering used by the CLI and logs.
    pub fn describe(&self) -> String {
        match &self.payload {
            DataPayload::None => "(no data)".to_string(),
            DataPayload::Text(text) => text.clone(),
            DataPayload::Uri(uri) => uri.to_string(),
            DataPayload::Image(image) => format!("image {}x{}", image.width(), image.height()),
            DataPayload::Stream(_) => format!("stream '{}'", self.name),
            DataPayload::RawData(bytes) => format!("{} bytes", bytes.len()),
            DataPayload::User(_) => format!("user data '{}'", self.name),
        }
    }
}

impl Default for TypedData {
    fn default() -> Self {
        Self::none()
    }
}

impl Drop for TypedData {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for TypedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedData")
            .field("payload", &self.payload)
            .field("name", &self.name)
            .field("has_disposer", &self.disposer.is_some())
            .field("disposed", &self.disposed)
            .finish()
    }
}
