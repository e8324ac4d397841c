// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Concrete leaf commands.
//!
//! | Command | Input | Output |
//! |---|---|---|
//! | [`ImageEncoder`] | image | raw data |
//! | [`FileSystemWriter`] | image, text, raw data, stream | `file://` URI |
//! | [`HttpUploader`] | raw data, stream, text, URI | URI or text |
//! | [`TextTransform`] | text, URI | text |

mod encoder;
mod file_writer;
mod http;
mod text;

pub use encoder::{EncodeFormat, ImageEncoder, DEFAULT_JPEG_QUALITY};
pub use file_writer::{default_output_dir, FileSystemWriter};
pub use http::{
    HttpReply, HttpTransport, HttpUploader, ReplyKind, ReqwestTransport, UploadBody, UploadRequest,
    DEFAULT_TIMEOUT_SECS,
};
pub use text::{TextOperation, TextTransform};
