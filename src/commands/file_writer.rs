// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Writes data to a directory and returns a `file://` URI.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use image::ImageFormat;
use reqwest::Url;

use crate::command::{CancellationToken, Command, TimeEstimate};
use crate::data::{DataPayload, TypedData, TypedDataType};
use crate::error::{CommandError, Result};
use crate::progress::MutableProgressTracker;

/// Bytes copied per read when writing a stream.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Attempts at finding a free file name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// The directory captures are saved to when none is configured:
/// `~/Pictures/nocap`, falling back to `~/.nocap/captures`.
pub fn default_output_dir() -> PathBuf {
    dirs::picture_dir()
        .map(|pictures| pictures.join("nocap"))
        .or_else(|| dirs::home_dir().map(|home| home.join(".nocap").join("captures")))
        .unwrap_or_else(|| PathBuf::from("nocap-captures"))
}

/// Saves its input as a file.
///
/// The file name comes from `name_template` when set, else from the data's
/// name, else from the current time. Placeholders: `{name}` (data name
/// without extension), `{timestamp}`, `{ext}`. Existing files are never
/// overwritten; a numeric suffix is added instead.
#[derive(Debug, Clone)]
pub struct FileSystemWriter {
    directory: PathBuf,
    name_template: Option<String>,
}

impl FileSystemWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            name_template: None,
        }
    }

    pub fn with_name_template(mut self, template: impl Into<String>) -> Self {
        self.name_template = Some(template.into());
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn default_extension(data_type: TypedDataType) -> &'static str {
        match data_type {
            TypedDataType::Text => "txt",
            TypedDataType::Image => "png",
            _ => "bin",
        }
    }

    fn file_name(&self, data: &TypedData) -> String {
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        // Only the last component of the name is used, so a name can never
        // point outside the target directory.
        let given = Path::new(data.name());
        let stem = given
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty() && *stem != "..");
        let ext = given
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_else(|| Self::default_extension(data.data_type()));

        match (&self.name_template, stem) {
            (Some(template), _) => template
                .replace("{name}", stem.unwrap_or("capture"))
                .replace("{timestamp}", &timestamp)
                .replace("{ext}", ext),
            (None, Some(stem)) => format!("{}.{}", stem, ext),
            (None, None) => format!("nocap_{}.{}", timestamp, ext),
        }
    }

    /// Create the first free file for `file_name` in the directory.
    ///
    /// Names are claimed with `create_new`, so two writers racing for the
    /// same name end up with different files.
    fn claim(&self, directory: &Path, file_name: &str) -> Result<(PathBuf, File)> {
        let as_path = Path::new(file_name);
        let stem = as_path.file_stem().and_then(|s| s.to_str()).unwrap_or(file_name);
        let ext = as_path.extension().and_then(|e| e.to_str());

        for n in 0..MAX_NAME_ATTEMPTS {
            let candidate = match (n, ext) {
                (0, _) => directory.join(file_name),
                (n, Some(ext)) => directory.join(format!("{}-{}.{}", stem, n, ext)),
                (n, None) => directory.join(format!("{}-{}", stem, n)),
            };
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => return Ok((candidate, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(CommandError::InvalidArgument(format!(
            "no free file name for '{}' in {}",
            file_name,
            directory.display()
        )))
    }

    /// Write `payload` into the claimed file, returning the bytes written.
    fn write_payload(
        &self,
        payload: &mut DataPayload,
        path: &Path,
        file: File,
        progress: &MutableProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut out = BufWriter::new(file);
        let written = match payload {
            DataPayload::Text(text) => {
                out.write_all(text.as_bytes())?;
                text.len() as u64
            }
            DataPayload::RawData(bytes) => {
                out.write_all(bytes)?;
                bytes.len() as u64
            }
            DataPayload::Image(image) => {
                image.write_to(&mut out, ImageFormat::from_path(path)?)?;
                out.stream_position()?
            }
            DataPayload::Stream(stream) => self.copy_stream(stream.as_mut(), &mut out, progress, cancel)?,
            other => return Err(CommandError::unsupported(self.name(), other.data_type())),
        };
        out.flush()?;
        Ok(written)
    }

    fn copy_stream(
        &self,
        stream: &mut (dyn Read + Send),
        out: &mut impl Write,
        progress: &MutableProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut buffer = vec![0_u8; STREAM_CHUNK_SIZE];
        let mut written = 0_u64;

        progress.set_indeterminate(true);
        loop {
            cancel.check(self.name())?;
            let read = stream.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            out.write_all(&buffer[..read])?;
            written += read as u64;
            progress.set_status(format!("{} bytes written", written));
        }
        Ok(written)
    }
}

impl Command for FileSystemWriter {
    fn name(&self) -> &str {
        "file system writer"
    }

    fn input_data_types(&self) -> Vec<TypedDataType> {
        vec![
            TypedDataType::Image,
            TypedDataType::Text,
            TypedDataType::RawData,
            TypedDataType::Stream,
        ]
    }

    fn time_estimate(&self) -> TimeEstimate {
        TimeEstimate::FAST
    }

    fn is_valid(&self) -> bool {
        !self.directory.as_os_str().is_empty()
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TypedData> {
        self.ensure_accepts(input)?;
        cancel.check(self.name())?;

        fs::create_dir_all(&self.directory)?;
        let directory = fs::canonicalize(&self.directory)?;
        let file_name = self.file_name(input);
        let (path, file) = self.claim(&directory, &file_name)?;
        tracing::debug!(target: "nocap::commands", path = %path.display(), data_type = %input.data_type(), "writing file");

        let written = match self.write_payload(input.payload_mut(), &path, file, progress, cancel) {
            Ok(written) => written,
            Err(err) => {
                // Never leave a partial file behind.
                let _ = fs::remove_file(&path);
                return Err(err);
            }
        };

        let uri = Url::from_file_path(&path).map_err(|()| {
            CommandError::InvalidArgument(format!("cannot express {} as a file URI", path.display()))
        })?;
        tracing::info!(target: "nocap::commands", path = %path.display(), bytes = written, "file written");

        let written_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(file_name);
        progress.complete();
        Ok(TypedData::from_uri(uri, written_name))
    }
}
