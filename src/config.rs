// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User configuration: output directory, uploaders and named pipelines.
//!
//! Stored as JSON in `~/.nocap/config.json`. Pipelines are trees of
//! [`CommandSpec`] nodes:
//!
//! ```json
//! {
//!   "default_pipeline": "share",
//!   "uploaders": {
//!     "pics": {
//!       "features": ["image_uploader"],
//!       "name": "pics.example",
//!       "url": "https://pics.example/api/upload",
//!       "response_pattern": "\"link\":\"([^\"]+)\""
//!     }
//!   },
//!   "defaults": { "image_uploader": "pics" },
//!   "pipelines": {
//!     "share": {
//!       "type": "router",
//!       "routes": {
//!         "image": { "type": "factory", "id": "upload_image" },
//!         "text": { "type": "file_system_writer" }
//!       }
//!     }
//!   }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::chain::CommandChain;
use crate::command::{Command, CommandFeatures};
use crate::commands::{
    default_output_dir, EncodeFormat, FileSystemWriter, HttpUploader, ImageEncoder, ReplyKind, ReqwestTransport,
    TextOperation, TextTransform, DEFAULT_JPEG_QUALITY,
};
use crate::data::TypedDataType;
use crate::error::CommandError;
use crate::registry::{CommandRegistry, FnFactory};
use crate::router::DataRouter;

/// Name of the pipeline used when none is configured or requested.
pub const BUILTIN_PIPELINE: &str = "save";

/// Settings for one [`HttpUploader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploaderSpec {
    pub name: String,
    pub url: String,
    /// Form field carrying the payload
    #[serde(default = "default_field")]
    pub field: String,
    /// Extra form fields
    #[serde(default)]
    pub fields: IndexMap<String, String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Regex locating the link in the reply; group 1 if present
    #[serde(default)]
    pub response_pattern: Option<String>,
    #[serde(default)]
    pub reply: ReplyKind,
    /// Restrict accepted inputs (e.g. `["uri"]` for a shortener)
    #[serde(default)]
    pub accepts: Option<Vec<TypedDataType>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_field() -> String {
    "file".to_string()
}

impl UploaderSpec {
    pub fn build(&self) -> Result<HttpUploader, CommandError> {
        let url = Url::parse(&self.url)
            .map_err(|e| CommandError::InvalidArgument(format!("uploader '{}': bad url '{}': {}", self.name, self.url, e)))?;

        let mut transport = ReqwestTransport::new();
        if let Some(secs) = self.timeout_secs {
            transport = transport.with_timeout(Duration::from_secs(secs));
        }

        let mut uploader = HttpUploader::new(&self.name, url)
            .with_field_name(&self.field)
            .with_reply_kind(self.reply)
            .with_transport(Arc::new(transport));
        for (name, value) in &self.fields {
            uploader = uploader.with_form_field(name, value);
        }
        for (name, value) in &self.headers {
            uploader = uploader.with_header(name, value);
        }
        if let Some(pattern) = &self.response_pattern {
            uploader = uploader.with_response_pattern(pattern)?;
        }
        if let Some(types) = &self.accepts {
            uploader = uploader.accepting(types.clone());
        }
        Ok(uploader)
    }
}

/// Serializable description of a command tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandSpec {
    ImageEncoder {
        #[serde(default)]
        format: EncodeFormat,
        #[serde(default)]
        quality: Option<u8>,
    },
    FileSystemWriter {
        /// Defaults to the configured output directory
        #[serde(default)]
        directory: Option<PathBuf>,
        #[serde(default)]
        name_template: Option<String>,
    },
    HttpUploader(UploaderSpec),
    TextTransform {
        #[serde(default)]
        operations: Vec<TextOperation>,
    },
    Chain {
        #[serde(default)]
        name: Option<String>,
        commands: Vec<CommandSpec>,
    },
    Router {
        #[serde(default)]
        name: Option<String>,
        routes: IndexMap<TypedDataType, CommandSpec>,
    },
    /// A command created by a registered factory
    Factory { id: String },
}

impl CommandSpec {
    /// Build the command tree. `label` names unnamed chains and routers.
    pub fn build(&self, label: &str, registry: &CommandRegistry, output_dir: &Path) -> Result<Arc<dyn Command>, CommandError> {
        let command: Arc<dyn Command> = match self {
            CommandSpec::ImageEncoder { format, quality } => {
                let quality = quality.unwrap_or(DEFAULT_JPEG_QUALITY);
                Arc::new(ImageEncoder::new(*format).with_quality(quality))
            }
            CommandSpec::FileSystemWriter { directory, name_template } => {
                let mut writer = FileSystemWriter::new(directory.clone().unwrap_or_else(|| output_dir.to_path_buf()));
                if let Some(template) = name_template {
                    writer = writer.with_name_template(template);
                }
                Arc::new(writer)
            }
            CommandSpec::HttpUploader(spec) => Arc::new(spec.build()?),
            CommandSpec::TextTransform { operations } => Arc::new(TextTransform::new(operations.clone())),
            CommandSpec::Chain { name, commands } => {
                let name = name.as_deref().unwrap_or(label);
                let mut chain = CommandChain::new(name);
                for (step, spec) in commands.iter().enumerate() {
                    chain.push(spec.build(&format!("{} step {}", name, step + 1), registry, output_dir)?);
                }
                Arc::new(chain)
            }
            CommandSpec::Router { name, routes } => {
                let name = name.as_deref().unwrap_or(label);
                let mut router = DataRouter::new(name);
                for (data_type, spec) in routes {
                    let target = spec.build(&format!("{} {} route", name, data_type), registry, output_dir)?;
                    router.add(*data_type, target)?;
                }
                Arc::new(router)
            }
            CommandSpec::Factory { id } => registry.create(id)?,
        };
        Ok(command)
    }
}

/// An uploader entry: which features it provides plus its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Feature names, e.g. `image_uploader`, `url_shortener`
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(flatten)]
    pub uploader: UploaderSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where file writers save by default
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Pipeline used when `--pipeline` is not given
    #[serde(default)]
    pub default_pipeline: Option<String>,
    /// Uploaders, registered as factories under their key
    #[serde(default)]
    pub uploaders: IndexMap<String, UploaderConfig>,
    /// Default factory id per feature name
    #[serde(default)]
    pub defaults: IndexMap<String, String>,
    #[serde(default)]
    pub pipelines: IndexMap<String, CommandSpec>,
}

impl Config {
    /// The configuration used when no file exists: only built-in pipelines.
    pub fn builtin() -> Self {
        Self::default().with_builtin_pipelines()
    }

    /// Add built-in pipelines the user has not overridden.
    pub fn with_builtin_pipelines(mut self) -> Self {
        for (name, spec) in builtin_pipelines() {
            self.pipelines.entry(name).or_insert(spec);
        }
        self
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(default_output_dir)
    }

    pub fn default_pipeline(&self) -> &str {
        self.default_pipeline.as_deref().unwrap_or(BUILTIN_PIPELINE)
    }

    /// Built-in factories plus the configured uploaders and defaults.
    pub fn registry(&self) -> Result<CommandRegistry> {
        let mut registry = CommandRegistry::with_builtins(self.output_dir());

        for (id, entry) in &self.uploaders {
            let mut features = CommandFeatures::NONE;
            for name in &entry.features {
                features |= CommandFeatures::from_name(name)
                    .with_context(|| format!("uploader '{}': unknown feature '{}'", id, name))?;
            }
            // Surface bad urls and patterns at load time rather than first use.
            entry.uploader.build().with_context(|| format!("uploader '{}'", id))?;

            let spec = entry.uploader.clone();
            let factory = FnFactory::new(id.clone(), entry.uploader.name.clone(), features, move |_| {
                let uploader: Arc<dyn Command> = Arc::new(spec.build()?);
                Ok(uploader)
            });
            registry
                .register(Arc::new(factory))
                .with_context(|| format!("registering uploader '{}'", id))?;
        }

        for (feature_name, id) in &self.defaults {
            let Some(feature) = CommandFeatures::from_name(feature_name) else {
                bail!("defaults: unknown feature '{}'", feature_name);
            };
            registry
                .set_default(feature, id)
                .with_context(|| format!("defaults: {} -> {}", feature_name, id))?;
        }

        Ok(registry)
    }

    /// Build the named pipeline.
    pub fn pipeline(&self, name: &str, registry: &CommandRegistry) -> Result<Arc<dyn Command>> {
        let spec = self.pipelines.get(name).with_context(|| {
            let known: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
            format!("no pipeline named '{}' (configured: {})", name, known.join(", "))
        })?;
        spec.build(name, registry, &self.output_dir())
            .with_context(|| format!("building pipeline '{}'", name))
    }
}

/// `save`: images are encoded to PNG and written, everything else written as is.
pub fn builtin_pipelines() -> IndexMap<String, CommandSpec> {
    let writer = CommandSpec::FileSystemWriter {
        directory: None,
        name_template: None,
    };
    let mut routes = IndexMap::new();
    routes.insert(
        TypedDataType::Image,
        CommandSpec::Chain {
            name: Some("save image".to_string()),
            commands: vec![
                CommandSpec::ImageEncoder {
                    format: EncodeFormat::Png,
                    quality: None,
                },
                writer.clone(),
            ],
        },
    );
    routes.insert(TypedDataType::Text, writer.clone());
    routes.insert(TypedDataType::RawData, writer.clone());
    routes.insert(TypedDataType::Stream, writer);

    let mut pipelines = IndexMap::new();
    pipelines.insert(
        BUILTIN_PIPELINE.to_string(),
        CommandSpec::Router {
            name: Some("save".to_string()),
            routes,
        },
    );
    pipelines
}

/// `~/.nocap`, created on first use.
pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let config_dir = home.join(".nocap");
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }
    Ok(config_dir)
}

/// Load `path`, or `~/.nocap/config.json` when `path` is `None`.
///
/// A missing file yields the built-in configuration.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => get_config_dir()?.join("config.json"),
    };

    let config: Config = if config_path.exists() {
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", config_path.display()))?
    } else {
        tracing::debug!(target: "nocap::config", path = %config_path.display(), "no config file; using built-in pipelines");
        Config::default()
    };

    Ok(config.with_builtin_pipelines())
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}
