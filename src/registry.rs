// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Explicit factory registry.
//!
//! Factories are registered by stable id at startup. The registry also picks
//! a default factory per [`CommandFeatures`] flag and serves those defaults
//! to composite factories through [`CommandProvider`].

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::chain::CommandChain;
use crate::command::{
    CancellationToken, Command, CommandFactory, CommandFeatures, CommandProvider, TimeEstimate,
};
use crate::commands::{FileSystemWriter, ImageEncoder, TextOperation, TextTransform};
use crate::data::{TypedData, TypedDataType};
use crate::error::{CommandError, Result};
use crate::progress::MutableProgressTracker;
use crate::router::DataRouter;

type BuildFn = dyn Fn(&dyn CommandProvider) -> Result<Arc<dyn Command>> + Send + Sync;

/// A factory defined by a closure.
pub struct FnFactory {
    id: String,
    name: String,
    features: CommandFeatures,
    build: Box<BuildFn>,
}

impl FnFactory {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        features: CommandFeatures,
        build: impl Fn(&dyn CommandProvider) -> Result<Arc<dyn Command>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            features,
            build: Box::new(build),
        }
    }
}

impl CommandFactory for FnFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> CommandFeatures {
        self.features
    }

    fn create_command(&self, provider: &dyn CommandProvider) -> Result<Arc<dyn Command>> {
        (self.build)(provider)
    }
}

impl fmt::Debug for FnFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFactory")
            .field("id", &self.id)
            .field("features", &self.features)
            .finish()
    }
}

/// Gives a factory-built command its back-reference to the factory.
struct FactoryTagged {
    inner: Arc<dyn Command>,
    factory_id: String,
}

impl Command for FactoryTagged {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn input_data_types(&self) -> Vec<TypedDataType> {
        self.inner.input_data_types()
    }

    fn time_estimate(&self) -> TimeEstimate {
        self.inner.time_estimate()
    }

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    fn factory_id(&self) -> Option<&str> {
        Some(&self.factory_id)
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TypedData> {
        self.inner.process(input, progress, cancel)
    }
}

/// Registered factories plus the default factory for each feature.
#[derive(Default)]
pub struct CommandRegistry {
    factories: IndexMap<String, Arc<dyn CommandFactory>>,
    defaults: IndexMap<CommandFeatures, String>,
}

/// Features the file writer serves by default until an uploader is configured.
const BUILTIN_DEFAULT_FEATURES: [CommandFeatures; 3] = [
    CommandFeatures::IMAGE_UPLOADER,
    CommandFeatures::FILE_UPLOADER,
    CommandFeatures::TEXT_UPLOADER,
];

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in factories and defaults, writing files to `output_dir`.
    pub fn with_builtins(output_dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new();
        for factory in builtin_factories(output_dir.into()) {
            if let Err(err) = registry.register(Arc::new(factory)) {
                tracing::error!(target: "nocap::registry", error = %err, "failed to register built-in factory");
            }
        }
        for feature in BUILTIN_DEFAULT_FEATURES {
            if let Err(err) = registry.set_default(feature, "file_writer") {
                tracing::error!(target: "nocap::registry", %feature, error = %err, "failed to set built-in default");
            }
        }
        registry
    }

    /// Add a factory. Ids must be unique.
    pub fn register(&mut self, factory: Arc<dyn CommandFactory>) -> Result<()> {
        let id = factory.id().to_string();
        if id.is_empty() {
            return Err(CommandError::InvalidArgument("factory id must not be empty".to_string()));
        }
        if self.factories.contains_key(&id) {
            return Err(CommandError::InvalidArgument(format!("factory '{}' is already registered", id)));
        }

        tracing::debug!(target: "nocap::registry", %id, features = %factory.features(), "registered factory");
        self.factories.insert(id, factory);
        Ok(())
    }

    /// Make `id` the default for `feature`. The factory must advertise it.
    pub fn set_default(&mut self, feature: CommandFeatures, id: &str) -> Result<()> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| CommandError::InvalidArgument(format!("unknown factory '{}'", id)))?;
        if feature.is_empty() || !factory.features().contains(feature) {
            return Err(CommandError::InvalidArgument(format!(
                "factory '{}' does not provide {}",
                id, feature
            )));
        }

        self.defaults.insert(feature, id.to_string());
        Ok(())
    }

    pub fn default_id(&self, feature: CommandFeatures) -> Option<&str> {
        self.defaults.get(&feature).map(String::as_str)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn CommandFactory>> {
        self.factories.get(id)
    }

    /// All factories in registration order.
    pub fn factories(&self) -> impl Iterator<Item = &Arc<dyn CommandFactory>> {
        self.factories.values()
    }

    pub fn factories_with(&self, feature: CommandFeatures) -> Vec<&Arc<dyn CommandFactory>> {
        self.factories().filter(|f| f.features().contains(feature)).collect()
    }

    /// Create a command from the factory registered as `id`.
    ///
    /// Collaborators are resolved through this registry's defaults.
    pub fn create(&self, id: &str) -> Result<Arc<dyn Command>> {
        Resolver::new(self).create(id)
    }

    /// Create a command, resolving collaborators through `provider` instead.
    pub fn create_with(&self, id: &str, provider: &dyn CommandProvider) -> Result<Arc<dyn Command>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| CommandError::InvalidArgument(format!("unknown factory '{}'", id)))?;
        let command = factory.create_command(provider)?;
        Ok(Arc::new(FactoryTagged {
            inner: command,
            factory_id: id.to_string(),
        }))
    }
}

impl CommandProvider for CommandRegistry {
    fn default_command(&self, feature: CommandFeatures) -> Option<Arc<dyn Command>> {
        Resolver::new(self).default_command(feature)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Resolves defaults while creating one command tree, refusing cycles such as
/// a composite factory that is its own default collaborator.
struct Resolver<'a> {
    registry: &'a CommandRegistry,
    creating: RefCell<Vec<String>>,
}

impl<'a> Resolver<'a> {
    fn new(registry: &'a CommandRegistry) -> Self {
        Self {
            registry,
            creating: RefCell::new(Vec::new()),
        }
    }

    fn create(&self, id: &str) -> Result<Arc<dyn Command>> {
        if self.creating.borrow().iter().any(|pending| pending == id) {
            return Err(CommandError::InvalidArgument(format!(
                "factory '{}' depends on itself via {}",
                id,
                self.creating.borrow().join(" -> ")
            )));
        }

        self.creating.borrow_mut().push(id.to_string());
        let result = self.registry.create_with(id, self);
        self.creating.borrow_mut().pop();
        result
    }
}

impl CommandProvider for Resolver<'_> {
    fn default_command(&self, feature: CommandFeatures) -> Option<Arc<dyn Command>> {
        let id = self.registry.default_id(feature)?;
        match self.create(id) {
            Ok(command) => Some(command),
            Err(err) => {
                tracing::warn!(target: "nocap::registry", %feature, %id, error = %err, "default command unavailable");
                None
            }
        }
    }
}

fn builtin_factories(output_dir: PathBuf) -> Vec<FnFactory> {
    let writer_dir = output_dir.clone();
    let save_dir = output_dir;

    vec![
        FnFactory::new("png_encoder", "Encode as PNG", CommandFeatures::NONE, |_| {
            Ok(Arc::new(ImageEncoder::png()))
        }),
        FnFactory::new("jpeg_encoder", "Encode as JPEG", CommandFeatures::NONE, |_| {
            Ok(Arc::new(ImageEncoder::jpeg(crate::commands::DEFAULT_JPEG_QUALITY)))
        }),
        FnFactory::new(
            "file_writer",
            "Save to folder",
            CommandFeatures::IMAGE_UPLOADER | CommandFeatures::FILE_UPLOADER | CommandFeatures::TEXT_UPLOADER,
            move |_| Ok(Arc::new(FileSystemWriter::new(writer_dir.clone()))),
        ),
        FnFactory::new("trim_text", "Trim text", CommandFeatures::NONE, |_| {
            Ok(Arc::new(TextTransform::new(vec![TextOperation::Trim])))
        }),
        FnFactory::new("save_anything", "Save anything", CommandFeatures::STAND_ALONE, move |_| {
            let writer: Arc<dyn Command> = Arc::new(FileSystemWriter::new(save_dir.clone()));
            let save_image = CommandChain::new("save image")
                .then(Arc::new(ImageEncoder::png()))
                .then(writer.clone());
            let router = DataRouter::new("save anything")
                .route(TypedDataType::Image, Arc::new(save_image))?
                .route(TypedDataType::Text, writer.clone())?
                .route(TypedDataType::RawData, writer.clone())?
                .route(TypedDataType::Stream, writer)?;
            Ok(Arc::new(router))
        }),
        FnFactory::new(
            "upload_image",
            "Upload image and shorten link",
            CommandFeatures::STAND_ALONE,
            |provider| {
                let uploader = provider.default_command(CommandFeatures::IMAGE_UPLOADER).ok_or_else(|| {
                    CommandError::InvalidArgument("no default image uploader is configured".to_string())
                })?;
                let mut chain = CommandChain::new("upload image")
                    .then(Arc::new(ImageEncoder::png()))
                    .then(uploader);
                // Shortening is optional.
                if let Some(shortener) = provider.default_command(CommandFeatures::URL_SHORTENER) {
                    chain.push(shortener);
                }
                Ok(Arc::new(chain))
            },
        ),
    ]
}
