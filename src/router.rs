// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Type-keyed branching.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::command::{CancellationToken, Command, TimeEstimate};
use crate::data::{TypedData, TypedDataType};
use crate::error::{CommandError, Result};
use crate::progress::MutableProgressTracker;

/// Sends its input to exactly one command, chosen by the input's data type.
///
/// ```no_run
/// use std::sync::Arc;
/// use nocap::commands::{FileSystemWriter, ImageEncoder};
/// use nocap::router::DataRouter;
/// use nocap::data::TypedDataType;
///
/// # fn main() -> nocap::error::Result<()> {
/// let mut router = DataRouter::new("save anything");
/// router.add(TypedDataType::Image, Arc::new(ImageEncoder::png()))?;
/// router.add(TypedDataType::Text, Arc::new(FileSystemWriter::new("/tmp/shots")))?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DataRouter {
    name: String,
    routes: IndexMap<TypedDataType, Arc<dyn Command>>,
    factory_id: Option<String>,
}

impl DataRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: IndexMap::new(),
            factory_id: None,
        }
    }

    pub fn with_factory_id(mut self, id: impl Into<String>) -> Self {
        self.factory_id = Some(id.into());
        self
    }

    /// Route `data_type` to `command`.
    ///
    /// Fails if `command` does not declare `data_type` as an input, or if the
    /// type is already routed.
    pub fn add(&mut self, data_type: TypedDataType, command: Arc<dyn Command>) -> Result<()> {
        if !command.accepts(data_type) {
            return Err(CommandError::InvalidArgument(format!(
                "router '{}': command '{}' does not accept {} data",
                self.name,
                command.name(),
                data_type
            )));
        }
        if self.routes.contains_key(&data_type) {
            return Err(CommandError::InvalidArgument(format!(
                "router '{}': {} is already routed to '{}'",
                self.name,
                data_type,
                self.routes[&data_type].name()
            )));
        }

        self.routes.insert(data_type, command);
        Ok(())
    }

    /// Builder form of [`DataRouter::add`].
    pub fn route(mut self, data_type: TypedDataType, command: Arc<dyn Command>) -> Result<Self> {
        self.add(data_type, command)?;
        Ok(self)
    }

    pub fn remove(&mut self, data_type: TypedDataType) -> Option<Arc<dyn Command>> {
        self.routes.shift_remove(&data_type)
    }

    pub fn get(&self, data_type: TypedDataType) -> Option<&Arc<dyn Command>> {
        self.routes.get(&data_type)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Command for DataRouter {
    fn name(&self) -> &str {
        &self.name
    }

    /// The routed types, in insertion order.
    fn input_data_types(&self) -> Vec<TypedDataType> {
        self.routes.keys().copied().collect()
    }

    fn time_estimate(&self) -> TimeEstimate {
        TimeEstimate::any_of(self.routes.values().map(|c| c.time_estimate()))
    }

    fn is_valid(&self) -> bool {
        self.routes.values().all(|c| c.is_valid())
    }

    fn factory_id(&self) -> Option<&str> {
        self.factory_id.as_deref()
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TypedData> {
        let data_type = input.data_type();
        let command = self
            .routes
            .get(&data_type)
            .ok_or(CommandError::Unrouted(data_type))?;

        tracing::debug!(
            target: "nocap::router",
            router = %self.name,
            %data_type,
            command = command.name(),
            "routing data"
        );

        cancel.check(command.name())?;
        command.process(input, progress, cancel)
    }
}
