// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Small text rewrites, mostly for shaping links before they are shared.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::command::{CancellationToken, Command, TimeEstimate};
use crate::data::{DataPayload, TypedData, TypedDataType};
use crate::error::{CommandError, Result};
use crate::progress::MutableProgressTracker;

/// One rewrite step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TextOperation {
    Trim,
    Upper,
    Lower,
    /// Substitute `{text}` and `{name}` into `template`.
    Template { template: String },
}

impl TextOperation {
    fn apply(&self, text: &str, name: &str) -> String {
        match self {
            TextOperation::Trim => text.trim().to_string(),
            TextOperation::Upper => text.to_uppercase(),
            TextOperation::Lower => text.to_lowercase(),
            TextOperation::Template { template } => template.replace("{text}", text).replace("{name}", name),
        }
    }
}

/// Applies a list of [`TextOperation`]s to text or a URI, producing text.
#[derive(Debug, Clone, Default)]
pub struct TextTransform {
    operations: Vec<TextOperation>,
}

impl TextTransform {
    pub fn new(operations: Vec<TextOperation>) -> Self {
        Self { operations }
    }

    pub fn then(mut self, operation: TextOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn operations(&self) -> &[TextOperation] {
        &self.operations
    }
}

impl Command for TextTransform {
    fn name(&self) -> &str {
        "text transform"
    }

    fn input_data_types(&self) -> Vec<TypedDataType> {
        vec![TypedDataType::Text, TypedDataType::Uri]
    }

    fn time_estimate(&self) -> TimeEstimate {
        TimeEstimate::INSTANTANEOUS
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TypedData> {
        self.ensure_accepts(input)?;
        cancel.check(self.name())?;

        let source = match input.payload() {
            DataPayload::Text(text) => text.clone(),
            DataPayload::Uri(uri) => uri.to_string(),
            other => return Err(CommandError::unsupported(self.name(), other.data_type())),
        };
        let text = self
            .operations
            .iter()
            .fold(source, |text, operation| operation.apply(&text, input.name()));

        progress.complete();
        Ok(TypedData::from_text(text, input.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    fn transform(ops: Vec<TextOperation>, mut input: TypedData) -> Result<TypedData> {
        TextTransform::new(ops).process(&mut input, &Arc::new(MutableProgressTracker::new()), &CancellationToken::new())
    }

    #[test]
    fn test_operations_apply_in_order() {
        let ops = vec![
            TextOperation::Trim,
            TextOperation::Upper,
            TextOperation::Template {
                template: "[{name}] {text}".into(),
            },
        ];
        let output = transform(ops, TypedData::from_text("  hi there ", "note")).unwrap();
        assert_eq!(output.as_text(), Some("[note] HI THERE"));
    }

    #[test]
    fn test_uri_becomes_text() {
        let uri = Url::parse("https://Example.com/A").unwrap();
        let output = transform(vec![TextOperation::Lower], TypedData::from_uri(uri, "link")).unwrap();
        assert_eq!(output.data_type(), TypedDataType::Text);
        assert_eq!(output.as_text(), Some("https://example.com/a"));
    }

    #[test]
    fn test_no_operations_is_identity() {
        let output = transform(Vec::new(), TypedData::from_text("same", "s")).unwrap();
        assert_eq!(output.as_text(), Some("same"));
    }

    #[test]
    fn test_operation_serde() {
        let op: TextOperation = serde_json::from_str(r#"{"op":"template","template":"<{text}>"}"#).unwrap();
        assert_eq!(op.apply("x", ""), "<x>");
        assert!(transform(vec![op], TypedData::from_raw_data(vec![], "r")).is_err());
    }
}
