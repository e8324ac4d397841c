// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Factories and the default-command provider they consume.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use super::Command;
use crate::error::Result;

/// What a command can be used for. Only used to categorise factories.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CommandFeatures(u32);

impl CommandFeatures {
    pub const NONE: CommandFeatures = CommandFeatures(0);
    pub const IMAGE_UPLOADER: CommandFeatures = CommandFeatures(1 << 0);
    pub const URL_SHORTENER: CommandFeatures = CommandFeatures(1 << 1);
    pub const FILE_UPLOADER: CommandFeatures = CommandFeatures(1 << 2);
    pub const TEXT_UPLOADER: CommandFeatures = CommandFeatures(1 << 3);
    pub const STAND_ALONE: CommandFeatures = CommandFeatures(1 << 4);

    const NAMES: [(CommandFeatures, &'static str); 5] = [
        (Self::IMAGE_UPLOADER, "image_uploader"),
        (Self::URL_SHORTENER, "url_shortener"),
        (Self::FILE_UPLOADER, "file_uploader"),
        (Self::TEXT_UPLOADER, "text_uploader"),
        (Self::STAND_ALONE, "stand_alone"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is set in `self`.
    pub const fn contains(self, other: CommandFeatures) -> bool {
        self.0 & other.0 == other.0
    }

    /// Names of the flags that are set, in declaration order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parse a single flag name as printed by [`CommandFeatures::names`].
    pub fn from_name(name: &str) -> Option<CommandFeatures> {
        Self::NAMES
            .iter()
            .find(|(_, candidate)| *candidate == name)
            .map(|(flag, _)| *flag)
    }
}

impl BitOr for CommandFeatures {
    type Output = CommandFeatures;

    fn bitor(self, rhs: CommandFeatures) -> CommandFeatures {
        CommandFeatures(self.0 | rhs.0)
    }
}

impl BitOrAssign for CommandFeatures {
    fn bitor_assign(&mut self, rhs: CommandFeatures) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CommandFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandFeatures({})", self)
    }
}

impl fmt::Display for CommandFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&self.names().join(" | "))
        }
    }
}

/// Resolves "the default command for feature X".
///
/// Composite factories use this to fill in collaborators, e.g. a pipeline
/// that needs whatever image uploader the user picked.
pub trait CommandProvider {
    fn default_command(&self, feature: CommandFeatures) -> Option<Arc<dyn Command>>;
}

impl<F> CommandProvider for F
where
    F: Fn(CommandFeatures) -> Option<Arc<dyn Command>>,
{
    fn default_command(&self, feature: CommandFeatures) -> Option<Arc<dyn Command>> {
        self(feature)
    }
}

/// Creates fully populated commands of one kind.
pub trait CommandFactory: Send + Sync {
    /// Stable identifier used as the registry key.
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn features(&self) -> CommandFeatures;

    /// Create a command, resolving any collaborators through `provider`.
    fn create_command(&self, provider: &dyn CommandProvider) -> Result<Arc<dyn Command>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine() {
        let mut features = CommandFeatures::IMAGE_UPLOADER | CommandFeatures::TEXT_UPLOADER;
        assert!(features.contains(CommandFeatures::IMAGE_UPLOADER));
        assert!(!features.contains(CommandFeatures::URL_SHORTENER));

        features |= CommandFeatures::URL_SHORTENER;
        assert!(features.contains(CommandFeatures::URL_SHORTENER | CommandFeatures::TEXT_UPLOADER));
        assert_eq!(features.bits(), 0b1011);
    }

    #[test]
    fn test_display_names() {
        let features = CommandFeatures::FILE_UPLOADER | CommandFeatures::STAND_ALONE;
        assert_eq!(features.to_string(), "file_uploader | stand_alone");
        assert_eq!(CommandFeatures::NONE.to_string(), "none");
        assert!(CommandFeatures::NONE.contains(CommandFeatures::NONE));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(CommandFeatures::from_name("url_shortener"), Some(CommandFeatures::URL_SHORTENER));
        assert_eq!(CommandFeatures::from_name("clipboard"), None);
    }

    #[test]
    fn test_closure_provider() {
        let provider = |_: CommandFeatures| -> Option<Arc<dyn Command>> { None };
        assert!(provider.default_command(CommandFeatures::IMAGE_UPLOADER).is_none());
    }
}
