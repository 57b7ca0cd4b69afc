//! Extension metadata lookup, supplied by the host environment.

use crate::identity::CallerId;

/// Metadata needed to instantiate an extension inside a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInfo {
    name: String,
    owner_package: String,
    owner_uid: u32,
    entry_point: Option<String>,
}

impl ExtensionInfo {
    /// Describes an extension and the package that ships it.
    #[must_use]
    pub fn new(name: impl Into<String>, owner_package: impl Into<String>, owner_uid: u32) -> Self {
        Self {
            name: name.into(),
            owner_package: owner_package.into(),
            owner_uid,
            entry_point: None,
        }
    }

    /// Sets the entry point the worker instantiates.
    #[must_use]
    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    /// Extension name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Package shipping the extension.
    #[must_use]
    pub fn owner_package(&self) -> &str {
        self.owner_package.as_str()
    }

    /// Uid of the package shipping the extension.
    #[must_use]
    pub const fn owner_uid(&self) -> u32 {
        self.owner_uid
    }

    /// Entry point, when the package declares a usable one.
    #[must_use]
    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point
            .as_deref()
            .filter(|entry| !entry.trim().is_empty())
    }
}

/// Resolves extension names for a caller.
pub trait ExtensionResolver: Send + Sync {
    /// Looks up `name` as seen by `caller`. `None` means the caller does not
    /// depend on any extension of that name.
    fn resolve(&self, name: &str, caller: &CallerId) -> Option<ExtensionInfo>;
}
