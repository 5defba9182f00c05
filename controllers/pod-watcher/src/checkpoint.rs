//! Resource version tracking.
//!
//! The checkpoint is the resourceVersion of the last notification the watch
//! loop fully normalized. A watch is always reopened from it; dropping it
//! forces a full relist.

/// Last processed resourceVersion of one watch loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    resource_version: Option<String>,
}

impl Checkpoint {
    /// Creates an empty checkpoint
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the checkpoint forward. Empty versions are ignored.
    pub fn advance(&mut self, resource_version: impl Into<String>) {
        let resource_version = resource_version.into();
        if !resource_version.is_empty() {
            self.resource_version = Some(resource_version);
        }
    }

    /// Drops the checkpoint so the next cycle starts with a LIST.
    pub fn reset(&mut self) {
        self.resource_version = None;
    }

    /// Whether a watch can be resumed without relisting
    pub fn is_set(&self) -> bool {
        self.resource_version.is_some()
    }

    /// Current resourceVersion, if any
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }
}
