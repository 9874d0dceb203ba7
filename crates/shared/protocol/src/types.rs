use crate::wire::WireConstants;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Per-subject container scratch directory.
    Container,
    /// Per-subject cache directory.
    Cache,
}

impl RequestKind {
    pub fn as_u32(self) -> u32 {
        match self {
            RequestKind::Container => WireConstants::KIND_CONTAINER,
            RequestKind::Cache => WireConstants::KIND_CACHE,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            WireConstants::KIND_CONTAINER => Some(RequestKind::Container),
            WireConstants::KIND_CACHE => Some(RequestKind::Cache),
            _ => None,
        }
    }
}

/// One provisioning call. `declared_capacity` is the truncation trigger:
/// the service writes its computed path into a buffer of this size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub kind: RequestKind,
    pub flags: u32,
    pub subject: String,
    pub declared_capacity: u32,
}

impl ProvisioningRequest {
    pub fn new(subject: impl Into<String>, kind: RequestKind, declared_capacity: u32) -> Self {
        Self {
            kind,
            flags: WireConstants::DEFAULT_FLAGS,
            subject: subject.into(),
            declared_capacity,
        }
    }
}

/// Reply to one provisioning call. Constructed per request, discarded after
/// inspection; `path` is absent when the service reported an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningReply {
    pub status: u32,
    pub path: Option<String>,
}

impl ProvisioningReply {
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }

    /// True when the returned path lost its trailing separator, i.e. the
    /// undersized capacity actually truncated inside the service.
    pub fn truncation_confirmed(&self) -> bool {
        self.path
            .as_deref()
            .map(|p| !p.is_empty() && !p.ends_with('/'))
            .unwrap_or(false)
    }
}
