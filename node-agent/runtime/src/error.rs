use crate::{
    core::{Errors, Uid},
    ipset, netns, proxy,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The workload's namespace is not known. This is expected while a workload is still being
    /// created, or after it has already been removed.
    #[error("netns not found for workload {0}")]
    NamespaceNotFound(Uid),

    #[error(transparent)]
    NamespaceOpen(#[from] netns::OpenError),

    #[error("failed to discover netns: {0}")]
    NamespaceDiscovery(#[source] anyhow::Error),

    #[error("failed to update probe set: {0}")]
    AdmissionSet(#[source] Errors<ipset::Error>),

    #[error("failed to install redirect rules: {0}")]
    RuleInstall(#[source] anyhow::Error),

    #[error("failed to remove redirect rules: {0}")]
    RuleRemoval(#[source] anyhow::Error),

    /// Redirect rules were installed but the proxy did not confirm the workload. The workload
    /// must still be removed from the mesh to tear the rules down.
    #[error("workload redirected but not confirmed by proxy: {0}")]
    PartialAdd(#[source] proxy::Error),

    #[error(transparent)]
    ProxySync(proxy::Error),

    #[error(transparent)]
    NamespaceSwitch(#[from] netns::SwitchError),

    #[error("failed to construct snapshot:\n{0}")]
    Snapshot(Errors<Error>),
}

// === impl Error ===

impl Error {
    pub fn is_partial_add(&self) -> bool {
        matches!(self, Self::PartialAdd(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NamespaceNotFound(_))
    }
}

impl From<ipset::Error> for Error {
    fn from(error: ipset::Error) -> Self {
        Self::AdmissionSet(error.into())
    }
}

impl From<Errors<ipset::Error>> for Error {
    fn from(errors: Errors<ipset::Error>) -> Self {
        Self::AdmissionSet(errors)
    }
}
