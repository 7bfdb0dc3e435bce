use std::{
    fmt,
    hash::{Hash, Hasher},
    net::IpAddr,
    sync::Arc,
};

/// A workload's stable unique identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(Arc<str>);

/// A workload (pod) as seen by the node agent.
///
/// The namespace and name are only used for diagnostics; workloads are compared by UID.
#[derive(Clone, Debug)]
pub struct Workload {
    pub uid: Uid,
    pub namespace: String,
    pub name: String,

    /// The workload's currently known IPs. This may lag behind the IPs a CNI invocation has
    /// first-hand knowledge of.
    pub ips: Vec<IpAddr>,
}

// === impl Uid ===

impl Uid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Uid {
    fn from(uid: &str) -> Self {
        Self(uid.into())
    }
}

impl From<String> for Uid {
    fn from(uid: String) -> Self {
        Self(uid.into())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl Workload ===

impl Workload {
    pub fn new(uid: impl Into<Uid>, namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            uid: uid.into(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            ips: Vec::new(),
        }
    }

    pub fn with_ips(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.ips = ips.into_iter().collect();
        self
    }
}

impl PartialEq for Workload {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for Workload {}

impl Hash for Workload {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
