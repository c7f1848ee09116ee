use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Sentinel shown when a value could not be determined for one VM.
pub const ERROR_SENTINEL: &str = "Error";
/// Sentinel shown when there is nothing to report (no node, no preference).
pub const NONE_SENTINEL: &str = "-";

/// Stable handle for a VM within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(pub u64);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Assigns ids by name. A name keeps its id for the lifetime of the registry,
/// so reordering `vm-mgr list` output never shuffles identities.
///
/// Names are never forgotten: a removed VM keeps its slot, and re-creating it
/// under the same name gets the old id back. The map grows with every name
/// the process has ever seen.
#[derive(Debug, Default)]
pub struct IdRegistry {
    ids: HashMap<String, VmId>,
    next: u64,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_for(&mut self, name: &str) -> VmId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        self.next += 1;
        let id = VmId(self.next);
        self.ids.insert(name.to_string(), id);
        id
    }
}

/// Placement preference configured for a VM in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DefaultPlacement {
    #[default]
    None,
    Prefer(String),
    Pin(String),
}

impl fmt::Display for DefaultPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultPlacement::None => write!(f, "{}", NONE_SENTINEL),
            DefaultPlacement::Prefer(node) => write!(f, "prefer: {}", node),
            DefaultPlacement::Pin(node) => write!(f, "pin: {}", node),
        }
    }
}

impl Serialize for DefaultPlacement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where a VM is running right now, as far as `crm resource locate` knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrentNode {
    /// Known not to be running anywhere.
    Unplaced,
    Node(String),
    /// Lookup failed for this VM only.
    Error,
}

impl CurrentNode {
    pub fn node(&self) -> Option<&str> {
        match self {
            CurrentNode::Node(node) => Some(node),
            _ => None,
        }
    }
}

impl fmt::Display for CurrentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurrentNode::Unplaced => write!(f, "{}", NONE_SENTINEL),
            CurrentNode::Node(node) => write!(f, "{}", node),
            CurrentNode::Error => write!(f, "{}", ERROR_SENTINEL),
        }
    }
}

impl Serialize for CurrentNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One row of the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRecord {
    pub id: VmId,
    pub name: String,
    pub state: String,
    pub default_node: DefaultPlacement,
    pub current_node: CurrentNode,
}

/// Role and hosting nodes of one resource, read from `crm_mon` XML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct ResourceStatus {
    pub role: String,
    pub active: bool,
    pub failed: bool,
    pub nodes: Vec<String>,
}

/// Options for `vm-mgr create`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCreateRequest {
    pub name: String,
    pub image_path: String,
    pub xml_path: String,
    /// Enables live migration, running it as this user.
    #[serde(default)]
    pub migration_user: Option<String>,
    #[serde(default)]
    pub pinned_host: Option<String>,
    #[serde(default)]
    pub preferred_host: Option<String>,
}
