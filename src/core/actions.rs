use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::core::inventory::InventoryStore;
use crate::core::parser;
use crate::core::vm::{VirtualMachineRecord, VmCreateRequest};
use crate::errors::{ClusterError, ClusterResult};

/// Operations handed straight to `vm-mgr` or `crm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VmAction {
    Start,
    Stop { force: bool },
    Enable,
    Disable { force: bool },
    Restart,
    Remove,
    CreateSnapshot { snapshot: String },
    Rollback { snapshot: String },
}

impl VmAction {
    /// `vm-mgr` subcommand and extra flags, or `None` for actions that go
    /// through `crm resource` instead.
    fn vm_mgr_invocation(&self) -> Option<(&'static str, Vec<String>)> {
        let force = |force: bool| {
            if force {
                vec!["--force".to_string()]
            } else {
                Vec::new()
            }
        };
        match self {
            VmAction::Start => Some(("start", Vec::new())),
            VmAction::Stop { force: f } => Some(("stop", force(*f))),
            VmAction::Enable => Some(("enable", Vec::new())),
            VmAction::Disable { force: f } => Some(("disable", force(*f))),
            VmAction::Remove => Some(("remove", Vec::new())),
            VmAction::CreateSnapshot { snapshot } => {
                Some(("create_snapshot", vec!["--snap_name".to_string(), snapshot.clone()]))
            }
            VmAction::Rollback { snapshot } => {
                Some(("rollback", vec!["--snap_name".to_string(), snapshot.clone()]))
            }
            VmAction::Restart => None,
        }
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmAction::Start => write!(f, "start"),
            VmAction::Stop { force: false } => write!(f, "stop"),
            VmAction::Stop { force: true } => write!(f, "force stop"),
            VmAction::Enable => write!(f, "enable"),
            VmAction::Disable { force: false } => write!(f, "disable"),
            VmAction::Disable { force: true } => write!(f, "force disable"),
            VmAction::Restart => write!(f, "restart"),
            VmAction::Remove => write!(f, "remove"),
            VmAction::CreateSnapshot { snapshot } => write!(f, "snapshot '{}'", snapshot),
            VmAction::Rollback { snapshot } => write!(f, "rollback to '{}'", snapshot),
        }
    }
}

/// Runs [`VmAction`]s and keeps the inventory in step with them.
pub struct VmActions {
    store: Arc<InventoryStore>,
}

impl VmActions {
    pub fn new(store: Arc<InventoryStore>) -> Self {
        Self { store }
    }

    /// Runs the action, then refreshes the inventory. Returns the VM as it
    /// looks afterwards (`None` once it has been removed).
    #[instrument(skip(self, action), fields(action = %action))]
    pub async fn execute(&self, vm_name: &str, action: &VmAction) -> ClusterResult<Option<VirtualMachineRecord>> {
        match action {
            VmAction::CreateSnapshot { snapshot } | VmAction::Rollback { snapshot } => {
                validate_name("snapshot name", snapshot)?;
            }
            _ => {}
        }

        self.store.find_or_refresh(vm_name).await?;
        let source = self.store.resolver().source();

        match action.vm_mgr_invocation() {
            Some((subcommand, args)) => source.vm_mgr(subcommand, vm_name, &args).await?,
            None => source.restart_resource(vm_name).await?,
        }
        info!(vm = vm_name, "{} done", action);

        self.store.refresh().await?;
        Ok(self.store.get(vm_name).await)
    }

    pub async fn list_snapshots(&self, vm_name: &str) -> ClusterResult<Vec<String>> {
        let output = self.store.resolver().source().list_snapshots(vm_name).await?;
        Ok(parser::parse_snapshot_list(&output))
    }

    #[instrument(skip(self, request), fields(vm = %request.name))]
    pub async fn create(&self, request: &VmCreateRequest) -> ClusterResult<Option<VirtualMachineRecord>> {
        validate_name("VM name", &request.name)?;
        if request.image_path.trim().is_empty() || request.xml_path.trim().is_empty() {
            return Err(ClusterError::InvalidArgument(
                "both an image and a domain XML path are required".to_string(),
            ));
        }
        if request.pinned_host.is_some() && request.preferred_host.is_some() {
            return Err(ClusterError::InvalidArgument(
                "a VM is either pinned or preferred on a host, not both".to_string(),
            ));
        }

        self.store.resolver().source().create_vm(request).await?;
        info!(vm = %request.name, "VM created");

        if let Err(e) = self.store.refresh().await {
            warn!(error = %e, "inventory refresh after create failed");
            return Ok(None);
        }
        Ok(self.store.get(&request.name).await)
    }
}

fn validate_name(what: &str, value: &str) -> ClusterResult<()> {
    if value.trim().is_empty() {
        return Err(ClusterError::InvalidArgument(format!("{} must not be empty", what)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ClusterError::InvalidArgument(format!(
            "{} must not contain whitespace: {:?}",
            what, value
        )));
    }
    Ok(())
}
