use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::core::cluster::ClusterSource;
use crate::core::parser;
use crate::core::vm::{
    CurrentNode, DefaultPlacement, IdRegistry, ResourceStatus, VirtualMachineRecord, VmId,
    ERROR_SENTINEL,
};
use crate::errors::{ClusterError, ClusterResult};

/// Turns cluster tool output into [`VirtualMachineRecord`]s.
///
/// Only `list_vm_names` and `online_nodes` fail hard. Per-VM lookups degrade
/// to the `"Error"` sentinel so one broken VM never hides the others.
pub struct InventoryResolver {
    source: Arc<dyn ClusterSource>,
    ids: Mutex<IdRegistry>,
}

impl InventoryResolver {
    pub fn new(source: Arc<dyn ClusterSource>) -> Self {
        Self {
            source,
            ids: Mutex::new(IdRegistry::new()),
        }
    }

    pub fn source(&self) -> &Arc<dyn ClusterSource> {
        &self.source
    }

    pub async fn list_vm_names(&self) -> ClusterResult<Vec<String>> {
        let output = self.source.vm_list().await?;
        parser::parse_vm_list(&output).map_err(|e| ClusterError::parse_failure("vm-mgr list", e))
    }

    pub async fn resolve_current_node(&self, vm: &str) -> CurrentNode {
        let located = match self.source.locate(vm).await {
            Ok(output) => parser::parse_locate(&output)
                .map_err(|e| ClusterError::parse_failure("crm resource locate", e)),
            Err(e) => Err(e),
        };

        match located {
            Ok(Some(node)) => CurrentNode::Node(node),
            Ok(None) => CurrentNode::Unplaced,
            Err(e) => {
                warn!(vm, error = %e, "could not locate VM");
                CurrentNode::Error
            }
        }
    }

    pub async fn resolve_state(&self, vm: &str) -> String {
        match self.resource_status(vm).await {
            Ok(status) => status.role,
            Err(e) => {
                warn!(vm, error = %e, "could not read VM state");
                ERROR_SENTINEL.to_string()
            }
        }
    }

    /// Role and hosting nodes of one VM. Unlike [`Self::resolve_state`] this
    /// reports failures, the migration poller needs to tell them apart.
    pub async fn resource_status(&self, vm: &str) -> ClusterResult<ResourceStatus> {
        let xml = self.source.resource_status(vm).await?;
        parser::parse_resource_status(&xml, vm).map_err(|e| ClusterError::parse_failure("crm_mon", e))
    }

    pub fn resolve_default_placement(&self, config_text: &str) -> HashMap<String, DefaultPlacement> {
        parser::parse_placements(config_text)
    }

    pub async fn online_nodes(&self) -> ClusterResult<Vec<String>> {
        let output = self.source.node_status().await?;
        Ok(parser::parse_online_nodes(&output))
    }

    /// Online nodes the VM could be moved to.
    pub async fn migration_targets(&self, current: &CurrentNode) -> ClusterResult<Vec<String>> {
        let nodes = self.online_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|node| current.node() != Some(node.as_str()))
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn build_inventory(&self) -> ClusterResult<Vec<VirtualMachineRecord>> {
        let names = self.list_vm_names().await?;
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let lookups = names.iter().map(|name| async move {
            tokio::join!(self.resolve_state(name), self.resolve_current_node(name))
        });
        let (resolved, config) = tokio::join!(join_all(lookups), self.source.configuration());

        let placements = match config {
            Ok(text) => self.resolve_default_placement(&text),
            Err(e) => {
                warn!(error = %e, "could not read placement constraints");
                HashMap::new()
            }
        };

        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let records = names
            .into_iter()
            .zip(resolved)
            .map(|(name, (state, current_node))| VirtualMachineRecord {
                id: ids.id_for(&name),
                default_node: placements.get(&name).cloned().unwrap_or_default(),
                state,
                current_node,
                name,
            })
            .collect();

        Ok(records)
    }
}

/// The shared VM list, refreshed only through [`InventoryStore::refresh`].
pub struct InventoryStore {
    resolver: InventoryResolver,
    records: RwLock<Vec<VirtualMachineRecord>>,
    refresh_gate: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    // sequence number handed to each build when it starts
    builds_started: AtomicU64,
    // sequence number of the build behind `records`
    current_build: AtomicU64,
    selected: Mutex<Option<String>>,
}

impl InventoryStore {
    pub fn new(resolver: InventoryResolver) -> Self {
        Self {
            resolver,
            records: RwLock::new(Vec::new()),
            refresh_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            builds_started: AtomicU64::new(0),
            current_build: AtomicU64::new(0),
            selected: Mutex::new(None),
        }
    }

    pub fn resolver(&self) -> &InventoryResolver {
        &self.resolver
    }

    /// Number of completed refreshes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn snapshot(&self) -> Vec<VirtualMachineRecord> {
        self.records.read().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<VirtualMachineRecord> {
        self.records.read().await.iter().find(|vm| vm.name == name).cloned()
    }

    pub async fn get_by_id(&self, id: VmId) -> Option<VirtualMachineRecord> {
        self.records.read().await.iter().find(|vm| vm.id == id).cloned()
    }

    /// Rebuilds the list.
    ///
    /// The result always comes from a build that started after this call was
    /// made. A build already running when the call arrives may have read the
    /// cluster too early, so the caller waits for it and then shares the next
    /// one with everyone else who queued up behind it.
    pub async fn refresh(&self) -> ClusterResult<Vec<VirtualMachineRecord>> {
        let arrived_after = self.builds_started.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;

        if self.current_build.load(Ordering::Acquire) > arrived_after {
            return Ok(self.snapshot().await);
        }

        let build = self.builds_started.fetch_add(1, Ordering::AcqRel) + 1;
        let records = self.resolver.build_inventory().await?;
        *self.records.write().await = records.clone();
        self.current_build.store(build, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);

        info!(vms = records.len(), "inventory refreshed");
        Ok(records)
    }

    /// Looks the VM up in the current snapshot, refreshing once if it is not
    /// there yet.
    pub async fn find_or_refresh(&self, name: &str) -> ClusterResult<VirtualMachineRecord> {
        if let Some(vm) = self.get(name).await {
            return Ok(vm);
        }
        self.refresh().await?;
        self.get(name).await.ok_or_else(|| ClusterError::VmNotFound {
            vm_name: name.to_string(),
        })
    }

    pub async fn select(&self, name: &str) -> ClusterResult<VirtualMachineRecord> {
        let vm = self.get(name).await.ok_or_else(|| ClusterError::VmNotFound {
            vm_name: name.to_string(),
        })?;
        *self.selected.lock().unwrap_or_else(|p| p.into_inner()) = Some(vm.name.clone());
        Ok(vm)
    }

    /// The selected VM as it looks in the latest snapshot. `None` if nothing
    /// is selected or the VM has disappeared.
    pub async fn selected(&self) -> Option<VirtualMachineRecord> {
        let name = self.selected.lock().unwrap_or_else(|p| p.into_inner()).clone()?;
        self.get(&name).await
    }

    pub fn clear_selection(&self) {
        *self.selected.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}
