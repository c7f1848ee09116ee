// Shared fixture: an in-memory Pacemaker cluster that answers like the real
// tools do and remembers every call made against it.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ha_vm_manager::config::MigrationSettings;
use ha_vm_manager::core::{
    ClusterSource, InventoryResolver, InventoryStore, MigrationCoordinator, SettlementPolicy,
    VmActions, VmCreateRequest,
};
use ha_vm_manager::errors::{ClusterError, ClusterResult};

/// What one `crm_mon` call reports for a VM.
#[derive(Debug, Clone)]
pub enum Poll {
    Role(&'static str, &'static [&'static str]),
    Fail,
}

#[derive(Default)]
struct FakeState {
    vms: Vec<String>,
    list_fails: bool,
    list_delay: Option<Duration>,
    // None: "is NOT running", Err: locate fails
    locations: HashMap<String, Result<Option<String>, ()>>,
    roles: HashMap<String, (String, Vec<String>)>,
    scripts: HashMap<String, VecDeque<Poll>>,
    // None: `crm configure show` fails
    config: Option<String>,
    config_delay: Option<Duration>,
    lookup_delay: Option<Duration>,
    status_panics: bool,
    online: Vec<String>,
    move_fails: bool,
    list_calls: usize,
    status_calls: HashMap<String, usize>,
    moves: Vec<(String, String)>,
    vm_mgr_calls: Vec<Vec<String>>,
    restarts: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    /// Every VM starts out `Started` on node1, with node1..node3 online.
    pub fn new(vms: &[&str]) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.lock();
            state.config = Some(String::new());
            state.online = vec!["node1".into(), "node2".into(), "node3".into()];
            for vm in vms {
                state.vms.push(vm.to_string());
                state.locations.insert(vm.to_string(), Ok(Some("node1".into())));
                state
                    .roles
                    .insert(vm.to_string(), ("Started".into(), vec!["node1".into()]));
            }
        }
        fake
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_vms(&self, vms: &[&str]) {
        self.lock().vms = vms.iter().map(|vm| vm.to_string()).collect();
    }

    pub fn fail_list(&self, fails: bool) {
        self.lock().list_fails = fails;
    }

    pub fn delay_list(&self, delay: Duration) {
        self.lock().list_delay = Some(delay);
    }

    pub fn place(&self, vm: &str, node: Option<&str>) {
        self.lock()
            .locations
            .insert(vm.to_string(), Ok(node.map(str::to_string)));
    }

    pub fn fail_locate(&self, vm: &str) {
        self.lock().locations.insert(vm.to_string(), Err(()));
    }

    pub fn set_role(&self, vm: &str, role: &str, nodes: &[&str]) {
        self.lock().roles.insert(
            vm.to_string(),
            (role.to_string(), nodes.iter().map(|n| n.to_string()).collect()),
        );
    }

    /// Drops the VM from `crm_mon` output altogether.
    pub fn hide_status(&self, vm: &str) {
        self.lock().roles.remove(vm);
    }

    /// Answers for the next `crm_mon` calls, consumed in order. Once the
    /// script runs out the VM's regular role is reported again.
    pub fn script_status(&self, vm: &str, polls: Vec<Poll>) {
        self.lock().scripts.insert(vm.to_string(), polls.into());
    }

    pub fn set_config(&self, text: &str) {
        self.lock().config = Some(text.to_string());
    }

    pub fn fail_config(&self) {
        self.lock().config = None;
    }

    pub fn delay_config(&self, delay: Duration) {
        self.lock().config_delay = Some(delay);
    }

    /// Every `locate` and `crm_mon` call takes this long.
    pub fn delay_lookups(&self, delay: Duration) {
        self.lock().lookup_delay = Some(delay);
    }

    /// Makes `crm_mon` calls panic, standing in for a bug in the poller.
    pub fn panic_on_status(&self, panics: bool) {
        self.lock().status_panics = panics;
    }

    pub fn set_online(&self, nodes: &[&str]) {
        self.lock().online = nodes.iter().map(|n| n.to_string()).collect();
    }

    pub fn fail_move(&self, fails: bool) {
        self.lock().move_fails = fails;
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn status_calls(&self, vm: &str) -> usize {
        self.lock().status_calls.get(vm).copied().unwrap_or(0)
    }

    pub fn moves(&self) -> Vec<(String, String)> {
        self.lock().moves.clone()
    }

    pub fn vm_mgr_calls(&self) -> Vec<Vec<String>> {
        self.lock().vm_mgr_calls.clone()
    }

    pub fn restarts(&self) -> Vec<String> {
        self.lock().restarts.clone()
    }
}

fn unavailable(source: &str) -> ClusterError {
    ClusterError::source_unavailable(source, "connection refused")
}

fn crm_mon_xml(vm: &str, role: &str, nodes: &[String]) -> String {
    let children: String = nodes
        .iter()
        .map(|node| format!("      <node name=\"{}\" id=\"1\" cached=\"true\"/>\n", node))
        .collect();
    format!(
        "<pacemaker-result api-version=\"2.30\">\n  <resources>\n    \
         <resource id=\"{vm}\" role=\"{role}\" active=\"{active}\" failed=\"false\" nodes_running_on=\"{count}\">\n\
         {children}    </resource>\n  </resources>\n</pacemaker-result>\n",
        vm = vm,
        role = role,
        active = role == "Started",
        count = nodes.len(),
        children = children,
    )
}

#[async_trait]
impl ClusterSource for FakeCluster {
    async fn vm_list(&self) -> ClusterResult<String> {
        let delay = {
            let mut state = self.lock();
            state.list_calls += 1;
            state.list_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if state.list_fails {
            return Err(unavailable("vm-mgr list"));
        }
        Ok(state.vms.iter().map(|vm| format!("{}\n", vm)).collect())
    }

    async fn locate(&self, vm: &str) -> ClusterResult<String> {
        let delay = self.lock().lookup_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.lock().locations.get(vm) {
            Some(Ok(Some(node))) => Ok(format!("resource {} is running on: {}\n", vm, node)),
            Some(Ok(None)) | None => Ok(format!("resource {} is NOT running\n", vm)),
            Some(Err(())) => Err(unavailable("crm resource locate")),
        }
    }

    async fn resource_status(&self, vm: &str) -> ClusterResult<String> {
        let (delay, panics) = {
            let state = self.lock();
            (state.lookup_delay, state.status_panics)
        };
        if panics {
            panic!("crm_mon exploded for {}", vm);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        *state.status_calls.entry(vm.to_string()).or_insert(0) += 1;

        let scripted = state.scripts.get_mut(vm).and_then(VecDeque::pop_front);
        match scripted {
            Some(Poll::Fail) => Err(unavailable("crm_mon")),
            Some(Poll::Role(role, nodes)) => {
                let nodes: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
                Ok(crm_mon_xml(vm, role, &nodes))
            }
            None => match state.roles.get(vm) {
                Some((role, nodes)) => Ok(crm_mon_xml(vm, role, nodes)),
                None => Ok("<pacemaker-result><resources/></pacemaker-result>\n".to_string()),
            },
        }
    }

    async fn configuration(&self) -> ClusterResult<String> {
        let delay = self.lock().config_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.lock()
            .config
            .clone()
            .ok_or_else(|| unavailable("crm configure show"))
    }

    async fn node_status(&self) -> ClusterResult<String> {
        let online = self.lock().online.join(" ");
        Ok(format!("Node List:\n  * Online: [ {} ]\n", online))
    }

    async fn move_resource(&self, vm: &str, node: &str) -> ClusterResult<()> {
        let mut state = self.lock();
        state.moves.push((vm.to_string(), node.to_string()));
        if state.move_fails {
            return Err(ClusterError::CommandFailed {
                command: format!("crm resource move {} {}", vm, node),
                code: Some(1),
                stderr: "resource is not running".to_string(),
            });
        }
        state
            .locations
            .insert(vm.to_string(), Ok(Some(node.to_string())));
        Ok(())
    }

    async fn restart_resource(&self, vm: &str) -> ClusterResult<()> {
        self.lock().restarts.push(vm.to_string());
        Ok(())
    }

    async fn vm_mgr(&self, action: &str, vm: &str, args: &[String]) -> ClusterResult<()> {
        let mut state = self.lock();
        let mut call = vec![action.to_string(), vm.to_string()];
        call.extend(args.iter().cloned());
        state.vm_mgr_calls.push(call);

        match action {
            "stop" => {
                state.roles.insert(vm.to_string(), ("Stopped".into(), Vec::new()));
                state.locations.insert(vm.to_string(), Ok(None));
            }
            "remove" => state.vms.retain(|name| name != vm),
            _ => {}
        }
        Ok(())
    }

    async fn list_snapshots(&self, _vm: &str) -> ClusterResult<String> {
        Ok("['base', 'before-upgrade']\n".to_string())
    }

    async fn create_vm(&self, request: &VmCreateRequest) -> ClusterResult<()> {
        let mut state = self.lock();
        state.vms.push(request.name.clone());
        state
            .roles
            .insert(request.name.clone(), ("Stopped".into(), Vec::new()));
        Ok(())
    }
}

pub fn store_for(fake: &FakeCluster) -> Arc<InventoryStore> {
    Arc::new(InventoryStore::new(InventoryResolver::new(Arc::new(fake.clone()))))
}

pub fn migration_settings(max_attempts: u32) -> MigrationSettings {
    MigrationSettings {
        poll_interval_ms: 1000,
        max_attempts,
        settlement_policy: SettlementPolicy::RoleStarted,
    }
}

pub fn coordinator_for(fake: &FakeCluster, max_attempts: u32) -> (Arc<InventoryStore>, MigrationCoordinator) {
    coordinator_with(fake, migration_settings(max_attempts))
}

pub fn coordinator_with(fake: &FakeCluster, settings: MigrationSettings) -> (Arc<InventoryStore>, MigrationCoordinator) {
    let store = store_for(fake);
    let coordinator = MigrationCoordinator::new(store.clone(), settings);
    (store, coordinator)
}

pub fn actions_for(fake: &FakeCluster) -> (Arc<InventoryStore>, VmActions) {
    let store = store_for(fake);
    (store.clone(), VmActions::new(store))
}
