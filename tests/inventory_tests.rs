// Inventory tests - what the VM list looks like when the cluster misbehaves

mod common;

use anyhow::Result;
use common::{actions_for, store_for, FakeCluster};
use ha_vm_manager::core::{CurrentNode, DefaultPlacement, VmAction, VmId};
use ha_vm_manager::errors::ClusterError;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_records_follow_list_order() -> Result<()> {
    let fake = FakeCluster::new(&["web", "db", "cache"]);
    let store = store_for(&fake);

    let vms = store.refresh().await?;
    let names: Vec<&str> = vms.iter().map(|vm| vm.name.as_str()).collect();
    assert_eq!(names, vec!["web", "db", "cache"]);

    let ids: HashSet<VmId> = vms.iter().map(|vm| vm.id).collect();
    assert_eq!(ids.len(), 3, "ids must be distinct");
    assert!(vms.iter().all(|vm| vm.state == "Started"));
    assert!(vms.iter().all(|vm| vm.current_node == CurrentNode::Node("node1".into())));
    Ok(())
}

#[tokio::test]
async fn test_one_broken_vm_does_not_hide_the_others() {
    let fake = FakeCluster::new(&["vm1", "vm2", "vm3"]);
    fake.fail_locate("vm2");
    fake.hide_status("vm3");
    let store = store_for(&fake);

    let vms = store.refresh().await.unwrap();
    assert_eq!(vms.len(), 3);

    assert_eq!(vms[0].current_node, CurrentNode::Node("node1".into()));
    assert_eq!(vms[0].state, "Started");

    assert_eq!(vms[1].current_node, CurrentNode::Error);
    assert_eq!(vms[1].state, "Started");

    assert_eq!(vms[2].state, "Error");
    assert_eq!(vms[2].current_node, CurrentNode::Node("node1".into()));
}

#[tokio::test]
async fn test_stopped_vm_is_unplaced() {
    let fake = FakeCluster::new(&["vm1"]);
    fake.place("vm1", None);
    fake.set_role("vm1", "Stopped", &[]);
    let store = store_for(&fake);

    let vm = store.refresh().await.unwrap().remove(0);
    assert_eq!(vm.current_node, CurrentNode::Unplaced);
    assert_eq!(vm.current_node.to_string(), "-");
    assert_eq!(vm.state, "Stopped");
}

#[tokio::test]
async fn test_empty_cluster() {
    let fake = FakeCluster::new(&[]);
    let store = store_for(&fake);

    assert!(store.refresh().await.unwrap().is_empty());
    assert_eq!(store.generation(), 1);
}

#[tokio::test]
async fn test_list_failure_keeps_previous_snapshot() {
    let fake = FakeCluster::new(&["vm1", "vm2"]);
    let store = store_for(&fake);
    store.refresh().await.unwrap();

    fake.fail_list(true);
    let err = store.refresh().await.unwrap_err();
    assert!(matches!(err, ClusterError::SourceUnavailable { .. }), "got {:?}", err);

    assert_eq!(store.snapshot().await.len(), 2);
    assert_eq!(store.generation(), 1);
}

#[tokio::test]
async fn test_default_placement_last_match_wins() {
    let fake = FakeCluster::new(&["vm1", "vm2", "vm3"]);
    fake.set_config(
        "location prefer-vm1 vm1 role=Started inf: node1\n\
         location cli-prefer-vm2 vm2 role=Started inf: node3\n\
         location pin-vm1 vm1 role=Started inf: node2\n",
    );
    let store = store_for(&fake);

    let vms = store.refresh().await.unwrap();
    assert_eq!(vms[0].default_node, DefaultPlacement::Pin("node2".into()));
    assert_eq!(vms[0].default_node.to_string(), "pin: node2");
    // operator moves are not defaults
    assert_eq!(vms[1].default_node, DefaultPlacement::None);
    assert_eq!(vms[2].default_node.to_string(), "-");
}

#[tokio::test]
async fn test_config_failure_leaves_placements_unset() {
    let fake = FakeCluster::new(&["vm1", "vm2"]);
    fake.fail_config();
    let store = store_for(&fake);

    let vms = store.refresh().await.unwrap();
    assert!(vms.iter().all(|vm| vm.default_node == DefaultPlacement::None));
    assert!(vms.iter().all(|vm| vm.state == "Started"));
}

#[tokio::test]
async fn test_ids_survive_refresh() {
    let fake = FakeCluster::new(&["vm1", "vm2"]);
    let store = store_for(&fake);
    let before = store.refresh().await.unwrap();

    fake.set_vms(&["vm0", "vm2", "vm1"]);
    let after = store.refresh().await.unwrap();

    assert_eq!(store.get("vm1").await.unwrap().id, before[0].id);
    assert_eq!(store.get("vm2").await.unwrap().id, before[1].id);
    assert!(before.iter().all(|vm| vm.id != after[0].id));
    assert_eq!(store.get_by_id(before[1].id).await.unwrap().name, "vm2");
}

#[tokio::test(start_paused = true)]
async fn test_callers_queued_behind_a_refresh_share_one_rebuild() {
    let fake = FakeCluster::new(&["vm1", "vm2"]);
    fake.delay_list(Duration::from_millis(500));
    let store = store_for(&fake);

    // the first call is already building when the other two arrive, so they
    // wait it out and share a single fresh build
    let (first, second, third) = tokio::join!(store.refresh(), store.refresh(), store.refresh());
    first.unwrap();
    assert_eq!(second.unwrap(), third.unwrap());
    assert_eq!(fake.list_calls(), 2);
    assert_eq!(store.generation(), 2);

    // nothing in flight, so the next call builds on its own
    store.refresh().await.unwrap();
    assert_eq!(fake.list_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_never_returns_a_build_that_started_earlier() {
    let fake = FakeCluster::new(&["vm1"]);
    fake.delay_config(Duration::from_millis(500));
    let store = store_for(&fake);

    let early = tokio::spawn({
        let store = store.clone();
        async move { store.refresh().await }
    });

    // the early build has already located vm1 on node1 by now
    tokio::time::sleep(Duration::from_millis(100)).await;
    fake.place("vm1", Some("node2"));

    let fresh = store.refresh().await.unwrap();
    assert_eq!(fresh[0].current_node, CurrentNode::Node("node2".into()));

    let stale = early.await.unwrap().unwrap();
    assert_eq!(stale[0].current_node, CurrentNode::Node("node1".into()));
    assert_eq!(
        store.get("vm1").await.unwrap().current_node,
        CurrentNode::Node("node2".into())
    );
}

#[tokio::test(start_paused = true)]
async fn test_per_vm_lookups_run_concurrently() -> Result<()> {
    let fake = FakeCluster::new(&["vm1", "vm2", "vm3"]);
    fake.delay_lookups(Duration::from_secs(1));
    let store = store_for(&fake);

    let started = Instant::now();
    let vms = store.resolver().build_inventory().await?;
    assert_eq!(vms.len(), 3);
    // six lookups, each a second long, finish together
    assert_eq!(started.elapsed(), Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn test_selection_follows_snapshots() {
    let fake = FakeCluster::new(&["vm1", "vm2"]);
    let store = store_for(&fake);

    let err = store.select("vm1").await.unwrap_err();
    assert!(matches!(err, ClusterError::VmNotFound { .. }));

    store.refresh().await.unwrap();
    store.select("vm2").await.unwrap();

    fake.set_role("vm2", "Stopped", &[]);
    store.refresh().await.unwrap();
    assert_eq!(store.selected().await.unwrap().state, "Stopped");

    fake.set_vms(&["vm1"]);
    store.refresh().await.unwrap();
    assert!(store.selected().await.is_none());

    store.select("vm1").await.unwrap();
    store.clear_selection();
    assert!(store.selected().await.is_none());
}

#[tokio::test]
async fn test_migration_targets_exclude_current_node() -> Result<()> {
    let fake = FakeCluster::new(&["vm1"]);
    fake.set_online(&["node1", "node2"]);
    let store = store_for(&fake);

    let vm = store.find_or_refresh("vm1").await?;
    let targets = store.resolver().migration_targets(&vm.current_node).await?;
    assert_eq!(targets, vec!["node2"]);

    let all = store.resolver().migration_targets(&CurrentNode::Unplaced).await?;
    assert_eq!(all, vec!["node1", "node2"]);
    Ok(())
}

#[tokio::test]
async fn test_actions_refresh_inventory() {
    let fake = FakeCluster::new(&["vm1", "vm2"]);
    let (store, actions) = actions_for(&fake);

    let vm = actions
        .execute("vm1", &VmAction::Stop { force: true })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(vm.state, "Stopped");
    assert_eq!(vm.current_node, CurrentNode::Unplaced);
    assert_eq!(fake.vm_mgr_calls(), vec![vec!["stop", "vm1", "--force"]]);

    actions.execute("vm2", &VmAction::Restart).await.unwrap();
    assert_eq!(fake.restarts(), vec!["vm2"]);

    assert!(actions.execute("vm2", &VmAction::Remove).await.unwrap().is_none());
    assert_eq!(store.snapshot().await.len(), 1);
}

#[tokio::test]
async fn test_actions_reject_unknown_vm_and_bad_snapshot() {
    let fake = FakeCluster::new(&["vm1"]);
    let (_, actions) = actions_for(&fake);

    let err = actions.execute("ghost", &VmAction::Start).await.unwrap_err();
    assert!(matches!(err, ClusterError::VmNotFound { .. }));

    let err = actions
        .execute("vm1", &VmAction::CreateSnapshot { snapshot: "two words".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidArgument(_)));
    assert!(fake.vm_mgr_calls().is_empty());

    assert_eq!(actions.list_snapshots("vm1").await.unwrap(), vec!["base", "before-upgrade"]);
}
