use bloom_tracker::auth::{AuthUser, StaticAuth};
use bloom_tracker::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn row(value: serde_json::Value) -> bloom_tracker::store::Row {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Default::default(),
    }
}

fn bloom_with(memory: Arc<MemoryStore>) -> Bloom {
    let auth = StaticAuth::signed_in(AuthUser {
        id: "crew-1".into(),
        email: Some("crew@example.com".into()),
    });
    Bloom::new(memory, Arc::new(auth), BloomOptions::default())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn signed_out_means_no_workspace() {
    let bloom = Bloom::new(
        Arc::new(MemoryStore::new()),
        Arc::new(StaticAuth::signed_out()),
        BloomOptions::default(),
    );
    assert!(bloom.workspace().is_none());
}

#[tokio::test]
async fn detail_view_refetches_once_per_item_and_stops_after_unmount() {
    let memory = Arc::new(MemoryStore::new());
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();

    let client = workspace.add_client("Johnson", "12 Pine", "").await.unwrap();
    let (log, _) = workspace
        .add_material_log(&client.id, &[SelectedMaterial::new("Mulch", 2.0, "yards")], None)
        .await
        .unwrap();

    let mut view = workspace.mount_client_detail(&client.id).await.unwrap();
    assert_eq!(view.data().unwrap().total_items(), 1);
    assert_eq!(view.refresh_count(), 0);

    memory
        .insert(
            Collection::MaterialItems,
            row(json!({"log_id": log.id, "name": "Edging", "quantity": 10, "unit": "feet"})),
        )
        .await
        .unwrap();

    let snapshot = view.changed().await.unwrap();
    let detail = snapshot.data.unwrap();
    let names: Vec<_> = detail.logs[0]
        .material_items
        .iter()
        .map(|item| item.name.as_str())
        .collect();
    assert_eq!(names, ["Mulch", "Edging"]);
    settle().await;
    assert_eq!(view.refresh_count(), 1);

    let watcher = view.watch();
    let revision = watcher.borrow().revision;
    view.unmount().await.unwrap();
    assert_eq!(memory.subscriber_count(), 0);

    memory
        .insert(
            Collection::MaterialItems,
            row(json!({"log_id": log.id, "name": "Sod", "quantity": 1, "unit": "pallets"})),
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(watcher.borrow().revision, revision);
}

#[tokio::test]
async fn detail_view_ignores_other_clients_logs() {
    let memory = Arc::new(MemoryStore::new());
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();

    let ours = workspace.add_client("Johnson", "12 Pine", "").await.unwrap();
    let theirs = workspace.add_client("Lee", "9 Oak", "").await.unwrap();

    let view = workspace.mount_client_detail(&ours.id).await.unwrap();
    let before = memory.select_calls(Collection::MaterialLogs);

    memory
        .insert(Collection::MaterialLogs, row(json!({"client_id": theirs.id})))
        .await
        .unwrap();
    settle().await;

    assert_eq!(view.refresh_count(), 0);
    assert_eq!(memory.select_calls(Collection::MaterialLogs), before);
    view.unmount().await.unwrap();
}

#[tokio::test]
async fn burst_of_changes_during_a_fetch_costs_one_follow_up() {
    let memory = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(40)));
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();

    let mut view = workspace.mount_quick_select().await.unwrap();
    for name in ["Mulch", "Sod", "Pea Gravel", "Topsoil"] {
        memory
            .insert(
                Collection::QuickSelectMaterials,
                row(json!({"name": name, "unit": "yards"})),
            )
            .await
            .unwrap();
    }

    // Wait until a published snapshot contains all four.
    loop {
        let snapshot = view.changed().await.unwrap();
        if snapshot.data.map_or(0, |d| d.len()) == 4 {
            break;
        }
    }
    assert!(view.refresh_count() <= 2);
    view.unmount().await.unwrap();
}

#[tokio::test]
async fn list_view_tracks_stats() {
    let memory = Arc::new(MemoryStore::new());
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();

    let a = workspace.add_client("Johnson", "12 Pine", "Ann").await.unwrap();
    workspace.add_client("Lee", "9 Oak", "").await.unwrap();

    let mut view = workspace.mount_client_list().await.unwrap();
    let initial = view.data().unwrap();
    assert_eq!(initial.len(), 2);
    assert!(initial.iter().all(|c| c.total_logs == 0 && c.total_items == 0));

    workspace
        .add_material_log(
            &a.id,
            &[
                SelectedMaterial::new("Mulch", 2.0, "yards"),
                SelectedMaterial::new("Edging", 10.0, "feet"),
                SelectedMaterial::new("Sod", 1.0, "pallets"),
            ],
            Some("front beds"),
        )
        .await
        .unwrap();

    let stats = loop {
        let snapshot = view.changed().await.unwrap();
        let list = snapshot.data.unwrap_or_default();
        if let Some(entry) = list.iter().find(|c| c.client.id == a.id) {
            if entry.total_items == 3 {
                break entry.clone();
            }
        }
    };
    assert_eq!(stats.total_logs, 1);
    assert_eq!(stats.recent_materials, ["Mulch", "Edging"]);

    view.unmount().await.unwrap();
    assert_eq!(memory.subscriber_count(), 0);
    bloom.shutdown().await.unwrap();
}

#[tokio::test]
async fn workspace_stops_working_after_sign_out() {
    let memory = Arc::new(MemoryStore::new());
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();
    workspace.add_client("Johnson", "12 Pine", "").await.unwrap();

    let mut view = workspace.mount_client_list().await.unwrap();
    assert_eq!(view.data().unwrap().len(), 1);

    bloom.sign_out().await.unwrap();
    assert!(bloom.workspace().is_none());

    let err = workspace.client_list().await.unwrap_err();
    assert!(err.is_auth());
    assert!(workspace.add_client("Lee", "9 Oak", "").await.unwrap_err().is_auth());
    assert!(workspace.mount_quick_select().await.unwrap_err().is_auth());
    assert_eq!(memory.rows(Collection::Clients).len(), 1);

    // A change after sign-out clears what the mounted view shows.
    memory
        .insert(Collection::Clients, row(json!({"name": "Park Board", "address": "1 Elm"})))
        .await
        .unwrap();
    let snapshot = view.changed().await.unwrap();
    assert!(snapshot.data.is_none());
    assert!(snapshot.error.is_some());

    view.unmount().await.unwrap();
}
