use bloom_tracker::auth::{AuthUser, StaticAuth};
use bloom_tracker::export::{export_filename, EXPORT_COLUMNS};
use bloom_tracker::import::{parse_csv, parse_csv_file, ImportOutcome};
use bloom_tracker::prelude::*;
use chrono::Local;
use std::collections::BTreeSet;
use std::sync::Arc;

fn bloom_with(memory: Arc<MemoryStore>) -> Bloom {
    let auth = StaticAuth::signed_in(AuthUser {
        id: "crew-1".into(),
        email: None,
    });
    Bloom::new(
        memory,
        Arc::new(auth),
        BloomOptions::default().with_product_name("bloom"),
    )
}

const SHEET: &str = "Job Name,Site Address,Owner\n\
Johnson Residence,12 Pine Rd,Ann Johnson\n\
 ,nowhere,\n\
Lee Commercial,9 Oak Ave,\n\
Park Board,,Parks Dept\n";

#[tokio::test]
async fn import_maps_loose_headers_and_skips_blank_names() {
    let memory = Arc::new(MemoryStore::new());
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();

    let report = workspace.import_csv(SHEET.as_bytes()).await.unwrap();
    assert_eq!((report.success, report.failed), (3, 0));
    assert!(report.is_complete());

    let clients = workspace.client_list().await.unwrap();
    let lee = clients.iter().find(|c| c.client.name == "Lee Commercial").unwrap();
    assert_eq!(lee.client.address, "9 Oak Ave");
    assert_eq!(lee.client.contact_name.as_deref(), Some(""));
}

#[tokio::test]
async fn partial_failure_is_reported_in_input_order() {
    let memory = Arc::new(MemoryStore::new());
    memory.reject_inserts_where(Collection::Clients, Filter::eq("name", "Lee Commercial"));
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();

    let report = workspace.import_csv(SHEET.as_bytes()).await.unwrap();
    assert_eq!((report.success, report.failed), (2, 1));
    assert!(!report.is_complete());

    let order: Vec<bool> = report
        .outcomes
        .iter()
        .map(|outcome| matches!(outcome, ImportOutcome::Imported(_)))
        .collect();
    assert_eq!(order, [true, false, true]);
    match &report.outcomes[1] {
        ImportOutcome::Failed { name, .. } => assert_eq!(name, "Lee Commercial"),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(memory.rows(Collection::Clients).len(), 2);
}

#[tokio::test]
async fn unmappable_file_inserts_nothing() {
    let memory = Arc::new(MemoryStore::new());
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();

    let err = workspace
        .import_csv("Foo,Bar\n1,2\n".as_bytes())
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(memory.rows(Collection::Clients).is_empty());
}

#[tokio::test]
async fn export_then_import_round_trips_client_names() {
    let memory = Arc::new(MemoryStore::new());
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();

    let johnson = workspace.add_client("Johnson", "12 Pine Rd", "Ann").await.unwrap();
    workspace.add_client("Lee", "9 Oak Ave", "").await.unwrap();
    workspace
        .add_material_log(
            &johnson.id,
            &[
                SelectedMaterial::new("Mulch", 2.0, "yards"),
                SelectedMaterial::new("Topsoil", 1.5, "yards"),
            ],
            Some("front beds"),
        )
        .await
        .unwrap();

    let data = workspace.export_data().await.unwrap();
    let summary = data.summary();
    assert_eq!((summary.clients, summary.logs, summary.items), (2, 1, 2));

    let dir = tempfile::tempdir().unwrap();
    let path = workspace.write_export(dir.path()).await.unwrap();
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        export_filename("bloom", Local::now().date_naive())
    );

    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next().unwrap(), EXPORT_COLUMNS.join(","));
    // Two item rows for Johnson, one blank row for Lee.
    assert_eq!(lines.count(), 3);

    let parsed = parse_csv_file(&path).unwrap();
    let exported: BTreeSet<_> = parsed.iter().map(|c| c.name.clone()).collect();
    let expected: BTreeSet<_> = ["Johnson".to_string(), "Lee".to_string()].into();
    assert_eq!(exported, expected);

    let johnson_row = parsed.iter().find(|c| c.name == "Johnson").unwrap();
    assert_eq!(johnson_row.address, "12 Pine Rd");
    assert_eq!(johnson_row.contact_name, "Ann");

    // Importing the export into a fresh store recreates every client.
    let fresh = Arc::new(MemoryStore::new());
    let second = bloom_with(fresh.clone());
    let report = second
        .workspace()
        .unwrap()
        .import_clients(&parse_csv(text.as_bytes()).unwrap())
        .await
        .unwrap();
    assert_eq!(report.failed, 0);
    let names: BTreeSet<_> = fresh
        .rows(Collection::Clients)
        .iter()
        .filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn item_counts_are_conserved_across_clients() {
    let memory = Arc::new(MemoryStore::new());
    let bloom = bloom_with(memory.clone());
    let workspace = bloom.workspace().unwrap();

    let mut expected_total = 0;
    for (name, batches) in [("A", vec![2, 1]), ("B", vec![]), ("C", vec![4])] {
        let client = workspace.add_client(name, "somewhere", "").await.unwrap();
        for size in batches {
            let items: Vec<_> = (0..size)
                .map(|i| SelectedMaterial::new(&format!("m{}", i), 1.0, "bags"))
                .collect();
            workspace
                .add_material_log(&client.id, &items, None)
                .await
                .unwrap();
            expected_total += size;
        }
    }

    let list = workspace.client_list().await.unwrap();
    let total: usize = list.iter().map(|c| c.total_items).sum();
    assert_eq!(total, expected_total);

    let b = list.iter().find(|c| c.client.name == "B").unwrap();
    assert_eq!((b.total_logs, b.total_items), (0, 0));
    assert!(b.recent_materials.is_empty());

    assert_eq!(workspace.client_list().await.unwrap(), list);
}
