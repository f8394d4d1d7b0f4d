use super::*;
use crate::sync::registry::DEFAULT_RESOURCES;
use serde_json::json;
use tempfile::tempdir;

fn registry() -> Arc<ResourceRegistry> {
    Arc::new(ResourceRegistry::new(DEFAULT_RESOURCES).unwrap())
}

async fn make_store() -> LocalStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = LocalStore::from_pool(pool, registry());
    store.init().await.unwrap();
    store
}

fn filter(value: Value) -> RecordFilter {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn put_and_get_record() {
    let store = make_store().await;
    let record = json!({ "id": "team-1", "name": "Core", "workspaceId": "W" });

    let id = store.put_record("team", &record).await.unwrap();

    assert_eq!(id, "team-1");
    assert_eq!(store.get_record("team", "team-1").await.unwrap(), Some(record));
    assert_eq!(store.get_record("team", "team-2").await.unwrap(), None);
}

#[tokio::test]
async fn put_overwrites_in_place_and_keeps_order() {
    let store = make_store().await;
    store
        .put_record("label", &json!({ "id": "a", "name": "bug" }))
        .await
        .unwrap();
    store
        .put_record("label", &json!({ "id": "b", "name": "feature" }))
        .await
        .unwrap();
    store
        .put_record("label", &json!({ "id": "a", "name": "defect" }))
        .await
        .unwrap();

    let all = store.get_all("label", None).await.unwrap();
    assert_eq!(
        all,
        vec![
            json!({ "id": "a", "name": "defect" }),
            json!({ "id": "b", "name": "feature" })
        ]
    );
}

#[tokio::test]
async fn numeric_ids_are_stored_as_text() {
    let store = make_store().await;
    let id = store
        .put_record("issue", &json!({ "id": 42, "title": "Crash" }))
        .await
        .unwrap();
    assert_eq!(id, "42");
    assert!(store.get_record("issue", "42").await.unwrap().is_some());
}

#[tokio::test]
async fn records_without_id_are_rejected() {
    let store = make_store().await;
    for record in [json!({ "name": "x" }), json!({ "id": "" }), json!({ "id": null })] {
        let err = store.put_record("team", &record).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingId { .. }));
    }
    assert_eq!(store.count("team").await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_kind_is_rejected() {
    let store = make_store().await;
    let err = store.get_all("milestone", None).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Registry(RegistryError::UnknownResource(_))
    ));
}

#[tokio::test]
async fn get_all_filters_by_workspace() {
    let store = make_store().await;
    for (id, workspace) in [("p1", "W"), ("p2", "V"), ("p3", "W"), ("p4", "X")] {
        store
            .put_record("project", &json!({ "id": id, "workspaceId": workspace }))
            .await
            .unwrap();
    }
    store
        .put_record("project", &json!({ "id": "p5" }))
        .await
        .unwrap();

    let scoped = store
        .get_all("project", Some(&filter(json!({ "workspaceId": "W" }))))
        .await
        .unwrap();
    let ids: Vec<_> = scoped.iter().map(|r| r["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["p1", "p3"]);
}

#[tokio::test]
async fn filter_requires_every_field_to_match() {
    let store = make_store().await;
    store
        .put_record(
            "issue",
            &json!({ "id": "i1", "workspaceId": "W", "parentId": "proj-1" }),
        )
        .await
        .unwrap();
    store
        .put_record(
            "issue",
            &json!({ "id": "i2", "workspaceId": "W", "parentId": "proj-2" }),
        )
        .await
        .unwrap();

    let hits = store
        .get_all(
            "issue",
            Some(&filter(json!({ "workspaceId": "W", "parentId": "proj-2" }))),
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], "i2");
}

#[tokio::test]
async fn repeated_clear_leaves_every_kind_empty() {
    let store = make_store().await;
    for descriptor in DEFAULT_RESOURCES {
        store
            .put_record(descriptor.kind, &json!({ "id": "1" }))
            .await
            .unwrap();
    }

    for descriptor in DEFAULT_RESOURCES {
        store.clear(descriptor.kind).await.unwrap();
        store.clear(descriptor.kind).await.unwrap();
        assert!(store.get_all(descriptor.kind, None).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn delete_record_reports_whether_it_existed() {
    let store = make_store().await;
    store
        .put_record("comment", &json!({ "id": "c1" }))
        .await
        .unwrap();
    assert!(store.delete_record("comment", "c1").await.unwrap());
    assert!(!store.delete_record("comment", "c1").await.unwrap());
}

#[tokio::test]
async fn meta_round_trip_and_absent_key() {
    let store = make_store().await;
    assert_eq!(store.get_meta("bootstrap").await.unwrap(), None);

    store
        .put_meta("bootstrap", &json!({ "lastBootstrap": 1 }))
        .await
        .unwrap();
    store
        .put_meta("bootstrap", &json!({ "lastBootstrap": 2 }))
        .await
        .unwrap();

    assert_eq!(
        store.get_meta("bootstrap").await.unwrap(),
        Some(json!({ "lastBootstrap": 2 }))
    );
}

#[tokio::test]
async fn init_is_idempotent() {
    let store = make_store().await;
    store
        .put_record("team", &json!({ "id": "t" }))
        .await
        .unwrap();
    store.init().await.unwrap();
    assert_eq!(store.count("team").await.unwrap(), 1);
}

#[tokio::test]
async fn rebuild_replaces_all_tables_and_meta() {
    let store = make_store().await;
    store
        .put_record("team", &json!({ "id": "stale" }))
        .await
        .unwrap();
    store
        .put_record("label", &json!({ "id": "stale-label" }))
        .await
        .unwrap();

    let mut records = BTreeMap::new();
    records.insert(
        "team".to_string(),
        vec![json!({ "id": "t1" }), json!({ "id": "t2" })],
    );
    store
        .rebuild(&records, "bootstrap", &json!({ "lastBootstrap": 5 }))
        .await
        .unwrap();

    assert_eq!(store.count("team").await.unwrap(), 2);
    assert_eq!(store.count("label").await.unwrap(), 0);
    assert!(store.get_record("team", "stale").await.unwrap().is_none());
    assert_eq!(
        store.get_meta("bootstrap").await.unwrap(),
        Some(json!({ "lastBootstrap": 5 }))
    );
}

#[tokio::test]
async fn failed_rebuild_leaves_previous_contents() {
    let store = make_store().await;
    store
        .put_record("team", &json!({ "id": "keep" }))
        .await
        .unwrap();
    store
        .put_meta("bootstrap", &json!({ "lastBootstrap": 1 }))
        .await
        .unwrap();

    let mut records = BTreeMap::new();
    records.insert("issue".to_string(), vec![json!({ "id": "i1" })]);
    records.insert("team".to_string(), vec![json!({ "name": "no id" })]);
    let err = store
        .rebuild(&records, "bootstrap", &json!({ "lastBootstrap": 2 }))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::MissingId { .. }));
    assert!(store.get_record("team", "keep").await.unwrap().is_some());
    assert_eq!(store.count("issue").await.unwrap(), 0);
    assert_eq!(
        store.get_meta("bootstrap").await.unwrap(),
        Some(json!({ "lastBootstrap": 1 }))
    );
}

#[tokio::test]
async fn on_disk_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    let store = LocalStore::open(&path, registry()).await.unwrap();
    store
        .put_record("reaction", &json!({ "id": "r1", "emoji": "+1" }))
        .await
        .unwrap();
    store.close().await;

    let reopened = LocalStore::open(&path, registry()).await.unwrap();
    assert_eq!(
        reopened.get_record("reaction", "r1").await.unwrap(),
        Some(json!({ "id": "r1", "emoji": "+1" }))
    );
}
