use serde_json::json;
use v2e_uee::core::store::{Envelope, Namespace, StateStore, checkpoint_key};

fn envelope(value: serde_json::Value) -> Envelope {
    Envelope::new(1, &value).unwrap()
}

#[tokio::test]
async fn test_put_get_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path()).await.unwrap();

    let value = envelope(json!({"state": "running", "permits": 4}));
    store
        .put(Namespace::FsmProvider, "nvd", value.clone())
        .await
        .unwrap();
    assert_eq!(store.get(Namespace::FsmProvider, "nvd"), Some(value));
    assert_eq!(store.get(Namespace::FsmProvider, "mitre"), None);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = StateStore::open(dir.path()).await.unwrap();
        store
            .put(Namespace::FsmMacro, "orchestrator", envelope(json!({"state": "orchestrating"})))
            .await
            .unwrap();
        store
            .put(Namespace::FsmProvider, "nvd", envelope(json!({"seq": 7})))
            .await
            .unwrap();
        store.delete(Namespace::FsmProvider, "nvd").await.unwrap();
    }

    let store = StateStore::open(dir.path()).await.unwrap();
    assert!(store.get(Namespace::FsmMacro, "orchestrator").is_some());
    assert!(store.get(Namespace::FsmProvider, "nvd").is_none());
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path()).await.unwrap();
    store
        .put(Namespace::FsmProvider, "x", envelope(json!(1)))
        .await
        .unwrap();
    assert!(store.get(Namespace::Permits, "x").is_none());
    assert!(store.get(Namespace::Checkpoints, "x").is_none());
}

#[tokio::test]
async fn test_list_by_prefix_is_ordered_and_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path()).await.unwrap();
    for key in ["nvd/b", "nvd/a", "mitre/z", "nvdx"] {
        store
            .put(Namespace::Checkpoints, key, envelope(json!(key)))
            .await
            .unwrap();
    }
    let listed = store.list_by_prefix(Namespace::Checkpoints, "nvd/");
    let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["nvd/a", "nvd/b"]);
}

#[tokio::test]
async fn test_compare_and_swap_guards_current_value() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path()).await.unwrap();

    let first = envelope(json!({"state": "idle"}));
    let second = envelope(json!({"state": "acquiring"}));

    // Creation requires the key to be absent.
    assert!(
        store
            .compare_and_swap(Namespace::FsmProvider, "nvd", None, first.clone())
            .await
            .unwrap()
    );
    assert!(
        !store
            .compare_and_swap(Namespace::FsmProvider, "nvd", None, second.clone())
            .await
            .unwrap()
    );

    // Transition requires the expected current value.
    assert!(
        store
            .compare_and_swap(Namespace::FsmProvider, "nvd", Some(&first), second.clone())
            .await
            .unwrap()
    );
    assert!(
        !store
            .compare_and_swap(Namespace::FsmProvider, "nvd", Some(&first), second.clone())
            .await
            .unwrap()
    );
    assert_eq!(store.get(Namespace::FsmProvider, "nvd"), Some(second));
}

#[tokio::test]
async fn test_latest_checkpoint_picks_highest_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path()).await.unwrap();
    for seq in [1u64, 2, 10, 9] {
        store
            .put(
                Namespace::Checkpoints,
                &checkpoint_key("nvd", seq),
                envelope(json!({ "sequence": seq })),
            )
            .await
            .unwrap();
    }
    // Zero-padded keys keep numeric and lexicographic order aligned.
    let (key, env) = store.latest_checkpoint("nvd").unwrap();
    assert_eq!(key, checkpoint_key("nvd", 10));
    assert_eq!(env.body["sequence"], 10);
    assert!(store.latest_checkpoint("mitre").is_none());
}

#[tokio::test]
async fn test_unknown_envelope_fields_survive_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = StateStore::open(dir.path()).await.unwrap();
        let mut env = envelope(json!({"known": true}));
        env.extra
            .insert("added_by_future_version".to_string(), json!("keep me"));
        store.put(Namespace::FsmMacro, "orchestrator", env).await.unwrap();
    }
    let store = StateStore::open(dir.path()).await.unwrap();
    let env = store.get(Namespace::FsmMacro, "orchestrator").unwrap();
    assert_eq!(env.extra["added_by_future_version"], json!("keep me"));
}

#[tokio::test]
async fn test_torn_tail_is_discarded_on_replay() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = StateStore::open(dir.path()).await.unwrap();
        store
            .put(Namespace::FsmProvider, "good", envelope(json!(1)))
            .await
            .unwrap();
    }

    // Simulate a crash mid-append: garbage with no valid frame.
    let log_path = dir.path().join("state.log");
    let mut contents = std::fs::read(&log_path).unwrap();
    contents.extend_from_slice(b"deadbeef {\"half\": ");
    std::fs::write(&log_path, &contents).unwrap();

    let store = StateStore::open(dir.path()).await.unwrap();
    assert!(store.get(Namespace::FsmProvider, "good").is_some());

    // The tail was truncated, so appending works again after reopen.
    store
        .put(Namespace::FsmProvider, "after", envelope(json!(2)))
        .await
        .unwrap();
    drop(store);
    let store = StateStore::open(dir.path()).await.unwrap();
    assert!(store.get(Namespace::FsmProvider, "after").is_some());
}

#[tokio::test]
async fn test_compaction_preserves_live_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path()).await.unwrap();
    for i in 0..100 {
        store
            .put(Namespace::FsmProvider, "churn", envelope(json!(i)))
            .await
            .unwrap();
    }
    store
        .put(Namespace::FsmProvider, "keep", envelope(json!("kept")))
        .await
        .unwrap();
    store.delete(Namespace::FsmProvider, "churn").await.unwrap();

    store.compact().await.unwrap();
    assert_eq!(store.appended_records(), 1);
    assert!(store.get(Namespace::FsmProvider, "churn").is_none());
    assert_eq!(
        store.get(Namespace::FsmProvider, "keep").unwrap().body,
        json!("kept")
    );

    drop(store);
    let store = StateStore::open(dir.path()).await.unwrap();
    assert!(store.get(Namespace::FsmProvider, "keep").is_some());
    assert!(store.get(Namespace::FsmProvider, "churn").is_none());
}
