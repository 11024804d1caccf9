//! Behaviour every storage backend must share

use futures::future::join_all;
use std::sync::Arc;
use stasis_core::{
    CasOutcome, GranularOperation, Revision, SessionData, SessionId, SessionValue, StasisError,
    StorageBackend, StorageConfig, StorageKind,
};
use stasis_storage::MemoryBackend;
use tokio_test::assert_ok;

fn sid(s: &str) -> SessionId {
    SessionId::new(s).unwrap()
}

fn with_mugs(mugs: i64) -> SessionData {
    let mut data = SessionData::new();
    data.set("cart.mug", SessionValue::Int(mugs)).unwrap();
    data
}

async fn check_revisions_strictly_increase(backend: Arc<dyn StorageBackend>) {
    let id = sid("revisions");
    let mut expected = None;
    for n in 0..5 {
        let outcome = assert_ok!(backend.compare_and_swap(&id, expected, &with_mugs(n)).await);
        let CasOutcome::Committed(revision) = outcome else {
            panic!("write {n} should land");
        };
        assert_eq!(revision, Revision(n as u64));
        expected = Some(revision);
    }

    let stored = backend.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.revision, Revision(4));
    assert_eq!(stored.data, with_mugs(4));
}

async fn check_only_one_conflicting_write_lands(backend: Arc<dyn StorageBackend>) {
    let id = sid("race");
    backend.compare_and_swap(&id, None, &with_mugs(0)).await.unwrap();

    let writes = (1..=8).map(|n| {
        let backend = Arc::clone(&backend);
        let id = id.clone();
        tokio::spawn(async move {
            backend
                .compare_and_swap(&id, Some(Revision(0)), &with_mugs(n))
                .await
                .unwrap()
        })
    });
    let outcomes: Vec<CasOutcome> = join_all(writes)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let committed = outcomes
        .iter()
        .filter(|o| matches!(o, CasOutcome::Committed(_)))
        .count();
    assert_eq!(committed, 1);
    assert_eq!(
        backend.load(&id).await.unwrap().unwrap().revision,
        Revision(1)
    );
}

async fn check_concurrent_increments_all_land(backend: Arc<dyn StorageBackend>) {
    let id = sid("counter");
    backend
        .compare_and_swap(&id, None, &SessionData::new())
        .await
        .unwrap();

    let applies = (0..10).map(|_| {
        let backend = Arc::clone(&backend);
        let id = id.clone();
        tokio::spawn(async move {
            backend
                .apply_atomic_op(&id, &GranularOperation::increment("cart.mug", 1))
                .await
        })
    });
    for joined in join_all(applies).await {
        assert_ok!(joined.unwrap());
    }

    let stored = backend.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.data.get("cart.mug"), Some(&SessionValue::Int(10)));
    assert_eq!(stored.revision, Revision(10));
}

async fn check_missing_and_invalid(backend: Arc<dyn StorageBackend>) {
    let err = backend
        .apply_atomic_op(&sid("ghost"), &GranularOperation::increment("n", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StasisError::NotFound { .. }));

    let id = sid("typed");
    backend.compare_and_swap(&id, None, &with_mugs(3)).await.unwrap();
    let err = backend
        .apply_atomic_op(&id, &GranularOperation::add_to_set("cart.mug", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StasisError::InvalidOperation { .. }));

    let stored = backend.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.revision, Revision(0));
    assert_eq!(stored.data, with_mugs(3));

    backend.delete(&id).await.unwrap();
    backend.delete(&id).await.unwrap();
    assert!(backend.load(&id).await.unwrap().is_none());
}

async fn check_recreate_continues_revisions(backend: Arc<dyn StorageBackend>) {
    let id = sid("reborn");
    backend.compare_and_swap(&id, None, &with_mugs(1)).await.unwrap();
    backend
        .compare_and_swap(&id, Some(Revision(0)), &with_mugs(2))
        .await
        .unwrap();
    backend.delete(&id).await.unwrap();

    let outcome = backend
        .compare_and_swap(&id, Some(Revision(1)), &with_mugs(9))
        .await
        .unwrap();
    assert_eq!(outcome, CasOutcome::Conflict { current: None });
    assert!(backend.load(&id).await.unwrap().is_none());

    let outcome = backend.compare_and_swap(&id, None, &with_mugs(3)).await.unwrap();
    assert_eq!(outcome, CasOutcome::Committed(Revision(2)));

    // A writer still holding a pre-delete revision cannot land on the new session
    for stale in [Revision(0), Revision(1)] {
        let outcome = backend
            .compare_and_swap(&id, Some(stale), &with_mugs(9))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CasOutcome::Conflict {
                current: Some(Revision(2))
            }
        );
    }

    let applied = assert_ok!(
        backend
            .apply_atomic_op(&id, &GranularOperation::increment("cart.mug", 1))
            .await
    );
    assert_eq!(applied.revision, Revision(3));
    assert_eq!(
        backend.load(&id).await.unwrap().unwrap().data,
        with_mugs(4)
    );
}

async fn run_contract(backend: Arc<dyn StorageBackend>) {
    assert_ok!(backend.health_check().await);
    check_revisions_strictly_increase(Arc::clone(&backend)).await;
    check_only_one_conflicting_write_lands(Arc::clone(&backend)).await;
    check_concurrent_increments_all_land(Arc::clone(&backend)).await;
    check_missing_and_invalid(Arc::clone(&backend)).await;
    check_recreate_continues_revisions(backend).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_backend_contract() {
    run_contract(Arc::new(MemoryBackend::new())).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_backend_contract() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("sessions.db").display()
    );

    let backend = stasis_storage::SqliteBackend::from_url(&url, 4).await.unwrap();
    backend.migrate().await.unwrap();
    run_contract(Arc::new(backend)).await;
}

#[tokio::test]
async fn test_connect_builds_configured_backend() {
    let config = StorageConfig {
        backend: StorageKind::Memory,
        ..StorageConfig::default()
    };
    let backend = stasis_storage::connect(&config).await.unwrap();
    assert_eq!(backend.name(), "memory");
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        backend: StorageKind::Sqlite,
        connection: format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("persist.db").display()
        ),
        max_connections: 2,
        auto_migrate: true,
    };
    let id = sid("durable");

    {
        let backend = stasis_storage::connect(&config).await.unwrap();
        assert_eq!(backend.name(), "sqlite");
        backend.compare_and_swap(&id, None, &with_mugs(7)).await.unwrap();
    }

    let backend = stasis_storage::connect(&config).await.unwrap();
    let stored = backend.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.data, with_mugs(7));
    assert_eq!(stored.revision, Revision(0));
}
