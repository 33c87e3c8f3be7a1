//! Integration tests for the state store over a temporary database.

use serde_json::json;

use fabric_core::liveness;
use fabric_core::plan::{OpKind, Operation, Plan};
use fabric_core::state::{ResumePhase, StateStore};
use fabric_db::error::StoreError;
use fabric_db::models::{ApplyStatus, RollbackStatus};
use fabric_db::queries::applies::ApplyUpdate;
use fabric_test_utils::{create_test_db, drop_test_db};

fn boot_plan() -> Plan {
    Plan::new(vec![Operation {
        id: 1,
        kind: OpKind::Boot,
        dependencies: vec![],
        device_id: Some("dev1".into()),
        cpu_id: None,
        request_instance_id: None,
    }])
}

#[tokio::test]
async fn register_assigns_hex_id_and_persists_plan() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.expect("should register");

    assert_eq!(apply_id.len(), 10);
    assert!(apply_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));

    let record = store.get(&apply_id).await.expect("record should exist");
    assert_eq!(record.status, ApplyStatus::InProgress);
    let procedures = record.procedures.expect("plan persisted");
    assert_eq!(procedures.as_array().unwrap().len(), 1);
    assert_eq!(procedures[0]["operationID"], 1);
    assert_eq!(procedures[0]["operation"], "boot");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn register_empty_plan_is_completed_immediately() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&Plan::default()).await.expect("should register");

    let record = store.get(&apply_id).await.unwrap();
    assert_eq!(record.status, ApplyStatus::Completed);
    assert_eq!(record.procedures, Some(json!([])));
    assert_eq!(record.apply_result, Some(json!([])));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn second_register_is_rejected_while_active() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let _first = store.register(&boot_plan()).await.unwrap();
    let err = store.register(&boot_plan()).await.expect_err("must conflict");
    assert!(matches!(err, StoreError::AlreadyRunning));
    assert_eq!(err.code(), "E40010");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn register_is_blocked_by_suspended_apply() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let first = store.register(&boot_plan()).await.unwrap();
    store
        .update(
            &first,
            &ApplyUpdate {
                status: Some(ApplyStatus::Suspended),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = store.register(&boot_plan()).await.expect_err("must be blocked");
    assert!(matches!(err, StoreError::SuspendedExists(ref id) if *id == first));
    assert_eq!(err.code(), "E40027");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn terminal_apply_frees_the_slot() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let first = store.register(&boot_plan()).await.unwrap();
    store
        .update(
            &first,
            &ApplyUpdate {
                status: Some(ApplyStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let second = store.register(&boot_plan()).await.expect("slot must be free");
    assert_ne!(first, second);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_live_apply_moves_to_canceling() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    store
        .record_process(&apply_id, &liveness::current())
        .await
        .unwrap();

    let transition = store.cancel_request(&apply_id, true).await.unwrap();

    assert_eq!(transition.prev_status, ApplyStatus::InProgress);
    assert_eq!(transition.status, ApplyStatus::Canceling);
    assert!(!transition.stale_process);

    let record = store.get(&apply_id).await.unwrap();
    assert_eq!(record.status, ApplyStatus::Canceling);
    assert!(record.execute_rollback);
    assert!(record.canceled_at.is_some());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_without_live_process_fails_the_apply() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    // No process triple recorded: the run cannot be alive.
    let apply_id = store.register(&boot_plan()).await.unwrap();
    let transition = store.cancel_request(&apply_id, false).await.unwrap();

    assert_eq!(transition.status, ApplyStatus::Failed);
    assert!(transition.stale_process);

    let record = store.get(&apply_id).await.unwrap();
    assert_eq!(record.status, ApplyStatus::Failed);
    assert!(!record.execute_rollback);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_is_idempotent_once_canceling() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    store
        .record_process(&apply_id, &liveness::current())
        .await
        .unwrap();

    let first = store.cancel_request(&apply_id, false).await.unwrap();
    assert_eq!(first.status, ApplyStatus::Canceling);

    // A second cancel is a no-op, not an error, and changes nothing.
    let second = store.cancel_request(&apply_id, true).await.unwrap();
    assert_eq!(second.prev_status, ApplyStatus::Canceling);
    assert_eq!(second.status, ApplyStatus::Canceling);

    let record = store.get(&apply_id).await.unwrap();
    assert!(!record.execute_rollback, "no-op must not set the flag");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_of_terminal_apply_is_already_executed() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    store
        .update(
            &apply_id,
            &ApplyUpdate {
                status: Some(ApplyStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = store
        .cancel_request(&apply_id, false)
        .await
        .expect_err("terminal apply cannot be canceled");
    assert!(matches!(err, StoreError::AlreadyExecuted(_)));
    assert_eq!(err.code(), "E40022");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_of_suspended_apply_abandons_it() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    store
        .update(
            &apply_id,
            &ApplyUpdate {
                status: Some(ApplyStatus::Suspended),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let transition = store.cancel_request(&apply_id, false).await.unwrap();
    assert_eq!(transition.status, ApplyStatus::Failed);

    let record = store.get(&apply_id).await.unwrap();
    assert_eq!(record.status, ApplyStatus::Failed);
    assert!(record.canceled_at.is_some());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_of_suspended_rollback_fails_rollback() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    store
        .update(
            &apply_id,
            &ApplyUpdate {
                status: Some(ApplyStatus::Canceled),
                rollback_status: Some(RollbackStatus::Suspended),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let transition = store.cancel_request(&apply_id, false).await.unwrap();
    assert_eq!(transition.status, ApplyStatus::Canceled);
    assert_eq!(transition.rollback_status, Some(RollbackStatus::Failed));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_unknown_id_is_not_found() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let err = store
        .cancel_request("ffffffffff", false)
        .await
        .expect_err("unknown id");
    assert!(matches!(err, StoreError::NotFound(_)));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn resume_request_reactivates_suspended_apply() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    let residual = json!([{
        "operationID": 1,
        "operation": "boot",
        "dependencies": [],
        "targetDeviceID": "dev1",
    }]);
    store
        .update(
            &apply_id,
            &ApplyUpdate {
                status: Some(ApplyStatus::Suspended),
                resume_procedures: Some(residual.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let transition = store.resume_request(&apply_id).await.unwrap();
    assert_eq!(transition.phase, ResumePhase::Apply);
    assert_eq!(transition.record.resume_procedures, Some(residual));

    let record = store.get(&apply_id).await.unwrap();
    assert_eq!(record.status, ApplyStatus::InProgress);
    assert!(record.resumed_at.is_some());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn resume_request_reactivates_suspended_rollback() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    store
        .update(
            &apply_id,
            &ApplyUpdate {
                status: Some(ApplyStatus::Canceled),
                rollback_status: Some(RollbackStatus::Suspended),
                resume_procedures: Some(json!([])),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let transition = store.resume_request(&apply_id).await.unwrap();
    assert_eq!(transition.phase, ResumePhase::Rollback);

    let record = store.get(&apply_id).await.unwrap();
    assert_eq!(record.rollback_status, Some(RollbackStatus::InProgress));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn resume_request_on_active_apply_is_rejected() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    let err = store
        .resume_request(&apply_id)
        .await
        .expect_err("nothing to resume");
    assert!(matches!(err, StoreError::AlreadyExecuted(_)));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn delete_refuses_non_terminal_applies() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    let err = store.delete(&apply_id).await.expect_err("still in progress");
    assert!(matches!(err, StoreError::DeleteConflict(_)));
    assert_eq!(err.code(), "E40024");

    store
        .update(
            &apply_id,
            &ApplyUpdate {
                status: Some(ApplyStatus::Suspended),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = store.delete(&apply_id).await.expect_err("suspended is not terminal");
    assert!(matches!(err, StoreError::DeleteConflict(_)));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn delete_removes_terminal_apply() {
    let (pool, db_name) = create_test_db().await;
    let store = StateStore::new(pool);

    let apply_id = store.register(&boot_plan()).await.unwrap();
    store
        .update(
            &apply_id,
            &ApplyUpdate {
                status: Some(ApplyStatus::Canceled),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store.delete(&apply_id).await.expect("delete should succeed");

    let err = store.get(&apply_id).await.expect_err("record is gone");
    assert!(matches!(err, StoreError::NotFound(_)));
    assert_eq!(err.code(), "E40020");

    drop_test_db(&db_name).await;
}
