// Entity store tests

use serde_json::json;
use taskloom::db::meta::{Milestone, StreamMeta};
use taskloom::db::repositories::handoff::{HandoffRepository, NewHandoff};
use taskloom::db::repositories::initiative::InitiativeRepository;
use taskloom::db::repositories::prd::PrdRepository;
use taskloom::db::repositories::task::{NewTask, TaskFilter, TaskPatch, TaskStatus};
use taskloom::db::repositories::work_product::{WorkProductKind, WorkProductRepository};
use taskloom::db::schema::SCHEMA_VERSION;
use taskloom::db::{Database, TaskRepository};
use taskloom::error::StoreError;
use tempfile::TempDir;

fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(db_path).unwrap();
    (db, temp_dir)
}

#[tokio::test]
async fn test_database_initialization() {
    let (db, _temp) = create_test_db();
    assert!(db.path().contains("test.db"));
    assert_eq!(db.schema_version().await.unwrap(), SCHEMA_VERSION);
}

#[tokio::test]
async fn test_reopening_store_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    {
        let db = Database::new(&db_path).unwrap();
        assert_eq!(db.schema_version().await.unwrap(), SCHEMA_VERSION);
    }
    let db = Database::new(&db_path).unwrap();
    assert_eq!(db.schema_version().await.unwrap(), SCHEMA_VERSION);
}

#[tokio::test]
async fn test_create_and_get_initiative() {
    let (db, _temp) = create_test_db();
    let repo = InitiativeRepository::new(db);

    let initiative = repo
        .create("Q3 platform".to_string(), Some("Scale work".to_string()))
        .await
        .unwrap();

    let fetched = repo.get(&initiative.id).await.unwrap().unwrap();
    assert_eq!(fetched.title, "Q3 platform");
    assert_eq!(fetched.description, Some("Scale work".to_string()));

    assert!(repo.get("missing-id").await.unwrap().is_none());
}

#[tokio::test]
async fn test_prd_requires_existing_initiative() {
    let (db, _temp) = create_test_db();
    let repo = PrdRepository::new(db);

    let err = repo
        .create("no-such-initiative".to_string(), "Spec".to_string(), None, vec![])
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Constraint(_))
    ));
}

#[tokio::test]
async fn test_prd_milestones_round_trip() {
    let (db, _temp) = create_test_db();
    let initiatives = InitiativeRepository::new(db.clone());
    let prds = PrdRepository::new(db);

    let initiative = initiatives.create("Init".to_string(), None).await.unwrap();
    let prd = prds
        .create(
            initiative.id,
            "Auth revamp".to_string(),
            Some("...".to_string()),
            vec![Milestone {
                name: "phase-1".to_string(),
                task_ids: vec!["t1".to_string()],
            }],
        )
        .await
        .unwrap();

    let fetched = prds.get(&prd.id).await.unwrap().unwrap();
    assert_eq!(fetched.milestones.len(), 1);
    assert_eq!(fetched.milestones[0].name, "phase-1");
}

#[tokio::test]
async fn test_orphan_task_is_legal() {
    let (db, _temp) = create_test_db();
    let repo = TaskRepository::new(db);

    let task = repo
        .create(NewTask {
            title: "Ad-hoc stream task".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    assert!(task.prd_id.is_none());
    assert!(task.parent_id.is_none());
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_task_rejects_missing_parent() {
    let (db, _temp) = create_test_db();
    let repo = TaskRepository::new(db);

    let err = repo
        .create(NewTask {
            title: "Child".to_string(),
            parent_id: Some("missing".to_string()),
            ..NewTask::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Constraint(_))
    ));
}

#[tokio::test]
async fn test_task_partial_update_touches_only_given_fields() {
    let (db, _temp) = create_test_db();
    let repo = TaskRepository::new(db);

    let task = repo
        .create(NewTask {
            title: "Task".to_string(),
            assigned_agent: Some("builder".to_string()),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let updated = repo
        .update(
            &task.id,
            TaskPatch {
                status: Some(TaskStatus::InProgress),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.status, TaskStatus::InProgress);
    assert_eq!(updated.assigned_agent, Some("builder".to_string()));
    assert!(updated.updated_at >= task.updated_at);
}

#[tokio::test]
async fn test_task_empty_patch_is_noop() {
    let (db, _temp) = create_test_db();
    let repo = TaskRepository::new(db);

    let task = repo
        .create(NewTask {
            title: "Task".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let unchanged = repo.update(&task.id, TaskPatch::default()).await.unwrap();
    assert_eq!(unchanged.status, task.status);
    assert_eq!(unchanged.updated_at, task.updated_at);
}

#[tokio::test]
async fn test_task_metadata_merges() {
    let (db, _temp) = create_test_db();
    let repo = TaskRepository::new(db);

    let task = repo
        .create(NewTask {
            title: "Task".to_string(),
            metadata: Some(json!({"owner": "core", "attempt": 1})),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let updated = repo
        .update(
            &task.id,
            TaskPatch {
                metadata: Some(json!({"attempt": 2})),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        updated.metadata,
        Some(json!({"owner": "core", "attempt": 2}))
    );
}

#[tokio::test]
async fn test_task_filters_are_conjunctive() {
    let (db, _temp) = create_test_db();
    let repo = TaskRepository::new(db);

    let a = repo
        .create(NewTask {
            title: "A".to_string(),
            assigned_agent: Some("builder".to_string()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    repo.create(NewTask {
        title: "B".to_string(),
        assigned_agent: Some("reviewer".to_string()),
        ..NewTask::default()
    })
    .await
    .unwrap();

    repo.update(
        &a.id,
        TaskPatch {
            status: Some(TaskStatus::InProgress),
            ..TaskPatch::default()
        },
    )
    .await
    .unwrap();

    let both = repo.list(TaskFilter::default()).await.unwrap();
    assert_eq!(both.len(), 2);

    let filtered = repo
        .list(TaskFilter {
            status: Some(TaskStatus::InProgress),
            assigned_agent: Some("builder".to_string()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, a.id);

    let none = repo
        .list(TaskFilter {
            status: Some(TaskStatus::InProgress),
            assigned_agent: Some("reviewer".to_string()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_subtask_progress_counts() {
    let (db, _temp) = create_test_db();
    let repo = TaskRepository::new(db);

    let parent = repo
        .create(NewTask {
            title: "Parent".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    for i in 0..3 {
        let child = repo
            .create(NewTask {
                title: format!("Child {}", i),
                parent_id: Some(parent.id.clone()),
                ..NewTask::default()
            })
            .await
            .unwrap();
        if i < 2 {
            repo.update(
                &child.id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();
        }
    }

    let (completed, total) = repo.subtask_progress(&parent.id).await.unwrap();
    assert_eq!((completed, total), (2, 3));
}

#[tokio::test]
async fn test_work_products_append_and_exists() {
    let (db, _temp) = create_test_db();
    let tasks = TaskRepository::new(db.clone());
    let products = WorkProductRepository::new(db);

    let task = tasks
        .create(NewTask {
            title: "Task".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    assert!(!products.has_for_task(&task.id).await.unwrap());

    products
        .store(
            task.id.clone(),
            WorkProductKind::Design,
            "API sketch".to_string(),
            Some("...".to_string()),
            None,
        )
        .await
        .unwrap();

    assert!(products.has_for_task(&task.id).await.unwrap());
    let listed = products
        .list(Some(&task.id), Some(WorkProductKind::Design))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "API sketch");

    let err = products
        .store(
            "missing-task".to_string(),
            WorkProductKind::Doc,
            "Nope".to_string(),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Constraint(_))
    ));
}

#[tokio::test]
async fn test_handoff_chain_validation_and_order() {
    let (db, _temp) = create_test_db();
    let tasks = TaskRepository::new(db.clone());
    let handoffs = HandoffRepository::new(db);

    let task = tasks
        .create(NewTask {
            title: "Task".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    // Out-of-range position is rejected before any row lands.
    let err = handoffs
        .create(NewHandoff {
            task_id: task.id.clone(),
            from_agent: "architect".to_string(),
            to_agent: "builder".to_string(),
            work_product_id: None,
            context: None,
            chain_position: 3,
            chain_length: 2,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Validation(_))
    ));

    // Insert out of order, read back in chain order.
    for (pos, from, to) in [(2, "builder", "reviewer"), (1, "architect", "builder")] {
        handoffs
            .create(NewHandoff {
                task_id: task.id.clone(),
                from_agent: from.to_string(),
                to_agent: to.to_string(),
                work_product_id: None,
                context: Some("handing over".to_string()),
                chain_position: pos,
                chain_length: 2,
            })
            .await
            .unwrap();
    }

    let chain = handoffs.chain(&task.id).await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].chain_position, 1);
    assert_eq!(chain[0].from_agent, "architect");
    assert_eq!(chain[1].chain_position, 2);

    // A divergent chain length on the same task is rejected.
    let err = handoffs
        .create(NewHandoff {
            task_id: task.id.clone(),
            from_agent: "reviewer".to_string(),
            to_agent: "architect".to_string(),
            work_product_id: None,
            context: None,
            chain_position: 3,
            chain_length: 3,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Validation(_))
    ));
}

#[tokio::test]
async fn test_wipe_requires_confirmation() {
    let (db, _temp) = create_test_db();
    let repo = InitiativeRepository::new(db);

    let initiative = repo.create("Init".to_string(), None).await.unwrap();
    let err = repo.wipe(&initiative.id, false).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Validation(_))
    ));
    assert!(repo.get(&initiative.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_wipe_cascades_owned_entities() {
    let (db, _temp) = create_test_db();
    let initiatives = InitiativeRepository::new(db.clone());
    let prds = PrdRepository::new(db.clone());
    let tasks = TaskRepository::new(db.clone());
    let products = WorkProductRepository::new(db.clone());

    let keep = initiatives.create("Keep".to_string(), None).await.unwrap();
    let wipe = initiatives.create("Wipe".to_string(), None).await.unwrap();

    let keep_prd = prds
        .create(keep.id.clone(), "Keep spec".to_string(), None, vec![])
        .await
        .unwrap();
    let keep_task = tasks
        .create(NewTask {
            title: "Kept".to_string(),
            prd_id: Some(keep_prd.id.clone()),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let prd = prds
        .create(wipe.id.clone(), "Doomed spec".to_string(), None, vec![])
        .await
        .unwrap();
    let task = tasks
        .create(NewTask {
            title: "Doomed".to_string(),
            prd_id: Some(prd.id.clone()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let subtask = tasks
        .create(NewTask {
            title: "Doomed child".to_string(),
            parent_id: Some(task.id.clone()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    products
        .store(
            task.id.clone(),
            WorkProductKind::Implementation,
            "Patch".to_string(),
            None,
            None,
        )
        .await
        .unwrap();

    let report = initiatives.wipe(&wipe.id, true).await.unwrap();
    assert_eq!(report.prds, 1);
    assert_eq!(report.tasks, 2);
    assert_eq!(report.work_products, 1);

    assert!(initiatives.get(&wipe.id).await.unwrap().is_none());
    assert!(prds.get(&prd.id).await.unwrap().is_none());
    assert!(tasks.get(&task.id).await.unwrap().is_none());
    assert!(tasks.get(&subtask.id).await.unwrap().is_none());

    // Unrelated rows survive.
    assert!(tasks.get(&keep_task.id).await.unwrap().is_some());
    assert!(prds.get(&keep_prd.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_stream_meta_validated_on_write() {
    let (db, _temp) = create_test_db();
    let repo = TaskRepository::new(db);

    let err = repo
        .create(NewTask {
            title: "Bad stream".to_string(),
            stream: Some(StreamMeta {
                id: "loop".to_string(),
                name: None,
                depends_on: vec!["loop".to_string()],
                files: vec![],
            }),
            ..NewTask::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Validation(_))
    ));
}
