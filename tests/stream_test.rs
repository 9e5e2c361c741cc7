// Stream resolver and archival tests

use taskloom::core::{ArchivalScoper, StreamResolver};
use taskloom::db::meta::StreamMeta;
use taskloom::db::repositories::initiative::InitiativeRepository;
use taskloom::db::repositories::prd::PrdRepository;
use taskloom::db::repositories::task::{NewTask, TaskFilter, TaskPatch, TaskStatus};
use taskloom::db::{Database, TaskRepository};
use tempfile::TempDir;

fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(db_path).unwrap();
    (db, temp_dir)
}

fn meta(id: &str, deps: &[&str], files: &[&str]) -> StreamMeta {
    StreamMeta {
        id: id.to_string(),
        name: None,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        files: files.iter().map(|f| f.to_string()).collect(),
    }
}

async fn streamed_task(db: &Database, title: &str, stream: StreamMeta) -> String {
    TaskRepository::new(db.clone())
        .create(NewTask {
            title: title.to_string(),
            stream: Some(stream),
            ..NewTask::default()
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_streams_derive_from_tasks_with_layering() {
    let (db, _temp) = create_test_db();
    let tasks = TaskRepository::new(db.clone());

    let t1 = streamed_task(&db, "Schema tables", meta("Stream-A", &[], &["db/schema.sql"])).await;
    streamed_task(&db, "Schema indexes", meta("Stream-A", &[], &["db/indexes.sql"])).await;
    streamed_task(&db, "API layer", meta("Stream-B", &["Stream-A"], &["src/api.rs"])).await;

    tasks
        .update(
            &t1,
            TaskPatch {
                status: Some(TaskStatus::Completed),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

    let resolver = StreamResolver::new(tasks);
    let streams = resolver.list(false).await.unwrap();
    assert_eq!(streams.len(), 2);

    let a = &streams[0];
    assert_eq!(a.id, "Stream-A");
    assert_eq!(a.total, 2);
    assert_eq!(a.completed, 1);
    assert_eq!(a.progress_percent(), 50);
    // Members' declared files are unioned.
    assert_eq!(a.files, vec!["db/schema.sql", "db/indexes.sql"]);

    let b = &streams[1];
    assert_eq!(b.id, "Stream-B");
    assert_eq!(b.depends_on, vec!["Stream-A"]);

    let plan = resolver.execution_layers().await.unwrap();
    assert_eq!(
        plan.layers,
        vec![vec!["Stream-A".to_string()], vec!["Stream-B".to_string()]]
    );
    assert!(plan.unresolved.is_empty());
}

#[tokio::test]
async fn test_first_member_owns_dependency_list() {
    let (db, _temp) = create_test_db();

    streamed_task(&db, "First", meta("Stream-A", &["Stream-X"], &[])).await;
    // A later member declaring different deps does not change them.
    streamed_task(&db, "Second", meta("Stream-A", &["Stream-Y"], &[])).await;

    let resolver = StreamResolver::new(TaskRepository::new(db));
    let stream = resolver.get("Stream-A", false).await.unwrap().unwrap();
    assert_eq!(stream.depends_on, vec!["Stream-X"]);
    assert_eq!(stream.total, 2);
}

#[tokio::test]
async fn test_dependency_cycle_is_reported_not_layered() {
    let (db, _temp) = create_test_db();

    streamed_task(&db, "A", meta("Stream-A", &["Stream-B"], &[])).await;
    streamed_task(&db, "B", meta("Stream-B", &["Stream-A"], &[])).await;
    streamed_task(&db, "C", meta("Stream-C", &[], &[])).await;

    let resolver = StreamResolver::new(TaskRepository::new(db));

    let plan = resolver.execution_layers().await.unwrap();
    assert_eq!(plan.layers, vec![vec!["Stream-C".to_string()]]);
    let mut unresolved = plan.unresolved.clone();
    unresolved.sort();
    assert_eq!(unresolved, vec!["Stream-A", "Stream-B"]);

    let cycles = resolver.find_cycles().await.unwrap();
    assert_eq!(cycles.len(), 1);
    let mut members = cycles[0].clone();
    members.sort();
    assert_eq!(members, vec!["Stream-A", "Stream-B"]);
}

#[tokio::test]
async fn test_conflict_check_matches_declared_files() {
    let (db, _temp) = create_test_db();

    streamed_task(&db, "A", meta("Stream-A", &[], &["src/lib.rs", "src/db.rs"])).await;
    streamed_task(&db, "B", meta("Stream-B", &[], &["src/cli.rs"])).await;

    let resolver = StreamResolver::new(TaskRepository::new(db));

    let conflicts = resolver
        .conflict_check(&["src/db.rs".to_string()], None)
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, "Stream-A");

    // A stream never conflicts with itself.
    let conflicts = resolver
        .conflict_check(&["src/db.rs".to_string()], Some("Stream-A"))
        .await
        .unwrap();
    assert!(conflicts.is_empty());

    let conflicts = resolver
        .conflict_check(&["README.md".to_string()], None)
        .await
        .unwrap();
    assert!(conflicts.is_empty());
}

#[tokio::test]
async fn test_initiative_switch_archives_previous_streams() {
    let (db, _temp) = create_test_db();
    let initiatives = InitiativeRepository::new(db.clone());
    let prds = PrdRepository::new(db.clone());
    let tasks = TaskRepository::new(db.clone());

    let old = initiatives
        .create("Old initiative".to_string(), None)
        .await
        .unwrap();
    let new = initiatives
        .create("New initiative".to_string(), None)
        .await
        .unwrap();
    let prd = prds
        .create(old.id.clone(), "Old PRD".to_string(), None, vec![])
        .await
        .unwrap();

    let streamed = tasks
        .create(NewTask {
            title: "Old stream work".to_string(),
            prd_id: Some(prd.id.clone()),
            stream: Some(meta("Stream-A", &[], &[])),
            ..NewTask::default()
        })
        .await
        .unwrap();
    // Non-streamed work under the same PRD is untouched by archival.
    let plain = tasks
        .create(NewTask {
            title: "Old plain work".to_string(),
            prd_id: Some(prd.id.clone()),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let scoper = ArchivalScoper::new(db.clone());
    let archived = scoper.archive_streams(&old.id, &new.id).await.unwrap();
    assert_eq!(archived, 1);

    let task = tasks.get(&streamed.id).await.unwrap().unwrap();
    assert!(task.archived);
    assert!(task.archived_at.is_some());
    assert_eq!(task.archived_by, Some(new.id.clone()));
    assert!(!tasks.get(&plain.id).await.unwrap().unwrap().archived);

    // Archived streams drop out of default listings but stay queryable.
    let resolver = StreamResolver::new(TaskRepository::new(db.clone()));
    assert!(resolver.list(false).await.unwrap().is_empty());
    let all = resolver.list(true).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].archived);

    let visible = tasks.list(TaskFilter::default()).await.unwrap();
    assert!(visible.iter().all(|t| t.id != streamed.id));
    let everything = tasks
        .list(TaskFilter {
            include_archived: true,
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert!(everything.iter().any(|t| t.id == streamed.id));
}

#[tokio::test]
async fn test_orphan_streamed_tasks_are_archived_too() {
    let (db, _temp) = create_test_db();
    let initiatives = InitiativeRepository::new(db.clone());
    let tasks = TaskRepository::new(db.clone());

    let old = initiatives.create("Old".to_string(), None).await.unwrap();
    let new = initiatives.create("New".to_string(), None).await.unwrap();

    let orphan = streamed_task(&db, "Ad-hoc stream work", meta("Stream-A", &[], &[])).await;

    let scoper = ArchivalScoper::new(db);
    let archived = scoper.archive_streams(&old.id, &new.id).await.unwrap();
    assert_eq!(archived, 1);
    assert!(tasks.get(&orphan).await.unwrap().unwrap().archived);
}

#[tokio::test]
async fn test_unarchive_restores_whole_stream() {
    let (db, _temp) = create_test_db();
    let initiatives = InitiativeRepository::new(db.clone());
    let tasks = TaskRepository::new(db.clone());

    let old = initiatives.create("Old".to_string(), None).await.unwrap();
    let new = initiatives.create("New".to_string(), None).await.unwrap();

    let t1 = streamed_task(&db, "One", meta("Stream-A", &[], &[])).await;
    let t2 = streamed_task(&db, "Two", meta("Stream-A", &[], &[])).await;

    let scoper = ArchivalScoper::new(db.clone());
    assert_eq!(scoper.archive_streams(&old.id, &new.id).await.unwrap(), 2);

    let restored = scoper.unarchive_stream("Stream-A").await.unwrap();
    assert_eq!(restored, 2);
    for id in [&t1, &t2] {
        let task = tasks.get(id).await.unwrap().unwrap();
        assert!(!task.archived);
        assert!(task.archived_at.is_none());
        assert!(task.archived_by.is_none());
    }

    let resolver = StreamResolver::new(TaskRepository::new(db));
    let streams = resolver.list(false).await.unwrap();
    assert_eq!(streams.len(), 1);
    assert!(!streams[0].archived);

    // Nothing left to restore.
    assert_eq!(scoper.unarchive_stream("Stream-A").await.unwrap(), 0);
}

#[tokio::test]
async fn test_stream_is_archived_only_when_every_member_is() {
    let (db, _temp) = create_test_db();
    let initiatives = InitiativeRepository::new(db.clone());
    let tasks = TaskRepository::new(db.clone());

    let old = initiatives.create("Old".to_string(), None).await.unwrap();
    let new = initiatives.create("New".to_string(), None).await.unwrap();

    streamed_task(&db, "One", meta("Stream-A", &[], &[])).await;
    let scoper = ArchivalScoper::new(db.clone());
    scoper.archive_streams(&old.id, &new.id).await.unwrap();

    // A fresh member revives the stream in default listings.
    streamed_task(&db, "Two", meta("Stream-A", &[], &[])).await;

    let resolver = StreamResolver::new(tasks);
    let active = resolver.list(false).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].total, 1);

    let all = resolver.list(true).await.unwrap();
    assert_eq!(all[0].total, 2);
    assert!(!all[0].archived);
}
