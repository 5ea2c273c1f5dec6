use std::sync::{Arc, Barrier};

use bh_core::store::{FileTaskStore, StoreError, TaskStore};
use bh_core::types::*;

fn temp_store() -> (FileTaskStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = FileTaskStore::new(dir.path().join("tasks"));
    (store, dir)
}

fn make_task(id: &str) -> Task {
    let mut report = ErrorReport::new(id, "KeyError", "'foo'");
    report.stack_frames.push(StackFrame {
        filename: "app.py".into(),
        function: Some("handler".into()),
        line_number: Some(12),
        in_app: true,
    });
    Task::new(id, report, RepoRef::new("acme", "shop"))
}

#[test]
fn insert_and_load_roundtrip() {
    let (store, _dir) = temp_store();
    let mut task = make_task("ERR-1");
    task.candidate_locations = vec![CandidateLocation::new("app.py", "raises here").at_line(12)];
    store.insert(&mut task).unwrap();

    let loaded = store.load("ERR-1").unwrap().expect("task should exist");
    assert_eq!(loaded.revision, 1);
    assert_eq!(loaded.repository, RepoRef::new("acme", "shop"));
    assert_eq!(loaded.error_report.stack_frames[0].line_number, Some(12));
    assert_eq!(loaded.candidate_locations[0].path, "app.py");
    assert_eq!(loaded.status, WorkflowStatus::Created);
}

#[test]
fn load_nonexistent() {
    let (store, _dir) = temp_store();
    assert!(store.load("missing").unwrap().is_none());
}

#[test]
fn odd_ids_map_to_safe_file_names() {
    let (store, _dir) = temp_store();
    let mut task = make_task("../../etc/passwd");
    store.insert(&mut task).unwrap();

    let names: Vec<String> = std::fs::read_dir(store.base_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 1);
    assert!(!names[0].contains('/'));
    assert!(!names[0].contains(".."));
    assert_eq!(
        store.load("../../etc/passwd").unwrap().unwrap().id,
        "../../etc/passwd"
    );
}

#[test]
fn duplicate_insert_rejected() {
    let (store, _dir) = temp_store();
    store.insert(&mut make_task("ERR-1")).unwrap();
    let err = store.insert(&mut make_task("ERR-1")).unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
}

#[test]
fn commit_is_visible_to_a_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let first = FileTaskStore::new(dir.path());
    let mut task = make_task("ERR-1");
    first.insert(&mut task).unwrap();
    task.transition(WorkflowStatus::Locating).unwrap();
    first.commit(&mut task).unwrap();

    let second = FileTaskStore::new(dir.path());
    let loaded = second.load("ERR-1").unwrap().unwrap();
    assert_eq!(loaded.status, WorkflowStatus::Locating);
    assert_eq!(loaded.revision, 2);
}

#[test]
fn stale_commit_conflicts() {
    let (store, _dir) = temp_store();
    let mut task = make_task("ERR-1");
    store.insert(&mut task).unwrap();
    let mut stale = store.load("ERR-1").unwrap().unwrap();

    task.approval = ApprovalState::Approved;
    store.commit(&mut task).unwrap();

    stale.approval = ApprovalState::Rejected;
    let err = store.commit(&mut stale).unwrap_err();
    assert!(matches!(err, StoreError::Conflict { expected: 1, found: 2, .. }));
    assert_eq!(
        store.load("ERR-1").unwrap().unwrap().approval,
        ApprovalState::Approved
    );
}

#[test]
fn list_skips_garbage_and_orders_by_update() {
    let (store, _dir) = temp_store();
    let mut older = make_task("older");
    store.insert(&mut older).unwrap();
    let mut newer = make_task("newer");
    newer.updated_at = older.updated_at + chrono::Duration::seconds(5);
    store.insert(&mut newer).unwrap();
    std::fs::write(store.base_dir().join("junk.json"), "{ not json").unwrap();

    let ids: Vec<String> = store.list().unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec!["newer".to_string(), "older".to_string()]);
}

#[test]
fn concurrent_commits_from_two_stores_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    for round in 0..50 {
        let id = format!("ERR-{round}");
        let mut task = make_task(&id);
        FileTaskStore::new(dir.path()).insert(&mut task).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [ApprovalState::Approved, ApprovalState::Rejected]
            .into_iter()
            .map(|approval| {
                let barrier = barrier.clone();
                let base = dir.path().to_path_buf();
                let id = id.clone();
                std::thread::spawn(move || {
                    let store = FileTaskStore::new(base);
                    let mut copy = store.load(&id).unwrap().unwrap();
                    copy.approval = approval;
                    barrier.wait();
                    store.commit(&mut copy).map(|()| approval)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<ApprovalState> =
            results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        assert_eq!(winners.len(), 1, "round {round}: {results:?}");
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(StoreError::Conflict { expected: 1, found: 2, .. }))));

        let stored = FileTaskStore::new(dir.path()).load(&id).unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.approval, winners[0]);
    }

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) != Some("json"))
        .collect();
    assert!(leftovers.is_empty(), "stray files: {leftovers:?}");
}

#[test]
fn claim_is_exclusive_across_store_instances() {
    let dir = tempfile::tempdir().unwrap();
    let first = FileTaskStore::new(dir.path());
    let second = FileTaskStore::new(dir.path());

    let claim = first.claim("ERR-1").unwrap();
    match second.claim("ERR-1") {
        Err(StoreError::Busy { task_id, holder }) => {
            assert_eq!(task_id, "ERR-1");
            assert_eq!(holder, Some(std::process::id()));
        }
        other => panic!("expected busy, got {other:?}"),
    }
    assert!(second.claim("ERR-2").is_ok());

    drop(claim);
    assert!(second.claim("ERR-1").is_ok());
}

#[test]
fn claim_left_by_a_dead_process_is_recovered() {
    let (store, _dir) = temp_store();
    std::fs::create_dir_all(store.base_dir()).unwrap();
    let stem: String = "ERR-1".bytes().map(|b| format!("{b:02x}")).collect();
    std::fs::write(store.base_dir().join(format!("{stem}.claim")), "4000000").unwrap();

    assert!(store.claim("ERR-1").is_ok());
}

#[test]
fn list_ignores_lock_files() {
    let (store, _dir) = temp_store();
    store.insert(&mut make_task("ERR-1")).unwrap();
    let _claim = store.claim("ERR-1").unwrap();
    assert_eq!(store.list().unwrap().len(), 1);
}
