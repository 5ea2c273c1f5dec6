use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::lockfile::{self, LockFile};
use crate::types::Task;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("task already exists: {0}")]
    AlreadyExists(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("revision conflict on task {task_id}: expected {expected}, found {found}")]
    Conflict {
        task_id: String,
        expected: u64,
        found: u64,
    },
    #[error("task {task_id} is being driven by another run")]
    Busy { task_id: String, holder: Option<u32> },
    #[error("timed out waiting for the write lock on task {0}")]
    LockTimeout(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Exclusive right to drive one task through its stages. Released on drop.
pub struct TaskClaim {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskClaim {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for TaskClaim {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for TaskClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskClaim").finish_non_exhaustive()
    }
}

/// Snapshot persistence keyed by task id.
///
/// Writes are optimistic: every stored task carries a `revision`, and
/// [`TaskStore::commit`] only succeeds when the caller's copy was read at the
/// current revision. A read after a successful write always observes it.
pub trait TaskStore: Send + Sync {
    /// Store a brand-new task at revision 1.
    fn insert(&self, task: &mut Task) -> Result<()>;

    fn load(&self, id: &str) -> Result<Option<Task>>;

    /// Replace the stored snapshot if `task.revision` matches, then bump the
    /// revision on both copies.
    fn commit(&self, task: &mut Task) -> Result<()>;

    /// All tasks, most recently updated first.
    fn list(&self) -> Result<Vec<Task>>;

    /// Take the exclusive claim on `id` without waiting. Fails with
    /// [`StoreError::Busy`] while another holder, in this process or any
    /// other sharing the store, still has it.
    fn claim(&self, id: &str) -> Result<TaskClaim>;
}

fn check_revision(task: &Task, stored_revision: u64) -> Result<()> {
    if stored_revision == task.revision {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            task_id: task.id.clone(),
            expected: task.revision,
            found: stored_revision,
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryTaskStore
// ---------------------------------------------------------------------------

/// Process-lifetime store. Only suitable when the same process serves both
/// the run that pauses and the later resume.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: DashMap<String, Task>,
    claims: Arc<DashSet<String>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn insert(&self, task: &mut Task) -> Result<()> {
        match self.tasks.entry(task.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(task.id.clone())),
            Entry::Vacant(slot) => {
                task.revision = 1;
                slot.insert(task.clone());
                Ok(())
            }
        }
    }

    fn load(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.get(id).map(|t| t.clone()))
    }

    fn commit(&self, task: &mut Task) -> Result<()> {
        let mut slot = self
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::NotFound(task.id.clone()))?;
        check_revision(task, slot.revision)?;
        task.revision += 1;
        *slot = task.clone();
        Ok(())
    }

    fn list(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|e| e.value().clone()).collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tasks)
    }

    fn claim(&self, id: &str) -> Result<TaskClaim> {
        if !self.claims.insert(id.to_string()) {
            return Err(StoreError::Busy {
                task_id: id.to_string(),
                holder: Some(std::process::id()),
            });
        }
        let claims = self.claims.clone();
        let id = id.to_string();
        Ok(TaskClaim::new(move || {
            claims.remove(&id);
        }))
    }
}

// ---------------------------------------------------------------------------
// FileTaskStore
// ---------------------------------------------------------------------------

/// How long a writer waits for another writer's read-check-write to finish.
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// File-system-backed task persistence.
///
/// Tasks are stored as individual JSON files under a configurable directory
/// (defaults to `~/.bughunt/tasks/`), so a task paused at the approval gate
/// survives the process that started it. Next to each `<id>.json` live two
/// PID lock files:
///
/// - `<id>.lock` is held for the read, revision check and rename of a single
///   insert or commit, so compare-and-swap is exact across processes.
/// - `<id>.claim` backs [`TaskStore::claim`] for the length of a whole run.
pub struct FileTaskStore {
    base_dir: PathBuf,
}

impl FileTaskStore {
    /// Create a store with the default directory (`~/.bughunt/tasks/`).
    pub fn default_path() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bughunt")
            .join("tasks");
        Self::new(base)
    }

    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    /// Task ids are arbitrary strings; hex keeps file names safe and unique.
    fn file_stem(id: &str) -> String {
        id.bytes().map(|b| format!("{b:02x}")).collect()
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", Self::file_stem(id)))
    }

    fn sidecar_path(&self, id: &str, kind: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{kind}", Self::file_stem(id)))
    }

    fn write_lock(&self, id: &str) -> Result<LockFile> {
        self.ensure_dir()?;
        LockFile::acquire(&self.sidecar_path(id, "lock"), WRITE_LOCK_TIMEOUT)?
            .ok_or_else(|| StoreError::LockTimeout(id.to_string()))
    }

    fn read_task(path: &Path) -> Result<Option<Task>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn write_task(&self, task: &Task) -> Result<()> {
        let path = self.task_path(&task.id);
        let tmp = self.base_dir.join(format!(
            "{}.{}.{}.tmp",
            Self::file_stem(&task.id),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let json = serde_json::to_string_pretty(task)?;
        if let Err(e) = std::fs::write(&tmp, json).and_then(|()| std::fs::rename(&tmp, &path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl TaskStore for FileTaskStore {
    fn insert(&self, task: &mut Task) -> Result<()> {
        let _lock = self.write_lock(&task.id)?;
        if self.task_path(&task.id).exists() {
            return Err(StoreError::AlreadyExists(task.id.clone()));
        }
        let previous = task.revision;
        task.revision = 1;
        if let Err(e) = self.write_task(task) {
            task.revision = previous;
            return Err(e);
        }
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Task>> {
        Self::read_task(&self.task_path(id))
    }

    fn commit(&self, task: &mut Task) -> Result<()> {
        let _lock = self.write_lock(&task.id)?;
        let stored = Self::read_task(&self.task_path(&task.id))?
            .ok_or_else(|| StoreError::NotFound(task.id.clone()))?;
        check_revision(task, stored.revision)?;
        task.revision += 1;
        if let Err(e) = self.write_task(task) {
            task.revision -= 1;
            return Err(e);
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<Task>> {
        self.ensure_dir()?;
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_task(&path) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task file");
                }
            }
        }
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tasks)
    }

    fn claim(&self, id: &str) -> Result<TaskClaim> {
        self.ensure_dir()?;
        let path = self.sidecar_path(id, "claim");
        match LockFile::try_acquire(&path)? {
            Some(lock) => Ok(TaskClaim::new(move || drop(lock))),
            None => Err(StoreError::Busy {
                task_id: id.to_string(),
                holder: lockfile::holder(&path),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorReport, RepoRef};

    fn make_task(id: &str) -> Task {
        Task::new(
            id,
            ErrorReport::new(id, "KeyError", "'foo'"),
            RepoRef::new("acme", "shop"),
        )
    }

    #[test]
    fn memory_insert_then_load() {
        let store = MemoryTaskStore::new();
        let mut task = make_task("t-1");
        store.insert(&mut task).unwrap();
        assert_eq!(task.revision, 1);

        let loaded = store.load("t-1").unwrap().unwrap();
        assert_eq!(loaded.id, "t-1");
        assert_eq!(loaded.revision, 1);
        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn memory_insert_twice_fails() {
        let store = MemoryTaskStore::new();
        store.insert(&mut make_task("t-1")).unwrap();
        let err = store.insert(&mut make_task("t-1")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "t-1"));
    }

    #[test]
    fn memory_commit_detects_stale_copy() {
        let store = MemoryTaskStore::new();
        let mut task = make_task("t-1");
        store.insert(&mut task).unwrap();

        let mut stale = store.load("t-1").unwrap().unwrap();
        task.locator_summary = Some("fresh".into());
        store.commit(&mut task).unwrap();
        assert_eq!(task.revision, 2);

        stale.locator_summary = Some("stale".into());
        let err = store.commit(&mut stale).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, found: 2, .. }));
        assert_eq!(stale.revision, 1);
        assert_eq!(
            store.load("t-1").unwrap().unwrap().locator_summary.as_deref(),
            Some("fresh")
        );
    }

    #[test]
    fn memory_commit_unknown_task() {
        let store = MemoryTaskStore::new();
        let err = store.commit(&mut make_task("ghost")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn memory_claim_is_exclusive_until_dropped() {
        let store = MemoryTaskStore::new();
        let claim = store.claim("t-1").unwrap();
        assert!(matches!(
            store.claim("t-1"),
            Err(StoreError::Busy { task_id, .. }) if task_id == "t-1"
        ));
        assert!(store.claim("t-2").is_ok());

        drop(claim);
        assert!(store.claim("t-1").is_ok());
    }
}
