//! Infrastructure implementations of repository traits

use crate::domain::entities::{BranchVersion, ForkKey, Frontier, Story, StoryStatus, StoredEvent, ViewerProgress};
use crate::domain::repositories::{
    EventRepository, ProgressRepository, RepositoryError, StoryRepository, VersionRepository,
};
use crate::domain::value_objects::{SeqId, StoryId, VersionId, ViewerId};
use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

#[derive(Default)]
struct EventTables {
    events: HashMap<SeqId, StoredEvent>,
    /// successor -> event owning the pointer
    pointers: HashMap<SeqId, SeqId>,
    starts: HashMap<StoryId, SeqId>,
    by_story: HashMap<StoryId, Vec<SeqId>>,
}

/// In-memory event graph
#[derive(Default)]
pub struct InMemoryEventRepository {
    tables: RwLock<EventTables>,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.read().await.events.is_empty()
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn insert(&self, stored: StoredEvent) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let seq_id = stored.event.seq_id.clone();
        if tables.events.contains_key(&seq_id) {
            return Err(RepositoryError::Conflict {
                key: seq_id.to_string(),
            });
        }
        let targets: Vec<SeqId> = stored.event.successors().into_iter().cloned().collect();
        if let Some(taken) = targets.iter().find(|t| tables.pointers.contains_key(*t)) {
            return Err(RepositoryError::Conflict {
                key: format!("pointer to {taken}"),
            });
        }

        let story_id = stored.event.story_id.clone();
        if stored.predecessor.is_none() {
            tables.starts.entry(story_id.clone()).or_insert_with(|| seq_id.clone());
        }
        for target in targets {
            tables.pointers.insert(target, seq_id.clone());
        }
        tables.by_story.entry(story_id).or_default().push(seq_id.clone());
        tables.events.insert(seq_id, stored);
        Ok(())
    }

    async fn get(&self, seq_id: &SeqId) -> Result<Option<StoredEvent>, RepositoryError> {
        Ok(self.tables.read().await.events.get(seq_id).cloned())
    }

    async fn pointer_owner(&self, target: &SeqId) -> Result<Option<SeqId>, RepositoryError> {
        Ok(self.tables.read().await.pointers.get(target).cloned())
    }

    async fn start_of(&self, story_id: &StoryId) -> Result<Option<SeqId>, RepositoryError> {
        Ok(self.tables.read().await.starts.get(story_id).cloned())
    }

    async fn remove_story(&self, story_id: &StoryId) -> Result<usize, RepositoryError> {
        let mut tables = self.tables.write().await;
        let ids = tables.by_story.remove(story_id).unwrap_or_default();
        for id in &ids {
            if let Some(stored) = tables.events.remove(id) {
                for target in stored.event.successors() {
                    tables.pointers.remove(target);
                }
            }
        }
        tables.starts.remove(story_id);
        Ok(ids.len())
    }
}

#[derive(Default)]
struct VersionTables {
    versions: HashMap<VersionId, BranchVersion>,
    keys: HashMap<ForkKey, VersionId>,
    roots: HashMap<StoryId, VersionId>,
}

/// In-memory version table with the fork-triple unique index
#[derive(Default)]
pub struct InMemoryVersionRepository {
    tables: RwLock<VersionTables>,
}

impl InMemoryVersionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionRepository for InMemoryVersionRepository {
    async fn get(&self, id: &VersionId) -> Result<Option<BranchVersion>, RepositoryError> {
        Ok(self.tables.read().await.versions.get(id).cloned())
    }

    async fn find_by_key(&self, key: &ForkKey) -> Result<Option<BranchVersion>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .keys
            .get(key)
            .and_then(|id| tables.versions.get(id))
            .cloned())
    }

    async fn root_of(&self, story_id: &StoryId) -> Result<Option<BranchVersion>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .roots
            .get(story_id)
            .and_then(|id| tables.versions.get(id))
            .cloned())
    }

    async fn insert_unique(
        &self,
        version: BranchVersion,
    ) -> Result<(BranchVersion, bool), RepositoryError> {
        let mut tables = self.tables.write().await;
        let existing = match version.fork_key() {
            Some(key) => tables.keys.get(&key).cloned(),
            None => tables.roots.get(&version.story_id).cloned(),
        };
        if let Some(id) = existing {
            let stored = tables.versions.get(&id).cloned().ok_or_else(|| RepositoryError::Missing {
                key: id.to_string(),
            })?;
            return Ok((stored, false));
        }
        if tables.versions.contains_key(&version.id) {
            return Err(RepositoryError::Conflict {
                key: version.id.to_string(),
            });
        }

        match version.fork_key() {
            Some(key) => {
                tables.keys.insert(key, version.id.clone());
            }
            None => {
                tables.roots.insert(version.story_id.clone(), version.id.clone());
            }
        }
        tables.versions.insert(version.id.clone(), version.clone());
        Ok((version, true))
    }

    async fn compare_and_set_frontier(
        &self,
        id: &VersionId,
        expected: &SeqId,
        frontier: Frontier,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let version = tables.versions.get_mut(id).ok_or_else(|| RepositoryError::Missing {
            key: id.to_string(),
        })?;
        if &version.frontier.current_seq_id != expected {
            return Ok(false);
        }
        version.frontier = frontier;
        Ok(true)
    }

    async fn increment_visits(&self, id: &VersionId) -> Result<u64, RepositoryError> {
        let mut tables = self.tables.write().await;
        let version = tables.versions.get_mut(id).ok_or_else(|| RepositoryError::Missing {
            key: id.to_string(),
        })?;
        version.visit_count += 1;
        Ok(version.visit_count)
    }

    async fn list_for_story(&self, story_id: &StoryId) -> Result<Vec<BranchVersion>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .versions
            .values()
            .filter(|v| &v.story_id == story_id)
            .cloned()
            .collect())
    }

    async fn remove_story(&self, story_id: &StoryId) -> Result<usize, RepositoryError> {
        let mut tables = self.tables.write().await;
        let doomed: Vec<BranchVersion> = tables
            .versions
            .values()
            .filter(|v| &v.story_id == story_id)
            .cloned()
            .collect();
        for version in &doomed {
            if let Some(key) = version.fork_key() {
                tables.keys.remove(&key);
            }
            tables.versions.remove(&version.id);
        }
        tables.roots.remove(story_id);
        Ok(doomed.len())
    }
}

/// In-memory progress table
#[derive(Default)]
pub struct InMemoryProgressRepository {
    rows: RwLock<HashMap<(ViewerId, StoryId), ViewerProgress>>,
}

impl InMemoryProgressRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressRepository for InMemoryProgressRepository {
    async fn upsert(&self, progress: &ViewerProgress) -> Result<(), RepositoryError> {
        self.rows.write().await.insert(
            (progress.viewer_id.clone(), progress.story_id.clone()),
            progress.clone(),
        );
        Ok(())
    }

    async fn get(
        &self,
        viewer_id: &ViewerId,
        story_id: &StoryId,
    ) -> Result<Option<ViewerProgress>, RepositoryError> {
        Ok(self
            .rows
            .read()
            .await
            .get(&(viewer_id.clone(), story_id.clone()))
            .cloned())
    }

    async fn delete(&self, viewer_id: &ViewerId, story_id: &StoryId) -> Result<bool, RepositoryError> {
        Ok(self
            .rows
            .write()
            .await
            .remove(&(viewer_id.clone(), story_id.clone()))
            .is_some())
    }
}

/// Progress rows stored as one JSON file per (viewer, story)
pub struct JsonProgressRepository {
    base_path: PathBuf,
}

impl JsonProgressRepository {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn progress_path(&self, viewer_id: &ViewerId, story_id: &StoryId) -> PathBuf {
        self.base_path
            .join(hashed_name(&format!("{viewer_id}\u{1f}{story_id}"), "progress.json"))
    }
}

#[async_trait]
impl ProgressRepository for JsonProgressRepository {
    async fn upsert(&self, progress: &ViewerProgress) -> Result<(), RepositoryError> {
        let path = self.progress_path(&progress.viewer_id, &progress.story_id);
        write_json(&self.base_path, &path, progress).await
    }

    async fn get(
        &self,
        viewer_id: &ViewerId,
        story_id: &StoryId,
    ) -> Result<Option<ViewerProgress>, RepositoryError> {
        read_json(&self.progress_path(viewer_id, story_id)).await
    }

    async fn delete(&self, viewer_id: &ViewerId, story_id: &StoryId) -> Result<bool, RepositoryError> {
        remove_file(&self.progress_path(viewer_id, story_id)).await
    }
}

/// File name for a record keyed by an outside id.
/// Ids come from outside; hash them so they never form a path.
fn hashed_name(key: &str, suffix: &str) -> String {
    format!("{:x}.{suffix}", md5::compute(key))
}

/// Write `value` as pretty JSON, via a temp file and a rename so a crash
/// never leaves half a file behind
async fn write_json<T: Serialize + ?Sized>(dir: &Path, path: &Path, value: &T) -> Result<(), RepositoryError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RepositoryError::io(format!("Failed to create {}", dir.display()), e))?;

    let json = serde_json::to_string_pretty(value).map_err(|e| RepositoryError::SerializationError {
        message: format!("Failed to serialize {}: {e}", path.display()),
    })?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| RepositoryError::io(format!("Failed to write {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| RepositoryError::io(format!("Failed to replace {}", path.display()), e))
}

/// Read a JSON file; a missing file is `None`
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RepositoryError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(RepositoryError::io(
                format!("Failed to read {}", path.display()),
                e,
            ));
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| RepositoryError::SerializationError {
            message: format!("Failed to deserialize {}: {e}", path.display()),
        })
}

async fn remove_file(path: &Path) -> Result<bool, RepositoryError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RepositoryError::io(
            format!("Failed to delete {}", path.display()),
            e,
        )),
    }
}

/// Files in `dir` whose name ends with `suffix`; a missing directory is empty
async fn files_ending_with(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>, RepositoryError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(RepositoryError::io(
                format!("Failed to list {}", dir.display()),
                e,
            ));
        }
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| RepositoryError::io(format!("Failed to list {}", dir.display()), e))?
    {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(suffix))
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

const EVENTS_SUFFIX: &str = "events.jsonl";
const VERSIONS_SUFFIX: &str = "versions.json";
const STORY_SUFFIX: &str = "story.json";

/// Event graph kept as one append-only JSON-lines file per story
///
/// Lookups are served from an in-memory index rebuilt by [`open`](Self::open);
/// every insert is appended to disk before it becomes visible.
pub struct JsonEventRepository {
    base_path: PathBuf,
    index: InMemoryEventRepository,
    writes: Mutex<()>,
}

impl JsonEventRepository {
    /// Load every story graph found below `base_path`
    pub async fn open<P: Into<PathBuf>>(base_path: P) -> Result<Self, RepositoryError> {
        let base_path = base_path.into();
        let index = InMemoryEventRepository::new();
        for path in files_ending_with(&base_path, EVENTS_SUFFIX).await? {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| RepositoryError::io(format!("Failed to read {}", path.display()), e))?;
            for (number, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let stored: StoredEvent =
                    serde_json::from_str(line).map_err(|e| RepositoryError::SerializationError {
                        message: format!("{}:{}: {e}", path.display(), number + 1),
                    })?;
                index.insert(stored).await?;
            }
        }
        if !index.is_empty().await {
            info!("Loaded {} events from {}", index.len().await, base_path.display());
        }
        Ok(Self {
            base_path,
            index,
            writes: Mutex::new(()),
        })
    }

    fn story_path(&self, story_id: &StoryId) -> PathBuf {
        self.base_path.join(hashed_name(story_id.as_str(), EVENTS_SUFFIX))
    }

    async fn append_line(&self, stored: &StoredEvent) -> Result<(), RepositoryError> {
        tokio::fs::create_dir_all(&self.base_path).await.map_err(|e| {
            RepositoryError::io(format!("Failed to create {}", self.base_path.display()), e)
        })?;
        let mut line = serde_json::to_string(stored).map_err(|e| RepositoryError::SerializationError {
            message: format!("Failed to serialize event '{}': {e}", stored.event.seq_id),
        })?;
        line.push('\n');

        let path = self.story_path(&stored.event.story_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| RepositoryError::io(format!("Failed to open {}", path.display()), e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RepositoryError::io(format!("Failed to append to {}", path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| RepositoryError::io(format!("Failed to flush {}", path.display()), e))
    }
}

#[async_trait]
impl EventRepository for JsonEventRepository {
    async fn insert(&self, stored: StoredEvent) -> Result<(), RepositoryError> {
        let _write = self.writes.lock().await;
        let seq_id = &stored.event.seq_id;
        if self.index.get(seq_id).await?.is_some() {
            return Err(RepositoryError::Conflict {
                key: seq_id.to_string(),
            });
        }
        for target in stored.event.successors() {
            if self.index.pointer_owner(target).await?.is_some() {
                return Err(RepositoryError::Conflict {
                    key: format!("pointer to {target}"),
                });
            }
        }
        self.append_line(&stored).await?;
        self.index.insert(stored).await
    }

    async fn get(&self, seq_id: &SeqId) -> Result<Option<StoredEvent>, RepositoryError> {
        self.index.get(seq_id).await
    }

    async fn pointer_owner(&self, target: &SeqId) -> Result<Option<SeqId>, RepositoryError> {
        self.index.pointer_owner(target).await
    }

    async fn start_of(&self, story_id: &StoryId) -> Result<Option<SeqId>, RepositoryError> {
        self.index.start_of(story_id).await
    }

    async fn remove_story(&self, story_id: &StoryId) -> Result<usize, RepositoryError> {
        let _write = self.writes.lock().await;
        remove_file(&self.story_path(story_id)).await?;
        self.index.remove_story(story_id).await
    }
}

/// Branch versions kept as one JSON snapshot per story, rewritten on change
pub struct JsonVersionRepository {
    base_path: PathBuf,
    index: InMemoryVersionRepository,
    writes: Mutex<()>,
}

impl JsonVersionRepository {
    pub async fn open<P: Into<PathBuf>>(base_path: P) -> Result<Self, RepositoryError> {
        let base_path = base_path.into();
        let index = InMemoryVersionRepository::new();
        let mut loaded = 0;
        for path in files_ending_with(&base_path, VERSIONS_SUFFIX).await? {
            let versions: Vec<BranchVersion> = read_json(&path).await?.unwrap_or_default();
            for version in versions {
                index.insert_unique(version).await?;
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!("Loaded {loaded} branch versions from {}", base_path.display());
        }
        Ok(Self {
            base_path,
            index,
            writes: Mutex::new(()),
        })
    }

    fn story_path(&self, story_id: &StoryId) -> PathBuf {
        self.base_path.join(hashed_name(story_id.as_str(), VERSIONS_SUFFIX))
    }

    async fn persist(&self, story_id: &StoryId) -> Result<(), RepositoryError> {
        let mut versions = self.index.list_for_story(story_id).await?;
        versions.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        write_json(&self.base_path, &self.story_path(story_id), &versions).await?;
        debug!("Saved {} versions of story '{story_id}'", versions.len());
        Ok(())
    }
}

#[async_trait]
impl VersionRepository for JsonVersionRepository {
    async fn get(&self, id: &VersionId) -> Result<Option<BranchVersion>, RepositoryError> {
        self.index.get(id).await
    }

    async fn find_by_key(&self, key: &ForkKey) -> Result<Option<BranchVersion>, RepositoryError> {
        self.index.find_by_key(key).await
    }

    async fn root_of(&self, story_id: &StoryId) -> Result<Option<BranchVersion>, RepositoryError> {
        self.index.root_of(story_id).await
    }

    async fn insert_unique(
        &self,
        version: BranchVersion,
    ) -> Result<(BranchVersion, bool), RepositoryError> {
        let _write = self.writes.lock().await;
        let story_id = version.story_id.clone();
        let (stored, created) = self.index.insert_unique(version).await?;
        if created {
            self.persist(&story_id).await?;
        }
        Ok((stored, created))
    }

    async fn compare_and_set_frontier(
        &self,
        id: &VersionId,
        expected: &SeqId,
        frontier: Frontier,
    ) -> Result<bool, RepositoryError> {
        let _write = self.writes.lock().await;
        if !self.index.compare_and_set_frontier(id, expected, frontier).await? {
            return Ok(false);
        }
        if let Some(version) = self.index.get(id).await? {
            self.persist(&version.story_id).await?;
        }
        Ok(true)
    }

    async fn increment_visits(&self, id: &VersionId) -> Result<u64, RepositoryError> {
        let _write = self.writes.lock().await;
        let visits = self.index.increment_visits(id).await?;
        if let Some(version) = self.index.get(id).await? {
            self.persist(&version.story_id).await?;
        }
        Ok(visits)
    }

    async fn list_for_story(&self, story_id: &StoryId) -> Result<Vec<BranchVersion>, RepositoryError> {
        self.index.list_for_story(story_id).await
    }

    async fn remove_story(&self, story_id: &StoryId) -> Result<usize, RepositoryError> {
        let _write = self.writes.lock().await;
        remove_file(&self.story_path(story_id)).await?;
        self.index.remove_story(story_id).await
    }
}

/// Story catalog kept as one JSON file per story
pub struct JsonStoryRepository {
    base_path: PathBuf,
    index: InMemoryStoryRepository,
    writes: Mutex<()>,
}

impl JsonStoryRepository {
    pub async fn open<P: Into<PathBuf>>(base_path: P) -> Result<Self, RepositoryError> {
        let base_path = base_path.into();
        let index = InMemoryStoryRepository::new();
        for path in files_ending_with(&base_path, STORY_SUFFIX).await? {
            if let Some(story) = read_json::<Story>(&path).await? {
                index.insert(story).await?;
            }
        }
        Ok(Self {
            base_path,
            index,
            writes: Mutex::new(()),
        })
    }

    fn story_path(&self, story_id: &StoryId) -> PathBuf {
        self.base_path.join(hashed_name(story_id.as_str(), STORY_SUFFIX))
    }

    async fn persist(&self, story_id: &StoryId) -> Result<(), RepositoryError> {
        let story = self.index.get(story_id).await?.ok_or_else(|| RepositoryError::Missing {
            key: story_id.to_string(),
        })?;
        write_json(&self.base_path, &self.story_path(story_id), &story).await
    }
}

#[async_trait]
impl StoryRepository for JsonStoryRepository {
    async fn insert(&self, story: Story) -> Result<(), RepositoryError> {
        let _write = self.writes.lock().await;
        let story_id = story.id.clone();
        self.index.insert(story).await?;
        if let Err(e) = self.persist(&story_id).await {
            self.index.remove(&story_id).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, id: &StoryId) -> Result<Option<Story>, RepositoryError> {
        self.index.get(id).await
    }

    async fn update_status(
        &self,
        id: &StoryId,
        status: StoryStatus,
        error_message: Option<String>,
    ) -> Result<(), RepositoryError> {
        let _write = self.writes.lock().await;
        self.index.update_status(id, status, error_message).await?;
        self.persist(id).await
    }

    async fn remove(&self, id: &StoryId) -> Result<bool, RepositoryError> {
        let _write = self.writes.lock().await;
        remove_file(&self.story_path(id)).await?;
        self.index.remove(id).await
    }
}

/// In-memory story catalog
#[derive(Default)]
pub struct InMemoryStoryRepository {
    stories: RwLock<HashMap<StoryId, Story>>,
}

impl InMemoryStoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoryRepository for InMemoryStoryRepository {
    async fn insert(&self, story: Story) -> Result<(), RepositoryError> {
        let mut stories = self.stories.write().await;
        if stories.contains_key(&story.id) {
            return Err(RepositoryError::Conflict {
                key: story.id.to_string(),
            });
        }
        stories.insert(story.id.clone(), story);
        Ok(())
    }

    async fn get(&self, id: &StoryId) -> Result<Option<Story>, RepositoryError> {
        Ok(self.stories.read().await.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &StoryId,
        status: StoryStatus,
        error_message: Option<String>,
    ) -> Result<(), RepositoryError> {
        let mut stories = self.stories.write().await;
        let story = stories.get_mut(id).ok_or_else(|| RepositoryError::Missing {
            key: id.to_string(),
        })?;
        story.status = status;
        story.error_message = error_message;
        Ok(())
    }

    async fn remove(&self, id: &StoryId) -> Result<bool, RepositoryError> {
        Ok(self.stories.write().await.remove(id).is_some())
    }
}
