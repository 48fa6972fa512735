//! Branch version manager - Fork points, frontiers and pioneer attribution

use crate::application::graph::EventStore;
use crate::domain::entities::{BranchVersion, ForkKey, ForkStep, Frontier};
use crate::domain::errors::{DomainError, RecordKind};
use crate::domain::repositories::VersionRepository;
use crate::domain::value_objects::{BranchTag, OptionId, SeqId, StoryId, VersionId, ViewerId};
use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;

pub struct BranchVersionManager {
    repository: Arc<dyn VersionRepository>,
    events: Arc<EventStore>,
}

impl BranchVersionManager {
    pub fn new(repository: Arc<dyn VersionRepository>, events: Arc<EventStore>) -> Self {
        Self { repository, events }
    }

    /// Root version with its frontier at the story start.
    /// Calling it again returns the existing root.
    pub async fn create_root(
        &self,
        story_id: &StoryId,
        viewer_id: &ViewerId,
    ) -> Result<BranchVersion, DomainError> {
        if let Some(existing) = self.repository.root_of(story_id).await? {
            return Ok(existing);
        }
        let start = self.events.get_start(story_id).await?;
        let root = BranchVersion {
            id: VersionId::root_of(story_id),
            story_id: story_id.clone(),
            parent_id: None,
            fork_seq_id: None,
            option_id: None,
            branch_tag: start.branch_tag.clone(),
            frontier: Frontier {
                current_seq_id: start.seq_id.clone(),
                current_type: start.event_type,
            },
            pioneer: viewer_id.clone(),
            visit_count: 1,
        };
        let (root, created) = self.repository.insert_unique(root).await?;
        if created {
            info!("Created root version '{}' of story '{}'", root.id, story_id);
        }
        Ok(root)
    }

    pub async fn get(&self, version_id: &VersionId) -> Result<BranchVersion, DomainError> {
        self.repository
            .get(version_id)
            .await?
            .ok_or_else(|| DomainError::not_found(RecordKind::Version, version_id))
    }

    pub async fn root_of(&self, story_id: &StoryId) -> Result<Option<BranchVersion>, DomainError> {
        Ok(self.repository.root_of(story_id).await?)
    }

    /// Move the frontier to `candidate` if it lies strictly further along the
    /// graph. Returns whether the frontier moved; replays are no-ops.
    pub async fn advance_frontier(
        &self,
        version_id: &VersionId,
        candidate: &SeqId,
    ) -> Result<bool, DomainError> {
        let event = self.events.get(candidate).await?;
        loop {
            let version = self.get(version_id).await?;
            // Each version only covers the events of its own branch.
            if event.branch_tag != version.branch_tag {
                return Ok(false);
            }
            let current = version.frontier.current_seq_id;
            if &current == candidate || !self.events.is_ahead(&current, candidate).await? {
                return Ok(false);
            }
            let frontier = Frontier {
                current_seq_id: candidate.clone(),
                current_type: event.event_type,
            };
            if self
                .repository
                .compare_and_set_frontier(version_id, &current, frontier)
                .await?
            {
                debug!("Frontier of '{version_id}' moved {current} -> {candidate}");
                return Ok(true);
            }
            // Lost the race; re-read and compare against the new frontier.
        }
    }

    /// Fork `parent` at a decision by one of its options, reusing the version
    /// when any viewer already took the same option from the same parent.
    pub async fn fork(
        &self,
        parent_id: &VersionId,
        fork_seq_id: &SeqId,
        option_id: &OptionId,
        pioneer: &ViewerId,
    ) -> Result<BranchVersion, DomainError> {
        let parent = self.get(parent_id).await?;
        let decision = match self.events.find(fork_seq_id).await? {
            Some(stored) => stored.event,
            None => {
                return Err(DomainError::invalid_fork(fork_seq_id, option_id, "no such event"));
            }
        };
        if decision.story_id != parent.story_id {
            return Err(DomainError::invalid_fork(
                fork_seq_id,
                option_id,
                format!("event belongs to story '{}'", decision.story_id),
            ));
        }
        if !decision.is_decision() {
            return Err(DomainError::invalid_fork(
                fork_seq_id,
                option_id,
                format!("'{}' is not a decision", decision.event_type),
            ));
        }
        let Some(option) = decision.option(option_id) else {
            return Err(DomainError::invalid_fork(fork_seq_id, option_id, "unknown option"));
        };

        let key = ForkKey {
            parent_id: parent_id.clone(),
            fork_seq_id: fork_seq_id.clone(),
            option_id: option_id.clone(),
        };
        let _guard = self.events.locks().acquire(&parent.story_id).await;
        if let Some(existing) = self.repository.find_by_key(&key).await? {
            return self.reuse(existing).await;
        }

        let frontier = match self.events.find(&option.next_seq_id).await? {
            Some(next) => Frontier {
                current_seq_id: next.event.seq_id,
                current_type: next.event.event_type,
            },
            // Not generated yet; the frontier moves once content appears.
            None => Frontier {
                current_seq_id: fork_seq_id.clone(),
                current_type: decision.event_type,
            },
        };
        let version = BranchVersion {
            id: VersionId::forked(&parent.story_id, parent_id, fork_seq_id, option_id),
            story_id: parent.story_id.clone(),
            parent_id: Some(parent_id.clone()),
            fork_seq_id: Some(fork_seq_id.clone()),
            option_id: Some(option_id.clone()),
            branch_tag: option.branch_tag.clone(),
            frontier,
            pioneer: pioneer.clone(),
            visit_count: 1,
        };
        let (version, created) = self.repository.insert_unique(version).await?;
        if !created {
            return self.reuse(version).await;
        }
        info!(
            "Viewer '{}' pioneered version '{}' ({} -> {})",
            pioneer, version.id, fork_seq_id, option_id
        );
        Ok(version)
    }

    async fn reuse(&self, mut version: BranchVersion) -> Result<BranchVersion, DomainError> {
        version.visit_count = self.repository.increment_visits(&version.id).await?;
        debug!("Reusing version '{}' (visits: {})", version.id, version.visit_count);
        Ok(version)
    }

    /// Root-first list of the choices leading to `version_id`
    pub async fn resolve_path(&self, version_id: &VersionId) -> Result<Vec<ForkStep>, DomainError> {
        let mut steps = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.get(version_id).await?;
        while let (Some(parent_id), Some(fork_seq_id), Some(option_id)) = (
            cursor.parent_id.clone(),
            cursor.fork_seq_id.clone(),
            cursor.option_id.clone(),
        ) {
            if !seen.insert(cursor.id.clone()) {
                return Err(DomainError::Storage {
                    reason: format!("version chain of '{version_id}' loops"),
                });
            }
            steps.push(ForkStep {
                version_id: cursor.id.clone(),
                fork_seq_id,
                option_id,
            });
            cursor = self.get(&parent_id).await?;
        }
        steps.reverse();
        Ok(steps)
    }

    pub async fn record_visit(&self, version_id: &VersionId) -> Result<u64, DomainError> {
        Ok(self.repository.increment_visits(version_id).await?)
    }

    /// All versions of a story, root first, then by fork point and option
    pub async fn versions_of(&self, story_id: &StoryId) -> Result<Vec<BranchVersion>, DomainError> {
        let mut versions = self.repository.list_for_story(story_id).await?;
        versions.sort_by(|a, b| {
            (!a.is_root(), &a.fork_seq_id, &a.option_id).cmp(&(!b.is_root(), &b.fork_seq_id, &b.option_id))
        });
        Ok(versions)
    }

    /// Branch tag a viewer on `version_id` should be playing
    pub async fn branch_tag_of(&self, version_id: &VersionId) -> Result<BranchTag, DomainError> {
        Ok(self.get(version_id).await?.branch_tag)
    }

    pub async fn remove_story(&self, story_id: &StoryId) -> Result<usize, DomainError> {
        Ok(self.repository.remove_story(story_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::graph::StoryLocks;
    use crate::domain::entities::{DecisionOption, Event};
    use crate::domain::value_objects::EventType;
    use crate::infrastructure::repositories::{InMemoryEventRepository, InMemoryVersionRepository};

    fn sid() -> StoryId {
        StoryId::from("s1")
    }

    async fn setup() -> (Arc<EventStore>, BranchVersionManager) {
        let events = Arc::new(EventStore::new(
            Arc::new(InMemoryEventRepository::new()),
            Arc::new(StoryLocks::new()),
        ));
        let root = BranchTag::root();
        events
            .append_all(vec![
                Event::linear(&sid(), "E1", EventType::StoryStart, &root, "E2"),
                Event::linear(&sid(), "E2", EventType::Narration, &root, "E3"),
                Event::decision(
                    &sid(),
                    "E3",
                    &root,
                    vec![
                        DecisionOption::new("optA", "Stay", "E4", "a"),
                        DecisionOption::new("optB", "Run", "E5", "b"),
                    ],
                ),
                Event::linear(&sid(), "E4", EventType::Dialogue, &BranchTag::from("a"), "E6"),
            ])
            .await
            .unwrap();
        let manager = BranchVersionManager::new(Arc::new(InMemoryVersionRepository::new()), events.clone());
        (events, manager)
    }

    #[tokio::test]
    async fn root_is_created_once() {
        let (_, manager) = setup().await;
        let first = manager.create_root(&sid(), &ViewerId::from("v1")).await.unwrap();
        let second = manager.create_root(&sid(), &ViewerId::from("v2")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.pioneer, ViewerId::from("v1"));
        assert_eq!(first.frontier.current_seq_id, SeqId::from("E1"));
    }

    #[tokio::test]
    async fn frontier_only_moves_forward() {
        let (_, manager) = setup().await;
        let root = manager.create_root(&sid(), &ViewerId::from("v1")).await.unwrap();

        assert!(manager.advance_frontier(&root.id, &SeqId::from("E3")).await.unwrap());
        assert!(!manager.advance_frontier(&root.id, &SeqId::from("E3")).await.unwrap());
        assert!(!manager.advance_frontier(&root.id, &SeqId::from("E2")).await.unwrap());

        let version = manager.get(&root.id).await.unwrap();
        assert_eq!(version.frontier.current_seq_id, SeqId::from("E3"));
        assert_eq!(version.frontier.current_type, EventType::Decision);
    }

    #[tokio::test]
    async fn fork_is_reused_for_the_same_option() {
        let (_, manager) = setup().await;
        let root = manager.create_root(&sid(), &ViewerId::from("v1")).await.unwrap();
        let (e3, opt_a, opt_b) = (SeqId::from("E3"), OptionId::from("optA"), OptionId::from("optB"));

        let a = manager.fork(&root.id, &e3, &opt_a, &ViewerId::from("v1")).await.unwrap();
        assert_eq!(a.frontier.current_seq_id, SeqId::from("E4"));
        assert_eq!(a.branch_tag, BranchTag::from("a"));

        let again = manager.fork(&root.id, &e3, &opt_a, &ViewerId::from("v2")).await.unwrap();
        assert_eq!(again.id, a.id);
        assert_eq!(again.pioneer, ViewerId::from("v1"));
        assert_eq!(again.frontier, a.frontier);
        assert_eq!(again.visit_count, 2);

        // E5 is not materialized: the frontier waits at the decision.
        let b = manager.fork(&root.id, &e3, &opt_b, &ViewerId::from("v3")).await.unwrap();
        assert_ne!(b.id, a.id);
        assert_eq!(b.frontier.current_seq_id, e3);
    }

    #[tokio::test]
    async fn fork_rejects_non_decisions_and_unknown_options() {
        let (_, manager) = setup().await;
        let root = manager.create_root(&sid(), &ViewerId::from("v1")).await.unwrap();
        let viewer = ViewerId::from("v1");

        let not_decision = manager
            .fork(&root.id, &SeqId::from("E2"), &OptionId::from("optA"), &viewer)
            .await
            .unwrap_err();
        assert!(matches!(not_decision, DomainError::InvalidFork { .. }));

        let unknown = manager
            .fork(&root.id, &SeqId::from("E3"), &OptionId::from("optZ"), &viewer)
            .await
            .unwrap_err();
        assert!(matches!(unknown, DomainError::InvalidFork { .. }));

        let missing_parent = manager
            .fork(&VersionId::from("nope"), &SeqId::from("E3"), &OptionId::from("optA"), &viewer)
            .await
            .unwrap_err();
        assert!(missing_parent.is_not_found());
    }

    #[tokio::test]
    async fn frontier_of_a_pending_fork_advances_when_content_appears() {
        let (events, manager) = setup().await;
        let root = manager.create_root(&sid(), &ViewerId::from("v1")).await.unwrap();
        let b = manager
            .fork(&root.id, &SeqId::from("E3"), &OptionId::from("optB"), &ViewerId::from("v1"))
            .await
            .unwrap();

        events
            .append(Event::terminal(&sid(), "E5", &BranchTag::from("b")))
            .await
            .unwrap();
        assert!(manager.advance_frontier(&b.id, &SeqId::from("E5")).await.unwrap());
        // The sibling branch is not ahead of this version's frontier.
        assert!(!manager.advance_frontier(&b.id, &SeqId::from("E4")).await.unwrap());
    }

    #[tokio::test]
    async fn resolve_path_lists_choices_root_first() {
        let (events, manager) = setup().await;
        let root = manager.create_root(&sid(), &ViewerId::from("v1")).await.unwrap();
        events
            .append(Event::decision(
                &sid(),
                "E6",
                &BranchTag::from("a"),
                vec![DecisionOption::new("deep", "Deeper", "E7", "a2")],
            ))
            .await
            .unwrap();
        let viewer = ViewerId::from("v1");
        let a = manager
            .fork(&root.id, &SeqId::from("E3"), &OptionId::from("optA"), &viewer)
            .await
            .unwrap();
        let deep = manager
            .fork(&a.id, &SeqId::from("E6"), &OptionId::from("deep"), &viewer)
            .await
            .unwrap();

        let path = manager.resolve_path(&deep.id).await.unwrap();
        let pairs: Vec<(&str, &str)> = path
            .iter()
            .map(|s| (s.fork_seq_id.as_str(), s.option_id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("E3", "optA"), ("E6", "deep")]);
        assert!(manager.resolve_path(&root.id).await.unwrap().is_empty());

        let listed = manager.versions_of(&sid()).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed[0].is_root());
    }
}
