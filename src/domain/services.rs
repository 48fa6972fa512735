//! Domain services - Whole-graph rules that don't fit a single entity

use crate::domain::entities::{Event, EventShape};
use crate::domain::errors::DomainError;
use crate::domain::value_objects::{BranchTag, SeqId, StoryId};
use std::collections::{HashMap, HashSet};

/// Successor pointer whose target has not been generated yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGeneration {
    pub owner: SeqId,
    pub target: SeqId,
    pub branch_tag: BranchTag,
}

/// Summary of a validated story graph
#[derive(Debug, Clone, PartialEq)]
pub struct GraphReport {
    pub story_id: StoryId,
    pub start: SeqId,
    pub event_count: usize,
    pub decision_count: usize,
    pub terminal_count: usize,
    /// Longest start-to-leaf path, in events
    pub max_depth: usize,
    pub pending: Vec<PendingGeneration>,
}

/// Validates an exported or hand-written story graph before it is loaded
///
/// Checks id uniqueness, the single-predecessor tree shape, acyclicity and that
/// every event is reachable from the start. Pointers to events that do not
/// exist are not errors: they are reported as pending generation requests.
pub struct GraphValidator;

impl GraphValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, events: &[Event]) -> Result<GraphReport, DomainError> {
        let first = events
            .first()
            .ok_or_else(|| DomainError::Storage {
                reason: "empty story graph".to_string(),
            })?;
        let story_id = first.story_id.clone();

        let mut by_id: HashMap<&SeqId, &Event> = HashMap::with_capacity(events.len());
        for event in events {
            event.validate_shape()?;
            if event.story_id != story_id {
                return Err(DomainError::invalid_event(
                    &event.seq_id,
                    format!("belongs to story '{}', expected '{}'", event.story_id, story_id),
                ));
            }
            if by_id.insert(&event.seq_id, event).is_some() {
                return Err(DomainError::DuplicateSeqId {
                    seq_id: event.seq_id.clone(),
                });
            }
        }

        let mut predecessor: HashMap<&SeqId, &SeqId> = HashMap::new();
        let mut pending = Vec::new();
        for event in events {
            for (target, tag) in Self::pointers(event) {
                if let Some(previous) = predecessor.insert(target, &event.seq_id) {
                    return Err(DomainError::invalid_event(
                        target,
                        format!("reached from both '{}' and '{}'", previous, event.seq_id),
                    ));
                }
                if !by_id.contains_key(target) {
                    pending.push(PendingGeneration {
                        owner: event.seq_id.clone(),
                        target: target.clone(),
                        branch_tag: tag.clone(),
                    });
                }
            }
        }

        let starts: Vec<&SeqId> = events
            .iter()
            .map(|e| &e.seq_id)
            .filter(|id| !predecessor.contains_key(id))
            .collect();
        let start = match starts.as_slice() {
            [only] => (*only).clone(),
            [] => {
                return Err(DomainError::invalid_event(
                    &first.seq_id,
                    "graph has no start event (cycle through the start)",
                ));
            }
            [_, second, ..] => {
                return Err(DomainError::invalid_event(
                    second,
                    "event has no predecessor but is not the story start",
                ));
            }
        };

        // Walk from the start; with one predecessor per node, anything unvisited
        // afterwards sits on a cycle.
        let mut visited: HashSet<&SeqId> = HashSet::with_capacity(events.len());
        let mut stack = vec![(&start, 1usize)];
        let mut max_depth = 0;
        let (mut decision_count, mut terminal_count) = (0, 0);
        while let Some((id, depth)) = stack.pop() {
            let Some(event) = by_id.get(id).copied() else {
                continue;
            };
            if !visited.insert(&event.seq_id) {
                return Err(DomainError::invalid_event(id, "cycle detected"));
            }
            max_depth = max_depth.max(depth);
            match event.shape() {
                EventShape::Decision(_) => decision_count += 1,
                EventShape::Terminal => terminal_count += 1,
                EventShape::Linear(_) => {}
            }
            for next in event.successors() {
                stack.push((next, depth + 1));
            }
        }
        if let Some(unreached) = events.iter().find(|e| !visited.contains(&e.seq_id)) {
            return Err(DomainError::invalid_event(
                &unreached.seq_id,
                "not reachable from the story start (cycle)",
            ));
        }

        Ok(GraphReport {
            story_id,
            start,
            event_count: events.len(),
            decision_count,
            terminal_count,
            max_depth,
            pending,
        })
    }

    fn pointers(event: &Event) -> Vec<(&SeqId, &BranchTag)> {
        match event.shape() {
            EventShape::Linear(next) => vec![(next, &event.branch_tag)],
            EventShape::Decision(options) => options
                .iter()
                .map(|o| (&o.next_seq_id, &o.branch_tag))
                .collect(),
            EventShape::Terminal => Vec::new(),
        }
    }
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new()
    }
}
