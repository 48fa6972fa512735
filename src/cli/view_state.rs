//! View state for the console renderer
//!
//! Tracks what is on screen (chapter, scene, background, music) so only
//! changes are printed.

use crate::client::prefetch::AssetStatus;
use crate::domain::entities::Event;
use crate::domain::value_objects::{EventType, ResourceKind, ResourceRef};

/// Current visual and audio state of the console player
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub chapter_id: Option<String>,
    pub scene_id: Option<String>,
    pub background: Option<String>,
    pub music: Option<String>,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event and return what changed
    pub fn apply(&mut self, event: &Event, assets: &[(ResourceRef, AssetStatus)]) -> RenderDelta {
        let mut delta = RenderDelta::default();

        if event.chapter_id.is_some() && event.chapter_id != self.chapter_id {
            self.chapter_id = event.chapter_id.clone();
            delta.new_chapter = self.chapter_id.clone();
        }
        if event.scene_id.is_some() && event.scene_id != self.scene_id {
            self.scene_id = event.scene_id.clone();
            delta.new_scene = self.scene_id.clone();
        }

        for (resource, status) in assets {
            let label = match status {
                AssetStatus::Ready(_) => resource.url.clone(),
                AssetStatus::Unavailable => format!("{} (unavailable)", resource.url),
            };
            match resource.kind {
                ResourceKind::Image => {
                    if self.background.as_ref() != Some(&resource.url) {
                        self.background = Some(resource.url.clone());
                        delta.effects.push(format!("Background: {label}"));
                    }
                }
                ResourceKind::Audio if event.event_type == EventType::PlayAudio => {
                    if self.music.as_ref() != Some(&resource.url) {
                        self.music = Some(resource.url.clone());
                        delta.effects.push(format!("Music: {label}"));
                    }
                }
                ResourceKind::Audio => delta.effects.push(format!("Sound: {label}")),
                ResourceKind::Video => delta.effects.push(format!("Video: {label}")),
                // Voice lines are implied by the dialogue itself.
                ResourceKind::Voice => {}
            }
        }
        delta
    }
}

/// What needs to be printed for one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderDelta {
    pub new_chapter: Option<String>,
    pub new_scene: Option<String>,
    pub effects: Vec<String>,
}

impl RenderDelta {
    pub fn is_empty(&self) -> bool {
        self.new_chapter.is_none() && self.new_scene.is_none() && self.effects.is_empty()
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(chapter) = &self.new_chapter {
            lines.push(format!("### Chapter: {chapter} ###"));
        }
        if let Some(scene) = &self.new_scene {
            lines.push(format!("=== Scene: {scene} ==="));
        }
        lines.extend(self.effects.iter().map(|e| format!("  [{e}]")));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{BranchTag, StoryId};
    use std::sync::Arc;

    fn scene_start(scene: &str) -> Event {
        Event::linear(&StoryId::from("s1"), "E1", EventType::SceneStart, &BranchTag::root(), "E2")
            .with_position(Some("c1"), Some(scene))
    }

    fn image(url: &str) -> (ResourceRef, AssetStatus) {
        (ResourceRef::new(ResourceKind::Image, url), AssetStatus::Ready(Arc::from(vec![1u8])))
    }

    #[test]
    fn only_changes_are_reported() {
        let mut view = ViewState::new();
        let delta = view.apply(&scene_start("s1"), &[image("asset://bg/a.png")]);
        assert_eq!(delta.new_chapter.as_deref(), Some("c1"));
        assert_eq!(delta.new_scene.as_deref(), Some("s1"));
        assert_eq!(delta.effects, vec!["Background: asset://bg/a.png"]);

        let again = view.apply(&scene_start("s1"), &[image("asset://bg/a.png")]);
        assert!(again.is_empty());
    }

    #[test]
    fn unavailable_assets_are_marked() {
        let mut view = ViewState::new();
        let missing = (ResourceRef::new(ResourceKind::Image, "asset://bg/x.png"), AssetStatus::Unavailable);
        let delta = view.apply(&scene_start("s2"), &[missing]);
        assert!(delta.lines().iter().any(|l| l.contains("(unavailable)")));
    }
}
