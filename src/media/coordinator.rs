//! Playback coordinator implementation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

/// Identifier of a mounted media element.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Debug for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElementId({})", self.0)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Public view of a registered element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRegistration {
    pub element_id: ElementId,
    pub autoplay_intent: bool,
    pub is_playing: bool,
    pub viewport_visible: bool,
}

/// A transition the presentation layer must apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaybackChange {
    Started(ElementId),
    Stopped(ElementId),
}

#[derive(Debug)]
struct Element {
    autoplay: bool,
    visible: bool,
    /// Registration sequence number.
    registered: u64,
    /// Tick at which the element last entered the viewport.
    visible_since: u64,
    /// Paused by the user; cleared when it re-enters the viewport.
    suppressed: bool,
}

#[derive(Debug, Default)]
struct Arbiter {
    elements: HashMap<ElementId, Element>,
    playing: Option<ElementId>,
    pinned: Option<ElementId>,
    next_registration: u64,
    tick: u64,
}

impl Arbiter {
    fn eligible(&self, id: &ElementId, element: &Element) -> bool {
        if !element.visible || element.suppressed {
            return false;
        }
        element.autoplay || self.pinned.as_ref() == Some(id)
    }

    fn select(&self) -> Option<ElementId> {
        if let Some(pinned) = &self.pinned {
            if let Some(element) = self.elements.get(pinned) {
                if self.eligible(pinned, element) {
                    return Some(pinned.clone());
                }
            }
        }

        self.elements
            .iter()
            .filter(|(id, element)| self.eligible(id, element))
            .max_by(|(_, a), (_, b)| {
                a.visible_since
                    .cmp(&b.visible_since)
                    .then(b.registered.cmp(&a.registered))
            })
            .map(|(id, _)| id.clone())
    }

    /// Re-run selection and report what changed.
    fn arbitrate(&mut self) -> Vec<PlaybackChange> {
        let next = self.select();
        if next == self.playing {
            return Vec::new();
        }

        let mut changes = Vec::with_capacity(2);
        if let Some(previous) = self.playing.take() {
            changes.push(PlaybackChange::Stopped(previous));
        }
        if let Some(id) = &next {
            trace!(element = %id, "selected for playback");
            changes.push(PlaybackChange::Started(id.clone()));
        }
        self.playing = next;
        changes
    }
}

/// Process-wide arbiter guaranteeing at most one playing element.
#[derive(Default)]
pub struct PlaybackCoordinator {
    inner: Mutex<Arbiter>,
}

impl PlaybackCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mounted element. It starts outside the viewport.
    ///
    /// Registering an id again only updates its autoplay intent.
    pub fn register(&self, id: ElementId, autoplay: bool) -> Vec<PlaybackChange> {
        let mut inner = self.inner.lock();
        if let Some(element) = inner.elements.get_mut(&id) {
            element.autoplay = autoplay;
        } else {
            let registered = inner.next_registration;
            inner.next_registration += 1;
            inner.elements.insert(
                id,
                Element {
                    autoplay,
                    visible: false,
                    registered,
                    visible_since: 0,
                    suppressed: false,
                },
            );
        }
        inner.arbitrate()
    }

    /// Remove an unmounted element; a successor starts in the same call.
    pub fn unregister(&self, id: &ElementId) -> Vec<PlaybackChange> {
        let mut inner = self.inner.lock();
        if inner.elements.remove(id).is_none() {
            debug!(element = %id, "unregister of unknown element");
            return Vec::new();
        }
        if inner.pinned.as_ref() == Some(id) {
            inner.pinned = None;
        }

        let mut changes = Vec::new();
        if inner.playing.as_ref() == Some(id) {
            inner.playing = None;
            changes.push(PlaybackChange::Stopped(id.clone()));
        }
        changes.extend(inner.arbitrate());
        changes
    }

    /// Report a viewport change.
    pub fn set_visible(&self, id: &ElementId, visible: bool) -> Vec<PlaybackChange> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(element) = inner.elements.get_mut(id) else {
            debug!(element = %id, "visibility of unknown element");
            return Vec::new();
        };
        if element.visible == visible {
            return Vec::new();
        }

        element.visible = visible;
        if visible {
            inner.tick += 1;
            element.visible_since = inner.tick;
            element.suppressed = false;
        } else if inner.pinned.as_ref() == Some(id) {
            inner.pinned = None;
        }
        inner.arbitrate()
    }

    pub fn set_autoplay_intent(&self, id: &ElementId, autoplay: bool) -> Vec<PlaybackChange> {
        let mut inner = self.inner.lock();
        match inner.elements.get_mut(id) {
            Some(element) => element.autoplay = autoplay,
            None => return Vec::new(),
        }
        inner.arbitrate()
    }

    /// User-initiated play. The element is preferred while it stays
    /// visible, whatever its autoplay intent.
    pub fn play(&self, id: &ElementId) -> Vec<PlaybackChange> {
        let mut inner = self.inner.lock();
        match inner.elements.get_mut(id) {
            Some(element) => element.suppressed = false,
            None => return Vec::new(),
        }
        inner.pinned = Some(id.clone());
        inner.arbitrate()
    }

    /// User-initiated pause. The element will not autoplay again until
    /// it leaves and re-enters the viewport.
    pub fn pause(&self, id: &ElementId) -> Vec<PlaybackChange> {
        let mut inner = self.inner.lock();
        match inner.elements.get_mut(id) {
            Some(element) => element.suppressed = true,
            None => return Vec::new(),
        }
        if inner.pinned.as_ref() == Some(id) {
            inner.pinned = None;
        }
        inner.arbitrate()
    }

    pub fn is_playing(&self, id: &ElementId) -> bool {
        self.inner.lock().playing.as_ref() == Some(id)
    }

    /// The element currently playing, if any.
    pub fn playing(&self) -> Option<ElementId> {
        self.inner.lock().playing.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().elements.is_empty()
    }

    /// All registrations in registration order.
    pub fn snapshot(&self) -> Vec<MediaRegistration> {
        let inner = self.inner.lock();
        let mut elements: Vec<_> = inner.elements.iter().collect();
        elements.sort_by_key(|(_, element)| element.registered);
        elements
            .into_iter()
            .map(|(id, element)| MediaRegistration {
                element_id: id.clone(),
                autoplay_intent: element.autoplay,
                is_playing: inner.playing.as_ref() == Some(id),
                viewport_visible: element.visible,
            })
            .collect()
    }
}
