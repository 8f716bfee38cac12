//! Reference face store.
//!
//! Maps an identity name to the face resolved for it during bootstrap.
//! Each pipeline owns its own store; nothing here is shared between runs.

use crate::types::Face;
use std::collections::HashMap;

/// Identity under which the reference picked from the target is stored.
pub const REFERENCE_ORIGIN: &str = "origin";

#[derive(Debug, Clone, Default)]
pub struct FaceStore {
    entries: HashMap<String, Face>,
}

impl FaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &str) -> Option<&Face> {
        self.entries.get(identity)
    }

    /// Insert or overwrite the entry for `identity`.
    pub fn put(&mut self, identity: &str, face: Face) {
        if self.entries.insert(identity.to_string(), face).is_some() {
            tracing::debug!(identity, "reference face replaced");
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn has_any(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All stored reference faces, in no particular order.
    pub fn faces(&self) -> impl Iterator<Item = &Face> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};

    fn face(seed: f32) -> Face {
        Face {
            bbox: BoundingBox { x: seed, y: seed, width: 10.0, height: 10.0 },
            landmarks: [(seed, seed); 5],
            embedding: Embedding::new(vec![seed, 1.0]).normalized(),
            score: 0.9,
            attributes: None,
        }
    }

    #[test]
    fn test_put_then_get_returns_equal_face() {
        let mut store = FaceStore::new();
        store.put(REFERENCE_ORIGIN, face(1.0));
        assert_eq!(store.get(REFERENCE_ORIGIN), Some(&face(1.0)));
        assert!(store.has_any());
    }

    #[test]
    fn test_put_overwrites_not_merges() {
        let mut store = FaceStore::new();
        store.put("a", face(1.0));
        store.put("a", face(2.0));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a"), Some(&face(2.0)));
    }

    #[test]
    fn test_clear_empties_every_identity() {
        let mut store = FaceStore::new();
        for name in ["origin", "face_swapper", "face_enhancer"] {
            store.put(name, face(3.0));
        }
        assert_eq!(store.len(), 3);
        store.clear();
        for name in ["origin", "face_swapper", "face_enhancer", "other"] {
            assert!(store.get(name).is_none());
        }
        assert!(!store.has_any());
    }
}
