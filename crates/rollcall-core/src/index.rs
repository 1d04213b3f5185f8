//! In-memory match index over enrolled face profiles.
//!
//! The index is a read-optimized cache of the profile store. Every rebuild
//! materializes a brand new [`IndexSnapshot`] and swaps it in behind a lock,
//! so a reader holding an `Arc<IndexSnapshot>` always sees embeddings and
//! labels that belong together.

use crate::types::{Embedding, FaceProfile, IdentityRef};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Who an index row belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileLabel {
    pub identity: IdentityRef,
    pub name: String,
    pub roll: Option<String>,
}

/// Immutable snapshot of all valid enrolled embeddings with parallel labels.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    embeddings: Vec<Embedding>,
    labels: Vec<ProfileLabel>,
    generation: u64,
}

impl IndexSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot, dropping profiles whose embedding has the wrong
    /// dimensionality.
    pub fn from_profiles(profiles: impl IntoIterator<Item = FaceProfile>, generation: u64) -> Self {
        let mut embeddings = Vec::new();
        let mut labels = Vec::new();

        for profile in profiles {
            if !profile.embedding.has_expected_dim() {
                tracing::warn!(
                    identity = %profile.identity,
                    dim = profile.embedding.values.len(),
                    "skipping profile with invalid embedding shape"
                );
                continue;
            }
            embeddings.push(profile.embedding);
            labels.push(ProfileLabel {
                identity: profile.identity,
                name: profile.name,
                roll: profile.roll,
            });
        }

        Self {
            embeddings,
            labels,
            generation,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn labels(&self) -> &[ProfileLabel] {
        &self.labels
    }

    /// Rebuild counter this snapshot was produced by (0 = never built).
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Atomically swapped holder of the current [`IndexSnapshot`].
pub struct MatchIndex {
    current: RwLock<Arc<IndexSnapshot>>,
    next_generation: AtomicU64,
}

impl Default for MatchIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchIndex {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(IndexSnapshot::empty())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Latest snapshot, or an empty one if nothing has been built yet.
    pub fn current(&self) -> Arc<IndexSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Load all profiles and install a fresh snapshot.
    ///
    /// The generation is taken before `load` runs. When two rebuilds race,
    /// the one that read the store later wins; an older snapshot never
    /// replaces a newer one. A failing `load` leaves the current snapshot
    /// untouched.
    pub fn rebuild_with<E>(
        &self,
        load: impl FnOnce() -> Result<Vec<FaceProfile>, E>,
    ) -> Result<Arc<IndexSnapshot>, E> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let profiles = load()?;
        let snapshot = Arc::new(IndexSnapshot::from_profiles(profiles, generation));

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if snapshot.generation > current.generation {
            *current = Arc::clone(&snapshot);
            tracing::info!(generation, profiles = snapshot.len(), "match index rebuilt");
            Ok(snapshot)
        } else {
            tracing::debug!(
                generation,
                installed = current.generation,
                "discarding stale index rebuild"
            );
            Ok(Arc::clone(&current))
        }
    }

    /// Install a snapshot built from an in-memory profile list.
    pub fn rebuild(&self, profiles: Vec<FaceProfile>) -> Arc<IndexSnapshot> {
        match self.rebuild_with(|| Ok::<_, std::convert::Infallible>(profiles)) {
            Ok(snapshot) => snapshot,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMBEDDING_DIM;
    use chrono::Utc;

    fn profile(id: &str, fill: f32, dim: usize) -> FaceProfile {
        FaceProfile {
            identity: IdentityRef::from(id),
            name: format!("name-{id}"),
            roll: Some(format!("R{id}")),
            embedding: Embedding::new(vec![fill; dim]),
            created_at: Utc::now(),
            feature_type: "face_encoder".into(),
            quality_score: 100.0,
        }
    }

    #[test]
    fn test_current_is_empty_before_first_build() {
        let index = MatchIndex::new();
        let snap = index.current();
        assert!(snap.is_empty());
        assert_eq!(snap.generation(), 0);
    }

    #[test]
    fn test_rebuild_replaces_snapshot() {
        let index = MatchIndex::new();
        index.rebuild(vec![profile("a", 0.1, EMBEDDING_DIM)]);
        assert_eq!(index.current().len(), 1);

        index.rebuild(vec![
            profile("a", 0.1, EMBEDDING_DIM),
            profile("b", 0.2, EMBEDDING_DIM),
        ]);
        let snap = index.current();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.labels()[1].identity.as_str(), "b");
    }

    #[test]
    fn test_wrong_dimension_excluded() {
        let index = MatchIndex::new();
        let snap = index.rebuild(vec![
            profile("ok", 0.1, EMBEDDING_DIM),
            profile("short", 0.1, 64),
            profile("empty", 0.1, 0),
        ]);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.labels().len(), snap.embeddings().len());
        assert_eq!(snap.labels()[0].identity.as_str(), "ok");
    }

    #[test]
    fn test_old_reader_keeps_its_snapshot() {
        let index = MatchIndex::new();
        index.rebuild(vec![profile("a", 0.1, EMBEDDING_DIM)]);
        let held = index.current();

        index.rebuild(vec![]);
        assert_eq!(held.len(), 1);
        assert!(index.current().is_empty());
    }

    #[test]
    fn test_failed_load_keeps_current() {
        let index = MatchIndex::new();
        index.rebuild(vec![profile("a", 0.1, EMBEDDING_DIM)]);

        let result = index.rebuild_with(|| Err::<Vec<FaceProfile>, _>("disk gone"));
        assert!(result.is_err());
        assert_eq!(index.current().len(), 1);
    }

    #[test]
    fn test_stale_rebuild_does_not_win() {
        let index = MatchIndex::new();
        // The outer rebuild takes its generation first, then a newer rebuild
        // completes while it is still loading.
        let outer = index
            .rebuild_with(|| {
                index.rebuild(vec![
                    profile("a", 0.1, EMBEDDING_DIM),
                    profile("b", 0.2, EMBEDDING_DIM),
                ]);
                Ok::<_, ()>(vec![profile("a", 0.1, EMBEDDING_DIM)])
            })
            .unwrap();

        assert_eq!(outer.len(), 2);
        assert_eq!(index.current().len(), 2);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_pairs() {
        let index = Arc::new(MatchIndex::new());
        let writer = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for n in 0..50 {
                    let profiles = (0..n)
                        .map(|i| profile(&i.to_string(), i as f32, EMBEDDING_DIM))
                        .collect();
                    index.rebuild(profiles);
                }
            })
        };

        for _ in 0..200 {
            let snap = index.current();
            assert_eq!(snap.embeddings().len(), snap.labels().len());
            for (emb, label) in snap.embeddings().iter().zip(snap.labels()) {
                let expected: f32 = label.identity.as_str().parse().unwrap();
                assert_eq!(emb.values[0], expected);
            }
        }
        writer.join().unwrap();
    }
}
