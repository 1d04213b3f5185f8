use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Output dimensionality of the face encoder. Profiles of any other length
/// are never admitted to the match index.
pub const EMBEDDING_DIM: usize = 128;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Opaque reference to a person on the roster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityRef(pub String);

impl IdentityRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Roster entry as owned by the roster collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityRef,
    pub name: String,
    pub roll: Option<String>,
}

/// Face embedding vector (128-dimensional for the production encoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// True when the vector has exactly [`EMBEDDING_DIM`] components.
    pub fn has_expected_dim(&self) -> bool {
        self.values.len() == EMBEDDING_DIM
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// The active enrolled profile for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceProfile {
    pub identity: IdentityRef,
    pub name: String,
    pub roll: Option<String>,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
    /// Which extractor produced the embedding (e.g. "face_encoder").
    pub feature_type: String,
    pub quality_score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.5; EMBEDDING_DIM]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_expected_dim() {
        assert!(Embedding::new(vec![0.0; EMBEDDING_DIM]).has_expected_dim());
        assert!(!Embedding::new(vec![0.0; 512]).has_expected_dim());
        assert!(!Embedding::new(vec![]).has_expected_dim());
    }

    #[test]
    fn test_identity_ref_serializes_as_string() {
        let id = IdentityRef::from("S1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"S1\"");
    }
}
