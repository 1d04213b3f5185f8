//! rollcall-core: face matching and attendance adjudication engine.
//!
//! Quality-gates incoming images, encodes the first detected face into a
//! 128-dimensional embedding (SCRFD detection + ONNX encoder), matches it
//! against an atomically swapped in-memory index of enrolled profiles, and
//! decides whether a scheduled period may be marked.

pub mod alignment;
pub mod attendance;
pub mod descriptor;
pub mod detector;
pub mod encoder;
pub mod index;
pub mod matcher;
pub mod quality;
pub mod recognizer;
pub mod schedule;
pub mod types;

pub use attendance::{
    admit_period, AdjudicationError, AttendanceRecord, AttendanceStatus, Clock, InsertOutcome,
    MarkOutcome, SystemClock,
};
pub use encoder::{EncodeError, EncodedFace, FaceEncoder, OnnxFaceEncoder};
pub use index::{IndexSnapshot, MatchIndex, ProfileLabel};
pub use matcher::{EuclideanMatcher, MatchOutcome, Matcher};
pub use quality::{QualityGate, QualityRejection, QualityReport, QualityThresholds};
pub use schedule::{Period, ScheduleDay, ScheduleError};
pub use types::{BoundingBox, Embedding, FaceProfile, Identity, IdentityRef, EMBEDDING_DIM};
