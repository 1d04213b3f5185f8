//! Request orchestration: enrollment, walk-up recognition and period marking.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rollcall_core::{
    admit_period, AdjudicationError, AttendanceRecord, Clock, EuclideanMatcher, FaceProfile,
    Identity, IdentityRef, InsertOutcome, MarkOutcome, MatchIndex, MatchOutcome, Matcher,
    QualityRejection, QualityReport, ScheduleDay, ScheduleError,
};
use rollcall_store::{Database, ProfileStore, StoreError};
use serde::Serialize;
use thiserror::Error;

use crate::engine::{Diagnosis, EngineError, EngineHandle};

const FEATURE_TYPE: &str = "face_encoder";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("missing input: {0}")]
    InputMissing(&'static str),
    #[error("image rejected: {0}")]
    QualityRejected(QualityRejection),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("no enrolled profiles")]
    NoEnrolledProfiles,
    #[error("{}", unmatched_message(.best_distance))]
    Unmatched { best_distance: Option<f32> },
    #[error("identity {0} is not on the roster")]
    IdentityNotFound(IdentityRef),
    #[error(transparent)]
    Adjudication(#[from] AdjudicationError),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),
    #[error("feature extraction failed: {0}")]
    ExtractionFailure(String),
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl ServiceError {
    /// Stable name for callers that branch on the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InputMissing(_) => "InputMissing",
            ServiceError::QualityRejected(_) => "QualityRejected",
            ServiceError::NoFaceDetected => "NoFaceDetected",
            ServiceError::NoEnrolledProfiles => "NoEnrolledProfiles",
            ServiceError::Unmatched { .. } => "Unmatched",
            ServiceError::IdentityNotFound(_) => "IdentityNotFound",
            ServiceError::Adjudication(AdjudicationError::ScheduleNotSet(_)) => "ScheduleNotSet",
            ServiceError::Adjudication(AdjudicationError::PeriodNotFound { .. }) => "PeriodNotFound",
            ServiceError::Adjudication(AdjudicationError::OutsideWindow { .. }) => "OutsideWindow",
            ServiceError::InvalidSchedule(_) => "InvalidSchedule",
            ServiceError::ExtractionFailure(_) => "ExtractionFailure",
            ServiceError::Storage(_) => "Storage",
            ServiceError::EngineUnavailable(_) => "EngineUnavailable",
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Quality(reason) => ServiceError::QualityRejected(reason),
            EngineError::NoFaceDetected => ServiceError::NoFaceDetected,
            EngineError::Extraction(msg) => ServiceError::ExtractionFailure(msg),
            other @ (EngineError::Spawn(_) | EngineError::ChannelClosed) => {
                ServiceError::EngineUnavailable(other.to_string())
            }
        }
    }
}

fn unmatched_message(best_distance: &Option<f32>) -> String {
    match best_distance {
        Some(d) => format!("face not recognized (closest distance {d:.4})"),
        None => "face not recognized".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Serialize)]
pub struct Enrolled {
    pub identity: IdentityRef,
    /// Profile directory key.
    pub key: String,
    pub quality: Option<QualityReport>,
    pub detection_confidence: f32,
    /// Profiles in the index after the rebuild.
    pub enrolled_profiles: usize,
}

#[derive(Debug, Serialize)]
pub struct Recognition {
    pub identity: IdentityRef,
    pub name: String,
    pub roll: Option<String>,
    /// `1 - distance`, rounded to four decimals.
    pub confidence: f32,
    pub distance: f32,
    pub threshold: f32,
    /// Whether an ad hoc attendance record was written.
    pub recorded: bool,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub enrolled_profiles: usize,
    pub index_generation: u64,
    pub match_threshold: f32,
    pub models_loaded: bool,
}

pub struct AttendanceService {
    engine: EngineHandle,
    profiles: ProfileStore,
    db: Database,
    index: MatchIndex,
    matcher: EuclideanMatcher,
    threshold: f32,
    clock: Arc<dyn Clock>,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        profiles: ProfileStore,
        db: Database,
        threshold: f32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            profiles,
            db,
            index: MatchIndex::new(),
            matcher: EuclideanMatcher,
            threshold,
            clock,
        }
    }

    /// Rebuild the match index from the profile store. Returns the number of
    /// profiles indexed.
    pub fn reload(&self) -> Result<usize> {
        let snapshot = self.index.rebuild_with(|| self.profiles.list())?;
        Ok(snapshot.len())
    }

    /// Enroll (or re-enroll) a roster member from one image.
    pub async fn enroll(
        &self,
        identity: &IdentityRef,
        roll: Option<String>,
        image: Vec<u8>,
    ) -> Result<Enrolled> {
        if identity.as_str().is_empty() {
            return Err(ServiceError::InputMissing("identity"));
        }
        if image.is_empty() {
            return Err(ServiceError::InputMissing("image"));
        }

        let student = self
            .db
            .lookup(identity)?
            .ok_or_else(|| ServiceError::IdentityNotFound(identity.clone()))?;

        let analysis = self.engine.analyze(image.clone(), true).await?;

        let profile = FaceProfile {
            identity: student.id.clone(),
            name: student.name.clone(),
            roll: roll.or(student.roll),
            embedding: analysis.face.embedding,
            created_at: self.clock.now(),
            feature_type: FEATURE_TYPE.to_string(),
            quality_score: analysis.face.detection_confidence,
        };
        let key = self.profiles.put(&profile, &image)?;
        let enrolled_profiles = self.reload()?;

        tracing::info!(identity = %student.id, key = %key, "face enrolled");
        Ok(Enrolled {
            identity: student.id,
            key,
            quality: analysis.quality,
            detection_confidence: analysis.face.detection_confidence,
            enrolled_profiles,
        })
    }

    /// Identify the face in `image` and log an ad hoc attendance event.
    pub async fn recognize(&self, image: Vec<u8>) -> Result<Recognition> {
        if image.is_empty() {
            return Err(ServiceError::InputMissing("image"));
        }

        let analysis = self.engine.analyze(image, true).await?;

        let mut snapshot = self.index.current();
        if snapshot.is_empty() {
            self.reload()?;
            snapshot = self.index.current();
        }
        if snapshot.is_empty() {
            return Err(ServiceError::NoEnrolledProfiles);
        }

        let (label, distance, confidence) =
            match self.matcher.find(&analysis.face.embedding, &snapshot, self.threshold) {
                MatchOutcome::Matched {
                    label,
                    distance,
                    confidence,
                } => (label, distance, confidence),
                MatchOutcome::Unmatched { best_distance } => {
                    tracing::info!(?best_distance, threshold = self.threshold, "face not recognized");
                    return Err(ServiceError::Unmatched { best_distance });
                }
            };

        let recorded = match self.db.lookup(&label.identity)? {
            Some(student) => {
                let record = AttendanceRecord::present(&student, None, self.clock.now());
                self.db.insert_adhoc_record(&record)?;
                true
            }
            None => {
                tracing::warn!(identity = %label.identity, "matched identity is not on the roster; no record written");
                false
            }
        };

        tracing::info!(identity = %label.identity, distance, recorded, "face recognized");
        Ok(Recognition {
            identity: label.identity,
            name: label.name,
            roll: label.roll,
            confidence: round4(confidence),
            distance,
            threshold: self.threshold,
            recorded,
        })
    }

    /// Mark the matched identity present for `period`, once per day.
    ///
    /// Schedule and window are checked before any image work. `caller` is
    /// the authenticated requester and is only logged; the record goes to
    /// whoever the image matches.
    pub async fn mark_period(
        &self,
        caller: &IdentityRef,
        period: u32,
        image: Vec<u8>,
    ) -> Result<MarkOutcome> {
        if image.is_empty() {
            return Err(ServiceError::InputMissing("image"));
        }

        let now = self.clock.now();
        let schedule = self.db.schedule_for(now.date_naive())?;
        admit_period(schedule.as_ref(), period, now.naive_utc()).map_err(|e| {
            tracing::info!(caller = %caller, period, error = %e, "period mark refused");
            e
        })?;

        let analysis = self.engine.analyze(image, false).await?;
        let snapshot = self.index.current();

        let label = match self.matcher.find(&analysis.face.embedding, &snapshot, self.threshold) {
            MatchOutcome::Matched { label, .. } => label,
            MatchOutcome::Unmatched { best_distance } => {
                return Err(ServiceError::Unmatched { best_distance });
            }
        };

        let student = self
            .db
            .lookup(&label.identity)?
            .ok_or_else(|| ServiceError::IdentityNotFound(label.identity.clone()))?;

        if &student.id != caller {
            tracing::warn!(caller = %caller, matched = %student.id, period, "period mark for a different identity than the caller");
        }

        let record = AttendanceRecord::present(&student, Some(period), now);
        match self.db.insert_period_record(&record)? {
            InsertOutcome::Inserted => {
                tracing::info!(identity = %student.id, period, date = %record.date, "attendance marked");
                Ok(MarkOutcome::Marked(record))
            }
            InsertOutcome::AlreadyPresent => {
                tracing::info!(identity = %student.id, period, "attendance already marked");
                Ok(MarkOutcome::AlreadyMarked {
                    identity: student.id,
                    period,
                })
            }
        }
    }

    pub async fn diagnose(&self, image: Vec<u8>) -> Result<Diagnosis> {
        if image.is_empty() {
            return Err(ServiceError::InputMissing("image"));
        }
        Ok(self.engine.diagnose(image).await?)
    }

    pub fn status(&self) -> Status {
        let snapshot = self.index.current();
        Status {
            version: env!("CARGO_PKG_VERSION"),
            enrolled_profiles: snapshot.len(),
            index_generation: snapshot.generation(),
            match_threshold: self.threshold,
            models_loaded: true,
        }
    }

    pub fn upsert_student(&self, student: &Identity) -> Result<()> {
        if student.id.as_str().is_empty() {
            return Err(ServiceError::InputMissing("identity"));
        }
        Ok(self.db.upsert_student(student)?)
    }

    /// Store a schedule after re-checking its periods.
    pub fn set_schedule(&self, day: ScheduleDay) -> Result<()> {
        let day = ScheduleDay::new(day.date, day.periods)?;
        self.db.set_schedule(&day)?;
        tracing::info!(date = %day.date, periods = day.periods.len(), "schedule set");
        Ok(())
    }

    pub fn schedule_for(&self, date: NaiveDate) -> Result<Option<ScheduleDay>> {
        Ok(self.db.schedule_for(date)?)
    }

    pub fn attendance_for(
        &self,
        identity: &IdentityRef,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>> {
        Ok(self.db.attendance_for(identity, date)?)
    }

    pub fn attendance_on(
        &self,
        date: NaiveDate,
    ) -> Result<BTreeMap<IdentityRef, Vec<AttendanceRecord>>> {
        Ok(self.db.attendance_on(date)?)
    }
}

fn round4(x: f32) -> f32 {
    (x * 10_000.0).round() / 10_000.0
}
