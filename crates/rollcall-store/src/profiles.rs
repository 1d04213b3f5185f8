//! On-disk face profiles.
//!
//! Layout: `<root>/<key>/face_encoding.json` plus `<root>/<key>/face_image`,
//! where `<key>` is derived from the display name and roll number. Each
//! identity owns at most one key; re-enrolling under a different key removes
//! the old directory.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, NaiveDateTime, Utc};
use rollcall_core::{Embedding, FaceProfile, IdentityRef};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

const RECORD_FILE: &str = "face_encoding.json";
const IMAGE_FILE: &str = "face_image";

#[derive(Debug, Serialize, Deserialize)]
struct ProfileRecord {
    #[serde(alias = "encoding")]
    embedding: Vec<f32>,
    #[serde(default)]
    identity: Option<IdentityRef>,
    #[serde(alias = "student_name")]
    identity_name: String,
    #[serde(default)]
    roll_number: Option<String>,
    created_at: String,
    #[serde(default = "default_feature_type")]
    feature_type: String,
    #[serde(default)]
    quality_score: f32,
    #[serde(default)]
    model_version: Option<String>,
}

fn default_feature_type() -> String {
    "face_encoder".to_string()
}

impl ProfileRecord {
    fn from_profile(profile: &FaceProfile) -> Self {
        Self {
            embedding: profile.embedding.values.clone(),
            identity: Some(profile.identity.clone()),
            identity_name: profile.name.clone(),
            roll_number: profile.roll.clone(),
            created_at: profile.created_at.to_rfc3339(),
            feature_type: profile.feature_type.clone(),
            quality_score: profile.quality_score,
            model_version: profile.embedding.model_version.clone(),
        }
    }

    /// Records written without an identity field fall back to the directory key.
    fn into_profile(self, key: &str) -> Result<FaceProfile> {
        Ok(FaceProfile {
            identity: self.identity.unwrap_or_else(|| IdentityRef::new(key)),
            name: self.identity_name,
            roll: self.roll_number,
            embedding: Embedding {
                values: self.embedding,
                model_version: self.model_version,
            },
            created_at: parse_timestamp(&self.created_at)?,
            feature_type: self.feature_type,
            quality_score: self.quality_score,
        })
    }
}

/// Accepts RFC 3339 or a naive ISO timestamp, read as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|t| t.and_utc())
        .map_err(|e| StoreError::InvalidData(format!("created_at {raw:?}: {e}")))
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .replace(' ', "_")
}

/// Directory key for a profile: the sanitized name, with `_<roll>` appended
/// when a roll number is present.
pub fn profile_key(name: &str, roll: Option<&str>) -> String {
    let base = sanitize(name);
    match roll.map(sanitize).filter(|r| !r.is_empty()) {
        Some(roll) if base.is_empty() => roll,
        Some(roll) => format!("{base}_{roll}"),
        None => base,
    }
}

pub struct ProfileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ProfileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `profile` as the identity's active profile, replacing any
    /// earlier one. Returns the directory key.
    ///
    /// When the name-derived key already belongs to another identity the
    /// sanitized identity is appended, so namesakes never overwrite each other.
    pub fn put(&self, profile: &FaceProfile, image: &[u8]) -> Result<String> {
        let base = profile_key(&profile.name, profile.roll.as_deref());
        if base.is_empty() {
            return Err(StoreError::InvalidData(format!(
                "no usable profile key for name {:?}",
                profile.name
            )));
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let key = self.key_for(&base, &profile.identity)?;
        let dir = self.root.join(&key);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(IMAGE_FILE), image)?;
        let json = serde_json::to_vec_pretty(&ProfileRecord::from_profile(profile))?;
        write_atomic(&dir.join(RECORD_FILE), &json)?;

        for (stale_key, record) in self.scan()? {
            if stale_key != key && record.identity.as_ref() == Some(&profile.identity) {
                tracing::info!(identity = %profile.identity, key = %stale_key, "removing superseded profile");
                fs::remove_dir_all(self.root.join(&stale_key))?;
            }
        }

        tracing::debug!(identity = %profile.identity, key = %key, "profile stored");
        Ok(key)
    }

    /// Every readable profile with the expected embedding dimension, at most
    /// one per identity (the newest), ordered by key.
    pub fn list(&self) -> Result<Vec<FaceProfile>> {
        let mut newest: HashMap<IdentityRef, (String, FaceProfile)> = HashMap::new();

        for (key, record) in self.scan()? {
            let profile = match record.into_profile(&key) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable profile");
                    continue;
                }
            };
            if !profile.embedding.has_expected_dim() {
                tracing::warn!(
                    key = %key,
                    dim = profile.embedding.values.len(),
                    "skipping profile with unexpected embedding dimension"
                );
                continue;
            }
            let superseded = newest
                .get(&profile.identity)
                .is_some_and(|(_, existing)| existing.created_at >= profile.created_at);
            if !superseded {
                newest.insert(profile.identity.clone(), (key, profile));
            }
        }

        let mut profiles: Vec<_> = newest.into_values().collect();
        profiles.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(profiles.into_iter().map(|(_, p)| p).collect())
    }

    pub fn get(&self, identity: &IdentityRef) -> Result<Option<FaceProfile>> {
        Ok(self.list()?.into_iter().find(|p| &p.identity == identity))
    }

    /// Pick the directory for `identity`: `base` unless another identity
    /// already owns it, then `<base>_<identity>`.
    fn key_for(&self, base: &str, identity: &IdentityRef) -> Result<String> {
        let owned_by_other = |key: &str| -> Result<bool> {
            Ok(self.owner(key)?.is_some_and(|owner| &owner != identity))
        };
        if !owned_by_other(base)? {
            return Ok(base.to_string());
        }

        let suffix = sanitize(identity.as_str());
        let key = format!("{base}_{suffix}");
        if suffix.is_empty() || owned_by_other(&key)? {
            return Err(StoreError::InvalidData(format!(
                "profile key {base:?} is taken and identity {identity} has no free alternative"
            )));
        }
        tracing::info!(identity = %identity, key = %key, taken = %base, "profile key in use by another identity");
        Ok(key)
    }

    /// Identity stored under `key`, if any. A record without an identity
    /// belongs to its key; a corrupt one belongs to nobody and may be replaced.
    fn owner(&self, key: &str) -> Result<Option<IdentityRef>> {
        let bytes = match fs::read(self.root.join(key).join(RECORD_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice::<ProfileRecord>(&bytes)
            .ok()
            .map(|record| record.identity.unwrap_or_else(|| IdentityRef::new(key))))
    }

    /// Parse every `<key>/face_encoding.json`, logging and skipping corrupt
    /// records. Failing to read the root itself is an error.
    fn scan(&self) -> Result<Vec<(String, ProfileRecord)>> {
        let entries = fs::read_dir(&self.root)?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(key) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let file = path.join(RECORD_FILE);
            if !file.exists() {
                continue;
            }
            let parsed = fs::read(&file)
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice::<ProfileRecord>(&bytes).map_err(StoreError::from));
            match parsed {
                Ok(record) => records.push((key, record)),
                Err(e) => tracing::warn!(path = %file.display(), error = %e, "skipping unreadable profile"),
            }
        }
        Ok(records)
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
