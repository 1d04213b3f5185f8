use std::path::PathBuf;

use rollcall_core::QualityThresholds;

const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file (roster, schedules, attendance).
    pub db_path: PathBuf,
    /// Root of the on-disk face profile store.
    pub faces_dir: PathBuf,
    /// Euclidean distance below which a query face matches an enrolled profile.
    pub match_threshold: f32,
    pub min_width: u32,
    pub min_height: u32,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));

        let faces_dir = std::env::var("ROLLCALL_FACES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces"));

        let defaults = QualityThresholds::default();

        Self {
            model_dir,
            db_path,
            faces_dir,
            match_threshold: threshold_or_default(
                std::env::var("ROLLCALL_MATCH_THRESHOLD").ok().as_deref(),
                DEFAULT_MATCH_THRESHOLD,
            ),
            min_width: env_u32("ROLLCALL_MIN_WIDTH", defaults.min_width),
            min_height: env_u32("ROLLCALL_MIN_HEIGHT", defaults.min_height),
            session_bus: std::env::var("ROLLCALL_SESSION_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the 128-d face encoder model.
    pub fn encoder_model_path(&self) -> String {
        self.model_dir
            .join("face_encoder_128.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn quality_thresholds(&self) -> QualityThresholds {
        QualityThresholds {
            min_width: self.min_width,
            min_height: self.min_height,
            ..QualityThresholds::default()
        }
    }
}

/// A match threshold must be a finite, positive distance.
fn threshold_or_default(raw: Option<&str>, default: f32) -> f32 {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<f32>() {
        Ok(v) if v.is_finite() && v > 0.0 => v,
        _ => {
            tracing::warn!(value = raw, default, "ignoring invalid ROLLCALL_MATCH_THRESHOLD");
            default
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_accepts_positive_values() {
        assert_eq!(threshold_or_default(None, 0.5), 0.5);
        assert_eq!(threshold_or_default(Some("0.6"), 0.5), 0.6);
        assert_eq!(threshold_or_default(Some(" 0.45 "), 0.5), 0.45);
    }

    #[test]
    fn test_threshold_rejects_unusable_values() {
        for raw in ["NaN", "inf", "-1", "0", "-0.0", "abc", ""] {
            assert_eq!(threshold_or_default(Some(raw), 0.5), 0.5, "{raw:?}");
        }
    }
}
