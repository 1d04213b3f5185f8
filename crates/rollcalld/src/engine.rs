use rollcall_core::quality;
use rollcall_core::{
    descriptor, EncodeError, EncodedFace, FaceEncoder, QualityGate, QualityRejection, QualityReport,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image rejected: {0}")]
    Quality(QualityRejection),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("feature extraction failed: {0}")]
    Extraction(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<EncodeError> for EngineError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::NoFaceDetected => EngineError::NoFaceDetected,
            EncodeError::Extraction(msg) => EngineError::Extraction(msg),
        }
    }
}

/// Result of encoding one submitted image.
pub struct Analysis {
    pub face: EncodedFace,
    /// Present when the quality gate ran.
    pub quality: Option<QualityReport>,
}

/// Quality and descriptor measurements for an image, without matching.
#[derive(Debug, Serialize)]
pub struct Diagnosis {
    pub accepted: bool,
    pub quality: Option<QualityReport>,
    pub rejection: Option<String>,
    pub descriptor_len: usize,
}

/// Messages sent from the service to the engine thread.
enum EngineRequest {
    Analyze {
        image: Vec<u8>,
        gated: bool,
        reply: oneshot::Sender<Result<Analysis, EngineError>>,
    },
    Diagnose {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Diagnosis, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode the image and encode its first face. With `gated`, the quality
    /// gate runs first and a rejection stops the request before encoding.
    pub async fn analyze(&self, image: Vec<u8>, gated: bool) -> Result<Analysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                image,
                gated,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn diagnose(&self, image: Vec<u8>) -> Result<Diagnosis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Diagnose {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread that owns the encoder.
///
/// Inference sessions need `&mut` access, so every image request is
/// serialized through this thread.
pub fn spawn_engine<E>(mut encoder: E, gate: QualityGate) -> Result<EngineHandle, EngineError>
where
    E: FaceEncoder + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze {
                        image,
                        gated,
                        reply,
                    } => {
                        let result = run_analyze(&mut encoder, &gate, &image, gated);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Diagnose { image, reply } => {
                        let _ = reply.send(run_diagnose(&gate, &image));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn run_analyze<E: FaceEncoder>(
    encoder: &mut E,
    gate: &QualityGate,
    bytes: &[u8],
    gated: bool,
) -> Result<Analysis, EngineError> {
    let (image, quality) = if gated {
        let (image, report) = gate.assess_bytes(bytes).map_err(|reason| {
            tracing::debug!(%reason, "quality gate rejected image");
            EngineError::Quality(reason)
        })?;
        (image, Some(report))
    } else {
        let image = quality::decode(bytes).map_err(|e| EngineError::Extraction(e.to_string()))?;
        (image, None)
    };

    let face = encoder.encode(&image.to_rgb8())?;
    tracing::debug!(
        faces = face.faces_detected,
        confidence = face.detection_confidence,
        "face encoded"
    );
    Ok(Analysis { face, quality })
}

fn run_diagnose(gate: &QualityGate, bytes: &[u8]) -> Result<Diagnosis, EngineError> {
    let image = quality::decode(bytes).map_err(EngineError::Quality)?;
    let features = descriptor::compute(&image);
    let diagnosis = match gate.assess(&image) {
        Ok(report) => Diagnosis {
            accepted: true,
            quality: Some(report),
            rejection: None,
            descriptor_len: features.len(),
        },
        Err(reason) => Diagnosis {
            accepted: false,
            quality: None,
            rejection: Some(reason.to_string()),
            descriptor_len: features.len(),
        },
    };
    Ok(diagnosis)
}
