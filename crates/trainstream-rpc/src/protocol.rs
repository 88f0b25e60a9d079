//! Wire protocol spoken with training backends.
//!
//! Every message is a ZMQ multipart exchange led by a little-endian `i32`
//! type frame. Integer frames are fixed-width little-endian; string frames
//! are raw UTF-8 bytes.

use anyhow::{anyhow, bail, Result};

/// Leading type frame of every backend exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Core → backend retrain request.
    StartRetraining = 0,
    /// Backend → core first-contact announcement.
    BackendMetadata = 1,
    /// Backend → core acknowledgement that training began.
    RetrainingStarted = 2,
    /// Backend → core notification that training finished.
    RetrainingEnded = 3,
    /// Bidirectional liveness probe.
    BackendHeartbeat = 4,
}

impl MessageType {
    pub fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::StartRetraining),
            1 => Some(Self::BackendMetadata),
            2 => Some(Self::RetrainingStarted),
            3 => Some(Self::RetrainingEnded),
            4 => Some(Self::BackendHeartbeat),
            _ => None,
        }
    }
}

/// Sub-type frame of a heartbeat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatType {
    /// Connection is known; nothing further required.
    KeepAlive = 0,
    /// Connection is unknown; the backend must re-send its metadata.
    RequestContainerMetadata = 1,
}

/// Kind frame inside a retrain request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainType {
    StartRetrain = 0,
}

pub fn encode_i32(value: i32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn encode_i64(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_i32(frame: &[u8]) -> Result<i32> {
    let bytes: [u8; 4] = frame
        .try_into()
        .map_err(|_| anyhow!("expected 4-byte i32 frame, got {} bytes", frame.len()))?;
    Ok(i32::from_le_bytes(bytes))
}

pub fn decode_i64(frame: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = frame
        .try_into()
        .map_err(|_| anyhow!("expected 8-byte i64 frame, got {} bytes", frame.len()))?;
    Ok(i64::from_le_bytes(bytes))
}

/// Policy-agnostic retrain request, serialized as the payload frames of a
/// `StartRetraining` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrainRequest {
    /// Inclusive start of the arrival-time window.
    pub data_from_us: i64,
    /// Inclusive end of the arrival-time window.
    pub data_to_us: i64,
    /// Total number of samples in the window.
    pub data_size: i64,
    /// Store ids of every batch in the window.
    pub batch_ids: Vec<String>,
}

impl RetrainRequest {
    pub fn new(data_from_us: i64, data_to_us: i64, data_size: i64, batch_ids: Vec<String>) -> Self {
        Self {
            data_from_us,
            data_to_us,
            data_size,
            batch_ids,
        }
    }

    /// Payload frames: `[from][to][size][retrain_type][batch_id…]`.
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        let mut frames = vec![
            encode_i64(self.data_from_us),
            encode_i64(self.data_to_us),
            encode_i64(self.data_size),
            encode_i32(RetrainType::StartRetrain as i32),
        ];
        frames.extend(self.batch_ids.iter().map(|id| id.as_bytes().to_vec()));
        frames
    }

    /// Parses the payload frames of a `StartRetraining` message.
    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self> {
        if frames.len() < 4 {
            bail!("retrain request needs at least 4 frames, got {}", frames.len());
        }
        let retrain_type = decode_i32(&frames[3])?;
        if retrain_type != RetrainType::StartRetrain as i32 {
            bail!("unknown retrain type {retrain_type}");
        }
        let batch_ids = frames[4..]
            .iter()
            .map(|frame| {
                String::from_utf8(frame.clone()).map_err(|e| anyhow!("batch id not UTF-8: {e}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            data_from_us: decode_i64(&frames[0])?,
            data_to_us: decode_i64(&frames[1])?,
            data_size: decode_i64(&frames[2])?,
            batch_ids,
        })
    }
}

/// Cost-model parameters carried in a backend's `params_json` frame.
///
/// Missing keys take the platform defaults.
pub fn parse_backend_params(params_json: &str) -> (f64, f64, f64) {
    const DEFAULT_ALPHA: f64 = 1.0;
    const DEFAULT_BETA: f64 = 1.0;
    const DEFAULT_WEIGHT: f64 = 10.0;

    let parsed: serde_json::Value = match serde_json::from_str(params_json) {
        Ok(value) => value,
        Err(_) => return (DEFAULT_ALPHA, DEFAULT_BETA, DEFAULT_WEIGHT),
    };
    let field = |name: &str, default: f64| parsed.get(name).and_then(|v| v.as_f64()).unwrap_or(default);
    (
        field("alpha", DEFAULT_ALPHA),
        field("beta", DEFAULT_BETA),
        field("weight", DEFAULT_WEIGHT),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips() {
        for raw in 0..5 {
            let ty = MessageType::from_i32(raw).unwrap();
            assert_eq!(ty as i32, raw);
        }
        assert_eq!(MessageType::from_i32(99), None);
    }

    #[test]
    fn integer_frames_are_little_endian() {
        assert_eq!(encode_i32(1), vec![1, 0, 0, 0]);
        assert_eq!(decode_i32(&encode_i32(-7)).unwrap(), -7);
        assert_eq!(decode_i64(&encode_i64(1_000_000)).unwrap(), 1_000_000);
        assert!(decode_i32(&[1, 2]).is_err());
    }

    #[test]
    fn retrain_request_frame_layout() {
        let req = RetrainRequest::new(1, 1_000_000, 5, vec!["1000000123".into()]);
        let frames = req.to_frames();
        assert_eq!(frames.len(), 5);
        assert_eq!(decode_i64(&frames[0]).unwrap(), 1);
        assert_eq!(decode_i64(&frames[1]).unwrap(), 1_000_000);
        assert_eq!(decode_i64(&frames[2]).unwrap(), 5);
        assert_eq!(decode_i32(&frames[3]).unwrap(), RetrainType::StartRetrain as i32);
        assert_eq!(frames[4], b"1000000123".to_vec());

        assert_eq!(RetrainRequest::from_frames(&frames).unwrap(), req);
    }

    #[test]
    fn backend_params_default_missing_keys() {
        assert_eq!(parse_backend_params("{}"), (1.0, 1.0, 10.0));
        assert_eq!(
            parse_backend_params(r#"{"alpha": 0.5, "weight": 3.0}"#),
            (0.5, 1.0, 3.0)
        );
        // Unparseable JSON falls back entirely.
        assert_eq!(parse_backend_params("not json"), (1.0, 1.0, 10.0));
    }
}
