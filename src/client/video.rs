//! Video pipeline (M8): H.264 fragmentation/reassembly over the
//! [`MAX_VIDEO_PAYLOAD`]-sized chunks, one decode worker per remote sender.
//!
//! The actual H.264 codec is an abstract contract — encoder/decoder
//! selection and driver-level details live outside this crate's scope.
//! Everything here (chunking, reassembly, pacing, per-sender worker
//! threads) is concrete and owned by this module.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{MAX_VIDEO_PAYLOAD, VIDEO_DECODE_QUEUE_SIZE, VIDEO_FRAME_REASSEMBLY_TIMEOUT_SECS, VIDEO_MAX_INFLIGHT_FRAMES};
use crate::error::ClientError;
use crate::proto::{encode_video_chunk_header, VIDEO_CHUNK_HEADER_SIZE};

/// A decoded video frame handed up to the renderer. Pixel format and
/// resolution are whatever the concrete [`VideoDecoder`] implementation
/// produces; this crate doesn't interpret the bytes.
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Opaque encoder contract. A concrete implementation (e.g. wrapping a
/// platform H.264 encoder) lives outside this crate.
pub trait VideoEncoder: Send {
    fn encode(&mut self, rgba_frame: &[u8]) -> Result<Vec<u8>, ClientError>;
    /// One-shot: the next call to `encode` must produce an IDR frame.
    fn force_keyframe(&mut self);
}

/// Opaque decoder contract, one instance per remote sender.
pub trait VideoDecoder: Send {
    fn decode(&mut self, access_unit: &[u8]) -> Result<DecodedFrame, ClientError>;
}

/// Split one encoded access unit into `MAX_VIDEO_PAYLOAD`-sized chunks, each
/// prefixed with an 8-byte `frame_id | part_idx | total_parts` header. The
/// caller still needs to wrap each chunk in the 17-byte UDP header with
/// `FLAG_VIDEO` set before sending.
pub fn fragment(frame_id: u32, access_unit: &[u8]) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = access_unit.chunks(MAX_VIDEO_PAYLOAD).collect();
    let total_parts = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(idx, chunk)| {
            let mut out = Vec::with_capacity(VIDEO_CHUNK_HEADER_SIZE + chunk.len());
            out.extend_from_slice(&encode_video_chunk_header(frame_id, idx as u16, total_parts));
            out.extend_from_slice(chunk);
            out
        })
        .collect()
}

struct FrameAssembly {
    total_parts: u16,
    parts: HashMap<u16, Vec<u8>>,
    first_seen: Instant,
}

/// Per-sender reassembly table plus the bounded decode queue handed off to
/// that sender's dedicated decode worker thread.
pub struct SenderPipeline {
    frames: Mutex<HashMap<u32, FrameAssembly>>,
    decode_tx: Sender<Vec<u8>>,
    pub decode_rx: Receiver<Vec<u8>>,
}

impl SenderPipeline {
    pub fn new() -> Self {
        let (decode_tx, decode_rx) = async_channel::bounded(VIDEO_DECODE_QUEUE_SIZE);
        SenderPipeline {
            frames: Mutex::new(HashMap::new()),
            decode_tx,
            decode_rx,
        }
    }

    /// Feed one incoming chunk. Returns `true` if a complete access unit was
    /// handed to the decode queue.
    pub fn process_chunk(&self, frame_id: u32, part_idx: u16, total_parts: u16, chunk: &[u8]) -> bool {
        let completed = {
            let mut frames = self.frames.lock();

            if frames.len() > VIDEO_MAX_INFLIGHT_FRAMES && !frames.contains_key(&frame_id) {
                debug!(tracked = frames.len(), "too many in-flight frames, receiver fell behind, resetting");
                frames.clear();
            }

            let entry = frames.entry(frame_id).or_insert_with(|| FrameAssembly {
                total_parts,
                parts: HashMap::new(),
                first_seen: Instant::now(),
            });
            entry.parts.insert(part_idx, chunk.to_vec());

            let now = Instant::now();
            frames.retain(|_, f| now.duration_since(f.first_seen).as_secs_f64() < VIDEO_FRAME_REASSEMBLY_TIMEOUT_SECS);

            match frames.get(&frame_id) {
                Some(f) if f.parts.len() as u16 >= f.total_parts => frames.remove(&frame_id),
                _ => None,
            }
        };

        let Some(assembly) = completed else { return false };

        // Concatenation happens outside the lock: the lock only needs to be
        // held long enough to pull the completed frame's parts out of the
        // table.
        let mut data = Vec::new();
        for idx in 0..assembly.total_parts {
            match assembly.parts.get(&idx) {
                Some(part) => data.extend_from_slice(part),
                None => {
                    trace!(frame_id, idx, "reassembly produced a gap, discarding frame");
                    return false;
                }
            }
        }

        match self.decode_tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(data)) => {
                let _ = self.decode_rx.try_recv();
                self.decode_tx.try_send(data).is_ok()
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl Default for SenderPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs on its own thread (not the UDP task) for one remote sender: pulls
/// complete access units off the queue and decodes them. Exits when the
/// channel closes (sender torn down on disconnect/cleanup).
pub async fn decode_worker(
    pipeline: Arc<SenderPipeline>,
    mut decoder: Box<dyn VideoDecoder>,
    on_frame: impl Fn(DecodedFrame) + Send,
) {
    while let Ok(access_unit) = pipeline.decode_rx.recv().await {
        match decoder.decode(&access_unit) {
            Ok(frame) => on_frame(frame),
            Err(e) => trace!(error = %e, "video decode failed, dropping frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_then_reassemble_roundtrips() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let chunks = fragment(7, &data);
        assert!(chunks.len() > 1);

        let pipeline = SenderPipeline::new();
        let mut completed = false;
        for chunk in &chunks {
            let frame_id = u32::from_be_bytes(chunk[0..4].try_into().unwrap());
            let part_idx = u16::from_be_bytes(chunk[4..6].try_into().unwrap());
            let total_parts = u16::from_be_bytes(chunk[6..8].try_into().unwrap());
            if pipeline.process_chunk(frame_id, part_idx, total_parts, &chunk[VIDEO_CHUNK_HEADER_SIZE..]) {
                completed = true;
            }
        }
        assert!(completed);
        let reassembled = pipeline.decode_rx.try_recv().unwrap();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn too_many_inflight_frames_resets_table() {
        let pipeline = SenderPipeline::new();
        for frame_id in 0..(VIDEO_MAX_INFLIGHT_FRAMES as u32 + 2) {
            // Only send part 0 of 2 for each, so none complete and they pile up.
            pipeline.process_chunk(frame_id, 0, 2, b"x");
        }
        let frames = pipeline.frames.lock();
        assert!(frames.len() <= VIDEO_MAX_INFLIGHT_FRAMES + 1);
    }
}
