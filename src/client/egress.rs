//! Egress (M4): the outbound send path. Audio goes straight to the UDP
//! socket off the encode thread; video goes through a bounded,
//! drop-oldest-on-full leaky-bucket pacer so a burst of large video
//! fragments can't starve the link or blow past the configured bitrate.

use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::config::{MAX_VIDEO_PAYLOAD, VIDEO_PACING_QUEUE_SIZE, VIDEO_PACING_SLEEP_THRESHOLD_SECS};

/// Bounded video send queue. `send` drops the oldest queued packet rather
/// than blocking the video encode thread when full — a stale video frame is
/// worthless, unlike an audio frame.
pub struct VideoPacingQueue {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl VideoPacingQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(VIDEO_PACING_QUEUE_SIZE);
        VideoPacingQueue { tx, rx }
    }

    pub fn sender(&self) -> Sender<Vec<u8>> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> Receiver<Vec<u8>> {
        self.rx.clone()
    }

    /// Enqueue a packet, dropping the single oldest queued packet if full.
    pub fn enqueue(&self, packet: Vec<u8>) {
        match self.tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                let _ = self.rx.try_recv();
                if self.tx.try_send(packet).is_err() {
                    trace!("video pacing queue still full after eviction, dropping packet");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl Default for VideoPacingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests a 1ms system timer resolution so `tokio::time::sleep` in
/// [`pacing_loop`] below the usual 10-15ms default Windows timer tick can
/// actually land close to where it's asked to. A no-op everywhere else —
/// other platforms' monotonic sleep is already fine-grained enough that the
/// spin-wait tail below handles the remainder.
#[cfg(windows)]
fn request_high_res_timer() {
    // Safety: `timeBeginPeriod` has no invariants beyond "call `timeEndPeriod`
    // with the same value eventually"; we hold this for the process lifetime,
    // which is the documented pattern for a long-running pacer thread.
    unsafe {
        windows_sys::Win32::Media::timeBeginPeriod(1);
    }
}

#[cfg(not(windows))]
fn request_high_res_timer() {}

/// Leaky-bucket pacer: drains the queue at a constant inter-packet interval
/// derived from `rate_bytes_sec`, so bursts of fragments get smoothed to a
/// steady outbound rate instead of firing back-to-back.
pub async fn pacing_loop(queue: Receiver<Vec<u8>>, socket: &UdpSocket, peer: std::net::SocketAddr, rate_bytes_sec: u64) {
    request_high_res_timer();
    if rate_bytes_sec == 0 {
        warn!("video pacing rate is zero, pacing disabled (packets sent as fast as they arrive)");
    }
    let avg_packet_bytes = (MAX_VIDEO_PAYLOAD + 21) as f64;
    let pacing_interval = if rate_bytes_sec == 0 {
        0.0
    } else {
        avg_packet_bytes / rate_bytes_sec as f64
    };

    while let Ok(packet) = queue.recv().await {
        let sent = std::time::Instant::now();
        if let Err(e) = socket.send_to(&packet, peer).await {
            warn!(error = %e, "video packet send failed");
        }
        if pacing_interval <= 0.0 {
            continue;
        }
        let elapsed = sent.elapsed().as_secs_f64();
        let remaining = pacing_interval - elapsed;
        if remaining <= 0.0 {
            continue;
        }
        if remaining > VIDEO_PACING_SLEEP_THRESHOLD_SECS {
            tokio::time::sleep(Duration::from_secs_f64(remaining - VIDEO_PACING_SLEEP_THRESHOLD_SECS)).await;
        }
        // Spin for the last sub-millisecond stretch: OS sleep granularity
        // can't reliably hit it, and the error compounds over a stream.
        let deadline = sent + Duration::from_secs_f64(pacing_interval);
        while std::time::Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}
