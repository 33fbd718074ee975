//! Captured frame payloads
//!
//! RGB frames the capture pump publishes for the external encoder, plus
//! running counters on the pump itself.

use std::fmt;

/// One captured frame, RGB pixel data
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Raw pixel data (RGB format)
    pub data: Vec<u8>,

    /// Capture timestamp
    pub timestamp: std::time::Instant,

    /// Frame sequence number
    pub sequence: u64,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({}x{}, {} bytes, seq={})",
            self.width,
            self.height,
            self.data.len(),
            self.sequence
        )
    }
}

/// Running counters for one capture pump
#[derive(Debug, Default, Clone)]
pub struct FrameStats {
    /// Total frames captured
    pub total_frames: u64,

    /// Total bytes captured
    pub total_bytes: u64,

    /// Total capture time in microseconds
    pub total_capture_time_us: u64,

    /// Last capture time in microseconds
    pub last_capture_time_us: u64,
}

impl FrameStats {
    /// Record a frame capture
    pub fn record_capture(&mut self, bytes: usize, time_us: u64) {
        self.total_frames += 1;
        self.total_bytes += bytes as u64;
        self.last_capture_time_us = time_us;
        self.total_capture_time_us += time_us;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let mut stats = FrameStats::default();
        stats.record_capture(1024, 500);
        stats.record_capture(2048, 700);
        assert_eq!(stats.total_frames, 2);
        assert_eq!(stats.total_bytes, 3072);
        assert_eq!(stats.last_capture_time_us, 700);
        assert_eq!(stats.total_capture_time_us, 1200);
    }
}
