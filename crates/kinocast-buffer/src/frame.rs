use std::sync::Arc;

/// Decoded picture plus the timing and provenance metadata the sink paces on.
///
/// `pts_us` is monotonically non-decreasing within one producer session and
/// is normalized to microseconds regardless of the source timebase.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pts_us: i64,
    pub dts_us: i64,
    /// Frame duration in seconds, derived from the decoder's timebase.
    pub duration_s: f64,
    pub source_uri: Arc<str>,
    pub width: u32,
    pub height: u32,
    /// Planar YUV420 payload, `width * height * 3 / 2` bytes.
    pub data: Vec<u8>,
}

impl Frame {
    /// Payload length of a planar YUV420 frame at the given dimensions.
    pub fn yuv420_len(width: u32, height: u32) -> usize {
        (width as usize * height as usize) * 3 / 2
    }

    /// An all-black YUV420 frame (zero luma, neutral chroma).
    pub fn black(width: u32, height: u32, pts_us: i64, duration_s: f64) -> Self {
        let luma_len = width as usize * height as usize;
        let total = Self::yuv420_len(width, height);
        let mut data = vec![0u8; total];
        for byte in data.iter_mut().skip(luma_len) {
            *byte = 128;
        }
        Self {
            pts_us,
            dts_us: pts_us,
            duration_s,
            source_uri: Arc::from("black"),
            width,
            height,
            data,
        }
    }
}
