use std::sync::Arc;
use std::time::Instant;

/// 20ms of PCM from one RTP stream, as delivered by the voice-channel collaborator.
/// Defaults to 48kHz, 2-channel, signed 16-bit, interleaved (≈ 3840 bytes / 1920 samples).
#[derive(Debug, Clone)]
pub struct Frame {
    pub ssrc: u32,
    pub pcm: Arc<[i16]>,
    pub rx_time: Instant,
}

impl Frame {
    pub fn new(ssrc: u32, pcm: Arc<[i16]>, rx_time: Instant) -> Self {
        Self { ssrc, pcm, rx_time }
    }

    pub fn byte_len(&self) -> usize {
        self.pcm.len() * std::mem::size_of::<i16>()
    }
}

/// Downmixes interleaved multi-channel i16 PCM to mono f32 in `[-1.0, 1.0]`, for feeding a
/// [`crate::vad::FrameClassifier`].
pub fn downmix_to_mono_f32(interleaved: &[i16], channels: u8) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum as f32 / channels as f32) / i16::MAX as f32
        })
        .collect()
}

/// Downmixes interleaved multi-channel i16 PCM to mono i16, for accumulation in
/// [`crate::pipeline::buffer::SmartBuffer`]'s ring.
pub fn downmix_to_mono_i16(interleaved: &[i16], channels: u8) -> Vec<i16> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_stereo_channels() {
        let stereo = [100i16, 200, -100, -300];
        let mono = downmix_to_mono_i16(&stereo, 2);
        assert_eq!(mono, vec![150, -200]);
    }

    #[test]
    fn downmix_mono_is_passthrough() {
        let mono_in = [1i16, 2, 3];
        assert_eq!(downmix_to_mono_i16(&mono_in, 1), vec![1, 2, 3]);
    }
}
