use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::RibbleWhisperError;

struct InnerAudioRingBuffer<T: Copy + Clone + Default> {
    // Insertion pointer
    head: AtomicUsize,
    // The amount of audio within the buffer, in units of sizeof(T)
    audio_len: AtomicUsize,
    capacity_ms: AtomicUsize,
    buffer_capacity: AtomicUsize,
    sample_rate: AtomicUsize,
    // If at some point in the future it becomes imperative to support a reader/writer
    // paradigm, this will change to an RW lock.
    buffer: Mutex<Vec<T>>,
}

/// A thread-safe ring-buffer used as the backing store for a
/// [`crate::pipeline::buffer::SmartBuffer`]'s rolling PCM and overlap rings.
#[derive(Clone)]
pub struct AudioRingBuffer<T: Copy + Clone + Default> {
    inner: Arc<InnerAudioRingBuffer<T>>,
}

/// Builder to set the parameters of an [`AudioRingBuffer`].
#[derive(Clone)]
pub struct AudioRingBufferBuilder {
    capacity_ms: Option<usize>,
    sample_rate: Option<usize>,
}

impl AudioRingBufferBuilder {
    pub fn new() -> Self {
        Self {
            capacity_ms: None,
            sample_rate: None,
        }
    }

    /// Sets the requested capacity measured in milliseconds.
    pub fn with_capacity_ms(mut self, capacity_ms: usize) -> Self {
        self.capacity_ms = Some(capacity_ms);
        self
    }

    /// Sets the requested sample rate measured in Hz.
    pub fn with_sample_rate(mut self, sample_rate: usize) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Build an [`AudioRingBuffer`] with the desired parameters.
    /// Returns Err if the length/sample rate are missing or zero.
    pub fn build<T: Copy + Clone + Default>(
        self,
    ) -> Result<AudioRingBuffer<T>, RibbleWhisperError> {
        let c_ms = self
            .capacity_ms
            .filter(|&ms| ms > 0)
            .ok_or(RibbleWhisperError::ParameterError(
                "AudioRingBufferBuilder has zero-length buffer.".to_string(),
            ))?;
        let s_rate = self
            .sample_rate
            .filter(|&sr| sr > 0)
            .ok_or(RibbleWhisperError::ParameterError(
                "AudioRingBufferBuilder has zero-size sample rate.".to_string(),
            ))?;

        let capacity_ms = AtomicUsize::new(c_ms);
        let buffer_size = ((c_ms as f64 / 1000.) * (s_rate as f64)) as usize;
        let buffer_len = AtomicUsize::new(buffer_size);
        let audio_len = AtomicUsize::new(0);
        let head = AtomicUsize::new(0);
        let sample_rate = AtomicUsize::new(s_rate);
        let buffer = Mutex::new(vec![T::default(); buffer_size]);
        let inner = Arc::new(InnerAudioRingBuffer {
            head,
            audio_len,
            capacity_ms,
            buffer_capacity: buffer_len,
            sample_rate,
            buffer,
        });

        Ok(AudioRingBuffer { inner })
    }
}

impl Default for AudioRingBufferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Clone + Default> AudioRingBuffer<T> {
    /// Returns the currently stored audio length measured in units of size_of(T)
    pub fn get_audio_length(&self) -> usize {
        self.inner.audio_len.load(Ordering::Acquire)
    }

    /// Returns the currently stored audio length measured in ms
    pub fn get_audio_length_ms(&self) -> usize {
        let audio_len = self.inner.audio_len.load(Ordering::Acquire) as f64;
        let sample_rate = self.inner.sample_rate.load(Ordering::Acquire) as f64;
        ((audio_len * 1000f64) / sample_rate) as usize
    }

    /// Returns the ringbuffer capacity measured in milliseconds
    pub fn get_capacity_in_ms(&self) -> usize {
        self.inner.capacity_ms.load(Ordering::Acquire)
    }

    /// Returns the ringbuffer capacity measured in size_of(T)
    pub fn get_capacity(&self) -> usize {
        self.inner.buffer_capacity.load(Ordering::Acquire)
    }

    /// Returns the current position of the write head
    pub fn get_head_position(&self) -> usize {
        self.inner.head.load(Ordering::Acquire)
    }

    /// Writes the input samples to the buffer.
    /// NOTE: if the input length exceeds the buffer capacity, only the last n samples are
    /// written to the buffer, where n = buffer capacity.
    pub fn push_audio(&self, input: &[T]) {
        let mut n_samples = input.len();
        let mut stream = input.to_vec();

        let buffer_len = self.inner.buffer_capacity.load(Ordering::Acquire);
        if n_samples > buffer_len {
            let len = n_samples;
            n_samples = buffer_len;
            let new_start = len - n_samples;
            stream = stream[new_start..].to_vec();
        }

        let mut buffer = self.inner.buffer.lock();
        let head_pos = self.inner.head.load(Ordering::Acquire);
        if head_pos + n_samples > buffer_len {
            let offset = buffer_len - head_pos;
            let copy_buffer = &mut buffer[head_pos..head_pos + offset];
            let stream_buffer = &stream[0..offset];
            copy_buffer.copy_from_slice(stream_buffer);

            let diff_offset = n_samples - offset;
            let copy_buffer = &mut buffer[0..diff_offset];
            let stream_buffer = &stream[offset..offset + diff_offset];
            copy_buffer.copy_from_slice(stream_buffer);

            let new_head_pos = (head_pos + n_samples) % buffer_len;
            self.inner.head.store(new_head_pos, Ordering::Release);

            let old_audio_len = self.inner.audio_len.load(Ordering::Acquire);
            let new_audio_len = (old_audio_len + n_samples).min(buffer_len);
            self.inner.audio_len.store(new_audio_len, Ordering::Release);
        } else {
            let copy_buffer = &mut buffer[head_pos..head_pos + n_samples];
            let stream_buffer = &stream[0..n_samples];
            copy_buffer.copy_from_slice(stream_buffer);

            let new_head_pos = (head_pos + n_samples) % buffer_len;
            self.inner.head.store(new_head_pos, Ordering::Release);

            let old_audio_len = self.inner.audio_len.load(Ordering::Acquire);
            let new_audio_len = (old_audio_len + n_samples).min(buffer_len);
            self.inner.audio_len.store(new_audio_len, Ordering::Release);
        }
    }

    /// Reads min(len_ms, audio length) ms from the buffer and returns the output as `Vec<T>`.
    /// Set len_ms to 0 to read the full buffer.
    pub fn read(&self, len_ms: usize) -> Vec<T> {
        let mut buf = vec![];
        self.read_into(len_ms, &mut buf);
        buf
    }

    /// Reads min(len_ms, audio length) ms from the buffer and writes to the provided result
    /// vector. Set len_ms to 0 to read the full buffer.
    pub fn read_into(&self, len_ms: usize, result: &mut Vec<T>) {
        let mut ms = len_ms;

        if ms == 0 {
            ms = self.inner.capacity_ms.load(Ordering::Acquire);
        }

        result.clear();
        let sample_rate = self.inner.sample_rate.load(Ordering::Acquire);
        let mut n_samples = (ms as f64 * sample_rate as f64 / 1000f64) as usize;

        let buffer = self.inner.buffer.lock();

        let audio_len = self.inner.audio_len.load(Ordering::Acquire);
        if n_samples > audio_len {
            n_samples = audio_len;
        }
        result.resize(n_samples, T::default());
        if result.is_empty() {
            return;
        }

        let head_pos = self.inner.head.load(Ordering::Acquire);
        let buffer_len = self.inner.buffer_capacity.load(Ordering::Acquire);

        let mut start_pos: i64 = head_pos as i64 - n_samples as i64;

        if start_pos < 0 {
            start_pos += buffer_len as i64;
        }

        let start_pos = start_pos as usize;

        if start_pos + n_samples > buffer_len {
            let to_endpoint = buffer_len - start_pos;

            let copy_buffer = &mut result[0..to_endpoint];
            let stream = &buffer[start_pos..start_pos + to_endpoint];
            copy_buffer.copy_from_slice(stream);

            let remaining_samples = n_samples - to_endpoint;
            let copy_buffer = &mut result[to_endpoint..to_endpoint + remaining_samples];
            let stream = &buffer[0..remaining_samples];
            copy_buffer.copy_from_slice(stream);
        } else {
            let copy_buffer = &mut result[0..n_samples];
            let stream = &buffer[start_pos..start_pos + n_samples];
            copy_buffer.copy_from_slice(stream);
        }
    }

    /// Clears the ring buffer completely.
    pub fn clear(&self) {
        let _buffer = self.inner.buffer.lock();
        self.inner.head.store(0, Ordering::SeqCst);
        self.inner.audio_len.store(0, Ordering::SeqCst);
    }

    /// Clears the ring buffer, retaining at most `len_ms` of the most recent audio.
    pub fn clear_from_back_retain_ms(&self, len_ms: usize) {
        if len_ms == 0 {
            self.clear();
            return;
        }
        let _buffer = self.inner.buffer.lock();
        let sample_rate = self.inner.sample_rate.load(Ordering::Acquire);
        let audio_len = self.inner.audio_len.load(Ordering::Acquire);
        let n_samples = ((len_ms as f64 * sample_rate as f64 / 1000f64) as usize).min(audio_len);
        self.inner.audio_len.store(n_samples, Ordering::Release);
    }
}

impl<T: Copy + Clone + Default> AudioRingBuffer<T> {
    /// Builds a ring buffer sized for `capacity_ms` of audio at `sample_rate`.
    pub fn new(capacity_ms: usize, sample_rate: usize) -> Result<Self, RibbleWhisperError> {
        AudioRingBufferBuilder::new()
            .with_capacity_ms(capacity_ms)
            .with_sample_rate(sample_rate)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_round_trip() {
        let buf = AudioRingBuffer::<i16>::new(1000, 1000).unwrap();
        buf.push_audio(&[1, 2, 3, 4]);
        assert_eq!(buf.read(0), vec![1, 2, 3, 4]);
    }

    #[test]
    fn wraps_when_over_capacity() {
        let buf = AudioRingBuffer::<i16>::new(5, 1000).unwrap();
        // capacity is 5 samples at 1000 Hz for 5ms
        buf.push_audio(&[1, 2, 3, 4, 5, 6, 7]);
        // only the last 5 samples should survive
        assert_eq!(buf.read(0), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn clear_from_back_retain_ms_keeps_trailing_audio() {
        let buf = AudioRingBuffer::<i16>::new(1000, 1000).unwrap();
        buf.push_audio(&[1, 2, 3, 4, 5]);
        buf.clear_from_back_retain_ms(2);
        assert_eq!(buf.get_audio_length(), 2);
        assert_eq!(buf.read(0), vec![4, 5]);
    }
}
