//! Multi-client playback mixer.
//!
//! When several local clients feed a single playback transport their samples
//! are summed, not concatenated. The buffer is a circular region of
//! accumulator-wide samples, one step wider than the stream format so that
//! summation cannot overflow: i16 backing for U8 input, i32 for S16 and S24,
//! i64 for S32.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    pcm::StreamFormat,
    Error, ErrorKind, Result,
};

/// Number of periods a client may run ahead of the read head. Playback
/// starts once this many periods are buffered.
pub const THRESHOLD_PERIODS: u64 = 2;

enum Accum {
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl Accum {
    fn len(&self) -> usize {
        match self {
            Accum::I16(v) => v.len(),
            Accum::I32(v) => v.len(),
            Accum::I64(v) => v.len(),
        }
    }

    fn add(&mut self, idx: usize, value: i64) {
        match self {
            Accum::I16(v) => v[idx] = v[idx].saturating_add(value as i16),
            Accum::I32(v) => v[idx] = v[idx].saturating_add(value as i32),
            Accum::I64(v) => v[idx] = v[idx].saturating_add(value),
        }
    }

    fn take(&mut self, idx: usize) -> i64 {
        match self {
            Accum::I16(v) => std::mem::take(&mut v[idx]) as i64,
            Accum::I32(v) => std::mem::take(&mut v[idx]) as i64,
            Accum::I64(v) => std::mem::take(&mut v[idx]) as i64,
        }
    }
}

/// Decode one sample at the start of `src`.
fn decode_sample(format: StreamFormat, src: &[u8]) -> i64 {
    let bytes = format.bytes();
    let mut raw: u64 = 0;
    if format.is_big_endian() {
        for &b in &src[..bytes] {
            raw = raw << 8 | b as u64;
        }
    } else {
        for (i, &b) in src[..bytes].iter().enumerate() {
            raw |= (b as u64) << (8 * i);
        }
    }
    if format.is_signed() {
        let width = format.width();
        let shift = 64 - width;
        ((raw << shift) as i64) >> shift
    } else {
        raw as i64
    }
}

/// Encode one sample into the start of `dst`.
fn encode_sample(format: StreamFormat, value: i64, dst: &mut [u8]) {
    let bytes = format.bytes();
    let raw = value as u64;
    if format.is_big_endian() {
        for i in 0..bytes {
            dst[i] = (raw >> (8 * (bytes - 1 - i))) as u8;
        }
    } else {
        for i in 0..bytes {
            dst[i] = (raw >> (8 * i)) as u8;
        }
    }
}

/// Circular summing buffer shared by the clients of one playback transport.
///
/// Offsets are monotonic sample-frame counters; the storage index is the
/// offset modulo the capacity. `end - read` is the number of readable
/// frames, and no client write offset may run more than
/// [THRESHOLD_PERIODS] periods past the read head.
pub struct MixBuffer {
    format: StreamFormat,
    channels: usize,
    period: usize,
    capacity: usize,
    read: AtomicU64,
    end: AtomicU64,
    storage: Accum,
}

impl MixBuffer {
    /// Create a mixer for the given stream, with `period` and `capacity` in
    /// frames. The capacity must exceed the client run-ahead window so that
    /// a client joining mid-stream can catch up without overtaking the read
    /// head.
    pub fn new(format: StreamFormat, channels: usize, period: usize, capacity: usize) -> Result<Self> {
        if channels == 0 || period == 0 || capacity as u64 <= THRESHOLD_PERIODS * period as u64 {
            return Err(Error::new(ErrorKind::InvalidArguments));
        }
        let samples = capacity * channels;
        let storage = match format {
            StreamFormat::U8 => Accum::I16(try_zeroed(samples)?),
            StreamFormat::S16_2LE | StreamFormat::S24_3LE | StreamFormat::S24_4LE => {
                Accum::I32(try_zeroed(samples)?)
            }
            StreamFormat::S32_4LE => Accum::I64(try_zeroed(samples)?),
            _ => return Err(Error::new(ErrorKind::NotSupported)),
        };
        Ok(Self {
            format,
            channels,
            period,
            capacity,
            read: AtomicU64::new(0),
            end: AtomicU64::new(0),
            storage,
        })
    }

    /// Stream format of the mixed output.
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Bytes per frame of the client stream.
    pub fn frame_bytes(&self) -> usize {
        self.format.bytes() * self.channels
    }

    /// Period length in frames.
    pub fn period(&self) -> usize {
        self.period
    }

    /// Number of readable frames.
    pub fn readable(&self) -> u64 {
        self.end.load(Ordering::Acquire) - self.read.load(Ordering::Acquire)
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    /// Whether enough audio is buffered to start playback.
    pub fn at_threshold(&self) -> bool {
        self.readable() >= THRESHOLD_PERIODS * self.period as u64
    }

    /// Sum whole frames from `src` into the buffer at the client offset.
    ///
    /// At most one period is consumed per call, and a client may not run
    /// more than the threshold window ahead of the read head. Returns the
    /// number of frames consumed; the caller advances its `offset` copy of
    /// the client cursor accordingly (it is updated in place).
    pub fn add(&mut self, offset: &mut u64, src: &[u8]) -> usize {
        let read = self.read.load(Ordering::Acquire);
        // A lagging client snaps forward; its missed window is silence.
        if *offset < read {
            *offset = read;
        }
        let window_end = read + THRESHOLD_PERIODS * self.period as u64;
        let frames = (src.len() / self.frame_bytes())
            .min(self.period)
            .min(window_end.saturating_sub(*offset) as usize);
        let bytes = self.format.bytes();
        for f in 0..frames {
            let frame_base = (*offset as usize + f) % self.capacity * self.channels;
            let src_base = f * self.frame_bytes();
            for c in 0..self.channels {
                let value = decode_sample(self.format, &src[src_base + c * bytes..]);
                self.storage.add(frame_base + c, value);
            }
        }
        *offset += frames as u64;
        // Advance the end marker if this client is the furthest ahead.
        let mut end = self.end.load(Ordering::Acquire);
        while *offset > end {
            match self.end.compare_exchange(end, *offset, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(cur) => end = cur,
            }
        }
        frames
    }

    /// Read mixed frames into `dst`, applying the per-channel scale,
    /// clipping to the output range and zeroing the consumed slots so the
    /// next add sees a clean accumulator.
    ///
    /// At most one period is copied per call. Returns frames read.
    pub fn read(&mut self, dst: &mut [u8], scale: &[f64]) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let frames = (dst.len() / self.frame_bytes()).min(self.period).min(self.readable() as usize);
        let bytes = self.format.bytes();
        let max = self.format.amplitude_max();
        let min = self.format.amplitude_min();
        for f in 0..frames {
            let frame_base = (read as usize + f) % self.capacity * self.channels;
            let dst_base = f * self.frame_bytes();
            for c in 0..self.channels {
                let acc = self.storage.take(frame_base + c);
                let scaled = (acc as f64 * scale.get(c).copied().unwrap_or(1.0)).round() as i64;
                encode_sample(self.format, scaled.clamp(min, max), &mut dst[dst_base + c * bytes..]);
            }
        }
        self.read.fetch_add(frames as u64, Ordering::AcqRel);
        frames
    }

    /// Drop everything buffered and reset all cursors to the read head.
    pub fn clear(&mut self) {
        let read = self.read.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        for off in read..end {
            let base = off as usize % self.capacity * self.channels;
            for c in 0..self.channels {
                self.storage.take(base + c);
            }
        }
        self.end.store(read, Ordering::Release);
    }
}

fn try_zeroed<T: Default + Clone>(len: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| {
        Error::with_message(ErrorKind::Failed, "mix buffer backing allocation failed")
    })?;
    v.resize(len, T::default());
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn frames(value: i16, n: usize, channels: usize) -> Vec<u8> {
        s16(&vec![value; n * channels])
    }

    #[test]
    fn two_client_summation() {
        // S16_2LE stereo, period 64 frames.
        let mut mix = MixBuffer::new(StreamFormat::S16_2LE, 2, 64, 512).unwrap();
        let mut a = 0u64;
        let mut b = 0u64;
        // Each client contributes 128 frames, fed period-wise.
        for _ in 0..2 {
            assert_eq!(mix.add(&mut a, &frames(1000, 64, 2)), 64);
            assert_eq!(mix.add(&mut b, &frames(-500, 64, 2)), 64);
        }
        assert!(mix.at_threshold());

        let mut out = vec![0u8; 128 * 4];
        assert_eq!(mix.read(&mut out, &[1.0, 1.0]), 64);
        assert_eq!(mix.read(&mut out[64 * 4..], &[1.0, 1.0]), 64);
        assert_eq!(out, frames(500, 128, 2));
        assert!(mix.is_empty());

        // The consumed slots were zeroed: summing again gives clean output.
        assert_eq!(mix.add(&mut a, &frames(123, 64, 2)), 64);
        let mut out = vec![0u8; 64 * 4];
        assert_eq!(mix.read(&mut out, &[1.0, 1.0]), 64);
        assert_eq!(out, frames(123, 64, 2));
    }

    #[test]
    fn add_respects_threshold_window() {
        let mut mix = MixBuffer::new(StreamFormat::S16_2LE, 1, 16, 64).unwrap();
        let mut a = 0u64;
        // One period per call.
        assert_eq!(mix.add(&mut a, &frames(1, 64, 1)), 16);
        assert_eq!(mix.add(&mut a, &frames(1, 64, 1)), 16);
        // The window is exhausted until the read head advances.
        assert_eq!(mix.add(&mut a, &frames(1, 64, 1)), 0);
        let mut out = vec![0u8; 16 * 2];
        assert_eq!(mix.read(&mut out, &[1.0]), 16);
        assert_eq!(mix.add(&mut a, &frames(1, 64, 1)), 16);
    }

    #[test]
    fn scale_and_clip() {
        let mut mix = MixBuffer::new(StreamFormat::S16_2LE, 1, 8, 32).unwrap();
        let mut a = 0u64;
        let mut b = 0u64;
        mix.add(&mut a, &s16(&[20000; 8]));
        mix.add(&mut b, &s16(&[20000; 8]));
        let mut out = vec![0u8; 8 * 2];
        // Unity scale clips the 40000 sum to i16::MAX.
        assert_eq!(mix.read(&mut out, &[1.0]), 8);
        assert_eq!(out, s16(&[i16::MAX; 8]));

        mix.add(&mut a, &s16(&[1000; 8]));
        let mut out = vec![0u8; 8 * 2];
        mix.read(&mut out, &[0.5]);
        assert_eq!(out, s16(&[500; 8]));
    }

    #[test]
    fn u8_uses_wider_backing() {
        let mut mix = MixBuffer::new(StreamFormat::U8, 1, 8, 32).unwrap();
        let mut a = 0u64;
        let mut b = 0u64;
        mix.add(&mut a, &[200u8; 8]);
        mix.add(&mut b, &[200u8; 8]);
        let mut out = [0u8; 8];
        mix.read(&mut out, &[1.0]);
        // 400 clipped to the unsigned 8-bit maximum.
        assert_eq!(out, [255u8; 8]);
    }

    #[test]
    fn capacity_must_exceed_window() {
        assert!(MixBuffer::new(StreamFormat::S16_2LE, 2, 64, 128).is_err());
        assert!(MixBuffer::new(StreamFormat::S16_2LE, 2, 64, 129).is_ok());
    }

    #[test]
    fn lagging_client_snaps_to_read_head() {
        let mut mix = MixBuffer::new(StreamFormat::S16_2LE, 1, 8, 32).unwrap();
        let mut a = 0u64;
        mix.add(&mut a, &s16(&[7; 8]));
        let mut out = vec![0u8; 8 * 2];
        mix.read(&mut out, &[1.0]);
        // A new client starts at offset zero but may not write behind the
        // read head.
        let mut b = 0u64;
        assert_eq!(mix.add(&mut b, &s16(&[9; 8])), 8);
        assert_eq!(b, 16);
    }
}
