//! Timestamp-addressed audio buffers.
//!
//! `read`/`write` are called from real-time audio callbacks and never go
//! through a session's queue. Each audio stream owns one pre-allocated
//! [`AudioRing`]; the real-time side only ever `try_lock`s it, so a contended
//! read produces silence and a contended write is dropped instead of waiting.
//!
//! Sample times are `u32` and wrap; all comparisons are done on the wrapping
//! difference.

use crate::errors::{ReceiverError, ReceiverResult};
use crate::platform::ClockSync;
use crate::protocol::StreamType;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Default sample rate when a stream setup does not carry one.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default frame size (16-bit stereo).
pub const DEFAULT_BYTES_PER_FRAME: usize = 4;

/// `a` precedes `b` in wrapping sample time.
#[allow(clippy::cast_possible_wrap)]
fn precedes(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[allow(clippy::cast_possible_wrap)]
fn signed_distance(from: u32, to: u32) -> i64 {
    i64::from(to.wrapping_sub(from) as i32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bytes_per_frame: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            bytes_per_frame: DEFAULT_BYTES_PER_FRAME,
        }
    }
}

/// Sample time paired with the synchronized time it plays at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncAnchor {
    pub sample_time: u32,
    pub synchronized_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { frames: usize },
    /// The ring was busy; nothing was written.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Frames copied from the ring; the rest of the buffer is silence.
    pub frames: usize,
    /// Local tick at which the first requested sample is due, once an anchor
    /// exists.
    pub due_tick: Option<u64>,
    pub contended: bool,
}

#[derive(Debug)]
struct RingState {
    buf: Vec<u8>,
    /// Oldest sample time held.
    start: u32,
    /// One past the newest sample time held.
    end: u32,
    empty: bool,
    anchor: Option<SyncAnchor>,
    flushed_sequence: Option<u32>,
}

impl RingState {
    fn held(&self) -> u32 {
        if self.empty {
            0
        } else {
            self.end.wrapping_sub(self.start)
        }
    }

    fn contains(&self, t: u32) -> bool {
        !self.empty && !precedes(t, self.start) && precedes(t, self.end)
    }
}

/// Pre-allocated ring for one audio stream.
pub struct AudioRing {
    stream_type: StreamType,
    format: AudioFormat,
    capacity: u32,
    clock: Arc<dyn ClockSync>,
    state: Mutex<RingState>,
}

impl std::fmt::Debug for AudioRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRing")
            .field("stream_type", &self.stream_type)
            .field("format", &self.format)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl AudioRing {
    /// # Errors
    ///
    /// `InvalidParameter` for a zero-sized format or a capacity beyond the
    /// sample-time range.
    pub fn new(
        stream_type: StreamType,
        format: AudioFormat,
        frames: usize,
        clock: Arc<dyn ClockSync>,
    ) -> ReceiverResult<Self> {
        if format.bytes_per_frame == 0 || format.sample_rate == 0 || frames == 0 {
            return Err(ReceiverError::InvalidParameter(
                "audio format and ring size must be non-zero".to_string(),
            ));
        }
        let capacity = u32::try_from(frames)
            .ok()
            .filter(|c| *c < u32::MAX / 2)
            .ok_or_else(|| ReceiverError::InvalidParameter(format!("ring of {frames} frames")))?;
        let bytes = frames.checked_mul(format.bytes_per_frame).ok_or_else(|| {
            ReceiverError::InvalidParameter(format!("ring of {frames} frames overflows"))
        })?;

        Ok(Self {
            stream_type,
            format,
            capacity,
            clock,
            state: Mutex::new(RingState {
                buf: vec![0; bytes],
                start: 0,
                end: 0,
                empty: true,
                anchor: None,
                flushed_sequence: None,
            }),
        })
    }

    #[must_use]
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    fn offset(&self, t: u32) -> usize {
        // capacity fits in u32, so the slot index does too
        (t % self.capacity) as usize * self.format.bytes_per_frame
    }

    /// Store `data` starting at `sample_time`. `host_tick` is the local tick
    /// the first frame was captured or received at.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `data` is not a whole number of frames.
    pub fn write(&self, sample_time: u32, host_tick: u64, data: &[u8]) -> ReceiverResult<WriteOutcome> {
        let bpf = self.format.bytes_per_frame;
        if data.len() % bpf != 0 {
            return Err(ReceiverError::InvalidParameter(format!(
                "{} bytes is not a whole number of {bpf}-byte frames",
                data.len()
            )));
        }
        let Some(mut state) = self.state.try_lock() else {
            return Ok(WriteOutcome::Dropped);
        };

        if state.empty {
            state.start = sample_time;
            state.end = sample_time;
            state.empty = false;
        }

        // Zero the hole between what we hold and where this write starts
        if precedes(state.end, sample_time) {
            let gap = sample_time.wrapping_sub(state.end).min(self.capacity);
            let first = sample_time.wrapping_sub(gap);
            for i in 0..gap {
                let off = self.offset(first.wrapping_add(i));
                if let Some(slot) = state.buf.get_mut(off..off + bpf) {
                    slot.fill(0);
                }
            }
            state.end = sample_time;
        }

        let mut frames = 0;
        let mut t = sample_time;
        for frame in data.chunks_exact(bpf) {
            // Anything older than what we hold (late, or already flushed) is dropped
            if !precedes(t, state.start) {
                let off = self.offset(t);
                if let Some(slot) = state.buf.get_mut(off..off + bpf) {
                    slot.copy_from_slice(frame);
                    frames += 1;
                }
            }
            t = t.wrapping_add(1);
        }

        if precedes(state.end, t) {
            state.end = t;
        }
        if state.held() > self.capacity {
            state.start = state.end.wrapping_sub(self.capacity);
        }

        state.anchor = Some(SyncAnchor {
            sample_time,
            synchronized_time: self.clock.synchronized_time_near_local_tick(host_tick),
        });

        Ok(WriteOutcome::Written { frames })
    }

    /// Fill `out` with frames from `sample_time` on. Missing frames read as
    /// silence.
    pub fn read(&self, sample_time: u32, out: &mut [u8]) -> ReadOutcome {
        out.fill(0);
        let Some(state) = self.state.try_lock() else {
            return ReadOutcome {
                frames: 0,
                due_tick: None,
                contended: true,
            };
        };

        let bpf = self.format.bytes_per_frame;
        let mut frames = 0;
        let mut t = sample_time;
        for dst in out.chunks_exact_mut(bpf) {
            if state.contains(t) {
                let off = self.offset(t);
                if let Some(src) = state.buf.get(off..off + bpf) {
                    dst.copy_from_slice(src);
                    frames += 1;
                }
            }
            t = t.wrapping_add(1);
        }

        let due_tick = state.anchor.map(|anchor| {
            let delta = signed_distance(anchor.sample_time, sample_time);
            let nanos = delta.saturating_mul(i64::try_from(NANOS_PER_SECOND).unwrap_or(i64::MAX))
                / i64::from(self.format.sample_rate);
            let synchronized = anchor.synchronized_time.saturating_add_signed(nanos);
            self.clock.local_tick_near_synchronized_time(synchronized)
        });

        ReadOutcome {
            frames,
            due_tick,
            contended: false,
        }
    }

    /// Discard everything before `until_timestamp`. Returns the last sample
    /// time still held, or `until_timestamp` when nothing is.
    ///
    /// Not called from the real-time side, so this waits for the lock.
    pub fn flush(&self, until_timestamp: u32, until_sequence: Option<u32>) -> u32 {
        let mut state = self.state.lock();
        state.flushed_sequence = until_sequence.or(state.flushed_sequence);

        if !state.empty && precedes(state.start, until_timestamp) {
            if precedes(until_timestamp, state.end) {
                state.start = until_timestamp;
            } else {
                state.empty = true;
            }
        }

        let last = if state.empty {
            until_timestamp
        } else {
            state.end.wrapping_sub(1)
        };
        debug!(
            target: "ar.audio",
            stream = ?self.stream_type,
            until_timestamp,
            until_sequence = ?until_sequence,
            last_timestamp = last,
            "Audio flushed"
        );
        last
    }

    #[must_use]
    pub fn held_frames(&self) -> u32 {
        self.state.lock().held()
    }

    #[must_use]
    pub fn anchor(&self) -> Option<SyncAnchor> {
        self.state.lock().anchor
    }

    /// Sequence number of the most recent flush that carried one.
    #[must_use]
    pub fn flushed_sequence(&self) -> Option<u32> {
        self.state.lock().flushed_sequence
    }
}

/// The audio rings of one session, shared with the real-time side.
#[derive(Debug, Default)]
pub struct AudioStreams {
    rings: RwLock<HashMap<StreamType, Arc<AudioRing>>>,
}

impl AudioStreams {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn insert(&self, ring: AudioRing) {
        self.rings.write().insert(ring.stream_type, Arc::new(ring));
    }

    pub(crate) fn remove(&self, stream_type: StreamType) -> bool {
        self.rings.write().remove(&stream_type).is_some()
    }

    pub(crate) fn clear(&self) {
        self.rings.write().clear();
    }

    fn ring(&self, stream_type: StreamType) -> Option<Arc<AudioRing>> {
        self.rings.try_read().and_then(|rings| rings.get(&stream_type).cloned())
    }

    /// Real-time read. Unknown or busy streams read as silence.
    pub fn read(&self, stream_type: StreamType, sample_time: u32, out: &mut [u8]) -> ReadOutcome {
        match self.ring(stream_type) {
            Some(ring) => ring.read(sample_time, out),
            None => {
                out.fill(0);
                ReadOutcome {
                    frames: 0,
                    due_tick: None,
                    contended: false,
                }
            }
        }
    }

    /// Real-time write.
    ///
    /// # Errors
    ///
    /// `NotReady` if the stream is not set up; `InvalidParameter` for a
    /// partial frame.
    pub fn write(
        &self,
        stream_type: StreamType,
        sample_time: u32,
        host_tick: u64,
        data: &[u8],
    ) -> ReceiverResult<WriteOutcome> {
        let ring = self
            .ring(stream_type)
            .ok_or_else(|| ReceiverError::NotReady(format!("no audio stream {stream_type:?}")))?;
        ring.write(sample_time, host_tick, data)
    }

    /// Flush every ring. Returns the latest last-held timestamp among them.
    pub(crate) fn flush(&self, until_timestamp: u32, until_sequence: Option<u32>) -> u32 {
        self.rings
            .read()
            .values()
            .map(|ring| ring.flush(until_timestamp, until_sequence))
            .reduce(|a, b| if precedes(a, b) { b } else { a })
            .unwrap_or(until_timestamp)
    }

    #[must_use]
    pub fn stream_types(&self) -> Vec<StreamType> {
        let mut types: Vec<StreamType> = self.rings.read().keys().copied().collect();
        types.sort();
        types
    }
}
