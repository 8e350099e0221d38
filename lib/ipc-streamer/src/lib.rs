// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flow-controlled chunk streaming between the update domain (the
//! requestor, which drives [`ChunkStreamer::stream`]) and the
//! application domain (the provider, which pushes chunks with
//! [`ChunkStreamer::chunk_enqueue`] and polls
//! [`ChunkStreamer::chunk_status_req`]).
//!
//! One session at a time. The requestor announces the image it needs
//! by notifying the missing-image subscriber until the first chunk
//! arrives; the provider enqueues chunks in whatever order it fetched
//! them, and the requestor consumes them strictly in arrival order,
//! seeking the sink when a chunk's offset is discontiguous. A full
//! slot table pushes back with `Busy`, which the provider clears by
//! collecting statuses.
//!
//! Chunk buffers are lent, not copied: `chunk_enqueue` hands back a
//! [`ChunkToken`] and the buffer stays owned by the streamer until
//! `chunk_status_req` reports the chunk as no longer `Pending`.
//!
//! Lock ordering: the session lock and the subscriber lock are never
//! held at the same time, and neither is ever held across sink I/O or
//! a subscriber callback. Callbacks observe the session only through
//! the public API.

#![cfg_attr(not(test), no_std)]

use drv_update_api::{ChunkInfo, ChunkStatus, UpdateError};
use ringbuf::{trace, Ringbuf};
use spin::Mutex;

/// Slot table depth, and therefore the most chunks that can be in
/// flight at once. Status-polling arrays sized to this can always
/// drain the table in one call.
pub const MAX_CHUNKS: usize = 4;

/// Millisecond clock seam; tests drive a manual one.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Where streamed bytes go. Offsets are image-relative; `write`
/// advances the position by the length written.
pub trait StreamSink {
    fn seek(&mut self, offset: u32) -> Result<(), UpdateError>;
    fn write(&mut self, data: &[u8]) -> Result<(), UpdateError>;
}

pub type MissingImageFn = fn(resource_id: &str, session_id: u32);
pub type ChunkStatusFn = fn(session_id: u32);

/// Receipt for an accepted chunk. The buffer behind it belongs to the
/// streamer until a status poll reports the chunk `Processed` or
/// `Refused`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use = "the chunk buffer is on loan until a status poll returns it"]
pub struct ChunkToken {
    pub session_id: u32,
    pub chunk_id: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    /// Session announced, no chunk yet.
    Open,
    Receiving,
    /// No further chunks accepted; statuses await collection.
    Draining,
    Closed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Empty,
    Pending,
    Processed,
    Refused,
}

#[derive(Copy, Clone)]
struct Slot<'buf> {
    state: SlotState,
    chunk_id: u32,
    offset: u32,
    data: Option<&'buf [u8]>,
    arrival: u32,
    last: bool,
}

impl Slot<'_> {
    const EMPTY: Self = Self {
        state: SlotState::Empty,
        chunk_id: 0,
        offset: 0,
        data: None,
        arrival: 0,
        last: false,
    };
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    SessionStart { session_id: u32 },
    MissingImageNotify,
    ChunkAccepted { chunk_id: u32, arrival: u32 },
    SlotsFull,
    ChunkProcessed { chunk_id: u32 },
    SinkFailed,
    TimedOut,
    StatusCollected { count: u8 },
    SessionClosed { session_id: u32 },
}

struct State<'buf> {
    stage: Stage,
    session_id: u32,
    next_session_id: u32,
    /// Arrival number handed to the next accepted chunk.
    next_arrival: u32,
    /// Highest arrival number already consumed.
    last_processed: u32,
    last_chunk_seen: bool,
    slots: [Slot<'buf>; MAX_CHUNKS],
    ring: Ringbuf<Trace, 32>,
}

impl State<'_> {
    const fn new() -> Self {
        Self {
            stage: Stage::Idle,
            session_id: 0,
            next_session_id: 1,
            next_arrival: 1,
            last_processed: 0,
            last_chunk_seen: false,
            slots: [Slot::EMPTY; MAX_CHUNKS],
            ring: Ringbuf::new(Trace::None),
        }
    }

    fn session_active(&self, session_id: u32) -> bool {
        self.session_id == session_id
            && !matches!(self.stage, Stage::Idle | Stage::Closed)
    }
}

#[derive(Default)]
struct Subscribers {
    missing_image: Option<MissingImageFn>,
    chunk_status: Option<ChunkStatusFn>,
}

pub struct ChunkStreamer<'buf> {
    state: Mutex<State<'buf>>,
    subs: Mutex<Subscribers>,
}

impl Default for ChunkStreamer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'buf> ChunkStreamer<'buf> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
            subs: Mutex::new(Subscribers {
                missing_image: None,
                chunk_status: None,
            }),
        }
    }

    /// Requestor-side lifecycle reset. Forgets any session; must not
    /// be called while a stream is running.
    pub fn requestor_init(&self) {
        *self.state.lock() = State::new();
    }

    /// Provider-side lifecycle reset: drops both subscriptions.
    pub fn provider_init(&self) {
        *self.subs.lock() = Subscribers::default();
    }

    pub fn missing_image_subscribe(
        &self,
        f: MissingImageFn,
    ) -> Result<(), UpdateError> {
        let mut subs = self.subs.lock();
        if subs.missing_image.is_some() {
            return Err(UpdateError::Nomem);
        }
        subs.missing_image = Some(f);
        Ok(())
    }

    pub fn missing_image_unsubscribe(&self) {
        self.subs.lock().missing_image = None;
    }

    pub fn chunk_status_subscribe(
        &self,
        f: ChunkStatusFn,
    ) -> Result<(), UpdateError> {
        let mut subs = self.subs.lock();
        if subs.chunk_status.is_some() {
            return Err(UpdateError::Nomem);
        }
        subs.chunk_status = Some(f);
        Ok(())
    }

    pub fn chunk_status_unsubscribe(&self) {
        self.subs.lock().chunk_status = None;
    }

    fn notify_missing_image(&self, resource_id: &str, session_id: u32) {
        let f = self.subs.lock().missing_image;
        if let Some(f) = f {
            f(resource_id, session_id);
        }
    }

    fn notify_chunk_status(&self, session_id: u32) {
        let f = self.subs.lock().chunk_status;
        if let Some(f) = f {
            f(session_id);
        }
    }

    /// Offers a chunk to the running session. Never blocks.
    ///
    /// `data: None` is a valid marker chunk (pure seek, or end-of-image
    /// when `last_chunk` is set); an empty `Some` slice is malformed.
    /// A full slot table yields `Busy`: collect statuses and retry.
    pub fn chunk_enqueue(
        &self,
        session_id: u32,
        chunk_id: u32,
        offset: u32,
        data: Option<&'buf [u8]>,
        last_chunk: bool,
    ) -> Result<ChunkToken, UpdateError> {
        if data.map_or(false, |d| d.is_empty()) {
            return Err(UpdateError::Inval);
        }

        let mut state = self.state.lock();
        if !state.session_active(session_id)
            || state.stage == Stage::Draining
            || state.last_chunk_seen
        {
            return Err(UpdateError::IncorrectState);
        }

        let Some(idx) = state
            .slots
            .iter()
            .position(|s| s.state == SlotState::Empty)
        else {
            trace!(state.ring, Trace::SlotsFull);
            return Err(UpdateError::Busy);
        };

        let arrival = state.next_arrival;
        state.next_arrival += 1;
        state.slots[idx] = Slot {
            state: SlotState::Pending,
            chunk_id,
            offset,
            data,
            arrival,
            last: last_chunk,
        };

        state.last_chunk_seen |= last_chunk;
        if state.stage == Stage::Open {
            state.stage = Stage::Receiving;
        }
        trace!(state.ring, Trace::ChunkAccepted { chunk_id, arrival });

        Ok(ChunkToken {
            session_id,
            chunk_id,
        })
    }

    /// Reports every occupied slot into `out` and frees the ones that
    /// are `Processed` or `Refused`. If `out` cannot hold them all the
    /// call fails with `Busy` and frees nothing; an array sized to
    /// [`MAX_CHUNKS`] never hits that path.
    pub fn chunk_status_req(
        &self,
        session_id: u32,
        out: &mut [ChunkInfo],
    ) -> Result<usize, UpdateError> {
        let mut state = self.state.lock();
        if !state.session_active(session_id) {
            return Err(UpdateError::IncorrectState);
        }

        let count = state
            .slots
            .iter()
            .filter(|s| s.state != SlotState::Empty)
            .count();
        if out.len() < count {
            return Err(UpdateError::Busy);
        }

        let mut n = 0;
        for slot in state.slots.iter_mut() {
            let status = match slot.state {
                SlotState::Empty => continue,
                SlotState::Pending => ChunkStatus::Pending,
                SlotState::Processed => ChunkStatus::Processed,
                SlotState::Refused => ChunkStatus::Refused,
            };
            out[n] = ChunkInfo {
                chunk_id: slot.chunk_id,
                status,
            };
            n += 1;
            if status != ChunkStatus::Pending {
                *slot = Slot::EMPTY;
            }
        }
        trace!(state.ring, Trace::StatusCollected { count: n as u8 });

        // Once a draining session's statuses are all collected, the
        // session is over.
        if state.stage == Stage::Draining
            && state.slots.iter().all(|s| s.state == SlotState::Empty)
        {
            state.stage = Stage::Closed;
            trace!(state.ring, Trace::SessionClosed { session_id });
        }
        Ok(n)
    }

    /// Blocking requestor loop: streams one image into `sink`.
    ///
    /// Announces `resource_id` to the missing-image subscriber every
    /// `requesting_period_ms` until the first chunk arrives. Aborts
    /// with `Time` when nothing arrives within `inter_chunk_timeout_ms`
    /// of the last arrival. Returns once the last chunk is consumed;
    /// the session then drains until the provider has collected all
    /// statuses. `relax` is invoked whenever there is nothing to do.
    pub fn stream(
        &self,
        resource_id: &str,
        sink: &mut impl StreamSink,
        inter_chunk_timeout_ms: u64,
        requesting_period_ms: u64,
        clock: &impl Clock,
        relax: &mut impl FnMut(),
    ) -> Result<(), UpdateError> {
        let session_id = {
            let mut state = self.state.lock();
            if !matches!(state.stage, Stage::Idle | Stage::Closed) {
                return Err(UpdateError::IncorrectState);
            }
            let id = state.next_session_id;
            state.next_session_id = match id.wrapping_add(1) {
                0 => 1, // session id 0 is reserved as "no session"
                n => n,
            };
            state.session_id = id;
            state.stage = Stage::Open;
            state.next_arrival = 1;
            state.last_processed = 0;
            state.last_chunk_seen = false;
            state.slots = [Slot::EMPTY; MAX_CHUNKS];
            trace!(state.ring, Trace::SessionStart { session_id: id });
            id
        };

        let mut sink_offset: u32 = 0;
        let mut last_notify: Option<u64> = None;
        let mut last_arrival_seen: u32 = 1;
        let mut deadline_base = clock.now_ms();

        loop {
            let now = clock.now_ms();
            let mut state = self.state.lock();

            // Any new arrival resets the inter-chunk deadline, eligible
            // for processing or not.
            if state.next_arrival != last_arrival_seen {
                last_arrival_seen = state.next_arrival;
                deadline_base = now;
            }

            let wanted = state.last_processed + 1;
            let eligible = state
                .slots
                .iter()
                .position(|s| s.state == SlotState::Pending && s.arrival == wanted);

            if let Some(idx) = eligible {
                let chunk = state.slots[idx];
                drop(state);

                let io = consume_chunk(sink, &mut sink_offset, &chunk);

                let mut state = self.state.lock();
                match io {
                    Ok(()) => {
                        state.slots[idx].state = SlotState::Processed;
                        state.slots[idx].data = None;
                        state.last_processed = wanted;
                        trace!(
                            state.ring,
                            Trace::ChunkProcessed {
                                chunk_id: chunk.chunk_id,
                            }
                        );
                        let done = chunk.last;
                        if done {
                            state.stage = Stage::Draining;
                        }
                        drop(state);
                        self.notify_chunk_status(session_id);
                        deadline_base = now;
                        if done {
                            return Ok(());
                        }
                    }
                    Err(_) => {
                        // The sink is wedged; the whole session fails
                        // and every outstanding chunk bounces back.
                        state.slots[idx].state = SlotState::Refused;
                        state.slots[idx].data = None;
                        for slot in state.slots.iter_mut() {
                            if slot.state == SlotState::Pending {
                                slot.state = SlotState::Refused;
                                slot.data = None;
                            }
                        }
                        state.stage = Stage::Draining;
                        trace!(state.ring, Trace::SinkFailed);
                        drop(state);
                        self.notify_chunk_status(session_id);
                        return Err(UpdateError::Crash);
                    }
                }
                continue;
            }

            if state.stage == Stage::Open
                && last_notify.map_or(true, |t| {
                    now.saturating_sub(t) >= requesting_period_ms
                })
            {
                trace!(state.ring, Trace::MissingImageNotify);
                drop(state);
                self.notify_missing_image(resource_id, session_id);
                last_notify = Some(now);
                continue;
            }

            if now.saturating_sub(deadline_base) >= inter_chunk_timeout_ms {
                for slot in state.slots.iter_mut() {
                    if slot.state == SlotState::Pending {
                        slot.state = SlotState::Refused;
                        slot.data = None;
                    }
                }
                // With nothing to hand back there is nothing to drain.
                if state.slots.iter().all(|s| s.state == SlotState::Empty) {
                    state.stage = Stage::Closed;
                } else {
                    state.stage = Stage::Draining;
                }
                trace!(state.ring, Trace::TimedOut);
                drop(state);
                self.notify_chunk_status(session_id);
                return Err(UpdateError::Time);
            }

            drop(state);
            relax();
        }
    }
}

/// Sink I/O for one chunk. Callers must not hold any lock.
fn consume_chunk(
    sink: &mut impl StreamSink,
    sink_offset: &mut u32,
    chunk: &Slot<'_>,
) -> Result<(), UpdateError> {
    if chunk.offset != *sink_offset {
        sink.seek(chunk.offset)?;
        *sink_offset = chunk.offset;
    }
    if let Some(data) = chunk.data {
        sink.write(data)?;
        *sink_offset += data.len() as u32;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::thread;

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::Relaxed);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    struct WallClock(std::time::Instant);

    impl Clock for WallClock {
        fn now_ms(&self) -> u64 {
            self.0.elapsed().as_millis() as u64
        }
    }

    /// Image-shaped sink: seek + write land bytes at offsets, and an
    /// optional gate stalls writes to make backpressure deterministic.
    struct ImageSink<'a> {
        image: Vec<u8>,
        pos: usize,
        gate: Option<&'a AtomicBool>,
        fail_writes: bool,
    }

    impl<'a> ImageSink<'a> {
        fn new(size: usize) -> Self {
            Self {
                image: vec![0xFF; size],
                pos: 0,
                gate: None,
                fail_writes: false,
            }
        }
    }

    impl StreamSink for ImageSink<'_> {
        fn seek(&mut self, offset: u32) -> Result<(), UpdateError> {
            if offset as usize > self.image.len() {
                return Err(UpdateError::Inval);
            }
            self.pos = offset as usize;
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), UpdateError> {
            if let Some(gate) = self.gate {
                while gate.load(Ordering::Acquire) {
                    thread::yield_now();
                }
            }
            if self.fail_writes {
                return Err(UpdateError::Io);
            }
            if self.pos + data.len() > self.image.len() {
                return Err(UpdateError::Inval);
            }
            self.image[self.pos..self.pos + data.len()].copy_from_slice(data);
            self.pos += data.len();
            Ok(())
        }
    }

    fn drain_all(streamer: &ChunkStreamer<'_>, session: u32) {
        let mut out = [ChunkInfo {
            chunk_id: 0,
            status: ChunkStatus::Pending,
        }; MAX_CHUNKS];
        // Keep collecting until the session closes.
        while streamer.chunk_status_req(session, &mut out).is_ok() {
            thread::yield_now();
        }
    }

    #[test]
    fn enqueue_requires_session() {
        let streamer = ChunkStreamer::new();
        assert_eq!(
            streamer.chunk_enqueue(1, 0, 0, Some(b"abc"), false),
            Err(UpdateError::IncorrectState)
        );
        let mut out = [];
        assert_eq!(
            streamer.chunk_status_req(1, &mut out),
            Err(UpdateError::IncorrectState)
        );
    }

    #[test]
    fn empty_chunk_data_is_invalid() {
        let streamer = ChunkStreamer::new();
        assert_eq!(
            streamer.chunk_enqueue(1, 0, 0, Some(b""), false),
            Err(UpdateError::Inval)
        );
    }

    #[test]
    fn single_subscriber_each() {
        fn mi(_: &str, _: u32) {}
        fn cs(_: u32) {}

        let streamer = ChunkStreamer::new();
        streamer.missing_image_subscribe(mi).unwrap();
        assert_eq!(
            streamer.missing_image_subscribe(mi),
            Err(UpdateError::Nomem)
        );
        streamer.missing_image_unsubscribe();
        streamer.missing_image_subscribe(mi).unwrap();

        streamer.chunk_status_subscribe(cs).unwrap();
        assert_eq!(streamer.chunk_status_subscribe(cs), Err(UpdateError::Nomem));

        streamer.provider_init();
        streamer.missing_image_subscribe(mi).unwrap();
        streamer.chunk_status_subscribe(cs).unwrap();
    }

    #[test]
    fn times_out_without_chunks_and_keeps_asking() {
        static ASKED: AtomicU32 = AtomicU32::new(0);
        fn on_missing(resource: &str, _session: u32) {
            assert_eq!(resource, "app.fw");
            ASKED.fetch_add(1, Ordering::Relaxed);
        }

        let streamer = ChunkStreamer::new();
        streamer.missing_image_subscribe(on_missing).unwrap();

        let clock = ManualClock(AtomicU64::new(0));
        let mut sink = ImageSink::new(64);
        let r = streamer.stream(
            "app.fw",
            &mut sink,
            100,
            10,
            &clock,
            &mut || clock.advance(5),
        );
        assert_eq!(r, Err(UpdateError::Time));
        // t=0 plus every 10ms until the 100ms timeout.
        assert!(ASKED.load(Ordering::Relaxed) >= 5);
    }

    #[test]
    fn out_of_order_chunks_assemble_in_arrival_order() {
        static SESSION: AtomicU32 = AtomicU32::new(0);
        fn on_missing(_: &str, session: u32) {
            SESSION.store(session, Ordering::Release);
        }
        SESSION.store(0, Ordering::Release);

        let streamer = ChunkStreamer::new();
        streamer.missing_image_subscribe(on_missing).unwrap();

        let part0: Vec<u8> = (0..100).collect();
        let part1: Vec<u8> = (100..200).collect();
        let part2: Vec<u8> = (0..100).map(|b| b ^ 0xA5).collect();

        thread::scope(|s| {
            let streamer = &streamer;
            let (part0, part1, part2) = (&part0, &part1, &part2);

            let provider = s.spawn(move || {
                let session = loop {
                    let id = SESSION.load(Ordering::Acquire);
                    if id != 0 {
                        break id;
                    }
                    thread::yield_now();
                };

                // Fetched out of order: the tail lands first.
                let _ = streamer
                    .chunk_enqueue(session, 10, 200, Some(part2), false)
                    .unwrap();
                let _ = streamer
                    .chunk_enqueue(session, 11, 0, Some(part0), false)
                    .unwrap();
                let _ = streamer
                    .chunk_enqueue(session, 12, 100, Some(part1), false)
                    .unwrap();
                // End marker, no payload.
                let _ = streamer
                    .chunk_enqueue(session, 13, 300, None, true)
                    .unwrap();

                drain_all(streamer, session);
            });

            let mut sink = ImageSink::new(300);
            let clock = WallClock(std::time::Instant::now());
            streamer
                .stream(
                    "app.fw",
                    &mut sink,
                    5_000,
                    1,
                    &clock,
                    &mut thread::yield_now,
                )
                .unwrap();
            provider.join().unwrap();

            let mut expected = Vec::new();
            expected.extend_from_slice(&part0);
            expected.extend_from_slice(&part1);
            expected.extend_from_slice(&part2);
            assert_eq!(sink.image, expected);
        });
    }

    #[test]
    fn backpressure_busy_then_retry_succeeds() {
        static SESSION: AtomicU32 = AtomicU32::new(0);
        fn on_missing(_: &str, session: u32) {
            SESSION.store(session, Ordering::Release);
        }
        SESSION.store(0, Ordering::Release);

        let streamer = ChunkStreamer::new();
        streamer.missing_image_subscribe(on_missing).unwrap();

        let gate = AtomicBool::new(true);
        let chunk: Vec<u8> = vec![0x42; 50];

        thread::scope(|s| {
            let streamer = &streamer;
            let (gate, chunk) = (&gate, &chunk);

            let provider = s.spawn(move || {
                let session = loop {
                    let id = SESSION.load(Ordering::Acquire);
                    if id != 0 {
                        break id;
                    }
                    thread::yield_now();
                };

                // The sink is gated shut, so nothing completes and the
                // table fills.
                for i in 0..MAX_CHUNKS as u32 {
                    let _ = streamer
                        .chunk_enqueue(
                            session,
                            i,
                            i * 50,
                            Some(chunk),
                            false,
                        )
                        .unwrap();
                }
                assert_eq!(
                    streamer.chunk_enqueue(
                        session,
                        99,
                        999,
                        Some(chunk),
                        false
                    ),
                    Err(UpdateError::Busy)
                );

                // An undersized status array is also pushed back, and
                // frees nothing.
                let mut tiny = [];
                assert_eq!(
                    streamer.chunk_status_req(session, &mut tiny),
                    Err(UpdateError::Busy)
                );

                // Open the gate and poll until a slot frees up.
                gate.store(false, Ordering::Release);
                let mut out = [ChunkInfo {
                    chunk_id: 0,
                    status: ChunkStatus::Pending,
                }; MAX_CHUNKS];
                loop {
                    let n = streamer.chunk_status_req(session, &mut out).unwrap();
                    let freed = out[..n]
                        .iter()
                        .any(|c| c.status == ChunkStatus::Processed);
                    if freed {
                        break;
                    }
                    thread::yield_now();
                }

                // The retry that Busy promised would work.
                let _ = streamer
                    .chunk_enqueue(
                        session,
                        4,
                        MAX_CHUNKS as u32 * 50,
                        None,
                        true,
                    )
                    .unwrap();

                drain_all(streamer, session);
            });

            let mut sink = ImageSink::new(256);
            sink.gate = Some(&gate);
            let clock = WallClock(std::time::Instant::now());
            streamer
                .stream(
                    "app.fw",
                    &mut sink,
                    10_000,
                    1,
                    &clock,
                    &mut thread::yield_now,
                )
                .unwrap();
            provider.join().unwrap();

            assert_eq!(&sink.image[..200], &[0x42; 200][..]);
        });
    }

    #[test]
    fn sink_failure_refuses_outstanding_chunks() {
        static SESSION: AtomicU32 = AtomicU32::new(0);
        fn on_missing(_: &str, session: u32) {
            SESSION.store(session, Ordering::Release);
        }
        SESSION.store(0, Ordering::Release);

        let streamer = ChunkStreamer::new();
        streamer.missing_image_subscribe(on_missing).unwrap();

        let chunk: Vec<u8> = vec![7; 10];
        // Hold the first write until both chunks are in, so the failure
        // deterministically finds an outstanding second chunk.
        let gate = AtomicBool::new(true);

        thread::scope(|s| {
            let streamer = &streamer;
            let (chunk, gate) = (&chunk, &gate);

            let provider = s.spawn(move || {
                let session = loop {
                    let id = SESSION.load(Ordering::Acquire);
                    if id != 0 {
                        break id;
                    }
                    thread::yield_now();
                };
                let _ = streamer
                    .chunk_enqueue(session, 1, 0, Some(chunk), false)
                    .unwrap();
                let _ = streamer
                    .chunk_enqueue(session, 2, 10, Some(chunk), false)
                    .unwrap();
                gate.store(false, Ordering::Release);

                // Eventually every chunk must come back Refused.
                let mut out = [ChunkInfo {
                    chunk_id: 0,
                    status: ChunkStatus::Pending,
                }; MAX_CHUNKS];
                let mut refused = 0;
                while refused < 2 {
                    match streamer.chunk_status_req(session, &mut out) {
                        Ok(n) => {
                            refused += out[..n]
                                .iter()
                                .filter(|c| c.status == ChunkStatus::Refused)
                                .count();
                        }
                        // Session closed underneath us: all collected.
                        Err(UpdateError::IncorrectState) => break,
                        Err(e) => panic!("unexpected error {e:?}"),
                    }
                    thread::yield_now();
                }

                // The dead session refuses new chunks.
                assert_eq!(
                    streamer.chunk_enqueue(session, 3, 20, Some(chunk), false),
                    Err(UpdateError::IncorrectState)
                );
            });

            let mut sink = ImageSink::new(64);
            sink.gate = Some(&gate);
            sink.fail_writes = true;
            let clock = WallClock(std::time::Instant::now());
            let r = streamer.stream(
                "app.fw",
                &mut sink,
                10_000,
                1,
                &clock,
                &mut thread::yield_now,
            );
            assert_eq!(r, Err(UpdateError::Crash));
            provider.join().unwrap();
        });
    }

    #[test]
    fn sessions_get_distinct_ids_and_sequential_reuse_works() {
        let streamer = ChunkStreamer::new();
        let clock = ManualClock(AtomicU64::new(0));

        let mut sink = ImageSink::new(16);
        let r = streamer.stream("a", &mut sink, 10, 5, &clock, &mut || {
            clock.advance(3)
        });
        assert_eq!(r, Err(UpdateError::Time));

        // First session timed out with no chunks outstanding, so a new
        // one can start immediately.
        let r = streamer.stream("a", &mut sink, 10, 5, &clock, &mut || {
            clock.advance(3)
        });
        assert_eq!(r, Err(UpdateError::Time));
    }
}
