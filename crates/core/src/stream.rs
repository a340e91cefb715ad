//! Real-time pacing loop.
//!
//! One thread both reads frames and writes packets. Per frame:
//!
//! ```text
//! cancelled? ── yes ──> return report
//!     │ no
//! next access unit ── none ──> restart source (loop forever)
//!     │
//! start = now
//! packetize + send every chunk, in index order
//! sleep(max(0, interval - (now - start)))
//! ```
//!
//! `interval = speed_multiplier / source_fps`. Cancellation is checked
//! only between frames, so a packet burst is never torn. A frame that
//! takes longer than the interval to send is followed immediately by the
//! next one; frames are never dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::media::{AccessUnit, Packetizer};
use crate::source::FrameSource;
use crate::transport::Sink;

/// Time source for pacing.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock with a blocking thread sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Cooperative cancellation flag shared with another thread (e.g. a
/// Ctrl-C handler).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Counters for one streaming run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReport {
    /// Access units whose packets were all handed to the sink.
    pub frames_sent: u64,
    /// Packets the sink accepted.
    pub packets_sent: u64,
    /// Payload bytes (excluding header and padding) the sink accepted.
    pub payload_bytes: u64,
    /// Packet writes the sink rejected.
    pub write_failures: u64,
    /// Access units dropped because they could not be packetized.
    pub frames_skipped: u64,
    /// Complete passes over the source.
    pub loops_completed: u64,
    /// Frames whose send took longer than the frame interval.
    pub overruns: u64,
}

/// Compute `speed_multiplier / fps` as a duration.
///
/// The frame rate must be present, finite and positive; the caller owns any
/// default-rate policy for sources that do not report one.
pub fn frame_interval(speed_multiplier: f64, fps: Option<f64>) -> Result<Duration> {
    let rate = match fps {
        Some(rate) if rate.is_finite() && rate > 0.0 => rate,
        other => return Err(StreamError::InvalidFrameRate(other)),
    };
    Duration::try_from_secs_f64(speed_multiplier / rate)
        .map_err(|_| StreamError::InvalidFrameRate(fps))
}

/// Transient state of one run.
struct StreamSession {
    frame_index: u64,
    frame_interval: Duration,
    last_frame_start: Option<Instant>,
    frames_this_pass: u64,
    consecutive_failures: u64,
    report: StreamReport,
}

impl StreamSession {
    fn new(frame_interval: Duration) -> Self {
        Self {
            frame_index: 0,
            frame_interval,
            last_frame_start: None,
            frames_this_pass: 0,
            consecutive_failures: 0,
            report: StreamReport::default(),
        }
    }
}

/// Drives a [`FrameSource`] through a [`Packetizer`] into a [`Sink`] at the
/// source frame rate.
pub struct Streamer<K: Sink, C: Clock = SystemClock> {
    packetizer: Packetizer,
    config: StreamConfig,
    sink: K,
    clock: C,
    cancel: CancelToken,
}

impl<K: Sink> Streamer<K> {
    pub fn new(packetizer: Packetizer, config: StreamConfig, sink: K) -> Result<Self> {
        Self::with_clock(packetizer, config, sink, SystemClock)
    }
}

impl<K: Sink, C: Clock> Streamer<K, C> {
    /// Create a streamer with a custom time source.
    pub fn with_clock(
        packetizer: Packetizer,
        config: StreamConfig,
        sink: K,
        clock: C,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            packetizer,
            config,
            sink,
            clock,
            cancel: CancelToken::new(),
        })
    }

    /// Share a token created elsewhere, e.g. one a signal handler already holds.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Handle that stops [`run`](Self::run) at the next frame boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Stream `source` until cancelled, or until `max_loops` passes complete.
    ///
    /// Source errors end the run and are returned. Write errors are counted
    /// and logged; they end the run only when
    /// `max_consecutive_write_failures` is set and reached.
    pub fn run<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> Result<StreamReport> {
        let fps = source.frame_rate();
        let interval = frame_interval(self.config.speed_multiplier, fps)?;
        let mut session = StreamSession::new(interval);

        tracing::info!(
            fps = fps.unwrap_or_default(),
            speed = self.config.speed_multiplier,
            interval_ms = interval.as_secs_f64() * 1000.0,
            "streaming started"
        );

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(frames = session.frame_index, "stream cancelled");
                break;
            }

            let Some(unit) = source.next_frame()? else {
                if session.frames_this_pass == 0 {
                    return Err(StreamError::EmptySource);
                }
                session.report.loops_completed += 1;
                session.frames_this_pass = 0;

                if self
                    .config
                    .max_loops
                    .is_some_and(|max| session.report.loops_completed >= max)
                {
                    tracing::debug!(loops = session.report.loops_completed, "loop limit reached");
                    break;
                }

                tracing::debug!(
                    loops = session.report.loops_completed,
                    "source exhausted, restarting"
                );
                source.restart()?;
                continue;
            };
            session.frames_this_pass += 1;

            let start = self.clock.now();
            if let Some(previous) = session.last_frame_start {
                let since_last = start.saturating_duration_since(previous);
                tracing::trace!(
                    frame = session.frame_index,
                    since_last_ms = since_last.as_secs_f64() * 1000.0,
                    "frame start"
                );
            }
            session.last_frame_start = Some(start);

            self.send_frame(&mut session, &unit)?;
            session.frame_index += 1;

            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed < session.frame_interval {
                self.clock.sleep(session.frame_interval - elapsed);
            } else if !session.frame_interval.is_zero() && elapsed > session.frame_interval {
                session.report.overruns += 1;
                tracing::debug!(
                    frame = session.frame_index,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    budget_ms = session.frame_interval.as_secs_f64() * 1000.0,
                    "frame send overran interval"
                );
            }
        }

        tracing::info!(
            frames = session.report.frames_sent,
            packets = session.report.packets_sent,
            write_failures = session.report.write_failures,
            skipped = session.report.frames_skipped,
            loops = session.report.loops_completed,
            overruns = session.report.overruns,
            "streaming stopped"
        );
        Ok(session.report)
    }

    /// Packetize and send one access unit in chunk order.
    fn send_frame(&mut self, session: &mut StreamSession, unit: &AccessUnit) -> Result<()> {
        let chunks = match self.packetizer.packetize(unit.as_bytes()) {
            Ok(chunks) => chunks,
            Err(e) => {
                session.report.frames_skipped += 1;
                tracing::warn!(frame = session.frame_index, error = %e, "skipping frame");
                return Ok(());
            }
        };

        let packet_count = chunks.len();
        for packet in chunks {
            match self.sink.send(packet.as_bytes()) {
                Ok(()) => {
                    session.report.packets_sent += 1;
                    session.report.payload_bytes += u64::from(packet.header().chunk_len);
                    session.consecutive_failures = 0;
                }
                Err(e) => {
                    session.report.write_failures += 1;
                    session.consecutive_failures += 1;
                    tracing::warn!(
                        frame = session.frame_index,
                        chunk = packet.header().chunk_index,
                        failures = session.report.write_failures,
                        error = %e,
                        "packet write failed"
                    );
                    if self
                        .config
                        .max_consecutive_write_failures
                        .is_some_and(|max| session.consecutive_failures >= max)
                    {
                        return Err(StreamError::TooManyWriteFailures(
                            session.consecutive_failures,
                        ));
                    }
                }
            }
        }

        session.report.frames_sent += 1;
        tracing::trace!(
            frame = session.frame_index,
            frame_bytes = unit.len(),
            packets = packet_count,
            "frame sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::media::ChunkHeader;
    use crate::source::MemorySource;
    use crate::transport::CaptureSink;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Clock that only moves when slept or advanced by a sink.
    #[derive(Clone)]
    struct ManualClock {
        base: Instant,
        offset: Rc<Cell<Duration>>,
        sleeps: Rc<RefCell<Vec<Duration>>>,
        starts: Rc<RefCell<Vec<Duration>>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Rc::new(Cell::new(Duration::ZERO)),
                sleeps: Rc::new(RefCell::new(Vec::new())),
                starts: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn advance(&self, by: Duration) {
            self.offset.set(self.offset.get() + by);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + self.offset.get()
        }

        fn sleep(&self, duration: Duration) {
            self.sleeps.borrow_mut().push(duration);
            self.advance(duration);
        }
    }

    /// Sink that takes `per_packet` of clock time and records when each
    /// frame's first chunk arrives.
    struct SlowSink {
        clock: ManualClock,
        per_packet: Duration,
        packets: Vec<Vec<u8>>,
    }

    impl Sink for SlowSink {
        fn send(&mut self, packet: &[u8]) -> Result<()> {
            if ChunkHeader::parse(packet).is_some_and(|h| h.chunk_index == 0) {
                self.clock.starts.borrow_mut().push(self.clock.offset.get());
            }
            self.clock.advance(self.per_packet);
            self.packets.push(packet.to_vec());
            Ok(())
        }
    }

    /// Sink that rejects packets whose send index is in `fail`.
    struct FlakySink {
        sent: usize,
        fail: fn(usize) -> bool,
        accepted: Vec<Vec<u8>>,
    }

    impl Sink for FlakySink {
        fn send(&mut self, packet: &[u8]) -> Result<()> {
            let n = self.sent;
            self.sent += 1;
            if (self.fail)(n) {
                return Err(StreamError::ShortWrite {
                    written: 0,
                    expected: packet.len(),
                });
            }
            self.accepted.push(packet.to_vec());
            Ok(())
        }
    }

    fn packetizer() -> Packetizer {
        Packetizer::new(ProtocolConfig::default()).unwrap()
    }

    fn looped(loops: u64) -> StreamConfig {
        StreamConfig {
            max_loops: Some(loops),
            ..Default::default()
        }
    }

    fn frames(lens: &[usize]) -> Vec<AccessUnit> {
        lens.iter()
            .enumerate()
            .map(|(i, &len)| AccessUnit::new(vec![i as u8 + 1; len]))
            .collect()
    }

    // --- frame interval ---

    #[test]
    fn interval_is_speed_over_fps() {
        assert_eq!(frame_interval(1.0, Some(10.0)).unwrap(), Duration::from_millis(100));
        assert_eq!(frame_interval(2.0, Some(10.0)).unwrap(), Duration::from_millis(200));
        assert_eq!(frame_interval(0.5, Some(25.0)).unwrap(), Duration::from_millis(20));
        assert_eq!(frame_interval(0.0, Some(30.0)).unwrap(), Duration::ZERO);
    }

    #[test]
    fn interval_rejects_bad_rates() {
        for fps in [None, Some(0.0), Some(-5.0), Some(f64::NAN), Some(f64::INFINITY)] {
            assert!(
                matches!(frame_interval(1.0, fps), Err(StreamError::InvalidFrameRate(_))),
                "{fps:?} should be rejected"
            );
        }
    }

    #[test]
    fn run_fails_fast_without_frame_rate() {
        let sink = CaptureSink::new();
        let mut streamer = Streamer::new(packetizer(), looped(1), sink.clone()).unwrap();
        let mut source = MemorySource::new(frames(&[10]), None);
        assert!(matches!(
            streamer.run(&mut source),
            Err(StreamError::InvalidFrameRate(None))
        ));
        assert!(sink.is_empty());
    }

    #[test]
    fn rejects_negative_speed() {
        let config = StreamConfig {
            speed_multiplier: -1.0,
            ..Default::default()
        };
        assert!(Streamer::new(packetizer(), config, CaptureSink::new()).is_err());
    }

    // --- pacing ---

    #[test]
    fn sleeps_remaining_budget() {
        let clock = ManualClock::new();
        let sink = SlowSink {
            clock: clock.clone(),
            per_packet: Duration::from_millis(5),
            packets: Vec::new(),
        };
        let mut streamer =
            Streamer::with_clock(packetizer(), looped(1), sink, clock.clone()).unwrap();
        // 1000 bytes -> 2 packets -> 10ms of send time per frame
        let mut source = MemorySource::new(frames(&[1000, 1000, 1000, 1000]), Some(10.0));

        let report = streamer.run(&mut source).unwrap();
        assert_eq!(report.frames_sent, 4);
        assert_eq!(report.overruns, 0);

        let sleeps = clock.sleeps.borrow();
        assert_eq!(sleeps.len(), 4);
        assert!(sleeps.iter().all(|&s| s == Duration::from_millis(90)));

        let starts = clock.starts.borrow();
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(100));
        }
    }

    #[test]
    fn overrun_skips_sleep_without_dropping_frames() {
        let clock = ManualClock::new();
        let sink = SlowSink {
            clock: clock.clone(),
            per_packet: Duration::from_millis(80),
            packets: Vec::new(),
        };
        let mut streamer =
            Streamer::with_clock(packetizer(), looped(1), sink, clock.clone()).unwrap();
        // 2 packets * 80ms = 160ms against a 100ms budget
        let mut source = MemorySource::new(frames(&[600, 600, 600]), Some(10.0));

        let report = streamer.run(&mut source).unwrap();
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.overruns, 3);
        assert!(clock.sleeps.borrow().is_empty());
        assert_eq!(streamer.into_sink().packets.len(), 6);
    }

    #[test]
    fn zero_speed_never_sleeps() {
        let clock = ManualClock::new();
        let config = StreamConfig {
            speed_multiplier: 0.0,
            max_loops: Some(2),
            ..Default::default()
        };
        let mut streamer =
            Streamer::with_clock(packetizer(), config, CaptureSink::new(), clock.clone())
                .unwrap();
        let mut source = MemorySource::new(frames(&[10, 10]), Some(10.0));
        let report = streamer.run(&mut source).unwrap();
        assert_eq!(report.frames_sent, 4);
        assert_eq!(report.overruns, 0);
        assert!(clock.sleeps.borrow().is_empty());
    }

    // --- looping ---

    #[test]
    fn fourth_frame_is_first_access_unit() {
        let clock = ManualClock::new();
        let sink = CaptureSink::new();
        let mut streamer =
            Streamer::with_clock(packetizer(), looped(2), sink.clone(), clock).unwrap();
        let units = frames(&[20, 30, 40]);
        let mut source = MemorySource::new(units.clone(), Some(10.0));

        let report = streamer.run(&mut source).unwrap();
        assert_eq!(report.loops_completed, 2);
        assert_eq!(report.frames_sent, 6);
        assert_eq!(source.restarts(), 1);

        let packets = sink.packets();
        let header = ChunkHeader::parse(&packets[3]).unwrap();
        let payload = &packets[3][11..11 + header.chunk_len as usize];
        assert_eq!(payload, units[0].as_bytes());
    }

    #[test]
    fn empty_source_is_an_error() {
        let mut streamer =
            Streamer::with_clock(packetizer(), looped(3), CaptureSink::new(), ManualClock::new())
                .unwrap();
        let mut source = MemorySource::new(Vec::new(), Some(10.0));
        assert!(matches!(
            streamer.run(&mut source),
            Err(StreamError::EmptySource)
        ));
    }

    struct BrokenSource {
        served: usize,
    }

    impl FrameSource for BrokenSource {
        fn frame_rate(&self) -> Option<f64> {
            Some(10.0)
        }

        fn next_frame(&mut self) -> Result<Option<AccessUnit>> {
            self.served += 1;
            if self.served > 2 {
                return Err(StreamError::Source("decoder gave up".into()));
            }
            Ok(Some(AccessUnit::new(vec![0xAB; 8])))
        }

        fn restart(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn source_error_propagates() {
        let sink = CaptureSink::new();
        let mut streamer = Streamer::with_clock(
            packetizer(),
            StreamConfig::default(),
            sink.clone(),
            ManualClock::new(),
        )
        .unwrap();
        let result = streamer.run(&mut BrokenSource { served: 0 });
        assert!(matches!(result, Err(StreamError::Source(_))));
        assert_eq!(sink.len(), 2);
    }

    // --- transport failures ---

    #[test]
    fn write_failures_are_counted_not_fatal() {
        let sink = FlakySink {
            sent: 0,
            fail: |n| n % 3 == 1,
            accepted: Vec::new(),
        };
        let mut streamer =
            Streamer::with_clock(packetizer(), looped(1), sink, ManualClock::new()).unwrap();
        let mut source = MemorySource::new(frames(&[1500, 1500]), Some(10.0));

        let report = streamer.run(&mut source).unwrap();
        // 2 frames * 3 packets, sends 1 and 4 fail
        assert_eq!(report.write_failures, 2);
        assert_eq!(report.packets_sent, 4);
        assert_eq!(report.frames_sent, 2);
        assert_eq!(streamer.sink().accepted.len(), 4);
    }

    #[test]
    fn consecutive_failure_threshold_aborts() {
        let sink = FlakySink {
            sent: 0,
            fail: |n| n >= 2,
            accepted: Vec::new(),
        };
        let config = StreamConfig {
            max_consecutive_write_failures: Some(3),
            ..Default::default()
        };
        let mut streamer =
            Streamer::with_clock(packetizer(), config, sink, ManualClock::new()).unwrap();
        let mut source = MemorySource::new(frames(&[1500]), Some(10.0));

        assert!(matches!(
            streamer.run(&mut source),
            Err(StreamError::TooManyWriteFailures(3))
        ));
    }

    #[test]
    fn unpacketizable_frame_is_skipped() {
        let tiny = Packetizer::new(ProtocolConfig {
            max_payload: 1,
            ..Default::default()
        })
        .unwrap();
        let sink = CaptureSink::new();
        let mut streamer =
            Streamer::with_clock(tiny, looped(1), sink.clone(), ManualClock::new()).unwrap();
        let oversized = AccessUnit::new(vec![0; (1 << 24) + 1]);
        let mut source =
            MemorySource::new(vec![AccessUnit::new(vec![1, 2]), oversized], Some(10.0));

        let report = streamer.run(&mut source).unwrap();
        assert_eq!(report.frames_skipped, 1);
        assert_eq!(report.frames_sent, 1);
        assert_eq!(sink.len(), 2);
    }

    // --- cancellation ---

    struct CancellingSink {
        token: CancelToken,
        after: usize,
        packets: Vec<Vec<u8>>,
    }

    impl Sink for CancellingSink {
        fn send(&mut self, packet: &[u8]) -> Result<()> {
            self.packets.push(packet.to_vec());
            if self.packets.len() == self.after {
                self.token.cancel();
            }
            Ok(())
        }
    }

    #[test]
    fn cancel_mid_burst_completes_frame() {
        let token = CancelToken::new();
        let sink = CancellingSink {
            token: token.clone(),
            after: 4,
            packets: Vec::new(),
        };
        let mut streamer =
            Streamer::with_clock(packetizer(), StreamConfig::default(), sink, ManualClock::new())
                .unwrap()
                .with_cancel_token(token);
        // 3 packets per frame; cancel fires on the first packet of frame 2
        let mut source = MemorySource::new(frames(&[1500, 1500, 1500]), Some(10.0));

        let report = streamer.run(&mut source).unwrap();
        assert_eq!(report.frames_sent, 2);
        assert_eq!(streamer.sink().packets.len(), 6);
    }

    #[test]
    fn cancelled_before_start_sends_nothing() {
        let sink = CaptureSink::new();
        let mut streamer = Streamer::with_clock(
            packetizer(),
            StreamConfig::default(),
            sink.clone(),
            ManualClock::new(),
        )
        .unwrap();
        streamer.cancel_token().cancel();
        let mut source = MemorySource::new(frames(&[10]), Some(10.0));
        let report = streamer.run(&mut source).unwrap();
        assert_eq!(report, StreamReport::default());
        assert!(sink.is_empty());
    }

    #[test]
    fn shared_token_cancelled_early_stops_run() {
        let token = CancelToken::new();
        token.cancel();
        let sink = CaptureSink::new();
        let mut streamer =
            Streamer::with_clock(packetizer(), looped(1), sink.clone(), ManualClock::new())
                .unwrap()
                .with_cancel_token(token.clone());
        assert!(streamer.cancel_token().is_cancelled());

        let mut source = MemorySource::new(frames(&[10, 10]), Some(10.0));
        let report = streamer.run(&mut source).unwrap();
        assert_eq!(report.frames_sent, 0);
        assert!(sink.is_empty());
    }
}
