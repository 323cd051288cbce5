//! Transmission worker for streaming transports
//!
//! One thread per open streaming device. It copies the channel buffer under
//! the device mutex, releases the lock, then pushes the frame through the
//! transport. The stop flag is checked once per iteration; stopping hands the
//! transport back to the caller so it can be closed on the caller's thread.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use dmxflow_core::{ChannelBuffer, OutputConfig};

use crate::transport::DmxTransport;

/// Longest single sleep while waiting, so stop requests are seen promptly
const PAUSE_SLICE: Duration = Duration::from_millis(10);

/// Transient errors are logged at warn level on the first hit and then every Nth
const ERROR_LOG_EVERY: u64 = 100;

/// Timing of the transmission loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// Pause after each frame
    pub frame_interval: Duration,
    /// Wait before the first frame
    pub settle_delay: Duration,
    /// Bound on waiting for the worker to stop
    pub stop_timeout: Duration,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self::from_config(&OutputConfig::default())
    }
}

impl FrameTiming {
    pub fn from_config(config: &OutputConfig) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            settle_delay: config.settle_delay(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

/// Counters shared between the worker and its owner
#[derive(Debug, Default)]
pub struct WorkerStats {
    frames: AtomicU64,
    errors: AtomicU64,
    lost: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl WorkerStats {
    /// Frames written successfully
    pub fn frames_sent(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Failed frame writes
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// The transport reported the device gone
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

/// Why a worker could not be stopped cleanly
#[derive(Debug)]
pub enum StopError {
    /// Still running after the stop timeout; the thread was detached
    TimedOut,
    /// The worker thread panicked and the transport was lost with it
    Panicked,
}

/// Handle to a running transmission thread
pub struct FrameWorker {
    running: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    done_rx: Receiver<Box<dyn DmxTransport>>,
    thread: Option<JoinHandle<()>>,
}

impl FrameWorker {
    /// Start transmitting `buffer` through `transport`.
    ///
    /// On spawn failure the transport is handed back untouched.
    pub fn spawn(
        name: String,
        transport: Box<dyn DmxTransport>,
        buffer: Arc<Mutex<ChannelBuffer>>,
        timing: FrameTiming,
    ) -> std::result::Result<Self, (Box<dyn DmxTransport>, io::Error)> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(WorkerStats::default());
        let (handoff_tx, handoff_rx) = bounded::<Box<dyn DmxTransport>>(1);
        let (done_tx, done_rx) = bounded::<Box<dyn DmxTransport>>(1);

        let thread = {
            let running = running.clone();
            let stats = stats.clone();
            thread::Builder::new().name(name).spawn(move || {
                let Ok(transport) = handoff_rx.recv() else {
                    return;
                };
                let transport = run(transport, &buffer, &running, &stats, timing);
                // Owner may have given up waiting; the transport is dropped then
                let _ = done_tx.send(transport);
            })
        };

        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => return Err((transport, e)),
        };

        if let Err(returned) = handoff_tx.send(transport) {
            running.store(false, Ordering::Relaxed);
            let _ = thread.join();
            return Err((
                returned.into_inner(),
                io::Error::new(io::ErrorKind::Other, "worker exited before start"),
            ));
        }

        Ok(Self {
            running,
            stats,
            done_rx,
            thread: Some(thread),
        })
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Whether the loop is still transmitting
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal stop, wait up to `timeout`, and take the transport back
    pub fn stop(mut self, timeout: Duration) -> std::result::Result<Box<dyn DmxTransport>, StopError> {
        self.running.store(false, Ordering::Relaxed);

        match self.done_rx.recv_timeout(timeout) {
            Ok(transport) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                Ok(transport)
            }
            Err(RecvTimeoutError::Timeout) => {
                // Dropping the handle detaches the thread
                self.thread.take();
                Err(StopError::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                Err(StopError::Panicked)
            }
        }
    }
}

impl Drop for FrameWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn run(
    mut transport: Box<dyn DmxTransport>,
    buffer: &Mutex<ChannelBuffer>,
    running: &AtomicBool,
    stats: &WorkerStats,
    timing: FrameTiming,
) -> Box<dyn DmxTransport> {
    info!("Transmission started on {}", transport.path());
    pause(running, timing.settle_delay);

    while running.load(Ordering::Relaxed) {
        let frame = {
            let mut buffer = buffer.lock();
            if buffer.take_dirty() {
                trace!("Channel data changed on {}", transport.path());
            }
            buffer.snapshot()
        };

        match transport.write_frame(&frame) {
            Ok(()) => {
                stats.frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_disconnect() => {
                warn!("{}; stopping transmission", e);
                *stats.last_error.lock() = Some(e.to_string());
                stats.lost.store(true, Ordering::Relaxed);
                break;
            }
            Err(e) => {
                let count = stats.errors.fetch_add(1, Ordering::Relaxed) + 1;
                if count == 1 || count % ERROR_LOG_EVERY == 0 {
                    warn!("Frame write failed ({} so far): {}", count, e);
                } else {
                    trace!("Frame write failed: {}", e);
                }
                *stats.last_error.lock() = Some(e.to_string());
            }
        }

        pause(running, timing.frame_interval);
    }

    debug!(
        "Transmission stopped on {} after {} frames",
        transport.path(),
        stats.frames_sent()
    );
    transport
}

/// Sleep for `duration`, returning early once `running` is cleared
fn pause(running: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(PAUSE_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackBus, LoopbackFaults, LineStep};
    use crate::transport::{LineSettings, SerialBridgeTransport};

    fn fast_timing() -> FrameTiming {
        FrameTiming {
            frame_interval: Duration::from_millis(2),
            settle_delay: Duration::ZERO,
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn open_transport(bus: &LoopbackBus, path: &str) -> Box<dyn DmxTransport> {
        let mut t = SerialBridgeTransport::new(
            path,
            "Loopback",
            LineSettings {
                break_time: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(bus.clone()),
        );
        t.open().unwrap();
        Box::new(t)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_worker_streams_buffer_and_returns_transport() {
        let bus = LoopbackBus::new();
        let path = bus.add_serial("Loopback", None);
        let buffer = Arc::new(Mutex::new(ChannelBuffer::new()));
        buffer.lock().write(0, 99);

        let worker = FrameWorker::spawn(
            "dmx-test".to_string(),
            open_transport(&bus, &path),
            buffer,
            fast_timing(),
        )
        .map_err(|(_, e)| e)
        .unwrap();

        assert!(wait_for(|| bus.frame_count(&path) >= 3));
        assert_eq!(bus.last_frame(&path).unwrap()[1], 99);

        let mut transport = worker.stop(Duration::from_secs(2)).unwrap();
        assert!(transport.is_open());
        transport.close().unwrap();
    }

    #[test]
    fn test_no_frames_after_stop() {
        let bus = LoopbackBus::new();
        let path = bus.add_serial("Loopback", None);
        let buffer = Arc::new(Mutex::new(ChannelBuffer::new()));
        let worker = FrameWorker::spawn(
            "dmx-test".to_string(),
            open_transport(&bus, &path),
            buffer,
            fast_timing(),
        )
        .map_err(|(_, e)| e)
        .unwrap();

        assert!(wait_for(|| bus.frame_count(&path) >= 1));
        let _transport = worker.stop(Duration::from_secs(2)).unwrap();
        let after_stop = bus.frame_count(&path);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(bus.frame_count(&path), after_stop);
    }

    #[test]
    fn test_unplug_marks_lost_and_ends_loop() {
        let bus = LoopbackBus::new();
        let path = bus.add_serial("Loopback", None);
        let buffer = Arc::new(Mutex::new(ChannelBuffer::new()));
        let worker = FrameWorker::spawn(
            "dmx-test".to_string(),
            open_transport(&bus, &path),
            buffer,
            fast_timing(),
        )
        .map_err(|(_, e)| e)
        .unwrap();

        bus.unplug(&path);
        let stats = worker.stats().clone();
        assert!(wait_for(|| stats.is_lost()));
        assert!(wait_for(|| !worker.is_running()));
        assert!(worker.stop(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_transient_errors_keep_looping() {
        let bus = LoopbackBus::new();
        let path = bus.add_serial("Loopback", None);
        let transport = open_transport(&bus, &path);
        bus.set_faults(
            &path,
            LoopbackFaults {
                fail_step: Some(LineStep::Write),
                ..Default::default()
            },
        );
        let buffer = Arc::new(Mutex::new(ChannelBuffer::new()));
        let worker =
            FrameWorker::spawn("dmx-test".to_string(), transport, buffer, fast_timing())
                .map_err(|(_, e)| e)
                .unwrap();

        let stats = worker.stats().clone();
        assert!(wait_for(|| stats.errors() >= 3));
        assert!(!stats.is_lost());
        assert!(worker.is_running());
        assert!(worker.stop(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_settle_delay_is_interruptible() {
        let bus = LoopbackBus::new();
        let path = bus.add_serial("Loopback", None);
        let buffer = Arc::new(Mutex::new(ChannelBuffer::new()));
        let timing = FrameTiming {
            settle_delay: Duration::from_secs(30),
            ..fast_timing()
        };
        let worker = FrameWorker::spawn(
            "dmx-test".to_string(),
            open_transport(&bus, &path),
            buffer,
            timing,
        )
        .map_err(|(_, e)| e)
        .unwrap();

        let started = Instant::now();
        assert!(worker.stop(Duration::from_secs(2)).is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(bus.frame_count(&path), 0);
    }
}
