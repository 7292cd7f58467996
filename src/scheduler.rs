//! Background compaction scheduler: periodically asks an [`Engine`] to
//! compact itself. Grounded on `scheduler.py`'s `CompactionScheduler`,
//! re-expressed with `std::thread` and `crossbeam`'s channel for the stop
//! signal instead of a polled `threading.Event`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::compaction::CompactionReport;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Invoked after a compaction that actually ran (`performed: true`), never
/// for a skipped one.
pub type CompactionCallback = Box<dyn Fn(&CompactionReport) + Send + Sync + 'static>;

struct SchedulerConfig {
    interval_seconds: f64,
    threshold_ratio: f64,
}

fn validate_interval(value: f64) -> Result<()> {
    if value <= 0.0 {
        return Err(Error::InvalidParameter("interval_seconds must be positive".to_string()));
    }
    Ok(())
}

fn validate_threshold(value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::InvalidParameter("threshold_ratio must be between 0.0 and 1.0".to_string()));
    }
    Ok(())
}

/// A background worker that periodically calls `compact(threshold_ratio,
/// force=false)` on a supplied engine handle.
///
/// ```ignore
/// let engine = Arc::new(Mutex::new(Engine::open("/data", Codec::Compact, RotationPolicy::None)?));
/// let mut scheduler = CompactionScheduler::new(engine, 300.0, 0.3, None)?;
/// scheduler.start();
/// // ... use the database via the same Arc<Mutex<Engine>> ...
/// scheduler.stop(Duration::from_secs(5));
/// ```
pub struct CompactionScheduler {
    engine: Arc<Mutex<Engine>>,
    config: Arc<Mutex<SchedulerConfig>>,
    on_complete: Option<Arc<CompactionCallback>>,
    stop_tx: Option<crossbeam::channel::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl CompactionScheduler {
    pub fn new(
        engine: Arc<Mutex<Engine>>,
        interval_seconds: f64,
        threshold_ratio: f64,
        on_complete: Option<CompactionCallback>,
    ) -> Result<CompactionScheduler> {
        validate_interval(interval_seconds)?;
        validate_threshold(threshold_ratio)?;
        Ok(CompactionScheduler {
            engine,
            config: Arc::new(Mutex::new(SchedulerConfig { interval_seconds, threshold_ratio })),
            on_complete: on_complete.map(Arc::new),
            stop_tx: None,
            handle: None,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn interval_seconds(&self) -> f64 {
        self.config.lock().expect("scheduler config lock poisoned").interval_seconds
    }

    pub fn set_interval_seconds(&self, value: f64) -> Result<()> {
        validate_interval(value)?;
        self.config.lock().expect("scheduler config lock poisoned").interval_seconds = value;
        Ok(())
    }

    pub fn threshold_ratio(&self) -> f64 {
        self.config.lock().expect("scheduler config lock poisoned").threshold_ratio
    }

    pub fn set_threshold_ratio(&self, value: f64) -> Result<()> {
        validate_threshold(value)?;
        self.config.lock().expect("scheduler config lock poisoned").threshold_ratio = value;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launches the worker. A no-op (with a warning) if already running.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("compaction scheduler is already running");
            return;
        }

        let (stop_tx, stop_rx) = crossbeam::channel::bounded(0);
        self.stop_tx = Some(stop_tx);

        let engine = Arc::clone(&self.engine);
        let config = Arc::clone(&self.config);
        let on_complete = self.on_complete.clone();
        let running = Arc::clone(&self.running);

        let handle = std::thread::Builder::new()
            .name("bitcask-compaction-scheduler".to_string())
            .spawn(move || run_worker(engine, config, on_complete, stop_rx, running))
            .expect("failed to spawn compaction scheduler thread");
        self.handle = Some(handle);
        log::info!(
            "compaction scheduler started (interval={}s, threshold={})",
            self.interval_seconds(),
            self.threshold_ratio()
        );
    }

    /// Signals the worker and waits up to `timeout` for it to exit. Returns
    /// `false` (without killing the thread) if it didn't stop in time.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        let deadline = Instant::now() + timeout;
        loop {
            match &self.handle {
                Some(handle) if handle.is_finished() => break,
                Some(_) => {
                    if Instant::now() >= deadline {
                        log::warn!("compaction scheduler did not stop within timeout");
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                None => break,
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        log::info!("compaction scheduler stopped");
        true
    }

    /// Synchronously performs one check-and-compact from the caller's
    /// context, bypassing the schedule.
    pub fn trigger_compaction(&self, force: bool) -> Result<CompactionReport> {
        let threshold_ratio = self.threshold_ratio();
        check_and_compact(&self.engine, threshold_ratio, force, self.on_complete.as_deref())
    }
}

fn check_and_compact(
    engine: &Arc<Mutex<Engine>>,
    threshold_ratio: f64,
    force: bool,
    on_complete: Option<&CompactionCallback>,
) -> Result<CompactionReport> {
    let report = {
        let mut guard = engine.lock().expect("engine lock poisoned");
        guard.compact(threshold_ratio, force)?
    };
    if report.performed {
        if let Some(callback) = on_complete {
            callback(&report);
        }
    }
    Ok(report)
}

/// Sleeps in slices of at most one second so a stop signal preempts within a
/// second even when `interval_seconds` is large.
fn run_worker(
    engine: Arc<Mutex<Engine>>,
    config: Arc<Mutex<SchedulerConfig>>,
    on_complete: Option<Arc<CompactionCallback>>,
    stop_rx: crossbeam::channel::Receiver<()>,
    running: Arc<AtomicBool>,
) {
    'outer: loop {
        let interval_seconds = config.lock().expect("scheduler config lock poisoned").interval_seconds;
        let mut waited = 0.0;
        while waited < interval_seconds {
            let slice = Duration::from_secs_f64((interval_seconds - waited).min(1.0));
            match stop_rx.recv_timeout(slice) {
                Ok(()) => break 'outer,
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break 'outer,
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => waited += slice.as_secs_f64(),
            }
        }

        let threshold_ratio = config.lock().expect("scheduler config lock poisoned").threshold_ratio;
        if let Err(err) = check_and_compact(&engine, threshold_ratio, false, on_complete.as_deref().map(Arc::as_ref))
        {
            log::error!("compaction scheduler: check failed: {err}");
        }
    }
    running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::rotation::RotationPolicy;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn new_engine(dir: &TempDir) -> Arc<Mutex<Engine>> {
        Arc::new(Mutex::new(Engine::open(dir.path(), Codec::Compact, RotationPolicy::None).unwrap()))
    }

    #[test]
    fn rejects_invalid_parameters() {
        let dir = TempDir::new().unwrap();
        let engine = new_engine(&dir);
        assert!(CompactionScheduler::new(Arc::clone(&engine), 0.0, 0.3, None).is_err());
        assert!(CompactionScheduler::new(Arc::clone(&engine), 1.0, 1.5, None).is_err());
        assert!(CompactionScheduler::new(engine, 1.0, 0.3, None).is_ok());
    }

    #[test]
    fn start_twice_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let engine = new_engine(&dir);
        let mut scheduler = CompactionScheduler::new(engine, 60.0, 0.3, None).unwrap();
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.start();
        assert!(scheduler.is_running());
        assert!(scheduler.stop(Duration::from_secs(2)));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn trigger_compaction_invokes_callback_exactly_once_on_success() {
        let dir = TempDir::new().unwrap();
        let engine = new_engine(&dir);
        {
            let mut guard = engine.lock().unwrap();
            for i in 0..50 {
                guard.put(format!("k{i}").as_bytes(), vec![b'x'; 20_000].as_slice()).unwrap();
            }
            for i in 0..50 {
                guard.put(format!("k{i}").as_bytes(), vec![b'y'; 20_000].as_slice()).unwrap();
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let callback: CompactionCallback = Box::new(move |report| {
            assert!(report.performed);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut scheduler = CompactionScheduler::new(engine, 0.1, 0.1, Some(callback)).unwrap();
        scheduler.start();
        let report = scheduler.trigger_compaction(true).unwrap();
        assert!(report.performed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        scheduler.stop(Duration::from_secs(2));
    }

    #[test]
    fn trigger_compaction_skips_callback_when_not_performed() {
        let dir = TempDir::new().unwrap();
        let engine = new_engine(&dir);
        {
            let mut guard = engine.lock().unwrap();
            guard.put(b"a", b"1").unwrap();
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let callback: CompactionCallback = Box::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        let scheduler = CompactionScheduler::new(engine, 60.0, 0.1, Some(callback)).unwrap();
        let report = scheduler.trigger_compaction(false).unwrap();
        assert!(!report.performed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn setters_validate_range() {
        let dir = TempDir::new().unwrap();
        let engine = new_engine(&dir);
        let scheduler = CompactionScheduler::new(engine, 1.0, 0.3, None).unwrap();
        assert!(scheduler.set_interval_seconds(0.0).is_err());
        assert!(scheduler.set_interval_seconds(5.0).is_ok());
        assert_eq!(scheduler.interval_seconds(), 5.0);
        assert!(scheduler.set_threshold_ratio(-0.1).is_err());
        assert!(scheduler.set_threshold_ratio(0.8).is_ok());
        assert_eq!(scheduler.threshold_ratio(), 0.8);
    }
}
