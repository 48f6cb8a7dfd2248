//! Scheduling devices, streams, priorities and memory accounting.
//!
//! A device is a scheduling domain: a worker pool plus a scratch-memory
//! gauge. The pair driver and refiner distribute sequence work
//! breadth-first across devices and choose per-member path-storage modes
//! against each device's gauge. Streams are in-order job queues bound to
//! a device; distinct streams overlap freely, and cleanup callbacks are
//! ordinary jobs enqueued behind the work whose resources they release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::config::DevicePoolConfig;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device: Cannot build worker pool for device {id}: {source}")]
    PoolBuild {
        id: usize,
        source: rayon::ThreadPoolBuildError,
    },
    #[error("device: Cannot spawn stream thread: {0}")]
    StreamSpawn(std::io::Error),
}

/// Stream priorities, most urgent first (numerically smallest, matching
/// the accelerator convention). The allocator ascends monotonically and
/// clamps at the least urgent priority.
#[derive(Debug)]
pub struct StreamPriorities {
    next: i32,
    lowest: i32,
}

impl StreamPriorities {
    pub const DEFAULT_HIGHEST: i32 = -2;
    pub const DEFAULT_LOWEST: i32 = 0;

    pub fn new(highest: i32, lowest: i32) -> Self {
        Self {
            next: highest.min(lowest),
            lowest,
        }
    }

    pub fn next(&mut self) -> i32 {
        let p = self.next;
        if self.next < self.lowest {
            self.next += 1;
        }
        p
    }
}

impl Default for StreamPriorities {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HIGHEST, Self::DEFAULT_LOWEST)
    }
}

struct GaugeInner {
    budget: usize,
    in_use: AtomicUsize,
}

/// Accounting gauge for a device's scratch memory. Reservations are
/// released when dropped, which is how deferred frees work: move the
/// reservation into a stream cleanup callback and it is released when the
/// stream reaches it.
#[derive(Clone)]
pub struct MemoryGauge {
    inner: Arc<GaugeInner>,
}

/// How long the gauge sleeps between free-memory polls.
pub const MEMORY_BACKOFF: Duration = Duration::from_secs(1);

impl MemoryGauge {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Arc::new(GaugeInner {
                budget,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    pub fn budget(&self) -> usize {
        self.inner.budget
    }

    pub fn free(&self) -> usize {
        self.inner
            .budget
            .saturating_sub(self.inner.in_use.load(Ordering::Relaxed))
    }

    pub fn try_reserve(&self, bytes: usize) -> Option<MemoryReservation> {
        let mut current = self.inner.in_use.load(Ordering::Relaxed);
        loop {
            if current + bytes > self.inner.budget {
                return None;
            }
            match self.inner.in_use.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(MemoryReservation {
                        gauge: self.clone(),
                        bytes,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserve `bytes`, polling once with a 1 s back-off if the gauge is
    /// under pressure. If the allocation still does not fit the work
    /// proceeds anyway (over budget) with a warning; the caller keeps
    /// running with degraded parallelism rather than aborting.
    pub fn reserve_with_backoff(&self, bytes: usize, what: &str) -> MemoryReservation {
        if let Some(r) = self.try_reserve(bytes) {
            return r;
        }
        thread::sleep(MEMORY_BACKOFF);
        if let Some(r) = self.try_reserve(bytes) {
            return r;
        }
        log::warn!(
            "insufficient free device memory ({} of {} bytes) for {what} (need {bytes}), \
             calculation speed may suffer",
            self.free(),
            self.budget(),
        );
        self.force_reserve(bytes)
    }

    /// Reserve without polling: account the bytes even when over budget
    /// (the host-resident managed-memory analog).
    pub fn reserve_or_force(&self, bytes: usize, what: &str) -> MemoryReservation {
        if let Some(r) = self.try_reserve(bytes) {
            return r;
        }
        log::debug!(
            "over-budget reservation of {bytes} bytes for {what} (free {})",
            self.free()
        );
        self.force_reserve(bytes)
    }

    fn force_reserve(&self, bytes: usize) -> MemoryReservation {
        self.inner.in_use.fetch_add(bytes, Ordering::Relaxed);
        MemoryReservation {
            gauge: self.clone(),
            bytes,
        }
    }
}

/// An amount of reserved device scratch memory; released on drop.
pub struct MemoryReservation {
    gauge: MemoryGauge,
    bytes: usize,
}

impl MemoryReservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.gauge.inner.in_use.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// In-order command queue bound to one device. Launches are FIFO and see
/// prior writes; `synchronize` drains everything queued so far.
pub struct Stream {
    priority: i32,
    tx: Option<mpsc::Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Stream {
    fn spawn(device_id: usize, priority: i32) -> Result<Self, DeviceError> {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(format!("dtw-dev{device_id}-p{priority}"))
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .map_err(DeviceError::StreamSpawn)?;
        Ok(Self {
            priority,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn launch(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            // A send error means the stream thread died with the queue;
            // the paired synchronize surfaces that as a hang-free no-op.
            let _ = tx.send(Box::new(job));
        }
    }

    /// Enqueue a callback that runs after everything launched so far;
    /// used to defer resource release to stream completion.
    pub fn add_cleanup_callback(&self, job: impl FnOnce() + Send + 'static) {
        self.launch(job);
    }

    /// Block until every job launched so far has run.
    pub fn synchronize(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        self.launch(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One scheduling device: identity, supported swath width, worker pool
/// and memory gauge.
pub struct Device {
    id: usize,
    max_swath_width: usize,
    gauge: MemoryGauge,
    pool: Arc<rayon::ThreadPool>,
}

impl Device {
    fn build(
        id: usize,
        max_swath_width: usize,
        budget: usize,
        threads: Option<usize>,
    ) -> Result<Self, DeviceError> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(move |t| format!("dtw-dev{id}-w{t}"));
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|source| DeviceError::PoolBuild { id, source })?;
        Ok(Self {
            id,
            max_swath_width,
            gauge: MemoryGauge::new(budget),
            pool: Arc::new(pool),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn max_swath_width(&self) -> usize {
        self.max_swath_width
    }

    pub fn gauge(&self) -> &MemoryGauge {
        &self.gauge
    }

    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    /// Owning handle for jobs that outlive the borrow (stream launches).
    pub fn pool_handle(&self) -> Arc<rayon::ThreadPool> {
        Arc::clone(&self.pool)
    }

    pub fn create_stream(&self, priority: i32) -> Result<Stream, DeviceError> {
        Stream::spawn(self.id, priority)
    }
}

/// Per-device width override used when assembling heterogeneous pools.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpec {
    pub max_swath_width: usize,
    pub memory_budget_bytes: usize,
}

/// The set of devices a run multiplexes work across.
pub struct DevicePool {
    devices: Vec<Device>,
    priorities: Mutex<StreamPriorities>,
}

impl DevicePool {
    pub fn new(cfg: &DevicePoolConfig) -> Result<Self, DeviceError> {
        let count = cfg.devices.max(1);
        let specs = vec![
            DeviceSpec {
                max_swath_width: cfg.max_swath_width,
                memory_budget_bytes: cfg.memory_budget_bytes,
            };
            count
        ];
        Self::from_specs(&specs, cfg.threads_per_device)
    }

    pub fn from_specs(
        specs: &[DeviceSpec],
        threads_per_device: Option<usize>,
    ) -> Result<Self, DeviceError> {
        let mut devices = Vec::with_capacity(specs.len());
        for (id, spec) in specs.iter().enumerate() {
            let device = Device::build(
                id,
                spec.max_swath_width.max(1),
                spec.memory_budget_bytes,
                threads_per_device,
            )?;
            log::debug!(
                "device {id} ready: swath width {}, scratch budget {} bytes",
                device.max_swath_width,
                device.gauge.budget()
            );
            devices.push(device);
        }
        Ok(Self {
            devices,
            priorities: Mutex::new(StreamPriorities::default()),
        })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, index: usize) -> &Device {
        &self.devices[index]
    }

    /// Device responsible for the `index`-th unit of breadth-first work.
    pub fn device_for(&self, index: usize) -> &Device {
        &self.devices[index % self.devices.len()]
    }

    /// Lowest swath width supported by every device, so one launch shape
    /// is safe pool-wide.
    pub fn common_swath_width(&self) -> usize {
        self.devices
            .iter()
            .map(Device::max_swath_width)
            .min()
            .unwrap_or(1)
    }

    /// Next stream priority from the pool-wide descending allocator.
    pub fn next_priority(&self) -> i32 {
        match self.priorities.lock() {
            Ok(mut p) => p.next(),
            Err(poisoned) => poisoned.into_inner().next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn priorities_ascend_and_clamp() {
        let mut p = StreamPriorities::new(-2, 0);
        assert_eq!(p.next(), -2);
        assert_eq!(p.next(), -1);
        assert_eq!(p.next(), 0);
        assert_eq!(p.next(), 0, "allocator must clamp at the lowest priority");
    }

    #[test]
    fn gauge_reserves_and_releases() {
        let gauge = MemoryGauge::new(100);
        let r = gauge.try_reserve(60).expect("first reservation fits");
        assert_eq!(gauge.free(), 40);
        assert!(gauge.try_reserve(50).is_none(), "over-budget must fail");
        drop(r);
        assert_eq!(gauge.free(), 100);
    }

    #[test]
    fn backoff_reservation_degrades_instead_of_aborting() {
        let gauge = MemoryGauge::new(10);
        let r = gauge.reserve_with_backoff(25, "test frontier");
        assert_eq!(r.bytes(), 25);
        assert_eq!(gauge.free(), 0, "gauge clamps free at zero when over");
        drop(r);
        assert_eq!(gauge.free(), 10);
    }

    #[test]
    fn stream_jobs_run_in_fifo_order() {
        let pool = DevicePool::new(&DevicePoolConfig {
            devices: 1,
            threads_per_device: Some(2),
            ..DevicePoolConfig::default()
        })
        .expect("pool");
        let stream = pool.device(0).create_stream(-1).expect("stream");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..16u32 {
            let seen = Arc::clone(&seen);
            stream.launch(move || seen.lock().unwrap().push(n));
        }
        stream.synchronize();
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn cleanup_callback_defers_release_to_stream_completion() {
        let pool = DevicePool::new(&DevicePoolConfig::default()).expect("pool");
        let gauge = pool.device(0).gauge().clone();
        let reservation = gauge.try_reserve(64).expect("reserve");
        let stream = pool.device(0).create_stream(0).expect("stream");

        let work_ran = Arc::new(AtomicU32::new(0));
        let observed_before_free = Arc::new(AtomicU32::new(u32::MAX));
        {
            let work_ran = Arc::clone(&work_ran);
            let observed = Arc::clone(&observed_before_free);
            let gauge = gauge.clone();
            stream.launch(move || {
                observed.store(gauge.free() as u32, Ordering::SeqCst);
                work_ran.store(1, Ordering::SeqCst);
            });
        }
        stream.add_cleanup_callback(move || drop(reservation));
        stream.synchronize();

        assert_eq!(work_ran.load(Ordering::SeqCst), 1);
        let free_during_work = observed_before_free.load(Ordering::SeqCst) as usize;
        assert!(
            free_during_work <= gauge.budget() - 64,
            "reservation must still be held while work runs"
        );
        assert_eq!(gauge.free(), gauge.budget(), "cleanup released it");
    }

    #[test]
    fn pool_picks_lowest_common_swath_width() {
        let pool = DevicePool::from_specs(
            &[
                DeviceSpec {
                    max_swath_width: 1024,
                    memory_budget_bytes: 1 << 20,
                },
                DeviceSpec {
                    max_swath_width: 256,
                    memory_budget_bytes: 1 << 20,
                },
            ],
            Some(1),
        )
        .expect("pool");
        assert_eq!(pool.common_swath_width(), 256);
        assert_eq!(pool.device_for(3).id(), 1);
        assert_eq!(pool.device_for(4).id(), 0);
    }
}
