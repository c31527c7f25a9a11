//! Port Transmitter: single-writer raw TX with due-time scheduling.
//!
//! One transmitter owns one port's raw endpoint. Frames arrive over a
//! bounded channel with a due time, wait in a min-heap keyed on
//! `(due_time, enqueue order)`, and are written by a single cooperative
//! task that sleeps until the head is due. Counters are only advanced
//! after the kernel acknowledges a write.

pub mod endpoint;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock;
use crate::config;
use crate::error::CoreError;
use crate::frame::encap::ETH_HLEN;
use crate::model::{PortCounterSnapshot, PortCounters};

use endpoint::RawEndpoint;

/// A frame scheduled for transmission.
#[derive(Debug)]
struct Sched {
    due: Instant,
    order: u64,
    frame: Vec<u8>,
}

impl PartialEq for Sched {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}
impl Eq for Sched {}
impl PartialOrd for Sched {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Sched {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Earlier due first; ties broken by enqueue order.
        (self.due, self.order).cmp(&(other.due, other.order))
    }
}

enum TxCmd {
    Frame { frame: Vec<u8>, due: Instant },
    /// Drain the heap, then exit the task.
    Shutdown,
}

/// Handle to one port's transmit task. Cheap to clone and share between
/// profile runners.
#[derive(Clone)]
pub struct Transmitter {
    port: String,
    tx: mpsc::Sender<TxCmd>,
    counters: Arc<PortCounters>,
    link_up: Arc<AtomicBool>,
    max_frame: usize,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Transmitter {
    /// Spawn the transmit task for `port` over its raw endpoint.
    ///
    /// `link_up` is shared with the neighbor prober, which tracks kernel
    /// carrier state.
    pub fn spawn(
        port: &str,
        ep: Arc<dyn RawEndpoint>,
        counters: Arc<PortCounters>,
        link_up: Arc<AtomicBool>,
        mtu: usize,
    ) -> Transmitter {
        let (tx, rx) = mpsc::channel(config::TX_QUEUE_FRAMES);
        let task = tokio::spawn(run_tx_loop(
            port.to_string(),
            rx,
            ep,
            Arc::clone(&counters),
            Arc::clone(&link_up),
        ));
        Transmitter {
            port: port.to_string(),
            tx,
            counters,
            link_up,
            max_frame: mtu + ETH_HLEN + config::TX_VLAN_ALLOWANCE,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Enqueue a frame to be written at or after `due`.
    ///
    /// Ordering guarantee: earlier due times transmit first; equal due
    /// times transmit in enqueue order.
    pub fn send(&self, frame: Vec<u8>, due: Instant) -> Result<(), CoreError> {
        if frame.len() > self.max_frame {
            return Err(CoreError::Oversize(format!(
                "frame of {} bytes exceeds {} allowance on {}",
                frame.len(),
                self.max_frame,
                self.port
            )));
        }
        if !self.link_up.load(Ordering::Acquire) {
            // A down link accepts and immediately drops.
            self.counters.dropped.fetch_add(1, Ordering::AcqRel);
            return Err(CoreError::PortUnavailable(format!("{} link is down", self.port)));
        }
        self.tx.try_send(TxCmd::Frame { frame, due }).map_err(|_| {
            self.counters.dropped.fetch_add(1, Ordering::AcqRel);
            CoreError::Overflow(format!("{} transmit queue saturated", self.port))
        })
    }

    /// Point-in-time counter snapshot.
    pub fn counters(&self) -> PortCounterSnapshot {
        self.counters.snapshot()
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Drain within the grace period, then force-close.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(TxCmd::Shutdown).await;
        let handle = self.task.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(config::TX_SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("transmitter {} did not drain in time; aborting", self.port);
                handle.abort();
            }
        }
    }
}

async fn run_tx_loop(
    port: String,
    mut rx: mpsc::Receiver<TxCmd>,
    ep: Arc<dyn RawEndpoint>,
    counters: Arc<PortCounters>,
    link_up: Arc<AtomicBool>,
) {
    let mut heap: BinaryHeap<Reverse<Sched>> = BinaryHeap::new();
    let mut order: u64 = 0;
    let mut draining = false;

    loop {
        if draining && heap.is_empty() {
            break;
        }
        let head_due = heap.peek().map(|Reverse(s)| s.due);

        tokio::select! {
            biased;

            cmd = rx.recv(), if !draining => match cmd {
                Some(TxCmd::Frame { frame, due }) => {
                    heap.push(Reverse(Sched { due, order, frame }));
                    order += 1;
                }
                Some(TxCmd::Shutdown) | None => draining = true,
            },

            _ = wait_until(head_due), if head_due.is_some() => {
                if let Some(Reverse(sched)) = heap.pop() {
                    let ok = write_frame(ep.as_ref(), &sched.frame, &counters, &link_up).await;
                    if !ok && !link_up.load(Ordering::Acquire) {
                        // Down link: pending queue contents are dead beyond
                        // the retry window already spent on this frame.
                        let flushed = heap.len() as u64;
                        if flushed > 0 {
                            counters.dropped.fetch_add(flushed, Ordering::AcqRel);
                            heap.clear();
                            tracing::warn!("{port}: link down, flushed {flushed} queued frames");
                        }
                    }
                }
            },
        }
    }
    tracing::debug!("transmitter {port} exited");
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Write one frame with bounded EAGAIN backoff. Returns true on success;
/// on failure the frame has been counted as dropped.
async fn write_frame(
    ep: &dyn RawEndpoint,
    frame: &[u8],
    counters: &PortCounters,
    link_up: &AtomicBool,
) -> bool {
    let mut backoff = config::TX_RETRY_BACKOFF;
    for _attempt in 0..=config::TX_RETRY_LIMIT {
        if !link_up.load(Ordering::Acquire) {
            break;
        }
        // Software timestamp read immediately before the write; a device
        // with hardware capture overrides it below.
        let sw_stamp = clock::mono_micros();
        match ep.send(frame) {
            Ok(n) => {
                counters.frames.fetch_add(1, Ordering::AcqRel);
                counters.bytes.fetch_add(n as u64, Ordering::AcqRel);
                let stamp = ep.tx_timestamp().unwrap_or(sw_stamp);
                counters.last_tx_micros.store(stamp, Ordering::Release);
                return true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                tracing::debug!("raw send failed: {e}");
                break;
            }
        }
    }
    counters.dropped.fetch_add(1, Ordering::AcqRel);
    false
}
