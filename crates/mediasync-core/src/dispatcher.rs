//! Minimal worker-pool dispatcher. Pairs new-workflow events from a
//! [`Generator`](crate::generator::Generator) with idle [`Worker`]s and
//! drives each flow's steps to completion, setting `finished`/`success`
//! once every step has settled. Round-robin assignment; step ordering
//! across flows is best-effort.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::generator::GeneratorEvent;
use crate::scanner::ScannerClient;
use crate::tracked_media::TrackedMediaIndex;
use crate::worker::Worker;
use crate::workflow::WorkFlow;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Round-robin pool of [`Worker`]s draining a generator's event stream.
pub struct Dispatcher {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
}

impl Dispatcher {
    pub fn new(worker_count: usize, index: Arc<dyn TrackedMediaIndex>, scanner: Arc<ScannerClient>) -> Self {
        let workers = (0..worker_count)
            .map(|id| Arc::new(Worker::new(id, Arc::clone(&index), Arc::clone(&scanner))))
            .collect();
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    /// Drain `events`, executing every `NewWorkflow` to completion and
    /// forwarding `Debug`/`Warn`/`Error` lines to the `log` facade. Returns
    /// once the channel closes (the generator was torn down).
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<GeneratorEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                GeneratorEvent::NewWorkflow(flow) => self.execute_flow(flow).await,
                GeneratorEvent::Debug(msg) => log::debug!("{msg}"),
                GeneratorEvent::Warn(msg) => log::warn!("{msg}"),
                GeneratorEvent::Error(msg) => log::error!("{msg}"),
            }
        }
    }

    async fn execute_flow(&self, mut flow: WorkFlow) {
        let mut success = true;
        for step in flow.steps.drain(..).collect::<Vec<_>>() {
            let worker = self.acquire_idle_worker().await;
            worker.warmup();
            let result = worker.do_work(step).await;
            if !result.is_success() {
                success = false;
            }
        }
        flow.finished = true;
        flow.success = success;
        if !success {
            log::warn!("workflow {} finished with a failed step", flow.id);
        }
    }

    async fn acquire_idle_worker(&self) -> Arc<Worker> {
        loop {
            let start = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            for offset in 0..self.workers.len() {
                let candidate = &self.workers[(start + offset) % self.workers.len()];
                if !candidate.is_busy() {
                    return Arc::clone(candidate);
                }
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }
}
