//! The batch handler driver.

use crate::error::{Error, Result};
use crate::flow::{BatchTarget, ErrorAction, TargetFactory};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Event delivered to the consumer.
#[derive(Debug)]
pub enum FlowEvent<T> {
    /// One item.
    Item(T),
    /// Every target was exhausted.
    Complete,
    /// The flow was cancelled.
    Cancelled,
    /// A target failed and the factory chose to propagate.
    Failed(Error),
}

#[derive(Debug, Default)]
struct Shared {
    /// Requested minus delivered.
    demand: AtomicI64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetches: AtomicUsize,
    cancelled: AtomicBool,
    wake: Notify,
}

impl Shared {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Pulls items from a sequence of targets on a dedicated task.
pub struct AsyncBatchHandler<T> {
    shared: Arc<Shared>,
    events: mpsc::Receiver<FlowEvent<T>>,
    batch_size: usize,
    /// Requested by `next_item` but not yet received.
    window: usize,
    finished: bool,
}

impl<T> std::fmt::Debug for AsyncBatchHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncBatchHandler")
            .field("demand", &self.shared.demand.load(Ordering::SeqCst))
            .field("in_flight", &self.shared.in_flight.load(Ordering::SeqCst))
            .field("cancelled", &self.shared.is_cancelled())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<T: Send + 'static> AsyncBatchHandler<T> {
    /// Start driving targets from `factory`. Nothing is fetched until demand
    /// is requested.
    pub fn spawn<F>(factory: F, batch_size: usize) -> Self
    where
        F: TargetFactory,
        F::Target: BatchTarget<Item = T>,
    {
        let batch_size = batch_size.max(1);
        let shared = Arc::new(Shared::default());
        let (tx, events) = mpsc::channel(batch_size);
        tokio::spawn(drive(factory, shared.clone(), tx, batch_size));

        Self {
            shared,
            events,
            batch_size,
            window: 0,
            finished: false,
        }
    }

    /// Add demand for `n` more items.
    pub fn request(&self, n: usize) {
        if n == 0 {
            return;
        }
        let n = n as i64;
        let previous = self.shared.demand.fetch_add(n, Ordering::SeqCst);
        if previous <= 0 && previous + n > 0 {
            self.shared.wake.notify_one();
        }
    }

    /// Cancel the flow. Any fetch in flight completes but its result is
    /// discarded.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            self.shared.wake.notify_one();
        }
    }

    /// Receive the next event, or None once a terminal event was delivered.
    pub async fn next_event(&mut self) -> Option<FlowEvent<T>> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        match &event {
            Some(FlowEvent::Item(_)) => {}
            _ => self.finished = true,
        }
        event
    }

    /// Pull the next item, requesting a batch worth of demand whenever the
    /// previous request is used up. Returns None on completion.
    pub async fn next_item(&mut self) -> Result<Option<T>> {
        if self.window == 0 && !self.finished {
            self.request(self.batch_size);
            self.window = self.batch_size;
        }
        match self.next_event().await {
            Some(FlowEvent::Item(item)) => {
                self.window = self.window.saturating_sub(1);
                Ok(Some(item))
            }
            Some(FlowEvent::Complete) | None => Ok(None),
            Some(FlowEvent::Cancelled) => Err(Error::Cancelled),
            Some(FlowEvent::Failed(e)) => Err(e),
        }
    }

    /// Drain every remaining item.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next_item().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Fetches currently outstanding, always 0 or 1.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously outstanding fetches observed.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total fetches issued.
    pub fn fetches(&self) -> usize {
        self.shared.fetches.load(Ordering::SeqCst)
    }

    /// Current signed demand.
    pub fn demand(&self) -> i64 {
        self.shared.demand.load(Ordering::SeqCst)
    }

    /// Whether the flow was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}

impl<T> Drop for AsyncBatchHandler<T> {
    fn drop(&mut self) {
        if !self.finished && !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            self.shared.wake.notify_one();
        }
    }
}

async fn drive<F>(
    mut factory: F,
    shared: Arc<Shared>,
    tx: mpsc::Sender<FlowEvent<<F::Target as BatchTarget>::Item>>,
    batch_size: usize,
) where
    F: TargetFactory,
{
    let mut target: Option<F::Target> = None;
    let mut target_started = false;

    loop {
        while shared.demand.load(Ordering::SeqCst) <= 0 && !shared.is_cancelled() {
            shared.wake.notified().await;
        }

        if shared.is_cancelled() {
            if let (Some(t), true) = (target.as_mut(), target_started) {
                t.cancel().await;
            }
            let _ = tx.send(FlowEvent::Cancelled).await;
            debug!("Batch flow cancelled");
            return;
        }

        if target.is_none() {
            match factory.next_target() {
                Some(next) => {
                    target = Some(next);
                    target_started = false;
                }
                None => {
                    let _ = tx.send(FlowEvent::Complete).await;
                    trace!("Batch flow complete");
                    return;
                }
            }
        }
        let Some(current) = target.as_mut() else {
            continue;
        };

        let amount = shared.demand.load(Ordering::SeqCst).clamp(1, batch_size as i64) as usize;
        let outstanding = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_flight.fetch_max(outstanding, Ordering::SeqCst);
        shared.fetches.fetch_add(1, Ordering::SeqCst);
        target_started = true;

        let result = current.fetch(amount).await;
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);

        if shared.is_cancelled() {
            // Result is discarded; loop top cancels the target.
            continue;
        }

        match result {
            Ok(batch) => {
                trace!(items = batch.items.len(), complete = batch.complete, "Fetched batch");
                for item in batch.items {
                    if shared.is_cancelled() {
                        break;
                    }
                    shared.demand.fetch_sub(1, Ordering::SeqCst);
                    if tx.send(FlowEvent::Item(item)).await.is_err() {
                        current.cancel().await;
                        return;
                    }
                }
                if batch.complete {
                    target = None;
                }
            }
            Err(e) => match factory.on_target_error(&e) {
                ErrorAction::Continue => {
                    debug!(error = %e, "Target failed, continuing with next");
                    target = None;
                }
                ErrorAction::Propagate => {
                    debug!(error = %e, "Target failed");
                    let _ = tx.send(FlowEvent::Failed(e)).await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::flow::Batch;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Debug)]
    struct VecTarget {
        items: VecDeque<u32>,
        fail: bool,
        delay: Duration,
        cancelled: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BatchTarget for VecTarget {
        type Item = u32;

        async fn fetch(&mut self, amount: usize) -> Result<Batch<u32>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(NetworkError::Unreachable(9).into());
            }
            let n = amount.min(self.items.len());
            let items: Vec<_> = self.items.drain(..n).collect();
            Ok(Batch {
                items,
                complete: self.items.is_empty(),
            })
        }

        async fn cancel(&mut self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct VecFactory {
        targets: VecDeque<VecTarget>,
        action: ErrorAction,
    }

    impl VecFactory {
        fn new(chunks: Vec<Vec<u32>>) -> (Self, Arc<AtomicUsize>) {
            let cancelled = Arc::new(AtomicUsize::new(0));
            let targets = chunks
                .into_iter()
                .map(|items| VecTarget {
                    items: items.into(),
                    fail: false,
                    delay: Duration::from_millis(1),
                    cancelled: cancelled.clone(),
                })
                .collect();
            (
                Self {
                    targets,
                    action: ErrorAction::Propagate,
                },
                cancelled,
            )
        }
    }

    impl TargetFactory for VecFactory {
        type Target = VecTarget;

        fn next_target(&mut self) -> Option<VecTarget> {
            self.targets.pop_front()
        }

        fn on_target_error(&mut self, _error: &Error) -> ErrorAction {
            self.action
        }
    }

    #[tokio::test]
    async fn test_collects_all_targets_in_order() {
        let (factory, _) = VecFactory::new(vec![vec![1, 2, 3], vec![], vec![4, 5]]);
        let handler = AsyncBatchHandler::spawn(factory, 2);
        let items = handler.collect().await.unwrap();
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_no_fetch_without_demand() {
        let (factory, _) = VecFactory::new(vec![vec![1, 2, 3]]);
        let mut handler = AsyncBatchHandler::spawn(factory, 8);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.fetches(), 0);

        handler.request(2);
        assert!(matches!(handler.next_event().await, Some(FlowEvent::Item(1))));
        assert!(matches!(handler.next_event().await, Some(FlowEvent::Item(2))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.fetches(), 1);
        assert_eq!(handler.demand(), 0);
    }

    #[tokio::test]
    async fn test_at_most_one_fetch_in_flight() {
        let (factory, _) = VecFactory::new((0..20).map(|i| vec![i; 7]).collect());
        let mut handler = AsyncBatchHandler::spawn(factory, 3);
        for _ in 0..50 {
            handler.request(5);
        }
        let mut count = 0;
        while let Some(FlowEvent::Item(_)) = handler.next_event().await {
            assert!(handler.in_flight() <= 1);
            count += 1;
        }
        assert_eq!(count, 140);
        assert_eq!(handler.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_cancel_discards_and_cancels_target() {
        let (mut factory, cancelled) = VecFactory::new(vec![(0..100).collect()]);
        factory.targets[0].delay = Duration::from_millis(30);
        let mut handler = AsyncBatchHandler::spawn(factory, 10);

        handler.request(10);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(handler.in_flight(), 1);
        handler.cancel();

        assert!(matches!(handler.next_event().await, Some(FlowEvent::Cancelled)));
        assert!(handler.next_event().await.is_none());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_propagates_by_default() {
        let (mut factory, _) = VecFactory::new(vec![vec![1], vec![2]]);
        factory.targets[0].fail = true;
        let handler = AsyncBatchHandler::spawn(factory, 4);
        let err = handler.collect().await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::Unreachable(9))));
    }

    #[tokio::test]
    async fn test_error_can_be_skipped() {
        let (mut factory, _) = VecFactory::new(vec![vec![1], vec![2], vec![3]]);
        factory.targets[1].fail = true;
        factory.action = ErrorAction::Continue;
        let handler = AsyncBatchHandler::spawn(factory, 4);
        assert_eq!(handler.collect().await.unwrap(), vec![1, 3]);
    }
}
