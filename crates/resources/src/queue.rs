//! Bounded priority queue of pending demand
//!
//! Items are kept in six FIFO lanes: one primary and one continuation lane
//! for each of the three priority bands. Primary lanes are bounded by
//! `capacity_per_priority`; continuation lanes are not, because work that was
//! already admitted must never be turned away by the new-work bound.
//!
//! Reads scan the bands from highest to lowest and, within a band, serve the
//! continuation lane before the primary lane.

use std::collections::VecDeque;

use parking_lot::Mutex;
use strata_errors::{Error, LimiterError};
use strata_types::{Priority, PriorityClass};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Items that know which priority class they were submitted with
pub trait Prioritized {
    fn priority_class(&self) -> PriorityClass;
}

impl Prioritized for PriorityClass {
    fn priority_class(&self) -> PriorityClass {
        *self
    }
}

/// Lanes in service order, as `(band, continuation)`
const SERVICE_ORDER: [(usize, bool); 2 * Priority::BANDS] = [
    (2, true),
    (2, false),
    (1, true),
    (1, false),
    (0, true),
    (0, false),
];

struct Lanes<T> {
    primary: [VecDeque<T>; Priority::BANDS],
    continuation: [VecDeque<T>; Priority::BANDS],
}

impl<T> Lanes<T> {
    fn new() -> Self {
        Self {
            primary: std::array::from_fn(|_| VecDeque::new()),
            continuation: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    fn lane(&self, band: usize, continuation: bool) -> &VecDeque<T> {
        if continuation {
            &self.continuation[band]
        } else {
            &self.primary[band]
        }
    }

    fn lane_mut(&mut self, band: usize, continuation: bool) -> &mut VecDeque<T> {
        if continuation {
            &mut self.continuation[band]
        } else {
            &mut self.primary[band]
        }
    }

    /// Lane holding the next item to serve
    fn head(&self) -> Option<(usize, bool)> {
        SERVICE_ORDER
            .into_iter()
            .find(|&(band, continuation)| !self.lane(band, continuation).is_empty())
    }

    fn len(&self) -> usize {
        self.primary.iter().chain(&self.continuation).map(VecDeque::len).sum()
    }
}

/// FIFO-per-lane priority queue with per-band admission bounds
pub struct BoundedPriorityQueue<T> {
    capacity_per_priority: usize,
    lanes: Mutex<Lanes<T>>,
    readable: Notify,
}

impl<T: Prioritized> BoundedPriorityQueue<T> {
    /// Create a queue admitting up to `capacity_per_priority` new-work items
    /// per band
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity_per_priority` is zero.
    pub fn new(capacity_per_priority: usize) -> Result<Self, Error> {
        if capacity_per_priority == 0 {
            return Err(LimiterError::invalid_argument(
                "capacity_per_priority",
                "must be greater than zero",
            )
            .into());
        }

        Ok(Self {
            capacity_per_priority,
            lanes: Mutex::new(Lanes::new()),
            readable: Notify::new(),
        })
    }

    #[must_use]
    pub fn capacity_per_priority(&self) -> usize {
        self.capacity_per_priority
    }

    /// Append an item to its lane
    ///
    /// Continuation items always succeed. New-work items are handed back in
    /// `Err` when their band's primary lane is full.
    ///
    /// # Errors
    ///
    /// Returns the item itself when the queue refuses it; this is a
    /// backpressure signal rather than a failure.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        let class = item.priority_class();
        let band = class.priority.band();
        {
            let mut lanes = self.lanes.lock();
            if class.continuation {
                lanes.continuation[band].push_back(item);
            } else if lanes.primary[band].len() >= self.capacity_per_priority {
                return Err(item);
            } else {
                lanes.primary[band].push_back(item);
            }
        }
        self.readable.notify_waiters();
        Ok(())
    }

    /// Inspect the head of the queue without removing it
    pub fn try_peek<R>(&self, inspect: impl FnOnce(&T) -> R) -> Option<R> {
        let lanes = self.lanes.lock();
        let (band, continuation) = lanes.head()?;
        let head = lanes.lane(band, continuation).front()?;
        Some(inspect(head))
    }

    /// Remove and return the head of the queue
    pub fn try_read(&self) -> Option<T> {
        let mut lanes = self.lanes.lock();
        let (band, continuation) = lanes.head()?;
        lanes.lane_mut(band, continuation).pop_front()
    }

    /// Wait until the queue holds at least one item
    ///
    /// Returns `false` if `cancel` fired first. A `true` result is only a
    /// hint: another reader may have taken the item already, so callers
    /// loop on `try_read` and wait again.
    pub async fn wait_to_be_readable(&self, cancel: &CancellationToken) -> bool {
        let notified = self.readable.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !self.is_empty() {
            return true;
        }

        tokio::select! {
            () = notified => true,
            () = cancel.cancelled() => false,
        }
    }

    /// Remove the first item, in service order, matching `predicate`
    pub fn remove_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let mut lanes = self.lanes.lock();
        for (band, continuation) in SERVICE_ORDER {
            let lane = lanes.lane_mut(band, continuation);
            if let Some(position) = lane.iter().position(&mut predicate) {
                return lane.remove(position);
            }
        }
        None
    }

    /// Remove every item, in service order
    pub fn drain(&self) -> Vec<T> {
        let mut lanes = self.lanes.lock();
        let mut drained = Vec::with_capacity(lanes.len());
        for (band, continuation) in SERVICE_ORDER {
            drained.extend(lanes.lane_mut(band, continuation).drain(..));
        }
        drained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items queued in `priority`'s band, both lanes
    #[must_use]
    pub fn queued(&self, priority: Priority) -> usize {
        let band = priority.band();
        let lanes = self.lanes.lock();
        lanes.primary[band].len() + lanes.continuation[band].len()
    }
}
