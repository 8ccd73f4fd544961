use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use wire_coordination::now_millis;

#[derive(Debug)]
struct Tracked {
    seq: u64,
    timeout: Duration,
}

#[derive(Debug, Default)]
struct Schedule {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    by_seq: HashMap<u64, String>,
    entries: HashMap<String, Tracked>,
    next_seq: u64,
}

impl Schedule {
    fn push(&mut self, message_id: &str, check_at: Instant, timeout: Duration) {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(previous) = self
            .entries
            .insert(message_id.to_string(), Tracked { seq, timeout })
        {
            self.by_seq.remove(&previous.seq);
        }
        self.by_seq.insert(seq, message_id.to_string());
        self.heap.push(Reverse((check_at, seq)));
    }
}

/// An extension that is due for an in-flight message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DueExtension {
    /// The message being processed.
    pub message_id: String,

    /// Time granted to the sender.
    pub extension: Duration,
}

/// One sorted-deadline queue for every in-flight message of a receiver.
///
/// A message's first check fires `min(threshold, timeout / 2)` before its deadline. Each firing
/// grants a fresh extension and schedules the next check the same way, until the message is
/// untracked.
#[derive(Clone, Debug)]
pub struct DeadlineMonitor {
    extension: Option<Duration>,
    notify: Arc<Notify>,
    schedule: Arc<Mutex<Schedule>>,
    threshold: Duration,
}

impl DeadlineMonitor {
    /// Creates a monitor. `extension` overrides the time granted per extension, which otherwise
    /// equals the message's own timeout.
    #[must_use]
    pub fn new(threshold: Duration, extension: Option<Duration>) -> Self {
        Self {
            extension,
            notify: Arc::new(Notify::new()),
            schedule: Arc::new(Mutex::new(Schedule::default())),
            threshold,
        }
    }

    fn lead(&self, window: Duration) -> Duration {
        self.threshold.min(window / 2)
    }

    /// Starts monitoring a message sent at `sent_at_ms` (Unix millis) with the given timeout.
    pub fn track(&self, message_id: &str, sent_at_ms: u64, timeout: Duration) {
        let elapsed = Duration::from_millis(now_millis().saturating_sub(sent_at_ms));

        self.track_until(
            message_id,
            Instant::now() + timeout.saturating_sub(elapsed),
            timeout,
        );
    }

    /// Starts monitoring a message that must be answered by `deadline`.
    pub fn track_until(&self, message_id: &str, deadline: Instant, timeout: Duration) {
        let check_at = deadline
            .checked_sub(self.lead(timeout))
            .unwrap_or_else(Instant::now);

        self.schedule.lock().push(message_id, check_at, timeout);
        self.notify.notify_one();
    }

    /// Stops monitoring a message.
    pub fn untrack(&self, message_id: &str) {
        let mut schedule = self.schedule.lock();
        if let Some(tracked) = schedule.entries.remove(message_id) {
            schedule.by_seq.remove(&tracked.seq);
        }
    }

    /// Number of monitored messages.
    pub fn len(&self) -> usize {
        self.schedule.lock().entries.len()
    }

    /// Whether no messages are monitored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least one extension is due and returns every due extension.
    pub async fn next_due(&self) -> Vec<DueExtension> {
        loop {
            let notified = self.notify.notified();
            let next = self.next_check();

            match next {
                Some(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(at) => {}
                        () = notified => continue,
                    }
                }
                None => {
                    notified.await;
                    continue;
                }
            }

            let due = self.take_due(Instant::now());
            if !due.is_empty() {
                return due;
            }
        }
    }

    fn next_check(&self) -> Option<Instant> {
        let mut schedule = self.schedule.lock();

        while let Some(Reverse((at, seq))) = schedule.heap.peek().copied() {
            if schedule.by_seq.contains_key(&seq) {
                return Some(at);
            }
            schedule.heap.pop();
        }

        None
    }

    fn take_due(&self, now: Instant) -> Vec<DueExtension> {
        let mut schedule = self.schedule.lock();
        let mut due = Vec::new();

        while let Some(Reverse((at, seq))) = schedule.heap.peek().copied() {
            if at > now {
                break;
            }
            schedule.heap.pop();

            let Some(message_id) = schedule.by_seq.remove(&seq) else {
                continue;
            };
            let Some(timeout) = schedule.entries.get(&message_id).map(|t| t.timeout) else {
                continue;
            };

            let extension = self.extension.unwrap_or(timeout);
            let check_at = (now + extension)
                .checked_sub(self.lead(extension))
                .unwrap_or(now);
            schedule.push(&message_id, check_at, timeout);

            due.push(DueExtension {
                message_id,
                extension,
            });
        }

        due
    }
}
