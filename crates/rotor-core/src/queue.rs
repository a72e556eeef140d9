//! Bounded, priority-ordered, deduplicated rotation request queue (spec §4.4).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Strict ordering: `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRequest {
    pub id: String,
    pub provider: String,
    pub model_name: String,
    pub priority: Priority,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    QueueFull,
    InvalidInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub size: usize,
    pub max_size: usize,
    pub is_processing: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub priority_breakdown: HashMap<Priority, usize>,
}

struct Inner {
    items: Vec<RotationRequest>,
    last_processed_at: Option<DateTime<Utc>>,
}

/// Monotonic counter rather than a UUID — cheap, and ordering by id doubles
/// as an insertion-order tiebreaker if ever needed.
fn next_id(counter: &std::sync::atomic::AtomicU64) -> String {
    let n = counter.fetch_add(1, Ordering::Relaxed);
    format!("rot-{n:x}")
}

/// Bounded priority queue of [`RotationRequest`]s, deduplicated on
/// `(provider, model_name, source)`, with cooperative single-processor
/// draining (spec §4.4, §5).
pub struct Queue {
    max_size: usize,
    inner: Mutex<Inner>,
    is_processing: Arc<AtomicBool>,
    id_counter: std::sync::atomic::AtomicU64,
    auto_process: Arc<AtomicBool>,
}

impl Queue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner {
                items: Vec::new(),
                last_processed_at: None,
            }),
            is_processing: Arc::new(AtomicBool::new(false)),
            id_counter: std::sync::atomic::AtomicU64::new(0),
            auto_process: Arc::new(AtomicBool::new(false)),
        }
    }

    fn validate(provider: &str, model_name: &str, source: &str) -> bool {
        !provider.trim().is_empty() && !model_name.trim().is_empty() && !source.trim().is_empty()
    }

    /// Enqueue a rotation request. Returns the accepted request's id, or
    /// `Err` on invalid input / a full queue. Deduplicates on
    /// `(provider, model_name, source)`: an existing match has its priority
    /// upgraded in place (never downgraded) rather than being re-enqueued.
    pub fn enqueue(
        &self,
        provider: impl Into<String>,
        model_name: impl Into<String>,
        priority: Priority,
        source: impl Into<String>,
    ) -> Result<String, EnqueueError> {
        let provider = provider.into();
        let model_name = model_name.into();
        let source = source.into();
        if !Self::validate(&provider, &model_name, &source) {
            return Err(EnqueueError::InvalidInput);
        }

        let mut guard = self.inner.lock();
        if let Some(existing) = guard
            .items
            .iter_mut()
            .find(|r| r.provider == provider && r.model_name == model_name && r.source == source)
        {
            if priority > existing.priority {
                existing.priority = priority;
            }
            return Ok(existing.id.clone());
        }

        if guard.items.len() >= self.max_size {
            return Err(EnqueueError::QueueFull);
        }

        let id = next_id(&self.id_counter);
        guard.items.push(RotationRequest {
            id: id.clone(),
            provider,
            model_name,
            priority,
            source,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    fn best_index(items: &[RotationRequest]) -> Option<usize> {
        items
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.timestamp.cmp(&a.timestamp))
            })
            .map(|(i, _)| i)
    }

    /// Highest-priority, oldest-within-priority request, without removing it.
    pub fn peek(&self) -> Option<RotationRequest> {
        let guard = self.inner.lock();
        Self::best_index(&guard.items).map(|i| guard.items[i].clone())
    }

    /// Remove and return the highest-priority, oldest-within-priority request.
    pub fn pop(&self) -> Option<RotationRequest> {
        let mut guard = self.inner.lock();
        let idx = Self::best_index(&guard.items)?;
        Some(guard.items.remove(idx))
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut guard = self.inner.lock();
        let before = guard.items.len();
        guard.items.retain(|r| r.id != id);
        guard.items.len() != before
    }

    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }

    pub fn contents(&self) -> Vec<RotationRequest> {
        self.inner.lock().items.clone()
    }

    pub fn status(&self) -> QueueStatus {
        let guard = self.inner.lock();
        let mut priority_breakdown = HashMap::new();
        for item in &guard.items {
            *priority_breakdown.entry(item.priority).or_insert(0) += 1;
        }
        QueueStatus {
            size: guard.items.len(),
            max_size: self.max_size,
            is_processing: self.is_processing.load(Ordering::Acquire),
            last_processed_at: guard.last_processed_at,
            priority_breakdown,
        }
    }

    /// Alias kept distinct from [`Queue::status`] per spec §4.4's operation
    /// table; identical payload today, separate so callers that need only
    /// aggregate counters aren't coupled to the richer status type later.
    pub fn stats(&self) -> QueueStatus {
        self.status()
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::Acquire)
    }

    /// Drain the queue in priority order, invoking `handler` for each
    /// request. At most one processor runs at a time — a concurrent call
    /// returns immediately without draining. Items are popped on success
    /// *and* on failure (spec §9: "pop-on-success", clarified to mean the
    /// queue never retains a request across handler outcomes — retries, if
    /// any, happen inside a single handler invocation, not via re-enqueue).
    pub async fn process<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(RotationRequest) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // Scoped release: every exit path below (loop end, or panic unwind
        // via Drop) flips the flag back.
        struct Guard<'a>(&'a AtomicBool);
        impl Drop for Guard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _guard = Guard(&self.is_processing);

        while let Some(req) = self.pop() {
            handler(req).await;
            self.inner.lock().last_processed_at = Some(Utc::now());
        }
    }

    pub fn start_auto_process(&self) {
        self.auto_process.store(true, Ordering::Release);
    }

    pub fn stop_auto_process(&self) {
        self.auto_process.store(false, Ordering::Release);
    }

    pub fn auto_process_enabled(&self) -> bool {
        self.auto_process.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
