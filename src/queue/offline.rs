//! Bounded FIFO of requests made while offline.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::request::{DrainReport, QueueEvent, QueuedRequest};
use crate::api::{ApiRequest, RequestSender};
use crate::config::QueueConfig;
use crate::error::StoreResult;
use crate::store::{KvBackend, LocalStore, SetOptions};

/// Store key holding the persisted queue.
pub const QUEUE_STORE_KEY: &str = "api_request_queue";

const EVENT_CAPACITY: usize = 64;

/// Requests waiting for delivery, persisted through a `LocalStore`.
///
/// At most one drain runs at a time. A drain works on the entries present
/// when it started; anything enqueued meanwhile waits for the next pass.
pub struct RequestQueue<B: KvBackend> {
  store: LocalStore<B>,
  entries: Mutex<VecDeque<QueuedRequest>>,
  draining: tokio::sync::Mutex<()>,
  max_size: usize,
  max_retries: u32,
  events: broadcast::Sender<QueueEvent>,
}

impl<B: KvBackend> RequestQueue<B> {
  pub fn new(store: LocalStore<B>, config: &QueueConfig) -> Self {
    Self::with_limits(store, config.max_size, config.max_retries)
  }

  pub fn with_limits(store: LocalStore<B>, max_size: usize, max_retries: u32) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      store,
      entries: Mutex::new(VecDeque::new()),
      draining: tokio::sync::Mutex::new(()),
      max_size: max_size.max(1),
      max_retries,
      events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.events.subscribe()
  }

  /// Reload entries persisted by an earlier run, ahead of anything queued
  /// since. Returns how many were loaded.
  pub fn restore(&self) -> StoreResult<usize> {
    let persisted: Vec<QueuedRequest> = self.store.get_json(QUEUE_STORE_KEY)?.unwrap_or_default();
    let loaded = persisted.len();
    let evicted = {
      let mut entries = self.entries.lock();
      for item in persisted.into_iter().rev() {
        entries.push_front(item);
      }
      self.enforce_bound(&mut entries)
    };
    self.emit_evicted(evicted);
    if loaded > 0 {
      info!("Restored {} queued requests", loaded);
    }
    Ok(loaded)
  }

  /// Append `request`. The oldest entries are evicted past the size bound.
  pub fn enqueue(&self, request: ApiRequest) -> Uuid {
    let item = QueuedRequest::new(request, self.store.clock().now_millis());
    let id = item.id;
    debug!(id = %id, method = %item.request.method, url = %item.request.url, "Queued request");

    let evicted = {
      let mut entries = self.entries.lock();
      entries.push_back(item);
      self.enforce_bound(&mut entries)
    };
    self.emit(QueueEvent::Queued { id });
    self.emit_evicted(evicted);
    self.persist();
    id
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  /// Copy of the current entries, oldest first.
  pub fn snapshot(&self) -> Vec<QueuedRequest> {
    self.entries.lock().iter().cloned().collect()
  }

  /// Discard every entry. Returns how many were removed.
  pub fn clear(&self) -> usize {
    let removed = {
      let mut entries = self.entries.lock();
      let removed = entries.len();
      entries.clear();
      removed
    };
    self.persist();
    removed
  }

  /// Try to deliver every queued entry once through `sender`.
  ///
  /// Entries that already failed `max_retries` times are dropped instead
  /// of sent. Failed entries keep their place with their retry count
  /// raised, ahead of anything enqueued during the pass.
  pub async fn drain<S>(&self, sender: &S) -> DrainReport
  where
    S: RequestSender + ?Sized,
  {
    let Ok(_guard) = self.draining.try_lock() else {
      debug!("Drain already in progress, skipping");
      return DrainReport::skipped(self.len());
    };

    // Entries stay queued (and persisted) while in flight.
    let pending = self.snapshot();
    let mut report = DrainReport::default();
    if pending.is_empty() {
      return report;
    }
    info!("Processing {} queued requests", pending.len());

    for item in pending {
      if item.retry_count >= self.max_retries {
        warn!(id = %item.id, url = %item.request.url, "Dropping request after {} attempts", item.retry_count);
        self.remove(item.id);
        report.dropped += 1;
        self.emit(QueueEvent::Dropped { id: item.id });
        continue;
      }

      report.attempted += 1;
      match sender.send(&item.request).await {
        Ok(_) => {
          self.remove(item.id);
          report.succeeded += 1;
          self.emit(QueueEvent::Delivered { id: item.id });
        }
        Err(e) => {
          report.failed += 1;
          // Cleared or evicted while in flight: nothing to retry.
          let Some(retry_count) = self.bump_retry(item.id) else {
            continue;
          };
          debug!(id = %item.id, error = %e, retry_count, "Queued request failed");
          self.emit(QueueEvent::Retried {
            id: item.id,
            retry_count,
          });
        }
      }
    }

    report.remaining = self.len();
    self.persist();

    info!(
      "Queue processed: {} delivered, {} failed, {} dropped, {} remaining",
      report.succeeded, report.failed, report.dropped, report.remaining
    );
    report
  }

  fn remove(&self, id: Uuid) {
    self.entries.lock().retain(|q| q.id != id);
  }

  fn bump_retry(&self, id: Uuid) -> Option<u32> {
    let mut entries = self.entries.lock();
    let item = entries.iter_mut().find(|q| q.id == id)?;
    item.retry_count += 1;
    Some(item.retry_count)
  }

  fn enforce_bound(&self, entries: &mut VecDeque<QueuedRequest>) -> Vec<Uuid> {
    let mut evicted = Vec::new();
    while entries.len() > self.max_size {
      if let Some(oldest) = entries.pop_front() {
        evicted.push(oldest.id);
      }
    }
    evicted
  }

  fn emit_evicted(&self, evicted: Vec<Uuid>) {
    if !evicted.is_empty() {
      warn!("Request queue full, evicted {} oldest entries", evicted.len());
    }
    for id in evicted {
      self.emit(QueueEvent::Evicted { id });
    }
  }

  fn emit(&self, event: QueueEvent) {
    let _ = self.events.send(event);
  }

  fn persist(&self) {
    let entries = self.snapshot();
    if let Err(e) = self
      .store
      .set_json(QUEUE_STORE_KEY, &entries, SetOptions::default())
    {
      warn!(error = %e, "Failed to persist request queue");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiResponse;
  use crate::clock::ManualClock;
  use crate::crypto::{Encryptor, MemorySecretStore};
  use crate::error::{ApiError, ApiResult};
  use crate::store::{MemoryBackend, StoreOptions};
  use async_trait::async_trait;
  use serde_json::Value;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Arc;
  use tokio::sync::Notify;

  struct RecordingSender {
    fail: AtomicBool,
    calls: AtomicUsize,
    urls: parking_lot::Mutex<Vec<String>>,
  }

  impl RecordingSender {
    fn new(fail: bool) -> Self {
      Self {
        fail: AtomicBool::new(fail),
        calls: AtomicUsize::new(0),
        urls: parking_lot::Mutex::new(Vec::new()),
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl RequestSender for RecordingSender {
    async fn send(&self, request: &ApiRequest) -> ApiResult<ApiResponse> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.urls.lock().push(request.url.clone());
      if self.fail.load(Ordering::SeqCst) {
        Err(ApiError::Transport("connection refused".into()))
      } else {
        Ok(ApiResponse::new(200, Value::Null))
      }
    }
  }

  /// Blocks inside `send` until released.
  struct BlockingSender {
    entered: Notify,
    release: Notify,
    fail: bool,
  }

  impl BlockingSender {
    fn new(fail: bool) -> Arc<Self> {
      Arc::new(Self {
        entered: Notify::new(),
        release: Notify::new(),
        fail,
      })
    }
  }

  #[async_trait]
  impl RequestSender for BlockingSender {
    async fn send(&self, _request: &ApiRequest) -> ApiResult<ApiResponse> {
      self.entered.notify_one();
      self.release.notified().await;
      if self.fail {
        Err(ApiError::Transport("connection reset".into()))
      } else {
        Ok(ApiResponse::new(200, Value::Null))
      }
    }
  }

  fn store() -> LocalStore<MemoryBackend> {
    LocalStore::with_options(
      MemoryBackend::new(),
      Arc::new(Encryptor::new(Arc::new(MemorySecretStore::new()), false)),
      StoreOptions::default(),
      Arc::new(ManualClock::new(1_000)),
    )
    .unwrap()
  }

  fn queue() -> RequestQueue<MemoryBackend> {
    RequestQueue::with_limits(store(), 100, 3)
  }

  #[test]
  fn evicts_oldest_past_bound() {
    let queue = queue();
    let ids: Vec<Uuid> = (0..150)
      .map(|i| queue.enqueue(ApiRequest::get(format!("/item/{}", i))))
      .collect();

    assert_eq!(queue.len(), 100);
    let kept: Vec<Uuid> = queue.snapshot().iter().map(|q| q.id).collect();
    assert_eq!(kept, ids[50..].to_vec());
  }

  #[test]
  fn eviction_is_reported_as_event() {
    let queue = RequestQueue::with_limits(store(), 2, 3);
    let mut events = queue.subscribe();
    let first = queue.enqueue(ApiRequest::get("/1"));
    queue.enqueue(ApiRequest::get("/2"));
    queue.enqueue(ApiRequest::get("/3"));

    let evicted: Vec<QueueEvent> = std::iter::from_fn(|| events.try_recv().ok())
      .filter(|e| matches!(e, QueueEvent::Evicted { .. }))
      .collect();
    assert_eq!(evicted, vec![QueueEvent::Evicted { id: first }]);
  }

  #[tokio::test]
  async fn delivers_in_fifo_order_and_removes_successes() {
    let queue = queue();
    for i in 0..3 {
      queue.enqueue(ApiRequest::get(format!("/{}", i)));
    }
    let sender = RecordingSender::new(false);

    let report = queue.drain(&sender).await;
    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.remaining, 0);
    assert!(queue.is_empty());
    assert_eq!(*sender.urls.lock(), vec!["/0", "/1", "/2"]);
  }

  #[tokio::test]
  async fn drops_after_max_retries() {
    let queue = queue();
    let mut events = queue.subscribe();
    let id = queue.enqueue(ApiRequest::get("/flaky"));
    let sender = RecordingSender::new(true);

    for expected in 1..=3u32 {
      let report = queue.drain(&sender).await;
      assert_eq!(report.failed, 1);
      assert_eq!(queue.snapshot()[0].retry_count, expected);
    }

    let report = queue.drain(&sender).await;
    assert_eq!(report.dropped, 1);
    assert_eq!(report.attempted, 0);
    assert!(queue.is_empty());
    assert_eq!(sender.calls(), 3);

    let dropped = std::iter::from_fn(|| events.try_recv().ok())
      .any(|e| e == QueueEvent::Dropped { id });
    assert!(dropped);
  }

  #[tokio::test]
  async fn failures_stay_ahead_of_new_entries() {
    let queue = queue();
    queue.enqueue(ApiRequest::get("/a"));
    queue.enqueue(ApiRequest::get("/b"));
    let sender = RecordingSender::new(true);
    queue.drain(&sender).await;

    queue.enqueue(ApiRequest::get("/c"));
    let urls: Vec<String> = queue
      .snapshot()
      .into_iter()
      .map(|q| q.request.url)
      .collect();
    assert_eq!(urls, vec!["/a", "/b", "/c"]);
  }

  #[tokio::test]
  async fn concurrent_drain_is_skipped() {
    let queue = Arc::new(queue());
    queue.enqueue(ApiRequest::get("/slow"));
    let sender = BlockingSender::new(false);

    let first = {
      let queue = Arc::clone(&queue);
      let sender = Arc::clone(&sender);
      tokio::spawn(async move { queue.drain(sender.as_ref()).await })
    };
    sender.entered.notified().await;

    // Enqueued mid-drain: not part of the running pass.
    queue.enqueue(ApiRequest::get("/late"));
    let second = queue.drain(sender.as_ref()).await;
    assert!(second.skipped);

    sender.release.notify_one();
    let first = first.await.unwrap();
    assert!(!first.skipped);
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.remaining, 1);
    assert_eq!(queue.snapshot()[0].request.url, "/late");
  }

  #[tokio::test]
  async fn in_flight_entries_stay_persisted() {
    let store = store();
    let queue = Arc::new(RequestQueue::with_limits(store.clone(), 100, 3));
    queue.enqueue(ApiRequest::get("/in-flight"));
    let sender = BlockingSender::new(false);

    let drain = {
      let queue = Arc::clone(&queue);
      let sender = Arc::clone(&sender);
      tokio::spawn(async move { queue.drain(sender.as_ref()).await })
    };
    sender.entered.notified().await;
    queue.enqueue(ApiRequest::get("/late"));

    let reloaded = RequestQueue::with_limits(store, 100, 3);
    reloaded.restore().unwrap();
    let urls: Vec<String> = reloaded
      .snapshot()
      .into_iter()
      .map(|q| q.request.url)
      .collect();
    assert_eq!(urls, vec!["/in-flight", "/late"]);

    sender.release.notify_one();
    assert_eq!(drain.await.unwrap().succeeded, 1);
  }

  #[tokio::test]
  async fn clear_during_drain_discards_failures() {
    let queue = Arc::new(queue());
    queue.enqueue(ApiRequest::get("/doomed"));
    let sender = BlockingSender::new(true);

    let drain = {
      let queue = Arc::clone(&queue);
      let sender = Arc::clone(&sender);
      tokio::spawn(async move { queue.drain(sender.as_ref()).await })
    };
    sender.entered.notified().await;
    assert_eq!(queue.clear(), 1);

    sender.release.notify_one();
    let report = drain.await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 0);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn empty_drain_does_nothing() {
    let queue = queue();
    let sender = RecordingSender::new(false);
    assert_eq!(queue.drain(&sender).await, DrainReport::default());
    assert_eq!(sender.calls(), 0);
  }

  #[test]
  fn persists_and_restores() {
    let store = store();
    let first = RequestQueue::with_limits(store.clone(), 100, 3);
    first.enqueue(ApiRequest::get("/one"));
    first.enqueue(ApiRequest::post("/two", serde_json::json!({"n": 2})));

    let second = RequestQueue::with_limits(store, 100, 3);
    assert_eq!(second.restore().unwrap(), 2);
    assert_eq!(second.snapshot(), first.snapshot());
  }

  #[test]
  fn clear_empties_persisted_queue() {
    let store = store();
    let queue = RequestQueue::with_limits(store.clone(), 100, 3);
    queue.enqueue(ApiRequest::get("/x"));
    assert_eq!(queue.clear(), 1);

    let reloaded = RequestQueue::with_limits(store, 100, 3);
    assert_eq!(reloaded.restore().unwrap(), 0);
  }
}
