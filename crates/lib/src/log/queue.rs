//! Bounded, non-blocking event queue between the pipeline and its observer.
//!
//! Policy: drop-oldest, on top of a tokio broadcast channel. `emit` never
//! waits; when the observer falls behind the oldest undelivered events are
//! overwritten. The next `recv` after a loss yields a synthesized warning
//! carrying the number of lost events, so the consumer knows its view has
//! gaps.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::{LogEvent, LogLevel, LogSink};
use crate::job::Stage;

/// Create a queue holding at least `capacity` undelivered events. The
/// capacity is rounded up to a power of two.
pub fn log_queue(capacity: usize) -> (LogQueue, LogReceiver) {
  let (tx, rx) = broadcast::channel(capacity.max(1));
  (
    LogQueue { tx },
    LogReceiver {
      rx,
      last_stage: Stage::default(),
      dropped: 0,
    },
  )
}

/// Sending half; a [`LogSink`]. Dropping every clone closes the queue.
#[derive(Clone)]
pub struct LogQueue {
  tx: broadcast::Sender<LogEvent>,
}

impl LogSink for LogQueue {
  fn emit(&self, event: LogEvent) {
    // Fails only once the receiver is gone; nobody is left to tell.
    let _ = self.tx.send(event);
  }
}

/// Receiving half, owned by the observer.
pub struct LogReceiver {
  rx: broadcast::Receiver<LogEvent>,
  last_stage: Stage,
  dropped: u64,
}

impl LogReceiver {
  /// Take the next event without waiting.
  pub fn try_recv(&mut self) -> Option<LogEvent> {
    match self.rx.try_recv() {
      Ok(event) => Some(self.delivered(event)),
      Err(TryRecvError::Lagged(n)) => Some(self.lost(n)),
      Err(TryRecvError::Empty | TryRecvError::Closed) => None,
    }
  }

  /// Wait for the next event. Returns `None` once every sender is gone and the
  /// queue is drained.
  pub async fn recv(&mut self) -> Option<LogEvent> {
    match self.rx.recv().await {
      Ok(event) => Some(self.delivered(event)),
      Err(RecvError::Lagged(n)) => Some(self.lost(n)),
      Err(RecvError::Closed) => None,
    }
  }

  /// Number of events reported lost so far.
  pub fn dropped(&self) -> u64 {
    self.dropped
  }

  fn delivered(&mut self, event: LogEvent) -> LogEvent {
    self.last_stage = event.stage;
    event
  }

  fn lost(&mut self, n: u64) -> LogEvent {
    self.dropped += n;
    LogEvent::new(
      LogLevel::Warn,
      self.last_stage,
      format!("{n} log event(s) dropped because the observer fell behind"),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn event(message: &str) -> LogEvent {
    LogEvent::new(LogLevel::Info, Stage::Download, message)
  }

  #[test]
  fn delivers_in_order() {
    let (queue, mut rx) = log_queue(8);
    queue.emit(event("a"));
    queue.emit(event("b"));

    assert_eq!(rx.try_recv().unwrap().message, "a");
    assert_eq!(rx.try_recv().unwrap().message, "b");
    assert!(rx.try_recv().is_none());
  }

  #[test]
  fn full_queue_drops_oldest_and_reports_it() {
    let (queue, mut rx) = log_queue(4);
    for i in 1..=6 {
      queue.emit(event(&format!("line {i}")));
    }

    let notice = rx.try_recv().unwrap();
    assert_eq!(notice.level, LogLevel::Warn);
    assert!(notice.message.starts_with("2 log event(s) dropped"));

    let rest: Vec<String> = std::iter::from_fn(|| rx.try_recv()).map(|e| e.message).collect();
    assert_eq!(rest, vec!["line 3", "line 4", "line 5", "line 6"]);
    assert_eq!(rx.dropped(), 2);
  }

  #[test]
  fn drop_notice_keeps_last_seen_stage() {
    let (queue, mut rx) = log_queue(1);
    queue.emit(LogEvent::new(LogLevel::Info, Stage::Extract, "first"));
    assert_eq!(rx.try_recv().unwrap().stage, Stage::Extract);

    queue.emit(event("lost"));
    queue.emit(event("kept"));

    let notice = rx.try_recv().unwrap();
    assert_eq!(notice.stage, Stage::Extract);
    assert_eq!(rx.try_recv().unwrap().message, "kept");
  }

  #[test]
  fn zero_capacity_is_clamped() {
    let (queue, mut rx) = log_queue(0);
    queue.emit(event("only"));
    assert_eq!(rx.try_recv().unwrap().message, "only");
  }

  #[tokio::test]
  async fn recv_wakes_on_emit_and_ends_when_senders_drop() {
    let (queue, mut rx) = log_queue(4);
    let producer = queue.clone();
    drop(queue);

    let handle = tokio::spawn(async move {
      producer.emit(event("from task"));
    });

    assert_eq!(rx.recv().await.unwrap().message, "from task");
    handle.await.unwrap();
    assert!(rx.recv().await.is_none());
  }

  #[test]
  fn emit_never_blocks_without_consumer() {
    let (queue, mut rx) = log_queue(2);
    for i in 0..10_000 {
      queue.emit(event(&i.to_string()));
    }

    let notice = rx.try_recv().unwrap();
    assert!(notice.message.starts_with("9998 log event(s) dropped"));
    assert_eq!(rx.dropped(), 9_998);
  }
}
