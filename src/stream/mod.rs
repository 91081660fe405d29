//! Stream multiplexer: fan-out of one turn's fragments to many subscribers.
//!
//! Each turn being generated has a session holding a replay buffer and the
//! senders of its current subscribers. Publishing never blocks; every
//! subscriber has its own bounded queue and is evicted with
//! [`StreamEvent::SlowConsumer`] when that queue fills. One slot of every
//! queue is reserved so the final event can always be delivered.
//!
//! A subscriber that joins late receives the buffered prefix and is
//! registered for live fragments under the same lock, so it sees every
//! fragment exactly once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::ledger::{TurnId, TurnOutcome};
use crate::provider::Fragment;

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Output text. A replayed fragment may cover several emitted fragments;
    /// `seq` is the sequence number of the last one it contains.
    Fragment { seq: u64, text: String },
    /// The turn ended; nothing follows.
    Closed { outcome: TurnOutcome },
    /// This subscriber fell too far behind and was dropped.
    SlowConsumer,
}

#[derive(Debug)]
struct Buffered {
    seq: u64,
    text: String,
}

struct SessionState {
    buffer: VecDeque<Buffered>,
    next_seq: u64,
    subscribers: Vec<mpsc::Sender<StreamEvent>>,
    terminal: Option<TurnOutcome>,
    /// Live `Subscription` handles, including evicted ones not yet dropped.
    live_subscriptions: usize,
}

struct StreamSession {
    turn_id: TurnId,
    state: Mutex<SessionState>,
}

type Sessions = Arc<DashMap<TurnId, Arc<StreamSession>>>;

/// Registry of stream sessions.
#[derive(Clone)]
pub struct Multiplexer {
    sessions: Sessions,
    queue_bound: usize,
    replay_limit: usize,
}

impl Multiplexer {
    /// `queue_bound` is the number of undelivered fragments a subscriber may
    /// have before it is evicted. `replay_limit` caps the replay buffer's
    /// entry count.
    pub fn new(queue_bound: usize, replay_limit: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            queue_bound: queue_bound.max(1),
            replay_limit: replay_limit.max(1),
        }
    }

    /// Create the session for a turn.
    pub fn open(&self, turn_id: TurnId) -> Result<Publisher> {
        let session = match self.sessions.entry(turn_id) {
            Entry::Occupied(_) => {
                return Err(Error::Internal(format!(
                    "stream for turn {} is already open",
                    turn_id
                )))
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(StreamSession {
                    turn_id,
                    state: Mutex::new(SessionState {
                        buffer: VecDeque::new(),
                        next_seq: 0,
                        subscribers: Vec::new(),
                        terminal: None,
                        live_subscriptions: 0,
                    }),
                });
                entry.insert(session.clone());
                session
            }
        };

        tracing::debug!(turn_id = %turn_id, "Stream opened");
        Ok(Publisher {
            session,
            sessions: self.sessions.clone(),
            replay_limit: self.replay_limit,
        })
    }

    /// Publish to an open session by id.
    pub fn publish(&self, turn_id: TurnId, fragment: &Fragment) -> Result<u64> {
        let session = self.session(turn_id)?;
        publish_to(&session, fragment, self.replay_limit)
    }

    /// Close a session by id. Closing twice is a no-op.
    pub fn close(&self, turn_id: TurnId, outcome: TurnOutcome) -> Result<()> {
        let session = self.session(turn_id)?;
        close_session(&session, &self.sessions, outcome);
        Ok(())
    }

    /// Subscribe to a turn's stream: the buffered prefix first, then live
    /// fragments, then the closing event.
    pub fn subscribe(&self, turn_id: TurnId) -> Result<Subscription> {
        let session = self.session(turn_id)?;

        let mut state = session.state.lock().unwrap();
        let replay = state.buffer.len();
        let (tx, rx) = mpsc::channel(replay + self.queue_bound + 1);

        for entry in &state.buffer {
            // Capacity covers the whole prefix.
            let _ = tx.try_send(StreamEvent::Fragment {
                seq: entry.seq,
                text: entry.text.clone(),
            });
        }

        match &state.terminal {
            Some(outcome) => {
                let _ = tx.try_send(StreamEvent::Closed {
                    outcome: outcome.clone(),
                });
            }
            None => state.subscribers.push(tx),
        }
        state.live_subscriptions += 1;
        drop(state);

        tracing::debug!(turn_id = %turn_id, replayed = replay, "Subscriber attached");
        Ok(Subscription {
            rx,
            session,
            sessions: self.sessions.clone(),
        })
    }

    /// Whether a session exists for the turn.
    pub fn contains(&self, turn_id: TurnId) -> bool {
        self.sessions.contains_key(&turn_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session(&self, turn_id: TurnId) -> Result<Arc<StreamSession>> {
        self.sessions
            .get(&turn_id)
            .map(|s| s.value().clone())
            .ok_or(Error::UnknownStream(turn_id))
    }
}

/// Write handle for one session, held by the task relaying the turn.
pub struct Publisher {
    session: Arc<StreamSession>,
    sessions: Sessions,
    replay_limit: usize,
}

impl Publisher {
    pub fn turn_id(&self) -> TurnId {
        self.session.turn_id
    }

    /// Buffer a fragment and forward it to every subscriber. Returns its
    /// sequence number.
    pub fn publish(&self, fragment: &Fragment) -> Result<u64> {
        publish_to(&self.session, fragment, self.replay_limit)
    }

    /// Deliver the terminal event and release all subscriber queues.
    pub fn close(self, outcome: TurnOutcome) {
        close_session(&self.session, &self.sessions, outcome);
    }
}

fn publish_to(session: &StreamSession, fragment: &Fragment, replay_limit: usize) -> Result<u64> {
    let mut state = session.state.lock().unwrap();
    if state.terminal.is_some() {
        return Err(Error::UnknownStream(session.turn_id));
    }

    let seq = state.next_seq;
    state.next_seq += 1;

    state.buffer.push_back(Buffered {
        seq,
        text: fragment.text.clone(),
    });
    if state.buffer.len() > replay_limit {
        // Fold the second-oldest entry into the oldest; the prefix stays complete.
        if let Some(second) = state.buffer.remove(1) {
            if let Some(head) = state.buffer.front_mut() {
                head.text.push_str(&second.text);
                head.seq = second.seq;
            }
        }
    }

    let turn_id = session.turn_id;
    state.subscribers.retain(|tx| {
        if tx.is_closed() {
            return false;
        }
        // The last slot is reserved for the final event.
        if tx.capacity() <= 1 {
            tracing::warn!(turn_id = %turn_id, seq, "Evicting slow subscriber");
            let _ = tx.try_send(StreamEvent::SlowConsumer);
            return false;
        }
        tx.try_send(StreamEvent::Fragment {
            seq,
            text: fragment.text.clone(),
        })
        .is_ok()
    });

    tracing::trace!(turn_id = %turn_id, seq, subscribers = state.subscribers.len(), "Fragment published");
    Ok(seq)
}

fn close_session(session: &Arc<StreamSession>, sessions: &Sessions, outcome: TurnOutcome) {
    let mut state = session.state.lock().unwrap();
    if state.terminal.is_some() {
        return;
    }

    for tx in state.subscribers.drain(..) {
        let _ = tx.try_send(StreamEvent::Closed {
            outcome: outcome.clone(),
        });
    }
    tracing::debug!(
        turn_id = %session.turn_id,
        status = %outcome.status(),
        fragments = state.next_seq,
        "Stream closed"
    );
    state.terminal = Some(outcome);
    let idle = state.live_subscriptions == 0;
    drop(state);

    if idle {
        teardown(session, sessions);
    }
}

fn teardown(session: &Arc<StreamSession>, sessions: &Sessions) {
    let removed = sessions
        .remove_if(&session.turn_id, |_, current| Arc::ptr_eq(current, session))
        .is_some();
    if removed {
        tracing::debug!(turn_id = %session.turn_id, "Stream session torn down");
    }
}

/// Read handle for one subscriber. Dropping it detaches the subscriber.
pub struct Subscription {
    rx: mpsc::Receiver<StreamEvent>,
    session: Arc<StreamSession>,
    sessions: Sessions,
}

impl Subscription {
    pub fn turn_id(&self) -> TurnId {
        self.session.turn_id
    }

    /// Next event, or `None` once the stream has ended for this subscriber.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> BoxStream<'static, StreamEvent> {
        Box::pin(futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        }))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.session.state.lock().unwrap();
        state.live_subscriptions = state.live_subscriptions.saturating_sub(1);
        let idle = state.terminal.is_some() && state.live_subscriptions == 0;
        drop(state);

        if idle {
            teardown(&self.session, &self.sessions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sub: &mut Subscription) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = sub.rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn text_of(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Fragment { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_in_order_delivery_to_all_subscribers() {
        let mux = Multiplexer::new(16, 64);
        let turn = TurnId::new();
        let publisher = mux.open(turn).unwrap();
        let mut a = mux.subscribe(turn).unwrap();
        let mut b = mux.subscribe(turn).unwrap();

        for text in ["one ", "two ", "three"] {
            publisher.publish(&Fragment::new(text)).unwrap();
        }
        publisher.close(TurnOutcome::Complete);

        for sub in [&mut a, &mut b] {
            let events = drain(sub);
            assert_eq!(text_of(&events), "one two three");
            assert_eq!(
                events.last(),
                Some(&StreamEvent::Closed {
                    outcome: TurnOutcome::Complete
                })
            );
            let seqs: Vec<u64> = events
                .iter()
                .filter_map(|e| match e {
                    StreamEvent::Fragment { seq, .. } => Some(*seq),
                    _ => None,
                })
                .collect();
            assert_eq!(seqs, vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_late_subscriber_gets_prefix_then_live() {
        let mux = Multiplexer::new(16, 64);
        let turn = TurnId::new();
        let publisher = mux.open(turn).unwrap();

        publisher.publish(&Fragment::new("a")).unwrap();
        publisher.publish(&Fragment::new("b")).unwrap();
        let mut late = mux.subscribe(turn).unwrap();
        publisher.publish(&Fragment::new("c")).unwrap();

        let events = drain(&mut late);
        assert_eq!(text_of(&events), "abc");
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_slow_subscriber_evicted_others_unaffected() {
        let mux = Multiplexer::new(2, 64);
        let turn = TurnId::new();
        let publisher = mux.open(turn).unwrap();
        let mut slow = mux.subscribe(turn).unwrap();
        let mut fast = mux.subscribe(turn).unwrap();

        let mut fast_events = Vec::new();
        for i in 0..5 {
            publisher.publish(&Fragment::new(i.to_string())).unwrap();
            fast_events.extend(drain(&mut fast));
        }
        publisher.close(TurnOutcome::Complete);
        fast_events.extend(drain(&mut fast));

        assert_eq!(text_of(&fast_events), "01234");
        assert!(matches!(fast_events.last(), Some(StreamEvent::Closed { .. })));

        let slow_events = drain(&mut slow);
        assert_eq!(text_of(&slow_events), "01");
        assert_eq!(slow_events.last(), Some(&StreamEvent::SlowConsumer));
    }

    #[test]
    fn test_terminal_event_fits_in_full_queue() {
        let mux = Multiplexer::new(2, 64);
        let turn = TurnId::new();
        let publisher = mux.open(turn).unwrap();
        let mut sub = mux.subscribe(turn).unwrap();

        publisher.publish(&Fragment::new("x")).unwrap();
        publisher.publish(&Fragment::new("y")).unwrap();
        publisher.close(TurnOutcome::Cancelled);

        let events = drain(&mut sub);
        assert_eq!(text_of(&events), "xy");
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Closed {
                outcome: TurnOutcome::Cancelled
            })
        );
    }

    #[test]
    fn test_replay_buffer_coalesces_oldest() {
        let mux = Multiplexer::new(16, 3);
        let turn = TurnId::new();
        let publisher = mux.open(turn).unwrap();
        for text in ["a", "b", "c", "d", "e"] {
            publisher.publish(&Fragment::new(text)).unwrap();
        }

        let mut late = mux.subscribe(turn).unwrap();
        let events = drain(&mut late);
        assert_eq!(
            events,
            vec![
                StreamEvent::Fragment {
                    seq: 2,
                    text: "abc".to_string()
                },
                StreamEvent::Fragment {
                    seq: 3,
                    text: "d".to_string()
                },
                StreamEvent::Fragment {
                    seq: 4,
                    text: "e".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_subscribe_after_close_gets_prefix_and_terminal() {
        let mux = Multiplexer::new(16, 64);
        let turn = TurnId::new();
        let publisher = mux.open(turn).unwrap();
        let _origin = mux.subscribe(turn).unwrap();
        publisher.publish(&Fragment::new("done")).unwrap();
        publisher.close(TurnOutcome::Complete);

        let mut late = mux.subscribe(turn).unwrap();
        let events = drain(&mut late);
        assert_eq!(text_of(&events), "done");
        assert!(matches!(events.last(), Some(StreamEvent::Closed { .. })));
    }

    #[test]
    fn test_unknown_stream() {
        let mux = Multiplexer::new(16, 64);
        assert!(matches!(
            mux.subscribe(TurnId::new()),
            Err(Error::UnknownStream(_))
        ));
    }

    #[test]
    fn test_torn_down_after_close_and_last_unsubscribe() {
        let mux = Multiplexer::new(16, 64);
        let turn = TurnId::new();
        let publisher = mux.open(turn).unwrap();
        let a = mux.subscribe(turn).unwrap();
        let b = mux.subscribe(turn).unwrap();

        drop(a);
        publisher.close(TurnOutcome::Complete);
        assert!(mux.contains(turn));

        drop(b);
        assert!(!mux.contains(turn));
        assert!(matches!(mux.subscribe(turn), Err(Error::UnknownStream(_))));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mux = Multiplexer::new(16, 64);
        let turn = TurnId::new();
        let _publisher = mux.open(turn).unwrap();
        let mut sub = mux.subscribe(turn).unwrap();

        mux.close(turn, TurnOutcome::Cancelled).unwrap();
        mux.close(turn, TurnOutcome::Complete).unwrap();

        let events = drain(&mut sub);
        assert_eq!(
            events,
            vec![StreamEvent::Closed {
                outcome: TurnOutcome::Cancelled
            }]
        );
        assert!(matches!(
            mux.publish(turn, &Fragment::new("late")),
            Err(Error::UnknownStream(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        use futures::StreamExt;

        let mux = Multiplexer::new(16, 64);
        let turn = TurnId::new();
        let publisher = mux.open(turn).unwrap();
        let sub = mux.subscribe(turn).unwrap();

        publisher.publish(&Fragment::new("hi")).unwrap();
        publisher.close(TurnOutcome::Complete);

        let events: Vec<StreamEvent> = sub.into_stream().collect().await;
        assert_eq!(events.len(), 2);
        assert!(!mux.contains(turn));
    }
}
