use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    QueueResult, QueueError, JobId, Envelope, ClaimedJob, ClaimToken, JobEvent,
    broker::{Broker, BoxStream},
    types::envelope::after,
};

#[derive(Debug)]
struct InFlight {
    nonce: String,
    visible_until: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    /// Waiting and claimed envelopes by id
    envelopes: HashMap<JobId, Envelope>,

    /// queue name -> waiting job ids in arrival order
    queues: HashMap<String, VecDeque<JobId>>,

    in_flight: HashMap<JobId, InFlight>,

    /// Most recent first
    dead: VecDeque<Envelope>,
}

impl State {
    /// Validate a token and release its claim, returning the envelope
    fn release(&mut self, token: &ClaimToken) -> QueueResult<Envelope> {
        let job_id = token.job_id();
        match self.in_flight.get(job_id) {
            Some(flight) if flight.nonce == token.nonce() => {}
            _ => return Err(QueueError::StaleClaim(job_id.clone())),
        }
        self.in_flight.remove(job_id);
        self.envelopes
            .remove(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))
    }

    fn push_waiting(&mut self, envelope: Envelope, front: bool) {
        let queue = self.queues.entry(envelope.queue.clone()).or_default();
        if front {
            queue.push_front(envelope.job_id.clone());
        } else {
            queue.push_back(envelope.job_id.clone());
        }
        self.envelopes.insert(envelope.job_id.clone(), envelope);
    }

    /// Make lapsed claims visible again at the head of their queue
    fn reclaim_expired(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.visible_until <= now)
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in &expired {
            self.in_flight.remove(job_id);
            if let Some(envelope) = self.envelopes.remove(job_id) {
                self.push_waiting(envelope, true);
            }
        }
        expired
    }
}

/// In-process broker for tests and development
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<JobEvent>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1000);

        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
        }
    }

    /// Run one visibility-timeout sweep, returning how many claims were reclaimed
    pub fn reclaim_expired(&self) -> usize {
        let now = Utc::now();
        let reclaimed = self.state.lock().reclaim_expired(now);
        for job_id in &reclaimed {
            debug!(job_id = %job_id, "Reclaimed lapsed claim");
            let _ = self.events.send(JobEvent::Reclaimed { job_id: job_id.clone(), at: now });
        }
        reclaimed.len()
    }

    /// Number of envelopes currently claimed
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Force a claim's visibility window to lapse (test helper)
    pub fn force_claim_expiry(&self, job_id: &JobId) {
        if let Some(flight) = self.state.lock().in_flight.get_mut(job_id) {
            flight.visible_until = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, envelope: Envelope) -> QueueResult<JobId> {
        envelope.arguments.validate()?;
        let job_id = envelope.job_id.clone();
        let event = JobEvent::Enqueued {
            job_id: job_id.clone(),
            queue: envelope.queue.clone(),
            name: envelope.name().to_string(),
            at: Utc::now(),
        };

        {
            let mut state = self.state.lock();
            if state.envelopes.contains_key(&job_id) {
                debug!(job_id = %job_id, "Envelope already stored");
                return Ok(job_id);
            }
            state.push_waiting(envelope, false);
        }

        let _ = self.events.send(event);
        Ok(job_id)
    }

    async fn claim(&self, queues: &[String], visibility: Duration) -> QueueResult<Option<ClaimedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        for job_id in state.reclaim_expired(now) {
            let _ = self.events.send(JobEvent::Reclaimed { job_id, at: now });
        }

        for queue_name in queues {
            let position = match state.queues.get(queue_name) {
                Some(queue) => queue.iter().position(|job_id| {
                    state
                        .envelopes
                        .get(job_id)
                        .map(|envelope| envelope.is_available(now))
                        .unwrap_or(false)
                }),
                None => None,
            };

            let Some(index) = position else { continue };
            let Some(job_id) = state.queues.get_mut(queue_name).and_then(|q| q.remove(index)) else {
                continue;
            };
            let Some(envelope) = state.envelopes.get(&job_id).cloned() else {
                continue;
            };

            let token = ClaimToken::new(job_id.clone());
            let visible_until = after(now, visibility);
            state.in_flight.insert(
                job_id.clone(),
                InFlight { nonce: token.nonce().to_string(), visible_until },
            );

            let _ = self.events.send(JobEvent::Claimed {
                job_id,
                attempt: envelope.attempt,
                visible_until,
                at: now,
            });
            return Ok(Some(ClaimedJob::new(envelope, token, visible_until)));
        }

        Ok(None)
    }

    async fn ack(&self, token: &ClaimToken) -> QueueResult<()> {
        self.state.lock().release(token)?;

        let _ = self.events.send(JobEvent::Acked {
            job_id: token.job_id().clone(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn retry(&self, token: &ClaimToken, delay: Duration, error: &str) -> QueueResult<()> {
        let next = {
            let mut state = self.state.lock();
            let envelope = state.release(token)?;
            let next = envelope.next_attempt(delay, error);
            state.push_waiting(next.clone(), false);
            next
        };

        let _ = self.events.send(JobEvent::Retrying {
            job_id: next.job_id,
            attempt: next.attempt,
            available_at: next.available_at,
            error: error.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letter(&self, token: &ClaimToken, error: &str) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            let mut envelope = state.release(token)?;
            envelope.last_error = Some(error.to_string());
            state.dead.push_front(envelope);
        }

        let _ = self.events.send(JobEvent::DeadLettered {
            job_id: token.job_id().clone(),
            error: error.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> QueueResult<usize> {
        Ok(self.state.lock().queues.get(queue).map(VecDeque::len).unwrap_or(0))
    }

    async fn dead_letters(&self) -> QueueResult<Vec<Envelope>> {
        Ok(self.state.lock().dead.iter().cloned().collect())
    }

    async fn requeue_dead_letter(&self, job_id: &JobId) -> QueueResult<bool> {
        let mut state = self.state.lock();
        let Some(index) = state.dead.iter().position(|envelope| &envelope.job_id == job_id) else {
            return Ok(false);
        };
        let Some(mut envelope) = state.dead.remove(index) else {
            return Ok(false);
        };

        envelope.attempt = 0;
        envelope.available_at = Utc::now();
        state.push_waiting(envelope, false);
        Ok(true)
    }

    fn event_stream(&self) -> BoxStream<JobEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|result| result.ok());

        Box::pin(stream)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
