//! Broker test doubles: recorded acknowledgments and a scripted client.

use purchase_status_core::{
    Acknowledger, BrokerClient, BrokerError, BrokerEvent, ConsumerSpec, Delivery, Outcome,
    Topology,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// One acknowledgment frame sent for a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckCall {
    /// `basic.ack`
    Ack,
    /// `basic.nack`
    Nack {
        /// Whether the broker was asked to requeue.
        requeue: bool,
    },
}

impl AckCall {
    /// The frame a delivery resolved with `outcome` sends.
    #[must_use]
    pub const fn for_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Acked => Self::Ack,
            Outcome::NackedRequeue => Self::Nack { requeue: true },
            Outcome::NackedDrop => Self::Nack { requeue: false },
        }
    }
}

#[derive(Debug, Default)]
struct AckLogInner {
    calls: Mutex<Vec<(u64, AckCall)>>,
    next_tag: AtomicU64,
    fail: AtomicBool,
}

/// Shared log of every ack/nack sent by deliveries it created.
#[derive(Clone, Debug, Default)]
pub struct AckLog {
    inner: Arc<AckLogInner>,
}

impl AckLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a delivery whose frames are recorded here.
    ///
    /// Delivery tags start at 1 and increase per delivery.
    #[must_use]
    pub fn delivery(&self, body: Vec<u8>, redelivered: bool) -> Delivery {
        let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let acker = RecordingAcknowledger {
            tag,
            log: self.clone(),
        };
        Delivery::new(body, tag, redelivered, Box::new(acker))
    }

    /// Recorded frames, in send order.
    #[must_use]
    pub fn calls(&self) -> Vec<AckCall> {
        self.lock().iter().map(|(_, call)| *call).collect()
    }

    /// Recorded frames with the delivery tag they were sent for.
    #[must_use]
    pub fn tagged_calls(&self) -> Vec<(u64, AckCall)> {
        self.lock().clone()
    }

    /// Make subsequent frames fail after being recorded.
    pub fn fail_acks(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    fn record(&self, tag: u64, call: AckCall) -> Result<(), BrokerError> {
        self.lock().push((tag, call));
        if self.inner.fail.load(Ordering::SeqCst) {
            Err(BrokerError::Acknowledgment("channel closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, AckCall)>> {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fresh (not redelivered) delivery recorded in `log`.
#[must_use]
pub fn test_delivery(log: &AckLog, body: &[u8]) -> Delivery {
    log.delivery(body.to_vec(), false)
}

struct RecordingAcknowledger {
    tag: u64,
    log: AckLog,
}

impl Acknowledger for RecordingAcknowledger {
    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move { self.log.record(self.tag, AckCall::Ack) })
    }

    fn nack(
        &self,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move { self.log.record(self.tag, AckCall::Nack { requeue }) })
    }
}

enum Script {
    Event(BrokerEvent),
    Close,
}

#[derive(Default)]
struct ScriptState {
    declared: Vec<Topology>,
    consumers: Vec<ConsumerSpec>,
    declare_error: Option<BrokerError>,
    consume_error: Option<BrokerError>,
    closed: bool,
}

/// A [`BrokerClient`] whose events are pushed by a test.
///
/// Create one with [`ScriptedBroker::new`], hand the client to the code under
/// test and drive it through the returned [`ScriptedBrokerHandle`].
pub struct ScriptedBroker {
    events: mpsc::UnboundedReceiver<Script>,
    state: Arc<Mutex<ScriptState>>,
    finished: bool,
}

/// Test-side controls of a [`ScriptedBroker`].
#[derive(Clone)]
pub struct ScriptedBrokerHandle {
    events: mpsc::UnboundedSender<Script>,
    state: Arc<Mutex<ScriptState>>,
    acks: AckLog,
}

impl ScriptedBroker {
    /// Create a client and its handle.
    #[must_use]
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, ScriptedBrokerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ScriptState::default()));
        let client = Self {
            events: rx,
            state: Arc::clone(&state),
            finished: false,
        };
        let handle = ScriptedBrokerHandle {
            events: tx,
            state,
            acks: AckLog::new(),
        };
        (client, handle)
    }
}

fn lock(state: &Mutex<ScriptState>) -> std::sync::MutexGuard<'_, ScriptState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedBrokerHandle {
    /// Queue a delivery; its frames are recorded in [`acks`](Self::acks).
    pub fn deliver(&self, body: impl Into<Vec<u8>>, redelivered: bool) {
        let delivery = self.acks.delivery(body.into(), redelivered);
        self.push(BrokerEvent::Delivery(delivery));
    }

    /// Queue an arbitrary event.
    pub fn push(&self, event: BrokerEvent) {
        // The client may already be gone; events after that are irrelevant.
        let _ = self.events.send(Script::Event(event));
    }

    /// Make the stream end after the queued events.
    pub fn close(&self) {
        let _ = self.events.send(Script::Close);
    }

    /// Make the next `declare` call fail.
    pub fn fail_declare(&self, error: BrokerError) {
        lock(&self.state).declare_error = Some(error);
    }

    /// Make the next `consume` call fail.
    pub fn fail_consume(&self, error: BrokerError) {
        lock(&self.state).consume_error = Some(error);
    }

    /// Frames sent by deliveries queued through [`deliver`](Self::deliver).
    #[must_use]
    pub fn acks(&self) -> &AckLog {
        &self.acks
    }

    /// Topologies declared so far.
    #[must_use]
    pub fn declared(&self) -> Vec<Topology> {
        lock(&self.state).declared.clone()
    }

    /// Consumers registered so far.
    #[must_use]
    pub fn consumers(&self) -> Vec<ConsumerSpec> {
        lock(&self.state).consumers.clone()
    }

    /// Whether the client's owner closed it.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl BrokerClient for ScriptedBroker {
    fn declare(
        &mut self,
        topology: Topology,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if let Some(error) = state.declare_error.take() {
                return Err(error);
            }
            state.declared.push(topology);
            Ok(())
        })
    }

    fn consume(
        &mut self,
        spec: ConsumerSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if let Some(error) = state.consume_error.take() {
                return Err(error);
            }
            state.consumers.push(spec);
            Ok(())
        })
    }

    fn next_event(&mut self) -> Pin<Box<dyn Future<Output = Option<BrokerEvent>> + Send + '_>> {
        Box::pin(async move {
            if self.finished {
                return None;
            }
            match self.events.recv().await {
                Some(Script::Event(event)) => Some(event),
                Some(Script::Close) | None => {
                    self.finished = true;
                    None
                }
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.finished = true;
            lock(&self.state).closed = true;
            Ok(())
        })
    }
}
