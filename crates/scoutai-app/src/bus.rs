// Context bus: addressed delivery of envelopes between isolated contexts.
//
// Every context (background, popup, each tab's content script) registers an
// address and receives `Delivery` values on its own queue. Contexts share no
// state through the bus other than the address table; envelopes cross it as
// JSON text.
//
// A reply-carrying send hands the receiver a single-use `Responder`. The
// sender's future stays pending until the responder is used, dropped, or the
// reply timeout elapses; there is no separate "keep the channel open" flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use scoutai_core::protocol::{error_reply, ContextAddr, CorrelationId, Envelope, Message, MessageType};
use scoutai_core::ScoutError;

/// Queue depth of each context's inbox.
const ENDPOINT_CAPACITY: usize = 256;

type ReplySlot = oneshot::Sender<Result<Value, ScoutError>>;

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Single-use reply handle for one request.
///
/// Dropping a responder without calling [`Responder::reply`] is a bug in the
/// handler that claimed the message: it is logged and the sender fails with
/// [`ScoutError::ReplyDropped`] instead of waiting out the timeout.
pub struct Responder {
    message_type: MessageType,
    correlation_id: Option<CorrelationId>,
    target: ContextAddr,
    slot: Option<ReplySlot>,
}

impl Responder {
    fn new(
        message_type: MessageType,
        correlation_id: Option<CorrelationId>,
        target: ContextAddr,
        slot: ReplySlot,
    ) -> Self {
        Responder {
            message_type,
            correlation_id,
            target,
            slot: Some(slot),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Answer the request. A sender that has gone away (closed popup, torn
    /// down tab) is tolerated.
    pub fn reply(mut self, value: Value) {
        if let Some(slot) = self.slot.take() {
            if slot.send(Ok(value)).is_err() {
                debug!(
                    message_type = %self.message_type,
                    correlation_id = ?self.correlation_id,
                    "Reply dropped: sender no longer waiting"
                );
            }
        }
    }

    /// The receiving context is going away before handling the request.
    fn reject_unreachable(mut self) {
        if let Some(slot) = self.slot.take() {
            let _ = slot.send(Err(ScoutError::UnreachableTarget {
                target: self.target,
            }));
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.slot.is_some() {
            error!(
                message_type = %self.message_type,
                correlation_id = ?self.correlation_id,
                target = %self.target,
                "Message claimed but never answered"
            );
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("message_type", &self.message_type)
            .field("correlation_id", &self.correlation_id)
            .field("answered", &self.slot.is_none())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Delivery / Incoming
// ---------------------------------------------------------------------------

/// What arrives in a context's inbox: wire JSON plus the reply handle.
#[derive(Debug)]
pub struct Delivery {
    pub from: ContextAddr,
    pub wire: String,
    pub responder: Option<Responder>,
}

impl Delivery {
    /// Decode the envelope. Undecodable envelopes are answered with an
    /// `{"error": ...}` reply here and yield `None`.
    pub fn open(self) -> Option<Incoming> {
        match Envelope::decode(&self.wire) {
            Ok(envelope) => Some(Incoming {
                from: self.from,
                envelope,
                responder: self.responder,
            }),
            Err(e) => {
                warn!(from = %self.from, "Rejecting envelope: {e}");
                if let Some(responder) = self.responder {
                    responder.reply(error_reply(&e));
                }
                None
            }
        }
    }
}

/// A decoded delivery.
#[derive(Debug)]
pub struct Incoming {
    pub from: ContextAddr,
    pub envelope: Envelope,
    pub responder: Option<Responder>,
}

impl Incoming {
    pub fn message(&self) -> &Message {
        &self.envelope.message
    }

    pub fn message_type(&self) -> MessageType {
        self.envelope.message_type()
    }

    /// Reply if the sender is waiting for one.
    pub fn reply(self, value: Value) {
        if let Some(responder) = self.responder {
            responder.reply(value);
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A context's inbox. Dropping it makes the address unreachable; requests
/// still queued are rejected with `UnreachableTarget`.
pub struct Endpoint {
    addr: ContextAddr,
    rx: mpsc::Receiver<Delivery>,
}

impl Endpoint {
    pub fn addr(&self) -> ContextAddr {
        self.addr
    }

    /// Next delivery, or `None` once the bus has replaced or removed this
    /// address.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.rx.close();
        while let Ok(delivery) = self.rx.try_recv() {
            if let Some(responder) = delivery.responder {
                responder.reject_unreachable();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// Outcome of a best-effort broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<ContextAddr>,
    pub failed: Vec<(ContextAddr, ScoutError)>,
}

struct BusInner {
    routes: Mutex<HashMap<ContextAddr, mpsc::Sender<Delivery>>>,
    reply_timeout: Duration,
    next_correlation: AtomicU64,
}

/// Cloneable handle to the address table.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(reply_timeout: Duration) -> Self {
        MessageBus {
            inner: Arc::new(BusInner {
                routes: Mutex::new(HashMap::new()),
                reply_timeout,
                next_correlation: AtomicU64::new(1),
            }),
        }
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<ContextAddr, mpsc::Sender<Delivery>>> {
        self.inner.routes.lock().expect("bus route table poisoned")
    }

    pub fn reply_timeout(&self) -> Duration {
        self.inner.reply_timeout
    }

    /// Register `addr` and return its inbox. Registering an address again
    /// replaces the previous inbox, whose `recv` then returns `None`.
    pub fn register(&self, addr: ContextAddr) -> Endpoint {
        let (tx, rx) = mpsc::channel(ENDPOINT_CAPACITY);
        if self.routes().insert(addr, tx).is_some() {
            debug!(%addr, "Replaced existing endpoint");
        }
        Endpoint { addr, rx }
    }

    /// Remove `addr`. Its inbox drains and then closes.
    pub fn unregister(&self, addr: ContextAddr) {
        self.routes().remove(&addr);
    }

    /// Whether a live context is registered at `addr`.
    pub fn is_registered(&self, addr: ContextAddr) -> bool {
        self.routes().get(&addr).is_some_and(|tx| !tx.is_closed())
    }

    fn route(&self, to: ContextAddr) -> Option<mpsc::Sender<Delivery>> {
        let mut routes = self.routes();
        match routes.get(&to) {
            Some(tx) if tx.is_closed() => {
                routes.remove(&to);
                None
            }
            Some(tx) => Some(tx.clone()),
            None => None,
        }
    }

    fn next_correlation_id(&self, from: ContextAddr) -> CorrelationId {
        let seq = self.inner.next_correlation.fetch_add(1, Ordering::Relaxed);
        let prefix = match from {
            ContextAddr::Background => "bg".to_string(),
            ContextAddr::Popup => "popup".to_string(),
            ContextAddr::Tab(id) => format!("tab{id}"),
        };
        CorrelationId(format!("{prefix}-{seq}"))
    }

    /// Send `message` from `from` to `to` using the default reply timeout.
    ///
    /// Returns `Ok(Some(reply))` for reply-carrying types and `Ok(None)` for
    /// fire-and-forget types once the receiver's inbox accepted them.
    pub async fn send(
        &self,
        from: ContextAddr,
        to: ContextAddr,
        message: Message,
    ) -> Result<Option<Value>, ScoutError> {
        self.send_with_timeout(from, to, message, self.inner.reply_timeout)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        from: ContextAddr,
        to: ContextAddr,
        message: Message,
        reply_timeout: Duration,
    ) -> Result<Option<Value>, ScoutError> {
        let message_type = message.message_type();
        let tx = self
            .route(to)
            .ok_or(ScoutError::UnreachableTarget { target: to })?;

        let correlation_id = message_type
            .expects_reply()
            .then(|| self.next_correlation_id(from));
        let envelope = Envelope {
            message,
            correlation_id: correlation_id.clone(),
        };
        let wire = envelope.encode()?;

        if !message_type.expects_reply() {
            tx.send(Delivery {
                from,
                wire,
                responder: None,
            })
            .await
            .map_err(|_| ScoutError::UnreachableTarget { target: to })?;
            return Ok(None);
        }

        let (slot, reply_rx) = oneshot::channel();
        let responder = Responder::new(message_type, correlation_id.clone(), to, slot);
        if let Err(mpsc::error::SendError(delivery)) = tx
            .send(Delivery {
                from,
                wire,
                responder: Some(responder),
            })
            .await
        {
            if let Some(responder) = delivery.responder {
                responder.reject_unreachable();
            }
            return Err(ScoutError::UnreachableTarget { target: to });
        }

        debug!(%from, %to, %message_type, correlation_id = ?correlation_id, "Awaiting reply");
        match timeout(reply_timeout, reply_rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(ScoutError::ReplyDropped { message_type }),
            Err(_) => Err(ScoutError::Timeout {
                target: to,
                message_type,
                after_ms: reply_timeout.as_millis() as u64,
            }),
        }
    }

    /// Deliver `message` to every registered context matching `predicate`.
    /// Failures to reach one context never prevent delivery to the others.
    pub async fn broadcast(
        &self,
        from: ContextAddr,
        predicate: impl Fn(ContextAddr) -> bool,
        message: Message,
    ) -> BroadcastReport {
        // Includes addresses whose context died without unregistering; they
        // fail individually below.
        let mut targets: Vec<ContextAddr> = self.routes().keys().copied().collect();
        targets.sort();
        let targets: Vec<ContextAddr> = targets
            .into_iter()
            .filter(|addr| *addr != from && predicate(*addr))
            .collect();

        let sends = targets.iter().map(|to| {
            let message = message.clone();
            async move { (*to, self.send(from, *to, message).await) }
        });

        let mut report = BroadcastReport::default();
        for (to, result) in join_all(sends).await {
            match result {
                Ok(_) => report.delivered.push(to),
                Err(e) => {
                    debug!(%to, "Broadcast not delivered: {e}");
                    report.failed.push((to, e));
                }
            }
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

type Predicate = Box<dyn Fn(&Message) -> bool + Send>;
type Handler<S> = Box<dyn FnMut(&mut S, Incoming) + Send>;

struct Route<S> {
    name: &'static str,
    claims: Predicate,
    handle: Handler<S>,
}

/// Ordered message handlers for one context. The first route whose
/// predicate matches claims the message; later routes never see it.
pub struct Dispatcher<S> {
    context: ContextAddr,
    routes: Vec<Route<S>>,
}

impl<S> Dispatcher<S> {
    pub fn new(context: ContextAddr) -> Self {
        Dispatcher {
            context,
            routes: Vec::new(),
        }
    }

    /// Add a route claiming messages that satisfy `predicate`.
    pub fn on(
        mut self,
        name: &'static str,
        predicate: impl Fn(&Message) -> bool + Send + 'static,
        handler: impl FnMut(&mut S, Incoming) + Send + 'static,
    ) -> Self {
        self.routes.push(Route {
            name,
            claims: Box::new(predicate),
            handle: Box::new(handler),
        });
        self
    }

    /// Add a route claiming a single message type.
    pub fn on_type(
        self,
        name: &'static str,
        message_type: MessageType,
        handler: impl FnMut(&mut S, Incoming) + Send + 'static,
    ) -> Self {
        self.on(name, move |m| m.message_type() == message_type, handler)
    }

    /// Decode and route one delivery. Returns the name of the claiming
    /// route, or `None` if the envelope was rejected or nobody claimed it.
    /// Unclaimed requests are answered with an `{"error": ...}` reply.
    pub fn dispatch(&mut self, state: &mut S, delivery: Delivery) -> Option<&'static str> {
        let incoming = delivery.open()?;
        let message_type = incoming.message_type();

        match self.routes.iter_mut().find(|r| (r.claims)(incoming.message())) {
            Some(route) => {
                debug!(context = %self.context, from = %incoming.from, %message_type, route = route.name, "Dispatching");
                (route.handle)(state, incoming);
                Some(route.name)
            }
            None => {
                warn!(context = %self.context, %message_type, "No handler for message");
                incoming.reply(error_reply(ScoutError::UnknownMessageType {
                    type_name: message_type.to_string(),
                }));
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
