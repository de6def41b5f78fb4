//! The messenger itself: registry, handlers, and request/response.

use crate::channel::instance::{ChannelContext, ChannelInstance};
use crate::error::{NetError, Result};
use crate::messenger::message::{ComponentMessagePacket, DebugHeaders, WireMessage};
use crate::codec::Value;
use crate::utils::metrics;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

/// Where a messenger lives: the addressing tuple carried by every packet
/// it sends, and matched against every packet it receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessengerCoordinates {
    pub scene_path: String,
    pub room: String,
    pub object_id: String,
    pub component_index: i32,
}

type DecodeFn = Arc<dyn Fn(&Value) -> Result<Box<dyn Any + Send>> + Send + Sync>;
type TypedHandler = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type DefaultHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;
type WaiterPredicate = Box<dyn Fn(&dyn Any) -> bool + Send + Sync>;

#[derive(Clone)]
struct MessageEntry {
    id: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
}

enum WaiterSink {
    Oneshot(oneshot::Sender<Box<dyn Any + Send>>),
    Callback(Box<dyn FnOnce(Box<dyn Any + Send>) + Send>),
}

struct MessageWaiter {
    id: u64,
    expected: TypeId,
    predicate: Option<WaiterPredicate>,
    sink: WaiterSink,
}

/// Per-object, per-room message router bound to one channel instance.
pub struct ComponentMessenger {
    coords: MessengerCoordinates,
    /// Local component type name, advertised in debug headers.
    component_type: String,
    debug_mode: bool,
    channel: Arc<ChannelInstance>,
    registry: RwLock<Vec<MessageEntry>>,
    typed_handlers: RwLock<HashMap<TypeId, Vec<TypedHandler>>>,
    default_handler: RwLock<Option<DefaultHandler>>,
    waiters: Mutex<Vec<MessageWaiter>>,
    next_waiter_id: AtomicU64,
}

impl ComponentMessenger {
    pub fn new(
        channel: Arc<ChannelInstance>,
        coords: MessengerCoordinates,
        component_type: impl Into<String>,
        debug_mode: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            coords,
            component_type: component_type.into(),
            debug_mode,
            channel,
            registry: RwLock::new(Vec::new()),
            typed_handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
            waiters: Mutex::new(Vec::new()),
            next_waiter_id: AtomicU64::new(1),
        })
    }

    pub fn coordinates(&self) -> &MessengerCoordinates {
        &self.coords
    }

    /// Register a message kind. Position in registration order is the
    /// wire index; a duplicate string ID is rejected.
    pub fn register<M: WireMessage>(&self) -> Result<()> {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if registry.iter().any(|e| e.id == M::message_id()) {
            return Err(NetError::DuplicateMessage(M::message_id().to_string()));
        }
        registry.push(MessageEntry {
            id: M::message_id(),
            type_id: TypeId::of::<M>(),
            decode: Arc::new(|v| M::decode(v).map(|m| Box::new(m) as Box<dyn Any + Send>)),
        });
        Ok(())
    }

    /// Registered message IDs in wire order.
    pub fn registered_ids(&self) -> Vec<&'static str> {
        self.registry
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|e| e.id)
            .collect()
    }

    /// Register a typed handler for inbound messages of kind `M`.
    pub fn on<M: WireMessage>(&self, handler: impl Fn(&M) + Send + Sync + 'static) {
        let erased: TypedHandler = Arc::new(move |any| {
            if let Some(m) = any.downcast_ref::<M>() {
                handler(m);
            }
        });
        self.typed_handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(TypeId::of::<M>())
            .or_default()
            .push(erased);
    }

    /// Install the catch-all handler, invoked with `(message_id, payload)`
    /// for every inbound message. Replaces any previous catch-all.
    pub fn on_default(&self, handler: impl Fn(&str, &Value) + Send + Sync + 'static) {
        *self
            .default_handler
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Start receiving: hook this messenger into its channel. Packets not
    /// addressed to these coordinates pass through untouched.
    pub fn attach(self: &Arc<Self>) {
        let me = self.clone();
        self.channel.register_handler(move |ctx, pkt| {
            match pkt.downcast_ref::<ComponentMessagePacket>() {
                Some(p) if me.matches(p) => me.handle_incoming(ctx, p),
                _ => false,
            }
        });
    }

    fn matches(&self, pkt: &ComponentMessagePacket) -> bool {
        pkt.scene_path == self.coords.scene_path
            && pkt.room == self.coords.room
            && pkt.object_id == self.coords.object_id
            && pkt.component_index == self.coords.component_index
    }

    /// Fire-and-forget send. Fails if `M` was never registered here.
    pub async fn send_message<M: WireMessage>(&self, msg: &M) -> Result<()> {
        let pkt = self.build_packet(msg)?;
        self.channel.send_packet(&pkt).await
    }

    /// Send `msg` and wait for the next inbound message of kind `Resp`.
    ///
    /// `timeout_secs < 0` waits indefinitely. Ends on match, timeout
    /// ([`NetError::Timeout`]), or connection loss
    /// ([`NetError::ConnectionLost`]) — the liveness check runs for the
    /// whole wait, not just at its start.
    pub async fn send_request<Req: WireMessage, Resp: WireMessage>(
        &self,
        msg: &Req,
        timeout_secs: f64,
    ) -> Result<Resp> {
        self.send_request_matching(msg, timeout_secs, None::<fn(&Resp) -> bool>)
            .await
    }

    /// As [`send_request`](Self::send_request), with a caller-supplied
    /// validity predicate on candidate responses.
    pub async fn send_request_matching<Req, Resp, F>(
        &self,
        msg: &Req,
        timeout_secs: f64,
        predicate: Option<F>,
    ) -> Result<Resp>
    where
        Req: WireMessage,
        Resp: WireMessage,
        F: Fn(&Resp) -> bool + Send + Sync + 'static,
    {
        let conn = self.channel.connection().ok_or(NetError::ConnectionClosed)?;
        if !conn.is_connected() {
            return Err(NetError::ConnectionClosed);
        }

        let (tx, mut rx) = oneshot::channel();
        let waiter_id = self.add_waiter::<Resp>(predicate, WaiterSink::Oneshot(tx));

        if let Err(e) = self.send_message(msg).await {
            self.remove_waiter(waiter_id);
            return Err(e);
        }

        let mut liveness = conn.watch_connected();
        let timeout = async {
            if timeout_secs < 0.0 {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(Duration::from_secs_f64(timeout_secs)).await;
            }
        };
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                res = &mut rx => {
                    return match res {
                        Ok(any) => downcast_message::<Resp>(any),
                        Err(_) => Err(NetError::ConnectionLost),
                    };
                }
                changed = liveness.changed() => {
                    if changed.is_err() || !*liveness.borrow() {
                        self.remove_waiter(waiter_id);
                        return Err(NetError::ConnectionLost);
                    }
                }
                _ = &mut timeout => {
                    self.remove_waiter(waiter_id);
                    if let Ok(any) = rx.try_recv() {
                        return downcast_message::<Resp>(any);
                    }
                    metrics::global().response_timeout();
                    return Err(NetError::Timeout);
                }
            }
        }
    }

    /// Asynchronous request variant: attach a one-shot response handler,
    /// send, and return immediately. The handler runs if and when a
    /// matching response arrives.
    pub async fn send_request_callback<Req, Resp, F, H>(
        &self,
        msg: &Req,
        predicate: Option<F>,
        handler: H,
    ) -> Result<()>
    where
        Req: WireMessage,
        Resp: WireMessage,
        F: Fn(&Resp) -> bool + Send + Sync + 'static,
        H: FnOnce(Resp) + Send + 'static,
    {
        let sink = WaiterSink::Callback(Box::new(move |any: Box<dyn Any + Send>| {
            if let Ok(m) = any.downcast::<Resp>() {
                handler(*m);
            }
        }));
        let waiter_id = self.add_waiter::<Resp>(predicate, sink);

        if let Err(e) = self.send_message(msg).await {
            self.remove_waiter(waiter_id);
            return Err(e);
        }
        Ok(())
    }

    /// Number of pending one-shot response waiters.
    pub fn pending_responses(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn build_packet<M: WireMessage>(&self, msg: &M) -> Result<ComponentMessagePacket> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let index = registry
            .iter()
            .position(|e| e.type_id == TypeId::of::<M>())
            .ok_or_else(|| NetError::UnregisteredMessage(M::message_id().to_string()))?;

        let debug_headers = self.debug_mode.then(|| DebugHeaders {
            remote_component_type: self.component_type.clone(),
            registry: registry
                .iter()
                .enumerate()
                .map(|(i, e)| (e.id.to_string(), i as i32))
                .collect(),
        });

        Ok(ComponentMessagePacket {
            scene_path: self.coords.scene_path.clone(),
            room: self.coords.room.clone(),
            object_id: self.coords.object_id.clone(),
            component_index: self.coords.component_index,
            debug: debug_headers,
            message_index: index as i32,
            payload: msg.encode(),
        })
    }

    fn add_waiter<Resp: WireMessage>(
        &self,
        predicate: Option<impl Fn(&Resp) -> bool + Send + Sync + 'static>,
        sink: WaiterSink,
    ) -> u64 {
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let erased: Option<WaiterPredicate> = predicate.map(|p| {
            Box::new(move |any: &dyn Any| any.downcast_ref::<Resp>().is_some_and(&p))
                as WaiterPredicate
        });
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(MessageWaiter {
                id,
                expected: TypeId::of::<Resp>(),
                predicate: erased,
                sink,
            });
        id
    }

    fn remove_waiter(&self, id: u64) {
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|w| w.id != id);
    }

    /// Validate the sender's registry snapshot against ours: count first,
    /// then per-index identity. Either failing means the peers' message
    /// registration order has drifted and positional routing is unsafe.
    pub fn validate_registry(&self, headers: &DebugHeaders) -> Result<()> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if registry.len() != headers.registry.len() {
            return Err(NetError::ProtocolDesync(format!(
                "message registry count mismatch: local {} vs remote {} (remote component '{}')",
                registry.len(),
                headers.registry.len(),
                headers.remote_component_type,
            )));
        }

        for (i, (remote_id, remote_index)) in headers.registry.iter().enumerate() {
            let local = &registry[i];
            if local.id != remote_id || *remote_index != i as i32 {
                return Err(NetError::ProtocolDesync(format!(
                    "message registry identity mismatch at index {i}: local '{}' vs remote '{}'",
                    local.id, remote_id,
                )));
            }
        }
        Ok(())
    }

    /// Route one inbound packet addressed to this messenger. Returns
    /// whether the packet was consumed.
    fn handle_incoming(&self, ctx: &ChannelContext, pkt: &ComponentMessagePacket) -> bool {
        if let Some(headers) = &pkt.debug {
            if let Err(e) = self.validate_registry(headers) {
                metrics::global().desync_error();
                if self.debug_mode {
                    error!(error = %e, "registry desync in debug mode, closing connection");
                    let conn = ctx.connection.clone();
                    let disconnect = e.to_disconnect();
                    tokio::spawn(async move { conn.close(disconnect).await });
                    return true;
                }
                error!(error = %e, "registry desync, dropping message");
                return false;
            }
        }

        let entry = {
            let registry = self
                .registry
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            usize::try_from(pkt.message_index)
                .ok()
                .and_then(|i| registry.get(i).cloned())
        };
        let Some(entry) = entry else {
            metrics::global().desync_error();
            warn!(
                index = pkt.message_index,
                object_id = %self.coords.object_id,
                "inbound message index outside local registry"
            );
            return false;
        };

        let decoded = match (entry.decode)(&pkt.payload) {
            Ok(d) => d,
            Err(e) => {
                error!(message = entry.id, error = %e, "message payload decode failed");
                return true;
            }
        };

        // Typed handlers for the runtime type.
        let typed: Vec<TypedHandler> = self
            .typed_handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&entry.type_id)
            .cloned()
            .unwrap_or_default();
        for handler in &typed {
            handler(&*decoded);
        }

        // Catch-all.
        let catch_all = self
            .default_handler
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(handler) = &catch_all {
            handler(entry.id, &pkt.payload);
        }

        // One-shot response waiters, first match removed.
        let mut decoded = Some(decoded);
        while let Some(boxed) = decoded.take() {
            let waiter = {
                let mut waiters = self
                    .waiters
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let pos = waiters.iter().position(|w| {
                    w.expected == entry.type_id
                        && w.predicate.as_ref().map_or(true, |p| p(&*boxed))
                });
                pos.map(|i| waiters.remove(i))
            };
            match waiter {
                Some(w) => match w.sink {
                    WaiterSink::Oneshot(tx) => match tx.send(boxed) {
                        Ok(()) => {}
                        // Receiver timed out concurrently; keep scanning.
                        Err(returned) => decoded = Some(returned),
                    },
                    WaiterSink::Callback(f) => f(boxed),
                },
                None => break,
            }
        }

        trace!(message = entry.id, "messenger handled inbound message");
        true
    }
}

fn downcast_message<M: WireMessage>(any: Box<dyn Any + Send>) -> Result<M> {
    any.downcast::<M>()
        .map(|b| *b)
        .map_err(|_| NetError::Decode("response waiter delivered wrong message type".into()))
}
