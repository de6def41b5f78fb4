//! Per-connection channel state and dispatch.
//!
//! A [`ChannelInstance`] is the live binding of one blueprint to one
//! connection. It copies the definition's handler list at bind time and
//! owns its own one-shot waiter list, so runtime registrations on one
//! connection never leak into another.

use crate::channel::blueprint::{ChannelBlueprint, PacketHandler};
use crate::channel::packet::{AnyPacket, Packet};
use crate::connection::Connection;
use crate::error::{NetError, Result};
use crate::utils::metrics;
use std::any::TypeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, trace};

/// Handler invocation context: the connection the packet arrived on and
/// the channel instance that dispatched it.
pub struct ChannelContext {
    pub connection: Arc<Connection>,
    pub channel: Arc<ChannelInstance>,
}

impl ChannelContext {
    /// Queue a reply on this channel from inside a synchronous handler.
    ///
    /// Send failures are logged; a dead connection is already being torn
    /// down by its read loop.
    pub fn reply(&self, packet: Box<dyn AnyPacket>) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.send_boxed(&*packet).await {
                trace!(channel = channel.name(), error = %e, "reply dropped");
            }
        });
    }
}

type WaiterPredicate = Box<dyn Fn(&dyn AnyPacket) -> bool + Send + Sync>;

struct ResponseWaiter {
    id: u64,
    expected: TypeId,
    predicate: Option<WaiterPredicate>,
    tx: oneshot::Sender<Box<dyn AnyPacket>>,
}

/// One channel bound to one connection.
pub struct ChannelInstance {
    def_type: TypeId,
    blueprint: Arc<ChannelBlueprint>,
    base_index: i32,
    /// Seeded from the blueprint at bind time; runtime additions are local
    /// to this connection.
    handlers: RwLock<Vec<PacketHandler>>,
    /// One-shot response waiters, consulted before permanent handlers.
    waiters: Mutex<Vec<ResponseWaiter>>,
    next_waiter_id: AtomicU64,
    connection: Weak<Connection>,
}

impl ChannelInstance {
    pub(crate) fn new(
        def_type: TypeId,
        blueprint: Arc<ChannelBlueprint>,
        base_index: i32,
        connection: Weak<Connection>,
    ) -> Arc<Self> {
        let handlers = blueprint.handlers().to_vec();
        Arc::new(Self {
            def_type,
            blueprint,
            base_index,
            handlers: RwLock::new(handlers),
            waiters: Mutex::new(Vec::new()),
            next_waiter_id: AtomicU64::new(1),
            connection,
        })
    }

    pub fn name(&self) -> &'static str {
        self.blueprint.name()
    }

    pub(crate) fn def_type(&self) -> TypeId {
        self.def_type
    }

    pub(crate) fn base_index(&self) -> i32 {
        self.base_index
    }

    pub(crate) fn packet_count(&self) -> usize {
        self.blueprint.packet_count()
    }

    /// The connection this instance is bound to, if it is still alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    /// Fresh live instance of the template at `local_index`.
    pub(crate) fn instantiate(&self, local_index: usize) -> Option<Box<dyn AnyPacket>> {
        self.blueprint.template(local_index).map(|t| t.new_instance())
    }

    /// Add a permanent handler on this instance only.
    pub fn register_handler<F>(&self, handler: F)
    where
        F: Fn(&ChannelContext, &dyn AnyPacket) -> bool + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Fire-and-forget send. The packet index is resolved by runtime type
    /// against the template list.
    pub async fn send_packet<P: Packet>(&self, packet: &P) -> Result<()> {
        self.send_boxed(packet).await
    }

    /// Send a packet held behind the object-safe trait.
    pub async fn send_boxed(&self, packet: &dyn AnyPacket) -> Result<()> {
        let local = self
            .blueprint
            .index_of(packet.as_any().type_id())
            .ok_or(NetError::UnregisteredPacket(self.blueprint.name()))?;
        let conn = self.connection().ok_or(NetError::ConnectionClosed)?;
        conn.send_frame(self.base_index + local as i32, packet).await
    }

    /// Send `packet` and wait for the next inbound packet of type `R`.
    ///
    /// `timeout_ms < 0` waits indefinitely. The wait ends on the first
    /// matching response, on timeout (the waiter is removed and
    /// [`NetError::Timeout`] returned), or when the connection drops
    /// ([`NetError::ConnectionLost`], distinguishable by contract).
    ///
    /// Responses are matched by type, not by request ID: callers issuing
    /// concurrent requests of the same response type on one channel must
    /// correlate at the application level.
    pub async fn send_and_wait<P: Packet, R: Packet>(
        &self,
        packet: &P,
        timeout_ms: i64,
    ) -> Result<R> {
        self.send_and_wait_matching(packet, timeout_ms, None::<fn(&R) -> bool>)
            .await
    }

    /// As [`send_and_wait`](Self::send_and_wait), with an extra validity
    /// predicate on candidate responses.
    pub async fn send_and_wait_matching<P: Packet, R: Packet, F>(
        &self,
        packet: &P,
        timeout_ms: i64,
        predicate: Option<F>,
    ) -> Result<R>
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        let conn = self.connection().ok_or(NetError::ConnectionClosed)?;
        if !conn.is_connected() {
            return Err(NetError::ConnectionClosed);
        }

        // Register the waiter before sending so a fast peer cannot race
        // the response past us.
        let (tx, mut rx) = oneshot::channel();
        let erased: Option<WaiterPredicate> = predicate.map(|p| {
            Box::new(move |pkt: &dyn AnyPacket| pkt.downcast_ref::<R>().is_some_and(&p))
                as WaiterPredicate
        });
        let waiter_id = self.add_waiter(TypeId::of::<R>(), erased, tx);

        if let Err(e) = self.send_boxed(packet).await {
            self.remove_waiter(waiter_id);
            return Err(e);
        }

        let mut liveness = conn.watch_connected();
        let timeout = async {
            if timeout_ms < 0 {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(Duration::from_millis(timeout_ms as u64)).await;
            }
        };
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                res = &mut rx => {
                    return match res {
                        Ok(pkt) => downcast_response::<R>(pkt),
                        // Sender dropped without a packet: the instance is
                        // being torn down with its connection.
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
                    // The response may have landed between expiry and removal.
                    if let Ok(pkt) = rx.try_recv() {
                        return downcast_response::<R>(pkt);
                    }
                    metrics::global().response_timeout();
                    return Err(NetError::Timeout);
                }
            }
        }
    }

    fn add_waiter(
        &self,
        expected: TypeId,
        predicate: Option<WaiterPredicate>,
        tx: oneshot::Sender<Box<dyn AnyPacket>>,
    ) -> u64 {
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(ResponseWaiter {
                id,
                expected,
                predicate,
                tx,
            });
        id
    }

    fn remove_waiter(&self, id: u64) {
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|w| w.id != id);
    }

    /// Number of pending one-shot waiters (visible for isolation checks).
    pub fn pending_waiters(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Number of permanent handlers currently registered.
    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Route one inbound packet: one-shot waiters first (registration
    /// order, first match removed), then permanent handlers
    /// (registration order, first `true` stops), then the unhandled path.
    pub(crate) fn dispatch(self: &Arc<Self>, conn: &Arc<Connection>, packet: Box<dyn AnyPacket>) {
        let mut packet = packet;

        // One-shot response waiters.
        loop {
            let waiter = {
                let mut waiters = self
                    .waiters
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let tid = packet.as_any().type_id();
                let pos = waiters.iter().position(|w| {
                    w.expected == tid && w.predicate.as_ref().map_or(true, |p| p(&*packet))
                });
                pos.map(|i| waiters.remove(i))
            };
            match waiter {
                Some(w) => match w.tx.send(packet) {
                    Ok(()) => return,
                    // Receiver already gone (timed out concurrently): the
                    // waiter is spent, keep scanning with the packet back.
                    Err(returned) => packet = returned,
                },
                None => break,
            }
        }

        // Permanent handlers, against a snapshot: registrations made
        // during dispatch do not join the in-flight iteration, and
        // removals cannot invalidate it.
        let snapshot: Vec<PacketHandler> = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let ctx = ChannelContext {
            connection: conn.clone(),
            channel: self.clone(),
        };
        for handler in &snapshot {
            if handler(&ctx, &*packet) {
                return;
            }
        }

        metrics::global().unhandled_frame();
        if conn.debug_mode() {
            error!(channel = self.name(), "no handler claimed inbound packet");
        } else {
            trace!(channel = self.name(), "unhandled inbound packet dropped");
        }
    }
}

fn downcast_response<R: Packet>(pkt: Box<dyn AnyPacket>) -> Result<R> {
    pkt.into_any()
        .downcast::<R>()
        .map(|b| *b)
        .map_err(|_| NetError::Decode("response waiter delivered wrong packet type".into()))
}
