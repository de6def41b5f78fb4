//! Channel definitions: builder, blueprint, and registry.
//!
//! Each channel subtype declares its packet types and permanent handlers
//! exactly once, in `make_registry`, against an append-only
//! [`ChannelBuilder`]. The finished [`ChannelBlueprint`] is immutable; a
//! [`ChannelRegistry`] holds one blueprint per subtype and locks against
//! further registration the first time it is bound to a live connection.

use crate::channel::instance::{ChannelContext, ChannelInstance};
use crate::channel::packet::{AnyPacket, Packet};
use crate::connection::Connection;
use crate::error::{NetError, Result};
use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// A permanent packet handler. Returns `true` when it claims the packet,
/// which stops dispatch.
pub type PacketHandler = Arc<dyn Fn(&ChannelContext, &dyn AnyPacket) -> bool + Send + Sync>;

/// A channel subtype: a name plus a one-shot registration step.
///
/// The registry runs `make_registry` exactly once per subtype; a second
/// registration attempt is an error.
pub trait ChannelDef: Send + Sync + 'static {
    /// Stable channel name, used for logs and error messages.
    const NAME: &'static str;

    /// Append-only build phase: register packet types (in a fixed order —
    /// the order is the wire contract) and permanent handlers.
    fn make_registry(builder: &mut ChannelBuilder);
}

/// Append-only collector for one channel's definition.
pub struct ChannelBuilder {
    name: &'static str,
    templates: Vec<Box<dyn AnyPacket>>,
    template_types: Vec<TypeId>,
    handlers: Vec<PacketHandler>,
}

impl ChannelBuilder {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            templates: Vec::new(),
            template_types: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Register a packet type. Its position in registration order is its
    /// wire index within this channel.
    pub fn register_packet<P: Packet>(&mut self) -> &mut Self {
        let tid = TypeId::of::<P>();
        if self.template_types.contains(&tid) {
            // First registration wins; index resolution takes the first
            // matching template anyway.
            warn!(channel = self.name, "packet type registered twice, ignoring");
            return self;
        }
        self.templates.push(Box::new(P::default()));
        self.template_types.push(tid);
        self
    }

    /// Register a permanent handler. Handlers run in registration order.
    pub fn register_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&ChannelContext, &dyn AnyPacket) -> bool + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    fn build(self) -> ChannelBlueprint {
        debug!(
            channel = self.name,
            packets = self.templates.len(),
            handlers = self.handlers.len(),
            "channel blueprint built"
        );
        ChannelBlueprint {
            name: self.name,
            templates: self.templates,
            template_types: self.template_types,
            handlers: self.handlers,
        }
    }
}

/// Immutable channel definition shared by every connection that binds it.
pub struct ChannelBlueprint {
    name: &'static str,
    templates: Vec<Box<dyn AnyPacket>>,
    template_types: Vec<TypeId>,
    handlers: Vec<PacketHandler>,
}

impl ChannelBlueprint {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of packet types this channel defines.
    pub fn packet_count(&self) -> usize {
        self.templates.len()
    }

    pub(crate) fn template(&self, index: usize) -> Option<&dyn AnyPacket> {
        self.templates.get(index).map(|t| t.as_ref())
    }

    /// Local index of the first template whose concrete type matches.
    pub(crate) fn index_of(&self, tid: TypeId) -> Option<usize> {
        self.template_types.iter().position(|t| *t == tid)
    }

    pub(crate) fn handlers(&self) -> &[PacketHandler] {
        &self.handlers
    }
}

struct RegisteredChannel {
    def_type: TypeId,
    blueprint: Arc<ChannelBlueprint>,
}

/// Ordered collection of channel blueprints, one per subtype.
///
/// Channel order is part of the wire contract: the concatenation of every
/// channel's packet list, in registration order, forms the connection-wide
/// packet index space. Both peers must register the same channels in the
/// same order.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<Vec<RegisteredChannel>>,
    locked: AtomicBool,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `C::make_registry` and store the resulting blueprint.
    ///
    /// Fails if `C` was already registered, or if the registry has been
    /// locked by a bind to a live connection.
    pub fn register<C: ChannelDef>(&self) -> Result<()> {
        if self.locked.load(Ordering::Acquire) {
            return Err(NetError::RegistryLocked(format!(
                "cannot register channel '{}' after first bind",
                C::NAME
            )));
        }

        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if channels.iter().any(|c| c.def_type == TypeId::of::<C>()) {
            return Err(NetError::DuplicateChannel(C::NAME));
        }

        let mut builder = ChannelBuilder::new(C::NAME);
        C::make_registry(&mut builder);
        channels.push(RegisteredChannel {
            def_type: TypeId::of::<C>(),
            blueprint: Arc::new(builder.build()),
        });
        Ok(())
    }

    /// Look up the blueprint for a channel subtype.
    pub fn blueprint<C: ChannelDef>(&self) -> Result<Arc<ChannelBlueprint>> {
        let channels = self
            .channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .iter()
            .find(|c| c.def_type == TypeId::of::<C>())
            .map(|c| c.blueprint.clone())
            .ok_or(NetError::UnknownChannel(C::NAME))
    }

    /// Whether the registry has been locked by a bind.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Bind every registered channel to `conn`, assigning base indices in
    /// registration order. Locks the registry.
    pub(crate) fn bind(&self, conn: &Arc<Connection>) -> Vec<Arc<ChannelInstance>> {
        self.locked.store(true, Ordering::Release);

        let channels = self
            .channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut instances = Vec::with_capacity(channels.len());
        let mut base = 0i32;
        for rc in channels.iter() {
            instances.push(ChannelInstance::new(
                rc.def_type,
                rc.blueprint.clone(),
                base,
                Arc::downgrade(conn),
            ));
            base += rc.blueprint.packet_count() as i32;
        }
        instances
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::codec::{WireReader, WireWriter};
    use async_trait::async_trait;

    #[derive(Default)]
    struct Noop;

    #[async_trait]
    impl Packet for Noop {
        fn write(&self, _w: &mut WireWriter) -> Result<()> {
            Ok(())
        }

        async fn read(&mut self, _r: &mut WireReader<'_>) -> Result<()> {
            Ok(())
        }
    }

    struct TestChannel;

    impl ChannelDef for TestChannel {
        const NAME: &'static str = "test";

        fn make_registry(builder: &mut ChannelBuilder) {
            builder.register_packet::<Noop>();
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ChannelRegistry::new();
        registry.register::<TestChannel>().unwrap();
        assert!(matches!(
            registry.register::<TestChannel>(),
            Err(NetError::DuplicateChannel("test"))
        ));
    }

    #[test]
    fn missing_channel_lookup_fails() {
        let registry = ChannelRegistry::new();
        assert!(matches!(
            registry.blueprint::<TestChannel>(),
            Err(NetError::UnknownChannel("test"))
        ));
    }

    #[test]
    fn blueprint_resolves_packet_index() {
        let registry = ChannelRegistry::new();
        registry.register::<TestChannel>().unwrap();
        let bp = registry.blueprint::<TestChannel>().unwrap();
        assert_eq!(bp.index_of(TypeId::of::<Noop>()), Some(0));
        assert_eq!(bp.index_of(TypeId::of::<TestChannel>()), None);
    }
}
