//! Packet traits.
//!
//! Concrete packet types implement [`Packet`]: how to write their payload
//! and how to parse it back off the stream. The object-safe [`AnyPacket`]
//! layer is derived automatically and is what registries, dispatch, and
//! the wire actually work with.
//!
//! A channel registry holds one *template* instance per packet type. The
//! template is never sent; every inbound frame and outbound send works on
//! a fresh instance produced by [`AnyPacket::new_instance`].

use crate::codec::{WireReader, WireWriter};
use crate::error::Result;
use async_trait::async_trait;
use std::any::Any;

/// A typed, serializable message exchanged over a channel.
///
/// The `Default` bound is what makes a type usable as a registry template:
/// live instances start from `Default` and are filled by `read`.
#[async_trait]
pub trait Packet: Default + Send + Sync + 'static {
    /// Serialize the payload fields. The registry index is written by the
    /// connection, not the packet.
    fn write(&self, w: &mut WireWriter) -> Result<()>;

    /// Parse the payload fields from the stream, in the same order
    /// `write` produced them.
    async fn read(&mut self, r: &mut WireReader<'_>) -> Result<()>;
}

/// Object-safe view of a [`Packet`], implemented for every packet type.
#[async_trait]
pub trait AnyPacket: Send + Sync + 'static {
    fn write(&self, w: &mut WireWriter) -> Result<()>;

    async fn read(&mut self, r: &mut WireReader<'_>) -> Result<()>;

    /// Template factory: a fresh default instance of the concrete type.
    fn new_instance(&self) -> Box<dyn AnyPacket>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

#[async_trait]
impl<T: Packet> AnyPacket for T {
    fn write(&self, w: &mut WireWriter) -> Result<()> {
        Packet::write(self, w)
    }

    async fn read(&mut self, r: &mut WireReader<'_>) -> Result<()> {
        Packet::read(self, r).await
    }

    fn new_instance(&self) -> Box<dyn AnyPacket> {
        Box::new(T::default())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl dyn AnyPacket {
    /// Whether the packet's concrete type is `T`.
    pub fn is<T: Packet>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Borrow the packet as its concrete type.
    pub fn downcast_ref<T: Packet>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow the packet as its concrete type.
    pub fn downcast_mut<T: Packet>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[derive(Default, Debug, PartialEq)]
    struct Ping {
        seq: i32,
    }

    #[async_trait]
    impl Packet for Ping {
        fn write(&self, w: &mut WireWriter) -> Result<()> {
            w.write_i32(self.seq)
        }

        async fn read(&mut self, r: &mut WireReader<'_>) -> Result<()> {
            self.seq = r.read_i32().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn template_produces_fresh_instances() {
        let template: Box<dyn AnyPacket> = Box::new(Ping { seq: 99 });
        let mut live = template.new_instance();

        // A new instance starts from Default, not from the template state.
        assert_eq!(live.downcast_ref::<Ping>().unwrap().seq, 0);

        let mut w = WireWriter::new();
        AnyPacket::write(&*template, &mut w).unwrap();
        let frame = w.into_bytes();
        let mut src: &[u8] = &frame;
        let mut r = WireReader::new(&mut src);
        live.read(&mut r).await.unwrap();

        assert_eq!(live.downcast_ref::<Ping>().unwrap().seq, 99);
    }
}
