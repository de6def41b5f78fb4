//! Messenger wire types: the message codec trait and the carrier packet.

use crate::channel::blueprint::{ChannelBuilder, ChannelDef};
use crate::channel::packet::Packet;
use crate::codec::{Value, WireReader, WireWriter};
use crate::error::{NetError, Result};
use async_trait::async_trait;

/// Upper bound on a debug registry snapshot; anything larger is a
/// corrupt or hostile header.
const MAX_REGISTRY_SNAPSHOT: i32 = 10_000;

/// A message exchanged through a [`ComponentMessenger`].
///
/// Messages flatten themselves to a tagged [`Value`] (conventionally a
/// map) and back; the messenger handles addressing and transport.
///
/// [`ComponentMessenger`]: crate::messenger::ComponentMessenger
pub trait WireMessage: Send + Sync + 'static {
    /// Stable string ID. Uniqueness is enforced per messenger at
    /// registration time.
    fn message_id() -> &'static str
    where
        Self: Sized;

    /// Flatten to a tagged value.
    fn encode(&self) -> Value;

    /// Rebuild from a tagged value.
    fn decode(value: &Value) -> Result<Self>
    where
        Self: Sized;
}

/// Debug headers attached to outbound messages in debug mode: the
/// expected remote component type plus a full `(id, index)` registry
/// snapshot for desync detection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugHeaders {
    pub remote_component_type: String,
    pub registry: Vec<(String, i32)>,
}

/// The carrier packet for all messenger traffic.
///
/// Wire order: scene path, room, object ID, component index, debug flag
/// (and headers when set), message index, payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentMessagePacket {
    pub scene_path: String,
    pub room: String,
    pub object_id: String,
    pub component_index: i32,
    pub debug: Option<DebugHeaders>,
    /// Positional index into the receiving messenger's registry.
    pub message_index: i32,
    pub payload: Value,
}

impl Default for ComponentMessagePacket {
    fn default() -> Self {
        Self {
            scene_path: String::new(),
            room: String::new(),
            object_id: String::new(),
            component_index: 0,
            debug: None,
            message_index: 0,
            payload: Value::Null,
        }
    }
}

#[async_trait]
impl Packet for ComponentMessagePacket {
    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_string(&self.scene_path)?;
        w.write_string(&self.room)?;
        w.write_string(&self.object_id)?;
        w.write_i32(self.component_index)?;
        match &self.debug {
            Some(d) => {
                w.write_bool(true)?;
                w.write_string(&d.remote_component_type)?;
                w.write_i32(d.registry.len() as i32)?;
                for (id, index) in &d.registry {
                    w.write_string(id)?;
                    w.write_i32(*index)?;
                }
            }
            None => w.write_bool(false)?,
        }
        w.write_i32(self.message_index)?;
        self.payload.write(w)
    }

    async fn read(&mut self, r: &mut WireReader<'_>) -> Result<()> {
        self.scene_path = r.read_string().await?;
        self.room = r.read_string().await?;
        self.object_id = r.read_string().await?;
        self.component_index = r.read_i32().await?;

        self.debug = if r.read_bool().await? {
            let remote_component_type = r.read_string().await?;
            let count = r.read_i32().await?;
            if !(0..=MAX_REGISTRY_SNAPSHOT).contains(&count) {
                return Err(NetError::Decode(format!(
                    "bad registry snapshot count {count}"
                )));
            }
            let mut registry = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let id = r.read_string().await?;
                let index = r.read_i32().await?;
                registry.push((id, index));
            }
            Some(DebugHeaders {
                remote_component_type,
                registry,
            })
        } else {
            None
        };

        self.message_index = r.read_i32().await?;
        self.payload = Value::read(r).await?;
        Ok(())
    }
}

/// The channel every messenger rides on. Register this on both peers'
/// channel registries.
pub struct ComponentMessageChannel;

impl ChannelDef for ComponentMessageChannel {
    const NAME: &'static str = "component_messages";

    fn make_registry(builder: &mut ChannelBuilder) {
        builder.register_packet::<ComponentMessagePacket>();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::channel::packet::AnyPacket;

    async fn roundtrip(pkt: &ComponentMessagePacket) -> ComponentMessagePacket {
        let mut w = WireWriter::new();
        Packet::write(pkt, &mut w).unwrap();
        let frame = w.into_bytes();
        let mut src: &[u8] = &frame;
        let mut r = WireReader::new(&mut src);
        let mut out = ComponentMessagePacket::default();
        Packet::read(&mut out, &mut r).await.unwrap();
        out
    }

    #[tokio::test]
    async fn packet_roundtrip_without_debug() {
        let pkt = ComponentMessagePacket {
            scene_path: "scenes/arena".into(),
            room: "room-1".into(),
            object_id: "obj-42".into(),
            component_index: 3,
            debug: None,
            message_index: 2,
            payload: [("x".to_string(), Value::F32(1.5))].into_iter().collect(),
        };
        assert_eq!(roundtrip(&pkt).await, pkt);
    }

    #[tokio::test]
    async fn packet_roundtrip_with_debug_headers() {
        let pkt = ComponentMessagePacket {
            scene_path: "scenes/arena".into(),
            room: "room-1".into(),
            object_id: "obj-42".into(),
            component_index: 0,
            debug: Some(DebugHeaders {
                remote_component_type: "HealthSync".into(),
                registry: vec![("damage".into(), 0), ("heal".into(), 1)],
            }),
            message_index: 1,
            payload: Value::Null,
        };
        assert_eq!(roundtrip(&pkt).await, pkt);
    }

    #[test]
    fn template_instance_starts_empty() {
        let template: Box<dyn AnyPacket> = Box::new(ComponentMessagePacket {
            room: "occupied".into(),
            ..Default::default()
        });
        let live = template.new_instance();
        let live = live.downcast_ref::<ComponentMessagePacket>().unwrap();
        assert!(live.room.is_empty());
    }
}
