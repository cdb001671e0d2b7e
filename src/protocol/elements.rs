//! Grid element configurations
//!
//! Each topology entity travels as a fixed 48-byte slot: a 2-byte element
//! type, a 2-byte id and variant specific fields, zero padded. The same
//! encoding is used for bulk transfer and for topology files.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::{get_name, put_name, DeviceType, ProtocolError, ProtocolResult};

/// Size of every encoded grid element config
pub const ELEMENT_SIZE: usize = 48;

/// Bytes taken by element type and id
const PREFIX_SIZE: usize = 4;

const DEVICE_NAME_MAX: usize = 23;
const SWITCHGEAR_NAME_MAX: usize = 19;
const SOURCE_NAME_MAX: usize = 36;

/// Tag stored in the first two bytes of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ElementType {
    Node = 1,
    Point = 2,
    Segment = 3,
    Converter = 4,
    Breaker = 5,
    FenSwitchgear = 6,
    Source = 7,
    SciBreakBreaker = 8,
}

impl ElementType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ElementType::Node),
            2 => Some(ElementType::Point),
            3 => Some(ElementType::Segment),
            4 => Some(ElementType::Converter),
            5 => Some(ElementType::Breaker),
            6 => Some(ElementType::FenSwitchgear),
            7 => Some(ElementType::Source),
            8 => Some(ElementType::SciBreakBreaker),
            _ => None,
        }
    }
}

/// Topology-only grouping of points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: u16,
    #[serde(default)]
    pub node_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointConfig {
    pub id: u16,
    pub node_id: u16,
    pub pos_x: u16,
    pub pos_y: u16,
}

/// Wire between two points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub id: u16,
    pub point1: u16,
    pub point2: u16,
}

/// Two-terminal network device (converter, breaker, SciBreak breaker)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: u16,
    pub point1: u16,
    pub point2: u16,
    /// Device specific configuration bits
    #[serde(default)]
    pub config: u16,
    pub port: u16,
    pub ip: Ipv4Addr,
    pub pos_x: u16,
    pub pos_y: u16,
    #[serde(default)]
    pub rotation: u16,
    #[serde(default)]
    pub name: String,
}

/// Four-terminal FEN switchgear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchgearConfig {
    pub id: u16,
    pub points: [u16; 4],
    pub port: u16,
    #[serde(default)]
    pub config: u16,
    pub ip: Ipv4Addr,
    pub pos_x: u16,
    pub pos_y: u16,
    #[serde(default)]
    pub rotation: u16,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: u16,
    pub point: u16,
    pub pos_x: u16,
    pub pos_y: u16,
    #[serde(default)]
    pub rotation: u16,
    #[serde(default)]
    pub name: String,
}

/// One topology entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GridElementConfig {
    Node(NodeConfig),
    Point(PointConfig),
    Segment(SegmentConfig),
    Converter(DeviceConfig),
    Breaker(DeviceConfig),
    FenSwitchgear(SwitchgearConfig),
    Source(SourceConfig),
    SciBreakBreaker(DeviceConfig),
}

impl GridElementConfig {
    pub fn element_type(&self) -> ElementType {
        match self {
            GridElementConfig::Node(_) => ElementType::Node,
            GridElementConfig::Point(_) => ElementType::Point,
            GridElementConfig::Segment(_) => ElementType::Segment,
            GridElementConfig::Converter(_) => ElementType::Converter,
            GridElementConfig::Breaker(_) => ElementType::Breaker,
            GridElementConfig::FenSwitchgear(_) => ElementType::FenSwitchgear,
            GridElementConfig::Source(_) => ElementType::Source,
            GridElementConfig::SciBreakBreaker(_) => ElementType::SciBreakBreaker,
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            GridElementConfig::Node(c) => c.id,
            GridElementConfig::Point(c) => c.id,
            GridElementConfig::Segment(c) => c.id,
            GridElementConfig::Converter(c)
            | GridElementConfig::Breaker(c)
            | GridElementConfig::SciBreakBreaker(c) => c.id,
            GridElementConfig::FenSwitchgear(c) => c.id,
            GridElementConfig::Source(c) => c.id,
        }
    }

    /// Device family addressed by commands, `None` for pure topology
    pub fn device_type(&self) -> Option<DeviceType> {
        match self {
            GridElementConfig::Converter(_) => Some(DeviceType::Converter),
            GridElementConfig::Breaker(_) => Some(DeviceType::Breaker),
            GridElementConfig::FenSwitchgear(_) => Some(DeviceType::FenSwitchgear),
            GridElementConfig::Source(_) => Some(DeviceType::Source),
            GridElementConfig::SciBreakBreaker(_) => Some(DeviceType::SciBreakBreaker),
            _ => None,
        }
    }

    /// Encode into exactly [`ELEMENT_SIZE`] bytes. Names longer than the
    /// variant allows are truncated without notice.
    pub fn encode(&self) -> [u8; ELEMENT_SIZE] {
        let mut buf = BytesMut::with_capacity(ELEMENT_SIZE);
        buf.put_u16_le(self.element_type() as u16);
        buf.put_u16_le(self.id());

        match self {
            GridElementConfig::Node(c) => {
                buf.put_u16_le(c.node_type);
                buf.put_u16_le(0);
            }
            GridElementConfig::Point(c) => {
                buf.put_u16_le(c.node_id);
                buf.put_u16_le(0);
                buf.put_u16_le(c.pos_x);
                buf.put_u16_le(c.pos_y);
            }
            GridElementConfig::Segment(c) => {
                buf.put_u16_le(c.point1);
                buf.put_u16_le(c.point2);
            }
            GridElementConfig::Converter(c) | GridElementConfig::SciBreakBreaker(c) => {
                put_device(&mut buf, c, false);
            }
            GridElementConfig::Breaker(c) => {
                put_device(&mut buf, c, true);
            }
            GridElementConfig::FenSwitchgear(c) => {
                for point in c.points {
                    buf.put_u16_le(point);
                }
                buf.put_u16_le(c.port);
                buf.put_u16_le(c.config);
                buf.put_u32_le(u32::from(c.ip));
                buf.put_u16_le(c.pos_x);
                buf.put_u16_le(c.pos_y);
                buf.put_u16_le(c.rotation);
                buf.put_u16_le(0);
                let remaining = ELEMENT_SIZE - buf.len();
                put_name(&mut buf, &c.name, SWITCHGEAR_NAME_MAX, remaining);
            }
            GridElementConfig::Source(c) => {
                buf.put_u16_le(c.point);
                buf.put_u16_le(c.pos_x);
                buf.put_u16_le(c.pos_y);
                buf.put_u16_le(c.rotation);
                let remaining = ELEMENT_SIZE - buf.len();
                put_name(&mut buf, &c.name, SOURCE_NAME_MAX, remaining);
            }
        }

        let mut slot = [0u8; ELEMENT_SIZE];
        slot[..buf.len()].copy_from_slice(&buf);
        slot
    }

    /// Decode one slot. Unknown element types yield `Ok(None)` so that
    /// newer server side element kinds can be skipped.
    pub fn decode_one(bytes: &[u8]) -> ProtocolResult<Option<Self>> {
        if bytes.len() < ELEMENT_SIZE {
            return Err(ProtocolError::TruncatedInput {
                needed: ELEMENT_SIZE,
                available: bytes.len(),
            });
        }

        let mut buf = &bytes[..ELEMENT_SIZE];
        let tag = buf.get_u16_le();
        let id = buf.get_u16_le();

        let Some(element_type) = ElementType::from_u16(tag) else {
            return Ok(None);
        };

        let config = match element_type {
            ElementType::Node => {
                let node_type = buf.get_u16_le();
                GridElementConfig::Node(NodeConfig { id, node_type })
            }
            ElementType::Point => {
                let node_id = buf.get_u16_le();
                buf.advance(2);
                GridElementConfig::Point(PointConfig {
                    id,
                    node_id,
                    pos_x: buf.get_u16_le(),
                    pos_y: buf.get_u16_le(),
                })
            }
            ElementType::Segment => GridElementConfig::Segment(SegmentConfig {
                id,
                point1: buf.get_u16_le(),
                point2: buf.get_u16_le(),
            }),
            ElementType::Converter => GridElementConfig::Converter(get_device(&mut buf, id, false)?),
            ElementType::Breaker => GridElementConfig::Breaker(get_device(&mut buf, id, true)?),
            ElementType::SciBreakBreaker => {
                GridElementConfig::SciBreakBreaker(get_device(&mut buf, id, false)?)
            }
            ElementType::FenSwitchgear => {
                let points = [
                    buf.get_u16_le(),
                    buf.get_u16_le(),
                    buf.get_u16_le(),
                    buf.get_u16_le(),
                ];
                let port = buf.get_u16_le();
                let config = buf.get_u16_le();
                let ip = Ipv4Addr::from(buf.get_u32_le());
                let pos_x = buf.get_u16_le();
                let pos_y = buf.get_u16_le();
                let rotation = buf.get_u16_le();
                buf.advance(2);
                let remaining = buf.len();
                GridElementConfig::FenSwitchgear(SwitchgearConfig {
                    id,
                    points,
                    port,
                    config,
                    ip,
                    pos_x,
                    pos_y,
                    rotation,
                    name: get_name(&mut buf, remaining)?,
                })
            }
            ElementType::Source => {
                let point = buf.get_u16_le();
                let pos_x = buf.get_u16_le();
                let pos_y = buf.get_u16_le();
                let rotation = buf.get_u16_le();
                let remaining = buf.len();
                GridElementConfig::Source(SourceConfig {
                    id,
                    point,
                    pos_x,
                    pos_y,
                    rotation,
                    name: get_name(&mut buf, remaining)?,
                })
            }
        };

        Ok(Some(config))
    }

    /// Decode `count` consecutive slots, skipping unknown element types
    pub fn decode_many(bytes: &[u8], count: usize) -> ProtocolResult<Vec<Self>> {
        let needed = count * ELEMENT_SIZE;
        if bytes.len() < needed {
            return Err(ProtocolError::TruncatedInput {
                needed,
                available: bytes.len(),
            });
        }

        let mut configs = Vec::with_capacity(count);
        for slot in bytes[..needed].chunks_exact(ELEMENT_SIZE) {
            match Self::decode_one(slot)? {
                Some(config) => configs.push(config),
                None => {
                    tracing::warn!(
                        "Skipping grid element with unknown type {:#06x}",
                        u16::from_le_bytes([slot[0], slot[1]])
                    );
                }
            }
        }
        Ok(configs)
    }
}

/// Converter and SciBreak breakers store `config` before `port`, plain
/// breakers the other way round.
fn put_device(buf: &mut BytesMut, c: &DeviceConfig, port_first: bool) {
    buf.put_u16_le(c.point1);
    buf.put_u16_le(c.point2);
    if port_first {
        buf.put_u16_le(c.port);
        buf.put_u16_le(c.config);
    } else {
        buf.put_u16_le(c.config);
        buf.put_u16_le(c.port);
    }
    buf.put_u32_le(u32::from(c.ip));
    buf.put_u16_le(c.pos_x);
    buf.put_u16_le(c.pos_y);
    buf.put_u16_le(c.rotation);
    buf.put_u16_le(0);
    let remaining = ELEMENT_SIZE - PREFIX_SIZE - 20;
    put_name(buf, &c.name, DEVICE_NAME_MAX, remaining);
}

fn get_device(buf: &mut &[u8], id: u16, port_first: bool) -> ProtocolResult<DeviceConfig> {
    let point1 = buf.get_u16_le();
    let point2 = buf.get_u16_le();
    let (port, config) = if port_first {
        let port = buf.get_u16_le();
        (port, buf.get_u16_le())
    } else {
        let config = buf.get_u16_le();
        (buf.get_u16_le(), config)
    };
    let ip = Ipv4Addr::from(buf.get_u32_le());
    let pos_x = buf.get_u16_le();
    let pos_y = buf.get_u16_le();
    let rotation = buf.get_u16_le();
    buf.advance(2);
    let remaining = buf.len();

    Ok(DeviceConfig {
        id,
        point1,
        point2,
        config,
        port,
        ip,
        pos_x,
        pos_y,
        rotation,
        name: get_name(buf, remaining)?,
    })
}
