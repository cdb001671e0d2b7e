//! Frame headers and tag fields
//!
//! Headers are layered: the generic [`Header`] is embedded by value in every
//! extended header. The extension can only be decoded once the generic tags
//! are known.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::{ProtocolError, ProtocolResult, WireSegment};

/// Kind of frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    IsAlive = 0x00,
    Command = 0x01,
    DeviceData = 0x11,
    Respond = 0x81,
    Error = 0x82,
}

impl PacketType {
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0x00 => Ok(PacketType::IsAlive),
            0x01 => Ok(PacketType::Command),
            0x11 => Ok(PacketType::DeviceData),
            0x81 => Ok(PacketType::Respond),
            0x82 => Ok(PacketType::Error),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// Device family a frame is addressed to or originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceType {
    None = 0x00,
    Server = 0x01,
    Grid = 0x02,
    Source = 0x11,
    Converter = 0x41,
    Breaker = 0x42,
    FenSwitchgear = 0xC1,
    SciBreakBreaker = 0xC2,
}

impl DeviceType {
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0x00 => Ok(DeviceType::None),
            0x01 => Ok(DeviceType::Server),
            0x02 => Ok(DeviceType::Grid),
            0x11 => Ok(DeviceType::Source),
            0x41 => Ok(DeviceType::Converter),
            0x42 => Ok(DeviceType::Breaker),
            0xC1 => Ok(DeviceType::FenSwitchgear),
            0xC2 => Ok(DeviceType::SciBreakBreaker),
            other => Err(ProtocolError::UnknownDeviceType(other)),
        }
    }

    /// Parse a lowercase device name as used on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "server" => Some(DeviceType::Server),
            "grid" => Some(DeviceType::Grid),
            "source" => Some(DeviceType::Source),
            "converter" => Some(DeviceType::Converter),
            "breaker" => Some(DeviceType::Breaker),
            "fenswitchgear" | "switchgear" => Some(DeviceType::FenSwitchgear),
            "scibreakbreaker" | "scibreak" => Some(DeviceType::SciBreakBreaker),
            _ => None,
        }
    }
}

/// The three tags a frame is dispatched on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tags {
    pub packet_type: PacketType,
    pub device_type: DeviceType,
    /// Command code for commands, result code for replies, zero otherwise
    pub code: u32,
}

/// Common behaviour of all frame headers
pub trait FrameHeader: WireSegment {
    /// Bytes this header adds on top of the generic header
    const EXTENSION_SIZE: usize;

    fn base(&self) -> &Header;

    fn base_mut(&mut self) -> &mut Header;

    /// Command or result code carried by the extension
    fn code(&self) -> u32 {
        0
    }

    fn tags(&self) -> Tags {
        Tags {
            packet_type: self.base().packet_type,
            device_type: self.base().device_type,
            code: self.code(),
        }
    }
}

/// Generic 8-byte header present on every frame
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub packet_type: PacketType,
    pub device_type: DeviceType,
    pub device_id: u16,
    /// Total frame length in bytes, header included
    pub length: u16,
    /// Assigned by the server, not part of equality
    pub connection_id: u16,
}

impl Header {
    pub fn new(packet_type: PacketType, device_type: DeviceType, device_id: u16) -> Self {
        Self {
            packet_type,
            device_type,
            device_id,
            length: 0,
            connection_id: 0,
        }
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.packet_type == other.packet_type
            && self.device_type == other.device_type
            && self.device_id == other.device_id
            && self.length == other.length
    }
}

impl Eq for Header {}

impl WireSegment for Header {
    const SIZE: usize = 8;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.device_type as u8);
        buf.put_u16_le(self.device_id);
        buf.put_u16_le(self.length);
        buf.put_u16_le(self.connection_id);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            packet_type: PacketType::from_u8(buf.get_u8())?,
            device_type: DeviceType::from_u8(buf.get_u8())?,
            device_id: buf.get_u16_le(),
            length: buf.get_u16_le(),
            connection_id: buf.get_u16_le(),
        })
    }
}

impl FrameHeader for Header {
    const EXTENSION_SIZE: usize = 0;

    fn base(&self) -> &Header {
        self
    }

    fn base_mut(&mut self) -> &mut Header {
        self
    }
}

/// Header of a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub header: Header,
    pub command: u32,
    pub command_id: u32,
}

impl CommandHeader {
    pub fn new(device_type: DeviceType, device_id: u16, command: u32, command_id: u32) -> Self {
        Self {
            header: Header::new(PacketType::Command, device_type, device_id),
            command,
            command_id,
        }
    }
}

impl WireSegment for CommandHeader {
    const SIZE: usize = Header::SIZE + Self::EXTENSION_SIZE;

    fn put(&self, buf: &mut BytesMut) {
        self.header.put(buf);
        buf.put_u32_le(self.command);
        buf.put_u32_le(self.command_id);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            header: Header::get(buf)?,
            command: buf.get_u32_le(),
            command_id: buf.get_u32_le(),
        })
    }
}

impl FrameHeader for CommandHeader {
    const EXTENSION_SIZE: usize = 8;

    fn base(&self) -> &Header {
        &self.header
    }

    fn base_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn code(&self) -> u32 {
        self.command
    }
}

/// Header of a server reply
#[derive(Debug, Clone, Copy)]
pub struct RespondHeader {
    pub header: Header,
    /// Result code, not part of equality
    pub result: u32,
    pub command_id: u32,
}

impl RespondHeader {
    pub fn new(device_type: DeviceType, device_id: u16, result: u32, command_id: u32) -> Self {
        Self {
            header: Header::new(PacketType::Respond, device_type, device_id),
            result,
            command_id,
        }
    }
}

impl PartialEq for RespondHeader {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.command_id == other.command_id
    }
}

impl Eq for RespondHeader {}

impl WireSegment for RespondHeader {
    const SIZE: usize = Header::SIZE + Self::EXTENSION_SIZE;

    fn put(&self, buf: &mut BytesMut) {
        self.header.put(buf);
        buf.put_u32_le(self.result);
        buf.put_u32_le(self.command_id);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            header: Header::get(buf)?,
            result: buf.get_u32_le(),
            command_id: buf.get_u32_le(),
        })
    }
}

impl FrameHeader for RespondHeader {
    const EXTENSION_SIZE: usize = 8;

    fn base(&self) -> &Header {
        &self.header
    }

    fn base_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn code(&self) -> u32 {
        self.result
    }
}

/// Header of an unsolicited telemetry push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDataHeader {
    pub header: Header,
    /// Sequence number, increasing per push
    pub id: u32,
    pub rsvd: u32,
}

impl DeviceDataHeader {
    pub fn new(device_type: DeviceType, device_id: u16, id: u32) -> Self {
        Self {
            header: Header::new(PacketType::DeviceData, device_type, device_id),
            id,
            rsvd: 0,
        }
    }
}

impl WireSegment for DeviceDataHeader {
    const SIZE: usize = Header::SIZE + Self::EXTENSION_SIZE;

    fn put(&self, buf: &mut BytesMut) {
        self.header.put(buf);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.rsvd);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            header: Header::get(buf)?,
            id: buf.get_u32_le(),
            rsvd: buf.get_u32_le(),
        })
    }
}

impl FrameHeader for DeviceDataHeader {
    const EXTENSION_SIZE: usize = 8;

    fn base(&self) -> &Header {
        &self.header
    }

    fn base_mut(&mut self) -> &mut Header {
        &mut self.header
    }
}

/// Editor file version sent with every bulk transfer part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u32,
    pub subversion: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: 1,
            subversion: 1,
        }
    }
}

/// Extension describing one part of a bulk configuration transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferInfo {
    pub version: VersionInfo,
    pub total_parts: u16,
    /// 1-based
    pub part: u16,
    pub number_grid_elements: u32,
}

impl WireSegment for TransferInfo {
    const SIZE: usize = 16;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.version.version);
        buf.put_u32_le(self.version.subversion);
        buf.put_u16_le(self.total_parts);
        buf.put_u16_le(self.part);
        buf.put_u32_le(self.number_grid_elements);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            version: VersionInfo {
                version: buf.get_u32_le(),
                subversion: buf.get_u32_le(),
            },
            total_parts: buf.get_u16_le(),
            part: buf.get_u16_le(),
            number_grid_elements: buf.get_u32_le(),
        })
    }
}

/// Command header of an uploaded configuration part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadConfigHeader {
    pub command: CommandHeader,
    pub transfer: TransferInfo,
}

impl WireSegment for LoadConfigHeader {
    const SIZE: usize = Header::SIZE + Self::EXTENSION_SIZE;

    fn put(&self, buf: &mut BytesMut) {
        self.command.put(buf);
        self.transfer.put(buf);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            command: CommandHeader::get(buf)?,
            transfer: TransferInfo::get(buf)?,
        })
    }
}

impl FrameHeader for LoadConfigHeader {
    const EXTENSION_SIZE: usize = CommandHeader::EXTENSION_SIZE + TransferInfo::SIZE;

    fn base(&self) -> &Header {
        &self.command.header
    }

    fn base_mut(&mut self) -> &mut Header {
        &mut self.command.header
    }

    fn code(&self) -> u32 {
        self.command.command
    }
}

/// Respond header of a downloaded configuration part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDataHeader {
    pub respond: RespondHeader,
    pub transfer: TransferInfo,
}

impl WireSegment for ConfigDataHeader {
    const SIZE: usize = Header::SIZE + Self::EXTENSION_SIZE;

    fn put(&self, buf: &mut BytesMut) {
        self.respond.put(buf);
        self.transfer.put(buf);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            respond: RespondHeader::get(buf)?,
            transfer: TransferInfo::get(buf)?,
        })
    }
}

impl FrameHeader for ConfigDataHeader {
    const EXTENSION_SIZE: usize = RespondHeader::EXTENSION_SIZE + TransferInfo::SIZE;

    fn base(&self) -> &Header {
        &self.respond.header
    }

    fn base_mut(&mut self) -> &mut Header {
        &mut self.respond.header
    }

    fn code(&self) -> u32 {
        self.respond.result
    }
}
