//! Typed frames
//!
//! [`Message`] covers everything the server sends to a client, [`Request`]
//! everything a client sends apart from configuration parts (see
//! [`super::transfer`]) and heartbeats.

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use super::commands::{self, converter, fen_switchgear, grid, scibreak_breaker, server};
use super::{
    seal_frame, ConfigDataHeader, ConfigLengthPayload, ConverterLiveData, ConverterUpdateData,
    DeviceDataHeader, DeviceType, ErrorPayload, GridElementConfig, Header, IsAlivePayload,
    PacketType, ProtocolResult, RespondHeader, SciBreakLiveData, ServerStatus, SwitchgearLiveData,
    WireSegment,
};

/// Telemetry carried by a DEVICEDATA frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "device", rename_all = "snake_case")]
pub enum DeviceData {
    Converter(ConverterLiveData),
    FenSwitchgear(SwitchgearLiveData),
    SciBreakBreaker(SciBreakLiveData),
}

impl DeviceData {
    pub fn device_type(&self) -> DeviceType {
        match self {
            DeviceData::Converter(_) => DeviceType::Converter,
            DeviceData::FenSwitchgear(_) => DeviceType::FenSwitchgear,
            DeviceData::SciBreakBreaker(_) => DeviceType::SciBreakBreaker,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        match self {
            DeviceData::Converter(data) => data.put(buf),
            DeviceData::FenSwitchgear(data) => data.put(buf),
            DeviceData::SciBreakBreaker(data) => data.put(buf),
        }
    }
}

/// One part of a configuration download
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPart {
    pub header: ConfigDataHeader,
    pub elements: Vec<GridElementConfig>,
}

impl ConfigPart {
    pub fn part(&self) -> u16 {
        self.header.transfer.part
    }

    pub fn total_parts(&self) -> u16 {
        self.header.transfer.total_parts
    }
}

/// A frame received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Liveness acknowledgement
    IsAlive {
        header: Header,
        payload: IsAlivePayload,
    },
    Error {
        header: Header,
        payload: ErrorPayload,
    },
    /// Unsolicited telemetry
    DeviceData {
        header: DeviceDataHeader,
        data: DeviceData,
    },
    /// One part of a configuration download
    ConfigPart(ConfigPart),
    /// Number of parts the next download consists of
    ConfigLength {
        header: RespondHeader,
        payload: ConfigLengthPayload,
    },
    /// Unsolicited server status
    ServerStatus {
        header: RespondHeader,
        status: ServerStatus,
    },
    /// Plain acknowledgement of a command
    Respond(RespondHeader),
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Message::IsAlive { header, .. } | Message::Error { header, .. } => header,
            Message::DeviceData { header, .. } => &header.header,
            Message::ConfigPart(part) => &part.header.respond.header,
            Message::ConfigLength { header, .. }
            | Message::ServerStatus { header, .. }
            | Message::Respond(header) => &header.header,
        }
    }

    /// Correlation id of replies, `None` for frames nobody waits for
    pub fn command_id(&self) -> Option<u32> {
        match self {
            Message::ConfigPart(part) => Some(part.header.respond.command_id),
            Message::ConfigLength { header, .. } | Message::Respond(header) => {
                Some(header.command_id)
            }
            _ => None,
        }
    }

    /// Result code of replies
    pub fn result(&self) -> Option<u32> {
        match self {
            Message::ConfigPart(part) => Some(part.header.respond.result),
            Message::ConfigLength { header, .. }
            | Message::ServerStatus { header, .. }
            | Message::Respond(header) => Some(header.result),
            _ => None,
        }
    }

    /// Frames the server sends on its own, never as a reply
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            Message::DeviceData { .. } | Message::ServerStatus { .. } | Message::Error { .. }
        )
    }

    /// Encode the frame as the server would send it
    pub fn encode(&self) -> ProtocolResult<BytesMut> {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Message::IsAlive { header, payload } => {
                header.put(&mut buf);
                payload.put(&mut buf);
            }
            Message::Error { header, payload } => {
                header.put(&mut buf);
                payload.put(&mut buf);
            }
            Message::DeviceData { header, data } => {
                header.put(&mut buf);
                data.put(&mut buf);
            }
            Message::ConfigPart(part) => {
                let mut header = part.header;
                header.transfer.number_grid_elements = part.elements.len() as u32;
                header.put(&mut buf);
                for element in &part.elements {
                    buf.put_slice(&element.encode());
                }
            }
            Message::ConfigLength { header, payload } => {
                header.put(&mut buf);
                payload.put(&mut buf);
            }
            Message::ServerStatus { header, status } => {
                header.put(&mut buf);
                status.put(&mut buf);
            }
            Message::Respond(header) => header.put(&mut buf),
        }
        seal_frame(buf)
    }
}

/// Build the ISALIVE frame sent by the heartbeat
pub fn is_alive_frame() -> ProtocolResult<BytesMut> {
    let mut buf = BytesMut::with_capacity(16);
    Header::new(PacketType::IsAlive, DeviceType::None, 0).put(&mut buf);
    IsAlivePayload::default().put(&mut buf);
    seal_frame(buf)
}

/// Actions of a SciBreak breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SciBreakAction {
    TurnOn,
    TurnOff,
    Open,
    Close,
    PeriodicDataOn,
    PeriodicDataOff,
}

impl SciBreakAction {
    pub fn command(self) -> u32 {
        match self {
            SciBreakAction::TurnOn => scibreak_breaker::TURN_ON,
            SciBreakAction::TurnOff => scibreak_breaker::TURN_OFF,
            SciBreakAction::Open => scibreak_breaker::OPEN,
            SciBreakAction::Close => scibreak_breaker::CLOSE,
            SciBreakAction::PeriodicDataOn => scibreak_breaker::PERIODIC_DATA_ON,
            SciBreakAction::PeriodicDataOff => scibreak_breaker::PERIODIC_DATA_OFF,
        }
    }
}

fn periodic(enabled: bool) -> u32 {
    if enabled {
        commands::PERIODIC_ON
    } else {
        commands::PERIODIC_OFF
    }
}

/// A command the client sends and expects a single reply to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    StartGrid,
    StopGrid,
    ClearGridConfig,
    SetupGrid,
    GetConfigLength,
    GetGridConfig,
    ConverterSetMode { device_id: u16, mode: u32 },
    ConverterUpdateData { device_id: u16, mode: u32, data: [u16; 4] },
    ConverterPeriodicData { device_id: u16, enabled: bool },
    SwitchgearSetSwitch { device_id: u16, mask: u8 },
    SwitchgearResetSwitch { device_id: u16, mask: u8 },
    SwitchgearGetData { device_id: u16 },
    SwitchgearPeriodicData { device_id: u16, enabled: bool },
    SciBreakBreaker { device_id: u16, action: SciBreakAction },
}

impl Request {
    /// Device type and id the command is addressed to
    pub fn target(&self) -> (DeviceType, u16) {
        match *self {
            Request::StartGrid | Request::StopGrid => (DeviceType::Server, 0),
            Request::ClearGridConfig
            | Request::SetupGrid
            | Request::GetConfigLength
            | Request::GetGridConfig => (DeviceType::Grid, 0),
            Request::ConverterSetMode { device_id, .. }
            | Request::ConverterUpdateData { device_id, .. }
            | Request::ConverterPeriodicData { device_id, .. } => {
                (DeviceType::Converter, device_id)
            }
            Request::SwitchgearSetSwitch { device_id, .. }
            | Request::SwitchgearResetSwitch { device_id, .. }
            | Request::SwitchgearGetData { device_id }
            | Request::SwitchgearPeriodicData { device_id, .. } => {
                (DeviceType::FenSwitchgear, device_id)
            }
            Request::SciBreakBreaker { device_id, .. } => (DeviceType::SciBreakBreaker, device_id),
        }
    }

    pub fn command(&self) -> u32 {
        match *self {
            Request::StartGrid => server::START_GRID,
            Request::StopGrid => server::STOP_GRID,
            Request::ClearGridConfig => grid::CLEAR_ALL,
            Request::SetupGrid => grid::SETUP_GRID,
            Request::GetConfigLength => grid::GET_CONFIG_LENGTH,
            Request::GetGridConfig => grid::GET_GRID_CONFIG,
            Request::ConverterSetMode { mode, .. } => converter::SET_MODE | mode,
            Request::ConverterUpdateData { mode, .. } => converter::UPDATE_DATA | mode,
            Request::ConverterPeriodicData { enabled, .. } => {
                converter::PERIODIC_DATA | periodic(enabled)
            }
            Request::SwitchgearSetSwitch { mask, .. } => fen_switchgear::SET_SWITCH | u32::from(mask),
            Request::SwitchgearResetSwitch { mask, .. } => {
                fen_switchgear::RESET_SWITCH | u32::from(mask)
            }
            Request::SwitchgearGetData { .. } => fen_switchgear::GET_DATA,
            Request::SwitchgearPeriodicData { enabled, .. } => {
                fen_switchgear::PERIODIC_DATA | periodic(enabled)
            }
            Request::SciBreakBreaker { action, .. } => action.command(),
        }
    }

    /// Encode with the given correlation id. The length field is filled in
    /// from the encoded size.
    pub fn encode(&self, command_id: u32) -> ProtocolResult<BytesMut> {
        let (device_type, device_id) = self.target();
        let header = super::CommandHeader::new(device_type, device_id, self.command(), command_id);

        let mut buf = BytesMut::with_capacity(32);
        header.put(&mut buf);
        if let Request::ConverterUpdateData { data, .. } = self {
            ConverterUpdateData { data: *data }.put(&mut buf);
        }
        seal_frame(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandHeader, FrameHeader};

    #[test]
    fn test_request_encoding() {
        let bytes = Request::StartGrid.encode(0xAABBCCDD).unwrap();
        assert_eq!(bytes.len(), 16);

        let (header, _) = CommandHeader::decode(&bytes, 0).unwrap();
        assert_eq!(header.header.packet_type, PacketType::Command);
        assert_eq!(header.header.device_type, DeviceType::Server);
        assert_eq!(header.header.length, 16);
        assert_eq!(header.command, server::START_GRID);
        assert_eq!(header.command_id, 0xAABBCCDD);
    }

    #[test]
    fn test_update_data_length_computed() {
        let request = Request::ConverterUpdateData {
            device_id: 4,
            mode: converter::mode::POWER_CONTROL,
            data: [1, 2, 3, 4],
        };
        let bytes = request.encode(7).unwrap();
        assert_eq!(bytes.len(), 32);

        let (header, _) = CommandHeader::decode(&bytes, 0).unwrap();
        assert_eq!(header.header.length, 32);
        assert_eq!(header.header.device_id, 4);
        assert_eq!(header.code(), 0x0207);

        let (payload, _) = ConverterUpdateData::decode(&bytes, 16).unwrap();
        assert_eq!(payload.data, [1, 2, 3, 4]);
    }

    #[test]
    fn test_device_command_codes() {
        assert_eq!(
            Request::ConverterPeriodicData { device_id: 1, enabled: true }.command(),
            0x0301
        );
        assert_eq!(
            Request::SwitchgearPeriodicData { device_id: 1, enabled: false }.command(),
            0x0402
        );
        assert_eq!(
            Request::SwitchgearSetSwitch { device_id: 1, mask: 0b0101 }.command(),
            0x0105
        );
        assert_eq!(
            Request::SciBreakBreaker {
                device_id: 2,
                action: SciBreakAction::Open
            }
            .command(),
            0x0201
        );
        assert_eq!(
            Request::SciBreakBreaker {
                device_id: 2,
                action: SciBreakAction::Open
            }
            .target(),
            (DeviceType::SciBreakBreaker, 2)
        );
    }

    #[test]
    fn test_is_alive_frame() {
        let bytes = is_alive_frame().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], PacketType::IsAlive as u8);
        assert_eq!(&bytes[4..6], &16u16.to_le_bytes());
    }

    #[test]
    fn test_message_classification() {
        let respond = Message::Respond(RespondHeader::new(DeviceType::Server, 0, 1, 99));
        assert_eq!(respond.command_id(), Some(99));
        assert!(!respond.is_push());

        let status = Message::ServerStatus {
            header: RespondHeader::new(DeviceType::Server, 0, server::result::STATUS_DATA, 0),
            status: ServerStatus::default(),
        };
        assert!(status.is_push());
        assert_eq!(status.command_id(), None);
    }
}
