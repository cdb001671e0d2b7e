//! Frame parsing and stream decoding
//!
//! [`parse_frame`] turns one complete frame into a [`Message`] by reading the
//! tags progressively. [`Decoder`] cuts complete frames out of a byte stream.

use bytes::BytesMut;
use thiserror::Error;

use super::commands::{grid, server};
use super::{
    ConfigDataHeader, ConfigLengthPayload, ConfigPart, ConverterLiveData, DeviceData,
    DeviceDataHeader, DeviceType, ErrorPayload, GridElementConfig, Header, IsAlivePayload,
    Message, PacketType, RespondHeader, SciBreakLiveData, ServerStatus, SwitchgearLiveData,
    WireSegment, MAX_FRAME_SIZE,
};

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    TruncatedInput { needed: usize, available: usize },

    #[error("Unrecognized frame: packet type {packet_type:#04x}, device type {device_type:#04x}, code {code:#06x}")]
    UnrecognizedTag {
        packet_type: u8,
        device_type: u8,
        code: u32,
    },

    #[error("Unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("Unknown device type: {0:#04x}")]
    UnknownDeviceType(u8),

    #[error("Frame too large: {length} bytes (max: {max})")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Invalid frame length: {0}")]
    InvalidLength(usize),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Pad a fully assembled frame and fill in its length field
pub fn seal_frame(mut buf: BytesMut) -> ProtocolResult<BytesMut> {
    super::add_padding(&mut buf);

    if buf.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            length: buf.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    if buf.len() < Header::SIZE {
        return Err(ProtocolError::InvalidLength(buf.len()));
    }

    let length = buf.len() as u16;
    buf[4..6].copy_from_slice(&length.to_le_bytes());
    Ok(buf)
}

fn unrecognized(header: &Header, code: u32) -> ProtocolError {
    ProtocolError::UnrecognizedTag {
        packet_type: header.packet_type as u8,
        device_type: header.device_type as u8,
        code,
    }
}

/// Reconstruct the typed message carried by one complete frame.
///
/// Unknown tag combinations are an error, never skipped: the caller can no
/// longer trust the framing of the stream.
pub fn parse_frame(bytes: &[u8]) -> ProtocolResult<Message> {
    let (header, _) = Header::decode(bytes, 0)?;

    match header.packet_type {
        PacketType::IsAlive => {
            let (payload, _) = IsAlivePayload::decode(bytes, Header::SIZE)?;
            Ok(Message::IsAlive { header, payload })
        }
        PacketType::Error => {
            let (payload, _) = ErrorPayload::decode(bytes, Header::SIZE)?;
            Ok(Message::Error { header, payload })
        }
        PacketType::DeviceData => {
            let (header, offset) = DeviceDataHeader::decode(bytes, 0)?;
            let data = match header.header.device_type {
                DeviceType::Converter => {
                    DeviceData::Converter(ConverterLiveData::decode(bytes, offset)?.0)
                }
                DeviceType::FenSwitchgear => {
                    DeviceData::FenSwitchgear(SwitchgearLiveData::decode(bytes, offset)?.0)
                }
                DeviceType::SciBreakBreaker => {
                    DeviceData::SciBreakBreaker(SciBreakLiveData::decode(bytes, offset)?.0)
                }
                _ => return Err(unrecognized(&header.header, 0)),
            };
            Ok(Message::DeviceData { header, data })
        }
        PacketType::Respond => {
            let (respond, offset) = RespondHeader::decode(bytes, 0)?;
            match (header.device_type, respond.result) {
                (DeviceType::Grid, grid::result::GET_CONFIG_DATA) => {
                    let (header, offset) = ConfigDataHeader::decode(bytes, 0)?;
                    let count = header.transfer.number_grid_elements as usize;
                    let elements = GridElementConfig::decode_many(&bytes[offset..], count)?;
                    Ok(Message::ConfigPart(ConfigPart { header, elements }))
                }
                (DeviceType::Grid, grid::result::GET_CONFIG_LENGTH) => {
                    let (payload, _) = ConfigLengthPayload::decode(bytes, offset)?;
                    Ok(Message::ConfigLength {
                        header: respond,
                        payload,
                    })
                }
                (DeviceType::Server, server::result::STATUS_DATA) => {
                    let (status, _) = ServerStatus::decode(bytes, offset)?;
                    Ok(Message::ServerStatus {
                        header: respond,
                        status,
                    })
                }
                (DeviceType::None, result) => Err(unrecognized(&header, result)),
                _ => Ok(Message::Respond(respond)),
            }
        }
        PacketType::Command => Err(unrecognized(&header, 0)),
    }
}

/// Cuts complete frames out of a byte stream
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Body {
        length: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// Attempt to take one frame from the buffer.
    /// Returns Ok(None) if more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ProtocolResult<Option<BytesMut>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < Header::SIZE {
                        return Ok(None);
                    }

                    let length = usize::from(u16::from_le_bytes([buf[4], buf[5]]));
                    if length > MAX_FRAME_SIZE {
                        return Err(ProtocolError::FrameTooLarge {
                            length,
                            max: MAX_FRAME_SIZE,
                        });
                    }
                    if length < Header::SIZE {
                        return Err(ProtocolError::InvalidLength(length));
                    }

                    self.state = DecodeState::Body { length };
                }
                DecodeState::Body { length } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let frame = buf.split_to(length);
                    self.state = DecodeState::Header;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        is_alive_frame, NodeConfig, SegmentConfig, TransferInfo, VersionInfo,
    };

    fn respond(device_type: DeviceType, result: u32, command_id: u32) -> BytesMut {
        Message::Respond(RespondHeader::new(device_type, 0, result, command_id))
            .encode()
            .unwrap()
    }

    #[test]
    fn test_parse_plain_respond() {
        let bytes = respond(DeviceType::Server, server::result::SUCCESS, 0xAABBCCDD);
        match parse_frame(&bytes).unwrap() {
            Message::Respond(header) => {
                assert_eq!(header.command_id, 0xAABBCCDD);
                assert_eq!(header.result, server::result::SUCCESS);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_config_length() {
        let message = Message::ConfigLength {
            header: RespondHeader::new(DeviceType::Grid, 0, grid::result::GET_CONFIG_LENGTH, 5),
            payload: ConfigLengthPayload { num_packets: 3 },
        };
        match parse_frame(&message.encode().unwrap()).unwrap() {
            Message::ConfigLength { header, payload } => {
                assert_eq!(header.command_id, 5);
                assert_eq!(header.header.length, 32);
                assert_eq!(payload.num_packets, 3);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_config_part() {
        let elements = vec![
            GridElementConfig::Node(NodeConfig { id: 1, node_type: 0 }),
            GridElementConfig::Segment(SegmentConfig {
                id: 2,
                point1: 3,
                point2: 4,
            }),
        ];
        let expected = elements.clone();
        let message = Message::ConfigPart(ConfigPart {
            header: ConfigDataHeader {
                respond: RespondHeader::new(DeviceType::Grid, 0, grid::result::GET_CONFIG_DATA, 9),
                transfer: TransferInfo {
                    version: VersionInfo::default(),
                    total_parts: 1,
                    part: 1,
                    number_grid_elements: 2,
                },
            },
            elements,
        });

        let bytes = message.encode().unwrap();
        assert_eq!(bytes.len(), 32 + 2 * 48);
        match parse_frame(&bytes).unwrap() {
            Message::ConfigPart(part) => {
                assert_eq!(part.elements, expected);
                assert_eq!(part.part(), 1);
                assert_eq!(part.header.respond.command_id, 9);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_config_part_with_missing_elements() {
        let mut header = ConfigDataHeader {
            respond: RespondHeader::new(DeviceType::Grid, 0, grid::result::GET_CONFIG_DATA, 9),
            transfer: TransferInfo {
                version: VersionInfo::default(),
                total_parts: 1,
                part: 1,
                number_grid_elements: 4,
            },
        };
        header.respond.header.length = 32;
        let bytes = header.encode();
        assert!(matches!(
            parse_frame(&bytes),
            Err(ProtocolError::TruncatedInput { needed: 192, .. })
        ));
    }

    #[test]
    fn test_parse_device_data() {
        let data = DeviceData::FenSwitchgear(SwitchgearLiveData {
            closed_switches: 0b0011,
            ..Default::default()
        });
        let message = Message::DeviceData {
            header: DeviceDataHeader::new(DeviceType::FenSwitchgear, 3, 17),
            data: data.clone(),
        };
        let bytes = message.encode().unwrap();
        assert_eq!(bytes.len(), 32);
        match parse_frame(&bytes).unwrap() {
            Message::DeviceData { header, data: parsed } => {
                assert_eq!(header.header.device_id, 3);
                assert_eq!(header.id, 17);
                assert_eq!(parsed, data);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_device_data_for_unknown_family_is_rejected() {
        let mut bytes = DeviceDataHeader::new(DeviceType::Breaker, 1, 1).encode();
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            parse_frame(&bytes),
            Err(ProtocolError::UnrecognizedTag {
                packet_type: 0x11,
                device_type: 0x42,
                ..
            })
        ));
    }

    #[test]
    fn test_command_frame_is_rejected() {
        let bytes = crate::protocol::Request::StartGrid.encode(1).unwrap();
        assert!(matches!(
            parse_frame(&bytes),
            Err(ProtocolError::UnrecognizedTag { packet_type: 0x01, .. })
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = respond(DeviceType::Grid, grid::result::GET_CONFIG_LENGTH, 1);
        assert!(matches!(
            parse_frame(&bytes),
            Err(ProtocolError::TruncatedInput { needed: 16, available: 0 })
        ));
    }

    #[test]
    fn test_seal_rejects_oversized_frames() {
        let buf = BytesMut::from(&vec![0u8; MAX_FRAME_SIZE + 1][..]);
        assert!(matches!(
            seal_frame(buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_decoder_splits_stream() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        let first = is_alive_frame().unwrap();
        let second = respond(DeviceType::Server, 1, 42);
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second[..10]);

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &first[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&second[10..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(parse_frame(&frame).unwrap().command_id(), Some(42));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_rejects_bad_length() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&[0x81u8, 0x01, 0, 0, 0x00, 0x10, 0, 0][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { length: 4096, .. })
        ));

        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&[0x81u8, 0x01, 0, 0, 0x04, 0x00, 0, 0][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ProtocolError::InvalidLength(4))
        ));
    }
}
