//! Fixed-size payloads following the frame headers

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::{ProtocolResult, WireSegment};

/// Payload of an ISALIVE frame, both fields reserved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsAlivePayload {
    pub rsvd0: u32,
    pub rsvd1: u32,
}

impl WireSegment for IsAlivePayload {
    const SIZE: usize = 8;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.rsvd0);
        buf.put_u32_le(self.rsvd1);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            rsvd0: buf.get_u32_le(),
            rsvd1: buf.get_u32_le(),
        })
    }
}

/// Payload of an ERROR frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub error: u32,
    pub rsvd: u32,
}

impl WireSegment for ErrorPayload {
    const SIZE: usize = 8;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.error);
        buf.put_u32_le(self.rsvd);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            error: buf.get_u32_le(),
            rsvd: buf.get_u32_le(),
        })
    }
}

/// Reply to a configuration length query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigLengthPayload {
    /// Number of parts the following download will consist of
    pub num_packets: u32,
}

impl WireSegment for ConfigLengthPayload {
    const SIZE: usize = 16;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.num_packets);
        buf.put_bytes(0, 12);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        let num_packets = buf.get_u32_le();
        buf.advance(12);
        Ok(Self { num_packets })
    }
}

/// Periodic status of the control server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub used_connections: u16,
    /// See [`super::commands::server::status`]
    pub status: u16,
    /// Load in 0.01 %
    pub server_load: u16,
    pub connected_devices: u16,
    pub file_version: u16,
}

impl ServerStatus {
    pub fn grid_loaded(&self) -> bool {
        self.status & super::commands::server::status::GRID_LOADED != 0
    }

    pub fn grid_started(&self) -> bool {
        self.status & super::commands::server::status::GRID_STARTED != 0
    }

    pub fn load_percent(&self) -> f64 {
        f64::from(self.server_load) / 100.0
    }
}

impl WireSegment for ServerStatus {
    const SIZE: usize = 16;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.used_connections);
        buf.put_u16_le(self.status);
        buf.put_u16_le(self.server_load);
        buf.put_u16_le(self.connected_devices);
        buf.put_u16_le(self.file_version);
        buf.put_u16_le(0);
        buf.put_u32_le(0);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        let status = Self {
            used_connections: buf.get_u16_le(),
            status: buf.get_u16_le(),
            server_load: buf.get_u16_le(),
            connected_devices: buf.get_u16_le(),
            file_version: buf.get_u16_le(),
        };
        buf.advance(6);
        Ok(status)
    }
}

/// Set points sent along with a converter UPDATE_DATA command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConverterUpdateData {
    pub data: [u16; 4],
}

impl WireSegment for ConverterUpdateData {
    const SIZE: usize = 16;

    fn put(&self, buf: &mut BytesMut) {
        for value in self.data {
            buf.put_u16_le(value);
        }
        buf.put_bytes(0, 8);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        let data = [
            buf.get_u16_le(),
            buf.get_u16_le(),
            buf.get_u16_le(),
            buf.get_u16_le(),
        ];
        buf.advance(8);
        Ok(Self { data })
    }
}

/// Telemetry pushed by a FEN switchgear
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwitchgearLiveData {
    /// Bit per closed switch
    pub closed_switches: u8,
    /// Bit per locked switch
    pub locked_switches: u8,
    pub hv_on_line: u8,
    pub device_status: u8,
    pub voltage_p: u16,
    pub voltage_m: u16,
    pub currents: [u16; 4],
}

impl WireSegment for SwitchgearLiveData {
    const SIZE: usize = 16;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.closed_switches);
        buf.put_u8(self.locked_switches);
        buf.put_u8(self.hv_on_line);
        buf.put_u8(self.device_status);
        buf.put_u16_le(self.voltage_p);
        buf.put_u16_le(self.voltage_m);
        for current in self.currents {
            buf.put_u16_le(current);
        }
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            closed_switches: buf.get_u8(),
            locked_switches: buf.get_u8(),
            hv_on_line: buf.get_u8(),
            device_status: buf.get_u8(),
            voltage_p: buf.get_u16_le(),
            voltage_m: buf.get_u16_le(),
            currents: [
                buf.get_u16_le(),
                buf.get_u16_le(),
                buf.get_u16_le(),
                buf.get_u16_le(),
            ],
        })
    }
}

pub mod scibreak_status {
    pub const ONLINE: u32 = 0x01;
    pub const CLOSED_TOP: u32 = 0x02;
    pub const CLOSED_BOT: u32 = 0x04;
    pub const TRIP: u32 = 0x08;
}

/// Telemetry pushed by a SciBreak breaker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SciBreakLiveData {
    pub status: u32,
    pub voltage_top: i16,
    pub voltage_bot: i16,
    pub current_top: i16,
    pub current_bot: i16,
    pub trip_level_top: i16,
    pub trip_level_bot: i16,
}

impl WireSegment for SciBreakLiveData {
    const SIZE: usize = 16;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.status);
        buf.put_i16_le(self.voltage_top);
        buf.put_i16_le(self.voltage_bot);
        buf.put_i16_le(self.current_top);
        buf.put_i16_le(self.current_bot);
        buf.put_i16_le(self.trip_level_top);
        buf.put_i16_le(self.trip_level_bot);
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            status: buf.get_u32_le(),
            voltage_top: buf.get_i16_le(),
            voltage_bot: buf.get_i16_le(),
            current_top: buf.get_i16_le(),
            current_bot: buf.get_i16_le(),
            trip_level_top: buf.get_i16_le(),
            trip_level_bot: buf.get_i16_le(),
        })
    }
}

/// Offset applied by the converter to signed measurements
const CONVERTER_SIGN_OFFSET: i32 = 0x8000;

/// Telemetry pushed by a converter.
///
/// The wire form is 112 bytes: a status word, a reserved word and the
/// converter data structure made of 8-byte blocks. The decoded values are
/// already converted to physical units where the converter scales them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConverterLiveData {
    pub status: u32,
    pub state: u16,
    pub warnings: u16,
    pub errors: u16,
    pub mode: u16,
    /// Bit mask of the modes the converter supports
    pub available_modes: u16,
    /// Rated power in W
    pub rated_power: f64,
    /// Voltages of plus and minus rail, side 1 then side 2
    pub voltages: [u16; 4],
    /// Currents of plus and minus rail, side 1 then side 2
    pub currents: [i32; 4],
    pub voltage_control: [u16; 2],
    /// (voltage, droop parameter) per side
    pub droop_control: [(u16, u16); 2],
    /// Power set point in W
    pub power_control: f64,
    /// Mode entered after precharge, per side
    pub precharge_next_mode: [u16; 2],
}

/// Decoded static power word: 10-bit significand, 6-bit decimal exponent
pub fn decode_static_power(word: u16) -> f64 {
    let significand = f64::from((word & 0xFFC0) >> 6);
    let exponent = i32::from(word & 0x003F);
    significand * 10f64.powi(exponent)
}

fn encode_static_power(power: f64) -> u16 {
    let mut significand = power.max(0.0);
    let mut exponent = 0u16;
    while significand > 1023.0 && exponent < 0x3F {
        significand /= 10.0;
        exponent += 1;
    }
    // past the largest exponent the significand no longer fits 10 bits
    let significand = (significand.round() as u16).min(0x3FF);
    (significand << 6) | exponent
}

fn block(buf: &mut &[u8]) -> [u16; 4] {
    [
        buf.get_u16_le(),
        buf.get_u16_le(),
        buf.get_u16_le(),
        buf.get_u16_le(),
    ]
}

fn put_block(buf: &mut BytesMut, words: [u16; 4]) {
    for word in words {
        buf.put_u16_le(word);
    }
}

impl WireSegment for ConverterLiveData {
    const SIZE: usize = 112;

    fn put(&self, buf: &mut BytesMut) {
        let offset = |value: i32| (value + CONVERTER_SIGN_OFFSET).clamp(0, 0xFFFF) as u16;
        let power = ((self.power_control * 100.0).round() as i32 + CONVERTER_SIGN_OFFSET)
            .clamp(0, 0xFFFF) as u16;

        buf.put_u32_le(self.status);
        buf.put_u32_le(0);
        put_block(buf, [self.state, self.warnings, self.errors, self.mode]);
        put_block(
            buf,
            [self.available_modes, encode_static_power(self.rated_power), 0, 0],
        );
        put_block(buf, self.voltages);
        put_block(buf, self.currents.map(offset));
        buf.put_bytes(0, 16);
        for voltage in self.voltage_control {
            put_block(buf, [voltage, 0, 0, 0]);
        }
        for (voltage, droop) in self.droop_control {
            put_block(buf, [voltage, droop, 0, 0]);
        }
        put_block(buf, [power, 0, 0, 0]);
        for mode in self.precharge_next_mode {
            put_block(buf, [mode, 0, 0, 0]);
        }
    }

    fn get(buf: &mut &[u8]) -> ProtocolResult<Self> {
        let status = buf.get_u32_le();
        buf.advance(4);

        let [state, warnings, errors, mode] = block(buf);
        let [available_modes, static_power, _, _] = block(buf);
        let voltages = block(buf);
        let currents = block(buf).map(|raw| i32::from(raw) - CONVERTER_SIGN_OFFSET);
        buf.advance(16);
        let voltage_control = [block(buf)[0], block(buf)[0]];
        let droop1 = block(buf);
        let droop2 = block(buf);
        let power = i32::from(block(buf)[0]) - CONVERTER_SIGN_OFFSET;
        let precharge_next_mode = [block(buf)[0], block(buf)[0]];

        Ok(Self {
            status,
            state,
            warnings,
            errors,
            mode,
            available_modes,
            rated_power: decode_static_power(static_power),
            voltages,
            currents,
            voltage_control,
            droop_control: [(droop1[0], droop1[1]), (droop2[0], droop2[1])],
            power_control: f64::from(power) / 100.0,
            precharge_next_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_sizes() {
        assert_eq!(IsAlivePayload::default().encode().len(), IsAlivePayload::SIZE);
        assert_eq!(ConfigLengthPayload::default().encode().len(), 16);
        assert_eq!(ServerStatus::default().encode().len(), 16);
        assert_eq!(ConverterUpdateData::default().encode().len(), 16);
        assert_eq!(SwitchgearLiveData::default().encode().len(), 16);
        assert_eq!(SciBreakLiveData::default().encode().len(), 16);
        assert_eq!(ConverterLiveData::default().encode().len(), 112);
    }

    #[test]
    fn test_server_status_flags() {
        let status = ServerStatus {
            used_connections: 2,
            status: 0x0003,
            server_load: 4250,
            connected_devices: 5,
            file_version: 1,
        };
        let (decoded, _) = ServerStatus::decode(&status.encode(), 0).unwrap();
        assert_eq!(decoded, status);
        assert!(decoded.grid_loaded());
        assert!(decoded.grid_started());
        assert!((decoded.load_percent() - 42.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scibreak_signed_fields() {
        let data = SciBreakLiveData {
            status: scibreak_status::ONLINE | scibreak_status::CLOSED_TOP,
            voltage_top: -380,
            voltage_bot: 375,
            current_top: -12,
            current_bot: 12,
            trip_level_top: 100,
            trip_level_bot: -100,
        };
        let (decoded, _) = SciBreakLiveData::decode(&data.encode(), 0).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_static_power_decoding() {
        // significand 250, exponent 3
        let word = (250u16 << 6) | 3;
        assert_eq!(decode_static_power(word), 250_000.0);
        assert_eq!(decode_static_power(encode_static_power(250_000.0)), 250_000.0);
    }

    #[test]
    fn test_static_power_significand_saturates() {
        assert_eq!(encode_static_power(1023.0), 1023 << 6);
        assert_eq!(encode_static_power(1023.4), (102 << 6) | 1);
        assert_eq!(encode_static_power(f64::MAX), (1023 << 6) | 0x3F);
        assert_eq!(encode_static_power(f64::INFINITY), (1023 << 6) | 0x3F);
    }

    #[test]
    fn test_converter_live_data_layout() {
        let mut raw = vec![0u8; 112];
        raw[0..4].copy_from_slice(&1u32.to_le_bytes());
        // status block at structure offset 0
        raw[8..10].copy_from_slice(&1u16.to_le_bytes());
        raw[14..16].copy_from_slice(&7u16.to_le_bytes());
        // current block at structure offset 24
        raw[32..34].copy_from_slice(&(0x8000u16 - 15).to_le_bytes());
        // power control block at structure offset 80
        raw[88..90].copy_from_slice(&(0x8000u16 + 1250).to_le_bytes());
        // second precharge block at structure offset 96
        raw[104..106].copy_from_slice(&5u16.to_le_bytes());

        let (data, used) = ConverterLiveData::decode(&raw, 0).unwrap();
        assert_eq!(used, 112);
        assert_eq!(data.status, 1);
        assert_eq!(data.state, 1);
        assert_eq!(data.mode, 7);
        assert_eq!(data.currents[0], -15);
        assert!((data.power_control - 12.5).abs() < 1e-9);
        assert_eq!(data.precharge_next_mode, [0, 5]);
    }

    #[test]
    fn test_converter_live_data_roundtrip() {
        let data = ConverterLiveData {
            status: 1,
            state: 1,
            warnings: 0,
            errors: 0x10,
            mode: 3,
            available_modes: 0x07FC,
            rated_power: 5000.0,
            voltages: [380, 381, 760, 759],
            currents: [-20, 20, -5, 5],
            voltage_control: [380, 760],
            droop_control: [(380, 12), (760, 8)],
            power_control: -250.5,
            precharge_next_mode: [3, 4],
        };
        let (decoded, _) = ConverterLiveData::decode(&data.encode(), 0).unwrap();
        assert_eq!(decoded, data);
    }
}
