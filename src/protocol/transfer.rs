//! Chunked transfer of grid element lists
//!
//! A configuration larger than one frame travels as several parts sharing
//! one command id. Each part carries its 1-based index and the total count.

use bytes::{BufMut, BytesMut};

use super::commands::grid;
use super::{
    seal_frame, CommandHeader, ConfigDataHeader, ConfigPart, DeviceType, GridElementConfig,
    LoadConfigHeader, ProtocolError, ProtocolResult, RespondHeader, TransferInfo, VersionInfo,
    WireSegment, ELEMENT_SIZE,
};

/// How many element slots fit into one part
pub fn max_elements_per_part(max_frame_size: usize) -> usize {
    max_frame_size.saturating_sub(LoadConfigHeader::SIZE) / ELEMENT_SIZE
}

/// Split `configs` into consecutive slices that each fit into one frame.
/// An empty list yields no parts.
pub fn split(
    configs: &[GridElementConfig],
    max_frame_size: usize,
) -> ProtocolResult<Vec<&[GridElementConfig]>> {
    let per_part = max_elements_per_part(max_frame_size);
    if per_part == 0 {
        return Err(ProtocolError::FrameTooLarge {
            length: LoadConfigHeader::SIZE + ELEMENT_SIZE,
            max: max_frame_size,
        });
    }

    let parts: Vec<_> = configs.chunks(per_part).collect();
    if parts.len() > usize::from(u16::MAX) {
        return Err(ProtocolError::MalformedPayload(format!(
            "{} elements need {} parts, at most {} are possible",
            configs.len(),
            parts.len(),
            u16::MAX
        )));
    }
    Ok(parts)
}

fn transfer_info(version: VersionInfo, total_parts: usize, index: usize, count: usize) -> TransferInfo {
    TransferInfo {
        version,
        total_parts: total_parts as u16,
        part: (index + 1) as u16,
        number_grid_elements: count as u32,
    }
}

/// Encode the LOAD_GRID_CONFIG frames of an upload, all with `command_id`
pub fn encode_upload(
    configs: &[GridElementConfig],
    version: VersionInfo,
    command_id: u32,
    max_frame_size: usize,
) -> ProtocolResult<Vec<BytesMut>> {
    let parts = split(configs, max_frame_size)?;
    let total = parts.len();

    parts
        .iter()
        .enumerate()
        .map(|(index, slice)| {
            let header = LoadConfigHeader {
                command: CommandHeader::new(DeviceType::Grid, 0, grid::LOAD_GRID_CONFIG, command_id),
                transfer: transfer_info(version, total, index, slice.len()),
            };

            let mut buf = BytesMut::with_capacity(LoadConfigHeader::SIZE + slice.len() * ELEMENT_SIZE);
            header.put(&mut buf);
            for config in *slice {
                buf.put_slice(&config.encode());
            }
            seal_frame(buf)
        })
        .collect()
}

/// Decode one uploaded part
pub fn decode_upload_part(bytes: &[u8]) -> ProtocolResult<(LoadConfigHeader, Vec<GridElementConfig>)> {
    let (header, offset) = LoadConfigHeader::decode(bytes, 0)?;
    let count = header.transfer.number_grid_elements as usize;
    let elements = GridElementConfig::decode_many(&bytes[offset..], count)?;
    Ok((header, elements))
}

/// Build the GET_CONFIG_DATA replies carrying `configs`
pub fn download_parts(
    configs: &[GridElementConfig],
    version: VersionInfo,
    command_id: u32,
    max_frame_size: usize,
) -> ProtocolResult<Vec<ConfigPart>> {
    let parts = split(configs, max_frame_size)?;
    let total = parts.len();

    Ok(parts
        .iter()
        .enumerate()
        .map(|(index, slice)| ConfigPart {
            header: ConfigDataHeader {
                respond: RespondHeader::new(
                    DeviceType::Grid,
                    0,
                    grid::result::GET_CONFIG_DATA,
                    command_id,
                ),
                transfer: transfer_info(version, total, index, slice.len()),
            },
            elements: slice.to_vec(),
        })
        .collect())
}

/// Concatenate downloaded parts in part order, whatever order they arrived in
pub fn reassemble(mut parts: Vec<ConfigPart>) -> Vec<GridElementConfig> {
    parts.sort_by_key(|part| part.part());
    parts.into_iter().flat_map(|part| part.elements).collect()
}
