//! Generic PSI section reader with CRC-32 (MPEG-2) validation.

use crc::{Crc, CRC_32_MPEG_2};

const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Returned by [`SectionReader::from_payload`] / [`SectionReader::from_section`].
pub struct SectionReader<'a> {
    pub table_id:       u8,
    pub version:        u8,
    pub current_next:   bool,
    pub section_number: u8,
    pub last_section:   u8,
    /// table_id_extension: program number for a PMT, transport stream id for a PAT.
    pub table_id_ext:   u16,
    pub body:           &'a [u8], // bytes between fixed header & CRC
}

impl<'a> SectionReader<'a> {
    /// Reads a section from a TS packet payload that starts with a
    /// pointer field (payload-unit-start packets).
    pub fn from_payload(payload: &'a [u8]) -> anyhow::Result<Self> {
        if payload.is_empty() {
            anyhow::bail!("payload empty")
        }
        let pointer = payload[0] as usize;
        if payload.len() < 1 + pointer {
            anyhow::bail!("pointer field past payload")
        }
        Self::from_section(&payload[1 + pointer..])
    }

    /// Reads an already-assembled section (no pointer field).
    /// Validates length and the trailing CRC-32.
    pub fn from_section(data: &'a [u8]) -> anyhow::Result<Self> {
        if data.len() < 8 {
            anyhow::bail!("short section")
        }
        let table_id = data[0];
        let sec_len = ((data[1] & 0x0F) as usize) << 8 | data[2] as usize;
        if sec_len < 5 {
            anyhow::bail!("invalid section_length")
        }
        let end = 3 + sec_len;
        if end > data.len() {
            anyhow::bail!("truncated section")
        }

        let crc_calc = CRC_MPEG.checksum(&data[..end - 4]);
        let crc_pkt = u32::from_be_bytes(data[end - 4..end].try_into()?);
        if crc_calc != crc_pkt {
            anyhow::bail!("CRC-32 mismatch");
        }

        Ok(Self {
            table_id,
            version:        (data[5] & 0x3E) >> 1,
            current_next:   data[5] & 0x01 != 0,
            section_number: data[6],
            last_section:   data[7],
            table_id_ext:   u16::from_be_bytes(data[3..5].try_into()?),
            body:           &data[8..end - 4],
        })
    }
}

/// Declared total length (header + body + CRC) of the section starting at
/// `data`, if the three header bytes are available.
pub fn section_total_len(data: &[u8]) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    Some(3 + (((data[1] & 0x0F) as usize) << 8 | data[2] as usize))
}
