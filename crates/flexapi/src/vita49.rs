//! VITA-49 datagram header decoding for SmartSDR UDP streams.
//!
//! SmartSDR radios send meter, spectrum, waterfall, audio and IQ data as
//! VITA-49 packets. The header layout is variable: the stream id, class id,
//! integer timestamp and fractional timestamp words are each present or
//! absent depending on bits in the first header word. This module walks the
//! header accordingly, rejects packets from other vendors, and hands the
//! payload on as [`Bytes`] without interpreting it (meters excepted).

use bytes::Bytes;

use flexapi_core::{Error, MeterReading, PacketType, Result, StreamPacket};

/// FlexRadio OUI (Organizationally Unique Identifier).
pub const FLEXRADIO_OUI: u32 = 0x001C2D;

/// Smallest possible header: the header word alone.
pub const MIN_HEADER_SIZE: usize = 4;

/// Semantic class of a packet, selected by its packet class code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Meter,
    Panadapter,
    Waterfall,
    Opus,
    DaxIq24,
    DaxIq48,
    DaxIq96,
    DaxIq192,
    DaxAudio,
    DaxReducedBw,
    Discovery,
    Unknown(u16),
}

const CLASS_CODES: &[(u16, PacketClass)] = &[
    (0x8002, PacketClass::Meter),
    (0x8003, PacketClass::Panadapter),
    (0x8004, PacketClass::Waterfall),
    (0x8005, PacketClass::Opus),
    (0x02E3, PacketClass::DaxIq24),
    (0x02E4, PacketClass::DaxIq48),
    (0x02E5, PacketClass::DaxIq96),
    (0x02E6, PacketClass::DaxIq192),
    (0x03E3, PacketClass::DaxAudio),
    (0x0123, PacketClass::DaxReducedBw),
    (0xFFFF, PacketClass::Discovery),
];

impl PacketClass {
    pub fn from_code(code: u16) -> Self {
        CLASS_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, class)| *class)
            .unwrap_or(PacketClass::Unknown(code))
    }

    pub fn is_dax_iq(&self) -> bool {
        matches!(
            self,
            PacketClass::DaxIq24 | PacketClass::DaxIq48 | PacketClass::DaxIq96 | PacketClass::DaxIq192
        )
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| {
            Error::Protocol(format!(
                "VITA-49 header truncated at offset {offset} ({} bytes)",
                data.len()
            ))
        })
}

/// Decode one UDP datagram.
///
/// Fails when the datagram is shorter than its header, declares a size
/// larger than itself, has no class id, or carries an OUI other than
/// [`FLEXRADIO_OUI`].
pub fn decode_packet(data: &[u8]) -> Result<StreamPacket> {
    if data.len() < MIN_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "VITA-49 packet too short: {} bytes",
            data.len()
        )));
    }

    // -- Header word --
    let header_word = read_u32(data, 0)?;
    let packet_type = PacketType::from_bits((header_word >> 28) as u8);
    let class_id_present = (header_word >> 27) & 1 == 1;
    let trailer_present = (header_word >> 26) & 1 == 1;
    let tsi = (header_word >> 22) & 0x3;
    let tsf = (header_word >> 20) & 0x3;
    let packet_count = ((header_word >> 16) & 0x0F) as u8;
    let packet_size_bytes = (header_word & 0xFFFF) as usize * 4;

    if packet_size_bytes > data.len() {
        return Err(Error::Protocol(format!(
            "VITA-49 packet size {} bytes exceeds datagram length {}",
            packet_size_bytes,
            data.len()
        )));
    }
    let data = &data[..packet_size_bytes];

    let mut offset = 4;

    let stream_id = if packet_type.has_stream_id() {
        let id = read_u32(data, offset)?;
        offset += 4;
        id
    } else {
        0
    };

    if !class_id_present {
        return Err(Error::Protocol("VITA-49 packet without class id".into()));
    }
    let oui = read_u32(data, offset)? & 0x00FF_FFFF;
    let class_word = read_u32(data, offset + 4)?;
    offset += 8;

    if oui != FLEXRADIO_OUI {
        return Err(Error::Protocol(format!(
            "VITA-49 OUI 0x{oui:06X} is not FlexRadio"
        )));
    }

    let timestamp_int = if tsi != 0 {
        let ts = read_u32(data, offset)?;
        offset += 4;
        Some(ts)
    } else {
        None
    };

    let timestamp_frac = if tsf != 0 {
        let hi = read_u32(data, offset)? as u64;
        let lo = read_u32(data, offset + 4)? as u64;
        offset += 8;
        Some((hi << 32) | lo)
    } else {
        None
    };

    let end = if trailer_present {
        data.len().saturating_sub(4)
    } else {
        data.len()
    };
    if end < offset {
        return Err(Error::Protocol(
            "VITA-49 trailer overlaps the header".into(),
        ));
    }

    Ok(StreamPacket {
        packet_type,
        stream_id,
        oui,
        information_class: (class_word >> 16) as u16,
        class_code: (class_word & 0xFFFF) as u16,
        packet_count,
        timestamp_int,
        timestamp_frac,
        payload: Bytes::copy_from_slice(&data[offset..end]),
    })
}

/// Extract meter readings from a meter packet's payload.
///
/// Each reading is 4 bytes: a 16-bit unsigned meter id followed by a 16-bit
/// signed value, both big-endian.
pub fn parse_meter_payload(payload: &[u8]) -> Result<Vec<MeterReading>> {
    if payload.len() % 4 != 0 {
        return Err(Error::Protocol(format!(
            "meter payload length {} is not divisible by 4",
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(4)
        .map(|c| MeterReading {
            meter_id: u16::from_be_bytes([c[0], c[1]]),
            value: i16::from_be_bytes([c[2], c[3]]),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flexapi_test_harness::VitaPacketBuilder;

    #[test]
    fn class_code_table() {
        assert_eq!(PacketClass::from_code(0x8002), PacketClass::Meter);
        assert_eq!(PacketClass::from_code(0x8003), PacketClass::Panadapter);
        assert_eq!(PacketClass::from_code(0x03E3), PacketClass::DaxAudio);
        assert_eq!(PacketClass::from_code(0x0123), PacketClass::DaxReducedBw);
        assert!(PacketClass::from_code(0x02E5).is_dax_iq());
        assert_eq!(PacketClass::from_code(0x1234), PacketClass::Unknown(0x1234));
    }

    #[test]
    fn decode_full_header() {
        let pkt = VitaPacketBuilder::new(0x8003, 0x4000_0000)
            .packet_count(7)
            .payload(&[1, 2, 3, 4, 5, 6, 7, 8])
            .build();
        let decoded = decode_packet(&pkt).unwrap();

        assert_eq!(decoded.packet_type, PacketType::ExtDataWithStream);
        assert_eq!(decoded.stream_id, 0x4000_0000);
        assert_eq!(decoded.oui, FLEXRADIO_OUI);
        assert_eq!(decoded.information_class, 0x534C);
        assert_eq!(decoded.class_code, 0x8003);
        assert_eq!(decoded.packet_count, 7);
        assert!(decoded.timestamp_int.is_some());
        assert!(decoded.timestamp_frac.is_some());
        assert_eq!(&decoded.payload[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn decode_without_timestamps() {
        let pkt = VitaPacketBuilder::new(0x03E3, 0x0400_0008)
            .without_timestamps()
            .payload(&[9, 9, 9, 9])
            .build();
        let decoded = decode_packet(&pkt).unwrap();
        assert_eq!(decoded.timestamp_int, None);
        assert_eq!(decoded.timestamp_frac, None);
        assert_eq!(&decoded.payload[..], &[9, 9, 9, 9]);
    }

    #[test]
    fn decode_strips_trailer() {
        let pkt = VitaPacketBuilder::new(0x8004, 0x4200_0000)
            .payload(&[1, 1, 1, 1])
            .trailer(0xDEAD_BEEF)
            .build();
        let decoded = decode_packet(&pkt).unwrap();
        assert_eq!(&decoded.payload[..], &[1, 1, 1, 1]);
    }

    #[test]
    fn decode_context_packet() {
        let pkt = VitaPacketBuilder::new(0x8003, 0x4000_0000)
            .packet_type(0x5)
            .build();
        let decoded = decode_packet(&pkt).unwrap();
        assert!(decoded.packet_type.is_context());
        assert!(!decoded.packet_type.is_data_with_stream());
    }

    #[test]
    fn reject_foreign_oui() {
        let pkt = VitaPacketBuilder::new(0x8002, 1).oui(0x00_12A2).build();
        let err = decode_packet(&pkt).unwrap_err();
        assert!(err.to_string().contains("not FlexRadio"), "{err}");
    }

    #[test]
    fn reject_missing_class_id() {
        let pkt = VitaPacketBuilder::new(0x8002, 1).without_class_id().build();
        assert!(decode_packet(&pkt).is_err());
    }

    #[test]
    fn reject_truncated() {
        assert!(decode_packet(&[0x38, 0x00]).is_err());

        let mut pkt = VitaPacketBuilder::new(0x8002, 1).payload(&[0; 8]).build();
        pkt.truncate(pkt.len() - 4);
        assert!(decode_packet(&pkt).is_err());
    }

    #[test]
    fn meter_payload_readings() {
        let pkt = VitaPacketBuilder::meter(&[(5, 1000), (12, -200)]).build();
        let decoded = decode_packet(&pkt).unwrap();
        let readings = parse_meter_payload(&decoded.payload).unwrap();
        assert_eq!(
            readings,
            vec![
                MeterReading {
                    meter_id: 5,
                    value: 1000
                },
                MeterReading {
                    meter_id: 12,
                    value: -200
                },
            ]
        );
    }

    #[test]
    fn meter_payload_bad_length() {
        assert!(parse_meter_payload(&[0, 1, 2]).is_err());
        assert!(parse_meter_payload(&[]).unwrap().is_empty());
    }
}
