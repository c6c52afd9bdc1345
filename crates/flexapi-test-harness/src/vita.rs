//! Builder for VITA-49 datagrams as a SmartSDR radio would send them.

/// FlexRadio OUI placed in the class id by default.
pub const FLEXRADIO_OUI: u32 = 0x001C2D;

/// Information class code SmartSDR radios put in every packet.
pub const FLEX_INFORMATION_CLASS: u16 = 0x534C;

/// Builds one VITA-49 datagram.
///
/// Defaults: extension data with stream id (type 3), class id present with
/// the FlexRadio OUI, both timestamps present, no trailer, empty payload.
/// Payloads are zero-padded to a whole number of 32-bit words.
#[derive(Debug, Clone)]
pub struct VitaPacketBuilder {
    packet_type: u8,
    class_id: bool,
    oui: u32,
    information_class: u16,
    class_code: u16,
    stream_id: u32,
    packet_count: u8,
    timestamps: bool,
    trailer: Option<u32>,
    payload: Vec<u8>,
}

impl VitaPacketBuilder {
    pub fn new(class_code: u16, stream_id: u32) -> Self {
        Self {
            packet_type: 0x3,
            class_id: true,
            oui: FLEXRADIO_OUI,
            information_class: FLEX_INFORMATION_CLASS,
            class_code,
            stream_id,
            packet_count: 0,
            timestamps: true,
            trailer: None,
            payload: Vec::new(),
        }
    }

    /// A meter packet (class 0x8002) carrying `(meter_id, value)` readings.
    pub fn meter(readings: &[(u16, i16)]) -> Self {
        let mut payload = Vec::with_capacity(readings.len() * 4);
        for (id, value) in readings {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        Self::new(0x8002, 0x0000_0700).payload(&payload)
    }

    pub fn packet_type(mut self, packet_type: u8) -> Self {
        self.packet_type = packet_type & 0x0F;
        self
    }

    pub fn oui(mut self, oui: u32) -> Self {
        self.oui = oui & 0x00FF_FFFF;
        self
    }

    pub fn without_class_id(mut self) -> Self {
        self.class_id = false;
        self
    }

    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    pub fn packet_count(mut self, count: u8) -> Self {
        self.packet_count = count & 0x0F;
        self
    }

    pub fn trailer(mut self, trailer: u32) -> Self {
        self.trailer = Some(trailer);
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let has_stream_id = matches!(self.packet_type, 1 | 3 | 4 | 5);

        let mut body = Vec::new();
        if has_stream_id {
            body.extend_from_slice(&self.stream_id.to_be_bytes());
        }
        if self.class_id {
            body.extend_from_slice(&self.oui.to_be_bytes());
            let class_word = ((self.information_class as u32) << 16) | self.class_code as u32;
            body.extend_from_slice(&class_word.to_be_bytes());
        }
        if self.timestamps {
            body.extend_from_slice(&1_700_000_000u32.to_be_bytes());
            body.extend_from_slice(&500_000u64.to_be_bytes());
        }
        body.extend_from_slice(&self.payload);
        while body.len() % 4 != 0 {
            body.push(0);
        }
        if let Some(trailer) = self.trailer {
            body.extend_from_slice(&trailer.to_be_bytes());
        }

        let size_words = ((body.len() + 4) / 4) as u32;
        let mut word = (self.packet_type as u32) << 28;
        word |= (self.class_id as u32) << 27;
        word |= (self.trailer.is_some() as u32) << 26;
        if self.timestamps {
            // TSI = UTC, TSF = sample count
            word |= 0x1 << 22;
            word |= 0x1 << 20;
        }
        word |= (self.packet_count as u32) << 16;
        word |= size_words & 0xFFFF;

        let mut packet = Vec::with_capacity(body.len() + 4);
        packet.extend_from_slice(&word.to_be_bytes());
        packet.extend_from_slice(&body);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_field_counts_words() {
        let pkt = VitaPacketBuilder::new(0x8003, 1).payload(&[1, 2, 3]).build();
        assert_eq!(pkt.len() % 4, 0);
        let word = u32::from_be_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]);
        assert_eq!((word & 0xFFFF) as usize * 4, pkt.len());
    }

    #[test]
    fn no_stream_id_for_type_zero() {
        let with = VitaPacketBuilder::new(0x8003, 1).build();
        let without = VitaPacketBuilder::new(0x8003, 1).packet_type(0).build();
        assert_eq!(with.len(), without.len() + 4);
    }
}
