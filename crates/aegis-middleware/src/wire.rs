//! Datagram layout used between the producer and translator stages when
//! they run in separate processes.
//!
//! ```text
//! offset  size  field
//! 0       1     priority
//! 1       8     timestamp_us (little-endian)
//! 9       0..=8 payload
//! ```

use aegis_types::{GatewayError, MAX_FRAME_PAYLOAD, RAW_CENTER, Sample};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 9;

/// Largest valid datagram.
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_FRAME_PAYLOAD;

/// One decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub priority: u8,
    pub timestamp_us: u64,
    pub payload: Vec<u8>,
}

impl WirePacket {
    pub fn encode(&self) -> Result<Vec<u8>, GatewayError> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(GatewayError::Codec(format!(
                "payload of {} bytes exceeds {MAX_FRAME_PAYLOAD}",
                self.payload.len()
            )));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.priority);
        buf.extend_from_slice(&self.timestamp_us.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, GatewayError> {
        if buf.len() < HEADER_LEN {
            return Err(GatewayError::Codec(format!(
                "datagram of {} bytes is shorter than the {HEADER_LEN}-byte header",
                buf.len()
            )));
        }
        if buf.len() > MAX_PACKET_LEN {
            return Err(GatewayError::Codec(format!(
                "datagram of {} bytes exceeds {MAX_PACKET_LEN}",
                buf.len()
            )));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[1..HEADER_LEN]);
        Ok(Self {
            priority: buf[0],
            timestamp_us: u64::from_le_bytes(ts),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }

    /// Interpret the packet as a steering sample. An empty payload reads as
    /// the centre value.
    pub fn to_sample(&self) -> Sample {
        let raw = self.payload.first().copied().unwrap_or(RAW_CENTER);
        Sample::new(raw, self.priority, self.timestamp_us)
    }
}

impl From<Sample> for WirePacket {
    fn from(sample: Sample) -> Self {
        Self {
            priority: sample.priority,
            timestamp_us: sample.timestamp_us,
            payload: vec![sample.raw_value],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_priority_then_le_timestamp_then_payload() {
        let packet = WirePacket {
            priority: 3,
            timestamp_us: 0x0102_0304_0506_0708,
            payload: vec![0xAA, 0xBB],
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(
            bytes,
            vec![3, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0xAA, 0xBB]
        );
        assert_eq!(WirePacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn sample_survives_the_wire() {
        let sample = Sample::new(201, 0, 987_654_321);
        let bytes = WirePacket::from(sample).encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 1);
        assert_eq!(WirePacket::decode(&bytes).unwrap().to_sample(), sample);
    }

    #[test]
    fn short_datagram_is_rejected() {
        let err = WirePacket::decode(&[0u8; HEADER_LEN - 1]).unwrap_err();
        assert!(matches!(err, GatewayError::Codec(_)));
    }

    #[test]
    fn oversized_payload_is_rejected_both_ways() {
        let packet = WirePacket {
            priority: 0,
            timestamp_us: 0,
            payload: vec![0; MAX_FRAME_PAYLOAD + 1],
        };
        assert!(packet.encode().is_err());
        assert!(WirePacket::decode(&[0u8; MAX_PACKET_LEN + 1]).is_err());
    }

    #[test]
    fn header_only_packet_reads_as_centre() {
        let packet = WirePacket::decode(&[1, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(packet.payload.is_empty());
        assert_eq!(packet.to_sample().raw_value, RAW_CENTER);
    }
}
