//! Binary measurement records: `AA 55 K <2K channel bytes> <2 status> <2 CRC>`
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};

pub const SYNC_1: u8 = 0xAA;
pub const SYNC_2: u8 = 0x55;

/// Marker words appended to a record line ("OK" and "FP" in ASCII hex)
pub const MARKER_OK: &str = "4f4b";
pub const MARKER_FAILED: &str = "4650";

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/Modbus over the given bytes
pub fn crc16_modbus(data: &[u8]) -> u16 {
    MODBUS.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordValidity {
    Ok,
    FailedCrc,
}

impl RecordValidity {
    pub fn marker(&self) -> &'static str {
        match self {
            RecordValidity::Ok => MARKER_OK,
            RecordValidity::FailedCrc => MARKER_FAILED,
        }
    }
}

/// One length-correct record. Records with a CRC mismatch are kept and
/// tagged instead of being dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRecord {
    /// Channel count byte from the header
    pub header: u8,
    /// Channel words followed by the status word, as received
    pub payload: Vec<u8>,
    /// CRC as transmitted (big-endian on the wire)
    pub received_crc: u16,
    pub validity: RecordValidity,
}

impl BinaryRecord {
    /// Build a record from a header and a body of `2K + 4` bytes
    pub fn from_parts(header: u8, body: &[u8]) -> Option<Self> {
        if body.len() != body_len(header) {
            return None;
        }
        let (payload, crc_bytes) = body.split_at(body.len() - 2);
        let received_crc = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);

        let mut covered = Vec::with_capacity(payload.len() + 1);
        covered.push(header);
        covered.extend_from_slice(payload);
        let validity = if crc16_modbus(&covered) == received_crc {
            RecordValidity::Ok
        } else {
            RecordValidity::FailedCrc
        };

        Some(Self {
            header,
            payload: payload.to_vec(),
            received_crc,
            validity,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.validity == RecordValidity::Ok
    }

    pub fn channel_count(&self) -> usize {
        self.header as usize
    }

    pub fn channels(&self) -> Vec<u16> {
        self.words().take(self.channel_count()).collect()
    }

    pub fn status(&self) -> u16 {
        self.words().last().unwrap_or_default()
    }

    fn words(&self) -> impl Iterator<Item = u16> + '_ {
        self.payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }

    /// Channels, status and CRC as lowercase 4-digit hex words
    pub fn hex_words(&self) -> Vec<String> {
        let mut words: Vec<String> = self.payload.chunks(2).map(hex::encode).collect();
        words.push(hex::encode(self.received_crc.to_be_bytes()));
        words
    }

    /// Space-joined hex words followed by the validity marker, as recorded
    pub fn to_line(&self) -> String {
        let mut words = self.hex_words();
        words.push(self.validity.marker().to_string());
        words.join(" ")
    }

    /// Re-encode the record as wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 5);
        bytes.extend_from_slice(&[SYNC_1, SYNC_2, self.header]);
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.received_crc.to_be_bytes());
        bytes
    }
}

/// Body length following the header: channels, status word and CRC
pub fn body_len(header: u8) -> usize {
    2 * header as usize + 4
}

/// Build a valid frame for the given channel words and status
pub fn encode_record(channels: &[u16], status: u16) -> Vec<u8> {
    let header = channels.len().min(u8::MAX as usize) as u8;
    let mut covered = vec![header];
    for value in channels.iter().take(header as usize) {
        covered.extend_from_slice(&value.to_be_bytes());
    }
    covered.extend_from_slice(&status.to_be_bytes());
    let crc = crc16_modbus(&covered);

    let mut frame = vec![SYNC_1, SYNC_2];
    frame.extend_from_slice(&covered);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    SeekSync1,
    SeekSync2,
    ReadHeader,
    ReadBody { header: u8 },
}

/// Incremental decoder fed one byte at a time by the read loop
#[derive(Debug)]
pub struct BinaryFrameDecoder {
    state: DecoderState,
    body: Vec<u8>,
}

impl Default for BinaryFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryFrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::SeekSync1,
            body: Vec::new(),
        }
    }

    /// Drop any partially read frame and look for a new sync marker
    pub fn reset(&mut self) {
        self.state = DecoderState::SeekSync1;
        self.body.clear();
    }

    /// True while a frame has been started but not completed
    pub fn in_frame(&self) -> bool {
        self.state != DecoderState::SeekSync1
    }

    pub fn feed(&mut self, byte: u8) -> Option<BinaryRecord> {
        match self.state {
            DecoderState::SeekSync1 => {
                if byte == SYNC_1 {
                    self.state = DecoderState::SeekSync2;
                }
                None
            }
            DecoderState::SeekSync2 => {
                self.state = match byte {
                    SYNC_2 => DecoderState::ReadHeader,
                    SYNC_1 => DecoderState::SeekSync2,
                    _ => DecoderState::SeekSync1,
                };
                None
            }
            DecoderState::ReadHeader => {
                self.body.clear();
                self.body.reserve(body_len(byte));
                self.state = DecoderState::ReadBody { header: byte };
                None
            }
            DecoderState::ReadBody { header } => {
                self.body.push(byte);
                if self.body.len() < body_len(header) {
                    return None;
                }
                let record = BinaryRecord::from_parts(header, &self.body);
                self.reset();
                if let Some(record) = &record {
                    if !record.is_valid() {
                        log::debug!(
                            "CRC mismatch on record with {} channels (received {:04x})",
                            header,
                            record.received_crc
                        );
                    }
                }
                record
            }
        }
    }

    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<BinaryRecord> {
        bytes.iter().filter_map(|byte| self.feed(*byte)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus_check_value() {
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_decode_valid_record() {
        let frame = encode_record(&[0x1234, 0xABCD], 0x0001);
        let mut decoder = BinaryFrameDecoder::new();
        let records = decoder.feed_all(&frame);

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.is_valid());
        assert_eq!(record.channels(), vec![0x1234, 0xABCD]);
        assert_eq!(record.status(), 0x0001);

        let words = record.hex_words();
        assert_eq!(&words[..3], &["1234", "abcd", "0001"]);
        assert_eq!(words.len(), 4);
        assert!(record.to_line().ends_with(MARKER_OK));
        assert_eq!(record.to_bytes(), frame);
    }

    #[test]
    fn test_any_payload_flip_fails_crc() {
        let frame = encode_record(&[0x0102, 0x0304, 0x0506], 0x00FF);
        // channels and status; a flipped header changes the frame length instead
        for index in 3..frame.len() - 2 {
            let mut corrupted = frame.clone();
            corrupted[index] ^= 0x01;
            let records = BinaryFrameDecoder::new().feed_all(&corrupted);
            assert_eq!(records.len(), 1, "byte {}", index);
            assert_eq!(records[0].validity, RecordValidity::FailedCrc, "byte {}", index);
            assert!(records[0].to_line().ends_with(MARKER_FAILED));
        }
    }

    #[test]
    fn test_decoder_skips_noise_and_resyncs() {
        let mut stream = vec![0x00, 0xAA, 0x00, 0x13, 0xAA];
        stream.extend(encode_record(&[7], 0));
        stream.extend([0x42, 0x42]);
        stream.extend(encode_record(&[8, 9], 1));

        let records = BinaryFrameDecoder::new().feed_all(&stream);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].channels(), vec![7]);
        assert_eq!(records[1].channels(), vec![8, 9]);
        assert!(records.iter().all(BinaryRecord::is_valid));
    }

    #[test]
    fn test_zero_channel_record() {
        let frame = encode_record(&[], 0xBEEF);
        let records = BinaryFrameDecoder::new().feed_all(&frame);
        assert_eq!(records.len(), 1);
        assert!(records[0].channels().is_empty());
        assert_eq!(records[0].status(), 0xBEEF);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let frame = encode_record(&[1, 2], 3);
        let mut decoder = BinaryFrameDecoder::new();
        assert!(decoder.feed_all(&frame[..5]).is_empty());
        assert!(decoder.in_frame());
        decoder.reset();
        assert!(!decoder.in_frame());
        assert_eq!(decoder.feed_all(&frame).len(), 1);
    }
}
