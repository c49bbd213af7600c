use crate::serial::protocol::{self, FrameAssembler, NONE_PARAM};
use crate::telemetry::types::InboundMessage;

/// Classify a decoded payload. Payloads missing their mandatory
/// parameters yield `None`.
pub fn classify(payload: &str) -> Option<InboundMessage> {
    let (tag, rest) = protocol::next_param(payload);
    match tag {
        NONE_PARAM => None,
        "r" => {
            let (key, _) = protocol::next_param(rest);
            (key != NONE_PARAM).then(|| InboundMessage::Ack { key: key.to_string() })
        }
        "v" => {
            let (name, rest) = protocol::next_param(rest);
            let (raw, _) = protocol::next_param(rest);
            if name == NONE_PARAM || raw == NONE_PARAM {
                return None;
            }
            Some(InboundMessage::Value {
                name: name.to_string(),
                raw: raw.to_string(),
                value: raw.parse::<f64>().ok(),
            })
        }
        "e" => {
            let (message, _) = protocol::next_param(rest);
            (message != NONE_PARAM).then(|| InboundMessage::DeviceError {
                message: message.to_string(),
            })
        }
        tag => Some(InboundMessage::Other {
            tag: tag.to_string(),
            params: protocol::params(rest).map(str::to_string).collect(),
        }),
    }
}

/// Turns received chunks of one link into payloads
#[derive(Debug, Clone)]
pub enum InboundDecoder {
    /// Each chunk stands alone; frames split across reads are lost
    PerRead,
    /// Unterminated frames are carried over to the next chunk
    Buffered(FrameAssembler),
}

impl InboundDecoder {
    pub fn new(buffer_partial_frames: bool) -> Self {
        if buffer_partial_frames {
            InboundDecoder::Buffered(FrameAssembler::default())
        } else {
            InboundDecoder::PerRead
        }
    }

    pub fn payloads(&mut self, data: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(data);
        match self {
            InboundDecoder::PerRead => protocol::decode_all(&text),
            InboundDecoder::Buffered(assembler) => assembler.push(&text),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<InboundMessage> {
        self.payloads(data)
            .iter()
            .filter_map(|payload| classify(payload))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::protocol::encode;

    #[test]
    fn test_classify_ack() {
        assert_eq!(
            classify("r|PSET|"),
            Some(InboundMessage::Ack { key: "PSET".into() })
        );
        assert_eq!(classify("r|"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn test_classify_value() {
        assert_eq!(
            classify("v|PVBIN|250000|"),
            Some(InboundMessage::Value {
                name: "PVBIN".into(),
                raw: "250000".into(),
                value: Some(250_000.0)
            })
        );
        assert_eq!(
            classify("v|MD|left|"),
            Some(InboundMessage::Value {
                name: "MD".into(),
                raw: "left".into(),
                value: None
            })
        );
        assert_eq!(classify("v|PVBIN|"), None);
    }

    #[test]
    fn test_classify_error_and_other() {
        assert_eq!(
            classify("e|NOINPUT|"),
            Some(InboundMessage::DeviceError { message: "NOINPUT".into() })
        );
        assert_eq!(
            classify("x|a|b|"),
            Some(InboundMessage::Other {
                tag: "x".into(),
                params: vec!["a".into(), "b".into()]
            })
        );
    }

    #[test]
    fn test_per_read_decoder_drops_split_frames() {
        let frame = encode("r", &["PSET"]);
        let (head, tail) = frame.split_at(5);
        let mut decoder = InboundDecoder::new(false);
        assert!(decoder.feed(head.as_bytes()).is_empty());
        assert!(decoder.feed(tail.as_bytes()).is_empty());
    }

    #[test]
    fn test_buffered_decoder_joins_split_frames() {
        let frame = encode("r", &["PSET"]);
        let (head, tail) = frame.split_at(5);
        let mut decoder = InboundDecoder::new(true);
        assert!(decoder.feed(head.as_bytes()).is_empty());
        let messages = decoder.feed(format!("{}\r\n", tail).as_bytes());
        assert_eq!(messages, vec![InboundMessage::Ack { key: "PSET".into() }]);
    }
}
