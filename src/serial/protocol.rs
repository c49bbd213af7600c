//! Text frame codec for the controller firmware.
//!
//! A frame looks like `<tag|p1|p2|C>`: the payload is pipe separated, always
//! ends with `|`, and is followed by a single checksum character
//! `C = chr(90 - (sum of payload chars) mod 26)`, so `C` is always `A..=Z`.

/// Returned by [`next_param`] when nothing is left to read
pub const NONE_PARAM: &str = "NONE";

pub const FRAME_START: char = '<';
pub const FRAME_END: char = '>';
pub const PARAM_SEPARATOR: char = '|';

/// Upper bound for bytes held by a [`FrameAssembler`] between reads
pub const DEFAULT_ASSEMBLER_CAPACITY: usize = 4096;

/// Checksum character for a payload that already carries its trailing `|`
pub fn checksum_char(payload: &str) -> char {
    let sum: u32 = payload.chars().map(|c| c as u32).sum();
    // 90 - (0..=25) stays within 'A'..='Z'
    char::from(b'Z' - (sum % 26) as u8)
}

/// Frame a raw `tag|p1|p2` string. A trailing `|` is added before the checksum.
pub fn encode_payload(payload: &str) -> String {
    let mut body = String::with_capacity(payload.len() + 4);
    body.push_str(payload);
    body.push(PARAM_SEPARATOR);
    let check = checksum_char(&body);

    let mut frame = String::with_capacity(body.len() + 3);
    frame.push(FRAME_START);
    frame.push_str(&body);
    frame.push(check);
    frame.push(FRAME_END);
    frame
}

/// Build a wire frame from a tag and its parameters
pub fn encode<S: AsRef<str>>(tag: &str, params: &[S]) -> String {
    let mut payload = String::from(tag);
    for param in params {
        payload.push(PARAM_SEPARATOR);
        payload.push_str(param.as_ref());
    }
    encode_payload(&payload)
}

/// True when the buffer holds a `<` that comes before the first `>`
pub fn frame_available(buffer: &str) -> bool {
    match (buffer.find(FRAME_START), buffer.find(FRAME_END)) {
        (Some(start), Some(end)) => start < end,
        _ => false,
    }
}

/// Validate the first frame in `buffer` and return its payload with the
/// trailing `|` kept and the checksum character removed.
///
/// Returns `None` when there is no `<` before the first `>` or when the
/// checksum does not match.
pub fn decode(buffer: &str) -> Option<String> {
    let start = buffer.find(FRAME_START)?;
    let end = buffer.find(FRAME_END)?;
    if start > end {
        return None;
    }
    check_frame_body(&buffer[start + 1..end])
}

fn check_frame_body(body: &str) -> Option<String> {
    let mut chars = body.chars();
    let received = chars.next_back()?;
    let payload = chars.as_str();
    if checksum_char(payload) != received {
        log::trace!("Dropping frame with bad checksum: <{}>", body);
        return None;
    }
    Some(payload.to_string())
}

/// Split off the first parameter. An empty payload yields [`NONE_PARAM`].
pub fn next_param(payload: &str) -> (&str, &str) {
    if payload.is_empty() {
        return (NONE_PARAM, "");
    }
    match payload.split_once(PARAM_SEPARATOR) {
        Some((param, rest)) => (param, rest),
        None => (payload, ""),
    }
}

/// Iterate over the parameters of a decoded payload until it runs dry
pub fn params(payload: &str) -> Params<'_> {
    Params { rest: payload }
}

pub struct Params<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Params<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let (param, rest) = next_param(self.rest);
        self.rest = rest;
        Some(param)
    }
}

/// Decode every complete frame in one read, left to right.
///
/// Each located `<...>` pair is consumed whether or not its checksum holds;
/// bytes after the last `>` are dropped.
pub fn decode_all(buffer: &str) -> Vec<String> {
    let (payloads, _) = scan_frames(buffer);
    payloads
}

/// Returns the valid payloads and the byte offset of an unterminated `<` tail
fn scan_frames(buffer: &str) -> (Vec<String>, Option<usize>) {
    let mut payloads = Vec::new();
    let mut offset = 0;

    while let Some(rel_start) = buffer[offset..].find(FRAME_START) {
        let start = offset + rel_start;
        let Some(rel_end) = buffer[start..].find(FRAME_END) else {
            return (payloads, Some(start));
        };
        let end = start + rel_end;
        if let Some(payload) = check_frame_body(&buffer[start + 1..end]) {
            payloads.push(payload);
        }
        offset = end + 1;
    }

    (payloads, None)
}

/// Reassembles frames that arrive split across several reads.
///
/// Holds at most one unterminated `<...` tail. When the tail outgrows the
/// capacity the oldest bytes are dropped.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    pending: String,
    capacity: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_ASSEMBLER_CAPACITY)
    }
}

impl FrameAssembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: String::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);

        let (payloads, tail) = scan_frames(&self.pending);
        match tail {
            Some(start) => {
                self.pending.drain(..start);
                self.trim();
            }
            None => self.pending.clear(),
        }
        payloads
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn trim(&mut self) {
        if self.pending.len() <= self.capacity {
            return;
        }
        let mut cut = self.pending.len() - self.capacity;
        while !self.pending.is_char_boundary(cut) {
            cut += 1;
        }
        log::debug!("Frame assembler over capacity, dropping {} bytes", cut);
        self.pending.drain(..cut);
        // Without its opening `<` the remainder can never complete a frame
        match self.pending.find(FRAME_START) {
            Some(start) => {
                self.pending.drain(..start);
            }
            None => self.pending.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_setpoint_frame() {
        assert_eq!(encode("s", &["PSET", "300000"]), "<s|PSET|300000|X>");
        assert_eq!(encode_payload("s|ES"), "<s|ES|E>");
        assert_eq!(encode::<&str>("r", &[]), encode_payload("r"));
    }

    #[test]
    fn test_decode_keeps_trailing_separator() {
        let frame = encode("s", &["PSET", "300000"]);
        assert_eq!(decode(&frame).as_deref(), Some("s|PSET|300000|"));
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        assert_eq!(decode("<s|PSET|300000|A>"), None);
        assert_eq!(decode("<s|PSET|300001|X>"), None);
    }

    #[test]
    fn test_decode_requires_open_before_close() {
        assert_eq!(decode("s|ES|E>"), None);
        assert_eq!(decode("<s|ES|E"), None);
        assert_eq!(decode("><s|ES|E>"), None);
        assert_eq!(decode(""), None);
        assert_eq!(decode("<>"), None);
    }

    #[test]
    fn test_decode_ignores_surrounding_noise() {
        let line = format!("junk {}\r\n", encode("r", &["PSET"]));
        assert_eq!(decode(&line).as_deref(), Some("r|PSET|"));
    }

    #[test]
    fn test_next_param() {
        assert_eq!(next_param("r|PSET|"), ("r", "PSET|"));
        assert_eq!(next_param("PSET|"), ("PSET", ""));
        assert_eq!(next_param("PSET"), ("PSET", ""));
        assert_eq!(next_param(""), (NONE_PARAM, ""));
    }

    #[test]
    fn test_params_iterator() {
        let collected: Vec<&str> = params("v|PV|12.5|").collect();
        assert_eq!(collected, vec!["v", "PV", "12.5"]);
        assert_eq!(params("").count(), 0);
    }

    #[test]
    fn test_decode_all_multiple_frames() {
        let buffer = format!(
            "{}{}<s|bad|A>{}<partial",
            encode("r", &["PSET"]),
            encode("v", &["PV", "1"]),
            encode("e", &["OVERPRESSURE"])
        );
        let payloads = decode_all(&buffer);
        assert_eq!(payloads, vec!["r|PSET|", "v|PV|1|", "e|OVERPRESSURE|"]);
    }

    #[test]
    fn test_assembler_joins_split_frame() {
        let frame = encode("r", &["KAL"]);
        let (head, tail) = frame.split_at(4);

        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(head).is_empty());
        assert_eq!(assembler.pending(), head);
        assert_eq!(assembler.push(tail), vec!["r|KAL|".to_string()]);
        assert!(assembler.pending().is_empty());
    }

    #[test]
    fn test_assembler_drops_noise_without_frame_start() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push("noise\r\n").is_empty());
        assert!(assembler.pending().is_empty());
    }

    #[test]
    fn test_assembler_is_bounded() {
        let mut assembler = FrameAssembler::new(8);
        assembler.push("<0123456789abcdef");
        assert!(assembler.pending().len() <= 8);

        // the truncated tail lost its `<`, so the next complete frame still decodes
        let frame = encode("r", &["PSET"]);
        assert_eq!(assembler.push(&frame), vec!["r|PSET|".to_string()]);
    }
}
