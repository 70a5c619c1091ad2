/// Streaming decoder for terminal output.
///
/// Terminal reads split multi-byte characters arbitrarily. An incomplete
/// trailing sequence is held back until the next chunk completes it. A chunk
/// that is not UTF-8 at all is passed through untouched as raw bytes, so the
/// client always sees exactly what the process wrote.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

/// One decoded piece of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Text(String),
    Binary(Vec<u8>),
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, returning None while everything is still held back
    pub fn decode(&mut self, chunk: &[u8]) -> Option<Decoded> {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        if let Err(e) = std::str::from_utf8(&input).map(|_| ()) {
            if e.error_len().is_some() {
                return Some(Decoded::Binary(input));
            }
            self.pending = input.split_off(e.valid_up_to());
        }

        if input.is_empty() {
            return None;
        }
        match String::from_utf8(input) {
            Ok(text) => Some(Decoded::Text(text)),
            Err(e) => Some(Decoded::Binary(e.into_bytes())),
        }
    }

    /// Flush a dangling partial sequence, if any
    pub fn finish(&mut self) -> Option<Decoded> {
        let pending = std::mem::take(&mut self.pending);
        (!pending.is_empty()).then_some(Decoded::Binary(pending))
    }
}
