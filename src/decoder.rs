use crate::error::StreamError;

/// Turns transport bytes into text without splitting multi-byte characters.
///
/// A chunk that ends partway through a UTF-8 sequence keeps the incomplete
/// tail (at most 3 bytes) and prepends it to the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
    /// Total bytes consumed so far, for error offsets.
    consumed: usize,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<String, StreamError> {
        let mut input = std::mem::take(&mut self.carry);
        input.extend_from_slice(bytes);
        let base = self.consumed;

        match String::from_utf8(input) {
            Ok(text) => {
                self.consumed += text.len();
                Ok(text)
            }
            Err(e) => {
                let err = e.utf8_error();
                if err.error_len().is_some() {
                    return Err(StreamError::InvalidUtf8 {
                        offset: base + err.valid_up_to(),
                    });
                }
                // Truncated sequence at the very end: wait for more bytes.
                let valid = err.valid_up_to();
                let mut bytes = e.into_bytes();
                self.carry = bytes.split_off(valid);
                self.consumed += valid;
                String::from_utf8(bytes).map_err(|e| StreamError::InvalidUtf8 {
                    offset: base + e.utf8_error().valid_up_to(),
                })
            }
        }
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn carried(&self) -> usize {
        self.carry.len()
    }

    /// End of input. Leftover bytes are a truncated character.
    pub fn finish(self) -> Result<(), StreamError> {
        if self.carry.is_empty() {
            Ok(())
        } else {
            Err(StreamError::InvalidUtf8 {
                offset: self.consumed,
            })
        }
    }
}
