//! Byte-stream source backing the device node
//!
//! Serves one immutable message through offset-addressed reads. The source
//! keeps no cursor: the caller passes the offset in and advances it by the
//! returned count, so any number of readers can share one source.

use cap_broker::UserBuffer;
use dddk_runtime::{DriverError, Result};
use static_assertions::const_assert_eq;

/// Content served by the device node
pub const MESSAGE: &[u8] = b"Hello from interrupt thread!\n";

// No trailing NUL is served.
const_assert_eq!(MESSAGE.len(), 29);

/// Fixed, immutable message served by offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSource {
    message: &'static [u8],
}

impl MessageSource {
    pub const fn new(message: &'static [u8]) -> Self {
        Self { message }
    }

    /// Message length in bytes
    pub fn len(&self) -> usize {
        self.message.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }

    /// The bytes a read of `max_len` at `offset` delivers
    ///
    /// Empty at or past the end of the message.
    pub fn slice(&self, offset: u64, max_len: usize) -> &'static [u8] {
        let len = self.message.len();
        let start = usize::try_from(offset).map_or(len, |offset| offset.min(len));
        let n = max_len.min(len - start);
        &self.message[start..start + n]
    }

    /// Copy up to `out.capacity()` bytes starting at `offset` into `out`
    ///
    /// Returns the number of bytes delivered; 0 means end of stream. The
    /// caller advances its offset by that amount.
    ///
    /// # Errors
    /// `TransferFailed` if `out` refuses the copy. Nothing is consumed.
    pub fn read(&self, offset: u64, out: &mut dyn UserBuffer) -> Result<usize> {
        let bytes = self.slice(offset, out.capacity());
        if bytes.is_empty() {
            return Ok(0);
        }

        out.write_bytes(bytes).map_err(|_| DriverError::TransferFailed)?;
        Ok(bytes.len())
    }
}

impl Default for MessageSource {
    fn default() -> Self {
        Self::new(MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_broker::{CapabilityError, UserSliceWriter};

    /// User buffer whose pages are not mapped
    struct Unmapped {
        len: usize,
    }

    impl UserBuffer for Unmapped {
        fn capacity(&self) -> usize {
            self.len
        }

        fn write_bytes(&mut self, _src: &[u8]) -> cap_broker::Result<()> {
            Err(CapabilityError::BadAddress)
        }
    }

    fn read(source: &MessageSource, offset: u64, max_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max_len];
        let mut writer = UserSliceWriter::new(&mut buf);
        let n = source.read(offset, &mut writer).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_concrete_reads() {
        let source = MessageSource::default();
        assert_eq!(read(&source, 0, 100), MESSAGE);
        assert_eq!(read(&source, 7, 5), b"rom i");
        assert_eq!(read(&source, 28, 5), b"\n");
        assert!(read(&source, 29, 5).is_empty());
    }

    #[test]
    fn test_every_offset_and_length() {
        let source = MessageSource::default();
        let len = MESSAGE.len();

        for offset in 0..=len + 3 {
            for max_len in 0..=len + 3 {
                let got = read(&source, offset as u64, max_len);
                let start = offset.min(len);
                let expected = &MESSAGE[start..start + max_len.min(len - start)];
                assert_eq!(got, expected, "offset {} max_len {}", offset, max_len);
            }
        }
    }

    #[test]
    fn test_eof_is_stable() {
        let source = MessageSource::default();
        for max_len in [0, 1, 29, 4096] {
            for _ in 0..3 {
                assert!(read(&source, MESSAGE.len() as u64, max_len).is_empty());
            }
        }
        assert!(source.slice(u64::MAX, 10).is_empty());
    }

    #[test]
    fn test_refused_copy_consumes_nothing() {
        let source = MessageSource::default();
        let mut out = Unmapped { len: 8 };
        assert!(matches!(source.read(0, &mut out), Err(DriverError::TransferFailed)));

        // Nothing to copy means nothing to refuse.
        assert_eq!(source.read(MESSAGE.len() as u64, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_partial_reads_reassemble() {
        let source = MessageSource::default();
        let mut offset = 0u64;
        let mut collected = Vec::new();
        loop {
            let chunk = read(&source, offset, 4);
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            collected.extend(chunk);
        }
        assert_eq!(collected, MESSAGE);
        assert_eq!(offset, MESSAGE.len() as u64);
    }
}
