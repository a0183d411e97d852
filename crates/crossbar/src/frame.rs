use crate::error::CorruptStream;

/// Frame length prefix.
pub const LEN_PREFIX_BYTES: usize = core::mem::size_of::<u32>();

/// Frames a payload for the wire: 4-byte LE length, payload bytes, and in
/// extra-size-check mode the same 4-byte length again as a trailer.
pub fn encode_frame(payload: &[u8], extra_size_check: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2 * LEN_PREFIX_BYTES);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    if extra_size_check {
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    }
    out
}

/// Incremental decoder for the inbound byte stream.
///
/// Feed arbitrary chunks through [`write`]; completed payloads come back in
/// wire order. The decoder imposes no payload size cap of its own.
///
/// [`write`]: FrameBuffer::write
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Length of the frame currently being assembled, once the prefix has
    /// been consumed.
    cur_len: Option<usize>,
    extra_size_check: bool,
    messages_ever: u64,
}

impl FrameBuffer {
    pub fn new(extra_size_check: bool) -> Self {
        Self { buf: Vec::new(), cur_len: None, extra_size_check, messages_ever: 0 }
    }

    /// Bytes buffered that have not yet completed a frame.
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Total frames ever completed by this buffer.
    #[inline]
    pub fn messages_ever(&self) -> u64 {
        self.messages_ever
    }

    /// Pushes bytes into the buffer and returns any payloads they completed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, CorruptStream> {
        self.buf.extend_from_slice(bytes);

        let mut completed = Vec::new();
        loop {
            if self.cur_len.is_none() && self.buf.len() >= LEN_PREFIX_BYTES {
                let prefix = u32::from_le_bytes(self.buf[..LEN_PREFIX_BYTES].try_into().unwrap());
                self.buf.drain(..LEN_PREFIX_BYTES);
                self.cur_len = Some(prefix as usize);
            }

            let Some(len) = self.cur_len else { return Ok(completed) };

            let needed = if self.extra_size_check { len + LEN_PREFIX_BYTES } else { len };
            if self.buf.len() < needed {
                return Ok(completed);
            }

            if self.extra_size_check {
                let found =
                    u32::from_le_bytes(self.buf[len..len + LEN_PREFIX_BYTES].try_into().unwrap());
                if found as usize != len {
                    return Err(CorruptStream { expected: len as u32, found });
                }
            }

            completed.push(self.buf[..len].to_vec());
            self.buf.drain(..needed);
            self.cur_len = None;
            self.messages_ever += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(frame: &[u8], extra: bool) -> Vec<Vec<u8>> {
        let mut buf = FrameBuffer::new(extra);
        buf.write(frame).unwrap()
    }

    #[test]
    fn roundtrip() {
        for extra in [false, true] {
            let payload = b"hello bus".to_vec();
            let decoded = decode_all(&encode_frame(&payload, extra), extra);
            assert_eq!(decoded, vec![payload]);
        }
    }

    #[test]
    fn empty_payload_roundtrips() {
        for extra in [false, true] {
            let decoded = decode_all(&encode_frame(b"", extra), extra);
            assert_eq!(decoded, vec![Vec::<u8>::new()]);
        }
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut buf = FrameBuffer::new(true);
        let frame = encode_frame(b"fragmented", true);

        let mut decoded = Vec::new();
        for byte in &frame {
            decoded.extend(buf.write(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(decoded, vec![b"fragmented".to_vec()]);
        assert_eq!(buf.pending_bytes(), 0);
    }

    #[test]
    fn several_frames_in_one_write() {
        let mut wire = encode_frame(b"one", true);
        wire.extend(encode_frame(b"", true));
        wire.extend(encode_frame(b"three", true));

        let mut buf = FrameBuffer::new(true);
        let decoded = buf.write(&wire).unwrap();
        assert_eq!(decoded, vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]);
        assert_eq!(buf.messages_ever(), 3);
    }

    #[test]
    fn corrupt_trailing_length_is_rejected() {
        let mut frame = encode_frame(b"payload", true);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        let mut buf = FrameBuffer::new(true);
        let err = buf.write(&frame).unwrap_err();
        assert_eq!(err.expected, 7);
        assert_ne!(err.found, 7);
    }

    #[test]
    fn corrupt_leading_length_desyncs_the_stream() {
        let mut frame = encode_frame(b"payload", true);
        // lie about the length; the trailer check catches the desync
        frame[0] ^= 0x02;

        let mut buf = FrameBuffer::new(true);
        assert!(buf.write(&frame).is_err());
    }
}
