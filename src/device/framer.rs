//! Length-prefixed framer for the MeshCore companion link.
//!
//! Both serial and TCP carry frames as:
//!
//!   `<marker><u16 little-endian length><payload>`
//!
//! where the marker is `>` (0x3e) for frames from the radio and `<` (0x3c)
//! for frames to it. [`CompanionFramer`] is fed arbitrary chunks and yields
//! whole inbound payloads. Garbage (boot banners, debug text) before a marker
//! is skipped, and an impossible length drops the marker byte and resyncs.
use bytes::{Buf, BytesMut};

pub const INBOUND_MARKER: u8 = b'>';
pub const OUTBOUND_MARKER: u8 = b'<';

/// Largest payload the companion firmware emits; anything bigger is noise.
pub const MAX_FRAME_SIZE: usize = 512;

pub struct CompanionFramer {
    buf: BytesMut,
    skipped: usize,
}

impl Default for CompanionFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl CompanionFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while hunting for a frame marker.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete inbound payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|&b| b == INBOUND_MARKER) {
                Some(0) => {}
                Some(n) => {
                    self.buf.advance(n);
                    self.skipped += n;
                }
                None => {
                    self.skipped += self.buf.len();
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 3 {
                return None;
            }
            let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;
            if len == 0 || len > MAX_FRAME_SIZE {
                self.buf.advance(1);
                self.skipped += 1;
                continue;
            }
            if self.buf.len() < 3 + len {
                return None;
            }
            self.buf.advance(3);
            return Some(self.buf.split_to(len).to_vec());
        }
    }
}

/// Wrap an outbound payload for the wire.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(OUTBOUND_MARKER);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(payload: &[u8]) -> Vec<u8> {
        let mut v = vec![INBOUND_MARKER];
        v.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn yields_frames_split_across_chunks() {
        let mut f = CompanionFramer::new();
        let wire = inbound(&[0x0c, 0x10, 0x0e]);
        f.push(&wire[..2]);
        assert!(f.next_frame().is_none());
        f.push(&wire[2..]);
        assert_eq!(f.next_frame(), Some(vec![0x0c, 0x10, 0x0e]));
        assert!(f.next_frame().is_none());
    }

    #[test]
    fn skips_banner_text_before_marker() {
        let mut f = CompanionFramer::new();
        f.push(b"boot ok\r\n");
        f.push(&inbound(&[0x83]));
        assert_eq!(f.next_frame(), Some(vec![0x83]));
        assert_eq!(f.skipped(), 9);
    }

    #[test]
    fn oversize_length_resyncs() {
        let mut f = CompanionFramer::new();
        f.push(&[INBOUND_MARKER, 0xff, 0xff]);
        f.push(&inbound(&[0x00]));
        assert_eq!(f.next_frame(), Some(vec![0x00]));
    }

    #[test]
    fn back_to_back_frames() {
        let mut f = CompanionFramer::new();
        let mut wire = inbound(&[0x0a]);
        wire.extend(inbound(&[0x83]));
        f.push(&wire);
        assert_eq!(f.next_frame(), Some(vec![0x0a]));
        assert_eq!(f.next_frame(), Some(vec![0x83]));
        assert_eq!(f.buffered(), 0);
    }

    #[test]
    fn outbound_frames_use_send_marker() {
        assert_eq!(encode_frame(&[0x14]), vec![OUTBOUND_MARKER, 1, 0, 0x14]);
    }
}
