//! DNS-over-stream framing: each message is prefixed with its length as a
//! big-endian u16 (RFC 1035 §4.2.2).

/// Prepends the length prefix.
pub(crate) fn encode(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// True when `buf` starts with one complete frame.
pub(crate) fn has_complete(buf: &[u8]) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    buf.len() >= 2 + len
}

/// Takes the first complete frame out of `buf`, copying it into `out`.
///
/// Returns the number of bytes copied (the frame is truncated if `out` is
/// smaller), or `None` when no complete frame is buffered yet.
pub(crate) fn extract(buf: &mut Vec<u8>, out: &mut [u8]) -> Option<usize> {
    if !has_complete(buf) {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let copied = len.min(out.len());
    out[..copied].copy_from_slice(&buf[2..2 + copied]);
    buf.drain(..2 + len);
    Some(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_length() {
        assert_eq!(encode(b"abc"), vec![0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn extract_requires_complete_frame() {
        let mut out = [0u8; 16];

        let mut buf = vec![0, 3, b'a'];
        assert_eq!(extract(&mut buf, &mut out), None);

        buf.extend_from_slice(b"bc");
        assert_eq!(extract(&mut buf, &mut out), Some(3));
        assert_eq!(&out[..3], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn extract_leaves_following_frames_in_place() {
        let mut buf = encode(b"first");
        buf.extend_from_slice(&encode(b"second"));
        let mut out = [0u8; 16];

        assert_eq!(extract(&mut buf, &mut out), Some(5));
        assert_eq!(&out[..5], b"first");
        assert_eq!(extract(&mut buf, &mut out), Some(6));
        assert_eq!(&out[..6], b"second");
        assert_eq!(extract(&mut buf, &mut out), None);
    }

    #[test]
    fn oversized_frame_is_truncated_but_fully_drained() {
        let mut buf = encode(b"0123456789");
        let mut out = [0u8; 4];

        assert_eq!(extract(&mut buf, &mut out), Some(4));
        assert_eq!(&out, b"0123");
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_frame_is_valid() {
        let mut buf = encode(b"");
        let mut out = [0u8; 4];

        assert_eq!(extract(&mut buf, &mut out), Some(0));
        assert!(buf.is_empty());
    }
}
