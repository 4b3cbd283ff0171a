//! `multipart/x-mixed-replace` framing for MJPEG streams.
//!
//! The relay writes one part per frame with [`encode_part`]; the producer
//! reads camera streams in the same framing with [`MultipartParser`].

use bytes::{Buf, Bytes, BytesMut};

/// Value of the `Content-Type` header on a stream response.
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const BOUNDARY: &[u8] = b"--frame\r\n";
const PART_HEADERS: &[u8] = b"Content-Type: image/jpeg\r\n\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const PART_END: &[u8] = b"\r\n";

/// Frame one JPEG as a stream part:
/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(BOUNDARY.len() + PART_HEADERS.len() + jpeg.len() + PART_END.len());
    buf.extend_from_slice(BOUNDARY);
    buf.extend_from_slice(PART_HEADERS);
    buf.extend_from_slice(jpeg);
    buf.extend_from_slice(PART_END);
    buf.freeze()
}

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting body bytes until the next boundary.
    CollectingBody,
}

/// Incremental parser that turns arbitrary byte chunks of a multipart
/// stream into complete part bodies.
///
/// A body is only emitted once the boundary that follows it has arrived,
/// so the most recent part stays buffered until the next one starts.
#[derive(Debug)]
pub struct MultipartParser {
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` from which to resume the boundary search.
    scan_from: usize,
}

impl MultipartParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    /// Feed the next chunk and return every body it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        self.buffer.advance(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the boundary spans chunks.
                        if self.buffer.len() > BOUNDARY.len() {
                            let excess = self.buffer.len() - BOUNDARY.len();
                            self.buffer.advance(excess);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        self.buffer.advance(pos + HEADER_END.len());
                        self.scan_from = 0;
                        self.state = ParseState::CollectingBody;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingBody => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], BOUNDARY)
                    else {
                        self.scan_from = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    };
                    let boundary_at = self.scan_from + pos;
                    let body_end = if self.buffer[..boundary_at].ends_with(PART_END) {
                        boundary_at - PART_END.len()
                    } else {
                        boundary_at
                    };

                    let part = self.buffer.split_to(boundary_at + BOUNDARY.len()).freeze();
                    let body = part.slice(..body_end);
                    if !body.is_empty() {
                        parts.push(body);
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        parts
    }
}

impl Default for MultipartParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_framing_is_byte_exact() {
        let part = encode_part(&[0xFF, 0xD8, 0xAA, 0xFF, 0xD9]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xAA, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(part.as_ref(), expected.as_slice());
    }

    #[test]
    fn parser_waits_for_following_boundary() {
        let mut parser = MultipartParser::new();
        assert!(parser.push(&encode_part(b"first")).is_empty());
        let parts = parser.push(&encode_part(b"second"));
        assert_eq!(parts, vec![Bytes::from_static(b"first")]);
    }

    #[test]
    fn parser_handles_parts_split_across_chunks() {
        let mut stream = Vec::new();
        for body in [&b"alpha-jpeg"[..], b"beta-jpeg", b"gamma-jpeg", b"delta"] {
            stream.extend_from_slice(&encode_part(body));
        }

        let mut parser = MultipartParser::new();
        let mut parts = Vec::new();
        for chunk in stream.chunks(7) {
            parts.extend(parser.push(chunk));
        }

        assert_eq!(
            parts,
            vec![
                Bytes::from_static(b"alpha-jpeg"),
                Bytes::from_static(b"beta-jpeg"),
                Bytes::from_static(b"gamma-jpeg"),
            ]
        );
    }

    #[test]
    fn parser_skips_preamble_and_extra_headers() {
        let mut parser = MultipartParser::new();
        let mut stream = b"HTTP noise before the first boundary".to_vec();
        stream.extend_from_slice(
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nbody\r\n",
        );
        stream.extend_from_slice(b"--frame\r\n");
        assert_eq!(parser.push(&stream), vec![Bytes::from_static(b"body")]);
    }
}
