//! Line framing for server traffic.
//!
//! Servers pass on whatever bytes their clients send, so a line is decoded
//! lossily rather than rejected when it is not UTF-8.

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::debug;

pub struct IrcLineCodec {
    max_length: usize,
    /// Inside an overlong line, dropping bytes until its newline
    discarding: bool,
}

impl IrcLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            discarding: false,
        }
    }
}

fn to_line(raw: &[u8]) -> String {
    let raw = match raw {
        [rest @ .., b'\r'] => rest,
        _ => raw,
    };
    String::from_utf8_lossy(raw).into_owned()
}

impl Decoder for IrcLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let Some(end) = buf.iter().position(|b| *b == b'\n') else {
                if buf.len() > self.max_length {
                    buf.clear();
                    self.discarding = true;
                }
                return Ok(None);
            };
            let frame = buf.split_to(end + 1);
            if self.discarding || end > self.max_length {
                self.discarding = false;
                debug!("Skipping overlong line");
                continue;
            }
            return Ok(Some(to_line(&frame[..end])));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() || self.discarding {
            buf.clear();
            return Ok(None);
        }
        let frame = buf.split_to(buf.len());
        Ok(Some(to_line(&frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut IrcLineCodec, input: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(input);
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn latin1_bytes_do_not_break_framing() {
        let mut codec = IrcLineCodec::new(512);
        let lines = decode_all(
            &mut codec,
            b":bob!b@h PRIVMSG #lounge :caf\xe9\r\n:bob!b@h PRIVMSG #lounge :still here\r\n",
        );
        assert_eq!(
            lines,
            vec![
                ":bob!b@h PRIVMSG #lounge :caf\u{fffd}".to_string(),
                ":bob!b@h PRIVMSG #lounge :still here".to_string(),
            ]
        );
    }

    #[test]
    fn overlong_lines_are_skipped() {
        let mut codec = IrcLineCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789abcdef"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"tail\nPING :x\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("PING :x".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn unterminated_last_line_is_kept_at_eof() {
        let mut codec = IrcLineCodec::new(512);
        let mut buf = BytesMut::from(&b"ERROR :Closing link"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some("ERROR :Closing link".to_string())
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
