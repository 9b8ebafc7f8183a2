//! Plain-text ping parser.

/// Longest line accepted before the buffer is discarded.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Parsed plain-text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// The literal token `ping`.
    Ping,
    /// Any other line.
    Invalid(Vec<u8>),
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Parsed a command, with bytes consumed (including the newline).
    Complete(Command, usize),
    /// Need more data.
    Incomplete,
    /// No newline within `MAX_LINE_LENGTH` bytes.
    Overlong,
}

/// Parse one newline terminated message from the input buffer.
pub fn parse(input: &[u8]) -> ParseResult {
    let (line, consumed) = match split_line(input) {
        Some(split) => split,
        None if input.len() > MAX_LINE_LENGTH => return ParseResult::Overlong,
        None => return ParseResult::Incomplete,
    };

    if line == PING {
        ParseResult::Complete(Command::Ping, consumed)
    } else {
        ParseResult::Complete(Command::Invalid(line.to_vec()), consumed)
    }
}

/// The request token.
pub const PING: &[u8] = b"ping";

/// The reply token.
pub const PONG: &[u8] = b"pong";

/// Format a PONG response.
pub fn response_pong() -> &'static [u8] {
    b"pong\n"
}

/// Format a PING request.
pub fn request_ping() -> &'static [u8] {
    b"ping\n"
}

/// Split the first line off `buffer`.
///
/// Returns the line without its terminator (`\n` or `\r\n`) and the number of
/// bytes consumed.
pub fn split_line(buffer: &[u8]) -> Option<(&[u8], usize)> {
    let end = buffer.iter().position(|&b| b == b'\n')?;
    let line = &buffer[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        match parse(b"ping\n") {
            ParseResult::Complete(Command::Ping, 5) => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"ping\r\n") {
            ParseResult::Complete(Command::Ping, 6) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_ping_is_case_sensitive() {
        match parse(b"PING\n") {
            ParseResult::Complete(Command::Invalid(line), 5) => assert_eq!(line, b"PING"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_line() {
        match parse(b"hello there\nping\n") {
            ParseResult::Complete(Command::Invalid(line), 12) => {
                assert_eq!(line, b"hello there");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        match parse(b"pin") {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_overlong() {
        let input = vec![b'x'; MAX_LINE_LENGTH + 1];
        match parse(&input) {
            ParseResult::Overlong => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_split_line() {
        assert_eq!(split_line(b"pong\nrest"), Some((&b"pong"[..], 5)));
        assert_eq!(split_line(b"\n"), Some((&b""[..], 1)));
        assert_eq!(split_line(b"pong"), None);
    }
}
