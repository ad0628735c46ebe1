//! Slice-based STOMP 1.2 frame parser.
//!
//! The parser never consumes input itself: it reports how many bytes a
//! complete frame occupied so the codec can advance its buffer.

/// A frame as it appears on the wire, before header unescaping and UTF-8
/// validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    /// Number of input bytes the frame occupied, including the NUL
    /// terminator and an optional trailing LF.
    pub consumed: usize,
}

type ParseResult = Result<Option<RawFrame>, String>;

/// Extract the `content-length` header value, if present.
fn content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, String> {
    let Some((_, v)) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(b"content-length"))
    else {
        return Ok(None);
    };
    let s = std::str::from_utf8(v).map_err(|e| format!("content-length not utf8: {}", e))?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("empty content-length".to_string());
    }
    trimmed
        .parse::<usize>()
        .map(Some)
        .map_err(|e| format!("invalid content-length '{}': {}", trimmed, e))
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

/// Skip the optional LF following a frame's NUL terminator.
fn skip_trailing_lf(input: &[u8], pos: usize) -> usize {
    if input.get(pos) == Some(&b'\n') {
        pos + 1
    } else {
        pos
    }
}

/// Parse a single STOMP frame from the start of `input`.
///
/// Returns `Ok(Some(frame))` for a complete frame, `Ok(None)` when more
/// bytes are required and `Err` on protocol violations.
pub fn parse_frame_slice(input: &[u8]) -> ParseResult {
    let len = input.len();
    let mut pos = input.iter().take_while(|&&b| b == b'\n').count();

    let Some(cmd_end) = input[pos..].iter().position(|&b| b == b'\n') else {
        if input[pos..].contains(&0) {
            return Err("frame terminated before end of command line".to_string());
        }
        return Ok(None);
    };
    let command = strip_cr(&input[pos..pos + cmd_end]).to_vec();
    if command.contains(&0) {
        return Err(format!(
            "NUL inside command line: {:?}",
            String::from_utf8_lossy(&command)
        ));
    }
    pos += cmd_end + 1;

    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        if pos >= len {
            return Ok(None);
        }
        if input[pos] == b'\n' {
            pos += 1;
            break;
        }
        if input[pos] == b'\r' && input.get(pos + 1) == Some(&b'\n') {
            pos += 2;
            break;
        }
        let Some(line_end) = input[pos..].iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = strip_cr(&input[pos..pos + line_end]);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(format!(
                "malformed header line: {:?}",
                String::from_utf8_lossy(line)
            ));
        };
        headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec()));
        pos += line_end + 1;
    }

    match content_length(&headers)? {
        Some(n) => {
            let Some(end) = pos.checked_add(n).and_then(|e| e.checked_add(1)) else {
                return Err(format!("content-length {} out of range", n));
            };
            if end > len {
                return Ok(None);
            }
            let body = input[pos..pos + n].to_vec();
            pos += n;
            if input[pos] != 0 {
                return Err("missing NUL terminator after content-length body".to_string());
            }
            let consumed = skip_trailing_lf(input, pos + 1);
            Ok(Some(RawFrame {
                command,
                headers,
                body,
                consumed,
            }))
        }
        None => {
            let Some(nul) = input[pos..].iter().position(|&b| b == 0) else {
                return Ok(None);
            };
            let body = input[pos..pos + nul].to_vec();
            let consumed = skip_trailing_lf(input, pos + nul + 1);
            Ok(Some(RawFrame {
                command,
                headers,
                body,
                consumed,
            }))
        }
    }
}

/// Undo STOMP 1.2 header escaping (`\\`, `\r`, `\n`, `\c`).
///
/// Any other escape sequence, or a trailing lone backslash, is an error.
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b'c') => out.push(b':'),
            Some(&other) => {
                return Err(format!("undefined escape sequence '\\{}'", other as char));
            }
            None => return Err("trailing backslash in header".to_string()),
        }
    }
    Ok(out)
}
