use crate::http::body::BodyFraming;
use crate::http::headers::Headers;
use crate::http::request::{Method, Request, RequestBody};
use crate::http::response::{ResponseHead, StatusCode};

/// Upper bound on a request or response head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    InvalidStatus,
    UnsupportedTransferEncoding,
    HeadTooLarge,
    Incomplete,
}

/// Parses a request line and headers.
///
/// Returns the request with an empty body, how its body is framed, and the
/// number of bytes the head occupied. The body is read separately.
pub fn parse_request_head(buf: &[u8]) -> Result<(Request, BodyFraming, usize), ParseError> {
    // Look for header/body separator
    let headers_end = match find_headers_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEAD_SIZE => return Err(ParseError::HeadTooLarge),
        None => return Err(ParseError::Incomplete),
    };
    if headers_end > MAX_HEAD_SIZE {
        return Err(ParseError::HeadTooLarge);
    }

    let headers_str =
        std::str::from_utf8(&buf[..headers_end]).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    let headers = parse_header_lines(lines)?;
    let framing = request_framing(&headers)?;

    let request = Request {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body: RequestBody::Empty,
        peer: None,
    };

    Ok((request, framing, headers_end + 4))
}

/// Transfer-Encoding wins over Content-Length. Only plain `chunked` is
/// decoded.
fn request_framing(headers: &Headers) -> Result<BodyFraming, ParseError> {
    if headers.contains("Transfer-Encoding") {
        let codings: Vec<&str> = headers
            .get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|coding| !coding.is_empty())
            .collect();
        return match codings.as_slice() {
            [coding] if coding.eq_ignore_ascii_case("chunked") => Ok(BodyFraming::Chunked),
            _ => Err(ParseError::UnsupportedTransferEncoding),
        };
    }

    let mut lengths = headers.get_all("Content-Length").map(|v| {
        v.trim()
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidContentLength)
    });
    let Some(length) = lengths.next().transpose()? else {
        return Ok(BodyFraming::None);
    };
    for other in lengths {
        if other? != length {
            return Err(ParseError::InvalidContentLength);
        }
    }

    Ok(if length == 0 {
        BodyFraming::None
    } else {
        BodyFraming::Length(length)
    })
}

/// Parses a response status line and headers.
///
/// Returns the head and the number of bytes it occupied; the body, if any,
/// starts right after.
pub fn parse_response_head(buf: &[u8]) -> Result<(ResponseHead, usize), ParseError> {
    let headers_end = match find_headers_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEAD_SIZE => return Err(ParseError::HeadTooLarge),
        None => return Err(ParseError::Incomplete),
    };

    let headers_str =
        std::str::from_utf8(&buf[..headers_end]).map_err(|_| ParseError::InvalidStatus)?;
    let mut lines = headers_str.split("\r\n");

    let status_line = lines.next().ok_or(ParseError::InvalidStatus)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(ParseError::InvalidStatus)?;
    if !version.starts_with("HTTP/") {
        return Err(ParseError::InvalidStatus);
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .ok_or(ParseError::InvalidStatus)?;

    let headers = parse_header_lines(lines)?;

    Ok((ResponseHead { status, headers }, headers_end + 4))
}

/// Version token of a response status line, e.g. `HTTP/1.0`.
pub fn response_version(buf: &[u8]) -> Option<&str> {
    let line_end = buf.windows(2).position(|w| w == b"\r\n")?;
    std::str::from_utf8(&buf[..line_end])
        .ok()?
        .split(' ')
        .next()
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        headers.append(key.trim(), value.trim());
    }

    Ok(headers)
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, framing, consumed) = parse_request_head(req).unwrap();

        assert_eq!(parsed.path, "/");
        assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
        assert_eq!(framing, BodyFraming::None);
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn parse_response_with_body_following() {
        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

        let (head, consumed) = parse_response_head(resp).unwrap();

        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.content_length(), Some(5));
        assert_eq!(&resp[consumed..], b"hello");
    }

    #[test]
    fn response_version_reads_status_line() {
        assert_eq!(response_version(b"HTTP/1.0 200 OK\r\n\r\n"), Some("HTTP/1.0"));
        assert_eq!(response_version(b"HTTP/1.0 200"), None);
    }
}
