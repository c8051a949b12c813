// src/request.rs

/// Header count above which a request is rejected outright.
const MAX_HEADERS: usize = 100;

/// Request-line length above which we stop waiting for more bytes.
const MAX_REQUEST_LINE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            _ => Method::Unknown,
        }
    }
}

/// A parsed request borrowing the connection's read buffer.
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    /// "1.0" or "1.1".
    pub version: &'a str,
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
}

impl<'a> Request<'a> {
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|&(_, v)| v)
    }

    /// Keep-alive holds iff the request is HTTP/1.1 and carries
    /// `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("Connection")
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(false)
    }

    /// Resolve the request target to a page path: `/` serves the index, the
    /// well-known page routes gain their `.html` suffix.
    pub fn mapped_path(&self) -> String {
        if self.path == "/" {
            return "/index.html".to_string();
        }
        const PAGES: [&str; 6] = [
            "/index",
            "/register",
            "/login",
            "/welcome",
            "/video",
            "/picture",
        ];
        if PAGES.contains(&self.path) {
            return format!("{}.html", self.path);
        }
        self.path.to_string()
    }
}

/// Outcome of feeding a byte buffer to the parser.
pub enum ParseOutcome<'a> {
    /// Not enough bytes yet; re-arm readable and come back.
    NeedsMore,
    /// A full request plus the number of buffer bytes it occupies.
    Complete(Request<'a>, usize),
    /// The bytes can never become a valid request.
    Malformed,
}

/// Parse one HTTP/1.x request out of `buf`.
///
/// Pure function over the bytes: request line, headers up to the blank line,
/// then an entity body gated on Content-Length (a declared length longer than
/// what is on hand is `NeedsMore`, not an error).
pub fn parse(buf: &[u8]) -> ParseOutcome<'_> {
    let line_end = match find(buf, b"\r\n") {
        Some(i) => i,
        None => {
            if buf.len() > MAX_REQUEST_LINE {
                return ParseOutcome::Malformed;
            }
            return ParseOutcome::NeedsMore;
        }
    };

    let line = &buf[..line_end];
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let (method_b, target_b, version_b) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return ParseOutcome::Malformed,
    };
    if parts.next().is_some() {
        return ParseOutcome::Malformed;
    }

    let method = Method::from_bytes(method_b);
    if method == Method::Unknown {
        return ParseOutcome::Malformed;
    }

    let version = match version_b {
        b"HTTP/1.1" => "1.1",
        b"HTTP/1.0" => "1.0",
        _ => return ParseOutcome::Malformed,
    };

    let target = match std::str::from_utf8(target_b) {
        Ok(t) if t.starts_with('/') => t,
        _ => return ParseOutcome::Malformed,
    };
    let (path, query) = match target.find('?') {
        Some(i) => (&target[..i], Some(&target[i + 1..])),
        None => (target, None),
    };

    let mut headers = Vec::new();
    let mut cursor = line_end + 2;
    loop {
        let rest = &buf[cursor..];
        let eol = match find(rest, b"\r\n") {
            Some(i) => i,
            None => return ParseOutcome::NeedsMore,
        };
        if eol == 0 {
            cursor += 2;
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return ParseOutcome::Malformed;
        }
        let line = &rest[..eol];
        let colon = match line.iter().position(|&b| b == b':') {
            Some(i) if i > 0 => i,
            _ => return ParseOutcome::Malformed,
        };
        let name = match std::str::from_utf8(&line[..colon]) {
            Ok(n) => n,
            Err(_) => return ParseOutcome::Malformed,
        };
        let value = match std::str::from_utf8(&line[colon + 1..]) {
            Ok(v) => v.trim(),
            Err(_) => return ParseOutcome::Malformed,
        };
        headers.push((name, value));
        cursor += eol + 2;
    }

    let content_length = match headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
    {
        Some(&(_, v)) => match v.parse::<usize>() {
            Ok(n) => n,
            Err(_) => return ParseOutcome::Malformed,
        },
        None => 0,
    };

    if buf.len() - cursor < content_length {
        return ParseOutcome::NeedsMore;
    }
    let body = &buf[cursor..cursor + content_length];

    ParseOutcome::Complete(
        Request {
            method,
            path,
            query,
            version,
            headers,
            body,
        },
        cursor + content_length,
    )
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    data.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(buf: &[u8]) -> (Request<'_>, usize) {
        match parse(buf) {
            ParseOutcome::Complete(req, n) => (req, n),
            ParseOutcome::NeedsMore => panic!("unexpected NeedsMore"),
            ParseOutcome::Malformed => panic!("unexpected Malformed"),
        }
    }

    #[test]
    fn parses_basic_get() {
        let raw = b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n";
        let (req, consumed) = complete(raw);
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/some/path");
        assert_eq!(req.query, Some("foo=bar"));
        assert_eq!(req.version, "1.1");
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.keep_alive());
        assert!(req.body.is_empty());
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn incomplete_returns_needs_more() {
        assert!(matches!(parse(b"GET /index.htm"), ParseOutcome::NeedsMore));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nHost: x\r\n"),
            ParseOutcome::NeedsMore
        ));
    }

    #[test]
    fn body_waits_for_content_length() {
        let head = b"POST /login HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345";
        assert!(matches!(parse(head), ParseOutcome::NeedsMore));

        let full = b"POST /login HTTP/1.1\r\nContent-Length: 10\r\n\r\n1234567890TRAILING";
        let (req, consumed) = complete(full);
        assert_eq!(req.body, b"1234567890");
        // Pipelined trailing bytes are not consumed.
        assert_eq!(consumed, full.len() - 8);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(parse(b"GARBAGE\r\n\r\n"), ParseOutcome::Malformed));
        assert!(matches!(
            parse(b"GET / HTTP/2.0\r\n\r\n"),
            ParseOutcome::Malformed
        ));
        assert!(matches!(
            parse(b"BREW /pot HTTP/1.1\r\n\r\n"),
            ParseOutcome::Malformed
        ));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n"),
            ParseOutcome::Malformed
        ));
    }

    #[test]
    fn keep_alive_needs_http11() {
        let raw = b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n";
        let (req, _) = complete(raw);
        assert!(!req.keep_alive());

        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, _) = complete(raw);
        assert!(!req.keep_alive());
    }

    #[test]
    fn page_routes_gain_html_suffix() {
        let (req, _) = complete(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(req.mapped_path(), "/index.html");

        let (req, _) = complete(b"GET /welcome HTTP/1.1\r\n\r\n");
        assert_eq!(req.mapped_path(), "/welcome.html");

        let (req, _) = complete(b"GET /style.css HTTP/1.1\r\n\r\n");
        assert_eq!(req.mapped_path(), "/style.css");
    }
}
