// src/multipart.rs

#[derive(Debug, PartialEq, Eq)]
pub enum MultipartError {
    /// The body ends before the closing boundary.
    Truncated,
    /// Part headers are not valid header lines.
    BadHeaders,
}

/// One part of a multipart/form-data body, borrowed in place.
#[derive(Debug)]
pub struct Part<'a> {
    pub name: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// Iterator over the parts of a multipart/form-data body. Zero-copy: each
/// part borrows the underlying buffer.
pub struct Multipart<'a> {
    body: &'a [u8],
    marker: Vec<u8>,
}

impl<'a> Multipart<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        Self { body, marker }
    }
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    data.windows(needle.len()).position(|w| w == needle)
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Result<Part<'a>, MultipartError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() {
            return None;
        }

        let mut start = match find(self.body, &self.marker) {
            Some(i) => i + self.marker.len(),
            None => {
                self.body = &[];
                return Some(Err(MultipartError::Truncated));
            }
        };

        // "--" after the boundary marks the end of the stream.
        if self.body[start..].starts_with(b"--") {
            self.body = &[];
            return None;
        }
        if self.body[start..].starts_with(b"\r\n") {
            start += 2;
        }

        let header_end = match find(&self.body[start..], b"\r\n\r\n") {
            Some(i) => i,
            None => {
                self.body = &[];
                return Some(Err(MultipartError::Truncated));
            }
        };
        let header_slice = &self.body[start..start + header_end];
        let body_start = start + header_end + 4;

        let body_end = match find(&self.body[body_start..], &self.marker) {
            Some(i) => body_start + i,
            None => {
                self.body = &[];
                return Some(Err(MultipartError::Truncated));
            }
        };
        // The part body ends with \r\n before the next boundary.
        let trimmed_end = if body_end >= body_start + 2
            && self.body[body_end - 2] == b'\r'
            && self.body[body_end - 1] == b'\n'
        {
            body_end - 2
        } else {
            body_end
        };
        let part_body = &self.body[body_start..trimmed_end];
        self.body = &self.body[body_end..];

        let headers = match std::str::from_utf8(header_slice) {
            Ok(h) => h,
            Err(_) => return Some(Err(MultipartError::BadHeaders)),
        };

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("content-disposition:") {
                name = quoted_param(line, &lower, "name=\"");
                filename = quoted_param(line, &lower, "filename=\"");
            } else if lower.starts_with("content-type:") {
                content_type = Some(line["content-type:".len()..].trim());
            }
        }

        Some(Ok(Part {
            name,
            filename,
            content_type,
            body: part_body,
        }))
    }
}

fn quoted_param<'a>(line: &'a str, lower: &str, key: &str) -> Option<&'a str> {
    let idx = lower.find(key)?;
    let rest = &line[idx + key.len()..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"--XBOUND\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"pic.png\"\r\n\
Content-Type: image/png\r\n\r\n\
PNGDATA\r\n\
--XBOUND\r\n\
Content-Disposition: form-data; name=\"note\"\r\n\r\n\
hello\r\n\
--XBOUND--\r\n";

    #[test]
    fn iterates_parts() {
        let mut mp = Multipart::new(BODY, "XBOUND");

        let p1 = mp.next().unwrap().unwrap();
        assert_eq!(p1.name, Some("file"));
        assert_eq!(p1.filename, Some("pic.png"));
        assert_eq!(p1.content_type, Some("image/png"));
        assert_eq!(p1.body, b"PNGDATA");

        let p2 = mp.next().unwrap().unwrap();
        assert_eq!(p2.name, Some("note"));
        assert_eq!(p2.filename, None);
        assert_eq!(p2.body, b"hello");

        assert!(mp.next().is_none());
    }

    #[test]
    fn truncated_body_errors() {
        let cut = &BODY[..40];
        let mut mp = Multipart::new(cut, "XBOUND");
        assert_eq!(mp.next().unwrap().unwrap_err(), MultipartError::Truncated);
        assert!(mp.next().is_none());
    }
}
