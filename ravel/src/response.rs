// src/response.rs
use std::ffi::CString;
use std::mem;
use std::path::Path;

use libc::c_void;
use tracing::debug;

use crate::buffer::Buffer;

/// Fixed reason table. Codes outside it coerce to 400 at composition time.
const CODE_STATUS: [(u16, &str); 4] = [
    (200, "OK"),
    (400, "Bad Request"),
    (403, "Forbidden"),
    (404, "Not Found"),
];

/// Error codes with a dedicated page under the static root.
const CODE_PATH: [(u16, &str); 3] = [
    (400, "/400.html"),
    (403, "/403.html"),
    (404, "/404.html"),
];

/// Suffix to MIME lookup. The trailing spaces on the css/js entries are
/// preserved bit-exactly; unknown suffixes fall back to text/plain.
const SUFFIX_TYPE: [(&str, &str); 19] = [
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/msword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css "),
    (".js", "text/javascript "),
];

const DEFAULT_MIME: &str = "text/plain";

/// A private read-only mapping of a response body file. Unmapped on drop;
/// `unmap` is idempotent.
pub struct FileMap {
    ptr: *mut c_void,
    len: usize,
}

// The mapping is owned by exactly one connection at a time (one-shot arming
// discipline) and the pages themselves are immutable.
unsafe impl Send for FileMap {}

impl FileMap {
    fn map(fd: libc::c_int, len: usize) -> Option<FileMap> {
        if len == 0 {
            return None;
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(FileMap { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// Response composer: status policy, header emission into the write buffer,
/// and the memory-mapped file body.
pub struct Response {
    code: u16,
    path: String,
    keep_alive: bool,
    map: Option<FileMap>,
    body_sent: usize,
}

impl Response {
    pub fn new() -> Self {
        Self {
            code: 0,
            path: String::new(),
            keep_alive: false,
            map: None,
            body_sent: 0,
        }
    }

    /// Prepare for a fresh response, releasing any previous body mapping.
    /// `code` 0 means "not preset"; the stat policy decides.
    pub fn init(&mut self, path: String, keep_alive: bool, code: u16) {
        self.unmap();
        self.code = code;
        self.path = path;
        self.keep_alive = keep_alive;
        self.body_sent = 0;
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn unmap(&mut self) {
        self.map = None;
        self.body_sent = 0;
    }

    /// The unsent tail of the mapped body, if any.
    pub fn body_chunk(&self) -> Option<&[u8]> {
        self.map.as_ref().and_then(|m| {
            if self.body_sent < m.len() {
                Some(&m.as_slice()[self.body_sent..])
            } else {
                None
            }
        })
    }

    pub fn body_remaining(&self) -> usize {
        match &self.map {
            Some(m) => m.len() - self.body_sent,
            None => 0,
        }
    }

    pub fn advance_body(&mut self, n: usize) {
        debug_assert!(n <= self.body_remaining());
        self.body_sent += n;
    }

    /// Compose the status line and headers into `buf`, and map the body file.
    ///
    /// Status policy: stat failure or a directory is 404, a file without the
    /// world-read bit is 403, otherwise the preset code (200 when unset).
    /// Error statuses retarget to their error page and re-stat, so a stale
    /// size can never reach mmap. If the page cannot be opened or mapped the
    /// body degrades to a small inline HTML blob.
    pub fn compose(&mut self, src_dir: &Path, buf: &mut Buffer) {
        let mut st = stat_path(src_dir, &self.path);

        if self.code < 400 {
            match &st {
                Some(s) if !is_dir(s) => {
                    if s.st_mode & libc::S_IROTH == 0 {
                        self.code = 403;
                    } else if self.code == 0 {
                        self.code = 200;
                    }
                }
                _ => self.code = 404,
            }
        }

        if let Some(&(_, page)) = CODE_PATH.iter().find(|&&(c, _)| c == self.code) {
            self.path = page.to_string();
            st = stat_path(src_dir, &self.path);
        }

        self.add_state_line(buf);
        self.add_header(buf);
        self.add_content(src_dir, st, buf);
    }

    fn add_state_line(&mut self, buf: &mut Buffer) {
        let reason = match CODE_STATUS.iter().find(|&&(c, _)| c == self.code) {
            Some(&(_, r)) => r,
            None => {
                self.code = 400;
                "Bad Request"
            }
        };
        buf.append_str(&format!("HTTP/1.1 {} {}\r\n", self.code, reason));
    }

    fn add_header(&mut self, buf: &mut Buffer) {
        buf.append_str("Connection: ");
        if self.keep_alive {
            buf.append_str("keep-alive\r\n");
            buf.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("close\r\n");
        }
        buf.append_str(&format!("Content-type: {}\r\n", self.file_type()));
    }

    fn add_content(&mut self, src_dir: &Path, st: Option<libc::stat>, buf: &mut Buffer) {
        let full = full_path(src_dir, &self.path);
        let size = match (&st, CString::new(full.clone())) {
            (Some(s), Ok(c)) => {
                let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY) };
                if fd < 0 {
                    self.error_content(buf, "File Not Found!");
                    return;
                }
                debug!(path = %full, "mapping response body");
                let len = s.st_size as usize;
                let map = FileMap::map(fd, len);
                unsafe { libc::close(fd) };
                if map.is_none() && len > 0 {
                    self.error_content(buf, "File Not Found!");
                    return;
                }
                self.map = map;
                len
            }
            _ => {
                self.error_content(buf, "File Not Found!");
                return;
            }
        };
        buf.append_str(&format!("Content-length: {}\r\n\r\n", size));
    }

    /// Inline HTML body used when the target file cannot be served.
    fn error_content(&mut self, buf: &mut Buffer, message: &str) {
        let reason = CODE_STATUS
            .iter()
            .find(|&&(c, _)| c == self.code)
            .map(|&(_, r)| r)
            .unwrap_or("Bad Request");

        let mut body = String::new();
        body.push_str("<html><title>Error</title>");
        body.push_str("<body bgcolor=\"ffffff\">");
        body.push_str(&format!("{} : {}\n", self.code, reason));
        body.push_str(&format!("<p>{}</p>", message));
        body.push_str("<hr><em>ravel</em></body></html>");

        buf.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buf.append_str(&body);
    }

    fn file_type(&self) -> &'static str {
        let idx = match self.path.rfind('.') {
            Some(i) => i,
            None => return DEFAULT_MIME,
        };
        let suffix = &self.path[idx..];
        SUFFIX_TYPE
            .iter()
            .find(|&&(s, _)| s == suffix)
            .map(|&(_, t)| t)
            .unwrap_or(DEFAULT_MIME)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

fn full_path(src_dir: &Path, path: &str) -> String {
    format!("{}{}", src_dir.display(), path)
}

fn stat_path(src_dir: &Path, path: &str) -> Option<libc::stat> {
    let c = CString::new(full_path(src_dir, path)).ok()?;
    let mut st: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::stat(c.as_ptr(), &mut st) } < 0 {
        return None;
    }
    Some(st)
}

fn is_dir(st: &libc::stat) -> bool {
    st.st_mode & libc::S_IFMT == libc::S_IFDIR
}
