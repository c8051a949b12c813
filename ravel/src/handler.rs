// src/handler.rs
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use ravel_db::users;

use crate::multipart::Multipart;
use crate::request::{Method, Request};
use crate::server::Shared;

const WELCOME_PAGE: &str = "/welcome.html";
const ERROR_PAGE: &str = "/error.html";

/// Map a parsed request to a page path and a preset status code (0 when the
/// stat policy should decide). POSTs to the login, register and upload routes
/// are intercepted; everything else is a static lookup.
pub fn handle(req: &Request<'_>, shared: &Shared) -> (String, u16) {
    if req.method == Method::Post {
        match req.path {
            "/login" | "/login.html" => return auth(req, shared, true),
            "/register" | "/register.html" => return auth(req, shared, false),
            "/upload" => return upload(req, shared),
            _ => {}
        }
    }
    (req.mapped_path(), 0)
}

fn auth(req: &Request<'_>, shared: &Shared, is_login: bool) -> (String, u16) {
    let pool = match &shared.db {
        Some(p) => p,
        None => {
            warn!("auth request without a database pool");
            return (ERROR_PAGE.to_string(), 200);
        }
    };

    let form = parse_form(req.body);
    let username = form.iter().find(|(k, _)| k == "username").map(|(_, v)| v);
    let password = form.iter().find(|(k, _)| k == "password").map(|(_, v)| v);
    let (username, password) = match (username, password) {
        (Some(u), Some(p)) => (u, p),
        _ => return (ERROR_PAGE.to_string(), 200),
    };

    let mut handle = match pool.get() {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "database pool unavailable");
            return (ERROR_PAGE.to_string(), 200);
        }
    };

    let ok = if is_login {
        users::verify(&mut handle, username, password)
    } else {
        users::register(&mut handle, username, password)
    };
    match ok {
        Ok(true) => {
            debug!(user = %username, is_login, "auth accepted");
            (WELCOME_PAGE.to_string(), 200)
        }
        Ok(false) => (ERROR_PAGE.to_string(), 200),
        Err(e) => {
            warn!(error = %e, "auth query failed");
            (ERROR_PAGE.to_string(), 200)
        }
    }
}

fn upload(req: &Request<'_>, shared: &Shared) -> (String, u16) {
    let boundary = match req
        .header("Content-Type")
        .and_then(multipart_boundary)
    {
        Some(b) => b,
        None => return (String::new(), 400),
    };

    for part in Multipart::new(req.body, boundary) {
        let part = match part {
            Ok(p) => p,
            Err(e) => {
                debug!(error = ?e, "malformed multipart body");
                return (String::new(), 400);
            }
        };
        let filename = match part.filename {
            Some(f) if !f.is_empty() => f,
            _ => continue,
        };
        // Strip any path components the client sent along.
        let name = match Path::new(filename).file_name() {
            Some(n) => n.to_owned(),
            None => continue,
        };
        let target = shared.upload_dir.join(&name);
        if let Err(e) = fs::write(&target, part.body) {
            warn!(file = %target.display(), error = %e, "upload write failed");
            return (ERROR_PAGE.to_string(), 200);
        }
        debug!(file = %target.display(), bytes = part.body.len(), "upload stored");
    }
    ("/index.html".to_string(), 200)
}

fn multipart_boundary(content_type: &str) -> Option<&str> {
    let mut parts = content_type.split(';').map(str::trim);
    if !parts.next()?.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    parts.find_map(|p| p.strip_prefix("boundary="))
}

/// Parse an application/x-www-form-urlencoded body.
fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(_) => return Vec::new(),
    };
    text.split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((url_decode(k), url_decode(v)))
        })
        .collect()
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{parse, ParseOutcome};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn shared_at(tag: &str) -> (Shared, PathBuf) {
        let root =
            std::env::temp_dir().join(format!("ravel-handler-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let src = root.join("resources");
        fs::create_dir_all(src.join("upload")).unwrap();
        let shared = Shared {
            src_dir: src.clone(),
            upload_dir: src.join("upload"),
            user_count: AtomicUsize::new(0),
            conn_et: true,
            db: None,
        };
        (shared, src)
    }

    fn request(raw: &[u8]) -> Request<'_> {
        match parse(raw) {
            ParseOutcome::Complete(req, _) => req,
            _ => panic!("test request must parse"),
        }
    }

    #[test]
    fn static_get_maps_path() {
        let (shared, _) = shared_at("static");
        let req = request(b"GET /picture HTTP/1.1\r\n\r\n");
        assert_eq!(handle(&req, &shared), ("/picture.html".to_string(), 0));

        let req = request(b"GET /data.tar HTTP/1.1\r\n\r\n");
        assert_eq!(handle(&req, &shared), ("/data.tar".to_string(), 0));
    }

    #[test]
    fn login_without_pool_is_rejected() {
        let (shared, _) = shared_at("nopool");
        let req = request(
            b"POST /login HTTP/1.1\r\nContent-Length: 26\r\n\r\nusername=alice&password=pw",
        );
        assert_eq!(handle(&req, &shared), (ERROR_PAGE.to_string(), 200));
    }

    #[test]
    fn upload_writes_file_parts() {
        let (shared, _) = shared_at("upload");
        let body = b"--B42\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"../../evil.txt\"\r\n\r\n\
contents here\r\n\
--B42--\r\n";
        let raw = format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=B42\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut full = raw.into_bytes();
        full.extend_from_slice(body);

        let req = request(&full);
        assert_eq!(handle(&req, &shared), ("/index.html".to_string(), 200));

        // Path components are stripped: the file lands inside upload_dir.
        let stored = fs::read(shared.upload_dir.join("evil.txt")).unwrap();
        assert_eq!(stored, b"contents here");
    }

    #[test]
    fn upload_without_boundary_is_bad_request() {
        let (shared, _) = shared_at("noboundary");
        let req = request(b"POST /upload HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(handle(&req, &shared), (String::new(), 400));
    }

    #[test]
    fn form_decoding() {
        let form = parse_form(b"username=a+b&password=p%40ss&x=1");
        assert_eq!(
            form,
            vec![
                ("username".to_string(), "a b".to_string()),
                ("password".to_string(), "p@ss".to_string()),
                ("x".to_string(), "1".to_string()),
            ]
        );
    }
}
