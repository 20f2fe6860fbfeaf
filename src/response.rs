use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use crate::buffer::Buffer;

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Bad Request",
    }
}

/// Canonical page shown for each error status.
fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

/// Media type by case-sensitive suffix; unknown suffixes serve as plain
/// text.
fn mime_type(path: &str) -> &'static str {
    let Some(idx) = path.rfind('.') else {
        return "text/plain";
    };
    match &path[idx..] {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" => "image/jpeg",
        ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" => "video/mpeg",
        ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

/// Builds one response: status line and headers into the connection's
/// out-buffer, body published as a memory-mapped region for the gather
/// write. At most one mapping is live per responder; every re-init and the
/// connection close path release it.
pub struct HttpResponse {
    code: u16,
    src_dir: PathBuf,
    path: String,
    keep_alive: bool,
    mmap: Option<Mmap>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            code: 0,
            src_dir: PathBuf::new(),
            path: String::new(),
            keep_alive: false,
            mmap: None,
        }
    }

    /// `code` of zero means "decided by the filesystem probe" (the success
    /// path); parse failures pass 400 explicitly.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: u16) {
        assert!(!src_dir.as_os_str().is_empty());
        self.unmap();
        self.code = code;
        self.src_dir = src_dir.to_path_buf();
        self.path = path.to_owned();
        self.keep_alive = keep_alive;
    }

    pub fn status(&self) -> u16 {
        self.code
    }

    /// The mapped body, if any, for the second gather slice.
    pub fn file(&self) -> Option<&[u8]> {
        self.mmap.as_deref()
    }

    pub fn file_len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    /// Release the mapping. Idempotent.
    pub fn unmap(&mut self) {
        self.mmap = None;
    }

    /// Resolve the target under the resource root, finalize the status
    /// code, and serialize status line + headers into `buf`. The body is
    /// left mapped rather than copied.
    pub fn build(&mut self, buf: &mut Buffer) {
        // The filesystem probe decides the status only when the parser did
        // not already flag the request.
        if self.code == 0 {
            let target = self.resolve();
            self.code = match std::fs::metadata(&target) {
                Err(_) => 404,
                Ok(md) if md.is_dir() => 404,
                Ok(md) if md.permissions().mode() & 0o004 == 0 => 403,
                Ok(_) => 200,
            };
        }
        if let Some(page) = error_page(self.code) {
            self.path = page.to_owned();
        }

        self.add_state_line(buf);
        self.add_header(buf);
        self.add_content(buf);
    }

    fn resolve(&self) -> PathBuf {
        // Request paths are absolute; join them relative to the root.
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    fn add_state_line(&mut self, buf: &mut Buffer) {
        if !matches!(self.code, 200 | 400 | 403 | 404) {
            self.code = 400;
        }
        buf.append_str(&format!(
            "HTTP/1.1 {} {}\r\n",
            self.code,
            reason_phrase(self.code)
        ));
    }

    fn add_header(&mut self, buf: &mut Buffer) {
        buf.append_str("Connection: ");
        if self.keep_alive {
            buf.append_str("keep-alive\r\n");
            buf.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("close\r\n");
        }
        buf.append_str(&format!("Content-type: {}\r\n", mime_type(&self.path)));
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let target = self.resolve();
        let file = match File::open(&target) {
            Ok(f) => f,
            Err(_) => {
                self.error_body(buf, "File NotFound!");
                return;
            }
        };
        let len = file.metadata().map(|md| md.len()).unwrap_or(0);
        debug!("serving {} ({} bytes)", target.display(), len);

        // A zero-length file cannot be mapped; it simply has no body.
        if len > 0 {
            match unsafe { Mmap::map(&file) } {
                Ok(mmap) => self.mmap = Some(mmap),
                Err(_) => {
                    self.error_body(buf, "File NotFound!");
                    return;
                }
            }
        }
        buf.append_str(&format!("Content-length: {len}\r\n\r\n"));
    }

    /// Inline fallback body, used when even the canonical error page is
    /// unavailable.
    pub fn error_body(&self, buf: &mut Buffer, message: &str) {
        let mut body = String::from("<html><title>Error</title>");
        body.push_str("<body bgcolor=\"ffffff\">");
        body.push_str(&format!("{} : {}\n", self.code, reason_phrase(self.code)));
        body.push_str(&format!("<p>{message}</p>"));
        body.push_str("<hr><em>stoker</em></body></html>");

        buf.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buf.append_str(&body);
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}
