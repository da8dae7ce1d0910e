//! Input sources: local files, in-memory buffers, and HTTP streams.
//!
//! A [`Source`] is a byte cursor with a possibly unknown length. Files and
//! buffers are always seekable; HTTP streams are seekable only when the
//! server advertises byte ranges and a content length, otherwise they are
//! treated as live streams.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sange_core::{Error, HttpConfig, Result};
use symphonia::core::io::MediaSource;
use tracing::{debug, info, warn};
use url::Url;

/// Where the bytes of a [`Source`] come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Memory,
    Http,
}

/// A readable (and usually seekable) input.
pub struct Source {
    locator: String,
    mime_type: Option<String>,
    inner: Inner,
}

enum Inner {
    File { reader: BufReader<File>, len: u64 },
    Memory(Cursor<Bytes>),
    Http(HttpStream),
}

impl Source {
    /// Open `locator` as a local path or, when `is_local_file` is false, as
    /// an `http`/`https` URL.
    pub fn open(locator: &str, is_local_file: bool, http: &HttpConfig) -> Result<Self> {
        if is_local_file {
            Self::open_file(locator)
        } else {
            Self::open_url(locator, http)
        }
    }

    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(Error::NotFound(format!(
                "{} is a directory",
                path.display()
            )));
        }

        debug!("Opened file {} ({} bytes)", path.display(), metadata.len());
        Ok(Self {
            locator: path.display().to_string(),
            mime_type: None,
            inner: Inner::File {
                reader: BufReader::new(file),
                len: metadata.len(),
            },
        })
    }

    pub fn open_url(locator: &str, http: &HttpConfig) -> Result<Self> {
        let url = Url::parse(locator)
            .map_err(|e| Error::NotFound(format!("invalid URL {locator}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Unsupported(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        let stream = HttpStream::connect(url.as_str(), http)?;
        info!(
            "Opened stream {url} (length: {:?}, seekable: {})",
            stream.len,
            stream.is_seekable()
        );
        Ok(Self {
            locator: locator.to_string(),
            mime_type: stream.mime_type.clone(),
            inner: Inner::Http(stream),
        })
    }

    /// Wrap an in-memory buffer.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            locator: "<memory>".to_string(),
            mime_type: None,
            inner: Inner::Memory(Cursor::new(data.into())),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self.inner {
            Inner::File { .. } => SourceKind::File,
            Inner::Memory(_) => SourceKind::Memory,
            Inner::Http(_) => SourceKind::Http,
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// MIME type reported by the server, if any.
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// File extension of the locator, used as a demuxer hint.
    pub fn extension(&self) -> Option<&str> {
        let path = match &self.inner {
            Inner::Http(_) => self.locator.split(['?', '#']).next()?,
            _ => self.locator.as_str(),
        };
        let name = path.rsplit('/').next()?;
        let (_, ext) = name.rsplit_once('.')?;
        (!ext.is_empty()).then_some(ext)
    }

    /// Total length in bytes, if known.
    pub fn len(&self) -> Option<u64> {
        match &self.inner {
            Inner::File { len, .. } => Some(*len),
            Inner::Memory(cursor) => Some(cursor.get_ref().len() as u64),
            Inner::Http(stream) => stream.len,
        }
    }

    pub fn seekable(&self) -> bool {
        match &self.inner {
            Inner::File { .. } | Inner::Memory(_) => true,
            Inner::Http(stream) => stream.is_seekable(),
        }
    }

    /// Read up to `max_bytes`. Returns `None` at end of stream.
    pub fn read_chunk(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; max_bytes];
        let n = loop {
            match self.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(io_error(e)),
            }
        };
        if n == 0 && max_bytes > 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }

    /// Move the cursor to an absolute byte offset.
    pub fn seek_to(&mut self, offset: u64) -> Result<u64> {
        if !self.seekable() {
            return Err(Error::Unsupported(format!(
                "{} is not seekable",
                self.locator
            )));
        }
        self.seek(SeekFrom::Start(offset)).map_err(io_error)
    }
}

fn io_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::Unsupported => Error::Unsupported(e.to_string()),
        io::ErrorKind::TimedOut => Error::Timeout(e.to_string()),
        _ => Error::Io(e),
    }
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::File { reader, .. } => reader.read(buf),
            Inner::Memory(cursor) => cursor.read(buf),
            Inner::Http(stream) => stream.read(buf),
        }
    }
}

impl Seek for Source {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.inner {
            Inner::File { reader, .. } => reader.seek(pos),
            Inner::Memory(cursor) => cursor.seek(pos),
            Inner::Http(stream) => stream.seek(pos),
        }
    }
}

impl MediaSource for Source {
    fn is_seekable(&self) -> bool {
        self.seekable()
    }

    fn byte_len(&self) -> Option<u64> {
        self.len()
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("locator", &self.locator)
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// HTTP body reader that reconnects with a `Range` header to seek.
struct HttpStream {
    agent: ureq::Agent,
    url: String,
    user_agent: String,
    retries: u32,
    backoff: Duration,
    len: Option<u64>,
    accepts_ranges: bool,
    mime_type: Option<String>,
    position: u64,
    // Mutex only to make the reader `Sync`; all access goes through `&mut self`.
    body: Mutex<Box<dyn Read + Send>>,
}

impl HttpStream {
    fn connect(url: &str, config: &HttpConfig) -> Result<Self> {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_connect(Some(Duration::from_millis(config.connect_timeout_ms)))
            .timeout_recv_response(Some(Duration::from_millis(config.read_timeout_ms)))
            .timeout_recv_body(Some(Duration::from_millis(config.read_timeout_ms)))
            .http_status_as_error(false)
            .build()
            .into();

        let mut stream = Self {
            agent,
            url: url.to_string(),
            user_agent: config.user_agent.clone(),
            retries: config.retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            len: None,
            accepts_ranges: false,
            mime_type: None,
            position: 0,
            body: Mutex::new(Box::new(io::empty())),
        };

        let response = stream.request(None)?;
        let headers = response.headers();
        stream.len = header(headers, "content-length").and_then(|v| v.parse().ok());
        stream.accepts_ranges = header(headers, "accept-ranges").is_some_and(|v| v == "bytes");
        stream.mime_type = header(headers, "content-type").map(String::from);
        stream.body = Mutex::new(Box::new(response.into_body().into_reader()));
        Ok(stream)
    }

    const fn is_seekable(&self) -> bool {
        self.accepts_ranges && self.len.is_some()
    }

    /// Issue a GET, retrying transient failures within the configured budget.
    fn request(&self, offset: Option<u64>) -> Result<ureq::http::Response<ureq::Body>> {
        let mut attempt = 0;
        loop {
            match self.request_once(offset) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Request to {} failed ({e}), retry {attempt}/{}",
                        self.url, self.retries
                    );
                    std::thread::sleep(self.backoff * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn request_once(&self, offset: Option<u64>) -> Result<ureq::http::Response<ureq::Body>> {
        let mut request = self
            .agent
            .get(&self.url)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "*/*");
        if let Some(offset) = offset {
            request = request.header("Range", &format!("bytes={offset}-"));
        }

        let response = request.call().map_err(|e| match e {
            ureq::Error::Timeout(t) => Error::Timeout(format!("{}: {t}", self.url)),
            ureq::Error::HostNotFound => Error::NotFound(format!("host not found: {}", self.url)),
            other => Error::Network(format!("{}: {other}", self.url)),
        })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(response),
            404 | 410 => Err(Error::NotFound(format!("{} (HTTP {status})", self.url))),
            416 => Err(Error::Unsupported(format!(
                "{}: range not satisfiable",
                self.url
            ))),
            500..=599 => Err(Error::Network(format!("{} (HTTP {status})", self.url))),
            _ => Err(Error::Unsupported(format!("{} (HTTP {status})", self.url))),
        }
    }
}

/// A ranged response must be `206 Partial Content` starting at `offset`.
fn check_partial(
    response: &ureq::http::Response<ureq::Body>,
    offset: u64,
) -> std::result::Result<(), String> {
    let status = response.status().as_u16();
    if status != 206 {
        return Err(format!("server ignored the range request (HTTP {status})"));
    }
    match header(response.headers(), "content-range").map(content_range_start) {
        Some(Some(start)) if start != offset => Err(format!(
            "server answered from byte {start} instead of {offset}"
        )),
        Some(None) => Err("malformed Content-Range".to_string()),
        _ => Ok(()),
    }
}

/// First byte of a `Content-Range: bytes START-END/TOTAL` value.
fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

fn header<'a>(headers: &'a ureq::http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl Read for HttpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.body.get_mut().read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for HttpStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (Some(len), true) = (self.len, self.accepts_ranges) else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream does not support range requests",
            ));
        };

        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;

        if target == self.position {
            return Ok(target);
        }
        if target >= len {
            self.body = Mutex::new(Box::new(io::empty()));
            self.position = target;
            return Ok(target);
        }

        debug!("Reconnecting {} at byte {target}", self.url);
        let response = self
            .request(Some(target))
            .map_err(|e| io::Error::other(e.to_string()))?;
        if let Err(reason) = check_partial(&response, target) {
            // The old body is still positioned correctly; keep reading it.
            warn!("{}: {reason}, treating the stream as live", self.url);
            self.accepts_ranges = false;
            return Err(io::Error::new(io::ErrorKind::Unsupported, reason));
        }
        self.body = Mutex::new(Box::new(response.into_body().into_reader()));
        self.position = target;
        Ok(target)
    }
}
