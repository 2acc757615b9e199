//! The response object threaded through the container tree.
//!
//! # Responsibilities
//! - Track commit state so dispatch guards can fail fast
//! - Buffer uncommitted output so a forward can discard it
//! - Silently ignore metadata mutation while an include is in progress
//!
//! # Design Decisions
//! - Headers survive a buffer reset (only buffered output is discarded)
//! - `send_error` is the one place the basic stages produce 404/503 bodies
//! - No streaming: the connector layer owns the wire, this object owns
//!   the in-process contract only

use std::collections::HashMap;

/// In-process response handed to `Container::invoke` alongside a request.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: HashMap<String, Vec<String>>,
    buffer: Vec<u8>,
    body: Vec<u8>,
    committed: bool,
    closed: bool,
    include_depth: usize,
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            buffer: Vec::new(),
            body: Vec::new(),
            committed: false,
            closed: false,
            include_depth: 0,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Set the status code. Ignored once committed or inside an include.
    pub fn set_status(&mut self, status: u16) {
        if self.include_depth > 0 || self.committed {
            return;
        }
        self.status = status;
    }

    /// First value of a header, if set.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, Vec<String>> {
        &self.headers
    }

    /// Replace a header. Ignored once committed or inside an include.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.include_depth > 0 || self.committed {
            return;
        }
        self.headers.insert(name.into(), vec![value.into()]);
    }

    /// Append a header value. Ignored once committed or inside an include.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.include_depth > 0 || self.committed {
            return;
        }
        self.headers
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    /// Append body output. Writes are buffered until a flush commits them.
    pub fn write(&mut self, bytes: &[u8]) -> crate::error::Result<()> {
        if self.closed {
            return Err(crate::error::ContainerError::IllegalState(
                "response is closed".into(),
            ));
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Commit: move buffered output into the body. Idempotent.
    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.body.append(&mut self.buffer);
        }
        self.committed = true;
    }

    /// Discard buffered-but-uncommitted output. Headers are preserved.
    /// Fails if the response is already committed; a no-op inside an include.
    pub fn reset_buffer(&mut self) -> crate::error::Result<()> {
        if self.include_depth > 0 {
            return Ok(());
        }
        if self.committed {
            return Err(crate::error::ContainerError::IllegalState(
                "response is already committed".into(),
            ));
        }
        self.buffer.clear();
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flush and close the output stream. Ignored inside an include so a
    /// nested resource cannot close the real response.
    pub fn close(&mut self) {
        if self.include_depth > 0 {
            return;
        }
        self.flush();
        self.closed = true;
    }

    /// Produce an error response (404, 503, ...). Ignored inside an
    /// include or once committed.
    pub fn send_error(&mut self, status: u16, message: &str) {
        if self.include_depth > 0 {
            return;
        }
        if self.committed {
            tracing::warn!(status, "send_error after commit ignored");
            return;
        }
        self.buffer.clear();
        self.status = status;
        self.headers
            .insert("Content-Type".into(), vec!["text/plain".into()]);
        self.buffer.extend_from_slice(message.as_bytes());
    }

    /// Committed body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Buffered (uncommitted) bytes.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn begin_include(&mut self) {
        self.include_depth += 1;
    }

    pub(crate) fn end_include(&mut self) {
        self.include_depth = self.include_depth.saturating_sub(1);
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}
