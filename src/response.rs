//! Response wrapper capturing fragment output
//!
//! [`CacheResponse`] records two views of what a fragment writes: the bytes
//! sent to the client for this request, and the cacheable structure of the
//! fragment as a list of [`ContentSegment`]s. Dynamic content providers and
//! nested fragments keep their own segments so a cache hit can re-run them.

use crate::dynamic_content::DynamicContentProvider;
use crate::error::Result;
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use std::sync::Arc;

/// Which sink the fragment writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Byte output stream
    #[default]
    Stream,
    /// Character writer
    Writer,
}

/// One piece of a cached fragment
#[derive(Debug, Clone)]
pub enum ContentSegment {
    /// Literal output
    Static(Bytes),
    /// Re-rendered on every hit
    Dynamic(Arc<dyn DynamicContentProvider>),
    /// Output of another cache entry, resolved at hit time
    Include { id: String },
}

/// A nested fragment's output as seen by its parent
#[derive(Debug, Clone)]
pub(crate) struct ChildFragment {
    pub(crate) id: Option<String>,
    pub(crate) cached: bool,
    pub(crate) vetoed: bool,
    pub(crate) do_not_consume: bool,
    pub(crate) data_ids: Vec<String>,
    pub(crate) segments: Vec<ContentSegment>,
}

#[derive(Debug, Clone)]
pub(crate) enum PendingSegment {
    Ready(ContentSegment),
    Child(ChildFragment),
}

/// What the coordinator decided about the fragment written to a response
#[derive(Debug, Clone, Default)]
pub(crate) struct FragmentRecord {
    pub(crate) id: Option<String>,
    pub(crate) cached: bool,
    pub(crate) vetoed: bool,
    pub(crate) data_ids: Vec<String>,
}

/// Response wrapper used while a fragment executes
#[derive(Debug, Clone)]
pub struct CacheResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    output_mode: OutputMode,
    output: BytesMut,
    segments: Vec<PendingSegment>,
    /// Literal output not yet closed into a segment
    static_tail: BytesMut,
    do_not_consume: bool,
    record: FragmentRecord,
}

impl Default for CacheResponse {
    fn default() -> Self {
        CacheResponse::new()
    }
}

impl CacheResponse {
    pub fn new() -> Self {
        CacheResponse {
            status: StatusCode::OK,
            headers: Vec::new(),
            cookies: Vec::new(),
            output_mode: OutputMode::Stream,
            output: BytesMut::new(),
            segments: Vec::new(),
            static_tail: BytesMut::new(),
            do_not_consume: false,
            record: FragmentRecord::default(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Append a header; several values per name are kept in order
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
        self.add_header("Content-Type", content_type);
    }

    pub fn add_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.push((name.into(), value.into()));
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    /// Switch to character output
    pub fn use_writer(&mut self) {
        self.output_mode = OutputMode::Writer;
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    /// Write literal fragment output
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        if data.is_empty() {
            return;
        }
        self.output.extend_from_slice(data);
        self.static_tail.extend_from_slice(data);
    }

    /// Close buffered literal output into a static segment
    fn close_static_tail(&mut self) {
        if self.static_tail.is_empty() {
            return;
        }
        let tail = self.static_tail.split();
        if let Some(PendingSegment::Ready(ContentSegment::Static(last))) = self.segments.last_mut()
        {
            let mut merged = BytesMut::with_capacity(last.len() + tail.len());
            merged.extend_from_slice(last.as_ref());
            merged.extend_from_slice(&tail);
            *last = merged.freeze();
        } else {
            self.segments
                .push(PendingSegment::Ready(ContentSegment::Static(tail.freeze())));
        }
    }

    pub fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    /// Register a dynamic content provider at the current position
    ///
    /// The provider runs immediately for this request and again on every
    /// cache hit of the fragment.
    pub fn add_dynamic_content_provider(
        &mut self,
        provider: Arc<dyn DynamicContentProvider>,
    ) -> Result<()> {
        self.run_provider(provider.as_ref())?;
        self.close_static_tail();
        self.segments
            .push(PendingSegment::Ready(ContentSegment::Dynamic(provider)));
        Ok(())
    }

    pub(crate) fn run_provider(&mut self, provider: &dyn DynamicContentProvider) -> Result<()> {
        match self.output_mode {
            OutputMode::Stream => {
                let mut out = Vec::new();
                provider.provide_bytes(&mut out)?;
                self.output.extend_from_slice(&out);
            }
            OutputMode::Writer => {
                let mut out = String::new();
                provider.provide_text(&mut out)?;
                self.output.extend_from_slice(out.as_bytes());
            }
        }
        Ok(())
    }

    /// Empty response for a fragment included by this one, same output mode
    pub fn nested(&self) -> CacheResponse {
        CacheResponse {
            output_mode: self.output_mode,
            ..CacheResponse::new()
        }
    }

    /// Add the output of a nested fragment at the current position
    pub fn include(&mut self, child: CacheResponse) {
        self.output.extend_from_slice(&child.output);
        self.cookies.extend(child.cookies.iter().cloned());
        let do_not_consume = child.do_not_consume;
        let record = child.record.clone();
        let segments = child.into_resolved_segments();
        self.close_static_tail();
        self.segments.push(PendingSegment::Child(ChildFragment {
            id: record.id,
            cached: record.cached,
            vetoed: record.vetoed,
            do_not_consume,
            data_ids: record.data_ids,
            segments,
        }));
    }

    /// Forbid a parent fragment from consuming this fragment's output
    pub fn set_do_not_consume(&mut self, do_not_consume: bool) {
        self.do_not_consume = do_not_consume;
    }

    pub fn is_do_not_consume(&self) -> bool {
        self.do_not_consume
    }

    /// Bytes written for this request
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.output)
    }

    pub fn body_len(&self) -> usize {
        self.output.len()
    }

    pub(crate) fn take_pending_segments(&mut self) -> Vec<PendingSegment> {
        self.close_static_tail();
        std::mem::take(&mut self.segments)
    }

    pub(crate) fn set_pending_segments(&mut self, segments: Vec<PendingSegment>) {
        self.static_tail.clear();
        self.segments = segments;
    }

    pub(crate) fn set_record(&mut self, record: FragmentRecord) {
        self.record = record;
    }

    /// Flatten nested children into plain segments, consuming every child inline
    fn into_resolved_segments(mut self) -> Vec<ContentSegment> {
        self.close_static_tail();
        let mut out = Vec::new();
        for segment in self.segments {
            match segment {
                PendingSegment::Ready(s) => out.push(s),
                PendingSegment::Child(child) => match child.id {
                    Some(id) if child.cached => out.push(ContentSegment::Include { id }),
                    _ => out.extend(child.segments),
                },
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct Counter(&'static str);

    impl DynamicContentProvider for Counter {
        fn provide_bytes(&self, out: &mut dyn io::Write) -> io::Result<()> {
            out.write_all(self.0.as_bytes())
        }
    }

    #[test]
    fn test_static_writes_are_merged() {
        let mut resp = CacheResponse::new();
        resp.write("<p>");
        resp.write_str("hi");
        resp.write("</p>");
        assert_eq!(resp.body(), Bytes::from("<p>hi</p>"));

        let segments = resp.take_pending_segments();
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn test_many_small_writes_form_one_segment() {
        let mut resp = CacheResponse::new();
        for _ in 0..10_000 {
            resp.write("x");
        }
        let segments = resp.take_pending_segments();
        assert_eq!(segments.len(), 1);
        assert!(
            matches!(&segments[0], PendingSegment::Ready(ContentSegment::Static(b)) if b.len() == 10_000)
        );

        // Writes after the segments are handed back extend the last one
        resp.set_pending_segments(segments);
        resp.write("y");
        let segments = resp.take_pending_segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(resp.body_len(), 10_001);
    }

    #[test]
    fn test_providers_run_in_registration_order() {
        let mut resp = CacheResponse::new();
        resp.write("a");
        resp.add_dynamic_content_provider(Arc::new(Counter("1"))).unwrap();
        resp.add_dynamic_content_provider(Arc::new(Counter("2"))).unwrap();
        resp.write("b");
        assert_eq!(resp.body(), Bytes::from("a12b"));
        assert_eq!(resp.take_pending_segments().len(), 4);
    }

    #[test]
    fn test_writer_mode_uses_text_sink() {
        let mut resp = CacheResponse::new();
        resp.use_writer();
        resp.add_dynamic_content_provider(Arc::new(Counter("txt"))).unwrap();
        assert_eq!(resp.output_mode(), OutputMode::Writer);
        assert_eq!(resp.body(), Bytes::from("txt"));
    }

    #[test]
    fn test_include_appends_child_output() {
        let mut child = CacheResponse::new();
        child.write("child");
        child.set_do_not_consume(true);
        child.add_cookie("seen", "1");

        let mut parent = CacheResponse::new();
        parent.write("[");
        parent.include(child);
        parent.write("]");

        assert_eq!(parent.body(), Bytes::from("[child]"));
        assert_eq!(parent.cookies(), [("seen".to_string(), "1".to_string())]);
        let segments = parent.take_pending_segments();
        assert!(matches!(&segments[1], PendingSegment::Child(c) if c.do_not_consume));
    }

    #[test]
    fn test_set_content_type_replaces_previous() {
        let mut resp = CacheResponse::new();
        resp.set_content_type("text/plain");
        resp.set_content_type("text/html");
        assert_eq!(resp.headers(), [("Content-Type".to_string(), "text/html".to_string())]);
    }
}
