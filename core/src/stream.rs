//! Server-Sent-Events decoding into typed event sequences.
//!
//! # Design
//! Framing (`FrameDecoder`) and interpretation (`interpret`) are plain
//! synchronous code shared by both consumption modes:
//!
//! - [`EventStream`] pulls lines from any `BufRead` and is an `Iterator`;
//!   the caller's thread blocks on each read.
//! - [`AsyncEventStream`] pulls chunks from any byte `Stream` and is a
//!   `futures::Stream`; it suspends only while waiting for the next chunk.
//!
//! Both are one-shot and forward-only. They release the underlying
//! connection as soon as the terminator or an error is seen, and dropping
//! them early releases it too. A connection that closes before the
//! terminator frame is an error, never a clean end.

use std::io::BufRead;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::classify::classify;
use crate::error::{CozeError, StreamError};
use crate::http::ResponseMeta;

/// One event-stream frame, delimited by a blank line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Value of the `event:` line; empty when the frame had none.
    pub event: String,
    /// All `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

/// A typed event decoded from a [`Frame`].
///
/// Frames tagged [`StreamEvent::DONE`] end the stream cleanly and frames
/// tagged [`StreamEvent::ERROR`] are raised as errors; neither reaches
/// `from_frame`. Implementations map unknown tags to a pass-through variant.
pub trait StreamEvent: Sized {
    const DONE: &'static str;
    const ERROR: &'static str;

    fn from_frame(frame: Frame, logid: &str) -> Result<Self, CozeError>;
}

/// Accumulates lines into frames.
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl FrameDecoder {
    /// Feed one line without its line terminator.
    pub fn push_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.take();
        }
        if let Some(value) = field_value(line, "event") {
            self.event = Some(value.to_string());
        } else if let Some(value) = field_value(line, "data") {
            self.data.push(value.to_string());
        } else if let Some(value) = field_value(line, "id") {
            self.id = Some(value.to_string());
        }
        None
    }

    /// Whatever was buffered when the input ended.
    pub fn finish(&mut self) -> Option<Frame> {
        self.take()
    }

    fn take(&mut self) -> Option<Frame> {
        if self.event.is_none() && self.data.is_empty() && self.id.is_none() {
            return None;
        }
        Some(Frame {
            event: self.event.take().unwrap_or_default(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        })
    }
}

fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn decode_line<'a>(raw: &'a [u8], logid: &str) -> Result<&'a str, CozeError> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    std::str::from_utf8(raw).map_err(|_| {
        StreamError::InvalidEvent {
            field: String::new(),
            data: String::from_utf8_lossy(raw).into_owned(),
            logid: logid.to_string(),
        }
        .into()
    })
}

pub(crate) enum Step<E> {
    Event(E),
    Done,
}

pub(crate) fn interpret<E: StreamEvent>(frame: Frame, meta: &ResponseMeta) -> Result<Step<E>, CozeError> {
    if frame.event == E::DONE {
        return Ok(Step::Done);
    }
    if frame.event == E::ERROR {
        return Err(classify(meta.status, frame.data.as_bytes(), meta.logid()));
    }
    E::from_frame(frame, meta.logid()).map(Step::Event)
}

/// Outcome of a stream whose input ended: only a buffered terminator is clean.
///
/// Any other unterminated frame was cut off, so it is never decoded; an
/// error frame is still raised as the server's error.
fn at_eof<E: StreamEvent>(decoder: &mut FrameDecoder, meta: &ResponseMeta) -> Option<CozeError> {
    match decoder.finish() {
        Some(frame) if frame.event == E::DONE => None,
        Some(frame) if frame.event == E::ERROR => Some(classify(meta.status, frame.data.as_bytes(), meta.logid())),
        _ => Some(
            StreamError::UnexpectedEof {
                logid: meta.logid().to_string(),
            }
            .into(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

/// Blocking event sequence over a line reader.
pub struct EventStream<E, R> {
    reader: Option<R>,
    decoder: FrameDecoder,
    meta: ResponseMeta,
    line: Vec<u8>,
    _event: PhantomData<fn() -> E>,
}

impl<E: StreamEvent, R: BufRead> EventStream<E, R> {
    pub fn new(reader: R, meta: ResponseMeta) -> Self {
        Self {
            reader: Some(reader),
            decoder: FrameDecoder::default(),
            meta,
            line: Vec::new(),
            _event: PhantomData,
        }
    }

    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub fn logid(&self) -> &str {
        self.meta.logid()
    }

    /// True once the underlying connection has been released.
    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Stop consuming and release the connection.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.reader.take().is_some() {
            debug!(logid = self.meta.logid(), "event stream released");
        }
    }

    fn fail(&mut self, err: CozeError) -> Option<Result<E, CozeError>> {
        self.release();
        Some(Err(err))
    }
}

impl<E: StreamEvent, R: BufRead> Iterator for EventStream<E, R> {
    type Item = Result<E, CozeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = self.reader.as_mut()?;
            self.line.clear();
            let read = match reader.read_until(b'\n', &mut self.line) {
                Ok(n) => n,
                Err(e) => return self.fail(e.into()),
            };

            if read == 0 {
                let outcome = at_eof::<E>(&mut self.decoder, &self.meta);
                self.release();
                return outcome.map(Err);
            }

            let line = match decode_line(&self.line, self.meta.logid()) {
                Ok(line) => line,
                Err(e) => return self.fail(e),
            };
            let Some(frame) = self.decoder.push_line(line) else {
                continue;
            };

            match interpret::<E>(frame, &self.meta) {
                Ok(Step::Event(event)) => return Some(Ok(event)),
                Ok(Step::Done) => {
                    self.release();
                    return None;
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl<E: StreamEvent, R: BufRead> FusedIterator for EventStream<E, R> {}

impl<E, R> std::fmt::Debug for EventStream<E, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("logid", &self.meta.logid())
            .field("closed", &self.reader.is_none())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Async
// ---------------------------------------------------------------------------

/// Splits a chunked byte stream into lines.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        Some(self.buf.drain(..=end).collect())
    }

    fn take_rest(&mut self) -> Option<Vec<u8>> {
        (!self.buf.is_empty()).then(|| std::mem::take(&mut self.buf))
    }
}

/// Suspending event sequence over a byte stream.
pub struct AsyncEventStream<E> {
    inner: Pin<Box<dyn Stream<Item = Result<E, CozeError>> + Send>>,
    meta: ResponseMeta,
}

impl<E: StreamEvent + Send + 'static> AsyncEventStream<E> {
    pub fn new<S, X>(bytes: S, meta: ResponseMeta) -> Self
    where
        S: Stream<Item = Result<Bytes, X>> + Send + 'static,
        X: Into<CozeError> + Send + 'static,
    {
        let inner = decode_stream::<E, S, X>(bytes, meta.clone());
        Self {
            inner: Box::pin(inner),
            meta,
        }
    }
}

impl<E> AsyncEventStream<E> {
    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub fn logid(&self) -> &str {
        self.meta.logid()
    }

    /// Stop consuming and release the connection.
    pub fn close(self) {
        debug!(logid = self.meta.logid(), "event stream released");
    }
}

impl<E> std::fmt::Debug for AsyncEventStream<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEventStream")
            .field("logid", &self.meta.logid())
            .finish_non_exhaustive()
    }
}

impl<E> Stream for AsyncEventStream<E> {
    type Item = Result<E, CozeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn decode_stream<E, S, X>(bytes: S, meta: ResponseMeta) -> impl Stream<Item = Result<E, CozeError>> + Send
where
    E: StreamEvent + Send + 'static,
    S: Stream<Item = Result<Bytes, X>> + Send + 'static,
    X: Into<CozeError> + Send + 'static,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut lines = LineBuffer::default();
        let mut decoder = FrameDecoder::default();

        loop {
            let chunk = match bytes.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    yield Err(e.into());
                    return;
                }
                None => {
                    if let Some(rest) = lines.take_rest() {
                        match decode_line(&rest, meta.logid()) {
                            Ok(line) => {
                                if let Some(frame) = decoder.push_line(line) {
                                    match interpret::<E>(frame, &meta) {
                                        Ok(Step::Event(event)) => yield Ok(event),
                                        Ok(Step::Done) => return,
                                        Err(e) => {
                                            yield Err(e);
                                            return;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                    if let Some(e) = at_eof::<E>(&mut decoder, &meta) {
                        yield Err(e);
                    }
                    return;
                }
            };

            lines.extend(&chunk);
            while let Some(raw) = lines.next_line() {
                let line = match decode_line(&raw, meta.logid()) {
                    Ok(line) => line,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let Some(frame) = decoder.push_line(line) else {
                    continue;
                };
                match interpret::<E>(frame, &meta) {
                    Ok(Step::Event(event)) => yield Ok(event),
                    Ok(Step::Done) => return,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
    }
}
