use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt as _};
use tower::BoxError;

/// A bounded peek into a response body.
///
/// Retry strategies sometimes need to look at the start of a response body
/// before deciding whether to retry. The preview pulls frames from the origin
/// until it holds at least the configured number of bytes or the body ends,
/// and keeps every captured frame intact so the full body can still be
/// delivered to the caller afterwards.
///
/// With a limit of zero the preview is disabled and the origin body is never
/// polled.
pub struct ContentPreview {
    origin: Option<UnsyncBoxBody<Bytes, BoxError>>,
    captured: Vec<Bytes>,
    captured_len: usize,
    limit: usize,
    trailers: Option<HeaderMap>,
    ended: bool,
    failed: Option<String>,
}

impl ContentPreview {
    pub(crate) fn new(origin: UnsyncBoxBody<Bytes, BoxError>, limit: usize) -> Self {
        Self {
            origin: Some(origin),
            captured: Vec::new(),
            captured_len: 0,
            limit,
            trailers: None,
            ended: false,
            failed: None,
        }
    }

    /// Returns up to `limit` bytes from the front of the body.
    ///
    /// The first call drives the origin body until enough bytes are buffered
    /// or the body ends. Later calls serve the same window without touching
    /// the origin again. If the body fails while being buffered, the error is
    /// returned here and the failure is also observed by whoever consumes the
    /// remaining body.
    pub async fn bytes(&mut self) -> Result<Bytes, BoxError> {
        while self.failed.is_none() && !self.ended && self.captured_len < self.limit {
            let origin = match self.origin.as_mut() {
                Some(origin) => origin,
                None => break,
            };

            match origin.frame().await {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        self.captured_len += data.len();
                        self.captured.push(data);
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.trailers = Some(trailers);
                        }
                        self.ended = true;
                        self.origin = None;
                    }
                },
                Some(Err(e)) => {
                    self.failed = Some(e.to_string());
                    self.origin = None;
                    return Err(e);
                }
                None => {
                    self.ended = true;
                    self.origin = None;
                }
            }
        }

        Ok(self.window())
    }

    fn window(&self) -> Bytes {
        if self.limit == 0 || self.captured.is_empty() {
            return Bytes::new();
        }

        // Single captured chunk is the common case and needs no copy.
        if self.captured.len() == 1 {
            let chunk = &self.captured[0];
            return if chunk.len() <= self.limit {
                chunk.clone()
            } else {
                chunk.slice(..self.limit)
            };
        }

        let mut window = BytesMut::with_capacity(self.limit.min(self.captured_len));
        let mut budget = self.limit;
        for chunk in &self.captured {
            if budget == 0 {
                break;
            }
            let take = budget.min(chunk.len());
            window.extend_from_slice(&chunk[..take]);
            budget -= take;
        }
        window.freeze()
    }

    /// Reassembles the full response body, captured frames included.
    pub(crate) fn into_body(self) -> PreviewedBody {
        PreviewedBody {
            captured: self.captured.into(),
            origin: self.origin,
            trailers: self.trailers,
            failed: self.failed,
        }
    }
}

impl fmt::Debug for ContentPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentPreview")
            .field("limit", &self.limit)
            .field("captured_len", &self.captured_len)
            .field("ended", &self.ended)
            .finish()
    }
}

/// Response body handed back to the caller once the retry loop settles.
///
/// Replays whatever the content preview buffered, then streams the rest of
/// the origin body untouched. If the origin failed during previewing, the
/// captured prefix is delivered before the same failure is raised again.
pub struct PreviewedBody {
    captured: VecDeque<Bytes>,
    origin: Option<UnsyncBoxBody<Bytes, BoxError>>,
    trailers: Option<HeaderMap>,
    failed: Option<String>,
}

impl Body for PreviewedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>, cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(chunk) = this.captured.pop_front() {
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }

        if let Some(origin) = this.origin.as_mut() {
            match ready!(Pin::new(origin).poll_frame(cx)) {
                Some(Ok(frame)) => return Poll::Ready(Some(Ok(frame))),
                Some(Err(e)) => {
                    this.origin = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => this.origin = None,
            }
        }

        if let Some(message) = this.failed.take() {
            return Poll::Ready(Some(Err(message.into())));
        }

        if let Some(trailers) = this.trailers.take() {
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }

        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.captured.is_empty()
            && self.failed.is_none()
            && self.trailers.is_none()
            && self.origin.as_ref().map_or(true, |origin| origin.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        let buffered = self.captured.iter().map(|chunk| chunk.len() as u64).sum::<u64>();
        match self.origin.as_ref() {
            Some(origin) => {
                let origin_hint = origin.size_hint();
                let mut hint = SizeHint::new();
                hint.set_lower(buffered + origin_hint.lower());
                if let Some(upper) = origin_hint.upper() {
                    hint.set_upper(buffered + upper);
                }
                hint
            }
            None => SizeHint::with_exact(buffered),
        }
    }
}

impl fmt::Debug for PreviewedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewedBody")
            .field("buffered_chunks", &self.captured.len())
            .field("streaming", &self.origin.is_some())
            .finish()
    }
}
