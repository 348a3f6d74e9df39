use std::{
    fmt,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{ready, Context, Poll},
};

use bytes::{Buf, Bytes};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use tower::BoxError;

struct Shared<B> {
    origin: Option<B>,
    chunks: Vec<Bytes>,
    trailers: Option<HeaderMap>,
    finished: bool,
    failed: Option<String>,
}

/// A request body that can be replayed from the beginning.
///
/// Wraps a streaming body and captures every data frame as it passes through,
/// so that later clones can serve the identical byte sequence without touching
/// the origin again. All clones share a single capture buffer and chunks are
/// reference-counted rather than copied, so cloning is cheap no matter how
/// large the body is.
///
/// A clone always starts from the first byte, regardless of how far any other
/// handle has read. Trailers are captured and replayed as well, and if the
/// origin failed mid-stream, clones observe the same failure at the same
/// position in the stream.
pub struct ReplayBody<B> {
    shared: Arc<Mutex<Shared<B>>>,
    cursor: usize,
    trailers_done: bool,
}

impl<B> ReplayBody<B> {
    /// Creates a replayable wrapper around `origin`.
    ///
    /// The origin is only ever pulled once. Frames are served out of the
    /// capture buffer whenever it already holds them, and the origin is pulled
    /// only when a handle reads past the end of what has been captured so far.
    pub fn new(origin: B) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                origin: Some(origin),
                chunks: Vec::new(),
                trailers: None,
                finished: false,
                failed: None,
            })),
            cursor: 0,
            trailers_done: false,
        }
    }
}

impl<B> Clone for ReplayBody<B> {
    fn clone(&self) -> Self {
        // New handles always rewind to the start of the stream.
        Self {
            shared: Arc::clone(&self.shared),
            cursor: 0,
            trailers_done: false,
        }
    }
}

impl<B> Body for ReplayBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>, cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let mut shared = this.shared.lock().unwrap();

        loop {
            // Serve out of the capture buffer first.
            if this.cursor < shared.chunks.len() {
                let chunk = shared.chunks[this.cursor].clone();
                this.cursor += 1;
                return Poll::Ready(Some(Ok(Frame::data(chunk))));
            }

            if let Some(message) = &shared.failed {
                return Poll::Ready(Some(Err(message.clone().into())));
            }

            if shared.finished {
                if !this.trailers_done {
                    this.trailers_done = true;
                    if let Some(trailers) = shared.trailers.clone() {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                }
                return Poll::Ready(None);
            }

            // This handle has read everything captured so far and the origin
            // is still live, so pull the next frame and record what we see.
            let origin = shared.origin.as_mut().expect("origin must be live until finished");
            match ready!(Pin::new(origin).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(mut data) => {
                        let chunk = data.copy_to_bytes(data.remaining());
                        shared.chunks.push(chunk.clone());
                        this.cursor += 1;
                        return Poll::Ready(Some(Ok(Frame::data(chunk))));
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            shared.trailers = Some(trailers);
                        }
                        shared.finished = true;
                        shared.origin = None;
                    }
                },
                Some(Err(e)) => {
                    let e = e.into();
                    shared.failed = Some(e.to_string());
                    shared.origin = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    shared.finished = true;
                    shared.origin = None;
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.failed.is_none()
            && shared.finished
            && self.cursor >= shared.chunks.len()
            && (self.trailers_done || shared.trailers.is_none())
    }

    fn size_hint(&self) -> SizeHint {
        let shared = self.shared.lock().unwrap();
        let buffered = shared
            .chunks
            .iter()
            .skip(self.cursor)
            .map(|chunk| chunk.len() as u64)
            .sum::<u64>();

        match shared.origin.as_ref() {
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

impl<B> fmt::Debug for ReplayBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock().unwrap();
        f.debug_struct("ReplayBody")
            .field("captured_chunks", &shared.chunks.len())
            .field("finished", &shared.finished)
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use http::HeaderValue;
    use http_body_util::{BodyExt as _, Full, StreamBody};
    use tokio_test::{assert_pending, assert_ready, task::spawn as test_spawn};

    use super::*;

    fn chunked(parts: &[&'static str]) -> StreamBody<stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, BoxError>>>> {
        let frames = parts
            .iter()
            .map(|part| Ok(Frame::data(Bytes::from_static(part.as_bytes()))))
            .collect::<Vec<_>>();
        StreamBody::new(stream::iter(frames))
    }

    #[tokio::test]
    async fn replays_captured_bytes() {
        let body = ReplayBody::new(Full::new(Bytes::from_static(b"hello world")));
        let replay = body.clone();

        let first = body.collect().await.unwrap().to_bytes();
        assert_eq!(first.as_ref(), b"hello world");

        let second = replay.collect().await.unwrap().to_bytes();
        assert_eq!(second.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn clone_restarts_from_the_beginning() {
        let mut body = ReplayBody::new(chunked(&["alpha", "beta", "gamma"]));

        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first.as_ref(), b"alpha");

        // Cloned mid-read: the clone sees the whole stream, the original
        // handle continues from where it stopped.
        let replay = body.clone();
        let replayed = replay.collect().await.unwrap().to_bytes();
        assert_eq!(replayed.as_ref(), b"alphabetagamma");

        let rest = body.collect().await.unwrap().to_bytes();
        assert_eq!(rest.as_ref(), b"betagamma");
    }

    #[tokio::test]
    async fn shares_captured_chunks_without_copying() {
        let body = ReplayBody::new(Full::new(Bytes::from_static(b"shared payload")));
        let replay = body.clone();

        let first = body.collect().await.unwrap().to_bytes();
        let second = replay.collect().await.unwrap().to_bytes();

        // Same backing storage, not a copy.
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[tokio::test]
    async fn replays_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));

        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"payload"))),
            Ok(Frame::trailers(trailers.clone())),
        ];
        let body = ReplayBody::new(StreamBody::new(stream::iter(frames)));
        let replay = body.clone();

        let first = body.collect().await.unwrap();
        assert_eq!(first.trailers(), Some(&trailers));

        let second = replay.collect().await.unwrap();
        assert_eq!(second.trailers(), Some(&trailers));
    }

    #[tokio::test]
    async fn replays_mid_stream_failure() {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err("stream reset".into()),
        ];
        let mut body = ReplayBody::new(StreamBody::new(stream::iter(frames)));
        let replay = body.clone();

        let chunk = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(chunk.as_ref(), b"partial");
        let err = body.frame().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "stream reset");

        // The clone sees the captured prefix and then the same failure.
        let replayed_err = replay.collect().await.unwrap_err();
        assert_eq!(replayed_err.to_string(), "stream reset");
    }

    #[tokio::test]
    async fn reports_exact_size_once_fully_captured() {
        let body = ReplayBody::new(chunked(&["four", "more"]));
        let replay = body.clone();

        assert!(!replay.is_end_stream());
        body.collect().await.unwrap();

        assert_eq!(replay.size_hint().exact(), Some(8));
        let replayed = replay.collect().await.unwrap().to_bytes();
        assert_eq!(replayed.as_ref(), b"fourmore");
    }

    #[test]
    fn reader_pends_while_the_origin_stalls() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Frame<Bytes>, BoxError>>();
        let mut body = ReplayBody::new(StreamBody::new(rx));

        // Nothing captured and nothing to pull yet.
        let mut pull = test_spawn(body.frame());
        assert_pending!(pull.poll());

        tx.unbounded_send(Ok(Frame::data(Bytes::from_static(b"late")))).unwrap();
        assert!(pull.is_woken());

        let frame = assert_ready!(pull.poll()).unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap().as_ref(), b"late");
    }
}
