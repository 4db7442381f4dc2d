//! Response body streaming through a pooled buffer.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use hyper::HeaderMap;
use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;

use super::pool::BufferSlot;

pin_project! {
    /// A body that copies upstream data through a borrowed [`BufferSlot`].
    ///
    /// Upstream frames are gathered into the slot and emitted as chunks of
    /// at most one buffer. Whatever has been gathered is flushed as soon as
    /// the upstream has nothing ready, so long-polling responses are not
    /// held back. The slot is released when the stream ends or the body is
    /// dropped, including on I/O error.
    pub struct PooledBody<B> {
        #[pin]
        inner: B,
        slot: Option<BufferSlot>,
        filled: usize,
        pending: Option<Bytes>,
        trailers: Option<HeaderMap>,
        done: bool,
    }
}

impl<B> PooledBody<B> {
    /// Wrap `inner`, streaming it through `slot`.
    pub fn new(inner: B, slot: BufferSlot) -> Self {
        Self {
            inner,
            slot: Some(slot),
            filled: 0,
            pending: None,
            trailers: None,
            done: false,
        }
    }
}

impl<B> Body for PooledBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        loop {
            let Some(slot) = this.slot.as_mut() else {
                return Poll::Ready(None);
            };
            let buf = slot.as_mut_slice();

            if let Some(mut data) = this.pending.take() {
                let n = data.len().min(buf.len() - *this.filled);
                buf[*this.filled..*this.filled + n].copy_from_slice(&data[..n]);
                *this.filled += n;
                data.advance(n);
                if !data.is_empty() {
                    *this.pending = Some(data);
                }
            }

            if *this.filled == buf.len() || (*this.done && *this.filled > 0) {
                let chunk = Bytes::copy_from_slice(&buf[..*this.filled]);
                *this.filled = 0;
                return Poll::Ready(Some(Ok(Frame::data(chunk))));
            }

            if *this.done {
                if this.pending.is_some() {
                    continue;
                }
                if let Some(trailers) = this.trailers.take() {
                    return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                }
                this.slot.take();
                return Poll::Ready(None);
            }

            if this.pending.is_some() {
                continue;
            }

            let frame = match this.inner.as_mut().poll_frame(cx) {
                Poll::Pending if *this.filled > 0 => {
                    let chunk = Bytes::copy_from_slice(&buf[..*this.filled]);
                    *this.filled = 0;
                    return Poll::Ready(Some(Ok(Frame::data(chunk))));
                }
                poll => ready!(poll),
            };

            match frame {
                None => *this.done = true,
                Some(Err(e)) => {
                    this.slot.take();
                    return Poll::Ready(Some(Err(e)));
                }
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => *this.pending = Some(data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            *this.trailers = Some(trailers);
                            *this.done = true;
                        }
                    }
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.slot.is_none()
            || (self.done
                && self.filled == 0
                && self.pending.is_none()
                && self.trailers.is_none())
    }

    fn size_hint(&self) -> SizeHint {
        if self.slot.is_none() {
            return SizeHint::with_exact(0);
        }
        let buffered = (self.filled + self.pending.as_ref().map_or(0, Bytes::len)) as u64;
        let inner = self.inner.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + buffered);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + buffered);
        }
        hint
    }
}
