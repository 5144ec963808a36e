use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at};

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, Infallible>> + Send>>;

/// Wraps a response body stream and fires `notifier` when the body is
/// dropped, which is how hyper lets go of a body once the client has
/// gone away.
pub struct DetectDisconnect<S> {
    inner: S,
    notifier: Option<oneshot::Sender<()>>,
}

impl<S> DetectDisconnect<S> {
    pub fn new(inner: S, notifier: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            notifier: Some(notifier),
        }
    }
}

impl<S> Stream for DetectDisconnect<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for DetectDisconnect<S> {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.take() {
            // Fails when the exchange already finished
            let _ = notifier.send(());
        }
    }
}

/// Newline-delimited body fed from `rx`. A blank line goes out after
/// every `heartbeat` of silence so writes to a vanished client fail
/// even while the model is thinking.
pub fn ndjson_body(mut rx: mpsc::UnboundedReceiver<Bytes>, heartbeat: Duration) -> BodyStream {
    Box::pin(async_stream::stream! {
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        loop {
            let item = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(bytes) => {
                        ticker.reset();
                        bytes
                    }
                    None => break,
                },
                _ = ticker.tick() => Bytes::from_static(b"\n"),
            };
            yield Ok::<_, Infallible>(item);
        }
    })
}
