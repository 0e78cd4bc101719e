//! Producer socket: forwards binary frames into the ingest thread.

use std::time::Duration;

use actix::{
    Actor, ActorContext, ActorFutureExt, AsyncContext, Running, StreamHandler, WrapFuture,
    clock::Instant,
};
use actix_http::ws::Item;
use actix_web::web;
use actix_web_actors::ws::{self, WebsocketContext};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use vision::{IngestOverflow, IngestSession, RelayConfig, telemetry};

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum AssemblyError {
    #[error("fragmented message exceeds {limit} bytes")]
    Overflow { limit: usize },
    #[error("new message started before the previous one finished")]
    Interleaved,
    #[error("continuation frame without a starting frame")]
    NotStarted,
}

#[derive(Debug)]
enum Partial {
    Binary(Vec<u8>),
    /// Text is ignored, but its fragments still have to be consumed.
    Text,
}

/// Reassembles a fragmented WebSocket message into one producer frame.
#[derive(Debug)]
pub(crate) struct FrameAssembler {
    limit: usize,
    partial: Option<Partial>,
}

impl FrameAssembler {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            partial: None,
        }
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one continuation item. Returns the whole binary message on its last fragment.
    pub(crate) fn push(&mut self, item: Item) -> Result<Option<Vec<u8>>, AssemblyError> {
        match item {
            Item::FirstBinary(bytes) => {
                self.start(Partial::Binary(Vec::with_capacity(bytes.len())))?;
                self.extend(&bytes)?;
                Ok(None)
            }
            Item::FirstText(_) => {
                self.start(Partial::Text)?;
                Ok(None)
            }
            Item::Continue(bytes) => {
                self.extend(&bytes)?;
                Ok(None)
            }
            Item::Last(bytes) => {
                self.extend(&bytes)?;
                match self.partial.take() {
                    Some(Partial::Binary(frame)) => Ok(Some(frame)),
                    _ => Ok(None),
                }
            }
        }
    }

    fn start(&mut self, partial: Partial) -> Result<(), AssemblyError> {
        if self.partial.is_some() {
            return Err(AssemblyError::Interleaved);
        }
        self.partial = Some(partial);
        Ok(())
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<(), AssemblyError> {
        match self.partial.as_mut() {
            None => Err(AssemblyError::NotStarted),
            Some(Partial::Text) => Ok(()),
            Some(Partial::Binary(frame)) => {
                if frame.len() + bytes.len() > self.limit {
                    return Err(AssemblyError::Overflow { limit: self.limit });
                }
                frame.extend_from_slice(bytes);
                Ok(())
            }
        }
    }
}

/// Result of handing one frame to the ingest channel without blocking.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Offer {
    Queued,
    Dropped,
    /// Channel full under backpressure; the frame comes back to be sent blocking.
    Full(Vec<u8>),
    Closed,
}

pub(crate) fn offer(frames: &Sender<Vec<u8>>, frame: Vec<u8>, overflow: IngestOverflow) -> Offer {
    match frames.try_send(frame) {
        Ok(()) => Offer::Queued,
        Err(TrySendError::Full(frame)) => match overflow {
            IngestOverflow::Backpressure => Offer::Full(frame),
            IngestOverflow::Drop => Offer::Dropped,
        },
        Err(TrySendError::Disconnected(_)) => Offer::Closed,
    }
}

pub(crate) struct ProducerSession {
    id: u64,
    frames: Option<Sender<Vec<u8>>>,
    pending: Option<(IngestSession, Receiver<Vec<u8>>)>,
    assembler: FrameAssembler,
    overflow: IngestOverflow,
    heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    dropped: u64,
    stalls: u64,
}

impl ProducerSession {
    /// `ingest` must already hold the producer lease.
    pub(crate) fn new(ingest: IngestSession, config: &RelayConfig) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(config.ingest_queue.max(1));
        Self {
            id: ingest.id(),
            frames: Some(tx),
            pending: Some((ingest, rx)),
            assembler: FrameAssembler::new(config.max_frame_bytes),
            overflow: config.ingest_overflow,
            heartbeat: Instant::now(),
            heartbeat_interval: config.heartbeat_interval,
            client_timeout: config.client_timeout,
            dropped: 0,
            stalls: 0,
        }
    }

    fn start_heartbeat(&self, ctx: &mut WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > act.client_timeout {
                warn!(producer = act.id, "producer heartbeat timed out, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn forward(&mut self, frame: Vec<u8>, ctx: &mut WebsocketContext<Self>) {
        let Some(frames) = self.frames.as_ref() else {
            return;
        };
        match offer(frames, frame, self.overflow) {
            Offer::Queued => {}
            Offer::Dropped => {
                self.dropped += 1;
                metrics::counter!("relay_producer_frames_dropped_total").increment(1);
                debug!(
                    producer = self.id,
                    dropped = self.dropped,
                    "ingest busy, dropping frame"
                );
            }
            Offer::Full(frame) => self.wait_for_room(frame, ctx),
            Offer::Closed => {
                error!(producer = self.id, "ingest thread gone, closing producer");
                ctx.stop();
            }
        }
    }

    /// Block the send on the blocking pool. The context stops reading the
    /// socket until it completes, so the producer is throttled by TCP.
    fn wait_for_room(&mut self, frame: Vec<u8>, ctx: &mut WebsocketContext<Self>) {
        let Some(frames) = self.frames.clone() else {
            return;
        };
        self.stalls += 1;
        metrics::counter!("relay_producer_backpressure_total").increment(1);
        debug!(producer = self.id, stalls = self.stalls, "ingest busy, pausing producer");

        ctx.wait(
            web::block(move || frames.send(frame))
                .into_actor(self)
                .map(|result, act, ctx| {
                    act.heartbeat = Instant::now();
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            error!(producer = act.id, "ingest thread gone, closing producer");
                            ctx.stop();
                        }
                        Err(err) => {
                            error!(producer = act.id, error = %err, "blocking send failed");
                            ctx.stop();
                        }
                    }
                }),
        );
    }
}

impl Actor for ProducerSession {
    type Context = WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let Some((ingest, frames)) = self.pending.take() else {
            return;
        };
        let name = format!("relay-ingest-{}", self.id);
        if let Err(err) = telemetry::spawn_thread(name, move || ingest.run(frames)) {
            error!(producer = self.id, error = %err, "failed to spawn ingest thread");
            ctx.stop();
            return;
        }
        info!(producer = self.id, overflow = ?self.overflow, "producer connected");
        self.start_heartbeat(ctx);
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        // Closing the channel ends the ingest loop, which releases the lease.
        self.frames.take();
        info!(
            producer = self.id,
            dropped = self.dropped,
            stalls = self.stalls,
            "producer disconnected"
        );
        Running::Stop
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ProducerSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match item {
            Ok(msg) => msg,
            Err(err) => {
                error!(producer = self.id, error = ?err, "producer protocol error");
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Binary(_) | ws::Message::Text(_) if self.assembler.in_progress() => {
                warn!(producer = self.id, "data frame interleaved with a fragmented message");
                ctx.stop();
            }
            ws::Message::Binary(data) => {
                self.heartbeat = Instant::now();
                self.forward(data.to_vec(), ctx);
            }
            ws::Message::Text(_) => {
                self.heartbeat = Instant::now();
                debug!(producer = self.id, "ignoring text message from producer");
            }
            ws::Message::Continuation(item) => {
                self.heartbeat = Instant::now();
                match self.assembler.push(item) {
                    Ok(Some(frame)) => self.forward(frame, ctx),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(producer = self.id, error = %err, "dropping producer");
                        let code = match err {
                            AssemblyError::Overflow { .. } => ws::CloseCode::Size,
                            AssemblyError::Interleaved | AssemblyError::NotStarted => {
                                ws::CloseCode::Protocol
                            }
                        };
                        ctx.close(Some(ws::CloseReason {
                            code,
                            description: Some(err.to_string()),
                        }));
                        ctx.stop();
                    }
                }
            }
            ws::Message::Ping(msg) => {
                self.heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            ws::Message::Pong(_) => {
                self.heartbeat = Instant::now();
            }
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Nop => {}
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop()
    }
}

#[cfg(test)]
mod tests {
    use actix_web::web::Bytes;

    use super::*;

    fn binary(bytes: &'static [u8]) -> Bytes {
        Bytes::from_static(bytes)
    }

    #[test]
    fn fragments_are_joined_into_one_frame() {
        let mut assembler = FrameAssembler::new(64);
        assert_eq!(assembler.push(Item::FirstBinary(binary(b"ab"))), Ok(None));
        assert!(assembler.in_progress());
        assert_eq!(assembler.push(Item::Continue(binary(b"cd"))), Ok(None));
        assert_eq!(
            assembler.push(Item::Last(binary(b"e"))),
            Ok(Some(b"abcde".to_vec()))
        );
        assert!(!assembler.in_progress());

        assert_eq!(assembler.push(Item::FirstBinary(binary(b"x"))), Ok(None));
        assert_eq!(
            assembler.push(Item::Last(binary(b""))),
            Ok(Some(b"x".to_vec()))
        );
    }

    #[test]
    fn fragmented_text_is_consumed_and_discarded() {
        let mut assembler = FrameAssembler::new(4);
        assert_eq!(assembler.push(Item::FirstText(binary(b"hello world"))), Ok(None));
        assert_eq!(assembler.push(Item::Last(binary(b"!"))), Ok(None));
        assert!(!assembler.in_progress());
    }

    #[test]
    fn oversized_reassembly_is_rejected() {
        let mut assembler = FrameAssembler::new(4);
        assert_eq!(assembler.push(Item::FirstBinary(binary(b"abc"))), Ok(None));
        assert_eq!(
            assembler.push(Item::Continue(binary(b"de"))),
            Err(AssemblyError::Overflow { limit: 4 })
        );
    }

    #[test]
    fn out_of_order_items_are_rejected() {
        let mut assembler = FrameAssembler::new(64);
        assert_eq!(
            assembler.push(Item::Continue(binary(b"a"))),
            Err(AssemblyError::NotStarted)
        );
        assert_eq!(
            assembler.push(Item::Last(binary(b"a"))),
            Err(AssemblyError::NotStarted)
        );
        assembler.push(Item::FirstBinary(binary(b"a"))).unwrap();
        assert_eq!(
            assembler.push(Item::FirstBinary(binary(b"b"))),
            Err(AssemblyError::Interleaved)
        );
    }

    #[test]
    fn backpressure_hands_the_frame_back_when_full() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        assert_eq!(offer(&tx, vec![1], IngestOverflow::Backpressure), Offer::Queued);
        assert_eq!(
            offer(&tx, vec![2], IngestOverflow::Backpressure),
            Offer::Full(vec![2])
        );
        assert_eq!(rx.recv().unwrap(), vec![1]);
        assert_eq!(offer(&tx, vec![3], IngestOverflow::Backpressure), Offer::Queued);
    }

    #[test]
    fn drop_policy_discards_the_newest_frame() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        assert_eq!(offer(&tx, vec![1], IngestOverflow::Drop), Offer::Queued);
        assert_eq!(offer(&tx, vec![2], IngestOverflow::Drop), Offer::Dropped);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![vec![1]]);
    }

    #[test]
    fn closed_ingest_is_reported() {
        let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(1);
        drop(rx);
        assert_eq!(offer(&tx, vec![1], IngestOverflow::Backpressure), Offer::Closed);
        assert_eq!(offer(&tx, vec![1], IngestOverflow::Drop), Offer::Closed);
    }
}
