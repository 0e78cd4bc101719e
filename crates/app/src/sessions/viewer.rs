//! Viewer socket. Holds a registry entry until the peer goes away.

use std::{sync::Arc, time::Duration};

use actix::{
    Actor, ActorContext, AsyncContext, Handler, Message, Recipient, Running, StreamHandler,
    clock::Instant, prelude::SendError,
};
use actix_web_actors::ws::{self, WebsocketContext};
use tracing::{debug, warn};
use vision::{Broadcaster, DeliveryError, ViewerId, ViewerSink};

/// Serialised `update` payload for one viewer.
#[derive(Message)]
#[rtype(result = "()")]
pub(crate) struct FrameUpdate(pub(crate) Arc<str>);

/// Sent when the broadcaster prunes this viewer.
#[derive(Message)]
#[rtype(result = "()")]
pub(crate) struct Evict;

/// Registry handle backed by the session's mailbox.
struct MailboxSink {
    updates: Recipient<FrameUpdate>,
    evict: Recipient<Evict>,
}

impl ViewerSink for MailboxSink {
    fn deliver(&self, payload: Arc<str>) -> Result<(), DeliveryError> {
        self.updates
            .try_send(FrameUpdate(payload))
            .map_err(|err| match err {
                SendError::Full(_) => DeliveryError::Backlogged,
                SendError::Closed(_) => DeliveryError::Closed,
            })
    }

    fn close(&self) {
        self.evict.do_send(Evict);
    }
}

/// Remembers the last payload written so a state is never sent twice.
#[derive(Debug, Default)]
pub(crate) struct LastSent(Option<Arc<str>>);

impl LastSent {
    /// Records `payload` and returns whether it differs from the previous one.
    pub(crate) fn replace(&mut self, payload: &Arc<str>) -> bool {
        if let Some(previous) = &self.0 {
            if Arc::ptr_eq(previous, payload) {
                return false;
            }
        }
        self.0 = Some(payload.clone());
        true
    }
}

pub(crate) struct ViewerSession {
    id: Option<ViewerId>,
    last_sent: LastSent,
    broadcaster: Arc<Broadcaster>,
    mailbox: usize,
    heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl ViewerSession {
    pub(crate) fn new(
        broadcaster: Arc<Broadcaster>,
        mailbox: usize,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            id: None,
            last_sent: LastSent::default(),
            broadcaster,
            mailbox: mailbox.max(1),
            heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    fn start_heartbeat(&self, ctx: &mut WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > act.client_timeout {
                if let Some(id) = act.id {
                    warn!(viewer = %id, "viewer heartbeat timed out, disconnecting");
                }
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for ViewerSession {
    type Context = WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(self.mailbox);
        let addr = ctx.address();
        let sink = MailboxSink {
            updates: addr.clone().recipient(),
            evict: addr.recipient(),
        };
        let id = self.broadcaster.registry().add(Arc::new(sink));
        self.id = Some(id);
        debug!(viewer = %id, "viewer session started");

        // A broadcast may already have queued this state; `last_sent` skips the repeat.
        if let Some(payload) = self.broadcaster.current_payload() {
            if self.last_sent.replace(&payload) {
                ctx.text(&*payload);
            }
        }
        self.start_heartbeat(ctx);
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        if let Some(id) = self.id.take() {
            self.broadcaster.registry().remove(id);
            debug!(viewer = %id, "viewer session stopped");
        }
        Running::Stop
    }
}

impl Handler<FrameUpdate> for ViewerSession {
    type Result = ();

    fn handle(&mut self, msg: FrameUpdate, ctx: &mut Self::Context) -> Self::Result {
        if self.last_sent.replace(&msg.0) {
            ctx.text(&*msg.0);
        }
    }
}

impl Handler<Evict> for ViewerSession {
    type Result = ();

    fn handle(&mut self, _msg: Evict, ctx: &mut Self::Context) -> Self::Result {
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Again,
            description: Some("viewer fell behind".to_string()),
        }));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ViewerSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match item {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = ?err, "viewer protocol error");
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Ping(msg) => {
                self.heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            ws::Message::Pong(_) | ws::Message::Text(_) | ws::Message::Binary(_) => {
                self.heartbeat = Instant::now();
            }
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) | ws::Message::Nop => {}
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop()
    }
}
