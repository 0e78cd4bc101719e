//! WebSocket session actors for the producer and viewer endpoints.

mod producer;
mod viewer;

use actix::{Actor, StreamHandler, prelude::Stream};
use actix_http::{
    error::PayloadError,
    ws::{Codec, Message, ProtocolError},
};
use actix_web::{Error, HttpRequest, HttpResponse, web::Bytes};
use actix_web_actors::ws::{WebsocketContext, handshake};

pub(crate) use producer::ProducerSession;
pub(crate) use viewer::ViewerSession;

/// Start a WebSocket connection with a custom codec.
pub(crate) fn start_with_codec<A, S>(
    actor: A,
    req: &HttpRequest,
    stream: S,
    codec: Codec,
) -> Result<HttpResponse, Error>
where
    A: Actor<Context = WebsocketContext<A>> + StreamHandler<Result<Message, ProtocolError>>,
    S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
{
    let mut res = handshake(req)?;
    Ok(res.streaming(WebsocketContext::with_codec(actor, stream, codec)))
}
