//! Connection lifecycle and message routing.
//!
//! Data flows one way through the core:
//! acceptor -> dispatcher (join) -> session read loop -> dispatcher
//! (inbound) -> every session's outbound queue -> session write loop.
//!
//! The dispatcher is the only task that touches the registry; everything
//! else talks to it over channels.

mod acceptor;
mod codec;
mod dispatcher;
mod identity;
mod message;
mod queue;
mod registry;
mod session;
mod transport;

pub(crate) use acceptor::Acceptor;
pub(crate) use codec::LineCodec;
pub(crate) use dispatcher::{Dispatcher, DispatcherHandle, RelayPolicy};
pub(crate) use identity::IdentityKind;
pub(crate) use queue::OverflowPolicy;
pub(crate) use session::SessionSettings;
pub(crate) use transport::{bind, connect, BoundListener, Endpoint};
