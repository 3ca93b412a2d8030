//! The dispatcher: single owner of the registry.
//!
//! One control loop serializes every join, inbound line and failure, so the
//! registry is only ever touched from one task. It waits on two sources:
//! - commands (joins from the acceptor, introspection)
//! - session events (inbound lines, loop failures)
//!
//! `tokio::select!` picks among ready branches at random, so a flood on one
//! source cannot starve the other. Fan-out only pushes onto bounded
//! per-session queues and never waits on a client.

use crate::config::Config;
use crate::error::{ReadFailure, RelayError, Result};
use crate::relay::codec::LineCodec;
use crate::relay::identity::{validate_name, AssignIdentity, IdentityKind};
use crate::relay::message::Message;
use crate::relay::queue::Push;
use crate::relay::registry::{ConnectionId, Registry};
use crate::relay::session::{self, SessionEvent, SessionSettings};
use crate::relay::transport::{BoxedStream, PeerAddr};
use bytes::Bytes;
use futures::SinkExt;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the join/command channel.
const COMMAND_CAPACITY: usize = 64;

/// Capacity of the shared session event channel.
const EVENT_CAPACITY: usize = 1024;

/// How long a refused connection gets to take its notice.
const REFUSAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Prefix of an inbound rename request.
const RENAME_COMMAND: &str = "/nick ";

/// Relay behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Deliver a sender's own lines back to it.
    pub echo_to_sender: bool,
    pub identity: IdentityKind,
    pub default_name: String,
    /// Broadcast join/leave notices as system messages.
    pub announce: bool,
    /// Treat `/nick <name>` lines as rename requests.
    pub allow_rename: bool,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
            identity: IdentityKind::Fixed,
            default_name: "dodo".to_string(),
            announce: false,
            allow_rename: false,
        }
    }
}

/// A registered session as seen from outside the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: ConnectionId,
    pub identity: String,
}

enum Command {
    Join { stream: BoxedStream, peer: PeerAddr },
    Members(oneshot::Sender<Vec<Member>>),
}

/// Cloneable way into the dispatcher's control loop.
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    /// Submit a freshly accepted connection.
    pub async fn join(&self, stream: BoxedStream, peer: PeerAddr) -> Result<()> {
        self.commands
            .send(Command::Join { stream, peer })
            .await
            .map_err(|_| RelayError::DispatcherGone)
    }

    /// Snapshot of the registry, taken inside the control loop.
    pub async fn members(&self) -> Result<Vec<Member>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Members(tx))
            .await
            .map_err(|_| RelayError::DispatcherGone)?;
        rx.await.map_err(|_| RelayError::DispatcherGone)
    }
}

pub struct Dispatcher {
    registry: Registry,
    identities: Box<dyn AssignIdentity>,
    policy: RelayPolicy,
    settings: SessionSettings,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<SessionEvent>,
    events_tx: mpsc::Sender<SessionEvent>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher and the handle used to feed it.
    pub fn new(
        config: &Config,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> (Self, DispatcherHandle) {
        let identities = config.relay.identity.build(&config.relay.default_name);
        Self::with_identities(config, identities, tracker, shutdown)
    }

    /// Create a dispatcher with a custom identity strategy.
    pub fn with_identities(
        config: &Config,
        identities: Box<dyn AssignIdentity>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> (Self, DispatcherHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);

        let dispatcher = Dispatcher {
            registry: Registry::new(config.max_clients),
            identities,
            policy: config.relay.clone(),
            settings: config.session.clone(),
            commands,
            events,
            events_tx,
            tracker,
            shutdown,
        };
        let handle = DispatcherHandle {
            commands: commands_tx,
        };
        (dispatcher, handle)
    }

    /// Run the control loop until shutdown.
    ///
    /// Returns an error only if the registry invariant is broken.
    pub async fn run(mut self) -> Result<()> {
        info!(capacity = self.registry.capacity(), "Dispatcher started");

        let result = loop {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                    Ok(())
                }
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        if !self.registry.is_empty() {
            debug!(sessions = self.registry.len(), "Closing remaining sessions");
        }
        let sessions = self.registry.drain();
        for session in &sessions {
            session.close();
        }
        match &result {
            Ok(()) => info!(closed = sessions.len(), "Dispatcher stopped"),
            Err(e) => error!(error = %e, closed = sessions.len(), "Dispatcher failed"),
        }
        result
    }

    fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Join { stream, peer } => self.join(stream, peer),
            Command::Members(reply) => {
                let mut members = Vec::with_capacity(self.registry.len());
                self.registry.for_each(|s| {
                    members.push(Member {
                        id: s.id(),
                        identity: s.identity().to_string(),
                    })
                });
                let _ = reply.send(members);
                Ok(())
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Inbound(message) => self.inbound(message),
            SessionEvent::Failed { id, cause } => self.leave(id, cause),
        }
    }

    fn join(&mut self, stream: BoxedStream, peer: PeerAddr) -> Result<()> {
        let id = match self.registry.reserve() {
            Ok(id) => id,
            Err(RelayError::RegistryFull(max)) => {
                warn!(peer = %peer, max, "Registry full, refusing connection");
                self.tracker.spawn(refuse(stream, self.settings.max_line_length));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let identity = self.identities.assign(id, &peer);
        let handle = session::spawn(
            id,
            identity,
            peer,
            stream,
            &self.settings,
            self.events_tx.clone(),
            &self.tracker,
            &self.shutdown,
        );
        let identity = handle.identity().to_string();
        let peer = handle.peer().clone();

        self.registry.insert(handle)?;
        info!(
            conn = %id,
            peer = %peer,
            identity = %identity,
            sessions = self.registry.len(),
            "Session joined"
        );

        if self.policy.announce {
            let notice = Message::system(format!("{identity} joined"));
            self.broadcast(&notice, Some(id));
        }
        Ok(())
    }

    fn inbound(&mut self, message: Message) {
        let Some(sender) = message.sender() else {
            self.broadcast(&message, None);
            return;
        };

        // Lines read before a removal was processed are dropped with it.
        let Some(session) = self.registry.get(sender) else {
            trace!(conn = %sender, "Dropping line from removed session");
            return;
        };

        trace!(conn = %sender, identity = session.identity(), text = %message.text, "Relaying line");

        if self.policy.allow_rename {
            if let Some(requested) = message.text.strip_prefix(RENAME_COMMAND) {
                self.rename(sender, requested);
                return;
            }
        }

        let exclude = (!self.policy.echo_to_sender).then_some(sender);
        self.broadcast(&message, exclude);
    }

    fn rename(&mut self, id: ConnectionId, requested: &str) {
        let name = match validate_name(requested) {
            Ok(name) => name.to_string(),
            Err(reason) => {
                let reply = Message::system(format!("cannot rename: {reason}")).relay_line("");
                if let Some(session) = self.registry.get(id) {
                    if let Err(cause) = session.send(reply) {
                        self.leave(id, cause);
                    }
                }
                return;
            }
        };

        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        let old = session.identity().to_string();
        session.set_identity(name.clone());
        info!(conn = %id, from = %old, to = %name, "Session renamed");

        if self.policy.announce {
            let notice = Message::system(format!("{old} is now {name}"));
            self.broadcast(&notice, None);
        }
    }

    /// Fan a message out to every registered session except `exclude`,
    /// then remove any that refused it.
    fn broadcast(&mut self, message: &Message, exclude: Option<ConnectionId>) {
        let failed = self.fan_out(message, exclude);
        for (id, cause) in failed {
            self.leave(id, cause);
        }
    }

    fn fan_out(
        &self,
        message: &Message,
        exclude: Option<ConnectionId>,
    ) -> Vec<(ConnectionId, RelayError)> {
        let identity = message
            .sender()
            .and_then(|id| self.registry.get(id))
            .map(|s| s.identity())
            .unwrap_or_default();
        let line: Bytes = message.relay_line(identity);

        let mut failed = Vec::new();
        self.registry.for_each(|session| {
            let id = session.id();
            if Some(id) == exclude {
                return;
            }
            match session.send(line.clone()) {
                Ok(Push::Queued) => {}
                Ok(dropped) => {
                    warn!(conn = %id, pending = session.pending(), outcome = ?dropped, "Outbound queue full")
                }
                Err(cause) => failed.push((id, cause)),
            }
        });
        failed
    }

    /// Remove a session. Idempotent: an id that is already gone is ignored.
    fn leave(&mut self, id: ConnectionId, cause: RelayError) {
        let mut pending = VecDeque::from([(id, cause)]);

        while let Some((id, cause)) = pending.pop_front() {
            let Some(session) = self.registry.remove(id) else {
                debug!(conn = %id, cause = %cause, "Session already removed");
                continue;
            };
            if matches!(cause, RelayError::Read(ReadFailure::Closed)) {
                session.finish();
            } else {
                session.close();
            }
            info!(
                conn = %id,
                identity = session.identity(),
                cause = %cause,
                sessions = self.registry.len(),
                "Session removed"
            );

            if self.policy.announce {
                let notice = Message::system(format!("{} left", session.identity()));
                pending.extend(self.fan_out(&notice, None));
            }
        }
    }
}

/// Tell a connection the relay is full, then drop it.
async fn refuse(stream: BoxedStream, max_line_length: usize) {
    let mut writer = FramedWrite::new(stream, LineCodec::new(max_line_length));
    let line = Message::system("server full").relay_line("");
    let sent = tokio::time::timeout(REFUSAL_TIMEOUT, writer.send(line)).await;
    if !matches!(sent, Ok(Ok(()))) {
        debug!("Could not deliver refusal");
    }
}
