//! Relay server.
//!
//! Binds the listening endpoint and runs the acceptor and dispatcher until
//! shutdown, then waits for every session task to finish.

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::relay::{self, Acceptor, BoundListener, Dispatcher, DispatcherHandle, Endpoint};
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Server instance
pub struct Server {
    listener: BoundListener,
    local: Endpoint,
    dispatcher: Dispatcher,
    handle: DispatcherHandle,
    accept_backoff: Duration,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the configured endpoint. Must be called inside a tokio runtime.
    pub fn bind(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        let bind_error = |source| RelayError::Bind {
            addr: config.listen.to_string(),
            source,
        };
        let listener = relay::bind(&config.listen, config.backlog).map_err(bind_error)?;
        let local = listener.local_endpoint().map_err(bind_error)?;

        let tracker = TaskTracker::new();
        let (dispatcher, handle) = Dispatcher::new(config, tracker.clone(), shutdown.clone());

        Ok(Server {
            listener,
            local,
            dispatcher,
            handle,
            accept_backoff: config.accept_backoff,
            tracker,
            shutdown,
        })
    }

    /// Address actually bound.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Handle on the dispatcher, for inspecting the registry.
    pub fn dispatcher(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Serve until the shutdown token is cancelled or the dispatcher fails.
    pub async fn run(self) -> Result<()> {
        let dispatcher_task = tokio::spawn(self.dispatcher.run());

        let acceptor = Acceptor::new(
            self.listener,
            self.handle,
            self.accept_backoff,
            self.shutdown.clone(),
        );
        let acceptor_task = tokio::spawn(acceptor.run());

        let joined = dispatcher_task.await;

        // Stop accepting whether the dispatcher finished cleanly or not.
        self.shutdown.cancel();
        if let Err(e) = acceptor_task.await {
            warn!(error = %e, "Acceptor task failed");
        }

        self.tracker.close();
        self.tracker.wait().await;

        if let Endpoint::Unix(path) = &self.local {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }

        info!("Server stopped");
        dispatcher_outcome(joined)
    }
}

/// Result of the dispatcher task. A panic is resumed on the caller; a
/// cancelled task means the dispatcher is gone.
fn dispatcher_outcome(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            warn!(error = %e, "Dispatcher task cancelled");
            Err(RelayError::DispatcherGone)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::LineCodec;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tokio_util::codec::{FramedRead, FramedWrite};

    struct TestClient {
        lines: FramedRead<OwnedReadHalf, LineCodec>,
        writer: FramedWrite<OwnedWriteHalf, LineCodec>,
    }

    impl TestClient {
        async fn connect(endpoint: &Endpoint) -> Self {
            let Endpoint::Tcp(addr) = endpoint else {
                panic!("tests bind tcp endpoints");
            };
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, write) = stream.into_split();
            Self {
                lines: FramedRead::new(read, LineCodec::new(1024)),
                writer: FramedWrite::new(write, LineCodec::new(1024)),
            }
        }

        async fn say(&mut self, text: &str) {
            self.writer
                .send(Bytes::copy_from_slice(text.as_bytes()))
                .await
                .unwrap();
        }

        async fn expect(&mut self, want: &str) {
            let got = tokio::time::timeout(Duration::from_secs(2), self.lines.next())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
                .expect("connection open")
                .expect("valid line");
            assert_eq!(got, want);
        }

        async fn expect_silence(&mut self) {
            let got = tokio::time::timeout(Duration::from_millis(100), self.lines.next()).await;
            assert!(got.is_err(), "unexpected line: {got:?}");
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.listen = "127.0.0.1:0".parse().unwrap();
        config.relay.allow_rename = true;
        config
    }

    async fn start(config: &Config) -> (Endpoint, DispatcherHandle, CancellationToken) {
        let shutdown = CancellationToken::new();
        let server = Server::bind(config, shutdown.clone()).unwrap();
        let local = server.local_endpoint().clone();
        let handle = server.dispatcher();
        tokio::spawn(server.run());
        (local, handle, shutdown)
    }

    async fn wait_for_members(handle: &DispatcherHandle, count: usize) {
        for _ in 0..200 {
            if handle.members().await.unwrap().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("registry never reached {count} members");
    }

    async fn named_client(endpoint: &Endpoint, name: &str) -> TestClient {
        let mut client = TestClient::connect(endpoint).await;
        client.say(&format!("/nick {name}")).await;
        client
    }

    #[tokio::test]
    async fn test_hello_then_bye_after_disconnect() {
        let (local, handle, shutdown) = start(&test_config()).await;

        let mut a = named_client(&local, "A").await;
        let mut b = named_client(&local, "B").await;
        let mut c = named_client(&local, "C").await;
        wait_for_members(&handle, 3).await;

        a.say("hello").await;
        a.expect("A says: hello").await;
        b.expect("A says: hello").await;
        c.expect("A says: hello").await;

        drop(b);
        wait_for_members(&handle, 2).await;

        a.say("bye").await;
        a.expect("A says: bye").await;
        c.expect("A says: bye").await;
        c.expect_silence().await;

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_every_client_receives_exactly_once_in_order() {
        let (local, handle, shutdown) = start(&test_config()).await;

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(TestClient::connect(&local).await);
        }
        wait_for_members(&handle, 5).await;

        for i in 0..3 {
            clients[0].say(&format!("line {i}")).await;
        }
        for client in clients.iter_mut() {
            for i in 0..3 {
                client.expect(&format!("dodo says: line {i}")).await;
            }
            client.expect_silence().await;
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_immediate_close_does_not_stop_server() {
        let (local, handle, shutdown) = start(&test_config()).await;

        let Endpoint::Tcp(addr) = local.clone() else {
            unreachable!()
        };
        drop(TcpStream::connect(addr).await.unwrap());

        let mut a = TestClient::connect(&local).await;
        let mut b = TestClient::connect(&local).await;
        wait_for_members(&handle, 2).await;

        a.say("still here").await;
        b.expect("dodo says: still here").await;

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_partial_line_disconnects_sender_only() {
        let (local, handle, shutdown) = start(&test_config()).await;

        let Endpoint::Tcp(addr) = local.clone() else {
            unreachable!()
        };
        let mut a = TestClient::connect(&local).await;
        let mut raw = TcpStream::connect(addr).await.unwrap();
        wait_for_members(&handle, 2).await;

        tokio::io::AsyncWriteExt::write_all(&mut raw, b"no newline")
            .await
            .unwrap();
        drop(raw);
        wait_for_members(&handle, 1).await;

        a.say("alone").await;
        a.expect("dodo says: alone").await;

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_piped_client_receives_its_own_line() {
        let (local, _handle, shutdown) = start(&test_config()).await;
        let Endpoint::Tcp(addr) = local.clone() else {
            unreachable!()
        };
        let stream = TcpStream::connect(addr).await.unwrap();

        let input = tokio_test::io::Builder::new().read(b"hi\n").build();
        let mut output = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            crate::client::chat(stream, input, &mut output, 1024),
        )
        .await
        .expect("client should finish once the relay hangs up")
        .unwrap();
        assert_eq!(output, b"dodo says: hi\n");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_clients() {
        let shutdown = CancellationToken::new();
        let server = Server::bind(&test_config(), shutdown.clone()).unwrap();
        let local = server.local_endpoint().clone();
        let handle = server.dispatcher();
        let task = tokio::spawn(server.run());

        let mut a = TestClient::connect(&local).await;
        wait_for_members(&handle, 1).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();

        let end = tokio::time::timeout(Duration::from_secs(2), a.lines.next())
            .await
            .expect("client should see the connection close");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_dispatcher_reported_as_gone() {
        let task = tokio::spawn(std::future::pending::<Result<()>>());
        task.abort();
        let joined = task.await;
        assert!(matches!(
            dispatcher_outcome(joined),
            Err(RelayError::DispatcherGone)
        ));
    }

    #[tokio::test]
    #[should_panic(expected = "registry corrupted")]
    async fn test_dispatcher_panic_is_resumed() {
        let task = tokio::spawn(async {
            if true {
                panic!("registry corrupted");
            }
            Ok::<(), RelayError>(())
        });
        let _ = dispatcher_outcome(task.await);
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let first = Server::bind(&test_config(), CancellationToken::new()).unwrap();
        let mut config = test_config();
        config.listen = first.local_endpoint().clone();
        assert!(matches!(
            Server::bind(&config, CancellationToken::new()),
            Err(RelayError::Bind { .. })
        ));
    }
}
