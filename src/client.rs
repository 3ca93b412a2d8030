//! Interactive relay client.
//!
//! Sends each stdin line to the relay and prints each relayed line to
//! stdout. The two directions run independently; when stdin ends the client
//! half-closes its side and keeps printing until the relay hangs up.

use crate::error::{RelayError, Result};
use crate::relay::{self, Endpoint, LineCodec};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info};

/// Connect to `endpoint` and chat over stdin/stdout.
pub async fn run(endpoint: &Endpoint, max_line_length: usize) -> Result<()> {
    let stream = relay::connect(endpoint)
        .await
        .map_err(|source| RelayError::Connect {
            addr: endpoint.to_string(),
            source,
        })?;
    info!(address = %endpoint, "Connected");

    chat(stream, tokio::io::stdin(), tokio::io::stdout(), max_line_length).await?;

    info!("Disconnected");
    Ok(())
}

/// Pump lines between a user's input/output and a relay stream.
pub async fn chat<S, I, O>(stream: S, input: I, output: O, max_line_length: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (server_read, server_write) = tokio::io::split(stream);
    let mut from_server = FramedRead::new(server_read, LineCodec::new(max_line_length));
    let mut to_server = FramedWrite::new(server_write, LineCodec::new(max_line_length));
    let mut from_user = FramedRead::new(input, LineCodec::new(max_line_length));
    let mut to_user = FramedWrite::new(output, LineCodec::new(max_line_length));

    let upstream = async {
        while let Some(line) = from_user.next().await {
            to_server.send(Bytes::from(line?)).await?;
        }
        to_server.close().await?;
        Ok::<_, RelayError>(())
    };
    let downstream = async {
        while let Some(line) = from_server.next().await {
            to_user.send(Bytes::from(line?)).await?;
        }
        Ok::<_, RelayError>(())
    };
    tokio::pin!(upstream, downstream);

    tokio::select! {
        sent = &mut upstream => {
            sent?;
            debug!("Input closed, waiting for relay to hang up");
            downstream.await
        }
        received = &mut downstream => received,
    }
}
