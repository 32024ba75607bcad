//! Tokio driver connecting a [`PipePair`] to a plaintext stream and a wire stream.

use std::time::Instant;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::pipe_pair::{PipePair, PipePairStats};

/// Read buffer size for each stream
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Unwritten wire output above which plaintext is no longer read
pub const MAX_PENDING_OUTPUT: usize = 4 * READ_BUFFER_SIZE;

/// Summary of a finished session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    /// Pipe counters at the end of the session
    pub pipe: PipePairStats,
    /// Wall-clock duration
    pub elapsed_ms: u64,
}

struct Endpoint<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    buf: Vec<u8>,
    /// Output produced by the pair but not yet accepted by the writer
    pending: BytesMut,
    read_open: bool,
    eos: bool,
    write_shut: bool,
}

impl<S: AsyncRead + AsyncWrite> Endpoint<S> {
    fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            buf: vec![0u8; READ_BUFFER_SIZE],
            pending: BytesMut::new(),
            read_open: true,
            eos: false,
            write_shut: false,
        }
    }

    fn queue(&mut self, data: &[u8], eos: bool) {
        self.pending.extend_from_slice(data);
        self.eos |= eos;
    }

    fn drained(&self) -> bool {
        self.pending.is_empty() && (!self.eos || self.write_shut)
    }

    async fn wrote(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        self.pending.advance(n);
        if self.pending.is_empty() {
            self.writer.flush().await?;
        }
        Ok(())
    }

    async fn shutdown_if_done(&mut self) -> Result<()> {
        if self.eos && self.pending.is_empty() && !self.write_shut {
            self.writer.shutdown().await?;
            self.write_shut = true;
        }
        Ok(())
    }
}

/// Run `pair` until both streams have ended and both directions finished.
///
/// Plaintext read from `plaintext` is encoded onto `wire`; wire bytes are
/// decoded back onto `plaintext`. Each write half is shut down as soon as the
/// pair reports end of stream for it. On error the pair is closed and the
/// error returned.
pub async fn run_session<P, W>(mut pair: PipePair, plaintext: P, wire: W) -> Result<SessionStats>
where
    P: AsyncRead + AsyncWrite,
    W: AsyncRead + AsyncWrite,
{
    let start = Instant::now();
    let mut plain = Endpoint::new(plaintext);
    let mut net = Endpoint::new(wire);
    let result = drive(&mut pair, &mut plain, &mut net).await;
    match result {
        Ok(()) => {
            let stats = SessionStats {
                pipe: pair.stats(),
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
            info!(
                peer_uuid = ?pair.peer_uuid(),
                plaintext_in = stats.pipe.plaintext_in,
                wire_out = stats.pipe.wire_out,
                elapsed_ms = stats.elapsed_ms,
                "session finished"
            );
            Ok(stats)
        }
        Err(e) => {
            warn!(error = %e, peer_uuid = ?pair.peer_uuid(), "session failed");
            pair.close();
            Err(e)
        }
    }
}

async fn drive<P, W>(
    pair: &mut PipePair,
    plain: &mut Endpoint<P>,
    net: &mut Endpoint<W>,
) -> Result<()>
where
    P: AsyncRead + AsyncWrite,
    W: AsyncRead + AsyncWrite,
{
    loop {
        net.queue(&pair.take_wire_output(), pair.wire_eos());
        plain.queue(&pair.take_plaintext_output(), pair.plaintext_eos());
        net.shutdown_if_done().await?;
        plain.shutdown_if_done().await?;

        if !plain.read_open && !net.read_open && net.drained() && plain.drained() {
            if pair.is_finished() {
                return Ok(());
            }
            return Err(TransportError::UnexpectedEof {
                reason: "both streams closed before the pipe finished".into(),
            });
        }

        // Writes are branches of their own so a slow writer never stops the
        // reads. Only plaintext intake waits for the wire to catch up.
        tokio::select! {
            read = plain.reader.read(&mut plain.buf),
                if plain.read_open && net.pending.len() < MAX_PENDING_OUTPUT =>
            {
                let n = read?;
                if n == 0 {
                    plain.read_open = false;
                    debug!("plaintext input ended");
                }
                pair.consume_plaintext(&plain.buf[..n])?;
            }
            read = net.reader.read(&mut net.buf), if net.read_open => {
                let n = read?;
                if n == 0 {
                    net.read_open = false;
                    debug!("wire input ended");
                }
                pair.consume_wire(&net.buf[..n])?;
            }
            written = net.writer.write(&net.pending), if !net.pending.is_empty() => {
                net.wrote(written?).await?;
            }
            written = plain.writer.write(&plain.pending), if !plain.pending.is_empty() => {
                plain.wrote(written?).await?;
            }
            else => {
                return Err(TransportError::InvalidState {
                    reason: "session has nothing to read or write".into(),
                });
            }
        }
    }
}
