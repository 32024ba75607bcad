//! Subcommands of `xcodec-tool`.

use crate::config::ToolConfig;
use anyhow::Result;
use bytes::BytesMut;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;
use wanproxy_transport::{run_session, PipePair, PipePairConfig, SessionStats};
use wanproxy_xcodec::{
    CacheConfig, CacheRegistry, Decoder, DecoderStats, DiskStore, DiskStoreStats, Encoder,
    EncoderStats,
};

const CHUNK_SIZE: usize = 64 * 1024;

/// Command line of `xcodec-tool`.
#[derive(Parser)]
#[command(name = "xcodec-tool")]
#[command(about = "XCodec encoder, decoder and cache utility", long_about = None)]
pub struct Cli {
    /// TOML or JSON config file; defaults apply when absent
    #[arg(short, long, env = "XCODEC_CONFIG")]
    pub config: Option<PathBuf>,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands of `xcodec-tool`.
#[derive(Subcommand)]
pub enum Command {
    /// Encode stdin to stdout with the local namespace
    Encode,
    /// Decode stdin to stdout
    Decode {
        /// Namespace the stream was encoded with; defaults to the local one
        #[arg(short, long)]
        peer: Option<Uuid>,
    },
    /// Print the state of a disk cache file
    Inspect {
        /// Cache file to open
        path: PathBuf,
    },
    /// Send a file through two pipe pairs over an in-process connection
    Loopback {
        /// File whose contents are sent
        path: PathBuf,
        /// Pass the file this many times over the same caches
        #[arg(short, long, default_value = "1")]
        rounds: usize,
    },
}

impl Cli {
    /// Load the config and run the chosen subcommand.
    ///
    /// `inspect` and `loopback` print a JSON report on stdout; the codec
    /// commands stream on stdin and stdout and log a summary.
    pub async fn run(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => ToolConfig::from_file(path)?,
            None => ToolConfig::default(),
        };
        match self.command {
            Command::Encode => {
                let stats = encode(&config, tokio::io::stdin(), tokio::io::stdout()).await?;
                tracing::info!(
                    input_bytes = stats.input_bytes,
                    output_bytes = stats.output_bytes,
                    declarations = stats.declarations,
                    references = stats.references,
                    backreferences = stats.backreferences,
                    "encode finished"
                );
                Ok(())
            }
            Command::Decode { peer } => {
                let stats = decode(&config, peer, tokio::io::stdin(), tokio::io::stdout()).await?;
                tracing::info!(
                    input_bytes = stats.input_bytes,
                    output_bytes = stats.output_bytes,
                    extracts = stats.extracts,
                    references = stats.references,
                    "decode finished"
                );
                Ok(())
            }
            Command::Inspect { ref path } => {
                let report = inspect(&config, path)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            Command::Loopback { ref path, rounds } => {
                let data = tokio::fs::read(path).await?;
                let reports = loopback(&config.pipe, &data, rounds).await?;
                println!("{}", serde_json::to_string_pretty(&reports)?);
                Ok(())
            }
        }
    }
}

/// Encode everything from `input` onto `output`.
pub async fn encode<R, W>(config: &ToolConfig, mut input: R, mut output: W) -> Result<EncoderStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let registry = config.registry()?;
    let mut encoder = Encoder::new(registry.local()?);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut encoded = BytesMut::new();
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        encoder.encode(&mut encoded, &buf[..n], None)?;
        output.write_all(&encoded).await?;
        encoded.clear();
    }
    output.flush().await?;
    Ok(encoder.stats().clone())
}

/// Decode everything from `input` onto `output` using the namespace `peer`.
///
/// Fails if the stream ends inside an op or references segments the cache
/// does not hold; the error lists the missing hashes.
pub async fn decode<R, W>(
    config: &ToolConfig,
    peer: Option<Uuid>,
    mut input: R,
    mut output: W,
) -> Result<DecoderStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let registry = config.registry()?;
    let cache = match peer {
        Some(uuid) => registry.connect(uuid)?,
        None => registry.local()?,
    };
    let mut decoder = Decoder::new(cache);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pending = BytesMut::new();
    let mut decoded = BytesMut::new();
    let mut unresolved = Vec::new();
    loop {
        let n = input.read(&mut buf).await?;
        pending.extend_from_slice(&buf[..n]);
        decoder.decode(&mut decoded, &mut pending, &mut unresolved)?;
        output.write_all(&decoded).await?;
        decoded.clear();
        if !unresolved.is_empty() {
            let hashes: Vec<String> = unresolved.iter().map(|h| format!("{:016x}", h)).collect();
            anyhow::bail!(
                "stream references {} unknown segments: {}",
                hashes.len(),
                hashes.join(", ")
            );
        }
        if n == 0 {
            break;
        }
    }
    output.flush().await?;
    if !pending.is_empty() {
        anyhow::bail!("stream truncated inside an op ({} bytes left)", pending.len());
    }
    Ok(decoder.stats().clone())
}

/// Contents of an `inspect` report.
#[derive(Debug, Serialize)]
pub struct InspectReport {
    /// File that was opened
    pub path: PathBuf,
    /// Store geometry and counters after loading
    pub stats: DiskStoreStats,
    /// Every registered namespace
    pub namespaces: Vec<NamespaceReport>,
}

/// One namespace of an inspected cache file.
#[derive(Debug, Serialize)]
pub struct NamespaceReport {
    /// Peer identity owning the namespace
    pub uuid: Uuid,
    /// Live dictionary entries
    pub entries: usize,
}

/// Open the disk cache at `path` as the configured local identity and report on it.
pub fn inspect(config: &ToolConfig, path: &Path) -> Result<InspectReport> {
    let Some(local_uuid) = config.local_uuid else {
        anyhow::bail!("inspect needs local_uuid in the config so the file is opened as its owner");
    };
    let size_bytes = std::fs::metadata(path)?.len();
    let store = DiskStore::open(path, size_bytes, local_uuid)?;
    let namespaces = store
        .namespaces()
        .into_iter()
        .map(|(uuid, entries)| NamespaceReport { uuid, entries })
        .collect();
    Ok(InspectReport {
        path: path.to_path_buf(),
        stats: store.stats(),
        namespaces,
    })
}

/// Outcome of a loopback run.
#[derive(Debug, Serialize)]
pub struct LoopbackReport {
    /// Plaintext bytes sent
    pub bytes: usize,
    /// Bytes the sender put on the wire
    pub wire_bytes: u64,
    /// `wire_bytes / bytes`; 1.0 for empty input
    pub ratio: f64,
    /// Sending session
    pub sender: SessionStats,
    /// Receiving session
    pub receiver: SessionStats,
}

/// Send `data` `rounds` times through fresh pairs of sessions and check that
/// the receiver reproduces it each time.
///
/// Both ends keep private memory caches for the whole run, so later rounds
/// reference segments learned in earlier ones.
pub async fn loopback(
    pipe: &PipePairConfig,
    data: &[u8],
    rounds: usize,
) -> Result<Vec<LoopbackReport>> {
    let sender_caches = Arc::new(CacheRegistry::new(CacheConfig::default(), Uuid::new_v4())?);
    let receiver_caches = Arc::new(CacheRegistry::new(CacheConfig::default(), Uuid::new_v4())?);
    let mut reports = Vec::with_capacity(rounds.max(1));
    for round in 1..=rounds.max(1) {
        let report = loopback_round(&sender_caches, &receiver_caches, pipe, data).await?;
        tracing::debug!(round, wire_bytes = report.wire_bytes, "loopback round finished");
        reports.push(report);
    }
    Ok(reports)
}

async fn loopback_round(
    sender_caches: &Arc<CacheRegistry>,
    receiver_caches: &Arc<CacheRegistry>,
    pipe: &PipePairConfig,
    data: &[u8],
) -> Result<LoopbackReport> {
    let sender = PipePair::new(sender_caches.clone(), pipe.clone())?;
    let receiver = PipePair::new(receiver_caches.clone(), pipe.clone())?;

    let (wire_a, wire_b) = tokio::io::duplex(CHUNK_SIZE);
    let (app_a, plain_a) = tokio::io::duplex(CHUNK_SIZE);
    let (app_b, plain_b) = tokio::io::duplex(CHUNK_SIZE);
    let sender_task = tokio::spawn(run_session(sender, plain_a, wire_a));
    let receiver_task = tokio::spawn(run_session(receiver, plain_b, wire_b));

    let (mut a_read, mut a_write) = tokio::io::split(app_a);
    let (mut b_read, mut b_write) = tokio::io::split(app_b);
    let payload = data.to_vec();
    let writer = tokio::spawn(async move {
        a_write.write_all(&payload).await?;
        a_write.shutdown().await
    });
    b_write.shutdown().await?;

    let mut received = Vec::with_capacity(data.len());
    b_read.read_to_end(&mut received).await?;
    let mut reverse = Vec::new();
    a_read.read_to_end(&mut reverse).await?;

    writer.await??;
    let sender = sender_task.await??;
    let receiver = receiver_task.await??;

    if received != data {
        anyhow::bail!(
            "loopback mismatch: sent {} bytes, received {}",
            data.len(),
            received.len()
        );
    }
    if !reverse.is_empty() {
        anyhow::bail!("unexpected {} bytes on the reverse direction", reverse.len());
    }

    let wire_bytes = sender.pipe.wire_out;
    let ratio = if data.is_empty() {
        1.0
    } else {
        wire_bytes as f64 / data.len() as f64
    };
    Ok(LoopbackReport {
        bytes: data.len(),
        wire_bytes,
        ratio,
        sender,
        receiver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        let block: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        block.iter().cycle().take(len).copied().collect()
    }

    fn fixed_config() -> ToolConfig {
        ToolConfig {
            local_uuid: Some(Uuid::from_u128(0x11)),
            ..ToolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_encode_then_decode_memory() {
        let data = sample(50_000);
        let config = fixed_config();
        let mut encoded = Vec::new();
        let enc = encode(&config, data.as_slice(), &mut encoded).await.unwrap();
        assert_eq!(enc.input_bytes, data.len() as u64);
        assert!(encoded.len() < data.len());

        let mut decoded = Vec::new();
        decode(&config, None, encoded.as_slice(), &mut decoded).await.unwrap();
        assert_eq!(decoded, data);
    }

    #[tokio::test]
    async fn test_decode_truncated_stream() {
        let config = fixed_config();
        let mut decoded = Vec::new();
        let err = decode(&config, None, &[0xf1u8][..], &mut decoded)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[tokio::test]
    async fn test_decode_unknown_reference() {
        let config = fixed_config();
        let mut stream = vec![0xf1, 0x02];
        stream.extend_from_slice(&0xdead_beef_u64.to_be_bytes());
        let mut decoded = Vec::new();
        let err = decode(&config, None, stream.as_slice(), &mut decoded)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("00000000deadbeef"));
    }

    #[tokio::test]
    async fn test_encode_decode_through_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = ToolConfig {
            local_uuid: Some(Uuid::from_u128(0x22)),
            cache: CacheConfig::Disk {
                path: dir.path().join("cache.xcd"),
                size_bytes: 4 << 20,
            },
            ..ToolConfig::default()
        };
        let data = sample(20_000);
        let mut encoded = Vec::new();
        let stats = encode(&config, data.as_slice(), &mut encoded).await.unwrap();
        assert!(stats.declarations > 0);
        assert!(encoded.len() < data.len() / 4);

        let mut decoded = Vec::new();
        decode(&config, Some(Uuid::from_u128(0x22)), encoded.as_slice(), &mut decoded)
            .await
            .unwrap();
        assert_eq!(decoded, data);

        let report = inspect(&config, &dir.path().join("cache.xcd")).unwrap();
        assert!(report.stats.entries > 0);
        assert!(report.namespaces.iter().any(|n| n.uuid == Uuid::from_u128(0x22)));
    }

    #[test]
    fn test_inspect_requires_local_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.xcd");
        std::fs::write(&path, b"").unwrap();
        assert!(inspect(&ToolConfig::default(), &path).is_err());
    }

    #[tokio::test]
    async fn test_loopback_report() {
        let data = sample(200_000);
        let reports = loopback(&PipePairConfig::default(), &data, 1).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].bytes, data.len());
        assert!(reports[0].ratio < 0.5);
        assert_eq!(reports[0].receiver.pipe.plaintext_out, data.len() as u64);
    }

    #[tokio::test]
    async fn test_loopback_rounds_reuse_caches() {
        let data = sample(100_000);
        let reports = loopback(&PipePairConfig::default(), &data, 2).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[1].wire_bytes <= reports[0].wire_bytes);
        assert!(reports[1].sender.pipe.encoder.references > 0);
        assert_eq!(reports[1].receiver.pipe.asks_sent, 0);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "xcodec-tool",
            "decode",
            "--peer",
            "00000000-0000-0000-0000-000000000011",
        ])
        .unwrap();
        match cli.command {
            Command::Decode { peer } => assert_eq!(peer, Some(Uuid::from_u128(0x11))),
            _ => panic!("expected decode"),
        }
        let cli = Cli::try_parse_from(["xcodec-tool", "loopback", "data.bin", "-r", "3"]).unwrap();
        assert!(matches!(cli.command, Command::Loopback { rounds: 3, .. }));
    }

    #[test]
    fn test_help_describes_every_argument() {
        use clap::CommandFactory;

        let mut cmd = Cli::command();
        cmd.clone().debug_assert();
        let top = cmd.render_help().to_string();
        assert!(top.contains("TOML or JSON config file"));
        let inspect = cmd.find_subcommand_mut("inspect").unwrap().render_help().to_string();
        assert!(inspect.contains("Cache file to open"));
        let loopback = cmd.find_subcommand_mut("loopback").unwrap().render_help().to_string();
        assert!(loopback.contains("File whose contents are sent"));
        assert!(loopback.contains("Pass the file this many times"));
    }
}
