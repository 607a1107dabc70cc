use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use vdb::protocol::{
    FrameHeader, client_handshake, encode_client_frame, opcode, verify_handshake_response,
};

#[derive(Parser, Debug)]
#[command(name = "vdb-viewer")]
#[command(about = "Command-line viewer that receives point clouds from a vdb producer")]
struct Args {
    /// Host running the producer
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Producer port
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Time to run in seconds (0 = infinite)
    #[arg(short, long, default_value = "0")]
    time: u64,

    /// Report interval in seconds
    #[arg(short = 'r', long, default_value = "5")]
    interval: u64,

    /// Send the shutdown command after this many frames
    #[arg(long)]
    shutdown_after: Option<u64>,

    /// Verbose logging (default: false)
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

/// One point cloud: an `i32` count followed by `count` (x, y) pairs of
/// `f32`, all little-endian.
#[derive(Debug, Clone, PartialEq)]
struct PointCloud {
    points: Vec<(f32, f32)>,
}

/// Decode every point cloud in a frame payload. Frames carry more than one
/// cloud when the producer coalesced several cycles.
fn decode_clouds(payload: &[u8]) -> Result<Vec<PointCloud>> {
    let mut clouds = Vec::new();
    let mut rest = payload;

    while !rest.is_empty() {
        let count_bytes: [u8; 4] = rest
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| anyhow!("Truncated point count"))?;
        let count = i32::from_le_bytes(count_bytes);
        if count < 0 {
            return Err(anyhow!("Negative point count: {}", count));
        }

        let len = count as usize * 8;
        let body = rest
            .get(4..4 + len)
            .ok_or_else(|| anyhow!("Cloud of {} points is truncated", count))?;

        let points = body
            .chunks_exact(8)
            .map(|p| {
                let x = f32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                let y = f32::from_le_bytes([p[4], p[5], p[6], p[7]]);
                (x, y)
            })
            .collect();
        clouds.push(PointCloud { points });
        rest = &rest[4 + len..];
    }

    Ok(clouds)
}

#[derive(Default)]
struct ViewerStats {
    frames: AtomicU64,
    bytes: AtomicU64,
    clouds: AtomicU64,
    points: AtomicU64,
    decode_errors: AtomicU64,
    connections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
struct StatsSnapshot {
    frames: u64,
    bytes: u64,
    clouds: u64,
    points: u64,
    decode_errors: u64,
    connections: u64,
}

impl ViewerStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            clouds: self.clouds.load(Ordering::Relaxed),
            points: self.points.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

fn print_statistics(current: &StatsSnapshot, last: &StatsSnapshot, elapsed: f64) {
    let frames = current.frames - last.frames;
    let bytes = current.bytes - last.bytes;
    info!(
        "Frames: {} ({:.1}/s), {:.2} KB/s, clouds: {}, points: {}, decode errors: {}, connections: {}",
        current.frames,
        frames as f64 / elapsed,
        bytes as f64 / elapsed / 1024.0,
        current.clouds,
        current.points,
        current.decode_errors,
        current.connections
    );
}

/// Bytes that only need to differ between connections: handshake keys and
/// frame masks.
fn nonce() -> [u8; 16] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    (nanos ^ ((std::process::id() as u128) << 64)).to_le_bytes()
}

fn mask() -> [u8; 4] {
    let n = nonce();
    [n[0], n[1], n[2], n[3]]
}

async fn handshake(stream: &mut TcpStream, host: &str) -> Result<()> {
    let key = BASE64.encode(nonce());
    stream
        .write_all(client_handshake(host, &key).as_bytes())
        .await?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err(anyhow!("Handshake response too long"));
        }
        stream.read_exact(&mut byte).await?;
        response.push(byte[0]);
    }

    verify_handshake_response(&response, &key)?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<(FrameHeader, Vec<u8>)> {
    let mut head = vec![0u8; 2];
    stream.read_exact(&mut head).await?;

    let extra = match head[1] & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    } + if head[1] & 0x80 != 0 { 4 } else { 0 };
    head.resize(2 + extra, 0);
    stream.read_exact(&mut head[2..]).await?;

    let header = FrameHeader::decode(&head).ok_or_else(|| anyhow!("Malformed frame header"))?;
    let len = usize::try_from(header.payload_len)?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((header, payload))
}

enum SessionEnd {
    ShutdownSent,
}

/// Receive frames until the connection drops or the shutdown command has
/// been sent.
async fn run_connection(args: &Args, stats: &ViewerStats) -> Result<SessionEnd> {
    let addr = format!("{}:{}", args.host, args.port);
    let mut stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;
    handshake(&mut stream, &addr).await?;

    stats.connections.fetch_add(1, Ordering::Relaxed);
    info!("Connected to {}", addr);

    let hello = encode_client_frame(opcode::TEXT, b"Hello from vdb-viewer!", mask());
    stream.write_all(&hello).await?;

    loop {
        let (header, payload) = read_frame(&mut stream).await?;

        match header.opcode {
            opcode::BINARY => {
                let frames = stats.frames.fetch_add(1, Ordering::Relaxed) + 1;
                stats
                    .bytes
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);

                match decode_clouds(&payload) {
                    Ok(clouds) => {
                        if let Some(last) = clouds.last() {
                            debug!(
                                "Frame {}: {} clouds, latest has {} points",
                                frames,
                                clouds.len(),
                                last.points.len()
                            );
                        }
                        let points: usize = clouds.iter().map(|c| c.points.len()).sum();
                        stats
                            .clouds
                            .fetch_add(clouds.len() as u64, Ordering::Relaxed);
                        stats.points.fetch_add(points as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Frame {}: {}", frames, e);
                    }
                }

                if args.shutdown_after.is_some_and(|n| frames >= n) {
                    info!("Received {} frames, sending shutdown", frames);
                    let shutdown = encode_client_frame(opcode::TEXT, b"shutdown", mask());
                    stream.write_all(&shutdown).await?;
                    stream.flush().await?;
                    return Ok(SessionEnd::ShutdownSent);
                }
            }
            opcode::CLOSE => return Err(anyhow!("Producer closed the connection")),
            other => debug!("Ignoring frame with opcode {:#x}", other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    info!("Starting vdb viewer for {}:{}", args.host, args.port);

    let stats = Arc::new(ViewerStats::default());
    let start_time = Instant::now();

    let reporter_stats = stats.clone();
    let interval = Duration::from_secs(args.interval.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut last = reporter_stats.snapshot();
        let mut last_time = Instant::now();
        loop {
            ticker.tick().await;
            let current = reporter_stats.snapshot();
            print_statistics(&current, &last, last_time.elapsed().as_secs_f64());
            last = current;
            last_time = Instant::now();
        }
    });

    let run_duration = if args.time > 0 {
        Some(Duration::from_secs(args.time))
    } else {
        None
    };
    let deadline = async {
        match run_duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = &mut deadline => {
                info!("Run duration ({} seconds) completed", args.time);
                break;
            }
            result = run_connection(&args, &stats) => match result {
                Ok(SessionEnd::ShutdownSent) => break,
                Err(e) => debug!("No connection: {}", e),
            },
        }

        // Reconnect once a second, like the browser viewer
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let total = stats.snapshot();
    info!("======= VIEWER SUMMARY =======");
    info!("Total time: {:.2} seconds", start_time.elapsed().as_secs_f64());
    info!("Connections: {}", total.connections);
    info!("Frames received: {} ({} bytes)", total.frames, total.bytes);
    info!("Point clouds: {} ({} points)", total.clouds, total.points);
    info!("Decode errors: {}", total.decode_errors);
    info!("==============================");

    Ok(())
}
