use anyhow::Result;
use clap::Parser;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use vdb::TransportStats;

#[derive(Parser, Debug)]
#[command(name = "vdb-demo")]
#[command(about = "Streams an animated point cloud to a vdb viewer")]
struct Args {
    /// Port the viewer connects to
    #[arg(short, long, default_value = "8000")]
    port: u32,

    /// Points per frame
    #[arg(short = 'n', long, default_value = "500")]
    points: u32,

    /// Producer cycles per second
    #[arg(short, long, default_value = "60")]
    fps: u64,

    /// Time to run in seconds (0 = infinite)
    #[arg(short, long, default_value = "0")]
    time: u64,

    /// Report interval in seconds
    #[arg(short = 'r', long, default_value = "5")]
    interval: u64,

    /// Verbose logging (default: false)
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

/// Point `i` of `count` on a rotating spiral, in normalized device
/// coordinates.
fn spiral_point(i: u32, count: u32, phase: f32) -> (f32, f32) {
    const GOLDEN_ANGLE: f32 = 2.399_963;
    let r = 0.95 * (i as f32 + 0.5) / count as f32;
    let angle = i as f32 * GOLDEN_ANGLE + phase;
    (r * angle.cos(), r * angle.sin())
}

/// One point cloud as the viewer expects it: an `i32` count, then `count`
/// (x, y) pairs of `f32`.
fn encode_cloud(count: u32, phase: f32) -> Vec<u8> {
    let mut cloud = Vec::with_capacity(4 + 8 * count as usize);
    cloud.extend_from_slice(&(count as i32).to_le_bytes());
    for i in 0..count {
        let (x, y) = spiral_point(i, count, phase);
        cloud.extend_from_slice(&x.to_le_bytes());
        cloud.extend_from_slice(&y.to_le_bytes());
    }
    cloud
}

fn print_statistics(current: &TransportStats, last: &TransportStats, elapsed: f64) {
    let frames = current.frames_sent - last.frames_sent;
    let bytes = current.bytes_sent - last.bytes_sent;
    info!(
        "Frames: {} ({:.1}/s), {:.2} KB/s, coalesced cycles: {}, dropped appends: {} ({} bytes), connections: {}",
        current.frames_sent,
        frames as f64 / elapsed,
        bytes as f64 / elapsed / 1024.0,
        current.cycles_coalesced,
        current.appends_dropped,
        current.bytes_dropped,
        current.connections
    );
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    if args.fps == 0 {
        return Err(anyhow::anyhow!("--fps must be greater than zero"));
    }
    if args.points > i32::MAX as u32 {
        return Err(anyhow::anyhow!("Too many points: {}", args.points));
    }

    vdb::set_listen_port(args.port);
    info!(
        "Starting vdb demo on port {}: {} points at {} fps",
        args.port, args.points, args.fps
    );

    let frame_interval = Duration::from_micros(1_000_000 / args.fps);
    let report_interval = Duration::from_secs(args.interval.max(1));
    let run_duration = if args.time > 0 {
        Some(Duration::from_secs(args.time))
    } else {
        None
    };

    let start_time = Instant::now();
    let mut last_report = Instant::now();
    let mut last_stats = TransportStats::default();
    let mut was_connected = false;
    let mut phase = 0.0f32;
    let mut dropped_clouds = 0u64;

    loop {
        let connected = vdb::begin_session();
        if connected != was_connected {
            info!("Viewer {}", if connected { "connected" } else { "not connected" });
            was_connected = connected;
        }

        // A cloud goes in whole or not at all, so the viewer never sees a
        // count without its points
        if connected && !vdb::append_bytes(&encode_cloud(args.points, phase)) {
            if dropped_clouds == 0 {
                warn!(
                    "Work buffer full, dropping clouds of {} points until the viewer catches up",
                    args.points
                );
            }
            dropped_clouds += 1;
        }
        vdb::end_cycle();

        phase += 0.02;
        std::thread::sleep(frame_interval);

        if last_report.elapsed() >= report_interval {
            if let Some(stats) = vdb::stats() {
                print_statistics(&stats, &last_stats, last_report.elapsed().as_secs_f64());
                last_stats = stats;
            }
            last_report = Instant::now();
        }

        if let Some(duration) = run_duration {
            if start_time.elapsed() >= duration {
                info!("Run duration ({} seconds) completed", args.time);
                break;
            }
        }
    }

    if let Some(stats) = vdb::stats() {
        info!("======= DEMO SUMMARY =======");
        info!("Handoffs published: {}", stats.handoffs_published);
        info!("Frames sent: {}", stats.frames_sent);
        info!("Bytes sent: {}", stats.bytes_sent);
        info!("Send failures: {}", stats.send_failures);
        info!("Point clouds dropped: {}", dropped_clouds);
        info!("============================");
    }

    Ok(())
}
