// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! CLI driver for the transmuxer: reads a TS file (or stdin) in
//! caller-chosen chunk sizes, drives one `Transmuxer` instance, and
//! writes the init segment once plus each `moof+mdat` fragment to an
//! output directory. Every side-channel event is logged at `debug`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tsmux::{SegmentEvent, Transmuxer, TransmuxerConfig};

#[derive(Debug, Parser)]
#[command(name = "tsmux-cli", about = "Streaming MPEG-TS to fragmented MP4 transmuxer")]
struct Args {
    /// Input TS file; omit (or pass "-") to read from stdin.
    #[arg(default_value = "-")]
    input: String,

    /// Directory fragments are written to (created if missing).
    #[arg(short, long, default_value = "out")]
    output_dir: PathBuf,

    /// Bytes read per `push()` call — exercises the pipeline's chunk-
    /// boundary handling the same way an arbitrarily-chunked network
    /// source would.
    #[arg(long, default_value_t = 65536)]
    chunk_size: usize,

    /// Keep each track's original rollover-corrected timestamps instead
    /// of rebasing the first sample of each segment to 0.
    #[arg(long)]
    keep_original_timestamps: bool,

    /// Emit one segment per track as data arrives, instead of waiting for
    /// every advertised track to contribute before emitting a combined
    /// segment.
    #[arg(long)]
    no_remux: bool,

    /// Tolerate PMT entries for codec families this crate doesn't
    /// segment (advertised in trackinfo only) instead of failing.
    #[arg(long)]
    broad_mode: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tsmux=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating output dir {}", args.output_dir.display()))?;

    let config = TransmuxerConfig {
        remux: !args.no_remux,
        broad_mode: args.broad_mode,
        keep_original_timestamps: args.keep_original_timestamps,
    };
    let mut transmuxer = Transmuxer::new(config);

    let mut reader: Box<dyn tokio::io::AsyncRead + Unpin> = if args.input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&args.input)
                .await
                .with_context(|| format!("opening {}", args.input))?,
        )
    };

    let mut buf = vec![0u8; args.chunk_size];
    let mut init_written = false;
    let mut segment_index = 0u64;

    loop {
        let n = reader.read(&mut buf).await.context("reading input")?;
        if n == 0 {
            break;
        }
        let events = transmuxer.push(&buf[..n])?;
        handle_events(events, &args.output_dir, &mut init_written, &mut segment_index).await?;
    }

    let events = transmuxer.flush();
    handle_events(events, &args.output_dir, &mut init_written, &mut segment_index).await?;

    info!(segments = segment_index, "transmux complete");
    Ok(())
}

async fn handle_events(
    events: Vec<SegmentEvent>,
    output_dir: &PathBuf,
    init_written: &mut bool,
    segment_index: &mut u64,
) -> Result<()> {
    for event in events {
        match event {
            SegmentEvent::TrackInfo(info) => {
                let json = serde_json::to_string(&info).unwrap_or_default();
                info!(trackinfo = %json, "tracks discovered");
            }
            SegmentEvent::InitSegment { data } => {
                if *init_written {
                    warn!("received a second init segment; overwriting init.mp4");
                }
                let path = output_dir.join("init.mp4");
                write_file(&path, &data).await?;
                *init_written = true;
                debug!(bytes = data.len(), path = %path.display(), "wrote init segment");
            }
            SegmentEvent::MediaSegment { track_id, sequence_number, data } => {
                *segment_index += 1;
                let path = output_dir.join(format!("seg-{:06}.m4s", segment_index));
                write_file(&path, &data).await?;
                debug!(
                    track_id,
                    sequence_number,
                    bytes = data.len(),
                    path = %path.display(),
                    "wrote media segment"
                );
            }
            SegmentEvent::Captions(packet) => {
                debug!(pts = packet.pts, pairs = packet.byte_pairs.len(), "caption cue");
            }
            SegmentEvent::TimedMetadata(meta) => {
                debug!(pts = meta.pts, bytes = meta.tag.len(), "id3 timed metadata");
            }
            SegmentEvent::Done => {
                debug!("done");
            }
        }
    }
    Ok(())
}

async fn write_file(path: &std::path::Path, data: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(data).await.with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
