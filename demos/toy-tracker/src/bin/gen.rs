//! Publishes synthetic frames: a bright square orbiting over a gradient.

use std::time::Duration;

use clap::Parser;
use tracing::info;
use weir::prelude::*;

const SQUARE: u32 = 32;

#[derive(Parser)]
#[command(name = "toy-gen", about = "Publish synthetic test frames")]
struct Args {
    /// Output endpoint name.
    #[arg(long, default_value = "cam")]
    sink: String,
    #[arg(long, default_value_t = 480)]
    rows: u32,
    #[arg(long, default_value_t = 640)]
    cols: u32,
    /// Frames per second.
    #[arg(long, default_value_t = 30.0)]
    fps: f64,
    /// Stop after this many frames (0 = run until interrupted).
    #[arg(long, default_value_t = 0)]
    frames: u64,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("toy-gen: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), NodeError> {
    toy_tracker::init_tracing();
    let args = Args::parse();
    let stop = toy_tracker::stop_flag();

    let spec = FrameSpec::packed(args.rows, args.cols, PixelFormat::Mono8);
    let mut sink = FrameSink::bind(&args.sink, spec)?;
    sink.set_interrupt(stop.clone());
    info!(endpoint = %args.sink, rows = args.rows, cols = args.cols, "streaming");

    let period = Duration::from_secs_f64(1.0 / args.fps.max(0.001));
    let mut k = 0u64;
    while !stop.load(std::sync::atomic::Ordering::Relaxed)
        && (args.frames == 0 || k < args.frames)
    {
        match sink.push_frame(|pixels| paint(pixels, spec, k)) {
            Ok(()) => {}
            Err(NodeError::NodeClosed) => break,
            Err(e) => return Err(e),
        }
        k += 1;
        std::thread::sleep(period);
    }

    info!(frames = k, "done");
    Ok(())
}

fn paint(pixels: &mut [u8], spec: FrameSpec, k: u64) {
    let (rows, cols) = (spec.rows as usize, spec.cols as usize);
    for r in 0..rows {
        for c in 0..cols {
            pixels[r * spec.step + c] = ((r + c + k as usize) / 4) as u8 & 0x7f;
        }
    }
    // The target the tracker should lock onto.
    let sq = (SQUARE as usize).min(rows / 2).min(cols / 2).max(1);
    let x = (k as usize * 3) % (cols - sq + 1);
    let y = (k as usize * 2) % (rows - sq + 1);
    for r in y..y + sq {
        pixels[r * spec.step + x..r * spec.step + x + sq].fill(0xff);
    }
}
