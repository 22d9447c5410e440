//! Brightest-pixel detector: frames in, positions out.
//!
//! Middle component of the demo pipeline. When its frame source reports
//! end-of-stream it closes its own position sink before exiting, so the
//! end of the stream propagates hop by hop to the viewer.

use clap::Parser;
use tracing::info;
use weir::prelude::*;
use weir::{Heading2, Velocity2};

#[derive(Parser)]
#[command(name = "toy-track", about = "Track the brightest pixel in a frame stream")]
struct Args {
    /// Input frame endpoint.
    #[arg(long, default_value = "cam")]
    source: String,
    /// Output position endpoint.
    #[arg(long, default_value = "pos")]
    sink: String,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("toy-track: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), NodeError> {
    toy_tracker::init_tracing();
    let args = Args::parse();
    let stop = toy_tracker::stop_flag();

    let mut source = FrameSource::connect_interruptible(&args.source, stop.clone())?;
    let spec = source.spec();
    let mut sink: Sink<Position> = Sink::bind(&args.sink)?;
    sink.set_interrupt(stop);
    info!(from = %args.source, to = %args.sink, "tracking");

    let mut pixels = vec![0u8; spec.data_len()];
    let mut previous: Option<Position> = None;
    let mut samples = 0u64;
    loop {
        match source.wait()? {
            WaitResult::EndOfStream => break,
            WaitResult::Ready => {}
        }
        source.copy_into(&mut pixels)?;
        source.post()?;

        let mut position = detect(&pixels, spec);
        position.sample_usec = toy_tracker::now_usec();
        if let Some(prev) = previous {
            derive_motion(&mut position, &prev);
        }
        previous = Some(position);

        match sink.push(|slot| *slot = position) {
            Ok(()) => samples += 1,
            Err(NodeError::NodeClosed) => break,
            Err(e) => return Err(e),
        }
    }

    // Propagate end-of-stream to the next hop.
    sink.close();
    info!(samples, "done");
    Ok(())
}

fn detect(pixels: &[u8], spec: FrameSpec) -> Position {
    let mut best = 0u8;
    let mut at = (0u32, 0u32);
    for r in 0..spec.rows {
        let row = &pixels[r as usize * spec.step..][..spec.cols as usize];
        for (c, &v) in row.iter().enumerate() {
            if v > best {
                best = v;
                at = (c as u32, r);
            }
        }
    }
    Position::at(at.0 as f64, at.1 as f64)
}

fn derive_motion(position: &mut Position, prev: &Position) {
    let dt = position.sample_usec.saturating_sub(prev.sample_usec) as f64 / 1e6;
    if dt <= 0.0 || !prev.position_valid {
        return;
    }
    let vx = (position.point.x - prev.point.x) / dt;
    let vy = (position.point.y - prev.point.y) / dt;
    position.velocity = Velocity2 { vx, vy };
    position.velocity_valid = true;

    let magnitude = (vx * vx + vy * vy).sqrt();
    if magnitude > f64::EPSILON {
        position.heading = Heading2 {
            ux: vx / magnitude,
            uy: vy / magnitude,
        };
        position.heading_valid = true;
    }
}
