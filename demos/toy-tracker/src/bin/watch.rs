//! Console viewer for a position stream.

use clap::Parser;
use tracing::info;
use weir::prelude::*;

#[derive(Parser)]
#[command(name = "toy-watch", about = "Print a position stream")]
struct Args {
    /// Input position endpoint.
    #[arg(long, default_value = "pos")]
    source: String,
    /// Print every Nth sample.
    #[arg(long, default_value_t = 1)]
    every: u64,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("toy-watch: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), NodeError> {
    toy_tracker::init_tracing();
    let args = Args::parse();
    let stop = toy_tracker::stop_flag();

    let mut source: Source<Position> =
        Source::connect_interruptible(&args.source, stop)?;
    info!(endpoint = %args.source, "watching");

    let mut n = 0u64;
    while let Some(position) = source.recv()? {
        n += 1;
        if n % args.every.max(1) != 0 {
            continue;
        }
        let mut line = format!(
            "#{n:>6}  ({:7.1}, {:7.1})",
            position.point.x, position.point.y
        );
        if position.velocity_valid {
            line.push_str(&format!(
                "  v=({:7.1}, {:7.1})",
                position.velocity.vx, position.velocity.vy
            ));
        }
        if let Some(region) = position.region() {
            line.push_str(&format!("  [{region}]"));
        }
        println!("{line}");
    }

    info!(samples = n, "end of stream");
    Ok(())
}
