//! Pairwise Coulomb benchmark.
//!
//! Run with: cargo run -p ringkernel-coulomb --bin coulomb --release
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::io::Write;

use ringkernel_coulomb::driver::{run_with_progress, RunConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    setup_logging();

    let config = RunConfig::default();
    println!(
        "Pairwise Coulomb: {} particles, grid {} x {}",
        config.lattice.particle_count(),
        config.geometry.blocks,
        config.geometry.threads_per_block
    );

    let mut last_percent = 0;
    let result = run_with_progress(&config, |done, total| {
        let percent = done * 100 / total;
        if percent >= last_percent + 10 || done == total {
            last_percent = percent;
            print!("\rSequential solve: {:>3}%", percent);
            let _ = std::io::stdout().flush();
            if done == total {
                println!();
            }
        }
    });

    match result {
        Ok(report) => println!("{}", report),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
