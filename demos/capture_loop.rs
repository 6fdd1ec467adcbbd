//! Stream frames from a free-running loopback camera until Ctrl-C.
//!
//! Run with `RUST_LOG=dcam_ring=debug` to see session events.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dcam_ring::{CaptureOptions, LoopbackBus, LoopbackCamera, MonoBuffer};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), dcam_ring::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Set up signal handler for graceful shutdown
    let exit_loop = Arc::new(AtomicBool::new(false));
    let exit_loop_clone = exit_loop.clone();
    ctrlc::set_handler(move || {
        exit_loop_clone.store(true, Ordering::Relaxed);
    })
    .expect("Error setting Ctrl-C handler");

    let bus = LoopbackBus::builder()
        .camera(LoopbackCamera::default())
        .build();
    let options = CaptureOptions::builder(0)
        .num_slots(4)
        .brightness(128)
        .exposure(-1)
        .build()?;

    let buffer = MonoBuffer::open(&bus, &options)?;
    println!(
        "Capturing {} at {} fps from {} (channel {})",
        buffer.size(),
        buffer.frame_rate(),
        buffer.capture().node(),
        buffer.capture().channel()
    );

    while !exit_loop.load(Ordering::Relaxed) {
        let Some(frame) = buffer.get_frame_timeout(Duration::from_secs(1))? else {
            println!("Timeout waiting for frame");
            continue;
        };

        let mean = frame.pixels().iter().map(|&p| u64::from(p)).sum::<u64>()
            / frame.pixels().len() as u64;
        println!("Frame #{} in slot {}: mean intensity {mean}", frame.sequence(), frame.slot());
        buffer.put_frame(frame)?;
    }

    let stats = buffer.capture().stats();
    println!(
        "Captured {} frames, delivered {}, dropped {}",
        stats.captured, stats.delivered, stats.dropped
    );
    Ok(())
}
