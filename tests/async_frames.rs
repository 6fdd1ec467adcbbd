//! Async acquisition through the Tokio wrapper.

#![cfg(feature = "tokio")]

use std::time::Duration;

use dcam_ring::{
    tokio::AsyncFrameBuffer, CaptureOptions, Clock, LoopbackBus, LoopbackCamera, MonoBuffer,
    RgbBuffer,
};

fn bus(clock: Clock) -> LoopbackBus {
    LoopbackBus::builder()
        .camera(LoopbackCamera::builder().clock(clock).build())
        .build()
}

#[tokio::test]
async fn test_next_frame_copies_and_releases() {
    let bus = bus(Clock::FreeRunning);
    let options = CaptureOptions::builder(0).build().unwrap();
    let buffer = AsyncFrameBuffer::new(MonoBuffer::open(&bus, &options).unwrap());

    let first = buffer.next_frame().await.unwrap();
    let second = buffer.next_frame().await.unwrap();

    assert_eq!(first.pixels.len(), 640 * 480);
    assert!(second.sequence > first.sequence);
    assert_eq!(buffer.buffer().capture().stats().checked_out, 0);
}

#[tokio::test]
async fn test_timeout_resolves_to_none() {
    let bus = bus(Clock::Manual);
    let options = CaptureOptions::builder(0).build().unwrap();
    let buffer = AsyncFrameBuffer::new(RgbBuffer::open(&bus, &options).unwrap());

    let frame = buffer
        .next_frame_timeout(Duration::from_millis(20))
        .await
        .unwrap();
    assert!(frame.is_none());

    bus.trigger(0).unwrap();
    assert!(buffer.frame_pending());
    let frame = buffer
        .next_frame_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.sequence, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clones_share_one_session() {
    let bus = bus(Clock::Manual);
    let options = CaptureOptions::builder(0).num_slots(4).build().unwrap();
    let buffer = AsyncFrameBuffer::new(MonoBuffer::open(&bus, &options).unwrap());
    let other = buffer.clone();

    for _ in 0..2 {
        bus.trigger(0).unwrap();
    }

    let (a, b) = tokio::join!(buffer.next_frame(), other.next_frame());
    let mut sequences = vec![a.unwrap().sequence, b.unwrap().sequence];
    sequences.sort_unstable();
    assert_eq!(sequences, vec![0, 1]);
}
