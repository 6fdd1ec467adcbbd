//! Typed frame buffers over the loopback bus.

use dcam_ring::{
    CaptureMode, CaptureOptions, Clock, Error, FrameBuffer, FrameRate, ImageSize, LoopbackBus,
    LoopbackCamera, MonoBuffer, Pixel, RgbBuffer, VideoBuffer, Yuv411, Yuv411Buffer,
};

fn manual_bus() -> LoopbackBus {
    LoopbackBus::builder()
        .camera(LoopbackCamera::builder().clock(Clock::Manual).build())
        .build()
}

fn options() -> CaptureOptions {
    CaptureOptions::builder(0).num_slots(3).build().unwrap()
}

#[test]
fn test_default_rates_per_pixel_type() {
    let bus = manual_bus();

    let mono = MonoBuffer::open(&bus, &options()).unwrap();
    assert_eq!(mono.frame_rate(), 30.0);
    assert_eq!(mono.capture().mode(), CaptureMode::Mono8_640x480);
    drop(mono);

    let yuv = Yuv411Buffer::open(&bus, &options()).unwrap();
    assert_eq!(yuv.frame_rate(), 30.0);
    assert_eq!(yuv.capture().mode(), CaptureMode::Yuv411_640x480);
    drop(yuv);

    let rgb = RgbBuffer::open(&bus, &options()).unwrap();
    assert_eq!(rgb.frame_rate(), 15.0);
    assert_eq!(rgb.capture().mode(), CaptureMode::Rgb8_640x480);
    assert_eq!(rgb.size(), ImageSize::new(640, 480));
}

#[test]
fn test_rgb_at_thirty_fps_is_unsupported() {
    let bus = manual_bus();
    match RgbBuffer::open_with_rate(&bus, &options(), 30.0) {
        Err(Error::ModeUnsupported { mode, frame_rate }) => {
            assert_eq!(mode, CaptureMode::Rgb8_640x480);
            assert_eq!(frame_rate, 30.0);
        }
        other => panic!("Expected ModeUnsupported, got {other:?}"),
    }
    assert_eq!(bus.active_mappings(), 0);
}

#[test]
fn test_explicit_rate() {
    let bus = manual_bus();
    let mono = MonoBuffer::open_with_rate(&bus, &options(), 60.0).unwrap();
    assert_eq!(mono.frame_rate(), 60.0);
    assert_eq!(mono.capture().negotiated_rate(), FrameRate::Fps60);
}

#[test]
fn test_mono_pixels() {
    let bus = manual_bus();
    let mono = MonoBuffer::open(&bus, &options()).unwrap();
    for _ in 0..3 {
        bus.trigger(0).unwrap();
    }
    let _ = mono.get_frame().unwrap();
    let _ = mono.get_frame().unwrap();

    let frame = mono.get_frame().unwrap();
    assert_eq!(frame.sequence(), 2);
    assert_eq!(frame.pixels().len(), 640 * 480);
    assert_eq!(frame.rows().count(), 480);
    assert!(frame.pixels()[8..].iter().all(|&p| p == 2));
    mono.put_frame(frame).unwrap();
}

#[test]
fn test_yuv411_groups() {
    let bus = manual_bus();
    let yuv = Yuv411Buffer::open(&bus, &options()).unwrap();
    bus.trigger(0).unwrap();
    bus.trigger(0).unwrap();
    let _ = yuv.get_frame().unwrap();

    let frame = yuv.get_frame().unwrap();
    assert_eq!(frame.pixels().len(), 640 * 480 / 4);
    assert!(frame.rows().all(|row| row.len() == 160));
    // Past the counter header every byte holds the counter's low byte.
    assert_eq!(frame.pixels()[2], Yuv411 { u: 1, y0: 1, y1: 1, v: 1, y2: 1, y3: 1 });
    assert_eq!(frame.pixels()[2].luma(), [1; 4]);
}

#[test]
fn test_rgb_pixels_and_owned_copy() {
    let bus = manual_bus();
    let rgb = RgbBuffer::open(&bus, &options()).unwrap();
    bus.trigger(0).unwrap();

    let owned = {
        let frame = rgb.get_frame().unwrap();
        assert_eq!(frame.pixels().len(), 640 * 480);
        let owned = frame.to_owned();
        rgb.put_frame(frame).unwrap();
        owned
    };

    assert_eq!(rgb.capture().stats().checked_out, 0);
    assert_eq!(owned.size, ImageSize::new(640, 480));
    assert_eq!(owned.sequence, 0);
    assert_eq!(owned.rows().count(), 480);
    assert_eq!(owned.pixels[640].red, 0);
}

#[test]
fn test_seek_is_a_no_op() {
    let bus = manual_bus();
    let mono = MonoBuffer::open(&bus, &options()).unwrap();
    bus.trigger(0).unwrap();

    mono.seek_to(12.5);
    mono.seek_to(-1.0);

    assert!(mono.frame_pending());
    assert_eq!(mono.get_frame().unwrap().sequence(), 0);
}

fn drain<T: Pixel, B: VideoBuffer<T>>(buffer: &B) -> Vec<u64> {
    let mut sequences = Vec::new();
    while buffer.frame_pending() {
        let frame = buffer.get_frame().unwrap();
        sequences.push(frame.sequence());
        buffer.put_frame(frame).unwrap();
    }
    sequences
}

#[test]
fn test_video_buffer_trait() {
    let bus = manual_bus();
    let rgb: FrameBuffer<dcam_ring::Rgb8> = RgbBuffer::open(&bus, &options()).unwrap();
    for _ in 0..3 {
        bus.trigger(0).unwrap();
    }

    assert_eq!(VideoBuffer::frame_rate(&rgb), 15.0);
    assert_eq!(VideoBuffer::size(&rgb), ImageSize::new(640, 480));
    assert_eq!(drain(&rgb), vec![0, 1, 2]);
}

#[test]
fn test_typed_buffer_exposes_controls() {
    let bus = manual_bus();
    let mono = MonoBuffer::open(&bus, &options()).unwrap();
    mono.capture().set_gain(42).unwrap();
    assert_eq!(mono.capture().gain().unwrap(), 42);
}
