//! Open each pixel type in turn on a manually clocked camera and inspect a frame.

use dcam_ring::{
    CaptureOptions, Clock, FrameBuffer, LoopbackBus, LoopbackCamera, Pixel, Rgb8, VideoBuffer,
    Yuv411,
};

fn describe<T: Pixel>(bus: &LoopbackBus, options: &CaptureOptions) -> Result<(), dcam_ring::Error> {
    let buffer = FrameBuffer::<T>::open(bus, options)?;
    bus.trigger(0)?;

    let frame = VideoBuffer::get_frame(&buffer)?;
    println!(
        "{:?} @ {} fps: {} values, {} rows, first value {:?}",
        T::MODE,
        buffer.frame_rate(),
        frame.pixels().len(),
        frame.rows().count(),
        frame.pixels()[0]
    );
    buffer.put_frame(frame)
}

fn main() -> Result<(), dcam_ring::Error> {
    tracing_subscriber::fmt::init();

    let bus = LoopbackBus::builder()
        .camera(LoopbackCamera::builder().clock(Clock::Manual).build())
        .build();
    let options = CaptureOptions::builder(0).num_slots(3).build()?;

    describe::<u8>(&bus, &options)?;
    describe::<Yuv411>(&bus, &options)?;
    describe::<Rgb8>(&bus, &options)?;

    match FrameBuffer::<Rgb8>::open_with_rate(&bus, &options, 30.0) {
        Ok(_) => println!("RGB at 30 fps unexpectedly accepted"),
        Err(e) => println!("RGB at 30 fps: {e}"),
    }
    Ok(())
}
