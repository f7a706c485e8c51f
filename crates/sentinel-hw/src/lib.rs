//! sentinel-hw: Hardware abstraction for the motion-triggered pipeline.
//!
//! Provides V4L2 camera capture, the PIR motion input and the buzzer
//! output, each behind a small trait so the daemon can be driven by
//! scripted fakes in tests.

pub mod camera;
pub mod frame;
pub mod gpio;

pub use camera::{Camera, CameraSettings, CaptureError, FrameSource, PixelFormat};
pub use frame::Frame;
pub use gpio::{
    ActuatorError, BuzzerLine, GpioBuzzer, GpioError, MotionLine, PirSensor, PwmBuzzer,
    SensorError, SysfsGpio,
};
