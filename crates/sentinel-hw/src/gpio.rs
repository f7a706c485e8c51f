//! PIR input and buzzer output over the Linux sysfs GPIO and PWM interfaces.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";
const SYSFS_PWM_ROOT: &str = "/sys/class/pwm";

/// udev needs a moment to fix permissions on a freshly exported line.
const EXPORT_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unexpected value {value:?} in {path}")]
    BadValue { path: PathBuf, value: String },
}

/// Hardware read failure on the motion sensor line.
#[derive(Debug, Error)]
#[error("motion sensor read failed: {0}")]
pub struct SensorError(#[from] pub GpioError);

/// Failure driving the alert output.
#[derive(Debug, Error)]
#[error("buzzer write failed: {0}")]
pub struct ActuatorError(#[from] pub GpioError);

/// The raw PIR signal: `true` while the sensor reports presence.
pub trait MotionLine: Send {
    fn read(&mut self) -> Result<bool, SensorError>;
}

/// A binary alert output.
pub trait BuzzerLine: Send {
    fn set(&mut self, active: bool) -> Result<(), ActuatorError>;
}

fn write_file(path: &Path, contents: &str) -> Result<(), GpioError> {
    std::fs::write(path, contents).map_err(|source| GpioError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_file(path: &Path) -> Result<String, GpioError> {
    std::fs::read_to_string(path).map_err(|source| GpioError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// One exported sysfs GPIO line.
pub struct SysfsGpio {
    pin: u32,
    value_path: PathBuf,
}

impl SysfsGpio {
    /// Export `pin` under the real sysfs root and configure it as an input.
    pub fn input(pin: u32) -> Result<Self, GpioError> {
        Self::export(Path::new(SYSFS_GPIO_ROOT), pin, "in")
    }

    /// Export `pin` under the real sysfs root and configure it as an output, driven low.
    pub fn output(pin: u32) -> Result<Self, GpioError> {
        Self::export(Path::new(SYSFS_GPIO_ROOT), pin, "low")
    }

    /// Export `pin` below `root`, writing `direction` ("in", "out", "low" or "high").
    pub fn export(root: &Path, pin: u32, direction: &str) -> Result<Self, GpioError> {
        let line_dir = root.join(format!("gpio{pin}"));
        if !line_dir.exists() {
            write_file(&root.join("export"), &pin.to_string())?;
            std::thread::sleep(EXPORT_SETTLE);
        }
        write_file(&line_dir.join("direction"), direction)?;
        tracing::debug!(pin, direction, "gpio exported");

        Ok(Self {
            pin,
            value_path: line_dir.join("value"),
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn read_level(&self) -> Result<bool, GpioError> {
        let raw = read_file(&self.value_path)?;
        match raw.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(GpioError::BadValue {
                path: self.value_path.clone(),
                value: other.to_string(),
            }),
        }
    }

    pub fn write_level(&self, high: bool) -> Result<(), GpioError> {
        write_file(&self.value_path, if high { "1" } else { "0" })
    }
}

/// PIR sensor wired to a GPIO input.
pub struct PirSensor {
    gpio: SysfsGpio,
    active_low: bool,
}

impl PirSensor {
    pub fn new(gpio: SysfsGpio, active_low: bool) -> Self {
        Self { gpio, active_low }
    }
}

impl MotionLine for PirSensor {
    fn read(&mut self) -> Result<bool, SensorError> {
        let level = self.gpio.read_level()?;
        Ok(level != self.active_low)
    }
}

/// Active buzzer switched by a plain GPIO output.
pub struct GpioBuzzer {
    gpio: SysfsGpio,
}

impl GpioBuzzer {
    pub fn new(gpio: SysfsGpio) -> Self {
        Self { gpio }
    }
}

impl BuzzerLine for GpioBuzzer {
    fn set(&mut self, active: bool) -> Result<(), ActuatorError> {
        self.gpio.write_level(active)?;
        Ok(())
    }
}

/// Passive buzzer driven by a sysfs PWM channel at a fixed tone.
pub struct PwmBuzzer {
    channel_dir: PathBuf,
}

impl PwmBuzzer {
    /// Export `channel` of `pwmchip{chip}` and program it for `frequency_hz`
    /// at `duty` (0.0–1.0] of the period. The output starts disabled.
    pub fn new(chip: u32, channel: u32, frequency_hz: u32, duty: f32) -> Result<Self, GpioError> {
        let chip_dir = Path::new(SYSFS_PWM_ROOT).join(format!("pwmchip{chip}"));
        Self::with_chip_dir(&chip_dir, channel, frequency_hz, duty)
    }

    pub fn with_chip_dir(
        chip_dir: &Path,
        channel: u32,
        frequency_hz: u32,
        duty: f32,
    ) -> Result<Self, GpioError> {
        let channel_dir = chip_dir.join(format!("pwm{channel}"));
        if !channel_dir.exists() {
            write_file(&chip_dir.join("export"), &channel.to_string())?;
            std::thread::sleep(EXPORT_SETTLE);
        }

        let period_ns = 1_000_000_000u64 / u64::from(frequency_hz.max(1));
        let duty_ns = (period_ns as f64 * f64::from(duty.clamp(0.0, 1.0))) as u64;

        write_file(&channel_dir.join("enable"), "0")?;
        // The kernel rejects a duty cycle longer than the current period.
        write_file(&channel_dir.join("duty_cycle"), "0")?;
        write_file(&channel_dir.join("period"), &period_ns.to_string())?;
        write_file(&channel_dir.join("duty_cycle"), &duty_ns.to_string())?;

        tracing::debug!(channel, frequency_hz, period_ns, duty_ns, "pwm buzzer configured");
        Ok(Self { channel_dir })
    }
}

impl BuzzerLine for PwmBuzzer {
    fn set(&mut self, active: bool) -> Result<(), ActuatorError> {
        write_file(&self.channel_dir.join("enable"), if active { "1" } else { "0" })?;
        Ok(())
    }
}
