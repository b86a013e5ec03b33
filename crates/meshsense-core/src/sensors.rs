//! Sensor collaborator seams
//!
//! Driver wrappers live outside the core; it only sees synchronous reads
//! that may fail. A failed read becomes an absent field in the
//! measurement record, never an error.

/// One environmental sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentReading {
    /// Degrees Celsius.
    pub temperature: f32,
    /// hPa.
    pub pressure: f32,
    /// Percent relative humidity.
    pub humidity: f32,
}

/// One battery gauge sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    /// Volts.
    pub voltage: f32,
    /// Percent of charge remaining.
    pub percentage: f32,
}

/// Environmental sensor, e.g. a BME280 behind its driver wrapper.
pub trait EnvironmentSensor {
    fn read(&mut self) -> Option<EnvironmentReading>;
}

/// Battery fuel gauge.
pub trait BatteryGauge {
    fn read(&mut self) -> Option<BatteryReading>;
}

/// Sensor double returning the same reading forever.
#[derive(Debug, Clone, Copy)]
pub struct FixedEnvironmentSensor(pub EnvironmentReading);

impl EnvironmentSensor for FixedEnvironmentSensor {
    fn read(&mut self) -> Option<EnvironmentReading> {
        Some(self.0)
    }
}

/// Gauge double returning the same reading forever.
#[derive(Debug, Clone, Copy)]
pub struct FixedBatteryGauge(pub BatteryReading);

impl BatteryGauge for FixedBatteryGauge {
    fn read(&mut self) -> Option<BatteryReading> {
        Some(self.0)
    }
}

/// A sensor that never answers, for exercising absent-field paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsentSensor;

impl EnvironmentSensor for AbsentSensor {
    fn read(&mut self) -> Option<EnvironmentReading> {
        None
    }
}

impl BatteryGauge for AbsentSensor {
    fn read(&mut self) -> Option<BatteryReading> {
        None
    }
}
