//! Analog calibration
//!
//! Analog channel 1 of the main board is converted with board-resident
//! calibration constants. The constants are read as a dependent chain on every
//! conversion:
//!
//! ```text
//! mode register ──> vref ──> vref_int ──> (offset, deviation) pair
//!                                           └── address chosen by mode and channel
//! ```
//!
//! All other analog channels use the uncalibrated placeholder conversion.

use std::sync::Arc;
use tracing::{debug, error};

use crate::address::{IoId, IoKind};
use crate::config::CalibrationMap;
use crate::error::{ExpioError, Result};
use crate::store::round2;
use crate::transport::RegisterTransport;

/// ADC full-scale count
const ADC_RESOLUTION: f64 = 4096.0;
/// Supply voltage of the ADC reference divider
const SUPPLY_VOLTAGE: f64 = 3.3;
/// Raw count per 10 engineering units on uncalibrated outputs
const PLACEHOLDER_RAW_SPAN: f64 = 4000.0;

/// Mode register values
pub const MODE_VOLTAGE: u16 = 0;
pub const MODE_CURRENT: u16 = 1;
pub const MODE_RESISTANCE: u16 = 3;

/// Direction of an analog channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogChannel {
    Output,
    Input,
}

impl AnalogChannel {
    pub fn of(kind: IoKind) -> Option<Self> {
        match kind {
            IoKind::AnalogOutput => Some(AnalogChannel::Output),
            IoKind::AnalogInput => Some(AnalogChannel::Input),
            _ => None,
        }
    }
}

/// Calibration constants read for one conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationContext {
    pub mode: u16,
    pub vref: u16,
    pub vref_int: u16,
    pub deviation: i16,
    pub offset: i16,
}

impl CalibrationContext {
    /// Range multiplier for the configured mode
    pub fn scale(&self) -> f64 {
        match self.mode {
            MODE_VOLTAGE => 3.0,
            MODE_CURRENT => 10.0,
            _ => 1.0,
        }
    }

    fn gain(&self) -> f64 {
        SUPPLY_VOLTAGE * (f64::from(self.vref) / f64::from(self.vref_int)) * self.scale()
    }

    fn correction(&self) -> f64 {
        1.0 + f64::from(self.deviation) / 10000.0
    }

    fn offset_units(&self) -> f64 {
        f64::from(self.offset) / 1000.0
    }

    /// Raw ADC count to engineering units, rounded to 2 decimals
    pub fn apply(&self, raw: u16) -> f64 {
        round2(
            self.gain() * (f64::from(raw) / ADC_RESOLUTION) * self.correction()
                + self.offset_units(),
        )
    }

    /// Engineering units back to the raw count, clamped to the register range
    pub fn invert(&self, value: f64) -> Option<u16> {
        let denominator = self.gain() * self.correction();
        if denominator == 0.0 || !denominator.is_finite() {
            return None;
        }
        let raw = (value - self.offset_units()) / denominator * ADC_RESOLUTION;
        Some(clamp_raw(raw))
    }
}

fn clamp_raw(raw: f64) -> u16 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Uncalibrated raw to engineering conversion
pub fn placeholder_value(raw: u16) -> f64 {
    f64::from(raw) / PLACEHOLDER_RAW_SPAN * 10.0
}

/// Uncalibrated engineering to raw conversion
pub fn placeholder_raw(value: f64) -> u16 {
    clamp_raw(value / 10.0 * PLACEHOLDER_RAW_SPAN)
}

/// Converts analog samples and setpoints
pub struct AnalogCalibrator {
    transport: Arc<dyn RegisterTransport>,
    unit_id: u8,
    map: CalibrationMap,
}

impl AnalogCalibrator {
    pub fn new(transport: Arc<dyn RegisterTransport>, unit_id: u8, map: CalibrationMap) -> Self {
        Self {
            transport,
            unit_id,
            map,
        }
    }

    /// Whether `id` is the board-calibrated analog channel
    pub fn is_calibrated(id: &IoId) -> bool {
        id.kind.is_analog() && id.group == 1 && id.index == 1
    }

    async fn read_word(&self, address: u16) -> Result<u16> {
        let words = self
            .transport
            .read_holding_registers(self.unit_id, address, 1)
            .await?;
        words.first().copied().ok_or_else(|| {
            ExpioError::transport(format!("Empty response reading register {}", address))
        })
    }

    /// Read the calibration constants for a channel
    pub async fn read_context(&self, channel: AnalogChannel) -> Result<CalibrationContext> {
        let mode_register = match channel {
            AnalogChannel::Output => self.map.output_mode_register,
            AnalogChannel::Input => self.map.input_mode_register,
        };
        let mode = self.read_word(mode_register).await?;
        let vref = self.read_word(self.map.vref_register).await?;
        let vref_int = self.read_word(self.map.vref_int_register).await?;
        if vref_int == 0 {
            return Err(ExpioError::InvalidCalibration(
                "internal reference voltage is zero".to_string(),
            ));
        }

        let pair_address = match (channel, mode == MODE_CURRENT) {
            (AnalogChannel::Output, true) => self.map.output_current_pair,
            (AnalogChannel::Output, false) => self.map.output_voltage_pair,
            (AnalogChannel::Input, true) => self.map.input_current_pair,
            (AnalogChannel::Input, false) => self.map.input_voltage_pair,
        };
        let pair = self
            .transport
            .read_holding_registers(self.unit_id, pair_address, 2)
            .await?;
        let [offset, deviation] = match pair.as_slice() {
            [offset, deviation, ..] => [*offset, *deviation],
            _ => {
                return Err(ExpioError::transport(format!(
                    "Short calibration pair at {}",
                    pair_address
                )))
            }
        };

        let context = CalibrationContext {
            mode,
            vref,
            vref_int,
            deviation: deviation as i16,
            offset: offset as i16,
        };
        debug!("Calibration {:?}: {:?}", channel, context);
        Ok(context)
    }

    /// Raw register value of `id` to engineering units
    pub async fn convert(&self, id: &IoId, raw: u16) -> Result<f64> {
        if Self::is_calibrated(id) {
            let channel = match AnalogChannel::of(id.kind) {
                Some(channel) => channel,
                None => return Err(ExpioError::unknown_address(id.to_string())),
            };
            let context = self.read_context(channel).await?;
            return Ok(context.apply(raw));
        }

        match id.kind {
            IoKind::AnalogOutput => Ok(placeholder_value(raw)),
            _ => Ok(f64::from(raw)),
        }
    }

    /// Engineering setpoint of an analog output to the raw register value
    pub async fn encode_output(&self, id: &IoId, value: f64) -> u16 {
        if Self::is_calibrated(id) {
            match self.read_context(AnalogChannel::Output).await {
                Ok(context) => {
                    if let Some(raw) = context.invert(value) {
                        return raw;
                    }
                    error!("Calibration for {} cannot be inverted: {:?}", id, context);
                }
                Err(e) => {
                    error!("Calibration read for {} failed: {}", id, e);
                }
            }
        }
        placeholder_raw(value)
    }
}

impl std::fmt::Debug for AnalogCalibrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalogCalibrator")
            .field("unit_id", &self.unit_id)
            .field("map", &self.map)
            .finish()
    }
}
