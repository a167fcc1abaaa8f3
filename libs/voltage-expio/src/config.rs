//! Board configuration
//!
//! Identity, polling cadence, write-retry policy and the register layout of the
//! expansion board family. Every field has a hardware default, so an empty
//! document deserializes into a working configuration for a single main board.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ExpioError, Result};

/// Complete configuration for one board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Human-readable board name (routing prefix, e.g. "local")
    pub name: String,
    /// Modbus unit id
    pub unit_id: u8,
    /// Number of groups to probe during discovery (from the hardware model)
    pub group_count: u8,
    /// Capacity of the change-event broadcast channel
    pub event_capacity: usize,
    pub polling: PollingConfig,
    pub write_retry: WriteRetryConfig,
    pub registers: RegisterMap,
    pub calibration: CalibrationMap,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            unit_id: 1,
            group_count: 1,
            event_capacity: 256,
            polling: PollingConfig::default(),
            write_retry: WriteRetryConfig::default(),
            registers: RegisterMap::default(),
            calibration: CalibrationMap::default(),
        }
    }
}

impl BoardConfig {
    /// Reject settings that would produce zero-length timers or overflow the
    /// 16-bit register space
    pub fn validate(&self) -> Result<()> {
        if self.group_count == 0 {
            return Err(ExpioError::config("group_count must be at least 1"));
        }
        if self.polling.interval_ms == 0 {
            return Err(ExpioError::config("polling.interval_ms must be positive"));
        }
        if self.polling.counter_interval_factor == 0 {
            return Err(ExpioError::config(
                "polling.counter_interval_factor must be positive",
            ));
        }
        if self.write_retry.base_delay_ms == 0 {
            return Err(ExpioError::config(
                "write_retry.base_delay_ms must be positive",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ExpioError::config("event_capacity must be positive"));
        }

        let last_group = u32::from(self.group_count) - 1;
        let highest = u32::from(self.registers.capability_base)
            + last_group * u32::from(self.registers.group_stride)
            + 1;
        if highest > u32::from(u16::MAX) {
            return Err(ExpioError::config(format!(
                "{} groups exceed the register address space",
                self.group_count
            )));
        }
        Ok(())
    }
}

/// Polling cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Whether the periodic loops are started
    pub enabled: bool,
    /// State refresh period (milliseconds)
    pub interval_ms: u64,
    /// Counter refresh runs every `interval_ms * counter_interval_factor`
    pub counter_interval_factor: u32,
    /// Per-request transport timeout (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            counter_interval_factor: 5,
            request_timeout_ms: 1000,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn counter_interval(&self) -> Duration {
        self.interval() * self.counter_interval_factor
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Write verification policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteRetryConfig {
    /// Retries after the initial write (total writes = max_retries + 1)
    pub max_retries: u32,
    /// Verification delay unit; check `n` waits `base_delay_ms * (n + 1)`
    pub base_delay_ms: u64,
}

impl Default for WriteRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 100,
        }
    }
}

impl WriteRetryConfig {
    /// Delay before the verification check that follows write `retry`
    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms * u64::from(retry + 1))
    }
}

/// Holding-register and coil layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    /// Distance between consecutive groups in register and coil space
    pub group_stride: u16,
    /// First capability register (group index 0)
    pub capability_base: u16,
    /// LED word of group 1
    pub led_register: u16,
    /// AO raw word of group 1; the AI raw word follows it
    pub analog_register: u16,
    /// Counter block offset for group 1, relative to the group base
    pub main_counter_offset: u16,
    /// Counter block offset for expansion groups, relative to the group base
    pub expansion_counter_offset: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            group_stride: 100,
            capability_base: 1001,
            led_register: 20,
            analog_register: 2,
            main_counter_offset: 8,
            expansion_counter_offset: 2,
        }
    }
}

impl RegisterMap {
    /// First register (and coil) of a 1-based group
    pub fn group_base(&self, group: u8) -> u16 {
        u16::from(group.saturating_sub(1)) * self.group_stride
    }

    /// Capability registers of a 0-based group index
    pub fn capability_address(&self, group_index: u8) -> u16 {
        self.capability_base + u16::from(group_index) * self.group_stride
    }

    /// First counter register of a 1-based group
    pub fn counter_base(&self, group: u8) -> u16 {
        let offset = if group == 1 {
            self.main_counter_offset
        } else {
            self.expansion_counter_offset
        };
        self.group_base(group) + offset
    }

    /// Coil of a digital output
    pub fn output_coil(&self, group: u8, index: u8) -> u16 {
        self.group_base(group) + u16::from(index.saturating_sub(1))
    }
}

/// Calibration register layout for analog channel 1 of group 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationMap {
    pub output_mode_register: u16,
    pub input_mode_register: u16,
    pub vref_register: u16,
    pub vref_int_register: u16,
    /// (offset, deviation) pair used for AO in voltage/resistance mode
    pub output_voltage_pair: u16,
    /// (offset, deviation) pair used for AO in current mode
    pub output_current_pair: u16,
    /// (offset, deviation) pair used for AI in voltage/resistance mode
    pub input_voltage_pair: u16,
    /// (offset, deviation) pair used for AI in current mode
    pub input_current_pair: u16,
}

impl Default for CalibrationMap {
    fn default() -> Self {
        Self {
            output_mode_register: 1019,
            input_mode_register: 1020,
            vref_register: 1009,
            vref_int_register: 5,
            output_voltage_pair: 1021,
            output_current_pair: 1023,
            input_voltage_pair: 1025,
            input_current_pair: 1027,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BoardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.polling.interval(), Duration::from_millis(1000));
        assert_eq!(config.polling.counter_interval(), Duration::from_millis(5000));
        assert_eq!(config.write_retry.max_retries, 5);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: BoardConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, BoardConfig::default());
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
name: cabinet
unit_id: 3
group_count: 2
polling:
  interval_ms: 250
registers:
  led_register: 21
"#;
        let config: BoardConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "cabinet");
        assert_eq!(config.unit_id, 3);
        assert_eq!(config.group_count, 2);
        assert_eq!(config.polling.interval_ms, 250);
        assert_eq!(config.polling.counter_interval_factor, 5);
        assert_eq!(config.registers.led_register, 21);
        assert_eq!(config.registers.group_stride, 100);
    }

    #[test]
    fn test_retry_delay_grows_linearly() {
        let retry = WriteRetryConfig::default();
        assert_eq!(retry.delay(0), Duration::from_millis(100));
        assert_eq!(retry.delay(4), Duration::from_millis(500));
    }

    #[test]
    fn test_register_addresses() {
        let map = RegisterMap::default();
        assert_eq!(map.group_base(1), 0);
        assert_eq!(map.group_base(3), 200);
        assert_eq!(map.capability_address(0), 1001);
        assert_eq!(map.capability_address(2), 1201);
        assert_eq!(map.counter_base(1), 8);
        assert_eq!(map.counter_base(2), 102);
        assert_eq!(map.output_coil(1, 1), 0);
        assert_eq!(map.output_coil(2, 4), 103);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BoardConfig {
            group_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ExpioError::Config(_))));

        config.group_count = 1;
        config.polling.interval_ms = 0;
        assert!(config.validate().is_err());

        config.polling.interval_ms = 100;
        config.registers.group_stride = 1000;
        config.group_count = 200;
        assert!(config.validate().is_err());
    }
}
