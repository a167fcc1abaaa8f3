//! In-memory board simulator
//!
//! A register bank implementing [`RegisterTransport`] for tests and bench
//! setups without hardware. Coil writes can be mirrored into bits of a holding
//! register, which is how the real board reflects output state back into its
//! DO and LED words. Reads can be made to fail and writes can be silently
//! dropped to reproduce a degraded serial link.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::{RegisterTransport, TransportError};
use crate::config::RegisterMap;
use crate::decoder::with_bit;

/// Write request recorded by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRecord {
    Coil { address: u16, value: bool },
    Register { address: u16, value: u16 },
}

#[derive(Debug, Default)]
struct SimState {
    registers: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    /// coil -> (register, bit)
    coil_mirrors: HashMap<u16, (u16, u8)>,
    read_failures: HashMap<u16, TransportError>,
    write_failure: Option<TransportError>,
    drop_writes: u32,
    drop_all_writes: bool,
    writes: Vec<WriteRecord>,
    reads: Vec<(u16, u16)>,
}

/// Simulated expansion board
#[derive(Debug, Default)]
pub struct BoardSimulator {
    state: Mutex<SimState>,
}

impl BoardSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulator preloaded with capability registers for `groups`
    /// (`(di_count, do_count)` per group) and with DO/LED coils mirrored into
    /// their status words
    pub fn with_layout(map: &RegisterMap, groups: &[(u8, u8)], led_count: u8) -> Self {
        let sim = Self::new();
        for (position, (di, do_)) in groups.iter().enumerate() {
            let group_index = position as u8;
            let group = group_index + 1;
            sim.set_register(
                map.capability_address(group_index),
                (u16::from(*do_) << 8) | u16::from(*di),
            );
            let do_word = map.group_base(group) + 1;
            for bit in 0..*do_ {
                sim.mirror_coil(map.output_coil(group, bit + 1), do_word, bit);
            }
        }
        if let Some((di, do_)) = groups.first() {
            let led_base = u16::from(*do_) + u16::from(*di);
            for bit in 0..led_count {
                sim.mirror_coil(led_base + u16::from(bit), map.led_register, bit);
            }
        }
        sim
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    pub fn set_registers(&self, start: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.registers.insert(start + offset as u16, *value);
        }
    }

    pub fn register(&self, address: u16) -> u16 {
        self.state
            .lock()
            .registers
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.state.lock().coils.get(&address).copied()
    }

    /// Reflect writes to `coil` into bit `bit` of `register`
    pub fn mirror_coil(&self, coil: u16, register: u16, bit: u8) {
        self.state.lock().coil_mirrors.insert(coil, (register, bit));
    }

    /// Fail every read whose range covers `address`
    pub fn fail_reads_at(&self, address: u16, error: TransportError) {
        self.state.lock().read_failures.insert(address, error);
    }

    pub fn clear_read_failure(&self, address: u16) {
        self.state.lock().read_failures.remove(&address);
    }

    /// Fail every write with `error` (None restores normal writes)
    pub fn fail_writes(&self, error: Option<TransportError>) {
        self.state.lock().write_failure = error;
    }

    /// Acknowledge the next `count` writes without applying them
    pub fn drop_next_writes(&self, count: u32) {
        self.state.lock().drop_writes = count;
    }

    /// Acknowledge every write without applying it
    pub fn drop_all_writes(&self, enabled: bool) {
        self.state.lock().drop_all_writes = enabled;
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// `(address, count)` of every read request
    pub fn reads(&self) -> Vec<(u16, u16)> {
        self.state.lock().reads.clone()
    }
}

impl SimState {
    fn accept_write(&mut self, record: WriteRecord) -> Result<bool, TransportError> {
        self.writes.push(record);
        if let Some(err) = &self.write_failure {
            return Err(err.clone());
        }
        if self.drop_all_writes {
            return Ok(false);
        }
        if self.drop_writes > 0 {
            self.drop_writes -= 1;
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl RegisterTransport for BoardSimulator {
    async fn read_holding_registers(
        &self,
        _unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut state = self.state.lock();
        state.reads.push((address, count));

        let range = u32::from(address)..u32::from(address) + u32::from(count);
        if let Some(err) = state
            .read_failures
            .iter()
            .find(|(failing, _)| range.contains(&u32::from(**failing)))
            .map(|(_, err)| err.clone())
        {
            debug!("Simulated read failure at {} (+{})", address, count);
            return Err(err);
        }

        Ok((0..count)
            .map(|offset| {
                state
                    .registers
                    .get(&address.wrapping_add(offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn write_coil(
        &self,
        _unit_id: u8,
        address: u16,
        value: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.accept_write(WriteRecord::Coil { address, value })? {
            debug!("Simulated dropped coil write {} = {}", address, value);
            return Ok(());
        }

        state.coils.insert(address, value);
        if let Some((register, bit)) = state.coil_mirrors.get(&address).copied() {
            let word = state.registers.get(&register).copied().unwrap_or(0);
            state.registers.insert(register, with_bit(word, bit, value));
        }
        Ok(())
    }

    async fn write_register(
        &self,
        _unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.accept_write(WriteRecord::Register { address, value })? {
            debug!("Simulated dropped register write {} = {}", address, value);
            return Ok(());
        }
        state.registers.insert(address, value);
        Ok(())
    }
}
