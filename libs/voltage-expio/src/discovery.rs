//! Group capability discovery
//!
//! Each group publishes its point counts in a capability block at
//! `capability_base + index * group_stride`. The main board (group 1) also
//! carries the fixed LED bank and analog channel pair.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::address::IoKind;
use crate::config::RegisterMap;
use crate::decoder::split_capability_word;
use crate::error::ExpioError;
use crate::transport::RegisterTransport;

/// Fixed capabilities of the main board
pub const MAIN_BOARD_LEDS: u8 = 4;
pub const MAIN_BOARD_ANALOG_INPUTS: u8 = 1;
pub const MAIN_BOARD_ANALOG_OUTPUTS: u8 = 1;

/// Capability descriptor of one group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Group {
    /// 1-based group number
    pub id: u8,
    pub di_count: u8,
    pub do_count: u8,
    pub ai_count: u8,
    pub ao_count: u8,
    pub led_count: u8,
    /// Not reported by the capability block
    pub serial_ports: u8,
}

impl Group {
    /// Group built from its capability word
    pub fn from_capability(id: u8, word: u16) -> Self {
        let (di_count, do_count) = split_capability_word(word);
        let mut group = Self {
            id,
            di_count,
            do_count,
            ..Default::default()
        };
        if id == 1 {
            group.led_count = MAIN_BOARD_LEDS;
            group.ai_count = MAIN_BOARD_ANALOG_INPUTS;
            group.ao_count = MAIN_BOARD_ANALOG_OUTPUTS;
        }
        group
    }

    /// Number of points of `kind` in this group
    pub fn capability(&self, kind: IoKind) -> u8 {
        match kind {
            IoKind::DigitalInput => self.di_count,
            IoKind::DigitalOutput => self.do_count,
            IoKind::AnalogInput => self.ai_count,
            IoKind::AnalogOutput => self.ao_count,
            IoKind::Led => self.led_count,
        }
    }

    pub fn is_main(&self) -> bool {
        self.id == 1
    }
}

/// Probe `group_count` groups; groups whose capability read fails are left out
pub async fn discover_groups(
    transport: &dyn RegisterTransport,
    unit_id: u8,
    group_count: u8,
    map: &RegisterMap,
) -> Vec<Group> {
    let mut groups = Vec::with_capacity(usize::from(group_count));

    for group_index in 0..group_count {
        let id = group_index + 1;
        let address = map.capability_address(group_index);
        match transport
            .read_holding_registers(unit_id, address, 2)
            .await
        {
            Ok(words) => match words.first() {
                Some(word) => {
                    let group = Group::from_capability(id, *word);
                    debug!(
                        "Group {}: {} DI, {} DO, {} LED, {} AI, {} AO",
                        id,
                        group.di_count,
                        group.do_count,
                        group.led_count,
                        group.ai_count,
                        group.ao_count
                    );
                    groups.push(group);
                }
                None => warn!("Group {} capability read at {} returned no data", id, address),
            },
            Err(e) => {
                let err = ExpioError::from(e);
                warn!(
                    "Group {} capability read at {} failed: {}",
                    id, address, err
                );
            }
        }
    }

    info!(
        "Discovered {}/{} groups on unit {}",
        groups.len(),
        group_count,
        unit_id
    );
    groups
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::transport::{BoardSimulator, TransportError};

    #[test]
    fn test_capability_word_split() {
        let group = Group::from_capability(2, 0b0000_0100_0000_0010);
        assert_eq!(group.di_count, 2);
        assert_eq!(group.do_count, 4);
        assert_eq!(group.led_count, 0);
        assert_eq!(group.ai_count, 0);
        assert_eq!(group.serial_ports, 0);
    }

    #[test]
    fn test_main_board_fixed_capabilities() {
        let group = Group::from_capability(1, 0x0808);
        assert!(group.is_main());
        assert_eq!(group.capability(IoKind::Led), 4);
        assert_eq!(group.capability(IoKind::AnalogInput), 1);
        assert_eq!(group.capability(IoKind::AnalogOutput), 1);
        assert_eq!(group.capability(IoKind::DigitalOutput), 8);
    }

    #[tokio::test]
    async fn test_discovers_each_group() {
        let map = RegisterMap::default();
        let sim = BoardSimulator::with_layout(&map, &[(4, 2), (8, 8)], 4);

        let groups = discover_groups(&sim, 1, 2, &map).await;
        assert_eq!(groups.len(), 2);
        assert_eq!((groups[0].di_count, groups[0].do_count), (4, 2));
        assert_eq!(groups[1].id, 2);
        assert_eq!(groups[1].led_count, 0);
        assert_eq!(sim.reads(), vec![(1001, 2), (1101, 2)]);
    }

    #[tokio::test]
    async fn test_failed_group_is_left_out() {
        let map = RegisterMap::default();
        let sim = BoardSimulator::with_layout(&map, &[(4, 4), (8, 8), (2, 2)], 4);
        sim.fail_reads_at(1101, TransportError::Exception(0x0B));

        let groups = discover_groups(&sim, 1, 3, &map).await;
        let ids: Vec<u8> = groups.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
