//! Periodic board polling
//!
//! Two independent loops share one [`Poller`]:
//!
//! ```text
//! state loop   (interval)        DI/DO words per group, LED word + analog pair on group 1
//! counter loop (interval * 5)    pulse counter blocks per group
//! ```
//!
//! A failed read only skips its own register block for the current tick; the
//! next tick is the retry.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::{IoId, IoKind};
use crate::calibration::AnalogCalibrator;
use crate::config::{PollingConfig, RegisterMap};
use crate::decoder::{combine_counter, decode_bits};
use crate::discovery::Group;
use crate::error::{ExpioError, Result};
use crate::store::{IoValue, StateStore};
use crate::transport::RegisterTransport;

/// Outcome of one refresh pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Register blocks read and merged
    pub blocks: usize,
    /// Register blocks skipped because of a failure
    pub failures: usize,
}

impl TickReport {
    fn merge(mut self, other: TickReport) -> Self {
        self.blocks += other.blocks;
        self.failures += other.failures;
        self
    }

    fn record<T>(&mut self, result: &Result<T>) {
        match result {
            Ok(_) => self.blocks += 1,
            Err(_) => self.failures += 1,
        }
    }
}

/// Reads board registers and merges them into the state store
pub struct Poller {
    transport: Arc<dyn RegisterTransport>,
    unit_id: u8,
    groups: Arc<[Group]>,
    map: RegisterMap,
    calibrator: Arc<AnalogCalibrator>,
    store: Arc<StateStore>,
}

impl Poller {
    pub fn new(
        transport: Arc<dyn RegisterTransport>,
        unit_id: u8,
        groups: Arc<[Group]>,
        map: RegisterMap,
        calibrator: Arc<AnalogCalibrator>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            transport,
            unit_id,
            groups,
            map,
            calibrator,
            store,
        }
    }

    async fn read(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        let words = self
            .transport
            .read_holding_registers(self.unit_id, address, count)
            .await?;
        if words.len() < usize::from(count) {
            return Err(ExpioError::transport(format!(
                "Short read at {}: expected {} words, got {}",
                address,
                count,
                words.len()
            )));
        }
        Ok(words)
    }

    /// One state refresh over all groups
    pub async fn refresh_state(&self) -> TickReport {
        let reports = join_all(self.groups.iter().map(|group| self.refresh_group(group))).await;
        let report = reports
            .into_iter()
            .fold(TickReport::default(), TickReport::merge);
        debug!(
            "State refresh on unit {}: {} blocks, {} failed",
            self.unit_id, report.blocks, report.failures
        );
        report
    }

    async fn refresh_group(&self, group: &Group) -> TickReport {
        let mut report = TickReport::default();

        let digital = self.read(self.map.group_base(group.id), 2).await;
        match &digital {
            Ok(words) => {
                self.merge_bits(group.id, IoKind::DigitalInput, words[0], group.di_count);
                self.merge_bits(group.id, IoKind::DigitalOutput, words[1], group.do_count);
            },
            Err(e) => warn!("Group {} DI/DO read failed: {}", group.id, e),
        }
        report.record(&digital);

        if !group.is_main() {
            return report;
        }

        let leds = self.read(self.map.led_register, 1).await;
        match &leds {
            Ok(words) => self.merge_bits(group.id, IoKind::Led, words[0], group.led_count),
            Err(e) => warn!("Group {} LED read failed: {}", group.id, e),
        }
        report.record(&leds);

        let analog = self.read(self.map.analog_register, 2).await;
        match &analog {
            Ok(words) => {
                let channels = [
                    (IoId::ao(group.id, 1), words[0], group.ao_count),
                    (IoId::ai(group.id, 1), words[1], group.ai_count),
                ];
                for (id, raw, count) in channels {
                    if count == 0 {
                        continue;
                    }
                    match self.calibrator.convert(&id, raw).await {
                        Ok(value) => {
                            self.store.update(id, IoValue::Analog(value));
                        },
                        Err(e) => warn!("Conversion of {} (raw {}) skipped: {}", id, raw, e),
                    }
                }
            },
            Err(e) => warn!("Group {} analog read failed: {}", group.id, e),
        }
        report.record(&analog);

        report
    }

    fn merge_bits(&self, group: u8, kind: IoKind, word: u16, count: u8) {
        for (position, bit) in decode_bits(word, count).into_iter().enumerate() {
            let id = IoId::new(kind, group, position as u8 + 1);
            if let Some(event) = self.store.update(id, IoValue::Digital(bit)) {
                debug!("{} changed {} -> {}", id, event.previous, event.value);
            }
        }
    }

    /// One counter refresh over all groups
    pub async fn refresh_counters(&self) -> TickReport {
        let reports = join_all(
            self.groups
                .iter()
                .filter(|group| group.di_count > 0)
                .map(|group| self.refresh_group_counters(group)),
        )
        .await;
        reports
            .into_iter()
            .fold(TickReport::default(), TickReport::merge)
    }

    async fn refresh_group_counters(&self, group: &Group) -> TickReport {
        let mut report = TickReport::default();
        let address = self.map.counter_base(group.id);
        let result = self.read(address, u16::from(group.di_count) * 2).await;
        match &result {
            Ok(words) => {
                for (position, pair) in words.chunks_exact(2).enumerate() {
                    let id = IoId::di(group.id, position as u8 + 1);
                    self.store.update_counter(id, combine_counter(pair[0], pair[1]));
                }
            },
            Err(e) => warn!(
                "Group {} counter read at {} failed: {}",
                group.id, address, e
            ),
        }
        report.record(&result);
        report
    }

    /// Start the state and counter loops; both stop when `cancel` fires
    pub fn spawn(
        self: &Arc<Self>,
        config: &PollingConfig,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        info!(
            "Polling unit {} every {}ms (counters every {}ms)",
            self.unit_id,
            config.interval().as_millis(),
            config.counter_interval().as_millis()
        );

        let state_poller = Arc::clone(self);
        let state_task = spawn_loop(config.interval(), cancel.clone(), move || {
            let poller = Arc::clone(&state_poller);
            async move {
                poller.refresh_state().await;
            }
        });

        let counter_poller = Arc::clone(self);
        let counter_task = spawn_loop(config.counter_interval(), cancel, move || {
            let poller = Arc::clone(&counter_poller);
            async move {
                poller.refresh_counters().await;
            }
        });

        vec![state_task, counter_task]
    }
}

fn spawn_loop<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick() => {},
                    }
                },
            }
        }
        debug!("Poll loop ({}ms) stopped", period.as_millis());
    })
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("unit_id", &self.unit_id)
            .field("groups", &self.groups)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::CalibrationMap;
    use crate::store::ChangeNotifier;
    use crate::transport::{BoardSimulator, TransportError};

    fn poller(sim: &Arc<BoardSimulator>, groups: Vec<Group>) -> (Poller, Arc<StateStore>) {
        let transport: Arc<dyn RegisterTransport> = sim.clone();
        let store = Arc::new(StateStore::new(ChangeNotifier::new(16)));
        let calibrator = Arc::new(AnalogCalibrator::new(
            Arc::clone(&transport),
            1,
            CalibrationMap::default(),
        ));
        let poller = Poller::new(
            transport,
            1,
            groups.into(),
            RegisterMap::default(),
            calibrator,
            Arc::clone(&store),
        );
        (poller, store)
    }

    #[tokio::test]
    async fn test_state_refresh_decodes_digital_words() {
        let sim = Arc::new(BoardSimulator::new());
        sim.set_registers(0, &[0b0101, 0b10]);
        sim.set_register(100, 0b1);
        let groups = vec![
            Group::from_capability(1, 0x0204),
            Group::from_capability(2, 0x0001),
        ];
        let (poller, store) = poller(&sim, groups);

        let report = poller.refresh_state().await;
        assert_eq!(report.failures, 0);
        assert_eq!(store.get(&IoId::di(1, 1)), Some(IoValue::Digital(true)));
        assert_eq!(store.get(&IoId::di(1, 2)), Some(IoValue::Digital(false)));
        assert_eq!(store.get(&IoId::di(1, 3)), Some(IoValue::Digital(true)));
        assert_eq!(store.get(&IoId::do_(1, 2)), Some(IoValue::Digital(true)));
        assert_eq!(store.get(&IoId::di(2, 1)), Some(IoValue::Digital(true)));
        assert!(!store.contains(&IoId::do_(2, 1)));
        assert!(!store.contains(&IoId::di(1, 5)));
        assert!(store.contains(&IoId::led(1, 4)));
        assert!(!store.contains(&IoId::led(2, 1)));
    }

    #[tokio::test]
    async fn test_failed_block_is_skipped() {
        let sim = Arc::new(BoardSimulator::new());
        sim.set_register(20, 0b1111);
        sim.fail_reads_at(0, TransportError::Exception(0x02));
        let (poller, store) = poller(&sim, vec![Group::from_capability(1, 0x0404)]);

        let report = poller.refresh_state().await;
        assert_eq!(report.failures, 1);
        assert!(!store.contains(&IoId::di(1, 1)));
        assert_eq!(store.get(&IoId::led(1, 1)), Some(IoValue::Digital(true)));
    }

    #[tokio::test]
    async fn test_analog_channels_converted() {
        let sim = Arc::new(BoardSimulator::new());
        let cal = CalibrationMap::default();
        sim.set_registers(2, &[2048, 2048]);
        sim.set_register(cal.vref_register, 10000);
        sim.set_register(cal.vref_int_register, 10000);
        let (poller, store) = poller(&sim, vec![Group::from_capability(1, 0)]);

        poller.refresh_state().await;
        assert_eq!(store.get(&IoId::ao(1, 1)), Some(IoValue::Analog(4.95)));
        assert_eq!(store.get(&IoId::ai(1, 1)), Some(IoValue::Analog(4.95)));
    }

    #[tokio::test]
    async fn test_counters_sum_word_pairs() {
        let sim = Arc::new(BoardSimulator::new());
        sim.set_registers(8, &[100, 5, 7, 0]);
        sim.set_registers(102, &[1, 1]);
        let groups = vec![
            Group::from_capability(1, 0x0002),
            Group::from_capability(2, 0x0001),
        ];
        let (poller, store) = poller(&sim, groups);

        let report = poller.refresh_counters().await;
        assert_eq!(report, TickReport { blocks: 2, failures: 0 });
        assert_eq!(store.counter(&IoId::di(1, 1)), Some(105));
        assert_eq!(store.counter(&IoId::di(1, 2)), Some(7));
        assert_eq!(store.counter(&IoId::di(2, 1)), Some(2));
        assert!(sim.reads().contains(&(8, 4)));
        assert!(sim.reads().contains(&(102, 2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_stop_on_cancel() {
        let sim = Arc::new(BoardSimulator::new());
        let (poller, _store) = poller(&sim, vec![Group::from_capability(1, 0x0101)]);
        let poller = Arc::new(poller);
        let cancel = CancellationToken::new();
        let config = PollingConfig {
            interval_ms: 100,
            ..Default::default()
        };

        let handles = poller.spawn(&config, cancel.clone());
        tokio::time::sleep(Duration::from_millis(250)).await;
        let reads_before = sim.reads().len();
        assert!(reads_before > 0);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sim.reads().len(), reads_before);
    }
}
