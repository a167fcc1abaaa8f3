//! Verified output writes
//!
//! A write is confirmed only by the value the poller later observes. Each
//! attempt issues one write, waits `base_delay * (retry + 1)` and compares the
//! stored value with the requested one. After `max_retries` unconfirmed retries
//! the chain stops and the failure is only logged.

use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::{IoId, IoKind};
use crate::calibration::AnalogCalibrator;
use crate::config::{RegisterMap, WriteRetryConfig};
use crate::discovery::Group;
use crate::error::{ExpioError, Result};
use crate::store::{IoValue, StateStore};
use crate::transport::RegisterTransport;

/// Modbus destination of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Coil(u16),
    Register(u16),
}

/// Encoded value ready for the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePayload {
    Coil(bool),
    Register(u16),
}

/// How a verified write ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Observed value matched after `attempts` writes
    Verified { attempts: u32 },
    /// Retries used up without a match
    Exhausted { attempts: u32 },
    /// Read-only point; nothing was written
    Rejected,
    /// Board shut down while the chain was running
    Cancelled,
}

/// Issues output writes and re-checks them against polled state
pub struct WriteVerifier {
    transport: Arc<dyn RegisterTransport>,
    unit_id: u8,
    groups: Arc<[Group]>,
    map: RegisterMap,
    retry: WriteRetryConfig,
    calibrator: Arc<AnalogCalibrator>,
    store: Arc<StateStore>,
}

impl WriteVerifier {
    pub fn new(
        transport: Arc<dyn RegisterTransport>,
        unit_id: u8,
        groups: Arc<[Group]>,
        map: RegisterMap,
        retry: WriteRetryConfig,
        calibrator: Arc<AnalogCalibrator>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            transport,
            unit_id,
            groups,
            map,
            retry,
            calibrator,
            store,
        }
    }

    fn group(&self, id: u8) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Coil or register address of a writable point
    pub fn resolve(&self, id: &IoId) -> Result<WriteTarget> {
        let unknown = || ExpioError::unknown_address(id.to_string());
        let group = self.group(id.group).ok_or_else(unknown)?;
        if id.index == 0 || id.index > group.capability(id.kind) {
            return Err(unknown());
        }

        match id.kind {
            IoKind::DigitalOutput => Ok(WriteTarget::Coil(self.map.output_coil(id.group, id.index))),
            IoKind::Led => {
                // LED coils follow the main board's DI and DO coils
                let main = self.group(1).ok_or_else(unknown)?;
                let base = u16::from(main.do_count) + u16::from(main.di_count);
                Ok(WriteTarget::Coil(base + u16::from(id.index - 1)))
            },
            IoKind::AnalogOutput => Ok(WriteTarget::Register(self.map.analog_register)),
            IoKind::DigitalInput | IoKind::AnalogInput => Err(unknown()),
        }
    }

    /// Requested value as the poller will report it
    fn desired(id: &IoId, value: IoValue) -> IoValue {
        if id.kind.is_analog() {
            IoValue::Analog(value.as_f64()).normalized()
        } else {
            IoValue::Digital(value.as_bool())
        }
    }

    async fn encode(&self, id: &IoId, target: WriteTarget, desired: IoValue) -> WritePayload {
        match target {
            WriteTarget::Coil(_) => WritePayload::Coil(desired.as_bool()),
            WriteTarget::Register(_) => {
                WritePayload::Register(self.calibrator.encode_output(id, desired.as_f64()).await)
            },
        }
    }

    async fn write_once(&self, target: WriteTarget, payload: WritePayload) -> Result<()> {
        match (target, payload) {
            (WriteTarget::Coil(address), WritePayload::Coil(value)) => self
                .transport
                .write_coil(self.unit_id, address, value)
                .await
                .map_err(ExpioError::from),
            (WriteTarget::Register(address), WritePayload::Register(value)) => self
                .transport
                .write_register(self.unit_id, address, value)
                .await
                .map_err(ExpioError::from),
            (target, payload) => Err(ExpioError::transport(format!(
                "Payload {:?} does not fit target {:?}",
                payload, target
            ))),
        }
    }

    fn observed(&self, id: &IoId, desired: IoValue) -> bool {
        self.store
            .get(id)
            .is_some_and(|current| current.matches(desired))
    }

    /// Write `value` to `id` and retry until the poller confirms it
    pub async fn run(&self, id: IoId, value: IoValue, cancel: CancellationToken) -> WriteOutcome {
        if id.kind.is_read_only() {
            info!("{} is read-only, write of {} ignored", id, value);
            return WriteOutcome::Rejected;
        }
        let target = match self.resolve(&id) {
            Ok(target) => target,
            Err(e) => {
                warn!("Write to {} not possible: {}", id, e);
                return WriteOutcome::Rejected;
            },
        };

        let desired = Self::desired(&id, value);
        let payload = self.encode(&id, target, desired).await;
        debug!("Writing {} = {} via {:?} ({:?})", id, desired, target, payload);

        let mut retry: u32 = 0;
        loop {
            if let Err(e) = self.write_once(target, payload).await {
                warn!("Write {} = {} (attempt {}) failed: {}", id, desired, retry + 1, e);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Verification of {} cancelled", id);
                    return WriteOutcome::Cancelled;
                },
                _ = sleep(self.retry.delay(retry)) => {},
            }

            let attempts = retry + 1;
            if self.observed(&id, desired) {
                debug!("{} = {} verified after {} writes", id, desired, attempts);
                return WriteOutcome::Verified { attempts };
            }
            if retry >= self.retry.max_retries {
                let err = ExpioError::WriteVerificationExhausted {
                    id: id.to_string(),
                    attempts,
                };
                warn!("{}", err);
                return WriteOutcome::Exhausted { attempts };
            }
            retry += 1;
        }
    }
}

impl std::fmt::Debug for WriteVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteVerifier")
            .field("unit_id", &self.unit_id)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::CalibrationMap;
    use crate::store::ChangeNotifier;
    use crate::transport::simulator::WriteRecord;
    use crate::transport::{BoardSimulator, TransportError};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn verifier(sim: &Arc<BoardSimulator>) -> (WriteVerifier, Arc<StateStore>) {
        let transport: Arc<dyn RegisterTransport> = sim.clone();
        let store = Arc::new(StateStore::new(ChangeNotifier::new(16)));
        let calibrator = Arc::new(AnalogCalibrator::new(
            Arc::clone(&transport),
            1,
            CalibrationMap::default(),
        ));
        let groups: Arc<[Group]> = vec![
            Group::from_capability(1, 0x0402),
            Group::from_capability(2, 0x0808),
        ]
        .into();
        let verifier = WriteVerifier::new(
            transport,
            1,
            groups,
            RegisterMap::default(),
            WriteRetryConfig::default(),
            calibrator,
            Arc::clone(&store),
        );
        (verifier, store)
    }

    #[test]
    fn test_resolve_addresses() {
        let sim = Arc::new(BoardSimulator::new());
        let (verifier, _) = verifier(&sim);

        assert_eq!(verifier.resolve(&IoId::do_(1, 1)), Ok(WriteTarget::Coil(0)));
        assert_eq!(verifier.resolve(&IoId::do_(2, 3)), Ok(WriteTarget::Coil(102)));
        // 4 DO + 2 DI on the main board
        assert_eq!(verifier.resolve(&IoId::led(1, 1)), Ok(WriteTarget::Coil(6)));
        assert_eq!(verifier.resolve(&IoId::led(1, 4)), Ok(WriteTarget::Coil(9)));
        assert_eq!(verifier.resolve(&IoId::ao(1, 1)), Ok(WriteTarget::Register(2)));
    }

    #[test]
    fn test_resolve_rejects_out_of_range() {
        let sim = Arc::new(BoardSimulator::new());
        let (verifier, _) = verifier(&sim);

        assert!(verifier.resolve(&IoId::do_(1, 5)).is_err());
        assert!(verifier.resolve(&IoId::do_(3, 1)).is_err());
        assert!(verifier.resolve(&IoId::led(2, 1)).is_err());
        assert!(verifier.resolve(&IoId::di(1, 1)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_points_are_rejected() {
        let sim = Arc::new(BoardSimulator::new());
        let (verifier, store) = verifier(&sim);

        let outcome = verifier
            .run(IoId::ai(1, 1), 3.0.into(), CancellationToken::new())
            .await;
        assert_eq!(outcome, WriteOutcome::Rejected);
        assert_eq!(sim.write_count(), 0);
        assert!(!store.contains(&IoId::ai(1, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verified_on_first_check() {
        let sim = Arc::new(BoardSimulator::new());
        let (verifier, store) = verifier(&sim);
        store.update(IoId::do_(1, 2), true.into());

        let outcome = verifier
            .run(IoId::do_(1, 2), true.into(), CancellationToken::new())
            .await;
        assert_eq!(outcome, WriteOutcome::Verified { attempts: 1 });
        assert_eq!(sim.writes(), vec![WriteRecord::Coil { address: 1, value: true }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_six_writes() {
        let sim = Arc::new(BoardSimulator::new());
        let (verifier, store) = verifier(&sim);
        store.update(IoId::do_(1, 1), false.into());

        let started = tokio::time::Instant::now();
        let outcome = verifier
            .run(IoId::do_(1, 1), true.into(), CancellationToken::new())
            .await;
        assert_eq!(outcome, WriteOutcome::Exhausted { attempts: 6 });
        assert_eq!(sim.write_count(), 6);
        // 100 + 200 + ... + 600 ms
        assert!(started.elapsed() >= Duration::from_millis(2100));
        assert!(started.elapsed() < Duration::from_millis(2200));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_exhaustion_is_logged_not_raised() {
        let sim = Arc::new(BoardSimulator::new());
        sim.drop_all_writes(true);
        let (verifier, _) = verifier(&sim);

        verifier
            .run(IoId::do_(2, 1), true.into(), CancellationToken::new())
            .await;
        assert!(logs_contain(
            "Write verification exhausted for DO2.1 after 6 attempts"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_writes_are_retried() {
        let sim = Arc::new(BoardSimulator::new());
        sim.fail_writes(Some(TransportError::Exception(0x04)));
        let (verifier, _) = verifier(&sim);

        let outcome = verifier
            .run(IoId::led(1, 2), true.into(), CancellationToken::new())
            .await;
        assert_eq!(outcome, WriteOutcome::Exhausted { attempts: 6 });
        assert_eq!(sim.write_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_chain() {
        let sim = Arc::new(BoardSimulator::new());
        let (verifier, _) = verifier(&sim);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = verifier.run(IoId::do_(1, 1), true.into(), cancel).await;
        assert_eq!(outcome, WriteOutcome::Cancelled);
        assert_eq!(sim.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analog_output_uses_placeholder_without_calibration() {
        let sim = Arc::new(BoardSimulator::new());
        let (verifier, store) = verifier(&sim);
        store.update(IoId::ao(1, 1), 2.5.into());

        let outcome = verifier
            .run(IoId::ao(1, 1), 2.5.into(), CancellationToken::new())
            .await;
        assert_eq!(outcome, WriteOutcome::Verified { attempts: 1 });
        assert_eq!(
            sim.writes(),
            vec![WriteRecord::Register { address: 2, value: 1000 }]
        );
    }
}
