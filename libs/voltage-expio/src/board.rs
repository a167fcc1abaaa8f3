//! Board facade
//!
//! Ties discovery, polling, the state store and write verification to one
//! Modbus unit.
//!
//! ```text
//! Board::connect ──> discover_groups ──> Board (immutable group list)
//!     start()      ──> Poller loops ──> StateStore ──> ChangeNotifier ──> subscribe()
//!     set()        ──> WriteVerifier (spawned, checks StateStore)
//!     get_state()  ──> StateStore
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::address::IoId;
use crate::calibration::AnalogCalibrator;
use crate::config::BoardConfig;
use crate::discovery::{discover_groups, Group};
use crate::error::{ExpioError, Result};
use crate::poll::{Poller, TickReport};
use crate::store::{ChangeEvent, ChangeNotifier, IoValue, StateStore};
use crate::transport::RegisterTransport;
use crate::writer::{WriteOutcome, WriteVerifier};

/// One expansion board on a Modbus link
pub struct Board {
    config: BoardConfig,
    groups: Arc<[Group]>,
    store: Arc<StateStore>,
    poller: Arc<Poller>,
    verifier: Arc<WriteVerifier>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Board {
    /// Validate the configuration, discover the groups and build the board
    ///
    /// Polling does not start until [`Board::start`].
    pub async fn connect(
        config: BoardConfig,
        transport: Arc<dyn RegisterTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            "Discovering board '{}' (unit {}, {} groups)",
            config.name, config.unit_id, config.group_count
        );

        let groups = discover_groups(
            transport.as_ref(),
            config.unit_id,
            config.group_count,
            &config.registers,
        )
        .await;
        Ok(Self::with_groups(config, transport, groups))
    }

    /// Build a board from an already known group list
    pub fn with_groups(
        config: BoardConfig,
        transport: Arc<dyn RegisterTransport>,
        groups: Vec<Group>,
    ) -> Arc<Self> {
        let groups: Arc<[Group]> = groups.into();
        let store = Arc::new(StateStore::new(ChangeNotifier::new(config.event_capacity)));
        let calibrator = Arc::new(AnalogCalibrator::new(
            Arc::clone(&transport),
            config.unit_id,
            config.calibration.clone(),
        ));
        let poller = Arc::new(Poller::new(
            Arc::clone(&transport),
            config.unit_id,
            Arc::clone(&groups),
            config.registers.clone(),
            Arc::clone(&calibrator),
            Arc::clone(&store),
        ));
        let verifier = Arc::new(WriteVerifier::new(
            transport,
            config.unit_id,
            Arc::clone(&groups),
            config.registers.clone(),
            config.write_retry.clone(),
            calibrator,
            Arc::clone(&store),
        ));

        Arc::new(Self {
            config,
            groups,
            store,
            poller,
            verifier,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn unit_id(&self) -> u8 {
        self.config.unit_id
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Receive every state change observed by the poller
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.store.notifier().subscribe()
    }

    /// Start the poll loops (no-op when polling is disabled or already running)
    pub fn start(&self) {
        if !self.config.polling.enabled {
            info!("Polling disabled for board '{}'", self.config.name);
            return;
        }
        if self.cancel.is_cancelled() {
            debug!("Board '{}' already shut down", self.config.name);
            return;
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Board '{}' already polling", self.config.name);
            return;
        }
        tasks.extend(
            self.poller
                .spawn(&self.config.polling, self.cancel.child_token()),
        );
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tasks.lock().is_empty()
    }

    /// Stop polling and every pending write verification
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                debug!("Poll task ended abnormally: {}", e);
            }
        }
        info!("Board '{}' stopped", self.config.name);
    }

    /// Parse `id` and check that the poller has produced it
    pub fn validate(&self, id: &str) -> Result<IoId> {
        let parsed = IoId::parse(id)?;
        if !self.store.contains(&parsed) {
            return Err(ExpioError::unknown_address(id));
        }
        Ok(parsed)
    }

    /// Last polled value of a point
    pub fn get_state(&self, id: &str) -> Result<IoValue> {
        let id = self.validate(id)?;
        self.store
            .get(&id)
            .ok_or_else(|| ExpioError::unknown_address(id.to_string()))
    }

    /// Last polled pulse count of a digital input
    pub fn get_count(&self, id: &str) -> Result<u32> {
        let id = self.validate(id)?;
        self.store
            .counter(&id)
            .ok_or_else(|| ExpioError::unknown_address(id.to_string()))
    }

    /// Request an output change
    ///
    /// Returns once the id is validated; the write and its verification run
    /// in the background. Inputs are accepted and ignored.
    pub fn set(&self, id: &str, value: impl Into<IoValue>) -> Result<()> {
        let id = self.validate(id)?;
        let value = value.into();
        if id.kind.is_read_only() {
            info!("Ignoring set of read-only {} to {}", id, value);
            return Ok(());
        }

        let verifier = Arc::clone(&self.verifier);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            verifier.run(id, value, cancel).await;
        });
        Ok(())
    }

    /// Like [`Board::set`], but waits for the verification to finish
    pub async fn write_verified(
        &self,
        id: &str,
        value: impl Into<IoValue>,
    ) -> Result<WriteOutcome> {
        let id = self.validate(id)?;
        Ok(self
            .verifier
            .run(id, value.into(), self.cancel.child_token())
            .await)
    }

    /// Run one state refresh now
    pub async fn refresh_state(&self) -> TickReport {
        self.poller.refresh_state().await
    }

    /// Run one counter refresh now
    pub async fn refresh_counters(&self) -> TickReport {
        self.poller.refresh_counters().await
    }

    /// Every id produced so far, in canonical order
    pub fn io_ids(&self) -> Vec<IoId> {
        self.store.ids()
    }
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("name", &self.config.name)
            .field("unit_id", &self.config.unit_id)
            .field("groups", &self.groups)
            .finish()
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::RegisterMap;
    use crate::transport::BoardSimulator;

    async fn polled_board() -> (Arc<Board>, Arc<BoardSimulator>) {
        let sim = Arc::new(BoardSimulator::with_layout(
            &RegisterMap::default(),
            &[(4, 4)],
            4,
        ));
        let board = Board::connect(BoardConfig::default(), sim.clone())
            .await
            .unwrap();
        board.refresh_state().await;
        (board, sim)
    }

    #[tokio::test]
    async fn test_validate_requires_polled_id() {
        let (board, _) = polled_board().await;
        assert_eq!(board.validate("do1.4").unwrap(), IoId::do_(1, 4));
        assert!(matches!(
            board.validate("DO1.5"),
            Err(ExpioError::UnknownAddress(_))
        ));
        assert!(matches!(
            board.validate("garbage"),
            Err(ExpioError::UnknownAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_before_first_poll() {
        let sim = Arc::new(BoardSimulator::with_layout(
            &RegisterMap::default(),
            &[(2, 2)],
            4,
        ));
        let board = Board::connect(BoardConfig::default(), sim).await.unwrap();
        assert!(board.get_state("DI1.1").is_err());
        assert!(board.set("DO1.1", true).is_err());
    }

    #[tokio::test]
    async fn test_get_count_without_counter_entry() {
        let (board, _) = polled_board().await;
        assert!(matches!(
            board.get_count("DI1.1"),
            Err(ExpioError::UnknownAddress(_))
        ));
        board.refresh_counters().await;
        assert_eq!(board.get_count("DI1.1").unwrap(), 0);
        assert!(board.get_count("DO1.1").is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = BoardConfig {
            group_count: 0,
            ..Default::default()
        };
        let err = Board::connect(config, Arc::new(BoardSimulator::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExpioError::Config(_)));
    }

    #[tokio::test]
    async fn test_start_without_polling_is_noop() {
        let sim = Arc::new(BoardSimulator::new());
        let mut config = BoardConfig::default();
        config.polling.enabled = false;
        let board = Board::with_groups(config, sim, vec![Group::from_capability(1, 0x0101)]);

        board.start();
        assert!(!board.is_running());
        board.shutdown().await;
    }
}
