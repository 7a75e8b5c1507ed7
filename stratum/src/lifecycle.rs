//! Process lifecycle phases.
//!
//! Subsystems are gated behind phase barriers: storage provisioning happens
//! after the database is reachable, hook and scheduler registration after all
//! components are registered.

use crate::error::{Result, StratumError};
use tokio::sync::watch;

/// Boot phases, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    DbReady,
    ComponentsReady,
    AppReady,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::DbReady => "db-ready",
            Phase::ComponentsReady => "components-ready",
            Phase::AppReady => "app-ready",
        }
    }
}

/// Owned coordinator passed to each subsystem constructor.
///
/// Transitions are monotonic; skipping a phase or moving backwards is an
/// error. Waiters observe transitions through a watch channel.
pub struct Lifecycle {
    tx: watch::Sender<Phase>,
    rx: watch::Receiver<Phase>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(Phase::Init);
        Self { tx, rx }
    }

    pub fn current(&self) -> Phase {
        *self.rx.borrow()
    }

    /// Advances to the next phase. `to` must be the immediate successor of
    /// the current phase.
    pub fn advance(&self, to: Phase) -> Result<()> {
        let current = self.current();
        let expected = match current {
            Phase::Init => Phase::DbReady,
            Phase::DbReady => Phase::ComponentsReady,
            Phase::ComponentsReady => Phase::AppReady,
            Phase::AppReady => {
                return Err(StratumError::Lifecycle(
                    "already at app-ready, no further phase".into(),
                ))
            }
        };
        if to != expected {
            return Err(StratumError::Lifecycle(format!(
                "cannot advance from {} to {}",
                current.name(),
                to.name()
            )));
        }
        log::info!("lifecycle: {} -> {}", current.name(), to.name());
        let _ = self.tx.send(to);
        Ok(())
    }

    /// Resolves once the given phase (or a later one) has been reached.
    pub async fn wait_for(&self, phase: Phase) {
        let mut rx = self.rx.clone();
        while *rx.borrow() < phase {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Returns an error unless the given phase has been reached.
    pub fn require(&self, phase: Phase) -> Result<()> {
        if self.current() < phase {
            return Err(StratumError::Lifecycle(format!(
                "requires phase {} but process is at {}",
                phase.name(),
                self.current().name()
            )));
        }
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
