// libs/telemedicine-cell/src/services/sweeper.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::services::consultation::ConsultationService;

/// Background loop that cancels consultations stuck in an empty waiting room
pub struct WaitingRoomSweeper {
    consultations: Arc<ConsultationService>,
    period: Duration,
}

/// Stops the sweep loop when signalled or dropped
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Waiting-room sweeper task failed: {}", e);
        }
    }
}

impl WaitingRoomSweeper {
    pub fn new(consultations: Arc<ConsultationService>, period: Duration) -> Self {
        Self {
            consultations,
            period: period.max(Duration::from_secs(1)),
        }
    }

    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!("Waiting-room sweeper running every {:?}", self.period);
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_once().await,
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Waiting-room sweeper stopped");
        });

        SweeperHandle { shutdown, task }
    }

    pub async fn run_once(&self) {
        match self.consultations.sweep_idle_waiting().await {
            Ok(cancelled) if !cancelled.is_empty() => {
                info!("Sweep cancelled {} idle consultations", cancelled.len());
            }
            Ok(_) => {}
            Err(e) => error!("Waiting-room sweep failed: {}", e),
        }
    }
}
