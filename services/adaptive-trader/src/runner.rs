//! Trader Runner - one worker per periodic component

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::{Coordinator, CycleOutcome, DecisionOutcome};
use crate::portfolio::RiskBreach;
use crate::signals::SnapshotFeed;
use crate::state::StateManager;

/// How the run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Ctrl-c or an external shutdown request
    Interrupted,
    RiskBreach(RiskBreach),
}

/// Spawns and supervises the feed poller, decision worker, reconciliation
/// worker and reporter
pub struct TraderRunner {
    coordinator: Arc<Coordinator>,
    reporter: Arc<StateManager>,
    feeds: Option<Arc<SnapshotFeed>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    breach_tx: Arc<watch::Sender<Option<RiskBreach>>>,
}

impl TraderRunner {
    pub fn new(coordinator: Arc<Coordinator>, reporter: StateManager) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (breach_tx, _) = watch::channel(None);
        Self {
            coordinator,
            reporter: Arc::new(reporter),
            feeds: None,
            shutdown_tx: Arc::new(shutdown_tx),
            breach_tx: Arc::new(breach_tx),
        }
    }

    /// Poll a feed snapshot file alongside the other workers
    pub fn with_snapshot_feed(mut self, feeds: SnapshotFeed) -> Self {
        self.feeds = Some(Arc::new(feeds));
        self
    }

    /// Handle for requesting shutdown from outside the runner
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown_tx.clone()
    }

    /// Run until ctrl-c, an external shutdown request or a risk breach,
    /// then flush state
    pub async fn run(self) -> anyhow::Result<RunOutcome> {
        let config = self.coordinator.config().clone();
        info!(
            "Trader runner starting: {} on {} ({:?} mode)",
            config.symbol,
            self.coordinator.broker().name(),
            config.trading_mode
        );

        if let Err(e) = self.reporter.init().await {
            warn!("Reporter init error: {}", e);
        }

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(feeds) = &self.feeds {
            workers.push(tokio::spawn(feed_worker(
                feeds.clone(),
                config.feed_period(),
                self.shutdown_tx.subscribe(),
            )));
        }
        workers.push(tokio::spawn(decision_worker(
            self.coordinator.clone(),
            config.decision_period(),
            self.shutdown_tx.subscribe(),
        )));
        workers.push(tokio::spawn(reconciliation_worker(
            self.coordinator.clone(),
            config.cycle_period(),
            self.shutdown_tx.clone(),
            self.breach_tx.clone(),
        )));
        workers.push(tokio::spawn(report_worker(
            self.coordinator.clone(),
            self.reporter.clone(),
            config.report_period(),
            self.shutdown_tx.subscribe(),
        )));

        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                match res {
                    Ok(()) => info!("Ctrl-c received, shutting down"),
                    Err(e) => error!("Signal handler error: {}", e),
                }
                self.shutdown_tx.send_replace(true);
            }
            _ = stop_requested(&mut shutdown) => {
                debug!("Shutdown requested");
            }
        }

        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker join error: {}", e);
            }
        }

        self.coordinator.flush().await?;
        if let Err(e) = self.reporter.report(&self.coordinator).await {
            warn!("Final report error: {}", e);
        }

        let outcome = match self.breach_tx.borrow().clone() {
            Some(breach) => RunOutcome::RiskBreach(breach),
            None => RunOutcome::Interrupted,
        };
        info!(?outcome, "Trader runner stopped");
        Ok(outcome)
    }
}

/// Resolves once shutdown is set; the watch guard is dropped before returning
/// so worker futures stay `Send`
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone: nothing can ask us to keep running
        debug!("Shutdown channel closed");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    // A slow tick waits on the lock; late ticks are not replayed in a burst
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn feed_worker(feeds: Arc<SnapshotFeed>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match feeds.poll().await {
                    Ok(updated) => debug!(updated, "Feed snapshot polled"),
                    Err(e) => warn!("Feed poll error: {}", e),
                }
            }
            _ = stop_requested(&mut shutdown) => break,
        }
    }
    debug!("Feed worker stopped");
}

async fn decision_worker(
    coordinator: Arc<Coordinator>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match coordinator.decide_and_trade().await {
                    Ok(DecisionOutcome::Stopped) => break,
                    Ok(DecisionOutcome::Held) => {}
                    Ok(placed) => debug!(?placed, "Decision placed an order"),
                    Err(e) if e.is_skip() => info!("Decision skipped: {}", e),
                    Err(e) => error!("Decision error: {}", e),
                }
            }
            _ = stop_requested(&mut shutdown) => break,
        }
    }
    debug!("Decision worker stopped");
}

async fn reconciliation_worker(
    coordinator: Arc<Coordinator>,
    period: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    breach_tx: Arc<watch::Sender<Option<RiskBreach>>>,
) {
    let mut shutdown = shutdown_tx.subscribe();
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match coordinator.reconcile_cycle().await {
                    Ok(CycleOutcome::RiskBreach { breach }) => {
                        warn!(
                            kind = ?breach.kind,
                            equity = breach.equity,
                            "Risk limit breached, requesting shutdown"
                        );
                        breach_tx.send_replace(Some(breach));
                        shutdown_tx.send_replace(true);
                        break;
                    }
                    Ok(CycleOutcome::Stopped) => break,
                    Ok(outcome) => debug!(?outcome, "Reconciliation cycle complete"),
                    Err(e) => error!("Reconciliation cycle error: {}", e),
                }
            }
            _ = stop_requested(&mut shutdown) => break,
        }
    }
    debug!("Reconciliation worker stopped");
}

async fn report_worker(
    coordinator: Arc<Coordinator>,
    reporter: Arc<StateManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reporter.report(&coordinator).await {
                    warn!("Report error: {}", e);
                }
            }
            _ = stop_requested(&mut shutdown) => break,
        }
    }
    debug!("Report worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_requested_sees_earlier_shutdown() {
        let (tx, _) = watch::channel(false);
        tx.send_replace(true);

        // Spawned so the select arm future has to be Send
        let mut rx = tx.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = ticker(Duration::from_secs(3600));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_requested(&mut rx) => break,
                }
            }
        });
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_requested_returns_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), stop_requested(&mut rx))
            .await
            .expect("closed channel should end the wait");
    }
}
