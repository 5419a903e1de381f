//! Periodic loop supervision.
//!
//! Four independent timer loops drive the engine: the fast funding poll, the
//! slow universe rescan, the risk sweep, and a cache rebuild aligned to
//! wall-clock hour boundaries. Each loop catches task errors and survives
//! panics; a crashing loop restarts after backoff instead of dying silently.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::config::{secs_until_next_hour, Config};
use crate::engine::ReconcileEngine;
use crate::logging::{epoch_secs, json_log, log, obj, v_num, v_str, Level};

#[derive(Debug, Clone, Copy)]
pub enum Cadence {
    Every(Duration),
    /// Re-aligned to the wall clock each iteration, so restarts land back on
    /// the hour boundary naturally.
    TopOfHour,
}

impl Cadence {
    fn next_delay(&self) -> Duration {
        match self {
            Cadence::Every(d) => *d,
            Cadence::TopOfHour => Duration::from_secs(secs_until_next_hour(epoch_secs())),
        }
    }
}

const MAX_BACKOFF_SECS: u64 = 300;

/// Run `task` on `cadence` until shutdown. The task body runs inside its own
/// spawned task so a panic is contained and reported as a restart, not a
/// dead loop.
pub async fn run_supervised<F, Fut>(
    name: &'static str,
    cadence: Cadence,
    run_immediately: bool,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut backoff_secs = 1u64;
    let mut first = true;
    loop {
        if *shutdown.borrow() {
            break;
        }
        if !(first && run_immediately) {
            let delay = cadence.next_delay();
            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
        }
        first = false;

        match tokio::spawn(task()).await {
            Ok(Ok(())) => {
                backoff_secs = 1;
            }
            Ok(Err(err)) => {
                log(
                    Level::Error,
                    "scheduler",
                    obj(&[
                        ("loop", v_str(name)),
                        ("event", v_str("task_error")),
                        ("error", v_str(&err.to_string())),
                        ("backoff_secs", v_num(backoff_secs as f64)),
                    ]),
                );
                sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
            Err(join_err) => {
                log(
                    Level::Error,
                    "scheduler",
                    obj(&[
                        ("loop", v_str(name)),
                        ("event", v_str("task_panicked")),
                        ("error", v_str(&join_err.to_string())),
                        ("backoff_secs", v_num(backoff_secs as f64)),
                    ]),
                );
                sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        }
    }
    json_log("scheduler", obj(&[("loop", v_str(name)), ("event", v_str("stopped"))]));
}

pub struct Scheduler {
    engine: Arc<ReconcileEngine>,
    cfg: Config,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(cfg: Config, engine: Arc<ReconcileEngine>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self { engine, cfg, shutdown_tx, shutdown_rx, handles: Vec::new() }
    }

    pub fn engine(&self) -> Arc<ReconcileEngine> {
        self.engine.clone()
    }

    /// Spawn all loops. Idempotent start is not supported; call once.
    pub fn start(&mut self) {
        json_log(
            "scheduler",
            obj(&[
                ("event", v_str("start")),
                ("poll_secs", v_num(self.cfg.poll_secs as f64)),
                ("sweep_secs", v_num(self.cfg.sweep_secs as f64)),
                ("rescan_secs", v_num(self.cfg.rescan_secs as f64)),
            ]),
        );

        let engine = self.engine.clone();
        self.handles.push(tokio::spawn(run_supervised(
            "funding_poll",
            Cadence::Every(Duration::from_secs(self.cfg.poll_secs)),
            true,
            self.shutdown_rx.clone(),
            move || {
                let engine = engine.clone();
                async move { engine.tick().await.map(|_| ()) }
            },
        )));

        let engine = self.engine.clone();
        self.handles.push(tokio::spawn(run_supervised(
            "risk_sweep",
            Cadence::Every(Duration::from_secs(self.cfg.sweep_secs)),
            false,
            self.shutdown_rx.clone(),
            move || {
                let engine = engine.clone();
                async move { engine.risk_sweep().await.map(|_| ()) }
            },
        )));

        let engine = self.engine.clone();
        self.handles.push(tokio::spawn(run_supervised(
            "universe_rescan",
            Cadence::Every(Duration::from_secs(self.cfg.rescan_secs)),
            false,
            self.shutdown_rx.clone(),
            move || {
                let engine = engine.clone();
                async move { engine.rescan_universe().await }
            },
        )));

        let engine = self.engine.clone();
        self.handles.push(tokio::spawn(run_supervised(
            "cache_rebuild",
            Cadence::TopOfHour,
            false,
            self.shutdown_rx.clone(),
            move || {
                let engine = engine.clone();
                async move { engine.rebuild_cache().await }
            },
        )));
    }

    /// Signal every loop and wait for them to wind down.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        json_log("scheduler", obj(&[("event", v_str("stop"))]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_supervised_loop_runs_and_stops() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);

        let c = counter.clone();
        let handle = tokio::spawn(run_supervised(
            "test_loop",
            Cadence::Every(Duration::from_millis(5)),
            true,
            rx,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        sleep(Duration::from_millis(40)).await;
        let _ = tx.send(true);
        handle.await.unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_supervised_loop_survives_errors() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);

        let c = counter.clone();
        let handle = tokio::spawn(run_supervised(
            "flaky_loop",
            Cadence::Every(Duration::from_millis(5)),
            true,
            rx,
            move || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        anyhow::bail!("transient")
                    }
                    Ok(())
                }
            },
        ));

        // First run fails, backoff is 1s; the loop must come back after it.
        sleep(Duration::from_millis(1200)).await;
        let _ = tx.send(true);
        handle.await.unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_supervised_loop_survives_panic() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);

        let c = counter.clone();
        let handle = tokio::spawn(run_supervised(
            "panicky_loop",
            Cadence::Every(Duration::from_millis(5)),
            true,
            rx,
            move || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        panic!("boom");
                    }
                    Ok(())
                }
            },
        ));

        sleep(Duration::from_millis(1200)).await;
        let _ = tx.send(true);
        handle.await.unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 2, "loop died after panic");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_interrupts_long_sleep() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);

        let c = counter.clone();
        let handle = tokio::spawn(run_supervised(
            "sleepy_loop",
            Cadence::Every(Duration::from_secs(3600)),
            false,
            rx,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        sleep(Duration::from_millis(20)).await;
        let _ = tx.send(true);
        // Must return promptly despite the hour-long cadence.
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("shutdown did not interrupt sleep")
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
