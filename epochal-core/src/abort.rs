//! Correlated abort across distributed workers.
//!
//! Some phases of a run are executed by the primary worker (rank 0) alone
//! while every other worker waits for the result: saving checkpoints,
//! broadcasting loss weights, writing diagnostics. If the primary fails in
//! such a phase, the waiting workers would otherwise block forever on a
//! collective that never completes.
//!
//! [`AbortCoordinator::primary_phase`] turns that failure into an
//! [`AbortSignal`] returned identically on every rank. The signal carries the
//! primary's original error message and diagnostic context. It is never
//! retried: once a coordinator has seen an abort, every later phase returns
//! the same signal and the outer loop is expected to terminate the worker.
//!
//! [`WorkerGroup::local`] wires the ranks together with `tokio::sync::watch`
//! channels, which is the transport used for in-process multi-worker runs.

use std::convert::Infallible;
use std::error::Error as StdError;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Rank of the primary worker.
pub const PRIMARY_RANK: usize = 0;

/// Tagged failure raised on every worker once the primary's failure is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("Experiment aborted during '{phase}' (rank {origin_rank} failed): {message}")]
pub struct AbortSignal {
    /// Phase in which the failure happened.
    pub phase: String,
    /// Rank whose failure triggered the abort.
    pub origin_rank: usize,
    /// Human-readable message of the original failure.
    pub message: String,
    /// Diagnostic context of the original failure (debug form and cause chain).
    pub context: String,
}

impl AbortSignal {
    pub fn new(
        phase: impl Into<String>,
        origin_rank: usize,
        message: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            phase: phase.into(),
            origin_rank,
            message: message.into(),
            context: context.into(),
        }
    }

    /// Capture an error's message, debug form and source chain.
    pub fn from_error(phase: &str, origin_rank: usize, err: &(dyn StdError + 'static)) -> Self {
        let mut context = format!("{err:?}");
        let mut source = err.source();
        while let Some(cause) = source {
            context.push_str("\ncaused by: ");
            context.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::new(phase, origin_rank, err.to_string(), context)
    }

    fn lost(phase: &str, rank: usize) -> Self {
        Self::new(
            phase,
            rank,
            format!("worker {rank} disconnected before the phase completed"),
            "coordination channel closed",
        )
    }
}

#[derive(Debug, Clone)]
enum PhaseOutcome {
    Pending,
    Completed(serde_json::Value),
    Aborted(AbortSignal),
}

#[derive(Debug, Clone)]
struct PhaseState {
    generation: u64,
    outcome: PhaseOutcome,
}

enum Link {
    Primary {
        tx: watch::Sender<PhaseState>,
        acks: Vec<(usize, watch::Receiver<u64>)>,
    },
    Follower {
        rx: watch::Receiver<PhaseState>,
        ack: watch::Sender<u64>,
    },
}

/// One worker's end of the abort protocol.
pub struct AbortCoordinator {
    rank: usize,
    world_size: usize,
    generation: u64,
    aborted: Option<AbortSignal>,
    link: Link,
}

/// Factory for connected coordinators.
pub struct WorkerGroup;

impl WorkerGroup {
    /// Create one coordinator per rank, connected in-process.
    ///
    /// A `world_size` of zero is treated as a single primary worker.
    pub fn local(world_size: usize) -> Vec<AbortCoordinator> {
        let world_size = world_size.max(1);
        let (tx, rx) = watch::channel(PhaseState {
            generation: 0,
            outcome: PhaseOutcome::Pending,
        });

        let mut acks = Vec::with_capacity(world_size - 1);
        let mut followers = Vec::with_capacity(world_size - 1);
        for rank in 1..world_size {
            let (ack_tx, ack_rx) = watch::channel(0u64);
            acks.push((rank, ack_rx));
            followers.push(AbortCoordinator {
                rank,
                world_size,
                generation: 0,
                aborted: None,
                link: Link::Follower {
                    rx: rx.clone(),
                    ack: ack_tx,
                },
            });
        }

        let primary = AbortCoordinator {
            rank: PRIMARY_RANK,
            world_size,
            generation: 0,
            aborted: None,
            link: Link::Primary { tx, acks },
        };

        std::iter::once(primary).chain(followers).collect()
    }
}

impl AbortCoordinator {
    /// A coordinator for a run with a single worker.
    pub fn single() -> Self {
        let mut group = WorkerGroup::local(1);
        group.remove(0)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_primary(&self) -> bool {
        self.rank == PRIMARY_RANK
    }

    /// The abort this coordinator has observed, if any.
    pub fn aborted(&self) -> Option<&AbortSignal> {
        self.aborted.as_ref()
    }

    /// Run `work` on the primary and hand its result to every rank.
    ///
    /// Followers never call `work`; they wait for the primary's result or its
    /// abort. The primary returns only after every follower has acknowledged
    /// the result.
    pub async fn primary_phase<T, E, F>(&mut self, phase: &str, work: F) -> Result<T, AbortSignal>
    where
        T: Serialize + DeserializeOwned,
        E: StdError + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(signal) = &self.aborted {
            return Err(signal.clone());
        }
        self.generation += 1;
        let generation = self.generation;

        let result = match &mut self.link {
            Link::Primary { tx, acks } => {
                run_primary(phase, self.rank, generation, tx, acks, work).await
            }
            Link::Follower { rx, ack } => {
                run_follower(phase, self.rank, generation, rx, ack).await
            }
        };

        if let Err(signal) = &result {
            self.aborted = Some(signal.clone());
        }
        result
    }

    /// Wait until every rank reaches `phase`.
    pub async fn barrier(&mut self, phase: &str) -> Result<(), AbortSignal> {
        self.primary_phase(phase, || Ok::<(), Infallible>(())).await
    }
}

async fn run_primary<T, E, F>(
    phase: &str,
    rank: usize,
    generation: u64,
    tx: &watch::Sender<PhaseState>,
    acks: &mut [(usize, watch::Receiver<u64>)],
    work: F,
) -> Result<T, AbortSignal>
where
    T: Serialize,
    E: StdError + 'static,
    F: FnOnce() -> Result<T, E>,
{
    let outcome = work().map_err(|e| AbortSignal::from_error(phase, rank, &e));
    let outcome = outcome.and_then(|value| {
        serde_json::to_value(&value)
            .map(|payload| (value, payload))
            .map_err(|e| AbortSignal::from_error(phase, rank, &e))
    });

    let (value, payload) = match outcome {
        Ok(pair) => pair,
        Err(signal) => {
            error!(phase, message = %signal.message, "Primary worker failed; aborting all workers");
            publish_abort(tx, generation, &signal);
            return Err(signal);
        }
    };

    tx.send_replace(PhaseState {
        generation,
        outcome: PhaseOutcome::Completed(payload),
    });

    for (follower, ack) in acks.iter_mut() {
        if ack.wait_for(|seen| *seen >= generation).await.is_err() {
            let signal = AbortSignal::lost(phase, *follower);
            error!(phase, follower = *follower, "Worker lost; aborting all workers");
            publish_abort(tx, generation, &signal);
            return Err(signal);
        }
    }

    debug!(phase, generation, "Primary phase completed");
    Ok(value)
}

fn publish_abort(tx: &watch::Sender<PhaseState>, generation: u64, signal: &AbortSignal) {
    tx.send_replace(PhaseState {
        generation,
        outcome: PhaseOutcome::Aborted(signal.clone()),
    });
}

async fn run_follower<T>(
    phase: &str,
    rank: usize,
    generation: u64,
    rx: &mut watch::Receiver<PhaseState>,
    ack: &watch::Sender<u64>,
) -> Result<T, AbortSignal>
where
    T: DeserializeOwned,
{
    let state = rx
        .wait_for(|s| {
            s.generation >= generation || matches!(s.outcome, PhaseOutcome::Aborted(_))
        })
        .await
        .map(|s| (*s).clone());

    let state = match state {
        Ok(state) => state,
        Err(_) => {
            let signal = AbortSignal::lost(phase, PRIMARY_RANK);
            warn!(phase, rank, "Primary worker vanished; aborting");
            return Err(signal);
        }
    };

    match state.outcome {
        PhaseOutcome::Aborted(signal) => {
            warn!(phase, rank, origin = signal.origin_rank, "Received abort from primary");
            Err(signal)
        }
        PhaseOutcome::Completed(_) if state.generation != generation => Err(AbortSignal::new(
            phase,
            rank,
            format!(
                "phase sequence mismatch: expected generation {generation}, got {}",
                state.generation
            ),
            "worker phases diverged",
        )),
        PhaseOutcome::Completed(payload) => {
            ack.send_replace(generation);
            serde_json::from_value(payload).map_err(|e| AbortSignal::from_error(phase, rank, &e))
        }
        PhaseOutcome::Pending => Err(AbortSignal::lost(phase, PRIMARY_RANK)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk full")]
    struct DiskFull;

    #[tokio::test]
    async fn test_single_worker_phase_returns_value() {
        let mut coord = AbortCoordinator::single();
        assert!(coord.is_primary());
        assert_eq!(coord.world_size(), 1);
        let value = coord
            .primary_phase("weights", || Ok::<_, Infallible>(vec![1.0, 2.0]))
            .await
            .unwrap();
        assert_eq!(value, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_followers() {
        let mut group = WorkerGroup::local(3);
        assert!(group.iter().all(|c| c.world_size() == 3));
        let mut handles = Vec::new();
        for mut coord in group.drain(1..) {
            handles.push(tokio::spawn(async move {
                coord
                    .primary_phase("epoch", || -> Result<u32, Infallible> {
                        unreachable!("followers never run primary work")
                    })
                    .await
            }));
        }
        let mut primary = group.pop().unwrap();
        let value = primary
            .primary_phase("epoch", || Ok::<_, Infallible>(42u32))
            .await
            .unwrap();
        assert_eq!(value, 42);
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn test_primary_failure_aborts_every_worker() {
        let mut group = WorkerGroup::local(3);
        let mut handles = Vec::new();
        for mut coord in group.drain(1..) {
            handles.push(tokio::spawn(async move {
                coord
                    .primary_phase("save_checkpoint", || Ok::<(), DiskFull>(()))
                    .await
            }));
        }
        let mut primary = group.pop().unwrap();
        let err = primary
            .primary_phase("save_checkpoint", || Err::<(), _>(DiskFull))
            .await
            .unwrap_err();
        assert_eq!(err.message, "disk full");
        assert_eq!(err.origin_rank, 0);
        assert!(err.context.contains("DiskFull"));

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap_err(), err);
        }

        // Sticky: later phases keep returning the same signal.
        assert_eq!(primary.barrier("next").await.unwrap_err(), err);
    }

    #[tokio::test]
    async fn test_dropped_primary_releases_followers() {
        let mut group = WorkerGroup::local(2);
        let mut follower = group.pop().unwrap();
        drop(group);

        let err = follower.barrier("validate").await.unwrap_err();
        assert_eq!(err.origin_rank, PRIMARY_RANK);
        assert_eq!(err.phase, "validate");
        assert_eq!(follower.aborted(), Some(&err));
    }

    #[tokio::test]
    async fn test_dropped_follower_aborts_primary() {
        let mut group = WorkerGroup::local(2);
        drop(group.pop());
        let mut primary = group.pop().unwrap();

        let err = primary.barrier("sync").await.unwrap_err();
        assert_eq!(err.origin_rank, 1);
    }
}
