//! Collective communication between ranks.
//!
//! The engine only ever talks to the [`Collective`] contract: blocking
//! broadcast, scatter, all-to-all and gather, rooted at the coordinator.
//! Every rank must reach the matching call before any of them proceeds,
//! and all ranks must issue collectives in identical relative order; a
//! rank that diverges stalls the whole group. Any transport failure is
//! fatal to the run; there are no retries.
//!
//! [`ThreadWorld`] implements the contract over in-process channels so a
//! whole rank group can run as threads of one test or demo process.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tracing::trace;

/// Blocking collective primitives over a fixed rank group.
///
/// Payload arguments are `Some` only where the contract requires data from
/// the coordinator; `gather` returns `Some` only on the coordinator.
pub trait Collective {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Deliver the coordinator's payload to every rank, the coordinator
    /// included.
    fn broadcast(&self, payload: Option<Bytes>) -> Result<Bytes>;

    /// Deliver one per-destination buffer from the coordinator to each
    /// rank; returns the local shard.
    fn scatter(&self, parts: Option<Vec<Bytes>>) -> Result<Bytes>;

    /// Exchange one buffer with every rank; returns per-source buffers in
    /// rank order.
    fn all_to_all(&self, parts: Vec<Bytes>) -> Result<Vec<Bytes>>;

    /// Collect every rank's buffer at the coordinator, in rank order.
    fn gather(&self, part: Bytes) -> Result<Option<Vec<Bytes>>>;
}

/// An in-process rank group connected by one unbounded channel per
/// (source, destination) pair.
///
/// Dedicated per-pair channels keep delivery ordered and source-addressed,
/// which is all the lockstep protocol needs; collective semantics fall out
/// of sending before receiving in rank order.
pub struct ThreadWorld {
    rank: usize,
    size: usize,
    txs: Vec<Sender<Bytes>>,
    rxs: Vec<Receiver<Bytes>>,
}

const COORDINATOR: usize = 0;

impl ThreadWorld {
    /// Build a fully connected group of `size` ranks.
    pub fn connected(size: usize) -> Vec<ThreadWorld> {
        assert!(size > 0, "a rank group needs at least one member");
        let mut txs: Vec<Vec<Sender<Bytes>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut rxs: Vec<Vec<Receiver<Bytes>>> =
            (0..size).map(|_| Vec::with_capacity(size)).collect();
        for src in 0..size {
            for dst in 0..size {
                let (tx, rx) = channel();
                txs[src].push(tx);
                rxs[dst].push(rx);
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (txs, rxs))| ThreadWorld {
                rank,
                size,
                txs,
                rxs,
            })
            .collect()
    }

    fn send_to(&self, dst: usize, payload: Bytes) -> Result<()> {
        self.txs[dst]
            .send(payload)
            .map_err(|_| anyhow::anyhow!("rank {dst} is gone; collective cannot complete"))
    }

    fn recv_from(&self, src: usize) -> Result<Bytes> {
        self.rxs[src]
            .recv()
            .with_context(|| format!("channel from rank {src} closed mid-collective"))
    }
}

impl Collective for ThreadWorld {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&self, payload: Option<Bytes>) -> Result<Bytes> {
        if self.rank == COORDINATOR {
            let payload = payload.context("broadcast payload required on the coordinator")?;
            trace!(rank = self.rank, len = payload.len(), "broadcast");
            for dst in 0..self.size {
                self.send_to(dst, payload.clone())?;
            }
        }
        self.recv_from(COORDINATOR)
    }

    fn scatter(&self, parts: Option<Vec<Bytes>>) -> Result<Bytes> {
        if self.rank == COORDINATOR {
            let parts = parts.context("scatter parts required on the coordinator")?;
            if parts.len() != self.size {
                bail!(
                    "scatter needs one part per rank: got {}, group has {}",
                    parts.len(),
                    self.size
                );
            }
            for (dst, part) in parts.into_iter().enumerate() {
                self.send_to(dst, part)?;
            }
        }
        self.recv_from(COORDINATOR)
    }

    fn all_to_all(&self, parts: Vec<Bytes>) -> Result<Vec<Bytes>> {
        if parts.len() != self.size {
            bail!(
                "all-to-all needs one part per rank: got {}, group has {}",
                parts.len(),
                self.size
            );
        }
        for (dst, part) in parts.into_iter().enumerate() {
            self.send_to(dst, part)?;
        }
        (0..self.size).map(|src| self.recv_from(src)).collect()
    }

    fn gather(&self, part: Bytes) -> Result<Option<Vec<Bytes>>> {
        self.send_to(COORDINATOR, part)?;
        if self.rank != COORDINATOR {
            return Ok(None);
        }
        let gathered = (0..self.size)
            .map(|src| self.recv_from(src))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(gathered))
    }
}

/// Run one closure per rank on scoped threads, SPMD style.
///
/// Every closure receives its own [`ThreadWorld`]; the per-rank return
/// values come back in rank order. A rank that fails or panics fails the
/// whole simulation, mirroring the all-or-nothing error model of the
/// engine itself.
pub fn simulate<F, R>(ranks: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(ThreadWorld) -> Result<R> + Send + Sync,
    R: Send,
{
    let worlds = ThreadWorld::connected(ranks);
    thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = worlds
            .into_iter()
            .map(|world| scope.spawn(move || f(world)))
            .collect();
        let mut outputs = Vec::with_capacity(ranks);
        for (rank, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(result) => outputs.push(result.with_context(|| format!("rank {rank} failed"))?),
                Err(_) => bail!("rank {rank} panicked"),
            }
        }
        Ok(outputs)
    })
}
