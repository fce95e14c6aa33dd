//! Cross-worker collectives for data-parallel training.
//!
//! Workers run the same step on disjoint batch shards. The loss path only
//! needs two capabilities from the distributed runtime: averaging a scalar
//! across workers and knowing which worker is primary.
use crate::{Result, RlftError};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Barrier};

/// Distributed runtime seen by the loss computation.
pub trait Collective: Send + Sync {
    /// Average `value` across all workers. Blocks until every worker has
    /// contributed.
    fn reduce_mean(&self, value: f64) -> Result<f64>;

    /// Barrier synchronization
    fn barrier(&self);

    /// Get world size
    fn world_size(&self) -> usize;

    /// Get current rank
    fn rank(&self) -> usize;

    /// The worker allowed to perform side effects such as checkpoint writes.
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }
}

/// Single worker, no communication.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn reduce_mean(&self, value: f64) -> Result<f64> {
        Ok(value)
    }

    fn barrier(&self) {}

    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

/// Channel ends owned by one worker. Dropping a worker's handle closes
/// its channels, so peers see a disconnect instead of blocking.
#[derive(Clone)]
enum Links {
    /// Rank 0: one gather receiver and one scatter sender per peer.
    Root {
        gather: Vec<Receiver<f64>>,
        scatter: Vec<Sender<f64>>,
    },
    Peer {
        gather: Sender<f64>,
        scatter: Receiver<f64>,
    },
}

/// One worker of a thread-local group. Rank 0 gathers, averages and
/// broadcasts.
#[derive(Clone)]
pub struct ThreadCollective {
    rank: usize,
    world_size: usize,
    barrier: Arc<Barrier>,
    links: Links,
}

impl ThreadCollective {
    /// Create one handle per rank for a group of `world_size` workers.
    pub fn group(world_size: usize) -> Vec<Self> {
        let barrier = Arc::new(Barrier::new(world_size));
        let mut root_gather = Vec::with_capacity(world_size.saturating_sub(1));
        let mut root_scatter = Vec::with_capacity(world_size.saturating_sub(1));
        let mut peers = Vec::with_capacity(world_size.saturating_sub(1));

        for rank in 1..world_size {
            let (gs, gr) = bounded(1);
            let (ss, sr) = bounded(1);
            root_gather.push(gr);
            root_scatter.push(ss);
            peers.push(Self {
                rank,
                world_size,
                barrier: Arc::clone(&barrier),
                links: Links::Peer {
                    gather: gs,
                    scatter: sr,
                },
            });
        }

        let root = Self {
            rank: 0,
            world_size,
            barrier,
            links: Links::Root {
                gather: root_gather,
                scatter: root_scatter,
            },
        };
        std::iter::once(root).chain(peers).take(world_size).collect()
    }
}

fn disconnected(what: &str, rank: usize) -> RlftError {
    RlftError::Collective(format!("{} channel for rank {} disconnected", what, rank))
}

impl Collective for ThreadCollective {
    fn reduce_mean(&self, value: f64) -> Result<f64> {
        if self.world_size <= 1 {
            return Ok(value);
        }

        match &self.links {
            Links::Root { gather, scatter } => {
                let mut sum = value;
                for (i, rx) in gather.iter().enumerate() {
                    sum += rx.recv().map_err(|_| disconnected("gather", i + 1))?;
                }
                let mean = sum / self.world_size as f64;
                for (i, tx) in scatter.iter().enumerate() {
                    tx.send(mean).map_err(|_| disconnected("scatter", i + 1))?;
                }
                Ok(mean)
            }
            Links::Peer { gather, scatter } => {
                gather
                    .send(value)
                    .map_err(|_| disconnected("gather", self.rank))?;
                scatter
                    .recv()
                    .map_err(|_| disconnected("scatter", self.rank))
            }
        }
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_process() {
        assert_eq!(SingleProcess.reduce_mean(3.5).unwrap(), 3.5);
        assert!(SingleProcess.is_primary());
        assert_eq!(SingleProcess.world_size(), 1);
    }

    #[test]
    fn test_thread_group_reduce_mean() {
        let handles: Vec<_> = ThreadCollective::group(4)
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    let first = c.reduce_mean(c.rank() as f64).unwrap();
                    let second = c.reduce_mean(10.0 * c.rank() as f64).unwrap();
                    c.barrier();
                    (c.is_primary(), first, second)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.0).count(), 1);
        for (_, first, second) in results {
            assert_eq!(first, 1.5);
            assert_eq!(second, 15.0);
        }
    }

    #[test]
    fn test_dropped_peer_disconnects_root() {
        let mut group = ThreadCollective::group(3);
        let peer = group.pop().unwrap();
        drop(peer);

        let root = group.remove(0);
        let survivor = group.pop().unwrap();
        let handle = thread::spawn(move || survivor.reduce_mean(1.0));

        match root.reduce_mean(0.0) {
            Err(RlftError::Collective(msg)) => assert!(msg.contains("rank 2")),
            other => panic!("expected collective error, got {:?}", other),
        }
        // Root drops its scatter ends, so the surviving peer is released too.
        drop(root);
        assert!(matches!(
            handle.join().unwrap(),
            Err(RlftError::Collective(_))
        ));
    }

    #[test]
    fn test_dead_root_releases_peer() {
        let mut group = ThreadCollective::group(2);
        let peer = group.pop().unwrap();
        drop(group);
        assert!(peer.reduce_mean(1.0).is_err());
    }

    #[test]
    fn test_group_of_one_needs_no_peers() {
        let mut group = ThreadCollective::group(1);
        let c = group.pop().unwrap();
        assert_eq!(c.reduce_mean(2.0).unwrap(), 2.0);
        c.barrier();
    }
}
