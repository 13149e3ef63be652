// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The all-to-all transpose fabric.

Two independent exchanges use this layer: station data scattered by subband
into phase two, and beam parts gathered by stream into phase three. Every
directed (source, destination) pair gets its own bounded channel plus a
credit channel flowing the other way; payload buffers are allocated once,
at fabric construction, and circulate between sender and receiver forever
after. A sender that outruns its receiver by more than the pool depth
blocks on the credit channel — that is the system's backpressure, and it is
deliberately unbounded in time.

Ordering: per destination, packets arrive in send order (channel FIFO);
across destinations nothing is promised, so reassembly sorts by unit index
and never by arrival.

Any malformed, unexpected or overdue packet is an error, and errors here
are fatal to the observation: by the time a block's deadline has passed,
its data is worthless, so there is nothing to retry.
 */

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use crossbeam_channel::{bounded, Receiver, Select, Sender};
use thiserror::Error;

use crate::constants::{TRANSPOSE_BUFFERS_PER_PEER, TRANSPOSE_TIMEOUT};
use crate::topology::Rank;

#[derive(Error, Debug)]
pub enum TransposeError {
    #[error("Rank {rank}: peer {peer} hung up (block {block})")]
    Disconnected { rank: Rank, peer: Rank, block: usize },

    #[error("Rank {rank}: a transpose operation timed out (block {block})")]
    Timeout { rank: Rank, block: usize },

    #[error(
        "Rank {rank}: unexpected packet from {peer}: unit {unit} of block {packet_block} (expecting block {block})"
    )]
    Unexpected {
        rank: Rank,
        peer: Rank,
        unit: usize,
        packet_block: usize,
        block: usize,
    },

    #[error("Rank {rank}: packet from {peer} carries {got} words, expected {expected}")]
    WrongSize {
        rank: Rank,
        peer: Rank,
        got: usize,
        expected: usize,
    },

    #[error("Rank {rank}: waited for a receive with nothing pending")]
    NothingPending { rank: Rank },
}

/// One unit of one block, in flight between two ranks.
#[derive(Debug)]
pub struct Packet {
    pub block: usize,
    /// Subband for the input exchange; beam stream for the beam exchange.
    pub unit: usize,
    /// False when the sender had no real data for this block; the unit
    /// still travels so the receiver's expectation set stays in lockstep.
    pub valid: bool,
    pub payload: Vec<f32>,
}

/// What `wait_for_any_receive` hands back. Dropping it returns the payload
/// buffer to the sender's pool through the credit channel.
pub struct Received {
    pub from: Rank,
    pub block: usize,
    pub unit: usize,
    pub valid: bool,
    payload: Option<Vec<f32>>,
    credit: Sender<Vec<f32>>,
}

impl Received {
    pub fn payload(&self) -> &[f32] {
        self.payload.as_deref().expect("taken before drop")
    }
}

impl Drop for Received {
    fn drop(&mut self) {
        if let Some(buffer) = self.payload.take() {
            // The sender may already be gone during teardown; a lost
            // credit is fine then.
            let _ = self.credit.send(buffer);
        }
    }
}

struct Link {
    data_tx: Sender<Packet>,
    /// Buffers the receiver has handed back.
    credit_rx: Receiver<Vec<f32>>,
    /// The local pool sends are drawn from. `pool.len()` below the pool
    /// depth means buffers are still with the receiver or in flight.
    pool: Vec<Vec<f32>>,
}

struct PeerInbox {
    data_rx: Receiver<Packet>,
    /// Where consumed payload buffers go back to.
    credit_tx: Sender<Vec<f32>>,
}

/// One rank's handle on a fabric.
pub struct Endpoint {
    rank: Rank,
    words_per_packet: usize,
    links: HashMap<Rank, Link>,
    inboxes: HashMap<Rank, PeerInbox>,
    /// (peer, unit) pairs still owed to us this block.
    pending: Vec<(Rank, usize)>,
    block: usize,
}

/// Build one fabric: a full mesh over `nr_ranks` ranks with fixed-size
/// payload buffers. Returns one endpoint per rank, to be moved onto that
/// rank's thread.
pub fn fabric(nr_ranks: usize, words_per_packet: usize) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = (0..nr_ranks)
        .map(|rank| Endpoint {
            rank,
            words_per_packet,
            links: HashMap::new(),
            inboxes: HashMap::new(),
            pending: Vec::new(),
            block: 0,
        })
        .collect();

    for src in 0..nr_ranks {
        for dst in 0..nr_ranks {
            if src == dst {
                continue;
            }
            let (data_tx, data_rx) = bounded(TRANSPOSE_BUFFERS_PER_PEER);
            let (credit_tx, credit_rx) = bounded(TRANSPOSE_BUFFERS_PER_PEER);
            endpoints[src].links.insert(
                dst,
                Link {
                    data_tx,
                    credit_rx,
                    pool: (0..TRANSPOSE_BUFFERS_PER_PEER)
                        .map(|_| vec![0.0; words_per_packet])
                        .collect(),
                },
            );
            endpoints[dst].inboxes.insert(src, PeerInbox { data_rx, credit_tx });
        }
    }
    endpoints
}

impl Endpoint {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn words_per_packet(&self) -> usize {
        self.words_per_packet
    }

    /// Arm the expectation set for a block: every (peer, unit) that must
    /// arrive before the block is complete. Must be called before any peer
    /// could send — with pre-pooled channels the buffers are "posted" by
    /// construction, so this only pins down what counts as expected.
    pub fn post_all_receives(&mut self, block: usize, expected: &[(Rank, usize)]) {
        debug_assert!(self.pending.is_empty(), "previous block still pending");
        self.block = block;
        self.pending.clear();
        self.pending.extend_from_slice(expected);
    }

    pub fn nr_pending(&self) -> usize {
        self.pending.len()
    }

    /// Send one unit to a peer, filling a pooled buffer via `fill`. Blocks
    /// only when the peer is more than the pool depth behind.
    pub fn async_send(
        &mut self,
        dst: Rank,
        block: usize,
        unit: usize,
        valid: bool,
        fill: impl FnOnce(&mut [f32]),
    ) -> Result<(), TransposeError> {
        let link = self.links.get_mut(&dst).expect("fabric is a full mesh");
        // Sweep any credits that already came back, then draw a buffer,
        // blocking if the receiver is a full pool depth behind.
        while let Ok(buffer) = link.credit_rx.try_recv() {
            link.pool.push(buffer);
        }
        let mut payload = match link.pool.pop() {
            Some(buffer) => buffer,
            None => match link.credit_rx.recv_timeout(TRANSPOSE_TIMEOUT) {
                Ok(buffer) => buffer,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    return Err(TransposeError::Timeout {
                        rank: self.rank,
                        block,
                    })
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(TransposeError::Disconnected {
                        rank: self.rank,
                        peer: dst,
                        block,
                    })
                }
            },
        };
        fill(&mut payload);
        link.data_tx
            .send(Packet {
                block,
                unit,
                valid,
                payload,
            })
            .map_err(|_| TransposeError::Disconnected {
                rank: self.rank,
                peer: dst,
                block,
            })
    }

    /// Block until any expected unit arrives; completion order across peers
    /// is arbitrary. The returned guard recycles the buffer on drop.
    pub fn wait_for_any_receive(&mut self) -> Result<Received, TransposeError> {
        if self.pending.is_empty() {
            return Err(TransposeError::NothingPending { rank: self.rank });
        }

        // Select over every peer we still expect something from.
        let peers: Vec<Rank> = {
            let mut peers: Vec<Rank> = self.pending.iter().map(|&(peer, _)| peer).collect();
            peers.sort_unstable();
            peers.dedup();
            peers
        };
        let mut select = Select::new();
        for &peer in &peers {
            select.recv(&self.inboxes[&peer].data_rx);
        }

        let op = select
            .select_timeout(TRANSPOSE_TIMEOUT)
            .map_err(|_| TransposeError::Timeout {
                rank: self.rank,
                block: self.block,
            })?;
        let peer = peers[op.index()];
        let inbox = &self.inboxes[&peer];
        let packet = op
            .recv(&inbox.data_rx)
            .map_err(|_| TransposeError::Disconnected {
                rank: self.rank,
                peer,
                block: self.block,
            })?;

        if packet.payload.len() != self.words_per_packet {
            return Err(TransposeError::WrongSize {
                rank: self.rank,
                peer,
                got: packet.payload.len(),
                expected: self.words_per_packet,
            });
        }
        let slot = self
            .pending
            .iter()
            .position(|&(p, u)| p == peer && u == packet.unit && packet.block == self.block)
            .ok_or(TransposeError::Unexpected {
                rank: self.rank,
                peer,
                unit: packet.unit,
                packet_block: packet.block,
                block: self.block,
            })?;
        self.pending.swap_remove(slot);

        Ok(Received {
            from: peer,
            block: packet.block,
            unit: packet.unit,
            valid: packet.valid,
            payload: Some(packet.payload),
            credit: inbox.credit_tx.clone(),
        })
    }

    /// Wait until every buffer lent out by our sends has come back through
    /// the credit channels: after this, all sends of the block have been
    /// consumed and the pool is full again for the next block.
    pub fn wait_for_all_sends(&mut self) -> Result<(), TransposeError> {
        for (&dst, link) in self.links.iter_mut() {
            while link.pool.len() < TRANSPOSE_BUFFERS_PER_PEER {
                match link.credit_rx.recv_timeout(TRANSPOSE_TIMEOUT) {
                    Ok(buffer) => link.pool.push(buffer),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        return Err(TransposeError::Timeout {
                            rank: self.rank,
                            block: self.block,
                        })
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        return Err(TransposeError::Disconnected {
                            rank: self.rank,
                            peer: dst,
                            block: self.block,
                        })
                    }
                }
            }
        }
        Ok(())
    }
}
