//! Client side of the pack protocol.
//!
//! A `TransportNegotiator` moves through
//! `Idle -> Negotiating -> Transferring -> Applying -> Done`, or `Failed` on
//! any error. Nothing about a failed transfer is kept; the caller retries the
//! whole exchange.

use crate::error::{Result, SyncError};
use crate::object::ObjectId;
use crate::packfile::read_pack;
use crate::pktline::{self, Packet, PacketIo, HAVE_BATCH};
use crate::protocol::{self, GraphWalker, RefUpdate, StoreGraphWalker};
use crate::storage::TargetStore;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Transferring,
    Applying,
    Done,
    Failed,
}

/// Statistics from one transfer
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Objects carried by the pack
    pub objects: u64,
    /// Pack size on the wire
    pub bytes: u64,
    /// `have` lines offered during negotiation
    pub haves_sent: u64,
    pub duration_ms: u64,
}

impl TransferStats {
    /// Throughput in bytes per second
    pub fn throughput_bps(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        (self.bytes as f64 / self.duration_ms as f64) * 1000.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Refs advertised by the peer
    pub refs: BTreeMap<String, ObjectId>,
    pub wants: BTreeSet<ObjectId>,
    /// Ids of every object stored from the pack
    pub objects: Vec<ObjectId>,
    pub stats: TransferStats,
}

#[derive(Debug, Clone, Default)]
pub struct PushOutcome {
    pub accepted: Vec<String>,
    /// `(ref, reason)` for every update the peer refused
    pub rejected: Vec<(String, String)>,
    pub stats: TransferStats,
}

pub struct TransportNegotiator {
    state: NegotiationState,
    timeout: Duration,
}

impl Default for TransportNegotiator {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl TransportNegotiator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: NegotiationState::Idle,
            timeout,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!(from = ?self.state, to = ?next, "negotiation state");
        self.state = next;
    }

    fn settle<R>(&mut self, result: std::result::Result<Result<R>, tokio::time::error::Elapsed>) -> Result<R> {
        let result = result.unwrap_or_else(|_| {
            Err(SyncError::Transport(format!("transfer timed out after {}s", self.timeout.as_secs())))
        });
        match &result {
            Ok(_) => self.transition(NegotiationState::Done),
            Err(e) => {
                warn!(state = ?self.state, error = %e, "transfer failed");
                self.transition(NegotiationState::Failed);
            }
        }
        result
    }

    /// Fetch everything the peer advertises that `store` lacks.
    ///
    /// The pack is fully resolved, thin deltas included, before any object
    /// is written to `store`.
    pub async fn fetch<P, T>(&mut self, io: &mut P, store: &mut T) -> Result<FetchOutcome>
    where
        P: PacketIo + ?Sized,
        T: TargetStore,
    {
        let timeout = self.timeout;
        let result = tokio::time::timeout(timeout, self.fetch_inner(io, store)).await;
        self.settle(result)
    }

    async fn fetch_inner<P, T>(&mut self, io: &mut P, store: &mut T) -> Result<FetchOutcome>
    where
        P: PacketIo + ?Sized,
        T: TargetStore,
    {
        let started = Instant::now();
        self.transition(NegotiationState::Negotiating);
        let refs = protocol::read_advertisement(io).await?;
        let wants = protocol::determine_wants(store, &refs)?;
        debug!(advertised = refs.len(), wants = wants.len(), "received advertisement");

        let mut outcome = FetchOutcome {
            refs,
            wants,
            ..Default::default()
        };
        if outcome.wants.is_empty() {
            io.write_packet(&Packet::Flush).await?;
            io.flush().await?;
            return Ok(outcome);
        }

        let want_lines: Vec<String> = outcome.wants.iter().map(|id| format!("want {}", id)).collect();
        io.write_lines(&want_lines).await?;

        let heads: Vec<ObjectId> = store.refs()?.into_values().collect();
        let mut walker = StoreGraphWalker::new(&*store, heads);
        outcome.stats.haves_sent = negotiate_haves(io, &mut walker).await?;
        debug!(common = walker.common().len(), "negotiation finished");
        drop(walker);

        self.transition(NegotiationState::Transferring);
        let pack = io.read_until_flush().await?.concat();
        outcome.stats.bytes = pack.len() as u64;

        self.transition(NegotiationState::Applying);
        let objects = read_pack(&pack, &*store)?;
        for object in &objects {
            let id = store.put_raw(object.kind, &object.data)?;
            outcome.objects.push(id);
        }
        outcome.stats.objects = objects.len() as u64;
        for want in &outcome.wants {
            if !store.contains(want)? {
                return Err(SyncError::protocol(format!("peer did not send wanted object {}", want)));
            }
        }

        outcome.stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            objects = outcome.stats.objects,
            bytes = outcome.stats.bytes,
            duration_ms = outcome.stats.duration_ms,
            "fetch complete"
        );
        Ok(outcome)
    }

    /// Update refs on the peer to `desired`; a null id deletes the ref.
    ///
    /// The roles of fetch are inverted: the peer's advertised tips are the
    /// `have` set and the new ref values are the `want` set of the pack.
    pub async fn push<P, T>(
        &mut self,
        io: &mut P,
        store: &T,
        desired: &BTreeMap<String, ObjectId>,
        force: bool,
    ) -> Result<PushOutcome>
    where
        P: PacketIo + ?Sized,
        T: TargetStore,
    {
        let timeout = self.timeout;
        let result = tokio::time::timeout(timeout, self.push_inner(io, store, desired, force)).await;
        self.settle(result)
    }

    async fn push_inner<P, T>(
        &mut self,
        io: &mut P,
        store: &T,
        desired: &BTreeMap<String, ObjectId>,
        force: bool,
    ) -> Result<PushOutcome>
    where
        P: PacketIo + ?Sized,
        T: TargetStore,
    {
        let started = Instant::now();
        self.transition(NegotiationState::Negotiating);
        let advertised = protocol::read_advertisement(io).await?;

        let mut commands = Vec::new();
        for (ref_name, new) in desired {
            let old = advertised.get(ref_name).copied().unwrap_or(ObjectId::NULL);
            if old == *new {
                continue;
            }
            commands.push(RefUpdate {
                ref_name: ref_name.clone(),
                old,
                new: *new,
                force,
            });
        }
        let mut outcome = PushOutcome::default();
        if commands.is_empty() {
            io.write_packet(&Packet::Flush).await?;
            io.flush().await?;
            return Ok(outcome);
        }

        let mut haves = BTreeSet::new();
        for id in advertised.values() {
            if store.contains(id)? {
                haves.insert(*id);
            }
        }
        let wants: BTreeSet<ObjectId> = commands.iter().filter(|c| !c.is_delete()).map(|c| c.new).collect();

        self.transition(NegotiationState::Transferring);
        let writer = protocol::generate_pack(store, &haves, &wants)?;
        outcome.stats.objects = writer.len() as u64;
        let pack = writer.finish()?;
        outcome.stats.bytes = pack.len() as u64;

        let lines: Vec<String> = commands.iter().map(RefUpdate::to_line).collect();
        io.write_lines(&lines).await?;
        for packet in pktline::chunk(&pack) {
            io.write_packet(&packet).await?;
        }
        io.write_packet(&Packet::Flush).await?;
        io.flush().await?;

        self.transition(NegotiationState::Applying);
        for data in io.read_until_flush().await? {
            let line = Packet::Data(data).text().unwrap_or_default();
            if let Some(ref_name) = line.strip_prefix("ok ") {
                outcome.accepted.push(ref_name.to_string());
            } else if let Some(rest) = line.strip_prefix("ng ") {
                let (ref_name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
                warn!(ref_name = %ref_name, reason = %reason, "peer rejected ref update");
                outcome.rejected.push((ref_name.to_string(), reason.to_string()));
            } else {
                return Err(SyncError::protocol(format!("unexpected push report line {:?}", line)));
            }
        }

        outcome.stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            bytes = outcome.stats.bytes,
            "push complete"
        );
        Ok(outcome)
    }
}

/// Offer `have` lines in batches until the walker runs dry, feeding every
/// `ACK` back into it. Ends with `done`.
pub async fn negotiate_haves<P, W>(io: &mut P, walker: &mut W) -> Result<u64>
where
    P: PacketIo + ?Sized,
    W: GraphWalker,
{
    let mut sent = 0u64;
    loop {
        let mut batch = Vec::with_capacity(HAVE_BATCH);
        while batch.len() < HAVE_BATCH {
            match walker.next()? {
                Some(id) => batch.push(format!("have {}", id)),
                None => break,
            }
        }
        if batch.is_empty() {
            break;
        }
        sent += batch.len() as u64;
        io.write_lines(&batch).await?;
        io.flush().await?;

        loop {
            let line = match io.read_packet().await? {
                Packet::Flush => return Err(SyncError::protocol("flush before NAK during negotiation")),
                packet => packet.text().unwrap_or_default(),
            };
            if line == "NAK" {
                break;
            }
            match protocol::parse_id_line(&line, "ACK")? {
                Some(id) => walker.ack(id)?,
                None => return Err(SyncError::protocol(format!("unexpected negotiation line {:?}", line))),
            }
        }
    }
    io.write_packet(&Packet::line("done")).await?;
    io.flush().await?;
    Ok(sent)
}
