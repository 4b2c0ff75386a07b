//! The per-rank execution engine.
//!
//! Every rank calls [`Engine::initialize`] with the same transport kind
//! and an identically ordered registry. The coordinator gets an [`Engine`]
//! back and drives the group through commands; every other rank stays
//! inside the receive-and-dispatch loop until terminate arrives. All
//! cross-rank calls are blocking collectives, so coordinator and workers
//! move through scatter, side-data, job and terminate phases in lockstep.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tracing::{debug, info};

use crate::codec::{ByteStream, Wire};
use crate::protocol::{Command, DispatchKey, OpCode};
use crate::registry::{JobShape, Registry};
use crate::transport::Collective;
use crate::{Mapper, Reducer};

/// Buffers owned by one rank: the resident input shard plus one side-data
/// stream per phase. Nothing here is shared; phases hand streams around by
/// mutable borrow and reset them explicitly.
#[derive(Default)]
struct RankState {
    input: ByteStream,
    map_side: ByteStream,
    reduce_side: ByteStream,
    combine_side: ByteStream,
}

/// Coordinator handle for a running rank group.
///
/// Only the coordinator ever holds one. Dropping it without an explicit
/// [`shutdown`](Engine::shutdown) still broadcasts terminate so workers
/// unwind instead of blocking forever.
pub struct Engine<T: Collective> {
    transport: T,
    registry: Registry,
    state: RankState,
    active: bool,
}

impl<T: Collective> Engine<T> {
    /// Set up this rank. Must be called identically on every rank before
    /// anything else.
    ///
    /// Exchanges a digest of the registration list first and fails every
    /// rank fast if any rank registered a different list; a mismatched
    /// table would otherwise dispatch the wrong logic without any error.
    /// Returns `Some(engine)` on the coordinator; worker ranks serve
    /// commands until terminate and then return `None`.
    pub fn initialize(transport: T, registry: Registry) -> Result<Option<Self>> {
        verify_registration(&transport, &registry)?;

        if transport.is_coordinator() {
            return Ok(Some(Self {
                transport,
                registry,
                state: RankState::default(),
                active: true,
            }));
        }

        let code = serve(&transport, &registry)?;
        if code != 0 {
            bail!("rank {} terminated with status {code}", transport.rank());
        }
        Ok(None)
    }

    /// Partition `items` into contiguous chunks and scatter one to each
    /// rank. The shards stay resident, so several job shapes can run over
    /// the same input without resubmitting it.
    pub fn scatter_input<I: Wire>(&mut self, items: &[I]) -> Result<()> {
        self.broadcast_command(Command::new(OpCode::DistributeInput, 0))?;

        let size = self.transport.size();
        let chunk = items.len().div_ceil(size);
        let mut parts = Vec::with_capacity(size);
        let mut taken = 0;
        for _ in 0..size {
            let take = chunk.min(items.len() - taken);
            let mut bs = ByteStream::new();
            (take as u64).encode(&mut bs);
            for item in &items[taken..taken + take] {
                item.encode(&mut bs);
            }
            parts.push(bs.freeze());
            taken += take;
        }

        let shard = self.transport.scatter(Some(parts))?;
        self.state.input = ByteStream::from(shard);
        debug!(items = items.len(), ranks = size, "input scattered");
        Ok(())
    }

    /// Scatter `input` and run one job, returning the concatenated reduce
    /// results in rank order (not globally sorted).
    pub fn submit<M, R>(&mut self, shape: &JobShape<M, R>, input: &[M::Input]) -> Result<Vec<R::Output>>
    where
        M: Mapper,
        R: Reducer<Key = M::Key, Value = M::Value>,
    {
        self.scatter_input(input)?;
        self.run_without_scatter(shape)
    }

    /// Run a job over the input scattered by an earlier call.
    ///
    /// If the shape does not belong to this engine's registry, a no-op
    /// start-job is still broadcast before the error returns, so worker
    /// state machines stay in lockstep even on early rejection.
    pub fn run_without_scatter<M, R>(&mut self, shape: &JobShape<M, R>) -> Result<Vec<R::Output>>
    where
        M: Mapper,
        R: Reducer<Key = M::Key, Value = M::Value>,
    {
        let key = match self.dispatch_key(shape) {
            Ok(key) => key,
            Err(err) => {
                self.broadcast_command(Command::new(OpCode::StartJob, DispatchKey::ABORT.pack()))?;
                return Err(err.context("job shape rejected before dispatch"));
            }
        };

        self.broadcast_command(Command::new(OpCode::StartJob, key.pack()))?;
        let gathered = execute_job(&self.registry, &mut self.state, &self.transport, key)?
            .context("result gather produced nothing on the coordinator")?;

        let mut results = Vec::new();
        for part in gathered {
            let mut bs = ByteStream::from(part);
            results.extend(Vec::<R::Output>::decode(&mut bs)?);
        }
        info!(results = results.len(), "job complete");
        Ok(results)
    }

    /// Broadcast the map phase's side-data value to every rank.
    pub fn set_map_side_data<V: Wire>(&mut self, value: &V) -> Result<()> {
        self.set_side_data(OpCode::MapSideData, value)
    }

    /// Broadcast the reduce phase's side-data value to every rank.
    pub fn set_reduce_side_data<V: Wire>(&mut self, value: &V) -> Result<()> {
        self.set_side_data(OpCode::ReduceSideData, value)
    }

    /// Broadcast the combine phase's side-data value to every rank.
    pub fn set_combine_side_data<V: Wire>(&mut self, value: &V) -> Result<()> {
        self.set_side_data(OpCode::CombineSideData, value)
    }

    /// Terminate the group: workers exit their command loops with `code`.
    pub fn shutdown(mut self, code: i32) -> Result<()> {
        self.broadcast_command(Command::new(OpCode::Terminate, code as u32 as u64))?;
        self.active = false;
        Ok(())
    }

    pub fn rank_count(&self) -> usize {
        self.transport.size()
    }

    fn set_side_data<V: Wire>(&mut self, code: OpCode, value: &V) -> Result<()> {
        let mut bs = ByteStream::new();
        value.encode(&mut bs);
        self.broadcast_command(Command::new(code, bs.len() as u64))?;
        let echoed = self.transport.broadcast(Some(bs.freeze()))?;
        *side_slot(&mut self.state, code) = ByteStream::from(echoed);
        Ok(())
    }

    fn dispatch_key<M, R>(&self, shape: &JobShape<M, R>) -> Result<DispatchKey> {
        self.registry.map_handler(shape.map)?;
        self.registry.reduce_handler(shape.reduce)?;
        if shape.combine != 0 {
            self.registry.combine_handler(shape.combine)?;
        }
        Ok(DispatchKey {
            map: shape.map,
            reduce: shape.reduce,
            combine: shape.combine,
        })
    }

    fn broadcast_command(&mut self, head: Command) -> Result<()> {
        let mut bs = ByteStream::with_capacity(Command::WIRE_LEN);
        head.encode(&mut bs);
        self.transport.broadcast(Some(bs.freeze()))?;
        Ok(())
    }
}

impl<T: Collective> Drop for Engine<T> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        // implicit terminate so workers are never left parked
        let mut bs = ByteStream::with_capacity(Command::WIRE_LEN);
        Command::new(OpCode::Terminate, 0).encode(&mut bs);
        let _ = self.transport.broadcast(Some(bs.freeze()));
    }
}

fn side_slot(state: &mut RankState, code: OpCode) -> &mut ByteStream {
    match code {
        OpCode::MapSideData => &mut state.map_side,
        OpCode::ReduceSideData => &mut state.reduce_side,
        OpCode::CombineSideData => &mut state.combine_side,
        _ => unreachable!("not a side-data opcode"),
    }
}

/// The worker command loop: receive, dispatch, repeat until terminate.
/// Returns the status code carried by the terminate command.
fn serve<T: Collective>(transport: &T, registry: &Registry) -> Result<i32> {
    let mut state = RankState::default();
    loop {
        let raw = transport.broadcast(None)?;
        let head = Command::decode(&mut ByteStream::from(raw))?;
        debug!(rank = transport.rank(), code = ?head.code, "command received");
        match head.code {
            OpCode::Terminate => {
                info!(rank = transport.rank(), "terminating");
                return Ok(head.value as i32);
            }
            OpCode::StartJob => {
                execute_job(registry, &mut state, transport, DispatchKey::unpack(head.value))?;
            }
            OpCode::DistributeInput => {
                let shard = transport.scatter(None)?;
                state.input = ByteStream::from(shard);
            }
            OpCode::MapSideData | OpCode::ReduceSideData | OpCode::CombineSideData => {
                let payload = transport.broadcast(None)?;
                if payload.len() as u64 != head.value {
                    bail!(
                        "side-data length mismatch: command announced {} bytes, received {}",
                        head.value,
                        payload.len()
                    );
                }
                *side_slot(&mut state, head.code) = ByteStream::from(payload);
            }
        }
    }
}

/// Run one job on this rank: map, optional combine, shuffle, reduce,
/// gather. Identical on coordinator and workers; only the coordinator
/// gets the gathered per-rank results back.
fn execute_job<T: Collective>(
    registry: &Registry,
    state: &mut RankState,
    transport: &T,
    key: DispatchKey,
) -> Result<Option<Vec<Bytes>>> {
    if key.is_abort() {
        debug!("job aborted before dispatch; nothing to run");
        return Ok(None);
    }

    let ranks = transport.size();
    let map = registry.map_handler(key.map)?;
    let mut staged = map(&mut state.input, &mut state.map_side, ranks)?;

    if key.combine != 0 {
        let combine = registry.combine_handler(key.combine)?;
        staged = combine(&mut state.combine_side, staged)?;
    }

    let reduce = registry.reduce_handler(key.reduce)?;
    let mut exchange = |outgoing: Vec<ByteStream>| -> Result<Vec<ByteStream>> {
        let sent = outgoing.into_iter().map(ByteStream::freeze).collect();
        let received = transport.all_to_all(sent)?;
        Ok(received.into_iter().map(ByteStream::from).collect())
    };
    let local = reduce(&mut state.reduce_side, staged, &mut exchange)?;

    transport.gather(local.freeze())
}

/// Gather every rank's registration digest at the coordinator and
/// broadcast the verdict; all ranks fail together on a mismatch.
fn verify_registration<T: Collective>(transport: &T, registry: &Registry) -> Result<()> {
    let mut bs = ByteStream::new();
    registry.digest().encode(&mut bs);
    let gathered = transport.gather(bs.freeze())?;

    let verdict = match gathered {
        Some(parts) => {
            let mut agreed = true;
            for part in parts {
                let digest = u64::decode(&mut ByteStream::from(part))?;
                agreed &= digest == registry.digest();
            }
            transport.broadcast(Some(Bytes::from(vec![u8::from(agreed)])))?
        }
        None => transport.broadcast(None)?,
    };

    if verdict.first() != Some(&1) {
        bail!(
            "rank {}: handler registration differs across ranks; \
             every rank must register the same implementations in the same order",
            transport.rank()
        );
    }
    Ok(())
}
