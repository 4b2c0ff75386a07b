//! Handler registry: turns map/reduce/combine implementations into small
//! numeric dispatch indices agreed upon by every rank.
//!
//! Each registration call appends one type-erased handler to the table and
//! returns a typed token. The table is never transmitted; start-job
//! commands carry only indices, so every rank must execute registration
//! with the exact same ordered list. [`Registry::digest`] exists so the
//! engine can verify that at startup instead of silently dispatching the
//! wrong logic.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::hash::Hasher as _;
use std::marker::PhantomData;

use anyhow::{anyhow, bail, Result};
use itertools::Itertools;
use tracing::debug;

use crate::codec::{ByteStream, Wire};
use crate::{partition, Combiner, Mapper, Reducer};

/// Staged pair data handed between pipeline phases on one rank.
///
/// Concretely always a `Vec<Vec<(K, V)>>` of per-destination buckets; the
/// erased type lets the registry store handlers for arbitrary key/value
/// types in one table.
type Staged = Box<dyn Any>;

/// The shuffle step, injected by the engine so handlers stay independent
/// of the transport type.
pub(crate) type Exchange<'a> = dyn FnMut(Vec<ByteStream>) -> Result<Vec<ByteStream>> + 'a;

pub(crate) type MapHandler =
    Box<dyn Fn(&mut ByteStream, &mut ByteStream, usize) -> Result<Staged> + Send + Sync>;
pub(crate) type CombineHandler =
    Box<dyn Fn(&mut ByteStream, Staged) -> Result<Staged> + Send + Sync>;
pub(crate) type ReduceHandler =
    Box<dyn Fn(&mut ByteStream, Staged, &mut Exchange<'_>) -> Result<ByteStream> + Send + Sync>;

enum Handler {
    /// Slot 0: index zero means "unregistered" on the wire.
    Reserved,
    Map(MapHandler),
    Combine(CombineHandler),
    Reduce(ReduceHandler),
}

/// A typed handle to a registered map implementation.
///
/// Tokens are only obtainable through registration, so a job shape built
/// from them is known to name registered, type-compatible handlers.
#[derive(Debug, Clone, Copy)]
pub struct MapToken<M> {
    pub(crate) index: u16,
    marker: PhantomData<fn() -> M>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReduceToken<R> {
    pub(crate) index: u16,
    marker: PhantomData<fn() -> R>,
}

#[derive(Debug, Clone, Copy)]
pub struct CombineToken<C> {
    pub(crate) index: u16,
    marker: PhantomData<fn() -> C>,
}

/// A specific map + reduce (+ optional combine) combination.
///
/// The constructors constrain key and value types to agree across the
/// phases, so a mismatched shape is a compile error rather than a runtime
/// surprise.
#[derive(Debug, Clone, Copy)]
pub struct JobShape<M, R> {
    pub(crate) map: u16,
    pub(crate) reduce: u16,
    pub(crate) combine: u16,
    marker: PhantomData<fn() -> (M, R)>,
}

impl<M, R> JobShape<M, R>
where
    M: Mapper,
    R: Reducer<Key = M::Key, Value = M::Value>,
{
    pub fn new(map: MapToken<M>, reduce: ReduceToken<R>) -> Self {
        Self {
            map: map.index,
            reduce: reduce.index,
            combine: 0,
            marker: PhantomData,
        }
    }

    pub fn with_combine<C>(mut self, combine: CombineToken<C>) -> Self
    where
        C: Combiner<Key = M::Key, Value = M::Value>,
    {
        self.combine = combine.index;
        self
    }
}

/// The per-rank handler table. Immutable once the engine is initialized.
pub struct Registry {
    handlers: Vec<Handler>,
    entries: Vec<(&'static str, &'static str)>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            handlers: vec![Handler::Reserved],
            entries: Vec::new(),
        }
    }

    pub fn register_mapper<M>(&mut self) -> MapToken<M>
    where
        M: Mapper + 'static,
    {
        let index = self.push("map", type_name::<M>(), Handler::Map(make_map_handler::<M>()));
        MapToken {
            index,
            marker: PhantomData,
        }
    }

    pub fn register_reducer<R>(&mut self) -> ReduceToken<R>
    where
        R: Reducer + 'static,
    {
        let index = self.push(
            "reduce",
            type_name::<R>(),
            Handler::Reduce(make_reduce_handler::<R>()),
        );
        ReduceToken {
            index,
            marker: PhantomData,
        }
    }

    pub fn register_combiner<C>(&mut self) -> CombineToken<C>
    where
        C: Combiner + 'static,
    {
        let index = self.push(
            "combine",
            type_name::<C>(),
            Handler::Combine(make_combine_handler::<C>()),
        );
        CombineToken {
            index,
            marker: PhantomData,
        }
    }

    fn push(&mut self, kind: &'static str, name: &'static str, handler: Handler) -> u16 {
        let index = self.handlers.len();
        assert!(index <= usize::from(u16::MAX), "handler table overflow");
        debug!(index, kind, name, "registered handler");
        self.handlers.push(handler);
        self.entries.push((kind, name));
        index as u16
    }

    /// FNV hash of the ordered registration list, exchanged at startup to
    /// catch ranks that registered a different list.
    pub fn digest(&self) -> u64 {
        let mut hasher = fnv::FnvHasher::with_key(0);
        for (kind, name) in &self.entries {
            hasher.write(kind.as_bytes());
            hasher.write(name.as_bytes());
        }
        hasher.finish()
    }

    /// Number of registered handlers, excluding the reserved slot.
    pub fn len(&self) -> usize {
        self.handlers.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn map_handler(&self, index: u16) -> Result<&MapHandler> {
        match self.handlers.get(usize::from(index)) {
            Some(Handler::Map(handler)) => Ok(handler),
            Some(_) => bail!("handler {index} is not a map handler"),
            None => bail!("map handler index {index} out of range"),
        }
    }

    pub(crate) fn reduce_handler(&self, index: u16) -> Result<&ReduceHandler> {
        match self.handlers.get(usize::from(index)) {
            Some(Handler::Reduce(handler)) => Ok(handler),
            Some(_) => bail!("handler {index} is not a reduce handler"),
            None => bail!("reduce handler index {index} out of range"),
        }
    }

    pub(crate) fn combine_handler(&self, index: u16) -> Result<&CombineHandler> {
        match self.handlers.get(usize::from(index)) {
            Some(Handler::Combine(handler)) => Ok(handler),
            Some(_) => bail!("handler {index} is not a combine handler"),
            None => bail!("combine handler index {index} out of range"),
        }
    }
}

/// Run a phase's setup hook if side data has been broadcast for it, then
/// rewind the stream so later executions re-read the same bytes.
fn apply_side_data<V: Wire>(side: &mut ByteStream, apply: impl FnOnce(V)) -> Result<()> {
    if side.is_empty() {
        return Ok(());
    }
    apply(V::decode(side)?);
    side.rewind();
    Ok(())
}

fn make_map_handler<M>() -> MapHandler
where
    M: Mapper + 'static,
{
    Box::new(|input, side, ranks| {
        let mut mapper = M::default();
        apply_side_data(side, |value| mapper.setup(value))?;

        // A shard that was never scattered reads as zero items.
        let count = if input.is_empty() {
            0
        } else {
            u64::decode(input)? as usize
        };

        let mut buckets: Vec<Vec<(M::Key, M::Value)>> = (0..ranks).map(|_| Vec::new()).collect();
        let mut emitted = Vec::new();
        for _ in 0..count {
            let item = <M::Input as Wire>::decode(input)?;
            mapper.map(item, &mut emitted);
            for (key, value) in emitted.drain(..) {
                let dest = partition(&key, ranks);
                buckets[dest].push((key, value));
            }
        }
        // leave the shard replayable for jobs that reuse resident input
        input.rewind();

        debug!(
            pairs = buckets.iter().map(Vec::len).sum::<usize>(),
            "map phase complete"
        );
        Ok(Box::new(buckets) as Staged)
    })
}

fn make_combine_handler<C>() -> CombineHandler
where
    C: Combiner + 'static,
{
    Box::new(|side, staged| {
        let mut combiner = C::default();
        apply_side_data(side, |value| combiner.setup(value))?;

        let mut buckets = staged
            .downcast::<Vec<Vec<(C::Key, C::Value)>>>()
            .map_err(|_| anyhow!("combine stage received pair data of a different job shape"))?;

        // each destination bucket pre-aggregates independently
        for bucket in buckets.iter_mut() {
            let grouped: HashMap<C::Key, Vec<C::Value>> = bucket.drain(..).into_group_map();
            let mut folded = Vec::with_capacity(grouped.len());
            for (key, values) in grouped {
                folded.push(combiner.combine(key, values));
            }
            *bucket = folded;
        }

        debug!(
            pairs = buckets.iter().map(Vec::len).sum::<usize>(),
            "combine phase complete"
        );
        Ok(buckets)
    })
}

fn make_reduce_handler<R>() -> ReduceHandler
where
    R: Reducer + 'static,
{
    Box::new(|side, staged, exchange| {
        let buckets = staged
            .downcast::<Vec<Vec<(R::Key, R::Value)>>>()
            .map_err(|_| anyhow!("reduce stage received pair data of a different job shape"))?;

        let mut outgoing = Vec::with_capacity(buckets.len());
        for bucket in *buckets {
            let mut bs = ByteStream::new();
            bucket.encode(&mut bs);
            outgoing.push(bs);
        }
        let incoming = exchange(outgoing)?;

        let mut reducer = R::default();
        apply_side_data(side, |value| reducer.setup(value))?;

        let mut pairs: Vec<(R::Key, R::Value)> = Vec::new();
        for mut bs in incoming {
            pairs.extend(Vec::<(R::Key, R::Value)>::decode(&mut bs)?);
        }

        let grouped: HashMap<R::Key, Vec<R::Value>> = pairs.into_iter().into_group_map();
        let mut results = Vec::with_capacity(grouped.len());
        for (key, values) in grouped {
            results.push(reducer.reduce(key, values));
        }

        debug!(results = results.len(), "reduce phase complete");
        let mut out = ByteStream::new();
        results.encode(&mut out);
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Identity;

    impl Mapper for Identity {
        type Input = u64;
        type Key = u64;
        type Value = u64;
        type SideData = ();

        fn map(&mut self, item: u64, out: &mut Vec<(u64, u64)>) {
            out.push((item, 1));
        }
    }

    impl Reducer for Identity {
        type Key = u64;
        type Value = u64;
        type Output = (u64, u64);
        type SideData = ();

        fn reduce(&mut self, key: u64, values: Vec<u64>) -> (u64, u64) {
            (key, values.into_iter().sum())
        }
    }

    impl Combiner for Identity {
        type Key = u64;
        type Value = u64;
        type SideData = ();

        fn combine(&mut self, key: u64, values: Vec<u64>) -> (u64, u64) {
            (key, values.into_iter().sum())
        }
    }

    #[test]
    fn registration_order_assigns_sequential_indices() {
        let mut registry = Registry::new();
        let m = registry.register_mapper::<Identity>();
        let r = registry.register_reducer::<Identity>();
        let c = registry.register_combiner::<Identity>();
        assert_eq!((m.index, r.index, c.index), (1, 2, 3));
        assert_eq!(registry.len(), 3);

        let shape = JobShape::new(m, r).with_combine(c);
        assert_eq!((shape.map, shape.reduce, shape.combine), (1, 2, 3));
    }

    #[test]
    fn digest_is_sensitive_to_registration_order() {
        let mut forward = Registry::new();
        forward.register_mapper::<Identity>();
        forward.register_reducer::<Identity>();

        let mut reversed = Registry::new();
        reversed.register_reducer::<Identity>();
        reversed.register_mapper::<Identity>();

        let mut same = Registry::new();
        same.register_mapper::<Identity>();
        same.register_reducer::<Identity>();

        assert_eq!(forward.digest(), same.digest());
        assert_ne!(forward.digest(), reversed.digest());
    }

    #[test]
    fn handler_lookup_checks_kind_and_range() {
        let mut registry = Registry::new();
        let m = registry.register_mapper::<Identity>();
        assert!(registry.map_handler(m.index).is_ok());
        assert!(registry.reduce_handler(m.index).is_err());
        assert!(registry.map_handler(0).is_err());
        assert!(registry.map_handler(9).is_err());
    }
}
