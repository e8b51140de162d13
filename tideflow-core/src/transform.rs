//! Stateless transform processors: map, filter, flat-map.
//!
//! All three are the same machine: [`TransformP`] expands each input item
//! into a [`Traverser`] and drains it into the outbox. When the outbox
//! refuses, the traverser is kept and drained further on the next callback,
//! so a single expensive expansion never has to restart. Watermarks and
//! barriers are forwarded in arrival order, after any pending expansion.

use std::marker::PhantomData;

use anyhow::Result;

use crate::inbox::Inbox;
use crate::outbox::Outbox;
use crate::processor::{Context, Processor};
use crate::traverser::{SingletonTraverser, Traverser};
use crate::types::{StreamData, StreamItem};

/// Flat-mapping processor: one input item, zero or more output items.
pub struct TransformP<T, R, F, Tr> {
    mapper: F,
    /// Expansion of the last polled item, kept across callbacks while the
    /// outbox applies backpressure.
    pending: Option<Tr>,
    _marker: PhantomData<fn(&T) -> R>,
}

impl<T, R, F, Tr> TransformP<T, R, F, Tr>
where
    T: StreamData,
    R: StreamData,
    F: FnMut(&T) -> Tr + Send,
    Tr: Traverser<Item = R> + Send,
{
    /// Create a transform processor from an item-to-traverser mapper.
    pub fn new(mapper: F) -> Self {
        Self {
            mapper,
            pending: None,
            _marker: PhantomData,
        }
    }

    /// Drain the pending traverser. Returns `Ok(false)` on backpressure;
    /// the head item it expands stays in the inbox until this succeeds.
    fn drain_pending(&mut self, outbox: &mut Outbox<R>) -> Result<bool> {
        if !outbox.retry_broadcast()? {
            return Ok(false);
        }
        if let Some(traverser) = self.pending.as_mut() {
            while let Some(out) = traverser.next() {
                if !outbox.broadcast(StreamItem::Data(out))? {
                    return Ok(false);
                }
            }
            self.pending = None;
        }
        Ok(true)
    }
}

impl<T, R, F, Tr> Processor for TransformP<T, R, F, Tr>
where
    T: StreamData,
    R: StreamData,
    F: FnMut(&T) -> Tr + Send,
    Tr: Traverser<Item = R> + Send,
{
    type In = T;
    type Out = R;

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<StreamItem<T>>,
        outbox: &mut Outbox<R>,
        _ctx: &Context,
    ) -> Result<()> {
        loop {
            // Resume the expansion of the head item, if one is suspended.
            // The head leaves the inbox only once fully expanded, so a
            // snapshot can never catch a half-drained traverser.
            if self.pending.is_some() {
                if !self.drain_pending(outbox)? {
                    return Ok(());
                }
                inbox.poll();
                continue;
            }
            if !outbox.retry_broadcast()? {
                return Ok(());
            }
            match inbox.peek() {
                None => return Ok(()),
                Some(StreamItem::Data(item)) => {
                    self.pending = Some((self.mapper)(item));
                }
                Some(StreamItem::Watermark(wm)) => {
                    let wm = *wm;
                    inbox.poll();
                    if !outbox.broadcast(StreamItem::Watermark(wm))? {
                        return Ok(());
                    }
                }
                Some(StreamItem::Barrier(barrier)) => {
                    let barrier = *barrier;
                    inbox.poll();
                    if !outbox.broadcast(StreamItem::Barrier(barrier))? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn try_process(&mut self, outbox: &mut Outbox<R>, _ctx: &Context) -> Result<bool> {
        self.drain_pending(outbox)
    }

    fn complete(&mut self, outbox: &mut Outbox<R>, _ctx: &Context) -> Result<bool> {
        self.drain_pending(outbox)
    }

    // Stateless: the default no-op snapshot hooks apply.
    fn restore_snapshot(
        &mut self,
        _inbox: &mut Inbox<crate::outbox::SnapshotEntry>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Emit `f(item)` when it returns `Some`, nothing otherwise.
pub fn map<T, R, F>(
    mut f: F,
) -> TransformP<T, R, impl FnMut(&T) -> SingletonTraverser<R> + Send, SingletonTraverser<R>>
where
    T: StreamData,
    R: StreamData,
    F: FnMut(&T) -> Option<R> + Send + 'static,
{
    TransformP::new(move |item: &T| SingletonTraverser::of(f(item)))
}

/// Emit `item` iff the predicate holds.
pub fn filter<T, P>(
    mut predicate: P,
) -> TransformP<T, T, impl FnMut(&T) -> SingletonTraverser<T> + Send, SingletonTraverser<T>>
where
    T: StreamData,
    P: FnMut(&T) -> bool + Send + 'static,
{
    TransformP::new(move |item: &T| {
        SingletonTraverser::of(predicate(item).then(|| item.clone()))
    })
}

/// Expand each item through the given item-to-traverser mapper.
pub fn flat_map<T, R, F, Tr>(mapper: F) -> TransformP<T, R, F, Tr>
where
    T: StreamData,
    R: StreamData,
    F: FnMut(&T) -> Tr + Send,
    Tr: Traverser<Item = R> + Send,
{
    TransformP::new(mapper)
}

/// Consumes all input and emits nothing; markers are still forwarded.
pub struct NoopP<T> {
    _marker: PhantomData<fn(&T)>,
}

/// Create a processor that swallows its input.
pub fn noop<T: StreamData>() -> NoopP<T> {
    NoopP {
        _marker: PhantomData,
    }
}

impl<T: StreamData> Processor for NoopP<T> {
    type In = T;
    type Out = T;

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<StreamItem<T>>,
        outbox: &mut Outbox<T>,
        _ctx: &Context,
    ) -> Result<()> {
        loop {
            if !outbox.retry_broadcast()? {
                return Ok(());
            }
            match inbox.poll() {
                None => return Ok(()),
                Some(StreamItem::Data(_)) => {}
                Some(marker) => {
                    if !outbox.broadcast(marker)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn restore_snapshot(
        &mut self,
        _inbox: &mut Inbox<crate::outbox::SnapshotEntry>,
    ) -> Result<()> {
        Ok(())
    }
}
