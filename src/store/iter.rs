//! Closeable iterators and the dual-tier chaining combinator.
//!
//! Tier iterators hold engine resources (region snapshots, swap file handles)
//! that must be released with [`CloseableIterator::close`]. Items are
//! `Result`s because decoding or reading the next element can fail.

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::store::entry::TierKind;

/// An iterator over tier contents that owns releasable engine resources.
pub trait CloseableIterator<T>: Iterator<Item = Result<T>> + Send {
    /// Release the underlying resources. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Remove the element most recently returned by `next`.
    fn remove(&mut self) -> Result<()> {
        Err(StoreError::Unsupported("remove"))
    }
}

pub type BoxedIter<T> = Box<dyn CloseableIterator<T>>;

/// An iterator with nothing in it.
pub fn empty<T: Send + 'static>() -> BoxedIter<T> {
    Box::new(Empty(std::marker::PhantomData))
}

struct Empty<T>(std::marker::PhantomData<fn() -> T>);

impl<T> Iterator for Empty<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        None
    }
}

impl<T> CloseableIterator<T> for Empty<T> {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens the secondary sequence once the primary is exhausted.
pub type SecondaryFactory<T> = Box<dyn FnOnce() -> Result<BoxedIter<T>> + Send>;

/// Removes an element from the tier that produced it.
pub type TierRemover<T> = Box<dyn FnMut(TierKind, &T) -> Result<()> + Send>;

/// Chains two tier sequences: everything from the off-heap tier, then
/// everything from the swap tier.
///
/// The next element is always fetched ahead of time, so [`has_next`] never
/// touches a tier. The exhausted primary is closed before the secondary is
/// opened.
///
/// [`has_next`]: DualTierIterator::has_next
pub struct DualTierIterator<T> {
    current: BoxedIter<T>,
    current_tier: TierKind,
    secondary: Option<SecondaryFactory<T>>,
    lookahead: Option<(TierKind, Result<T>)>,
    last: Option<(TierKind, T)>,
    remover: Option<TierRemover<T>>,
    done: bool,
}

impl<T: Clone + Send + 'static> DualTierIterator<T> {
    /// Chain `primary` (off-heap) with the sequence `secondary` (swap) opens.
    pub fn new(primary: BoxedIter<T>, secondary: SecondaryFactory<T>) -> Result<Self> {
        let mut it = Self {
            current: primary,
            current_tier: TierKind::OffHeap,
            secondary: Some(secondary),
            lookahead: None,
            last: None,
            remover: None,
            done: false,
        };
        it.advance()?;
        Ok(it)
    }

    /// Enable element removal, routed by producing tier.
    pub fn with_remover(mut self, remover: TierRemover<T>) -> Self {
        self.remover = Some(remover);
        self
    }

    /// Whether another element is available.
    pub fn has_next(&self) -> bool {
        !self.done
    }

    /// Tier that will produce the next element, if any.
    pub fn next_tier(&self) -> Option<TierKind> {
        self.lookahead.as_ref().map(|(tier, _)| *tier)
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            if let Some(item) = self.current.next() {
                self.lookahead = Some((self.current_tier, item));
                return Ok(());
            }

            self.current.close()?;

            match self.secondary.take() {
                Some(open) => {
                    debug!("Off-heap sequence exhausted, switching to swap");
                    self.current = open()?;
                    self.current_tier = TierKind::Swap;
                }
                None => {
                    self.done = true;
                    self.lookahead = None;
                    return Ok(());
                }
            }
        }
    }
}

impl<T: Clone + Send + 'static> Iterator for DualTierIterator<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let (tier, item) = self.lookahead.take()?;

        if let Err(e) = self.advance() {
            self.done = true;
            return Some(Err(e));
        }

        match item {
            Ok(value) => {
                if self.remover.is_some() {
                    self.last = Some((tier, value.clone()));
                }
                Some(Ok(value))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl<T: Clone + Send + 'static> CloseableIterator<T> for DualTierIterator<T> {
    fn close(&mut self) -> Result<()> {
        self.done = true;
        self.lookahead = None;
        self.secondary = None;
        self.current.close()
    }

    fn remove(&mut self) -> Result<()> {
        let remover = self
            .remover
            .as_mut()
            .ok_or(StoreError::Unsupported("remove on partition iterator"))?;

        let (tier, value) = self
            .last
            .take()
            .ok_or(StoreError::IllegalState("next() not called or element already removed"))?;

        remover(tier, &value)
    }
}

/// One tier's sequence, with removal routed back to that tier.
pub struct TierIter<T> {
    inner: BoxedIter<T>,
    tier: TierKind,
    last: Option<T>,
    remover: TierRemover<T>,
}

impl<T: Clone + Send + 'static> TierIter<T> {
    pub fn new(inner: BoxedIter<T>, tier: TierKind, remover: TierRemover<T>) -> Self {
        Self {
            inner,
            tier,
            last: None,
            remover,
        }
    }
}

impl<T: Clone + Send + 'static> Iterator for TierIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        if let Ok(value) = &item {
            self.last = Some(value.clone());
        }
        Some(item)
    }
}

impl<T: Clone + Send + 'static> CloseableIterator<T> for TierIter<T> {
    fn close(&mut self) -> Result<()> {
        self.last = None;
        self.inner.close()
    }

    fn remove(&mut self) -> Result<()> {
        let value = self
            .last
            .take()
            .ok_or(StoreError::IllegalState("next() not called or element already removed"))?;
        (self.remover)(self.tier, &value)
    }
}

/// Adapts a plain vector into a closeable iterator. Used by engines that
/// snapshot their contents.
pub struct VecIter<T> {
    items: std::vec::IntoIter<T>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> VecIter<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter(),
            on_close: None,
        }
    }

    /// Run `f` exactly once when the iterator is closed or dropped.
    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }
}

impl<T> Iterator for VecIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next().map(Ok)
    }
}

impl<T: Send> CloseableIterator<T> for VecIter<T> {
    fn close(&mut self) -> Result<()> {
        if let Some(f) = self.on_close.take() {
            f();
        }
        Ok(())
    }
}

impl<T> Drop for VecIter<T> {
    fn drop(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}
