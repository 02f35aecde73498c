//! Device-number range map.
//!
//! Maps ranges of [`DevT`] numbers to [`Resolver`]s that turn a number into
//! a live object (a character or block device, typically). Ranges may
//! overlap; the narrowest range containing a number is asked first.
//!
//! The table is split into 255 buckets keyed by major number. Each bucket
//! keeps its entries sorted by ascending range length, newest first among
//! equal lengths. Resolvers run without the table lock, pinned through their
//! owning [`Module`], and may themselves add or remove ranges.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use hadron_core::kdebug;
use hadron_core::sync::{Condvar, SpinLock};

use crate::error::{DriverError, KobjMapError};

/// Number of buckets in a [`KobjMap`].
pub const BUCKETS: usize = 255;

/// A device number: 12-bit major, 20-bit minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevT(u32);

impl DevT {
    /// Bits used by the minor number.
    pub const MINOR_BITS: u32 = 20;
    /// Mask selecting the minor number.
    pub const MINOR_MASK: u32 = (1 << Self::MINOR_BITS) - 1;

    /// Builds a device number. Out-of-range parts are truncated.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self((major << Self::MINOR_BITS) | (minor & Self::MINOR_MASK))
    }

    /// Wraps a raw device number.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw device number.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the major number.
    pub const fn major(self) -> u32 {
        self.0 >> Self::MINOR_BITS
    }

    /// Returns the minor number.
    pub const fn minor(self) -> u32 {
        self.0 & Self::MINOR_MASK
    }
}

impl fmt::Display for DevT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

/// Turns device numbers into objects.
pub trait Resolver<T>: Send + Sync {
    /// Returns the object for `dev`, or `None` to decline.
    ///
    /// `index` is the offset of `dev` from the start of the range this
    /// resolver was registered for. Runs without the table lock.
    fn probe(&self, dev: DevT, index: u32) -> Option<T>;

    /// Gate run with the table lock held before [`probe`](Self::probe).
    ///
    /// # Errors
    ///
    /// An error skips this resolver for the current lookup.
    fn lock(&self, dev: DevT) -> Result<(), DriverError> {
        let _ = dev;
        Ok(())
    }
}

impl<T, F> Resolver<T> for F
where
    F: Fn(DevT, u32) -> Option<T> + Send + Sync,
{
    fn probe(&self, dev: DevT, index: u32) -> Option<T> {
        self(dev, index)
    }
}

// ---------------------------------------------------------------------------
// Module pinning
// ---------------------------------------------------------------------------

/// Owner of registered resolvers.
///
/// Lookups pin the owner while its resolver runs. [`unload`](Self::unload)
/// stops new pins and waits for running resolvers to finish.
pub struct Module {
    name: String,
    live: AtomicBool,
    refs: SpinLock<usize>,
    drained: Condvar,
}

impl Module {
    /// Creates a live module.
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            live: AtomicBool::new(true),
            refs: SpinLock::named("module_refs", 0),
            drained: Condvar::new(),
        })
    }

    /// Returns the module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` until [`unload`](Self::unload) starts.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Returns the number of active pins.
    pub fn refs(&self) -> usize {
        *self.refs.lock()
    }

    /// Pins the module, unless it is unloading.
    pub fn try_get(self: &Arc<Self>) -> Option<ModuleRef> {
        let mut refs = self.refs.lock();
        if !self.is_live() {
            return None;
        }
        *refs += 1;
        Some(ModuleRef {
            module: Arc::clone(self),
        })
    }

    /// Refuses new pins and waits until every existing pin is dropped.
    pub fn unload(&self) {
        self.live.store(false, Ordering::Release);
        let _drained = self.drained.wait_while(self.refs.lock(), |n| *n != 0);
        kdebug!("module {}: unloaded", self.name);
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

/// A pin on a [`Module`], released on drop.
pub struct ModuleRef {
    module: Arc<Module>,
}

impl Drop for ModuleRef {
    fn drop(&mut self) {
        *self.module.refs.lock() -= 1;
        self.module.drained.notify_all();
    }
}

// ---------------------------------------------------------------------------
// The map
// ---------------------------------------------------------------------------

struct Probe<T> {
    start: u32,
    length: u32,
    owner: Option<Arc<Module>>,
    resolver: Arc<dyn Resolver<T>>,
}

impl<T> Probe<T> {
    fn contains(&self, dev: DevT) -> bool {
        let dev = u64::from(dev.raw());
        let start = u64::from(self.start);
        dev >= start && dev < start + u64::from(self.length)
    }
}

/// A map from device-number ranges to resolvers.
pub struct KobjMap<T> {
    buckets: SpinLock<Vec<Vec<Arc<Probe<T>>>>>,
}

/// Buckets touched by the range `[start, start + length)`.
fn bucket_span(start: u32, length: u32) -> impl Iterator<Item = usize> {
    let first = DevT::from_raw(start).major();
    let last_dev = u64::from(start) + u64::from(length) - 1;
    let last = u32::try_from(last_dev).map_or(u32::MAX, |d| DevT::from_raw(d).major());
    let count = usize::try_from(last - first + 1).map_or(BUCKETS, |n| n.min(BUCKETS));
    (0..count).map(move |i| (first as usize + i) % BUCKETS)
}

fn validate(start: u32, length: u32) -> Result<(), KobjMapError> {
    if length == 0 || u64::from(start) + u64::from(length) - 1 > u64::from(u32::MAX) {
        return Err(KobjMapError::InvalidRange);
    }
    Ok(())
}

impl<T: 'static> KobjMap<T> {
    /// Creates a map whose base resolver covers every number from 1 up.
    pub fn new(base: impl Resolver<T> + 'static) -> Self {
        let base: Arc<Probe<T>> = Arc::new(Probe {
            start: 1,
            length: u32::MAX,
            owner: None,
            resolver: Arc::new(base),
        });
        let buckets: Vec<Vec<_>> = (0..BUCKETS).map(|_| alloc::vec![Arc::clone(&base)]).collect();
        Self {
            buckets: SpinLock::named("kobj_map", buckets),
        }
    }

    /// Registers `resolver` for `[start, start + length)`.
    ///
    /// # Errors
    ///
    /// [`KobjMapError::InvalidRange`] for an empty range or one running past
    /// the end of the number space, [`KobjMapError::OutOfMemory`] if the
    /// bucket entries could not be allocated.
    pub fn add(
        &self,
        start: DevT,
        length: u32,
        resolver: impl Resolver<T> + 'static,
        owner: Option<&Arc<Module>>,
    ) -> Result<(), KobjMapError> {
        validate(start.raw(), length)?;
        let probe = Arc::new(Probe {
            start: start.raw(),
            length,
            owner: owner.cloned(),
            resolver: Arc::new(resolver),
        });

        let mut buckets = self.buckets.lock();
        for index in bucket_span(start.raw(), length) {
            buckets[index]
                .try_reserve(1)
                .map_err(|_| KobjMapError::OutOfMemory)?;
        }
        for index in bucket_span(start.raw(), length) {
            let bucket = &mut buckets[index];
            let pos = bucket
                .iter()
                .position(|p| p.length >= length)
                .unwrap_or(bucket.len());
            bucket.insert(pos, Arc::clone(&probe));
        }
        Ok(())
    }

    /// Removes the range registered as `[start, start + length)`.
    ///
    /// Returns `false` if no such range was registered. Resolver calls
    /// already in flight keep their resolver alive until they return.
    pub fn remove(&self, start: DevT, length: u32) -> bool {
        if validate(start.raw(), length).is_err() {
            return false;
        }
        let mut removed = Vec::new();
        {
            let mut buckets = self.buckets.lock();
            for index in bucket_span(start.raw(), length) {
                let bucket = &mut buckets[index];
                if let Some(pos) = bucket
                    .iter()
                    .position(|p| p.start == start.raw() && p.length == length)
                {
                    removed.push(bucket.remove(pos));
                }
            }
        }
        // Resolvers are dropped after the lock.
        !removed.is_empty()
    }

    /// Resolves `dev` to an object.
    ///
    /// Ranges containing `dev` are asked narrowest first. When a resolver
    /// declines, the walk restarts from the head of the bucket, since the
    /// resolver may have changed the table, and only considers ranges
    /// strictly narrower than the one that declined.
    pub fn lookup(&self, dev: DevT) -> Option<T> {
        let index = dev.major() as usize % BUCKETS;
        let mut best = u32::MAX;
        loop {
            let (resolver, pin, offset) = self.next_candidate(index, dev, &mut best)?;
            let found = resolver.probe(dev, offset);
            drop(pin);
            if found.is_some() {
                return found;
            }
        }
    }

    /// Picks the next resolver to ask, pinning its owner. Only ranges
    /// narrower than `best` qualify; `best` is narrowed to the pick.
    fn next_candidate(
        &self,
        index: usize,
        dev: DevT,
        best: &mut u32,
    ) -> Option<(Arc<dyn Resolver<T>>, Option<ModuleRef>, u32)> {
        let buckets = self.buckets.lock();
        for probe in &buckets[index] {
            if !probe.contains(dev) {
                continue;
            }
            if probe.length - 1 >= *best {
                break;
            }
            let pin = match &probe.owner {
                Some(owner) => match owner.try_get() {
                    Some(pin) => Some(pin),
                    None => continue,
                },
                None => None,
            };
            *best = probe.length - 1;
            if probe.resolver.lock(dev).is_err() {
                continue;
            }
            return Some((Arc::clone(&probe.resolver), pin, dev.raw() - probe.start));
        }
        None
    }
}

impl<T> fmt::Debug for KobjMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: usize = self.buckets.lock().iter().map(Vec::len).sum();
        f.debug_struct("KobjMap").field("entries", &entries).finish()
    }
}
