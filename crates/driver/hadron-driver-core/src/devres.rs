//! Device-managed resources.
//!
//! Every [`Device`] owns an append-ordered store of resource records. A record
//! is a payload implementing [`Releasable`]; the payload's concrete type plays
//! the role of the release callback, so lookups ask for "the newest record of
//! type `R`". When the device's driver goes away (or a probe fails) the whole
//! store is released newest-first, so teardown mirrors setup.
//!
//! Group markers checkpoint the store. [`Device::devres_release_group`]
//! releases everything registered after a group was opened (and before it was
//! closed), including nested groups that lie wholly inside that range.
//!
//! # Locking
//!
//! The store is protected by an [`IrqSpinLock`] because resources may be
//! added or removed from contexts that cannot block. Matcher closures run
//! under that lock and must not touch the same device's store. Release
//! callbacks always run after the lock is dropped, so they may register or
//! remove other resources.


use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use hadron_core::sync::IrqSpinLock;
use hadron_core::{kbug, kwarn_on};

use crate::device::Device;
use crate::error::DevresError;

bitflags! {
    /// Allocation urgency forwarded with each registration.
    ///
    /// The flags are stored on the record and shown in devres traces. The
    /// store itself only acts on [`ATOMIC`](Self::ATOMIC), and only for its
    /// own bookkeeping slot: the payload is boxed by the global allocator
    /// either way. `ZERO` is carried for the payload's owner and ignored here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// The allocation may block until memory is available.
        const WAIT = 1 << 0;
        /// The allocation must not block; it fails instead.
        const ATOMIC = 1 << 1;
        /// Zero the allocation.
        const ZERO = 1 << 2;
    }
}

impl AllocFlags {
    /// Normal process-context allocation.
    pub const KERNEL: Self = Self::WAIT;
}

/// A payload that can be tracked by a device's resource store.
///
/// `release` is called exactly once, with the owning device, when the record
/// is released (driver unbind, failed probe, group release or
/// [`Device::devres_destroy`]). A record taken back with
/// [`Device::devres_remove`] is never released by the store.
pub trait Releasable: Send + 'static {
    /// Frees whatever this record stands for.
    fn release(self: Box<Self>, dev: &Device);
}

/// Matcher accepting every record of the requested type.
pub fn any<R>(_: &R) -> bool {
    true
}

/// Type-erased view of a [`Releasable`] used inside the store.
trait DevresEntry: Send {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn release_entry(self: Box<Self>, dev: &Device);
    fn type_name(&self) -> &'static str;
}

impl<R: Releasable> DevresEntry for R {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn release_entry(self: Box<Self>, dev: &Device) {
        self.release(dev);
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<R>()
    }
}

/// Identifier of a resource group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(usize);

impl GroupId {
    /// Creates a caller-chosen group id.
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Shared state of a group's open and close markers.
///
/// Only touched with the store lock held.
struct Group {
    id: GroupId,
    closed: AtomicBool,
    /// Number of this group's markers seen during a range release; an open
    /// group's single marker counts twice.
    coverage: AtomicU8,
}

struct Record {
    entry: Box<dyn DevresEntry>,
    flags: AllocFlags,
}

enum DevresNode {
    Resource(Record),
    GroupOpen(Arc<Group>),
    GroupClose(Arc<Group>),
}

impl DevresNode {
    fn group(&self) -> Option<&Arc<Group>> {
        match self {
            Self::Resource(_) => None,
            Self::GroupOpen(grp) | Self::GroupClose(grp) => Some(grp),
        }
    }

    fn entry_of<R: Releasable>(&self) -> Option<&R> {
        match self {
            Self::Resource(rec) => rec.entry.as_any().downcast_ref::<R>(),
            _ => None,
        }
    }
}

/// Per-device resource store.
pub(crate) struct DevresStore {
    nodes: IrqSpinLock<Vec<DevresNode>>,
}

impl DevresStore {
    pub(crate) const fn new() -> Self {
        Self {
            nodes: IrqSpinLock::named("devres_lock", Vec::new()),
        }
    }
}

/// Appends `node`, honouring the allocation urgency.
fn push_node(
    nodes: &mut Vec<DevresNode>,
    node: DevresNode,
    flags: AllocFlags,
) -> Result<(), DevresError> {
    if flags.contains(AllocFlags::ATOMIC) {
        nodes
            .try_reserve(1)
            .map_err(|_| DevresError::OutOfMemory)?;
    }
    nodes.push(node);
    Ok(())
}

/// Returns the newest group matching `id`, or the newest open group if `id`
/// is `None`.
fn find_group(nodes: &[DevresNode], id: Option<GroupId>) -> Option<Arc<Group>> {
    nodes.iter().rev().filter_map(DevresNode::group).find_map(|grp| {
        let hit = match id {
            Some(id) => grp.id == id,
            None => !grp.closed.load(Ordering::Relaxed),
        };
        hit.then(|| Arc::clone(grp))
    })
}

fn position_of(nodes: &[DevresNode], grp: &Arc<Group>, open: bool) -> Option<usize> {
    nodes.iter().position(|node| match node {
        DevresNode::GroupOpen(g) if open => Arc::ptr_eq(g, grp),
        DevresNode::GroupClose(g) if !open => Arc::ptr_eq(g, grp),
        _ => false,
    })
}

/// Detaches the records in `nodes[first..end]` that a range release must
/// free and appends them to `todo` in store order.
///
/// Plain records always go. A group goes only when it lies wholly inside
/// the range: both markers for a closed group, the open marker alone for a
/// group that was never closed. Markers of partially covered groups stay in
/// the store. Returns the number of plain records detached.
fn remove_nodes(
    nodes: &mut Vec<DevresNode>,
    first: usize,
    end: usize,
    todo: &mut Vec<DevresNode>,
) -> usize {
    let mut markers = Vec::new();
    let mut count = 0;

    // First pass: move plain records out and reset group coverage.
    for node in nodes.drain(first..end) {
        match node.group() {
            Some(grp) => {
                grp.coverage.store(0, Ordering::Relaxed);
                markers.push(node);
            }
            None => {
                todo.push(node);
                count += 1;
            }
        }
    }
    if markers.is_empty() {
        return count;
    }

    // Second pass: count how many of each group's markers are in range.
    for node in &markers {
        let Some(grp) = node.group() else { continue };
        let mut coverage = grp.coverage.load(Ordering::Relaxed) + 1;
        if !grp.closed.load(Ordering::Relaxed) {
            coverage += 1;
        }
        if coverage > 2 {
            kbug!("devres: group {} marker seen {} times", grp.id, coverage);
        }
        grp.coverage.store(coverage, Ordering::Relaxed);
    }

    let mut kept = Vec::new();
    for node in markers {
        let covered = node
            .group()
            .is_some_and(|grp| grp.coverage.load(Ordering::Relaxed) == 2);
        match node {
            DevresNode::GroupOpen(_) if covered => todo.push(node),
            // The close marker of a covered group is simply dropped.
            DevresNode::GroupClose(_) if covered => {}
            _ => kept.push(node),
        }
    }
    nodes.splice(first..first, kept);
    count
}

/// Frees detached records newest-first. Must be called without the lock.
fn release_nodes(dev: &Device, todo: Vec<DevresNode>) {
    for node in todo.into_iter().rev() {
        if let DevresNode::Resource(rec) = node {
            devres_log(dev, "REL", rec.entry.type_name(), rec.flags);
            rec.entry.release_entry(dev);
        }
    }
}

#[cfg(hadron_devres_debug)]
fn devres_log(dev: &Device, op: &str, name: &str, flags: AllocFlags) {
    hadron_core::kdebug!("{}: DEVRES {} {} ({:?})", dev.name(), op, name, flags);
}

#[cfg(not(hadron_devres_debug))]
fn devres_log(_dev: &Device, _op: &str, _name: &str, _flags: AllocFlags) {}

impl Device {
    /// Registers `res` with this device's resource store.
    ///
    /// With [`AllocFlags::ATOMIC`] the record's slot in the store is reserved
    /// fallibly and a failure is returned instead of aborting. Boxing `res`
    /// is not covered.
    pub fn devres_add<R: Releasable>(&self, res: R, flags: AllocFlags) -> Result<(), DevresError> {
        let entry: Box<dyn DevresEntry> = Box::new(res);
        devres_log(self, "ADD", entry.type_name(), flags);
        let mut nodes = self.devres.nodes.lock();
        push_node(&mut nodes, DevresNode::Resource(Record { entry, flags }), flags)
    }

    /// Finds the newest record of type `R` accepted by `matcher` and returns
    /// what `read` extracts from it.
    pub fn devres_find<R, T>(
        &self,
        mut matcher: impl FnMut(&R) -> bool,
        read: impl FnOnce(&R) -> T,
    ) -> Option<T>
    where
        R: Releasable,
    {
        let nodes = self.devres.nodes.lock();
        nodes
            .iter()
            .rev()
            .filter_map(DevresNode::entry_of::<R>)
            .find(|res| matcher(res))
            .map(read)
    }

    /// Detaches the newest record of type `R` accepted by `matcher` and hands
    /// it back without releasing it.
    pub fn devres_remove<R: Releasable>(&self, mut matcher: impl FnMut(&R) -> bool) -> Option<Box<R>> {
        let node = {
            let mut nodes = self.devres.nodes.lock();
            let pos = nodes
                .iter()
                .rposition(|node| node.entry_of::<R>().is_some_and(&mut matcher))?;
            nodes.remove(pos)
        };
        let DevresNode::Resource(rec) = node else {
            kbug!("devres: matched a group marker as {}", core::any::type_name::<R>());
        };
        devres_log(self, "REM", rec.entry.type_name(), rec.flags);
        match rec.entry.into_any().downcast::<R>() {
            Ok(res) => Some(res),
            Err(_) => kbug!("devres: record is not a {}", core::any::type_name::<R>()),
        }
    }

    /// Detaches the newest record of type `R` accepted by `matcher` and
    /// releases it.
    ///
    /// # Errors
    ///
    /// Returns [`DevresError::NotFound`] if no record matched.
    pub fn devres_destroy<R: Releasable>(
        &self,
        matcher: impl FnMut(&R) -> bool,
    ) -> Result<(), DevresError> {
        let res = self.devres_remove::<R>(matcher).ok_or(DevresError::NotFound)?;
        res.release(self);
        Ok(())
    }

    /// Detaches the newest record of type `R` accepted by `matcher` and drops
    /// it without calling its release.
    ///
    /// # Errors
    ///
    /// Returns [`DevresError::NotFound`] if no record matched.
    pub fn devres_discard<R: Releasable>(
        &self,
        matcher: impl FnMut(&R) -> bool,
    ) -> Result<(), DevresError> {
        self.devres_remove::<R>(matcher)
            .map(drop)
            .ok_or(DevresError::NotFound)
    }

    /// Opens a new resource group.
    ///
    /// With `id == None` the group's own identity becomes its id, which is
    /// unique among live groups.
    ///
    /// # Errors
    ///
    /// Returns [`DevresError::OutOfMemory`] if an atomic allocation failed.
    pub fn devres_open_group(
        &self,
        id: Option<GroupId>,
        flags: AllocFlags,
    ) -> Result<GroupId, DevresError> {
        let grp = Arc::new_cyclic(|me: &Weak<Group>| Group {
            id: id.unwrap_or(GroupId(me.as_ptr().cast::<()>() as usize)),
            closed: AtomicBool::new(false),
            coverage: AtomicU8::new(0),
        });
        let gid = grp.id;
        let mut nodes = self.devres.nodes.lock();
        push_node(&mut nodes, DevresNode::GroupOpen(grp), flags)?;
        Ok(gid)
    }

    /// Closes the newest open group matching `id` (or the newest open group
    /// if `id` is `None`).
    ///
    /// Closing a group that is not open is a programmer error.
    pub fn devres_close_group(&self, id: Option<GroupId>) {
        let mut nodes = self.devres.nodes.lock();
        let grp = nodes.iter().rev().find_map(|node| match node {
            DevresNode::GroupOpen(grp)
                if !grp.closed.load(Ordering::Relaxed) && id.is_none_or(|id| grp.id == id) =>
            {
                Some(Arc::clone(grp))
            }
            _ => None,
        });
        let Some(grp) = grp else {
            drop(nodes);
            kwarn_on!(true, "{}: devres close of group {:?} which is not open", self.name(), id);
            return;
        };
        grp.closed.store(true, Ordering::Relaxed);
        // The marker is tiny; a failed reservation here cannot be reported
        // to the caller, so it takes the blocking path.
        nodes.push(DevresNode::GroupClose(grp));
    }

    /// Removes a group's markers, keeping the resources inside it.
    pub fn devres_remove_group(&self, id: Option<GroupId>) {
        let mut nodes = self.devres.nodes.lock();
        let Some(grp) = find_group(&nodes, id) else {
            drop(nodes);
            kwarn_on!(true, "{}: devres group {:?} not found", self.name(), id);
            return;
        };
        if let Some(pos) = position_of(&nodes, &grp, true) {
            nodes.remove(pos);
        }
        if let Some(pos) = position_of(&nodes, &grp, false) {
            nodes.remove(pos);
        }
    }

    /// Releases every record registered inside the group matching `id` (or
    /// the newest open group if `id` is `None`), plus the groups nested
    /// wholly inside it.
    ///
    /// Returns the number of plain records released.
    pub fn devres_release_group(&self, id: Option<GroupId>) -> usize {
        let mut todo = Vec::new();
        let count = {
            let mut nodes = self.devres.nodes.lock();
            let Some(grp) = find_group(&nodes, id) else {
                let empty = nodes.is_empty();
                drop(nodes);
                // An empty store means the device is already being torn
                // down; its groups are gone with everything else.
                if !empty {
                    kwarn_on!(true, "{}: devres group {:?} not found", self.name(), id);
                }
                return 0;
            };
            let Some(first) = position_of(&nodes, &grp, true) else {
                kbug!("devres: group {} lost its open marker", grp.id);
            };
            let end = if grp.closed.load(Ordering::Relaxed) {
                position_of(&nodes, &grp, false).map_or(nodes.len(), |pos| pos + 1)
            } else {
                nodes.len()
            };
            remove_nodes(&mut nodes, first, end, &mut todo)
        };
        release_nodes(self, todo);
        count
    }

    /// Releases every record in the store, newest first.
    ///
    /// Returns the number of plain records released.
    pub fn devres_release_all(&self) -> usize {
        let mut todo = Vec::new();
        let count = {
            let mut nodes = self.devres.nodes.lock();
            let len = nodes.len();
            remove_nodes(&mut nodes, 0, len, &mut todo)
        };
        release_nodes(self, todo);
        count
    }

    /// Returns the number of plain records currently held.
    pub fn devres_count(&self) -> usize {
        self.devres
            .nodes
            .lock()
            .iter()
            .filter(|node| node.group().is_none())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Managed actions
// ---------------------------------------------------------------------------

/// Identifier of a managed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(usize);

static NEXT_ACTION: AtomicUsize = AtomicUsize::new(1);

/// A closure run when its record is released.
struct Action {
    id: ActionId,
    func: Box<dyn FnOnce(&Device) + Send>,
}

impl Releasable for Action {
    fn release(self: Box<Self>, dev: &Device) {
        (self.func)(dev);
    }
}

impl Device {
    /// Registers `func` to run when this device's resources are released.
    ///
    /// # Errors
    ///
    /// Returns [`DevresError::OutOfMemory`] if the record could not be added;
    /// `func` is dropped without running.
    pub fn add_action<F>(&self, func: F) -> Result<ActionId, DevresError>
    where
        F: FnOnce(&Device) + Send + 'static,
    {
        self.add_action_flags(Box::new(func), AllocFlags::KERNEL)
            .map_err(|(err, _)| err)
    }

    /// Like [`add_action`](Self::add_action), but runs `func` immediately if
    /// it cannot be registered.
    ///
    /// # Errors
    ///
    /// Returns [`DevresError::OutOfMemory`] after running `func`.
    pub fn add_action_or_reset<F>(&self, func: F, flags: AllocFlags) -> Result<ActionId, DevresError>
    where
        F: FnOnce(&Device) + Send + 'static,
    {
        self.add_action_flags(Box::new(func), flags)
            .map_err(|(err, func)| {
                func(self);
                err
            })
    }

    fn add_action_flags(
        &self,
        func: Box<dyn FnOnce(&Device) + Send>,
        flags: AllocFlags,
    ) -> Result<ActionId, (DevresError, Box<dyn FnOnce(&Device) + Send>)> {
        let id = ActionId(NEXT_ACTION.fetch_add(1, Ordering::Relaxed));
        let mut nodes = self.devres.nodes.lock();
        if flags.contains(AllocFlags::ATOMIC) && nodes.try_reserve(1).is_err() {
            return Err((DevresError::OutOfMemory, func));
        }
        let entry: Box<dyn DevresEntry> = Box::new(Action { id, func });
        nodes.push(DevresNode::Resource(Record { entry, flags }));
        Ok(id)
    }

    /// Unregisters an action without running it.
    ///
    /// Removing an action that is not registered is a programmer error.
    pub fn remove_action(&self, id: ActionId) {
        let removed = self.devres_remove::<Action>(|action| action.id == id);
        kwarn_on!(removed.is_none(), "{}: action {:?} not registered", self.name(), id);
    }

    /// Unregisters an action and runs it now.
    ///
    /// Releasing an action that is not registered is a programmer error.
    pub fn release_action(&self, id: ActionId) {
        let result = self.devres_destroy::<Action>(|action| action.id == id);
        kwarn_on!(result.is_err(), "{}: action {:?} not registered", self.name(), id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;

    /// Resource that logs its tag when released.
    struct Tagged {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Releasable for Tagged {
        fn release(self: Box<Self>, _dev: &Device) {
            self.log.lock().unwrap().push(self.tag);
        }
    }

    struct Other(u32);

    impl Releasable for Other {
        fn release(self: Box<Self>, _dev: &Device) {}
    }

    fn setup() -> (Arc<Device>, Arc<Mutex<Vec<&'static str>>>) {
        (Device::new("devres-test", None, None), Arc::default())
    }

    fn add(dev: &Device, log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) {
        dev.devres_add(
            Tagged {
                tag,
                log: Arc::clone(log),
            },
            AllocFlags::KERNEL,
        )
        .unwrap();
    }

    fn released(log: &Arc<Mutex<Vec<&'static str>>>) -> Vec<&'static str> {
        core::mem::take(&mut *log.lock().unwrap())
    }

    #[test]
    fn release_all_is_newest_first() {
        let (dev, log) = setup();
        add(&dev, &log, "a");
        add(&dev, &log, "b");
        add(&dev, &log, "c");
        assert_eq!(dev.devres_release_all(), 3);
        assert_eq!(released(&log), ["c", "b", "a"]);
        assert_eq!(dev.devres_count(), 0);
    }

    #[test]
    fn group_release_takes_only_the_group() {
        let (dev, log) = setup();
        add(&dev, &log, "A");
        add(&dev, &log, "B");
        let g = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
        add(&dev, &log, "C");
        add(&dev, &log, "D");
        dev.devres_close_group(Some(g));
        add(&dev, &log, "E");

        assert_eq!(dev.devres_release_group(Some(g)), 2);
        assert_eq!(released(&log), ["D", "C"]);
        assert_eq!(dev.devres_count(), 3);

        dev.devres_release_all();
        assert_eq!(released(&log), ["E", "B", "A"]);
    }

    #[test]
    fn open_group_extends_to_end() {
        let (dev, log) = setup();
        add(&dev, &log, "a");
        let g = dev.devres_open_group(Some(GroupId::new(7)), AllocFlags::KERNEL).unwrap();
        assert_eq!(g, GroupId::new(7));
        add(&dev, &log, "b");
        add(&dev, &log, "c");
        assert_eq!(dev.devres_release_group(None), 2);
        assert_eq!(released(&log), ["c", "b"]);
        assert_eq!(dev.devres_count(), 1);
    }

    #[test]
    fn nested_group_goes_with_outer() {
        let (dev, log) = setup();
        let outer = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
        add(&dev, &log, "o1");
        let inner = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
        assert_ne!(inner, outer);
        add(&dev, &log, "i1");
        dev.devres_close_group(Some(inner));
        add(&dev, &log, "o2");
        dev.devres_close_group(Some(outer));

        assert_eq!(dev.devres_release_group(Some(outer)), 3);
        assert_eq!(released(&log), ["o2", "i1", "o1"]);
        // Inner markers went with it.
        assert_eq!(dev.devres_release_group(Some(inner)), 0);
    }

    #[test]
    fn partially_covered_group_survives() {
        let (dev, log) = setup();
        let outer = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
        add(&dev, &log, "x");
        let straddle = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
        add(&dev, &log, "y");
        dev.devres_close_group(Some(outer));
        add(&dev, &log, "z");
        dev.devres_close_group(Some(straddle));

        // `straddle` opens inside `outer` but closes after it.
        assert_eq!(dev.devres_release_group(Some(outer)), 2);
        assert_eq!(released(&log), ["y", "x"]);
        assert_eq!(dev.devres_release_group(Some(straddle)), 1);
        assert_eq!(released(&log), ["z"]);
    }

    #[test]
    fn remove_group_keeps_resources() {
        let (dev, log) = setup();
        let g = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
        add(&dev, &log, "kept");
        dev.devres_close_group(None);
        dev.devres_remove_group(Some(g));
        assert_eq!(dev.devres_count(), 1);
        assert!(released(&log).is_empty());
        dev.devres_release_all();
        assert_eq!(released(&log), ["kept"]);
    }

    #[test]
    fn find_is_newest_first() {
        let dev = Device::new("find", None, None);
        dev.devres_add(Other(1), AllocFlags::KERNEL).unwrap();
        dev.devres_add(Other(2), AllocFlags::KERNEL).unwrap();
        dev.devres_add(Other(3), AllocFlags::KERNEL).unwrap();
        assert_eq!(dev.devres_find::<Other, _>(any, |o| o.0), Some(3));
        assert_eq!(dev.devres_find::<Other, _>(|o| o.0 < 3, |o| o.0), Some(2));
        assert_eq!(dev.devres_find::<Other, _>(|o| o.0 > 9, |o| o.0), None);
    }

    #[test]
    fn remove_hands_back_without_release() {
        let (dev, log) = setup();
        add(&dev, &log, "first");
        add(&dev, &log, "second");
        let res = dev.devres_remove::<Tagged>(any).unwrap();
        assert_eq!(res.tag, "second");
        assert!(released(&log).is_empty());
        assert_eq!(dev.devres_count(), 1);
        assert!(dev.devres_remove::<Other>(any).is_none());
    }

    #[test]
    fn destroy_releases_and_reports_missing() {
        let (dev, log) = setup();
        add(&dev, &log, "gone");
        assert_eq!(dev.devres_destroy::<Tagged>(|t| t.tag == "gone"), Ok(()));
        assert_eq!(released(&log), ["gone"]);
        assert_eq!(
            dev.devres_destroy::<Tagged>(any),
            Err(DevresError::NotFound)
        );
        assert_eq!(dev.devres_discard::<Tagged>(any), Err(DevresError::NotFound));
    }

    #[test]
    fn actions_run_on_release() {
        let dev = Device::new("actions", None, None);
        let hits = Arc::new(Mutex::new(Vec::<String>::new()));
        let h = Arc::clone(&hits);
        dev.add_action(move |d| h.lock().unwrap().push(d.name().into()))
            .unwrap();
        let h = Arc::clone(&hits);
        let id = dev.add_action(move |_| h.lock().unwrap().push("removed".into()))
            .unwrap();
        dev.remove_action(id);
        dev.devres_release_all();
        assert_eq!(*hits.lock().unwrap(), ["actions"]);
    }

    #[test]
    fn release_action_runs_now() {
        let dev = Device::new("now", None, None);
        let hit = Arc::new(AtomicBool::new(false));
        let h = Arc::clone(&hit);
        let id = dev
            .add_action_or_reset(move |_| h.store(true, Ordering::SeqCst), AllocFlags::ATOMIC)
            .unwrap();
        dev.release_action(id);
        assert!(hit.load(Ordering::SeqCst));
        assert_eq!(dev.devres_count(), 0);
    }

    #[test]
    fn release_callback_may_register() {
        struct Chain;
        impl Releasable for Chain {
            fn release(self: Box<Self>, dev: &Device) {
                // Runs without the store lock held.
                dev.devres_add(Other(9), AllocFlags::KERNEL).unwrap();
            }
        }
        let dev = Device::new("chain", None, None);
        dev.devres_add(Chain, AllocFlags::KERNEL).unwrap();
        assert_eq!(dev.devres_release_all(), 1);
        assert_eq!(dev.devres_count(), 1);
    }

    #[test]
    #[should_panic(expected = "not open")]
    fn closing_unopened_group_is_misuse() {
        let dev = Device::new("misuse", None, None);
        dev.devres_close_group(None);
    }

    #[test]
    fn release_group_on_empty_store_is_quiet() {
        let dev = Device::new("empty", None, None);
        assert_eq!(dev.devres_release_group(Some(GroupId::new(1))), 0);
    }

    #[test]
    fn flags_do_not_change_release_order() {
        let (dev, log) = setup();
        for (tag, flags) in [
            ("kernel", AllocFlags::KERNEL),
            ("atomic", AllocFlags::ATOMIC),
            ("zeroed", AllocFlags::ATOMIC | AllocFlags::ZERO),
        ] {
            dev.devres_add(
                Tagged {
                    tag,
                    log: Arc::clone(&log),
                },
                flags,
            )
            .unwrap();
        }
        let grp = dev.devres_open_group(None, AllocFlags::ATOMIC).unwrap();
        dev.devres_close_group(Some(grp));
        assert_eq!(dev.devres_count(), 3);
        assert_eq!(dev.devres_release_all(), 3);
        assert_eq!(*log.lock().unwrap(), ["zeroed", "atomic", "kernel"]);
    }
}
