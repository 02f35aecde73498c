//! Managed resource store checked against a simple model.
//!
//! Random operation sequences are decoded from bytes, applied to a device
//! and to a plain list model, and the release order of both is compared.

use std::sync::{Arc, Mutex};

use hadron_driver_core::devres;
use hadron_driver_core::{AllocFlags, Device, GroupId, Releasable};
use quickcheck_macros::quickcheck;

type ReleaseLog = Arc<Mutex<Vec<u32>>>;

struct Res {
    id: u32,
    log: ReleaseLog,
}

impl Releasable for Res {
    fn release(self: Box<Self>, _dev: &Device) {
        self.log.lock().unwrap().push(self.id);
    }
}

#[derive(Debug, Clone)]
enum Node {
    Res(u32),
    Open(GroupId),
    Close(GroupId),
}

#[derive(Debug, Default)]
struct Model {
    nodes: Vec<Node>,
    closed: Vec<GroupId>,
}

impl Model {
    fn is_closed(&self, id: GroupId) -> bool {
        self.closed.contains(&id)
    }

    fn newest_open(&self) -> Option<GroupId> {
        self.nodes.iter().rev().find_map(|node| match node {
            Node::Open(id) if !self.is_closed(*id) => Some(*id),
            _ => None,
        })
    }

    fn groups(&self) -> Vec<GroupId> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Open(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Releases `[first, end)` and returns the released ids, newest first.
    fn release_range(&mut self, first: usize, end: usize) -> Vec<u32> {
        let range: Vec<Node> = self.nodes.drain(first..end).collect();
        let mut released: Vec<u32> = range
            .iter()
            .filter_map(|node| match node {
                Node::Res(id) => Some(*id),
                _ => None,
            })
            .collect();
        released.reverse();

        let covered = |id: GroupId| {
            let seen = range
                .iter()
                .filter(|node| matches!(node, Node::Open(g) | Node::Close(g) if *g == id))
                .count();
            seen == 2 || (seen == 1 && !self.is_closed(id))
        };
        let kept: Vec<Node> = range
            .iter()
            .filter(|node| match node {
                Node::Res(_) => false,
                Node::Open(id) | Node::Close(id) => !covered(*id),
            })
            .cloned()
            .collect();
        self.nodes.splice(first..first, kept);
        // Freed group ids may be handed out again.
        let live = self.groups();
        self.closed.retain(|id| live.contains(id));
        released
    }

    fn release_group(&mut self, id: GroupId) -> Vec<u32> {
        let Some(first) = self
            .nodes
            .iter()
            .position(|node| matches!(node, Node::Open(g) if *g == id))
        else {
            return Vec::new();
        };
        let end = self
            .nodes
            .iter()
            .position(|node| matches!(node, Node::Close(g) if *g == id))
            .map_or(self.nodes.len(), |pos| pos + 1);
        self.release_range(first, end)
    }

    fn release_all(&mut self) -> Vec<u32> {
        let len = self.nodes.len();
        self.release_range(0, len)
    }
}

fn take(log: &ReleaseLog) -> Vec<u32> {
    std::mem::take(&mut *log.lock().unwrap())
}

#[quickcheck]
fn qc_release_order_matches_model(ops: Vec<u8>) {
    let dev = Device::new("qc", None, None);
    let log = ReleaseLog::default();
    let mut model = Model::default();
    let mut next_id = 0;

    for op in ops {
        match op % 5 {
            0 | 1 => {
                next_id += 1;
                dev.devres_add(
                    Res {
                        id: next_id,
                        log: Arc::clone(&log),
                    },
                    AllocFlags::KERNEL,
                )
                .unwrap();
                model.nodes.push(Node::Res(next_id));
            }
            2 => {
                let id = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
                model.nodes.push(Node::Open(id));
            }
            3 => {
                if let Some(id) = model.newest_open() {
                    dev.devres_close_group(None);
                    model.nodes.push(Node::Close(id));
                    model.closed.push(id);
                }
            }
            _ => {
                let groups = model.groups();
                if groups.is_empty() {
                    continue;
                }
                let id = groups[usize::from(op / 5) % groups.len()];
                let expected = model.release_group(id);
                assert_eq!(dev.devres_release_group(Some(id)), expected.len());
                assert_eq!(take(&log), expected);
            }
        }
    }

    let expected = model.release_all();
    assert_eq!(dev.devres_release_all(), expected.len());
    assert_eq!(take(&log), expected);
    assert_eq!(dev.devres_count(), 0);
}

#[quickcheck]
fn qc_find_returns_newest_match(values: Vec<u8>) {
    struct Val(u8);
    impl Releasable for Val {
        fn release(self: Box<Self>, _dev: &Device) {}
    }

    let dev = Device::new("qc-find", None, None);
    for &v in &values {
        dev.devres_add(Val(v), AllocFlags::KERNEL).unwrap();
    }
    let newest_even = values.iter().rev().find(|v| *v % 2 == 0).copied();
    assert_eq!(
        dev.devres_find::<Val, _>(|v| v.0 % 2 == 0, |v| v.0),
        newest_even
    );
    assert_eq!(dev.devres_find::<Val, _>(devres::any, |v| v.0), values.last().copied());

    let removed = dev.devres_remove::<Val>(|v| v.0 % 2 == 0).map(|v| v.0);
    assert_eq!(removed, newest_even);
    assert_eq!(dev.devres_count(), values.len() - usize::from(removed.is_some()));
}

#[test]
fn scenario_group_then_release_all() {
    let dev = Device::new("scenario", None, None);
    let log = ReleaseLog::default();
    let add = |id| {
        dev.devres_add(
            Res {
                id,
                log: Arc::clone(&log),
            },
            AllocFlags::KERNEL,
        )
        .unwrap();
    };
    add(1);
    add(2);
    let g = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
    add(3);
    add(4);
    dev.devres_close_group(Some(g));
    add(5);

    assert_eq!(dev.devres_release_group(Some(g)), 2);
    assert_eq!(take(&log), [4, 3]);
    assert_eq!(dev.devres_release_all(), 3);
    assert_eq!(take(&log), [5, 2, 1]);
}

#[test]
fn unclosed_group_is_swept_by_outer_release() {
    let dev = Device::new("sweep", None, None);
    let log = ReleaseLog::default();
    let res = |id| Res {
        id,
        log: Arc::clone(&log),
    };
    let outer = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
    dev.devres_add(res(1), AllocFlags::KERNEL).unwrap();
    let inner = dev.devres_open_group(None, AllocFlags::KERNEL).unwrap();
    dev.devres_add(res(2), AllocFlags::KERNEL).unwrap();

    // Both groups are open; releasing the outer one takes the inner too.
    assert_eq!(dev.devres_release_group(Some(outer)), 2);
    assert_eq!(take(&log), [2, 1]);
    assert_eq!(dev.devres_release_group(Some(inner)), 0);
}
