//! RX/TX buffer pools and the host flow-control mutex.
//!
//! Generalizes the reference controller's `pkt_rx_data_free`/TX control+data sub-pools and
//! `fc_req`/`fc_ack` ring into arena-backed index lists, per the crate's Design Notes on
//! replacing intrusive-pointer lists with stable indices.

use heapless::consts::{U16, U3, U4};
use heapless::Vec;

/// Maximum number of simultaneous connections supported by the flow-control ring, matching the
/// reference controller's fixed ring of 3 handles.
pub const FC_RING_SIZE: usize = 3;

/// A connection handle, as returned by [`crate::link::Controller::create_connection`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnHandle(pub u8);

/// Index of a node inside a [`RxPool`] or [`TxPool`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NodeIndex(pub u8);

/// Fixed-size arena of fixed-capacity buffers with a free list, generic over node payload size.
///
/// One RX pool is shared by every connection; its node size is re-computed (and the pool
/// re-initialised) whenever a connection negotiates a larger `max_rx_octets`, and only while
/// every node is free (`spec.md` §3/§4.6/§5 "pool re-initialisation" rule).
pub struct RxPool {
    node_size: usize,
    free: Vec<NodeIndex, U16>,
    total: u8,
    in_use: u8,
}

impl RxPool {
    /// Creates a pool of `count` nodes, each able to hold `node_size` payload bytes.
    pub fn new(count: u8, node_size: usize) -> Self {
        let mut free = Vec::new();
        for i in 0..count {
            let _ = free.push(NodeIndex(i));
        }
        Self {
            node_size,
            free,
            total: count,
            in_use: 0,
        }
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Whether every node is currently free. Must hold before [`RxPool::resize`] is called.
    pub fn is_idle(&self) -> bool {
        self.in_use == 0
    }

    /// Allocates a node, if one is free.
    pub fn alloc(&mut self) -> Option<NodeIndex> {
        let idx = self.free.pop()?;
        self.in_use += 1;
        Some(idx)
    }

    /// Returns a node to the free list.
    pub fn free(&mut self, idx: NodeIndex) {
        debug_assert!(self.in_use > 0, "double free of RX pool node");
        self.in_use -= 1;
        let _ = self.free.push(idx);
    }

    /// Re-initialises the pool with a larger node size.
    ///
    /// # Panics
    ///
    /// Panics (via debug assertion) if the pool is not idle; callers must check
    /// [`RxPool::is_idle`] first, per the "DLE pool growth safety" testable property.
    pub fn resize(&mut self, new_node_size: usize) {
        debug_assert!(self.is_idle(), "resizing RX pool while nodes are allocated");
        self.node_size = new_node_size;
        self.free.clear();
        for i in 0..self.total {
            let _ = self.free.push(NodeIndex(i));
        }
    }
}

/// TX control PDU sub-pool. Kept separate from the data sub-pool so that control PDUs
/// (LLCP responses, which must never be starved) always have space.
pub struct CtrlPool {
    free: Vec<NodeIndex, U4>,
}

/// TX data PDU sub-pool.
pub struct DataPool {
    free: Vec<NodeIndex, U16>,
}

/// The split TX pool: a small control sub-pool plus a larger data sub-pool.
pub struct TxPool {
    pub ctrl: CtrlPool,
    pub data: DataPool,
}

impl TxPool {
    pub fn new(ctrl_count: u8, data_count: u8) -> Self {
        let mut ctrl_free = Vec::new();
        for i in 0..ctrl_count {
            let _ = ctrl_free.push(NodeIndex(i));
        }
        let mut data_free = Vec::new();
        for i in 0..data_count {
            let _ = data_free.push(NodeIndex(i));
        }
        Self {
            ctrl: CtrlPool { free: ctrl_free },
            data: DataPool { free: data_free },
        }
    }

    pub fn alloc_ctrl(&mut self) -> Option<NodeIndex> {
        self.ctrl.free.pop()
    }

    pub fn free_ctrl(&mut self, idx: NodeIndex) {
        let _ = self.ctrl.free.push(idx);
    }

    pub fn alloc_data(&mut self) -> Option<NodeIndex> {
        self.data.free.pop()
    }

    pub fn free_data(&mut self, idx: NodeIndex) {
        let _ = self.data.free.push(idx);
    }
}

/// Dedicated pool of RX nodes reserved one-per-connection for termination delivery, independent
/// of [`RxPool`] so a `TERMINATE_IND` round trip is never blocked by RX pool exhaustion or an
/// in-progress DLE resize.
pub struct TerminatePool {
    free: Vec<NodeIndex, U4>,
}

impl TerminatePool {
    pub fn new(count: u8) -> Self {
        let mut free = Vec::new();
        for i in 0..count {
            let _ = free.push(NodeIndex(i));
        }
        Self { free }
    }

    pub fn alloc(&mut self) -> Option<NodeIndex> {
        self.free.pop()
    }

    pub fn free(&mut self, idx: NodeIndex) {
        let _ = self.free.push(idx);
    }
}

/// Host flow-control mutex: at most one handle may have an unacknowledged RX delivery pending
/// at a time, in the absence of a richer host flow-control mechanism.
///
/// Mirrors the reference controller's `(fc_req, fc_ack)` counter pair plus a 3-entry handle
/// ring.
#[derive(Default)]
pub struct FlowControlMutex {
    ring: Vec<ConnHandle, U3>,
    locked: Option<ConnHandle>,
}

impl FlowControlMutex {
    pub fn new() -> Self {
        Self {
            ring: Vec::new(),
            locked: None,
        }
    }

    /// Returns whether RX is currently free to accept a new payload for `handle`.
    pub fn is_free_for(&self, handle: ConnHandle) -> bool {
        match self.locked {
            None => true,
            Some(locked) => locked == handle,
        }
    }

    /// Locks RX to `handle` on enqueue of an unacknowledged payload.
    pub fn lock(&mut self, handle: ConnHandle) {
        if self.locked.is_none() {
            self.locked = Some(handle);
            if !self.ring.iter().any(|h| *h == handle) {
                if self.ring.len() == self.ring.capacity() {
                    self.ring.pop();
                }
                let _ = self.ring.push(handle);
            }
        }
    }

    /// Releases the lock for `handle`. Called by the host after dequeuing the locked RX packet
    /// (`radio_rx_fc_set(handle, 0)` in the reference controller).
    pub fn release(&mut self, handle: ConnHandle) {
        if self.locked == Some(handle) {
            self.locked = None;
        }
    }

    pub fn locked_handle(&self) -> Option<ConnHandle> {
        self.locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_pool_alloc_free_roundtrip() {
        let mut pool = RxPool::new(2, 27);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert!(!pool.is_idle());
        pool.free(a);
        pool.free(b);
        assert!(pool.is_idle());
    }

    #[test]
    fn resize_only_allowed_when_idle() {
        let mut pool = RxPool::new(2, 27);
        let _a = pool.alloc().unwrap();
        assert!(!pool.is_idle());
        pool.free(_a);
        pool.resize(251);
        assert_eq!(pool.node_size(), 251);
    }

    #[test]
    fn flow_control_locks_single_handle() {
        let mut fc = FlowControlMutex::new();
        assert!(fc.is_free_for(ConnHandle(0)));
        fc.lock(ConnHandle(0));
        assert!(fc.is_free_for(ConnHandle(0)));
        assert!(!fc.is_free_for(ConnHandle(1)));
        fc.release(ConnHandle(0));
        assert!(fc.is_free_for(ConnHandle(1)));
    }
}
