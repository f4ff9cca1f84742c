//! A bridge: a port table plus its forwarding policy.
//!
//! The table is guarded by a reader-writer lock. Forwarding passes hold it
//! shared for the duration of one flush; attach, detach and policy changes
//! take it exclusively and therefore wait for in-flight flushes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{MAX_BATCH, MAX_NAME_LEN};
use crate::error::{Result, SwitchError};
use crate::learning::LearningTable;
use crate::ops::BridgeOps;
use crate::port::Port;

/// Fabric-wide forwarding parameters shared by every bridge.
pub struct Tunables {
    batch_size: AtomicUsize,
    gso_header_len: usize,
    max_ports: usize,
}

impl Tunables {
    pub fn new(batch_size: usize, gso_header_len: usize, max_ports: usize) -> Self {
        Self {
            batch_size: AtomicUsize::new(batch_size.clamp(1, MAX_BATCH)),
            gso_header_len,
            max_ports,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Change the batch size; values are clamped to `1..=MAX_BATCH`.
    pub fn set_batch_size(&self, n: usize) -> usize {
        let n = n.clamp(1, MAX_BATCH);
        self.batch_size.store(n, Ordering::Relaxed);
        n
    }

    pub fn gso_header_len(&self) -> usize {
        self.gso_header_len
    }

    pub fn max_ports(&self) -> usize {
        self.max_ports
    }
}

/// A name split into its bridge and port parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedName<'a> {
    pub bridge: &'a str,
    pub port: Option<&'a str>,
}

/// Split and validate `bridge[:port]`.
///
/// The bridge part must start with `prefix`, be 1 to 16 characters long and
/// consist of ASCII alphanumerics or `_`. A port part, if present, must be
/// 1 to 16 characters long.
pub fn parse_name<'a>(name: &'a str, prefix: &str) -> Result<ParsedName<'a>> {
    let invalid = || SwitchError::InvalidName(name.to_string());
    if !name.starts_with(prefix) {
        return Err(invalid());
    }
    let (bridge, port) = match name.split_once(':') {
        Some((b, p)) => (b, Some(p)),
        None => (name, None),
    };
    if bridge.is_empty()
        || bridge.len() > MAX_NAME_LEN
        || !bridge.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_')
    {
        return Err(invalid());
    }
    if let Some(p) = port
        && (p.is_empty() || p.len() > MAX_NAME_LEN)
    {
        return Err(invalid());
    }
    Ok(ParsedName { bridge, port })
}

/// Mutable part of a bridge, guarded by the bridge lock.
pub struct BridgeState {
    ports: Vec<Option<Arc<Port>>>,
    /// `[0, active)` lists the occupied indices; the rest are free.
    port_index: Vec<usize>,
    active: usize,
    ops: Arc<dyn BridgeOps>,
    default_ops: Arc<LearningTable>,
}

impl BridgeState {
    fn new(capacity: usize) -> Self {
        let table = Arc::new(LearningTable::new());
        Self {
            ports: vec![None; capacity],
            port_index: (0..capacity).collect(),
            active: 0,
            ops: table.clone(),
            default_ops: table,
        }
    }

    /// Reinitialize for a freshly created bridge.
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.ports.len());
    }

    pub fn capacity(&self) -> usize {
        self.ports.len()
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn port(&self, index: usize) -> Option<&Arc<Port>> {
        self.ports.get(index).and_then(|p| p.as_ref())
    }

    pub fn port_index(&self) -> &[usize] {
        &self.port_index
    }

    /// Indices of the active ports, in table order.
    pub fn active_indices(&self) -> &[usize] {
        &self.port_index[..self.active]
    }

    /// Find an attached port by its full name.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.active_indices().iter().copied().find(|&i| {
            self.port(i)
                .and_then(|p| p.link())
                .is_some_and(|l| l.name == name)
        })
    }

    pub fn ops(&self) -> &Arc<dyn BridgeOps> {
        &self.ops
    }

    pub fn learning_table(&self) -> &Arc<LearningTable> {
        &self.default_ops
    }

    pub(crate) fn set_ops(&mut self, ops: Arc<dyn BridgeOps>) {
        self.ops = ops;
    }

    /// Restore the learning lookup with an empty table.
    pub(crate) fn reset_ops(&mut self) {
        self.default_ops.clear();
        self.ops = self.default_ops.clone();
        for &i in &self.port_index[..self.active] {
            if let Some(p) = &self.ports[i] {
                p.forget_src_mac();
            }
        }
    }

    /// Claim the next free indices for a port and optionally its host
    /// sub-port. Capacity must have been checked by the caller.
    pub(crate) fn attach_common(
        &mut self,
        port: Arc<Port>,
        host: Option<Arc<Port>>,
    ) -> (usize, Option<usize>) {
        let cand = self.port_index[self.active];
        self.ports[cand] = Some(port);
        self.active += 1;

        let cand2 = host.map(|h| {
            let idx = self.port_index[self.active];
            self.ports[idx] = Some(h);
            self.active += 1;
            idx
        });
        (cand, cand2)
    }

    /// Remove `hw` (and `sw`) from the table, filling their positions in the
    /// index list from its end.
    pub(crate) fn detach_common(&mut self, hw: usize, sw: Option<usize>) {
        let mut tmp = self.port_index.clone();
        let mut lim = self.active;
        let mut hw_left = Some(hw);
        let mut sw_left = sw;
        let mut i = 0;
        while (hw_left.is_some() || sw_left.is_some()) && i < lim {
            if hw_left == Some(tmp[i]) {
                lim -= 1;
                tmp[i] = tmp[lim];
                tmp[lim] = hw;
                hw_left = None;
            } else if let Some(s) = sw_left
                && s == tmp[i]
            {
                lim -= 1;
                tmp[i] = tmp[lim];
                tmp[lim] = s;
                sw_left = None;
            } else {
                i += 1;
            }
        }
        debug_assert!(hw_left.is_none() && sw_left.is_none());

        if let Some(p) = self.ports[hw].as_ref() {
            self.ops.dtor(p);
        }
        self.ports[hw] = None;
        if let Some(sw) = sw {
            self.ports[sw] = None;
        }
        self.port_index = tmp;
        self.active = lim;
    }
}

/// One bridge slot of the fabric.
pub struct Bridge {
    index: usize,
    tunables: Arc<Tunables>,
    state: RwLock<BridgeState>,
}

impl Bridge {
    pub fn new(index: usize, tunables: Arc<Tunables>) -> Self {
        let capacity = tunables.max_ports();
        Self {
            index,
            tunables,
            state: RwLock::new(BridgeState::new(capacity)),
        }
    }

    /// Slot of this bridge in the fabric.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tunables(&self) -> &Arc<Tunables> {
        &self.tunables
    }

    pub fn read(&self) -> RwLockReadGuard<'_, BridgeState> {
        self.state.read()
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, BridgeState>> {
        self.state.try_read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, BridgeState> {
        self.state.write()
    }
}
