//! The switch fabric: bridge registry and port lifecycle.
//!
//! A [`Fabric`] owns a fixed array of bridge slots. Bridges are created on
//! the first attach that names them and freed when their last port leaves,
//! unless they were created exclusively, in which case they stay until
//! destroyed with their token.
//!
//! All configuration goes through the registry mutex, taken before any
//! bridge lock. Forwarding never touches it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{Bridge, Tunables, parse_name};
use crate::config::{FabricConfig, MAX_NAME_LEN};
use crate::control::{BridgeInfo, PortInfo, Request, Response, RingRequest};
use crate::error::{Result, SwitchError};
use crate::nic::{NicAdapter, NicDriver, NicGeometry, NicHandle, Owner, WrapHook};
use crate::ops::BridgeOps;
use crate::polling::{self, PollingHandle, PollingMode, PollingPlan};
use crate::port::{BridgeLink, Port, PortGeometry, PortHandle, PortKind, WrapSide};

/// Token guarding an exclusive bridge.
pub type AuthToken = Uuid;

/// Virtio-net header lengths a port may be configured with.
const VALID_VNET_HDR_LENS: [usize; 3] = [0, 10, 12];

#[derive(Debug, Default)]
struct BridgeMeta {
    name: String,
    active: bool,
    exclusive: bool,
    auth: Option<AuthToken>,
}

impl BridgeMeta {
    fn authorized(&self, auth: Option<&AuthToken>) -> bool {
        !self.exclusive || (self.auth.is_some() && self.auth.as_ref() == auth)
    }
}

#[derive(Default)]
struct Registry {
    metas: Vec<BridgeMeta>,
    nics: HashMap<String, Arc<NicAdapter>>,
    persistent: HashMap<String, Arc<Port>>,
}

/// What an attach request resolved to.
enum Candidate {
    Nic(Arc<NicAdapter>),
    Persistent(Arc<Port>),
    Ephemeral,
}

pub struct Fabric {
    config: FabricConfig,
    tunables: Arc<Tunables>,
    bridges: Box<[Arc<Bridge>]>,
    registry: Mutex<Registry>,
    next_mem_id: AtomicU32,
}

impl Fabric {
    pub fn new(config: FabricConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SwitchError::InvalidArgument(e.to_string()))?;
        let tunables = Arc::new(Tunables::new(
            config.batch_size,
            config.gso_header_len,
            config.max_ports,
        ));
        let bridges = (0..config.max_bridges)
            .map(|i| Arc::new(Bridge::new(i, tunables.clone())))
            .collect();
        let registry = Registry {
            metas: (0..config.max_bridges).map(|_| BridgeMeta::default()).collect(),
            ..Registry::default()
        };
        info!(
            bridges = config.max_bridges,
            ports = config.max_ports,
            batch = config.batch_size,
            "Switch fabric initialized"
        );
        Ok(Self {
            config,
            tunables,
            bridges,
            registry: Mutex::new(registry),
            next_mem_id: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn tunables(&self) -> &Arc<Tunables> {
        &self.tunables
    }

    /// Set the forwarding batch size; returns the clamped value in effect.
    pub fn set_batch_size(&self, n: usize) -> usize {
        let n = self.tunables.set_batch_size(n);
        info!(batch = n, "Batch size changed");
        n
    }

    fn alloc_mem_id(&self) -> u32 {
        self.next_mem_id.fetch_add(1, Ordering::Relaxed)
    }

    fn find_bridge(&self, reg: &Registry, name: &str) -> Option<usize> {
        reg.metas.iter().position(|m| m.active && m.name == name)
    }

    /// Find a bridge by name or take the first empty slot for it.
    fn find_or_create_bridge(&self, reg: &mut Registry, name: &str) -> Result<usize> {
        if let Some(i) = self.find_bridge(reg, name) {
            return Ok(i);
        }
        let free = reg
            .metas
            .iter()
            .enumerate()
            .position(|(i, m)| !m.active && self.bridges[i].read().active() == 0)
            .ok_or_else(|| SwitchError::NoBridgeSlot(name.to_string()))?;

        self.bridges[free].write().reset();
        reg.metas[free] = BridgeMeta {
            name: name.to_string(),
            active: true,
            exclusive: false,
            auth: None,
        };
        info!(bridge = %name, index = free, "Created bridge");
        Ok(free)
    }

    /// Free the bridge in slot `idx` if nothing keeps it.
    fn release_if_unused(&self, reg: &mut Registry, idx: usize) {
        let meta = &mut reg.metas[idx];
        if meta.active && !meta.exclusive && self.bridges[idx].read().active() == 0 {
            info!(bridge = %meta.name, index = idx, "Freed bridge");
            *meta = BridgeMeta::default();
        }
    }

    fn check_auth(reg: &Registry, idx: usize, auth: Option<&AuthToken>) -> Result<()> {
        let meta = &reg.metas[idx];
        if meta.authorized(auth) {
            Ok(())
        } else {
            Err(SwitchError::PermissionDenied(meta.name.clone()))
        }
    }

    /// Look up an attached port by its full `bridge:port` name.
    fn attached_port(&self, reg: &Registry, name: &str) -> Result<(usize, usize, Arc<Port>)> {
        let parsed = parse_name(name, &self.config.name_prefix)?;
        if parsed.port.is_none() {
            return Err(SwitchError::InvalidName(name.to_string()));
        }
        let b = self
            .find_bridge(reg, parsed.bridge)
            .ok_or_else(|| SwitchError::BridgeNotFound(parsed.bridge.to_string()))?;
        let state = self.bridges[b].read();
        let p = state
            .find(name)
            .ok_or_else(|| SwitchError::PortNotFound(name.to_string()))?;
        let port = state
            .port(p)
            .cloned()
            .ok_or_else(|| SwitchError::PortNotFound(name.to_string()))?;
        Ok((b, p, port))
    }

    /// Create an exclusive bridge and return the token that guards it.
    pub fn create_exclusive(&self, name: &str) -> Result<AuthToken> {
        let parsed = parse_name(name, &self.config.name_prefix)?;
        if parsed.port.is_some() {
            return Err(SwitchError::InvalidName(name.to_string()));
        }
        let mut reg = self.registry.lock();
        if self.find_bridge(&reg, name).is_some() {
            return Err(SwitchError::BridgeExists(name.to_string()));
        }
        let idx = self.find_or_create_bridge(&mut reg, name)?;
        let token = Uuid::new_v4();
        let meta = &mut reg.metas[idx];
        meta.exclusive = true;
        meta.auth = Some(token);
        info!(bridge = %name, index = idx, "Created exclusive bridge");
        Ok(token)
    }

    pub fn destroy_exclusive(&self, name: &str, token: &AuthToken) -> Result<()> {
        let mut reg = self.registry.lock();
        let idx = self
            .find_bridge(&reg, name)
            .ok_or_else(|| SwitchError::BridgeNotFound(name.to_string()))?;
        if !reg.metas[idx].exclusive {
            return Err(SwitchError::InvalidArgument(format!(
                "bridge {name} is not exclusive"
            )));
        }
        Self::check_auth(&reg, idx, Some(token))?;
        if self.bridges[idx].read().active() > 0 {
            return Err(SwitchError::BridgeBusy(name.to_string()));
        }
        reg.metas[idx] = BridgeMeta::default();
        info!(bridge = %name, index = idx, "Destroyed exclusive bridge");
        Ok(())
    }

    /// Attach `bridge:port` to its bridge, creating the bridge if needed.
    ///
    /// The port part names a registered NIC (attached through a bridge-wrap
    /// adapter, with its host rings as a second port if `host` is set), a
    /// persistent port, or otherwise a new ephemeral virtual port.
    pub fn attach(
        &self,
        name: &str,
        host: bool,
        rings: &RingRequest,
        auth: Option<&AuthToken>,
    ) -> Result<(PortInfo, Option<PortInfo>)> {
        let parsed = parse_name(name, &self.config.name_prefix)?;
        let Some(suffix) = parsed.port else {
            return Err(SwitchError::InvalidName(name.to_string()));
        };
        let mut reg = self.registry.lock();
        let idx = self.find_or_create_bridge(&mut reg, parsed.bridge)?;
        let result = self.attach_locked(&mut reg, idx, name, suffix, host, rings, auth);
        if result.is_err() {
            self.release_if_unused(&mut reg, idx);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn attach_locked(
        &self,
        reg: &mut Registry,
        idx: usize,
        name: &str,
        suffix: &str,
        host: bool,
        rings: &RingRequest,
        auth: Option<&AuthToken>,
    ) -> Result<(PortInfo, Option<PortInfo>)> {
        Self::check_auth(reg, idx, auth)?;
        let bridge = &self.bridges[idx];

        if bridge.read().find(name).is_some() {
            return Err(SwitchError::PortBusy(name.to_string()));
        }

        let candidate = if let Some(nic) = reg.nics.get(suffix) {
            if nic.owner() != Owner::Free {
                return Err(SwitchError::PortBusy(name.to_string()));
            }
            Candidate::Nic(nic.clone())
        } else if let Some(port) = reg.persistent.get(suffix) {
            if port.link().is_some() {
                return Err(SwitchError::PortBusy(name.to_string()));
            }
            Candidate::Persistent(port.clone())
        } else {
            Candidate::Ephemeral
        };
        if host && !matches!(candidate, Candidate::Nic(_)) {
            return Err(SwitchError::InvalidArgument(format!(
                "{name} has no host rings"
            )));
        }

        let needed = if host { 2 } else { 1 };
        let active = bridge.read().active();
        if active + needed > self.tunables.max_ports() {
            return Err(SwitchError::BridgeFull(reg.metas[idx].name.clone()));
        }

        let (port, host_port) = match candidate {
            Candidate::Nic(nic) => {
                if !nic.claim(Owner::Bridge) {
                    return Err(SwitchError::PortBusy(name.to_string()));
                }
                let hw = Arc::new(Port::new_wrap(name, nic.clone(), WrapSide::Hw));
                let sw = host.then(|| {
                    Arc::new(Port::new_wrap(&format!("{name}^"), nic.clone(), WrapSide::Host))
                });
                (hw, sw)
            }
            Candidate::Persistent(port) => (port, None),
            Candidate::Ephemeral => {
                let r = rings.resolve(&self.config.default_rings);
                let geometry = PortGeometry {
                    tx_rings: r.tx_rings,
                    rx_rings: r.rx_rings,
                    tx_slots: r.tx_slots,
                    rx_slots: r.rx_slots,
                    buf_size: self.config.buf_size,
                    mfs: self.config.default_mfs,
                };
                let port = Port::new_virtual(name, &geometry, self.alloc_mem_id(), false)?;
                (Arc::new(port), None)
            }
        };

        let (cand, cand2) = {
            let mut state = bridge.write();
            let (cand, cand2) = state.attach_common(port.clone(), host_port.clone());
            port.set_link(Some(Arc::new(BridgeLink {
                bridge: bridge.clone(),
                index: cand,
                name: name.to_string(),
            })));
            if let (Some(h), Some(i)) = (&host_port, cand2) {
                h.set_link(Some(Arc::new(BridgeLink {
                    bridge: bridge.clone(),
                    index: i,
                    name: format!("{name}^"),
                })));
            }
            (cand, cand2)
        };

        if let PortKind::Wrap { nic, .. } = port.kind() {
            nic.set_hook(Some(Arc::new(WrapHook {
                hw: port.clone(),
                host: host_port.clone(),
            })));
        }
        info!(
            bridge = %reg.metas[idx].name,
            port = %name,
            index = cand,
            host_index = ?cand2,
            "Attached port"
        );
        Ok((
            PortInfo::from_port(&port),
            host_port.as_deref().map(PortInfo::from_port),
        ))
    }

    /// Detach `bridge:port`. The bridge is freed if this was its last port.
    pub fn detach(&self, name: &str, auth: Option<&AuthToken>) -> Result<()> {
        let mut reg = self.registry.lock();
        let (idx, p, port) = self.attached_port(&reg, name)?;
        Self::check_auth(&reg, idx, auth)?;
        if let PortKind::Wrap { nic, side } = port.kind() {
            if *side == WrapSide::Host {
                return Err(SwitchError::InvalidArgument(format!(
                    "{name} leaves with its NIC port"
                )));
            }
            if nic.is_polling() {
                return Err(SwitchError::PortBusy(name.to_string()));
            }
        }
        self.detach_locked(&mut reg, idx, p, &port);
        Ok(())
    }

    fn detach_locked(&self, reg: &mut Registry, idx: usize, p: usize, port: &Arc<Port>) {
        let bridge = &self.bridges[idx];
        let (nic, host) = match port.kind() {
            PortKind::Wrap {
                nic,
                side: WrapSide::Hw,
            } => (Some(nic.clone()), nic.hook().and_then(|h| h.host.clone())),
            _ => (None, None),
        };
        let host_idx = host.as_ref().and_then(|h| h.link()).map(|l| l.index);

        port.set_rings_stopped(true);
        if let Some(h) = &host {
            h.set_rings_stopped(true);
        }
        bridge.write().detach_common(p, host_idx);
        port.set_link(None);
        port.set_rings_stopped(false);
        if let Some(h) = &host {
            h.set_link(None);
            h.set_rings_stopped(false);
        }

        if let Some(nic) = nic {
            nic.set_hook(None);
            nic.release();
        }
        info!(bridge = %reg.metas[idx].name, port = %port.name(), index = p, "Detached port");
        self.release_if_unused(reg, idx);
    }

    /// Find a port by name, or the first port at or after a cursor.
    ///
    /// Returns the port and its `(bridge_idx, port_idx)` position; continue
    /// iterating from `port_idx + 1`.
    pub fn list(
        &self,
        name: Option<&str>,
        bridge_idx: usize,
        port_idx: usize,
    ) -> Result<(PortInfo, usize, usize)> {
        let reg = self.registry.lock();
        if let Some(name) = name {
            let (b, _, port) = self.attached_port(&reg, name)?;
            let state = self.bridges[b].read();
            let j = state
                .active_indices()
                .iter()
                .position(|&i| state.port(i).is_some_and(|q| Arc::ptr_eq(q, &port)))
                .ok_or_else(|| SwitchError::PortNotFound(name.to_string()))?;
            return Ok((PortInfo::from_port(&port), b, j));
        }

        let mut j = port_idx;
        for b in bridge_idx..self.bridges.len() {
            if reg.metas[b].active {
                let state = self.bridges[b].read();
                if let Some(port) = state
                    .active_indices()
                    .get(j)
                    .and_then(|&i| state.port(i))
                {
                    return Ok((PortInfo::from_port(port), b, j));
                }
            }
            j = 0;
        }
        Err(SwitchError::PortNotFound(format!(
            "no port at or after {bridge_idx}:{port_idx}"
        )))
    }

    /// Every attached port, in cursor order.
    pub fn list_all(&self) -> Vec<PortInfo> {
        let mut out = Vec::new();
        let (mut b, mut j) = (0, 0);
        while let Ok((info, nb, nj)) = self.list(None, b, j) {
            out.push(info);
            (b, j) = (nb, nj + 1);
        }
        out
    }

    pub fn bridges(&self) -> Vec<BridgeInfo> {
        let reg = self.registry.lock();
        reg.metas
            .iter()
            .enumerate()
            .filter(|(_, m)| m.active)
            .map(|(i, m)| BridgeInfo {
                index: i,
                name: m.name.clone(),
                exclusive: m.exclusive,
                ports: self.bridges[i].read().active(),
            })
            .collect()
    }

    /// Slot of the bridge named by the bridge part of `name`.
    fn bridge_slot(&self, reg: &Registry, name: &str) -> Result<usize> {
        let parsed = parse_name(name, &self.config.name_prefix)?;
        self.find_bridge(reg, parsed.bridge)
            .ok_or_else(|| SwitchError::BridgeNotFound(parsed.bridge.to_string()))
    }

    /// Replace the lookup of a bridge.
    pub fn register_ops(
        &self,
        name: &str,
        ops: Arc<dyn BridgeOps>,
        auth: Option<&AuthToken>,
    ) -> Result<()> {
        let reg = self.registry.lock();
        let idx = self.bridge_slot(&reg, name)?;
        Self::check_auth(&reg, idx, auth)?;
        self.bridges[idx].write().set_ops(ops);
        info!(bridge = %reg.metas[idx].name, "Registered lookup");
        Ok(())
    }

    /// Restore the learning lookup with an empty table.
    pub fn unregister_ops(&self, name: &str, auth: Option<&AuthToken>) -> Result<()> {
        let reg = self.registry.lock();
        let idx = self.bridge_slot(&reg, name)?;
        Self::check_auth(&reg, idx, auth)?;
        self.bridges[idx].write().reset_ops();
        info!(bridge = %reg.metas[idx].name, "Restored learning lookup");
        Ok(())
    }

    /// Hand a request to the bridge's lookup implementation.
    pub fn config_bridge(
        &self,
        name: &str,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let bridge = {
            let reg = self.registry.lock();
            self.bridges[self.bridge_slot(&reg, name)?].clone()
        };
        let state = bridge.read();
        state.ops().config(request)
    }

    fn check_standalone_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(':') {
            return Err(SwitchError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    /// Create a persistent virtual port that survives detach.
    pub fn create_port(&self, name: &str, rings: &RingRequest) -> Result<PortInfo> {
        Self::check_standalone_name(name)?;
        let mut reg = self.registry.lock();
        if reg.persistent.contains_key(name) || reg.nics.contains_key(name) {
            return Err(SwitchError::PortExists(name.to_string()));
        }
        let r = rings.resolve(&self.config.default_rings);
        let geometry = PortGeometry {
            tx_rings: r.tx_rings,
            rx_rings: r.rx_rings,
            tx_slots: r.tx_slots,
            rx_slots: r.rx_slots,
            buf_size: self.config.buf_size,
            mfs: self.config.default_mfs,
        };
        let port = Arc::new(Port::new_virtual(name, &geometry, self.alloc_mem_id(), true)?);
        let info = PortInfo::from_port(&port);
        reg.persistent.insert(name.to_string(), port);
        info!(port = %name, "Created persistent port");
        Ok(info)
    }

    pub fn delete_port(&self, name: &str) -> Result<()> {
        let mut reg = self.registry.lock();
        let port = reg
            .persistent
            .get(name)
            .ok_or_else(|| SwitchError::PortNotFound(name.to_string()))?;
        if port.link().is_some() || port.users() > 0 {
            return Err(SwitchError::PortBusy(name.to_string()));
        }
        reg.persistent.remove(name);
        info!(port = %name, "Deleted persistent port");
        Ok(())
    }

    /// Open a virtual port for sending and receiving: an attached port by
    /// its full name, or a persistent port by its own name.
    pub fn open_port(&self, name: &str) -> Result<PortHandle> {
        let reg = self.registry.lock();
        let port = if name.contains(':') {
            self.attached_port(&reg, name)?.2
        } else {
            reg.persistent
                .get(name)
                .cloned()
                .ok_or_else(|| SwitchError::PortNotFound(name.to_string()))?
        };
        if port.is_wrap() {
            return Err(SwitchError::NotSupported(format!(
                "{name} is a NIC port; open the NIC instead"
            )));
        }
        debug!(port = %name, "Opened port");
        Ok(PortHandle::new(port))
    }

    /// Make a NIC available to the fabric under its driver name.
    pub fn register_nic(
        &self,
        driver: Arc<dyn NicDriver>,
        rings: &RingRequest,
    ) -> Result<Arc<NicAdapter>> {
        let name = driver.name().to_string();
        Self::check_standalone_name(&name)?;
        let mut reg = self.registry.lock();
        if reg.nics.contains_key(&name) || reg.persistent.contains_key(&name) {
            return Err(SwitchError::PortExists(name));
        }
        let r = rings.resolve(&self.config.default_rings);
        let geometry = NicGeometry {
            tx_rings: r.tx_rings,
            rx_rings: r.rx_rings,
            tx_slots: r.tx_slots,
            rx_slots: r.rx_slots,
            buf_size: self.config.buf_size,
        };
        let nic = Arc::new(NicAdapter::new(driver, &geometry, self.alloc_mem_id())?);
        reg.nics.insert(name.clone(), nic.clone());
        info!(nic = %name, tx_rings = r.tx_rings, rx_rings = r.rx_rings, "Registered NIC");
        Ok(nic)
    }

    /// Claim a NIC for direct use. It cannot be attached meanwhile.
    pub fn open_nic(&self, name: &str) -> Result<NicHandle> {
        let reg = self.registry.lock();
        let nic = reg
            .nics
            .get(name)
            .cloned()
            .ok_or_else(|| SwitchError::PortNotFound(name.to_string()))?;
        NicHandle::open(nic)
    }

    fn attached_nic(&self, reg: &Registry, name: &str) -> Result<Arc<NicAdapter>> {
        let (_, _, port) = self.attached_port(reg, name)?;
        match port.kind() {
            PortKind::Wrap { nic, .. } => Ok(nic.clone()),
            PortKind::Virtual => Err(SwitchError::NotSupported(format!(
                "{name} is not a NIC port"
            ))),
        }
    }

    /// Replace interrupts of an attached NIC with polling threads.
    pub fn polling_enable(
        &self,
        name: &str,
        mode: PollingMode,
        first_cpu: usize,
        num_cpus: usize,
    ) -> Result<PollingPlan> {
        let reg = self.registry.lock();
        let nic = self.attached_nic(&reg, name)?;
        let mut slot = nic.polling().lock();
        if slot.is_some() {
            return Err(SwitchError::PollingActive(name.to_string()));
        }
        let avail = std::thread::available_parallelism().map_or(1, |n| n.get());
        let plan = polling::plan(mode, first_cpu, num_cpus, nic.num_rx_rings(), avail)?;
        let handle = PollingHandle::start(&nic, plan)?;
        *slot = Some(handle);
        Ok(plan)
    }

    pub fn polling_disable(&self, name: &str) -> Result<()> {
        let reg = self.registry.lock();
        let nic = self.attached_nic(&reg, name)?;
        let handle = nic.polling().lock().take();
        match handle {
            Some(h) => {
                h.stop(&nic);
                Ok(())
            }
            None => Err(SwitchError::PollingInactive(name.to_string())),
        }
    }

    /// Set the virtio-net header length of a virtual port.
    pub fn set_virt_hdr_len(&self, name: &str, len: usize) -> Result<()> {
        if !VALID_VNET_HDR_LENS.contains(&len) {
            return Err(SwitchError::InvalidArgument(format!(
                "virtio-net header length {len}"
            )));
        }
        let reg = self.registry.lock();
        let (bridge, port) = if name.contains(':') {
            let (b, _, port) = self.attached_port(&reg, name)?;
            (Some(self.bridges[b].clone()), port)
        } else {
            let port = reg
                .persistent
                .get(name)
                .cloned()
                .ok_or_else(|| SwitchError::PortNotFound(name.to_string()))?;
            (port.link().map(|l| l.bridge.clone()), port)
        };
        if port.is_wrap() {
            return Err(SwitchError::NotSupported(format!(
                "{name} takes its header length from the NIC"
            )));
        }
        // Keep the change out of in-flight forwarding passes.
        let _guard = bridge.as_ref().map(|b| b.write());
        port.set_virt_hdr_len(len);
        info!(port = %name, len, "Set virtio-net header length");
        Ok(())
    }

    /// Execute a control request.
    pub fn handle(&self, request: Request, auth: Option<&AuthToken>) -> Result<Response> {
        debug!(?request, "Control request");
        match request {
            Request::Attach { name, host, rings } => {
                let (port, host) = self.attach(&name, host, &rings, auth)?;
                Ok(Response::Attached { port, host })
            }
            Request::Detach { name } => {
                self.detach(&name, auth)?;
                Ok(Response::Detached { name })
            }
            Request::List {
                name,
                bridge_idx,
                port_idx,
            } => {
                let (port, bridge_idx, port_idx) =
                    self.list(name.as_deref(), bridge_idx, port_idx)?;
                Ok(Response::Listed {
                    port,
                    bridge_idx,
                    port_idx,
                })
            }
            Request::PollingEnable {
                name,
                mode,
                first_cpu,
                num_cpus,
            } => {
                let plan = self.polling_enable(&name, mode, first_cpu, num_cpus)?;
                Ok(Response::Polling { plan })
            }
            Request::PollingDisable { name } => {
                self.polling_disable(&name)?;
                Ok(Response::PollingStopped { name })
            }
            Request::CreatePort { name, rings } => {
                let port = self.create_port(&name, &rings)?;
                Ok(Response::PortCreated { port })
            }
            Request::DeletePort { name } => {
                self.delete_port(&name)?;
                Ok(Response::PortDeleted { name })
            }
            Request::SetVnetHdr { name, hdr_len } => {
                self.set_virt_hdr_len(&name, hdr_len)?;
                Ok(Response::VnetHdrSet { name, hdr_len })
            }
            Request::Config { name, request } => {
                let reply = self.config_bridge(&name, &request)?;
                Ok(Response::Config { reply })
            }
        }
    }

    /// Stop all polling and detach every port, exclusive bridges included.
    pub fn shutdown(&self) {
        let mut reg = self.registry.lock();
        for nic in reg.nics.values() {
            let handle = nic.polling().lock().take();
            if let Some(h) = handle {
                h.stop(nic);
            }
        }
        for idx in 0..self.bridges.len() {
            if !reg.metas[idx].active {
                continue;
            }
            reg.metas[idx].exclusive = false;
            loop {
                let next = {
                    let state = self.bridges[idx].read();
                    state
                        .active_indices()
                        .iter()
                        .copied()
                        .find_map(|i| {
                            state
                                .port(i)
                                .filter(|p| {
                                    !matches!(
                                        p.kind(),
                                        PortKind::Wrap {
                                            side: WrapSide::Host,
                                            ..
                                        }
                                    )
                                })
                                .map(|p| (i, p.clone()))
                        })
                };
                let Some((p, port)) = next else { break };
                self.detach_locked(&mut reg, idx, p, &port);
            }
            if reg.metas[idx].active {
                warn!(bridge = %reg.metas[idx].name, "Bridge still active after shutdown");
                reg.metas[idx] = BridgeMeta::default();
            }
        }
        info!("Switch fabric shut down");
    }
}
