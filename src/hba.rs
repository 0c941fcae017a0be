//! Virtual HBA contexts.
//!
//! An [`HbaContext`] is either a pure virtual-host-id namespace used for
//! configuration grouping, or bound exclusively to one physical adapter in
//! passthrough mode. The two modes are a tagged enum with payload, so an
//! invalid combination (a per-device host id fighting a bound adapter) is a
//! single checked call site rather than scattered flag tests.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::registry::{HostBinding, HostRegistry, PhysicalHost};
use crate::{Error, Result};

/// Queue-depth ceiling while no physical adapter is bound. Virtual mode is a
/// configuration namespace only, so the ceiling is nominal.
pub const VIRTUAL_QUEUE_DEPTH: u16 = 1;

/// Addressing mode of an HBA context.
pub enum HbaMode {
    /// Pure configuration grouping; each binding names its own adapter.
    VirtualHostId { host_id: u32 },
    /// Every binding must live on this one adapter.
    BoundPhysicalHost(HostBinding),
}

impl fmt::Debug for HbaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VirtualHostId { host_id } => {
                f.debug_struct("VirtualHostId").field("host_id", host_id).finish()
            }
            Self::BoundPhysicalHost(b) => f
                .debug_struct("BoundPhysicalHost")
                .field("host", &b.host().id())
                .finish(),
        }
    }
}

struct HbaState {
    mode: HbaMode,
    queue_depth: u16,
    /// In virtual mode, the adapter resolved by the first binding. Later
    /// bindings must name the same adapter id.
    pinned: Option<Arc<PhysicalHost>>,
    bindings: usize,
}

/// One virtual adapter context, owner of at most one physical-adapter
/// binding and the parent of the device bindings created under it.
pub struct HbaContext {
    registry: Arc<HostRegistry>,
    virtual_id: u32,
    state: Mutex<HbaState>,
}

impl fmt::Debug for HbaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("HbaContext")
            .field("virtual_id", &self.virtual_id)
            .field("mode", &st.mode)
            .field("queue_depth", &st.queue_depth)
            .field("bindings", &st.bindings)
            .finish_non_exhaustive()
    }
}

impl HbaContext {
    /// Register a new context in virtual-host-id mode.
    #[must_use]
    pub fn attach(registry: Arc<HostRegistry>, host_id: u32) -> Arc<Self> {
        tracing::debug!(host_id, "attached virtual HBA context");
        Arc::new(Self {
            registry,
            virtual_id: host_id,
            state: Mutex::new(HbaState {
                mode: HbaMode::VirtualHostId { host_id },
                queue_depth: VIRTUAL_QUEUE_DEPTH,
                pinned: None,
                bindings: 0,
            }),
        })
    }

    /// Switch passthrough mode on or off.
    ///
    /// Enabling resolves the named physical adapter, claims it exclusively
    /// and adopts its advertised queue depth. Disabling releases the
    /// adapter and reverts to the virtual default. Either direction fails
    /// with [`Error::Busy`] while device bindings exist.
    pub fn set_passthrough_mode(&self, enable: bool, host_id: Option<u32>) -> Result<()> {
        let mut st = self.state.lock();
        if st.bindings != 0 {
            return Err(Error::Busy);
        }
        if enable {
            let id = host_id.ok_or(Error::ConfigurationIncomplete("passthrough requires a host id"))?;
            let host = self.registry.lookup(id).ok_or(Error::NotFound)?;
            let binding = host.try_bind()?;
            st.queue_depth = host.queue_depth();
            st.mode = HbaMode::BoundPhysicalHost(binding);
            tracing::info!(host = id, queue_depth = st.queue_depth, "bound physical host");
        } else {
            st.mode = HbaMode::VirtualHostId {
                host_id: self.virtual_id,
            };
            st.queue_depth = VIRTUAL_QUEUE_DEPTH;
            tracing::info!("reverted to virtual host id mode");
        }
        Ok(())
    }

    /// Release any held physical-adapter reference. All device bindings
    /// must already be destroyed; this is a precondition, not a cascade.
    pub fn detach(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.bindings != 0 {
            return Err(Error::Busy);
        }
        st.mode = HbaMode::VirtualHostId {
            host_id: self.virtual_id,
        };
        st.queue_depth = VIRTUAL_QUEUE_DEPTH;
        tracing::debug!(host_id = self.virtual_id, "detached HBA context");
        Ok(())
    }

    /// Current queue-depth ceiling.
    #[must_use]
    pub fn queue_depth(&self) -> u16 {
        self.state.lock().queue_depth
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings
    }

    #[must_use]
    pub(crate) fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    /// Resolve the physical adapter a new binding should search under.
    ///
    /// Bound mode uses the bound adapter and rejects a contradicting
    /// explicit host id. Virtual mode requires an explicit host id; the
    /// first binding pins the resolved adapter, and later bindings naming a
    /// different one are rejected.
    pub(crate) fn resolve_host_for_bind(&self, explicit: Option<u32>) -> Result<Arc<PhysicalHost>> {
        let st = self.state.lock();
        match &st.mode {
            HbaMode::BoundPhysicalHost(binding) => {
                let host = binding.host();
                if explicit.is_some_and(|id| id != host.id()) {
                    return Err(Error::ConfigurationIncomplete(
                        "host id conflicts with the bound physical host",
                    ));
                }
                Ok(Arc::clone(host))
            }
            HbaMode::VirtualHostId { .. } => {
                let id = explicit.ok_or(Error::ConfigurationIncomplete(
                    "binding requires a host id while no physical host is bound",
                ))?;
                if let Some(pinned) = &st.pinned {
                    if pinned.id() != id {
                        return Err(Error::ConfigurationIncomplete(
                            "bindings under one virtual context must share one physical host",
                        ));
                    }
                    return Ok(Arc::clone(pinned));
                }
                self.registry.lookup(id).ok_or(Error::NotFound)
            }
        }
    }

    /// Account a successful bind; pins the adapter in virtual mode.
    ///
    /// Resolution and accounting are separate critical sections with the
    /// whole claim/discovery sequence in between, so the adapter is
    /// re-validated here under the state lock: a concurrent bind may have
    /// pinned a different adapter, or a mode change may have bound one,
    /// since `resolve_host_for_bind` ran. Failing here fails the bind.
    pub(crate) fn binding_created(&self, host: &Arc<PhysicalHost>) -> Result<()> {
        let mut st = self.state.lock();
        match &st.mode {
            HbaMode::BoundPhysicalHost(binding) => {
                if binding.host().id() != host.id() {
                    return Err(Error::ConfigurationIncomplete(
                        "physical host binding changed while the device was being bound",
                    ));
                }
            }
            HbaMode::VirtualHostId { .. } => match &st.pinned {
                Some(pinned) if pinned.id() != host.id() => {
                    return Err(Error::ConfigurationIncomplete(
                        "bindings under one virtual context must share one physical host",
                    ));
                }
                Some(_) => {}
                None => st.pinned = Some(Arc::clone(host)),
            },
        }
        st.bindings += 1;
        Ok(())
    }

    pub(crate) fn binding_dropped(&self) {
        let mut st = self.state.lock();
        st.bindings -= 1;
        if st.bindings == 0 {
            st.pinned = None;
        }
    }
}
