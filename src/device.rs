//! # Device
//!
//! Opaque, process-scoped, shared-ownership handle to an opened RDMA NIC. Obtained by
//! enumerating the devices visible to the verbs provider, matching by name, then
//! opening. Modeled after the teacher's `RdmaServerConnector::aquire_ctx`, which
//! enumerates with `ibverbs::devices()` and opens the first match.

use std::fmt;
use std::sync::Arc;

use crate::error::{RdmaError, Result};

#[cfg(feature = "hardware")]
use std::sync::Once;

/// A process-scoped, cheaply-cloneable reference to an opened NIC.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

enum DeviceInner {
    #[cfg(feature = "hardware")]
    Hardware { name: String, ctx: Arc<ibverbs::Context> },
    /// Software stand-in used by the loopback provider and by the test suite, which
    /// runs without an RDMA-capable NIC attached.
    Loopback { name: String },
}

#[cfg(feature = "hardware")]
static FORK_INIT: Once = Once::new();

impl Device {
    /// Enumerates devices known to the provider and opens the first one whose name
    /// matches `name`. When built without the `hardware` feature, returns an opaque
    /// loopback handle carrying only the name, for use with the software provider.
    pub fn open(name: &str) -> Result<Device> {
        #[cfg(feature = "hardware")]
        {
            FORK_INIT.call_once(|| {
                // Safety: ibv_fork_init must run once, before any other verbs call,
                // in case the caller later forks.
                if unsafe { ibverbs::ffi::ibv_fork_init() } != 0 {
                    log::warn!(
                        "ibv_fork_init failed: {}",
                        std::io::Error::last_os_error()
                    );
                }
            });

            let dev_list = ibverbs::devices()
                .map_err(|e| RdmaError::config(format!("enumerating RDMA devices failed: {e}")))?;

            let dev = dev_list
                .iter()
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| RdmaError::config(format!("no RDMA device named {name}")))?;

            let ctx = dev
                .open()
                .map_err(|e| RdmaError::config(format!("opening RDMA device {name} failed: {e}")))?;

            log::debug!("opened RDMA device {name}");

            Ok(Device {
                inner: Arc::new(DeviceInner::Hardware { name: name.to_owned(), ctx: Arc::new(ctx) }),
            })
        }

        #[cfg(not(feature = "hardware"))]
        {
            log::debug!("opened loopback device {name}");
            Ok(Device { inner: Arc::new(DeviceInner::Loopback { name: name.to_owned() }) })
        }
    }

    /// Enumerates devices and opens the first available one, regardless of name.
    pub fn open_first() -> Result<Device> {
        #[cfg(feature = "hardware")]
        {
            let dev_list = ibverbs::devices()
                .map_err(|e| RdmaError::config(format!("enumerating RDMA devices failed: {e}")))?;
            let dev = dev_list
                .get(0)
                .ok_or_else(|| RdmaError::config("no RDMA devices in list"))?;
            let name = dev.name().unwrap_or_default();
            Self::open(&name)
        }

        #[cfg(not(feature = "hardware"))]
        {
            Self::open("loopback0")
        }
    }

    pub fn name(&self) -> &str {
        match &*self.inner {
            #[cfg(feature = "hardware")]
            DeviceInner::Hardware { name, .. } => name,
            DeviceInner::Loopback { name } => name,
        }
    }

    #[cfg(feature = "hardware")]
    pub(crate) fn context(&self) -> Arc<ibverbs::Context> {
        match &*self.inner {
            DeviceInner::Hardware { ctx, .. } => ctx.clone(),
            #[allow(unreachable_patterns)]
            _ => unreachable!("hardware device required"),
        }
    }

    pub(crate) fn is_hardware(&self) -> bool {
        #[cfg(feature = "hardware")]
        {
            matches!(&*self.inner, DeviceInner::Hardware { .. })
        }
        #[cfg(not(feature = "hardware"))]
        {
            false
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("name", &self.name()).finish()
    }
}
