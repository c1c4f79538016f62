//! Device identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform-level address of a device: the (tenant, device id) pair.
///
/// Serialized as `{"t": tenant, "d": device_id}`, the correlation shape the
/// platform uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(rename = "t")]
    tenant: String,
    #[serde(rename = "d")]
    device_id: String,
}

impl DeviceIdentity {
    pub fn new(tenant: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            device_id: device_id.into(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant, self.device_id)
    }
}
