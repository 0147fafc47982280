//! Device identity used to authenticate against the billboard API.

use std::path::Path;

use anyhow::{bail, Context, Result};

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Stable identity of this device: hostname plus the machine-id secret.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub secret: String,
}

impl DeviceIdentity {
    /// Discover the identity from the running system. Missing or empty
    /// machine-id is a fatal startup error.
    pub fn discover() -> Result<Self> {
        let device_id = gethostname::gethostname()
            .into_string()
            .map_err(|raw| anyhow::anyhow!("hostname is not valid UTF-8: {raw:?}"))?;
        Self::from_machine_id_file(device_id, Path::new(MACHINE_ID_PATH))
    }

    fn from_machine_id_file(device_id: String, machine_id: &Path) -> Result<Self> {
        let secret = std::fs::read_to_string(machine_id)
            .with_context(|| format!("missing {}", machine_id.display()))?
            .trim()
            .to_string();
        if secret.is_empty() {
            bail!("empty machine-id in {}", machine_id.display());
        }
        Ok(Self { device_id, secret })
    }
}
