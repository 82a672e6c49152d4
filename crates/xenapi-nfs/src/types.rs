//! Shared types for the XenAPI NFS driver.

use crate::error::{XenApiError, XenApiResult};
use crate::xmlrpc::Value;

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Opaque references
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The reference XAPI uses for "no object".
pub const NULL_REF: &str = "OpaqueRef:NULL";

macro_rules! opaque_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_null(&self) -> bool {
                self.0.is_empty() || self.0 == NULL_REF
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&$name> for Value {
            fn from(r: &$name) -> Self {
                Value::String(r.0.clone())
            }
        }
    };
}

opaque_ref!(
    /// Login session handle.
    SessionRef
);
opaque_ref!(
    /// Storage repository.
    SrRef
);
opaque_ref!(
    /// Physical block device (SR attachment on a host).
    PbdRef
);
opaque_ref!(
    /// Virtual disk image.
    VdiRef
);
opaque_ref!(HostRef);
opaque_ref!(PoolRef);
opaque_ref!(VmRef);
opaque_ref!(
    /// Virtual block device (VDI attachment on a VM).
    VbdRef
);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  NFS target / volume descriptor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// SR type string for NFS-backed repositories.
pub const NFS_SR_TYPE: &str = "nfs";

/// An NFS export that backs an SR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsExport {
    /// NFS server hostname / IP
    pub server: String,
    /// Exported directory on the server
    pub serverpath: String,
}

impl NfsExport {
    pub fn new(server: impl Into<String>, serverpath: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            serverpath: serverpath.into(),
        }
    }

    /// `device_config` map understood by the NFS SR backend.
    pub fn device_config(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("server".to_string(), self.server.clone()),
            ("serverpath".to_string(), self.serverpath.clone()),
        ])
    }
}

/// Human-readable SR labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrLabels {
    pub name_label: String,
    pub name_description: String,
}

impl SrLabels {
    pub fn new(name_label: impl Into<String>, name_description: impl Into<String>) -> Self {
        Self {
            name_label: name_label.into(),
            name_description: name_description.into(),
        }
    }
}

impl Default for SrLabels {
    fn default() -> Self {
        Self::new("name-label", "name-description")
    }
}

/// Everything needed to reconnect to a previously created volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub server: String,
    pub serverpath: String,
    pub sr_uuid: String,
    pub vdi_uuid: String,
}

impl ConnectionData {
    pub fn export(&self) -> NfsExport {
        NfsExport::new(self.server.clone(), self.serverpath.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// XAPI encodes `int64` fields as decimal strings.
fn de_int64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Subset of the `SR` record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SrRecord {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name_label: String,
    #[serde(default)]
    pub name_description: String,
    #[serde(default, rename = "type")]
    pub sr_type: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub shared: bool,
    #[serde(default, rename = "PBDs")]
    pub pbds: Vec<PbdRef>,
    #[serde(default, rename = "VDIs")]
    pub vdis: Vec<VdiRef>,
    #[serde(default, deserialize_with = "de_int64")]
    pub physical_size: i64,
    #[serde(default)]
    pub sm_config: BTreeMap<String, String>,
}

/// Subset of the `VDI` record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VdiRecord {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name_label: String,
    #[serde(default, rename = "SR")]
    pub sr: Option<SrRef>,
    #[serde(default, deserialize_with = "de_int64")]
    pub virtual_size: i64,
    #[serde(default, rename = "type")]
    pub vdi_type: String,
    #[serde(default)]
    pub sharable: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub location: String,
    #[serde(default, rename = "VBDs")]
    pub vbds: Vec<VbdRef>,
}

/// Subset of the `PBD` record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PbdRecord {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub host: Option<HostRef>,
    #[serde(default, rename = "SR")]
    pub sr: Option<SrRef>,
    #[serde(default)]
    pub device_config: BTreeMap<String, String>,
    #[serde(default)]
    pub currently_attached: bool,
}

/// Subset of the `host` record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostRecord {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name_label: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub address: String,
}

/// Subset of the `VBD` record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VbdRecord {
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "VM")]
    pub vm: Option<VmRef>,
    #[serde(default, rename = "VDI")]
    pub vdi: Option<VdiRef>,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub userdevice: String,
    #[serde(default)]
    pub currently_attached: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Create specs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Argument record for `VDI.create`.
#[derive(Debug, Clone, Serialize)]
pub struct VdiCreateSpec {
    #[serde(rename = "SR")]
    pub sr: SrRef,
    /// Bytes, sent as a decimal string.
    pub virtual_size: String,
    #[serde(rename = "type")]
    pub vdi_type: String,
    pub sharable: bool,
    pub read_only: bool,
    pub other_config: BTreeMap<String, String>,
}

/// Argument record for `PBD.create`.
#[derive(Debug, Clone, Serialize)]
pub struct PbdCreateSpec {
    pub host: HostRef,
    #[serde(rename = "SR")]
    pub sr: SrRef,
    pub device_config: BTreeMap<String, String>,
}

/// VBD access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdMode {
    #[serde(rename = "RO")]
    ReadOnly,
    #[serde(rename = "RW")]
    ReadWrite,
}

/// Argument record for `VBD.create`.
#[derive(Debug, Clone, Serialize)]
pub struct VbdCreateSpec {
    #[serde(rename = "VM")]
    pub vm: VmRef,
    #[serde(rename = "VDI")]
    pub vdi: VdiRef,
    pub userdevice: String,
    pub bootable: bool,
    pub mode: VbdMode,
    #[serde(rename = "type")]
    pub vbd_type: String,
    pub empty: bool,
    pub other_config: BTreeMap<String, String>,
    pub qos_algorithm_type: String,
    pub qos_algorithm_params: BTreeMap<String, String>,
}

impl VbdCreateSpec {
    /// A non-bootable disk VBD with an automatically chosen device slot.
    pub fn disk(vm: VmRef, vdi: VdiRef, mode: VbdMode) -> Self {
        Self {
            vm,
            vdi,
            userdevice: "autodetect".to_string(),
            bootable: false,
            mode,
            vbd_type: "Disk".to_string(),
            empty: false,
            other_config: BTreeMap::new(),
            qos_algorithm_type: String::new(),
            qos_algorithm_params: BTreeMap::new(),
        }
    }
}

const GIB: u64 = 1024 * 1024 * 1024;

/// GiB to bytes. XAPI sizes are `int64`, so anything above `i64::MAX`
/// bytes is rejected.
pub fn gib_to_bytes(size_gb: u64) -> XenApiResult<u64> {
    size_gb
        .checked_mul(GIB)
        .filter(|bytes| *bytes <= i64::MAX as u64)
        .ok_or_else(|| {
            XenApiError::config(format!("{size_gb} GiB does not fit in an int64 byte count"))
        })
}
