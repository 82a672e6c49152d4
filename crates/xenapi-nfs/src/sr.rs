//! `SR.*` calls.

use crate::error::XenApiResult;
use crate::session::XenApiSession;
use crate::types::*;
use crate::xmlrpc::Value;

use std::collections::BTreeMap;

/// Storage repository operations.
pub struct SrManager<'a> {
    session: &'a XenApiSession,
}

impl<'a> SrManager<'a> {
    pub fn new(session: &'a XenApiSession) -> Self {
        Self { session }
    }

    // ── List / Get ──────────────────────────────────────────────────

    pub async fn get_all(&self) -> XenApiResult<Vec<SrRef>> {
        self.session.call("SR.get_all", Vec::new()).await
    }

    pub async fn get_record(&self, sr: &SrRef) -> XenApiResult<SrRecord> {
        self.session.call("SR.get_record", vec![sr.into()]).await
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> XenApiResult<SrRef> {
        self.session.call("SR.get_by_uuid", vec![uuid.into()]).await
    }

    pub async fn get_uuid(&self, sr: &SrRef) -> XenApiResult<String> {
        self.session.call("SR.get_uuid", vec![sr.into()]).await
    }

    pub async fn get_name_label(&self, sr: &SrRef) -> XenApiResult<String> {
        self.session.call("SR.get_name_label", vec![sr.into()]).await
    }

    pub async fn get_name_description(&self, sr: &SrRef) -> XenApiResult<String> {
        self.session
            .call("SR.get_name_description", vec![sr.into()])
            .await
    }

    pub async fn get_pbds(&self, sr: &SrRef) -> XenApiResult<Vec<PbdRef>> {
        self.session.call("SR.get_PBDs", vec![sr.into()]).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create a new SR on `host` (physical_size "0", content_type "" and
    /// sm_config {} when unset).
    pub async fn create(&self, host: &HostRef, spec: &SrCreateSpec) -> XenApiResult<SrRef> {
        let sr: SrRef = self
            .session
            .call(
                "SR.create",
                vec![
                    host.into(),
                    Value::from(&spec.device_config),
                    Value::from(spec.physical_size.unwrap_or(0).to_string()),
                    Value::from(&spec.labels.name_label),
                    Value::from(&spec.labels.name_description),
                    Value::from(&spec.sr_type),
                    Value::from(spec.content_type.clone().unwrap_or_default()),
                    Value::from(spec.shared),
                    Value::from(spec.sm_config.clone().unwrap_or_default()),
                ],
            )
            .await?;
        log::info!("Created {} SR {}", spec.sr_type, sr);
        Ok(sr)
    }

    /// Introduce an existing SR (by uuid) without attaching it.
    pub async fn introduce(&self, spec: &SrIntroduceSpec) -> XenApiResult<SrRef> {
        let sr: SrRef = self
            .session
            .call(
                "SR.introduce",
                vec![
                    Value::from(&spec.uuid),
                    Value::from(&spec.labels.name_label),
                    Value::from(&spec.labels.name_description),
                    Value::from(&spec.sr_type),
                    Value::from(spec.content_type.clone().unwrap_or_default()),
                    Value::from(spec.shared),
                    Value::from(spec.sm_config.clone().unwrap_or_default()),
                ],
            )
            .await?;
        log::info!("Introduced SR {} as {}", spec.uuid, sr);
        Ok(sr)
    }

    /// Remove the SR record; the storage contents are kept.
    pub async fn forget(&self, sr: &SrRef) -> XenApiResult<()> {
        self.session.call_unit("SR.forget", vec![sr.into()]).await
    }

    /// Remove the SR record and delete its storage. Needs a plugged PBD.
    pub async fn destroy(&self, sr: &SrRef) -> XenApiResult<()> {
        self.session.call_unit("SR.destroy", vec![sr.into()]).await?;
        log::info!("Destroyed SR {}", sr);
        Ok(())
    }

    /// Refresh the VDI list from the storage.
    pub async fn scan(&self, sr: &SrRef) -> XenApiResult<()> {
        self.session.call_unit("SR.scan", vec![sr.into()]).await
    }
}

// ── Argument specs ──────────────────────────────────────────────────

/// Arguments of `SR.create`.
#[derive(Debug, Clone)]
pub struct SrCreateSpec {
    pub device_config: BTreeMap<String, String>,
    pub physical_size: Option<i64>,
    pub labels: SrLabels,
    pub sr_type: String,
    pub content_type: Option<String>,
    pub shared: bool,
    pub sm_config: Option<BTreeMap<String, String>>,
}

impl SrCreateSpec {
    /// Unshared NFS SR on `export`.
    pub fn nfs(export: &NfsExport, labels: &SrLabels) -> Self {
        Self {
            device_config: export.device_config(),
            physical_size: None,
            labels: labels.clone(),
            sr_type: NFS_SR_TYPE.to_string(),
            content_type: None,
            shared: false,
            sm_config: None,
        }
    }
}

/// Arguments of `SR.introduce`.
#[derive(Debug, Clone)]
pub struct SrIntroduceSpec {
    pub uuid: String,
    pub labels: SrLabels,
    pub sr_type: String,
    pub content_type: Option<String>,
    pub shared: bool,
    pub sm_config: Option<BTreeMap<String, String>>,
}

impl SrIntroduceSpec {
    /// Unshared NFS SR with a known uuid.
    pub fn nfs(uuid: impl Into<String>, labels: &SrLabels) -> Self {
        Self {
            uuid: uuid.into(),
            labels: labels.clone(),
            sr_type: NFS_SR_TYPE.to_string(),
            content_type: None,
            shared: false,
            sm_config: None,
        }
    }
}
