//! XenAPI session wrapper.
//!
//! `XenApiSession` owns a login handle and a shared transport. Every remote
//! failure surfaces as [`XenApiError`] with the original `ErrorDescription`
//! attached; nothing is retried. The convenience methods map 1:1 onto remote
//! calls, the per-class managers (`session.sr()`, `session.vdi()`, …) expose
//! the rest of each class.

use crate::config::XenApiConfig;
use crate::error::{XenApiError, XenApiResult};
use crate::host::HostManager;
use crate::pbd::PbdManager;
use crate::pool::PoolManager;
use crate::sr::{SrCreateSpec, SrIntroduceSpec, SrManager};
use crate::transport::{HttpTransport, XenApiTransport};
use crate::types::*;
use crate::vdi::VdiManager;
use crate::vm::{VbdManager, VmManager};
use crate::xmlrpc::{self, Value};

use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// API version sent with `session.login_with_password`.
pub const API_VERSION: &str = "1.0";

/// Originator string sent with `session.login_with_password`.
pub const ORIGINATOR: &str = "xenapi-nfs";

/// VDI type used for volumes created by this crate.
pub const USER_VDI_TYPE: &str = "User";

/// A logged-in XenAPI session. Clones share the same handle.
#[derive(Clone)]
pub struct XenApiSession {
    transport: Arc<dyn XenApiTransport>,
    handle: SessionRef,
}

impl std::fmt::Debug for XenApiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XenApiSession")
            .field("endpoint", &self.transport.endpoint())
            .field("handle", &self.handle)
            .finish()
    }
}

impl XenApiSession {
    /// Log in with username / password.
    pub async fn login_with_password(
        transport: Arc<dyn XenApiTransport>,
        username: &str,
        password: &str,
    ) -> XenApiResult<Self> {
        let method = "session.login_with_password";
        let raw = transport
            .request(
                method,
                vec![
                    Value::from(username),
                    Value::from(password),
                    Value::from(API_VERSION),
                    Value::from(ORIGINATOR),
                ],
            )
            .await?;
        let handle: SessionRef = xmlrpc::from_value(xmlrpc::unwrap_envelope(method, raw)?)?;
        log::debug!("Logged in to {} as {}", transport.endpoint(), username);
        Ok(Self { transport, handle })
    }

    /// Current login handle.
    pub fn handle(&self) -> &SessionRef {
        &self.handle
    }

    /// Log out. The handle is invalid afterwards; later calls fail remotely.
    pub async fn close(&self) -> XenApiResult<()> {
        self.call_xenapi("session.logout", Vec::new()).await?;
        log::debug!("Logged out of {}", self.transport.endpoint());
        Ok(())
    }

    /// Invoke `method` with the session handle prepended to `args`.
    pub async fn call_xenapi(&self, method: &str, args: Vec<Value>) -> XenApiResult<Value> {
        log::debug!("XenAPI call {method}");
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::from(&self.handle));
        params.extend(args);
        let raw = self.transport.request(method, params).await?;
        xmlrpc::unwrap_envelope(method, raw)
    }

    /// [`call_xenapi`](Self::call_xenapi) with a typed result.
    pub(crate) async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> XenApiResult<T> {
        let value = self.call_xenapi(method, args).await?;
        xmlrpc::from_value(value).map_err(|e| {
            XenApiError::decode(format!("{method} returned an unexpected value: {}", e.message))
        })
    }

    /// [`call_xenapi`](Self::call_xenapi) discarding the result.
    pub(crate) async fn call_unit(&self, method: &str, args: Vec<Value>) -> XenApiResult<()> {
        self.call_xenapi(method, args).await?;
        Ok(())
    }

    // ── Class managers ──────────────────────────────────────────────

    pub fn sr(&self) -> SrManager<'_> {
        SrManager::new(self)
    }

    pub fn vdi(&self) -> VdiManager<'_> {
        VdiManager::new(self)
    }

    pub fn pbd(&self) -> PbdManager<'_> {
        PbdManager::new(self)
    }

    pub fn host(&self) -> HostManager<'_> {
        HostManager::new(self)
    }

    pub fn pool(&self) -> PoolManager<'_> {
        PoolManager::new(self)
    }

    pub fn vm(&self) -> VmManager<'_> {
        VmManager::new(self)
    }

    pub fn vbd(&self) -> VbdManager<'_> {
        VbdManager::new(self)
    }

    // ── Pass-through accessors ──────────────────────────────────────

    /// Whether this session came from a pool-internal login.
    pub async fn get_pool(&self) -> XenApiResult<bool> {
        self.call("session.get_pool", vec![Value::from(&self.handle)])
            .await
    }

    /// The host this session is logged in to.
    pub async fn get_this_host(&self) -> XenApiResult<HostRef> {
        self.call("session.get_this_host", vec![Value::from(&self.handle)])
            .await
    }

    pub async fn get_pbds(&self) -> XenApiResult<Vec<PbdRef>> {
        self.pbd().get_all().await
    }

    pub async fn get_srs(&self) -> XenApiResult<Vec<SrRef>> {
        self.sr().get_all().await
    }

    pub async fn get_vdis(&self) -> XenApiResult<Vec<VdiRef>> {
        self.vdi().get_all().await
    }

    pub async fn get_sr_record(&self, sr: &SrRef) -> XenApiResult<SrRecord> {
        self.sr().get_record(sr).await
    }

    pub async fn get_vdi_record(&self, vdi: &VdiRef) -> XenApiResult<VdiRecord> {
        self.vdi().get_record(vdi).await
    }

    pub async fn get_host_record(&self, host: &HostRef) -> XenApiResult<HostRecord> {
        self.host().get_record(host).await
    }

    pub async fn forget_sr(&self, sr: &SrRef) -> XenApiResult<()> {
        self.sr().forget(sr).await
    }

    pub async fn unplug_pbd(&self, pbd: &PbdRef) -> XenApiResult<()> {
        self.pbd().unplug(pbd).await
    }

    pub async fn plug_pbd(&self, pbd: &PbdRef) -> XenApiResult<()> {
        self.pbd().plug(pbd).await
    }

    pub async fn scan_sr(&self, sr: &SrRef) -> XenApiResult<()> {
        self.sr().scan(sr).await
    }

    pub async fn get_vdi_by_uuid(&self, vdi_uuid: &str) -> XenApiResult<VdiRef> {
        self.vdi().get_by_uuid(vdi_uuid).await
    }

    pub async fn get_host_by_uuid(&self, host_uuid: &str) -> XenApiResult<HostRef> {
        self.host().get_by_uuid(host_uuid).await
    }

    pub async fn create_sr(&self, host: &HostRef, spec: &SrCreateSpec) -> XenApiResult<SrRef> {
        self.sr().create(host, spec).await
    }

    pub async fn introduce_sr(&self, spec: &SrIntroduceSpec) -> XenApiResult<SrRef> {
        self.sr().introduce(spec).await
    }

    /// Create a VDI of `size_bytes` in `sr`.
    pub async fn create_vdi(
        &self,
        sr: &SrRef,
        size_bytes: u64,
        vdi_type: &str,
        sharable: bool,
        read_only: bool,
        other_config: Option<BTreeMap<String, String>>,
    ) -> XenApiResult<VdiRef> {
        let spec = VdiCreateSpec {
            sr: sr.clone(),
            virtual_size: size_bytes.to_string(),
            vdi_type: vdi_type.to_string(),
            sharable,
            read_only,
            other_config: other_config.unwrap_or_default(),
        };
        self.vdi().create(&spec).await
    }

    pub async fn create_pbd(
        &self,
        host: &HostRef,
        sr: &SrRef,
        device_config: BTreeMap<String, String>,
    ) -> XenApiResult<PbdRef> {
        let spec = PbdCreateSpec {
            host: host.clone(),
            sr: sr.clone(),
            device_config,
        };
        self.pbd().create(&spec).await
    }

    /// Run `function` of a host plugin; returns the plugin's string output.
    pub async fn call_plugin(
        &self,
        host: &HostRef,
        plugin: &str,
        function: &str,
        args: BTreeMap<String, String>,
    ) -> XenApiResult<String> {
        self.host().call_plugin(host, plugin, function, args).await
    }

    // ── Record-based helpers ────────────────────────────────────────

    pub async fn get_sr_uuid(&self, sr: &SrRef) -> XenApiResult<String> {
        Ok(self.get_sr_record(sr).await?.uuid)
    }

    pub async fn get_vdi_uuid(&self, vdi: &VdiRef) -> XenApiResult<String> {
        Ok(self.get_vdi_record(vdi).await?.uuid)
    }

    pub async fn get_host_uuid(&self, host: &HostRef) -> XenApiResult<String> {
        Ok(self.get_host_record(host).await?.uuid)
    }

    pub async fn is_nfs_sr(&self, sr: &SrRef) -> XenApiResult<bool> {
        Ok(self.get_sr_record(sr).await?.sr_type == NFS_SR_TYPE)
    }

    // ── Compound operations ─────────────────────────────────────────

    /// Unplug every PBD of `sr`, then forget it. The SR contents stay on
    /// the storage.
    pub async fn unplug_pbds_and_forget_sr(&self, sr: &SrRef) -> XenApiResult<()> {
        let record = self.get_sr_record(sr).await?;
        for pbd in &record.pbds {
            self.unplug_pbd(pbd).await?;
        }
        self.forget_sr(sr).await?;
        log::info!("Detached SR {} ({} PBDs unplugged)", record.uuid, record.pbds.len());
        Ok(())
    }

    /// Create a `User` VDI of `size_bytes` in `sr`.
    pub async fn create_new_vdi(&self, sr: &SrRef, size_bytes: u64) -> XenApiResult<VdiRef> {
        self.create_vdi(sr, size_bytes, USER_VDI_TYPE, false, false, None)
            .await
    }
}

/// Log in to XAPI over `transport`.
pub async fn connect(
    transport: Arc<dyn XenApiTransport>,
    username: &str,
    password: &str,
) -> XenApiResult<XenApiSession> {
    XenApiSession::login_with_password(transport, username, password).await
}

/// Hands out a freshly logged-in session per request.
#[derive(Clone)]
pub struct SessionFactory {
    transport: Arc<dyn XenApiTransport>,
    username: String,
    password: String,
}

impl SessionFactory {
    pub fn new(
        transport: Arc<dyn XenApiTransport>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Factory backed by an [`HttpTransport`].
    pub fn from_config(config: &XenApiConfig) -> XenApiResult<Self> {
        config.validate()?;
        let transport = HttpTransport::new(config)?;
        Ok(Self::new(
            Arc::new(transport),
            config.username.clone(),
            config.password.clone(),
        ))
    }

    pub async fn get_session(&self) -> XenApiResult<XenApiSession> {
        connect(self.transport.clone(), &self.username, &self.password).await
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("endpoint", &self.transport.endpoint())
            .field("username", &self.username)
            .finish()
    }
}
