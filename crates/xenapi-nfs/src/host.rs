//! `host.*` calls, including host plugin invocation.

use crate::error::XenApiResult;
use crate::session::XenApiSession;
use crate::types::*;
use crate::xmlrpc::Value;

use std::collections::BTreeMap;

/// Host operations.
pub struct HostManager<'a> {
    session: &'a XenApiSession,
}

impl<'a> HostManager<'a> {
    pub fn new(session: &'a XenApiSession) -> Self {
        Self { session }
    }

    // ── List / Get ──────────────────────────────────────────────────

    pub async fn get_all(&self) -> XenApiResult<Vec<HostRef>> {
        self.session.call("host.get_all", Vec::new()).await
    }

    pub async fn get_record(&self, host: &HostRef) -> XenApiResult<HostRecord> {
        self.session.call("host.get_record", vec![host.into()]).await
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> XenApiResult<HostRef> {
        self.session.call("host.get_by_uuid", vec![uuid.into()]).await
    }

    pub async fn get_uuid(&self, host: &HostRef) -> XenApiResult<String> {
        self.session.call("host.get_uuid", vec![host.into()]).await
    }

    // ── Plugins ─────────────────────────────────────────────────────

    /// Run `function` of the dom0 plugin `plugin` with string arguments.
    pub async fn call_plugin(
        &self,
        host: &HostRef,
        plugin: &str,
        function: &str,
        args: BTreeMap<String, String>,
    ) -> XenApiResult<String> {
        log::debug!("Calling plugin {plugin}.{function} on {host}");
        self.session
            .call(
                "host.call_plugin",
                vec![
                    host.into(),
                    Value::from(plugin),
                    Value::from(function),
                    Value::from(args),
                ],
            )
            .await
    }
}
