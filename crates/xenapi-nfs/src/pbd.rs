//! `PBD.*` calls.

use crate::error::XenApiResult;
use crate::session::XenApiSession;
use crate::types::*;
use crate::xmlrpc;

/// Physical block device (SR attachment) operations.
pub struct PbdManager<'a> {
    session: &'a XenApiSession,
}

impl<'a> PbdManager<'a> {
    pub fn new(session: &'a XenApiSession) -> Self {
        Self { session }
    }

    pub async fn get_all(&self) -> XenApiResult<Vec<PbdRef>> {
        self.session.call("PBD.get_all", Vec::new()).await
    }

    pub async fn get_record(&self, pbd: &PbdRef) -> XenApiResult<PbdRecord> {
        self.session.call("PBD.get_record", vec![pbd.into()]).await
    }

    pub async fn create(&self, spec: &PbdCreateSpec) -> XenApiResult<PbdRef> {
        self.session
            .call("PBD.create", vec![xmlrpc::to_value(spec)?])
            .await
    }

    pub async fn plug(&self, pbd: &PbdRef) -> XenApiResult<()> {
        self.session.call_unit("PBD.plug", vec![pbd.into()]).await
    }

    pub async fn unplug(&self, pbd: &PbdRef) -> XenApiResult<()> {
        self.session.call_unit("PBD.unplug", vec![pbd.into()]).await
    }

    pub async fn destroy(&self, pbd: &PbdRef) -> XenApiResult<()> {
        self.session.call_unit("PBD.destroy", vec![pbd.into()]).await
    }
}
