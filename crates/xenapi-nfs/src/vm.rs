//! `VM.*` and `VBD.*` calls needed to attach volumes to a running VM.

use crate::error::XenApiResult;
use crate::session::XenApiSession;
use crate::types::*;
use crate::xmlrpc;

/// VM lookups.
pub struct VmManager<'a> {
    session: &'a XenApiSession,
}

impl<'a> VmManager<'a> {
    pub fn new(session: &'a XenApiSession) -> Self {
        Self { session }
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> XenApiResult<VmRef> {
        self.session.call("VM.get_by_uuid", vec![uuid.into()]).await
    }

    pub async fn get_vbds(&self, vm: &VmRef) -> XenApiResult<Vec<VbdRef>> {
        self.session.call("VM.get_VBDs", vec![vm.into()]).await
    }
}

/// Virtual block device operations.
pub struct VbdManager<'a> {
    session: &'a XenApiSession,
}

impl<'a> VbdManager<'a> {
    pub fn new(session: &'a XenApiSession) -> Self {
        Self { session }
    }

    pub async fn get_record(&self, vbd: &VbdRef) -> XenApiResult<VbdRecord> {
        self.session.call("VBD.get_record", vec![vbd.into()]).await
    }

    pub async fn create(&self, spec: &VbdCreateSpec) -> XenApiResult<VbdRef> {
        self.session
            .call("VBD.create", vec![xmlrpc::to_value(spec)?])
            .await
    }

    pub async fn plug(&self, vbd: &VbdRef) -> XenApiResult<()> {
        self.session.call_unit("VBD.plug", vec![vbd.into()]).await
    }

    pub async fn unplug(&self, vbd: &VbdRef) -> XenApiResult<()> {
        self.session.call_unit("VBD.unplug", vec![vbd.into()]).await
    }

    pub async fn destroy(&self, vbd: &VbdRef) -> XenApiResult<()> {
        self.session.call_unit("VBD.destroy", vec![vbd.into()]).await
    }

    /// Device name in the guest (e.g. "xvdb"); empty until plugged.
    pub async fn get_device(&self, vbd: &VbdRef) -> XenApiResult<String> {
        self.session.call("VBD.get_device", vec![vbd.into()]).await
    }

    pub async fn get_vdi(&self, vbd: &VbdRef) -> XenApiResult<VdiRef> {
        self.session.call("VBD.get_VDI", vec![vbd.into()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::connect;
    use crate::simulated::SimulatedXapi;

    #[tokio::test]
    async fn device_is_assigned_on_plug() {
        let xapi = SimulatedXapi::new();
        let s = connect(xapi.clone(), "root", "secret").await.unwrap();
        let vm = s.vm().get_by_uuid(&xapi.vm_uuid()).await.unwrap();
        let vdi = s.create_new_vdi(&xapi.local_sr(), gib_to_bytes(1).unwrap()).await.unwrap();

        let vbd = s
            .vbd()
            .create(&VbdCreateSpec::disk(vm.clone(), vdi.clone(), VbdMode::ReadOnly))
            .await
            .unwrap();
        assert_eq!(s.vbd().get_device(&vbd).await.unwrap(), "");
        assert_eq!(s.vbd().get_vdi(&vbd).await.unwrap(), vdi);

        s.vbd().plug(&vbd).await.unwrap();
        assert_eq!(s.vbd().get_device(&vbd).await.unwrap(), "xvdb");
        assert!(s.vbd().get_record(&vbd).await.unwrap().currently_attached);
        assert!(s.vm().get_vbds(&vm).await.unwrap().contains(&vbd));

        s.vbd().unplug(&vbd).await.unwrap();
        s.vbd().destroy(&vbd).await.unwrap();
        assert!(!s.vm().get_vbds(&vm).await.unwrap().contains(&vbd));
    }
}
