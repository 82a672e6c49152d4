//! `VDI.*` calls.

use crate::error::XenApiResult;
use crate::session::XenApiSession;
use crate::types::*;
use crate::xmlrpc::{self, Value};

/// Virtual disk image operations.
pub struct VdiManager<'a> {
    session: &'a XenApiSession,
}

impl<'a> VdiManager<'a> {
    pub fn new(session: &'a XenApiSession) -> Self {
        Self { session }
    }

    pub async fn get_all(&self) -> XenApiResult<Vec<VdiRef>> {
        self.session.call("VDI.get_all", Vec::new()).await
    }

    pub async fn get_record(&self, vdi: &VdiRef) -> XenApiResult<VdiRecord> {
        self.session.call("VDI.get_record", vec![vdi.into()]).await
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> XenApiResult<VdiRef> {
        self.session.call("VDI.get_by_uuid", vec![uuid.into()]).await
    }

    pub async fn get_uuid(&self, vdi: &VdiRef) -> XenApiResult<String> {
        self.session.call("VDI.get_uuid", vec![vdi.into()]).await
    }

    pub async fn get_sr(&self, vdi: &VdiRef) -> XenApiResult<SrRef> {
        self.session.call("VDI.get_SR", vec![vdi.into()]).await
    }

    /// Virtual size in bytes.
    pub async fn get_virtual_size(&self, vdi: &VdiRef) -> XenApiResult<i64> {
        let raw: String = self
            .session
            .call("VDI.get_virtual_size", vec![vdi.into()])
            .await?;
        raw.trim().parse().map_err(|e| {
            crate::error::XenApiError::decode(format!("VDI.get_virtual_size returned '{raw}': {e}"))
        })
    }

    pub async fn create(&self, spec: &VdiCreateSpec) -> XenApiResult<VdiRef> {
        let vdi: VdiRef = self
            .session
            .call("VDI.create", vec![xmlrpc::to_value(spec)?])
            .await?;
        log::info!("Created VDI {} ({} bytes) in SR {}", vdi, spec.virtual_size, spec.sr);
        Ok(vdi)
    }

    pub async fn destroy(&self, vdi: &VdiRef) -> XenApiResult<()> {
        self.session.call_unit("VDI.destroy", vec![vdi.into()]).await
    }

    /// Grow the VDI to `size_bytes`.
    pub async fn resize(&self, vdi: &VdiRef, size_bytes: u64) -> XenApiResult<()> {
        self.session
            .call_unit(
                "VDI.resize",
                vec![vdi.into(), Value::from(size_bytes.to_string())],
            )
            .await?;
        log::info!("Resized VDI {} to {} bytes", vdi, size_bytes);
        Ok(())
    }

    /// Full copy of `vdi` into `sr`; returns the new VDI.
    pub async fn copy(&self, vdi: &VdiRef, sr: &SrRef) -> XenApiResult<VdiRef> {
        let copy: VdiRef = self
            .session
            .call("VDI.copy", vec![vdi.into(), sr.into()])
            .await?;
        log::info!("Copied VDI {} into SR {} as {}", vdi, sr, copy);
        Ok(copy)
    }
}

#[cfg(test)]
mod tests {
    use crate::session::connect;
    use crate::simulated::SimulatedXapi;
    use crate::types::gib_to_bytes;

    #[tokio::test]
    async fn create_resize_destroy() {
        let xapi = SimulatedXapi::new();
        let s = connect(xapi.clone(), "root", "secret").await.unwrap();
        let sr = xapi.local_sr();
        let before = s.vdi().get_all().await.unwrap().len();

        let vdi = s.create_new_vdi(&sr, gib_to_bytes(1).unwrap()).await.unwrap();
        assert_eq!(s.vdi().get_all().await.unwrap().len(), before + 1);
        assert_eq!(s.vdi().get_sr(&vdi).await.unwrap(), sr);

        s.vdi().resize(&vdi, gib_to_bytes(2).unwrap()).await.unwrap();
        assert_eq!(s.vdi().get_virtual_size(&vdi).await.unwrap(), 2 << 30);

        let uuid = s.vdi().get_uuid(&vdi).await.unwrap();
        assert_eq!(s.get_vdi_by_uuid(&uuid).await.unwrap(), vdi);

        s.vdi().destroy(&vdi).await.unwrap();
        assert_eq!(s.vdi().get_all().await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn copy_gets_new_uuid() {
        let xapi = SimulatedXapi::new();
        let s = connect(xapi.clone(), "root", "secret").await.unwrap();
        let sr = xapi.local_sr();

        let vdi = s.create_new_vdi(&sr, gib_to_bytes(1).unwrap()).await.unwrap();
        let copy = s.vdi().copy(&vdi, &sr).await.unwrap();
        assert_ne!(copy, vdi);

        let original = s.get_vdi_record(&vdi).await.unwrap();
        let copied = s.get_vdi_record(&copy).await.unwrap();
        assert_ne!(original.uuid, copied.uuid);
        assert_eq!(original.virtual_size, copied.virtual_size);
    }
}
