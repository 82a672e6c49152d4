//! NFS volume driver.
//!
//! `NfsVolumeDriver` owns a [`SessionFactory`] and exposes the volume
//! lifecycle: create, connect, disconnect, delete, copy, resize and attach to
//! the local VM. Every operation runs in its own session, which is always
//! logged out afterwards.

use crate::config::XenApiConfig;
use crate::error::{XenApiError, XenApiResult};
use crate::nfs::settle;
use crate::session::{SessionFactory, XenApiSession};
use crate::types::*;

use std::future::Future;

/// Volume operations on NFS-backed SRs.
#[derive(Debug, Clone)]
pub struct NfsVolumeDriver {
    factory: SessionFactory,
    labels: SrLabels,
}

impl NfsVolumeDriver {
    pub fn new(factory: SessionFactory) -> Self {
        Self {
            factory,
            labels: SrLabels::default(),
        }
    }

    /// Driver talking to the XAPI endpoint described by `config`.
    pub fn from_config(config: &XenApiConfig) -> XenApiResult<Self> {
        Ok(Self::new(SessionFactory::from_config(config)?))
    }

    /// Labels given to SRs this driver creates or re-attaches.
    pub fn with_labels(mut self, labels: SrLabels) -> Self {
        self.labels = labels;
        self
    }

    /// Run `body` with a fresh session, then log out.
    async fn with_session<F, Fut, T>(&self, body: F) -> XenApiResult<T>
    where
        F: FnOnce(XenApiSession) -> Fut,
        Fut: Future<Output = XenApiResult<T>>,
    {
        let session = self.factory.get_session().await?;
        let result = body(session.clone()).await;
        let logout = session.close().await;
        settle(result, logout, "Closing session")
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create a `size_gb` GiB volume in a new SR on `server:serverpath`.
    /// The SR is detached again before returning; the returned
    /// [`ConnectionData`] is what [`connect_volume`](Self::connect_volume)
    /// needs to bring it back.
    pub async fn create_volume(
        &self,
        host_uuid: &str,
        server: &str,
        serverpath: &str,
        size_gb: u64,
    ) -> XenApiResult<ConnectionData> {
        let size_bytes = gib_to_bytes(size_gb)?;
        let export = NfsExport::new(server, serverpath);
        let labels = &self.labels;
        self.with_session(|session| async move {
            let host = session.get_host_by_uuid(host_uuid).await?;
            let (sr_uuid, vdi_uuid) = session
                .with_new_sr_on_nfs(&host, &export, labels, |sr| {
                    let session = &session;
                    async move {
                        let sr_uuid = session.get_sr_uuid(&sr).await?;
                        let vdi = session
                            .create_new_vdi(&sr, size_bytes)
                            .await?;
                        let vdi_uuid = session.get_vdi_uuid(&vdi).await?;
                        Ok((sr_uuid, vdi_uuid))
                    }
                })
                .await?;

            log::info!("Created {size_gb} GiB volume {vdi_uuid} in SR {sr_uuid}");
            Ok(ConnectionData {
                server: export.server,
                serverpath: export.serverpath,
                sr_uuid,
                vdi_uuid,
            })
        })
        .await
    }

    /// Re-attach the SR described by `data` on the host and return the
    /// volume's VDI.
    pub async fn connect_volume(
        &self,
        host_uuid: &str,
        data: &ConnectionData,
    ) -> XenApiResult<VdiRef> {
        let labels = &self.labels;
        self.with_session(|session| async move {
            let host = session.get_host_by_uuid(host_uuid).await?;
            attach_volume(&session, &host, data, labels).await
        })
        .await
    }

    /// Detach the SR holding `vdi`. The volume stays on the export.
    pub async fn disconnect_volume(&self, vdi: &VdiRef) -> XenApiResult<()> {
        self.with_session(|session| async move { detach_volume(&session, vdi).await })
            .await
    }

    /// Destroy the SR described by `data`, removing its directory from the
    /// export.
    pub async fn delete_volume(&self, host_uuid: &str, data: &ConnectionData) -> XenApiResult<()> {
        let labels = &self.labels;
        self.with_session(|session| async move {
            let host = session.get_host_by_uuid(host_uuid).await?;
            let sr = session
                .plug_nfs_sr(&host, &data.export(), &data.sr_uuid, labels)
                .await?;
            if let Err(e) = session.sr().destroy(&sr).await {
                let teardown = session.unplug_pbds_and_forget_sr(&sr).await;
                return settle(Err(e), teardown, "Detaching SR after failed destroy");
            }
            log::info!("Deleted volume {} (SR {})", data.vdi_uuid, data.sr_uuid);
            Ok(())
        })
        .await
    }

    /// Copy the volume into a new SR on the same export.
    pub async fn copy_volume(
        &self,
        host_uuid: &str,
        data: &ConnectionData,
    ) -> XenApiResult<ConnectionData> {
        let labels = &self.labels;
        self.with_session(|session| async move {
            let host = session.get_host_by_uuid(host_uuid).await?;
            let export = data.export();
            let source = attach_volume(&session, &host, data, labels).await?;

            let copied = session
                .with_new_sr_on_nfs(&host, &export, labels, |sr| {
                    let session = &session;
                    let source = &source;
                    async move {
                        let sr_uuid = session.get_sr_uuid(&sr).await?;
                        let vdi = session.vdi().copy(source, &sr).await?;
                        let vdi_uuid = session.get_vdi_uuid(&vdi).await?;
                        Ok(ConnectionData {
                            server: data.server.clone(),
                            serverpath: data.serverpath.clone(),
                            sr_uuid,
                            vdi_uuid,
                        })
                    }
                })
                .await;

            let teardown = detach_volume(&session, &source).await;
            let copied = settle(copied, teardown, "Detaching source volume")?;
            log::info!(
                "Copied volume {} to {} (SR {})",
                data.vdi_uuid,
                copied.vdi_uuid,
                copied.sr_uuid
            );
            Ok(copied)
        })
        .await
    }

    /// Grow the volume to `size_gb` GiB.
    pub async fn resize_volume(
        &self,
        host_uuid: &str,
        data: &ConnectionData,
        size_gb: u64,
    ) -> XenApiResult<()> {
        let size_bytes = gib_to_bytes(size_gb)?;
        let labels = &self.labels;
        self.with_session(|session| async move {
            let host = session.get_host_by_uuid(host_uuid).await?;
            let vdi = attach_volume(&session, &host, data, labels).await?;
            let resized = session.vdi().resize(&vdi, size_bytes).await;
            let teardown = detach_volume(&session, &vdi).await;
            settle(resized, teardown, "Detaching resized volume")?;
            log::info!("Resized volume {} to {size_gb} GiB", data.vdi_uuid);
            Ok(())
        })
        .await
    }

    /// Attach the volume to VM `vm_uuid` (normally the VM this code runs
    /// in, see [`crate::tools::this_vm_uuid`]) and run `body` with the block
    /// device path, e.g. `/dev/xvdb`. The VBD and SR are torn down
    /// afterwards whether or not `body` succeeds.
    pub async fn with_volume_attached_here<F, Fut, T>(
        &self,
        host_uuid: &str,
        vm_uuid: &str,
        data: &ConnectionData,
        body: F,
    ) -> XenApiResult<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = XenApiResult<T>>,
    {
        let labels = &self.labels;
        self.with_session(|session| async move {
            let host = session.get_host_by_uuid(host_uuid).await?;
            let vdi = attach_volume(&session, &host, data, labels).await?;
            let result = with_vbd(&session, vm_uuid, &vdi, body).await;
            let teardown = detach_volume(&session, &vdi).await;
            settle(result, teardown, "Detaching volume")
        })
        .await
    }
}

/// Plug the SR of `data`, rescan it and resolve the volume's VDI.
async fn attach_volume(
    session: &XenApiSession,
    host: &HostRef,
    data: &ConnectionData,
    labels: &SrLabels,
) -> XenApiResult<VdiRef> {
    let sr = session
        .plug_nfs_sr(host, &data.export(), &data.sr_uuid, labels)
        .await?;
    session.scan_sr(&sr).await?;
    let vdi = session.get_vdi_by_uuid(&data.vdi_uuid).await?;
    log::info!("Connected volume {} (SR {})", data.vdi_uuid, data.sr_uuid);
    Ok(vdi)
}

async fn detach_volume(session: &XenApiSession, vdi: &VdiRef) -> XenApiResult<()> {
    let record = session.get_vdi_record(vdi).await?;
    let sr = record
        .sr
        .filter(|sr| !sr.is_null())
        .ok_or_else(|| XenApiError::decode(format!("VDI {} has no SR", record.uuid)))?;
    session.unplug_pbds_and_forget_sr(&sr).await
}

/// Create and plug a read-write VBD for `vdi` on `vm_uuid`, run `body` with
/// its device path, then unplug and destroy the VBD.
async fn with_vbd<F, Fut, T>(
    session: &XenApiSession,
    vm_uuid: &str,
    vdi: &VdiRef,
    body: F,
) -> XenApiResult<T>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = XenApiResult<T>>,
{
    let vm = session.vm().get_by_uuid(vm_uuid).await?;
    let vbd = session
        .vbd()
        .create(&VbdCreateSpec::disk(vm, vdi.clone(), VbdMode::ReadWrite))
        .await?;

    if let Err(e) = session.vbd().plug(&vbd).await {
        let teardown = session.vbd().destroy(&vbd).await;
        return settle(Err(e), teardown, "Destroying unplugged VBD");
    }

    let result = match session.vbd().get_device(&vbd).await {
        Ok(device) => {
            let devpath = format!("/dev/{device}");
            log::debug!("Volume {vdi} attached at {devpath}");
            body(devpath).await
        }
        Err(e) => Err(e),
    };

    // the body may have detached the device itself
    let unplugged = match session.vbd().unplug(&vbd).await {
        Err(e) if e.failure_code() == Some("DEVICE_ALREADY_DETACHED") => Ok(()),
        other => other,
    };
    let destroyed = session.vbd().destroy(&vbd).await;
    let teardown = settle(unplugged, destroyed, "Destroying VBD");
    settle(result, teardown, "Removing VBD")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XenApiErrorKind;
    use crate::session::connect;
    use crate::simulated::SimulatedXapi;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const SERVER: &str = "nfs.lab";
    const SERVERPATH: &str = "/exports/volumes";

    struct Fixture {
        xapi: Arc<SimulatedXapi>,
        driver: NfsVolumeDriver,
        observer: XenApiSession,
    }

    async fn fixture() -> Fixture {
        let xapi = SimulatedXapi::new();
        let driver = NfsVolumeDriver::new(SessionFactory::new(xapi.clone(), "root", "secret"));
        let observer = connect(xapi.clone(), "root", "secret").await.unwrap();
        Fixture {
            xapi,
            driver,
            observer,
        }
    }

    impl Fixture {
        async fn create(&self, size_gb: u64) -> ConnectionData {
            self.driver
                .create_volume(&self.xapi.host_uuid(), SERVER, SERVERPATH, size_gb)
                .await
                .unwrap()
        }

        async fn counts(&self) -> (usize, usize) {
            (
                self.observer.get_srs().await.unwrap().len(),
                self.observer.get_vdis().await.unwrap().len(),
            )
        }
    }

    #[tokio::test]
    async fn create_volume_leaves_sr_detached() {
        let f = fixture().await;
        let before = f.counts().await;

        let vol = f.create(1).await;

        assert_eq!(f.counts().await, before);
        assert_eq!(vol.server, SERVER);
        assert_eq!(vol.serverpath, SERVERPATH);
        assert!(f.xapi.export_entries().contains(&vol.sr_uuid));
        assert_eq!(
            f.xapi.vhd_files(&vol.sr_uuid),
            BTreeSet::from([format!("{}.vhd", vol.vdi_uuid)])
        );
        // only the observer session remains
        assert_eq!(f.xapi.open_sessions(), 1);
    }

    #[tokio::test]
    async fn connect_then_disconnect() {
        let f = fixture().await;
        let vol = f.create(1).await;
        let (srs, vdis) = f.counts().await;

        let vdi = f
            .driver
            .connect_volume(&f.xapi.host_uuid(), &vol)
            .await
            .unwrap();
        assert_eq!(f.counts().await, (srs + 1, vdis + 1));
        assert_eq!(f.observer.get_vdi_uuid(&vdi).await.unwrap(), vol.vdi_uuid);

        f.driver.disconnect_volume(&vdi).await.unwrap();
        assert_eq!(f.counts().await, (srs, vdis));
        assert!(f.xapi.export_entries().contains(&vol.sr_uuid));
    }

    #[tokio::test]
    async fn connect_unknown_volume_fails_and_closes_session() {
        let f = fixture().await;
        let mut vol = f.create(1).await;
        vol.vdi_uuid = "no-such-vdi".to_string();

        let err = f
            .driver
            .connect_volume(&f.xapi.host_uuid(), &vol)
            .await
            .unwrap_err();
        assert_eq!(err.kind, XenApiErrorKind::Failure);
        assert_eq!(err.failure_code(), Some("UUID_INVALID"));
        assert_eq!(f.xapi.open_sessions(), 1);
    }

    #[tokio::test]
    async fn delete_volume_removes_sr_directory() {
        let f = fixture().await;
        let vol = f.create(1).await;
        let before = f.xapi.export_entries();

        f.driver
            .delete_volume(&f.xapi.host_uuid(), &vol)
            .await
            .unwrap();

        let after = f.xapi.export_entries();
        let removed: Vec<_> = before.difference(&after).cloned().collect();
        assert_eq!(removed, vec![vol.sr_uuid.clone()]);
        assert!(f.observer.sr().get_by_uuid(&vol.sr_uuid).await.is_err());
    }

    #[tokio::test]
    async fn copy_volume_creates_new_sr_directory() {
        let f = fixture().await;
        let vol = f.create(1).await;
        let before = f.xapi.export_entries();
        let counts = f.counts().await;

        let copy = f
            .driver
            .copy_volume(&f.xapi.host_uuid(), &vol)
            .await
            .unwrap();

        let after = f.xapi.export_entries();
        let added: Vec<_> = after.difference(&before).cloned().collect();
        assert_eq!(added, vec![copy.sr_uuid.clone()]);
        assert_ne!(copy.sr_uuid, vol.sr_uuid);
        assert_ne!(copy.vdi_uuid, vol.vdi_uuid);
        assert_eq!(copy.server, vol.server);
        assert_eq!(
            f.xapi.vhd_size(&copy.sr_uuid, &copy.vdi_uuid),
            Some(1 << 30)
        );
        // both SRs detached again
        assert_eq!(f.counts().await, counts);
    }

    #[tokio::test]
    async fn resize_volume_grows_the_vhd() {
        let f = fixture().await;
        let vol = f.create(1).await;
        assert_eq!(f.xapi.vhd_size(&vol.sr_uuid, &vol.vdi_uuid), Some(1 << 30));

        f.driver
            .resize_volume(&f.xapi.host_uuid(), &vol, 2)
            .await
            .unwrap();

        assert_eq!(f.xapi.vhd_size(&vol.sr_uuid, &vol.vdi_uuid), Some(2 << 30));
    }

    #[tokio::test]
    async fn volume_attached_here_for_the_scope() {
        let f = fixture().await;
        let vol = f.create(1).await;
        let vm = f.observer.vm().get_by_uuid(&f.xapi.vm_uuid()).await.unwrap();
        let vbds_before = f.observer.vm().get_vbds(&vm).await.unwrap().len();
        let counts = f.counts().await;

        let (devpath, vbds_inside) = f
            .driver
            .with_volume_attached_here(&f.xapi.host_uuid(), &f.xapi.vm_uuid(), &vol, |devpath| {
                let observer = &f.observer;
                let vm = &vm;
                async move {
                    let vbds = observer.vm().get_vbds(vm).await?.len();
                    Ok((devpath, vbds))
                }
            })
            .await
            .unwrap();

        assert_eq!(devpath, "/dev/xvdb");
        assert_eq!(vbds_inside, vbds_before + 1);
        assert_eq!(f.observer.vm().get_vbds(&vm).await.unwrap().len(), vbds_before);
        assert_eq!(f.counts().await, counts);
    }

    #[tokio::test]
    async fn attach_here_tears_down_when_body_fails() {
        let f = fixture().await;
        let vol = f.create(1).await;
        let counts = f.counts().await;

        let err = f
            .driver
            .with_volume_attached_here(&f.xapi.host_uuid(), &f.xapi.vm_uuid(), &vol, |_| async {
                Err::<(), _>(XenApiError::io("mkfs failed"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, XenApiErrorKind::Io);
        assert_eq!(f.counts().await, counts);
        assert_eq!(f.xapi.call_count("VBD.destroy"), 1);
        assert_eq!(f.xapi.open_sessions(), 1);
    }

    #[tokio::test]
    async fn attach_here_tolerates_body_detaching_the_device() {
        let f = fixture().await;
        let vol = f.create(1).await;
        let vm = f.observer.vm().get_by_uuid(&f.xapi.vm_uuid()).await.unwrap();
        let vbds_before = f.observer.vm().get_vbds(&vm).await.unwrap().len();
        let counts = f.counts().await;

        f.driver
            .with_volume_attached_here(&f.xapi.host_uuid(), &f.xapi.vm_uuid(), &vol, |devpath| {
                let observer = &f.observer;
                let vm = &vm;
                async move {
                    for vbd in observer.vm().get_vbds(vm).await? {
                        let device = observer.vbd().get_device(&vbd).await?;
                        if devpath == format!("/dev/{device}") {
                            observer.vbd().unplug(&vbd).await?;
                        }
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(f.xapi.call_count("VBD.unplug"), 2);
        assert_eq!(f.xapi.call_count("VBD.destroy"), 1);
        assert_eq!(f.observer.vm().get_vbds(&vm).await.unwrap().len(), vbds_before);
        assert_eq!(f.counts().await, counts);
    }

    #[tokio::test]
    async fn delete_volume_detaches_sr_when_destroy_fails() {
        let f = fixture().await;
        let vol = f.create(1).await;
        let counts = f.counts().await;
        let pbds = f.observer.get_pbds().await.unwrap().len();
        let entries = f.xapi.export_entries();

        f.xapi.fail_next("SR.destroy", "SR_BACKEND_FAILURE_1200");
        let err = f
            .driver
            .delete_volume(&f.xapi.host_uuid(), &vol)
            .await
            .unwrap_err();

        assert_eq!(err.failure_code(), Some("SR_BACKEND_FAILURE_1200"));
        assert_eq!(f.counts().await, counts);
        assert_eq!(f.observer.get_pbds().await.unwrap().len(), pbds);
        assert_eq!(f.xapi.export_entries(), entries);
        assert_eq!(f.xapi.call_count("SR.forget"), 2);
        assert_eq!(f.xapi.open_sessions(), 1);

        // the volume can still be deleted afterwards
        f.driver
            .delete_volume(&f.xapi.host_uuid(), &vol)
            .await
            .unwrap();
        assert!(!f.xapi.export_entries().contains(&vol.sr_uuid));
    }

    #[tokio::test]
    async fn oversized_volume_is_rejected_before_any_call() {
        let f = fixture().await;
        let err = f
            .driver
            .create_volume(&f.xapi.host_uuid(), SERVER, SERVERPATH, 1 << 34)
            .await
            .unwrap_err();
        assert_eq!(err.kind, XenApiErrorKind::Config);
        assert_eq!(f.xapi.call_count("SR.create"), 0);

        let vol = f.create(1).await;
        let err = f
            .driver
            .resize_volume(&f.xapi.host_uuid(), &vol, u64::MAX)
            .await
            .unwrap_err();
        assert_eq!(err.kind, XenApiErrorKind::Config);
        assert_eq!(f.xapi.call_count("VDI.resize"), 0);
        assert_eq!(f.xapi.vhd_size(&vol.sr_uuid, &vol.vdi_uuid), Some(1 << 30));
    }

    #[tokio::test]
    async fn custom_labels_are_used_on_reattach() {
        let f = fixture().await;
        let driver = f.driver.clone().with_labels(SrLabels::new("volumes", "managed"));
        let vol = f.create(1).await;

        let vdi = driver.connect_volume(&f.xapi.host_uuid(), &vol).await.unwrap();
        let sr = f.observer.vdi().get_sr(&vdi).await.unwrap();
        assert_eq!(f.observer.sr().get_name_label(&sr).await.unwrap(), "volumes");
        assert_eq!(
            f.observer.sr().get_name_description(&sr).await.unwrap(),
            "managed"
        );
        driver.disconnect_volume(&vdi).await.unwrap();
    }
}
