//! NFS-specific compound operations on a session.

use crate::error::XenApiResult;
use crate::session::XenApiSession;
use crate::sr::{SrCreateSpec, SrIntroduceSpec};
use crate::types::*;

use std::future::Future;

/// Merge the outcome of a scoped body with the outcome of its teardown.
/// The body's error wins; a teardown error is only returned on success.
pub(crate) fn settle<T>(
    result: XenApiResult<T>,
    teardown: XenApiResult<()>,
    what: &str,
) -> XenApiResult<T> {
    match (result, teardown) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown_err)) => {
            log::warn!("{what} failed while handling an earlier error: {teardown_err}");
            Err(e)
        }
    }
}

impl XenApiSession {
    /// Create a fresh NFS SR on `export`, run `body` with it, then unplug its
    /// PBDs and forget it. Teardown runs whether or not `body` succeeds; the
    /// SR directory stays on the export.
    pub async fn with_new_sr_on_nfs<F, Fut, T>(
        &self,
        host: &HostRef,
        export: &NfsExport,
        labels: &SrLabels,
        body: F,
    ) -> XenApiResult<T>
    where
        F: FnOnce(SrRef) -> Fut,
        Fut: Future<Output = XenApiResult<T>>,
    {
        let sr = self
            .create_sr(host, &SrCreateSpec::nfs(export, labels))
            .await?;
        log::info!(
            "Attached new NFS SR {} on {}:{}",
            sr,
            export.server,
            export.serverpath
        );

        let result = body(sr.clone()).await;
        let teardown = self.unplug_pbds_and_forget_sr(&sr).await;
        settle(result, teardown, "Detaching NFS SR")
    }

    /// Re-attach an existing NFS SR by uuid: introduce it, create a PBD on
    /// `host` for `export`, and plug it.
    pub async fn plug_nfs_sr(
        &self,
        host: &HostRef,
        export: &NfsExport,
        sr_uuid: &str,
        labels: &SrLabels,
    ) -> XenApiResult<SrRef> {
        let sr = self
            .introduce_sr(&SrIntroduceSpec::nfs(sr_uuid, labels))
            .await?;
        let pbd = self.create_pbd(host, &sr, export.device_config()).await?;
        self.plug_pbd(&pbd).await?;
        log::info!(
            "Plugged NFS SR {} from {}:{}",
            sr_uuid,
            export.server,
            export.serverpath
        );
        Ok(sr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{XenApiError, XenApiErrorKind};
    use crate::session::connect;
    use crate::simulated::SimulatedXapi;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn export() -> NfsExport {
        NfsExport::new("nfs.lab", "/exports/xen")
    }

    async fn setup() -> (Arc<SimulatedXapi>, XenApiSession, HostRef) {
        let xapi = SimulatedXapi::new();
        let s = connect(xapi.clone(), "root", "secret").await.unwrap();
        let host = s.get_this_host().await.unwrap();
        (xapi, s, host)
    }

    #[tokio::test]
    async fn new_sr_is_attached_for_the_scope_only() {
        let (_xapi, s, host) = setup().await;
        let before = s.get_srs().await.unwrap().len();

        let inside = s
            .with_new_sr_on_nfs(&host, &export(), &SrLabels::default(), |_sr| {
                let s = &s;
                async move { s.get_srs().await.map(|srs| srs.len()) }
            })
            .await
            .unwrap();

        assert_eq!(inside, before + 1);
        assert_eq!(s.get_srs().await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn labels_are_applied() {
        let (_xapi, s, host) = setup().await;
        let (name, desc) = s
            .with_new_sr_on_nfs(&host, &export(), &SrLabels::new("name", "desc"), |sr| {
                let s = &s;
                async move {
                    let name = s.sr().get_name_label(&sr).await?;
                    let desc = s.sr().get_name_description(&sr).await?;
                    Ok((name, desc))
                }
            })
            .await
            .unwrap();
        assert_eq!(name, "name");
        assert_eq!(desc, "desc");
    }

    #[tokio::test]
    async fn sr_directory_is_not_removed() {
        let (xapi, s, host) = setup().await;
        let before = xapi.export_entries();

        let uuid = s
            .with_new_sr_on_nfs(&host, &export(), &SrLabels::default(), |sr| {
                let s = &s;
                async move { s.sr().get_uuid(&sr).await }
            })
            .await
            .unwrap();

        let after = xapi.export_entries();
        let added: BTreeSet<String> = after.difference(&before).cloned().collect();
        assert_eq!(added, BTreeSet::from([uuid]));
    }

    #[tokio::test]
    async fn vdi_created_in_scope_is_not_left_behind() {
        let (_xapi, s, host) = setup().await;
        let before = s.get_vdis().await.unwrap();

        s.with_new_sr_on_nfs(&host, &export(), &SrLabels::default(), |sr| {
            let s = &s;
            let before = before.clone();
            async move {
                let vdi = s.create_new_vdi(&sr, 1 << 30).await?;
                let mut expected: BTreeSet<VdiRef> = before.into_iter().collect();
                expected.insert(vdi);
                let now: BTreeSet<VdiRef> = s.get_vdis().await?.into_iter().collect();
                assert_eq!(expected, now);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(s.get_vdis().await.unwrap(), before);
    }

    #[tokio::test]
    async fn teardown_runs_when_body_fails() {
        let (_xapi, s, host) = setup().await;
        let before = s.get_srs().await.unwrap().len();

        let err = s
            .with_new_sr_on_nfs(&host, &export(), &SrLabels::default(), |_sr| async {
                Err::<(), _>(XenApiError::decode("body failed"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, XenApiErrorKind::Decode);
        assert_eq!(s.get_srs().await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn re_attach_an_sr() {
        let (_xapi, s, host) = setup().await;

        let (sr_uuid, sr_count, pbd_count) = s
            .with_new_sr_on_nfs(&host, &export(), &SrLabels::default(), |sr| {
                let s = &s;
                async move {
                    Ok((
                        s.get_sr_uuid(&sr).await?,
                        s.get_srs().await?.len(),
                        s.get_pbds().await?.len(),
                    ))
                }
            })
            .await
            .unwrap();

        let sr = s
            .plug_nfs_sr(&host, &export(), &sr_uuid, &SrLabels::new("name", "desc"))
            .await
            .unwrap();

        assert_eq!(s.get_srs().await.unwrap().len(), sr_count);
        assert_eq!(s.get_pbds().await.unwrap().len(), pbd_count);
        assert_eq!(s.sr().get_name_label(&sr).await.unwrap(), "name");
        assert_eq!(s.sr().get_name_description(&sr).await.unwrap(), "desc");
        assert_eq!(s.get_sr_uuid(&sr).await.unwrap(), sr_uuid);
    }

    #[test]
    fn settle_prefers_body_error() {
        let body: XenApiResult<()> = Err(XenApiError::decode("body"));
        let teardown = Err(XenApiError::transport("teardown"));
        assert_eq!(settle(body, teardown, "t").unwrap_err().message, "body");

        let teardown = Err(XenApiError::transport("teardown"));
        assert_eq!(settle(Ok(1), teardown, "t").unwrap_err().message, "teardown");
        assert_eq!(settle(Ok(1), Ok(()), "t").unwrap(), 1);
    }
}
