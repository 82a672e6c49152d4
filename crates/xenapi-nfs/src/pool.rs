//! `pool.*` calls.

use crate::error::XenApiResult;
use crate::session::XenApiSession;
use crate::types::*;

pub struct PoolManager<'a> {
    session: &'a XenApiSession,
}

impl<'a> PoolManager<'a> {
    pub fn new(session: &'a XenApiSession) -> Self {
        Self { session }
    }

    pub async fn get_all(&self) -> XenApiResult<Vec<PoolRef>> {
        self.session.call("pool.get_all", Vec::new()).await
    }

    pub async fn get_default_sr(&self, pool: &PoolRef) -> XenApiResult<SrRef> {
        self.session
            .call("pool.get_default_SR", vec![pool.into()])
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::session::connect;
    use crate::simulated::SimulatedXapi;

    #[tokio::test]
    async fn default_sr_of_first_pool() {
        let xapi = SimulatedXapi::new();
        let s = connect(xapi.clone(), "root", "secret").await.unwrap();
        let pools = s.pool().get_all().await.unwrap();
        assert_eq!(pools.len(), 1);
        let sr = s.pool().get_default_sr(&pools[0]).await.unwrap();
        assert!(!sr.is_null());
        assert_eq!(sr, xapi.local_sr());
    }
}
