//! Helpers for code running inside a Xen guest.

use crate::error::{XenApiError, XenApiResult};

use std::path::Path;

/// Where the hypervisor exposes the guest's own VM uuid.
pub const HYPERVISOR_UUID_PATH: &str = "/sys/hypervisor/uuid";

/// UUID of the VM this process runs in.
pub async fn this_vm_uuid() -> XenApiResult<String> {
    read_vm_uuid(HYPERVISOR_UUID_PATH).await
}

/// Read a VM uuid from `path`, trimming the trailing newline.
pub async fn read_vm_uuid(path: impl AsRef<Path>) -> XenApiResult<String> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path).await?;
    let uuid = raw.trim();
    if uuid.is_empty() {
        return Err(XenApiError::io(format!("{} is empty", path.display())));
    }
    Ok(uuid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XenApiErrorKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn reads_and_trims() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "6f0e1b1c-3c2d-4a52-9f1e-0c6f5e1d2a77").unwrap();
        let uuid = read_vm_uuid(file.path()).await.unwrap();
        assert_eq!(uuid, "6f0e1b1c-3c2d-4a52-9f1e-0c6f5e1d2a77");
    }

    #[tokio::test]
    async fn empty_file_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        let err = read_vm_uuid(file.path()).await.unwrap_err();
        assert_eq!(err.kind, XenApiErrorKind::Io);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_vm_uuid(dir.path().join("uuid")).await.unwrap_err();
        assert_eq!(err.kind, XenApiErrorKind::Io);
    }
}
