use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// SHA-256 of some content. Displays as 64 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Name of the two-character fan-out directory.
    fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{b:02x}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub digest: ContentDigest,
    pub path: PathBuf,
    /// False when identical content was already in the archive.
    pub newly_written: bool,
}

/// Content-addressed store for exported receipt images, laid out as
/// `<dir>/<first byte as hex>/<digest>.<ext>`.
#[derive(Debug, Clone)]
pub struct ReceiptArchive {
    dir: PathBuf,
}

impl ReceiptArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, digest: &ContentDigest, ext: &str) -> PathBuf {
        self.dir.join(digest.shard()).join(format!("{digest}.{ext}"))
    }

    pub fn contains(&self, digest: &ContentDigest, ext: &str) -> bool {
        self.path_for(digest, ext).exists()
    }

    pub async fn store(&self, data: &[u8], ext: &str) -> io::Result<StoredAttachment> {
        let digest = ContentDigest::of(data);
        let path = self.path_for(&digest, ext);
        if tokio::fs::try_exists(&path).await? {
            tracing::debug!("Receipt image already archived: {}", path.display());
            return Ok(StoredAttachment { digest, path, newly_written: false });
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        tracing::info!("Receipt image archived: {}", path.display());
        Ok(StoredAttachment { digest, path, newly_written: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_displays_as_hex() {
        assert_eq!(
            ContentDigest::of(b"abc").to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(ContentDigest::of(b"abc").as_bytes()[0], 0xba);
    }

    #[test]
    fn path_is_sharded_by_first_byte() {
        let archive = ReceiptArchive::new("/data/attachments");
        let digest = ContentDigest::of(b"abc");
        assert_eq!(
            archive.path_for(&digest, "jpg"),
            PathBuf::from(format!("/data/attachments/ba/{digest}.jpg"))
        );
    }

    #[tokio::test]
    async fn store_is_content_addressed_and_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ReceiptArchive::new(dir.path());

        let first = archive.store(b"jpeg bytes", "jpg").await.unwrap();
        assert!(first.newly_written);
        assert_eq!(first.digest, ContentDigest::of(b"jpeg bytes"));
        assert_eq!(std::fs::read(&first.path).unwrap(), b"jpeg bytes");
        assert!(archive.contains(&first.digest, "jpg"));

        let second = archive.store(b"jpeg bytes", "jpg").await.unwrap();
        assert!(!second.newly_written);
        assert_eq!(second.path, first.path);

        let other = archive.store(b"other receipt", "jpg").await.unwrap();
        assert_ne!(other.path, first.path);
    }
}
