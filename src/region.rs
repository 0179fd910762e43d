//! A read-only memory region constructed by fully slurping a file.
//!
//! This is the "owning buffer" half of the `read-region` operation: it
//! participates in the retry envelope only through the
//! `stat` + single ranged `read` that build it (see
//! [`crate::filesystem::S3Filesystem::read_region`]); once constructed it's
//! an inert, `Send + Sync` byte buffer, grounded on the way
//! `sourcefrog-conserve/src/transport/local.rs::read_file` returns an
//! owned `Bytes` rather than a borrowed slice.

use bytes::Bytes;

/// An immutable, owned view of a whole object's contents.
#[derive(Clone, Debug)]
pub struct ReadOnlyMemoryRegion {
    bytes: Bytes,
}

impl ReadOnlyMemoryRegion {
    pub(crate) fn new(bytes: Bytes) -> Self {
        ReadOnlyMemoryRegion { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for ReadOnlyMemoryRegion {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exposes_the_bytes_it_was_built_from() {
        let region = ReadOnlyMemoryRegion::new(Bytes::from_static(b"hello"));
        assert_eq!(region.as_slice(), b"hello");
        assert_eq!(region.len(), 5);
        assert!(!region.is_empty());
    }
}
