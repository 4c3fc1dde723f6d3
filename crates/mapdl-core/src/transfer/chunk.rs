use crate::config::TransferConfig;
use crate::error::{MapdlError, Result};

/// Size of one transfer chunk, between 1 byte and
/// [`TransferConfig::MAX_CHUNK_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSize(usize);

impl ChunkSize {
    pub fn new(bytes: usize) -> Result<Self> {
        if bytes == 0 || bytes > TransferConfig::MAX_CHUNK_SIZE {
            return Err(MapdlError::InvalidChunkSize {
                requested: bytes,
                max: TransferConfig::MAX_CHUNK_SIZE,
            });
        }
        Ok(Self(bytes))
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        Self(TransferConfig::DEFAULT_CHUNK_SIZE)
    }
}

impl TryFrom<usize> for ChunkSize {
    type Error = MapdlError;

    fn try_from(bytes: usize) -> Result<Self> {
        Self::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert!(matches!(ChunkSize::new(0), Err(MapdlError::InvalidChunkSize { .. })));
        assert!(ChunkSize::new(TransferConfig::MAX_CHUNK_SIZE + 1).is_err());
        assert!(ChunkSize::new(usize::MAX).is_err());
        assert_eq!(ChunkSize::new(1).unwrap().get(), 1);
        assert_eq!(
            ChunkSize::new(TransferConfig::MAX_CHUNK_SIZE).unwrap().get(),
            TransferConfig::MAX_CHUNK_SIZE
        );
        assert_eq!(ChunkSize::default().get(), 256 * 1024);
    }
}
