#[cfg(test)] use mockall::automock;

/// Payload compression for application frames. A session only calls this for payloads above
///  its compression threshold, and only keeps the result if it is actually smaller.
#[cfg_attr(test, automock)]
pub trait Compressor: Send + Sync + 'static {
    fn compress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>>;
}

pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub const DEFAULT_LEVEL: i32 = 3;

    pub fn new(level: i32) -> ZstdCompressor {
        ZstdCompressor { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        ZstdCompressor::new(Self::DEFAULT_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(zstd::encode_all(data, self.level)?)
    }

    fn decompress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(zstd::decode_all(data)?)
    }
}

/// Never makes anything smaller, so payloads always go out uncompressed
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
