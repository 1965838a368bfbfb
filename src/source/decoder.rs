use anyhow::Result;
use bytes::Bytes;

/// Turns raw transferred bytes into the payload kept in memory. Runs on the
/// blocking pool, so implementations may be CPU heavy.
pub trait BundleDecoder: Send + Sync {
    fn decode(&self, name: &str, raw: Bytes) -> Result<Bytes>;
}

/// Keeps the transferred bytes as the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDecoder;

impl BundleDecoder for RawDecoder {
    fn decode(&self, _name: &str, raw: Bytes) -> Result<Bytes> {
        Ok(raw)
    }
}
