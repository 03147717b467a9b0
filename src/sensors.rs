use anyhow::Result;
use async_trait::async_trait;

use crate::catalog::DeviceDescriptor;

/// Bus-level access to a temperature transducer.
///
/// Implementations return the raw register payload; decoding into a
/// temperature is the reader's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SensorTransducer: Send + Sync {
    async fn read(&self, device: &DeviceDescriptor, subsystem: &str) -> Result<Vec<u8>>;
}
