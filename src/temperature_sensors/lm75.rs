use std::{
    fs::OpenOptions,
    io::{self, Read, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
#[cfg(debug_assertions)]
use log::debug;

use crate::{catalog::DeviceDescriptor, model::MILLI_DEGREES, sensors::SensorTransducer};

/// Transducer type name in the thermal description.
pub const LM75: &str = "lm75";

/// `I2C_SLAVE` request from `linux/i2c-dev.h`.
const I2C_SLAVE: u16 = 0x0703;

/// Half-degree flag in the second LM75 byte.
const HALF_DEGREE_BIT: u8 = 0x80;

/// Converts the two-byte LM75 payload to milli-degrees Celsius.
///
/// The first byte is the signed whole-degree value, the high bit of the
/// second byte adds half a degree.
pub fn decode(raw: &[u8]) -> Result<i32> {
    let [whole, fraction, ..] = raw else {
        bail!("short lm75 payload ({} bytes)", raw.len());
    };

    let mut temp = i32::from(*whole as i8) * MILLI_DEGREES;
    if fraction & HALF_DEGREE_BIT != 0 {
        temp += MILLI_DEGREES / 2;
    }
    Ok(temp)
}

/// Reads LM75-style sensors through Linux `i2c-dev` nodes.
pub struct I2cTransducer {
    dev_root: PathBuf,
}

impl Default for I2cTransducer {
    fn default() -> Self {
        Self::new("/dev")
    }
}

impl I2cTransducer {
    pub fn new(dev_root: impl Into<PathBuf>) -> Self {
        Self {
            dev_root: dev_root.into(),
        }
    }

    fn adapter_path(&self, bus: u32) -> PathBuf {
        self.dev_root.join(format!("i2c-{bus}"))
    }

    fn read_blocking(path: &Path, address: u16, register: u8) -> Result<Vec<u8>> {
        let mut adapter = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        // SAFETY: the fd is owned by `adapter` and outlives the call;
        // I2C_SLAVE takes the address by value.
        let rc = unsafe {
            libc::ioctl(
                adapter.as_raw_fd(),
                I2C_SLAVE as _,
                libc::c_ulong::from(address),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to select address {address:#04x}"));
        }

        adapter
            .write_all(&[register])
            .with_context(|| format!("Failed to select register {register:#04x}"))?;

        let mut buf = [0u8; 2];
        adapter
            .read_exact(&mut buf)
            .with_context(|| format!("Failed to read {address:#04x} on {}", path.display()))?;

        Ok(buf.to_vec())
    }
}

#[async_trait]
impl SensorTransducer for I2cTransducer {
    async fn read(&self, device: &DeviceDescriptor, subsystem: &str) -> Result<Vec<u8>> {
        let path = self.adapter_path(device.bus);
        let address = device.address;
        let register = device.register;

        #[cfg(debug_assertions)]
        {
            debug!(
                "Reading {subsystem}/{} at {}:{address:#04x}",
                device.name,
                path.display()
            );
        }

        tokio::task::spawn_blocking(move || Self::read_blocking(&path, address, register))
            .await
            .with_context(|| format!("i2c read task for {subsystem}/{} failed", device.name))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_whole_degrees() {
        assert_eq!(decode(&[25, 0x00]).unwrap(), 25_000);
    }

    #[test]
    fn decode_half_degree_flag() {
        assert_eq!(decode(&[25, 0x80]).unwrap(), 25_500);
        // only the high bit counts
        assert_eq!(decode(&[25, 0x7f]).unwrap(), 25_000);
    }

    #[test]
    fn decode_negative_whole_degrees() {
        assert_eq!(decode(&[0xfb, 0x00]).unwrap(), -5_000);
    }

    #[test]
    fn decode_rejects_short_payload() {
        assert!(decode(&[25]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn adapter_path_uses_bus_number() {
        let transducer = I2cTransducer::new("/tmp/dev");
        assert_eq!(transducer.adapter_path(3), PathBuf::from("/tmp/dev/i2c-3"));
    }

    #[tokio::test]
    async fn read_fails_without_adapter_node() {
        let dir = tempfile::TempDir::new().unwrap();
        let transducer = I2cTransducer::new(dir.path());
        let device = DeviceDescriptor {
            name: "BoardTemp".to_string(),
            bus: 7,
            address: 0x48,
            register: 0,
        };

        let err = transducer.read(&device, "base").await.unwrap_err();
        assert!(err.to_string().contains("Failed to open"));
    }
}
