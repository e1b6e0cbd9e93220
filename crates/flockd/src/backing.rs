//! Backing-store gateway.
//!
//! Thin facade over the storage plugin that provides local block
//! devices for volume replicas. The engine only uses the contract
//! below; the production implementation drives an LVM volume group
//! through the usual command-line tools.

use async_trait::async_trait;
use std::process::Stdio;
use tracing::{debug, warn};

use flock_model::{FlockError, FlockResult};

/// Storage-plugin contract consumed by the reconciliation engine.
/// Devices are identified by the opaque path the gateway returned when
/// it created them.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Allocate an empty backing device for a volume replica.
    async fn create(&self, res: &str, vol_id: u8, size_kib: u64) -> FlockResult<String>;

    /// Remove a backing device.
    async fn remove(&self, device: &str) -> FlockResult<()>;

    /// Activate a backing device.
    async fn up(&self, device: &str) -> FlockResult<()>;

    /// Deactivate a backing device.
    async fn down(&self, device: &str) -> FlockResult<()>;

    /// Take a snapshot of `source_device`.
    async fn create_snapshot(&self, name: &str, vol_id: u8, source_device: &str)
        -> FlockResult<String>;

    /// Materialize a volume replica from a snapshot device.
    async fn restore_snapshot(&self, res: &str, vol_id: u8, source_device: &str)
        -> FlockResult<String>;

    /// Remove a snapshot device.
    async fn remove_snapshot(&self, device: &str) -> FlockResult<()>;

    /// Refresh pool telemetry; returns (size, free) in kiB.
    async fn update_pool(&self) -> FlockResult<(i64, i64)>;
}

/// LVM-backed production gateway. All devices live in one volume group.
pub struct LvmBacking {
    vg: String,
}

impl LvmBacking {
    pub fn new(vg: String) -> Self {
        Self { vg }
    }

    fn lv_name(res: &str, vol_id: u8) -> String {
        format!("{}_{:02}", res, vol_id)
    }

    fn dev_path(&self, lv: &str) -> String {
        format!("/dev/{}/{}", self.vg, lv)
    }

    /// Strip the /dev/<vg>/ prefix off a device path.
    fn lv_of(&self, device: &str) -> String {
        device
            .strip_prefix(&format!("/dev/{}/", self.vg))
            .unwrap_or(device)
            .to_string()
    }

    async fn run(&self, program: &str, args: &[&str]) -> FlockResult<String> {
        debug!("running {} {}", program, args.join(" "));
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                warn!("cannot start {}: {}", program, e);
                FlockError::StorageError(format!("{}: {}", program, e))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("insufficient free space") {
                return Err(FlockError::NoSpace);
            }
            return Err(FlockError::StorageError(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn lv_exists(&self, lv: &str) -> bool {
        let spec = format!("{}/{}", self.vg, lv);
        self.run("lvs", &["--noheadings", &spec]).await.is_ok()
    }
}

#[async_trait]
impl BackingStore for LvmBacking {
    async fn create(&self, res: &str, vol_id: u8, size_kib: u64) -> FlockResult<String> {
        let lv = Self::lv_name(res, vol_id);
        if self.lv_exists(&lv).await {
            // An LV we did not create occupies the name; retrying will
            // not help, the operator has to resolve this
            return Err(FlockError::DeviceExists(self.dev_path(&lv)));
        }
        let size = format!("{}k", size_kib);
        self.run("lvcreate", &["-L", &size, "-n", &lv, &self.vg])
            .await?;
        Ok(self.dev_path(&lv))
    }

    async fn remove(&self, device: &str) -> FlockResult<()> {
        let spec = format!("{}/{}", self.vg, self.lv_of(device));
        self.run("lvremove", &["-f", &spec]).await.map(|_| ())
    }

    async fn up(&self, device: &str) -> FlockResult<()> {
        let spec = format!("{}/{}", self.vg, self.lv_of(device));
        self.run("lvchange", &["-ay", &spec]).await.map(|_| ())
    }

    async fn down(&self, device: &str) -> FlockResult<()> {
        let spec = format!("{}/{}", self.vg, self.lv_of(device));
        self.run("lvchange", &["-an", &spec]).await.map(|_| ())
    }

    async fn create_snapshot(
        &self,
        name: &str,
        vol_id: u8,
        source_device: &str,
    ) -> FlockResult<String> {
        let lv = Self::lv_name(name, vol_id);
        if self.lv_exists(&lv).await {
            return Err(FlockError::DeviceExists(self.dev_path(&lv)));
        }
        self.run("lvcreate", &["-s", "-n", &lv, source_device])
            .await?;
        Ok(self.dev_path(&lv))
    }

    async fn restore_snapshot(
        &self,
        res: &str,
        vol_id: u8,
        source_device: &str,
    ) -> FlockResult<String> {
        let lv = Self::lv_name(res, vol_id);
        if self.lv_exists(&lv).await {
            return Err(FlockError::DeviceExists(self.dev_path(&lv)));
        }
        // A writable snapshot of the snapshot becomes the new replica
        self.run("lvcreate", &["-s", "-n", &lv, source_device])
            .await?;
        self.run("lvchange", &["-ay", "-K", &format!("{}/{}", self.vg, lv)])
            .await?;
        Ok(self.dev_path(&lv))
    }

    async fn remove_snapshot(&self, device: &str) -> FlockResult<()> {
        self.remove(device).await
    }

    async fn update_pool(&self) -> FlockResult<(i64, i64)> {
        let out = self
            .run(
                "vgs",
                &[
                    "--noheadings",
                    "--nosuffix",
                    "--units",
                    "k",
                    "-o",
                    "vg_size,vg_free",
                    &self.vg,
                ],
            )
            .await?;
        parse_pool(&out).ok_or_else(|| FlockError::StorageError(format!("unparsable vgs output: {}", out.trim())))
    }
}

fn parse_pool(out: &str) -> Option<(i64, i64)> {
    let mut fields = out.split_whitespace();
    let size = fields.next()?.parse::<f64>().ok()?;
    let free = fields.next()?.parse::<f64>().ok()?;
    Some((size as i64, free as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pool() {
        assert_eq!(parse_pool("  1048576.00 524288.00\n"), Some((1048576, 524288)));
        assert_eq!(parse_pool(""), None);
        assert_eq!(parse_pool("garbage"), None);
    }

    #[test]
    fn test_device_naming() {
        let backing = LvmBacking::new("flockpool".to_string());
        assert_eq!(LvmBacking::lv_name("r1", 0), "r1_00");
        assert_eq!(backing.dev_path("r1_00"), "/dev/flockpool/r1_00");
        assert_eq!(backing.lv_of("/dev/flockpool/r1_00"), "r1_00");
        // Foreign paths pass through untouched
        assert_eq!(backing.lv_of("/dev/other/x"), "/dev/other/x");
    }
}
