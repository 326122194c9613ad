//! In-crate test doubles.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chv_core::error::{ChvError, Result};
use parking_lot::Mutex;

use crate::vmm::{Hypervisor, InstanceSpec, RestoreSpec};

/// Records every call; each operation can be made to fail, and the slow ones
/// can be made to take a while.
#[derive(Default)]
pub struct MockHypervisor {
    pub calls: Mutex<Vec<String>>,
    pub cmdlines: Mutex<Vec<String>>,
    pub fail_launch: AtomicBool,
    pub fail_teardown: AtomicBool,
    pub fail_snapshot: AtomicBool,
    pub fail_restore: AtomicBool,
    pub launch_delay: Mutex<Option<Duration>>,
    pub shutdown_delay: Mutex<Option<Duration>>,
    pub teardown_delay: Mutex<Option<Duration>>,
    pub snapshot_delay: Mutex<Option<Duration>>,
}

impl MockHypervisor {
    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn wait(delay: &Mutex<Option<Duration>>) {
        let delay = *delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn failure(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(ChvError::Hypervisor(format!("{} failed", what)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn launch(&self, spec: &InstanceSpec) -> Result<()> {
        self.record(format!("launch {}", spec.name));
        self.cmdlines.lock().push(spec.cmdline.clone());
        Self::wait(&self.launch_delay).await;
        Self::failure(&self.fail_launch, "launch")
    }

    async fn shutdown(&self, name: &str) -> Result<()> {
        self.record(format!("shutdown {}", name));
        Self::wait(&self.shutdown_delay).await;
        Ok(())
    }

    async fn teardown(&self, name: &str) -> Result<()> {
        self.record(format!("teardown {}", name));
        Self::wait(&self.teardown_delay).await;
        Self::failure(&self.fail_teardown, "teardown")
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.record(format!("pause {}", name));
        Ok(())
    }

    async fn resume(&self, name: &str) -> Result<()> {
        self.record(format!("resume {}", name));
        Ok(())
    }

    async fn snapshot(&self, name: &str, _dest: &Path) -> Result<()> {
        self.record(format!("snapshot {}", name));
        Self::wait(&self.snapshot_delay).await;
        Self::failure(&self.fail_snapshot, "snapshot")
    }

    async fn restore(&self, spec: &RestoreSpec) -> Result<()> {
        self.record(format!("restore {}", spec.name));
        Self::failure(&self.fail_restore, "restore")
    }
}
