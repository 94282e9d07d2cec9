use mcp_studio_core::ProcessId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Children spawned by a manager that have not been reaped yet
#[derive(Clone, Default, Debug)]
pub struct ActiveProcesses {
    inner: Arc<Mutex<HashMap<ProcessId, String>>>,
}

impl ActiveProcesses {
    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessId, String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, pid: ProcessId, label: String) {
        self.lock().insert(pid, label);
    }

    pub fn remove(&self, pid: ProcessId) -> Option<String> {
        self.lock().remove(&pid)
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.lock().contains_key(&pid)
    }

    pub fn snapshot(&self) -> Vec<(ProcessId, String)> {
        self.lock()
            .iter()
            .map(|(pid, label)| (*pid, label.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Last-resort kill used when the owning manager goes away
    pub fn kill_all(&self) {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid as NixPid;

        let remaining = self.snapshot();
        if remaining.is_empty() {
            return;
        }
        tracing::warn!(
            "Emergency cleanup: killing {} tracked processes",
            remaining.len()
        );

        for (pid, label) in remaining {
            let nix_pid = NixPid::from_raw(pid.0 as i32);
            if signal::killpg(nix_pid, Signal::SIGKILL).is_err() {
                if let Err(e) = signal::kill(nix_pid, Signal::SIGKILL) {
                    tracing::error!("Failed to kill {label} (PID {pid}) during cleanup: {e}");
                }
            }
        }
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking() {
        let active = ActiveProcesses::default();
        active.insert(ProcessId(10), "sleep 30".into());
        active.insert(ProcessId(11), "sleep 31".into());
        assert_eq!(active.len(), 2);
        assert!(active.contains(ProcessId(10)));

        assert_eq!(active.remove(ProcessId(10)).as_deref(), Some("sleep 30"));
        assert!(!active.contains(ProcessId(10)));

        let clone = active.clone();
        clone.clear();
        assert!(active.is_empty());
    }
}
