use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Handle held by the task driving a job
#[derive(Debug, Clone)]
pub struct JobHandle {
    aborted: Arc<AtomicBool>,
    started: Instant,
}

impl JobHandle {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// In-process table of running jobs and their abort flags
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    active: Arc<Mutex<HashMap<String, JobHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `job_id` for a new driving task. `None` if one is already running.
    pub fn register(&self, job_id: &str) -> Option<JobHandle> {
        let mut active = self.active.lock().ok()?;
        if active.contains_key(job_id) {
            return None;
        }
        let handle = JobHandle {
            aborted: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        };
        active.insert(job_id.to_string(), handle.clone());
        Some(handle)
    }

    /// Raise the abort flag. Returns false when the job is not running here.
    pub fn abort(&self, job_id: &str) -> bool {
        match self.active.lock() {
            Ok(active) => match active.get(job_id) {
                Some(handle) => {
                    handle.aborted.store(true, Ordering::SeqCst);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(job_id))
            .unwrap_or(false)
    }

    pub fn remove(&self, job_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_once() {
        let registry = JobRegistry::new();
        assert!(registry.register("a").is_some());
        assert!(registry.register("a").is_none());
        assert!(registry.is_active("a"));

        registry.remove("a");
        assert!(!registry.is_active("a"));
        assert!(registry.register("a").is_some());
    }

    #[test]
    fn test_abort_reaches_handle() {
        let registry = JobRegistry::new();
        let handle = registry.register("a").unwrap();
        assert!(!handle.is_aborted());

        assert!(registry.abort("a"));
        assert!(handle.is_aborted());
        assert!(!registry.abort("missing"));
    }
}
