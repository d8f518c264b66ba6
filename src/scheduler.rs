use std::io;
use std::thread::{self, JoinHandle};

/// Starts the long-lived execution contexts the bridge runs its pumps on
pub trait Scheduler: Send + Sync {
    fn spawn<F>(&self, name: &str, f: F) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static;
}

pub struct ThreadScheduler;

impl ThreadScheduler {
    pub fn new() -> Self {
        ThreadScheduler
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn spawn<F>(&self, name: &str, f: F) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new().name(name.to_string()).spawn(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_thread_scheduler_spawn() {
        let scheduler = ThreadScheduler::new();
        let flag = Arc::new(Mutex::new(false));
        let flag_clone = flag.clone();

        let handle = scheduler
            .spawn("test-worker", move || {
                let mut flag = flag_clone.lock().unwrap();
                *flag = true;
            })
            .unwrap();

        assert_eq!(handle.thread().name(), Some("test-worker"));
        handle.join().unwrap();
        assert!(*flag.lock().unwrap());
    }
}
