#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        sync::Arc,
    };
    use umpbridge::{Scheduler, ThreadScheduler};

    #[test]
    fn test_multiple_scheduler_tasks() {
        let scheduler = ThreadScheduler::new();
        let task_count = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let task_count = task_count.clone();
                scheduler
                    .spawn(&format!("task-{}", i), move || {
                        task_count.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(task_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_scheduler_names_threads() {
        let scheduler = ThreadScheduler::default();
        let handle = scheduler
            .spawn("umpbridge-inbound", || {
                assert_eq!(
                    std::thread::current().name(),
                    Some("umpbridge-inbound")
                );
            })
            .unwrap();
        handle.join().unwrap();
    }
}
