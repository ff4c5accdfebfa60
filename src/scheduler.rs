//! Scheduler collaborator (§4.G, §9): `Engine::schedule` delegates here.
//! Schedulers in this system are just clients that call `enqueue` at the
//! right time (§1) — this is the minimal in-process one, a deferred task
//! per scheduled request cancellable before it fires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use uuid::Uuid;

use crate::request::Request;

pub struct Scheduler {
    tasks: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { tasks: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Schedule `on_fire(request)` to run once `when` elapses. Returns a
    /// scheduling id distinct from the request's own handle id, since the
    /// request hasn't been enqueued yet and may never be.
    pub fn schedule<F>(&self, request: Request, when: SystemTime, on_fire: F) -> String
    where
        F: FnOnce(Request) + Send + 'static,
    {
        let schedule_id = Uuid::new_v4().to_string();
        let delay = when.duration_since(SystemTime::now()).unwrap_or_default();

        let tasks = self.tasks.clone();
        let id_for_cleanup = schedule_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(request);
            tasks.lock().unwrap().remove(&id_for_cleanup);
        });

        self.tasks.lock().unwrap().insert(schedule_id.clone(), handle);
        schedule_id
    }

    /// Cancel a not-yet-fired schedule. Returns `false` if it already fired
    /// or never existed.
    pub fn cancel(&self, schedule_id: &str) -> bool {
        match self.tasks.lock().unwrap().remove(schedule_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn fires_after_the_requested_delay() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let request = Request::new("http://example.com/a.bin", "a.bin");
        let when = SystemTime::now() + std::time::Duration::from_millis(10);
        scheduler.schedule(request, when, move |_| {
            fired_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_before_firing_suppresses_the_callback() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let request = Request::new("http://example.com/a.bin", "a.bin");
        let when = SystemTime::now() + std::time::Duration::from_millis(50);
        let id = scheduler.schedule(request, when, move |_| {
            fired_clone.store(true, Ordering::SeqCst);
        });

        assert!(scheduler.cancel(&id));
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
