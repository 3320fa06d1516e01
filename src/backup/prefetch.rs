//! Single-slot asynchronous fetch
//!
//! The driver hands each page request to a dedicated helper thread and
//! picks the response up later, so the network wait overlaps with the
//! queue draining. Request and response share the coordination lock and
//! condvar: a raised fault signal wakes the driver whether it is blocked
//! here or on queue backpressure.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::backup::coord::Coord;
use crate::source::{FetchOutcome, FetchRequest, PostSource};

/// The API helper thread, owning the response source for the run
pub struct ApiThread {
    coord: Arc<Coord>,
    handle: Option<JoinHandle<()>>,
}

impl ApiThread {
    pub fn spawn(coord: Arc<Coord>, mut source: Box<dyn PostSource>) -> Self {
        let thread_coord = coord.clone();
        let handle = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || loop {
                let request = {
                    let mut shared = thread_coord.lock();
                    loop {
                        if shared.fetch_quit {
                            return;
                        }
                        if let Some(request) = shared.fetch_request.take() {
                            break request;
                        }
                        shared = thread_coord.wait(shared);
                    }
                };

                // The fetch itself runs unlocked; the source blocks on the
                // no-internet signal internally if connectivity drops
                let outcome = source.fetch(request.count, request.args);

                let mut shared = thread_coord.lock();
                shared.fetch_outcome = Some(outcome);
                thread_coord.notify_all();
            })
            .expect("failed to spawn api thread");

        Self {
            coord,
            handle: Some(handle),
        }
    }

    /// Queues the next page request; the slot must be free
    pub fn put(&self, request: FetchRequest) {
        let mut shared = self.coord.lock();
        debug_assert!(
            shared.fetch_request.is_none() && shared.fetch_outcome.is_none(),
            "fetch slot already occupied"
        );
        shared.fetch_request = Some(request);
        self.coord.notify_all();
    }

    /// Blocks until the queued request's response is available
    ///
    /// Re-checks the fault flags on every wake; a raised fault keeps the
    /// caller blocked even if the response is ready.
    pub fn get(&self) -> FetchOutcome {
        let mut shared = self.coord.lock();
        loop {
            if !shared.faulted() {
                if let Some(outcome) = shared.fetch_outcome.take() {
                    return outcome;
                }
            }
            shared = self.coord.wait(shared);
        }
    }

    /// Stops the helper thread
    pub fn quit(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            {
                let mut shared = self.coord.lock();
                shared.fetch_quit = true;
                self.coord.notify_all();
            }
            let _ = handle.join();
        }
    }
}

impl Drop for ApiThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
