//! The two dedicated executors (spec.md §5 / SPEC_FULL §5a): the Pipeline
//! executor runs every `run_op`/`handle_event`, the Callback executor runs
//! every completion and every client-visible event. Each is an OS thread
//! parked in a `tokio::runtime::Builder::new_current_thread()` runtime,
//! draining a `tokio::sync::mpsc::UnboundedReceiver<Job>` via an async
//! `recv().await` inside a `LocalSet` — the same runtime shape the teacher
//! builds in `cloud/dps.rs::tests::get_azure_token`, here used for the
//! crate's real scheduling instead of a one-off test helper. The receive
//! has to be an `.await`, not a blocking `std::sync::mpsc::Receiver::recv`:
//! a synchronous recv on a `new_current_thread` runtime never yields back to
//! the scheduler, so nothing spawned onto this runtime (the MQTT poll loop,
//! the connect/publish tasks in `mqtt/client_stage.rs`) would ever be
//! polled. The `LocalSet` is what lets those tasks use
//! `tokio::task::spawn_local` instead of requiring `Send` futures on a
//! single-threaded runtime.

use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::LocalSet;

use crate::utils::thread::join;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded, re-entrant job executor. Submitting from the owning
/// thread runs the job inline; submitting from any other thread queues it
/// for the executor thread to pick up.
pub struct Executor {
    thread_id: ThreadId,
    sender: tokio_mpsc::UnboundedSender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl Executor {
    pub fn spawn(name: &'static str) -> Executor {
        let (sender, mut receiver) = tokio_mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<ThreadId>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap_or_else(|e| panic!("failed to build `{name}` executor runtime: {e}"));
                let local = LocalSet::new();

                ready_tx
                    .send(thread::current().id())
                    .expect("executor startup channel dropped before handshake");

                local.block_on(&runtime, async move {
                    while let Some(job) = receiver.recv().await {
                        job();
                    }
                });
                log::debug!("executor `{name}` shutting down: job channel closed");
            })
            .unwrap_or_else(|e| panic!("failed to spawn `{name}` executor thread: {e}"));

        let thread_id = ready_rx
            .recv()
            .expect("executor thread dropped before reporting its id");

        Executor {
            thread_id,
            sender,
            handle: Some(handle),
        }
    }

    /// Run `job` on this executor. If the caller is already on the
    /// executor's own thread, run inline — the re-entrance rule from
    /// spec.md §5 ("a call from that same thread runs the job inline
    /// rather than round-tripping the channel").
    pub fn run(&self, job: impl FnOnce() + Send + 'static) {
        if thread::current().id() == self.thread_id {
            job();
            return;
        }
        if self.sender.send(Box::new(job)).is_err() {
            log::error!("executor job submitted after shutdown; dropping");
        }
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Dropping `sender` closes the channel, which ends the `recv` loop
        // and lets the runtime wind down; then we wait for the thread.
        join(&mut self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_a_job_submitted_from_another_thread() {
        let executor = Executor::spawn("test-executor");
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let (tx, rx) = std_mpsc::channel();
        executor.run(move || {
            ran2.store(true, Ordering::SeqCst);
            tx.send(()).unwrap();
        });
        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("job should run");
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn reentrant_call_runs_inline() {
        let executor = Executor::spawn("reentrant-executor");
        let (tx, rx) = std_mpsc::channel();
        let tx_inner = tx.clone();
        executor.run(move || {
            // This nested call is already on the executor's thread.
            tx_inner.send(thread::current().id()).unwrap();
        });
        let inner_id = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_ne!(inner_id, thread::current().id());
    }
}
