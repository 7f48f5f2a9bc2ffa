// SPDX-License-Identifier: GPL-3.0-only

//! Dedicated camera worker thread
//!
//! Every device callback, session callback and frame conversion runs on this
//! one thread, in arrival order. The owner of the worker state (an actor) is
//! moved onto the thread at start and never leaves it, so device and session
//! handles are never touched from the caller's thread.
//!
//! Stopping is a "quit safely": messages already queued are still handled,
//! then [`WorkerActor::on_quit`] runs and the thread exits. Joining from the
//! worker itself is refused.

use crate::errors::ThreadError;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info, warn};

/// State owned by the worker thread
pub trait WorkerActor: Send + 'static {
    type Message: Send + 'static;

    /// Handle one message. Messages are delivered strictly in posting order.
    fn handle(&mut self, message: Self::Message);

    /// Runs on the worker after the last message was handled
    fn on_quit(&mut self) {}
}

enum Envelope<M> {
    Message(M),
    Quit,
}

/// Cloneable sender that posts messages onto a worker
///
/// Posting after the worker has quit is a silent no-op that returns `false`.
pub struct WorkerHandle<M> {
    sender: Sender<Envelope<M>>,
    name: Arc<str>,
}

impl<M> Clone for WorkerHandle<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            name: Arc::clone(&self.name),
        }
    }
}

impl<M: Send + 'static> WorkerHandle<M> {
    /// Enqueue a message. Returns false if the worker is gone.
    pub fn post(&self, message: M) -> bool {
        self.sender.send(Envelope::Message(message)).is_ok()
    }

    /// Enqueue a message, handing it back if the worker is gone
    pub fn try_post(&self, message: M) -> Result<(), M> {
        match self.sender.send(Envelope::Message(message)) {
            Err(mpsc::SendError(Envelope::Message(m))) => Err(m),
            _ => Ok(()),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.name
    }

    /// Handle not attached to any thread, for exercising actors directly in tests
    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> (Self, Receiver<M>) {
        let (sender, envelopes) = mpsc::channel::<Envelope<M>>();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for envelope in envelopes {
                if let Envelope::Message(m) = envelope
                    && tx.send(m).is_err()
                {
                    break;
                }
            }
        });
        (
            Self {
                sender,
                name: Arc::from(name),
            },
            rx,
        )
    }
}

impl<M> std::fmt::Debug for WorkerHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .finish()
    }
}

/// Owner of the worker thread
pub struct CaptureThread<M: Send + 'static> {
    name: String,
    handle: WorkerHandle<M>,
    join_handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl<M: Send + 'static> CaptureThread<M> {
    /// Spawn the worker
    ///
    /// `make_actor` receives the worker's own handle so the actor can hand it
    /// to providers as a callback target.
    pub fn start<A, F>(name: &str, make_actor: F) -> Result<Self, ThreadError>
    where
        A: WorkerActor<Message = M>,
        F: FnOnce(WorkerHandle<M>) -> A,
    {
        let (sender, receiver) = mpsc::channel::<Envelope<M>>();
        let handle = WorkerHandle {
            sender,
            name: Arc::from(name),
        };
        let actor = make_actor(handle.clone());

        info!(name, "Starting capture worker");

        let thread_name = name.to_string();
        let join_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(thread_name, actor, receiver))
            .map_err(|e| ThreadError::SpawnFailed(e.to_string()))?;

        let thread_id = join_handle.thread().id();

        Ok(Self {
            name: name.to_string(),
            handle,
            join_handle: Some(join_handle),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for posting messages onto the worker
    pub fn handle(&self) -> WorkerHandle<M> {
        self.handle.clone()
    }

    pub fn post(&self, message: M) -> bool {
        self.handle.post(message)
    }

    /// True when called from the worker thread itself
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Check if the worker thread is still alive
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Let queued messages drain, run the actor's quit hook and join
    ///
    /// Safe to call repeatedly. Blocks the caller until the worker exits.
    pub fn quit_and_join(&mut self) -> Result<(), ThreadError> {
        if self.join_handle.is_none() {
            return Ok(());
        }
        if self.is_current() {
            return Err(ThreadError::SelfJoin(self.name.clone()));
        }

        debug!(name = %self.name, "Requesting capture worker quit");
        // A closed channel means the worker already exited
        let _ = self.handle.sender.send(Envelope::Quit);

        let Some(join_handle) = self.join_handle.take() else {
            return Ok(());
        };
        match join_handle.join() {
            Ok(()) => {
                debug!(name = %self.name, "Capture worker joined");
                Ok(())
            }
            Err(e) => {
                warn!(name = %self.name, "Capture worker panicked: {:?}", e);
                Err(ThreadError::Panicked(self.name.clone()))
            }
        }
    }
}

impl<M: Send + 'static> Drop for CaptureThread<M> {
    fn drop(&mut self) {
        if self.join_handle.is_some() {
            debug!(name = %self.name, "CaptureThread dropped, stopping worker");
            if let Err(e) = self.quit_and_join() {
                warn!(name = %self.name, error = %e, "Worker not joined on drop");
            }
        }
    }
}

impl<M: Send + 'static> std::fmt::Debug for CaptureThread<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureThread")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_worker<A: WorkerActor>(name: String, mut actor: A, receiver: Receiver<Envelope<A::Message>>) {
    debug!(name = %name, "Capture worker started");

    for envelope in receiver.iter() {
        match envelope {
            Envelope::Message(message) => actor.handle(message),
            Envelope::Quit => break,
        }
    }

    actor.on_quit();
    info!(name = %name, "Capture worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        seen: Arc<Mutex<Vec<u32>>>,
        quit: Arc<Mutex<bool>>,
    }

    impl WorkerActor for Recorder {
        type Message = u32;

        fn handle(&mut self, message: u32) {
            thread::sleep(Duration::from_millis(1));
            self.seen.lock().unwrap().push(message);
        }

        fn on_quit(&mut self) {
            *self.quit.lock().unwrap() = true;
        }
    }

    fn recorder() -> (Recorder, Arc<Mutex<Vec<u32>>>, Arc<Mutex<bool>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let quit = Arc::new(Mutex::new(false));
        (
            Recorder {
                seen: Arc::clone(&seen),
                quit: Arc::clone(&quit),
            },
            seen,
            quit,
        )
    }

    #[test]
    fn test_messages_handled_in_order_before_quit() {
        let (actor, seen, quit) = recorder();
        let mut worker = CaptureThread::start("test-worker", move |_| actor).unwrap();

        for i in 0..20 {
            assert!(worker.post(i));
        }
        worker.quit_and_join().unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert!(*quit.lock().unwrap());
        assert!(!worker.is_running());
    }

    #[test]
    fn test_quit_is_idempotent_and_post_fails_after() {
        let (actor, _, _) = recorder();
        let mut worker = CaptureThread::start("test-worker", move |_| actor).unwrap();
        let handle = worker.handle();

        worker.quit_and_join().unwrap();
        worker.quit_and_join().unwrap();
        assert!(!handle.post(1));
    }

    struct SelfJoiner {
        worker: Arc<Mutex<Option<CaptureThread<()>>>>,
        result: Arc<Mutex<Option<Result<(), ThreadError>>>>,
    }

    impl WorkerActor for SelfJoiner {
        type Message = ();

        fn handle(&mut self, _: ()) {
            let mut guard = self.worker.lock().unwrap();
            if let Some(worker) = guard.as_mut() {
                *self.result.lock().unwrap() = Some(worker.quit_and_join());
            }
        }
    }

    #[test]
    fn test_self_join_is_refused() {
        let slot = Arc::new(Mutex::new(None));
        let result = Arc::new(Mutex::new(None));
        let actor = SelfJoiner {
            worker: Arc::clone(&slot),
            result: Arc::clone(&result),
        };

        let worker = CaptureThread::start("self-join", move |_| actor).unwrap();
        let handle = worker.handle();
        *slot.lock().unwrap() = Some(worker);

        handle.post(());
        for _ in 0..200 {
            if result.lock().unwrap().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(
            result.lock().unwrap().take(),
            Some(Err(ThreadError::SelfJoin(_)))
        ));

        let mut worker = slot.lock().unwrap().take().unwrap();
        worker.quit_and_join().unwrap();
    }

    #[test]
    fn test_worker_thread_is_named() {
        struct NameRecorder(Arc<Mutex<Option<String>>>);
        impl WorkerActor for NameRecorder {
            type Message = ();
            fn handle(&mut self, _: ()) {
                *self.0.lock().unwrap() = thread::current().name().map(str::to_string);
            }
        }

        let name = Arc::new(Mutex::new(None));
        let recorder = NameRecorder(Arc::clone(&name));
        let mut worker = CaptureThread::start("named-worker", move |_| recorder).unwrap();
        worker.post(());
        worker.quit_and_join().unwrap();

        assert_eq!(name.lock().unwrap().as_deref(), Some("named-worker"));
    }
}
