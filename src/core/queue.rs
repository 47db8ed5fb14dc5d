//! Single-thread task queue that owns thread-affine state.
//!
//! Everything that touches GL goes through one `ExecutionQueue`: the state
//! (context, compositor, programs) is built on the queue thread by the init
//! closure and never leaves it. Callers block in `run` until their task has
//! executed, so submission order is execution order even with concurrent
//! callers.
//!
//! ```ignore
//! let queue = ExecutionQueue::spawn("gl", || GlState::new())?;
//! let pixels = queue.run(|gl| gl.render(t))?;
//! queue.close_with(|gl| gl.destroy())?;
//! ```

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, error, trace};

use crate::error::{Error, Result};

type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Message<S> {
    Run(Task<S>),
    /// Last message: optional teardown, then the thread exits and drops the state.
    Close(Option<Task<S>>),
}

pub struct ExecutionQueue<S: 'static> {
    name: String,
    sender: Mutex<Option<Sender<Message<S>>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    thread_id: thread::ThreadId,
    _state: PhantomData<fn() -> S>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<S: 'static> ExecutionQueue<S> {
    /// Start the thread and build its state with `init`. Blocks until `init`
    /// returned; its error is returned here and the thread exits.
    pub fn spawn<F>(name: &str, init: F) -> Result<Self>
    where
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (tx, rx) = unbounded::<Message<S>>();
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let thread_name = format!("framecraft-{}", name);

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut state = match panic::catch_unwind(AssertUnwindSafe(init)) {
                    Ok(Ok(state)) => {
                        let _ = ready_tx.send(Ok(()));
                        state
                    }
                    Ok(Err(e)) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                    Err(payload) => {
                        let _ = ready_tx.send(Err(Error::WorkerPanicked(panic_message(&*payload))));
                        return;
                    }
                };
                trace!("{} started", thread::current().name().unwrap_or("queue"));

                for message in rx.iter() {
                    match message {
                        Message::Run(task) => task(&mut state),
                        Message::Close(teardown) => {
                            if let Some(teardown) = teardown {
                                teardown(&mut state);
                            }
                            break;
                        }
                    }
                }
                drop(state);
                trace!("{} stopped", thread::current().name().unwrap_or("queue"));
            })?;

        let thread_id = handle.thread().id();
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::WorkerPanicked(format!("{} exited during init", thread_name)));
            }
        }
        debug!("ExecutionQueue '{}' ready", name);

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            thread_id,
            _state: PhantomData,
        })
    }

    /// Run `f` on the queue thread and wait for its result.
    ///
    /// A panic inside `f` is caught and returned as `WorkerPanicked`; the
    /// queue stays usable. Must not be called from the queue thread itself.
    pub fn run<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if thread::current().id() == self.thread_id {
            return Err(Error::WorkerPanicked(format!("re-entrant run on queue '{}'", self.name)));
        }
        let (reply_tx, reply_rx) = bounded(1);
        let task: Task<S> = Box::new(move |state: &mut S| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(state)));
            let _ = reply_tx.send(outcome.map_err(|payload| panic_message(&*payload)));
        });

        {
            let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            let Some(sender) = sender.as_ref() else {
                return Err(Error::QueueClosed);
            };
            sender.send(Message::Run(task)).map_err(|_| Error::QueueClosed)?;
        }

        match reply_rx.recv() {
            Ok(Ok(result)) => result,
            Ok(Err(message)) => {
                error!("Task on queue '{}' panicked: {}", self.name, message);
                Err(Error::WorkerPanicked(message))
            }
            Err(_) => Err(Error::QueueClosed),
        }
    }

    /// Drain pending work, then stop. Further `run` calls fail with `QueueClosed`.
    pub fn close(&self) -> Result<()> {
        self.shutdown(None)
    }

    /// Like `close`, but run `teardown` on the queue thread after pending work.
    pub fn close_with<F>(&self, teardown: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.shutdown(Some(Box::new(teardown)))
    }

    fn shutdown(&self, teardown: Option<Task<S>>) -> Result<()> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(sender) = sender else {
            return Err(Error::QueueClosed);
        };
        // Thread may already be gone after a panic in a teardown; ignore send failure.
        let _ = sender.send(Message::Close(teardown));
        drop(sender);

        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if thread::current().id() != self.thread_id && handle.join().is_err() {
                return Err(Error::WorkerPanicked(format!("queue '{}' panicked during teardown", self.name)));
            }
        }
        debug!("ExecutionQueue '{}' closed", self.name);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<S: 'static> Drop for ExecutionQueue<S> {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.shutdown(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_run_returns_value() {
        let queue = ExecutionQueue::spawn("test", || Ok(40)).unwrap();
        assert_eq!(queue.run(|n| Ok(*n + 2)).unwrap(), 42);
    }

    #[test]
    fn test_state_need_not_be_send() {
        // Rc is !Send: it can only live on the queue thread.
        let queue = ExecutionQueue::spawn("rc", || Ok(Rc::new(RefCell::new(Vec::<u32>::new())))).unwrap();
        queue.run(|v| {
            v.borrow_mut().push(7);
            Ok(())
        })
        .unwrap();
        assert_eq!(queue.run(|v| Ok(v.borrow().clone())).unwrap(), vec![7]);
    }

    #[test]
    fn test_all_tasks_run_on_one_thread() {
        let queue = ExecutionQueue::spawn("affinity", || Ok(())).unwrap();
        let first = queue.run(|_| Ok(thread::current().id())).unwrap();
        for _ in 0..10 {
            assert_eq!(queue.run(|_| Ok(thread::current().id())).unwrap(), first);
        }
        assert_ne!(first, thread::current().id());
    }

    #[test]
    fn test_concurrent_callers_are_serialized() {
        let queue = Arc::new(ExecutionQueue::spawn("serial", || Ok(Vec::<usize>::new())).unwrap());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = Arc::clone(&queue);
                let in_flight = Arc::clone(&in_flight);
                thread::spawn(move || {
                    queue
                        .run(move |log| {
                            assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                            thread::sleep(Duration::from_millis(2));
                            log.push(i);
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.run(|log| Ok(log.len())).unwrap(), 8);
    }

    #[test]
    fn test_error_propagates() {
        let queue = ExecutionQueue::spawn("err", || Ok(())).unwrap();
        let err = queue.run(|_| Err::<(), _>(Error::Timeline("bad".into()))).unwrap_err();
        assert!(matches!(err, Error::Timeline(_)));
    }

    #[test]
    fn test_panic_is_reported_and_queue_survives() {
        let queue = ExecutionQueue::spawn("panic", || Ok(1)).unwrap();
        let err = queue.run(|_| -> Result<()> { panic!("boom") }).unwrap_err();
        assert!(matches!(err, Error::WorkerPanicked(ref m) if m.contains("boom")));
        assert_eq!(queue.run(|n| Ok(*n)).unwrap(), 1);
    }

    #[test]
    fn test_run_after_close_fails() {
        let queue = ExecutionQueue::spawn("closed", || Ok(())).unwrap();
        queue.close().unwrap();
        assert!(queue.is_closed());
        assert!(matches!(queue.run(|_| Ok(())), Err(Error::QueueClosed)));
        assert!(matches!(queue.close(), Err(Error::QueueClosed)));
    }

    #[test]
    fn test_teardown_runs_after_pending_work() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let queue = Arc::new(ExecutionQueue::spawn("drain", || Ok(())).unwrap());

        let (started_tx, started_rx) = bounded(1);
        let worker = {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                queue
                    .run(move |_| {
                        started_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(20));
                        order.lock().unwrap().push("draw");
                        Ok(())
                    })
                    .unwrap();
            })
        };
        started_rx.recv().unwrap();
        let teardown_order = Arc::clone(&order);
        queue
            .close_with(move |_| teardown_order.lock().unwrap().push("teardown"))
            .unwrap();
        worker.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["draw", "teardown"]);
    }

    #[test]
    fn test_init_error_is_returned() {
        let result = ExecutionQueue::<()>::spawn("init", || Err(Error::Timeline("no display".into())));
        assert!(matches!(result, Err(Error::Timeline(_))));
    }
}
