//! A small thread pool for running actor futures.
//!
//! Each worker thread drives a current-thread tokio runtime, so futures
//! spawned onto the pool do not need to be `Send` once running and are never
//! polled from two threads. One actor future per mailbox is the concurrency
//! model of the whole engine: an actor's state is only ever touched from the
//! single worker polling it.

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;

use futures::stream::{FuturesUnordered, StreamExt};

type BoxedFut = Pin<Box<dyn Future<Output = ()>>>;
type SpawnFn = Box<dyn FnOnce() -> BoxedFut + Send + 'static>;

enum Message {
    Execute(SpawnFn),
    Shutdown,
}

/// A pool of worker threads executing local (non-`Send`) futures.
///
/// Dropping the pool stops accepting new tasks and joins the workers once
/// the tasks already running on them have completed. [`LocalPool::shutdown`]
/// does the same but also waits for queued tasks.
#[derive(Debug)]
pub struct LocalPool {
    threads: Vec<std::thread::JoinHandle<()>>,
    handle: LocalPoolHandle,
}

/// A cloneable handle used to spawn tasks onto a [`LocalPool`].
#[derive(Debug, Clone)]
pub struct LocalPoolHandle {
    send: flume::Sender<Message>,
}

impl LocalPool {
    /// Create a pool with `threads` workers.
    pub fn new(threads: usize) -> Self {
        let (send, recv) = flume::unbounded::<Message>();
        let threads = (0..threads.max(1))
            .map(|i| {
                let recv = recv.clone();
                std::thread::Builder::new()
                    .name(format!("drift-pool-{i}"))
                    .spawn(move || worker(recv))
                    .expect("failed to spawn pool thread")
            })
            .collect();
        Self {
            threads,
            handle: LocalPoolHandle { send },
        }
    }

    /// A handle for spawning tasks, detachable from the pool's lifetime.
    pub fn handle(&self) -> &LocalPoolHandle {
        &self.handle
    }

    /// Finish queued and running tasks, then join all workers.
    ///
    /// Equivalent to dropping the pool; spelled out so call sites show the
    /// blocking join.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Deref for LocalPool {
    type Target = LocalPoolHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for LocalPool {
    fn drop(&mut self) {
        // The queue is FIFO, so every task submitted before the shutdown
        // markers still runs. Outstanding handle clones keep the channel
        // open, which is why close-by-drop is not enough here.
        for _ in 0..self.threads.len() {
            self.handle.send.send(Message::Shutdown).ok();
        }
        for thread in self.threads.drain(..) {
            if let Err(cause) = thread.join() {
                tracing::error!("error joining pool thread: {:?}", cause);
            }
        }
    }
}

impl LocalPoolHandle {
    /// Spawn a future onto one of the pool's workers.
    ///
    /// The closure runs on the worker thread, so the future it builds may be
    /// `!Send`. Tasks submitted after shutdown are dropped.
    pub fn spawn_detached<F, Fut>(&self, gen: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let spawn: SpawnFn = Box::new(move || Box::pin(gen()) as BoxedFut);
        if self.send.send(Message::Execute(spawn)).is_err() {
            tracing::warn!("local pool is shut down, dropping task");
        }
    }
}

fn worker(recv: flume::Receiver<Message>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!("failed to build pool runtime: {err:#}");
            return;
        }
    };
    rt.block_on(async move {
        let mut tasks = FuturesUnordered::new();
        loop {
            tokio::select! {
                Some(()) = tasks.next(), if !tasks.is_empty() => {}
                msg = recv.recv_async() => match msg {
                    Ok(Message::Execute(spawn)) => tasks.push(spawn()),
                    Ok(Message::Shutdown) | Err(_) => break,
                },
            }
        }
        // Let the tasks still running finish before the runtime goes away.
        while tasks.next().await.is_some() {}
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn spawn_and_shutdown() {
        let pool = LocalPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.spawn_detached(move || async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn tasks_may_be_non_send() {
        let pool = LocalPool::new(1);
        let (tx, rx) = flume::bounded(1);
        pool.spawn_detached(move || async move {
            // Rc is !Send; the future only ever lives on the worker.
            let value = std::rc::Rc::new(7usize);
            tx.send_async(*value).await.ok();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.shutdown();
    }
}
