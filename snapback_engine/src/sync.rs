//! Concurrency primitives the backup driver is built on: a counting
//! semaphore with strictly controlled wake order, and an all-or-nothing
//! task joiner.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use snapback_core::{Error, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Semaphore with strictly controlled wake order.
///
/// FIFO order is fair. LIFO order deliberately starves old waiters: the
/// scan uses it to keep tree exploration depth-first so the in-memory scan
/// front stays narrow.
#[derive(Debug)]
pub struct FairSemaphore {
    state: Mutex<SemaphoreState>,
    fifo: bool,
}

#[derive(Debug)]
struct SemaphoreState {
    value: usize,
    queue: VecDeque<oneshot::Sender<()>>,
}

impl FairSemaphore {
    pub fn new(value: usize, fifo: bool) -> Self {
        FairSemaphore {
            state: Mutex::new(SemaphoreState {
                value,
                queue: VecDeque::new(),
            }),
            fifo,
        }
    }

    pub fn locked(&self) -> bool {
        self.state.lock().unwrap().value == 0
    }

    /// Take a permit, parking until one is released. The permit is returned
    /// when the guard drops.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            if state.value > 0 {
                state.value -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = waiter {
            Waiter {
                semaphore: self,
                rx,
                granted: false,
            }
            .await;
        }
        SemaphorePermit { semaphore: self }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            let next = if self.fifo {
                state.queue.pop_front()
            } else {
                state.queue.pop_back()
            };
            match next {
                // A waiter can be cancelled while parked; its receiver is
                // gone and the send fails, so the permit goes to the next
                // live waiter instead.
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.value += 1;
                    return;
                }
            }
        }
    }
}

/// Parked acquirer. If the acquiring future is dropped after the permit
/// was already granted, `Drop` forwards the permit so another waiter can
/// proceed.
struct Waiter<'a> {
    semaphore: &'a FairSemaphore,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Future for Waiter<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(_) => {
                this.granted = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.granted {
            // Stop a raced send from landing in a closed channel unnoticed,
            // then recover the permit if it was already granted.
            self.rx.close();
            if self.rx.try_recv().is_ok() {
                self.semaphore.release();
            }
        }
    }
}

/// Held permit; releasing is dropping.
pub struct SemaphorePermit<'a> {
    semaphore: &'a FairSemaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Await every task; on the first failure cancel the rest, await their
/// unwinding, and propagate the error. Successful results come back in
/// input order.
pub async fn gather_all_or_nothing<T: Send + 'static>(
    handles: Vec<JoinHandle<Result<T>>>,
) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(handles.len());
    let mut iter = handles.into_iter();
    while let Some(handle) = iter.next() {
        let error = match handle.await {
            Ok(Ok(value)) => {
                results.push(value);
                continue;
            }
            Ok(Err(err)) => err,
            Err(join_err) => Error::Internal(format!("task failed: {join_err}")),
        };

        let rest: Vec<_> = iter.collect();
        for handle in &rest {
            handle.abort();
        }
        for handle in rest {
            let _ = handle.await;
        }
        return Err(error);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn run_waiters(fifo: bool) -> Vec<usize> {
        let semaphore = Arc::new(FairSemaphore::new(1, fifo));
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = semaphore.acquire().await;
        let mut handles = Vec::new();
        for i in 0..4 {
            let semaphore = semaphore.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Make sure each waiter parks before the next arrives.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(blocker);
        for handle in handles {
            handle.await.unwrap();
        }
        Arc::try_unwrap(order).unwrap().into_inner().unwrap()
    }

    #[tokio::test]
    async fn fifo_wakes_in_arrival_order() {
        assert_eq!(run_waiters(true).await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn lifo_wakes_newest_first() {
        assert_eq!(run_waiters(false).await, vec![3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let semaphore = Arc::new(FairSemaphore::new(2, true));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let semaphore = semaphore.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_lose_the_permit() {
        let semaphore = Arc::new(FairSemaphore::new(1, true));

        let blocker = semaphore.acquire().await;
        let parked = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                // Never reached; aborted while parked.
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        parked.abort();
        let _ = parked.await;
        drop(blocker);

        // The permit must still be available to a new acquirer.
        tokio::time::timeout(Duration::from_secs(1), semaphore.acquire())
            .await
            .expect("permit was lost to a cancelled waiter");
    }

    #[tokio::test]
    async fn gather_returns_results_in_order() {
        let handles: Vec<_> = (0u64..5)
            .map(|i| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50 - i * 10)).await;
                    Ok(i)
                })
            })
            .collect();
        assert_eq!(
            gather_all_or_nothing(handles).await.unwrap(),
            vec![0, 1, 2, 3, 4]
        );
    }

    #[tokio::test]
    async fn gather_cancels_siblings_on_failure() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        handles.push(tokio::spawn(async {
            Err::<(), _>(Error::Internal("boom".to_string()))
        }));
        for _ in 0..3 {
            let finished = finished.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let start = std::time::Instant::now();
        let result = gather_all_or_nothing(handles).await;
        assert!(matches!(result, Err(Error::Internal(_))));
        // Siblings were aborted, not waited out.
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
