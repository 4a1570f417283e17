use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type TurnTask = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Serializes generation tasks for one session.
///
/// Tasks run strictly in submission order; the next task starts only after
/// the previous one has returned. A failing task is logged and the queue
/// keeps advancing; the queue is a safety net, not a propagation path.
/// Cancelling the token stops the worker once the in-flight task (if any)
/// has finished.
pub struct TurnQueue {
    sender: mpsc::UnboundedSender<TurnTask>,
}

impl TurnQueue {
    pub fn new(session_id: String, token: CancellationToken) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<TurnTask>();
        crate::spawn(async move {
            loop {
                let task = select! {
                    _ = token.cancelled() => break,
                    task = receiver.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };
                if let Err(e) = task.await {
                    warn!(session_id, "turn task failed: {:#}", e);
                }
            }
            debug!(session_id, "turn queue stopped");
        });
        Self { sender }
    }

    pub fn enqueue<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.sender.send(Box::pin(task)).is_err() {
            debug!("turn queue closed, dropping task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order_without_overlap() {
        let queue = TurnQueue::new("s-1".to_string(), CancellationToken::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3u32 {
            let log = log.clone();
            queue.enqueue(async move {
                log.lock().unwrap().push((i, "start"));
                // A slow early task must still finish before a fast later one
                // starts.
                tokio::time::sleep(Duration::from_millis(30 - 10 * i as u64)).await;
                log.lock().unwrap().push((i, "end"));
                Ok(())
            });
        }

        wait_for(|| log.lock().unwrap().len() == 6).await;
        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec![
                (0, "start"),
                (0, "end"),
                (1, "start"),
                (1, "end"),
                (2, "start"),
                (2, "end"),
            ]
        );
    }

    #[tokio::test]
    async fn a_failing_task_does_not_stall_the_queue() {
        let queue = TurnQueue::new("s-2".to_string(), CancellationToken::new());
        let ran = Arc::new(Mutex::new(false));

        queue.enqueue(async { Err(anyhow!("scripted failure")) });
        let ran_ref = ran.clone();
        queue.enqueue(async move {
            *ran_ref.lock().unwrap() = true;
            Ok(())
        });

        wait_for(|| *ran.lock().unwrap()).await;
    }

    #[tokio::test]
    async fn cancelling_the_token_stops_the_worker() {
        let token = CancellationToken::new();
        let queue = TurnQueue::new("s-3".to_string(), token.clone());
        let count = Arc::new(Mutex::new(0u32));

        let count_ref = count.clone();
        queue.enqueue(async move {
            *count_ref.lock().unwrap() += 1;
            Ok(())
        });
        wait_for(|| *count.lock().unwrap() == 1).await;

        token.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let count_ref = count.clone();
        queue.enqueue(async move {
            *count_ref.lock().unwrap() += 1;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
