//! Rendezvous between browsers reading live job output and the workers
//! producing it.
//!
//! Both sides land on this process: the browser's `/live/...` request waits
//! in [`LiveHub::get`], the worker's `/box-livepoll` long-poll waits in
//! [`LiveHub::poll`], and the worker's `/box-livesend` upload is spliced to
//! the reader by [`LiveHub::send`]. Everything is in memory; if nothing
//! matches, the writer discards and the reader times out and retries.
//!
//! Invariant: every subscriber has a paired entry in `pending` for the same
//! `(worker, job)` key, and removals always happen in pairs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep_until, Instant};

use corral_core::Job;

type Key = (String, Job);

#[derive(Default)]
struct Inner {
    /// Outstanding reader interest per worker, in arrival order.
    pending: HashMap<String, Vec<Job>>,
    /// Waiting readers per (worker, job), in arrival order. Each receives
    /// the byte channel carrying the live output.
    subscribers: HashMap<Key, Vec<oneshot::Sender<mpsc::Receiver<Bytes>>>>,
}

#[derive(Default)]
pub struct LiveHub {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl LiveHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reader side: register interest in a job's live output and wait up to
    /// `wait` for the worker to deliver it.
    pub async fn get(&self, id: &str, job: &Job, wait: Duration) -> Option<mpsc::Receiver<Bytes>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().expect("live hub mutex poisoned");
            inner
                .subscribers
                .entry((id.to_string(), job.clone()))
                .or_default()
                .push(tx);
            inner.pending.entry(id.to_string()).or_default().push(job.clone());
        }
        self.changed.notify_waiters();

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(stream)) => Some(stream),
            _ => {
                self.withdraw(id, job);
                None
            }
        }
    }

    /// Remove one dead subscriber (a reader that gave up) and its paired
    /// pending entry. If the subscriber was already consumed by `send`,
    /// there is nothing to remove.
    fn withdraw(&self, id: &str, job: &Job) {
        let mut inner = self.inner.lock().expect("live hub mutex poisoned");
        let key = (id.to_string(), job.clone());
        let Some(subs) = inner.subscribers.get_mut(&key) else {
            return;
        };
        let Some(i) = subs.iter().position(|tx| tx.is_closed()) else {
            return;
        };
        subs.remove(i);
        if subs.is_empty() {
            inner.subscribers.remove(&key);
        }
        remove_one_pending(&mut inner.pending, id, job);
    }

    /// Writer side: wait until some reader wants output from this worker.
    /// Returns the head of the queue without consuming it, or None at the
    /// deadline.
    pub async fn poll(&self, id: &str, wait: Duration) -> Option<Job> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            {
                let inner = self.inner.lock().expect("live hub mutex poisoned");
                if let Some(job) = inner.pending.get(id).and_then(|jobs| jobs.first()) {
                    return Some(job.clone());
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = sleep_until(deadline) => return None,
            }
        }
    }

    /// Writer side: splice the output stream to the first waiting reader.
    /// Returns the sending half for the writer to pump into, or None when
    /// no reader is waiting (the writer discards its output). The pump
    /// learns the reader hung up when sends start failing.
    pub fn send(&self, id: &str, job: &Job) -> Option<mpsc::Sender<Bytes>> {
        let mut inner = self.inner.lock().expect("live hub mutex poisoned");
        let key = (id.to_string(), job.clone());
        let subs = inner.subscribers.get_mut(&key)?;
        if subs.is_empty() {
            return None;
        }
        let sub = subs.remove(0);
        if subs.is_empty() {
            inner.subscribers.remove(&key);
        }
        remove_one_pending(&mut inner.pending, id, job);
        drop(inner);

        let (tx, rx) = mpsc::channel(8);
        match sub.send(rx) {
            Ok(()) => Some(tx),
            // the reader gave up between our lock release and the delivery
            Err(_) => None,
        }
    }
}

fn remove_one_pending(pending: &mut HashMap<String, Vec<Job>>, id: &str, job: &Job) {
    if let Some(jobs) = pending.get_mut(id) {
        if let Some(i) = jobs.iter().position(|j| j == job) {
            jobs.remove(i);
        }
        if jobs.is_empty() {
            pending.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn job(name: &str) -> Job {
        Job {
            sha: "abc".into(),
            dir: "/".into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn get_times_out_without_a_writer() {
        let hub = LiveHub::new();
        let got = hub.get("w1", &job("t"), Duration::from_millis(10)).await;
        assert!(got.is_none());
        // interest was withdrawn with the reader
        assert!(hub.inner.lock().unwrap().pending.is_empty());
        assert!(hub.inner.lock().unwrap().subscribers.is_empty());
    }

    #[tokio::test]
    async fn poll_times_out_without_a_reader() {
        let hub = LiveHub::new();
        assert!(hub.poll("w1", Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn send_without_reader_is_discarded() {
        let hub = LiveHub::new();
        assert!(hub.send("w1", &job("t")).is_none());
    }

    #[tokio::test]
    async fn reader_and_writer_splice() {
        let hub = Arc::new(LiveHub::new());
        let j = job("t");

        let reader = {
            let hub = hub.clone();
            let j = j.clone();
            tokio::spawn(async move { hub.get("w1", &j, Duration::from_secs(5)).await })
        };

        // the writer's long-poll sees the reader's interest
        let polled = hub.poll("w1", Duration::from_secs(5)).await;
        assert_eq!(polled, Some(j.clone()));

        let tx = hub.send("w1", &j).expect("a reader is waiting");
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let mut rx = reader.await.unwrap().expect("stream delivered");
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello world");

        // both maps drained by the delivery
        assert!(hub.inner.lock().unwrap().pending.is_empty());
        assert!(hub.inner.lock().unwrap().subscribers.is_empty());
    }

    #[tokio::test]
    async fn writer_pump_stops_when_reader_hangs_up() {
        let hub = Arc::new(LiveHub::new());
        let j = job("t");

        let reader = {
            let hub = hub.clone();
            let j = j.clone();
            tokio::spawn(async move { hub.get("w1", &j, Duration::from_secs(5)).await })
        };
        hub.poll("w1", Duration::from_secs(5)).await;

        let tx = hub.send("w1", &j).unwrap();
        let rx = reader.await.unwrap().unwrap();
        drop(rx); // reader closes the stream

        // the channel reports closure so the writer stops producing
        tx.closed().await;
        assert!(tx.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn two_readers_are_served_in_order() {
        let hub = Arc::new(LiveHub::new());
        let j = job("t");

        let r1 = {
            let (hub, j) = (hub.clone(), j.clone());
            tokio::spawn(async move { hub.get("w1", &j, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let r2 = {
            let (hub, j) = (hub.clone(), j.clone());
            tokio::spawn(async move { hub.get("w1", &j, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // one send satisfies exactly one reader; the second still waits
        let tx1 = hub.send("w1", &j).unwrap();
        drop(tx1);
        let _first = r1.await.unwrap().expect("first reader served");
        assert_eq!(hub.poll("w1", Duration::from_millis(50)).await, Some(j.clone()));

        let tx2 = hub.send("w1", &j).unwrap();
        drop(tx2);
        let _second = r2.await.unwrap().expect("second reader served");
        assert!(hub.send("w1", &j).is_none());
    }
}
