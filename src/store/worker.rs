//! Background flush worker
//!
//! Moves the flush cycle off committing threads: requests are queued
//! over a channel, the worker runs the same flush path with the same
//! lock discipline, and waiters are signaled back over per-request
//! acknowledgement channels. Errors from fire-and-forget flushes are
//! parked on the store and surfaced by the next blocking flush.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::paging::PagingResult;

use super::tx_page_file::StoreInner;

pub(crate) enum WorkerMessage {
    /// Run a flush cycle; acknowledge on the channel when present.
    Flush(Option<mpsc::Sender<PagingResult<()>>>),
    Shutdown,
}

pub(crate) struct FlushWorker {
    sender: mpsc::Sender<WorkerMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FlushWorker {
    pub(crate) fn spawn(store: Arc<StoreInner>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("pagedb-flush".into())
            .spawn(move || Self::run(store, receiver))
            .expect("failed to spawn flush worker");
        Self {
            sender,
            handle: Some(handle),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<WorkerMessage> {
        self.sender.clone()
    }

    fn run(store: Arc<StoreInner>, receiver: mpsc::Receiver<WorkerMessage>) {
        while let Ok(message) = receiver.recv() {
            match message {
                WorkerMessage::Flush(ack) => {
                    let result = store.flush_cycle();
                    match ack {
                        Some(ack) => {
                            let _ = ack.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                store.housekeeping.lock().unwrap().deferred_error = Some(e);
                            }
                        }
                    }
                }
                WorkerMessage::Shutdown => break,
            }
        }
    }

    pub(crate) fn shutdown(mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
