use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::tracker::{Notice, Pending};

/// Background thread reclaiming blocks whose guards were dropped.
///
/// It blocks on the notice channel and runs every delivered tracker through
/// the same removal gated release as an explicit one. A failure while
/// handling one tracker is logged and the loop goes on.
pub(crate) struct Collector {
    tx: Sender<Notice>,
    thread: JoinHandle<()>,
}

impl Collector {
    pub(crate) fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(rx))?;
        log!(debug, "collector {} started", name);
        Ok(Self { tx, thread })
    }

    #[inline]
    pub(crate) fn sender(&self) -> Sender<Notice> {
        self.tx.clone()
    }

    /// Stops after everything already queued has been handled.
    pub(crate) fn shutdown(self) {
        let _ = self.tx.send(Notice::Shutdown);
        drop(self.tx);
        if self.thread.join().is_err() {
            log!(error, "collector terminated abnormally");
        }
    }
}

/// Waits until every notice queued on `tx` before this call was handled.
/// Returns immediately if the collector is gone.
pub(crate) fn flush(tx: &Sender<Notice>) {
    let (ack, done) = crossbeam_channel::bounded(1);
    if tx.send(Notice::Flush(ack)).is_ok() {
        let _ = done.recv();
    }
}

fn run(rx: Receiver<Notice>) {
    while let Ok(notice) = rx.recv() {
        match notice {
            Notice::Collected(pending) => collect(pending),
            Notice::Flush(ack) => {
                let _ = ack.send(());
            }
            Notice::Shutdown => {
                // Whatever arrives after the drain is reclaimed when the
                // channel drops it.
                for notice in rx.try_iter() {
                    match notice {
                        Notice::Collected(pending) => collect(pending),
                        Notice::Flush(ack) => {
                            let _ = ack.send(());
                        }
                        Notice::Shutdown => {}
                    }
                }
                break;
            }
        }
    }
    log!(debug, "collector stopped");
}

fn collect(pending: Pending) {
    let tracker = pending.tracker().clone();
    match panic::catch_unwind(AssertUnwindSafe(|| pending.reclaim())) {
        Ok(true) => log!(
            info,
            "collected {:#x}, {} bytes on node {}",
            tracker.address(),
            tracker.size(),
            tracker.node()
        ),
        Ok(false) => log!(trace, "{:#x} was released before collection", tracker.address()),
        Err(_) => log!(error, "failed to collect {:?}", tracker),
    }
}
