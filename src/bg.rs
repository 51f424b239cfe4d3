//! Background execution of application callbacks.
//!
//! Handlers and continuations registered as background run on worker
//! threads. Work items carry owned data; workers never touch engine state
//! directly. Handler results return through a completion mailbox the event
//! loop drains, so the engine stays single-writer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::alloc::HugeAllocator;
use crate::buffer::MsgBuffer;
use crate::registry::ReqFunc;
use crate::rpc::{ReqData, ReqHandle, RespChoice};
use crate::session::Continuation;

/// Owned request or response payload travelling to a worker.
pub(crate) enum BgData {
    /// Copied out of the receive ring (small messages).
    Copied(Vec<u8>),
    /// A reassembled dynamic buffer, moved from the slot (large messages).
    Owned(MsgBuffer),
}

impl BgData {
    fn as_slice(&self) -> &[u8] {
        match self {
            BgData::Copied(v) => v,
            BgData::Owned(m) => m.data(),
        }
    }
}

/// A unit of background work.
pub(crate) enum BgWork {
    /// Run a background-flagged request handler.
    Request {
        session_num: u16,
        sslot_idx: usize,
        req_num: u64,
        req_type: u8,
        data: BgData,
        /// The slot's preallocated response buffer, moved out for the
        /// handler to fill; travels back in the completion.
        pre_resp: MsgBuffer,
        func: Arc<ReqFunc>,
        max_data_per_pkt: usize,
    },
    /// Run a background-flagged continuation.
    Continuation {
        cont: Continuation,
        req_msgbuf: MsgBuffer,
        resp: BgData,
        tag: u64,
    },
}

/// A finished background handler: the response choice the handler made,
/// applied by the event loop as an ordinary `enqueue_response`.
pub(crate) struct BgComplete {
    pub session_num: u16,
    pub sslot_idx: usize,
    pub req_num: u64,
    pub pre_resp: MsgBuffer,
    pub choice: Option<RespChoice>,
}

/// Lock-protected submission FIFO. Producers (the event loop) never wait.
pub(crate) struct BgQueue {
    deque: Mutex<VecDeque<BgWork>>,
    condvar: Condvar,
}

impl BgQueue {
    fn new() -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
        }
    }

    pub fn push(&self, work: BgWork) {
        self.deque.lock().push_back(work);
        self.condvar.notify_one();
    }

    fn pop_wait(&self, timeout: Duration) -> Option<BgWork> {
        let mut deque = self.deque.lock();
        if deque.is_empty() {
            self.condvar.wait_for(&mut deque, timeout);
        }
        deque.pop_front()
    }
}

/// Worker threads executing background callbacks.
pub(crate) struct BgWorkerPool {
    pub queue: Arc<BgQueue>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl BgWorkerPool {
    pub fn new(
        num_threads: usize,
        alloc: Arc<Mutex<HugeAllocator>>,
        completions: Arc<Mutex<VecDeque<BgComplete>>>,
    ) -> Self {
        let queue = Arc::new(BgQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let threads = (0..num_threads)
            .map(|i| {
                let queue = queue.clone();
                let shutdown = shutdown.clone();
                let alloc = alloc.clone();
                let completions = completions.clone();
                std::thread::Builder::new()
                    .name(format!("fabrpc-bg-{i}"))
                    .spawn(move || {
                        debug!(worker = i, "background worker started");
                        while !shutdown.load(Ordering::Acquire) {
                            if let Some(work) = queue.pop_wait(Duration::from_millis(10)) {
                                run_work(work, &alloc, &completions);
                            }
                        }
                    })
                    .expect("failed to spawn background worker")
            })
            .collect();

        Self {
            queue,
            shutdown,
            threads,
        }
    }
}

impl Drop for BgWorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn run_work(
    work: BgWork,
    alloc: &Arc<Mutex<HugeAllocator>>,
    completions: &Arc<Mutex<VecDeque<BgComplete>>>,
) {
    match work {
        BgWork::Request {
            session_num,
            sslot_idx,
            req_num,
            req_type,
            data,
            pre_resp,
            func,
            max_data_per_pkt,
        } => {
            let req_data = match data {
                BgData::Copied(v) => ReqData::Owned(v),
                BgData::Owned(m) => ReqData::OwnedBuf(m),
            };
            let mut handle = ReqHandle::new(
                req_type,
                req_data,
                pre_resp,
                max_data_per_pkt,
                alloc.clone(),
            );
            (func.func)(&mut handle);
            let (pre_resp, choice, leftover) = handle.into_parts();
            if let Some(mut m) = leftover {
                if let Some(raw) = m.take_raw() {
                    alloc.lock().free(raw);
                }
            }
            completions.lock().push_back(BgComplete {
                session_num,
                sslot_idx,
                req_num,
                pre_resp,
                choice,
            });
        }
        BgWork::Continuation {
            cont,
            req_msgbuf,
            resp,
            tag,
        } => {
            cont(req_msgbuf, resp.as_slice(), tag);
            if let BgData::Owned(mut m) = resp {
                if let Some(raw) = m.take_raw() {
                    alloc.lock().free(raw);
                }
            }
        }
    }
}
