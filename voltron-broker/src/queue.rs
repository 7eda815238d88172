// Stop queue
//
// Blocking requests park here until the debugger stops. The debugger thread
// drains the queue from its stop-hook; each waiter gets its response through
// a oneshot channel. The mutex only guards the list itself and is never held
// while a handler runs.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::protocol::{ApiError, ApiResponse};
use crate::requests::Request;

struct Parked {
    id: u64,
    request: Request,
    timeout: Duration,
    reply: oneshot::Sender<ApiResponse>,
}

struct QueueState {
    open: bool,
    next_id: u64,
    items: VecDeque<Parked>,
}

pub struct StopQueue {
    state: Mutex<QueueState>,
}

impl Default for StopQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl StopQueue {
    /// A closed queue; parking fails until [`StopQueue::open`]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                open: false,
                next_id: 0,
                items: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self) {
        self.lock().open = true;
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park `request` and wait for a drain to answer it.
    ///
    /// On timeout the request is withdrawn and `TimedOut` returned, unless a
    /// drain has already taken it, in which case the drain's response is
    /// awaited instead.
    pub async fn park(&self, request: Request, timeout: Duration) -> ApiResponse {
        let (reply, mut rx) = oneshot::channel();
        let id = {
            let mut state = self.lock();
            if !state.open {
                return ApiError::ServerNotRunning.into();
            }
            let id = state.next_id;
            state.next_id += 1;
            debug!("Queueing {} request #{}", request.kind().name(), id);
            state.items.push_back(Parked {
                id,
                request,
                timeout,
                reply,
            });
            id
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => ApiError::ServerNotRunning.into(),
            Err(_) => {
                let withdrawn = {
                    let mut state = self.lock();
                    match state.items.iter().position(|p| p.id == id) {
                        Some(pos) => state.items.remove(pos).is_some(),
                        None => false,
                    }
                };

                if withdrawn {
                    debug!("Request #{} timed out", id);
                    ApiError::TimedOut.into()
                } else {
                    // Already being dispatched
                    rx.await.unwrap_or_else(|_| ApiError::ServerNotRunning.into())
                }
            }
        }
    }

    /// Dispatch every parked request in FIFO order with `handle`, then
    /// signal all waiters. Returns how many requests were dispatched.
    pub fn drain<F>(&self, mut handle: F) -> usize
    where
        F: FnMut(&Request, Duration) -> ApiResponse,
    {
        let parked: Vec<Parked> = self.lock().items.drain(..).collect();
        if parked.is_empty() {
            return 0;
        }
        debug!("Dispatching {} queued request(s)", parked.len());

        let responses: Vec<ApiResponse> = parked
            .iter()
            .map(|p| {
                catch_unwind(AssertUnwindSafe(|| handle(&p.request, p.timeout))).unwrap_or_else(|_| {
                    error!("Handler for {} request panicked", p.request.kind().name());
                    ApiError::Generic("Handler panicked".to_string()).into()
                })
            })
            .collect();

        let count = parked.len();
        for (p, response) in parked.into_iter().zip(responses) {
            if p.reply.send(response).is_err() {
                debug!("Waiter for request #{} is gone, dropping response", p.id);
            }
        }
        count
    }

    /// Close the queue and answer everything in it with `ServerNotRunning`
    pub fn cancel(&self) -> usize {
        let parked: Vec<Parked> = {
            let mut state = self.lock();
            state.open = false;
            state.items.drain(..).collect()
        };
        Self::reject(parked)
    }

    /// Answer everything parked with `ServerNotRunning`. The queue stays
    /// open for new requests.
    pub fn cancel_pending(&self) -> usize {
        let parked: Vec<Parked> = self.lock().items.drain(..).collect();
        Self::reject(parked)
    }

    fn reject(parked: Vec<Parked>) -> usize {
        debug!("Cancelling {} queued request(s)", parked.len());
        let count = parked.len();
        for p in parked {
            p.reply.send(ApiError::ServerNotRunning.into()).ok();
        }
        count
    }
}
