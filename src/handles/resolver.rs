//! Watchdog-protected handle-name resolver.
//!
//! Naming an arbitrary kernel handle can block forever (a synchronous named
//! pipe with no client never completes its query). The resolver therefore
//! runs the blocking query on a dedicated worker that owns a growable byte
//! buffer, fed through a channel of `(handle, reply)` messages. The caller
//! waits on the reply with a hard deadline; on timeout the worker is
//! abandoned where it hangs and a fresh one is spawned for the next call.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;

/// Outcome of one blocking name-query attempt against the worker's buffer.
pub enum QueryStatus {
    /// The query returned a final status; the name, when present, has been
    /// decoded out of the buffer.
    Complete(Option<String>),
    /// Short-buffer status: grow to at least this many bytes and retry.
    Grow(usize),
}

/// The blocking query primitive. Production wires this to the kernel
/// object-name query; tests substitute closures, including ones that never
/// return.
pub type QueryFn = dyn Fn(u64, &mut Vec<u8>) -> QueryStatus + Send + Sync;

struct Request {
    handle: u64,
    reply: channel::Sender<Option<String>>,
}

/// The resolver actor handle. Callers are serialized by construction: one
/// resolver, one in-flight message.
pub struct NameResolver {
    query: Arc<QueryFn>,
    timeout: Duration,
    mailbox: Option<channel::Sender<Request>>,
}

impl NameResolver {
    #[must_use]
    pub fn new(query: Arc<QueryFn>, timeout: Duration) -> Self {
        Self {
            query,
            timeout,
            mailbox: None,
        }
    }

    /// Resolve the name of a handle already duplicated into this process.
    ///
    /// Returns `None` on query failure or when the deadline expires. After
    /// a deadline expiry the hung worker is dropped; the next call gets a
    /// fresh one.
    pub fn resolve(&mut self, handle: u64) -> Option<String> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        let request = Request {
            handle,
            reply: reply_tx,
        };

        let mailbox = self
            .mailbox
            .get_or_insert_with(|| spawn_worker(Arc::clone(&self.query)));
        if let Err(channel::SendError(request)) = mailbox.send(request) {
            // The worker exited (previous run abandoned it mid-shutdown);
            // respawn once and retry.
            let mailbox = self
                .mailbox
                .insert(spawn_worker(Arc::clone(&self.query)));
            if mailbox.send(request).is_err() {
                return None;
            }
        }

        match reply_rx.recv_timeout(self.timeout) {
            Ok(name) => name,
            Err(_) => {
                // The worker is parked on a kernel call that may never
                // return. Abandon it; if the call ever completes the worker
                // observes its closed mailbox and exits.
                self.mailbox = None;
                None
            }
        }
    }
}

fn spawn_worker(query: Arc<QueryFn>) -> channel::Sender<Request> {
    let (tx, rx) = channel::unbounded::<Request>();
    let spawned = thread::Builder::new()
        .name("dg-handle-name".to_string())
        .spawn(move || {
            // The buffer outlives individual requests; short-buffer growth
            // is retained for the rest of the worker's life.
            let mut buf: Vec<u8> = vec![0; 0x200];
            while let Ok(request) = rx.recv() {
                let name = loop {
                    match (*query)(request.handle, &mut buf) {
                        QueryStatus::Complete(name) => break name,
                        QueryStatus::Grow(needed) => buf.resize(needed + 0x100, 0),
                    }
                };
                let _ = request.reply.send(name);
            }
        });
    if spawned.is_err() {
        eprintln!("[DG-HANDLE] failed to spawn name-resolver worker");
    }
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn resolves_a_name() {
        let query: Arc<QueryFn> = Arc::new(|handle, _buf| {
            QueryStatus::Complete(Some(format!("\\Device\\Volume{handle}")))
        });
        let mut resolver = NameResolver::new(query, Duration::from_millis(250));
        assert_eq!(resolver.resolve(3).as_deref(), Some("\\Device\\Volume3"));
    }

    #[test]
    fn grows_the_buffer_until_the_query_fits() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_query = Arc::clone(&attempts);
        let query: Arc<QueryFn> = Arc::new(move |_handle, buf| {
            attempts_in_query.fetch_add(1, Ordering::SeqCst);
            if buf.len() < 0x1000 {
                QueryStatus::Grow(0x1000)
            } else {
                QueryStatus::Complete(Some(format!("len={}", buf.len())))
            }
        });
        let mut resolver = NameResolver::new(query, Duration::from_millis(250));
        let name = resolver.resolve(1).unwrap();
        // 0x1000 + 0x100 headroom.
        assert_eq!(name, "len=4352");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn query_failure_yields_none() {
        let query: Arc<QueryFn> = Arc::new(|_, _| QueryStatus::Complete(None));
        let mut resolver = NameResolver::new(query, Duration::from_millis(250));
        assert!(resolver.resolve(9).is_none());
    }

    #[test]
    fn hung_query_times_out_and_worker_is_respawned() {
        // Handle 1 hangs forever; handle 2 answers immediately.
        let query: Arc<QueryFn> = Arc::new(|handle, _buf| {
            if handle == 1 {
                thread::sleep(Duration::from_secs(3600));
            }
            QueryStatus::Complete(Some("pipe".to_string()))
        });
        let mut resolver = NameResolver::new(query, Duration::from_millis(50));

        let started = Instant::now();
        assert!(resolver.resolve(1).is_none());
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "timeout must not wait for the hung query"
        );

        // The abandoned worker must not serialize the next call.
        assert_eq!(resolver.resolve(2).as_deref(), Some("pipe"));
    }

    #[test]
    fn buffer_growth_persists_across_requests() {
        let query: Arc<QueryFn> = Arc::new(|_handle, buf| {
            if buf.len() < 0x800 {
                QueryStatus::Grow(0x800)
            } else {
                QueryStatus::Complete(Some(format!("len={}", buf.len())))
            }
        });
        let mut resolver = NameResolver::new(query, Duration::from_millis(250));
        let first = resolver.resolve(1).unwrap();
        let second = resolver.resolve(2).unwrap();
        // Second request starts with the already-grown buffer.
        assert_eq!(first, second);
    }
}
