//! The queueing TCP listener: accepting is decoupled from serving. A single
//! producer task accepts as fast as the kernel hands connections over and
//! parks them in a bounded queue; the serving side pulls them out subject to
//! a concurrency ceiling. Overflow closes the oldest parked connection, and
//! parked connections time out if nobody gets to them.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::metrics::Metrics;
use crate::*;

/// Hard cap on the derived queue size.
const MAX_QUEUE_SIZE: usize = 50_000;
const DEFAULT_CONCURRENCY: usize = 256;
const DEFAULT_CONNECTION_BYTES: u64 = 50 * 1024;
const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ListenerOptions {
	/// Connections handed out and not yet closed. 0 derives from the memory
	/// budget.
	pub max_concurrency: usize,
	/// Parked connections. 0 derives from the concurrency.
	pub max_queue_size: usize,
	pub queue_timeout: Duration,
	/// Memory budget for connection handling, used when `max_concurrency`
	/// is unset.
	pub memory_limit: Option<u64>,
	/// Estimated memory per in-flight connection.
	pub connection_bytes: u64,
}

impl Default for ListenerOptions {
	fn default() -> Self {
		ListenerOptions {
			max_concurrency: 0,
			max_queue_size: 0,
			queue_timeout: DEFAULT_QUEUE_TIMEOUT,
			memory_limit: None,
			connection_bytes: DEFAULT_CONNECTION_BYTES,
		}
	}
}

impl ListenerOptions {
	/// Effective (concurrency, queue size) after applying the derivations.
	pub fn effective(&self) -> (usize, usize) {
		let concurrency = if self.max_concurrency > 0 {
			self.max_concurrency
		} else if let Some(mem) = self.memory_limit {
			(mem / self.connection_bytes.max(1)).max(1) as usize
		} else {
			DEFAULT_CONCURRENCY
		};
		let queue = if self.max_queue_size > 0 {
			self.max_queue_size
		} else {
			(concurrency * 10).min(MAX_QUEUE_SIZE)
		};
		(concurrency, queue)
	}
}

struct Queued {
	stream: TcpStream,
	peer: SocketAddr,
	accepted: Instant,
}

struct Inner {
	queue: VecDeque<Queued>,
	/// Terminal accept error, replayed to accept callers once the queue is
	/// drained.
	closed: Option<(io::ErrorKind, String)>,
	shutdown: bool,
}

struct Shared {
	inner: Mutex<Inner>,
	notify: Notify,
	inflight: AtomicUsize,
	max_concurrency: usize,
	queue_timeout: Duration,
	metrics: Arc<Metrics>,
}

impl Shared {
	fn release(&self) {
		let _ = self
			.inflight
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
				Some(v.saturating_sub(1))
			});
		self.notify.notify_waiters();
	}
}

pub struct QueueListener {
	shared: Arc<Shared>,
	local_addr: SocketAddr,
	producer: AbortHandle,
	scanner: AbortHandle,
}

impl QueueListener {
	/// Bind and wrap in one step.
	pub fn bind(
		addr: SocketAddr,
		options: ListenerOptions,
		metrics: Arc<Metrics>,
	) -> io::Result<QueueListener> {
		let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
		socket.set_reuse_address(true)?;
		socket.set_nonblocking(true)?;
		socket.bind(&addr.into())?;
		socket.listen(1024)?;
		QueueListener::wrap(TcpListener::from_std(socket.into())?, options, metrics)
	}

	/// Take over an already bound listener.
	pub fn wrap(
		listener: TcpListener,
		options: ListenerOptions,
		metrics: Arc<Metrics>,
	) -> io::Result<QueueListener> {
		let local_addr = listener.local_addr()?;
		let (max_concurrency, max_queue) = options.effective();
		let shared = Arc::new(Shared {
			inner: Mutex::new(Inner {
				queue: VecDeque::new(),
				closed: None,
				shutdown: false,
			}),
			notify: Notify::new(),
			inflight: AtomicUsize::new(0),
			max_concurrency,
			queue_timeout: options.queue_timeout,
			metrics,
		});
		let producer = tokio::spawn(produce(listener, shared.clone(), max_queue)).abort_handle();
		let scanner = tokio::spawn(scan_timeouts(shared.clone())).abort_handle();
		info!(
			%local_addr,
			max_concurrency,
			max_queue,
			"admission queue listening"
		);
		Ok(QueueListener {
			shared,
			local_addr,
			producer,
			scanner,
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Next admitted connection. Blocks while the queue is empty or the
	/// concurrency ceiling is reached; after a terminal accept error the
	/// queue drains first, then the error surfaces.
	pub async fn accept(&self) -> io::Result<Connection> {
		loop {
			let notified = self.shared.notify.notified();
			futures_util::pin_mut!(notified);
			notified.as_mut().enable();
			{
				let mut g = self.shared.inner.lock().unwrap();
				if g.shutdown {
					return Err(io::Error::new(
						io::ErrorKind::NotConnected,
						"listener shut down",
					));
				}
				if self.shared.inflight.load(Ordering::Acquire) < self.shared.max_concurrency {
					if let Some(q) = g.queue.pop_front() {
						self.shared.metrics.queue_depth.set(g.queue.len() as i64);
						self.shared.inflight.fetch_add(1, Ordering::AcqRel);
						return Ok(Connection {
							stream: q.stream,
							peer: q.peer,
							shared: self.shared.clone(),
							released: false,
						});
					}
				}
				if g.queue.is_empty() {
					if let Some((kind, msg)) = &g.closed {
						return Err(io::Error::new(*kind, msg.clone()));
					}
				}
			}
			notified.await;
		}
	}

	/// Close the socket and every parked connection. Connections already
	/// handed out stay with their owners.
	pub fn shutdown(&self) {
		self.producer.abort();
		self.scanner.abort();
		let mut g = self.shared.inner.lock().unwrap();
		g.shutdown = true;
		g.queue.clear();
		self.shared.metrics.queue_depth.set(0);
		self.shared.notify.notify_waiters();
	}

	#[cfg(test)]
	fn queue_len(&self) -> usize {
		self.shared.inner.lock().unwrap().queue.len()
	}
}

impl Drop for QueueListener {
	fn drop(&mut self) {
		self.shutdown();
	}
}

fn transient(e: &io::Error) -> bool {
	matches!(
		e.kind(),
		io::ErrorKind::ConnectionAborted
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::Interrupted
			| io::ErrorKind::WouldBlock
	) || matches!(e.raw_os_error(), Some(23) | Some(24)) // ENFILE / EMFILE
}

async fn produce(listener: TcpListener, shared: Arc<Shared>, max_queue: usize) {
	let mut backoff = Duration::from_millis(10);
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				backoff = Duration::from_millis(10);
				let mut g = shared.inner.lock().unwrap();
				if g.shutdown {
					return;
				}
				if g.queue.len() >= max_queue {
					// closing the oldest parked connection frees the slot;
					// the dial that waited longest is the least likely to
					// still be there
					g.queue.pop_front();
					shared.metrics.queue_evicted.inc();
				}
				g.queue.push_back(Queued {
					stream,
					peer,
					accepted: Instant::now(),
				});
				shared.metrics.queue_depth.set(g.queue.len() as i64);
				drop(g);
				shared.notify.notify_waiters();
			},
			Err(e) if transient(&e) => {
				warn!("transient accept error, backing off {backoff:?}: {e}");
				tokio::time::sleep(backoff).await;
				backoff = (backoff * 2).min(Duration::from_secs(1));
			},
			Err(e) => {
				error!("accept failed permanently: {e}");
				let mut g = shared.inner.lock().unwrap();
				g.closed = Some((e.kind(), e.to_string()));
				drop(g);
				shared.notify.notify_waiters();
				return;
			},
		}
	}
}

async fn scan_timeouts(shared: Arc<Shared>) {
	let period = (shared.queue_timeout / 4)
		.max(Duration::from_millis(10))
		.min(Duration::from_secs(1));
	let mut tick = tokio::time::interval(period);
	tick.tick().await;
	loop {
		tick.tick().await;
		let now = Instant::now();
		let mut g = shared.inner.lock().unwrap();
		// entries are in accept order, so expired ones form the head
		while let Some(front) = g.queue.front() {
			if now.duration_since(front.accepted) <= shared.queue_timeout {
				break;
			}
			g.queue.pop_front();
			shared.metrics.queue_timeouts.inc();
		}
		shared.metrics.queue_depth.set(g.queue.len() as i64);
	}
}

/// An admitted connection. Dropping it releases its concurrency slot; the
/// release is sticky, so a double close can never push the counter negative.
pub struct Connection {
	stream: TcpStream,
	peer: SocketAddr,
	shared: Arc<Shared>,
	released: bool,
}

impl Connection {
	pub fn peer_addr(&self) -> SocketAddr {
		self.peer
	}

	fn release(&mut self) {
		if !self.released {
			self.released = true;
			self.shared.release();
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.release();
	}
}

impl AsyncRead for Connection {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.stream).poll_read(cx, buf)
	}
}

impl AsyncWrite for Connection {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.stream).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.stream).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.stream).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	fn metrics() -> Arc<Metrics> {
		let mut registry = prometheus_client::registry::Registry::default();
		Metrics::new(&mut registry)
	}

	async fn listener(options: ListenerOptions) -> QueueListener {
		let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
		QueueListener::wrap(l, options, metrics()).unwrap()
	}

	async fn dial(addr: SocketAddr, tag: u8) -> TcpStream {
		let mut s = TcpStream::connect(addr).await.unwrap();
		s.write_all(&[tag]).await.unwrap();
		s
	}

	async fn read_tag(conn: &mut Connection) -> u8 {
		let mut b = [0u8; 1];
		conn.read_exact(&mut b).await.unwrap();
		b[0]
	}

	#[test]
	fn sizing_derivations() {
		let explicit = ListenerOptions {
			max_concurrency: 8,
			max_queue_size: 3,
			..Default::default()
		};
		assert_eq!(explicit.effective(), (8, 3));

		let from_memory = ListenerOptions {
			memory_limit: Some(1024 * 1024),
			connection_bytes: 1024,
			..Default::default()
		};
		assert_eq!(from_memory.effective(), (1024, 10_240));

		let clamped = ListenerOptions {
			max_concurrency: 100_000,
			..Default::default()
		};
		assert_eq!(clamped.effective().1, MAX_QUEUE_SIZE);
	}

	#[tokio::test]
	async fn queue_overflow_closes_the_oldest() {
		let l = listener(ListenerOptions {
			max_concurrency: 16,
			max_queue_size: 3,
			..Default::default()
		})
		.await;
		let addr = l.local_addr();

		let mut c0 = dial(addr, 0).await;
		let _c1 = dial(addr, 1).await;
		let _c2 = dial(addr, 2).await;
		let _c3 = dial(addr, 3).await;

		// the producer evicts the first dial to make room for the fourth
		tokio::time::timeout(Duration::from_secs(2), async {
			let mut b = [0u8; 1];
			assert_eq!(c0.read(&mut b).await.unwrap(), 0, "evicted dial sees EOF");
		})
		.await
		.unwrap();

		// the surviving three come out in order
		for expect in [1u8, 2, 3] {
			let mut conn = l.accept().await.unwrap();
			assert_eq!(read_tag(&mut conn).await, expect);
		}
	}

	#[tokio::test]
	async fn concurrency_ceiling_blocks_accept() {
		let l = Arc::new(
			listener(ListenerOptions {
				max_concurrency: 1,
				max_queue_size: 4,
				..Default::default()
			})
			.await,
		);
		let addr = l.local_addr();
		let _c0 = dial(addr, 0).await;
		let _c1 = dial(addr, 1).await;

		let mut first = l.accept().await.unwrap();
		assert_eq!(read_tag(&mut first).await, 0);

		// ceiling reached: the second accept must park
		let pending = tokio::time::timeout(Duration::from_millis(100), l.accept()).await;
		assert!(pending.is_err(), "accept should block at the ceiling");

		drop(first);
		let mut second = tokio::time::timeout(Duration::from_secs(2), l.accept())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(read_tag(&mut second).await, 1);
	}

	#[tokio::test]
	async fn queued_connections_time_out() {
		let l = listener(ListenerOptions {
			max_concurrency: 1,
			max_queue_size: 4,
			queue_timeout: Duration::from_millis(50),
			..Default::default()
		})
		.await;
		let mut c = dial(l.local_addr(), 0).await;

		tokio::time::timeout(Duration::from_secs(2), async {
			let mut b = [0u8; 1];
			assert_eq!(c.read(&mut b).await.unwrap(), 0, "timed out dial sees EOF");
		})
		.await
		.unwrap();
		assert_eq!(l.queue_len(), 0);
	}

	#[tokio::test]
	async fn shutdown_drains_and_fails_accept() {
		let l = listener(ListenerOptions {
			max_concurrency: 4,
			max_queue_size: 4,
			..Default::default()
		})
		.await;
		let addr = l.local_addr();
		let parked = dial(addr, 0).await;
		// an already-admitted connection stays with its owner
		let admitted = l.accept().await.unwrap();
		let mut parked2 = dial(addr, 1).await;
		tokio::time::sleep(Duration::from_millis(50)).await;

		l.shutdown();
		assert!(l.accept().await.is_err());
		let mut b = [0u8; 1];
		assert_eq!(parked2.read(&mut b).await.unwrap(), 0);
		drop(parked);
		drop(admitted);
	}

	#[tokio::test]
	async fn release_is_sticky() {
		let l = listener(ListenerOptions {
			max_concurrency: 2,
			max_queue_size: 4,
			..Default::default()
		})
		.await;
		let addr = l.local_addr();
		let _c = dial(addr, 0).await;
		let mut conn = l.accept().await.unwrap();
		assert_eq!(l.shared.inflight.load(Ordering::SeqCst), 1);
		conn.release();
		conn.release();
		drop(conn);
		assert_eq!(l.shared.inflight.load(Ordering::SeqCst), 0);
	}
}
