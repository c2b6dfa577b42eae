//! TCP server for the ledger protocol.
//!
//! Accepts incoming connections and spawns one session task per connection.
//! Sessions share the ledger through a [`Context`] built at startup.

use crate::ledger::LedgerStore;
use crate::session::handle_connection;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, debug_span, error, info, trace, Instrument};

/// Listen backlog for the accept queue
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept so fd exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by the acceptor and every session
#[derive(Clone)]
pub struct Context {
    pub store: Arc<LedgerStore>,
    /// How long a session may wait for its next line
    pub idle_timeout: Duration,
}

impl Context {
    pub fn new(store: LedgerStore, idle_timeout: Duration) -> Self {
        Self {
            store: Arc::new(store),
            idle_timeout,
        }
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    context: Context,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(addr: &str, context: Context) -> io::Result<Self> {
        let addr = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("could not resolve listen address '{addr}'"),
            )
        })?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(address = %listener.local_addr()?, "Server listening");

        Ok(Server { listener, context })
    }

    /// Get the bound address for testing
    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` turns true, then wait for the
    /// open sessions to finish on their own.
    ///
    /// Sessions are never interrupted; each ends at end of stream, on error,
    /// or when its idle timeout expires. The ledger connection is closed when
    /// the last handle to it is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Server { listener, context } = self;
        let mut sessions = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender can never flip the flag again
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Session task failed");
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "New connection");

                        let context = context.clone();
                        sessions.spawn(
                            async move {
                                if let Err(e) = handle_connection(stream, context).await {
                                    debug!(error = %e, "Connection error");
                                }
                                trace!("Connection closed");
                            }
                            .instrument(debug_span!("session", %peer)),
                        );
                    }
                    Err(e) => {
                        let stopping = *shutdown.borrow();
                        if accept_failed(&e, stopping).await {
                            break;
                        }
                    }
                }
            }
        }

        drop(listener);
        info!(
            open_sessions = sessions.len(),
            "Stopped accepting connections"
        );

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Session task failed");
            }
        }
        drop(context);
        info!("All sessions finished");
    }
}

/// Handle an accept error. Returns true when the loop should stop.
async fn accept_failed(e: &io::Error, shutting_down: bool) -> bool {
    if shutting_down {
        return true;
    }
    error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
    false
}

/// Create a non-blocking listener with SO_REUSEADDR so restarts can rebind
/// while old connections sit in TIME_WAIT.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::HEALTH_CHECK_RESPONSE;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct TestServer {
        addr: SocketAddr,
        context: Context,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<()>,
    }

    async fn start(idle_timeout: Duration) -> TestServer {
        let context = Context::new(LedgerStore::in_memory().unwrap(), idle_timeout);
        let server = Server::bind("127.0.0.1:0", context.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));

        TestServer {
            addr,
            context,
            shutdown,
            handle,
        }
    }

    struct Client {
        reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Client {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn request(&mut self, line: &str) -> String {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
            let mut reply = String::new();
            timeout(WAIT, self.reader.read_line(&mut reply))
                .await
                .unwrap()
                .unwrap();
            reply.trim_end().to_string()
        }
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let server = start(Duration::from_secs(30)).await;
        let mut client = Client::connect(server.addr).await;

        assert_eq!(client.request("GET_TRANSACTIONS").await, "OK|NO_HAY");
        assert_eq!(
            client.request("ADD_TRANSACTION|2024-01-01|Ingreso|100.5").await,
            "OK|Transaction added successfully"
        );
        assert_eq!(
            client.request("ADD_TRANSACTION|2024-03-01|gasto|20").await,
            "OK|Transaction added successfully"
        );
        assert_eq!(client.request("GET_BALANCE").await, "OK|100.50|20.00|80.50");
        assert_eq!(
            client.request("GET_TRANSACTIONS").await,
            "OK|2|2024-03-01|Gasto|20.00;1|2024-01-01|Ingreso|100.50;"
        );
        assert_eq!(client.request("WITHDRAW|5").await, "ERROR|unrecognized command");
    }

    #[tokio::test]
    async fn test_health_check_over_tcp() {
        let server = start(Duration::from_secs(30)).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: ledger\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        timeout(WAIT, stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, HEALTH_CHECK_RESPONSE);
        assert_eq!(server.context.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_last_line_without_newline() {
        let server = start(Duration::from_secs(30)).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        stream.write_all(b"GET_BALANCE").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = String::new();
        timeout(WAIT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, "OK|0.00|0.00|0.00\n");
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let server = start(Duration::from_millis(100)).await;
        let mut idle = TcpStream::connect(server.addr).await.unwrap();
        let mut active = Client::connect(server.addr).await;

        let mut buf = [0u8; 16];
        let n = timeout(WAIT, idle.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        // A fresh session is unaffected by the other one timing out
        let mut fresh = Client::connect(server.addr).await;
        assert_eq!(fresh.request("GET_BALANCE").await, "OK|0.00|0.00|0.00");

        // The second client also idled out in the meantime
        let mut rest = String::new();
        let n = timeout(WAIT, active.reader.read_line(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_concurrent_sessions() {
        let server = start(Duration::from_secs(30)).await;

        let clients: Vec<_> = (0..10)
            .map(|i| {
                let addr = server.addr;
                tokio::spawn(async move {
                    let mut client = Client::connect(addr).await;
                    for j in 0..5 {
                        let kind = if (i + j) % 2 == 0 { "Ingreso" } else { "Gasto" };
                        let reply = client
                            .request(&format!("ADD_TRANSACTION|2024-01-{:02}|{kind}|10", j + 1))
                            .await;
                        assert_eq!(reply, "OK|Transaction added successfully");
                    }
                })
            })
            .collect();

        for client in clients {
            client.await.unwrap();
        }

        assert_eq!(server.context.store.count().unwrap(), 50);
        let mut client = Client::connect(server.addr).await;
        assert_eq!(client.request("GET_BALANCE").await, "OK|250.00|250.00|0.00");
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_but_keeps_sessions() {
        let server = start(Duration::from_secs(30)).await;
        let mut in_flight = Client::connect(server.addr).await;
        assert_eq!(in_flight.request("GET_BALANCE").await, "OK|0.00|0.00|0.00");

        server.shutdown.send(true).unwrap();

        // The open session keeps being served after the signal
        assert_eq!(
            in_flight.request("ADD_TRANSACTION|2024-01-01|Ingreso|5").await,
            "OK|Transaction added successfully"
        );
        assert!(!server.handle.is_finished());

        // run() returns once the last session ends
        drop(in_flight);
        timeout(WAIT, server.handle).await.unwrap().unwrap();

        assert!(TcpStream::connect(server.addr).await.is_err());
        assert_eq!(server.context.store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_accept_failure_backs_off() {
        let e = io::Error::new(io::ErrorKind::Other, "too many open files");

        let start = tokio::time::Instant::now();
        assert!(!accept_failed(&e, false).await);
        assert!(start.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_accept_failure_during_shutdown_stops() {
        let e = io::Error::new(io::ErrorKind::Other, "listener closed");

        let start = tokio::time::Instant::now();
        assert!(accept_failed(&e, true).await);
        assert!(start.elapsed() < ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_shutdown_without_sessions() {
        let server = start(Duration::from_secs(30)).await;

        server.shutdown.send(true).unwrap();
        timeout(WAIT, server.handle).await.unwrap().unwrap();

        assert!(TcpStream::connect(server.addr).await.is_err());
    }
}
