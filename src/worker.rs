//! Long-running event worker for the Backend Protocol.
//!
//! A `Worker` keeps a persistent connection to the backend endpoint and
//! receives events pushed by the server. It follows the Majordomo reliability
//! pattern: it announces itself with `RD`, proves it is alive with periodic
//! `HB` frames, counts read cycles in which the server stayed silent, and
//! re-establishes the session (with a fresh identity) once the server has
//! been silent for `liveness` cycles in a row.
//!
//! ```text
//!            listen()                 packet
//!  Stopped ───────────► Connecting ─────────► Connected ◄──┐
//!     ▲                     ▲                    │         │ packet
//!     │ stop() / fatal      │ delay              │ timeout │
//!     │                     └──── Disconnected ◄─┘ x liveness
//! ```
//!
//! Events and server errors are handed to a user supplied [`Handler`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::WorkerConfig;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result, ServerError};
use crate::protocol::{Command, Role};

// =============================================================================
// Handler Trait
// =============================================================================

/// Callbacks invoked by a running [`Worker`].
///
/// Every method has a default, so implementors only override what they
/// need. Failures returned from `on_message` and `on_error` are passed to
/// `on_exception`; the default `on_exception` returns the error again,
/// which stops the worker.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// #[async_trait]
/// impl Handler for Printer {
///     async fn on_message(&mut self, event: &str, data: Value) -> anyhow::Result<()> {
///         println!("{}: {}", event, data);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send {
    /// An event was transferred to this worker.
    async fn on_message(&mut self, _event: &str, _data: Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// The server reported a non-fatal error.
    async fn on_error(&mut self, _error: ServerError) -> anyhow::Result<()> {
        Ok(())
    }

    /// A callback (or the decoding of its input) failed.
    ///
    /// Return `Ok(())` to keep the worker running.
    async fn on_exception(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        Err(error)
    }
}

// =============================================================================
// Worker
// =============================================================================

/// What the loop should do after handling a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Reconnect,
}

/// Loop-local connection state. Never shared outside `listen`.
struct Session {
    /// `None` while disconnected.
    conn: Option<Connection>,
    liveness: u32,
    heartbeat_at: Instant,
}

/// Backend Protocol worker.
///
/// `listen` runs the receive loop on the calling task; `stop` and
/// `is_alive` may be called from any other task or thread. Shutdown is
/// cooperative: it takes effect at the start of the next loop iteration,
/// so an in-flight read finishes (or times out) first.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use kosmonaut::Worker;
///
/// let worker = Arc::new(Worker::new("wr://token@127.0.0.1:8081/vhost")?);
/// let handle = worker.spawn(MyHandler::default());
///
/// // ... later
/// worker.stop();
/// handle.await??;
/// ```
pub struct Worker {
    endpoint: Endpoint,
    config: WorkerConfig,
    /// Resolved once, on first connect.
    addr: OnceCell<SocketAddr>,
    /// The only state shared with other tasks.
    alive: Mutex<bool>,
    span: Span,
}

impl Worker {
    /// Create a worker for the endpoint URL with default settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEndpoint` if the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, WorkerConfig::default())
    }

    pub fn with_config(url: &str, config: WorkerConfig) -> Result<Self> {
        Ok(Self::from_endpoint(Endpoint::parse(url)?, config))
    }

    pub fn from_endpoint(endpoint: Endpoint, config: WorkerConfig) -> Self {
        Self {
            endpoint,
            config,
            addr: OnceCell::new(),
            alive: Mutex::new(false),
            span: Span::none(),
        }
    }

    /// Emit this worker's log events inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Ask the receive loop to stop.
    pub fn stop(&self) {
        *self.alive_flag() = false;
    }

    /// Whether the receive loop is running (and has not been asked to stop).
    pub fn is_alive(&self) -> bool {
        *self.alive_flag()
    }

    fn alive_flag(&self) -> MutexGuard<'_, bool> {
        self.alive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the receive loop on a new tokio task with an owned handler.
    ///
    /// The worker is alive as soon as this returns, so a `stop` issued
    /// before the task is first polled still ends it.
    pub fn spawn<H>(self: &Arc<Self>, mut handler: H) -> JoinHandle<Result<()>>
    where
        H: Handler + 'static,
    {
        *self.alive_flag() = true;

        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.serve(&mut handler).await })
    }

    /// Connect and process events until [`Worker::stop`] is called.
    ///
    /// Transport failures never end the loop: the worker reconnects after
    /// `liveness` silent read cycles, on a server `QT`, or on a malformed
    /// packet, and keeps retrying if the endpoint is unreachable.
    ///
    /// # Errors
    ///
    /// - `Error::Server(ServerError::Unauthorized)` when the server rejects
    ///   the worker's credentials
    /// - `Error::Handler` when a callback fails and `on_exception` does not
    ///   absorb the failure
    pub async fn listen<H>(&self, handler: &mut H) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        *self.alive_flag() = true;
        self.serve(handler).await
    }

    /// Run the loop for an already-raised alive flag and lower it on exit.
    async fn serve<H>(&self, handler: &mut H) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        let result = self.run(handler).instrument(self.span.clone()).await;

        *self.alive_flag() = false;
        result
    }

    async fn run<H>(&self, handler: &mut H) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        let mut session = Session {
            conn: None,
            liveness: self.config.liveness(),
            heartbeat_at: Instant::now() + self.config.heartbeat_interval(),
        };
        if self.is_alive() {
            session.conn = self.connect().await;
        }

        loop {
            if !self.is_alive() {
                if let Some(mut conn) = session.conn.take() {
                    Self::send(&mut conn, Command::Quit, false).await;
                    conn.close().await;
                }
                info!(endpoint = %self.endpoint, "Worker stopped");
                return Ok(());
            }

            let Some(conn) = session.conn.as_mut() else {
                // Last connect attempt failed, keep trying
                self.reconnect(&mut session).await;
                continue;
            };

            match conn.read_packet_within(self.config.read_timeout()).await {
                Ok(packet) => {
                    session.liveness = self.config.liveness();
                    debug!("Worker/RECV : {:?}", packet);

                    match self.dispatch(packet, handler).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Reconnect) => {
                            self.reconnect(&mut session).await;
                            continue;
                        }
                        Err(e) => {
                            if let Some(mut conn) = session.conn.take() {
                                conn.close().await;
                            }
                            return Err(e);
                        }
                    }
                }
                Err(e @ Error::Connection(_)) => {
                    session.liveness = session.liveness.saturating_sub(1);
                    debug!(liveness = session.liveness, "Worker read failed: {}", e);

                    if session.liveness == 0 {
                        warn!("Worker/RECONNECT : {}", e);
                        self.reconnect(&mut session).await;
                        continue;
                    }
                }
                Err(e) => {
                    warn!("Worker/RECONNECT : {}", e);
                    self.reconnect(&mut session).await;
                    continue;
                }
            }

            self.heartbeat(&mut session).await;
        }
    }

    /// Open a new connection and announce readiness.
    ///
    /// Failures are logged and reported as `None`; the loop retries.
    async fn connect(&self) -> Option<Connection> {
        let attempt = async {
            let addr = *self
                .addr
                .get_or_try_init(|| self.endpoint.resolve())
                .await?;
            let mut conn = Connection::open(
                addr,
                Role::Dealer,
                &self.endpoint,
                self.config.read_timeout(),
            )
            .await?;
            conn.send(&[Command::Ready.as_str()], true).await?;
            debug!("Worker/SENT : {:?}", Command::Ready.as_str());
            Ok::<_, Error>(conn)
        };

        match attempt.await {
            Ok(conn) => {
                info!(endpoint = %self.endpoint, identity = conn.identity(), "Worker connected");
                Some(conn)
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, "Worker failed to connect: {}", e);
                None
            }
        }
    }

    /// Drop the current connection, wait the reconnect delay and start a
    /// new session with a fresh identity.
    async fn reconnect(&self, session: &mut Session) {
        if let Some(mut conn) = session.conn.take() {
            conn.close().await;
        }

        sleep(self.config.reconnect_delay()).await;

        session.conn = self.connect().await;
        session.liveness = self.config.liveness();
        session.heartbeat_at = Instant::now() + self.config.heartbeat_interval();
    }

    async fn heartbeat(&self, session: &mut Session) {
        let Some(conn) = session.conn.as_mut() else {
            return;
        };
        if Instant::now() > session.heartbeat_at {
            Self::send(conn, Command::Heartbeat, false).await;
            session.heartbeat_at = Instant::now() + self.config.heartbeat_interval();
        }
    }

    /// Send a bare command. Write failures are left for the next read to
    /// detect.
    async fn send(conn: &mut Connection, command: Command, with_identity: bool) {
        match conn.send(&[command.as_str()], with_identity).await {
            Ok(()) => debug!("Worker/SENT : {:?}", command.as_str()),
            Err(e) => debug!("Worker/SENT failed ({}): {}", command, e),
        }
    }

    async fn dispatch<H>(&self, mut packet: Vec<String>, handler: &mut H) -> Result<Flow>
    where
        H: Handler + ?Sized,
    {
        if packet.is_empty() {
            warn!("Received empty packet");
            return Ok(Flow::Reconnect);
        }
        let command = packet.remove(0);

        match command.parse::<Command>() {
            Ok(Command::Heartbeat) => Ok(Flow::Continue),
            Ok(Command::Quit) => {
                info!("Server requested reconnect");
                Ok(Flow::Reconnect)
            }
            Ok(Command::Transfer) => {
                self.deliver_message(packet.first().map(String::as_str), handler)
                    .await?;
                Ok(Flow::Continue)
            }
            Ok(Command::Error) => {
                self.deliver_error(packet.first().map(String::as_str), handler)
                    .await?;
                Ok(Flow::Continue)
            }
            _ => {
                warn!("Received malformed packet starting with {:?}", command);
                Ok(Flow::Reconnect)
            }
        }
    }

    async fn deliver_message<H>(&self, payload: Option<&str>, handler: &mut H) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        let outcome = match decode_transfer(payload.unwrap_or_default()) {
            Ok((event, data)) => handler.on_message(&event, data).await,
            Err(e) => Err(anyhow::Error::new(e)),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => Self::deliver_exception(e, handler).await,
        }
    }

    async fn deliver_error<H>(&self, code: Option<&str>, handler: &mut H) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        let kind = match code {
            Some(code) => ServerError::from_field(code),
            None => ServerError::from_code(ServerError::DEFAULT_CODE)
                .unwrap_or(ServerError::UnknownServerError),
        };

        if kind.is_fatal() {
            error!("Server rejected worker: {}", kind);
            return Err(Error::Server(kind));
        }

        warn!("Server error: {}", kind);
        match handler.on_error(kind).await {
            Ok(()) => Ok(()),
            Err(e) => Self::deliver_exception(e, handler).await,
        }
    }

    async fn deliver_exception<H>(error: anyhow::Error, handler: &mut H) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        handler.on_exception(error).await.map_err(Error::Handler)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Decode a `TR` payload: a JSON object whose single key is the event name
/// and whose value is the event data.
///
/// If the server sends more keys, the first one in document order wins.
pub fn decode_transfer(payload: &str) -> Result<(String, Value)> {
    let object: Map<String, Value> = serde_json::from_str(payload)?;

    object
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol("Transfer payload has no event".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        messages: Vec<(String, Value)>,
        errors: Vec<ServerError>,
        exceptions: Vec<String>,
        fail_messages: bool,
        swallow: bool,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn on_message(&mut self, event: &str, data: Value) -> anyhow::Result<()> {
            if self.fail_messages {
                anyhow::bail!("cannot handle {}", event);
            }
            self.messages.push((event.to_string(), data));
            Ok(())
        }

        async fn on_error(&mut self, error: ServerError) -> anyhow::Result<()> {
            self.errors.push(error);
            Ok(())
        }

        async fn on_exception(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
            self.exceptions.push(error.to_string());
            if self.swallow {
                Ok(())
            } else {
                Err(error)
            }
        }
    }

    struct Silent;

    impl Handler for Silent {}

    fn worker() -> Worker {
        Worker::new("wr://secret@127.0.0.1:8081/test").unwrap()
    }

    fn packet(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_decode_transfer() {
        let (event, data) = decode_transfer(r#"{"greet":{"msg":"hi"}}"#).unwrap();
        assert_eq!(event, "greet");
        assert_eq!(data, json!({"msg": "hi"}));

        assert!(matches!(decode_transfer("{}"), Err(Error::Protocol(_))));

        let (event, data) = decode_transfer(r#"{"zeta":1,"alpha":2}"#).unwrap();
        assert_eq!(event, "zeta");
        assert_eq!(data, json!(1));
        assert!(matches!(decode_transfer("[1]"), Err(Error::Protocol(_))));
        assert!(matches!(decode_transfer(""), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_dispatch_transfer_invokes_on_message() {
        let mut recorder = Recorder::default();
        let flow = worker()
            .dispatch(packet(&["TR", r#"{"greet":{"msg":"hi"}}"#]), &mut recorder)
            .await
            .unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            recorder.messages,
            vec![("greet".to_string(), json!({"msg": "hi"}))]
        );
    }

    #[tokio::test]
    async fn test_dispatch_heartbeat_and_quit() {
        let mut recorder = Recorder::default();
        let w = worker();

        assert_eq!(
            w.dispatch(packet(&["HB"]), &mut recorder).await.unwrap(),
            Flow::Continue
        );
        assert_eq!(
            w.dispatch(packet(&["QT"]), &mut recorder).await.unwrap(),
            Flow::Reconnect
        );
        assert_eq!(
            w.dispatch(packet(&[]), &mut recorder).await.unwrap(),
            Flow::Reconnect
        );
        assert_eq!(
            w.dispatch(packet(&["ZZ"]), &mut recorder).await.unwrap(),
            Flow::Reconnect
        );
        assert!(recorder.messages.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_error_goes_to_on_error() {
        let mut recorder = Recorder::default();
        let w = worker();

        w.dispatch(packet(&["ER", "454"]), &mut recorder).await.unwrap();
        w.dispatch(packet(&["ER"]), &mut recorder).await.unwrap();
        w.dispatch(packet(&["ER", "999"]), &mut recorder).await.unwrap();

        assert_eq!(
            recorder.errors,
            vec![
                ServerError::ChannelNotFound,
                ServerError::InternalServerError,
                ServerError::UnknownServerError,
            ]
        );
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let mut recorder = Recorder::default();
        let err = worker()
            .dispatch(packet(&["ER", "402"]), &mut recorder)
            .await
            .unwrap_err();

        assert_eq!(err.server_error(), Some(ServerError::Unauthorized));
        assert!(recorder.errors.is_empty());
        assert!(recorder.exceptions.is_empty());
    }

    #[tokio::test]
    async fn test_failing_callback_goes_to_on_exception() {
        let mut recorder = Recorder {
            fail_messages: true,
            swallow: true,
            ..Default::default()
        };
        let flow = worker()
            .dispatch(packet(&["TR", r#"{"greet":{}}"#]), &mut recorder)
            .await
            .unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(recorder.exceptions, vec!["cannot handle greet".to_string()]);
    }

    #[tokio::test]
    async fn test_bad_transfer_json_goes_to_on_exception() {
        let mut recorder = Recorder {
            swallow: true,
            ..Default::default()
        };
        worker()
            .dispatch(packet(&["TR", "not json"]), &mut recorder)
            .await
            .unwrap();

        assert_eq!(recorder.exceptions.len(), 1);
        assert!(recorder.messages.is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_exception_propagates() {
        let mut recorder = Recorder {
            fail_messages: true,
            ..Default::default()
        };
        let err = worker()
            .dispatch(packet(&["TR", r#"{"greet":{}}"#]), &mut recorder)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handler(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_default_handler_ignores_events_and_errors() {
        let w = worker();
        let mut silent = Silent;

        w.dispatch(packet(&["TR", r#"{"greet":{}}"#]), &mut silent)
            .await
            .unwrap();
        w.dispatch(packet(&["ER", "454"]), &mut silent).await.unwrap();

        // Without an exception handler, undecodable events stop the worker
        let err = w
            .dispatch(packet(&["TR", "not json"]), &mut silent)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
    }

    #[test]
    fn test_stop_flag() {
        let w = worker();
        assert!(!w.is_alive());
        *w.alive_flag() = true;
        assert!(w.is_alive());
        w.stop();
        assert!(!w.is_alive());
    }

    #[test]
    fn test_default_timings() {
        let config = worker().config().clone();
        assert_eq!(config.heartbeat_interval(), std::time::Duration::from_millis(500));
        assert_eq!(config.read_timeout(), std::time::Duration::from_secs(2));
    }
}
