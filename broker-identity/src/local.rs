//! Local Unix socket listener handing each connection to a session handler.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::MessageChannel;
use crate::config::ListenerConfig;
use crate::error::BindError;

/// Channel for one accepted local session.
pub type LocalChannel = MessageChannel<UnixStream>;

/// Source of raw connections for the accept loop.
pub(crate) trait Acceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

impl Acceptor for UnixListener {
    type Stream = UnixStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<UnixStream>> + Send {
        async move { UnixListener::accept(self).await.map(|(stream, _)| stream) }
    }
}

/// Accepts local connections and runs a handler per session.
pub struct LocalListener;

impl LocalListener {
    /// Bind `path` and start accepting in the background.
    ///
    /// Must be called from within a Tokio runtime. Each accepted connection
    /// runs `handler` as its own task; at most `config.max_sessions` run at
    /// once and later connections wait in the socket backlog.
    pub fn start<H, Fut>(
        path: impl AsRef<Path>,
        config: ListenerConfig,
        handler: H,
    ) -> Result<ListenerHandle, BindError>
    where
        H: Fn(LocalChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let path = path.as_ref().to_path_buf();
        let listener = bind(&path).map_err(|source| BindError {
            path: path.clone(),
            source,
        })?;
        info!("Listening for local sessions on {:?}", path);

        Ok(spawn_accept_loop(listener, path, config, handler))
    }
}

fn bind(path: &Path) -> io::Result<UnixListener> {
    // Remove stale socket file from a previous run
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;

    // Owner only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

pub(crate) fn spawn_accept_loop<A, H, Fut>(
    acceptor: A,
    path: PathBuf,
    config: ListenerConfig,
    handler: H,
) -> ListenerHandle
where
    A: Acceptor,
    H: Fn(MessageChannel<A::Stream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let child_cancel = cancel.child_token();
    let task = tokio::spawn(accept_loop(
        acceptor,
        config,
        Arc::new(handler),
        child_cancel,
    ));

    ListenerHandle {
        path,
        cancel,
        task: Some(task),
    }
}

async fn accept_loop<A, H, Fut>(
    mut acceptor: A,
    config: ListenerConfig,
    handler: Arc<H>,
    cancel: CancellationToken,
) where
    A: Acceptor,
    H: Fn(MessageChannel<A::Stream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let sessions = Arc::new(Semaphore::new(config.max_sessions.max(1)));
    let mut tasks = JoinSet::new();

    loop {
        let next = async {
            let permit = sessions.clone().acquire_owned().await.ok();
            (permit, acceptor.accept().await)
        };

        tokio::select! {
            () = cancel.cancelled() => {
                info!("Accept loop canceled");
                break;
            }
            Some(joined) = tasks.join_next() => log_session_end(joined),
            (permit, accepted) = next => match accepted {
                Ok(stream) => {
                    debug!("Accepted local session ({} active)", tasks.len() + 1);
                    let handler = handler.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        handler(MessageChannel::new(stream)).await;
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            },
        }
    }

    // Release the endpoint before draining.
    drop(acceptor);

    if tasks.is_empty() {
        return;
    }
    info!("Draining {} local sessions", tasks.len());
    let drained = tokio::time::timeout(config.drain_timeout, async {
        while let Some(joined) = tasks.join_next().await {
            log_session_end(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            "Aborting {} local sessions after {:?}",
            tasks.len(),
            config.drain_timeout
        );
        tasks.shutdown().await;
    }
}

fn log_session_end(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => debug!("Local session finished"),
        Err(e) if e.is_panic() => error!("Local session panicked: {}", e),
        Err(e) => debug!("Local session ended: {}", e),
    }
}

/// Handle to a running [`LocalListener`].
///
/// Dropping the handle stops the accept loop without waiting for it.
#[derive(Debug)]
pub struct ListenerHandle {
    path: PathBuf,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn local_path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting, release the socket and drain running sessions.
    ///
    /// Sessions still running after the configured drain timeout are
    /// aborted. The socket path is left in place, so new connection
    /// attempts are refused.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Accept loop failed: {}", e);
            }
        }
        info!("Local listener on {:?} closed", self.path);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn echo(mut channel: LocalChannel) {
        while let Ok(msg) = channel.recv::<String>().await {
            if channel.send(&msg).await.is_err() {
                break;
            }
        }
    }

    async fn roundtrip(path: &Path, msg: &str) -> String {
        let stream = UnixStream::connect(path).await.unwrap();
        let mut channel = MessageChannel::new(stream);
        channel.send(&msg.to_string()).await.unwrap();
        channel.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_handler_receives_messages() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broker.sock");
        let handle = LocalListener::start(&path, ListenerConfig::default(), echo).unwrap();

        assert_eq!(roundtrip(&path, "challenge").await, "challenge");
        assert_eq!(roundtrip(&path, "again").await, "again");
        assert_eq!(handle.local_path(), path.as_path());
        handle.close().await;
    }

    #[tokio::test]
    async fn test_socket_setup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/broker.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let handle = LocalListener::start(&path, ListenerConfig::default(), echo).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        assert_eq!(roundtrip(&path, "ok").await, "ok");
        handle.close().await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let result = LocalListener::start(
            blocker.join("broker.sock"),
            ListenerConfig::default(),
            echo,
        );
        let err = result.unwrap_err();
        assert_eq!(err.path, blocker.join("broker.sock"));
    }

    #[tokio::test]
    async fn test_connect_refused_after_close() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broker.sock");
        let handle = LocalListener::start(&path, ListenerConfig::default(), echo).unwrap();
        assert_eq!(roundtrip(&path, "before").await, "before");

        handle.close().await;
        let err = UnixStream::connect(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    struct FlakyAcceptor {
        inner: UnixListener,
        failures: Arc<AtomicUsize>,
    }

    impl Acceptor for FlakyAcceptor {
        type Stream = UnixStream;

        fn accept(&mut self) -> impl Future<Output = io::Result<UnixStream>> + Send {
            async move {
                if self.failures.load(Ordering::SeqCst) == 0 {
                    self.failures.fetch_add(1, Ordering::SeqCst);
                    return Err(io::Error::other("transient accept failure"));
                }
                self.inner.accept().await.map(|(stream, _)| stream)
            }
        }
    }

    #[tokio::test]
    async fn test_transient_accept_error_keeps_listening() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broker.sock");
        let failures = Arc::new(AtomicUsize::new(0));
        let acceptor = FlakyAcceptor {
            inner: UnixListener::bind(&path).unwrap(),
            failures: failures.clone(),
        };

        let handle = spawn_accept_loop(
            acceptor,
            path.clone(),
            ListenerConfig::default(),
            echo,
        );

        assert_eq!(roundtrip(&path, "still here").await, "still here");
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_sessions_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broker.sock");
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));

        let handler_gate = gate.clone();
        let handle = LocalListener::start(
            &path,
            ListenerConfig {
                max_sessions: 1,
                ..ListenerConfig::default()
            },
            move |_channel: LocalChannel| {
                let started_tx = started_tx.clone();
                let gate = handler_gate.clone();
                async move {
                    let _ = started_tx.send(());
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                }
            },
        )
        .unwrap();

        let _first = UnixStream::connect(&path).await.unwrap();
        let _second = UnixStream::connect(&path).await.unwrap();

        started_rx.recv().await.unwrap();
        let early =
            tokio::time::timeout(Duration::from_millis(200), started_rx.recv()).await;
        assert!(early.is_err(), "second session started while first held the slot");

        gate.add_permits(2);
        started_rx.recv().await.unwrap();
        handle.close().await;
    }

    #[tokio::test]
    async fn test_close_drains_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broker.sock");
        let finished = Arc::new(AtomicBool::new(false));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let handler_finished = finished.clone();
        let handle = LocalListener::start(&path, ListenerConfig::default(), move |_channel| {
            let finished = handler_finished.clone();
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();

        let _client = UnixStream::connect(&path).await.unwrap();
        started_rx.recv().await.unwrap();

        handle.close().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_close_aborts_stuck_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broker.sock");
        let dropped = Arc::new(AtomicBool::new(false));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let handler_dropped = dropped.clone();
        let handle = LocalListener::start(
            &path,
            ListenerConfig {
                drain_timeout: Duration::from_millis(50),
                ..ListenerConfig::default()
            },
            move |_channel| {
                let guard = SetOnDrop(handler_dropped.clone());
                let started_tx = started_tx.clone();
                async move {
                    let _guard = guard;
                    let _ = started_tx.send(());
                    std::future::pending::<()>().await;
                }
            },
        )
        .unwrap();

        let _client = UnixStream::connect(&path).await.unwrap();
        started_rx.recv().await.unwrap();

        handle.close().await;
        assert!(dropped.load(Ordering::SeqCst));
    }
}
