use crate::{
    error::{MuxError, Result},
    typed::{StreamType, TypedStream, TypedStreamSession},
};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Stream type reserved for heartbeat probes by default.
pub const HEARTBEAT_STREAM_TYPE: StreamType = StreamType(0xFFFF_FFFF);

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between probes.
    pub interval: Duration,
    /// Extra time a probe may take before the callback reports a timeout.
    pub tolerance: Duration,
    /// Stream type carrying the probes. Applications must not open streams
    /// of this type themselves, or the peer will echo their bytes back.
    pub stream_type: StreamType,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            tolerance: Duration::from_secs(15),
            stream_type: HEARTBEAT_STREAM_TYPE,
        }
    }
}

type Callback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Periodic liveness probe over a [`TypedStreamSession`].
///
/// The callback receives each measured round trip, or `Duration::ZERO`
/// once when a probe goes unanswered for `interval + tolerance`.
/// [`Heartbeat::accept_typed_stream`] must be driven on both ends so the
/// responder side echoes probes.
pub struct Heartbeat {
    typed: TypedStreamSession,
    config: HeartbeatConfig,
    callback: Callback,
    token: CancellationToken,
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heartbeat")
            .field("config", &self.config)
            .field("stopped", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Heartbeat {
    pub fn new(
        typed: TypedStreamSession,
        config: HeartbeatConfig,
        callback: impl Fn(Duration) + Send + Sync + 'static,
    ) -> Self {
        Self {
            typed,
            config,
            callback: Arc::new(callback),
            token: CancellationToken::new(),
        }
    }

    /// Open the probe stream and start the requester and watchdog tasks.
    pub async fn start(&self) -> Result<()> {
        let stream = self.typed.open_typed_stream(self.config.stream_type).await?;
        let (marks_tx, marks_rx) = flume::bounded(1);

        tokio::spawn(request_loop(
            stream,
            self.config.interval,
            marks_tx,
            self.token.clone(),
        ));
        tokio::spawn(check_loop(
            marks_rx,
            self.config.interval + self.config.tolerance,
            Arc::clone(&self.callback),
            self.token.clone(),
        ));
        Ok(())
    }

    pub async fn open_typed_stream(&self, stream_type: StreamType) -> Result<TypedStream> {
        if stream_type == self.config.stream_type {
            return Err(MuxError::Config(format!(
                "stream type {stream_type} is reserved for heartbeats"
            )));
        }
        self.typed.open_typed_stream(stream_type).await
    }

    /// Accept the next application stream. Heartbeat streams from the peer
    /// are answered in the background and never returned.
    pub async fn accept_typed_stream(&self) -> Result<TypedStream> {
        loop {
            let stream = self.typed.accept_typed_stream().await?;
            if stream.stream_type() != self.config.stream_type {
                return Ok(stream);
            }
            tokio::spawn(respond(stream, self.token.clone()));
        }
    }

    pub fn session(&self) -> &TypedStreamSession {
        &self.typed
    }

    /// Stop probing and close the session.
    pub async fn close(&self) -> Result<()> {
        self.token.cancel();
        self.typed.close().await
    }
}

async fn request_loop(
    mut stream: TypedStream,
    interval: Duration,
    marks: flume::Sender<Duration>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let probe: u32 = rand::random();
        let start = Instant::now();
        if let Err(err) = stream.write_all(&probe.to_be_bytes()).await {
            tracing::debug!(error = %err, "heartbeat probe failed");
            return;
        }

        let mut echo = [0u8; 4];
        let read = tokio::select! {
            _ = token.cancelled() => return,
            read = stream.read_exact(&mut echo) => read,
        };
        if let Err(err) = read {
            tracing::debug!(error = %err, "heartbeat echo failed");
            return;
        }
        if u32::from_be_bytes(echo) != probe {
            tracing::warn!("heartbeat echo does not match probe");
            return;
        }

        // Zero is reserved for timeouts
        let latency = start.elapsed().max(Duration::from_nanos(1));
        if marks.send_async(latency).await.is_err() {
            return;
        }
    }
}

async fn check_loop(
    marks: flume::Receiver<Duration>,
    timeout: Duration,
    callback: Callback,
    token: CancellationToken,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut fired = false;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            mark = marks.recv_async() => match mark {
                Ok(latency) => {
                    callback(latency);
                    deadline.as_mut().reset(Instant::now() + timeout);
                    fired = false;
                }
                Err(_) => break,
            },
            _ = &mut deadline, if !fired => {
                tracing::debug!("heartbeat timed out");
                callback(Duration::ZERO);
                fired = true;
            }
        }
    }

    // The requester is gone; report the timeout once if it is still pending
    if !fired {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = &mut deadline => callback(Duration::ZERO),
        }
    }
}

async fn respond(stream: TypedStream, token: CancellationToken) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    tokio::select! {
        _ = token.cancelled() => {}
        copied = tokio::io::copy(&mut reader, &mut writer) => {
            if let Err(err) = copied {
                tracing::debug!(error = %err, "heartbeat responder stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.tolerance, Duration::from_secs(15));
        assert_eq!(config.stream_type, StreamType(0xFFFF_FFFF));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_once() {
        use std::sync::Mutex;

        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&calls);
        let callback: Callback = Arc::new(move |d| recorded.lock().unwrap().push(d));

        let (marks_tx, marks_rx) = flume::bounded(1);
        let token = CancellationToken::new();
        let task = tokio::spawn(check_loop(
            marks_rx,
            Duration::from_secs(5),
            callback,
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(*calls.lock().unwrap(), vec![Duration::ZERO]);

        // A round trip re-arms the watchdog
        marks_tx.send_async(Duration::from_millis(3)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec![Duration::ZERO, Duration::from_millis(3), Duration::ZERO]
        );

        token.cancel();
        task.await.unwrap();
    }
}
