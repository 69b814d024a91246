use crate::{
    error::{MuxError, Result},
    frame::{MAX_BODY_LEN, MAX_WINDOW_INCREMENT},
    stream::Stream,
};
use std::{fmt, sync::Arc, time::Duration};

/// Hook applied to every stream a session constructs, opened or accepted.
///
/// Accepted streams pass through it on the session's read task, so it
/// must not block.
pub type StreamFactory = Arc<dyn Fn(Stream) -> Stream + Send + Sync>;

/// Configuration for a multiplexed session.
///
/// Both ends of a transport are expected to use the same
/// `max_window_size`: a DATA frame larger than the local window is
/// rejected as a flow-control violation.
///
/// # Examples
///
/// ```rust
/// use virtmux::{Config, ConfigBuilder};
/// use std::time::Duration;
///
/// let config = Config::default();
/// assert_eq!(config.max_window_size, 256 * 1024);
///
/// let config = ConfigBuilder::new()
///     .accept_backlog(16)
///     .go_away_timeout(Duration::from_millis(500))
///     .build()
///     .expect("Valid configuration");
/// assert_eq!(config.accept_backlog, 16);
/// ```
#[derive(Clone)]
pub struct Config {
    /// Per-stream credit and receive buffer size, in bytes.
    pub max_window_size: usize,
    /// Peer-opened streams waiting for `accept_stream`.
    pub accept_backlog: usize,
    /// Frames queued for the writer task.
    pub write_queue_depth: usize,
    /// Largest DATA payload a single write puts in one frame.
    pub max_frame_size: usize,
    /// Upper bound on flushing a GOAWAY.
    pub go_away_timeout: Duration,
    /// Builds the handle for every new stream; `None` returns it as is.
    pub stream_factory: Option<StreamFactory>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_window_size", &self.max_window_size)
            .field("accept_backlog", &self.accept_backlog)
            .field("write_queue_depth", &self.write_queue_depth)
            .field("max_frame_size", &self.max_frame_size)
            .field("go_away_timeout", &self.go_away_timeout)
            .field("stream_factory", &self.stream_factory.is_some())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_window_size: 256 * 1024, // 256KB
            accept_backlog: 128,
            write_queue_depth: 64,
            max_frame_size: 64 * 1024, // 64KB
            go_away_timeout: Duration::from_millis(250),
            stream_factory: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_window_size == 0 {
            return Err(MuxError::Config("Max window size cannot be 0".to_string()));
        }

        if self.max_window_size > MAX_WINDOW_INCREMENT as usize {
            return Err(MuxError::Config(
                "Max window size cannot exceed 2^31 - 1 bytes".to_string(),
            ));
        }

        if self.accept_backlog == 0 {
            return Err(MuxError::Config("Accept backlog cannot be 0".to_string()));
        }

        if self.write_queue_depth == 0 {
            return Err(MuxError::Config(
                "Write queue depth cannot be 0".to_string(),
            ));
        }

        if self.max_frame_size == 0 {
            return Err(MuxError::Config("Max frame size cannot be 0".to_string()));
        }

        if self.max_frame_size > MAX_BODY_LEN {
            return Err(MuxError::Config(
                "Max frame size cannot exceed the 24-bit length field".to_string(),
            ));
        }

        if self.go_away_timeout.is_zero() {
            return Err(MuxError::Config(
                "GOAWAY timeout cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for creating custom `Config` instances.
///
/// Starts from [`Config::default`] and validates on [`ConfigBuilder::build`].
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn max_window_size(mut self, size: usize) -> Self {
        self.config.max_window_size = size;
        self
    }

    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    pub fn write_queue_depth(mut self, depth: usize) -> Self {
        self.config.write_queue_depth = depth;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn go_away_timeout(mut self, timeout: Duration) -> Self {
        self.config.go_away_timeout = timeout;
        self
    }

    pub fn stream_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(Stream) -> Stream + Send + Sync + 'static,
    {
        self.config.stream_factory = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.accept_backlog, 128);
        assert_eq!(config.go_away_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_config_validation() {
        let config = Config {
            max_window_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_window_size: 1 << 31,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            accept_backlog: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            write_queue_depth: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_frame_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_frame_size: 16 * 1024 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            go_away_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .max_window_size(1024 * 1024)
            .accept_backlog(4)
            .write_queue_depth(8)
            .max_frame_size(16 * 1024)
            .go_away_timeout(Duration::from_secs(1))
            .build()
            .unwrap();

        assert_eq!(config.max_window_size, 1024 * 1024);
        assert_eq!(config.accept_backlog, 4);
        assert_eq!(config.write_queue_depth, 8);
        assert_eq!(config.max_frame_size, 16 * 1024);
        assert_eq!(config.go_away_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_config_builder_validation_failure() {
        let result = ConfigBuilder::new().accept_backlog(0).build();
        assert!(matches!(result, Err(MuxError::Config(_))));
    }
}
