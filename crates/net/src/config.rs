use std::time::Duration;

/// Limits applied to every session.
///
/// These are handed to each session when it is created; nothing reads them from global state.
#[derive(derivative::Derivative, Debug, Clone)]
#[derivative(Default)]
pub struct SessionConfig {
    /// Maximum number of payload bytes which may be queued but not yet written before enqueueing starts to fail.
    #[derivative(Default(value = "1<<20"))]
    pub max_indexed_memory: usize,

    /// Largest payload we will send or accept.
    ///
    /// Incoming frames claiming to be longer than this are treated as an attack, and the session is dropped.
    #[derivative(Default(value = "65536"))]
    pub max_message_size: u32,

    /// Upper bound on the frames one flush tick may complete for one session, so that a single busy session can't
    /// starve the others sharing the flushing thread.
    #[derivative(Default(value = "256"))]
    pub max_messages_per_tick: usize,

    /// Size of the buffer frames are packed into before being handed to the transport.
    #[derivative(Default(value = "8192"))]
    pub transmit_buffer_size: usize,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    MustBeNonZero(&'static str),

    #[error("max_message_size ({max_message_size}) is larger than max_indexed_memory ({max_indexed_memory}), so the largest messages could never be sent")]
    MessageLargerThanQueue {
        max_message_size: u32,
        max_indexed_memory: usize,
    },
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_indexed_memory == 0 {
            return Err(ConfigError::MustBeNonZero("max_indexed_memory"));
        }
        if self.max_messages_per_tick == 0 {
            return Err(ConfigError::MustBeNonZero("max_messages_per_tick"));
        }
        if self.transmit_buffer_size == 0 {
            return Err(ConfigError::MustBeNonZero("transmit_buffer_size"));
        }
        if self.max_message_size as u64 > self.max_indexed_memory as u64 {
            return Err(ConfigError::MessageLargerThanQueue {
                max_message_size: self.max_message_size,
                max_indexed_memory: self.max_indexed_memory,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct HostConfig {
    /// Maximum number of sessions which may be open at any one time.
    ///
    /// We start refusing new sessions if this many are open.
    #[builder(default = "512")]
    pub max_sessions: usize,

    /// How often [crate::SessionHost::flush_loop] flushes every session.
    #[builder(default = "Duration::from_millis(50)")]
    pub tick_interval: Duration,

    #[builder(default = "Default::default()")]
    pub session: SessionConfig,
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::MustBeNonZero("max_sessions"));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::MustBeNonZero("tick_interval"));
        }
        self.session.validate()
    }
}
