//! Framed command/response exchanges with bounded retries.

use super::{parse_reply, Axis, Command, Reply, END_CHAR};
use crate::error::{MountError, MountResult, TransportError};
use crate::transport::MountTransport;
use std::time::Duration;
use tracing::instrument;

/// Default per-read timeout for a reply.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How many times an exchange is attempted and how long to wait in between.
///
/// Only transport-level failures are retried. A device rejection ends the
/// exchange immediately.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before each retry.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// 3 attempts with 100ms between them.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Owns the transport and performs one exchange at a time.
pub struct CommandChannel {
    transport: Box<dyn MountTransport>,
    retry: RetryPolicy,
    read_timeout: Duration,
}

impl CommandChannel {
    /// Channel with the default retry policy and read timeout.
    pub fn new(transport: Box<dyn MountTransport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Retry policy in use.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Direct access to the transport for exchanges outside the framed protocol.
    pub fn transport_mut(&mut self) -> &mut dyn MountTransport {
        self.transport.as_mut()
    }

    /// Send `command` to `axis` and return the reply payload.
    ///
    /// Stale input is discarded before every attempt. The whole exchange,
    /// including retries, completes before this returns.
    ///
    /// # Errors
    /// - [`MountError::Transport`] once every attempt failed to produce a frame
    /// - [`MountError::Device`] if the controller rejected the command
    #[instrument(skip(self, axis, command), fields(axis = %axis, cmd = %command), err)]
    pub async fn talk(&mut self, axis: Axis, command: &Command) -> MountResult<String> {
        let frame = command.frame(axis);
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        let reply = loop {
            attempt += 1;
            match self.exchange(&frame).await {
                Ok(reply) => break reply,
                Err(e) if attempt < attempts => {
                    tracing::debug!(attempt, error = %e, "Exchange failed, retrying");
                    tokio::time::sleep(self.retry.backoff_delay).await;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Communication error");
                    return Err(MountError::Transport {
                        axis,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        };

        match reply {
            Reply::Ok(payload) => {
                if !payload.is_empty() {
                    tracing::trace!(response = %payload, "RES");
                }
                Ok(payload)
            }
            Reply::Rejected(device_error) => {
                match device_error.message() {
                    Some(message) => tracing::error!("Mount error: {}", message),
                    None => tracing::error!(code = ?device_error.code, "Mount error with unknown code"),
                }
                Err(MountError::Device(device_error))
            }
        }
    }

    /// One attempt: flush, write, read a frame.
    async fn exchange(&mut self, frame: &[u8]) -> Result<Reply, TransportError> {
        self.transport.flush_input().await?;
        self.transport.write_bytes(frame).await?;
        let response = self
            .transport
            .read_until(END_CHAR, self.read_timeout)
            .await?;
        parse_reply(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tracing_test::traced_test;

    /// Replays a fixed sequence of read outcomes and counts writes.
    struct ScriptedTransport {
        reads: VecDeque<Result<Vec<u8>, TransportError>>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        flushes: Arc<Mutex<u32>>,
    }

    impl ScriptedTransport {
        fn new(
            reads: Vec<Result<Vec<u8>, TransportError>>,
        ) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<u32>>) {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let flushes = Arc::new(Mutex::new(0));
            (
                Self {
                    reads: reads.into(),
                    writes: writes.clone(),
                    flushes: flushes.clone(),
                },
                writes,
                flushes,
            )
        }
    }

    #[async_trait]
    impl MountTransport for ScriptedTransport {
        async fn flush_input(&mut self) -> Result<(), TransportError> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }

        async fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        async fn read_until(
            &mut self,
            _delimiter: u8,
            timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            self.reads
                .pop_front()
                .unwrap_or(Err(TransportError::Timeout(timeout)))
        }

        async fn read_byte(&mut self, timeout: Duration) -> Result<u8, TransportError> {
            Err(TransportError::Timeout(timeout))
        }
    }

    fn fast_channel(transport: ScriptedTransport) -> CommandChannel {
        CommandChannel::new(Box::new(transport)).with_retry_policy(RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        })
    }

    fn timeout() -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Timeout(Duration::from_millis(1)))
    }

    #[test]
    fn test_default_policy_is_three_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_delay, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_gives_up_after_three_attempts() {
        let (transport, writes, flushes) = ScriptedTransport::new(vec![timeout(), timeout(), timeout()]);
        let mut channel = fast_channel(transport);

        let result = channel
            .talk(Axis::Primary, &Command::bare(Opcode::GetStatus))
            .await;

        match result {
            Err(MountError::Transport { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected transport failure, got {:?}", other),
        }
        assert_eq!(writes.lock().unwrap().len(), 3);
        assert_eq!(*flushes.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_succeeds_on_second_attempt_without_third() {
        let (transport, writes, _) = ScriptedTransport::new(vec![
            timeout(),
            Ok(b"=101\r".to_vec()),
            Ok(b"=999\r".to_vec()),
        ]);
        let mut channel = fast_channel(transport);

        let payload = channel
            .talk(Axis::Secondary, &Command::bare(Opcode::GetStatus))
            .await
            .unwrap();

        assert_eq!(payload, "101");
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b":f2\r".to_vec());
    }

    #[tokio::test]
    async fn test_short_response_counts_as_failed_attempt() {
        let (transport, writes, _) =
            ScriptedTransport::new(vec![Ok(b"\r".to_vec()), Ok(b"=\r".to_vec())]);
        let mut channel = fast_channel(transport);

        let payload = channel
            .talk(Axis::Primary, &Command::bare(Opcode::StartMotion))
            .await
            .unwrap();

        assert!(payload.is_empty());
        assert_eq!(writes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_retried() {
        let (transport, writes, _) =
            ScriptedTransport::new(vec![Ok(b"?101\r".to_vec()), Ok(b"=101\r".to_vec())]);
        let mut channel = fast_channel(transport);

        let payload = channel
            .talk(Axis::Primary, &Command::bare(Opcode::GetStatus))
            .await
            .unwrap();

        assert_eq!(payload, "101");
        assert_eq!(writes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_garbage_exhausts_attempts() {
        let garbage = || Ok(b"?\r".to_vec());
        let (transport, writes, _) = ScriptedTransport::new(vec![garbage(), garbage(), garbage()]);
        let mut channel = fast_channel(transport);

        let err = channel
            .talk(Axis::Secondary, &Command::bare(Opcode::GetEncoder))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MountError::Transport {
                attempts: 3,
                source: TransportError::Malformed(b'?'),
                ..
            }
        ));
        assert_eq!(writes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_device_error_is_not_retried() {
        let (transport, writes, _) = ScriptedTransport::new(vec![Ok(b"!2\r".to_vec())]);
        let mut channel = fast_channel(transport);

        let err = channel
            .talk(Axis::Primary, &Command::bare(Opcode::SetMotionMode))
            .await
            .unwrap_err();

        let device = err.device_error().expect("device error");
        assert_eq!(device.code, Some(2));
        assert!(err.to_string().to_lowercase().contains("motor not stopped"));
        assert_eq!(writes.lock().unwrap().len(), 1);
        assert!(logs_contain("Motor not stopped"));
    }

    #[tokio::test]
    async fn test_unknown_device_code_still_fails() {
        let (transport, _, _) = ScriptedTransport::new(vec![Ok(b"!7\r".to_vec())]);
        let mut channel = fast_channel(transport);

        let err = channel
            .talk(Axis::Primary, &Command::bare(Opcode::StartMotion))
            .await
            .unwrap_err();

        assert!(matches!(err, MountError::Device(e) if e.message().is_none()));
    }
}
