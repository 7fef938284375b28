use std::time::Duration;

use clap::ValueEnum;
use log::{info, warn};
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tokio::time::{Instant, sleep};

use crate::error::{Error, Result};

const SYSLOG_TAG: &str = "daemon";
const AUDIT_TARGET: &str = "audit";

/// Destination of per-event audit lines.
pub trait AuditSink {
    fn info(&mut self, line: &str) -> Result<()>;
}

impl<S: AuditSink + ?Sized> AuditSink for Box<S> {
    fn info(&mut self, line: &str) -> Result<()> {
        (**self).info(line)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum AuditMode {
    /// Local syslog daemon, facility DAEMON.
    #[default]
    Syslog,
    /// The process logger under the `audit` target.
    Log,
}

/// Informational messages to the local syslog socket.
pub struct SyslogSink {
    logger: Logger<LoggerBackend, Formatter3164>,
}

impl SyslogSink {
    pub fn connect() -> Result<Self> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| Error::Sink(format!("failed to connect to syslog: {e}")))?;
        Ok(Self { logger })
    }
}

impl AuditSink for SyslogSink {
    fn info(&mut self, line: &str) -> Result<()> {
        self.logger
            .info(line)
            .map_err(|e| Error::Sink(format!("failed to write to syslog: {e}")))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl AuditSink for LogSink {
    fn info(&mut self, line: &str) -> Result<()> {
        info!(target: AUDIT_TARGET, "{line}");
        Ok(())
    }
}

/// Opens the sink selected by `mode` once, without retrying.
pub fn open_sink(mode: AuditMode) -> Result<Box<dyn AuditSink + Send>> {
    Ok(match mode {
        AuditMode::Syslog => Box::new(SyslogSink::connect()?),
        AuditMode::Log => Box::new(LogSink),
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Calls `connect` immediately and then once per interval until it succeeds
/// or the timeout has elapsed.
pub async fn connect_with_retry<S, F>(mut connect: F, policy: RetryPolicy) -> Result<S>
where
    F: FnMut() -> Result<S>,
{
    let deadline = Instant::now() + policy.timeout;
    loop {
        match connect() {
            Ok(sink) => return Ok(sink),
            Err(err) if Instant::now() + policy.interval > deadline => {
                return Err(Error::Sink(format!(
                    "gave up after {:?}: {err}",
                    policy.timeout
                )));
            }
            Err(err) => {
                warn!("{err}; Retrying...");
                sleep(policy.interval).await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Keeps every line it is given.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink(pub Arc<Mutex<Vec<String>>>);

    impl RecordingSink {
        pub(crate) fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl AuditSink for RecordingSink {
        fn info(&mut self, line: &str) -> Result<()> {
            self.0.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connects_on_first_success() {
        let start = Instant::now();
        let sink = connect_with_retry(|| Ok(RecordingSink::default()), RetryPolicy::default())
            .await
            .unwrap();
        assert!(sink.lines().is_empty());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_sink_comes_up() {
        let mut attempts = 0;
        let start = Instant::now();
        let result = connect_with_retry(
            || {
                attempts += 1;
                if attempts < 4 {
                    Err(Error::Sink("socket not ready".into()))
                } else {
                    Ok(LogSink)
                }
            },
            RetryPolicy::default(),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_timeout() {
        let mut attempts = 0;
        let start = Instant::now();
        let err = connect_with_retry::<LogSink, _>(
            || {
                attempts += 1;
                Err(Error::Sink("no syslog".into()))
            },
            RetryPolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
        assert_eq!(attempts, 31);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn log_sink_accepts_lines() {
        let mut sink = open_sink(AuditMode::Log).unwrap();
        sink.info("ruleId 1 action Allow len 60 if eth0").unwrap();
    }
}
