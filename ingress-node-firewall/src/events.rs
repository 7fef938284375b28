//! Consumes filtering-decision records from the kernel and writes audit lines.
//!
//! Per-CPU perf readers feed a single [`EventReader`]. One reader task drains
//! it; a watcher task owns the only [`ReaderCloser`] and closes it when the
//! shutdown future resolves, which makes the next read return
//! [`ReadError::Closed`].

use std::{fmt, future::Future, io, sync::Arc};

use aya::{
    maps::{Map, MapData, perf::AsyncPerfEventArray},
    util::online_cpus,
};
use bytes::{Bytes, BytesMut};
use ingress_node_firewall_common::{EVENT_HDR_SIZE, EventHeader};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    attach::InterfaceResolver,
    error::{Error, Result},
    model::action_name,
    packet::decode_layers,
    sink::{AuditSink, RetryPolicy, connect_with_retry},
};

const RECORD_QUEUE_DEPTH: usize = 1024;
const PERF_BATCH: usize = 16;
const PERF_SAMPLE_CAPACITY: usize = 1024;

/// One item read from the kernel channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RawRecord {
    /// The per-CPU buffer overflowed and this many samples were discarded.
    Lost(u64),
    Sample(Bytes),
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ReadError {
    /// The reader was closed on purpose.
    #[error("perf event reader closed")]
    Closed,
    #[error("{0}")]
    Io(String),
}

/// Per-record problems. Logged by the reader task and never propagated.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Parsing perf event header err: got {len} bytes, need {EVENT_HDR_SIZE}")]
    ShortHeader { len: usize },
    #[error("Parsing perf event packet header: want {expected} bytes, got {available}")]
    ShortPacket { expected: usize, available: usize },
    #[error("lookup network iface {index}: {source}")]
    UnknownInterface {
        index: u16,
        #[source]
        source: io::Error,
    },
}

/// Producer side of the record queue, cloned once per CPU.
#[derive(Clone, Debug)]
pub struct RecordSender(mpsc::Sender<std::result::Result<RawRecord, ReadError>>);

impl RecordSender {
    /// Returns `false` once the reader is gone.
    pub async fn send(&self, item: std::result::Result<RawRecord, ReadError>) -> bool {
        self.0.send(item).await.is_ok()
    }
}

pub struct EventReader {
    records: mpsc::Receiver<std::result::Result<RawRecord, ReadError>>,
    closed: watch::Receiver<bool>,
}

impl EventReader {
    /// Waits for the next record. Returns [`ReadError::Closed`] after the
    /// paired closer has fired, even if records are still queued.
    pub async fn read(&mut self) -> std::result::Result<RawRecord, ReadError> {
        if *self.closed.borrow() {
            return Err(ReadError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => Err(ReadError::Closed),
            item = self.records.recv() => item.unwrap_or(Err(ReadError::Closed)),
        }
    }
}

/// Close-once handle for an [`EventReader`].
pub struct ReaderCloser(watch::Sender<bool>);

impl ReaderCloser {
    pub fn close(self) {
        self.0.send_replace(true);
    }
}

pub fn record_channel() -> (RecordSender, EventReader, ReaderCloser) {
    let (tx, rx) = mpsc::channel(RECORD_QUEUE_DEPTH);
    let (closed_tx, closed_rx) = watch::channel(false);
    (
        RecordSender(tx),
        EventReader {
            records: rx,
            closed: closed_rx,
        },
        ReaderCloser(closed_tx),
    )
}

/// Something that can start per-CPU tasks forwarding records to a sender.
pub trait RecordSource {
    fn spawn_readers(&mut self, sender: RecordSender) -> Result<Vec<JoinHandle<()>>>;
}

/// Opens a perf buffer on every online CPU and forwards its samples and lost
/// counts to `sender`. The array stays usable, so a failed open can be
/// retried.
impl RecordSource for AsyncPerfEventArray<MapData> {
    fn spawn_readers(&mut self, sender: RecordSender) -> Result<Vec<JoinHandle<()>>> {
        let cpus =
            online_cpus().map_err(|(_, e)| Error::kernel("failed to list online cpus", e))?;

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            let mut buf = match self.open(cpu, None) {
                Ok(buf) => buf,
                Err(e) => {
                    handles.iter().for_each(JoinHandle::abort);
                    return Err(Error::kernel(
                        format!("Failed creating perf event reader on cpu {cpu}"),
                        e,
                    ));
                }
            };
            let sender = sender.clone();
            handles.push(tokio::spawn(async move {
                let mut buffers = (0..PERF_BATCH)
                    .map(|_| BytesMut::with_capacity(PERF_SAMPLE_CAPACITY))
                    .collect::<Vec<_>>();
                loop {
                    let events = match buf.read_events(&mut buffers).await {
                        Ok(events) => events,
                        Err(e) => {
                            if !sender.send(Err(ReadError::Io(e.to_string()))).await {
                                return;
                            }
                            continue;
                        }
                    };
                    if events.lost > 0
                        && !sender.send(Ok(RawRecord::Lost(events.lost as u64))).await
                    {
                        return;
                    }
                    for sample in buffers.iter_mut().take(events.read) {
                        let record = RawRecord::Sample(sample.split().freeze());
                        if !sender.send(Ok(record)).await {
                            return;
                        }
                    }
                }
            }));
        }
        Ok(handles)
    }
}

/// Wraps the events map for [`EventFeed`].
pub fn perf_event_array(map: Map) -> Result<AsyncPerfEventArray<MapData>> {
    AsyncPerfEventArray::try_from(map)
        .map_err(|e| Error::kernel("events map has unexpected type", e))
}

/// Runs at most one pipeline over a record source. A start that fails keeps
/// the source and can be tried again.
pub struct EventFeed<P> {
    source: P,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl<P: RecordSource> EventFeed<P> {
    pub fn new(source: P) -> Self {
        Self {
            source,
            tasks: Vec::new(),
            started: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Spawns the source readers and starts the pipeline over them. Returns
    /// [`Error::PipelineRunning`] once a start has succeeded.
    pub async fn start<S, C, R, F>(
        &mut self,
        connect: C,
        resolver: R,
        shutdown: F,
        retry: RetryPolicy,
    ) -> Result<PipelineHandle>
    where
        S: AuditSink + Send + 'static,
        C: FnMut() -> Result<S>,
        R: InterfaceResolver + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        if self.started {
            return Err(Error::PipelineRunning);
        }
        let (sender, reader, closer) = record_channel();
        let tasks = self.source.spawn_readers(sender)?;
        match start_pipeline(reader, closer, connect, resolver, shutdown, retry).await {
            Ok(handle) => {
                self.tasks = tasks;
                self.started = true;
                Ok(handle)
            }
            Err(err) => {
                tasks.iter().for_each(JoinHandle::abort);
                Err(err)
            }
        }
    }

    /// Aborts the source reader tasks.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Dropped(u64),
    Skipped(EventError),
    Audit(Vec<String>),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Dropped(count) => {
                write!(f, "Perf event ring buffer full, dropped {count} samples")
            }
            Outcome::Skipped(err) => write!(f, "{err}"),
            Outcome::Audit(lines) => write!(f, "{}", lines.join("\n")),
        }
    }
}

/// Turns one record into the audit lines it should produce.
pub fn process_record<R>(record: RawRecord, resolver: &R) -> Outcome
where
    R: InterfaceResolver + ?Sized,
{
    let sample = match record {
        RawRecord::Lost(count) => return Outcome::Dropped(count),
        RawRecord::Sample(sample) => sample,
    };
    let Some(hdr) = EventHeader::decode(&sample) else {
        return Outcome::Skipped(EventError::ShortHeader { len: sample.len() });
    };
    let expected = hdr.pkt_length as usize;
    let Some(packet) = sample.get(EVENT_HDR_SIZE..EVENT_HDR_SIZE + expected) else {
        return Outcome::Skipped(EventError::ShortPacket {
            expected,
            available: sample.len() - EVENT_HDR_SIZE,
        });
    };
    let iface = match resolver.name_of(hdr.if_index as u32) {
        Ok(name) => name,
        Err(source) => {
            return Outcome::Skipped(EventError::UnknownInterface {
                index: hdr.if_index,
                source,
            });
        }
    };

    let mut lines = vec![format!(
        "ruleId {} action {} len {} if {}",
        hdr.rule_id,
        action_name(hdr.action),
        hdr.pkt_length,
        iface
    )];
    lines.extend(decode_layers(packet).iter().map(ToString::to_string));
    Outcome::Audit(lines)
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PipelineState {
    #[default]
    Idle,
    Running,
    Closing,
    Stopped,
}

pub struct PipelineHandle {
    state: Arc<watch::Sender<PipelineState>>,
    reader: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Waits for both tasks to finish.
    pub async fn join(self) {
        if let Err(e) = self.reader.await {
            warn!("event reader task failed: {e}");
        }
        self.watcher.abort();
        let _ = self.watcher.await;
    }
}

/// Connects the audit sink, then starts the reader and watcher tasks. Fails
/// without starting anything if the sink cannot be established within
/// `retry`. Audit lines are written from the blocking pool.
pub async fn start_pipeline<S, C, R, F>(
    mut reader: EventReader,
    closer: ReaderCloser,
    connect: C,
    resolver: R,
    shutdown: F,
    retry: RetryPolicy,
) -> Result<PipelineHandle>
where
    S: AuditSink + Send + 'static,
    C: FnMut() -> Result<S>,
    R: InterfaceResolver + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let (state, _) = watch::channel(PipelineState::Idle);
    let state = Arc::new(state);
    let mut sink = connect_with_retry(connect, retry).await?;

    // Running must be published before either task can move the state on.
    state.send_replace(PipelineState::Running);
    info!("Listening for events..");

    let (lines_tx, mut lines_rx) = mpsc::channel::<Vec<String>>(RECORD_QUEUE_DEPTH);
    let writer = tokio::task::spawn_blocking(move || {
        while let Some(lines) = lines_rx.blocking_recv() {
            for line in &lines {
                if let Err(e) = sink.info(line) {
                    warn!("failed to write audit line: {e}");
                }
            }
        }
    });

    let watcher_state = Arc::clone(&state);
    let watcher = tokio::spawn(async move {
        shutdown.await;
        info!("Received signal, exiting program..");
        watcher_state.send_replace(PipelineState::Closing);
        closer.close();
    });

    let reader_state = Arc::clone(&state);
    let reader = tokio::spawn(async move {
        loop {
            let record = match reader.read().await {
                Ok(record) => record,
                Err(ReadError::Closed) => break,
                Err(err) => {
                    warn!("Reading from perf event reader: {err}");
                    continue;
                }
            };
            match process_record(record, &resolver) {
                Outcome::Audit(lines) => {
                    if lines_tx.send(lines).await.is_err() {
                        warn!("audit writer exited");
                        break;
                    }
                }
                outcome => warn!("{outcome}"),
            }
        }
        drop(lines_tx);
        if let Err(e) = writer.await {
            warn!("audit writer task failed: {e}");
        }
        debug!("event reader stopped");
        reader_state.send_replace(PipelineState::Stopped);
    });

    Ok(PipelineHandle {
        state,
        reader,
        watcher,
    })
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to wait for shutdown signal: {e}");
            }
            return;
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("failed to wait for shutdown signal: {e}");
            }
        }
        _ = term.recv() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::{ethernet, ipv4, tcp};
    use crate::sink::tests::RecordingSink;
    use ingress_node_firewall_common::{IPPROTO_TCP, XDP_DENY};
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct StaticInterfaces(Vec<(u32, &'static str)>);

    impl InterfaceResolver for StaticInterfaces {
        fn index_of(&self, name: &str) -> io::Result<u32> {
            self.0
                .iter()
                .find(|(_, n)| *n == name)
                .map(|(idx, _)| *idx)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn name_of(&self, index: u32) -> io::Result<String> {
            self.0
                .iter()
                .find(|(idx, _)| *idx == index)
                .map(|(_, n)| n.to_string())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn interfaces() -> StaticInterfaces {
        StaticInterfaces(vec![(5, "eth0")])
    }

    fn deny_tcp_record(if_index: u16) -> RawRecord {
        let packet = ethernet(
            0x0800,
            &ipv4(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(40000, 22)),
        );
        assert_eq!(packet.len(), 54);
        let hdr = EventHeader {
            if_index,
            rule_id: 1,
            action: XDP_DENY,
            pad: 0,
            pkt_length: packet.len() as u16,
        };
        let mut sample = hdr.to_bytes().to_vec();
        sample.extend_from_slice(&packet);
        RawRecord::Sample(Bytes::from(sample))
    }

    #[test]
    fn deny_event_renders_three_lines_in_order() {
        let Outcome::Audit(lines) = process_record(deny_tcp_record(5), &interfaces()) else {
            panic!("expected audit lines");
        };
        assert_eq!(
            lines,
            vec![
                "ruleId 1 action Drop len 54 if eth0".to_string(),
                "\tipv4 src addr 10.0.0.1 dst addr 10.0.0.2".to_string(),
                "\ttcp srcPort 40000 dstPort 22".to_string(),
            ]
        );
    }

    #[test]
    fn lost_samples_log_one_line_and_no_audit() {
        let outcome = process_record(RawRecord::Lost(12), &interfaces());
        assert!(matches!(outcome, Outcome::Dropped(12)));
        let rendered = outcome.to_string();
        assert_eq!(rendered, "Perf event ring buffer full, dropped 12 samples");
        assert_eq!(rendered.lines().count(), 1);
    }

    #[test]
    fn malformed_records_are_skipped() {
        let short = RawRecord::Sample(Bytes::from_static(&[1, 0, 2]));
        assert!(matches!(
            process_record(short, &interfaces()),
            Outcome::Skipped(EventError::ShortHeader { len: 3 })
        ));

        let hdr = EventHeader {
            if_index: 5,
            rule_id: 1,
            action: XDP_DENY,
            pad: 0,
            pkt_length: 60,
        };
        let mut truncated = hdr.to_bytes().to_vec();
        truncated.extend_from_slice(&[0; 20]);
        assert!(matches!(
            process_record(RawRecord::Sample(truncated.into()), &interfaces()),
            Outcome::Skipped(EventError::ShortPacket {
                expected: 60,
                available: 20,
            })
        ));

        assert!(matches!(
            process_record(deny_tcp_record(9), &interfaces()),
            Outcome::Skipped(EventError::UnknownInterface { index: 9, .. })
        ));
    }

    #[test]
    fn undecodable_payload_still_yields_summary() {
        let hdr = EventHeader {
            if_index: 5,
            rule_id: 7,
            action: 9,
            pad: 0,
            pkt_length: 4,
        };
        let mut sample = hdr.to_bytes().to_vec();
        sample.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let Outcome::Audit(lines) = process_record(RawRecord::Sample(sample.into()), &interfaces())
        else {
            panic!("expected audit lines");
        };
        assert_eq!(lines, vec!["ruleId 7 action Invalid action 9 len 4 if eth0".to_string()]);
    }

    #[tokio::test]
    async fn closed_reader_returns_sentinel() {
        let (tx, mut reader, closer) = record_channel();
        assert!(tx.send(Ok(RawRecord::Lost(1))).await);
        assert_eq!(reader.read().await, Ok(RawRecord::Lost(1)));

        assert!(tx.send(Err(ReadError::Io("EINTR".into()))).await);
        assert_eq!(reader.read().await, Err(ReadError::Io("EINTR".into())));

        closer.close();
        assert_eq!(reader.read().await, Err(ReadError::Closed));
        assert_eq!(reader.read().await, Err(ReadError::Closed));
    }

    #[tokio::test]
    async fn pipeline_runs_until_shutdown() {
        let (tx, reader, closer) = record_channel();
        let sink = RecordingSink::default();
        let audit = sink.clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handle = start_pipeline(
            reader,
            closer,
            move || Ok(sink.clone()),
            interfaces(),
            async move {
                let _ = stop_rx.await;
            },
            RetryPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(handle.state(), PipelineState::Running);

        assert!(tx.send(Ok(RawRecord::Lost(3))).await);
        assert!(tx.send(Err(ReadError::Io("transient".into()))).await);
        assert!(tx.send(Ok(deny_tcp_record(5))).await);
        while audit.lines().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(audit.lines()[0], "ruleId 1 action Drop len 54 if eth0");

        let mut state = handle.subscribe();
        stop_tx.send(()).unwrap();
        state
            .wait_for(|s| *s == PipelineState::Stopped)
            .await
            .unwrap();
        handle.join().await;

        assert_eq!(audit.lines().len(), 3);
        assert!(!tx.send(Ok(RawRecord::Lost(1))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_starts_nothing() {
        let (tx, reader, closer) = record_channel();
        let result = start_pipeline::<RecordingSink, _, _, _>(
            reader,
            closer,
            || Err(Error::Sink("no syslog".into())),
            interfaces(),
            std::future::pending(),
            RetryPolicy {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(3),
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Sink(_))));
        assert!(!tx.send(Ok(RawRecord::Lost(1))).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn immediate_shutdown_always_ends_stopped() {
        for _ in 0..200 {
            let (_tx, reader, closer) = record_channel();
            let handle = start_pipeline(
                reader,
                closer,
                || Ok(RecordingSink::default()),
                interfaces(),
                std::future::ready(()),
                RetryPolicy::default(),
            )
            .await
            .unwrap();
            let state = handle.subscribe();
            handle.join().await;
            assert_eq!(*state.borrow(), PipelineState::Stopped);
        }
    }

    /// Fails the first `failures` opens, then forwards one lost count per open.
    struct FlakySource {
        failures: usize,
        opened: usize,
    }

    impl RecordSource for FlakySource {
        fn spawn_readers(&mut self, sender: RecordSender) -> Result<Vec<JoinHandle<()>>> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(Error::kernel(
                    "Failed creating perf event reader on cpu 0",
                    io::Error::from(io::ErrorKind::ResourceBusy),
                ));
            }
            self.opened += 1;
            Ok(vec![tokio::spawn(async move {
                sender.send(Ok(RawRecord::Lost(1))).await;
                std::future::pending::<()>().await;
            })])
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn feed_can_be_restarted_after_a_failed_open() {
        let mut feed = EventFeed::new(FlakySource {
            failures: 1,
            opened: 0,
        });

        let err = feed
            .start(
                || Ok(RecordingSink::default()),
                interfaces(),
                std::future::pending(),
                quick_retry(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Kernel { .. }));
        assert!(!feed.is_started());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = feed
            .start(
                || Ok(RecordingSink::default()),
                interfaces(),
                async move {
                    let _ = stop_rx.await;
                },
                quick_retry(),
            )
            .await
            .unwrap();
        assert!(feed.is_started());
        assert_eq!(feed.source.opened, 1);

        let again = feed
            .start(
                || Ok(RecordingSink::default()),
                interfaces(),
                std::future::pending(),
                quick_retry(),
            )
            .await;
        assert!(matches!(again, Err(Error::PipelineRunning)));

        stop_tx.send(()).unwrap();
        handle.join().await;
        feed.stop();
    }

    #[tokio::test]
    async fn feed_can_be_restarted_after_sink_failure() {
        let mut feed = EventFeed::new(FlakySource {
            failures: 0,
            opened: 0,
        });

        let err = feed
            .start::<RecordingSink, _, _, _>(
                || Err(Error::Sink("no syslog".into())),
                interfaces(),
                std::future::pending(),
                quick_retry(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Sink(_)));
        assert!(!feed.is_started());
        assert!(feed.tasks.is_empty());

        let handle = feed
            .start(
                || Ok(RecordingSink::default()),
                interfaces(),
                std::future::ready(()),
                quick_retry(),
            )
            .await
            .unwrap();
        assert!(feed.is_started());
        assert_eq!(feed.source.opened, 2);
        handle.join().await;
        feed.stop();
    }
}
