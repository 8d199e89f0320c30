//! Reconnecting duplex connection to the central service: identification on
//! connect, a writer loop that pings when idle, a reader loop dispatching
//! requests, and fixed-delay reconnection on any error.
//!
//! Grounded on `original_source/src/apps/agent/websocket_client.go`'s
//! `writePump`/`readPump` split and identification-on-connect sequencing;
//! `manager/src/state_sync/rpc_client.rs`'s fail-fast, no-backoff retry
//! philosophy informs the fixed (not exponential) reconnect delay.

use super::proto::{Request, Response, SeriesPayload};
use crate::clock::now_unix;
use crate::error::ControlChannelError;
use crate::model::ReadSeriesParams;
use crate::store::snapshot::SnapshotStore;
use crate::store::Store;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const METRICS_RESOLVE_LIMIT: usize = 1000;

pub struct ControlChannel {
    addr: String,
    hostname: String,
    database: String,
    store: Arc<Store>,
    snapshot_store: Arc<SnapshotStore>,
    reload_tx: mpsc::Sender<()>,
    ping_period: Duration,
}

impl ControlChannel {
    pub fn new(
        addr: String,
        hostname: String,
        database: String,
        store: Arc<Store>,
        snapshot_store: Arc<SnapshotStore>,
        reload_tx: mpsc::Sender<()>,
        ping_period: Duration,
    ) -> Self {
        Self { addr, hostname, database, store, snapshot_store, reload_tx, ping_period }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                info!(addr = %self.addr, "connecting to central service");
                if let Err(err) = self.run_once().await {
                    warn!(error = %err, "control channel connection lost, reconnecting");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }

    async fn run_once(&self) -> Result<(), ControlChannelError> {
        let stream = TcpStream::connect(&self.addr).await?;
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (mut sink, mut source) = framed.split();

        send_frame(&mut sink, &Response::identification(self.hostname.clone(), self.database.clone())).await?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Response>(64);
        let writer = tokio::spawn(write_loop(sink, outgoing_rx, self.ping_period));

        let result = self.read_loop(&mut source, outgoing_tx).await;
        writer.abort();
        result
    }

    async fn read_loop(
        &self,
        source: &mut (impl futures::Stream<Item = Result<bytes::BytesMut, std::io::Error>> + Unpin),
        outgoing_tx: mpsc::Sender<Response>,
    ) -> Result<(), ControlChannelError> {
        loop {
            let next = tokio::time::timeout(self.ping_period, source.next()).await.map_err(|_| ControlChannelError::ReadTimeout)?;
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(ControlChannelError::ReadTimeout),
            };
            let request: Request = serde_json::from_slice(&frame)?;
            if let Err(err) = self.dispatch(request, &outgoing_tx).await {
                error!(error = %err, "failed to dispatch control channel request");
            }
        }
    }

    async fn dispatch(&self, request: Request, outgoing_tx: &mpsc::Sender<Response>) -> anyhow::Result<()> {
        match request {
            Request::ConfigReload => {
                let _ = self.reload_tx.send(()).await;
            }
            Request::Metrics { start, end, limit, metric_names, metric_regexes } => {
                let series = self.resolve_metrics(start, end, limit, metric_names, metric_regexes).await?;
                let _ = outgoing_tx.send(Response::Metrics { series }).await;
            }
            Request::Snapshot { snapshot_id } => {
                let snapshot = self.snapshot_store.get_snapshot(&snapshot_id)?;
                let _ = outgoing_tx.send(Response::Snapshot { snapshot }).await;
            }
        }
        Ok(())
    }

    async fn resolve_metrics(
        &self,
        start: Option<i64>,
        end: Option<i64>,
        limit: Option<usize>,
        metric_names: Vec<String>,
        metric_regexes: Vec<String>,
    ) -> anyhow::Result<Vec<SeriesPayload>> {
        let since = start.unwrap_or_else(|| now_unix() - 3600);
        let mut names = metric_names;

        if !metric_regexes.is_empty() {
            let regexes: Vec<Regex> = metric_regexes.iter().filter_map(|p| Regex::new(p).ok()).collect();
            let mut matched = Vec::new();
            self.store
                .read_series_index(&self.database, since, |name| {
                    if matched.len() < METRICS_RESOLVE_LIMIT && regexes.iter().any(|re| re.is_match(&name)) {
                        matched.push(name);
                    }
                })
                .await?;
            names.extend(matched);
        }
        names.sort();
        names.dedup();

        let mut series = Vec::with_capacity(names.len());
        for name in names {
            let mut params = ReadSeriesParams::new(self.database.clone(), name.clone(), start.unwrap_or(0));
            params.end = end;
            params.limit = limit;
            let mut points = Vec::new();
            self.store.read_series(&params, |p| { points.push(p); true }).await?;
            series.push(SeriesPayload { name, points });
        }
        Ok(series)
    }
}

async fn send_frame(
    sink: &mut (impl futures::Sink<Bytes, Error = std::io::Error> + Unpin),
    value: &Response,
) -> Result<(), ControlChannelError> {
    let bytes = serde_json::to_vec(value)?;
    sink.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Pings every 9/10 of `ping_period` whenever no other frame has gone out
/// in that window; any send failure ends the loop so the caller reconnects.
async fn write_loop(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
    mut rx: mpsc::Receiver<Response>,
    ping_period: Duration,
) {
    let period = ping_period.mul_f64(0.9);
    let mut next_ping = tokio::time::Instant::now() + period;
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(resp) => {
                        if send_frame(&mut sink, &resp).await.is_err() {
                            return;
                        }
                        next_ping = tokio::time::Instant::now() + period;
                    }
                    None => return,
                }
            }
            _ = tokio::time::sleep_until(next_ping) => {
                if send_frame(&mut sink, &Response::Ping).await.is_err() {
                    return;
                }
                next_ping = tokio::time::Instant::now() + period;
            }
        }
    }
}
