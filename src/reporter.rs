//! Single fan-in point for reported samples: rule evaluation, durable
//! persistence, and external forwarding of anomaly events.
//!
//! Grounded on `original_source/src/apps/agent/anomalies.go`'s
//! `self.reporter.Report("errplane.anomalies", ...)` call shape and
//! spec.md §9's note on breaking the engine/reporter reference cycle: the
//! engine never holds a reporter handle, so `report()` re-enters itself for
//! each `AnomalyFire` the engine hands back instead of the engine emitting
//! directly.

use crate::anomaly::{AnomalyEngine, AnomalyFire};
use crate::clock::now_unix;
use crate::model::Point;
use crate::store::Store;
use futures::future::BoxFuture;
use reqwest::Client;
use std::sync::Arc;
use tracing::error;

/// Metric name the original source and spec.md both check for literally,
/// deliberately *not* host-prefixed unlike every other locally produced
/// metric.
const ANOMALIES_METRIC: &str = "errplane.anomalies";

pub struct Reporter {
    store: Arc<Store>,
    engine: Arc<AnomalyEngine>,
    database: String,
    http: Client,
    external_url: String,
    api_key: String,
}

impl Reporter {
    pub fn new(store: Arc<Store>, engine: Arc<AnomalyEngine>, database: String, external_url: String, api_key: String) -> Self {
        Self {
            store,
            engine,
            database,
            http: Client::new(),
            external_url,
            api_key,
        }
    }

    /// Evaluates `metric` against stat and plugin monitors, persists one
    /// point, and forwards to the external write endpoint when `metric` is
    /// the anomalies sentinel. Re-entrant: fires returned by evaluation are
    /// reported right back through this same method.
    pub fn report(
        &self,
        metric: impl Into<String>,
        value: f64,
        t: i64,
        context: Option<String>,
        dims: Vec<(String, String)>,
    ) -> BoxFuture<'_, ()> {
        let metric = metric.into();
        Box::pin(async move {
            let mut fires = self.engine.evaluate_stat(&metric, value, &dims, t).await;
            fires.extend(self.engine.evaluate_plugin(&metric, context.as_deref(), t).await);

            let mut point = Point::new(t, value).with_dimensions(dims.clone());
            if let Some(ctx) = context.clone() {
                point = point.with_context(ctx);
            }
            if let Err(err) = self.store.write_points(&self.database, &metric, &mut vec![point]).await {
                error!(%metric, error = %err, "failed to persist reported point");
            }

            if metric == ANOMALIES_METRIC {
                self.forward_external(&metric, value, t, context.as_deref(), &dims).await;
            }

            for fire in fires {
                self.emit_fire(fire).await;
            }
        })
    }

    /// Turns an anomaly engine finding into an `errplane.anomalies` report.
    /// Called directly by the log watcher and process supervisor, whose
    /// evaluation paths (`evaluate_log`/`evaluate_process`) don't originate
    /// from a `report()` call in the first place.
    pub fn emit_fire(&self, fire: AnomalyFire) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.report(ANOMALIES_METRIC, fire.value, now_unix(), fire.context, fire.dims).await;
        })
    }

    async fn forward_external(&self, metric: &str, value: f64, t: i64, context: Option<&str>, dims: &[(String, String)]) {
        let url = format!("{}/databases/{}/points?api_key={}", self.external_url.trim_end_matches('/'), self.database, self.api_key);
        let body = serde_json::json!([{
            "name": metric,
            "timestamp": t,
            "value": value,
            "context": context,
            "dimensions": dims,
        }]);
        if let Err(err) = self.http.post(&url).json(&body).send().await {
            error!(%url, error = %err, "failed to forward anomaly externally");
        }
    }
}

#[async_trait::async_trait]
impl crate::collectors::MetricSink for Reporter {
    async fn report(&self, metric: String, value: f64, t: i64, context: Option<String>, dims: Vec<(String, String)>) {
        Reporter::report(self, metric, value, t, context, dims).await
    }
}
