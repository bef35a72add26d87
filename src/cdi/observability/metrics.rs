/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static DATAIMPORTCRON_OUTDATED: OnceLock<IntGaugeVec> = OnceLock::new();
static INCOMPLETE_STORAGE_PROFILES: OnceLock<IntGauge> = OnceLock::new();
static UPLOAD_TOKENS_ISSUED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DATAVOLUME_PHASE: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("kubevirt_cdi".to_string()), None)
            .expect("failed to initialise cdi metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register cdi metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn controller_reconcile_duration() -> &'static HistogramVec {
    CONTROLLER_RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "controller_reconcile_duration_seconds",
            "Latency distribution of a single reconcile pass",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0]);
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build controller reconcile histogram");
        register_collector(histogram)
    })
}

fn dataimportcron_outdated() -> &'static IntGaugeVec {
    DATAIMPORTCRON_OUTDATED.get_or_init(|| {
        let opts = Opts::new(
            "dataimportcron_outdated",
            "DataImportCron whose managed DataSource lags behind the latest source digest",
        );
        let gauge = IntGaugeVec::new(opts, &["ns", "cron_name", "pending"])
            .expect("failed to build dataimportcron outdated gauge");
        register_collector(gauge)
    })
}

fn incomplete_storage_profiles() -> &'static IntGauge {
    INCOMPLETE_STORAGE_PROFILES.get_or_init(|| {
        let gauge = IntGauge::new(
            "incomplete_storageprofiles",
            "StorageProfiles lacking access and volume mode information",
        )
        .expect("failed to build incomplete storage profile gauge");
        register_collector(gauge)
    })
}

fn upload_tokens_issued_total() -> &'static IntCounterVec {
    UPLOAD_TOKENS_ISSUED_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "upload_tokens_issued_total",
            "Upload token requests grouped by outcome",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("failed to build upload token counter");
        register_collector(counter)
    })
}

fn datavolume_phase() -> &'static IntGaugeVec {
    DATAVOLUME_PHASE.get_or_init(|| {
        let opts = Opts::new("datavolume_phase", "DataVolumes grouped by phase");
        let gauge =
            IntGaugeVec::new(opts, &["phase"]).expect("failed to build datavolume phase gauge");
        register_collector(gauge)
    })
}

#[derive(Copy, Clone, Debug)]
pub enum ControllerReconcileResult {
    Success,
    Requeue,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Requeue => "requeue",
            ControllerReconcileResult::Error => "error",
        }
    }
}

pub fn record_controller_reconcile(
    controller: &str,
    result: ControllerReconcileResult,
    elapsed: Duration,
) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
    controller_reconcile_duration()
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

/// Publishes the outdated flag for a cron; `pending` marks an import still in flight.
pub fn set_dataimportcron_outdated(namespace: &str, cron: &str, pending: bool, outdated: bool) {
    let gauge = dataimportcron_outdated();
    let (active, inactive) = if pending {
        ("true", "false")
    } else {
        ("false", "true")
    };
    gauge
        .with_label_values(&[namespace, cron, active])
        .set(i64::from(outdated));
    let _ = gauge.remove_label_values(&[namespace, cron, inactive]);
}

pub fn clear_dataimportcron(namespace: &str, cron: &str) {
    let gauge = dataimportcron_outdated();
    for pending in ["true", "false"] {
        let _ = gauge.remove_label_values(&[namespace, cron, pending]);
    }
}

pub fn set_incomplete_storage_profiles(count: usize) {
    incomplete_storage_profiles().set(count as i64);
}

pub fn record_upload_token(result: &str) {
    upload_tokens_issued_total()
        .with_label_values(&[result])
        .inc();
}

/// Moves one DataVolume between phase buckets.
pub fn record_datavolume_phase_transition(previous: Option<&str>, next: Option<&str>) {
    if previous == next {
        return;
    }
    let gauge = datavolume_phase();
    if let Some(previous) = previous.filter(|phase| !phase.is_empty()) {
        gauge.with_label_values(&[previous]).dec();
    }
    if let Some(next) = next.filter(|phase| !phase.is_empty()) {
        gauge.with_label_values(&[next]).inc();
    }
}

pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry().gather(), &mut buffer)?;
    Ok(buffer)
}
