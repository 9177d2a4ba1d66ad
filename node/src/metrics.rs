//! # Prometheus Metrics
//!
//! Operational metrics for the vault host, scraped at `/metrics` on the
//! metrics port. Everything lives in a dedicated registry prefixed
//! `guildvault`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use guildvault::{ActionOutcome, TransactionKind, VaultError};

#[derive(Clone)]
pub struct VaultMetrics {
    registry: Registry,
    /// Units deposited, by material.
    pub deposited_units_total: IntCounterVec,
    /// Units withdrawn, by material.
    pub withdrawn_units_total: IntCounterVec,
    /// Actions cancelled because the vault changed under the viewer.
    pub conflicts_total: IntCounter,
    /// Actions refused for lack of permission.
    pub denials_total: IntCounter,
    /// Vaults with at least one open view.
    pub active_sessions: IntGauge,
    pub vaults_formed_total: IntCounter,
    pub vaults_destroyed_total: IntCounter,
    /// Slots written by periodic flushes.
    pub flushed_slots_total: IntCounter,
    /// Time spent applying a viewer action, in seconds.
    pub action_latency_seconds: Histogram,
}

impl VaultMetrics {
    /// Creates and registers every metric.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("guildvault".into()), None)?;

        let deposited_units_total = IntCounterVec::new(
            Opts::new("deposited_units_total", "Item units deposited into vaults"),
            &["material"],
        )?;
        registry.register(Box::new(deposited_units_total.clone()))?;

        let withdrawn_units_total = IntCounterVec::new(
            Opts::new("withdrawn_units_total", "Item units withdrawn from vaults"),
            &["material"],
        )?;
        registry.register(Box::new(withdrawn_units_total.clone()))?;

        let conflicts_total = IntCounter::new(
            "conflicts_total",
            "Viewer actions cancelled by a concurrent change",
        )?;
        registry.register(Box::new(conflicts_total.clone()))?;

        let denials_total =
            IntCounter::new("denials_total", "Viewer actions refused by permissions")?;
        registry.register(Box::new(denials_total.clone()))?;

        let active_sessions =
            IntGauge::new("active_sessions", "Vaults with at least one open view")?;
        registry.register(Box::new(active_sessions.clone()))?;

        let vaults_formed_total = IntCounter::new("vaults_formed_total", "Vaults formed")?;
        registry.register(Box::new(vaults_formed_total.clone()))?;

        let vaults_destroyed_total =
            IntCounter::new("vaults_destroyed_total", "Vaults destroyed")?;
        registry.register(Box::new(vaults_destroyed_total.clone()))?;

        let flushed_slots_total =
            IntCounter::new("flushed_slots_total", "Slots written by periodic flushes")?;
        registry.register(Box::new(flushed_slots_total.clone()))?;

        let action_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "action_latency_seconds",
                "Time to apply a viewer action, including storage and audit",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )?;
        registry.register(Box::new(action_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            deposited_units_total,
            withdrawn_units_total,
            conflicts_total,
            denials_total,
            active_sessions,
            vaults_formed_total,
            vaults_destroyed_total,
            flushed_slots_total,
            action_latency_seconds,
        })
    }

    /// Counts the units an applied action moved, from its audit rows.
    pub fn record_outcome(&self, outcome: &ActionOutcome) {
        for tx in &outcome.transactions {
            let counter = match tx.kind {
                TransactionKind::Deposit => &self.deposited_units_total,
                TransactionKind::Withdraw => &self.withdrawn_units_total,
            };
            counter
                .with_label_values(&[tx.material.as_str()])
                .inc_by(u64::from(tx.amount));
        }
    }

    pub fn record_error(&self, error: &VaultError) {
        match error {
            VaultError::Conflict { .. } => self.conflicts_total.inc(),
            VaultError::PermissionDenied(_) => self.denials_total.inc(),
            _ => {}
        }
    }

    /// Renders every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<VaultMetrics>;

/// `GET /metrics`.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guildvault::{ActionKind, ActorId, Denial, ItemStack, Material, NewTransaction, VaultId};

    #[test]
    fn outcome_counts_units_by_material() {
        let metrics = VaultMetrics::new().unwrap();
        let vault_id = VaultId::new();
        let actor = ActorId::new();
        let diamonds = ItemStack::new(Material::new("DIAMOND").unwrap(), 12).unwrap();
        let outcome = ActionOutcome {
            kind: ActionKind::HotbarSwap,
            withdrawn: Some(diamonds.clone()),
            deposited: None,
            leftover: None,
            changed: vec![0],
            transactions: vec![
                NewTransaction::withdraw(vault_id, actor, &diamonds).into_transaction(1),
            ],
        };
        metrics.record_outcome(&outcome);

        assert_eq!(
            metrics
                .withdrawn_units_total
                .with_label_values(&["DIAMOND"])
                .get(),
            12
        );
        let text = metrics.encode().unwrap();
        assert!(text.contains("guildvault_withdrawn_units_total{material=\"DIAMOND\"} 12"));
    }

    #[test]
    fn errors_are_classified() {
        let metrics = VaultMetrics::new().unwrap();
        metrics.record_error(&VaultError::Conflict {
            vault_id: VaultId::new(),
            slot: 3,
        });
        metrics.record_error(&VaultError::PermissionDenied(Denial::Withdraw));
        metrics.record_error(&VaultError::InvalidAction("nope".into()));
        assert_eq!(metrics.conflicts_total.get(), 1);
        assert_eq!(metrics.denials_total.get(), 1);
    }
}
