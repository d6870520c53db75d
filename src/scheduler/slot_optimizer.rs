//! Advisory slot utilization tracking.
//!
//! The optimizer samples how many execution slots are in use, keeps a bounded
//! history and turns it into allocation plans, demand predictions, bundling
//! suggestions and cost reports. It never touches queue or worker state.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Samples used for demand prediction.
const PREDICTION_WINDOW: usize = 10;

/// Duration assumed for a bundling candidate with no estimate.
const DEFAULT_BUNDLE_ESTIMATE: Duration = Duration::from_secs(60);

/// Runner minutes a job would cost without optimization.
const UNOPTIMIZED_MINUTES_PER_JOB: f64 = 5.0;

/// Plans needing more batches than this are rated moderate.
const GOOD_BATCH_LIMIT: usize = 3;

/// Configuration for the slot optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotOptimizerConfig {
    /// Total execution slots.
    pub max_slots: usize,
    /// Utilization above which an advisory is raised (0.0 - 1.0).
    pub target_utilization: f64,
    /// Utilization below which slots are considered wasted (0.0 - 1.0).
    pub min_utilization: f64,
    /// Interval between samples.
    pub sample_interval: Duration,
    /// Samples kept in history.
    pub history_limit: usize,
    /// Cost of one runner minute, in dollars.
    pub cost_per_minute: f64,
    /// Default number of jobs per bundle.
    pub bundle_size: usize,
    /// Job duration assumed when planning without an estimate.
    pub default_job_duration: Duration,
}

impl Default for SlotOptimizerConfig {
    fn default() -> Self {
        Self {
            max_slots: 10,
            target_utilization: 0.95,
            min_utilization: 0.70,
            sample_interval: Duration::from_secs(30),
            history_limit: 1000,
            cost_per_minute: 0.008,
            bundle_size: 3,
            default_job_duration: Duration::from_secs(180),
        }
    }
}

impl SlotOptimizerConfig {
    pub fn new(max_slots: usize) -> Self {
        Self {
            max_slots,
            ..Default::default()
        }
    }

    pub fn with_utilization_band(mut self, min: f64, target: f64) -> Self {
        self.min_utilization = min;
        self.target_utilization = target;
        self
    }

    pub fn with_cost_per_minute(mut self, cost: f64) -> Self {
        self.cost_per_minute = cost;
        self
    }
}

/// One utilization observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub timestamp: DateTime<Utc>,
    /// Used share of slots (0.0 - 1.0).
    pub utilization: f64,
    pub used_slots: usize,
    pub available_slots: usize,
    pub queued_jobs: usize,
}

/// Where a sample falls relative to the utilization band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtilizationStatus {
    AboveTarget,
    BelowMinimum,
    WithinBand,
    /// No slot in use.
    Idle,
}

/// How well a plan uses the available slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationEfficiency {
    /// Everything fits in one batch.
    Optimal,
    Good,
    Moderate,
}

/// Plan for running a set of pending jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotAllocation {
    /// Slots to occupy.
    pub allocation: usize,
    /// Sequential batches needed.
    pub batches: usize,
    /// Expected utilization while the plan runs, as a percentage.
    pub utilization_target: f64,
    /// Expected wall time of the plan.
    pub estimated_time: Duration,
    pub efficiency: AllocationEfficiency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Expected slot demand based on recent samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandPrediction {
    pub predicted_slots: usize,
    pub confidence: Confidence,
    /// Mean utilization over the window, as a percentage.
    pub average_utilization: f64,
    /// Predicted demand is at or above 90% of capacity.
    pub high_demand: bool,
    pub recommendation: String,
}

/// A job considered for bundling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleCandidate {
    pub job_id: String,
    #[serde(default)]
    pub estimated_duration: Option<Duration>,
}

impl BundleCandidate {
    pub fn new(job_id: impl Into<String>, estimated_duration: Option<Duration>) -> Self {
        Self {
            job_id: job_id.into(),
            estimated_duration,
        }
    }

    fn estimate(&self) -> Duration {
        self.estimated_duration.unwrap_or(DEFAULT_BUNDLE_ESTIMATE)
    }
}

/// Result of grouping jobs into bundles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlePlan {
    pub bundles: Vec<Vec<BundleCandidate>>,
    pub bundling_applied: bool,
    /// Slots saved versus one slot per job.
    pub slot_savings: usize,
    /// Savings as a percentage of the job count.
    pub efficiency_gain: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EfficiencyRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl EfficiencyRating {
    fn from_utilization(utilization: f64) -> Self {
        if utilization >= 0.85 {
            EfficiencyRating::Excellent
        } else if utilization >= 0.70 {
            EfficiencyRating::Good
        } else if utilization >= 0.50 {
            EfficiencyRating::Fair
        } else {
            EfficiencyRating::Poor
        }
    }
}

/// Runner cost summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEfficiency {
    pub total_runner_minutes: f64,
    pub total_cost: f64,
    /// Mean utilization over the history, as a percentage.
    pub average_utilization: f64,
    pub cost_per_job: f64,
    /// Savings versus a fixed per-job runner cost.
    pub estimated_savings: f64,
    pub rating: EfficiencyRating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Underutilization,
    Overutilization,
    Capacity,
    Optimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
    pub action: String,
}

impl Recommendation {
    fn new(kind: RecommendationKind, message: &str, action: &str) -> Self {
        Self {
            kind,
            message: message.to_string(),
            action: action.to_string(),
        }
    }
}

/// Periodic utilization report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationReport {
    pub timestamp: DateTime<Utc>,
    pub max_slots: usize,
    pub used_slots: usize,
    pub available_slots: usize,
    pub peak_usage: usize,
    /// Current, target and average utilization, as percentages.
    pub current_utilization: f64,
    pub target_utilization: f64,
    pub average_utilization: f64,
    pub jobs_executed: u64,
    pub queued_jobs: usize,
    pub cost: CostEfficiency,
    pub recommendations: Vec<Recommendation>,
}

/// Tracks slot utilization and produces advisories.
#[derive(Debug)]
pub struct SlotOptimizer {
    config: SlotOptimizerConfig,
    used_slots: usize,
    available_slots: usize,
    queued_jobs: usize,
    peak_usage: usize,
    history: VecDeque<UtilizationSample>,
    jobs_executed: u64,
    runner_minutes: f64,
}

impl SlotOptimizer {
    pub fn new(config: SlotOptimizerConfig) -> Self {
        Self {
            available_slots: config.max_slots,
            config,
            used_slots: 0,
            queued_jobs: 0,
            peak_usage: 0,
            history: VecDeque::new(),
            jobs_executed: 0,
            runner_minutes: 0.0,
        }
    }

    pub fn config(&self) -> &SlotOptimizerConfig {
        &self.config
    }

    fn utilization_of(&self, used: usize) -> f64 {
        if self.config.max_slots == 0 {
            return 0.0;
        }
        used as f64 / self.config.max_slots as f64
    }

    /// Records a sample at the current time.
    pub fn record_sample(&mut self, used_slots: usize, queued_jobs: usize) -> UtilizationStatus {
        self.record_sample_at(used_slots, queued_jobs, Utc::now())
    }

    /// Records a sample taken at `now` and classifies it.
    pub fn record_sample_at(&mut self, used_slots: usize, queued_jobs: usize, now: DateTime<Utc>) -> UtilizationStatus {
        let available_slots = self.config.max_slots.saturating_sub(used_slots);
        let utilization = self.utilization_of(used_slots);

        self.used_slots = used_slots;
        self.available_slots = available_slots;
        self.queued_jobs = queued_jobs;
        self.peak_usage = self.peak_usage.max(used_slots);

        self.history.push_back(UtilizationSample {
            timestamp: now,
            utilization,
            used_slots,
            available_slots,
            queued_jobs,
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }

        debug!(
            used_slots,
            available_slots,
            queued_jobs,
            utilization = utilization * 100.0,
            "Slot sample recorded"
        );

        if utilization > self.config.target_utilization {
            warn!(
                current = utilization * 100.0,
                target = self.config.target_utilization * 100.0,
                "Slot utilization above target"
            );
            UtilizationStatus::AboveTarget
        } else if used_slots == 0 {
            UtilizationStatus::Idle
        } else if utilization < self.config.min_utilization {
            info!(
                current = utilization * 100.0,
                minimum = self.config.min_utilization * 100.0,
                "Slot utilization below minimum, consider fewer parallel jobs or bundling"
            );
            UtilizationStatus::BelowMinimum
        } else {
            UtilizationStatus::WithinBand
        }
    }

    /// Plans slots for `pending_jobs` taking `estimated_job_time` each.
    ///
    /// With no free slot the plan assumes a single slot frees up.
    pub fn calculate_allocation(&self, pending_jobs: usize, estimated_job_time: Option<Duration>) -> SlotAllocation {
        let job_time = estimated_job_time.unwrap_or(self.config.default_job_duration);
        let capacity = self.available_slots.max(1);

        if pending_jobs <= capacity {
            return SlotAllocation {
                allocation: pending_jobs,
                batches: usize::from(pending_jobs > 0),
                utilization_target: self.utilization_of(pending_jobs) * 100.0,
                estimated_time: job_time,
                efficiency: AllocationEfficiency::Optimal,
            };
        }

        let batches = pending_jobs.div_ceil(capacity);
        let estimated_time = job_time.saturating_mul(u32::try_from(batches).unwrap_or(u32::MAX));

        SlotAllocation {
            allocation: capacity,
            batches,
            utilization_target: self.config.target_utilization * 100.0,
            estimated_time,
            efficiency: if batches <= GOOD_BATCH_LIMIT {
                AllocationEfficiency::Good
            } else {
                AllocationEfficiency::Moderate
            },
        }
    }

    /// Predicts slot demand from the most recent samples.
    pub fn predict_demand(&self) -> DemandPrediction {
        let max_slots = self.config.max_slots as f64;

        if self.history.is_empty() {
            return DemandPrediction {
                predicted_slots: (max_slots * 0.5).ceil() as usize,
                confidence: Confidence::Low,
                average_utilization: 0.0,
                high_demand: false,
                recommendation: "Insufficient historical data".to_string(),
            };
        }

        let window: Vec<&UtilizationSample> = self.history.iter().rev().take(PREDICTION_WINDOW).collect();
        let average = window.iter().map(|s| s.utilization).sum::<f64>() / window.len() as f64;
        let predicted_slots = (max_slots * average).ceil() as usize;

        let confidence = if window.len() >= PREDICTION_WINDOW {
            Confidence::High
        } else if window.len() < 5 {
            Confidence::Low
        } else {
            Confidence::Medium
        };

        let high_demand = predicted_slots as f64 >= max_slots * 0.9;
        DemandPrediction {
            predicted_slots,
            confidence,
            average_utilization: average * 100.0,
            high_demand,
            recommendation: if high_demand {
                "High demand expected, consider increasing max slots".to_string()
            } else {
                "Normal demand expected".to_string()
            },
        }
    }

    /// Groups candidates into bundles when there are more than slots.
    ///
    /// Candidates are sorted by estimated duration so short jobs share
    /// bundles. `bundle_size` defaults to the configured size.
    pub fn bundle_jobs(&self, candidates: Vec<BundleCandidate>, bundle_size: Option<usize>) -> BundlePlan {
        if candidates.len() <= self.config.max_slots {
            return BundlePlan {
                bundles: candidates.into_iter().map(|c| vec![c]).collect(),
                bundling_applied: false,
                slot_savings: 0,
                efficiency_gain: 0.0,
            };
        }

        let size = bundle_size.unwrap_or(self.config.bundle_size).max(1);
        let total = candidates.len();

        let mut sorted = candidates;
        sorted.sort_by_key(BundleCandidate::estimate);

        let bundles: Vec<Vec<BundleCandidate>> = sorted.chunks(size).map(|chunk| chunk.to_vec()).collect();
        let slot_savings = total - bundles.len();

        debug!(jobs = total, bundles = bundles.len(), slot_savings, "Jobs bundled");
        BundlePlan {
            bundles,
            bundling_applied: true,
            slot_savings,
            efficiency_gain: slot_savings as f64 / total as f64 * 100.0,
        }
    }

    /// Records runner time consumed by a finished job.
    pub fn record_job_execution(&mut self, job_id: &str, runner_minutes: f64) {
        self.jobs_executed += 1;
        self.runner_minutes += runner_minutes.max(0.0);

        debug!(
            job_id = %job_id,
            runner_minutes,
            total_cost = self.runner_minutes * self.config.cost_per_minute,
            "Job execution recorded"
        );
    }

    /// Mean utilization over the whole history (0.0 - 1.0).
    pub fn average_utilization(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().map(|s| s.utilization).sum::<f64>() / self.history.len() as f64
    }

    pub fn cost_efficiency(&self) -> CostEfficiency {
        let average = self.average_utilization();
        let total_cost = self.runner_minutes * self.config.cost_per_minute;
        let unoptimized = self.jobs_executed as f64 * UNOPTIMIZED_MINUTES_PER_JOB * self.config.cost_per_minute;

        CostEfficiency {
            total_runner_minutes: self.runner_minutes,
            total_cost,
            average_utilization: average * 100.0,
            cost_per_job: if self.jobs_executed > 0 {
                total_cost / self.jobs_executed as f64
            } else {
                0.0
            },
            estimated_savings: unoptimized - total_cost,
            rating: EfficiencyRating::from_utilization(average),
        }
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        let average = self.average_utilization();
        let mut recommendations = Vec::new();

        if average < self.config.min_utilization {
            recommendations.push(Recommendation::new(
                RecommendationKind::Underutilization,
                "Average slot utilization is below minimum threshold",
                "Consider reducing max parallel jobs or bundling jobs",
            ));
        }
        if average > self.config.target_utilization {
            recommendations.push(Recommendation::new(
                RecommendationKind::Overutilization,
                "Average slot utilization exceeds target",
                "Consider increasing max parallel slots if budget allows",
            ));
        }
        if self.config.max_slots > 0 && self.peak_usage >= self.config.max_slots {
            recommendations.push(Recommendation::new(
                RecommendationKind::Capacity,
                "Peak usage reached maximum slot capacity",
                "Monitor for queued jobs and consider capacity planning",
            ));
        }
        if recommendations.is_empty() {
            recommendations.push(Recommendation::new(
                RecommendationKind::Optimal,
                "Slot utilization is within optimal range",
                "Continue monitoring",
            ));
        }

        recommendations
    }

    pub fn utilization_report(&self) -> UtilizationReport {
        self.utilization_report_at(Utc::now())
    }

    pub fn utilization_report_at(&self, now: DateTime<Utc>) -> UtilizationReport {
        let report = UtilizationReport {
            timestamp: now,
            max_slots: self.config.max_slots,
            used_slots: self.used_slots,
            available_slots: self.available_slots,
            peak_usage: self.peak_usage,
            current_utilization: self.utilization_of(self.used_slots) * 100.0,
            target_utilization: self.config.target_utilization * 100.0,
            average_utilization: self.average_utilization() * 100.0,
            jobs_executed: self.jobs_executed,
            queued_jobs: self.queued_jobs,
            cost: self.cost_efficiency(),
            recommendations: self.recommendations(),
        };

        info!(
            used_slots = report.used_slots,
            peak_usage = report.peak_usage,
            average_utilization = report.average_utilization,
            jobs_executed = report.jobs_executed,
            total_cost = report.cost.total_cost,
            "Slot utilization report"
        );
        report
    }

    /// Samples currently held, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &UtilizationSample> {
        self.history.iter()
    }

    pub fn peak_usage(&self) -> usize {
        self.peak_usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> SlotOptimizer {
        SlotOptimizer::new(SlotOptimizerConfig::default())
    }

    #[test]
    fn test_sample_classification() {
        let mut opt = optimizer();
        assert_eq!(opt.record_sample(0, 0), UtilizationStatus::Idle);
        assert_eq!(opt.record_sample(3, 0), UtilizationStatus::BelowMinimum);
        assert_eq!(opt.record_sample(8, 2), UtilizationStatus::WithinBand);
        assert_eq!(opt.record_sample(10, 5), UtilizationStatus::AboveTarget);
        assert_eq!(opt.peak_usage(), 10);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut opt = SlotOptimizer::new(SlotOptimizerConfig {
            history_limit: 5,
            ..Default::default()
        });
        for used in 0..8 {
            opt.record_sample(used, 0);
        }
        let used: Vec<usize> = opt.history().map(|s| s.used_slots).collect();
        assert_eq!(used, vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_allocation_fits_in_one_batch() {
        let opt = optimizer();
        let plan = opt.calculate_allocation(4, Some(Duration::from_secs(120)));
        assert_eq!(plan.allocation, 4);
        assert_eq!(plan.batches, 1);
        assert_eq!(plan.efficiency, AllocationEfficiency::Optimal);
        assert_eq!(plan.estimated_time, Duration::from_secs(120));
        assert!((plan.utilization_target - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_allocation_batches() {
        let mut opt = optimizer();
        opt.record_sample(6, 0);

        let plan = opt.calculate_allocation(10, None);
        assert_eq!(plan.allocation, 4);
        assert_eq!(plan.batches, 3);
        assert_eq!(plan.efficiency, AllocationEfficiency::Good);
        assert_eq!(plan.estimated_time, Duration::from_secs(540));

        let plan = opt.calculate_allocation(17, None);
        assert_eq!(plan.batches, 5);
        assert_eq!(plan.efficiency, AllocationEfficiency::Moderate);
    }

    #[test]
    fn test_allocation_with_no_free_slot() {
        let mut opt = optimizer();
        opt.record_sample(10, 3);
        let plan = opt.calculate_allocation(3, Some(Duration::from_secs(60)));
        assert_eq!(plan.allocation, 1);
        assert_eq!(plan.batches, 3);
    }

    #[test]
    fn test_predict_demand() {
        let mut opt = optimizer();
        let empty = opt.predict_demand();
        assert_eq!(empty.predicted_slots, 5);
        assert_eq!(empty.confidence, Confidence::Low);

        for _ in 0..6 {
            opt.record_sample(5, 0);
        }
        let medium = opt.predict_demand();
        assert_eq!(medium.predicted_slots, 5);
        assert_eq!(medium.confidence, Confidence::Medium);
        assert!(!medium.high_demand);

        for _ in 0..10 {
            opt.record_sample(10, 4);
        }
        let high = opt.predict_demand();
        assert_eq!(high.predicted_slots, 10);
        assert_eq!(high.confidence, Confidence::High);
        assert!(high.high_demand);
    }

    #[test]
    fn test_bundling_only_when_oversubscribed() {
        let opt = SlotOptimizer::new(SlotOptimizerConfig::new(2));

        let few = opt.bundle_jobs(vec![BundleCandidate::new("a", None)], None);
        assert!(!few.bundling_applied);
        assert_eq!(few.bundles.len(), 1);

        let candidates = vec![
            BundleCandidate::new("slow", Some(Duration::from_secs(600))),
            BundleCandidate::new("quick", Some(Duration::from_secs(10))),
            BundleCandidate::new("unknown", None),
            BundleCandidate::new("mid", Some(Duration::from_secs(120))),
        ];
        let plan = opt.bundle_jobs(candidates, Some(3));
        assert!(plan.bundling_applied);
        assert_eq!(plan.bundles.len(), 2);
        let first: Vec<&str> = plan.bundles[0].iter().map(|c| c.job_id.as_str()).collect();
        assert_eq!(first, vec!["quick", "unknown", "mid"]);
        assert_eq!(plan.slot_savings, 2);
        assert!((plan.efficiency_gain - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_efficiency() {
        let mut opt = optimizer();
        opt.record_sample(9, 0);
        opt.record_job_execution("a", 2.0);
        opt.record_job_execution("b", 3.0);

        let cost = opt.cost_efficiency();
        assert!((cost.total_cost - 0.04).abs() < 1e-9);
        assert!((cost.cost_per_job - 0.02).abs() < 1e-9);
        assert!((cost.estimated_savings - 0.04).abs() < 1e-9);
        assert_eq!(cost.rating, EfficiencyRating::Excellent);
    }

    #[test]
    fn test_recommendations() {
        let mut opt = optimizer();
        let kinds: Vec<RecommendationKind> = opt.recommendations().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RecommendationKind::Underutilization]);

        opt.record_sample(10, 0);
        let kinds: Vec<RecommendationKind> = opt.recommendations().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![RecommendationKind::Overutilization, RecommendationKind::Capacity]
        );

        let mut opt = optimizer();
        opt.record_sample(8, 0);
        let kinds: Vec<RecommendationKind> = opt.recommendations().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RecommendationKind::Optimal]);
    }

    #[test]
    fn test_utilization_report() {
        let mut opt = optimizer();
        opt.record_sample(4, 2);
        opt.record_sample(6, 1);
        opt.record_job_execution("a", 1.5);

        let report = opt.utilization_report();
        assert_eq!(report.used_slots, 6);
        assert_eq!(report.available_slots, 4);
        assert_eq!(report.peak_usage, 6);
        assert_eq!(report.queued_jobs, 1);
        assert_eq!(report.jobs_executed, 1);
        assert!((report.average_utilization - 50.0).abs() < 1e-9);
        assert!(!report.recommendations.is_empty());
    }
}
