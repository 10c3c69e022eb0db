use dio_core::{DealStatus, StageBenchmark, StagePace, StageProgress};
use serde::Deserialize;

use crate::rules::RuleError;

fn no_penalty() -> f64 {
    1.0
}

/// Scoring parameters for one deal stage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageProfile {
    pub status: DealStatus,
    pub label: String,
    pub base_score: f64,
    pub variance: f64,
    pub typical_days: u32,
    pub success_probability: f64,
    #[serde(default)]
    pub stall_threshold_days: Option<i64>,
    #[serde(default = "no_penalty")]
    pub stall_penalty: f64,
}

impl StageProfile {
    /// Multiplicative time-in-stage factor; 1.0 until the threshold is passed.
    pub fn time_in_stage_factor(&self, days_in_stage: i64) -> f64 {
        match self.stall_threshold_days {
            Some(threshold) if days_in_stage > threshold => self.stall_penalty,
            _ => 1.0,
        }
    }
}

/// Ordered stage list with per-stage parameters, selected by name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageTaxonomy {
    pub name: String,
    pub average_cycle_days: u32,
    pub stages: Vec<StageProfile>,
}

impl StageTaxonomy {
    pub(crate) fn validate(&self) -> Result<(), RuleError> {
        for status in DealStatus::ALL {
            if self.profile(status).is_none() {
                return Err(RuleError::IncompleteTaxonomy {
                    name: self.name.clone(),
                    missing: status.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn profile(&self, status: DealStatus) -> Option<&StageProfile> {
        self.stages.iter().find(|p| p.status == status)
    }

    /// Open stages in taxonomy order.
    pub fn open_stages(&self) -> impl Iterator<Item = &StageProfile> {
        self.stages.iter().filter(|p| !p.status.is_closed())
    }

    pub fn progress(&self, status: DealStatus) -> Option<StageProgress> {
        let profile = self.profile(status)?;
        let open: Vec<&StageProfile> = self.open_stages().collect();
        let total_stages = open.len();
        let (stage_index, percent) = match status {
            DealStatus::ClosedWon => (total_stages, 100),
            DealStatus::ClosedLost => (total_stages, 0),
            _ => {
                let index = open.iter().position(|p| p.status == status)?;
                let percent = ((index + 1) as f64 / total_stages.max(1) as f64 * 100.0).round();
                (index, percent.clamp(0.0, 100.0) as u8)
            }
        };
        Some(StageProgress {
            stage: status,
            stage_label: profile.label.clone(),
            stage_index,
            total_stages,
            percent,
        })
    }

    pub fn benchmark(&self, status: DealStatus, days_in_stage: i64) -> Option<StageBenchmark> {
        let profile = self.profile(status)?;
        let typical = i64::from(profile.typical_days);
        let pace = if typical == 0 || days_in_stage <= typical / 2 {
            StagePace::Ahead
        } else if days_in_stage <= typical {
            StagePace::OnTrack
        } else {
            StagePace::Behind
        };
        Some(StageBenchmark {
            taxonomy: self.name.clone(),
            stage_label: profile.label.clone(),
            typical_stage_days: profile.typical_days,
            days_in_stage,
            success_probability: profile.success_probability,
            average_cycle_days: self.average_cycle_days,
            pace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleBook;

    #[test]
    fn taxonomies_share_one_shape() {
        let rules = RuleBook::builtin().unwrap();
        for name in rules.taxonomy_names() {
            let taxonomy = rules.taxonomy(name).unwrap();
            assert_eq!(taxonomy.open_stages().count(), 4);
            let negotiation = taxonomy.progress(DealStatus::Negotiation).unwrap();
            assert_eq!(negotiation.percent, 100);
            assert_eq!(negotiation.stage_index, 3);
            assert_eq!(taxonomy.progress(DealStatus::Prospecting).unwrap().percent, 25);
        }
        let enterprise = rules.taxonomy("enterprise").unwrap();
        assert_eq!(
            enterprise.profile(DealStatus::Qualified).unwrap().label,
            "Technical Validation"
        );
    }

    #[test]
    fn stall_factor_applies_only_past_threshold() {
        let rules = RuleBook::builtin().unwrap();
        let proposal = rules
            .taxonomy("default")
            .unwrap()
            .profile(DealStatus::Proposal)
            .unwrap()
            .clone();
        assert_eq!(proposal.time_in_stage_factor(21), 1.0);
        assert_eq!(proposal.time_in_stage_factor(22), 0.85);

        let won = rules
            .taxonomy("default")
            .unwrap()
            .profile(DealStatus::ClosedWon)
            .unwrap()
            .clone();
        assert_eq!(won.time_in_stage_factor(900), 1.0);
    }

    #[test]
    fn benchmark_pace_tracks_typical_duration() {
        let rules = RuleBook::builtin().unwrap();
        let taxonomy = rules.taxonomy("default").unwrap();
        let pace = |days| taxonomy.benchmark(DealStatus::Qualified, days).unwrap().pace;
        assert_eq!(pace(5), StagePace::Ahead);
        assert_eq!(pace(15), StagePace::OnTrack);
        assert_eq!(pace(40), StagePace::Behind);
    }

    #[test]
    fn incomplete_taxonomy_is_rejected() {
        let taxonomy = StageTaxonomy {
            name: "thin".into(),
            average_cycle_days: 10,
            stages: vec![],
        };
        assert!(matches!(
            taxonomy.validate(),
            Err(RuleError::IncompleteTaxonomy { .. })
        ));
    }
}
