use nlq_types::{ExecutionPlan, PlanSource, RiskLevel};
use serde::{Deserialize, Serialize};

/// Declared-cost boundaries; a cost strictly above a bound reaches that level.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskThresholds {
    pub elevated: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            elevated: 500_000.0,
            high: 1_000_000.0,
            critical: 10_000_000.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum GateDecision {
    AutoExecute,
    AwaitConfirmation(String),
}

pub fn level_for_cost(cost: f64, t: &RiskThresholds) -> RiskLevel {
    if cost > t.critical {
        RiskLevel::Critical
    } else if cost > t.high {
        RiskLevel::High
    } else if cost > t.elevated {
        RiskLevel::Elevated
    } else {
        RiskLevel::Low
    }
}

pub fn assess(plan: &ExecutionPlan, t: &RiskThresholds) -> RiskAssessment {
    let mut warnings = plan.warnings.clone();
    let level = match plan.declared_cost {
        Some(cost) => {
            let level = level_for_cost(cost, t);
            match level {
                RiskLevel::Critical => warnings.push(format!(
                    "critical: estimated plan cost {cost:.0} exceeds {:.0}",
                    t.critical
                )),
                RiskLevel::High => warnings.push(format!(
                    "high: estimated plan cost {cost:.0} exceeds {:.0}",
                    t.high
                )),
                RiskLevel::Elevated => warnings.push(format!(
                    "elevated: estimated plan cost {cost:.0} exceeds {:.0}",
                    t.elevated
                )),
                RiskLevel::Low => {}
            }
            level
        }
        None => {
            if plan.source == PlanSource::Unavailable {
                warnings.push("no cost estimate available; executing without a plan check".into());
            }
            RiskLevel::Low
        }
    };
    if plan.full_scans > 0 {
        warnings.push(format!("plan contains {} full table scan(s)", plan.full_scans));
    }
    if plan.cartesian {
        warnings.push("plan contains a cartesian join".into());
    }
    RiskAssessment { level, warnings }
}

/// High and critical plans wait for the caller; the rest run with advisories.
pub fn decide_gate(assessment: &RiskAssessment, confirmed: bool) -> GateDecision {
    if confirmed || !assessment.level.requires_confirmation() {
        return GateDecision::AutoExecute;
    }
    let reason = assessment
        .warnings
        .iter()
        .find(|w| w.starts_with("critical") || w.starts_with("high"))
        .cloned()
        .unwrap_or_else(|| format!("{} risk", assessment.level));
    GateDecision::AwaitConfirmation(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(cost: Option<f64>) -> ExecutionPlan {
        ExecutionPlan {
            declared_cost: cost,
            warnings: Vec::new(),
            affected_tables: vec!["TRAFFIC".into()],
            full_scans: 0,
            cartesian: false,
            source: if cost.is_some() {
                PlanSource::Declared
            } else {
                PlanSource::Unavailable
            },
        }
    }

    #[test]
    fn thresholds_are_exclusive() {
        let t = RiskThresholds::default();
        assert_eq!(level_for_cost(500_000.0, &t), RiskLevel::Low);
        assert_eq!(level_for_cost(500_001.0, &t), RiskLevel::Elevated);
        assert_eq!(level_for_cost(1_000_001.0, &t), RiskLevel::High);
        assert_eq!(level_for_cost(10_000_000.0, &t), RiskLevel::High);
        assert_eq!(level_for_cost(10_000_001.0, &t), RiskLevel::Critical);
    }

    #[test]
    fn critical_warning_names_the_cost() {
        let a = assess(&plan(Some(15_000_000.0)), &RiskThresholds::default());
        assert_eq!(a.level, RiskLevel::Critical);
        assert!(a.warnings.iter().any(|w| w.contains("15000000")));
        assert!(matches!(decide_gate(&a, false), GateDecision::AwaitConfirmation(r) if r.contains("15000000")));
        assert_eq!(decide_gate(&a, true), GateDecision::AutoExecute);
    }

    #[test]
    fn scans_warn_regardless_of_cost() {
        let mut p = plan(Some(10.0));
        p.full_scans = 2;
        p.cartesian = true;
        let a = assess(&p, &RiskThresholds::default());
        assert_eq!(a.level, RiskLevel::Low);
        assert_eq!(a.warnings.len(), 2);
        assert_eq!(decide_gate(&a, false), GateDecision::AutoExecute);
    }

    #[test]
    fn unavailable_plan_is_advisory() {
        let a = assess(&plan(None), &RiskThresholds::default());
        assert_eq!(a.level, RiskLevel::Low);
        assert!(a.warnings[0].contains("no cost estimate"));
    }
}
