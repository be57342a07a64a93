use std::fmt::Write as _;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::period::extract_period;
use crate::PolicyError;

const BUILTIN_RULES: &str = include_str!("../rules/default.yaml");

/// Versioned rule data: preferred views, forbidden patterns, intent templates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: String,
    /// Year used when a question names a month but no year.
    #[serde(default)]
    pub default_year: Option<i32>,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub preferred_views: Vec<PreferredView>,
    #[serde(default)]
    pub forbidden_patterns: Vec<ForbiddenPattern>,
    #[serde(default)]
    pub intents: Vec<Intent>,
    #[serde(default)]
    pub period_semantics: Vec<PeriodSemantic>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreferredView {
    pub intent: String,
    pub view: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForbiddenPattern {
    pub id: String,
    /// Case-insensitive regex over the sanitized statement.
    pub pattern: String,
    pub reason: String,
    #[serde(default = "default_repairable")]
    pub repairable: bool,
}

fn default_repairable() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    /// Lower-case substrings; any one matching the question selects the intent.
    pub keywords: Vec<String>,
    /// Canonical statement; `{period}` is replaced by `YYYY-MM`.
    pub template: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeriodSemantic {
    pub phrase: String,
    pub meaning: String,
}

impl RuleSet {
    pub fn builtin() -> Result<Self, PolicyError> {
        Self::from_yaml(BUILTIN_RULES)
    }

    pub fn from_yaml(text: &str) -> Result<Self, PolicyError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path).map_err(|e| PolicyError::Io(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Compile every pattern. Fails on the first invalid regex.
    pub fn compile(self) -> Result<RuleCatalog, PolicyError> {
        let mut patterns = Vec::with_capacity(self.forbidden_patterns.len());
        for fp in &self.forbidden_patterns {
            let re = RegexBuilder::new(&fp.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| PolicyError::Pattern {
                    id: fp.id.clone(),
                    message: e.to_string(),
                })?;
            patterns.push(re);
        }
        Ok(RuleCatalog { rules: self, patterns })
    }
}

/// Outcome of reviewing one sanitized statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Review {
    Clean,
    Repaired { rule: String, intent: String, sql: String },
    Rejected { rule: String, reason: String },
}

/// A rule set with compiled patterns.
#[derive(Clone, Debug)]
pub struct RuleCatalog {
    rules: RuleSet,
    patterns: Vec<Regex>,
}

impl RuleCatalog {
    pub fn builtin() -> Result<Self, PolicyError> {
        RuleSet::builtin()?.compile()
    }

    pub fn version(&self) -> &str {
        &self.rules.version
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn default_year(&self) -> i32 {
        use chrono::Datelike;
        self.rules
            .default_year
            .unwrap_or_else(|| chrono::Utc::now().year())
    }

    /// First forbidden pattern matching `sql`, in declaration order.
    pub fn first_violation(&self, sql: &str) -> Option<&ForbiddenPattern> {
        self.rules
            .forbidden_patterns
            .iter()
            .zip(&self.patterns)
            .find(|(_, re)| re.is_match(sql))
            .map(|(fp, _)| fp)
    }

    pub fn match_intent(&self, question: &str) -> Option<&Intent> {
        let q = question.to_lowercase();
        self.rules
            .intents
            .iter()
            .find(|intent| intent.keywords.iter().any(|k| q.contains(&k.to_lowercase())))
    }

    /// Validate `sql` and substitute the intent template when a repairable
    /// pattern fires. Anything else that fires is rejected.
    pub fn review(&self, question: &str, sql: &str) -> Review {
        let Some(violation) = self.first_violation(sql) else {
            return Review::Clean;
        };
        let reject = |reason: String| Review::Rejected {
            rule: violation.id.clone(),
            reason,
        };
        if !violation.repairable {
            return reject(violation.reason.clone());
        }
        let Some(intent) = self.match_intent(question) else {
            return reject(format!("{}; no canonical query for this question", violation.reason));
        };
        let sql = if intent.template.contains("{period}") {
            match extract_period(question, self.default_year()) {
                Some(period) => intent.template.replace("{period}", &period),
                None => {
                    return reject(format!(
                        "{}; question names no period for template '{}'",
                        violation.reason, intent.id
                    ))
                }
            }
        } else {
            intent.template.clone()
        };
        tracing::info!(rule = %violation.id, intent = %intent.id, "statement repaired from canonical template");
        Review::Repaired {
            rule: violation.id.clone(),
            intent: intent.id.clone(),
            sql,
        }
    }

    /// Rule text placed ahead of the examples in the model instruction.
    pub fn render_instructions(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Rule set version {}.", self.rules.version);
        for line in &self.rules.instructions {
            let _ = writeln!(out, "- {line}");
        }
        if !self.rules.preferred_views.is_empty() {
            out.push_str("\nPreferred views:\n");
            for pv in &self.rules.preferred_views {
                let _ = writeln!(out, "- {}: use {}. {}", pv.intent, pv.view, pv.note);
            }
        }
        if !self.rules.forbidden_patterns.is_empty() {
            out.push_str("\nNever do the following:\n");
            for fp in &self.rules.forbidden_patterns {
                let _ = writeln!(out, "- {} ({})", fp.id, fp.reason);
            }
        }
        if !self.rules.period_semantics.is_empty() {
            out.push_str("\nPeriod semantics:\n");
            for ps in &self.rules.period_semantics {
                let _ = writeln!(out, "- \"{}\" means {}", ps.phrase, ps.meaning);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANNED: &str = "SELECT c.CLIENT_ID, SUM(r.COST) FROM CLIENTS c JOIN COST_ALLOCATION_RAW r ON r.CLIENT_ID = c.CLIENT_ID GROUP BY c.CLIENT_ID";

    #[test]
    fn builtin_rules_compile() {
        let catalog = RuleCatalog::builtin().unwrap();
        assert!(!catalog.version().is_empty());
        assert!(!catalog.rules().intents.is_empty());
        assert_eq!(catalog.default_year(), 2025);
    }

    #[test]
    fn loss_question_is_repaired() {
        let catalog = RuleCatalog::builtin().unwrap();
        let review = catalog.review("Найди убыточных клиентов за октябрь", BANNED);
        assert_eq!(
            review,
            Review::Repaired {
                rule: "cost_allocation_raw_join".into(),
                intent: "unprofitable_customers".into(),
                sql: "SELECT * FROM V_UNPROFITABLE_CUSTOMERS WHERE PERIOD = '2025-10' AND ALERT_TYPE = 'LOSS' ORDER BY PROFIT_RUB ASC".into(),
            }
        );
    }

    #[test]
    fn unknown_intent_fails_closed() {
        let catalog = RuleCatalog::builtin().unwrap();
        let review = catalog.review("Сколько звонков было за октябрь", BANNED);
        assert!(matches!(review, Review::Rejected { .. }));
    }

    #[test]
    fn missing_period_fails_closed() {
        let catalog = RuleCatalog::builtin().unwrap();
        let review = catalog.review("Найди убыточных клиентов", BANNED);
        assert!(matches!(review, Review::Rejected { .. }));
    }

    #[test]
    fn clean_sql_passes() {
        let catalog = RuleCatalog::builtin().unwrap();
        let sql = "SELECT * FROM V_UNPROFITABLE_CUSTOMERS WHERE PERIOD = '2025-09'";
        assert_eq!(catalog.review("убыточные клиенты за сентябрь", sql), Review::Clean);
    }

    #[test]
    fn low_margin_checked_before_loss() {
        let catalog = RuleCatalog::builtin().unwrap();
        let intent = catalog.match_intent("Клиенты с низкой маржой за май").unwrap();
        assert_eq!(intent.id, "low_margin_customers");
    }

    #[test]
    fn non_repairable_rule_rejects_even_with_intent() {
        let yaml = r#"
version: "t1"
default_year: 2024
forbidden_patterns:
  - id: cross_join
    pattern: '\bCROSS\s+JOIN\b'
    reason: cartesian product
    repairable: false
intents:
  - id: loss
    keywords: [loss]
    template: "SELECT 1"
"#;
        let catalog = RuleSet::from_yaml(yaml).unwrap().compile().unwrap();
        let review = catalog.review("loss in may", "SELECT * FROM a cross join b");
        assert_eq!(
            review,
            Review::Rejected {
                rule: "cross_join".into(),
                reason: "cartesian product".into()
            }
        );
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let yaml = "version: x\nforbidden_patterns:\n  - {id: broken, pattern: '(', reason: r}\n";
        let err = RuleSet::from_yaml(yaml).unwrap().compile().unwrap_err();
        assert!(matches!(err, PolicyError::Pattern { ref id, .. } if id == "broken"));
    }

    #[test]
    fn instructions_list_every_section() {
        let catalog = RuleCatalog::builtin().unwrap();
        let text = catalog.render_instructions();
        assert!(text.contains("V_UNPROFITABLE_CUSTOMERS"));
        assert!(text.contains("cost_allocation_raw_join"));
        assert!(text.contains("Period semantics"));
    }
}
