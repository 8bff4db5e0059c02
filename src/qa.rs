//! QA checks collected across stages, kept as a queryable relation

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Raw,
    Staging,
    Master,
    Enrichment,
    StarSchema,
    MetricViews,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Staging => "staging",
            Stage::Master => "master",
            Stage::Enrichment => "enrichment",
            Stage::StarSchema => "star_schema",
            Stage::MetricViews => "metric_views",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaStatus {
    Pass,
    /// Observable data loss or drift that does not stop the run
    Warn,
    Fail,
}

impl QaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QaStatus::Pass => "pass",
            QaStatus::Warn => "warn",
            QaStatus::Fail => "fail",
        }
    }
}

/// One QA observation. `observed` and `expected` are rendered values so
/// counts, sums and dates share one relation.
#[derive(Debug, Clone, PartialEq)]
pub struct QaCheck {
    pub stage: Stage,
    pub check: String,
    pub observed: String,
    pub expected: Option<String>,
    pub status: QaStatus,
    pub detail: String,
}

impl QaCheck {
    /// Equality check: passes iff `observed == expected`.
    pub fn equals<T: PartialEq + fmt::Display>(
        stage: Stage,
        check: impl Into<String>,
        observed: T,
        expected: T,
    ) -> Self {
        let status = if observed == expected {
            QaStatus::Pass
        } else {
            QaStatus::Fail
        };
        Self {
            stage,
            check: check.into(),
            observed: observed.to_string(),
            expected: Some(expected.to_string()),
            status,
            detail: String::new(),
        }
    }

    /// Tolerance check for floating metrics.
    pub fn approx(
        stage: Stage,
        check: impl Into<String>,
        observed: f64,
        expected: f64,
        tolerance: f64,
    ) -> Self {
        let status = if (observed - expected).abs() <= tolerance {
            QaStatus::Pass
        } else {
            QaStatus::Fail
        };
        Self {
            stage,
            check: check.into(),
            observed: observed.to_string(),
            expected: Some(expected.to_string()),
            status,
            detail: format!("tolerance {tolerance}"),
        }
    }

    /// A descriptive count: warns when non-zero so data loss is visible.
    pub fn loss(stage: Stage, check: impl Into<String>, count: usize) -> Self {
        Self {
            stage,
            check: check.into(),
            observed: count.to_string(),
            expected: None,
            status: if count == 0 {
                QaStatus::Pass
            } else {
                QaStatus::Warn
            },
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn passed(&self) -> bool {
        self.status != QaStatus::Fail
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QaReport {
    checks: Vec<QaCheck>,
}

impl QaReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, check: QaCheck) {
        if check.status == QaStatus::Fail {
            tracing::warn!(
                stage = %check.stage,
                check = %check.check,
                observed = %check.observed,
                expected = ?check.expected,
                "QA check failed"
            );
        }
        self.checks.push(check);
    }

    pub fn extend(&mut self, checks: impl IntoIterator<Item = QaCheck>) {
        for check in checks {
            self.push(check);
        }
    }

    #[must_use]
    pub fn checks(&self) -> &[QaCheck] {
        &self.checks
    }

    pub fn failures(&self) -> impl Iterator<Item = &QaCheck> {
        self.checks.iter().filter(|c| c.status == QaStatus::Fail)
    }

    pub fn find(&self, check: &str) -> Option<&QaCheck> {
        self.checks.iter().find(|c| c.check == check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equals_and_loss_status() {
        let ok = QaCheck::equals(Stage::Master, "rows", 3usize, 3usize);
        assert_eq!(ok.status, QaStatus::Pass);

        let bad = QaCheck::equals(Stage::Master, "rows", 2usize, 3usize);
        assert_eq!(bad.status, QaStatus::Fail);
        assert_eq!(bad.expected.as_deref(), Some("3"));

        assert_eq!(QaCheck::loss(Stage::Staging, "x", 0).status, QaStatus::Pass);
        assert_eq!(QaCheck::loss(Stage::Staging, "x", 4).status, QaStatus::Warn);
    }

    #[test]
    fn test_report_failures() {
        let mut report = QaReport::new();
        report.push(QaCheck::approx(Stage::MetricViews, "share", 1.0, 1.0, 1e-9));
        report.push(QaCheck::loss(Stage::Staging, "dropped", 2));
        assert_eq!(report.failures().count(), 0);

        report.push(QaCheck::approx(Stage::MetricViews, "sum", 1.5, 1.0, 1e-9));
        let failed: Vec<&str> = report.failures().map(|c| c.check.as_str()).collect();
        assert_eq!(failed, vec!["sum"]);
        assert_eq!(report.find("dropped").map(|c| c.stage), Some(Stage::Staging));
    }
}
