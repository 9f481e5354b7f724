//! Academic period identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a school divides its academic year for billing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Term,
    Semester,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Term => "term",
            PeriodType::Semester => "semester",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "term" => Some(PeriodType::Term),
            "semester" => Some(PeriodType::Semester),
            _ => None,
        }
    }

    /// Highest period number within one academic year.
    pub fn max_number(&self) -> i16 {
        match self {
            PeriodType::Term => 3,
            PeriodType::Semester => 2,
        }
    }
}

impl std::fmt::Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of the period a billing record covers, plus the class the
/// student sits in for that period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodKey {
    pub academic_year: String,
    pub period_type: PeriodType,
    pub period_number: i16,
    pub class_id: Uuid,
}

impl PeriodKey {
    pub fn new(
        academic_year: impl Into<String>,
        period_type: PeriodType,
        period_number: i16,
        class_id: Uuid,
    ) -> Self {
        Self {
            academic_year: academic_year.into(),
            period_type,
            period_number,
            class_id,
        }
    }

    /// Check the year is present and the number fits the period type.
    pub fn validate(&self) -> Result<(), String> {
        if self.academic_year.trim().is_empty() {
            return Err("academic year must not be empty".to_string());
        }
        if self.period_number < 1 || self.period_number > self.period_type.max_number() {
            return Err(format!(
                "{} number must be between 1 and {}, got {}",
                self.period_type,
                self.period_type.max_number(),
                self.period_number
            ));
        }
        Ok(())
    }

    /// Same billing slot, ignoring class. Class changes on promotion and does
    /// not take part in uniqueness.
    /// Whether this period comes strictly after `earlier`: a later academic
    /// year, or a later period of the same type in the same year. Switching
    /// between terms and semesters inside one year has no defined order.
    pub fn follows(&self, earlier: &PeriodKey) -> bool {
        match self.academic_year.cmp(&earlier.academic_year) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                self.period_type == earlier.period_type
                    && self.period_number > earlier.period_number
            }
        }
    }

    pub fn same_slot(&self, other: &PeriodKey) -> bool {
        self.academic_year == other.academic_year
            && self.period_type == other.period_type
            && self.period_number == other.period_number
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.academic_year, self.period_type, self.period_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_type_round_trip_strings() {
        assert_eq!(PeriodType::from_string("term"), Some(PeriodType::Term));
        assert_eq!(PeriodType::from_string("semester"), Some(PeriodType::Semester));
        assert_eq!(PeriodType::from_string("quarter"), None);
    }

    #[test]
    fn test_validate_period_number_bounds() {
        let class_id = Uuid::new_v4();
        assert!(PeriodKey::new("2024/2025", PeriodType::Term, 3, class_id)
            .validate()
            .is_ok());
        assert!(PeriodKey::new("2024/2025", PeriodType::Term, 4, class_id)
            .validate()
            .is_err());
        assert!(PeriodKey::new("2024/2025", PeriodType::Semester, 3, class_id)
            .validate()
            .is_err());
        assert!(PeriodKey::new("2024/2025", PeriodType::Semester, 0, class_id)
            .validate()
            .is_err());
        assert!(PeriodKey::new("  ", PeriodType::Term, 1, class_id)
            .validate()
            .is_err());
    }

    #[test]
    fn test_same_slot_ignores_class_but_not_type() {
        let a = PeriodKey::new("2024/2025", PeriodType::Term, 1, Uuid::new_v4());
        let b = PeriodKey::new("2024/2025", PeriodType::Term, 1, Uuid::new_v4());
        let c = PeriodKey::new("2024/2025", PeriodType::Semester, 1, a.class_id);
        assert!(a.same_slot(&b));
        assert!(!a.same_slot(&c));
    }

    #[test]
    fn test_follows_orders_by_year_then_number() {
        let class_id = Uuid::new_v4();
        let term = |year: &str, n| PeriodKey::new(year, PeriodType::Term, n, class_id);

        assert!(term("2024/2025", 2).follows(&term("2024/2025", 1)));
        assert!(term("2025/2026", 1).follows(&term("2024/2025", 3)));
        assert!(!term("2024/2025", 1).follows(&term("2024/2025", 3)));
        assert!(!term("2024/2025", 1).follows(&term("2024/2025", 1)));
        assert!(!term("2023/2024", 3).follows(&term("2024/2025", 1)));

        let semester = PeriodKey::new("2024/2025", PeriodType::Semester, 2, class_id);
        assert!(!semester.follows(&term("2024/2025", 1)));
    }
}
