pub mod assessment;
pub mod judgment;
pub mod note;
pub mod response;
pub mod text;
pub mod trial;

mod error;

pub use assessment::SelfAssessment;
pub use error::{Error, Result};
pub use judgment::{CriterionCounts, CriterionJudgment, EligibilityLabel, JudgmentSet};
pub use note::PatientNote;
pub use trial::{Criterion, CriterionGroup, Trial};
