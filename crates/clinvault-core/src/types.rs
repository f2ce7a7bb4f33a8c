use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Who is entering data into the session.
///
/// Recorded in the document `meta` and on every audit entry, so a reviewer
/// can tell clinician-entered answers from patient self-report or imports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Clinician,
    /// Patient self-report (questionnaire handed to the patient)
    Patient,
    /// Bulk import from an exported session file
    Import,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Clinician => "clinician",
            SourceMode::Patient => "patient",
            SourceMode::Import => "import",
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clinician" => Ok(SourceMode::Clinician),
            "patient" => Ok(SourceMode::Patient),
            "import" => Ok(SourceMode::Import),
            other => Err(format!(
                "unknown source mode '{other}' (expected clinician, patient, or import)"
            )),
        }
    }
}

/// Current wall-clock time as Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
