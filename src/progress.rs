//! Installer progress reports
//!
//! The booted installer posts `{"Title": ..., "InstallProgress": ...}`
//! whenever it moves on. These arrive from the network and are treated as
//! untrusted: a `ProgressReport` can only be built from values that pass
//! validation, so anything holding one can rely on a finite fraction in
//! `[0, 1]` and a bounded, printable title.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};

/// Longest title kept from a report
pub const MAX_TITLE_LEN: usize = 256;

/// A validated progress report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawReport")]
pub struct ProgressReport {
    #[serde(rename = "Title")]
    title: String,
    #[serde(rename = "InstallProgress")]
    install_progress: f64,
}

/// Wire shape before validation
#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(rename = "Title", alias = "title", default)]
    title: String,
    #[serde(rename = "InstallProgress", alias = "installProgress")]
    install_progress: RawFraction,
}

/// Installers send the fraction either as a number or as a string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFraction {
    Number(f64),
    Text(String),
}

impl TryFrom<RawReport> for ProgressReport {
    type Error = ProvisionError;

    fn try_from(raw: RawReport) -> Result<Self> {
        let fraction = match raw.install_progress {
            RawFraction::Number(n) => n,
            RawFraction::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                ProvisionError::invalid_report(format!("InstallProgress {:?} is not a number", s))
            })?,
        };
        Self::new(raw.title, fraction)
    }
}

impl ProgressReport {
    /// Build a report, rejecting non-finite or out-of-range fractions.
    ///
    /// Control characters are stripped from the title and it is cut to
    /// `MAX_TITLE_LEN` characters so it is safe to log.
    pub fn new(title: impl Into<String>, install_progress: f64) -> Result<Self> {
        if !install_progress.is_finite() {
            return Err(ProvisionError::invalid_report(
                "InstallProgress must be a finite number",
            ));
        }
        if !(0.0..=1.0).contains(&install_progress) {
            return Err(ProvisionError::invalid_report(format!(
                "InstallProgress {} is outside [0, 1]",
                install_progress
            )));
        }

        let title: String = title
            .into()
            .chars()
            .filter(|c| !c.is_control())
            .take(MAX_TITLE_LEN)
            .collect();

        Ok(Self {
            title,
            install_progress,
        })
    }

    /// Parse and validate a JSON report
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ProvisionError::invalid_report(e.to_string()))
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Completed fraction in `[0, 1]`
    pub fn install_progress(&self) -> f64 {
        self.install_progress
    }

    /// Completed percentage in `[0, 100]`
    pub fn percent(&self) -> f64 {
        self.install_progress * 100.0
    }
}
