//! Deployment State Machine
//!
//! Authoritative record of how far one node's PXE auto-install has got.
//! It enforces valid phase transitions and tracks installer progress so
//! that threshold events fire exactly once.
//!
//! # Design Principles
//!
//! - **Value, not shared state**: a `DeploymentContext` is owned by the
//!   caller, passed into each driver call and persisted between calls
//! - **Validated Transitions**: only forward moves to the next phase
//! - **Crossing, not equality**: progress thresholds fire when the highest
//!   progress seen reaches them, whatever the report granularity
//!
//! # Phase Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! Preparing            prepare: artifacts written, boot device = PXE
//!     ↓
//! BootTriggered        deploy: reboot requested
//!     ↓
//! WaitingForProgress   first installer report received
//!     ↓
//! Resuming             progress >= 60%, `resume` fired
//!     ↓
//! Verifying            progress >= 100%, boot device = disk, rebooted, probing
//!     ↓
//! Done                 OS reachable, `done` fired
//!
//! (Any phase can transition to Failed)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Percentage at which the `resume` event fires
pub const RESUME_THRESHOLD: f64 = 60.0;

/// Percentage at which completion handling starts
pub const COMPLETE_THRESHOLD: f64 = 100.0;

/// Absorbs float noise from `fraction * 100` (0.6 * 100 is not exactly 60)
const THRESHOLD_EPSILON: f64 = 1e-6;

/// Deployment phases in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeploymentPhase {
    /// Nothing prepared yet
    NotStarted = 0,

    /// Artifacts rendered and linked, next boot set to network
    Preparing = 1,

    /// Reboot into the installer requested
    BootTriggered = 2,

    /// Installer is reporting progress
    WaitingForProgress = 3,

    /// Resume threshold crossed
    Resuming = 4,

    /// Install finished, waiting for the OS to come up
    Verifying = 5,

    /// Deployed OS confirmed reachable (terminal state)
    Done = 6,

    /// Deployment failed (terminal state)
    Failed = 255,
}

impl DeploymentPhase {
    /// Returns the numeric order of this phase (0-6, 255 for Failed)
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true if this is a terminal state (Done or Failed)
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns the next phase in the sequence, or None if at a terminal state
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Preparing),
            Self::Preparing => Some(Self::BootTriggered),
            Self::BootTriggered => Some(Self::WaitingForProgress),
            Self::WaitingForProgress => Some(Self::Resuming),
            Self::Resuming => Some(Self::Verifying),
            Self::Verifying => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    /// Returns a human-readable description of this phase
    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Preparing => "Preparing boot artifacts",
            Self::BootTriggered => "Booting installer",
            Self::WaitingForProgress => "Installing",
            Self::Resuming => "Resumed",
            Self::Verifying => "Verifying deployed OS",
            Self::Done => "Deployment done",
            Self::Failed => "Deployment failed",
        }
    }

    /// Returns all phases in order (excluding Failed)
    pub const fn all_phases() -> &'static [Self] {
        &[
            Self::NotStarted,
            Self::Preparing,
            Self::BootTriggered,
            Self::WaitingForProgress,
            Self::Resuming,
            Self::Verifying,
            Self::Done,
        ]
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during phase transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeploymentTransitionError {
    /// Attempted to skip one or more phases
    #[error("Cannot skip from {from} to {to} (must transition through intermediate phases)")]
    SkippedPhase {
        from: DeploymentPhase,
        to: DeploymentPhase,
    },

    /// Attempted to go backwards
    #[error("Cannot go backwards from {from} to {to} (deployment is forward-only)")]
    BackwardTransition {
        from: DeploymentPhase,
        to: DeploymentPhase,
    },

    /// Attempted to transition from a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: DeploymentPhase },

    /// Attempted to transition to the same state
    #[error("Already at phase {phase}")]
    AlreadyInPhase { phase: DeploymentPhase },
}

/// One-shot threshold crossings produced by a progress observation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThresholdCrossings {
    /// Resume threshold reached for the first time
    pub resume: bool,
    /// Completion threshold reached for the first time
    pub complete: bool,
}

impl ThresholdCrossings {
    pub fn any(self) -> bool {
        self.resume || self.complete
    }
}

/// Deployment record for a single node.
///
/// # Example
///
/// ```
/// use pxeauto::install_state::{DeploymentContext, DeploymentPhase};
///
/// let mut ctx = DeploymentContext::new();
/// ctx.advance().unwrap();
/// assert_eq!(ctx.current_phase(), DeploymentPhase::Preparing);
///
/// // Progress jitter below 60% fires nothing; crossing it fires once
/// assert!(!ctx.observe_progress(59.9).resume);
/// assert!(ctx.observe_progress(60.1).resume);
/// assert!(!ctx.observe_progress(75.0).resume);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentContext {
    /// Current phase
    current: DeploymentPhase,

    /// Phase at which failure occurred (if any)
    failed_at: Option<DeploymentPhase>,

    /// (phase, unix timestamp) for each transition taken
    phase_history: Vec<(DeploymentPhase, u64)>,

    /// Highest installer progress percentage seen so far
    highest_progress: Option<f64>,

    /// `resume` threshold already handled
    resume_fired: bool,

    /// Completion handling already started
    completion_started: bool,

    /// Title of the most recent progress report
    last_title: Option<String>,
}

impl Default for DeploymentContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentContext {
    /// Create a new context in the NotStarted phase.
    pub fn new() -> Self {
        Self {
            current: DeploymentPhase::NotStarted,
            failed_at: None,
            phase_history: Vec::with_capacity(DeploymentPhase::all_phases().len()),
            highest_progress: None,
            resume_fired: false,
            completion_started: false,
            last_title: None,
        }
    }

    /// Returns the current phase
    #[inline]
    pub fn current_phase(&self) -> DeploymentPhase {
        self.current
    }

    /// Returns the phase at which failure occurred, if any
    #[inline]
    pub fn failed_at(&self) -> Option<DeploymentPhase> {
        self.failed_at
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.current == DeploymentPhase::Done
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == DeploymentPhase::Failed
    }

    /// Highest progress percentage reported so far
    #[inline]
    pub fn highest_progress(&self) -> Option<f64> {
        self.highest_progress
    }

    pub fn last_title(&self) -> Option<&str> {
        self.last_title.as_deref()
    }

    pub fn phase_history(&self) -> &[(DeploymentPhase, u64)] {
        &self.phase_history
    }

    pub fn set_last_title(&mut self, title: impl Into<String>) {
        self.last_title = Some(title.into());
    }

    /// Fold a progress percentage into the record.
    ///
    /// Progress is monotonic: a lower value than already seen changes
    /// nothing. Each threshold is reported at most once per deployment.
    pub fn observe_progress(&mut self, percent: f64) -> ThresholdCrossings {
        let highest = match self.highest_progress {
            Some(seen) if seen >= percent => seen,
            _ => percent,
        };
        self.highest_progress = Some(highest);

        let mut crossings = ThresholdCrossings::default();
        if !self.resume_fired && highest + THRESHOLD_EPSILON >= RESUME_THRESHOLD {
            self.resume_fired = true;
            crossings.resume = true;
        }
        if !self.completion_started && highest + THRESHOLD_EPSILON >= COMPLETE_THRESHOLD {
            self.completion_started = true;
            crossings.complete = true;
        }
        crossings
    }

    /// Advance to the next phase in sequence.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already at Done or Failed
    pub fn advance(&mut self) -> Result<DeploymentPhase, DeploymentTransitionError> {
        let Some(next_phase) = self.current.next() else {
            return Err(DeploymentTransitionError::FromTerminalState { from: self.current });
        };

        self.record_transition(next_phase);
        self.current = next_phase;
        Ok(next_phase)
    }

    /// Transition to a specific phase (must be the next phase in sequence).
    ///
    /// # Errors
    ///
    /// - `AlreadyInPhase` if target is the current phase
    /// - `BackwardTransition` if target is before current
    /// - `SkippedPhase` if target is not the immediate next phase
    /// - `FromTerminalState` if current is a terminal state
    pub fn transition_to(
        &mut self,
        target: DeploymentPhase,
    ) -> Result<DeploymentPhase, DeploymentTransitionError> {
        if self.current.is_terminal() {
            return Err(DeploymentTransitionError::FromTerminalState { from: self.current });
        }

        if target == self.current {
            return Err(DeploymentTransitionError::AlreadyInPhase { phase: target });
        }

        // Failed is only reachable through fail()
        if target == DeploymentPhase::Failed {
            return Err(DeploymentTransitionError::SkippedPhase {
                from: self.current,
                to: target,
            });
        }

        if target.order() < self.current.order() {
            return Err(DeploymentTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }

        if self.current.next() != Some(target) {
            return Err(DeploymentTransitionError::SkippedPhase {
                from: self.current,
                to: target,
            });
        }

        self.record_transition(target);
        self.current = target;
        Ok(target)
    }

    /// Mark the deployment as failed.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already at Done or Failed
    pub fn fail(&mut self) -> Result<(), DeploymentTransitionError> {
        if self.current.is_terminal() {
            return Err(DeploymentTransitionError::FromTerminalState { from: self.current });
        }

        self.failed_at = Some(self.current);
        self.record_transition(DeploymentPhase::Failed);
        self.current = DeploymentPhase::Failed;
        Ok(())
    }

    /// Reset to NotStarted, clearing history and progress (after clean-up).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn record_transition(&mut self, phase: DeploymentPhase) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        self.phase_history.push((phase, timestamp));
    }
}

impl From<DeploymentTransitionError> for crate::error::ProvisionError {
    fn from(err: DeploymentTransitionError) -> Self {
        crate::error::ProvisionError::Transition(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // DeploymentPhase Tests
    // =========================================================================

    #[test]
    fn test_phase_order_is_sequential() {
        for (i, phase) in DeploymentPhase::all_phases().iter().enumerate() {
            assert_eq!(phase.order() as usize, i, "Phase {:?} should have order {}", phase, i);
        }
    }

    #[test]
    fn test_phase_next_forms_chain() {
        let mut current = DeploymentPhase::NotStarted;
        let mut count = 0;

        while let Some(next) = current.next() {
            current = next;
            count += 1;
            assert!(count < 20, "Infinite loop detected in phase chain");
        }

        assert_eq!(current, DeploymentPhase::Done);
        assert_eq!(count, 6);
    }

    #[test]
    fn test_terminal_states() {
        assert!(DeploymentPhase::Done.is_terminal());
        assert!(DeploymentPhase::Failed.is_terminal());
        assert!(!DeploymentPhase::Verifying.is_terminal());
    }

    // =========================================================================
    // DeploymentContext Tests
    // =========================================================================

    #[test]
    fn test_advance_through_all_phases() {
        let mut ctx = DeploymentContext::new();
        let mut count = 0;
        while ctx.advance().is_ok() {
            count += 1;
            assert!(count < 20, "Infinite loop detected");
        }
        assert!(ctx.is_done());
        assert_eq!(count, 6);
        assert_eq!(ctx.phase_history().len(), 6);
    }

    #[test]
    fn test_cannot_skip_or_go_back() {
        let mut ctx = DeploymentContext::new();
        let err = ctx.transition_to(DeploymentPhase::Resuming).unwrap_err();
        assert!(matches!(err, DeploymentTransitionError::SkippedPhase { .. }));

        ctx.advance().expect("Preparing");
        ctx.advance().expect("BootTriggered");
        let err = ctx.transition_to(DeploymentPhase::Preparing).unwrap_err();
        assert!(matches!(err, DeploymentTransitionError::BackwardTransition { .. }));

        let err = ctx.transition_to(DeploymentPhase::BootTriggered).unwrap_err();
        assert!(matches!(err, DeploymentTransitionError::AlreadyInPhase { .. }));
    }

    #[test]
    fn test_fail_records_phase_and_is_terminal() {
        let mut ctx = DeploymentContext::new();
        ctx.advance().expect("Preparing");
        ctx.fail().expect("fail");
        assert!(ctx.is_failed());
        assert_eq!(ctx.failed_at(), Some(DeploymentPhase::Preparing));
        assert!(matches!(
            ctx.advance().unwrap_err(),
            DeploymentTransitionError::FromTerminalState { .. }
        ));
        assert!(ctx.fail().is_err());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut ctx = DeploymentContext::new();
        ctx.advance().expect("Preparing");
        ctx.observe_progress(100.0);
        ctx.reset();
        assert_eq!(ctx, DeploymentContext::new());
    }

    // =========================================================================
    // Progress Threshold Tests
    // =========================================================================

    #[test]
    fn test_exact_thresholds_fire() {
        let mut ctx = DeploymentContext::new();
        assert_eq!(
            ctx.observe_progress(60.0),
            ThresholdCrossings { resume: true, complete: false }
        );
        assert_eq!(
            ctx.observe_progress(100.0),
            ThresholdCrossings { resume: false, complete: true }
        );
    }

    #[test]
    fn test_skipped_values_still_fire_once() {
        let mut ctx = DeploymentContext::new();
        let fired: Vec<ThresholdCrossings> = [10.0, 59.9, 60.1, 99.9, 100.0]
            .into_iter()
            .map(|p| ctx.observe_progress(p))
            .collect();
        assert_eq!(fired.iter().filter(|c| c.resume).count(), 1);
        assert_eq!(fired.iter().filter(|c| c.complete).count(), 1);
        assert!(fired[2].resume);
        assert!(fired[4].complete);
    }

    #[test]
    fn test_jump_straight_to_complete_fires_both() {
        let mut ctx = DeploymentContext::new();
        let crossings = ctx.observe_progress(100.0001);
        assert!(crossings.resume && crossings.complete);
        assert!(!ctx.observe_progress(100.0).any());
    }

    #[test]
    fn test_progress_never_regresses() {
        let mut ctx = DeploymentContext::new();
        ctx.observe_progress(70.0);
        ctx.observe_progress(20.0);
        assert_eq!(ctx.highest_progress(), Some(70.0));
    }

    #[test]
    fn test_fraction_noise_is_absorbed() {
        let mut ctx = DeploymentContext::new();
        assert!(ctx.observe_progress(0.6 * 100.0).resume);
        assert!(ctx.observe_progress(0.99999999999 * 100.0).complete);
    }

    #[test]
    fn test_context_survives_json() {
        let mut ctx = DeploymentContext::new();
        ctx.advance().expect("Preparing");
        ctx.observe_progress(61.0);
        ctx.set_last_title("Installing packages");
        let json = serde_json::to_string(&ctx).expect("serialize");
        let back: DeploymentContext = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ctx);
    }
}
