// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::CanonicalError;

use crate::context::Frame;

/// A successful plate solution. Coordinates are ICRS degrees and describe
/// either the frame center or the requested target pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveOutcome {
    pub ra: f64,
    pub dec: f64,
    pub roll: f64,
    /// Match probability reported by the solver, 0..1.
    pub probability: f64,
    /// Horizontal field of view measured from the solution, degrees.
    pub fov_measured: f64,
}

/// Plate-solver contract. The implementation is an opaque oracle; a frame
/// either solves (Some) or does not (None). Errors are reserved for solver
/// infrastructure failures and are recovered by the caller.
#[async_trait]
pub trait Solver {
    /// `fov_estimate` is the expected horizontal field of view in degrees.
    /// When `target_pixel` (col=x, row=y) is given, the reported sky
    /// coordinate is for that pixel rather than the frame center.
    async fn solve(
        &self,
        frame: &Frame,
        fov_estimate: f64,
        target_pixel: Option<(f64, f64)>,
    ) -> Result<Option<SolveOutcome>, CanonicalError>;
}

/// Scripted solver for development and tests. Yields its answers in order,
/// repeating the final entry forever; None entries emulate failed solves.
pub struct FakeSolver {
    answers: Mutex<ScriptState>,
    latency: Duration,
}

struct ScriptState {
    script: Vec<Option<SolveOutcome>>,
    index: usize,
}

impl FakeSolver {
    /// Solver that always returns the same position.
    pub fn fixed(ra: f64, dec: f64, roll: f64) -> Self {
        Self::scripted(
            vec![Some(SolveOutcome {
                ra,
                dec,
                roll,
                probability: 1.0,
                fov_measured: 21.0,
            })],
            Duration::from_millis(30),
        )
    }

    /// Solver that never finds a solution.
    pub fn failing() -> Self {
        Self::scripted(vec![None], Duration::from_millis(30))
    }

    pub fn scripted(
        script: Vec<Option<SolveOutcome>>,
        latency: Duration,
    ) -> Self {
        assert!(!script.is_empty());
        FakeSolver {
            answers: Mutex::new(ScriptState { script, index: 0 }),
            latency,
        }
    }
}

#[async_trait]
impl Solver for FakeSolver {
    async fn solve(
        &self,
        _frame: &Frame,
        _fov_estimate: f64,
        _target_pixel: Option<(f64, f64)>,
    ) -> Result<Option<SolveOutcome>, CanonicalError> {
        tokio::time::sleep(self.latency).await;
        let mut state = self.answers.lock().unwrap();
        let answer = state.script[state.index];
        if state.index + 1 < state.script.len() {
            state.index += 1;
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use image::GrayImage;

    use super::*;

    fn test_frame() -> Frame {
        Frame {
            image: GrayImage::new(8, 8),
            readout_time: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn test_fixed_solver_repeats() {
        let solver = FakeSolver::fixed(279.2437, 38.7861, 0.0);
        let frame = test_frame();
        for _ in 0..3 {
            let outcome = solver.solve(&frame, 21.0, None).await.unwrap();
            let outcome = outcome.unwrap();
            assert_eq!(outcome.ra, 279.2437);
            assert_eq!(outcome.dec, 38.7861);
        }
    }

    #[tokio::test]
    async fn test_scripted_solver_holds_last_entry() {
        let hit = SolveOutcome {
            ra: 10.0,
            dec: 20.0,
            roll: 0.0,
            probability: 1.0,
            fov_measured: 21.0,
        };
        let solver = FakeSolver::scripted(
            vec![None, Some(hit), None],
            Duration::ZERO,
        );
        let frame = test_frame();
        assert!(solver.solve(&frame, 21.0, None).await.unwrap().is_none());
        assert!(solver.solve(&frame, 21.0, None).await.unwrap().is_some());
        assert!(solver.solve(&frame, 21.0, None).await.unwrap().is_none());
        // Final entry repeats.
        assert!(solver.solve(&frame, 21.0, None).await.unwrap().is_none());
    }
}
