//! Progress estimation from unstructured converter output.
//!
//! The converter has no machine-readable progress channel, so completion is
//! inferred from what it prints. Two heuristics are supported:
//!
//! | Heuristic | Used when | Percentage |
//! |-----------|-----------|------------|
//! | Page-based | page count known *and* a page marker is configured | `base + done/total × (cap − base)` |
//! | Line-based | otherwise | `base + min(lines × (cap − base) / expected, cap − base)` |
//!
//! Both map into the `20..=85` band. The rest of the 0–100 range belongs
//! to the orchestrator: `0..20` for saving the upload and launching the
//! converter, `85..=100` for reading and delivering the artifact.
//!
//! The line-based heuristic is an approximation. It only promises
//! monotonicity, never accuracy: a converter that prints 500 lines reaches
//! the cap after the first 50.

use regex::Regex;

/// First percentage of the converter band.
pub const BASE_PERCENT: u8 = 20;

/// Last percentage the estimator will ever report.
pub const CAP_PERCENT: u8 = 85;

const BAND: usize = (CAP_PERCENT - BASE_PERCENT) as usize;

/// How progress is inferred from converter output.
#[derive(Debug, Clone)]
pub enum Heuristic {
    /// Each line matching `marker` completes one of `total_pages`.
    Pages { total_pages: usize, marker: Regex },
    /// Each non-empty line is one of `expected_lines` units of work.
    Lines { expected_lines: usize },
}

/// Stateful mapping from converter output lines to a monotonic percentage.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    heuristic: Heuristic,
    completed: usize,
    last_emitted: u8,
}

impl ProgressEstimator {
    /// Choose the page-based heuristic when both a page count and a marker
    /// are available, otherwise fall back to counting lines.
    pub fn new(total_pages: Option<usize>, marker: Option<&Regex>, expected_lines: usize) -> Self {
        let heuristic = match (total_pages, marker) {
            (Some(total_pages), Some(marker)) if total_pages > 0 => Heuristic::Pages {
                total_pages,
                marker: marker.clone(),
            },
            _ => Heuristic::Lines {
                expected_lines: expected_lines.max(1),
            },
        };
        Self {
            heuristic,
            completed: 0,
            last_emitted: BASE_PERCENT,
        }
    }

    pub fn heuristic(&self) -> &Heuristic {
        &self.heuristic
    }

    /// Feed one output line; returns a new percentage only if it is
    /// strictly greater than the last one returned.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let percent = match &self.heuristic {
            Heuristic::Pages {
                total_pages,
                marker,
            } => {
                if !marker.is_match(line) {
                    return None;
                }
                self.completed += 1;
                let done = self.completed.min(*total_pages);
                BASE_PERCENT as usize + done * BAND / total_pages
            }
            Heuristic::Lines { expected_lines } => {
                self.completed += 1;
                BASE_PERCENT as usize + (self.completed * BAND / expected_lines).min(BAND)
            }
        };

        let percent = percent.min(CAP_PERCENT as usize) as u8;
        if percent > self.last_emitted {
            self.last_emitted = percent;
            Some(percent)
        } else {
            None
        }
    }

    /// Highest percentage reported so far (starts at [`BASE_PERCENT`]).
    pub fn last_emitted(&self) -> u8 {
        self.last_emitted
    }
}
