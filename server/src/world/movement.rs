use shared::{Direction, Position};
use std::collections::VecDeque;

/// Longest path a queue will hold; further steps are dropped.
pub const MAX_QUEUED_STEPS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub position: Position,
    pub direction: Direction,
}

/// Pending single-tile steps toward the clicked destination.
#[derive(Debug, Clone, Default)]
pub struct MovementQueue {
    steps: VecDeque<Step>,
    run_toggled: bool,
    run_path: bool,
}

impl MovementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every queued step. The run toggle survives, a run-only path flag
    /// does not.
    pub fn clear(&mut self) {
        self.steps.clear();
        self.run_path = false;
    }

    /// Queues the tiles between the last queued tile (or `current` when the
    /// queue is empty) and `target`, moving diagonally while both axes differ.
    pub fn add_step(&mut self, current: Position, target: Position) {
        let last = self.steps.back().map_or(current, |step| step.position);
        let (mut x, mut y) = (last.x, last.y);

        while self.steps.len() < MAX_QUEUED_STEPS {
            let dx = (target.x - x).signum();
            let dy = (target.y - y).signum();
            let Some(direction) = Direction::from_delta(dx, dy) else {
                break;
            };
            x += dx;
            y += dy;
            self.steps.push_back(Step {
                position: Position::new(x, y, last.z),
                direction,
            });
        }
    }

    pub fn next_step(&mut self) -> Option<Step> {
        self.steps.pop_front()
    }

    pub fn peek_last(&self) -> Option<&Step> {
        self.steps.back()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn set_running(&mut self, running: bool) {
        self.run_toggled = running;
    }

    pub fn is_run_toggled(&self) -> bool {
        self.run_toggled
    }

    /// Runs the current path regardless of the toggle.
    pub fn set_run_path(&mut self, run: bool) {
        self.run_path = run;
    }

    pub fn is_running(&self) -> bool {
        self.run_toggled || self.run_path
    }
}
