// Draw presentation state machine.
//
// Drives the timed reveal cycle (drawing -> spinning -> revealing -> complete)
// for one allocation at a time. The machine owns no timers: callers ask for
// the next `deadline()`, sleep until it, and call `advance(now)`. Each new
// deadline is computed from the previous one, so late wake-ups never stretch
// a cycle.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Upper bound on one full reveal cycle accepted by config validation.
pub const MAX_CYCLE_DURATION: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Timings
// ---------------------------------------------------------------------------

/// One stage of the spinning animation: `ticks` ordinal changes, each shown
/// for `interval_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinStage {
    pub ticks: u32,
    pub interval_ms: u64,
}

impl SpinStage {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn duration(&self) -> Duration {
        self.interval() * self.ticks
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationTimings {
    pub drawing_delay: Duration,
    /// Fast, medium, slow.
    pub spin_stages: Vec<SpinStage>,
    pub reveal_hold: Duration,
    pub complete_hold: Duration,
}

impl Default for PresentationTimings {
    fn default() -> Self {
        PresentationTimings {
            drawing_delay: Duration::from_millis(500),
            spin_stages: vec![
                SpinStage { ticks: 10, interval_ms: 60 },
                SpinStage { ticks: 6, interval_ms: 150 },
                SpinStage { ticks: 4, interval_ms: 300 },
            ],
            reveal_hold: Duration::from_millis(800),
            complete_hold: Duration::from_millis(1000),
        }
    }
}

impl PresentationTimings {
    pub fn total_spin_ticks(&self) -> u32 {
        self.spin_stages.iter().map(|s| s.ticks).sum()
    }

    /// Time from cycle start until the machine is idle again.
    pub fn cycle_duration(&self) -> Duration {
        let spin: Duration = self.spin_stages.iter().map(SpinStage::duration).sum();
        self.drawing_delay + spin + self.reveal_hold + self.complete_hold
    }

    /// How long the `index`-th tick (zero-based) stays on screen.
    fn tick_interval(&self, index: u32) -> Duration {
        let mut remaining = index;
        for stage in &self.spin_stages {
            if remaining < stage.ticks {
                return stage.interval();
            }
            remaining -= stage.ticks;
        }
        Duration::ZERO
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Drawing,
    Spinning,
    Revealing,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Drawing => "drawing",
            Phase::Spinning => "spinning",
            Phase::Revealing => "revealing",
            Phase::Complete => "complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single reveal cycle presents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reveal {
    pub allocation_id: String,
    pub participant_id: String,
    /// `None` while the participant record has not been synchronized yet.
    pub participant_name: Option<String>,
    pub slot_number: u32,
    pub slot_name: String,
}

/// Observable output of [`DrawPresentation::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationEvent {
    CycleStarted(Reveal),
    PhaseChanged(Phase),
    /// Transient ordinal shown during spinning.
    SpinTick(u32),
    CycleCompleted(Reveal),
}

/// Read-only view of the presentation for renderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresentationSnapshot {
    pub phase: Phase,
    pub current: Option<Reveal>,
    pub spin_value: Option<u32>,
    pub drawn_shown: bool,
    pub queued: usize,
}

pub struct DrawPresentation {
    timings: PresentationTimings,
    slot_count: u32,
    phase: Phase,
    current: Option<Reveal>,
    spin_value: Option<u32>,
    ticks_shown: u32,
    drawn_shown: bool,
    deadline: Option<Instant>,
    queue: VecDeque<Reveal>,
}

impl DrawPresentation {
    pub fn new(timings: PresentationTimings, slot_count: u32) -> Self {
        DrawPresentation {
            timings,
            slot_count: slot_count.max(1),
            phase: Phase::Idle,
            current: None,
            spin_value: None,
            ticks_shown: 0,
            drawn_shown: false,
            deadline: None,
            queue: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle && self.queue.is_empty()
    }

    /// When `advance` next has work to do.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Queue a reveal. Returns `false` if a reveal for the same allocation is
    /// already current or queued. When idle, the cycle starts on the next
    /// `advance(now)`.
    pub fn enqueue(&mut self, reveal: Reveal, now: Instant) -> bool {
        let duplicate = self
            .current
            .iter()
            .chain(self.queue.iter())
            .any(|r| r.allocation_id == reveal.allocation_id);
        if duplicate {
            debug!("ignoring duplicate reveal for allocation {}", reveal.allocation_id);
            return false;
        }

        self.queue.push_back(reveal);
        if self.phase == Phase::Idle && self.deadline.is_none() {
            self.deadline = Some(now);
        }
        true
    }

    /// Fill in the participant name for reveals that were queued before the
    /// participant record arrived.
    pub fn attach_participant(&mut self, participant_id: &str, name: &str) {
        for reveal in self.current.iter_mut().chain(self.queue.iter_mut()) {
            if reveal.participant_id == participant_id && reveal.participant_name.is_none() {
                reveal.participant_name = Some(name.to_string());
            }
        }
    }

    /// Drop the current cycle and everything queued behind it.
    pub fn cancel(&mut self) {
        if self.current.is_some() || !self.queue.is_empty() {
            debug!(
                "presentation cancelled in phase {} with {} queued",
                self.phase,
                self.queue.len()
            );
        }
        self.queue.clear();
        self.clear_cycle();
        self.deadline = None;
    }

    /// Process every transition due at or before `now`.
    pub fn advance(&mut self, now: Instant) -> Vec<PresentationEvent> {
        let mut events = Vec::new();
        while let Some(at) = self.deadline {
            if at > now {
                break;
            }
            self.step(at, &mut events);
        }
        events
    }

    pub fn snapshot(&self) -> PresentationSnapshot {
        PresentationSnapshot {
            phase: self.phase,
            current: self.current.clone(),
            spin_value: self.spin_value,
            drawn_shown: self.drawn_shown,
            queued: self.queue.len(),
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn step(&mut self, at: Instant, events: &mut Vec<PresentationEvent>) {
        match self.phase {
            Phase::Idle => match self.queue.pop_front() {
                Some(reveal) => {
                    events.push(PresentationEvent::CycleStarted(reveal.clone()));
                    self.current = Some(reveal);
                    self.enter(Phase::Drawing, events);
                    self.deadline = Some(at + self.timings.drawing_delay);
                }
                None => self.deadline = None,
            },
            Phase::Drawing => {
                self.ticks_shown = 0;
                self.enter(Phase::Spinning, events);
                self.spin_or_reveal(at, events);
            }
            Phase::Spinning => self.spin_or_reveal(at, events),
            Phase::Revealing => {
                self.enter(Phase::Complete, events);
                self.deadline = Some(at + self.timings.complete_hold);
            }
            Phase::Complete => {
                if let Some(done) = self.current.clone() {
                    events.push(PresentationEvent::CycleCompleted(done));
                }
                self.clear_cycle();
                self.enter(Phase::Idle, events);
                // Queued reveals start back-to-back.
                self.deadline = if self.queue.is_empty() { None } else { Some(at) };
            }
        }
    }

    fn spin_or_reveal(&mut self, at: Instant, events: &mut Vec<PresentationEvent>) {
        let total = self.timings.total_spin_ticks();
        if self.ticks_shown < total {
            let index = self.ticks_shown;
            self.ticks_shown += 1;
            let value = self.spin_ordinal(total - self.ticks_shown + 1);
            self.spin_value = Some(value);
            events.push(PresentationEvent::SpinTick(value));
            self.deadline = Some(at + self.timings.tick_interval(index));
        } else {
            self.spin_value = self.current.as_ref().map(|r| r.slot_number);
            self.drawn_shown = true;
            self.enter(Phase::Revealing, events);
            self.deadline = Some(at + self.timings.reveal_hold);
        }
    }

    /// Ordinal `steps_left` positions before the target slot, wrapping within
    /// `1..=slot_count`.
    fn spin_ordinal(&self, steps_left: u32) -> u32 {
        let n = self.slot_count;
        let target = self.current.as_ref().map_or(1, |r| r.slot_number.clamp(1, n));
        ((target - 1) + n - (steps_left % n)) % n + 1
    }

    fn enter(&mut self, phase: Phase, events: &mut Vec<PresentationEvent>) {
        self.phase = phase;
        events.push(PresentationEvent::PhaseChanged(phase));
    }

    fn clear_cycle(&mut self) {
        self.phase = Phase::Idle;
        self.current = None;
        self.spin_value = None;
        self.ticks_shown = 0;
        self.drawn_shown = false;
    }
}
