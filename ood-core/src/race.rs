//! Race state: match timing, lap detection, per-racer aggregation, and results ranking.

use std::collections::HashMap;

use serde::Serialize;

/// Minimum time between two laps.
pub const DEFAULT_LAP_DEBOUNCE_MS: i64 = 3000;
/// Below this speed a marker crossing is treated as noise from a parked car.
pub const DEFAULT_MIN_LAP_SPEED_MM_PER_SEC: u16 = 100;

/// Current match: go instant in the local clock and the lap target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RaceSession {
    pub match_start_at_local_ms: Option<i64>,
    pub target_laps: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    Idle,
    Countdown { remaining_ms: i64 },
    Racing { elapsed_ms: i64 },
}

impl RaceSession {
    pub fn start(&mut self, go_at_local_ms: i64, target_laps: u8) {
        self.match_start_at_local_ms = Some(go_at_local_ms);
        self.target_laps = Some(target_laps);
    }

    /// Cancel only clears the go instant; the lap target stays for the next start.
    pub fn cancel(&mut self) {
        self.match_start_at_local_ms = None;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_active(&self) -> bool {
        self.match_start_at_local_ms.is_some()
    }

    pub fn elapsed_since_go(&self, now_ms: i64) -> Option<i64> {
        self.match_start_at_local_ms.map(|go| now_ms - go)
    }

    pub fn phase(&self, now_ms: i64) -> MatchPhase {
        match self.match_start_at_local_ms {
            None => MatchPhase::Idle,
            Some(go) if now_ms < go => MatchPhase::Countdown {
                remaining_ms: go - now_ms,
            },
            Some(go) => MatchPhase::Racing {
                elapsed_ms: now_ms - go,
            },
        }
    }
}

/// Aggregated progress of one racer, local or remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RacerState {
    pub name: Option<String>,
    pub laps_completed: u8,
    pub best_lap_ms: Option<i64>,
    pub finished_at_local_ms: Option<i64>,
}

impl RacerState {
    pub fn named(name: Option<String>) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    /// Lap count never goes down; best lap never goes up. Non-positive
    /// durations mean "not measured" and are ignored.
    pub fn record_lap(&mut self, laps: u8, lap_ms: Option<i64>) {
        self.laps_completed = self.laps_completed.max(laps);
        if let Some(ms) = lap_ms.filter(|&ms| ms > 0) {
            self.best_lap_ms = Some(self.best_lap_ms.map_or(ms, |best| best.min(ms)));
        }
    }

    pub fn record_finish(&mut self, laps: u8, finished_at_local_ms: i64) {
        self.laps_completed = self.laps_completed.max(laps);
        if self.finished_at_local_ms.is_none() {
            self.finished_at_local_ms = Some(finished_at_local_ms);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at_local_ms.is_some()
    }

    /// Back to zero for a new match; the name is kept.
    pub fn reset(&mut self) {
        *self = Self::named(self.name.take());
    }
}

/// One completed lap as seen by the lap tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lap {
    pub laps: u8,
    /// `None` when timing had not started (manual marker before any go instant).
    pub duration_ms: Option<i64>,
    pub at_ms: i64,
}

/// Detects laps from position updates: a lap is counted when the road piece
/// returns to the start marker after having left it.
#[derive(Debug, Clone)]
pub struct LapTracker {
    debounce_ms: i64,
    min_speed_mm_per_sec: u16,
    start_piece: Option<u8>,
    was_on_marker: bool,
    auto_mark_pending: bool,
    lap_started_at_ms: Option<i64>,
    laps: u8,
}

impl Default for LapTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LAP_DEBOUNCE_MS, DEFAULT_MIN_LAP_SPEED_MM_PER_SEC)
    }
}

impl LapTracker {
    pub fn new(debounce_ms: i64, min_speed_mm_per_sec: u16) -> Self {
        Self {
            debounce_ms,
            min_speed_mm_per_sec,
            start_piece: None,
            was_on_marker: false,
            auto_mark_pending: false,
            lap_started_at_ms: None,
            laps: 0,
        }
    }

    /// Reset for a new match; the marker is taken from the first position at or after go.
    pub fn arm(&mut self) {
        self.start_piece = None;
        self.was_on_marker = false;
        self.auto_mark_pending = true;
        self.lap_started_at_ms = None;
        self.laps = 0;
    }

    /// Stop auto-marking (match cancelled). Counted laps are kept.
    pub fn disarm(&mut self) {
        self.auto_mark_pending = false;
    }

    /// Use `piece` as start marker, as if the car were sitting on it now.
    pub fn set_marker(&mut self, piece: u8, now_ms: i64) {
        self.start_piece = Some(piece);
        self.was_on_marker = true;
        self.auto_mark_pending = false;
        self.lap_started_at_ms.get_or_insert(now_ms);
    }

    pub fn marker(&self) -> Option<u8> {
        self.start_piece
    }

    pub fn laps(&self) -> u8 {
        self.laps
    }

    /// Feed one position update. `go_at_ms` is the current match go instant, if any.
    pub fn on_position(
        &mut self,
        piece: u8,
        speed_mm_per_sec: u16,
        now_ms: i64,
        go_at_ms: Option<i64>,
    ) -> Option<Lap> {
        if self.auto_mark_pending {
            match go_at_ms {
                Some(go) if now_ms >= go => {
                    self.start_piece = Some(piece);
                    self.was_on_marker = true;
                    self.auto_mark_pending = false;
                    self.lap_started_at_ms = Some(go);
                    return None;
                }
                _ => return None,
            }
        }
        let marker = self.start_piece?;
        let on_marker = piece == marker;
        let mut lap = None;
        if on_marker && !self.was_on_marker {
            let since_last = self
                .lap_started_at_ms
                .map_or(i64::MAX, |start| now_ms - start);
            if since_last > self.debounce_ms && speed_mm_per_sec > self.min_speed_mm_per_sec {
                self.laps = self.laps.saturating_add(1);
                let duration_ms = self.lap_started_at_ms.map(|start| now_ms - start);
                self.lap_started_at_ms = Some(now_ms);
                lap = Some(Lap {
                    laps: self.laps,
                    duration_ms,
                    at_ms: now_ms,
                });
            }
        }
        self.was_on_marker = on_marker;
        lap
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// `total_ms` is measured from the local go instant when one is known.
    Finished { finished_at_local_ms: i64, total_ms: Option<i64> },
    /// Did not finish: laps reached so far.
    Dnf { laps: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceResult {
    pub racer_id: String,
    pub name: Option<String>,
    pub laps: u8,
    pub best_lap_ms: Option<i64>,
    pub outcome: Outcome,
}

/// Finishers by finish instant ascending, then everyone else (most laps first, then id).
pub fn rank(racers: &HashMap<String, RacerState>, go_at_local_ms: Option<i64>) -> Vec<RaceResult> {
    let mut entries: Vec<(&String, &RacerState)> = racers.iter().collect();
    entries.sort_by(|(ia, a), (ib, b)| {
        match (a.finished_at_local_ms, b.finished_at_local_ms) {
            (Some(fa), Some(fb)) => fa.cmp(&fb).then_with(|| ia.cmp(ib)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b
                .laps_completed
                .cmp(&a.laps_completed)
                .then_with(|| ia.cmp(ib)),
        }
    });
    entries
        .into_iter()
        .map(|(id, r)| RaceResult {
            racer_id: id.clone(),
            name: r.name.clone(),
            laps: r.laps_completed,
            best_lap_ms: r.best_lap_ms,
            outcome: match r.finished_at_local_ms {
                Some(at) => Outcome::Finished {
                    finished_at_local_ms: at,
                    total_ms: go_at_local_ms.map(|go| at - go),
                },
                None => Outcome::Dnf {
                    laps: r.laps_completed,
                },
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_phases() {
        let mut s = RaceSession::default();
        assert_eq!(s.phase(0), MatchPhase::Idle);
        s.start(14_000, 3);
        assert_eq!(s.phase(10_000), MatchPhase::Countdown { remaining_ms: 4_000 });
        assert_eq!(s.phase(15_500), MatchPhase::Racing { elapsed_ms: 1_500 });
        s.cancel();
        assert!(!s.is_active());
        assert_eq!(s.target_laps, Some(3));
        s.clear();
        assert_eq!(s, RaceSession::default());
    }

    #[test]
    fn racer_laps_are_monotonic() {
        let mut r = RacerState::default();
        r.record_lap(2, Some(21_000));
        r.record_lap(1, Some(25_000));
        assert_eq!(r.laps_completed, 2);
        assert_eq!(r.best_lap_ms, Some(21_000));
        r.record_lap(3, Some(19_000));
        r.record_lap(3, Some(0));
        assert_eq!(r.laps_completed, 3);
        assert_eq!(r.best_lap_ms, Some(19_000));
    }

    #[test]
    fn finish_is_recorded_once() {
        let mut r = RacerState::default();
        r.record_finish(3, 71_000);
        r.record_finish(4, 90_000);
        assert_eq!(r.finished_at_local_ms, Some(71_000));
        assert_eq!(r.laps_completed, 4);
    }

    fn drive(t: &mut LapTracker, go: i64, samples: &[(i64, u8, u16)]) -> Vec<Lap> {
        samples
            .iter()
            .filter_map(|&(at, piece, speed)| t.on_position(piece, speed, at, Some(go)))
            .collect()
    }

    #[test]
    fn laps_from_marker_returns() {
        let mut t = LapTracker::default();
        t.arm();
        let go = 10_000;
        let laps = drive(
            &mut t,
            go,
            &[
                (9_000, 17, 0),    // before go: ignored
                (10_100, 17, 300), // marks piece 17
                (12_000, 20, 600),
                (30_000, 17, 600), // lap 1 at +20s
                (31_000, 21, 600),
                (52_000, 17, 600), // lap 2 at +42s
            ],
        );
        assert_eq!(t.marker(), Some(17));
        assert_eq!(
            laps,
            vec![
                Lap { laps: 1, duration_ms: Some(20_000), at_ms: 30_000 },
                Lap { laps: 2, duration_ms: Some(22_000), at_ms: 52_000 },
            ]
        );
    }

    #[test]
    fn debounce_and_speed_reject_false_laps() {
        let mut t = LapTracker::default();
        t.arm();
        let go = 0;
        let laps = drive(
            &mut t,
            go,
            &[
                (100, 5, 300),
                (1_000, 6, 300),
                (2_000, 5, 300),  // too soon after go
                (2_500, 6, 300),
                (9_000, 5, 50),   // too slow
                (9_500, 6, 300),
                (12_000, 5, 400), // counts
            ],
        );
        assert_eq!(laps.len(), 1);
        assert_eq!(laps[0].duration_ms, Some(12_000));
    }

    #[test]
    fn staying_on_marker_counts_once() {
        let mut t = LapTracker::default();
        t.set_marker(9, 0);
        assert_eq!(t.on_position(10, 500, 1_000, None), None);
        assert!(t.on_position(9, 500, 5_000, None).is_some());
        assert_eq!(t.on_position(9, 500, 9_000, None), None);
        assert_eq!(t.laps(), 1);
    }

    #[test]
    fn ranking_puts_finishers_first() {
        let mut racers = HashMap::new();
        racers.insert("a".to_string(), RacerState { laps_completed: 2, ..Default::default() });
        racers.insert(
            "b".to_string(),
            RacerState { laps_completed: 3, finished_at_local_ms: Some(80_000), ..Default::default() },
        );
        racers.insert(
            "c".to_string(),
            RacerState { laps_completed: 3, finished_at_local_ms: Some(71_000), ..Default::default() },
        );
        racers.insert("d".to_string(), RacerState { laps_completed: 1, ..Default::default() });
        let ranked = rank(&racers, Some(10_000));
        let ids: Vec<&str> = ranked.iter().map(|r| r.racer_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a", "d"]);
        assert_eq!(
            ranked[0].outcome,
            Outcome::Finished { finished_at_local_ms: 71_000, total_ms: Some(61_000) }
        );
        assert_eq!(ranked[2].outcome, Outcome::Dnf { laps: 2 });
    }
}
