//! Dosing volume bookkeeping.
//!
//! All volumes are integer microlitres so that the ledger is exact: what was
//! added minus what was removed is always precisely the change in vial
//! volume. A requested exchange is split between media and alternative media
//! so the cumulative alt-media share tracks its target, cut into sub-doses of
//! at most `max_subdose`, each followed by an equal waste removal.

use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

pub fn ml_to_ul(ml: f64) -> i64 {
    (ml * 1000.0).round() as i64
}

pub fn ul_to_ml(ul: i64) -> f64 {
    ul as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pump {
    Media,
    AltMedia,
    Waste,
}

impl Pump {
    /// Name of the dosing event this pump produces.
    pub fn event(&self) -> &'static str {
        match self {
            Self::Media => "add_media",
            Self::AltMedia => "add_alt_media",
            Self::Waste => "remove_waste",
        }
    }

    /// Calibration device name.
    pub fn device(&self) -> &'static str {
        match self {
            Self::Media => "media_pump",
            Self::AltMedia => "alt_media_pump",
            Self::Waste => "waste_pump",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAction {
    pub pump: Pump,
    pub volume_ul: i64,
}

impl IoAction {
    pub fn volume_ml(&self) -> f64 {
        ul_to_ml(self.volume_ul)
    }

    /// Signed change in vial volume.
    pub fn volume_change_ul(&self) -> i64 {
        match self.pump {
            Pump::Waste => -self.volume_ul,
            _ => self.volume_ul,
        }
    }
}

/// Payload of `<unit>/<experiment>/dosing_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosingEvent {
    pub event: String,
    pub volume_change: f64,
    pub source_of_event: String,
}

impl DosingEvent {
    pub fn from_action(action: &IoAction, source: &str) -> Self {
        Self {
            event: action.pump.event().to_string(),
            volume_change: action.volume_ml(),
            source_of_event: source.to_string(),
        }
    }
}

/// Cumulative volumes pumped over the experiment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub media_ul: i64,
    pub alt_media_ul: i64,
    pub waste_ul: i64,
}

impl Ledger {
    pub fn added_ul(&self) -> i64 {
        self.media_ul + self.alt_media_ul
    }

    /// Alt-media share of everything added so far (0 before any addition).
    pub fn alt_media_share(&self) -> f64 {
        let total = self.added_ul();
        if total == 0 {
            0.0
        } else {
            self.alt_media_ul as f64 / total as f64
        }
    }
}

/// Cap on one request, in multiples of the vial's working volume.
const MAX_EXCHANGES_PER_REQUEST: i64 = 10;

/// Split `total` into `n` parts differing by at most one.
fn split_even(total: i64, n: i64) -> Vec<i64> {
    let base = total / n;
    let rem = total % n;
    (0..n).map(|i| base + i64::from(i < rem)).collect()
}

#[derive(Debug, Clone)]
pub struct DosingPlanner {
    target_alt_fraction: f64,
    max_subdose_ul: i64,
    /// Working volume; the vial may exceed it by at most one sub-dose while
    /// an addition awaits its waste removal.
    max_volume_ul: i64,
    ledger: Ledger,
    vial_volume_ul: i64,
    vial_alt_fraction: f64,
}

impl DosingPlanner {
    pub fn new(
        target_alt_fraction: f64,
        max_subdose_ml: f64,
        max_volume_ml: f64,
        initial_volume_ml: f64,
        initial_alt_fraction: f64,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&target_alt_fraction) {
            return Err(JobError::InvalidArgument(format!(
                "alt media target {target_alt_fraction} out of range [0, 1]"
            )));
        }
        let max_subdose_ul = ml_to_ul(max_subdose_ml);
        if max_subdose_ul <= 0 {
            return Err(JobError::InvalidArgument(format!(
                "max sub-dose must be positive, got {max_subdose_ml} mL"
            )));
        }
        Ok(Self {
            target_alt_fraction,
            max_subdose_ul,
            max_volume_ul: ml_to_ul(max_volume_ml),
            ledger: Ledger::default(),
            vial_volume_ul: ml_to_ul(initial_volume_ml),
            vial_alt_fraction: initial_alt_fraction.clamp(0.0, 1.0),
        })
    }

    /// Continue from an existing ledger (restored from the cache).
    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn ledger(&self) -> Ledger {
        self.ledger
    }

    pub fn vial_volume_ml(&self) -> f64 {
        ul_to_ml(self.vial_volume_ul)
    }

    pub fn vial_volume_ul(&self) -> i64 {
        self.vial_volume_ul
    }

    pub fn alt_media_fraction(&self) -> f64 {
        self.vial_alt_fraction
    }

    pub fn target_alt_fraction(&self) -> f64 {
        self.target_alt_fraction
    }

    pub fn set_target_alt_fraction(&mut self, target: f64) {
        self.target_alt_fraction = target.clamp(0.0, 1.0);
    }

    /// Plan an exchange of `request_ml`: the alt-media share of the request
    /// is chosen so the cumulative share moves as close to the target as
    /// this request allows.
    pub fn plan_exchange(&self, request_ml: f64) -> Result<Vec<IoAction>> {
        let request = self.checked_request(request_ml)?;
        let wanted_alt = self.target_alt_fraction * (self.ledger.added_ul() + request) as f64
            - self.ledger.alt_media_ul as f64;
        let alt = (wanted_alt.round() as i64).clamp(0, request);
        Ok(self.chunk(request - alt, alt))
    }

    /// Plan a single-pump addition of `volume_ml`, with matching waste.
    pub fn plan_single(&self, pump: Pump, volume_ml: f64) -> Result<Vec<IoAction>> {
        let volume = self.checked_request(volume_ml)?;
        Ok(match pump {
            Pump::Media => self.chunk(volume, 0),
            Pump::AltMedia => self.chunk(0, volume),
            Pump::Waste => vec![IoAction {
                pump: Pump::Waste,
                volume_ul: volume,
            }],
        })
    }

    /// Largest single request: a few full exchanges of the working volume.
    pub fn max_request_ul(&self) -> i64 {
        self.max_volume_ul.saturating_mul(MAX_EXCHANGES_PER_REQUEST)
    }

    fn checked_request(&self, ml: f64) -> Result<i64> {
        if !ml.is_finite() || ml < 0.0 {
            return Err(JobError::InvalidArgument(format!(
                "dosing volume must be a non-negative number, got {ml}"
            )));
        }
        let limit = self.max_request_ul();
        if ml > ul_to_ml(limit) {
            return Err(JobError::InvalidArgument(format!(
                "dosing volume {ml} mL exceeds the {:.3} mL limit for one request",
                ul_to_ml(limit)
            )));
        }
        Ok(ml_to_ul(ml))
    }

    fn chunk(&self, media: i64, alt: i64) -> Vec<IoAction> {
        let total = media + alt;
        if total == 0 {
            return Vec::new();
        }
        let n = (total + self.max_subdose_ul - 1) / self.max_subdose_ul;
        let media_parts = split_even(media, n);
        let alt_parts = split_even(alt, n);

        let mut actions = Vec::with_capacity(3 * n as usize);
        for (m, a) in media_parts.into_iter().zip(alt_parts) {
            if m > 0 {
                actions.push(IoAction {
                    pump: Pump::Media,
                    volume_ul: m,
                });
            }
            if a > 0 {
                actions.push(IoAction {
                    pump: Pump::AltMedia,
                    volume_ul: a,
                });
            }
            actions.push(IoAction {
                pump: Pump::Waste,
                volume_ul: m + a,
            });
        }
        actions
    }

    /// Record an action that has been carried out. Refuses an addition that
    /// would push the vial past its working volume plus one sub-dose.
    pub fn apply(&mut self, action: &IoAction) -> Result<()> {
        let v = action.volume_ul;
        match action.pump {
            Pump::Media | Pump::AltMedia => {
                let ceiling = self.max_volume_ul + self.max_subdose_ul;
                if self.vial_volume_ul + v > ceiling {
                    return Err(JobError::InvalidArgument(format!(
                        "adding {:.3} mL would exceed the vial ceiling of {:.3} mL",
                        ul_to_ml(v),
                        ul_to_ml(ceiling)
                    )));
                }
                let alt_added = if action.pump == Pump::AltMedia { v } else { 0 };
                let new_volume = self.vial_volume_ul + v;
                if new_volume > 0 {
                    self.vial_alt_fraction = (self.vial_alt_fraction * self.vial_volume_ul as f64
                        + alt_added as f64)
                        / new_volume as f64;
                }
                self.vial_volume_ul = new_volume;
                if action.pump == Pump::AltMedia {
                    self.ledger.alt_media_ul += v;
                } else {
                    self.ledger.media_ul += v;
                }
            }
            Pump::Waste => {
                let removed = v.min(self.vial_volume_ul);
                self.vial_volume_ul -= removed;
                self.ledger.waste_ul += removed;
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(target: f64) -> DosingPlanner {
        DosingPlanner::new(target, 0.75, 14.0, 14.0, 0.0).unwrap()
    }

    #[test]
    fn add_media_steers_toward_alt_target() {
        // 7 mL media and 3 mL alt media so far: share 0.3, target 0.5.
        let p = planner(0.5).with_ledger(Ledger {
            media_ul: 7_000,
            alt_media_ul: 3_000,
            waste_ul: 10_000,
        });
        let actions = p.plan_exchange(1.0).unwrap();
        assert_eq!(
            actions,
            vec![
                IoAction { pump: Pump::AltMedia, volume_ul: 500 },
                IoAction { pump: Pump::Waste, volume_ul: 500 },
                IoAction { pump: Pump::AltMedia, volume_ul: 500 },
                IoAction { pump: Pump::Waste, volume_ul: 500 },
            ]
        );
    }

    #[test]
    fn exchange_at_target_keeps_ratio() {
        let p = planner(0.5).with_ledger(Ledger {
            media_ul: 5_000,
            alt_media_ul: 5_000,
            waste_ul: 10_000,
        });
        let actions = p.plan_exchange(0.5).unwrap();
        let alt: i64 = actions.iter().filter(|a| a.pump == Pump::AltMedia).map(|a| a.volume_ul).sum();
        let media: i64 = actions.iter().filter(|a| a.pump == Pump::Media).map(|a| a.volume_ul).sum();
        assert_eq!((media, alt), (250, 250));
    }

    #[test]
    fn volume_is_conserved_exactly() {
        let mut p = planner(0.3);
        let start = p.vial_volume_ul();
        let mut added = 0;
        let mut removed = 0;
        for req in [0.1, 1.337, 2.0, 0.001, 0.75, 0.7501] {
            for a in p.plan_exchange(req).unwrap() {
                p.apply(&a).unwrap();
                match a.pump {
                    Pump::Waste => removed += a.volume_ul,
                    _ => added += a.volume_ul,
                }
            }
            assert_eq!(p.vial_volume_ul(), start, "net change after {req} mL");
        }
        assert_eq!(p.vial_volume_ul() - start, added - removed);
        assert_eq!(p.ledger().waste_ul, removed);
    }

    #[test]
    fn subdoses_never_exceed_the_limit() {
        let p = planner(0.25);
        let actions = p.plan_exchange(3.1).unwrap();
        for chunk in actions.split(|a| a.pump == Pump::Waste) {
            let sum: i64 = chunk.iter().map(|a| a.volume_ul).sum();
            assert!(sum <= 750, "sub-dose of {sum} uL");
        }
    }

    #[test]
    fn cumulative_share_approaches_target_without_overshoot() {
        let mut p = planner(0.5).with_ledger(Ledger {
            media_ul: 7_000,
            alt_media_ul: 3_000,
            waste_ul: 10_000,
        });
        let mut prev_gap = (p.ledger().alt_media_share() - 0.5).abs();
        for _ in 0..20 {
            for a in p.plan_exchange(1.0).unwrap() {
                p.apply(&a).unwrap();
            }
            let share = p.ledger().alt_media_share();
            let gap = (share - 0.5).abs();
            assert!(gap <= prev_gap + 1e-12, "share {share} moved away from target");
            assert!((0.0..=1.0).contains(&p.alt_media_fraction()));
            prev_gap = gap;
        }
        assert!(prev_gap < 1e-3);
    }

    #[test]
    fn vial_fraction_follows_mixing() {
        let mut p = DosingPlanner::new(1.0, 1.0, 10.0, 10.0, 0.0).unwrap();
        p.apply(&IoAction { pump: Pump::AltMedia, volume_ul: 1_000 }).unwrap();
        assert!((p.alt_media_fraction() - 1.0 / 11.0).abs() < 1e-12);
        p.apply(&IoAction { pump: Pump::Waste, volume_ul: 1_000 }).unwrap();
        assert!((p.alt_media_fraction() - 1.0 / 11.0).abs() < 1e-12);
        assert_eq!(p.vial_volume_ul(), 10_000);
    }

    #[test]
    fn addition_past_ceiling_is_refused() {
        let mut p = planner(0.0);
        p.apply(&IoAction { pump: Pump::Media, volume_ul: 750 }).unwrap();
        assert!(p.apply(&IoAction { pump: Pump::Media, volume_ul: 1 }).is_err());
    }

    #[test]
    fn invalid_requests() {
        let p = planner(0.5);
        assert!(p.plan_exchange(-1.0).is_err());
        assert!(p.plan_exchange(f64::NAN).is_err());
        assert!(p.plan_exchange(0.0).unwrap().is_empty());
        assert!(DosingPlanner::new(1.5, 0.75, 14.0, 14.0, 0.0).is_err());

        // ten working volumes is the most one request may move
        assert_eq!(p.max_request_ul(), 140_000);
        // half of it alt media: 187 sub-doses of media, alt media and waste
        assert_eq!(p.plan_exchange(140.0).unwrap().len(), 3 * 187);
        assert!(p.plan_exchange(140.5).is_err());
        assert!(p.plan_exchange(1e15).is_err());
        assert!(p.plan_single(Pump::AltMedia, f64::MAX).is_err());
        assert!(p.plan_single(Pump::Waste, 1e12).is_err());
        assert!(DosingPlanner::new(0.5, 0.0, 14.0, 14.0, 0.0).is_err());
    }

    #[test]
    fn single_pump_plan() {
        let p = planner(0.5);
        let a = p.plan_single(Pump::Media, 1.0).unwrap();
        assert_eq!(a.len(), 4);
        assert!(a.iter().all(|x| x.pump != Pump::AltMedia));
    }

    #[test]
    fn dosing_event_payload() {
        let e = DosingEvent::from_action(
            &IoAction { pump: Pump::AltMedia, volume_ul: 500 },
            "turbidostat",
        );
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["event"], "add_alt_media");
        assert_eq!(v["volume_change"], 0.5);
        assert_eq!(v["source_of_event"], "turbidostat");
    }
}
