//! Maps heights to the cycles registering or running at that height.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::{
    cycle::{CycleParameters, Height},
    errors::ParamsError,
};

/// Generates an unbounded sequence of cycles whose registration phases overlap
/// by `registration_overlap` blocks.
///
/// Cycle `n` starts at `first_cycle.start + n * (registration_duration -
/// registration_overlap)` and uses the durations of `first_cycle`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct OverlappedCycleGenerator {
    first_cycle: CycleParameters,
    registration_overlap: u32,
}

impl OverlappedCycleGenerator {
    pub fn new(
        first_cycle: CycleParameters,
        registration_overlap: u32,
    ) -> Result<Self, ParamsError> {
        let generator = Self {
            first_cycle,
            registration_overlap,
        };
        generator.validate()?;
        Ok(generator)
    }

    /// Re-checks invariants, for instances that came from deserialization.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.registration_overlap >= self.first_cycle.registration_duration {
            return Err(ParamsError::OverlapTooLarge {
                overlap: self.registration_overlap,
                registration: self.first_cycle.registration_duration,
            });
        }
        self.first_cycle.validate()
    }

    pub fn first_cycle(&self) -> &CycleParameters {
        &self.first_cycle
    }

    pub fn registration_overlap(&self) -> u32 {
        self.registration_overlap
    }

    /// Blocks between the starts of two consecutive cycles.
    pub fn spacing(&self) -> u32 {
        self.first_cycle.registration_duration - self.registration_overlap
    }

    fn nth_start(&self, n: u32) -> Option<Height> {
        n.checked_mul(self.spacing())
            .and_then(|off| self.first_cycle.start.checked_add(off))
    }

    /// Index of the last cycle that starts at or before `height`.
    fn last_started_index(&self, height: Height) -> Option<u32> {
        let since_first = height.checked_sub(self.first_cycle.start)?;
        Some(since_first / self.spacing())
    }

    /// Cycle starting exactly at `start`, if the generator produces one.
    pub fn cycle_at(&self, start: Height) -> Option<CycleParameters> {
        let since_first = start.checked_sub(self.first_cycle.start)?;
        if since_first % self.spacing() != 0 {
            return None;
        }
        Some(self.first_cycle.with_start(start))
    }

    /// The most recently started cycle whose registration phase contains
    /// `height`.
    ///
    /// With a non-zero overlap two cycles can be registering at once; the
    /// newer one leaves more time for the rest of the protocol.
    pub fn registering_cycle(&self, height: Height) -> Option<CycleParameters> {
        let n = self.last_started_index(height)?;
        let start = self.nth_start(n)?;
        let cycle = self.first_cycle.with_start(start);
        cycle
            .periods()
            .registration
            .contains(height)
            .then_some(cycle)
    }

    /// All cycles whose total period contains `height`, oldest first.
    pub fn active_cycles(&self, height: Height) -> Vec<CycleParameters> {
        let Some(last) = self.last_started_index(height) else {
            return Vec::new();
        };

        let total = self.first_cycle.total_duration();
        let mut cycles = Vec::new();
        for n in (0..=last).rev() {
            let Some(start) = self.nth_start(n) else {
                continue;
            };
            if start.saturating_add(total) <= height {
                break;
            }
            cycles.push(self.first_cycle.with_start(start));
        }
        cycles.reverse();
        cycles
    }
}
