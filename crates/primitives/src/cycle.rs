//! Cycle layout: phase durations, derived height ranges and lock times.

use std::{cmp::Ordering, fmt};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::errors::ParamsError;

/// Block height.
pub type Height = u32;

/// Heights at or above this value are interpreted as timestamps by `nLockTime`.
const MAX_LOCK_HEIGHT: Height = 500_000_000;

/// Ordered stages of one cycle.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
#[borsh(use_discriminant = false)]
pub enum CyclePhase {
    Registration,
    ClientChannelEstablishment,
    TumblerChannelEstablishment,
    PaymentPhase,
    TumblerCashoutPhase,
    ClientCashoutPhase,
}

impl CyclePhase {
    pub const ALL: [CyclePhase; 6] = [
        CyclePhase::Registration,
        CyclePhase::ClientChannelEstablishment,
        CyclePhase::TumblerChannelEstablishment,
        CyclePhase::PaymentPhase,
        CyclePhase::TumblerCashoutPhase,
        CyclePhase::ClientCashoutPhase,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CyclePhase::Registration => "registration",
            CyclePhase::ClientChannelEstablishment => "client-channel-establishment",
            CyclePhase::TumblerChannelEstablishment => "tumbler-channel-establishment",
            CyclePhase::PaymentPhase => "payment",
            CyclePhase::TumblerCashoutPhase => "tumbler-cashout",
            CyclePhase::ClientCashoutPhase => "client-cashout",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Half-open height range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CyclePeriod {
    pub start: Height,
    pub end: Height,
}

impl CyclePeriod {
    pub fn new(start: Height, end: Height) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, height: Height) -> bool {
        self.start <= height && height < self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Height ranges of every phase of one cycle, laid out back to back.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CyclePeriods {
    pub registration: CyclePeriod,
    pub client_channel_establishment: CyclePeriod,
    pub tumbler_channel_establishment: CyclePeriod,
    pub payment: CyclePeriod,
    pub tumbler_cashout: CyclePeriod,
    pub client_cashout: CyclePeriod,
    pub total: CyclePeriod,
}

impl CyclePeriods {
    pub fn get(&self, phase: CyclePhase) -> CyclePeriod {
        match phase {
            CyclePhase::Registration => self.registration,
            CyclePhase::ClientChannelEstablishment => self.client_channel_establishment,
            CyclePhase::TumblerChannelEstablishment => self.tumbler_channel_establishment,
            CyclePhase::PaymentPhase => self.payment,
            CyclePhase::TumblerCashoutPhase => self.tumbler_cashout,
            CyclePhase::ClientCashoutPhase => self.client_cashout,
        }
    }
}

/// Durations of one cycle, anchored at `start`.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct CycleParameters {
    pub start: Height,
    pub registration_duration: u32,
    pub client_channel_establishment_duration: u32,
    pub tumbler_channel_establishment_duration: u32,
    pub payment_phase_duration: u32,
    pub tumbler_cashout_duration: u32,
    pub client_cashout_duration: u32,
    pub safety_period_duration: u32,
}

impl CycleParameters {
    /// Checks that every phase is non-empty and that the cycle, including the
    /// safety period, fits below the lock time height limit.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let durations = [
            (self.registration_duration, "registration"),
            (self.client_channel_establishment_duration, "client-channel-establishment"),
            (self.tumbler_channel_establishment_duration, "tumbler-channel-establishment"),
            (self.payment_phase_duration, "payment"),
            (self.tumbler_cashout_duration, "tumbler-cashout"),
            (self.client_cashout_duration, "client-cashout"),
        ];
        if let Some(&(_, name)) = durations.iter().find(|(d, _)| *d == 0) {
            return Err(ParamsError::EmptyPhase(name));
        }

        let end = durations
            .iter()
            .try_fold(self.start, |acc, (d, _)| acc.checked_add(*d))
            .and_then(|e| e.checked_add(self.safety_period_duration))
            .ok_or(ParamsError::HeightOverflow(self.start))?;
        if end >= MAX_LOCK_HEIGHT {
            return Err(ParamsError::HeightOverflow(self.start));
        }
        Ok(())
    }

    /// Number of blocks from `start` to the end of the client cashout phase.
    pub fn total_duration(&self) -> u32 {
        self.registration_duration
            + self.client_channel_establishment_duration
            + self.tumbler_channel_establishment_duration
            + self.payment_phase_duration
            + self.tumbler_cashout_duration
            + self.client_cashout_duration
    }

    /// Returns a copy of these durations anchored at a different start height.
    pub fn with_start(&self, start: Height) -> Self {
        Self { start, ..*self }
    }

    pub fn periods(&self) -> CyclePeriods {
        let mut cursor = self.start;
        let mut next = |len: u32| {
            let period = CyclePeriod::new(cursor, cursor + len);
            cursor = period.end;
            period
        };

        let registration = next(self.registration_duration);
        let client_channel_establishment = next(self.client_channel_establishment_duration);
        let tumbler_channel_establishment = next(self.tumbler_channel_establishment_duration);
        let payment = next(self.payment_phase_duration);
        let tumbler_cashout = next(self.tumbler_cashout_duration);
        let client_cashout = next(self.client_cashout_duration);

        CyclePeriods {
            registration,
            client_channel_establishment,
            tumbler_channel_establishment,
            payment,
            tumbler_cashout,
            client_cashout,
            total: CyclePeriod::new(self.start, client_cashout.end),
        }
    }

    /// Phase containing `height`, or `None` outside the cycle.
    pub fn phase_at(&self, height: Height) -> Option<CyclePhase> {
        let periods = self.periods();
        CyclePhase::ALL
            .into_iter()
            .find(|phase| periods.get(*phase).contains(height))
    }

    pub fn is_in_phase(&self, phase: CyclePhase, height: Height) -> bool {
        self.periods().get(phase).contains(height)
    }

    pub fn is_active(&self, height: Height) -> bool {
        self.periods().total.contains(height)
    }

    /// Refund lock time of the escrow funded by the tumbler.
    pub fn tumbler_lock_time(&self) -> Height {
        self.periods().tumbler_cashout.end + self.safety_period_duration
    }

    /// Refund lock time of the escrow funded by the client.
    pub fn client_lock_time(&self) -> Height {
        self.periods().client_cashout.end + self.safety_period_duration
    }

    /// Renders the cycle as one character per block, `#` for elapsed blocks,
    /// `>` for the current block and `.` for blocks still ahead, phases
    /// separated by `|`.
    pub fn ascii_art(&self, height: Height) -> String {
        let periods = self.periods();
        let mut out = String::with_capacity(self.total_duration() as usize + 6);
        for (i, phase) in CyclePhase::ALL.into_iter().enumerate() {
            if i > 0 {
                out.push('|');
            }
            let period = periods.get(phase);
            for h in period.start..period.end {
                out.push(match h.cmp(&height) {
                    Ordering::Less => '#',
                    Ordering::Equal => '>',
                    Ordering::Greater => '.',
                });
            }
        }
        out
    }
}
