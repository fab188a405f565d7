//! Anti-starvation budget shared by the scheduler and every mailbox.
//!
//! An epoch is a fixed number of selection attempts.  Within an epoch the
//! highest ready class wins, except that each class is owed a floor of
//! attempts: once the attempts left in the epoch only just cover the floors
//! still owed to ready lower classes, those classes are served first.
//!
//! With the defaults (epoch 64, floors `low 4 / normal 8 / high 8 /
//! critical 0`) a saturated `Critical` stream still leaves four deliveries
//! per epoch to a waiting `Low` sender.

use esta_types::Priority;
use serde::{Deserialize, Serialize};

pub const DEFAULT_EPOCH_LENGTH: u32 = 64;

/// Minimum attempts reserved per class per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FairnessFloors {
    pub low: u32,
    pub normal: u32,
    pub high: u32,
    pub critical: u32,
}

impl Default for FairnessFloors {
    fn default() -> Self {
        Self {
            low: 4,
            normal: 8,
            high: 8,
            critical: 0,
        }
    }
}

impl FairnessFloors {
    /// Strict priority, no reservation.
    pub const NONE: FairnessFloors = FairnessFloors {
        low: 0,
        normal: 0,
        high: 0,
        critical: 0,
    };

    fn by_index(&self) -> [u32; 4] {
        [self.low, self.normal, self.high, self.critical]
    }

    pub fn total(&self) -> u32 {
        self.by_index().iter().sum()
    }
}

/// Per-epoch selection state.
///
/// # Example
///
/// ```
/// use esta_kernel::fairness::{FairnessBudget, FairnessFloors};
/// use esta_types::Priority;
///
/// let mut budget = FairnessBudget::new(4, FairnessFloors { low: 1, ..FairnessFloors::NONE });
/// let both = [true, false, false, true]; // Low and Critical ready
/// let picks: Vec<_> = (0..4).filter_map(|_| budget.select(both)).collect();
/// assert_eq!(picks, [Priority::Critical, Priority::Critical, Priority::Critical, Priority::Low]);
/// ```
#[derive(Debug, Clone)]
pub struct FairnessBudget {
    epoch_length: u32,
    floors: [u32; 4],
    served: [u32; 4],
    attempts: u32,
    epoch: u64,
}

impl Default for FairnessBudget {
    fn default() -> Self {
        Self::new(DEFAULT_EPOCH_LENGTH, FairnessFloors::default())
    }
}

impl FairnessBudget {
    pub fn new(epoch_length: u32, floors: FairnessFloors) -> Self {
        Self {
            epoch_length: epoch_length.max(1),
            floors: floors.by_index(),
            served: [0; 4],
            attempts: 0,
            epoch: 0,
        }
    }

    /// Choose the class to serve given which classes (indexed by
    /// [`Priority::index`]) have work.  Returns `None`, consuming nothing,
    /// when no class is ready.  Rolls into a new epoch automatically.
    pub fn select(&mut self, ready: [bool; 4]) -> Option<Priority> {
        if self.attempts >= self.epoch_length {
            self.reset_epoch();
        }
        let highest = Priority::DESCENDING
            .into_iter()
            .find(|p| ready[p.index()])?;

        let remaining = self.epoch_length - self.attempts;
        let owed = |p: Priority| self.floors[p.index()].saturating_sub(self.served[p.index()]);
        let owed_below: u32 = Priority::DESCENDING
            .into_iter()
            .filter(|&p| p < highest && ready[p.index()])
            .map(owed)
            .sum();

        let pick = if owed_below >= remaining {
            Priority::DESCENDING
                .into_iter()
                .find(|&p| p < highest && ready[p.index()] && owed(p) > 0)
                .unwrap_or(highest)
        } else {
            highest
        };

        self.served[pick.index()] += 1;
        self.attempts += 1;
        Some(pick)
    }

    /// Start a fresh epoch.
    pub fn reset_epoch(&mut self) {
        self.served = [0; 4];
        self.attempts = 0;
        self.epoch += 1;
    }

    pub fn served(&self, class: Priority) -> u32 {
        self.served[class.index()]
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn epoch_length(&self) -> u32 {
        self.epoch_length
    }
}
