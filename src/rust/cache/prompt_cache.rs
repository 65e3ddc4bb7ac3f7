use log::{debug, info};

use super::error::CacheError;
use super::region::PromptEntry;

/// Default number of prompt entries kept per session
pub const DEFAULT_CAPACITY: usize = 15;

/// Result of offering a volatile entry to the cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Stored at `slot`; `replaced` carries the confidence of the evicted entry
    Accepted { slot: usize, replaced: Option<f32> },
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    /// Cache is full and the offer does not beat the weakest volatile entry
    NotStronger { offered: f32, minimum: f32 },
    /// Cache is full of seeds
    NoVolatileSlot,
    /// Detection score is under the promotion floor
    BelowPromotionFloor { score: f32, floor: f32 },
}

/// Bounded list of prompt entries.
///
/// Seeds are ground truth and are never displaced by volatile entries. Once
/// the cache is full a volatile entry only gets in by replacing the weakest
/// volatile entry in place.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptCache {
    entries: Vec<PromptEntry>,
    capacity: usize,
}

impl Default for PromptCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PromptCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a seed entry.
    ///
    /// When the cache is full the weakest volatile entry is evicted and
    /// returned so the seed fits.
    ///
    /// # Errors
    /// - `SeedCapacityExceeded` if seeds already fill the whole capacity
    pub fn add_seed(&mut self, mut entry: PromptEntry) -> Result<Option<PromptEntry>, CacheError> {
        let seeds = self.seed_count();
        if seeds >= self.capacity {
            return Err(CacheError::SeedCapacityExceeded {
                seeds: seeds + 1,
                capacity: self.capacity,
            });
        }
        entry.is_seed = true;

        let evicted = if self.entries.len() >= self.capacity {
            self.weakest_volatile().map(|slot| {
                let evicted = self.entries.remove(slot);
                info!(
                    "Evicted volatile prompt {} (confidence {:.3}) to make room for a seed",
                    evicted.image_ref, evicted.group_confidence
                );
                evicted
            })
        } else {
            None
        };

        self.entries.push(entry);
        Ok(evicted)
    }

    /// Offers a self-generated entry to the cache.
    ///
    /// Below capacity the entry is appended. At capacity it replaces the
    /// volatile entry with the lowest confidence (first found on ties) only if
    /// its own confidence is strictly greater.
    pub fn add_or_replace_volatile(&mut self, mut entry: PromptEntry) -> Admission {
        entry.is_seed = false;

        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return Admission::Accepted {
                slot: self.entries.len() - 1,
                replaced: None,
            };
        }

        let Some(slot) = self.weakest_volatile() else {
            debug!("Cache full of seeds, rejecting volatile prompt {}", entry.image_ref);
            return Admission::Rejected(RejectReason::NoVolatileSlot);
        };

        let minimum = self.entries[slot].group_confidence;
        if entry.group_confidence > minimum {
            debug!(
                "Replacing volatile prompt at slot {} (confidence {:.3}) with {} (confidence {:.3})",
                slot, minimum, entry.image_ref, entry.group_confidence
            );
            self.entries[slot] = entry;
            Admission::Accepted {
                slot,
                replaced: Some(minimum),
            }
        } else {
            debug!(
                "Volatile prompt confidence {:.3} does not beat minimum {:.3}",
                entry.group_confidence, minimum
            );
            Admission::Rejected(RejectReason::NotStronger {
                offered: entry.group_confidence,
                minimum,
            })
        }
    }

    /// Removes every entry, seeds included
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn weakest_volatile(&self) -> Option<usize> {
        let mut weakest: Option<(usize, f32)> = None;
        for (slot, entry) in self.entries.iter().enumerate().filter(|(_, e)| !e.is_seed) {
            match weakest {
                Some((_, conf)) if entry.group_confidence >= conf => {}
                _ => weakest = Some((slot, entry.group_confidence)),
            }
        }
        weakest.map(|(slot, _)| slot)
    }

    /// Lowest confidence among volatile entries
    pub fn min_volatile_confidence(&self) -> Option<f32> {
        self.weakest_volatile().map(|slot| self.entries[slot].group_confidence)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PromptEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[PromptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn seed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_seed).count()
    }

    pub fn volatile_count(&self) -> usize {
        self.entries.len() - self.seed_count()
    }

    /// Total number of regions across all entries
    pub fn region_count(&self) -> usize {
        self.entries.iter().map(|e| e.regions.len()).sum()
    }
}

impl<'a> IntoIterator for &'a PromptCache {
    type Item = &'a PromptEntry;
    type IntoIter = std::slice::Iter<'a, PromptEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
