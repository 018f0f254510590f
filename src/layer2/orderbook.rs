// Order Book Reconciler
// Snapshot + delta -> per-side price levels with cumulative depth

use ordered_float::OrderedFloat;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::core::types::{BookEntry, BookSide};
use crate::layer2::view::ViewEntry;

type Price = OrderedFloat<f64>;
type Quantity = f64;

/// What a single delta did to the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Inserted(BookSide),
    Updated(BookSide),
    Removed(BookSide),
    /// No state change: delete of an absent level or an entry without a side
    Ignored,
}

impl DeltaOutcome {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, DeltaOutcome::Ignored)
    }
}

impl fmt::Display for DeltaOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeltaOutcome::Inserted(side) => write!(f, "Inserted({})", side),
            DeltaOutcome::Updated(side) => write!(f, "Updated({})", side),
            DeltaOutcome::Removed(side) => write!(f, "Removed({})", side),
            DeltaOutcome::Ignored => write!(f, "Ignored"),
        }
    }
}

/// A stored level (price, quantity > 0)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Default)]
pub struct BookStats {
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub snapshots_applied: u64,
    pub deltas_applied: u64,
    pub deltas_ignored: u64,
    pub version: u64,
}

impl fmt::Display for BookStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BookStats(bids={}, asks={}, snapshots={}, deltas={}, ignored={}, v={})",
            self.bid_levels, self.ask_levels, self.snapshots_applied,
            self.deltas_applied, self.deltas_ignored, self.version
        )
    }
}

/// Local book for one channel.
///
/// Owned by a single consumer; readers get immutable projections through
/// [`bid_entries`](Self::bid_entries) / [`ask_entries`](Self::ask_entries).
/// Every operation is total.
#[derive(Debug, Default)]
pub struct OrderBook {
    // BTreeMap keeps both sides sorted ascending; bids are walked in reverse
    bids: BTreeMap<Price, Quantity>,
    asks: BTreeMap<Price, Quantity>,

    version: u64,
    snapshots_applied: u64,
    deltas_applied: u64,
    deltas_ignored: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both sides with the levels of a full snapshot
    pub fn apply_snapshot(&mut self, entries: &[BookEntry]) {
        self.bids.clear();
        self.asks.clear();

        let mut skipped = 0usize;
        for entry in entries {
            if entry.count <= 0 || !entry.price.is_finite() || !entry.amount.is_finite() {
                skipped += 1;
                continue;
            }
            match entry.side() {
                Some(BookSide::Bid) => {
                    self.bids.insert(OrderedFloat(entry.price), entry.amount.abs());
                }
                Some(BookSide::Ask) => {
                    self.asks.insert(OrderedFloat(entry.price), entry.amount.abs());
                }
                None => skipped += 1,
            }
        }

        self.version += 1;
        self.snapshots_applied += 1;

        info!(
            bid_levels = self.bids.len(),
            ask_levels = self.asks.len(),
            skipped = skipped,
            version = self.version,
            "Snapshot applied"
        );
    }

    /// Apply one incremental update.
    ///
    /// `count > 0` upserts `|amount|` at `price` on the side given by the sign
    /// of `amount`, replacing any previous quantity. `count == 0` deletes the
    /// level; the feed then carries a normalized +1 (bid) / -1 (ask) flag in
    /// `amount`, so the same sign rule picks the side.
    pub fn apply_delta(&mut self, entry: BookEntry) -> DeltaOutcome {
        let outcome = self.reconcile(entry);

        if outcome.is_mutation() {
            self.version += 1;
            self.deltas_applied += 1;
            debug!(price = entry.price, outcome = %outcome, version = self.version, "Delta applied");
        } else {
            self.deltas_ignored += 1;
            debug!(price = entry.price, count = entry.count, amount = entry.amount, "Delta ignored");
        }

        outcome
    }

    fn reconcile(&mut self, entry: BookEntry) -> DeltaOutcome {
        if !entry.price.is_finite() || !entry.amount.is_finite() {
            warn!(entry = %entry, "Non-finite delta dropped");
            return DeltaOutcome::Ignored;
        }
        if entry.count < 0 {
            warn!(entry = %entry, "Negative count delta dropped");
            return DeltaOutcome::Ignored;
        }
        let Some(side) = entry.side() else {
            warn!(entry = %entry, "Zero amount delta dropped");
            return DeltaOutcome::Ignored;
        };

        let key = OrderedFloat(entry.price);
        let levels = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };

        if entry.count == 0 {
            return match levels.remove(&key) {
                Some(_) => DeltaOutcome::Removed(side),
                None => DeltaOutcome::Ignored,
            };
        }

        match levels.insert(key, entry.amount.abs()) {
            Some(_) => DeltaOutcome::Updated(side),
            None => DeltaOutcome::Inserted(side),
        }
    }

    /// Drop every level. Counts as a mutation.
    pub fn reset(&mut self) {
        debug!("Resetting OrderBook");
        self.bids.clear();
        self.asks.clear();
        self.version += 1;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Bids from the best (highest) price down, with running totals
    pub fn bid_entries(&self) -> Vec<ViewEntry> {
        accumulate(self.bids.iter().rev())
    }

    /// Asks from the best (lowest) price up, with running totals
    pub fn ask_entries(&self) -> Vec<ViewEntry> {
        accumulate(self.asks.iter())
    }

    pub fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(n)
            .map(|(price, &quantity)| PriceLevel { price: price.0, quantity })
            .collect()
    }

    pub fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(n)
            .map(|(price, &quantity)| PriceLevel { price: price.0, quantity })
            .collect()
    }

    pub fn get_stats(&self) -> BookStats {
        BookStats {
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
            snapshots_applied: self.snapshots_applied,
            deltas_applied: self.deltas_applied,
            deltas_ignored: self.deltas_ignored,
            version: self.version,
        }
    }
}

fn accumulate<'a>(levels: impl Iterator<Item = (&'a Price, &'a Quantity)>) -> Vec<ViewEntry> {
    let mut total = 0.0;
    levels
        .map(|(price, &quantity)| {
            total += quantity;
            ViewEntry {
                price: price.0,
                quantity,
                cumulative_total: total,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(price: f64, count: i64, amount: f64) -> BookEntry {
        BookEntry::new(price, count, amount)
    }

    fn triples(entries: &[ViewEntry]) -> Vec<(f64, f64, f64)> {
        entries.iter().map(|e| (e.price, e.quantity, e.cumulative_total)).collect()
    }

    fn seeded() -> OrderBook {
        let mut ob = OrderBook::new();
        ob.apply_snapshot(&[
            entry(100.0, 1, 2.0),
            entry(99.0, 1, 3.0),
            entry(101.0, 1, -1.5),
        ]);
        ob
    }

    #[test]
    fn test_snapshot_builds_sorted_sides() {
        let ob = seeded();
        assert_eq!(triples(&ob.bid_entries()), vec![(100.0, 2.0, 2.0), (99.0, 3.0, 5.0)]);
        assert_eq!(triples(&ob.ask_entries()), vec![(101.0, 1.5, 1.5)]);
        assert_eq!(ob.version(), 1);
    }

    #[test]
    fn test_delete_with_bid_flag() {
        let mut ob = seeded();
        assert_eq!(ob.apply_delta(entry(100.0, 0, 1.0)), DeltaOutcome::Removed(BookSide::Bid));
        assert_eq!(triples(&ob.bid_entries()), vec![(99.0, 3.0, 3.0)]);
        assert_eq!(ob.version(), 2);
    }

    #[test]
    fn test_insert_ask_keeps_ascending_order() {
        let mut ob = seeded();
        assert_eq!(ob.apply_delta(entry(102.0, 2, -4.0)), DeltaOutcome::Inserted(BookSide::Ask));
        assert_eq!(triples(&ob.ask_entries()), vec![(101.0, 1.5, 1.5), (102.0, 4.0, 5.5)]);

        // Lower ask lands first and shifts every total
        ob.apply_delta(entry(100.5, 1, -0.5));
        assert_eq!(
            triples(&ob.ask_entries()),
            vec![(100.5, 0.5, 0.5), (101.0, 1.5, 2.0), (102.0, 4.0, 6.0)]
        );
    }

    #[test]
    fn test_upsert_replaces_quantity() {
        let mut ob = seeded();
        assert_eq!(ob.apply_delta(entry(99.0, 4, 7.0)), DeltaOutcome::Updated(BookSide::Bid));
        assert_eq!(ob.top_bids(2)[1], PriceLevel { price: 99.0, quantity: 7.0 });
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut once = seeded();
        once.apply_delta(entry(98.0, 1, 1.25));

        let mut twice = seeded();
        twice.apply_delta(entry(98.0, 1, 1.25));
        twice.apply_delta(entry(98.0, 1, 1.25));

        assert_eq!(once.bid_entries(), twice.bid_entries());
        assert_eq!(once.ask_entries(), twice.ask_entries());
    }

    #[test]
    fn test_delete_absent_level_is_noop() {
        let mut ob = seeded();
        let before = (ob.bid_entries(), ob.ask_entries(), ob.version());

        assert_eq!(ob.apply_delta(entry(55.0, 0, 1.0)), DeltaOutcome::Ignored);
        // Flag picks the ask side, where 100 does not exist
        assert_eq!(ob.apply_delta(entry(100.0, 0, -1.0)), DeltaOutcome::Ignored);

        assert_eq!((ob.bid_entries(), ob.ask_entries(), ob.version()), before);
        assert_eq!(ob.get_stats().deltas_ignored, 2);
    }

    #[test]
    fn test_unsided_and_malformed_deltas_ignored() {
        let mut ob = seeded();
        let version = ob.version();
        assert_eq!(ob.apply_delta(entry(100.0, 3, 0.0)), DeltaOutcome::Ignored);
        assert_eq!(ob.apply_delta(entry(100.0, 3, f64::NAN)), DeltaOutcome::Ignored);
        assert_eq!(ob.apply_delta(entry(100.0, -1, 1.0)), DeltaOutcome::Ignored);
        assert_eq!(ob.apply_delta(entry(f64::INFINITY, 1, 1.0)), DeltaOutcome::Ignored);
        assert_eq!(ob.version(), version);
    }

    #[test]
    fn test_snapshot_discards_previous_levels() {
        let mut ob = seeded();
        ob.apply_snapshot(&[
            entry(200.0, 1, 1.0),
            entry(201.0, 0, -1.0), // count 0 skipped
            entry(202.0, 2, 0.0),  // no side skipped
            entry(203.0, 1, -2.0),
        ]);
        assert_eq!(triples(&ob.bid_entries()), vec![(200.0, 1.0, 1.0)]);
        assert_eq!(triples(&ob.ask_entries()), vec![(203.0, 2.0, 2.0)]);
        assert_eq!(ob.version(), 2);
    }

    #[test]
    fn test_cumulative_totals_monotonic() {
        let mut ob = OrderBook::new();
        let entries: Vec<BookEntry> = (0..25)
            .flat_map(|i| {
                let i = i as f64;
                [entry(1000.0 - i, 1, 0.1 + i), entry(1001.0 + i, 2, -(0.2 + i))]
            })
            .collect();
        ob.apply_snapshot(&entries);

        for side in [ob.bid_entries(), ob.ask_entries()] {
            let mut sum = 0.0;
            for (i, e) in side.iter().enumerate() {
                sum += e.quantity;
                assert!((e.cumulative_total - sum).abs() < 1e-9);
                if i > 0 {
                    assert!(e.cumulative_total >= side[i - 1].cumulative_total);
                }
            }
        }

        let bids = ob.bid_entries();
        assert!(bids.windows(2).all(|w| w[0].price > w[1].price));
        let asks = ob.ask_entries();
        assert!(asks.windows(2).all(|w| w[0].price < w[1].price));
    }

    #[test]
    fn test_reset_bumps_version() {
        let mut ob = seeded();
        ob.reset();
        assert!(ob.is_empty());
        assert_eq!(ob.version(), 2);
    }

    #[test]
    fn test_stats() {
        let mut ob = seeded();
        ob.apply_delta(entry(98.0, 1, 1.0));
        ob.apply_delta(entry(42.0, 0, 1.0));
        let stats = ob.get_stats();
        assert_eq!(stats.bid_levels, 3);
        assert_eq!(stats.ask_levels, 1);
        assert_eq!(stats.snapshots_applied, 1);
        assert_eq!(stats.deltas_applied, 1);
        assert_eq!(stats.deltas_ignored, 1);
        assert_eq!(stats.version, 2);
    }
}
