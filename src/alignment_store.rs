/*!
Bounded, score-ranked retention of alignments, partitioned into fixed-width genomic bins.
Each bin keeps a per-bin budget of aligned bases; once the budget is reached, a new alignment only gets in by displacing the lowest ranked one.

# Example usage
```rust
use pilecon::alignment::{AlignmentRecord, CigarOp, CigarUnit};
use pilecon::alignment_store::{AdmitOutcome, AlignmentStore};

// 1 bin of 100 bases with room for a single 100 bp alignment
let mut store = AlignmentStore::new(100, 100, 1, 40.0);
let make = |id: u64, score: i64| AlignmentRecord::new(
    id, format!("read_{id}"), 0, vec![CigarUnit::new(CigarOp::Match, 100)], vec![b'A'; 100], None, Some(score)
);
assert_eq!(store.admit(make(0, 150)), AdmitOutcome::Admitted);
assert_eq!(store.admit(make(1, 100)), AdmitOutcome::Rejected);
assert_eq!(store.admit(make(2, 190)), AdmitOutcome::Admitted);
assert_eq!(store.len(), 1);
assert!(store.get(2).is_some());
```
*/

use log::{trace, warn};
use rustc_hash::FxHashMap as HashMap;

use crate::alignment::AlignmentRecord;
use crate::cigar_decoder::validate;

/// The result of offering an alignment to the store
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdmitOutcome {
    /// The alignment is now retained, possibly after displacing a lower ranked one
    Admitted,
    /// The bin is full and the alignment does not outrank its lowest member
    Rejected,
    /// The alignment has no raw score, so it cannot be ranked
    Unscored,
    /// The CIGAR does not describe the sequence, or uses operations the decoder cannot handle
    Malformed
}

/// One fixed-width genomic bin.
/// Holds the retained ids with their ranking scores and aligned lengths, co-indexed and sorted by descending score.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bin {
    /// Retained alignment identifiers
    ids: Vec<u64>,
    /// Ranking score for each retained alignment
    scores: Vec<f64>,
    /// Aligned length for each retained alignment
    lengths: Vec<usize>,
    /// Running sum of `lengths`
    total_bases: usize
}

impl Bin {
    /// Inserts an entry after every entry with an equal or higher score
    fn insert(&mut self, id: u64, score: f64, length: usize) {
        let index = self.scores.partition_point(|&s| s >= score);
        self.ids.insert(index, id);
        self.scores.insert(index, score);
        self.lengths.insert(index, length);
        self.total_bases += length;
    }

    /// Removes the entry at a given index and returns its id
    fn remove_at(&mut self, index: usize) -> u64 {
        let id = self.ids.remove(index);
        self.scores.remove(index);
        let length = self.lengths.remove(index);
        self.total_bases -= length;
        id
    }

    /// Removes the lowest ranked entry, returning its id
    fn pop_lowest(&mut self) -> Option<u64> {
        if self.ids.is_empty() {
            None
        } else {
            Some(self.remove_at(self.ids.len() - 1))
        }
    }

    /// Removes a specific id, returns true if it was present
    fn remove_id(&mut self, id: u64) -> bool {
        match self.ids.iter().position(|&i| i == id) {
            Some(index) => {
                self.remove_at(index);
                true
            },
            None => false
        }
    }

    /// The score of the lowest ranked entry
    pub fn lowest_score(&self) -> Option<f64> {
        self.scores.last().cloned()
    }

    // getters
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn total_bases(&self) -> usize {
        self.total_bases
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Owns the retained alignments for a single reference and the bins that rank them.
/// Rejected and evicted alignments are dropped.
#[derive(Clone, Debug)]
pub struct AlignmentStore {
    /// Width of each bin in reference bases
    bin_size: usize,
    /// The current maximum coverage, this may shrink at run-time
    max_coverage: usize,
    /// Per-bin budget of aligned bases, `bin_size * max_coverage`
    bin_max_bases: usize,
    /// The short alignment correction constant for ranking
    short_alignment_penalty: f64,
    /// All bins, covering the full reference
    bins: Vec<Bin>,
    /// Every retained alignment by id
    records: HashMap<u64, AlignmentRecord>
}

impl AlignmentStore {
    /// Creates an empty store with `ceil(reference_length / bin_size)` bins (at least one).
    /// # Arguments
    /// * `reference_length` - length of the reference sequence
    /// * `bin_size` - width of each bin, must be > 0
    /// * `max_coverage` - initial coverage budget per bin
    /// * `short_alignment_penalty` - correction constant for the ranking score
    pub fn new(reference_length: usize, bin_size: usize, max_coverage: usize, short_alignment_penalty: f64) -> AlignmentStore {
        assert!(bin_size > 0);
        let num_bins = reference_length.div_ceil(bin_size).max(1);
        AlignmentStore {
            bin_size,
            max_coverage,
            bin_max_bases: bin_size.saturating_mul(max_coverage),
            short_alignment_penalty,
            bins: vec![Default::default(); num_bins],
            records: Default::default()
        }
    }

    /// Returns the bin an alignment belongs to, based on the center of its aligned query bases.
    /// Alignments hanging off the reference end go into the last bin.
    pub fn bin_index(&self, record: &AlignmentRecord) -> usize {
        let center = record.position() + record.length() / 2;
        (center / self.bin_size).min(self.bins.len() - 1)
    }

    /// Offers an alignment to the store.
    /// If the target bin still has room, the alignment is inserted in score order.
    /// Otherwise, it must strictly outrank the lowest scoring member, which then gets evicted.
    /// Re-admitting an id that is already retained replaces the old copy.
    /// Malformed alignments never take up room, and leave any retained copy with the same id in place.
    /// # Arguments
    /// * `record` - the alignment to admit
    pub fn admit(&mut self, record: AlignmentRecord) -> AdmitOutcome {
        if let Err(e) = validate(&record) {
            warn!("Alignment {} ({}) not admitted: {}", record.id(), record.name(), e);
            return AdmitOutcome::Malformed;
        }
        let score = match record.length_corrected_score(self.short_alignment_penalty) {
            Some(s) => s,
            None => return AdmitOutcome::Unscored
        };

        let id = record.id();
        if self.records.contains_key(&id) {
            trace!("Re-admitting alignment {id}, dropping the previous copy");
            self.remove(id);
        }

        let bin_index = self.bin_index(&record);
        let bin_max_bases = self.bin_max_bases;
        let bin = &mut self.bins[bin_index];
        if bin.total_bases < bin_max_bases {
            bin.insert(id, score, record.length());
        } else {
            match bin.lowest_score() {
                Some(lowest) if score > lowest => {
                    let evicted = bin.pop_lowest().unwrap();
                    bin.insert(id, score, record.length());
                    self.records.remove(&evicted);
                    trace!("Alignment {id} ({score:.3}) evicted {evicted} ({lowest:.3}) from bin {bin_index}");
                },
                _ => {
                    trace!("Alignment {id} ({score:.3}) rejected from full bin {bin_index}");
                    return AdmitOutcome::Rejected;
                }
            };
        }

        self.records.insert(id, record);
        AdmitOutcome::Admitted
    }

    /// Removes an alignment from the store, returning it if it was retained.
    pub fn remove(&mut self, id: u64) -> Option<AlignmentRecord> {
        let record = self.records.remove(&id)?;
        let bin_index = self.bin_index(&record);
        let removed = self.bins[bin_index].remove_id(id);
        assert!(removed);
        Some(record)
    }

    /// Changes the coverage budget of every bin.
    /// When shrinking, each bin evicts its lowest ranked alignments until it fits, but always keeps at least one.
    /// Returns the number of evicted alignments.
    /// # Arguments
    /// * `max_coverage` - the new maximum coverage
    pub fn set_capacity(&mut self, max_coverage: usize) -> usize {
        self.max_coverage = max_coverage;
        self.bin_max_bases = self.bin_size.saturating_mul(max_coverage);

        let mut evicted = 0;
        for bin in self.bins.iter_mut() {
            while bin.total_bases > self.bin_max_bases && bin.len() > 1 {
                let id = bin.pop_lowest().unwrap();
                self.records.remove(&id);
                evicted += 1;
            }
        }
        trace!("set_capacity({max_coverage}) evicted {evicted} alignments");
        evicted
    }

    /// Returns the retained alignments of one bin in rank order
    pub fn bin_alignments(&self, bin_index: usize) -> Vec<&AlignmentRecord> {
        self.bins[bin_index].ids().iter()
            .map(|id| &self.records[id])
            .collect()
    }

    /// Returns every bin overlapping the half-open reference range `[from, to)`, each as a list of alignments in rank order.
    /// # Arguments
    /// * `from` - inclusive start coordinate
    /// * `to` - exclusive end coordinate
    pub fn alignments_in_range(&self, from: usize, to: usize) -> Vec<Vec<&AlignmentRecord>> {
        if from >= to {
            return vec![];
        }
        let first = (from / self.bin_size).min(self.bins.len());
        let last = ((to - 1) / self.bin_size + 1).min(self.bins.len());
        (first..last)
            .map(|bin_index| self.bin_alignments(bin_index))
            .collect()
    }

    /// Returns every retained alignment, bin by bin in rank order.
    /// # Arguments
    /// * `sorted_by_position` - if true, the output is instead sorted by reference position (then id)
    pub fn retained(&self, sorted_by_position: bool) -> Vec<&AlignmentRecord> {
        let mut ret: Vec<&AlignmentRecord> = (0..self.bins.len())
            .flat_map(|bin_index| self.bin_alignments(bin_index))
            .collect();
        if sorted_by_position {
            ret.sort_by_key(|r| (r.position(), r.id()));
        }
        ret
    }

    /// The aligned-base total of every bin
    pub fn bin_totals(&self) -> Vec<usize> {
        self.bins.iter().map(|b| b.total_bases()).collect()
    }

    pub fn get(&self, id: u64) -> Option<&AlignmentRecord> {
        self.records.get(&id)
    }

    // getters
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    pub fn bin_size(&self) -> usize {
        self.bin_size
    }

    pub fn max_coverage(&self) -> usize {
        self.max_coverage
    }

    pub fn bin_max_bases(&self) -> usize {
        self.bin_max_bases
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
