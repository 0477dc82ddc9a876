/*!
Per-reference-column accumulation of observed states.
Every matrix owns its own state table: the five bases and the gap always have fixed indices, and multi-base states get the next free index the first time the matrix sees them.
Matrices are built from scratch for every call and never shared across rebuilds.

# Example usage
```rust
use pilecon::alignment::{parse_cigar, AlignmentRecord};
use pilecon::polish_config::PolishConfigBuilder;
use pilecon::state_matrix::{BuildOptions, StateMatrix};

let config = PolishConfigBuilder::default().trim_ends(false).build().unwrap();
let records = vec![
    AlignmentRecord::new(0, "r0".to_string(), 0, parse_cigar("4M").unwrap(), b"ACGT".to_vec(), None, Some(8)),
    AlignmentRecord::new(1, "r1".to_string(), 1, parse_cigar("3M").unwrap(), b"CTT".to_vec(), None, Some(6)),
];
let matrix = StateMatrix::build(records.iter(), 0..4, &BuildOptions::from_config(&config));
assert_eq!(matrix.column(1).unwrap().total(), 2.0);
assert_eq!(matrix.column(2).unwrap().entries().len(), 2);
assert_eq!(matrix.stats().decoded, 2);
```
*/

use log::{debug, warn};
use rustc_hash::FxHashMap as HashMap;
use std::ops::Range;

use crate::alignment::AlignmentRecord;
use crate::cigar_decoder::{CigarDecoder, DecodeOutcome, ObservedState, SkipReason};
use crate::phred::phred_to_freq;
use crate::polish_config::PolishConfig;

/// Index of a state within a single matrix
pub type StateId = u32;

/// Symbol used for the gap state
pub const GAP_SYMBOL: u8 = b'-';
/// The fixed single-symbol states, in index order
const FIXED_STATES: [u8; 6] = [b'A', b'C', b'G', b'T', b'N', GAP_SYMBOL];
/// Index of the gap state
pub const GAP_STATE: StateId = 5;
/// First index handed out to multi-base states
const FIRST_RUN_STATE: StateId = FIXED_STATES.len() as StateId;

/// Maps states to indices for a single matrix
#[derive(Clone, Debug)]
pub struct StateTable {
    /// The symbols for each state, by index
    labels: Vec<Vec<u8>>,
    /// Reverse lookup for multi-base states
    run_lookup: HashMap<Vec<u8>, StateId>
}

impl Default for StateTable {
    fn default() -> Self {
        StateTable {
            labels: FIXED_STATES.iter().map(|&s| vec![s]).collect(),
            run_lookup: Default::default()
        }
    }
}

impl StateTable {
    /// Returns the index for an observed state, allocating one for new multi-base states
    pub fn intern(&mut self, state: &ObservedState) -> StateId {
        match state {
            ObservedState::Base(b) => base_state(*b),
            ObservedState::Gap => GAP_STATE,
            ObservedState::Run(run) => {
                if let Some(&id) = self.run_lookup.get(run) {
                    id
                } else {
                    let id = self.labels.len() as StateId;
                    self.labels.push(run.clone());
                    self.run_lookup.insert(run.clone(), id);
                    id
                }
            }
        }
    }

    /// Looks up the index for a symbol string without allocating
    pub fn get(&self, symbols: &[u8]) -> Option<StateId> {
        if symbols.len() == 1 {
            FIXED_STATES.iter().position(|&s| s == symbols[0]).map(|p| p as StateId)
        } else {
            self.run_lookup.get(symbols).cloned()
        }
    }

    /// The symbols of a state; the gap state is `-`
    pub fn label(&self, id: StateId) -> &[u8] {
        &self.labels[id as usize]
    }

    /// True for multi-base states, i.e. anything carrying inserted bases
    pub fn is_run(&self, id: StateId) -> bool {
        id >= FIRST_RUN_STATE
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Fixed index of a single base; anything outside ACGT maps to N
fn base_state(base: u8) -> StateId {
    match base {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4
    }
}

/// Accumulated frequencies for one reference column, kept in state index order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Column {
    entries: Vec<(StateId, f64)>
}

impl Column {
    /// Adds frequency to a state. Non-positive frequencies are ignored so no empty states get created.
    pub fn add(&mut self, state: StateId, frequency: f64) {
        if frequency <= 0.0 {
            return;
        }
        match self.entries.binary_search_by_key(&state, |&(s, _)| s) {
            Ok(index) => self.entries[index].1 += frequency,
            Err(index) => self.entries.insert(index, (state, frequency))
        };
    }

    /// Frequency of one state, 0 if never observed
    pub fn frequency(&self, state: StateId) -> f64 {
        match self.entries.binary_search_by_key(&state, |&(s, _)| s) {
            Ok(index) => self.entries[index].1,
            Err(_) => 0.0
        }
    }

    /// Sum over all states
    pub fn total(&self) -> f64 {
        self.entries.iter().map(|&(_, f)| f).sum()
    }

    /// All observed states with their frequencies, in state index order
    pub fn entries(&self) -> &[(StateId, f64)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counts of what happened to the alignments offered to a build
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BuildStats {
    /// Alignments that contributed observations
    pub decoded: usize,
    /// Alignments skipped for being too short after trimming
    pub too_short: usize,
    /// Alignments skipped for losing too much to trimming
    pub too_much_trimmed: usize,
    /// Alignments with malformed CIGAR or sequence data
    pub malformed: usize,
    /// Observations dropped because they fell into an ignored range
    pub ignored_observations: usize
}

/// A prior track that seeds columns before any alignment is added
#[derive(Clone, Copy, Debug)]
pub struct SeedTrack<'a> {
    /// The bases, indexed by reference coordinate
    pub sequence: &'a [u8],
    /// Optional raw phred qualities parallel to `sequence`
    pub quality: Option<&'a [u8]>,
    /// Quality used when `quality` is absent
    pub default_quality: u8
}

/// Everything a matrix build needs besides the alignments
#[derive(Clone, Debug)]
pub struct BuildOptions<'a> {
    /// Decoder for each alignment
    pub decoder: CigarDecoder,
    /// If true, observations contribute a quality-derived frequency
    pub quality_weighting: bool,
    /// Scaling constant for the phred transform
    pub phred_scale: f64,
    /// Reference ranges where observations are dropped
    pub ignore_ranges: &'a [Range<usize>],
    /// Optional prior track
    pub seed: Option<SeedTrack<'a>>
}

impl<'a> BuildOptions<'a> {
    /// Creates options without ignored ranges or seeding
    pub fn from_config(config: &PolishConfig) -> BuildOptions<'a> {
        BuildOptions {
            decoder: CigarDecoder::from_config(config),
            quality_weighting: config.quality_weighting,
            phred_scale: config.phred_scale,
            ignore_ranges: &[],
            seed: None
        }
    }

    /// True if a column lies in any ignored range
    fn is_ignored(&self, column: usize) -> bool {
        self.ignore_ranges.iter().any(|r| r.contains(&column))
    }
}

/// Columns of accumulated observations over a half-open reference range
#[derive(Clone, Debug)]
pub struct StateMatrix {
    /// First reference coordinate covered
    start: usize,
    /// One column per coordinate in `start..start+columns.len()`
    columns: Vec<Column>,
    /// The state table for this matrix only
    states: StateTable,
    /// What happened during the build
    stats: BuildStats
}

impl StateMatrix {
    /// Builds a matrix over a reference range from a set of alignments.
    /// Malformed alignments are reported and skipped; the build always completes.
    /// # Arguments
    /// * `records` - the alignments to decode, in processing order
    /// * `range` - the half-open reference range to materialize
    /// * `options` - decoder, weighting, ignored ranges, and seeding
    pub fn build<'r, I>(records: I, range: Range<usize>, options: &BuildOptions) -> StateMatrix
        where I: IntoIterator<Item = &'r AlignmentRecord>
    {
        let start = range.start;
        let num_columns = range.end.saturating_sub(range.start);
        let mut matrix = StateMatrix {
            start,
            columns: vec![Default::default(); num_columns],
            states: Default::default(),
            stats: Default::default()
        };

        if let Some(seed) = options.seed.as_ref() {
            matrix.seed(seed, options.phred_scale);
        }

        for record in records.into_iter() {
            if record.position() >= range.end || record.reference_end() <= range.start {
                continue;
            }

            let observations = match options.decoder.decode(record) {
                Ok(DecodeOutcome::Observations(obs)) => obs,
                Ok(DecodeOutcome::Skipped(SkipReason::TooShort)) => {
                    matrix.stats.too_short += 1;
                    continue;
                },
                Ok(DecodeOutcome::Skipped(SkipReason::TooMuchTrimmed)) => {
                    matrix.stats.too_much_trimmed += 1;
                    continue;
                },
                Err(e) => {
                    warn!("Skipping alignment {} ({}): {}", record.id(), record.name(), e);
                    matrix.stats.malformed += 1;
                    continue;
                }
            };

            matrix.stats.decoded += 1;
            for obs in observations.iter() {
                if obs.column < range.start || obs.column >= range.end {
                    continue;
                }
                if options.is_ignored(obs.column) {
                    matrix.stats.ignored_observations += 1;
                    continue;
                }
                let frequency = if options.quality_weighting {
                    phred_to_freq(obs.quality, options.phred_scale)
                } else {
                    1.0
                };
                let state = matrix.states.intern(&obs.state);
                matrix.columns[obs.column - start].add(state, frequency);
            }
        }

        debug!("Built matrix over {}..{}: {:?}, {} states", range.start, range.end, matrix.stats, matrix.states.len());
        matrix
    }

    /// Adds the prior track to every column it covers
    fn seed(&mut self, seed: &SeedTrack, phred_scale: f64) {
        for (offset, column) in self.columns.iter_mut().enumerate() {
            let coordinate = self.start + offset;
            let base = match seed.sequence.get(coordinate) {
                Some(b) => b.to_ascii_uppercase(),
                None => break
            };
            if !matches!(base, b'A' | b'C' | b'G' | b'T') {
                continue;
            }
            let quality = seed.quality
                .and_then(|q| q.get(coordinate).cloned())
                .unwrap_or(seed.default_quality);
            // zero frequencies are dropped by the column itself
            column.add(base_state(base), phred_to_freq(quality, phred_scale));
        }
    }

    /// Returns the column at an absolute reference coordinate, if it is inside the matrix
    pub fn column(&self, coordinate: usize) -> Option<&Column> {
        coordinate.checked_sub(self.start).and_then(|offset| self.columns.get(offset))
    }

    /// Total frequency at an absolute reference coordinate, 0 outside the matrix
    pub fn coverage(&self, coordinate: usize) -> f64 {
        self.column(coordinate).map(|c| c.total()).unwrap_or(0.0)
    }

    /// The half-open reference range of this matrix
    pub fn range(&self) -> Range<usize> {
        self.start..(self.start + self.columns.len())
    }

    // getters
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn states(&self) -> &StateTable {
        &self.states
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }
}
