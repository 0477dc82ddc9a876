/*!
This module reduces a state matrix to a single linear consensus with per-symbol confidence.
Each column votes for its most frequent state; gap winners emit nothing and merged insertion winners emit several symbols.
Columns without usable data fall back to the reference base (or the unknown symbol) with zero confidence.

# Example usage
```rust
use pilecon::alignment::{parse_cigar, AlignmentRecord};
use pilecon::consensus::ConsensusCaller;
use pilecon::polish_config::PolishConfigBuilder;
use pilecon::state_matrix::{BuildOptions, StateMatrix};

let config = PolishConfigBuilder::default().trim_ends(false).build().unwrap();
let records: Vec<AlignmentRecord> = [b"ACGT", b"ACGT", b"ACTT"].iter().enumerate()
    .map(|(i, s)| AlignmentRecord::new(i as u64, format!("r{i}"), 0, parse_cigar("4M").unwrap(), s.to_vec(), None, Some(8)))
    .collect();
let matrix = StateMatrix::build(records.iter(), 0..5, &BuildOptions::from_config(&config));

let caller = ConsensusCaller::from_config(&config);
let consensus = caller.call(&matrix, Some(b"ACGTA"));
assert_eq!(consensus.sequence(), b"ACGTA");
assert_eq!(consensus.confidence(), &[3.0, 3.0, 2.0, 3.0, 0.0]);
```
*/

use crate::phred::encode_frequencies;
use crate::polish_config::PolishConfig;
use crate::state_matrix::{Column, StateId, StateMatrix, StateTable, GAP_STATE};
use crate::variants::VariantSet;

/// Contains a final consensus result
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsensusResult {
    /// The consensus symbols
    sequence: Vec<u8>,
    /// Winning frequency for each symbol, 0 for fallbacks
    confidence: Vec<f64>,
    /// Column total for each symbol
    coverage: Vec<f64>,
    /// Reference column each symbol came from
    columns: Vec<usize>
}

impl ConsensusResult {
    /// Appends one symbol
    fn push(&mut self, symbol: u8, confidence: f64, coverage: f64, column: usize) {
        self.sequence.push(symbol);
        self.confidence.push(confidence);
        self.coverage.push(coverage);
        self.columns.push(column);
    }

    /// Phred-encoded confidence, parallel to the sequence
    pub fn confidence_string(&self, config: &PolishConfig) -> Vec<u8> {
        encode_frequencies(&self.confidence, config.phred_scale, config.max_phred, config.phred_offset)
    }

    /// Phred-encoded coverage, parallel to the sequence
    pub fn coverage_string(&self, config: &PolishConfig) -> Vec<u8> {
        encode_frequencies(&self.coverage, config.phred_scale, config.max_phred, config.phred_offset)
    }

    // getters
    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn confidence(&self) -> &[f64] {
        &self.confidence
    }

    pub fn coverage(&self) -> &[f64] {
        &self.coverage
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

/// Majority-vote consensus caller
#[derive(Clone, Debug)]
pub struct ConsensusCaller {
    /// Multi-base states longer than this never win
    max_ins_length: Option<usize>,
    /// Emitted for uncovered columns without a reference
    unknown_symbol: u8
}

impl ConsensusCaller {
    pub fn from_config(config: &PolishConfig) -> ConsensusCaller {
        ConsensusCaller {
            max_ins_length: config.max_ins_length,
            unknown_symbol: config.unknown_symbol
        }
    }

    /// Calls a plain majority consensus; ties go to the lowest state index.
    /// # Arguments
    /// * `matrix` - the accumulated observations
    /// * `reference` - optional reference for the fallback, indexed by absolute coordinate
    pub fn call(&self, matrix: &StateMatrix, reference: Option<&[u8]>) -> ConsensusResult {
        self.call_inner(matrix, reference, None)
    }

    /// Calls a majority consensus that breaks ties at SNP columns in favor of the reference base.
    /// # Arguments
    /// * `matrix` - the accumulated observations
    /// * `reference` - reference for the fallback and tie-breaking
    /// * `variants` - variant columns defining which columns are genuine SNPs
    pub fn call_preferring_reference(&self, matrix: &StateMatrix, reference: Option<&[u8]>, variants: &VariantSet) -> ConsensusResult {
        self.call_inner(matrix, reference, Some(variants))
    }

    fn call_inner(&self, matrix: &StateMatrix, reference: Option<&[u8]>, variants: Option<&VariantSet>) -> ConsensusResult {
        let states = matrix.states();
        let mut result = ConsensusResult::default();
        for (offset, column) in matrix.columns().iter().enumerate() {
            let coordinate = matrix.start() + offset;
            let reference_base = reference
                .and_then(|r| r.get(coordinate))
                .map(|b| b.to_ascii_uppercase());
            let total = column.total();

            let mut winner = if total > 0.0 {
                self.majority(column, states)
            } else {
                None
            };

            // at genuine SNP columns, a tie at the top goes to the reference allele
            if let (Some((_, best_freq)), Some(base), Some(vs)) = (winner, reference_base, variants) {
                let is_snp = vs.get(coordinate).map(|vc| vc.is_snp()).unwrap_or(false);
                if is_snp {
                    if let Some(ref_state) = states.get(&[base]) {
                        if column.frequency(ref_state) == best_freq {
                            winner = Some((ref_state, best_freq));
                        }
                    }
                }
            }

            match winner {
                Some((state, _)) if state == GAP_STATE => {},
                Some((state, frequency)) => {
                    for &symbol in states.label(state).iter() {
                        result.push(symbol, frequency, total, coordinate);
                    }
                },
                None => {
                    let symbol = reference_base.unwrap_or(self.unknown_symbol);
                    result.push(symbol, 0.0, total, coordinate);
                }
            };
        }
        result
    }

    /// Finds the first state reaching the maximum frequency, skipping over-long insertion states
    fn majority(&self, column: &Column, states: &StateTable) -> Option<(StateId, f64)> {
        let mut best: Option<(StateId, f64)> = None;
        for &(state, frequency) in column.entries().iter() {
            if let Some(max_len) = self.max_ins_length {
                if states.is_run(state) && states.label(state).len() > max_len {
                    continue;
                }
            }
            if best.map(|(_, f)| frequency > f).unwrap_or(true) {
                best = Some((state, frequency));
            }
        }
        best
    }
}
