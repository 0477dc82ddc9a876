/*!
Ranked candidate states per column, reduced from a state matrix.

# Example usage
```rust
use pilecon::state_matrix::Column;
use pilecon::variants::rank_column;

// A: 20, G: 5, T: 1
let mut column = Column::default();
column.add(0, 20.0);
column.add(2, 5.0);
column.add(3, 1.0);

let calls = rank_column(&column, |s| vec![b"ACGT"[s as usize]], 4.0, 0.0);
let symbols: Vec<&[u8]> = calls.iter().map(|c| c.state.as_slice()).collect();
assert_eq!(symbols, vec![b"A".as_slice(), b"G".as_slice()]);

let calls = rank_column(&column, |s| vec![b"ACGT"[s as usize]], 0.0, 0.5);
assert_eq!(calls.len(), 1);
```
*/

use itertools::Itertools;

use crate::state_matrix::{Column, StateId, StateMatrix};

/// One candidate state for a column
#[derive(Clone, Debug, PartialEq)]
pub struct VariantCall {
    /// The symbols of the state, `-` for a gap
    pub state: Vec<u8>,
    /// Accumulated frequency
    pub frequency: f64,
    /// Frequency divided by the column total
    pub probability: f64
}

impl VariantCall {
    /// True if the state is exactly one of A, C, G, T
    pub fn is_pure_base(&self) -> bool {
        self.state.len() == 1 && matches!(self.state[0], b'A' | b'C' | b'G' | b'T')
    }
}

/// Candidates for one reference column, by descending frequency
#[derive(Clone, Debug, PartialEq)]
pub struct VariantColumn {
    /// 0-based reference coordinate
    pub column: usize,
    /// Total frequency observed in the column
    pub coverage: f64,
    /// Retained candidates, never empty
    pub calls: Vec<VariantCall>
}

impl VariantColumn {
    /// True if more than one candidate survived the thresholds
    pub fn is_polymorphic(&self) -> bool {
        self.calls.len() > 1
    }

    /// True for a genuine SNP column: two or more candidates, all single valid bases
    pub fn is_snp(&self) -> bool {
        self.is_polymorphic() && self.calls.iter().all(|c| c.is_pure_base())
    }

    /// Returns the candidate for a single base, if it survived
    pub fn call_for(&self, base: u8) -> Option<&VariantCall> {
        self.calls.iter().find(|c| c.state.len() == 1 && c.state[0] == base)
    }

    /// The top ranked candidate
    pub fn top(&self) -> &VariantCall {
        &self.calls[0]
    }
}

/// The variant columns for a full matrix, together with the retention generation they were computed on
#[derive(Clone, Debug, PartialEq)]
pub struct VariantSet {
    /// First reference coordinate
    start: usize,
    /// One entry per matrix column
    columns: Vec<VariantColumn>,
    /// Generation of the alignment store these were computed from
    generation: u64
}

impl VariantSet {
    /// Calls variants for every column of a matrix.
    /// # Arguments
    /// * `matrix` - the matrix to reduce
    /// * `min_freq` - minimum frequency for a candidate
    /// * `min_prob` - minimum fraction of the column total for a candidate
    /// * `unknown_symbol` - placeholder state for columns without data
    /// * `generation` - the store generation the matrix was built from
    pub fn call(matrix: &StateMatrix, min_freq: f64, min_prob: f64, unknown_symbol: u8, generation: u64) -> VariantSet {
        let states = matrix.states();
        let columns = matrix.columns().iter()
            .enumerate()
            .map(|(offset, column)| {
                let coverage = column.total();
                let calls = if coverage > 0.0 {
                    rank_column(column, |s| states.label(s).to_vec(), min_freq, min_prob)
                } else {
                    vec![VariantCall { state: vec![unknown_symbol], frequency: 0.0, probability: 0.0 }]
                };
                VariantColumn { column: matrix.start() + offset, coverage, calls }
            })
            .collect();

        VariantSet {
            start: matrix.start(),
            columns,
            generation
        }
    }

    /// Returns the variant column at an absolute reference coordinate
    pub fn get(&self, coordinate: usize) -> Option<&VariantColumn> {
        coordinate.checked_sub(self.start).and_then(|offset| self.columns.get(offset))
    }

    /// Iterates over the genuine SNP columns
    pub fn snp_columns(&self) -> impl Iterator<Item = &VariantColumn> {
        self.columns.iter().filter(|c| c.is_snp())
    }

    // getters
    pub fn columns(&self) -> &[VariantColumn] {
        &self.columns
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Ranks the states of a single covered column and truncates them by both thresholds.
/// At least the top candidate is always kept.
/// # Arguments
/// * `column` - the column to rank, must have a positive total
/// * `label` - maps a state index to its symbols
/// * `min_freq` - minimum frequency
/// * `min_prob` - minimum fraction of the column total
pub fn rank_column<F>(column: &Column, label: F, min_freq: f64, min_prob: f64) -> Vec<VariantCall>
    where F: Fn(StateId) -> Vec<u8>
{
    let total = column.total();
    // stable sort, so ties stay in state index order
    let ranked: Vec<(StateId, f64)> = column.entries().iter()
        .cloned()
        .sorted_by(|a, b| b.1.total_cmp(&a.1))
        .collect();

    let k_freq = ranked.iter().filter(|&&(_, f)| f >= min_freq).count();
    let k_prob = ranked.iter().filter(|&&(_, f)| f / total >= min_prob).count();
    let keep = k_freq.min(k_prob).max(1);

    ranked.into_iter()
        .take(keep)
        .map(|(state, frequency)| VariantCall {
            state: label(state),
            frequency,
            probability: frequency / total
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::alignment::{parse_cigar, AlignmentRecord};
    use crate::polish_config::PolishConfigBuilder;
    use crate::state_matrix::BuildOptions;

    fn base_label(s: StateId) -> Vec<u8> {
        vec![b"ACGTN-"[s as usize]]
    }

    fn example_column() -> Column {
        let mut column = Column::default();
        column.add(3, 1.0);
        column.add(0, 20.0);
        column.add(2, 5.0);
        column
    }

    #[test]
    fn test_rank_min_freq() {
        let calls = rank_column(&example_column(), base_label, 4.0, 0.0);
        assert_eq!(calls, vec![
            VariantCall { state: b"A".to_vec(), frequency: 20.0, probability: 20.0 / 26.0 },
            VariantCall { state: b"G".to_vec(), frequency: 5.0, probability: 5.0 / 26.0 },
        ]);
    }

    #[test]
    fn test_rank_min_prob() {
        let calls = rank_column(&example_column(), base_label, 0.0, 0.5);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].state, b"A".to_vec());

        // both thresholds apply
        let calls = rank_column(&example_column(), base_label, 1.0, 0.1);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn test_rank_keeps_top() {
        let calls = rank_column(&example_column(), base_label, 100.0, 0.0);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].frequency, 20.0);
    }

    #[test]
    fn test_rank_ties_in_state_order() {
        let mut column = Column::default();
        column.add(3, 2.0);
        column.add(1, 2.0);
        let calls = rank_column(&column, base_label, 0.0, 0.0);
        assert_eq!(calls[0].state, b"C".to_vec());
        assert_eq!(calls[1].state, b"T".to_vec());
    }

    #[test]
    fn test_variant_set() {
        let config = PolishConfigBuilder::default().trim_ends(false).build().unwrap();
        let mut records = vec![];
        for i in 0..4 {
            let sequence: &[u8] = if i % 2 == 0 { b"ACGT" } else { b"ACTT" };
            records.push(AlignmentRecord::new(i, format!("r{i}"), 0, parse_cigar("4M").unwrap(), sequence.to_vec(), None, Some(8)));
        }
        records.push(AlignmentRecord::new(9, "ins".to_string(), 0, parse_cigar("1M1I2M").unwrap(), b"AGCG".to_vec(), None, Some(2)));
        let matrix = StateMatrix::build(records.iter(), 0..5, &BuildOptions::from_config(&config));
        let variants = VariantSet::call(&matrix, 1.0, 0.0, b'N', 3);
        assert_eq!(variants.generation(), 3);
        assert_eq!(variants.columns().len(), 5);

        // column 0 carries a merged insertion, so it is polymorphic but not a SNP
        let col0 = variants.get(0).unwrap();
        assert!(col0.is_polymorphic());
        assert!(!col0.is_snp());

        let col2 = variants.get(2).unwrap();
        assert!(col2.is_snp());
        assert_eq!(col2.coverage, 5.0);
        assert_eq!(col2.call_for(b'T').unwrap().frequency, 2.0);
        assert_eq!(col2.top().state, b"G".to_vec());
        assert_eq!(variants.snp_columns().count(), 1);

        // nothing covers column 4
        let col4 = variants.get(4).unwrap();
        assert_eq!(col4.calls, vec![VariantCall { state: b"N".to_vec(), frequency: 0.0, probability: 0.0 }]);
        assert!(variants.get(5).is_none());
    }
}
