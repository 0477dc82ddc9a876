/*!
Flags likely chimeric joins: short coverage dips where the pileup on the left of the dip looks nothing like the pileup on the right.
For each dip, the alignments binned left and right of it are piled up separately, and every column both sides cover is scored by how much entropy pooling the two sides adds.
Two samples of the same sequence pool to roughly the same entropy, while two unrelated sequences pool to a much higher one.

# Example usage
```rust
use pilecon::chimera::shannon_entropy;
use pilecon::state_matrix::Column;

let mut column = Column::default();
column.add(0, 5.0);
column.add(3, 5.0);
assert_eq!(shannon_entropy(&column), 1.0);
```
*/

use log::debug;
use rustc_hash::FxHashMap as HashMap;
use std::ops::Range;

use crate::alignment::AlignmentRecord;
use crate::polish_config::PolishConfig;
use crate::reference_context::ReferenceContext;
use crate::state_matrix::{Column, StateMatrix};

/// A candidate chimeric join
#[derive(Clone, Debug, PartialEq)]
pub struct ChimeraRegion {
    /// First reference coordinate of the scanned window
    pub start: usize,
    /// Exclusive end of the scanned window
    pub end: usize,
    /// Entropy delta of every column covered on both sides, in coordinate order
    pub deltas: Vec<f64>,
    /// Fraction of `deltas` above the threshold
    pub score: f64
}

/// Scans a reference context for coverage dips and scores them
#[derive(Clone, Debug)]
pub struct ChimeraDetector {
    /// Minimum number of bins for a scan
    min_bins: usize,
    /// Bins at either end that never count as a dip
    edge_bins: usize,
    /// Longest run of low bins that still counts as a dip
    max_dip_bins: usize,
    /// A bin is low at or below this fraction of the per-bin base budget
    dip_fraction: f64,
    /// Window bins before the dip
    bins_before: usize,
    /// Window bins after the dip
    bins_after: usize,
    /// Entropy delta that marks a column as heterogeneous
    delta_threshold: f64
}

impl ChimeraDetector {
    pub fn from_config(config: &PolishConfig) -> ChimeraDetector {
        ChimeraDetector {
            min_bins: config.chimera_min_bins,
            edge_bins: config.chimera_edge_bins,
            max_dip_bins: config.chimera_max_dip_bins,
            dip_fraction: config.chimera_dip_fraction,
            bins_before: config.chimera_bins_before,
            bins_after: config.chimera_bins_after,
            delta_threshold: config.entropy_delta_threshold
        }
    }

    /// Finds the coverage dips as half-open bin ranges.
    /// A dip is a maximal run of low bins away from the edges that is no longer than `max_dip_bins`.
    /// # Arguments
    /// * `bin_totals` - aligned bases per bin
    /// * `bin_max_bases` - the per-bin base budget
    pub fn find_dips(&self, bin_totals: &[usize], bin_max_bases: usize) -> Vec<Range<usize>> {
        if bin_totals.len() < self.min_bins || bin_totals.len() <= 2 * self.edge_bins {
            return vec![];
        }

        let cutoff = self.dip_fraction * bin_max_bases as f64;
        let interior = self.edge_bins..(bin_totals.len() - self.edge_bins);
        let mut dips = vec![];
        let mut run_start: Option<usize> = None;
        for bin_index in interior.clone() {
            let is_low = bin_totals[bin_index] as f64 <= cutoff;
            match (is_low, run_start) {
                (true, None) => run_start = Some(bin_index),
                (false, Some(s)) => {
                    if bin_index - s <= self.max_dip_bins {
                        dips.push(s..bin_index);
                    }
                    run_start = None;
                },
                _ => {}
            };
        }
        if let Some(s) = run_start {
            if interior.end - s <= self.max_dip_bins {
                dips.push(s..interior.end);
            }
        }
        dips
    }

    /// Scores every coverage dip of a context.
    /// Dips spanning a column with no observations at all are skipped.
    /// # Arguments
    /// * `context` - the context to scan, it is not modified
    pub fn scan(&self, context: &ReferenceContext) -> Vec<ChimeraRegion> {
        let bin_totals = context.bin_coverage();
        if bin_totals.len() < self.min_bins {
            debug!("Skipping chimera scan of {}, only {} bins", context.id(), bin_totals.len());
            return vec![];
        }

        let store = context.store();
        let bin_size = store.bin_size();
        let mut regions = vec![];
        for dip in self.find_dips(&bin_totals, store.bin_max_bases()) {
            let span = (dip.start * bin_size)..(dip.end * bin_size);
            let span_matrix = context.build_matrix_range(span.clone(), context.retained_alignments(false));
            if span_matrix.columns().iter().any(|c| c.is_empty()) {
                debug!("Skipping dip {:?} of {}, it has uncovered columns", span, context.id());
                continue;
            }

            let window_start = dip.start.saturating_sub(self.bins_before);
            let window_end = (dip.end + self.bins_after).min(bin_totals.len());
            let midpoint = (window_start + window_end) / 2;
            let left: Vec<&AlignmentRecord> = (window_start..midpoint)
                .flat_map(|b| store.bin_alignments(b))
                .collect();
            let right: Vec<&AlignmentRecord> = (midpoint..window_end)
                .flat_map(|b| store.bin_alignments(b))
                .collect();

            let window = (window_start * bin_size)..(window_end * bin_size);
            let left_matrix = context.build_matrix_range(window.clone(), left);
            let right_matrix = context.build_matrix_range(window.clone(), right);
            let deltas = column_deltas(&left_matrix, &right_matrix);
            let high = deltas.iter().filter(|&&d| d > self.delta_threshold).count();
            let score = if deltas.is_empty() {
                0.0
            } else {
                high as f64 / deltas.len() as f64
            };

            let region = ChimeraRegion {
                start: left_matrix.start(),
                end: left_matrix.range().end,
                deltas,
                score
            };
            debug!("Dip {:?} of {}: window {}..{}, {} shared columns, score {:.3}", span, context.id(), region.start, region.end, region.deltas.len(), region.score);
            regions.push(region);
        }
        regions
    }
}

/// Shannon entropy (base 2) of a column's state distribution, 0 for an empty column
pub fn shannon_entropy(column: &Column) -> f64 {
    entropy(column.entries().iter().map(|&(_, f)| f))
}

/// Entropy of the pooled distribution minus the larger of the two separate entropies.
/// States are matched by their symbols since the matrices have independent state tables.
fn pooled_delta(left: &StateMatrix, left_column: &Column, right: &StateMatrix, right_column: &Column) -> f64 {
    let mut pooled: HashMap<&[u8], f64> = Default::default();
    for &(state, frequency) in left_column.entries().iter() {
        *pooled.entry(left.states().label(state)).or_insert(0.0) += frequency;
    }
    for &(state, frequency) in right_column.entries().iter() {
        *pooled.entry(right.states().label(state)).or_insert(0.0) += frequency;
    }
    let pooled_entropy = entropy(pooled.values().cloned());
    pooled_entropy - shannon_entropy(left_column).max(shannon_entropy(right_column))
}

/// Deltas for every column observed in both matrices; the matrices must cover the same range
fn column_deltas(left: &StateMatrix, right: &StateMatrix) -> Vec<f64> {
    assert_eq!(left.range(), right.range());
    left.columns().iter()
        .zip(right.columns().iter())
        .filter(|(l, r)| !l.is_empty() && !r.is_empty())
        .map(|(l, r)| pooled_delta(left, l, right, r))
        .collect()
}

fn entropy<I: Iterator<Item = f64> + Clone>(frequencies: I) -> f64 {
    let total: f64 = frequencies.clone().sum();
    if total <= 0.0 {
        return 0.0;
    }
    frequencies
        .filter(|&f| f > 0.0)
        .map(|f| {
            let p = f / total;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::alignment::parse_cigar;
    use crate::alignment_store::AdmitOutcome;
    use crate::example_gen::{generate_reference, rotate_bases, tile_alignments};
    use crate::polish_config::PolishConfigBuilder;

    #[test]
    fn test_entropy() {
        let mut column = Column::default();
        assert_eq!(shannon_entropy(&column), 0.0);
        column.add(2, 7.0);
        assert_eq!(shannon_entropy(&column), 0.0);
        column.add(0, 7.0);
        column.add(1, 7.0);
        column.add(3, 7.0);
        assert_eq!(shannon_entropy(&column), 2.0);
    }

    #[test]
    fn test_find_dips() {
        let config = PolishConfigBuilder::default().build().unwrap();
        let detector = ChimeraDetector::from_config(&config);
        let budget = 1000;

        let mut totals = vec![900; 30];
        // edge bins never count
        totals[2] = 0;
        // a 2-bin dip
        totals[10] = 100;
        totals[11] = 200;
        // a 5-bin run is too long
        for t in totals[15..20].iter_mut() {
            *t = 0;
        }
        // a single bin right at the interior end
        totals[24] = 50;
        assert_eq!(detector.find_dips(&totals, budget), vec![10..12, 24..25]);

        // too few bins to scan
        assert!(detector.find_dips(&totals[..19], budget).is_empty());
    }

    /// A gapless 150 bp read copied from a source sequence
    fn read_at(id: u64, source: &[u8], position: usize) -> AlignmentRecord {
        AlignmentRecord::new(
            id, format!("read_{id}"), position, parse_cigar("150M").unwrap(),
            source[position..(position + 150)].to_vec(), None, Some(300)
        )
    }

    /// Builds a 3000 bp context piled up from source `a` on the left and source `b` on the right, with a dip at bins 14 and 15.
    fn joined_context(a: &[u8], b: &[u8]) -> ReferenceContext {
        let config = PolishConfigBuilder::default()
            .max_coverage(20)
            .build().unwrap();
        let mut reference = a[..1500].to_vec();
        reference.extend_from_slice(&b[1500..]);
        let mut context = ReferenceContext::new("joined".to_string(), 3000, config).unwrap();
        context.set_reference(reference, None).unwrap();

        let left = (0..=1310).step_by(10).chain([1330]);
        let right = [1470].into_iter().chain((1540..=2850).step_by(10));
        let reads: Vec<AlignmentRecord> = left.map(|p| (a, p))
            .chain(right.map(|p| (b, p)))
            .enumerate()
            .map(|(i, (source, p))| read_at(i as u64, source, p))
            .collect();
        for read in reads.into_iter() {
            assert_eq!(context.admit(read), AdmitOutcome::Admitted);
        }
        context
    }

    #[test_log::test]
    fn test_distinct_sources() {
        let a = generate_reference(3000, 11);
        let b = rotate_bases(&a);
        let context = joined_context(&a, &b);
        assert_eq!(context.bin_coverage()[14], 150);
        assert_eq!(context.bin_coverage()[15], 150);

        let detector = ChimeraDetector::from_config(context.config());
        let regions = detector.scan(&context);
        assert_eq!(regions.len(), 1);
        let region = &regions[0];
        assert_eq!((region.start, region.end), (1000, 2100));
        // only the two reads next to the dip overlap, at 1470..1480
        assert_eq!(region.deltas, vec![1.0; 10]);
        assert_eq!(region.score, 1.0);
    }

    #[test]
    fn test_same_source() {
        let a = generate_reference(3000, 11);
        let context = joined_context(&a, &a);
        let detector = ChimeraDetector::from_config(context.config());
        let regions = detector.scan(&context);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].deltas.len(), 10);
        assert_eq!(regions[0].score, 0.0);
    }

    #[test]
    fn test_uncovered_dip_skipped() {
        let a = generate_reference(3000, 11);
        let config = PolishConfigBuilder::default()
            .max_coverage(20)
            .build().unwrap();
        let mut context = ReferenceContext::new("gapped".to_string(), 3000, config).unwrap();
        // nothing at all covers 1400..1600
        for (i, record) in tile_alignments(&a, &a, 150, 10, 0).into_iter().enumerate() {
            let position = record.position();
            if position + 150 <= 1400 || position >= 1600 {
                assert_eq!(context.admit(record), AdmitOutcome::Admitted, "{i}");
            }
        }
        let detector = ChimeraDetector::from_config(context.config());
        assert!(!detector.find_dips(&context.bin_coverage(), context.store().bin_max_bases()).is_empty());
        assert!(detector.scan(&context).is_empty());
    }

    #[test]
    fn test_too_few_bins() {
        let a = generate_reference(1500, 11);
        let config = PolishConfigBuilder::default().build().unwrap();
        let mut context = ReferenceContext::new("short".to_string(), 1500, config).unwrap();
        for record in tile_alignments(&a, &a, 150, 10, 0) {
            context.admit(record);
        }
        let detector = ChimeraDetector::from_config(context.config());
        assert!(detector.scan(&context).is_empty());
    }
}
