/*!
Everything known about one reference sequence: its configuration, the retained alignments, and the most recent matrix, consensus, and variant results.
Derived results are rebuilt wholesale on every call and replace the previous ones.
Every change to the retained alignments bumps a generation counter, which lets variant-dependent operations detect stale input.

# Example usage
```rust
use pilecon::alignment::{parse_cigar, AlignmentRecord};
use pilecon::alignment_store::AdmitOutcome;
use pilecon::polish_config::PolishConfigBuilder;
use pilecon::reference_context::ReferenceContext;

let config = PolishConfigBuilder::default().trim_ends(false).build().unwrap();
let mut context = ReferenceContext::new("chr_test".to_string(), 8, config).unwrap();
context.set_reference(b"ACGTACGT".to_vec(), None).unwrap();
for i in 0..3 {
    let record = AlignmentRecord::new(i, format!("r{i}"), 2, parse_cigar("4M").unwrap(), b"GTTC".to_vec(), None, Some(8));
    assert_eq!(context.admit(record), AdmitOutcome::Admitted);
}

let consensus = context.call_consensus();
assert_eq!(consensus.sequence(), b"ACGTTCGT");
assert_eq!(consensus.confidence(), &[0.0, 0.0, 3.0, 3.0, 3.0, 3.0, 0.0, 0.0]);
```
*/

use log::debug;
use simple_error::bail;
use std::ops::Range;

use crate::alignment::AlignmentRecord;
use crate::alignment_store::{AdmitOutcome, AlignmentStore};
use crate::consensus::{ConsensusCaller, ConsensusResult};
use crate::polish_config::PolishConfig;
use crate::state_matrix::{BuildOptions, SeedTrack, StateMatrix};
use crate::variants::VariantSet;

/// A single reference sequence with its retained alignments and derived results
#[derive(Clone, Debug)]
pub struct ReferenceContext {
    /// Reference name
    id: String,
    /// Reference length
    length: usize,
    /// Optional reference bases
    reference: Option<Vec<u8>>,
    /// Optional raw phred qualities for the reference bases
    reference_quality: Option<Vec<u8>>,
    /// Fixed configuration
    config: PolishConfig,
    /// The retained alignments
    store: AlignmentStore,
    /// Incremented on every change to the retained alignments
    generation: u64,
    /// Most recent full-range matrix
    matrix: Option<StateMatrix>,
    /// Most recent consensus
    consensus: Option<ConsensusResult>,
    /// Most recent variant calls
    variants: Option<VariantSet>
}

impl ReferenceContext {
    /// Creates an empty context.
    /// # Arguments
    /// * `id` - the reference name
    /// * `length` - the reference length
    /// * `config` - the configuration, fixed for the life of the context
    /// # Errors
    /// * if the config has a bin size of 0
    pub fn new(id: String, length: usize, config: PolishConfig) -> Result<ReferenceContext, Box<dyn std::error::Error>> {
        if config.bin_size == 0 {
            bail!("Reference {} cannot use a bin size of 0", id);
        }
        let store = AlignmentStore::new(length, config.bin_size, config.max_coverage, config.short_alignment_penalty);
        debug!("Created context {} ({} bp) with {} bins", id, length, store.bins().len());
        Ok(ReferenceContext {
            id,
            length,
            reference: None,
            reference_quality: None,
            config,
            store,
            generation: 0,
            matrix: None,
            consensus: None,
            variants: None
        })
    }

    /// Attaches the reference bases and optional qualities.
    /// # Errors
    /// * if the sequence or quality length differs from the reference length
    pub fn set_reference(&mut self, sequence: Vec<u8>, quality: Option<Vec<u8>>) -> Result<(), Box<dyn std::error::Error>> {
        if sequence.len() != self.length {
            bail!("Reference {} has length {}, but a sequence of length {} was provided", self.id, self.length, sequence.len());
        }
        if let Some(q) = quality.as_ref() {
            if q.len() != sequence.len() {
                bail!("Reference {} has {} qualities for {} bases", self.id, q.len(), sequence.len());
            }
        }
        self.reference = Some(sequence);
        self.reference_quality = quality;
        Ok(())
    }

    /// Offers an alignment to the store, see `AlignmentStore::admit`
    pub fn admit(&mut self, record: AlignmentRecord) -> AdmitOutcome {
        let outcome = self.store.admit(record);
        if matches!(outcome, AdmitOutcome::Admitted | AdmitOutcome::Rejected) {
            // a rejected re-admission still drops the previous copy
            self.generation += 1;
        }
        outcome
    }

    /// Removes an alignment from the store, returning it if it was retained
    pub fn remove(&mut self, id: u64) -> Option<AlignmentRecord> {
        let removed = self.store.remove(id);
        if removed.is_some() {
            self.generation += 1;
        }
        removed
    }

    /// Changes the live maximum coverage, returning the number of evicted alignments
    pub fn set_max_coverage(&mut self, max_coverage: usize) -> usize {
        self.generation += 1;
        self.store.set_capacity(max_coverage)
    }

    /// Builds a fresh full-range matrix from every retained alignment and keeps it
    pub fn build_matrix(&mut self) -> &StateMatrix {
        let matrix = self.full_matrix();
        self.matrix.insert(matrix)
    }

    /// Builds a matrix over a sub-range from an arbitrary set of alignments.
    /// This never seeds or filters, and it does not replace the kept full-range matrix.
    /// # Arguments
    /// * `range` - the half-open reference range to materialize
    /// * `records` - the alignments to decode
    pub fn build_matrix_range<'r, I>(&self, range: Range<usize>, records: I) -> StateMatrix
        where I: IntoIterator<Item = &'r AlignmentRecord>
    {
        let end = range.end.min(self.length);
        let start = range.start.min(end);
        StateMatrix::build(records, start..end, &BuildOptions::from_config(&self.config))
    }

    /// Rebuilds the matrix and calls a plain majority consensus on it
    pub fn call_consensus(&mut self) -> &ConsensusResult {
        let matrix = self.full_matrix();
        let consensus = ConsensusCaller::from_config(&self.config)
            .call(&matrix, self.reference.as_deref());
        self.matrix = Some(matrix);
        self.consensus.insert(consensus)
    }

    /// Rebuilds the matrix and calls variants on it, tagged with the current generation.
    /// # Arguments
    /// * `min_freq` - minimum frequency for a candidate
    /// * `min_prob` - minimum fraction of the column total for a candidate
    pub fn call_variants(&mut self, min_freq: f64, min_prob: f64) -> &VariantSet {
        let matrix = self.full_matrix();
        let variants = VariantSet::call(&matrix, min_freq, min_prob, self.config.unknown_symbol, self.generation);
        self.matrix = Some(matrix);
        self.variants.insert(variants)
    }

    /// Rebuilds the matrix and calls a consensus that prefers the reference allele on tied SNP columns.
    /// # Errors
    /// * if no variants were called since the retained alignments last changed
    pub fn call_separated_consensus(&mut self) -> Result<&ConsensusResult, Box<dyn std::error::Error>> {
        let matrix = self.full_matrix();
        let variants = self.current_variants()?;
        let consensus = ConsensusCaller::from_config(&self.config)
            .call_preferring_reference(&matrix, self.reference.as_deref(), variants);
        self.matrix = Some(matrix);
        let consensus: &ConsensusResult = self.consensus.insert(consensus);
        Ok(consensus)
    }

    /// Returns the variants, but only if they match the currently retained alignments.
    /// # Errors
    /// * if variants were never called, or the retained alignments changed since
    pub fn current_variants(&self) -> Result<&VariantSet, Box<dyn std::error::Error>> {
        match self.variants.as_ref() {
            None => bail!("Variants must be computed for {} before this operation", self.id),
            Some(v) if v.generation() != self.generation => {
                bail!("Variants for {} are stale: computed at generation {}, alignments are at generation {}", self.id, v.generation(), self.generation)
            },
            Some(v) => Ok(v)
        }
    }

    /// Returns merged reference ranges whose depth exceeds `repeat_coverage_factor` times the median non-zero depth.
    /// Empty if the factor is not configured.
    pub fn repetitive_regions(&self) -> Vec<Range<usize>> {
        let factor = match self.config.repeat_coverage_factor {
            Some(f) => f,
            None => return vec![]
        };

        let depth = self.column_depth();
        let mut nonzero: Vec<usize> = depth.iter().cloned().filter(|&d| d > 0).collect();
        if nonzero.is_empty() {
            return vec![];
        }
        nonzero.sort_unstable();
        let median = nonzero[nonzero.len() / 2] as f64;
        let threshold = factor * median;

        let mut regions: Vec<Range<usize>> = vec![];
        for (column, &d) in depth.iter().enumerate() {
            if d as f64 > threshold {
                match regions.last_mut() {
                    Some(r) if r.end == column => r.end += 1,
                    _ => regions.push(column..(column + 1))
                };
            }
        }
        debug!("Found {} repetitive regions in {} above depth {:.1}", regions.len(), self.id, threshold);
        regions
    }

    /// Number of retained alignments spanning each reference column
    pub fn column_depth(&self) -> Vec<usize> {
        let mut delta: Vec<i64> = vec![0; self.length + 1];
        for record in self.store.retained(false) {
            let start = record.position().min(self.length);
            let end = record.reference_end().min(self.length);
            if start < end {
                delta[start] += 1;
                delta[end] -= 1;
            }
        }

        let mut running = 0;
        delta[..self.length].iter()
            .map(|d| {
                running += d;
                running as usize
            })
            .collect()
    }

    /// Every retained alignment, in bin and rank order or sorted by position
    pub fn retained_alignments(&self, sorted_by_position: bool) -> Vec<&AlignmentRecord> {
        self.store.retained(sorted_by_position)
    }

    /// Aligned-base totals per bin
    pub fn bin_coverage(&self) -> Vec<usize> {
        self.store.bin_totals()
    }

    /// Upper-cased reference base at a coordinate, if a reference is attached
    pub fn reference_base(&self, coordinate: usize) -> Option<u8> {
        self.reference.as_ref()
            .and_then(|r| r.get(coordinate))
            .map(|b| b.to_ascii_uppercase())
    }

    /// Swaps the whole store, e.g. to restore a snapshot.
    /// The matrix, consensus, and variants built from the old store are dropped.
    pub(crate) fn replace_store(&mut self, store: AlignmentStore) {
        self.store = store;
        self.generation += 1;
        self.matrix = None;
        self.consensus = None;
        self.variants = None;
    }

    /// Builds the full-range matrix with any configured filtering and seeding
    fn full_matrix(&self) -> StateMatrix {
        let ignore_ranges = self.repetitive_regions();
        let mut options = BuildOptions::from_config(&self.config);
        options.ignore_ranges = &ignore_ranges;
        if self.config.seed_reference {
            if let Some(reference) = self.reference.as_deref() {
                options.seed = Some(SeedTrack {
                    sequence: reference,
                    quality: self.reference_quality.as_deref(),
                    default_quality: self.config.default_quality
                });
            }
        }
        StateMatrix::build(self.store.retained(false), 0..self.length, &options)
    }

    // getters
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn reference(&self) -> Option<&[u8]> {
        self.reference.as_deref()
    }

    pub fn reference_quality(&self) -> Option<&[u8]> {
        self.reference_quality.as_deref()
    }

    pub fn config(&self) -> &PolishConfig {
        &self.config
    }

    pub fn store(&self) -> &AlignmentStore {
        &self.store
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn matrix(&self) -> Option<&StateMatrix> {
        self.matrix.as_ref()
    }

    pub fn consensus(&self) -> Option<&ConsensusResult> {
        self.consensus.as_ref()
    }

    pub fn variants(&self) -> Option<&VariantSet> {
        self.variants.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::alignment::parse_cigar;
    use crate::polish_config::PolishConfigBuilder;

    #[derive(Debug, serde::Deserialize)]
    struct AlignmentRow {
        id: u64,
        name: String,
        position: usize,
        cigar: String,
        sequence: String,
        score: Option<i64>
    }

    /// Loads alignment rows from a csv file.
    /// Expected columns are "id", "name", "position" (0-based), "cigar", "sequence", and an optional "score".
    /// # Arguments
    /// * `filename` - the file path to load
    fn load_alignment_csv(filename: &std::path::Path) -> Vec<AlignmentRecord> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(filename)
            .unwrap();
        let mut records = vec![];
        for row in csv_reader.deserialize() {
            let row: AlignmentRow = row.unwrap();
            records.push(AlignmentRecord::new(
                row.id, row.name, row.position,
                parse_cigar(&row.cigar).unwrap(),
                row.sequence.as_bytes().to_vec(),
                None, row.score
            ));
        }
        records
    }

    fn untrimmed_config() -> PolishConfig {
        PolishConfigBuilder::default()
            .trim_ends(false)
            .build().unwrap()
    }

    fn simple_record(id: u64, position: usize, cigar: &str, sequence: &[u8], score: i64) -> AlignmentRecord {
        AlignmentRecord::new(id, format!("r{id}"), position, parse_cigar(cigar).unwrap(), sequence.to_vec(), None, Some(score))
    }

    #[test]
    fn test_bad_config() {
        let config = PolishConfigBuilder::default().bin_size(0).build().unwrap();
        assert!(ReferenceContext::new("bad".to_string(), 100, config).is_err());
    }

    #[test]
    fn test_set_reference() {
        let mut context = ReferenceContext::new("ref".to_string(), 4, untrimmed_config()).unwrap();
        assert!(context.set_reference(b"ACG".to_vec(), None).is_err());
        assert!(context.set_reference(b"ACGT".to_vec(), Some(vec![30; 3])).is_err());
        context.set_reference(b"acGT".to_vec(), Some(vec![30; 4])).unwrap();
        assert_eq!(context.reference_base(0), Some(b'A'));
        assert_eq!(context.reference_base(4), None);
        assert_eq!(context.reference_quality(), Some([30, 30, 30, 30].as_slice()));
    }

    #[test]
    fn test_csv_pileup() {
        let records = load_alignment_csv(&PathBuf::from("./tests/pileup_001.csv"));
        let mut context = ReferenceContext::new("pileup_001".to_string(), 30, untrimmed_config()).unwrap();
        context.set_reference(b"ACGTACGTACGTACGTACGTACGTACGTAC".to_vec(), None).unwrap();
        for record in records.into_iter() {
            context.admit(record);
        }
        assert_eq!(context.store().len(), 7);

        // four of the reads carry a T>G change at 11, delete column 20, and insert a C after 25
        let consensus = context.call_consensus();
        assert_eq!(consensus.sequence(), b"ACGTACGTACGGACGTACGTCGTACCGTAC");
        assert_eq!(consensus.confidence()[11], 4.0);
        assert_eq!(consensus.coverage()[11], 7.0);
        assert_eq!(context.matrix().unwrap().stats().decoded, 7);

        let variants = context.call_variants(2.0, 0.0);
        assert!(variants.get(11).unwrap().is_snp());
        assert_eq!(variants.snp_columns().count(), 1);
    }

    #[test]
    fn test_generation_tracking() {
        let mut context = ReferenceContext::new("ref".to_string(), 10, untrimmed_config()).unwrap();
        assert!(context.current_variants().is_err());
        assert!(context.call_separated_consensus().is_err());

        context.admit(simple_record(0, 0, "4M", b"ACGT", 8));
        let generation = context.generation();
        context.call_variants(1.0, 0.0);
        assert!(context.current_variants().is_ok());

        // unscored alignments change nothing
        let unscored = AlignmentRecord::new(1, "u".to_string(), 0, parse_cigar("4M").unwrap(), b"ACGT".to_vec(), None, None);
        assert_eq!(context.admit(unscored), AdmitOutcome::Unscored);
        assert_eq!(context.generation(), generation);
        assert!(context.call_separated_consensus().is_ok());

        context.remove(0);
        assert!(context.current_variants().is_err());
        assert!(context.remove(0).is_none());
    }

    #[test_log::test]
    fn test_malformed_not_retained() {
        let config = PolishConfigBuilder::default()
            .trim_ends(false)
            .bin_size(10)
            .max_coverage(1)
            .build().unwrap();
        let mut context = ReferenceContext::new("ref".to_string(), 10, config).unwrap();
        context.set_reference(b"AAAAAAAAAA".to_vec(), None).unwrap();
        assert_eq!(context.admit(simple_record(1, 0, "10M", b"CCCCCCCCCC", 10)), AdmitOutcome::Admitted);
        let generation = context.generation();

        // better score, but one base short of its CIGAR
        assert_eq!(context.admit(simple_record(2, 0, "10M", b"CCCCCCCCC", 20)), AdmitOutcome::Malformed);
        assert_eq!(context.generation(), generation);
        assert_eq!(context.store().len(), 1);
        assert!(context.store().get(1).is_some());

        let consensus = context.call_consensus();
        assert_eq!(consensus.sequence(), b"CCCCCCCCCC");
        assert_eq!(context.matrix().unwrap().stats().malformed, 0);
    }

    #[test]
    fn test_retained_and_bins() {
        let config = PolishConfigBuilder::default()
            .trim_ends(false)
            .bin_size(10)
            .build().unwrap();
        let mut context = ReferenceContext::new("ref".to_string(), 30, config).unwrap();
        context.admit(simple_record(0, 20, "4M", b"ACGT", 8));
        context.admit(simple_record(1, 0, "4M", b"ACGT", 4));
        context.admit(simple_record(2, 1, "4M", b"ACGT", 8));
        assert_eq!(context.bin_coverage(), vec![8, 0, 4]);

        let ranked: Vec<u64> = context.retained_alignments(false).iter().map(|r| r.id()).collect();
        assert_eq!(ranked, vec![2, 1, 0]);
        let sorted: Vec<u64> = context.retained_alignments(true).iter().map(|r| r.id()).collect();
        assert_eq!(sorted, vec![1, 2, 0]);

        assert_eq!(context.column_depth()[..6], [1, 2, 2, 2, 1, 0]);
    }

    #[test]
    fn test_repetitive_regions() {
        let config = PolishConfigBuilder::default()
            .trim_ends(false)
            .repeat_coverage_factor(Some(2.0))
            .build().unwrap();
        let mut context = ReferenceContext::new("ref".to_string(), 12, config).unwrap();
        // depth 1 everywhere, then 4 extra reads on 4..6
        context.admit(simple_record(0, 0, "12M", b"ACGTACGTACGT", 24));
        for i in 1..5 {
            context.admit(simple_record(i, 4, "2M", b"AC", 4));
        }
        assert_eq!(context.repetitive_regions(), vec![4..6]);

        let matrix = context.build_matrix();
        assert_eq!(matrix.coverage(4), 0.0);
        assert_eq!(matrix.coverage(3), 1.0);
        assert_eq!(matrix.stats().ignored_observations, 10);
    }

    #[test]
    fn test_seeded_reference() {
        let config = PolishConfigBuilder::default()
            .trim_ends(false)
            .seed_reference(true)
            .build().unwrap();
        let mut context = ReferenceContext::new("ref".to_string(), 6, config).unwrap();
        context.set_reference(b"ACGTAC".to_vec(), None).unwrap();
        context.admit(simple_record(0, 0, "3M", b"AGG", 6));

        // the seed outweighs a single read at column 1, and keeps uncovered columns
        let consensus = context.call_consensus();
        assert_eq!(consensus.sequence(), b"ACGTAC");
        assert!((consensus.coverage()[1] - 4.33).abs() < 1e-9);
        assert_eq!(consensus.confidence()[5], 3.33);
    }

    #[test]
    fn test_range_matrix() {
        let mut context = ReferenceContext::new("ref".to_string(), 10, untrimmed_config()).unwrap();
        context.admit(simple_record(0, 0, "8M", b"ACGTACGT", 16));
        let records = context.retained_alignments(false);
        let matrix = context.build_matrix_range(6..20, records);
        assert_eq!(matrix.range(), 6..10);
        assert_eq!(matrix.coverage(7), 1.0);
        assert!(context.matrix().is_none());
    }
}
