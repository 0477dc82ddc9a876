/*!
Contains configuration information for binning, decoding, calling, haplotype separation, and chimera scanning.
Typical usage is to the use the builder to construct the config, e.g.
```
use pilecon::polish_config::{PolishConfig, PolishConfigBuilder};
let config: PolishConfig = PolishConfigBuilder::default()
    .bin_size(200)
    .max_coverage(30)
    .quality_weighting(true)
    .build()
    .unwrap();
assert_eq!(config.bin_max_bases(), 6000);
```
*/

/// Controls what happens to alignments flagged during haplotype penalization.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum FlaggedPolicy {
    /// Discards the first flagged alignment, re-admits the second with a penalty, and so on
    #[default]
    AlternateDiscard,
    /// Discards every flagged alignment
    DiscardAll,
    /// Re-admits every flagged alignment with a penalty
    KeepAll
}

impl FlaggedPolicy {
    /// Returns true if the n-th (0-based) flagged alignment should get re-admitted.
    /// # Arguments
    /// * `encounter_index` - the order in which this alignment was flagged
    pub fn keeps(&self, encounter_index: usize) -> bool {
        match self {
            FlaggedPolicy::AlternateDiscard => encounter_index % 2 == 1,
            FlaggedPolicy::DiscardAll => false,
            FlaggedPolicy::KeepAll => true
        }
    }
}

/**
Contains configuration information for a reference context.
The configuration is fixed once a context is built; only the live maximum coverage can change at run-time through the alignment store.
```
use pilecon::polish_config::{PolishConfig, PolishConfigBuilder};
let config: PolishConfig = PolishConfigBuilder::default()
    .trim_ends(false)
    .max_ins_length(Some(3))
    .build()
    .unwrap();
assert!(!config.trim_ends);
```
*/
#[derive(derive_builder::Builder, Clone, Debug)]
#[builder(default)]
pub struct PolishConfig {
    /// Width of each genomic bin, in reference bases
    pub bin_size: usize,
    /// Initial maximum coverage per bin; the per-bin base budget is `bin_size * max_coverage`
    pub max_coverage: usize,
    /// If true, alignment ends are trimmed back to avoid indels near read termini
    pub trim_ends: bool,
    /// Fraction of the aligned length treated as the taboo end region
    pub taboo_fraction: f64,
    /// Fixed taboo length, overrides `taboo_fraction` when set
    pub taboo_length: Option<usize>,
    /// Alignments shorter than this after trimming are skipped
    pub min_trimmed_length: usize,
    /// Alignments keeping less than this fraction of their aligned length after trimming are skipped
    pub min_trimmed_fraction: f64,
    /// States longer than this are ignored by the consensus caller; None means unlimited
    pub max_ins_length: Option<usize>,
    /// If true, observations contribute a quality-derived frequency instead of a unit count
    pub quality_weighting: bool,
    /// Quality used for every base of a record that carries no qualities
    pub default_quality: u8,
    /// The short alignment correction constant for ranking scores
    pub short_alignment_penalty: f64,
    /// Scaling constant for the frequency/phred transforms
    pub phred_scale: f64,
    /// Largest phred value emitted by the frequency transform
    pub max_phred: u8,
    /// ASCII offset for phred strings
    pub phred_offset: u8,
    /// Symbol emitted when a column has no data and no reference
    pub unknown_symbol: u8,
    /// If true, the reference track seeds every column before alignments are added
    pub seed_reference: bool,
    /// Columns with coverage above this multiple of the median are ignored; None disables the filter
    pub repeat_coverage_factor: Option<f64>,
    /// Minimum frequency for variants used in penalization and minority estimation
    pub separation_min_freq: f64,
    /// Raw score penalty for each disagreeing polymorphic column
    pub snp_penalty: i64,
    /// Columns at or above this multiple of the minority estimate count as high coverage
    pub high_coverage_factor: f64,
    /// Percentile of reference-allele frequencies used as the minority coverage estimate
    pub minority_percentile: f64,
    /// Polymorphic/high-coverage column ratio that must be exceeded to accept the estimate
    pub significance_threshold: f64,
    /// Minimum frequency for the final variant call after separation
    pub final_min_freq: f64,
    /// Minimum probability for the final variant call after separation
    pub final_min_prob: f64,
    /// What to do with alignments that disagree with the reference at polymorphic columns
    pub flagged_policy: FlaggedPolicy,
    /// Minimum number of bins before a chimera scan is attempted
    pub chimera_min_bins: usize,
    /// Number of bins at each end of the reference that are never considered dips
    pub chimera_edge_bins: usize,
    /// Longest run of low-coverage bins that still counts as a dip
    pub chimera_max_dip_bins: usize,
    /// A bin is low coverage if its total is at most this fraction of the bin budget
    pub chimera_dip_fraction: f64,
    /// Number of bins the comparison window extends before a dip
    pub chimera_bins_before: usize,
    /// Number of bins the comparison window extends after a dip
    pub chimera_bins_after: usize,
    /// Entropy gain above which a column counts towards the chimera score
    pub entropy_delta_threshold: f64
}

impl Default for PolishConfig {
    fn default() -> Self {
        Self {
            // short reads tile a 100 bp bin a few times over
            bin_size: 100,
            max_coverage: 50,
            trim_ends: true,
            // 10% at each end
            taboo_fraction: 0.1,
            taboo_length: None,
            min_trimmed_length: 50,
            min_trimmed_fraction: 0.7,
            // by default, no insertion is treated as an artifact
            max_ins_length: None,
            quality_weighting: false,
            default_quality: 20,
            // roughly the length where a read starts to be trustworthy
            short_alignment_penalty: 40.0,
            // maps typical column frequencies onto the usual phred range
            phred_scale: 120.0,
            max_phred: 40,
            phred_offset: 33,
            unknown_symbol: b'N',
            seed_reference: false,
            repeat_coverage_factor: None,
            separation_min_freq: 4.0,
            snp_penalty: 60,
            high_coverage_factor: 1.5,
            minority_percentile: 0.75,
            // these were calibrated empirically
            significance_threshold: 0.00015,
            final_min_freq: 2.0,
            final_min_prob: 0.2,
            flagged_policy: FlaggedPolicy::AlternateDiscard,
            chimera_min_bins: 20,
            chimera_edge_bins: 5,
            chimera_max_dip_bins: 4,
            chimera_dip_fraction: 0.2,
            chimera_bins_before: 4,
            chimera_bins_after: 5,
            entropy_delta_threshold: 0.7
        }
    }
}

impl PolishConfig {
    /// Returns the initial per-bin base budget
    pub fn bin_max_bases(&self) -> usize {
        self.bin_size.saturating_mul(self.max_coverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternate_policy() {
        let policy = FlaggedPolicy::default();
        let kept: Vec<bool> = (0..5).map(|i| policy.keeps(i)).collect();
        assert_eq!(kept, vec![false, true, false, true, false]);
        assert!(!FlaggedPolicy::DiscardAll.keeps(1));
        assert!(FlaggedPolicy::KeepAll.keeps(0));
    }

    #[test]
    fn test_unlimited_budget() {
        let config = PolishConfigBuilder::default()
            .max_coverage(usize::MAX)
            .build().unwrap();
        assert_eq!(config.bin_max_bases(), usize::MAX);
    }
}
