/*!
A single corrective pass that isolates the haplotype matching the reference from a mixed pileup.
Alignments that disagree with the reference at SNP columns get discarded or penalized, the coverage of the reference haplotype gets estimated from the remaining SNP columns, and if that estimate is significant the coverage budget shrinks to it.
The penalized alignments then lose out in every bin, and the final consensus gets called from what remains.

If the estimate is not significant, the retained alignments are restored to the state before the pass.
*/

use log::{debug, warn};
use rustc_hash::FxHashMap as HashMap;

use crate::alignment_store::AdmitOutcome;
use crate::cigar_decoder::{CigarDecoder, DecodeOutcome, ObservedState};
use crate::consensus::ConsensusResult;
use crate::polish_config::{FlaggedPolicy, PolishConfig};
use crate::reference_context::ReferenceContext;
use crate::variants::VariantSet;

/// What happened to the alignments during penalization
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PenaltySummary {
    /// Alignments disagreeing with the reference at one or more SNP columns
    pub flagged: usize,
    /// Flagged alignments that were dropped outright
    pub discarded: usize,
    /// Flagged alignments that were re-admitted with a reduced score
    pub readmitted: usize,
    /// Flagged alignments whose reduced score no longer got them back in
    pub rejected: usize
}

/// The outcome of a full separation pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SeparationReport {
    /// The penalization step
    pub penalties: PenaltySummary,
    /// Coverage estimate for the reference haplotype, None if there were no SNP columns
    pub estimate: Option<f64>,
    /// Polymorphic columns over high coverage columns
    pub ratio: f64,
    /// True if the estimate passed the significance gate
    pub accepted: bool,
    /// Alignments evicted when the coverage budget shrank
    pub evicted: usize,
    /// The final consensus, only present when accepted
    pub consensus: Option<ConsensusResult>
}

/// Runs the haplotype separation pass on a reference context
#[derive(Clone, Debug)]
pub struct HaplotypeSeparator {
    /// Minimum frequency for the variant calls before and after penalization
    min_freq: f64,
    /// Raw score penalty per disagreeing SNP column
    snp_penalty: i64,
    /// Decides which flagged alignments get re-admitted
    policy: FlaggedPolicy,
    /// Percentile of the reference allele frequencies used as the estimate
    percentile: f64,
    /// A column is high coverage at this multiple of the estimate
    high_coverage_factor: f64,
    /// The ratio must exceed this for the estimate to be accepted
    significance_threshold: f64,
    /// Variant thresholds for the final consensus
    final_min_freq: f64,
    final_min_prob: f64
}

impl HaplotypeSeparator {
    pub fn from_config(config: &PolishConfig) -> HaplotypeSeparator {
        HaplotypeSeparator {
            min_freq: config.separation_min_freq,
            snp_penalty: config.snp_penalty,
            policy: config.flagged_policy,
            percentile: config.minority_percentile,
            high_coverage_factor: config.high_coverage_factor,
            significance_threshold: config.significance_threshold,
            final_min_freq: config.final_min_freq,
            final_min_prob: config.final_min_prob
        }
    }

    /// Runs the full pass.
    /// # Arguments
    /// * `context` - the context to separate; its retained alignments and coverage budget may change
    /// # Errors
    /// * only if a precondition check inside the pass fails, which indicates a bug
    pub fn run(&self, context: &mut ReferenceContext) -> Result<SeparationReport, Box<dyn std::error::Error>> {
        let snapshot = context.store().clone();
        let mut report = SeparationReport::default();

        context.call_variants(self.min_freq, 0.0);
        report.penalties = self.penalize(context)?;

        context.call_variants(self.min_freq, 0.0);
        let variants = context.current_variants()?;
        let estimate = reference_allele_frequencies(context, variants)
            .map(|freqs| percentile(freqs, self.percentile));
        report.estimate = estimate;
        report.ratio = match estimate {
            Some(e) => self.significance_ratio(variants, e),
            None => 0.0
        };
        report.accepted = estimate.is_some() && report.ratio > self.significance_threshold;
        debug!("Separation of {}: {:?}, estimate {:?}, ratio {:.6}, accepted {}", context.id(), report.penalties, report.estimate, report.ratio, report.accepted);

        match estimate {
            Some(e) if report.accepted => {
                let max_coverage = (e.ceil() as usize).max(1);
                report.evicted = context.set_max_coverage(max_coverage);
                context.call_variants(self.final_min_freq, self.final_min_prob);
                report.consensus = Some(context.call_separated_consensus()?.clone());
            },
            _ => {
                context.replace_store(snapshot);
            }
        };
        Ok(report)
    }

    /// Removes every alignment that disagrees with the reference at a SNP column, then re-admits some of them with a penalty.
    /// The flagged policy decides which ones come back, by the order in which they were flagged.
    /// # Arguments
    /// * `context` - the context, must have variants for its current alignments
    /// # Errors
    /// * if the context has no variants, or they are stale
    pub fn penalize(&self, context: &mut ReferenceContext) -> Result<PenaltySummary, Box<dyn std::error::Error>> {
        let variants = context.current_variants()?;
        let snp_bases: HashMap<usize, u8> = variants.snp_columns()
            .map(|vc| {
                let base = context.reference_base(vc.column).unwrap_or(vc.top().state[0]);
                (vc.column, base)
            })
            .collect();

        let mut summary = PenaltySummary::default();
        if snp_bases.is_empty() {
            return Ok(summary);
        }

        let decoder = CigarDecoder::from_config(context.config());
        let mut flagged: Vec<(u64, usize)> = vec![];
        for record in context.retained_alignments(false) {
            let observations = match decoder.decode(record) {
                Ok(DecodeOutcome::Observations(obs)) => obs,
                Ok(DecodeOutcome::Skipped(_)) => continue,
                Err(e) => {
                    warn!("Not penalizing alignment {} ({}): {}", record.id(), record.name(), e);
                    continue;
                }
            };

            let disagreements = observations.iter()
                .filter(|obs| {
                    let observed = match &obs.state {
                        ObservedState::Base(b) => *b,
                        ObservedState::Run(run) => run[0],
                        ObservedState::Gap => return false
                    };
                    snp_bases.get(&obs.column)
                        .map(|&reference_base| observed != reference_base)
                        .unwrap_or(false)
                })
                .count();
            if disagreements > 0 {
                flagged.push((record.id(), disagreements));
            }
        }

        for (id, disagreements) in flagged.into_iter() {
            // an earlier re-admission may have displaced this one already, it does not count towards the alternation
            let mut record = match context.remove(id) {
                Some(r) => r,
                None => continue
            };
            let encounter_index = summary.flagged;
            summary.flagged += 1;

            if self.policy.keeps(encounter_index) {
                record.penalize(self.snp_penalty * disagreements as i64);
                match context.admit(record) {
                    AdmitOutcome::Admitted => summary.readmitted += 1,
                    _ => summary.rejected += 1
                };
            } else {
                summary.discarded += 1;
            }
        }

        debug!("Penalized {} on {} SNP columns: {:?}", context.id(), snp_bases.len(), summary);
        Ok(summary)
    }

    /// Polymorphic columns divided by columns with a coverage of at least `high_coverage_factor * estimate`, 0 if none
    fn significance_ratio(&self, variants: &VariantSet, estimate: f64) -> f64 {
        let cutoff = self.high_coverage_factor * estimate;
        let polymorphic = variants.columns().iter().filter(|vc| vc.is_polymorphic()).count();
        let high_coverage = variants.columns().iter().filter(|vc| vc.coverage >= cutoff).count();
        if high_coverage == 0 {
            0.0
        } else {
            polymorphic as f64 / high_coverage as f64
        }
    }
}

/// Collects the frequency of the reference allele at every SNP column.
/// Returns None if there are no SNP columns.
fn reference_allele_frequencies(context: &ReferenceContext, variants: &VariantSet) -> Option<Vec<f64>> {
    let freqs: Vec<f64> = variants.snp_columns()
        .filter_map(|vc| {
            let base = context.reference_base(vc.column).unwrap_or(vc.top().state[0]);
            vc.call_for(base).map(|c| c.frequency)
        })
        .collect();
    if freqs.is_empty() {
        None
    } else {
        Some(freqs)
    }
}

/// Sorts the values and returns the one at index `floor(fraction * (n - 1))`
fn percentile(mut values: Vec<f64>, fraction: f64) -> f64 {
    assert!(!values.is_empty());
    values.sort_by(|a, b| a.total_cmp(b));
    let index = (fraction * (values.len() - 1) as f64).floor() as usize;
    values[index.min(values.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::alignment::{parse_cigar, AlignmentRecord};
    use crate::example_gen::{generate_reference, inject_snps, tile_alignments};
    use crate::polish_config::PolishConfigBuilder;

    /// Builds a context whose reference is the minority haplotype.
    /// The minority is tiled at 6x and the majority, with a SNP every 100 bases, at 25x.
    fn mixed_context(with_snps: bool) -> (ReferenceContext, Vec<usize>) {
        let length = 2000;
        let minority = generate_reference(length, 7);
        let (majority, snp_columns) = if with_snps {
            inject_snps(&minority, 100, 50)
        } else {
            (minority.clone(), vec![])
        };

        let config = PolishConfigBuilder::default().build().unwrap();
        let mut context = ReferenceContext::new("mixed".to_string(), length, config).unwrap();
        context.set_reference(minority.clone(), None).unwrap();
        for record in tile_alignments(&minority, &minority, 150, 25, 0) {
            context.admit(record);
        }
        for record in tile_alignments(&majority, &minority, 150, 6, 10000) {
            context.admit(record);
        }
        (context, snp_columns)
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(vec![5.0], 0.75), 5.0);
        assert_eq!(percentile(vec![4.0, 1.0, 3.0, 2.0], 0.75), 3.0);
        assert_eq!(percentile(vec![9.0, 1.0, 3.0, 2.0, 5.0], 0.75), 5.0);
    }

    #[test]
    fn test_penalize_requires_variants() {
        let (mut context, _) = mixed_context(true);
        let separator = HaplotypeSeparator::from_config(context.config());
        assert!(separator.penalize(&mut context).is_err());

        // stale after a change
        context.call_variants(4.0, 0.0);
        context.remove(0);
        assert!(separator.penalize(&mut context).is_err());
    }

    #[test]
    fn test_penalize_alternates() {
        let (mut context, _) = mixed_context(true);
        let before = context.store().len();
        let separator = HaplotypeSeparator::from_config(context.config());
        context.call_variants(4.0, 0.0);
        let snp_columns: Vec<usize> = context.current_variants().unwrap()
            .snp_columns()
            .map(|vc| vc.column)
            .collect();
        let spans_snp = |r: &AlignmentRecord| snp_columns.iter().any(|&c| r.position() <= c && c < r.reference_end());
        // only majority reads disagree, and only those spanning a detected SNP column
        let expected = context.retained_alignments(false).into_iter()
            .filter(|&r| r.id() >= 10000 && spans_snp(r))
            .count();
        assert!(expected > 300);

        let summary = separator.penalize(&mut context).unwrap();
        assert_eq!(summary.flagged, expected);
        assert_eq!(summary.discarded, expected.div_ceil(2));
        assert_eq!(summary.readmitted + summary.rejected, expected / 2);
        assert_eq!(context.store().len(), before - summary.discarded - summary.rejected);

        // re-admitted ones carry the reduced score
        let penalized: Vec<&AlignmentRecord> = context.retained_alignments(false).into_iter()
            .filter(|&r| r.id() >= 10000 && spans_snp(r))
            .collect();
        assert_eq!(penalized.len(), summary.readmitted);
        assert!(penalized.iter().all(|r| r.score().unwrap() < 300 - 60));
    }

    #[test]
    fn test_penalize_discard_all() {
        let (mut context, _) = mixed_context(true);
        let separator = HaplotypeSeparator {
            policy: FlaggedPolicy::DiscardAll,
            ..HaplotypeSeparator::from_config(context.config())
        };
        context.call_variants(4.0, 0.0);
        let snp_columns: Vec<usize> = context.current_variants().unwrap()
            .snp_columns()
            .map(|vc| vc.column)
            .collect();
        let spans_snp = |r: &AlignmentRecord| snp_columns.iter().any(|&c| r.position() <= c && c < r.reference_end());

        let summary = separator.penalize(&mut context).unwrap();
        assert!(summary.flagged > 0);
        assert_eq!(summary.flagged, summary.discarded);
        // majority reads only get flagged where they span a detected SNP column, edge reads may survive
        assert!(context.retained_alignments(false).into_iter().all(|r| r.id() < 10000 || !spans_snp(r)));
    }

    #[test]
    fn test_penalize_skips_displaced() {
        // 10 bp bins with room for 10 bases each; every 1 bp read disagrees with the reference
        let config = PolishConfigBuilder::default()
            .trim_ends(false)
            .bin_size(10)
            .max_coverage(1)
            .snp_penalty(10)
            .build().unwrap();
        let mut context = ReferenceContext::new("displaced".to_string(), 20, config).unwrap();
        context.set_reference(vec![b'A'; 20], None).unwrap();
        let reads = [
            (0, 0, "C", 50),
            (1, 0, "C", 45),
            (2, 0, "C", 20),
            (3, 0, "AAAAAAAAA", 900),
            (4, 10, "C", 50),
            (5, 10, "C", 45),
            (6, 10, "AAAAAAAAA", 900)
        ];
        for (id, position, sequence, score) in reads.into_iter() {
            let cigar = parse_cigar(&format!("{}M", sequence.len())).unwrap();
            let record = AlignmentRecord::new(id, format!("r{id}"), position, cigar, sequence.as_bytes().to_vec(), None, Some(score));
            assert_eq!(context.admit(record), AdmitOutcome::Admitted);
        }

        let separator = HaplotypeSeparator::from_config(context.config());
        context.call_variants(1.0, 0.0);
        let summary = separator.penalize(&mut context).unwrap();

        // 0 is discarded, 1 comes back and displaces 2 from the full bin, so 2 is never counted;
        // the alternation carries on in the next bin with 4 discarded and 5 re-admitted
        assert_eq!(summary, PenaltySummary { flagged: 4, discarded: 2, readmitted: 2, rejected: 0 });
        let retained: Vec<u64> = context.retained_alignments(true).iter().map(|r| r.id()).collect();
        assert_eq!(retained, vec![1, 3, 5, 6]);
        assert_eq!(context.store().get(1).unwrap().score(), Some(35));
    }

    #[test_log::test]
    fn test_separation_accepted() {
        let (mut context, snp_columns) = mixed_context(true);
        let minority = context.reference().unwrap().to_vec();
        let separator = HaplotypeSeparator::from_config(context.config());
        let report = separator.run(&mut context).unwrap();

        assert!(report.accepted);
        let estimate = report.estimate.unwrap();
        assert!((5.0..=8.0).contains(&estimate));
        assert!((5..=8).contains(&context.store().max_coverage()));
        assert!(report.evicted > 0);

        // the interior SNP columns now follow the reference haplotype
        let consensus = report.consensus.unwrap();
        for &column in snp_columns.iter().filter(|&&c| (300..1700).contains(&c)) {
            let index = consensus.columns().iter().position(|&c| c == column).unwrap();
            assert_eq!(consensus.sequence()[index], minority[column]);
        }
    }

    #[test]
    fn test_separation_rejected() {
        let (mut context, _) = mixed_context(false);
        let before: Vec<u64> = context.retained_alignments(true).iter().map(|r| r.id()).collect();
        let separator = HaplotypeSeparator::from_config(context.config());
        let report = separator.run(&mut context).unwrap();

        assert!(!report.accepted);
        assert!(report.estimate.is_none());
        assert!(report.consensus.is_none());
        let after: Vec<u64> = context.retained_alignments(true).iter().map(|r| r.id()).collect();
        assert_eq!(before, after);
        assert_eq!(context.store().max_coverage(), 50);
    }

    #[test]
    fn test_restored_on_rejection() {
        // the lone disagreeing read gets flagged and dropped, which leaves no SNP columns to estimate from
        let config = PolishConfigBuilder::default()
            .trim_ends(false)
            .separation_min_freq(1.0)
            .significance_threshold(0.5)
            .flagged_policy(FlaggedPolicy::DiscardAll)
            .build().unwrap();
        let mut context = ReferenceContext::new("single".to_string(), 8, config).unwrap();
        context.set_reference(b"ACGTACGT".to_vec(), None).unwrap();
        for i in 0..4 {
            context.admit(AlignmentRecord::new(i, format!("r{i}"), 0, parse_cigar("8M").unwrap(), b"ACGTACGT".to_vec(), None, Some(16)));
        }
        context.admit(AlignmentRecord::new(4, "alt".to_string(), 0, parse_cigar("8M").unwrap(), b"ACGAACGT".to_vec(), None, Some(10)));

        let separator = HaplotypeSeparator::from_config(context.config());
        let report = separator.run(&mut context).unwrap();
        assert_eq!(report.penalties.flagged, 1);
        assert_eq!(report.penalties.discarded, 1);
        assert!(!report.accepted);
        assert_eq!(context.store().len(), 5);
        assert!(context.store().get(4).is_some());

        // nothing built from the penalized alignments outlives the restore
        assert!(context.matrix().is_none());
        assert!(context.consensus().is_none());
        assert!(context.current_variants().is_err());
    }
}
