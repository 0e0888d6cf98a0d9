//! Alignment-file access: the read-level filter, per-read observation
//! extraction at a pileup column, and a positional merge over the per-file
//! pileup iterators so every covered locus is seen once with its events
//! grouped by input file.

use crate::config::PileupConfig;
use crate::errors::{AppError, Result};
use crate::mplp::base_index;
use rust_htslib::bam::record::{Aux, Cigar};
use rust_htslib::bam;

/// Flag-level read filter applied to every record of a pileup column before
/// it reaches the aggregator.
#[derive(Debug, Clone, Copy)]
pub struct ReadFilter {
    min_mapq: u8,
    rflag_filter: u16,
    rflag_require: u16,
    no_orphan: bool,
}

impl ReadFilter {
    pub fn from_config(config: &PileupConfig) -> Self {
        Self {
            min_mapq: config.filters.min_mapq,
            rflag_filter: config.filters.rflag_filter,
            rflag_require: config.filters.rflag_require,
            no_orphan: config.filters.no_orphan,
        }
    }

    pub fn accepts(&self, record: &bam::Record) -> bool {
        if record.tid() < 0 || record.is_unmapped() {
            return false;
        }
        if record.mapq() < self.min_mapq {
            return false;
        }
        let flags = record.flags();
        if flags & self.rflag_filter != 0 {
            return false;
        }
        if flags & self.rflag_require != self.rflag_require {
            return false;
        }
        if self.no_orphan && record.is_paired() && !record.is_proper_pair() {
            return false;
        }
        true
    }
}

/// A read that survived extraction at the queried position.
#[derive(Debug)]
pub struct ExtractedRead {
    pub base_idx: usize,
    pub qual: u8,
    pub cell: Option<String>,
    pub umi: Option<String>,
}

#[derive(Debug)]
pub enum ReadExtract {
    Accepted(ExtractedRead),
    /// Deletion/refskip event or too little aligned sequence.
    SkipFilter,
    /// A required auxiliary tag is missing.
    SkipFormat,
}

/// Resolves one pileup event into an observation. Tag presence is checked
/// first (the cheap rejections), then the event type, then the aligned
/// length; a query position beyond the stored sequence reads as N with
/// quality zero.
pub fn extract_read(
    alignment: &bam::pileup::Alignment<'_>,
    record: &bam::Record,
    config: &PileupConfig,
) -> ReadExtract {
    let umi = match &config.umi_tag {
        Some(tag) => match aux_string(record, tag) {
            Some(value) => Some(value),
            None => return ReadExtract::SkipFormat,
        },
        None => None,
    };
    let cell = if config.use_barcodes() {
        let Some(tag) = &config.cell_tag else {
            return ReadExtract::SkipFormat;
        };
        match aux_string(record, tag) {
            Some(value) => Some(value),
            None => return ReadExtract::SkipFormat,
        }
    } else {
        None
    };

    if alignment.is_del() || alignment.is_refskip() {
        return ReadExtract::SkipFilter;
    }
    if config.filters.min_len > 0 && aligned_match_len(record) < config.filters.min_len {
        return ReadExtract::SkipFilter;
    }

    let Some(qpos) = alignment.qpos() else {
        return ReadExtract::SkipFilter;
    };
    let seq = record.seq();
    let (base_idx, qual) = if qpos < seq.len() {
        (base_index(seq[qpos]), record.qual()[qpos])
    } else {
        (4, 0)
    };

    ReadExtract::Accepted(ExtractedRead {
        base_idx,
        qual,
        cell,
        umi,
    })
}

fn aux_string(record: &bam::Record, tag: &str) -> Option<String> {
    match record.aux(tag.as_bytes()) {
        Ok(Aux::String(value)) => Some(value.to_string()),
        _ => None,
    }
}

/// Total length of CIGAR operations that align query to reference
/// (M, =, X).
pub fn aligned_match_len(record: &bam::Record) -> u32 {
    record
        .cigar()
        .iter()
        .map(|op| match op {
            Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => *len,
            _ => 0,
        })
        .sum()
}

/// Looks a chromosome up in a header, tolerating a missing or extra `chr`
/// prefix between the configured name and the header spelling.
pub fn resolve_tid(header: &bam::HeaderView, chrom: &str) -> Option<u32> {
    if let Some(tid) = header.tid(chrom.as_bytes()) {
        return Some(tid);
    }
    match chrom.strip_prefix("chr") {
        Some(stripped) => header.tid(stripped.as_bytes()),
        None => header.tid(format!("chr{chrom}").as_bytes()),
    }
}

pub fn target_names(header: &bam::HeaderView) -> Vec<String> {
    (0..header.target_count())
        .map(|tid| String::from_utf8_lossy(header.tid2name(tid)).into_owned())
        .collect()
}

/// All inputs must agree on their target tables; the tid-to-name mapping of
/// the first file drives every worker.
pub fn check_identical_targets(tables: &[Vec<String>], inputs: &[String]) -> Result<()> {
    for (index, table) in tables.iter().enumerate().skip(1) {
        if table != &tables[0] {
            return Err(AppError::config(format!(
                "header of {} does not match {}: inputs must share identical target tables",
                inputs[index], inputs[0]
            )));
        }
    }
    Ok(())
}

/// One covered position with its pileup columns, one slot per input file.
/// `None` means that file has no reads there.
pub struct Locus {
    pub tid: u32,
    pub pos: u32,
    pub columns: Vec<Option<bam::pileup::Pileup>>,
}

impl Locus {
    pub fn depth(&self) -> u32 {
        self.columns
            .iter()
            .flatten()
            .map(|column| column.depth())
            .sum()
    }
}

/// Positional merge over per-file pileup iterators.
///
/// Each sub-iterator walks its own file; a pending column is held per file
/// and the minimum position is yielded with the columns of every file that
/// covers it. A column stays valid until its own iterator advances, which
/// only happens after the caller has consumed the previous locus.
pub struct MultiPileup<'a> {
    iters: Vec<bam::pileup::Pileups<'a, bam::IndexedReader>>,
    pending: Vec<Option<bam::pileup::Pileup>>,
    exhausted: Vec<bool>,
}

impl<'a> MultiPileup<'a> {
    pub fn new(mut iters: Vec<bam::pileup::Pileups<'a, bam::IndexedReader>>, max_depth: u32) -> Self {
        for iter in &mut iters {
            iter.set_max_depth(max_depth);
        }
        let n = iters.len();
        Self {
            iters,
            pending: (0..n).map(|_| None).collect(),
            exhausted: vec![false; n],
        }
    }

    pub fn next_locus(&mut self) -> Result<Option<Locus>> {
        for (index, iter) in self.iters.iter_mut().enumerate() {
            if self.pending[index].is_none() && !self.exhausted[index] {
                match iter.next() {
                    Some(column) => self.pending[index] = Some(column?),
                    None => self.exhausted[index] = true,
                }
            }
        }

        let Some((tid, pos)) = self
            .pending
            .iter()
            .flatten()
            .map(|column| (column.tid(), column.pos()))
            .min()
        else {
            return Ok(None);
        };

        let columns = self
            .pending
            .iter_mut()
            .map(|slot| {
                if slot
                    .as_ref()
                    .is_some_and(|column| column.tid() == tid && column.pos() == pos)
                {
                    slot.take()
                } else {
                    None
                }
            })
            .collect();

        Ok(Some(Locus { tid, pos, columns }))
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadFilter, aligned_match_len};
    use crate::config::{PileupConfig, SampleMode};
    use rust_htslib::bam::Record;
    use rust_htslib::bam::record::{Cigar, CigarString};

    const FLAG_PAIRED: u16 = 0x1;
    const FLAG_PROPER_PAIR: u16 = 0x2;
    const FLAG_UNMAP: u16 = 0x4;
    const FLAG_DUP: u16 = 0x400;

    fn test_record(flags: u16, mapq: u8) -> Record {
        let mut record = Record::new();
        let seq = b"ACGTACGTAC";
        let qual = [30u8; 10];
        record.set(
            b"read1",
            Some(&CigarString(vec![Cigar::Match(10)])),
            seq,
            &qual,
        );
        record.set_tid(0);
        record.set_pos(100);
        record.set_mapq(mapq);
        record.set_flags(flags);
        record
    }

    fn filter_with(
        min_mapq: u8,
        rflag_filter: u16,
        rflag_require: u16,
        no_orphan: bool,
    ) -> ReadFilter {
        let mut config = PileupConfig::for_tests(SampleMode::BySampleId, vec!["s0".to_string()]);
        config.filters.min_mapq = min_mapq;
        config.filters.rflag_filter = rflag_filter;
        config.filters.rflag_require = rflag_require;
        config.filters.no_orphan = no_orphan;
        ReadFilter::from_config(&config)
    }

    #[test]
    fn accepts_a_plain_mapped_read() {
        let filter = filter_with(20, FLAG_UNMAP | FLAG_DUP, 0, true);
        assert!(filter.accepts(&test_record(0, 30)));
    }

    #[test]
    fn rejects_unmapped_and_low_mapq_reads() {
        let filter = filter_with(20, 0, 0, true);
        assert!(!filter.accepts(&test_record(FLAG_UNMAP, 30)));
        assert!(!filter.accepts(&test_record(0, 19)));
        assert!(filter.accepts(&test_record(0, 20)));
    }

    #[test]
    fn rejects_reads_matching_the_filter_mask() {
        let filter = filter_with(0, FLAG_DUP, 0, true);
        assert!(!filter.accepts(&test_record(FLAG_DUP, 30)));
        assert!(filter.accepts(&test_record(0, 30)));
    }

    #[test]
    fn requires_all_bits_of_the_require_mask() {
        let filter = filter_with(0, 0, FLAG_PAIRED | FLAG_PROPER_PAIR, false);
        assert!(!filter.accepts(&test_record(FLAG_PAIRED, 30)));
        assert!(filter.accepts(&test_record(FLAG_PAIRED | FLAG_PROPER_PAIR, 30)));
    }

    #[test]
    fn orphan_mates_are_rejected_unless_counted() {
        let strict = filter_with(0, 0, 0, true);
        assert!(!strict.accepts(&test_record(FLAG_PAIRED, 30)));
        assert!(strict.accepts(&test_record(FLAG_PAIRED | FLAG_PROPER_PAIR, 30)));
        // Unpaired reads are never orphans.
        assert!(strict.accepts(&test_record(0, 30)));

        let lenient = filter_with(0, 0, 0, false);
        assert!(lenient.accepts(&test_record(FLAG_PAIRED, 30)));
    }

    #[test]
    fn aligned_length_sums_match_equal_and_diff_operations() {
        let mut record = Record::new();
        let seq = vec![b'A'; 40];
        let qual = vec![30u8; 40];
        let cigar = CigarString(vec![
            Cigar::SoftClip(5),
            Cigar::Match(20),
            Cigar::Ins(5),
            Cigar::Equal(6),
            Cigar::Del(2),
            Cigar::Diff(4),
        ]);
        record.set(b"read1", Some(&cigar), &seq, &qual);
        assert_eq!(aligned_match_len(&record), 30);
    }
}
