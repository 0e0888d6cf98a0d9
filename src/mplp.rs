//! Per-locus aggregation and statistics.
//!
//! One [`SnpPileup`] is allocated per worker and reset between loci. Reads
//! are pushed one observation at a time, grouped by cell barcode or by input
//! file, then [`SnpPileup::stat`] turns the accumulated counts into the
//! retained/dropped verdict, AD/DP/OTH values and (optionally) per-group
//! genotype likelihoods.

use crate::config::PileupConfig;
use crate::errors::{AppError, Result};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

pub const NBASE: usize = 5;
pub const PHRED_MAX: u8 = 45;
pub const ERR_FLOOR: f64 = 0.25;

/// PL values are saturated here; a q=0 observation yields a genuine zero
/// likelihood whose Phred scaling would otherwise be unbounded.
const PL_CAP: f64 = 255.0;

/// Maps an ASCII base to its index in `ACGTN`; anything unrecognised is N.
pub fn base_index(base: u8) -> usize {
    match base.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

pub fn index_base(index: i8) -> char {
    match index {
        0 => 'A',
        1 => 'C',
        2 => 'G',
        3 => 'T',
        4 => 'N',
        _ => '.',
    }
}

/// Top-two alleles by count over `ACGT` (N is never a candidate). Ties go to
/// the smaller alphabet index; zero-count alleles stay eligible, so only a
/// locus with no A/C/G/T observation at all returns `(-1, -1)`.
pub fn infer_allele(bc: &[u64; NBASE]) -> (i8, i8) {
    if bc[..4].iter().all(|count| *count == 0) {
        return (-1, -1);
    }
    let mut rid = 0usize;
    for i in 1..4 {
        if bc[i] > bc[rid] {
            rid = i;
        }
    }
    let mut aid = usize::MAX;
    for i in 0..4 {
        if i != rid && (aid == usize::MAX || bc[i] > bc[aid]) {
            aid = i;
        }
    }
    (rid as i8, aid as i8)
}

/// Precomputed per-quality log10 likelihood contributions.
///
/// For a clipped quality q, `p_err = max(10^(-q/10), ERR_FLOOR)`; a read
/// contributes `log10(1 - p_err)` to its own allele's slot and
/// `log10(p_err / 3)` to each of the other three.
#[derive(Debug, Clone)]
pub struct QualTable {
    matched: [f64; PHRED_MAX as usize + 1],
    mismatched: [f64; PHRED_MAX as usize + 1],
}

impl QualTable {
    pub fn new() -> Self {
        let mut matched = [0.0; PHRED_MAX as usize + 1];
        let mut mismatched = [0.0; PHRED_MAX as usize + 1];
        for q in 0..=PHRED_MAX as usize {
            let p_err = (10f64.powf(-(q as f64) / 10.0)).max(ERR_FLOOR);
            matched[q] = (1.0 - p_err).log10();
            mismatched[q] = (p_err / 3.0).log10();
        }
        Self {
            matched,
            mismatched,
        }
    }

    /// Likelihood 4-vector for one observed base; `base_idx` picks the
    /// matched slot, N (index 4) matches nothing.
    pub fn qvec(&self, qual: u8, base_idx: usize) -> [f64; 4] {
        let q = qual.min(PHRED_MAX) as usize;
        let mut rv = [self.mismatched[q]; 4];
        if base_idx < 4 {
            rv[base_idx] = self.matched[q];
        }
        rv
    }
}

impl Default for QualTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Pileup stats of one sample group at one locus.
#[derive(Debug, Default)]
pub struct GroupPileup {
    pub bc: [u64; NBASE],
    pub tc: u64,
    pub ad: u64,
    pub dp: u64,
    pub oth: u64,
    pub qu: [Vec<u8>; NBASE],
    pub qmat: [[f64; 4]; NBASE],
    pub gl: Vec<f64>,
    seen_umis: HashSet<String>,
}

impl GroupPileup {
    /// Clears counts while keeping allocations for the next locus.
    fn reset(&mut self) {
        self.bc = [0; NBASE];
        self.tc = 0;
        self.ad = 0;
        self.dp = 0;
        self.oth = 0;
        for quals in &mut self.qu {
            quals.clear();
        }
        self.qmat = [[0.0; 4]; NBASE];
        self.gl.clear();
        self.seen_umis.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    DuplicateUmi,
    NotInSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocusVerdict {
    Retained,
    Dropped,
}

/// One read observation at the queried position, already past the read-level
/// filters. Tags are borrowed from the extracted record.
#[derive(Debug)]
pub struct ReadObservation<'a> {
    pub base_idx: usize,
    pub qual: u8,
    pub cell: Option<&'a str>,
    pub umi: Option<&'a str>,
}

/// All sample groups at one locus plus the locus-level summary.
#[derive(Debug)]
pub struct SnpPileup {
    pub ref_idx: i8,
    pub alt_idx: i8,
    pub inf_rid: i8,
    pub inf_aid: i8,
    pub bc: [u64; NBASE],
    pub tc: u64,
    pub ad: u64,
    pub dp: u64,
    pub oth: u64,
    pub nr_ad: u64,
    pub nr_dp: u64,
    pub nr_oth: u64,
    groups: Vec<GroupPileup>,
    group_index: HashMap<String, usize>,
    qual_table: QualTable,
}

impl SnpPileup {
    pub fn new(group_names: &[String]) -> Self {
        let group_index = group_names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        Self {
            ref_idx: -1,
            alt_idx: -1,
            inf_rid: -1,
            inf_aid: -1,
            bc: [0; NBASE],
            tc: 0,
            ad: 0,
            dp: 0,
            oth: 0,
            nr_ad: 0,
            nr_dp: 0,
            nr_oth: 0,
            groups: group_names.iter().map(|_| GroupPileup::default()).collect(),
            group_index,
            qual_table: QualTable::new(),
        }
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, index: usize) -> &GroupPileup {
        &self.groups[index]
    }

    /// Prepares the state for a new locus. Known SNP alleles pre-seed
    /// `ref_idx`/`alt_idx`; `-1` leaves them to inference.
    pub fn reset(&mut self, ref_idx: i8, alt_idx: i8) {
        self.ref_idx = ref_idx;
        self.alt_idx = alt_idx;
        self.inf_rid = -1;
        self.inf_aid = -1;
        self.bc = [0; NBASE];
        self.tc = 0;
        self.ad = 0;
        self.dp = 0;
        self.oth = 0;
        self.nr_ad = 0;
        self.nr_dp = 0;
        self.nr_oth = 0;
        for group in &mut self.groups {
            group.reset();
        }
    }

    /// Routes one observation into its sample group. `file_index` is the
    /// group key in sample-id mode; the cell tag is the key in barcode mode.
    /// At most one observation per `(group, umi)` is counted, first seen
    /// wins.
    pub fn push(
        &mut self,
        observation: &ReadObservation<'_>,
        file_index: usize,
        config: &PileupConfig,
    ) -> Result<PushOutcome> {
        let group_idx = if config.use_barcodes() {
            let Some(cell) = observation.cell else {
                return Err(AppError::internal(
                    "barcode-mode observation without a cell tag".to_string(),
                ));
            };
            match self.group_index.get(cell) {
                Some(idx) => *idx,
                None => return Ok(PushOutcome::NotInSet),
            }
        } else {
            if file_index >= self.groups.len() {
                return Err(AppError::internal(format!(
                    "file index {file_index} outside the sample-group table"
                )));
            }
            file_index
        };

        let group = &mut self.groups[group_idx];
        if config.use_umi() {
            let Some(umi) = observation.umi else {
                return Err(AppError::internal(
                    "UMI-mode observation without a UMI tag".to_string(),
                ));
            };
            if group.seen_umis.contains(umi) {
                return Ok(PushOutcome::DuplicateUmi);
            }
            group.seen_umis.insert(umi.to_string());
        }

        group.bc[observation.base_idx] += 1;
        group.qu[observation.base_idx].push(observation.qual);
        Ok(PushOutcome::Inserted)
    }

    /// Locus statistics: totals, retention gates, allele resolution, per
    /// group AD/DP/OTH and optional genotype likelihoods.
    pub fn stat(&mut self, config: &PileupConfig) -> Result<LocusVerdict> {
        for group in &mut self.groups {
            for j in 0..NBASE {
                group.tc += group.bc[j];
                self.bc[j] += group.bc[j];
            }
        }
        self.tc = self.bc.iter().sum();

        if self.tc < config.thresholds.min_count {
            return Ok(LocusVerdict::Dropped);
        }

        let (inf_rid, inf_aid) = infer_allele(&self.bc);
        self.inf_rid = inf_rid;
        self.inf_aid = inf_aid;
        if inf_rid < 0 || inf_aid < 0 {
            // Nothing but N observed; no ref/alt pair exists.
            return Ok(LocusVerdict::Dropped);
        }
        if (self.bc[inf_aid as usize] as f64) < self.tc as f64 * config.thresholds.min_maf {
            return Ok(LocusVerdict::Dropped);
        }
        if self.ref_idx < 0 || self.alt_idx < 0 {
            self.ref_idx = inf_rid;
            self.alt_idx = inf_aid;
        }

        let ref_idx = self.ref_idx as usize;
        let alt_idx = self.alt_idx as usize;
        self.ad = self.bc[alt_idx];
        self.dp = self.bc[ref_idx] + self.ad;
        self.oth = self.tc - self.dp;

        for group in &mut self.groups {
            group.ad = group.bc[alt_idx];
            if group.ad > 0 {
                self.nr_ad += 1;
            }
            group.dp = group.bc[ref_idx] + group.ad;
            if group.dp > 0 {
                self.nr_dp += 1;
            }
            group.oth = group.tc - group.dp;
            if group.oth > 0 {
                self.nr_oth += 1;
            }
            if config.genotype {
                for i in 0..NBASE {
                    for qual_pos in 0..group.qu[i].len() {
                        let qvec = self.qual_table.qvec(group.qu[i][qual_pos], i);
                        for j in 0..4 {
                            group.qmat[i][j] += qvec[j];
                        }
                    }
                }
                qmat_to_genotype(
                    &group.qmat,
                    &group.bc,
                    self.ref_idx,
                    self.alt_idx,
                    config.doublet_gl,
                    &mut group.gl,
                )?;
            }
        }
        Ok(LocusVerdict::Retained)
    }

    /// Appends the per-group sample columns of the cells VCF, one tab-led
    /// field per group: `GT:AD:DP:OTH:PL:ALL`. Groups without any observed
    /// base print the missing pattern.
    pub fn format_cells_fields(&self, out: &mut String) {
        for group in &self.groups {
            out.push('\t');
            if group.tc == 0 {
                out.push_str(".:.:.:.:.:.");
                continue;
            }
            let pl = phred_scaled(&group.gl);
            out.push_str(genotype_call(&pl));
            let _ = write!(out, ":{}:{}:{}:", group.ad, group.dp, group.oth);
            for (i, value) in pl.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{value}");
            }
            let _ = write!(
                out,
                ":{},{},{},{},{}",
                group.bc[0], group.bc[1], group.bc[2], group.bc[3], group.bc[4]
            );
        }
    }
}

/// Converts the accumulated quality matrix into genotype log10 likelihoods.
///
/// A homozygous genotype sums the matching allele column. A heterozygous
/// genotype mixes the two alleles per read: within one base class the
/// per-read probability under each allele is recovered from the class's
/// column mean (exact whenever a class carries one quality, which the error
/// floor makes the norm) and the halves are averaged before taking logs.
/// Without `doublet_gl` the vector is `(RR, RA, AA)`; with it, all ten
/// unordered genotypes over the allele order `[ref, alt, remaining bases]`
/// in VCF genotype ordering.
fn qmat_to_genotype(
    qmat: &[[f64; 4]; NBASE],
    bc: &[u64; NBASE],
    ref_idx: i8,
    alt_idx: i8,
    doublet_gl: bool,
    gl: &mut Vec<f64>,
) -> Result<()> {
    if ref_idx < 0 || alt_idx < 0 || ref_idx == alt_idx {
        return Err(AppError::internal(format!(
            "genotype likelihoods need distinct ref/alt, got ({ref_idx}, {alt_idx})"
        )));
    }
    let class_pair = |i: usize, a: usize, b: usize| -> f64 {
        if bc[i] == 0 {
            return 0.0;
        }
        if a == b {
            return qmat[i][a];
        }
        let n = bc[i] as f64;
        let p_a = 10f64.powf(qmat[i][a] / n);
        let p_b = 10f64.powf(qmat[i][b] / n);
        n * ((p_a + p_b) / 2.0).log10()
    };
    let pair = |a: usize, b: usize| -> f64 { (0..NBASE).map(|i| class_pair(i, a, b)).sum() };

    gl.clear();
    let r = ref_idx as usize;
    let a = alt_idx as usize;
    if !doublet_gl {
        gl.extend([pair(r, r), pair(r, a), pair(a, a)]);
        return Ok(());
    }

    let mut alleles = [r, a, 0, 0];
    let mut next = 2;
    for base in 0..4 {
        if base != r && base != a {
            alleles[next] = base;
            next += 1;
        }
    }
    for k in 0..4 {
        for j in 0..=k {
            gl.push(pair(alleles[j], alleles[k]));
        }
    }
    Ok(())
}

/// Min-normalised, Phred-scaled likelihoods, saturated at 255.
pub fn phred_scaled(gl: &[f64]) -> Vec<u32> {
    let max = gl.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    gl.iter()
        .map(|value| {
            let scaled = -10.0 * (value - max);
            if scaled.is_finite() {
                scaled.round().min(PL_CAP) as u32
            } else {
                PL_CAP as u32
            }
        })
        .collect()
}

/// GT from the PL vector: the unique smallest entry wins, ties are
/// uncallable. Entries 0..3 are RR, RA, AA in both the triplet and the
/// decuplet layout; a winning genotype outside the ref/alt pair is also
/// uncallable.
pub fn genotype_call(pl: &[u32]) -> &'static str {
    let Some(min) = pl.iter().min().copied() else {
        return "./.";
    };
    if pl.iter().filter(|value| **value == min).count() != 1 {
        return "./.";
    }
    match pl.iter().position(|value| *value == min) {
        Some(0) => "0/0",
        Some(1) => "0/1",
        Some(2) => "1/1",
        _ => "./.",
    }
}
