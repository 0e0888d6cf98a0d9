//! Loaders for the list-shaped inputs: SNP positions, cell barcodes and
//! sample IDs. All readers accept plain or gzip-compressed files.

use crate::errors::{AppError, Result};
use crate::mplp::base_index;
use flate2::read::MultiGzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Explicit alleles attached to a listed SNP; `-1` means not supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllelePair {
    pub ref_idx: i8,
    pub alt_idx: i8,
}

impl AllelePair {
    pub const UNSET: AllelePair = AllelePair {
        ref_idx: -1,
        alt_idx: -1,
    };
}

/// Listed SNP positions, keyed per chromosome. Chromosome keys are stored
/// and queried without the `chr` prefix so list and header spellings can
/// disagree.
#[derive(Debug, Default)]
pub struct SnpMap {
    by_chrom: HashMap<String, HashMap<i64, AllelePair>>,
    n_snps: usize,
}

impl SnpMap {
    pub fn insert(&mut self, chrom: &str, pos0: i64, alleles: AllelePair) {
        let key = normalize_chrom(chrom).to_string();
        if self
            .by_chrom
            .entry(key)
            .or_default()
            .insert(pos0, alleles)
            .is_none()
        {
            self.n_snps += 1;
        }
    }

    pub fn chrom_positions(&self, chrom: &str) -> Option<&HashMap<i64, AllelePair>> {
        self.by_chrom.get(normalize_chrom(chrom))
    }

    pub fn len(&self) -> usize {
        self.n_snps
    }

    pub fn is_empty(&self) -> bool {
        self.n_snps == 0
    }
}

fn normalize_chrom(chrom: &str) -> &str {
    chrom.strip_prefix("chr").unwrap_or(chrom)
}

fn open_reader(path: &str) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|err| AppError::Config {
        message: format!("failed to open {path}: {err}"),
    })?;
    // MultiGzDecoder also walks bgzip members, which plain gzip readers
    // would stop after.
    if path.ends_with(".gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// One trimmed, non-empty entry per line.
pub fn read_simple_list(path: &str) -> Result<Vec<String>> {
    let reader = open_reader(path)?;
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            entries.push(trimmed.to_string());
        }
    }
    Ok(entries)
}

/// Barcode whitelist, one barcode per line.
pub fn load_barcodes(path: &str) -> Result<Vec<String>> {
    let barcodes = read_simple_list(path)?;
    if barcodes.is_empty() {
        return Err(AppError::config(format!("no barcodes found in {path}")));
    }
    Ok(barcodes)
}

/// SNP list in VCF-like layout: CHROM and 1-based POS in the first two
/// columns, single-base REF/ALT taken from columns four and five when both
/// are plain A/C/G/T. Header and comment lines start with `#`.
pub fn load_snp_file(path: &str) -> Result<SnpMap> {
    let reader = open_reader(path)?;
    let mut snps = SnpMap::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split('\t');
        let chrom = fields.next().unwrap_or_default();
        let pos_text = fields.next().unwrap_or_default();
        if chrom.is_empty() || pos_text.is_empty() {
            return Err(AppError::parse(format!(
                "{path}:{}: expected CHROM and POS columns",
                line_no + 1
            )));
        }
        let pos1: i64 = pos_text.parse().map_err(|_| {
            AppError::parse(format!(
                "{path}:{}: invalid position: {pos_text}",
                line_no + 1
            ))
        })?;
        if pos1 < 1 {
            return Err(AppError::parse(format!(
                "{path}:{}: positions are 1-based, got {pos1}",
                line_no + 1
            )));
        }
        let _id = fields.next();
        let alleles = match (fields.next(), fields.next()) {
            (Some(ref_nt), Some(alt_nt)) => parse_alleles(ref_nt, alt_nt),
            _ => AllelePair::UNSET,
        };
        snps.insert(chrom, pos1 - 1, alleles);
    }
    if snps.is_empty() {
        return Err(AppError::config(format!("no SNP records found in {path}")));
    }
    Ok(snps)
}

/// Only an unambiguous biallelic SNV pre-types a locus; everything else is
/// left to allele inference.
fn parse_alleles(ref_nt: &str, alt_nt: &str) -> AllelePair {
    if ref_nt.len() != 1 || alt_nt.len() != 1 {
        return AllelePair::UNSET;
    }
    let ref_idx = base_index(ref_nt.as_bytes()[0]);
    let alt_idx = base_index(alt_nt.as_bytes()[0]);
    if ref_idx > 3 || alt_idx > 3 || ref_idx == alt_idx {
        return AllelePair::UNSET;
    }
    AllelePair {
        ref_idx: ref_idx as i8,
        alt_idx: alt_idx as i8,
    }
}

/// Sample IDs for sample-id mode: the explicit comma-separated list, or the
/// input file stems when none was given.
pub fn resolve_sample_ids(explicit: Option<&str>, inputs: &[String]) -> Result<Vec<String>> {
    let ids: Vec<String> = match explicit {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToString::to_string)
            .collect(),
        None => inputs
            .iter()
            .map(|input| {
                Path::new(input)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| input.clone())
            })
            .collect(),
    };
    if ids.len() != inputs.len() {
        return Err(AppError::config(format!(
            "{} sample IDs for {} input files",
            ids.len(),
            inputs.len()
        )));
    }
    Ok(ids)
}
