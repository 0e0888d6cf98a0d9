use crate::input::SnpMap;

/// How observations map onto output columns: by the per-read cell tag, or by
/// the index of the input file the read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    ByBarcode,
    BySampleId,
}

/// Read-level filter parameters (§ read filter / extractor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFilterParams {
    pub min_mapq: u8,
    pub min_len: u32,
    pub rflag_filter: u16,
    pub rflag_require: u16,
    pub no_orphan: bool,
    /// Per-locus read cap handed to the pileup buffers; `<= 0` is unlimited.
    pub max_depth: i32,
}

impl Default for ReadFilterParams {
    fn default() -> Self {
        Self {
            min_mapq: 20,
            min_len: 30,
            rflag_filter: 0,
            rflag_require: 0,
            no_orphan: true,
            max_depth: 0,
        }
    }
}

/// SNP-level retention thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct SnpThresholds {
    pub min_count: u64,
    pub min_maf: f64,
}

impl Default for SnpThresholds {
    fn default() -> Self {
        Self {
            min_count: 20,
            min_maf: 0.0,
        }
    }
}

/// Immutable engine configuration, shared read-only across workers.
#[derive(Debug)]
pub struct PileupConfig {
    pub inputs: Vec<String>,
    pub sample_mode: SampleMode,
    /// Group names in output-column order (barcodes or sample IDs).
    pub groups: Vec<String>,
    /// Listed SNPs gate and pre-type loci; `None` genotypes every covered
    /// position de novo.
    pub snps: Option<SnpMap>,
    pub chroms: Vec<String>,
    pub cell_tag: Option<String>,
    pub umi_tag: Option<String>,
    pub filters: ReadFilterParams,
    pub thresholds: SnpThresholds,
    pub genotype: bool,
    pub doublet_gl: bool,
    pub gzip: bool,
    pub n_workers: usize,
    pub out_dir: String,
}

impl PileupConfig {
    pub fn use_barcodes(&self) -> bool {
        self.sample_mode == SampleMode::ByBarcode
    }

    pub fn use_umi(&self) -> bool {
        self.umi_tag.is_some()
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    /// Minimal configuration for kernel-level tests.
    #[cfg(test)]
    pub fn for_tests(sample_mode: SampleMode, groups: Vec<String>) -> Self {
        Self {
            inputs: Vec::new(),
            sample_mode,
            groups,
            snps: None,
            chroms: Vec::new(),
            cell_tag: match sample_mode {
                SampleMode::ByBarcode => Some("CB".to_string()),
                SampleMode::BySampleId => None,
            },
            umi_tag: None,
            filters: ReadFilterParams::default(),
            thresholds: SnpThresholds::default(),
            genotype: false,
            doublet_gl: false,
            gzip: false,
            n_workers: 1,
            out_dir: String::new(),
        }
    }
}
