//! Pipeline orchestration: builds the engine configuration from the parsed
//! arguments, fans chromosomes out over a fixed worker pool, and merges the
//! per-worker shards into the final matrices and variant files.
//!
//! Every work item is one chromosome. Shard w of each output belongs to item
//! w, and the merge renumbers matrix rows in item order, so the final row
//! numbering is deterministic for a given chromosome list no matter how the
//! pool schedules the items.

use crate::cli::CellsnpArgs;
use crate::config::{PileupConfig, ReadFilterParams, SampleMode, SnpThresholds};
use crate::errors::{AppError, Result};
use crate::input::{self, AllelePair};
use crate::mplp::{LocusVerdict, PushOutcome, ReadObservation, SnpPileup, index_base};
use crate::pileup::{self, MultiPileup, ReadExtract, ReadFilter};
use crate::writer::{self, OutputPaths, TextSink};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use rust_htslib::bam::{self, Read as _};
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ceiling on concurrently open files across the pool; bounds the worker
/// count at `TP_MAX_OPEN / (inputs + outputs)`.
const TP_MAX_OPEN: usize = 1024;
const TP_NTRY: usize = 3;
const TP_RETRY_DELAY: Duration = Duration::from_millis(200);
const DEPTH_WARN_LIMIT: u32 = 1 << 20;

/// Public result of one chromosome worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerSummary {
    pub retained_snps: u64,
    pub nr_ad: u64,
    pub nr_dp: u64,
    pub nr_oth: u64,
    pub n_pushed: u64,
    pub n_skip_filter: u64,
    pub n_skip_format: u64,
    pub n_dup_umi: u64,
    pub n_not_in_set: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    ns: u64,
    nr_ad: u64,
    nr_dp: u64,
    nr_oth: u64,
}

fn totals_of(summaries: &[WorkerSummary]) -> Totals {
    let mut totals = Totals::default();
    for summary in summaries {
        totals.ns += summary.retained_snps;
        totals.nr_ad += summary.nr_ad;
        totals.nr_dp += summary.nr_dp;
        totals.nr_oth += summary.nr_oth;
    }
    totals
}

/// One pool submission: the chromosomes to walk and the files to write.
#[derive(Debug, Clone)]
struct WorkItem {
    index: usize,
    chroms: Vec<String>,
    /// Single-worker runs append below pre-written headers instead of
    /// writing fresh shards.
    append: bool,
    mtx_ad: String,
    mtx_dp: String,
    mtx_oth: String,
    vcf_base: String,
    vcf_cells: Option<String>,
}

impl WorkItem {
    fn shard_paths(&self) -> impl Iterator<Item = &String> {
        [&self.mtx_ad, &self.mtx_dp, &self.mtx_oth, &self.vcf_base]
            .into_iter()
            .chain(self.vcf_cells.as_ref())
    }
}

/// Worker count after clamping to the chromosome count and the open-file
/// ceiling.
pub fn plan_workers(nproc: usize, n_chroms: usize, n_inputs: usize) -> usize {
    let fd_budget = (TP_MAX_OPEN / (n_inputs + 6)).max(1);
    nproc.min(n_chroms.max(1)).min(fd_budget)
}

pub fn run(args: &CellsnpArgs) -> Result<()> {
    let config = build_config(args)?;
    fs::create_dir_all(&config.out_dir)?;
    let paths = OutputPaths::new(&config.out_dir, config.gzip, config.genotype);
    writer::write_samples_file(&paths.samples, &config.groups)?;
    info!(
        "pileup over {} input(s), {} group(s), {} chromosome(s), {} worker(s)",
        config.inputs.len(),
        config.n_groups(),
        config.chroms.len(),
        config.n_workers
    );

    if config.n_workers > 1 {
        run_sharded(&config, &paths)
    } else {
        run_direct(&config, &paths)
    }
}

fn build_config(args: &CellsnpArgs) -> Result<PileupConfig> {
    let (sample_mode, groups) = match &args.barcode_file {
        Some(path) => (SampleMode::ByBarcode, input::load_barcodes(path)?),
        None => (
            SampleMode::BySampleId,
            input::resolve_sample_ids(args.sample_ids.as_deref(), &args.sam_files)?,
        ),
    };

    let snps = args
        .regions_vcf
        .as_deref()
        .map(input::load_snp_file)
        .transpose()?;
    if let Some(snps) = &snps {
        info!("loaded {} SNP position(s)", snps.len());
    }

    // Open every input once up front: catches missing files/indices early
    // and pins down the target table all workers must agree on.
    let mut target_tables = Vec::with_capacity(args.sam_files.len());
    for path in &args.sam_files {
        let reader = bam::IndexedReader::from_path(path)?;
        target_tables.push(pileup::target_names(reader.header()));
    }
    pileup::check_identical_targets(&target_tables, &args.sam_files)?;

    let chroms = if args.chroms.is_empty() {
        target_tables[0].clone()
    } else {
        args.chroms.clone()
    };
    if chroms.is_empty() {
        return Err(AppError::config("no chromosomes to process"));
    }

    Ok(PileupConfig {
        n_workers: plan_workers(args.nproc, chroms.len(), args.sam_files.len()),
        inputs: args.sam_files.clone(),
        sample_mode,
        groups,
        snps,
        chroms,
        cell_tag: args.cell_tag.clone(),
        umi_tag: args.umi_tag.clone(),
        filters: ReadFilterParams {
            min_mapq: args.min_mapq,
            min_len: args.min_len,
            rflag_filter: args.effective_excl_flag(),
            rflag_require: args.incl_flag,
            no_orphan: args.no_orphan(),
            max_depth: args.max_depth,
        },
        thresholds: SnpThresholds {
            min_count: args.min_count,
            min_maf: args.min_maf,
        },
        genotype: args.genotype,
        doublet_gl: args.doublet_gl,
        gzip: args.gzip,
        out_dir: args.out_dir.clone(),
    })
}

fn run_sharded(config: &PileupConfig, paths: &OutputPaths) -> Result<()> {
    let items: Vec<WorkItem> = config
        .chroms
        .iter()
        .enumerate()
        .map(|(index, chrom)| WorkItem {
            index,
            chroms: vec![chrom.clone()],
            append: false,
            mtx_ad: writer::shard_path(&paths.mtx_ad, index),
            mtx_dp: writer::shard_path(&paths.mtx_dp, index),
            mtx_oth: writer::shard_path(&paths.mtx_oth, index),
            vcf_base: writer::shard_path(&paths.vcf_base, index),
            vcf_cells: paths
                .vcf_cells
                .as_ref()
                .map(|path| writer::shard_path(path, index)),
        })
        .collect();

    let pool = build_pool(config.n_workers)?;
    let progress = PipelineProgress::new(items.len() as u64);
    let results: Vec<Result<WorkerSummary>> = pool.install(|| {
        items
            .par_iter()
            .map(|item| {
                let result = pileup_worker(item, config);
                progress.on_item_done(&item.chroms);
                result
            })
            .collect()
    });

    let mut summaries = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(error) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }
    if let Some(error) = first_error {
        progress.abandon();
        remove_all_shards(&items);
        return Err(error);
    }

    let totals = totals_of(&summaries);
    progress.finish(totals.ns);

    let merge_result = merge_outputs(config, paths, &items, &summaries, totals);
    remove_all_shards(&items);
    merge_result?;

    info!(
        "retained {} SNP(s): nr_ad={} nr_dp={} nr_oth={}",
        totals.ns, totals.nr_ad, totals.nr_dp, totals.nr_oth
    );
    Ok(())
}

fn merge_outputs(
    config: &PileupConfig,
    paths: &OutputPaths,
    items: &[WorkItem],
    summaries: &[WorkerSummary],
    totals: Totals,
) -> Result<()> {
    let shards_of = |select: fn(&WorkItem) -> &String| -> Vec<(String, u64)> {
        items
            .iter()
            .zip(summaries)
            .map(|(item, summary)| (select(item).clone(), summary.retained_snps))
            .collect()
    };

    let n_groups = config.n_groups();
    writer::merge_matrix(
        &paths.mtx_ad,
        config.gzip,
        &shards_of(|item| &item.mtx_ad),
        totals.ns,
        n_groups,
        totals.nr_ad,
    )?;
    writer::merge_matrix(
        &paths.mtx_dp,
        config.gzip,
        &shards_of(|item| &item.mtx_dp),
        totals.ns,
        n_groups,
        totals.nr_dp,
    )?;
    writer::merge_matrix(
        &paths.mtx_oth,
        config.gzip,
        &shards_of(|item| &item.mtx_oth),
        totals.ns,
        n_groups,
        totals.nr_oth,
    )?;

    let base_shards: Vec<String> = items.iter().map(|item| item.vcf_base.clone()).collect();
    writer::merge_vcf(
        &paths.vcf_base,
        config.gzip,
        &writer::vcf_base_header(),
        &base_shards,
    )?;

    if let Some(final_cells) = &paths.vcf_cells {
        let cell_shards: Vec<String> = items
            .iter()
            .filter_map(|item| item.vcf_cells.clone())
            .collect();
        writer::merge_vcf(
            final_cells,
            config.gzip,
            &writer::vcf_cells_header(&config.groups),
            &cell_shards,
        )?;
    }
    Ok(())
}

fn remove_all_shards(items: &[WorkItem]) {
    for item in items {
        writer::remove_shards(item.shard_paths());
    }
}

/// Single-worker path: the worker appends straight into the final files
/// below pre-written headers, and the matrix size line is patched in once
/// the totals are known.
fn run_direct(config: &PileupConfig, paths: &OutputPaths) -> Result<()> {
    for path in [&paths.mtx_ad, &paths.mtx_dp, &paths.mtx_oth] {
        let mut sink = TextSink::create(path, config.gzip)?;
        writer::write_matrix_banner(&mut sink)?;
        sink.finish()?;
    }
    let mut sink = TextSink::create(&paths.vcf_base, config.gzip)?;
    sink.write_all(writer::vcf_base_header().as_bytes())?;
    sink.finish()?;
    if let Some(cells) = &paths.vcf_cells {
        let mut sink = TextSink::create(cells, config.gzip)?;
        sink.write_all(writer::vcf_cells_header(&config.groups).as_bytes())?;
        sink.finish()?;
    }

    let item = WorkItem {
        index: 0,
        chroms: config.chroms.clone(),
        append: true,
        mtx_ad: paths.mtx_ad.clone(),
        mtx_dp: paths.mtx_dp.clone(),
        mtx_oth: paths.mtx_oth.clone(),
        vcf_base: paths.vcf_base.clone(),
        vcf_cells: paths.vcf_cells.clone(),
    };

    let progress = PipelineProgress::new(1);
    let summary = match pileup_worker(&item, config) {
        Ok(summary) => summary,
        Err(error) => {
            progress.abandon();
            // Failed runs leave no partial user-visible outputs behind.
            writer::remove_shards(item.shard_paths());
            return Err(error);
        }
    };
    progress.on_item_done(&item.chroms);
    progress.finish(summary.retained_snps);

    let n_groups = config.n_groups();
    writer::rewrite_matrix_header(
        &paths.mtx_ad,
        config.gzip,
        summary.retained_snps,
        n_groups,
        summary.nr_ad,
    )?;
    writer::rewrite_matrix_header(
        &paths.mtx_dp,
        config.gzip,
        summary.retained_snps,
        n_groups,
        summary.nr_dp,
    )?;
    writer::rewrite_matrix_header(
        &paths.mtx_oth,
        config.gzip,
        summary.retained_snps,
        n_groups,
        summary.nr_oth,
    )?;

    info!(
        "retained {} SNP(s): nr_ad={} nr_dp={} nr_oth={}",
        summary.retained_snps, summary.nr_ad, summary.nr_dp, summary.nr_oth
    );
    Ok(())
}

/// Walks the item's chromosomes through the multi-file pileup and writes
/// matrix rows and variant records for every retained locus.
fn pileup_worker(item: &WorkItem, config: &PileupConfig) -> Result<WorkerSummary> {
    let filter = ReadFilter::from_config(config);
    let mut readers = Vec::with_capacity(config.inputs.len());
    for path in &config.inputs {
        readers.push(bam::IndexedReader::from_path(path)?);
    }

    let mut outputs = WorkerOutputs::open(item, config)?;
    let mut mplp = SnpPileup::new(&config.groups);
    let mut summary = WorkerSummary::default();
    let max_depth = effective_max_depth(config);
    let mut vcf_line = String::with_capacity(256);

    for chrom in &item.chroms {
        let snp_positions = match config.snps.as_ref() {
            Some(map) => match map.chrom_positions(chrom) {
                Some(positions) => Some(positions),
                None => {
                    debug!("no listed SNPs on chromosome {chrom}, skipping");
                    continue;
                }
            },
            None => None,
        };

        for reader in &mut readers {
            let header = reader.header();
            let tid = pileup::resolve_tid(header, chrom).ok_or_else(|| {
                AppError::config(format!(
                    "chromosome {chrom} not found in the alignment header"
                ))
            })?;
            let end = header.target_len(tid).unwrap_or(0);
            reader.fetch((tid, 0, end))?;
        }

        let pileups = readers.iter_mut().map(|reader| reader.pileup()).collect();
        let mut multi = MultiPileup::new(pileups, max_depth);
        let mut chrom_snps = 0u64;
        while let Some(locus) = multi.next_locus()? {
            let alleles = match snp_positions {
                Some(positions) => match positions.get(&i64::from(locus.pos)) {
                    Some(pair) => *pair,
                    None => continue,
                },
                None => AllelePair::UNSET,
            };

            mplp.reset(alleles.ref_idx, alleles.alt_idx);
            for (file_index, column) in locus.columns.iter().enumerate() {
                let Some(column) = column else { continue };
                for alignment in column.alignments() {
                    let record = alignment.record();
                    if !filter.accepts(&record) {
                        continue;
                    }
                    match pileup::extract_read(&alignment, &record, config) {
                        ReadExtract::Accepted(read) => {
                            let observation = ReadObservation {
                                base_idx: read.base_idx,
                                qual: read.qual,
                                cell: read.cell.as_deref(),
                                umi: read.umi.as_deref(),
                            };
                            match mplp.push(&observation, file_index, config)? {
                                PushOutcome::Inserted => summary.n_pushed += 1,
                                PushOutcome::DuplicateUmi => summary.n_dup_umi += 1,
                                PushOutcome::NotInSet => summary.n_not_in_set += 1,
                            }
                        }
                        ReadExtract::SkipFilter => summary.n_skip_filter += 1,
                        ReadExtract::SkipFormat => summary.n_skip_format += 1,
                    }
                }
            }

            if mplp.stat(config)? == LocusVerdict::Dropped {
                continue;
            }
            summary.retained_snps += 1;
            summary.nr_ad += mplp.nr_ad;
            summary.nr_dp += mplp.nr_dp;
            summary.nr_oth += mplp.nr_oth;
            chrom_snps += 1;
            write_locus(
                &mplp,
                summary.retained_snps,
                chrom,
                locus.pos,
                &mut outputs,
                &mut vcf_line,
            )?;
        }
        info!("chromosome {chrom}: retained {chrom_snps} SNP(s)");
    }

    debug!(
        "worker {}: pushed={} skip_filter={} skip_format={} dup_umi={} not_in_set={}",
        item.index,
        summary.n_pushed,
        summary.n_skip_filter,
        summary.n_skip_format,
        summary.n_dup_umi,
        summary.n_not_in_set
    );
    outputs.finish()?;
    Ok(summary)
}

fn write_locus(
    mplp: &SnpPileup,
    row: u64,
    chrom: &str,
    pos: u32,
    outputs: &mut WorkerOutputs,
    line: &mut String,
) -> Result<()> {
    for col in 0..mplp.n_groups() {
        let group = mplp.group(col);
        if group.ad > 0 {
            writeln!(outputs.mtx_ad, "{row}\t{}\t{}", col + 1, group.ad)?;
        }
        if group.dp > 0 {
            writeln!(outputs.mtx_dp, "{row}\t{}\t{}", col + 1, group.dp)?;
        }
        if group.oth > 0 {
            writeln!(outputs.mtx_oth, "{row}\t{}\t{}", col + 1, group.oth)?;
        }
    }

    line.clear();
    let _ = write!(
        line,
        "{chrom}\t{}\t.\t{}\t{}\t.\tPASS\tAD={};DP={};OTH={}",
        pos + 1,
        index_base(mplp.ref_idx),
        index_base(mplp.alt_idx),
        mplp.ad,
        mplp.dp,
        mplp.oth
    );
    writeln!(outputs.vcf_base, "{line}")?;
    if let Some(vcf_cells) = outputs.vcf_cells.as_mut() {
        line.push_str("\tGT:AD:DP:OTH:PL:ALL");
        mplp.format_cells_fields(line);
        writeln!(vcf_cells, "{line}")?;
    }
    Ok(())
}

struct WorkerOutputs {
    mtx_ad: TextSink,
    mtx_dp: TextSink,
    mtx_oth: TextSink,
    vcf_base: TextSink,
    vcf_cells: Option<TextSink>,
}

impl WorkerOutputs {
    fn open(item: &WorkItem, config: &PileupConfig) -> Result<Self> {
        let open = |path: &str| {
            if item.append {
                TextSink::append(path, config.gzip)
            } else {
                TextSink::create(path, config.gzip)
            }
        };
        Ok(Self {
            mtx_ad: open(&item.mtx_ad)?,
            mtx_dp: open(&item.mtx_dp)?,
            mtx_oth: open(&item.mtx_oth)?,
            vcf_base: open(&item.vcf_base)?,
            vcf_cells: match &item.vcf_cells {
                Some(path) => Some(open(path)?),
                None => None,
            },
        })
    }

    fn finish(self) -> Result<()> {
        self.mtx_ad.finish()?;
        self.mtx_dp.finish()?;
        self.mtx_oth.finish()?;
        self.vcf_base.finish()?;
        if let Some(sink) = self.vcf_cells {
            sink.finish()?;
        }
        Ok(())
    }
}

fn effective_max_depth(config: &PileupConfig) -> u32 {
    if config.filters.max_depth <= 0 {
        warn!("max depth set to the maximum value ({})", i32::MAX);
        return i32::MAX as u32;
    }
    let depth = config.filters.max_depth as u32;
    if depth > DEPTH_WARN_LIMIT / config.inputs.len().max(1) as u32 {
        warn!("combined max depth is above 1M, potential memory hog");
    }
    depth
}

fn build_pool(n_workers: usize) -> Result<rayon::ThreadPool> {
    let mut attempt = 0;
    loop {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .build()
        {
            Ok(pool) => return Ok(pool),
            Err(error) => {
                attempt += 1;
                if attempt >= TP_NTRY {
                    return Err(AppError::Resource {
                        message: format!("failed to build the worker pool: {error}"),
                    });
                }
                warn!("worker pool creation failed (attempt {attempt}): {error}");
                std::thread::sleep(TP_RETRY_DELAY);
            }
        }
    }
}

#[derive(Debug)]
struct PipelineProgress {
    bar: ProgressBar,
}

impl PipelineProgress {
    fn new(total_items: u64) -> Self {
        let bar = ProgressBar::new(total_items);
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(4));
        let style =
            ProgressStyle::with_template("{spinner:.green} {elapsed_precise} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(200));
        bar.set_message("pileup running");
        Self { bar }
    }

    fn on_item_done(&self, chroms: &[String]) {
        self.bar.inc(1);
        self.bar.set_message(format!("finished {}", chroms.join(",")));
    }

    fn finish(&self, retained: u64) {
        self.bar
            .finish_with_message(format!("done, retained {retained} SNP(s)"));
    }

    fn abandon(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkerSummary, plan_workers, totals_of};

    #[test]
    fn worker_count_respects_chromosomes_and_fd_ceiling() {
        assert_eq!(plan_workers(8, 2, 1), 2);
        assert_eq!(plan_workers(2, 8, 1), 2);
        // 1024 / (1 + 6) = 146 caps very wide pools.
        assert_eq!(plan_workers(512, 512, 1), 146);
        // Many inputs shrink the budget further.
        assert_eq!(plan_workers(512, 512, 250), 4);
        assert_eq!(plan_workers(1, 0, 1), 1);
    }

    #[test]
    fn totals_sum_worker_summaries_in_order() {
        let summaries = [
            WorkerSummary {
                retained_snps: 3,
                nr_ad: 2,
                nr_dp: 5,
                nr_oth: 1,
                ..WorkerSummary::default()
            },
            WorkerSummary {
                retained_snps: 4,
                nr_ad: 1,
                nr_dp: 6,
                nr_oth: 0,
                ..WorkerSummary::default()
            },
        ];
        let totals = totals_of(&summaries);
        assert_eq!(totals.ns, 7);
        assert_eq!(totals.nr_ad, 3);
        assert_eq!(totals.nr_dp, 11);
        assert_eq!(totals.nr_oth, 1);
    }
}
