//! Output plumbing: final and shard file naming, gzip-aware sinks and
//! readers, the sparse-matrix merge that renumbers shard rows into global
//! coordinates, and the in-place header rewrite used by single-worker runs.

use crate::errors::{AppError, Result};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::Builder;
use tracing::warn;

pub const MTX_BANNER: &str = "%%MatrixMarket matrix coordinate integer general";

/// Final output locations inside the output directory.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub mtx_ad: String,
    pub mtx_dp: String,
    pub mtx_oth: String,
    pub vcf_base: String,
    pub vcf_cells: Option<String>,
    pub samples: String,
}

impl OutputPaths {
    pub fn new(out_dir: &str, gzip: bool, genotype: bool) -> Self {
        let suffix = if gzip { ".gz" } else { "" };
        let join = |name: &str| {
            Path::new(out_dir)
                .join(name)
                .to_string_lossy()
                .into_owned()
        };
        Self {
            mtx_ad: join(&format!("cellSNP.tag.AD.mtx{suffix}")),
            mtx_dp: join(&format!("cellSNP.tag.DP.mtx{suffix}")),
            mtx_oth: join(&format!("cellSNP.tag.OTH.mtx{suffix}")),
            vcf_base: join(&format!("cellSNP.base.vcf{suffix}")),
            vcf_cells: genotype.then(|| join(&format!("cellSNP.cells.vcf{suffix}"))),
            samples: join("cellSNP.samples.tsv"),
        }
    }
}

/// Shards live next to their final file as `<final>.<w>`.
pub fn shard_path(final_path: &str, index: usize) -> String {
    format!("{final_path}.{index}")
}

pub fn remove_shards<I, S>(paths: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for path in paths {
        let path = path.as_ref();
        if let Err(error) = std::fs::remove_file(path) {
            warn!("failed to remove shard file {path}: {error}");
        }
    }
}

/// Buffered text sink, optionally gzip-compressed. `finish` must be called
/// to flush (and close the gzip stream) before the file is read back.
pub enum TextSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl TextSink {
    pub fn create(path: &str, gzip: bool) -> Result<Self> {
        Self::from_file(File::create(path)?, gzip)
    }

    /// Opens for appending; with gzip this starts a new member, which the
    /// multi-member reader side handles transparently.
    pub fn append(path: &str, gzip: bool) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Self::from_file(file, gzip)
    }

    fn from_file(file: File, gzip: bool) -> Result<Self> {
        let buffered = BufWriter::new(file);
        if gzip {
            Ok(TextSink::Gzip(GzEncoder::new(
                buffered,
                Compression::default(),
            )))
        } else {
            Ok(TextSink::Plain(buffered))
        }
    }

    pub fn finish(self) -> Result<()> {
        match self {
            TextSink::Plain(mut inner) => inner.flush()?,
            TextSink::Gzip(inner) => {
                inner.finish()?.flush()?;
            }
        }
        Ok(())
    }
}

impl Write for TextSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            TextSink::Plain(inner) => inner.write(buf),
            TextSink::Gzip(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            TextSink::Plain(inner) => inner.flush(),
            TextSink::Gzip(inner) => inner.flush(),
        }
    }
}

/// Gzip-aware buffered reader; multi-member streams (appended members,
/// bgzf blocks) decode end to end.
pub fn open_text_reader(path: &str, gzip: bool) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if gzip {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub fn write_matrix_banner<W: Write>(out: &mut W) -> Result<()> {
    writeln!(out, "{MTX_BANNER}")?;
    writeln!(out, "%")?;
    Ok(())
}

/// Merges per-worker matrix shards into the final file: banner, the global
/// size line, then every shard's rows with the row index shifted by the
/// retained-SNP total of the shards before it. The row total is checked
/// against the expected non-zero count.
pub fn merge_matrix(
    final_path: &str,
    gzip: bool,
    shards: &[(String, u64)],
    n_snps: u64,
    n_groups: usize,
    n_rows: u64,
) -> Result<()> {
    let mut sink = TextSink::create(final_path, gzip)?;
    write_matrix_banner(&mut sink)?;
    writeln!(sink, "{n_snps}\t{n_groups}\t{n_rows}")?;

    let mut base = 0u64;
    let mut written = 0u64;
    for (shard, retained) in shards {
        let reader = open_text_reader(shard, gzip)?;
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let (row_text, rest) = line.split_once('\t').ok_or_else(|| {
                AppError::parse(format!("malformed shard row in {shard}: {line}"))
            })?;
            let local_row: u64 = row_text.parse().map_err(|_| {
                AppError::parse(format!("malformed shard row index in {shard}: {line}"))
            })?;
            writeln!(sink, "{}\t{rest}", base + local_row)?;
            written += 1;
        }
        base += retained;
    }
    if written != n_rows {
        return Err(AppError::internal(format!(
            "matrix merge of {final_path} wrote {written} rows, expected {n_rows}"
        )));
    }
    sink.finish()
}

/// Concatenates variant-file shards below the given header. Shard rows are
/// self-describing, so no rewriting happens.
pub fn merge_vcf(final_path: &str, gzip: bool, header: &str, shards: &[String]) -> Result<()> {
    let mut sink = TextSink::create(final_path, gzip)?;
    sink.write_all(header.as_bytes())?;
    for shard in shards {
        let mut reader = open_text_reader(shard, gzip)?;
        std::io::copy(&mut reader, &mut sink)?;
    }
    sink.finish()
}

/// Single-worker runs write matrix rows below a bare banner; this inserts
/// the size line once the totals are known, going through a sibling
/// temporary file that replaces the original.
pub fn rewrite_matrix_header(
    path: &str,
    gzip: bool,
    n_snps: u64,
    n_groups: usize,
    n_rows: u64,
) -> Result<()> {
    let reader = open_text_reader(path, gzip)?;
    let parent = Path::new(path)
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let staged = Builder::new()
        .prefix("cellsnp_")
        .suffix(".tmp_mtx")
        .tempfile_in(parent)?;

    let mut sink = TextSink::from_file(staged.reopen()?, gzip)?;
    let mut size_line_written = false;
    for line in reader.lines() {
        let line = line?;
        if !size_line_written && !line.starts_with('%') {
            writeln!(sink, "{n_snps}\t{n_groups}\t{n_rows}")?;
            size_line_written = true;
        }
        writeln!(sink, "{line}")?;
    }
    if !size_line_written {
        writeln!(sink, "{n_snps}\t{n_groups}\t{n_rows}")?;
    }
    sink.finish()?;

    staged.persist(path).map_err(|error| error.error)?;
    Ok(())
}

pub fn write_samples_file(path: &str, groups: &[String]) -> Result<()> {
    let mut sink = TextSink::create(path, false)?;
    for group in groups {
        writeln!(sink, "{group}")?;
    }
    sink.finish()
}

pub fn vcf_base_header() -> String {
    let mut header = String::new();
    header.push_str("##fileformat=VCFv4.2\n");
    header.push_str("##source=cellsnp-rs\n");
    header.push_str(
        "##INFO=<ID=AD,Number=1,Type=Integer,Description=\"Depth of the alternate allele\">\n",
    );
    header.push_str(
        "##INFO=<ID=DP,Number=1,Type=Integer,Description=\"Depth of ref and alt alleles\">\n",
    );
    header.push_str(
        "##INFO=<ID=OTH,Number=1,Type=Integer,Description=\"Depth of other alleles\">\n",
    );
    header.push_str("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n");
    header
}

pub fn vcf_cells_header(groups: &[String]) -> String {
    let mut header = String::new();
    header.push_str("##fileformat=VCFv4.2\n");
    header.push_str("##source=cellsnp-rs\n");
    header.push_str(
        "##INFO=<ID=AD,Number=1,Type=Integer,Description=\"Depth of the alternate allele\">\n",
    );
    header.push_str(
        "##INFO=<ID=DP,Number=1,Type=Integer,Description=\"Depth of ref and alt alleles\">\n",
    );
    header.push_str(
        "##INFO=<ID=OTH,Number=1,Type=Integer,Description=\"Depth of other alleles\">\n",
    );
    header.push_str("##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n");
    header.push_str(
        "##FORMAT=<ID=AD,Number=1,Type=Integer,Description=\"Depth of the alternate allele\">\n",
    );
    header.push_str(
        "##FORMAT=<ID=DP,Number=1,Type=Integer,Description=\"Depth of ref and alt alleles\">\n",
    );
    header.push_str(
        "##FORMAT=<ID=OTH,Number=1,Type=Integer,Description=\"Depth of other alleles\">\n",
    );
    header.push_str(
        "##FORMAT=<ID=PL,Number=G,Type=Integer,Description=\"Phred-scaled genotype likelihoods\">\n",
    );
    header.push_str(
        "##FORMAT=<ID=ALL,Number=5,Type=Integer,Description=\"Counts of A,C,G,T,N bases\">\n",
    );
    header.push_str("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT");
    for group in groups {
        header.push('\t');
        header.push_str(group);
    }
    header.push('\n');
    header
}

#[cfg(test)]
mod tests {
    use super::{
        MTX_BANNER, OutputPaths, TextSink, merge_matrix, merge_vcf, open_text_reader,
        rewrite_matrix_header, shard_path, vcf_cells_header, write_matrix_banner,
    };
    use std::io::{BufRead, Write};

    fn write_file(path: &str, content: &str, gzip: bool) {
        let mut sink = TextSink::create(path, gzip).expect("expected sink");
        sink.write_all(content.as_bytes()).expect("expected write");
        sink.finish().expect("expected finish");
    }

    fn read_file(path: &str, gzip: bool) -> String {
        let reader = open_text_reader(path, gzip).expect("expected reader");
        let mut lines = Vec::new();
        for line in reader.lines() {
            lines.push(line.expect("expected line"));
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    #[test]
    fn output_paths_follow_gzip_and_genotype_flags() {
        let plain = OutputPaths::new("out", false, false);
        assert!(plain.mtx_ad.ends_with("cellSNP.tag.AD.mtx"));
        assert!(plain.vcf_cells.is_none());

        let zipped = OutputPaths::new("out", true, true);
        assert!(zipped.mtx_oth.ends_with("cellSNP.tag.OTH.mtx.gz"));
        assert!(
            zipped
                .vcf_cells
                .as_deref()
                .is_some_and(|path| path.ends_with("cellSNP.cells.vcf.gz"))
        );
        // The samples list is never compressed.
        assert!(zipped.samples.ends_with("cellSNP.samples.tsv"));
    }

    #[test]
    fn shard_names_append_the_worker_index() {
        assert_eq!(shard_path("out/cellSNP.tag.AD.mtx", 3), "out/cellSNP.tag.AD.mtx.3");
    }

    #[test]
    fn merge_offsets_rows_by_prior_shard_totals() {
        // S4: two workers with three retained SNPs each; the second shard's
        // rows land at 4..6.
        let dir = tempfile::tempdir().expect("expected tempdir");
        let final_path = dir
            .path()
            .join("cellSNP.tag.AD.mtx")
            .to_string_lossy()
            .into_owned();
        let shard0 = shard_path(&final_path, 0);
        let shard1 = shard_path(&final_path, 1);
        write_file(&shard0, "1\t1\t2\n2\t1\t1\n3\t2\t4\n", false);
        write_file(&shard1, "1\t2\t1\n2\t1\t5\n3\t1\t1\n", false);

        merge_matrix(
            &final_path,
            false,
            &[(shard0, 3), (shard1, 3)],
            6,
            2,
            6,
        )
        .expect("expected merge success");

        let content = read_file(&final_path, false);
        let expected = format!(
            "{MTX_BANNER}\n%\n6\t2\t6\n1\t1\t2\n2\t1\t1\n3\t2\t4\n4\t2\t1\n5\t1\t5\n6\t1\t1\n"
        );
        assert_eq!(content, expected);
    }

    #[test]
    fn merge_rejects_row_count_mismatch() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let final_path = dir
            .path()
            .join("cellSNP.tag.DP.mtx")
            .to_string_lossy()
            .into_owned();
        let shard0 = shard_path(&final_path, 0);
        write_file(&shard0, "1\t1\t2\n", false);
        let result = merge_matrix(&final_path, false, &[(shard0, 1)], 1, 1, 5);
        assert!(result.is_err());
    }

    #[test]
    fn merge_handles_gzip_shards() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let final_path = dir
            .path()
            .join("cellSNP.tag.AD.mtx.gz")
            .to_string_lossy()
            .into_owned();
        let shard0 = shard_path(&final_path, 0);
        write_file(&shard0, "1\t1\t7\n", true);

        merge_matrix(&final_path, true, &[(shard0, 1)], 1, 1, 1)
            .expect("expected merge success");
        let content = read_file(&final_path, true);
        assert!(content.ends_with("1\t1\t1\n1\t1\t7\n"));
    }

    #[test]
    fn vcf_merge_concatenates_below_header() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let final_path = dir
            .path()
            .join("cellSNP.base.vcf")
            .to_string_lossy()
            .into_owned();
        let shard0 = shard_path(&final_path, 0);
        let shard1 = shard_path(&final_path, 1);
        write_file(&shard0, "1\t11\t.\tA\tC\t.\tPASS\tAD=1;DP=3;OTH=0\n", false);
        write_file(&shard1, "2\t21\t.\tG\tT\t.\tPASS\tAD=2;DP=4;OTH=1\n", false);

        merge_vcf(&final_path, false, "#CHROM\tPOS\n", &[shard0, shard1])
            .expect("expected merge success");
        let content = read_file(&final_path, false);
        assert_eq!(
            content,
            "#CHROM\tPOS\n1\t11\t.\tA\tC\t.\tPASS\tAD=1;DP=3;OTH=0\n2\t21\t.\tG\tT\t.\tPASS\tAD=2;DP=4;OTH=1\n"
        );
    }

    #[test]
    fn rewrite_inserts_size_line_after_banner() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let path = dir
            .path()
            .join("cellSNP.tag.AD.mtx")
            .to_string_lossy()
            .into_owned();
        let mut sink = TextSink::create(&path, false).expect("expected sink");
        write_matrix_banner(&mut sink).expect("expected banner");
        sink.write_all(b"1\t1\t2\n2\t3\t1\n").expect("expected rows");
        sink.finish().expect("expected finish");

        rewrite_matrix_header(&path, false, 2, 3, 2).expect("expected rewrite success");
        let content = read_file(&path, false);
        assert_eq!(
            content,
            format!("{MTX_BANNER}\n%\n2\t3\t2\n1\t1\t2\n2\t3\t1\n")
        );
    }

    #[test]
    fn rewrite_handles_appended_gzip_members() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let path = dir
            .path()
            .join("cellSNP.tag.AD.mtx.gz")
            .to_string_lossy()
            .into_owned();
        let mut sink = TextSink::create(&path, true).expect("expected sink");
        write_matrix_banner(&mut sink).expect("expected banner");
        sink.finish().expect("expected finish");
        let mut appended = TextSink::append(&path, true).expect("expected append sink");
        appended.write_all(b"1\t2\t9\n").expect("expected rows");
        appended.finish().expect("expected finish");

        rewrite_matrix_header(&path, true, 1, 2, 1).expect("expected rewrite success");
        let content = read_file(&path, true);
        assert_eq!(content, format!("{MTX_BANNER}\n%\n1\t2\t1\n1\t2\t9\n"));
    }

    #[test]
    fn cells_header_lists_groups_as_sample_columns() {
        let header = vcf_cells_header(&["c1".to_string(), "c2".to_string()]);
        let columns = header
            .lines()
            .last()
            .expect("expected column line")
            .to_string();
        assert!(columns.ends_with("FORMAT\tc1\tc2"));
    }
}
