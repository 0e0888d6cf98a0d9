use crate::errors::{AppError, Result};
use crate::input;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};

/// Read-flag bits used for the default exclusion mask.
pub const FLAG_UNMAP: u16 = 0x4;
pub const FLAG_SECONDARY: u16 = 0x100;
pub const FLAG_QCFAIL: u16 = 0x200;
pub const FLAG_DUP: u16 = 0x400;

const DEF_EXCL_FLAG_UMI: u16 = FLAG_UNMAP | FLAG_SECONDARY | FLAG_QCFAIL;
const DEF_EXCL_FLAG_NOUMI: u16 = FLAG_UNMAP | FLAG_SECONDARY | FLAG_QCFAIL | FLAG_DUP;

#[derive(Debug, Clone, Parser)]
#[command(name = "cellsnp", disable_version_flag = true)]
struct CliArgs {
    #[arg(short = 's', long = "samFile")]
    sam_file: Option<String>,
    #[arg(short = 'S', long = "samFileList")]
    sam_file_list: Option<String>,
    #[arg(short = 'O', long = "outDir")]
    out_dir: Option<String>,
    #[arg(short = 'R', long = "regionsVCF")]
    regions_vcf: Option<String>,
    #[arg(short = 'b', long = "barcodeFile")]
    barcode_file: Option<String>,
    #[arg(short = 'i', long = "sampleIDs")]
    sample_ids: Option<String>,
    #[arg(long = "chrom")]
    chrom: Option<String>,
    #[arg(long = "cellTAG", default_value = "CB")]
    cell_tag: String,
    #[arg(long = "UMItag", default_value = "Auto")]
    umi_tag: String,
    #[arg(long = "minCOUNT", default_value = "20")]
    min_count: String,
    #[arg(long = "minMAF", default_value = "0.0")]
    min_maf: String,
    #[arg(long = "genotype", action = ArgAction::SetTrue)]
    genotype: bool,
    #[arg(long = "doubletGL", action = ArgAction::SetTrue)]
    doublet_gl: bool,
    #[arg(long = "gzip", action = ArgAction::SetTrue)]
    gzip: bool,
    #[arg(long = "minLEN", default_value = "30")]
    min_len: String,
    #[arg(long = "minMAPQ", default_value = "20")]
    min_mapq: String,
    #[arg(long = "maxDEPTH", default_value = "0")]
    max_depth: String,
    #[arg(long = "inclFLAG", default_value = "0")]
    incl_flag: String,
    #[arg(long = "exclFLAG")]
    excl_flag: Option<String>,
    #[arg(long = "countORPHAN", action = ArgAction::SetTrue)]
    count_orphan: bool,
    #[arg(short = 'p', long = "nproc", default_value = "1")]
    nproc: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellsnpArgs {
    pub sam_files: Vec<String>,
    pub out_dir: String,
    pub regions_vcf: Option<String>,
    pub barcode_file: Option<String>,
    pub sample_ids: Option<String>,
    pub chroms: Vec<String>,
    pub cell_tag: Option<String>,
    pub umi_tag: Option<String>,
    pub min_count: u64,
    pub min_maf: f64,
    pub genotype: bool,
    pub doublet_gl: bool,
    pub gzip: bool,
    pub min_len: u32,
    pub min_mapq: u8,
    pub max_depth: i32,
    pub incl_flag: u16,
    pub excl_flag: Option<u16>,
    pub count_orphan: bool,
    pub nproc: usize,
}

impl Default for CellsnpArgs {
    fn default() -> Self {
        Self {
            sam_files: Vec::new(),
            out_dir: String::new(),
            regions_vcf: None,
            barcode_file: None,
            sample_ids: None,
            chroms: Vec::new(),
            cell_tag: Some("CB".to_string()),
            umi_tag: Some("UB".to_string()),
            min_count: 20,
            min_maf: 0.0,
            genotype: false,
            doublet_gl: false,
            gzip: false,
            min_len: 30,
            min_mapq: 20,
            max_depth: 0,
            incl_flag: 0,
            excl_flag: None,
            count_orphan: false,
            nproc: 1,
        }
    }
}

impl CellsnpArgs {
    pub fn use_barcodes(&self) -> bool {
        self.barcode_file.is_some()
    }

    pub fn use_umi(&self) -> bool {
        self.umi_tag.is_some()
    }

    /// Exclusion mask actually applied: the explicit value, or a default
    /// that additionally drops duplicates when UMI grouping is off.
    pub fn effective_excl_flag(&self) -> u16 {
        match self.excl_flag {
            Some(mask) => mask,
            None if self.use_umi() => DEF_EXCL_FLAG_UMI,
            None => DEF_EXCL_FLAG_NOUMI,
        }
    }

    pub fn no_orphan(&self) -> bool {
        !self.count_orphan
    }

    pub fn validate(&self) -> Result<()> {
        if self.sam_files.is_empty() {
            return Err(AppError::MissingRequired {
                field: "--samFile or --samFileList".to_string(),
            });
        }
        if self.out_dir.is_empty() {
            return Err(AppError::MissingRequired {
                field: "--outDir".to_string(),
            });
        }
        if self.barcode_file.is_some() && self.sample_ids.is_some() {
            return Err(AppError::InvalidValue {
                flag: "--sampleIDs".to_string(),
                value: self.sample_ids.clone().unwrap_or_default(),
                reason: "--barcodeFile and --sampleIDs are mutually exclusive".to_string(),
            });
        }
        if self.barcode_file.is_some() && self.cell_tag.is_none() {
            return Err(AppError::InvalidValue {
                flag: "--cellTAG".to_string(),
                value: "None".to_string(),
                reason: "a cell tag is required when a barcode file is given".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_maf) {
            return Err(AppError::InvalidValue {
                flag: "--minMAF".to_string(),
                value: self.min_maf.to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if self.doublet_gl && !self.genotype {
            return Err(AppError::InvalidValue {
                flag: "--doubletGL".to_string(),
                value: "true".to_string(),
                reason: "--doubletGL requires --genotype".to_string(),
            });
        }
        if self.nproc == 0 {
            return Err(AppError::InvalidValue {
                flag: "--nproc".to_string(),
                value: "0".to_string(),
                reason: "must be a positive integer".to_string(),
            });
        }
        Ok(())
    }
}

pub fn parse_from_env() -> Result<CellsnpArgs> {
    parse_args(std::env::args())
}

pub fn parse_args<I, S>(args: I) -> Result<CellsnpArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut tokens: Vec<String> = args.into_iter().map(Into::into).collect();
    if tokens.is_empty() {
        tokens.push("cellsnp".to_string());
    }

    let cli = CliArgs::try_parse_from(tokens).map_err(map_clap_error)?;

    let mut sam_files: Vec<String> = cli
        .sam_file
        .as_deref()
        .map(split_comma_list)
        .unwrap_or_default();
    if let Some(list_path) = cli.sam_file_list.as_deref() {
        sam_files.extend(input::read_simple_list(list_path)?);
    }

    let cell_tag = parse_tag_name("--cellTAG", &cli.cell_tag)?;
    let umi_tag = match cli.umi_tag.as_str() {
        // "Auto": UMI grouping follows barcode usage.
        "Auto" | "auto" => cli.barcode_file.is_some().then(|| "UB".to_string()),
        other => parse_tag_name("--UMItag", other)?,
    };

    let parsed = CellsnpArgs {
        sam_files,
        out_dir: cli.out_dir.unwrap_or_default(),
        regions_vcf: cli.regions_vcf,
        barcode_file: cli.barcode_file,
        sample_ids: cli.sample_ids,
        chroms: cli
            .chrom
            .as_deref()
            .map(split_comma_list)
            .unwrap_or_default(),
        cell_tag,
        umi_tag,
        min_count: parse_u64("--minCOUNT", &cli.min_count)?,
        min_maf: parse_f64("--minMAF", &cli.min_maf)?,
        genotype: cli.genotype,
        doublet_gl: cli.doublet_gl,
        gzip: cli.gzip,
        min_len: parse_u32("--minLEN", &cli.min_len)?,
        min_mapq: parse_u8("--minMAPQ", &cli.min_mapq)?,
        max_depth: parse_i32("--maxDEPTH", &cli.max_depth)?,
        incl_flag: parse_flag_mask("--inclFLAG", &cli.incl_flag)?,
        excl_flag: cli
            .excl_flag
            .as_deref()
            .map(|value| parse_flag_mask("--exclFLAG", value))
            .transpose()?,
        count_orphan: cli.count_orphan,
        nproc: parse_usize("--nproc", &cli.nproc)?,
    };

    parsed.validate()?;
    Ok(parsed)
}

fn split_comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// A tag name is two visible characters; the literal "None" disables it.
fn parse_tag_name(flag: &str, value: &str) -> Result<Option<String>> {
    if value == "None" || value == "none" {
        return Ok(None);
    }
    if value.len() == 2 && value.bytes().all(|b| b.is_ascii_graphic()) {
        return Ok(Some(value.to_string()));
    }
    Err(AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a two-character tag name or \"None\"".to_string(),
    })
}

/// Flag masks accept decimal or 0x-prefixed hexadecimal.
fn parse_flag_mask(flag: &str, value: &str) -> Result<u16> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        value.parse::<u16>().ok()
    };
    parsed.ok_or_else(|| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a SAM flag mask (decimal or 0x hex)".to_string(),
    })
}

fn map_clap_error(error: clap::Error) -> AppError {
    let kind = error.kind();
    let rendered = error.to_string();
    match kind {
        ErrorKind::UnknownArgument => AppError::UnsupportedArgument {
            arg: first_quoted_token(&rendered).unwrap_or(rendered),
        },
        ErrorKind::TooFewValues | ErrorKind::WrongNumberOfValues => AppError::MissingValue {
            flag: first_quoted_token(&rendered).unwrap_or_else(|| "argument".to_string()),
        },
        _ => AppError::ParseError {
            message: clap_error_message(&rendered),
        },
    }
}

fn first_quoted_token(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let end = message[start + 1..].find('\'')?;
    Some(message[start + 1..start + 1 + end].to_string())
}

fn clap_error_message(message: &str) -> String {
    message
        .lines()
        .find_map(|line| line.strip_prefix("error: "))
        .or_else(|| message.lines().next())
        .unwrap_or("failed to parse arguments")
        .to_string()
}

fn parse_usize(flag: &str, value: &str) -> Result<usize> {
    value.parse::<usize>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a non-negative integer".to_string(),
    })
}

fn parse_u64(flag: &str, value: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a non-negative integer".to_string(),
    })
}

fn parse_u32(flag: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a non-negative integer".to_string(),
    })
}

fn parse_u8(flag: &str, value: &str) -> Result<u8> {
    value.parse::<u8>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be an integer within [0, 255]".to_string(),
    })
}

fn parse_i32(flag: &str, value: &str) -> Result<i32> {
    value.parse::<i32>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be an integer".to_string(),
    })
}

fn parse_f64(flag: &str, value: &str) -> Result<f64> {
    value.parse::<f64>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a floating-point number".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::parse_args;

    #[test]
    fn parses_minimal_barcode_mode_arguments() {
        let args = parse_args([
            "cellsnp",
            "-s",
            "possorted.bam",
            "-b",
            "barcodes.tsv",
            "-O",
            "out",
        ])
        .expect("expected parse success");

        assert_eq!(args.sam_files, vec!["possorted.bam".to_string()]);
        assert_eq!(args.barcode_file.as_deref(), Some("barcodes.tsv"));
        assert_eq!(args.cell_tag.as_deref(), Some("CB"));
        assert_eq!(args.umi_tag.as_deref(), Some("UB"));
        assert_eq!(args.min_count, 20);
        assert!(args.no_orphan());
    }

    #[test]
    fn umi_auto_is_disabled_without_barcodes() {
        let args = parse_args(["cellsnp", "-s", "a.bam,b.bam", "-i", "s0,s1", "-O", "out"])
            .expect("expected parse success");

        assert_eq!(args.sam_files.len(), 2);
        assert!(args.umi_tag.is_none());
        // Without UMIs, duplicates join the default exclusion mask.
        assert_eq!(args.effective_excl_flag(), 1796);
    }

    #[test]
    fn umi_mode_uses_reduced_default_exclusion_mask() {
        let args = parse_args([
            "cellsnp",
            "-s",
            "possorted.bam",
            "-b",
            "barcodes.tsv",
            "-O",
            "out",
        ])
        .expect("expected parse success");
        assert_eq!(args.effective_excl_flag(), 772);
    }

    #[test]
    fn parses_hex_flag_mask_and_explicit_tags() {
        let args = parse_args([
            "cellsnp",
            "-s",
            "a.bam",
            "-i",
            "s0",
            "-O",
            "out",
            "--UMItag",
            "UR",
            "--cellTAG",
            "None",
            "--exclFLAG",
            "0x704",
        ])
        .expect("expected parse success");

        assert!(args.cell_tag.is_none());
        assert_eq!(args.umi_tag.as_deref(), Some("UR"));
        assert_eq!(args.excl_flag, Some(0x704));
    }

    #[test]
    fn rejects_missing_inputs() {
        let result = parse_args(["cellsnp", "-O", "out"]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_barcodes_combined_with_sample_ids() {
        let result = parse_args([
            "cellsnp",
            "-s",
            "a.bam",
            "-b",
            "barcodes.tsv",
            "-i",
            "s0",
            "-O",
            "out",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_doublet_gl_without_genotype() {
        let result = parse_args([
            "cellsnp",
            "-s",
            "a.bam",
            "-i",
            "s0",
            "-O",
            "out",
            "--doubletGL",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_out_of_range_maf() {
        let result = parse_args([
            "cellsnp", "-s", "a.bam", "-i", "s0", "-O", "out", "--minMAF", "1.5",
        ]);
        assert!(result.is_err());
    }
}
