//!
//! ## consensus ##
//! -------------
//! Builds one consensus read pair per family of read pairs inside
//! a set of target regions. A family is made of all properly oriented
//! pairs sharing the forward start and the molecular barcode.
//! Pairs whose reverse mate lies behind the region end are completed
//! within an extension window. Reads which did not make it into
//! a pair can be written into a separate BAM with their reason in the OR tag.
//!
//! ## subset ##
//! ----------
//! Keeps all records of a BAM file whose barcode tag is part of
//! a whitelist, optionally after trimming a suffix from the barcode.
//!

use rust_htslib::{bam, bam::Read};
use std::path::Path;
use std::str::FromStr;
use std::env;
use std::process;
use clap::{app_from_crate,crate_name,crate_description,crate_authors,crate_version,SubCommand,Arg,AppSettings};
extern crate pretty_env_logger;
#[macro_use] extern crate log;

// our library which is within the same project
extern crate bcconsensus;
use bcconsensus::lib::common::{*};
use bcconsensus::lib::consensus::StarAligner;
use bcconsensus::lib::hts_lib_based::{*};
use bcconsensus::lib::subset::{read_whitelist, subset_records};


/// parses an option value and names the option on failure
fn parse_value<T>(
    matches: &clap::ArgMatches,
    name: &str
) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = matches.value_of(name).ok_or_else(|| ConsensusError::InvalidParameter {
        parameter: name.to_string(),
        reason: String::from("missing value"),
    })?;
    raw.parse::<T>().map_err(|e| ConsensusError::InvalidParameter {
        parameter: name.to_string(),
        reason: format!("{:?}: {}", raw, e),
    })
}

/// either one existing file or a list of chrom:start-end strings
fn load_regions(
    matches: &clap::ArgMatches,
    header: &bam::HeaderView
) -> Result<Vec<Region>> {
    let values: Vec<&str> = matches.values_of("REGIONS").map(|v| v.collect()).unwrap_or_default();
    let specs = if values.len() == 1 && Path::new(values[0]).is_file() {
        info!("Reading regions from {}", values[0]);
        parse_region_file(values[0])?
    } else {
        values.iter()
            .map(|v| parse_region_string(v))
            .collect::<Result<Vec<RegionSpec>>>()?
    };
    if specs.is_empty() {
        return Err(ConsensusError::InvalidRegion {
            region: values.join(" "),
            reason: String::from("no regions provided"),
        });
    }
    resolve_regions(&specs, |name| header.tid(name.as_bytes()))
}

fn consensus_options(
    matches: &clap::ArgMatches
) -> Result<ConsensusOptions> {
    let mut opts = ConsensusOptions::default();
    opts.barcode_tag        = parse_tag(matches.value_of("TAG").unwrap_or("BC"))?;
    opts.barcode_trim       = parse_value::<usize>(matches, "TRIM")?;
    opts.extension          = parse_value::<u64>(matches, "EXTENSION")?;
    opts.max_mate_distance  = parse_value::<u64>(matches, "DIST")?;
    opts.min_quality        = parse_value::<u8>(matches, "MINQUAL")?;
    opts.scoring = MsaScoring {
        match_score: parse_value::<i32>(matches, "MATCH")?,
        mismatch_score: parse_value::<i32>(matches, "MISMATCH")?,
        gap_score: parse_value::<i32>(matches, "GAP")?,
    };
    if matches.is_present("KEEP") {
        opts.duplicate_policy = DuplicatePolicy::KeepFirst;
    }
    opts.validate()?;
    Ok(opts)
}

fn run_consensus_cmd(
    matches: &clap::ArgMatches,
    arg_string: &str
) -> Result<RunStats> {
    ////////////////////////
    ////  prep options  ////
    ////////////////////////
    let opts        = consensus_options(matches)?;
    let threads     = parse_value::<usize>(matches, "THREAD")?;
    let bam_file    = matches.value_of("BAM").unwrap_or_default();
    let out_file    = matches.value_of("OUT").unwrap_or_default();
    let aligner     = StarAligner::new(opts.scoring)?;
    let version     = VersionInfo {
        program: crate_name!(),
        version: crate_version!(),
        author: crate_authors!(),
        command: arg_string,
    };

    let mut source = IndexedBamSource::from_path(bam_file, threads)?;
    let regions = load_regions(matches, source.header())?;
    info!("Processing {} regions of {}", regions.len(), bam_file);

    let header = consensus_header(source.header(), &version, false);
    let mut out = bam::Writer::from_path(out_file, &header, bam::Format::Bam)?;
    if threads > 1 {
        out.set_threads(threads)?;
    }
    let mut discard_writer = match matches.value_of("DISCARD") {
        Some(path) => {
            let discard_header = consensus_header(source.header(), &version, true);
            Some(bam::Writer::from_path(path, &discard_header, bam::Format::Bam)?)
        },
        None => None,
    };
    let discards: Option<&mut dyn RecordSink> = match discard_writer.as_mut() {
        Some(writer) => Some(writer),
        None => None,
    };
    run_consensus(&mut source, &regions, &aligner, &opts, &mut out, discards)
}

fn run_subset_cmd(
    matches: &clap::ArgMatches,
    arg_string: &str
) -> Result<()> {
    let bam_file    = matches.value_of("BAM").unwrap_or_default();
    let out_file    = matches.value_of("OUT").unwrap_or_default();
    let list_file   = matches.value_of("WHITELIST").unwrap_or_default();
    let tag         = parse_tag(matches.value_of("TAG").unwrap_or("CR"))?;
    let trim        = parse_value::<usize>(matches, "TRIM")?;
    let version     = VersionInfo {
        program: crate_name!(),
        version: crate_version!(),
        author: crate_authors!(),
        command: arg_string,
    };

    let whitelist = read_whitelist(list_file)?;
    let mut reader = bam::Reader::from_path(bam_file)?;
    let header = program_header(reader.header(), &version);
    let mut out = bam::Writer::from_path(out_file, &header, bam::Format::Bam)?;
    let stats = subset_records(reader.records(), &whitelist, &tag, trim, &mut out)?;
    stats.report();
    Ok(())
}


fn main() {
    pretty_env_logger::init();

    // now the next is not really for any argument
    // parsing but simply to get the command which
    // was used to execute as I cant get this from clap
    let args: Vec<String> = env::args().collect();
    let args_string = args.join(" ");
    let matches = app_from_crate!()
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(SubCommand::with_name("consensus")
            .about("builds one consensus read pair per barcode family within target regions")
            .setting(AppSettings::AllowNegativeNumbers)
            .arg(Arg::with_name("BAM")
                .short("b")
                .long("bam")
                .value_name("FILE")
                .help("coordinate sorted and indexed paired-read alignment")
                .takes_value(true)
                .required(true))
            .arg(Arg::with_name("REGIONS")
                .short("r")
                .long("regions")
                .value_name("FILE|chrom:start-end")
                .help("target regions, either a tab separated file (chrom start end, 1-based inclusive) \
                        or one or more regions in the form chrom:start-end")
                .takes_value(true)
                .multiple(true)
                .required(true))
            .arg(Arg::with_name("OUT")
                .short("o")
                .long("output")
                .value_name("FILE")
                .help("BAM file receiving the consensus pairs")
                .takes_value(true)
                .required(true))
            .arg(Arg::with_name("DISCARD")
                .short("d")
                .long("discarded")
                .value_name("FILE")
                .help("BAM file receiving all reads not used for a consensus, the reason is given in the OR tag")
                .takes_value(true)
                .required(false))
            .arg(Arg::with_name("TAG")
                .short("t")
                .long("tag")
                .value_name("XX")
                .help("tag holding the molecular barcode")
                .takes_value(true)
                .default_value("BC"))
            .arg(Arg::with_name("TRIM")
                .long("trim")
                .value_name("int")
                .help("number of characters to remove from the end of each barcode")
                .takes_value(true)
                .default_value("0"))
            .arg(Arg::with_name("EXTENSION")
                .long("extension")
                .value_name("int")
                .help("window in bp behind each region in which reverse mates are still collected")
                .takes_value(true)
                .default_value("10000"))
            .arg(Arg::with_name("DIST")
                .long("mate-distance")
                .value_name("int")
                .help("maximum distance in bp between a forward read and its mate start")
                .takes_value(true)
                .default_value("10000"))
            .arg(Arg::with_name("MATCH")
                .long("match")
                .value_name("int")
                .help("match score of the multiple alignment")
                .takes_value(true)
                .allow_hyphen_values(true)
                .default_value("1"))
            .arg(Arg::with_name("MISMATCH")
                .long("mismatch")
                .value_name("int")
                .help("mismatch score of the multiple alignment")
                .takes_value(true)
                .allow_hyphen_values(true)
                .default_value("-1"))
            .arg(Arg::with_name("GAP")
                .long("gap")
                .value_name("int")
                .help("linear gap score of the multiple alignment")
                .takes_value(true)
                .allow_hyphen_values(true)
                .default_value("-1"))
            .arg(Arg::with_name("MINQUAL")
                .long("min-qual")
                .value_name("int")
                .help("phred quality of consensus columns without a supporting base")
                .takes_value(true)
                .default_value("0"))
            .arg(Arg::with_name("KEEP")
                .long("keep-first")
                .help("keep the first of two forward reads with the same name instead of the last one")
                .takes_value(false))
            .arg(Arg::with_name("THREAD")
                .long("threads")
                .value_name("int")
                .help("number of threads for BAM (de)compression")
                .takes_value(true)
                .default_value("1")))
        .subcommand(SubCommand::with_name("subset")
            .about("keeps records whose barcode is part of a whitelist")
            .arg(Arg::with_name("BAM")
                .short("b")
                .long("bam")
                .value_name("FILE")
                .help("alignment to subset")
                .takes_value(true)
                .required(true))
            .arg(Arg::with_name("WHITELIST")
                .short("f")
                .long("whitelist")
                .value_name("FILE")
                .help("whitelisted barcodes, separated by whitespace or new lines")
                .takes_value(true)
                .required(true))
            .arg(Arg::with_name("OUT")
                .short("o")
                .long("output")
                .value_name("FILE")
                .help("BAM file receiving the passing records")
                .takes_value(true)
                .required(true))
            .arg(Arg::with_name("TAG")
                .short("t")
                .long("tag")
                .value_name("XX")
                .help("tag holding the barcode")
                .takes_value(true)
                .default_value("CR"))
            .arg(Arg::with_name("TRIM")
                .long("trim")
                .value_name("int")
                .help("number of characters to remove from the end of each barcode")
                .takes_value(true)
                .default_value("0")))
        .get_matches();

    let outcome = if let Some(matches) = matches.subcommand_matches("consensus") {
        run_consensus_cmd(matches, &args_string).map(|stats| stats.report())
    } else if let Some(matches) = matches.subcommand_matches("subset") {
        run_subset_cmd(matches, &args_string)
    } else {
        eprintln!("Please choose one of the sub-commands, specify --help for more information");
        Ok(())
    };
    if let Err(e) = outcome {
        eprintln!("ERROR: {}", e);
        process::exit(1);
    }
}
