use std::fmt;
use std::path::Path;
use std::convert::TryFrom;
use regex::Regex;
use rust_htslib::bam;
use thiserror::Error;
use log::{debug, info};


/// extension window past a region end, used solely to complete
/// pairs whose reverse mate starts behind the region
pub const EXTENSION_WINDOW: u64 = 10_000;
/// maximum distance between a good forward read and its mate start
pub const MAX_MATE_DISTANCE: u64 = 10_000;
/// read name prefix of synthesized consensus records
pub const CONSENSUS_PREFIX: &str = "cons_";
/// number of pairs which went into a consensus pair
pub const FAMILY_SIZE_TAG: &[u8; 2] = b"XF";
/// space separated read names of the family members
pub const MEMBERS_TAG: &[u8; 2] = b"XR";
/// reason code of a discarded read
pub const DISCARD_TAG: &[u8; 2] = b"OR";
/// longest read name a BAM record can hold, without the NUL
pub const MAX_QNAME_LEN: usize = 254;

pub const FLAG_PAIRED: u16 = 0x1;
pub const FLAG_REVERSE: u16 = 0x10;
pub const FLAG_MATE_REVERSE: u16 = 0x20;
pub const FLAG_FIRST_IN_PAIR: u16 = 0x40;
pub const FLAG_SECOND_IN_PAIR: u16 = 0x80;


/// Result type alias for the consensus library
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// All failures the library reports.
/// Only `Index`, `AlignmentEngine` and the I/O wrappers are fatal for a run,
/// a `TagExtraction` is handled by downgrading the read.
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// index or referenced contig missing or unreadable
    #[error("Index error for '{target}': {reason}")]
    Index {
        target: String,
        reason: String,
    },
    /// barcode or other attribute tag absent or malformed
    #[error("Could not extract tag '{tag}' of read {read}: {reason}")]
    TagExtraction {
        read: String,
        tag: String,
        reason: String,
    },
    /// the multiple alignment could not be computed
    #[error("Alignment engine failed: {0}")]
    AlignmentEngine(String),
    /// a region line or string which can not be used
    #[error("Invalid region '{region}': {reason}")]
    InvalidRegion {
        region: String,
        reason: String,
    },
    /// option value out of range
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        parameter: String,
        reason: String,
    },
    /// barcode whitelist missing or empty
    #[error("Whitelist '{path}': {reason}")]
    Whitelist {
        path: String,
        reason: String,
    },
    #[error(transparent)]
    Hts(#[from] rust_htslib::errors::Error),
    #[error(transparent)]
    RegionFile(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}


/// Version information which ends up in the @PG line
/// of the produced BAM files
pub struct VersionInfo <'a>{
    /// the used program/sub-program
    pub program  : &'a str,
    /// the version of the program
    pub version  : &'a str,
    /// the author
    pub author : &'a str,
    /// the executed command
    pub command : &'a str,
}


/// A target interval on one reference.
/// Coordinates are 0-based and half-open, the
/// user facing notation is 1-based inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// numeric id of the reference in the BAM header
    pub tid: u32,
    /// reference name, used for reporting only
    pub name: String,
    /// 0-based, inclusive
    pub start: u64,
    /// 0-based, exclusive
    pub end: u64,
}

impl Region {
    /// converts a 1-based inclusive interval into
    /// the internal 0-based half-open one
    ///
    /// Unittest: TRUE
    ///
    pub fn from_one_based(tid: u32, name: &str, start: u64, end: u64) -> Result<Region> {
        if start == 0 {
            return Err(ConsensusError::InvalidRegion {
                region: format!("{}:{}-{}", name, start, end),
                reason: String::from("positions are 1-based, start must be >= 1"),
            });
        }
        if end < start {
            return Err(ConsensusError::InvalidRegion {
                region: format!("{}:{}-{}", name, start, end),
                reason: String::from("end lies before start"),
            });
        }
        Ok(Region {
            tid,
            name: name.to_string(),
            start: start - 1,
            end,
        })
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.end
    }

    /// exclusive end of the region plus its lookahead window
    pub fn extension_end(&self, extension: u64) -> u64 {
        self.end.saturating_add(extension)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.name, self.start + 1, self.end)
    }
}


/// A region as given by the user, reference
/// name not yet resolved, 1-based inclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

/// parses `chr:start-end` (thousands separators allowed)
///
/// Unittest: TRUE
///
pub fn parse_region_string(
    region: &str
) -> Result<RegionSpec> {
    let pattern = Regex::new(r"^([^:\s]+):([0-9,]+)-([0-9,]+)$")
        .expect("ERROR: region pattern does not compile");
    let caps = pattern.captures(region.trim()).ok_or_else(|| ConsensusError::InvalidRegion {
        region: region.to_string(),
        reason: String::from("expected chrom:start-end"),
    })?;
    let start = parse_coordinate(region, &caps[2])?;
    let end   = parse_coordinate(region, &caps[3])?;
    Ok(RegionSpec {
        name: caps[1].to_string(),
        start,
        end,
    })
}

fn parse_coordinate(region: &str, value: &str) -> Result<u64> {
    value.replace(',', "").parse::<u64>().map_err(|e| ConsensusError::InvalidRegion {
        region: region.to_string(),
        reason: format!("could not parse coordinate {:?}: {}", value, e),
    })
}

/// this function takes a tab-separated region file
/// with the columns chrom, start and end (1-based, inclusive)
/// Further columns are ignored, lines starting with '#' too.
///
/// Unittest: TRUE
///
pub fn parse_region_file(
    my_file: &str
) -> Result<Vec<RegionSpec>> {
    if !Path::new(my_file).exists() {
        return Err(ConsensusError::InvalidRegion {
            region: my_file.to_string(),
            reason: String::from("region file does not exist"),
        });
    }
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_path(my_file)?;

    let mut regions = Vec::new();
    for result in reader.records() {
        let line = result?;
        let line_nr = line.position().map(|p| p.line()).unwrap_or(0);
        if line.len() < 3 {
            return Err(ConsensusError::InvalidRegion {
                region: format!("{}:{}", my_file, line_nr),
                reason: String::from("need at least the columns chrom, start and end"),
            });
        }
        let label = format!("{}:{}", my_file, line_nr);
        regions.push(RegionSpec {
            name: line[0].to_string(),
            start: parse_coordinate(&label, &line[1])?,
            end: parse_coordinate(&label, &line[2])?,
        });
    }
    debug!("Parsed {} regions from {}", regions.len(), my_file);
    Ok(regions)
}

/// resolves region names into reference ids and converts
/// the coordinates into the internal 0-based half-open form.
/// A region on a reference unknown to the lookup is an index error.
///
/// Unittest: TRUE
///
pub fn resolve_regions<F>(
    specs: &[RegionSpec],
    lookup: F
) -> Result<Vec<Region>>
where
    F: Fn(&str) -> Option<u32>,
{
    specs.iter().map(|spec| {
        let tid = lookup(&spec.name).ok_or_else(|| ConsensusError::Index {
            target: spec.name.clone(),
            reason: String::from("reference not present in BAM header"),
        })?;
        Region::from_one_based(tid, &spec.name, spec.start, spec.end)
    }).collect()
}


/// Scoring of the linear-gap global alignments
/// used for the multiple alignment of a family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsaScoring {
    pub match_score: i32,
    pub mismatch_score: i32,
    pub gap_score: i32,
}

impl Default for MsaScoring {
    fn default() -> Self {
        MsaScoring {
            match_score: 1,
            mismatch_score: -1,
            gap_score: -1,
        }
    }
}

impl MsaScoring {
    /// the aligner expects rewards >= 0 and penalties <= 0
    pub fn validate(&self) -> Result<()> {
        if self.match_score < 0 {
            return Err(invalid("match", "must be >= 0"));
        }
        if self.mismatch_score > 0 {
            return Err(invalid("mismatch", "must be <= 0"));
        }
        if self.gap_score > 0 {
            return Err(invalid("gap", "must be <= 0"));
        }
        Ok(())
    }
}

fn invalid(parameter: &str, reason: &str) -> ConsensusError {
    ConsensusError::InvalidParameter {
        parameter: parameter.to_string(),
        reason: reason.to_string(),
    }
}

/// What happens if a second good forward read with an already
/// pending read name shows up. The displaced read is reported
/// as orphan forward in both cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// the later read replaces the pending one
    Overwrite,
    /// the pending read stays, the later one is discarded
    KeepFirst,
}

/// Options of a consensus run
#[derive(Debug, Clone)]
pub struct ConsensusOptions {
    /// tag holding the molecular barcode
    pub barcode_tag: [u8; 2],
    /// number of trailing barcode characters to ignore
    pub barcode_trim: usize,
    /// lookahead past the region end
    pub extension: u64,
    /// maximum distance of a good forward read to its mate
    pub max_mate_distance: u64,
    pub duplicate_policy: DuplicatePolicy,
    pub scoring: MsaScoring,
    /// consensus quality of a column without supporting member
    pub min_quality: u8,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        ConsensusOptions {
            barcode_tag: *b"BC",
            barcode_trim: 0,
            extension: EXTENSION_WINDOW,
            max_mate_distance: MAX_MATE_DISTANCE,
            duplicate_policy: DuplicatePolicy::Overwrite,
            scoring: MsaScoring::default(),
            min_quality: 0,
        }
    }
}

impl ConsensusOptions {
    /// the barcode tag must not clash with the tags written
    /// onto consensus and discarded records
    ///
    /// Unittest: TRUE
    ///
    pub fn validate(&self) -> Result<()> {
        let reserved = [FAMILY_SIZE_TAG, MEMBERS_TAG, DISCARD_TAG];
        if reserved.iter().any(|t| **t == self.barcode_tag) {
            return Err(invalid(
                "tag",
                &format!("{} is reserved for the output records", String::from_utf8_lossy(&self.barcode_tag)),
            ));
        }
        self.scoring.validate()
    }
}

/// checks that a user given tag is a valid two character SAM tag
///
/// Unittest: TRUE
///
pub fn parse_tag(
    tag: &str
) -> Result<[u8; 2]> {
    let bytes = tag.as_bytes();
    if bytes.len() != 2 || !bytes[0].is_ascii_alphabetic() || !bytes[1].is_ascii_alphanumeric() {
        return Err(invalid("tag", &format!("{:?} is not a valid SAM tag", tag)));
    }
    Ok([bytes[0], bytes[1]])
}


/// Class of a single record. Every record falls into exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadClass {
    GoodForward,
    GoodReverse,
    Other,
}

/// Why a record did not contribute to a consensus.
/// The numeric codes end up in the OR tag of the discard BAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// good reverse read, no forward read pending
    OrphanReverse,
    /// neither a good forward nor a good reverse read
    UnclassifiedInRegion,
    /// good reverse read in the extension window, no forward read pending
    OrphanReverseInExtension,
    /// good forward read whose reverse mate never showed up
    OrphanForward,
}

impl DiscardReason {
    pub const ALL: [DiscardReason; 4] = [
        DiscardReason::OrphanReverse,
        DiscardReason::UnclassifiedInRegion,
        DiscardReason::OrphanReverseInExtension,
        DiscardReason::OrphanForward,
    ];

    pub fn code(self) -> i32 {
        match self {
            DiscardReason::OrphanReverse            => 0,
            DiscardReason::UnclassifiedInRegion     => 1,
            DiscardReason::OrphanReverseInExtension => 2,
            DiscardReason::OrphanForward            => 3,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            DiscardReason::OrphanReverse            => "Good reverse read, no good forward read found",
            DiscardReason::UnclassifiedInRegion     => "Not a good reverse read, nor a good forward",
            DiscardReason::OrphanReverseInExtension => "Good reverse read in region+10K, no good forward read found in region",
            DiscardReason::OrphanForward            => "Good forward read, no good reverse read found",
        }
    }

    /// header comment explaining the OR codes
    pub fn legend() -> String {
        let codes: Vec<String> = DiscardReason::ALL.iter()
            .map(|r| format!("{}: {}", r.code(), r.description()))
            .collect();
        format!("OR: Reasons for discarded reads, {}.", codes.join("; "))
    }

    fn index(self) -> usize {
        self.code() as usize
    }
}

/// How a region ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOutcome {
    Processed,
    /// the index has no data overlapping the region
    EmptyRegion,
    /// data around, but no record starting inside the region
    NotFound,
}


/// Counters of one region+extension pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionStats {
    pub region: String,
    pub outcome: RegionOutcome,
    /// records looked at after locating the region
    pub records: u64,
    pub good_forward: u64,
    pub good_reverse: u64,
    pub matched_pairs: u64,
    pub families: u64,
    pub consensus_pairs: u64,
    /// forwards pushed out of the pairing map by a read with the same name
    pub displaced_forward: u64,
    /// indexed by the discard code
    pub discarded: [u64; 4],
}

impl RegionStats {
    pub fn new(region: &Region) -> Self {
        RegionStats {
            region: region.to_string(),
            outcome: RegionOutcome::Processed,
            records: 0,
            good_forward: 0,
            good_reverse: 0,
            matched_pairs: 0,
            families: 0,
            consensus_pairs: 0,
            displaced_forward: 0,
            discarded: [0; 4],
        }
    }

    pub fn record_discard(&mut self, reason: DiscardReason) {
        self.discarded[reason.index()] += 1;
    }

    pub fn discarded_for(&self, reason: DiscardReason) -> u64 {
        self.discarded[reason.index()]
    }

    pub fn report(&self) {
        info!(
            "region {} ({:?}): {} records, {} good forward, {} good reverse, {} pairs, {} families, {} consensus pairs, discarded OR0={} OR1={} OR2={} OR3={}",
            self.region,
            self.outcome,
            self.records,
            self.good_forward,
            self.good_reverse,
            self.matched_pairs,
            self.families,
            self.consensus_pairs,
            self.discarded[0],
            self.discarded[1],
            self.discarded[2],
            self.discarded[3],
        );
    }
}

/// Counters of a complete run, one entry per region in input order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub regions: Vec<RegionStats>,
}

impl RunStats {
    pub fn consensus_pairs(&self) -> u64 {
        self.regions.iter().map(|r| r.consensus_pairs).sum()
    }

    pub fn families(&self) -> u64 {
        self.regions.iter().map(|r| r.families).sum()
    }

    pub fn discarded_for(&self, reason: DiscardReason) -> u64 {
        self.regions.iter().map(|r| r.discarded_for(reason)).sum()
    }

    pub fn skipped_regions(&self) -> usize {
        self.regions.iter().filter(|r| r.outcome != RegionOutcome::Processed).count()
    }

    pub fn report(&self) {
        info!("SUMMARY");
        info!("Regions:\t\t{} ({} without data)", self.regions.len(), self.skipped_regions());
        info!("Families:\t\t{}", self.families());
        info!("Consensus pairs:\t{}", self.consensus_pairs());
        for reason in DiscardReason::ALL.iter() {
            info!("Discarded OR{}:\t\t{}", reason.code(), self.discarded_for(*reason));
        }
    }
}


/// read name of a record as owned string
pub fn read_name(
    record: &bam::Record
) -> String {
    String::from_utf8_lossy(record.qname()).into_owned()
}

/// 0-based start as unsigned coordinate, unplaced records map to 0
pub fn record_start(
    record: &bam::Record
) -> u64 {
    u64::try_from(record.pos()).unwrap_or(0)
}


#[cfg(test)]
mod tests {
    // Note this useful idiom: importing names from outer (for mod tests) scope.
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /////////////////////////////////////////
    ///       REGIONS            ////////////
    /////////////////////////////////////////
    #[test]
    fn region_one_based_conversion(){
        let region = Region::from_one_based(0, "chr1", 101, 200).unwrap();
        assert_eq!(region.start, 100);
        assert_eq!(region.end, 200);
        assert!(region.contains(100));
        assert!(region.contains(199));
        assert!(!region.contains(200));
        assert_eq!(region.to_string(), "chr1:101-200");
        assert_eq!(region.extension_end(EXTENSION_WINDOW), 10_200);
    }
    #[test]
    fn region_single_base(){
        let region = Region::from_one_based(3, "chrX", 7, 7).unwrap();
        assert_eq!((region.start, region.end), (6, 7));
    }
    #[test]
    fn region_invalid(){
        assert!(matches!(
            Region::from_one_based(0, "chr1", 0, 10),
            Err(ConsensusError::InvalidRegion{..})
        ));
        assert!(matches!(
            Region::from_one_based(0, "chr1", 20, 10),
            Err(ConsensusError::InvalidRegion{..})
        ));
    }
    #[test]
    fn region_string(){
        let spec = parse_region_string("chr7:1,000-2,500").unwrap();
        assert_eq!(spec, RegionSpec{ name: String::from("chr7"), start: 1000, end: 2500 });
        assert!(parse_region_string("chr7").is_err());
        assert!(parse_region_string("chr7:a-b").is_err());
    }
    #[test]
    fn region_file(){
        let tmp  = NamedTempFile::new().unwrap();
        let path = tmp.path();
        let mut file =  File::create(path).expect("ERROR:could not create  file!");
        file.write_all(b"# targets\nchr1\t101\t200\tamplicon_1\nchr2\t5\t50\n").expect("ERROR:could not write region file!");
        let result = parse_region_file(path.to_str().unwrap()).unwrap();
        assert_eq!(result, vec![
            RegionSpec{ name: String::from("chr1"), start: 101, end: 200 },
            RegionSpec{ name: String::from("chr2"), start: 5, end: 50 },
        ]);
    }
    #[test]
    fn region_file_short_line(){
        let tmp  = NamedTempFile::new().unwrap();
        let path = tmp.path();
        let mut file =  File::create(path).expect("ERROR:could not create  file!");
        file.write_all(b"chr1\t101\n").expect("ERROR:could not write region file!");
        assert!(matches!(
            parse_region_file(path.to_str().unwrap()),
            Err(ConsensusError::InvalidRegion{..})
        ));
    }
    #[test]
    fn region_file_missing(){
        assert!(parse_region_file("does/not/exist.tsv").is_err());
    }
    #[test]
    fn resolve_known_and_unknown(){
        let specs = vec![
            RegionSpec{ name: String::from("chr2"), start: 11, end: 20 },
        ];
        let lookup = |name: &str| if name == "chr2" { Some(1) } else { None };
        let regions = resolve_regions(&specs, lookup).unwrap();
        assert_eq!(regions[0], Region{ tid: 1, name: String::from("chr2"), start: 10, end: 20 });

        let missing = vec![RegionSpec{ name: String::from("chrUn"), start: 1, end: 2 }];
        assert!(matches!(
            resolve_regions(&missing, lookup),
            Err(ConsensusError::Index{..})
        ));
    }

    /////////////////////////////////////////
    ///       OPTIONS            ////////////
    /////////////////////////////////////////
    #[test]
    fn tag_parsing(){
        assert_eq!(parse_tag("BC").unwrap(), *b"BC");
        assert_eq!(parse_tag("X1").unwrap(), *b"X1");
        assert!(parse_tag("B").is_err());
        assert!(parse_tag("1B").is_err());
        assert!(parse_tag("BCD").is_err());
    }
    #[test]
    fn options_reject_output_tags(){
        assert!(ConsensusOptions::default().validate().is_ok());
        for tag in ["XF", "XR", "OR"].iter() {
            let mut opts = ConsensusOptions::default();
            opts.barcode_tag = parse_tag(tag).unwrap();
            assert!(matches!(opts.validate(), Err(ConsensusError::InvalidParameter{..})));
        }
        let mut opts = ConsensusOptions::default();
        opts.scoring.gap_score = 2;
        assert!(opts.validate().is_err());
    }
    #[test]
    fn scoring_validation(){
        assert!(MsaScoring::default().validate().is_ok());
        let bad = MsaScoring{ match_score: 1, mismatch_score: 2, gap_score: -1 };
        let msg = format!("{}", bad.validate().unwrap_err());
        assert!(msg.contains("mismatch"));
        let bad_gap = MsaScoring{ match_score: 1, mismatch_score: -1, gap_score: 3 };
        assert!(bad_gap.validate().is_err());
    }

    /////////////////////////////////////////
    ///       DISCARDS / STATS   ////////////
    /////////////////////////////////////////
    #[test]
    fn discard_codes(){
        let codes: Vec<i32> = DiscardReason::ALL.iter().map(|r| r.code()).collect();
        assert_eq!(codes, vec![0,1,2,3]);
        let legend = DiscardReason::legend();
        assert!(legend.starts_with("OR: "));
        assert!(legend.contains("3: Good forward read, no good reverse read found"));
    }
    #[test]
    fn stats_accumulate(){
        let region = Region::from_one_based(0, "chr1", 1, 100).unwrap();
        let mut stats = RegionStats::new(&region);
        stats.record_discard(DiscardReason::OrphanForward);
        stats.record_discard(DiscardReason::OrphanForward);
        stats.record_discard(DiscardReason::OrphanReverse);
        stats.consensus_pairs = 4;
        assert_eq!(stats.discarded_for(DiscardReason::OrphanForward), 2);
        let mut empty = RegionStats::new(&region);
        empty.outcome = RegionOutcome::EmptyRegion;
        let run = RunStats{ regions: vec![stats, empty] };
        assert_eq!(run.consensus_pairs(), 4);
        assert_eq!(run.discarded_for(DiscardReason::OrphanReverse), 1);
        assert_eq!(run.skipped_regions(), 1);
    }
    #[test]
    fn error_messages(){
        let error = ConsensusError::TagExtraction{
            read: String::from("read1"),
            tag: String::from("BC"),
            reason: String::from("tag missing"),
        };
        let msg = format!("{}", error);
        assert!(msg.contains("'BC'"));
        assert!(msg.contains("read1"));
    }
}
