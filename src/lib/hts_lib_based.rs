use std::convert::TryFrom;
use rust_htslib::{bam, bam::Read};
use rust_htslib::bam::record::{Aux, Cigar, CigarString};
use rustc_hash::FxHashMap;
use itertools::Itertools;
use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::lib::common::{*};
use crate::lib::consensus::{*};


/// An ordered source of alignment records which can be positioned
/// onto an interval, e.g. a coordinate sorted and indexed BAM file.
pub trait RecordSource {
    /// positions the source onto the first records overlapping
    /// `[start, end)` of reference `tid`. Returns false if there are none.
    fn seek(&mut self, tid: u32, start: u64, end: u64) -> Result<bool>;
    /// reads the next record into `record`, `None` at the end of the stream
    fn read_next(&mut self, record: &mut bam::Record) -> Option<Result<()>>;
}

/// Append-only destination of records
pub trait RecordSink {
    fn write_record(&mut self, record: &bam::Record) -> Result<()>;
}

impl RecordSink for bam::Writer {
    fn write_record(&mut self, record: &bam::Record) -> Result<()> {
        self.write(record)?;
        Ok(())
    }
}

impl RecordSink for Vec<bam::Record> {
    fn write_record(&mut self, record: &bam::Record) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}


/// Indexed BAM file as record source.
/// A seek fetches the window and peeks one record to tell
/// whether the index had any data for it.
pub struct IndexedBamSource {
    reader: bam::IndexedReader,
    path: String,
    peeked: Option<bam::Record>,
}

impl IndexedBamSource {
    /// opens the BAM and its index, a missing index is fatal
    ///
    /// Unittest: TRUE
    ///
    pub fn from_path(path: &str, threads: usize) -> Result<IndexedBamSource> {
        let mut reader = bam::IndexedReader::from_path(path).map_err(|e| ConsensusError::Index {
            target: path.to_string(),
            reason: e.to_string(),
        })?;
        if threads > 1 {
            reader.set_threads(threads)?;
        }
        Ok(IndexedBamSource {
            reader,
            path: path.to_string(),
            peeked: None,
        })
    }

    pub fn header(&self) -> &bam::HeaderView {
        self.reader.header()
    }
}

impl RecordSource for IndexedBamSource {
    fn seek(&mut self, tid: u32, start: u64, end: u64) -> Result<bool> {
        self.peeked = None;
        debug!("Fetching tid {} [{}, {}) from {}", tid, start, end, self.path);
        self.reader
            .fetch(bam::FetchDefinition::Region(tid as i32, start as i64, end as i64))
            .map_err(|e| ConsensusError::Index {
                target: format!("{} (tid {})", self.path, tid),
                reason: e.to_string(),
            })?;
        let mut first = bam::Record::new();
        match self.reader.read(&mut first) {
            Some(Ok(())) => {
                self.peeked = Some(first);
                Ok(true)
            },
            Some(Err(e)) => Err(e.into()),
            None => Ok(false),
        }
    }

    fn read_next(&mut self, record: &mut bam::Record) -> Option<Result<()>> {
        if let Some(first) = self.peeked.take() {
            *record = first;
            return Some(Ok(()));
        }
        self.reader.read(record).map(|r| r.map_err(ConsensusError::from))
    }
}


/// Coordinate sorted records held in memory.
/// A seek jumps to the first record overlapping the window and
/// reading then continues through everything behind it, like a
/// file cursor would.
#[derive(Debug, Default)]
pub struct MemorySource {
    records: Vec<bam::Record>,
    cursor: usize,
}

impl MemorySource {
    pub fn new(records: Vec<bam::Record>) -> Self {
        MemorySource { records, cursor: 0 }
    }
}

impl RecordSource for MemorySource {
    fn seek(&mut self, tid: u32, start: u64, end: u64) -> Result<bool> {
        let hit = self.records.iter().position(|r| {
            r.tid() == tid as i32
                && record_start(r) < end
                && (r.cigar().end_pos().max(r.pos() + 1)) as u64 > start
        });
        match hit {
            Some(idx) => {
                self.cursor = idx;
                Ok(true)
            },
            None => {
                self.cursor = self.records.len();
                Ok(false)
            },
        }
    }

    fn read_next(&mut self, record: &mut bam::Record) -> Option<Result<()>> {
        let next = self.records.get(self.cursor)?;
        *record = next.clone();
        self.cursor += 1;
        Some(Ok(()))
    }
}


/// Extracts the barcode from a string tag and removes
/// `trim` trailing characters from it
///
/// Unittest: TRUE
///
pub fn extract_barcode(
    record: &bam::Record,
    tag: &[u8],
    trim: usize
) -> Result<String> {
    let tag_name = String::from_utf8_lossy(tag).into_owned();
    let failure = |reason: String| ConsensusError::TagExtraction {
        read: read_name(record),
        tag: tag_name.clone(),
        reason,
    };
    match record.aux(tag) {
        Ok(Aux::String(value)) => {
            if value.len() < trim {
                return Err(failure(format!("barcode {:?} shorter than the {} trimmed characters", value, trim)));
            }
            value.get(..value.len() - trim)
                .map(|b| b.to_string())
                .ok_or_else(|| failure(format!("barcode {:?} is not plain ASCII", value)))
        },
        Ok(_) => Err(failure(String::from("tag is not a string"))),
        Err(_) => Err(failure(String::from("tag missing"))),
    }
}

/// this checks if the record is the first read of a properly
/// oriented pair we can use: forward strand with the mate on the
/// reverse strand, primary, passing QC, no duplicate and the mate
/// starting at most `max_mate_distance` downstream
///
/// Unittest: TRUE
///
pub fn is_good_forward(
    record: &bam::Record,
    max_mate_distance: u64
) -> bool {
    let mate_distance = record.mpos() - record.pos();
    record.is_paired()
        && record.is_mate_reverse()
        && record.is_first_in_template()
        && !record.is_reverse()
        && !record.is_secondary()
        && !record.is_quality_check_failed()
        && !record.is_duplicate()
        && !record.is_supplementary()
        && mate_distance >= 0
        && (mate_distance as u64) <= max_mate_distance
}

/// the counterpart of a good forward read. There is
/// intentionally no mate distance check on this side.
///
/// Unittest: TRUE
///
pub fn is_good_reverse(
    record: &bam::Record
) -> bool {
    record.is_paired()
        && record.is_reverse()
        && record.is_last_in_template()
        && !record.is_secondary()
        && !record.is_quality_check_failed()
        && !record.is_supplementary()
}

/// class by flags and mate position only
pub fn flag_class(
    record: &bam::Record,
    max_mate_distance: u64
) -> ReadClass {
    if is_good_forward(record, max_mate_distance) {
        ReadClass::GoodForward
    } else if is_good_reverse(record) {
        ReadClass::GoodReverse
    } else {
        ReadClass::Other
    }
}

/// Result of classifying a record, a good forward
/// read carries its barcode along
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Forward { barcode: String },
    Reverse,
    Other,
}

impl Classified {
    pub fn class(&self) -> ReadClass {
        match self {
            Classified::Forward { .. } => ReadClass::GoodForward,
            Classified::Reverse        => ReadClass::GoodReverse,
            Classified::Other          => ReadClass::Other,
        }
    }
}

/// classifies a record. A read which is good by its flags but
/// has no usable barcode is downgraded to `Other`.
///
/// Unittest: TRUE
///
pub fn classify_record(
    record: &bam::Record,
    opts: &ConsensusOptions
) -> Classified {
    let class = flag_class(record, opts.max_mate_distance);
    if class == ReadClass::Other {
        return Classified::Other;
    }
    match extract_barcode(record, &opts.barcode_tag, opts.barcode_trim) {
        Ok(barcode) => match class {
            ReadClass::GoodForward => Classified::Forward { barcode },
            _ => Classified::Reverse,
        },
        Err(e) => {
            warn!("{}; read treated as neither good forward nor reverse", e);
            Classified::Other
        },
    }
}


/// Where the locator ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Located {
    /// the record buffer holds the first record starting inside the region
    Found,
    /// nothing overlaps the region itself, the extension is not considered
    EmptyRegion,
    /// records overlap the region but none starts inside it
    NotFound,
}

/// Checks the region for data, then seeks the source onto the region
/// plus the `window_end` lookahead and skips records starting before the region.
///
/// Unittest: TRUE
///
pub fn locate_region<S: RecordSource>(
    source: &mut S,
    region: &Region,
    window_end: u64,
    record: &mut bam::Record
) -> Result<Located> {
    if !source.seek(region.tid, region.start, region.end)? {
        return Ok(Located::EmptyRegion);
    }
    source.seek(region.tid, region.start, window_end)?;
    while let Some(result) = source.read_next(record) {
        result?;
        if record.tid() != region.tid as i32 {
            return Ok(Located::NotFound);
        }
        if record.pos() < region.start as i64 {
            continue;
        }
        if record_start(record) >= region.end {
            return Ok(Located::NotFound);
        }
        return Ok(Located::Found);
    }
    Ok(Located::NotFound)
}


/// A forward read waiting for its mate
#[derive(Debug, Clone)]
pub struct PendingForward {
    pub record: bam::Record,
    pub barcode: String,
    /// position in the region's record stream
    pub seq_no: u64,
}

/// Pending forward reads of one region+extension pass, by read name
#[derive(Debug, Default)]
pub struct PairingMap {
    pending: FxHashMap<Vec<u8>, PendingForward>,
}

impl PairingMap {
    pub fn new() -> Self {
        PairingMap { pending: FxHashMap::default() }
    }

    /// adds a forward read. If the name is already pending the
    /// policy decides which one stays, the other one is returned.
    pub fn insert(&mut self, forward: PendingForward, policy: DuplicatePolicy) -> Option<PendingForward> {
        let name = forward.record.qname().to_vec();
        match policy {
            DuplicatePolicy::Overwrite => self.pending.insert(name, forward),
            DuplicatePolicy::KeepFirst => {
                if self.pending.contains_key(&name) {
                    Some(forward)
                } else {
                    self.pending.insert(name, forward);
                    None
                }
            },
        }
    }

    pub fn take(&mut self, name: &[u8]) -> Option<PendingForward> {
        self.pending.remove(name)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// empties the map, the left-overs come back in input order
    pub fn drain_in_input_order(&mut self) -> Vec<PendingForward> {
        self.pending
            .drain()
            .map(|(_, forward)| forward)
            .sorted_by_key(|forward| forward.seq_no)
            .collect()
    }
}

/// A record which did not end up in any pair
#[derive(Debug, Clone)]
pub struct Discard {
    pub seq_no: u64,
    pub reason: DiscardReason,
    pub record: bam::Record,
}

/// Outcome of one region+extension pass
#[derive(Debug)]
pub struct RegionScan {
    pub outcome: RegionOutcome,
    pub pairs: Vec<CompletedPair>,
    /// in input order
    pub discards: Vec<Discard>,
}

impl RegionScan {
    fn new(outcome: RegionOutcome) -> Self {
        RegionScan {
            outcome,
            pairs: Vec::new(),
            discards: Vec::new(),
        }
    }

    fn discard(&mut self, stats: &mut RegionStats, region: &Region, seq_no: u64, reason: DiscardReason, record: bam::Record) {
        debug!("Discarding {} in region {} (OR:{})", read_name(&record), region, reason.code());
        stats.record_discard(reason);
        self.discards.push(Discard { seq_no, reason, record });
    }
}

/// Phases of a region scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    InRegion,
    InExtension,
    Done,
}

/// phase for the record at hand; phases only ever move forward
fn next_phase(
    phase: ScanPhase,
    record: &bam::Record,
    region: &Region,
    window_end: u64
) -> ScanPhase {
    if phase == ScanPhase::Done || record.tid() != region.tid as i32 {
        return ScanPhase::Done;
    }
    let pos = record_start(record);
    if pos >= window_end {
        ScanPhase::Done
    } else if phase == ScanPhase::InRegion && pos < region.end {
        ScanPhase::InRegion
    } else {
        ScanPhase::InExtension
    }
}

/// Streams the records of one region and its extension window,
/// pairs good forward with good reverse reads by name and collects
/// everything else as discards. `pending` is empty again afterwards.
///
/// Unittest: TRUE
///
pub fn scan_region<S: RecordSource>(
    source: &mut S,
    region: &Region,
    opts: &ConsensusOptions,
    pending: &mut PairingMap,
    stats: &mut RegionStats
) -> Result<RegionScan> {
    pending.clear();
    let window_end = region.extension_end(opts.extension);
    let mut record = bam::Record::new();

    match locate_region(source, region, window_end, &mut record)? {
        Located::Found => (),
        Located::EmptyRegion => {
            info!("region {}: no data in index, skipped", region);
            stats.outcome = RegionOutcome::EmptyRegion;
            return Ok(RegionScan::new(RegionOutcome::EmptyRegion));
        },
        Located::NotFound => {
            info!("region {}: no record starting inside, skipped", region);
            stats.outcome = RegionOutcome::NotFound;
            return Ok(RegionScan::new(RegionOutcome::NotFound));
        },
    }

    let mut scan = RegionScan::new(RegionOutcome::Processed);
    let mut phase = ScanPhase::InRegion;
    let mut seq_no: u64 = 0;
    loop {
        phase = next_phase(phase, &record, region, window_end);
        if phase == ScanPhase::Done {
            break;
        }
        stats.records += 1;
        match (phase, classify_record(&record, opts)) {
            (ScanPhase::InRegion, Classified::Forward { barcode }) => {
                stats.good_forward += 1;
                let forward = PendingForward {
                    record: record.clone(),
                    barcode,
                    seq_no,
                };
                if let Some(displaced) = pending.insert(forward, opts.duplicate_policy) {
                    stats.displaced_forward += 1;
                    warn!("duplicate forward read {} in region {}", read_name(&displaced.record), region);
                    scan.discard(stats, region, displaced.seq_no, DiscardReason::OrphanForward, displaced.record);
                }
            },
            (_, Classified::Reverse) => {
                stats.good_reverse += 1;
                match pending.take(record.qname()) {
                    Some(forward) => {
                        stats.matched_pairs += 1;
                        scan.pairs.push(CompletedPair {
                            forward: forward.record,
                            reverse: record.clone(),
                            barcode: forward.barcode,
                        });
                    },
                    None => {
                        let reason = if phase == ScanPhase::InRegion {
                            DiscardReason::OrphanReverse
                        } else {
                            DiscardReason::OrphanReverseInExtension
                        };
                        scan.discard(stats, region, seq_no, reason, record.clone());
                    },
                }
            },
            (ScanPhase::InRegion, Classified::Other) => {
                scan.discard(stats, region, seq_no, DiscardReason::UnclassifiedInRegion, record.clone());
            },
            // only reverse reads matter in the extension window
            _ => (),
        }
        seq_no += 1;
        match source.read_next(&mut record) {
            Some(result) => result?,
            None => break,
        }
    }

    for forward in pending.drain_in_input_order() {
        scan.discard(stats, region, forward.seq_no, DiscardReason::OrphanForward, forward.record);
    }
    scan.discards.sort_by_key(|d| d.seq_no);
    Ok(scan)
}


/// pushes barcode, family size and member names onto a consensus record
fn push_family_tags(
    record: &mut bam::Record,
    result: &ConsensusResult,
    barcode_tag: &[u8]
) -> Result<()> {
    let size = i32::try_from(result.size()).unwrap_or(i32::MAX);
    let members = result.members.iter().join(" ");
    record.push_aux(barcode_tag, Aux::String(&result.barcode))?;
    record.push_aux(FAMILY_SIZE_TAG, Aux::I32(size))?;
    record.push_aux(MEMBERS_TAG, Aux::String(&members))?;
    Ok(())
}

/// smallest bin of the BAI binning scheme containing `[beg, end)`
///
/// Unittest: TRUE
///
pub fn reg2bin(
    beg: i64,
    end: i64
) -> u16 {
    let last = (end - 1).max(beg);
    // (shift, first bin of that level)
    let levels: [(u32, i64); 5] = [(14, 4681), (17, 585), (20, 73), (23, 9), (26, 1)];
    for (shift, offset) in levels.iter() {
        if beg >> shift == last >> shift {
            return (offset + (beg >> shift)) as u16;
        }
    }
    0
}

/// consensus read name, cut at the BAM read name limit
fn consensus_name(
    first_member: &str
) -> Vec<u8> {
    let mut name = format!("{}{}", CONSENSUS_PREFIX, first_member).into_bytes();
    if name.len() > MAX_QNAME_LEN {
        warn!("consensus name of {} cut to {} characters", first_member, MAX_QNAME_LEN);
        name.truncate(MAX_QNAME_LEN);
    }
    name
}

fn fabricate(
    name: &[u8],
    read: &ConsensusRead,
    tid: i32,
    pos: i64,
    mapq: u8,
    flags: u16,
    mate_pos: i64,
    insert_size: i64
) -> bam::Record {
    let mut record = bam::Record::new();
    let cigar = if read.is_empty() {
        None
    } else {
        Some(CigarString(vec![Cigar::Match(read.len() as u32)]))
    };
    record.set(name, cigar.as_ref(), &read.seq, &read.qual);
    record.set_tid(tid);
    record.set_pos(pos);
    record.set_bin(reg2bin(pos, pos + (read.len() as i64).max(1)));
    record.set_mapq(mapq);
    record.set_flags(flags);
    record.set_mtid(tid);
    record.set_mpos(mate_pos);
    record.set_insert_size(insert_size);
    record
}

/// Fabricates the forward and reverse record of a family consensus.
/// The template length runs from the forward start to the end of
/// the reverse consensus (+1), negated on the reverse record.
///
/// Unittest: TRUE
///
pub fn synthesize_pair(
    result: &ConsensusResult,
    opts: &ConsensusOptions
) -> Result<(bam::Record, bam::Record)> {
    let first = result.members.first().ok_or_else(|| {
        ConsensusError::AlignmentEngine(String::from("consensus without members"))
    })?;
    let name = consensus_name(first);
    let template_len = result.reverse_start + result.reverse.len() as i64 - result.forward_start + 1;

    let mut forward = fabricate(
        &name,
        &result.forward,
        result.tid,
        result.forward_start,
        result.forward_mapq,
        FLAG_PAIRED | FLAG_MATE_REVERSE | FLAG_FIRST_IN_PAIR,
        result.reverse_start,
        template_len,
    );
    push_family_tags(&mut forward, result, &opts.barcode_tag)?;

    let mut reverse = fabricate(
        &name,
        &result.reverse,
        result.tid,
        result.reverse_start,
        result.reverse_mapq,
        FLAG_PAIRED | FLAG_REVERSE | FLAG_SECOND_IN_PAIR,
        result.forward_start,
        -template_len,
    );
    push_family_tags(&mut reverse, result, &opts.barcode_tag)?;
    Ok((forward, reverse))
}

/// copy of a discarded record carrying its OR reason code
///
/// Unittest: TRUE
///
pub fn annotate_discard(
    discard: &Discard
) -> Result<bam::Record> {
    let mut record = discard.record.clone();
    // an existing OR tag from an earlier run is replaced
    record.remove_aux(DISCARD_TAG).ok();
    record.push_aux(DISCARD_TAG, Aux::I32(discard.reason.code()))?;
    Ok(record)
}


/// replaces the SO field of the @HD line, a missing @HD line is added
///
/// Unittest: TRUE
///
pub fn set_sort_order(
    text: &str,
    sort_order: &str
) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut has_hd = false;
    for line in text.lines() {
        let line = line.trim_end_matches('\0');
        if line.is_empty() {
            continue;
        }
        if line.starts_with("@HD") {
            has_hd = true;
            let so = format!("SO:{}", sort_order);
            let mut fields: Vec<&str> = line.split('\t').filter(|f| !f.starts_with("SO:")).collect();
            fields.push(&so);
            lines.push(fields.join("\t"));
        } else {
            lines.push(line.to_string());
        }
    }
    if !has_hd {
        lines.insert(0, format!("@HD\tVN:1.6\tSO:{}", sort_order));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Copies the input header and adds our @PG line plus a creation note
///
/// Unittest: TRUE
///
pub fn program_header(
    template: &bam::HeaderView,
    version: &VersionInfo
) -> bam::Header {
    let mut header = bam::Header::from_template(template);
    let mut program = bam::header::HeaderRecord::new(b"PG");
    program.push_tag(b"ID", &version.program);
    program.push_tag(b"PN", &version.program);
    program.push_tag(b"VN", &version.version);
    program.push_tag(b"CL", &version.command);
    header.push_record(&program);
    let now: DateTime<Local> = Local::now();
    let created = format!("{} {} created {}", version.program, version.version, now.to_rfc2822());
    header.push_comment(created.as_bytes());
    header
}

/// Header of the consensus outputs. Pairs are written family by family,
/// so the sort order becomes `unsorted`. The discard stream additionally
/// explains the OR codes in a @CO line.
///
/// Unittest: TRUE
///
pub fn consensus_header(
    template: &bam::HeaderView,
    version: &VersionInfo,
    discard_legend: bool
) -> bam::Header {
    let text = set_sort_order(&String::from_utf8_lossy(template.as_bytes()), "unsorted");
    let view = bam::HeaderView::from_bytes(text.as_bytes());
    let mut header = program_header(&view, version);
    if discard_legend {
        header.push_comment(DiscardReason::legend().as_bytes());
    }
    header
}


/// Runs the whole pipeline region by region in input order: locate, pair,
/// group, build the consensus and write two records per family. Discards
/// go to the optional second sink, tagged with their reason code.
///
/// Unittest: TRUE
///
pub fn run_consensus<S, A>(
    source: &mut S,
    regions: &[Region],
    aligner: &A,
    opts: &ConsensusOptions,
    out: &mut dyn RecordSink,
    mut discarded: Option<&mut dyn RecordSink>
) -> Result<RunStats>
where
    S: RecordSource,
    A: MultipleAligner,
{
    opts.validate()?;
    let mut pending = PairingMap::new();
    let mut run = RunStats::default();
    for region in regions {
        let mut stats = RegionStats::new(region);
        let scan = scan_region(source, region, opts, &mut pending, &mut stats)?;
        let families = group_families(scan.pairs);
        stats.families = families.len() as u64;
        for family in families.iter() {
            let result = build_consensus(family, aligner, opts.min_quality)?;
            let (forward, reverse) = synthesize_pair(&result, opts)?;
            out.write_record(&forward)?;
            out.write_record(&reverse)?;
            stats.consensus_pairs += 1;
        }
        if let Some(sink) = discarded.as_mut() {
            for discard in scan.discards.iter() {
                sink.write_record(&annotate_discard(discard)?)?;
            }
        }
        stats.report();
        run.regions.push(stats);
    }
    Ok(run)
}
