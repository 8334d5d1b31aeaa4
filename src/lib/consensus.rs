//! Families and their consensus.
//!
//! Completed pairs of one region are sorted by forward start and barcode,
//! split into families and each family is collapsed into one consensus read
//! per orientation. The multiple alignment is hidden behind the
//! [`MultipleAligner`] trait, the default [`StarAligner`] builds it from
//! linear-gap global pairwise alignments against a center sequence.

use bio::alignment::pairwise::{self, MatchParams};
use bio::alignment::{Alignment, AlignmentOperation};
use rust_htslib::bam;
use log::debug;

use crate::lib::common::{*};


/// gap symbol of the gapped alignment rows
pub const GAP: u8 = b'-';


/// A forward read together with its reverse mate
#[derive(Debug, Clone)]
pub struct CompletedPair {
    pub forward: bam::Record,
    pub reverse: bam::Record,
    /// barcode of the forward read, part of the family key
    pub barcode: String,
}

impl CompletedPair {
    pub fn start(&self) -> i64 {
        self.forward.pos()
    }
}

/// Completed pairs sharing forward start and barcode
#[derive(Debug, Clone)]
pub struct Family {
    pub start: i64,
    pub barcode: String,
    /// never empty
    pub pairs: Vec<CompletedPair>,
}

impl Family {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// stable sort by (forward start, barcode), both ascending
///
/// Unittest: TRUE
///
pub fn sort_pairs(
    pairs: &mut [CompletedPair]
) {
    pairs.sort_by(|a, b| {
        a.start().cmp(&b.start())
            .then_with(|| a.barcode.cmp(&b.barcode))
    });
}

/// sorts the pairs of a region and splits them in one pass
/// into maximal runs with identical (start, barcode)
///
/// Unittest: TRUE
///
pub fn group_families(
    mut pairs: Vec<CompletedPair>
) -> Vec<Family> {
    sort_pairs(&mut pairs);
    let mut families: Vec<Family> = Vec::new();
    for pair in pairs {
        match families.last_mut() {
            Some(current) if current.start == pair.start() && current.barcode == pair.barcode => {
                current.pairs.push(pair);
            },
            _ => {
                families.push(Family {
                    start: pair.start(),
                    barcode: pair.barcode.clone(),
                    pairs: vec![pair],
                });
            },
        }
    }
    families
}


/// Gapped rows of a multiple alignment, in input order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msa {
    pub rows: Vec<Vec<u8>>,
}

impl Msa {
    pub fn width(&self) -> usize {
        self.rows.iter().map(|r| r.len()).max().unwrap_or(0)
    }
}

/// Anything which can align a set of sequences globally
pub trait MultipleAligner {
    /// returns one gapped row per input sequence, same order as the input
    fn align(&self, sequences: &[&[u8]]) -> Result<Msa>;
}


/// Center-star multiple alignment.
/// The sequence with the best sum of pairwise scores becomes the center,
/// all others are aligned globally against it and the insertions relative
/// to the center are merged column-wise.
#[derive(Debug, Clone)]
pub struct StarAligner {
    scoring: MsaScoring,
}

impl StarAligner {
    pub fn new(scoring: MsaScoring) -> Result<Self> {
        scoring.validate()?;
        Ok(StarAligner { scoring })
    }

    fn operations(&self, x: &[u8], y: &[u8]) -> Vec<AlignmentOperation> {
        if x.is_empty() {
            return vec![AlignmentOperation::Del; y.len()];
        }
        if y.is_empty() {
            return vec![AlignmentOperation::Ins; x.len()];
        }
        self.global(x, y).operations
    }

    // gap open 0 turns the affine model into a linear one
    fn global(&self, x: &[u8], y: &[u8]) -> Alignment {
        let mut aligner = pairwise::Aligner::with_capacity(
            x.len(),
            y.len(),
            0,
            self.scoring.gap_score,
            MatchParams::new(self.scoring.match_score, self.scoring.mismatch_score),
        );
        aligner.global(x, y)
    }

    fn score(&self, x: &[u8], y: &[u8]) -> i64 {
        if x.is_empty() || y.is_empty() {
            let gaps = x.len().max(y.len()) as i64;
            return gaps * i64::from(self.scoring.gap_score);
        }
        i64::from(self.global(x, y).score)
    }

    /// index of the center sequence, ties go to the lowest index
    fn pick_center(&self, sequences: &[&[u8]]) -> usize {
        if sequences.len() < 3 {
            return 0;
        }
        let mut totals = vec![0_i64; sequences.len()];
        for i in 0..sequences.len() {
            for j in (i + 1)..sequences.len() {
                let score = self.score(sequences[i], sequences[j]);
                totals[i] += score;
                totals[j] += score;
            }
        }
        let mut best = 0;
        for (idx, total) in totals.iter().enumerate() {
            if *total > totals[best] {
                best = idx;
            }
        }
        best
    }
}

impl MultipleAligner for StarAligner {
    fn align(&self, sequences: &[&[u8]]) -> Result<Msa> {
        if sequences.is_empty() {
            return Err(ConsensusError::AlignmentEngine(String::from("no sequences to align")));
        }
        if sequences.len() == 1 {
            return Ok(Msa { rows: vec![sequences[0].to_vec()] });
        }
        let center_idx = self.pick_center(sequences);
        let center = sequences[center_idx];
        debug!("Star alignment of {} sequences, center {}", sequences.len(), center_idx);

        let projections: Vec<Projection> = sequences.iter().enumerate().map(|(idx, seq)| {
            if idx == center_idx {
                Projection::center(center)
            } else {
                Projection::from_operations(seq, center.len(), &self.operations(seq, center))
            }
        }).collect();

        // widest insertion block in front of every center position
        let mut widths = vec![0_usize; center.len() + 1];
        for projection in projections.iter() {
            for (slot, inserted) in projection.inserts.iter().enumerate() {
                widths[slot] = widths[slot].max(inserted.len());
            }
        }
        Ok(Msa {
            rows: projections.iter().map(|p| p.render(&widths)).collect(),
        })
    }
}

/// One sequence expressed relative to the center:
/// the base placed on every center position plus the
/// bases inserted in front of it (slot `len` = behind the last).
struct Projection {
    inserts: Vec<Vec<u8>>,
    columns: Vec<u8>,
}

impl Projection {
    fn center(center: &[u8]) -> Self {
        Projection {
            inserts: vec![Vec::new(); center.len() + 1],
            columns: center.to_vec(),
        }
    }

    // x is the projected sequence, y the center
    fn from_operations(x: &[u8], center_len: usize, operations: &[AlignmentOperation]) -> Self {
        let mut inserts = vec![Vec::new(); center_len + 1];
        let mut columns = vec![GAP; center_len];
        let mut xi = 0;
        let mut yi = 0;
        for op in operations {
            match *op {
                AlignmentOperation::Match | AlignmentOperation::Subst => {
                    columns[yi] = x[xi];
                    xi += 1;
                    yi += 1;
                },
                AlignmentOperation::Del => {
                    yi += 1;
                },
                AlignmentOperation::Ins => {
                    inserts[yi].push(x[xi]);
                    xi += 1;
                },
                AlignmentOperation::Xclip(n) => {
                    inserts[yi].extend_from_slice(&x[xi..xi + n]);
                    xi += n;
                },
                AlignmentOperation::Yclip(n) => {
                    yi += n;
                },
            }
        }
        Projection { inserts, columns }
    }

    fn render(&self, widths: &[usize]) -> Vec<u8> {
        let total = widths.iter().sum::<usize>() + self.columns.len();
        let mut row = Vec::with_capacity(total);
        for (slot, width) in widths.iter().enumerate() {
            row.extend_from_slice(&self.inserts[slot]);
            row.resize(row.len() + width - self.inserts[slot].len(), GAP);
            if let Some(base) = self.columns.get(slot) {
                row.push(*base);
            }
        }
        row
    }
}


/// Consensus sequence and raw phred qualities of one orientation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusRead {
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
}

impl ConsensusRead {
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }
}

/// Everything needed to fabricate the consensus pair of a family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusResult {
    pub tid: i32,
    pub barcode: String,
    pub forward: ConsensusRead,
    pub reverse: ConsensusRead,
    pub forward_start: i64,
    /// reverse start of the first member
    pub reverse_start: i64,
    /// best mapping quality among the forward members
    pub forward_mapq: u8,
    /// best mapping quality among the reverse members
    pub reverse_mapq: u8,
    /// read names of the members, in family order
    pub members: Vec<String>,
}

impl ConsensusResult {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

fn symbol_rank(symbol: u8) -> (u8, u8) {
    match symbol {
        b'A' => (0, 0),
        b'C' => (1, 0),
        b'G' => (2, 0),
        b'T' => (3, 0),
        b'N' => (4, 0),
        GAP  => (6, 0),
        other => (5, other),
    }
}

/// most frequent symbol of a column; ties go to the higher summed
/// quality, then to the order A < C < G < T < N, gaps last
fn column_winner(msa: &Msa, qualities: &[Vec<u8>], offsets: &[usize], col: usize) -> u8 {
    // symbol, count, summed quality
    let mut tally: Vec<(u8, usize, u32)> = Vec::new();
    for (member, row) in msa.rows.iter().enumerate() {
        let symbol = match row.get(col) {
            Some(s) => *s,
            None => continue,
        };
        let quality = if symbol == GAP {
            0
        } else {
            u32::from(qualities[member].get(offsets[member]).copied().unwrap_or(0))
        };
        match tally.iter_mut().find(|t| t.0 == symbol) {
            Some(entry) => {
                entry.1 += 1;
                entry.2 += quality;
            },
            None => tally.push((symbol, 1, quality)),
        }
    }
    tally.into_iter()
        .max_by(|a, b| {
            a.1.cmp(&b.1)
                .then(a.2.cmp(&b.2))
                .then(symbol_rank(b.0).cmp(&symbol_rank(a.0)))
        })
        .map(|t| t.0)
        .unwrap_or(GAP)
}

/// Derives consensus sequence and quality from gapped rows.
/// A column whose winner is a gap is dropped. The quality of a kept column
/// is the best quality among the members carrying the winning base there,
/// `floor` if no member does. Columns beyond a member's row are skipped for it.
///
/// Unittest: TRUE
///
pub fn call_consensus(
    msa: &Msa,
    qualities: &[Vec<u8>],
    floor: u8
) -> ConsensusRead {
    let width = msa.width();
    // position inside every member's ungapped read
    let mut offsets = vec![0_usize; msa.rows.len()];
    let mut seq = Vec::with_capacity(width);
    let mut qual = Vec::with_capacity(width);
    for col in 0..width {
        let symbol = column_winner(msa, qualities, &offsets, col);
        if symbol != GAP {
            let mut best: Option<u8> = None;
            for (member, row) in msa.rows.iter().enumerate() {
                if row.get(col) != Some(&symbol) {
                    continue;
                }
                if let Some(q) = qualities[member].get(offsets[member]) {
                    best = Some(best.map_or(*q, |b| b.max(*q)));
                }
            }
            seq.push(symbol);
            qual.push(best.unwrap_or(floor));
        }
        for (member, row) in msa.rows.iter().enumerate() {
            if let Some(s) = row.get(col) {
                if *s != GAP {
                    offsets[member] += 1;
                }
            }
        }
    }
    ConsensusRead { seq, qual }
}

/// consensus of one orientation of a family.
/// A single member passes through untouched, the aligner is not asked.
///
/// Unittest: TRUE
///
pub fn consensus_read<A: MultipleAligner>(
    aligner: &A,
    sequences: &[Vec<u8>],
    qualities: &[Vec<u8>],
    floor: u8
) -> Result<ConsensusRead> {
    match sequences.len() {
        0 => Err(ConsensusError::AlignmentEngine(String::from("consensus of zero sequences requested"))),
        1 => Ok(ConsensusRead {
            seq: sequences[0].clone(),
            qual: qualities[0].clone(),
        }),
        n => {
            let views: Vec<&[u8]> = sequences.iter().map(|s| s.as_slice()).collect();
            let msa = aligner.align(&views)?;
            if msa.rows.len() != n {
                return Err(ConsensusError::AlignmentEngine(format!(
                    "aligner returned {} rows for {} sequences", msa.rows.len(), n
                )));
            }
            Ok(call_consensus(&msa, qualities, floor))
        },
    }
}

/// builds forward and reverse consensus of a family
///
/// Unittest: TRUE
///
pub fn build_consensus<A: MultipleAligner>(
    family: &Family,
    aligner: &A,
    floor: u8
) -> Result<ConsensusResult> {
    let first = family.pairs.first().ok_or_else(|| {
        ConsensusError::AlignmentEngine(format!("family {}:{} without members", family.start, family.barcode))
    })?;

    let fwd_seqs: Vec<Vec<u8>>  = family.pairs.iter().map(|p| p.forward.seq().as_bytes()).collect();
    let fwd_quals: Vec<Vec<u8>> = family.pairs.iter().map(|p| p.forward.qual().to_vec()).collect();
    let rev_seqs: Vec<Vec<u8>>  = family.pairs.iter().map(|p| p.reverse.seq().as_bytes()).collect();
    let rev_quals: Vec<Vec<u8>> = family.pairs.iter().map(|p| p.reverse.qual().to_vec()).collect();

    let forward = consensus_read(aligner, &fwd_seqs, &fwd_quals, floor)?;
    let reverse = consensus_read(aligner, &rev_seqs, &rev_quals, floor)?;
    debug!(
        "Family {}:{} with {} members -> forward {} bp, reverse {} bp",
        family.start, family.barcode, family.len(), forward.len(), reverse.len()
    );

    Ok(ConsensusResult {
        tid: first.forward.tid(),
        barcode: family.barcode.clone(),
        forward,
        reverse,
        forward_start: family.start,
        reverse_start: first.reverse.pos(),
        forward_mapq: family.pairs.iter().map(|p| p.forward.mapq()).max().unwrap_or(0),
        reverse_mapq: family.pairs.iter().map(|p| p.reverse.mapq()).max().unwrap_or(0),
        members: family.pairs.iter().map(|p| read_name(&p.forward)).collect(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::record::{Cigar, CigarString};

    fn phred(ascii: &str) -> Vec<u8> {
        ascii.bytes().map(|b| b - 33).collect()
    }

    fn record(name: &str, pos: i64, flags: u16, mapq: u8, seq: &[u8], qual: &[u8]) -> bam::Record {
        let mut rec = bam::Record::new();
        let cigar = CigarString(vec![Cigar::Match(seq.len() as u32)]);
        rec.set(name.as_bytes(), Some(&cigar), seq, qual);
        rec.set_tid(0);
        rec.set_pos(pos);
        rec.set_flags(flags);
        rec.set_mapq(mapq);
        rec
    }

    fn pair(name: &str, start: i64, barcode: &str) -> CompletedPair {
        CompletedPair {
            forward: record(name, start, 0x63, 60, b"ACGT", &phred("IIII")),
            reverse: record(name, start + 100, 0x93, 60, b"ACGT", &phred("IIII")),
            barcode: barcode.to_string(),
        }
    }

    fn aligner() -> StarAligner {
        StarAligner::new(MsaScoring::default()).unwrap()
    }

    struct NeverAligner;

    impl MultipleAligner for NeverAligner {
        fn align(&self, _sequences: &[&[u8]]) -> Result<Msa> {
            panic!("aligner must not be invoked");
        }
    }

    /////////////////////////////////////////
    ///       GROUPING           ////////////
    /////////////////////////////////////////
    #[test]
    fn sort_order(){
        let mut pairs = vec![pair("r1", 50, "AA"), pair("r2", 50, "AB"), pair("r3", 30, "AA")];
        sort_pairs(&mut pairs);
        let keys: Vec<(i64, &str)> = pairs.iter().map(|p| (p.start(), p.barcode.as_str())).collect();
        assert_eq!(keys, vec![(30, "AA"), (50, "AA"), (50, "AB")]);
    }
    #[test]
    fn sort_is_stable(){
        let mut pairs = vec![pair("b", 10, "AC"), pair("a", 10, "AC"), pair("c", 5, "AC")];
        sort_pairs(&mut pairs);
        let names: Vec<String> = pairs.iter().map(|p| read_name(&p.forward)).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }
    #[test]
    fn families_partition(){
        let pairs = vec![
            pair("r1", 50, "AA"),
            pair("r2", 50, "AB"),
            pair("r3", 30, "AA"),
            pair("r4", 50, "AA"),
            pair("r5", 51, "AA"),
        ];
        let families = group_families(pairs);
        assert_eq!(families.len(), 4);
        let sizes: Vec<usize> = families.iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![1, 2, 1, 1]);
        let mut seen = 0;
        for family in families.iter() {
            assert!(!family.is_empty());
            for member in family.pairs.iter() {
                assert_eq!(member.start(), family.start);
                assert_eq!(member.barcode, family.barcode);
                seen += 1;
            }
        }
        assert_eq!(seen, 5);
    }
    #[test]
    fn families_empty(){
        assert!(group_families(Vec::new()).is_empty());
    }

    /////////////////////////////////////////
    ///       ALIGNMENT          ////////////
    /////////////////////////////////////////
    #[test]
    fn star_identical(){
        let msa = aligner().align(&[b"ACGTACGT", b"ACGTACGT", b"ACGTACGT"]).unwrap();
        assert_eq!(msa.rows, vec![b"ACGTACGT".to_vec(); 3]);
    }
    #[test]
    fn star_mismatch_not_gapped(){
        let msa = aligner().align(&[b"AAAGG", b"AAAGC"]).unwrap();
        assert_eq!(msa.rows, vec![b"AAAGG".to_vec(), b"AAAGC".to_vec()]);
    }
    #[test]
    fn star_insertion(){
        let msa = aligner().align(&[b"ACGTACGT", b"ACGTTACGT", b"ACGTACGT"]).unwrap();
        assert_eq!(msa.width(), 9);
        for row in msa.rows.iter() {
            assert_eq!(row.len(), 9);
        }
        // gaps removed the rows give back the input
        let ungapped: Vec<Vec<u8>> = msa.rows.iter()
            .map(|r| r.iter().copied().filter(|b| *b != GAP).collect())
            .collect();
        assert_eq!(ungapped[0], b"ACGTACGT".to_vec());
        assert_eq!(ungapped[1], b"ACGTTACGT".to_vec());
        assert_eq!(msa.rows[0].iter().filter(|b| **b == GAP).count(), 1);
    }
    #[test]
    fn star_empty_input(){
        assert!(matches!(
            aligner().align(&[]),
            Err(ConsensusError::AlignmentEngine(_))
        ));
    }
    #[test]
    fn star_rejects_bad_scoring(){
        let scoring = MsaScoring{ match_score: -1, mismatch_score: -1, gap_score: -1 };
        assert!(StarAligner::new(scoring).is_err());
    }

    /////////////////////////////////////////
    ///       CONSENSUS          ////////////
    /////////////////////////////////////////
    #[test]
    fn singleton_passthrough(){
        let seqs = vec![b"ACGTN".to_vec()];
        let quals = vec![vec![2, 30, 40, 11, 0]];
        let result = consensus_read(&NeverAligner, &seqs, &quals, 0).unwrap();
        assert_eq!(result.seq, seqs[0]);
        assert_eq!(result.qual, quals[0]);
    }
    #[test]
    fn zero_members(){
        assert!(consensus_read(&aligner(), &[], &[], 0).is_err());
    }
    #[test]
    fn two_members_tie(){
        let seqs  = vec![b"AAAGG".to_vec(), b"AAAGC".to_vec()];
        let quals = vec![phred("IIIII"), phred("IIIHI")];
        let result = consensus_read(&aligner(), &seqs, &quals, 0).unwrap();
        // equal count and quality, C sorts before G
        assert_eq!(result.seq, b"AAAGC".to_vec());
        assert_eq!(result.qual, phred("IIIII"));
    }
    #[test]
    fn tie_broken_by_quality(){
        let seqs  = vec![b"AAAGG".to_vec(), b"AAAGC".to_vec()];
        let quals = vec![phred("IIIII"), phred("IIII#")];
        let result = consensus_read(&aligner(), &seqs, &quals, 0).unwrap();
        assert_eq!(result.seq, b"AAAGG".to_vec());
    }
    #[test]
    fn majority_wins(){
        let seqs  = vec![b"AAAGG".to_vec(), b"AAAGC".to_vec(), b"AAAGG".to_vec()];
        let quals = vec![phred("5555+"), phred("IIIII"), phred("55555")];
        let result = consensus_read(&aligner(), &seqs, &quals, 0).unwrap();
        assert_eq!(result.seq, b"AAAGG".to_vec());
        // last column: only the G members count, best of them is '5'
        assert_eq!(result.qual, phred("IIII5"));
    }
    #[test]
    fn gap_columns_dropped(){
        let msa = Msa{ rows: vec![b"AC-T".to_vec(), b"ACGT".to_vec(), b"AC-T".to_vec()] };
        let quals = vec![vec![10, 20, 30], vec![5, 25, 40, 35], vec![12, 18, 33]];
        let result = call_consensus(&msa, &quals, 0);
        assert_eq!(result.seq, b"ACT".to_vec());
        assert_eq!(result.qual, vec![12, 25, 35]);
    }
    #[test]
    fn short_rows_skipped(){
        let msa = Msa{ rows: vec![b"ACG".to_vec(), b"AC".to_vec()] };
        let quals = vec![vec![10, 10, 10], vec![30, 30]];
        let result = call_consensus(&msa, &quals, 2);
        assert_eq!(result.seq, b"ACG".to_vec());
        assert_eq!(result.qual, vec![30, 30, 10]);
    }
    #[test]
    fn floor_without_support(){
        // qualities shorter than the rows, the winning column has no usable quality
        let msa = Msa{ rows: vec![b"AC".to_vec(), b"AC".to_vec()] };
        let quals = vec![vec![20], vec![21]];
        let result = call_consensus(&msa, &quals, 7);
        assert_eq!(result.qual, vec![21, 7]);
    }
    #[test]
    fn quality_within_bounds(){
        // no column is won by a gap, so consensus position == column
        let msa = Msa { rows: vec![
            b"ACGTTGCA".to_vec(),
            b"ACGT-GCA".to_vec(),
            b"ACCTTGCA".to_vec(),
            b"ACGTTGCAA".to_vec(),
        ]};
        let mut quals: Vec<Vec<u8>> = msa.rows.iter().enumerate()
            .map(|(i, row)| {
                let bases = row.iter().filter(|b| **b != GAP).count();
                (0..bases).map(|j| (5 + 3 * i + 2 * j) as u8).collect()
            })
            .collect();
        // one member lacks the quality of its last base
        quals[2].pop();
        let floor = 3;
        let result = call_consensus(&msa, &quals, floor);
        assert_eq!(result.seq, b"ACGTTGCAA".to_vec());
        assert_eq!(result.seq.len(), result.qual.len());

        let mut offsets = vec![0_usize; msa.rows.len()];
        for col in 0..msa.width() {
            let mut supporting: Option<u8> = None;
            for (member, row) in msa.rows.iter().enumerate() {
                if row.get(col) == Some(&result.seq[col]) {
                    if let Some(q) = quals[member].get(offsets[member]) {
                        supporting = Some(supporting.map_or(*q, |b| b.max(*q)));
                    }
                }
                if row.get(col).map_or(false, |b| *b != GAP) {
                    offsets[member] += 1;
                }
            }
            let upper = supporting.unwrap_or(floor);
            assert!(result.qual[col] >= floor, "column {}", col);
            assert!(result.qual[col] <= upper, "column {}", col);
            assert_eq!(result.qual[col], upper, "column {}", col);
        }
    }
    #[test]
    fn family_consensus(){
        let mut first = pair("read1", 120, "ACGT");
        first.forward = record("read1", 120, 0x63, 20, b"AAAGG", &phred("IIIII"));
        first.reverse = record("read1", 300, 0x93, 50, b"TTTT", &phred("IIII"));
        let mut second = pair("read2", 120, "ACGT");
        second.forward = record("read2", 120, 0x63, 60, b"AAAGC", &phred("IIIHI"));
        second.reverse = record("read2", 302, 0x93, 10, b"TTTT", &phred("IIII"));
        let families = group_families(vec![first, second]);
        assert_eq!(families.len(), 1);
        let result = build_consensus(&families[0], &aligner(), 0).unwrap();
        assert_eq!(result.size(), 2);
        assert_eq!(result.members, vec!["read1", "read2"]);
        assert_eq!(result.forward_mapq, 60);
        assert_eq!(result.reverse_mapq, 50);
        assert_eq!(result.forward_start, 120);
        assert_eq!(result.reverse_start, 300);
        assert_eq!(result.forward.qual, phred("IIIII"));
        assert_eq!(result.reverse.seq, b"TTTT".to_vec());
    }
    #[test]
    fn custom_engine_is_used(){
        struct Verbatim;
        impl MultipleAligner for Verbatim {
            fn align(&self, sequences: &[&[u8]]) -> Result<Msa> {
                Ok(Msa{ rows: sequences.iter().map(|s| s.to_vec()).collect() })
            }
        }
        let seqs  = vec![b"AC".to_vec(), b"AG".to_vec(), b"AG".to_vec()];
        let quals = vec![vec![1, 2], vec![3, 4], vec![5, 6]];
        let result = consensus_read(&Verbatim, &seqs, &quals, 0).unwrap();
        assert_eq!(result.seq, b"AG".to_vec());
        assert_eq!(result.qual, vec![5, 6]);
    }
}
