use std::fs::File;
use std::io::{BufRead, BufReader};
use rust_htslib::bam;
use rustc_hash::FxHashSet;
use log::{debug, info};

use crate::lib::common::{*};
use crate::lib::hts_lib_based::{extract_barcode, RecordSink};


/// reads whitespace separated barcodes into a set.
/// An unreadable or empty whitelist is an error.
///
/// Unittest: TRUE
///
pub fn read_whitelist(
    my_file: &str
) -> Result<FxHashSet<String>> {
    let file = File::open(my_file).map_err(|e| ConsensusError::Whitelist {
        path: my_file.to_string(),
        reason: e.to_string(),
    })?;
    let mut barcodes = FxHashSet::default();
    for line in BufReader::new(file).lines() {
        let line = line?;
        barcodes.extend(line.split_whitespace().map(|b| b.to_string()));
    }
    info!("Loaded {} barcodes from '{}'", barcodes.len(), my_file);
    if barcodes.is_empty() {
        return Err(ConsensusError::Whitelist {
            path: my_file.to_string(),
            reason: String::from("no barcodes found"),
        });
    }
    Ok(barcodes)
}

/// Counters of a subset run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubsetStats {
    pub filtered: u64,
    pub passed: u64,
}

impl SubsetStats {
    pub fn total(&self) -> u64 {
        self.filtered + self.passed
    }

    fn percent(&self, count: u64) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            count as f64 / self.total() as f64 * 100.0
        }
    }

    pub fn report(&self) {
        info!("SUMMARY");
        info!("Total records:\t\t{}", self.total());
        info!("Filtered records:\t{}\t({:.2}%)", self.filtered, self.percent(self.filtered));
        info!("Passed records:\t\t{}\t({:.2}%)", self.passed, self.percent(self.passed));
    }
}

/// true if the record carries a barcode from the whitelist,
/// a record without a readable barcode never passes
pub fn has_whitelisted_barcode(
    record: &bam::Record,
    whitelist: &FxHashSet<String>,
    tag: &[u8],
    trim: usize
) -> bool {
    match extract_barcode(record, tag, trim) {
        Ok(barcode) => whitelist.contains(&barcode),
        Err(e) => {
            debug!("{}", e);
            false
        },
    }
}

/// Streams all records and writes the ones with a whitelisted
/// barcode to `out`, keeping their order.
///
/// Unittest: TRUE
///
pub fn subset_records<I>(
    records: I,
    whitelist: &FxHashSet<String>,
    tag: &[u8],
    trim: usize,
    out: &mut dyn RecordSink
) -> Result<SubsetStats>
where
    I: IntoIterator<Item = std::result::Result<bam::Record, rust_htslib::errors::Error>>,
{
    let mut stats = SubsetStats::default();
    for result in records {
        let record = result?;
        if has_whitelisted_barcode(&record, whitelist, tag, trim) {
            out.write_record(&record)?;
            stats.passed += 1;
        } else {
            stats.filtered += 1;
        }
    }
    Ok(stats)
}
