
//! # Barcode family consensus libraries
//!
//! This libraries are a collection of functions and structures which
//! help collapsing read pairs originating from the same tagged molecule.
//! Within target regions paired reads are classified, matched to their mate,
//! grouped into families by forward start and molecular barcode and
//! every family is turned into a single consensus read pair.
//!
//! The libraries are split into :
//!  - common: shared structures, region input, options, errors and statistics
//!  - consensus: grouping of pairs into families and the multiple alignment based consensus
//!  - hts_lib_based: everything touching htslib records, from region lookup to synthesized output
//!  - subset: whitelist based filtering of BAM records by barcode
//!

/// functions + structures of the consensus pipeline
pub mod lib {
    pub mod common;
    /// families, multiple alignment and consensus calling
    pub mod consensus;
    /// functions specific for htslib derived input
    pub mod hts_lib_based;
    /// barcode whitelist filtering
    pub mod subset;
}
