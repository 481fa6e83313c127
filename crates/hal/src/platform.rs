//! Platform description: which chips are on the mesh, where their cores sit,
//! and which external memory ranges the host may touch.
//!
//! The XML platform descriptor is parsed by an external tool; this module
//! consumes its flattened record form, one record per line:
//!
//! ```text
//! chip,<xid>,<yid>,<rows>,<cols>,<core_memory_size>
//! external,<base>,<size>
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io;

use log::debug;

#[derive(Debug)]
pub enum PlatformError {
    /// Couldn't parse string as number
    NumberParseError(String, std::num::ParseIntError),

    /// A record had too few fields or an unknown tag
    MalformedRecord(String),

    /// The descriptor described no cores at all
    EmptyPlatform,

    /// Generic IO error
    IoError(io::Error),

    /// CSV-level error
    CsvError(csv::Error),
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use PlatformError::*;
        match self {
            NumberParseError(s, e) => write!(f, "unable to parse number \"{}\": {}", s, e),
            MalformedRecord(s) => write!(f, "malformed platform record: {}", s),
            EmptyPlatform => write!(f, "platform contains no cores"),
            IoError(e) => write!(f, "io error: {}", e),
            CsvError(e) => write!(f, "csv error: {}", e),
        }
    }
}

impl std::convert::From<io::Error> for PlatformError {
    fn from(e: io::Error) -> PlatformError {
        PlatformError::IoError(e)
    }
}

impl std::convert::From<csv::Error> for PlatformError {
    fn from(e: csv::Error) -> PlatformError {
        PlatformError::CsvError(e)
    }
}

pub fn get_base(value: &str) -> (&str, u32) {
    if value.starts_with("0x") {
        (value.trim_start_matches("0x"), 16)
    } else if value.starts_with("0X") {
        (value.trim_start_matches("0X"), 16)
    } else if value.starts_with("0b") {
        (value.trim_start_matches("0b"), 2)
    } else if value.starts_with("0B") {
        (value.trim_start_matches("0B"), 2)
    } else if value.starts_with('0') && value != "0" {
        (value.trim_start_matches('0'), 8)
    } else {
        (value, 10)
    }
}

fn parse_u32(value: &str) -> Result<u32, PlatformError> {
    let (digits, base) = get_base(value);
    match u32::from_str_radix(digits, base) {
        Ok(o) => Ok(o),
        Err(e) => Err(PlatformError::NumberParseError(value.to_owned(), e)),
    }
}

fn parse_u16(value: &str) -> Result<u16, PlatformError> {
    let (digits, base) = get_base(value);
    match u16::from_str_radix(digits, base) {
        Ok(o) => Ok(o),
        Err(e) => Err(PlatformError::NumberParseError(value.to_owned(), e)),
    }
}

/// One chip on the mesh.
#[derive(Debug, Clone)]
pub struct ChipDef {
    /// Column of the chip's north-west core in absolute mesh coordinates.
    pub xid: u16,

    /// Row of the chip's north-west core in absolute mesh coordinates.
    pub yid: u16,

    pub rows: u16,
    pub cols: u16,

    /// Bytes of local SRAM per core.
    pub core_memory_size: u32,
}

/// A host-visible external memory window.
#[derive(Debug, Clone, Copy)]
pub struct ExternalRange {
    pub base: u32,
    pub size: u32,
}

/// The global address range owned by one core: its local memory plus the
/// memory-mapped register window at +0xf0000.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemRange {
    pub min_addr: u32,
    pub max_addr: u32,
    pub min_reg_addr: u32,
    pub max_reg_addr: u32,
}

impl MemRange {
    pub fn contains(&self, addr: u32) -> bool {
        (addr >= self.min_addr && addr <= self.max_addr)
            || (addr >= self.min_reg_addr && addr <= self.max_reg_addr)
    }
}

/// Everything the server needs to know about the attached hardware.
pub struct Platform {
    chips: Vec<ChipDef>,
    ext_ranges: Vec<ExternalRange>,

    // Derived tables.
    rel_core_ids: Vec<u16>,
    core_map: HashMap<u16, u16>,
    core_ranges: Vec<(MemRange, u16)>,
    num_rows: u32,
    num_cols: u32,
}

impl Platform {
    pub fn new(chips: Vec<ChipDef>, ext_ranges: Vec<ExternalRange>) -> Result<Platform, PlatformError> {
        let mut rel_core_ids = Vec::new();
        let mut core_map = HashMap::new();
        let mut core_ranges = Vec::new();
        let mut num_rows = 0u32;
        let mut num_cols = 0u32;

        for chip in &chips {
            num_rows += u32::from(chip.rows);
            num_cols += u32::from(chip.cols);

            for row in 0..chip.rows {
                for col in 0..chip.cols {
                    let rel_id = (row << 6) | col;
                    rel_core_ids.push(rel_id);

                    let abs_row = chip.yid + row;
                    let abs_col = chip.xid + col;
                    let abs_id = (abs_row << 6) | abs_col;
                    core_map.insert(rel_id, abs_id);

                    let min_addr =
                        (u32::from(abs_row) << 26) | (u32::from(abs_col) << 20);
                    let range = MemRange {
                        min_addr,
                        max_addr: min_addr + chip.core_memory_size - 1,
                        min_reg_addr: min_addr + 0xf0000,
                        max_reg_addr: min_addr + 0xf1000 - 1,
                    };
                    core_ranges.push((range, abs_id));
                }
            }
        }

        if rel_core_ids.is_empty() {
            return Err(PlatformError::EmptyPlatform);
        }

        debug!(
            "platform: {} cores, {} rows x {} cols, {} external ranges",
            rel_core_ids.len(),
            num_rows,
            num_cols,
            ext_ranges.len()
        );

        Ok(Platform {
            chips,
            ext_ranges,
            rel_core_ids,
            core_map,
            core_ranges,
            num_rows,
            num_cols,
        })
    }

    /// A single 4x4 chip at the conventional (32, 8) mesh position, used when
    /// no descriptor is supplied.
    pub fn single_chip() -> Platform {
        Platform::new(
            vec![ChipDef {
                xid: 8,
                yid: 32,
                rows: 4,
                cols: 4,
                core_memory_size: 0x8000,
            }],
            vec![ExternalRange {
                base: 0x8e00_0000,
                size: 0x0200_0000,
            }],
        )
        .unwrap()
    }

    /// Load the flattened descriptor emitted by the platform XML tooling.
    pub fn from_descriptor(filename: &str) -> Result<Platform, PlatformError> {
        let file = File::open(filename)?;
        let mut chips = Vec::new();
        let mut ext_ranges = Vec::new();

        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_reader(file);
        for result in rdr.records() {
            let r = result?;
            match &r[0] {
                "chip" => {
                    if r.len() < 6 {
                        return Err(PlatformError::MalformedRecord(format!("{:?}", r)));
                    }
                    chips.push(ChipDef {
                        xid: parse_u16(&r[1])?,
                        yid: parse_u16(&r[2])?,
                        rows: parse_u16(&r[3])?,
                        cols: parse_u16(&r[4])?,
                        core_memory_size: parse_u32(&r[5])?,
                    });
                }
                "external" => {
                    if r.len() < 3 {
                        return Err(PlatformError::MalformedRecord(format!("{:?}", r)));
                    }
                    ext_ranges.push(ExternalRange {
                        base: parse_u32(&r[1])?,
                        size: parse_u32(&r[2])?,
                    });
                }
                other => {
                    return Err(PlatformError::MalformedRecord(other.to_owned()));
                }
            }
        }

        Platform::new(chips, ext_ranges)
    }

    /// All relative core IDs, in row-major order.
    pub fn rel_core_ids(&self) -> &[u16] {
        &self.rel_core_ids
    }

    /// Translate a relative core ID into the absolute mesh coordinate.
    pub fn abs_core_id(&self, rel_id: u16) -> Option<u16> {
        self.core_map.get(&rel_id).copied()
    }

    pub fn core_ranges(&self) -> &[(MemRange, u16)] {
        &self.core_ranges
    }

    pub fn ext_ranges(&self) -> &[ExternalRange] {
        &self.ext_ranges
    }

    pub fn chips(&self) -> &[ChipDef] {
        &self.chips
    }

    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    pub fn num_cols(&self) -> u32 {
        self.num_cols
    }

    /// Check whether a global address falls in any mapped range.
    pub fn is_valid_addr(&self, addr: u32) -> bool {
        self.core_ranges.iter().any(|(r, _)| r.contains(addr))
            || self
                .ext_ranges
                .iter()
                .any(|e| addr >= e.base && (addr - e.base) < e.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn single_chip_geometry() {
        let p = Platform::single_chip();
        assert_eq!(p.rel_core_ids().len(), 16);
        assert_eq!(p.num_rows(), 4);
        assert_eq!(p.num_cols(), 4);
        // Relative (0,0) maps to absolute (32,8).
        assert_eq!(p.abs_core_id(0), Some((32 << 6) | 8));
        // Relative (1,2) maps to absolute (33,10).
        assert_eq!(p.abs_core_id((1 << 6) | 2), Some((33 << 6) | 10));
    }

    #[test]
    fn address_validation() {
        let p = Platform::single_chip();
        let base = (32u32 << 26) | (8 << 20);
        assert!(p.is_valid_addr(base));
        assert!(p.is_valid_addr(base + 0x7fff));
        assert!(!p.is_valid_addr(base + 0x8000));
        assert!(p.is_valid_addr(base + 0xf0408));
        assert!(!p.is_valid_addr(base + 0xf1000));
        assert!(p.is_valid_addr(0x8e00_0000));
        assert!(!p.is_valid_addr(0x2000_0000));
    }

    #[test]
    fn descriptor_round_trip() {
        let mut path = std::env::temp_dir();
        path.push(format!("epiphany-platform-test-{}.csv", std::process::id()));
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "chip,0x08,0x20,2,2,0x8000").unwrap();
            writeln!(f, "external,0x8e000000,0x02000000").unwrap();
        }
        let p = Platform::from_descriptor(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(p.rel_core_ids().len(), 4);
        assert_eq!(p.abs_core_id(0), Some((0x20 << 6) | 0x08));
        assert!(p.is_valid_addr(0x8e00_0000));
    }

    #[test]
    fn empty_descriptor_is_rejected() {
        assert!(Platform::new(vec![], vec![]).is_err());
    }
}
