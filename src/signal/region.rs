//! Address regions used to scope coverage and to classify programs.

use super::{Elem, Signal, INVALID_ELEM};
use std::{fmt, num::ParseIntError, str::FromStr};
use thiserror::Error;

/// Inclusive pc range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrRange {
    pub start: Elem,
    pub end: Elem,
}

impl AddrRange {
    pub fn new(start: Elem, end: Elem) -> Result<Self, RegionError> {
        if start > end {
            return Err(RegionError::Reversed { start, end });
        }
        Ok(Self { start, end })
    }

    #[inline]
    pub fn contains(&self, pc: Elem) -> bool {
        self.start <= pc && pc <= self.end
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("bad address '{0}': {1}")]
    BadAddr(String, ParseIntError),
    #[error("bad range '{0}', expected 'start-end'")]
    BadRange(String),
    #[error("reversed range: {start:#x} > {end:#x}")]
    Reversed { start: Elem, end: Elem },
}

/// A set of inclusive ranges. Empty region is unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    ranges: Vec<AddrRange>,
}

impl Region {
    /// Region that accepts every valid pc.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn with_ranges(ranges: Vec<AddrRange>) -> Self {
        Self { ranges }
    }

    #[inline]
    pub fn is_unrestricted(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[AddrRange] {
        &self.ranges
    }

    pub fn push(&mut self, r: AddrRange) {
        self.ranges.push(r);
    }

    #[inline]
    pub fn contains(&self, pc: Elem) -> bool {
        if pc == INVALID_ELEM {
            return false;
        }
        self.is_unrestricted() || self.ranges.iter().any(|r| r.contains(pc))
    }

    /// Keeps the events of `raw` that fall into this region.
    pub fn filter(&self, raw: &[Elem]) -> Vec<Elem> {
        raw.iter().copied().filter(|&pc| self.contains(pc)).collect()
    }

    pub fn intersects(&self, s: &Signal) -> bool {
        s.elems().any(|pc| self.contains(pc))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "*");
        }
        for (i, r) in self.ranges.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

fn parse_addr(s: &str) -> Result<Elem, RegionError> {
    let s = s.trim();
    let r = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Elem::from_str_radix(hex, 16)
    } else {
        s.parse::<Elem>()
    };
    r.map_err(|e| RegionError::BadAddr(s.to_string(), e))
}

impl FromStr for AddrRange {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let items = s.trim().split('-').collect::<Vec<_>>();
        if items.len() != 2 {
            return Err(RegionError::BadRange(s.to_string()));
        }
        let start = parse_addr(items[0])?;
        let end = parse_addr(items[1])?;
        AddrRange::new(start, end)
    }
}

impl FromStr for Region {
    type Err = RegionError;

    /// Comma separated ranges, e.g. `0xffffffff81ba06ed-0xffffffff81bd1636,0x10-0x20`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Region::unrestricted());
        }
        let ranges = s
            .split(',')
            .filter(|r| !r.trim().is_empty())
            .map(AddrRange::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Region { ranges })
    }
}
