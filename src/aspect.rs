use std::{fmt, str::FromStr};

use thiserror::Error;

/// Aspect ratio codes of the MPEG-2 sequence header.
///
/// See http://dvdnav.mplayerhq.hu/dvdinfo/mpeghdrs.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AspectRatio {
    /// Leave the stream untouched.
    #[default]
    Default = 0,
    Square = 1,
    Standard = 2,
    Widescreen = 3,
    Cinema = 4,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown aspect ratio '{0}', expected one of Default, 1:1, 4:3, 16:9 or 2.21:1.")]
pub struct ParseAspectRatioError(pub String);

impl AspectRatio {
    /// Value written into the top nibble of the aspect/frame-rate byte.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_default(self) -> bool {
        self == AspectRatio::Default
    }
}

impl FromStr for AspectRatio {
    type Err = ParseAspectRatioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();

        if value.is_empty() || value.eq_ignore_ascii_case("default") {
            return Ok(AspectRatio::Default);
        }

        match value {
            "1:1" => Ok(AspectRatio::Square),
            "4:3" => Ok(AspectRatio::Standard),
            "16:9" => Ok(AspectRatio::Widescreen),
            "2.21:1" => Ok(AspectRatio::Cinema),
            _ => Err(ParseAspectRatioError(s.to_string())),
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ratio = match self {
            AspectRatio::Default => "Default",
            AspectRatio::Square => "1:1",
            AspectRatio::Standard => "4:3",
            AspectRatio::Widescreen => "16:9",
            AspectRatio::Cinema => "2.21:1",
        };

        f.write_str(ratio)
    }
}
