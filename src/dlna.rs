//! DLNA header names, protocol-info content features and NPT time strings.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};

pub const TIME_SEEK_RANGE_DOMAIN: &str = "TimeSeekRange.dlna.org";
pub const CONTENT_FEATURES_DOMAIN: &str = "contentFeatures.dlna.org";
pub const TRANSFER_MODE_DOMAIN: &str = "transferMode.dlna.org";

/// The fourth field of a `http-get` protocolInfo string.
///
/// `DLNA.ORG_OP` is two binary digits: time-seek support then byte-range
/// support. `DLNA.ORG_CI` is 1 for transcoded content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentFeatures {
    pub profile_name: Option<String>,
    pub support_time_seek: bool,
    pub support_range: bool,
    pub transcoded: bool,
}

impl fmt::Display for ContentFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pn) = &self.profile_name {
            write!(f, "DLNA.ORG_PN={pn};")?;
        }
        let mut op = 0u8;
        if self.support_time_seek {
            op |= 2;
        }
        if self.support_range {
            op |= 1;
        }
        let ci = u8::from(self.transcoded);
        write!(
            f,
            "DLNA.ORG_OP={op:02b};DLNA.ORG_CI={ci};DLNA.ORG_FLAGS=01700000000000000000000000000000"
        )
    }
}

/// Parses an NPT duration of the form `H:MM:SS` with an optional fractional
/// second part of any precision.
pub fn parse_npt_duration(s: &str) -> Result<Duration> {
    let mut parts = s.splitn(3, ':');
    let (h, m, sec) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(s)) => (h, m, s),
        _ => bail!("npt duration needs three colon-separated fields: {s:?}"),
    };
    let h: u64 = h.parse().with_context(|| format!("bad npt hours {h:?}"))?;
    let m: u64 = m.parse().with_context(|| format!("bad npt minutes {m:?}"))?;
    let sec: f64 = sec
        .parse()
        .with_context(|| format!("bad npt seconds {sec:?}"))?;
    if !sec.is_finite() || sec < 0.0 {
        bail!("bad npt seconds {sec:?}");
    }
    Ok(Duration::from_secs(h * 3600 + m * 60) + Duration::from_secs_f64(sec))
}

/// Formats a duration as `HH:MM:SS.mmm`.
pub fn format_npt(d: Duration) -> String {
    let total = d.as_millis();
    let ms = total % 1000;
    let s = (total / 1000) % 60;
    let m = (total / 60_000) % 60;
    let h = total / 3_600_000;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

/// Formats a duration the way DIDL-Lite `res@duration` wants it,
/// `H:MM:SS.mmm` with an unpadded hour field.
pub fn format_duration_sexagesimal(d: Duration) -> String {
    let total = d.as_millis();
    let ms = total % 1000;
    let s = (total / 1000) % 60;
    let m = (total / 60_000) % 60;
    let h = total / 3_600_000;
    format!("{h}:{m:02}:{s:02}.{ms:03}")
}

/// A normal-play-time range; a missing end means "until the end".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NptRange {
    pub start: Duration,
    pub end: Option<Duration>,
}

impl NptRange {
    /// Length of the range, unbounded ranges have none.
    pub fn length(&self) -> Option<Duration> {
        self.end.map(|e| e.saturating_sub(self.start))
    }
}

impl fmt::Display for NptRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", format_npt(self.start))?;
        if let Some(end) = self.end {
            write!(f, "{}", format_npt(end))?;
        }
        Ok(())
    }
}

/// Parses `<start>-[<end>]`; an empty start defaults to zero.
pub fn parse_npt_range(s: &str) -> Result<NptRange> {
    let (start, end) = s
        .split_once('-')
        .with_context(|| format!("npt range missing '-': {s:?}"))?;
    let mut ret = NptRange::default();
    if !start.is_empty() {
        ret.start = parse_npt_duration(start)?;
    }
    if !end.is_empty() {
        ret.end = Some(parse_npt_duration(end)?);
    }
    Ok(ret)
}

/// Parses a `TimeSeekRange.dlna.org` header value, `npt=<start>-[<end>]`.
pub fn parse_time_seek_range(val: &str) -> Result<NptRange> {
    let rest = val
        .strip_prefix("npt=")
        .with_context(|| format!("time seek range missing npt= prefix: {val:?}"))?;
    parse_npt_range(rest)
}
