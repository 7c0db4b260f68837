// =============================================================================
// OCC option symbol codec
// =============================================================================
//
// Format: ROOT right-padded to 6 characters, YYMMDD expiration, C or P, and
// the strike times 1000 zero-padded to 8 digits. Example:
//
//   SPY   250117P00580000  ->  SPY 2025-01-17 put 580.00
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

use crate::types::OptionType;

/// A decoded OCC option symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct OccSymbol {
    pub root: String,
    pub expiration: NaiveDate,
    pub option_type: OptionType,
    pub strike: f64,
}

/// Encode an option leg into its 21-character OCC symbol.
pub fn encode(root: &str, expiration: NaiveDate, option_type: OptionType, strike: f64) -> String {
    let strike_milli = (strike * 1000.0).round() as u64;
    format!(
        "{:<6}{}{}{:08}",
        root,
        expiration.format("%y%m%d"),
        option_type.occ_code(),
        strike_milli
    )
}

/// Decode an OCC symbol. Returns an error for equity symbols or anything not
/// matching the fixed layout.
pub fn decode(symbol: &str) -> Result<OccSymbol> {
    let s = symbol.trim();
    if s.len() < 15 {
        bail!("not an OCC option symbol: {symbol}");
    }

    // The root is everything before the trailing 15-character tail
    // (YYMMDD + C/P + 8-digit strike). Roots shorter than 6 characters are
    // space-padded on the wire but some feeds strip the padding.
    let (root_part, tail) = s.split_at(s.len() - 15);
    let root = root_part.trim_end().to_string();
    if root.is_empty() {
        bail!("empty root in OCC symbol: {symbol}");
    }

    let date_part = &tail[0..6];
    let expiration = NaiveDate::parse_from_str(date_part, "%y%m%d")
        .with_context(|| format!("bad expiration in OCC symbol: {symbol}"))?;

    let option_type = match &tail[6..7] {
        "C" => OptionType::Call,
        "P" => OptionType::Put,
        other => bail!("bad option type '{other}' in OCC symbol: {symbol}"),
    };

    let strike_milli: u64 = tail[7..15]
        .parse()
        .with_context(|| format!("bad strike in OCC symbol: {symbol}"))?;
    let strike = strike_milli as f64 / 1000.0;

    Ok(OccSymbol {
        root,
        expiration,
        option_type,
        strike,
    })
}
