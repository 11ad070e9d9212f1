use std::collections::HashMap;

use log::{info, warn};

use crate::aspect::AspectRatio;

/// Per-channel aspect ratio overrides, keyed by `major.minor`.
///
/// Only non-default entries are kept, so a lookup miss means "pass through".
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    overrides: HashMap<String, AspectRatio>,
}

impl ChannelTable {
    /// Builds the table from raw configuration entries, e.g. `("07-1", "16:9")`.
    ///
    /// Entries with a malformed key or ratio are logged and skipped.
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut overrides = HashMap::new();

        for (raw_key, raw_ratio) in entries {
            let ratio = match raw_ratio.parse::<AspectRatio>() {
                Ok(ratio) => ratio,
                Err(e) => {
                    warn!(target: "hdhrproxy", "Invalid channel override setting ignored: {} => {} ({})", raw_key, raw_ratio, e);
                    AspectRatio::Default
                }
            };

            let Some(key) = normalize_channel_key(raw_key) else {
                warn!(target: "hdhrproxy", "Invalid channel number ignored: '{}'", raw_key);
                continue;
            };

            if !ratio.is_default() {
                overrides.insert(key, ratio);
            }
        }

        ChannelTable { overrides }
    }

    /// Ratio configured for `channel`, `Default` when there is none.
    pub fn get(&self, channel: &str) -> AspectRatio {
        self.overrides.get(channel).copied().unwrap_or_default()
    }

    pub fn is_overridden(&self, channel: &str) -> bool {
        !self.get(channel).is_default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    pub fn log_summary(&self) {
        if self.is_empty() {
            warn!(target: "hdhrproxy", "No valid channel overrides are defined. The service will still run, but no streams will be altered.");
            return;
        }

        let mut channels: Vec<_> = self.overrides.iter().collect();
        channels.sort_by(|a, b| a.0.cmp(b.0));

        let list: String = channels
            .into_iter()
            .map(|(channel, ratio)| format!("\n\t{} => {}", channel, ratio))
            .collect();

        info!(target: "hdhrproxy", "Channels to override:{}", list);
    }
}

/// Turns `"07-01"`, `" 7 . 1 "` or `"7.1"` into `"7.1"`.
pub fn normalize_channel_key(raw: &str) -> Option<String> {
    let (major, minor) = raw.trim().split_once(['-', '.'])?;

    let major = channel_number(major)?;
    let minor = channel_number(minor)?;

    Some(format!("{}.{}", major, minor))
}

fn channel_number(part: &str) -> Option<&str> {
    let part = part.trim();

    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let number = part.trim_start_matches('0');

    if number.is_empty() {
        None
    } else {
        Some(number)
    }
}

/// Matches `vMAJOR.MINOR` at the start of `text` and returns the `MAJOR.MINOR`
/// part as found in the capture URL.
pub fn channel_token(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();

    if bytes.first() != Some(&b'v') {
        return None;
    }

    let major_len = digit_run(&bytes[1..]);
    if major_len == 0 || bytes.get(1 + major_len) != Some(&b'.') {
        return None;
    }

    let minor_start = 2 + major_len;
    let minor_len = digit_run(&bytes[minor_start..]);
    if minor_len == 0 {
        return None;
    }

    Some(&text[1..minor_start + minor_len])
}

fn digit_run(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}
