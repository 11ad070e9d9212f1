use log::{debug, trace};

use std::{str, sync::Arc};

use crate::channels::{channel_token, ChannelTable};
use crate::service::ProxyService;

use super::{Buffering, Relay};

/// Relay for the tuner's web/administration port.
///
/// Requests are re-addressed to the device, responses are rewritten so that
/// capture URLs of overridden channels and the device identity point at us.
/// Everything works on raw bytes; bodies need not be valid UTF-8.
pub struct HttpRelay {
    service: Arc<ProxyService>,
}

impl HttpRelay {
    pub fn new(service: Arc<ProxyService>) -> Self {
        HttpRelay { service }
    }
}

impl Relay for HttpRelay {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn device_endpoint(&self) -> (String, u16) {
        let settings = self.service.settings();
        (settings.device_host_name.clone(), settings.device_web_port)
    }

    fn buffering(&self) -> Buffering {
        Buffering::WholeResponse
    }

    fn inspect_request(&mut self, request: &mut Vec<u8>) {
        trace!(target: "hdhrproxy", "Original HTTP request:\n{}", String::from_utf8_lossy(request));

        let settings = self.service.settings();

        if settings.service_host_name.is_none() {
            if let Some(host) = host_header_host(request) {
                self.service.observe_client_host(host);
            }
        }

        let device_host = host_with_port(&settings.device_host_name, settings.device_web_port);

        if let Some(rewritten) = rewrite_request_hosts(request, &device_host) {
            trace!(target: "hdhrproxy", "Modified HTTP request:\n{}", String::from_utf8_lossy(&rewritten));
            *request = rewritten;
        }
    }

    fn inspect_response(&mut self, response: &mut Vec<u8>) {
        trace!(target: "hdhrproxy", "Original HTTP response:\n{}", String::from_utf8_lossy(response));

        self.service.discover_identity(response);

        if let Some(rewritten) = rewrite_response(&self.service, response) {
            trace!(target: "hdhrproxy", "Modified HTTP response:\n{}", String::from_utf8_lossy(&rewritten));
            *response = rewritten;
        }
    }

    fn on_client_disconnected(&self) {
        debug!(target: "hdhrproxy", "HTTP client went away before the response was delivered.");
    }
}

/// `host:port`, or just `host` for port 80.
pub fn host_with_port(host: &str, port: u16) -> String {
    if port == 80 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

fn rewrite_response(service: &ProxyService, original: &[u8]) -> Option<Vec<u8>> {
    let settings = service.settings();
    let external_host = service.external_host();

    let urls = UrlRewriter {
        device_host: &settings.device_host_name,
        device_capture_port: settings.device_capture_port.to_string(),
        external_host: &external_host,
        service_capture_port: settings.service_capture_port,
        service_web_port: settings.service_web_port,
        proxy_all_channels: settings.proxy_all_channels,
        channels: service.channels(),
    };

    let mut rewritten = urls.apply(original);

    if let Some(identity) = service.identity() {
        let current = rewritten.as_deref().unwrap_or(original);
        let alternate = identity.alternate.to_string();
        if let Some(replaced) = replace_identity(current, identity.original.as_bytes(), alternate.as_bytes()) {
            rewritten = Some(replaced);
        }
    }

    rewritten.map(|new_bytes| renormalize_content_length(original, new_bytes))
}

// ============================================
// Device identity
// ============================================

/// Finds the hex run following a `Device ID` / `"DeviceID":"` label.
pub fn find_device_id(bytes: &[u8]) -> Option<&str> {
    let mut from = 0;

    while let Some(offset) = find_bytes(&bytes[from..], b"Device") {
        let start = from + offset;
        from = start + 1;

        if start > 0 && is_word_byte(bytes[start - 1]) {
            continue;
        }

        let mut i = skip_while(bytes, start + "Device".len(), |b| b.is_ascii_whitespace());
        if !bytes[i..].starts_with(b"ID") {
            continue;
        }
        i = skip_while(bytes, i + 2, |b| b == b'"');
        i = skip_while(bytes, i, |b| b.is_ascii_whitespace());
        if bytes.get(i) != Some(&b':') {
            continue;
        }
        i = skip_while(bytes, i + 1, |b| b.is_ascii_whitespace());
        i = skip_while(bytes, i, |b| b == b'"');

        let end = skip_while(bytes, i, |b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b));
        if end > i {
            return str::from_utf8(&bytes[i..end]).ok();
        }
    }

    None
}

/// Replaces every case-insensitive occurrence of `original` with `alternate`,
/// except query string (`?DeviceID=`) and mDNS host name (`hdhr-`) uses which
/// must keep pointing at the real device.
fn replace_identity(bytes: &[u8], original: &[u8], alternate: &[u8]) -> Option<Vec<u8>> {
    if original.is_empty() {
        return None;
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut copied = 0;
    let mut i = 0;

    while i + original.len() <= bytes.len() {
        let candidate = &bytes[i..i + original.len()];
        let preceding = &bytes[..i];

        if candidate.eq_ignore_ascii_case(original)
            && !ends_with_ignore_case(preceding, b"?DeviceID=")
            && !ends_with_ignore_case(preceding, b"hdhr-")
        {
            out.extend_from_slice(&bytes[copied..i]);
            out.extend_from_slice(alternate);
            i += original.len();
            copied = i;
        } else {
            i += 1;
        }
    }

    if copied == 0 {
        return None;
    }

    out.extend_from_slice(&bytes[copied..]);
    Some(out)
}

// ============================================
// Host and capture URLs
// ============================================

struct UrlRewriter<'a> {
    device_host: &'a str,
    device_capture_port: String,
    external_host: &'a str,
    service_capture_port: u16,
    service_web_port: u16,
    proxy_all_channels: bool,
    channels: &'a ChannelTable,
}

struct UrlMatch<'t> {
    port: Option<&'t [u8]>,
    path: &'t [u8],
    channel: Option<&'t str>,
    end: usize,
}

impl UrlRewriter<'_> {
    /// Rewrites `hdhr-XXXXXXXX.local` / device host references, optionally
    /// followed by `:port` and a `/…/vMAJOR.MINOR` capture path.
    fn apply(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(bytes.len() + 64);
        let mut copied = 0;
        let mut altered = false;
        let mut i = 0;

        while i < bytes.len() {
            let Some(host_end) = self.match_host(bytes, i) else {
                i += 1;
                continue;
            };

            let url = match_url_tail(bytes, host_end);

            if let Some(replacement) = self.replacement(&url) {
                out.extend_from_slice(&bytes[copied..i]);
                out.extend_from_slice(&replacement);
                copied = url.end;
                altered = true;
            }

            i = url.end;
        }

        if !altered {
            return None;
        }

        out.extend_from_slice(&bytes[copied..]);
        Some(out)
    }

    fn match_host(&self, bytes: &[u8], at: usize) -> Option<usize> {
        let rest = &bytes[at..];

        if rest.starts_with(b"hdhr-") {
            let id_len = rest[5..]
                .iter()
                .take_while(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
                .count();

            if id_len > 0 && rest[5 + id_len..].starts_with(b".local") {
                return Some(at + 5 + id_len + ".local".len());
            }
        }

        if !self.device_host.is_empty() && rest.starts_with(self.device_host.as_bytes()) {
            return Some(at + self.device_host.len());
        }

        None
    }

    fn replacement(&self, url: &UrlMatch<'_>) -> Option<Vec<u8>> {
        let host = if url.port == Some(self.device_capture_port.as_bytes()) {
            let overridden = url
                .channel
                .map(|channel| self.channels.is_overridden(channel))
                .unwrap_or(false);

            if !self.proxy_all_channels && !overridden {
                return None;
            }

            format!("{}:{}", self.external_host, self.service_capture_port)
        } else {
            // Not a capture URL, so it refers to the web interface.
            host_with_port(self.external_host, self.service_web_port)
        };

        let mut replacement = host.into_bytes();
        replacement.extend_from_slice(url.path);
        Some(replacement)
    }
}

fn match_url_tail(bytes: &[u8], host_end: usize) -> UrlMatch<'_> {
    let mut end = host_end;
    let mut port = None;

    if bytes.get(end) == Some(&b':') {
        let digits = skip_while(bytes, end + 1, |b| b.is_ascii_digit());
        if digits > end + 1 {
            port = Some(&bytes[end + 1..digits]);
            end = digits;
        }
    }

    let (path, channel) = match capture_path(bytes, end) {
        Some((path_end, channel)) => {
            let path = &bytes[end..path_end];
            end = path_end;
            (path, Some(channel))
        }
        None => (&bytes[end..end], None),
    };

    UrlMatch {
        port,
        path,
        channel,
        end,
    }
}

/// Matches `/seg/seg/vMAJOR.MINOR` at `start`, preferring the deepest segment.
fn capture_path(bytes: &[u8], start: usize) -> Option<(usize, &str)> {
    if bytes.get(start) != Some(&b'/') {
        return None;
    }

    let mut segments = vec![start + 1];
    let mut i = start + 1;

    loop {
        let segment_end = skip_while(bytes, i, |b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-');
        if segment_end > i && bytes.get(segment_end) == Some(&b'/') {
            i = segment_end + 1;
            segments.push(i);
        } else {
            break;
        }
    }

    segments
        .into_iter()
        .rev()
        .find_map(|segment| channel_token_at(bytes, segment).map(|channel| (segment + 1 + channel.len(), channel)))
}

fn channel_token_at(bytes: &[u8], at: usize) -> Option<&str> {
    let run_end = skip_while(bytes, at, |b| b.is_ascii_alphanumeric() || b == b'.');
    channel_token(str::from_utf8(&bytes[at..run_end]).ok()?)
}

// ============================================
// Header handling
// ============================================

/// Host part of the first `Host:` header, without the port. IPv6 literals
/// keep their brackets.
pub fn host_header_host(bytes: &[u8]) -> Option<&str> {
    header_lines(bytes).find_map(|line| {
        let line = str::from_utf8(line).ok()?;
        let start = header_value_start(line, "Host")?;
        let value = &line[start..];
        let host = value[..host_len(value)].trim_end();

        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    })
}

/// Points the `Host:` header and the host of an http(s) `Referer:` at the device.
fn rewrite_request_hosts(bytes: &[u8], device_host: &str) -> Option<Vec<u8>> {
    rewrite_header_lines(bytes, |line| {
        if let Some(start) = header_value_start(line, "Host") {
            let end = host_value_end(line, start)?;
            return Some(format!("{}{}{}", &line[..start], device_host, &line[end..]));
        }

        if let Some(start) = header_value_start(line, "Referer") {
            let (host_start, host_end) = referer_host_span(line, start)?;
            return Some(format!("{}{}{}", &line[..host_start], device_host, &line[host_end..]));
        }

        None
    })
}

/// Adjusts `Content-Length` by how much the body grew or shrank, in bytes.
fn renormalize_content_length(original: &[u8], rewritten: Vec<u8>) -> Vec<u8> {
    let delta = body_len(&rewritten) as i64 - body_len(original) as i64;

    if delta == 0 {
        return rewritten;
    }

    rewrite_header_lines(&rewritten, |line| {
        let start = header_value_start(line, "Content-Length")?;
        let end = skip_while(line.as_bytes(), start, |b| b.is_ascii_digit());
        let old_value: i64 = line[start..end].parse().ok()?;
        let new_value = (old_value + delta).max(0);

        Some(format!("{}{}{}", &line[..start], new_value, &line[end..]))
    })
    .unwrap_or(rewritten)
}

fn body_len(bytes: &[u8]) -> usize {
    find_bytes(bytes, b"\r\n\r\n")
        .map(|pos| bytes.len() - pos - 4)
        .or_else(|| find_bytes(bytes, b"\n\n").map(|pos| bytes.len() - pos - 2))
        .unwrap_or(bytes.len())
}

/// Header lines (status/request line included) without their line endings.
fn header_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes
        .split(|b| *b == b'\n')
        .map(trim_line_end)
        .take_while(|line| !line.is_empty())
}

/// Applies `rewrite` to every header line; `None` when nothing changed.
/// Lines that are not valid UTF-8 are passed through as they are.
fn rewrite_header_lines<F>(bytes: &[u8], mut rewrite: F) -> Option<Vec<u8>>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = Vec::with_capacity(bytes.len() + 16);
    let mut altered = false;
    let mut in_headers = true;

    for line in bytes.split_inclusive(|b| *b == b'\n') {
        let content = trim_line_end(line);
        let ending = &line[content.len()..];

        if in_headers {
            if content.is_empty() {
                in_headers = false;
            } else if let Some(replaced) = str::from_utf8(content).ok().and_then(|text| rewrite(text)) {
                out.extend_from_slice(replaced.as_bytes());
                out.extend_from_slice(ending);
                altered = true;
                continue;
            }
        }

        out.extend_from_slice(line);
    }

    if altered {
        Some(out)
    } else {
        None
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| *b != b'\r' && *b != b'\n')
        .map_or(0, |last| last + 1);

    &line[..end]
}

/// Offset of the value in `Name: value`, matching the name case-insensitively.
fn header_value_start(line: &str, name: &str) -> Option<usize> {
    let indent = line.len() - line.trim_start().len();
    let rest = line[indent..].as_bytes();

    if rest.len() <= name.len()
        || !rest[..name.len()].eq_ignore_ascii_case(name.as_bytes())
        || rest[name.len()] != b':'
    {
        return None;
    }

    let value_start = indent + name.len() + 1;
    Some(skip_while(line.as_bytes(), value_start, |b| b == b' ' || b == b'\t'))
}

/// Length of the host in a `host[:port]` value; `[v6::addr]` is taken whole.
fn host_len(value: &str) -> usize {
    if value.starts_with('[') {
        if let Some(close) = value.find(']') {
            return close + 1;
        }
    }

    value.find(':').unwrap_or(value.len())
}

fn host_value_end(line: &str, start: usize) -> Option<usize> {
    let bytes = line.as_bytes();
    let host_end = start + host_len(&line[start..]);

    if host_end == start {
        return None;
    }

    let port_end = skip_while(bytes, host_end + 1, |b| b.is_ascii_digit());
    if bytes.get(host_end) == Some(&b':') && port_end > host_end + 1 {
        Some(port_end)
    } else {
        Some(host_end)
    }
}

fn referer_host_span(line: &str, start: usize) -> Option<(usize, usize)> {
    let bytes = line.as_bytes();
    let value = &bytes[start..];

    let scheme_len = if value.len() >= 5 && value[..5].eq_ignore_ascii_case(b"http:") {
        5
    } else if value.len() >= 6 && value[..6].eq_ignore_ascii_case(b"https:") {
        6
    } else {
        return None;
    };

    let slashes_end = skip_while(bytes, start + scheme_len, |b| b == b'/');
    if slashes_end == start + scheme_len {
        return None;
    }

    let host_end = skip_while(bytes, slashes_end, |b| b != b'/');
    if host_end == slashes_end {
        return None;
    }

    Some((slashes_end, host_end))
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn skip_while(bytes: &[u8], from: usize, predicate: impl Fn(u8) -> bool) -> usize {
    let from = from.min(bytes.len());
    from + bytes[from..].iter().take_while(|b| predicate(**b)).count()
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn ends_with_ignore_case(bytes: &[u8], suffix: &[u8]) -> bool {
    bytes.len() >= suffix.len() && bytes[bytes.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}
