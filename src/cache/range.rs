//! Byte-range header parsing and response slicing.
//!
//! Only the single-range `bytes=` form is understood. Multi-range and suffix
//! (`bytes=-500`) requests are treated as unparseable and fall back to a full
//! response.

use http::HeaderMap;

/// A requested byte range. `end` is inclusive; `None` means "to the end of the resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered, if bounded.
    pub fn len(&self) -> Option<u64> {
        self.end
            .map(|end| end.saturating_sub(self.start).saturating_add(1))
    }

    /// Value for an outgoing `Range` header.
    pub fn to_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// A parsed `Content-Range` header. `end` is inclusive; `total` is `None` for `/*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// Parse a `Range` header value such as `bytes=100-199` or `bytes=100-`.
pub fn parse_range_header(value: &str) -> Option<ByteRange> {
    let value = value.trim();
    let (unit, spec) = value.split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") || spec.contains(',') {
        return None;
    }

    let (start, end) = spec.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => {
            let end: u64 = end.parse().ok()?;
            if end < start {
                return None;
            }
            Some(end)
        }
    };

    Some(ByteRange { start, end })
}

/// Parse a `Content-Range` header value such as `bytes 100-299/1000` or `bytes 0-99/*`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let value = value.trim();
    let (unit, spec) = value.split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }

    let (range, total) = spec.trim().split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };

    Some(ContentRange { start, end, total })
}

/// Slice `data` down to the part the consumer asked for.
///
/// `data` holds response bytes starting at `response.start` (or at offset 0 when the
/// server sent no `Content-Range`). The result is the intersection of that span with
/// `requested`, which may be empty when the server returned bytes outside the request.
pub fn extract_requested_range<'a>(
    data: &'a [u8],
    requested: Option<ByteRange>,
    response: Option<ContentRange>,
) -> &'a [u8] {
    let response_start = response.map(|r| r.start).unwrap_or(0);
    let response_end = response_start.saturating_add(data.len() as u64);

    let (wanted_start, wanted_end) = match requested {
        Some(range) => (
            range.start,
            range.end.map_or(u64::MAX, |end| end.saturating_add(1)),
        ),
        None => (0, u64::MAX),
    };

    let start = wanted_start.max(response_start);
    let end = wanted_end.min(response_end);
    if start >= end {
        return &[];
    }

    &data[(start - response_start) as usize..(end - response_start) as usize]
}

/// Whether the response advertises `Accept-Ranges: bytes`.
pub fn supports_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::ACCEPT_RANGES)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))
}

/// Total resource length announced by a response: `Content-Range` total for partial
/// responses, `Content-Length` for full ones.
pub fn response_content_length(status: u16, headers: &HeaderMap) -> Option<u64> {
    if let Some(range) = headers
        .get(http::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
    {
        return range.total;
    }

    if status == 206 {
        return None;
    }

    headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
