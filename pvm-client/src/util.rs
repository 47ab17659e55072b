// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for names and hrefs as the REST API expects them.

use crate::Error;
use uuid::Uuid;

/// Longest file name the API accepts.
pub const FILENAME_MAX_LEN: usize = 79;

fn scrub(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Builds a file name acceptable to the API from `name`.
///
/// Every character outside `[.0-9A-Z_a-z]` in the name, prefix and suffix
/// is replaced with `_`. No delimiter is added between the parts. The name is
/// truncated so that the whole result fits in `max_len`.
pub fn sanitize_file_name_for_api(
    name: &str,
    prefix: &str,
    suffix: &str,
    max_len: usize,
) -> Result<String, Error> {
    let name_scrubbed = scrub(name);
    let prefix = scrub(prefix);
    let suffix = scrub(suffix);

    let base_len = max_len
        .checked_sub(prefix.len() + suffix.len())
        .filter(|len| *len > 0)
        .ok_or_else(|| Error::InvalidName {
            name: name.to_string(),
            reason: format!(
                "prefix {prefix:?} and suffix {suffix:?} leave no room \
                 within {max_len} characters"
            ),
        })?;

    // Scrubbed strings are pure ASCII, so byte and char offsets agree.
    let base = &name_scrubbed[..name_scrubbed.len().min(base_len)];
    let ret = format!("{prefix}{base}{suffix}");
    if ret.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "zero length string provided".to_string(),
        });
    }
    Ok(ret)
}

fn path_uuids(href: &str) -> impl Iterator<Item = Uuid> + '_ {
    let path = href.split(|c| c == '?' || c == '#').next().unwrap_or("");
    path.split('/').filter_map(|segment| {
        // Only the hyphenated form appears in paths.
        if segment.len() == 36 {
            Uuid::parse_str(segment).ok()
        } else {
            None
        }
    })
}

/// Returns the UUID of the root object addressed by `href`.
///
/// For `.../ManagedSystem/<a>/VirtualIOServer/<b>` this is `<a>`.
pub fn root_uuid_from_href(href: &str) -> Result<Uuid, Error> {
    path_uuids(href)
        .next()
        .ok_or_else(|| Error::InvalidHref { href: href.to_string() })
}

/// Returns the UUID of the object `href` points at (the last one in the path).
pub fn uuid_from_href(href: &str) -> Result<Uuid, Error> {
    path_uuids(href)
        .last()
        .ok_or_else(|| Error::InvalidHref { href: href.to_string() })
}
