//! Offset pagination over a stably ordered listing
//!
//! The token is the decimal offset of the next entry. Listings are re-ordered
//! on every call, so a page boundary stays valid as long as entries before it
//! are not removed.

use crate::error::{Error, Result};

/// Slice one page out of `items`
///
/// `max_entries == 0` returns everything from the token onward. The returned
/// token is empty once the listing is exhausted.
pub fn paginate<T>(items: Vec<T>, max_entries: u32, starting_token: &str) -> Result<(Vec<T>, String)> {
    let start = if starting_token.is_empty() {
        0
    } else {
        starting_token
            .parse::<usize>()
            .map_err(|_| Error::Aborted(format!("invalid starting token {:?}", starting_token)))?
    };

    let total = items.len();
    if start > total {
        return Err(Error::Aborted(format!(
            "starting token {} is beyond the {} available entries",
            start, total
        )));
    }

    let end = if max_entries == 0 {
        total
    } else {
        total.min(start + max_entries as usize)
    };
    let next_token = if end < total { end.to_string() } else { String::new() };

    let page = items.into_iter().skip(start).take(end - start).collect();
    Ok((page, next_token))
}
