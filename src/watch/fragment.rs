//! Splitting of oversized responses into wire fragments.
//!
//! A response is split only when it reaches `limit` bytes and carries at
//! least two events. Events are packed greedily in order; an event that would
//! push a fragment to the limit starts the next fragment instead, unless it
//! would be alone. Every fragment but the last has `fragment = true`, so the
//! receiver reassembles by concatenating events until it sees a fragment
//! with the flag cleared.

use crate::Event;
use crate::WatchResponse;

pub(crate) fn fragment(
    response: WatchResponse,
    limit: usize,
) -> Vec<WatchResponse> {
    if response.events.len() < 2 || response.encoded_len() < limit {
        return vec![response];
    }

    let mut template = response;
    let events = std::mem::take(&mut template.events);
    template.fragment = true;
    let base = template.encoded_len();

    let mut fragments = Vec::new();
    let mut current: Vec<Event> = Vec::new();
    let mut size = base;

    for event in events {
        let len = event.encoded_len();
        if !current.is_empty() && size + len >= limit {
            let mut piece = template.clone();
            piece.events = std::mem::take(&mut current);
            fragments.push(piece);
            size = base;
        }
        size += len;
        current.push(event);
    }

    let mut last = template;
    last.events = current;
    last.fragment = false;
    fragments.push(last);
    fragments
}
