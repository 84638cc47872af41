use bytes::Bytes;

use super::fragment::fragment;
use crate::Event;
use crate::KeyValue;
use crate::WatchResponse;

fn put(
    key: &str,
    value_len: usize,
    revision: u64,
) -> Event {
    Event::put(
        KeyValue {
            key: Bytes::from(key.to_string()),
            value: Bytes::from(vec![b'x'; value_len]),
            create_revision: revision,
            mod_revision: revision,
            version: 1,
            lease: 0,
        },
        None,
    )
}

fn batch(
    count: usize,
    value_len: usize,
) -> WatchResponse {
    let events = (0..count).map(|i| put(&format!("k{i:03}"), value_len, 5)).collect();
    WatchResponse::events(3, 5, events)
}

#[test]
fn small_response_is_not_split() {
    let response = batch(3, 10);
    let frames = fragment(response.clone(), 10_000);

    assert_eq!(frames, vec![response]);
}

#[test]
fn single_oversized_event_is_not_split() {
    let response = batch(1, 4096);
    let frames = fragment(response.clone(), 100);

    assert_eq!(frames.len(), 1);
    assert!(!frames[0].fragment);
    assert_eq!(frames[0], response);
}

#[test]
fn oversized_response_reassembles_in_order() {
    let response = batch(10, 100);
    let limit = 500;
    assert!(response.encoded_len() >= limit);

    let frames = fragment(response.clone(), limit);

    assert!(frames.len() > 1);
    let (last, rest) = frames.split_last().unwrap();
    assert!(rest.iter().all(|f| f.fragment));
    assert!(!last.fragment);
    for frame in &frames {
        assert_eq!(frame.watch_id, 3);
        assert_eq!(frame.header_revision, 5);
        assert!(!frame.events.is_empty());
        assert!(frame.encoded_len() < limit);
    }

    let reassembled: Vec<Event> = frames.into_iter().flat_map(|f| f.events).collect();
    assert_eq!(reassembled, response.events);
}

#[test]
fn event_larger_than_the_limit_travels_alone() {
    let mut response = batch(2, 10);
    response.events.insert(1, put("big", 2048, 5));

    let frames = fragment(response.clone(), 512);

    let sizes: Vec<usize> = frames.iter().map(|f| f.events.len()).collect();
    assert_eq!(sizes, vec![1, 1, 1]);
    let reassembled: Vec<Event> = frames.into_iter().flat_map(|f| f.events).collect();
    assert_eq!(reassembled, response.events);
}
