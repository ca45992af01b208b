//! Writer-set membership, change notification, and log classification.

use std::sync::{Arc, Mutex};
use weft::{
    CausalStreamOptions, Event, LogRole, LogStore, MemoryLog, PreconditionError, Weft, WriterId,
    log_role,
};

fn writer(n: u8) -> WriterId {
    WriterId::from_bytes([n; WriterId::SIZE])
}

/// Attaches a recording view and returns the shared event list.
fn record_events(weft: &Weft<MemoryLog>) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    weft.start(move |event: Event| {
        sink.lock().unwrap().push(event);
    })
    .unwrap();
    events
}

#[test]
fn member_batch_commits_atomically_with_one_event() {
    let weft: Weft<MemoryLog> = Weft::new(writer(1));
    let events = record_events(&weft);

    let mut batch = weft.member_batch();
    batch
        .add_writer(writer(1), Arc::new(MemoryLog::new()))
        .add_writer(writer(2), Arc::new(MemoryLog::new()))
        .add_output(writer(9), Arc::new(MemoryLog::new()));
    batch.commit();

    assert_eq!(weft.writers(), vec![writer(1), writer(2)]);
    assert_eq!(weft.outputs(), vec![writer(9)]);
    assert_eq!(weft.writer_set_version(), 1);
    assert_eq!(*events.lock().unwrap(), vec![Event::WritersChanged]);
}

#[test]
fn redundant_changes_do_not_bump_or_notify() {
    let weft: Weft<MemoryLog> = Weft::new(writer(1));
    weft.add_writer(writer(1), Arc::new(MemoryLog::new()));
    let version = weft.writer_set_version();
    let events = record_events(&weft);

    // Adding a writer that is already tracked, and removing ones that are
    // not, are no-ops.
    weft.add_writer(writer(1), Arc::new(MemoryLog::new()));
    weft.remove_writer(writer(5));
    weft.remove_output(writer(5));

    assert_eq!(weft.writer_set_version(), version);
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn removed_writer_disappears_from_resolution_and_merge() {
    let w1 = writer(1);
    let w2 = writer(2);
    let log1 = Arc::new(MemoryLog::new());
    let log2 = Arc::new(MemoryLog::new());

    let weft = Weft::new(w1);
    weft.add_writer(w1, Arc::clone(&log1));
    weft.add_writer(w2, Arc::clone(&log2));
    weft.append(vec![b"mine".to_vec()], None).unwrap();

    let peer = Weft::new(w2);
    peer.add_writer(w1, Arc::clone(&log1));
    peer.add_writer(w2, Arc::clone(&log2));
    peer.append(vec![b"theirs".to_vec()], None).unwrap();

    weft.remove_writer(w2);

    assert!(!weft.latest().unwrap().contains(&w2));
    let nodes: Vec<_> = weft
        .causal_stream(CausalStreamOptions::default())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].writer, w1);
}

#[test]
fn local_appends_are_forwarded_to_the_view() {
    let w1 = writer(1);
    let weft = Weft::new(w1);
    weft.add_writer(w1, Arc::new(MemoryLog::new()));
    let events = record_events(&weft);

    weft.append(vec![b"x".to_vec()], None).unwrap();
    assert_eq!(*events.lock().unwrap(), vec![Event::Appended]);
}

#[test]
fn remote_appends_are_forwarded_to_the_view() {
    let w1 = writer(1);
    let w2 = writer(2);
    let log2 = Arc::new(MemoryLog::new());

    let weft = Weft::new(w1);
    weft.add_writer(w2, Arc::clone(&log2));
    let events = record_events(&weft);

    // Another participant writes to a log this instance merely tracks.
    let peer = Weft::new(w2);
    peer.add_writer(w2, Arc::clone(&log2));
    peer.append(vec![b"remote".to_vec()], None).unwrap();

    assert!(events.lock().unwrap().contains(&Event::Appended));
}

#[test]
fn starting_the_view_twice_is_an_error() {
    let weft: Weft<MemoryLog> = Weft::new(writer(1));
    weft.start(|_: Event| {}).unwrap();
    assert_eq!(
        weft.start(|_: Event| {}),
        Err(PreconditionError::AlreadyStarted)
    );
}

#[test]
fn classification_tolerates_anything() {
    // An empty log is neither kind of log.
    let empty = MemoryLog::new();
    assert_eq!(log_role(&empty), None);

    // A log whose first block is foreign garbage is neither, not an error.
    let garbage = MemoryLog::new();
    garbage
        .append(vec![b"some other application's data".to_vec()])
        .unwrap();
    assert_eq!(log_role(&garbage), None);

    // A log written through the append protocol classifies as a writer log.
    let w1 = writer(1);
    let log = Arc::new(MemoryLog::new());
    let weft = Weft::new(w1);
    weft.add_writer(w1, Arc::clone(&log));
    weft.append(vec![b"real".to_vec()], None).unwrap();
    assert_eq!(log_role(log.as_ref()), Some(LogRole::Writer));
}
