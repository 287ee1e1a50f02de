use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use chrono::{TimeZone, Utc};
use encore_flightparser::header::HEADER_SIZE;
use encore_flightparser::testutil::{ChunkWriter, TypeDef};
use encore_flightstream::{EventStream, RecordedEvent, StreamOptions, Value};

const LONG: u64 = 1;
const STRING: u64 = 2;
const INT: u64 = 3;
const SAMPLE: u64 = 10;
const MARKER: u64 = 11;

// One tick per millisecond, tick 100 is at 1s.
const START_NANOS: i64 = 1_000_000_000;
const START_TICKS: i64 = 100;
const TPS: i64 = 1_000;

const WAIT: Duration = Duration::from_secs(10);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn types() -> Vec<TypeDef> {
    vec![
        TypeDef::new(LONG, "long"),
        TypeDef::new(STRING, "java.lang.String"),
        TypeDef::new(INT, "int"),
        TypeDef::event(SAMPLE, "demo.Sample")
            .field("startTime", LONG)
            .field("duration", LONG)
            .field("count", INT),
        TypeDef::event(MARKER, "demo.Marker")
            .field("startTime", LONG)
            .field("label", STRING),
    ]
}

fn chunk(start_nanos: i64, start_ticks: i64) -> ChunkWriter {
    let mut w = ChunkWriter::new(start_nanos, start_ticks, TPS);
    w.metadata(1, &types());
    w
}

fn sample(w: &mut ChunkWriter, start: i64, duration: i64, count: i32) {
    w.event(SAMPLE, |b| {
        b.long(start);
        b.long(duration);
        b.int(count);
    });
}

fn marker(w: &mut ChunkWriter, start: i64, label: &str) {
    w.event(MARKER, |b| {
        b.long(start);
        b.string(Some(label));
    });
}

fn write_recording(dir: &TempDir, chunks: &[&ChunkWriter]) -> PathBuf {
    let data: Vec<u8> = chunks.iter().flat_map(|c| c.bytes()).collect();
    let file = dir.child("recording.jfr");
    file.write_binary(&data).unwrap();
    file.path().to_path_buf()
}

type Seen = Arc<Mutex<Vec<(String, i64)>>>;

/// Records the name and end time of every delivered event.
fn collect(stream: &EventStream) -> Seen {
    let seen: Seen = Arc::default();
    let out = Arc::clone(&seen);
    stream.on_any_event(move |e| {
        out.lock().unwrap().push((e.name().to_string(), e.end_nanos));
        Ok(())
    });
    seen
}

fn names(seen: &Seen) -> Vec<String> {
    seen.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
}

fn ends(seen: &Seen) -> Vec<i64> {
    seen.lock().unwrap().iter().map(|(_, t)| *t).collect()
}

fn ms(ticks: i64) -> i64 {
    START_NANOS + (ticks - START_TICKS) * 1_000_000
}

#[test]
fn test_unordered_delivers_in_file_order() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    sample(&mut w, 150, 50, 1);
    marker(&mut w, 160, "a");
    sample(&mut w, 170, 5, 2);
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = EventStream::open_file(&path).unwrap();
    stream.set_ordered(false).unwrap();
    let seen = collect(&stream);
    stream.start().unwrap();

    assert_eq!(ends(&seen), vec![ms(200), ms(160), ms(175)]);
}

#[test]
fn test_ordered_delivers_sorted_by_end_time() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    sample(&mut w, 150, 50, 1);
    marker(&mut w, 175, "tie");
    marker(&mut w, 160, "a");
    sample(&mut w, 170, 5, 2);
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = EventStream::open_file(&path).unwrap();
    let seen = collect(&stream);
    stream.start().unwrap();

    assert_eq!(ends(&seen), vec![ms(160), ms(175), ms(175), ms(200)]);
    // Equal end times are ordered by type id.
    assert_eq!(names(&seen)[1..3], ["demo.Sample", "demo.Marker"]);
}

#[test]
fn test_ordered_sorts_within_flush_segments() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    marker(&mut w, 190, "late");
    marker(&mut w, 180, "early");
    w.checkpoint(true, |_| {});
    marker(&mut w, 150, "next segment");
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = EventStream::open_file(&path).unwrap();
    let seen = collect(&stream);
    let flushes = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        let flushes = Arc::clone(&flushes);
        stream.on_flush(move || {
            flushes.lock().unwrap().push(seen.lock().unwrap().len());
            Ok(())
        });
    }
    stream.start().unwrap();

    assert_eq!(ends(&seen), vec![ms(180), ms(190), ms(150)]);
    assert_eq!(*flushes.lock().unwrap(), vec![2, 3]);
}

#[test]
fn test_two_chunk_file_with_tick_conversion() {
    let dir = TempDir::new().unwrap();
    let mut first = chunk(START_NANOS, START_TICKS);
    sample(&mut first, 150, 5, 1);
    first.finish();
    let mut second = chunk(5_000_000_000, 10_000);
    sample(&mut second, 10_250, 10, 2);
    second.finish();
    second.final_chunk();
    let path = write_recording(&dir, &[&first, &second]);

    let stream = EventStream::open_file(&path).unwrap();
    let counts = Arc::new(Mutex::new(Vec::new()));
    {
        let counts = Arc::clone(&counts);
        stream.on_event("demo.Sample", move |e| {
            let count = match e.field("count") {
                Some(Value::Int(c)) => *c,
                other => anyhow::bail!("unexpected count {:?}", other),
            };
            counts
                .lock()
                .unwrap()
                .push((count, e.start_nanos, e.end_nanos));
            Ok(())
        });
    }
    stream.start().unwrap();

    assert_eq!(
        *counts.lock().unwrap(),
        vec![
            (1, 1_050_000_000, 1_055_000_000),
            (2, 5_250_000_000, 5_260_000_000),
        ]
    );
}

#[test]
fn test_named_handlers_and_thresholds() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    sample(&mut w, 150, 9, 1);
    sample(&mut w, 160, 10, 2);
    marker(&mut w, 170, "ignored");
    sample(&mut w, 180, 11, 3);
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = EventStream::open_file(&path).unwrap();
    stream
        .set_threshold("demo.Sample", Duration::from_millis(10))
        .unwrap();
    let counts = Arc::new(Mutex::new(Vec::new()));
    {
        let counts = Arc::clone(&counts);
        stream.on_event("demo.Sample", move |e: &RecordedEvent| {
            counts.lock().unwrap().push(e.field("count").cloned());
            Ok(())
        });
    }
    stream.start().unwrap();

    assert_eq!(
        *counts.lock().unwrap(),
        vec![Some(Value::Int(2)), Some(Value::Int(3))]
    );
}

#[test]
fn test_time_window_is_inclusive() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    for tick in [149, 150, 160, 170, 171] {
        marker(&mut w, tick, "m");
    }
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = EventStream::open_file(&path).unwrap();
    stream.set_ordered(false).unwrap();
    stream
        .set_start_time(Utc.timestamp_nanos(ms(150)))
        .unwrap();
    stream.set_end_time(Utc.timestamp_nanos(ms(170))).unwrap();
    let seen = collect(&stream);
    stream.start().unwrap();

    assert_eq!(ends(&seen), vec![ms(150), ms(160), ms(170)]);
}

#[test]
fn test_options_configure_stream() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    sample(&mut w, 150, 50, 1);
    sample(&mut w, 160, 1, 2);
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let opts = StreamOptions::from_json(
        r#"{"ordered": false, "thresholds": {"demo.Sample": 2}}"#,
    )
    .unwrap();
    let stream = EventStream::open_file(&path).unwrap();
    stream.with_options(&opts).unwrap();
    let seen = collect(&stream);
    stream.start().unwrap();

    assert_eq!(ends(&seen), vec![ms(200)]);
}

#[test]
fn test_handler_errors_do_not_stop_the_stream() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    marker(&mut w, 150, "bad");
    marker(&mut w, 160, "good");
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = EventStream::open_file(&path).unwrap();
    stream.set_ordered(false).unwrap();
    stream.on_event("demo.Marker", |e| {
        match e.field("label").and_then(Value::as_str) {
            Some("bad") => anyhow::bail!("bad marker"),
            _ => Ok(()),
        }
    });
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        stream.on_error(move |err| errors.lock().unwrap().push(format!("{:#}", err)));
    }
    let seen = collect(&stream);
    stream.start().unwrap();

    assert_eq!(
        *errors.lock().unwrap(),
        vec!["handling demo.Marker: bad marker"]
    );
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn test_metadata_handlers_fire_per_generation() {
    let dir = TempDir::new().unwrap();
    let mut first = chunk(START_NANOS, START_TICKS);
    marker(&mut first, 150, "a");
    first.finish();
    let mut second = chunk(2_000_000_000, 1_100);
    marker(&mut second, 1_150, "b");
    second.finish();
    let mut third = ChunkWriter::new(3_000_000_000, 2_100, TPS);
    let mut changed = types();
    changed.retain(|t| t.id != SAMPLE);
    third.metadata(2, &changed);
    marker(&mut third, 2_150, "c");
    third.finish();
    let path = write_recording(&dir, &[&first, &second, &third]);

    let stream = EventStream::open_file(&path).unwrap();
    let generations = Arc::new(Mutex::new(Vec::new()));
    {
        let generations = Arc::clone(&generations);
        stream.on_metadata(move |md| {
            let added: Vec<_> = md.added.iter().map(|t| t.name.clone()).collect();
            let removed: Vec<_> = md.removed.iter().map(|t| t.name.clone()).collect();
            generations
                .lock()
                .unwrap()
                .push((md.metadata.id(), added, removed));
            Ok(())
        });
    }
    let seen = collect(&stream);
    stream.start().unwrap();

    assert_eq!(seen.lock().unwrap().len(), 3);
    let generations = generations.lock().unwrap();
    assert_eq!(generations.len(), 2);
    assert_eq!(generations[0].0, 1);
    assert_eq!(generations[0].1, vec!["demo.Sample", "demo.Marker"]);
    assert_eq!(
        generations[1],
        (2, vec![], vec!["demo.Sample".to_string()])
    );
}

#[test]
fn test_handlers_added_while_running() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    marker(&mut w, 150, "first");
    marker(&mut w, 160, "second");
    marker(&mut w, 170, "third");
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = Arc::new(EventStream::open_file(&path).unwrap());
    stream.set_ordered(false).unwrap();
    let late = Arc::new(Mutex::new(Vec::new()));
    {
        let weak: Weak<EventStream> = Arc::downgrade(&stream);
        let late = Arc::clone(&late);
        let added = Mutex::new(false);
        stream.on_event("demo.Marker", move |_| {
            let mut added = added.lock().unwrap();
            if !*added {
                *added = true;
                let late = Arc::clone(&late);
                if let Some(stream) = weak.upgrade() {
                    stream.on_any_event(move |e| {
                        let label = e.field("label").and_then(Value::as_str);
                        late.lock().unwrap().push(label.map(str::to_string));
                        Ok(())
                    });
                }
            }
            Ok(())
        });
    }
    stream.start().unwrap();

    assert_eq!(
        *late.lock().unwrap(),
        vec![Some("second".to_string()), Some("third".to_string())]
    );
}

#[test]
fn test_close_from_handler_stops_stream() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    for tick in 150..160 {
        marker(&mut w, tick, "m");
    }
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = Arc::new(EventStream::open_file(&path).unwrap());
    stream.set_ordered(false).unwrap();
    let seen = collect(&stream);
    {
        let weak = Arc::downgrade(&stream);
        let seen = Arc::clone(&seen);
        stream.on_any_event(move |_| {
            if seen.lock().unwrap().len() == 3 {
                if let Some(stream) = weak.upgrade() {
                    stream.close();
                }
            }
            Ok(())
        });
    }
    stream.start().unwrap();

    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[test]
fn test_panicking_handler_does_not_stop_the_stream() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    marker(&mut w, 150, "bad");
    marker(&mut w, 160, "good");
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = EventStream::open_file(&path).unwrap();
    stream.set_ordered(false).unwrap();
    stream.on_event("demo.Marker", |e: &RecordedEvent| -> anyhow::Result<()> {
        if e.field("label").and_then(Value::as_str) == Some("bad") {
            panic!("cannot handle marker");
        }
        Ok(())
    });
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        stream.on_error(move |err| errors.lock().unwrap().push(format!("{:#}", err)));
    }
    let seen = collect(&stream);
    stream.start().unwrap();

    assert_eq!(
        *errors.lock().unwrap(),
        vec!["handling demo.Marker: handler panicked: cannot handle marker"]
    );
    assert_eq!(ends(&seen), vec![ms(150), ms(160)]);
}

#[test]
fn test_ordered_close_delivers_buffered_segment() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    marker(&mut w, 170, "c");
    marker(&mut w, 150, "a");
    marker(&mut w, 160, "b");
    w.checkpoint(true, |_| {});
    marker(&mut w, 180, "later");
    w.finish();
    let path = write_recording(&dir, &[&w]);

    let stream = Arc::new(EventStream::open_file(&path).unwrap());
    let seen = collect(&stream);
    {
        let weak = Arc::downgrade(&stream);
        stream.on_any_event(move |_| {
            if let Some(stream) = weak.upgrade() {
                stream.close();
            }
            Ok(())
        });
    }
    stream.start().unwrap();

    // The whole first segment was decoded before the close.
    assert_eq!(ends(&seen), vec![ms(150), ms(160), ms(170)]);
}

#[test]
fn test_chunks_before_window_are_not_decoded() {
    let dir = TempDir::new().unwrap();
    let mut first = chunk(START_NANOS, START_TICKS);
    marker(&mut first, 150, "early");
    // A record that fails to decode if the chunk is read.
    first.raw(&[0, 10]);
    first.duration(1_000_000_000);
    first.finish();
    let mut second = chunk(5_000_000_000, 10_000);
    marker(&mut second, 10_250, "late");
    second.duration(1_000_000_000);
    second.finish();
    second.final_chunk();
    let path = write_recording(&dir, &[&first, &second]);

    let stream = EventStream::open_file(&path).unwrap();
    stream
        .set_start_time(Utc.timestamp_nanos(4_000_000_000))
        .unwrap();
    let seen = collect(&stream);
    stream.start().unwrap();

    assert_eq!(ends(&seen), vec![5_250_000_000]);
}

/// Grows a chunk file in place the way a recorder does: new records are
/// appended before the header is rewritten to cover them.
struct LiveFile {
    path: PathBuf,
    written: usize,
}

impl LiveFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            written: 0,
        }
    }

    fn sync(&mut self, w: &ChunkWriter) {
        let bytes = w.bytes();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .unwrap();
        let tail = self.written.max(HEADER_SIZE as usize);
        file.seek(SeekFrom::Start(tail as u64)).unwrap();
        file.write_all(&bytes[tail..]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&bytes[..HEADER_SIZE as usize]).unwrap();
        file.flush().unwrap();
        self.written = bytes.len();
    }
}

#[test]
fn test_live_directory_follows_new_chunks() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let mut first = chunk(START_NANOS, START_TICKS);
    marker(&mut first, 150, "one");
    let mut live = LiveFile::new(&dir.path().join("001.jfr"));
    live.sync(&first);

    let stream = EventStream::open_directory(dir.path()).unwrap();
    stream.set_ordered(false).unwrap();
    stream.set_start_time(Utc.timestamp_nanos(0)).unwrap();
    let seen = collect(&stream);
    let (tx, rx) = mpsc::channel();
    {
        let tx = Mutex::new(tx);
        stream.on_event("demo.Marker", move |e| {
            let label = e.field("label").and_then(Value::as_str).unwrap_or("");
            let _ = tx.lock().unwrap().send(label.to_string());
            Ok(())
        });
    }
    stream.start_async().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "one");

    marker(&mut first, 160, "two");
    live.sync(&first);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "two");

    first.duration(1_000_000_000);
    first.finish();
    live.sync(&first);

    let mut second = chunk(2_000_000_000, 1_100);
    marker(&mut second, 1_150, "three");
    second.finish();
    second.final_chunk();
    // Renamed into place so the stream never sees a partial file.
    dir.child("002.tmp").write_binary(&second.bytes()).unwrap();
    std::fs::rename(dir.path().join("002.tmp"), dir.path().join("002.jfr")).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "three");

    assert!(stream.await_termination(Some(WAIT)).unwrap());
    assert_eq!(names(&seen), vec!["demo.Marker"; 3]);
}

#[test]
fn test_live_directory_starts_at_current_end() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    marker(&mut w, 110, "old");
    w.duration(50_000_000);
    let mut live = LiveFile::new(&dir.path().join("001.jfr"));
    live.sync(&w);

    let stream = EventStream::open_directory(dir.path()).unwrap();
    stream.set_ordered(false).unwrap();
    let seen = collect(&stream);
    let (tx, rx) = mpsc::channel();
    {
        let tx = Mutex::new(tx);
        stream.on_metadata(move |_| {
            let _ = tx.lock().unwrap().send(());
            Ok(())
        });
    }
    stream.start_async().unwrap();
    rx.recv_timeout(WAIT).unwrap();

    marker(&mut w, 160, "new");
    w.duration(100_000_000);
    w.finish();
    w.final_chunk();
    live.sync(&w);

    assert!(stream.await_termination(Some(WAIT)).unwrap());
    assert_eq!(ends(&seen), vec![ms(160)]);
}

#[test]
fn test_live_stream_ends_after_window() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    marker(&mut w, 150, "inside");
    marker(&mut w, 250, "outside");
    w.duration(200_000_000);
    w.finish();
    dir.child("001.jfr").write_binary(&w.bytes()).unwrap();

    let stream = EventStream::open_directory(dir.path()).unwrap();
    stream.set_ordered(false).unwrap();
    stream.set_start_time(Utc.timestamp_nanos(0)).unwrap();
    stream.set_end_time(Utc.timestamp_nanos(ms(200))).unwrap();
    let seen = collect(&stream);
    let closed = Arc::new(Mutex::new(false));
    {
        let closed = Arc::clone(&closed);
        stream.on_close(move || *closed.lock().unwrap() = true);
    }
    stream.start_async().unwrap();

    assert!(stream.await_termination(Some(WAIT)).unwrap());
    assert_eq!(ends(&seen), vec![ms(150)]);
    assert!(*closed.lock().unwrap());
}

#[test]
fn test_close_stops_waiting_for_next_chunk() {
    let dir = TempDir::new().unwrap();
    let mut w = chunk(START_NANOS, START_TICKS);
    marker(&mut w, 150, "only");
    w.duration(100_000_000);
    w.finish();
    dir.child("001.jfr").write_binary(&w.bytes()).unwrap();

    let stream = EventStream::open_directory(dir.path()).unwrap();
    stream.set_start_time(Utc.timestamp_nanos(0)).unwrap();
    let seen = collect(&stream);
    stream.start_async().unwrap();

    assert!(!stream
        .await_termination(Some(Duration::from_millis(100)))
        .unwrap());
    stream.close();
    assert!(stream.await_termination(Some(WAIT)).unwrap());
    assert_eq!(ends(&seen), vec![ms(150)]);
}
