// Readers racing a writer that inserts and merges, and a background merge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tessera_core::error::TesseraResult;
use tessera_core::{Field, FieldType, MemoryBackend, Query, Row, Schema, Table, TableOptions, Value};

const PACK_SIZE: usize = 8;
const BATCHES: u64 = 40;
const BATCH: u64 = 5;

fn table() -> Table {
    let schema = Schema::new(
        "feed",
        vec![Field::pk("id"), Field::new("seq", FieldType::U64)],
    )
    .unwrap();
    let opts = TableOptions::new()
        .with_pack_size(PACK_SIZE)
        .with_journal_size(16);
    Table::create(Arc::new(MemoryBackend::new()), schema, opts).unwrap()
}

fn batch(t: &Table, first: u64) -> Vec<u8> {
    let rows: Vec<Row> = (first..first + BATCH)
        .map(|i| vec![Value::U64(0), Value::U64(i)])
        .collect();
    t.schema().encode_rows(&rows).unwrap()
}

/// Pack ranges in range order must be sorted, disjoint and within capacity.
fn check_ranges(t: &Table) {
    let stats = t.stats();
    let mut last_max = 0u64;
    for p in stats.iter_by_range() {
        assert!(p.n_values > 0 && p.n_values <= PACK_SIZE);
        assert!(p.min_pk <= p.max_pk);
        assert!(p.min_pk > last_max, "pack ranges overlap at {}", p.min_pk);
        last_max = p.max_pk;
    }
}

fn reader(t: &Table, done: &AtomicBool) -> usize {
    let mut seen = 0usize;
    let mut rounds = 0usize;
    loop {
        let finished = done.load(Ordering::SeqCst);
        check_ranges(t);

        let rows = t.query(&Query::all()).unwrap();
        let pks: Vec<u64> = rows.iter().filter_map(|r| r[0].as_u64()).collect();
        assert!(pks.windows(2).all(|w| w[0] < w[1]), "unsorted scan");
        // rows only ever get added, so the visible prefix only grows
        assert!(pks.len() >= seen, "rows vanished: {} < {seen}", pks.len());
        assert_eq!(pks, (1..=pks.len() as u64).collect::<Vec<_>>());
        seen = pks.len();

        if let Some(&last) = pks.last() {
            let row = t.lookup(last).unwrap().expect("visible row");
            assert_eq!(row[1].as_u64(), Some(last - 1));
            assert_eq!(t.lookup_pks(&[last, 1]).unwrap().len(), 2);
        }
        rounds += 1;
        if finished {
            return rounds;
        }
    }
}

#[test]
fn test_readers_see_consistent_packs_during_merges() -> TesseraResult<()> {
    let t = table();
    let done = AtomicBool::new(false);

    thread::scope(|s| -> TesseraResult<()> {
        let readers: Vec<_> = (0..3).map(|_| s.spawn(|| reader(&t, &done))).collect();

        let written = (|| -> TesseraResult<()> {
            for b in 0..BATCHES {
                t.insert(&batch(&t, b * BATCH))?;
                if b % 7 == 6 {
                    t.flush()?;
                }
            }
            t.flush()?;
            Ok(())
        })();
        done.store(true, Ordering::SeqCst);

        for r in readers {
            assert!(r.join().expect("reader panicked") > 0);
        }
        written
    })?;

    let total = BATCHES * BATCH;
    assert_eq!(t.count(), total);
    assert_eq!(t.query(&Query::all())?.len() as u64, total);
    check_ranges(&t);
    Ok(())
}

#[test]
fn test_background_merge_with_readers() -> TesseraResult<()> {
    let t = Arc::new(table());
    for b in 0..3 {
        t.insert(&batch(&t, b * BATCH))?;
    }

    let task = t.spawn_merge()?.expect("journal has rows");
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let t = Arc::clone(&t);
            thread::spawn(move || {
                for _ in 0..50 {
                    let rows = t.query(&Query::all()).unwrap();
                    assert_eq!(rows.len() as u64, 3 * BATCH);
                    check_ranges(&t);
                }
            })
        })
        .collect();

    let summary = task.wait()?;
    assert_eq!(summary.inserted as u64, 3 * BATCH);
    for r in readers {
        r.join().expect("reader panicked");
    }
    assert_eq!(t.journal_len(), 0);
    check_ranges(&t);
    Ok(())
}
