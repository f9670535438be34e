use criterion::{black_box, criterion_group, criterion_main, Criterion};

use treestore::{FileMode, Key, MemoryNodeStore, TreeConfig, TreeStore};

fn sequential_append(c: &mut Criterion) {
    c.bench_function("append 64KiB and commit", |b| {
        b.iter(|| {
            let store = TreeStore::new(MemoryNodeStore::new(), TreeConfig::default()).unwrap();
            let tx = store.transaction();
            let df = tx
                .get_data_file(Key::new(1, 0, 1), FileMode::ReadWrite)
                .unwrap();
            let chunk = [0xa5u8; 1024];
            for _ in 0..64 {
                df.put(&chunk).unwrap();
            }
            black_box(store.commit(tx).unwrap());
        })
    });
}

fn scattered_reads(c: &mut Criterion) {
    let store = TreeStore::new(MemoryNodeStore::new(), TreeConfig::default()).unwrap();
    let tx = store.transaction();
    let df = tx
        .get_data_file(Key::new(1, 0, 1), FileMode::ReadWrite)
        .unwrap();
    for i in 0..256u64 {
        df.write_at(i * 1024, &[i as u8; 1024]).unwrap();
    }
    store.commit(tx).unwrap();

    c.bench_function("read 64 scattered 1KiB blocks", |b| {
        let tx = store.transaction();
        let df = tx
            .get_data_file(Key::new(1, 0, 1), FileMode::ReadOnly)
            .unwrap();
        let mut buf = [0u8; 1024];
        b.iter(|| {
            for i in 0..64u64 {
                let pos = (i * 37 % 255) * 1024;
                df.read_at(pos, &mut buf).unwrap();
                black_box(buf[0]);
            }
        })
    });
}

fn interior_shifts(c: &mut Criterion) {
    c.bench_function("open and close 64 interior gaps", |b| {
        b.iter(|| {
            let store = TreeStore::new(MemoryNodeStore::new(), TreeConfig::default()).unwrap();
            let tx = store.transaction();
            let df = tx
                .get_data_file(Key::new(1, 0, 1), FileMode::ReadWrite)
                .unwrap();
            df.put(&[1u8; 32 * 1024]).unwrap();
            for i in 0..64u64 {
                df.set_position(i * 399).unwrap();
                df.shift(17).unwrap();
            }
            for i in (0..64u64).rev() {
                df.set_position(i * 399 + 17).unwrap();
                df.shift(-17).unwrap();
            }
            black_box(df.size().unwrap());
        })
    });
}

criterion_group!(benches, sequential_append, scattered_reads, interior_shifts);
criterion_main!(benches);
