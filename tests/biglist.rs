use biglist::{BigList, StorageFormat, UPath, DEFAULT_FORMAT};

fn open_i64(root: &std::path::Path) -> BigList<i64> {
    BigList::open(UPath::local(root)).unwrap()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn single_writer_append_iterate() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("numbers");

    let mut list = BigList::new(UPath::local(&root), 100, DEFAULT_FORMAT).unwrap();
    for i in 0..10_023i64 {
        list.append(i).unwrap();
    }
    list.flush().unwrap();
    drop(list);

    let list = open_i64(&root);
    assert_eq!(list.len(), 10_023);
    assert_eq!(list.files().num_files(), 101);

    // 100 full batches plus a partial tail
    let counts = list.files().counts();
    assert!(counts[..100].iter().all(|&c| c == 100));
    assert_eq!(counts[100], 23);

    let sum: i64 = list.iter().map(|item| item.unwrap()).sum();
    assert_eq!(sum, 50_225_253);

    assert_eq!(*list.get(18).unwrap(), 18);
    assert_eq!(*list.get(list.len() - 3).unwrap(), 10_020);
}

#[test]
fn indexed_access_matches_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("xs");

    let mut list = BigList::new(UPath::local(&root), 7, StorageFormat::Json).unwrap();
    list.extend((0..100i64).map(|i| i * 3)).unwrap();
    list.flush().unwrap();

    let streamed: Vec<i64> = list.iter().map(|item| item.unwrap()).collect();
    assert_eq!(streamed.len(), list.len());
    for (i, expected) in streamed.iter().enumerate() {
        assert_eq!(list.get(i).unwrap(), expected);
    }

    let counts = list.files().counts();
    assert_eq!(counts.iter().sum::<usize>(), list.len());
    let cumulative = list.files().cumulative_counts();
    assert!(cumulative.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn concurrent_writers() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("shared");

    // small batches so every writer seals several files
    BigList::<i64>::new(UPath::local(&root), 2, DEFAULT_FORMAT).unwrap();

    let handles: Vec<_> = (0..10i64)
        .map(|i| {
            let root = root.clone();
            std::thread::spawn(move || {
                let mut list: BigList<i64> = BigList::open(UPath::local(&root)).unwrap();
                for j in 0..i {
                    list.append(100 * i + j).unwrap();
                }
                list.flush().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let list = open_i64(&root);
    assert_eq!(list.len(), 45);

    let mut elements: Vec<i64> = list.iter().map(|item| item.unwrap()).collect();

    // each writer's own subsequence keeps its insertion order
    for i in 0..10i64 {
        let per_writer: Vec<i64> = elements
            .iter()
            .copied()
            .filter(|x| x / 100 == i)
            .collect();
        let expected: Vec<i64> = (0..i).map(|j| 100 * i + j).collect();
        assert_eq!(per_writer, expected, "writer {} stream reordered", i);
    }

    // the multiset over all writers is exactly the expected one
    elements.sort();
    let mut expected: Vec<i64> = (0..10i64)
        .flat_map(|i| (0..i).map(move |j| 100 * i + j))
        .collect();
    expected.sort();
    assert_eq!(elements, expected);
}

#[test]
fn orphan_data_files_are_invisible() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("crashy");

    let mut list = BigList::new(UPath::local(&root), 5, DEFAULT_FORMAT).unwrap();
    list.extend(0..12i64).unwrap();
    list.flush().unwrap();
    assert_eq!(list.len(), 12);

    // a writer that died between sealing a data file and publishing it
    // leaves exactly this state behind
    let orphan_bytes = DEFAULT_FORMAT.encode_batch(&[900i64, 901, 902]).unwrap();
    let orphan = UPath::local(&root).joinpath(&format!(
        "store/20200101000000.000000_{}_3.pickle_zstd",
        uuid_like()
    ));
    orphan.write_bytes(&orphan_bytes, false).unwrap();

    let mut list = open_i64(&root);
    assert_eq!(list.len(), 12);
    let all: Vec<i64> = list.iter().map(|item| item.unwrap()).collect();
    assert_eq!(all, (0..12).collect::<Vec<_>>());

    // a later append + flush works and still ignores the orphan
    list.append(12).unwrap();
    list.flush().unwrap();
    assert_eq!(list.len(), 13);
    let all: Vec<i64> = list.iter().map(|item| item.unwrap()).collect();
    assert_eq!(all, (0..13).collect::<Vec<_>>());

    let orphans = list.orphan_files().unwrap();
    assert_eq!(orphans.len(), 1);

    let removed = list.gc().unwrap();
    assert_eq!(removed.len(), 1);
    assert!(list.orphan_files().unwrap().is_empty());
    assert_eq!(list.len(), 13);
}

#[test]
fn reload_is_monotone_across_writers() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("grow");

    let mut writer = BigList::new(UPath::local(&root), 3, DEFAULT_FORMAT).unwrap();
    let mut reader = open_i64(&root);

    let mut last_len = 0;
    for round in 0..5i64 {
        writer.extend(round * 10..round * 10 + 4).unwrap();
        writer.flush().unwrap();

        reader.reload().unwrap();
        assert!(reader.len() >= last_len);
        last_len = reader.len();
    }
    assert_eq!(last_len, 20);
}

fn uuid_like() -> String {
    "0f0e0d0c-0b0a-4908-8706-050403020100".to_string()
}
