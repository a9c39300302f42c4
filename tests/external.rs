use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde_json::json;

use biglist::{ExternalBigList, StorageFormat, UPath};

const ROW_GROUP_SIZE: usize = 10;

/// One file of car sales: `make` repeated, `sales` counting up from `base`.
fn write_cars(path: &std::path::Path, make: &str, rows: usize, base: i64) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("make", DataType::Utf8, false),
        Field::new("sales", DataType::Int64, false),
    ]));
    let makes = StringArray::from(vec![make; rows]);
    let sales = Int64Array::from((0..rows as i64).map(|i| base + i).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(makes) as ArrayRef, Arc::new(sales) as ArrayRef],
    )
    .unwrap();

    let props = WriterProperties::builder()
        .set_max_row_group_size(ROW_GROUP_SIZE)
        .build();
    let file = std::fs::File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props)).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

fn car_fixture(dir: &std::path::Path) -> (UPath, UPath) {
    let data_root = dir.join("cars");
    std::fs::create_dir_all(&data_root).unwrap();
    write_cars(&data_root.join("ford.parquet"), "ford", 61, 234);
    write_cars(&data_root.join("honda.parquet"), "honda", 51, 500);
    (UPath::local(dir.join("index")), UPath::local(data_root))
}

#[test]
fn two_parquet_files() {
    let dir = tempfile::tempdir().unwrap();
    let (index, data_root) = car_fixture(dir.path());

    let list = ExternalBigList::new(index.clone(), data_root, StorageFormat::Parquet).unwrap();
    assert_eq!(list.len(), 112);
    assert_eq!(list.num_files(), 2);

    // lex order of relative paths: ford before honda
    assert_eq!(list.info().data_files_info[0].path(), "ford.parquet");
    assert_eq!(list.info().data_files_info[1].path(), "honda.parquet");

    assert_eq!(list.files()[0].num_row_groups().unwrap(), 7);
    assert_eq!(list.files()[1].num_row_groups().unwrap(), 6);
    assert_eq!(list.files()[0].len().unwrap(), 61);

    let makes: Vec<String> = list
        .iter()
        .map(|row| row.unwrap()["make"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(makes.len(), 112);
    assert!(makes[..61].iter().all(|m| m == "ford"));
    assert!(makes[61..].iter().all(|m| m == "honda"));

    // indexed access agrees with iteration order across the file boundary
    assert_eq!(list.get(0).unwrap()["make"], json!("ford"));
    assert_eq!(list.get(60).unwrap()["sales"], json!(294));
    assert_eq!(list.get(61).unwrap()["make"], json!("honda"));
    assert_eq!(list.get(111).unwrap()["sales"], json!(550));
}

#[test]
fn reopen_uses_persisted_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _data_root) = car_fixture(dir.path());

    {
        let _list =
            ExternalBigList::new(index.clone(), _data_root.clone(), StorageFormat::Parquet)
                .unwrap();
    }

    let list = ExternalBigList::open(index).unwrap();
    assert_eq!(list.len(), 112);
    assert_eq!(list.get(5).unwrap()["make"], json!("ford"));
}

#[test]
fn reload_picks_up_new_files() {
    let dir = tempfile::tempdir().unwrap();
    let (index, data_root) = car_fixture(dir.path());

    let mut list =
        ExternalBigList::new(index, data_root.clone(), StorageFormat::Parquet).unwrap();
    assert_eq!(list.len(), 112);

    let root = match &data_root {
        UPath::Local(p) => p.clone(),
        _ => unreachable!(),
    };
    write_cars(&root.join("bmw.parquet"), "bmw", 10, 100);

    list.reload().unwrap();
    assert_eq!(list.len(), 122);
    // "bmw.parquet" sorts first, so the sequence now starts with bmw rows
    assert_eq!(list.get(0).unwrap()["make"], json!("bmw"));
    assert_eq!(list.get(10).unwrap()["make"], json!("ford"));
}

#[test]
fn row_groups_load_individually() {
    let dir = tempfile::tempdir().unwrap();
    let (index, data_root) = car_fixture(dir.path());

    let list = ExternalBigList::new(index, data_root, StorageFormat::Parquet).unwrap();
    let ford = &list.files()[0];

    let group = ford.row_group(6).unwrap();
    assert_eq!(group.len(), 1); // 61 rows at 10 per group leave a tail of 1
    assert_eq!(group[0]["sales"], json!(294));

    let group = ford.row_group(2).unwrap();
    assert_eq!(group.len(), 10);
    let sales: Vec<i64> = group.iter().map(|r| r["sales"].as_i64().unwrap()).collect();
    assert_eq!(sales, (254..264).collect::<Vec<_>>());
}

#[test]
fn iter_batches_rebatches_across_row_groups() {
    let dir = tempfile::tempdir().unwrap();
    let (index, data_root) = car_fixture(dir.path());

    let list = ExternalBigList::new(index, data_root, StorageFormat::Parquet).unwrap();
    let ford = &list.files()[0];

    let batches: Vec<_> = ford
        .iter_batches(25)
        .map(|batch| batch.unwrap())
        .collect();
    assert_eq!(
        batches.iter().map(|b| b.len()).collect::<Vec<_>>(),
        vec![25, 25, 11]
    );
    assert_eq!(batches[0][0]["sales"], json!(234));
    assert_eq!(batches[2][10]["sales"], json!(294));
}

#[test]
fn single_column_projection_yields_scalars() {
    let dir = tempfile::tempdir().unwrap();
    let (index, data_root) = car_fixture(dir.path());

    let list = ExternalBigList::new(index, data_root, StorageFormat::Parquet).unwrap();
    let ford = &list.files()[0];

    let sales = ford.columns(&["sales"]);
    assert_eq!(sales.get(3).unwrap(), &json!(237));
    assert_eq!(sales.row_group(0).unwrap()[3], json!(237));

    // two columns still come back as mappings
    let both = ford.columns(&["make", "sales"]);
    assert_eq!(both.get(3).unwrap(), &json!({"make": "ford", "sales": 237}));

    // whole-column extraction
    let column = ford.column("sales").unwrap();
    assert_eq!(column.len(), 61);
    assert_eq!(column[0], json!(234));
    assert_eq!(column[60], json!(294));
}

#[test]
fn unknown_column_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (index, data_root) = car_fixture(dir.path());

    let list = ExternalBigList::new(index, data_root, StorageFormat::Parquet).unwrap();
    let ford = &list.files()[0];
    assert!(matches!(
        ford.columns(&["colour"]).row_group(0),
        Err(biglist::Error::NotFound(_))
    ));
}

#[test]
fn row_formats_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (index, data_root) = car_fixture(dir.path());
    assert!(matches!(
        ExternalBigList::new(index, data_root, StorageFormat::Json),
        Err(biglist::Error::Format(_))
    ));
}
