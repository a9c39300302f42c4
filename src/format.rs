//! Serializer registry.
//!
//! Each storage format is a named codec turning a batch of elements into one
//! immutable data file and back. The name is what the info manifest records,
//! so it doubles as a cross-language format identifier - `pickle-zstd` files
//! written here stay readable by the Python side and vice versa.
//!
//! Row formats serialize whole batches generically over serde. Columnar
//! formats (parquet, avro) are produced by external systems; the registry
//! decodes them into rows but refuses to encode without a column schema.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Default format for newly created stores.
pub const DEFAULT_FORMAT: StorageFormat = StorageFormat::PickleZstd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// One batch of elements per file; written and read by BigList.
    Row,
    /// Schema-carrying files read through ExternalBigList.
    Columnar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageFormat {
    Pickle,
    PickleZstd,
    PickleZlib,
    Json,
    JsonZstd,
    JsonZlib,
    Orjson,
    NdJson,
    NdJsonZstd,
    Csv,
    Parquet,
    Avro,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Zstd,
    Zlib,
}

const ZSTD_LEVEL: i32 = 3;

impl StorageFormat {
    pub fn all() -> &'static [StorageFormat] {
        use StorageFormat::*;
        &[
            Pickle, PickleZstd, PickleZlib, Json, JsonZstd, JsonZlib, Orjson, NdJson, NdJsonZstd,
            Csv, Parquet, Avro,
        ]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|f| f.name() == name)
    }

    pub fn name(self) -> &'static str {
        use StorageFormat::*;
        match self {
            Pickle => "pickle",
            PickleZstd => "pickle-zstd",
            PickleZlib => "pickle-zlib",
            Json => "json",
            JsonZstd => "json-zstd",
            JsonZlib => "json-zlib",
            Orjson => "orjson",
            NdJson => "newline-delimited-json",
            NdJsonZstd => "newline-delimited-json-zstd",
            Csv => "csv",
            Parquet => "parquet",
            Avro => "avro",
        }
    }

    /// Data file extension, without the leading dot.
    pub fn extension(self) -> &'static str {
        use StorageFormat::*;
        match self {
            Pickle => "pickle",
            PickleZstd => "pickle_zstd",
            PickleZlib => "pickle_zlib",
            Json => "json",
            JsonZstd => "json_zstd",
            JsonZlib => "json_zlib",
            Orjson => "orjson",
            NdJson => "ndjson",
            NdJsonZstd => "ndjson_zstd",
            Csv => "csv",
            Parquet => "parquet",
            Avro => "avro",
        }
    }

    pub fn kind(self) -> FormatKind {
        use StorageFormat::*;
        match self {
            Parquet | Avro => FormatKind::Columnar,
            _ => FormatKind::Row,
        }
    }

    pub fn is_columnar(self) -> bool {
        self.kind() == FormatKind::Columnar
    }

    fn compression(self) -> Compression {
        use StorageFormat::*;
        match self {
            PickleZstd | JsonZstd | NdJsonZstd => Compression::Zstd,
            PickleZlib | JsonZlib => Compression::Zlib,
            _ => Compression::None,
        }
    }

    /// Serialize one batch into the bytes of a data file.
    pub fn encode_batch<T: Serialize>(self, batch: &[T]) -> Result<Vec<u8>> {
        use StorageFormat::*;
        let raw = match self {
            Pickle | PickleZstd | PickleZlib => {
                serde_pickle::to_vec(&batch, serde_pickle::SerOptions::new())
                    .map_err(|err| Error::Serde(format!("pickle encode: {}", err)))?
            }
            Json | JsonZstd | JsonZlib | Orjson => serde_json::to_vec(&batch)
                .map_err(|err| Error::Serde(format!("json encode: {}", err)))?,
            NdJson | NdJsonZstd => {
                let mut out = Vec::new();
                for item in batch {
                    serde_json::to_writer(&mut out, item)
                        .map_err(|err| Error::Serde(format!("ndjson encode: {}", err)))?;
                    out.push(b'\n');
                }
                out
            }
            Csv => {
                let mut wtr = csv::WriterBuilder::new().from_writer(Vec::new());
                for item in batch {
                    wtr.serialize(item).map_err(csv_error)?;
                }
                wtr.into_inner()
                    .map_err(|err| Error::Serde(format!("csv encode: {}", err)))?
            }
            Parquet | Avro => {
                return Err(Error::Format(format!(
                    "'{}' requires a column schema and cannot be written by the row-level \
                     registry; produce the files externally and read them via ExternalBigList",
                    self.name()
                )));
            }
        };
        compress(self.compression(), raw)
    }

    /// Decode the bytes of a data file back into a batch.
    pub fn decode_batch<T: DeserializeOwned>(self, data: &[u8]) -> Result<Vec<T>> {
        use StorageFormat::*;
        let raw = decompress(self.compression(), data)?;
        match self {
            Pickle | PickleZstd | PickleZlib => {
                serde_pickle::from_slice(&raw, serde_pickle::DeOptions::new())
                    .map_err(|err| Error::Serde(format!("pickle decode: {}", err)))
            }
            Json | JsonZstd | JsonZlib | Orjson => serde_json::from_slice(&raw)
                .map_err(|err| Error::Serde(format!("json decode: {}", err))),
            NdJson | NdJsonZstd => raw
                .split(|&b| b == b'\n')
                .filter(|line| !line.is_empty())
                .map(|line| {
                    serde_json::from_slice(line)
                        .map_err(|err| Error::Serde(format!("ndjson decode: {}", err)))
                })
                .collect(),
            Csv => {
                let mut rdr = csv::ReaderBuilder::new().from_reader(raw.as_slice());
                rdr.deserialize()
                    .map(|row| row.map_err(csv_error))
                    .collect()
            }
            Parquet => decode_parquet_rows(&raw),
            Avro => decode_avro_rows(&raw),
        }
    }
}

impl std::fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for StorageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StorageFormat::from_name(s)
            .ok_or_else(|| Error::CorruptManifest(format!("unknown storage format '{}'", s)))
    }
}

/// Classify a csv-crate failure. The csv codec holds flat records only;
/// an element with nested containers is a misuse of the format, not a
/// serialization plumbing failure.
fn csv_error(err: csv::Error) -> Error {
    match err.kind() {
        csv::ErrorKind::Serialize(reason) => Error::Format(format!(
            "csv holds flat records only: {}",
            reason
        )),
        csv::ErrorKind::Deserialize { err: de, .. }
            if matches!(de.kind(), csv::DeserializeErrorKind::Unsupported(_)) =>
        {
            Error::Format(format!("csv holds flat records only: {}", de))
        }
        _ => Error::Serde(format!("csv: {}", err)),
    }
}

fn compress(compression: Compression, raw: Vec<u8>) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(raw),
        Compression::Zstd => zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)
            .map_err(|err| Error::Serde(format!("zstd encode: {}", err))),
        Compression::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(&raw)
                .and_then(|_| encoder.finish())
                .map_err(|err| Error::Serde(format!("zlib encode: {}", err)))
        }
    }
}

fn decompress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Zstd => zstd::decode_all(data)
            .map_err(|err| Error::Serde(format!("zstd decode: {}", err))),
        Compression::Zlib => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|err| Error::Serde(format!("zlib decode: {}", err)))?;
            Ok(out)
        }
    }
}

/// Reassemble parquet rows generically: each row becomes a JSON object that
/// is then deserialized into the element type.
fn decode_parquet_rows<T: DeserializeOwned>(data: &[u8]) -> Result<Vec<T>> {
    use parquet::file::reader::FileReader as _;

    let bytes = bytes::Bytes::from(data.to_vec());
    let reader = parquet::file::reader::SerializedFileReader::new(bytes)
        .map_err(|err| Error::Serde(format!("parquet open: {}", err)))?;
    let mut out = Vec::new();
    let rows = reader
        .get_row_iter(None)
        .map_err(|err| Error::Serde(format!("parquet rows: {}", err)))?;
    for row in rows {
        let row = row.map_err(|err| Error::Serde(format!("parquet row: {}", err)))?;
        let value = row.to_json_value();
        out.push(
            serde_json::from_value(value)
                .map_err(|err| Error::Serde(format!("parquet row decode: {}", err)))?,
        );
    }
    Ok(out)
}

fn decode_avro_rows<T: DeserializeOwned>(data: &[u8]) -> Result<Vec<T>> {
    let reader = apache_avro::Reader::new(data)
        .map_err(|err| Error::Serde(format!("avro open: {}", err)))?;
    let mut out = Vec::new();
    for value in reader {
        let value = value.map_err(|err| Error::Serde(format!("avro record: {}", err)))?;
        out.push(
            apache_avro::from_value(&value)
                .map_err(|err| Error::Serde(format!("avro record decode: {}", err)))?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn registry_names_are_unique_and_resolvable() {
        for format in StorageFormat::all() {
            assert_eq!(StorageFormat::from_name(format.name()), Some(*format));
        }
        let mut names: Vec<_> = StorageFormat::all().iter().map(|f| f.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), StorageFormat::all().len());
    }

    #[test]
    fn default_format_roundtrip() {
        let batch: Vec<i64> = (0..1000).collect();
        let bytes = DEFAULT_FORMAT.encode_batch(&batch).unwrap();
        let back: Vec<i64> = DEFAULT_FORMAT.decode_batch(&bytes).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn ndjson_ignores_trailing_newline() {
        let batch = vec!["a".to_string(), "b".to_string()];
        let bytes = StorageFormat::NdJson.encode_batch(&batch).unwrap();
        assert!(bytes.ends_with(b"\n"));
        let back: Vec<String> = StorageFormat::NdJson.decode_batch(&bytes).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn csv_roundtrips_flat_records() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Rec {
            make: String,
            sales: i64,
        }
        let batch = vec![
            Rec { make: "ford".into(), sales: 3 },
            Rec { make: "honda".into(), sales: 7 },
        ];
        let bytes = StorageFormat::Csv.encode_batch(&batch).unwrap();
        let back: Vec<Rec> = StorageFormat::Csv.decode_batch(&bytes).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn csv_rejects_nested_elements() {
        #[derive(Serialize)]
        struct Rec {
            make: String,
            dealers: Vec<String>,
        }
        let batch = vec![Rec {
            make: "ford".into(),
            dealers: vec!["north".into(), "south".into()],
        }];
        assert!(matches!(
            StorageFormat::Csv.encode_batch(&batch),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn zstd_wrapping_actually_compresses() {
        let batch: Vec<String> = std::iter::repeat("same old value".to_string())
            .take(500)
            .collect();
        let plain = StorageFormat::Json.encode_batch(&batch).unwrap();
        let packed = StorageFormat::JsonZstd.encode_batch(&batch).unwrap();
        assert!(packed.len() < plain.len() / 4);
        let back: Vec<String> = StorageFormat::JsonZstd.decode_batch(&packed).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn columnar_formats_refuse_row_encoding() {
        let batch = vec![1i64];
        assert!(matches!(
            StorageFormat::Parquet.encode_batch(&batch),
            Err(Error::Format(_))
        ));
        assert!(matches!(
            StorageFormat::Avro.encode_batch(&batch),
            Err(Error::Format(_))
        ));
    }
}
