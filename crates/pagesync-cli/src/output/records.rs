//! Record serialization

use std::io::Write;

use anyhow::Result;
use pagesync_core::Record;

use crate::cli::RecordFormat;

/// Write `records` to `out` in `format`.
///
/// JSON lines end with a newline per record; JSON is one pretty-printed
/// array followed by a newline.
pub fn write_records<W: Write>(
    out: &mut W,
    records: &[Record],
    format: RecordFormat,
) -> Result<()> {
    match format {
        RecordFormat::Jsonl => {
            for record in records {
                serde_json::to_writer(&mut *out, record)?;
                out.write_all(b"\n")?;
            }
        },
        RecordFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, records)?;
            out.write_all(b"\n")?;
        },
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn records() -> Vec<Record> {
        vec![
            Record::new().with("id", 1).with("name", "a"),
            Record::new().with("id", 2).with("name", "b"),
        ]
    }

    #[test]
    fn test_jsonl_one_object_per_line() {
        let mut out = Vec::new();
        write_records(&mut out, &records(), RecordFormat::Jsonl).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, [r#"{"id":1,"name":"a"}"#, r#"{"id":2,"name":"b"}"#]);
    }

    #[test]
    fn test_json_array() {
        let mut out = Vec::new();
        write_records(&mut out, &records(), RecordFormat::Json).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(2));
        assert_eq!(value[1]["name"], "b");
    }

    #[test]
    fn test_empty_json_is_empty_array() {
        let mut out = Vec::new();
        write_records(&mut out, &[], RecordFormat::Json).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim(), "[]");
    }
}
