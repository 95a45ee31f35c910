//! On-disk cache files
//!
//! - `cache_mapping.db`: JSON object, device key → master id
//! - `cache_master.db`: one `{"<master id>" : {row}}` entry per line
//! - `cache_alpha_<n>.db`: one `{"<device key>" : {row}}` entry per line
//!
//! The table files are JSON arrays laid out one row per line so they stay
//! greppable. Files are written to a temporary name and renamed into place.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::store::{DeviceKeyRecord, MasterKeyRecord};
use crate::protocol::KeyType;
use crate::types::Result;

pub const MAPPING_FILE: &str = "cache_mapping.db";
pub const MASTER_FILE: &str = "cache_master.db";

pub fn device_table_file(device: usize) -> String {
    format!("cache_alpha_{}.db", device)
}

#[derive(Debug, Serialize, Deserialize)]
struct MasterRow {
    key_type: KeyType,
    flags: u32,
    device_keys: BTreeMap<usize, Uuid>,
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp: PathBuf = path.with_extension("db.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn render_rows<K: ToString, V: Serialize>(rows: impl Iterator<Item = (K, V)>) -> Result<String> {
    let mut lines = Vec::new();
    for (key, value) in rows {
        lines.push(format!(
            " {{\"{}\" : {}}}",
            key.to_string(),
            serde_json::to_string(&value)?
        ));
    }
    Ok(format!("[\r\n{}\r\n]\r\n", lines.join(",\r\n")))
}

/// Older table files end their last row with a comma
fn parse_rows<T: DeserializeOwned>(text: &str) -> Result<Vec<HashMap<Uuid, T>>> {
    let trimmed = text.trim_end();
    let cleaned = match trimmed.strip_suffix(']') {
        Some(body) => format!("{}]", body.trim_end().trim_end_matches(',')),
        None => trimmed.to_string(),
    };
    Ok(serde_json::from_str(&cleaned)?)
}

pub fn write_mapping(dir: &Path, mapping: &BTreeMap<Uuid, Uuid>) -> Result<()> {
    let text = serde_json::to_string_pretty(mapping)?;
    write_atomic(&dir.join(MAPPING_FILE), text.as_bytes())
}

/// Device key → master id, or `None` if no mapping was ever saved
pub fn read_mapping(dir: &Path) -> Result<Option<HashMap<Uuid, Uuid>>> {
    match read_optional(&dir.join(MAPPING_FILE))? {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn write_master_table(dir: &Path, masters: &HashMap<Uuid, MasterKeyRecord>) -> Result<()> {
    let sorted: BTreeMap<&Uuid, &MasterKeyRecord> = masters.iter().collect();
    let text = render_rows(sorted.into_iter().map(|(id, record)| {
        (
            id,
            MasterRow {
                key_type: record.key_type,
                flags: record.flags,
                device_keys: record.device_keys.clone(),
            },
        )
    }))?;
    write_atomic(&dir.join(MASTER_FILE), text.as_bytes())
}

pub fn read_master_table(dir: &Path) -> Result<Option<Vec<MasterKeyRecord>>> {
    let Some(text) = read_optional(&dir.join(MASTER_FILE))? else {
        return Ok(None);
    };
    let records = parse_rows::<MasterRow>(&text)?
        .into_iter()
        .flatten()
        .map(|(id, row)| MasterKeyRecord {
            id,
            key_type: row.key_type,
            flags: row.flags,
            device_keys: row.device_keys,
        })
        .collect();
    Ok(Some(records))
}

pub fn write_device_table(dir: &Path, device: usize, rows: &HashMap<Uuid, DeviceKeyRecord>) -> Result<()> {
    let sorted: BTreeMap<&Uuid, &DeviceKeyRecord> = rows.iter().collect();
    let text = render_rows(sorted.into_iter())?;
    write_atomic(&dir.join(device_table_file(device)), text.as_bytes())
}

pub fn read_device_table(dir: &Path, device: usize) -> Result<Option<HashMap<Uuid, DeviceKeyRecord>>> {
    let Some(text) = read_optional(&dir.join(device_table_file(device)))? else {
        return Ok(None);
    };
    Ok(Some(parse_rows(&text)?.into_iter().flatten().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_layout_is_one_row_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let key = Uuid::new_v4();
        let master = Uuid::new_v4();
        let rows = HashMap::from([(key, DeviceKeyRecord { master_id: master })]);
        write_device_table(dir.path(), 0, &rows).unwrap();

        let text = fs::read_to_string(dir.path().join("cache_alpha_0.db")).unwrap();
        assert!(text.starts_with("[\r\n"));
        assert!(text.contains(&format!(" {{\"{}\" : {{\"master_id\":\"{}\"}}}}", key, master)));
        assert_eq!(read_device_table(dir.path(), 0).unwrap().unwrap(), rows);
    }

    #[test]
    fn test_legacy_trailing_comma_is_accepted() {
        let key = Uuid::new_v4();
        let master = Uuid::new_v4();
        let text = format!("[\r\n {{\"{}\" : {{\"master_id\":\"{}\"}}}},\r\n]\r\n", key, master);
        let rows: Vec<HashMap<Uuid, DeviceKeyRecord>> = parse_rows(&text).unwrap();
        assert_eq!(rows[0][&key].master_id, master);
    }

    #[test]
    fn test_missing_mapping_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_mapping(dir.path()).unwrap().is_none());
    }
}
