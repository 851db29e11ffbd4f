//! `{"io": ["l-h", "n", …], "net": ["l-h", …]}` partition file schema.

use crate::error::Error;
use numadv_partition::CpuPartition;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct PartitionFile {
    #[serde(default)]
    io: Vec<String>,
    #[serde(default)]
    net: Vec<String>,
}

/// Reads and parses a `--json` partition file into a [`CpuPartition`].
pub fn load(path: &Path) -> Result<CpuPartition, Error> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::PartitionFileIo {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: PartitionFile =
        serde_json::from_str(&text).map_err(|source| Error::PartitionFileParse {
            path: path.to_path_buf(),
            source,
        })?;
    let io = parsed.io.join(",");
    let net = parsed.net.join(",");
    Ok(CpuPartition::parse(&io, &net)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_io_and_net_token_arrays() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"io": ["0-3", "8"], "net": ["4-7"]}}"#).unwrap();
        let partition = load(file.path()).unwrap();
        assert_eq!(partition.groups.len(), 3);
    }

    #[test]
    fn missing_tag_produces_an_empty_group_list() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"io": ["0-3"]}}"#).unwrap();
        let partition = load(file.path()).unwrap();
        assert_eq!(partition.groups.len(), 1);
    }

    #[test]
    fn rejects_an_invalid_token() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"io": ["not-a-range-x"]}}"#).unwrap();
        assert!(load(file.path()).is_err());
    }
}
